//! Recognized configuration option names
//!
//! Option names are kebab-case in instance metadata; the matching environment
//! variable is the uppercased name with hyphens turned into underscores.

/// Every option the resolver knows how to look up
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::IntoStaticStr,
)]
#[strum(serialize_all = "kebab-case")]
pub enum OptionKey {
    BrokerHost,
    BrokerPort,
    ClientCount,
    ConnectInterval,
    Qos,
    Topic,
    PayloadSize,
    MessageInterval,
    Duration,
    Username,
    Password,
    UseSsl,
    SslCertfile,
    SslKeyfile,
    UseWebsocket,
    TestMode,
    InstallMethod,
    BenchVersion,
    InstallDir,
    SourceRepo,
    DownloadMirror,
    LogDir,
    LogRetention,
    KillStalePackageManager,
}

impl OptionKey {
    /// Metadata attribute name, e.g. `broker-host`
    pub fn name(self) -> &'static str {
        self.into()
    }

    /// Environment variable name, e.g. `BROKER_HOST`
    pub fn env_var(self) -> String {
        env_var_name(self.name())
    }

    /// Whether the value must not be echoed verbatim
    pub fn is_secret(self) -> bool {
        matches!(self, Self::Password)
    }
}

/// Map an option name to its environment variable name
pub fn env_var_name(key: &str) -> String {
    key.to_ascii_uppercase().replace('-', "_")
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn test_names_are_kebab_case() {
        assert_eq!(OptionKey::BrokerHost.name(), "broker-host");
        assert_eq!(OptionKey::Qos.name(), "qos");
        assert_eq!(
            OptionKey::KillStalePackageManager.name(),
            "kill-stale-package-manager"
        );
    }

    #[test]
    fn test_env_var_mapping() {
        assert_eq!(OptionKey::BrokerHost.env_var(), "BROKER_HOST");
        assert_eq!(OptionKey::UseSsl.env_var(), "USE_SSL");
        assert_eq!(env_var_name("ssl-certfile"), "SSL_CERTFILE");
    }

    #[test]
    fn test_parse_roundtrip() {
        for key in OptionKey::iter() {
            let parsed: OptionKey = key.name().parse().unwrap();
            assert_eq!(parsed, key);
        }
    }

    #[test]
    fn test_only_password_is_secret() {
        let secrets: Vec<_> = OptionKey::iter().filter(|k| k.is_secret()).collect();
        assert_eq!(secrets, vec![OptionKey::Password]);
    }
}
