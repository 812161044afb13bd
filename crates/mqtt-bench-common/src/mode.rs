//! Test modes, emqtt-bench sub-commands, and installation methods

use serde::{Deserialize, Serialize};

/// Which load test to run
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Default,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
)]
#[serde(rename_all = "lowercase")]
#[strum(ascii_case_insensitive)]
pub enum TestMode {
    /// Open connections only
    #[strum(to_string = "connect", serialize = "conn")]
    Connect,
    /// Publish a bounded number of messages
    #[default]
    #[strum(to_string = "publish", serialize = "pub")]
    Publish,
    /// Subscribe for the configured duration
    #[strum(to_string = "subscribe", serialize = "sub")]
    Subscribe,
    /// Background subscriber plus a foreground publisher
    #[strum(to_string = "full", serialize = "pubsub", serialize = "both")]
    Full,
}

impl TestMode {
    /// Sub-commands this mode invokes, in start order
    pub fn sub_commands(self) -> &'static [SubCommand] {
        match self {
            Self::Connect => &[SubCommand::Conn],
            Self::Publish => &[SubCommand::Pub],
            Self::Subscribe => &[SubCommand::Sub],
            Self::Full => &[SubCommand::Sub, SubCommand::Pub],
        }
    }
}

/// emqtt-bench operating mode, passed as its first argument
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::AsRefStr,
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum SubCommand {
    Conn,
    Pub,
    Sub,
}

/// How emqtt-bench gets onto the host
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Default,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(ascii_case_insensitive)]
pub enum InstallMethod {
    /// Download a prebuilt release archive
    #[default]
    #[strum(to_string = "binary", serialize = "release", serialize = "prebuilt")]
    Binary,
    /// Clone and build the source tree
    #[strum(to_string = "source", serialize = "build")]
    Source,
}
