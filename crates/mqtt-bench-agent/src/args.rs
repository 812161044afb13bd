//! emqtt-bench argument lists
//!
//! Pure functions of the configuration: no I/O, same input, same output.

use mqtt_bench_common::{BenchConfig, SubCommand, TestMode};

/// Placeholder shown instead of the password in logged command lines
pub const REDACTED: &str = "******";

/// Full argument list for one emqtt-bench invocation.
///
/// Order: sub-command, connection, auth, TLS, transport, then the
/// sub-command specific flags.
pub fn build_args(config: &BenchConfig, command: SubCommand) -> Vec<String> {
    let mut args = vec![
        command.to_string(),
        "-h".to_string(),
        config.broker_host.clone(),
        "-p".to_string(),
        config.broker_port.to_string(),
        "-c".to_string(),
        config.client_count.to_string(),
    ];

    if config.has_credentials() {
        args.extend([
            "-u".to_string(),
            config.username.clone(),
            "-P".to_string(),
            config.password.clone(),
        ]);
    }

    if config.use_ssl {
        args.push("--ssl".to_string());
        if !config.ssl_certfile.is_empty() {
            args.extend(["--certfile".to_string(), config.ssl_certfile.clone()]);
        }
        if !config.ssl_keyfile.is_empty() {
            args.extend(["--keyfile".to_string(), config.ssl_keyfile.clone()]);
        }
    }

    if config.use_websocket {
        args.push("--ws".to_string());
    }

    match command {
        SubCommand::Conn => {
            args.extend(["-i".to_string(), config.connect_interval_ms.to_string()]);
        }
        SubCommand::Pub => {
            args.extend([
                "-t".to_string(),
                config.topic.clone(),
                "-I".to_string(),
                config.message_interval_ms.to_string(),
                "-s".to_string(),
                config.payload_size.to_string(),
                "-q".to_string(),
                config.qos.to_string(),
                "-L".to_string(),
                config.publish_message_count().to_string(),
            ]);
        }
        SubCommand::Sub => {
            args.extend([
                "-t".to_string(),
                config.topic.clone(),
                "-i".to_string(),
                config.connect_interval_ms.to_string(),
                "-q".to_string(),
                config.qos.to_string(),
            ]);
        }
    }

    args
}

/// Copy of `args` with the `-P` value masked
pub fn redact(args: &[String]) -> Vec<String> {
    let mut out = args.to_vec();
    for i in 1..out.len() {
        if args[i - 1] == "-P" {
            out[i] = REDACTED.to_string();
        }
    }
    out
}

/// Argument lists for every process a test mode starts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandPlan {
    pub mode: TestMode,
    pub invocations: Vec<(SubCommand, Vec<String>)>,
}

impl CommandPlan {
    pub fn for_mode(config: &BenchConfig, mode: TestMode) -> Self {
        Self {
            mode,
            invocations: mode
                .sub_commands()
                .iter()
                .map(|&command| (command, build_args(config, command)))
                .collect(),
        }
    }

    /// Arguments for one sub-command of the plan
    pub fn args_for(&self, command: SubCommand) -> Option<&[String]> {
        self.invocations
            .iter()
            .find(|(c, _)| *c == command)
            .map(|(_, args)| args.as_slice())
    }
}
