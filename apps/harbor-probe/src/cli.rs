use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use harbor_spawn::{DEFAULT_API_URL, ENV_ACCOUNT, ENV_API_URL, ENV_TOKEN, SpawnConfig, SpawnRequest};
use serde_json::Value;

use crate::logging::{LogLevel, LogSetup};

#[derive(Parser, Debug)]
#[command(
    name = "harbor-probe",
    about = "Spawn session backends, wait for readiness, and exchange realtime messages",
    version
)]
pub struct Cli {
    #[command(flatten)]
    pub logging: LoggingArgs,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Args, Debug, Clone)]
pub struct LoggingArgs {
    #[arg(
        long = "log-level",
        global = true,
        value_enum,
        env = "HARBOR_LOG_LEVEL",
        default_value_t = LogLevel::Warn,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    pub level: LogLevel,

    #[arg(
        long = "log-file",
        global = true,
        value_name = "PATH",
        env = "HARBOR_LOG_FILE",
        help = "Write logs to the specified file instead of stderr"
    )]
    pub file: Option<PathBuf>,
}

impl LoggingArgs {
    pub fn to_setup(&self) -> LogSetup {
        LogSetup::new(self.level, self.file.clone())
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Ask the control plane for a backend and print the spawn result as JSON
    Spawn(SpawnArgs),
    /// Follow a status url until the backend is ready or fails
    Wait(WaitArgs),
    /// Connect to an already spawned backend
    Connect(ConnectArgs),
    /// Spawn a backend, then connect to it
    Run(RunArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ControlPlaneArgs {
    #[arg(long, env = ENV_API_URL, default_value = DEFAULT_API_URL, help = "Control plane base URL")]
    pub api_url: String,

    #[arg(long, env = ENV_ACCOUNT, help = "Account that owns the service")]
    pub account: String,

    #[arg(long, env = ENV_TOKEN, hide_env_values = true, help = "Control plane API token")]
    pub token: String,
}

impl ControlPlaneArgs {
    pub fn to_config(&self) -> Result<SpawnConfig, harbor_spawn::SpawnError> {
        SpawnConfig::new(&self.api_url, &self.account, &self.token)
    }
}

#[derive(Args, Debug, Clone)]
pub struct SpawnArgs {
    #[command(flatten)]
    pub control_plane: ControlPlaneArgs,

    /// Service to spawn a backend for
    pub service: String,

    #[arg(long, help = "Reuse the backend holding this lock, or spawn one that takes it")]
    pub lock: Option<String>,

    #[arg(long, help = "Image tag to spawn")]
    pub tag: Option<String>,

    #[arg(
        long = "env",
        value_name = "KEY=VALUE",
        value_parser = parse_env_pair,
        help = "Environment variable for the backend; may be repeated"
    )]
    pub env: Vec<(String, String)>,

    #[arg(long = "grace-period", value_name = "SECS")]
    pub grace_period: Option<u32>,

    #[arg(long = "require-bearer-token")]
    pub require_bearer_token: bool,
}

impl SpawnArgs {
    pub fn to_request(&self) -> SpawnRequest {
        let mut request = SpawnRequest::default();
        if let Some(lock) = &self.lock {
            request = request.with_lock(lock);
        }
        if let Some(tag) = &self.tag {
            request = request.with_tag(tag);
        }
        for (key, value) in &self.env {
            request = request.with_env(key, value);
        }
        if let Some(seconds) = self.grace_period {
            request = request.with_grace_period(seconds);
        }
        if self.require_bearer_token {
            request = request.require_bearer_token(true);
        }
        request
    }
}

#[derive(Args, Debug, Clone)]
pub struct WaitArgs {
    /// Status url returned by a spawn
    pub status_url: String,

    #[arg(long, value_name = "SECS", help = "Give up if not ready within this many seconds")]
    pub timeout: Option<u64>,
}

#[derive(Args, Debug, Clone)]
pub struct MessagingArgs {
    #[arg(long, value_name = "EVENT", help = "Print every message on EVENT; may be repeated")]
    pub listen: Vec<String>,

    #[arg(
        long,
        value_name = "EVENT=JSON",
        value_parser = parse_send,
        help = "Send JSON on EVENT once connected; may be repeated"
    )]
    pub send: Vec<(String, Value)>,

    #[arg(
        long,
        value_name = "SECS",
        help = "Stay connected this long after ready (default: until ctrl-c)"
    )]
    pub linger: Option<u64>,

    #[arg(long = "ready-timeout", value_name = "SECS")]
    pub ready_timeout: Option<u64>,
}

#[derive(Args, Debug, Clone)]
pub struct ConnectArgs {
    /// Backend url returned by a spawn
    pub url: String,

    /// Status url returned by a spawn
    pub status_url: String,

    #[arg(long = "bearer-token", env = "HARBOR_BEARER_TOKEN", hide_env_values = true)]
    pub bearer_token: Option<String>,

    #[command(flatten)]
    pub messaging: MessagingArgs,
}

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    #[command(flatten)]
    pub spawn: SpawnArgs,

    #[command(flatten)]
    pub messaging: MessagingArgs,
}

pub fn parse_env_pair(raw: &str) -> Result<(String, String), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{raw}'"))?;
    if key.trim().is_empty() {
        return Err(format!("empty key in '{raw}'"));
    }
    Ok((key.trim().to_string(), value.to_string()))
}

/// `EVENT=JSON`; a value that is not valid JSON is sent as a string.
pub fn parse_send(raw: &str) -> Result<(String, Value), String> {
    let (event, payload) = parse_env_pair(raw)?;
    let payload = serde_json::from_str(&payload).unwrap_or(Value::String(payload));
    Ok((event, payload))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(args).expect("valid arguments")
    }

    #[test]
    fn env_pairs_split_on_first_equals() {
        assert_eq!(
            parse_env_pair("DSN=postgres://a=b").unwrap(),
            ("DSN".to_string(), "postgres://a=b".to_string())
        );
        assert!(parse_env_pair("missing").is_err());
        assert!(parse_env_pair("=value").is_err());
    }

    #[test]
    fn send_payload_falls_back_to_string() {
        assert_eq!(
            parse_send("move={\"x\":1}").unwrap(),
            ("move".to_string(), json!({"x": 1}))
        );
        assert_eq!(
            parse_send("chat=hello there").unwrap(),
            ("chat".to_string(), json!("hello there"))
        );
    }

    #[test]
    fn spawn_flags_build_request() {
        let cli = parse(&[
            "harbor-probe",
            "spawn",
            "--account",
            "acme",
            "--token",
            "tok",
            "chat",
            "--lock",
            "room-1",
            "--env",
            "MODE=demo",
            "--grace-period",
            "15",
            "--require-bearer-token",
        ]);
        let Command::Spawn(args) = cli.command else {
            panic!("expected spawn");
        };
        assert_eq!(args.service, "chat");
        assert_eq!(args.control_plane.api_url, DEFAULT_API_URL);
        let request = args.to_request();
        assert_eq!(
            request,
            SpawnRequest::default()
                .with_lock("room-1")
                .with_env("MODE", "demo")
                .with_grace_period(15)
                .require_bearer_token(true)
        );
    }

    #[test]
    fn connect_collects_messaging_flags() {
        let cli = parse(&[
            "harbor-probe",
            "--log-level",
            "debug",
            "connect",
            "https://b.test/abc",
            "https://api.test/backend/abc/status",
            "--listen",
            "state",
            "--listen",
            "chat",
            "--send",
            "join={\"room\":1}",
            "--linger",
            "5",
        ]);
        assert_eq!(cli.logging.level, LogLevel::Debug);
        let Command::Connect(args) = cli.command else {
            panic!("expected connect");
        };
        assert_eq!(args.messaging.listen, vec!["state", "chat"]);
        assert_eq!(
            args.messaging.send,
            vec![("join".to_string(), json!({"room": 1}))]
        );
        assert_eq!(args.messaging.linger, Some(5));
    }

    #[test]
    fn wait_takes_optional_timeout() {
        let cli = parse(&["harbor-probe", "wait", "https://api.test/s", "--timeout", "30"]);
        let Command::Wait(args) = cli.command else {
            panic!("expected wait");
        };
        assert_eq!(args.timeout, Some(30));
    }
}
