//! Controller configuration and broker credentials.
//!
//! This module introduces the types that parameterize a
//! [`Controller`](crate::controller::Controller).
//!
//! # Features:
//! - [`ControllerOptions`]: The main configuration structure. It's adorned with
//!   [`clap`] attributes so that binaries can flatten it into their CLI.
//! - [`Credentials`]: Connection credentials resolved from a named profile in
//!   the JSON configuration file.
//! - [`ConfigError`]: Configuration failures, each mapped to a process exit
//!   code.
//!
//! # Configuration file
//!
//! ```json
//! {
//!     "version": "0.1",
//!     "profiles": {
//!         "test": {
//!             "username": "guest",
//!             "password": "guest",
//!             "amqp_url": "127.0.0.1",
//!             "port": 5672,
//!             "use_tls": false,
//!             "ca_certificate": null
//!         }
//!     }
//! }
//! ```
use std::{
    collections::HashMap,
    fmt, fs,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use anyhow::Context;
use clap::{Args, ValueEnum};
use lapin::{
    tcp::OwnedTLSConfig,
    uri::{AMQPAuthority, AMQPScheme, AMQPUri, AMQPUserInfo},
};
use serde::Deserialize;
use thiserror::Error;
use tracing::Level;

use crate::error::CourierError;

/// Environment variable consulted when no configuration path is given.
pub const CONFIG_PATH_ENV: &str = "COURIER_CFG";
/// The only configuration format version this crate understands.
pub const CONFIG_VERSION: &str = "0.1";

const DEFAULT_ROUTING_KEY: &str = "arbitrary_string";
const HELP_HEADING: &str = "Courier options";

/// Exit code for a configuration file that names no such profile.
pub const EXIT_PROFILE_NOT_FOUND: i32 = 2;
/// Exit code for every other configuration failure.
pub const EXIT_INVALID_CONFIG: i32 = 11;

/// Configuration failures. These are fatal at controller construction.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("no configuration path was provided and COURIER_CFG is not set")]
    MissingPath,

    #[error("configuration JSON at {path} does not appear to be valid or does not exist: {reason}")]
    Unreadable { path: PathBuf, reason: String },

    #[error("configuration JSON does not appear to contain the specified profile `{0}`")]
    ProfileNotFound(String),

    #[error("configuration JSON does not appear to contain the necessary fields for profile `{profile}`: {reason}")]
    IncompleteProfile { profile: String, reason: String },
}

impl ConfigError {
    /// The process exit code associated with this failure class.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::ProfileNotFound(_) => EXIT_PROFILE_NOT_FOUND,
            _ => EXIT_INVALID_CONFIG,
        }
    }
}

/// The routing semantics of an exchange.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ExchangeKind {
    #[default]
    Fanout,
    Topic,
    Direct,
    Headers,
}

impl ExchangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fanout => "fanout",
            Self::Topic => "topic",
            Self::Direct => "direct",
            Self::Headers => "headers",
        }
    }
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExchangeKind {
    type Err = CourierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fanout" => Ok(Self::Fanout),
            "topic" => Ok(Self::Topic),
            "direct" => Ok(Self::Direct),
            "headers" => Ok(Self::Headers),
            _ => Err(CourierError::InvalidExchangeType(s.to_string())),
        }
    }
}

/// What a worker does after losing its connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReconnectPolicy {
    /// Sleep for the given interval, then reconnect. Retries indefinitely.
    After(Duration),
    /// Terminate the worker on the first connection failure.
    Disabled,
}

impl ReconnectPolicy {
    /// A negative wait disables reconnection.
    pub fn from_millis(wait_ms: i64) -> Self {
        match u64::try_from(wait_ms) {
            Ok(ms) => Self::After(Duration::from_millis(ms)),
            Err(_) => Self::Disabled,
        }
    }

    pub fn delay(&self) -> Option<Duration> {
        match self {
            Self::After(delay) => Some(*delay),
            Self::Disabled => None,
        }
    }
}

/// Enumerates the available payload serialization formats.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, ValueEnum, Default)]
pub enum Serializer {
    #[default]
    Json,
    Cbor,
    Postcard,
}

/// Represents the main configuration structure for a
/// [`Controller`](crate::controller::Controller).
#[derive(Args, Clone, PartialEq, Eq, Debug)]
pub struct ControllerOptions {
    /// Profile name inside the configuration file to use when connecting.
    #[arg(long, help_heading = HELP_HEADING)]
    pub profile: String,

    /// Path of the log file shared by every worker of this controller.
    #[arg(long, help_heading = HELP_HEADING)]
    pub log_file: PathBuf,

    /// Log level for worker log files.
    #[arg(long, help_heading = HELP_HEADING, default_value_t = Level::DEBUG)]
    pub log_level: Level,

    /// Path to the JSON configuration file.
    #[arg(long, help_heading = HELP_HEADING, env = CONFIG_PATH_ENV)]
    pub config_path: Option<PathBuf>,

    /// Routing key used for publishing and for binding queues. In most cases,
    /// the default value should suffice.
    #[arg(long, help_heading = HELP_HEADING, default_value = DEFAULT_ROUTING_KEY)]
    pub routing_key: String,

    /// Acknowledge messages as soon as `receive` dequeues them.
    #[arg(long, help_heading = HELP_HEADING, default_value_t = true, action = clap::ArgAction::Set)]
    pub auto_ack: bool,

    /// Serialization format for outbound payloads.
    #[arg(long, help_heading = HELP_HEADING, value_enum, default_value_t = Serializer::Json)]
    pub serializer: Serializer,

    /// Maximum number of unacknowledged deliveries held by each consumer.
    #[arg(long, help_heading = HELP_HEADING, default_value_t = 5)]
    pub prefetch_count: u16,

    /// Milliseconds to wait before reconnecting. Negative disables reconnection.
    #[arg(long, help_heading = HELP_HEADING, default_value_t = 10_000, allow_negative_numbers = true)]
    pub reconnect_wait_ms: i64,

    /// Publish attempts per message before the failure is reported.
    #[arg(long, help_heading = HELP_HEADING, default_value_t = 1)]
    pub publish_attempts: u32,

    /// Interval at which producers pump pending network events.
    #[arg(long, help_heading = HELP_HEADING, default_value_t = 1_000)]
    pub poll_interval_ms: u64,

    /// Per-dequeue wait used by `receive_batch` to decide the queue is drained.
    #[arg(long, help_heading = HELP_HEADING, default_value_t = 1_000)]
    pub batch_timeout_ms: u64,

    /// How long an acknowledgement may wait for the owning worker.
    #[arg(long, help_heading = HELP_HEADING, default_value_t = 30_000)]
    pub ack_timeout_ms: u64,

    /// How long the first `receive` on an exchange waits for its consumer to
    /// connect.
    #[arg(long, help_heading = HELP_HEADING, default_value_t = 5_000)]
    pub startup_timeout_ms: u64,

    /// How long `close` waits for each worker thread to wind down.
    #[arg(long, help_heading = HELP_HEADING, default_value_t = 10_000)]
    pub shutdown_timeout_ms: u64,
}

impl ControllerOptions {
    /// Options for the given profile and log file, everything else defaulted.
    pub fn new(profile: impl Into<String>, log_file: impl Into<PathBuf>) -> Self {
        Self {
            profile: profile.into(),
            log_file: log_file.into(),
            log_level: Level::DEBUG,
            config_path: None,
            routing_key: DEFAULT_ROUTING_KEY.to_string(),
            auto_ack: true,
            serializer: Serializer::default(),
            prefetch_count: 5,
            reconnect_wait_ms: 10_000,
            publish_attempts: 1,
            poll_interval_ms: 1_000,
            batch_timeout_ms: 1_000,
            ack_timeout_ms: 30_000,
            startup_timeout_ms: 5_000,
            shutdown_timeout_ms: 10_000,
        }
    }

    /// The explicit configuration path, falling back to [`CONFIG_PATH_ENV`].
    pub fn resolve_config_path(&self) -> Result<PathBuf, ConfigError> {
        self.config_path
            .clone()
            .or_else(|| std::env::var_os(CONFIG_PATH_ENV).map(PathBuf::from))
            .ok_or(ConfigError::MissingPath)
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy::from_millis(self.reconnect_wait_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn batch_timeout(&self) -> Duration {
        Duration::from_millis(self.batch_timeout_ms)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

#[derive(Deserialize)]
struct ConfigFile {
    version: Option<String>,
    #[serde(default)]
    profiles: HashMap<String, serde_json::Value>,
}

#[derive(Deserialize)]
struct ProfileRecord {
    username: String,
    password: String,
    amqp_url: String,
    port: u16,
    #[serde(default)]
    use_tls: bool,
    #[serde(default)]
    ca_certificate: Option<PathBuf>,
}

/// Connection credentials for a single broker profile.
///
/// Immutable once resolved. The controller owns them and shares them, read
/// only, with every worker it creates.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub profile: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub use_tls: bool,
    pub ca_certificate: Option<PathBuf>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("profile", &self.profile)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("use_tls", &self.use_tls)
            .field("ca_certificate", &self.ca_certificate)
            .finish()
    }
}

impl Credentials {
    /// Resolve `profile` from the JSON configuration file at `path`.
    ///
    /// A `version` other than [`CONFIG_VERSION`] only produces a warning on
    /// stderr.
    pub fn from_file(path: &Path, profile: &str) -> Result<Self, ConfigError> {
        let unreadable = |reason: String| ConfigError::Unreadable {
            path: path.to_path_buf(),
            reason,
        };
        let contents = fs::read_to_string(path).map_err(|e| unreadable(e.to_string()))?;
        let config: ConfigFile =
            serde_json::from_str(&contents).map_err(|e| unreadable(e.to_string()))?;

        if let Some(version) = config.version.as_deref() {
            if version != CONFIG_VERSION {
                eprintln!(
                    "Version number in the configuration file ({version}) does not appear to be \
                     current, ensure configuration format is correct if you experience errors"
                );
            }
        }

        let record = config
            .profiles
            .get(profile)
            .ok_or_else(|| ConfigError::ProfileNotFound(profile.to_string()))?;
        let record: ProfileRecord =
            serde_json::from_value(record.clone()).map_err(|e| {
                ConfigError::IncompleteProfile {
                    profile: profile.to_string(),
                    reason: e.to_string(),
                }
            })?;

        Ok(Self {
            profile: profile.to_string(),
            host: record.amqp_url.trim().to_string(),
            port: record.port,
            username: record.username,
            password: record.password,
            use_tls: record.use_tls,
            ca_certificate: record.ca_certificate,
        })
    }

    /// The structured AMQP URI for these credentials, on the default vhost.
    pub fn amqp_uri(&self) -> AMQPUri {
        AMQPUri {
            scheme: if self.use_tls {
                AMQPScheme::AMQPS
            } else {
                AMQPScheme::AMQP
            },
            authority: AMQPAuthority {
                userinfo: AMQPUserInfo {
                    username: self.username.clone(),
                    password: self.password.clone(),
                },
                host: self.host.clone(),
                port: self.port,
            },
            vhost: "/".to_string(),
            query: Default::default(),
        }
    }

    /// TLS settings, trusting the configured CA certificate when present.
    pub fn tls_config(&self) -> anyhow::Result<OwnedTLSConfig> {
        let cert_chain = match (&self.ca_certificate, self.use_tls) {
            (Some(path), true) => Some(
                fs::read_to_string(path)
                    .with_context(|| format!("reading CA certificate {}", path.display()))?,
            ),
            _ => None,
        };

        Ok(OwnedTLSConfig {
            identity: None,
            cert_chain,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::NamedTempFile;

    use super::*;

    fn config_file(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn resolves_a_complete_profile() {
        let file = config_file(
            r#"{
                "version": "0.1",
                "profiles": {
                    "test": {
                        "username": "guest",
                        "password": "guest",
                        "amqp_url": "127.0.0.1",
                        "port": 5672
                    }
                }
            }"#,
        );

        let credentials = Credentials::from_file(file.path(), "test").unwrap();
        assert_eq!(credentials.host, "127.0.0.1");
        assert_eq!(credentials.port, 5672);
        assert_eq!(credentials.username, "guest");
        assert!(!credentials.use_tls);
        assert_eq!(credentials.ca_certificate, None);

        let uri = credentials.amqp_uri();
        assert!(matches!(uri.scheme, AMQPScheme::AMQP));
        assert_eq!(uri.authority.port, 5672);
        assert_eq!(uri.vhost, "/");
    }

    #[test]
    fn tls_profiles_use_the_amqps_scheme() {
        let file = config_file(
            r#"{
                "version": "0.1",
                "profiles": {
                    "secure": {
                        "username": "u",
                        "password": "p",
                        "amqp_url": "broker.internal",
                        "port": 5671,
                        "use_tls": true,
                        "ca_certificate": null
                    }
                }
            }"#,
        );

        let credentials = Credentials::from_file(file.path(), "secure").unwrap();
        assert!(credentials.use_tls);
        assert!(matches!(credentials.amqp_uri().scheme, AMQPScheme::AMQPS));
        assert!(credentials.tls_config().unwrap().cert_chain.is_none());
    }

    #[test]
    fn invalid_json_exits_with_11() {
        let file = config_file("asdf9υ021ζ3;-ö×=()[]{}∇Δοo");
        let err = Credentials::from_file(file.path(), "test").unwrap_err();
        assert!(matches!(err, ConfigError::Unreadable { .. }));
        assert_eq!(err.exit_code(), EXIT_INVALID_CONFIG);
    }

    #[test]
    fn missing_file_exits_with_11() {
        let dir = tempfile::tempdir().unwrap();
        let err = Credentials::from_file(&dir.path().join("absent.json"), "test").unwrap_err();
        assert_eq!(err.exit_code(), 11);
    }

    #[test]
    fn missing_profile_exits_with_2_despite_bad_version() {
        let file = config_file(r#"{"version": "0.2", "profiles": {"asdfadsf": {}}}"#);
        let err = Credentials::from_file(file.path(), "test").unwrap_err();
        assert!(matches!(err, ConfigError::ProfileNotFound(ref p) if p == "test"));
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn incomplete_profile_exits_with_11() {
        let file = config_file(
            r#"{"version": "0.1", "profiles": {"test": {"username": "username", "extra": "unnecessary"}}}"#,
        );
        let err = Credentials::from_file(file.path(), "test").unwrap_err();
        assert!(matches!(err, ConfigError::IncompleteProfile { .. }));
        assert_eq!(err.exit_code(), 11);
    }

    #[test]
    fn explicit_config_path_wins_over_the_environment() {
        let mut options = ControllerOptions::new("test", "/tmp/courier.log");
        options.config_path = Some(PathBuf::from("/etc/courier.json"));
        assert_eq!(
            options.resolve_config_path().unwrap(),
            PathBuf::from("/etc/courier.json")
        );
    }

    #[test]
    fn negative_reconnect_wait_disables_reconnection() {
        assert_eq!(ReconnectPolicy::from_millis(-1), ReconnectPolicy::Disabled);
        assert_eq!(
            ReconnectPolicy::from_millis(250).delay(),
            Some(Duration::from_millis(250))
        );
    }

    #[test]
    fn exchange_kinds_parse_case_insensitively() {
        assert_eq!("Topic".parse::<ExchangeKind>().unwrap(), ExchangeKind::Topic);
        assert_eq!(ExchangeKind::default(), ExchangeKind::Fanout);
        assert!(matches!(
            "round-robin".parse::<ExchangeKind>(),
            Err(CourierError::InvalidExchangeType(_))
        ));
    }

    #[test]
    fn options_parse_from_the_command_line() {
        use clap::Parser;

        #[derive(Parser)]
        struct Cli {
            #[command(flatten)]
            options: ControllerOptions,
        }

        let cli = Cli::parse_from([
            "courier",
            "--profile",
            "test",
            "--log-file",
            "/tmp/c.log",
            "--config-path",
            "/tmp/c.json",
            "--auto-ack",
            "false",
            "--reconnect-wait-ms",
            "-1",
        ]);
        assert_eq!(cli.options.profile, "test");
        assert!(!cli.options.auto_ack);
        assert_eq!(cli.options.reconnect_policy(), ReconnectPolicy::Disabled);
        assert_eq!(cli.options.prefetch_count, 5);
        assert_eq!(cli.options.log_level, Level::DEBUG);
    }
}
