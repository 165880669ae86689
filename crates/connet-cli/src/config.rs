//! TOML configuration for the `connet` binary.
//!
//! Every recognized field is enumerated here; unknown keys are rejected,
//! which is also how `connet check` validates a file.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use connet_core::RouteOption;
use serde::Deserialize;
use thiserror::Error;

/// Configuration errors, split so the binary can map them to exit codes.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config: {0}")]
    Read(#[from] std::io::Error),

    /// The file parses, but contains keys this binary does not recognize
    #[error("unrecognized config keys: {0}")]
    UnknownKeys(String),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub log_level: LogLevel,
    #[serde(default)]
    pub log_format: LogFormat,
    pub server: Option<ServerConfig>,
    pub client: Option<ClientConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Tokens clients may authenticate with.
    pub tokens: Vec<String>,
    /// Name this server is reachable at; also the relay's public host.
    pub hostname: String,
    /// Default certificate for listeners that do not set their own.
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
    /// Durable state location; a platform data directory when unset.
    pub state_dir: Option<PathBuf>,
    pub control: ListenerConfig,
    pub relay: ListenerConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ListenerConfig {
    pub bind_addr: std::net::SocketAddr,
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
}

impl ServerConfig {
    /// The certificate files for a listener, falling back to the
    /// server-wide pair.
    pub fn listener_files(
        &self,
        listener: &ListenerConfig,
    ) -> Result<(PathBuf, PathBuf), ConfigError> {
        let cert = listener
            .cert_file
            .clone()
            .or_else(|| self.cert_file.clone())
            .ok_or_else(|| ConfigError::Invalid("missing cert_file".into()))?;
        let key = listener
            .key_file
            .clone()
            .or_else(|| self.key_file.clone())
            .ok_or_else(|| ConfigError::Invalid("missing key_file".into()))?;
        Ok((cert, key))
    }

    pub fn state_dir(&self) -> PathBuf {
        self.state_dir.clone().unwrap_or_else(|| {
            dirs::data_local_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("connet")
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClientConfig {
    pub token: String,
    /// Control server, `host:port`.
    pub server_addr: String,
    /// PEM file with trust anchors for the control server.
    pub server_cas: Option<PathBuf>,
    /// Local UDP bind for the shared QUIC socket.
    #[serde(default = "default_direct_addr")]
    pub direct_addr: std::net::SocketAddr,
    #[serde(default)]
    pub destinations: HashMap<String, ForwardConfig>,
    #[serde(default)]
    pub sources: HashMap<String, ForwardConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ForwardConfig {
    pub addr: String,
    #[serde(default)]
    pub route: RouteOption,
}

fn default_direct_addr() -> std::net::SocketAddr {
    "0.0.0.0:19192".parse().expect("valid address")
}

impl Config {
    /// Load and validate a config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        parse(&contents)
    }
}

/// Parse config text, distinguishing unknown keys from other failures.
pub fn parse(contents: &str) -> Result<Config, ConfigError> {
    match toml::from_str::<Config>(contents) {
        Ok(config) => Ok(config),
        Err(err) => {
            let message = err.to_string();
            if message.contains("unknown field") {
                Err(ConfigError::UnknownKeys(message.replace('\n', " ")))
            } else {
                Err(ConfigError::Invalid(message.replace('\n', " ")))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CLIENT: &str = r#"
log_level = "debug"
log_format = "json"

[client]
token = "alpha"
server_addr = "control.example.com:19190"
direct_addr = "0.0.0.0:19192"

[client.destinations.sws]
addr = "127.0.0.1:8080"
route = "any"

[client.sources.sws]
addr = ":9999"
route = "relay"
"#;

    const SERVER: &str = r#"
[server]
tokens = ["alpha", "beta"]
hostname = "control.example.com"
cert_file = "server.crt"
key_file = "server.key"

[server.control]
bind_addr = "0.0.0.0:19190"

[server.relay]
bind_addr = "0.0.0.0:19191"
"#;

    #[test]
    fn test_parse_client_config() {
        let config = parse(CLIENT).unwrap();
        assert_eq!(config.log_level, LogLevel::Debug);
        assert_eq!(config.log_format, LogFormat::Json);

        let client = config.client.unwrap();
        assert_eq!(client.token, "alpha");
        assert_eq!(client.destinations["sws"].route, RouteOption::Any);
        assert_eq!(client.sources["sws"].route, RouteOption::Relay);
    }

    #[test]
    fn test_parse_server_config() {
        let config = parse(SERVER).unwrap();
        assert_eq!(config.log_level, LogLevel::Info);

        let server = config.server.unwrap();
        assert_eq!(server.tokens.len(), 2);
        let (cert, key) = server.listener_files(&server.control).unwrap();
        assert_eq!(cert, PathBuf::from("server.crt"));
        assert_eq!(key, PathBuf::from("server.key"));
    }

    #[test]
    fn test_listener_files_prefer_listener_pair() {
        let mut config = parse(SERVER).unwrap().server.unwrap();
        config.relay.cert_file = Some("relay.crt".into());
        config.relay.key_file = Some("relay.key".into());

        let (cert, key) = config.listener_files(&config.relay).unwrap();
        assert_eq!(cert, PathBuf::from("relay.crt"));
        assert_eq!(key, PathBuf::from("relay.key"));
    }

    #[test]
    fn test_unknown_keys_are_rejected() {
        let bad = format!("{CLIENT}\nunknown_toplevel = 1\n");
        assert!(matches!(parse(&bad), Err(ConfigError::UnknownKeys(_))));

        let bad = CLIENT.replace("token = \"alpha\"", "token = \"alpha\"\nbogus = true");
        assert!(matches!(parse(&bad), Err(ConfigError::UnknownKeys(_))));
    }

    #[test]
    fn test_syntax_error_is_invalid_not_unknown() {
        assert!(matches!(parse("invalid {{{{"), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_default_route_is_any() {
        let config = parse(
            r#"
[client]
token = "t"
server_addr = "localhost:19190"

[client.destinations.web]
addr = "127.0.0.1:3000"
"#,
        )
        .unwrap();
        let client = config.client.unwrap();
        assert_eq!(client.destinations["web"].route, RouteOption::Any);
        assert_eq!(client.direct_addr, default_direct_addr());
    }

    #[test]
    fn test_bad_log_level_rejected() {
        let bad = CLIENT.replace("\"debug\"", "\"verbose\"");
        assert!(matches!(parse(&bad), Err(ConfigError::Invalid(_))));
    }
}
