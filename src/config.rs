use std::env;
use std::fmt;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tokio::time::Duration;
use url::Url;

use crate::client::{ClientConfig, DEFAULT_API_BASE};
use crate::connection_pool::PoolConfig;
use crate::errors::ConfigError;
use crate::hub::{DEFAULT_INTAKE_CAPACITY, DEFAULT_SUBSCRIBER_CAPACITY};
use crate::proxy::ProxyEndpoint;
use crate::utils::{format_duration_string, mask_secret, parse_duration_string};
use crate::worker::LoopConfig;

/// Operator configuration of the probe, as edited through the control API.
///
/// Keys follow the operator UI (`proxyURL`, `chatID`, ...). Durations are
/// written as strings like `"3s"` and accepted either as such strings or as
/// integer milliseconds.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ProbeConfig {
    #[serde(rename = "proxyURL")]
    pub proxy_url: String,

    #[serde(with = "duration_field")]
    pub timeout: Duration,

    #[serde(with = "duration_field")]
    pub interval: Duration,

    #[serde(rename = "chatID")]
    pub chat_id: String,

    pub bot_token: String,

    #[serde(rename = "messageThreadID")]
    pub message_thread_id: String,

    pub disable_keep_alive: bool,

    #[serde(rename = "apiBaseURL")]
    pub api_base_url: String,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            proxy_url: String::new(),
            timeout: Duration::from_secs(60),
            interval: Duration::from_secs(3),
            chat_id: String::new(),
            bot_token: String::new(),
            message_thread_id: String::new(),
            disable_keep_alive: false,
            api_base_url: DEFAULT_API_BASE.to_string(),
        }
    }
}

impl fmt::Debug for ProbeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let proxy = self
            .proxy()
            .ok()
            .flatten()
            .map(|p| p.redacted())
            .unwrap_or_else(|| self.proxy_url.clone());
        f.debug_struct("ProbeConfig")
            .field("proxy_url", &proxy)
            .field("timeout", &self.timeout)
            .field("interval", &self.interval)
            .field("chat_id", &self.chat_id)
            .field("bot_token", &mask_secret(&self.bot_token))
            .field("message_thread_id", &self.message_thread_id)
            .field("disable_keep_alive", &self.disable_keep_alive)
            .field("api_base_url", &self.api_base_url)
            .finish()
    }
}

impl ProbeConfig {
    /// Checks everything a run needs before it is accepted.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chat_id.trim().is_empty() {
            return Err(ConfigError::ChatIdRequired);
        }
        if self.bot_token.trim().is_empty() {
            return Err(ConfigError::BotTokenRequired);
        }
        if self.timeout.is_zero() {
            return Err(ConfigError::ZeroDuration { field: "timeout" });
        }
        if self.interval.is_zero() {
            return Err(ConfigError::ZeroDuration { field: "interval" });
        }
        self.proxy()?;
        self.validate_api_base()?;
        Ok(())
    }

    fn validate_api_base(&self) -> Result<(), ConfigError> {
        let invalid = |message: String| ConfigError::InvalidEndpoint {
            url: self.api_base_url.clone(),
            message,
        };
        let url = Url::parse(self.api_base_url.trim()).map_err(|e| invalid(e.to_string()))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(invalid("scheme must be http or https".to_string()));
        }
        if url.host_str().is_none() {
            return Err(invalid("missing host".to_string()));
        }
        Ok(())
    }

    /// The configured proxy, if any.
    pub fn proxy(&self) -> Result<Option<ProxyEndpoint>, ConfigError> {
        let raw = self.proxy_url.trim();
        if raw.is_empty() {
            return Ok(None);
        }
        ProxyEndpoint::parse(raw).map(Some)
    }

    pub fn thread_id(&self) -> Option<String> {
        let id = self.message_thread_id.trim();
        (!id.is_empty()).then(|| id.to_string())
    }

    /// Transport settings for building a client.
    pub fn client_config(&self) -> Result<ClientConfig, ConfigError> {
        Ok(ClientConfig {
            api_base: self.api_base_url.trim().to_string(),
            proxy: self.proxy()?,
            pool: PoolConfig::default().with_keep_alive(!self.disable_keep_alive),
            call_timeout: self.timeout,
            ..ClientConfig::default()
        })
    }

    /// Settings for one run of the send loop.
    pub fn loop_config(&self) -> LoopConfig {
        LoopConfig {
            call_timeout: self.timeout,
            interval: self.interval,
            chat_id: self.chat_id.trim().to_string(),
            bot_token: self.bot_token.trim().to_string(),
            message_thread_id: self.thread_id(),
            proxy: self.proxy().ok().flatten().map(|p| p.redacted()),
        }
    }

    /// Loads a configuration from a YAML file. The result is not validated;
    /// an incomplete file is a valid starting point for the control API.
    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .map_err(|e| ConfigError::FileRead(format!("{}: {}", path.display(), e)))?;
        Self::from_yaml_str(&content)
    }

    pub fn from_yaml_str(content: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }
}

/// Serde adapter for durations: strings like `"1500ms"` or `"3s"`, or
/// integer milliseconds.
mod duration_field {
    use super::*;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawDuration {
        Millis(u64),
        Text(String),
    }

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format_duration_string(*value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        match RawDuration::deserialize(deserializer)? {
            RawDuration::Millis(ms) => Ok(Duration::from_millis(ms)),
            RawDuration::Text(text) => parse_duration_string(&text).map_err(|e| {
                serde::de::Error::custom(format!("invalid duration '{}': {}", text, e))
            }),
        }
    }
}

/// Output format of process logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

/// Process settings read from the environment at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub log_format: LogFormat,
    pub probe_config_file: Option<PathBuf>,
    pub log_intake_capacity: usize,
    pub log_subscriber_capacity: usize,
    pub sse_heartbeat: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            log_format: LogFormat::Text,
            probe_config_file: None,
            log_intake_capacity: DEFAULT_INTAKE_CAPACITY,
            log_subscriber_capacity: DEFAULT_SUBSCRIBER_CAPACITY,
            sse_heartbeat: Duration::from_secs(30),
        }
    }
}

impl ServerConfig {
    /// Loads settings from environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let listen_addr = match env_value("LISTEN_ADDR") {
            Some(raw) => raw.parse().map_err(|e: std::net::AddrParseError| {
                invalid_env("LISTEN_ADDR", e.to_string())
            })?,
            None => defaults.listen_addr,
        };

        let log_format = match env_value("LOG_FORMAT").map(|v| v.to_lowercase()) {
            None => LogFormat::Text,
            Some(v) if v == "text" => LogFormat::Text,
            Some(v) if v == "json" => LogFormat::Json,
            Some(other) => {
                return Err(invalid_env(
                    "LOG_FORMAT",
                    format!("'{}' (expected text or json)", other),
                ))
            }
        };

        let probe_config_file = env_value("PROBE_CONFIG_FILE").map(PathBuf::from);

        let log_intake_capacity =
            env_capacity("LOG_INTAKE_CAPACITY", defaults.log_intake_capacity)?;
        let log_subscriber_capacity =
            env_capacity("LOG_SUBSCRIBER_CAPACITY", defaults.log_subscriber_capacity)?;

        let sse_heartbeat = match env_value("SSE_HEARTBEAT") {
            Some(raw) => {
                let d = parse_duration_string(&raw).map_err(|e| ConfigError::InvalidDuration {
                    field: "SSE_HEARTBEAT".to_string(),
                    message: e,
                })?;
                if d.is_zero() {
                    return Err(ConfigError::ZeroDuration {
                        field: "SSE_HEARTBEAT",
                    });
                }
                d
            }
            None => defaults.sse_heartbeat,
        };

        Ok(Self {
            listen_addr,
            log_format,
            probe_config_file,
            log_intake_capacity,
            log_subscriber_capacity,
            sse_heartbeat,
        })
    }
}

fn env_value(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_capacity(name: &str, default: usize) -> Result<usize, ConfigError> {
    match env_value(name) {
        None => Ok(default),
        Some(raw) => match raw.parse::<usize>() {
            Ok(0) => Err(invalid_env(name, "must be greater than zero".to_string())),
            Ok(n) => Ok(n),
            Err(e) => Err(invalid_env(name, format!("'{}': {}", raw, e))),
        },
    }
}

fn invalid_env(var: &str, message: String) -> ConfigError {
    ConfigError::InvalidEnv {
        var: var.to_string(),
        message,
    }
}
