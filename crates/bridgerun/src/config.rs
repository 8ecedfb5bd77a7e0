//! Runtime configuration and per-call options.

use std::time::Duration;

use bridgepack::SessionId;
use bridgepack::Wire;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Map;

/// Errors raised while reading configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value '{value}' for {key}: {reason}")]
    Invalid { key: &'static str, value: String, reason: String },
    #[error("protocol_version {protocol_version} is below min_supported_version {min_supported_version}")]
    VersionWindow { protocol_version: u32, min_supported_version: u32 },
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Settings shared by every call made through one dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Idle lifetime of a remote object in seconds. `0` disables TTL eviction.
    pub ref_ttl_seconds: u64,
    /// Capacity of the remote object registry before LRU eviction kicks in.
    pub ref_max_size: usize,
    pub protocol_version: u32,
    pub min_supported_version: u32,
    /// Helper calls are refused unless this is set.
    pub allow_helpers: bool,
    #[serde(rename = "call_timeout_ms", with = "millis")]
    pub call_timeout: Duration,
    /// Extra attempts for idempotent calls after a transient failure.
    pub max_retries: u32,
    #[serde(rename = "retry_backoff_ms", with = "millis")]
    pub retry_backoff: Duration,
    /// Ask the remote side for its version window before the first call.
    pub negotiate_protocol: bool,
    pub tool_name: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            ref_ttl_seconds: 0,
            ref_max_size: 10_000,
            protocol_version: bridgerpc::PROTOCOL_VERSION,
            min_supported_version: bridgerpc::MIN_SUPPORTED_VERSION,
            allow_helpers: false,
            call_timeout: Duration::from_secs(30),
            max_retries: 2,
            retry_backoff: Duration::from_millis(50),
            negotiate_protocol: true,
            tool_name: bridgerpc::tool::CALL.to_string(),
        }
    }
}

impl BridgeConfig {
    /// Defaults overridden by `BRIDGE_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each `BRIDGE_*` key.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        if let Some(v) = lookup("BRIDGE_REF_TTL_SECONDS") {
            config.ref_ttl_seconds = parse("BRIDGE_REF_TTL_SECONDS", &v)?;
        }
        if let Some(v) = lookup("BRIDGE_REF_MAX_SIZE") {
            config.ref_max_size = parse("BRIDGE_REF_MAX_SIZE", &v)?;
        }
        if let Some(v) = lookup("BRIDGE_ALLOW_HELPERS") {
            config.allow_helpers = parse_flag("BRIDGE_ALLOW_HELPERS", &v)?;
        }
        if let Some(v) = lookup("BRIDGE_CALL_TIMEOUT_MS") {
            config.call_timeout = Duration::from_millis(parse("BRIDGE_CALL_TIMEOUT_MS", &v)?);
        }
        if let Some(v) = lookup("BRIDGE_MAX_RETRIES") {
            config.max_retries = parse("BRIDGE_MAX_RETRIES", &v)?;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.protocol_version < self.min_supported_version {
            return Err(ConfigError::VersionWindow {
                protocol_version: self.protocol_version,
                min_supported_version: self.min_supported_version,
            });
        }
        Ok(())
    }

    /// The version window this host advertises.
    pub fn handshake(&self) -> bridgerpc::control::Handshake {
        bridgerpc::control::Handshake {
            protocol_version: self.protocol_version,
            min_supported_version: self.min_supported_version,
            supports_streaming: true,
        }
    }
}

fn parse<T: std::str::FromStr>(key: &'static str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
        key,
        value: value.to_string(),
        reason: e.to_string(),
    })
}

fn parse_flag(key: &'static str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(ConfigError::Invalid {
            key,
            value: value.to_string(),
            reason: "expected a boolean".into(),
        }),
    }
}

mod millis {
    use std::time::Duration;

    use serde::Deserialize;
    use serde::Deserializer;
    use serde::Serializer;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

/// Options for a single call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallOptions {
    /// Routes the call to this session, overriding every other source.
    pub session_id: Option<SessionId>,
    /// The call may be retried after a transient transport failure.
    pub idempotent: bool,
    /// Overrides [`BridgeConfig::call_timeout`] for this call.
    pub timeout: Option<Duration>,
    /// Passed through to the executor untouched.
    pub metadata: Map<String, Wire>,
}

impl CallOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session(mut self, session_id: impl Into<SessionId>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn idempotent(mut self) -> Self {
        self.idempotent = true;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn meta(mut self, key: impl Into<String>, value: impl Into<Wire>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}
