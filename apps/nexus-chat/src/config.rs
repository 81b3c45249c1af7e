//! Environment-backed runtime configuration for `nexus-chat`.

use std::{env, error::Error, fmt, path::PathBuf, str::FromStr, time::Duration};

use channel_core::{Location, RetryPolicy};

const DEFAULT_AGENT_WS_URL: &str = "wss://pharmnexus.onrender.com/agent/ws";
const DEFAULT_RETRY_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 1_000;
const DEFAULT_RETRY_MAX_DELAY_MS: u64 = 5_000;
const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_MAX_MESSAGES: usize = 200;

/// Runtime configuration used by the chat client.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatConfig {
    /// Assistant WebSocket endpoint.
    pub agent_ws_url: String,
    /// Reconnect budget and backoff bounds.
    pub retry_policy: RetryPolicy,
    /// Handshake bound per connection attempt. `None` when disabled with `0`.
    pub connect_timeout: Option<Duration>,
    /// Current medication list sent as request context.
    pub drugs: Vec<String>,
    /// Optional JSON file holding the latest interaction analysis.
    pub analysis_file: Option<PathBuf>,
    /// Location forwarded with every request.
    pub location: Location,
    /// Transcript cap for the in-memory chat history.
    pub max_messages: usize,
}

impl ChatConfig {
    /// Parse configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(mut lookup: F) -> Result<Self, ConfigError>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let agent_ws_url = optional_trimmed_env("NEXUS_AGENT_WS_URL", &mut lookup)
            .unwrap_or_else(|| DEFAULT_AGENT_WS_URL.to_owned());

        let max_attempts = parse_with_default(
            "NEXUS_RETRY_MAX_ATTEMPTS",
            DEFAULT_RETRY_MAX_ATTEMPTS,
            &mut lookup,
        )?;
        let base_delay_ms = parse_with_default(
            "NEXUS_RETRY_BASE_DELAY_MS",
            DEFAULT_RETRY_BASE_DELAY_MS,
            &mut lookup,
        )?;
        let max_delay_ms = parse_with_default(
            "NEXUS_RETRY_MAX_DELAY_MS",
            DEFAULT_RETRY_MAX_DELAY_MS,
            &mut lookup,
        )?;
        let retry_policy = RetryPolicy::new(max_attempts, base_delay_ms, max_delay_ms)
            .map_err(|err| ConfigError::InvalidRetryPolicy {
                reason: err.message,
            })?;

        let connect_timeout_ms = parse_with_default(
            "NEXUS_CONNECT_TIMEOUT_MS",
            DEFAULT_CONNECT_TIMEOUT_MS,
            &mut lookup,
        )?;
        let connect_timeout =
            (connect_timeout_ms > 0).then(|| Duration::from_millis(connect_timeout_ms));

        let drugs = optional_trimmed_env("NEXUS_DRUGS", &mut lookup)
            .map(|raw| split_drug_list(&raw))
            .unwrap_or_default();
        let analysis_file =
            optional_trimmed_env("NEXUS_ANALYSIS_FILE", &mut lookup).map(PathBuf::from);

        let location = Location {
            lat: parse_optional("NEXUS_LAT", &mut lookup)?,
            lon: parse_optional("NEXUS_LON", &mut lookup)?,
            accuracy: parse_optional("NEXUS_LOCATION_ACCURACY", &mut lookup)?,
        };
        validate_location(&location)?;

        let max_messages =
            parse_with_default("NEXUS_CHAT_MAX_MESSAGES", DEFAULT_MAX_MESSAGES, &mut lookup)?;
        if max_messages == 0 {
            return Err(ConfigError::InvalidValue {
                key: "NEXUS_CHAT_MAX_MESSAGES",
                value: "0".to_owned(),
                reason: "must be at least 1".to_owned(),
            });
        }

        Ok(Self {
            agent_ws_url,
            retry_policy,
            connect_timeout,
            drugs,
            analysis_file,
            location,
            max_messages,
        })
    }
}

/// Errors produced while parsing runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// An environment variable could not be parsed.
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
    /// Retry variables parsed but do not form a usable policy.
    InvalidRetryPolicy { reason: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidValue { key, value, reason } => {
                write!(f, "invalid {key}='{value}': {reason}")
            }
            Self::InvalidRetryPolicy { reason } => write!(f, "invalid retry policy: {reason}"),
        }
    }
}

impl Error for ConfigError {}

fn optional_trimmed_env<F>(key: &'static str, lookup: &mut F) -> Option<String>
where
    F: FnMut(&str) -> Option<String>,
{
    lookup(key)
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

fn parse_optional<T, F>(key: &'static str, lookup: &mut F) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = optional_trimmed_env(key, lookup) else {
        return Ok(None);
    };
    value
        .parse::<T>()
        .map(Some)
        .map_err(|err| ConfigError::InvalidValue {
            key,
            value,
            reason: err.to_string(),
        })
}

fn parse_with_default<T, F>(key: &'static str, default: T, lookup: &mut F) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
    F: FnMut(&str) -> Option<String>,
{
    Ok(parse_optional(key, lookup)?.unwrap_or(default))
}

fn split_drug_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|drug| !drug.is_empty())
        .map(str::to_owned)
        .collect()
}

fn validate_location(location: &Location) -> Result<(), ConfigError> {
    match (location.lat, location.lon) {
        (Some(lat), _) if !(-90.0..=90.0).contains(&lat) => Err(ConfigError::InvalidValue {
            key: "NEXUS_LAT",
            value: lat.to_string(),
            reason: "must be within -90..=90".to_owned(),
        }),
        (_, Some(lon)) if !(-180.0..=180.0).contains(&lon) => Err(ConfigError::InvalidValue {
            key: "NEXUS_LON",
            value: lon.to_string(),
            reason: "must be within -180..=180".to_owned(),
        }),
        (Some(lat), None) => Err(ConfigError::InvalidValue {
            key: "NEXUS_LON",
            value: String::new(),
            reason: format!("required when NEXUS_LAT={lat} is set"),
        }),
        (None, Some(lon)) => Err(ConfigError::InvalidValue {
            key: "NEXUS_LAT",
            value: String::new(),
            reason: format!("required when NEXUS_LON={lon} is set"),
        }),
        _ => Ok(()),
    }
}
