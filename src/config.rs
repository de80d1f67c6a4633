use crate::audio::AudioFormat;
use std::collections::HashMap;
use std::env;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid value for {var}: '{value}' ({reason})")]
    InvalidValue {
        var: String,
        value: String,
        reason: String,
    },
    #[error("No endpoint configured (pass --url or set DUPLEX_URL)")]
    MissingEndpoint,
    #[error("Failed to read env file: {0}")]
    EnvFile(#[from] dotenvy::Error),
}

/// Reconnect policy: a fixed delay between attempts, optionally capped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub delay: Duration,
    /// Consecutive failed attempts before giving up. `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            delay: Duration::from_secs(5),
            max_attempts: None,
        }
    }
}

impl RetryPolicy {
    /// Whether another attempt is allowed after `failures` consecutive failures.
    pub fn allows_retry(&self, failures: u32) -> bool {
        self.max_attempts.map(|max| failures < max).unwrap_or(true)
    }
}

/// Query parameters understood by the remote service. Passed through unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PersonaParams {
    pub text_prompt: Option<String>,
    pub voice_prompt: Option<String>,
    pub seed: Option<String>,
}

impl PersonaParams {
    pub fn query_pairs(&self) -> Vec<(&'static str, &str)> {
        [
            ("text_prompt", self.text_prompt.as_deref()),
            ("voice_prompt", self.voice_prompt.as_deref()),
            ("seed", self.seed.as_deref()),
        ]
        .into_iter()
        .filter_map(|(key, value)| value.map(|v| (key, v)))
        .collect()
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub endpoint: Option<String>,
    pub persona: PersonaParams,
    pub format: AudioFormat,
    /// Capacity of the outbound queue, in blocks.
    pub queue_capacity: usize,
    /// How long the sender sleeps when the outbound queue is empty.
    pub sender_poll_interval: Duration,
    pub connect_timeout: Duration,
    pub retry: RetryPolicy,
    pub playback_buffer_ms: u32,
    pub accept_invalid_certs: bool,
    pub user_agent: Option<String>,
    pub origin: Option<String>,
    /// Send a handshake frame right after connecting.
    pub send_handshake: bool,
    pub input_device: Option<String>,
    pub output_device: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            persona: PersonaParams::default(),
            format: AudioFormat::default(),
            queue_capacity: 64,
            sender_poll_interval: Duration::from_millis(5),
            connect_timeout: Duration::from_secs(10),
            retry: RetryPolicy::default(),
            playback_buffer_ms: 2000,
            accept_invalid_certs: false,
            user_agent: None,
            origin: None,
            send_handshake: false,
            input_device: None,
            output_device: None,
        }
    }
}

impl ClientConfig {
    /// Defaults overridden by `.env` (if present) and the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Don't error if .env doesn't exist
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Like `from_env`, but reads the given file; process env still wins.
    pub fn from_env_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let mut file_vars = HashMap::new();
        for item in dotenvy::from_path_iter(path.as_ref())? {
            let (key, value) = item?;
            file_vars.insert(key, value);
        }
        Self::from_lookup(|key| env::var(key).ok().or_else(|| file_vars.get(key).cloned()))
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        config.endpoint = lookup("DUPLEX_URL").filter(|v| !v.trim().is_empty());
        config.persona.text_prompt = lookup("DUPLEX_TEXT_PROMPT");
        config.persona.voice_prompt = lookup("DUPLEX_VOICE_PROMPT");
        config.persona.seed = lookup("DUPLEX_SEED");
        config.user_agent = lookup("DUPLEX_USER_AGENT");
        config.origin = lookup("DUPLEX_ORIGIN");
        config.input_device = lookup("DUPLEX_INPUT_DEVICE");
        config.output_device = lookup("DUPLEX_OUTPUT_DEVICE");

        if let Some(rate) = parse_var::<u32>(&lookup, "DUPLEX_SAMPLE_RATE")? {
            config.format.sample_rate = positive("DUPLEX_SAMPLE_RATE", rate)?;
        }
        if let Some(size) = parse_var::<usize>(&lookup, "DUPLEX_BLOCK_SIZE")? {
            config.format.block_size = positive("DUPLEX_BLOCK_SIZE", size)?;
        }
        if let Some(capacity) = parse_var::<usize>(&lookup, "DUPLEX_QUEUE_CAPACITY")? {
            config.queue_capacity = positive("DUPLEX_QUEUE_CAPACITY", capacity)?;
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "DUPLEX_CONNECT_TIMEOUT_MS")? {
            config.connect_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "DUPLEX_RETRY_DELAY_MS")? {
            config.retry.delay = Duration::from_millis(ms);
        }
        if let Some(max) = parse_var::<u32>(&lookup, "DUPLEX_MAX_RETRIES")? {
            config.retry.max_attempts = Some(max);
        }
        if let Some(flag) = parse_flag(&lookup, "DUPLEX_INSECURE_TLS")? {
            config.accept_invalid_certs = flag;
        }
        if let Some(flag) = parse_flag(&lookup, "DUPLEX_SEND_HANDSHAKE")? {
            config.send_handshake = flag;
        }

        Ok(config)
    }

    pub fn endpoint(&self) -> Result<&str, ConfigError> {
        self.endpoint.as_deref().ok_or(ConfigError::MissingEndpoint)
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, var: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(var) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::InvalidValue {
                var: var.to_string(),
                value: raw.clone(),
                reason: e.to_string(),
            }),
    }
}

fn parse_flag(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &str,
) -> Result<Option<bool>, ConfigError> {
    match lookup(var) {
        None => Ok(None),
        Some(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(Some(true)),
            "0" | "false" | "no" | "off" => Ok(Some(false)),
            _ => Err(ConfigError::InvalidValue {
                var: var.to_string(),
                value: raw,
                reason: "expected true/false".to_string(),
            }),
        },
    }
}

fn positive<T: PartialEq + Default + std::fmt::Display>(var: &str, value: T) -> Result<T, ConfigError> {
    if value == T::default() {
        return Err(ConfigError::InvalidValue {
            var: var.to_string(),
            value: value.to_string(),
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(value)
}
