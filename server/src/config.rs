//! Server configuration module.
//!
//! Parses configuration from environment variables for the Piper server.
//!
//! # Environment Variables
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `PIPER_SESSION_KEY` | Yes | - | Signing key for bearer tokens and reset codes (at least 16 bytes) |
//! | `HOST` | No | 0.0.0.0 | Bind address |
//! | `PORT` | No | 8080 | HTTP server port |
//! | `PIPER_REDIS_ADDR` | No | - | `redis://` URL; in-memory stores are used when unset |
//! | `PIPER_SESSION_TTL_SECS` | No | 3600 | Session lifetime, extended on every request |
//! | `PIPER_RESET_TTL_SECS` | No | 300 | Reset code lifetime |
//! | `PIPER_EVENT_QUEUE_CAPACITY` | No | 10 | Events buffered before `notify` waits |
//! | `PIPER_PUSH_TIMEOUT_SECS` | No | 10 | Time a client may take to accept one event |
//! | `PIPER_BCRYPT_COST` | No | 13 | Password hash cost (4 to 31) |

use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::broadcast::{NotifierConfig, DEFAULT_PUSH_TIMEOUT, DEFAULT_QUEUE_CAPACITY};
use crate::error::ConfigError;
use crate::models::users::DEFAULT_BCRYPT_COST;
use crate::token::SigningKey;

const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 8080;
const DEFAULT_SESSION_TTL_SECS: u64 = 3600;
const DEFAULT_RESET_TTL_SECS: u64 = 300;

/// Shortest accepted signing key, in bytes.
pub const MIN_SESSION_KEY_LENGTH: usize = 16;

const MIN_BCRYPT_COST: u32 = 4;
const MAX_BCRYPT_COST: u32 = 31;

/// Server configuration parsed from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Signs and verifies bearer tokens and reset codes.
    pub session_key: SigningKey,

    pub host: String,

    pub port: u16,

    /// Redis server for sessions and reset codes.
    pub redis_addr: Option<String>,

    pub session_ttl: Duration,

    pub reset_ttl: Duration,

    pub event_queue_capacity: usize,

    pub push_timeout: Duration,

    pub bcrypt_cost: u32,
}

impl Config {
    /// Configuration with every optional value at its default.
    pub fn new(session_key: SigningKey) -> Self {
        Self {
            session_key,
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            redis_addr: None,
            session_ttl: Duration::from_secs(DEFAULT_SESSION_TTL_SECS),
            reset_ttl: Duration::from_secs(DEFAULT_RESET_TTL_SECS),
            event_queue_capacity: DEFAULT_QUEUE_CAPACITY,
            push_timeout: DEFAULT_PUSH_TIMEOUT,
            bcrypt_cost: DEFAULT_BCRYPT_COST,
        }
    }

    /// Parse configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if `PIPER_SESSION_KEY` is missing or too short,
    /// or if any variable fails to parse or is out of range.
    ///
    /// # Example
    ///
    /// ```no_run
    /// use piper_server::config::Config;
    ///
    /// let config = Config::from_env().expect("Failed to load config");
    /// println!("Server will listen on {}", config.bind_addr());
    /// ```
    pub fn from_env() -> Result<Self, ConfigError> {
        let session_key = parse_session_key()?;

        let config = Self {
            session_key,
            host: env::var("HOST").unwrap_or_else(|_| DEFAULT_HOST.to_string()),
            port: parse_env("PORT", DEFAULT_PORT)?,
            redis_addr: env::var("PIPER_REDIS_ADDR").ok().filter(|s| !s.is_empty()),
            session_ttl: Duration::from_secs(parse_env(
                "PIPER_SESSION_TTL_SECS",
                DEFAULT_SESSION_TTL_SECS,
            )?),
            reset_ttl: Duration::from_secs(parse_env(
                "PIPER_RESET_TTL_SECS",
                DEFAULT_RESET_TTL_SECS,
            )?),
            event_queue_capacity: parse_env("PIPER_EVENT_QUEUE_CAPACITY", DEFAULT_QUEUE_CAPACITY)?,
            push_timeout: Duration::from_secs(parse_env(
                "PIPER_PUSH_TIMEOUT_SECS",
                DEFAULT_PUSH_TIMEOUT.as_secs(),
            )?),
            bcrypt_cost: parse_env("PIPER_BCRYPT_COST", DEFAULT_BCRYPT_COST)?,
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.session_ttl.is_zero() {
            return Err(ConfigError::invalid(
                "PIPER_SESSION_TTL_SECS",
                "must be greater than zero",
            ));
        }
        if self.reset_ttl.is_zero() {
            return Err(ConfigError::invalid(
                "PIPER_RESET_TTL_SECS",
                "must be greater than zero",
            ));
        }
        if self.event_queue_capacity == 0 {
            return Err(ConfigError::invalid(
                "PIPER_EVENT_QUEUE_CAPACITY",
                "must be at least 1",
            ));
        }
        if self.push_timeout.is_zero() {
            return Err(ConfigError::invalid(
                "PIPER_PUSH_TIMEOUT_SECS",
                "must be greater than zero",
            ));
        }
        if !(MIN_BCRYPT_COST..=MAX_BCRYPT_COST).contains(&self.bcrypt_cost) {
            return Err(ConfigError::invalid(
                "PIPER_BCRYPT_COST",
                format!("must be between {MIN_BCRYPT_COST} and {MAX_BCRYPT_COST}"),
            ));
        }
        Ok(())
    }

    /// `host:port` to bind.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn notifier(&self) -> NotifierConfig {
        NotifierConfig {
            queue_capacity: self.event_queue_capacity,
            push_timeout: self.push_timeout,
        }
    }
}

fn parse_session_key() -> Result<SigningKey, ConfigError> {
    let key = match env::var("PIPER_SESSION_KEY") {
        Ok(key) if !key.is_empty() => key,
        Ok(_) | Err(env::VarError::NotPresent) => {
            return Err(ConfigError::missing("PIPER_SESSION_KEY"))
        }
        Err(env::VarError::NotUnicode(_)) => {
            return Err(ConfigError::invalid(
                "PIPER_SESSION_KEY",
                "contains invalid unicode",
            ))
        }
    };

    if key.len() < MIN_SESSION_KEY_LENGTH {
        return Err(ConfigError::invalid(
            "PIPER_SESSION_KEY",
            format!("must be at least {MIN_SESSION_KEY_LENGTH} bytes"),
        ));
    }

    Ok(SigningKey::new(key))
}

/// Parse an optional environment variable, falling back to `default`.
fn parse_env<T>(name: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|err: T::Err| ConfigError::invalid(name, err.to_string())),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(env::VarError::NotUnicode(_)) => {
            Err(ConfigError::invalid(name, "contains invalid unicode"))
        }
    }
}
