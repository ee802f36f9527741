//! Runtime configuration parsed from environment variables.
//!
//! Numeric knobs fall back to their defaults when absent or unparseable.
//! Identifiers are strict: a malformed UUID is a configuration error rather
//! than a silent default, because joining the wrong document is worse than
//! refusing to start.

use std::time::Duration;

use uuid::Uuid;

use crate::error::ErrorCode;

pub const DEFAULT_FRESHNESS_SECS: u64 = 300;
pub const DEFAULT_HEARTBEAT_SECS: u64 = 30;
pub const DEFAULT_CURSOR_THROTTLE_MS: u64 = 50;
pub const DEFAULT_DB_MAX_CONNECTIONS: u32 = 5;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required env var {0}")]
    Missing(&'static str),
    #[error("invalid uuid in {var}: {value}")]
    InvalidUuid { var: &'static str, value: String },
}

impl ErrorCode for ConfigError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Missing(_) => "E_CONFIG_MISSING",
            Self::InvalidUuid { .. } => "E_CONFIG_INVALID_UUID",
        }
    }
}

/// Presence tuning shared by the engine and the host session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresenceConfig {
    /// Records older than this, relative to fetch time, are not live.
    pub freshness: Duration,
    /// Cadence for re-upserting `last_seen` while a document is open.
    pub heartbeat: Duration,
    /// Minimum spacing between cursor upserts issued by the host.
    pub cursor_throttle: Duration,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            freshness: Duration::from_secs(DEFAULT_FRESHNESS_SECS),
            heartbeat: Duration::from_secs(DEFAULT_HEARTBEAT_SECS),
            cursor_throttle: Duration::from_millis(DEFAULT_CURSOR_THROTTLE_MS),
        }
    }
}

impl PresenceConfig {
    /// Optional:
    /// - `PRESENCE_FRESHNESS_SECS`: default 300
    /// - `PRESENCE_HEARTBEAT_SECS`: default 30
    /// - `CURSOR_THROTTLE_MS`: default 50
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            freshness: Duration::from_secs(env_parse("PRESENCE_FRESHNESS_SECS", DEFAULT_FRESHNESS_SECS)),
            heartbeat: Duration::from_secs(env_parse("PRESENCE_HEARTBEAT_SECS", DEFAULT_HEARTBEAT_SECS)),
            cursor_throttle: Duration::from_millis(env_parse("CURSOR_THROTTLE_MS", DEFAULT_CURSOR_THROTTLE_MS)),
        }
    }
}

/// Everything the presence monitor binary needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollabConfig {
    pub database_url: String,
    pub db_max_connections: u32,
    pub document_id: Uuid,
    pub user_id: Option<Uuid>,
    pub presence: PresenceConfig,
}

impl CollabConfig {
    /// Build typed config from environment variables.
    ///
    /// Required:
    /// - `DATABASE_URL`
    /// - `COLLAB_DOCUMENT_ID`
    ///
    /// Optional:
    /// - `COLLAB_USER_ID`: anonymous (observe only) when absent
    /// - `DB_MAX_CONNECTIONS`: default 5
    /// - everything read by [`PresenceConfig::from_env`]
    ///
    /// # Errors
    ///
    /// Returns an error if a required var is missing or an id is not a UUID.
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("DATABASE_URL").map_err(|_| ConfigError::Missing("DATABASE_URL"))?;
        let raw_document =
            std::env::var("COLLAB_DOCUMENT_ID").map_err(|_| ConfigError::Missing("COLLAB_DOCUMENT_ID"))?;
        let document_id = parse_uuid("COLLAB_DOCUMENT_ID", &raw_document)?;
        let user_id = match std::env::var("COLLAB_USER_ID") {
            Ok(raw) if !raw.trim().is_empty() => Some(parse_uuid("COLLAB_USER_ID", &raw)?),
            _ => None,
        };

        Ok(Self {
            database_url,
            db_max_connections: env_parse("DB_MAX_CONNECTIONS", DEFAULT_DB_MAX_CONNECTIONS),
            document_id,
            user_id,
            presence: PresenceConfig::from_env(),
        })
    }
}

fn parse_uuid(var: &'static str, raw: &str) -> Result<Uuid, ConfigError> {
    Uuid::parse_str(raw.trim()).map_err(|_| ConfigError::InvalidUuid { var, value: raw.to_string() })
}

pub(crate) fn env_parse<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr + Copy,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
