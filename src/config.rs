use crate::{
    accountant::AccountingConfig,
    error::{CoasterError, Result},
    profile::ProfileKind,
    types::Gender,
};
use serde::{Deserialize, Serialize};
use std::{path::Path, time::Duration};

/// Gap detection after a reconnection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackfillConfig {
    /// Disconnections longer than this trigger a backfill, in seconds
    pub gap_threshold_secs: u64,
    /// Wait after reconnecting before requesting the log, in milliseconds
    pub stabilization_delay_ms: u64,
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self {
            gap_threshold_secs: 60,
            stabilization_delay_ms: 2_000,
        }
    }
}

impl BackfillConfig {
    /// Threshold as a [`Duration`]
    #[must_use]
    pub const fn gap_threshold(&self) -> Duration {
        Duration::from_secs(self.gap_threshold_secs)
    }

    /// Stabilization delay as a [`Duration`]
    #[must_use]
    pub const fn stabilization_delay(&self) -> Duration {
        Duration::from_millis(self.stabilization_delay_ms)
    }
}

/// Engine behavior
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Gender used for sessions the engine starts on its own
    pub gender: Gender,
    /// Start a session when a link becomes usable and none is active
    pub auto_start_session: bool,
    /// Interval between keep-alive battery requests, in seconds
    pub keepalive_secs: u64,
    /// How long to wait for a device reply before re-sending, in milliseconds
    pub reply_timeout_ms: u64,
    /// Persisted sessions older than this are discarded, in hours
    pub session_max_age_hours: u64,
    /// Profile used until the selector has statistics
    pub initial_profile: ProfileKind,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            gender: Gender::Male,
            auto_start_session: true,
            keepalive_secs: 20,
            reply_timeout_ms: 5_000,
            session_max_age_hours: 8,
            initial_profile: ProfileKind::Standard,
        }
    }
}

impl EngineConfig {
    /// Keep-alive period
    #[must_use]
    pub const fn keepalive(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs)
    }

    /// Reply deadline for commands
    #[must_use]
    pub const fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.reply_timeout_ms)
    }
}

/// Everything the crate can be configured with
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoasterConfig {
    /// Scoring rules
    pub accounting: AccountingConfig,
    /// Gap detection
    pub backfill: BackfillConfig,
    /// Engine behavior
    pub engine: EngineConfig,
}

impl CoasterConfig {
    /// Parse JSON; missing fields take their defaults
    ///
    /// # Errors
    ///
    /// Returns [`CoasterError::Json`] on malformed input, or the validation error.
    pub fn from_json_str(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a JSON file
    ///
    /// # Errors
    ///
    /// Returns [`CoasterError::Io`] if the file cannot be read, otherwise as
    /// [`CoasterConfig::from_json_str`].
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Check all sections
    ///
    /// # Errors
    ///
    /// Returns [`CoasterError::InvalidParameters`] for the first invalid value.
    pub fn validate(&self) -> Result<()> {
        self.accounting.validate()?;
        if self.engine.keepalive_secs == 0 {
            return Err(CoasterError::InvalidParameters(
                "keep-alive interval must be positive".to_string(),
            ));
        }
        if self.engine.reply_timeout_ms == 0 {
            return Err(CoasterError::InvalidParameters(
                "reply timeout must be positive".to_string(),
            ));
        }
        if self.engine.session_max_age_hours == 0 {
            return Err(CoasterError::InvalidParameters(
                "session max age must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
