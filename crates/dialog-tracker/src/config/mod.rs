//! Configuration for the dialog tracker
//!
//! [`TrackerConfig`] gathers every tunable of the registry, the timer engine
//! and the dispatch layer. It follows the usual builder pattern and can be
//! loaded from TOML:
//!
//! ```rust
//! use rvoip_dialog_tracker::config::{TrackerConfig, TrackingMode};
//! use std::time::Duration;
//!
//! let config = TrackerConfig::new()
//!     .with_hash_size(1024)
//!     .with_default_lifetime(Duration::from_secs(3600))
//!     .with_tracking_mode(TrackingMode::Forking);
//!
//! assert!(config.validate().is_ok());
//! ```
//!
//! ```rust
//! use rvoip_dialog_tracker::config::TrackerConfig;
//!
//! let config = TrackerConfig::from_toml_str(r#"
//!     hash_size = 256
//!     default_lifetime = 7200
//!     db_mode = "realtime"
//! "#).unwrap();
//!
//! assert_eq!(config.hash_size, 256);
//! ```
//!
//! ## Defaults
//!
//! ```text
//! hash_size            4096 buckets
//! default_lifetime     12 hours
//! timer_interval       1 second
//! clean_interval       90 seconds
//! unconfirmed_grace    5 minutes
//! ack_wait_grace       60 seconds (then ack_wait_lifetime = 10 seconds)
//! keepalive_interval   disabled
//! db_mode              none
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{DialogError, DialogResult};

/// Default number of registry buckets
pub const DEFAULT_HASH_SIZE: u32 = 4096;

/// Default lifetime of a confirmed dialog (12 hours)
pub const DEFAULT_LIFETIME: Duration = Duration::from_secs(43_200);

/// Maximum length of the record-route parameter name
pub const MAX_RR_PARAM_LEN: usize = 32;

/// When dialog snapshots are written to the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DbMode {
    /// No persistence
    #[default]
    None,
    /// Write on every relevant transition
    Realtime,
    /// Write changed dialogs periodically
    Delayed,
    /// Write everything once at shutdown
    Shutdown,
}

/// How in-dialog requests are matched to a dialog
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MatchMode {
    /// Only the record-route token is used
    TokenOnly,
    /// Token first, Call-ID/tag matching when the token is absent or stale
    #[default]
    TokenWithFallback,
    /// Only Call-ID/tag matching is used
    IdentityOnly,
}

/// Whether forked branches are tracked individually
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TrackingMode {
    /// One callee leg per dialog
    #[default]
    Single,
    /// One branch per distinct to-tag until a branch confirms
    Forking,
}

/// Dialog tracker configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Number of registry buckets (power of two)
    pub hash_size: u32,

    /// Lifetime given to a dialog once it is answered
    #[serde(with = "duration_secs")]
    pub default_lifetime: Duration,

    /// Period of the timer engine tick
    #[serde(with = "duration_secs")]
    pub timer_interval: Duration,

    /// Period of the stale-dialog sweep
    #[serde(with = "duration_secs")]
    pub clean_interval: Duration,

    /// Age after which an Unconfirmed dialog is reaped
    #[serde(with = "duration_secs")]
    pub unconfirmed_grace: Duration,

    /// Age after which a dialog still waiting for its ACK is shortened
    #[serde(with = "duration_secs")]
    pub ack_wait_grace: Duration,

    /// Remaining lifetime given to a dialog whose ACK never arrived
    #[serde(with = "duration_secs")]
    pub ack_wait_lifetime: Duration,

    /// Keep-alive probe period; `None` disables probing
    #[serde(with = "option_duration_secs")]
    pub keepalive_interval: Option<Duration>,

    /// Consecutive failed probes before the dialog is terminated
    pub keepalive_failure_limit: u32,

    /// Persistence mode
    pub db_mode: DbMode,

    /// Flush period in delayed mode
    #[serde(with = "duration_secs")]
    pub db_update_period: Duration,

    /// Recognize a request that loops back through the proxy
    pub detect_spirals: bool,

    /// In-dialog request matching strategy
    pub match_mode: MatchMode,

    /// Forking support
    pub tracking_mode: TrackingMode,

    /// Record-route parameter carrying the dialog token
    pub rr_param: String,

    /// Upper bound on linked dialogs; `None` is unlimited
    pub max_dialogs: Option<usize>,

    /// Depth of the replication broadcast channel
    pub replication_capacity: usize,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            hash_size: DEFAULT_HASH_SIZE,
            default_lifetime: DEFAULT_LIFETIME,
            timer_interval: Duration::from_secs(1),
            clean_interval: Duration::from_secs(90),
            unconfirmed_grace: Duration::from_secs(300),
            ack_wait_grace: Duration::from_secs(60),
            ack_wait_lifetime: Duration::from_secs(10),
            keepalive_interval: None,
            keepalive_failure_limit: 1,
            db_mode: DbMode::None,
            db_update_period: Duration::from_secs(60),
            detect_spirals: true,
            match_mode: MatchMode::TokenWithFallback,
            tracking_mode: TrackingMode::Single,
            rr_param: "did".to_string(),
            max_dialogs: None,
            replication_capacity: 1024,
        }
    }
}

impl TrackerConfig {
    /// Create a configuration with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a configuration from TOML; missing keys keep their defaults
    pub fn from_toml_str(input: &str) -> DialogResult<Self> {
        let config: TrackerConfig = toml::from_str(input)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a TOML configuration file
    pub fn from_toml_file(path: impl AsRef<std::path::Path>) -> DialogResult<Self> {
        let path = path.as_ref();
        let input = std::fs::read_to_string(path)
            .map_err(|e| DialogError::config_error(format!("cannot read {}: {}", path.display(), e)))?;
        Self::from_toml_str(&input)
    }

    /// Set the number of registry buckets
    pub fn with_hash_size(mut self, hash_size: u32) -> Self {
        self.hash_size = hash_size;
        self
    }

    /// Set the lifetime of answered dialogs
    pub fn with_default_lifetime(mut self, lifetime: Duration) -> Self {
        self.default_lifetime = lifetime;
        self
    }

    /// Set the timer tick period
    pub fn with_timer_interval(mut self, interval: Duration) -> Self {
        self.timer_interval = interval;
        self
    }

    /// Set the stale sweep period
    pub fn with_clean_interval(mut self, interval: Duration) -> Self {
        self.clean_interval = interval;
        self
    }

    /// Set the Unconfirmed grace period
    pub fn with_unconfirmed_grace(mut self, grace: Duration) -> Self {
        self.unconfirmed_grace = grace;
        self
    }

    /// Enable keep-alive probing
    pub fn with_keepalive(mut self, interval: Duration, failure_limit: u32) -> Self {
        self.keepalive_interval = Some(interval);
        self.keepalive_failure_limit = failure_limit;
        self
    }

    /// Set the persistence mode
    pub fn with_db_mode(mut self, mode: DbMode) -> Self {
        self.db_mode = mode;
        self
    }

    /// Set the delayed-mode flush period
    pub fn with_db_update_period(mut self, period: Duration) -> Self {
        self.db_update_period = period;
        self
    }

    /// Enable or disable spiral detection
    pub fn with_spiral_detection(mut self, enabled: bool) -> Self {
        self.detect_spirals = enabled;
        self
    }

    /// Set the in-dialog matching strategy
    pub fn with_match_mode(mut self, mode: MatchMode) -> Self {
        self.match_mode = mode;
        self
    }

    /// Set the tracking mode
    pub fn with_tracking_mode(mut self, mode: TrackingMode) -> Self {
        self.tracking_mode = mode;
        self
    }

    /// Set the record-route parameter name
    pub fn with_rr_param(mut self, name: impl Into<String>) -> Self {
        self.rr_param = name.into();
        self
    }

    /// Limit the number of linked dialogs
    pub fn with_max_dialogs(mut self, max: usize) -> Self {
        self.max_dialogs = Some(max);
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> DialogResult<()> {
        if self.hash_size == 0 || !self.hash_size.is_power_of_two() {
            return Err(DialogError::config_error(format!(
                "hash_size must be a power of two, got {}",
                self.hash_size
            )));
        }

        if self.default_lifetime.is_zero() {
            return Err(DialogError::config_error("default_lifetime must be greater than zero"));
        }

        if self.timer_interval.is_zero() {
            return Err(DialogError::config_error("timer_interval must be greater than zero"));
        }

        if self.clean_interval.is_zero() {
            return Err(DialogError::config_error("clean_interval must be greater than zero"));
        }

        if self.ack_wait_lifetime.is_zero() {
            return Err(DialogError::config_error("ack_wait_lifetime must be greater than zero"));
        }

        if let Some(interval) = self.keepalive_interval {
            if interval.is_zero() {
                return Err(DialogError::config_error("keepalive_interval must be greater than zero"));
            }
            if self.keepalive_failure_limit == 0 {
                return Err(DialogError::config_error("keepalive_failure_limit must be at least 1"));
            }
        }

        if self.db_mode == DbMode::Delayed && self.db_update_period.is_zero() {
            return Err(DialogError::config_error("db_update_period must be greater than zero in delayed mode"));
        }

        if self.rr_param.is_empty() || self.rr_param.len() > MAX_RR_PARAM_LEN {
            return Err(DialogError::config_error(format!(
                "rr_param must be 1..={} characters",
                MAX_RR_PARAM_LEN
            )));
        }

        if self.max_dialogs == Some(0) {
            return Err(DialogError::config_error("max_dialogs must be greater than zero"));
        }

        if self.replication_capacity == 0 {
            return Err(DialogError::config_error("replication_capacity must be greater than zero"));
        }

        Ok(())
    }

    /// Default lifetime in whole seconds
    pub fn default_lifetime_secs(&self) -> u32 {
        u32::try_from(self.default_lifetime.as_secs()).unwrap_or(u32::MAX)
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(deserializer)?))
    }
}

mod option_duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(duration) => serializer.serialize_some(&duration.as_secs()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_secs))
    }
}
