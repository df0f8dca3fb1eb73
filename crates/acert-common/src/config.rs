//! Session timing configuration and duration parsing

use std::time::Duration;

use thiserror::Error;

/// Default interval between agent heartbeats
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// Default age after which a silent session is evicted
pub const DEFAULT_LIVENESS_TIMEOUT: Duration = Duration::from_secs(20);

/// Default interval between registry sweeps
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(5);

/// Configuration errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// Duration string could not be parsed
    #[error("invalid duration '{input}', expected e.g. 1h, 30m, 5s, 250ms")]
    InvalidDuration {
        /// The rejected input
        input: String,
    },

    /// A timing value was zero
    #[error("{field} must be greater than zero")]
    ZeroDuration {
        /// Name of the offending field
        field: &'static str,
    },

    /// Liveness timeout has a sub-second part; heartbeat ages are whole seconds
    #[error("liveness timeout ({liveness:?}) must be a whole number of seconds")]
    LivenessNotWholeSeconds {
        /// Configured liveness timeout
        liveness: Duration,
    },

    /// Liveness timeout is not longer than the heartbeat interval
    #[error(
        "liveness timeout ({liveness:?}) must exceed heartbeat interval ({heartbeat:?})"
    )]
    LivenessTooShort {
        /// Configured liveness timeout
        liveness: Duration,
        /// Configured heartbeat interval
        heartbeat: Duration,
    },
}

/// Timings shared by the agent session loop and the server registry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionTimings {
    /// Interval between agent heartbeats
    pub heartbeat_interval: Duration,
    /// Age of the last heartbeat after which a session is evicted
    pub liveness_timeout: Duration,
    /// Interval between server registry sweeps
    pub sweep_interval: Duration,
}

impl Default for SessionTimings {
    fn default() -> Self {
        Self {
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            liveness_timeout: DEFAULT_LIVENESS_TIMEOUT,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        }
    }
}

impl SessionTimings {
    /// Check that every interval is non-zero, the liveness timeout is whole
    /// seconds, and a live agent cannot be evicted between two heartbeats.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("heartbeat_interval", self.heartbeat_interval),
            ("liveness_timeout", self.liveness_timeout),
            ("sweep_interval", self.sweep_interval),
        ] {
            if value.is_zero() {
                return Err(ConfigError::ZeroDuration { field });
            }
        }
        if self.liveness_timeout.subsec_nanos() != 0 {
            return Err(ConfigError::LivenessNotWholeSeconds {
                liveness: self.liveness_timeout,
            });
        }
        if self.liveness_timeout <= self.heartbeat_interval {
            return Err(ConfigError::LivenessTooShort {
                liveness: self.liveness_timeout,
                heartbeat: self.heartbeat_interval,
            });
        }
        Ok(())
    }
}

/// Parse a duration string like `250ms`, `5s`, `30m`, `1h`, or bare seconds
pub fn parse_duration(s: &str) -> Result<Duration, ConfigError> {
    let s = s.trim();
    let invalid = || ConfigError::InvalidDuration {
        input: s.to_string(),
    };
    let number = |digits: &str| digits.trim().parse::<u64>().map_err(|_| invalid());

    if let Some(ms) = s.strip_suffix("ms") {
        Ok(Duration::from_millis(number(ms)?))
    } else if let Some(hours) = s.strip_suffix('h') {
        number(hours)?
            .checked_mul(3600)
            .map(Duration::from_secs)
            .ok_or_else(invalid)
    } else if let Some(minutes) = s.strip_suffix('m') {
        number(minutes)?
            .checked_mul(60)
            .map(Duration::from_secs)
            .ok_or_else(invalid)
    } else if let Some(secs) = s.strip_suffix('s') {
        Ok(Duration::from_secs(number(secs)?))
    } else {
        // Raw seconds
        Ok(Duration::from_secs(number(s)?))
    }
}
