//! Trade configuration

use crate::error::{Result, TradeError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_COUNTDOWN_MS: u64 = 3_000;
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_MAX_STACK: u32 = 100;

const COUNTDOWN_RANGE_MS: (u64, u64) = (1_000, 60_000);
const REQUEST_TIMEOUT_RANGE_MS: (u64, u64) = (5_000, 300_000);

/// Timing and stacking values consumed by the registry and exchange engine.
///
/// Loaded from JSON with the keys `CountdownDuration`, `RequestTimeout`,
/// `DefaultMaxStack` and `Debug`; missing keys take their defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct TradeConfig {
    /// Delay between mutual acceptance and the earliest execution (milliseconds)
    #[serde(rename = "CountdownDuration")]
    pub countdown_ms: u64,

    /// Lifetime of an unanswered trade request (milliseconds)
    #[serde(rename = "RequestTimeout")]
    pub request_timeout_ms: u64,

    /// Stack size assumed for kinds the pool cannot size
    pub default_max_stack: u32,

    /// Enables solo (self-test) sessions
    pub debug: bool,
}

impl Default for TradeConfig {
    fn default() -> Self {
        Self {
            countdown_ms: DEFAULT_COUNTDOWN_MS,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            default_max_stack: DEFAULT_MAX_STACK,
            debug: false,
        }
    }
}

impl TradeConfig {
    /// Parse a JSON document and clamp it into the supported ranges
    pub fn from_json(json: &str) -> Result<Self> {
        let config: TradeConfig = serde_json::from_str(json)?;
        Ok(config.normalized())
    }

    /// Load configuration from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;
        let config = Self::from_json(&contents)?;
        tracing::debug!("Loaded trade configuration from {}", path.display());
        Ok(config)
    }

    /// Clamp every value into its supported range
    pub fn normalized(mut self) -> Self {
        self.countdown_ms = self
            .countdown_ms
            .clamp(COUNTDOWN_RANGE_MS.0, COUNTDOWN_RANGE_MS.1);
        self.request_timeout_ms = self
            .request_timeout_ms
            .clamp(REQUEST_TIMEOUT_RANGE_MS.0, REQUEST_TIMEOUT_RANGE_MS.1);
        self.default_max_stack = self.default_max_stack.max(1);
        self
    }

    /// Reject values outside the supported ranges instead of clamping them
    pub fn validate(&self) -> Result<()> {
        if !(COUNTDOWN_RANGE_MS.0..=COUNTDOWN_RANGE_MS.1).contains(&self.countdown_ms) {
            return Err(TradeError::InvalidConfig(format!(
                "CountdownDuration {} outside {}..={} ms",
                self.countdown_ms, COUNTDOWN_RANGE_MS.0, COUNTDOWN_RANGE_MS.1
            )));
        }
        if !(REQUEST_TIMEOUT_RANGE_MS.0..=REQUEST_TIMEOUT_RANGE_MS.1)
            .contains(&self.request_timeout_ms)
        {
            return Err(TradeError::InvalidConfig(format!(
                "RequestTimeout {} outside {}..={} ms",
                self.request_timeout_ms, REQUEST_TIMEOUT_RANGE_MS.0, REQUEST_TIMEOUT_RANGE_MS.1
            )));
        }
        if self.default_max_stack == 0 {
            return Err(TradeError::InvalidConfig(
                "DefaultMaxStack must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn countdown(&self) -> Duration {
        Duration::from_millis(self.countdown_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    #[test]
    fn test_defaults() {
        let config = TradeConfig::default();
        assert_eq!(config.countdown(), Duration::from_secs(3));
        assert_eq!(config.request_timeout(), Duration::from_secs(30));
        assert_eq!(config.default_max_stack, 100);
        assert!(!config.debug);
        assert_ok!(config.validate());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = TradeConfig::from_json(r#"{"CountdownDuration": 5000, "Debug": true}"#).unwrap();
        assert_eq!(config.countdown_ms, 5000);
        assert_eq!(config.request_timeout_ms, DEFAULT_REQUEST_TIMEOUT_MS);
        assert!(config.debug);
    }

    #[test]
    fn test_values_are_clamped() {
        let config =
            TradeConfig::from_json(r#"{"CountdownDuration": 10, "RequestTimeout": 999999999, "DefaultMaxStack": 0}"#)
                .unwrap();
        assert_eq!(config.countdown_ms, 1_000);
        assert_eq!(config.request_timeout_ms, 300_000);
        assert_eq!(config.default_max_stack, 1);
    }

    #[test]
    fn test_validate_rejects_out_of_range() {
        let config = TradeConfig {
            countdown_ms: 0,
            ..TradeConfig::default()
        };
        assert_err!(config.validate());
    }

    #[test]
    fn test_malformed_json() {
        let result = TradeConfig::from_json("{ not json");
        assert!(matches!(result.unwrap_err(), TradeError::Json(_)));
    }

    #[test]
    fn test_serialization_keys() {
        let json = serde_json::to_string(&TradeConfig::default()).unwrap();
        assert!(json.contains("\"CountdownDuration\":3000"));
        assert!(json.contains("\"RequestTimeout\":30000"));
        assert!(json.contains("\"DefaultMaxStack\":100"));
    }
}
