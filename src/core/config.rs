//! Fetcher configuration.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::core::error::Error;
use crate::core::types::Result;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Full texture fetcher configuration. Missing fields in a JSON document fall
/// back to their defaults.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    /// Allow the HTTP texture service at all.
    pub use_http: bool,
    /// Issue byte-range GETs. When false every HTTP fetch is a plain GET.
    pub use_range_requests: bool,
    /// Consult the local texture cache before going to the network.
    pub can_load_from_cache: bool,

    // -- HTTP admission control -------------------------------------------

    /// High water mark when the transport pipelines requests.
    pub http_pipelined_high_water: u32,
    /// Low water mark when the transport pipelines requests.
    pub http_pipelined_low_water: u32,
    /// High water mark for a non-pipelining transport.
    pub http_high_water: u32,
    /// Low water mark for a non-pipelining transport.
    pub http_low_water: u32,
    /// Range requests ending past this offset are sent open-ended.
    pub range_end_max: u64,

    /// Backoff for failed network fetches.
    pub retry: RetryConfig,

    // -- Simulator batching -----------------------------------------------

    /// Minimum interval between simulator request batches (milliseconds).
    pub request_interval_ms: u64,
    /// Images per simulator request message.
    pub images_per_request: usize,
    /// Re-send an outstanding simulator request after this many seconds.
    pub sim_lazy_flush_secs: f32,
    /// Minimum seconds before a priority change triggers a re-send.
    pub min_request_secs: f32,
    /// Priority drift that triggers a re-send.
    pub min_delta_priority: f32,

    // -- Scheduling ---------------------------------------------------------

    /// Float priority mapped onto the full integer work-priority range.
    pub max_decode_priority: f32,
    /// Worker steps per tick. 0 = step every runnable worker.
    pub max_steps_per_tick: usize,

    // -- Metrics ------------------------------------------------------------

    /// Regions kept in a metrics report (longest-lived first).
    pub metrics_max_regions: usize,
    /// Log every metrics report as submitted.
    pub qa_mode: bool,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            use_http: true,
            use_range_requests: true,
            can_load_from_cache: true,

            http_pipelined_high_water: 100,
            http_pipelined_low_water: 50,
            http_high_water: 40,
            http_low_water: 20,
            range_end_max: 20_000_000,

            retry: RetryConfig::default(),

            request_interval_ms: 250, // 4 batches per second
            images_per_request: 128,
            sim_lazy_flush_secs: 2.0,
            min_request_secs: 1.0,
            min_delta_priority: 1000.0,

            max_decode_priority: 2_000_000.0,
            max_steps_per_tick: 0,

            metrics_max_regions: 10,
            qa_mode: false,
        }
    }
}

impl FetchConfig {
    /// Parse a configuration from JSON
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: FetchConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration from a JSON file
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&json)
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<()> {
        if self.http_low_water > self.http_high_water
            || self.http_pipelined_low_water > self.http_pipelined_high_water
        {
            return Err(Error::Config("HTTP low water mark above high water mark".into()));
        }
        if self.images_per_request == 0 {
            return Err(Error::Config("images_per_request must be positive".into()));
        }
        if self.max_decode_priority <= 0.0 {
            return Err(Error::Config("max_decode_priority must be positive".into()));
        }
        self.retry.validate()
    }

    /// Watermarks `(high, low)` for the given transport mode
    pub fn http_water_marks(&self, pipelined: bool) -> (u32, u32) {
        if pipelined {
            (self.http_pipelined_high_water, self.http_pipelined_low_water)
        } else {
            (self.http_high_water, self.http_low_water)
        }
    }

    /// Interval between simulator request batches
    pub fn request_interval(&self) -> Duration {
        Duration::from_millis(self.request_interval_ms)
    }
}

// ---------------------------------------------------------------------------
// Retry
// ---------------------------------------------------------------------------

/// Adaptive retry parameters.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// First retry delay (seconds).
    pub min_delay_secs: f32,
    /// Upper bound on the retry delay (seconds).
    pub max_delay_secs: f32,
    /// Delay multiplier applied after each failed retry.
    pub backoff_factor: f32,
    /// Retries before giving up.
    pub max_retries: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            min_delay_secs: 10.0,
            max_delay_secs: 3600.0,
            backoff_factor: 2.0,
            max_retries: 10,
        }
    }
}

impl RetryConfig {
    fn validate(&self) -> Result<()> {
        if self.min_delay_secs < 0.0 || self.max_delay_secs < self.min_delay_secs {
            return Err(Error::Config("retry delays must satisfy 0 <= min <= max".into()));
        }
        if self.backoff_factor < 1.0 {
            return Err(Error::Config("retry backoff factor must be >= 1.0".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = FetchConfig::default();
        assert_eq!(config.http_water_marks(true), (100, 50));
        assert_eq!(config.http_water_marks(false), (40, 20));
        assert_eq!(config.images_per_request, 128);
        assert_eq!(config.request_interval(), Duration::from_millis(250));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = FetchConfig::from_json_str(r#"{"use_http": false, "retry": {"max_retries": 3}}"#).unwrap();
        assert!(!config.use_http);
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.retry.min_delay_secs, 10.0);
        assert_eq!(config.http_high_water, 40);
    }

    #[test]
    fn test_rejects_inverted_water_marks() {
        let result = FetchConfig::from_json_str(r#"{"http_high_water": 10, "http_low_water": 20}"#);
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_rejects_bad_json() {
        let result = FetchConfig::from_json_str("{not json");
        assert!(matches!(result, Err(Error::Json(_))));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fetch.json");
        std::fs::write(&path, r#"{"images_per_request": 64}"#).unwrap();

        let config = FetchConfig::from_json_file(&path).unwrap();
        assert_eq!(config.images_per_request, 64);

        let missing = FetchConfig::from_json_file(dir.path().join("missing.json"));
        assert!(matches!(missing, Err(Error::Io(_))));
    }
}
