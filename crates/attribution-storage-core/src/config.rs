use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::Duration;

use crate::{AttributionError, RateLimitConfig};

pub const DEFAULT_DATABASE_FILE_NAME: &str = "Conversions";

/// Engine switches fixed at construction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StorageConfig {
    pub database_file_name: String,
    pub use_builtin_recovery: bool,
    pub verification_enabled: bool,
    /// Overrides the delegate's per-source aggregatable budget when set.
    pub aggregatable_budget_override: Option<i64>,
    pub expired_source_sweep_limit: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_file_name: DEFAULT_DATABASE_FILE_NAME.to_string(),
            use_builtin_recovery: true,
            verification_enabled: true,
            aggregatable_budget_override: None,
            expired_source_sweep_limit: 100,
        }
    }
}

impl StorageConfig {
    /// # Errors
    /// Returns [`AttributionError::Configuration`] when a field is outside
    /// its allowed range.
    pub fn validate(&self) -> Result<(), AttributionError> {
        let name = self.database_file_name.trim();
        if name.is_empty() || name.contains(['/', '\\']) || name == "." || name == ".." {
            return Err(AttributionError::Configuration(
                "database_file_name MUST be a plain file name".to_string(),
            ));
        }

        if let Some(budget) = self.aggregatable_budget_override {
            if budget <= 0 {
                return Err(AttributionError::Configuration(
                    "aggregatable_budget_override MUST be > 0".to_string(),
                ));
            }
        }

        if self.expired_source_sweep_limit == 0 {
            return Err(AttributionError::Configuration(
                "expired_source_sweep_limit MUST be >= 1".to_string(),
            ));
        }

        Ok(())
    }

    /// Decodes and validates a storage configuration from JSON.
    ///
    /// # Errors
    /// Returns [`AttributionError::Configuration`] when decoding or
    /// validation fails.
    pub fn from_json(value: &Value) -> Result<Self, AttributionError> {
        let config: Self = serde_json::from_value(value.clone()).map_err(|err| {
            AttributionError::Configuration(format!("invalid storage config JSON payload: {err}"))
        })?;
        config.validate()?;
        Ok(config)
    }
}

/// Longest rate-limit window a delegate config may ask for.
pub const MAX_RATE_LIMIT_WINDOW_DAYS: i64 = 365;
/// Upper bound for the aggregatable report minimum delay and its jitter span.
pub const MAX_AGGREGATABLE_REPORT_DELAY_SECS: i64 = 30 * 86_400;

/// Policy values read by the bundled delegates.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DelegateConfig {
    pub max_sources_per_origin: usize,
    pub max_event_level_reports_per_destination: usize,
    pub max_aggregatable_reports_per_destination: usize,
    pub max_aggregatable_reports_per_source: usize,
    pub aggregatable_budget_per_source: i64,
    pub delete_expired_sources_frequency_secs: i64,
    pub rate_limit_window_days: i64,
    pub max_source_registration_reporting_origins: usize,
    pub max_attribution_reporting_origins: usize,
    pub max_attributions_per_window: usize,
    pub navigation_randomized_response_rate: f64,
    pub event_randomized_response_rate: f64,
    pub null_aggregatable_report_rate: f64,
    pub aggregatable_report_min_delay_secs: i64,
    pub aggregatable_report_delay_span_secs: i64,
}

impl Default for DelegateConfig {
    fn default() -> Self {
        Self {
            max_sources_per_origin: 1024,
            max_event_level_reports_per_destination: 1024,
            max_aggregatable_reports_per_destination: 1024,
            max_aggregatable_reports_per_source: 20,
            aggregatable_budget_per_source: 65_536,
            delete_expired_sources_frequency_secs: 300,
            rate_limit_window_days: 30,
            max_source_registration_reporting_origins: 100,
            max_attribution_reporting_origins: 10,
            max_attributions_per_window: 100,
            navigation_randomized_response_rate: 0.0024,
            event_randomized_response_rate: 0.000_002_5,
            null_aggregatable_report_rate: 0.05,
            aggregatable_report_min_delay_secs: 600,
            aggregatable_report_delay_span_secs: 3000,
        }
    }
}

impl DelegateConfig {
    /// # Errors
    /// Returns [`AttributionError::Configuration`] when limits are zero,
    /// rates fall outside [0.0, 1.0], or durations are negative.
    pub fn validate(&self) -> Result<(), AttributionError> {
        for (name, value) in [
            ("max_sources_per_origin", self.max_sources_per_origin),
            (
                "max_event_level_reports_per_destination",
                self.max_event_level_reports_per_destination,
            ),
            (
                "max_aggregatable_reports_per_destination",
                self.max_aggregatable_reports_per_destination,
            ),
            (
                "max_aggregatable_reports_per_source",
                self.max_aggregatable_reports_per_source,
            ),
            (
                "max_source_registration_reporting_origins",
                self.max_source_registration_reporting_origins,
            ),
            (
                "max_attribution_reporting_origins",
                self.max_attribution_reporting_origins,
            ),
            ("max_attributions_per_window", self.max_attributions_per_window),
        ] {
            if value == 0 {
                return Err(AttributionError::Configuration(format!(
                    "{name} MUST be >= 1"
                )));
            }
        }

        for (name, value) in [
            (
                "navigation_randomized_response_rate",
                self.navigation_randomized_response_rate,
            ),
            (
                "event_randomized_response_rate",
                self.event_randomized_response_rate,
            ),
            (
                "null_aggregatable_report_rate",
                self.null_aggregatable_report_rate,
            ),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(AttributionError::Configuration(format!(
                    "{name} MUST be in [0.0, 1.0]"
                )));
            }
        }

        if self.aggregatable_budget_per_source <= 0 {
            return Err(AttributionError::Configuration(
                "aggregatable_budget_per_source MUST be > 0".to_string(),
            ));
        }

        if self.delete_expired_sources_frequency_secs < 0
            || self.aggregatable_report_min_delay_secs < 0
            || self.aggregatable_report_delay_span_secs < 0
        {
            return Err(AttributionError::Configuration(
                "durations MUST be >= 0".to_string(),
            ));
        }

        if !(1..=MAX_RATE_LIMIT_WINDOW_DAYS).contains(&self.rate_limit_window_days) {
            return Err(AttributionError::Configuration(format!(
                "rate_limit_window_days MUST be in 1..={MAX_RATE_LIMIT_WINDOW_DAYS}"
            )));
        }

        for (name, value) in [
            (
                "aggregatable_report_min_delay_secs",
                self.aggregatable_report_min_delay_secs,
            ),
            (
                "aggregatable_report_delay_span_secs",
                self.aggregatable_report_delay_span_secs,
            ),
        ] {
            if value > MAX_AGGREGATABLE_REPORT_DELAY_SECS {
                return Err(AttributionError::Configuration(format!(
                    "{name} MUST be <= {MAX_AGGREGATABLE_REPORT_DELAY_SECS}"
                )));
            }
        }

        Ok(())
    }

    /// Decodes and validates a delegate configuration from JSON.
    ///
    /// # Errors
    /// Returns [`AttributionError::Configuration`] when decoding or
    /// validation fails.
    pub fn from_json(value: &Value) -> Result<Self, AttributionError> {
        let config: Self = serde_json::from_value(value.clone()).map_err(|err| {
            AttributionError::Configuration(format!("invalid delegate config JSON payload: {err}"))
        })?;
        config.validate()?;
        Ok(config)
    }

    #[must_use]
    pub fn rate_limits(&self) -> RateLimitConfig {
        RateLimitConfig {
            time_window: Duration::seconds(self.rate_limit_window_days.saturating_mul(86_400)),
            max_source_registration_reporting_origins: self
                .max_source_registration_reporting_origins,
            max_attribution_reporting_origins: self.max_attribution_reporting_origins,
            max_attributions: self.max_attributions_per_window,
        }
    }

    #[must_use]
    pub fn delete_expired_sources_frequency(&self) -> Duration {
        Duration::seconds(self.delete_expired_sources_frequency_secs)
    }
}
