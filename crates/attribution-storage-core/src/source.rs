use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};

use crate::timestamps::MAX_SOURCE_EXPIRY;
use crate::{AttributionError, FilterData, SchemefulSite, SuitableOrigin};

const MAX_DESTINATIONS_PER_SOURCE: usize = 3;
const MAX_EVENT_LEVEL_REPORTS_LIMIT: u32 = 20;
const MAX_AGGREGATION_KEYS_PER_SOURCE: usize = 20;
const MAX_BYTES_PER_AGGREGATION_KEY_ID: usize = 25;
const MAX_EVENT_REPORT_WINDOWS: usize = 5;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct SourceId(pub i64);

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    Navigation,
    Event,
}

impl SourceType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Navigation => "navigation",
            Self::Event => "event",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "navigation" => Some(Self::Navigation),
            "event" => Some(Self::Event),
            _ => None,
        }
    }

    /// Trigger data is reduced modulo this value before it is reported.
    #[must_use]
    pub fn trigger_data_cardinality(self) -> u64 {
        match self {
            Self::Navigation => 8,
            Self::Event => 2,
        }
    }

    #[must_use]
    pub fn default_max_event_level_reports(self) -> u32 {
        match self {
            Self::Navigation => 3,
            Self::Event => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ActiveState {
    Active,
    ReachedEventLevelAttributionLimit,
    Inactive,
}

impl ActiveState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::ReachedEventLevelAttributionLimit => "reached_event_level_attribution_limit",
            Self::Inactive => "inactive",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(Self::Active),
            "reached_event_level_attribution_limit" => {
                Some(Self::ReachedEventLevelAttributionLimit)
            }
            "inactive" => Some(Self::Inactive),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AttributionLogic {
    Never,
    Truthfully,
    Falsely,
}

impl AttributionLogic {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Never => "never",
            Self::Truthfully => "truthfully",
            Self::Falsely => "falsely",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "never" => Some(Self::Never),
            "truthfully" => Some(Self::Truthfully),
            "falsely" => Some(Self::Falsely),
            _ => None,
        }
    }
}

/// A 128-bit histogram bucket key, persisted as two 64-bit halves.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct AggregationKey {
    pub high_bits: u64,
    pub low_bits: u64,
}

impl AggregationKey {
    #[must_use]
    pub fn new(high_bits: u64, low_bits: u64) -> Self {
        Self {
            high_bits,
            low_bits,
        }
    }

    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn from_u128(value: u128) -> Self {
        Self {
            high_bits: (value >> 64) as u64,
            low_bits: value as u64,
        }
    }

    #[must_use]
    pub fn as_u128(self) -> u128 {
        (u128::from(self.high_bits) << 64) | u128::from(self.low_bits)
    }

    #[must_use]
    pub fn combine(self, other: Self) -> Self {
        Self::from_u128(self.as_u128() | other.as_u128())
    }
}

pub type AggregationKeys = BTreeMap<String, AggregationKey>;

/// Event-level reporting windows as offsets from the source time.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct EventReportWindows {
    pub start_time: Duration,
    pub end_times: Vec<Duration>,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum WindowStatus {
    NotStarted,
    Within { window_end: Duration },
    Passed,
}

impl EventReportWindows {
    #[must_use]
    pub fn single(end_time: Duration) -> Self {
        Self {
            start_time: Duration::ZERO,
            end_times: vec![end_time],
        }
    }

    /// Checks ordering and bounds of the window schedule.
    ///
    /// # Errors
    /// Returns [`AttributionError::Validation`] when windows are empty,
    /// unordered, or start before zero.
    pub fn validate(&self) -> Result<(), AttributionError> {
        if self.start_time.is_negative() {
            return Err(AttributionError::Validation(
                "event report window start_time MUST be >= 0".to_string(),
            ));
        }
        if self.end_times.is_empty() || self.end_times.len() > MAX_EVENT_REPORT_WINDOWS {
            return Err(AttributionError::Validation(format!(
                "event report windows MUST have 1..={MAX_EVENT_REPORT_WINDOWS} end times"
            )));
        }

        let mut previous = self.start_time;
        for end in &self.end_times {
            if *end <= previous {
                return Err(AttributionError::Validation(
                    "event report window end times MUST be strictly increasing and after start_time"
                        .to_string(),
                ));
            }
            previous = *end;
        }

        Ok(())
    }

    /// Drops windows ending after `expiry` and ends the schedule at `expiry`.
    #[must_use]
    pub fn clamped_to(&self, expiry: Duration) -> Self {
        let mut end_times: Vec<Duration> = self
            .end_times
            .iter()
            .copied()
            .filter(|end| *end < expiry)
            .collect();
        if end_times.len() < self.end_times.len() {
            end_times.push(expiry);
        }
        Self {
            start_time: self.start_time,
            end_times,
        }
    }

    #[must_use]
    pub fn last_end(&self) -> Option<Duration> {
        self.end_times.last().copied()
    }

    #[must_use]
    pub fn status_for(&self, elapsed: Duration) -> WindowStatus {
        if elapsed < self.start_time {
            return WindowStatus::NotStarted;
        }
        self.end_times
            .iter()
            .find(|end| elapsed < **end)
            .map_or(WindowStatus::Passed, |end| WindowStatus::Within { window_end: *end })
    }
}

/// Registration payload supplied by the reporting origin.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SourceRegistration {
    pub destinations: BTreeSet<SchemefulSite>,
    pub source_event_id: u64,
    pub expiry: Duration,
    pub event_report_windows: Option<EventReportWindows>,
    pub aggregatable_report_window: Option<Duration>,
    pub max_event_level_reports: Option<u32>,
    pub priority: i64,
    pub filter_data: FilterData,
    pub debug_key: Option<u64>,
    pub aggregation_keys: AggregationKeys,
    pub debug_reporting: bool,
}

impl SourceRegistration {
    #[must_use]
    pub fn new(destination: SchemefulSite) -> Self {
        Self {
            destinations: BTreeSet::from([destination]),
            source_event_id: 0,
            expiry: MAX_SOURCE_EXPIRY,
            event_report_windows: None,
            aggregatable_report_window: None,
            max_event_level_reports: None,
            priority: 0,
            filter_data: FilterData::default(),
            debug_key: None,
            aggregation_keys: AggregationKeys::new(),
            debug_reporting: false,
        }
    }

    /// Validates a registration before it is stored.
    ///
    /// # Errors
    /// Returns [`AttributionError::Validation`] when destinations, lifetimes,
    /// report windows or aggregation keys are out of bounds.
    pub fn validate(&self) -> Result<(), AttributionError> {
        if self.destinations.is_empty() || self.destinations.len() > MAX_DESTINATIONS_PER_SOURCE {
            return Err(AttributionError::Validation(format!(
                "destinations MUST contain 1..={MAX_DESTINATIONS_PER_SOURCE} sites"
            )));
        }

        if !self.expiry.is_positive() || self.expiry > MAX_SOURCE_EXPIRY {
            return Err(AttributionError::Validation(
                "expiry MUST be in (0, 30 days]".to_string(),
            ));
        }

        if let Some(window) = self.aggregatable_report_window {
            if !window.is_positive() || window > MAX_SOURCE_EXPIRY {
                return Err(AttributionError::Validation(
                    "aggregatable_report_window MUST be in (0, 30 days]".to_string(),
                ));
            }
        }

        if let Some(windows) = &self.event_report_windows {
            windows.validate()?;
            if windows.start_time >= self.expiry {
                return Err(AttributionError::Validation(
                    "event report windows MUST start before expiry".to_string(),
                ));
            }
        }

        if let Some(max) = self.max_event_level_reports {
            if max > MAX_EVENT_LEVEL_REPORTS_LIMIT {
                return Err(AttributionError::Validation(format!(
                    "max_event_level_reports MUST be <= {MAX_EVENT_LEVEL_REPORTS_LIMIT}"
                )));
            }
        }

        if self.aggregation_keys.len() > MAX_AGGREGATION_KEYS_PER_SOURCE {
            return Err(AttributionError::Validation(format!(
                "aggregation_keys MUST have at most {MAX_AGGREGATION_KEYS_PER_SOURCE} entries"
            )));
        }
        if self
            .aggregation_keys
            .keys()
            .any(|id| id.len() > MAX_BYTES_PER_AGGREGATION_KEY_ID)
        {
            return Err(AttributionError::Validation(
                "aggregation key ids MUST be at most 25 bytes".to_string(),
            ));
        }

        Ok(())
    }

    /// Window schedule after defaults and clamping to expiry.
    #[must_use]
    pub fn effective_event_report_windows(&self) -> EventReportWindows {
        match &self.event_report_windows {
            Some(windows) => windows.clamped_to(self.expiry),
            None => EventReportWindows::single(self.expiry),
        }
    }

    #[must_use]
    pub fn effective_aggregatable_report_window(&self) -> Duration {
        self.aggregatable_report_window
            .map_or(self.expiry, |window| window.min(self.expiry))
    }
}

/// A source as presented to storage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StorableSource {
    pub source_origin: SuitableOrigin,
    pub reporting_origin: SuitableOrigin,
    pub source_type: SourceType,
    pub registration: SourceRegistration,
    pub is_within_fenced_frame: bool,
}

impl StorableSource {
    /// # Errors
    /// Returns [`AttributionError::Validation`] when the registration is invalid.
    pub fn validate(&self) -> Result<(), AttributionError> {
        self.registration.validate()
    }

    #[must_use]
    pub fn source_site(&self) -> SchemefulSite {
        self.source_origin.site()
    }

    #[must_use]
    pub fn max_event_level_reports(&self) -> u32 {
        self.registration
            .max_event_level_reports
            .unwrap_or_else(|| self.source_type.default_max_event_level_reports())
    }
}

/// A source read back from storage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoredSource {
    pub source_id: SourceId,
    pub source_event_id: u64,
    pub source_origin: SuitableOrigin,
    pub reporting_origin: SuitableOrigin,
    pub source_type: SourceType,
    pub destination_sites: BTreeSet<SchemefulSite>,
    pub source_time: OffsetDateTime,
    pub expiry_time: OffsetDateTime,
    pub event_report_windows: EventReportWindows,
    pub aggregatable_report_window_time: OffsetDateTime,
    pub max_event_level_reports: u32,
    pub priority: i64,
    pub filter_data: FilterData,
    pub debug_key: Option<u64>,
    pub aggregation_keys: AggregationKeys,
    pub attribution_logic: AttributionLogic,
    pub active_state: ActiveState,
    pub num_attributions: u32,
    pub num_aggregatable_reports: u32,
    pub aggregatable_budget_consumed: i64,
    pub randomized_response_rate: f64,
    pub dedup_keys: Vec<u64>,
    pub aggregatable_dedup_keys: Vec<u64>,
    pub debug_reporting: bool,
    pub is_within_fenced_frame: bool,
}

impl StoredSource {
    #[must_use]
    pub fn source_site(&self) -> SchemefulSite {
        self.source_origin.site()
    }

    #[must_use]
    pub fn is_expired_at(&self, now: OffsetDateTime) -> bool {
        self.expiry_time <= now
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn must<T>(result: Result<T, AttributionError>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    fn fixture_registration() -> SourceRegistration {
        SourceRegistration::new(must(SchemefulSite::parse("https://conversion.test")))
    }

    #[test]
    fn default_registration_is_valid() {
        must(fixture_registration().validate());
    }

    #[test]
    fn expiry_bounds_are_enforced() {
        let mut registration = fixture_registration();
        registration.expiry = Duration::ZERO;
        assert!(registration.validate().is_err());
        registration.expiry = MAX_SOURCE_EXPIRY + Duration::milliseconds(1);
        assert!(registration.validate().is_err());
        registration.expiry = Duration::milliseconds(1);
        must(registration.validate());
    }

    #[test]
    fn destinations_are_required() {
        let mut registration = fixture_registration();
        registration.destinations.clear();
        assert!(registration.validate().is_err());
    }

    #[test]
    fn windows_are_clamped_to_expiry() {
        let mut registration = fixture_registration();
        registration.expiry = Duration::days(4);
        registration.event_report_windows = Some(EventReportWindows {
            start_time: Duration::ZERO,
            end_times: vec![Duration::days(2), Duration::days(7), Duration::days(30)],
        });
        registration.aggregatable_report_window = Some(Duration::days(10));

        let windows = registration.effective_event_report_windows();
        assert_eq!(windows.end_times, vec![Duration::days(2), Duration::days(4)]);
        assert_eq!(
            registration.effective_aggregatable_report_window(),
            Duration::days(4)
        );
    }

    #[test]
    fn window_status_tracks_elapsed_time() {
        let windows = EventReportWindows {
            start_time: Duration::hours(1),
            end_times: vec![Duration::days(2), Duration::days(7)],
        };
        must(windows.validate());
        assert_eq!(windows.status_for(Duration::ZERO), WindowStatus::NotStarted);
        assert_eq!(
            windows.status_for(Duration::days(3)),
            WindowStatus::Within {
                window_end: Duration::days(7)
            }
        );
        assert_eq!(windows.status_for(Duration::days(7)), WindowStatus::Passed);
    }

    #[test]
    fn unordered_windows_are_rejected() {
        let windows = EventReportWindows {
            start_time: Duration::ZERO,
            end_times: vec![Duration::days(2), Duration::days(1)],
        };
        assert!(windows.validate().is_err());
    }

    #[test]
    fn default_max_event_level_reports_depends_on_type() {
        assert_eq!(SourceType::Navigation.default_max_event_level_reports(), 3);
        assert_eq!(SourceType::Event.default_max_event_level_reports(), 1);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        #[test]
        fn aggregation_key_halves_recompose(value in any::<u128>()) {
            let key = AggregationKey::from_u128(value);
            prop_assert_eq!(key.as_u128(), value);
            prop_assert_eq!(u128::from(key.low_bits), value & u128::from(u64::MAX));
        }
    }
}
