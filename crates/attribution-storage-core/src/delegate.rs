use std::cmp::Ordering;

use parking_lot::Mutex;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::timestamps::saturating_add;
use crate::{
    AttributionReport, AttributionTrigger, DelegateConfig, EventReportWindows, ReportType,
    SourceRegistrationTimeConfig, SourceType, StoredSource, TriggerVerification, WindowStatus,
};

/// External report id handed out by [`ConfigurableStorageDelegate`].
pub const DEFAULT_EXTERNAL_REPORT_ID: Uuid =
    Uuid::from_u128(0x21ab_d97f_73e8_4b88_9389_a9fe_e6ab_da5e);

const NULL_REPORT_LOOKBACK_DAYS: i64 = 30;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub time_window: Duration,
    pub max_source_registration_reporting_origins: usize,
    pub max_attribution_reporting_origins: usize,
    pub max_attributions: usize,
}

impl RateLimitConfig {
    #[must_use]
    pub fn unlimited() -> Self {
        Self {
            time_window: Duration::MAX,
            max_source_registration_reporting_origins: usize::MAX,
            max_attribution_reporting_origins: usize::MAX,
            max_attributions: usize::MAX,
        }
    }
}

/// A fabricated event-level report produced by randomized response.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct FakeReport {
    pub trigger_data: u64,
    pub trigger_time: OffsetDateTime,
    pub report_time: OffsetDateTime,
}

/// `None` means the source is attributed truthfully. `Some(vec![])` means it is
/// never attributed; a non-empty list replaces real attribution with those reports.
pub type RandomizedResponse = Option<Vec<FakeReport>>;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct NullAggregatableReport {
    pub fake_source_time: OffsetDateTime,
}

/// Policy consulted by storage on every call. Implementations may change their
/// answers between calls.
pub trait StorageDelegate: Send + Sync {
    fn max_sources_per_origin(&self) -> usize;

    fn max_reports_per_destination(&self, report_type: ReportType) -> usize;

    fn max_aggregatable_reports_per_source(&self) -> usize;

    fn aggregatable_budget_per_source(&self) -> i64;

    fn delete_expired_sources_frequency(&self) -> Duration;

    fn rate_limits(&self) -> RateLimitConfig;

    fn event_level_report_time(
        &self,
        source: &StoredSource,
        trigger_time: OffsetDateTime,
    ) -> OffsetDateTime;

    fn aggregatable_report_time(&self, trigger_time: OffsetDateTime) -> OffsetDateTime;

    fn randomized_response_rate(
        &self,
        source_type: SourceType,
        windows: &EventReportWindows,
        max_event_level_reports: u32,
    ) -> f64;

    fn randomized_response(
        &self,
        source_type: SourceType,
        windows: &EventReportWindows,
        max_event_level_reports: u32,
        source_time: OffsetDateTime,
    ) -> RandomizedResponse;

    fn null_aggregatable_reports(
        &self,
        trigger: &AttributionTrigger,
        trigger_time: OffsetDateTime,
        attributed_source_time: Option<OffsetDateTime>,
    ) -> Vec<NullAggregatableReport>;

    fn new_report_id(&self) -> Uuid;

    /// Reorders aggregatable reports that are about to be stored. Their ids
    /// are not assigned yet.
    fn shuffle_reports(&self, reports: &mut [AttributionReport]);

    fn shuffle_verifications(&self, verifications: &mut [TriggerVerification]);

    /// Ranks candidate sources for a trigger; `Ordering::Less` means `a` wins.
    fn compare_sources(&self, a: &StoredSource, b: &StoredSource) -> Ordering {
        b.priority
            .cmp(&a.priority)
            .then_with(|| b.source_time.cmp(&a.source_time))
            .then_with(|| b.source_id.cmp(&a.source_id))
    }
}

/// Production policy driven by [`DelegateConfig`].
#[derive(Debug, Clone, Default)]
pub struct DefaultStorageDelegate {
    config: DelegateConfig,
}

impl DefaultStorageDelegate {
    #[must_use]
    pub fn new(config: DelegateConfig) -> Self {
        Self { config }
    }

    #[must_use]
    pub fn config(&self) -> &DelegateConfig {
        &self.config
    }
}

impl StorageDelegate for DefaultStorageDelegate {
    fn max_sources_per_origin(&self) -> usize {
        self.config.max_sources_per_origin
    }

    fn max_reports_per_destination(&self, report_type: ReportType) -> usize {
        match report_type {
            ReportType::EventLevel => self.config.max_event_level_reports_per_destination,
            ReportType::AggregatableAttribution | ReportType::NullAggregatable => {
                self.config.max_aggregatable_reports_per_destination
            }
        }
    }

    fn max_aggregatable_reports_per_source(&self) -> usize {
        self.config.max_aggregatable_reports_per_source
    }

    fn aggregatable_budget_per_source(&self) -> i64 {
        self.config.aggregatable_budget_per_source
    }

    fn delete_expired_sources_frequency(&self) -> Duration {
        self.config.delete_expired_sources_frequency()
    }

    fn rate_limits(&self) -> RateLimitConfig {
        self.config.rate_limits()
    }

    fn event_level_report_time(
        &self,
        source: &StoredSource,
        trigger_time: OffsetDateTime,
    ) -> OffsetDateTime {
        match source
            .event_report_windows
            .status_for(trigger_time - source.source_time)
        {
            WindowStatus::Within { window_end } => saturating_add(source.source_time, window_end),
            WindowStatus::NotStarted | WindowStatus::Passed => trigger_time,
        }
    }

    fn aggregatable_report_time(&self, trigger_time: OffsetDateTime) -> OffsetDateTime {
        let span = self.config.aggregatable_report_delay_span_secs.max(0);
        let jitter = if span == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..span)
        };
        saturating_add(
            trigger_time,
            Duration::seconds(
                self.config
                    .aggregatable_report_min_delay_secs
                    .max(0)
                    .saturating_add(jitter),
            ),
        )
    }

    fn randomized_response_rate(
        &self,
        source_type: SourceType,
        _windows: &EventReportWindows,
        _max_event_level_reports: u32,
    ) -> f64 {
        match source_type {
            SourceType::Navigation => self.config.navigation_randomized_response_rate,
            SourceType::Event => self.config.event_randomized_response_rate,
        }
    }

    fn randomized_response(
        &self,
        source_type: SourceType,
        windows: &EventReportWindows,
        max_event_level_reports: u32,
        source_time: OffsetDateTime,
    ) -> RandomizedResponse {
        let rate = self
            .randomized_response_rate(source_type, windows, max_event_level_reports)
            .clamp(0.0, 1.0);
        let mut rng = rand::thread_rng();
        if !rng.gen_bool(rate) {
            return None;
        }
        if windows.end_times.is_empty() {
            return Some(Vec::new());
        }

        let count = rng.gen_range(0..=max_event_level_reports);
        let reports = (0..count)
            .map(|_| {
                let window_end = windows.end_times[rng.gen_range(0..windows.end_times.len())];
                FakeReport {
                    trigger_data: rng.gen_range(0..source_type.trigger_data_cardinality()),
                    trigger_time: saturating_add(source_time, windows.start_time),
                    report_time: saturating_add(source_time, window_end),
                }
            })
            .collect();
        Some(reports)
    }

    fn null_aggregatable_reports(
        &self,
        trigger: &AttributionTrigger,
        trigger_time: OffsetDateTime,
        attributed_source_time: Option<OffsetDateTime>,
    ) -> Vec<NullAggregatableReport> {
        let rate = self.config.null_aggregatable_report_rate.clamp(0.0, 1.0);
        let mut rng = rand::thread_rng();

        match trigger.registration.source_registration_time_config {
            SourceRegistrationTimeConfig::Exclude => {
                if attributed_source_time.is_none() && rng.gen_bool(rate) {
                    vec![NullAggregatableReport {
                        fake_source_time: trigger_time,
                    }]
                } else {
                    Vec::new()
                }
            }
            SourceRegistrationTimeConfig::Include => {
                let attributed_day = attributed_source_time
                    .map(|source_time| (trigger_time - source_time).whole_days());
                (0..=NULL_REPORT_LOOKBACK_DAYS)
                    .filter(|day| Some(*day) != attributed_day)
                    .filter(|_| rng.gen_bool(rate))
                    .map(|day| NullAggregatableReport {
                        fake_source_time: trigger_time - Duration::days(day),
                    })
                    .collect()
            }
        }
    }

    fn new_report_id(&self) -> Uuid {
        Uuid::new_v4()
    }

    fn shuffle_reports(&self, reports: &mut [AttributionReport]) {
        reports.shuffle(&mut rand::thread_rng());
    }

    fn shuffle_verifications(&self, verifications: &mut [TriggerVerification]) {
        verifications.shuffle(&mut rand::thread_rng());
    }
}

#[derive(Debug, Clone)]
struct ConfigurableState {
    max_sources_per_origin: usize,
    max_event_level_reports_per_destination: usize,
    max_aggregatable_reports_per_destination: usize,
    max_aggregatable_reports_per_source: usize,
    aggregatable_budget_per_source: i64,
    delete_expired_sources_frequency: Duration,
    rate_limits: RateLimitConfig,
    report_delay: Duration,
    randomized_response_rate: f64,
    randomized_response: RandomizedResponse,
    null_aggregatable_reports: Vec<NullAggregatableReport>,
    reverse_reports_on_shuffle: bool,
    reverse_verifications_on_shuffle: bool,
}

impl Default for ConfigurableState {
    fn default() -> Self {
        Self {
            max_sources_per_origin: usize::MAX,
            max_event_level_reports_per_destination: usize::MAX,
            max_aggregatable_reports_per_destination: usize::MAX,
            max_aggregatable_reports_per_source: usize::MAX,
            aggregatable_budget_per_source: 65_536,
            delete_expired_sources_frequency: Duration::ZERO,
            rate_limits: RateLimitConfig::unlimited(),
            report_delay: Duration::ZERO,
            randomized_response_rate: 0.0,
            randomized_response: None,
            null_aggregatable_reports: Vec::new(),
            reverse_reports_on_shuffle: false,
            reverse_verifications_on_shuffle: false,
        }
    }
}

/// Deterministic delegate whose answers are set explicitly. Shared through an
/// `Arc` so settings can change while storage holds it.
#[derive(Debug, Default)]
pub struct ConfigurableStorageDelegate {
    state: Mutex<ConfigurableState>,
}

impl ConfigurableStorageDelegate {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn from_config(config: &DelegateConfig) -> Self {
        let delegate = Self::new();
        {
            let mut state = delegate.state.lock();
            state.max_sources_per_origin = config.max_sources_per_origin;
            state.max_event_level_reports_per_destination =
                config.max_event_level_reports_per_destination;
            state.max_aggregatable_reports_per_destination =
                config.max_aggregatable_reports_per_destination;
            state.max_aggregatable_reports_per_source = config.max_aggregatable_reports_per_source;
            state.aggregatable_budget_per_source = config.aggregatable_budget_per_source;
            state.delete_expired_sources_frequency = config.delete_expired_sources_frequency();
            state.rate_limits = config.rate_limits();
        }
        delegate
    }

    pub fn set_max_sources_per_origin(&self, max: usize) {
        self.state.lock().max_sources_per_origin = max;
    }

    pub fn set_max_reports_per_destination(&self, report_type: ReportType, max: usize) {
        let mut state = self.state.lock();
        match report_type {
            ReportType::EventLevel => state.max_event_level_reports_per_destination = max,
            ReportType::AggregatableAttribution | ReportType::NullAggregatable => {
                state.max_aggregatable_reports_per_destination = max;
            }
        }
    }

    pub fn set_max_aggregatable_reports_per_source(&self, max: usize) {
        self.state.lock().max_aggregatable_reports_per_source = max;
    }

    pub fn set_aggregatable_budget_per_source(&self, budget: i64) {
        self.state.lock().aggregatable_budget_per_source = budget;
    }

    pub fn set_delete_expired_sources_frequency(&self, frequency: Duration) {
        self.state.lock().delete_expired_sources_frequency = frequency;
    }

    pub fn set_rate_limits(&self, rate_limits: RateLimitConfig) {
        self.state.lock().rate_limits = rate_limits;
    }

    pub fn set_report_delay(&self, delay: Duration) {
        self.state.lock().report_delay = delay;
    }

    pub fn set_randomized_response_rate(&self, rate: f64) {
        self.state.lock().randomized_response_rate = rate;
    }

    pub fn set_randomized_response(&self, response: RandomizedResponse) {
        self.state.lock().randomized_response = response;
    }

    pub fn set_null_aggregatable_reports(&self, reports: Vec<NullAggregatableReport>) {
        self.state.lock().null_aggregatable_reports = reports;
    }

    pub fn set_reverse_reports_on_shuffle(&self, reverse: bool) {
        self.state.lock().reverse_reports_on_shuffle = reverse;
    }

    pub fn set_reverse_verifications_on_shuffle(&self, reverse: bool) {
        self.state.lock().reverse_verifications_on_shuffle = reverse;
    }
}

impl StorageDelegate for ConfigurableStorageDelegate {
    fn max_sources_per_origin(&self) -> usize {
        self.state.lock().max_sources_per_origin
    }

    fn max_reports_per_destination(&self, report_type: ReportType) -> usize {
        let state = self.state.lock();
        match report_type {
            ReportType::EventLevel => state.max_event_level_reports_per_destination,
            ReportType::AggregatableAttribution | ReportType::NullAggregatable => {
                state.max_aggregatable_reports_per_destination
            }
        }
    }

    fn max_aggregatable_reports_per_source(&self) -> usize {
        self.state.lock().max_aggregatable_reports_per_source
    }

    fn aggregatable_budget_per_source(&self) -> i64 {
        self.state.lock().aggregatable_budget_per_source
    }

    fn delete_expired_sources_frequency(&self) -> Duration {
        self.state.lock().delete_expired_sources_frequency
    }

    fn rate_limits(&self) -> RateLimitConfig {
        self.state.lock().rate_limits
    }

    fn event_level_report_time(
        &self,
        _source: &StoredSource,
        trigger_time: OffsetDateTime,
    ) -> OffsetDateTime {
        saturating_add(trigger_time, self.state.lock().report_delay)
    }

    fn aggregatable_report_time(&self, trigger_time: OffsetDateTime) -> OffsetDateTime {
        saturating_add(trigger_time, self.state.lock().report_delay)
    }

    fn randomized_response_rate(
        &self,
        _source_type: SourceType,
        _windows: &EventReportWindows,
        _max_event_level_reports: u32,
    ) -> f64 {
        self.state.lock().randomized_response_rate
    }

    fn randomized_response(
        &self,
        _source_type: SourceType,
        _windows: &EventReportWindows,
        _max_event_level_reports: u32,
        _source_time: OffsetDateTime,
    ) -> RandomizedResponse {
        self.state.lock().randomized_response.clone()
    }

    fn null_aggregatable_reports(
        &self,
        _trigger: &AttributionTrigger,
        _trigger_time: OffsetDateTime,
        _attributed_source_time: Option<OffsetDateTime>,
    ) -> Vec<NullAggregatableReport> {
        self.state.lock().null_aggregatable_reports.clone()
    }

    fn new_report_id(&self) -> Uuid {
        DEFAULT_EXTERNAL_REPORT_ID
    }

    fn shuffle_reports(&self, reports: &mut [AttributionReport]) {
        if self.state.lock().reverse_reports_on_shuffle {
            reports.reverse();
        }
    }

    fn shuffle_verifications(&self, verifications: &mut [TriggerVerification]) {
        if self.state.lock().reverse_verifications_on_shuffle {
            verifications.reverse();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{SchemefulSite, SuitableOrigin};

    fn must<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    #[test]
    fn default_external_report_id_matches_literal() {
        assert_eq!(
            DEFAULT_EXTERNAL_REPORT_ID.to_string(),
            "21abd97f-73e8-4b88-9389-a9fee6abda5e"
        );
    }

    #[test]
    fn configurable_delegate_reverses_when_asked() {
        let delegate = ConfigurableStorageDelegate::new();
        let mut verifications = vec![
            TriggerVerification {
                token: "a".to_string(),
                aggregatable_report_id: Uuid::nil(),
            },
            TriggerVerification {
                token: "b".to_string(),
                aggregatable_report_id: Uuid::nil(),
            },
        ];
        delegate.shuffle_verifications(&mut verifications);
        assert_eq!(verifications[0].token, "a");
        delegate.set_reverse_verifications_on_shuffle(true);
        delegate.shuffle_verifications(&mut verifications);
        assert_eq!(verifications[0].token, "b");
    }

    #[test]
    fn configurable_delegate_answers_change_between_calls() {
        let delegate = ConfigurableStorageDelegate::new();
        assert_eq!(delegate.max_sources_per_origin(), usize::MAX);
        delegate.set_max_sources_per_origin(2);
        assert_eq!(delegate.max_sources_per_origin(), 2);
    }

    #[test]
    fn default_delegate_never_noises_at_zero_rate() {
        let delegate = DefaultStorageDelegate::new(DelegateConfig {
            navigation_randomized_response_rate: 0.0,
            ..DelegateConfig::default()
        });
        let windows = EventReportWindows::single(Duration::days(30));
        for _ in 0..32 {
            assert!(delegate
                .randomized_response(
                    SourceType::Navigation,
                    &windows,
                    3,
                    OffsetDateTime::UNIX_EPOCH
                )
                .is_none());
        }
    }

    #[test]
    fn default_delegate_report_time_saturates_on_unvalidated_delays() {
        let delegate = DefaultStorageDelegate::new(DelegateConfig {
            aggregatable_report_min_delay_secs: i64::MAX,
            aggregatable_report_delay_span_secs: i64::MAX,
            ..DelegateConfig::default()
        });
        let trigger_time = OffsetDateTime::UNIX_EPOCH;
        for _ in 0..8 {
            assert!(delegate.aggregatable_report_time(trigger_time) > trigger_time);
        }
    }

    #[test]
    fn default_delegate_fake_reports_fit_the_source() {
        let delegate = DefaultStorageDelegate::new(DelegateConfig {
            event_randomized_response_rate: 1.0,
            ..DelegateConfig::default()
        });
        let windows = EventReportWindows::single(Duration::days(30));
        let source_time = OffsetDateTime::UNIX_EPOCH;
        for _ in 0..32 {
            let Some(reports) =
                delegate.randomized_response(SourceType::Event, &windows, 1, source_time)
            else {
                panic!("rate 1.0 must always noise");
            };
            assert!(reports.len() <= 1);
            for report in reports {
                assert!(report.trigger_data < 2);
                assert_eq!(report.report_time, source_time + Duration::days(30));
            }
        }
    }

    #[test]
    fn default_delegate_skips_the_attributed_day_for_null_reports() {
        let delegate = DefaultStorageDelegate::new(DelegateConfig {
            null_aggregatable_report_rate: 1.0,
            ..DelegateConfig::default()
        });
        let trigger = AttributionTrigger::new(
            must(SuitableOrigin::parse("https://report.test")),
            must(SuitableOrigin::parse("https://conversion.test")),
        );
        let trigger_time = OffsetDateTime::UNIX_EPOCH + Duration::days(100);
        let reports = delegate.null_aggregatable_reports(
            &trigger,
            trigger_time,
            Some(trigger_time - Duration::days(2)),
        );
        assert_eq!(reports.len(), 30);
        assert!(reports
            .iter()
            .all(|report| report.fake_source_time != trigger_time - Duration::days(2)));
        assert_eq!(
            must(SchemefulSite::parse("https://conversion.test")),
            trigger.destination_site()
        );
    }

    #[test]
    fn default_comparator_prefers_priority_then_recency() {
        let delegate = ConfigurableStorageDelegate::new();
        let origin = must(SuitableOrigin::parse("https://impression.test"));
        let base = StoredSource {
            source_id: crate::SourceId(1),
            source_event_id: 0,
            source_origin: origin.clone(),
            reporting_origin: origin,
            source_type: SourceType::Navigation,
            destination_sites: std::collections::BTreeSet::new(),
            source_time: OffsetDateTime::UNIX_EPOCH,
            expiry_time: OffsetDateTime::UNIX_EPOCH + Duration::days(30),
            event_report_windows: EventReportWindows::single(Duration::days(30)),
            aggregatable_report_window_time: OffsetDateTime::UNIX_EPOCH + Duration::days(30),
            max_event_level_reports: 3,
            priority: 0,
            filter_data: crate::FilterData::default(),
            debug_key: None,
            aggregation_keys: crate::AggregationKeys::new(),
            attribution_logic: crate::AttributionLogic::Truthfully,
            active_state: crate::ActiveState::Active,
            num_attributions: 0,
            num_aggregatable_reports: 0,
            aggregatable_budget_consumed: 0,
            randomized_response_rate: 0.0,
            dedup_keys: Vec::new(),
            aggregatable_dedup_keys: Vec::new(),
            debug_reporting: false,
            is_within_fenced_frame: false,
        };
        let newer = StoredSource {
            source_id: crate::SourceId(2),
            source_time: base.source_time + Duration::seconds(1),
            ..base.clone()
        };
        let higher = StoredSource {
            source_id: crate::SourceId(3),
            priority: 5,
            ..base.clone()
        };
        assert_eq!(delegate.compare_sources(&newer, &base), Ordering::Less);
        assert_eq!(delegate.compare_sources(&higher, &newer), Ordering::Less);
    }
}
