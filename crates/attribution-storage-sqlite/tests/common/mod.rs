#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Display;
use std::path::Path;
use std::sync::Arc;

use attribution_storage_core::{
    AggregatableDedupKey, AggregatableTriggerData, AggregationKey, AggregationKeys,
    AttributionTrigger, ConfigurableStorageDelegate, EventReportWindows, EventTriggerData,
    FilterData, FilterPair, SchemefulSite, SimulatedClock, SourceRegistration, SourceType,
    StorableSource, StorageConfig, StorageDelegate, SuitableOrigin, TriggerVerification,
};
use attribution_storage_sqlite::AttributionStorageSql;
use rusqlite::Connection;
use tempfile::TempDir;
use time::Duration;
use uuid::Uuid;

pub const IMPRESSION_ORIGIN: &str = "https://impression.test";
pub const CONVERSION_ORIGIN: &str = "https://sub.conversion.test";
pub const REPORTING_ORIGIN: &str = "https://report.test";

pub fn must<T, E: Display>(result: Result<T, E>) -> T {
    match result {
        Ok(value) => value,
        Err(err) => panic!("test failure: {err}"),
    }
}

pub fn origin(raw: &str) -> SuitableOrigin {
    must(SuitableOrigin::parse(raw))
}

pub fn site(raw: &str) -> SchemefulSite {
    must(SchemefulSite::parse(raw))
}

/// Storage over a temporary directory with a deterministic delegate and a
/// simulated clock that tests can move.
pub struct Harness {
    pub dir: TempDir,
    pub config: StorageConfig,
    pub delegate: Arc<ConfigurableStorageDelegate>,
    pub clock: SimulatedClock,
    pub storage: AttributionStorageSql,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(StorageConfig::default())
    }

    pub fn with_config(config: StorageConfig) -> Self {
        let dir = must(tempfile::tempdir());
        let delegate = Arc::new(ConfigurableStorageDelegate::new());
        let clock = SimulatedClock::default();
        let storage = open_storage(dir.path(), &config, &delegate, &clock);
        Self {
            dir,
            config,
            delegate,
            clock,
            storage,
        }
    }

    /// Drops the engine and opens a new one over the same directory.
    pub fn reopen(&mut self) {
        self.storage = open_storage(self.dir.path(), &self.config, &self.delegate, &self.clock);
    }

    pub fn db_path(&self) -> std::path::PathBuf {
        self.dir.path().join(&self.config.database_file_name)
    }

    pub fn raw_connection(&self) -> Connection {
        must(Connection::open(self.db_path()))
    }

    pub fn row_count(&self, table: &str) -> i64 {
        let conn = self.raw_connection();
        must(conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
            row.get(0)
        }))
    }

    pub fn advance(&self, delta: Duration) {
        self.clock.advance(delta);
    }
}

fn open_storage(
    dir: &Path,
    config: &StorageConfig,
    delegate: &Arc<ConfigurableStorageDelegate>,
    clock: &SimulatedClock,
) -> AttributionStorageSql {
    let delegate: Arc<dyn StorageDelegate> = delegate.clone();
    must(AttributionStorageSql::new(
        dir,
        config.clone(),
        delegate,
        Arc::new(clock.clone()),
    ))
}

pub struct SourceBuilder {
    source_origin: SuitableOrigin,
    reporting_origin: SuitableOrigin,
    source_type: SourceType,
    registration: SourceRegistration,
}

impl SourceBuilder {
    pub fn new() -> Self {
        Self {
            source_origin: origin(IMPRESSION_ORIGIN),
            reporting_origin: origin(REPORTING_ORIGIN),
            source_type: SourceType::Navigation,
            registration: SourceRegistration::new(site(CONVERSION_ORIGIN)),
        }
    }

    pub fn source_event_id(mut self, source_event_id: u64) -> Self {
        self.registration.source_event_id = source_event_id;
        self
    }

    pub fn source_origin(mut self, raw: &str) -> Self {
        self.source_origin = origin(raw);
        self
    }

    pub fn reporting_origin(mut self, raw: &str) -> Self {
        self.reporting_origin = origin(raw);
        self
    }

    pub fn destination(mut self, raw: &str) -> Self {
        self.registration.destinations = BTreeSet::from([site(raw)]);
        self
    }

    pub fn source_type(mut self, source_type: SourceType) -> Self {
        self.source_type = source_type;
        self
    }

    pub fn expiry(mut self, expiry: Duration) -> Self {
        self.registration.expiry = expiry;
        self
    }

    pub fn event_report_windows(mut self, windows: EventReportWindows) -> Self {
        self.registration.event_report_windows = Some(windows);
        self
    }

    pub fn aggregatable_report_window(mut self, window: Duration) -> Self {
        self.registration.aggregatable_report_window = Some(window);
        self
    }

    pub fn max_event_level_reports(mut self, max: u32) -> Self {
        self.registration.max_event_level_reports = Some(max);
        self
    }

    pub fn priority(mut self, priority: i64) -> Self {
        self.registration.priority = priority;
        self
    }

    pub fn debug_key(mut self, debug_key: u64) -> Self {
        self.registration.debug_key = Some(debug_key);
        self
    }

    pub fn filter_data(mut self, filter_data: FilterData) -> Self {
        self.registration.filter_data = filter_data;
        self
    }

    pub fn aggregation_keys(mut self, keys: AggregationKeys) -> Self {
        self.registration.aggregation_keys = keys;
        self
    }

    pub fn aggregation_key(mut self, id: &str, key: AggregationKey) -> Self {
        self.registration.aggregation_keys.insert(id.to_string(), key);
        self
    }

    pub fn build(self) -> StorableSource {
        StorableSource {
            source_origin: self.source_origin,
            reporting_origin: self.reporting_origin,
            source_type: self.source_type,
            registration: self.registration,
            is_within_fenced_frame: false,
        }
    }
}

/// Event-level trigger with a single configuration.
pub struct TriggerBuilder {
    reporting_origin: SuitableOrigin,
    destination_origin: SuitableOrigin,
    event_trigger: EventTriggerData,
    filters: FilterPair,
    debug_key: Option<u64>,
}

impl TriggerBuilder {
    pub fn new() -> Self {
        Self {
            reporting_origin: origin(REPORTING_ORIGIN),
            destination_origin: origin(CONVERSION_ORIGIN),
            event_trigger: EventTriggerData::new(0),
            filters: FilterPair::default(),
            debug_key: None,
        }
    }

    pub fn trigger_data(mut self, data: u64) -> Self {
        self.event_trigger.data = data;
        self
    }

    pub fn priority(mut self, priority: i64) -> Self {
        self.event_trigger.priority = priority;
        self
    }

    pub fn dedup_key(mut self, dedup_key: u64) -> Self {
        self.event_trigger.dedup_key = Some(dedup_key);
        self
    }

    pub fn debug_key(mut self, debug_key: u64) -> Self {
        self.debug_key = Some(debug_key);
        self
    }

    pub fn filters(mut self, filters: FilterPair) -> Self {
        self.filters = filters;
        self
    }

    pub fn reporting_origin(mut self, raw: &str) -> Self {
        self.reporting_origin = origin(raw);
        self
    }

    pub fn destination_origin(mut self, raw: &str) -> Self {
        self.destination_origin = origin(raw);
        self
    }

    pub fn build(self) -> AttributionTrigger {
        let mut trigger = AttributionTrigger::new(self.reporting_origin, self.destination_origin);
        trigger.registration.event_triggers = vec![self.event_trigger];
        trigger.registration.filters = self.filters;
        trigger.registration.debug_key = self.debug_key;
        trigger
    }
}

/// Aggregatable-only trigger contributing `value` to the `"key"` source key.
pub struct AggregatableTriggerBuilder {
    reporting_origin: SuitableOrigin,
    destination_origin: SuitableOrigin,
    key_piece: AggregationKey,
    values: BTreeMap<String, u32>,
    dedup_key: Option<u64>,
    debug_key: Option<u64>,
    verifications: Vec<TriggerVerification>,
    with_event_trigger: Option<EventTriggerData>,
}

impl AggregatableTriggerBuilder {
    pub fn new() -> Self {
        Self {
            reporting_origin: origin(REPORTING_ORIGIN),
            destination_origin: origin(CONVERSION_ORIGIN),
            key_piece: AggregationKey::new(0, 0),
            values: BTreeMap::from([("key".to_string(), 1)]),
            dedup_key: None,
            debug_key: None,
            verifications: Vec::new(),
            with_event_trigger: None,
        }
    }

    pub fn key_piece(mut self, key_piece: AggregationKey) -> Self {
        self.key_piece = key_piece;
        self
    }

    pub fn value(mut self, id: &str, value: u32) -> Self {
        self.values.insert(id.to_string(), value);
        self
    }

    pub fn dedup_key(mut self, dedup_key: u64) -> Self {
        self.dedup_key = Some(dedup_key);
        self
    }

    pub fn debug_key(mut self, debug_key: u64) -> Self {
        self.debug_key = Some(debug_key);
        self
    }

    pub fn verification(mut self, token: &str, aggregatable_report_id: Uuid) -> Self {
        self.verifications.push(TriggerVerification {
            token: token.to_string(),
            aggregatable_report_id,
        });
        self
    }

    /// Also registers an event-level configuration carrying `data`.
    pub fn event_trigger_data(mut self, data: u64) -> Self {
        self.with_event_trigger = Some(EventTriggerData::new(data));
        self
    }

    pub fn build(self) -> AttributionTrigger {
        let mut trigger = AttributionTrigger::new(self.reporting_origin, self.destination_origin);
        trigger.registration.aggregatable_trigger_data = vec![AggregatableTriggerData {
            key_piece: self.key_piece,
            source_keys: self.values.keys().cloned().collect(),
            filters: FilterPair::default(),
        }];
        trigger.registration.aggregatable_values = self.values;
        if self.dedup_key.is_some() {
            trigger.registration.aggregatable_dedup_keys = vec![AggregatableDedupKey {
                dedup_key: self.dedup_key,
                filters: FilterPair::default(),
            }];
        }
        trigger.registration.debug_key = self.debug_key;
        trigger.registration.event_triggers = self.with_event_trigger.into_iter().collect();
        trigger.verifications = self.verifications;
        trigger
    }
}

/// Source that carries the `"key"` aggregation key used by
/// [`AggregatableTriggerBuilder`].
pub fn aggregatable_source() -> SourceBuilder {
    SourceBuilder::new().aggregation_key("key", AggregationKey::new(5, 345))
}
