#![allow(clippy::uninlined_format_args)]

mod common;

use std::fs;
use std::io::{Seek, SeekFrom, Write};

use attribution_storage_core::timestamps::{duration_to_micros, max_time, min_time};
use attribution_storage_core::{
    AggregatableResult, AggregationKey, AttributionStorage, Clock, DataKey, EventLevelResult,
    EventReportWindows, FakeReport, NullAggregatableReport, RateLimitConfig, ReportData,
    ReportType, SourceId, StorageConfig, StorageKey, StoreSourceStatus, DEFAULT_EXTERNAL_REPORT_ID,
};
use attribution_storage_sqlite::{DbStatus, InitStatus, CURRENT_VERSION};
use proptest::prelude::*;
use time::Duration;
use uuid::Uuid;

use common::{
    aggregatable_source, must, origin, AggregatableTriggerBuilder, Harness, SourceBuilder,
    TriggerBuilder, IMPRESSION_ORIGIN,
};

fn store_default_source(harness: &mut Harness) {
    let result = harness.storage.store_source(&SourceBuilder::new().build());
    assert_eq!(result.status, StoreSourceStatus::Success);
}

fn overwrite_bytes(path: &std::path::Path, offset: u64, bytes: &[u8]) {
    let mut file = must(fs::OpenOptions::new().write(true).open(path));
    must(file.seek(SeekFrom::Start(offset)));
    must(file.write_all(bytes));
    must(file.sync_all());
}

#[test]
fn reads_never_create_the_database() {
    let mut harness = Harness::new();

    assert!(harness.storage.get_active_sources().is_empty());
    assert!(harness
        .storage
        .get_attribution_reports(max_time(), None)
        .is_empty());
    assert!(harness.storage.get_all_data_keys().is_empty());
    assert_eq!(harness.storage.get_next_report_time(min_time()), None);
    harness.storage.clear_data(min_time(), max_time(), None, true);

    assert!(!harness.db_path().exists());
    assert_eq!(
        harness.storage.db_status(),
        Some(DbStatus::DeferringCreation)
    );

    store_default_source(&mut harness);
    assert!(harness.db_path().exists());
    assert_eq!(
        harness.storage.stats().init_status,
        Some(InitStatus::Success)
    );
}

#[test]
fn schema_has_expected_tables_and_indexes() {
    let mut harness = Harness::new();
    store_default_source(&mut harness);

    let conn = harness.raw_connection();
    let tables: i64 = must(conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table'",
        [],
        |row| row.get(0),
    ));
    let indexes: i64 = must(conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'index' AND name NOT LIKE 'sqlite_%'",
        [],
        |row| row.get(0),
    ));
    let version: i64 = must(conn.query_row(
        "SELECT CAST(value AS INTEGER) FROM meta WHERE key = 'version'",
        [],
        |row| row.get(0),
    ));

    assert_eq!(tables, 7);
    assert_eq!(indexes, 12);
    assert_eq!(version, CURRENT_VERSION);
}

#[test]
fn newer_schema_version_is_razed() {
    let mut harness = Harness::new();
    store_default_source(&mut harness);
    assert_eq!(harness.row_count("sources"), 1);

    let conn = harness.raw_connection();
    must(conn.execute(
        "UPDATE meta SET value = ?1 WHERE key = 'version'",
        [CURRENT_VERSION + 1],
    ));
    drop(conn);

    harness.reopen();
    assert!(harness.storage.get_active_sources().is_empty());
    assert_eq!(harness.storage.stats().init_status, Some(InitStatus::Razed));
    assert_eq!(harness.row_count("sources"), 0);
}

#[test]
fn incompatible_last_compatible_version_is_razed() {
    let mut harness = Harness::new();
    store_default_source(&mut harness);

    let conn = harness.raw_connection();
    must(conn.execute(
        "UPDATE meta SET value = ?1 WHERE key = 'last_compatible_version'",
        [CURRENT_VERSION + 1],
    ));
    drop(conn);

    harness.reopen();
    assert!(harness.storage.get_active_sources().is_empty());
    assert_eq!(harness.storage.stats().init_status, Some(InitStatus::Razed));
}

#[test]
fn corrupted_header_magic_is_razed() {
    let mut harness = Harness::new();
    store_default_source(&mut harness);
    let result = harness
        .storage
        .maybe_create_and_store_report(&TriggerBuilder::new().build());
    assert_eq!(result.event_level_status, EventLevelResult::Success);

    harness.reopen();
    overwrite_bytes(&harness.db_path(), 0, b"not a database!!");

    assert!(harness
        .storage
        .get_attribution_reports(max_time(), None)
        .is_empty());
    assert_eq!(harness.storage.stats().init_status, Some(InitStatus::Razed));

    store_default_source(&mut harness);
    assert_eq!(harness.storage.get_active_sources().len(), 1);
}

fn corrupt_page_count(use_builtin_recovery: bool) -> (Harness, usize) {
    let mut harness = Harness::with_config(StorageConfig {
        use_builtin_recovery,
        ..StorageConfig::default()
    });
    store_default_source(&mut harness);
    let result = harness
        .storage
        .maybe_create_and_store_report(&TriggerBuilder::new().build());
    assert_eq!(result.event_level_status, EventLevelResult::Success);

    harness.reopen();
    overwrite_bytes(&harness.db_path(), 28, &0x7fff_ffff_u32.to_be_bytes());

    let reports = harness
        .storage
        .get_attribution_reports(max_time(), None)
        .len();
    (harness, reports)
}

#[test]
fn corrupted_page_count_is_recovered() {
    let (harness, reports) = corrupt_page_count(true);
    assert_eq!(reports, 1);
    assert_eq!(
        harness.storage.stats().init_status,
        Some(InitStatus::Recovered)
    );
}

#[test]
fn corrupted_page_count_without_recovery_is_razed() {
    let (mut harness, reports) = corrupt_page_count(false);
    assert_eq!(reports, 0);
    assert_eq!(harness.storage.stats().init_status, Some(InitStatus::Razed));
    assert!(harness.storage.get_active_sources().is_empty());
}

#[test]
fn unopenable_database_is_a_no_op() {
    let mut harness = Harness::new();
    must(fs::create_dir_all(harness.db_path()));

    let result = harness.storage.store_source(&SourceBuilder::new().build());
    assert_eq!(result.status, StoreSourceStatus::InternalError);
    assert_eq!(
        harness.storage.db_status(),
        Some(DbStatus::ClosedDueToCatastrophicError)
    );
    assert_eq!(
        harness.storage.stats().init_status,
        Some(InitStatus::FailedToOpenDbFile)
    );
    assert!(harness.storage.get_active_sources().is_empty());
    assert!(!harness.storage.deactivate_source(SourceId(1)));
}

#[test]
fn expired_sources_leave_active_set_and_are_swept_lazily() {
    let mut harness = Harness::new();
    let expiry = Duration::days(1);
    let result = harness
        .storage
        .store_source(&SourceBuilder::new().expiry(expiry).build());
    assert_eq!(result.status, StoreSourceStatus::Success);

    harness.advance(expiry - Duration::milliseconds(1));
    assert_eq!(harness.storage.get_active_sources().len(), 1);

    harness.advance(Duration::milliseconds(1));
    assert!(harness.storage.get_active_sources().is_empty());
    assert_eq!(harness.row_count("sources"), 1);

    store_default_source(&mut harness);
    assert_eq!(harness.row_count("sources"), 1);
    assert_eq!(harness.storage.get_active_sources().len(), 1);
}

#[test]
fn triggers_also_sweep_expired_sources() {
    let mut harness = Harness::new();
    let result = harness
        .storage
        .store_source(&SourceBuilder::new().expiry(Duration::days(1)).build());
    assert_eq!(result.status, StoreSourceStatus::Success);

    harness.advance(Duration::days(1));
    let result = harness
        .storage
        .maybe_create_and_store_report(&TriggerBuilder::new().build());
    assert_eq!(
        result.event_level_status,
        EventLevelResult::NoMatchingImpressions
    );
    assert_eq!(harness.row_count("sources"), 0);
}

#[test]
fn expiry_sweep_is_throttled() {
    let mut harness = Harness::new();
    harness
        .delegate
        .set_delete_expired_sources_frequency(Duration::days(2));

    let result = harness
        .storage
        .store_source(&SourceBuilder::new().expiry(Duration::days(1)).build());
    assert_eq!(result.status, StoreSourceStatus::Success);

    harness.advance(Duration::days(1));
    store_default_source(&mut harness);
    assert_eq!(harness.row_count("sources"), 2);

    harness.advance(Duration::days(1));
    store_default_source(&mut harness);
    assert_eq!(harness.row_count("sources"), 2);
    assert_eq!(harness.storage.get_active_sources().len(), 2);
}

#[test]
fn expired_sources_with_pending_reports_survive_the_sweep() {
    let mut harness = Harness::new();
    harness.delegate.set_report_delay(Duration::days(5));
    let result = harness
        .storage
        .store_source(&SourceBuilder::new().expiry(Duration::days(1)).build());
    assert_eq!(result.status, StoreSourceStatus::Success);
    let result = harness
        .storage
        .maybe_create_and_store_report(&TriggerBuilder::new().build());
    assert_eq!(result.event_level_status, EventLevelResult::Success);

    harness.advance(Duration::days(2));
    store_default_source(&mut harness);
    assert_eq!(harness.row_count("sources"), 2);
    assert_eq!(
        harness
            .storage
            .get_attribution_reports(max_time(), None)
            .len(),
        1
    );
}

#[test]
fn destination_capacity_limits_event_level_reports() {
    let mut harness = Harness::new();
    harness
        .delegate
        .set_max_reports_per_destination(ReportType::EventLevel, 2);
    store_default_source(&mut harness);

    let statuses: Vec<EventLevelResult> = (0..3)
        .map(|data| {
            harness
                .storage
                .maybe_create_and_store_report(&TriggerBuilder::new().trigger_data(data).build())
                .event_level_status
        })
        .collect();

    assert_eq!(
        statuses,
        vec![
            EventLevelResult::Success,
            EventLevelResult::Success,
            EventLevelResult::NoCapacityForConversionDestination,
        ]
    );
    assert_eq!(harness.row_count("reports"), 2);
    assert_eq!(harness.row_count("rate_limits"), 3);
    assert_eq!(harness.storage.get_active_sources().len(), 1);
}

#[test]
fn clearing_one_report_removes_its_source_and_siblings() {
    let mut harness = Harness::new();
    let result = harness
        .storage
        .store_source(&aggregatable_source().build());
    assert_eq!(result.status, StoreSourceStatus::Success);

    let trigger = AggregatableTriggerBuilder::new()
        .event_trigger_data(1)
        .build();
    for _ in 0..2 {
        harness.advance(Duration::hours(1));
        let result = harness.storage.maybe_create_and_store_report(&trigger);
        assert_eq!(result.event_level_status, EventLevelResult::Success);
        assert_eq!(result.aggregatable_status, AggregatableResult::Success);
    }
    assert_eq!(harness.row_count("reports"), 4);

    let latest = harness.clock.now();
    harness.storage.clear_data(latest, latest, None, true);

    assert_eq!(harness.row_count("reports"), 0);
    assert_eq!(harness.row_count("sources"), 0);
    let cleared = harness.storage.stats().last_clear;
    assert_eq!(cleared.sources, 1);
    assert_eq!(cleared.event_level_reports, 2);
    assert_eq!(cleared.aggregatable_reports, 2);
}

#[test]
fn clear_keeps_rate_limits_unless_asked() {
    let mut harness = Harness::new();
    store_default_source(&mut harness);
    let result = harness
        .storage
        .maybe_create_and_store_report(&TriggerBuilder::new().build());
    assert_eq!(result.event_level_status, EventLevelResult::Success);
    assert_eq!(harness.row_count("rate_limits"), 2);

    harness
        .storage
        .clear_data(min_time(), max_time(), None, false);

    assert_eq!(harness.row_count("sources"), 0);
    assert_eq!(harness.row_count("reports"), 0);
    assert_eq!(harness.row_count("rate_limits"), 2);
}

#[test]
fn clear_everything_empties_every_table() {
    let mut harness = Harness::new();
    harness
        .delegate
        .set_null_aggregatable_reports(vec![NullAggregatableReport {
            fake_source_time: harness.clock.now() - Duration::days(1),
        }]);
    let result = harness
        .storage
        .store_source(&aggregatable_source().build());
    assert_eq!(result.status, StoreSourceStatus::Success);
    let result = harness.storage.maybe_create_and_store_report(
        &AggregatableTriggerBuilder::new()
            .event_trigger_data(3)
            .dedup_key(9)
            .build(),
    );
    assert_eq!(result.aggregatable_status, AggregatableResult::Success);
    assert_eq!(harness.row_count("reports"), 3);

    harness.storage.clear_data(min_time(), max_time(), None, true);

    for table in [
        "sources",
        "source_destinations",
        "reports",
        "rate_limits",
        "dedup_keys",
    ] {
        assert_eq!(harness.row_count(table), 0, "table {table} not empty");
    }
}

#[test]
fn clear_respects_the_storage_key_filter() {
    let mut harness = Harness::new();
    store_default_source(&mut harness);
    let result = harness.storage.store_source(
        &SourceBuilder::new()
            .reporting_origin("https://other-report.test")
            .build(),
    );
    assert_eq!(result.status, StoreSourceStatus::Success);

    let keep = origin("https://other-report.test");
    let filter: &dyn Fn(&StorageKey) -> bool = &|key| *key.origin() != keep;
    harness
        .storage
        .clear_data(min_time(), max_time(), Some(filter), true);

    let remaining = harness.storage.get_active_sources();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].reporting_origin, keep);
}

#[test]
fn data_keys_cover_every_reporting_origin() {
    let mut harness = Harness::new();
    store_default_source(&mut harness);
    let result = harness.storage.store_source(
        &SourceBuilder::new()
            .reporting_origin("https://other-report.test")
            .build(),
    );
    assert_eq!(result.status, StoreSourceStatus::Success);

    let keys = harness.storage.get_all_data_keys();
    let expected: Vec<DataKey> = vec![
        DataKey::new(origin("https://other-report.test")),
        DataKey::new(origin(common::REPORTING_ORIGIN)),
    ];
    assert_eq!(keys.into_iter().collect::<Vec<_>>(), expected);

    harness
        .storage
        .delete_by_data_key(&DataKey::new(origin(common::REPORTING_ORIGIN)));

    let keys = harness.storage.get_all_data_keys();
    assert_eq!(
        keys.into_iter().collect::<Vec<_>>(),
        vec![DataKey::new(origin("https://other-report.test"))]
    );
    assert_eq!(harness.row_count("sources"), 1);
}

fn verification_assignment(reverse: bool) {
    let mut harness = Harness::new();
    harness.delegate.set_reverse_reports_on_shuffle(reverse);
    let now = harness.clock.now();
    harness
        .delegate
        .set_null_aggregatable_reports(vec![NullAggregatableReport {
            fake_source_time: now - Duration::days(1),
        }]);
    let result = harness
        .storage
        .store_source(&aggregatable_source().build());
    assert_eq!(result.status, StoreSourceStatus::Success);

    let verified_id = must(Uuid::parse_str("b2f1a4c3-7d7e-4f0a-9c7b-0a1b2c3d4e5f"));
    let result = harness.storage.maybe_create_and_store_report(
        &AggregatableTriggerBuilder::new()
            .verification("token", verified_id)
            .build(),
    );
    assert_eq!(result.aggregatable_status, AggregatableResult::Success);
    assert_eq!(result.min_null_aggregatable_report_time, Some(now));

    let reports = harness.storage.get_attribution_reports(max_time(), None);
    assert_eq!(reports.len(), 2);
    let real = reports
        .iter()
        .find(|report| report.report_type() == ReportType::AggregatableAttribution);
    let null = reports
        .iter()
        .find(|report| report.report_type() == ReportType::NullAggregatable);
    let (Some(real), Some(null)) = (real, null) else {
        panic!("expected one real and one null report, got {reports:?}");
    };

    let (verified, unverified) = if reverse { (null, real) } else { (real, null) };
    assert_eq!(verified.verification_token(), Some("token"));
    assert_eq!(verified.external_report_id, verified_id);
    assert_eq!(unverified.verification_token(), None);
    assert_eq!(unverified.external_report_id, DEFAULT_EXTERNAL_REPORT_ID);
}

#[test]
fn verification_token_follows_report_order() {
    verification_assignment(false);
}

#[test]
fn verification_token_follows_reversed_report_order() {
    verification_assignment(true);
}

#[test]
fn surplus_verifications_pair_with_reports_after_reversal() {
    let mut harness = Harness::new();
    harness.delegate.set_reverse_verifications_on_shuffle(true);
    let now = harness.clock.now();
    harness
        .delegate
        .set_null_aggregatable_reports(vec![NullAggregatableReport {
            fake_source_time: now - Duration::days(1),
        }]);
    let result = harness
        .storage
        .store_source(&aggregatable_source().build());
    assert_eq!(result.status, StoreSourceStatus::Success);

    let ids = [
        must(Uuid::parse_str("0f8e51d6-1b8c-4b59-9a43-3c1f64a1d001")),
        must(Uuid::parse_str("0f8e51d6-1b8c-4b59-9a43-3c1f64a1d002")),
        must(Uuid::parse_str("0f8e51d6-1b8c-4b59-9a43-3c1f64a1d003")),
    ];
    let result = harness.storage.maybe_create_and_store_report(
        &AggregatableTriggerBuilder::new()
            .verification("t1", ids[0])
            .verification("t2", ids[1])
            .verification("t3", ids[2])
            .build(),
    );
    assert_eq!(result.aggregatable_status, AggregatableResult::Success);

    let reports = harness.storage.get_attribution_reports(max_time(), None);
    assert_eq!(reports.len(), 2);
    let real = reports
        .iter()
        .find(|report| report.report_type() == ReportType::AggregatableAttribution);
    let null = reports
        .iter()
        .find(|report| report.report_type() == ReportType::NullAggregatable);
    let (Some(real), Some(null)) = (real, null) else {
        panic!("expected one real and one null report, got {reports:?}");
    };

    // Reversed pool is [t3, t2, t1]; the unpaired t1 is dropped.
    assert_eq!(real.verification_token(), Some("t3"));
    assert_eq!(real.external_report_id, ids[2]);
    assert_eq!(null.verification_token(), Some("t2"));
    assert_eq!(null.external_report_id, ids[1]);
    assert!(reports
        .iter()
        .all(|report| report.external_report_id != ids[0]));
}

#[test]
fn missing_stored_randomized_response_rate_is_recomputed() {
    let mut harness = Harness::new();
    harness.delegate.set_randomized_response_rate(0.0);
    store_default_source(&mut harness);
    let sources = harness.storage.get_active_sources();
    assert_eq!(sources.len(), 1);
    assert_eq!(sources[0].randomized_response_rate, 0.0);

    let conn = harness.raw_connection();
    must(conn.execute(
        "UPDATE sources SET read_only_source_data = \
         json_remove(read_only_source_data, '$.randomized_response_rate')",
        [],
    ));
    drop(conn);

    harness.delegate.set_randomized_response_rate(0.25);
    let sources = harness.storage.get_active_sources();
    assert_eq!(sources.len(), 1);
    assert_eq!(sources[0].randomized_response_rate, 0.25);
}

#[test]
fn verification_is_ignored_when_disabled() {
    let mut harness = Harness::with_config(StorageConfig {
        verification_enabled: false,
        ..StorageConfig::default()
    });
    let result = harness
        .storage
        .store_source(&aggregatable_source().build());
    assert_eq!(result.status, StoreSourceStatus::Success);

    let result = harness.storage.maybe_create_and_store_report(
        &AggregatableTriggerBuilder::new()
            .verification("token", Uuid::new_v4())
            .build(),
    );
    let Some(report) = result.new_aggregatable_report else {
        panic!("expected an aggregatable report");
    };
    assert_eq!(report.verification_token(), None);
    assert_eq!(report.external_report_id, DEFAULT_EXTERNAL_REPORT_ID);
}

#[test]
fn max_u64_values_round_trip() {
    let mut harness = Harness::new();
    let result = harness
        .storage
        .store_source(&SourceBuilder::new().source_event_id(u64::MAX).build());
    assert_eq!(result.status, StoreSourceStatus::Success);

    let result = harness.storage.maybe_create_and_store_report(
        &TriggerBuilder::new()
            .debug_key(u64::MAX)
            .dedup_key(u64::MAX)
            .build(),
    );
    assert_eq!(result.event_level_status, EventLevelResult::Success);

    let sources = harness.storage.get_active_sources();
    assert_eq!(sources.len(), 1);
    assert_eq!(sources[0].source_event_id, u64::MAX);
    assert_eq!(sources[0].dedup_keys, vec![u64::MAX]);

    let reports = harness.storage.get_attribution_reports(max_time(), None);
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].attribution_info.debug_key, Some(u64::MAX));
}

#[test]
fn undecodable_rows_are_dropped_from_reads() {
    let mut harness = Harness::new();
    store_default_source(&mut harness);
    store_default_source(&mut harness);
    let result = harness
        .storage
        .maybe_create_and_store_report(&TriggerBuilder::new().build());
    assert_eq!(result.event_level_status, EventLevelResult::Success);
    assert_eq!(harness.storage.get_active_sources().len(), 1);

    store_default_source(&mut harness);
    let conn = harness.raw_connection();
    must(conn.execute(
        "UPDATE sources SET source_origin = 'not an origin'
         WHERE source_id = (SELECT MAX(source_id) FROM sources)",
        [],
    ));
    must(conn.execute("UPDATE reports SET metadata = '{}'", []));
    drop(conn);

    assert_eq!(harness.storage.get_active_sources().len(), 1);
    assert!(harness
        .storage
        .get_attribution_reports(max_time(), None)
        .is_empty());
    assert_eq!(harness.row_count("reports"), 1);
}

#[test]
fn excessive_expiry_in_storage_is_dropped() {
    let mut harness = Harness::new();
    store_default_source(&mut harness);

    let conn = harness.raw_connection();
    must(conn.execute(
        "UPDATE sources SET expiry_time = expiry_time + ?1",
        [duration_to_micros(Duration::days(1))],
    ));
    drop(conn);

    assert!(harness.storage.get_active_sources().is_empty());
}

#[test]
fn randomized_response_stores_fake_reports() {
    let mut harness = Harness::new();
    let now = harness.clock.now();
    harness.delegate.set_randomized_response(Some(vec![FakeReport {
        trigger_data: 1,
        trigger_time: now,
        report_time: now + Duration::days(1),
    }]));

    let result = harness.storage.store_source(&SourceBuilder::new().build());
    assert_eq!(result.status, StoreSourceStatus::SuccessNoised);
    assert_eq!(result.min_fake_report_time, Some(now + Duration::days(1)));

    let reports = harness.storage.get_attribution_reports(max_time(), None);
    assert_eq!(reports.len(), 1);
    assert_eq!(
        reports[0].attribution_info.context_origin,
        origin(IMPRESSION_ORIGIN)
    );
    match &reports[0].data {
        ReportData::EventLevel(data) => {
            assert_eq!(data.trigger_data, 1);
            assert_eq!(data.priority, 0);
        }
        other => panic!("unexpected report data {other:?}"),
    }

    let result = harness
        .storage
        .maybe_create_and_store_report(&TriggerBuilder::new().build());
    assert_eq!(
        result.event_level_status,
        EventLevelResult::FalselyAttributedSource
    );
}

#[test]
fn never_attributed_sources_drop_triggers_for_noise() {
    let mut harness = Harness::new();
    harness.delegate.set_randomized_response(Some(Vec::new()));

    let result = harness.storage.store_source(&SourceBuilder::new().build());
    assert_eq!(result.status, StoreSourceStatus::SuccessNoised);
    assert_eq!(result.min_fake_report_time, None);

    let result = harness
        .storage
        .maybe_create_and_store_report(&TriggerBuilder::new().build());
    assert_eq!(result.event_level_status, EventLevelResult::DroppedForNoise);
    assert_eq!(harness.row_count("reports"), 0);
}

#[test]
fn higher_priority_trigger_replaces_pending_report() {
    let mut harness = Harness::new();
    let result = harness
        .storage
        .store_source(&SourceBuilder::new().max_event_level_reports(1).build());
    assert_eq!(result.status, StoreSourceStatus::Success);

    let first = harness
        .storage
        .maybe_create_and_store_report(&TriggerBuilder::new().priority(1).build());
    assert_eq!(first.event_level_status, EventLevelResult::Success);

    let lower = harness
        .storage
        .maybe_create_and_store_report(&TriggerBuilder::new().priority(0).build());
    assert_eq!(lower.event_level_status, EventLevelResult::PriorityTooLow);

    let higher = harness.storage.maybe_create_and_store_report(
        &TriggerBuilder::new().priority(5).trigger_data(2).build(),
    );
    assert_eq!(
        higher.event_level_status,
        EventLevelResult::SuccessDroppedLowerPriority
    );
    let replaced = higher.replaced_event_level_report.map(|report| report.id);
    assert_eq!(replaced, first.new_event_level_report.map(|report| report.id));

    let reports = harness.storage.get_attribution_reports(max_time(), None);
    assert_eq!(reports.len(), 1);
    match &reports[0].data {
        ReportData::EventLevel(data) => assert_eq!(data.priority, 5),
        other => panic!("unexpected report data {other:?}"),
    }

    harness.advance(Duration::seconds(1));
    let later = harness
        .storage
        .maybe_create_and_store_report(&TriggerBuilder::new().priority(10).build());
    assert_eq!(later.event_level_status, EventLevelResult::ExcessiveReports);
}

#[test]
fn source_cap_evicts_lowest_priority_oldest_source() {
    let mut harness = Harness::new();
    harness.delegate.set_max_sources_per_origin(2);

    for (event_id, priority) in [(1_u64, 0_i64), (2, 5), (3, 1)] {
        let result = harness.storage.store_source(
            &SourceBuilder::new()
                .source_event_id(event_id)
                .priority(priority)
                .build(),
        );
        assert_eq!(result.status, StoreSourceStatus::Success);
        assert_eq!(result.evicted_sources, usize::from(event_id == 3));
        harness.advance(Duration::seconds(1));
    }

    let mut event_ids: Vec<u64> = harness
        .storage
        .get_active_sources()
        .iter()
        .map(|source| source.source_event_id)
        .collect();
    event_ids.sort_unstable();
    assert_eq!(event_ids, vec![2, 3]);
}

#[test]
fn evicted_sources_take_pending_reports_with_them() {
    let mut harness = Harness::new();
    harness.delegate.set_max_sources_per_origin(2);
    harness.delegate.set_report_delay(Duration::days(5));

    let result = harness
        .storage
        .store_source(&SourceBuilder::new().source_event_id(1).build());
    assert_eq!(result.status, StoreSourceStatus::Success);
    let result = harness
        .storage
        .maybe_create_and_store_report(&TriggerBuilder::new().build());
    assert_eq!(result.event_level_status, EventLevelResult::Success);
    let rate_limit_rows = harness.row_count("rate_limits");
    assert!(rate_limit_rows > 0);

    for (event_id, priority) in [(2_u64, 5_i64), (3, 1)] {
        harness.advance(Duration::seconds(1));
        let result = harness.storage.store_source(
            &SourceBuilder::new()
                .source_event_id(event_id)
                .priority(priority)
                .build(),
        );
        assert_eq!(result.status, StoreSourceStatus::Success);
    }

    assert_eq!(harness.row_count("sources"), 2);
    assert!(harness
        .storage
        .get_attribution_reports(max_time(), None)
        .is_empty());
    assert!(harness.row_count("rate_limits") >= rate_limit_rows);
}

#[test]
fn dedup_key_blocks_second_report() {
    let mut harness = Harness::new();
    store_default_source(&mut harness);

    let trigger = TriggerBuilder::new().dedup_key(7).build();
    let first = harness.storage.maybe_create_and_store_report(&trigger);
    let second = harness.storage.maybe_create_and_store_report(&trigger);

    assert_eq!(first.event_level_status, EventLevelResult::Success);
    assert_eq!(second.event_level_status, EventLevelResult::Deduplicated);
    assert_eq!(harness.row_count("reports"), 1);
    assert_eq!(harness.row_count("dedup_keys"), 1);
}

#[test]
fn trigger_without_matching_source_reports_per_track_status() {
    let mut harness = Harness::new();
    store_default_source(&mut harness);

    let result = harness.storage.maybe_create_and_store_report(
        &TriggerBuilder::new()
            .destination_origin("https://elsewhere.test")
            .build(),
    );
    assert_eq!(
        result.event_level_status,
        EventLevelResult::NoMatchingImpressions
    );
    assert_eq!(result.aggregatable_status, AggregatableResult::NotRegistered);
}

#[test]
fn winning_source_retires_untouched_competitors() {
    let mut harness = Harness::new();
    for (event_id, priority) in [(1_u64, 1_i64), (2, 2)] {
        let result = harness.storage.store_source(
            &SourceBuilder::new()
                .source_event_id(event_id)
                .priority(priority)
                .build(),
        );
        assert_eq!(result.status, StoreSourceStatus::Success);
    }

    let result = harness
        .storage
        .maybe_create_and_store_report(&TriggerBuilder::new().build());
    let Some(report) = result.new_event_level_report else {
        panic!("expected an event-level report");
    };
    assert_eq!(report.source().map(|source| source.source_event_id), Some(2));

    let active = harness.storage.get_active_sources();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].source_event_id, 2);
    assert_eq!(harness.row_count("sources"), 1);
}

#[test]
fn aggregatable_budget_is_enforced() {
    let mut harness = Harness::new();
    harness.delegate.set_aggregatable_budget_per_source(10);
    let result = harness
        .storage
        .store_source(&aggregatable_source().build());
    assert_eq!(result.status, StoreSourceStatus::Success);

    let trigger = AggregatableTriggerBuilder::new()
        .key_piece(AggregationKey::new(0, 0x400))
        .value("key", 6)
        .build();
    let first = harness.storage.maybe_create_and_store_report(&trigger);
    assert_eq!(first.aggregatable_status, AggregatableResult::Success);
    let Some(report) = first.new_aggregatable_report else {
        panic!("expected an aggregatable report");
    };
    match &report.data {
        ReportData::AggregatableAttribution(data) => {
            assert_eq!(data.contributions.len(), 1);
            assert_eq!(data.contributions[0].key, AggregationKey::new(5, 345 | 0x400));
            assert_eq!(data.contributions[0].value, 6);
        }
        other => panic!("unexpected report data {other:?}"),
    }

    let second = harness.storage.maybe_create_and_store_report(&trigger);
    assert_eq!(
        second.aggregatable_status,
        AggregatableResult::InsufficientBudget
    );
    assert_eq!(harness.row_count("reports"), 1);
}

#[test]
fn trigger_without_histograms_is_rejected() {
    let mut harness = Harness::new();
    store_default_source(&mut harness);

    let result = harness
        .storage
        .maybe_create_and_store_report(&AggregatableTriggerBuilder::new().build());
    assert_eq!(result.aggregatable_status, AggregatableResult::NoHistograms);
    assert_eq!(result.event_level_status, EventLevelResult::NotRegistered);
}

#[test]
fn report_windows_gate_event_level_attribution() {
    let mut harness = Harness::new();
    let windows = EventReportWindows {
        start_time: Duration::hours(1),
        end_times: vec![Duration::days(1)],
    };
    let result = harness
        .storage
        .store_source(&SourceBuilder::new().event_report_windows(windows).build());
    assert_eq!(result.status, StoreSourceStatus::Success);

    let trigger = TriggerBuilder::new().build();
    assert_eq!(
        harness
            .storage
            .maybe_create_and_store_report(&trigger)
            .event_level_status,
        EventLevelResult::ReportWindowNotStarted
    );

    harness.advance(Duration::days(2));
    assert_eq!(
        harness
            .storage
            .maybe_create_and_store_report(&trigger)
            .event_level_status,
        EventLevelResult::ReportWindowPassed
    );
}

#[test]
fn attribution_rate_limit_rejects_extra_attributions() {
    let mut harness = Harness::new();
    harness.delegate.set_rate_limits(RateLimitConfig {
        max_attributions: 1,
        ..RateLimitConfig::unlimited()
    });
    store_default_source(&mut harness);

    let first = harness
        .storage
        .maybe_create_and_store_report(&TriggerBuilder::new().build());
    let second = harness
        .storage
        .maybe_create_and_store_report(&TriggerBuilder::new().trigger_data(1).build());

    assert_eq!(first.event_level_status, EventLevelResult::Success);
    assert_eq!(
        second.event_level_status,
        EventLevelResult::ExcessiveAttributions
    );
}

#[test]
fn source_registration_reporting_origins_are_capped() {
    let mut harness = Harness::new();
    harness.delegate.set_rate_limits(RateLimitConfig {
        max_source_registration_reporting_origins: 1,
        ..RateLimitConfig::unlimited()
    });
    store_default_source(&mut harness);

    let result = harness.storage.store_source(
        &SourceBuilder::new()
            .reporting_origin("https://other-report.test")
            .build(),
    );
    assert_eq!(result.status, StoreSourceStatus::ExcessiveReportingOrigins);
    assert_eq!(result.source_id, None);

    store_default_source(&mut harness);
    assert_eq!(harness.storage.get_active_sources().len(), 2);
}

#[test]
fn send_failures_reschedule_reports() {
    let mut harness = Harness::new();
    store_default_source(&mut harness);
    let result = harness
        .storage
        .maybe_create_and_store_report(&TriggerBuilder::new().build());
    let Some(report) = result.new_event_level_report else {
        panic!("expected an event-level report");
    };

    let retry_at = harness.clock.now() + Duration::hours(1);
    assert!(harness
        .storage
        .update_report_for_send_failure(report.id, retry_at));

    let reports = harness.storage.get_reports(&[report.id]);
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].failed_send_attempts, 1);
    assert_eq!(reports[0].report_time, retry_at);
    assert_eq!(reports[0].initial_report_time, report.initial_report_time);
    assert_eq!(
        harness.storage.get_next_report_time(harness.clock.now()),
        Some(retry_at)
    );
    assert!(harness
        .storage
        .get_attribution_reports(harness.clock.now(), None)
        .is_empty());

    assert!(harness.storage.delete_report(report.id));
    assert!(!harness.storage.delete_report(report.id));
}

#[test]
fn deactivated_sources_stop_attributing() {
    let mut harness = Harness::new();
    let result = harness.storage.store_source(&SourceBuilder::new().build());
    let Some(source_id) = result.source_id else {
        panic!("expected a source id");
    };

    assert!(harness.storage.deactivate_source(source_id));
    assert!(!harness.storage.deactivate_source(source_id));
    assert!(harness.storage.get_active_sources().is_empty());

    let result = harness
        .storage
        .maybe_create_and_store_report(&TriggerBuilder::new().build());
    assert_eq!(
        result.event_level_status,
        EventLevelResult::NoMatchingImpressions
    );
}

#[test]
fn invalid_registration_is_rejected_before_storage() {
    let mut harness = Harness::new();
    let result = harness
        .storage
        .store_source(&SourceBuilder::new().expiry(Duration::days(31)).build());
    assert_eq!(result.status, StoreSourceStatus::InvalidRegistration);
    assert!(!harness.db_path().exists());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn stored_event_reports_never_exceed_destination_capacity(
        capacity in 1_usize..5,
        triggers in 0_u64..8,
    ) {
        let mut harness = Harness::new();
        harness
            .delegate
            .set_max_reports_per_destination(ReportType::EventLevel, capacity);
        let result = harness
            .storage
            .store_source(&SourceBuilder::new().max_event_level_reports(20).build());
        prop_assert_eq!(result.status, StoreSourceStatus::Success);

        let mut successes = 0_usize;
        for data in 0..triggers {
            let result = harness
                .storage
                .maybe_create_and_store_report(&TriggerBuilder::new().trigger_data(data).build());
            if result.event_level_status == EventLevelResult::Success {
                successes += 1;
            } else {
                prop_assert_eq!(
                    result.event_level_status,
                    EventLevelResult::NoCapacityForConversionDestination
                );
            }
        }

        let expected = capacity.min(usize::try_from(triggers).unwrap_or(usize::MAX));
        prop_assert_eq!(successes, expected);
        prop_assert_eq!(
            harness.storage.get_attribution_reports(max_time(), None).len(),
            expected
        );
    }
}
