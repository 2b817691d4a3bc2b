use std::collections::BTreeSet;

use anyhow::{anyhow, Context, Result};
use attribution_storage_core::timestamps::{from_micros, to_micros, MAX_SOURCE_EXPIRY};
use attribution_storage_core::{
    ActiveState, AttributionLogic, ReportType, SchemefulSite, SourceId, SourceType,
    StorableSource, StoredSource, SuitableOrigin,
};
use log::debug;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::codec::{
    decode_aggregation_keys, decode_filter_data, decode_read_only_source_data,
    encode_aggregation_keys, encode_filter_data, encode_read_only_source_data, u64_from_sql,
    u64_to_sql, ReadOnlySourceData,
};
use crate::context::StoreContext;
use crate::reports::report_type_to_sql;

const SOURCE_COLUMNS: &str = "s.source_id, s.source_event_id, s.source_origin, s.reporting_origin,
    s.source_time, s.expiry_time, s.aggregatable_report_window_time, s.source_type,
    s.attribution_logic, s.priority, s.debug_key, s.num_attributions, s.active_state,
    s.num_aggregatable_reports, s.aggregatable_budget_consumed, s.filter_data,
    s.aggregatable_source, s.read_only_source_data, s.debug_reporting,
    s.is_within_fenced_frame";

/// Rows removed by a source deletion, including cascaded reports.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeletionCounts {
    pub sources: usize,
    pub event_level_reports: usize,
    pub aggregatable_reports: usize,
}

impl DeletionCounts {
    pub(crate) fn absorb(&mut self, other: Self) {
        self.sources += other.sources;
        self.event_level_reports += other.event_level_reports;
        self.aggregatable_reports += other.aggregatable_reports;
    }
}

struct SourceRow {
    source_id: i64,
    source_event_id: i64,
    source_origin: String,
    reporting_origin: String,
    source_time: i64,
    expiry_time: i64,
    aggregatable_report_window_time: i64,
    source_type: String,
    attribution_logic: String,
    priority: i64,
    debug_key: Option<i64>,
    num_attributions: i64,
    active_state: String,
    num_aggregatable_reports: i64,
    aggregatable_budget_consumed: i64,
    filter_data: String,
    aggregatable_source: String,
    read_only_source_data: String,
    debug_reporting: bool,
    is_within_fenced_frame: bool,
}

fn parse_source_row(row: &Row<'_>) -> rusqlite::Result<SourceRow> {
    Ok(SourceRow {
        source_id: row.get(0)?,
        source_event_id: row.get(1)?,
        source_origin: row.get(2)?,
        reporting_origin: row.get(3)?,
        source_time: row.get(4)?,
        expiry_time: row.get(5)?,
        aggregatable_report_window_time: row.get(6)?,
        source_type: row.get(7)?,
        attribution_logic: row.get(8)?,
        priority: row.get(9)?,
        debug_key: row.get(10)?,
        num_attributions: row.get(11)?,
        active_state: row.get(12)?,
        num_aggregatable_reports: row.get(13)?,
        aggregatable_budget_consumed: row.get(14)?,
        filter_data: row.get(15)?,
        aggregatable_source: row.get(16)?,
        read_only_source_data: row.get(17)?,
        debug_reporting: row.get(18)?,
        is_within_fenced_frame: row.get(19)?,
    })
}

/// Inserts the source row and its destinations; returns the generated id.
pub(crate) fn insert_source(
    ctx: &StoreContext<'_>,
    source: &StorableSource,
    attribution_logic: AttributionLogic,
    randomized_response_rate: f64,
    num_attributions: u32,
) -> Result<SourceId> {
    let registration = &source.registration;
    let source_time = ctx.now;
    let expiry_time = source_time + registration.expiry;
    let aggregatable_report_window_time =
        source_time + registration.effective_aggregatable_report_window();

    let read_only = ReadOnlySourceData {
        event_report_windows: registration.effective_event_report_windows(),
        max_event_level_reports: source.max_event_level_reports(),
        randomized_response_rate: Some(randomized_response_rate),
    };

    ctx.conn
        .execute(
            "INSERT INTO sources(
               source_event_id, source_origin, reporting_origin, source_time, expiry_time,
               aggregatable_report_window_time, source_type, attribution_logic, priority,
               debug_key, num_attributions, active_state, num_aggregatable_reports,
               aggregatable_budget_consumed, filter_data, aggregatable_source,
               read_only_source_data, debug_reporting, is_within_fenced_frame
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, 0, 0, ?13, ?14, ?15, ?16, ?17)",
            params![
                u64_to_sql(registration.source_event_id),
                source.source_origin.to_string(),
                source.reporting_origin.to_string(),
                to_micros(source_time),
                to_micros(expiry_time),
                to_micros(aggregatable_report_window_time),
                source.source_type.as_str(),
                attribution_logic.as_str(),
                registration.priority,
                registration.debug_key.map(u64_to_sql),
                i64::from(num_attributions),
                ActiveState::Active.as_str(),
                encode_filter_data(&registration.filter_data)?,
                encode_aggregation_keys(&registration.aggregation_keys)?,
                encode_read_only_source_data(&read_only)?,
                registration.debug_reporting,
                source.is_within_fenced_frame,
            ],
        )
        .context("failed to insert source")?;
    let source_id = ctx.conn.last_insert_rowid();

    for destination in &registration.destinations {
        ctx.conn
            .execute(
                "INSERT INTO source_destinations(source_id, destination_site) VALUES (?1, ?2)",
                params![source_id, destination.to_string()],
            )
            .context("failed to insert source destination")?;
    }

    Ok(SourceId(source_id))
}

fn load_destinations(conn: &Connection, source_id: i64) -> Result<Vec<String>> {
    let mut stmt = conn
        .prepare_cached(
            "SELECT destination_site FROM source_destinations
             WHERE source_id = ?1 ORDER BY destination_site ASC",
        )
        .context("failed to prepare destination lookup")?;
    let rows = stmt.query_map(params![source_id], |row| row.get::<_, String>(0))?;
    let mut sites = Vec::new();
    for site in rows {
        sites.push(site?);
    }
    Ok(sites)
}

fn load_dedup_keys(conn: &Connection, source_id: i64, report_type: ReportType) -> Result<Vec<u64>> {
    let mut stmt = conn
        .prepare_cached(
            "SELECT dedup_key FROM dedup_keys
             WHERE source_id = ?1 AND report_type = ?2 ORDER BY dedup_key ASC",
        )
        .context("failed to prepare dedup key lookup")?;
    let rows = stmt.query_map(params![source_id, report_type_to_sql(report_type)], |row| {
        row.get::<_, i64>(0)
    })?;
    let mut keys = Vec::new();
    for key in rows {
        keys.push(u64_from_sql(key?));
    }
    Ok(keys)
}

/// Finishes reading a source row. Rows that violate source invariants yield
/// `Ok(None)` and are logged.
fn load_source(ctx: &StoreContext<'_>, row: SourceRow) -> Result<Option<StoredSource>> {
    let source_id = row.source_id;
    let destinations = load_destinations(ctx.conn, source_id)?;
    let dedup_keys = load_dedup_keys(ctx.conn, source_id, ReportType::EventLevel)?;
    let aggregatable_dedup_keys =
        load_dedup_keys(ctx.conn, source_id, ReportType::AggregatableAttribution)?;

    match decode_source(ctx, row, &destinations, dedup_keys, aggregatable_dedup_keys) {
        Ok(source) => Ok(Some(source)),
        Err(err) => {
            debug!(
                "event=source_row_dropped source_id={} reason={:#}",
                source_id, err
            );
            Ok(None)
        }
    }
}

fn decode_source(
    ctx: &StoreContext<'_>,
    row: SourceRow,
    destinations: &[String],
    dedup_keys: Vec<u64>,
    aggregatable_dedup_keys: Vec<u64>,
) -> Result<StoredSource> {
    let source_origin = SuitableOrigin::parse(&row.source_origin)
        .map_err(|err| anyhow!("invalid source_origin: {err}"))?;
    let reporting_origin = SuitableOrigin::parse(&row.reporting_origin)
        .map_err(|err| anyhow!("invalid reporting_origin: {err}"))?;
    let source_type = SourceType::parse(&row.source_type)
        .ok_or_else(|| anyhow!("invalid source_type: {}", row.source_type))?;
    let attribution_logic = AttributionLogic::parse(&row.attribution_logic)
        .ok_or_else(|| anyhow!("invalid attribution_logic: {}", row.attribution_logic))?;
    let active_state = ActiveState::parse(&row.active_state)
        .ok_or_else(|| anyhow!("invalid active_state: {}", row.active_state))?;

    let source_time = from_micros(row.source_time).map_err(|err| anyhow!("{err}"))?;
    let expiry_time = from_micros(row.expiry_time).map_err(|err| anyhow!("{err}"))?;
    let aggregatable_report_window_time =
        from_micros(row.aggregatable_report_window_time).map_err(|err| anyhow!("{err}"))?;
    check_lifetime("expiry_time", source_time, expiry_time)?;
    check_lifetime(
        "aggregatable_report_window_time",
        source_time,
        aggregatable_report_window_time,
    )?;

    if destinations.is_empty() {
        return Err(anyhow!("source has no destinations"));
    }
    let destination_sites = destinations
        .iter()
        .map(|site| SchemefulSite::parse(site))
        .collect::<Result<BTreeSet<_>, _>>()
        .map_err(|err| anyhow!("invalid destination site: {err}"))?;

    let filter_data = decode_filter_data(&row.filter_data)?;
    let aggregation_keys = decode_aggregation_keys(&row.aggregatable_source)?;
    let read_only = decode_read_only_source_data(&row.read_only_source_data)?;

    let num_attributions = u32::try_from(row.num_attributions)
        .map_err(|_| anyhow!("invalid num_attributions: {}", row.num_attributions))?;
    let num_aggregatable_reports = u32::try_from(row.num_aggregatable_reports).map_err(|_| {
        anyhow!(
            "invalid num_aggregatable_reports: {}",
            row.num_aggregatable_reports
        )
    })?;
    if row.aggregatable_budget_consumed < 0 {
        return Err(anyhow!(
            "invalid aggregatable_budget_consumed: {}",
            row.aggregatable_budget_consumed
        ));
    }

    let randomized_response_rate = read_only.randomized_response_rate.unwrap_or_else(|| {
        ctx.delegate.randomized_response_rate(
            source_type,
            &read_only.event_report_windows,
            read_only.max_event_level_reports,
        )
    });

    Ok(StoredSource {
        source_id: SourceId(row.source_id),
        source_event_id: u64_from_sql(row.source_event_id),
        source_origin,
        reporting_origin,
        source_type,
        destination_sites,
        source_time,
        expiry_time,
        event_report_windows: read_only.event_report_windows,
        aggregatable_report_window_time,
        max_event_level_reports: read_only.max_event_level_reports,
        priority: row.priority,
        filter_data,
        debug_key: row.debug_key.map(u64_from_sql),
        aggregation_keys,
        attribution_logic,
        active_state,
        num_attributions,
        num_aggregatable_reports,
        aggregatable_budget_consumed: row.aggregatable_budget_consumed,
        randomized_response_rate,
        dedup_keys,
        aggregatable_dedup_keys,
        debug_reporting: row.debug_reporting,
        is_within_fenced_frame: row.is_within_fenced_frame,
    })
}

fn check_lifetime(column: &str, source_time: OffsetDateTime, end: OffsetDateTime) -> Result<()> {
    let lifetime = end - source_time;
    if !lifetime.is_positive() || lifetime > MAX_SOURCE_EXPIRY {
        return Err(anyhow!("{column} is outside (0, 30 days] of source_time"));
    }
    Ok(())
}

fn query_sources<P: rusqlite::Params>(
    ctx: &StoreContext<'_>,
    sql: &str,
    params: P,
) -> Result<Vec<StoredSource>> {
    let rows = {
        let mut stmt = ctx
            .conn
            .prepare(sql)
            .context("failed to prepare source query")?;
        let mapped = stmt.query_map(params, parse_source_row)?;
        let mut rows = Vec::new();
        for row in mapped {
            rows.push(row?);
        }
        rows
    };

    let mut sources = Vec::with_capacity(rows.len());
    for row in rows {
        if let Some(source) = load_source(ctx, row)? {
            sources.push(source);
        }
    }
    Ok(sources)
}

pub(crate) fn read_source(ctx: &StoreContext<'_>, source_id: SourceId) -> Result<Option<StoredSource>> {
    let row = ctx
        .conn
        .query_row(
            &format!("SELECT {SOURCE_COLUMNS} FROM sources s WHERE s.source_id = ?1"),
            params![source_id.0],
            parse_source_row,
        )
        .optional()
        .context("failed to read source")?;
    match row {
        Some(row) => load_source(ctx, row),
        None => Ok(None),
    }
}

/// Unexpired sources that have not been deactivated, oldest first.
pub(crate) fn get_active_sources(ctx: &StoreContext<'_>) -> Result<Vec<StoredSource>> {
    query_sources(
        ctx,
        &format!(
            "SELECT {SOURCE_COLUMNS} FROM sources s
             WHERE s.active_state <> 'inactive' AND s.expiry_time > ?1
             ORDER BY s.source_id ASC"
        ),
        params![to_micros(ctx.now)],
    )
}

/// Attribution candidates for a trigger on `destination_site` reported by
/// `reporting_origin`.
pub(crate) fn find_matching_sources(
    ctx: &StoreContext<'_>,
    destination_site: &SchemefulSite,
    reporting_origin: &SuitableOrigin,
) -> Result<Vec<StoredSource>> {
    query_sources(
        ctx,
        &format!(
            "SELECT {SOURCE_COLUMNS} FROM sources s
             JOIN source_destinations d ON d.source_id = s.source_id
             WHERE d.destination_site = ?1
               AND s.reporting_origin = ?2
               AND s.active_state <> 'inactive'
               AND s.expiry_time > ?3
             ORDER BY s.source_id ASC"
        ),
        params![
            destination_site.to_string(),
            reporting_origin.to_string(),
            to_micros(ctx.now)
        ],
    )
}

/// Deletes the lowest-priority, oldest unexpired sources of
/// `reporting_origin` until one more source fits under the delegate's cap.
pub(crate) fn evict_for_capacity(
    ctx: &StoreContext<'_>,
    reporting_origin: &SuitableOrigin,
) -> Result<usize> {
    let max = ctx.delegate.max_sources_per_origin();
    let count: i64 = ctx
        .conn
        .query_row(
            "SELECT COUNT(*) FROM sources WHERE reporting_origin = ?1 AND expiry_time > ?2",
            params![reporting_origin.to_string(), to_micros(ctx.now)],
            |row| row.get(0),
        )
        .context("failed to count sources for reporting origin")?;
    let count = usize::try_from(count).unwrap_or(0);
    if count < max {
        return Ok(0);
    }

    let excess = i64::try_from(count - max + 1).unwrap_or(i64::MAX);
    let ids = {
        let mut stmt = ctx
            .conn
            .prepare(
                "SELECT source_id FROM sources
                 WHERE reporting_origin = ?1 AND expiry_time > ?2
                 ORDER BY priority ASC, source_time ASC, source_id ASC
                 LIMIT ?3",
            )
            .context("failed to prepare eviction query")?;
        let rows = stmt.query_map(
            params![reporting_origin.to_string(), to_micros(ctx.now), excess],
            |row| row.get::<_, i64>(0).map(SourceId),
        )?;
        let mut ids = Vec::new();
        for id in rows {
            ids.push(id?);
        }
        ids
    };

    let deleted = delete_sources(ctx.conn, &ids)?;
    debug!(
        "event=sources_evicted reporting_origin={} sources={} reports={}",
        reporting_origin,
        deleted.sources,
        deleted.event_level_reports + deleted.aggregatable_reports
    );
    Ok(deleted.sources)
}

/// Marks a source ineligible for further attribution. Returns whether the
/// source existed and was not already inactive.
pub(crate) fn deactivate(conn: &Connection, source_id: SourceId) -> Result<bool> {
    let changed = conn
        .execute(
            "UPDATE sources SET active_state = 'inactive'
             WHERE source_id = ?1 AND active_state <> 'inactive'",
            params![source_id.0],
        )
        .context("failed to deactivate source")?;
    Ok(changed > 0)
}

/// Counts one more event-level attribution, moving an active source to the
/// reached-limit state once its quota is used up.
pub(crate) fn record_event_level_attribution(conn: &Connection, source: &StoredSource) -> Result<()> {
    conn.execute(
        "UPDATE sources SET
           num_attributions = num_attributions + 1,
           active_state = CASE
             WHEN active_state = 'active' AND num_attributions + 1 >= ?2
               THEN 'reached_event_level_attribution_limit'
             ELSE active_state
           END
         WHERE source_id = ?1",
        params![source.source_id.0, i64::from(source.max_event_level_reports)],
    )
    .context("failed to update source attributions")?;
    Ok(())
}

pub(crate) fn record_aggregatable_attribution(
    conn: &Connection,
    source_id: SourceId,
    budget_consumed: i64,
) -> Result<()> {
    conn.execute(
        "UPDATE sources SET
           num_aggregatable_reports = num_aggregatable_reports + 1,
           aggregatable_budget_consumed = aggregatable_budget_consumed + ?2
         WHERE source_id = ?1",
        params![source_id.0, budget_consumed],
    )
    .context("failed to update source aggregatable budget")?;
    Ok(())
}

pub(crate) fn store_dedup_key(
    conn: &Connection,
    source_id: SourceId,
    report_type: ReportType,
    dedup_key: u64,
) -> Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO dedup_keys(source_id, report_type, dedup_key) VALUES (?1, ?2, ?3)",
        params![
            source_id.0,
            report_type_to_sql(report_type),
            u64_to_sql(dedup_key)
        ],
    )
    .context("failed to store dedup key")?;
    Ok(())
}

fn has_reports(conn: &Connection, source_id: SourceId) -> Result<bool> {
    let found = conn
        .query_row(
            "SELECT 1 FROM reports WHERE source_id = ?1 LIMIT 1",
            params![source_id.0],
            |_| Ok(()),
        )
        .optional()
        .context("failed to look up reports for source")?
        .is_some();
    Ok(found)
}

/// Retires candidates that lost to `winner`: sources that never produced
/// anything are deleted, the rest become inactive.
pub(crate) fn retire_superseded(
    conn: &Connection,
    winner: SourceId,
    candidates: &[StoredSource],
) -> Result<()> {
    for candidate in candidates.iter().filter(|source| source.source_id != winner) {
        let untouched = candidate.num_attributions == 0
            && candidate.num_aggregatable_reports == 0
            && candidate.aggregatable_budget_consumed == 0
            && !has_reports(conn, candidate.source_id)?;
        if untouched {
            delete_sources(conn, &[candidate.source_id])?;
        } else {
            deactivate(conn, candidate.source_id)?;
        }
    }
    Ok(())
}

/// Deletes sources together with their destinations, dedup keys and reports.
pub(crate) fn delete_sources(conn: &Connection, source_ids: &[SourceId]) -> Result<DeletionCounts> {
    let mut counts = DeletionCounts::default();
    let event_level = report_type_to_sql(ReportType::EventLevel);
    for source_id in source_ids {
        counts.event_level_reports += conn
            .execute(
                "DELETE FROM reports WHERE source_id = ?1 AND report_type = ?2",
                params![source_id.0, event_level],
            )
            .context("failed to delete event-level reports for source")?;
        counts.aggregatable_reports += conn
            .execute(
                "DELETE FROM reports WHERE source_id = ?1 AND report_type <> ?2",
                params![source_id.0, event_level],
            )
            .context("failed to delete aggregatable reports for source")?;
        conn.execute(
            "DELETE FROM source_destinations WHERE source_id = ?1",
            params![source_id.0],
        )
        .context("failed to delete source destinations")?;
        conn.execute(
            "DELETE FROM dedup_keys WHERE source_id = ?1",
            params![source_id.0],
        )
        .context("failed to delete dedup keys")?;
        counts.sources += conn
            .execute(
                "DELETE FROM sources WHERE source_id = ?1",
                params![source_id.0],
            )
            .context("failed to delete source")?;
    }
    Ok(counts)
}

/// Deletes up to `limit` expired sources that no longer back any report.
pub(crate) fn delete_expired_sources(ctx: &StoreContext<'_>, limit: usize) -> Result<usize> {
    let ids = {
        let mut stmt = ctx
            .conn
            .prepare(
                "SELECT s.source_id FROM sources s
                 WHERE s.expiry_time <= ?1
                   AND NOT EXISTS (SELECT 1 FROM reports r WHERE r.source_id = s.source_id)
                 ORDER BY s.source_id ASC
                 LIMIT ?2",
            )
            .context("failed to prepare expired source query")?;
        let rows = stmt.query_map(
            params![
                to_micros(ctx.now),
                i64::try_from(limit).unwrap_or(i64::MAX)
            ],
            |row| row.get::<_, i64>(0).map(SourceId),
        )?;
        let mut ids = Vec::new();
        for id in rows {
            ids.push(id?);
        }
        ids
    };
    Ok(delete_sources(ctx.conn, &ids)?.sources)
}
