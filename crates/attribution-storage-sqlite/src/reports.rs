use std::collections::BTreeMap;

use anyhow::{anyhow, Context, Result};
use attribution_storage_core::timestamps::{from_micros, to_micros};
use attribution_storage_core::{
    AggregatableAttributionData, AttributionInfo, AttributionReport, EventLevelData,
    NullAggregatableData, ReportData, ReportId, ReportType, SchemefulSite, SourceId,
    StoredSource, SuitableOrigin,
};
use log::debug;
use rusqlite::{params, Connection, Row};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::codec::{
    decode_aggregatable_metadata, decode_event_level_metadata,
    decode_null_aggregatable_metadata, encode_aggregatable_metadata,
    encode_event_level_metadata, encode_null_aggregatable_metadata, u64_from_sql, u64_to_sql,
};
use crate::context::StoreContext;
use crate::sources;

const REPORT_COLUMNS: &str = "report_id, source_id, trigger_time, report_time,
    initial_report_time, failed_send_attempts, external_report_id, debug_key,
    context_origin, reporting_origin, report_type, metadata";

pub(crate) fn report_type_to_sql(report_type: ReportType) -> i64 {
    match report_type {
        ReportType::EventLevel => 0,
        ReportType::AggregatableAttribution => 1,
        ReportType::NullAggregatable => 2,
    }
}

pub(crate) fn report_type_from_sql(value: i64) -> Option<ReportType> {
    match value {
        0 => Some(ReportType::EventLevel),
        1 => Some(ReportType::AggregatableAttribution),
        2 => Some(ReportType::NullAggregatable),
        _ => None,
    }
}

struct ReportRow {
    report_id: i64,
    source_id: Option<i64>,
    trigger_time: i64,
    report_time: i64,
    initial_report_time: i64,
    failed_send_attempts: i64,
    external_report_id: String,
    debug_key: Option<i64>,
    context_origin: String,
    reporting_origin: String,
    report_type: i64,
    metadata: String,
}

fn parse_report_row(row: &Row<'_>) -> rusqlite::Result<ReportRow> {
    Ok(ReportRow {
        report_id: row.get(0)?,
        source_id: row.get(1)?,
        trigger_time: row.get(2)?,
        report_time: row.get(3)?,
        initial_report_time: row.get(4)?,
        failed_send_attempts: row.get(5)?,
        external_report_id: row.get(6)?,
        debug_key: row.get(7)?,
        context_origin: row.get(8)?,
        reporting_origin: row.get(9)?,
        report_type: row.get(10)?,
        metadata: row.get(11)?,
    })
}

/// Persists `report`, ignoring its `id`; returns the assigned id.
pub(crate) fn insert_report(conn: &Connection, report: &AttributionReport) -> Result<ReportId> {
    let (source_id, metadata) = match &report.data {
        ReportData::EventLevel(data) => (
            Some(data.source.source_id.0),
            encode_event_level_metadata(data.trigger_data, data.priority)?,
        ),
        ReportData::AggregatableAttribution(data) => (
            Some(data.source.source_id.0),
            encode_aggregatable_metadata(&data.common, &data.contributions)?,
        ),
        ReportData::NullAggregatable(data) => (
            None,
            encode_null_aggregatable_metadata(&data.common, data.fake_source_time)?,
        ),
    };

    conn.execute(
        "INSERT INTO reports(
           source_id, trigger_time, report_time, initial_report_time, failed_send_attempts,
           external_report_id, debug_key, context_origin, reporting_origin, report_type, metadata
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            source_id,
            to_micros(report.attribution_info.time),
            to_micros(report.report_time),
            to_micros(report.initial_report_time),
            i64::from(report.failed_send_attempts),
            report.external_report_id.to_string(),
            report.attribution_info.debug_key.map(u64_to_sql),
            report.attribution_info.context_origin.to_string(),
            report.reporting_origin.to_string(),
            report_type_to_sql(report.report_type()),
            metadata,
        ],
    )
    .context("failed to insert report")?;

    Ok(ReportId(conn.last_insert_rowid()))
}

/// Reads reports and decodes them, dropping rows that fail to decode.
fn query_reports<P: rusqlite::Params>(
    ctx: &StoreContext<'_>,
    sql: &str,
    params: P,
) -> Result<Vec<AttributionReport>> {
    let rows = {
        let mut stmt = ctx
            .conn
            .prepare(sql)
            .context("failed to prepare report query")?;
        let mapped = stmt.query_map(params, parse_report_row)?;
        let mut rows = Vec::new();
        for row in mapped {
            rows.push(row?);
        }
        rows
    };

    let mut source_cache: BTreeMap<i64, Option<StoredSource>> = BTreeMap::new();
    let mut reports = Vec::with_capacity(rows.len());
    for row in rows {
        let report_id = row.report_id;
        let source = match row.source_id {
            Some(source_id) => match source_cache.get(&source_id) {
                Some(cached) => cached.clone(),
                None => {
                    let source = sources::read_source(ctx, SourceId(source_id))?;
                    source_cache.insert(source_id, source.clone());
                    source
                }
            },
            None => None,
        };
        match decode_report(ctx, row, source) {
            Ok(report) => reports.push(report),
            Err(err) => debug!(
                "event=report_row_dropped report_id={} reason={:#}",
                report_id, err
            ),
        }
    }
    Ok(reports)
}

fn decode_report(
    ctx: &StoreContext<'_>,
    row: ReportRow,
    source: Option<StoredSource>,
) -> Result<AttributionReport> {
    let report_type = report_type_from_sql(row.report_type)
        .ok_or_else(|| anyhow!("invalid report_type: {}", row.report_type))?;
    let reporting_origin = SuitableOrigin::parse(&row.reporting_origin)
        .map_err(|err| anyhow!("invalid reporting_origin: {err}"))?;
    let context_origin = SuitableOrigin::parse(&row.context_origin)
        .map_err(|err| anyhow!("invalid context_origin: {err}"))?;
    let external_report_id = Uuid::parse_str(&row.external_report_id)
        .map_err(|err| anyhow!("invalid external_report_id: {err}"))?;
    let trigger_time = from_micros(row.trigger_time).map_err(|err| anyhow!("{err}"))?;
    let report_time = from_micros(row.report_time).map_err(|err| anyhow!("{err}"))?;
    let initial_report_time =
        from_micros(row.initial_report_time).map_err(|err| anyhow!("{err}"))?;
    let failed_send_attempts = u32::try_from(row.failed_send_attempts).map_err(|_| {
        anyhow!(
            "invalid failed_send_attempts: {}",
            row.failed_send_attempts
        )
    })?;

    let data = match report_type {
        ReportType::EventLevel => {
            let source = attributed_source(source, &reporting_origin)?;
            let (trigger_data, priority) = decode_event_level_metadata(&row.metadata)?;
            ReportData::EventLevel(EventLevelData {
                trigger_data,
                priority,
                source: Box::new(source),
            })
        }
        ReportType::AggregatableAttribution => {
            let source = attributed_source(source, &reporting_origin)?;
            let (common, contributions) =
                decode_aggregatable_metadata(&row.metadata, ctx.aggregatable_budget())?;
            ReportData::AggregatableAttribution(AggregatableAttributionData {
                common,
                contributions,
                source: Box::new(source),
            })
        }
        ReportType::NullAggregatable => {
            if row.source_id.is_some() {
                return Err(anyhow!("null aggregatable report references a source"));
            }
            let (common, fake_source_time) = decode_null_aggregatable_metadata(&row.metadata)?;
            ReportData::NullAggregatable(NullAggregatableData {
                common,
                fake_source_time,
            })
        }
    };

    Ok(AttributionReport {
        id: ReportId(row.report_id),
        attribution_info: AttributionInfo {
            time: trigger_time,
            debug_key: row.debug_key.map(u64_from_sql),
            context_origin,
        },
        report_time,
        initial_report_time,
        external_report_id,
        failed_send_attempts,
        reporting_origin,
        data,
    })
}

fn attributed_source(
    source: Option<StoredSource>,
    reporting_origin: &SuitableOrigin,
) -> Result<StoredSource> {
    let source = source.ok_or_else(|| anyhow!("attributed source is missing or invalid"))?;
    if &source.reporting_origin != reporting_origin {
        return Err(anyhow!(
            "report reporting_origin {} differs from source reporting_origin {}",
            reporting_origin,
            source.reporting_origin
        ));
    }
    Ok(source)
}

/// Reports due at or before `max_report_time`, earliest first.
pub(crate) fn get_reports_due(
    ctx: &StoreContext<'_>,
    max_report_time: OffsetDateTime,
    limit: Option<usize>,
) -> Result<Vec<AttributionReport>> {
    let limit = limit.map_or(-1, |limit| i64::try_from(limit).unwrap_or(i64::MAX));
    query_reports(
        ctx,
        &format!(
            "SELECT {REPORT_COLUMNS} FROM reports
             WHERE report_time <= ?1
             ORDER BY report_time ASC, report_id ASC
             LIMIT ?2"
        ),
        params![to_micros(max_report_time), limit],
    )
}

pub(crate) fn get_reports_by_ids(
    ctx: &StoreContext<'_>,
    ids: &[ReportId],
) -> Result<Vec<AttributionReport>> {
    let mut reports = Vec::with_capacity(ids.len());
    for id in ids {
        reports.extend(query_reports(
            ctx,
            &format!("SELECT {REPORT_COLUMNS} FROM reports WHERE report_id = ?1"),
            params![id.0],
        )?);
    }
    Ok(reports)
}

pub(crate) fn next_report_time(
    conn: &Connection,
    after: OffsetDateTime,
) -> Result<Option<OffsetDateTime>> {
    let micros: Option<i64> = conn
        .query_row(
            "SELECT MIN(report_time) FROM reports WHERE report_time > ?1",
            params![to_micros(after)],
            |row| row.get(0),
        )
        .context("failed to query next report time")?;
    micros
        .map(|value| from_micros(value).map_err(|err| anyhow!("{err}")))
        .transpose()
}

pub(crate) fn delete_report(conn: &Connection, report_id: ReportId) -> Result<bool> {
    let deleted = conn
        .execute("DELETE FROM reports WHERE report_id = ?1", params![report_id.0])
        .context("failed to delete report")?;
    Ok(deleted > 0)
}

pub(crate) fn update_for_send_failure(
    conn: &Connection,
    report_id: ReportId,
    new_report_time: OffsetDateTime,
) -> Result<bool> {
    let updated = conn
        .execute(
            "UPDATE reports SET
               report_time = ?2,
               failed_send_attempts = failed_send_attempts + 1
             WHERE report_id = ?1",
            params![report_id.0, to_micros(new_report_time)],
        )
        .context("failed to update report after send failure")?;
    Ok(updated > 0)
}

/// Reports of `report_type` whose source lists `destination_site`.
pub(crate) fn count_for_destination(
    conn: &Connection,
    report_type: ReportType,
    destination_site: &SchemefulSite,
) -> Result<usize> {
    let count: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM source_destinations d
             JOIN reports r ON r.source_id = d.source_id
             WHERE d.destination_site = ?1 AND r.report_type = ?2",
            params![destination_site.to_string(), report_type_to_sql(report_type)],
            |row| row.get(0),
        )
        .context("failed to count reports for destination")?;
    Ok(usize::try_from(count).unwrap_or(0))
}

/// The pending event-level report of `source` that a higher-priority trigger
/// would displace: lowest priority first, latest trigger time on ties.
pub(crate) fn lowest_priority_event_report(
    ctx: &StoreContext<'_>,
    source: &StoredSource,
    report_time: OffsetDateTime,
) -> Result<Option<AttributionReport>> {
    let candidates = query_reports(
        ctx,
        &format!(
            "SELECT {REPORT_COLUMNS} FROM reports
             WHERE source_id = ?1 AND report_type = ?2 AND report_time = ?3"
        ),
        params![
            source.source_id.0,
            report_type_to_sql(ReportType::EventLevel),
            to_micros(report_time)
        ],
    )?;

    Ok(candidates
        .into_iter()
        .filter_map(|report| match &report.data {
            ReportData::EventLevel(data) => Some((data.priority, report)),
            _ => None,
        })
        .min_by(|(a_priority, a), (b_priority, b)| {
            a_priority
                .cmp(b_priority)
                .then_with(|| b.attribution_info.time.cmp(&a.attribution_info.time))
                .then_with(|| b.id.cmp(&a.id))
        })
        .map(|(_, report)| report))
}
