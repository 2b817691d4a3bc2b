use std::collections::BTreeSet;

use anyhow::{Context, Result};
use attribution_storage_core::timestamps::to_micros;
use attribution_storage_core::{DataKey, ReportType, SourceId, StorageKeyFilter, SuitableOrigin};
use log::{debug, info};
use rusqlite::{params, Connection};
use time::OffsetDateTime;

use crate::rate_limits::{self, matches_filter};
use crate::reports::report_type_from_sql;
use crate::sources::{self, DeletionCounts};

/// Removes sources registered and reports triggered in `[begin, end]` whose
/// reporting origin passes `filter`. Every source touched this way is removed
/// with all of its reports.
pub(crate) fn clear_data(
    conn: &Connection,
    begin: OffsetDateTime,
    end: OffsetDateTime,
    filter: StorageKeyFilter<'_>,
    delete_rate_limit_data: bool,
) -> Result<DeletionCounts> {
    let (begin_micros, end_micros) = (to_micros(begin), to_micros(end));
    let mut source_ids: BTreeSet<i64> = BTreeSet::new();

    {
        let mut stmt = conn
            .prepare(
                "SELECT source_id, reporting_origin FROM sources
                 WHERE source_time BETWEEN ?1 AND ?2",
            )
            .context("failed to prepare source clearing query")?;
        let rows = stmt.query_map(params![begin_micros, end_micros], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
        })?;
        for row in rows {
            let (source_id, reporting_origin) = row?;
            if matches_filter(&reporting_origin, filter) {
                source_ids.insert(source_id);
            }
        }
    }

    let reports = {
        let mut stmt = conn
            .prepare(
                "SELECT report_id, source_id, reporting_origin, report_type FROM reports
                 WHERE trigger_time BETWEEN ?1 AND ?2",
            )
            .context("failed to prepare report clearing query")?;
        let rows = stmt.query_map(params![begin_micros, end_micros], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, Option<i64>>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)?,
            ))
        })?;
        let mut reports = Vec::new();
        for row in rows {
            reports.push(row?);
        }
        reports
    };

    let mut counts = DeletionCounts::default();
    for (report_id, source_id, reporting_origin, report_type) in reports {
        if !matches_filter(&reporting_origin, filter) {
            continue;
        }
        if let Some(source_id) = source_id {
            source_ids.insert(source_id);
        }
        let deleted = conn
            .execute("DELETE FROM reports WHERE report_id = ?1", params![report_id])
            .context("failed to delete report")?;
        if report_type_from_sql(report_type) == Some(ReportType::EventLevel) {
            counts.event_level_reports += deleted;
        } else {
            counts.aggregatable_reports += deleted;
        }
    }

    let source_ids: Vec<SourceId> = source_ids.into_iter().map(SourceId).collect();
    counts.absorb(sources::delete_sources(conn, &source_ids)?);

    let mut rate_limit_rows = 0;
    if delete_rate_limit_data {
        rate_limit_rows += rate_limits::delete_for_sources(conn, &source_ids)?;
        rate_limit_rows += rate_limits::delete_in_range(conn, begin, end, filter)?;
    }

    info!(
        "event=data_cleared sources={} event_level_reports={} aggregatable_reports={} rate_limits={}",
        counts.sources, counts.event_level_reports, counts.aggregatable_reports, rate_limit_rows
    );
    Ok(counts)
}

/// Every reporting origin that still owns a source, a report or a ledger row.
pub(crate) fn get_all_data_keys(conn: &Connection) -> Result<BTreeSet<DataKey>> {
    let mut stmt = conn
        .prepare(
            "SELECT reporting_origin FROM sources
             UNION SELECT reporting_origin FROM reports
             UNION SELECT reporting_origin FROM rate_limits",
        )
        .context("failed to prepare data key query")?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

    let mut keys = BTreeSet::new();
    for row in rows {
        let raw = row?;
        match SuitableOrigin::parse(&raw) {
            Ok(origin) => {
                keys.insert(DataKey::new(origin));
            }
            Err(err) => debug!("event=data_key_skipped origin={} reason={}", raw, err),
        }
    }
    Ok(keys)
}
