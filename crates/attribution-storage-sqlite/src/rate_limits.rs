use anyhow::{Context, Result};
use attribution_storage_core::timestamps::{saturating_sub, to_micros};
use attribution_storage_core::{
    SchemefulSite, SourceId, StorableSource, StorageKey, StorageKeyFilter, StoredSource,
    SuitableOrigin,
};
use log::debug;
use rusqlite::{params, Connection};
use time::OffsetDateTime;

use crate::context::StoreContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RateLimitScope {
    Source,
    Attribution,
}

impl RateLimitScope {
    fn as_str(self) -> &'static str {
        match self {
            Self::Source => "source",
            Self::Attribution => "attribution",
        }
    }
}

/// Outcome of the attribution-scope checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RateLimitResult {
    Allowed,
    NotAllowed,
    ExcessiveReportingOrigins,
}

pub(crate) struct RateLimitRecord<'a> {
    pub scope: RateLimitScope,
    pub source_id: SourceId,
    pub source_site: &'a SchemefulSite,
    pub destination_site: &'a SchemefulSite,
    pub context_origin: &'a SuitableOrigin,
    pub reporting_origin: &'a SuitableOrigin,
}

pub(crate) fn record(ctx: &StoreContext<'_>, record: &RateLimitRecord<'_>) -> Result<()> {
    ctx.conn
        .execute(
            "INSERT INTO rate_limits(
               scope, source_id, source_site, destination_site, context_origin,
               reporting_origin, reporting_site, time
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                record.scope.as_str(),
                record.source_id.0,
                record.source_site.to_string(),
                record.destination_site.to_string(),
                record.context_origin.to_string(),
                record.reporting_origin.to_string(),
                record.reporting_origin.site().to_string(),
                to_micros(ctx.now),
            ],
        )
        .context("failed to record rate limit")?;
    Ok(())
}

fn window_start(ctx: &StoreContext<'_>) -> i64 {
    to_micros(saturating_sub(ctx.now, ctx.delegate.rate_limits().time_window))
}

fn count(conn: &Connection, sql: &str, params: impl rusqlite::Params) -> Result<usize> {
    let value: i64 = conn
        .query_row(sql, params, |row| row.get(0))
        .context("failed to count rate limits")?;
    Ok(usize::try_from(value).unwrap_or(0))
}

/// Whether another reporting origin may register `source` for
/// `destination_site` within the current window.
pub(crate) fn source_registration_allowed(
    ctx: &StoreContext<'_>,
    source: &StorableSource,
    destination_site: &SchemefulSite,
) -> Result<bool> {
    let max = ctx
        .delegate
        .rate_limits()
        .max_source_registration_reporting_origins;
    let origins = count(
        ctx.conn,
        "SELECT COUNT(DISTINCT reporting_origin) FROM rate_limits
         WHERE scope = 'source'
           AND source_site = ?1
           AND destination_site = ?2
           AND reporting_origin <> ?3
           AND time > ?4",
        params![
            source.source_site().to_string(),
            destination_site.to_string(),
            source.reporting_origin.to_string(),
            window_start(ctx),
        ],
    )?;
    if origins >= max {
        debug!(
            "event=source_rate_limited source_site={} destination_site={} reporting_origins={}",
            source.source_site(),
            destination_site,
            origins
        );
        return Ok(false);
    }
    Ok(true)
}

/// Checks the attribution caps for attributing `source` on `destination_site`.
pub(crate) fn attribution_allowed(
    ctx: &StoreContext<'_>,
    source: &StoredSource,
    destination_site: &SchemefulSite,
    reporting_origin: &SuitableOrigin,
) -> Result<RateLimitResult> {
    let limits = ctx.delegate.rate_limits();
    let source_site = source.source_site().to_string();
    let destination_site = destination_site.to_string();
    let since = window_start(ctx);

    let attributions = count(
        ctx.conn,
        "SELECT COUNT(*) FROM rate_limits
         WHERE scope = 'attribution'
           AND source_site = ?1
           AND destination_site = ?2
           AND reporting_site = ?3
           AND time > ?4",
        params![
            source_site,
            destination_site,
            reporting_origin.site().to_string(),
            since
        ],
    )?;
    if attributions >= limits.max_attributions {
        return Ok(RateLimitResult::NotAllowed);
    }

    let origins = count(
        ctx.conn,
        "SELECT COUNT(DISTINCT reporting_origin) FROM rate_limits
         WHERE scope = 'attribution'
           AND source_site = ?1
           AND destination_site = ?2
           AND reporting_origin <> ?3
           AND time > ?4",
        params![
            source_site,
            destination_site,
            reporting_origin.to_string(),
            since
        ],
    )?;
    if origins >= limits.max_attribution_reporting_origins {
        return Ok(RateLimitResult::ExcessiveReportingOrigins);
    }

    Ok(RateLimitResult::Allowed)
}

/// Drops ledger rows that fell out of the window.
pub(crate) fn delete_expired(ctx: &StoreContext<'_>) -> Result<usize> {
    ctx.conn
        .execute(
            "DELETE FROM rate_limits WHERE time <= ?1",
            params![window_start(ctx)],
        )
        .context("failed to delete expired rate limits")
}

pub(crate) fn delete_for_sources(conn: &Connection, source_ids: &[SourceId]) -> Result<usize> {
    let mut deleted = 0;
    for source_id in source_ids {
        deleted += conn
            .execute(
                "DELETE FROM rate_limits WHERE source_id = ?1",
                params![source_id.0],
            )
            .context("failed to delete rate limits for source")?;
    }
    Ok(deleted)
}

/// Deletes ledger rows recorded in `[begin, end]` whose reporting origin
/// passes `filter`.
pub(crate) fn delete_in_range(
    conn: &Connection,
    begin: OffsetDateTime,
    end: OffsetDateTime,
    filter: StorageKeyFilter<'_>,
) -> Result<usize> {
    let candidates = {
        let mut stmt = conn
            .prepare(
                "SELECT id, reporting_origin FROM rate_limits
                 WHERE time BETWEEN ?1 AND ?2",
            )
            .context("failed to prepare rate limit range query")?;
        let rows = stmt.query_map(params![to_micros(begin), to_micros(end)], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut candidates = Vec::new();
        for row in rows {
            candidates.push(row?);
        }
        candidates
    };

    let mut deleted = 0;
    for (id, reporting_origin) in candidates {
        if matches_filter(&reporting_origin, filter) {
            deleted += conn
                .execute("DELETE FROM rate_limits WHERE id = ?1", params![id])
                .context("failed to delete rate limit")?;
        }
    }
    Ok(deleted)
}

/// Applies a clearing filter to a stored reporting origin. Unparseable
/// origins only match the match-everything filter.
pub(crate) fn matches_filter(reporting_origin: &str, filter: StorageKeyFilter<'_>) -> bool {
    match filter {
        None => true,
        Some(filter) => SuitableOrigin::parse(reporting_origin)
            .is_ok_and(|origin| filter(&StorageKey::first_party(origin))),
    }
}
