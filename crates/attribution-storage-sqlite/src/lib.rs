#![allow(clippy::missing_errors_doc)]
#![allow(clippy::uninlined_format_args)]

//! SQLite-backed attribution storage.
//!
//! [`AttributionStorageSql`] owns one database file inside a storage
//! directory. The file is created by the first operation that has something
//! to persist; reads against a missing file return empty results without
//! touching disk. Version mismatches raze the database and corruption is
//! recovered (or razed) on open. When the file cannot be opened at all the
//! engine degrades to a no-op: writes report internal errors and reads
//! return nothing.

mod attribution;
mod clearing;
mod codec;
mod context;
mod rate_limits;
mod reports;
mod schema;
mod sources;

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use attribution_storage_core::timestamps::{max_time, min_time};
use attribution_storage_core::{
    AttributionReport, AttributionStorage, AttributionTrigger, Clock, CreateReportResult, DataKey,
    ReportId, SourceId, StorableSource, StorageConfig, StorageDelegate, StorageKey,
    StorageKeyFilter, StoreSourceResult, StoreSourceStatus, StoredSource,
};
use log::{debug, error, info, warn};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::context::StoreContext;

pub use schema::{CorruptionDetected, COMPATIBLE_VERSION, CURRENT_VERSION};
pub use sources::DeletionCounts;

/// Result of the most recent attempt to open the database.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum InitStatus {
    Success,
    FailedToOpenDbFile,
    FailedToInitializeSchema,
    FailedToCreateDir,
    Razed,
    Recovered,
}

impl InitStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::FailedToOpenDbFile => "failed_to_open_db_file",
            Self::FailedToInitializeSchema => "failed_to_initialize_schema",
            Self::FailedToCreateDir => "failed_to_create_dir",
            Self::Razed => "razed",
            Self::Recovered => "recovered",
        }
    }

    fn is_usable(self) -> bool {
        matches!(self, Self::Success | Self::Razed | Self::Recovered)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbStatus {
    /// Only reads have happened and the file does not exist yet.
    DeferringCreation,
    Open,
    /// Opening failed for good; every operation is a no-op.
    ClosedDueToCatastrophicError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DbCreationPolicy {
    CreateIfAbsent,
    IgnoreIfAbsent,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StorageStats {
    pub init_status: Option<InitStatus>,
    pub last_clear: DeletionCounts,
}

pub struct AttributionStorageSql {
    path: PathBuf,
    config: StorageConfig,
    delegate: Arc<dyn StorageDelegate>,
    clock: Arc<dyn Clock>,
    conn: Option<Connection>,
    db_status: Option<DbStatus>,
    last_deleted_expired_sources: Option<OffsetDateTime>,
    stats: StorageStats,
}

impl AttributionStorageSql {
    /// Prepares storage rooted at `dir`. Nothing is opened or created until
    /// the first operation.
    pub fn new(
        dir: &Path,
        config: StorageConfig,
        delegate: Arc<dyn StorageDelegate>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config
            .validate()
            .context("invalid attribution storage config")?;
        Ok(Self {
            path: dir.join(&config.database_file_name),
            config,
            delegate,
            clock,
            conn: None,
            db_status: None,
            last_deleted_expired_sources: None,
            stats: StorageStats::default(),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn stats(&self) -> &StorageStats {
        &self.stats
    }

    #[must_use]
    pub fn db_status(&self) -> Option<DbStatus> {
        self.db_status
    }

    fn lazy_init(&mut self, policy: DbCreationPolicy) -> bool {
        match self.db_status {
            Some(DbStatus::Open) if self.conn.is_some() => return true,
            Some(DbStatus::ClosedDueToCatastrophicError) => return false,
            Some(DbStatus::DeferringCreation) if policy == DbCreationPolicy::IgnoreIfAbsent => {
                return false;
            }
            None if policy == DbCreationPolicy::IgnoreIfAbsent && !self.path.exists() => {
                self.db_status = Some(DbStatus::DeferringCreation);
                return false;
            }
            _ => {}
        }
        self.initialize_database()
    }

    fn initialize_database(&mut self) -> bool {
        let status = self.open_database();
        self.stats.init_status = Some(status);
        if status.is_usable() {
            info!(
                "event=database_opened path={} status={}",
                self.path.display(),
                status.as_str()
            );
            self.db_status = Some(DbStatus::Open);
            true
        } else {
            error!(
                "event=database_unavailable path={} status={}",
                self.path.display(),
                status.as_str()
            );
            self.conn = None;
            self.db_status = Some(DbStatus::ClosedDueToCatastrophicError);
            false
        }
    }

    fn open_database(&mut self) -> InitStatus {
        if let Some(dir) = self.path.parent() {
            if let Err(err) = fs::create_dir_all(dir) {
                warn!(
                    "event=storage_dir_failed dir={} error={}",
                    dir.display(),
                    err
                );
                return InitStatus::FailedToCreateDir;
            }
        }

        let mut conn = match schema::open(&self.path) {
            Ok(conn) => conn,
            Err(err) if schema::is_corruption(&err) => return self.recover_from_corruption(&err),
            Err(err) => {
                warn!("event=database_open_failed error={:#}", err);
                return InitStatus::FailedToOpenDbFile;
            }
        };

        match schema::ensure(&mut conn) {
            Ok(outcome) => {
                self.conn = Some(conn);
                if outcome == schema::SchemaOutcome::Razed {
                    InitStatus::Razed
                } else {
                    InitStatus::Success
                }
            }
            Err(err) if schema::is_corruption(&err) => {
                drop(conn);
                self.recover_from_corruption(&err)
            }
            Err(err) => {
                warn!("event=schema_init_failed error={:#}", err);
                InitStatus::FailedToInitializeSchema
            }
        }
    }

    fn recover_from_corruption(&mut self, cause: &anyhow::Error) -> InitStatus {
        warn!(
            "event=database_corrupt path={} error={:#}",
            self.path.display(),
            cause
        );

        let mut status = InitStatus::Razed;
        if self.config.use_builtin_recovery {
            match schema::recover(&self.path) {
                Ok(tables) => {
                    info!("event=database_recovered tables={}", tables);
                    status = InitStatus::Recovered;
                }
                Err(err) => warn!("event=database_recovery_failed error={:#}", err),
            }
        }

        if status == InitStatus::Recovered {
            match self.reopen() {
                Ok(conn) => {
                    self.conn = Some(conn);
                    return status;
                }
                Err(err) => {
                    warn!("event=recovered_database_unusable error={:#}", err);
                    status = InitStatus::Razed;
                }
            }
        }

        if let Err(err) = schema::delete_database_files(&self.path) {
            error!("event=database_delete_failed error={:#}", err);
            return InitStatus::FailedToOpenDbFile;
        }
        match self.reopen() {
            Ok(conn) => {
                self.conn = Some(conn);
                status
            }
            Err(err) => {
                error!("event=database_reopen_failed error={:#}", err);
                InitStatus::FailedToOpenDbFile
            }
        }
    }

    fn reopen(&self) -> Result<Connection> {
        let mut conn = schema::open(&self.path)?;
        schema::ensure(&mut conn)?;
        Ok(conn)
    }

    /// Runs `op` inside one transaction on the open connection.
    fn with_transaction<T>(
        &mut self,
        op: impl FnOnce(&StoreContext<'_>) -> Result<T>,
    ) -> Result<T> {
        let now = self.clock.now();
        let conn = self
            .conn
            .as_mut()
            .ok_or_else(|| anyhow!("database is not open"))?;
        let tx = conn.transaction().context("failed to begin transaction")?;
        let ctx = StoreContext {
            conn: &tx,
            delegate: self.delegate.as_ref(),
            config: &self.config,
            now,
        };
        let value = op(&ctx)?;
        tx.commit().context("failed to commit transaction")?;
        Ok(value)
    }

    fn run<T>(
        &mut self,
        operation: &str,
        policy: DbCreationPolicy,
        fallback: impl FnOnce() -> T,
        op: impl FnOnce(&StoreContext<'_>) -> Result<T>,
    ) -> T {
        if !self.lazy_init(policy) {
            return fallback();
        }
        match self.with_transaction(op) {
            Ok(value) => value,
            Err(err) => {
                self.handle_operation_error(operation, &err);
                fallback()
            }
        }
    }

    /// A corrupt database is dropped so that the next call reopens and
    /// recovers it.
    fn handle_operation_error(&mut self, operation: &str, err: &anyhow::Error) {
        error!(
            "event=operation_failed operation={} error={:#}",
            operation, err
        );
        if schema::is_corruption(err) {
            self.conn = None;
            self.db_status = None;
        }
    }

    fn maybe_delete_expired_sources(&mut self) {
        let now = self.clock.now();
        if let Some(last) = self.last_deleted_expired_sources {
            if now - last < self.delegate.delete_expired_sources_frequency() {
                return;
            }
        }

        let limit = self.config.expired_source_sweep_limit;
        let swept = self.with_transaction(|ctx| {
            let sources = sources::delete_expired_sources(ctx, limit)?;
            let rate_limits = rate_limits::delete_expired(ctx)?;
            Ok((sources, rate_limits))
        });
        match swept {
            Ok((sources, rate_limits)) => {
                info!(
                    "event=expired_sources_deleted sources={} rate_limits={}",
                    sources, rate_limits
                );
                self.last_deleted_expired_sources = Some(now);
            }
            Err(err) => self.handle_operation_error("delete_expired_sources", &err),
        }
    }
}

impl AttributionStorage for AttributionStorageSql {
    fn store_source(&mut self, source: &StorableSource) -> StoreSourceResult {
        if let Err(err) = source.validate() {
            debug!("event=source_rejected reason={}", err);
            return StoreSourceResult::rejected(StoreSourceStatus::InvalidRegistration);
        }
        if !self.lazy_init(DbCreationPolicy::CreateIfAbsent) {
            return StoreSourceResult::rejected(StoreSourceStatus::InternalError);
        }
        self.maybe_delete_expired_sources();

        self.run(
            "store_source",
            DbCreationPolicy::CreateIfAbsent,
            || StoreSourceResult::rejected(StoreSourceStatus::InternalError),
            |ctx| attribution::store_source(ctx, source),
        )
    }

    fn maybe_create_and_store_report(
        &mut self,
        trigger: &AttributionTrigger,
    ) -> CreateReportResult {
        if let Err(err) = trigger.validate() {
            debug!("event=trigger_rejected reason={}", err);
            return CreateReportResult::internal_error();
        }
        if !self.lazy_init(DbCreationPolicy::CreateIfAbsent) {
            return CreateReportResult::internal_error();
        }
        self.maybe_delete_expired_sources();

        self.run(
            "maybe_create_and_store_report",
            DbCreationPolicy::CreateIfAbsent,
            CreateReportResult::internal_error,
            |ctx| attribution::maybe_create_and_store_report(ctx, trigger),
        )
    }

    fn get_attribution_reports(
        &mut self,
        max_report_time: OffsetDateTime,
        limit: Option<usize>,
    ) -> Vec<AttributionReport> {
        self.run(
            "get_attribution_reports",
            DbCreationPolicy::IgnoreIfAbsent,
            Vec::new,
            |ctx| reports::get_reports_due(ctx, max_report_time, limit),
        )
    }

    fn get_next_report_time(&mut self, after: OffsetDateTime) -> Option<OffsetDateTime> {
        self.run(
            "get_next_report_time",
            DbCreationPolicy::IgnoreIfAbsent,
            || None,
            |ctx| reports::next_report_time(ctx.conn, after),
        )
    }

    fn get_reports(&mut self, ids: &[ReportId]) -> Vec<AttributionReport> {
        self.run(
            "get_reports",
            DbCreationPolicy::IgnoreIfAbsent,
            Vec::new,
            |ctx| reports::get_reports_by_ids(ctx, ids),
        )
    }

    fn get_active_sources(&mut self) -> Vec<StoredSource> {
        self.run(
            "get_active_sources",
            DbCreationPolicy::IgnoreIfAbsent,
            Vec::new,
            sources::get_active_sources,
        )
    }

    fn deactivate_source(&mut self, source_id: SourceId) -> bool {
        self.run(
            "deactivate_source",
            DbCreationPolicy::IgnoreIfAbsent,
            || false,
            |ctx| sources::deactivate(ctx.conn, source_id),
        )
    }

    fn delete_report(&mut self, report_id: ReportId) -> bool {
        self.run(
            "delete_report",
            DbCreationPolicy::IgnoreIfAbsent,
            || false,
            |ctx| reports::delete_report(ctx.conn, report_id),
        )
    }

    fn update_report_for_send_failure(
        &mut self,
        report_id: ReportId,
        new_report_time: OffsetDateTime,
    ) -> bool {
        self.run(
            "update_report_for_send_failure",
            DbCreationPolicy::IgnoreIfAbsent,
            || false,
            |ctx| reports::update_for_send_failure(ctx.conn, report_id, new_report_time),
        )
    }

    fn clear_data(
        &mut self,
        begin: OffsetDateTime,
        end: OffsetDateTime,
        filter: StorageKeyFilter<'_>,
        delete_rate_limit_data: bool,
    ) {
        let cleared = self.run(
            "clear_data",
            DbCreationPolicy::IgnoreIfAbsent,
            || None,
            |ctx| {
                clearing::clear_data(ctx.conn, begin, end, filter, delete_rate_limit_data)
                    .map(Some)
            },
        );
        if let Some(counts) = cleared {
            self.stats.last_clear = counts;
        }
    }

    fn get_all_data_keys(&mut self) -> BTreeSet<DataKey> {
        self.run(
            "get_all_data_keys",
            DbCreationPolicy::IgnoreIfAbsent,
            BTreeSet::new,
            |ctx| clearing::get_all_data_keys(ctx.conn),
        )
    }

    fn delete_by_data_key(&mut self, key: &DataKey) {
        let storage_key = key.storage_key();
        let matches_key = |candidate: &StorageKey| *candidate == storage_key;
        self.clear_data(min_time(), max_time(), Some(&matches_key), true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use attribution_storage_core::{ConfigurableStorageDelegate, SimulatedClock};

    fn must<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    fn storage(dir: &Path) -> AttributionStorageSql {
        must(AttributionStorageSql::new(
            dir,
            StorageConfig::default(),
            Arc::new(ConfigurableStorageDelegate::new()),
            Arc::new(SimulatedClock::default()),
        ))
    }

    #[test]
    fn reads_defer_creation() {
        let dir = must(tempfile::tempdir());
        let mut storage = storage(dir.path());

        assert!(storage.get_active_sources().is_empty());
        assert!(storage.get_all_data_keys().is_empty());
        assert_eq!(storage.db_status(), Some(DbStatus::DeferringCreation));
        assert_eq!(storage.stats().init_status, None);
        assert!(!storage.path().exists());
    }

    #[test]
    fn invalid_file_name_is_rejected() {
        let dir = must(tempfile::tempdir());
        let config = StorageConfig {
            database_file_name: "nested/Conversions".to_string(),
            ..StorageConfig::default()
        };
        let result = AttributionStorageSql::new(
            dir.path(),
            config,
            Arc::new(ConfigurableStorageDelegate::new()),
            Arc::new(SimulatedClock::default()),
        );
        assert!(result.is_err());
    }

    #[test]
    fn unopenable_path_degrades_to_no_op() {
        let dir = must(tempfile::tempdir());
        let mut storage = storage(dir.path());
        must(fs::create_dir_all(storage.path()));

        let trigger = AttributionTrigger::new(
            must(attribution_storage_core::SuitableOrigin::parse("https://report.test")),
            must(attribution_storage_core::SuitableOrigin::parse("https://conversion.test")),
        );
        let result = storage.maybe_create_and_store_report(&trigger);

        assert_eq!(result, CreateReportResult::internal_error());
        assert_eq!(
            storage.db_status(),
            Some(DbStatus::ClosedDueToCatastrophicError)
        );
        assert!(storage.get_active_sources().is_empty());
        assert!(!storage.delete_report(ReportId(1)));
    }
}
