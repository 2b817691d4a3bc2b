use std::collections::BTreeSet;

use time::OffsetDateTime;

use crate::{
    AttributionReport, AttributionTrigger, CreateReportResult, DataKey, ReportId, SourceId,
    StorableSource, StorageKey, StoreSourceResult, StoredSource,
};

/// Predicate over storage keys; `None` matches everything.
pub type StorageKeyFilter<'a> = Option<&'a dyn Fn(&StorageKey) -> bool>;

/// Caller-facing attribution storage operations. Implementations are driven
/// from a single logical sequence and never fail the caller: storage problems
/// surface as internal-error statuses or empty results.
pub trait AttributionStorage {
    fn store_source(&mut self, source: &StorableSource) -> StoreSourceResult;

    fn maybe_create_and_store_report(&mut self, trigger: &AttributionTrigger)
        -> CreateReportResult;

    /// Reports due at or before `max_report_time`, earliest first.
    fn get_attribution_reports(
        &mut self,
        max_report_time: OffsetDateTime,
        limit: Option<usize>,
    ) -> Vec<AttributionReport>;

    fn get_next_report_time(&mut self, after: OffsetDateTime) -> Option<OffsetDateTime>;

    fn get_reports(&mut self, ids: &[ReportId]) -> Vec<AttributionReport>;

    fn get_active_sources(&mut self) -> Vec<StoredSource>;

    fn deactivate_source(&mut self, source_id: SourceId) -> bool;

    fn delete_report(&mut self, report_id: ReportId) -> bool;

    fn update_report_for_send_failure(
        &mut self,
        report_id: ReportId,
        new_report_time: OffsetDateTime,
    ) -> bool;

    fn clear_data(
        &mut self,
        begin: OffsetDateTime,
        end: OffsetDateTime,
        filter: StorageKeyFilter<'_>,
        delete_rate_limit_data: bool,
    );

    fn get_all_data_keys(&mut self) -> BTreeSet<DataKey>;

    fn delete_by_data_key(&mut self, key: &DataKey);
}
