use attribution_storage_core::{StorageConfig, StorageDelegate};
use rusqlite::Connection;
use time::OffsetDateTime;

/// Everything one storage operation reads: the open transaction, the policy
/// objects, and the instant the operation runs at.
pub(crate) struct StoreContext<'a> {
    pub conn: &'a Connection,
    pub delegate: &'a dyn StorageDelegate,
    pub config: &'a StorageConfig,
    pub now: OffsetDateTime,
}

impl StoreContext<'_> {
    /// Per-source aggregatable budget, honouring the configured override.
    pub fn aggregatable_budget(&self) -> i64 {
        self.config
            .aggregatable_budget_override
            .unwrap_or_else(|| self.delegate.aggregatable_budget_per_source())
    }
}
