//! Domain model and policy seams for attribution storage: origins and sites,
//! sources, triggers, reports, statuses, the storage delegate and the clock.

mod clock;
mod config;
mod delegate;
mod error;
mod filters;
mod origin;
mod report;
mod source;
mod status;
mod storage;
pub mod timestamps;
mod trigger;

pub use clock::{Clock, SimulatedClock, SystemClock};
pub use config::{DelegateConfig, StorageConfig, DEFAULT_DATABASE_FILE_NAME};
pub use delegate::{
    ConfigurableStorageDelegate, DefaultStorageDelegate, FakeReport, NullAggregatableReport,
    RandomizedResponse, RateLimitConfig, StorageDelegate, DEFAULT_EXTERNAL_REPORT_ID,
};
pub use error::AttributionError;
pub use filters::{
    FilterData, FilterPair, FilterValues, LOOKBACK_WINDOW_FILTER_KEY, SOURCE_TYPE_FILTER_KEY,
};
pub use origin::{DataKey, SchemefulSite, StorageKey, SuitableOrigin};
pub use report::{
    AggregatableAttributionData, AggregatableHistogramContribution, AttributionInfo,
    AttributionReport, CommonAggregatableData, EventLevelData, NullAggregatableData, ReportData,
    ReportId, ReportType,
};
pub use source::{
    ActiveState, AggregationKey, AggregationKeys, AttributionLogic, EventReportWindows,
    SourceId, SourceRegistration, SourceType, StorableSource, StoredSource, WindowStatus,
};
pub use status::{
    AggregatableResult, CreateReportResult, EventLevelResult, StoreSourceResult,
    StoreSourceStatus,
};
pub use storage::{AttributionStorage, StorageKeyFilter};
pub use trigger::{
    AggregatableDedupKey, AggregatableTriggerData, AttributionTrigger, EventTriggerData,
    SourceRegistrationTimeConfig, TriggerRegistration, TriggerVerification,
    MAX_AGGREGATABLE_VALUE,
};
