use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::{AttributionReport, SourceId};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StoreSourceStatus {
    Success,
    SuccessNoised,
    InternalError,
    InvalidRegistration,
    ExcessiveReportingOrigins,
}

impl StoreSourceStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::SuccessNoised => "success_noised",
            Self::InternalError => "internal_error",
            Self::InvalidRegistration => "invalid_registration",
            Self::ExcessiveReportingOrigins => "excessive_reporting_origins",
        }
    }

    #[must_use]
    pub fn is_success(self) -> bool {
        matches!(self, Self::Success | Self::SuccessNoised)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoreSourceResult {
    pub status: StoreSourceStatus,
    pub source_id: Option<SourceId>,
    pub min_fake_report_time: Option<OffsetDateTime>,
    pub evicted_sources: usize,
}

impl StoreSourceResult {
    #[must_use]
    pub fn rejected(status: StoreSourceStatus) -> Self {
        Self {
            status,
            source_id: None,
            min_fake_report_time: None,
            evicted_sources: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventLevelResult {
    Success,
    SuccessDroppedLowerPriority,
    InternalError,
    NoCapacityForConversionDestination,
    NoMatchingImpressions,
    Deduplicated,
    ExcessiveAttributions,
    PriorityTooLow,
    DroppedForNoise,
    ExcessiveReportingOrigins,
    NoMatchingSourceFilterData,
    NoMatchingConfigurations,
    ExcessiveReports,
    FalselyAttributedSource,
    ReportWindowNotStarted,
    ReportWindowPassed,
    NotRegistered,
}

impl EventLevelResult {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::SuccessDroppedLowerPriority => "success_dropped_lower_priority",
            Self::InternalError => "internal_error",
            Self::NoCapacityForConversionDestination => "no_capacity_for_conversion_destination",
            Self::NoMatchingImpressions => "no_matching_impressions",
            Self::Deduplicated => "deduplicated",
            Self::ExcessiveAttributions => "excessive_attributions",
            Self::PriorityTooLow => "priority_too_low",
            Self::DroppedForNoise => "dropped_for_noise",
            Self::ExcessiveReportingOrigins => "excessive_reporting_origins",
            Self::NoMatchingSourceFilterData => "no_matching_source_filter_data",
            Self::NoMatchingConfigurations => "no_matching_configurations",
            Self::ExcessiveReports => "excessive_reports",
            Self::FalselyAttributedSource => "falsely_attributed_source",
            Self::ReportWindowNotStarted => "report_window_not_started",
            Self::ReportWindowPassed => "report_window_passed",
            Self::NotRegistered => "not_registered",
        }
    }

    #[must_use]
    pub fn is_success(self) -> bool {
        matches!(self, Self::Success | Self::SuccessDroppedLowerPriority)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AggregatableResult {
    Success,
    InternalError,
    NoCapacityForConversionDestination,
    NoMatchingImpressions,
    ExcessiveAttributions,
    ExcessiveReportingOrigins,
    NoHistograms,
    InsufficientBudget,
    NoMatchingSourceFilterData,
    NotRegistered,
    Deduplicated,
    ReportWindowPassed,
    ExcessiveReports,
}

impl AggregatableResult {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::InternalError => "internal_error",
            Self::NoCapacityForConversionDestination => "no_capacity_for_conversion_destination",
            Self::NoMatchingImpressions => "no_matching_impressions",
            Self::ExcessiveAttributions => "excessive_attributions",
            Self::ExcessiveReportingOrigins => "excessive_reporting_origins",
            Self::NoHistograms => "no_histograms",
            Self::InsufficientBudget => "insufficient_budget",
            Self::NoMatchingSourceFilterData => "no_matching_source_filter_data",
            Self::NotRegistered => "not_registered",
            Self::Deduplicated => "deduplicated",
            Self::ReportWindowPassed => "report_window_passed",
            Self::ExcessiveReports => "excessive_reports",
        }
    }

    #[must_use]
    pub fn is_success(self) -> bool {
        matches!(self, Self::Success)
    }
}

/// Outcome of one trigger; each track carries its own status.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CreateReportResult {
    pub event_level_status: EventLevelResult,
    pub aggregatable_status: AggregatableResult,
    pub min_null_aggregatable_report_time: Option<OffsetDateTime>,
    pub new_event_level_report: Option<AttributionReport>,
    pub new_aggregatable_report: Option<AttributionReport>,
    pub replaced_event_level_report: Option<AttributionReport>,
}

impl CreateReportResult {
    #[must_use]
    pub fn new(event_level_status: EventLevelResult, aggregatable_status: AggregatableResult) -> Self {
        Self {
            event_level_status,
            aggregatable_status,
            min_null_aggregatable_report_time: None,
            new_event_level_report: None,
            new_aggregatable_report: None,
            replaced_event_level_report: None,
        }
    }

    #[must_use]
    pub fn internal_error() -> Self {
        Self::new(EventLevelResult::InternalError, AggregatableResult::InternalError)
    }
}
