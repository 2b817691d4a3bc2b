use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::{AggregationKey, SourceRegistrationTimeConfig, StoredSource, SuitableOrigin};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct ReportId(pub i64);

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ReportType {
    EventLevel,
    AggregatableAttribution,
    NullAggregatable,
}

impl ReportType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::EventLevel => "event_level",
            Self::AggregatableAttribution => "aggregatable_attribution",
            Self::NullAggregatable => "null_aggregatable",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "event_level" => Some(Self::EventLevel),
            "aggregatable_attribution" => Some(Self::AggregatableAttribution),
            "null_aggregatable" => Some(Self::NullAggregatable),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_aggregatable(self) -> bool {
        !matches!(self, Self::EventLevel)
    }
}

/// Trigger-side facts shared by every report kind.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AttributionInfo {
    pub time: OffsetDateTime,
    pub debug_key: Option<u64>,
    pub context_origin: SuitableOrigin,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct AggregatableHistogramContribution {
    pub key: AggregationKey,
    pub value: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommonAggregatableData {
    pub aggregation_coordinator_origin: Option<SuitableOrigin>,
    pub verification_token: Option<String>,
    pub source_registration_time_config: SourceRegistrationTimeConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventLevelData {
    pub trigger_data: u64,
    pub priority: i64,
    pub source: Box<StoredSource>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AggregatableAttributionData {
    pub common: CommonAggregatableData,
    pub contributions: Vec<AggregatableHistogramContribution>,
    pub source: Box<StoredSource>,
}

impl AggregatableAttributionData {
    #[must_use]
    pub fn budget_required(&self) -> i64 {
        self.contributions
            .iter()
            .map(|contribution| i64::from(contribution.value))
            .sum()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NullAggregatableData {
    pub common: CommonAggregatableData,
    pub fake_source_time: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReportData {
    EventLevel(EventLevelData),
    AggregatableAttribution(AggregatableAttributionData),
    NullAggregatable(NullAggregatableData),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AttributionReport {
    pub id: ReportId,
    pub attribution_info: AttributionInfo,
    pub report_time: OffsetDateTime,
    pub initial_report_time: OffsetDateTime,
    pub external_report_id: Uuid,
    pub failed_send_attempts: u32,
    pub reporting_origin: SuitableOrigin,
    pub data: ReportData,
}

impl AttributionReport {
    #[must_use]
    pub fn report_type(&self) -> ReportType {
        match self.data {
            ReportData::EventLevel(_) => ReportType::EventLevel,
            ReportData::AggregatableAttribution(_) => ReportType::AggregatableAttribution,
            ReportData::NullAggregatable(_) => ReportType::NullAggregatable,
        }
    }

    /// The attributed source, absent for null reports.
    #[must_use]
    pub fn source(&self) -> Option<&StoredSource> {
        match &self.data {
            ReportData::EventLevel(data) => Some(&data.source),
            ReportData::AggregatableAttribution(data) => Some(&data.source),
            ReportData::NullAggregatable(_) => None,
        }
    }

    #[must_use]
    pub fn common_aggregatable_data(&self) -> Option<&CommonAggregatableData> {
        match &self.data {
            ReportData::EventLevel(_) => None,
            ReportData::AggregatableAttribution(data) => Some(&data.common),
            ReportData::NullAggregatable(data) => Some(&data.common),
        }
    }

    #[must_use]
    pub fn verification_token(&self) -> Option<&str> {
        self.common_aggregatable_data()
            .and_then(|common| common.verification_token.as_deref())
    }
}
