use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{AggregationKey, AttributionError, FilterPair, SchemefulSite, SuitableOrigin};

/// Largest value a single aggregatable contribution may carry.
pub const MAX_AGGREGATABLE_VALUE: u32 = 65_536;
const MAX_EVENT_TRIGGERS: usize = 10;
const MAX_AGGREGATABLE_TRIGGER_DATA: usize = 50;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EventTriggerData {
    pub data: u64,
    pub priority: i64,
    pub dedup_key: Option<u64>,
    #[serde(default)]
    pub filters: FilterPair,
}

impl EventTriggerData {
    #[must_use]
    pub fn new(data: u64) -> Self {
        Self {
            data,
            priority: 0,
            dedup_key: None,
            filters: FilterPair::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AggregatableTriggerData {
    pub key_piece: AggregationKey,
    pub source_keys: BTreeSet<String>,
    #[serde(default)]
    pub filters: FilterPair,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AggregatableDedupKey {
    pub dedup_key: Option<u64>,
    #[serde(default)]
    pub filters: FilterPair,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SourceRegistrationTimeConfig {
    #[default]
    Include,
    Exclude,
}

impl SourceRegistrationTimeConfig {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Include => "include",
            Self::Exclude => "exclude",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "include" => Some(Self::Include),
            "exclude" => Some(Self::Exclude),
            _ => None,
        }
    }
}

/// An externally issued token proving the trigger came from a trusted party.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TriggerVerification {
    pub token: String,
    pub aggregatable_report_id: Uuid,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TriggerRegistration {
    #[serde(default)]
    pub filters: FilterPair,
    pub debug_key: Option<u64>,
    #[serde(default)]
    pub event_triggers: Vec<EventTriggerData>,
    #[serde(default)]
    pub aggregatable_trigger_data: Vec<AggregatableTriggerData>,
    #[serde(default)]
    pub aggregatable_values: BTreeMap<String, u32>,
    #[serde(default)]
    pub aggregatable_dedup_keys: Vec<AggregatableDedupKey>,
    #[serde(default)]
    pub debug_reporting: bool,
    pub aggregation_coordinator_origin: Option<SuitableOrigin>,
    #[serde(default)]
    pub source_registration_time_config: SourceRegistrationTimeConfig,
}

impl TriggerRegistration {
    #[must_use]
    pub fn is_aggregatable(&self) -> bool {
        !self.aggregatable_trigger_data.is_empty() || !self.aggregatable_values.is_empty()
    }

    /// # Errors
    /// Returns [`AttributionError::Validation`] when list sizes or
    /// aggregatable values are out of bounds.
    pub fn validate(&self) -> Result<(), AttributionError> {
        if self.event_triggers.len() > MAX_EVENT_TRIGGERS {
            return Err(AttributionError::Validation(format!(
                "event_triggers MUST have at most {MAX_EVENT_TRIGGERS} entries"
            )));
        }
        if self.aggregatable_trigger_data.len() > MAX_AGGREGATABLE_TRIGGER_DATA {
            return Err(AttributionError::Validation(format!(
                "aggregatable_trigger_data MUST have at most {MAX_AGGREGATABLE_TRIGGER_DATA} entries"
            )));
        }
        for (key, value) in &self.aggregatable_values {
            if *value == 0 || *value > MAX_AGGREGATABLE_VALUE {
                return Err(AttributionError::Validation(format!(
                    "aggregatable value for {key:?} MUST be in [1, {MAX_AGGREGATABLE_VALUE}]"
                )));
            }
        }
        Ok(())
    }
}

/// A conversion observed on a destination site.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AttributionTrigger {
    pub reporting_origin: SuitableOrigin,
    pub destination_origin: SuitableOrigin,
    pub registration: TriggerRegistration,
    #[serde(default)]
    pub verifications: Vec<TriggerVerification>,
    #[serde(default)]
    pub is_within_fenced_frame: bool,
}

impl AttributionTrigger {
    #[must_use]
    pub fn new(reporting_origin: SuitableOrigin, destination_origin: SuitableOrigin) -> Self {
        Self {
            reporting_origin,
            destination_origin,
            registration: TriggerRegistration::default(),
            verifications: Vec::new(),
            is_within_fenced_frame: false,
        }
    }

    #[must_use]
    pub fn destination_site(&self) -> SchemefulSite {
        self.destination_origin.site()
    }

    /// # Errors
    /// Returns [`AttributionError::Validation`] when the registration is invalid.
    pub fn validate(&self) -> Result<(), AttributionError> {
        self.registration.validate()
    }
}
