//! JSON blobs stored alongside source and report rows.
//!
//! Every record field is optional on the wire so that a blob missing a
//! required field decodes into a clear error instead of a default value;
//! callers drop rows whose blobs fail to decode.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::{anyhow, Context, Result};
use attribution_storage_core::timestamps::{duration_to_micros, from_micros, to_micros};
use attribution_storage_core::{
    AggregatableHistogramContribution, AggregationKey, AggregationKeys, CommonAggregatableData,
    EventReportWindows, FilterData, SourceRegistrationTimeConfig, SuitableOrigin,
};
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};

/// Stores an unsigned 64-bit value in a signed SQLite integer, bit for bit.
#[allow(clippy::cast_possible_wrap)]
pub(crate) fn u64_to_sql(value: u64) -> i64 {
    value as i64
}

#[allow(clippy::cast_sign_loss)]
pub(crate) fn u64_from_sql(value: i64) -> u64 {
    value as u64
}

pub(crate) fn encode_filter_data(filter_data: &FilterData) -> Result<String> {
    serde_json::to_string(filter_data.values()).context("failed to encode filter data")
}

pub(crate) fn decode_filter_data(raw: &str) -> Result<FilterData> {
    let values: BTreeMap<String, BTreeSet<String>> =
        serde_json::from_str(raw).context("invalid filter data")?;
    Ok(FilterData::from_persisted(values))
}

#[derive(Debug, Serialize, Deserialize)]
struct AggregationKeyRecord {
    high_bits: Option<u64>,
    low_bits: Option<u64>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct AggregatableSourceRecord {
    keys: Option<BTreeMap<String, AggregationKeyRecord>>,
}

pub(crate) fn encode_aggregation_keys(keys: &AggregationKeys) -> Result<String> {
    let record = AggregatableSourceRecord {
        keys: Some(
            keys.iter()
                .map(|(id, key)| {
                    (
                        id.clone(),
                        AggregationKeyRecord {
                            high_bits: Some(key.high_bits),
                            low_bits: Some(key.low_bits),
                        },
                    )
                })
                .collect(),
        ),
    };
    serde_json::to_string(&record).context("failed to encode aggregation keys")
}

pub(crate) fn decode_aggregation_keys(raw: &str) -> Result<AggregationKeys> {
    let record: AggregatableSourceRecord =
        serde_json::from_str(raw).context("invalid aggregatable source")?;
    let mut keys = AggregationKeys::new();
    for (id, key) in record.keys.unwrap_or_default() {
        let (Some(high_bits), Some(low_bits)) = (key.high_bits, key.low_bits) else {
            return Err(anyhow!("aggregation key {id:?} is missing a half"));
        };
        keys.insert(id, AggregationKey::new(high_bits, low_bits));
    }
    Ok(keys)
}

#[derive(Debug, Serialize, Deserialize)]
struct WindowsRecord {
    start_time_micros: Option<i64>,
    end_times_micros: Option<Vec<i64>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ReadOnlySourceRecord {
    event_report_windows: Option<WindowsRecord>,
    max_event_level_reports: Option<u32>,
    randomized_response_rate: Option<f64>,
}

/// Source attributes fixed at registration.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ReadOnlySourceData {
    pub event_report_windows: EventReportWindows,
    pub max_event_level_reports: u32,
    /// Absent for rows written before the rate was persisted.
    pub randomized_response_rate: Option<f64>,
}

pub(crate) fn encode_read_only_source_data(data: &ReadOnlySourceData) -> Result<String> {
    let windows = &data.event_report_windows;
    let record = ReadOnlySourceRecord {
        event_report_windows: Some(WindowsRecord {
            start_time_micros: Some(duration_to_micros(windows.start_time)),
            end_times_micros: Some(
                windows
                    .end_times
                    .iter()
                    .map(|end| duration_to_micros(*end))
                    .collect(),
            ),
        }),
        max_event_level_reports: Some(data.max_event_level_reports),
        randomized_response_rate: data.randomized_response_rate,
    };
    serde_json::to_string(&record).context("failed to encode read-only source data")
}

pub(crate) fn decode_read_only_source_data(raw: &str) -> Result<ReadOnlySourceData> {
    let record: ReadOnlySourceRecord =
        serde_json::from_str(raw).context("invalid read-only source data")?;
    let windows = record
        .event_report_windows
        .ok_or_else(|| anyhow!("event_report_windows is required"))?;
    let (Some(start), Some(ends)) = (windows.start_time_micros, windows.end_times_micros) else {
        return Err(anyhow!("event_report_windows is incomplete"));
    };
    let event_report_windows = EventReportWindows {
        start_time: Duration::microseconds(start),
        end_times: ends.into_iter().map(Duration::microseconds).collect(),
    };
    event_report_windows
        .validate()
        .map_err(|err| anyhow!("invalid event report windows: {err}"))?;

    let max_event_level_reports = record
        .max_event_level_reports
        .ok_or_else(|| anyhow!("max_event_level_reports is required"))?;

    Ok(ReadOnlySourceData {
        event_report_windows,
        max_event_level_reports,
        randomized_response_rate: record.randomized_response_rate.filter(|rate| *rate >= 0.0),
    })
}

#[derive(Debug, Serialize, Deserialize)]
struct EventLevelRecord {
    trigger_data: Option<u64>,
    priority: Option<i64>,
}

pub(crate) fn encode_event_level_metadata(trigger_data: u64, priority: i64) -> Result<String> {
    serde_json::to_string(&EventLevelRecord {
        trigger_data: Some(trigger_data),
        priority: Some(priority),
    })
    .context("failed to encode event-level metadata")
}

/// Returns `(trigger_data, priority)`.
pub(crate) fn decode_event_level_metadata(raw: &str) -> Result<(u64, i64)> {
    let record: EventLevelRecord =
        serde_json::from_str(raw).context("invalid event-level metadata")?;
    match (record.trigger_data, record.priority) {
        (Some(trigger_data), Some(priority)) => Ok((trigger_data, priority)),
        _ => Err(anyhow!("event-level metadata requires trigger_data and priority")),
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CommonRecord {
    coordinator_origin: Option<String>,
    verification_token: Option<String>,
    source_registration_time_config: Option<String>,
}

impl CommonRecord {
    fn from_common(common: &CommonAggregatableData) -> Self {
        Self {
            coordinator_origin: common
                .aggregation_coordinator_origin
                .as_ref()
                .map(ToString::to_string),
            verification_token: common.verification_token.clone(),
            source_registration_time_config: Some(
                common.source_registration_time_config.as_str().to_string(),
            ),
        }
    }

    fn into_common(self) -> Result<CommonAggregatableData> {
        let raw_config = self
            .source_registration_time_config
            .ok_or_else(|| anyhow!("source_registration_time_config is required"))?;
        let source_registration_time_config = SourceRegistrationTimeConfig::parse(&raw_config)
            .ok_or_else(|| {
                anyhow!("invalid source_registration_time_config: {raw_config}")
            })?;
        let aggregation_coordinator_origin = self
            .coordinator_origin
            .as_deref()
            .map(SuitableOrigin::parse)
            .transpose()
            .map_err(|err| anyhow!("invalid coordinator origin: {err}"))?;
        Ok(CommonAggregatableData {
            aggregation_coordinator_origin,
            verification_token: self.verification_token,
            source_registration_time_config,
        })
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ContributionRecord {
    key_high_bits: Option<u64>,
    key_low_bits: Option<u64>,
    value: Option<u32>,
}

#[derive(Debug, Serialize, Deserialize)]
struct AggregatableRecord {
    common: Option<CommonRecord>,
    contributions: Option<Vec<ContributionRecord>>,
}

pub(crate) fn encode_aggregatable_metadata(
    common: &CommonAggregatableData,
    contributions: &[AggregatableHistogramContribution],
) -> Result<String> {
    let record = AggregatableRecord {
        common: Some(CommonRecord::from_common(common)),
        contributions: Some(
            contributions
                .iter()
                .map(|contribution| ContributionRecord {
                    key_high_bits: Some(contribution.key.high_bits),
                    key_low_bits: Some(contribution.key.low_bits),
                    value: Some(contribution.value),
                })
                .collect(),
        ),
    };
    serde_json::to_string(&record).context("failed to encode aggregatable metadata")
}

/// Decodes aggregatable metadata; every contribution must carry a full key and
/// a value in `1..=budget`.
pub(crate) fn decode_aggregatable_metadata(
    raw: &str,
    budget: i64,
) -> Result<(CommonAggregatableData, Vec<AggregatableHistogramContribution>)> {
    let record: AggregatableRecord =
        serde_json::from_str(raw).context("invalid aggregatable metadata")?;
    let common = record
        .common
        .ok_or_else(|| anyhow!("aggregatable metadata requires common data"))?
        .into_common()?;

    let contributions = record.contributions.unwrap_or_default();
    if contributions.is_empty() {
        return Err(anyhow!("aggregatable metadata requires contributions"));
    }

    let mut decoded = Vec::with_capacity(contributions.len());
    for contribution in contributions {
        let (Some(high_bits), Some(low_bits), Some(value)) = (
            contribution.key_high_bits,
            contribution.key_low_bits,
            contribution.value,
        ) else {
            return Err(anyhow!("aggregatable contribution is incomplete"));
        };
        if value == 0 || i64::from(value) > budget {
            return Err(anyhow!(
                "aggregatable contribution value {value} is outside 1..={budget}"
            ));
        }
        decoded.push(AggregatableHistogramContribution {
            key: AggregationKey::new(high_bits, low_bits),
            value,
        });
    }

    Ok((common, decoded))
}

#[derive(Debug, Serialize, Deserialize)]
struct NullAggregatableRecord {
    common: Option<CommonRecord>,
    fake_source_time_micros: Option<i64>,
}

pub(crate) fn encode_null_aggregatable_metadata(
    common: &CommonAggregatableData,
    fake_source_time: OffsetDateTime,
) -> Result<String> {
    serde_json::to_string(&NullAggregatableRecord {
        common: Some(CommonRecord::from_common(common)),
        fake_source_time_micros: Some(to_micros(fake_source_time)),
    })
    .context("failed to encode null aggregatable metadata")
}

pub(crate) fn decode_null_aggregatable_metadata(
    raw: &str,
) -> Result<(CommonAggregatableData, OffsetDateTime)> {
    let record: NullAggregatableRecord =
        serde_json::from_str(raw).context("invalid null aggregatable metadata")?;
    let common = record
        .common
        .ok_or_else(|| anyhow!("null aggregatable metadata requires common data"))?
        .into_common()?;
    let micros = record
        .fake_source_time_micros
        .ok_or_else(|| anyhow!("fake_source_time is required"))?;
    let fake_source_time =
        from_micros(micros).map_err(|err| anyhow!("invalid fake_source_time: {err}"))?;
    Ok((common, fake_source_time))
}
