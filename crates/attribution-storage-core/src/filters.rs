use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::{AttributionError, SourceType};

pub const SOURCE_TYPE_FILTER_KEY: &str = "source_type";
pub const LOOKBACK_WINDOW_FILTER_KEY: &str = "_lookback_window";

const MAX_FILTER_KEYS: usize = 50;
const MAX_VALUES_PER_FILTER: usize = 50;
const MAX_BYTES_PER_FILTER_STRING: usize = 25;

pub type FilterValues = BTreeMap<String, BTreeSet<String>>;

fn is_reserved(key: &str) -> bool {
    key == SOURCE_TYPE_FILTER_KEY || key == LOOKBACK_WINDOW_FILTER_KEY
}

/// Attribute values attached to a source and matched against trigger filters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FilterData {
    values: FilterValues,
}

impl FilterData {
    /// Builds registration-time filter data.
    ///
    /// # Errors
    /// Returns [`AttributionError::Validation`] when a reserved key is used or
    /// size limits are exceeded.
    pub fn new(values: FilterValues) -> Result<Self, AttributionError> {
        if values.len() > MAX_FILTER_KEYS {
            return Err(AttributionError::Validation(format!(
                "filter data MUST have at most {MAX_FILTER_KEYS} keys"
            )));
        }

        for (key, entries) in &values {
            if is_reserved(key) {
                return Err(AttributionError::Validation(format!(
                    "filter data MUST NOT use reserved key {key:?}"
                )));
            }
            if key.len() > MAX_BYTES_PER_FILTER_STRING {
                return Err(AttributionError::Validation(format!(
                    "filter key {key:?} is too long"
                )));
            }
            if entries.len() > MAX_VALUES_PER_FILTER {
                return Err(AttributionError::Validation(format!(
                    "filter {key:?} MUST have at most {MAX_VALUES_PER_FILTER} values"
                )));
            }
            if entries.iter().any(|value| value.len() > MAX_BYTES_PER_FILTER_STRING) {
                return Err(AttributionError::Validation(format!(
                    "filter {key:?} has a value that is too long"
                )));
            }
        }

        Ok(Self { values })
    }

    /// Rebuilds filter data read back from storage, silently discarding
    /// reserved keys.
    #[must_use]
    pub fn from_persisted(mut values: FilterValues) -> Self {
        values.retain(|key, _| !is_reserved(key));
        Self { values }
    }

    #[must_use]
    pub fn values(&self) -> &FilterValues {
        &self.values
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Whether a source carrying this data (of `source_type`) satisfies
    /// `filters`.
    #[must_use]
    pub fn matches(&self, source_type: SourceType, filters: &FilterPair) -> bool {
        self.matches_values(source_type, &filters.positive, false)
            && self.matches_values(source_type, &filters.negative, true)
    }

    fn matches_values(&self, source_type: SourceType, filters: &FilterValues, negated: bool) -> bool {
        let source_type_values: BTreeSet<String> =
            BTreeSet::from([source_type.as_str().to_string()]);

        filters.iter().all(|(key, filter_values)| {
            if key == LOOKBACK_WINDOW_FILTER_KEY {
                return true;
            }
            let source_values = if key == SOURCE_TYPE_FILTER_KEY {
                &source_type_values
            } else {
                match self.values.get(key) {
                    Some(values) => values,
                    None => return true,
                }
            };

            if filter_values.is_empty() {
                return source_values.is_empty() != negated;
            }
            let intersects = filter_values.iter().any(|value| source_values.contains(value));
            intersects != negated
        })
    }
}

/// Positive and negated trigger-side filters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterPair {
    #[serde(default)]
    pub positive: FilterValues,
    #[serde(default)]
    pub negative: FilterValues,
}

impl FilterPair {
    #[must_use]
    pub fn positive(values: FilterValues) -> Self {
        Self {
            positive: values,
            negative: FilterValues::new(),
        }
    }

    #[must_use]
    pub fn negative(values: FilterValues) -> Self {
        Self {
            positive: FilterValues::new(),
            negative: values,
        }
    }

    #[must_use]
    pub fn source_type(source_type: SourceType) -> Self {
        Self::positive(BTreeMap::from([(
            SOURCE_TYPE_FILTER_KEY.to_string(),
            BTreeSet::from([source_type.as_str().to_string()]),
        )]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn values(pairs: &[(&str, &[&str])]) -> FilterValues {
        pairs
            .iter()
            .map(|(key, entries)| {
                (
                    (*key).to_string(),
                    entries.iter().map(|entry| (*entry).to_string()).collect(),
                )
            })
            .collect()
    }

    #[test]
    fn reserved_keys_are_rejected_on_registration() {
        assert!(FilterData::new(values(&[("source_type", &["event"])])).is_err());
        assert!(FilterData::new(values(&[("_lookback_window", &[])])).is_err());
        assert!(FilterData::new(values(&[("product", &["1"])])).is_ok());
    }

    #[test]
    fn reserved_keys_are_stripped_on_read() {
        let data = FilterData::from_persisted(values(&[
            ("source_type", &["navigation"]),
            ("_lookback_window", &["1"]),
            ("campaign", &["x"]),
        ]));
        assert_eq!(data.values(), &values(&[("campaign", &["x"])]));
    }

    #[test]
    fn source_type_filter_matches_source_type() {
        let data = FilterData::default();
        let navigation = FilterPair::source_type(SourceType::Navigation);
        assert!(data.matches(SourceType::Navigation, &navigation));
        assert!(!data.matches(SourceType::Event, &navigation));
    }

    #[test]
    fn missing_source_keys_are_ignored() {
        let data = FilterData::default();
        let filters = FilterPair::positive(values(&[("product", &["1"])]));
        assert!(data.matches(SourceType::Event, &filters));
    }

    #[test]
    fn empty_filter_values_only_match_empty_source_values() {
        let data = FilterData::from_persisted(values(&[("a", &[]), ("b", &["1"])]));
        assert!(data.matches(SourceType::Event, &FilterPair::positive(values(&[("a", &[])]))));
        assert!(!data.matches(SourceType::Event, &FilterPair::positive(values(&[("b", &[])]))));
        assert!(!data.matches(SourceType::Event, &FilterPair::negative(values(&[("a", &[])]))));
        assert!(data.matches(SourceType::Event, &FilterPair::negative(values(&[("b", &[])]))));
    }

    #[test]
    fn negated_filters_require_disjoint_values() {
        let data = FilterData::from_persisted(values(&[("product", &["1", "2"])]));
        assert!(!data.matches(SourceType::Event, &FilterPair::negative(values(&[("product", &["2"])]))));
        assert!(data.matches(SourceType::Event, &FilterPair::negative(values(&[("product", &["3"])]))));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn positive_and_negative_filters_disagree_on_nonempty_values(
            source in proptest::collection::btree_set("[a-c]", 0..3),
            filter in proptest::collection::btree_set("[a-c]", 1..3),
        ) {
            let data = FilterData::from_persisted(BTreeMap::from([("k".to_string(), source)]));
            let values = BTreeMap::from([("k".to_string(), filter)]);
            let positive = data.matches(SourceType::Navigation, &FilterPair::positive(values.clone()));
            let negative = data.matches(SourceType::Navigation, &FilterPair::negative(values));
            prop_assert_ne!(positive, negative);
        }
    }
}
