//! Filter and measure extraction.

use crate::query::{GroupBy, QuerySpec};
use crate::record::{DecodedRecord, FieldPath};

/// Outcome of running one admitted record through the filter stage.
#[derive(Debug, Clone, PartialEq)]
pub enum Extracted {
    /// The record passed the filter and carries a numeric measure
    Matched { key: String, measure: f64 },
    /// Well-formed, but filtered out or missing the measure or group key
    Unmatched,
    /// Not a JSON object
    Malformed,
}

/// Applies the type filter and pulls `(group key, measure)` out of a line.
#[derive(Debug, Clone)]
pub struct FilterExtract {
    filter_field: FieldPath,
    filter_value: String,
    group_by: GroupBy,
    measure_field: FieldPath,
}

impl FilterExtract {
    /// Create a filter stage.
    pub fn new(
        filter_field: FieldPath,
        filter_value: impl Into<String>,
        group_by: GroupBy,
        measure_field: FieldPath,
    ) -> Self {
        Self {
            filter_field,
            filter_value: filter_value.into(),
            group_by,
            measure_field,
        }
    }

    /// Create the filter stage a query runs with.
    pub fn from_spec(spec: &QuerySpec) -> Self {
        Self::new(
            spec.filter_field().clone(),
            spec.filter_value(),
            spec.group_by().clone(),
            spec.measure_field().clone(),
        )
    }

    /// Process one raw line.
    pub fn process(&self, line: &[u8]) -> Extracted {
        let Some(record) = DecodedRecord::decode(line) else {
            return Extracted::Malformed;
        };
        self.process_record(&record)
    }

    /// Process an already decoded record.
    pub fn process_record(&self, record: &DecodedRecord) -> Extracted {
        if record.get_str(&self.filter_field) != Some(self.filter_value.as_str()) {
            return Extracted::Unmatched;
        }

        let Some(measure) = record.get_f64(&self.measure_field) else {
            return Extracted::Unmatched;
        };

        let key = match &self.group_by {
            GroupBy::FilterValue => self.filter_value.clone(),
            GroupBy::Field(path) => match record.get_key(path) {
                Some(key) => key,
                None => return Extracted::Unmatched,
            },
        };

        Extracted::Matched { key, measure }
    }
}
