//! Sum aggregation.
//!
//! [`SumAggregator`] keeps one running `(sum, count)` per group key. Merging
//! is commutative and associative, so partials from any subset of partitions
//! combine in any order; only floating-point rounding depends on the order.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use arrow::array::{ArrayRef, Float64Array, StringArray};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::record_batch::RecordBatch;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// How a partition's sampled sums are turned into an estimate of its total.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Estimator {
    /// Divide each sampled value by its inclusion probability
    #[default]
    HorvitzThompson,
    /// Report the raw sum of sampled values
    Unscaled,
}

impl Estimator {
    /// Factor a partition's partial sums are multiplied by.
    pub fn expansion_factor(&self, inclusion_probability: f64) -> f64 {
        match self {
            Estimator::HorvitzThompson if inclusion_probability > 0.0 => {
                1.0 / inclusion_probability
            }
            // Nothing was admitted, so there is nothing to scale
            Estimator::HorvitzThompson => 1.0,
            Estimator::Unscaled => 1.0,
        }
    }
}

/// Running sum of one group.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct KeySum {
    /// Accumulated measure
    pub sum: f64,
    /// Number of observations
    pub count: u64,
}

impl KeySum {
    /// Fold another partial into this one.
    pub fn merge(&mut self, other: KeySum) {
        self.sum += other.sum;
        self.count += other.count;
    }
}

/// Per-key running sums.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SumAggregator {
    groups: HashMap<String, KeySum>,
}

impl SumAggregator {
    /// Create an empty aggregator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one observation.
    pub fn accumulate(&mut self, key: &str, measure: f64) {
        let partial = KeySum {
            sum: measure,
            count: 1,
        };
        self.merge_key(key, partial);
    }

    /// Fold a partial sum for one key.
    pub fn merge_key(&mut self, key: &str, partial: KeySum) {
        match self.groups.get_mut(key) {
            Some(group) => group.merge(partial),
            None => {
                self.groups.insert(key.to_string(), partial);
            }
        }
    }

    /// Fold all partials of another aggregator.
    pub fn merge(&mut self, other: SumAggregator) {
        if self.groups.is_empty() {
            self.groups = other.groups;
            return;
        }
        for (key, partial) in other.groups {
            match self.groups.get_mut(&key) {
                Some(group) => group.merge(partial),
                None => {
                    self.groups.insert(key, partial);
                }
            }
        }
    }

    /// Multiply every sum by `factor`. Counts are unchanged.
    pub fn scale(&mut self, factor: f64) {
        if factor == 1.0 {
            return;
        }
        for group in self.groups.values_mut() {
            group.sum *= factor;
        }
    }

    /// Number of groups.
    pub fn len(&self) -> usize {
        self.groups.len()
    }

    /// Whether no group has been seen.
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Partial of one key.
    pub fn get(&self, key: &str) -> Option<&KeySum> {
        self.groups.get(key)
    }

    /// Consume into `(key, partial)` pairs.
    pub fn into_partials(self) -> impl Iterator<Item = (String, KeySum)> {
        self.groups.into_iter()
    }

    /// Produce the result, dropping groups without observations.
    pub fn finalize(self) -> AggregateResult {
        let rows = self
            .groups
            .into_iter()
            .filter(|(_, group)| group.count > 0)
            .map(|(key, group)| (key, group.sum))
            .collect();
        AggregateResult { rows }
    }
}

/// Final aggregate: one value per group key, in key order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AggregateResult {
    rows: BTreeMap<String, f64>,
}

impl AggregateResult {
    /// Value of one group.
    pub fn get(&self, key: &str) -> Option<f64> {
        self.rows.get(key).copied()
    }

    /// Number of groups.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether the result has no rows.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Rows in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.rows.iter().map(|(k, v)| (k.as_str(), *v))
    }

    /// Arrow schema of [`AggregateResult::to_record_batch`].
    pub fn schema() -> SchemaRef {
        Arc::new(Schema::new(vec![
            Field::new("key", DataType::Utf8, false),
            Field::new("value", DataType::Float64, false),
        ]))
    }

    /// Convert to a two-column record batch.
    pub fn to_record_batch(&self) -> Result<RecordBatch> {
        let keys: Vec<&str> = self.rows.keys().map(String::as_str).collect();
        let values: Vec<f64> = self.rows.values().copied().collect();
        let columns: Vec<ArrayRef> = vec![
            Arc::new(StringArray::from(keys)),
            Arc::new(Float64Array::from(values)),
        ];
        Ok(RecordBatch::try_new(Self::schema(), columns)?)
    }
}

impl FromIterator<(String, f64)> for AggregateResult {
    fn from_iter<I: IntoIterator<Item = (String, f64)>>(iter: I) -> Self {
        Self {
            rows: iter.into_iter().collect(),
        }
    }
}
