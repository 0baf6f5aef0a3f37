//! Query specifications.
//!
//! A [`QuerySpec`] is an immutable description of one aggregation: where
//! the records live, which records count, what is summed, what it is grouped
//! by, and how the input is sampled. The pipeline never mutates a spec; the
//! pilot and final passes of an error-bound query run with specs derived
//! from the caller's through [`QuerySpec::pilot_spec`] and
//! [`QuerySpec::with_calibrated_plan`].

use std::fmt;
use std::sync::Arc;

use crate::calibrate::{CalibratedPlan, PartitionTarget, PlanFingerprint};
use crate::error::{ApproxError, Result};
use crate::record::FieldPath;
use crate::sampler::PartitionSampling;
use crate::source::PartitionId;

/// Default value of the type filter.
pub const DEFAULT_FILTER: &str = "PushEvent";
/// Default field the filter value is compared with.
pub const DEFAULT_FILTER_FIELD: &str = "type";
/// Default summed field.
pub const DEFAULT_MEASURE_FIELD: &str = "payload.size";

/// How the input is sampled.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SamplingMode {
    /// Admit each record independently with probability `p`
    Ratio(f64),
    /// Admit about `n` records per partition
    FixedSize(u64),
    /// Calibrate per-partition sizes so the relative error stays within
    /// `error` at the given two-sided `confidence`
    ErrorBound { error: f64, confidence: f64 },
}

impl Default for SamplingMode {
    fn default() -> Self {
        SamplingMode::Ratio(1.0)
    }
}

impl fmt::Display for SamplingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SamplingMode::Ratio(p) => write!(f, "ratio({})", p),
            SamplingMode::FixedSize(n) => write!(f, "size({})", n),
            SamplingMode::ErrorBound { error, confidence } => {
                write!(f, "error({}, confidence {})", error, confidence)
            }
        }
    }
}

/// What matched records are grouped by.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum GroupBy {
    /// Every matched record is reported under the filter value
    #[default]
    FilterValue,
    /// The record's value at a field path
    Field(FieldPath),
}

impl fmt::Display for GroupBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GroupBy::FilterValue => write!(f, "<filter>"),
            GroupBy::Field(path) => write!(f, "{}", path),
        }
    }
}

/// Immutable description of an approximate aggregation.
#[derive(Debug, Clone, PartialEq)]
pub struct QuerySpec {
    source: String,
    filter_field: FieldPath,
    filter_value: String,
    group_by: GroupBy,
    measure_field: FieldPath,
    sampling: SamplingMode,
    is_pilot: bool,
    pilot_size: Option<u64>,
    plan: Option<Arc<CalibratedPlan>>,
    table: Option<String>,
    where_clause: Option<String>,
}

impl QuerySpec {
    /// Start building a spec over `source`.
    pub fn builder(source: impl Into<String>) -> QuerySpecBuilder {
        QuerySpecBuilder::new(source)
    }

    /// Source location.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Field compared against the filter value.
    pub fn filter_field(&self) -> &FieldPath {
        &self.filter_field
    }

    /// Value a record's filter field must equal.
    pub fn filter_value(&self) -> &str {
        &self.filter_value
    }

    /// Grouping dimension.
    pub fn group_by(&self) -> &GroupBy {
        &self.group_by
    }

    /// Summed field.
    pub fn measure_field(&self) -> &FieldPath {
        &self.measure_field
    }

    /// Requested sampling mode.
    pub fn sampling(&self) -> SamplingMode {
        self.sampling
    }

    /// Whether this spec drives a pilot pass.
    pub fn is_pilot(&self) -> bool {
        self.is_pilot
    }

    /// Calibrated plan attached for the final pass, if any.
    pub fn plan(&self) -> Option<&CalibratedPlan> {
        self.plan.as_deref()
    }

    /// Pass-through table name.
    pub fn table(&self) -> Option<&str> {
        self.table.as_deref()
    }

    /// Pass-through predicate.
    pub fn where_clause(&self) -> Option<&str> {
        self.where_clause.as_deref()
    }

    /// Whether the query needs a pilot pass before the final one.
    pub fn needs_calibration(&self) -> bool {
        matches!(self.sampling, SamplingMode::ErrorBound { .. }) && self.plan.is_none()
    }

    /// Identity of the computation, independent of sampling.
    pub fn fingerprint(&self) -> PlanFingerprint {
        PlanFingerprint {
            source: self.source.clone(),
            filter_field: self.filter_field.to_string(),
            filter_value: self.filter_value.clone(),
            group_by: self.group_by.to_string(),
            measure_field: self.measure_field.to_string(),
        }
    }

    /// Check the spec is runnable.
    pub fn validate(&self) -> Result<()> {
        if self.source.trim().is_empty() {
            return Err(ApproxError::invalid_argument("source location is required"));
        }
        if self.filter_value.is_empty() {
            return Err(ApproxError::invalid_argument("filter value is required"));
        }
        if self.filter_field.is_empty() {
            return Err(ApproxError::invalid_argument("filter field is required"));
        }
        if self.measure_field.is_empty() {
            return Err(ApproxError::invalid_argument("measure field is required"));
        }
        if let GroupBy::Field(path) = &self.group_by {
            if path.is_empty() {
                return Err(ApproxError::invalid_argument("group-by field is empty"));
            }
        }

        match self.sampling {
            SamplingMode::Ratio(p) => {
                if !(p > 0.0 && p <= 1.0) {
                    return Err(ApproxError::invalid_argument(format!(
                        "sampling ratio must be in (0, 1], got {}",
                        p
                    )));
                }
            }
            SamplingMode::FixedSize(n) => {
                if n == 0 {
                    return Err(ApproxError::invalid_argument("sample size must be >= 1"));
                }
            }
            SamplingMode::ErrorBound { error, confidence } => {
                if !(error.is_finite() && error >= 0.0) {
                    return Err(ApproxError::invalid_argument(format!(
                        "error tolerance must be a finite value >= 0, got {}",
                        error
                    )));
                }
                if !(confidence > 0.0 && confidence < 1.0) {
                    return Err(ApproxError::invalid_argument(format!(
                        "confidence must be in (0, 1), got {}",
                        confidence
                    )));
                }
            }
        }

        if self.is_pilot && self.pilot_size.is_none() {
            return Err(ApproxError::internal("pilot spec without a pilot size"));
        }
        Ok(())
    }

    /// Derive the spec of the pilot pass.
    pub fn pilot_spec(&self, pilot_size: u64) -> QuerySpec {
        QuerySpec {
            is_pilot: true,
            pilot_size: Some(pilot_size.max(1)),
            plan: None,
            ..self.clone()
        }
    }

    /// Derive the spec of the final pass from a calibrated plan.
    ///
    /// Fails when the plan was computed for a different query.
    pub fn with_calibrated_plan(&self, plan: CalibratedPlan) -> Result<QuerySpec> {
        if !matches!(self.sampling, SamplingMode::ErrorBound { .. }) {
            return Err(ApproxError::plan_mismatch(format!(
                "query samples by {}, not by error bound",
                self.sampling
            )));
        }
        let fingerprint = self.fingerprint();
        if plan.fingerprint() != &fingerprint {
            return Err(ApproxError::plan_mismatch(format!(
                "plan was derived for {}, query is {}",
                plan.fingerprint(),
                fingerprint
            )));
        }

        Ok(QuerySpec {
            is_pilot: false,
            pilot_size: None,
            plan: Some(Arc::new(plan)),
            ..self.clone()
        })
    }

    /// Sampling applied to one partition in the pass this spec drives.
    pub fn partition_sampling(&self, partition: PartitionId) -> Result<PartitionSampling> {
        match self.sampling {
            SamplingMode::Ratio(p) => Ok(PartitionSampling::Ratio(p)),
            SamplingMode::FixedSize(n) => Ok(PartitionSampling::FixedSize(n)),
            SamplingMode::ErrorBound { .. } => {
                if self.is_pilot {
                    let size = self
                        .pilot_size
                        .ok_or_else(|| ApproxError::internal("pilot spec without a pilot size"))?;
                    return Ok(PartitionSampling::FixedSize(size));
                }
                let plan = self.plan.as_ref().ok_or_else(|| {
                    ApproxError::internal("error-bound query ran without a calibrated plan")
                })?;
                match plan.target(partition) {
                    Some(PartitionTarget::Sample(n)) => Ok(PartitionSampling::FixedSize(n)),
                    Some(PartitionTarget::Skip) => Ok(PartitionSampling::Skip),
                    None => Err(ApproxError::calibration_incomplete(
                        partition,
                        "partition has no calibrated size",
                    )),
                }
            }
        }
    }
}

/// Builder for [`QuerySpec`].
#[derive(Debug, Clone)]
pub struct QuerySpecBuilder {
    source: String,
    filter_field: FieldPath,
    filter_value: String,
    group_by: GroupBy,
    measure_field: FieldPath,
    modes: Vec<SamplingMode>,
    table: Option<String>,
    where_clause: Option<String>,
}

impl QuerySpecBuilder {
    fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            filter_field: FieldPath::parse(DEFAULT_FILTER_FIELD),
            filter_value: DEFAULT_FILTER.to_string(),
            group_by: GroupBy::FilterValue,
            measure_field: FieldPath::parse(DEFAULT_MEASURE_FIELD),
            modes: Vec::new(),
            table: None,
            where_clause: None,
        }
    }

    /// Set the filter value.
    pub fn filter(mut self, value: impl Into<String>) -> Self {
        self.filter_value = value.into();
        self
    }

    /// Set the field compared with the filter value.
    pub fn filter_field(mut self, path: &str) -> Self {
        self.filter_field = FieldPath::parse(path);
        self
    }

    /// Group by a record field instead of the filter value.
    pub fn group_by_field(mut self, path: &str) -> Self {
        self.group_by = GroupBy::Field(FieldPath::parse(path));
        self
    }

    /// Set the summed field.
    pub fn measure_field(mut self, path: &str) -> Self {
        self.measure_field = FieldPath::parse(path);
        self
    }

    /// Sample with a fixed ratio.
    pub fn ratio(mut self, p: f64) -> Self {
        self.modes.push(SamplingMode::Ratio(p));
        self
    }

    /// Sample a fixed number of records per partition.
    pub fn fixed_size(mut self, n: u64) -> Self {
        self.modes.push(SamplingMode::FixedSize(n));
        self
    }

    /// Calibrate sampling to an error bound.
    pub fn error_bound(mut self, error: f64, confidence: f64) -> Self {
        self.modes.push(SamplingMode::ErrorBound { error, confidence });
        self
    }

    /// Attach a table name.
    pub fn table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }

    /// Attach a predicate.
    pub fn where_clause(mut self, clause: impl Into<String>) -> Self {
        self.where_clause = Some(clause.into());
        self
    }

    /// Build and validate. With no sampling mode the whole input is read.
    pub fn build(self) -> Result<QuerySpec> {
        if self.modes.len() > 1 {
            let modes: Vec<String> = self.modes.iter().map(|m| m.to_string()).collect();
            return Err(ApproxError::invalid_argument(format!(
                "ratio, size and error bound are mutually exclusive, got {}",
                modes.join(" and ")
            )));
        }

        let spec = QuerySpec {
            source: self.source,
            filter_field: self.filter_field,
            filter_value: self.filter_value,
            group_by: self.group_by,
            measure_field: self.measure_field,
            sampling: self.modes.into_iter().next().unwrap_or_default(),
            is_pilot: false,
            pilot_size: None,
            plan: None,
            table: self.table,
            where_clause: self.where_clause,
        };
        spec.validate()?;
        Ok(spec)
    }
}
