//! Pilot calibration.
//!
//! In error-bound mode a small pilot pass samples a fixed number of records
//! per partition and reports one [`PilotStatistic`] per partition. The
//! [`Calibrator`] turns those statistics into a [`CalibratedPlan`]: the
//! number of records the final pass must sample from each partition so that
//! the partition's estimated sum has a relative error of at most `ε` at the
//! requested confidence.
//!
//! For a partition of `N` records whose pilot sample has mean `ȳ` and
//! standard deviation `s` (records failing the filter count as zero), the
//! expanded estimate `N·ȳ` has standard error `N·s/√k` at sample size `k`.
//! Requiring `z·N·s/√k ≤ ε·N·ȳ` gives `k₀ = (z·s / (ε·ȳ))²`, which is then
//! corrected for the finite partition, `k = k₀ / (1 + k₀/N)`, and clamped to
//! `[min(minimum, N), N]`.

use std::collections::{BTreeMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::error::{ApproxError, Result};
use crate::query::{QuerySpec, SamplingMode};
use crate::source::PartitionId;

/// What to do with a partition in which the pilot matched nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ZeroSignalPolicy {
    /// Sample the configured fallback size
    #[default]
    Fallback,
    /// Do not read the partition in the final pass
    Skip,
}

/// Observations of one partition during the pilot pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PilotStatistic {
    /// Partition the statistic describes
    pub partition: PartitionId,
    /// Records read
    pub records_seen: u64,
    /// Records admitted into the sample
    pub records_admitted: u64,
    /// Admitted records that passed the filter
    pub records_matched: u64,
    /// Sum of the matched measures
    pub sum_of_matched: f64,
    /// Sum of the squared matched measures
    pub sum_of_squares: f64,
}

impl PilotStatistic {
    /// Empty statistic for a partition.
    pub fn new(partition: PartitionId) -> Self {
        Self {
            partition,
            records_seen: 0,
            records_admitted: 0,
            records_matched: 0,
            sum_of_matched: 0.0,
            sum_of_squares: 0.0,
        }
    }

    /// Mean measure per admitted record, unmatched records counting as zero.
    pub fn mean(&self) -> Option<f64> {
        if self.records_admitted == 0 {
            return None;
        }
        Some(self.sum_of_matched / self.records_admitted as f64)
    }

    /// Unbiased sample variance over admitted records.
    pub fn sample_variance(&self) -> Option<f64> {
        if self.records_admitted < 2 {
            return None;
        }
        let n = self.records_admitted as f64;
        let mean = self.sum_of_matched / n;
        Some(((self.sum_of_squares - n * mean * mean) / (n - 1.0)).max(0.0))
    }

    /// Pilot estimate of the partition's total.
    pub fn estimated_sum(&self) -> Option<f64> {
        self.mean().map(|mean| mean * self.records_seen as f64)
    }
}

/// Final-pass treatment of one partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionTarget {
    /// Sample this many records
    Sample(u64),
    /// Do not read the partition
    Skip,
}

impl fmt::Display for PartitionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PartitionTarget::Sample(n) => write!(f, "sample {}", n),
            PartitionTarget::Skip => write!(f, "skip"),
        }
    }
}

/// Identity of the query a plan was computed for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanFingerprint {
    pub source: String,
    pub filter_field: String,
    pub filter_value: String,
    pub group_by: String,
    pub measure_field: String,
}

impl fmt::Display for PlanFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "sum({}) where {} = '{}' group by {} over {}",
            self.measure_field, self.filter_field, self.filter_value, self.group_by, self.source
        )
    }
}

/// Per-partition sample sizes for the final pass of one query.
#[derive(Debug, Clone, PartialEq)]
pub struct CalibratedPlan {
    fingerprint: PlanFingerprint,
    targets: BTreeMap<PartitionId, PartitionTarget>,
}

impl CalibratedPlan {
    /// Create a plan.
    pub fn new(fingerprint: PlanFingerprint, targets: BTreeMap<PartitionId, PartitionTarget>) -> Self {
        Self {
            fingerprint,
            targets,
        }
    }

    /// Query the plan belongs to.
    pub fn fingerprint(&self) -> &PlanFingerprint {
        &self.fingerprint
    }

    /// Target of one partition.
    pub fn target(&self, partition: PartitionId) -> Option<PartitionTarget> {
        self.targets.get(&partition).copied()
    }

    /// Number of partitions in the plan.
    pub fn len(&self) -> usize {
        self.targets.len()
    }

    /// Whether the plan covers no partitions.
    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    /// Targets in partition order.
    pub fn iter(&self) -> impl Iterator<Item = (PartitionId, PartitionTarget)> + '_ {
        self.targets.iter().map(|(p, t)| (*p, *t))
    }

    /// Sum of all sample sizes.
    pub fn total_sample_size(&self) -> u64 {
        self.targets
            .values()
            .map(|t| match t {
                PartitionTarget::Sample(n) => *n,
                PartitionTarget::Skip => 0,
            })
            .sum()
    }

    /// Number of skipped partitions.
    pub fn skipped(&self) -> usize {
        self.targets
            .values()
            .filter(|t| matches!(t, PartitionTarget::Skip))
            .count()
    }
}

/// Limits applied while calibrating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CalibrationSettings {
    pub minimum_size: u64,
    pub fallback_size: u64,
    pub zero_signal_policy: ZeroSignalPolicy,
}

impl Default for CalibrationSettings {
    fn default() -> Self {
        Self::from(&EngineConfig::default())
    }
}

impl From<&EngineConfig> for CalibrationSettings {
    fn from(config: &EngineConfig) -> Self {
        Self {
            minimum_size: config.minimum_sample_size,
            fallback_size: config.fallback_sample_size,
            zero_signal_policy: config.zero_signal_policy,
        }
    }
}

/// Whether a sampling mode requires a pilot pass.
pub fn needs_calibration(mode: &SamplingMode) -> bool {
    matches!(mode, SamplingMode::ErrorBound { .. })
}

/// Computes calibrated plans for one error bound.
#[derive(Debug, Clone)]
pub struct Calibrator {
    error: f64,
    confidence: f64,
    z: f64,
    settings: CalibrationSettings,
}

impl Calibrator {
    /// Create a calibrator for relative error `error` at `confidence`.
    pub fn new(error: f64, confidence: f64, settings: CalibrationSettings) -> Result<Self> {
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

        Ok(Self {
            error,
            confidence,
            z: normal_quantile(1.0 - (1.0 - confidence) / 2.0),
            settings,
        })
    }

    /// Create the calibrator of an error-bound query.
    pub fn for_spec(spec: &QuerySpec, config: &EngineConfig) -> Result<Self> {
        match spec.sampling() {
            SamplingMode::ErrorBound { error, confidence } => {
                Self::new(error, confidence, CalibrationSettings::from(config))
            }
            other => Err(ApproxError::internal(format!(
                "calibration requested for {} sampling",
                other
            ))),
        }
    }

    /// Two-sided normal quantile of the configured confidence.
    pub fn z(&self) -> f64 {
        self.z
    }

    /// Relative error tolerance.
    pub fn error(&self) -> f64 {
        self.error
    }

    /// Confidence level.
    pub fn confidence(&self) -> f64 {
        self.confidence
    }

    /// Final-pass target of one partition.
    pub fn required_size(&self, stat: &PilotStatistic) -> PartitionTarget {
        let seen = stat.records_seen;
        if seen == 0 {
            return PartitionTarget::Skip;
        }

        if stat.records_matched == 0 {
            if stat.records_admitted >= seen {
                // The pilot read the whole partition and the filter never matched
                return PartitionTarget::Skip;
            }
            return match self.settings.zero_signal_policy {
                ZeroSignalPolicy::Fallback => {
                    PartitionTarget::Sample(self.settings.fallback_size.clamp(1, seen))
                }
                ZeroSignalPolicy::Skip => PartitionTarget::Skip,
            };
        }

        let floor = self.settings.minimum_size.clamp(1, seen);
        let (Some(mean), Some(variance)) = (stat.mean(), stat.sample_variance()) else {
            // A single admitted record says nothing about spread
            return PartitionTarget::Sample(seen);
        };

        let std_dev = variance.sqrt();
        if std_dev == 0.0 {
            return PartitionTarget::Sample(floor);
        }
        if mean == 0.0 || self.error == 0.0 {
            return PartitionTarget::Sample(seen);
        }

        let k0 = (self.z * std_dev / (self.error * mean.abs())).powi(2);
        if !k0.is_finite() {
            return PartitionTarget::Sample(seen);
        }
        let k = k0 / (1.0 + k0 / seen as f64);
        let size = (k.ceil() as u64).clamp(floor, seen);
        PartitionTarget::Sample(size)
    }

    /// Build the plan of a query from its pilot statistics.
    ///
    /// Every partition in `partitions` must have exactly one statistic;
    /// otherwise the calibration fails as a whole.
    pub fn calibrate(
        &self,
        fingerprint: PlanFingerprint,
        partitions: &[PartitionId],
        stats: Vec<PilotStatistic>,
    ) -> Result<CalibratedPlan> {
        let expected: HashSet<PartitionId> = partitions.iter().copied().collect();
        let mut by_partition: BTreeMap<PartitionId, PilotStatistic> = BTreeMap::new();

        for stat in stats {
            if !expected.contains(&stat.partition) {
                return Err(ApproxError::calibration_incomplete(
                    stat.partition,
                    "statistic for a partition outside the run",
                ));
            }
            if by_partition.insert(stat.partition, stat).is_some() {
                return Err(ApproxError::calibration_incomplete(
                    stat.partition,
                    "partition reported more than one pilot statistic",
                ));
            }
        }

        let mut targets = BTreeMap::new();
        for &partition in partitions {
            let stat = by_partition.get(&partition).ok_or_else(|| {
                ApproxError::calibration_incomplete(partition, "no pilot statistic reported")
            })?;

            let target = self.required_size(stat);
            if stat.records_matched == 0 && stat.records_seen > 0 {
                warn!(
                    %partition,
                    seen = stat.records_seen,
                    admitted = stat.records_admitted,
                    %target,
                    "pilot matched no records"
                );
            } else {
                debug!(
                    %partition,
                    seen = stat.records_seen,
                    admitted = stat.records_admitted,
                    matched = stat.records_matched,
                    mean = stat.mean().unwrap_or(0.0),
                    variance = stat.sample_variance().unwrap_or(0.0),
                    %target,
                    "calibrated partition"
                );
            }
            targets.insert(partition, target);
        }

        Ok(CalibratedPlan::new(fingerprint, targets))
    }
}

/// Inverse of the standard normal CDF.
///
/// Acklam's rational approximation, relative error below 1.2e-9 on (0, 1).
pub fn normal_quantile(p: f64) -> f64 {
    const A: [f64; 6] = [
        -3.969_683_028_665_376e1,
        2.209_460_984_245_205e2,
        -2.759_285_104_469_687e2,
        1.383_577_518_672_690e2,
        -3.066_479_806_614_716e1,
        2.506_628_277_459_239e0,
    ];
    const B: [f64; 5] = [
        -5.447_609_879_822_406e1,
        1.615_858_368_580_409e2,
        -1.556_989_798_598_866e2,
        6.680_131_188_771_972e1,
        -1.328_068_155_288_572e1,
    ];
    const C: [f64; 6] = [
        -7.784_894_002_430_293e-3,
        -3.223_964_580_411_365e-1,
        -2.400_758_277_161_838e0,
        -2.549_732_539_343_734e0,
        4.374_664_141_464_968e0,
        2.938_163_982_698_783e0,
    ];
    const D: [f64; 4] = [
        7.784_695_709_041_462e-3,
        3.224_671_290_700_398e-1,
        2.445_134_137_142_996e0,
        3.754_408_661_907_416e0,
    ];
    const P_LOW: f64 = 0.02425;

    if p <= 0.0 {
        return f64::NEG_INFINITY;
    }
    if p >= 1.0 {
        return f64::INFINITY;
    }

    let tail = |q: f64| {
        (((((C[0] * q + C[1]) * q + C[2]) * q + C[3]) * q + C[4]) * q + C[5])
            / ((((D[0] * q + D[1]) * q + D[2]) * q + D[3]) * q + 1.0)
    };

    if p < P_LOW {
        tail((-2.0 * p.ln()).sqrt())
    } else if p <= 1.0 - P_LOW {
        let q = p - 0.5;
        let r = q * q;
        (((((A[0] * r + A[1]) * r + A[2]) * r + A[3]) * r + A[4]) * r + A[5]) * q
            / (((((B[0] * r + B[1]) * r + B[2]) * r + B[3]) * r + B[4]) * r + 1.0)
    } else {
        -tail((-2.0 * (1.0 - p).ln()).sqrt())
    }
}
