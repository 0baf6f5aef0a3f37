//! Two-phase query pipeline.
//!
//! The pipeline drives one query over one source. Ratio and fixed-size
//! queries go straight to the final pass. Error-bound queries first run a
//! pilot pass with a fixed per-partition sample, calibrate a per-partition
//! sample size from its statistics, and run the final pass with that plan.
//!
//! ```text
//!   Init ──(error bound)──> PilotRunning ──> PilotCollected ──> FinalRunning ──> Done
//!   Init ──(ratio / size)─────────────────────────────────────> FinalRunning ──> Done
//!   any state ──(failure or cancellation)──> Failed
//! ```
//!
//! The final pass starts only once every partition of the pilot has finished
//! and the plan covers every partition.

use std::fmt;
use std::time::{Duration, Instant};

use tracing::{debug, error, info};

use crate::aggregate::{AggregateResult, Estimator, SumAggregator};
use crate::calibrate::{CalibratedPlan, Calibrator, PilotStatistic};
use crate::config::EngineConfig;
use crate::error::{ApproxError, Phase, Result};
use crate::extract::FilterExtract;
use crate::parallel::{shuffle_reduce, CancellationToken, TaskId, WorkerPool, WorkerTask};
use crate::query::QuerySpec;
use crate::scan::{PartitionOutput, PartitionScan, PartitionStats};
use crate::source::{PartitionId, PartitionSource};

/// Mixed into the run seed so the pilot and final samples are drawn from
/// different streams.
const PILOT_SEED_SALT: u64 = 0xA5A5_5A5A_C3C3_3C3C;

/// Lifecycle of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineState {
    /// Created, nothing run yet
    Init,
    /// Pilot pass in progress
    PilotRunning,
    /// Pilot finished and the plan is calibrated
    PilotCollected,
    /// Final pass in progress
    FinalRunning,
    /// Result available
    Done,
    /// Run aborted
    Failed,
}

impl PipelineState {
    /// Whether the pipeline may move from `self` to `next`.
    pub fn can_transition_to(self, next: PipelineState) -> bool {
        use PipelineState::*;
        match (self, next) {
            (Done, _) | (Failed, _) => false,
            (_, Failed) => true,
            (Init, PilotRunning) | (Init, FinalRunning) => true,
            (PilotRunning, PilotCollected) => true,
            (PilotCollected, FinalRunning) => true,
            (FinalRunning, Done) => true,
            _ => false,
        }
    }

    /// Whether no further transition is possible.
    pub fn is_terminal(self) -> bool {
        matches!(self, PipelineState::Done | PipelineState::Failed)
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Init => write!(f, "init"),
            Self::PilotRunning => write!(f, "pilot_running"),
            Self::PilotCollected => write!(f, "pilot_collected"),
            Self::FinalRunning => write!(f, "final_running"),
            Self::Done => write!(f, "done"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Counters of one pass.
#[derive(Debug, Clone)]
pub struct PassReport {
    /// Pass the report describes
    pub phase: Phase,
    /// Per-partition counters, in partition order
    pub partitions: Vec<PartitionStats>,
    /// Wall time of the pass
    pub elapsed: Duration,
}

impl PassReport {
    /// Records read across all partitions.
    pub fn records_seen(&self) -> u64 {
        self.partitions.iter().map(|p| p.records_seen).sum()
    }

    /// Records admitted across all partitions.
    pub fn records_admitted(&self) -> u64 {
        self.partitions.iter().map(|p| p.records_admitted).sum()
    }

    /// Admitted records that passed the filter.
    pub fn records_matched(&self) -> u64 {
        self.partitions.iter().map(|p| p.records_matched).sum()
    }

    /// Admitted records that did not decode.
    pub fn records_malformed(&self) -> u64 {
        self.partitions.iter().map(|p| p.records_malformed).sum()
    }

    /// Stats of one partition.
    pub fn partition(&self, partition: PartitionId) -> Option<&PartitionStats> {
        self.partitions.iter().find(|p| p.partition == partition)
    }
}

/// Pilot pass and the plan calibrated from it.
#[derive(Debug, Clone)]
pub struct PilotOutcome {
    /// Counters of the pilot pass
    pub report: PassReport,
    /// Plan the final pass ran with
    pub plan: CalibratedPlan,
}

/// Everything a successful run produced.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    /// Aggregate of the final pass
    pub result: AggregateResult,
    /// Counters of the final pass
    pub final_pass: PassReport,
    /// Present for error-bound queries
    pub pilot: Option<PilotOutcome>,
}

/// Runs one query over one source.
pub struct Pipeline<'a> {
    config: EngineConfig,
    source: &'a dyn PartitionSource,
    cancellation: CancellationToken,
    state: PipelineState,
    history: Vec<PipelineState>,
}

impl<'a> Pipeline<'a> {
    /// Create a pipeline over `source`.
    pub fn new(config: EngineConfig, source: &'a dyn PartitionSource) -> Self {
        Self {
            config,
            source,
            cancellation: CancellationToken::new(),
            state: PipelineState::Init,
            history: vec![PipelineState::Init],
        }
    }

    /// Use an externally owned cancellation token.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    /// Token that cancels this pipeline.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    /// Current state.
    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// Every state entered so far, starting with `Init`.
    pub fn history(&self) -> &[PipelineState] {
        &self.history
    }

    /// Run `spec` to completion.
    ///
    /// A pipeline runs once; on any error it ends in `Failed` and no result
    /// is produced.
    pub fn run(&mut self, spec: &QuerySpec) -> Result<RunOutcome> {
        match self.execute(spec) {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                if !self.state.is_terminal() {
                    self.state = PipelineState::Failed;
                    self.history.push(PipelineState::Failed);
                }
                error!(error = %e, "query failed");
                Err(e)
            }
        }
    }

    fn execute(&mut self, spec: &QuerySpec) -> Result<RunOutcome> {
        if self.state != PipelineState::Init {
            return Err(ApproxError::internal(format!(
                "pipeline already ran (state {})",
                self.state
            )));
        }
        self.config.validate()?;
        spec.validate()?;
        let location = self.source.location();
        if spec.source() != location {
            return Err(ApproxError::invalid_argument(format!(
                "query targets {} but the pipeline reads {}",
                spec.source(),
                location
            )));
        }

        info!(
            source = %location,
            filter = spec.filter_value(),
            group_by = %spec.group_by(),
            measure = %spec.measure_field(),
            sampling = %spec.sampling(),
            table = spec.table().unwrap_or("-"),
            predicate = spec.where_clause().unwrap_or("-"),
            "starting query"
        );

        let partitions = self.source.partitions()?;
        let pool = WorkerPool::new(self.config.parallelism)
            .with_max_attempts(self.config.max_task_attempts);

        let (final_spec, pilot) = if spec.needs_calibration() {
            self.transition(PipelineState::PilotRunning)?;
            let pilot_spec = spec.pilot_spec(self.config.pilot_sample_size);
            let (report, _) = self.run_pass(
                &pool,
                Phase::Pilot,
                &pilot_spec,
                &partitions,
                self.config.seed ^ PILOT_SEED_SALT,
                None,
            )?;
            info!(
                partitions = report.partitions.len(),
                seen = report.records_seen(),
                admitted = report.records_admitted(),
                matched = report.records_matched(),
                elapsed_ms = report.elapsed.as_millis() as u64,
                "pilot pass finished"
            );

            let calibrator = Calibrator::for_spec(spec, &self.config)?;
            let statistics: Vec<PilotStatistic> =
                report.partitions.iter().map(PilotStatistic::from).collect();
            let plan = calibrator.calibrate(spec.fingerprint(), &partitions, statistics)?;
            for (partition, target) in plan.iter() {
                debug!(%partition, %target, "calibrated target");
            }
            info!(
                error = calibrator.error(),
                confidence = calibrator.confidence(),
                z = calibrator.z(),
                total_sample_size = plan.total_sample_size(),
                skipped_partitions = plan.skipped(),
                "calibrated plan"
            );
            self.transition(PipelineState::PilotCollected)?;

            let final_spec = spec.with_calibrated_plan(plan.clone())?;
            (final_spec, Some(PilotOutcome { report, plan }))
        } else {
            (spec.clone(), None)
        };

        self.transition(PipelineState::FinalRunning)?;
        let (final_pass, partials) = self.run_pass(
            &pool,
            Phase::Final,
            &final_spec,
            &partitions,
            self.config.seed,
            Some(self.config.estimator),
        )?;

        let merged = shuffle_reduce(&pool, self.config.reducers, partials)
            .map_err(|e| ApproxError::execution(Phase::Final, None, e.to_string()))?;
        let result = merged.finalize();
        self.transition(PipelineState::Done)?;

        info!(
            groups = result.len(),
            seen = final_pass.records_seen(),
            admitted = final_pass.records_admitted(),
            matched = final_pass.records_matched(),
            malformed = final_pass.records_malformed(),
            elapsed_ms = final_pass.elapsed.as_millis() as u64,
            "query finished"
        );

        Ok(RunOutcome {
            result,
            final_pass,
            pilot,
        })
    }

    /// Run one pass over every partition and wait for all of them.
    fn run_pass(
        &self,
        pool: &WorkerPool,
        phase: Phase,
        spec: &QuerySpec,
        partitions: &[PartitionId],
        seed: u64,
        estimator: Option<Estimator>,
    ) -> Result<(PassReport, Vec<SumAggregator>)> {
        let start = Instant::now();
        let extract = FilterExtract::from_spec(spec);
        let mut scan = PartitionScan::new(self.source, &extract, seed, &self.cancellation);
        if let Some(estimator) = estimator {
            scan = scan.with_estimator(estimator);
        }

        // Resolve every partition's sampling before any task starts
        let mut tasks = Vec::with_capacity(partitions.len());
        for &partition in partitions {
            let sampling = spec.partition_sampling(partition)?;
            debug!(%phase, %partition, ?sampling, "scheduling partition");
            let scan = &scan;
            tasks.push(WorkerTask::new(TaskId::Map(partition), move |_ctx| {
                scan.run(partition, sampling)
            }));
        }

        let results = pool.execute_all(tasks);

        let mut stats = Vec::with_capacity(results.len());
        let mut partials = Vec::with_capacity(results.len());
        for (&partition, result) in partitions.iter().zip(results) {
            match result {
                Ok(PartitionOutput { stats: s, partial }) => {
                    stats.push(s);
                    partials.push(partial);
                }
                Err(ApproxError::Cancelled) => return Err(ApproxError::Cancelled),
                Err(e) => {
                    return Err(ApproxError::execution(phase, Some(partition), e.to_string()))
                }
            }
        }

        let report = PassReport {
            phase,
            partitions: stats,
            elapsed: start.elapsed(),
        };
        Ok((report, partials))
    }

    fn transition(&mut self, next: PipelineState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(ApproxError::internal(format!(
                "invalid pipeline transition {} -> {}",
                self.state, next
            )));
        }
        if self.cancellation.is_cancelled() {
            return Err(ApproxError::Cancelled);
        }
        debug!(from = %self.state, to = %next, "pipeline transition");
        self.state = next;
        self.history.push(next);
        Ok(())
    }
}
