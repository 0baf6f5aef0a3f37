//! approxagg - Adaptive Two-Phase Approximate Aggregation
//!
//! approxagg computes approximate grouped sums over large collections of
//! JSON event lines without reading every record. A query either samples
//! with a fixed ratio or per-partition size, or asks for a relative error
//! bound at a confidence level. In the second case a small pilot pass
//! measures how variable each partition is, and the final pass samples
//! just enough records per partition to meet the bound.
//!
//! # Features
//!
//! - **Seeded Sampling**: Reproducible per-partition sample streams
//! - **Pilot Calibration**: Per-partition sample sizes from an error bound
//! - **Parallel Passes**: One task per partition on a scoped worker pool
//! - **Unbiased Estimates**: Horvitz–Thompson expansion of sampled sums
//! - **Arrow Output**: TSV, CSV, JSON Lines or pretty tables
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use approxagg::{EngineConfig, FileSource, PartitionSource, Pipeline, QuerySpec, Result};
//!
//! fn main() -> Result<()> {
//!     let config = EngineConfig::default();
//!     let source = FileSource::open("events/", config.split_size)?;
//!
//!     // Sum of PushEvent sizes within 1% at 95% confidence
//!     let spec = QuerySpec::builder(source.location())
//!         .filter("PushEvent")
//!         .error_bound(0.01, 0.95)
//!         .build()?;
//!
//!     let outcome = Pipeline::new(config, &source).run(&spec)?;
//!     for (key, value) in outcome.result.iter() {
//!         println!("{}\t{}", key, value);
//!     }
//!     Ok(())
//! }
//! ```

pub mod aggregate;
pub mod calibrate;
pub mod config;
pub mod error;
pub mod extract;
pub mod output;
pub mod parallel;
pub mod pipeline;
pub mod query;
pub mod record;
pub mod sampler;
pub mod scan;
pub mod source;

pub use aggregate::{AggregateResult, Estimator};
pub use calibrate::{CalibratedPlan, PartitionTarget, PilotStatistic, ZeroSignalPolicy};
pub use config::EngineConfig;
pub use error::{ApproxError, Phase, Result};
pub use output::{OutputFormat, OutputWriter};
pub use parallel::CancellationToken;
pub use pipeline::{PassReport, Pipeline, PipelineState, RunOutcome};
pub use query::{GroupBy, QuerySpec, SamplingMode};
pub use source::{FileSource, MemorySource, PartitionId, PartitionSource};

/// Run `spec` over `source` and return only the aggregate.
pub fn approximate_sum(
    config: EngineConfig,
    source: &dyn PartitionSource,
    spec: &QuerySpec,
) -> Result<AggregateResult> {
    let mut pipeline = Pipeline::new(config, source);
    Ok(pipeline.run(spec)?.result)
}

/// Prelude module for common imports.
pub mod prelude {
    pub use crate::error::{ApproxError, Result};
    pub use crate::query::{QuerySpec, SamplingMode};
    pub use crate::source::{FileSource, MemorySource, PartitionSource};
    pub use crate::{approximate_sum, AggregateResult, EngineConfig, Pipeline};
}
