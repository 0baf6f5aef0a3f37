//! approxagg CLI - approximate grouped sums over JSON event lines

use std::path::PathBuf;
use std::process::ExitCode;

use clap::error::ErrorKind;
use clap::{CommandFactory, Parser};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use approxagg::output::{OutputFormat, OutputWriter};
use approxagg::query::{DEFAULT_FILTER, DEFAULT_FILTER_FIELD, DEFAULT_MEASURE_FIELD};
use approxagg::{
    ApproxError, EngineConfig, Estimator, FileSource, PartitionSource, Pipeline, QuerySpec, Result,
};

/// approxagg - adaptive two-phase approximate aggregation
#[derive(Parser, Debug)]
#[command(name = "approxagg")]
#[command(version)]
#[command(
    about = "Approximate sum of a numeric field over JSON event lines, by ratio, size or error bound",
    long_about = None
)]
struct Cli {
    /// Input file or directory of event files
    #[arg(short, long)]
    input: PathBuf,

    /// Destination file of the result
    #[arg(short, long)]
    output: PathBuf,

    /// Value the filter field must equal
    #[arg(short, long, default_value = DEFAULT_FILTER)]
    filter: String,

    /// Sampling ratio in (0, 1]
    #[arg(short, long, value_parser = parse_ratio, conflicts_with_all = ["size", "error"])]
    ratio: Option<f64>,

    /// Records to sample per partition
    #[arg(
        short,
        long,
        value_parser = clap::value_parser!(u64).range(1..),
        conflicts_with_all = ["ratio", "error"]
    )]
    size: Option<u64>,

    /// Relative error tolerance; runs a pilot pass to size the sample
    #[arg(short, long, value_parser = parse_error, requires = "confidence")]
    error: Option<f64>,

    /// Confidence level in (0, 1) of the error tolerance
    #[arg(short, long, value_parser = parse_confidence, requires = "error")]
    confidence: Option<f64>,

    /// Logical table name, logged with the query
    #[arg(short, long)]
    table: Option<String>,

    /// Predicate, logged with the query
    #[arg(short = 'w', long = "where")]
    where_clause: Option<String>,

    /// Field path to group by (default: the filter value)
    #[arg(short = 'g', long = "groupBy")]
    group_by: Option<String>,

    /// Field path of the summed measure
    #[arg(short, long, default_value = DEFAULT_MEASURE_FIELD)]
    measure: String,

    /// Field path compared with the filter value
    #[arg(long, default_value = DEFAULT_FILTER_FIELD)]
    filter_field: String,

    /// Output format (tsv, csv, json, table)
    #[arg(long, default_value = "tsv")]
    format: OutputFormat,

    /// Path to TOML engine configuration
    #[arg(long)]
    config: Option<PathBuf>,

    /// Worker threads
    #[arg(long)]
    parallelism: Option<usize>,

    /// Target partition size in bytes
    #[arg(long)]
    split_size: Option<u64>,

    /// Sampling seed
    #[arg(long)]
    seed: Option<u64>,

    /// Report raw sampled sums instead of expanded estimates
    #[arg(long)]
    unscaled: bool,
}

fn parse_ratio(s: &str) -> std::result::Result<f64, String> {
    let p: f64 = s.parse().map_err(|_| format!("'{}' is not a number", s))?;
    if p > 0.0 && p <= 1.0 {
        Ok(p)
    } else {
        Err(format!("ratio must be in (0, 1], got {}", p))
    }
}

fn parse_error(s: &str) -> std::result::Result<f64, String> {
    let e: f64 = s.parse().map_err(|_| format!("'{}' is not a number", s))?;
    if e.is_finite() && e >= 0.0 {
        Ok(e)
    } else {
        Err(format!("error tolerance must be a finite value >= 0, got {}", e))
    }
}

fn parse_confidence(s: &str) -> std::result::Result<f64, String> {
    let c: f64 = s.parse().map_err(|_| format!("'{}' is not a number", s))?;
    if c > 0.0 && c < 1.0 {
        Ok(c)
    } else {
        Err(format!("confidence must be in (0, 1), got {}", c))
    }
}

impl Cli {
    /// Engine configuration: file, then environment, then flags.
    fn engine_config(&self) -> Result<EngineConfig> {
        let mut config = match &self.config {
            Some(path) => EngineConfig::from_file(path)?,
            None => EngineConfig::default(),
        };
        config.apply_env_overrides();

        if let Some(parallelism) = self.parallelism {
            config = config.with_parallelism(parallelism);
        }
        if let Some(split_size) = self.split_size {
            config = config.with_split_size(split_size);
        }
        if let Some(seed) = self.seed {
            config = config.with_seed(seed);
        }
        if self.unscaled {
            config = config.with_estimator(Estimator::Unscaled);
        }

        config.validate()?;
        Ok(config)
    }

    fn query_spec(&self, source: &dyn PartitionSource) -> Result<QuerySpec> {
        let mut builder = QuerySpec::builder(source.location())
            .filter(self.filter.as_str())
            .filter_field(&self.filter_field)
            .measure_field(&self.measure);

        if let Some(group_by) = &self.group_by {
            builder = builder.group_by_field(group_by);
        }
        if let Some(table) = &self.table {
            builder = builder.table(table.as_str());
        }
        if let Some(clause) = &self.where_clause {
            builder = builder.where_clause(clause.as_str());
        }

        builder = match (self.ratio, self.size, self.error, self.confidence) {
            (Some(p), _, _, _) => builder.ratio(p),
            (_, Some(n), _, _) => builder.fixed_size(n),
            (_, _, Some(error), Some(confidence)) => builder.error_bound(error, confidence),
            _ => builder,
        };

        builder.build()
    }
}

fn init_tracing(log_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();
}

/// Report a caller error the way argument parsing does and exit with code 2.
fn usage_error(err: &ApproxError) -> ! {
    Cli::command()
        .error(ErrorKind::ValueValidation, err.to_string())
        .exit()
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match cli.engine_config() {
        Ok(config) => config,
        Err(e) => usage_error(&e),
    };
    init_tracing(&config.log_level);
    debug!(?config, "engine configuration");

    let source = match FileSource::open(&cli.input, config.split_size) {
        Ok(source) => source,
        Err(e) if e.is_usage_error() => usage_error(&e),
        Err(e) => {
            eprintln!("Error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let spec = match cli.query_spec(&source) {
        Ok(spec) => spec,
        Err(e) => usage_error(&e),
    };

    let mut pipeline = Pipeline::new(config, &source);
    let outcome = match pipeline.run(&spec) {
        Ok(outcome) => outcome,
        Err(e) => {
            eprintln!("Error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let mut writer = OutputWriter::file(cli.format, &cli.output);
    if let Err(e) = writer.write_result(&outcome.result) {
        eprintln!("Error: failed to write {}: {}", cli.output.display(), e);
        return ExitCode::FAILURE;
    }

    info!(
        output = %cli.output.display(),
        groups = outcome.result.len(),
        "result written"
    );
    ExitCode::SUCCESS
}
