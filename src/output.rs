//! Output formatting for query results.
//!
//! This module provides different output formats for an [`AggregateResult`]:
//! - TSV (default, one `key<TAB>value` line per group)
//! - CSV
//! - JSON Lines
//! - Table (pretty-printed)
//!
//! Every format but TSV goes through an Arrow record batch.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use arrow::csv::WriterBuilder as CsvWriterBuilder;
use arrow::json::LineDelimitedWriter;
use arrow::record_batch::RecordBatch;
use arrow::util::pretty::pretty_format_batches;

use crate::aggregate::AggregateResult;
use crate::error::{ApproxError, Result};

/// Output format for query results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    /// Tab-separated `key value` lines (default)
    #[default]
    Tsv,
    /// Comma-separated values with a header
    Csv,
    /// JSON Lines (newline-delimited JSON)
    Json,
    /// Pretty-printed table
    Table,
}

impl OutputFormat {
    /// Parse output format from string.
    pub fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "tsv" | "text" => Ok(Self::Tsv),
            "csv" => Ok(Self::Csv),
            "json" | "jsonl" | "ndjson" => Ok(Self::Json),
            "table" => Ok(Self::Table),
            _ => Err(ApproxError::invalid_argument(format!(
                "Unknown output format: '{}'. Valid formats: tsv, csv, json, table",
                s
            ))),
        }
    }
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        OutputFormat::from_str(s).map_err(|e| e.to_string())
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tsv => write!(f, "tsv"),
            Self::Csv => write!(f, "csv"),
            Self::Json => write!(f, "json"),
            Self::Table => write!(f, "table"),
        }
    }
}

/// Output writer for query results.
pub struct OutputWriter {
    format: OutputFormat,
    output: OutputTarget,
}

enum OutputTarget {
    Stdout,
    File(PathBuf),
}

impl OutputWriter {
    /// Create a new output writer to stdout.
    pub fn stdout(format: OutputFormat) -> Self {
        Self {
            format,
            output: OutputTarget::Stdout,
        }
    }

    /// Create a new output writer to a file.
    ///
    /// Nothing is created until [`OutputWriter::write_result`] is called.
    pub fn file(format: OutputFormat, path: impl AsRef<Path>) -> Self {
        Self {
            format,
            output: OutputTarget::File(path.as_ref().to_path_buf()),
        }
    }

    /// Write a result.
    ///
    /// File output is written to a sibling temporary file and renamed into
    /// place, so the destination either holds the complete result or is left
    /// untouched.
    pub fn write_result(&mut self, result: &AggregateResult) -> Result<()> {
        let content = format_result(result, self.format)?;
        match &self.output {
            OutputTarget::Stdout => {
                let stdout = io::stdout();
                let mut lock = stdout.lock();
                lock.write_all(content.as_bytes())?;
                lock.flush()?;
            }
            OutputTarget::File(path) => {
                let staging = staging_path(path);
                if let Err(e) = fs::write(&staging, content.as_bytes()) {
                    let _ = fs::remove_file(&staging);
                    return Err(e.into());
                }
                if let Err(e) = fs::rename(&staging, path) {
                    let _ = fs::remove_file(&staging);
                    return Err(e.into());
                }
            }
        }
        Ok(())
    }
}

fn staging_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_string());
    path.with_file_name(format!(".{}.tmp", name))
}

/// Render a sum the way the TSV output shows it: integral values keep one
/// decimal place (`60.0`).
pub fn format_value(value: f64) -> String {
    if value.is_finite() && value.fract() == 0.0 {
        format!("{:.1}", value)
    } else {
        format!("{}", value)
    }
}

/// Format a result as a string in the specified format.
pub fn format_result(result: &AggregateResult, format: OutputFormat) -> Result<String> {
    match format {
        OutputFormat::Tsv => {
            let mut out = String::new();
            for (key, value) in result.iter() {
                out.push_str(key);
                out.push('\t');
                out.push_str(&format_value(value));
                out.push('\n');
            }
            Ok(out)
        }
        _ => {
            let batch = result.to_record_batch()?;
            format_batches(&[batch], format)
        }
    }
}

/// Format record batches as a string in one of the Arrow-backed formats.
pub fn format_batches(batches: &[RecordBatch], format: OutputFormat) -> Result<String> {
    if batches.is_empty() {
        return Ok(String::new());
    }

    match format {
        OutputFormat::Table => {
            let output = pretty_format_batches(batches)?;
            Ok(format!("{}\n", output))
        }
        OutputFormat::Csv => {
            let mut buf = Vec::new();
            {
                let mut writer = CsvWriterBuilder::new().with_header(true).build(&mut buf);
                for batch in batches {
                    writer.write(batch)?;
                }
            }
            String::from_utf8(buf).map_err(|e| ApproxError::internal(e.to_string()))
        }
        OutputFormat::Json => {
            let mut buf = Vec::new();
            {
                let mut writer = LineDelimitedWriter::new(&mut buf);
                for batch in batches {
                    writer.write(batch)?;
                }
                writer.finish()?;
            }
            String::from_utf8(buf).map_err(|e| ApproxError::internal(e.to_string()))
        }
        OutputFormat::Tsv => Err(ApproxError::invalid_argument(
            "TSV output is written from an aggregate result, not record batches",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn result() -> AggregateResult {
        vec![("B".to_string(), 5.0), ("A".to_string(), 60.0)]
            .into_iter()
            .collect()
    }

    #[test]
    fn test_format_parsing() {
        assert_eq!(OutputFormat::from_str("tsv").unwrap(), OutputFormat::Tsv);
        assert_eq!(OutputFormat::from_str("CSV").unwrap(), OutputFormat::Csv);
        assert_eq!(OutputFormat::from_str("ndjson").unwrap(), OutputFormat::Json);
        assert_eq!(OutputFormat::from_str("table").unwrap(), OutputFormat::Table);
        assert!(OutputFormat::from_str("parquet").is_err());
        assert_eq!(OutputFormat::default().to_string(), "tsv");
    }

    #[test]
    fn test_format_value() {
        assert_eq!(format_value(60.0), "60.0");
        assert_eq!(format_value(0.0), "0.0");
        assert_eq!(format_value(-3.0), "-3.0");
        assert_eq!(format_value(2.5), "2.5");
        assert_eq!(format_value(1e16), "10000000000000000.0");
        assert_eq!(format_value(-2.5e17), "-250000000000000000.0");
    }

    #[test]
    fn test_format_tsv() {
        let output = format_result(&result(), OutputFormat::Tsv).unwrap();
        assert_eq!(output, "A\t60.0\nB\t5.0\n");
        assert_eq!(
            format_result(&AggregateResult::default(), OutputFormat::Tsv).unwrap(),
            ""
        );
    }

    #[test]
    fn test_format_csv() {
        let output = format_result(&result(), OutputFormat::Csv).unwrap();
        assert!(output.starts_with("key,value"));
        assert!(output.contains("A,60"));
    }

    #[test]
    fn test_format_json() {
        let output = format_result(&result(), OutputFormat::Json).unwrap();
        assert_eq!(output.lines().count(), 2);
        assert!(output.contains("\"key\":\"A\""));
    }

    #[test]
    fn test_format_table() {
        let output = format_result(&result(), OutputFormat::Table).unwrap();
        assert!(output.contains("| key"));
        assert!(output.contains("| A"));
    }

    #[test]
    fn test_file_writer_replaces_destination() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out.tsv");
        fs::write(&path, "stale\n").unwrap();

        let mut writer = OutputWriter::file(OutputFormat::Tsv, &path);
        writer.write_result(&result()).unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "A\t60.0\nB\t5.0\n");
        assert!(!staging_path(&path).exists());
    }

    #[test]
    fn test_failed_rename_removes_staging_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out");
        fs::create_dir(&path).unwrap();
        fs::write(path.join("keep"), "x").unwrap();

        let mut writer = OutputWriter::file(OutputFormat::Tsv, &path);
        assert!(writer.write_result(&result()).is_err());

        assert!(!staging_path(&path).exists());
        let names: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from("out")]);
        assert!(path.join("keep").exists());
    }
}
