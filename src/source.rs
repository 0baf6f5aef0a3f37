//! Input sources and partitioning.
//!
//! A source exposes a fixed, ordered list of partitions. Partition ids are
//! assigned once, when the source is opened, so the pilot and final passes of
//! a run address the same physical data under the same id.
//!
//! [`FileSource`] cuts each input file into byte-range splits aligned on line
//! boundaries: a split starting at offset `s > 0` skips through the first
//! newline at or after `s - 1`, and yields every line whose first byte lies
//! before the split end. Every line therefore belongs to exactly one split.

use std::fmt;
use std::fs::File;
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{ApproxError, Result};

/// Opaque identifier of one input partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PartitionId(u32);

impl PartitionId {
    /// Create a partition id.
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    /// Numeric value of the id.
    pub fn as_u32(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "p{:05}", self.0)
    }
}

/// Sequential reader over the raw lines of one partition.
pub trait RecordReader {
    /// Read the next line into `buf`, without its line terminator.
    ///
    /// Returns `false` once the partition is exhausted.
    fn next_record(&mut self, buf: &mut Vec<u8>) -> Result<bool>;

    /// Estimated number of records left, counting the one last returned.
    fn remaining_hint(&self) -> f64;
}

/// A partitioned collection of line records.
pub trait PartitionSource: Send + Sync + fmt::Debug {
    /// Human-readable location, used in logs and plan fingerprints.
    fn location(&self) -> String;

    /// All partitions, in a stable order.
    fn partitions(&self) -> Result<Vec<PartitionId>>;

    /// Open a reader over one partition. May be called more than once per
    /// partition (task retries); each reader starts from the beginning.
    fn open(&self, partition: PartitionId) -> Result<Box<dyn RecordReader + '_>>;
}

/// A contiguous byte range of one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSplit {
    /// File the split belongs to
    pub path: PathBuf,
    /// First byte offset (inclusive)
    pub start: u64,
    /// Last byte offset (exclusive)
    pub end: u64,
}

impl FileSplit {
    /// Length of the split in bytes.
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    /// Whether the split covers no bytes.
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// Line-delimited files on local disk, cut into byte-range splits.
#[derive(Debug, Clone)]
pub struct FileSource {
    location: PathBuf,
    splits: Vec<FileSplit>,
}

impl FileSource {
    /// The last split of a file may exceed the split size by this factor
    /// instead of leaving a small trailing split.
    const SPLIT_SLOP: f64 = 1.1;

    /// Open a file, or every visible file of a directory, and compute splits.
    pub fn open(location: impl AsRef<Path>, split_size: u64) -> Result<Self> {
        let location = location.as_ref().to_path_buf();
        if split_size == 0 {
            return Err(ApproxError::invalid_argument("split size must be > 0"));
        }

        let files = list_input_files(&location)?;
        let mut splits = Vec::new();
        for path in files {
            let len = std::fs::metadata(&path)?.len();
            splits.extend(compute_splits(&path, len, split_size));
        }

        if splits.len() > u32::MAX as usize {
            return Err(ApproxError::invalid_argument(format!(
                "input produces {} partitions; increase the split size",
                splits.len()
            )));
        }

        debug!(
            location = %location.display(),
            partitions = splits.len(),
            split_size,
            "opened file source"
        );

        Ok(Self { location, splits })
    }

    /// The splits backing each partition, in partition order.
    pub fn splits(&self) -> &[FileSplit] {
        &self.splits
    }

    fn split(&self, partition: PartitionId) -> Result<&FileSplit> {
        self.splits.get(partition.as_u32() as usize).ok_or_else(|| {
            ApproxError::internal(format!("unknown partition {}", partition))
        })
    }
}

impl PartitionSource for FileSource {
    fn location(&self) -> String {
        self.location.display().to_string()
    }

    fn partitions(&self) -> Result<Vec<PartitionId>> {
        Ok((0..self.splits.len() as u32).map(PartitionId::new).collect())
    }

    fn open(&self, partition: PartitionId) -> Result<Box<dyn RecordReader + '_>> {
        let split = self.split(partition)?;
        Ok(Box::new(SplitReader::open(split)?))
    }
}

/// Input files under `location`: the file itself, or the visible regular
/// files of a directory (names not starting with `.` or `_`), sorted.
fn list_input_files(location: &Path) -> Result<Vec<PathBuf>> {
    let metadata = std::fs::metadata(location).map_err(|e| {
        ApproxError::invalid_argument(format!(
            "cannot access input {}: {}",
            location.display(),
            e
        ))
    })?;

    if metadata.is_file() {
        return Ok(vec![location.to_path_buf()]);
    }

    let mut files = Vec::new();
    for entry in std::fs::read_dir(location)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with('.') || name.starts_with('_') {
            continue;
        }
        if entry.file_type()?.is_file() {
            files.push(entry.path());
        }
    }
    files.sort();
    Ok(files)
}

fn compute_splits(path: &Path, len: u64, split_size: u64) -> Vec<FileSplit> {
    let mut splits = Vec::new();
    let mut start = 0u64;
    let mut remaining = len;

    while remaining as f64 / split_size as f64 > FileSource::SPLIT_SLOP {
        splits.push(FileSplit {
            path: path.to_path_buf(),
            start,
            end: start + split_size,
        });
        start += split_size;
        remaining -= split_size;
    }

    if remaining > 0 {
        splits.push(FileSplit {
            path: path.to_path_buf(),
            start,
            end: len,
        });
    }

    splits
}

/// Reader over the lines of one [`FileSplit`].
pub struct SplitReader {
    reader: BufReader<File>,
    /// Offset of the next unread byte
    pos: u64,
    end: u64,
    bytes_read: u64,
    records_read: u64,
}

impl SplitReader {
    /// Open a split, positioned at its first owned line.
    pub fn open(split: &FileSplit) -> Result<Self> {
        let mut file = File::open(&split.path)?;
        let mut pos = split.start;

        if split.start > 0 {
            file.seek(SeekFrom::Start(split.start - 1))?;
        }
        let mut reader = BufReader::new(file);

        if split.start > 0 {
            // The tail of a line owned by the previous split
            let mut skipped = Vec::new();
            let n = reader.read_until(b'\n', &mut skipped)?;
            pos = split.start - 1 + n as u64;
        }

        Ok(Self {
            reader,
            pos,
            end: split.end,
            bytes_read: 0,
            records_read: 0,
        })
    }
}

impl RecordReader for SplitReader {
    fn next_record(&mut self, buf: &mut Vec<u8>) -> Result<bool> {
        if self.pos >= self.end {
            return Ok(false);
        }

        buf.clear();
        let n = self.reader.read_until(b'\n', buf)?;
        if n == 0 {
            return Ok(false);
        }

        self.pos += n as u64;
        self.bytes_read += n as u64;
        self.records_read += 1;
        trim_line_end(buf);
        Ok(true)
    }

    fn remaining_hint(&self) -> f64 {
        if self.records_read == 0 {
            return 1.0;
        }
        let mean_len = self.bytes_read as f64 / self.records_read as f64;
        let bytes_left = self.end.saturating_sub(self.pos) as f64;
        1.0 + bytes_left / mean_len.max(1.0)
    }
}

fn trim_line_end(buf: &mut Vec<u8>) {
    if buf.last() == Some(&b'\n') {
        buf.pop();
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }
    }
}

/// In-memory partitions of text lines.
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    name: String,
    partitions: Vec<Vec<String>>,
}

impl MemorySource {
    /// Create a source with explicit partitions.
    pub fn new(name: impl Into<String>, partitions: Vec<Vec<String>>) -> Self {
        Self {
            name: name.into(),
            partitions,
        }
    }

    /// Cut `lines` into partitions of at most `per_partition` lines.
    pub fn from_lines<I, S>(name: impl Into<String>, lines: I, per_partition: usize) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let per_partition = per_partition.max(1);
        let mut partitions: Vec<Vec<String>> = Vec::new();
        for line in lines {
            match partitions.last_mut() {
                Some(last) if last.len() < per_partition => last.push(line.into()),
                _ => partitions.push(vec![line.into()]),
            }
        }
        Self::new(name, partitions)
    }

    /// Number of lines in one partition.
    pub fn partition_len(&self, partition: PartitionId) -> Option<usize> {
        self.partitions
            .get(partition.as_u32() as usize)
            .map(|p| p.len())
    }
}

impl PartitionSource for MemorySource {
    fn location(&self) -> String {
        format!("memory://{}", self.name)
    }

    fn partitions(&self) -> Result<Vec<PartitionId>> {
        Ok((0..self.partitions.len() as u32)
            .map(PartitionId::new)
            .collect())
    }

    fn open(&self, partition: PartitionId) -> Result<Box<dyn RecordReader + '_>> {
        let lines = self
            .partitions
            .get(partition.as_u32() as usize)
            .ok_or_else(|| ApproxError::internal(format!("unknown partition {}", partition)))?;
        Ok(Box::new(MemoryReader { lines, next: 0 }))
    }
}

struct MemoryReader<'a> {
    lines: &'a [String],
    next: usize,
}

impl RecordReader for MemoryReader<'_> {
    fn next_record(&mut self, buf: &mut Vec<u8>) -> Result<bool> {
        let Some(line) = self.lines.get(self.next) else {
            return Ok(false);
        };
        buf.clear();
        buf.extend_from_slice(line.as_bytes());
        self.next += 1;
        Ok(true)
    }

    fn remaining_hint(&self) -> f64 {
        // `next` already points past the record last returned
        (self.lines.len() - self.next + 1) as f64
    }
}
