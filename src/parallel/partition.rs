//! Splitting index ranges into contiguous partitions
//!
//! A partition is the unit handed to one worker. Partitions are contiguous,
//! non-overlapping, ordered, and their union is exactly the input range.

use std::fmt;

use crate::error::{ParallelError, Result};

/// Half-open index range `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IndexRange {
    pub start: usize,
    pub end: usize,
}

impl IndexRange {
    /// Create a range, rejecting `start > end`
    pub fn new(start: usize, end: usize) -> Result<Self> {
        if start > end {
            return Err(ParallelError::InvalidArgument(format!(
                "range start {start} is greater than end {end}"
            )));
        }
        Ok(Self { start, end })
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn contains(&self, index: usize) -> bool {
        index >= self.start && index < self.end
    }

    pub fn indices(&self) -> std::ops::Range<usize> {
        self.start..self.end
    }
}

impl From<std::ops::Range<usize>> for IndexRange {
    /// Reversed ranges collapse to an empty range at `start`
    fn from(r: std::ops::Range<usize>) -> Self {
        Self {
            start: r.start,
            end: r.end.max(r.start),
        }
    }
}

impl fmt::Display for IndexRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// Chunk size selection for a partitioning
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkSize {
    /// Aim for `workers * partitions_per_worker` partitions
    Auto {
        workers: usize,
        partitions_per_worker: usize,
    },
    /// Fixed number of indices per partition
    Fixed(usize),
}

/// Produces range partitions. Holds no cursor, so every call to
/// [`Partitioner::partitions`] yields a fresh partitioning.
#[derive(Debug, Clone, Copy)]
pub struct Partitioner {
    chunk: ChunkSize,
}

/// Default number of partitions created per worker
pub const DEFAULT_PARTITIONS_PER_WORKER: usize = 4;

impl Partitioner {
    /// Fixed chunk size; `chunk_size` must be at least 1
    pub fn fixed(chunk_size: usize) -> Result<Self> {
        if chunk_size == 0 {
            return Err(ParallelError::InvalidArgument(
                "chunk size must be at least 1".to_string(),
            ));
        }
        Ok(Self {
            chunk: ChunkSize::Fixed(chunk_size),
        })
    }

    /// Chunk size chosen to produce roughly `workers * 4` partitions
    pub fn auto(workers: usize) -> Self {
        Self::auto_with(workers, DEFAULT_PARTITIONS_PER_WORKER)
    }

    pub fn auto_with(workers: usize, partitions_per_worker: usize) -> Self {
        Self {
            chunk: ChunkSize::Auto {
                workers: workers.max(1),
                partitions_per_worker: partitions_per_worker.max(1),
            },
        }
    }

    /// `chunk_size` when given, otherwise the auto heuristic for `workers`
    pub fn for_options(chunk_size: Option<usize>, workers: usize, partitions_per_worker: usize) -> Result<Self> {
        match chunk_size {
            Some(size) => Self::fixed(size),
            None => Ok(Self::auto_with(workers, partitions_per_worker)),
        }
    }

    /// Chunk size this partitioner would use for a range of `len` indices
    pub fn chunk_size_for(&self, len: usize) -> usize {
        match self.chunk {
            ChunkSize::Fixed(size) => size,
            ChunkSize::Auto {
                workers,
                partitions_per_worker,
            } => {
                let target = workers.saturating_mul(partitions_per_worker).max(1);
                len.div_ceil(target).max(1)
            }
        }
    }

    /// Lazy partitioning of `range`
    pub fn partitions(&self, range: IndexRange) -> RangePartitions {
        RangePartitions {
            next: range.start,
            end: range.end,
            chunk: self.chunk_size_for(range.len()),
        }
    }

    /// Partitions of `[0, len)`, used for slices
    pub fn item_partitions(&self, len: usize) -> RangePartitions {
        self.partitions(IndexRange { start: 0, end: len })
    }
}

/// Convenience: `createRangePartitions(start, end, chunkSize)`
pub fn range_partitions(start: usize, end: usize, chunk_size: usize) -> Result<RangePartitions> {
    let range = IndexRange::new(start, end)?;
    Ok(Partitioner::fixed(chunk_size)?.partitions(range))
}

/// Iterator over the partitions of one range
#[derive(Debug, Clone)]
pub struct RangePartitions {
    next: usize,
    end: usize,
    chunk: usize,
}

impl RangePartitions {
    pub fn chunk_size(&self) -> usize {
        self.chunk
    }
}

impl Iterator for RangePartitions {
    type Item = IndexRange;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.end {
            return None;
        }
        let start = self.next;
        let end = start.saturating_add(self.chunk).min(self.end);
        self.next = end;
        Some(IndexRange { start, end })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = (self.end.saturating_sub(self.next)).div_ceil(self.chunk);
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for RangePartitions {}
