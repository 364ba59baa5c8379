// rust/dsi-core/src/partition.rs

//! Slicing of the global index order by rank and loader worker.
//!
//! A partition is never materialized. [`PartitionIter`] maps its own
//! position to a position in the global array with a few integer operations,
//! so every rank and worker can share one memory-mapped [`IndexView`].
//!
//! The slicing happens in three steps:
//!
//! 1. skip the first `start_index` entries (resumption);
//! 2. take every `world_size`-th entry starting at `rank`;
//! 3. with loader workers, split the rank-local sequence into device batches,
//!    hand batch `b` to worker `b % num_workers`, then stripe the leftover
//!    entries that do not fill a batch across workers one by one.

use std::iter::FusedIterator;

use crate::error::{Result, SamplerError};
use crate::index::IndexView;

/// Identity of one intra-process loader worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkerInfo {
    pub id: usize,
    pub num_workers: usize,
}

impl WorkerInfo {
    pub fn new(id: usize, num_workers: usize) -> Self {
        Self { id, num_workers }
    }
}

/// Which slice of the global order one consumer reads.
///
/// `device_batch_size` sets the granularity of the worker split. Workers
/// receive whole device batches as long as the rank-local sequence is
/// reshaped with the same batch size the loader batches with; a mismatched
/// value still yields a disjoint, complete split, only not batch-aligned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionSpec {
    pub rank: usize,
    pub world_size: usize,
    /// `None` when the process iterates without loader workers.
    pub worker: Option<WorkerInfo>,
    pub device_batch_size: usize,
    /// Number of global entries already consumed; a multiple of the global
    /// batch size.
    pub start_index: usize,
}

impl PartitionSpec {
    pub fn global_batch_size(&self) -> usize {
        self.device_batch_size * self.world_size
    }

    /// Checks that the spec describes a valid slice.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for a zero world size, batch size or
    /// worker count, an out-of-range rank or worker id, or a `start_index`
    /// that is not a multiple of the global batch size.
    pub fn validate(&self) -> Result<()> {
        if self.world_size == 0 {
            return Err(SamplerError::config("world_size must be greater than 0"));
        }
        if self.rank >= self.world_size {
            return Err(SamplerError::config(format!(
                "rank {} is out of range for world_size {}",
                self.rank, self.world_size
            )));
        }
        if self.device_batch_size == 0 {
            return Err(SamplerError::config(
                "device_batch_size must be greater than 0",
            ));
        }
        if let Some(worker) = self.worker {
            if worker.num_workers == 0 {
                return Err(SamplerError::config("num_workers must be greater than 0"));
            }
            if worker.id >= worker.num_workers {
                return Err(SamplerError::config(format!(
                    "worker id {} is out of range for {} workers",
                    worker.id, worker.num_workers
                )));
            }
        }
        let global_batch_size = self.global_batch_size();
        if self.start_index % global_batch_size != 0 {
            return Err(SamplerError::config(format!(
                "start_index {} is not a multiple of the global batch size {}",
                self.start_index, global_batch_size
            )));
        }
        Ok(())
    }
}

/// Returns the lazy sequence of indices `spec` selects from `view`.
///
/// A `start_index` at or past the end of the view yields an empty sequence.
///
/// # Errors
///
/// Returns a configuration error if `spec` is invalid (see
/// [`PartitionSpec::validate`]).
pub fn partition(view: &IndexView, spec: &PartitionSpec) -> Result<PartitionIter> {
    spec.validate()?;

    let available = view.len().saturating_sub(spec.start_index);
    let rank_len = strided_len(available, spec.rank, spec.world_size);

    let (layout, len) = match spec.worker {
        None => (Layout::Rank, rank_len),
        Some(worker) => {
            let batch = spec.device_batch_size;
            let truncated = (rank_len / batch) * batch;
            let batched_len = strided_len(rank_len / batch, worker.id, worker.num_workers) * batch;
            let tail_len = strided_len(rank_len - truncated, worker.id, worker.num_workers);
            let layout = Layout::Worker {
                id: worker.id,
                num_workers: worker.num_workers,
                batch,
                truncated,
                batched_len,
            };
            (layout, batched_len + tail_len)
        }
    };

    tracing::debug!(
        rank = spec.rank,
        worker = ?spec.worker,
        start_index = spec.start_index,
        len,
        "created partition"
    );

    Ok(PartitionIter {
        view: view.clone(),
        base: spec.start_index + spec.rank,
        stride: spec.world_size,
        layout,
        len,
        position: 0,
    })
}

/// Number of elements in `[offset, len)` taken with step `step`.
fn strided_len(len: usize, offset: usize, step: usize) -> usize {
    if len > offset {
        (len - offset).div_ceil(step)
    } else {
        0
    }
}

#[derive(Debug, Clone, Copy)]
enum Layout {
    Rank,
    Worker {
        id: usize,
        num_workers: usize,
        batch: usize,
        truncated: usize,
        batched_len: usize,
    },
}

impl Layout {
    /// Maps a position in the partition to a position in the rank-local
    /// sequence.
    #[inline]
    fn rank_local(&self, k: usize) -> usize {
        match *self {
            Layout::Rank => k,
            Layout::Worker {
                id,
                num_workers,
                batch,
                truncated,
                batched_len,
            } => {
                if k < batched_len {
                    (id + (k / batch) * num_workers) * batch + k % batch
                } else {
                    truncated + id + (k - batched_len) * num_workers
                }
            }
        }
    }
}

/// Lazy, restartable sequence of the dataset indices in one partition.
///
/// Cloning is cheap and yields an independent cursor over the same data.
#[derive(Debug, Clone)]
pub struct PartitionIter {
    view: IndexView,
    base: usize,
    stride: usize,
    layout: Layout,
    len: usize,
    position: usize,
}

impl PartitionIter {
    /// Returns the `k`-th index of the partition regardless of the cursor.
    pub fn get(&self, k: usize) -> Option<u32> {
        if k >= self.len {
            return None;
        }
        let global = self.base + self.layout.rank_local(k) * self.stride;
        let index = self.view.get(global);
        debug_assert!(index.is_some(), "partition position {global} outside view");
        index
    }

    /// Number of indices already yielded.
    pub fn position(&self) -> usize {
        self.position
    }

    /// Total number of indices in the partition.
    pub fn total_len(&self) -> usize {
        self.len
    }

    /// Rewinds to the first index.
    pub fn reset(&mut self) {
        self.position = 0;
    }
}

impl Iterator for PartitionIter {
    type Item = u32;

    fn next(&mut self) -> Option<u32> {
        let index = self.get(self.position)?;
        self.position += 1;
        Some(index)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.len - self.position;
        (remaining, Some(remaining))
    }

    fn nth(&mut self, n: usize) -> Option<u32> {
        self.position = self.position.saturating_add(n).min(self.len);
        self.next()
    }
}

impl ExactSizeIterator for PartitionIter {}

impl FusedIterator for PartitionIter {}
