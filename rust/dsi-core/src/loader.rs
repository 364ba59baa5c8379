// rust/dsi-core/src/loader.rs

//! Multi-threaded loading of device batches for one rank.
//!
//! Each loader worker owns one worker partition of the rank's indices,
//! groups its samples into device batches and queues them on a bounded
//! channel. The consumer takes batches from the workers in turn, skipping
//! workers that have run dry, which is the order a multi-worker data loader
//! delivers them in. Because workers receive whole batches in round-robin
//! order, the delivered batches follow the rank-local order whenever the
//! rank's sample count is a multiple of the device batch size.

use std::fmt;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Receiver, Sender};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::LoaderConfig;
use crate::dataset::{Dataset, SampleIter};
use crate::error::Result;
use crate::partition::WorkerInfo;
use crate::sampler::DistributedSampler;

/// A device batch produced by one loader worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch<R> {
    pub worker_id: usize,
    /// Position of the batch within its worker's output.
    pub batch_index: usize,
    pub records: Vec<R>,
}

#[derive(Debug, Error)]
pub enum LoaderError<E> {
    /// The dataset failed to return a sample; the worker stops afterwards.
    #[error("sample lookup failed: {0}")]
    Access(#[source] E),

    #[error("loader worker {worker_id} panicked")]
    Worker { worker_id: usize },
}

type LoaderItem<R, E> = std::result::Result<Batch<R>, LoaderError<E>>;

/// Iterator over the device batches of one rank.
pub struct WorkerPoolLoader<D: Dataset> {
    mode: Mode<D>,
}

enum Mode<D: Dataset> {
    Inline(BatchReader<D>),
    Workers(WorkerPool<D::Record, D::Error>),
}

impl<D> WorkerPoolLoader<D>
where
    D: Dataset + 'static,
    D::Record: Send + 'static,
    D::Error: Send + 'static,
{
    /// Starts `num_workers` loader threads for the sampler's current epoch,
    /// each allowed to queue `prefetch_batches` batches. With zero workers
    /// batches are loaded lazily in the calling thread.
    ///
    /// # Errors
    ///
    /// Returns an error if the sampler has no order for its epoch.
    pub fn spawn(
        sampler: &DistributedSampler<D>,
        num_workers: usize,
        prefetch_batches: usize,
    ) -> Result<Self> {
        let batch_size = sampler.device_batch_size();

        if num_workers == 0 {
            let reader = BatchReader::new(0, sampler.iter(None)?, batch_size);
            return Ok(Self {
                mode: Mode::Inline(reader),
            });
        }

        // Build every partition up front so errors surface here, not in a thread.
        let readers = (0..num_workers)
            .map(|id| {
                let samples = sampler.iter(Some(WorkerInfo::new(id, num_workers)))?;
                Ok(BatchReader::new(id, samples, batch_size))
            })
            .collect::<Result<Vec<_>>>()?;

        let mut receivers = Vec::with_capacity(num_workers);
        let mut handles = Vec::with_capacity(num_workers);
        for reader in readers {
            let (tx, rx) = channel::bounded(prefetch_batches.max(1));
            receivers.push(rx);
            handles.push(Some(thread::spawn(move || run_worker(reader, tx))));
        }

        debug!(
            num_workers,
            prefetch_batches,
            batch_size,
            epoch = sampler.epoch(),
            "started loader workers"
        );

        Ok(Self {
            mode: Mode::Workers(WorkerPool {
                exhausted: vec![false; num_workers],
                live: num_workers,
                next_worker: 0,
                receivers,
                handles,
            }),
        })
    }

    /// Starts a loader with the `[loader]` config section.
    pub fn from_config(sampler: &DistributedSampler<D>, config: &LoaderConfig) -> Result<Self> {
        Self::spawn(sampler, config.num_workers, config.prefetch_batches)
    }
}

impl<D: Dataset> WorkerPoolLoader<D> {
    pub fn num_workers(&self) -> usize {
        match &self.mode {
            Mode::Inline(_) => 0,
            Mode::Workers(pool) => pool.receivers.len(),
        }
    }
}

impl<D: Dataset> Iterator for WorkerPoolLoader<D> {
    type Item = LoaderItem<D::Record, D::Error>;

    fn next(&mut self) -> Option<Self::Item> {
        match &mut self.mode {
            Mode::Inline(reader) => reader.next(),
            Mode::Workers(pool) => pool.next(),
        }
    }
}

impl<D: Dataset> fmt::Debug for WorkerPoolLoader<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPoolLoader")
            .field("num_workers", &self.num_workers())
            .finish_non_exhaustive()
    }
}

/// Groups one partition's samples into device batches.
struct BatchReader<D: Dataset> {
    worker_id: usize,
    samples: SampleIter<D>,
    batch_size: usize,
    batch_index: usize,
    failed: bool,
}

impl<D: Dataset> BatchReader<D> {
    fn new(worker_id: usize, samples: SampleIter<D>, batch_size: usize) -> Self {
        Self {
            worker_id,
            samples,
            batch_size,
            batch_index: 0,
            failed: false,
        }
    }
}

impl<D: Dataset> Iterator for BatchReader<D> {
    type Item = LoaderItem<D::Record, D::Error>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }

        let mut records = Vec::with_capacity(self.batch_size.min(self.samples.len()));
        while records.len() < self.batch_size {
            match self.samples.next() {
                Some(Ok(record)) => records.push(record),
                Some(Err(e)) => {
                    self.failed = true;
                    return Some(Err(LoaderError::Access(e)));
                }
                None => break,
            }
        }

        if records.is_empty() {
            return None;
        }
        let batch = Batch {
            worker_id: self.worker_id,
            batch_index: self.batch_index,
            records,
        };
        self.batch_index += 1;
        Some(Ok(batch))
    }
}

fn run_worker<D: Dataset>(reader: BatchReader<D>, tx: Sender<LoaderItem<D::Record, D::Error>>) {
    let worker_id = reader.worker_id;
    for item in reader {
        if tx.send(item).is_err() {
            debug!(worker_id, "loader dropped, stopping worker");
            return;
        }
    }
}

struct WorkerPool<R, E> {
    receivers: Vec<Receiver<LoaderItem<R, E>>>,
    handles: Vec<Option<JoinHandle<()>>>,
    exhausted: Vec<bool>,
    live: usize,
    next_worker: usize,
}

impl<R, E> WorkerPool<R, E> {
    fn next(&mut self) -> Option<LoaderItem<R, E>> {
        let num_workers = self.receivers.len();
        while self.live > 0 {
            let worker_id = self.next_worker;
            self.next_worker = (worker_id + 1) % num_workers;
            if self.exhausted[worker_id] {
                continue;
            }

            match self.receivers[worker_id].recv() {
                Ok(item) => return Some(item),
                Err(_) => {
                    // Sender dropped: the worker finished or panicked.
                    self.exhausted[worker_id] = true;
                    self.live -= 1;
                    let panicked = self.handles[worker_id]
                        .take()
                        .map_or(false, |handle| handle.join().is_err());
                    if panicked {
                        return Some(Err(LoaderError::Worker { worker_id }));
                    }
                }
            }
        }
        None
    }
}

impl<R, E> Drop for WorkerPool<R, E> {
    fn drop(&mut self) {
        // Disconnect first so workers blocked on a full queue return.
        self.receivers.clear();
        for (worker_id, handle) in self.handles.iter_mut().enumerate() {
            if let Some(handle) = handle.take() {
                if handle.join().is_err() {
                    warn!(worker_id, "loader worker panicked");
                }
            }
        }
    }
}

/// Round-robin reassembly of per-worker index sequences into device batches.
///
/// Takes `batch_size` items from each worker in turn, skipping workers that
/// have run dry, mirroring what [`WorkerPoolLoader`] delivers.
#[derive(Debug, Clone)]
pub struct BatchInterleaver<I> {
    workers: Vec<I>,
    exhausted: Vec<bool>,
    live: usize,
    next_worker: usize,
    batch_size: usize,
}

impl<I: Iterator> BatchInterleaver<I> {
    pub fn new(workers: Vec<I>, batch_size: usize) -> Self {
        let live = if batch_size == 0 { 0 } else { workers.len() };
        Self {
            exhausted: vec![false; workers.len()],
            live,
            next_worker: 0,
            batch_size,
            workers,
        }
    }

    /// Flattens the interleaved batches back into one sequence.
    pub fn flatten_batches(self) -> impl Iterator<Item = I::Item> {
        self.flatten()
    }
}

impl<I: Iterator> Iterator for BatchInterleaver<I> {
    type Item = Vec<I::Item>;

    fn next(&mut self) -> Option<Vec<I::Item>> {
        while self.live > 0 {
            let worker_id = self.next_worker;
            self.next_worker = (worker_id + 1) % self.workers.len();
            if self.exhausted[worker_id] {
                continue;
            }

            let batch: Vec<I::Item> = self.workers[worker_id]
                .by_ref()
                .take(self.batch_size)
                .collect();
            if batch.len() < self.batch_size {
                self.exhausted[worker_id] = true;
                self.live -= 1;
            }
            if !batch.is_empty() {
                return Some(batch);
            }
        }
        None
    }
}
