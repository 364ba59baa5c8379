// rust/dsi-core/src/lib.rs

//! Deterministic sharded index assignment for distributed data loading.
//!
//! Given a dataset of known length, a global batch size and the process
//! layout of a job, this crate gives every (rank, loader worker) pair a
//! disjoint, reproducible slice of dataset indices. The per-epoch order is
//! built once per host, persisted to shared storage as a flat `u32` file and
//! memory-mapped by every process, so ranks agree on the assignment without
//! communicating it.
//!
//! The pieces, leaves first:
//!
//! - [`index`]: order generation, persistence and read-only views;
//! - [`partition`]: lazy slicing by rank and worker;
//! - [`epoch`]: epoch tracking and the regeneration handshake;
//! - [`dataset`] and [`sampler`]: iteration over samples;
//! - [`loader`]: multi-threaded device batch loading.

pub mod config;
pub mod dataset;
pub mod epoch;
pub mod error;
pub mod index;
pub mod loader;
pub mod partition;
pub mod sampler;

// Re-export commonly used types for convenience
pub use config::{DistributedEnv, SamplerConfig};
pub use error::{Result, SamplerError};

pub use dataset::{ConcatDataset, Dataset, OutOfRange, SampleIter};
pub use epoch::{Barrier, EpochController, FileBarrier, SingleProcess, ThreadBarrier};
pub use index::{generate, GlobalIndices, IndexManifest, IndexPlan, IndexStore, IndexView};
pub use loader::{Batch, BatchInterleaver, LoaderError, WorkerPoolLoader};
pub use partition::{partition, PartitionIter, PartitionSpec, WorkerInfo};
pub use sampler::DistributedSampler;
