// rust/dsi-core/src/dataset/mod.rs

//! Dataset access for partitioned iteration.
//!
//! Any type implementing [`Dataset`] can be iterated: in-memory vectors and
//! slices work out of the box, and [`ConcatDataset`] stitches several shard
//! datasets into one index space.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use dsi_core::dataset::{ConcatDataset, Dataset, SampleIter};
//! use dsi_core::index::IndexView;
//! use dsi_core::partition::{partition, PartitionSpec};
//!
//! let shards = ConcatDataset::new(vec![vec![10, 11, 12], vec![20, 21, 22]]);
//! assert_eq!(shards.len(), 6);
//!
//! let view = IndexView::from_vec(vec![3, 0, 5, 1, 4, 2]);
//! let spec = PartitionSpec {
//!     rank: 0,
//!     world_size: 2,
//!     worker: None,
//!     device_batch_size: 1,
//!     start_index: 0,
//! };
//! let samples: Vec<i32> = SampleIter::new(Arc::new(shards), partition(&view, &spec)?)
//!     .collect::<Result<_, _>>()?;
//! assert_eq!(samples, vec![20, 22, 21]);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

mod concat;
mod iterator;
mod traits;

pub use concat::ConcatDataset;
pub use iterator::SampleIter;
pub use traits::{Dataset, OutOfRange};
