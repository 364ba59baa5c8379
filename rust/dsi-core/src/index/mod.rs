// rust/dsi-core/src/index/mod.rs

//! Global index generation and persistence.
//!
//! The generator produces the per-epoch order; the store writes it once per
//! host as a flat little-endian `u32` file and hands every reader a
//! memory-mapped [`IndexView`] of it.
//!
//! # Example
//!
//! ```no_run
//! use dsi_core::index::{generate, IndexPlan, IndexStore};
//!
//! let plan = IndexPlan {
//!     length: 1000,
//!     world_size: 8,
//!     seed: 9176,
//!     shuffle: true,
//!     drop_last: false,
//! };
//! let indices = generate(&plan, 0)?;
//!
//! let store = IndexStore::new("/shared/run/global_indices.bin");
//! let manifest = store.persist(&indices)?;
//! let view = store.load_verified(&manifest)?;
//! assert_eq!(view.len(), plan.total_size());
//! # Ok::<(), dsi_core::SamplerError>(())
//! ```

use std::hash::Hasher;

use twox_hash::XxHash64;

mod generator;
mod store;
mod view;

pub use generator::{generate, GlobalIndices, IndexPlan};
pub use store::{IndexManifest, IndexStore, MANIFEST_SUFFIX};
pub use view::{IndexView, INDEX_WIDTH};

/// Number of indices encoded per hasher write.
const CHECKSUM_CHUNK: usize = 16 * 1024;

/// XxHash64 (seed 0) of raw index-file bytes.
pub(crate) fn checksum_bytes(bytes: &[u8]) -> u64 {
    let mut hasher = XxHash64::with_seed(0);
    hasher.write(bytes);
    hasher.finish()
}

/// XxHash64 (seed 0) of the little-endian encoding of `indices`, equal to
/// [`checksum_bytes`] over the persisted file.
pub(crate) fn checksum_indices(indices: &[u32]) -> u64 {
    let mut hasher = XxHash64::with_seed(0);
    let mut buf = Vec::with_capacity(CHECKSUM_CHUNK * INDEX_WIDTH);
    for chunk in indices.chunks(CHECKSUM_CHUNK) {
        buf.clear();
        for index in chunk {
            buf.extend_from_slice(&index.to_le_bytes());
        }
        hasher.write(&buf);
    }
    hasher.finish()
}
