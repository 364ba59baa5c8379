// rust/dsi-core/src/index/view.rs

//! Read-only access to a global index array, in memory or memory-mapped.

use std::fmt;
use std::sync::Arc;

use memmap2::Mmap;

/// Size of one persisted index in bytes.
pub const INDEX_WIDTH: usize = std::mem::size_of::<u32>();

/// A cheaply clonable, read-only view of a global index array.
///
/// Views created by the store share one memory mapping between every clone,
/// so partitions for all loader workers of a process read the same pages.
#[derive(Clone)]
pub struct IndexView {
    inner: ViewInner,
}

#[derive(Clone)]
enum ViewInner {
    Owned(Arc<[u32]>),
    Mapped(Arc<Mmap>),
}

impl IndexView {
    /// Wraps an in-memory array.
    pub fn from_vec(indices: Vec<u32>) -> Self {
        Self {
            inner: ViewInner::Owned(indices.into()),
        }
    }

    /// Wraps a mapping of little-endian `u32` values.
    ///
    /// The caller has already checked that the mapping length is a multiple
    /// of [`INDEX_WIDTH`].
    pub(crate) fn from_mmap(mmap: Mmap) -> Self {
        debug_assert_eq!(mmap.len() % INDEX_WIDTH, 0);
        Self {
            inner: ViewInner::Mapped(Arc::new(mmap)),
        }
    }

    /// Number of indices in the view.
    pub fn len(&self) -> usize {
        match &self.inner {
            ViewInner::Owned(indices) => indices.len(),
            ViewInner::Mapped(mmap) => mmap.len() / INDEX_WIDTH,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns true if the view is backed by a memory-mapped file.
    pub fn is_mapped(&self) -> bool {
        matches!(self.inner, ViewInner::Mapped(_))
    }

    /// Returns the index stored at `position`, or `None` past the end.
    #[inline]
    pub fn get(&self, position: usize) -> Option<u32> {
        match &self.inner {
            ViewInner::Owned(indices) => indices.get(position).copied(),
            ViewInner::Mapped(mmap) => {
                let start = position.checked_mul(INDEX_WIDTH)?;
                let end = start.checked_add(INDEX_WIDTH)?;
                let bytes = mmap.get(start..end)?;
                let mut raw = [0u8; INDEX_WIDTH];
                raw.copy_from_slice(bytes);
                Some(u32::from_le_bytes(raw))
            }
        }
    }

    /// Iterates over all indices in order.
    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        (0..self.len()).filter_map(move |position| self.get(position))
    }

    /// Copies the view into an owned vector.
    pub fn to_vec(&self) -> Vec<u32> {
        match &self.inner {
            ViewInner::Owned(indices) => indices.to_vec(),
            ViewInner::Mapped(_) => self.iter().collect(),
        }
    }

    /// XxHash64 of the persisted byte layout of this view.
    pub fn checksum(&self) -> u64 {
        match &self.inner {
            ViewInner::Owned(indices) => super::checksum_indices(indices),
            ViewInner::Mapped(mmap) => super::checksum_bytes(&mmap[..]),
        }
    }
}

impl fmt::Debug for IndexView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IndexView")
            .field("len", &self.len())
            .field("mapped", &self.is_mapped())
            .finish()
    }
}

impl From<Vec<u32>> for IndexView {
    fn from(indices: Vec<u32>) -> Self {
        Self::from_vec(indices)
    }
}
