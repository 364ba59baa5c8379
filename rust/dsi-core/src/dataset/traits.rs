// rust/dsi-core/src/dataset/traits.rs

use std::sync::Arc;

use thiserror::Error;

/// Random access to a dataset of known length.
///
/// `len` must stay constant for the duration of an epoch. Lookup failures are
/// reported with the dataset's own error type and passed through unchanged
/// by the iterators in this crate.
pub trait Dataset: Send + Sync {
    type Record;
    type Error;

    /// Number of samples.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fetches the sample at `index`.
    fn get(&self, index: usize) -> Result<Self::Record, Self::Error>;
}

/// Lookup past the end of a dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("index {index} out of range for dataset of length {len}")]
pub struct OutOfRange {
    pub index: usize,
    pub len: usize,
}

impl<T: Clone + Send + Sync> Dataset for [T] {
    type Record = T;
    type Error = OutOfRange;

    fn len(&self) -> usize {
        <[T]>::len(self)
    }

    fn get(&self, index: usize) -> Result<T, OutOfRange> {
        <[T]>::get(self, index).cloned().ok_or(OutOfRange {
            index,
            len: <[T]>::len(self),
        })
    }
}

impl<T: Clone + Send + Sync> Dataset for Vec<T> {
    type Record = T;
    type Error = OutOfRange;

    fn len(&self) -> usize {
        self.as_slice().len()
    }

    fn get(&self, index: usize) -> Result<T, OutOfRange> {
        Dataset::get(self.as_slice(), index)
    }
}

impl<D: Dataset + ?Sized> Dataset for &D {
    type Record = D::Record;
    type Error = D::Error;

    fn len(&self) -> usize {
        (**self).len()
    }

    fn get(&self, index: usize) -> Result<D::Record, D::Error> {
        (**self).get(index)
    }
}

impl<D: Dataset + ?Sized> Dataset for Arc<D> {
    type Record = D::Record;
    type Error = D::Error;

    fn len(&self) -> usize {
        (**self).len()
    }

    fn get(&self, index: usize) -> Result<D::Record, D::Error> {
        (**self).get(index)
    }
}

impl<D: Dataset + ?Sized> Dataset for Box<D> {
    type Record = D::Record;
    type Error = D::Error;

    fn len(&self) -> usize {
        (**self).len()
    }

    fn get(&self, index: usize) -> Result<D::Record, D::Error> {
        (**self).get(index)
    }
}
