// rust/dsi-core/src/dataset/iterator.rs

//! Iteration over the samples of one partition.

use std::fmt;
use std::iter::FusedIterator;
use std::sync::Arc;

use super::traits::Dataset;
use crate::partition::PartitionIter;

/// Yields `dataset.get(index)` for every index of a partition, in order.
///
/// Each consumer owns its iterator. Cloning gives an independent cursor, and
/// [`reset`](Self::reset) restarts the pass from the first sample. Dataset
/// errors are yielded as-is and do not end iteration.
pub struct SampleIter<D: Dataset> {
    dataset: Arc<D>,
    indices: PartitionIter,
}

impl<D: Dataset> SampleIter<D> {
    pub fn new(dataset: Arc<D>, indices: PartitionIter) -> Self {
        Self { dataset, indices }
    }

    /// Fetches the next sample along with its dataset index.
    pub fn next_indexed(&mut self) -> Option<(u32, Result<D::Record, D::Error>)> {
        let index = self.indices.next()?;
        Some((index, self.dataset.get(index as usize)))
    }

    /// Restarts from the first sample of the partition.
    pub fn reset(&mut self) {
        self.indices.reset();
    }

    /// Number of samples already yielded.
    pub fn position(&self) -> usize {
        self.indices.position()
    }

    /// The underlying index sequence.
    pub fn indices(&self) -> &PartitionIter {
        &self.indices
    }

    pub fn dataset(&self) -> &Arc<D> {
        &self.dataset
    }
}

impl<D: Dataset> Clone for SampleIter<D> {
    fn clone(&self) -> Self {
        Self {
            dataset: Arc::clone(&self.dataset),
            indices: self.indices.clone(),
        }
    }
}

impl<D: Dataset> fmt::Debug for SampleIter<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SampleIter")
            .field("dataset_len", &self.dataset.len())
            .field("indices", &self.indices)
            .finish()
    }
}

impl<D: Dataset> Iterator for SampleIter<D> {
    type Item = Result<D::Record, D::Error>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_indexed().map(|(_, sample)| sample)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.indices.size_hint()
    }

    fn nth(&mut self, n: usize) -> Option<Self::Item> {
        let index = self.indices.nth(n)?;
        Some(self.dataset.get(index as usize))
    }
}

impl<D: Dataset> ExactSizeIterator for SampleIter<D> {}

impl<D: Dataset> FusedIterator for SampleIter<D> {}
