// rust/dsi-core/src/dataset/concat.rs

//! A dataset spanning several shard datasets.

use super::traits::{Dataset, OutOfRange};

/// Concatenation of shard datasets addressed by one global sample index.
///
/// Sample `i` lives in the first shard whose cumulative sample count exceeds
/// `i`; lookups are a binary search over those counts.
#[derive(Debug, Clone)]
pub struct ConcatDataset<D> {
    shards: Vec<D>,
    /// `cumulative[s]` is the number of samples in shards `0..=s`.
    cumulative: Vec<usize>,
}

impl<D: Dataset> ConcatDataset<D> {
    /// Creates a dataset over `shards`, in order. Empty shards are allowed.
    pub fn new(shards: Vec<D>) -> Self {
        let cumulative = shards
            .iter()
            .scan(0usize, |total, shard| {
                *total += shard.len();
                Some(*total)
            })
            .collect();
        Self { shards, cumulative }
    }

    /// Maps a global sample index to `(shard, index within shard)`.
    pub fn locate(&self, index: usize) -> Option<(usize, usize)> {
        if index >= self.total_len() {
            return None;
        }
        let shard = self.cumulative.partition_point(|&end| end <= index);
        let shard_start = match shard {
            0 => 0,
            s => self.cumulative[s - 1],
        };
        Some((shard, index - shard_start))
    }

    pub fn shards(&self) -> &[D] {
        &self.shards
    }

    pub fn num_shards(&self) -> usize {
        self.shards.len()
    }

    /// Cumulative sample counts, one entry per shard.
    pub fn cumulative_sizes(&self) -> &[usize] {
        &self.cumulative
    }

    fn total_len(&self) -> usize {
        self.cumulative.last().copied().unwrap_or(0)
    }
}

impl<D> Dataset for ConcatDataset<D>
where
    D: Dataset,
    D::Error: From<OutOfRange>,
{
    type Record = D::Record;
    type Error = D::Error;

    fn len(&self) -> usize {
        self.total_len()
    }

    fn get(&self, index: usize) -> Result<D::Record, D::Error> {
        match self.locate(index) {
            Some((shard, local)) => self.shards[shard].get(local),
            None => Err(OutOfRange {
                index,
                len: self.total_len(),
            }
            .into()),
        }
    }
}
