// rust/dsi-core/src/index/generator.rs

//! Deterministic construction of the global index order for one epoch.
//!
//! The order is a pure function of an [`IndexPlan`] and an epoch number. Any
//! process that generates the same `(plan, epoch)` pair gets a bit-identical
//! array, so ranks never have to exchange the order itself.
//!
//! # Shuffle algorithm
//!
//! The permutation is part of the reproducibility contract and is fixed:
//! `rand_chacha::ChaCha8Rng::seed_from_u64(seed.wrapping_add(epoch))` drives
//! `rand::seq::SliceRandom::shuffle` (rand 0.8) over `0..length`. Bumping
//! either crate across a major version changes persisted orders.

use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use super::view::IndexView;
use crate::error::{Result, SamplerError};

/// Inputs that fully determine the global index order of an epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexPlan {
    /// Number of items in the dataset.
    pub length: usize,
    /// Number of ranks the order is split across.
    pub world_size: usize,
    /// Base seed; combined with the epoch to key the shuffle.
    pub seed: u64,
    /// Whether to shuffle, or keep the identity order.
    pub shuffle: bool,
    /// Truncate to a balanced total instead of padding.
    pub drop_last: bool,
}

impl IndexPlan {
    /// Checks that a world-size-aligned order can be produced.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if `world_size` is zero, the dataset is
    /// too large for 32-bit indices, or `drop_last` leaves nothing per rank.
    pub fn validate(&self) -> Result<()> {
        if self.world_size == 0 {
            return Err(SamplerError::config("world_size must be greater than 0"));
        }
        if self.length as u64 > u64::from(u32::MAX) {
            return Err(SamplerError::config(format!(
                "dataset length {} does not fit in 32-bit indices",
                self.length
            )));
        }
        if self.drop_last && self.length < self.world_size {
            return Err(SamplerError::config(format!(
                "cannot drop_last with {} items across {} ranks: no samples left per rank",
                self.length, self.world_size
            )));
        }
        Ok(())
    }

    /// Number of samples each rank receives per epoch.
    pub fn num_samples(&self) -> usize {
        if self.world_size == 0 {
            return 0;
        }
        if self.drop_last && self.length % self.world_size != 0 {
            // Split to the nearest length that every rank can share evenly.
            self.length
                .saturating_sub(self.world_size)
                .div_ceil(self.world_size)
        } else {
            self.length.div_ceil(self.world_size)
        }
    }

    /// Length of the generated array; always a multiple of `world_size`.
    pub fn total_size(&self) -> usize {
        self.num_samples() * self.world_size
    }
}

/// The global index order of one epoch, owned by the generator until it is
/// persisted or turned into a read-only [`IndexView`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalIndices {
    plan: IndexPlan,
    epoch: u64,
    indices: Vec<u32>,
}

impl GlobalIndices {
    pub fn plan(&self) -> &IndexPlan {
        &self.plan
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn as_slice(&self) -> &[u32] {
        &self.indices
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    /// XxHash64 of the persisted byte layout.
    pub fn checksum(&self) -> u64 {
        super::checksum_indices(&self.indices)
    }

    pub fn into_vec(self) -> Vec<u32> {
        self.indices
    }

    /// Converts into a shareable read-only view.
    pub fn into_view(self) -> IndexView {
        IndexView::from_vec(self.indices)
    }
}

/// Builds the global index order for `epoch`.
///
/// Without `drop_last` the order is padded by repeating its own prefix,
/// wrapping around as often as needed; with `drop_last` the tail is cut.
/// The result always holds exactly `plan.total_size()` entries.
///
/// # Errors
///
/// Returns a configuration error if the plan is invalid (see
/// [`IndexPlan::validate`]).
pub fn generate(plan: &IndexPlan, epoch: u64) -> Result<GlobalIndices> {
    plan.validate()?;

    let total_size = plan.total_size();
    let mut indices: Vec<u32> = (0..plan.length as u32).collect();

    if plan.shuffle {
        let mut rng = ChaCha8Rng::seed_from_u64(plan.seed.wrapping_add(epoch));
        indices.shuffle(&mut rng);
    }

    if plan.drop_last {
        indices.truncate(total_size);
    } else {
        let mut padding = total_size - indices.len();
        while padding > 0 {
            let take = padding.min(plan.length);
            indices.extend_from_within(..take);
            padding -= take;
        }
    }

    debug_assert_eq!(indices.len(), total_size);
    tracing::debug!(
        epoch,
        length = plan.length,
        total_size,
        shuffle = plan.shuffle,
        "generated global indices"
    );

    Ok(GlobalIndices {
        plan: *plan,
        epoch,
        indices,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn plan(length: usize, world_size: usize, shuffle: bool, drop_last: bool) -> IndexPlan {
        IndexPlan {
            length,
            world_size,
            seed: 42,
            shuffle,
            drop_last,
        }
    }

    #[test]
    fn test_total_size_padded() {
        for length in 1..50 {
            for world_size in 1..9 {
                let p = plan(length, world_size, true, false);
                let expected = length.div_ceil(world_size) * world_size;
                assert_eq!(p.total_size(), expected, "length={length} world={world_size}");

                let indices = generate(&p, 0).unwrap();
                assert_eq!(indices.len(), expected);

                // Every original index is present at least once.
                let seen: HashSet<u32> = indices.as_slice().iter().copied().collect();
                assert_eq!(seen.len(), length);
                assert!(indices.as_slice().iter().all(|&i| (i as usize) < length));
            }
        }
    }

    #[test]
    fn test_total_size_drop_last() {
        for world_size in 1..9 {
            for length in world_size..60 {
                let p = plan(length, world_size, true, true);
                let total = p.total_size();
                assert_eq!(total % world_size, 0);
                assert!(total <= length);
                // Never drops more than one full round of ranks.
                assert!(length - total < 2 * world_size);

                let indices = generate(&p, 1).unwrap();
                let distinct: HashSet<u32> = indices.as_slice().iter().copied().collect();
                assert_eq!(distinct.len(), indices.len(), "duplicates with drop_last");
            }
        }
    }

    #[test]
    fn test_drop_last_identity_scenario() {
        let p = plan(17, 4, false, true);
        assert_eq!(p.num_samples(), 4);
        assert_eq!(p.total_size(), 16);

        let indices = generate(&p, 0).unwrap();
        assert_eq!(indices.into_vec(), (0..16).collect::<Vec<u32>>());
    }

    #[test]
    fn test_drop_last_evenly_divisible_keeps_everything() {
        let p = plan(16, 4, false, true);
        assert_eq!(p.total_size(), 16);
    }

    #[test]
    fn test_identity_padding_wraps() {
        // 3 items across 8 ranks: prefix repeated twice, then a partial prefix.
        let p = plan(3, 8, false, false);
        let indices = generate(&p, 0).unwrap();
        assert_eq!(indices.into_vec(), vec![0, 1, 2, 0, 1, 2, 0, 1]);
    }

    #[test]
    fn test_padding_repeats_shuffled_prefix() {
        let p = plan(10, 4, true, false);
        let indices = generate(&p, 5).unwrap().into_vec();
        assert_eq!(indices.len(), 12);
        assert_eq!(&indices[10..], &indices[..2]);
    }

    #[test]
    fn test_deterministic() {
        let p = IndexPlan {
            length: 100,
            world_size: 1,
            seed: 42,
            shuffle: true,
            drop_last: false,
        };
        let a = generate(&p, 3).unwrap();
        let b = generate(&p, 3).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.checksum(), b.checksum());
    }

    #[test]
    fn test_epoch_changes_order() {
        let p = plan(100, 1, true, false);
        let a = generate(&p, 0).unwrap().into_vec();
        let b = generate(&p, 1).unwrap().into_vec();
        assert_ne!(a, b);

        let mut sorted = b.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, (0..100).collect::<Vec<u32>>());
    }

    #[test]
    fn test_seed_plus_epoch_keys_the_shuffle() {
        let a = IndexPlan { seed: 10, ..plan(64, 2, true, false) };
        let b = IndexPlan { seed: 7, ..plan(64, 2, true, false) };
        assert_eq!(generate(&a, 0).unwrap().into_vec(), generate(&b, 3).unwrap().into_vec());
    }

    #[test]
    fn test_shuffle_false_is_identity() {
        let p = plan(12, 3, false, false);
        assert_eq!(generate(&p, 9).unwrap().into_vec(), (0..12).collect::<Vec<u32>>());
    }

    #[test]
    fn test_empty_dataset_without_drop_last() {
        let p = plan(0, 4, true, false);
        assert_eq!(p.total_size(), 0);
        assert!(generate(&p, 0).unwrap().is_empty());
    }

    #[test]
    fn test_drop_last_fewer_items_than_ranks() {
        let p = plan(3, 4, false, true);
        let err = generate(&p, 0).unwrap_err();
        assert!(err.is_config());
    }

    #[test]
    #[cfg(target_pointer_width = "64")]
    fn test_length_beyond_u32_indices() {
        let p = plan(u32::MAX as usize + 1, 4, true, false);
        let err = p.validate().unwrap_err();
        assert!(err.is_config());
        assert!(err.to_string().contains("32-bit"));
        assert!(generate(&p, 0).unwrap_err().is_config());

        assert!(plan(u32::MAX as usize, 4, true, false).validate().is_ok());
    }

    #[test]
    fn test_zero_world_size() {
        let p = plan(10, 0, false, false);
        assert!(generate(&p, 0).unwrap_err().is_config());
    }
}
