// rust/dsi-core/src/sampler.rs

//! Per-process entry point tying configuration, epochs and partitions
//! together.

use std::fmt;
use std::sync::Arc;

use tracing::info;

use crate::config::{DistributedEnv, SamplerConfig};
use crate::dataset::{Dataset, SampleIter};
use crate::epoch::{Barrier, EpochController, FileBarrier, SingleProcess};
use crate::error::{Result, SamplerError};
use crate::index::{IndexPlan, IndexStore, IndexView};
use crate::partition::{partition, PartitionIter, PartitionSpec, WorkerInfo};

/// Deterministic distributed sampling over a dataset for one rank.
///
/// Construction builds (or, on followers, waits for and loads) the order of
/// the configured epoch. Call [`reshuffle`](Self::reshuffle) before each new
/// epoch on every process of the job.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use dsi_core::{DistributedSampler, SamplerConfig, SingleProcess};
///
/// let mut config = SamplerConfig::default();
/// config.sampling.global_batch_size = 4;
/// config.distributed.world_size = Some(2);
/// config.distributed.rank = Some(1);
/// config.distributed.local_rank = Some(1);
///
/// let dataset = Arc::new((0..10u32).collect::<Vec<_>>());
/// let mut sampler = DistributedSampler::new(dataset, &config, Arc::new(SingleProcess))?;
/// assert_eq!(sampler.len(), 5);
///
/// sampler.reshuffle(1)?;
/// let samples: Vec<u32> = sampler.iter(None)?.collect::<Result<_, _>>()?;
/// assert_eq!(samples.len(), 5);
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
pub struct DistributedSampler<D: Dataset> {
    dataset: Arc<D>,
    env: DistributedEnv,
    device_batch_size: usize,
    controller: EpochController,
}

impl<D: Dataset> DistributedSampler<D> {
    /// Creates a sampler that synchronizes through `barrier`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if `config` is invalid for this dataset,
    /// or any error from building the first epoch.
    pub fn new(
        dataset: Arc<D>,
        config: &SamplerConfig,
        barrier: Arc<dyn Barrier>,
    ) -> Result<Self> {
        config.validate()?;
        let env = config.distributed.resolve()?;
        let plan = Self::plan_for(dataset.len(), config, &env);
        let device_batch_size = config.sampling.global_batch_size / env.world_size;

        let controller = EpochController::new(
            plan,
            config.sampling.epoch,
            config.sampling.start_index,
            IndexStore::from_config(&config.index),
            env.is_local_leader(),
            barrier,
        )?;

        let mut sampler = Self {
            dataset,
            env,
            device_batch_size,
            controller,
        };
        sampler.reshuffle(config.sampling.epoch)?;

        info!(
            rank = env.rank,
            world_size = env.world_size,
            length = plan.length,
            total_size = plan.total_size(),
            device_batch_size,
            "distributed sampler ready"
        );
        Ok(sampler)
    }

    /// Creates a sampler whose barrier follows the config: processes poll
    /// the shared manifest when an index file is configured, and build the
    /// order independently otherwise.
    pub fn from_config(dataset: Arc<D>, config: &SamplerConfig) -> Result<Self> {
        let env = config.distributed.resolve()?;
        let plan = Self::plan_for(dataset.len(), config, &env);
        let barrier: Arc<dyn Barrier> = match FileBarrier::from_config(&config.index) {
            Some(barrier) => Arc::new(barrier.expecting(plan)),
            None => Arc::new(SingleProcess),
        };
        Self::new(dataset, config, barrier)
    }

    fn plan_for(length: usize, config: &SamplerConfig, env: &DistributedEnv) -> IndexPlan {
        IndexPlan {
            length,
            world_size: env.world_size,
            seed: config.sampling.seed,
            shuffle: config.sampling.shuffle,
            drop_last: config.sampling.drop_last,
        }
    }

    /// Switches to the order of `epoch`; see [`EpochController::reshuffle`].
    pub fn reshuffle(&mut self, epoch: u64) -> Result<()> {
        self.controller.reshuffle(epoch)
    }

    /// Resumes the current epoch after `start_index` global samples.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if `start_index` is not a multiple of
    /// the global batch size.
    pub fn set_start_index(&mut self, start_index: usize) -> Result<()> {
        let global_batch_size = self.global_batch_size();
        if start_index % global_batch_size != 0 {
            return Err(SamplerError::config(format!(
                "start_index {start_index} is not a multiple of the global batch size {global_batch_size}"
            )));
        }
        self.controller.set_start_index(start_index);
        Ok(())
    }

    pub fn epoch(&self) -> u64 {
        self.controller.epoch()
    }

    pub fn start_index(&self) -> usize {
        self.controller.start_index()
    }

    pub fn rank(&self) -> usize {
        self.env.rank
    }

    pub fn world_size(&self) -> usize {
        self.env.world_size
    }

    pub fn env(&self) -> &DistributedEnv {
        &self.env
    }

    pub fn device_batch_size(&self) -> usize {
        self.device_batch_size
    }

    pub fn global_batch_size(&self) -> usize {
        self.device_batch_size * self.env.world_size
    }

    /// Length of the global order, padded or truncated to the world size.
    pub fn total_size(&self) -> usize {
        self.controller.plan().total_size()
    }

    /// Samples this rank yields in the current epoch after the resume
    /// offset.
    pub fn len(&self) -> usize {
        self.total_size().saturating_sub(self.start_index()) / self.env.world_size
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dataset(&self) -> &Arc<D> {
        &self.dataset
    }

    /// The order of the current epoch.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the last `reshuffle` failed.
    pub fn global_indices(&self) -> Result<&IndexView> {
        self.controller.current().ok_or_else(|| {
            SamplerError::config(format!(
                "no index order for epoch {}; reshuffle failed",
                self.controller.epoch()
            ))
        })
    }

    /// The slice read by this rank, or by one of its loader workers.
    pub fn partition_spec(&self, worker: Option<WorkerInfo>) -> PartitionSpec {
        PartitionSpec {
            rank: self.env.rank,
            world_size: self.env.world_size,
            worker,
            device_batch_size: self.device_batch_size,
            start_index: self.start_index(),
        }
    }

    /// Dataset indices of this rank's (or worker's) partition.
    pub fn indices(&self, worker: Option<WorkerInfo>) -> Result<PartitionIter> {
        partition(self.global_indices()?, &self.partition_spec(worker))
    }

    /// Samples of this rank's (or worker's) partition.
    pub fn iter(&self, worker: Option<WorkerInfo>) -> Result<SampleIter<D>> {
        Ok(SampleIter::new(Arc::clone(&self.dataset), self.indices(worker)?))
    }
}

impl<D: Dataset> fmt::Debug for DistributedSampler<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DistributedSampler")
            .field("dataset_len", &self.dataset.len())
            .field("env", &self.env)
            .field("device_batch_size", &self.device_batch_size)
            .field("controller", &self.controller)
            .finish_non_exhaustive()
    }
}
