// rust/dsi-core/src/config.rs

//! Configuration for distributed sampling.
//!
//! Settings come from a TOML file, can be overridden with `DSI_`-prefixed
//! environment variables, and are validated before use. The process layout
//! (world size, rank, local rank) may be left out of the file and resolved
//! from the `WORLD_SIZE`, `RANK` and `LOCAL_RANK` variables set by the
//! launcher.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use tracing::warn;

use crate::error::{Result, SamplerError};

/// Default shuffle seed.
pub const DEFAULT_SEED: u64 = 9176;

// Top-level sampler configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerConfig {
    pub sampling: SamplingConfig,
    pub distributed: DistributedConfig,
    pub index: IndexConfig,
    pub loader: LoaderConfig,
}

/// How the global order is built and where iteration starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingConfig {
    /// Samples per optimizer step across all ranks.
    pub global_batch_size: usize,
    pub seed: u64,
    /// Epoch to start in.
    pub epoch: u64,
    /// Global samples already consumed in `epoch`; a multiple of
    /// `global_batch_size`.
    pub start_index: usize,
    pub shuffle: bool,
    pub drop_last: bool,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            global_batch_size: 1,
            seed: DEFAULT_SEED,
            epoch: 0,
            start_index: 0,
            shuffle: true,
            drop_last: false,
        }
    }
}

/// Process layout. Unset values are taken from the launcher environment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DistributedConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub world_size: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rank: Option<usize>,
    /// Rank within the host; local rank 0 writes the index file.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_rank: Option<usize>,
}

/// Resolved process layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DistributedEnv {
    pub world_size: usize,
    pub rank: usize,
    pub local_rank: usize,
}

impl DistributedEnv {
    pub fn single_process() -> Self {
        Self {
            world_size: 1,
            rank: 0,
            local_rank: 0,
        }
    }

    /// Returns true for the process that persists the index on its host.
    pub fn is_local_leader(&self) -> bool {
        self.local_rank == 0
    }
}

impl DistributedConfig {
    /// Fills unset values from `WORLD_SIZE`, `RANK` and `LOCAL_RANK`,
    /// defaulting to a single-process run.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if a variable is not a number, the
    /// world size is zero, or the rank is out of range.
    pub fn resolve(&self) -> Result<DistributedEnv> {
        let world_size = resolve_field(self.world_size, "WORLD_SIZE", 1)?;
        let rank = resolve_field(self.rank, "RANK", 0)?;
        let local_rank = resolve_field(self.local_rank, "LOCAL_RANK", 0)?;

        if world_size == 0 {
            return Err(SamplerError::config(
                "distributed.world_size must be greater than 0",
            ));
        }
        if rank >= world_size {
            return Err(SamplerError::config(format!(
                "distributed.rank {rank} is out of range for world_size {world_size}"
            )));
        }

        Ok(DistributedEnv {
            world_size,
            rank,
            local_rank,
        })
    }
}

fn resolve_field(value: Option<usize>, var: &str, default: usize) -> Result<usize> {
    if let Some(value) = value {
        return Ok(value);
    }
    match std::env::var(var) {
        Ok(raw) => raw.trim().parse().map_err(|e| {
            SamplerError::config_with_source(format!("invalid {var} value '{raw}'"), e)
        }),
        Err(_) => Ok(default),
    }
}

/// Where the global order is persisted and how it is read back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    /// Shared index file; without one every process keeps the order in
    /// memory.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index_file: Option<PathBuf>,
    pub use_mmap: bool,
    pub verify_checksum: bool,
    pub barrier_poll_interval_ms: u64,
    pub barrier_timeout_ms: u64,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            index_file: None,
            use_mmap: true,
            verify_checksum: true,
            barrier_poll_interval_ms: 50,
            barrier_timeout_ms: 600_000, // 10 minutes
        }
    }
}

/// Intra-process loader workers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    /// Loader threads per rank; 0 loads in the calling thread.
    pub num_workers: usize,
    /// Device batches each worker may queue ahead.
    pub prefetch_batches: usize,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            num_workers: 0,
            prefetch_batches: 2,
        }
    }
}

impl FromStr for SamplerConfig {
    type Err = SamplerError;

    /// Parse configuration from a TOML string.
    fn from_str(s: &str) -> Result<Self> {
        toml::from_str(s)
            .map_err(|e| SamplerError::config_with_source("failed to parse TOML config", e))
    }
}

/// Parses `DSI_*` override values, logging and skipping invalid ones.
fn env_override<T: FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(key, value = %raw, "ignoring invalid environment override");
            None
        }
    }
}

impl SamplerConfig {
    // Load configuration from a TOML file.
    //
    // # Errors
    //
    // Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            SamplerError::storage_with_source(path, "failed to read config file", e)
        })?;
        let config: Self = content.parse()?;
        config.validate()?;
        Ok(config)
    }

    // Apply environment variable overrides.
    //
    // Variables are prefixed with `DSI_` followed by the section and field,
    // for example `DSI_SAMPLING_SEED` or `DSI_INDEX_INDEX_FILE`.
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(v) = env_override("DSI_SAMPLING_GLOBAL_BATCH_SIZE") {
            self.sampling.global_batch_size = v;
        }
        if let Some(v) = env_override("DSI_SAMPLING_SEED") {
            self.sampling.seed = v;
        }
        if let Some(v) = env_override("DSI_SAMPLING_EPOCH") {
            self.sampling.epoch = v;
        }
        if let Some(v) = env_override("DSI_SAMPLING_START_INDEX") {
            self.sampling.start_index = v;
        }
        if let Some(v) = env_override("DSI_SAMPLING_SHUFFLE") {
            self.sampling.shuffle = v;
        }
        if let Some(v) = env_override("DSI_SAMPLING_DROP_LAST") {
            self.sampling.drop_last = v;
        }

        if let Some(v) = env_override("DSI_DISTRIBUTED_WORLD_SIZE") {
            self.distributed.world_size = Some(v);
        }
        if let Some(v) = env_override("DSI_DISTRIBUTED_RANK") {
            self.distributed.rank = Some(v);
        }
        if let Some(v) = env_override("DSI_DISTRIBUTED_LOCAL_RANK") {
            self.distributed.local_rank = Some(v);
        }

        if let Ok(val) = std::env::var("DSI_INDEX_INDEX_FILE") {
            self.index.index_file = if val.is_empty() {
                None
            } else {
                Some(PathBuf::from(val))
            };
        }
        if let Some(v) = env_override("DSI_INDEX_USE_MMAP") {
            self.index.use_mmap = v;
        }
        if let Some(v) = env_override("DSI_INDEX_VERIFY_CHECKSUM") {
            self.index.verify_checksum = v;
        }
        if let Some(v) = env_override("DSI_INDEX_BARRIER_POLL_INTERVAL_MS") {
            self.index.barrier_poll_interval_ms = v;
        }
        if let Some(v) = env_override("DSI_INDEX_BARRIER_TIMEOUT_MS") {
            self.index.barrier_timeout_ms = v;
        }

        if let Some(v) = env_override("DSI_LOADER_NUM_WORKERS") {
            self.loader.num_workers = v;
        }
        if let Some(v) = env_override("DSI_LOADER_PREFETCH_BATCHES") {
            self.loader.prefetch_batches = v;
        }

        self
    }

    // Validate all configuration values.
    //
    // # Errors
    //
    // Returns an error if any configuration value is invalid or the process
    // layout cannot be resolved.
    pub fn validate(&self) -> Result<()> {
        let global_batch_size = self.sampling.global_batch_size;
        if global_batch_size == 0 {
            return Err(SamplerError::config(
                "sampling.global_batch_size must be greater than 0",
            ));
        }

        let env = self.distributed.resolve()?;
        if global_batch_size % env.world_size != 0 {
            return Err(SamplerError::config(format!(
                "sampling.global_batch_size {global_batch_size} is not divisible by world_size {}",
                env.world_size
            )));
        }

        if self.sampling.start_index % global_batch_size != 0 {
            return Err(SamplerError::config(format!(
                "sampling.start_index {} is not a multiple of global_batch_size {global_batch_size}",
                self.sampling.start_index
            )));
        }

        if self.index.barrier_poll_interval_ms == 0 {
            return Err(SamplerError::config(
                "index.barrier_poll_interval_ms must be greater than 0",
            ));
        }
        if self.index.barrier_timeout_ms == 0 {
            return Err(SamplerError::config(
                "index.barrier_timeout_ms must be greater than 0",
            ));
        }

        if self.loader.num_workers > 0 && self.loader.prefetch_batches == 0 {
            return Err(SamplerError::config(
                "loader.prefetch_batches must be greater than 0 when num_workers > 0",
            ));
        }

        Ok(())
    }

    /// Samples per rank per optimizer step.
    ///
    /// # Errors
    ///
    /// Returns an error if the process layout cannot be resolved.
    pub fn device_batch_size(&self) -> Result<usize> {
        let env = self.distributed.resolve()?;
        Ok(self.sampling.global_batch_size / env.world_size)
    }
}
