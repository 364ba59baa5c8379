// rust/dsi-core/src/epoch.rs

//! Epoch tracking and the cross-process handshake around index regeneration.
//!
//! On every [`EpochController::reshuffle`] the local leader generates and
//! persists the new order, then all processes meet at a [`Barrier`] before
//! anyone reads it. Followers never generate; they load the leader's file.

use std::fmt;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::config::IndexConfig;
use crate::error::{Result, SamplerError};
use crate::index::{generate, IndexPlan, IndexStore, IndexView};

/// Synchronization point reached by every process after the leader has
/// persisted the order for `epoch`.
pub trait Barrier: Send + Sync {
    /// Blocks until the order for `epoch` may be read.
    fn wait(&self, epoch: u64) -> Result<()>;
}

/// Barrier for a single process; never blocks.
#[derive(Debug, Clone, Copy, Default)]
pub struct SingleProcess;

impl Barrier for SingleProcess {
    fn wait(&self, _epoch: u64) -> Result<()> {
        Ok(())
    }
}

/// Barrier for ranks that run as threads of one process.
#[derive(Debug, Clone)]
pub struct ThreadBarrier {
    inner: Arc<std::sync::Barrier>,
}

impl ThreadBarrier {
    /// Creates a barrier shared by `parties` threads. Every party needs its
    /// own clone.
    pub fn new(parties: usize) -> Self {
        Self {
            inner: Arc::new(std::sync::Barrier::new(parties)),
        }
    }
}

impl Barrier for ThreadBarrier {
    fn wait(&self, epoch: u64) -> Result<()> {
        let result = self.inner.wait();
        if result.is_leader() {
            debug!(epoch, "all threads reached the epoch barrier");
        }
        Ok(())
    }
}

/// Barrier that polls the shared manifest until it reports the requested
/// epoch.
///
/// Processes that never see the manifest, for example because only some of
/// them called `reshuffle`, fail with [`SamplerError::Barrier`] once the
/// timeout expires.
#[derive(Debug, Clone)]
pub struct FileBarrier {
    store: IndexStore,
    plan: Option<IndexPlan>,
    poll_interval: Duration,
    timeout: Duration,
}

impl FileBarrier {
    pub fn new(store: IndexStore, poll_interval: Duration, timeout: Duration) -> Self {
        Self {
            store,
            plan: None,
            poll_interval,
            timeout,
        }
    }

    /// Builds a barrier from the `[index]` config section, or `None` when no
    /// index file is configured.
    pub fn from_config(config: &IndexConfig) -> Option<Self> {
        IndexStore::from_config(config).map(|store| {
            Self::new(
                store,
                Duration::from_millis(config.barrier_poll_interval_ms),
                Duration::from_millis(config.barrier_timeout_ms),
            )
        })
    }

    /// Also require the manifest to describe `plan`, so a stale file from an
    /// earlier run with the same epoch is not accepted.
    pub fn expecting(mut self, plan: IndexPlan) -> Self {
        self.plan = Some(plan);
        self
    }

    fn is_ready(&self, epoch: u64) -> Result<bool> {
        let ready = match self.store.read_manifest()? {
            Some(manifest) => match &self.plan {
                Some(plan) => manifest.matches(plan, epoch),
                None => manifest.epoch == epoch,
            },
            None => false,
        };
        Ok(ready)
    }
}

impl Barrier for FileBarrier {
    fn wait(&self, epoch: u64) -> Result<()> {
        let started = Instant::now();
        loop {
            if self.is_ready(epoch)? {
                debug!(epoch, waited = ?started.elapsed(), "index manifest ready");
                return Ok(());
            }
            if started.elapsed() >= self.timeout {
                return Err(SamplerError::barrier(format!(
                    "timed out after {:?} waiting for '{}' to report epoch {epoch}",
                    self.timeout,
                    self.store.manifest_path().display()
                )));
            }
            thread::sleep(self.poll_interval);
        }
    }
}

/// Owns the current epoch, the resumption offset and the index order of the
/// epoch.
pub struct EpochController {
    plan: IndexPlan,
    epoch: u64,
    start_index: usize,
    store: Option<IndexStore>,
    leader: bool,
    barrier: Arc<dyn Barrier>,
    current: Option<IndexView>,
}

impl EpochController {
    /// Creates a controller positioned at `epoch` and `start_index`. No
    /// order exists until the first [`reshuffle`](Self::reshuffle).
    ///
    /// `leader` marks the process that generates and persists the order.
    /// Without a store every process generates its own copy in memory.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if `plan` is invalid.
    pub fn new(
        plan: IndexPlan,
        epoch: u64,
        start_index: usize,
        store: Option<IndexStore>,
        leader: bool,
        barrier: Arc<dyn Barrier>,
    ) -> Result<Self> {
        plan.validate()?;
        Ok(Self {
            plan,
            epoch,
            start_index,
            store,
            leader,
            barrier,
            current: None,
        })
    }

    /// Makes the order of `epoch` current.
    ///
    /// Moving to a different epoch resets the resumption offset to 0;
    /// reshuffling the current epoch again keeps it. Every process of the
    /// job has to call this with the same epoch.
    ///
    /// # Errors
    ///
    /// Returns a storage error if persisting or loading the order fails, or
    /// a synchronization error from the barrier.
    pub fn reshuffle(&mut self, epoch: u64) -> Result<()> {
        if epoch != self.epoch {
            self.start_index = 0;
        }
        self.epoch = epoch;
        self.current = None;

        let view = match &self.store {
            None => {
                let indices = generate(&self.plan, epoch)?;
                self.barrier.wait(epoch)?;
                indices.into_view()
            }
            Some(store) if self.leader => {
                let indices = generate(&self.plan, epoch)?;
                let manifest = store.persist(&indices)?;
                self.barrier.wait(epoch)?;
                store.load_verified(&manifest)?
            }
            Some(store) => {
                self.barrier.wait(epoch)?;
                store.load_for(&self.plan, epoch)?
            }
        };

        info!(
            epoch,
            start_index = self.start_index,
            total_size = view.len(),
            leader = self.leader,
            "reshuffled global indices"
        );
        self.current = Some(view);
        Ok(())
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn start_index(&self) -> usize {
        self.start_index
    }

    /// Sets the number of global entries already consumed in this epoch.
    pub fn set_start_index(&mut self, start_index: usize) {
        self.start_index = start_index;
    }

    pub fn plan(&self) -> &IndexPlan {
        &self.plan
    }

    pub fn is_leader(&self) -> bool {
        self.leader
    }

    pub fn store(&self) -> Option<&IndexStore> {
        self.store.as_ref()
    }

    /// The order of the current epoch, once `reshuffle` has succeeded.
    pub fn current(&self) -> Option<&IndexView> {
        self.current.as_ref()
    }
}

impl fmt::Debug for EpochController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EpochController")
            .field("plan", &self.plan)
            .field("epoch", &self.epoch)
            .field("start_index", &self.start_index)
            .field("store", &self.store)
            .field("leader", &self.leader)
            .field("current", &self.current)
            .finish_non_exhaustive()
    }
}
