//! Process-group coordination for multi-device training
//!
//! One process per accelerator runs an identical copy of the orchestrator.
//! This module provides the explicit [`ClusterContext`] those copies share:
//! rank, world size, the epoch barrier, and the compute device. Gradient
//! all-reduce itself belongs to the parallelism wrapper and is opaque here.

use std::sync::Arc;
use std::time::Duration;

use candle_core::Device;
use parking_lot::{Condvar, Mutex};
use tracing::info;

use crate::config::RunConfig;
use crate::error::{Error, Result};

/// Barrier every process must reach at the start of each epoch
pub trait EpochBarrier: Send + Sync {
    /// Block until all peers arrive or the timeout elapses.
    ///
    /// A timeout means a peer crashed; the caller must abort the run.
    fn wait(&self, timeout: Duration) -> Result<()>;
}

/// Barrier for single-process runs: every wait trivially succeeds
pub struct LocalBarrier;

impl EpochBarrier for LocalBarrier {
    fn wait(&self, _timeout: Duration) -> Result<()> {
        Ok(())
    }
}

/// Rendezvous barrier for multiple orchestrator threads in one process.
///
/// Multi-process backends (NCCL-style process groups) plug in behind the same
/// trait; the orchestrator only ever sees [`EpochBarrier`].
pub struct ThreadBarrier {
    parties: usize,
    state: Mutex<BarrierState>,
    condvar: Condvar,
}

struct BarrierState {
    arrived: usize,
    generation: u64,
}

impl ThreadBarrier {
    /// Create a barrier for `parties` cooperating threads
    pub fn new(parties: usize) -> Self {
        Self {
            parties,
            state: Mutex::new(BarrierState {
                arrived: 0,
                generation: 0,
            }),
            condvar: Condvar::new(),
        }
    }
}

impl EpochBarrier for ThreadBarrier {
    fn wait(&self, timeout: Duration) -> Result<()> {
        let mut state = self.state.lock();
        let generation = state.generation;
        state.arrived += 1;

        if state.arrived == self.parties {
            state.arrived = 0;
            state.generation += 1;
            self.condvar.notify_all();
            return Ok(());
        }

        while state.generation == generation {
            if self
                .condvar
                .wait_for(&mut state, timeout)
                .timed_out()
            {
                return Err(Error::distributed_sync(format!(
                    "epoch barrier timed out after {timeout:?} with {}/{} processes",
                    state.arrived, self.parties
                )));
            }
        }
        Ok(())
    }
}

/// How model replicas are kept in sync across devices
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parallelism {
    /// One process, one device
    Single,
    /// One process splitting batches over local devices
    DataParallel,
    /// One process per device with gradient all-reduce
    Distributed,
}

impl Parallelism {
    /// Select the wrapper for a run configuration
    pub fn select(config: &RunConfig) -> Self {
        if config.dataparallel {
            Self::DataParallel
        } else if config.world_size > 1 {
            Self::Distributed
        } else {
            Self::Single
        }
    }
}

/// Explicit cluster handle threaded through every component that synchronizes
#[derive(Clone)]
pub struct ClusterContext {
    /// This process's rank, 0-based
    pub rank: usize,
    /// Total cooperating processes
    pub world_size: usize,
    /// Parallelism wrapper installed around the model
    pub parallelism: Parallelism,
    /// Compute device for this process
    pub device: Device,
    barrier: Arc<dyn EpochBarrier>,
    barrier_timeout: Duration,
}

impl std::fmt::Debug for ClusterContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterContext")
            .field("rank", &self.rank)
            .field("world_size", &self.world_size)
            .field("parallelism", &self.parallelism)
            .field("device", &self.device)
            .field("barrier_timeout", &self.barrier_timeout)
            .finish_non_exhaustive()
    }
}

impl ClusterContext {
    /// Build the context for a run. Rank 0 is the master.
    pub fn new(config: &RunConfig, rank: usize, device: Device) -> Result<Self> {
        if rank >= config.world_size {
            return Err(Error::config(format!(
                "rank {rank} out of range for world size {}",
                config.world_size
            )));
        }
        let barrier: Arc<dyn EpochBarrier> = if config.world_size > 1 {
            Arc::new(ThreadBarrier::new(config.world_size))
        } else {
            Arc::new(LocalBarrier)
        };
        let parallelism = Parallelism::select(config);
        info!(
            rank,
            world_size = config.world_size,
            ?parallelism,
            "cluster context initialized"
        );
        Ok(Self {
            rank,
            world_size: config.world_size,
            parallelism,
            device,
            barrier,
            barrier_timeout: Duration::from_secs(config.barrier_timeout_secs),
        })
    }

    /// Single-process context on the given device, mostly for tests and tools
    pub fn single(device: Device) -> Self {
        Self {
            rank: 0,
            world_size: 1,
            parallelism: Parallelism::Single,
            device,
            barrier: Arc::new(LocalBarrier),
            barrier_timeout: Duration::from_secs(60),
        }
    }

    /// Install a shared barrier (all ranks of a run must hold the same one)
    pub fn with_barrier(mut self, barrier: Arc<dyn EpochBarrier>) -> Self {
        self.barrier = barrier;
        self
    }

    /// Whether this process performs logging and checkpoint writes
    pub fn is_master(&self) -> bool {
        self.rank == 0
    }

    /// Synchronize all processes at an epoch boundary
    pub fn barrier(&self) -> Result<()> {
        self.barrier.wait(self.barrier_timeout)
    }
}
