//! Durable model/optimizer checkpoints
//!
//! Two artifacts per save: `{name}_checkpoint_{tag}.pt` holding the model
//! parameters (safetensors via the model's `VarMap`) and
//! `{name}_checkpoint_{tag}_optim.pt` holding the serialized optimizer state.
//! Tags are integer epochs, the literal `random` for the untrained initial
//! state, or `best` for the early-stopping controller's fixed slot.
//!
//! Every write goes to a temporary file first and is renamed into place, so a
//! crash mid-write can never leave a truncated file that parses as valid.
//! Transient storage failures are retried once with backoff; a second failure
//! is a fatal [`Error::CheckpointIo`].

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use candle_nn::VarMap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::training::optimizers::{Optimizer, OptimizerStateDict};

/// Which slot a checkpoint occupies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CheckpointTag {
    /// Untrained initial state saved before the first epoch
    Random,
    /// Periodic save at the given epoch
    Epoch(usize),
    /// Best-so-far slot owned by the early-stopping controller
    Best,
}

impl fmt::Display for CheckpointTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Random => write!(f, "random"),
            Self::Epoch(epoch) => write!(f, "{epoch}"),
            Self::Best => write!(f, "best"),
        }
    }
}

/// Locator for one persisted model+optimizer pair.
///
/// Callers reason about handles, never about file existence probes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointHandle {
    /// Slot this checkpoint occupies
    pub tag: CheckpointTag,
    /// Model parameter file
    pub model_path: PathBuf,
    /// Optimizer state file
    pub optimizer_path: PathBuf,
    /// When the checkpoint was written
    pub saved_at: DateTime<Utc>,
}

/// Writes and restores checkpoints for one run
pub struct CheckpointManager {
    dir: PathBuf,
    name: String,
}

impl CheckpointManager {
    /// Create a manager writing into `dir` with the given file name prefix
    pub fn new<P: AsRef<Path>>(dir: P, name: impl Into<String>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            name: name.into(),
        })
    }

    fn model_path(&self, tag: CheckpointTag) -> PathBuf {
        self.dir.join(format!("{}_checkpoint_{tag}.pt", self.name))
    }

    fn optimizer_path(&self, tag: CheckpointTag) -> PathBuf {
        self.dir
            .join(format!("{}_checkpoint_{tag}_optim.pt", self.name))
    }

    /// Locator for an existing checkpoint slot, if both artifacts are present
    pub fn existing(&self, tag: CheckpointTag) -> Option<CheckpointHandle> {
        let model_path = self.model_path(tag);
        let optimizer_path = self.optimizer_path(tag);
        if model_path.exists() && optimizer_path.exists() {
            Some(CheckpointHandle {
                tag,
                model_path,
                optimizer_path,
                saved_at: Utc::now(),
            })
        } else {
            None
        }
    }

    /// Persist the model parameters and optimizer state under `tag`
    pub fn save(
        &self,
        tag: CheckpointTag,
        var_map: &VarMap,
        optimizer: &dyn Optimizer,
    ) -> Result<CheckpointHandle> {
        let model_path = self.model_path(tag);
        persist(&model_path, |tmp| {
            var_map.save(tmp)?;
            Ok(())
        })?;

        let optimizer_path = self.optimizer_path(tag);
        let state_bytes = optimizer.state_dict()?.to_bytes()?;
        persist(&optimizer_path, |tmp| {
            fs::write(tmp, &state_bytes)?;
            Ok(())
        })?;

        info!(tag = %tag, path = %model_path.display(), "checkpoint saved");
        Ok(CheckpointHandle {
            tag,
            model_path,
            optimizer_path,
            saved_at: Utc::now(),
        })
    }

    /// Restore model parameters and optimizer state from a handle
    pub fn load(
        &self,
        handle: &CheckpointHandle,
        var_map: &mut VarMap,
        optimizer: &mut dyn Optimizer,
    ) -> Result<()> {
        var_map
            .load(&handle.model_path)
            .map_err(|e| Error::checkpoint_io(handle.model_path.clone(), e))?;

        let bytes = fs::read(&handle.optimizer_path)
            .map_err(|e| Error::checkpoint_io(handle.optimizer_path.clone(), e))?;
        optimizer.load_state_dict(OptimizerStateDict::from_bytes(&bytes)?)?;

        info!(tag = %handle.tag, "checkpoint restored");
        Ok(())
    }
}

/// Write through a temp file with one retry on transient failure
fn persist<F>(path: &Path, write: F) -> Result<()>
where
    F: Fn(&Path) -> anyhow::Result<()>,
{
    let tmp = path.with_extension("pt.tmp");

    let attempt = || -> anyhow::Result<()> {
        write(&tmp)?;
        fs::rename(&tmp, path)?;
        Ok(())
    };

    if let Err(first) = attempt() {
        warn!(
            path = %path.display(),
            error = %first,
            "checkpoint write failed, retrying once"
        );
        std::thread::sleep(Duration::from_millis(500));
        attempt().map_err(|e| Error::checkpoint_io(path.to_path_buf(), e))?;
    }
    Ok(())
}
