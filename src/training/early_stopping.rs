//! Validation-driven early stopping
//!
//! Watches the validation loss once per epoch. An improvement beyond
//! `min_delta` resets the counter and snapshots the model into the `best`
//! checkpoint slot; `patience` consecutive non-improvements flip the
//! controller into the stopped state. The best snapshot survives as a
//! [`CheckpointHandle`] so later stages can reload it without probing the
//! filesystem.

use candle_nn::VarMap;
use tracing::{debug, info};

use crate::error::Result;
use crate::training::checkpoints::{CheckpointHandle, CheckpointManager, CheckpointTag};
use crate::training::optimizers::Optimizer;

/// Controller lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoppingState {
    /// Still watching for improvement
    Monitoring,
    /// Patience exhausted, training should end
    Stopped,
}

/// Early-stopping controller over a minimized validation metric
pub struct EarlyStopping {
    patience: usize,
    min_delta: f64,
    counter: usize,
    best_loss: Option<f64>,
    state: StoppingState,
    best: Option<CheckpointHandle>,
}

impl EarlyStopping {
    /// Create a controller that stops after `patience` epochs without
    /// improvement larger than `min_delta`
    pub fn new(patience: usize, min_delta: f64) -> Self {
        Self {
            patience,
            min_delta,
            counter: 0,
            best_loss: None,
            state: StoppingState::Monitoring,
            best: None,
        }
    }

    /// Advance the state machine with one epoch's validation loss; returns
    /// whether the loss improved on the best seen so far.
    ///
    /// Pure decision logic with no side effects. Every rank of a run feeds
    /// the same loss sequence through this so all ranks reach the stop
    /// decision on the same epoch; only the master additionally snapshots
    /// through [`observe`](Self::observe).
    pub fn record(&mut self, validation_loss: f64, epoch: usize) -> bool {
        if self.state == StoppingState::Stopped {
            return false;
        }

        let improved = match self.best_loss {
            None => true,
            Some(best) => validation_loss < best - self.min_delta,
        };

        if improved {
            self.best_loss = Some(validation_loss);
            self.counter = 0;
        } else {
            self.counter += 1;
            debug!(
                epoch,
                validation_loss,
                counter = self.counter,
                patience = self.patience,
                "no validation improvement"
            );
            if self.counter >= self.patience {
                self.state = StoppingState::Stopped;
                info!(epoch, "early stopping triggered");
            }
        }
        improved
    }

    /// Feed one epoch's validation loss and persist improvements.
    ///
    /// On improvement the current model and optimizer are snapshotted into the
    /// `best` slot. Master rank only; peers use [`record`](Self::record).
    /// Returns the state after the update.
    pub fn observe(
        &mut self,
        validation_loss: f64,
        epoch: usize,
        checkpoints: &CheckpointManager,
        var_map: &VarMap,
        optimizer: &dyn Optimizer,
    ) -> Result<StoppingState> {
        if self.record(validation_loss, epoch) {
            let handle = checkpoints.save(CheckpointTag::Best, var_map, optimizer)?;
            info!(epoch, validation_loss, "validation improved, best snapshot updated");
            self.best = Some(handle);
        }
        Ok(self.state)
    }

    /// Whether the controller has decided to stop
    pub fn should_stop(&self) -> bool {
        self.state == StoppingState::Stopped
    }

    /// Best validation loss seen so far
    pub fn best_loss(&self) -> Option<f64> {
        self.best_loss
    }

    /// Handle for the best snapshot, if any improvement was recorded
    pub fn best_checkpoint(&self) -> Option<&CheckpointHandle> {
        self.best.as_ref()
    }

    /// Restore the best snapshot into the given model and optimizer
    pub fn load_best(
        &self,
        checkpoints: &CheckpointManager,
        var_map: &mut VarMap,
        optimizer: &mut dyn Optimizer,
    ) -> Result<bool> {
        match &self.best {
            Some(handle) => {
                checkpoints.load(handle, var_map, optimizer)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Re-arm the counter and state for a new training stage.
    ///
    /// The best loss and best snapshot are kept so a later stage still
    /// competes against the overall best, not a per-stage best.
    pub fn reset(&mut self) {
        self.counter = 0;
        self.state = StoppingState::Monitoring;
    }

    /// Leave the stopped state without refunding the patience counter, so a
    /// new stage keeps competing against the shared patience budget
    pub fn rearm(&mut self) {
        self.state = StoppingState::Monitoring;
    }
}
