//! Training pipeline: losses, optimizers, schedules, epochs and stages

pub mod checkpoints;
pub mod early_stopping;
pub mod loss;
pub mod metrics;
pub mod optimizers;
pub mod orchestrator;
pub mod scheduler;
pub mod solver;
pub mod tracks;

pub use checkpoints::{CheckpointHandle, CheckpointManager, CheckpointTag};
pub use early_stopping::{EarlyStopping, StoppingState};
pub use loss::{bce_with_logits, NtXent};
pub use metrics::{nan_mean, tagwise_auc_ap};
pub use optimizers::{build_optimizer, Optimizer, OptimizerStateDict};
pub use orchestrator::{Orchestrator, RunReport};
pub use scheduler::{build_scheduler, stage_lr, CosineAnnealingScheduler, Scheduler, WarmupPolicy};
pub use solver::{EpochStats, Objective, RunState, Solver, TrackEvaluation};
pub use tracks::TrackAggregator;
