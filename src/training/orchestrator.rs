//! Stage/epoch orchestration over a full run
//!
//! A state machine over `(stage, epoch)`. Contrastive pretraining runs one
//! stage; supervised fine-tuning runs up to `max_train_stages` stages, each
//! starting from the decayed stage learning rate and the best checkpoint of
//! the run so far. All processes hit the epoch barrier before any work and
//! validate every epoch, so the early-stop decision lands on the same epoch
//! everywhere; only the master rank checkpoints and writes artifacts.

use std::path::PathBuf;

use tracing::{info, warn};

use crate::cluster::ClusterContext;
use crate::config::RunConfig;
use crate::data::AudioDataset;
use crate::error::{Error, Result};
use crate::export;
use crate::logging::{self, ScalarLogger};
use crate::model::build_model;
use crate::training::checkpoints::{CheckpointManager, CheckpointTag};
use crate::training::early_stopping::EarlyStopping;
use crate::training::optimizers::build_optimizer;
use crate::training::scheduler::{build_scheduler, stage_lr, Scheduler, WarmupPolicy};
use crate::training::solver::Solver;

/// What a completed (or early-stopped) run produced
#[derive(Debug)]
pub struct RunReport {
    /// Stages the run entered
    pub stages_completed: usize,
    /// Training epochs actually executed
    pub epochs_completed: usize,
    /// Best validation loss seen, if validation ran
    pub best_validation_loss: Option<f64>,
    /// Final mean ROC-AUC / AP over tags, supervised runs only
    pub final_metrics: Option<(f64, f64)>,
    /// Path of `results.json`, supervised master runs only
    pub results_path: Option<PathBuf>,
    /// Path of the web prediction export, supervised master runs only
    pub predictions_path: Option<PathBuf>,
}

/// Drives one run end to end: stages, epochs, checkpoints, final evaluation
pub struct Orchestrator {
    config: RunConfig,
    cluster: ClusterContext,
    solver: Solver,
    checkpoints: CheckpointManager,
    logger: Box<dyn ScalarLogger>,
    warmup: WarmupPolicy,
    scheduler: Option<Box<dyn Scheduler>>,
    early_stopping: EarlyStopping,
}

impl Orchestrator {
    /// Assemble a run on this process's device
    pub fn new(config: RunConfig, cluster: ClusterContext) -> Result<Self> {
        config.validate()?;

        let model = build_model(&config, &cluster.device)?;
        let optimizer = build_optimizer(&config, model.var_map())?;
        let initial_lr = optimizer.learning_rate();

        let checkpoints = CheckpointManager::new(config.run_dir(), &config.model_name)?;
        let logger = logging::for_rank(cluster.is_master(), &config.run_dir())?;
        // warmup belongs to the LARS path only; other optimizers keep their
        // configured rate from epoch 0
        let warmup_epochs = if config.optimizer == "lars" {
            config.warmup_epochs
        } else {
            0
        };
        let warmup = WarmupPolicy::new(initial_lr, warmup_epochs);
        let scheduler = build_scheduler(&config, initial_lr)?;
        let early_stopping = EarlyStopping::new(config.patience, config.min_delta);

        Ok(Self {
            solver: Solver::new(&config, model, optimizer),
            config,
            cluster,
            checkpoints,
            logger,
            warmup,
            scheduler,
            early_stopping,
        })
    }

    /// Solver driving the epochs, exposed for inspection after a run
    pub fn solver(&self) -> &Solver {
        &self.solver
    }

    /// Either restore a prior checkpoint or persist the untrained state.
    ///
    /// The `random` snapshot lets the final comparison against an untrained
    /// baseline reuse the normal checkpoint path.
    fn prepare_initial_state(&mut self) -> Result<()> {
        if self.config.reload {
            let epoch = self
                .config
                .reload_epoch
                .ok_or_else(|| Error::config("reload requires reload_epoch"))?;
            let handle = self
                .checkpoints
                .existing(CheckpointTag::Epoch(epoch))
                .ok_or_else(|| {
                    Error::config(format!("no checkpoint found for reload_epoch {epoch}"))
                })?;
            let mut var_map = self.solver.model().var_map();
            self.checkpoints
                .load(&handle, &mut var_map, self.solver.optimizer_mut())?;
            info!(epoch, "resumed from checkpoint");
        } else if self.cluster.is_master() {
            self.checkpoints.save(
                CheckpointTag::Random,
                &self.solver.model().var_map(),
                self.solver.optimizer(),
            )?;
        }
        Ok(())
    }

    fn enter_stage(&mut self, stage: usize) -> Result<()> {
        self.solver.state_mut().train_stage = stage;
        if stage == 0 {
            return Ok(());
        }

        let lr = stage_lr(self.config.learning_rate, self.config.stage_lr_decay, stage);
        self.solver.optimizer_mut().set_learning_rate(lr);

        let mut var_map = self.solver.model().var_map();
        let reloaded = self.early_stopping.load_best(
            &self.checkpoints,
            &mut var_map,
            self.solver.optimizer_mut(),
        )?;
        // the reload restores the snapshot's rate, the stage rate wins
        self.solver.optimizer_mut().set_learning_rate(lr);
        if !reloaded {
            warn!(stage, "no best checkpoint to reload, continuing from current weights");
        }

        if self.config.reset_patience_per_stage {
            self.early_stopping.reset();
        } else {
            self.early_stopping.rearm();
        }
        info!(stage, lr, "stage started");
        Ok(())
    }

    fn run_epoch(
        &mut self,
        stage: usize,
        epoch: usize,
        train: &dyn AudioDataset,
        validation: &dyn AudioDataset,
        test: Option<&dyn AudioDataset>,
    ) -> Result<()> {
        // every process must arrive before any proceeds
        self.cluster.barrier()?;
        self.solver.state_mut().current_epoch = epoch;

        if let Some(lr) = self.warmup.lr_for_epoch(epoch) {
            self.solver.optimizer_mut().set_learning_rate(lr);
        }

        let stats = self.solver.train_epoch(train, self.logger.as_mut())?;
        let step = self.solver.state().global_step;
        self.logger.add_scalar("Loss/train_epoch", stats.loss, step);
        self.logger.add_scalar(
            "Misc/learning_rate",
            self.solver.optimizer().learning_rate(),
            step,
        );
        info!(
            stage,
            epoch,
            loss = stats.loss,
            lr = self.solver.optimizer().learning_rate(),
            "epoch finished"
        );

        // every rank validates and feeds the stop state machine, so all
        // ranks leave the epoch loop together; only the master persists
        if (epoch + 1) % self.config.validate_epochs.max(1) == 0 {
            let loss = self.solver.validate(validation, self.logger.as_mut())?;
            if self.cluster.is_master() {
                let var_map = self.solver.model().var_map();
                self.early_stopping.observe(
                    loss,
                    epoch,
                    &self.checkpoints,
                    &var_map,
                    self.solver.optimizer(),
                )?;
            } else {
                self.early_stopping.record(loss, epoch);
            }
        }

        if self.cluster.is_master() {
            if let Some(test) = test {
                let has_tracks = test.track_index().is_some();
                if has_tracks
                    && self.config.supervised
                    && (epoch + 1) % self.config.test_epochs.max(1) == 0
                {
                    match self.solver.test_tracks(test) {
                        Ok(eval) => {
                            let step = self.solver.state().global_step;
                            self.logger.add_scalar("AUC_tag/test", eval.mean_auc, step);
                            self.logger.add_scalar("AP_tag/test", eval.mean_ap, step);
                        }
                        Err(err) if err.is_recoverable() => {
                            warn!(epoch, %err, "track evaluation skipped");
                        }
                        Err(err) => return Err(err),
                    }
                }
            }

            if (epoch + 1) % self.config.checkpoint_epochs.max(1) == 0 {
                self.checkpoints.save(
                    CheckpointTag::Epoch(epoch + 1),
                    &self.solver.model().var_map(),
                    self.solver.optimizer(),
                )?;
            }

            // annealing is master-gated; replicas pick the rate up from the
            // next broadcast checkpoint
            if self.warmup.is_done(epoch) {
                if let Some(scheduler) = self.scheduler.as_mut() {
                    scheduler.step();
                    self.solver
                        .optimizer_mut()
                        .set_learning_rate(scheduler.get_lr());
                }
            }
        }

        self.logger.flush()?;
        Ok(())
    }

    /// Execute the whole run and write final artifacts
    pub fn run(
        &mut self,
        train: &dyn AudioDataset,
        validation: &dyn AudioDataset,
        test: Option<&dyn AudioDataset>,
    ) -> Result<RunReport> {
        self.prepare_initial_state()?;

        let mut epochs_completed = 0usize;
        let mut stages_completed = 0usize;

        for stage in 0..self.config.train_stages() {
            self.enter_stage(stage)?;
            let first_epoch = if stage == 0 { self.config.start_epoch } else { 0 };

            for epoch in first_epoch..self.config.epochs {
                self.run_epoch(stage, epoch, train, validation, test)?;
                epochs_completed += 1;
                if self.early_stopping.should_stop() {
                    info!(stage, epoch, "stage ended by early stopping");
                    break;
                }
            }
            stages_completed += 1;
        }

        let mut report = RunReport {
            stages_completed,
            epochs_completed,
            best_validation_loss: self.early_stopping.best_loss(),
            final_metrics: None,
            results_path: None,
            predictions_path: None,
        };

        if self.cluster.is_master() {
            // the run's product is the best model, not the last state
            let mut var_map = self.solver.model().var_map();
            self.early_stopping.load_best(
                &self.checkpoints,
                &mut var_map,
                self.solver.optimizer_mut(),
            )?;
            self.checkpoints.save(
                CheckpointTag::Epoch(self.config.epochs),
                &self.solver.model().var_map(),
                self.solver.optimizer(),
            )?;

            if let Some(test) = test.filter(|t| t.track_index().is_some()) {
                if self.config.supervised {
                    match self.solver.test_tracks(test) {
                        Ok(eval) => {
                            let run_dir = self.config.run_dir();
                            report.final_metrics = Some((eval.mean_auc, eval.mean_ap));
                            report.results_path = Some(export::write_results(
                                &run_dir,
                                &self.config,
                                test.tags(),
                                &eval,
                            )?);
                            if let Some(index) = test.track_index() {
                                report.predictions_path = Some(export::write_web_predictions(
                                    &run_dir,
                                    &self.config,
                                    test.tags(),
                                    index,
                                    &eval,
                                )?);
                            }
                            self.logger.log_info(&format!(
                                "final evaluation: mean ROC-AUC {:.4}, mean PR-AUC {:.4}",
                                eval.mean_auc, eval.mean_ap
                            ));
                        }
                        Err(err) if err.is_recoverable() => {
                            warn!(%err, "final track evaluation skipped");
                        }
                        Err(err) => return Err(err),
                    }
                }
            }
            self.logger.flush()?;
        }

        info!(
            stages = report.stages_completed,
            epochs = report.epochs_completed,
            "run complete"
        );
        Ok(report)
    }
}
