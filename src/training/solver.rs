//! Epoch-level training, validation and track evaluation
//!
//! The solver owns the model, optimizer and objective for one run and drives
//! single epochs; multi-stage orchestration lives one level up. Every
//! optimizer step increments the monotone global step counter that keys all
//! scalar logging, so curves from different runs line up step for step.

use candle_core::Tensor;
use ndarray::Array1;
use tracing::{debug, info, warn};

use crate::config::RunConfig;
use crate::data::AudioDataset;
use crate::error::{Error, Result};
use crate::logging::ScalarLogger;
use crate::model::Model;
use crate::training::loss::{bce_with_logits, NtXent};
use crate::training::metrics::{batch_auc_ap, nan_mean, tagwise_auc_ap, tensor_to_array};
use crate::training::optimizers::Optimizer;
use crate::training::tracks::TrackAggregator;

/// Steps between console progress lines during training
const LOG_EVERY_STEPS: usize = 20;

/// Whether an epoch-local step gets a console progress line. Fires on the
/// first step so short epochs still report.
fn should_log_progress(step_in_epoch: usize) -> bool {
    step_in_epoch % LOG_EVERY_STEPS == 0
}

/// What a run optimizes
pub enum Objective {
    /// Self-supervised contrastive pretraining
    Contrastive(NtXent),
    /// Multi-label supervised fine-tuning
    Supervised,
}

impl Objective {
    /// Objective implied by the run configuration
    pub fn from_config(config: &RunConfig) -> Self {
        if config.supervised {
            Self::Supervised
        } else {
            Self::Contrastive(NtXent::new(config.temperature))
        }
    }

    /// Short name used in log lines
    pub fn name(&self) -> &'static str {
        match self {
            Self::Contrastive(_) => "contrastive",
            Self::Supervised => "supervised",
        }
    }
}

/// Mutable position within a run, advanced only by the training loop
#[derive(Debug, Clone, Copy, Default)]
pub struct RunState {
    /// Epoch within the current stage
    pub current_epoch: usize,
    /// Fine-tuning stage index
    pub train_stage: usize,
    /// Total optimizer steps taken across the whole run
    pub global_step: usize,
}

/// Aggregates from one training or validation epoch
#[derive(Debug, Clone, Copy)]
pub struct EpochStats {
    /// Mean loss over all batches
    pub loss: f64,
    /// Mean batch AUC, supervised runs only
    pub auc: Option<f64>,
    /// Mean batch AP, supervised runs only
    pub ap: Option<f64>,
}

/// Track-level evaluation output
pub struct TrackEvaluation {
    /// Per-tag ROC-AUC, NaN for degenerate tags
    pub tag_auc: Array1<f64>,
    /// Per-tag Average Precision, NaN for degenerate tags
    pub tag_ap: Array1<f64>,
    /// Mean AUC over non-degenerate tags
    pub mean_auc: f64,
    /// Mean AP over non-degenerate tags
    pub mean_ap: f64,
    /// Averaged prediction vector per track, in evaluation order
    pub predictions: Vec<(String, Vec<f32>)>,
    /// Ground-truth label vector per track, same order as `predictions`
    pub labels: Vec<Vec<f32>>,
}

/// Single-epoch training and evaluation engine
pub struct Solver {
    model: Box<dyn Model>,
    optimizer: Box<dyn Optimizer>,
    objective: Objective,
    state: RunState,
}

impl Solver {
    /// Assemble a solver from its collaborators
    pub fn new(config: &RunConfig, model: Box<dyn Model>, optimizer: Box<dyn Optimizer>) -> Self {
        Self {
            model,
            optimizer,
            objective: Objective::from_config(config),
            state: RunState::default(),
        }
    }

    /// Current run position
    pub fn state(&self) -> RunState {
        self.state
    }

    /// Mutable run position, used by the orchestrator between stages
    pub fn state_mut(&mut self) -> &mut RunState {
        &mut self.state
    }

    /// The model under training
    pub fn model(&self) -> &dyn Model {
        self.model.as_ref()
    }

    /// The optimizer driving updates
    pub fn optimizer(&self) -> &dyn Optimizer {
        self.optimizer.as_ref()
    }

    /// Mutable optimizer access for schedule updates and checkpoint restore
    pub fn optimizer_mut(&mut self) -> &mut dyn Optimizer {
        self.optimizer.as_mut()
    }

    /// Loss for one batch, plus the logits the loss was computed from so
    /// supervised step metrics score the same forward pass
    fn batch_loss(&self, batch: &crate::data::Batch) -> Result<(Tensor, Option<Tensor>)> {
        match &self.objective {
            Objective::Contrastive(ntxent) => {
                let (_, z_i) = self.model.forward(&batch.view_a)?;
                let (_, z_j) = self.model.forward(&batch.view_b)?;
                Ok((ntxent.forward(&z_i, &z_j)?, None))
            }
            Objective::Supervised => {
                let labels = batch
                    .labels
                    .as_ref()
                    .ok_or_else(|| Error::config("supervised batch without labels".to_string()))?;
                let (_, logits) = self.model.forward(&batch.view_a)?;
                Ok((bce_with_logits(&logits, labels)?, Some(logits)))
            }
        }
    }

    /// Run one training epoch over the dataset.
    ///
    /// Each batch takes exactly one optimizer step and advances the global
    /// step by one; `Loss/train` is logged at every step.
    pub fn train_epoch(
        &mut self,
        dataset: &dyn AudioDataset,
        logger: &mut dyn ScalarLogger,
    ) -> Result<EpochStats> {
        self.model.set_training(true);

        let num_batches = dataset.num_batches().max(1);
        let mut loss_sum = 0.0;
        let mut auc_sum = 0.0;
        let mut ap_sum = 0.0;
        let mut metric_batches = 0usize;

        for (step_in_epoch, batch) in dataset.batches()?.enumerate() {
            let batch = batch?;
            self.optimizer.zero_grad();
            let (loss, logits) = self.batch_loss(&batch)?;
            let grads = loss.backward()?;
            self.optimizer.step(&grads)?;

            let loss_value = f64::from(loss.to_scalar::<f32>()?);
            loss_sum += loss_value;
            self.state.global_step += 1;
            logger.add_scalar("Loss/train", loss_value, self.state.global_step);

            if let (Some(labels), Some(logits)) = (&batch.labels, &logits) {
                let probs = candle_nn::ops::sigmoid(logits)?;
                let (auc, ap) = batch_auc_ap(labels, &probs)?;
                if auc.is_finite() {
                    auc_sum += auc;
                    ap_sum += ap;
                    metric_batches += 1;
                }
                logger.add_scalar("AUC_tag/train", auc, self.state.global_step);
                logger.add_scalar("AP_tag/train", ap, self.state.global_step);
            }

            if should_log_progress(step_in_epoch) {
                info!(
                    epoch = self.state.current_epoch,
                    step = step_in_epoch + 1,
                    total = num_batches,
                    loss = loss_value,
                    lr = self.optimizer.learning_rate(),
                    "training"
                );
            }
        }

        let stats = EpochStats {
            loss: loss_sum / num_batches as f64,
            auc: (metric_batches > 0).then(|| auc_sum / metric_batches as f64),
            ap: (metric_batches > 0).then(|| ap_sum / metric_batches as f64),
        };
        debug!(
            epoch = self.state.current_epoch,
            objective = self.objective.name(),
            loss = stats.loss,
            "epoch complete"
        );
        Ok(stats)
    }

    /// Run the closure with the model in evaluation mode, restoring the
    /// previous mode on every exit path
    fn with_eval_mode<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        let was_training = self.model.is_training();
        self.model.set_training(false);
        let result = f(self);
        self.model.set_training(was_training);
        result
    }

    /// Validation pass: loss only, no parameter updates, no step advance
    pub fn validate(
        &mut self,
        dataset: &dyn AudioDataset,
        logger: &mut dyn ScalarLogger,
    ) -> Result<f64> {
        self.with_eval_mode(|solver| {
            let num_batches = dataset.num_batches().max(1);
            let mut loss_sum = 0.0;
            for batch in dataset.batches()? {
                let batch = batch?;
                let (loss, _) = solver.batch_loss(&batch)?;
                loss_sum += f64::from(loss.to_scalar::<f32>()?);
            }
            let mean_loss = loss_sum / num_batches as f64;
            logger.add_scalar("Loss/validation", mean_loss, solver.state.global_step);
            Ok(mean_loss)
        })
    }

    /// Full-track evaluation: score every segment, average per track, then
    /// compute tag-wise metrics over the track means.
    ///
    /// Tracks whose audio yields zero segments are logged and excluded
    /// rather than averaged as silence.
    pub fn test_tracks(&mut self, dataset: &dyn AudioDataset) -> Result<TrackEvaluation> {
        let entries = dataset
            .track_index()
            .ok_or_else(|| Error::config("dataset has no track index".to_string()))?
            .to_vec();

        self.with_eval_mode(|solver| {
            let mut aggregator = TrackAggregator::new();
            let mut track_labels: Vec<(String, Vec<f32>)> = Vec::new();

            for entry in &entries {
                let segments = dataset.full_track_segments(entry)?;
                if segments.dim(0)? == 0 {
                    warn!(
                        track_id = %entry.track_id,
                        path = %entry.path,
                        "track produced no segments, excluded from evaluation"
                    );
                    continue;
                }

                let (_, logits) = solver.model.forward(&segments)?;
                let probs = candle_nn::ops::softmax(&logits, 1)?;
                for row in tensor_to_array(&probs)?.rows() {
                    aggregator.add(
                        &entry.track_id,
                        row.as_slice().ok_or_else(|| {
                            Error::Other(anyhow::anyhow!("non-contiguous prediction row"))
                        })?,
                    );
                }
                if !track_labels.iter().any(|(id, _)| id == &entry.track_id) {
                    track_labels.push((entry.track_id.clone(), entry.label.clone()));
                }
            }

            if aggregator.is_empty() {
                return Err(Error::degenerate_metric(
                    "no track yielded any segments".to_string(),
                ));
            }

            let predictions = aggregator.means();
            let labels: Vec<Vec<f32>> = predictions
                .iter()
                .map(|(id, _)| {
                    track_labels
                        .iter()
                        .find(|(lid, _)| lid == id)
                        .map(|(_, l)| l.clone())
                        .ok_or_else(|| {
                            Error::Other(anyhow::anyhow!("track '{id}' missing ground truth"))
                        })
                })
                .collect::<Result<_>>()?;

            let n_tags = dataset.tags().len();
            let to_matrix = |rows: Vec<Vec<f32>>| {
                let flat: Vec<f32> = rows.into_iter().flatten().collect();
                let nrows = flat.len() / n_tags.max(1);
                ndarray::Array2::from_shape_vec((nrows, n_tags), flat)
                    .map_err(|e| Error::Other(anyhow::anyhow!("track matrix: {e}")))
            };
            let y_true = to_matrix(labels.clone())?;
            let y_pred = to_matrix(predictions.iter().map(|(_, p)| p.clone()).collect())?;

            let (tag_auc, tag_ap) = tagwise_auc_ap(&y_true, &y_pred)?;
            let mean_auc = nan_mean(tag_auc.as_slice().unwrap_or(&[]));
            let mean_ap = nan_mean(tag_ap.as_slice().unwrap_or(&[]));

            info!(
                tracks = predictions.len(),
                mean_auc, mean_ap, "track-level evaluation complete"
            );

            Ok(TrackEvaluation {
                tag_auc,
                tag_ap,
                mean_auc,
                mean_ap,
                predictions,
                labels,
            })
        })
    }
}
