//! Run configuration for training and evaluation
//!
//! A [`RunConfig`] is immutable for the duration of a run. Mutable run
//! progress (epoch, stage, global step) lives in
//! [`crate::training::RunState`], not here.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Encoder architectures the model factory knows how to build
pub const KNOWN_ENCODERS: &[&str] = &["samplecnn", "shortchunk_cnn"];

/// Optimizers the optimizer factory knows how to build
pub const KNOWN_OPTIMIZERS: &[&str] = &["adam", "lars"];

/// Sample rates with a stride table for the samplecnn encoder
pub const SUPPORTED_SAMPLE_RATES: &[u32] = &[22050, 16000, 8000];

/// Immutable per-run configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Run identifier, used for the log directory name
    #[serde(default = "default_id")]
    pub id: String,

    /// Checkpoint/log output directory
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// Base name for checkpoint files
    #[serde(default = "default_model_name")]
    pub model_name: String,

    /// Supervised fine-tuning instead of contrastive pretraining
    #[serde(default)]
    pub supervised: bool,

    /// Encoder architecture name
    #[serde(default = "default_encoder")]
    pub encoder: String,

    /// Optimizer name
    #[serde(default = "default_optimizer")]
    pub optimizer: String,

    /// Audio sample rate in Hz
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,

    /// Clip length in samples
    #[serde(default = "default_audio_length")]
    pub audio_length: usize,

    /// Number of tags for supervised runs
    #[serde(default = "default_n_classes")]
    pub n_classes: usize,

    /// Training batch size
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Epoch budget per stage
    #[serde(default = "default_epochs")]
    pub epochs: usize,

    /// First epoch (nonzero when resuming from a checkpoint)
    #[serde(default)]
    pub start_epoch: usize,

    /// Base learning rate
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,

    /// NT-Xent temperature
    #[serde(default = "default_temperature")]
    pub temperature: f64,

    /// Weight decay coefficient
    #[serde(default = "default_weight_decay")]
    pub weight_decay: f64,

    /// Number of cooperating processes
    #[serde(default = "default_world_size")]
    pub world_size: usize,

    /// Single-process data parallelism over local devices
    #[serde(default)]
    pub dataparallel: bool,

    /// Linear warmup epochs (LARS path only; 0 disables warmup)
    #[serde(default)]
    pub warmup_epochs: usize,

    /// Checkpoint interval in epochs
    #[serde(default = "default_checkpoint_epochs")]
    pub checkpoint_epochs: usize,

    /// Validation interval in epochs
    #[serde(default = "default_validate_epochs")]
    pub validate_epochs: usize,

    /// Track-level test interval in epochs
    #[serde(default = "default_test_epochs")]
    pub test_epochs: usize,

    /// Maximum fine-tuning stages for supervised runs
    #[serde(default = "default_max_train_stages")]
    pub max_train_stages: usize,

    /// Per-stage learning rate decay factor
    #[serde(default = "default_stage_lr_decay")]
    pub stage_lr_decay: f64,

    /// Early-stopping patience in validation rounds
    #[serde(default = "default_patience")]
    pub patience: usize,

    /// Minimum validation loss improvement that counts
    #[serde(default)]
    pub min_delta: f64,

    /// Give each fine-tuning stage a fresh patience budget
    #[serde(default)]
    pub reset_patience_per_stage: bool,

    /// Resume model and optimizer state from a checkpoint
    #[serde(default)]
    pub reload: bool,

    /// Checkpoint epoch to resume from (requires `reload`)
    #[serde(default)]
    pub reload_epoch: Option<usize>,

    /// RNG seed
    #[serde(default = "default_seed")]
    pub seed: u64,

    /// Epoch barrier timeout in seconds
    #[serde(default = "default_barrier_timeout_secs")]
    pub barrier_timeout_secs: u64,

    /// Sampling interval for the prediction export (every nth test track)
    #[serde(default = "default_export_every")]
    pub export_every: usize,
}

fn default_id() -> String {
    "0".to_string()
}
fn default_output_dir() -> PathBuf {
    PathBuf::from("./logs")
}
fn default_model_name() -> String {
    "tessitura".to_string()
}
fn default_encoder() -> String {
    "samplecnn".to_string()
}
fn default_optimizer() -> String {
    "adam".to_string()
}
fn default_sample_rate() -> u32 {
    22050
}
fn default_audio_length() -> usize {
    59049
}
fn default_n_classes() -> usize {
    50
}
fn default_batch_size() -> usize {
    48
}
fn default_epochs() -> usize {
    100
}
fn default_learning_rate() -> f64 {
    3e-4
}
fn default_temperature() -> f64 {
    0.5
}
fn default_weight_decay() -> f64 {
    1e-6
}
fn default_world_size() -> usize {
    1
}
fn default_checkpoint_epochs() -> usize {
    10
}
fn default_validate_epochs() -> usize {
    1
}
fn default_test_epochs() -> usize {
    5
}
fn default_max_train_stages() -> usize {
    5
}
fn default_stage_lr_decay() -> f64 {
    0.5
}
fn default_patience() -> usize {
    3
}
fn default_seed() -> u64 {
    42
}
fn default_barrier_timeout_secs() -> u64 {
    1800
}
fn default_export_every() -> usize {
    10
}

impl Default for RunConfig {
    fn default() -> Self {
        serde_yaml::from_str("{}").expect("empty config deserializes from defaults")
    }
}

impl RunConfig {
    /// Load a configuration from a YAML or JSON file and validate it
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;

        let config: Self = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str(&contents)?,
            _ => serde_yaml::from_str(&contents)
                .map_err(|e| Error::config(format!("{}: {e}", path.display())))?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration contracts. All violations are fatal.
    pub fn validate(&self) -> Result<()> {
        if !KNOWN_OPTIMIZERS.contains(&self.optimizer.as_str()) {
            return Err(Error::config(format!(
                "unknown optimizer '{}', expected one of {KNOWN_OPTIMIZERS:?}",
                self.optimizer
            )));
        }
        if !KNOWN_ENCODERS.contains(&self.encoder.as_str()) {
            return Err(Error::config(format!(
                "unknown encoder '{}', expected one of {KNOWN_ENCODERS:?}",
                self.encoder
            )));
        }
        if self.encoder == "samplecnn" && !SUPPORTED_SAMPLE_RATES.contains(&self.sample_rate) {
            return Err(Error::config(format!(
                "unsupported sample rate {} for samplecnn, expected one of {SUPPORTED_SAMPLE_RATES:?}",
                self.sample_rate
            )));
        }
        if self.batch_size == 0 {
            return Err(Error::config("batch_size must be positive"));
        }
        if self.epochs <= self.start_epoch {
            return Err(Error::config(format!(
                "epochs ({}) must exceed start_epoch ({})",
                self.epochs, self.start_epoch
            )));
        }
        if self.learning_rate <= 0.0 {
            return Err(Error::config("learning_rate must be positive"));
        }
        if !self.supervised && self.temperature <= 0.0 {
            return Err(Error::config("temperature must be positive"));
        }
        if self.supervised && self.n_classes == 0 {
            return Err(Error::config("n_classes must be positive for supervised runs"));
        }
        if !(self.stage_lr_decay > 0.0 && self.stage_lr_decay <= 1.0) {
            return Err(Error::config("stage_lr_decay must be in (0, 1]"));
        }
        if self.patience == 0 {
            return Err(Error::config("patience must be positive"));
        }
        if self.world_size == 0 {
            return Err(Error::config("world_size must be at least 1"));
        }
        if self.max_train_stages == 0 {
            return Err(Error::config("max_train_stages must be at least 1"));
        }
        if self.reload && self.reload_epoch.is_none() {
            return Err(Error::config("reload requires reload_epoch"));
        }
        Ok(())
    }

    /// Number of training stages this run iterates
    pub fn train_stages(&self) -> usize {
        if self.supervised {
            self.max_train_stages
        } else {
            1
        }
    }

    /// Log/checkpoint directory for this run
    pub fn run_dir(&self) -> PathBuf {
        self.output_dir.join(&self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = RunConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.train_stages(), 1);
    }

    #[test]
    fn test_supervised_runs_five_stages() {
        let config = RunConfig {
            supervised: true,
            ..RunConfig::default()
        };
        assert_eq!(config.train_stages(), 5);
    }

    #[test]
    fn test_unknown_optimizer_rejected() {
        let config = RunConfig {
            optimizer: "adagrad".to_string(),
            ..RunConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(err.to_string().contains("adagrad"));
    }

    #[test]
    fn test_unknown_encoder_rejected() {
        let config = RunConfig {
            encoder: "resnet50".to_string(),
            ..RunConfig::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_unsupported_sample_rate_rejected() {
        let config = RunConfig {
            sample_rate: 44100,
            ..RunConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("44100"));
    }

    #[test]
    fn test_yaml_roundtrip_with_defaults() {
        let yaml = "supervised: true\nbatch_size: 16\noptimizer: lars\n";
        let config: RunConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(config.supervised);
        assert_eq!(config.batch_size, 16);
        assert_eq!(config.patience, 3);
        assert!(config.validate().is_ok());
    }
}
