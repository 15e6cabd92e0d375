//! Model collaborator contract and encoder construction
//!
//! The training loop only relies on the [`Model`] trait: a forward pass
//! producing `(representation, projection_or_logits)`, a train/eval mode
//! switch, and access to the parameter [`VarMap`] for the optimizer and
//! checkpointing. Concrete encoder internals are intentionally modest; the
//! factory's contract (names, stride tables, error cases) is what matters.

use candle_core::{DType, Device, Tensor};
use candle_nn::{linear, Conv1d, Conv1dConfig, Linear, Module, VarBuilder, VarMap};
use tracing::info;

use crate::config::RunConfig;
use crate::error::{Error, Result};

/// Representation dimensionality produced by both encoders
pub const N_FEATURES: usize = 512;

/// Projection head output dimensionality for contrastive runs
pub const PROJECTION_DIM: usize = 64;

/// A parametrized function with trainable state
pub trait Model: Send {
    /// Forward pass: `(representation, projection_or_logits)`
    fn forward(&self, input: &Tensor) -> Result<(Tensor, Tensor)>;

    /// Toggle stochastic regularization layers
    fn set_training(&mut self, training: bool);

    /// Whether the model is in training mode
    fn is_training(&self) -> bool;

    /// Shared handle to the trainable parameters
    fn var_map(&self) -> VarMap;
}

/// Convolutional waveform/spectral encoder stack
struct EncoderStack {
    convs: Vec<Conv1d>,
    fc: Linear,
}

impl EncoderStack {
    fn build(vb: &VarBuilder, strides: &[usize], channels: usize) -> Result<Self> {
        let mut convs = Vec::with_capacity(strides.len());
        let mut in_channels = 1;
        for (i, &stride) in strides.iter().enumerate() {
            let cfg = Conv1dConfig {
                stride,
                ..Default::default()
            };
            let conv = candle_nn::conv1d(
                in_channels,
                channels,
                stride.max(2),
                cfg,
                vb.pp(format!("conv{i}")),
            )?;
            convs.push(conv);
            in_channels = channels;
        }
        let fc = linear(channels, N_FEATURES, vb.pp("fc"))?;
        Ok(Self { convs, fc })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        // (B, L) -> (B, 1, L)
        let mut h = x.unsqueeze(1)?;
        for conv in &self.convs {
            h = conv.forward(&h)?.relu()?;
        }
        // global average pool over time, then project to N_FEATURES
        let h = h.mean(2)?;
        Ok(self.fc.forward(&h)?)
    }
}

/// Head attached to the encoder: contrastive projection or tag classifier
enum Head {
    /// SimCLR-style two-layer projector
    Projection { hidden: Linear, out: Linear },
    /// Multi-label classification logits
    Classifier { fc: Linear, dropout: f32 },
}

/// Encoder plus head, the unit the orchestrator owns during a run
pub struct EncoderModel {
    encoder: EncoderStack,
    head: Head,
    var_map: VarMap,
    training: bool,
}

impl std::fmt::Debug for EncoderModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncoderModel")
            .field("training", &self.training)
            .finish_non_exhaustive()
    }
}

impl EncoderModel {
    /// Stride table for the samplecnn encoder at a given sample rate
    fn samplecnn_strides(sample_rate: u32) -> Result<Vec<usize>> {
        match sample_rate {
            22050 => Ok(vec![3, 3, 3, 3, 3, 3, 3, 3, 3]),
            16000 => Ok(vec![3, 3, 3, 3, 3, 3, 5, 2, 2]),
            8000 => Ok(vec![3, 3, 3, 2, 2, 4, 4, 2, 2]),
            other => Err(Error::config(format!(
                "unsupported sample rate {other} for samplecnn"
            ))),
        }
    }

    /// Build a model from the run configuration
    pub fn build(config: &RunConfig, device: &Device) -> Result<Self> {
        let var_map = VarMap::new();
        let vb = VarBuilder::from_varmap(&var_map, DType::F32, device);

        let (strides, channels) = match config.encoder.as_str() {
            "samplecnn" => (Self::samplecnn_strides(config.sample_rate)?, 64),
            "shortchunk_cnn" => (vec![5, 3, 2, 2, 2, 2, 2], 128),
            other => {
                return Err(Error::config(format!("unknown encoder '{other}'")));
            }
        };

        let encoder = EncoderStack::build(&vb.pp("encoder"), &strides, channels)?;
        let head = if config.supervised {
            Head::Classifier {
                fc: linear(N_FEATURES, config.n_classes, vb.pp("head.fc"))?,
                dropout: 0.5,
            }
        } else {
            Head::Projection {
                hidden: linear(N_FEATURES, N_FEATURES, vb.pp("projector.hidden"))?,
                out: linear(N_FEATURES, PROJECTION_DIM, vb.pp("projector.out"))?,
            }
        };

        info!(
            encoder = %config.encoder,
            supervised = config.supervised,
            parameters = var_map.all_vars().iter().map(|v| v.elem_count()).sum::<usize>(),
            "model constructed"
        );

        Ok(Self {
            encoder,
            head,
            var_map,
            training: true,
        })
    }
}

impl Model for EncoderModel {
    fn forward(&self, input: &Tensor) -> Result<(Tensor, Tensor)> {
        let h = self.encoder.forward(input)?;
        let out = match &self.head {
            Head::Projection { hidden, out } => {
                let z = hidden.forward(&h)?.relu()?;
                out.forward(&z)?
            }
            Head::Classifier { fc, dropout } => {
                let h = if self.training {
                    candle_nn::ops::dropout(&h, *dropout)?
                } else {
                    h.clone()
                };
                fc.forward(&h)?
            }
        };
        Ok((h, out))
    }

    fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    fn is_training(&self) -> bool {
        self.training
    }

    fn var_map(&self) -> VarMap {
        self.var_map.clone()
    }
}

/// Build the encoder model for a run, on the run's device
pub fn build_model(config: &RunConfig, device: &Device) -> Result<Box<dyn Model>> {
    Ok(Box::new(EncoderModel::build(config, device)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_config(supervised: bool) -> RunConfig {
        RunConfig {
            supervised,
            sample_rate: 22050,
            audio_length: 59049,
            n_classes: 4,
            ..RunConfig::default()
        }
    }

    #[test]
    fn test_contrastive_forward_shapes() {
        let config = tiny_config(false);
        let model = EncoderModel::build(&config, &Device::Cpu).unwrap();
        let x = Tensor::zeros((2, 59049), DType::F32, &Device::Cpu).unwrap();
        let (h, z) = model.forward(&x).unwrap();
        assert_eq!(h.dims(), &[2, N_FEATURES]);
        assert_eq!(z.dims(), &[2, PROJECTION_DIM]);
    }

    #[test]
    fn test_supervised_forward_emits_logits() {
        let config = tiny_config(true);
        let mut model = EncoderModel::build(&config, &Device::Cpu).unwrap();
        model.set_training(false);
        let x = Tensor::zeros((3, 59049), DType::F32, &Device::Cpu).unwrap();
        let (_, logits) = model.forward(&x).unwrap();
        assert_eq!(logits.dims(), &[3, 4]);
    }

    #[test]
    fn test_unknown_encoder_rejected() {
        let config = RunConfig {
            encoder: "vggish".to_string(),
            ..tiny_config(false)
        };
        let err = EncoderModel::build(&config, &Device::Cpu).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_unsupported_sample_rate_rejected_by_factory() {
        assert!(EncoderModel::samplecnn_strides(44100).is_err());
        assert_eq!(EncoderModel::samplecnn_strides(22050).unwrap().len(), 9);
    }
}
