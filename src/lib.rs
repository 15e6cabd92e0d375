//! Tessitura: contrastive audio representation learning
//!
//! A training pipeline for audio tagging models: self-supervised contrastive
//! pretraining (NT-Xent over two augmented views) followed by multi-stage
//! supervised fine-tuning, with early stopping, learning-rate scheduling,
//! durable checkpoints, tag-wise ranking metrics and track-level evaluation.
//!
//! # Example
//!
//! ```no_run
//! use candle_core::Device;
//! use tessitura::cluster::ClusterContext;
//! use tessitura::config::RunConfig;
//! use tessitura::data::InMemoryDataset;
//! use tessitura::training::Orchestrator;
//!
//! # fn main() -> tessitura::error::Result<()> {
//! let config = RunConfig::from_file("config.yaml")?;
//! let cluster = ClusterContext::new(&config, 0, Device::Cpu)?;
//! let mut orchestrator = Orchestrator::new(config, cluster)?;
//!
//! let train = InMemoryDataset::new(vec![], vec![]);
//! let validation = InMemoryDataset::new(vec![], vec![]);
//! let report = orchestrator.run(&train, &validation, None)?;
//! println!("trained for {} epochs", report.epochs_completed);
//! # Ok(())
//! # }
//! ```

pub mod cluster;
pub mod config;
pub mod data;
pub mod error;
pub mod export;
pub mod logging;
pub mod model;
pub mod training;

pub use cluster::ClusterContext;
pub use config::RunConfig;
pub use error::{Error, Result};
pub use model::{build_model, Model};
pub use training::{Orchestrator, RunReport, Solver};
