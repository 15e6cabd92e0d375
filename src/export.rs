//! Evaluation artifacts: `results.json` and the web prediction export
//!
//! `results.json` records run hyperparameters under `hparams/` keys and final
//! tag-wise metrics under `{metric}/{tag}` keys, one flat object so external
//! dashboards can diff runs without schema knowledge. The web export samples
//! every nth evaluated track into a JSON array a demo frontend can render
//! directly. Degenerate NaN metrics serialize as `null`.

use std::fs;
use std::path::{Path, PathBuf};

use serde_json::{Map, Number, Value};
use tracing::info;

use crate::config::RunConfig;
use crate::data::TrackEntry;
use crate::error::Result;
use crate::training::TrackEvaluation;

fn json_f64(value: f64) -> Value {
    Number::from_f64(value).map_or(Value::Null, Value::Number)
}

/// Write `results.json` into the run directory
pub fn write_results(
    run_dir: &Path,
    config: &RunConfig,
    tags: &[String],
    eval: &TrackEvaluation,
) -> Result<PathBuf> {
    let mut out = Map::new();

    out.insert(
        "hparams/optimizer".to_string(),
        Value::String(config.optimizer.clone()),
    );
    out.insert(
        "hparams/encoder".to_string(),
        Value::String(config.encoder.clone()),
    );
    out.insert(
        "hparams/learning_rate".to_string(),
        json_f64(config.learning_rate),
    );
    out.insert(
        "hparams/batch_size".to_string(),
        Value::from(config.batch_size),
    );
    out.insert("hparams/epochs".to_string(), Value::from(config.epochs));
    out.insert(
        "hparams/sample_rate".to_string(),
        Value::from(config.sample_rate),
    );
    out.insert(
        "hparams/supervised".to_string(),
        Value::Bool(config.supervised),
    );

    out.insert("ROC_AUC/mean".to_string(), json_f64(eval.mean_auc));
    out.insert("PR_AUC/mean".to_string(), json_f64(eval.mean_ap));
    for (i, tag) in tags.iter().enumerate() {
        out.insert(format!("ROC_AUC/{tag}"), json_f64(eval.tag_auc[i]));
        out.insert(format!("PR_AUC/{tag}"), json_f64(eval.tag_ap[i]));
    }

    let path = run_dir.join("results.json");
    fs::write(&path, serde_json::to_string_pretty(&Value::Object(out))?)?;
    info!(path = %path.display(), "results written");
    Ok(path)
}

/// Write the sampled per-track prediction export for the web demo.
///
/// Every `export_every`th evaluated track becomes one object carrying the
/// track's identifiers, source path, ground-truth labels, and one score field
/// per tag.
pub fn write_web_predictions(
    run_dir: &Path,
    config: &RunConfig,
    tags: &[String],
    track_index: &[TrackEntry],
    eval: &TrackEvaluation,
) -> Result<PathBuf> {
    let stride = config.export_every.max(1);
    let mut records = Vec::new();

    for (idx, (track_id, scores)) in eval.predictions.iter().enumerate() {
        if idx % stride != 0 {
            continue;
        }
        let Some(entry) = track_index.iter().find(|e| &e.track_id == track_id) else {
            continue;
        };

        let mut record = Map::new();
        record.insert("idx".to_string(), Value::from(idx));
        record.insert("track_id".to_string(), Value::String(track_id.clone()));
        record.insert("clip_id".to_string(), Value::String(entry.clip_id.clone()));
        record.insert("segment".to_string(), Value::from(entry.segment));
        record.insert("audio".to_string(), Value::String(entry.path.clone()));
        // ground truth as the list of active tag names
        let active: Vec<Value> = tags
            .iter()
            .zip(entry.label.iter())
            .filter(|(_, &l)| l > 0.5)
            .map(|(tag, _)| Value::String(tag.clone()))
            .collect();
        record.insert("labels".to_string(), Value::Array(active));
        for (tag, &score) in tags.iter().zip(scores.iter()) {
            record.insert(tag.clone(), json_f64(f64::from(score)));
        }
        records.push(Value::Object(record));
    }

    let path = run_dir.join("predictions.json");
    fs::write(&path, serde_json::to_string_pretty(&Value::Array(records))?)?;
    info!(
        path = %path.display(),
        tracks = eval.predictions.len(),
        exported = (eval.predictions.len() + stride - 1) / stride,
        "web predictions written"
    );
    Ok(path)
}
