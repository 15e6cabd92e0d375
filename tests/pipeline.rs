//! End-to-end runs of the stage/epoch orchestrator over in-memory data

use candle_core::{Device, Tensor};
use tempfile::TempDir;

use tessitura::cluster::ClusterContext;
use tessitura::config::RunConfig;
use tessitura::data::{AudioDataset, Batch, InMemoryDataset, TrackEntry};
use tessitura::training::Orchestrator;

const AUDIO_LEN: usize = 960;
const N_TAGS: usize = 2;

fn tiny_config(dir: &TempDir, supervised: bool) -> RunConfig {
    RunConfig {
        id: "itest".to_string(),
        output_dir: dir.path().to_path_buf(),
        supervised,
        encoder: "shortchunk_cnn".to_string(),
        audio_length: AUDIO_LEN,
        n_classes: N_TAGS,
        batch_size: 2,
        epochs: 2,
        max_train_stages: 2,
        checkpoint_epochs: 1,
        validate_epochs: 1,
        test_epochs: 1,
        patience: 3,
        ..RunConfig::default()
    }
}

fn batch(device: &Device, supervised: bool, seed: usize) -> Batch {
    let view_a = Tensor::rand(-1.0f32, 1.0, (2, AUDIO_LEN), device).unwrap();
    let view_b = Tensor::rand(-1.0f32, 1.0, (2, AUDIO_LEN), device).unwrap();
    let labels = supervised.then(|| {
        let mut values = vec![0.0f32; 2 * N_TAGS];
        values[seed % N_TAGS] = 1.0;
        values[N_TAGS + (seed + 1) % N_TAGS] = 1.0;
        Tensor::from_vec(values, (2, N_TAGS), device).unwrap()
    });
    Batch {
        view_a,
        view_b,
        labels,
        ids: vec![format!("c{seed}a"), format!("c{seed}b")],
    }
}

fn dataset(device: &Device, supervised: bool, num_batches: usize) -> InMemoryDataset {
    let batches = (0..num_batches)
        .map(|i| batch(device, supervised, i))
        .collect();
    let tags = vec!["rock".to_string(), "jazz".to_string()];

    let tracks: Vec<TrackEntry> = (0..4)
        .map(|i| {
            let mut label = vec![0.0f32; N_TAGS];
            label[i % N_TAGS] = 1.0;
            TrackEntry {
                track_id: format!("t{i}"),
                clip_id: format!("t{i}c0"),
                segment: 0,
                path: format!("t{i}.wav"),
                label,
            }
        })
        .collect();
    let segments = (0..4)
        .map(|_| Tensor::rand(-1.0f32, 1.0, (2, AUDIO_LEN), device).unwrap())
        .collect();

    InMemoryDataset::new(batches, tags).with_tracks(tracks, segments)
}

#[test]
fn supervised_run_produces_artifacts_and_monotone_steps() {
    let dir = TempDir::new().unwrap();
    let config = tiny_config(&dir, true);
    let run_dir = config.run_dir();
    let model_name = config.model_name.clone();

    let device = Device::Cpu;
    let train = dataset(&device, true, 3);
    let validation = dataset(&device, true, 2);
    let test = dataset(&device, true, 1);

    let cluster = ClusterContext::single(device);
    let mut orchestrator = Orchestrator::new(config, cluster).unwrap();
    let report = orchestrator
        .run(&train, &validation, Some(&test))
        .unwrap();

    // two stages of up to two epochs each
    assert_eq!(report.stages_completed, 2);
    assert!(report.epochs_completed >= 2 && report.epochs_completed <= 4);
    assert!(report.best_validation_loss.is_some());

    // one optimizer step per batch, never reset across stages
    assert_eq!(
        orchestrator.solver().state().global_step,
        report.epochs_completed * train.num_batches()
    );

    // artifacts land in the run directory
    assert!(run_dir
        .join(format!("{model_name}_checkpoint_random.pt"))
        .exists());
    assert!(run_dir
        .join(format!("{model_name}_checkpoint_best.pt"))
        .exists());
    assert!(run_dir
        .join(format!("{model_name}_checkpoint_2_optim.pt"))
        .exists());
    assert!(run_dir.join("scalars.jsonl").exists());

    let results_path = report.results_path.unwrap();
    let results: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(results_path).unwrap()).unwrap();
    assert!(results.get("hparams/optimizer").is_some());
    assert!(results.get("ROC_AUC/rock").is_some());
    assert!(results.get("PR_AUC/mean").is_some());

    let predictions_path = report.predictions_path.unwrap();
    let predictions: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(predictions_path).unwrap()).unwrap();
    let records = predictions.as_array().unwrap();
    assert!(!records.is_empty());
    assert!(records[0].get("track_id").is_some());
    assert!(records[0].get("rock").is_some());
}

#[test]
fn contrastive_run_is_single_stage() {
    let dir = TempDir::new().unwrap();
    let config = tiny_config(&dir, false);

    let device = Device::Cpu;
    let train = dataset(&device, false, 2);
    let validation = dataset(&device, false, 1);

    let cluster = ClusterContext::single(device);
    let mut orchestrator = Orchestrator::new(config, cluster).unwrap();
    let report = orchestrator.run(&train, &validation, None).unwrap();

    assert_eq!(report.stages_completed, 1);
    assert!(report.results_path.is_none());
    assert!(report.final_metrics.is_none());
}

#[test]
fn second_run_resumes_from_checkpoint() {
    let dir = TempDir::new().unwrap();
    let config = tiny_config(&dir, true);

    let device = Device::Cpu;
    let train = dataset(&device, true, 2);
    let validation = dataset(&device, true, 1);

    let cluster = ClusterContext::single(device.clone());
    let mut first = Orchestrator::new(config.clone(), cluster).unwrap();
    first.run(&train, &validation, None).unwrap();

    // the final save lands on the epoch-budget tag
    let resume = RunConfig {
        reload: true,
        reload_epoch: Some(config.epochs),
        ..config
    };
    let cluster = ClusterContext::single(device);
    let mut second = Orchestrator::new(resume, cluster).unwrap();
    let report = second.run(&train, &validation, None).unwrap();
    assert!(report.epochs_completed > 0);
}

#[test]
fn two_ranks_share_barriers_and_stop_on_the_same_epoch() {
    use std::sync::Arc;
    use tessitura::cluster::{EpochBarrier, ThreadBarrier};

    let dir = TempDir::new().unwrap();
    // an absurd min_delta makes every loss after the first a non-improvement
    // on both ranks, so the stop epoch is deterministic
    let config = RunConfig {
        world_size: 2,
        epochs: 5,
        patience: 2,
        min_delta: 1e9,
        barrier_timeout_secs: 30,
        checkpoint_epochs: 5,
        ..tiny_config(&dir, false)
    };

    let barrier: Arc<dyn EpochBarrier> = Arc::new(ThreadBarrier::new(2));
    let mut handles = Vec::new();
    for rank in 0..2 {
        let config = config.clone();
        let barrier = Arc::clone(&barrier);
        handles.push(std::thread::spawn(move || {
            let device = Device::Cpu;
            let train = dataset(&device, false, 2);
            let validation = dataset(&device, false, 1);
            let cluster = ClusterContext::new(&config, rank, device)
                .unwrap()
                .with_barrier(barrier);
            let mut orchestrator = Orchestrator::new(config, cluster).unwrap();
            orchestrator
                .run(&train, &validation, None)
                .map(|report| report.epochs_completed)
        }));
    }

    let epochs: Vec<usize> = handles
        .into_iter()
        .map(|h| h.join().unwrap().unwrap())
        .collect();
    // improvement at epoch 0, two failures, stop after the third epoch
    assert_eq!(epochs, vec![3, 3]);
}

#[test]
fn warmup_only_applies_to_the_lars_path() {
    let dir = TempDir::new().unwrap();
    let adam_config = RunConfig {
        warmup_epochs: 4,
        epochs: 1,
        ..tiny_config(&dir, false)
    };
    let base_lr = adam_config.learning_rate;

    let device = Device::Cpu;
    let train = dataset(&device, false, 1);
    let validation = dataset(&device, false, 1);

    let cluster = ClusterContext::single(device.clone());
    let mut orchestrator = Orchestrator::new(adam_config, cluster).unwrap();
    orchestrator.run(&train, &validation, None).unwrap();
    // adam keeps its configured rate from epoch 0
    assert!((orchestrator.solver().optimizer().learning_rate() - base_lr).abs() < 1e-12);

    let lars_config = RunConfig {
        optimizer: "lars".to_string(),
        warmup_epochs: 4,
        epochs: 1,
        ..tiny_config(&dir, false)
    };
    let lars_base = 0.075 * (lars_config.batch_size as f64).sqrt();
    let cluster = ClusterContext::single(device);
    let mut orchestrator = Orchestrator::new(lars_config, cluster).unwrap();
    orchestrator.run(&train, &validation, None).unwrap();
    // lars spent epoch 0 at the first warmup rung
    let lr = orchestrator.solver().optimizer().learning_rate();
    assert!((lr - lars_base / 4.0).abs() < 1e-12, "got {lr}");
}

#[test]
fn empty_track_evaluation_does_not_abort_the_run() {
    let dir = TempDir::new().unwrap();
    let config = tiny_config(&dir, true);

    let device = Device::Cpu;
    let train = dataset(&device, true, 2);
    let validation = dataset(&device, true, 1);

    // every test track yields zero segments
    let tracks: Vec<TrackEntry> = (0..2)
        .map(|i| TrackEntry {
            track_id: format!("e{i}"),
            clip_id: format!("e{i}c0"),
            segment: 0,
            path: format!("e{i}.wav"),
            label: vec![1.0, 0.0],
        })
        .collect();
    let segments = (0..2)
        .map(|_| Tensor::zeros((0, AUDIO_LEN), candle_core::DType::F32, &device).unwrap())
        .collect();
    let test = InMemoryDataset::new(vec![], vec!["rock".to_string(), "jazz".to_string()])
        .with_tracks(tracks, segments);

    let cluster = ClusterContext::single(device);
    let mut orchestrator = Orchestrator::new(config, cluster).unwrap();
    let report = orchestrator.run(&train, &validation, Some(&test)).unwrap();

    assert!(report.epochs_completed > 0);
    assert!(report.final_metrics.is_none());
    assert!(report.results_path.is_none());
}

#[test]
fn checkpoint_roundtrip_reproduces_forward_outputs() {
    use tessitura::training::{build_optimizer, CheckpointManager, CheckpointTag};
    use tessitura::{build_model, Model};

    let dir = TempDir::new().unwrap();
    let config = tiny_config(&dir, true);
    let device = Device::Cpu;
    let manager = CheckpointManager::new(dir.path(), "rt").unwrap();

    let source = build_model(&config, &device).unwrap();
    let source_opt = build_optimizer(&config, source.var_map()).unwrap();
    let handle = manager
        .save(CheckpointTag::Epoch(1), &source.var_map(), source_opt.as_ref())
        .unwrap();

    // fresh model starts from different random weights
    let mut target = build_model(&config, &device).unwrap();
    let mut target_opt = build_optimizer(&config, target.var_map()).unwrap();
    let mut target_vars = target.var_map();
    manager
        .load(&handle, &mut target_vars, target_opt.as_mut())
        .unwrap();

    target.set_training(false);
    let mut reference = build_model(&config, &device).unwrap();
    reference.set_training(false);
    let mut reference_vars = reference.var_map();
    let mut reference_opt = build_optimizer(&config, reference.var_map()).unwrap();
    manager
        .load(&handle, &mut reference_vars, reference_opt.as_mut())
        .unwrap();

    let input = Tensor::rand(-1.0f32, 1.0, (2, AUDIO_LEN), &device).unwrap();
    let (_, a) = target.forward(&input).unwrap();
    let (_, b) = reference.forward(&input).unwrap();
    assert_eq!(
        a.to_vec2::<f32>().unwrap(),
        b.to_vec2::<f32>().unwrap()
    );
}

#[test]
fn missing_reload_checkpoint_is_a_config_error() {
    let dir = TempDir::new().unwrap();
    let config = RunConfig {
        reload: true,
        reload_epoch: Some(99),
        ..tiny_config(&dir, true)
    };

    let device = Device::Cpu;
    let train = dataset(&device, true, 1);
    let validation = dataset(&device, true, 1);

    let cluster = ClusterContext::single(device);
    let mut orchestrator = Orchestrator::new(config, cluster).unwrap();
    let err = orchestrator.run(&train, &validation, None).unwrap_err();
    assert!(matches!(err, tessitura::Error::Config(_)));
}
