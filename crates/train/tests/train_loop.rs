//! End-to-end runs of the training loop on tiny token files.

use std::path::{Path, PathBuf};

use candle_core::Device;

use charrnn_common::{write_token_file, DataLoader, LayerType, ModelConfig, SplitTokens};
use charrnn_core::LanguageModel;
use charrnn_train::{Phase, TrainConfig, TrainEvent, TrainingLoop};

fn token_file(dir: &Path, train: usize, val: usize) -> PathBuf {
    let cycle = |n: usize| (0..n).map(|i| (i % 4) as u32 + 1).collect::<Vec<_>>();
    let splits = SplitTokens {
        train: cycle(train),
        val: cycle(val),
        test: Vec::new(),
    };
    let path = dir.join("data.tokens");
    write_token_file(&path, &splits).unwrap();
    path
}

fn model(layer_type: LayerType) -> LanguageModel {
    let config = ModelConfig {
        vocab_size: 5,
        layer_type,
        num_layers: 1,
        embedding_dim: 8,
        hidden_dim: 16,
        ..Default::default()
    };
    LanguageModel::new(&config, &Device::Cpu).unwrap()
}

fn config(num_epochs: usize) -> TrainConfig {
    TrainConfig {
        num_epochs,
        learning_rate: 1e-2,
        lrdecay_every: 2,
        lrdecay_factor: 0.5,
        print_every: 1,
        checkpoint_dir: None,
    }
}

#[test]
fn single_epoch_scenario() {
    let dir = tempfile::tempdir().unwrap();
    // 4 training sequences of length 4, one validation batch.
    let path = token_file(dir.path(), 17, 9);
    let mut loader = DataLoader::open(&path, 2, 4, 0, 0).unwrap();

    let mut trainer = TrainingLoop::new(model(LayerType::GridGru), config(1)).unwrap();
    assert_eq!(trainer.phase(), Phase::Idle);
    let mut events: Vec<TrainEvent> = Vec::new();
    let summary = trainer.run(&mut loader, &mut events).unwrap();

    let train_iters: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            TrainEvent::TrainIter(s) => Some(s),
            _ => None,
        })
        .collect();
    assert_eq!(train_iters.len(), 2);
    assert!(train_iters.iter().all(|s| s.batch_count == 2));

    let epoch_lines = events
        .iter()
        .filter(|e| matches!(e, TrainEvent::TrainEpoch { epoch: 0, .. }))
        .count();
    assert_eq!(epoch_lines, 1);

    assert_eq!(summary.val_history.values().len(), 1);
    assert_eq!(summary.val_history.values()[0].0, 0);
    assert_eq!(summary.train_losses.len(), 1);
    assert!(matches!(events.first(), Some(TrainEvent::ModelBuilt { .. })));
    assert_eq!(trainer.phase(), Phase::Done);
}

#[test]
fn phases_follow_each_iteration() {
    let dir = tempfile::tempdir().unwrap();
    let path = token_file(dir.path(), 21, 13);
    // Context 4: 4 train sequences (2 batches), 2 val sequences (1 batch).
    let mut loader = DataLoader::open(&path, 2, 4, 4, 0).unwrap();
    let mut trainer = TrainingLoop::new(
        model(LayerType::Gru),
        TrainConfig {
            print_every: 0,
            ..config(1)
        },
    )
    .unwrap();
    let mut phases = Vec::new();
    let mut sink = |e: &TrainEvent| {
        if let TrainEvent::PhaseEntered(p) = e {
            phases.push(*p);
        }
    };
    trainer.run(&mut loader, &mut sink).unwrap();

    let step = [
        Phase::PreContext,
        Phase::Forward,
        Phase::Backward,
        Phase::OptimizerStep,
    ];
    let mut expected = Vec::new();
    expected.extend(step);
    expected.extend(step);
    expected.extend([Phase::Validating, Phase::Idle, Phase::Done]);
    assert_eq!(phases, expected);
}

#[test]
fn mean_epoch_loss_is_mean_of_iterations() {
    let dir = tempfile::tempdir().unwrap();
    let path = token_file(dir.path(), 17, 9);
    let mut loader = DataLoader::open(&path, 2, 4, 0, 0).unwrap();
    let mut trainer = TrainingLoop::new(model(LayerType::Gru), config(1)).unwrap();
    let mut events: Vec<TrainEvent> = Vec::new();
    let summary = trainer.run(&mut loader, &mut events).unwrap();

    let losses: Vec<f64> = events
        .iter()
        .filter_map(|e| match e {
            TrainEvent::TrainIter(s) => Some(s.loss),
            _ => None,
        })
        .collect();
    let mean = losses.iter().sum::<f64>() / losses.len() as f64;
    assert!((summary.train_losses[0] - mean).abs() < 1e-9);
}

#[test]
fn history_schedule_and_moving_average_across_epochs() {
    let dir = tempfile::tempdir().unwrap();
    let path = token_file(dir.path(), 65, 17);
    let mut loader = DataLoader::open(&path, 2, 4, 4, 3).unwrap();
    let mut trainer = TrainingLoop::new(model(LayerType::Lstm), config(5)).unwrap();
    let mut events: Vec<TrainEvent> = Vec::new();
    let summary = trainer.run(&mut loader, &mut events).unwrap();

    let epochs: Vec<usize> = summary.val_history.values().iter().map(|p| p.0).collect();
    assert_eq!(epochs, vec![0, 1, 2, 3, 4]);

    for s in events.iter().filter_map(|e| match e {
        TrainEvent::TrainIter(s) => Some(s),
        _ => None,
    }) {
        let expected_lr = 1e-2 * 0.5f64.powi((s.epoch / 2) as i32);
        assert!((s.lr - expected_lr).abs() < 1e-12, "epoch {}", s.epoch);
        if s.iter == 0 {
            // First iteration of an epoch: nothing from earlier epochs.
            assert!((s.avg_loss - s.loss).abs() < 1e-12, "epoch {}", s.epoch);
        }
    }
    // ⌊5 / 2⌋ = 2 drops.
    assert!((summary.final_lr - 2.5e-3).abs() < 1e-12);
}

#[test]
fn training_reduces_loss_on_a_repeating_pattern() {
    let dir = tempfile::tempdir().unwrap();
    let path = token_file(dir.path(), 201, 65);
    let mut loader = DataLoader::open(&path, 4, 8, 0, 7).unwrap();
    let mut trainer = TrainingLoop::new(
        model(LayerType::Gru),
        TrainConfig {
            num_epochs: 8,
            learning_rate: 2e-2,
            lrdecay_every: 0,
            print_every: 0,
            ..Default::default()
        },
    )
    .unwrap();
    let mut events: Vec<TrainEvent> = Vec::new();
    let summary = trainer.run(&mut loader, &mut events).unwrap();

    assert!(events.iter().all(|e| !matches!(e, TrainEvent::TrainIter(_))));
    let first = summary.train_losses[0];
    let last = *summary.train_losses.last().unwrap();
    assert!(last < first, "loss went from {first} to {last}");
}

#[test]
fn checkpoints_are_written_per_epoch() {
    let dir = tempfile::tempdir().unwrap();
    let path = token_file(dir.path(), 17, 9);
    let ckpt = dir.path().join("ckpt");
    let mut loader = DataLoader::open(&path, 2, 4, 0, 0).unwrap();
    let mut trainer = TrainingLoop::new(
        model(LayerType::Gru),
        TrainConfig {
            checkpoint_dir: Some(ckpt.clone()),
            ..config(2)
        },
    )
    .unwrap();
    let mut saved = Vec::new();
    let mut sink = |e: &TrainEvent| {
        if let TrainEvent::CheckpointSaved { path, .. } = e {
            saved.push(path.clone());
        }
    };
    trainer.run(&mut loader, &mut sink).unwrap();

    assert_eq!(
        saved,
        vec![
            ckpt.join("checkpoint-0.safetensors"),
            ckpt.join("checkpoint-1.safetensors")
        ]
    );
    assert!(saved.iter().all(|p| p.exists()));
    assert!(ckpt.join("config.json").exists());
}

#[test]
fn too_small_validation_split_fails_before_training() {
    let dir = tempfile::tempdir().unwrap();
    let path = token_file(dir.path(), 17, 3);
    let mut loader = DataLoader::open(&path, 2, 4, 0, 0).unwrap();
    let mut trainer = TrainingLoop::new(model(LayerType::Gru), config(1)).unwrap();
    let mut events: Vec<TrainEvent> = Vec::new();
    assert!(trainer.run(&mut loader, &mut events).is_err());
    assert!(events.is_empty());
}
