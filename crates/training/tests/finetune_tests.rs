use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use classifier::{BackboneConfig, ClassifierConfig, ClassifierModel};
use parking_lot::Mutex;
use tempfile::tempdir;
use training::{
    launch, prepare_model, AverageMode, BlockingDataLoader, CheckpointKind, ClassificationDataset,
    CrossEntropyLoss, Example, ExperimentTracker, FreezeConfig, GradientScaler, LearningRates,
    Logger, LoggingSettings, LossFunction, LossOutput, LossScalePolicy, Precision, ProcessGroup,
    RunConfig, RunState, ShardedDataLoader, Split, Trainer, TrainingError,
};

fn backbone() -> BackboneConfig {
    BackboneConfig {
        vocab_size: 32,
        hidden_size: 8,
        num_hidden_layers: 3,
        num_attention_heads: 2,
        intermediate_size: 16,
        attention_bias: true,
        rms_norm_eps: 1e-6,
        pad_token_id: 0,
    }
}

fn build_model(device: &Device) -> Result<ClassifierModel> {
    let mut model = ClassifierModel::new(ClassifierConfig {
        backbone: backbone(),
        num_classes: 4,
        head_dropout: None,
        dtype: DType::F32,
        device: device.clone(),
        seed: 11,
    })?;
    let freeze = FreezeConfig {
        freeze_norm_layer: false,
        freeze_embedding: true,
        num_decoder_layers_to_unfreeze: 1,
    };
    prepare_model(&mut model, freeze, None)?;
    Ok(model)
}

fn dataset() -> Arc<ClassificationDataset> {
    let examples = (0..8u32)
        .map(|i| Example {
            input_ids: vec![1 + i, 2 + i, 3 + (i * 5) % 20, 4 + (i * 3) % 20],
            label: i % 4,
        })
        .collect();
    Arc::new(ClassificationDataset::new(examples, 0).unwrap())
}

fn run_config(epochs: usize, batch_size: usize, checkpoint_dir: Option<PathBuf>) -> RunConfig {
    RunConfig {
        learning_rates: LearningRates {
            base_model: 0.05,
            classifier: 0.1,
        },
        epochs,
        weight_decay: 0.0,
        beta1: 0.9,
        beta2: 0.999,
        // Large epsilon keeps updates close to linear in the gradient, so
        // float reassociation across ranks stays below the tolerance.
        epsilon: 1.0,
        weight_decay_exclude: Vec::new(),
        max_grad_norm: None,
        label_smoothing: 0.0,
        batch_size,
        checkpoint_every_n_epochs: 0,
        average: AverageMode::Macro,
        precision: Precision::Fp32,
        max_non_finite_steps: 4,
        max_overflow_steps: 4,
        log_every_n_steps: 1,
        checkpoint_dir,
    }
}

fn loader(
    data: &Arc<ClassificationDataset>,
    group: &ProcessGroup,
    device: &Device,
    batch_size: usize,
) -> Result<BlockingDataLoader<ShardedDataLoader>> {
    Ok(BlockingDataLoader::new(ShardedDataLoader::new(
        data.clone(),
        group,
        device.clone(),
        batch_size,
        false,
        7,
    )?))
}

fn snapshot(model: &ClassifierModel) -> Result<HashMap<String, Vec<f32>>> {
    model
        .state_dict()
        .into_iter()
        .map(|(name, tensor)| -> Result<(String, Vec<f32>)> {
            Ok((name, tensor.flatten_all()?.to_vec1::<f32>()?))
        })
        .collect()
}

fn max_difference(a: &HashMap<String, Vec<f32>>, b: &HashMap<String, Vec<f32>>) -> f32 {
    assert_eq!(a.len(), b.len());
    a.iter()
        .flat_map(|(name, values)| {
            values
                .iter()
                .zip(&b[name])
                .map(|(x, y)| (x - y).abs())
                .collect::<Vec<_>>()
        })
        .fold(0.0, f32::max)
}

#[test]
fn cadence_of_two_over_five_epochs_keeps_expected_checkpoints() -> Result<()> {
    let dir = tempdir()?;
    let device = Device::Cpu;
    let model = build_model(&device)?;
    let group = ProcessGroup::single();
    let data = dataset();

    let mut config = run_config(5, 4, Some(dir.path().to_path_buf()));
    config.checkpoint_every_n_epochs = 2;
    let mut trainer = Trainer::new(&model, group.clone(), config)?;
    let mut train = loader(&data, &group, &device, 4)?;
    let mut val = loader(&data, &group, &device, 4)?;

    let summary = trainer.fit(&mut train, Some(&mut val))?;

    assert_eq!(trainer.state(), RunState::Completed);
    assert_eq!(summary.completed_epochs, 5);
    assert_eq!(
        summary.checkpoints,
        vec![
            dir.path().join(CheckpointKind::Epoch(2).dir_name()),
            dir.path().join(CheckpointKind::Epoch(4).dir_name()),
            dir.path().join(CheckpointKind::Final.dir_name()),
        ]
    );
    for name in ["epoch_0002", "epoch_0004", "final"] {
        assert!(dir.path().join(name).join("manifest.json").is_file(), "{name}");
    }
    for name in ["epoch_0001", "epoch_0003", "epoch_0005"] {
        assert!(!dir.path().join(name).exists(), "{name}");
    }

    assert_eq!(summary.history.len(), 10);
    assert_eq!(summary.history[0].split, Split::Train);
    assert_eq!(summary.history[1].split, Split::Validation);
    assert!(summary.history.iter().all(|s| s.samples == 8));
    Ok(())
}

#[test]
fn two_devices_match_one_device_on_the_same_global_batch() -> Result<()> {
    let data = dataset();

    let single = {
        let device = Device::Cpu;
        let model = build_model(&device)?;
        let group = ProcessGroup::single();
        let mut trainer = Trainer::new(&model, group.clone(), run_config(2, 4, None))?;
        let mut train = loader(&data, &group, &device, 4)?;
        trainer.fit(&mut train, None)?;
        snapshot(&model)?
    };

    let replicas = launch(vec![Device::Cpu; 2], |ctx| {
        let model = build_model(&ctx.device).map_err(|e| TrainingError::runtime(e.to_string()))?;
        let mut trainer = Trainer::new(&model, ctx.group.clone(), run_config(2, 4, None))?;
        let mut train = loader(&data, &ctx.group, &ctx.device, 4)
            .map_err(|e| TrainingError::runtime(e.to_string()))?;
        trainer.fit(&mut train, None).map_err(|f| f.reason)?;
        snapshot(&model).map_err(|e| TrainingError::runtime(e.to_string()))
    })?;

    assert_eq!(replicas.len(), 2);
    assert_eq!(max_difference(&replicas[0], &replicas[1]), 0.0);
    let diff = max_difference(&single, &replicas[0]);
    assert!(diff < 1e-5, "replicas diverged from single device by {diff}");
    Ok(())
}

/// Cross entropy that reports a NaN loss for every batch.
struct PoisonedLoss {
    inner: CrossEntropyLoss,
}

impl LossFunction for PoisonedLoss {
    fn compute(&self, logits: &Tensor, labels: &Tensor) -> Result<LossOutput, TrainingError> {
        let output = self.inner.compute(logits, labels)?;
        let loss = output
            .loss
            .affine(f64::NAN, 0.0)
            .map_err(|e| TrainingError::runtime(e.to_string()))?;
        Ok(LossOutput {
            loss,
            value: f64::NAN,
        })
    }
}

#[test]
fn non_finite_losses_skip_updates() -> Result<()> {
    let device = Device::Cpu;
    let model = build_model(&device)?;
    let group = ProcessGroup::single();
    let data = dataset();
    let before = snapshot(&model)?;

    let mut trainer = Trainer::new(&model, group.clone(), run_config(1, 4, None))?
        .with_loss(Box::new(PoisonedLoss {
            inner: CrossEntropyLoss::new(),
        }));
    let mut train = loader(&data, &group, &device, 4)?;
    let summary = trainer.fit(&mut train, None)?;

    assert_eq!(summary.skipped_steps, 2);
    assert_eq!(trainer.optimizer().step_count(), 0);
    assert_eq!(max_difference(&before, &snapshot(&model)?), 0.0);
    Ok(())
}

#[test]
fn too_many_non_finite_steps_fail_the_run() -> Result<()> {
    let device = Device::Cpu;
    let model = build_model(&device)?;
    let group = ProcessGroup::single();
    let data = dataset();

    let mut config = run_config(2, 2, None);
    config.max_non_finite_steps = 1;
    let mut trainer = Trainer::new(&model, group.clone(), config)?.with_loss(Box::new(
        PoisonedLoss {
            inner: CrossEntropyLoss::new(),
        },
    ));
    let mut train = loader(&data, &group, &device, 2)?;

    let failure = trainer.fit(&mut train, None).unwrap_err();
    assert!(matches!(
        failure.reason,
        TrainingError::NumericalInstability {
            epoch: 1,
            non_finite_steps: 2,
            limit: 1
        }
    ));
    assert_eq!(failure.last_completed_epoch, None);
    assert_eq!(trainer.state(), RunState::Failed);
    Ok(())
}

/// Cross entropy whose gradients overflow while the reported loss stays finite.
struct OverflowingLoss {
    inner: CrossEntropyLoss,
}

impl LossFunction for OverflowingLoss {
    fn compute(&self, logits: &Tensor, labels: &Tensor) -> Result<LossOutput, TrainingError> {
        let output = self.inner.compute(logits, labels)?;
        let loss = output
            .loss
            .affine(f64::INFINITY, 0.0)
            .map_err(|e| TrainingError::runtime(e.to_string()))?;
        Ok(LossOutput {
            loss,
            value: output.value,
        })
    }
}

fn overflowing_trainer<'m>(
    model: &'m ClassifierModel,
    group: &ProcessGroup,
    config: RunConfig,
) -> Result<Trainer<'m>> {
    Ok(
        Trainer::new(model, group.clone(), config)?.with_loss(Box::new(OverflowingLoss {
            inner: CrossEntropyLoss::new(),
        })),
    )
}

#[test]
fn fp16_overflow_skips_updates_and_backs_off_the_scale() -> Result<()> {
    let device = Device::Cpu;
    let model = build_model(&device)?;
    let group = ProcessGroup::single();
    let data = dataset();
    let before = snapshot(&model)?;

    let mut config = run_config(1, 4, None);
    config.precision = Precision::Fp16;
    let mut trainer = overflowing_trainer(&model, &group, config)?;
    assert_eq!(trainer.scaler().loss_scale(), 32768.0);
    let mut train = loader(&data, &group, &device, 4)?;
    let summary = trainer.fit(&mut train, None)?;

    assert_eq!(summary.skipped_steps, 2);
    assert_eq!(trainer.optimizer().step_count(), 0);
    assert_eq!(trainer.scaler().loss_scale(), 8192.0);
    assert_eq!(max_difference(&before, &snapshot(&model)?), 0.0);
    Ok(())
}

#[test]
fn mixed_precision_overflow_past_the_limit_fails_the_run() -> Result<()> {
    let device = Device::Cpu;
    let model = build_model(&device)?;
    let group = ProcessGroup::single();
    let data = dataset();

    let mut config = run_config(2, 4, None);
    config.precision = Precision::Mixed;
    config.max_overflow_steps = 1;
    let mut trainer = overflowing_trainer(&model, &group, config)?;
    let mut train = loader(&data, &group, &device, 4)?;

    let failure = trainer.fit(&mut train, None).unwrap_err();
    assert!(matches!(
        failure.reason,
        TrainingError::NumericalInstability {
            epoch: 1,
            non_finite_steps: 2,
            limit: 1
        }
    ));
    assert_eq!(failure.last_completed_epoch, None);
    assert_eq!(trainer.state(), RunState::Failed);
    assert_eq!(trainer.optimizer().step_count(), 0);
    Ok(())
}

#[test]
fn overflow_at_the_scale_floor_counts_as_non_finite() -> Result<()> {
    let device = Device::Cpu;
    let model = build_model(&device)?;
    let group = ProcessGroup::single();
    let data = dataset();

    let mut config = run_config(1, 4, None);
    config.precision = Precision::Fp16;
    config.max_non_finite_steps = 0;
    let floor = LossScalePolicy {
        initial_scale: 1.0,
        min_scale: 1.0,
        ..LossScalePolicy::default()
    };
    let mut trainer = overflowing_trainer(&model, &group, config)?
        .with_scaler(GradientScaler::with_policy(floor, Precision::Fp16)?);
    let mut train = loader(&data, &group, &device, 4)?;

    let failure = trainer.fit(&mut train, None).unwrap_err();
    assert!(matches!(
        failure.reason,
        TrainingError::NumericalInstability {
            epoch: 1,
            non_finite_steps: 1,
            limit: 0
        }
    ));
    assert_eq!(trainer.scaler().loss_scale(), 1.0);
    Ok(())
}

#[test]
fn resuming_from_an_epoch_checkpoint_reproduces_the_uninterrupted_run() -> Result<()> {
    let dir = tempdir()?;
    let device = Device::Cpu;
    let group = ProcessGroup::single();
    let data = dataset();

    let mut config = run_config(2, 4, Some(dir.path().to_path_buf()));
    config.checkpoint_every_n_epochs = 1;

    let uninterrupted = {
        let model = build_model(&device)?;
        let mut trainer = Trainer::new(&model, group.clone(), config.clone())?;
        let mut train = loader(&data, &group, &device, 4)?;
        trainer.fit(&mut train, None)?;
        snapshot(&model)?
    };

    let model = build_model(&device)?;
    let mut trainer = Trainer::new(&model, group.clone(), config)?;
    let next = trainer.resume_from(&dir.path().join("epoch_0001"))?;
    assert_eq!(next, 2);
    assert_eq!(trainer.last_completed_epoch(), Some(1));

    let mut train = loader(&data, &group, &device, 4)?;
    let summary = trainer.fit(&mut train, None)?;

    assert_eq!(summary.history.len(), 1);
    assert_eq!(summary.history[0].epoch, 2);
    assert_eq!(summary.completed_epochs, 2);
    assert_eq!(trainer.optimizer().step_count(), 4);
    let diff = max_difference(&uninterrupted, &snapshot(&model)?);
    assert!(diff < 1e-6, "resumed run diverged by {diff}");
    Ok(())
}

#[derive(Default)]
struct Recorded {
    inits: usize,
    finishes: usize,
    scalars: Vec<(usize, String, f64)>,
}

struct RecordingTracker {
    records: Arc<Mutex<Recorded>>,
}

impl ExperimentTracker for RecordingTracker {
    fn init(&mut self, _config: &serde_json::Value) -> Result<(), TrainingError> {
        self.records.lock().inits += 1;
        Ok(())
    }

    fn log(&mut self, step: usize, scalars: &[(String, f64)]) -> Result<(), TrainingError> {
        let mut records = self.records.lock();
        for (name, value) in scalars {
            records.scalars.push((step, name.clone(), *value));
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<(), TrainingError> {
        self.records.lock().finishes += 1;
        Ok(())
    }
}

#[test]
fn only_the_coordinator_reports_to_the_tracker() -> Result<()> {
    let data = dataset();
    let records = Arc::new(Mutex::new(Recorded::default()));

    launch(vec![Device::Cpu; 2], |ctx| {
        let model = build_model(&ctx.device).map_err(|e| TrainingError::runtime(e.to_string()))?;
        let tracker = RecordingTracker {
            records: records.clone(),
        };
        let mut trainer = Trainer::new(&model, ctx.group.clone(), run_config(1, 4, None))?
            .with_logger(Logger::with_tracker(
                LoggingSettings::silent(),
                Box::new(tracker),
            ));
        let mut train = loader(&data, &ctx.group, &ctx.device, 4)
            .map_err(|e| TrainingError::runtime(e.to_string()))?;
        trainer.fit(&mut train, None).map_err(|f| f.reason)?;
        Ok(())
    })?;

    let records = records.lock();
    assert_eq!(records.inits, 1);
    assert_eq!(records.finishes, 1);
    let step_losses = records
        .scalars
        .iter()
        .filter(|(_, name, _)| name == "train/step_loss")
        .count();
    assert_eq!(step_losses, 2);
    let epoch_losses: Vec<_> = records
        .scalars
        .iter()
        .filter(|(_, name, _)| name == "train_loss")
        .collect();
    assert_eq!(epoch_losses.len(), 1);
    assert_eq!(epoch_losses[0].0, 2);
    Ok(())
}

/// Real gradients, but a fixed reported loss value per rank.
struct FixedValueLoss {
    inner: CrossEntropyLoss,
    value: f64,
}

impl LossFunction for FixedValueLoss {
    fn compute(&self, logits: &Tensor, labels: &Tensor) -> Result<LossOutput, TrainingError> {
        let output = self.inner.compute(logits, labels)?;
        Ok(LossOutput {
            loss: output.loss,
            value: self.value,
        })
    }
}

#[test]
fn logged_step_loss_ignores_ranks_without_genuine_rows() -> Result<()> {
    let examples = (0..5u32)
        .map(|i| Example {
            input_ids: vec![1 + i, 2 + i, 3 + i],
            label: i % 4,
        })
        .collect();
    let data = Arc::new(ClassificationDataset::new(examples, 0)?);
    let records = Arc::new(Mutex::new(Recorded::default()));

    launch(vec![Device::Cpu; 2], |ctx| {
        let model = build_model(&ctx.device).map_err(|e| TrainingError::runtime(e.to_string()))?;
        let tracker = RecordingTracker {
            records: records.clone(),
        };
        let mut trainer = Trainer::new(&model, ctx.group.clone(), run_config(1, 4, None))?
            .with_loss(Box::new(FixedValueLoss {
                inner: CrossEntropyLoss::new(),
                value: 1.0 + 10.0 * ctx.group.rank() as f64,
            }))
            .with_logger(Logger::with_tracker(
                LoggingSettings::silent(),
                Box::new(tracker),
            ));
        let mut train = loader(&data, &ctx.group, &ctx.device, 4)
            .map_err(|e| TrainingError::runtime(e.to_string()))?;
        trainer.fit(&mut train, None).map_err(|f| f.reason)?;
        Ok(())
    })?;

    let records = records.lock();
    let step_losses: Vec<f64> = records
        .scalars
        .iter()
        .filter(|(_, name, _)| name == "train/step_loss")
        .map(|(_, _, value)| *value)
        .collect();
    // Second step: rank 0 holds the one genuine row, rank 1 only wrapped rows.
    assert_eq!(step_losses, vec![6.0, 1.0]);
    Ok(())
}

#[test]
fn a_failing_rank_aborts_its_peers() {
    let data = dataset();
    let peer_saw_communication_error = AtomicBool::new(false);

    let err = launch(vec![Device::Cpu; 2], |ctx| {
        if ctx.group.rank() == 1 {
            return Err::<(), _>(TrainingError::configuration("rank 1 could not open its device"));
        }
        let model = build_model(&ctx.device).map_err(|e| TrainingError::runtime(e.to_string()))?;
        let mut trainer = Trainer::new(&model, ctx.group.clone(), run_config(1, 4, None))?;
        let mut train = loader(&data, &ctx.group, &ctx.device, 4)
            .map_err(|e| TrainingError::runtime(e.to_string()))?;
        let failure = trainer.fit(&mut train, None).unwrap_err();
        peer_saw_communication_error.store(failure.reason.is_communication(), Ordering::SeqCst);
        assert_eq!(trainer.state(), RunState::Failed);
        Err(failure.reason)
    })
    .unwrap_err();

    assert!(matches!(err, TrainingError::Configuration(_)), "{err}");
    assert!(peer_saw_communication_error.load(Ordering::SeqCst));
}

#[test]
fn frozen_parameters_are_untouched_by_training() -> Result<()> {
    let device = Device::Cpu;
    let model = build_model(&device)?;
    let group = ProcessGroup::single();
    let data = dataset();
    let before = snapshot(&model)?;

    let mut trainer = Trainer::new(&model, group.clone(), run_config(1, 4, None))?;
    let mut train = loader(&data, &group, &device, 4)?;
    trainer.fit(&mut train, None)?;
    let after = snapshot(&model)?;

    let mut trainable_changed = 0;
    for id in model.registry().ids() {
        let name = id.path();
        let moved = before[&name] != after[&name];
        if model.partition().contains(id) {
            trainable_changed += usize::from(moved);
        } else {
            assert!(!moved, "frozen parameter {name} changed");
        }
    }
    assert!(before["head.weight"] != after["head.weight"]);
    assert!(trainable_changed > 1);
    Ok(())
}
