//! Epoch/step orchestration for one data-parallel worker.
//!
//! Every rank runs the same [`Trainer`] over its own model replica. A
//! training step performs exactly one collective, which carries the step's
//! health flags, its loss and the flattened gradients, so all ranks reach
//! the same skip/apply/stop decision and apply identical updates.

use std::path::{Path, PathBuf};

use candle_core::{backprop::GradStore, DType, Tensor, Var};
use classifier::{ClassifierModel, ParamId};
use serde::{Deserialize, Serialize};

use crate::{
    checkpoint::{fingerprint_config, load_checkpoint, CheckpointKind, CheckpointManager, CheckpointState},
    config::Precision,
    data::{BlockingDataLoader, DataLoader},
    distributed::ProcessGroup,
    error::{to_runtime_error, RunFailure},
    logging::Logger,
    loss::{CrossEntropyLoss, LossFunction},
    metrics::{
        predictions_from_logits, AverageMode, EpochSummary, ExponentialMovingAverage,
        MetricAggregator, Split,
    },
    optimizer::{
        AdamWConfig, GradientScaler, ParamGroup, ScaleAdjustment, TrainerOptimizer,
        TrainerOptimizerOptions,
    },
    TrainingError,
};

pub const BASE_MODEL_GROUP: &str = "base_model";
pub const CLASSIFIER_GROUP: &str = "classifier";

const FLAG_NON_FINITE: usize = 0;
const FLAG_OVERFLOW: usize = 1;
const FLAG_STOP: usize = 2;
/// Loss summed over genuine rows.
const SLOT_LOSS: usize = 3;
const SLOT_ROWS: usize = 4;
const HEADER_LEN: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LearningRates {
    /// Trunk and adapter parameters.
    pub base_model: f64,
    /// Classification head parameters.
    pub classifier: f64,
}

/// Immutable parameters of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    pub learning_rates: LearningRates,
    pub epochs: usize,
    pub weight_decay: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub epsilon: f64,
    pub weight_decay_exclude: Vec<String>,
    pub max_grad_norm: Option<f64>,
    pub label_smoothing: f32,
    /// Global batch size; each rank sees `batch_size / world_size` rows.
    pub batch_size: usize,
    /// Periodic save cadence in epochs; 0 keeps only the final save.
    pub checkpoint_every_n_epochs: usize,
    pub average: AverageMode,
    pub precision: Precision,
    /// Non-finite steps tolerated per epoch before the run fails. An
    /// overflow with the loss scale already at its floor counts as one.
    pub max_non_finite_steps: usize,
    /// Loss-scale overflow steps tolerated per epoch before the run fails.
    pub max_overflow_steps: usize,
    pub log_every_n_steps: usize,
    pub checkpoint_dir: Option<PathBuf>,
}

impl RunConfig {
    /// Checkpoint slots written after `epoch` (1-based).
    pub fn checkpoints_after(&self, epoch: usize) -> Vec<CheckpointKind> {
        let mut kinds = Vec::new();
        if self.checkpoint_every_n_epochs > 0 && epoch % self.checkpoint_every_n_epochs == 0 {
            kinds.push(CheckpointKind::Epoch(epoch));
        }
        if epoch == self.epochs {
            kinds.push(CheckpointKind::Final);
        }
        kinds
    }

    fn validate(&self, world_size: usize) -> Result<(), TrainingError> {
        if self.epochs == 0 {
            return Err(TrainingError::configuration("epoch count must be positive"));
        }
        if self.batch_size == 0 || self.batch_size % world_size != 0 {
            return Err(TrainingError::configuration(format!(
                "global batch size {} cannot be split across {world_size} devices",
                self.batch_size
            )));
        }
        if self.log_every_n_steps == 0 {
            return Err(TrainingError::configuration(
                "log_every_n_steps must be greater than 0",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Initialized,
    /// Inside the given 1-based epoch.
    Epoch(usize),
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    /// Train and validation summaries in the order they were produced.
    pub history: Vec<EpochSummary>,
    /// Checkpoint directories written by this rank (empty off the coordinator).
    pub checkpoints: Vec<PathBuf>,
    pub completed_epochs: usize,
    pub stopped_early: bool,
    pub skipped_steps: usize,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum StepOutcome {
    Applied { loss: f64 },
    SkippedNonFinite,
    /// `saturated` when the scale could not back off any further.
    SkippedOverflow { saturated: bool },
}

struct TrainableParam {
    id: ParamId,
    var: Var,
}

pub struct Trainer<'m> {
    model: &'m ClassifierModel,
    group: ProcessGroup,
    config: RunConfig,
    optimizer: TrainerOptimizer,
    scaler: GradientScaler,
    loss: Box<dyn LossFunction>,
    logger: Logger,
    tracker_config: serde_json::Value,
    checkpoints: Option<CheckpointManager>,
    metrics: MetricAggregator,
    params: Vec<TrainableParam>,
    gradient_len: usize,
    state: RunState,
    next_epoch: usize,
    last_completed_epoch: Option<usize>,
    global_step: usize,
    skipped_steps: usize,
    loss_ema: ExponentialMovingAverage,
}

impl<'m> Trainer<'m> {
    /// Builds the optimizer over the model's installed trainable partition.
    pub fn new(
        model: &'m ClassifierModel,
        group: ProcessGroup,
        config: RunConfig,
    ) -> Result<Self, TrainingError> {
        config.validate(group.world_size())?;

        let params: Vec<TrainableParam> = model
            .trainable_parameters()
            .into_iter()
            .map(|(id, var)| TrainableParam { id, var })
            .collect();
        let (head, base): (Vec<&TrainableParam>, Vec<&TrainableParam>) =
            params.iter().partition(|p| p.id.is_head());
        let named = |items: Vec<&TrainableParam>| {
            items
                .into_iter()
                .map(|p| (p.id.path(), p.var.clone()))
                .collect::<Vec<_>>()
        };
        let optimizer = TrainerOptimizer::new(
            vec![
                ParamGroup {
                    name: BASE_MODEL_GROUP.to_string(),
                    learning_rate: config.learning_rates.base_model,
                    params: named(base),
                },
                ParamGroup {
                    name: CLASSIFIER_GROUP.to_string(),
                    learning_rate: config.learning_rates.classifier,
                    params: named(head),
                },
            ],
            AdamWConfig {
                beta1: config.beta1,
                beta2: config.beta2,
                epsilon: config.epsilon,
                weight_decay: config.weight_decay,
            },
            TrainerOptimizerOptions {
                clip_global_norm: config.max_grad_norm,
                weight_decay_exclude: config.weight_decay_exclude.clone(),
            },
        )?;
        let gradient_len = params
            .iter()
            .map(|p| p.var.as_tensor().elem_count())
            .sum();

        let loss = CrossEntropyLoss::new().with_label_smoothing(config.label_smoothing)?;
        let checkpoints = match &config.checkpoint_dir {
            Some(dir) => Some(CheckpointManager::new(dir, fingerprint_config(&config)?)),
            None => None,
        };
        let tracker_config = serde_json::to_value(&config)?;

        Ok(Self {
            model,
            scaler: GradientScaler::new(config.precision),
            metrics: MetricAggregator::new(model.num_classes(), config.average),
            group,
            optimizer,
            loss: Box::new(loss),
            logger: Logger::disabled(),
            tracker_config,
            checkpoints,
            params,
            gradient_len,
            state: RunState::Initialized,
            next_epoch: 1,
            last_completed_epoch: None,
            global_step: 0,
            skipped_steps: 0,
            loss_ema: ExponentialMovingAverage::new(0.1),
            config,
        })
    }

    pub fn with_loss(mut self, loss: Box<dyn LossFunction>) -> Self {
        self.loss = loss;
        self
    }

    /// Installs console/tracker output. Ignored off the coordinator.
    pub fn with_logger(mut self, logger: Logger) -> Self {
        if self.group.is_coordinator() {
            self.logger = logger;
        }
        self
    }

    /// Configuration handed to the tracker's `init`; defaults to the run config.
    pub fn with_tracker_config(mut self, config: serde_json::Value) -> Self {
        self.tracker_config = config;
        self
    }

    /// Replaces the default loss scaler, e.g. with a custom policy.
    pub fn with_scaler(mut self, scaler: GradientScaler) -> Self {
        self.scaler = scaler;
        self
    }

    pub fn with_checkpoint_manager(mut self, manager: CheckpointManager) -> Self {
        self.checkpoints = Some(manager);
        self
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn optimizer(&self) -> &TrainerOptimizer {
        &self.optimizer
    }

    pub fn scaler(&self) -> &GradientScaler {
        &self.scaler
    }

    pub fn last_completed_epoch(&self) -> Option<usize> {
        self.last_completed_epoch
    }

    /// Restores model, optimizer and scaler state from a checkpoint directory
    /// and returns the epoch training continues with. Every rank reads the
    /// checkpoint itself.
    pub fn resume_from(&mut self, directory: &Path) -> Result<usize, TrainingError> {
        let (manifest, state) = load_checkpoint(directory, self.model.device())?;
        if manifest.config_sha256 != fingerprint_config(&self.config)? {
            log::warn!(
                "checkpoint {} was written with a different run configuration",
                directory.display()
            );
        }
        let epoch = state.epoch;
        state
            .restore(self.model, &mut self.optimizer, &mut self.scaler)
            .map_err(|err| TrainingError::checkpoint_io(directory, err.to_string()))?;

        self.last_completed_epoch = Some(epoch);
        self.next_epoch = epoch + 1;
        self.global_step = self.optimizer.step_count();
        if self.group.is_coordinator() {
            log::info!(
                "resumed from {} after epoch {epoch}",
                directory.display()
            );
        }
        Ok(self.next_epoch)
    }

    pub fn fit<L: DataLoader>(
        &mut self,
        train: &mut BlockingDataLoader<L>,
        validation: Option<&mut BlockingDataLoader<L>>,
    ) -> Result<RunSummary, RunFailure> {
        self.fit_with_shutdown(train, validation, || false)
    }

    /// Runs the remaining epochs. `should_stop` is polled between steps; a
    /// request on any rank stops every rank after the same step.
    pub fn fit_with_shutdown<L, F>(
        &mut self,
        train: &mut BlockingDataLoader<L>,
        mut validation: Option<&mut BlockingDataLoader<L>>,
        mut should_stop: F,
    ) -> Result<RunSummary, RunFailure>
    where
        L: DataLoader,
        F: FnMut() -> bool,
    {
        if self.group.is_coordinator() {
            let config = self.tracker_config.clone();
            self.logger.init(&config);
        }
        let outcome = self.run(train, validation.as_deref_mut(), &mut should_stop);
        if self.group.is_coordinator() {
            self.logger.finish();
        }
        self.model.set_training(false);

        match outcome {
            Ok(summary) => {
                self.state = RunState::Completed;
                Ok(summary)
            }
            Err(reason) => {
                self.state = RunState::Failed;
                self.group.abort(reason.to_string());
                log::error!(
                    "rank {} failed after epoch {:?}: {reason}",
                    self.group.rank(),
                    self.last_completed_epoch
                );
                Err(RunFailure {
                    reason,
                    last_completed_epoch: self.last_completed_epoch,
                })
            }
        }
    }

    fn run<L, F>(
        &mut self,
        train: &mut BlockingDataLoader<L>,
        mut validation: Option<&mut BlockingDataLoader<L>>,
        should_stop: &mut F,
    ) -> Result<RunSummary, TrainingError>
    where
        L: DataLoader,
        F: FnMut() -> bool,
    {
        let mut summary = RunSummary {
            history: Vec::new(),
            checkpoints: Vec::new(),
            completed_epochs: self.last_completed_epoch.unwrap_or(0),
            stopped_early: false,
            skipped_steps: 0,
        };
        if self.group.is_coordinator() {
            log::info!(
                "training epochs {}..={} on {} device(s), global batch {}",
                self.next_epoch,
                self.config.epochs,
                self.group.world_size(),
                self.config.batch_size
            );
        }

        for epoch in self.next_epoch..=self.config.epochs {
            self.state = RunState::Epoch(epoch);

            let (train_summary, stopped) = self.train_epoch(epoch, train, should_stop)?;
            self.report(&train_summary);
            summary.history.push(train_summary);
            if stopped {
                summary.stopped_early = true;
                if self.group.is_coordinator() {
                    log::warn!("stop requested during epoch {epoch}; leaving without a checkpoint");
                }
                break;
            }

            if let Some(loader) = validation.as_deref_mut() {
                let val_summary = self.validate(epoch, loader)?;
                self.report(&val_summary);
                summary.history.push(val_summary);
            }

            for kind in self.config.checkpoints_after(epoch) {
                if let Some(path) = self.save_checkpoint(kind, epoch)? {
                    summary.checkpoints.push(path);
                }
            }

            self.last_completed_epoch = Some(epoch);
            self.next_epoch = epoch + 1;
            summary.completed_epochs = epoch;
        }

        summary.skipped_steps = self.skipped_steps;
        Ok(summary)
    }

    fn train_epoch<L, F>(
        &mut self,
        epoch: usize,
        loader: &mut BlockingDataLoader<L>,
        should_stop: &mut F,
    ) -> Result<(EpochSummary, bool), TrainingError>
    where
        L: DataLoader,
        F: FnMut() -> bool,
    {
        self.model.set_training(true);
        self.metrics.reset(epoch, Split::Train);
        loader.start_epoch(epoch)?;

        let mut non_finite_steps = 0;
        let mut overflow_steps = 0;
        let mut stopped = false;
        while let Some(batch) = loader.next_batch()? {
            let (outcome, stop) = self.train_step(&batch, should_stop())?;
            self.global_step += 1;

            match outcome {
                StepOutcome::Applied { loss } => {
                    let smoothed = self.loss_ema.update(loss);
                    if self.group.is_coordinator()
                        && self.global_step % self.config.log_every_n_steps == 0
                    {
                        let rates = self.optimizer.learning_rates();
                        self.logger.log_training_step(
                            self.global_step,
                            loss,
                            smoothed,
                            &rates,
                            self.scaler.loss_scale(),
                        );
                    }
                }
                StepOutcome::SkippedNonFinite => {
                    self.skipped_steps += 1;
                    non_finite_steps += 1;
                    self.check_non_finite(epoch, batch.step, non_finite_steps)?;
                }
                StepOutcome::SkippedOverflow { saturated } => {
                    self.skipped_steps += 1;
                    overflow_steps += 1;
                    if self.group.is_coordinator() {
                        log::debug!(
                            "gradient overflow at step {}; loss scale now {}",
                            self.global_step,
                            self.scaler.loss_scale()
                        );
                    }
                    if saturated {
                        non_finite_steps += 1;
                        self.check_non_finite(epoch, batch.step, non_finite_steps)?;
                    }
                    if overflow_steps > self.config.max_overflow_steps {
                        return Err(TrainingError::NumericalInstability {
                            epoch,
                            non_finite_steps: overflow_steps,
                            limit: self.config.max_overflow_steps,
                        });
                    }
                }
            }

            if stop {
                stopped = true;
                break;
            }
        }

        self.metrics.reduce(&self.group)?;
        Ok((self.metrics.summarize(), stopped))
    }

    fn check_non_finite(
        &self,
        epoch: usize,
        step: usize,
        non_finite_steps: usize,
    ) -> Result<(), TrainingError> {
        let limit = self.config.max_non_finite_steps;
        if self.group.is_coordinator() {
            log::warn!(
                "epoch {epoch} step {step}: non-finite loss or gradient, update skipped ({non_finite_steps}/{limit})"
            );
        }
        if non_finite_steps > limit {
            return Err(TrainingError::NumericalInstability {
                epoch,
                non_finite_steps,
                limit,
            });
        }
        Ok(())
    }

    /// Forward, backward and the synchronized update for one shard.
    fn train_step(
        &mut self,
        batch: &crate::data::Batch,
        stop_requested: bool,
    ) -> Result<(StepOutcome, bool), TrainingError> {
        let logits = self
            .model
            .forward(&batch.input_ids, &batch.attention_mask)
            .map_err(to_runtime_error)?;
        let output = self.loss.compute(&logits, &batch.labels)?;

        let mut buffer = vec![0.0f64; HEADER_LEN + self.params.len() + self.gradient_len];
        buffer[FLAG_STOP] = f64::from(u8::from(stop_requested));

        let mut grads: Option<GradStore> = None;
        if output.is_finite() {
            let predictions = predictions_from_logits(&logits)?;
            let labels = batch.labels.to_vec1::<u32>().map_err(to_runtime_error)?;
            let valid = batch.valid_rows.min(labels.len());
            self.metrics
                .record(&predictions[..valid], &labels[..valid])?;
            self.metrics.record_loss(output.value, valid);

            let scaled = self.scaler.scale(&output.loss)?;
            let mut store = scaled.backward().map_err(to_runtime_error)?;
            let finite = self.flatten_gradients(&mut store, &mut buffer[HEADER_LEN..])?;
            if !finite {
                let flag = if self.scaler.is_enabled() {
                    FLAG_OVERFLOW
                } else {
                    FLAG_NON_FINITE
                };
                buffer[flag] = 1.0;
            }
            buffer[SLOT_LOSS] = output.value * valid as f64;
            buffer[SLOT_ROWS] = valid as f64;
            grads = Some(store);
        } else {
            buffer[FLAG_NON_FINITE] = 1.0;
        }

        self.group.all_reduce_sum(&mut buffer)?;
        let stop = buffer[FLAG_STOP] > 0.0;

        if buffer[FLAG_NON_FINITE] > 0.0 {
            return Ok((StepOutcome::SkippedNonFinite, stop));
        }
        if buffer[FLAG_OVERFLOW] > 0.0 {
            let saturated = self.scaler.update(true) == ScaleAdjustment::Saturated;
            return Ok((StepOutcome::SkippedOverflow { saturated }, stop));
        }
        let Some(mut store) = grads else {
            return Err(TrainingError::runtime(
                "gradient store missing for a step every rank reported as finite",
            ));
        };

        let world = self.group.world_size() as f64;
        self.install_averaged_gradients(&mut store, &buffer[HEADER_LEN..], world)?;
        self.optimizer.step(&mut store)?;
        self.scaler.update(false);

        let rows = buffer[SLOT_ROWS];
        let loss = if rows > 0.0 {
            buffer[SLOT_LOSS] / rows
        } else {
            0.0
        };
        Ok((StepOutcome::Applied { loss }, stop))
    }

    /// Writes presence flags and unscaled F32 gradients into `out`, in
    /// parameter order. Returns whether every gradient is finite.
    fn flatten_gradients(
        &self,
        store: &mut GradStore,
        out: &mut [f64],
    ) -> Result<bool, TrainingError> {
        let (presence, values) = out.split_at_mut(self.params.len());
        let mut offset = 0;
        let mut finite = true;
        for (index, param) in self.params.iter().enumerate() {
            let len = param.var.as_tensor().elem_count();
            if let Some(grad) = store.remove(param.var.as_tensor()) {
                let host = self
                    .scaler
                    .unscale(&grad)?
                    .to_dtype(DType::F32)
                    .and_then(|t| t.flatten_all())
                    .and_then(|t| t.to_vec1::<f32>())
                    .map_err(to_runtime_error)?;
                for (slot, value) in values[offset..offset + len].iter_mut().zip(host) {
                    finite &= value.is_finite();
                    *slot = value as f64;
                }
                presence[index] = 1.0;
            }
            offset += len;
        }
        Ok(finite)
    }

    /// Replaces local gradients with the cross-rank mean for every parameter
    /// that received a gradient on at least one rank.
    fn install_averaged_gradients(
        &self,
        store: &mut GradStore,
        reduced: &[f64],
        world: f64,
    ) -> Result<(), TrainingError> {
        let (presence, values) = reduced.split_at(self.params.len());
        let mut offset = 0;
        for (index, param) in self.params.iter().enumerate() {
            let tensor = param.var.as_tensor();
            let len = tensor.elem_count();
            if presence[index] > 0.0 {
                let mean: Vec<f32> = values[offset..offset + len]
                    .iter()
                    .map(|value| (value / world) as f32)
                    .collect();
                let grad = Tensor::from_vec(mean, tensor.dims(), tensor.device())
                    .map_err(to_runtime_error)?;
                store.insert(tensor, grad);
            }
            offset += len;
        }
        Ok(())
    }

    fn validate<L: DataLoader>(
        &mut self,
        epoch: usize,
        loader: &mut BlockingDataLoader<L>,
    ) -> Result<EpochSummary, TrainingError> {
        self.model.set_training(false);
        self.metrics.reset(epoch, Split::Validation);
        loader.start_epoch(epoch)?;

        while let Some(batch) = loader.next_batch()? {
            let logits = self
                .model
                .forward(&batch.input_ids, &batch.attention_mask)
                .map_err(to_runtime_error)?
                .detach();
            let output = self.loss.compute(&logits, &batch.labels)?;
            let predictions = predictions_from_logits(&logits)?;
            let labels = batch.labels.to_vec1::<u32>().map_err(to_runtime_error)?;
            let valid = batch.valid_rows.min(labels.len());
            self.metrics
                .record(&predictions[..valid], &labels[..valid])?;
            if output.is_finite() {
                self.metrics.record_loss(output.value, valid);
            }
        }

        self.metrics.reduce(&self.group)?;
        Ok(self.metrics.summarize())
    }

    /// Barrier, coordinator-only write, barrier. Returns the directory on
    /// the coordinator.
    fn save_checkpoint(
        &mut self,
        kind: CheckpointKind,
        epoch: usize,
    ) -> Result<Option<PathBuf>, TrainingError> {
        let Some(manager) = self.checkpoints.as_ref() else {
            return Ok(None);
        };
        self.group.barrier()?;
        let written = if self.group.is_coordinator() {
            let state = CheckpointState::capture(epoch, self.model, &self.optimizer, &self.scaler);
            manager
                .save(&self.group, kind, &state)?
                .map(|descriptor| descriptor.directory)
        } else {
            None
        };
        self.group.barrier()?;
        Ok(written)
    }

    fn report(&mut self, summary: &EpochSummary) {
        if !self.group.is_coordinator() {
            return;
        }
        log::info!("{summary}");
        self.logger.log_epoch(self.global_step, summary);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_config(epochs: usize, cadence: usize) -> RunConfig {
        RunConfig {
            learning_rates: LearningRates {
                base_model: 5e-5,
                classifier: 1e-4,
            },
            epochs,
            weight_decay: 0.001,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            weight_decay_exclude: Vec::new(),
            max_grad_norm: None,
            label_smoothing: 0.1,
            batch_size: 2,
            checkpoint_every_n_epochs: cadence,
            average: AverageMode::Macro,
            precision: Precision::Fp32,
            max_non_finite_steps: 8,
            max_overflow_steps: 32,
            log_every_n_steps: 10,
            checkpoint_dir: None,
        }
    }

    #[test]
    fn cadence_two_over_five_epochs() {
        let config = run_config(5, 2);
        let saves: Vec<_> = (1..=5).flat_map(|e| config.checkpoints_after(e)).collect();
        assert_eq!(
            saves,
            vec![
                CheckpointKind::Epoch(2),
                CheckpointKind::Epoch(4),
                CheckpointKind::Final
            ]
        );
    }

    #[test]
    fn final_save_coexists_with_cadence_on_last_epoch() {
        let config = run_config(4, 2);
        assert_eq!(
            config.checkpoints_after(4),
            vec![CheckpointKind::Epoch(4), CheckpointKind::Final]
        );
        let disabled = run_config(3, 0);
        assert_eq!(disabled.checkpoints_after(2), vec![]);
        assert_eq!(disabled.checkpoints_after(3), vec![CheckpointKind::Final]);
    }

    #[test]
    fn uneven_global_batch_is_rejected() {
        let config = run_config(1, 1);
        assert!(config.validate(2).is_ok());
        assert!(matches!(
            config.validate(3),
            Err(TrainingError::Configuration(_))
        ));
    }

    #[test]
    fn zero_log_interval_is_rejected() {
        let mut config = run_config(1, 1);
        config.log_every_n_steps = 0;
        assert!(matches!(
            config.validate(1),
            Err(TrainingError::Configuration(message)) if message.contains("log_every_n_steps")
        ));
    }
}
