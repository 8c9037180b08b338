use std::{
    fs,
    path::{Path, PathBuf},
};

use candle_core::DType;
use serde::{Deserialize, Serialize};

use crate::{
    adapter::AdapterConfig,
    freeze::FreezeConfig,
    metrics::AverageMode,
    trainer::{LearningRates, RunConfig},
    TrainingError,
};

/// File configuration of a fine-tuning run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinetuneConfig {
    pub model: ModelConfig,
    #[serde(default)]
    pub freeze: FreezeConfig,
    #[serde(default)]
    pub adapter: Option<AdapterConfig>,
    pub data: DataConfig,
    #[serde(default)]
    pub optimizer: OptimizerConfig,
    #[serde(default)]
    pub run: RunSection,
    #[serde(default)]
    pub tracking: TrackingConfig,
}

impl FinetuneConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, TrainingError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let value = parse_value(path, &contents)?;
        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        Self::from_value(value, base_dir)
    }

    /// Builds a config from an already parsed document, resolving relative
    /// paths against `base_dir`.
    pub fn from_value(value: serde_json::Value, base_dir: &Path) -> Result<Self, TrainingError> {
        let mut config: FinetuneConfig = serde_json::from_value(value)?;
        config.apply_base_path(base_dir);
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), TrainingError> {
        let mut errors = Vec::new();

        if self.model.num_classes < 2 {
            errors.push("model.num_classes must be at least 2".to_string());
        }
        if let Some(p) = self.model.head_dropout {
            if !(0.0..1.0).contains(&p) {
                errors.push("model.head_dropout must be in [0, 1)".to_string());
            }
        }

        if let Some(adapter) = &self.adapter {
            if adapter.rank == 0 {
                errors.push("adapter.rank must be greater than 0".to_string());
            }
            if !(0.0..1.0).contains(&adapter.dropout) {
                errors.push("adapter.dropout must be in [0, 1)".to_string());
            }
            if adapter.target_modules.is_empty() {
                errors.push("adapter.target_modules must not be empty".to_string());
            }
        }

        if self.data.batch_size == 0 {
            errors.push("data.batch_size must be greater than 0".to_string());
        }
        if self.data.max_length == 0 {
            errors.push("data.max_length must be greater than 0".to_string());
        }
        if self.data.text_column.is_empty() || self.data.label_column.is_empty() {
            errors.push("data.text_column and data.label_column must not be empty".to_string());
        }

        let opt = &self.optimizer;
        if !(opt.base_model_lr > 0.0) {
            errors.push("optimizer.base_model_lr must be greater than 0".to_string());
        }
        if !(opt.classifier_lr > 0.0) {
            errors.push("optimizer.classifier_lr must be greater than 0".to_string());
        }
        if opt.weight_decay < 0.0 {
            errors.push("optimizer.weight_decay must be >= 0".to_string());
        }
        if !(0.0 < opt.beta1 && opt.beta1 < 1.0) {
            errors.push("optimizer.beta1 must be in (0, 1)".to_string());
        }
        if !(0.0 < opt.beta2 && opt.beta2 < 1.0) {
            errors.push("optimizer.beta2 must be in (0, 1)".to_string());
        }
        if !(opt.epsilon > 0.0) {
            errors.push("optimizer.epsilon must be greater than 0".to_string());
        }
        if let Some(norm) = opt.max_grad_norm {
            if !(norm > 0.0) {
                errors.push("optimizer.max_grad_norm must be greater than 0".to_string());
            }
        }

        let run = &self.run;
        if run.epochs == 0 {
            errors.push("run.epochs must be greater than 0".to_string());
        }
        if !(0.0..1.0).contains(&run.label_smoothing) {
            errors.push("run.label_smoothing must be in [0, 1)".to_string());
        }
        if run.world_size == 0 {
            errors.push("run.world_size must be greater than 0".to_string());
        } else if self.data.batch_size % run.world_size != 0 {
            errors.push(format!(
                "data.batch_size ({}) must be divisible by run.world_size ({})",
                self.data.batch_size, run.world_size
            ));
        }
        if run.log_every_n_steps == 0 {
            errors.push("run.log_every_n_steps must be greater than 0".to_string());
        }
        if run.output_dir.as_os_str().is_empty() {
            errors.push("run.output_dir must not be empty".to_string());
        }

        if !errors.is_empty() {
            return Err(TrainingError::validation(errors));
        }
        Ok(())
    }

    /// Immutable run parameters handed to the trainer.
    pub fn run_config(&self) -> RunConfig {
        RunConfig {
            learning_rates: LearningRates {
                base_model: self.optimizer.base_model_lr,
                classifier: self.optimizer.classifier_lr,
            },
            epochs: self.run.epochs,
            weight_decay: self.optimizer.weight_decay,
            beta1: self.optimizer.beta1,
            beta2: self.optimizer.beta2,
            epsilon: self.optimizer.epsilon,
            weight_decay_exclude: self.optimizer.weight_decay_exclude.clone(),
            max_grad_norm: self.optimizer.max_grad_norm,
            label_smoothing: self.run.label_smoothing,
            batch_size: self.data.batch_size,
            checkpoint_every_n_epochs: self.run.checkpoint_every_n_epochs,
            average: self.run.f1_average,
            precision: self.model.precision,
            max_non_finite_steps: self.run.max_non_finite_steps,
            max_overflow_steps: self.run.max_overflow_steps,
            log_every_n_steps: self.run.log_every_n_steps,
            checkpoint_dir: Some(self.run.output_dir.clone()),
        }
    }

    fn apply_base_path(&mut self, base: &Path) {
        absolutize_in_place(&mut self.model.backbone_dir, base);
        absolutize_in_place(&mut self.data.train_csv, base);
        if let Some(path) = self.data.val_csv.as_mut() {
            absolutize_in_place(path, base);
        }
        absolutize_in_place(&mut self.run.output_dir, base);
        if let Some(dir) = self.tracking.tensorboard_dir.as_mut() {
            absolutize_in_place(dir, base);
        }
    }
}

/// Parses TOML or JSON by extension into a JSON value so that CLI overrides
/// can be applied before deserialization.
pub fn parse_value(path: &Path, contents: &str) -> Result<serde_json::Value, TrainingError> {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("json") => Ok(serde_json::from_str(contents)?),
        Some("toml") | Some("tml") | None => {
            let value: toml::Value = toml::from_str(contents)?;
            Ok(serde_json::to_value(value)?)
        }
        Some(other) => Err(TrainingError::ConfigFormat(format!(
            "unsupported configuration extension '{other}'"
        ))),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Directory holding `config.json`, `model.safetensors` and `tokenizer.json`.
    pub backbone_dir: PathBuf,
    #[serde(default = "default_num_classes")]
    pub num_classes: usize,
    #[serde(default = "default_head_dropout")]
    pub head_dropout: Option<f32>,
    #[serde(default = "default_precision")]
    pub precision: Precision,
    #[serde(default = "default_seed")]
    pub seed: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    pub train_csv: PathBuf,
    #[serde(default)]
    pub val_csv: Option<PathBuf>,
    #[serde(default = "default_text_column")]
    pub text_column: String,
    #[serde(default = "default_label_column")]
    pub label_column: String,
    #[serde(default = "default_max_length")]
    pub max_length: usize,
    #[serde(default = "default_true")]
    pub shuffle: bool,
    /// Global batch size, split across devices.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerConfig {
    #[serde(default = "default_base_model_lr")]
    pub base_model_lr: f64,
    #[serde(default = "default_classifier_lr")]
    pub classifier_lr: f64,
    #[serde(default = "default_weight_decay")]
    pub weight_decay: f64,
    #[serde(default = "default_beta1")]
    pub beta1: f64,
    #[serde(default = "default_beta2")]
    pub beta2: f64,
    #[serde(default = "default_adam_eps")]
    pub epsilon: f64,
    #[serde(default)]
    pub max_grad_norm: Option<f64>,
    /// Substrings of parameter names exempt from weight decay.
    #[serde(default)]
    pub weight_decay_exclude: Vec<String>,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            base_model_lr: default_base_model_lr(),
            classifier_lr: default_classifier_lr(),
            weight_decay: default_weight_decay(),
            beta1: default_beta1(),
            beta2: default_beta2(),
            epsilon: default_adam_eps(),
            max_grad_norm: None,
            weight_decay_exclude: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSection {
    #[serde(default = "default_epochs")]
    pub epochs: usize,
    #[serde(default = "default_label_smoothing")]
    pub label_smoothing: f32,
    /// 0 disables periodic saves; the final save always happens.
    #[serde(default = "default_checkpoint_every")]
    pub checkpoint_every_n_epochs: usize,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    #[serde(default)]
    pub f1_average: AverageMode,
    #[serde(default = "default_world_size")]
    pub world_size: usize,
    #[serde(default = "default_max_non_finite_steps")]
    pub max_non_finite_steps: usize,
    /// Loss-scale overflow steps tolerated per epoch.
    #[serde(default = "default_max_overflow_steps")]
    pub max_overflow_steps: usize,
    #[serde(default = "default_log_every_n_steps")]
    pub log_every_n_steps: usize,
}

impl Default for RunSection {
    fn default() -> Self {
        Self {
            epochs: default_epochs(),
            label_smoothing: default_label_smoothing(),
            checkpoint_every_n_epochs: default_checkpoint_every(),
            output_dir: default_output_dir(),
            f1_average: AverageMode::default(),
            world_size: default_world_size(),
            max_non_finite_steps: default_max_non_finite_steps(),
            max_overflow_steps: default_max_overflow_steps(),
            log_every_n_steps: default_log_every_n_steps(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackingConfig {
    #[serde(default = "default_true")]
    pub enable_stdout: bool,
    #[serde(default)]
    pub tensorboard_dir: Option<PathBuf>,
    #[serde(default = "default_flush_every_n")]
    pub flush_every_n: usize,
    #[serde(default)]
    pub run_name: Option<String>,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            enable_stdout: true,
            tensorboard_dir: None,
            flush_every_n: default_flush_every_n(),
            run_name: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Precision {
    Fp32,
    Fp16,
    Bf16,
    Mixed,
}

impl Default for Precision {
    fn default() -> Self {
        Precision::Fp16
    }
}

impl Precision {
    /// Storage dtype of model parameters.
    pub fn dtype(&self) -> DType {
        match self {
            Precision::Fp32 => DType::F32,
            Precision::Fp16 => DType::F16,
            Precision::Bf16 => DType::BF16,
            Precision::Mixed => DType::BF16,
        }
    }
}

fn absolutize_in_place(path: &mut PathBuf, base: &Path) {
    if path.is_relative() {
        *path = base.join(&*path);
    }
}

fn default_num_classes() -> usize {
    8
}

fn default_head_dropout() -> Option<f32> {
    Some(0.5)
}

fn default_precision() -> Precision {
    Precision::Fp16
}

fn default_seed() -> u64 {
    42
}

fn default_text_column() -> String {
    "Question".to_string()
}

fn default_label_column() -> String {
    "label".to_string()
}

fn default_max_length() -> usize {
    512
}

fn default_true() -> bool {
    true
}

fn default_batch_size() -> usize {
    1
}

fn default_base_model_lr() -> f64 {
    5e-5
}

fn default_classifier_lr() -> f64 {
    1e-4
}

fn default_weight_decay() -> f64 {
    0.001
}

fn default_beta1() -> f64 {
    0.9
}

fn default_beta2() -> f64 {
    0.999
}

fn default_adam_eps() -> f64 {
    1e-8
}

fn default_epochs() -> usize {
    5
}

fn default_label_smoothing() -> f32 {
    0.1
}

fn default_checkpoint_every() -> usize {
    2
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("./finetuned_model/")
}

fn default_world_size() -> usize {
    1
}

fn default_max_non_finite_steps() -> usize {
    8
}

fn default_max_overflow_steps() -> usize {
    32
}

fn default_log_every_n_steps() -> usize {
    50
}

fn default_flush_every_n() -> usize {
    20
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[model]
backbone_dir = "backbone"

[data]
train_csv = "data/train.csv"
val_csv = "data/val.csv"
"#;

    #[test]
    fn defaults_follow_the_reference_run() {
        let value = parse_value(Path::new("run.toml"), MINIMAL).unwrap();
        let config = FinetuneConfig::from_value(value, Path::new("/work")).unwrap();

        assert_eq!(config.model.num_classes, 8);
        assert_eq!(config.model.head_dropout, Some(0.5));
        assert_eq!(config.model.precision, Precision::Fp16);
        assert_eq!(config.model.backbone_dir, PathBuf::from("/work/backbone"));
        assert_eq!(config.data.val_csv, Some(PathBuf::from("/work/data/val.csv")));
        assert_eq!(config.data.text_column, "Question");
        assert!(config.adapter.is_none());

        let run = config.run_config();
        assert_eq!(run.epochs, 5);
        assert_eq!(run.batch_size, 1);
        assert_eq!(run.checkpoint_every_n_epochs, 2);
        assert_eq!(run.learning_rates.base_model, 5e-5);
        assert_eq!(run.learning_rates.classifier, 1e-4);
        assert_eq!(run.weight_decay, 0.001);
        assert_eq!(run.label_smoothing, 0.1);
        assert_eq!(run.average, AverageMode::Macro);
        assert_eq!(run.max_non_finite_steps, 8);
    }

    #[test]
    fn adapter_section_is_parsed() {
        let toml = format!(
            "{MINIMAL}\n[adapter]\nrank = 8\ntarget_modules = [\"q_proj\", \"v_proj\"]\nbias = \"lora_only\"\n"
        );
        let value = parse_value(Path::new("run.toml"), &toml).unwrap();
        let config = FinetuneConfig::from_value(value, Path::new("/work")).unwrap();
        let adapter = config.adapter.unwrap();
        assert_eq!(adapter.rank, 8);
        assert_eq!(adapter.alpha, 32.0);
        assert_eq!(adapter.bias, crate::adapter::BiasMode::LoraOnly);
    }

    #[test]
    fn validation_collects_every_problem() {
        let value = serde_json::json!({
            "model": {"backbone_dir": "b", "num_classes": 1},
            "data": {"train_csv": "t.csv", "batch_size": 3},
            "run": {"epochs": 0, "world_size": 2, "label_smoothing": 1.5}
        });
        let err = FinetuneConfig::from_value(value, Path::new(".")).unwrap_err();
        let TrainingError::Validation(messages) = err else {
            panic!("expected validation error, got {err}");
        };
        assert_eq!(messages.len(), 4, "{messages:?}");
    }

    #[test]
    fn unknown_extension_is_rejected() {
        assert!(matches!(
            parse_value(Path::new("run.yaml"), ""),
            Err(TrainingError::ConfigFormat(_))
        ));
    }
}
