//! Builds a classifier from a pretrained backbone directory.
//!
//! The directory layout mirrors what hub exports ship: `config.json` with the
//! trunk hyperparameters, optional `model.safetensors` with trunk weights and
//! `tokenizer.json`.

use std::{fs, path::Path};

use candle_core::{DType, Device, Error, Result};
use tokenizers::Tokenizer;

use crate::{
    config::{BackboneConfig, ClassifierConfig},
    model::ClassifierModel,
};

pub const BACKBONE_CONFIG_FILE: &str = "config.json";
pub const BACKBONE_WEIGHTS_FILE: &str = "model.safetensors";
pub const TOKENIZER_FILE: &str = "tokenizer.json";

/// Head and placement options applied on top of the backbone.
#[derive(Debug, Clone)]
pub struct ClassifierOptions {
    pub num_classes: usize,
    pub head_dropout: Option<f32>,
    pub dtype: DType,
    pub device: Device,
    pub seed: u64,
}

pub fn load_backbone_config(dir: &Path) -> Result<BackboneConfig> {
    let path = dir.join(BACKBONE_CONFIG_FILE);
    let contents = fs::read_to_string(&path)
        .map_err(|err| Error::Msg(format!("failed to read {}: {err}", path.display())))?;
    serde_json::from_str(&contents)
        .map_err(|err| Error::Msg(format!("failed to parse {}: {err}", path.display())))
}

/// Returns the composed model together with its paired tokenizer.
pub fn create_classifier(
    backbone_dir: &Path,
    options: ClassifierOptions,
) -> Result<(ClassifierModel, Tokenizer)> {
    let backbone = load_backbone_config(backbone_dir)?;
    let model = ClassifierModel::new(ClassifierConfig {
        backbone,
        num_classes: options.num_classes,
        head_dropout: options.head_dropout,
        dtype: options.dtype,
        device: options.device.clone(),
        seed: options.seed,
    })?;

    let weights = backbone_dir.join(BACKBONE_WEIGHTS_FILE);
    if weights.is_file() {
        let tensors = candle_core::safetensors::load(&weights, &options.device)?;
        model.load_trunk_weights(tensors)?;
        log::info!("loaded trunk weights from {}", weights.display());
    } else {
        log::warn!(
            "no {} in {}; trunk keeps its seeded initialisation",
            BACKBONE_WEIGHTS_FILE,
            backbone_dir.display()
        );
    }

    let tokenizer_path = backbone_dir.join(TOKENIZER_FILE);
    let tokenizer = Tokenizer::from_file(&tokenizer_path).map_err(|err| {
        Error::Msg(format!(
            "failed to load tokenizer {}: {err}",
            tokenizer_path.display()
        ))
    })?;

    Ok((model, tokenizer))
}
