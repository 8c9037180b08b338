use candle_core::{DType, Device, Error, Result};
use serde::{Deserialize, Serialize};

/// Hyperparameters of the pretrained decoder trunk.
///
/// Field names follow the `config.json` shipped next to pretrained weights so
/// the file can be deserialized directly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackboneConfig {
    pub vocab_size: usize,
    pub hidden_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    pub intermediate_size: usize,
    #[serde(default = "default_attention_bias")]
    pub attention_bias: bool,
    #[serde(default = "default_rms_norm_eps")]
    pub rms_norm_eps: f64,
    #[serde(default)]
    pub pad_token_id: u32,
}

impl BackboneConfig {
    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_attention_heads.max(1)
    }

    pub fn validate(&self) -> Result<()> {
        if self.vocab_size == 0 {
            return Err(Error::Msg("vocab_size must be greater than zero".into()));
        }
        if self.hidden_size == 0 {
            return Err(Error::Msg("hidden_size must be greater than zero".into()));
        }
        if self.num_hidden_layers == 0 {
            return Err(Error::Msg(
                "num_hidden_layers must be greater than zero".into(),
            ));
        }
        if self.num_attention_heads == 0 {
            return Err(Error::Msg(
                "num_attention_heads must be greater than zero".into(),
            ));
        }
        if self.hidden_size % self.num_attention_heads != 0 {
            return Err(Error::Msg(format!(
                "hidden_size ({}) must be divisible by num_attention_heads ({})",
                self.hidden_size, self.num_attention_heads
            )));
        }
        if self.intermediate_size == 0 {
            return Err(Error::Msg(
                "intermediate_size must be greater than zero".into(),
            ));
        }
        if self.rms_norm_eps <= 0.0 {
            return Err(Error::Msg("rms_norm_eps must be positive".into()));
        }
        if self.pad_token_id as usize >= self.vocab_size {
            return Err(Error::Msg(format!(
                "pad_token_id ({}) must be smaller than vocab_size ({})",
                self.pad_token_id, self.vocab_size
            )));
        }
        Ok(())
    }
}

fn default_attention_bias() -> bool {
    true
}

fn default_rms_norm_eps() -> f64 {
    1e-6
}

/// Full configuration for assembling trunk plus classification head.
#[derive(Debug, Clone)]
pub struct ClassifierConfig {
    pub backbone: BackboneConfig,
    pub num_classes: usize,
    /// Dropout applied to the pooled representation before the head.
    pub head_dropout: Option<f32>,
    pub dtype: DType,
    pub device: Device,
    pub seed: u64,
}

impl ClassifierConfig {
    pub fn validate(&self) -> Result<()> {
        self.backbone.validate()?;
        if self.num_classes < 2 {
            return Err(Error::Msg(format!(
                "num_classes must be at least 2 (got {})",
                self.num_classes
            )));
        }
        if let Some(p) = self.head_dropout {
            if !(0.0..1.0).contains(&p) {
                return Err(Error::Msg("head_dropout must be in [0, 1)".into()));
            }
        }
        if !self.dtype.is_float() {
            return Err(Error::Msg(format!(
                "parameter dtype must be floating point (got {:?})",
                self.dtype
            )));
        }
        Ok(())
    }
}
