//! Low-rank adapter composition on top of the freeze policy.
//!
//! Adapters only add trainable surface: the branch matrices and, depending on
//! [`BiasMode`], projection biases. They never change the freeze decision of
//! an original weight.

use classifier::{
    ClassifierModel, LoraSettings, ParamId, ParamRole, Projection, TrainablePartition,
};
use serde::{Deserialize, Serialize};

use crate::{
    freeze::{FreezeConfig, FreezePolicy},
    TrainingError,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BiasMode {
    /// No bias becomes trainable through the adapter.
    None,
    /// Every trunk bias becomes trainable.
    #[default]
    All,
    /// Only biases of targeted projections become trainable.
    LoraOnly,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdapterConfig {
    #[serde(default = "default_rank")]
    pub rank: usize,
    #[serde(default = "default_alpha")]
    pub alpha: f64,
    #[serde(default = "default_dropout")]
    pub dropout: f32,
    #[serde(default = "default_target_modules")]
    pub target_modules: Vec<String>,
    #[serde(default)]
    pub bias: BiasMode,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            rank: default_rank(),
            alpha: default_alpha(),
            dropout: default_dropout(),
            target_modules: default_target_modules(),
            bias: BiasMode::default(),
        }
    }
}

fn default_rank() -> usize {
    16
}

fn default_alpha() -> f64 {
    32.0
}

fn default_dropout() -> f32 {
    0.1
}

fn default_target_modules() -> Vec<String> {
    ["q_proj", "k_proj", "v_proj", "o_proj"]
        .into_iter()
        .map(String::from)
        .collect()
}

impl AdapterConfig {
    pub fn scaling_factor(&self) -> f64 {
        self.alpha / self.rank as f64
    }

    pub fn settings(&self) -> LoraSettings {
        LoraSettings {
            rank: self.rank,
            alpha: self.alpha,
            dropout: self.dropout,
        }
    }

    /// Resolves `target_modules` to projections, rejecting anything the trunk
    /// does not have.
    pub fn targets(&self) -> Result<Vec<Projection>, TrainingError> {
        if self.target_modules.is_empty() {
            return Err(TrainingError::configuration(
                "adapter target_modules must not be empty",
            ));
        }
        let mut targets = Vec::with_capacity(self.target_modules.len());
        for name in &self.target_modules {
            let proj = Projection::from_name(name).ok_or_else(|| {
                TrainingError::configuration(format!(
                    "adapter target '{name}' does not exist on the trunk"
                ))
            })?;
            if !targets.contains(&proj) {
                targets.push(proj);
            }
        }
        Ok(targets)
    }

    fn validate(&self) -> Result<(), TrainingError> {
        if self.rank == 0 {
            return Err(TrainingError::configuration(
                "adapter rank must be greater than zero",
            ));
        }
        if !(self.alpha > 0.0 && self.alpha.is_finite()) {
            return Err(TrainingError::configuration(
                "adapter alpha must be a positive number",
            ));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(TrainingError::configuration(
                "adapter dropout must be in [0, 1)",
            ));
        }
        Ok(())
    }
}

/// Wraps the configured projections of every block with low-rank branches and
/// returns the parameters the adapters make trainable.
pub fn compose_adapters(
    model: &mut ClassifierModel,
    config: &AdapterConfig,
) -> Result<Vec<ParamId>, TrainingError> {
    config.validate()?;
    let targets = config.targets()?;

    let mut surface = model
        .attach_adapters(&targets, &config.settings())
        .map_err(|err| TrainingError::configuration(err.to_string()))?;

    match config.bias {
        BiasMode::None => {}
        BiasMode::All => surface.extend(
            model
                .registry()
                .ids()
                .filter(|id| id.is_trunk() && id.role == ParamRole::Bias)
                .copied(),
        ),
        BiasMode::LoraOnly => {
            for block in 0..model.num_blocks() {
                surface.extend(
                    targets
                        .iter()
                        .filter_map(|proj| model.projection_bias(block, *proj)),
                );
            }
        }
    }

    log::info!(
        "composed rank-{} adapters (scaling {:.3}) on {:?}",
        config.rank,
        config.scaling_factor(),
        config.target_modules
    );
    Ok(surface)
}

/// Applies the freeze policy, composes adapters and installs the resulting
/// partition into the model. Returns the installed partition.
pub fn prepare_model(
    model: &mut ClassifierModel,
    freeze: FreezeConfig,
    adapter: Option<&AdapterConfig>,
) -> Result<TrainablePartition, TrainingError> {
    let adapter_surface = match adapter {
        Some(config) => compose_adapters(model, config)?,
        None => Vec::new(),
    };

    let mut partition =
        FreezePolicy::new(freeze).select(model.registry(), model.num_blocks())?;
    partition.extend(adapter_surface);

    model
        .install_partition(partition.clone())
        .map_err(|err| TrainingError::configuration(err.to_string()))?;
    Ok(partition)
}
