//! Selects which parameters of the composed classifier are trainable.

use classifier::{Component, ParamId, ParameterRegistry, TrainablePartition};
use serde::{Deserialize, Serialize};

use crate::TrainingError;

/// Manual freeze rules applied before adapters are composed.
///
/// The classification head is always trainable and has no switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreezeConfig {
    #[serde(default)]
    pub freeze_norm_layer: bool,
    #[serde(default = "default_freeze_embedding")]
    pub freeze_embedding: bool,
    #[serde(default = "default_unfrozen_layers")]
    pub num_decoder_layers_to_unfreeze: usize,
}

impl Default for FreezeConfig {
    fn default() -> Self {
        Self {
            freeze_norm_layer: false,
            freeze_embedding: default_freeze_embedding(),
            num_decoder_layers_to_unfreeze: default_unfrozen_layers(),
        }
    }
}

fn default_freeze_embedding() -> bool {
    true
}

fn default_unfrozen_layers() -> usize {
    5
}

#[derive(Debug, Clone)]
pub struct FreezePolicy {
    config: FreezeConfig,
}

impl FreezePolicy {
    pub fn new(config: FreezeConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &FreezeConfig {
        &self.config
    }

    /// Computes the trainable subset of the original (non-adapter) parameters.
    ///
    /// Everything starts frozen; the head, the embedding (unless frozen), the
    /// final norm (unless frozen) and every parameter of the last
    /// `num_decoder_layers_to_unfreeze` blocks are selected.
    pub fn select(
        &self,
        registry: &ParameterRegistry,
        num_blocks: usize,
    ) -> Result<TrainablePartition, TrainingError> {
        let unfreeze = self.config.num_decoder_layers_to_unfreeze;
        if unfreeze > num_blocks {
            return Err(TrainingError::configuration(format!(
                "num_decoder_layers_to_unfreeze ({unfreeze}) exceeds the trunk's {num_blocks} decoder blocks"
            )));
        }
        let first_unfrozen = num_blocks - unfreeze;

        let partition: TrainablePartition = registry
            .ids()
            .filter(|id| !id.is_adapter())
            .filter(|id| self.is_trainable(id, first_unfrozen))
            .copied()
            .collect();
        log::debug!(
            "freeze policy selected {} of {} parameters",
            partition.len(),
            registry.len()
        );
        Ok(partition)
    }

    fn is_trainable(&self, id: &ParamId, first_unfrozen: usize) -> bool {
        match id.component {
            Component::Head => true,
            Component::Embedding => !self.config.freeze_embedding,
            Component::FinalNorm => !self.config.freeze_norm_layer,
            Component::Block { index, .. } => index >= first_unfrozen,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use classifier::{BackboneConfig, ClassifierConfig, ClassifierModel};

    fn model(layers: usize) -> ClassifierModel {
        ClassifierModel::new(ClassifierConfig {
            backbone: BackboneConfig {
                vocab_size: 16,
                hidden_size: 4,
                num_hidden_layers: layers,
                num_attention_heads: 2,
                intermediate_size: 8,
                attention_bias: true,
                rms_norm_eps: 1e-6,
                pad_token_id: 0,
            },
            num_classes: 3,
            head_dropout: None,
            dtype: DType::F32,
            device: Device::Cpu,
            seed: 0,
        })
        .unwrap()
    }

    #[test]
    fn selects_head_norm_and_last_blocks() {
        let model = model(4);
        let policy = FreezePolicy::new(FreezeConfig {
            freeze_norm_layer: false,
            freeze_embedding: true,
            num_decoder_layers_to_unfreeze: 2,
        });

        let partition = policy.select(model.registry(), 4).unwrap();

        for id in model.registry().ids() {
            let expected = match id.component {
                Component::Head | Component::FinalNorm => true,
                Component::Embedding => false,
                Component::Block { index, .. } => index >= 2,
            };
            assert_eq!(partition.contains(id), expected, "{id}");
        }
    }

    #[test]
    fn zero_layers_leaves_only_head_and_switches() {
        let model = model(3);
        let policy = FreezePolicy::new(FreezeConfig {
            freeze_norm_layer: true,
            freeze_embedding: false,
            num_decoder_layers_to_unfreeze: 0,
        });

        let partition = policy.select(model.registry(), 3).unwrap();

        assert!(partition
            .iter()
            .all(|id| matches!(id.component, Component::Head | Component::Embedding)));
        assert_eq!(partition.len(), 3);
    }

    #[test]
    fn too_many_layers_is_a_configuration_error() {
        let model = model(2);
        let policy = FreezePolicy::new(FreezeConfig {
            num_decoder_layers_to_unfreeze: 3,
            ..FreezeConfig::default()
        });

        let err = policy.select(model.registry(), 2).unwrap_err();
        assert!(matches!(err, TrainingError::Configuration(_)));
    }
}
