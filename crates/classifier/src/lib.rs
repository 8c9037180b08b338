pub mod block;
pub mod config;
pub mod factory;
pub mod init;
mod layers;
pub mod lora;
pub mod model;
pub mod registry;

pub use block::DecoderBlock;
pub use config::{BackboneConfig, ClassifierConfig};
pub use factory::{create_classifier, ClassifierOptions};
pub use init::LinearInit;
pub use lora::LoraSettings;
pub use model::{ClassifierModel, ModelSummary};
pub use registry::{
    BlockModule, Component, ParamId, ParamRole, ParameterRegistry, Projection, TrainablePartition,
};
