pub mod adapter;
pub mod checkpoint;
pub mod config;
pub mod data;
pub mod distributed;
pub mod error;
pub mod freeze;
pub mod logging;
pub mod loss;
pub mod metrics;
pub mod optimizer;
pub mod trainer;

pub use adapter::{prepare_model, AdapterConfig};
pub use checkpoint::{
    load_checkpoint, CheckpointDescriptor, CheckpointKind, CheckpointManager, CheckpointManifest,
    CheckpointState,
};
pub use config::{FinetuneConfig, Precision};
pub use data::{
    Batch, BlockingDataLoader, ClassificationDataset, CsvOptions, DataLoader, Example,
    ShardedDataLoader,
};
pub use distributed::{launch, select_devices, ProcessGroup, WorkerContext};
pub use error::{RunFailure, TrainingError};
pub use freeze::FreezeConfig;
pub use logging::{ExperimentTracker, Logger, LoggingSettings, NullTracker, TensorBoardTracker};
pub use loss::{CrossEntropyLoss, LossFunction, LossOutput};
pub use metrics::{AverageMode, EpochSummary, MetricAggregator, Split};
pub use optimizer::{
    GradientScaler, LossScalePolicy, OptimizerState, ScaleAdjustment, TrainerOptimizer,
    TrainerOptimizerOptions,
};
pub use trainer::{LearningRates, RunConfig, RunState, RunSummary, Trainer};
