use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use classifier::{
    create_classifier,
    factory::{load_backbone_config, TOKENIZER_FILE},
    ClassifierOptions,
};
use clap::Parser;
use serde_json::{Number, Value};
use tokenizers::Tokenizer;
use tracing_subscriber::EnvFilter;
use training::{
    config::parse_value, launch, prepare_model, select_devices, BlockingDataLoader,
    CheckpointManager, ClassificationDataset, CsvOptions, FinetuneConfig, Logger, LoggingSettings,
    RunSummary, ShardedDataLoader, Trainer, TrainingError, WorkerContext,
};

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if let Err(err) = run() {
        eprintln!("fine-tuning failed: {}", err);
        std::process::exit(1);
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Sequence classification fine-tuning CLI", long_about = None)]
struct Args {
    #[arg(short, long, value_name = "PATH", help = "Path to a TOML or JSON run config")]
    config: PathBuf,

    #[arg(
        long = "override",
        value_name = "KEY=VALUE",
        help = "Override configuration value using dot-separated paths"
    )]
    overrides: Vec<OverrideArg>,

    #[arg(
        long,
        value_name = "DIR",
        num_args = 0..=1,
        help = "Resume from a checkpoint directory, or from the latest one under the output dir"
    )]
    resume: Option<Option<PathBuf>>,

    #[arg(long, value_name = "N", help = "Number of data-parallel devices")]
    world_size: Option<usize>,
}

#[derive(Debug, Clone)]
struct OverrideArg {
    path: String,
    value: String,
}

impl FromStr for OverrideArg {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (path, value) = s
            .split_once('=')
            .ok_or_else(|| "override must be in the form key=value".to_string())?;
        if path.trim().is_empty() {
            return Err("override key must not be empty".into());
        }
        Ok(Self {
            path: path.trim().to_string(),
            value: value.trim().to_string(),
        })
    }
}

/// Inputs shared read-only by every worker thread.
struct SharedInputs {
    config: FinetuneConfig,
    train: Arc<ClassificationDataset>,
    validation: Option<Arc<ClassificationDataset>>,
    resume: Option<PathBuf>,
    shutdown: Arc<AtomicBool>,
}

fn run() -> Result<(), TrainingError> {
    let args = Args::parse();

    let contents = fs::read_to_string(&args.config)?;
    let mut value = parse_value(&args.config, &contents)?;
    for override_arg in &args.overrides {
        let new_value = parse_override_value(&override_arg.value);
        set_value_at_path(&mut value, &override_arg.path, new_value)?;
    }
    if let Some(world_size) = args.world_size {
        set_value_at_path(&mut value, "run.world_size", Value::from(world_size))?;
    }
    let base_dir = args.config.parent().unwrap_or_else(|| Path::new("."));
    let config = FinetuneConfig::from_value(value, base_dir)?;

    let (train, validation) = load_datasets(&config)?;
    log::info!(
        "loaded {} training and {} validation examples",
        train.len(),
        validation.as_ref().map_or(0, |data| data.len())
    );

    let resume = match args.resume {
        None => None,
        Some(Some(dir)) => Some(dir),
        Some(None) => {
            let manager = CheckpointManager::new(&config.run.output_dir, String::new());
            match manager.latest()? {
                Some(descriptor) => Some(descriptor.directory),
                None => {
                    log::warn!(
                        "no checkpoint under {}; starting fresh",
                        config.run.output_dir.display()
                    );
                    None
                }
            }
        }
    };

    let shutdown = Arc::new(AtomicBool::new(false));
    let handler_flag = shutdown.clone();
    ctrlc::set_handler(move || {
        handler_flag.store(true, Ordering::Relaxed);
    })
    .map_err(|err| TrainingError::runtime(format!("failed to install signal handler: {err}")))?;

    let devices = select_devices(config.run.world_size)?;
    let shared = SharedInputs {
        config,
        train,
        validation,
        resume,
        shutdown,
    };
    let summaries = launch(devices, |ctx| run_worker(ctx, &shared))?;

    if let Some(summary) = summaries.first() {
        println!(
            "completed {} epoch(s), {} skipped step(s){}",
            summary.completed_epochs,
            summary.skipped_steps,
            if summary.stopped_early {
                ", stopped on request"
            } else {
                ""
            }
        );
        for path in &summary.checkpoints {
            println!("checkpoint: {}", path.display());
        }
    }
    Ok(())
}

fn load_datasets(
    config: &FinetuneConfig,
) -> Result<(Arc<ClassificationDataset>, Option<Arc<ClassificationDataset>>), TrainingError> {
    let backbone = load_backbone_config(&config.model.backbone_dir)
        .map_err(|err| TrainingError::configuration(err.to_string()))?;
    let tokenizer_path = config.model.backbone_dir.join(TOKENIZER_FILE);
    let tokenizer = Tokenizer::from_file(&tokenizer_path).map_err(|err| {
        TrainingError::configuration(format!(
            "failed to load tokenizer {}: {err}",
            tokenizer_path.display()
        ))
    })?;

    let options = CsvOptions {
        text_column: config.data.text_column.clone(),
        label_column: config.data.label_column.clone(),
        max_length: config.data.max_length,
        num_classes: config.model.num_classes,
        pad_token_id: backbone.pad_token_id,
    };
    let train = ClassificationDataset::from_csv(&config.data.train_csv, &tokenizer, &options)?;
    let validation = config
        .data
        .val_csv
        .as_deref()
        .map(|path| ClassificationDataset::from_csv(path, &tokenizer, &options))
        .transpose()?;
    Ok((Arc::new(train), validation.map(Arc::new)))
}

fn run_worker(ctx: WorkerContext, shared: &SharedInputs) -> Result<RunSummary, TrainingError> {
    let config = &shared.config;
    let (mut model, _) = create_classifier(
        &config.model.backbone_dir,
        ClassifierOptions {
            num_classes: config.model.num_classes,
            head_dropout: config.model.head_dropout,
            dtype: config.model.precision.dtype(),
            device: ctx.device.clone(),
            seed: config.model.seed,
        },
    )
    .map_err(|err| TrainingError::runtime(format!("failed to build classifier: {err}")))?;
    prepare_model(&mut model, config.freeze, config.adapter.as_ref())?;

    if ctx.group.is_coordinator() {
        let summary = model.summary();
        println!(
            "parameters: total={} trainable={} ({:.2}%)",
            summary.total,
            summary.trainable,
            summary.trainable_fraction() * 100.0
        );
        for (component, count) in &summary.per_component {
            println!("  {component}: {count}");
        }
    }

    let mut train = BlockingDataLoader::new(ShardedDataLoader::new(
        shared.train.clone(),
        &ctx.group,
        ctx.device.clone(),
        config.data.batch_size,
        config.data.shuffle,
        config.model.seed,
    )?);
    let mut validation = shared
        .validation
        .as_ref()
        .map(|dataset| {
            ShardedDataLoader::new(
                dataset.clone(),
                &ctx.group,
                ctx.device.clone(),
                config.data.batch_size,
                false,
                config.model.seed,
            )
            .map(BlockingDataLoader::new)
        })
        .transpose()?;

    let mut trainer = Trainer::new(&model, ctx.group.clone(), config.run_config())?
        .with_tracker_config(serde_json::to_value(config)?);
    if ctx.group.is_coordinator() {
        let settings = LoggingSettings::from_config(
            config.tracking.enable_stdout,
            config.tracking.tensorboard_dir.clone(),
            config.tracking.flush_every_n,
        );
        trainer = trainer.with_logger(Logger::new(settings)?);
    }
    if let Some(dir) = &shared.resume {
        trainer.resume_from(dir)?;
    }

    let shutdown = shared.shutdown.clone();
    trainer
        .fit_with_shutdown(&mut train, validation.as_mut(), move || {
            shutdown.load(Ordering::Relaxed)
        })
        .map_err(|failure| {
            if ctx.group.is_coordinator() {
                match failure.last_completed_epoch {
                    Some(epoch) => eprintln!("last completed epoch: {epoch}"),
                    None => eprintln!("no epoch completed"),
                }
            }
            failure.reason
        })
}

fn parse_override_value(raw: &str) -> Value {
    let trimmed = raw.trim();
    if trimmed.eq_ignore_ascii_case("true") {
        return Value::Bool(true);
    }
    if trimmed.eq_ignore_ascii_case("false") {
        return Value::Bool(false);
    }
    if trimmed.eq_ignore_ascii_case("null") {
        return Value::Null;
    }
    if let Ok(int_val) = trimmed.parse::<i64>() {
        return Value::Number(Number::from(int_val));
    }
    if let Ok(float_val) = trimmed.parse::<f64>() {
        if let Some(number) = Number::from_f64(float_val) {
            return Value::Number(number);
        }
    }
    if trimmed.starts_with('[') || trimmed.starts_with('{') {
        if let Ok(json_val) = serde_json::from_str::<Value>(trimmed) {
            return json_val;
        }
    }
    Value::String(trimmed.to_string())
}

fn set_value_at_path(value: &mut Value, path: &str, new_value: Value) -> Result<(), TrainingError> {
    let segments: Vec<&str> = path.split('.').map(str::trim).collect();
    if segments.iter().any(|segment| segment.is_empty()) {
        return Err(TrainingError::configuration(format!(
            "invalid override path '{path}'"
        )));
    }

    let mut current = value;
    for (idx, segment) in segments.iter().enumerate() {
        if current.is_null() {
            *current = Value::Object(serde_json::Map::new());
        }
        let Some(map) = current.as_object_mut() else {
            return Err(TrainingError::configuration(format!(
                "override path segment '{segment}' points to non-object value"
            )));
        };
        if idx + 1 == segments.len() {
            map.insert(segment.to_string(), new_value);
            return Ok(());
        }
        current = map.entry(segment.to_string()).or_insert(Value::Null);
    }
    Ok(())
}
