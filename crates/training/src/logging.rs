use std::{
    fs::{self, File},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use bytes::BytesMut;
use crc32fast::Hasher as Crc32;
use prost::Message;

use crate::{metrics::EpochSummary, TrainingError};

const CONFIG_FILENAME: &str = "config.json";

/// Sink for run configuration and scalar metrics. Only the coordinator
/// holds a live tracker.
pub trait ExperimentTracker: Send {
    fn init(&mut self, config: &serde_json::Value) -> Result<(), TrainingError>;
    fn log(&mut self, step: usize, scalars: &[(String, f64)]) -> Result<(), TrainingError>;
    fn finish(&mut self) -> Result<(), TrainingError>;
}

/// Tracker that discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullTracker;

impl ExperimentTracker for NullTracker {
    fn init(&mut self, _config: &serde_json::Value) -> Result<(), TrainingError> {
        Ok(())
    }

    fn log(&mut self, _step: usize, _scalars: &[(String, f64)]) -> Result<(), TrainingError> {
        Ok(())
    }

    fn finish(&mut self) -> Result<(), TrainingError> {
        Ok(())
    }
}

/// Writes scalars as TensorBoard event records and the run configuration as
/// `config.json` in the same directory.
pub struct TensorBoardTracker {
    dir: PathBuf,
    writer: TensorBoardWriter,
}

impl TensorBoardTracker {
    pub fn create(dir: impl Into<PathBuf>, flush_every: usize) -> Result<Self, TrainingError> {
        let dir = dir.into();
        let writer = TensorBoardWriter::create(&dir, flush_every)?;
        Ok(Self { dir, writer })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl ExperimentTracker for TensorBoardTracker {
    fn init(&mut self, config: &serde_json::Value) -> Result<(), TrainingError> {
        let path = self.dir.join(CONFIG_FILENAME);
        let data = serde_json::to_vec_pretty(config)
            .map_err(|err| TrainingError::runtime(format!("failed to encode run config: {err}")))?;
        fs::write(&path, data).map_err(|err| {
            TrainingError::runtime(format!("failed to write {}: {err}", path.display()))
        })
    }

    fn log(&mut self, step: usize, scalars: &[(String, f64)]) -> Result<(), TrainingError> {
        let step = step as i64;
        for (tag, value) in scalars {
            self.writer.write_scalar(tag, step, *value)?;
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<(), TrainingError> {
        self.writer.flush()
    }
}

#[derive(Clone, Debug)]
pub struct LoggingSettings {
    pub enable_stdout: bool,
    pub tensorboard_dir: Option<PathBuf>,
    pub tensorboard_flush_every_n: usize,
}

impl LoggingSettings {
    pub fn from_config(
        enable_stdout: bool,
        tensorboard_dir: Option<PathBuf>,
        flush_every: usize,
    ) -> Self {
        Self {
            enable_stdout,
            tensorboard_dir,
            tensorboard_flush_every_n: flush_every.max(1),
        }
    }

    /// No console output and no tracker.
    pub fn silent() -> Self {
        Self::from_config(false, None, 1)
    }
}

/// Console and tracker output of the coordinator. Tracker failures are
/// reported through `log` and never interrupt training.
pub struct Logger {
    settings: LoggingSettings,
    tracker: Box<dyn ExperimentTracker>,
}

impl std::fmt::Debug for Logger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Logger")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl Logger {
    pub fn new(settings: LoggingSettings) -> Result<Self, TrainingError> {
        let tracker: Box<dyn ExperimentTracker> = match settings.tensorboard_dir.as_ref() {
            Some(dir) => Box::new(TensorBoardTracker::create(
                dir.clone(),
                settings.tensorboard_flush_every_n,
            )?),
            None => Box::new(NullTracker),
        };
        Ok(Self { settings, tracker })
    }

    pub fn with_tracker(settings: LoggingSettings, tracker: Box<dyn ExperimentTracker>) -> Self {
        Self { settings, tracker }
    }

    pub fn disabled() -> Self {
        Self::with_tracker(LoggingSettings::silent(), Box::new(NullTracker))
    }

    pub fn init(&mut self, config: &serde_json::Value) {
        if let Err(err) = self.tracker.init(config) {
            log::warn!("experiment tracker init failed: {err}");
        }
    }

    pub fn log_training_step(
        &mut self,
        step: usize,
        loss: f64,
        loss_ema: f64,
        learning_rates: &[(&str, f64)],
        loss_scale: f32,
    ) {
        if self.settings.enable_stdout {
            println!(
                "train step={} loss={:.4} loss_ema={:.4} loss_scale={}",
                step, loss, loss_ema, loss_scale
            );
        }
        let mut scalars = vec![
            ("train/step_loss".to_string(), loss),
            ("train/step_loss_ema".to_string(), loss_ema),
            ("train/loss_scale".to_string(), loss_scale as f64),
        ];
        scalars.extend(
            learning_rates
                .iter()
                .map(|(group, lr)| (format!("lr/{group}"), *lr)),
        );
        self.emit(step, &scalars);
    }

    pub fn log_epoch(&mut self, step: usize, summary: &EpochSummary) {
        if self.settings.enable_stdout {
            println!("{summary}");
        }
        let mut scalars = summary.scalars();
        scalars.push(("epoch".to_string(), summary.epoch as f64));
        self.emit(step, &scalars);
    }

    pub fn finish(&mut self) {
        if let Err(err) = self.tracker.finish() {
            log::warn!("experiment tracker finish failed: {err}");
        }
    }

    fn emit(&mut self, step: usize, scalars: &[(String, f64)]) {
        if let Err(err) = self.tracker.log(step, scalars) {
            log::warn!("experiment tracker rejected step {step}: {err}");
        }
    }
}

struct TensorBoardWriter {
    writer: BufWriter<File>,
    flush_every: usize,
    pending: usize,
}

impl TensorBoardWriter {
    fn create(dir: &Path, flush_every: usize) -> Result<Self, TrainingError> {
        fs::create_dir_all(dir).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to create tensorboard directory {}: {err}",
                dir.display()
            ))
        })?;
        let filename = format!(
            "events.out.tfevents.{}.{}",
            current_unix_timestamp(),
            hostname()
        );
        let path = dir.join(filename);
        let file = File::create(&path).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to create tensorboard file {}: {err}",
                path.display()
            ))
        })?;
        Ok(Self {
            writer: BufWriter::new(file),
            flush_every: flush_every.max(1),
            pending: 0,
        })
    }

    fn write_scalar(&mut self, tag: &str, step: i64, value: f64) -> Result<(), TrainingError> {
        let event = Event {
            wall_time: current_wall_time(),
            step,
            summary: Some(Summary {
                value: vec![summary::Value {
                    tag: tag.to_string(),
                    simple_value: Some(value as f32),
                }],
            }),
        };
        self.write_event(&event)
    }

    /// TFRecord framing: length, masked CRC of length, payload, masked CRC
    /// of payload.
    fn write_event(&mut self, event: &Event) -> Result<(), TrainingError> {
        let mut buffer = BytesMut::with_capacity(128);
        event.encode(&mut buffer).map_err(|err| {
            TrainingError::runtime(format!("failed to encode tensorboard event: {err}"))
        })?;
        let data = buffer.freeze();

        let len_bytes = (data.len() as u64).to_le_bytes();
        let len_crc_bytes = masked_crc32(&len_bytes).to_le_bytes();
        let data_crc_bytes = masked_crc32(data.as_ref()).to_le_bytes();

        self.writer
            .write_all(&len_bytes)
            .and_then(|_| self.writer.write_all(&len_crc_bytes))
            .and_then(|_| self.writer.write_all(&data))
            .and_then(|_| self.writer.write_all(&data_crc_bytes))
            .map_err(|err| {
                TrainingError::runtime(format!("failed to write tensorboard event: {err}"))
            })?;

        self.pending += 1;
        if self.pending >= self.flush_every {
            self.flush()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), TrainingError> {
        self.writer.flush().map_err(|err| {
            TrainingError::runtime(format!("failed to flush tensorboard file: {err}"))
        })?;
        self.pending = 0;
        Ok(())
    }
}

impl Drop for TensorBoardWriter {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

fn masked_crc32(data: &[u8]) -> u32 {
    let mut hasher = Crc32::new();
    hasher.update(data);
    let crc = hasher.finalize();
    ((crc >> 15) | (crc << 17)).wrapping_add(0xa282_ead8)
}

fn current_unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn current_wall_time() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|dur| dur.as_secs_f64())
        .unwrap_or(0.0)
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "localhost".to_string())
}

#[derive(Clone, PartialEq, Message)]
struct Event {
    #[prost(double, tag = "1")]
    wall_time: f64,
    #[prost(int64, tag = "2")]
    step: i64,
    #[prost(message, optional, tag = "5")]
    summary: Option<Summary>,
}

#[derive(Clone, PartialEq, Message)]
struct Summary {
    #[prost(message, repeated, tag = "1")]
    value: Vec<summary::Value>,
}

mod summary {
    use prost::Message;

    #[derive(Clone, PartialEq, Message)]
    pub struct Value {
        #[prost(string, tag = "1")]
        pub tag: String,
        #[prost(float, optional, tag = "2")]
        pub simple_value: Option<f32>,
    }
}
