//! Epoch-keyed checkpoints with atomic publication.
//!
//! A checkpoint directory is assembled under a hidden staging name next to
//! its final location and renamed into place once every file and the
//! manifest are on disk. Readers therefore see either the previous
//! checkpoint or the complete new one.

use std::{
    collections::HashMap,
    fs::{self, File},
    io::{Read, Write},
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use candle_core::{Device, Tensor};
use classifier::ClassifierModel;
use hex::encode as hex_encode;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{
    distributed::ProcessGroup,
    optimizer::{
        GradientScaler, GradientScalerState, OptimizerMetadata, OptimizerState, TrainerOptimizer,
    },
    TrainingError,
};

pub const CHECKPOINT_VERSION: u32 = 1;
const MODEL_FILENAME: &str = "model.safetensors";
const OPTIMIZER_TENSORS_FILENAME: &str = "optimizer.safetensors";
const OPTIMIZER_FILENAME: &str = "optimizer.json";
const SCALER_FILENAME: &str = "scaler.json";
const MANIFEST_FILENAME: &str = "manifest.json";
const FINAL_DIR: &str = "final";
const EPOCH_PREFIX: &str = "epoch_";

/// Which save slot a checkpoint occupies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointKind {
    /// Periodic save after the given 1-based epoch.
    Epoch(usize),
    /// Save at run completion.
    Final,
}

impl CheckpointKind {
    pub fn dir_name(&self) -> String {
        match self {
            CheckpointKind::Epoch(epoch) => format!("{EPOCH_PREFIX}{epoch:04}"),
            CheckpointKind::Final => FINAL_DIR.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    pub filename: String,
    pub sha256: String,
    pub bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointManifest {
    pub version: u32,
    pub created_unix_timestamp: u64,
    pub config_sha256: String,
    pub kind: CheckpointKind,
    /// Last completed epoch; training resumes at `epoch + 1`.
    pub epoch: usize,
    pub model: FileRecord,
    pub optimizer_tensors: FileRecord,
    pub optimizer: FileRecord,
    pub scaler: Option<FileRecord>,
}

/// Everything needed to continue a run from an epoch boundary.
#[derive(Debug, Clone)]
pub struct CheckpointState {
    pub epoch: usize,
    pub model: HashMap<String, Tensor>,
    pub optimizer: OptimizerState,
    pub scaler: Option<GradientScalerState>,
}

impl CheckpointState {
    pub fn capture(
        epoch: usize,
        model: &ClassifierModel,
        optimizer: &TrainerOptimizer,
        scaler: &GradientScaler,
    ) -> Self {
        Self {
            epoch,
            model: model.state_dict(),
            optimizer: optimizer.state(),
            scaler: scaler.state(),
        }
    }

    /// Writes the snapshot back into live training objects.
    pub fn restore(
        self,
        model: &ClassifierModel,
        optimizer: &mut TrainerOptimizer,
        scaler: &mut GradientScaler,
    ) -> Result<(), TrainingError> {
        model
            .load_state_dict(self.model, true)
            .map_err(|err| TrainingError::runtime(format!("failed to restore model: {err}")))?;
        optimizer.load_state(self.optimizer)?;
        match (self.scaler, scaler.is_enabled()) {
            (Some(state), true) => scaler.load_state(&state)?,
            (None, false) => {}
            (Some(_), false) => {
                log::warn!("checkpoint carries a loss scale but scaling is disabled; ignoring it")
            }
            (None, true) => log::warn!(
                "checkpoint has no loss scale; keeping the initial scale {}",
                scaler.loss_scale()
            ),
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct CheckpointDescriptor {
    pub directory: PathBuf,
    pub manifest: CheckpointManifest,
}

/// Persists run state under one root directory.
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    root: PathBuf,
    config_sha256: String,
}

impl CheckpointManager {
    pub fn new(root: impl Into<PathBuf>, config_sha256: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            config_sha256: config_sha256.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn directory(&self, kind: CheckpointKind) -> PathBuf {
        self.root.join(kind.dir_name())
    }

    /// Writes `state` into the slot for `kind`. Only the coordinator touches
    /// the filesystem; other ranks return `Ok(None)`.
    pub fn save(
        &self,
        group: &ProcessGroup,
        kind: CheckpointKind,
        state: &CheckpointState,
    ) -> Result<Option<CheckpointDescriptor>, TrainingError> {
        if !group.is_coordinator() {
            return Ok(None);
        }
        self.write(kind, state).map(Some)
    }

    fn write(
        &self,
        kind: CheckpointKind,
        state: &CheckpointState,
    ) -> Result<CheckpointDescriptor, TrainingError> {
        fs::create_dir_all(&self.root).map_err(|err| {
            TrainingError::checkpoint_io(&self.root, format!("failed to create root: {err}"))
        })?;

        let name = kind.dir_name();
        let target = self.root.join(&name);
        let staging = self.root.join(format!(".{name}.partial"));
        remove_if_exists(&staging)?;
        fs::create_dir(&staging).map_err(|err| {
            TrainingError::checkpoint_io(&staging, format!("failed to create staging dir: {err}"))
        })?;

        let manifest = match self.write_contents(&staging, kind, state) {
            Ok(manifest) => manifest,
            Err(err) => {
                let _ = fs::remove_dir_all(&staging);
                return Err(err);
            }
        };
        publish(&self.root, &name, &staging, &target)?;

        log::info!(
            "saved checkpoint for epoch {} to {}",
            state.epoch,
            target.display()
        );
        Ok(CheckpointDescriptor {
            directory: target,
            manifest,
        })
    }

    fn write_contents(
        &self,
        dir: &Path,
        kind: CheckpointKind,
        state: &CheckpointState,
    ) -> Result<CheckpointManifest, TrainingError> {
        if state.model.is_empty() {
            return Err(TrainingError::checkpoint_io(
                dir,
                "model contains no parameters to checkpoint",
            ));
        }
        let model_path = dir.join(MODEL_FILENAME);
        save_tensors(&state.model, &model_path)?;

        let (metadata, tensors) = state.optimizer.clone().into_parts();
        let optimizer_tensors_path = dir.join(OPTIMIZER_TENSORS_FILENAME);
        save_tensors(&tensors, &optimizer_tensors_path)?;
        let optimizer_path = dir.join(OPTIMIZER_FILENAME);
        write_json(&optimizer_path, &metadata)?;

        let scaler = match &state.scaler {
            Some(scaler_state) => {
                let path = dir.join(SCALER_FILENAME);
                write_json(&path, scaler_state)?;
                Some(file_record(&path)?)
            }
            None => None,
        };

        let manifest = CheckpointManifest {
            version: CHECKPOINT_VERSION,
            created_unix_timestamp: unix_timestamp(),
            config_sha256: self.config_sha256.clone(),
            kind,
            epoch: state.epoch,
            model: file_record(&model_path)?,
            optimizer_tensors: file_record(&optimizer_tensors_path)?,
            optimizer: file_record(&optimizer_path)?,
            scaler,
        };
        write_json(&dir.join(MANIFEST_FILENAME), &manifest)?;
        Ok(manifest)
    }

    /// Most recent complete checkpoint under the root, by epoch. A final
    /// save wins over a periodic save of the same epoch.
    pub fn latest(&self) -> Result<Option<CheckpointDescriptor>, TrainingError> {
        let mut best: Option<CheckpointDescriptor> = None;
        for directory in checkpoint_directories(&self.root)? {
            let manifest = load_manifest(&directory)?;
            let newer = match &best {
                None => true,
                Some(current) => {
                    (manifest.epoch, manifest.kind == CheckpointKind::Final)
                        > (
                            current.manifest.epoch,
                            current.manifest.kind == CheckpointKind::Final,
                        )
                }
            };
            if newer {
                best = Some(CheckpointDescriptor {
                    directory,
                    manifest,
                });
            }
        }
        Ok(best)
    }
}

/// Reads and verifies a checkpoint directory. Tensors are placed on
/// `device`.
pub fn load_checkpoint(
    directory: &Path,
    device: &Device,
) -> Result<(CheckpointManifest, CheckpointState), TrainingError> {
    let manifest = load_manifest(directory)?;
    if manifest.version != CHECKPOINT_VERSION {
        return Err(TrainingError::checkpoint_io(
            directory,
            format!(
                "unsupported checkpoint version {} (expected {CHECKPOINT_VERSION})",
                manifest.version
            ),
        ));
    }

    let model_path = verified(directory, &manifest.model)?;
    let model = load_tensors(&model_path, device)?;

    let tensors_path = verified(directory, &manifest.optimizer_tensors)?;
    let tensors = load_tensors(&tensors_path, device)?;
    let metadata_path = verified(directory, &manifest.optimizer)?;
    let metadata: OptimizerMetadata = read_json(&metadata_path)?;
    let optimizer = OptimizerState::from_parts(metadata, tensors)
        .map_err(|err| TrainingError::checkpoint_io(&tensors_path, err.to_string()))?;

    let scaler = match &manifest.scaler {
        Some(record) => {
            let path = verified(directory, record)?;
            Some(read_json::<GradientScalerState>(&path)?)
        }
        None => None,
    };

    let state = CheckpointState {
        epoch: manifest.epoch,
        model,
        optimizer,
        scaler,
    };
    Ok((manifest, state))
}

/// SHA-256 of the JSON encoding of `config`.
pub fn fingerprint_config<T: Serialize>(config: &T) -> Result<String, TrainingError> {
    let json = serde_json::to_vec(config)
        .map_err(|err| TrainingError::runtime(format!("failed to hash config: {err}")))?;
    Ok(hex_encode(Sha256::digest(json)))
}

fn publish(root: &Path, name: &str, staging: &Path, target: &Path) -> Result<(), TrainingError> {
    let stale = root.join(format!(".{name}.stale"));
    let replaced = target.exists();
    if replaced {
        remove_if_exists(&stale)?;
        fs::rename(target, &stale).map_err(|err| {
            let _ = fs::remove_dir_all(staging);
            TrainingError::checkpoint_io(target, format!("failed to move previous checkpoint: {err}"))
        })?;
    }
    if let Err(err) = fs::rename(staging, target) {
        if replaced {
            let _ = fs::rename(&stale, target);
        }
        let _ = fs::remove_dir_all(staging);
        return Err(TrainingError::checkpoint_io(
            target,
            format!("failed to publish checkpoint: {err}"),
        ));
    }
    if replaced {
        if let Err(err) = fs::remove_dir_all(&stale) {
            log::warn!("failed to remove {}: {err}", stale.display());
        }
    }
    Ok(())
}

fn remove_if_exists(path: &Path) -> Result<(), TrainingError> {
    if path.exists() {
        fs::remove_dir_all(path)
            .map_err(|err| TrainingError::checkpoint_io(path, format!("failed to remove: {err}")))?;
    }
    Ok(())
}

fn save_tensors(tensors: &HashMap<String, Tensor>, path: &Path) -> Result<(), TrainingError> {
    candle_core::safetensors::save(tensors, path)
        .map_err(|err| TrainingError::checkpoint_io(path, format!("failed to write tensors: {err}")))
}

fn load_tensors(path: &Path, device: &Device) -> Result<HashMap<String, Tensor>, TrainingError> {
    candle_core::safetensors::load(path, device)
        .map_err(|err| TrainingError::checkpoint_io(path, format!("failed to read tensors: {err}")))
}

fn verified(directory: &Path, record: &FileRecord) -> Result<PathBuf, TrainingError> {
    let path = directory.join(&record.filename);
    let actual = sha256_file(&path)?;
    if actual != record.sha256 {
        return Err(TrainingError::checkpoint_io(
            &path,
            "file failed checksum validation",
        ));
    }
    Ok(path)
}

fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn file_record(path: &Path) -> Result<FileRecord, TrainingError> {
    let sha256 = sha256_file(path)?;
    let bytes = path
        .metadata()
        .map_err(|err| TrainingError::checkpoint_io(path, format!("failed to stat: {err}")))?
        .len();
    let filename = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| TrainingError::checkpoint_io(path, "file name is not valid UTF-8"))?
        .to_string();
    Ok(FileRecord {
        filename,
        sha256,
        bytes,
    })
}

fn checkpoint_directories(root: &Path) -> Result<Vec<PathBuf>, TrainingError> {
    let mut dirs = Vec::new();
    if !root.exists() {
        return Ok(dirs);
    }
    let entries = fs::read_dir(root)
        .map_err(|err| TrainingError::checkpoint_io(root, format!("failed to list: {err}")))?;
    for entry in entries {
        let entry = entry
            .map_err(|err| TrainingError::checkpoint_io(root, format!("failed to list: {err}")))?;
        let is_dir = entry
            .file_type()
            .map(|file_type| file_type.is_dir())
            .unwrap_or(false);
        if !is_dir {
            continue;
        }
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name == FINAL_DIR || name.starts_with(EPOCH_PREFIX) {
            dirs.push(entry.path());
        }
    }
    dirs.sort();
    Ok(dirs)
}

fn load_manifest(directory: &Path) -> Result<CheckpointManifest, TrainingError> {
    let path = directory.join(MANIFEST_FILENAME);
    if !path.is_file() {
        return Err(TrainingError::checkpoint_io(&path, "manifest not found"));
    }
    read_json(&path)
}

fn sha256_file(path: &Path) -> Result<String, TrainingError> {
    let mut file = File::open(path)
        .map_err(|err| TrainingError::checkpoint_io(path, format!("failed to open: {err}")))?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 64 * 1024];
    loop {
        let read = file
            .read(&mut buffer)
            .map_err(|err| TrainingError::checkpoint_io(path, format!("failed to read: {err}")))?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex_encode(hasher.finalize()))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), TrainingError> {
    let data = serde_json::to_vec_pretty(value)
        .map_err(|err| TrainingError::checkpoint_io(path, format!("failed to encode JSON: {err}")))?;
    let mut file = File::create(path)
        .map_err(|err| TrainingError::checkpoint_io(path, format!("failed to create: {err}")))?;
    file.write_all(&data)
        .and_then(|_| file.write_all(b"\n"))
        .map_err(|err| TrainingError::checkpoint_io(path, format!("failed to write: {err}")))
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, TrainingError> {
    let file = File::open(path)
        .map_err(|err| TrainingError::checkpoint_io(path, format!("failed to open: {err}")))?;
    serde_json::from_reader(file)
        .map_err(|err| TrainingError::checkpoint_io(path, format!("failed to parse JSON: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimizer::{GroupState, ParameterState};

    fn tensor(values: &[f32], shape: (usize, usize)) -> Tensor {
        Tensor::from_slice(values, shape, &Device::Cpu).unwrap()
    }

    fn sample_state(epoch: usize) -> CheckpointState {
        let mut model = HashMap::new();
        model.insert(
            "head.weight".to_string(),
            tensor(&[0.1, -0.2, 0.3, 1e-7, -3.5, 7.25], (2, 3)),
        );
        model.insert("head.bias".to_string(), tensor(&[0.5, -0.5], (1, 2)));
        let optimizer = OptimizerState {
            step: 17,
            groups: vec![
                GroupState {
                    name: "base_model".into(),
                    learning_rate: 5e-5,
                },
                GroupState {
                    name: "classifier".into(),
                    learning_rate: 1e-4,
                },
            ],
            parameters: vec![ParameterState {
                name: "head.weight".into(),
                first_moment: tensor(&[1e-3, 2e-3, -3e-3, 4e-3, 5e-3, f32::MIN_POSITIVE], (2, 3)),
                second_moment: tensor(&[1e-6, 2e-6, 3e-6, 4e-6, 5e-6, 6e-6], (2, 3)),
                master: Some(tensor(&[0.1, -0.2, 0.3, 1e-7, -3.5, 7.25], (2, 3))),
            }],
        };
        CheckpointState {
            epoch,
            model,
            optimizer,
            scaler: Some(GradientScalerState {
                loss_scale: 16384.0,
                stable_steps: 3,
            }),
        }
    }

    fn values(tensor: &Tensor) -> Vec<f32> {
        tensor.flatten_all().unwrap().to_vec1::<f32>().unwrap()
    }

    #[test]
    fn round_trip_is_bit_identical() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path(), "cfg");
        let state = sample_state(3);

        let saved = manager
            .save(&ProcessGroup::single(), CheckpointKind::Epoch(3), &state)
            .unwrap()
            .unwrap();
        assert_eq!(saved.directory, dir.path().join("epoch_0003"));

        let (manifest, loaded) = load_checkpoint(&saved.directory, &Device::Cpu).unwrap();
        assert_eq!(manifest.epoch, 3);
        assert_eq!(manifest.config_sha256, "cfg");
        assert_eq!(loaded.epoch, 3);
        for (name, original) in &state.model {
            let restored = &loaded.model[name];
            assert_eq!(restored.dims(), original.dims());
            let bits = |t: &Tensor| values(t).iter().map(|v| v.to_bits()).collect::<Vec<_>>();
            assert_eq!(bits(restored), bits(original));
        }
        assert_eq!(loaded.optimizer.step, 17);
        assert_eq!(loaded.optimizer.groups, state.optimizer.groups);
        let original = &state.optimizer.parameters[0];
        let restored = &loaded.optimizer.parameters[0];
        assert_eq!(values(&restored.first_moment), values(&original.first_moment));
        assert_eq!(values(&restored.second_moment), values(&original.second_moment));
        assert_eq!(
            values(restored.master.as_ref().unwrap()),
            values(original.master.as_ref().unwrap())
        );
        assert_eq!(loaded.scaler, state.scaler);
    }

    #[test]
    fn periodic_and_final_saves_do_not_collide() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path(), "cfg");
        let group = ProcessGroup::single();
        for kind in [
            CheckpointKind::Epoch(2),
            CheckpointKind::Epoch(4),
            CheckpointKind::Final,
        ] {
            let epoch = match kind {
                CheckpointKind::Epoch(epoch) => epoch,
                CheckpointKind::Final => 4,
            };
            manager.save(&group, kind, &sample_state(epoch)).unwrap();
        }

        let mut names: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(names, vec!["epoch_0002", "epoch_0004", "final"]);

        let latest = manager.latest().unwrap().unwrap();
        assert_eq!(latest.manifest.kind, CheckpointKind::Final);
        assert_eq!(latest.manifest.epoch, 4);
    }

    #[test]
    fn overwriting_a_slot_replaces_it_completely() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path(), "cfg");
        let group = ProcessGroup::single();
        manager
            .save(&group, CheckpointKind::Final, &sample_state(1))
            .unwrap();
        manager
            .save(&group, CheckpointKind::Final, &sample_state(5))
            .unwrap();

        let (manifest, _) = load_checkpoint(&manager.directory(CheckpointKind::Final), &Device::Cpu)
            .unwrap();
        assert_eq!(manifest.epoch, 5);
        let hidden = fs::read_dir(dir.path())
            .unwrap()
            .filter(|entry| {
                entry
                    .as_ref()
                    .unwrap()
                    .file_name()
                    .to_string_lossy()
                    .starts_with('.')
            })
            .count();
        assert_eq!(hidden, 0);
    }

    #[test]
    fn corrupted_files_fail_with_checkpoint_io() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path(), "cfg");
        let saved = manager
            .save(&ProcessGroup::single(), CheckpointKind::Epoch(1), &sample_state(1))
            .unwrap()
            .unwrap();
        fs::write(saved.directory.join(OPTIMIZER_FILENAME), b"{}").unwrap();

        let err = load_checkpoint(&saved.directory, &Device::Cpu).unwrap_err();
        assert!(matches!(err, TrainingError::CheckpointIo { .. }));

        let missing = load_checkpoint(&dir.path().join("epoch_0009"), &Device::Cpu).unwrap_err();
        assert!(matches!(missing, TrainingError::CheckpointIo { .. }));
    }

    #[test]
    fn only_the_coordinator_writes() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path(), "cfg");
        let groups = ProcessGroup::group(2);
        let written = manager
            .save(&groups[1], CheckpointKind::Epoch(2), &sample_state(2))
            .unwrap();
        assert!(written.is_none());
        assert!(!dir.path().join("epoch_0002").exists());
    }

    #[test]
    fn fingerprint_is_stable() {
        let a = fingerprint_config(&serde_json::json!({"epochs": 5})).unwrap();
        let b = fingerprint_config(&serde_json::json!({"epochs": 5})).unwrap();
        let c = fingerprint_config(&serde_json::json!({"epochs": 6})).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }
}
