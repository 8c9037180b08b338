use std::{path::Path, sync::Arc};

use candle_core::{Device, Tensor};
use futures::future::BoxFuture;
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use tokenizers::Tokenizer;

use crate::{distributed::ProcessGroup, TrainingError};

/// Result alias for data pipeline fallible operations.
pub type Result<T> = std::result::Result<T, TrainingError>;

/// One tokenized, labelled text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Example {
    pub input_ids: Vec<u32>,
    pub label: u32,
}

/// Tokenized classification examples held in memory.
#[derive(Debug, Clone)]
pub struct ClassificationDataset {
    examples: Vec<Example>,
    pad_token_id: u32,
}

impl ClassificationDataset {
    pub fn new(examples: Vec<Example>, pad_token_id: u32) -> Result<Self> {
        if let Some(position) = examples.iter().position(|ex| ex.input_ids.is_empty()) {
            return Err(TrainingError::runtime(format!(
                "example {position} has no tokens"
            )));
        }
        Ok(Self {
            examples,
            pad_token_id,
        })
    }

    /// Reads `text_column` and `label_column` from a CSV file with a header row.
    ///
    /// Texts are truncated to `max_length` tokens; labels must lie in
    /// `[0, num_classes)`.
    pub fn from_csv(path: &Path, tokenizer: &Tokenizer, options: &CsvOptions) -> Result<Self> {
        let mut reader = csv::Reader::from_path(path).map_err(|err| {
            TrainingError::runtime(format!("failed to open dataset {}: {err}", path.display()))
        })?;
        let headers = reader
            .headers()
            .map_err(|err| {
                TrainingError::runtime(format!("failed to read header of {}: {err}", path.display()))
            })?
            .clone();
        let column = |name: &str| {
            headers.iter().position(|h| h == name).ok_or_else(|| {
                TrainingError::configuration(format!(
                    "column '{name}' not found in {}",
                    path.display()
                ))
            })
        };
        let text_idx = column(&options.text_column)?;
        let label_idx = column(&options.label_column)?;

        let mut texts = Vec::new();
        let mut labels = Vec::new();
        for (row, record) in reader.records().enumerate() {
            let record = record.map_err(|err| {
                TrainingError::runtime(format!("{}: row {row}: {err}", path.display()))
            })?;
            let text = record.get(text_idx).unwrap_or_default();
            let raw_label = record.get(label_idx).unwrap_or_default().trim();
            let label: u32 = raw_label.parse().map_err(|_| {
                TrainingError::runtime(format!(
                    "{}: row {row}: label '{raw_label}' is not a class index",
                    path.display()
                ))
            })?;
            if label as usize >= options.num_classes {
                return Err(TrainingError::runtime(format!(
                    "{}: row {row}: label {label} outside [0, {})",
                    path.display(),
                    options.num_classes
                )));
            }
            texts.push(text.to_string());
            labels.push(label);
        }

        let pad_token_id = options.pad_token_id;
        let encodings = tokenizer
            .encode_batch(texts, true)
            .map_err(|err| TrainingError::runtime(format!("tokenization failed: {err}")))?;
        let examples = encodings
            .into_iter()
            .zip(labels)
            .map(|(encoding, label)| {
                let mut input_ids: Vec<u32> = encoding.get_ids().to_vec();
                input_ids.truncate(options.max_length);
                if input_ids.is_empty() {
                    input_ids.push(pad_token_id);
                }
                Example { input_ids, label }
            })
            .collect();

        log::info!("loaded dataset {}", path.display());
        Self::new(examples, pad_token_id)
    }

    pub fn len(&self) -> usize {
        self.examples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.examples.is_empty()
    }

    pub fn examples(&self) -> &[Example] {
        &self.examples
    }

    pub fn pad_token_id(&self) -> u32 {
        self.pad_token_id
    }
}

/// Column layout and limits for [`ClassificationDataset::from_csv`].
#[derive(Debug, Clone)]
pub struct CsvOptions {
    pub text_column: String,
    pub label_column: String,
    pub max_length: usize,
    pub num_classes: usize,
    pub pad_token_id: u32,
}

/// Shard of a global batch assigned to one rank.
#[derive(Debug)]
pub struct Batch {
    /// `(rows, seq)` token ids, right padded.
    pub input_ids: Tensor,
    /// `(rows, seq)` with 1 for real tokens and 0 for padding.
    pub attention_mask: Tensor,
    /// `(rows,)` class indices.
    pub labels: Tensor,
    /// Leading rows that are genuine samples; the rest repeat earlier samples
    /// to keep shards equally sized.
    pub valid_rows: usize,
    pub epoch: usize,
    pub step: usize,
}

/// Asynchronous-compatible loader abstraction.
pub trait DataLoader: Send {
    /// Resets iteration for `epoch`; must be called before the first batch.
    fn start_epoch(&mut self, epoch: usize) -> Result<()>;

    fn next_batch(&mut self) -> BoxFuture<'_, Result<Option<Batch>>>;

    fn batches_per_epoch(&self) -> usize;
}

impl<L: DataLoader + ?Sized> DataLoader for Box<L> {
    fn start_epoch(&mut self, epoch: usize) -> Result<()> {
        (**self).start_epoch(epoch)
    }

    fn next_batch(&mut self) -> BoxFuture<'_, Result<Option<Batch>>> {
        (**self).next_batch()
    }

    fn batches_per_epoch(&self) -> usize {
        (**self).batches_per_epoch()
    }
}

/// Blocking adapter around an async-friendly loader.
pub struct BlockingDataLoader<L>
where
    L: DataLoader,
{
    inner: L,
}

impl<L> BlockingDataLoader<L>
where
    L: DataLoader,
{
    pub fn new(inner: L) -> Self {
        Self { inner }
    }

    pub fn start_epoch(&mut self, epoch: usize) -> Result<()> {
        self.inner.start_epoch(epoch)
    }

    pub fn next_batch(&mut self) -> Result<Option<Batch>> {
        futures::executor::block_on(self.inner.next_batch())
    }

    pub fn batches_per_epoch(&self) -> usize {
        self.inner.batches_per_epoch()
    }

    pub fn into_inner(self) -> L {
        self.inner
    }
}

/// Loader with split-batches semantics: the configured batch size is the
/// global size and every rank receives an equal contiguous shard of it.
pub struct ShardedDataLoader {
    dataset: Arc<ClassificationDataset>,
    device: Device,
    global_batch_size: usize,
    shard_size: usize,
    rank: usize,
    shuffle: bool,
    seed: u64,
    order: Vec<usize>,
    cursor: usize,
    epoch: usize,
    step: usize,
}

impl ShardedDataLoader {
    pub fn new(
        dataset: Arc<ClassificationDataset>,
        group: &ProcessGroup,
        device: Device,
        global_batch_size: usize,
        shuffle: bool,
        seed: u64,
    ) -> Result<Self> {
        if global_batch_size == 0 {
            return Err(TrainingError::configuration(
                "batch size must be greater than zero",
            ));
        }
        let world = group.world_size();
        if global_batch_size % world != 0 {
            return Err(TrainingError::configuration(format!(
                "global batch size {global_batch_size} cannot be split evenly across {world} devices"
            )));
        }
        if dataset.is_empty() {
            return Err(TrainingError::configuration("dataset is empty"));
        }
        Ok(Self {
            shard_size: global_batch_size / world,
            dataset,
            device,
            global_batch_size,
            rank: group.rank(),
            shuffle,
            seed,
            order: Vec::new(),
            cursor: 0,
            epoch: 0,
            step: 0,
        })
    }

    pub fn shard_size(&self) -> usize {
        self.shard_size
    }

    fn build_batch(&mut self) -> Result<Option<Batch>> {
        let total = self.order.len();
        if self.cursor >= total {
            return Ok(None);
        }

        let genuine = (total - self.cursor).min(self.global_batch_size);
        let shard_start = self.rank * self.shard_size;
        let rows: Vec<&Example> = (shard_start..shard_start + self.shard_size)
            .map(|offset| {
                let position = (self.cursor + offset) % total;
                &self.dataset.examples[self.order[position]]
            })
            .collect();
        let valid_rows = genuine.saturating_sub(shard_start).min(self.shard_size);

        let width = rows.iter().map(|ex| ex.input_ids.len()).max().unwrap_or(1);
        let pad = self.dataset.pad_token_id;
        let mut ids = Vec::with_capacity(rows.len() * width);
        let mut mask = Vec::with_capacity(rows.len() * width);
        for example in &rows {
            let len = example.input_ids.len();
            ids.extend_from_slice(&example.input_ids);
            ids.extend(std::iter::repeat(pad).take(width - len));
            mask.extend(std::iter::repeat(1u32).take(len));
            mask.extend(std::iter::repeat(0u32).take(width - len));
        }
        let labels: Vec<u32> = rows.iter().map(|ex| ex.label).collect();

        let shape = (rows.len(), width);
        let batch = Batch {
            input_ids: Tensor::from_vec(ids, shape, &self.device).map_err(|err| {
                TrainingError::runtime(format!("failed to materialize token tensor: {err}"))
            })?,
            attention_mask: Tensor::from_vec(mask, shape, &self.device).map_err(|err| {
                TrainingError::runtime(format!("failed to materialize attention mask: {err}"))
            })?,
            labels: Tensor::from_vec(labels, rows.len(), &self.device).map_err(|err| {
                TrainingError::runtime(format!("failed to materialize labels: {err}"))
            })?,
            valid_rows,
            epoch: self.epoch,
            step: self.step,
        };

        self.cursor += self.global_batch_size;
        self.step += 1;
        Ok(Some(batch))
    }
}

impl DataLoader for ShardedDataLoader {
    fn start_epoch(&mut self, epoch: usize) -> Result<()> {
        self.order = (0..self.dataset.len()).collect();
        if self.shuffle {
            let mut rng = StdRng::seed_from_u64(self.seed ^ (epoch as u64).wrapping_mul(0x9e37_79b9));
            self.order.shuffle(&mut rng);
        }
        self.cursor = 0;
        self.step = 0;
        self.epoch = epoch;
        Ok(())
    }

    fn next_batch(&mut self) -> BoxFuture<'_, Result<Option<Batch>>> {
        Box::pin(async move { self.build_batch() })
    }

    fn batches_per_epoch(&self) -> usize {
        self.dataset.len().div_ceil(self.global_batch_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dataset(n: usize) -> Arc<ClassificationDataset> {
        let examples = (0..n)
            .map(|i| Example {
                input_ids: vec![i as u32 + 1; 1 + i % 3],
                label: (i % 4) as u32,
            })
            .collect();
        Arc::new(ClassificationDataset::new(examples, 0).unwrap())
    }

    fn labels(batch: &Batch) -> Vec<u32> {
        batch.labels.to_vec1::<u32>().unwrap()
    }

    #[test]
    fn shards_partition_the_global_batch() {
        let data = dataset(8);
        let groups = ProcessGroup::group(2);
        let mut seen = Vec::new();
        for group in &groups {
            let mut loader = BlockingDataLoader::new(
                ShardedDataLoader::new(data.clone(), group, Device::Cpu, 4, false, 0).unwrap(),
            );
            loader.start_epoch(1).unwrap();
            let batch = loader.next_batch().unwrap().unwrap();
            assert_eq!(batch.labels.dims(), &[2]);
            assert_eq!(batch.valid_rows, 2);
            seen.extend(batch.input_ids.to_vec2::<u32>().unwrap().into_iter().map(|row| row[0]));
        }
        assert_eq!(seen, vec![1, 2, 3, 4]);
    }

    #[test]
    fn short_final_batch_wraps_and_marks_valid_rows() {
        let data = dataset(5);
        let groups = ProcessGroup::group(2);
        let mut valid = Vec::new();
        for group in &groups {
            let mut loader = BlockingDataLoader::new(
                ShardedDataLoader::new(data.clone(), group, Device::Cpu, 4, false, 0).unwrap(),
            );
            loader.start_epoch(1).unwrap();
            assert_eq!(loader.batches_per_epoch(), 2);
            loader.next_batch().unwrap().unwrap();
            let last = loader.next_batch().unwrap().unwrap();
            assert_eq!(last.labels.dims(), &[2]);
            valid.push(last.valid_rows);
            assert!(loader.next_batch().unwrap().is_none());
        }
        assert_eq!(valid, vec![1, 0]);
    }

    #[test]
    fn padding_and_mask_follow_lengths() {
        let data = dataset(3);
        let group = ProcessGroup::single();
        let mut loader = BlockingDataLoader::new(
            ShardedDataLoader::new(data, &group, Device::Cpu, 3, false, 0).unwrap(),
        );
        loader.start_epoch(1).unwrap();
        let batch = loader.next_batch().unwrap().unwrap();

        assert_eq!(
            batch.attention_mask.to_vec2::<u32>().unwrap(),
            vec![vec![1, 0, 0], vec![1, 1, 0], vec![1, 1, 1]]
        );
        assert_eq!(
            batch.input_ids.to_vec2::<u32>().unwrap(),
            vec![vec![1, 0, 0], vec![2, 2, 0], vec![3, 3, 3]]
        );
        assert_eq!(labels(&batch), vec![0, 1, 2]);
    }

    #[test]
    fn shuffle_is_shared_by_ranks_and_varies_by_epoch() {
        let data = dataset(16);
        let groups = ProcessGroup::group(2);
        let order = |group: &ProcessGroup, epoch: usize| {
            let mut loader = BlockingDataLoader::new(
                ShardedDataLoader::new(data.clone(), group, Device::Cpu, 16, true, 42).unwrap(),
            );
            loader.start_epoch(epoch).unwrap();
            loader.into_inner().order
        };
        assert_eq!(order(&groups[0], 1), order(&groups[1], 1));
        assert_ne!(order(&groups[0], 1), order(&groups[0], 2));
    }

    #[test]
    fn uneven_split_is_rejected() {
        let groups = ProcessGroup::group(2);
        let err = ShardedDataLoader::new(dataset(4), &groups[0], Device::Cpu, 3, true, 0)
            .err()
            .unwrap();
        assert!(matches!(err, TrainingError::Configuration(_)));
    }
}
