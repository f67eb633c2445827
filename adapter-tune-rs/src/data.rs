//! Pre-tokenized datasets and the micro-batch sampler.
//!
//! A data directory holds two JSON-lines files, `train.jsonl` and
//! `test.jsonl`, one [`TokenizedExample`] per line, plus a `config.json`
//! sidecar carrying `max_seq_length`.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use candle_core::{Device, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::error::{FinetuneError, Result};
use crate::loss::IGNORE_INDEX;

/// Padding id for inputs.
pub const PAD_ID: i64 = 0;

/// File name of the training split inside a data directory.
pub const TRAIN_FILE: &str = "train.jsonl";
/// File name of the validation split inside a data directory.
pub const TEST_FILE: &str = "test.jsonl";
/// File name of the data sidecar.
pub const DATA_CONFIG_FILE: &str = "config.json";

/// One tokenized example. `labels` carries [`IGNORE_INDEX`] where no loss applies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenizedExample {
    /// Input token ids.
    pub input_ids: Vec<u32>,
    /// Target token ids, aligned with `input_ids`.
    pub labels: Vec<i64>,
}

/// An indexable, read-only collection of tokenized examples.
#[derive(Debug, Clone, Default)]
pub struct Dataset {
    examples: Vec<TokenizedExample>,
}

impl Dataset {
    /// Build a dataset, checking every example.
    ///
    /// # Errors
    ///
    /// Returns [`FinetuneError::Dataset`] for an empty example or one whose
    /// labels are not aligned with its inputs.
    pub fn from_examples(examples: Vec<TokenizedExample>) -> Result<Self> {
        for (idx, example) in examples.iter().enumerate() {
            if example.input_ids.is_empty() {
                return Err(FinetuneError::Dataset(format!("example {idx} is empty")));
            }
            if example.input_ids.len() != example.labels.len() {
                return Err(FinetuneError::Dataset(format!(
                    "example {idx} has {} input ids but {} labels",
                    example.input_ids.len(),
                    example.labels.len()
                )));
            }
        }
        Ok(Self { examples })
    }

    /// Load a JSON-lines file. Blank lines are skipped.
    ///
    /// # Errors
    ///
    /// Returns an error when the file cannot be read or a line does not parse.
    pub fn load_jsonl<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| {
            FinetuneError::Dataset(format!("failed to open {}: {e}", path.display()))
        })?;

        let mut examples = Vec::new();
        for (line_no, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let example: TokenizedExample = serde_json::from_str(&line).map_err(|e| {
                FinetuneError::Dataset(format!("{}:{}: {e}", path.display(), line_no + 1))
            })?;
            examples.push(example);
        }
        Self::from_examples(examples)
    }

    /// Number of examples.
    #[must_use]
    pub fn len(&self) -> usize {
        self.examples.len()
    }

    /// Whether the dataset has no examples.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.examples.is_empty()
    }

    /// Example at `idx`.
    #[must_use]
    pub fn get(&self, idx: usize) -> Option<&TokenizedExample> {
        self.examples.get(idx)
    }

    /// Longest example, in tokens.
    #[must_use]
    pub fn longest(&self) -> usize {
        self.examples.iter().map(|e| e.input_ids.len()).max().unwrap_or(0)
    }
}

/// Load the `(train, validation)` splits from a data directory.
///
/// # Errors
///
/// Propagates [`Dataset::load_jsonl`] errors.
pub fn load_splits<P: AsRef<Path>>(data_dir: P) -> Result<(Dataset, Dataset)> {
    let data_dir = data_dir.as_ref();
    let train = Dataset::load_jsonl(data_dir.join(TRAIN_FILE))?;
    let val = Dataset::load_jsonl(data_dir.join(TEST_FILE))?;
    tracing::info!(
        "Loaded {} training and {} validation examples from {}",
        train.len(),
        val.len(),
        data_dir.display()
    );
    Ok((train, val))
}

/// Contents of the data directory's `config.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DataConfig {
    /// Longest sequence produced by the preparation step.
    #[serde(default)]
    pub max_seq_length: Option<usize>,
}

impl DataConfig {
    /// Read the sidecar.
    ///
    /// # Errors
    ///
    /// Returns an error when the file is missing or malformed.
    pub fn from_data_dir<P: AsRef<Path>>(data_dir: P) -> Result<Self> {
        let path = data_dir.as_ref().join(DATA_CONFIG_FILE);
        let content = std::fs::read_to_string(&path).map_err(|e| {
            FinetuneError::Dataset(format!("failed to read {}: {e}", path.display()))
        })?;
        Ok(serde_json::from_str(&content)?)
    }

    /// `max_seq_length`, defaulting to the model's block size.
    #[must_use]
    pub fn max_seq_length_or(&self, block_size: usize) -> usize {
        self.max_seq_length.unwrap_or(block_size)
    }
}

/// A micro-batch of right-padded `(input_ids, targets)`, both `(batch, seq)` `i64`.
#[derive(Debug, Clone)]
pub struct Batch {
    /// Inputs padded with [`PAD_ID`].
    pub input_ids: Tensor,
    /// Targets padded with [`IGNORE_INDEX`].
    pub targets: Tensor,
}

impl Batch {
    /// `(batch, seq)` of this batch.
    ///
    /// # Errors
    ///
    /// Returns an error if the input tensor is not 2-D.
    pub fn dims(&self) -> Result<(usize, usize)> {
        Ok(self.input_ids.dims2()?)
    }
}

/// Draws micro-batches uniformly, with replacement.
pub struct BatchSampler {
    micro_batch_size: usize,
    fixed_length: Option<usize>,
    rng: StdRng,
    device: Device,
}

impl BatchSampler {
    /// Create a sampler placing batches on `device`.
    #[must_use]
    pub fn new(micro_batch_size: usize, seed: u64, device: Device) -> Self {
        Self {
            micro_batch_size,
            fixed_length: None,
            rng: StdRng::seed_from_u64(seed),
            device,
        }
    }

    /// Pad every batch to `length` instead of to its longest example.
    #[must_use]
    pub fn with_fixed_length(mut self, length: usize) -> Self {
        self.fixed_length = Some(length);
        self
    }

    /// Examples per batch.
    #[must_use]
    pub fn micro_batch_size(&self) -> usize {
        self.micro_batch_size
    }

    /// Sample one batch from `data`.
    ///
    /// # Errors
    ///
    /// Returns [`FinetuneError::Dataset`] when `data` is empty.
    pub fn sample(&mut self, data: &Dataset) -> Result<Batch> {
        if data.is_empty() {
            return Err(FinetuneError::Dataset("cannot sample from an empty dataset".into()));
        }
        let picked: Vec<&TokenizedExample> = (0..self.micro_batch_size)
            .map(|_| &data.examples[self.rng.gen_range(0..data.len())])
            .collect();
        self.collate(&picked)
    }

    fn collate(&self, examples: &[&TokenizedExample]) -> Result<Batch> {
        let max_len = match self.fixed_length {
            Some(len) => len,
            None => examples.iter().map(|e| e.input_ids.len()).max().unwrap_or(0),
        };

        let mut inputs = Vec::with_capacity(examples.len() * max_len);
        let mut targets = Vec::with_capacity(examples.len() * max_len);
        for example in examples {
            let len = example.input_ids.len().min(max_len);
            if len < example.input_ids.len() {
                tracing::debug!(
                    "truncating example of {} tokens to {max_len}",
                    example.input_ids.len()
                );
            }
            inputs.extend(example.input_ids[..len].iter().map(|&id| i64::from(id)));
            inputs.extend(std::iter::repeat(PAD_ID).take(max_len - len));
            targets.extend_from_slice(&example.labels[..len]);
            targets.extend(std::iter::repeat(IGNORE_INDEX).take(max_len - len));
        }

        let shape = (examples.len(), max_len);
        Ok(Batch {
            input_ids: Tensor::from_vec(inputs, shape, &self.device)?,
            targets: Tensor::from_vec(targets, shape, &self.device)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn example(len: usize, offset: u32) -> TokenizedExample {
        let input_ids: Vec<u32> = (0..len as u32).map(|i| i + offset).collect();
        let mut labels: Vec<i64> = input_ids.iter().map(|&i| i64::from(i)).collect();
        labels[0] = IGNORE_INDEX;
        TokenizedExample { input_ids, labels }
    }

    fn dataset() -> Dataset {
        Dataset::from_examples(vec![example(3, 1), example(5, 10), example(7, 20)]).unwrap()
    }

    #[test]
    fn test_batch_shapes_match() {
        let data = dataset();
        let mut sampler = BatchSampler::new(4, 7, Device::Cpu);
        for _ in 0..10 {
            let batch = sampler.sample(&data).unwrap();
            assert_eq!(batch.input_ids.dims(), batch.targets.dims());
            assert_eq!(batch.dims().unwrap().0, 4);
        }
    }

    #[test]
    fn test_padding_values() {
        let data = Dataset::from_examples(vec![example(2, 5), example(4, 5)]).unwrap();
        let sampler = BatchSampler::new(2, 0, Device::Cpu);
        let batch = sampler
            .collate(&[data.get(0).unwrap(), data.get(1).unwrap()])
            .unwrap();

        let inputs = batch.input_ids.to_vec2::<i64>().unwrap();
        let targets = batch.targets.to_vec2::<i64>().unwrap();
        assert_eq!(inputs[0], vec![5, 6, PAD_ID, PAD_ID]);
        assert_eq!(targets[0], vec![IGNORE_INDEX, 6, IGNORE_INDEX, IGNORE_INDEX]);
        assert_eq!(inputs[1], vec![5, 6, 7, 8]);
    }

    #[test]
    fn test_fixed_length_padding() {
        let data = dataset();
        let mut sampler = BatchSampler::new(3, 1, Device::Cpu).with_fixed_length(9);
        let batch = sampler.sample(&data).unwrap();
        assert_eq!(batch.dims().unwrap(), (3, 9));
    }

    #[test]
    fn test_fixed_length_truncates() {
        let data = Dataset::from_examples(vec![example(7, 0)]).unwrap();
        let mut sampler = BatchSampler::new(1, 1, Device::Cpu).with_fixed_length(4);
        let batch = sampler.sample(&data).unwrap();
        assert_eq!(batch.input_ids.to_vec2::<i64>().unwrap()[0], vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_same_seed_same_batches() {
        let data = dataset();
        let mut a = BatchSampler::new(2, 42, Device::Cpu);
        let mut b = BatchSampler::new(2, 42, Device::Cpu);
        for _ in 0..5 {
            let x = a.sample(&data).unwrap().input_ids.to_vec2::<i64>().unwrap();
            let y = b.sample(&data).unwrap().input_ids.to_vec2::<i64>().unwrap();
            assert_eq!(x, y);
        }
    }

    #[test]
    fn test_sampling_does_not_mutate_dataset() {
        let data = dataset();
        let before = data.examples.clone();
        let mut sampler = BatchSampler::new(8, 3, Device::Cpu);
        sampler.sample(&data).unwrap();
        assert_eq!(before, data.examples);
    }

    #[test]
    fn test_empty_dataset_errors() {
        let mut sampler = BatchSampler::new(2, 0, Device::Cpu);
        assert!(sampler.sample(&Dataset::default()).is_err());
    }

    #[test]
    fn test_misaligned_example_rejected() {
        let bad = TokenizedExample {
            input_ids: vec![1, 2, 3],
            labels: vec![1, 2],
        };
        assert!(Dataset::from_examples(vec![bad]).is_err());
    }

    #[test]
    fn test_load_splits_and_sidecar() {
        let dir = TempDir::new().unwrap();
        let line = serde_json::to_string(&example(4, 3)).unwrap();
        std::fs::write(dir.path().join(TRAIN_FILE), format!("{line}\n\n{line}\n")).unwrap();
        std::fs::write(dir.path().join(TEST_FILE), format!("{line}\n")).unwrap();
        std::fs::write(dir.path().join(DATA_CONFIG_FILE), r#"{"max_seq_length": 256}"#).unwrap();

        let (train, val) = load_splits(dir.path()).unwrap();
        assert_eq!(train.len(), 2);
        assert_eq!(val.len(), 1);
        assert_eq!(train.longest(), 4);

        let sidecar = DataConfig::from_data_dir(dir.path()).unwrap();
        assert_eq!(sidecar.max_seq_length_or(4096), 256);
        assert_eq!(DataConfig::default().max_seq_length_or(4096), 4096);
    }

    #[test]
    fn test_malformed_line_reports_location() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(TRAIN_FILE);
        std::fs::write(&path, "{\"input_ids\": [1]}\n").unwrap();
        let err = Dataset::load_jsonl(&path).unwrap_err();
        assert!(err.to_string().contains(":1:"));
    }
}
