//! Checkpoint directories, base weight loading, and adapter-only saving.
//!
//! A base checkpoint directory holds the frozen weights in
//! `lit_model.safetensors` next to the tokenizer files. Fine-tuning never
//! rewrites it; the output directory only ever receives adapter tensors.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use candle_core::Tensor;

use crate::adapter::adapter_filter;
use crate::error::{FinetuneError, Result};
use crate::model::{AdapterModel, LoadReport};

/// Frozen base weights inside a checkpoint directory.
pub const BASE_CHECKPOINT_FILE: &str = "lit_model.safetensors";
/// Tokenizer definition inside a checkpoint directory.
pub const TOKENIZER_FILE: &str = "tokenizer.json";
/// Tokenizer options inside a checkpoint directory.
pub const TOKENIZER_CONFIG_FILE: &str = "tokenizer_config.json";
/// Adapter weights written at the end of a run.
pub const FINAL_ADAPTER_FILE: &str = "lit_model_adapter_finetuned.safetensors";

/// File name of the periodic adapter checkpoint taken at iteration `iter`.
///
/// ```rust
/// use adapter_tune_rs::checkpoint::periodic_checkpoint_name;
///
/// assert_eq!(periodic_checkpoint_name(31), "iter-000031-ckpt.safetensors");
/// ```
#[must_use]
pub fn periodic_checkpoint_name(iter: usize) -> String {
    format!("iter-{iter:06}-ckpt.safetensors")
}

/// Ensure `dir` holds the base weights and tokenizer files.
///
/// # Errors
///
/// Returns [`FinetuneError::Checkpoint`] naming every missing file.
pub fn check_valid_checkpoint_dir<P: AsRef<Path>>(dir: P) -> Result<()> {
    let dir = dir.as_ref();
    if !dir.is_dir() {
        return Err(FinetuneError::Checkpoint(format!(
            "checkpoint_dir {} is not a directory",
            dir.display()
        )));
    }
    let missing: Vec<&str> = [BASE_CHECKPOINT_FILE, TOKENIZER_FILE, TOKENIZER_CONFIG_FILE]
        .into_iter()
        .filter(|file| !dir.join(file).is_file())
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(FinetuneError::Checkpoint(format!(
            "checkpoint_dir {} is missing {}",
            dir.display(),
            missing.join(", ")
        )))
    }
}

/// Load frozen base weights into `model`.
///
/// Adapter parameters are expected to be absent and keep their
/// initialization. Entries the model does not know are skipped.
///
/// # Errors
///
/// Fails when the file cannot be read, a shape disagrees, or a base parameter
/// is missing from the file.
pub fn load_base_checkpoint<M, P>(model: &mut M, path: P) -> Result<LoadReport>
where
    M: AdapterModel + ?Sized,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let tensors = candle_core::safetensors::load(path, model.device()).map_err(|e| {
        FinetuneError::Checkpoint(format!("failed to read {}: {e}", path.display()))
    })?;
    let report = model.load_state_dict(&tensors)?;

    let missing_base: Vec<&String> = report
        .missing
        .iter()
        .filter(|name| !adapter_filter(name))
        .collect();
    if !missing_base.is_empty() {
        return Err(FinetuneError::Checkpoint(format!(
            "{} is missing base parameters: {missing_base:?}",
            path.display()
        )));
    }
    if !report.unexpected.is_empty() {
        tracing::debug!(
            "Ignoring {} unexpected tensors in {}: {:?}",
            report.unexpected.len(),
            path.display(),
            report.unexpected
        );
    }
    tracing::info!("Loaded {} base tensors from {}", report.loaded.len(), path.display());
    Ok(report)
}

/// Write every parameter whose name passes `filter` to `path`.
///
/// Returns the number of tensors written.
///
/// # Errors
///
/// Fails when the directory cannot be created or serialization fails.
pub fn save_adapter_checkpoint<M, P, F>(model: &M, path: P, filter: F) -> Result<usize>
where
    M: AdapterModel + ?Sized,
    P: AsRef<Path>,
    F: Fn(&str) -> bool,
{
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let selected: Vec<(String, Tensor)> = model
        .named_parameters()?
        .into_iter()
        .filter(|(name, _)| filter(name))
        .collect();
    let tensors_ref: Vec<(&str, Tensor)> = selected
        .iter()
        .map(|(name, tensor)| (name.as_str(), tensor.clone()))
        .collect();

    safetensors::tensor::serialize_to_file(tensors_ref, None, path).map_err(|e| {
        FinetuneError::Checkpoint(format!("failed to save {}: {e}", path.display()))
    })?;
    tracing::info!("Saved {} adapter tensors to {}", selected.len(), path.display());
    Ok(selected.len())
}

/// Restore adapter weights written by [`save_adapter_checkpoint`].
///
/// Returns the number of tensors loaded.
///
/// # Errors
///
/// Fails when the file holds a tensor that is not one of the model's
/// trainable parameters or a shape disagrees.
pub fn load_adapter_checkpoint<M, P>(model: &mut M, path: P) -> Result<usize>
where
    M: AdapterModel + ?Sized,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let tensors: HashMap<String, Tensor> = candle_core::safetensors::load(path, model.device())
        .map_err(|e| {
            FinetuneError::Checkpoint(format!("failed to read {}: {e}", path.display()))
        })?;

    let known: HashSet<String> = model
        .trainable_parameters()?
        .into_iter()
        .map(|(name, _)| name)
        .collect();
    let mut unknown: Vec<&String> = tensors.keys().filter(|name| !known.contains(*name)).collect();
    if !unknown.is_empty() {
        unknown.sort();
        return Err(FinetuneError::Checkpoint(format!(
            "{} holds tensors that are not adapter parameters: {unknown:?}",
            path.display()
        )));
    }

    let report = model.load_state_dict(&tensors)?;
    Ok(report.loaded.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter_gpt::AdapterGpt;
    use crate::model::test_config;
    use candle_core::{DType, Device};
    use tempfile::TempDir;

    fn model() -> AdapterGpt {
        AdapterGpt::new(&test_config(), DType::F32, DType::F32, &Device::Cpu).unwrap()
    }

    fn base_state(model: &AdapterGpt) -> HashMap<String, Tensor> {
        model
            .named_parameters()
            .unwrap()
            .into_iter()
            .filter(|(name, _)| !adapter_filter(name))
            .map(|(name, t)| (name, t.copy().unwrap()))
            .collect()
    }

    #[test]
    fn test_saved_names_are_the_filtered_subset() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out").join(FINAL_ADAPTER_FILE);
        let gpt = model();

        let written = save_adapter_checkpoint(&gpt, &path, adapter_filter).unwrap();
        let saved = candle_core::safetensors::load(&path, &Device::Cpu).unwrap();
        assert_eq!(written, saved.len());

        let mut saved_names: Vec<String> = saved.into_keys().collect();
        saved_names.sort();
        let expected: Vec<String> = gpt
            .named_parameters()
            .unwrap()
            .into_iter()
            .map(|(name, _)| name)
            .filter(|name| adapter_filter(name))
            .collect();
        assert_eq!(saved_names, expected);
    }

    #[test]
    fn test_adapter_round_trip_is_bit_identical() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(periodic_checkpoint_name(1));
        let source = model();
        save_adapter_checkpoint(&source, &path, adapter_filter).unwrap();

        let mut target = model();
        let loaded = load_adapter_checkpoint(&mut target, &path).unwrap();
        assert_eq!(loaded, source.trainable_parameters().unwrap().len());

        for ((name_a, a), (name_b, b)) in source
            .trainable_parameters()
            .unwrap()
            .iter()
            .zip(target.trainable_parameters().unwrap().iter())
        {
            assert_eq!(name_a, name_b);
            let a = a.as_tensor().flatten_all().unwrap().to_vec1::<f32>().unwrap();
            let b = b.as_tensor().flatten_all().unwrap().to_vec1::<f32>().unwrap();
            assert_eq!(a, b, "{name_a}");
        }
    }

    #[test]
    fn test_adapter_load_rejects_foreign_tensors() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("full.safetensors");
        let gpt = model();
        save_adapter_checkpoint(&gpt, &path, |_| true).unwrap();

        let mut target = model();
        assert!(load_adapter_checkpoint(&mut target, &path).is_err());
    }

    #[test]
    fn test_base_load_tolerates_missing_adapters_and_extra_keys() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(BASE_CHECKPOINT_FILE);
        let source = model();
        let mut state = base_state(&source);
        state.insert("rotary.inv_freq".into(), Tensor::zeros(4, DType::F32, &Device::Cpu).unwrap());
        candle_core::safetensors::save(&state, &path).unwrap();

        let mut target = model();
        let report = load_base_checkpoint(&mut target, &path).unwrap();
        assert!(report.missing.iter().all(|name| adapter_filter(name)));
        assert_eq!(report.unexpected, vec!["rotary.inv_freq".to_string()]);

        let a = source.forward(&Tensor::new(&[[1i64, 2, 3]], &Device::Cpu).unwrap(), None).unwrap();
        let b = target.forward(&Tensor::new(&[[1i64, 2, 3]], &Device::Cpu).unwrap(), None).unwrap();
        let diff = (a - b).unwrap().abs().unwrap().max_all().unwrap();
        assert!(diff.to_scalar::<f32>().unwrap() < 1e-6);
    }

    #[test]
    fn test_base_load_rejects_missing_base_tensor() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(BASE_CHECKPOINT_FILE);
        let mut state = base_state(&model());
        state.remove("lm_head.weight");
        candle_core::safetensors::save(&state, &path).unwrap();

        let err = load_base_checkpoint(&mut model(), &path).unwrap_err();
        assert!(err.to_string().contains("lm_head.weight"));
    }

    #[test]
    fn test_base_load_rejects_shape_mismatch() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(BASE_CHECKPOINT_FILE);
        let mut state = base_state(&model());
        state.insert(
            "transformer.ln_f.weight".into(),
            Tensor::zeros(9, DType::F32, &Device::Cpu).unwrap(),
        );
        candle_core::safetensors::save(&state, &path).unwrap();
        assert!(load_base_checkpoint(&mut model(), &path).is_err());
    }

    #[test]
    fn test_checkpoint_dir_validation() {
        let dir = TempDir::new().unwrap();
        let err = check_valid_checkpoint_dir(dir.path()).unwrap_err().to_string();
        assert!(err.contains(BASE_CHECKPOINT_FILE));
        assert!(err.contains(TOKENIZER_FILE));

        for file in [BASE_CHECKPOINT_FILE, TOKENIZER_FILE, TOKENIZER_CONFIG_FILE] {
            std::fs::write(dir.path().join(file), b"").unwrap();
        }
        check_valid_checkpoint_dir(dir.path()).unwrap();
        assert!(check_valid_checkpoint_dir(dir.path().join("nope")).is_err());
    }
}
