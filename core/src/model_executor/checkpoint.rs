use std::collections::HashMap;
use std::path::Path;

use anyhow::{anyhow, Result};
use candle::{DType, Device, Tensor};

pub const MODEL_PREFIX: &str = "model.";
pub const EMBEDDINGS: &str = "model.embeddings";
pub const LEAD_BIAS: &str = "model.lead_bias";

/// The `model.` sub-object of a safetensors checkpoint, already placed on a
/// device with float weights cast to the requested dtype.
#[derive(Debug)]
pub struct Checkpoint {
    tensors: HashMap<String, Tensor>,
}

fn is_float(dtype: DType) -> bool {
    matches!(dtype, DType::F16 | DType::BF16 | DType::F32 | DType::F64)
}

impl Checkpoint {
    pub fn load<P: AsRef<Path>>(path: P, device: &Device, dtype: DType) -> Result<Self> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(anyhow!("checkpoint {} not found", path.display()));
        }
        let start = std::time::Instant::now();
        let mut tensors = HashMap::new();
        for (name, tensor) in candle::safetensors::load(path, device)? {
            if !name.starts_with(MODEL_PREFIX) {
                continue;
            }
            let tensor = if is_float(tensor.dtype()) && tensor.dtype() != dtype {
                tensor.to_dtype(dtype)?
            } else {
                tensor
            };
            tensors.insert(name, tensor);
        }
        if tensors.is_empty() {
            return Err(anyhow!(
                "checkpoint {} has no '{}' entries",
                path.display(),
                MODEL_PREFIX
            ));
        }
        let checkpoint = Self { tensors };
        checkpoint.validate()?;
        tracing::info!(
            "loaded checkpoint {} with {} tensors, {} parameters as {:?} in {:?}",
            path.display(),
            checkpoint.tensors.len(),
            checkpoint.num_parameters(),
            dtype,
            start.elapsed()
        );
        Ok(checkpoint)
    }

    pub fn save<P: AsRef<Path>>(tensors: &HashMap<String, Tensor>, path: P) -> Result<()> {
        candle::safetensors::save(tensors, path.as_ref())?;
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        let embeddings = self.get(EMBEDDINGS)?;
        let (vocab, dim) = embeddings.dims2().map_err(|_| {
            anyhow!(
                "{} must be [vocab, dim], got {:?}",
                EMBEDDINGS,
                embeddings.dims()
            )
        })?;
        if vocab == 0 || dim == 0 {
            return Err(anyhow!("{} is empty: [{}, {}]", EMBEDDINGS, vocab, dim));
        }
        if let Some(bias) = self.get_opt(LEAD_BIAS) {
            if bias.elem_count() != 1 {
                return Err(anyhow!(
                    "{} must hold a single value, got {:?}",
                    LEAD_BIAS,
                    bias.dims()
                ));
            }
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<&Tensor> {
        self.tensors
            .get(name)
            .ok_or_else(|| anyhow!("missing tensor '{}' in checkpoint", name))
    }

    pub fn get_opt(&self, name: &str) -> Option<&Tensor> {
        self.tensors.get(name)
    }

    pub fn num_parameters(&self) -> usize {
        self.tensors.values().map(|t| t.elem_count()).sum()
    }
}

#[cfg(test)]
pub(crate) fn write_test_checkpoint(path: &Path, vocab: usize, dim: usize) -> Result<()> {
    let values: Vec<f32> = (0..vocab * dim)
        .map(|i| ((i * 7919) % 101) as f32 / 101.0 - 0.5)
        .collect();
    let mut tensors = HashMap::new();
    tensors.insert(
        EMBEDDINGS.to_string(),
        Tensor::from_vec(values, (vocab, dim), &Device::Cpu)?,
    );
    tensors.insert(
        "optimizer.step".to_string(),
        Tensor::new(&[1u32], &Device::Cpu)?,
    );
    Checkpoint::save(&tensors, path)
}

#[test]
fn test_load_keeps_model_prefix() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("model.safetensors");
    write_test_checkpoint(&path, 16, 4)?;
    let checkpoint = Checkpoint::load(&path, &Device::Cpu, DType::F16)?;
    assert_eq!(checkpoint.num_parameters(), 64);
    assert_eq!(checkpoint.get(EMBEDDINGS)?.dtype(), DType::F16);
    assert!(checkpoint.get_opt("optimizer.step").is_none());
    assert!(checkpoint.get_opt(LEAD_BIAS).is_none());
    Ok(())
}

#[test]
fn test_load_rejects_bad_checkpoints() -> Result<()> {
    let dir = tempfile::tempdir()?;
    assert!(Checkpoint::load(dir.path().join("missing"), &Device::Cpu, DType::F32).is_err());

    let path = dir.path().join("no_model.safetensors");
    let mut tensors = HashMap::new();
    tensors.insert("encoder.weight".to_string(), Tensor::zeros((2, 2), DType::F32, &Device::Cpu)?);
    Checkpoint::save(&tensors, &path)?;
    let err = Checkpoint::load(&path, &Device::Cpu, DType::F32).unwrap_err();
    assert!(err.to_string().contains("no 'model.' entries"), "{}", err);

    let path = dir.path().join("flat.safetensors");
    let mut tensors = HashMap::new();
    tensors.insert(EMBEDDINGS.to_string(), Tensor::zeros(8, DType::F32, &Device::Cpu)?);
    Checkpoint::save(&tensors, &path)?;
    assert!(Checkpoint::load(&path, &Device::Cpu, DType::F32).is_err());
    Ok(())
}
