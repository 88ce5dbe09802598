//! Model weight loading from safetensors files

use anyhow::Context;
use half::{bf16, f16};
use memmap2::MmapOptions;
use mlx_rs::Array;
use safetensors::tensor::TensorView;
use safetensors::{Dtype, SafeTensors};
use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};

use crate::model::llama::LlamaConfig;

/// Converts one safetensors entry to an f32 (or i32 for integer data) array.
pub fn tensor_to_array(name: &str, tensor: &TensorView<'_>) -> anyhow::Result<Array> {
    let shape: Vec<i32> = tensor.shape().iter().map(|&s| s as i32).collect();
    let raw = tensor.data();

    let array = match tensor.dtype() {
        Dtype::F32 => {
            let data: Vec<f32> = raw
                .chunks_exact(4)
                .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                .collect();
            Array::from_slice(&data, &shape)
        }
        Dtype::F16 => {
            let data: Vec<f32> = raw
                .chunks_exact(2)
                .map(|b| f16::from_le_bytes([b[0], b[1]]).to_f32())
                .collect();
            Array::from_slice(&data, &shape)
        }
        Dtype::BF16 => {
            let data: Vec<f32> = raw
                .chunks_exact(2)
                .map(|b| bf16::from_le_bytes([b[0], b[1]]).to_f32())
                .collect();
            Array::from_slice(&data, &shape)
        }
        Dtype::I64 => {
            let data: Vec<i32> = raw
                .chunks_exact(8)
                .map(|b| {
                    i64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]) as i32
                })
                .collect();
            Array::from_slice(&data, &shape)
        }
        Dtype::I32 => {
            let data: Vec<i32> = raw
                .chunks_exact(4)
                .map(|b| i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                .collect();
            Array::from_slice(&data, &shape)
        }
        other => anyhow::bail!("Unsupported dtype {:?} for tensor '{}'", other, name),
    };

    Ok(array)
}

/// Reads every tensor of a single safetensors file.
///
/// Names starting with `_` carry metadata and are skipped.
pub fn load_safetensors_file(path: &Path) -> anyhow::Result<HashMap<String, Array>> {
    let file =
        File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mmap = unsafe {
        MmapOptions::new()
            .map(&file)
            .with_context(|| format!("Failed to map {}", path.display()))?
    };
    let tensors = SafeTensors::deserialize(&mmap)
        .with_context(|| format!("Failed to deserialize safetensors from {}", path.display()))?;

    let mut weights = HashMap::new();
    for (name, tensor) in tensors.tensors() {
        if name.starts_with('_') {
            continue;
        }
        let array = tensor_to_array(&name, &tensor)
            .with_context(|| format!("In {}", path.display()))?;
        weights.insert(name, array);
    }
    Ok(weights)
}

/// Writes arrays as little-endian f32 tensors.
pub fn save_safetensors(weights: &HashMap<String, Array>, path: &Path) -> anyhow::Result<()> {
    let mut storage: Vec<(String, Vec<usize>, Vec<u8>)> = Vec::with_capacity(weights.len());
    for (name, array) in weights {
        let array = array.as_type::<f32>()?;
        array.eval()?;
        let shape: Vec<usize> = array.shape().iter().map(|&s| s as usize).collect();
        let bytes: Vec<u8> = array
            .as_slice::<f32>()
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect();
        storage.push((name.clone(), shape, bytes));
    }

    let mut views = Vec::with_capacity(storage.len());
    for (name, shape, bytes) in &storage {
        views.push((name.clone(), TensorView::new(Dtype::F32, shape.clone(), bytes)?));
    }

    safetensors::serialize_to_file(views, &None, path)
        .with_context(|| format!("Failed to save safetensors to {}", path.display()))?;
    Ok(())
}

/// Locates and reads a pretrained model directory.
pub struct ModelLoader {
    model_path: String,
}

impl ModelLoader {
    pub fn new(model_path: impl Into<String>) -> Self {
        Self {
            model_path: model_path.into(),
        }
    }

    /// Local directory holding `config.json` and the weight shards.
    ///
    /// Accepts a direct path or a hub id already present in the local HuggingFace cache.
    pub fn model_dir(&self) -> anyhow::Result<PathBuf> {
        let path = Path::new(&self.model_path);
        if path.is_dir() {
            return Ok(path.to_path_buf());
        }
        if let Some(snapshot) = find_cached_snapshot(&self.model_path) {
            tracing::info!("Resolved {} to {}", self.model_path, snapshot.display());
            return Ok(snapshot);
        }
        anyhow::bail!("Model path does not exist: {}", self.model_path)
    }

    pub fn load_config(&self) -> anyhow::Result<LlamaConfig> {
        let config_path = self.model_dir()?.join("config.json");
        LlamaConfig::from_json(&config_path)
    }

    /// Loads all `*.safetensors` shards of the model directory.
    pub fn load_safetensors(&self) -> anyhow::Result<HashMap<String, Array>> {
        let dir = self.model_dir()?;
        let mut shard_files: Vec<PathBuf> = std::fs::read_dir(&dir)
            .with_context(|| format!("Failed to read model directory {}", dir.display()))?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().and_then(|s| s.to_str()) == Some("safetensors"))
            .collect();
        shard_files.sort();

        if shard_files.is_empty() {
            anyhow::bail!("No .safetensors files found in directory: {}", dir.display());
        }

        let mut weights = HashMap::new();
        for (idx, shard_path) in shard_files.iter().enumerate() {
            tracing::debug!("Loading shard {}/{}", idx + 1, shard_files.len());
            weights.extend(load_safetensors_file(shard_path)?);
        }

        tracing::info!(
            "Loaded {} tensors from {} shard(s)",
            weights.len(),
            shard_files.len()
        );
        Ok(weights)
    }
}

/// Newest snapshot directory for `org/name` in `~/.cache/huggingface/hub`.
fn find_cached_snapshot(model_name: &str) -> Option<PathBuf> {
    if !model_name.contains('/') {
        return None;
    }
    let home = std::env::var("HOME").ok()?;
    let snapshots_dir = PathBuf::from(home)
        .join(".cache/huggingface/hub")
        .join(format!("models--{}", model_name.replace('/', "--")))
        .join("snapshots");

    let mut snapshots: Vec<PathBuf> = std::fs::read_dir(&snapshots_dir)
        .ok()?
        .flatten()
        .filter(|e| e.file_type().ok().is_some_and(|ft| ft.is_dir()))
        .map(|e| e.path())
        .collect();

    snapshots.sort_by_key(|p| {
        std::cmp::Reverse(p.metadata().ok().and_then(|m| m.modified().ok()))
    });
    snapshots.into_iter().next()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_save_then_load_directory() {
        let dir = TempDir::new().unwrap();
        let mut weights = HashMap::new();
        weights.insert(
            "model.norm.weight".to_string(),
            Array::from_slice(&[1.0f32, 2.0, 3.0], &[3]),
        );
        save_safetensors(&weights, &dir.path().join("model.safetensors")).unwrap();

        let loader = ModelLoader::new(dir.path().to_string_lossy().to_string());
        let loaded = loader.load_safetensors().unwrap();
        let norm = &loaded["model.norm.weight"];
        assert_eq!(norm.shape(), &[3]);
        assert_eq!(norm.as_slice::<f32>(), &[1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_bf16_tensors_are_widened() {
        let values = [bf16::from_f32(0.5), bf16::from_f32(-2.0)];
        let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        let view = TensorView::new(Dtype::BF16, vec![2], &bytes).unwrap();
        let array = tensor_to_array("w", &view).unwrap();
        assert_eq!(array.as_slice::<f32>(), &[0.5, -2.0]);
    }

    #[test]
    fn test_directory_without_shards_fails() {
        let dir = TempDir::new().unwrap();
        let loader = ModelLoader::new(dir.path().to_string_lossy().to_string());
        let err = loader.load_safetensors().unwrap_err().to_string();
        assert!(err.contains("No .safetensors files"));
    }

    #[test]
    fn test_missing_model_path_fails() {
        let loader = ModelLoader::new("definitely/not-a-model");
        assert!(loader.model_dir().is_err());
    }
}
