//! CheckpointManager writes adapter checkpoints as single safetensors files
//! with the run metadata embedded as a `_metadata` byte tensor.

use anyhow::{Context, Result};
use memmap2::MmapOptions;
use safetensors::tensor::TensorView;
use safetensors::{Dtype, SafeTensors};
use std::fs::{self, File};
use std::path::{Path, PathBuf};

use crate::checkpoints::state::{AdapterState, Checkpoint, CheckpointMetadata};

pub const DEFAULT_MAX_CHECKPOINTS: usize = 3;
pub const BEST_CHECKPOINT_NAME: &str = "checkpoint-best.safetensors";

const METADATA_KEY: &str = "_metadata";

#[derive(Clone)]
pub struct CheckpointManager {
    checkpoint_dir: PathBuf,
    max_checkpoints: usize,
}

impl CheckpointManager {
    pub fn new(checkpoint_dir: &Path, max_checkpoints: usize) -> Result<Self> {
        fs::create_dir_all(checkpoint_dir).with_context(|| {
            format!(
                "Failed to create checkpoint directory {}",
                checkpoint_dir.display()
            )
        })?;

        Ok(Self {
            checkpoint_dir: checkpoint_dir.to_path_buf(),
            max_checkpoints: max_checkpoints.max(1),
        })
    }

    fn epoch_path(&self, epoch: usize) -> PathBuf {
        self.checkpoint_dir
            .join(format!("checkpoint-{}.safetensors", epoch))
    }

    pub fn best_path(&self) -> PathBuf {
        self.checkpoint_dir.join(BEST_CHECKPOINT_NAME)
    }

    /// Saves `checkpoint-{epoch}.safetensors` and prunes the oldest beyond the retention limit.
    pub fn save(&self, checkpoint: &Checkpoint) -> Result<PathBuf> {
        checkpoint.validate()?;
        let path = self.epoch_path(checkpoint.epoch());
        write_checkpoint(&path, checkpoint)
            .with_context(|| format!("Failed to save checkpoint to {}", path.display()))?;
        self.cleanup()?;
        Ok(path)
    }

    /// Overwrites the best-so-far copy, which retention never removes.
    pub fn save_best(&self, checkpoint: &Checkpoint) -> Result<PathBuf> {
        checkpoint.validate()?;
        let path = self.best_path();
        write_checkpoint(&path, checkpoint)
            .with_context(|| format!("Failed to save checkpoint to {}", path.display()))?;
        Ok(path)
    }

    pub fn load(&self, epoch: usize) -> Result<Checkpoint> {
        let path = self.epoch_path(epoch);
        read_checkpoint(&path)
            .with_context(|| format!("Failed to load checkpoint from {}", path.display()))
    }

    pub fn load_best(&self) -> Result<Checkpoint> {
        let path = self.best_path();
        read_checkpoint(&path)
            .with_context(|| format!("Failed to load checkpoint from {}", path.display()))
    }

    /// Epochs with a numbered checkpoint on disk, ascending
    pub fn list_checkpoints(&self) -> Result<Vec<usize>> {
        let mut checkpoints = Vec::new();

        let entries = fs::read_dir(&self.checkpoint_dir).with_context(|| {
            format!(
                "Failed to read checkpoint directory {}",
                self.checkpoint_dir.display()
            )
        })?;

        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else {
                continue;
            };
            let epoch = name
                .strip_prefix("checkpoint-")
                .and_then(|rest| rest.strip_suffix(".safetensors"))
                .and_then(|epoch| epoch.parse::<usize>().ok());
            if let Some(epoch) = epoch {
                checkpoints.push(epoch);
            }
        }

        checkpoints.sort();
        Ok(checkpoints)
    }

    /// Keeps only the newest `max_checkpoints` numbered checkpoints.
    pub fn cleanup(&self) -> Result<()> {
        let checkpoints = self.list_checkpoints()?;
        if checkpoints.len() <= self.max_checkpoints {
            return Ok(());
        }

        for epoch in &checkpoints[..checkpoints.len() - self.max_checkpoints] {
            let path = self.epoch_path(*epoch);
            fs::remove_file(&path)
                .with_context(|| format!("Failed to remove old checkpoint {}", path.display()))?;
            tracing::debug!("Removed old checkpoint {}", path.display());
        }

        Ok(())
    }

    pub fn checkpoint_dir(&self) -> &Path {
        &self.checkpoint_dir
    }
}

fn write_checkpoint(path: &Path, checkpoint: &Checkpoint) -> Result<()> {
    let encoded: Vec<(String, Vec<usize>, Vec<u8>)> = checkpoint
        .adapter_state
        .weights
        .iter()
        .map(|(name, (data, shape))| {
            let shape: Vec<usize> = shape.iter().map(|&s| s as usize).collect();
            let bytes: Vec<u8> = data.iter().flat_map(|v| v.to_le_bytes()).collect();
            (name.clone(), shape, bytes)
        })
        .collect();
    let metadata_bytes = serde_json::to_vec(&checkpoint.metadata)?;

    let mut tensor_views = Vec::with_capacity(encoded.len() + 1);
    for (name, shape, bytes) in &encoded {
        tensor_views.push((
            name.clone(),
            TensorView::new(Dtype::F32, shape.clone(), bytes)
                .with_context(|| format!("Failed to create TensorView for {}", name))?,
        ));
    }
    tensor_views.push((
        METADATA_KEY.to_string(),
        TensorView::new(Dtype::U8, vec![metadata_bytes.len()], &metadata_bytes)?,
    ));

    safetensors::serialize_to_file(tensor_views, &None, path)
        .with_context(|| format!("Failed to save safetensors to {}", path.display()))?;
    Ok(())
}

fn read_checkpoint(path: &Path) -> Result<Checkpoint> {
    let file =
        File::open(path).with_context(|| format!("Failed to open file {}", path.display()))?;
    let mmap = unsafe {
        MmapOptions::new()
            .map(&file)
            .with_context(|| format!("Failed to map file {}", path.display()))?
    };
    let tensor_file = SafeTensors::deserialize(&mmap)
        .with_context(|| format!("Failed to deserialize safetensors from {}", path.display()))?;

    let mut metadata: Option<CheckpointMetadata> = None;
    let mut weights = Vec::new();

    for (name, tensor) in tensor_file.tensors() {
        if name == METADATA_KEY {
            metadata = Some(serde_json::from_slice(tensor.data())?);
            continue;
        }
        if tensor.dtype() != Dtype::F32 {
            anyhow::bail!("Tensor '{}' has dtype {:?}, expected F32", name, tensor.dtype());
        }
        let shape: Vec<i32> = tensor.shape().iter().map(|&s| s as i32).collect();
        let data: Vec<f32> = tensor
            .data()
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();
        weights.push((name, (data, shape)));
    }
    weights.sort_by(|a, b| a.0.cmp(&b.0));

    let metadata = metadata.context("Checkpoint has no _metadata record")?;
    Ok(Checkpoint {
        metadata,
        adapter_state: AdapterState { weights },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RunConfig;
    use tempfile::TempDir;

    fn checkpoint(epoch: usize, valid_acc: f32) -> Checkpoint {
        let adapter_state = AdapterState {
            weights: vec![
                (
                    "base_model.model.score.weight".to_string(),
                    (vec![0.5, -0.25, 1.0, 2.0], vec![2, 2]),
                ),
                (
                    "base_model.model.model.layers.0.self_attn.q_proj.lora_A.weight".to_string(),
                    (vec![epoch as f32; 3], vec![1, 3]),
                ),
            ],
        };
        Checkpoint::new(epoch, epoch * 10, valid_acc, 0.7, RunConfig::default(), adapter_state)
    }

    #[test]
    fn test_save_and_load_preserves_state() {
        let temp_dir = TempDir::new().unwrap();
        let manager = CheckpointManager::new(temp_dir.path(), DEFAULT_MAX_CHECKPOINTS).unwrap();

        let original = checkpoint(4, 0.55);
        let path = manager.save(&original).unwrap();
        assert!(path.ends_with("checkpoint-4.safetensors"));

        let loaded = manager.load(4).unwrap();
        assert_eq!(loaded.metadata, original.metadata);
        let mut expected = original.adapter_state.weights.clone();
        expected.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(loaded.adapter_state.weights, expected);
    }

    #[test]
    fn test_retention_keeps_newest_epochs() {
        let temp_dir = TempDir::new().unwrap();
        let manager = CheckpointManager::new(temp_dir.path(), 3).unwrap();

        for epoch in 0..5 {
            manager.save(&checkpoint(epoch, 0.1 * epoch as f32)).unwrap();
        }
        assert_eq!(manager.list_checkpoints().unwrap(), vec![2, 3, 4]);
        assert!(manager.load(0).is_err());
    }

    #[test]
    fn test_best_copy_survives_cleanup() {
        let temp_dir = TempDir::new().unwrap();
        let manager = CheckpointManager::new(temp_dir.path(), 1).unwrap();

        manager.save_best(&checkpoint(0, 0.9)).unwrap();
        for epoch in 0..3 {
            manager.save(&checkpoint(epoch, 0.1)).unwrap();
        }

        assert_eq!(manager.list_checkpoints().unwrap(), vec![2]);
        let best = manager.load_best().unwrap();
        assert_eq!(best.metadata.epoch, 0);
        assert!((best.metadata.valid_acc - 0.9).abs() < 1e-6);
    }

    #[test]
    fn test_empty_state_is_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let manager = CheckpointManager::new(temp_dir.path(), 3).unwrap();
        let empty = Checkpoint::new(0, 0, 0.0, 0.0, RunConfig::default(), AdapterState::default());
        assert!(manager.save(&empty).is_err());
        assert!(manager.list_checkpoints().unwrap().is_empty());
    }
}
