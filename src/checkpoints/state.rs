//! Checkpoint state container

use crate::config::RunConfig;
use mlx_rs::Array;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Host copy of the trainable tensors: name -> (data, shape)
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AdapterState {
    pub weights: Vec<(String, (Vec<f32>, Vec<i32>))>,
}

impl AdapterState {
    pub fn from_arrays(arrays: Vec<(String, Array)>) -> anyhow::Result<Self> {
        let mut weights = Vec::with_capacity(arrays.len());
        for (name, array) in arrays {
            let array = array.as_type::<f32>()?;
            array.eval()?;
            weights.push((
                name,
                (array.as_slice::<f32>().to_vec(), array.shape().to_vec()),
            ));
        }
        Ok(Self { weights })
    }

    pub fn to_arrays(&self) -> HashMap<String, Array> {
        self.weights
            .iter()
            .map(|(name, (data, shape))| (name.clone(), Array::from_slice(data, shape)))
            .collect()
    }

    pub fn num_parameters(&self) -> usize {
        self.weights.iter().map(|(_, (data, _))| data.len()).sum()
    }
}

/// Metadata stored next to the tensors
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    pub epoch: usize,
    /// Optimizer updates applied when the checkpoint was taken
    pub step: usize,
    pub valid_acc: f32,
    pub valid_loss: f32,
    pub config: RunConfig,
    pub timestamp: String,
}

/// Adapter weights plus the validation result that earned the save
#[derive(Debug, Clone, PartialEq)]
pub struct Checkpoint {
    pub metadata: CheckpointMetadata,
    pub adapter_state: AdapterState,
}

impl Checkpoint {
    pub fn new(
        epoch: usize,
        step: usize,
        valid_acc: f32,
        valid_loss: f32,
        config: RunConfig,
        adapter_state: AdapterState,
    ) -> Self {
        Self {
            metadata: CheckpointMetadata {
                epoch,
                step,
                valid_acc,
                valid_loss,
                config,
                timestamp: chrono::Utc::now().to_rfc3339(),
            },
            adapter_state,
        }
    }

    pub fn epoch(&self) -> usize {
        self.metadata.epoch
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.adapter_state.weights.is_empty() {
            anyhow::bail!("adapter_state cannot be empty");
        }
        for (name, (data, shape)) in &self.adapter_state.weights {
            let expected: i64 = shape.iter().map(|&s| s as i64).product();
            if expected != data.len() as i64 {
                anyhow::bail!(
                    "Tensor '{}' has {} values but shape {:?}",
                    name,
                    data.len(),
                    shape
                );
            }
        }
        Ok(())
    }
}
