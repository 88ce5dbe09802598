use mlx_rs::Array;
use serde::Serialize;

/// Mean, standard deviation and L2 norm of one tensor
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TensorStats {
    pub name: String,
    pub mean: f64,
    pub std: f64,
    pub norm: f64,
}

impl TensorStats {
    pub fn from_values(name: impl Into<String>, values: &[f32]) -> Self {
        let n = values.len().max(1) as f64;
        let sum: f64 = values.iter().map(|&v| v as f64).sum();
        let sum_sq: f64 = values.iter().map(|&v| (v as f64) * (v as f64)).sum();
        let mean = sum / n;
        let variance = (sum_sq / n - mean * mean).max(0.0);
        Self {
            name: name.into(),
            mean,
            std: variance.sqrt(),
            norm: sum_sq.sqrt(),
        }
    }

    pub fn from_array(name: impl Into<String>, array: &Array) -> anyhow::Result<Self> {
        let array = array.as_type::<f32>()?;
        array.eval()?;
        Ok(Self::from_values(name, array.as_slice::<f32>()))
    }
}
