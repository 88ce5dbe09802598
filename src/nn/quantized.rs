//! Frozen affine-quantized linear projection

use crate::config::QuantizationConfig;
use mlx_rs::error::Exception;
use mlx_rs::Array;

/// Linear layer whose weight lives only in packed low-bit form.
///
/// None of the fields are module parameters, so the projection never
/// receives gradients and is invisible to the optimizer.
#[derive(Debug, Clone)]
pub struct QuantizedLinear {
    weight: Array,
    scales: Array,
    biases: Array,
    group_size: i32,
    bits: i32,
    in_features: i32,
    out_features: i32,
}

impl QuantizedLinear {
    /// Quantizes a dense `[out_features, in_features]` weight.
    pub fn from_weight(weight: &Array, quant: &QuantizationConfig) -> Result<Self, Exception> {
        let shape = weight.shape();
        if shape.len() != 2 {
            return Err(Exception::custom(format!(
                "expected a 2-D weight, got shape {:?}",
                shape
            )));
        }
        let (out_features, in_features) = (shape[0], shape[1]);
        if in_features % quant.group_size != 0 {
            return Err(Exception::custom(format!(
                "in_features {} is not divisible by group size {}",
                in_features, quant.group_size
            )));
        }

        let dense = weight.as_type::<f32>()?;
        let (packed, scales, biases) =
            mlx_rs::ops::quantize(&dense, quant.group_size, quant.bits)?;
        packed.eval()?;
        scales.eval()?;
        biases.eval()?;

        Ok(Self {
            weight: packed,
            scales,
            biases,
            group_size: quant.group_size,
            bits: quant.bits,
            in_features,
            out_features,
        })
    }

    pub fn forward(&self, x: &Array) -> Result<Array, Exception> {
        mlx_rs::ops::quantized_matmul(
            x,
            &self.weight,
            &self.scales,
            &self.biases,
            true,
            self.group_size,
            self.bits,
        )
    }

    pub fn in_features(&self) -> i32 {
        self.in_features
    }

    pub fn out_features(&self) -> i32 {
        self.out_features
    }

    /// Number of weights this layer represents, counted before packing
    pub fn num_parameters(&self) -> usize {
        self.in_features as usize * self.out_features as usize
    }
}
