//! Low-rank adaptation on top of a frozen quantized projection
//!
//! output = base(x) + (x @ A^T) @ B^T * scale

use crate::nn::quantized::QuantizedLinear;
use mlx_macros::ModuleParameters as DeriveModuleParameters;
use mlx_rs::error::Exception;
use mlx_rs::module::Param;
use mlx_rs::Array;

#[derive(Debug, Clone, DeriveModuleParameters)]
pub struct AdaptedLinear {
    pub base: QuantizedLinear,
    /// `[rank, in_features]`
    #[param]
    pub lora_a: Param<Option<Array>>,
    /// `[out_features, rank]`
    #[param]
    pub lora_b: Param<Option<Array>>,
    pub scale: f32,
}

impl AdaptedLinear {
    /// Plain frozen projection with no adapter installed
    pub fn frozen(base: QuantizedLinear) -> Self {
        Self {
            base,
            lora_a: Param::new(None),
            lora_b: Param::new(None),
            scale: 0.0,
        }
    }

    /// Installs pretrained A/B factors.
    pub fn attach(&mut self, lora_a: Array, lora_b: Array, scale: f32) -> Result<(), Exception> {
        let (in_features, out_features) = (self.base.in_features(), self.base.out_features());
        let a_shape = lora_a.shape().to_vec();
        let b_shape = lora_b.shape().to_vec();

        if a_shape.len() != 2 || b_shape.len() != 2 {
            return Err(Exception::custom("LoRA factors must be 2-D"));
        }
        let rank = a_shape[0];
        if a_shape[1] != in_features || b_shape[0] != out_features || b_shape[1] != rank {
            return Err(Exception::custom(format!(
                "LoRA shapes A{:?} B{:?} do not fit a {}x{} projection",
                a_shape, b_shape, out_features, in_features
            )));
        }

        *self.lora_a = Some(lora_a.as_type::<f32>()?);
        *self.lora_b = Some(lora_b.as_type::<f32>()?);
        self.scale = scale;
        Ok(())
    }

    /// Fresh adapter: A ~ U(-1/sqrt(r), 1/sqrt(r)), B = 0, so the layer starts equal to its base.
    pub fn init_random(&mut self, rank: i32, scale: f32) -> Result<(), Exception> {
        let k = 1.0 / (rank as f32).sqrt();
        let lora_a =
            mlx_rs::random::uniform::<_, f32>(-k, k, &[rank, self.base.in_features()], None)?;
        let lora_b = mlx_rs::ops::zeros::<f32>(&[self.base.out_features(), rank])?;
        self.attach(lora_a, lora_b, scale)
    }

    pub fn forward(&self, x: &Array) -> Result<Array, Exception> {
        let base_out = self.base.forward(x)?;
        match (self.lora_a.as_ref(), self.lora_b.as_ref()) {
            (Some(a), Some(b)) => {
                let down = x.matmul(&a.transpose_axes(&[1, 0])?)?;
                let up = down.matmul(&b.transpose_axes(&[1, 0])?)?;
                base_out.add(&up.multiply(Array::from_f32(self.scale))?)
            }
            _ => Ok(base_out),
        }
    }
}
