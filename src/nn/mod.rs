//! Layers specific to quantized adapter fine-tuning

pub mod lora;
pub mod quantized;

pub use lora::AdaptedLinear;
pub use quantized::QuantizedLinear;
