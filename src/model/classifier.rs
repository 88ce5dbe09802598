//! Assembly of the quantized sequence classifier

use crate::config::{AdapterConfig, QuantizationConfig};
use crate::model::adapter::attach_adapter;
use crate::model::llama::LlamaForSequenceClassification;
use crate::model::loader::ModelLoader;
use crate::utils::format_with_commas;
use std::fmt;

/// Loads a pretrained Llama checkpoint with 4-bit frozen projections and a fresh `score` head.
pub fn load_quantized_classifier(
    model_path: &str,
    num_labels: i32,
    quant: &QuantizationConfig,
) -> anyhow::Result<LlamaForSequenceClassification> {
    if quant.use_double_quant {
        anyhow::bail!(
            "Double quantization is not supported; disable it with QuantizationConfig::for_loftq()"
        );
    }

    let loader = ModelLoader::new(model_path);
    let config = loader.load_config()?;
    tracing::info!(
        "Initializing Llama classifier: {} layers, {} heads, hidden {}",
        config.num_hidden_layers,
        config.num_attention_heads,
        config.hidden_size
    );

    let weights = loader.load_safetensors()?;
    let model = LlamaForSequenceClassification::from_weights(config, num_labels, weights, quant)?;
    tracing::info!(
        "Quantized base weights to {}-bit (group size {}, compute dtype {})",
        quant.bits,
        quant.group_size,
        quant.compute_dtype
    );
    Ok(model)
}

/// Subfolder of the base model directory holding the LoftQ-initialized adapter
pub const LOFTQ_SUBFOLDER: &str = "loftq_init";

/// Quantized classifier with its trainable LoftQ adapter attached.
///
/// `lora_rank` and `nbit` describe what the caller expects; the adapter on
/// disk decides, and a disagreement is only reported.
pub fn load_loftq_classifier(
    model_path: &str,
    num_labels: i32,
    lora_rank: usize,
    nbit: usize,
    pad_token_id: Option<u32>,
) -> anyhow::Result<(LlamaForSequenceClassification, AdapterConfig)> {
    let quant = QuantizationConfig::for_loftq();
    let mut model = load_quantized_classifier(model_path, num_labels, &quant)?;

    let model_dir = ModelLoader::new(model_path).model_dir()?;
    let adapter = attach_adapter(&mut model, &model_dir, LOFTQ_SUBFOLDER, true)?;
    if adapter.r != lora_rank {
        tracing::warn!(
            "Adapter in {} has r = {} but --lora_rank is {}; using the adapter's rank",
            LOFTQ_SUBFOLDER,
            adapter.r,
            lora_rank
        );
    }
    if let Some(bits) = adapter.loftq_bits() {
        if bits != nbit {
            tracing::warn!(
                "Adapter was initialized for {}-bit LoftQ but --nbit is {}",
                bits,
                nbit
            );
        }
    }

    if let Some(pad_token_id) = pad_token_id {
        model.set_pad_token_id(pad_token_id);
    }
    Ok((model, adapter))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParameterCount {
    pub trainable: usize,
    pub total: usize,
}

impl ParameterCount {
    pub fn of(model: &LlamaForSequenceClassification) -> Self {
        Self {
            trainable: model.trainable_parameter_count(),
            total: model.total_parameter_count(),
        }
    }

    pub fn trainable_percent(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            100.0 * self.trainable as f64 / self.total as f64
        }
    }
}

impl fmt::Display for ParameterCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "trainable params: {} || all params: {} || trainable%: {:.4}",
            format_with_commas(self.trainable),
            format_with_commas(self.total),
            self.trainable_percent()
        )
    }
}

pub fn print_trainable_parameters(model: &LlamaForSequenceClassification) -> ParameterCount {
    let count = ParameterCount::of(model);
    println!("{}", count);
    count
}
