use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// 4-bit weight quantization settings for the frozen base model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuantizationConfig {
    pub bits: i32,
    pub group_size: i32,
    /// Quantize the per-group scales a second time.
    ///
    /// Must be off when the adapter comes from a LoftQ initialization.
    pub use_double_quant: bool,
    /// Dtype the quantized matmuls are meant to run in (`bfloat16`, `float16` or `float32`)
    #[serde(default = "default_compute_dtype")]
    pub compute_dtype: String,
}

fn default_compute_dtype() -> String {
    "bfloat16".to_string()
}

impl QuantizationConfig {
    /// Default 4-bit profile shared by all fine-tuning scripts.
    pub fn bnb_4bit() -> Self {
        Self {
            bits: 4,
            group_size: 64,
            use_double_quant: true,
            compute_dtype: default_compute_dtype(),
        }
    }

    /// The 4-bit profile with double quantization turned off.
    pub fn for_loftq() -> Self {
        Self {
            use_double_quant: false,
            ..Self::bnb_4bit()
        }
    }
}

impl Default for QuantizationConfig {
    fn default() -> Self {
        Self::bnb_4bit()
    }
}

/// `target_modules` is a list in most adapter configs but PEFT also accepts a single name
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TargetModules {
    List(Vec<String>),
    Single(String),
}

impl TargetModules {
    pub fn names(&self) -> Vec<String> {
        match self {
            TargetModules::List(names) => names.clone(),
            TargetModules::Single(name) => vec![name.clone()],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoftQSettings {
    #[serde(default)]
    pub loftq_bits: Option<usize>,
    #[serde(default)]
    pub loftq_iter: Option<usize>,
}

/// `adapter_config.json` as written by PEFT
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdapterConfig {
    pub r: usize,
    pub lora_alpha: f32,
    #[serde(default)]
    pub lora_dropout: f32,
    pub target_modules: TargetModules,
    #[serde(default)]
    pub modules_to_save: Option<Vec<String>>,
    #[serde(default)]
    pub task_type: Option<String>,
    #[serde(default)]
    pub init_lora_weights: Option<serde_json::Value>,
    #[serde(default)]
    pub loftq_config: Option<LoftQSettings>,
}

impl AdapterConfig {
    pub fn from_json(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read adapter config {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse adapter config {}", path.display()))
    }

    pub fn scale(&self) -> f32 {
        self.lora_alpha / self.r as f32
    }

    pub fn targets(&self, module: &str) -> bool {
        self.target_modules.names().iter().any(|t| t == module)
    }

    pub fn saves_module(&self, module: &str) -> bool {
        self.modules_to_save
            .as_ref()
            .is_some_and(|mods| mods.iter().any(|m| m == module))
    }

    /// Bit width the LoftQ initialization was computed for, when recorded
    pub fn loftq_bits(&self) -> Option<usize> {
        self.loftq_config.as_ref().and_then(|c| c.loftq_bits)
    }
}
