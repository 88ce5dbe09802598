pub mod adapter;
pub mod classifier;
pub mod llama;
pub mod loader;
pub mod tokenizer;

pub use adapter::{
    adapter_state, attach_adapter, install_adapter_tensors, load_adapter_state, peft_key,
};
pub use classifier::{
    load_loftq_classifier, load_quantized_classifier, print_trainable_parameters, ParameterCount,
    LOFTQ_SUBFOLDER,
};
pub use llama::{LlamaConfig, LlamaForSequenceClassification};
pub use loader::{load_safetensors_file, save_safetensors, ModelLoader};
pub use tokenizer::TokenizerWrapper;
