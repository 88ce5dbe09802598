//! PEFT LoRA adapters: loading, installing and exporting
//!
//! Adapter files use the PEFT key layout, e.g.
//! `base_model.model.model.layers.0.self_attn.q_proj.lora_A.weight`.

use crate::config::AdapterConfig;
use crate::model::llama::LlamaForSequenceClassification;
use crate::model::loader::load_safetensors_file;
use anyhow::Context;
use mlx_rs::module::ModuleParameters;
use mlx_rs::Array;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

pub const ADAPTER_CONFIG_FILE: &str = "adapter_config.json";
pub const ADAPTER_WEIGHTS_FILE: &str = "adapter_model.safetensors";

const PEFT_PREFIX: &str = "base_model.model.";
const HEAD_NAME: &str = "score";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Factor {
    A,
    B,
}

/// What a single adapter tensor updates
#[derive(Debug, Clone, PartialEq, Eq)]
enum AdapterTensor {
    Lora {
        layer: usize,
        module: String,
        factor: Factor,
    },
    Head,
}

fn parse_peft_key(key: &str) -> Option<AdapterTensor> {
    let key = key.strip_prefix(PEFT_PREFIX).unwrap_or(key);

    if key == "score.weight" || key == "score.modules_to_save.default.weight" {
        return Some(AdapterTensor::Head);
    }

    // model.layers.{i}.{self_attn|mlp}.{module}.lora_{A|B}[.default].weight
    let rest = key.strip_prefix("model.layers.")?;
    let parts: Vec<&str> = rest.split('.').collect();
    if parts.len() < 5 {
        return None;
    }
    let layer = parts[0].parse().ok()?;
    let module = parts[2].to_string();
    let factor = match parts[3] {
        "lora_A" => Factor::A,
        "lora_B" => Factor::B,
        _ => return None,
    };
    Some(AdapterTensor::Lora {
        layer,
        module,
        factor,
    })
}

/// PEFT name for a flattened module parameter name
pub fn peft_key(param_name: &str) -> String {
    if param_name == HEAD_NAME {
        return format!("{}score.weight", PEFT_PREFIX);
    }
    let renamed = if let Some(stem) = param_name.strip_suffix(".lora_a") {
        format!("{}.lora_A.weight", stem)
    } else if let Some(stem) = param_name.strip_suffix(".lora_b") {
        format!("{}.lora_B.weight", stem)
    } else {
        param_name.to_string()
    };
    format!("{}{}", PEFT_PREFIX, renamed)
}

/// Installs PEFT-named adapter tensors into the model.
///
/// Every module listed in `target_modules` must receive both factors on every layer.
/// Returns the number of adapted projections.
pub fn install_adapter_tensors(
    model: &mut LlamaForSequenceClassification,
    config: &AdapterConfig,
    tensors: HashMap<String, Array>,
) -> anyhow::Result<usize> {
    let mut factors: BTreeMap<(usize, String), (Option<Array>, Option<Array>)> = BTreeMap::new();
    let mut head = None;

    for (key, tensor) in tensors {
        match parse_peft_key(&key) {
            Some(AdapterTensor::Lora {
                layer,
                module,
                factor,
            }) => {
                let slot = factors.entry((layer, module)).or_default();
                match factor {
                    Factor::A => slot.0 = Some(tensor),
                    Factor::B => slot.1 = Some(tensor),
                }
            }
            Some(AdapterTensor::Head) => head = Some(tensor),
            None => tracing::warn!("Ignoring unrecognized adapter tensor '{}'", key),
        }
    }

    let num_layers = model.config().num_hidden_layers as usize;
    for target in config.target_modules.names() {
        for layer in 0..num_layers {
            if !factors.contains_key(&(layer, target.clone())) {
                anyhow::bail!(
                    "Adapter has no LoRA weights for layers.{}.{} although it targets '{}'",
                    layer,
                    target,
                    target
                );
            }
        }
    }

    let scale = config.scale();
    let mut attached = 0;
    for ((layer, module), pair) in factors {
        if !config.targets(&module) {
            tracing::warn!(
                "Ignoring LoRA weights for layers.{}.{}: '{}' is not in target_modules",
                layer,
                module,
                module
            );
            continue;
        }
        let (Some(lora_a), Some(lora_b)) = pair else {
            anyhow::bail!("Adapter for layers.{}.{} is missing a LoRA factor", layer, module);
        };
        if lora_a.dim(0) as usize != config.r {
            anyhow::bail!(
                "Adapter rank {} for layers.{}.{} does not match r = {}",
                lora_a.dim(0),
                layer,
                module,
                config.r
            );
        }
        let projection = model
            .projection_mut(layer, &module)
            .with_context(|| format!("Model has no projection layers.{}.{}", layer, module))?;
        projection
            .attach(lora_a, lora_b, scale)
            .map_err(|e| anyhow::anyhow!("layers.{}.{}: {}", layer, module, e))?;
        attached += 1;
    }

    if let Some(score) = head {
        let expected = [model.num_labels, model.config().hidden_size];
        if score.shape() != expected {
            anyhow::bail!(
                "Adapter score head has shape {:?}, expected {:?}",
                score.shape(),
                expected
            );
        }
        *model.score = score.as_type::<f32>()?;
    } else if config.saves_module(HEAD_NAME) {
        anyhow::bail!("Adapter lists '{}' in modules_to_save but stores no weights for it", HEAD_NAME);
    }

    Ok(attached)
}

/// Loads `{model_path}/{subfolder}` as a PEFT LoRA adapter.
///
/// With `is_trainable` the adapter factors and the `score` head are the only
/// trainable parameters; otherwise the whole model is frozen.
pub fn attach_adapter(
    model: &mut LlamaForSequenceClassification,
    model_path: &Path,
    subfolder: &str,
    is_trainable: bool,
) -> anyhow::Result<AdapterConfig> {
    let adapter_dir = model_path.join(subfolder);
    let config = AdapterConfig::from_json(&adapter_dir.join(ADAPTER_CONFIG_FILE))?;
    let weights_path = adapter_dir.join(ADAPTER_WEIGHTS_FILE);
    let tensors = load_safetensors_file(&weights_path)
        .with_context(|| format!("Failed to load adapter weights {}", weights_path.display()))?;

    let attached = install_adapter_tensors(model, &config, tensors)?;
    tracing::info!(
        "Attached LoRA adapters to {} projections (r={}, alpha={}, scale={:.4})",
        attached,
        config.r,
        config.lora_alpha,
        config.scale()
    );

    if !is_trainable {
        model.freeze_parameters(true);
    }

    Ok(config)
}

/// Trainable tensors under their PEFT names, ready to be written back out
pub fn adapter_state(model: &LlamaForSequenceClassification) -> Vec<(String, Array)> {
    let mut state: Vec<(String, Array)> = model
        .trainable_parameters()
        .flatten()
        .into_iter()
        .map(|(name, array)| (peft_key(&name), array.clone()))
        .collect();
    state.sort_by(|a, b| a.0.cmp(&b.0));
    state
}

/// Overwrites trainable tensors from a PEFT-named map produced by [`adapter_state`].
pub fn load_adapter_state(
    model: &mut LlamaForSequenceClassification,
    weights: &HashMap<String, Array>,
) -> anyhow::Result<usize> {
    let mut params = model.parameters_mut().flatten();
    let mut loaded = 0;
    for (name, param) in params.iter_mut() {
        let key = peft_key(name);
        let weight = weights
            .get(&key)
            .with_context(|| format!("Adapter state has no tensor '{}'", key))?;
        if weight.shape() != param.shape() {
            anyhow::bail!(
                "Shape mismatch for {}: expected {:?}, got {:?}",
                key,
                param.shape(),
                weight.shape()
            );
        }
        **param = weight.clone();
        loaded += 1;
    }
    Ok(loaded)
}
