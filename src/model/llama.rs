use crate::config::QuantizationConfig;
use crate::nn::{AdaptedLinear, QuantizedLinear};
use anyhow::Context;
use mlx_macros::ModuleParameters as DeriveModuleParameters;
use mlx_rs::builder::Builder;
use mlx_rs::error::Exception;
use mlx_rs::module::{Module, ModuleParameters, Param};
use mlx_rs::nn::{Embedding, RmsNorm, Rope, RopeBuilder};
use mlx_rs::Array;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Projections that are quantized and may carry a LoRA adapter
pub const ATTENTION_PROJECTIONS: [&str; 4] = ["q_proj", "k_proj", "v_proj", "o_proj"];
pub const MLP_PROJECTIONS: [&str; 3] = ["gate_proj", "up_proj", "down_proj"];

fn default_rope_theta() -> f32 {
    10000.0
}

fn default_rms_norm_eps() -> f32 {
    1e-5
}

/// Llama model configuration parsed from config.json
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlamaConfig {
    pub hidden_size: i32,
    pub intermediate_size: i32,
    pub num_attention_heads: i32,
    #[serde(default)]
    pub num_key_value_heads: Option<i32>,
    pub num_hidden_layers: i32,
    pub vocab_size: i32,
    #[serde(default = "default_rms_norm_eps")]
    pub rms_norm_eps: f32,
    #[serde(default = "default_rope_theta")]
    pub rope_theta: f32,
    #[serde(default)]
    pub max_position_embeddings: Option<i32>,
    #[serde(default)]
    pub pad_token_id: Option<i32>,
}

impl LlamaConfig {
    pub fn from_json(path: &std::path::Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read model config {}", path.display()))?;
        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse model config {}", path.display()))?;
        Ok(config)
    }

    pub fn head_dim(&self) -> i32 {
        self.hidden_size / self.num_attention_heads
    }

    /// Older checkpoints omit the field and use one KV head per query head.
    pub fn kv_heads(&self) -> i32 {
        self.num_key_value_heads.unwrap_or(self.num_attention_heads)
    }
}

/// Removes `key` from the weight map or fails naming the missing tensor.
fn take_weight(weights: &mut HashMap<String, Array>, key: &str) -> anyhow::Result<Array> {
    weights
        .remove(key)
        .with_context(|| format!("Missing weight '{}'", key))
}

fn quantized_projection(
    weights: &mut HashMap<String, Array>,
    key: &str,
    expected: [i32; 2],
    quant: &QuantizationConfig,
) -> anyhow::Result<AdaptedLinear> {
    let weight = take_weight(weights, key)?;
    if weight.shape() != expected {
        anyhow::bail!(
            "Shape mismatch for {}: expected {:?}, got {:?}",
            key,
            expected,
            weight.shape()
        );
    }
    let base = QuantizedLinear::from_weight(&weight, quant)
        .map_err(|e| anyhow::anyhow!("Failed to quantize {}: {}", key, e))?;
    Ok(AdaptedLinear::frozen(base))
}

fn frozen_norm(
    weights: &mut HashMap<String, Array>,
    key: &str,
    config: &LlamaConfig,
) -> anyhow::Result<RmsNorm> {
    let mut norm = RmsNorm::new(config.hidden_size)?;
    *norm.weight = take_weight(weights, key)?.as_type::<f32>()?;
    norm.eps = config.rms_norm_eps;
    Ok(norm)
}

/// Grouped Query Attention for Llama
#[derive(Debug, Clone, DeriveModuleParameters)]
pub struct LlamaAttention {
    #[param]
    pub q_proj: AdaptedLinear,
    #[param]
    pub k_proj: AdaptedLinear,
    #[param]
    pub v_proj: AdaptedLinear,
    #[param]
    pub o_proj: AdaptedLinear,
    pub rope: Rope,
    pub num_heads: i32,
    pub num_kv_heads: i32,
    pub head_dim: i32,
}

impl LlamaAttention {
    fn from_weights(
        config: &LlamaConfig,
        prefix: &str,
        weights: &mut HashMap<String, Array>,
        quant: &QuantizationConfig,
    ) -> anyhow::Result<Self> {
        let head_dim = config.head_dim();
        let q_out = config.num_attention_heads * head_dim;
        let kv_out = config.kv_heads() * head_dim;
        let hidden = config.hidden_size;

        let mut proj = |name: &str, shape: [i32; 2]| {
            quantized_projection(weights, &format!("{}.{}.weight", prefix, name), shape, quant)
        };

        Ok(Self {
            q_proj: proj("q_proj", [q_out, hidden])?,
            k_proj: proj("k_proj", [kv_out, hidden])?,
            v_proj: proj("v_proj", [kv_out, hidden])?,
            o_proj: proj("o_proj", [hidden, q_out])?,
            rope: RopeBuilder::new(head_dim).base(config.rope_theta).build()?,
            num_heads: config.num_attention_heads,
            num_kv_heads: config.kv_heads(),
            head_dim,
        })
    }

    pub fn projection_mut(&mut self, name: &str) -> Option<&mut AdaptedLinear> {
        match name {
            "q_proj" => Some(&mut self.q_proj),
            "k_proj" => Some(&mut self.k_proj),
            "v_proj" => Some(&mut self.v_proj),
            "o_proj" => Some(&mut self.o_proj),
            _ => None,
        }
    }

    fn projections(&self) -> [&AdaptedLinear; 4] {
        [&self.q_proj, &self.k_proj, &self.v_proj, &self.o_proj]
    }

    pub fn forward(&mut self, x: &Array, mask: &Array) -> Result<Array, Exception> {
        let (batch_size, seq_len) = (x.dim(0), x.dim(1));

        // [B, L, heads * head_dim] -> [B, heads, L, head_dim]
        let q = self
            .q_proj
            .forward(x)?
            .reshape(&[batch_size, seq_len, self.num_heads, self.head_dim])?
            .transpose_axes(&[0, 2, 1, 3])?;
        let k = self
            .k_proj
            .forward(x)?
            .reshape(&[batch_size, seq_len, self.num_kv_heads, self.head_dim])?
            .transpose_axes(&[0, 2, 1, 3])?;
        let v = self
            .v_proj
            .forward(x)?
            .reshape(&[batch_size, seq_len, self.num_kv_heads, self.head_dim])?
            .transpose_axes(&[0, 2, 1, 3])?;

        // Rotary embedding runs over the sequence axis, second to last
        let q = self.rope.forward(&q)?;
        let k = self.rope.forward(&k)?;

        let n_rep = self.num_heads / self.num_kv_heads;
        let k = repeat_kv(k, n_rep)?;
        let v = repeat_kv(v, n_rep)?;

        let scale = Array::from_f32(1.0 / (self.head_dim as f32).sqrt());
        let scores = q
            .matmul(&k.transpose_axes(&[0, 1, 3, 2])?)?
            .multiply(&scale)?
            .add(mask)?;

        let attn_weights = mlx_rs::ops::softmax_axis(&scores, -1, false)?;
        let attn_output = attn_weights
            .matmul(&v)?
            .transpose_axes(&[0, 2, 1, 3])?
            .reshape(&[batch_size, seq_len, -1])?;

        self.o_proj.forward(&attn_output)
    }
}

/// [B, kv_heads, L, D] -> [B, kv_heads * n_rep, L, D]
fn repeat_kv(x: Array, n_rep: i32) -> Result<Array, Exception> {
    if n_rep == 1 {
        return Ok(x);
    }
    let (b, kv_heads, seq_len, head_dim) = (x.dim(0), x.dim(1), x.dim(2), x.dim(3));
    let x = x.reshape(&[b, kv_heads, 1, seq_len, head_dim])?;
    let x = mlx_rs::ops::broadcast_to(&x, &[b, kv_heads, n_rep, seq_len, head_dim])?;
    x.reshape(&[b, kv_heads * n_rep, seq_len, head_dim])
}

/// Llama MLP with gated activation
#[derive(Debug, Clone, DeriveModuleParameters)]
pub struct LlamaMLP {
    #[param]
    pub gate_proj: AdaptedLinear,
    #[param]
    pub up_proj: AdaptedLinear,
    #[param]
    pub down_proj: AdaptedLinear,
}

impl LlamaMLP {
    fn from_weights(
        config: &LlamaConfig,
        prefix: &str,
        weights: &mut HashMap<String, Array>,
        quant: &QuantizationConfig,
    ) -> anyhow::Result<Self> {
        let (hidden, inter) = (config.hidden_size, config.intermediate_size);
        let mut proj = |name: &str, shape: [i32; 2]| {
            quantized_projection(weights, &format!("{}.{}.weight", prefix, name), shape, quant)
        };
        Ok(Self {
            gate_proj: proj("gate_proj", [inter, hidden])?,
            up_proj: proj("up_proj", [inter, hidden])?,
            down_proj: proj("down_proj", [hidden, inter])?,
        })
    }

    pub fn projection_mut(&mut self, name: &str) -> Option<&mut AdaptedLinear> {
        match name {
            "gate_proj" => Some(&mut self.gate_proj),
            "up_proj" => Some(&mut self.up_proj),
            "down_proj" => Some(&mut self.down_proj),
            _ => None,
        }
    }

    fn projections(&self) -> [&AdaptedLinear; 3] {
        [&self.gate_proj, &self.up_proj, &self.down_proj]
    }

    pub fn forward(&self, x: &Array) -> Result<Array, Exception> {
        let gate = mlx_rs::nn::silu(self.gate_proj.forward(x)?)?;
        let up = self.up_proj.forward(x)?;
        self.down_proj.forward(&gate.multiply(&up)?)
    }
}

/// Single Llama decoder layer; the norms are frozen and carry no parameters.
#[derive(Debug, Clone, DeriveModuleParameters)]
pub struct LlamaDecoderLayer {
    #[param]
    pub self_attn: LlamaAttention,
    #[param]
    pub mlp: LlamaMLP,
    pub input_layernorm: RmsNorm,
    pub post_attention_layernorm: RmsNorm,
}

impl LlamaDecoderLayer {
    pub fn forward(&mut self, x: &Array, mask: &Array) -> Result<Array, Exception> {
        let normed = self.input_layernorm.forward(x)?;
        let x = x.add(&self.self_attn.forward(&normed, mask)?)?;

        let normed = self.post_attention_layernorm.forward(&x)?;
        x.add(&self.mlp.forward(&normed)?)
    }
}

/// Llama backbone without an output head
#[derive(Debug, Clone, DeriveModuleParameters)]
pub struct LlamaModel {
    pub config: LlamaConfig,
    pub embed_tokens: Embedding,
    #[param]
    pub layers: Vec<LlamaDecoderLayer>,
    pub norm: RmsNorm,
}

impl LlamaModel {
    /// Builds the backbone, quantizing every attention and MLP projection.
    ///
    /// Consumed tensors are removed from `weights`.
    pub fn from_weights(
        config: LlamaConfig,
        weights: &mut HashMap<String, Array>,
        quant: &QuantizationConfig,
    ) -> anyhow::Result<Self> {
        let mut embed_tokens = Embedding::new(config.vocab_size, config.hidden_size)?;
        let embedding = take_weight(weights, "model.embed_tokens.weight")?;
        if embedding.shape() != [config.vocab_size, config.hidden_size] {
            anyhow::bail!(
                "Shape mismatch for model.embed_tokens.weight: expected {:?}, got {:?}",
                [config.vocab_size, config.hidden_size],
                embedding.shape()
            );
        }
        *embed_tokens.weight = embedding.as_type::<f32>()?;

        let mut layers = Vec::with_capacity(config.num_hidden_layers as usize);
        for i in 0..config.num_hidden_layers {
            let prefix = format!("model.layers.{}", i);
            layers.push(LlamaDecoderLayer {
                self_attn: LlamaAttention::from_weights(
                    &config,
                    &format!("{}.self_attn", prefix),
                    weights,
                    quant,
                )?,
                mlp: LlamaMLP::from_weights(&config, &format!("{}.mlp", prefix), weights, quant)?,
                input_layernorm: frozen_norm(
                    weights,
                    &format!("{}.input_layernorm.weight", prefix),
                    &config,
                )?,
                post_attention_layernorm: frozen_norm(
                    weights,
                    &format!("{}.post_attention_layernorm.weight", prefix),
                    &config,
                )?,
            });
            tracing::debug!("Quantized layer {}/{}", i + 1, config.num_hidden_layers);
        }

        let norm = frozen_norm(weights, "model.norm.weight", &config)?;

        Ok(Self {
            config,
            embed_tokens,
            layers,
            norm,
        })
    }

    pub fn forward(&mut self, input_ids: &Array) -> Result<Array, Exception> {
        let mut hidden_states = self.embed_tokens.forward(input_ids)?;
        let mask = causal_mask(input_ids.dim(1))?;

        for layer in &mut self.layers {
            hidden_states = layer.forward(&hidden_states, &mask)?;
        }

        self.norm.forward(&hidden_states)
    }

    /// Weights held outside the module parameter tree
    fn frozen_parameter_count(&self) -> usize {
        let hidden = self.config.hidden_size as usize;
        let mut count = self.config.vocab_size as usize * hidden + hidden;
        for layer in &self.layers {
            count += 2 * hidden;
            for proj in layer.self_attn.projections() {
                count += proj.base.num_parameters();
            }
            for proj in layer.mlp.projections() {
                count += proj.base.num_parameters();
            }
        }
        count
    }
}

/// Additive mask, 0 where key j <= query i and -1e9 for future keys.
fn causal_mask(seq_len: i32) -> Result<Array, Exception> {
    let indices = mlx_rs::ops::arange::<_, f32>(0, seq_len, 1)?;
    let query = indices.reshape(&[seq_len, 1])?;
    let key = indices.reshape(&[1, seq_len])?;
    query
        .lt(&key)?
        .as_type::<f32>()?
        .multiply(Array::from_f32(-1e9_f32))
}

/// Llama backbone with a linear `score` head over the last real token
#[derive(Debug, Clone, DeriveModuleParameters)]
pub struct LlamaForSequenceClassification {
    #[param]
    pub model: LlamaModel,
    /// `[num_labels, hidden_size]`
    #[param]
    pub score: Param<Array>,
    pub num_labels: i32,
    pad_token_id: Option<i32>,
}

impl LlamaForSequenceClassification {
    pub fn from_weights(
        config: LlamaConfig,
        num_labels: i32,
        mut weights: HashMap<String, Array>,
        quant: &QuantizationConfig,
    ) -> anyhow::Result<Self> {
        let hidden = config.hidden_size;
        let pad_token_id = config.pad_token_id;
        let model = LlamaModel::from_weights(config, &mut weights, quant)?;

        // Base checkpoints are usually causal LMs without a classification head.
        let score = match weights.remove("score.weight") {
            Some(w) if w.shape() == [num_labels, hidden] => w.as_type::<f32>()?,
            _ => {
                let k = 1.0 / (hidden as f32).sqrt();
                mlx_rs::random::uniform::<_, f32>(-k, k, &[num_labels, hidden], None)?
            }
        };

        let unused: Vec<&String> = weights
            .keys()
            .filter(|k| k.as_str() != "lm_head.weight")
            .collect();
        if !unused.is_empty() {
            tracing::debug!("{} checkpoint tensors not used by the classifier", unused.len());
        }

        Ok(Self {
            model,
            score: Param::new(score),
            num_labels,
            pad_token_id,
        })
    }

    pub fn config(&self) -> &LlamaConfig {
        &self.model.config
    }

    pub fn pad_token_id(&self) -> Option<i32> {
        self.pad_token_id
    }

    pub fn set_pad_token_id(&mut self, pad_token_id: u32) {
        self.pad_token_id = Some(pad_token_id as i32);
        self.model.config.pad_token_id = Some(pad_token_id as i32);
    }

    /// Index of the last non-pad token in each row of a row-major `[batch, seq_len]` buffer.
    ///
    /// Without a pad id only single-row batches can be pooled.
    pub fn pooling_positions(
        &self,
        input_ids: &[i32],
        batch_size: usize,
        seq_len: usize,
    ) -> anyhow::Result<Vec<i32>> {
        match self.pad_token_id {
            Some(pad) => Ok(input_ids
                .chunks(seq_len.max(1))
                .take(batch_size)
                .map(|row| row.iter().rposition(|&id| id != pad).unwrap_or(0) as i32)
                .collect()),
            None if batch_size <= 1 => Ok(vec![seq_len.saturating_sub(1) as i32; batch_size]),
            None => anyhow::bail!("Cannot handle batch sizes > 1 if no padding token is defined"),
        }
    }

    /// Logits `[batch, num_labels]` read at `positions` (`[batch]`, i32).
    pub fn forward(&mut self, input_ids: &Array, positions: &Array) -> Result<Array, Exception> {
        let hidden = self.model.forward(input_ids)?;
        let (batch_size, seq_len, hidden_size) = (hidden.dim(0), hidden.dim(1), hidden.dim(2));

        // One-hot row selector [B, 1, L] picks the pooled token out of [B, L, H]
        let columns = mlx_rs::ops::arange::<_, i32>(0, seq_len, 1)?.reshape(&[1, 1, seq_len])?;
        let selector = positions
            .reshape(&[batch_size, 1, 1])?
            .eq(&columns)?
            .as_type::<f32>()?;
        let pooled = selector
            .matmul(&hidden)?
            .reshape(&[batch_size, hidden_size])?;

        pooled.matmul(&self.score.transpose_axes(&[1, 0])?)
    }

    /// Mutable handle on a quantized projection of one decoder layer
    pub fn projection_mut(&mut self, layer: usize, name: &str) -> Option<&mut AdaptedLinear> {
        let layer = self.model.layers.get_mut(layer)?;
        layer
            .self_attn
            .projection_mut(name)
            .or_else(|| layer.mlp.projection_mut(name))
    }

    /// All weights the model represents, frozen or not
    pub fn total_parameter_count(&self) -> usize {
        let tree: usize = self
            .parameters()
            .flatten()
            .values()
            .map(|p| p.size())
            .sum();
        self.model.frozen_parameter_count() + tree
    }

    pub fn trainable_parameter_count(&self) -> usize {
        self.trainable_parameters()
            .flatten()
            .values()
            .map(|p| p.size())
            .sum()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn tiny_config() -> LlamaConfig {
        LlamaConfig {
            hidden_size: 64,
            intermediate_size: 128,
            num_attention_heads: 4,
            num_key_value_heads: Some(2),
            num_hidden_layers: 1,
            vocab_size: 16,
            rms_norm_eps: 1e-5,
            rope_theta: 10000.0,
            max_position_embeddings: Some(128),
            pad_token_id: None,
        }
    }

    /// Random dense weights with HuggingFace Llama names
    pub(crate) fn tiny_weights(config: &LlamaConfig) -> HashMap<String, Array> {
        let h = config.hidden_size;
        let i = config.intermediate_size;
        let kv = config.kv_heads() * config.head_dim();
        let rand = |shape: &[i32]| mlx_rs::random::uniform::<_, f32>(-0.1, 0.1, shape, None).unwrap();

        let mut w = HashMap::new();
        w.insert("model.embed_tokens.weight".into(), rand(&[config.vocab_size, h]));
        w.insert("model.norm.weight".into(), mlx_rs::ops::ones::<f32>(&[h]).unwrap());
        for l in 0..config.num_hidden_layers {
            let p = format!("model.layers.{}", l);
            w.insert(format!("{p}.self_attn.q_proj.weight"), rand(&[h, h]));
            w.insert(format!("{p}.self_attn.k_proj.weight"), rand(&[kv, h]));
            w.insert(format!("{p}.self_attn.v_proj.weight"), rand(&[kv, h]));
            w.insert(format!("{p}.self_attn.o_proj.weight"), rand(&[h, h]));
            w.insert(format!("{p}.mlp.gate_proj.weight"), rand(&[i, h]));
            w.insert(format!("{p}.mlp.up_proj.weight"), rand(&[i, h]));
            w.insert(format!("{p}.mlp.down_proj.weight"), rand(&[h, i]));
            w.insert(
                format!("{p}.input_layernorm.weight"),
                mlx_rs::ops::ones::<f32>(&[h]).unwrap(),
            );
            w.insert(
                format!("{p}.post_attention_layernorm.weight"),
                mlx_rs::ops::ones::<f32>(&[h]).unwrap(),
            );
        }
        w
    }

    fn tiny_model() -> LlamaForSequenceClassification {
        let config = tiny_config();
        let weights = tiny_weights(&config);
        LlamaForSequenceClassification::from_weights(
            config,
            4,
            weights,
            &QuantizationConfig::for_loftq(),
        )
        .unwrap()
    }

    #[test]
    fn test_forward_produces_one_logit_row_per_example() {
        let mut model = tiny_model();
        model.set_pad_token_id(0);
        let ids = vec![3, 4, 5, 0, 6, 7, 0, 0];
        let positions = model.pooling_positions(&ids, 2, 4).unwrap();
        assert_eq!(positions, vec![2, 1]);

        let input = Array::from_slice(&ids, &[2, 4]);
        let positions = Array::from_slice(&positions, &[2]);
        let logits = model.forward(&input, &positions).unwrap();
        assert_eq!(logits.shape(), &[2, 4]);
    }

    #[test]
    fn test_padding_does_not_change_pooled_logits() {
        let mut model = tiny_model();
        model.set_pad_token_id(0);

        let short = Array::from_slice(&[3, 4, 5], &[1, 3]);
        let padded = Array::from_slice(&[3, 4, 5, 0, 0], &[1, 5]);
        let pos = Array::from_slice(&[2], &[1]);

        let a = model.forward(&short, &pos).unwrap();
        let b = model.forward(&padded, &pos).unwrap();
        a.eval().unwrap();
        b.eval().unwrap();
        for (x, y) in a.as_slice::<f32>().iter().zip(b.as_slice::<f32>()) {
            assert!((x - y).abs() < 1e-4);
        }
    }

    #[test]
    fn test_batches_need_a_pad_token() {
        let model = tiny_model();
        assert!(model.pooling_positions(&[1, 2, 3, 4], 2, 2).is_err());
        assert_eq!(model.pooling_positions(&[1, 2], 1, 2).unwrap(), vec![1]);
    }

    #[test]
    fn test_only_score_is_trainable_before_adapters() {
        let model = tiny_model();
        assert_eq!(model.trainable_parameter_count(), 4 * 64);
        assert!(model.total_parameter_count() > model.trainable_parameter_count());
    }

    #[test]
    fn test_missing_projection_is_reported() {
        let config = tiny_config();
        let mut weights = tiny_weights(&config);
        weights.remove("model.layers.0.mlp.up_proj.weight");
        let err = LlamaForSequenceClassification::from_weights(
            config,
            4,
            weights,
            &QuantizationConfig::for_loftq(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("model.layers.0.mlp.up_proj.weight"));
    }
}
