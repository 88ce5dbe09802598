//! Fixtures shared by the integration tests: a tiny Llama directory with a
//! LoftQ-style adapter and a word-level tokenizer.

#![allow(dead_code)]

use loftq_mc::model::{save_safetensors, LOFTQ_SUBFOLDER};
use mlx_rs::Array;
use serde_json::json;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

pub const HIDDEN: i32 = 64;
pub const INTERMEDIATE: i32 = 128;
pub const HEADS: i32 = 4;
pub const KV_HEADS: i32 = 2;
pub const VOCAB: i32 = 16;
pub const RANK: usize = 4;

pub const WORDS: &[&str] = &["<pad>", "what", "is", "one", "two", "three", "four", "five"];
pub const PAD_ID: u32 = 1;

fn rand(shape: &[i32]) -> Array {
    mlx_rs::random::uniform::<_, f32>(-0.1, 0.1, shape, None).unwrap()
}

fn ones(len: i32) -> Array {
    mlx_rs::ops::ones::<f32>(&[len]).unwrap()
}

/// Fixture tokenizer with `<pad>` as its padding token
pub fn write_tokenizer(dir: &Path) {
    write_tokenizer_with(dir, WORDS, Some("<pad>"));
}

/// Word-level `tokenizer.json` over `words` (ids from 1, `<unk>` = 0), plus a
/// `tokenizer_config.json` naming `pad_token` when given.
pub fn write_tokenizer_with(dir: &Path, words: &[&str], pad_token: Option<&str>) {
    let mut vocab = serde_json::Map::new();
    vocab.insert("<unk>".to_string(), json!(0));
    for (i, word) in words.iter().enumerate() {
        vocab.insert(word.to_string(), json!(i + 1));
    }
    let tokenizer_json = json!({
        "version": "1.0",
        "truncation": null,
        "padding": null,
        "added_tokens": [],
        "normalizer": null,
        "pre_tokenizer": {"type": "Whitespace"},
        "post_processor": null,
        "decoder": null,
        "model": {"type": "WordLevel", "vocab": vocab, "unk_token": "<unk>"}
    });
    std::fs::write(dir.join("tokenizer.json"), tokenizer_json.to_string()).unwrap();

    let config_path = dir.join("tokenizer_config.json");
    match pad_token {
        Some(token) => {
            let config = json!({"tokenizer_class": "LlamaTokenizer", "pad_token": token});
            std::fs::write(&config_path, config.to_string()).unwrap();
        }
        None if config_path.exists() => std::fs::remove_file(&config_path).unwrap(),
        None => {}
    }
}

fn write_base_model(dir: &Path) {
    let config = json!({
        "architectures": ["LlamaForCausalLM"],
        "hidden_size": HIDDEN,
        "intermediate_size": INTERMEDIATE,
        "num_attention_heads": HEADS,
        "num_key_value_heads": KV_HEADS,
        "num_hidden_layers": 1,
        "vocab_size": VOCAB,
        "rms_norm_eps": 1e-5,
        "max_position_embeddings": 256
    });
    std::fs::write(dir.join("config.json"), config.to_string()).unwrap();

    let kv = KV_HEADS * (HIDDEN / HEADS);
    let mut w = HashMap::new();
    w.insert("model.embed_tokens.weight".to_string(), rand(&[VOCAB, HIDDEN]));
    w.insert("model.norm.weight".to_string(), ones(HIDDEN));
    w.insert("lm_head.weight".to_string(), rand(&[VOCAB, HIDDEN]));
    let p = "model.layers.0";
    w.insert(format!("{p}.self_attn.q_proj.weight"), rand(&[HIDDEN, HIDDEN]));
    w.insert(format!("{p}.self_attn.k_proj.weight"), rand(&[kv, HIDDEN]));
    w.insert(format!("{p}.self_attn.v_proj.weight"), rand(&[kv, HIDDEN]));
    w.insert(format!("{p}.self_attn.o_proj.weight"), rand(&[HIDDEN, HIDDEN]));
    w.insert(format!("{p}.mlp.gate_proj.weight"), rand(&[INTERMEDIATE, HIDDEN]));
    w.insert(format!("{p}.mlp.up_proj.weight"), rand(&[INTERMEDIATE, HIDDEN]));
    w.insert(format!("{p}.mlp.down_proj.weight"), rand(&[HIDDEN, INTERMEDIATE]));
    w.insert(format!("{p}.input_layernorm.weight"), ones(HIDDEN));
    w.insert(format!("{p}.post_attention_layernorm.weight"), ones(HIDDEN));
    save_safetensors(&w, &dir.join("model.safetensors")).unwrap();
}

/// Adapter on `q_proj` and `v_proj` with a saved `score` head.
pub fn write_adapter(dir: &Path, rank: usize, loftq_bits: usize) {
    let adapter_dir = dir.join(LOFTQ_SUBFOLDER);
    std::fs::create_dir_all(&adapter_dir).unwrap();

    let config = json!({
        "peft_type": "LORA",
        "task_type": "SEQ_CLS",
        "r": rank,
        "lora_alpha": 16,
        "lora_dropout": 0.1,
        "target_modules": ["q_proj", "v_proj"],
        "modules_to_save": ["score"],
        "init_lora_weights": "loftq",
        "loftq_config": {"loftq_bits": loftq_bits, "loftq_iter": 1}
    });
    std::fs::write(adapter_dir.join("adapter_config.json"), config.to_string()).unwrap();

    let r = rank as i32;
    let kv = KV_HEADS * (HIDDEN / HEADS);
    let prefix = "base_model.model.model.layers.0.self_attn";
    let mut w = HashMap::new();
    w.insert(format!("{prefix}.q_proj.lora_A.weight"), rand(&[r, HIDDEN]));
    w.insert(format!("{prefix}.q_proj.lora_B.weight"), rand(&[HIDDEN, r]));
    w.insert(format!("{prefix}.v_proj.lora_A.weight"), rand(&[r, HIDDEN]));
    w.insert(format!("{prefix}.v_proj.lora_B.weight"), rand(&[kv, r]));
    w.insert("base_model.model.score.weight".to_string(), rand(&[4, HIDDEN]));
    save_safetensors(&w, &adapter_dir.join("adapter_model.safetensors")).unwrap();
}

/// Trainable values the fixture adapter carries: score + q_proj A/B + v_proj A/B
pub fn expected_trainable(rank: usize) -> usize {
    let r = rank;
    let h = HIDDEN as usize;
    let kv = (KV_HEADS * (HIDDEN / HEADS)) as usize;
    4 * h + (r * h + h * r) + (r * h + kv * r)
}

/// Writes a complete model directory and returns its path.
pub fn write_model_dir(root: &Path) -> PathBuf {
    let dir = root.join("tiny-llama");
    std::fs::create_dir_all(&dir).unwrap();
    write_base_model(&dir);
    write_tokenizer(&dir);
    write_adapter(&dir, RANK, 2);
    dir
}

/// JSON file with `n` questions over the fixture vocabulary
pub fn write_questions(path: &Path, n: usize) {
    let options = ["one", "two", "three", "four"];
    let examples: Vec<_> = (0..n)
        .map(|i| {
            json!({
                "id": format!("q{}", i),
                "instruction": "what is ".repeat(i % 3 + 1),
                "options": options,
                "answer": i % 4,
            })
        })
        .collect();
    std::fs::write(path, serde_json::to_string(&examples).unwrap()).unwrap();
}
