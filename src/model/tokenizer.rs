//! Tokenizer integration using HuggingFace tokenizers

use anyhow::Context;
use serde::Deserialize;
use std::path::Path;
use tokenizers::Tokenizer;

/// Files that may name the padding token, in the order `transformers` reads them
const SPECIAL_TOKEN_FILES: &[&str] = &["tokenizer_config.json", "special_tokens_map.json"];

/// A special token is either a bare string or an added-token object
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SpecialToken {
    Text(String),
    Added { content: String },
}

impl SpecialToken {
    fn content(&self) -> &str {
        match self {
            SpecialToken::Text(content) | SpecialToken::Added { content } => content,
        }
    }
}

#[derive(Debug, Deserialize)]
struct SpecialTokens {
    #[serde(default)]
    pad_token: Option<SpecialToken>,
}

pub struct TokenizerWrapper {
    tokenizer: Tokenizer,
    pad_token_id: Option<u32>,
}

impl TokenizerWrapper {
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let tokenizer = Tokenizer::from_file(path.as_ref()).map_err(|e| {
            anyhow::anyhow!(
                "Failed to load tokenizer from {}: {}",
                path.as_ref().display(),
                e
            )
        })?;
        Ok(Self::new(tokenizer))
    }

    /// Loads `tokenizer.json` from a model directory.
    ///
    /// The padding token is the `pad_token` of `tokenizer_config.json`, else of
    /// `special_tokens_map.json`, else the padding configured in `tokenizer.json`.
    pub fn from_pretrained(model_dir: impl AsRef<Path>) -> anyhow::Result<Self> {
        let model_dir = model_dir.as_ref();
        let wrapper = Self::from_file(model_dir.join("tokenizer.json"))?;
        match configured_pad_token(model_dir)? {
            Some(token) => wrapper.with_pad_token(&token),
            None => Ok(wrapper),
        }
    }

    /// Wraps `tokenizer`, taking the pad id from its padding parameters if it has any.
    pub fn new(tokenizer: Tokenizer) -> Self {
        let pad_token_id = tokenizer.get_padding().map(|padding| padding.pad_id);
        Self {
            tokenizer,
            pad_token_id,
        }
    }

    pub fn with_pad_token(mut self, token: &str) -> anyhow::Result<Self> {
        let id = self
            .tokenizer
            .token_to_id(token)
            .ok_or_else(|| anyhow::anyhow!("Padding token '{}' is not in the vocabulary", token))?;
        self.pad_token_id = Some(id);
        Ok(self)
    }

    /// `None` when the tokenizer defines no padding token
    pub fn pad_token_id(&self) -> Option<u32> {
        self.pad_token_id
    }

    pub fn encode(&self, text: &str, add_special_tokens: bool) -> anyhow::Result<Vec<u32>> {
        let encoding = self
            .tokenizer
            .encode(text, add_special_tokens)
            .map_err(|e| anyhow::anyhow!("Tokenization error: {}", e))?;
        Ok(encoding.get_ids().to_vec())
    }

    pub fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> anyhow::Result<String> {
        self.tokenizer
            .decode(ids, skip_special_tokens)
            .map_err(|e| anyhow::anyhow!("Decode error: {}", e))
    }
}

fn configured_pad_token(model_dir: &Path) -> anyhow::Result<Option<String>> {
    for name in SPECIAL_TOKEN_FILES {
        let path = model_dir.join(name);
        if !path.exists() {
            continue;
        }
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let tokens: SpecialTokens = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        if let Some(token) = tokens.pad_token {
            return Ok(Some(token.content().to_string()));
        }
    }
    Ok(None)
}
