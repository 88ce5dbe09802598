//! JSON reading for multiple-choice question files

use anyhow::Context;
use serde::{Deserialize, Deserializer, Serialize};
use std::path::Path;

/// One multiple-choice question
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultipleChoiceExample {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(alias = "instruction", alias = "prompt")]
    pub question: String,
    #[serde(alias = "choices")]
    pub options: Vec<String>,
    /// Index of the correct option
    #[serde(alias = "label", deserialize_with = "deserialize_answer")]
    pub answer: usize,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawAnswer {
    Index(usize),
    Letter(String),
}

// Answers appear either as an index or as the option letter ("A".."D").
fn deserialize_answer<'de, D>(deserializer: D) -> Result<usize, D::Error>
where
    D: Deserializer<'de>,
{
    match RawAnswer::deserialize(deserializer)? {
        RawAnswer::Index(i) => Ok(i),
        RawAnswer::Letter(s) => {
            let trimmed = s.trim();
            let mut chars = trimmed.chars();
            match (chars.next(), chars.next()) {
                (Some(c @ 'A'..='Z'), None) => Ok(c as usize - 'A' as usize),
                (Some(c @ 'a'..='z'), None) => Ok(c as usize - 'a' as usize),
                _ => trimmed.parse::<usize>().map_err(|_| {
                    serde::de::Error::custom(format!("invalid answer '{}'", s))
                }),
            }
        }
    }
}

/// Reads a JSON array of questions.
pub fn read_json(path: impl AsRef<Path>) -> anyhow::Result<Vec<MultipleChoiceExample>> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read data file {}", path.display()))?;
    let examples: Vec<MultipleChoiceExample> = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse data file {}", path.display()))?;

    for (i, example) in examples.iter().enumerate() {
        if example.answer >= example.options.len() {
            anyhow::bail!(
                "Example {} in {} has answer {} but only {} options",
                i,
                path.display(),
                example.answer,
                example.options.len()
            );
        }
    }

    Ok(examples)
}
