//! Tokenized multiple-choice dataset

use crate::data::reader::MultipleChoiceExample;
use crate::model::TokenizerWrapper;

const SYSTEM_PROMPT: &str = "你是人工智慧助理，以下是用戶和人工智能助理之間的對話。你要對用戶的問題提供有用、安全、詳細和禮貌的回答。";
const OPTION_LETTERS: &[char] = &['A', 'B', 'C', 'D', 'E', 'F', 'G', 'H'];

/// Chat prompt listing the question and its lettered options.
pub fn format_prompt(example: &MultipleChoiceExample) -> String {
    let mut prompt = format!("{} USER: {}\n", SYSTEM_PROMPT, example.question.trim());
    for (letter, option) in OPTION_LETTERS.iter().zip(&example.options) {
        prompt.push_str(&format!("{}. {}\n", letter, option.trim()));
    }
    prompt.push_str("請選出正確答案。 ASSISTANT:");
    prompt
}

/// A tokenized example ready for collation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedExample {
    pub input_ids: Vec<u32>,
    pub label: usize,
}

pub struct MultipleChoiceDataset {
    items: Vec<EncodedExample>,
    max_length: usize,
}

impl MultipleChoiceDataset {
    /// Tokenizes every example; sequences longer than `max_length` are cut.
    pub fn new(
        examples: Vec<MultipleChoiceExample>,
        tokenizer: &TokenizerWrapper,
        max_length: usize,
    ) -> anyhow::Result<Self> {
        let mut items = Vec::with_capacity(examples.len());
        let mut truncated = 0usize;

        for example in &examples {
            let mut input_ids = tokenizer.encode(&format_prompt(example), true)?;
            if input_ids.len() > max_length {
                input_ids.truncate(max_length);
                truncated += 1;
            }
            items.push(EncodedExample {
                input_ids,
                label: example.answer,
            });
        }

        if truncated > 0 {
            tracing::debug!(truncated, max_length, "truncated long examples");
        }

        Ok(Self { items, max_length })
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&EncodedExample> {
        self.items.get(index)
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::tokenizer::tests::word_level_tokenizer;

    fn example(question: &str, answer: usize) -> MultipleChoiceExample {
        MultipleChoiceExample {
            id: None,
            question: question.to_string(),
            options: vec!["a".into(), "b".into(), "c".into(), "d".into()],
            answer,
        }
    }

    #[test]
    fn test_prompt_lists_lettered_options() {
        let prompt = format_prompt(&example("What?", 0));
        assert!(prompt.contains("USER: What?\nA. a\nB. b\nC. c\nD. d\n"));
        assert!(prompt.ends_with("ASSISTANT:"));
    }

    #[test]
    fn test_dataset_keeps_every_example() {
        let tokenizer = TokenizerWrapper::new(word_level_tokenizer(&["a", "b"]));
        let examples = (0..5).map(|i| example("q", i % 4)).collect();
        let dataset = MultipleChoiceDataset::new(examples, &tokenizer, 1024).unwrap();
        assert_eq!(dataset.len(), 5);
        assert_eq!(dataset.get(4).unwrap().label, 0);
    }

    #[test]
    fn test_long_inputs_are_truncated() {
        let tokenizer = TokenizerWrapper::new(word_level_tokenizer(&["a", "b"]));
        let dataset = MultipleChoiceDataset::new(vec![example("a b a b a b", 1)], &tokenizer, 4)
            .unwrap();
        assert_eq!(dataset.get(0).unwrap().input_ids.len(), 4);
    }
}
