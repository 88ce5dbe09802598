//! Batch collation with right padding

use crate::data::dataset::EncodedExample;

/// Padded batch kept in host memory until the trainer uploads it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    /// Row-major `[batch_size, seq_len]`
    pub input_ids: Vec<i32>,
    /// 1 for real tokens, 0 for padding, same layout as `input_ids`
    pub attention_mask: Vec<i32>,
    /// Number of real tokens per row
    pub lengths: Vec<usize>,
    pub labels: Vec<i32>,
    pub batch_size: usize,
    pub seq_len: usize,
}

impl Batch {
    pub fn shape(&self) -> [i32; 2] {
        [self.batch_size as i32, self.seq_len as i32]
    }
}

/// Pads every row to the longest sequence in the batch.
pub fn collate(items: &[&EncodedExample], pad_token_id: u32) -> Batch {
    // Empty inputs still occupy one (pad) position so pooling has a token to read.
    let seq_len = items
        .iter()
        .map(|item| item.input_ids.len())
        .max()
        .unwrap_or(0)
        .max(1);

    let mut input_ids = Vec::with_capacity(items.len() * seq_len);
    let mut attention_mask = Vec::with_capacity(items.len() * seq_len);
    let mut lengths = Vec::with_capacity(items.len());
    let mut labels = Vec::with_capacity(items.len());

    for item in items {
        let len = item.input_ids.len();
        input_ids.extend(item.input_ids.iter().map(|&id| id as i32));
        input_ids.extend(std::iter::repeat(pad_token_id as i32).take(seq_len - len));
        attention_mask.extend(std::iter::repeat(1).take(len));
        attention_mask.extend(std::iter::repeat(0).take(seq_len - len));
        lengths.push(len.max(1));
        labels.push(item.label as i32);
    }

    Batch {
        input_ids,
        attention_mask,
        lengths,
        labels,
        batch_size: items.len(),
        seq_len,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collate_pads_to_longest_row() {
        let a = EncodedExample {
            input_ids: vec![5, 6, 7],
            label: 2,
        };
        let b = EncodedExample {
            input_ids: vec![8],
            label: 0,
        };
        let batch = collate(&[&a, &b], 9);

        assert_eq!(batch.shape(), [2, 3]);
        assert_eq!(batch.input_ids, vec![5, 6, 7, 8, 9, 9]);
        assert_eq!(batch.attention_mask, vec![1, 1, 1, 1, 0, 0]);
        assert_eq!(batch.lengths, vec![3, 1]);
        assert_eq!(batch.labels, vec![2, 0]);
    }

    #[test]
    fn test_empty_row_keeps_one_position() {
        let empty = EncodedExample {
            input_ids: vec![],
            label: 1,
        };
        let batch = collate(&[&empty], 0);
        assert_eq!(batch.seq_len, 1);
        assert_eq!(batch.lengths, vec![1]);
        assert_eq!(batch.attention_mask, vec![0]);
    }
}
