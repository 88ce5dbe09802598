//! Batched iteration over a dataset with optional background collation

use crate::data::collate::{collate, Batch};
use crate::data::dataset::MultipleChoiceDataset;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::sync::{mpsc, Arc};
use std::thread;

/// Batches each worker may have collated before the trainer asks for them
const WORKER_QUEUE_DEPTH: usize = 2;

pub struct DataLoader {
    dataset: Arc<MultipleChoiceDataset>,
    batch_size: usize,
    shuffle: bool,
    seed: u64,
    num_workers: usize,
    pad_token_id: u32,
}

impl DataLoader {
    /// Sequential loader without background workers.
    ///
    /// Rows can only be padded when the tokenizer defines a padding token, so
    /// without one the batch size must be 1.
    pub fn new(
        dataset: Arc<MultipleChoiceDataset>,
        batch_size: usize,
        pad_token_id: Option<u32>,
    ) -> anyhow::Result<Self> {
        if batch_size == 0 {
            anyhow::bail!("batch_size must be > 0");
        }
        if batch_size > 1 && pad_token_id.is_none() {
            anyhow::bail!("Cannot handle batch sizes > 1 if no padding token is defined");
        }
        // Single-row batches are never padded, so the filler is irrelevant there.
        let pad_token_id = pad_token_id.unwrap_or_default();
        Ok(Self {
            dataset,
            batch_size,
            shuffle: false,
            seed: 42,
            num_workers: 0,
            pad_token_id,
        })
    }

    /// Reshuffle example order every epoch; the order is a function of `seed` and the epoch.
    pub fn with_shuffle(mut self, seed: u64) -> Self {
        self.shuffle = true;
        self.seed = seed;
        self
    }

    pub fn with_workers(mut self, num_workers: usize) -> Self {
        self.num_workers = num_workers;
        self
    }

    /// Number of batches per epoch
    pub fn len(&self) -> usize {
        self.dataset.len().div_ceil(self.batch_size)
    }

    pub fn is_empty(&self) -> bool {
        self.dataset.is_empty()
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    fn batch_plan(&self, epoch: usize) -> Vec<Vec<usize>> {
        let mut order: Vec<usize> = (0..self.dataset.len()).collect();
        if self.shuffle {
            let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(epoch as u64));
            order.shuffle(&mut rng);
        }
        order
            .chunks(self.batch_size)
            .map(|chunk| chunk.to_vec())
            .collect()
    }

    pub fn iter(&self, epoch: usize) -> BatchIter {
        let plan = Arc::new(self.batch_plan(epoch));

        if self.num_workers == 0 {
            return BatchIter {
                source: Source::Inline {
                    dataset: self.dataset.clone(),
                    plan,
                    pad_token_id: self.pad_token_id,
                },
                next: 0,
            };
        }

        let mut receivers = Vec::with_capacity(self.num_workers);
        let mut workers = Vec::with_capacity(self.num_workers);

        for worker_id in 0..self.num_workers {
            let (sender, receiver) = mpsc::sync_channel::<Batch>(WORKER_QUEUE_DEPTH);
            let dataset = self.dataset.clone();
            let plan = plan.clone();
            let pad_token_id = self.pad_token_id;
            let stride = self.num_workers;

            workers.push(thread::spawn(move || {
                for indices in plan.iter().skip(worker_id).step_by(stride) {
                    let batch = collate_indices(&dataset, indices, pad_token_id);
                    if sender.send(batch).is_err() {
                        // Receiver dropped: the epoch was abandoned.
                        break;
                    }
                }
            }));
            receivers.push(receiver);
        }

        BatchIter {
            source: Source::Workers {
                receivers,
                workers,
                total: plan.len(),
            },
            next: 0,
        }
    }
}

fn collate_indices(dataset: &MultipleChoiceDataset, indices: &[usize], pad_token_id: u32) -> Batch {
    let items: Vec<_> = indices.iter().filter_map(|&i| dataset.get(i)).collect();
    collate(&items, pad_token_id)
}

enum Source {
    Inline {
        dataset: Arc<MultipleChoiceDataset>,
        plan: Arc<Vec<Vec<usize>>>,
        pad_token_id: u32,
    },
    Workers {
        receivers: Vec<mpsc::Receiver<Batch>>,
        workers: Vec<thread::JoinHandle<()>>,
        total: usize,
    },
}

/// One epoch worth of batches, yielded in plan order
pub struct BatchIter {
    source: Source,
    next: usize,
}

impl Iterator for BatchIter {
    type Item = Batch;

    fn next(&mut self) -> Option<Batch> {
        let index = self.next;
        let batch = match &self.source {
            Source::Inline {
                dataset,
                plan,
                pad_token_id,
            } => plan
                .get(index)
                .map(|indices| collate_indices(dataset, indices, *pad_token_id)),
            Source::Workers {
                receivers, total, ..
            } => {
                if index >= *total {
                    None
                } else {
                    // Worker `i` owns batches i, i + n, i + 2n, ...
                    receivers[index % receivers.len()].recv().ok()
                }
            }
        };
        if batch.is_some() {
            self.next += 1;
        }
        batch
    }
}

impl Drop for BatchIter {
    fn drop(&mut self) {
        if let Source::Workers {
            receivers, workers, ..
        } = &mut self.source
        {
            // Unblock workers waiting on a full queue before joining them.
            receivers.clear();
            for worker in workers.drain(..) {
                if worker.join().is_err() {
                    tracing::warn!("data loader worker panicked");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::reader::MultipleChoiceExample;
    use crate::model::tokenizer::tests::word_level_tokenizer;
    use crate::model::TokenizerWrapper;

    fn dataset(n: usize) -> Arc<MultipleChoiceDataset> {
        let tokenizer = TokenizerWrapper::new(word_level_tokenizer(&["q"]));
        let examples = (0..n)
            .map(|i| MultipleChoiceExample {
                id: Some(i.to_string()),
                question: "q ".repeat(i + 1),
                options: vec!["a".into(), "b".into(), "c".into(), "d".into()],
                answer: i % 4,
            })
            .collect();
        Arc::new(MultipleChoiceDataset::new(examples, &tokenizer, 1024).unwrap())
    }

    fn labels(loader: &DataLoader, epoch: usize) -> Vec<i32> {
        loader.iter(epoch).flat_map(|b| b.labels).collect()
    }

    #[test]
    fn test_batch_count_is_ceil() {
        let loader = DataLoader::new(dataset(10), 3, Some(0)).unwrap();
        assert_eq!(loader.len(), 4);
        let sizes: Vec<usize> = loader.iter(0).map(|b| b.batch_size).collect();
        assert_eq!(sizes, vec![3, 3, 3, 1]);
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        assert!(DataLoader::new(dataset(2), 0, Some(0)).is_err());
    }

    #[test]
    fn test_missing_pad_token_limits_batch_size() {
        let err = DataLoader::new(dataset(4), 2, None).err().unwrap();
        assert!(err.to_string().contains("no padding token"));

        let loader = DataLoader::new(dataset(4), 1, None).unwrap();
        assert_eq!(loader.iter(0).count(), 4);
    }

    #[test]
    fn test_sequential_order_is_stable() {
        let loader = DataLoader::new(dataset(6), 4, Some(0)).unwrap();
        assert_eq!(labels(&loader, 0), vec![0, 1, 2, 3, 0, 1]);
        assert_eq!(labels(&loader, 0), labels(&loader, 1));
    }

    #[test]
    fn test_shuffle_changes_between_epochs_but_is_reproducible() {
        let loader = DataLoader::new(dataset(64), 8, Some(0)).unwrap().with_shuffle(7);
        let first = labels(&loader, 0);
        assert_eq!(first, labels(&loader, 0));
        assert_ne!(first, labels(&loader, 1));

        let mut sorted = first.clone();
        sorted.sort();
        let mut expected = labels(&DataLoader::new(dataset(64), 8, Some(0)).unwrap(), 0);
        expected.sort();
        assert_eq!(sorted, expected);
    }

    #[test]
    fn test_workers_preserve_plan_order() {
        let inline = DataLoader::new(dataset(23), 4, Some(0)).unwrap().with_shuffle(3);
        let threaded = DataLoader::new(dataset(23), 4, Some(0))
            .unwrap()
            .with_shuffle(3)
            .with_workers(2);

        let a: Vec<Batch> = inline.iter(5).collect();
        let b: Vec<Batch> = threaded.iter(5).collect();
        assert_eq!(a.len(), 6);
        assert_eq!(a, b);
    }

    #[test]
    fn test_abandoned_epoch_does_not_hang() {
        let loader = DataLoader::new(dataset(40), 2, Some(0)).unwrap().with_workers(2);
        let mut iter = loader.iter(0);
        assert!(iter.next().is_some());
        drop(iter);
    }
}
