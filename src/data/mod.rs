pub mod collate;
pub mod dataset;
pub mod loader;
pub mod reader;

pub use collate::{collate, Batch};
pub use dataset::{format_prompt, EncodedExample, MultipleChoiceDataset};
pub use loader::{BatchIter, DataLoader};
pub use reader::{read_json, MultipleChoiceExample};
