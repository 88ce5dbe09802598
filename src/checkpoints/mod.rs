pub mod manager;
pub mod state;

pub use manager::{CheckpointManager, BEST_CHECKPOINT_NAME, DEFAULT_MAX_CHECKPOINTS};
pub use state::{AdapterState, Checkpoint, CheckpointMetadata};
