pub mod checkpoint;
pub mod log;

pub use checkpoint::{CHECKPOINT_FILE, Checkpoint, CheckpointStore};
pub use log::{LogStore, LogStoreOptions};
