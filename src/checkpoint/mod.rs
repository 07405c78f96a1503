mod record;

pub use record::{CheckpointEntry, CheckpointManager};
