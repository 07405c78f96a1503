// Library exports for the training binary and integration use

pub mod checkpoint;
pub mod config;
pub mod data;
pub mod error;
pub mod inference;
pub mod model;
pub mod training;

// Re-export commonly used types
pub use config::RunConfig;
pub use error::{Error, Result};
pub use model::{StyleNet, StyleNetConfig};
pub use training::{Learner, RunSummary, StyleLearner, TrainingLoop};
