mod batcher;
mod dataset;
mod loader;
mod transform;

pub use batcher::{BatchLabels, ImageBatch, ImageBatcher};
pub use dataset::{ImageCsvDataset, Label, Sample};
pub use loader::{BatchIterator, BatchOrder, BatchPass};
pub use transform::ImageTransform;

#[cfg(test)]
pub(crate) use loader::tests::CountingDataset;
