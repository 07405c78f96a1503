use burn::data::dataloader::batcher::Batcher;
use burn::tensor::backend::Backend;
use std::ops::Range;
use std::path::PathBuf;

use super::dataset::{Label, Sample};
use crate::error::{Error, Result};

/// Labels of a collated batch.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchLabels {
    Classes(Vec<i64>),
    /// Row-major `[batch, width]` probabilities.
    Distributions { values: Vec<f32>, width: usize },
}

/// A CPU-side batch, ready to be moved onto a compute device.
#[derive(Debug, Clone)]
pub struct ImageBatch {
    /// Dataset indices of the samples, in batch order.
    pub indices: Vec<usize>,
    pub images: Vec<f32>,
    /// `[batch, channels, height, width]`
    pub shape: [usize; 4],
    pub labels: BatchLabels,
}

impl ImageBatch {
    pub fn len(&self) -> usize {
        self.shape[0]
    }

    pub fn is_empty(&self) -> bool {
        self.shape[0] == 0
    }

    /// Rows `range` of this batch as a new batch.
    pub fn slice(&self, range: Range<usize>) -> Self {
        let [_, c, h, w] = self.shape;
        let per_image = c * h * w;
        let labels = match &self.labels {
            BatchLabels::Classes(classes) => BatchLabels::Classes(classes[range.clone()].to_vec()),
            BatchLabels::Distributions { values, width } => BatchLabels::Distributions {
                values: values[range.start * width..range.end * width].to_vec(),
                width: *width,
            },
        };

        Self {
            indices: self.indices[range.clone()].to_vec(),
            images: self.images[range.start * per_image..range.end * per_image].to_vec(),
            shape: [range.len(), c, h, w],
            labels,
        }
    }

    /// Stacks samples into one batch. All samples must share an image
    /// shape and a label kind.
    pub fn collate(samples: Vec<Sample>) -> Result<Self> {
        let first = samples
            .first()
            .ok_or_else(|| Error::data(PathBuf::new(), "cannot collate an empty batch"))?;
        let [c, h, w] = first.shape;
        let first_width = first.label.width();

        let mut images = Vec::with_capacity(samples.len() * c * h * w);
        let mut classes = Vec::new();
        let mut probs = Vec::new();

        for sample in &samples {
            if sample.shape != first.shape {
                return Err(Error::ShapeMismatch {
                    expected: first.shape.to_vec(),
                    actual: sample.shape.to_vec(),
                });
            }
            images.extend_from_slice(&sample.image);

            match (&first.label, &sample.label) {
                (Label::Class(_), Label::Class(class)) => classes.push(*class as i64),
                (Label::Distribution(_), Label::Distribution(p)) if p.len() == first_width => {
                    probs.extend_from_slice(p)
                }
                _ => {
                    return Err(Error::ShapeMismatch {
                        expected: vec![first_width],
                        actual: vec![sample.label.width()],
                    })
                }
            }
        }

        let labels = match first.label {
            Label::Class(_) => BatchLabels::Classes(classes),
            Label::Distribution(_) => BatchLabels::Distributions {
                values: probs,
                width: first_width,
            },
        };

        Ok(Self {
            indices: samples.iter().map(|s| s.index).collect(),
            images,
            shape: [samples.len(), c, h, w],
            labels,
        })
    }
}

/// Collates samples into host-side [`ImageBatch`]es. The batch stays in
/// host memory; learners move each shard onto its own device.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImageBatcher;

impl<B: Backend> Batcher<B, Sample, Result<ImageBatch>> for ImageBatcher {
    fn batch(&self, items: Vec<Sample>, _device: &B::Device) -> Result<ImageBatch> {
        ImageBatch::collate(items)
    }
}
