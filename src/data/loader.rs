use burn::data::dataloader::batcher::Batcher;
use burn::data::dataset::Dataset;
use burn_ndarray::{NdArray, NdArrayDevice};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::path::PathBuf;
use std::sync::mpsc::{sync_channel, Receiver};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::debug;

use super::batcher::{ImageBatch, ImageBatcher};
use super::dataset::Sample;
use crate::error::{Error, Result};

/// Batches each worker may assemble ahead of the consumer.
const PREFETCH_DEPTH: usize = 2;

/// Sample order of a pass.
pub enum BatchOrder {
    /// Fresh random permutation on every pass.
    Shuffled(StdRng),
    /// Original dataset order.
    Sequential,
}

impl BatchOrder {
    pub fn shuffled(seed: u64) -> Self {
        BatchOrder::Shuffled(StdRng::seed_from_u64(seed))
    }
}

/// Groups a dataset into batches, optionally assembling them on a worker
/// pool ahead of the consumer.
///
/// Unlike burn's multi-worker `DataLoader`, batches always come out in plan
/// order, and a sample that fails to load ends the pass with an error.
pub struct BatchIterator {
    source: Arc<dyn Dataset<Sample>>,
    batch_size: usize,
    order: BatchOrder,
    num_workers: usize,
}

impl BatchIterator {
    pub fn new(
        source: Arc<dyn Dataset<Sample>>,
        batch_size: usize,
        order: BatchOrder,
        num_workers: usize,
    ) -> Self {
        assert!(batch_size > 0, "batch_size must be > 0");
        Self {
            source,
            batch_size,
            order,
            num_workers,
        }
    }

    pub fn dataset_len(&self) -> usize {
        self.source.len()
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// `ceil(M / B)`; the last batch may be short.
    pub fn num_batches(&self) -> usize {
        self.source.len().div_ceil(self.batch_size)
    }

    /// Starts one pass over the dataset. Batches come out in order.
    pub fn pass(&mut self) -> BatchPass {
        let mut indices: Vec<usize> = (0..self.source.len()).collect();
        if let BatchOrder::Shuffled(rng) = &mut self.order {
            indices.shuffle(rng);
        }
        let plan: Vec<Vec<usize>> = indices.chunks(self.batch_size).map(<[usize]>::to_vec).collect();

        let workers = self.num_workers.min(plan.len());
        if workers == 0 {
            return BatchPass {
                fetch: Fetch::Inline {
                    source: Arc::clone(&self.source),
                    plan: plan.into_iter(),
                },
                failed: false,
            };
        }

        debug!("Starting {} batch workers for {} batches", workers, plan.len());
        let total = plan.len();
        let plan = Arc::new(plan);
        let mut receivers = Vec::with_capacity(workers);
        let mut handles = Vec::with_capacity(workers);

        for worker in 0..workers {
            let (tx, rx) = sync_channel(PREFETCH_DEPTH);
            let source = Arc::clone(&self.source);
            let plan = Arc::clone(&plan);

            handles.push(thread::spawn(move || {
                for batch_indices in plan.iter().skip(worker).step_by(workers) {
                    let batch = load_batch(source.as_ref(), batch_indices);
                    let failed = batch.is_err();
                    if tx.send(batch).is_err() || failed {
                        return;
                    }
                }
            }));
            receivers.push(rx);
        }

        BatchPass {
            fetch: Fetch::Workers {
                receivers,
                handles,
                next: 0,
                total,
            },
            failed: false,
        }
    }
}

fn load_batch(source: &dyn Dataset<Sample>, indices: &[usize]) -> Result<ImageBatch> {
    let samples = indices
        .iter()
        .map(|&index| {
            source.get(index).ok_or_else(|| {
                Error::data(
                    PathBuf::new(),
                    format!("sample {} of {} could not be loaded", index, source.len()),
                )
            })
        })
        .collect::<Result<Vec<_>>>()?;
    // Batches are host-side, so the batcher runs against the CPU backend.
    <ImageBatcher as Batcher<NdArray<f32>, Sample, Result<ImageBatch>>>::batch(
        &ImageBatcher,
        samples,
        &NdArrayDevice::Cpu,
    )
}

enum Fetch {
    Inline {
        source: Arc<dyn Dataset<Sample>>,
        plan: std::vec::IntoIter<Vec<usize>>,
    },
    Workers {
        receivers: Vec<Receiver<Result<ImageBatch>>>,
        handles: Vec<JoinHandle<()>>,
        next: usize,
        total: usize,
    },
}

/// One in-order pass over the batches. Iteration stops after the first
/// error; dropping the pass early shuts the workers down.
pub struct BatchPass {
    fetch: Fetch,
    failed: bool,
}

impl Iterator for BatchPass {
    type Item = Result<ImageBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }

        let item = match &mut self.fetch {
            Fetch::Inline { source, plan } => {
                let indices = plan.next()?;
                load_batch(source.as_ref(), &indices)
            }
            Fetch::Workers {
                receivers,
                next,
                total,
                ..
            } => {
                if *next >= *total {
                    return None;
                }
                let rx = &receivers[*next % receivers.len()];
                *next += 1;
                rx.recv().unwrap_or_else(|_| {
                    Err(Error::data(PathBuf::new(), "batch worker exited unexpectedly"))
                })
            }
        };

        self.failed = item.is_err();
        Some(item)
    }
}

impl Drop for BatchPass {
    fn drop(&mut self) {
        if let Fetch::Workers {
            receivers, handles, ..
        } = &mut self.fetch
        {
            // Closing the channels unblocks workers waiting on a full queue.
            receivers.clear();
            for handle in handles.drain(..) {
                let _ = handle.join();
            }
        }
    }
}
