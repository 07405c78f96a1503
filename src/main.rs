use anyhow::{Context, Result};
use burn::backend::Autodiff;
use burn::data::dataset::Dataset;
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use aesthetic_style::checkpoint::CheckpointManager;
use aesthetic_style::config::{DataConfig, DeviceConfig, RunConfig, TrainingConfig};
use aesthetic_style::data::{BatchIterator, BatchOrder, ImageCsvDataset, ImageTransform, Sample};
use aesthetic_style::inference::{run_test, write_predictions};
use aesthetic_style::model::{DeviceStrategy, StyleNet, StyleNetConfig};
use aesthetic_style::training::{
    momentum_sgd, Evaluator, FanoutSink, JsonlSink, Learner, Schedule, StyleLearner, TracingSink,
    TrainingLoop,
};

#[cfg(feature = "wgpu-backend")]
type Inner = burn_wgpu::Wgpu;

#[cfg(all(feature = "tch-backend", not(feature = "wgpu-backend")))]
type Inner = burn_tch::LibTorch<f32>;

#[cfg(not(any(feature = "wgpu-backend", feature = "tch-backend")))]
type Inner = burn_ndarray::NdArray<f32>;

type Backend = Autodiff<Inner>;
type Device = <Backend as burn::tensor::backend::Backend>::Device;

#[derive(Debug, Parser)]
#[command(author, version, about = "Image style classifier training CLI")]
struct Cli {
    /// Root directory of the image files
    #[arg(long, default_value = "./data/images")]
    img_path: PathBuf,
    #[arg(long, default_value = "./data/2_style_binary_train.csv")]
    train_csv_file: PathBuf,
    #[arg(long, default_value = "./data/2_style_binary_val.csv")]
    val_csv_file: PathBuf,
    #[arg(long, default_value = "./data/2_style_binary_val.csv")]
    test_csv_file: PathBuf,

    /// Run the training loop
    #[arg(long)]
    train: bool,
    /// Predict score distributions on the test split
    #[arg(long)]
    test: bool,

    #[arg(long, default_value_t = 156)]
    train_batch_size: usize,
    #[arg(long, default_value_t = 100)]
    val_batch_size: usize,
    #[arg(long, default_value_t = 1)]
    test_batch_size: usize,
    /// Background batch loaders; 0 loads on the main thread
    #[arg(long, default_value_t = 2)]
    num_workers: usize,
    #[arg(long, default_value_t = 1)]
    epochs: usize,
    #[arg(long, default_value = "./checkpoint/2")]
    ckpt_path: PathBuf,

    /// Split each batch across the devices in --gpu-ids
    #[arg(long)]
    multi_gpu: bool,
    #[arg(long, value_delimiter = ',', default_value = "0,1")]
    gpu_ids: Vec<usize>,

    /// Restore the snapshot of --warm-start-epoch before running
    #[arg(long)]
    warm_start: bool,
    #[arg(long, default_value_t = 0)]
    warm_start_epoch: usize,
    #[arg(long, default_value_t = 10)]
    early_stopping_patience: usize,
    /// Accepted for compatibility; loss curves are written to --metrics-dir
    #[arg(long)]
    save_fig: bool,

    #[arg(long, default_value_t = 2)]
    num_classes: usize,
    #[arg(long, default_value_t = 1e-3)]
    learning_rate: f64,
    #[arg(long, default_value_t = 0.9)]
    momentum: f64,
    /// Shorter image side after resizing
    #[arg(long, default_value_t = 256)]
    resize: u32,
    /// Side of the square crop fed to the network
    #[arg(long, default_value_t = 224)]
    crop: u32,
    #[arg(long, default_value = "runs")]
    metrics_dir: PathBuf,
    /// Seed of the training shuffle
    #[arg(long, default_value_t = 42)]
    seed: u64,
    /// Write test predictions as CSV
    #[arg(long)]
    predictions_out: Option<PathBuf>,
}

impl Cli {
    fn into_config(self) -> RunConfig {
        RunConfig {
            train: self.train,
            test: self.test,
            save_fig: self.save_fig,
            predictions_out: self.predictions_out,
            data: DataConfig {
                img_path: self.img_path,
                train_csv_file: self.train_csv_file,
                val_csv_file: self.val_csv_file,
                test_csv_file: self.test_csv_file,
                train_batch_size: self.train_batch_size,
                val_batch_size: self.val_batch_size,
                test_batch_size: self.test_batch_size,
                num_workers: self.num_workers,
                resize: self.resize,
                crop: self.crop,
            },
            training: TrainingConfig {
                epochs: self.epochs,
                learning_rate: self.learning_rate,
                momentum: self.momentum,
                early_stopping_patience: self.early_stopping_patience,
                warm_start: self.warm_start,
                warm_start_epoch: self.warm_start_epoch,
                ckpt_path: self.ckpt_path,
                metrics_dir: self.metrics_dir,
                num_classes: self.num_classes,
                seed: self.seed,
            },
            device: DeviceConfig {
                multi_gpu: self.multi_gpu,
                gpu_ids: self.gpu_ids,
            },
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Cli::parse().into_config();
    config.validate().context("Invalid configuration")?;
    info!("Configuration: {}", config);

    if config.save_fig {
        warn!("--save-fig has no effect; loss curves are written to {:?}", config.training.metrics_dir);
    }

    let strategy = device_strategy(&config.device)?;
    let model_config = StyleNetConfig {
        num_classes: config.training.num_classes,
        ..Default::default()
    };
    let model = StyleNet::<Backend>::new(&model_config, strategy.primary())
        .context("Failed to build model")?;
    let mut learner = StyleLearner::new(
        model,
        momentum_sgd::<Backend>(config.training.momentum),
        strategy,
        config.training.num_classes,
        config.training.learning_rate,
    );
    info!("Trainable params: {:.2} million", learner.num_params() as f64 / 1e6);

    if config.train {
        learner = train_command(&config, learner)?;
    } else if config.training.warm_start {
        CheckpointManager::new(&config.training.ckpt_path)
            .load(&mut learner, config.training.warm_start_epoch)
            .context("Failed to warm start")?;
    }

    if config.test {
        test_command(&config, &learner)?;
    }

    Ok(())
}

fn device_strategy(config: &DeviceConfig) -> Result<DeviceStrategy<Device>> {
    if !config.multi_gpu {
        return Ok(DeviceStrategy::SingleDevice(device_for(None)));
    }

    let devices = config.gpu_ids.iter().map(|&id| device_for(Some(id))).collect();
    let strategy = DeviceStrategy::data_parallel(devices).context("No devices for --multi-gpu")?;
    info!("Data parallel over {} devices", strategy.devices().len());
    Ok(strategy)
}

#[cfg(feature = "wgpu-backend")]
fn device_for(id: Option<usize>) -> Device {
    match id {
        Some(id) => burn_wgpu::WgpuDevice::DiscreteGpu(id),
        None => burn_wgpu::WgpuDevice::default(),
    }
}

#[cfg(all(feature = "tch-backend", not(feature = "wgpu-backend")))]
fn device_for(id: Option<usize>) -> Device {
    burn_tch::LibTorchDevice::Cuda(id.unwrap_or(0))
}

#[cfg(not(any(feature = "wgpu-backend", feature = "tch-backend")))]
fn device_for(id: Option<usize>) -> Device {
    if let Some(id) = id {
        warn!("CPU backend: gpu id {} maps to a host replica", id);
    }
    burn_ndarray::NdArrayDevice::Cpu
}

fn dataset(csv: &Path, config: &DataConfig, transform: ImageTransform) -> Result<Arc<dyn Dataset<Sample>>> {
    let dataset = ImageCsvDataset::from_csv(csv, &config.img_path, transform)
        .with_context(|| format!("Failed to load dataset {:?}", csv))?;
    Ok(Arc::new(dataset))
}

fn train_command<L: Learner>(config: &RunConfig, learner: L) -> Result<L> {
    let data = &config.data;
    let train_set = dataset(&data.train_csv_file, data, ImageTransform::train(data.resize, data.crop))?;
    let val_set = dataset(&data.val_csv_file, data, ImageTransform::validation(data.resize, data.crop))?;

    let train = BatchIterator::new(
        train_set,
        data.train_batch_size,
        BatchOrder::shuffled(config.training.seed),
        data.num_workers,
    );
    let evaluator = Evaluator::new(BatchIterator::new(
        val_set,
        data.val_batch_size,
        BatchOrder::Sequential,
        data.num_workers,
    ));

    let checkpoints = CheckpointManager::new(&config.training.ckpt_path);
    let saved = checkpoints.save_config(config).context("Failed to save run config")?;
    info!("Run configuration saved to {:?}", saved);

    let sink = FanoutSink::new()
        .with(TracingSink)
        .with(JsonlSink::create(&config.training.metrics_dir).context("Failed to open metrics sink")?);

    let mut training = TrainingLoop::new(
        learner,
        train,
        evaluator,
        checkpoints,
        sink,
        Schedule::from_config(&config.training),
    );
    let summary = training.run().context("Training failed")?;
    info!(
        "Stopped after {} epochs ({:?}), best val loss {:.4}, {} checkpoints written",
        summary.epochs_run,
        summary.stop_reason,
        summary.best_val_loss,
        summary.checkpoints.len()
    );

    Ok(training.into_learner())
}

fn test_command<L: Learner>(config: &RunConfig, learner: &L) -> Result<()> {
    let data = &config.data;
    let test_set = dataset(&data.test_csv_file, data, ImageTransform::validation(data.resize, data.crop))?;
    let mut batches = BatchIterator::new(
        test_set,
        data.test_batch_size,
        BatchOrder::Sequential,
        data.num_workers,
    );

    let predictions = run_test(learner, &mut batches).context("Test pass failed")?;
    for p in &predictions {
        info!("Image {}: predicted mean {:.4}, std {:.4}", p.index, p.mean, p.std);
    }

    if let Some(path) = &config.predictions_out {
        write_predictions(path, &predictions)
            .with_context(|| format!("Failed to write predictions to {:?}", path))?;
    }
    Ok(())
}
