use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

use crate::error::{Error, Result};
use crate::inference::SCORE_RANKS;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    pub img_path: PathBuf,
    pub train_csv_file: PathBuf,
    pub val_csv_file: PathBuf,
    pub test_csv_file: PathBuf,
    pub train_batch_size: usize,
    pub val_batch_size: usize,
    pub test_batch_size: usize,
    pub num_workers: usize,
    /// Shorter image side after resizing.
    pub resize: u32,
    /// Side of the square crop fed to the network.
    pub crop: u32,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            img_path: PathBuf::from("./data/images"),
            train_csv_file: PathBuf::from("./data/2_style_binary_train.csv"),
            val_csv_file: PathBuf::from("./data/2_style_binary_val.csv"),
            test_csv_file: PathBuf::from("./data/2_style_binary_val.csv"),
            train_batch_size: 156,
            val_batch_size: 100,
            test_batch_size: 1,
            num_workers: 2,
            resize: 256,
            crop: 224,
        }
    }
}

impl DataConfig {
    pub fn validate(&self) -> Result<()> {
        for (name, size) in [
            ("train_batch_size", self.train_batch_size),
            ("val_batch_size", self.val_batch_size),
            ("test_batch_size", self.test_batch_size),
        ] {
            if size == 0 {
                return Err(Error::Config(format!("{} must be > 0", name)));
            }
        }
        if self.crop == 0 {
            return Err(Error::Config("crop must be > 0".to_string()));
        }
        if self.crop > self.resize {
            return Err(Error::Config(format!(
                "crop ({}) must not exceed resize ({})",
                self.crop, self.resize
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    pub epochs: usize,
    pub learning_rate: f64,
    pub momentum: f64,
    pub early_stopping_patience: usize,
    pub warm_start: bool,
    pub warm_start_epoch: usize,
    pub ckpt_path: PathBuf,
    pub metrics_dir: PathBuf,
    pub num_classes: usize,
    pub seed: u64,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            epochs: 1,
            learning_rate: 1e-3,
            momentum: 0.9,
            early_stopping_patience: 10,
            warm_start: false,
            warm_start_epoch: 0,
            ckpt_path: PathBuf::from("./checkpoint/2"),
            metrics_dir: PathBuf::from("runs"),
            num_classes: 2,
            seed: 42,
        }
    }
}

impl TrainingConfig {
    pub fn validate(&self) -> Result<()> {
        if self.epochs == 0 {
            return Err(Error::Config("epochs must be >= 1".to_string()));
        }
        if self.early_stopping_patience == 0 {
            return Err(Error::Config(
                "early_stopping_patience must be >= 1".to_string(),
            ));
        }
        if !(self.learning_rate > 0.0) {
            return Err(Error::Config("learning_rate must be > 0".to_string()));
        }
        if !(0.0..1.0).contains(&self.momentum) {
            return Err(Error::Config("momentum must be within [0,1)".to_string()));
        }
        if self.num_classes < 2 {
            return Err(Error::Config("num_classes must be >= 2".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub multi_gpu: bool,
    pub gpu_ids: Vec<usize>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            multi_gpu: false,
            gpu_ids: vec![0, 1],
        }
    }
}

/// Fully typed run configuration, validated once before any work starts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub train: bool,
    pub test: bool,
    /// Kept for command-line compatibility; loss curves go to the metrics sink.
    pub save_fig: bool,
    pub predictions_out: Option<PathBuf>,
    pub data: DataConfig,
    pub training: TrainingConfig,
    pub device: DeviceConfig,
}

impl RunConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.train && !self.test {
            return Err(Error::Config(
                "nothing to do: pass --train and/or --test".to_string(),
            ));
        }
        self.data.validate()?;
        self.training.validate()?;

        if self.train {
            for (name, path) in [
                ("train_csv_file", &self.data.train_csv_file),
                ("val_csv_file", &self.data.val_csv_file),
            ] {
                if path.as_os_str().is_empty() {
                    return Err(Error::Config(format!("{} is required for --train", name)));
                }
            }
        }
        if self.test {
            if self.data.test_csv_file.as_os_str().is_empty() {
                return Err(Error::Config("test_csv_file is required for --test".to_string()));
            }
            if self.training.num_classes != SCORE_RANKS {
                return Err(Error::Config(format!(
                    "--test reads {} score ranks per image, but num_classes is {}",
                    SCORE_RANKS, self.training.num_classes
                )));
            }
        }
        if self.device.multi_gpu && self.device.gpu_ids.is_empty() {
            return Err(Error::Config("multi_gpu requires at least one gpu id".to_string()));
        }
        Ok(())
    }
}

impl fmt::Display for RunConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn train_config() -> RunConfig {
        RunConfig {
            train: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_default_needs_a_mode() {
        let err = RunConfig::default().validate().unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_train_config_validates() {
        assert!(train_config().validate().is_ok());
    }

    #[test]
    fn test_crop_larger_than_resize_rejected() {
        let mut config = train_config();
        config.data.crop = 300;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_warm_start_past_last_epoch_is_valid() {
        // The missing snapshot is reported by the checkpoint load, not here.
        let mut config = train_config();
        config.training.warm_start = true;
        config.training.warm_start_epoch = 5;
        assert_eq!(config.training.epochs, 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_test_mode_needs_ten_score_ranks() {
        let mut config = RunConfig {
            test: true,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        config.training.num_classes = 10;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_patience_rejected() {
        let mut config = train_config();
        config.training.early_stopping_patience = 0;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_json_roundtrip_with_defaults() {
        let config: RunConfig =
            serde_json::from_str(r#"{"train": true, "training": {"epochs": 3}}"#).unwrap();
        assert_eq!(config.training.epochs, 3);
        assert_eq!(config.training.early_stopping_patience, 10);
        assert_eq!(config.data.train_batch_size, 156);
    }
}
