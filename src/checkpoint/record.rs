use regex::Regex;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::config::RunConfig;
use crate::error::{Error, Result};
use crate::training::Learner;

const EXTENSION: &str = "mpk";

fn checkpoint_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^epoch-(\d+)(?:-([^/]+))?\.mpk$").expect("checkpoint pattern is valid")
    })
}

/// One parameter snapshot found on disk.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointEntry {
    pub path: PathBuf,
    pub epoch: usize,
    /// Absent for snapshots named only by epoch.
    pub val_loss: Option<f64>,
}

/// Persists and restores parameter snapshots named by epoch and
/// validation loss. Files are never deleted.
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    dir: PathBuf,
}

impl CheckpointManager {
    /// The directory is created on the first save, not here.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// `epoch-{epoch}-{val_loss:.6}.mpk`
    pub fn file_name(epoch: usize, val_loss: f64) -> String {
        format!("epoch-{}-{:.6}.{}", epoch, val_loss, EXTENSION)
    }

    pub fn save<L: Learner + ?Sized>(&self, learner: &L, epoch: usize, val_loss: f64) -> Result<PathBuf> {
        fs::create_dir_all(&self.dir)?;

        let path = self.dir.join(Self::file_name(epoch, val_loss));
        learner.save(&path)?;
        info!("Checkpoint saved: {:?}", path);

        Ok(path)
    }

    /// Snapshot for `epoch`: `epoch-{epoch}.mpk` if present, otherwise the
    /// lowest-loss `epoch-{epoch}-{loss}.mpk`.
    pub fn resolve(&self, epoch: usize) -> Result<PathBuf> {
        let exact = self.dir.join(format!("epoch-{}.{}", epoch, EXTENSION));
        if exact.is_file() {
            return Ok(exact);
        }

        self.list()?
            .into_iter()
            .filter(|entry| entry.epoch == epoch)
            .filter_map(|entry| entry.val_loss.map(|loss| (loss, entry.path)))
            .min_by(|a, b| a.0.total_cmp(&b.0))
            .map(|(_, path)| path)
            .ok_or(Error::CheckpointNotFound { path: exact })
    }

    /// Restores the snapshot for `epoch` into `learner`.
    pub fn load<L: Learner + ?Sized>(&self, learner: &mut L, epoch: usize) -> Result<PathBuf> {
        let path = self.resolve(epoch)?;
        learner.load(&path)?;
        info!("Successfully loaded model {:?}", path);
        Ok(path)
    }

    /// All snapshots in the directory, sorted by epoch then loss.
    pub fn list(&self) -> Result<Vec<CheckpointEntry>> {
        if !self.dir.exists() {
            warn!("Checkpoint directory does not exist: {:?}", self.dir);
            return Ok(Vec::new());
        }

        let mut checkpoints = Vec::new();

        for entry in WalkDir::new(&self.dir)
            .max_depth(1)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
        {
            let name = entry.file_name().to_string_lossy();
            let Some(caps) = checkpoint_pattern().captures(&name) else {
                continue;
            };
            let Ok(epoch) = caps[1].parse::<usize>() else {
                continue;
            };
            let val_loss = match caps.get(2) {
                Some(loss) => match loss.as_str().parse::<f64>() {
                    Ok(loss) => Some(loss),
                    Err(_) => continue,
                },
                None => None,
            };

            checkpoints.push(CheckpointEntry {
                path: entry.path().to_path_buf(),
                epoch,
                val_loss,
            });
        }

        checkpoints.sort_by(|a, b| {
            a.epoch.cmp(&b.epoch).then_with(|| {
                a.val_loss
                    .unwrap_or(f64::NEG_INFINITY)
                    .total_cmp(&b.val_loss.unwrap_or(f64::NEG_INFINITY))
            })
        });

        Ok(checkpoints)
    }

    /// Writes the run configuration next to the snapshots.
    pub fn save_config(&self, config: &RunConfig) -> Result<PathBuf> {
        fs::create_dir_all(&self.dir)?;
        let path = self.dir.join("run_config.json");
        fs::write(&path, serde_json::to_string_pretty(config)?)?;
        Ok(path)
    }
}
