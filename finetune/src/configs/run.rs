use std::{
    fs::File,
    io::BufReader,
    path::{Path, PathBuf},
};

use machine_learning::{arch::VggConfig, quantization::QuantSettings};
use serde::Deserialize;

use super::{DataConfig, OptimizerConfig, ScheduleConfig};
use crate::{FinetuneErr, Result};

/// Everything a fine-tuning run needs. Immutable once the run starts.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub n_class: usize,
    pub batch_size: usize,
    pub epochs: usize,
    pub lr: f32,
    pub momentum: f32,
    pub w_decay: f32,
    pub step_size: usize,
    pub gamma: f32,
    pub optimizer: OptimizerConfig,
    pub schedule: ScheduleConfig,
    pub quant: QuantSettings,
    /// VGG preset of the backbone: `vgg11`, `vgg13`, `vgg16` or `vgg19`.
    pub backbone: String,
    pub data: DataConfig,
    /// The pretrained snapshot to start from.
    pub checkpoint: Option<PathBuf>,
    pub model_dir: PathBuf,
    pub score_root: PathBuf,
    /// Seed of the weight initialization and of the data loaders.
    pub seed: u64,
    /// Size of the thread pool, all cores if unset.
    pub threads: Option<usize>,
    /// Log the training loss every this many iterations.
    pub log_every: usize,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            n_class: 32,
            batch_size: 6,
            epochs: 500,
            lr: 1e-4,
            momentum: 0.,
            w_decay: 1e-5,
            step_size: 50,
            gamma: 0.5,
            optimizer: OptimizerConfig::default(),
            schedule: ScheduleConfig::default(),
            quant: QuantSettings::default(),
            backbone: "vgg16".to_string(),
            data: DataConfig::default(),
            checkpoint: Some(PathBuf::from("models/train_best.safetensors")),
            model_dir: PathBuf::from("models"),
            score_root: PathBuf::from("scores"),
            seed: 0,
            threads: None,
            log_every: 10,
        }
    }
}

impl RunConfig {
    /// Reads a JSON config file, every missing field takes its default value.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let reader = BufReader::new(File::open(path)?);
        Ok(serde_json::from_reader(reader)?)
    }

    /// Checks the config before the run starts.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| -> Result<()> { Err(FinetuneErr::InvalidConfig(msg)) };

        for (name, value) in [
            ("n_class", self.n_class),
            ("batch_size", self.batch_size),
            ("epochs", self.epochs),
            ("step_size", self.step_size),
            ("log_every", self.log_every),
            ("data.val_batch_size", self.data.val_batch_size),
        ] {
            if value == 0 {
                return invalid(format!("{name} must be positive"));
            }
        }

        if !(self.lr > 0.) {
            return invalid(format!("lr must be positive, got {}", self.lr));
        }

        if !(0. ..=1.).contains(&self.data.flip_rate) {
            return invalid(format!("flip_rate must be in [0, 1], got {}", self.data.flip_rate));
        }

        if let Some([h, w]) = self.data.crop {
            let unit = machine_learning::arch::DOWNSAMPLING;
            if h == 0 || w == 0 || h % unit != 0 || w % unit != 0 {
                return invalid(format!("crop {h}x{w} must be a positive multiple of {unit}"));
            }
        }

        if let ScheduleConfig::Cosine { t_max: 0, .. } = self.schedule {
            return invalid("the cosine schedule's t_max must be positive".to_string());
        }

        if self.vgg().is_none() {
            return invalid(format!("unknown backbone {}", self.backbone));
        }

        Ok(())
    }

    /// Returns the backbone layout, `None` if `backbone` isn't a known preset.
    pub fn vgg(&self) -> Option<VggConfig> {
        VggConfig::preset(&self.backbone)
    }

    /// The identifier of the run, derived from its hyperparameters.
    pub fn run_id(&self) -> String {
        format!(
            "FCNs-BCEWithLogits_batch{}_epoch{}_{}_scheduler-step{}-gamma{}_lr{}_momentum{}_w_decay{}",
            self.batch_size,
            self.epochs,
            self.optimizer.name(),
            self.step_size,
            self.gamma,
            self.lr,
            self.momentum,
            self.w_decay
        )
    }

    /// The directory the score arrays are written to.
    pub fn score_dir(&self) -> PathBuf {
        self.score_root.join(self.run_id())
    }

    /// The path the model snapshot is written to after every epoch.
    pub fn model_path(&self) -> PathBuf {
        self.model_dir.join(self.run_id())
    }
}
