use std::path::PathBuf;

use serde::Deserialize;

/// Where the dataset descriptors live and how samples are augmented.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    /// The directory holding the descriptors, relative descriptor paths are resolved against it.
    pub root_dir: PathBuf,
    pub train_file: PathBuf,
    pub val_file: PathBuf,
    /// (height, width) of the random crop applied to training samples.
    pub crop: Option<[usize; 2]>,
    /// Probability of flipping a training sample horizontally.
    pub flip_rate: f32,
    pub val_batch_size: usize,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from("CamVid"),
            train_file: PathBuf::from("train.csv"),
            val_file: PathBuf::from("val.csv"),
            crop: None,
            flip_rate: 0.5,
            val_batch_size: 1,
        }
    }
}

impl DataConfig {
    pub fn train_path(&self) -> PathBuf {
        self.root_dir.join(&self.train_file)
    }

    pub fn val_path(&self) -> PathBuf {
        self.root_dir.join(&self.val_file)
    }
}
