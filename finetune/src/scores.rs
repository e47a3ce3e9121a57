use std::{
    fs,
    path::{Path, PathBuf},
};

use log::debug;
use machine_learning::metrics::{EpochMetrics, or_nan};
use ndarray::{Array1, Array2};

use crate::{FinetuneErr, Result};

pub const IOU_FILE: &str = "meanIU.json";
pub const PIXEL_FILE: &str = "meanPixel.json";

/// The per-epoch scores of a run: per-class IoU (`epochs x n_class`) and pixel accuracy
/// (`epochs`). Undefined scores are NaN in memory and `null` on disk.
#[derive(Debug, Clone)]
pub struct ScoreBoard {
    dir: PathBuf,
    iou: Array2<f32>,
    pixel: Array1<f32>,
}

impl ScoreBoard {
    /// Creates zeroed score arrays that get persisted into `dir`.
    pub fn new<P: AsRef<Path>>(dir: P, epochs: usize, n_class: usize) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            iou: Array2::zeros((epochs, n_class)),
            pixel: Array1::zeros(epochs),
        }
    }

    pub fn iou(&self) -> &Array2<f32> {
        &self.iou
    }

    pub fn pixel(&self) -> &Array1<f32> {
        &self.pixel
    }

    /// Overwrites the scores of `epoch`.
    ///
    /// # Returns
    /// An error if `epoch` is out of the arrays' range or the amount of classes doesn't match.
    pub fn record(&mut self, epoch: usize, metrics: &EpochMetrics) -> Result<()> {
        let (epochs, n_class) = self.iou.dim();

        if epoch >= epochs {
            return Err(FinetuneErr::ScoreOutOfRange { epoch, epochs });
        }

        if metrics.ious.len() != n_class {
            return Err(machine_learning::MlErr::SizeMismatch {
                what: "class scores",
                got: metrics.ious.len(),
                expected: n_class,
            }
            .into());
        }

        for (score, &iou) in self.iou.row_mut(epoch).iter_mut().zip(&metrics.ious) {
            *score = or_nan(iou);
        }
        self.pixel[epoch] = or_nan(metrics.pixel_accuracy);

        Ok(())
    }

    /// Writes both arrays to their files, overwriting the previous contents.
    pub fn persist(&self) -> Result<()> {
        fs::create_dir_all(&self.dir)?;

        let iou: Vec<Vec<Option<f32>>> = self
            .iou
            .rows()
            .into_iter()
            .map(|row| row.iter().map(|&v| defined(v)).collect())
            .collect();
        let pixel: Vec<Option<f32>> = self.pixel.iter().map(|&v| defined(v)).collect();

        fs::write(self.dir.join(IOU_FILE), serde_json::to_vec(&iou)?)?;
        fs::write(self.dir.join(PIXEL_FILE), serde_json::to_vec(&pixel)?)?;

        debug!("persisted scores to {}", self.dir.display());
        Ok(())
    }
}

fn defined(v: f32) -> Option<f32> {
    (!v.is_nan()).then_some(v)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics(ious: Vec<Option<f32>>, acc: f32) -> EpochMetrics {
        EpochMetrics {
            mean_iou: machine_learning::metrics::nan_mean(ious.iter().copied()),
            ious,
            pixel_accuracy: Some(acc),
        }
    }

    #[test]
    fn records_rows_and_persists_nan_as_null() {
        let dir = tempfile::tempdir().unwrap();
        let mut scores = ScoreBoard::new(dir.path(), 2, 3);

        scores.record(1, &metrics(vec![Some(1.), None, Some(0.5)], 0.75)).unwrap();
        scores.persist().unwrap();

        assert_eq!(scores.iou()[[0, 0]], 0.);
        assert!(scores.iou()[[1, 1]].is_nan());
        assert_eq!(scores.pixel()[1], 0.75);

        let iou: Vec<Vec<Option<f32>>> =
            serde_json::from_slice(&fs::read(dir.path().join(IOU_FILE)).unwrap()).unwrap();
        assert_eq!(iou, [vec![Some(0.), Some(0.), Some(0.)], vec![Some(1.), None, Some(0.5)]]);

        let pixel: Vec<Option<f32>> =
            serde_json::from_slice(&fs::read(dir.path().join(PIXEL_FILE)).unwrap()).unwrap();
        assert_eq!(pixel, [Some(0.), Some(0.75)]);
    }

    #[test]
    fn recording_twice_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let mut scores = ScoreBoard::new(dir.path(), 1, 1);

        scores.record(0, &metrics(vec![Some(0.2)], 0.1)).unwrap();
        scores.record(0, &metrics(vec![Some(0.4)], 0.3)).unwrap();

        assert_eq!(scores.iou()[[0, 0]], 0.4);
        assert_eq!(scores.pixel()[0], 0.3);
    }

    #[test]
    fn epochs_out_of_range_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut scores = ScoreBoard::new(dir.path(), 2, 1);

        assert!(matches!(
            scores.record(2, &metrics(vec![Some(1.)], 1.)),
            Err(FinetuneErr::ScoreOutOfRange { epoch: 2, epochs: 2 })
        ));
        assert!(scores.record(0, &metrics(vec![Some(1.), None], 1.)).is_err());
    }
}
