use ndarray::{Array2, Array3, Array4, Axis, stack};

use crate::{MlErr, Result};

/// A single preprocessed example.
#[derive(Debug, Clone)]
pub struct Sample {
    /// Normalized image shaped (3, H, W).
    pub x: Array3<f32>,
    /// One-hot target shaped (n_class, H, W).
    pub y: Array3<f32>,
    /// Class index of every pixel shaped (H, W).
    pub l: Array2<usize>,
}

/// A batch of examples stacked along a leading axis.
#[derive(Debug, Clone)]
pub struct Batch {
    /// Images shaped (N, 3, H, W).
    pub x: Array4<f32>,
    /// One-hot targets shaped (N, n_class, H, W).
    pub y: Array4<f32>,
    /// Class indices shaped (N, H, W).
    pub l: Array3<usize>,
}

impl Batch {
    /// Stacks samples of the same size into a batch.
    pub fn stack(samples: &[Sample]) -> Result<Self> {
        if samples.is_empty() {
            return Err(MlErr::EmptyDataset("can't stack an empty batch".into()));
        }

        let xs: Vec<_> = samples.iter().map(|s| s.x.view()).collect();
        let ys: Vec<_> = samples.iter().map(|s| s.y.view()).collect();
        let ls: Vec<_> = samples.iter().map(|s| s.l.view()).collect();

        Ok(Self {
            x: stack(Axis(0), &xs)?,
            y: stack(Axis(0), &ys)?,
            l: stack(Axis(0), &ls)?,
        })
    }

    /// Returns the amount of examples in the batch.
    pub fn len(&self) -> usize {
        self.x.len_of(Axis(0))
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Something that yields the batches of a dataset, one pass at a time.
pub trait BatchSource {
    /// Returns the amount of batches in a pass.
    fn num_batches(&self) -> usize;

    /// Starts a new pass over the data.
    fn batches(&mut self) -> impl Iterator<Item = Result<Batch>> + '_;
}

impl BatchSource for Vec<Batch> {
    fn num_batches(&self) -> usize {
        self.len()
    }

    fn batches(&mut self) -> impl Iterator<Item = Result<Batch>> + '_ {
        self.iter().cloned().map(Ok)
    }
}
