use log::debug;
use rand::{Rng, SeedableRng, rngs::StdRng, seq::SliceRandom};
use rayon::prelude::*;

use super::{Batch, BatchSource, SegmentationDataset};
use crate::{MlErr, Result};

/// Splits a dataset into batches, loading the samples of every batch in parallel.
///
/// Every pass draws one seed per sample from the loader's generator, so the random crops, flips
/// and the shuffled order are reproducible for a given seed regardless of the thread count.
#[derive(Debug)]
pub struct DataLoader {
    dataset: SegmentationDataset,
    batch_size: usize,
    shuffle: bool,
    rng: StdRng,
    order: Vec<usize>,
    seeds: Vec<u64>,
}

impl DataLoader {
    /// Creates a new `DataLoader`.
    ///
    /// # Arguments
    /// * `dataset` - The dataset to load samples from.
    /// * `batch_size` - The amount of samples per batch, the last batch may be smaller.
    /// * `shuffle` - Whether to visit the samples in a different random order on every pass.
    /// * `seed` - The seed of the loader's random number generator.
    ///
    /// # Returns
    /// An error if the dataset is empty or `batch_size` is zero.
    pub fn new(
        dataset: SegmentationDataset,
        batch_size: usize,
        shuffle: bool,
        seed: u64,
    ) -> Result<Self> {
        if dataset.is_empty() {
            return Err(MlErr::EmptyDataset("the dataset has no samples".into()));
        }

        if batch_size == 0 {
            return Err(MlErr::InvalidInput("batch size must be positive".into()));
        }

        Ok(Self {
            order: (0..dataset.len()).collect(),
            seeds: Vec::new(),
            dataset,
            batch_size,
            shuffle,
            rng: StdRng::seed_from_u64(seed),
        })
    }

    fn load_batch(&self, positions: std::ops::Range<usize>) -> Result<Batch> {
        let samples = positions
            .into_par_iter()
            .map(|pos| {
                let mut rng = StdRng::seed_from_u64(self.seeds[pos]);
                self.dataset.load(self.order[pos], &mut rng)
            })
            .collect::<Result<Vec<_>>>()?;

        Batch::stack(&samples)
    }
}

impl BatchSource for DataLoader {
    fn num_batches(&self) -> usize {
        self.dataset.len().div_ceil(self.batch_size)
    }

    fn batches(&mut self) -> impl Iterator<Item = Result<Batch>> + '_ {
        if self.shuffle {
            self.order.shuffle(&mut self.rng);
        }

        let len = self.dataset.len();
        self.seeds = (0..len).map(|_| self.rng.random()).collect();
        debug!("starting a pass over {len} samples");

        let this = &*self;
        (0..len)
            .step_by(this.batch_size)
            .map(move |start| this.load_batch(start..(start + this.batch_size).min(len)))
    }
}
