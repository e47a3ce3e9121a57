use machine_learning::{
    arch::{Mode, Model},
    dataset::BatchSource,
    metrics::{EpochAccumulator, EpochMetrics, argmax_classes},
};

use crate::Result;

/// Scores `model` over every batch of `source` without training it.
///
/// The predicted class of every pixel is the highest scoring one. Every sample is scored on its
/// own, then the per-class IoUs are averaged over the samples where they are defined and the
/// pixel accuracies over every sample.
pub fn evaluate<M, S>(model: &mut M, source: &mut S, n_class: usize) -> Result<EpochMetrics>
where
    M: Model + ?Sized,
    S: BatchSource + ?Sized,
{
    let mut acc = EpochAccumulator::new(n_class);

    for batch in source.batches() {
        let batch = batch?;
        let scores = model.forward(batch.x.view(), Mode::Eval)?;
        let pred = argmax_classes(scores.view());

        acc.add_batch(pred.view(), batch.l.view())?;
    }

    Ok(acc.finish())
}
