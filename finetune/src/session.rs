use std::path::PathBuf;

use log::info;
use machine_learning::{arch::Model, checkpoint, dataset::BatchSource};

use crate::{
    Result,
    evaluation::evaluate,
    scores::ScoreBoard,
    training::{Checkpointer, Evaluator},
};

/// The state shared by every evaluation of a run: the validation data and the score arrays.
#[derive(Debug)]
pub struct RunContext<V> {
    val: V,
    n_class: usize,
    scores: ScoreBoard,
}

impl<V: BatchSource> RunContext<V> {
    pub fn new(val: V, n_class: usize, scores: ScoreBoard) -> Self {
        Self {
            val,
            n_class,
            scores,
        }
    }

    pub fn scores(&self) -> &ScoreBoard {
        &self.scores
    }

    /// Evaluates `model` on the validation data, records the result as the scores of `epoch` and
    /// persists the score arrays.
    ///
    /// # Returns
    /// The mean IoU over the classes, `None` if no class was present at all.
    pub fn validate<M: Model + ?Sized>(
        &mut self,
        model: &mut M,
        epoch: usize,
    ) -> Result<Option<f32>> {
        let metrics = evaluate(model, &mut self.val, self.n_class)?;

        self.scores.record(epoch, &metrics)?;
        self.scores.persist()?;

        info!(
            "epoch{epoch}, pix_acc: {}, meanIoU: {}, IoUs: {:?}",
            fmt_score(metrics.pixel_accuracy),
            fmt_score(metrics.mean_iou),
            metrics.ious.iter().map(|&iou| fmt_score(iou)).collect::<Vec<_>>()
        );

        Ok(metrics.mean_iou)
    }
}

fn fmt_score(score: Option<f32>) -> String {
    score.map_or_else(|| "nan".to_string(), |s| s.to_string())
}

impl<M: Model + ?Sized, V: BatchSource> Evaluator<M> for RunContext<V> {
    fn evaluate(&mut self, model: &mut M, epoch: usize) -> Result<Option<f32>> {
        self.validate(model, epoch)
    }
}

/// Saves the model to a fixed path after every epoch, keeping only the latest snapshot.
#[derive(Debug, Clone)]
pub struct ModelSnapshot {
    path: PathBuf,
}

impl ModelSnapshot {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl<M: Model + ?Sized> Checkpointer<M> for ModelSnapshot {
    fn save(&mut self, model: &mut M, epoch: usize) -> Result<()> {
        checkpoint::save(model, &self.path)?;
        info!("epoch{epoch}, saved model to {}", self.path.display());
        Ok(())
    }
}
