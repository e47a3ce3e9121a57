use ndarray::{Array, ArrayView, Dimension, Zip};

use super::{LossFn, loss_fn::check_shapes};
use crate::Result;

/// Binary cross entropy over raw logits, averaged over every element.
///
/// Each element is treated as an independent binary classification, so one-hot segmentation
/// targets train every class channel separately. The loss is computed in its numerically stable
/// form `max(x, 0) - x * y + ln(1 + e^-|x|)`.
#[derive(Debug, Default, Clone, Copy)]
pub struct BceWithLogits;

impl BceWithLogits {
    pub fn new() -> Self {
        Self
    }
}

fn sigmoid(x: f32) -> f32 {
    1. / (1. + (-x).exp())
}

impl LossFn for BceWithLogits {
    fn loss<D: Dimension>(&self, y_pred: ArrayView<f32, D>, y: ArrayView<f32, D>) -> Result<f32> {
        check_shapes(&y_pred, &y)?;

        if y_pred.is_empty() {
            return Ok(0.);
        }

        let total = Zip::from(&y_pred)
            .and(&y)
            .fold(0f64, |acc, &x, &t| {
                acc + (x.max(0.) - x * t + (-x.abs()).exp().ln_1p()) as f64
            });

        Ok((total / y_pred.len() as f64) as f32)
    }

    fn loss_prime<D: Dimension>(
        &self,
        y_pred: ArrayView<f32, D>,
        y: ArrayView<f32, D>,
    ) -> Result<Array<f32, D>> {
        check_shapes(&y_pred, &y)?;

        let n = y_pred.len().max(1) as f32;
        Ok(Zip::from(&y_pred)
            .and(&y)
            .map_collect(|&x, &t| (sigmoid(x) - t) / n))
    }
}
