use ndarray::{Array, ArrayView, Dimension};

use crate::Result;

pub trait LossFn {
    /// Returns the mean loss of the predictions `y_pred` against the targets `y`.
    fn loss<D: Dimension>(&self, y_pred: ArrayView<f32, D>, y: ArrayView<f32, D>) -> Result<f32>;

    /// Returns the gradient of `loss` with respect to `y_pred`.
    fn loss_prime<D: Dimension>(
        &self,
        y_pred: ArrayView<f32, D>,
        y: ArrayView<f32, D>,
    ) -> Result<Array<f32, D>>;
}

/// Checks that the predictions and the targets have the same shape.
pub(super) fn check_shapes<D: Dimension>(
    y_pred: &ArrayView<f32, D>,
    y: &ArrayView<f32, D>,
) -> Result<()> {
    if y_pred.shape() != y.shape() {
        return Err(crate::MlErr::SizeMismatch {
            what: "loss targets",
            got: y.len(),
            expected: y_pred.len(),
        });
    }

    Ok(())
}
