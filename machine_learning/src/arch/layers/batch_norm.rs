use ndarray::{Array1, Array2, Array4, ArrayView1, ArrayView4, Axis, Zip};

use super::im2col;
use crate::{
    MlErr, Result,
    arch::{Buffer, Mode, Param, StateMut},
};

const EPS: f32 = 1e-5;
const MOMENTUM: f32 = 0.1;

#[derive(Debug, Clone)]
struct Forward {
    x_hat: Array2<f32>,
    inv_std: Array1<f32>,
    input_dim: (usize, usize, usize, usize),
}

/// Per-channel batch normalization over (N, C, H, W) inputs.
///
/// In training mode the batch statistics normalize the input and update the running
/// statistics; in evaluation mode the running statistics are used instead.
#[derive(Debug, Clone)]
pub struct BatchNorm2d {
    channels: usize,
    weight: Param,
    bias: Param,
    running_mean: Buffer,
    running_var: Buffer,

    fwd: Option<Forward>,
}

impl BatchNorm2d {
    pub fn new(channels: usize) -> Self {
        Self {
            channels,
            weight: Param::full(&[channels], 1.),
            bias: Param::full(&[channels], 0.),
            running_mean: Buffer::full(&[channels], 0.),
            running_var: Buffer::full(&[channels], 1.),
            fwd: None,
        }
    }

    pub fn weight_mut(&mut self) -> &mut Param {
        &mut self.weight
    }

    pub fn bias_mut(&mut self) -> &mut Param {
        &mut self.bias
    }

    pub fn params_mut(&mut self) -> (&mut Param, &mut Param) {
        (&mut self.weight, &mut self.bias)
    }

    /// Returns the affine parameters followed by the running statistics.
    pub fn state_mut(&mut self) -> (StateMut<'_>, StateMut<'_>, StateMut<'_>, StateMut<'_>) {
        (
            self.weight.state_mut(),
            self.bias.state_mut(),
            self.running_mean.state_mut(),
            self.running_var.state_mut(),
        )
    }

    pub fn running_mean(&self) -> &Buffer {
        &self.running_mean
    }

    pub fn running_mean_mut(&mut self) -> &mut Buffer {
        &mut self.running_mean
    }

    pub fn running_var(&self) -> &Buffer {
        &self.running_var
    }

    pub fn running_var_mut(&mut self) -> &mut Buffer {
        &mut self.running_var
    }

    pub fn forward(&mut self, x: ArrayView4<f32>, mode: Mode) -> Result<Array4<f32>> {
        let (n, c, h, w) = x.dim();

        if c != self.channels {
            return Err(MlErr::SizeMismatch {
                what: "batch_norm2d input channels",
                got: c,
                expected: self.channels,
            });
        }

        let x = im2col::to_channel_major(x)?;
        let m = x.ncols();

        let (mean, var) = match mode {
            Mode::Train => {
                let mean = x
                    .mean_axis(Axis(1))
                    .ok_or_else(|| MlErr::InvalidInput("batch norm over an empty batch".into()))?;
                let var = x.var_axis(Axis(1), 0.);
                self.update_running_stats(mean.view(), var.view(), m);
                (mean, var)
            }
            Mode::Eval => (
                ArrayView1::from_shape(c, self.running_mean.value())?.to_owned(),
                ArrayView1::from_shape(c, self.running_var.value())?.to_owned(),
            ),
        };

        let inv_std = var.mapv(|v| 1. / (v + EPS).sqrt());
        let x_hat = (&x - &mean.insert_axis(Axis(1))) * &inv_std.view().insert_axis(Axis(1));

        let gamma = ArrayView1::from_shape(c, self.weight.value())?;
        let beta = ArrayView1::from_shape(c, self.bias.value())?;
        let y = &x_hat * &gamma.insert_axis(Axis(1)) + &beta.insert_axis(Axis(1));

        self.fwd = (mode == Mode::Train).then(|| Forward {
            x_hat,
            inv_std,
            input_dim: (n, c, h, w),
        });

        im2col::from_channel_major(y, (n, c, h, w))
    }

    pub fn backward(&mut self, d: ArrayView4<f32>) -> Result<Array4<f32>> {
        let Forward {
            x_hat,
            inv_std,
            input_dim,
        } = self
            .fwd
            .take()
            .ok_or(MlErr::MissingForwardCache { layer: "batch_norm2d" })?;

        if d.dim() != input_dim {
            return Err(MlErr::SizeMismatch {
                what: "batch_norm2d gradient",
                got: d.len(),
                expected: x_hat.len(),
            });
        }

        let d = im2col::to_channel_major(d)?;
        let m = d.ncols() as f32;

        let dgamma = (&d * &x_hat).sum_axis(Axis(1));
        let dbeta = d.sum_axis(Axis(1));

        let gamma = ArrayView1::from_shape(self.channels, self.weight.value())?.to_owned();
        let dx_hat = &d * &gamma.insert_axis(Axis(1));
        let sum_dx_hat = dx_hat.sum_axis(Axis(1));
        let sum_dx_hat_x_hat = (&dx_hat * &x_hat).sum_axis(Axis(1));

        let mut dx = Array2::zeros(d.dim());
        Zip::from(dx.rows_mut())
            .and(dx_hat.rows())
            .and(x_hat.rows())
            .and(&inv_std)
            .and(&sum_dx_hat)
            .and(&sum_dx_hat_x_hat)
            .for_each(|mut dx, dx_hat, x_hat, &inv_std, &s, &sx| {
                Zip::from(&mut dx)
                    .and(&dx_hat)
                    .and(&x_hat)
                    .for_each(|g, &dxh, &xh| *g = inv_std / m * (m * dxh - s - xh * sx));
            });

        accumulate(self.weight.grad_mut(), &dgamma);
        accumulate(self.bias.grad_mut(), &dbeta);

        im2col::from_channel_major(dx, input_dim)
    }

    fn update_running_stats(&mut self, mean: ArrayView1<f32>, var: ArrayView1<f32>, m: usize) {
        let unbias = if m > 1 { m as f32 / (m - 1) as f32 } else { 1. };

        self.running_mean
            .value_mut()
            .iter_mut()
            .zip(mean)
            .for_each(|(r, &v)| *r = (1. - MOMENTUM) * *r + MOMENTUM * v);

        self.running_var
            .value_mut()
            .iter_mut()
            .zip(var)
            .for_each(|(r, &v)| *r = (1. - MOMENTUM) * *r + MOMENTUM * v * unbias);
    }
}

fn accumulate(grad: &mut [f32], delta: &Array1<f32>) {
    grad.iter_mut().zip(delta).for_each(|(g, d)| *g += d);
}

#[cfg(test)]
mod tests {
    use ndarray::Array;

    use super::*;

    fn input() -> Array4<f32> {
        Array::from_shape_vec((2, 1, 1, 2), vec![1., 2., 3., 6.]).unwrap()
    }

    #[test]
    fn training_normalizes_with_batch_statistics() {
        let mut bn = BatchNorm2d::new(1);
        let y = bn.forward(input().view(), Mode::Train).unwrap();

        assert!(y.mean().unwrap().abs() < 1e-5);
        let var = y.mapv(|v| v * v).mean().unwrap();
        assert!((var - 1.).abs() < 1e-3);

        // mean 3, unbiased variance 14 / 3
        assert!((bn.running_mean().value()[0] - 0.3).abs() < 1e-6);
        let expected_var = 0.9 + 0.1 * 14. / 3.;
        assert!((bn.running_var().value()[0] - expected_var).abs() < 1e-5);
    }

    #[test]
    fn evaluation_uses_running_statistics() {
        let mut bn = BatchNorm2d::new(1);
        bn.running_mean_mut().value_mut()[0] = 1.;
        bn.running_var_mut().value_mut()[0] = 4.;
        bn.weight_mut().value_mut()[0] = 2.;
        bn.bias_mut().value_mut()[0] = 0.5;

        let y = bn.forward(input().view(), Mode::Eval).unwrap();
        let expected = [0.5, 1.5, 2.5, 5.5];
        for (got, want) in y.iter().zip(expected) {
            assert!((got - want).abs() < 1e-3, "{got} != {want}");
        }

        assert_eq!(bn.running_mean().value(), [1.]);
    }

    #[test]
    fn gradient_of_a_normalized_sum_vanishes() {
        let mut bn = BatchNorm2d::new(1);
        bn.forward(input().view(), Mode::Train).unwrap();

        // the normalized output always sums to zero, so a constant upstream gradient can't
        // move the input
        let dx = bn.backward(Array4::ones((2, 1, 1, 2)).view()).unwrap();
        assert!(dx.iter().all(|g| g.abs() < 1e-5));
        assert_eq!(bn.bias.grad(), [4.]);
        assert!(bn.weight.grad()[0].abs() < 1e-5);
    }
}
