use ndarray::{Array2, Array4, ArrayView2, ArrayView4, ArrayViewMut2, Axis, linalg};
use rand::Rng;

use super::im2col::{self, Window};
use crate::{
    MlErr, Result,
    arch::{Mode, Param},
    quantization::WeightQuant,
};

#[derive(Debug, Clone)]
struct Forward {
    x: Array2<f32>,
    weight: Array2<f32>,
    mask: Option<Vec<bool>>,
    input_dim: (usize, usize, usize, usize),
}

/// A 2D transposed convolution (a.k.a. deconvolution) used to upsample feature maps.
///
/// Output size along each spatial axis is `(len - 1) * stride - 2 * padding + kernel +
/// output_padding`. Weights are laid out as (in, out, k, k).
#[derive(Debug, Clone)]
pub struct ConvTranspose2d {
    in_channels: usize,
    out_channels: usize,
    window: Window,
    output_padding: usize,
    weight: Param,
    bias: Param,
    quant: Option<WeightQuant>,

    fwd: Option<Forward>,
}

impl ConvTranspose2d {
    /// Creates a new `ConvTranspose2d`.
    ///
    /// # Arguments
    /// * `channels` - The amount of input and output channels.
    /// * `window` - The kernel size, stride and padding.
    /// * `output_padding` - Extra size added to one side of each output axis, lower than the stride.
    /// * `quantized` - Whether the layer supports weight quantization.
    /// * `rng` - The random number generator used to initialize the weights.
    pub fn new<R: Rng>(
        (in_channels, out_channels): (usize, usize),
        window: Window,
        output_padding: usize,
        quantized: bool,
        rng: &mut R,
    ) -> Self {
        let k = window.kernel;
        let fan_in = out_channels * k * k;

        Self {
            in_channels,
            out_channels,
            window,
            output_padding: output_padding.min(window.stride - 1),
            weight: Param::kaiming(&[in_channels, out_channels, k, k], fan_in, rng),
            bias: Param::full(&[out_channels], 0.),
            quant: quantized.then(WeightQuant::default),
            fwd: None,
        }
    }

    pub fn weight(&self) -> &Param {
        &self.weight
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

    pub fn quant_mut(&mut self) -> Option<&mut WeightQuant> {
        self.quant.as_mut()
    }

    /// Returns the upsampled length of an axis of length `len`.
    pub fn out_len(&self, len: usize) -> Option<usize> {
        let Window {
            kernel,
            stride,
            padding,
        } = self.window;

        ((len.checked_sub(1)? * stride) + kernel + self.output_padding).checked_sub(2 * padding)
    }

    pub fn forward(&mut self, x: ArrayView4<f32>, mode: Mode) -> Result<Array4<f32>> {
        let (n, c, h, w) = x.dim();

        if c != self.in_channels {
            return Err(MlErr::SizeMismatch {
                what: "conv_transpose2d input channels",
                got: c,
                expected: self.in_channels,
            });
        }

        let (Some(oh), Some(ow)) = (self.out_len(h), self.out_len(w)) else {
            return Err(MlErr::InvalidInput(format!(
                "a transposed convolution can't upsample a {h}x{w} input"
            )));
        };

        let (weight, mask) = self.effective_weight()?;
        let x = im2col::to_channel_major(x)?;

        let mut cols = Array2::zeros((weight.ncols(), n * h * w));
        linalg::general_mat_mul(1.0, &weight.t(), &x, 0.0, &mut cols);

        let mut y = im2col::col2im(
            cols.view(),
            self.window,
            (n, self.out_channels, oh, ow),
            (h, w),
        );
        for (mut channel, &b) in y.axis_iter_mut(Axis(1)).zip(self.bias.value()) {
            channel += b;
        }

        self.fwd = (mode == Mode::Train).then(|| Forward {
            x,
            weight,
            mask,
            input_dim: (n, c, h, w),
        });

        Ok(y)
    }

    pub fn backward(&mut self, d: ArrayView4<f32>) -> Result<Array4<f32>> {
        let Forward {
            x,
            weight,
            mask,
            input_dim: (n, c, h, w),
        } = self.fwd.take().ok_or(MlErr::MissingForwardCache {
            layer: "conv_transpose2d",
        })?;

        if d.dim().1 != self.out_channels {
            return Err(MlErr::SizeMismatch {
                what: "conv_transpose2d output gradient channels",
                got: d.dim().1,
                expected: self.out_channels,
            });
        }

        let dcols = im2col::im2col(d, self.window, (h, w));

        let mut dw = Array2::zeros(weight.dim());
        linalg::general_mat_mul(1.0, &x, &dcols.t(), 0.0, &mut dw);
        if let Some(mask) = mask {
            dw.iter_mut().zip(mask).for_each(|(g, pass)| *g *= pass as u8 as f32);
        }

        let mut grad = ArrayViewMut2::from_shape(weight.dim(), self.weight.grad_mut())?;
        grad += &dw;

        let db = d.sum_axis(Axis(0)).sum_axis(Axis(1)).sum_axis(Axis(1));
        self.bias
            .grad_mut()
            .iter_mut()
            .zip(db)
            .for_each(|(g, db)| *g += db);

        let mut dx = Array2::zeros((c, n * h * w));
        linalg::general_mat_mul(1.0, &weight, &dcols, 0.0, &mut dx);

        im2col::from_channel_major(dx, (n, c, h, w))
    }

    /// Returns the weights as an (in, out * k * k) matrix, quantized if enabled.
    fn effective_weight(&self) -> Result<(Array2<f32>, Option<Vec<bool>>)> {
        let shape = (self.in_channels, self.out_channels * self.window.kernel.pow(2));

        match self.quant.as_ref().and_then(|q| q.quantize(self.weight.value())) {
            Some((quantized, mask)) => Ok((Array2::from_shape_vec(shape, quantized)?, Some(mask))),
            None => Ok((ArrayView2::from_shape(shape, self.weight.value())?.to_owned(), None)),
        }
    }
}

#[cfg(test)]
mod tests {
    use ndarray::Array;
    use rand::{SeedableRng, rngs::StdRng};

    use super::*;

    fn deconv(channels: (usize, usize), window: Window, output_padding: usize) -> ConvTranspose2d {
        ConvTranspose2d::new(channels, window, output_padding, true, &mut StdRng::seed_from_u64(3))
    }

    #[test]
    fn fcn_upsampling_doubles_the_spatial_size() {
        let mut layer = deconv((4, 2), Window::new(3, 2, 1), 1);
        let x = Array4::ones((2, 4, 3, 5));

        let y = layer.forward(x.view(), Mode::Eval).unwrap();
        assert_eq!(y.shape(), [2, 2, 6, 10]);
    }

    #[test]
    fn stride_two_kernel_two_spreads_each_input_over_a_block() {
        let mut layer = deconv((1, 1), Window::new(2, 2, 0), 0);
        layer.weight_mut().value_mut().copy_from_slice(&[1., 2., 3., 4.]);
        layer.bias_mut().value_mut()[0] = 1.;

        let x = Array::from_shape_vec((1, 1, 1, 2), vec![1., 10.]).unwrap();
        let y = layer.forward(x.view(), Mode::Eval).unwrap();

        let expected = Array::from_shape_vec(
            (1, 1, 2, 4),
            vec![2., 3., 11., 21., 4., 5., 31., 41.],
        )
        .unwrap();
        assert_eq!(y, expected);
    }

    #[test]
    fn backward_is_the_adjoint_of_forward() {
        let mut layer = deconv((2, 3), Window::new(3, 2, 1), 1);
        let x = Array::from_shape_fn((1, 2, 2, 2), |(_, c, h, w)| (c + 2 * h + w) as f32 * 0.1);
        let d = Array::from_shape_fn((1, 3, 4, 4), |(_, c, h, w)| ((c * 7 + h * 3 + w) % 5) as f32);

        let y = layer.forward(x.view(), Mode::Train).unwrap();
        let dx = layer.backward(d.view()).unwrap();

        // <d, W x> == <W^T d, x>, biases start at zero
        let lhs = (&y * &d).sum();
        let rhs = (&dx * &x).sum();
        assert!((lhs - rhs).abs() < 1e-3, "{lhs} != {rhs}");
        assert_eq!(layer.bias.grad().len(), 3);
    }
}
