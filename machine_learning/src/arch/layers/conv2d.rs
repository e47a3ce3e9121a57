use ndarray::{Array2, Array4, ArrayView1, ArrayView2, ArrayView4, ArrayViewMut2, Axis, linalg};
use rand::Rng;

use super::im2col::{self, Window};
use crate::{
    MlErr, Result,
    arch::{Mode, Param},
    quantization::WeightQuant,
};

/// Forward metadata kept for the backward pass.
#[derive(Debug, Clone)]
struct Forward {
    cols: Array2<f32>,
    weight: Array2<f32>,
    mask: Option<Vec<bool>>,
    input_dim: (usize, usize, usize, usize),
    out_hw: (usize, usize),
}

/// A 2D convolution over (N, C, H, W) inputs with square kernels, computed as a matrix product
/// over the unfolded input windows.
///
/// The layer optionally quantizes its weights; `quant` being `None` means this layer doesn't
/// support quantization at all.
#[derive(Debug, Clone)]
pub struct Conv2d {
    in_channels: usize,
    out_channels: usize,
    window: Window,
    weight: Param,
    bias: Param,
    quant: Option<WeightQuant>,

    fwd: Option<Forward>,
}

impl Conv2d {
    /// Creates a new `Conv2d` with He-initialized weights and zero biases.
    ///
    /// # Arguments
    /// * `channels` - The amount of input and output channels.
    /// * `window` - The kernel size, stride and padding.
    /// * `quantized` - Whether the layer supports weight quantization.
    /// * `rng` - The random number generator used to initialize the weights.
    pub fn new<R: Rng>(
        (in_channels, out_channels): (usize, usize),
        window: Window,
        quantized: bool,
        rng: &mut R,
    ) -> Self {
        let k = window.kernel;
        let fan_in = in_channels * k * k;

        Self {
            in_channels,
            out_channels,
            window,
            weight: Param::kaiming(&[out_channels, in_channels, k, k], fan_in, rng),
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

    pub fn forward(&mut self, x: ArrayView4<f32>, mode: Mode) -> Result<Array4<f32>> {
        let (n, c, h, w) = x.dim();

        if c != self.in_channels {
            return Err(MlErr::SizeMismatch {
                what: "conv2d input channels",
                got: c,
                expected: self.in_channels,
            });
        }

        let (Some(oh), Some(ow)) = (self.window.out_len(h), self.window.out_len(w)) else {
            return Err(MlErr::InvalidInput(format!(
                "a {0}x{0} kernel doesn't fit a {h}x{w} input",
                self.window.kernel
            )));
        };

        let (weight, mask) = self.effective_weight()?;
        let cols = im2col::im2col(x, self.window, (oh, ow));

        let mut z = Array2::zeros((self.out_channels, n * oh * ow));
        linalg::general_mat_mul(1.0, &weight, &cols, 0.0, &mut z);

        let b = ArrayView1::from_shape(self.out_channels, self.bias.value())?;
        z += &b.insert_axis(Axis(1));

        let y = im2col::from_channel_major(z, (n, self.out_channels, oh, ow))?;

        self.fwd = (mode == Mode::Train).then(|| Forward {
            cols,
            weight,
            mask,
            input_dim: (n, c, h, w),
            out_hw: (oh, ow),
        });

        Ok(y)
    }

    pub fn backward(&mut self, d: ArrayView4<f32>) -> Result<Array4<f32>> {
        let Forward {
            cols,
            weight,
            mask,
            input_dim,
            out_hw,
        } = self.fwd.take().ok_or(MlErr::MissingForwardCache { layer: "conv2d" })?;

        let d = im2col::to_channel_major(d)?;
        let (rows, len) = weight.dim();

        if d.dim() != (self.out_channels, cols.ncols()) {
            return Err(MlErr::SizeMismatch {
                what: "conv2d output gradient",
                got: d.len(),
                expected: self.out_channels * cols.ncols(),
            });
        }

        let mut dw = Array2::zeros((rows, len));
        linalg::general_mat_mul(1.0, &d, &cols.t(), 0.0, &mut dw);
        if let Some(mask) = mask {
            dw.iter_mut().zip(mask).for_each(|(g, pass)| *g *= pass as u8 as f32);
        }

        let mut grad = ArrayViewMut2::from_shape((rows, len), self.weight.grad_mut())?;
        grad += &dw;

        self.bias
            .grad_mut()
            .iter_mut()
            .zip(d.sum_axis(Axis(1)))
            .for_each(|(g, db)| *g += db);

        let mut dcols = Array2::zeros(cols.dim());
        linalg::general_mat_mul(1.0, &weight.t(), &d, 0.0, &mut dcols);

        Ok(im2col::col2im(dcols.view(), self.window, input_dim, out_hw))
    }

    /// Returns the weights as an (out, in * k * k) matrix, quantized if enabled, along with the
    /// straight-through mask of the quantizer.
    fn effective_weight(&self) -> Result<(Array2<f32>, Option<Vec<bool>>)> {
        let shape = (self.out_channels, self.in_channels * self.window.kernel.pow(2));

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

    fn conv(channels: (usize, usize), window: Window, weight: Vec<f32>) -> Conv2d {
        let mut conv = Conv2d::new(channels, window, true, &mut StdRng::seed_from_u64(0));
        conv.weight_mut().value_mut().copy_from_slice(&weight);
        conv
    }

    #[test]
    fn forward_matches_a_hand_computed_convolution() {
        let mut conv = conv((1, 1), Window::new(2, 1, 0), vec![1., 0., 0., -1.]);
        conv.bias_mut().value_mut()[0] = 0.5;

        let x = Array::from_shape_vec((1, 1, 3, 3), (1..=9).map(|v| v as f32).collect()).unwrap();
        let y = conv.forward(x.view(), Mode::Eval).unwrap();

        // x[i, j] - x[i + 1, j + 1] = -4 everywhere
        assert_eq!(y.shape(), [1, 1, 2, 2]);
        assert!(y.iter().all(|&v| v == -3.5));
    }

    #[test]
    fn same_padding_keeps_the_spatial_size() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut conv = Conv2d::new((3, 4), Window::new(3, 1, 1), false, &mut rng);
        let x = Array4::ones((2, 3, 8, 6));

        let y = conv.forward(x.view(), Mode::Eval).unwrap();
        assert_eq!(y.shape(), [2, 4, 8, 6]);
    }

    #[test]
    fn rejects_inputs_with_the_wrong_channel_count() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut conv = Conv2d::new((3, 4), Window::new(3, 1, 1), false, &mut rng);
        let x = Array4::ones((1, 2, 4, 4));

        assert!(matches!(
            conv.forward(x.view(), Mode::Eval),
            Err(MlErr::SizeMismatch { got: 2, expected: 3, .. })
        ));
    }

    #[test]
    fn backward_accumulates_gradients() {
        let mut conv = conv((1, 1), Window::new(1, 1, 0), vec![2.]);
        let x = Array::from_shape_vec((1, 1, 1, 2), vec![1., 3.]).unwrap();

        conv.forward(x.view(), Mode::Train).unwrap();
        let d = Array4::ones((1, 1, 1, 2));
        let dx = conv.backward(d.view()).unwrap();

        assert_eq!(dx.iter().copied().collect::<Vec<_>>(), [2., 2.]);
        assert_eq!(conv.weight().grad(), [4.]);
        assert_eq!(conv.bias.grad(), [2.]);

        conv.forward(x.view(), Mode::Train).unwrap();
        conv.backward(d.view()).unwrap();
        assert_eq!(conv.weight().grad(), [8.]);
    }

    #[test]
    fn backward_without_a_training_forward_fails() {
        let mut conv = conv((1, 1), Window::new(1, 1, 0), vec![2.]);
        let x = Array4::ones((1, 1, 2, 2));

        conv.forward(x.view(), Mode::Eval).unwrap();
        assert!(conv.backward(x.view()).is_err());
    }

    #[test]
    fn quantized_weights_are_used_in_the_forward_pass() {
        let mut conv = conv((1, 2), Window::new(1, 1, 0), vec![1., 0.3]);
        *conv.quant_mut().unwrap() = WeightQuant { n_lv: 4, ratio: 1. };

        let x = Array4::ones((1, 1, 1, 1));
        let y = conv.forward(x.view(), Mode::Eval).unwrap();

        // one step per side: 0.3 snaps to 0
        assert_eq!(y.iter().copied().collect::<Vec<_>>(), [1., 0.]);
    }
}
