use ndarray::{Array4, ArrayView4};
use rand::Rng;

use super::{BatchNorm2d, Conv2d, ConvTranspose2d, MaxPool2d, Relu, Window};
use crate::{
    Result,
    arch::{Mode, Param, StateMut},
    quantization::QuantSlot,
};

/// Every layer a segmentation network is built from.
#[derive(Debug, Clone)]
pub enum Layer {
    Conv2d(Conv2d),
    ConvTranspose2d(ConvTranspose2d),
    Relu(Relu),
    MaxPool2d(MaxPool2d),
    BatchNorm2d(BatchNorm2d),
}
use Layer::*;

impl Layer {
    /// A quantization-aware 3x3 convolution that keeps the spatial size.
    pub fn conv3x3<R: Rng>(channels: (usize, usize), rng: &mut R) -> Self {
        Self::Conv2d(Conv2d::new(channels, Window::new(3, 1, 1), true, rng))
    }

    /// A full-precision 1x1 convolution.
    pub fn conv1x1<R: Rng>(channels: (usize, usize), rng: &mut R) -> Self {
        Self::Conv2d(Conv2d::new(channels, Window::new(1, 1, 0), false, rng))
    }

    /// A quantization-aware transposed convolution that doubles the spatial size.
    pub fn upsample2x<R: Rng>(channels: (usize, usize), rng: &mut R) -> Self {
        Self::ConvTranspose2d(ConvTranspose2d::new(channels, Window::new(3, 2, 1), 1, true, rng))
    }

    pub fn relu() -> Self {
        Self::Relu(Relu::quantized())
    }

    pub fn max_pool2d(size: usize) -> Self {
        Self::MaxPool2d(MaxPool2d::new(size))
    }

    pub fn batch_norm2d(channels: usize) -> Self {
        Self::BatchNorm2d(BatchNorm2d::new(channels))
    }

    /// A short name of the layer's kind, used for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Conv2d(_) => "conv2d",
            ConvTranspose2d(_) => "conv_transpose2d",
            Relu(_) => "relu",
            MaxPool2d(_) => "max_pool2d",
            BatchNorm2d(_) => "batch_norm2d",
        }
    }

    pub fn forward(&mut self, x: ArrayView4<f32>, mode: Mode) -> Result<Array4<f32>> {
        match self {
            Conv2d(l) => l.forward(x, mode),
            ConvTranspose2d(l) => l.forward(x, mode),
            Relu(l) => Ok(l.forward(x, mode)),
            MaxPool2d(l) => l.forward(x, mode),
            BatchNorm2d(l) => l.forward(x, mode),
        }
    }

    /// Backpropagates `d`, the gradient with respect to this layer's output, accumulating into the
    /// gradients of its parameters.
    ///
    /// # Returns
    /// The gradient with respect to the layer's input.
    pub fn backward(&mut self, d: ArrayView4<f32>) -> Result<Array4<f32>> {
        match self {
            Conv2d(l) => l.backward(d),
            ConvTranspose2d(l) => l.backward(d),
            Relu(l) => l.backward(d),
            MaxPool2d(l) => l.backward(d),
            BatchNorm2d(l) => l.backward(d),
        }
    }

    /// Returns the trainable parameters of the layer along with their names.
    pub fn params_mut(&mut self) -> Vec<(&'static str, &mut Param)> {
        match self {
            Conv2d(l) => {
                let (weight, bias) = l.params_mut();
                vec![("weight", weight), ("bias", bias)]
            }
            ConvTranspose2d(l) => {
                let (weight, bias) = l.params_mut();
                vec![("weight", weight), ("bias", bias)]
            }
            BatchNorm2d(l) => {
                let (weight, bias) = l.params_mut();
                vec![("weight", weight), ("bias", bias)]
            }
            Relu(_) | MaxPool2d(_) => Vec::new(),
        }
    }

    /// Returns every persisted tensor of the layer (parameters and buffers) along with their names.
    pub fn state_mut(&mut self) -> Vec<(&'static str, StateMut<'_>)> {
        match self {
            BatchNorm2d(l) => {
                let (weight, bias, mean, var) = l.state_mut();
                vec![
                    ("weight", weight),
                    ("bias", bias),
                    ("running_mean", mean),
                    ("running_var", var),
                ]
            }
            _ => self
                .params_mut()
                .into_iter()
                .map(|(name, param)| (name, param.state_mut()))
                .collect(),
        }
    }

    /// Returns the layer's quantizer, `None` if the layer doesn't support quantization.
    pub fn quant_slot(&mut self) -> Option<QuantSlot<'_>> {
        match self {
            Conv2d(l) => l.quant_mut().map(QuantSlot::Weight),
            ConvTranspose2d(l) => l.quant_mut().map(QuantSlot::Weight),
            Relu(l) => l.quant_mut().map(QuantSlot::Activation),
            MaxPool2d(_) | BatchNorm2d(_) => None,
        }
    }
}
