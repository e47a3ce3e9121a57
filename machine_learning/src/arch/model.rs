use ndarray::{Array4, ArrayView4};

use super::{Param, StateMut, layers::Layer};
use crate::Result;

/// Whether a forward pass is part of training (batch statistics, cached activations) or of
/// evaluation (running statistics, nothing cached).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Train,
    Eval,
}

pub trait Model {
    /// Makes a forward pass through the network.
    ///
    /// # Arguments
    /// * `x` - A batch of inputs shaped (N, C, H, W).
    /// * `mode` - Whether the pass is part of training.
    ///
    /// # Returns
    /// The network's raw output (logits) shaped (N, n_class, H, W).
    fn forward(&mut self, x: ArrayView4<f32>, mode: Mode) -> Result<Array4<f32>>;

    /// Backpropagates the gradient of the loss with respect to the output of the last training
    /// forward pass, **accumulating** into the gradients of every parameter.
    fn backward(&mut self, d: ArrayView4<f32>) -> Result<()>;

    /// Returns every layer of the network along with its qualified name.
    fn layers_mut(&mut self) -> Vec<(String, &mut Layer)>;

    /// Returns every trainable parameter, named `<layer>.<param>`.
    fn params_mut(&mut self) -> Vec<(String, &mut Param)> {
        let mut params = Vec::new();

        for (layer_name, layer) in self.layers_mut() {
            for (name, param) in layer.params_mut() {
                params.push((format!("{layer_name}.{name}"), param));
            }
        }

        params
    }

    /// Returns every persisted tensor (parameters and buffers), named `<layer>.<tensor>`.
    fn state_mut(&mut self) -> Vec<(String, StateMut<'_>)> {
        let mut state = Vec::new();

        for (layer_name, layer) in self.layers_mut() {
            for (name, tensor) in layer.state_mut() {
                state.push((format!("{layer_name}.{name}"), tensor));
            }
        }

        state
    }

    /// Resets the gradient of every parameter.
    fn zero_grad(&mut self) {
        for (_, param) in self.params_mut() {
            param.zero_grad();
        }
    }

    /// Returns the amount of trainable parameters in the model.
    fn size(&mut self) -> usize {
        self.params_mut().iter().map(|(_, p)| p.len()).sum()
    }
}
