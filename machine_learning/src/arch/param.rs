use rand::Rng;
use rand_distr::StandardNormal;

use crate::{MlErr, Result};

/// A learnable tensor: a flat buffer of values, its gradient and the shape both are viewed with.
#[derive(Debug, Clone)]
pub struct Param {
    shape: Vec<usize>,
    value: Vec<f32>,
    grad: Vec<f32>,
}

impl Param {
    /// Creates a new `Param` filled with `fill`.
    ///
    /// # Arguments
    /// * `shape` - The shape of the tensor.
    /// * `fill` - The initial value of every element.
    pub fn full(shape: &[usize], fill: f32) -> Self {
        let len = shape.iter().product();

        Self {
            shape: shape.to_vec(),
            value: vec![fill; len],
            grad: vec![0.; len],
        }
    }

    /// Creates a new `Param` from its raw values.
    ///
    /// # Returns
    /// An error if the amount of values doesn't match the shape.
    pub fn from_vec(shape: &[usize], value: Vec<f32>) -> Result<Self> {
        let len: usize = shape.iter().product();

        if value.len() != len {
            return Err(MlErr::SizeMismatch {
                what: "param values",
                got: value.len(),
                expected: len,
            });
        }

        Ok(Self {
            shape: shape.to_vec(),
            grad: vec![0.; len],
            value,
        })
    }

    /// Creates a new `Param` initialized with He (Kaiming) normal initialization.
    ///
    /// # Arguments
    /// * `shape` - The shape of the tensor.
    /// * `fan_in` - The amount of inputs that contribute to each output.
    /// * `rng` - The random number generator used for sampling.
    pub fn kaiming<R: Rng>(shape: &[usize], fan_in: usize, rng: &mut R) -> Self {
        let std = (2. / fan_in.max(1) as f32).sqrt();
        let len = shape.iter().product();
        let value = (0..len)
            .map(|_| rng.sample::<f32, _>(StandardNormal) * std)
            .collect();

        Self {
            shape: shape.to_vec(),
            grad: vec![0.; len],
            value,
        }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn len(&self) -> usize {
        self.value.len()
    }

    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }

    pub fn value(&self) -> &[f32] {
        &self.value
    }

    pub fn value_mut(&mut self) -> &mut [f32] {
        &mut self.value
    }

    pub fn grad(&self) -> &[f32] {
        &self.grad
    }

    pub fn grad_mut(&mut self) -> &mut [f32] {
        &mut self.grad
    }

    /// Borrows the values mutably and the gradient immutably at the same time, which is what
    /// an optimizer needs to take a step.
    pub fn split_mut(&mut self) -> (&mut [f32], &[f32]) {
        (&mut self.value, &self.grad)
    }

    pub fn zero_grad(&mut self) {
        self.grad.fill(0.);
    }

    /// Gives a mutable view of the values for checkpointing.
    pub fn state_mut(&mut self) -> StateMut<'_> {
        StateMut {
            shape: &self.shape,
            value: &mut self.value,
        }
    }
}

/// A non-learnable tensor that is still part of a model's state (e.g. running statistics).
#[derive(Debug, Clone)]
pub struct Buffer {
    shape: Vec<usize>,
    value: Vec<f32>,
}

impl Buffer {
    pub fn full(shape: &[usize], fill: f32) -> Self {
        let len = shape.iter().product();

        Self {
            shape: shape.to_vec(),
            value: vec![fill; len],
        }
    }

    pub fn value(&self) -> &[f32] {
        &self.value
    }

    pub fn value_mut(&mut self) -> &mut [f32] {
        &mut self.value
    }

    pub fn state_mut(&mut self) -> StateMut<'_> {
        StateMut {
            shape: &self.shape,
            value: &mut self.value,
        }
    }
}

/// A mutable handle over one named tensor of a model's state.
#[derive(Debug)]
pub struct StateMut<'a> {
    pub shape: &'a [usize],
    pub value: &'a mut [f32],
}
