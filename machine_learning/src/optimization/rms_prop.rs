use super::Optimizer;
use crate::{MlErr, Result};

/// RMSprop: scales every step by a running average of the squared gradients.
///
/// Weight decay is applied as an L2 penalty added to the gradient. With a non-zero `momentum`
/// the scaled steps are accumulated in a velocity buffer.
#[derive(Debug)]
pub struct RmsProp {
    learning_rate: f32,
    alpha: f32,
    eps: f32,
    weight_decay: f32,
    momentum: f32,
    square_avg: Box<[f32]>,
    velocity: Box<[f32]>,
}

impl RmsProp {
    pub const ALPHA: f32 = 0.99;
    pub const EPS: f32 = 1e-8;

    /// Creates a new `RmsProp` optimizer with the usual smoothing constant and epsilon.
    ///
    /// # Arguments
    /// * `len` - The amount of parameters this instance should hold.
    /// * `learning_rate` - The step size.
    /// * `weight_decay` - The L2 penalty added to the gradient.
    /// * `momentum` - The decay of the velocity, `0` disables it.
    pub fn new(len: usize, learning_rate: f32, weight_decay: f32, momentum: f32) -> Self {
        Self::with_smoothing(len, learning_rate, Self::ALPHA, Self::EPS, weight_decay, momentum)
    }

    pub fn with_smoothing(
        len: usize,
        learning_rate: f32,
        alpha: f32,
        eps: f32,
        weight_decay: f32,
        momentum: f32,
    ) -> Self {
        Self {
            learning_rate,
            alpha,
            eps,
            weight_decay,
            momentum,
            square_avg: vec![0.; len].into_boxed_slice(),
            velocity: vec![0.; if momentum > 0. { len } else { 0 }].into_boxed_slice(),
        }
    }
}

impl Optimizer for RmsProp {
    fn update_params(&mut self, params: &mut [f32], grad: &[f32]) -> Result<()> {
        if grad.len() != params.len() || params.len() != self.square_avg.len() {
            return Err(MlErr::SizeMismatch {
                what: "optimizer state",
                got: grad.len(),
                expected: self.square_avg.len(),
            });
        }

        let Self {
            learning_rate: lr,
            alpha,
            eps,
            weight_decay: wd,
            momentum: mu,
            ..
        } = *self;

        for (i, (p, g)) in params.iter_mut().zip(grad).enumerate() {
            let g = g + wd * *p;
            let avg = &mut self.square_avg[i];
            *avg = alpha * *avg + (1. - alpha) * g * g;

            let step = g / (avg.sqrt() + eps);

            if mu > 0. {
                let v = &mut self.velocity[i];
                *v = mu * *v + step;
                *p -= lr * *v;
            } else {
                *p -= lr * step;
            }
        }

        Ok(())
    }

    fn learning_rate(&self) -> f32 {
        self.learning_rate
    }

    fn set_learning_rate(&mut self, learning_rate: f32) {
        self.learning_rate = learning_rate;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_step_is_normalized_by_the_gradient_magnitude() {
        let mut opt = RmsProp::new(2, 0.01, 0., 0.);
        let mut p = [1.0, 1.0];

        opt.update_params(&mut p, &[4.0, -0.5]).unwrap();

        // avg = 0.01 * g^2, so every step is lr / sqrt(0.01) = 0.1 in the gradient's direction
        assert!((p[0] - 0.9).abs() < 1e-5, "{}", p[0]);
        assert!((p[1] - 1.1).abs() < 1e-5, "{}", p[1]);
    }

    #[test]
    fn zero_gradient_leaves_params_untouched() {
        let mut opt = RmsProp::new(1, 0.01, 0., 0.9);
        let mut p = [3.0];

        opt.update_params(&mut p, &[0.0]).unwrap();
        assert_eq!(p, [3.0]);
    }

    #[test]
    fn learning_rate_can_be_rescheduled() {
        let mut opt = RmsProp::new(1, 0.01, 0., 0.);
        opt.set_learning_rate(0.005);
        assert_eq!(opt.learning_rate(), 0.005);
    }
}
