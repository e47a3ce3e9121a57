use std::f32::consts::PI;

/// A learning rate schedule advanced once per epoch.
pub trait LrSchedule {
    /// Advances the schedule by one epoch.
    ///
    /// # Returns
    /// The learning rate for the upcoming epoch.
    fn step(&mut self) -> f32;

    /// Returns the current learning rate.
    fn learning_rate(&self) -> f32;
}

impl<L: LrSchedule + ?Sized> LrSchedule for Box<L> {
    fn step(&mut self) -> f32 {
        (**self).step()
    }

    fn learning_rate(&self) -> f32 {
        (**self).learning_rate()
    }
}

/// Decays the learning rate by `gamma` every `step_size` epochs.
#[derive(Debug, Clone)]
pub struct StepLr {
    base_lr: f32,
    step_size: usize,
    gamma: f32,
    epoch: usize,
}

impl StepLr {
    pub fn new(base_lr: f32, step_size: usize, gamma: f32) -> Self {
        Self {
            base_lr,
            step_size: step_size.max(1),
            gamma,
            epoch: 0,
        }
    }
}

impl LrSchedule for StepLr {
    fn step(&mut self) -> f32 {
        self.epoch += 1;
        self.learning_rate()
    }

    fn learning_rate(&self) -> f32 {
        let decays = (self.epoch / self.step_size) as i32;
        self.base_lr * self.gamma.powi(decays)
    }
}

/// Anneals the learning rate from its base value down to `eta_min` following half a cosine wave
/// over `t_max` epochs, then starts over.
#[derive(Debug, Clone)]
pub struct CosineAnnealing {
    base_lr: f32,
    t_max: usize,
    eta_min: f32,
    epoch: usize,
}

impl CosineAnnealing {
    pub fn new(base_lr: f32, t_max: usize, eta_min: f32) -> Self {
        Self {
            base_lr,
            t_max: t_max.max(1),
            eta_min,
            epoch: 0,
        }
    }
}

impl LrSchedule for CosineAnnealing {
    fn step(&mut self) -> f32 {
        self.epoch += 1;
        self.learning_rate()
    }

    fn learning_rate(&self) -> f32 {
        let t = (self.epoch % (2 * self.t_max)) as f32 / self.t_max as f32;
        self.eta_min + (self.base_lr - self.eta_min) * (1. + (PI * t).cos()) / 2.
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_lr_decays_every_step_size_epochs() {
        let mut schedule = StepLr::new(1e-4, 2, 0.5);
        assert_eq!(schedule.learning_rate(), 1e-4);

        let lrs: Vec<_> = (0..5).map(|_| schedule.step()).collect();
        assert_eq!(lrs, [1e-4, 5e-5, 5e-5, 2.5e-5, 2.5e-5]);
    }

    #[test]
    fn cosine_annealing_reaches_the_minimum_at_t_max() {
        let mut schedule = CosineAnnealing::new(1., 4, 0.);

        let lrs: Vec<_> = (0..4).map(|_| schedule.step()).collect();
        assert!((lrs[1] - 0.5).abs() < 1e-6);
        assert!(lrs[3].abs() < 1e-6);
        assert!(lrs.windows(2).all(|w| w[0] > w[1]));
    }
}
