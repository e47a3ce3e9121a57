use machine_learning::optimization::{
    CosineAnnealing, GradientDescentWithMomentum, LrSchedule, Optimizer, RmsProp, StepLr,
};
use serde::Deserialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub enum OptimizerConfig {
    #[default]
    #[serde(rename = "RMSprop")]
    RmsProp,
    #[serde(rename = "SGD")]
    Sgd,
}

impl OptimizerConfig {
    /// The name used in run identifiers.
    pub fn name(&self) -> &'static str {
        match self {
            Self::RmsProp => "RMSprop",
            Self::Sgd => "SGD",
        }
    }

    /// Creates the optimizer of a single parameter tensor.
    ///
    /// # Arguments
    /// * `len` - The amount of values in the tensor.
    /// * `lr` - The initial learning rate.
    /// * `momentum` - The momentum of the updates.
    /// * `weight_decay` - The L2 penalty.
    pub fn build(
        &self,
        len: usize,
        lr: f32,
        momentum: f32,
        weight_decay: f32,
    ) -> Box<dyn Optimizer> {
        match self {
            Self::RmsProp => Box::new(RmsProp::new(len, lr, weight_decay, momentum)),
            Self::Sgd => Box::new(GradientDescentWithMomentum::new(
                len,
                lr,
                momentum,
                weight_decay,
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScheduleConfig {
    /// Decay by the run's `gamma` every `step_size` epochs.
    #[default]
    Step,
    Cosine {
        t_max: usize,
        #[serde(default)]
        eta_min: f32,
    },
}

impl ScheduleConfig {
    pub fn build(&self, lr: f32, step_size: usize, gamma: f32) -> Box<dyn LrSchedule> {
        match *self {
            Self::Step => Box::new(StepLr::new(lr, step_size, gamma)),
            Self::Cosine { t_max, eta_min } => Box::new(CosineAnnealing::new(lr, t_max, eta_min)),
        }
    }
}
