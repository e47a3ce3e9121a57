mod gradient_descent_with_momentum;
mod optimizer;
mod rms_prop;
mod scheduler;

pub use gradient_descent_with_momentum::GradientDescentWithMomentum;
pub use optimizer::Optimizer;
pub use rms_prop::RmsProp;
pub use scheduler::{CosineAnnealing, LrSchedule, StepLr};
