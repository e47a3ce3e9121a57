mod fcn;
pub mod layers;
pub mod loss;
mod model;
mod param;
mod vgg;

pub use fcn::{DOWNSAMPLING, Fcn, FcnConfig};
pub use model::{Mode, Model};
pub use param::{Buffer, Param, StateMut};
pub use vgg::{STAGES, Vgg, VggConfig};
