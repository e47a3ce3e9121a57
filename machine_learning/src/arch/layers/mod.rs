mod batch_norm;
mod conv2d;
mod conv_transpose2d;
pub(crate) mod im2col;
mod layer;
mod max_pool;
mod relu;

pub use batch_norm::BatchNorm2d;
pub use conv2d::Conv2d;
pub use conv_transpose2d::ConvTranspose2d;
pub use im2col::Window;
pub use layer::Layer;
pub use max_pool::MaxPool2d;
pub use relu::Relu;
