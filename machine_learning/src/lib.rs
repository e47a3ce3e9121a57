pub mod arch;
pub mod checkpoint;
pub mod dataset;
pub mod error;
pub mod metrics;
pub mod optimization;
pub mod quantization;

pub use error::{MlErr, Result};
