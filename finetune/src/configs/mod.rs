mod data;
mod optimizer;
mod run;

pub use data::DataConfig;
pub use optimizer::{OptimizerConfig, ScheduleConfig};
pub use run::RunConfig;
