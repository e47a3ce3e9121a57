mod quantizer;
mod settings;

pub use quantizer::{ActQuant, QuantSlot, WeightQuant};
pub use settings::QuantSettings;
