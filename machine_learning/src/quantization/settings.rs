use log::debug;
use serde::Deserialize;

use super::QuantSlot;
use crate::arch::Model;

/// The quantization parameters assigned to every quantization-aware layer of a model.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct QuantSettings {
    /// Amount of quantization levels, `0` leaves the layers in full precision.
    pub n_lv: u32,
    /// Saturation bound of quantized activations.
    pub bound: f32,
    /// Clipping ratio (relative to the largest weight magnitude) of quantized convolutions.
    pub ratio: f32,
}

impl Default for QuantSettings {
    fn default() -> Self {
        Self {
            n_lv: 8,
            bound: 1.,
            ratio: 0.5,
        }
    }
}

impl QuantSettings {
    /// Walks the model's layers and configures the ones that support quantization: activations
    /// get `n_lv` and `bound`, convolutions get `n_lv` and `ratio`. Layers that don't support it
    /// are left untouched.
    ///
    /// # Returns
    /// The amount of layers that were configured.
    pub fn apply<M: Model + ?Sized>(&self, model: &mut M) -> usize {
        let mut configured = 0;

        for (name, layer) in model.layers_mut() {
            let Some(slot) = layer.quant_slot() else {
                continue;
            };

            match slot {
                QuantSlot::Activation(q) => {
                    q.n_lv = self.n_lv;
                    q.bound = self.bound;
                    debug!("{name}: n_lv={} bound={}", q.n_lv, q.bound);
                }
                QuantSlot::Weight(q) => {
                    q.n_lv = self.n_lv;
                    q.ratio = self.ratio;
                    debug!("{name}: n_lv={} ratio={}", q.n_lv, q.ratio);
                }
            }

            configured += 1;
        }

        configured
    }
}
