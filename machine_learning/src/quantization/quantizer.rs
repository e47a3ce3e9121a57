/// Activation quantization parameters of a quantized ReLU.
///
/// A level count of `0` disables quantization.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ActQuant {
    pub n_lv: u32,
    pub bound: f32,
}

impl ActQuant {
    pub fn is_enabled(&self) -> bool {
        self.n_lv > 0 && self.bound > 0.
    }

    /// Saturates `x` (already rectified) to `[0, bound]` and snaps it to one of `n_lv` levels.
    pub fn quantize(&self, x: f32) -> f32 {
        if !self.is_enabled() {
            return x;
        }

        let steps = self.n_lv.saturating_sub(1).max(1) as f32;
        let unit = (x / self.bound).clamp(0., 1.);
        (unit * steps).round() / steps * self.bound
    }

    /// Straight-through estimator: whether the gradient flows back through a pre-activation `x`.
    pub fn passes_grad(&self, x: f32) -> bool {
        x > 0. && (!self.is_enabled() || x < self.bound)
    }
}

/// Weight quantization parameters of a quantized (transposed) convolution.
///
/// Weights are clipped to `ratio * max|w|` and quantized symmetrically. A level count of `0`
/// disables quantization.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct WeightQuant {
    pub n_lv: u32,
    pub ratio: f32,
}

impl WeightQuant {
    pub fn is_enabled(&self) -> bool {
        self.n_lv > 0 && self.ratio > 0.
    }

    /// Quantizes a set of weights.
    ///
    /// # Returns
    /// The quantized weights and, per weight, whether its gradient flows straight through
    /// (the weight wasn't clipped), or `None` if quantization is disabled.
    pub fn quantize(&self, w: &[f32]) -> Option<(Vec<f32>, Vec<bool>)> {
        if !self.is_enabled() {
            return None;
        }

        let max = w.iter().fold(0f32, |acc, v| acc.max(v.abs()));
        let clip = self.ratio * max;

        if clip == 0. {
            return None;
        }

        let steps = (self.n_lv / 2).saturating_sub(1).max(1) as f32;
        let quantized = w
            .iter()
            .map(|&v| ((v / clip).clamp(-1., 1.) * steps).round() / steps * clip)
            .collect();
        let mask = w.iter().map(|v| v.abs() <= clip).collect();

        Some((quantized, mask))
    }
}

/// A mutable handle over the quantization parameters of a layer that supports them.
#[derive(Debug)]
pub enum QuantSlot<'a> {
    Activation(&'a mut ActQuant),
    Weight(&'a mut WeightQuant),
}
