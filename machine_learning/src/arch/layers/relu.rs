use ndarray::{Array4, ArrayView4, Zip};

use crate::{MlErr, Result, arch::Mode, quantization::ActQuant};

/// A rectified linear unit whose output can be saturated and quantized.
#[derive(Debug, Clone, Default)]
pub struct Relu {
    quant: Option<ActQuant>,

    // Forward metadata
    mask: Option<Array4<bool>>,
}

impl Relu {
    /// Creates a full-precision `Relu` that doesn't support quantization.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a `Relu` that supports activation quantization (disabled until configured).
    pub fn quantized() -> Self {
        Self {
            quant: Some(ActQuant::default()),
            mask: None,
        }
    }

    pub fn quant_mut(&mut self) -> Option<&mut ActQuant> {
        self.quant.as_mut()
    }

    pub fn forward(&mut self, x: ArrayView4<f32>, mode: Mode) -> Array4<f32> {
        let quant = self.quant.unwrap_or_default();
        let y = x.mapv(|v| quant.quantize(v.max(0.)));

        self.mask = (mode == Mode::Train).then(|| x.mapv(|v| quant.passes_grad(v)));
        y
    }

    pub fn backward(&mut self, d: ArrayView4<f32>) -> Result<Array4<f32>> {
        let mask = self
            .mask
            .take()
            .ok_or(MlErr::MissingForwardCache { layer: "relu" })?;

        if mask.dim() != d.dim() {
            return Err(MlErr::SizeMismatch {
                what: "relu gradient",
                got: d.len(),
                expected: mask.len(),
            });
        }

        let mut dx = d.to_owned();
        Zip::from(&mut dx)
            .and(&mask)
            .for_each(|g, &pass| *g *= pass as u8 as f32);

        Ok(dx)
    }
}
