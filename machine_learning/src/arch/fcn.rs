use ndarray::{Array4, ArrayView4};
use rand::Rng;
use serde::Deserialize;

use super::{
    Mode, Model,
    layers::Layer,
    vgg::{STAGES, Vgg, VggConfig},
};
use crate::{MlErr, Result};

/// The factor by which the backbone downsamples its input.
pub const DOWNSAMPLING: usize = 1 << STAGES;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FcnConfig {
    pub n_class: usize,
    pub backbone: VggConfig,
}

/// One upsampling step of the decoder: a transposed convolution that doubles the resolution, an
/// activation and a batch normalization.
#[derive(Debug, Clone)]
struct DecoderStage {
    deconv: Layer,
    relu: Layer,
    bn: Layer,
}

impl DecoderStage {
    fn new<R: Rng>(channels: (usize, usize), rng: &mut R) -> Self {
        Self {
            deconv: Layer::upsample2x(channels, rng),
            relu: Layer::relu(),
            bn: Layer::batch_norm2d(channels.1),
        }
    }

    fn forward(&mut self, x: ArrayView4<f32>, mode: Mode) -> Result<Array4<f32>> {
        let x = self.deconv.forward(x, mode)?;
        let x = self.relu.forward(x.view(), mode)?;
        self.bn.forward(x.view(), mode)
    }

    fn backward(&mut self, d: ArrayView4<f32>) -> Result<Array4<f32>> {
        let d = self.bn.backward(d)?;
        let d = self.relu.backward(d.view())?;
        self.deconv.backward(d.view())
    }
}

/// A fully convolutional network for semantic segmentation (FCN-8s style "FCNs" variant): the
/// deepest backbone features are upsampled back to the input resolution, adding the output of
/// every shallower pooling stage along the way.
#[derive(Debug, Clone)]
pub struct Fcn {
    backbone: Vgg,
    decoder: Vec<DecoderStage>,
    classifier: Layer,
}

impl Fcn {
    /// Creates a new `Fcn` with freshly initialized weights.
    ///
    /// # Arguments
    /// * `config` - The amount of classes and the backbone layout.
    /// * `rng` - The random number generator used to initialize the weights.
    pub fn new<R: Rng>(config: &FcnConfig, rng: &mut R) -> Self {
        let widths = config.backbone.widths();
        let head = (widths[0] / 2).max(1);

        // deepest stage first, each stage maps onto the width of the one above it
        let decoder = (0..STAGES)
            .rev()
            .map(|stage| {
                let out = if stage == 0 { head } else { widths[stage - 1] };
                DecoderStage::new((widths[stage], out), rng)
            })
            .collect();

        Self {
            backbone: Vgg::new(&config.backbone, rng),
            decoder,
            classifier: Layer::conv1x1((head, config.n_class), rng),
        }
    }
}

impl Model for Fcn {
    fn forward(&mut self, x: ArrayView4<f32>, mode: Mode) -> Result<Array4<f32>> {
        let (_, _, h, w) = x.dim();

        if h == 0 || w == 0 || h % DOWNSAMPLING != 0 || w % DOWNSAMPLING != 0 {
            return Err(MlErr::InvalidInput(format!(
                "input size {h}x{w} must be a positive multiple of {DOWNSAMPLING}"
            )));
        }

        let pools = self.backbone.forward(x, mode)?;
        let mut skips = pools.iter().rev();

        let mut score = skips
            .next()
            .cloned()
            .ok_or(MlErr::MissingForwardCache { layer: "vgg" })?;

        for stage in &mut self.decoder {
            score = stage.forward(score.view(), mode)?;

            if let Some(skip) = skips.next() {
                score += skip;
            }
        }

        self.classifier.forward(score.view(), mode)
    }

    fn backward(&mut self, d: ArrayView4<f32>) -> Result<()> {
        let mut d = self.classifier.backward(d)?;
        let mut grads = Vec::with_capacity(STAGES);

        for (i, stage) in self.decoder.iter_mut().enumerate().rev() {
            // every stage but the last receives a skip connection after its normalization
            if i + 1 < STAGES {
                grads.push(d.clone());
            }

            d = stage.backward(d.view())?;
        }

        grads.push(d);
        self.backbone.backward(grads)
    }

    fn layers_mut(&mut self) -> Vec<(String, &mut Layer)> {
        let mut layers: Vec<_> = self.backbone.layers_mut().collect();

        for (i, stage) in self.decoder.iter_mut().enumerate() {
            let n = i + 1;
            layers.push((format!("deconv{n}"), &mut stage.deconv));
            layers.push((format!("relu{n}"), &mut stage.relu));
            layers.push((format!("bn{n}"), &mut stage.bn));
        }

        layers.push(("classifier".to_string(), &mut self.classifier));
        layers
    }
}
