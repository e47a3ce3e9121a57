use ndarray::{Array4, ArrayView4};
use rand::Rng;
use serde::Deserialize;

use super::{Mode, layers::Layer};
use crate::{MlErr, Result};

/// The amount of pooling stages of a VGG backbone.
pub const STAGES: usize = 5;

/// The layout of a VGG feature extractor: the output channels of every 3x3 convolution, grouped
/// in the five stages that end in a 2x2 max pooling.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct VggConfig {
    pub stages: [Vec<usize>; STAGES],
    #[serde(default = "rgb")]
    pub in_channels: usize,
}

fn rgb() -> usize {
    3
}

impl VggConfig {
    pub fn vgg11() -> Self {
        Self::from_counts([1, 1, 2, 2, 2])
    }

    pub fn vgg13() -> Self {
        Self::from_counts([2, 2, 2, 2, 2])
    }

    pub fn vgg16() -> Self {
        Self::from_counts([2, 2, 3, 3, 3])
    }

    pub fn vgg19() -> Self {
        Self::from_counts([2, 2, 4, 4, 4])
    }

    /// Returns the preset with the given name (`vgg11`, `vgg13`, `vgg16` or `vgg19`).
    pub fn preset(name: &str) -> Option<Self> {
        match name {
            "vgg11" => Some(Self::vgg11()),
            "vgg13" => Some(Self::vgg13()),
            "vgg16" => Some(Self::vgg16()),
            "vgg19" => Some(Self::vgg19()),
            _ => None,
        }
    }

    /// A backbone with `convs` convolutions of `width` channels in every stage.
    pub fn uniform(width: usize, convs: usize) -> Self {
        Self {
            stages: std::array::from_fn(|_| vec![width; convs]),
            in_channels: rgb(),
        }
    }

    fn from_counts(counts: [usize; STAGES]) -> Self {
        const WIDTHS: [usize; STAGES] = [64, 128, 256, 512, 512];

        Self {
            stages: std::array::from_fn(|i| vec![WIDTHS[i]; counts[i]]),
            in_channels: rgb(),
        }
    }

    /// Returns the amount of channels at the output of each stage.
    pub fn widths(&self) -> [usize; STAGES] {
        let mut width = self.in_channels;

        std::array::from_fn(|i| {
            width = self.stages[i].last().copied().unwrap_or(width);
            width
        })
    }
}

/// A VGG feature extractor without its fully connected head.
///
/// The forward pass returns the output of every pooling stage, which is what the FCN decoder
/// consumes.
#[derive(Debug, Clone)]
pub struct Vgg {
    layers: Vec<Layer>,
    pools: [usize; STAGES],
}

impl Vgg {
    pub fn new<R: Rng>(config: &VggConfig, rng: &mut R) -> Self {
        let mut layers = Vec::new();
        let mut pools = [0; STAGES];
        let mut channels = config.in_channels;

        for (stage, widths) in config.stages.iter().enumerate() {
            for &width in widths {
                layers.push(Layer::conv3x3((channels, width), rng));
                layers.push(Layer::relu());
                channels = width;
            }

            pools[stage] = layers.len();
            layers.push(Layer::max_pool2d(2));
        }

        Self { layers, pools }
    }

    /// Returns the layers named by their position in the feature extractor.
    pub fn layers_mut(&mut self) -> impl Iterator<Item = (String, &mut Layer)> {
        self.layers
            .iter_mut()
            .enumerate()
            .map(|(i, layer)| (format!("pretrained_net.features.{i}"), layer))
    }

    /// Makes a forward pass through the feature extractor.
    ///
    /// # Returns
    /// The output of each of the pooling stages, from the shallowest to the deepest.
    pub fn forward(&mut self, x: ArrayView4<f32>, mode: Mode) -> Result<Vec<Array4<f32>>> {
        let mut outputs = Vec::with_capacity(STAGES);
        let mut x = x.to_owned();

        for (i, layer) in self.layers.iter_mut().enumerate() {
            x = layer.forward(x.view(), mode)?;

            if self.pools.contains(&i) {
                outputs.push(x.clone());
            }
        }

        Ok(outputs)
    }

    /// Backpropagates the gradients with respect to each pooling stage's output.
    ///
    /// # Arguments
    /// * `grads` - One gradient per stage, from the shallowest to the deepest.
    pub fn backward(&mut self, mut grads: Vec<Array4<f32>>) -> Result<()> {
        if grads.len() != STAGES {
            return Err(MlErr::SizeMismatch {
                what: "backbone stage gradients",
                got: grads.len(),
                expected: STAGES,
            });
        }

        let mut d: Option<Array4<f32>> = None;

        for (i, layer) in self.layers.iter_mut().enumerate().rev() {
            if self.pools.contains(&i) {
                let g = grads.pop().ok_or(MlErr::MissingForwardCache { layer: "vgg" })?;
                d = Some(match d {
                    Some(d) => d + g,
                    None => g,
                });
            }

            if let Some(grad) = d.as_ref() {
                d = Some(layer.backward(grad.view())?);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use rand::{SeedableRng, rngs::StdRng};

    use super::*;

    #[test]
    fn presets_follow_the_torchvision_layouts() {
        let convs = |c: VggConfig| c.stages.iter().map(Vec::len).sum::<usize>();

        assert_eq!(convs(VggConfig::vgg11()), 8);
        assert_eq!(convs(VggConfig::vgg13()), 10);
        assert_eq!(convs(VggConfig::vgg16()), 13);
        assert_eq!(convs(VggConfig::vgg19()), 16);
        assert_eq!(VggConfig::vgg16().widths(), [64, 128, 256, 512, 512]);
        assert!(VggConfig::preset("vgg15").is_none());
    }

    #[test]
    fn layers_are_named_like_the_torchvision_features() {
        let mut vgg = Vgg::new(&VggConfig::vgg16(), &mut StdRng::seed_from_u64(0));
        let names: Vec<_> = vgg.layers_mut().map(|(name, layer)| (name, layer.kind())).collect();

        assert_eq!(names.len(), 31);
        assert_eq!(names[0], ("pretrained_net.features.0".to_string(), "conv2d"));
        assert_eq!(names[4], ("pretrained_net.features.4".to_string(), "max_pool2d"));
        assert_eq!(names[30], ("pretrained_net.features.30".to_string(), "max_pool2d"));
    }

    #[test]
    fn forward_returns_every_stage() {
        let mut vgg = Vgg::new(&VggConfig::uniform(2, 1), &mut StdRng::seed_from_u64(0));
        let x = Array4::ones((1, 3, 32, 64));

        let outputs = vgg.forward(x.view(), Mode::Eval).unwrap();
        let shapes: Vec<_> = outputs.iter().map(|o| o.shape().to_vec()).collect();

        assert_eq!(
            shapes,
            [
                [1, 2, 16, 32],
                [1, 2, 8, 16],
                [1, 2, 4, 8],
                [1, 2, 2, 4],
                [1, 2, 1, 2]
            ]
        );
    }

    #[test]
    fn backward_needs_one_gradient_per_stage() {
        let mut vgg = Vgg::new(&VggConfig::uniform(2, 1), &mut StdRng::seed_from_u64(0));
        let x = Array4::ones((1, 3, 32, 32));

        let outputs = vgg.forward(x.view(), Mode::Train).unwrap();
        assert!(vgg.backward(outputs[..4].to_vec()).is_err());
    }
}
