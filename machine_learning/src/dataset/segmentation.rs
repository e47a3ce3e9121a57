use std::path::{Path, PathBuf};

use ndarray::{Array2, Array3};
use rand::Rng;
use serde::Deserialize;

use super::Sample;
use crate::{MlErr, Result};

/// Per-channel RGB means of the images the VGG backbone was pretrained on, in `[0, 1]`.
pub const MEANS: [f32; 3] = [123.68 / 255., 116.779 / 255., 103.939 / 255.];

#[derive(Debug, Deserialize)]
struct Row {
    img: String,
    label: String,
}

/// A semantic segmentation dataset described by a CSV file with an `img` and a `label` column.
///
/// `img` points to an RGB image and `label` to a single channel image of the same size whose
/// pixel values are class indices.
#[derive(Debug, Clone)]
pub struct SegmentationDataset {
    entries: Vec<(PathBuf, PathBuf)>,
    n_class: usize,
    crop: Option<(usize, usize)>,
    flip_rate: f32,
}

impl SegmentationDataset {
    /// Reads the dataset descriptor at `csv_path`. Relative paths are resolved against the
    /// descriptor's directory.
    ///
    /// # Arguments
    /// * `csv_path` - The path of the descriptor.
    /// * `n_class` - The amount of classes of the one-hot targets.
    /// * `crop` - The (height, width) of a random crop applied to every sample, if any.
    /// * `flip_rate` - The probability of flipping a sample horizontally.
    pub fn from_csv<P: AsRef<Path>>(
        csv_path: P,
        n_class: usize,
        crop: Option<(usize, usize)>,
        flip_rate: f32,
    ) -> Result<Self> {
        let csv_path = csv_path.as_ref();
        let root = csv_path.parent().unwrap_or(Path::new(""));

        let mut reader = csv::Reader::from_path(csv_path)?;
        let entries = reader
            .deserialize()
            .map(|row| {
                let Row { img, label } = row?;
                Ok((root.join(img.trim()), root.join(label.trim())))
            })
            .collect::<Result<Vec<_>>>()?;

        Self::new(entries, n_class, crop, flip_rate)
    }

    pub fn new(
        entries: Vec<(PathBuf, PathBuf)>,
        n_class: usize,
        crop: Option<(usize, usize)>,
        flip_rate: f32,
    ) -> Result<Self> {
        if !(0. ..=1.).contains(&flip_rate) {
            return Err(MlErr::InvalidInput(format!(
                "flip rate must be in [0, 1], got {flip_rate}"
            )));
        }

        if let Some((0, _) | (_, 0)) = crop {
            return Err(MlErr::InvalidInput("crop size must be positive".into()));
        }

        Ok(Self {
            entries,
            n_class,
            crop,
            flip_rate,
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Loads and preprocesses the sample at `index`: random crop, random horizontal flip,
    /// mean subtraction and one-hot encoding of the labels. Labels outside `[0, n_class)` get an
    /// all-zero target.
    pub fn load<R: Rng>(&self, index: usize, rng: &mut R) -> Result<Sample> {
        let (img_path, label_path) = self.entries.get(index).ok_or_else(|| {
            MlErr::InvalidInput(format!("sample {index} out of {} samples", self.len()))
        })?;

        let img = image::open(img_path)?.to_rgb8();
        let label = image::open(label_path)?.to_luma8();

        if img.dimensions() != label.dimensions() {
            return Err(MlErr::InvalidInput(format!(
                "{} is {:?} but its label is {:?}",
                img_path.display(),
                img.dimensions(),
                label.dimensions()
            )));
        }

        let (w, h) = (img.width() as usize, img.height() as usize);
        let (ch, cw) = self.crop.unwrap_or((h, w));

        if ch > h || cw > w {
            return Err(MlErr::InvalidInput(format!(
                "can't crop {ch}x{cw} out of the {h}x{w} image {}",
                img_path.display()
            )));
        }

        let top = rng.random_range(0..=h - ch);
        let left = rng.random_range(0..=w - cw);
        let flip = self.flip_rate > 0. && rng.random_bool(self.flip_rate as f64);

        let mut x = Array3::zeros((3, ch, cw));
        let mut y = Array3::zeros((self.n_class, ch, cw));
        let mut l = Array2::zeros((ch, cw));

        for r in 0..ch {
            for c in 0..cw {
                let src = if flip { left + cw - 1 - c } else { left + c };
                let (sx, sy) = (src as u32, (top + r) as u32);

                let rgb = img.get_pixel(sx, sy);
                for (k, mean) in MEANS.iter().enumerate() {
                    x[[k, r, c]] = rgb[k] as f32 / 255. - mean;
                }

                let class = label.get_pixel(sx, sy)[0] as usize;
                l[[r, c]] = class;
                if class < self.n_class {
                    y[[class, r, c]] = 1.;
                }
            }
        }

        Ok(Sample { x, y, l })
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use image::{GrayImage, Luma, Rgb, RgbImage};
    use rand::{SeedableRng, rngs::StdRng};

    use super::*;

    fn write_sample(dir: &Path, name: &str, labels: &[u8], w: u32, h: u32) {
        let img = RgbImage::from_fn(w, h, |x, _| Rgb([(x * 10) as u8, 255, 0]));
        img.save(dir.join(format!("{name}.png"))).unwrap();

        let label = GrayImage::from_fn(w, h, |x, y| Luma([labels[(y * w + x) as usize]]));
        label.save(dir.join(format!("{name}_label.png"))).unwrap();
    }

    #[test]
    fn loads_a_csv_described_dataset() {
        let dir = tempfile::tempdir().unwrap();
        write_sample(dir.path(), "a", &[0, 1, 2, 9], 2, 2);
        fs::write(dir.path().join("train.csv"), "img,label\na.png,a_label.png\n").unwrap();

        let dataset =
            SegmentationDataset::from_csv(dir.path().join("train.csv"), 3, None, 0.).unwrap();
        assert_eq!(dataset.len(), 1);

        let sample = dataset.load(0, &mut StdRng::seed_from_u64(0)).unwrap();
        assert_eq!(sample.x.shape(), [3, 2, 2]);
        assert_eq!(sample.y.shape(), [3, 2, 2]);
        assert_eq!(sample.l, Array2::from_shape_vec((2, 2), vec![0, 1, 2, 9]).unwrap());

        // green is saturated everywhere
        assert!((sample.x[[1, 0, 0]] - (1. - MEANS[1])).abs() < 1e-6);

        // one-hot, the out of range label gets no class
        assert_eq!(sample.y[[0, 0, 0]], 1.);
        assert_eq!(sample.y[[1, 0, 1]], 1.);
        assert_eq!(sample.y[[2, 1, 0]], 1.);
        assert_eq!(sample.y.sum(), 3.);
    }

    #[test]
    fn flipping_mirrors_the_columns() {
        let dir = tempfile::tempdir().unwrap();
        write_sample(dir.path(), "a", &[0, 1, 1, 0, 0, 1], 3, 2);

        let entries = vec![(dir.path().join("a.png"), dir.path().join("a_label.png"))];
        let dataset = SegmentationDataset::new(entries, 2, None, 1.).unwrap();

        let sample = dataset.load(0, &mut StdRng::seed_from_u64(0)).unwrap();
        assert_eq!(sample.l, Array2::from_shape_vec((2, 3), vec![1, 1, 0, 1, 0, 0]).unwrap());
        assert!((sample.x[[0, 0, 0]] - (20. / 255. - MEANS[0])).abs() < 1e-6);
    }

    #[test]
    fn random_crops_stay_inside_the_image() {
        let dir = tempfile::tempdir().unwrap();
        write_sample(dir.path(), "a", &[0; 16], 4, 4);

        let entries = vec![(dir.path().join("a.png"), dir.path().join("a_label.png"))];
        let dataset = SegmentationDataset::new(entries.clone(), 2, Some((2, 3)), 0.5).unwrap();

        let mut rng = StdRng::seed_from_u64(1);
        for _ in 0..10 {
            let sample = dataset.load(0, &mut rng).unwrap();
            assert_eq!(sample.x.shape(), [3, 2, 3]);
        }

        let too_big = SegmentationDataset::new(entries, 2, Some((5, 1)), 0.).unwrap();
        assert!(too_big.load(0, &mut rng).is_err());
    }

    #[test]
    fn invalid_settings_are_rejected() {
        assert!(SegmentationDataset::new(Vec::new(), 2, None, 1.5).is_err());
        assert!(SegmentationDataset::new(Vec::new(), 2, Some((0, 4)), 0.).is_err());
    }
}
