use ndarray::{Array3, ArrayView, ArrayView3, ArrayView4, Axis, Dimension, Zip, s};

use crate::{MlErr, Result};

/// Returns the index of the highest score along the class axis of `(N, C, H, W)` scores. The
/// first maximum wins on ties.
pub fn argmax_classes(scores: ArrayView4<f32>) -> Array3<usize> {
    let (n, _, h, w) = scores.dim();
    let mut classes = Array3::zeros((n, h, w));

    Zip::indexed(&mut classes).par_for_each(|(b, y, x), class| {
        let mut best = f32::NEG_INFINITY;

        for (c, &score) in scores.slice(s![b, .., y, x]).iter().enumerate() {
            if score > best || c == 0 {
                best = score;
                *class = c;
            }
        }
    });

    classes
}

fn check_shapes<D: Dimension>(
    pred: &ArrayView<usize, D>,
    target: &ArrayView<usize, D>,
) -> Result<()> {
    if pred.shape() != target.shape() {
        return Err(MlErr::SizeMismatch {
            what: "prediction and target",
            got: target.len(),
            expected: pred.len(),
        });
    }

    Ok(())
}

/// Computes the intersection over union of every class.
///
/// # Arguments
/// * `pred` - The predicted class of every position.
/// * `target` - The true class of every position.
/// * `n_class` - The amount of classes.
///
/// # Returns
/// One entry per class, `None` when the class appears in neither the prediction nor the target.
pub fn class_ious<D: Dimension>(
    pred: ArrayView<usize, D>,
    target: ArrayView<usize, D>,
    n_class: usize,
) -> Result<Vec<Option<f32>>> {
    check_shapes(&pred, &target)?;

    // (intersection, predicted, target)
    let mut counts = vec![(0usize, 0usize, 0usize); n_class];

    Zip::from(&pred).and(&target).for_each(|&p, &t| {
        if let Some(c) = counts.get_mut(p) {
            c.1 += 1;
            if p == t {
                c.0 += 1;
            }
        }

        if let Some(c) = counts.get_mut(t) {
            c.2 += 1;
        }
    });

    let ious = counts
        .into_iter()
        .map(|(intersection, predicted, target)| {
            let union = predicted + target - intersection;
            (union > 0).then(|| intersection as f32 / union.max(1) as f32)
        })
        .collect();

    Ok(ious)
}

/// Returns the fraction of positions where the prediction matches the target, `None` if there
/// are no positions at all.
pub fn pixel_accuracy<D: Dimension>(
    pred: ArrayView<usize, D>,
    target: ArrayView<usize, D>,
) -> Result<Option<f32>> {
    check_shapes(&pred, &target)?;

    if pred.is_empty() {
        return Ok(None);
    }

    let correct = Zip::from(&pred)
        .and(&target)
        .fold(0usize, |acc, p, t| acc + (p == t) as usize);

    Ok(Some(correct as f32 / pred.len() as f32))
}

/// Returns the mean of the defined values, `None` if there are none.
pub fn nan_mean<I>(values: I) -> Option<f32>
where
    I: IntoIterator<Item = Option<f32>>,
{
    let (sum, count) = values
        .into_iter()
        .flatten()
        .filter(|v| !v.is_nan())
        .fold((0f64, 0usize), |(sum, count), v| (sum + v as f64, count + 1));

    (count > 0).then(|| (sum / count as f64) as f32)
}

/// The scores of one evaluation pass.
#[derive(Debug, Clone, PartialEq)]
pub struct EpochMetrics {
    /// Mean IoU of every class over the samples where it was defined.
    pub ious: Vec<Option<f32>>,
    /// Mean of the defined per-class IoUs.
    pub mean_iou: Option<f32>,
    /// Mean pixel accuracy over samples.
    pub pixel_accuracy: Option<f32>,
}

/// Accumulates per-sample scores of an evaluation pass.
#[derive(Debug, Clone)]
pub struct EpochAccumulator {
    n_class: usize,
    iou_sums: Vec<f64>,
    iou_counts: Vec<usize>,
    acc_sum: f64,
    samples: usize,
}

impl EpochAccumulator {
    pub fn new(n_class: usize) -> Self {
        Self {
            n_class,
            iou_sums: vec![0.; n_class],
            iou_counts: vec![0; n_class],
            acc_sum: 0.,
            samples: 0,
        }
    }

    /// Scores a single sample.
    pub fn add_sample<D: Dimension>(
        &mut self,
        pred: ArrayView<usize, D>,
        target: ArrayView<usize, D>,
    ) -> Result<()> {
        let ious = class_ious(pred.view(), target.view(), self.n_class)?;

        for (c, iou) in ious.into_iter().enumerate() {
            if let Some(iou) = iou {
                self.iou_sums[c] += iou as f64;
                self.iou_counts[c] += 1;
            }
        }

        if let Some(acc) = pixel_accuracy(pred, target)? {
            self.acc_sum += acc as f64;
            self.samples += 1;
        }

        Ok(())
    }

    /// Scores every sample of a batch of predictions and targets shaped (N, H, W).
    pub fn add_batch(&mut self, pred: ArrayView3<usize>, target: ArrayView3<usize>) -> Result<()> {
        if pred.dim() != target.dim() {
            return Err(MlErr::SizeMismatch {
                what: "prediction and target",
                got: target.len(),
                expected: pred.len(),
            });
        }

        for (p, t) in pred.axis_iter(Axis(0)).zip(target.axis_iter(Axis(0))) {
            self.add_sample(p, t)?;
        }

        Ok(())
    }

    pub fn finish(self) -> EpochMetrics {
        let ious: Vec<_> = self
            .iou_sums
            .iter()
            .zip(&self.iou_counts)
            .map(|(&sum, &count)| (count > 0).then(|| (sum / count as f64) as f32))
            .collect();

        EpochMetrics {
            mean_iou: nan_mean(ious.iter().copied()),
            ious,
            pixel_accuracy: (self.samples > 0).then(|| (self.acc_sum / self.samples as f64) as f32),
        }
    }
}

/// Turns undefined scores into NaN, the representation of the score arrays.
pub fn or_nan(value: Option<f32>) -> f32 {
    value.unwrap_or(f32::NAN)
}

#[cfg(test)]
mod tests {
    use ndarray::{Array, array};
    use rand::{Rng, SeedableRng, rngs::StdRng};

    use super::*;

    #[test]
    fn four_pixel_example() {
        let pred = array![0, 1, 1, 2];
        let target = array![0, 1, 2, 2];

        let ious = class_ious(pred.view(), target.view(), 3).unwrap();
        assert_eq!(ious, [Some(1.0), Some(0.5), Some(0.5)]);

        let acc = pixel_accuracy(pred.view(), target.view()).unwrap();
        assert_eq!(acc, Some(0.75));
    }

    #[test]
    fn identical_prediction_and_target() {
        let pred = array![[0, 1], [1, 0]];

        let ious = class_ious(pred.view(), pred.view(), 3).unwrap();
        assert_eq!(ious, [Some(1.0), Some(1.0), None]);
        assert_eq!(pixel_accuracy(pred.view(), pred.view()).unwrap(), Some(1.0));
    }

    #[test]
    fn disjoint_prediction_and_target() {
        let pred = array![0, 0];
        let target = array![1, 1];

        let ious = class_ious(pred.view(), target.view(), 2).unwrap();
        assert_eq!(ious, [Some(0.0), Some(0.0)]);
        assert_eq!(pixel_accuracy(pred.view(), target.view()).unwrap(), Some(0.0));
    }

    #[test]
    fn labels_out_of_range_count_only_for_pixel_accuracy() {
        let pred = array![0, 1];
        let target = array![0, 5];

        let ious = class_ious(pred.view(), target.view(), 2).unwrap();
        assert_eq!(ious, [Some(1.0), Some(0.0)]);
        assert_eq!(pixel_accuracy(pred.view(), target.view()).unwrap(), Some(0.5));
    }

    #[test]
    fn mismatched_shapes_are_rejected() {
        let pred = array![0, 1];
        let target = array![0, 1, 2];

        assert!(class_ious(pred.view(), target.view(), 3).is_err());
        assert!(pixel_accuracy(pred.view(), target.view()).is_err());
    }

    #[test]
    fn argmax_takes_the_first_maximum() {
        let scores = Array::from_shape_vec(
            (1, 3, 1, 3),
            vec![0.1, 0.5, 0.2, 0.9, 0.5, 0.2, 0.3, 0.1, 0.2],
        )
        .unwrap();

        let classes = argmax_classes(scores.view());
        assert_eq!(classes, Array::from_shape_vec((1, 1, 3), vec![1, 0, 0]).unwrap());
    }

    #[test]
    fn epoch_means_ignore_undefined_entries() {
        let mut acc = EpochAccumulator::new(3);

        // sample 1: class 2 absent, sample 2: class 1 absent
        let pred = array![[[0, 1], [1, 0]], [[0, 2], [2, 2]]];
        let target = array![[[0, 1], [0, 0]], [[0, 2], [2, 0]]];
        acc.add_batch(pred.view(), target.view()).unwrap();

        let metrics = acc.finish();

        // sample 1: iou0 = 2/3, iou1 = 1/2; sample 2: iou0 = 1/2, iou2 = 2/3
        let ious: Vec<_> = metrics.ious.iter().map(|v| v.unwrap()).collect();
        assert!((ious[0] - 7. / 12.).abs() < 1e-6);
        assert!((ious[1] - 0.5).abs() < 1e-6);
        assert!((ious[2] - 2. / 3.).abs() < 1e-6);

        let mean = metrics.mean_iou.unwrap();
        assert!((mean - (7. / 12. + 0.5 + 2. / 3.) / 3.).abs() < 1e-6);
        assert_eq!(metrics.pixel_accuracy, Some(0.75));
    }

    #[test]
    fn scores_stay_within_the_unit_interval() {
        let mut rng = StdRng::seed_from_u64(5);

        for _ in 0..50 {
            let pred = Array::from_shape_fn((4, 4), |_| rng.random_range(0..4));
            let target = Array::from_shape_fn((4, 4), |_| rng.random_range(0..5));

            for iou in class_ious(pred.view(), target.view(), 4).unwrap().into_iter().flatten() {
                assert!((0. ..=1.).contains(&iou), "{iou}");
            }

            let acc = pixel_accuracy(pred.view(), target.view()).unwrap().unwrap();
            let correct = Zip::from(&pred).and(&target).fold(0, |n, p, t| n + (p == t) as usize);
            assert!((0. ..=1.).contains(&acc));
            assert_eq!(acc, correct as f32 / 16.);
        }
    }

    #[test]
    fn nan_mean_of_nothing_is_undefined() {
        assert_eq!(nan_mean([None, None]), None);
        assert_eq!(nan_mean([Some(1.0), None, Some(f32::NAN), Some(3.0)]), Some(2.0));
    }
}
