use ndarray::{Array4, ArrayView4, Axis, Zip};

use crate::{MlErr, Result, arch::Mode};

#[derive(Debug, Clone)]
struct Forward {
    argmax: Array4<(usize, usize)>,
    input_dim: (usize, usize, usize, usize),
}

/// Non-overlapping max pooling with a square window.
#[derive(Debug, Clone)]
pub struct MaxPool2d {
    size: usize,
    fwd: Option<Forward>,
}

impl MaxPool2d {
    /// Creates a new `MaxPool2d` whose window size equals its stride.
    pub fn new(size: usize) -> Self {
        Self {
            size: size.max(1),
            fwd: None,
        }
    }

    pub fn forward(&mut self, x: ArrayView4<f32>, mode: Mode) -> Result<Array4<f32>> {
        let (n, c, h, w) = x.dim();
        let k = self.size;
        let (oh, ow) = (h / k, w / k);

        if oh == 0 || ow == 0 {
            return Err(MlErr::InvalidInput(format!(
                "a {k}x{k} pooling window doesn't fit a {h}x{w} input"
            )));
        }

        let mut y = Array4::zeros((n, c, oh, ow));
        let mut argmax = Array4::from_elem((n, c, oh, ow), (0, 0));

        Zip::from(y.axis_iter_mut(Axis(1)))
            .and(argmax.axis_iter_mut(Axis(1)))
            .and(x.axis_iter(Axis(1)))
            .par_for_each(|mut y, mut argmax, x| {
                for ((b, oy, ox), out) in y.indexed_iter_mut() {
                    let mut best = (oy * k, ox * k);
                    for iy in oy * k..(oy + 1) * k {
                        for ix in ox * k..(ox + 1) * k {
                            if x[[b, iy, ix]] > x[[b, best.0, best.1]] {
                                best = (iy, ix);
                            }
                        }
                    }

                    *out = x[[b, best.0, best.1]];
                    argmax[[b, oy, ox]] = best;
                }
            });

        self.fwd = (mode == Mode::Train).then(|| Forward {
            argmax,
            input_dim: (n, c, h, w),
        });

        Ok(y)
    }

    pub fn backward(&mut self, d: ArrayView4<f32>) -> Result<Array4<f32>> {
        let Forward { argmax, input_dim } = self
            .fwd
            .take()
            .ok_or(MlErr::MissingForwardCache { layer: "max_pool2d" })?;

        if argmax.dim() != d.dim() {
            return Err(MlErr::SizeMismatch {
                what: "max_pool2d gradient",
                got: d.len(),
                expected: argmax.len(),
            });
        }

        let mut dx = Array4::zeros(input_dim);
        for ((b, ci, oy, ox), &(iy, ix)) in argmax.indexed_iter() {
            dx[[b, ci, iy, ix]] += d[[b, ci, oy, ox]];
        }

        Ok(dx)
    }
}

#[cfg(test)]
mod tests {
    use ndarray::Array;

    use super::*;

    #[test]
    fn pools_the_maximum_of_each_window() {
        let mut pool = MaxPool2d::new(2);
        let x = Array::from_shape_vec(
            (1, 1, 2, 4),
            vec![1., 5., 2., 0., 3., 4., 7., 6.],
        )
        .unwrap();

        let y = pool.forward(x.view(), Mode::Train).unwrap();
        assert_eq!(y.iter().copied().collect::<Vec<_>>(), [5., 7.]);

        let d = Array::from_shape_vec((1, 1, 1, 2), vec![1., 2.]).unwrap();
        let dx = pool.backward(d.view()).unwrap();
        assert_eq!(
            dx.iter().copied().collect::<Vec<_>>(),
            [0., 1., 0., 0., 0., 0., 2., 0.]
        );
    }

    #[test]
    fn odd_sizes_drop_the_last_row_and_column() {
        let mut pool = MaxPool2d::new(2);
        let x = Array4::ones((2, 3, 5, 7));

        let y = pool.forward(x.view(), Mode::Eval).unwrap();
        assert_eq!(y.shape(), [2, 3, 2, 3]);
    }

    #[test]
    fn too_small_inputs_are_rejected() {
        let mut pool = MaxPool2d::new(2);
        let x = Array4::ones((1, 1, 1, 4));

        assert!(matches!(pool.forward(x.view(), Mode::Eval), Err(MlErr::InvalidInput(_))));
    }
}
