use ndarray::{Array2, Array4, ArrayView2, ArrayView4, Axis, Zip};

use crate::Result;

/// The geometry of a square sliding window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub kernel: usize,
    pub stride: usize,
    pub padding: usize,
}

impl Window {
    pub fn new(kernel: usize, stride: usize, padding: usize) -> Self {
        Self {
            kernel,
            stride: stride.max(1),
            padding,
        }
    }

    /// Returns how many window positions fit along an axis of length `len`, or `None` if the
    /// kernel doesn't fit at all.
    pub fn out_len(&self, len: usize) -> Option<usize> {
        (len + 2 * self.padding)
            .checked_sub(self.kernel)
            .map(|span| span / self.stride + 1)
    }

    /// Maps an output position and a kernel offset to an input position, `None` if it falls on
    /// the padding.
    #[inline]
    fn source(&self, out: usize, offset: usize, len: usize) -> Option<usize> {
        (out * self.stride + offset)
            .checked_sub(self.padding)
            .filter(|&i| i < len)
    }
}

/// Unfolds every window of `x` (N, C, H, W) into a column.
///
/// # Returns
/// A (C * k * k, N * oh * ow) matrix, where `(oh, ow)` is the amount of window positions.
pub fn im2col(x: ArrayView4<f32>, window: Window, (oh, ow): (usize, usize)) -> Array2<f32> {
    let (n, c, h, w) = x.dim();
    let k = window.kernel;
    let mut cols = Array2::zeros((c * k * k, n * oh * ow));

    Zip::indexed(cols.rows_mut()).par_for_each(|row, mut col| {
        let ci = row / (k * k);
        let ki = (row / k) % k;
        let kj = row % k;

        for b in 0..n {
            for oy in 0..oh {
                let Some(iy) = window.source(oy, ki, h) else {
                    continue;
                };

                for ox in 0..ow {
                    if let Some(ix) = window.source(ox, kj, w) {
                        col[(b * oh + oy) * ow + ox] = x[[b, ci, iy, ix]];
                    }
                }
            }
        }
    });

    cols
}

/// Folds the columns produced by `im2col` back into an (N, C, H, W) array, summing the values
/// of overlapping windows.
pub fn col2im(
    cols: ArrayView2<f32>,
    window: Window,
    (n, c, h, w): (usize, usize, usize, usize),
    (oh, ow): (usize, usize),
) -> Array4<f32> {
    let k = window.kernel;
    let mut x = Array4::zeros((n, c, h, w));

    Zip::indexed(x.axis_iter_mut(Axis(1))).par_for_each(|ci, mut plane| {
        for ki in 0..k {
            for kj in 0..k {
                let row = cols.row((ci * k + ki) * k + kj);

                for b in 0..n {
                    for oy in 0..oh {
                        let Some(iy) = window.source(oy, ki, h) else {
                            continue;
                        };

                        for ox in 0..ow {
                            if let Some(ix) = window.source(ox, kj, w) {
                                plane[[b, iy, ix]] += row[(b * oh + oy) * ow + ox];
                            }
                        }
                    }
                }
            }
        }
    });

    x
}

/// Lays an (N, C, H, W) array out as a (C, N * H * W) matrix.
pub fn to_channel_major(x: ArrayView4<f32>) -> Result<Array2<f32>> {
    let (n, c, h, w) = x.dim();
    let m = x
        .permuted_axes([1, 0, 2, 3])
        .as_standard_layout()
        .into_owned()
        .into_shape_with_order((c, n * h * w))?;

    Ok(m)
}

/// Inverse of `to_channel_major`.
pub fn from_channel_major(
    m: Array2<f32>,
    (n, c, h, w): (usize, usize, usize, usize),
) -> Result<Array4<f32>> {
    let x = m
        .into_shape_with_order((c, n, h, w))?
        .permuted_axes([1, 0, 2, 3])
        .as_standard_layout()
        .into_owned();

    Ok(x)
}

#[cfg(test)]
mod tests {
    use ndarray::Array;

    use super::*;

    #[test]
    fn out_len_follows_the_convolution_arithmetic() {
        assert_eq!(Window::new(3, 1, 1).out_len(8), Some(8));
        assert_eq!(Window::new(2, 2, 0).out_len(7), Some(3));
        assert_eq!(Window::new(3, 2, 1).out_len(8), Some(4));
        assert_eq!(Window::new(5, 1, 0).out_len(3), None);
    }

    #[test]
    fn im2col_unfolds_padded_windows() {
        let x = Array::from_shape_vec((1, 1, 2, 2), vec![1., 2., 3., 4.]).unwrap();
        let window = Window::new(2, 1, 0);

        let cols = im2col(x.view(), window, (1, 1));
        assert_eq!(cols.shape(), [4, 1]);
        assert_eq!(cols.column(0).to_vec(), [1., 2., 3., 4.]);

        let padded = Window::new(3, 1, 1);
        let cols = im2col(x.view(), padded, (2, 2));
        assert_eq!(cols.shape(), [9, 4]);
        // center tap sees every pixel, top-left tap only sees x[0, 0] from output (1, 1)
        assert_eq!(cols.row(4).to_vec(), [1., 2., 3., 4.]);
        assert_eq!(cols.row(0).to_vec(), [0., 0., 0., 1.]);
    }

    #[test]
    fn col2im_sums_overlapping_windows() {
        let window = Window::new(2, 1, 0);
        let cols = Array2::ones((4, 4));

        let x = col2im(cols.view(), window, (1, 1, 3, 3), (2, 2));

        let expected = [1., 2., 1., 2., 4., 2., 1., 2., 1.];
        assert_eq!(x.iter().copied().collect::<Vec<_>>(), expected);
    }

    #[test]
    fn channel_major_round_trips() {
        let x = Array::from_shape_fn((2, 3, 2, 2), |(n, c, h, w)| {
            (n * 100 + c * 10 + h * 2 + w) as f32
        });

        let m = to_channel_major(x.view()).unwrap();
        assert_eq!(m.shape(), [3, 8]);
        assert_eq!(m[[1, 4]], 110.);

        let back = from_channel_major(m, (2, 3, 2, 2)).unwrap();
        assert_eq!(back, x);
    }
}
