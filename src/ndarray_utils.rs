//! A collection of various utilities needed in this library.
//! The two main groups are `ndarray` to `nalgebra` conversions
//! and common reductions on arrays.

use std::cmp::Ordering;

use itertools::Itertools;
use nalgebra::{DMatrix, SymmetricEigen};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, ArrayView3, Axis};

use crate::{Float, lit};

pub(crate) trait IntoDMatrix {
    type Out;

    fn into_dmatrix(self) -> Self::Out;
}

impl<F: Float> IntoDMatrix for ArrayView2<'_, F> {
    type Out = DMatrix<F>;

    fn into_dmatrix(self) -> Self::Out {
        let (rows, cols) = self.dim();
        DMatrix::from_row_iterator(rows, cols, self.iter().copied())
    }
}

/// Median of a set of values. Empty input has median zero.
pub(crate) fn median<F: Float>(values: impl IntoIterator<Item = F>) -> F {
    let values = values
        .into_iter()
        .sorted_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal))
        .collect_vec();
    let n = values.len();
    if n == 0 {
        F::zero()
    } else if n % 2 == 1 {
        values[n / 2]
    } else {
        (values[n / 2 - 1] + values[n / 2]) / lit(2.)
    }
}

/// Median over the band axis for every pixel of a `(bands, height, width)` cube.
pub(crate) fn median_bands<F: Float>(cube: ArrayView3<F>) -> Array2<F> {
    cube.map_axis(Axis(0), |pixel| median(pixel.iter().copied()))
}

/// Median over all pixels of every band of a `(bands, height, width)` cube.
pub(crate) fn median_pixels<F: Float>(cube: ArrayView3<F>) -> Array1<F> {
    cube.outer_iter()
        .map(|band| median(band.iter().copied()))
        .collect()
}

pub(crate) fn max<F: Float>(values: impl IntoIterator<Item = F>) -> Option<F> {
    values.into_iter().reduce(|a, b| a.max(b))
}

pub(crate) fn argmax<F>(arr: ArrayView1<'_, F>) -> usize
where
    F: Float,
{
    arr.indexed_iter()
        .reduce(|acc, f| if acc.1 >= f.1 { acc } else { f })
        .map_or(0, |(idx, _)| idx)
}

pub(crate) fn norm_sq<F: Float>(arr: ArrayView1<F>) -> F {
    arr.iter().fold(F::zero(), |acc, x| acc + *x * *x)
}

pub(crate) fn norm<F: Float>(arr: ArrayView1<F>) -> F {
    norm_sq(arr).sqrt()
}

/// Largest eigenvalue of a symmetric positive semi-definite matrix.
///
/// This is the squared spectral norm of `M` for a Gram matrix `M Mᵀ`.
pub(crate) fn max_eigenvalue<F: Float>(gram: ArrayView2<F>) -> F {
    if gram.is_empty() {
        return F::zero();
    }
    let eigen = SymmetricEigen::new(gram.into_dmatrix());
    max(eigen.eigenvalues.iter().copied())
        .unwrap_or_else(F::zero)
        .max(F::zero())
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;
    use ndarray::{Array3, array};

    use super::*;

    #[test]
    fn array_to_dmatrix() {
        let arr = array![[1., 2., 3.], [4., 5., 6.]];
        let matrix = arr.view().into_dmatrix();

        assert_eq!(matrix, nalgebra::dmatrix![1., 2., 3.; 4., 5., 6.]);
    }

    #[test]
    fn median_odd_and_even() {
        assert_eq!(median([3., 1., 2.]), 2.);
        assert_eq!(median([4., 1., 2., 3.]), 2.5);
        assert_eq!(median(Vec::<f64>::new()), 0.);
    }

    #[test]
    fn median_axes() {
        let mut cube = Array3::zeros((3, 2, 2));
        cube.index_axis_mut(Axis(0), 0).fill(1.);
        cube.index_axis_mut(Axis(0), 1).fill(5.);
        cube.index_axis_mut(Axis(0), 2).fill(2.);
        cube[[2, 1, 1]] = 9.;

        let per_pixel = median_bands(cube.view());
        assert_eq!(per_pixel, array![[2., 2.], [2., 5.]]);

        let per_band = median_pixels(cube.view());
        assert_eq!(per_band, array![1., 5., 2.]);
    }

    #[test]
    fn argmax_first_maximum() {
        let arr = array![0., 3., 1., 3.];
        assert_eq!(argmax(arr.view()), 1);
    }

    #[test]
    fn gram_eigenvalue() {
        let a = array![[1., 0.], [0., 2.], [0., 0.]];
        let gram = a.t().dot(&a);
        assert_abs_diff_eq!(max_eigenvalue(gram.view()), 4., epsilon = 1e-12);
    }
}
