//! Linear operators acting on flattened images.

use std::sync::OnceLock;

use ndarray::{Array1, Array2, ArrayView1};
use sprs::{CsMat, TriMat};

use crate::ndarray_utils::norm;
use crate::{Float, lit};

const POWER_ITERATIONS: usize = 200;
const POWER_TOLERANCE: f64 = 1e-10;

#[derive(Clone, Debug)]
enum Kind<F> {
    /// Maps everything to zero.
    Null,
    Identity,
    Sparse(CsMat<F>),
}

/// A linear map `L` between flattened images, stored as a CSR matrix.
///
/// Operators are immutable once built, so they can be cached and shared between sources
/// with the same box shape. The spectral norm is computed once on first use.
#[derive(Debug)]
pub struct LinearOperator<F> {
    rows: usize,
    cols: usize,
    kind: Kind<F>,
    spectral_norm: OnceLock<F>,
    half_spaces: OnceLock<Vec<HalfSpace<F>>>,
}

/// A non-zero row `g` of an operator with `‖g‖²`, bounding the half-space `g · x ≤ 0`.
#[derive(Clone, Debug)]
pub(crate) struct HalfSpace<F> {
    pub(crate) entries: Vec<(usize, F)>,
    pub(crate) norm_sq: F,
}

impl<F: Float> LinearOperator<F> {
    /// The zero map on vectors of length `size`. It is the operator of an unconstrained block.
    pub fn null(size: usize) -> Self {
        Self {
            rows: size,
            cols: size,
            kind: Kind::Null,
            spectral_norm: OnceLock::from(F::zero()),
            half_spaces: OnceLock::new(),
        }
    }

    /// The identity on vectors of length `size`.
    pub fn identity(size: usize) -> Self {
        Self {
            rows: size,
            cols: size,
            kind: Kind::Identity,
            spectral_norm: OnceLock::from(F::one()),
            half_spaces: OnceLock::new(),
        }
    }

    /// Assemble a `(rows, cols)` operator from `(row, col, value)` triplets.
    ///
    /// Duplicate entries are summed.
    pub fn from_triplets(
        rows: usize,
        cols: usize,
        triplets: impl IntoIterator<Item = (usize, usize, F)>,
    ) -> Self {
        let mut matrix = TriMat::new((rows, cols));
        for (row, col, value) in triplets {
            matrix.add_triplet(row, col, value);
        }
        Self {
            rows,
            cols,
            kind: Kind::Sparse(matrix.to_csr()),
            spectral_norm: OnceLock::new(),
            half_spaces: OnceLock::new(),
        }
    }

    /// Number of output entries.
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Number of input entries.
    pub fn cols(&self) -> usize {
        self.cols
    }

    /// Whether this is the zero map.
    pub fn is_null(&self) -> bool {
        matches!(self.kind, Kind::Null)
    }

    /// Computes `L x`.
    pub fn apply(&self, x: ArrayView1<F>) -> Array1<F> {
        match &self.kind {
            Kind::Null => Array1::zeros(self.rows),
            Kind::Identity => x.to_owned(),
            Kind::Sparse(matrix) => matrix * &x,
        }
    }

    /// Computes `Lᵀ x`.
    pub fn transpose_apply(&self, x: ArrayView1<F>) -> Array1<F> {
        match &self.kind {
            Kind::Null => Array1::zeros(self.cols),
            Kind::Identity => x.to_owned(),
            Kind::Sparse(matrix) => &matrix.transpose_view() * &x,
        }
    }

    /// Non-zero entries `(col, value)` of row `i`.
    pub fn row(&self, i: usize) -> Vec<(usize, F)> {
        match &self.kind {
            Kind::Null => Vec::new(),
            Kind::Identity => vec![(i, F::one())],
            Kind::Sparse(matrix) => matrix
                .outer_view(i)
                .map(|row| row.iter().map(|(col, value)| (col, *value)).collect())
                .unwrap_or_default(),
        }
    }

    /// The non-zero rows with their squared norms, built once on first use.
    pub(crate) fn half_spaces(&self) -> &[HalfSpace<F>] {
        self.half_spaces.get_or_init(|| {
            (0..self.rows)
                .map(|i| {
                    let entries = self.row(i);
                    let norm_sq = entries.iter().fold(F::zero(), |acc, (_, g)| acc + *g * *g);
                    HalfSpace { entries, norm_sq }
                })
                .filter(|half_space| half_space.norm_sq > F::zero())
                .collect()
        })
    }

    /// The largest singular value of `L`.
    ///
    /// Computed by power iteration on `LᵀL` and cached.
    pub fn spectral_norm(&self) -> F {
        *self.spectral_norm.get_or_init(|| self.power_iteration())
    }

    fn power_iteration(&self) -> F {
        // Deterministic start vector that is neither constant nor symmetric.
        let golden = lit::<F>(0.618_033_988_749_895);
        let mut v: Array1<F> = (0..self.cols)
            .map(|i| {
                let t = lit::<F>((i + 1) as f64) * golden;
                t - t.floor() + lit(0.5)
            })
            .collect();
        let v_norm = norm(v.view());
        if v_norm == F::zero() {
            return F::zero();
        }
        v /= v_norm;

        let mut eigenvalue = F::zero();
        for _ in 0..POWER_ITERATIONS {
            let w = self.transpose_apply(self.apply(v.view()).view());
            let w_norm = norm(w.view());
            if w_norm == F::zero() {
                return F::zero();
            }
            let change = (w_norm - eigenvalue).abs();
            eigenvalue = w_norm;
            v = w / w_norm;
            if change <= lit::<F>(POWER_TOLERANCE) * eigenvalue {
                break;
            }
        }

        // Rayleigh quotient of the final vector.
        let lv = self.apply(v.view());
        lv.dot(&lv).max(F::zero()).sqrt()
    }

    /// Dense matrix of the operator.
    pub fn to_dense(&self) -> Array2<F> {
        match &self.kind {
            Kind::Null => Array2::zeros((self.rows, self.cols)),
            Kind::Identity => Array2::eye(self.rows),
            Kind::Sparse(matrix) => matrix.to_dense(),
        }
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    use super::*;

    fn example() -> LinearOperator<f64> {
        LinearOperator::from_triplets(
            2,
            3,
            [(0, 0, 1.), (0, 2, 2.), (1, 1, -1.), (1, 1, -2.)],
        )
    }

    #[test]
    fn sparse_apply_and_transpose() {
        let op = example();
        assert_eq!(op.to_dense(), array![[1., 0., 2.], [0., -3., 0.]]);
        assert_eq!(op.apply(array![1., 2., 3.].view()), array![7., -6.]);
        assert_eq!(op.transpose_apply(array![1., 2.].view()), array![1., -6., 2.]);
        assert_eq!(op.row(0), vec![(0, 1.), (2, 2.)]);
    }

    #[test]
    fn sparse_products_match_dense() {
        let op = LinearOperator::from_triplets(
            4,
            5,
            [(0, 4, 0.5), (1, 0, -1.), (1, 3, 2.), (3, 1, 1.5), (3, 1, 0.5), (3, 2, -4.)],
        );
        let dense = op.to_dense();
        let x = array![1., -2., 0.5, 3., 4.];
        let y = array![2., 1., -1., 0.5];
        assert_abs_diff_eq!(op.apply(x.view()), dense.dot(&x), epsilon = 1e-12);
        assert_abs_diff_eq!(op.transpose_apply(y.view()), dense.t().dot(&y), epsilon = 1e-12);
    }

    #[test]
    fn half_spaces_skip_empty_rows() {
        let op = LinearOperator::from_triplets(3, 3, [(0, 0, 3.), (0, 1, 4.), (2, 2, -1.)]);
        let half_spaces = op.half_spaces();
        assert_eq!(half_spaces.len(), 2);
        assert_eq!(half_spaces[0].entries, vec![(0, 3.), (1, 4.)]);
        assert_eq!(half_spaces[0].norm_sq, 25.);
        assert_eq!(half_spaces[1].norm_sq, 1.);
        // Built once and reused.
        assert!(std::ptr::eq(half_spaces, op.half_spaces()));
        assert!(LinearOperator::<f64>::null(3).half_spaces().is_empty());
    }

    #[test]
    fn spectral_norm_of_sparse_matrix() {
        let op = example();
        // Singular values are 3 and sqrt(5).
        assert_abs_diff_eq!(op.spectral_norm(), 3., epsilon = 1e-6);
    }

    #[test]
    fn null_and_identity() {
        let null = LinearOperator::<f64>::null(3);
        let x = array![1., -2., 3.];
        assert_eq!(null.apply(x.view()), Array1::<f64>::zeros(3));
        assert_eq!(null.transpose_apply(x.view()), Array1::<f64>::zeros(3));
        assert_eq!(null.spectral_norm(), 0.);
        assert!(null.row(1).is_empty());

        let identity = LinearOperator::<f64>::identity(3);
        assert_eq!(identity.apply(x.view()), x);
        assert_eq!(identity.spectral_norm(), 1.);
    }
}
