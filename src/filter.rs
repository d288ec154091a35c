//! Sub-pixel translation and PSF convolution of morphologies.
//!
//! Both are stencils on a flattened image with zero boundary. A source renders its
//! morphology through [`Gamma`], the PSF convolution of a band followed by the translation to the
//! fractional part of the centroid.

use std::f64::consts::PI;
use std::sync::Arc;

use ndarray::{Array1, ArrayView1, ArrayView2, ArrayView3};

use crate::error::{DeblendError, Result};
use crate::{Float, lit};

/// Lanczos order.
const LANCZOS_A: f64 = 3.;
/// Taps of the translation kernel along each axis, `-2..=2`.
const TRANSLATION_RADIUS: isize = 2;

/// A sparse stencil: `result[p] = Σ values[i] · x[p + offsets[i]]`.
///
/// Pixels outside the image count as zero.
#[derive(Clone, Debug, PartialEq)]
pub struct LinearFilter<F> {
    values: Vec<F>,
    offsets: Vec<(isize, isize)>,
}

impl<F: Float> LinearFilter<F> {
    /// Stencil from values at relative `(dy, dx)` offsets. Zero values are dropped.
    pub fn new(
        values: impl IntoIterator<Item = F>,
        offsets: impl IntoIterator<Item = (isize, isize)>,
    ) -> Self {
        let (values, offsets) = values
            .into_iter()
            .zip(offsets)
            .filter(|(value, _)| *value != F::zero())
            .unzip();
        Self { values, offsets }
    }

    /// Convolution with an odd-sized kernel whose center is the central pixel.
    pub fn convolution(kernel: ArrayView2<F>) -> Result<Self> {
        let (height, width) = kernel.dim();
        if height % 2 == 0 || width % 2 == 0 {
            return Err(DeblendError::InvalidKernel(
                "kernel must have an odd number of rows and columns",
            ));
        }
        let (cy, cx) = ((height / 2) as isize, (width / 2) as isize);
        let offsets = kernel
            .indexed_iter()
            .map(|((y, x), _)| (cy - y as isize, cx - x as isize))
            .collect::<Vec<_>>();
        Ok(Self::new(kernel.iter().copied(), offsets))
    }

    /// Lanczos-3 translation that moves the content by `(dy, dx)` pixels.
    ///
    /// Each axis is normalized to unit sum, so integer shifts are exact.
    pub fn translation(dy: F, dx: F) -> Self {
        let taps = -TRANSLATION_RADIUS..=TRANSLATION_RADIUS;
        let kernel = |shift: F| {
            let weights = taps
                .clone()
                .map(|i| lanczos(shift + lit(i as f64)))
                .collect::<Vec<_>>();
            let total = weights.iter().fold(F::zero(), |acc, w| acc + *w);
            weights.into_iter().map(move |w| w / total).collect::<Vec<_>>()
        };
        let (ky, kx) = (kernel(dy), kernel(dx));

        let mut values = Vec::with_capacity(ky.len() * kx.len());
        let mut offsets = Vec::with_capacity(ky.len() * kx.len());
        for (i, wy) in taps.clone().zip(&ky) {
            for (j, wx) in taps.clone().zip(&kx) {
                values.push(*wy * *wx);
                offsets.push((i, j));
            }
        }
        Self::new(values, offsets)
    }

    /// The adjoint stencil.
    pub fn transpose(&self) -> Self {
        Self {
            values: self.values.clone(),
            offsets: self.offsets.iter().map(|&(dy, dx)| (-dy, -dx)).collect(),
        }
    }

    /// Number of non-zero taps.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the stencil maps everything to zero.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Apply the stencil to a flattened image of `shape`.
    pub fn apply(&self, x: ArrayView1<F>, shape: (usize, usize)) -> Array1<F> {
        self.apply_signed(x, shape, 1)
    }

    /// Apply the adjoint stencil to a flattened image of `shape`.
    pub fn transpose_apply(&self, x: ArrayView1<F>, shape: (usize, usize)) -> Array1<F> {
        self.apply_signed(x, shape, -1)
    }

    fn apply_signed(&self, x: ArrayView1<F>, shape: (usize, usize), sign: isize) -> Array1<F> {
        let (height, width) = (shape.0 as isize, shape.1 as isize);
        let mut result = Array1::zeros(x.len());
        for (value, &(dy, dx)) in self.values.iter().zip(&self.offsets) {
            let (dy, dx) = (sign * dy, sign * dx);
            let rows = (-dy).max(0)..height.min(height - dy);
            let cols = (-dx).max(0)..width.min(width - dx);
            for y in rows {
                let target = y * width;
                let source = (y + dy) * width + dx;
                for x_ in cols.clone() {
                    result[(target + x_) as usize] += *value * x[(source + x_) as usize];
                }
            }
        }
        result
    }
}

fn sinc<F: Float>(x: F) -> F {
    if x == F::zero() {
        return F::one();
    }
    // Exact zeros at the integers keep integer shifts free of ringing.
    if x == x.round() {
        return F::zero();
    }
    let px = lit::<F>(PI) * x;
    px.sin() / px
}

fn lanczos<F: Float>(x: F) -> F {
    let a = lit::<F>(LANCZOS_A);
    if x.abs() >= a {
        F::zero()
    } else {
        sinc(x) * sinc(x / a)
    }
}

/// Builds the [`Gamma`] of a source for a given fractional offset.
#[derive(Clone, Debug)]
pub struct GammaOp<F> {
    shape: (usize, usize),
    psfs: Option<Arc<Vec<LinearFilter<F>>>>,
}

impl<F: Float> GammaOp<F> {
    /// Operator for morphologies of `shape` with optional PSF kernels `(1 or bands, height, width)`.
    ///
    /// A single kernel is shared by all bands.
    pub fn new(shape: (usize, usize), psf: Option<ArrayView3<F>>) -> Result<Self> {
        let psfs = psf
            .map(|psf| {
                if psf.is_empty() {
                    return Err(DeblendError::InvalidKernel("no PSF kernel given"));
                }
                psf.outer_iter()
                    .map(LinearFilter::convolution)
                    .collect::<Result<Vec<_>>>()
                    .map(Arc::new)
            })
            .transpose()?;
        Ok(Self { shape, psfs })
    }

    /// Whether a PSF is convolved.
    pub fn has_psf(&self) -> bool {
        self.psfs.is_some()
    }

    /// Number of PSF kernels, zero without PSF.
    pub fn psf_count(&self) -> usize {
        self.psfs.as_ref().map_or(0, |psfs| psfs.len())
    }

    /// Morphology shape `(height, width)`.
    pub fn shape(&self) -> (usize, usize) {
        self.shape
    }

    /// The operator that moves the morphology by `(dy, dx)`.
    pub fn build(&self, dy: F, dx: F) -> Gamma<F> {
        Gamma {
            shape: self.shape,
            translation: LinearFilter::translation(dy, dx),
            psfs: self.psfs.clone(),
        }
    }
}

/// PSF convolution followed by a sub-pixel translation.
#[derive(Clone, Debug)]
pub struct Gamma<F> {
    shape: (usize, usize),
    translation: LinearFilter<F>,
    psfs: Option<Arc<Vec<LinearFilter<F>>>>,
}

impl<F: Float> Gamma<F> {
    fn psf(&self, band: usize) -> Option<&LinearFilter<F>> {
        self.psfs
            .as_ref()
            .and_then(|psfs| psfs.get(if psfs.len() == 1 { 0 } else { band }))
    }

    /// Render a flattened morphology in `band`.
    pub fn apply(&self, band: usize, morph: ArrayView1<F>) -> Array1<F> {
        match self.psf(band) {
            Some(psf) => {
                let convolved = psf.apply(morph, self.shape);
                self.translation.apply(convolved.view(), self.shape)
            }
            None => self.translation.apply(morph, self.shape),
        }
    }

    /// The adjoint of [`Gamma::apply`].
    pub fn transpose_apply(&self, band: usize, image: ArrayView1<F>) -> Array1<F> {
        let moved = self.translation.transpose_apply(image, self.shape);
        match self.psf(band) {
            Some(psf) => psf.transpose_apply(moved.view(), self.shape),
            None => moved,
        }
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;
    use ndarray::{Array3, array};
    use ndarray_rand::RandomExt;
    use ndarray_rand::rand::{SeedableRng, rngs::StdRng};
    use ndarray_rand::rand_distr::Uniform;

    use super::*;

    fn delta(shape: (usize, usize), y: usize, x: usize) -> Array1<f64> {
        let mut image = Array1::zeros(shape.0 * shape.1);
        image[y * shape.1 + x] = 1.;
        image
    }

    #[test]
    fn integer_translation_is_exact() {
        let shape = (5, 5);
        let image = delta(shape, 2, 2);

        let identity = LinearFilter::translation(0., 0.);
        assert_eq!(identity.len(), 1);
        assert_eq!(identity.apply(image.view(), shape), image);

        let moved = LinearFilter::translation(1., -1.).apply(image.view(), shape);
        assert_abs_diff_eq!(moved, delta(shape, 3, 1), epsilon = 1e-15);
    }

    #[test]
    fn translation_preserves_flux() {
        let shape = (9, 9);
        let image = delta(shape, 4, 4);
        let moved = LinearFilter::translation(0.3, 0.7).apply(image.view(), shape);
        assert_abs_diff_eq!(moved.sum(), 1., epsilon = 1e-12);
        // Content moves toward larger coordinates.
        assert!(moved[5 * 9 + 5] > moved[3 * 9 + 3]);
    }

    #[test]
    fn transpose_is_adjoint() {
        let shape = (6, 7);
        let mut rng = StdRng::seed_from_u64(7);
        let x = Array1::random_using(42, Uniform::new(-1., 1.), &mut rng);
        let y = Array1::random_using(42, Uniform::new(-1., 1.), &mut rng);

        let psf = array![[0., 0.1, 0.], [0.1, 0.5, 0.2], [0., 0.1, 0.]];
        let filters = [
            LinearFilter::translation(0.3, -0.6),
            LinearFilter::convolution(psf.view()).unwrap(),
        ];
        for filter in filters {
            let lhs = filter.apply(x.view(), shape).dot(&y);
            let rhs = x.dot(&filter.transpose_apply(y.view(), shape));
            assert_abs_diff_eq!(lhs, rhs, epsilon = 1e-12);
            assert_eq!(
                filter.transpose().apply(y.view(), shape),
                filter.transpose_apply(y.view(), shape)
            );
        }
    }

    #[test]
    fn convolution_orientation() {
        let kernel = array![[0., 0., 0.], [0., 0.5, 0.5], [0., 0., 0.]];
        let filter = LinearFilter::convolution(kernel.view()).unwrap();
        let shape = (3, 3);
        // A delta is spread toward +x, like the kernel.
        let result = filter.apply(delta(shape, 1, 1).view(), shape);
        assert_eq!(result, array![0., 0., 0., 0., 0.5, 0.5, 0., 0., 0.]);

        let even = Array3::<f64>::zeros((1, 2, 3));
        assert!(GammaOp::new(shape, Some(even.view())).is_err());
    }

    #[test]
    fn gamma_per_band() {
        let shape = (5, 5);
        let mut psfs = Array3::zeros((2, 3, 3));
        psfs[[0, 1, 1]] = 1.;
        psfs[[1, 1, 2]] = 1.;
        let op = GammaOp::new(shape, Some(psfs.view())).unwrap();
        assert_eq!(op.psf_count(), 2);

        let gamma = op.build(0., 0.);
        let image = delta(shape, 2, 2);
        assert_eq!(gamma.apply(0, image.view()), image);
        assert_eq!(gamma.apply(1, image.view()), delta(shape, 2, 3));
        assert_eq!(gamma.transpose_apply(1, delta(shape, 2, 3).view()), image);
    }
}
