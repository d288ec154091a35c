//! Sources: the SEDs and morphologies of all components of one object.

use std::sync::Arc;

use log::info;
use ndarray::{Array1, Array2, Array3, ArrayView1, ArrayView2, ArrayView3, Axis, s};

use crate::bsdmm::LinearConstraint;
use crate::constraints::{Constraint, ConstraintSet};
use crate::error::{DeblendError, Result};
use crate::filter::{Gamma, GammaOp};
use crate::geometry::BoundingBox;
use crate::ndarray_utils::median;
use crate::proximal::Proximal;
use crate::registry::{MonotonicOrder, OperatorRegistry};
use crate::{Float, lit, to_f64};

/// Added to the central pixel of a PSF-convolved initial morphology.
const TINY: f64 = 1e-10;

/// Configuration of a [`Source`].
///
/// Every parameter except the center and the box size has a default, so a source only needs
/// `SourceBuilder::new(center, size).build(&registry)`.
#[derive(Clone, Debug)]
pub struct SourceBuilder<F> {
    center: (F, F),
    size: (usize, usize),
    components: Option<usize>,
    sed: Option<Array2<F>>,
    morph: Option<Array2<F>>,
    psf: Option<Array3<F>>,
    constraints: ConstraintSet<F>,
    fix_sed: Vec<bool>,
    fix_morph: Vec<bool>,
    shift_center: F,
    sed_prox: Option<Proximal<F>>,
    morph_prox: Option<Proximal<F>>,
}

impl<F: Float> SourceBuilder<F> {
    /// A source centered at `(y, x)` with a box of `(height, width)` pixels.
    ///
    /// Even box sizes are rounded up to the next odd size.
    pub fn new(center: (F, F), size: (usize, usize)) -> Self {
        Self {
            center,
            size,
            components: None,
            sed: None,
            morph: None,
            psf: None,
            constraints: ConstraintSet::new(),
            fix_sed: vec![false],
            fix_morph: vec![false],
            shift_center: lit(0.2),
            sed_prox: None,
            morph_prox: None,
        }
    }

    /// Number of components. Defaults to the rows of the SED or morphology, else 1.
    pub fn with_components(mut self, components: usize) -> Self {
        self.components = Some(components);
        self
    }

    /// Initial SEDs, `(components, bands)`.
    pub fn with_sed(mut self, sed: Array2<F>) -> Self {
        self.sed = Some(sed);
        self
    }

    /// Initial morphologies, `(components, box pixels)` in row-major order.
    pub fn with_morph(mut self, morph: Array2<F>) -> Self {
        self.morph = Some(morph);
        self
    }

    /// PSF kernels `(1 or bands, height, width)`, odd and centered.
    pub fn with_psf(mut self, psf: Array3<F>) -> Self {
        self.psf = Some(psf);
        self
    }

    /// Constraints on the morphologies.
    pub fn with_constraints(mut self, constraints: ConstraintSet<F>) -> Self {
        self.constraints = constraints;
        self
    }

    /// Keep the SEDs fixed, one flag for all components or one per component.
    pub fn with_fixed_sed(mut self, fixed: impl IntoIterator<Item = bool>) -> Self {
        self.fix_sed = fixed.into_iter().collect();
        self
    }

    /// Keep the morphologies fixed, one flag for all components or one per component.
    pub fn with_fixed_morph(mut self, fixed: impl IntoIterator<Item = bool>) -> Self {
        self.fix_morph = fixed.into_iter().collect();
        self
    }

    /// Finite difference step of position updates in pixels. Zero keeps the center fixed.
    pub fn with_shift_center(mut self, shift_center: F) -> Self {
        self.shift_center = shift_center;
        self
    }

    /// Projection of the SEDs, [`Proximal::UnityPlus`] by default.
    pub fn with_sed_prox(mut self, prox: Proximal<F>) -> Self {
        self.sed_prox = Some(prox);
        self
    }

    /// Projection of the morphologies.
    ///
    /// Replaces the projection derived from the constraints. Linear constraints still apply.
    pub fn with_morph_prox(mut self, prox: Proximal<F>) -> Self {
        self.morph_prox = Some(prox);
        self
    }

    /// Validate the configuration and resolve the constraints.
    pub fn build(self, registry: &OperatorRegistry<F>) -> Result<Source<F>> {
        let k = self
            .components
            .or_else(|| self.sed.as_ref().map(|sed| sed.nrows()))
            .or_else(|| self.morph.as_ref().map(|morph| morph.nrows()))
            .unwrap_or(1);
        if k == 0 {
            return Err(DeblendError::ComponentMismatch {
                what: "source",
                expected: 1,
                actual: 0,
            });
        }

        let bbox = BoundingBox::centered(floor_center(self.center), self.size);
        let shape = bbox.shape();

        let sed = match self.sed {
            Some(sed) if sed.nrows() != k => {
                return Err(DeblendError::ComponentMismatch {
                    what: "sed",
                    expected: k,
                    actual: sed.nrows(),
                });
            }
            Some(sed) => sed,
            None => Array2::zeros((k, 0)),
        };
        let morph = match self.morph {
            Some(morph) if morph.nrows() != k => {
                return Err(DeblendError::ComponentMismatch {
                    what: "morph",
                    expected: k,
                    actual: morph.nrows(),
                });
            }
            Some(morph) if morph.ncols() != bbox.len() => {
                return Err(DeblendError::ShapeMismatch {
                    what: "morph",
                    expected: vec![k, bbox.len()],
                    actual: morph.shape().to_vec(),
                });
            }
            Some(morph) => morph,
            None => Array2::zeros((k, bbox.len())),
        };
        let fix_sed = broadcast_flags("fixed sed flags", self.fix_sed, k)?;
        let fix_morph = broadcast_flags("fixed morph flags", self.fix_morph, k)?;

        let gamma_op = GammaOp::new(shape, self.psf.as_ref().map(|psf| psf.view()))?;
        let resolved = self.constraints.resolve(registry, shape);
        let morph_prox = match self.morph_prox {
            Some(prox) => {
                info!("morphology projection set explicitly");
                prox
            }
            None => resolved.prox,
        };

        let mut source = Source {
            center: self.center,
            bbox,
            gamma: gamma_op.build(F::zero(), F::zero()),
            gamma_op,
            sed,
            morph,
            fix_sed,
            fix_morph,
            shift_center: self.shift_center,
            sed_prox: vec![self.sed_prox.unwrap_or(Proximal::UnityPlus); k],
            morph_prox: vec![morph_prox; k],
            morph_constraints: resolved.constraints,
            monotonic_order: registry.monotonic_order(shape),
            constraints: self.constraints,
        };
        if source.bands() > 0 {
            source.check_bands(source.bands())?;
        }
        source.set_center(self.center);
        Ok(source)
    }
}

fn floor_center<F: Float>(center: (F, F)) -> (isize, isize) {
    (
        to_f64(center.0.floor()) as isize,
        to_f64(center.1.floor()) as isize,
    )
}

fn broadcast_flags(what: &'static str, flags: Vec<bool>, k: usize) -> Result<Vec<bool>> {
    match flags.len() {
        1 => Ok(vec![flags[0]; k]),
        n if n == k => Ok(flags),
        n => Err(DeblendError::ComponentMismatch {
            what,
            expected: k,
            actual: n,
        }),
    }
}

/// One object of the scene, modeled as `K` components within a bounding box.
///
/// Component `k` contributes `sed[k] ⊗ Γ(morph[k])` to the model, where `Γ` applies the PSF
/// and the sub-pixel offset of the center. The SEDs are `(K, bands)`, the morphologies
/// `(K, box pixels)`.
#[derive(Clone, Debug)]
pub struct Source<F> {
    center: (F, F),
    bbox: BoundingBox,
    gamma_op: GammaOp<F>,
    gamma: Gamma<F>,
    sed: Array2<F>,
    morph: Array2<F>,
    fix_sed: Vec<bool>,
    fix_morph: Vec<bool>,
    shift_center: F,
    sed_prox: Vec<Proximal<F>>,
    morph_prox: Vec<Proximal<F>>,
    morph_constraints: Vec<LinearConstraint<F>>,
    monotonic_order: Arc<MonotonicOrder>,
    constraints: ConstraintSet<F>,
}

impl<F: Float> Source<F> {
    /// Number of components.
    pub fn k(&self) -> usize {
        self.sed.nrows()
    }

    /// Number of bands, zero before the SEDs are initialized.
    pub fn bands(&self) -> usize {
        self.sed.ncols()
    }

    /// Box shape `(height, width)`.
    pub fn shape(&self) -> (usize, usize) {
        self.bbox.shape()
    }

    /// Center `(y, x)` in image pixels.
    pub fn center(&self) -> (F, F) {
        self.center
    }

    /// Integer part of the center.
    pub fn center_int(&self) -> (isize, isize) {
        floor_center(self.center)
    }

    /// The bounding box in the image frame.
    pub fn bbox(&self) -> &BoundingBox {
        &self.bbox
    }

    /// SEDs `(K, bands)`.
    pub fn sed(&self) -> ArrayView2<'_, F> {
        self.sed.view()
    }

    /// Morphologies `(K, box pixels)`.
    pub fn morph(&self) -> ArrayView2<'_, F> {
        self.morph.view()
    }

    /// Morphology of component `l` as an image.
    pub fn morph_image(&self, l: usize) -> Option<ArrayView2<'_, F>> {
        if l >= self.k() {
            return None;
        }
        self.morph.row(l).into_shape_with_order(self.shape()).ok()
    }

    /// Whether the SED of component `l` is fixed.
    pub fn is_sed_fixed(&self, l: usize) -> bool {
        self.fix_sed.get(l).copied().unwrap_or(true)
    }

    /// Whether the morphology of component `l` is fixed.
    pub fn is_morph_fixed(&self, l: usize) -> bool {
        self.fix_morph.get(l).copied().unwrap_or(true)
    }

    /// Finite difference step of position updates, zero if the center is fixed.
    pub fn shift_center(&self) -> F {
        self.shift_center
    }

    /// The constraints this source was built with.
    pub fn constraints(&self) -> &ConstraintSet<F> {
        &self.constraints
    }

    /// SED projection of component `l`.
    pub fn sed_prox(&self, l: usize) -> &Proximal<F> {
        &self.sed_prox[l]
    }

    /// Morphology projection of component `l`.
    pub fn morph_prox(&self, l: usize) -> &Proximal<F> {
        &self.morph_prox[l]
    }

    /// Linear constraints shared by all morphologies.
    pub fn morph_constraints(&self) -> &[LinearConstraint<F>] {
        &self.morph_constraints
    }

    /// The rendering operator at the current center.
    pub fn gamma(&self) -> &Gamma<F> {
        &self.gamma
    }

    /// The rendering operator with the center moved by an extra `(dy, dx)`.
    pub(crate) fn shifted_gamma(&self, dy: F, dx: F) -> Gamma<F> {
        let (fy, fx) = self.fraction();
        self.gamma_op.build(fy + dy, fx + dx)
    }

    fn fraction(&self) -> (F, F) {
        (
            self.center.0 - self.center.0.floor(),
            self.center.1 - self.center.1.floor(),
        )
    }

    /// Move the center, keeping the box size. The box may leave the image.
    pub fn set_center(&mut self, center: (F, F)) {
        self.center = center;
        self.bbox = BoundingBox::centered(floor_center(center), self.bbox.shape());
        let (dy, dx) = self.fraction();
        self.gamma = self.gamma_op.build(dy, dx);
    }

    pub(crate) fn check_bands(&self, bands: usize) -> Result<()> {
        if self.bands() != bands {
            return Err(DeblendError::ShapeMismatch {
                what: "sed",
                expected: vec![self.k(), bands],
                actual: self.sed.shape().to_vec(),
            });
        }
        let psfs = self.gamma_op.psf_count();
        if psfs > 1 && psfs != bands {
            return Err(DeblendError::ComponentMismatch {
                what: "psf",
                expected: bands,
                actual: psfs,
            });
        }
        Ok(())
    }

    pub(crate) fn set_sed(&mut self, l: usize, sed: ArrayView1<F>) {
        self.sed.row_mut(l).assign(&sed);
    }

    pub(crate) fn set_morph(&mut self, l: usize, morph: ArrayView1<F>) {
        self.morph.row_mut(l).assign(&morph);
    }

    pub(crate) fn set_morph_threshold(&mut self, l: usize, thresh: F) -> bool {
        self.morph_prox[l].set_threshold(thresh)
    }

    /// Initialize the free SEDs and morphologies from the images `(bands, height, width)`.
    ///
    /// The SED is the normalized pixel at the center. Without PSF the morphology is the
    /// band sum of the box, made monotonic; with PSF it is a single central pixel holding the flux.
    /// Further components share the SED and an equal part of the morphology.
    pub fn init_source(&mut self, images: ArrayView3<F>) -> Result<()> {
        let (bands, height, width) = images.dim();
        let (cy, cx) = self.center_int();
        if cy < 0 || cx < 0 || cy >= height as isize || cx >= width as isize {
            return Err(DeblendError::CenterOutsideImage {
                y: to_f64(self.center.0),
                x: to_f64(self.center.1),
                height,
                width,
            });
        }
        if self.bands() == 0 {
            self.sed = Array2::zeros((self.k(), bands));
        }
        self.check_bands(bands)?;

        let peak = images.slice(s![.., cy as usize, cx as usize]);
        let mut sed = peak.to_owned();
        Proximal::UnityPlus.apply(sed.view_mut(), F::zero());

        let (box_height, box_width) = self.shape();
        let morph = if self.gamma_op.has_psf() {
            let mut morph = Array1::zeros(self.bbox.len());
            morph[(box_height / 2) * box_width + box_width / 2] = peak.sum() + lit(TINY);
            morph
        } else {
            let mut morph = self.bbox.extract(images).sum_axis(Axis(0));
            match self.morph_prox[0].strict_monotonic() {
                Some(prox) => prox.apply(morph.view_mut(), F::zero()),
                None => Proximal::StrictMonotonic {
                    order: Arc::clone(&self.monotonic_order),
                    thresh: F::one() / lit(box_height.min(box_width) as f64),
                }
                .apply(morph.view_mut(), F::zero()),
            }
            morph
        };

        let share = morph / lit::<F>(self.k() as f64);
        for l in 0..self.k() {
            if !self.fix_sed[l] {
                self.sed.row_mut(l).assign(&sed);
            }
            if !self.fix_morph[l] {
                self.morph.row_mut(l).assign(&share);
            }
        }
        Ok(())
    }

    /// Morphology of component `l` rendered in `band`.
    pub fn rendered_morph(&self, l: usize, band: usize) -> Array1<F> {
        self.gamma.apply(band, self.morph.row(l))
    }

    /// Per component models `(bands, box pixels)`.
    pub fn component_models(&self) -> Vec<Array2<F>> {
        self.component_models_with(&self.gamma)
    }

    pub(crate) fn component_models_with(&self, gamma: &Gamma<F>) -> Vec<Array2<F>> {
        let per_band = self.gamma_op.psf_count() > 1;
        self.sed
            .outer_iter()
            .zip(self.morph.outer_iter())
            .map(|(sed, morph)| {
                let mut model = Array2::zeros((self.bands(), self.bbox.len()));
                let shared = (!per_band).then(|| gamma.apply(0, morph));
                for (b, mut row) in model.outer_iter_mut().enumerate() {
                    let own;
                    let rendered = match &shared {
                        Some(rendered) => rendered,
                        None => {
                            own = gamma.apply(b, morph);
                            &own
                        }
                    };
                    row.zip_mut_with(rendered, |m, &r| *m = sed[b] * r);
                }
                model
            })
            .collect()
    }

    /// Model of all components `(bands, box pixels)`.
    pub fn model(&self) -> Array2<F> {
        self.model_with(&self.gamma)
    }

    pub(crate) fn model_with(&self, gamma: &Gamma<F>) -> Array2<F> {
        self.component_models_with(gamma)
            .into_iter()
            .reduce(|acc, model| acc + model)
            .unwrap_or_else(|| Array2::zeros((self.bands(), self.bbox.len())))
    }

    /// Model of all components in an image of `(bands, height, width)`.
    pub fn model_image(&self, shape: (usize, usize, usize)) -> Array3<F> {
        let mut image = Array3::zeros(shape);
        self.bbox.add_into(self.model().view(), image.view_mut());
        image
    }

    /// Cut the box out of a `(bands, height, width)` cube.
    pub fn extract(&self, cube: ArrayView3<F>) -> Array2<F> {
        self.bbox.extract(cube)
    }

    /// Morphology uncertainties `(K, box pixels)` for inverse-variance weights.
    ///
    /// Every component is treated on its own: `(Σ_b w_b sed_b²)^-½` per pixel. A joint
    /// inversion over all components would amplify the errors of nearly collinear SEDs.
    /// Pixels without weight get an infinite error.
    pub fn morph_error(&self, weights: ArrayView3<F>) -> Array2<F> {
        let w = self.bbox.extract(weights);
        let mut errors = Array2::zeros((self.k(), self.bbox.len()));
        for (sed, mut error) in self.sed.outer_iter().zip(errors.outer_iter_mut()) {
            let sed_sq = sed.mapv(|a| a * a);
            for (p, e) in error.iter_mut().enumerate() {
                *e = inverse_sqrt(w.column(p).dot(&sed_sq));
            }
        }
        errors
    }

    /// SED uncertainties `(K, bands)` for inverse-variance weights, per component
    /// `(Σ_p w_p morph_p²)^-½`.
    pub fn sed_error(&self, weights: ArrayView3<F>) -> Array2<F> {
        let w = self.bbox.extract(weights);
        let mut errors = Array2::zeros((self.k(), self.bands()));
        for (morph, mut error) in self.morph.outer_iter().zip(errors.outer_iter_mut()) {
            let morph_sq = morph.mapv(|s| s * s);
            for (b, e) in error.iter_mut().enumerate() {
                *e = inverse_sqrt(w.row(b).dot(&morph_sq));
            }
        }
        errors
    }

    /// Set the sparsity thresholds from the noise level of the morphologies.
    ///
    /// The median morphology error of every component times the `l0`/`l1` scale becomes the
    /// threshold of its projection. Returns the thresholds, zero without sparsity constraint.
    pub fn set_morph_sparsity(&mut self, weights: ArrayView3<F>) -> Array1<F> {
        let scale = match self.constraints.sparsity() {
            Some(Constraint::L0 { scale } | Constraint::L1 { scale }) => scale,
            _ => return Array1::zeros(self.k()),
        };
        let errors = self.morph_error(weights);
        let thresholds = errors
            .outer_iter()
            .map(|error| median(error.iter().copied().filter(|e| e.is_finite())) * scale)
            .collect::<Array1<F>>();
        for (l, &thresh) in thresholds.iter().enumerate() {
            self.set_morph_threshold(l, thresh);
        }
        thresholds
    }
}

fn inverse_sqrt<F: Float>(x: F) -> F {
    if x > F::zero() {
        F::one() / x.sqrt()
    } else {
        lit(f64::INFINITY)
    }
}
