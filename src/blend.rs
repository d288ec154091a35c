//! The blend: all sources of a scene and the loop that fits them to an observation.
//!
//! Components are numbered `0..K` over all sources. Block `k < K` is the SED of component `k`,
//! block `K + k` its morphology. Every iteration updates one group of blocks after the other,
//! in the [`UpdateOrder`] of the blend. Within a group all blocks see the same residual.

use std::ops::ControlFlow;

use itertools::Itertools;
use log::{debug, info, warn};
use nalgebra::{Matrix2, Vector2};
use ndarray::{Array1, Array2, Array3, ArrayView3, Axis, Zip};

use crate::bsdmm::{BlockState, BlockStep, ConvergenceCriterion, LinearConstraint, RelativeChange};
use crate::error::{DeblendError, Result};
use crate::geometry::flatten;
use crate::ndarray_utils::{argmax, max, median_bands, median_pixels};
use crate::observation::Observation;
use crate::source::Source;
use crate::steps;
use crate::{Float, lit, to_f64};

/// SED entries at most this large are not divided out of the cached models.
const SED_EPSILON: f64 = 1e-10;

/// Which group of blocks is updated first in every iteration.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum UpdateOrder {
    /// SEDs, then morphologies.
    SedFirst,
    /// Morphologies, then SEDs.
    #[default]
    MorphFirst,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Group {
    Sed,
    Morph,
}

impl UpdateOrder {
    fn groups(self) -> [Group; 2] {
        match self {
            Self::SedFirst => [Group::Sed, Group::Morph],
            Self::MorphFirst => [Group::Morph, Group::Sed],
        }
    }
}

/// State reported after every iteration.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct IterationStatus<F> {
    /// Number of iterations since the data was set.
    pub iteration: usize,
    /// Loss of the observation at the current model.
    pub loss: F,
    /// Step size of the SED blocks.
    pub step_sed: F,
    /// Step size of the morphology blocks.
    pub step_morph: F,
    /// Every block changed less than its tolerance and no center moved.
    pub converged: bool,
}

/// The inverse-variance weights and the two normalizations derived from them.
#[derive(Clone, Debug)]
struct Weights<F> {
    base: Option<Array3<F>>,
    sed: Option<Array3<F>>,
    morph: Option<Array3<F>>,
}

impl<F: Float> Weights<F> {
    fn uniform() -> Self {
        Self {
            base: None,
            sed: None,
            morph: None,
        }
    }

    /// For the morphologies every pixel is normalized by its median over the bands, so the bands
    /// with large weights dominate. For the SEDs every band is normalized by its median over the
    /// pixels, and pixels with a vanishing weight in any band are masked in all bands.
    fn new(weights: ArrayView3<F>) -> Self {
        let per_pixel = median_bands(weights);
        let mut morph = weights.to_owned();
        for mut band in morph.outer_iter_mut() {
            Zip::from(&mut band).and(&per_pixel).for_each(|w, &norm| {
                if norm > F::zero() {
                    *w /= norm;
                }
            });
        }

        let per_band = median_pixels(weights);
        let mut sed = weights.to_owned();
        for (mut band, &norm) in sed.outer_iter_mut().zip(&per_band) {
            if norm > F::zero() {
                band /= norm;
            }
        }
        let masked = weights.map_axis(Axis(0), |pixel| pixel.iter().any(|&w| w <= F::zero()));
        for mut band in sed.outer_iter_mut() {
            Zip::from(&mut band).and(&masked).for_each(|w, &masked| {
                if masked {
                    *w = F::zero();
                }
            });
        }

        Self {
            base: Some(weights.to_owned()),
            sed: Some(sed),
            morph: Some(morph),
        }
    }

    fn group(&self, group: Group) -> Option<&Array3<F>> {
        match group {
            Group::Sed => self.sed.as_ref(),
            Group::Morph => self.morph.as_ref(),
        }
    }

    fn max(&self, group: Group) -> F {
        self.group(group)
            .and_then(|weights| max(weights.iter().copied()))
            .unwrap_or_else(F::one)
    }
}

/// All sources of a scene and the state of their joint fit.
///
/// Use `with_` functions to set parameters, then [`fit`](Blend::fit) an observation.
pub struct Blend<F: Float> {
    sources: Vec<Source<F>>,
    /// `(source, component)` of every component.
    source_of: Vec<(usize, usize)>,
    observation: Option<Box<dyn Observation<F>>>,
    /// `(bands, height, width)` of the observation.
    shape: (usize, usize, usize),
    weights: Weights<F>,
    /// Per component models in the frame of their box, `(bands, box pixels)`.
    models: Vec<Array2<F>>,
    model: Array3<F>,
    residual: Array3<F>,
    blocks: Vec<BlockState<F>>,
    it: usize,
    step_sed: F,
    step_morph: F,
    e_rel: F,
    e_abs: Vec<F>,
    center_min_dist: F,
    center_wait: usize,
    center_skip: usize,
    update_order: UpdateOrder,
    slack: F,
    accelerated: bool,
    init_sources: bool,
    convergence: Box<dyn ConvergenceCriterion<F>>,
}

impl<F: Float> Blend<F> {
    /// Collect the sources of a scene. At least one source is required.
    pub fn new(sources: Vec<Source<F>>) -> Result<Self> {
        if sources.is_empty() {
            return Err(DeblendError::EmptyBlend);
        }
        let source_of = sources
            .iter()
            .enumerate()
            .flat_map(|(m, source)| (0..source.k()).map(move |l| (m, l)))
            .collect_vec();

        Ok(Self {
            sources,
            source_of,
            observation: None,
            shape: (0, 0, 0),
            weights: Weights::uniform(),
            models: Vec::new(),
            model: Array3::zeros((0, 0, 0)),
            residual: Array3::zeros((0, 0, 0)),
            blocks: Vec::new(),
            it: 0,
            step_sed: F::zero(),
            step_morph: F::zero(),
            e_rel: lit(1e-2),
            e_abs: Vec::new(),
            center_min_dist: lit(1e-3),
            center_wait: 10,
            center_skip: 10,
            update_order: UpdateOrder::default(),
            slack: lit(0.9),
            accelerated: true,
            init_sources: true,
            convergence: Box::new(RelativeChange),
        })
    }

    /// Set which group of blocks is updated first.
    pub fn with_update_order(mut self, update_order: UpdateOrder) -> Self {
        self.update_order = update_order;
        self
    }

    /// Set the relative change of the blocks below which the fit stops.
    pub fn with_relative_tolerance(mut self, e_rel: F) -> Self {
        self.e_rel = e_rel;
        self
    }

    /// Set the fraction of the Lipschitz step size used for the gradient steps.
    pub fn with_slack(mut self, slack: F) -> Self {
        self.slack = slack;
        self
    }

    /// Extrapolate blocks without linear constraints from their previous iterate.
    pub fn with_accelerated(mut self, accelerated: bool) -> Self {
        self.accelerated = accelerated;
        self
    }

    /// Initialize the sources from the images when data is set.
    pub fn with_init_sources(mut self, init_sources: bool) -> Self {
        self.init_sources = init_sources;
        self
    }

    /// Set the smallest center correction that is applied.
    pub fn with_center_min_dist(mut self, min_dist: F) -> Self {
        self.center_min_dist = min_dist;
        self
    }

    /// Set the number of iterations before the first position update.
    pub fn with_center_wait(mut self, wait: usize) -> Self {
        self.center_wait = wait;
        self
    }

    /// Set the number of iterations between position updates.
    pub fn with_center_skip(mut self, skip: usize) -> Self {
        self.center_skip = skip.max(1);
        self
    }

    /// Set the convergence criterion of the blocks.
    pub fn with_convergence<C: ConvergenceCriterion<F> + 'static>(mut self, convergence: C) -> Self {
        self.convergence = Box::new(convergence);
        self
    }

    /// Number of components over all sources.
    pub fn k(&self) -> usize {
        self.source_of.len()
    }

    /// Number of bands, zero before data is set.
    pub fn bands(&self) -> usize {
        self.shape.0
    }

    /// Iterations since the data was set.
    pub fn iterations(&self) -> usize {
        self.it
    }

    /// The sources of the blend.
    pub fn sources(&self) -> &[Source<F>] {
        &self.sources
    }

    /// Consume the blend and return its sources.
    pub fn into_sources(self) -> Vec<Source<F>> {
        self.sources
    }

    /// `(source, component)` of component `k`.
    pub fn source_of(&self, k: usize) -> Option<(usize, usize)> {
        self.source_of.get(k).copied()
    }

    /// Component number of component `l` of source `m`.
    pub fn component_of(&self, m: usize, l: usize) -> Result<usize> {
        self.source_of
            .iter()
            .position(|&pair| pair == (m, l))
            .ok_or(DeblendError::ComponentIndex {
                source_index: m,
                component: l,
            })
    }

    fn observation(&self) -> Result<&dyn Observation<F>> {
        self.observation.as_deref().ok_or(DeblendError::NoData)
    }

    /// Bind an observation to the blend and reset the fit.
    ///
    /// Derives the SED and morphology weights, initializes the sources (unless disabled) and
    /// sets the sparsity thresholds and absolute tolerances from the weights.
    pub fn set_data(&mut self, observation: impl Observation<F> + 'static) -> Result<()> {
        let images = observation.images();
        let shape = images.dim();
        self.weights = match observation.weights() {
            Some(weights) if weights.dim() != shape => {
                return Err(DeblendError::ShapeMismatch {
                    what: "weights",
                    expected: images.shape().to_vec(),
                    actual: weights.shape().to_vec(),
                });
            }
            Some(weights) => Weights::new(weights),
            None => Weights::uniform(),
        };

        if self.init_sources {
            for source in &mut self.sources {
                source.init_source(images)?;
            }
        }
        for source in &self.sources {
            source.check_bands(shape.0)?;
        }

        let components = self.k();
        let mut e_abs = vec![self.e_rel / lit(shape.0.max(1) as f64); components];
        e_abs.resize(2 * components, F::zero());
        if let Some(weights) = &self.weights.base {
            let morph_std = self
                .sources
                .iter_mut()
                .map(|source| source.set_morph_sparsity(weights.view()))
                .collect_vec();
            for (k, &(m, l)) in self.source_of.iter().enumerate() {
                e_abs[components + k] = self.e_rel * morph_std[m][l];
            }
        }
        self.e_abs = e_abs;

        self.observation = Some(Box::new(observation));
        self.shape = shape;
        self.it = 0;
        self.blocks = vec![BlockState::default(); 2 * components];
        self.refresh_model();
        info!(
            "Data set for {} sources with {} components in {} bands.",
            self.sources.len(),
            components,
            shape.0
        );
        Ok(())
    }

    /// Set the data and run up to `max_iter` iterations.
    pub fn fit(
        &mut self,
        observation: impl Observation<F> + 'static,
        max_iter: usize,
    ) -> Result<IterationStatus<F>> {
        self.fit_with(observation, max_iter, |_| ControlFlow::Continue(()))
    }

    /// Like [`fit`](Blend::fit), polling `callback` after every iteration.
    ///
    /// The fit stops early when the callback breaks.
    pub fn fit_with<C>(
        &mut self,
        observation: impl Observation<F> + 'static,
        max_iter: usize,
        callback: C,
    ) -> Result<IterationStatus<F>>
    where
        C: FnMut(&IterationStatus<F>) -> ControlFlow<()>,
    {
        self.set_data(observation)?;
        self.step_with(max_iter, callback)
    }

    /// Continue the fit for up to `max_iter` iterations.
    pub fn step(&mut self, max_iter: usize) -> Result<IterationStatus<F>> {
        self.step_with(max_iter, |_| ControlFlow::Continue(()))
    }

    /// Like [`step`](Blend::step), polling `callback` after every iteration.
    pub fn step_with<C>(&mut self, max_iter: usize, mut callback: C) -> Result<IterationStatus<F>>
    where
        C: FnMut(&IterationStatus<F>) -> ControlFlow<()>,
    {
        // The model is current: set_data and every iteration end with a refresh.
        self.observation()?;
        let mut status = self.status(false)?;

        for _ in 0..max_iter {
            let mut converged = true;
            let mut moved = false;
            for (i, group) in self.update_order.groups().into_iter().enumerate() {
                if i > 0 {
                    self.refresh_model();
                } else {
                    if self.update_centers()
                        && self.it >= self.center_wait
                        && self.it % self.center_skip == 0
                    {
                        moved = self.update_positions()?;
                        if moved {
                            self.refresh_model();
                        }
                    }
                    self.it += 1;
                }
                converged &= self.update_group(group)?;
            }

            self.refresh_model();
            status = self.status(converged && !moved)?;
            debug!(
                "Iteration {}: loss {:.6e}, steps {:.3e} (sed) {:.3e} (morph).",
                status.iteration,
                to_f64(status.loss),
                to_f64(status.step_sed),
                to_f64(status.step_morph)
            );
            let stop = callback(&status).is_break();
            if status.converged {
                info!("Converged after {} iterations.", self.it);
                break;
            }
            if stop {
                info!("Fit stopped after {} iterations.", self.it);
                break;
            }
        }
        Ok(status)
    }

    fn status(&self, converged: bool) -> Result<IterationStatus<F>> {
        Ok(IterationStatus {
            iteration: self.it,
            loss: self.observation()?.loss(self.model.view()),
            step_sed: self.step_sed,
            step_morph: self.step_morph,
            converged,
        })
    }

    fn update_centers(&self) -> bool {
        self.sources
            .iter()
            .any(|source| source.shift_center() != F::zero())
    }

    fn refresh_model(&mut self) {
        self.models = self
            .sources
            .iter()
            .flat_map(Source::component_models)
            .collect();
        self.model = self.combine(&self.models);
    }

    fn combine(&self, models: &[Array2<F>]) -> Array3<F> {
        let mut image = Array3::zeros(self.shape);
        for (model, &(m, _)) in models.iter().zip(&self.source_of) {
            self.sources[m]
                .bbox()
                .add_into(model.view(), image.view_mut());
        }
        image
    }

    fn weighted_residual(
        observation: &dyn Observation<F>,
        model: ArrayView3<F>,
        weights: Option<&Array3<F>>,
    ) -> Array3<F> {
        let mut residual = observation.render(model) - &observation.images();
        if let Some(weights) = weights {
            residual *= weights;
        }
        residual
    }

    /// Update all blocks of a group from the residual at the start of the group.
    fn update_group(&mut self, group: Group) -> Result<bool> {
        self.residual = Self::weighted_residual(
            self.observation()?,
            self.model.view(),
            self.weights.group(group),
        );

        let components = self.k();
        let step_f = match group {
            Group::Sed => {
                self.step_sed = self.sed_step();
                self.step_sed
            }
            Group::Morph => {
                self.step_morph = self.morph_step();
                self.step_morph
            }
        };
        let omega = if self.accelerated {
            let t = lit::<F>(self.it as f64);
            t / (t + lit(3.))
        } else {
            F::zero()
        };
        let step = BlockStep {
            step_f,
            omega,
            blocks: 2 * components,
            e_rel: self.e_rel,
            e_abs: F::zero(),
        };

        let mut converged = true;
        for k in 0..components {
            let (m, l) = self.source_of[k];
            let j = match group {
                Group::Sed => k,
                Group::Morph => components + k,
            };
            let source = &self.sources[m];
            let (fixed, x, prox, constraints): (_, _, _, &[LinearConstraint<F>]) = match group {
                Group::Sed => (
                    source.is_sed_fixed(l),
                    source.sed().row(l).to_owned(),
                    source.sed_prox(l),
                    &[],
                ),
                Group::Morph => (
                    source.is_morph_fixed(l),
                    source.morph().row(l).to_owned(),
                    source.morph_prox(l),
                    source.morph_constraints(),
                ),
            };
            if fixed {
                continue;
            }

            let grad = self.block_gradient(j, &self.models, self.residual.view());
            let e_abs = self.e_abs[j];
            let update = self.blocks[j].update(
                x.view(),
                grad.view(),
                prox,
                constraints,
                BlockStep { e_abs, ..step },
            );
            converged &= update.constraints_converged
                && self
                    .convergence
                    .converged(x.view(), update.x.view(), self.e_rel, e_abs);

            match group {
                Group::Sed => self.sources[m].set_sed(l, update.x.view()),
                Group::Morph => self.sources[m].set_morph(l, update.x.view()),
            }
        }
        Ok(converged)
    }

    /// Gradient of the loss with respect to block `j`, given the component models and the
    /// weighted residual of its group.
    fn block_gradient(&self, j: usize, models: &[Array2<F>], residual: ArrayView3<F>) -> Array1<F> {
        let components = self.k();
        let k = j % components;
        let (m, l) = self.source_of[k];
        let source = &self.sources[m];
        let diff = source.extract(residual);
        let seds = source.sed();
        let sed = seds.row(l);

        if j < components {
            // The model of band b is sed[b] times the rendered morphology.
            let epsilon = lit::<F>(SED_EPSILON);
            (0..source.bands())
                .map(|b| {
                    let rendered = if sed[b].abs() > epsilon {
                        models[k].row(b).mapv(|v| v / sed[b])
                    } else {
                        source.rendered_morph(l, b)
                    };
                    diff.row(b).dot(&rendered)
                })
                .collect()
        } else {
            let mut grad = Array1::zeros(source.bbox().len());
            for (b, &a) in sed.iter().enumerate() {
                if a != F::zero() {
                    grad.scaled_add(a, &source.gamma().transpose_apply(b, diff.row(b)));
                }
            }
            grad
        }
    }

    /// Gradient of the loss with respect to block `j` at the current state.
    ///
    /// SED blocks use the SED weights, morphology blocks the morphology weights.
    pub fn gradient(&self, j: usize) -> Result<Array1<F>> {
        let blocks = 2 * self.k();
        if j >= blocks {
            return Err(DeblendError::BlockIndex { index: j, blocks });
        }
        let observation = self.observation()?;
        let models = self
            .sources
            .iter()
            .flat_map(Source::component_models)
            .collect_vec();
        let model = self.combine(&models);
        let group = if j < self.k() { Group::Sed } else { Group::Morph };
        let residual =
            Self::weighted_residual(observation, model.view(), self.weights.group(group));
        Ok(self.block_gradient(j, &models, residual.view()))
    }

    fn sed_step(&self) -> F {
        let (_, height, width) = self.shape;
        let mut morphs = Array2::zeros((self.k(), height * width));
        for (mut row, &(m, l)) in morphs.outer_iter_mut().zip(&self.source_of) {
            let source = &self.sources[m];
            let band = argmax(source.sed().row(l));
            let rendered = source.rendered_morph(l, band).insert_axis(Axis(0));
            let mut frame = Array3::zeros((1, height, width));
            source.bbox().add_into(rendered.view(), frame.view_mut());
            row.assign(&flatten(frame.index_axis(Axis(0), 0)));
        }
        steps::sed_step(morphs.view(), self.weights.max(Group::Sed), self.slack)
    }

    fn morph_step(&self) -> F {
        let seds = Array2::from_shape_fn((self.k(), self.bands()), |(k, b)| {
            let (m, l) = self.source_of[k];
            self.sources[m].sed()[[l, b]]
        });
        steps::morph_step(seds.view(), self.weights.max(Group::Morph), self.slack)
    }

    /// Move every source by the Gauss-Newton correction of its center.
    fn update_positions(&mut self) -> Result<bool> {
        let residual = Self::weighted_residual(
            self.observation()?,
            self.model.view(),
            self.weights.base.as_ref(),
        );
        let min_dist = self.center_min_dist;

        let mut moved = false;
        for m in 0..self.sources.len() {
            let Some((dy, dx)) = self.position_correction(m, residual.view()) else {
                continue;
            };
            if dy * dy + dx * dx > min_dist * min_dist {
                let source = &mut self.sources[m];
                let (y, x) = source.center();
                source.set_center((y + dy, x + dx));
                info!(
                    "Source {} shifted by ({:.3}/{:.3}) to ({:.3}/{:.3}).",
                    m,
                    to_f64(dy),
                    to_f64(dx),
                    to_f64(y + dy),
                    to_f64(x + dx)
                );
                moved = true;
            }
        }
        Ok(moved)
    }

    /// Least squares shift `(dy, dx)` of source `m` from finite differences of its model.
    fn position_correction(&self, m: usize, residual: ArrayView3<F>) -> Option<(F, F)> {
        let source = &self.sources[m];
        let h = source.shift_center();
        if h == F::zero() {
            return None;
        }
        let (_, height, width) = self.shape;
        let (box_height, box_width) = source.shape();

        let model = source.model();
        let diff_x = (&model - &source.model_with(&source.shifted_gamma(F::zero(), h))) / h;
        let diff_y = (&model - &source.model_with(&source.shifted_gamma(h, F::zero()))) / h;
        let r = source.extract(residual);
        let w = self.weights.base.as_ref().map(|w| source.extract(w.view()));
        let inside = source.bbox().inside_pixels(height, width);

        let mut normal = Matrix2::zeros();
        let mut rhs = Vector2::zeros();
        for b in 0..source.bands() {
            for &p in &inside {
                let dx = if p % box_width == box_width - 1 {
                    F::zero()
                } else {
                    diff_x[[b, p]]
                };
                let dy = if p / box_width == box_height - 1 {
                    F::zero()
                } else {
                    diff_y[[b, p]]
                };
                let weight = w.as_ref().map_or_else(F::one, |w| w[[b, p]]);
                let d = Vector2::new(dx, dy);
                normal += d * d.transpose() * weight;
                rhs += d * r[[b, p]];
            }
        }

        let Some(inverse) = normal.try_inverse() else {
            warn!("Singular position update of source {m}, skipped.");
            return None;
        };
        let delta = inverse * rhs;
        if !(delta.x.is_finite() && delta.y.is_finite()) {
            warn!("Non-finite position update of source {m}, skipped.");
            return None;
        }
        Some((delta.y, delta.x))
    }

    /// Loss of the observation at the current model.
    pub fn loss(&self) -> Result<F> {
        Ok(self.observation()?.loss(self.get_model()?.view()))
    }

    /// Model of all sources `(bands, height, width)`.
    pub fn get_model(&self) -> Result<Array3<F>> {
        self.observation()?;
        let models = self
            .sources
            .iter()
            .flat_map(Source::component_models)
            .collect_vec();
        Ok(self.combine(&models))
    }

    /// Model of source `m` in the frame of the observation.
    pub fn source_model(&self, m: usize) -> Result<Array3<F>> {
        self.observation()?;
        let source = self.sources.get(m).ok_or(DeblendError::ComponentIndex {
            source_index: m,
            component: 0,
        })?;
        Ok(source.model_image(self.shape))
    }
}

#[cfg(feature = "parallel")]
pub use parallel::*;

#[cfg(feature = "parallel")]
mod parallel {
    use super::*;
    use rayon::prelude::*;

    /// Continue the fits of independent blends concurrently, up to `max_iter` iterations each.
    ///
    /// Data must be set on every blend. The blends may share one
    /// [`OperatorRegistry`](crate::OperatorRegistry).
    pub fn fit_blends_par<F: Float>(
        blends: &mut [Blend<F>],
        max_iter: usize,
    ) -> Vec<Result<IterationStatus<F>>> {
        blends
            .par_iter_mut()
            .map(|blend| blend.step(max_iter))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;
    use ndarray::{Array3, array, s};
    use ndarray_rand::RandomExt;
    use ndarray_rand::rand::{SeedableRng, rngs::StdRng};
    use ndarray_rand::rand_distr::{Normal, Uniform};
    use simplelog::{Config, LevelFilter, TestLogger};

    use super::*;
    use crate::ndarray_utils::norm;
    use crate::{ConstraintSet, ImageObservation, OperatorRegistry, Proximal, SourceBuilder};

    fn gaussian(shape: (usize, usize), center: (f64, f64), sigma: f64, peak: f64) -> Array2<f64> {
        Array2::from_shape_fn(shape, |(y, x)| {
            let r2 = (y as f64 - center.0).powi(2) + (x as f64 - center.1).powi(2);
            peak * (-r2 / (2. * sigma * sigma)).exp()
        })
    }

    fn flat(image: Array2<f64>) -> Array2<f64> {
        let n = image.len();
        image.into_shape_with_order((1, n)).unwrap()
    }

    #[test]
    fn empty_blend_and_missing_data() {
        assert!(matches!(
            Blend::<f64>::new(Vec::new()),
            Err(DeblendError::EmptyBlend)
        ));

        let registry = OperatorRegistry::new();
        let source = SourceBuilder::new((2., 2.), (3, 3)).build(&registry).unwrap();
        let mut blend = Blend::new(vec![source]).unwrap();
        assert_eq!(blend.step(1).unwrap_err(), DeblendError::NoData);
        assert_eq!(blend.gradient(2).unwrap_err(), DeblendError::BlockIndex { index: 2, blocks: 2 });
        assert_eq!(blend.component_of(0, 0), Ok(0));
        assert_eq!(
            blend.component_of(0, 1),
            Err(DeblendError::ComponentIndex {
                source_index: 0,
                component: 1,
            })
        );
    }

    #[test]
    fn weight_normalizations() {
        let weights = array![[[1., 2.], [0., 4.]], [[3., 2.], [2., 0.]]];
        let derived = Weights::new(weights.view());

        let morph = derived.morph.unwrap();
        assert_eq!(morph, array![[[0.5, 1.], [0., 2.]], [[1.5, 1.], [2., 0.]]]);

        let sed = derived.sed.unwrap();
        assert_abs_diff_eq!(
            sed,
            array![[[2. / 3., 4. / 3.], [0., 0.]], [[1.5, 1.], [0., 0.]]],
            epsilon = 1e-12
        );

        // Bands without any weight are left alone.
        let empty = Array3::<f64>::zeros((1, 2, 2));
        assert_eq!(Weights::new(empty.view()).morph.unwrap(), empty);
    }

    #[test]
    fn superposition_of_sources() {
        let registry = OperatorRegistry::new();
        let mut rng = StdRng::seed_from_u64(11);
        let a = SourceBuilder::new((6.3, 5.8), (7, 7))
            .with_sed(array![[0.3, 0.7]])
            .with_morph(flat(gaussian((7, 7), (3., 3.), 1.5, 10.)))
            .build(&registry)
            .unwrap();
        let b = SourceBuilder::new((8.6, 9.2), (5, 9))
            .with_sed(array![[0.8, 0.2], [0.1, 0.9]])
            .with_morph(Array2::random_using((2, 45), Uniform::new(0., 1.), &mut rng))
            .build(&registry)
            .unwrap();

        let shape = (2, 14, 14);
        let expected = a.model_image(shape) + b.model_image(shape);
        let mut blend = Blend::new(vec![a, b]).unwrap().with_init_sources(false);
        blend
            .set_data(ImageObservation::new(Array3::zeros(shape)))
            .unwrap();

        assert_eq!(blend.k(), 3);
        assert_eq!(blend.source_of(2), Some((1, 1)));
        let model = blend.get_model().unwrap();
        assert_abs_diff_eq!(model, expected, epsilon = 1e-12);
        let summed = blend.source_model(0).unwrap() + blend.source_model(1).unwrap();
        assert_abs_diff_eq!(model, summed, epsilon = 1e-12);
    }

    #[test]
    fn steps_never_increase_the_loss() {
        let registry = OperatorRegistry::new();
        let mut rng = StdRng::seed_from_u64(5);
        let mut images = Array3::random_using((2, 16, 16), Normal::new(0., 0.1).unwrap(), &mut rng);
        images
            .slice_mut(s![0, .., ..])
            .scaled_add(1., &gaussian((16, 16), (6., 6.), 2., 20.));
        images
            .slice_mut(s![1, .., ..])
            .scaled_add(1., &gaussian((16, 16), (9., 10.), 1.5, 30.));

        let sources = [(6., 6.), (9., 10.)]
            .into_iter()
            .map(|center| {
                SourceBuilder::new(center, (9, 9))
                    .with_shift_center(0.)
                    .with_sed_prox(Proximal::Plus)
                    .build(&registry)
                    .unwrap()
            })
            .collect_vec();
        let mut blend = Blend::new(sources).unwrap().with_accelerated(false);
        blend.set_data(ImageObservation::new(images)).unwrap();

        let mut loss = blend.loss().unwrap();
        for _ in 0..5 {
            let status = blend.step(1).unwrap();
            assert!(status.loss <= loss * (1. + 1e-12), "{} > {}", status.loss, loss);
            loss = status.loss;
        }
    }

    #[test]
    fn recovers_subpixel_position() {
        let _ = TestLogger::init(LevelFilter::Info, Config::default());
        let registry = OperatorRegistry::new();
        let morph = flat(gaussian((11, 11), (5., 5.), 1.5, 10.));
        let truth = SourceBuilder::new((10.4, 10.3), (11, 11))
            .with_sed(array![[1.]])
            .with_morph(morph.clone())
            .build(&registry)
            .unwrap();
        let images = truth.model_image((1, 21, 21));

        let source = SourceBuilder::new((10.2, 10.15), (11, 11))
            .with_sed(array![[1.]])
            .with_morph(morph)
            .with_fixed_sed([true])
            .with_fixed_morph([true])
            .build(&registry)
            .unwrap();
        let mut blend = Blend::new(vec![source])
            .unwrap()
            .with_init_sources(false)
            .with_center_wait(0)
            .with_center_skip(1);
        let status = blend.fit(ImageObservation::new(images), 50).unwrap();

        assert!(status.converged);
        let (y, x) = blend.sources()[0].center();
        assert_abs_diff_eq!(y, 10.4, epsilon = 1e-2);
        assert_abs_diff_eq!(x, 10.3, epsilon = 1e-2);
    }

    #[test]
    fn fits_monotonic_symmetric_source() {
        let registry = OperatorRegistry::new();
        let mut rng = StdRng::seed_from_u64(42);
        let truth = gaussian((15, 15), (7., 7.), 2., 100.);
        let noise = Array2::random_using((15, 15), Normal::new(0., 0.5).unwrap(), &mut rng);
        let images = (&truth + &noise).insert_axis(Axis(0));

        let constraints = ConstraintSet::parse([("M", 1.), ("S", 0.)]).unwrap();
        let source = SourceBuilder::new((7., 7.), (15, 15))
            .with_constraints(constraints)
            .with_shift_center(0.)
            .build(&registry)
            .unwrap();
        let mut blend = Blend::new(vec![source]).unwrap();
        blend
            .fit(ImageObservation::new(images.clone()), 200)
            .unwrap();

        let x = blend.sources()[0].morph().row(0).to_owned();
        let monotonic = registry
            .radial_monotonic((15, 15), true)
            .apply(x.view())
            .mapv(|v| v.max(0.));
        assert!(norm(monotonic.view()) <= 0.05 * norm(x.view()));
        let symmetric = registry.symmetry((15, 15)).apply(x.view());
        assert!(norm(symmetric.view()) <= 0.05 * norm(x.view()));

        let model = blend.get_model().unwrap();
        assert_abs_diff_eq!(model.sum(), truth.sum(), epsilon = 0.03 * truth.sum());
        let rms = (&model - &images).mapv(|r| r * r).mean().unwrap().sqrt();
        assert!(rms < 1.5, "residual rms {rms}");
    }

    #[test]
    fn gradients_match_finite_differences() {
        let registry = OperatorRegistry::new();
        let mut rng = StdRng::seed_from_u64(9);
        let mut psf = Array3::random_using((2, 3, 3), Uniform::new(0., 1.), &mut rng);
        for mut kernel in psf.outer_iter_mut() {
            let total = kernel.sum();
            kernel /= total;
        }
        let source = SourceBuilder::new((5.3, 4.7), (7, 7))
            .with_sed(array![[0.6, 0.]])
            .with_morph(Array2::random_using((1, 49), Uniform::new(0., 1.), &mut rng))
            .with_psf(psf)
            .build(&registry)
            .unwrap();
        let images = Array3::random_using((2, 11, 11), Uniform::new(0., 1.), &mut rng);
        let mut blend = Blend::new(vec![source]).unwrap().with_init_sources(false);
        blend.set_data(ImageObservation::new(images)).unwrap();

        let h = 1e-5;
        let sed_grad = blend.gradient(0).unwrap();
        for b in 0..2 {
            let sed = blend.sources[0].sed().row(0).to_owned();
            let mut shifted = sed.clone();
            shifted[b] += h;
            blend.sources[0].set_sed(0, shifted.view());
            let up = blend.loss().unwrap();
            shifted[b] -= 2. * h;
            blend.sources[0].set_sed(0, shifted.view());
            let down = blend.loss().unwrap();
            blend.sources[0].set_sed(0, sed.view());
            assert_abs_diff_eq!(sed_grad[b], (up - down) / (2. * h), epsilon = 1e-6);
        }

        let morph_grad = blend.gradient(1).unwrap();
        for p in [0, 17, 24, 48] {
            let morph = blend.sources[0].morph().row(0).to_owned();
            let mut shifted = morph.clone();
            shifted[p] += h;
            blend.sources[0].set_morph(0, shifted.view());
            let up = blend.loss().unwrap();
            shifted[p] -= 2. * h;
            blend.sources[0].set_morph(0, shifted.view());
            let down = blend.loss().unwrap();
            blend.sources[0].set_morph(0, morph.view());
            assert_abs_diff_eq!(morph_grad[p], (up - down) / (2. * h), epsilon = 1e-6);
        }
    }

    #[test]
    fn callback_stops_the_fit() {
        let registry = OperatorRegistry::new();
        let images = gaussian((9, 9), (4., 4.), 1.5, 10.).insert_axis(Axis(0));
        // Starting from an empty morphology, the fit keeps moving.
        let source = SourceBuilder::new((4., 4.), (9, 9))
            .with_sed(array![[1.]])
            .build(&registry)
            .unwrap();
        let mut blend = Blend::new(vec![source])
            .unwrap()
            .with_init_sources(false)
            .with_relative_tolerance(0.);
        let status = blend
            .fit_with(ImageObservation::new(images), 100, |status| {
                if status.iteration >= 3 {
                    ControlFlow::Break(())
                } else {
                    ControlFlow::Continue(())
                }
            })
            .unwrap();
        assert_eq!(status.iteration, 3);
        assert_eq!(blend.iterations(), 3);
        assert!(!status.converged);
    }

    /// Two sources in two bands with per-band noise levels, a masked column and the second
    /// source clipped by the image edge.
    fn weighted_scene() -> (Array3<f64>, Array3<f64>) {
        let mut rng = StdRng::seed_from_u64(21);
        let shape = (2, 20, 20);
        let sigmas = [0.05, 0.1];
        let mut images = Array3::zeros(shape);
        let mut weights = Array3::zeros(shape);
        for (b, sigma) in sigmas.into_iter().enumerate() {
            let noise = Array2::random_using((20, 20), Normal::new(0., sigma).unwrap(), &mut rng);
            images.slice_mut(s![b, .., ..]).assign(&noise);
            weights.slice_mut(s![b, .., ..]).fill(1. / (sigma * sigma));
        }
        weights.slice_mut(s![.., .., 3]).fill(0.);

        let seds = [[2. / 3., 1. / 3.], [0., 1.]];
        for (center, sed) in [(7., 7.), (15., 17.)].into_iter().zip(seds) {
            let morph = gaussian((20, 20), center, 1.5, 30.);
            for (b, a) in sed.into_iter().enumerate() {
                images.slice_mut(s![b, .., ..]).scaled_add(a, &morph);
            }
        }
        (images, weights)
    }

    #[test]
    fn weighted_sed_first_fit_with_sparsity() {
        let registry = OperatorRegistry::new();
        let (images, weights) = weighted_scene();
        let constraints = ConstraintSet::parse([("M", 0.), ("l0", 1.)]).unwrap();
        let sources = [(7., 7.), (15., 17.)]
            .into_iter()
            .map(|center| {
                SourceBuilder::new(center, (9, 9))
                    .with_constraints(constraints.clone())
                    .build(&registry)
                    .unwrap()
            })
            .collect_vec();
        let mut blend = Blend::new(sources)
            .unwrap()
            .with_update_order(UpdateOrder::SedFirst);
        let observation = ImageObservation::new(images).with_weights(weights).unwrap();
        blend.fit(observation, 100).unwrap();

        assert_eq!(blend.e_abs[..2], [5e-3, 5e-3]);
        assert!(blend.e_abs[2..].iter().all(|&e| e > 0. && e.is_finite()));

        let expected = [[2. / 3., 1. / 3.], [0., 1.]];
        for (source, sed) in blend.sources().iter().zip(expected) {
            assert_abs_diff_eq!(source.sed().row(0), array![sed[0], sed[1]], epsilon = 0.02);
        }
        let (y, x) = blend.sources()[1].center();
        assert_abs_diff_eq!(y, 15., epsilon = 0.1);
        assert_abs_diff_eq!(x, 17., epsilon = 0.1);
    }

    #[test]
    fn weighted_steps_never_increase_the_loss() {
        let registry = OperatorRegistry::new();
        let (images, weights) = weighted_scene();
        let sources = [(7., 7.), (15., 17.)]
            .into_iter()
            .map(|center| {
                SourceBuilder::new(center, (9, 9))
                    .with_shift_center(0.)
                    .with_sed_prox(Proximal::Plus)
                    .build(&registry)
                    .unwrap()
            })
            .collect_vec();
        let mut blend = Blend::new(sources).unwrap().with_accelerated(false);
        let observation = ImageObservation::new(images).with_weights(weights).unwrap();
        blend.set_data(observation).unwrap();

        let mut loss = blend.loss().unwrap();
        for _ in 0..20 {
            let status = blend.step(1).unwrap();
            assert!(status.loss <= loss * (1. + 1e-12), "{} > {}", status.loss, loss);
            loss = status.loss;
        }
    }

    #[test]
    fn singular_position_update_is_skipped() {
        let registry = OperatorRegistry::new();
        let images = gaussian((11, 11), (5., 5.), 1.5, 10.).insert_axis(Axis(0));
        // Without flux the derivatives of the model vanish.
        let source = SourceBuilder::new((5.3, 5.2), (7, 7))
            .with_sed(array![[1.]])
            .with_fixed_sed([true])
            .with_fixed_morph([true])
            .build(&registry)
            .unwrap();
        let mut blend = Blend::new(vec![source])
            .unwrap()
            .with_init_sources(false)
            .with_center_wait(0)
            .with_center_skip(1);

        let mut seen = Vec::new();
        let status = blend
            .fit_with(ImageObservation::new(images), 10, |status| {
                seen.push(*status);
                ControlFlow::Continue(())
            })
            .unwrap();

        assert_eq!(blend.sources()[0].center(), (5.3, 5.2));
        assert!(status.converged);
        assert_eq!(status.iteration, 1);
        // The converged iteration is still reported.
        assert_eq!(seen, vec![status]);
    }

    #[test]
    fn split_steps_match_one_fit() {
        let registry = OperatorRegistry::new();
        let (images, _) = weighted_scene();
        let blend = || {
            let sources = [(7., 7.), (15., 17.)]
                .into_iter()
                .map(|center| SourceBuilder::new(center, (9, 9)).build(&registry).unwrap())
                .collect_vec();
            let mut blend = Blend::new(sources)
                .unwrap()
                .with_relative_tolerance(0.)
                .with_center_wait(2)
                .with_center_skip(2);
            blend.set_data(ImageObservation::new(images.clone())).unwrap();
            blend
        };

        let mut whole = blend();
        let status = whole.step(6).unwrap();
        let mut split = blend();
        for _ in 0..3 {
            split.step(2).unwrap();
        }
        assert_eq!(split.iterations(), 6);
        for (a, b) in whole.sources().iter().zip(split.sources()) {
            assert_eq!(a.sed(), b.sed());
            assert_eq!(a.morph(), b.morph());
            assert_eq!(a.center(), b.center());
        }
        // The cached model is current after every call.
        assert_abs_diff_eq!(whole.loss().unwrap(), status.loss, epsilon = 1e-9);
    }

    #[cfg(feature = "parallel")]
    #[test]
    fn parallel_matches_sequential() {
        let registry = OperatorRegistry::new();
        let blends = || {
            [(4., 4.), (5., 3.)]
                .into_iter()
                .map(|center| {
                    let images = gaussian((9, 9), center, 1.5, 10.).insert_axis(Axis(0));
                    let source = SourceBuilder::new(center, (7, 7))
                        .with_shift_center(0.)
                        .build(&registry)
                        .unwrap();
                    let mut blend = Blend::new(vec![source]).unwrap();
                    blend.set_data(ImageObservation::new(images)).unwrap();
                    blend
                })
                .collect_vec()
        };

        let mut parallel = blends();
        let results = fit_blends_par(&mut parallel, 20);
        let mut sequential = blends();
        for (blend, result) in sequential.iter_mut().zip(results) {
            assert_eq!(blend.step(20).unwrap(), result.unwrap());
        }
        for (a, b) in parallel.iter().zip(&sequential) {
            assert_eq!(a.sources()[0].morph(), b.sources()[0].morph());
        }
    }
}
