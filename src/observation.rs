//! The data a blend is fit to.

use ndarray::{Array3, ArrayView3, Zip};

use crate::error::{DeblendError, Result};
use crate::{Float, lit};

/// An observation of the scene: images, weights, rendering and likelihood.
///
/// The blend only reaches the data through this trait, so resampling or instrument specific
/// rendering can be injected. Implementations must be free of side effects.
pub trait Observation<F: Float>: Send + Sync {
    /// Image cube `(bands, height, width)`, sky subtracted.
    fn images(&self) -> ArrayView3<'_, F>;

    /// Inverse-variance weights of the same shape as [`Observation::images`], `None` for uniform weights.
    fn weights(&self) -> Option<ArrayView3<'_, F>>;

    /// Map a model cube into the pixel space of the images.
    fn render(&self, model: ArrayView3<F>) -> Array3<F> {
        model.to_owned()
    }

    /// Negative log-likelihood `½ Σ w (render(model) - images)²`.
    fn loss(&self, model: ArrayView3<F>) -> F {
        let rendered = self.render(model);
        let half = lit::<F>(0.5);
        match self.weights() {
            Some(weights) => {
                Zip::from(&rendered)
                    .and(self.images())
                    .and(weights)
                    .fold(F::zero(), |acc, &m, &d, &w| {
                        let r = m - d;
                        acc + w * r * r
                    })
                    * half
            }
            None => {
                Zip::from(&rendered)
                    .and(self.images())
                    .fold(F::zero(), |acc, &m, &d| {
                        let r = m - d;
                        acc + r * r
                    })
                    * half
            }
        }
    }
}

/// An image cube with optional weights, rendered without resampling.
#[derive(Clone, Debug)]
pub struct ImageObservation<F> {
    images: Array3<F>,
    weights: Option<Array3<F>>,
}

impl<F: Float> ImageObservation<F> {
    /// Observation of an image cube `(bands, height, width)` with uniform weights.
    pub fn new(images: Array3<F>) -> Self {
        Self {
            images,
            weights: None,
        }
    }

    /// Set inverse-variance weights of the same shape as the images.
    pub fn with_weights(mut self, weights: Array3<F>) -> Result<Self> {
        if weights.dim() != self.images.dim() {
            return Err(DeblendError::ShapeMismatch {
                what: "weights",
                expected: self.images.shape().to_vec(),
                actual: weights.shape().to_vec(),
            });
        }
        self.weights = Some(weights);
        Ok(self)
    }

    /// Subtract a sky level that broadcasts to the images, e.g. `(bands, 1, 1)`.
    pub fn with_sky(mut self, sky: ArrayView3<F>) -> Result<Self> {
        let sky = sky
            .broadcast(self.images.dim())
            .ok_or_else(|| DeblendError::ShapeMismatch {
                what: "sky",
                expected: self.images.shape().to_vec(),
                actual: sky.shape().to_vec(),
            })?;
        self.images -= &sky;
        Ok(self)
    }
}

impl<F: Float> Observation<F> for ImageObservation<F> {
    fn images(&self) -> ArrayView3<'_, F> {
        self.images.view()
    }

    fn weights(&self) -> Option<ArrayView3<'_, F>> {
        self.weights.as_ref().map(|weights| weights.view())
    }
}
