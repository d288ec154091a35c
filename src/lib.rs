#![warn(missing_docs)]

//! Constrained deblending of overlapping sources in multi-band images. \
//! Every source is modeled as a sum of components, each the outer product of a
//! spectral energy distribution (SED, one value per band) and a morphology (one value per pixel
//! of the source's bounding box). The SEDs and morphologies of all sources are fit jointly with a
//! block-coordinate proximal solver (bSDMM), which alternates gradient steps on every block
//! with projections onto the constraints of that block.
//!
//! ## Interface
//! Sources are configured with a [`SourceBuilder`] and resolved against an [`OperatorRegistry`],
//! which builds and memoizes the sparse constraint operators of every box shape.
//! The sources are then collected in a [`Blend`], which owns the fitting loop.
//! In any case, additional parameters are set via `with_*()` functions.
//!
//! Example:
//! ```rust
//! # use deblend::{Blend, ConstraintSet, ImageObservation, OperatorRegistry, SourceBuilder};
//! # use ndarray::Array3;
//! let registry = OperatorRegistry::<f64>::new();
//! let constraints = ConstraintSet::parse([("M", 1.), ("S", 0.)]).unwrap();
//! let source = SourceBuilder::new((7., 7.), (15, 15))
//!     .with_constraints(constraints)
//!     .build(&registry)
//!     .unwrap();
//!
//! let mut images = Array3::zeros((1, 15, 15));
//! images[[0, 7, 7]] = 1.;
//! let mut blend = Blend::new(vec![source])
//!     .unwrap()
//!     .with_relative_tolerance(1e-3);
//! blend.fit(ImageObservation::new(images), 50).unwrap();
//! ```
//!
//! The observation is injected through the [`Observation`] trait, which renders a model into
//! pixel space and evaluates its loss. [`ImageObservation`] covers the common case of an image
//! cube with optional inverse-variance weights.
//!
//! ## Constraints
//! Constraints are given as codes with a parameter (see [`Constraint::from_code`]):
//! - `M`: radial monotonicity. A non-zero parameter restricts the reference to the single
//!     closer neighbor that is best aligned with the peak.
//! - `m`: strict monotonicity, enforced directly by the morphology projection.
//! - `S`: point symmetry around the box center.
//! - `c`: projection onto the cone of radially monotonic morphologies.
//! - `X`/`Y`: positive gradients toward the center along x/y.
//! - `x`/`y`: total variation along x/y, the parameter is the threshold.
//! - `l0`/`l1`: sparsity of the morphology relative to its noise level. `l0` takes precedence.
//!
//! ## Parameters
//! - `relative_tolerance`: Relative change of every block below which the fit stops.
//! - `slack`: Fraction of the Lipschitz step size used for the gradient steps.
//! - `center_wait`, `center_skip`: Position updates start after `center_wait` iterations
//!     and then run every `center_skip` iterations.
//! - `center_min_dist`: Position corrections below this distance are ignored.
//!
//! With the `parallel` feature, independent blends can be fit concurrently with
//! [`fit_blends_par`], sharing one registry.

pub mod blend;
pub(crate) mod bsdmm;
pub mod constraints;
pub mod error;
pub mod filter;
pub mod geometry;
pub(crate) mod ndarray_utils;
pub mod observation;
pub mod operator;
pub mod proximal;
pub mod registry;
pub mod source;
pub(crate) mod steps;

#[cfg(feature = "parallel")]
pub use blend::fit_blends_par;
pub use blend::{Blend, IterationStatus, UpdateOrder};
pub use bsdmm::{ConvergenceCriterion, LinearConstraint, RelativeChange};
pub use constraints::{Constraint, ConstraintSet};
pub use error::{DeblendError, Result};
pub use filter::{Gamma, GammaOp, LinearFilter};
pub use geometry::BoundingBox;
pub use observation::{ImageObservation, Observation};
pub use operator::LinearOperator;
pub use proximal::Proximal;
pub use registry::{MonotonicOrder, OperatorRegistry};
pub use source::{Source, SourceBuilder};

/// A generic float trait such that the deblender is generic over `f32`/`f64`.
///
/// This trait is automatically implemented for all types implementing the supertraits.
/// Particularly, this includes `f32` and `f64`.
/// [`num_traits::Float`] is not a supertrait as the need to specify the provider of the redundant definitions of the basic math functions would clutter the code.
pub trait Float:
    Copy
    + Default
    + nalgebra::RealField
    + num_traits::FromPrimitive
    + num_traits::ToPrimitive
    + ndarray::ScalarOperand
    + sprs::MulAcc
{
}

impl<F> Float for F where
    F: Copy
        + Default
        + nalgebra::RealField
        + num_traits::FromPrimitive
        + num_traits::ToPrimitive
        + ndarray::ScalarOperand
        + sprs::MulAcc
{
}

/// Converts a constant into the working precision.
#[inline]
pub(crate) fn lit<F: Float>(x: f64) -> F {
    nalgebra::convert(x)
}

/// Converts a value of the working precision into `f64`, for logging and error reports.
#[inline]
pub(crate) fn to_f64<F: Float>(x: F) -> f64 {
    x.to_f64().unwrap_or(f64::NAN)
}
