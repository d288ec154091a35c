//! Proximal operators, i.e. projections applied after every gradient step.

use std::sync::Arc;

use ndarray::ArrayViewMut1;

use crate::operator::LinearOperator;
use crate::registry::MonotonicOrder;
use crate::{Float, lit};

/// A proximal operator `prox(x, step)`, applied in place.
///
/// Thresholds of [`Proximal::Hard`] and [`Proximal::Soft`] are scaled with the step size.
#[derive(Clone, Debug)]
pub enum Proximal<F> {
    /// Projection onto the non-negative orthant.
    Plus,
    /// Projection onto the non-positive orthant.
    Minus,
    /// Projection onto zero.
    Zero,
    /// Zero every entry with `|x| < step * thresh`.
    Hard {
        /// Threshold per unit step.
        thresh: F,
    },
    /// Shrink every entry toward zero by `step * thresh`.
    Soft {
        /// Threshold per unit step.
        thresh: F,
    },
    /// Non-negative with unit sum. An all-zero input becomes uniform.
    UnityPlus,
    /// Clip every pixel to `(1 - thresh)` times the smallest of its closer neighbors,
    /// walking outward from the peak.
    StrictMonotonic {
        /// Pixel order of the box.
        order: Arc<MonotonicOrder>,
        /// Minimal relative decrease per step outward.
        thresh: F,
    },
    /// Projection onto the cone `{x : G x ≤ 0}`, approximated by cyclic projections onto the
    /// half-spaces of the rows of `G`.
    Cone {
        /// Operator `G` whose rows define the half-spaces.
        op: Arc<LinearOperator<F>>,
        /// Number of passes over all rows.
        sweeps: usize,
    },
    /// One pass of alternating projections, applied in the given order.
    Alternating(Vec<Proximal<F>>),
}

impl<F: Float> Proximal<F> {
    /// Apply the operator to `x` with step size `step`.
    pub fn apply(&self, mut x: ArrayViewMut1<F>, step: F) {
        match self {
            Self::Plus => x.mapv_inplace(|v| v.max(F::zero())),
            Self::Minus => x.mapv_inplace(|v| v.min(F::zero())),
            Self::Zero => x.fill(F::zero()),
            Self::Hard { thresh } => {
                let cut = step * *thresh;
                x.mapv_inplace(|v| if v.abs() < cut { F::zero() } else { v });
            }
            Self::Soft { thresh } => {
                let cut = step * *thresh;
                x.mapv_inplace(|v| v.signum() * (v.abs() - cut).max(F::zero()));
            }
            Self::UnityPlus => {
                x.mapv_inplace(|v| v.max(F::zero()));
                let total = x.sum();
                if total > F::zero() {
                    x /= total;
                } else if !x.is_empty() {
                    x.fill(F::one() / lit(x.len() as f64));
                }
            }
            Self::StrictMonotonic { order, thresh } => {
                let factor = F::one() - *thresh;
                for &p in order.order.iter().skip(1) {
                    let reference = order.closer[p]
                        .iter()
                        .map(|&n| x[n])
                        .reduce(|a, b| a.min(b));
                    if let Some(reference) = reference {
                        x[p] = x[p].min(factor * reference);
                    }
                }
            }
            Self::Cone { op, sweeps } => {
                let half_spaces = op.half_spaces();
                for _ in 0..*sweeps {
                    for half_space in half_spaces {
                        let dot = half_space
                            .entries
                            .iter()
                            .fold(F::zero(), |acc, (j, g)| acc + *g * x[*j]);
                        if dot > F::zero() {
                            let scale = dot / half_space.norm_sq;
                            for (j, g) in &half_space.entries {
                                x[*j] -= scale * *g;
                            }
                        }
                    }
                }
            }
            Self::Alternating(proxs) => {
                for prox in proxs {
                    prox.apply(x.view_mut(), step);
                }
            }
        }
    }

    /// Set the threshold of every hard or soft thresholding operator, also inside alternating
    /// projections. Returns whether any threshold was set.
    pub fn set_threshold(&mut self, value: F) -> bool {
        match self {
            Self::Hard { thresh } | Self::Soft { thresh } => {
                *thresh = value;
                true
            }
            Self::Alternating(proxs) => proxs
                .iter_mut()
                .fold(false, |found, prox| prox.set_threshold(value) || found),
            _ => false,
        }
    }

    /// Find the strict monotonicity projection, also inside alternating projections.
    pub fn strict_monotonic(&self) -> Option<&Self> {
        match self {
            Self::StrictMonotonic { .. } => Some(self),
            Self::Alternating(proxs) => proxs.iter().find_map(Self::strict_monotonic),
            _ => None,
        }
    }
}
