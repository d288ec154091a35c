//! Per-block updates of the block-coordinate proximal solver (bSDMM).
//!
//! Every block `x` (one SED or morphology row) takes a proximal gradient step on the likelihood,
//! while its linear constraints `prox_g(L x)` are handled with a linearized ADMM:
//!
//! ```text
//! x ← prox_f(x - step_f ∇f - Σ step_f / step_g · Lᵀ(L x - z + u), step_f)
//! z ← prox_g(L x + u, step_g)
//! u ← u + L x - z
//! ```
//!
//! with `step_g = step_f · N · M · ‖L‖²` for a block with `M` constraints out of `N` blocks.

use std::sync::Arc;

use ndarray::{Array1, ArrayView1};

use crate::ndarray_utils::{max, norm};
use crate::operator::LinearOperator;
use crate::proximal::Proximal;
use crate::{Float, lit};

/// A constraint `prox(L x)` on a block.
#[derive(Clone, Debug)]
pub struct LinearConstraint<F> {
    /// The operator `L`.
    pub op: Arc<LinearOperator<F>>,
    /// The projection applied to `L x`.
    pub prox: Proximal<F>,
}

/// Decides whether a block stopped changing between two iterations.
pub trait ConvergenceCriterion<F: Float>: Send + Sync {
    /// Whether the change from `previous` to `current` is within the tolerances.
    fn converged(&self, previous: ArrayView1<F>, current: ArrayView1<F>, e_rel: F, e_abs: F)
    -> bool;
}

/// `‖current - previous‖ ≤ e_abs · √n + e_rel · ‖current‖`.
#[derive(Clone, Copy, Debug, Default)]
pub struct RelativeChange;

impl<F: Float> ConvergenceCriterion<F> for RelativeChange {
    fn converged(
        &self,
        previous: ArrayView1<F>,
        current: ArrayView1<F>,
        e_rel: F,
        e_abs: F,
    ) -> bool {
        let change = &current - &previous;
        let n = lit::<F>(current.len() as f64);
        norm(change.view()) <= e_abs * n.sqrt() + e_rel * norm(current)
    }
}

#[derive(Clone, Debug)]
struct DualState<F> {
    z: Array1<F>,
    u: Array1<F>,
    /// Zero until the first update.
    step_g: F,
}

/// Auxiliary variables of one block.
#[derive(Clone, Debug)]
pub(crate) struct BlockState<F> {
    duals: Vec<DualState<F>>,
    previous: Option<Array1<F>>,
}

impl<F> Default for BlockState<F> {
    fn default() -> Self {
        Self {
            duals: Vec::new(),
            previous: None,
        }
    }
}

/// Step size and tolerances of one block update.
#[derive(Clone, Copy, Debug)]
pub(crate) struct BlockStep<F> {
    pub step_f: F,
    /// Extrapolation weight, only used for blocks without constraints.
    pub omega: F,
    /// Total number of blocks of the problem.
    pub blocks: usize,
    pub e_rel: F,
    pub e_abs: F,
}

/// Result of one block update.
#[derive(Clone, Debug)]
pub(crate) struct BlockUpdate<F> {
    pub x: Array1<F>,
    /// Primal and dual residuals of all constraints are within the tolerances.
    pub constraints_converged: bool,
}

impl<F: Float> BlockState<F> {
    /// Take one step from `x` with the likelihood gradient `grad`.
    pub fn update(
        &mut self,
        x: ArrayView1<F>,
        grad: ArrayView1<F>,
        prox: &Proximal<F>,
        constraints: &[LinearConstraint<F>],
        step: BlockStep<F>,
    ) -> BlockUpdate<F> {
        let BlockStep {
            step_f,
            omega,
            blocks,
            e_rel,
            e_abs,
        } = step;

        if self.duals.len() != constraints.len() {
            self.duals = constraints
                .iter()
                .map(|constraint| DualState {
                    z: constraint.op.apply(x),
                    u: Array1::zeros(constraint.op.rows()),
                    step_g: F::zero(),
                })
                .collect();
        }

        let mut active = constraints
            .iter()
            .zip(self.duals.iter_mut())
            .filter(|(constraint, _)| constraint.op.spectral_norm() > F::zero())
            .collect::<Vec<_>>();

        let extrapolate = active.is_empty() && omega > F::zero();
        let mut next = match &self.previous {
            Some(previous) if extrapolate && previous.len() == x.len() => {
                let mut extrapolated = x.to_owned();
                extrapolated.scaled_add(omega, &(&x - previous));
                extrapolated
            }
            _ => x.to_owned(),
        };
        next.scaled_add(-step_f, &grad);

        let m = lit::<F>((active.len() * blocks) as f64);
        for (constraint, dual) in active.iter_mut() {
            let spectral_norm = constraint.op.spectral_norm();
            let step_g = step_f * m * spectral_norm * spectral_norm;
            if dual.step_g > F::zero() && dual.step_g != step_g {
                // Keep the unscaled dual variable fixed.
                dual.u *= dual.step_g / step_g;
            }
            dual.step_g = step_g;

            let residual = constraint.op.apply(x) - &dual.z + &dual.u;
            let correction = constraint.op.transpose_apply(residual.view());
            next.scaled_add(-step_f / step_g, &correction);
        }

        prox.apply(next.view_mut(), step_f);

        let n = lit::<F>(next.len() as f64).sqrt();
        let mut converged = true;
        for (constraint, dual) in active {
            let lx = constraint.op.apply(next.view());
            let mut z = &lx + &dual.u;
            constraint.prox.apply(z.view_mut(), dual.step_g);
            let z_change = &z - &dual.z;
            dual.u += &(&lx - &z);
            dual.z = z;

            let rows = lit::<F>(lx.len() as f64).sqrt();
            let primal = norm((&lx - &dual.z).view());
            let primal_bound = rows * e_abs + e_rel * norm(lx.view()).max(norm(dual.z.view()));

            let dual_residual =
                norm(constraint.op.transpose_apply(z_change.view()).view()) / dual.step_g;
            let dual_scale = max([
                norm(constraint.op.transpose_apply(dual.u.view()).view()),
                norm(constraint.op.transpose_apply(dual.z.view()).view()),
            ])
            .unwrap_or_else(F::zero);
            let dual_bound = n * e_abs + e_rel * dual_scale / dual.step_g;

            converged &= primal <= primal_bound && dual_residual <= dual_bound;
        }

        self.previous = Some(x.to_owned());
        BlockUpdate {
            x: next,
            constraints_converged: converged,
        }
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    use super::*;
    use crate::OperatorRegistry;

    fn step(step_f: f64, omega: f64) -> BlockStep<f64> {
        BlockStep {
            step_f,
            omega,
            blocks: 2,
            e_rel: 1e-6,
            e_abs: 0.,
        }
    }

    #[test]
    fn relative_change() {
        let criterion = RelativeChange;
        let previous = array![1., 1., 1., 1.];
        let current = array![1., 1., 1., 1.02];
        assert!(criterion.converged(previous.view(), current.view(), 1e-2, 0.));
        assert!(!criterion.converged(previous.view(), current.view(), 1e-3, 0.));
        assert!(criterion.converged(previous.view(), current.view(), 0., 0.011));
    }

    #[test]
    fn unconstrained_step_is_projected_gradient() {
        let mut state = BlockState::default();
        let x = array![1., 2., 3.];
        let grad = array![2., -1., 4.];
        let update = state.update(x.view(), grad.view(), &Proximal::Plus, &[], step(0.5, 0.));
        assert_eq!(update.x, array![0., 2.5, 1.]);
        assert!(update.constraints_converged);

        // Extrapolation from the previous iterate.
        let zeros = Array1::zeros(3);
        let update = state.update(
            array![2., 2., 3.].view(),
            zeros.view(),
            &Proximal::Plus,
            &[],
            step(0.5, 0.5),
        );
        assert_eq!(update.x, array![2.5, 2., 3.]);
    }

    #[test]
    fn null_constraint_is_ignored() {
        let mut state = BlockState::default();
        let constraints = [LinearConstraint {
            op: Arc::new(LinearOperator::null(3)),
            prox: Proximal::Zero,
        }];
        let x = array![1., 2., 3.];
        let zeros = Array1::zeros(3);
        let update = state.update(
            x.view(),
            zeros.view(),
            &Proximal::Plus,
            &constraints,
            step(1., 0.),
        );
        assert_eq!(update.x, x);
        assert!(update.constraints_converged);
    }

    #[test]
    fn admm_drives_towards_symmetry() {
        let registry = OperatorRegistry::<f64>::new();
        let constraints = [LinearConstraint {
            op: registry.symmetry((1, 5)),
            prox: Proximal::Zero,
        }];
        let target = array![1., 2., 5., 4., 1.];

        let mut state = BlockState::default();
        let mut x = target.clone();
        for _ in 0..500 {
            // Gradient of ½‖x - target‖².
            let grad = &x - &target;
            x = state
                .update(x.view(), grad.view(), &Proximal::Plus, &constraints, step(0.9, 0.))
                .x;
        }

        // Closest symmetric vector to the target.
        assert_abs_diff_eq!(x, array![1., 3., 5., 3., 1.], epsilon = 1e-6);
    }
}
