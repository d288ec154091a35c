//! Adaptive step sizes of the SED and morphology blocks.
//!
//! The likelihood is quadratic in either group of blocks, so a step of `slack / L` with the
//! Lipschitz constant `L` of the gradient is stable. For the SEDs `L = max(W_sed) · λmax(S Sᵀ)`,
//! for the morphologies `L = max(W_morph) · λmax(Aᵀ A)`, with `S` the rendered morphologies
//! (one row per component) and `A` the SEDs (one column per component).

use ndarray::{Array2, ArrayView2};

use crate::Float;
use crate::ndarray_utils::max_eigenvalue;

fn lipschitz_step<F: Float>(slack: F, lipschitz: F) -> F {
    if lipschitz > F::zero() && lipschitz.is_finite() {
        slack / lipschitz
    } else {
        // The gradient is constant, any step is stable.
        slack
    }
}

/// Step of the SED blocks for the rendered morphologies `(components, pixels)`.
pub(crate) fn sed_step<F: Float>(morphs: ArrayView2<F>, weight_max: F, slack: F) -> F {
    let gram: Array2<F> = morphs.dot(&morphs.t());
    lipschitz_step(slack, weight_max * max_eigenvalue(gram.view()))
}

/// Step of the morphology blocks for the SEDs `(components, bands)`.
pub(crate) fn morph_step<F: Float>(seds: ArrayView2<F>, weight_max: F, slack: F) -> F {
    let gram: Array2<F> = seds.dot(&seds.t());
    lipschitz_step(slack, weight_max * max_eigenvalue(gram.view()))
}
