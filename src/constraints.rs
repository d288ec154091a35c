//! Constraint specifications and their resolution into operators.

use log::info;

use crate::bsdmm::LinearConstraint;
use crate::error::{DeblendError, Result};
use crate::proximal::Proximal;
use crate::registry::OperatorRegistry;
use crate::Float;

/// Passes of the cone projection per call.
const CONE_SWEEPS: usize = 3;

/// A constraint on the morphology of a source.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Constraint<F> {
    /// `M`: radial monotonicity through the operator `I - W`.
    Monotonic {
        /// Use only the best aligned closer neighbor of each pixel.
        use_nearest: bool,
    },
    /// `m`: strict monotonicity, projected directly after every gradient step.
    StrictMonotonic,
    /// `S`: point symmetry around the box center.
    Symmetric,
    /// `c`: projection onto the cone of radially monotonic morphologies.
    Cone,
    /// `X`: non-negative gradients toward the central column.
    PositiveGradientX,
    /// `x`: total variation along x.
    TotalVariationX {
        /// Soft threshold of the gradients.
        thresh: F,
    },
    /// `Y`: non-negative gradients toward the central row.
    PositiveGradientY,
    /// `y`: total variation along y.
    TotalVariationY {
        /// Soft threshold of the gradients.
        thresh: F,
    },
    /// `l0`: hard thresholding at `scale` times the morphology noise level.
    L0 {
        /// Multiple of the noise level.
        scale: F,
    },
    /// `l1`: soft thresholding at `scale` times the morphology noise level.
    L1 {
        /// Multiple of the noise level.
        scale: F,
    },
}

impl<F: Float> Constraint<F> {
    /// Parse a constraint code with its parameter.
    ///
    /// For `M` a non-zero value selects the nearest neighbor variant. `S`, `c`, `m`, `X` and `Y`
    /// ignore the value.
    pub fn from_code(code: &str, value: F) -> Result<Self> {
        Ok(match code {
            "M" => Self::Monotonic {
                use_nearest: value != F::zero(),
            },
            "m" => Self::StrictMonotonic,
            "S" => Self::Symmetric,
            "c" => Self::Cone,
            "X" => Self::PositiveGradientX,
            "x" => Self::TotalVariationX { thresh: value },
            "Y" => Self::PositiveGradientY,
            "y" => Self::TotalVariationY { thresh: value },
            "l0" => Self::L0 { scale: value },
            "l1" => Self::L1 { scale: value },
            _ => return Err(DeblendError::UnknownConstraint(code.to_owned())),
        })
    }

    /// The code of this constraint.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Monotonic { .. } => "M",
            Self::StrictMonotonic => "m",
            Self::Symmetric => "S",
            Self::Cone => "c",
            Self::PositiveGradientX => "X",
            Self::TotalVariationX { .. } => "x",
            Self::PositiveGradientY => "Y",
            Self::TotalVariationY { .. } => "y",
            Self::L0 { .. } => "l0",
            Self::L1 { .. } => "l1",
        }
    }
}

/// Ordered set of constraints, at most one per code.
#[derive(Clone, Debug, PartialEq)]
pub struct ConstraintSet<F> {
    constraints: Vec<Constraint<F>>,
}

impl<F> Default for ConstraintSet<F> {
    fn default() -> Self {
        Self {
            constraints: Vec::new(),
        }
    }
}

/// Operators of the morphology blocks, resolved for one box shape.
#[derive(Clone, Debug)]
pub(crate) struct ResolvedMorph<F> {
    pub prox: Proximal<F>,
    pub constraints: Vec<LinearConstraint<F>>,
}

impl<F: Float> ConstraintSet<F> {
    /// An empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse `(code, value)` pairs, keeping their order.
    pub fn parse<'a>(codes: impl IntoIterator<Item = (&'a str, F)>) -> Result<Self> {
        codes
            .into_iter()
            .try_fold(Self::new(), |set, (code, value)| {
                Ok(set.with(Constraint::from_code(code, value)?))
            })
    }

    /// Add a constraint. A constraint with the same code is replaced in place.
    pub fn with(mut self, constraint: Constraint<F>) -> Self {
        match self
            .constraints
            .iter_mut()
            .find(|existing| existing.code() == constraint.code())
        {
            Some(existing) => *existing = constraint,
            None => self.constraints.push(constraint),
        }
        self
    }

    /// Iterate over the constraints in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &Constraint<F>> {
        self.constraints.iter()
    }

    /// Number of constraints.
    pub fn len(&self) -> usize {
        self.constraints.len()
    }

    /// Whether no constraint is set.
    pub fn is_empty(&self) -> bool {
        self.constraints.is_empty()
    }

    /// Whether a constraint with this code is set.
    pub fn contains(&self, code: &str) -> bool {
        self.iter().any(|c| c.code() == code)
    }

    fn use_nearest(&self) -> bool {
        self.iter().any(|c| matches!(c, Constraint::Monotonic { use_nearest: true }))
    }

    /// The sparsity penalty, `l0` before `l1`.
    pub fn sparsity(&self) -> Option<Constraint<F>> {
        self.iter()
            .find(|c| matches!(c, Constraint::L0 { .. }))
            .or_else(|| self.iter().find(|c| matches!(c, Constraint::L1 { .. })))
            .copied()
    }

    /// Build the morphology projection and the linear constraints for a box of `shape`.
    pub(crate) fn resolve(
        &self,
        registry: &OperatorRegistry<F>,
        shape: (usize, usize),
    ) -> ResolvedMorph<F> {
        let size = shape.0 * shape.1;

        let mut chain = vec![Proximal::Plus];
        match self.sparsity() {
            Some(Constraint::L0 { .. }) => {
                if self.contains("l1") {
                    info!("l1 penalty ignored in favor of l0 penalty");
                }
                chain.push(Proximal::Hard { thresh: F::zero() });
            }
            Some(_) => chain.push(Proximal::Soft { thresh: F::zero() }),
            None => {}
        }
        if self.contains("m") {
            chain.push(Proximal::StrictMonotonic {
                order: registry.monotonic_order(shape),
                thresh: F::zero(),
            });
        }
        let prox = if chain.len() > 1 {
            Proximal::Alternating(chain)
        } else {
            Proximal::Plus
        };

        let constraints = self
            .iter()
            .filter_map(|constraint| {
                let (op, prox) = match *constraint {
                    Constraint::Monotonic { use_nearest } => {
                        (registry.radial_monotonic(shape, use_nearest), Proximal::Minus)
                    }
                    Constraint::Symmetric => (registry.symmetry(shape), Proximal::Zero),
                    Constraint::Cone => (
                        registry.identity(size),
                        Proximal::Cone {
                            op: registry.radial_monotonic(shape, self.use_nearest()),
                            sweeps: CONE_SWEEPS,
                        },
                    ),
                    Constraint::PositiveGradientX => (registry.gradient_x(shape), Proximal::Plus),
                    Constraint::TotalVariationX { thresh } => {
                        (registry.gradient_x(shape), Proximal::Soft { thresh })
                    }
                    Constraint::PositiveGradientY => (registry.gradient_y(shape), Proximal::Plus),
                    Constraint::TotalVariationY { thresh } => {
                        (registry.gradient_y(shape), Proximal::Soft { thresh })
                    }
                    Constraint::StrictMonotonic | Constraint::L0 { .. } | Constraint::L1 { .. } => {
                        return None;
                    }
                };
                Some(LinearConstraint { op, prox })
            })
            .collect();

        ResolvedMorph { prox, constraints }
    }
}

impl<F: Float> FromIterator<Constraint<F>> for ConstraintSet<F> {
    fn from_iter<T: IntoIterator<Item = Constraint<F>>>(iter: T) -> Self {
        iter.into_iter().fold(Self::new(), Self::with)
    }
}
