//! Error taxonomy of the deblender.
//!
//! Only configuration errors are reported through [`DeblendError`].
//! Numerical degeneracies are masked or skipped inside the fit, and running out of
//! iterations is a regular outcome.

use thiserror::Error;

/// Errors raised while configuring sources, constraints or blends.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DeblendError {
    /// A per-component array does not have one row per component.
    #[error("{what} has {actual} components, expected {expected}")]
    ComponentMismatch {
        /// Name of the offending array.
        what: &'static str,
        /// Declared number of components.
        expected: usize,
        /// Number of rows found.
        actual: usize,
    },

    /// An array has an incompatible shape.
    #[error("{what} has shape {actual:?}, expected {expected:?}")]
    ShapeMismatch {
        /// Name of the offending array.
        what: &'static str,
        /// Expected shape.
        expected: Vec<usize>,
        /// Shape found.
        actual: Vec<usize>,
    },

    /// A block index outside `0..2K` was requested.
    #[error("block index {index} out of range for {blocks} blocks")]
    BlockIndex {
        /// Requested block.
        index: usize,
        /// Number of blocks (`2K`).
        blocks: usize,
    },

    /// A source/component pair that does not exist was requested.
    #[error("source {source_index} has no component {component}")]
    ComponentIndex {
        /// Source index.
        source_index: usize,
        /// Component index inside the source.
        component: usize,
    },

    /// The constraint code is not known.
    #[error("unrecognized constraint code `{0}`")]
    UnknownConstraint(String),

    /// The integer centroid of a source lies outside the image.
    #[error("centroid ({y:.2}, {x:.2}) lies outside the {height}x{width} image")]
    CenterOutsideImage {
        /// Row coordinate.
        y: f64,
        /// Column coordinate.
        x: f64,
        /// Image height.
        height: usize,
        /// Image width.
        width: usize,
    },

    /// A blend needs at least one source.
    #[error("blend contains no sources")]
    EmptyBlend,

    /// The blend was used before data was bound to it.
    #[error("no observation bound to the blend, call `set_data` first")]
    NoData,

    /// A convolution kernel cannot be used.
    #[error("invalid kernel: {0}")]
    InvalidKernel(&'static str),
}

/// Result type of this crate.
pub type Result<T> = std::result::Result<T, DeblendError>;
