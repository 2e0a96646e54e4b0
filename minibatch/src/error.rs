use std::fmt;

/// The two dimensions that are batched over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Axis {
    /// Axis A, usually cells.
    Cells,
    /// Axis B, usually genes.
    Genes,
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Axis::Cells => write!(f, "cell"),
            Axis::Genes => write!(f, "gene"),
        }
    }
}

/// Invalid parameters passed to the partitioner or the fold generator.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigurationError {
    #[error("the {axis} index set is empty")]
    EmptyIndexSet { axis: Axis },

    #[error("the {axis} step size must be positive")]
    ZeroStep { axis: Axis },

    #[error("{axis} index {index} is out of range for an axis of size {size}")]
    IndexOutOfRange { axis: Axis, index: usize, size: usize },

    #[error("the mask covers {mask_len} items but index {index} was requested")]
    MaskTooShort { mask_len: usize, index: usize },

    #[error(
        "all {n_items} {axis} indices fit in a single partial chunk of step {step}, \
         and use_all is false"
    )]
    NoCompleteChunk { axis: Axis, n_items: usize, step: usize },

    #[error("cannot split {n_cells} cells into {n_folds} folds")]
    InvalidFolds { n_cells: usize, n_folds: usize },
}
