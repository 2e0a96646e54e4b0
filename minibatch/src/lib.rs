//! Split cell and gene index sets into rectangular minibatches.
//!
//! A [`PartitionPlan`] is the ordered list of [`BatchDescriptor`]s covering
//! one epoch. Plans are immutable once built; loaders replay them as often as
//! they like.
#![deny(missing_docs)]

mod bins;
mod error;
mod folds;

pub use bins::{
    BatchDescriptor, PartitionPlan, create_bins, create_bins_ordered, create_bins_random,
    select_masked,
};
pub use error::{Axis, ConfigurationError};
pub use folds::{BinSteps, Fold, FoldPlans, generate_folds};
