use anyhow::Result;
use loader_pool::Batch;
use serde::{Deserialize, Serialize};

/// Flat parameter vector with a gradient accumulator of the same length.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameters {
    /// Current parameter values.
    pub values: Vec<f64>,
    /// Gradient accumulated since the last optimizer step.
    pub grads: Vec<f64>,
}

impl Parameters {
    /// `n` parameters set to `init`, with zeroed gradients.
    pub fn filled(n: usize, init: f64) -> Self {
        Parameters {
            values: vec![init; n],
            grads: vec![0.0; n],
        }
    }

    /// Number of parameters.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// True if the model has no parameters.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// A trainable model over batches with payload `P`.
pub trait Model<P> {
    /// What `forward` produces; also the shape of the loss gradient.
    type Output;

    /// Evaluate the model on one batch. Must not touch the gradients.
    fn forward(&self, batch: &Batch<P>) -> Result<Self::Output>;

    /// Add the parameter gradient to the accumulator, given the gradient of
    /// the loss with respect to `output`.
    fn backward(
        &mut self,
        batch: &Batch<P>,
        output: &Self::Output,
        output_grad: &Self::Output,
    ) -> Result<()>;

    /// The parameters an optimizer updates.
    fn get_parameters(&self) -> &Parameters;

    /// Mutable access for the optimizer.
    fn parameters_mut(&mut self) -> &mut Parameters;
}

/// Caller supplied scoring of a model output against the batch's target.
/// The trainer minimizes it and otherwise treats it as an opaque scalar.
pub trait Loss<O, P> {
    /// Scalar loss of `output` on `batch`.
    fn loss(&self, output: &O, batch: &Batch<P>) -> f64;

    /// Gradient of [`Loss::loss`] with respect to `output`.
    fn gradient(&self, output: &O, batch: &Batch<P>) -> O;
}

/// Gradient based parameter update.
pub trait Optimizer {
    /// Reset the gradient accumulator.
    fn zero_accumulated_gradient(&mut self, params: &mut Parameters) {
        params.grads.iter_mut().for_each(|g| *g = 0.0);
    }

    /// Apply the accumulated gradient.
    fn step(&mut self, params: &mut Parameters);
}
