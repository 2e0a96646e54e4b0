use crate::model::Model;
use anyhow::{bail, Result};
use loader_pool::Batch;
use serde_json::{json, Value};

/// Collects statistics over the validation pass of every checkpoint.
///
/// For each checkpoint the trainer calls `start` once, `run_individual` once
/// per validation batch in delivery order, and `finish` once after the last
/// batch. `output` is the model's forward output for that batch.
pub trait CheckpointHook<M: Model<P>, P> {
    /// Reset per-checkpoint state.
    fn start(&mut self);

    /// Look at one validation batch. An error fails the run.
    fn run_individual(&mut self, model: &M, batch: &Batch<P>, output: &M::Output) -> Result<()>;

    /// Close the checkpoint. Not called when a stop request abandons the
    /// checkpoint before its last batch.
    fn finish(&mut self);

    /// Used in error messages and as the key of [`CheckpointHook::report`].
    fn name(&self) -> &str {
        "checkpoint hook"
    }

    /// What the hook has collected, for the run report.
    fn report(&self) -> Value {
        Value::Null
    }
}

/// Sums a per-key statistic over all validation batches of a checkpoint and
/// keeps one vector of sums per checkpoint.
///
/// `stat` returns `(key, value)` pairs for a batch, with keys below `n_keys`.
/// Keys covered by several batches (for instance a gene split over many cell
/// chunks) have their values added up.
pub struct KeyedAccumulatorHook<F> {
    name: String,
    n_keys: usize,
    stat: F,
    current: Vec<f64>,
    history: Vec<Vec<f64>>,
}

impl<F> KeyedAccumulatorHook<F> {
    /// A hook named `name` summing `stat` over keys `0..n_keys`.
    pub fn new(name: impl Into<String>, n_keys: usize, stat: F) -> Self {
        KeyedAccumulatorHook {
            name: name.into(),
            n_keys,
            stat,
            current: vec![0.0; n_keys],
            history: Vec::new(),
        }
    }

    /// The per-key sums of every finished checkpoint, oldest first.
    pub fn history(&self) -> &[Vec<f64>] {
        &self.history
    }

    /// Sums of the most recent finished checkpoint.
    pub fn latest(&self) -> Option<&[f64]> {
        self.history.last().map(Vec::as_slice)
    }
}

impl<M, P, F> CheckpointHook<M, P> for KeyedAccumulatorHook<F>
where
    M: Model<P>,
    F: FnMut(&M, &Batch<P>, &M::Output) -> Vec<(usize, f64)>,
{
    fn start(&mut self) {
        self.current = vec![0.0; self.n_keys];
    }

    fn run_individual(&mut self, model: &M, batch: &Batch<P>, output: &M::Output) -> Result<()> {
        for (key, value) in (self.stat)(model, batch, output) {
            let Some(slot) = self.current.get_mut(key) else {
                bail!(
                    "key {key} is out of range for {} ({} keys)",
                    self.name,
                    self.n_keys
                );
            };
            *slot += value;
        }
        Ok(())
    }

    fn finish(&mut self) {
        self.history.push(std::mem::take(&mut self.current));
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn report(&self) -> Value {
        json!({
            "name": self.name,
            "n_keys": self.n_keys,
            "checkpoints": self.history,
        })
    }
}
