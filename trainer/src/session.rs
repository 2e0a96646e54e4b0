use crate::error::{TrainError, TrainErrorKind};
use crate::hooks::CheckpointHook;
use crate::model::{Loss, Model, Optimizer};
use crate::trace::TrainingTrace;
use crate::train::{train, StopSignal, TrainConfig};
use loader_pool::{Loader, LoaderPool};
use serde_json::{Map, Value};

/// Owns everything one training run needs: the model, its optimizer and
/// loss, both loader pools and the checkpoint hooks.
///
/// The pools are consumed by [`TrainingSession::train`]; a session trains
/// once. Dropping an untrained session terminates its pools.
pub struct TrainingSession<M, P, L, V>
where
    M: Model<P>,
    L: Loader<Payload = P>,
    V: Loader<Payload = P>,
{
    model: M,
    optimizer: Box<dyn Optimizer>,
    loss: Box<dyn Loss<M::Output, P>>,
    pools: Option<(LoaderPool<L>, LoaderPool<V>)>,
    hooks: Vec<Box<dyn CheckpointHook<M, P>>>,
    config: TrainConfig,
    stop: StopSignal,
}

impl<M, P, L, V> TrainingSession<M, P, L, V>
where
    M: Model<P>,
    L: Loader<Payload = P>,
    V: Loader<Payload = P>,
{
    /// A session that trains `model` on `train_pool`, validating on
    /// `validation_pool`. Both pools must already be initialized.
    pub fn new(
        model: M,
        optimizer: Box<dyn Optimizer>,
        loss: Box<dyn Loss<M::Output, P>>,
        train_pool: LoaderPool<L>,
        validation_pool: LoaderPool<V>,
        config: TrainConfig,
    ) -> Self {
        TrainingSession {
            model,
            optimizer,
            loss,
            pools: Some((train_pool, validation_pool)),
            hooks: Vec::new(),
            config,
            stop: StopSignal::new(),
        }
    }

    /// Register a hook; hooks run in registration order.
    pub fn add_hook(&mut self, hook: Box<dyn CheckpointHook<M, P>>) -> &mut Self {
        self.hooks.push(hook);
        self
    }

    /// Replace the session's stop signal, e.g. with one that a process-wide
    /// interrupt handler raises.
    pub fn with_stop_signal(mut self, stop: StopSignal) -> Self {
        self.stop = stop;
        self
    }

    /// A handle that stops [`TrainingSession::train`] from another thread.
    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    /// Run [`crate::train`] with everything the session owns. A second call
    /// fails with [`TrainErrorKind::Config`].
    pub fn train(&mut self) -> Result<TrainingTrace, TrainError> {
        let Some((train_pool, validation_pool)) = self.pools.take() else {
            return Err(TrainError::new(
                TrainErrorKind::Config("this session has already been trained".to_string()),
                TrainingTrace::default(),
            ));
        };
        let mut hooks: Vec<&mut dyn CheckpointHook<M, P>> = self
            .hooks
            .iter_mut()
            .map(|h| h.as_mut() as &mut dyn CheckpointHook<M, P>)
            .collect();
        train(
            &mut self.model,
            train_pool,
            validation_pool,
            self.optimizer.as_mut(),
            self.loss.as_ref(),
            &self.config,
            &mut hooks,
            &self.stop,
        )
    }

    /// The model, trained or not.
    pub fn model(&self) -> &M {
        &self.model
    }

    #[allow(missing_docs)]
    pub fn into_model(self) -> M {
        self.model
    }

    /// Reports of all hooks, keyed by hook name.
    pub fn hook_reports(&self) -> Value {
        let reports: Map<String, Value> = self
            .hooks
            .iter()
            .map(|h| (h.name().to_string(), h.report()))
            .collect();
        Value::Object(reports)
    }
}
