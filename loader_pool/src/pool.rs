use crate::error::{PoolError, PoolState};
use anyhow::{anyhow, Result};
use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use log::{debug, info, warn};
use minibatch::{BatchDescriptor, PartitionPlan};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Turns a batch descriptor into a payload. Every worker owns its own loader,
/// so `load` can keep scratch buffers in `self`.
pub trait Loader: Send + 'static {
    /// The materialized batch data.
    type Payload: Send + 'static;

    /// Gather the data for one descriptor.
    fn load(&mut self, descriptor: &BatchDescriptor) -> Result<Self::Payload>;
}

/// A materialized batch, owned by the consumer once dequeued.
#[derive(Debug)]
pub struct Batch<P> {
    /// The descriptor this batch was built from.
    pub descriptor: Arc<BatchDescriptor>,
    /// The gathered data.
    pub data: P,
}

struct Job {
    generation: u64,
    descriptor: Arc<BatchDescriptor>,
}

struct Done<P> {
    generation: u64,
    descriptor: Arc<BatchDescriptor>,
    result: Result<P>,
}

// Repeatedly take a descriptor from `jobs`, load it and hand the result back
// until either channel is disconnected.
fn work<L: Loader>(mut loader: L, jobs: Receiver<Job>, done: Sender<Done<L::Payload>>) {
    for job in jobs.iter() {
        let result = panic::catch_unwind(AssertUnwindSafe(|| loader.load(&job.descriptor)))
            .unwrap_or_else(|p| Err(anyhow!("loader panicked: {}", decipher_panic(p))));
        let finished = Done {
            generation: job.generation,
            descriptor: job.descriptor,
            result,
        };
        // the pool hung up
        if done.send(finished).is_err() {
            break;
        }
    }
}

/// A fixed set of worker threads materializing the batches of a
/// [`PartitionPlan`] ahead of the consumer.
///
/// Batches come back in completion order, not plan order; each descriptor is
/// delivered exactly once per pass. Workers only read the shared data the
/// loaders were built from.
pub struct LoaderPool<L: Loader> {
    n_workers: usize,
    shuffle_on_iter: bool,
    rng: ChaCha20Rng,
    jobs: Option<Sender<Job>>,
    // our own end of the job queue, used to discard queued work on restart
    backlog: Option<Receiver<Job>>,
    done: Option<Receiver<Done<L::Payload>>>,
    workers: Vec<JoinHandle<()>>,
    plan: Option<Arc<PartitionPlan>>,
    generation: u64,
    outstanding: usize,
    delivered: usize,
    state: PoolState,
}

impl<L: Loader> LoaderPool<L> {
    /// Spawn `n_workers` threads, each holding a loader built by
    /// `loader_factory(&shared)`. `shared` must be fully loaded; it is only
    /// read from now on.
    pub fn new<C, F>(
        loader_factory: F,
        shared: Arc<C>,
        n_workers: usize,
        shuffle_on_iter: bool,
    ) -> Result<Self, PoolError>
    where
        F: Fn(&Arc<C>) -> Result<L>,
    {
        if n_workers == 0 {
            return Err(PoolError::NoWorkers);
        }
        let loaders = (0..n_workers)
            .map(|worker| {
                loader_factory(&shared).map_err(|source| PoolError::LoaderInit { worker, source })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let (job_send, job_recv) = unbounded();
        // allow a little bit of read-ahead
        let (done_send, done_recv) = bounded(2 * n_workers);

        let mut pool = LoaderPool {
            n_workers,
            shuffle_on_iter,
            rng: ChaCha20Rng::from_entropy(),
            jobs: Some(job_send),
            backlog: Some(job_recv.clone()),
            done: Some(done_recv),
            workers: Vec::with_capacity(n_workers),
            plan: None,
            generation: 0,
            outstanding: 0,
            delivered: 0,
            state: PoolState::Uninitialized,
        };

        for (worker, loader) in loaders.into_iter().enumerate() {
            let jobs = job_recv.clone();
            let done = done_send.clone();
            let handle = thread::Builder::new()
                .name(format!("loader-{worker}"))
                .spawn(move || work(loader, jobs, done))
                .map_err(|e| PoolError::LoaderInit {
                    worker,
                    source: anyhow!(e),
                })?;
            pool.workers.push(handle);
        }
        info!("started loader pool with {n_workers} workers");
        Ok(pool)
    }

    /// Fix the shuffle order used by `shuffle_on_iter`.
    pub fn with_shuffle_seed(mut self, seed: u64) -> Self {
        self.rng = ChaCha20Rng::seed_from_u64(seed);
        self
    }

    /// Number of worker threads.
    pub fn n_workers(&self) -> usize {
        self.n_workers
    }

    /// Current lifecycle state.
    pub fn state(&self) -> PoolState {
        self.state
    }

    /// The plan most recently passed to [`LoaderPool::initialize`].
    pub fn plan(&self) -> Option<&PartitionPlan> {
        self.plan.as_deref()
    }

    /// Batches of the current pass not yet handed to the consumer.
    pub fn remaining(&self) -> usize {
        self.outstanding
    }

    /// True if a pass is queued and nothing has been pulled from it yet, so a
    /// restart would only repeat work.
    pub fn is_pristine(&self) -> bool {
        self.state == PoolState::Ready && self.delivered == 0
    }

    fn check_usable(&self, operation: &'static str) -> Result<(), PoolError> {
        match self.state {
            PoolState::Failed | PoolState::Terminated => Err(PoolError::Lifecycle {
                operation,
                state: self.state,
            }),
            PoolState::Uninitialized | PoolState::Ready => Ok(()),
        }
    }

    /// Queue a new plan, dropping whatever was left of the previous one.
    pub fn initialize(&mut self, plan: impl Into<Arc<PartitionPlan>>) -> Result<(), PoolError> {
        self.check_usable("initialize")?;
        self.plan = Some(plan.into());
        self.enqueue()
    }

    /// Replay the current plan from the beginning.
    pub fn restart(&mut self) -> Result<(), PoolError> {
        self.check_usable("restart")?;
        if self.plan.is_none() {
            return Err(PoolError::Lifecycle {
                operation: "restart",
                state: self.state,
            });
        }
        self.enqueue()
    }

    fn enqueue(&mut self) -> Result<(), PoolError> {
        let (Some(plan), Some(jobs), Some(backlog)) = (&self.plan, &self.jobs, &self.backlog)
        else {
            return Err(PoolError::Lifecycle {
                operation: "enqueue",
                state: self.state,
            });
        };

        // Results of the previous generation still in flight are dropped in next_batch.
        let mut discarded = 0;
        while backlog.try_recv().is_ok() {
            discarded += 1;
        }
        self.generation += 1;

        let mut order: Vec<usize> = (0..plan.len()).collect();
        if self.shuffle_on_iter {
            order.shuffle(&mut self.rng);
        }
        for ix in order {
            let job = Job {
                generation: self.generation,
                descriptor: Arc::new(plan.descriptors()[ix].clone()),
            };
            if jobs.send(job).is_err() {
                self.state = PoolState::Failed;
                return Err(PoolError::WorkersExited);
            }
        }
        debug!(
            "queued {} batches (generation {}, {discarded} stale jobs discarded)",
            plan.len(),
            self.generation
        );
        self.outstanding = plan.len();
        self.delivered = 0;
        self.state = PoolState::Ready;
        Ok(())
    }

    /// Block until a worker finishes a batch of the current pass. Returns
    /// `Ok(None)` once every descriptor of the pass has been delivered.
    ///
    /// A materialization failure leaves the pool [`PoolState::Failed`].
    pub fn next_batch(&mut self) -> Result<Option<Batch<L::Payload>>, PoolError> {
        if self.state != PoolState::Ready {
            return Err(PoolError::Lifecycle {
                operation: "pull a batch from",
                state: self.state,
            });
        }
        if self.outstanding == 0 {
            return Ok(None);
        }
        let Some(done) = &self.done else {
            return Err(PoolError::Lifecycle {
                operation: "pull a batch from",
                state: self.state,
            });
        };

        loop {
            let Ok(finished) = done.recv() else {
                self.state = PoolState::Failed;
                return Err(PoolError::WorkersExited);
            };
            if finished.generation != self.generation {
                continue;
            }
            self.outstanding -= 1;
            self.delivered += 1;
            return match finished.result {
                Ok(data) => Ok(Some(Batch {
                    descriptor: finished.descriptor,
                    data,
                })),
                Err(source) => {
                    self.state = PoolState::Failed;
                    Err(PoolError::BatchMaterialization {
                        descriptor: Box::new((*finished.descriptor).clone()),
                        source,
                    })
                }
            };
        }
    }

    /// Iterate over the remaining batches of the current pass.
    pub fn iter(&mut self) -> Batches<'_, L> {
        Batches {
            pool: self,
            fused: false,
        }
    }

    /// Stop and join all workers. Safe to call more than once; every later
    /// operation fails with [`PoolError::Lifecycle`].
    pub fn terminate(&mut self) {
        if self.state == PoolState::Terminated {
            return;
        }
        if let Some(backlog) = self.backlog.take() {
            while backlog.try_recv().is_ok() {}
        }
        // Hanging up both channels makes every worker fall out of its loop,
        // including the ones blocked on a full result channel.
        self.jobs = None;
        self.done = None;
        for (worker, handle) in self.workers.drain(..).enumerate() {
            if let Err(p) = handle.join() {
                warn!("loader worker {worker} panicked: {}", decipher_panic(p));
            }
        }
        self.outstanding = 0;
        self.state = PoolState::Terminated;
        info!("terminated loader pool with {} workers", self.n_workers);
    }
}

impl<L: Loader> Drop for LoaderPool<L> {
    fn drop(&mut self) {
        self.terminate();
    }
}

/// Iterator over the remaining batches of a pass. Stops after the first error.
pub struct Batches<'a, L: Loader> {
    pool: &'a mut LoaderPool<L>,
    fused: bool,
}

impl<L: Loader> Iterator for Batches<'_, L> {
    type Item = Result<Batch<L::Payload>, PoolError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.fused {
            return None;
        }
        let item = self.pool.next_batch().transpose();
        if !matches!(item, Some(Ok(_))) {
            self.fused = true;
        }
        item
    }
}

fn decipher_panic(p: Box<dyn Any + 'static + Send>) -> String {
    if let Some(&s) = p.downcast_ref::<&'static str>() {
        s.to_string()
    } else if let Ok(s) = p.downcast::<String>() {
        *s
    } else {
        "thread panicked with unrecognized type".to_string()
    }
}
