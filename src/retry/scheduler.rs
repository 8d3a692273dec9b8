//! Restartable periodic task driver

use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::error::Error;
use crate::retry::delay;

type Task = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Scheduler behaviour
#[derive(Debug, Clone, Copy, Default)]
pub struct SchedulerOptions {
    /// Run the task once right away instead of waiting one interval
    pub immediate: bool,
    /// Stop on its own after this many iterations
    pub max_iterations: Option<u64>,
}

/// Handle to a periodic task. Cheap to clone; clones control the same run.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

struct Inner {
    name: String,
    task: Task,
    interval: Duration,
    options: SchedulerOptions,
    iterations: AtomicU64,
    generation: AtomicU64,
    run: Mutex<Option<RunState>>,
}

struct RunState {
    generation: u64,
    token: CancellationToken,
}

/// Build a scheduler for `task`. Nothing runs until [`Scheduler::start`].
pub fn create_scheduler<F, Fut>(
    name: impl Into<String>,
    task: F,
    interval: Duration,
    options: SchedulerOptions,
) -> Scheduler
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let task: Task = Arc::new(move || Box::pin(task()) as BoxFuture<'static, ()>);

    Scheduler {
        inner: Arc::new(Inner {
            name: name.into(),
            task,
            interval,
            options,
            iterations: AtomicU64::new(0),
            generation: AtomicU64::new(0),
            run: Mutex::new(None),
        }),
    }
}

impl Scheduler {
    /// Start ticking. Fails with [`Error::SchedulerAlreadyRunning`] if a run is active.
    pub fn start(&self) -> Result<(), Error> {
        self.start_linked(&CancellationToken::new())
    }

    /// Start ticking; cancelling `parent` stops the run like [`Scheduler::stop`].
    pub fn start_linked(&self, parent: &CancellationToken) -> Result<(), Error> {
        let token = parent.child_token();
        let generation = {
            let mut run = self.inner.run.lock();
            if run.as_ref().is_some_and(|r| !r.token.is_cancelled()) {
                return Err(Error::SchedulerAlreadyRunning);
            }
            let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
            self.inner.iterations.store(0, Ordering::SeqCst);
            *run = Some(RunState {
                generation,
                token: token.clone(),
            });
            generation
        };

        tracing::debug!("Scheduler '{}' started ({:?} interval)", self.inner.name, self.inner.interval);

        let inner = self.inner.clone();
        tokio::spawn(async move {
            inner.run_loop(generation, token).await;
        });
        Ok(())
    }

    /// Stop future ticks. A task already executing finishes normally.
    pub fn stop(&self) {
        if let Some(run) = self.inner.run.lock().take() {
            run.token.cancel();
            tracing::debug!("Scheduler '{}' stopped", self.inner.name);
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner
            .run
            .lock()
            .as_ref()
            .is_some_and(|r| !r.token.is_cancelled())
    }

    /// Completed iterations of the current (or last) run
    pub fn iteration_count(&self) -> u64 {
        self.inner.iterations.load(Ordering::SeqCst)
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }
}

impl Inner {
    async fn run_loop(&self, generation: u64, token: CancellationToken) {
        let mut first = true;

        loop {
            if !(first && self.options.immediate) && delay(self.interval, &token).await.is_err() {
                break;
            }
            first = false;

            (self.task)().await;

            // A stale run finishing its last task must not count toward a newer run
            if self.generation.load(Ordering::SeqCst) != generation {
                break;
            }
            let done = self.iterations.fetch_add(1, Ordering::SeqCst) + 1;

            if self.options.max_iterations.is_some_and(|max| done >= max) || token.is_cancelled() {
                break;
            }
        }

        let mut run = self.run.lock();
        if run.as_ref().is_some_and(|r| r.generation == generation) {
            *run = None;
        }
    }
}
