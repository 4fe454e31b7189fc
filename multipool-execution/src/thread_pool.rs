//! Inner pool of OS threads, each driving its own single-threaded runtime
//!
//! Every thread owns a job channel. Submissions are spread over the threads
//! with a [`RoundRobin`] scheduler, so a blocking task only holds up the
//! thread it was placed on.

use futures::FutureExt;
use multipool_ipc::{InnerTaskId, TaskOutcome};
use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, warn};

use crate::error::WorkerError;
use crate::registry::{TaskCall, TaskRegistry};
use crate::scheduler::{QueueLoad, RoundRobin, Scheduler};

/// Executor the worker loop dispatches accepted tasks to
pub trait InnerPool {
    /// Hand a task to the pool. The returned id is used to poll for the result.
    fn submit(&mut self, call: TaskCall) -> Result<InnerTaskId, WorkerError>;

    /// Remove and return the outcome of a finished task
    fn take_result(&mut self, id: InnerTaskId) -> Option<TaskOutcome>;

    /// Periodic housekeeping, called once per worker loop tick
    fn maintain(&mut self);

    /// Stop accepting work and release the threads
    ///
    /// Blocks until every thread has finished its running tasks. The worker
    /// loop only calls it once nothing is pending, so the wait is short.
    fn close(&mut self);
}

struct Job {
    id: InnerTaskId,
    call: TaskCall,
}

struct Shared {
    registry: TaskRegistry,
    results: Mutex<HashMap<InnerTaskId, TaskOutcome>>,
    thread_concurrency: usize,
}

impl Shared {
    fn store(&self, id: InnerTaskId, outcome: TaskOutcome) {
        let mut results = self.results.lock().unwrap_or_else(|e| e.into_inner());
        results.insert(id, outcome);
    }
}

/// One inner thread and the sending side of its job channel
///
/// The sender is dropped once the thread was handed `thread_ttl` jobs. The
/// thread then finishes what it received and exits.
struct Slot {
    jobs_tx: Option<mpsc::UnboundedSender<Job>>,
    handle: Option<JoinHandle<()>>,
    sent: u64,
}

impl Slot {
    fn spawn(shared: Arc<Shared>, index: usize) -> std::io::Result<Self> {
        let (jobs_tx, jobs_rx) = mpsc::unbounded_channel();
        let handle = thread::Builder::new()
            .name(format!("multipool-inner-{}", index))
            .spawn(move || run_thread(shared, index, jobs_rx))?;

        Ok(Self {
            jobs_tx: Some(jobs_tx),
            handle: Some(handle),
            sent: 0,
        })
    }

    fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, |handle| handle.is_finished())
    }
}

/// Fixed-width pool of threads. Every thread runs up to `thread_concurrency`
/// tasks at once and retires after `thread_ttl` tasks (0 means never).
pub struct ThreadPool {
    shared: Arc<Shared>,
    slots: Vec<Slot>,
    scheduler: RoundRobin,
    /// Jobs waiting for a thread while every slot is retiring
    backlog: VecDeque<Job>,
    thread_ttl: u64,
    next_id: InnerTaskId,
    retired: u64,
    closed: bool,
}

impl ThreadPool {
    pub fn new(
        width: usize,
        thread_ttl: u64,
        thread_concurrency: usize,
        registry: TaskRegistry,
    ) -> Result<Self, WorkerError> {
        let shared = Arc::new(Shared {
            registry,
            results: Mutex::new(HashMap::new()),
            thread_concurrency: thread_concurrency.max(1),
        });

        let mut slots = Vec::with_capacity(width.max(1));
        for index in 0..width.max(1) {
            let slot = Slot::spawn(shared.clone(), index).map_err(|e| {
                WorkerError::Initialization(format!("Failed to spawn inner thread {}: {}", index, e))
            })?;
            slots.push(slot);
        }

        debug!(
            "Inner pool started: width={} thread_ttl={} thread_concurrency={}",
            slots.len(),
            thread_ttl,
            shared.thread_concurrency
        );

        Ok(Self {
            shared,
            slots,
            scheduler: RoundRobin::new(),
            backlog: VecDeque::new(),
            thread_ttl,
            next_id: 0,
            retired: 0,
            closed: false,
        })
    }

    pub fn width(&self) -> usize {
        self.slots.len()
    }

    /// Threads that reached their TTL and were replaced
    pub fn retired_threads(&self) -> u64 {
        self.retired
    }

    /// Place a job on a thread that still takes work, or park it
    fn dispatch(&mut self, job: Job) {
        let candidates: Vec<_> = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.jobs_tx.is_some())
            .map(|(queue_id, _)| QueueLoad {
                queue_id,
                outstanding: 0,
            })
            .collect();

        let Some(index) = self.scheduler.select(&candidates) else {
            self.backlog.push_back(job);
            return;
        };

        let slot = &mut self.slots[index];
        let Some(jobs_tx) = slot.jobs_tx.as_ref() else {
            self.backlog.push_back(job);
            return;
        };

        if let Err(mpsc::error::SendError(job)) = jobs_tx.send(job) {
            warn!("Inner thread {} stopped taking jobs", index);
            slot.jobs_tx = None;
            self.backlog.push_back(job);
            return;
        }

        slot.sent += 1;
        if self.thread_ttl > 0 && slot.sent >= self.thread_ttl {
            debug!("Inner thread {} reached its ttl of {}", index, self.thread_ttl);
            slot.jobs_tx = None;
        }
    }
}

impl InnerPool for ThreadPool {
    fn submit(&mut self, call: TaskCall) -> Result<InnerTaskId, WorkerError> {
        if self.closed {
            return Err(WorkerError::PoolClosed);
        }
        let id = self.next_id;
        self.next_id += 1;

        if !self.shared.registry.contains(&call.function) {
            let trace = format!("unknown task function '{}'", call.function);
            report_failure(&self.shared.registry, &trace);
            self.shared.store(id, TaskOutcome::failure(trace));
            return Ok(id);
        }

        self.dispatch(Job { id, call });
        Ok(id)
    }

    fn take_result(&mut self, id: InnerTaskId) -> Option<TaskOutcome> {
        let mut results = self.shared.results.lock().unwrap_or_else(|e| e.into_inner());
        results.remove(&id)
    }

    fn maintain(&mut self) {
        if self.closed {
            return;
        }

        for (index, slot) in self.slots.iter_mut().enumerate() {
            if !slot.is_finished() {
                continue;
            }

            if let Some(handle) = slot.handle.take() {
                if handle.join().is_err() {
                    warn!("Inner thread {} terminated abnormally", index);
                }
            }
            if slot.jobs_tx.is_none() {
                self.retired += 1;
            }

            match Slot::spawn(self.shared.clone(), index) {
                Ok(fresh) => *slot = fresh,
                Err(e) => {
                    error!("Failed to respawn inner thread {}: {}", index, e);
                    slot.jobs_tx = None;
                }
            }
        }

        for job in std::mem::take(&mut self.backlog) {
            self.dispatch(job);
        }
    }

    fn close(&mut self) {
        self.closed = true;

        // Dropping the senders ends every thread once its running tasks finish
        for slot in self.slots.iter_mut() {
            slot.jobs_tx = None;
        }
        for job in self.backlog.drain(..) {
            self.shared
                .store(job.id, TaskOutcome::failure("inner pool closed before the task ran"));
        }
        for handle in self.slots.iter_mut().filter_map(|slot| slot.handle.take()) {
            if handle.join().is_err() {
                warn!("Inner thread terminated abnormally during close");
            }
        }
    }
}

fn run_thread(shared: Arc<Shared>, index: usize, mut jobs: mpsc::UnboundedReceiver<Job>) {
    let mut builder = tokio::runtime::Builder::new_current_thread();
    builder.enable_all();
    if let Some(bootstrap) = shared.registry.loop_bootstrap() {
        bootstrap(&mut builder);
    }

    let runtime = match builder.build() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Inner thread {} failed to build its runtime: {}", index, e);
            jobs.close();
            while let Ok(job) = jobs.try_recv() {
                shared.store(
                    job.id,
                    TaskOutcome::failure(format!("inner thread {} has no runtime: {}", index, e)),
                );
            }
            return;
        }
    };

    runtime.block_on(async move {
        let permits = Arc::new(Semaphore::new(shared.thread_concurrency));
        let mut running = JoinSet::new();

        loop {
            let Ok(permit) = permits.clone().acquire_owned().await else {
                break;
            };
            let Some(job) = jobs.recv().await else {
                break;
            };

            let shared = shared.clone();
            running.spawn(async move {
                let outcome = execute(&shared.registry, job.call).await;
                shared.store(job.id, outcome);
                drop(permit);
            });

            // Reap finished tasks so the set does not grow without bound
            while running.try_join_next().is_some() {}
        }

        while running.join_next().await.is_some() {}
    });
}


async fn execute(registry: &TaskRegistry, call: TaskCall) -> TaskOutcome {
    let function = call.function.clone();
    let Some(func) = registry.get(&function) else {
        return TaskOutcome::failure(format!("unknown task function '{}'", function));
    };

    let trace = match AssertUnwindSafe(async move { func(call).await })
        .catch_unwind()
        .await
    {
        Ok(Ok(value)) => return TaskOutcome::value(value),
        Ok(Err(e)) => format!("task '{}' failed: {}", function, e),
        Err(payload) => format!("task '{}' panicked: {}", function, panic_message(payload.as_ref())),
    };

    report_failure(registry, &trace);
    TaskOutcome::failure(trace)
}

fn report_failure(registry: &TaskRegistry, trace: &str) {
    debug!("{}", trace);
    if let Some(handler) = registry.failure_handler() {
        handler(trace);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
