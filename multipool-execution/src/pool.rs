//! Pool manager: worker processes, channel pairs and the results table
//!
//! Every queue id owns one channel pair. Worker `i` is bound to queue
//! `i % queue_count`, and all workers on a queue share its inbound side. A
//! coordination task drains the outbound sides into the results table,
//! replaces workers that retire or crash, and resolves the tasks of dead
//! workers as lost so no caller waits forever.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use futures::stream::{FuturesUnordered, Stream};
use multipool_config::{LoggingConfig, PoolConfig, Validatable};
use multipool_ipc::{
    QueueId, StopReason, TaskEnvelope, TaskId, TaskMessage, TaskOutcome, WorkerId, WorkerReport,
    WorkerSettings,
};
use serde_json::{Map, Value as JsonValue};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex as AsyncMutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::PoolError;
use crate::process::{QueueEndpoints, WorkerCommand, WorkerEvent, WorkerProcess, WorkerProcessStatus};
use crate::scheduler::{QueueLoad, RoundRobin, Scheduler};

/// How long an exited worker may take to be reaped before it is killed
const REAP_GRACE: Duration = Duration::from_millis(500);

/// How long `terminate` waits for killed workers to be reaped
const KILL_GRACE: Duration = Duration::from_secs(5);

/// Final state of a task
#[derive(Debug, Clone, PartialEq)]
enum Completion {
    Outcome(TaskOutcome),
    Lost(String),
}

/// Outstanding tasks and their results, keyed by task id
#[derive(Debug, Default)]
struct ResultsTable {
    outstanding: HashMap<TaskId, QueueId>,
    ready: HashMap<TaskId, Completion>,
    per_queue: Vec<usize>,
    succeeded: u64,
    failed: u64,
    lost: u64,
}

impl ResultsTable {
    fn new(queue_count: usize) -> Self {
        Self {
            per_queue: vec![0; queue_count],
            ..Default::default()
        }
    }

    fn register(&mut self, task_id: TaskId, queue_id: QueueId) {
        self.outstanding.insert(task_id, queue_id);
        self.per_queue[queue_id] += 1;
    }

    fn forget(&mut self, task_id: TaskId) {
        if let Some(queue_id) = self.outstanding.remove(&task_id) {
            self.per_queue[queue_id] -= 1;
        }
    }

    /// Store the final state of an outstanding task. A task resolves once,
    /// later completions for the same id are ignored.
    fn resolve(&mut self, task_id: TaskId, completion: Completion) -> bool {
        let Some(queue_id) = self.outstanding.remove(&task_id) else {
            return false;
        };
        self.per_queue[queue_id] -= 1;

        match &completion {
            Completion::Outcome(TaskOutcome::Value { .. }) => self.succeeded += 1,
            Completion::Outcome(TaskOutcome::Failure { .. }) => self.failed += 1,
            Completion::Lost(_) => self.lost += 1,
        }
        self.ready.insert(task_id, completion);
        true
    }

    fn take(&mut self, task_id: TaskId) -> Option<Completion> {
        self.ready.remove(&task_id)
    }

    fn is_outstanding(&self, task_id: TaskId) -> bool {
        self.outstanding.contains_key(&task_id)
    }

    fn outstanding_ids(&self) -> Vec<TaskId> {
        let mut ids: Vec<_> = self.outstanding.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

fn into_result(task_id: TaskId, completion: Completion) -> Result<JsonValue, PoolError> {
    match completion {
        Completion::Outcome(TaskOutcome::Value { value }) => Ok(value),
        Completion::Outcome(TaskOutcome::Failure { trace }) => {
            Err(PoolError::TaskFailed { task_id, trace })
        }
        Completion::Lost(reason) => Err(PoolError::WorkerLost { task_id, reason }),
    }
}

/// One channel pair and its bookkeeping
struct QueueChannel {
    inbound: mpsc::Sender<TaskMessage>,
    endpoints: QueueEndpoints,
    submitted: AtomicU64,
    live_workers: AtomicUsize,
}

/// Counters of a queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    pub queue_id: QueueId,
    pub live_workers: usize,
    pub submitted: u64,
    pub outstanding: usize,
}

/// Snapshot of pool counters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStats {
    pub live_workers: usize,
    pub thread_width: usize,
    pub queues: Vec<QueueStats>,
    pub outstanding: usize,
    pub succeeded: u64,
    pub failed: u64,
    pub lost: u64,
    /// Workers replaced after reaching their TTL
    pub retirements: u64,
    /// Workers replaced after dying unexpectedly
    pub restarts: u64,
}

/// A live worker process as seen by the manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerInfo {
    pub worker_id: WorkerId,
    pub queue_id: QueueId,
    pub pid: Option<u32>,
    pub status: WorkerProcessStatus,
    pub restart_count: u32,
    pub started_at: DateTime<Utc>,
    /// Tasks forwarded to the process that have no result yet
    pub in_flight: usize,
}

/// Outcome of `join`, `shutdown` and `terminate`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Every worker exited on its own
    pub graceful: bool,
    /// Workers that had to be killed
    pub killed: usize,
    /// Tasks resolved as lost during shutdown
    pub lost: u64,
    pub elapsed: Duration,
}

struct PoolShared {
    config: PoolConfig,
    command: WorkerCommand,
    initializer: Option<(String, Vec<JsonValue>)>,
    log_level: Option<String>,
    queues: Vec<QueueChannel>,
    scheduler: Box<dyn Scheduler>,
    results: Mutex<ResultsTable>,
    workers: AsyncMutex<HashMap<WorkerId, WorkerProcess>>,
    changed: Notify,
    next_task_id: AtomicU64,
    next_worker_id: AtomicU64,
    accepting: AtomicBool,
    terminating: AtomicBool,
    finished: AtomicBool,
    retirements: AtomicU64,
    restarts: AtomicU64,
}

impl PoolShared {
    fn results(&self) -> MutexGuard<'_, ResultsTable> {
        self.results.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn live_workers(&self) -> usize {
        self.queues
            .iter()
            .map(|queue| queue.live_workers.load(Ordering::SeqCst))
            .sum()
    }

    fn candidates(&self) -> Vec<QueueLoad> {
        let results = self.results();
        self.queues
            .iter()
            .enumerate()
            .filter(|(_, queue)| queue.live_workers.load(Ordering::SeqCst) > 0)
            .map(|(queue_id, _)| QueueLoad {
                queue_id,
                outstanding: results.per_queue[queue_id],
            })
            .collect()
    }

    fn resolve(&self, task_id: TaskId, completion: Completion) {
        if self.results().resolve(task_id, completion) {
            self.changed.notify_waiters();
        }
    }

    fn worker_settings(&self, worker_id: WorkerId, queue_id: QueueId) -> WorkerSettings {
        let (initializer, initargs) = match &self.initializer {
            Some((name, args)) => (Some(name.clone()), args.clone()),
            None => (None, Vec::new()),
        };

        WorkerSettings {
            worker_id,
            queue_id,
            thread_width: self.config.thread_width(),
            ttl: self.config.effective_ttl(),
            concurrency: self.config.effective_concurrency(),
            thread_ttl: self.config.max_tasks_per_child,
            thread_concurrency: self.config.child_concurrency.max(1),
            poll_interval_ms: self.config.poll_interval.as_millis().max(1) as u64,
            initializer,
            initargs,
            log_level: self.log_level.clone(),
        }
    }

    /// Spawn a worker on `queue_id` and count it as live
    fn spawn_worker(
        &self,
        workers: &mut HashMap<WorkerId, WorkerProcess>,
        queue_id: QueueId,
        restart_count: u32,
    ) -> Result<WorkerId, PoolError> {
        let worker_id = self.next_worker_id.fetch_add(1, Ordering::SeqCst);
        let queue = &self.queues[queue_id];
        let worker = WorkerProcess::spawn(
            &self.command,
            self.worker_settings(worker_id, queue_id),
            &queue.endpoints,
            restart_count,
        )?;

        queue.live_workers.fetch_add(1, Ordering::SeqCst);
        workers.insert(worker_id, worker);
        Ok(worker_id)
    }

    async fn handle_event(&self, event: WorkerEvent) {
        match event {
            WorkerEvent::Report { worker_id, report } => match report {
                WorkerReport::Ready { pid, .. } => {
                    debug!("Worker {} is ready (pid {})", worker_id, pid);
                    if let Some(worker) = self.workers.lock().await.get_mut(&worker_id) {
                        worker.status = WorkerProcessStatus::Ready;
                    }
                }
                WorkerReport::Completed(result) => {
                    self.resolve(result.task_id, Completion::Outcome(result.outcome));
                }
                WorkerReport::Stopped {
                    accepted,
                    completed,
                    reason,
                    ..
                } => {
                    debug!(
                        "Worker {} stopped: accepted={} completed={} reason={}",
                        worker_id, accepted, completed, reason
                    );
                    if let Some(worker) = self.workers.lock().await.get_mut(&worker_id) {
                        worker.record_stopped(reason);
                    }
                }
            },
            WorkerEvent::Exited { worker_id } => self.handle_exit(worker_id).await,
        }
    }

    async fn handle_exit(&self, worker_id: WorkerId) {
        let mut workers = self.workers.lock().await;
        let Some(mut worker) = workers.remove(&worker_id) else {
            return;
        };

        worker.detach_io().await;
        let status = worker.reap(REAP_GRACE).await;
        let queue_id = worker.queue_id;
        let crashed = worker.stop_reason().is_none();

        if crashed {
            warn!(
                "Worker {} on queue {} died unexpectedly (exit status: {:?})",
                worker_id, queue_id, status
            );
        } else {
            debug!("Worker {} exited ({:?})", worker_id, status);
        }

        // A stop signal was meant for this process, or the pool is going down
        let wants_replacement = !self.terminating.load(Ordering::SeqCst)
            && (self.accepting.load(Ordering::SeqCst) || !worker.stop_forwarded());

        if wants_replacement {
            let restart_count = if crashed {
                worker.restart_count + 1
            } else {
                worker.restart_count
            };
            let allowed = !crashed
                || (self.config.restart_on_crash
                    && worker.restart_count < self.config.max_restart_attempts);

            if allowed {
                match self.spawn_worker(&mut workers, queue_id, restart_count) {
                    Ok(replacement) => {
                        if crashed {
                            self.restarts.fetch_add(1, Ordering::SeqCst);
                        } else if worker.stop_reason() == Some(StopReason::TtlExhausted) {
                            self.retirements.fetch_add(1, Ordering::SeqCst);
                        }
                        info!(
                            "Replaced worker {} with worker {} on queue {}",
                            worker_id, replacement, queue_id
                        );
                    }
                    Err(e) => error!("Failed to replace worker {}: {}", worker_id, e),
                }
            } else {
                error!(
                    "Worker {} on queue {} not restarted after {} restarts",
                    worker_id, queue_id, worker.restart_count
                );
            }
        }

        // The replacement is counted first so the queue never looks dead in between
        self.queues[queue_id]
            .live_workers
            .fetch_sub(1, Ordering::SeqCst);
        drop(workers);

        let unfinished = worker.take_unfinished();
        if !unfinished.is_empty() {
            warn!(
                "Worker {} exited with {} unfinished tasks",
                worker_id,
                unfinished.len()
            );
        }
        for envelope in unfinished {
            self.resolve(
                envelope.task_id,
                Completion::Lost(format!(
                    "worker {} exited before task '{}' completed",
                    worker_id, envelope.function
                )),
            );
        }
        self.changed.notify_waiters();
    }

    /// Fail the queued tasks of queues that have no live worker left
    fn fail_dead_queues(&self) {
        for (queue_id, queue) in self.queues.iter().enumerate() {
            if queue.live_workers.load(Ordering::SeqCst) > 0 {
                continue;
            }
            let Ok(mut tasks) = queue.endpoints.tasks.try_lock() else {
                continue;
            };
            while let Ok(message) = tasks.try_recv() {
                if let TaskMessage::WorkItem(envelope) = message {
                    self.resolve(
                        envelope.task_id,
                        Completion::Lost(format!("no live workers on queue {}", queue_id)),
                    );
                }
            }
        }
    }

    fn fail_unresolved(&self, reason: &str) -> u64 {
        let mut results = self.results();
        let mut lost = 0;
        for task_id in results.outstanding_ids() {
            if results.resolve(task_id, Completion::Lost(reason.to_string())) {
                lost += 1;
            }
        }
        drop(results);
        self.changed.notify_waiters();
        lost
    }

    async fn kill_all(&self) -> usize {
        let mut workers = self.workers.lock().await;
        let mut killed = 0;
        for worker in workers.values_mut().filter(|worker| worker.is_alive()) {
            debug!(
                "Killing worker {} with {} tasks in flight",
                worker.id,
                worker.dispatched_len()
            );
            if worker.kill() {
                killed += 1;
            }
        }
        killed
    }

    /// Wait until `done` holds, re-checking whenever the pool state changes
    async fn wait_until(&self, done: impl Fn(&Self) -> bool) {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if done(self) {
                return;
            }
            notified.await;
        }
    }
}

/// Coordination loop: drain outbound channels and react to worker events
async fn coordinate(shared: Arc<PoolShared>, mut events: Vec<mpsc::Receiver<WorkerEvent>>) {
    let poll_interval = shared.config.poll_interval;

    loop {
        let mut handled = 0usize;
        for receiver in events.iter_mut() {
            while let Ok(event) = receiver.try_recv() {
                shared.handle_event(event).await;
                handled += 1;
            }
        }

        shared.fail_dead_queues();

        if !shared.accepting.load(Ordering::SeqCst) && shared.live_workers() == 0 {
            break;
        }

        if handled == 0 {
            tokio::time::sleep(poll_interval).await;
        } else {
            tokio::task::yield_now().await;
        }
    }

    let lost = shared.fail_unresolved("pool shut down before the task completed");
    if lost > 0 {
        warn!("{} tasks were unresolved when the pool stopped", lost);
    }
    shared.finished.store(true, Ordering::SeqCst);
    shared.changed.notify_waiters();
    debug!("Pool coordinator ended");
}

/// Builder for [`Pool`]
pub struct PoolBuilder {
    config: PoolConfig,
    command: Option<WorkerCommand>,
    scheduler: Option<Box<dyn Scheduler>>,
    initializer: Option<(String, Vec<JsonValue>)>,
    log_level: Option<String>,
}

impl PoolBuilder {
    /// Executable started for every worker, defaults to the current one
    pub fn worker_command(mut self, command: WorkerCommand) -> Self {
        self.command = Some(command);
        self
    }

    pub fn scheduler(mut self, scheduler: impl Scheduler + 'static) -> Self {
        self.scheduler = Some(Box::new(scheduler));
        self
    }

    /// Registered initializer every worker process runs once at start
    pub fn initializer(mut self, name: impl Into<String>, args: Vec<JsonValue>) -> Self {
        self.initializer = Some((name.into(), args));
        self
    }

    /// Log filter handed to worker processes
    pub fn log_level(mut self, level: impl Into<String>) -> Self {
        self.log_level = Some(level.into());
        self
    }

    /// Take the worker log level from a logging configuration
    pub fn logging(mut self, logging: &LoggingConfig) -> Self {
        if logging.propagate_to_workers {
            self.log_level = Some(logging.level.to_string());
        }
        self
    }

    /// Validate the configuration, spawn the workers and start coordinating
    pub async fn start(self) -> Result<Pool, PoolError> {
        self.config.validate()?;

        let command = match self.command {
            Some(command) => command,
            None => WorkerCommand::current_exe()?,
        };

        let capacity = self.config.channel_capacity;
        let mut queues = Vec::with_capacity(self.config.queue_count);
        let mut event_receivers = Vec::with_capacity(self.config.queue_count);
        for _ in 0..self.config.queue_count {
            let (inbound, tasks) = mpsc::channel(capacity);
            let (events, events_rx) = mpsc::channel(capacity);
            queues.push(QueueChannel {
                inbound,
                endpoints: QueueEndpoints {
                    tasks: Arc::new(AsyncMutex::new(tasks)),
                    events,
                },
                submitted: AtomicU64::new(0),
                live_workers: AtomicUsize::new(0),
            });
            event_receivers.push(events_rx);
        }

        let shared = Arc::new(PoolShared {
            results: Mutex::new(ResultsTable::new(self.config.queue_count)),
            config: self.config,
            command,
            initializer: self.initializer,
            log_level: self.log_level,
            queues,
            scheduler: self.scheduler.unwrap_or_else(|| Box::new(RoundRobin::new())),
            workers: AsyncMutex::new(HashMap::new()),
            changed: Notify::new(),
            next_task_id: AtomicU64::new(0),
            next_worker_id: AtomicU64::new(0),
            accepting: AtomicBool::new(true),
            terminating: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            retirements: AtomicU64::new(0),
            restarts: AtomicU64::new(0),
        });

        {
            let mut workers = shared.workers.lock().await;
            for index in 0..shared.config.process_count() {
                let queue_id = shared.config.queue_for_worker(index);
                // Already spawned workers are killed when the map is dropped
                shared.spawn_worker(&mut workers, queue_id, 0)?;
            }
        }

        info!(
            "Started pool: {} processes x {} threads on {} queues ({} scheduling)",
            shared.config.process_count(),
            shared.config.thread_width(),
            shared.config.queue_count,
            shared.scheduler.name()
        );

        let coordinator = tokio::spawn(coordinate(shared.clone(), event_receivers));

        Ok(Pool {
            shared,
            coordinator: Some(coordinator),
        })
    }
}

/// Pool of worker processes, each running an inner thread pool
pub struct Pool {
    shared: Arc<PoolShared>,
    coordinator: Option<JoinHandle<()>>,
}

impl Pool {
    pub fn builder(config: PoolConfig) -> PoolBuilder {
        PoolBuilder {
            config,
            command: None,
            scheduler: None,
            initializer: None,
            log_level: None,
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    /// Place a task on a queue chosen by the scheduler
    ///
    /// Waits while the chosen queue is full.
    pub async fn submit(
        &self,
        function: impl Into<String>,
        args: Vec<JsonValue>,
        kwargs: Map<String, JsonValue>,
    ) -> Result<TaskId, PoolError> {
        if !self.shared.accepting.load(Ordering::SeqCst) {
            return Err(PoolError::Closed);
        }

        let candidates = self.shared.candidates();
        let queue_id = self
            .shared
            .scheduler
            .select(&candidates)
            .ok_or(PoolError::NoLiveWorkers)?;

        let task_id = self.shared.next_task_id.fetch_add(1, Ordering::SeqCst);
        let envelope = TaskEnvelope::new(task_id, function, args, kwargs);
        self.shared.results().register(task_id, queue_id);

        let queue = &self.shared.queues[queue_id];
        if queue
            .inbound
            .send(TaskMessage::WorkItem(envelope))
            .await
            .is_err()
        {
            self.shared.results().forget(task_id);
            return Err(PoolError::Closed);
        }
        queue.submitted.fetch_add(1, Ordering::SeqCst);

        debug!("Submitted task {} to queue {}", task_id, queue_id);
        Ok(task_id)
    }

    /// Wait for the result of a task and remove it from the table
    pub async fn result(&self, task_id: TaskId) -> Result<JsonValue, PoolError> {
        loop {
            let notified = self.shared.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut results = self.shared.results();
                if let Some(completion) = results.take(task_id) {
                    return into_result(task_id, completion);
                }
                if !results.is_outstanding(task_id) {
                    return Err(PoolError::UnknownTask(task_id));
                }
            }

            notified.await;
        }
    }

    /// Submit one task and wait for its result
    pub async fn apply(
        &self,
        function: impl Into<String>,
        args: Vec<JsonValue>,
        kwargs: Map<String, JsonValue>,
    ) -> Result<JsonValue, PoolError> {
        let task_id = self.submit(function, args, kwargs).await?;
        self.result(task_id).await
    }

    /// Call `function` once per item, results in item order
    pub async fn map<I>(&self, function: &str, items: I) -> Result<Vec<JsonValue>, PoolError>
    where
        I: IntoIterator<Item = JsonValue>,
    {
        self.starmap(function, items.into_iter().map(|item| vec![item]))
            .await
    }

    /// Call `function` once per argument list, results in submission order
    pub async fn starmap<I>(&self, function: &str, items: I) -> Result<Vec<JsonValue>, PoolError>
    where
        I: IntoIterator<Item = Vec<JsonValue>>,
    {
        let mut task_ids = Vec::new();
        for args in items {
            task_ids.push(self.submit(function, args, Map::new()).await?);
        }

        join_all(task_ids.iter().map(|task_id| self.result(*task_id)))
            .await
            .into_iter()
            .collect()
    }

    /// Results of `task_ids` in the order they complete
    pub fn as_completed(
        &self,
        task_ids: Vec<TaskId>,
    ) -> impl Stream<Item = (TaskId, Result<JsonValue, PoolError>)> + '_ {
        task_ids
            .into_iter()
            .map(|task_id| async move { (task_id, self.result(task_id).await) })
            .collect::<FuturesUnordered<_>>()
    }

    pub fn stats(&self) -> PoolStats {
        let results = self.shared.results();
        let queues = self
            .shared
            .queues
            .iter()
            .enumerate()
            .map(|(queue_id, queue)| QueueStats {
                queue_id,
                live_workers: queue.live_workers.load(Ordering::SeqCst),
                submitted: queue.submitted.load(Ordering::SeqCst),
                outstanding: results.per_queue[queue_id],
            })
            .collect();

        PoolStats {
            live_workers: self.shared.live_workers(),
            thread_width: self.shared.config.thread_width(),
            queues,
            outstanding: results.outstanding.len(),
            succeeded: results.succeeded,
            failed: results.failed,
            lost: results.lost,
            retirements: self.shared.retirements.load(Ordering::SeqCst),
            restarts: self.shared.restarts.load(Ordering::SeqCst),
        }
    }

    /// Worker processes currently owned by the pool, ordered by id
    pub async fn workers(&self) -> Vec<WorkerInfo> {
        let workers = self.shared.workers.lock().await;
        let mut infos: Vec<_> = workers
            .values()
            .map(|worker| WorkerInfo {
                worker_id: worker.id,
                queue_id: worker.queue_id,
                pid: worker.pid,
                status: worker.status,
                restart_count: worker.restart_count,
                started_at: worker.started_at,
                in_flight: worker.dispatched_len(),
            })
            .collect();
        infos.sort_by_key(|info| info.worker_id);
        infos
    }

    /// Stop accepting submissions and send every worker a stop signal
    ///
    /// Tasks already queued still run. Returns immediately.
    pub async fn close(&self) {
        if !self.shared.accepting.swap(false, Ordering::SeqCst) {
            return;
        }

        for (queue_id, queue) in self.shared.queues.iter().enumerate() {
            let bound = queue.live_workers.load(Ordering::SeqCst);
            debug!("Sending {} stop signals to queue {}", bound, queue_id);
            for _ in 0..bound {
                if queue.inbound.send(TaskMessage::StopSignal).await.is_err() {
                    break;
                }
            }
        }
        self.shared.changed.notify_waiters();
    }

    /// Wait for every worker to exit, killing those still running after
    /// `timeout`. Call [`Pool::close`] first, otherwise workers only stop by
    /// being killed.
    pub async fn join(&self, timeout: Duration) -> ShutdownReport {
        let started = Instant::now();
        let lost_before = self.stats().lost;

        let graceful = tokio::time::timeout(
            timeout,
            self.shared.wait_until(|shared| shared.live_workers() == 0),
        )
        .await
        .is_ok();

        let mut killed = 0;
        if !graceful {
            warn!("Workers still running after {:?}, killing them", timeout);
            killed = self.force_stop().await;
        }

        ShutdownReport {
            graceful,
            killed,
            lost: self.stats().lost - lost_before,
            elapsed: started.elapsed(),
        }
    }

    /// Close the pool and join it using the configured shutdown timeout
    pub async fn shutdown(&self) -> ShutdownReport {
        self.close().await;
        self.join(self.shared.config.shutdown_timeout).await
    }

    /// Kill every worker now. Tasks not yet completed are resolved as lost.
    pub async fn terminate(&self) -> ShutdownReport {
        let started = Instant::now();
        let lost_before = self.stats().lost;
        self.shared.accepting.store(false, Ordering::SeqCst);
        let killed = self.force_stop().await;

        ShutdownReport {
            graceful: false,
            killed,
            lost: self.stats().lost - lost_before,
            elapsed: started.elapsed(),
        }
    }

    async fn force_stop(&self) -> usize {
        self.shared.accepting.store(false, Ordering::SeqCst);
        self.shared.terminating.store(true, Ordering::SeqCst);
        let killed = self.shared.kill_all().await;

        let stopped = tokio::time::timeout(
            KILL_GRACE,
            self.shared
                .wait_until(|shared| shared.finished.load(Ordering::SeqCst)),
        )
        .await;
        if stopped.is_err() {
            error!("Pool coordinator did not finish within {:?}", KILL_GRACE);
        }
        killed
    }

    /// Whether the coordinator finished and every task is resolved
    pub fn is_finished(&self) -> bool {
        self.shared.finished.load(Ordering::SeqCst)
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        if let Some(coordinator) = self.coordinator.take() {
            coordinator.abort();
        }
    }
}
