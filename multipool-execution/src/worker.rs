//! Worker process: the control loop that feeds the inner pool
//!
//! A worker pulls tasks from its inbound channel, hands them to the inner
//! pool and pushes results to its outbound channel. It stops accepting work
//! on a stop signal, when the inbound channel closes, or once it accepted as
//! many tasks as its TTL allows, and exits after every accepted task has
//! produced a result.

use anyhow::Context;
use clap::Parser;
use multipool_ipc::{
    InnerTaskId, IpcError, MessageReader, MessageWriter, ResultEnvelope, StopReason, TaskEnvelope,
    TaskId, TaskMessage, TaskOutcome, WorkerId, WorkerReport, WorkerSettings,
};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc::{self, error::TryRecvError, error::TrySendError};
use tracing::{debug, error, info, warn};

use crate::error::WorkerError;
use crate::registry::{TaskCall, TaskRegistry};
use crate::thread_pool::{InnerPool, ThreadPool};

/// Limits of one worker process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerBudget {
    /// Tasks accepted before the worker retires, 0 means unlimited
    pub ttl: u64,
    /// Tasks in flight at most
    pub concurrency: usize,
}

impl WorkerBudget {
    pub fn new(ttl: u64, concurrency: usize) -> Self {
        Self {
            ttl,
            concurrency: concurrency.max(1),
        }
    }

    pub fn from_settings(settings: &WorkerSettings) -> Self {
        Self::new(settings.ttl, settings.concurrency)
    }

    fn exhausted(&self, count: u64) -> bool {
        self.ttl > 0 && count >= self.ttl
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Accepting,
    Draining,
    Stopped,
}

/// What one tick of the loop achieved
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    pub dequeued: usize,
    pub completed: usize,
}

impl TickReport {
    pub fn is_idle(&self) -> bool {
        self.dequeued == 0 && self.completed == 0
    }
}

/// Totals reported once a worker loop stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerSummary {
    pub accepted: u64,
    pub completed: u64,
    pub reason: StopReason,
}

pub struct WorkerLoop<P> {
    pool: P,
    inbound: mpsc::Receiver<TaskMessage>,
    outbound: mpsc::Sender<ResultEnvelope>,
    budget: WorkerBudget,
    poll_interval: Duration,
    state: WorkerState,
    pending: HashMap<TaskId, InnerTaskId>,
    held: VecDeque<ResultEnvelope>,
    accepted: u64,
    completed: u64,
    stop_reason: Option<StopReason>,
}

impl<P: InnerPool> WorkerLoop<P> {
    pub fn new(
        pool: P,
        inbound: mpsc::Receiver<TaskMessage>,
        outbound: mpsc::Sender<ResultEnvelope>,
        budget: WorkerBudget,
        poll_interval: Duration,
    ) -> Self {
        Self {
            pool,
            inbound,
            outbound,
            budget,
            poll_interval,
            state: WorkerState::Accepting,
            pending: HashMap::new(),
            held: VecDeque::new(),
            accepted: 0,
            completed: 0,
            stop_reason: None,
        }
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    pub fn accepted(&self) -> u64 {
        self.accepted
    }

    pub fn completed(&self) -> u64 {
        self.completed
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Results waiting for room on the outbound channel
    pub fn held_len(&self) -> usize {
        self.held.len()
    }

    pub fn stop_reason(&self) -> Option<StopReason> {
        self.stop_reason
    }

    /// Run one iteration: accept, collect, flush
    pub fn tick(&mut self) -> TickReport {
        let mut report = TickReport::default();
        if self.state == WorkerState::Stopped {
            return report;
        }

        self.pool.maintain();

        if self.state == WorkerState::Accepting && self.budget.exhausted(self.completed) {
            self.begin_draining(StopReason::TtlExhausted);
        }

        while self.state == WorkerState::Accepting && self.pending.len() < self.budget.concurrency {
            if self.budget.exhausted(self.accepted) {
                self.begin_draining(StopReason::TtlExhausted);
                break;
            }

            match self.inbound.try_recv() {
                Ok(TaskMessage::WorkItem(envelope)) => {
                    self.accept(envelope);
                    report.dequeued += 1;
                }
                Ok(TaskMessage::StopSignal) => {
                    report.dequeued += 1;
                    self.begin_draining(StopReason::StopSignal);
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    self.begin_draining(StopReason::ChannelClosed);
                }
            }
        }

        report.completed = self.collect_results();
        self.flush_held();

        if self.state == WorkerState::Draining && self.pending.is_empty() && self.held.is_empty() {
            debug!(
                "Worker loop stopped: accepted={} completed={}",
                self.accepted, self.completed
            );
            self.state = WorkerState::Stopped;
        }

        report
    }

    /// Tick until the loop stops, backing off while idle
    pub async fn run(&mut self) -> WorkerSummary {
        while self.state != WorkerState::Stopped {
            if self.tick().is_idle() {
                tokio::time::sleep(self.poll_interval).await;
            } else {
                tokio::task::yield_now().await;
            }
        }

        // Joins the inner threads on this thread. Nothing is pending, so they
        // exit as soon as their job channels close. `block_in_place` is not an
        // option because the worker runs a current-thread runtime.
        self.pool.close();
        WorkerSummary {
            accepted: self.accepted,
            completed: self.completed,
            reason: self.stop_reason.unwrap_or(StopReason::ChannelClosed),
        }
    }

    fn begin_draining(&mut self, reason: StopReason) {
        debug!("Worker loop draining: {}", reason);
        self.state = WorkerState::Draining;
        self.stop_reason.get_or_insert(reason);
    }

    fn accept(&mut self, envelope: TaskEnvelope) {
        let task_id = envelope.task_id;
        self.accepted += 1;

        match self.pool.submit(TaskCall::from(envelope)) {
            Ok(inner_id) => {
                self.pending.insert(task_id, inner_id);
            }
            Err(e) => {
                // Accepted work always produces a result
                self.held.push_back(ResultEnvelope::new(
                    task_id,
                    TaskOutcome::failure(format!("inner pool rejected task: {}", e)),
                ));
            }
        }
    }

    fn collect_results(&mut self) -> usize {
        let pool = &mut self.pool;
        let mut finished = Vec::new();
        self.pending.retain(|task_id, inner_id| match pool.take_result(*inner_id) {
            Some(outcome) => {
                finished.push(ResultEnvelope::new(*task_id, outcome));
                false
            }
            None => true,
        });

        let count = finished.len();
        self.held.extend(finished);
        count
    }

    fn flush_held(&mut self) {
        while let Some(result) = self.held.pop_front() {
            match self.outbound.try_send(result) {
                // A task counts as completed once its result is pushed
                Ok(()) => self.completed += 1,
                Err(TrySendError::Full(result)) => {
                    self.held.push_front(result);
                    break;
                }
                Err(TrySendError::Closed(result)) => {
                    error!(
                        "Outbound channel closed, dropping result of task {}",
                        result.task_id
                    );
                }
            }
        }
    }
}

/// Serve one worker process over a pair of byte streams
///
/// Runs the configured initializer, announces readiness, then runs the worker
/// loop until it stops and reports the totals.
pub async fn serve<R, W>(
    settings: WorkerSettings,
    registry: TaskRegistry,
    input: R,
    output: W,
) -> Result<WorkerSummary, WorkerError>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let worker_id = settings.worker_id;

    if let Some(name) = &settings.initializer {
        let init = registry
            .initializer(name)
            .ok_or_else(|| WorkerError::Initialization(format!("unknown initializer '{}'", name)))?;
        init(&settings.initargs)
            .map_err(|e| WorkerError::Initialization(format!("initializer '{}': {}", name, e)))?;
        debug!("Worker {} ran initializer {}", worker_id, name);
    }

    let pool = ThreadPool::new(
        settings.thread_width,
        settings.thread_ttl,
        settings.thread_concurrency,
        registry,
    )?;

    let mut writer = MessageWriter::new(output);
    writer
        .send(WorkerReport::Ready {
            worker_id,
            pid: std::process::id(),
        })
        .await?;

    let budget = WorkerBudget::from_settings(&settings);
    let (inbound_tx, inbound_rx) = mpsc::channel(budget.concurrency + 1);
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<ResultEnvelope>(budget.concurrency);

    let reader_task = tokio::spawn(async move {
        let mut reader = MessageReader::new(input);
        loop {
            match reader.receive::<TaskMessage>().await {
                Ok(Some(envelope)) => {
                    if inbound_tx.send(envelope.message).await.is_err() {
                        break;
                    }
                }
                Ok(None) => {
                    debug!("Worker {} input closed", worker_id);
                    break;
                }
                Err(e) => {
                    error!("Worker {} failed to read task stream: {}", worker_id, e);
                    break;
                }
            }
        }
    });

    let writer_task = tokio::spawn(async move {
        while let Some(result) = outbound_rx.recv().await {
            writer.send(WorkerReport::Completed(result)).await?;
        }
        Ok::<_, IpcError>(writer)
    });

    let mut worker_loop = WorkerLoop::new(
        pool,
        inbound_rx,
        outbound_tx,
        budget,
        Duration::from_millis(settings.poll_interval_ms.max(1)),
    );
    let summary = worker_loop.run().await;

    // Dropping the loop closes the outbound channel so the writer drains and ends
    drop(worker_loop);
    reader_task.abort();

    let mut writer = writer_task
        .await
        .map_err(|e| WorkerError::Join(e.to_string()))??;
    writer
        .send(WorkerReport::Stopped {
            worker_id,
            accepted: summary.accepted,
            completed: summary.completed,
            reason: summary.reason,
        })
        .await?;
    writer.close().await?;

    Ok(summary)
}

/// Command line of a worker process
#[derive(Debug, Parser)]
#[command(name = "multipool-worker", about = "Worker process of a multipool pool")]
pub struct WorkerArgs {
    /// Run as worker process (internal use)
    #[arg(long, hide = true)]
    pub worker: bool,

    /// Worker ID (used with --worker)
    #[arg(long, value_name = "ID")]
    pub worker_id: Option<WorkerId>,

    /// Worker settings as JSON
    #[arg(long, value_name = "JSON")]
    pub settings: String,
}

/// Entry point of a worker executable built around `registry`
pub fn worker_main(registry: TaskRegistry) -> anyhow::Result<()> {
    let args = WorkerArgs::parse();
    if !args.worker {
        anyhow::bail!("multipool-worker is started by a pool manager with --worker");
    }

    let mut settings: WorkerSettings =
        serde_json::from_str(&args.settings).context("Invalid worker settings")?;
    if let Some(worker_id) = args.worker_id {
        settings.worker_id = worker_id;
    }

    // Worker processes log to stderr, stdout carries the result stream
    multipool_logging::init_worker_tracing(settings.log_level.as_deref())?;
    info!(
        "Starting worker {} on queue {} with {} threads",
        settings.worker_id, settings.queue_id, settings.thread_width
    );

    let mut builder = tokio::runtime::Builder::new_current_thread();
    builder.enable_all();
    if let Some(bootstrap) = registry.loop_bootstrap() {
        bootstrap(&mut builder);
    }
    let runtime = builder.build().context("Failed to build worker runtime")?;

    let worker_id = settings.worker_id;
    let result = runtime.block_on(serve(
        settings,
        registry,
        tokio::io::stdin(),
        tokio::io::stdout(),
    ));
    // Stdin reads block a runtime thread, do not wait for them
    runtime.shutdown_background();

    match result {
        Ok(summary) => {
            info!(
                "Worker {} shutting down: accepted={} completed={} reason={}",
                worker_id, summary.accepted, summary.completed, summary.reason
            );
            Ok(())
        }
        Err(e) => {
            warn!("Worker {} failed: {}", worker_id, e);
            Err(e.into())
        }
    }
}
