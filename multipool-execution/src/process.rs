//! Manager-side handle of one worker process

use chrono::{DateTime, Utc};
use multipool_ipc::{
    IpcError, MessageReader, MessageWriter, QueueId, StopReason, TaskEnvelope, TaskId,
    TaskMessage, WorkerId, WorkerReport, WorkerSettings,
};
use std::collections::HashMap;
use std::ffi::OsString;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, Mutex as AsyncMutex, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::error::PoolError;

/// Program and leading arguments used to start worker processes
#[derive(Debug, Clone)]
pub struct WorkerCommand {
    program: PathBuf,
    args: Vec<OsString>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Add an argument placed before the worker flags
    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Re-run the current executable in worker mode
    pub fn current_exe() -> Result<Self, PoolError> {
        let current_exe = std::env::current_exe()
            .map_err(|e| PoolError::Spawn(format!("Failed to get current exe: {}", e)))?;
        Ok(Self::new(current_exe))
    }

    pub fn program(&self) -> &PathBuf {
        &self.program
    }
}

/// Worker process status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerProcessStatus {
    Starting,
    Ready,
    Stopping,
}

/// Events forwarded from a worker's output stream to the coordinator
#[derive(Debug)]
pub enum WorkerEvent {
    Report {
        worker_id: WorkerId,
        report: WorkerReport,
    },
    /// The worker's output stream ended
    Exited { worker_id: WorkerId },
}

/// Manager side of one channel pair, shared by every worker bound to it
#[derive(Clone)]
pub struct QueueEndpoints {
    pub tasks: Arc<AsyncMutex<mpsc::Receiver<TaskMessage>>>,
    pub events: mpsc::Sender<WorkerEvent>,
}

/// A single worker process handle
pub struct WorkerProcess {
    pub id: WorkerId,
    pub queue_id: QueueId,
    pub pid: Option<u32>,
    pub started_at: DateTime<Utc>,
    pub restart_count: u32,
    pub status: WorkerProcessStatus,
    child: Option<Child>,
    dispatched: Arc<Mutex<HashMap<TaskId, TaskEnvelope>>>,
    stop_forwarded: Arc<AtomicBool>,
    stop_reason: Option<StopReason>,
    writer: Option<JoinHandle<()>>,
    reader: Option<JoinHandle<()>>,
}

impl WorkerProcess {
    /// Spawn a new worker process bound to `queue`
    pub fn spawn(
        command: &WorkerCommand,
        settings: WorkerSettings,
        queue: &QueueEndpoints,
        restart_count: u32,
    ) -> Result<Self, PoolError> {
        let worker_id = settings.worker_id;
        let queue_id = settings.queue_id;
        debug!("Spawning worker process {} on queue {}", worker_id, queue_id);

        let settings_json = serde_json::to_string(&settings)
            .map_err(|e| PoolError::Spawn(format!("Failed to encode worker settings: {}", e)))?;

        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .arg("--worker")
            .arg("--worker-id")
            .arg(worker_id.to_string())
            .arg("--settings")
            .arg(settings_json)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            PoolError::Spawn(format!(
                "Failed to spawn worker {} ({}): {}",
                worker_id,
                command.program.display(),
                e
            ))
        })?;

        let pid = child.id();

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| PoolError::Spawn("Failed to get stdin".to_string()))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| PoolError::Spawn("Failed to get stdout".to_string()))?;

        let dispatched = Arc::new(Mutex::new(HashMap::new()));
        let stop_forwarded = Arc::new(AtomicBool::new(false));
        let credit = Arc::new(Semaphore::new(settings.concurrency.max(1)));

        let writer = tokio::spawn(stdin_writer_task(
            worker_id,
            stdin,
            queue.tasks.clone(),
            dispatched.clone(),
            credit.clone(),
            settings.ttl,
            stop_forwarded.clone(),
        ));

        let reader = tokio::spawn(stdout_reader_task(
            worker_id,
            stdout,
            queue.events.clone(),
            dispatched.clone(),
            credit,
        ));

        Ok(Self {
            id: worker_id,
            queue_id,
            pid,
            started_at: Utc::now(),
            restart_count,
            status: WorkerProcessStatus::Starting,
            child: Some(child),
            dispatched,
            stop_forwarded,
            stop_reason: None,
            writer: Some(writer),
            reader: Some(reader),
        })
    }

    /// Whether a stop signal was handed to this process
    pub fn stop_forwarded(&self) -> bool {
        self.stop_forwarded.load(Ordering::SeqCst)
    }

    /// Record the reason from the worker's final report
    pub fn record_stopped(&mut self, reason: StopReason) {
        self.stop_reason = Some(reason);
        self.status = WorkerProcessStatus::Stopping;
    }

    /// Reason the worker gave for stopping, `None` if it died without one
    pub fn stop_reason(&self) -> Option<StopReason> {
        self.stop_reason
    }

    /// Tasks forwarded to the process that never completed
    pub fn dispatched_len(&self) -> usize {
        self.dispatched.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Stop forwarding tasks and wait for both I/O tasks to end
    pub async fn detach_io(&mut self) {
        if let Some(writer) = self.writer.take() {
            writer.abort();
            let _ = writer.await;
        }
        if let Some(reader) = self.reader.take() {
            reader.abort();
            let _ = reader.await;
        }
    }

    /// Remove the tasks that were forwarded but never completed
    pub fn take_unfinished(&mut self) -> Vec<TaskEnvelope> {
        let mut dispatched = self.dispatched.lock().unwrap_or_else(|e| e.into_inner());
        let mut unfinished: Vec<_> = dispatched.drain().map(|(_, envelope)| envelope).collect();
        unfinished.sort_by_key(|envelope| envelope.task_id);
        unfinished
    }

    /// Wait for the process to exit, killing it after `grace`
    pub async fn reap(&mut self, grace: Duration) -> Option<ExitStatus> {
        let mut child = self.child.take()?;

        match tokio::time::timeout(grace, child.wait()).await {
            Ok(Ok(status)) => Some(status),
            Ok(Err(e)) => {
                debug!("Worker {} wait failed: {}", self.id, e);
                None
            }
            Err(_) => {
                warn!("Worker {} did not exit after closing its output, killing it", self.id);
                if let Err(e) = child.kill().await {
                    debug!("Failed to kill worker process {}: {}", self.id, e);
                }
                child.wait().await.ok()
            }
        }
    }

    /// Send a kill signal without waiting
    pub fn kill(&mut self) -> bool {
        match self.child.as_mut() {
            Some(child) => match child.start_kill() {
                Ok(()) => true,
                Err(e) => {
                    debug!("Failed to kill worker process {}: {}", self.id, e);
                    false
                }
            },
            None => false,
        }
    }

    pub fn is_alive(&self) -> bool {
        self.child.is_some()
    }
}

/// Forward tasks from the shared queue to the worker's stdin
///
/// A task is only taken from the queue when the worker has spare concurrency,
/// and never more than `ttl` tasks in total, so the worker accepts every task
/// it is sent.
async fn stdin_writer_task(
    worker_id: WorkerId,
    stdin: ChildStdin,
    tasks: Arc<AsyncMutex<mpsc::Receiver<TaskMessage>>>,
    dispatched: Arc<Mutex<HashMap<TaskId, TaskEnvelope>>>,
    credit: Arc<Semaphore>,
    ttl: u64,
    stop_forwarded: Arc<AtomicBool>,
) {
    let mut writer = MessageWriter::new(stdin);
    let mut forwarded = 0u64;

    loop {
        if ttl > 0 && forwarded >= ttl {
            debug!("Worker {} received its full ttl of {} tasks", worker_id, ttl);
            break;
        }

        let Ok(permit) = credit.acquire().await else {
            break;
        };

        let message = {
            let mut tasks = tasks.lock().await;
            tasks.recv().await
        };
        let Some(message) = message else {
            break;
        };

        let is_stop = message.is_stop();
        if let TaskMessage::WorkItem(envelope) = &message {
            // Completion hands the credit back
            permit.forget();
            forwarded += 1;
            dispatched
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(envelope.task_id, envelope.clone());
        } else {
            stop_forwarded.store(true, Ordering::SeqCst);
        }

        if let Err(e) = writer.send(message).await {
            match e {
                IpcError::ConnectionClosed => {
                    debug!("Worker {} stdin closed (worker likely terminated)", worker_id)
                }
                e => error!("Failed to write to worker {} stdin: {}", worker_id, e),
            }
            break;
        }

        if is_stop {
            break;
        }
    }
}

/// Forward reports from the worker's stdout to the coordinator
async fn stdout_reader_task(
    worker_id: WorkerId,
    stdout: ChildStdout,
    events: mpsc::Sender<WorkerEvent>,
    dispatched: Arc<Mutex<HashMap<TaskId, TaskEnvelope>>>,
    credit: Arc<Semaphore>,
) {
    let mut reader = MessageReader::new(stdout);

    loop {
        match reader.receive::<WorkerReport>().await {
            Ok(Some(envelope)) => {
                if let WorkerReport::Completed(result) = &envelope.message {
                    dispatched
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .remove(&result.task_id);
                    credit.add_permits(1);
                }

                let event = WorkerEvent::Report {
                    worker_id,
                    report: envelope.message,
                };
                if events.send(event).await.is_err() {
                    debug!("Coordinator gone, worker {} reader stopping", worker_id);
                    return;
                }
            }
            Ok(None) => {
                debug!("Worker {} stdout closed", worker_id);
                break;
            }
            Err(e) if e.is_fatal() => {
                error!("Failed to read from worker {} stdout: {}", worker_id, e);
                break;
            }
            Err(e) => {
                warn!("Skipping message from worker {}: {}", worker_id, e);
            }
        }
    }

    let _ = events.send(WorkerEvent::Exited { worker_id }).await;
}
