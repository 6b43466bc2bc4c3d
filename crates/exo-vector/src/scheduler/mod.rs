//! Worker-pool scheduler for chunk embedding tasks.
//!
//! A fixed pool of tokio tasks shares one bounded queue. `run_batch` admits
//! tasks (waiting while the queue is full), collects one `ProcessingResult` per
//! task on a per-batch channel, and checks memory pressure between completions.
//! The scheduler never retries; fallback lives in the embedding engine.
//!
//! Each job carries a clone of the batch's reply sender. Once admission ends
//! the batch drops its own sender, so a job lost with its worker shows up as a
//! closed channel and is reported `Failed` instead of stalling the batch.

pub mod state_machine;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use exo_core::config::SchedulerConfig;
use exo_core::error::{ExoError, Result};
use exo_core::types::{
    BatchReport, DeviceId, PressureThresholds, ProcessingResult, ProcessingTask, TaskState,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::engine::EmbeddingEngine;
use state_machine::advance;

struct Job {
    task: ProcessingTask,
    reply: mpsc::UnboundedSender<ProcessingResult>,
}

struct WorkerShared {
    engine: Arc<EmbeddingEngine>,
    queue: tokio::sync::Mutex<mpsc::Receiver<Job>>,
    abort: AtomicBool,
    processed: AtomicU64,
}

/// Receiver for a task submitted with `try_submit`.
#[derive(Debug)]
pub struct TaskHandle {
    rx: mpsc::UnboundedReceiver<ProcessingResult>,
}

impl TaskHandle {
    /// Wait for the task's result.
    pub async fn wait(mut self) -> Result<ProcessingResult> {
        self.rx.recv().await.ok_or(ExoError::ShuttingDown)
    }
}

/// Long-lived pool of embedding workers.
pub struct Scheduler {
    shared: Arc<WorkerShared>,
    sender: Mutex<Option<mpsc::Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    worker_count: usize,
    queue_capacity: usize,
    pressure_check_interval: usize,
    thresholds: PressureThresholds,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("worker_count", &self.worker_count)
            .field("queue_capacity", &self.queue_capacity)
            .finish()
    }
}

impl Scheduler {
    /// Start the worker pool. Must be called from within a tokio runtime.
    pub fn new(
        engine: Arc<EmbeddingEngine>,
        config: &SchedulerConfig,
        thresholds: PressureThresholds,
    ) -> Self {
        let usable = engine.profiler().usable_devices().len();
        let worker_count = config.effective_workers(usable);
        let queue_capacity = config.effective_queue_capacity(worker_count);
        let (tx, rx) = mpsc::channel(queue_capacity);

        let shared = Arc::new(WorkerShared {
            engine,
            queue: tokio::sync::Mutex::new(rx),
            abort: AtomicBool::new(false),
            processed: AtomicU64::new(0),
        });
        let workers = (0..worker_count)
            .map(|id| tokio::spawn(worker_loop(id, Arc::clone(&shared))))
            .collect();

        info!(
            workers = worker_count,
            queue_capacity,
            usable_devices = usable,
            "Scheduler started"
        );
        Self {
            shared,
            sender: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
            worker_count,
            queue_capacity,
            pressure_check_interval: config.pressure_check_interval.max(1),
            thresholds,
        }
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    pub fn queue_capacity(&self) -> usize {
        self.queue_capacity
    }

    /// Tasks finished by the workers since startup, cancelled ones included.
    pub fn processed_count(&self) -> u64 {
        self.shared.processed.load(Ordering::Relaxed)
    }

    fn sender(&self) -> Result<mpsc::Sender<Job>> {
        self.sender
            .lock()
            .map_err(|e| ExoError::InvalidInput(format!("Lock poisoned: {}", e)))?
            .clone()
            .ok_or(ExoError::ShuttingDown)
    }

    /// Queue one task without waiting.
    ///
    /// Returns `TaskQueueFull` when the queue has no free slot.
    pub fn try_submit(&self, task: ProcessingTask) -> Result<TaskHandle> {
        let sender = self.sender()?;
        let (reply, rx) = mpsc::unbounded_channel();
        sender.try_send(Job { task, reply }).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => ExoError::TaskQueueFull {
                capacity: self.queue_capacity,
            },
            mpsc::error::TrySendError::Closed(_) => ExoError::ShuttingDown,
        })?;
        Ok(TaskHandle { rx })
    }

    /// Run every task to a terminal state and aggregate the results.
    ///
    /// Higher-priority tasks are admitted first. The returned report holds
    /// exactly one result per task, sorted by source ordinal then sequence index.
    pub async fn run_batch(&self, tasks: Vec<ProcessingTask>) -> Result<BatchReport> {
        let started = Instant::now();
        let sender = self.sender()?;
        let monitor = Arc::clone(self.shared.engine.monitor());
        self.shared.abort.store(false, Ordering::SeqCst);

        let tasks = admission_order(tasks);
        let total = tasks.len();
        info!(tasks = total, workers = self.worker_count, "Batch started");

        let (reply_tx, mut reply_rx) = mpsc::unbounded_channel();
        let mut reply_tx = Some(reply_tx);
        let mut pending = tasks.into_iter();
        let mut next = pending.next();
        let mut outstanding = HashMap::new();
        let mut results = Vec::with_capacity(total);
        let mut since_check = 0usize;
        let mut releases = 0u64;

        while results.len() < total {
            if self.shared.abort.load(Ordering::SeqCst) {
                for task in next.take().into_iter().chain(pending.by_ref()) {
                    results.push(cancelled(task));
                }
                if results.len() >= total {
                    break;
                }
            }
            if next.is_none() {
                reply_tx = None;
            }

            tokio::select! {
                permit = sender.reserve(), if next.is_some() => {
                    let permit = permit.map_err(|_| ExoError::ShuttingDown)?;
                    if let (Some(task), Some(reply)) = (next.take(), reply_tx.as_ref()) {
                        outstanding.insert(task.id, task.clone());
                        permit.send(Job { task, reply: reply.clone() });
                    }
                    next = pending.next();
                }
                received = reply_rx.recv() => match received {
                    Some(result) => {
                        outstanding.remove(&result.task_id);
                        results.push(result);
                        since_check += 1;
                        if since_check >= self.pressure_check_interval {
                            since_check = 0;
                            if monitor.should_release_pressure_async(self.thresholds).await {
                                monitor.release_pressure_async().await;
                                releases += 1;
                            }
                        }
                    }
                    None => {
                        // Every job sender is gone: the rest went down with their worker.
                        for (_, task) in outstanding.drain() {
                            warn!(task_id = %task.id, "Task lost before reporting");
                            results.push(lost(task, "worker exited before reporting".into()));
                        }
                        break;
                    }
                },
            }
        }

        let report = BatchReport::from_results(results, started.elapsed(), releases);
        info!(
            tasks = total,
            succeeded = report.success_count,
            failed = report.failure_count,
            cancelled = report.cancelled_count,
            pressure_releases = releases,
            elapsed_ms = report.total_time.as_millis() as u64,
            "Batch complete"
        );
        Ok(report)
    }

    /// Cancel the batch in progress.
    ///
    /// Tasks still queued or not yet admitted come back as `Cancelled`; tasks
    /// already on a worker finish normally.
    pub fn abort(&self) {
        self.shared.abort.store(true, Ordering::SeqCst);
        info!("Batch abort requested");
    }

    /// Close the queue and wait for every worker to exit.
    pub async fn shutdown(&self) {
        if let Ok(mut sender) = self.sender.lock() {
            sender.take();
        }
        let workers = match self.workers.lock() {
            Ok(mut w) => std::mem::take(&mut *w),
            Err(_) => Vec::new(),
        };
        for handle in workers {
            if let Err(e) = handle.await {
                warn!(error = %e, "Worker exited abnormally");
            }
        }
        info!("Scheduler shut down");
    }
}

/// Highest priority first; input order within a priority level.
fn admission_order(mut tasks: Vec<ProcessingTask>) -> Vec<ProcessingTask> {
    tasks.sort_by(|a, b| b.priority.cmp(&a.priority));
    tasks
}

async fn worker_loop(id: usize, shared: Arc<WorkerShared>) {
    debug!(worker = id, "Worker started");
    loop {
        let job = {
            let mut queue = shared.queue.lock().await;
            queue.recv().await
        };
        let Some(Job { task, reply }) = job else {
            break;
        };

        let result = if shared.abort.load(Ordering::SeqCst) {
            cancelled(task)
        } else {
            let queued = task.clone();
            match tokio::spawn(process(id, Arc::clone(&shared), task)).await {
                Ok(result) => result,
                Err(e) => {
                    warn!(worker = id, task_id = %queued.id, error = %e, "Task did not complete");
                    lost(queued, format!("worker task failed: {}", e))
                }
            }
        };
        shared.processed.fetch_add(1, Ordering::Relaxed);
        // The batch may have gone away; nothing to do with an orphaned result.
        let _ = reply.send(result);
    }
    debug!(worker = id, "Worker stopped");
}

async fn process(
    worker: usize,
    shared: Arc<WorkerShared>,
    mut task: ProcessingTask,
) -> ProcessingResult {
    let fallback_device = task.device_preference.unwrap_or(DeviceId::Cpu);
    if let Err(e) = advance(&mut task, TaskState::Assigned)
        .and_then(|_| advance(&mut task, TaskState::Processing))
    {
        warn!(worker, task_id = %task.id, error = %e, "Task rejected");
        return finished(task, Vec::new(), fallback_device, Duration::ZERO, 0, Some(e.to_string()));
    }

    let monitor = shared.engine.monitor();
    let before = monitor.host_used_bytes_async().await;
    let started = Instant::now();
    let outcome = shared
        .engine
        .embed_batch(std::slice::from_ref(&task.chunk.text), task.device_preference)
        .await;
    let duration = started.elapsed();
    let delta = monitor.host_used_bytes_async().await as i64 - before as i64;

    let (vector, device, error) = match outcome {
        Ok(mut out) => match (out.failures.pop(), out.vectors.pop()) {
            (Some(failure), _) => (Vec::new(), failure.device, Some(failure.error)),
            (None, Some(vector)) => {
                let device = out.devices.pop().unwrap_or(out.stats.device);
                (vector, device, None)
            }
            (None, None) => (
                Vec::new(),
                out.stats.device,
                Some("engine returned no vector".to_string()),
            ),
        },
        Err(e) => (Vec::new(), fallback_device, Some(e.to_string())),
    };

    debug!(
        worker,
        task_id = %task.id,
        source = %task.source_id,
        seq = task.chunk.sequence_index,
        device = %device,
        success = error.is_none(),
        duration_ms = duration.as_millis() as u64,
        "Task processed"
    );
    finished(task, vector, device, duration, delta, error)
}

fn finished(
    mut task: ProcessingTask,
    vector: Vec<f32>,
    device_used: DeviceId,
    duration: Duration,
    memory_delta_bytes: i64,
    error: Option<String>,
) -> ProcessingResult {
    let to = if error.is_none() {
        TaskState::Completed
    } else {
        TaskState::Failed
    };
    // A task rejected before processing is reported failed without a transition.
    if advance(&mut task, to).is_err() {
        task.state = TaskState::Failed;
    }
    ProcessingResult {
        task_id: task.id,
        source_id: task.source_id,
        source_ordinal: task.source_ordinal,
        sequence_index: task.chunk.sequence_index,
        chunk: task.chunk,
        vector,
        device_used,
        duration,
        memory_delta_bytes,
        success: error.is_none(),
        error,
        state: task.state,
    }
}

/// Failed result for a task that never produced one of its own.
fn lost(task: ProcessingTask, reason: String) -> ProcessingResult {
    let device = task.device_preference.unwrap_or(DeviceId::Cpu);
    finished(task, Vec::new(), device, Duration::ZERO, 0, Some(reason))
}

fn cancelled(mut task: ProcessingTask) -> ProcessingResult {
    if advance(&mut task, TaskState::Cancelled).is_err() {
        task.state = TaskState::Cancelled;
    }
    ProcessingResult {
        task_id: task.id,
        source_id: task.source_id,
        source_ordinal: task.source_ordinal,
        sequence_index: task.chunk.sequence_index,
        chunk: task.chunk,
        vector: Vec::new(),
        device_used: task.device_preference.unwrap_or(DeviceId::Cpu),
        duration: Duration::ZERO,
        memory_delta_bytes: 0,
        success: false,
        error: Some("cancelled".to_string()),
        state: task.state,
    }
}
