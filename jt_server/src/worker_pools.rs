use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{error, warn};

use jt_standard_lib::settings::ServerSettings;

use crate::execution::{ExecutionEngine, ExecutionTask};
use crate::signal_router::{IngestJob, SignalRouter};

/// Counters behind the monitoring endpoints. Everything is monotonic or a
/// gauge; readers never lock.
#[derive(Default)]
pub struct PoolStats {
    pub ingest_alive: AtomicUsize,
    pub exec_alive: AtomicUsize,
    pub ingest_queue_depth: AtomicUsize,
    pub exec_queue_depth: AtomicUsize,
    pub ingest_processed: AtomicU64,
    pub exec_processed: AtomicU64,
    pub exec_failed: AtomicU64,
    pub filtered: AtomicU64,
    /// Signals or tasks that could not be enqueued inside their deadline.
    pub dropped: AtomicU64,
    exec_latency_total_ms: AtomicU64,
}

#[derive(Debug, Serialize)]
pub struct PoolStatsSnapshot {
    pub ingest_alive: usize,
    pub exec_alive: usize,
    pub ingest_queue_depth: usize,
    pub exec_queue_depth: usize,
    pub ingest_processed: u64,
    pub exec_processed: u64,
    pub exec_failed: u64,
    pub filtered: u64,
    pub dropped: u64,
    pub avg_exec_latency_ms: u64,
}

impl PoolStats {
    pub fn record_exec_latency(&self, ms: u64) {
        self.exec_latency_total_ms.fetch_add(ms, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> PoolStatsSnapshot {
        let processed = self.exec_processed.load(Ordering::Relaxed);
        PoolStatsSnapshot {
            ingest_alive: self.ingest_alive.load(Ordering::Relaxed),
            exec_alive: self.exec_alive.load(Ordering::Relaxed),
            ingest_queue_depth: self.ingest_queue_depth.load(Ordering::Relaxed),
            exec_queue_depth: self.exec_queue_depth.load(Ordering::Relaxed),
            ingest_processed: self.ingest_processed.load(Ordering::Relaxed),
            exec_processed: processed,
            exec_failed: self.exec_failed.load(Ordering::Relaxed),
            filtered: self.filtered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            avg_exec_latency_ms: if processed > 0 {
                self.exec_latency_total_ms.load(Ordering::Relaxed) / processed
            } else {
                0
            },
        }
    }
}

/// Two bounded pools: webhook-parse workers and broker-execution workers.
/// The separation is load-bearing: the ingest path's latency budget
/// depends on broker calls never running in-request.
pub struct WorkerPools {
    ingest_tx: mpsc::Sender<IngestJob>,
    pub stats: Arc<PoolStats>,
    supervisors: Vec<JoinHandle<()>>,
}

impl WorkerPools {
    pub fn start(
        settings: &ServerSettings,
        router: Arc<SignalRouter>,
        engine: Arc<ExecutionEngine>,
    ) -> Arc<Self> {
        let stats = Arc::new(PoolStats::default());
        let (ingest_tx, ingest_rx) = mpsc::channel::<IngestJob>(settings.ingest_queue_depth);
        let (exec_tx, exec_rx) = mpsc::channel::<ExecutionTask>(settings.exec_queue_depth);

        let ingest_rx = Arc::new(tokio::sync::Mutex::new(ingest_rx));
        let exec_rx = Arc::new(tokio::sync::Mutex::new(exec_rx));

        let mut supervisors = Vec::new();
        for worker in 0..settings.ingest_workers {
            supervisors.push(Self::supervise_ingest_worker(
                worker,
                ingest_rx.clone(),
                exec_tx.clone(),
                router.clone(),
                stats.clone(),
                Duration::from_millis(settings.exec_enqueue_deadline_ms),
            ));
        }
        for worker in 0..settings.exec_workers {
            supervisors.push(Self::supervise_exec_worker(
                worker,
                exec_rx.clone(),
                engine.clone(),
                stats.clone(),
                Duration::from_secs(settings.exec_task_timeout_secs),
            ));
        }

        Arc::new(Self { ingest_tx, stats, supervisors })
    }

    /// Hand a job to the ingest pool without blocking the webhook response.
    /// A full queue increments the drop counter; the caller still answers
    /// 2xx because the signal is already persisted and upstream retries
    /// would not help.
    pub fn enqueue_ingest(&self, job: IngestJob) -> bool {
        match self.ingest_tx.try_send(job) {
            Ok(()) => {
                self.stats.ingest_queue_depth.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(_) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                warn!("ingest queue full, signal recorded but not processed");
                false
            }
        }
    }

    /// One supervisor per worker slot: the worker loop runs as its own
    /// task, and if it ever dies (panic inside a job), a replacement is
    /// spawned. No job can take the pool down.
    fn supervise_ingest_worker(
        worker: usize,
        rx: Arc<tokio::sync::Mutex<mpsc::Receiver<IngestJob>>>,
        exec_tx: mpsc::Sender<ExecutionTask>,
        router: Arc<SignalRouter>,
        stats: Arc<PoolStats>,
        enqueue_deadline: Duration,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                stats.ingest_alive.fetch_add(1, Ordering::Relaxed);
                let handle = tokio::spawn(Self::ingest_worker_loop(
                    rx.clone(),
                    exec_tx.clone(),
                    router.clone(),
                    stats.clone(),
                    enqueue_deadline,
                ));
                let result = handle.await;
                stats.ingest_alive.fetch_sub(1, Ordering::Relaxed);
                match result {
                    Ok(()) => break, // channel closed, shutdown
                    Err(e) if e.is_panic() => {
                        error!(worker, "ingest worker panicked, respawning");
                    }
                    Err(_) => break,
                }
            }
        })
    }

    async fn ingest_worker_loop(
        rx: Arc<tokio::sync::Mutex<mpsc::Receiver<IngestJob>>>,
        exec_tx: mpsc::Sender<ExecutionTask>,
        router: Arc<SignalRouter>,
        stats: Arc<PoolStats>,
        enqueue_deadline: Duration,
    ) {
        loop {
            let job = {
                let mut rx = rx.lock().await;
                rx.recv().await
            };
            let Some(job) = job else { return };
            stats.ingest_queue_depth.fetch_sub(1, Ordering::Relaxed);

            match router.process(job).await {
                Ok(tasks) => {
                    stats.ingest_processed.fetch_add(1, Ordering::Relaxed);
                    if tasks.is_empty() {
                        stats.filtered.fetch_add(1, Ordering::Relaxed);
                    }
                    for task in tasks {
                        // Brief backpressure against a full execution
                        // queue; past the deadline the task is dropped and
                        // counted, never failed upstream.
                        match timeout(enqueue_deadline, exec_tx.send(task)).await {
                            Ok(Ok(())) => {
                                stats.exec_queue_depth.fetch_add(1, Ordering::Relaxed);
                            }
                            _ => {
                                stats.dropped.fetch_add(1, Ordering::Relaxed);
                                warn!("execution queue full past deadline, task dropped");
                            }
                        }
                    }
                }
                Err(e) => {
                    stats.ingest_processed.fetch_add(1, Ordering::Relaxed);
                    error!(error = %e, "ingest processing failed");
                }
            }
        }
    }

    fn supervise_exec_worker(
        worker: usize,
        rx: Arc<tokio::sync::Mutex<mpsc::Receiver<ExecutionTask>>>,
        engine: Arc<ExecutionEngine>,
        stats: Arc<PoolStats>,
        task_timeout: Duration,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                stats.exec_alive.fetch_add(1, Ordering::Relaxed);
                let handle = tokio::spawn(Self::exec_worker_loop(
                    rx.clone(),
                    engine.clone(),
                    stats.clone(),
                    task_timeout,
                ));
                let result = handle.await;
                stats.exec_alive.fetch_sub(1, Ordering::Relaxed);
                match result {
                    Ok(()) => break,
                    Err(e) if e.is_panic() => {
                        error!(worker, "execution worker panicked, respawning");
                    }
                    Err(_) => break,
                }
            }
        })
    }

    async fn exec_worker_loop(
        rx: Arc<tokio::sync::Mutex<mpsc::Receiver<ExecutionTask>>>,
        engine: Arc<ExecutionEngine>,
        stats: Arc<PoolStats>,
        task_timeout: Duration,
    ) {
        loop {
            let task = {
                let mut rx = rx.lock().await;
                rx.recv().await
            };
            let Some(task) = task else { return };
            stats.exec_queue_depth.fetch_sub(1, Ordering::Relaxed);

            let started = std::time::Instant::now();
            let outcome = timeout(task_timeout, engine.execute_signal_task(&task)).await;
            stats.record_exec_latency(started.elapsed().as_millis() as u64);
            stats.exec_processed.fetch_add(1, Ordering::Relaxed);

            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    stats.exec_failed.fetch_add(1, Ordering::Relaxed);
                    warn!(trader_id = task.trader.id, error = %e, "execution task failed");
                }
                Err(_) => {
                    stats.exec_failed.fetch_add(1, Ordering::Relaxed);
                    error!(trader_id = task.trader.id, "execution task hit its deadline");
                }
            }
        }
    }

    /// Stop the pools after the drain window; part of the ordered shutdown
    /// sequence (inbound listeners are already closed by then).
    pub fn close_ingest(&self) {
        for handle in &self.supervisors {
            handle.abort();
        }
    }
}
