//! Concurrent batch executor.
//!
//! Bridges the single-threaded parser to a pool of batch workers. The
//! parser pushes batches into a bounded channel (capacity `parallelism x 2`
//! so a fast producer cannot pile up unbounded memory); workers drain the
//! channel concurrently. The top-level call returns only when every
//! dispatched batch has resolved - there is no fire-and-forget. A failing
//! batch is recorded and the rest of the stream still drains; the call
//! then fails with an aggregate error.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use tablift_common::{Result, TabliftError};

use crate::parser::Batch;

/// Per-run executor statistics
#[derive(Debug, Clone, Default)]
pub struct ExecutorStats {
    pub total_batches: u64,
    pub total_records: u64,
    pub successful_batches: u64,
    pub failed_batches: u64,
    pub duration_ms: u64,
    /// Records per second over the whole run
    pub throughput: f64,
}

/// Work-distributing executor for parsed batches
pub struct BatchExecutor {
    parallelism: usize,
    drain_timeout: Duration,
}

impl BatchExecutor {
    pub fn new(parallelism: usize, drain_timeout: Duration) -> Self {
        Self {
            parallelism: parallelism.max(1),
            drain_timeout,
        }
    }

    /// Bounded hand-off channel for the parser side. The capacity keeps at
    /// most `parallelism x 2` batches outstanding; a full channel is the
    /// only back-pressure the parser ever sees.
    pub fn channel(&self) -> (mpsc::Sender<Batch>, mpsc::Receiver<Batch>) {
        mpsc::channel(self.parallelism * 2)
    }

    /// Drain `rx` through `process` on `parallelism` workers.
    ///
    /// Returns once the channel closes and all in-flight batches finish,
    /// or fails with `Timeout` when the drain deadline passes (outstanding
    /// work is cancelled).
    pub async fn run<F, Fut>(
        &self,
        rx: mpsc::Receiver<Batch>,
        process: F,
    ) -> Result<ExecutorStats>
    where
        F: Fn(u64, Batch) -> Fut + Send + Sync + Clone + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send,
    {
        let started = Instant::now();
        let rx = Arc::new(Mutex::new(rx));
        let counters = Arc::new(Counters::default());
        let first_error: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));

        let mut workers = JoinSet::new();
        for worker_id in 0..self.parallelism {
            let rx = Arc::clone(&rx);
            let counters = Arc::clone(&counters);
            let first_error = Arc::clone(&first_error);
            let process = process.clone();

            workers.spawn(async move {
                loop {
                    // Holding the lock across recv serializes hand-off,
                    // not processing.
                    let batch = { rx.lock().await.recv().await };
                    let Some(batch) = batch else {
                        break;
                    };

                    let batch_number = counters.batches.fetch_add(1, Ordering::Relaxed);
                    let records = batch.len() as u64;
                    counters.records.fetch_add(records, Ordering::Relaxed);

                    match process(batch_number, batch).await {
                        Ok(()) => {
                            counters.successes.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(e) => {
                            counters.failures.fetch_add(1, Ordering::Relaxed);
                            warn!(
                                worker_id,
                                batch_number,
                                records,
                                error = %e,
                                "Batch processing failed, continuing drain"
                            );
                            let mut guard = first_error.lock().await;
                            if guard.is_none() {
                                *guard = Some(e.to_string());
                            }
                        }
                    }
                }
            });
        }

        let drained = tokio::time::timeout(self.drain_timeout, async {
            while let Some(joined) = workers.join_next().await {
                if let Err(e) = joined {
                    error!(error = %e, "Batch worker panicked");
                    counters.failures.fetch_add(1, Ordering::Relaxed);
                }
            }
        })
        .await;

        if drained.is_err() {
            workers.abort_all();
            let elapsed_ms = started.elapsed().as_millis() as u64;
            error!(
                elapsed_ms,
                in_flight = self.parallelism,
                "Batch drain timed out, cancelling outstanding work"
            );
            return Err(TabliftError::Timeout {
                operation: "batch executor drain".into(),
                elapsed_ms,
            });
        }

        let duration_ms = started.elapsed().as_millis() as u64;
        let stats = ExecutorStats {
            total_batches: counters.batches.load(Ordering::Relaxed),
            total_records: counters.records.load(Ordering::Relaxed),
            successful_batches: counters.successes.load(Ordering::Relaxed),
            failed_batches: counters.failures.load(Ordering::Relaxed),
            duration_ms,
            throughput: if duration_ms > 0 {
                counters.records.load(Ordering::Relaxed) as f64 * 1000.0 / duration_ms as f64
            } else {
                0.0
            },
        };

        info!(
            total_batches = stats.total_batches,
            total_records = stats.total_records,
            failed_batches = stats.failed_batches,
            duration_ms = stats.duration_ms,
            throughput = format!("{:.0}/s", stats.throughput),
            "Batch executor drained"
        );

        if stats.failed_batches > 0 {
            let first = first_error
                .lock()
                .await
                .clone()
                .unwrap_or_else(|| "unknown".into());
            return Err(TabliftError::Persistence(format!(
                "{} of {} batches failed; first error: {first}",
                stats.failed_batches, stats.total_batches
            )));
        }

        Ok(stats)
    }
}

#[derive(Default)]
struct Counters {
    batches: AtomicU64,
    records: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
}
