/*
 *  Copyright 2025 Colliery Software
 *
 *  Licensed under the Apache License, Version 2.0 (the "License");
 *  you may not use this file except in compliance with the License.
 *  You may obtain a copy of the License at
 *
 *      http://www.apache.org/licenses/LICENSE-2.0
 *
 *  Unless required by applicable law or agreed to in writing, software
 *  distributed under the License is distributed on an "AS IS" BASIS,
 *  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 *  See the License for the specific language governing permissions and
 *  limitations under the License.
 */

//! Dispatcher and worker pool.
//!
//! Claimed entries are submitted into a bounded work queue whose submission
//! blocks when full (backpressure, never drop). A pump task pulls entries,
//! acquires a semaphore permit capping concurrent handler executions, and
//! spawns one worker task per entry; the permit is held for the task's
//! duration. An in-flight gauge grows on submission and shrinks on
//! completion.
//!
//! Shutdown closes the queue, waits a bounded time for in-flight tasks,
//! then aborts the rest; aborted tasks leave their entries claimed for the
//! reaper to reclassify.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::config::QueueConfig;
use crate::handler::HandlerResolver;
use crate::metrics::QueueMetrics;
use crate::models::QueueEntry;
use crate::storage::QueueStorage;

pub(crate) mod worker;

/// Bounded wait for in-flight tasks during shutdown before they are
/// force-cancelled.
const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Decrements the in-flight gauge when a worker task finishes or is
/// aborted.
struct InFlightGuard(Arc<AtomicUsize>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Bounded, semaphore-gated worker pool dispatching claimed entries to
/// handlers.
pub(crate) struct Dispatcher {
    work_tx: Mutex<Option<mpsc::Sender<QueueEntry>>>,
    pump_handle: Mutex<Option<JoinHandle<()>>>,
    in_flight: Arc<AtomicUsize>,
}

impl Dispatcher {
    /// Starts the pump task and returns the running dispatcher.
    pub(crate) fn start(
        config: Arc<QueueConfig>,
        storage: Arc<dyn QueueStorage>,
        resolver: Arc<dyn HandlerResolver>,
        metrics: Arc<QueueMetrics>,
    ) -> Self {
        let (work_tx, mut work_rx) = mpsc::channel::<QueueEntry>(config.event_queue_capacity());
        let semaphore = Arc::new(Semaphore::new(config.max_dispatch_threads()));
        let in_flight = Arc::new(AtomicUsize::new(0));

        let pump_in_flight = in_flight.clone();
        let pump_handle = tokio::spawn(async move {
            let mut tasks = JoinSet::new();

            while let Some(entry) = work_rx.recv().await {
                let permit = match semaphore.clone().acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => break,
                };

                pump_in_flight.fetch_add(1, Ordering::SeqCst);
                metrics.record_dispatched();
                let guard = InFlightGuard(pump_in_flight.clone());
                let storage = storage.clone();
                let resolver = resolver.clone();
                let metrics = metrics.clone();
                let max_failure_retries = config.max_failure_retries();

                tasks.spawn(async move {
                    let _permit = permit;
                    let _guard = guard;
                    worker::run_entry(entry, resolver, storage, metrics, max_failure_retries)
                        .await;
                });

                // Collect whatever already finished so the set stays small.
                while let Some(result) = tasks.try_join_next() {
                    if let Err(e) = result {
                        warn!("Worker task ended abnormally: {}", e);
                    }
                }
            }

            // Work queue closed: drain in-flight tasks with a bounded wait,
            // then cancel the stragglers.
            let drained = tokio::time::timeout(SHUTDOWN_DRAIN_TIMEOUT, async {
                while let Some(result) = tasks.join_next().await {
                    if let Err(e) = result {
                        warn!("Worker task ended abnormally: {}", e);
                    }
                }
            })
            .await;

            if drained.is_err() {
                warn!(
                    remaining = tasks.len(),
                    "Shutdown drain timed out, cancelling in-flight workers"
                );
                tasks.abort_all();
                while tasks.join_next().await.is_some() {}
            }

            debug!("Dispatcher pump terminated");
        });

        Self {
            work_tx: Mutex::new(Some(work_tx)),
            pump_handle: Mutex::new(Some(pump_handle)),
            in_flight,
        }
    }

    /// Submits one claimed entry. Blocks while the bounded work queue is
    /// full.
    pub(crate) async fn dispatch(&self, entry: QueueEntry) {
        let tx = {
            let guard = self.work_tx.lock().expect("dispatcher lock poisoned");
            guard.clone()
        };
        match tx {
            Some(tx) => {
                debug!(record_id = entry.record_id, "Dispatching entry");
                if tx.send(entry).await.is_err() {
                    warn!("Dispatch attempted after dispatcher shutdown");
                }
            }
            None => {
                warn!("Dispatch attempted after dispatcher shutdown");
            }
        }
    }

    /// Number of entries currently being handled.
    pub(crate) fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Closes the work queue and waits (bounded) for the pump to drain.
    pub(crate) async fn stop(&self) {
        let tx = self.work_tx.lock().expect("dispatcher lock poisoned").take();
        drop(tx);

        let handle = self
            .pump_handle
            .lock()
            .expect("dispatcher lock poisoned")
            .take();
        if let Some(mut handle) = handle {
            // The pump itself bounds the in-flight drain; give it that plus
            // a little slack before giving up on it entirely.
            match tokio::time::timeout(SHUTDOWN_DRAIN_TIMEOUT * 2, &mut handle).await {
                Ok(_) => info!("Dispatcher stopped"),
                Err(_) => {
                    warn!("Dispatcher pump did not stop in time, aborting it");
                    handle.abort();
                }
            }
        }
    }
}
