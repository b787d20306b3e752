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

//! Shared queue lifecycle.
//!
//! Both facades (the bus and the notification service) compose the same
//! machinery: a storage strategy, a dispatcher, a reaper, and a dispatch
//! loop pulling ready batches into the worker pool. `QueueLifecycle` owns
//! that machinery and its idempotent init/start/stop choreography; clean
//! shutdown drains with bounded waits and never leaves an entry
//! claimed-but-abandoned beyond what the reaper can later reclassify.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{QueueConfig, QueueMode};
use crate::dal::{AnyConn, QueueTransaction, DAL};
use crate::database::Database;
use crate::dispatch_backend;
use crate::dispatcher::Dispatcher;
use crate::error::{QueueError, StorageError};
use crate::handler::HandlerResolver;
use crate::metrics::QueueMetrics;
use crate::reaper::Reaper;
use crate::storage::{build_queue_storage, QueueStorage};

const LOOP_STOP_TIMEOUT: Duration = Duration::from_secs(5);

pub(crate) struct QueueLifecycle {
    config: Arc<QueueConfig>,
    database: Database,
    dal: DAL,
    storage: Arc<dyn QueueStorage>,
    metrics: Arc<QueueMetrics>,
    reaper: Reaper,
    dispatcher: Mutex<Option<Arc<Dispatcher>>>,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
    shutdown_tx: Mutex<Option<broadcast::Sender<()>>>,
    is_initialized: AtomicBool,
    is_started: AtomicBool,
}

impl QueueLifecycle {
    pub(crate) fn new(
        database: Database,
        config: Arc<QueueConfig>,
        metrics: Arc<QueueMetrics>,
    ) -> Self {
        let dal = DAL::new(database.clone());
        let storage = build_queue_storage(dal.clone(), config.clone(), metrics.clone());
        let reaper = Reaper::new(storage.clone(), config.clone());
        Self {
            config,
            database,
            dal,
            storage,
            metrics,
            reaper,
            dispatcher: Mutex::new(None),
            loop_handle: Mutex::new(None),
            shutdown_tx: Mutex::new(None),
            is_initialized: AtomicBool::new(false),
            is_started: AtomicBool::new(false),
        }
    }

    pub(crate) fn config(&self) -> &Arc<QueueConfig> {
        &self.config
    }

    pub(crate) fn dal(&self) -> &DAL {
        &self.dal
    }

    pub(crate) fn storage(&self) -> &Arc<dyn QueueStorage> {
        &self.storage
    }

    pub(crate) fn metrics(&self) -> &Arc<QueueMetrics> {
        &self.metrics
    }

    pub(crate) fn is_initialized(&self) -> bool {
        self.is_initialized.load(Ordering::SeqCst)
    }

    pub(crate) fn is_started(&self) -> bool {
        self.is_started.load(Ordering::SeqCst)
    }

    /// Entries currently being handled by the worker pool.
    pub(crate) fn in_flight(&self) -> usize {
        self.dispatcher
            .lock()
            .expect("lifecycle lock poisoned")
            .as_ref()
            .map(|d| d.in_flight())
            .unwrap_or(0)
    }

    /// Creates the schema if needed and prepares the storage strategy.
    /// Idempotent; returns whether this call performed the initialization.
    pub(crate) async fn init_queue(&self) -> Result<bool, QueueError> {
        if self.config.processing_off() {
            warn!("Queue processing is off, cannot be initialized");
            return Ok(false);
        }

        if self
            .is_initialized
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(false);
        }

        self.database.init_schema(&self.config).await?;
        self.storage.initialize().await?;
        Ok(true)
    }

    /// Starts the dispatcher, the dispatch loop and the reaper. Idempotent;
    /// returns whether this call performed the start.
    ///
    /// `dispatch_unresolved` controls what happens to claimed entries the
    /// resolver knows nothing about: the bus pushes them into the worker
    /// pool so the missing handler is reported loudly; the notification
    /// service skips entries of queues that are not currently started and
    /// lets their lease lapse.
    pub(crate) async fn start_queue(
        &self,
        resolver: Arc<dyn HandlerResolver>,
        dispatch_unresolved: bool,
    ) -> Result<bool, QueueError> {
        if self.config.processing_off() {
            warn!("Queue processing is off, cannot be started");
            return Ok(false);
        }

        if !self.is_initialized() {
            // Make it easy for callers (and tests): start implies init.
            self.init_queue().await?;
        }

        if self
            .is_started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(false);
        }

        self.reaper.start();

        let dispatcher = Arc::new(Dispatcher::start(
            self.config.clone(),
            self.storage.clone(),
            resolver.clone(),
            self.metrics.clone(),
        ));
        *self.dispatcher.lock().expect("lifecycle lock poisoned") = Some(dispatcher.clone());

        let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);
        *self.shutdown_tx.lock().expect("lifecycle lock poisoned") = Some(shutdown_tx);

        let storage = self.storage.clone();
        let sleep_when_idle = self.config.queue_mode() != QueueMode::StickyEvents;
        let polling_sleep = self.config.polling_sleep();

        let handle = tokio::spawn(async move {
            info!("Dispatch loop starting");
            loop {
                let ready = tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    ready = storage.get_ready_entries() => ready,
                };

                if ready.entries.is_empty() {
                    // The inflight strategy already blocked waiting for ids;
                    // only the polling strategies need an idle sleep.
                    if sleep_when_idle {
                        tokio::select! {
                            _ = shutdown_rx.recv() => break,
                            _ = tokio::time::sleep(polling_sleep) => {}
                        }
                    }
                    continue;
                }

                debug!(
                    batch = ready.entries.len(),
                    query_time_us = ready.elapsed.as_micros() as u64,
                    "Dispatching ready batch"
                );
                for entry in ready.entries {
                    if !dispatch_unresolved && resolver.resolve(&entry).is_none() {
                        // Lease expiry plus the reaper recover it later.
                        debug!(
                            record_id = entry.record_id,
                            queue = %entry.queue_name,
                            "Skipping entry for inactive queue"
                        );
                        continue;
                    }
                    dispatcher.dispatch(entry).await;
                }
            }
            info!("Dispatch loop terminated");
        });
        *self.loop_handle.lock().expect("lifecycle lock poisoned") = Some(handle);

        Ok(true)
    }

    /// Runs `f` inside one store transaction, threading an explicit
    /// [`QueueTransaction`] context through it. On commit, the storage
    /// strategy is notified of the record ids inserted through the context;
    /// a closure error rolls the transaction back and nothing is enqueued.
    pub(crate) async fn in_transaction<R, F>(&self, f: F) -> Result<R, QueueError>
    where
        F: for<'a> FnOnce(&mut QueueTransaction<'a>) -> Result<R, QueueError> + Send + 'static,
        R: Send + 'static,
    {
        let creator = self.config.creator_name().to_string();

        let (value, committed_ids): (R, Vec<i64>) = dispatch_backend!(self.database.backend(), {
            let conn = self
                .database
                .get_postgres_connection()
                .await
                .map_err(|e| QueueError::Storage(StorageError::ConnectionPool(e.to_string())))?;
            conn.interact(move |raw| {
                use diesel::Connection;
                raw.transaction::<(R, Vec<i64>), QueueError, _>(|raw| {
                    let mut txn = QueueTransaction::new(AnyConn::Postgres(raw), &creator);
                    let value = f(&mut txn)?;
                    let ids = txn.take_pending();
                    Ok((value, ids))
                })
            })
            .await
            .map_err(|e| QueueError::Storage(StorageError::ConnectionPool(e.to_string())))??
        }, {
            let conn = self
                .database
                .get_sqlite_connection()
                .await
                .map_err(|e| QueueError::Storage(StorageError::ConnectionPool(e.to_string())))?;
            conn.interact(move |raw| {
                use diesel::Connection;
                raw.transaction::<(R, Vec<i64>), QueueError, _>(|raw| {
                    let mut txn = QueueTransaction::new(AnyConn::Sqlite(raw), &creator);
                    let value = f(&mut txn)?;
                    let ids = txn.take_pending();
                    Ok((value, ids))
                })
            })
            .await
            .map_err(|e| QueueError::Storage(StorageError::ConnectionPool(e.to_string())))??
        });

        if !committed_ids.is_empty() {
            self.storage.on_entries_committed(&committed_ids).await;
        }
        Ok(value)
    }

    /// Stops everything started by [`Self::start_queue`], with bounded
    /// waits. Idempotent. Errors are logged, never propagated past the
    /// lifecycle boundary.
    pub(crate) async fn stop_queue(&self) {
        if self
            .is_started
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        self.is_initialized.store(false, Ordering::SeqCst);

        self.reaper.stop().await;

        if let Some(tx) = self
            .shutdown_tx
            .lock()
            .expect("lifecycle lock poisoned")
            .take()
        {
            let _ = tx.send(());
        }

        let handle = self
            .loop_handle
            .lock()
            .expect("lifecycle lock poisoned")
            .take();
        if let Some(mut handle) = handle {
            if tokio::time::timeout(LOOP_STOP_TIMEOUT, &mut handle)
                .await
                .is_err()
            {
                warn!("Dispatch loop did not stop in time, aborting it");
                handle.abort();
            }
        }

        let dispatcher = self
            .dispatcher
            .lock()
            .expect("lifecycle lock poisoned")
            .take();
        if let Some(dispatcher) = dispatcher {
            dispatcher.stop().await;
        }

        self.storage.close().await;
        info!("Queue stopped");
    }
}
