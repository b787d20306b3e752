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

//! Notification queues: named logical queues multiplexed over one table.
//!
//! A [`NotificationQueueService`] owns the shared dispatch machinery; each
//! [`NotificationQueue`] is a named view (`service:queue` in the
//! `queue_name` column) with its own handler and a future-dated delivery
//! API. Lifecycle is reference-counted: the first queue to start launches
//! the shared dispatcher, the last one to stop tears it down.

use chrono::{NaiveDateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tracing::warn;
use uuid::Uuid;

use crate::config::QueueConfig;
use crate::dal::{HistoricalSearch, LiveSearch, QueueTransaction};
use crate::database::Database;
use crate::error::QueueError;
use crate::handler::{
    decode_events, decode_history_events, EventHandler, EventWithMetadata, HandlerResolver,
    QueueEvent,
};
use crate::lifecycle::QueueLifecycle;
use crate::metrics::QueueMetrics;
use crate::models::{NewQueueEntry, ProcessingState};

struct QueueState {
    service_name: String,
    queue_name: String,
    composite_name: String,
    handler: Arc<dyn EventHandler>,
    is_started: AtomicBool,
}

type QueueMap = Arc<Mutex<HashMap<String, Arc<QueueState>>>>;

/// Resolves a claimed entry to the handler of its (started) queue.
struct QueueNameResolver {
    queues: QueueMap,
}

impl HandlerResolver for QueueNameResolver {
    fn resolve(&self, entry: &crate::models::QueueEntry) -> Option<Arc<dyn EventHandler>> {
        let queues = self.queues.lock().ok()?;
        let state = queues.get(&entry.queue_name)?;
        if state.is_started.load(Ordering::SeqCst) {
            Some(state.handler.clone())
        } else {
            None
        }
    }
}

struct ServiceInner {
    lifecycle: Arc<QueueLifecycle>,
    queues: QueueMap,
    resolver: Arc<QueueNameResolver>,
    active_queues: AtomicUsize,
}

/// Registry and shared runtime for named notification queues.
#[derive(Clone)]
pub struct NotificationQueueService {
    inner: Arc<ServiceInner>,
}

impl NotificationQueueService {
    /// Creates a service with its own metrics sink.
    pub fn new(database: Database, config: QueueConfig) -> Self {
        Self::with_metrics(database, config, Arc::new(QueueMetrics::new()))
    }

    /// Creates a service reporting into a caller-provided metrics sink.
    pub fn with_metrics(
        database: Database,
        config: QueueConfig,
        metrics: Arc<QueueMetrics>,
    ) -> Self {
        let lifecycle = Arc::new(QueueLifecycle::new(database, Arc::new(config), metrics));
        let queues: QueueMap = Arc::new(Mutex::new(HashMap::new()));
        let resolver = Arc::new(QueueNameResolver {
            queues: queues.clone(),
        });
        Self {
            inner: Arc::new(ServiceInner {
                lifecycle,
                queues,
                resolver,
                active_queues: AtomicUsize::new(0),
            }),
        }
    }

    /// This service's metrics sink.
    pub fn metrics(&self) -> &Arc<QueueMetrics> {
        self.inner.lifecycle.metrics()
    }

    /// The `queue_name` value used for a service/queue pair.
    pub fn get_composite_name(service_name: &str, queue_name: &str) -> String {
        format!("{}:{}", service_name, queue_name)
    }

    /// Registers a new named queue with its handler.
    pub fn create_notification_queue(
        &self,
        service_name: &str,
        queue_name: &str,
        handler: Arc<dyn EventHandler>,
    ) -> Result<NotificationQueue, QueueError> {
        let composite = Self::get_composite_name(service_name, queue_name);
        let mut queues = self.inner.queues.lock().expect("queue map lock poisoned");
        if queues.contains_key(&composite) {
            return Err(QueueError::QueueAlreadyExists {
                service: service_name.to_string(),
                queue: queue_name.to_string(),
            });
        }
        let state = Arc::new(QueueState {
            service_name: service_name.to_string(),
            queue_name: queue_name.to_string(),
            composite_name: composite.clone(),
            handler,
            is_started: AtomicBool::new(false),
        });
        queues.insert(composite, state.clone());
        Ok(NotificationQueue {
            inner: self.inner.clone(),
            state,
        })
    }

    /// Removes a named queue from the registry.
    pub fn delete_notification_queue(
        &self,
        service_name: &str,
        queue_name: &str,
    ) -> Result<(), QueueError> {
        let composite = Self::get_composite_name(service_name, queue_name);
        let removed = self
            .inner
            .queues
            .lock()
            .expect("queue map lock poisoned")
            .remove(&composite);
        match removed {
            Some(state) => {
                if state.is_started.load(Ordering::SeqCst) {
                    warn!(queue = %composite, "Deleting a notification queue that is still started");
                }
                Ok(())
            }
            None => Err(QueueError::NoSuchQueue {
                service: service_name.to_string(),
                queue: queue_name.to_string(),
            }),
        }
    }

    /// Fetches an already-created queue handle.
    pub fn get_notification_queue(
        &self,
        service_name: &str,
        queue_name: &str,
    ) -> Result<NotificationQueue, QueueError> {
        let composite = Self::get_composite_name(service_name, queue_name);
        let queues = self.inner.queues.lock().expect("queue map lock poisoned");
        match queues.get(&composite) {
            Some(state) => Ok(NotificationQueue {
                inner: self.inner.clone(),
                state: state.clone(),
            }),
            None => Err(QueueError::NoSuchQueue {
                service: service_name.to_string(),
                queue: queue_name.to_string(),
            }),
        }
    }

    /// Runs `f` inside one store transaction; see
    /// [`crate::PersistentBus::in_transaction`].
    pub async fn in_transaction<R, F>(&self, f: F) -> Result<R, QueueError>
    where
        F: for<'a> FnOnce(&mut QueueTransaction<'a>) -> Result<R, QueueError> + Send + 'static,
        R: Send + 'static,
    {
        self.inner.lifecycle.in_transaction(f).await
    }

    /// Whether the shared dispatch machinery is running.
    pub fn is_started(&self) -> bool {
        self.inner.lifecycle.is_started()
    }
}

/// One named notification queue: future-dated delivery into the shared
/// table, dispatched to this queue's handler.
#[derive(Clone)]
pub struct NotificationQueue {
    inner: Arc<ServiceInner>,
    state: Arc<QueueState>,
}

impl NotificationQueue {
    pub fn service_name(&self) -> &str {
        &self.state.service_name
    }

    pub fn queue_name(&self) -> &str {
        &self.state.queue_name
    }

    /// The `queue_name` column value for this queue's entries.
    pub fn composite_name(&self) -> &str {
        &self.state.composite_name
    }

    /// Whether this queue is accepting dispatches.
    pub fn is_started(&self) -> bool {
        self.state.is_started.load(Ordering::SeqCst)
    }

    /// Starts this queue. The first queue started on the service launches
    /// the shared dispatcher, dispatch loop and (in sticky-polling mode)
    /// the reaper; later starts only mark the queue active. Idempotent per
    /// queue. Returns whether this call launched the shared machinery.
    pub async fn start_queue(&self) -> Result<bool, QueueError> {
        if self
            .state
            .is_started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(false);
        }
        self.inner.active_queues.fetch_add(1, Ordering::SeqCst);

        self.inner
            .lifecycle
            .start_queue(self.inner.resolver.clone(), false)
            .await
    }

    /// Stops this queue. The last active queue tears the shared machinery
    /// down. Idempotent per queue.
    pub async fn stop_queue(&self) {
        if self
            .state
            .is_started
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        if self.inner.active_queues.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.inner.lifecycle.stop_queue().await;
        }
    }

    /// Durably records a notification to be dispatched no earlier than
    /// `effective_date`. Storage failures are logged, never raised;
    /// serialization failures are.
    pub async fn record_future_notification<E: QueueEvent>(
        &self,
        effective_date: NaiveDateTime,
        event: &E,
        future_user_token: Option<Uuid>,
        search_key1: i64,
        search_key2: i64,
    ) -> Result<(), QueueError> {
        if !self.inner.lifecycle.is_initialized() {
            warn!(
                queue = %self.state.composite_name,
                "Attempting to record a notification on a non-initialized queue"
            );
            return Ok(());
        }
        let payload = serde_json::to_string(event)?;
        let entry = NewQueueEntry::notification(
            &self.state.composite_name,
            event.event_type(),
            payload,
            future_user_token,
            search_key1,
            search_key2,
            self.inner.lifecycle.config().creator_name(),
            Utc::now().naive_utc(),
            effective_date,
        );
        self.inner.lifecycle.storage().insert(entry).await;
        Ok(())
    }

    /// Records a future notification within a caller-supplied transaction
    /// context; failures propagate so the transaction rolls back. Returns
    /// the record id.
    pub fn record_future_notification_from_transaction<E: QueueEvent>(
        &self,
        txn: &mut QueueTransaction<'_>,
        effective_date: NaiveDateTime,
        event: &E,
        future_user_token: Option<Uuid>,
        search_key1: i64,
        search_key2: i64,
    ) -> Result<i64, QueueError> {
        let payload = serde_json::to_string(event)?;
        let entry = NewQueueEntry::notification(
            &self.state.composite_name,
            event.event_type(),
            payload,
            future_user_token,
            search_key1,
            search_key2,
            txn.creator_name(),
            Utc::now().naive_utc(),
            effective_date,
        );
        txn.insert_entry(entry)
    }

    /// Cancels a pending notification; it lands in history as REMOVED.
    /// Returns whether anything was removed.
    pub async fn remove_future_notification(&self, record_id: i64) -> Result<bool, QueueError> {
        Ok(self
            .inner
            .lifecycle
            .dal()
            .queue_entries()
            .remove_entry(record_id)
            .await?)
    }

    /// Pending notifications on this queue with a future effective date,
    /// matching both search keys.
    pub async fn future_notifications_for_search_keys(
        &self,
        search_key1: i64,
        search_key2: i64,
    ) -> Result<Vec<EventWithMetadata>, QueueError> {
        let entries = self
            .inner
            .lifecycle
            .dal()
            .queue_entries()
            .search_live_entries(self.future_search(Some(search_key1), search_key2))
            .await?;
        Ok(decode_events(&entries))
    }

    /// In-transaction rendition of
    /// [`Self::future_notifications_for_search_keys`].
    pub fn future_notifications_from_transaction_for_search_keys(
        &self,
        txn: &mut QueueTransaction<'_>,
        search_key1: i64,
        search_key2: i64,
    ) -> Result<Vec<EventWithMetadata>, QueueError> {
        let entries = txn.search_live_entries(self.future_search(Some(search_key1), search_key2))?;
        Ok(decode_events(&entries))
    }

    /// Notifications on this queue currently claimed by a worker.
    pub async fn in_processing_notifications(&self) -> Result<Vec<EventWithMetadata>, QueueError> {
        let entries = self
            .inner
            .lifecycle
            .dal()
            .queue_entries()
            .get_in_processing_entries(Some(self.state.composite_name.clone()))
            .await?;
        Ok(decode_events(&entries))
    }

    /// Terminal notifications on this queue matching both search keys.
    pub async fn historical_notifications_for_search_keys(
        &self,
        search_key1: i64,
        search_key2: i64,
    ) -> Result<Vec<EventWithMetadata>, QueueError> {
        let rows = self
            .inner
            .lifecycle
            .dal()
            .queue_entries()
            .search_history_entries(HistoricalSearch {
                queue_name: Some(self.state.composite_name.clone()),
                search_key1: Some(search_key1),
                search_key2,
                min_created_date: None,
            })
            .await?;
        Ok(decode_history_events(&rows))
    }

    fn future_search(&self, search_key1: Option<i64>, search_key2: i64) -> LiveSearch {
        LiveSearch {
            states: vec![ProcessingState::Available],
            queue_name: Some(self.state.composite_name.clone()),
            search_key1,
            search_key2,
            max_created_date: None,
            effective_after: Some(Utc::now().naive_utc()),
        }
    }
}
