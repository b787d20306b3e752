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

//! Persistent event bus.
//!
//! [`PersistentBus`] is the public facade for the bus-style queue:
//! producers `post` events (durably, fire-and-forget), handlers register by
//! payload type, and the composed storage/dispatcher/reaper machinery
//! delivers each event at least once to the matching handler.
//!
//! # Example
//!
//! ```rust,ignore
//! let database = Database::new("queue.db", "", 1);
//! let bus = PersistentBus::new(database, QueueConfig::default());
//! bus.register_handler("AccountCreated", Arc::new(MyHandler));
//! bus.start_queue().await?;
//! bus.post(&AccountCreated { id: 42 }).await;
//! ```

use chrono::{NaiveDateTime, Utc};
use std::sync::Arc;
use tracing::warn;

use crate::config::QueueConfig;
use crate::dal::{HistoricalSearch, LiveSearch, QueueTransaction};
use crate::database::Database;
use crate::error::QueueError;
use crate::handler::{decode_events, decode_history_events, EventHandler, EventWithMetadata, HandlerRegistry, QueueEvent};
use crate::lifecycle::QueueLifecycle;
use crate::metrics::QueueMetrics;
use crate::models::{NewQueueEntry, ProcessingState};

/// Logical queue name shared by all bus events in the table.
pub const BUS_QUEUE_NAME: &str = "bus";

/// Durable, at-least-once event bus over a relational store.
pub struct PersistentBus {
    lifecycle: Arc<QueueLifecycle>,
    handlers: Arc<HandlerRegistry>,
}

impl PersistentBus {
    /// Creates a bus with its own metrics sink.
    pub fn new(database: Database, config: QueueConfig) -> Self {
        Self::with_metrics(database, config, Arc::new(QueueMetrics::new()))
    }

    /// Creates a bus reporting into a caller-provided metrics sink.
    pub fn with_metrics(
        database: Database,
        config: QueueConfig,
        metrics: Arc<QueueMetrics>,
    ) -> Self {
        let lifecycle = Arc::new(QueueLifecycle::new(database, Arc::new(config), metrics));
        Self {
            lifecycle,
            handlers: Arc::new(HandlerRegistry::new()),
        }
    }

    /// This bus's metrics sink.
    pub fn metrics(&self) -> &Arc<QueueMetrics> {
        self.lifecycle.metrics()
    }

    /// Creates the schema and prepares the storage strategy. Idempotent.
    pub async fn init_queue(&self) -> Result<bool, QueueError> {
        self.lifecycle.init_queue().await
    }

    /// Starts dispatching (initializing first if needed). Idempotent.
    pub async fn start_queue(&self) -> Result<bool, QueueError> {
        self.lifecycle.start_queue(self.handlers.clone(), true).await
    }

    /// Stops dispatching with bounded waits. Idempotent.
    pub async fn stop_queue(&self) {
        self.lifecycle.stop_queue().await;
    }

    /// Whether the dispatch machinery is running.
    pub fn is_started(&self) -> bool {
        self.lifecycle.is_started()
    }

    /// Entries currently being handled.
    pub fn in_flight(&self) -> usize {
        self.lifecycle.in_flight()
    }

    /// Registers `handler` for events tagged `event_type`.
    pub fn register_handler(&self, event_type: &str, handler: Arc<dyn EventHandler>) {
        self.handlers.register(event_type, handler);
    }

    /// Removes the registration for `event_type`.
    pub fn unregister_handler(&self, event_type: &str) -> bool {
        self.handlers.unregister(event_type)
    }

    /// Durably enqueues an event. Fire-and-forget: the entry is AVAILABLE
    /// once this returns; failures are logged, never raised.
    pub async fn post<E: QueueEvent>(&self, event: &E) {
        if !self.lifecycle.is_initialized() {
            warn!(
                event_type = event.event_type(),
                "Attempting to post an event on a non-initialized bus"
            );
            return;
        }

        let payload = match serde_json::to_string(event) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(
                    event_type = event.event_type(),
                    "Unable to serialize event: {}", e
                );
                return;
            }
        };

        let now = Utc::now().naive_utc();
        let entry = NewQueueEntry::bus_event(
            BUS_QUEUE_NAME,
            event.event_type(),
            payload,
            event.user_token(),
            event.search_key1(),
            event.search_key2(),
            self.lifecycle.config().creator_name(),
            now,
        );
        self.lifecycle.storage().insert(entry).await;
    }

    /// Runs `f` inside one store transaction, threading an explicit
    /// [`QueueTransaction`] context through it.
    ///
    /// Events posted through the context (see [`Self::post_in_transaction`])
    /// become visible atomically with the rest of the transaction; the
    /// storage strategy is notified of the new record ids only after the
    /// commit. Returning an error from `f` rolls the whole transaction back
    /// and nothing is enqueued.
    pub async fn in_transaction<R, F>(&self, f: F) -> Result<R, QueueError>
    where
        F: for<'a> FnOnce(&mut QueueTransaction<'a>) -> Result<R, QueueError> + Send + 'static,
        R: Send + 'static,
    {
        self.lifecycle.in_transaction(f).await
    }

    /// Durably enqueues an event within a caller-supplied transaction
    /// context. Unlike [`Self::post`], failures propagate so the caller's
    /// transaction rolls back.
    pub fn post_in_transaction<E: QueueEvent>(
        &self,
        event: &E,
        txn: &mut QueueTransaction<'_>,
    ) -> Result<i64, QueueError> {
        let payload = serde_json::to_string(event)?;
        let now = Utc::now().naive_utc();
        let entry = NewQueueEntry::bus_event(
            BUS_QUEUE_NAME,
            event.event_type(),
            payload,
            event.user_token(),
            event.search_key1(),
            event.search_key2(),
            txn.creator_name(),
            now,
        );
        txn.insert_entry(entry)
    }

    /// In-transaction rendition of
    /// [`Self::available_events_for_search_keys`].
    pub fn available_events_from_transaction_for_search_keys(
        &self,
        txn: &mut QueueTransaction<'_>,
        search_key1: i64,
        search_key2: i64,
    ) -> Result<Vec<EventWithMetadata>, QueueError> {
        let entries = txn.search_live_entries(LiveSearch {
            states: vec![ProcessingState::Available],
            queue_name: Some(BUS_QUEUE_NAME.to_string()),
            search_key1: Some(search_key1),
            search_key2,
            ..Default::default()
        })?;
        Ok(decode_events(&entries))
    }

    /// In-transaction rendition of
    /// [`Self::available_or_in_processing_events_for_search_keys`].
    pub fn available_or_in_processing_events_from_transaction_for_search_keys(
        &self,
        txn: &mut QueueTransaction<'_>,
        search_key1: i64,
        search_key2: i64,
    ) -> Result<Vec<EventWithMetadata>, QueueError> {
        let entries = txn.search_live_entries(LiveSearch {
            states: vec![ProcessingState::Available, ProcessingState::InProcessing],
            queue_name: Some(BUS_QUEUE_NAME.to_string()),
            search_key1: Some(search_key1),
            search_key2,
            ..Default::default()
        })?;
        Ok(decode_events(&entries))
    }

    /// AVAILABLE bus events matching both search keys.
    pub async fn available_events_for_search_keys(
        &self,
        search_key1: i64,
        search_key2: i64,
    ) -> Result<Vec<EventWithMetadata>, QueueError> {
        let entries = self
            .lifecycle
            .dal()
            .queue_entries()
            .search_live_entries(LiveSearch {
                states: vec![ProcessingState::Available],
                queue_name: Some(BUS_QUEUE_NAME.to_string()),
                search_key1: Some(search_key1),
                search_key2,
                ..Default::default()
            })
            .await?;
        Ok(decode_events(&entries))
    }

    /// AVAILABLE bus events for `search_key2` created up to
    /// `max_created_date`.
    pub async fn available_events_for_search_key2(
        &self,
        max_created_date: NaiveDateTime,
        search_key2: i64,
    ) -> Result<Vec<EventWithMetadata>, QueueError> {
        let entries = self
            .lifecycle
            .dal()
            .queue_entries()
            .search_live_entries(LiveSearch {
                states: vec![ProcessingState::Available],
                queue_name: Some(BUS_QUEUE_NAME.to_string()),
                search_key2,
                max_created_date: Some(max_created_date),
                ..Default::default()
            })
            .await?;
        Ok(decode_events(&entries))
    }

    /// AVAILABLE or IN_PROCESSING bus events matching both search keys.
    pub async fn available_or_in_processing_events_for_search_keys(
        &self,
        search_key1: i64,
        search_key2: i64,
    ) -> Result<Vec<EventWithMetadata>, QueueError> {
        let entries = self
            .lifecycle
            .dal()
            .queue_entries()
            .search_live_entries(LiveSearch {
                states: vec![ProcessingState::Available, ProcessingState::InProcessing],
                queue_name: Some(BUS_QUEUE_NAME.to_string()),
                search_key1: Some(search_key1),
                search_key2,
                ..Default::default()
            })
            .await?;
        Ok(decode_events(&entries))
    }

    /// AVAILABLE or IN_PROCESSING bus events for `search_key2` created up
    /// to `max_created_date`.
    pub async fn available_or_in_processing_events_for_search_key2(
        &self,
        max_created_date: NaiveDateTime,
        search_key2: i64,
    ) -> Result<Vec<EventWithMetadata>, QueueError> {
        let entries = self
            .lifecycle
            .dal()
            .queue_entries()
            .search_live_entries(LiveSearch {
                states: vec![ProcessingState::Available, ProcessingState::InProcessing],
                queue_name: Some(BUS_QUEUE_NAME.to_string()),
                search_key2,
                max_created_date: Some(max_created_date),
                ..Default::default()
            })
            .await?;
        Ok(decode_events(&entries))
    }

    /// Bus events currently claimed by a worker.
    pub async fn in_processing_events(&self) -> Result<Vec<EventWithMetadata>, QueueError> {
        let entries = self
            .lifecycle
            .dal()
            .queue_entries()
            .get_in_processing_entries(Some(BUS_QUEUE_NAME.to_string()))
            .await?;
        Ok(decode_events(&entries))
    }

    /// Terminal bus events matching both search keys.
    pub async fn historical_events_for_search_keys(
        &self,
        search_key1: i64,
        search_key2: i64,
    ) -> Result<Vec<EventWithMetadata>, QueueError> {
        let rows = self
            .lifecycle
            .dal()
            .queue_entries()
            .search_history_entries(HistoricalSearch {
                queue_name: Some(BUS_QUEUE_NAME.to_string()),
                search_key1: Some(search_key1),
                search_key2,
                min_created_date: None,
            })
            .await?;
        Ok(decode_history_events(&rows))
    }

    /// Terminal bus events for `search_key2` created at or after
    /// `min_created_date`.
    pub async fn historical_events_for_search_key2(
        &self,
        min_created_date: NaiveDateTime,
        search_key2: i64,
    ) -> Result<Vec<EventWithMetadata>, QueueError> {
        let rows = self
            .lifecycle
            .dal()
            .queue_entries()
            .search_history_entries(HistoricalSearch {
                queue_name: Some(BUS_QUEUE_NAME.to_string()),
                search_key1: None,
                search_key2,
                min_created_date: Some(min_created_date),
            })
            .await?;
        Ok(decode_history_events(&rows))
    }

    /// Number of ready entries with an effective date up to `bound`. In
    /// sticky modes only this node's backlog is counted.
    pub async fn nb_ready_entries(&self, bound: NaiveDateTime) -> Result<i64, QueueError> {
        let owner = if self.lifecycle.config().queue_mode().is_sticky() {
            Some(self.lifecycle.config().creator_name().to_string())
        } else {
            None
        };
        Ok(self
            .lifecycle
            .dal()
            .queue_entries()
            .get_nb_ready_entries(bound, owner)
            .await?)
    }

}
