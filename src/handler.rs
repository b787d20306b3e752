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

//! Events, handlers and the type-keyed handler registry.
//!
//! The engine stores payloads as JSON text tagged with a type string. A
//! [`QueueEvent`] knows its own tag (and optionally carries correlation
//! metadata); an [`EventHandler`] receives the decoded [`ReadyEvent`] for a
//! tag it registered for and reports the outcome through
//! [`crate::HandlerError`].

use async_trait::async_trait;
use chrono::NaiveDateTime;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use uuid::Uuid;

use crate::error::HandlerError;
use crate::models::{HistoricalQueueEntry, QueueEntry};

/// An application event that can be enqueued.
///
/// The type tag routes the decoded payload back to a handler; the metadata
/// methods feed the correlation token and the two opaque search keys.
pub trait QueueEvent: Serialize + Send + Sync {
    /// Type tag stored alongside the serialized payload.
    fn event_type(&self) -> &str;

    /// Correlation id propagated into the handler's logging context.
    fn user_token(&self) -> Option<Uuid> {
        None
    }

    /// Caller-defined tag, opaque to the engine.
    fn search_key1(&self) -> i64 {
        0
    }

    /// Caller-defined tag, opaque to the engine.
    fn search_key2(&self) -> i64 {
        0
    }
}

/// A decoded event delivered to a handler.
#[derive(Debug, Clone)]
pub struct ReadyEvent {
    /// The payload's type tag
    pub payload_type: String,
    /// The decoded payload
    pub payload: serde_json::Value,
    /// The entry's effective (ready) time
    pub effective_date: NaiveDateTime,
    /// Correlation id; for notifications, the token attached at scheduling
    /// time
    pub user_token: Option<Uuid>,
    pub search_key1: i64,
    pub search_key2: i64,
}

impl ReadyEvent {
    pub(crate) fn from_entry(entry: &QueueEntry) -> Result<Self, serde_json::Error> {
        let payload = serde_json::from_str(&entry.payload)?;
        Ok(Self {
            payload_type: entry.payload_type.clone(),
            payload,
            effective_date: entry.effective_date,
            // The scheduling-time token takes precedence for future
            // notifications.
            user_token: entry.future_user_token_uuid().or(entry.user_token_uuid()),
            search_key1: entry.search_key1,
            search_key2: entry.search_key2,
        })
    }

    /// Decodes the payload into a concrete event type.
    pub fn decode<E: serde::de::DeserializeOwned>(&self) -> Result<E, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }
}

/// Callback invoked for each decoded event.
///
/// Implementations signal the outcome through [`HandlerError`]; returning
/// `Ok(())` completes the entry.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: ReadyEvent) -> Result<(), HandlerError>;
}

/// A queue entry together with its decoded payload, returned by the query
/// surface.
#[derive(Debug, Clone)]
pub struct EventWithMetadata {
    pub record_id: i64,
    pub user_token: Option<Uuid>,
    pub created_date: NaiveDateTime,
    pub effective_date: NaiveDateTime,
    pub search_key1: i64,
    pub search_key2: i64,
    pub payload_type: String,
    pub payload: serde_json::Value,
}

impl EventWithMetadata {
    pub(crate) fn from_entry(entry: &QueueEntry) -> Result<Self, serde_json::Error> {
        Ok(Self {
            record_id: entry.record_id,
            user_token: entry.user_token_uuid().or(entry.future_user_token_uuid()),
            created_date: entry.created_date,
            effective_date: entry.effective_date,
            search_key1: entry.search_key1,
            search_key2: entry.search_key2,
            payload_type: entry.payload_type.clone(),
            payload: serde_json::from_str(&entry.payload)?,
        })
    }

    pub(crate) fn from_history(entry: &HistoricalQueueEntry) -> Result<Self, serde_json::Error> {
        Ok(Self {
            record_id: entry.record_id,
            user_token: entry
                .user_token
                .as_deref()
                .and_then(|t| Uuid::parse_str(t).ok()),
            created_date: entry.created_date,
            effective_date: entry.effective_date,
            search_key1: entry.search_key1,
            search_key2: entry.search_key2,
            payload_type: entry.payload_type.clone(),
            payload: serde_json::from_str(&entry.payload)?,
        })
    }

    /// Decodes the payload into a concrete event type.
    pub fn decode<E: serde::de::DeserializeOwned>(&self) -> Result<E, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }
}

/// Decodes live entries for the query surface, skipping (and reporting)
/// any undecodable payload.
pub(crate) fn decode_events(entries: &[QueueEntry]) -> Vec<EventWithMetadata> {
    entries
        .iter()
        .filter_map(|entry| match EventWithMetadata::from_entry(entry) {
            Ok(event) => Some(event),
            Err(e) => {
                tracing::warn!(
                    record_id = entry.record_id,
                    "Undecodable payload in query result: {}", e
                );
                None
            }
        })
        .collect()
}

/// Decodes history rows for the query surface, skipping (and reporting)
/// any undecodable payload.
pub(crate) fn decode_history_events(rows: &[HistoricalQueueEntry]) -> Vec<EventWithMetadata> {
    rows.iter()
        .filter_map(|row| match EventWithMetadata::from_history(row) {
            Ok(event) => Some(event),
            Err(e) => {
                tracing::warn!(
                    record_id = row.record_id,
                    "Undecodable archived payload: {}", e
                );
                None
            }
        })
        .collect()
}

/// Resolves the handler responsible for a claimed entry.
///
/// The bus resolves by payload type; the notification service resolves by
/// queue name.
pub(crate) trait HandlerResolver: Send + Sync {
    fn resolve(&self, entry: &QueueEntry) -> Option<Arc<dyn EventHandler>>;
}

/// Type-keyed callback registry: payload type tag -> handler.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn EventHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for events tagged `event_type`, replacing any
    /// previous registration for that tag.
    pub fn register(&self, event_type: &str, handler: Arc<dyn EventHandler>) {
        self.handlers
            .write()
            .expect("handler registry lock poisoned")
            .insert(event_type.to_string(), handler);
    }

    /// Removes the registration for `event_type`; returns whether one
    /// existed.
    pub fn unregister(&self, event_type: &str) -> bool {
        self.handlers
            .write()
            .expect("handler registry lock poisoned")
            .remove(event_type)
            .is_some()
    }

    /// Looks up the handler for a tag.
    pub fn get(&self, event_type: &str) -> Option<Arc<dyn EventHandler>> {
        self.handlers
            .read()
            .expect("handler registry lock poisoned")
            .get(event_type)
            .cloned()
    }
}

impl HandlerResolver for HandlerRegistry {
    fn resolve(&self, entry: &QueueEntry) -> Option<Arc<dyn EventHandler>> {
        self.get(&entry.payload_type)
    }
}
