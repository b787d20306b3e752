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

//! Error types for the delivery engine.
//!
//! Errors are layered: [`StorageError`] covers everything between the engine
//! and the database, [`QueueError`] is the facade-level error surfaced to
//! callers, and [`HandlerError`] is the signal a handler returns to drive the
//! entry state machine. Handler errors never escape a worker task; they are
//! classified into a state transition.

use crate::retry::QueueRetryError;

/// Errors raised by the storage layer (connection pool, queries, payload
/// serialization).
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Failed to check out or use a pooled connection
    #[error("Connection pool error: {0}")]
    ConnectionPool(String),

    /// A query failed
    #[error("Database error: {0}")]
    Database(#[from] diesel::result::Error),

    /// Event payload could not be serialized or deserialized
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Facade-level errors returned by [`crate::PersistentBus`] and
/// [`crate::NotificationQueueService`] operations.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// A notification queue with this composite name is already registered
    #[error("Notification queue already exists: {service}:{queue}")]
    QueueAlreadyExists { service: String, queue: String },

    /// No notification queue registered under this composite name
    #[error("No such notification queue: {service}:{queue}")]
    NoSuchQueue { service: String, queue: String },

    /// Invalid or unsupported configuration
    #[error("Configuration error: {message}")]
    Configuration { message: String },
}

impl From<diesel::result::Error> for QueueError {
    fn from(e: diesel::result::Error) -> Self {
        QueueError::Storage(StorageError::Database(e))
    }
}

impl From<serde_json::Error> for QueueError {
    fn from(e: serde_json::Error) -> Self {
        QueueError::Storage(StorageError::Serialization(e))
    }
}

/// Outcome signal returned by an [`crate::handler::EventHandler`].
///
/// The dispatcher classifies this into an entry state transition:
/// `Transient` requeues the entry in place with an incremented error count
/// (until retries are exhausted), everything else is terminal for the
/// originating entry.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// Transient failure; the entry is requeued with `error_count + 1` until
    /// the configured maximum is exceeded
    #[error("Transient handler failure: {0}")]
    Transient(String),

    /// Non-retryable failure; the entry goes straight to FAILED
    #[error("Fatal handler failure: {0}")]
    Fatal(String),

    /// Request for delayed redelivery through the retries queue; handled by
    /// [`crate::retry::RetryableHandler`], treated as transient if it reaches
    /// the dispatcher unwrapped
    #[error(transparent)]
    RetryWith(#[from] QueueRetryError),

    /// A retry was (or could not be) scheduled on the retries queue; the
    /// originating entry is terminally FAILED either way
    #[error("Retry scheduling outcome on the retries queue: scheduled={scheduled}")]
    RetryScheduled { scheduled: bool },
}
