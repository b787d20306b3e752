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

//! Conveyor: a durable, database-backed event delivery engine.
//!
//! Producers append events to a relational table; consumer processes claim,
//! decode and hand them to registered handlers with automatic retry and
//! dead-entry recovery. Delivery is at-least-once (idempotency belongs to
//! handlers); *completion* is exactly-once: every entry ends as exactly one
//! terminal row in the history table, even under concurrent multi-node
//! access, with no external coordination beyond the store itself.
//!
//! # Architecture
//!
//! - [`PersistentBus`] — post events, register handlers by payload type.
//! - [`NotificationQueueService`] / [`NotificationQueue`] — named queues
//!   with future-dated delivery over the same table.
//! - [`storage`] — the polling and inflight-sticky storage strategies,
//!   selected by [`QueueMode`].
//! - [`Reaper`] — background recovery of entries orphaned by dead nodes.
//! - [`retry`] — schedule-driven delayed redelivery through a dedicated
//!   retries queue.
//!
//! Both PostgreSQL and SQLite are supported behind cargo features, selected
//! at runtime from the connection URL.
//!
//! # Example
//!
//! ```rust,ignore
//! use conveyor::{Database, PersistentBus, QueueConfig, QueueMode};
//!
//! let database = Database::new("postgres://localhost:5432", "events", 10);
//! let config = QueueConfig::builder()
//!     .queue_mode(QueueMode::StickyPolling)
//!     .max_dispatch_threads(8)
//!     .build();
//!
//! let bus = PersistentBus::new(database, config);
//! bus.register_handler("AccountCreated", std::sync::Arc::new(MyHandler));
//! bus.start_queue().await?;
//! bus.post(&AccountCreated { id: 42 }).await;
//! ```

pub mod bus;
pub mod config;
pub mod dal;
pub mod database;
pub(crate) mod dispatcher;
pub mod error;
pub mod handler;
pub(crate) mod lifecycle;
pub mod metrics;
pub mod models;
pub mod notification;
pub mod reaper;
pub mod retry;
pub mod storage;

pub use bus::{PersistentBus, BUS_QUEUE_NAME};
pub use config::{QueueConfig, QueueConfigBuilder, QueueMode};
pub use dal::{HistoricalSearch, LiveSearch, QueueTransaction, ReapSummary, DAL};
pub use database::{BackendType, Database};
pub use error::{HandlerError, QueueError, StorageError};
pub use handler::{EventHandler, EventWithMetadata, HandlerRegistry, QueueEvent, ReadyEvent};
pub use metrics::QueueMetrics;
pub use models::{HistoricalQueueEntry, NewQueueEntry, ProcessingState, QueueEntry};
pub use notification::{NotificationQueue, NotificationQueueService};
pub use reaper::Reaper;
pub use retry::{
    QueueRetryError, RetryEvent, RetryableHandler, RetryableService, RETRYABLE_SERVICE_NAME,
    RETRY_EVENT_TYPE,
};
pub use storage::{InflightQueueStorage, PollingQueueStorage, QueueStorage, ReadyEntries};
