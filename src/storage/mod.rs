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

//! Queue storage abstraction.
//!
//! [`QueueStorage`] turns the raw store operations into a work queue:
//! insert, claim-ready-batch, mark-outcome, reap. Two strategies share the
//! contract:
//!
//! - [`PollingQueueStorage`] queries the store every cycle; no in-memory
//!   state, correctness rests entirely on the conditional claim.
//! - [`InflightQueueStorage`] short-circuits the scan with an in-memory id
//!   queue fed by commit notifications; the store stays the source of
//!   truth and the reaper backstops anything the cache loses.
//!
//! Write-back failures (history moves, error updates) are logged and
//! swallowed here so one entry's persistence problem cannot abort the
//! dispatch pool; the affected entry stays live and is retried or reaped
//! later.

use async_trait::async_trait;
use chrono::NaiveDateTime;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::{QueueConfig, QueueMode};
use crate::dal::{ReapSummary, DAL};
use crate::error::StorageError;
use crate::metrics::QueueMetrics;
use crate::models::{HistoricalQueueEntry, NewQueueEntry, QueueEntry};

pub mod inflight;
pub mod polling;

pub use inflight::InflightQueueStorage;
pub use polling::PollingQueueStorage;

/// A claimed ready batch plus the time spent on store queries (excluding
/// any deliberate wait for batching).
#[derive(Debug, Default)]
pub struct ReadyEntries {
    pub entries: Vec<QueueEntry>,
    pub elapsed: Duration,
}

/// Storage contract shared by the polling and inflight strategies.
#[async_trait]
pub trait QueueStorage: Send + Sync {
    /// One-time setup (e.g. priming the inflight cache). Idempotent.
    async fn initialize(&self) -> Result<(), StorageError>;

    /// Drops transient state.
    async fn close(&self);

    /// Appends an entry as AVAILABLE. Fire-and-forget: failures are logged,
    /// never raised.
    async fn insert(&self, entry: NewQueueEntry);

    /// Notification that a transaction carrying these inserted ids has
    /// committed.
    async fn on_entries_committed(&self, record_ids: &[i64]);

    /// Claims and returns a batch of ready entries, FIFO by
    /// (effective date, created date, record id).
    async fn get_ready_entries(&self) -> ReadyEntries;

    /// Persists an incremented error count and clears the lease, making the
    /// entry reclaimable.
    async fn update_on_error(&self, entry: &QueueEntry, new_error_count: i64);

    /// Atomically archives terminal rows and deletes them from the live
    /// table. Failures are logged and swallowed.
    async fn move_entries_to_history(&self, rows: Vec<HistoricalQueueEntry>);

    /// Runs one reap cycle against the given cutoff.
    async fn reap_entries(&self, reaping_date: NaiveDateTime);
}

/// Builds the storage strategy selected by the configuration.
pub(crate) fn build_queue_storage(
    dal: DAL,
    config: Arc<QueueConfig>,
    metrics: Arc<QueueMetrics>,
) -> Arc<dyn QueueStorage> {
    match config.queue_mode() {
        QueueMode::StickyEvents => Arc::new(InflightQueueStorage::new(dal, config, metrics)),
        QueueMode::Polling | QueueMode::StickyPolling => {
            Arc::new(PollingQueueStorage::new(dal, config, metrics))
        }
    }
}

/// Warns about rows being archived in a non-terminal state.
pub(super) fn check_terminal_states(rows: &[HistoricalQueueEntry]) {
    for row in rows {
        match row.state() {
            Some(state) if state.is_terminal() => {}
            _ => warn!(
                record_id = row.record_id,
                state = %row.processing_state,
                "Unexpected terminal event state while moving entry into history"
            ),
        }
    }
}

/// One reap cycle shared by both strategies: run the transactional reap,
/// log the classification, count the recycles. Returns the summary (empty
/// on storage failure).
pub(super) async fn reap_with_dal(
    dal: &DAL,
    config: &QueueConfig,
    metrics: &QueueMetrics,
    reaping_date: NaiveDateTime,
) -> ReapSummary {
    let now = chrono::Utc::now().naive_utc();
    let node = config.creator_name().to_string();
    let summary = match dal
        .queue_entries()
        .reap_entries(node.clone(), now, reaping_date, config.max_reaped_entries())
        .await
    {
        Ok(summary) => summary,
        Err(e) => {
            warn!("Failed to reap entries: {}", e);
            return ReapSummary::default();
        }
    };

    if !summary.stuck.is_empty() {
        warn!(
            "reap_entries: stuck queue entries (slow or hung worker on this node): {:?}",
            summary.stuck
        );
    }
    if !summary.late.is_empty() {
        warn!(
            "reap_entries: late queue entries (this node is behind): {:?}",
            summary.late
        );
    }
    if !summary.reaped.is_empty() {
        warn!(
            "reap_entries: {} entries reaped by {} (new record ids: {:?})",
            summary.reaped.len(),
            node,
            summary.reinserted
        );
        metrics.record_reaped(summary.reaped.len() as u64);
    }
    if summary.is_empty() {
        debug!("reap_entries: nothing left behind");
    }

    summary
}
