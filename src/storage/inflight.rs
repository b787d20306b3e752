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

//! Inflight-sticky strategy (STICKY_EVENTS).
//!
//! Record ids flow through a process-wide unbounded FIFO instead of a table
//! scan: direct inserts enqueue once the statement returns; transactional
//! inserts are enqueued by the facade's commit notification. The dispatch
//! side drains a batch (waiting up to [`INFLIGHT_POLLING_TIMEOUT`] to
//! accumulate a minimum), then claims exactly those ids in one round-trip.
//!
//! The FIFO is a performance cache, never a source of truth: a restart
//! primes it from the store, and anything it silently loses is recovered by
//! the reaper.

use async_trait::async_trait;
use chrono::{NaiveDateTime, Utc};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use super::{
    check_terminal_states, reap_with_dal, QueueStorage, ReadyEntries,
};
use crate::config::QueueConfig;
use crate::dal::DAL;
use crate::error::StorageError;
use crate::metrics::QueueMetrics;
use crate::models::{HistoricalQueueEntry, NewQueueEntry, QueueEntry};

/// Upper bound on the wait for a minimum batch before dispatching whatever
/// is there.
pub const INFLIGHT_POLLING_TIMEOUT: Duration = Duration::from_millis(100);

/// How many record ids are pulled per page while priming the queue at
/// startup.
const MAX_FETCHED_RECORD_IDS: i64 = 1000;

/// In-memory-fronted queue storage for STICKY_EVENTS mode.
pub struct InflightQueueStorage {
    dal: DAL,
    config: Arc<QueueConfig>,
    metrics: Arc<QueueMetrics>,
    inflight: Mutex<VecDeque<i64>>,
    notify: Notify,
}

impl InflightQueueStorage {
    pub fn new(dal: DAL, config: Arc<QueueConfig>, metrics: Arc<QueueMetrics>) -> Self {
        Self {
            dal,
            config,
            metrics,
            inflight: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }

    fn enqueue(&self, record_ids: &[i64]) {
        if record_ids.is_empty() {
            return;
        }
        {
            let mut queue = self.inflight.lock().expect("inflight queue lock poisoned");
            queue.extend(record_ids.iter().copied());
        }
        self.notify.notify_one();
    }

    /// Puts ids back at the front, preserving their relative order, after a
    /// failed claim round-trip.
    fn requeue_front(&self, record_ids: &[i64]) {
        let mut queue = self.inflight.lock().expect("inflight queue lock poisoned");
        for id in record_ids.iter().rev() {
            queue.push_front(*id);
        }
    }

    fn drain(&self, max: usize) -> Vec<i64> {
        let mut queue = self.inflight.lock().expect("inflight queue lock poisoned");
        let n = max.min(queue.len());
        queue.drain(..n).collect()
    }

    /// Current cache depth.
    pub fn inflight_len(&self) -> usize {
        self.inflight.lock().expect("inflight queue lock poisoned").len()
    }

    fn lease_expiry(&self, now: NaiveDateTime) -> NaiveDateTime {
        now + chrono::Duration::from_std(self.config.claim_duration())
            .unwrap_or_else(|_| chrono::Duration::minutes(5))
    }
}

#[async_trait]
impl QueueStorage for InflightQueueStorage {
    async fn initialize(&self) -> Result<(), StorageError> {
        self.inflight
            .lock()
            .expect("inflight queue lock poisoned")
            .clear();

        // Recover whatever this node left AVAILABLE before its last stop or
        // crash, paging by record id.
        let now = Utc::now().naive_utc();
        let owner = self.config.creator_name().to_string();
        let mut total = 0usize;
        let mut from_record_id = 0i64;
        loop {
            let ids = self
                .dal
                .queue_entries()
                .get_ready_entry_ids(now, from_record_id, MAX_FETCHED_RECORD_IDS, owner.clone())
                .await?;
            let last = match ids.last() {
                Some(last) => *last,
                None => break,
            };
            total += ids.len();
            self.enqueue(&ids);
            if (ids.len() as i64) < MAX_FETCHED_RECORD_IDS {
                break;
            }
            from_record_id = last + 1;
        }

        info!(
            entries = total,
            "Inflight queue primed during initialization"
        );
        Ok(())
    }

    async fn close(&self) {
        self.inflight
            .lock()
            .expect("inflight queue lock poisoned")
            .clear();
    }

    async fn insert(&self, entry: NewQueueEntry) {
        // Auto-commit insert: the row is durable once the call returns, so
        // the id can go straight into the cache.
        match self.dal.queue_entries().insert_entry(entry).await {
            Ok(record_id) => {
                debug!(record_id, "Inserted queue entry into inflight queue");
                self.metrics.record_inserted();
                self.enqueue(&[record_id]);
            }
            Err(e) => {
                warn!("Failed to insert queue entry: {}", e);
            }
        }
    }

    async fn on_entries_committed(&self, record_ids: &[i64]) {
        debug!(?record_ids, "Transaction committed, feeding inflight queue");
        self.enqueue(record_ids);
    }

    async fn get_ready_entries(&self) -> ReadyEntries {
        let started = Instant::now();
        let deadline = started + INFLIGHT_POLLING_TIMEOUT;
        let max = self.config.max_inflight_entries();
        let min = self.config.min_inflight_entries();

        let mut slept = Duration::ZERO;
        let mut record_ids = self.drain(max);
        while record_ids.len() < min {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let before = Instant::now();
            let _ = tokio::time::timeout(deadline - now, self.notify.notified()).await;
            slept += before.elapsed();
            record_ids.extend(self.drain(max - record_ids.len()));
        }

        if record_ids.is_empty() {
            return ReadyEntries {
                entries: Vec::new(),
                elapsed: started.elapsed().saturating_sub(slept),
            };
        }

        let now = Utc::now().naive_utc();
        let claimed = self
            .dal
            .queue_entries()
            .claim_entries_by_ids(
                record_ids.clone(),
                now,
                self.config.creator_name().to_string(),
                self.lease_expiry(now),
            )
            .await;

        match claimed {
            Ok(entries) => {
                if entries.len() < record_ids.len() {
                    // Stale cache entries (already terminal or re-claimed);
                    // the conditional claim dropped them on the floor.
                    debug!(
                        drained = record_ids.len(),
                        claimed = entries.len(),
                        "Some inflight ids were no longer claimable"
                    );
                }
                ReadyEntries {
                    entries,
                    elapsed: started.elapsed().saturating_sub(slept),
                }
            }
            Err(e) => {
                warn!("Failed to claim inflight entries, requeueing ids: {}", e);
                self.requeue_front(&record_ids);
                ReadyEntries {
                    entries: Vec::new(),
                    elapsed: started.elapsed().saturating_sub(slept),
                }
            }
        }
    }

    async fn update_on_error(&self, entry: &QueueEntry, new_error_count: i64) {
        match self
            .dal
            .queue_entries()
            .update_on_error(entry.record_id, new_error_count)
            .await
        {
            Ok(()) => {
                // Immediately redeliverable on this node.
                self.enqueue(&[entry.record_id]);
            }
            Err(e) => {
                warn!(
                    record_id = entry.record_id,
                    "Failed to update entry after handler error: {}", e
                );
            }
        }
    }

    async fn move_entries_to_history(&self, rows: Vec<HistoricalQueueEntry>) {
        if rows.is_empty() {
            return;
        }
        check_terminal_states(&rows);
        if let Err(e) = self.dal.queue_entries().move_entries_to_history(rows).await {
            warn!("Failed to move entries into history: {}", e);
        }
    }

    async fn reap_entries(&self, reaping_date: NaiveDateTime) {
        let summary = reap_with_dal(&self.dal, &self.config, &self.metrics, reaping_date).await;
        // Recycled entries belong to this node now; make them dispatchable
        // without waiting for a restart.
        self.enqueue(&summary.reinserted);
    }
}
