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

//! Polling strategy: every dispatch cycle issues one conditional claim
//! against the store. No in-memory state; a crash loses nothing because
//! nothing lives outside the store.

use async_trait::async_trait;
use chrono::{NaiveDateTime, Utc};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use super::{
    check_terminal_states, reap_with_dal, QueueStorage, ReadyEntries,
};
use crate::config::{QueueConfig, QueueMode};
use crate::dal::DAL;
use crate::error::StorageError;
use crate::metrics::QueueMetrics;
use crate::models::{HistoricalQueueEntry, NewQueueEntry, QueueEntry};

/// Store-only queue storage for POLLING and STICKY_POLLING modes.
pub struct PollingQueueStorage {
    dal: DAL,
    config: Arc<QueueConfig>,
    metrics: Arc<QueueMetrics>,
}

impl PollingQueueStorage {
    pub fn new(dal: DAL, config: Arc<QueueConfig>, metrics: Arc<QueueMetrics>) -> Self {
        Self {
            dal,
            config,
            metrics,
        }
    }

    fn lease_expiry(&self, now: NaiveDateTime) -> NaiveDateTime {
        now + chrono::Duration::from_std(self.config.claim_duration())
            .unwrap_or_else(|_| chrono::Duration::minutes(5))
    }
}

#[async_trait]
impl QueueStorage for PollingQueueStorage {
    async fn initialize(&self) -> Result<(), StorageError> {
        info!(
            queue_table = self.config.table_name(),
            mode = ?self.config.queue_mode(),
            "Polling queue storage initialized"
        );
        Ok(())
    }

    async fn close(&self) {}

    async fn insert(&self, entry: NewQueueEntry) {
        match self.dal.queue_entries().insert_entry(entry).await {
            Ok(record_id) => {
                debug!(record_id, "Inserted queue entry");
                self.metrics.record_inserted();
            }
            Err(e) => {
                warn!("Failed to insert queue entry: {}", e);
            }
        }
    }

    async fn on_entries_committed(&self, _record_ids: &[i64]) {
        // The next polling cycle will see them; nothing to do.
    }

    async fn get_ready_entries(&self) -> ReadyEntries {
        let started = Instant::now();
        let now = Utc::now().naive_utc();
        let owner_filter = match self.config.queue_mode() {
            QueueMode::StickyPolling => Some(self.config.creator_name().to_string()),
            _ => None,
        };

        let claimed = self
            .dal
            .queue_entries()
            .claim_ready_entries(
                now,
                self.config.max_entries_claimed(),
                owner_filter,
                self.config.creator_name().to_string(),
                self.lease_expiry(now),
            )
            .await;

        match claimed {
            Ok(entries) => ReadyEntries {
                entries,
                elapsed: started.elapsed(),
            },
            Err(e) => {
                warn!("Failed to claim ready entries: {}", e);
                ReadyEntries {
                    entries: Vec::new(),
                    elapsed: started.elapsed(),
                }
            }
        }
    }

    async fn update_on_error(&self, entry: &QueueEntry, new_error_count: i64) {
        if let Err(e) = self
            .dal
            .queue_entries()
            .update_on_error(entry.record_id, new_error_count)
            .await
        {
            warn!(
                record_id = entry.record_id,
                "Failed to update entry after handler error: {}", e
            );
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
        reap_with_dal(&self.dal, &self.config, &self.metrics, reaping_date).await;
    }
}
