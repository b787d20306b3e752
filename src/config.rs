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

//! Configuration for a persistent queue.
//!
//! [`QueueConfig`] controls the dispatch strategy, claim leases, retry
//! limits, worker-pool sizing and the reaper schedule. Build one with
//! [`QueueConfig::builder()`]:
//!
//! ```rust,ignore
//! let config = QueueConfig::builder()
//!     .queue_mode(QueueMode::Polling)
//!     .max_dispatch_threads(8)
//!     .claim_duration(Duration::from_secs(300))
//!     .build();
//! ```

use std::time::Duration;
use uuid::Uuid;

/// Default live table identifier, matching the compiled diesel schema.
pub const DEFAULT_TABLE_NAME: &str = "queue_entries";
/// Default history table identifier, matching the compiled diesel schema.
pub const DEFAULT_HISTORY_TABLE_NAME: &str = "queue_entries_history";

/// Dispatch strategy for a persistent queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueMode {
    /// Entries may be dispatched by any node; every cycle polls the store
    /// for claimable entries.
    Polling,
    /// Entries are dispatched on the node that produced them; the code polls
    /// the store, filtered to this node's entries.
    StickyPolling,
    /// Entries are dispatched on the node that produced them; record ids are
    /// pushed through an in-memory queue as their transactions commit, and
    /// the store is only hit to fetch full rows.
    StickyEvents,
}

impl QueueMode {
    /// True for the modes where entries written by a node are also
    /// dispatched by that node.
    pub fn is_sticky(&self) -> bool {
        matches!(self, QueueMode::StickyPolling | QueueMode::StickyEvents)
    }
}

/// Configuration parameters for a persistent queue and its background
/// services.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct QueueConfig {
    queue_mode: QueueMode,
    processing_off: bool,
    max_failure_retries: i64,
    max_entries_claimed: i64,
    min_inflight_entries: usize,
    max_inflight_entries: usize,
    claim_duration: Duration,
    polling_sleep: Duration,
    event_queue_capacity: usize,
    max_dispatch_threads: usize,
    reap_threshold: Duration,
    reap_schedule: Duration,
    max_reaped_entries: i64,
    table_name: String,
    history_table_name: String,
    creator_name: String,
}

impl QueueConfig {
    /// Creates a new configuration builder with default values.
    pub fn builder() -> QueueConfigBuilder {
        QueueConfigBuilder::default()
    }

    /// The dispatch strategy.
    pub fn queue_mode(&self) -> QueueMode {
        self.queue_mode
    }

    /// When true, the queue refuses to initialize or start (entries are
    /// still durably written).
    pub fn processing_off(&self) -> bool {
        self.processing_off
    }

    /// Maximum number of in-place retries before an entry is terminally
    /// FAILED.
    pub fn max_failure_retries(&self) -> i64 {
        self.max_failure_retries
    }

    /// Maximum entries claimed per polling cycle.
    pub fn max_entries_claimed(&self) -> i64 {
        self.max_entries_claimed
    }

    /// Minimum batch the inflight drain waits for before returning early.
    pub fn min_inflight_entries(&self) -> usize {
        self.min_inflight_entries
    }

    /// Maximum batch drained from the inflight queue per cycle.
    pub fn max_inflight_entries(&self) -> usize {
        self.max_inflight_entries
    }

    /// How long a claim lease is valid before the entry becomes reclaimable.
    pub fn claim_duration(&self) -> Duration {
        self.claim_duration
    }

    /// Sleep between polling cycles that found nothing to dispatch.
    pub fn polling_sleep(&self) -> Duration {
        self.polling_sleep
    }

    /// Capacity of the bounded dispatch work queue; submission blocks when
    /// full.
    pub fn event_queue_capacity(&self) -> usize {
        self.event_queue_capacity
    }

    /// Upper bound on concurrently executing handler tasks.
    pub fn max_dispatch_threads(&self) -> usize {
        self.max_dispatch_threads
    }

    /// Age past which an unprocessed entry becomes a reap candidate. Must
    /// exceed [`Self::claim_duration`]; auto-corrected upward otherwise.
    pub fn reap_threshold(&self) -> Duration {
        self.reap_threshold
    }

    /// Fixed delay between reaper cycles.
    pub fn reap_schedule(&self) -> Duration {
        self.reap_schedule
    }

    /// Maximum entries examined per reaper cycle.
    pub fn max_reaped_entries(&self) -> i64 {
        self.max_reaped_entries
    }

    /// Live table identifier.
    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    /// History table identifier.
    pub fn history_table_name(&self) -> &str {
        &self.history_table_name
    }

    /// This node's identity, recorded as `creating_owner` on inserts and as
    /// `processing_owner` on claims.
    pub fn creator_name(&self) -> &str {
        &self.creator_name
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        QueueConfigBuilder::default().build()
    }
}

/// Builder for [`QueueConfig`].
#[derive(Debug, Clone)]
pub struct QueueConfigBuilder {
    config: QueueConfig,
}

impl Default for QueueConfigBuilder {
    fn default() -> Self {
        Self {
            config: QueueConfig {
                queue_mode: QueueMode::StickyPolling,
                processing_off: false,
                max_failure_retries: 3,
                max_entries_claimed: 10,
                min_inflight_entries: 1,
                max_inflight_entries: 100,
                claim_duration: Duration::from_secs(5 * 60),
                polling_sleep: Duration::from_secs(3),
                event_queue_capacity: 30000,
                max_dispatch_threads: 10,
                reap_threshold: Duration::from_secs(10 * 60),
                reap_schedule: Duration::from_secs(3 * 60),
                max_reaped_entries: 100,
                table_name: DEFAULT_TABLE_NAME.to_string(),
                history_table_name: DEFAULT_HISTORY_TABLE_NAME.to_string(),
                creator_name: format!("node-{}", Uuid::new_v4().simple()),
            },
        }
    }
}

impl QueueConfigBuilder {
    /// Sets the dispatch strategy.
    pub fn queue_mode(mut self, value: QueueMode) -> Self {
        self.config.queue_mode = value;
        self
    }

    /// Disables or enables processing entirely.
    pub fn processing_off(mut self, value: bool) -> Self {
        self.config.processing_off = value;
        self
    }

    /// Sets the maximum number of in-place retries.
    pub fn max_failure_retries(mut self, value: i64) -> Self {
        self.config.max_failure_retries = value;
        self
    }

    /// Sets the maximum entries claimed per polling cycle.
    pub fn max_entries_claimed(mut self, value: i64) -> Self {
        self.config.max_entries_claimed = value;
        self
    }

    /// Sets the minimum inflight drain batch.
    pub fn min_inflight_entries(mut self, value: usize) -> Self {
        self.config.min_inflight_entries = value;
        self
    }

    /// Sets the maximum inflight drain batch.
    pub fn max_inflight_entries(mut self, value: usize) -> Self {
        self.config.max_inflight_entries = value;
        self
    }

    /// Sets the claim lease duration.
    pub fn claim_duration(mut self, value: Duration) -> Self {
        self.config.claim_duration = value;
        self
    }

    /// Sets the idle polling sleep.
    pub fn polling_sleep(mut self, value: Duration) -> Self {
        self.config.polling_sleep = value;
        self
    }

    /// Sets the bounded work-queue capacity.
    pub fn event_queue_capacity(mut self, value: usize) -> Self {
        self.config.event_queue_capacity = value;
        self
    }

    /// Sets the worker-pool concurrency bound.
    pub fn max_dispatch_threads(mut self, value: usize) -> Self {
        self.config.max_dispatch_threads = value;
        self
    }

    /// Sets the reap staleness threshold.
    pub fn reap_threshold(mut self, value: Duration) -> Self {
        self.config.reap_threshold = value;
        self
    }

    /// Sets the reaper cycle delay.
    pub fn reap_schedule(mut self, value: Duration) -> Self {
        self.config.reap_schedule = value;
        self
    }

    /// Sets the per-cycle reap batch cap.
    pub fn max_reaped_entries(mut self, value: i64) -> Self {
        self.config.max_reaped_entries = value;
        self
    }

    /// Sets the live table identifier.
    pub fn table_name(mut self, value: impl Into<String>) -> Self {
        self.config.table_name = value.into();
        self
    }

    /// Sets the history table identifier.
    pub fn history_table_name(mut self, value: impl Into<String>) -> Self {
        self.config.history_table_name = value.into();
        self
    }

    /// Sets this node's identity. Sticky deployments should use a stable,
    /// per-node unique name.
    pub fn creator_name(mut self, value: impl Into<String>) -> Self {
        self.config.creator_name = value.into();
        self
    }

    /// Builds the configuration.
    pub fn build(self) -> QueueConfig {
        self.config
    }
}
