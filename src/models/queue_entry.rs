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

//! Queue Entry Model
//!
//! One [`QueueEntry`] is one unit of queued work: a row in the live table,
//! later exactly one row in the history table. The engine treats the payload
//! as opaque text tagged with `payload_type`; everything else is delivery
//! bookkeeping.

use chrono::NaiveDateTime;
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::database::schema::{queue_entries, queue_entries_history};

/// Lifecycle state of a queue entry.
///
/// ```text
/// AVAILABLE --claim--> IN_PROCESSING --success--> PROCESSED (archived)
///                      IN_PROCESSING --transient, retries left--> AVAILABLE (error_count + 1)
///                      IN_PROCESSING --fatal or exhausted--> FAILED (archived)
/// AVAILABLE|IN_PROCESSING --reap--> REAPED (archived) + fresh AVAILABLE clone
/// AVAILABLE --cancel--> REMOVED (archived)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessingState {
    Available,
    InProcessing,
    Processed,
    Failed,
    Removed,
    Reaped,
}

impl ProcessingState {
    /// The persisted representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingState::Available => "AVAILABLE",
            ProcessingState::InProcessing => "IN_PROCESSING",
            ProcessingState::Processed => "PROCESSED",
            ProcessingState::Failed => "FAILED",
            ProcessingState::Removed => "REMOVED",
            ProcessingState::Reaped => "REAPED",
        }
    }

    /// Parses a persisted state; `None` for anything unknown.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "AVAILABLE" => Some(ProcessingState::Available),
            "IN_PROCESSING" => Some(ProcessingState::InProcessing),
            "PROCESSED" => Some(ProcessingState::Processed),
            "FAILED" => Some(ProcessingState::Failed),
            "REMOVED" => Some(ProcessingState::Removed),
            "REAPED" => Some(ProcessingState::Reaped),
            _ => None,
        }
    }

    /// Terminal states live only in the history table.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProcessingState::Processed
                | ProcessingState::Failed
                | ProcessingState::Removed
                | ProcessingState::Reaped
        )
    }
}

impl std::fmt::Display for ProcessingState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the reaper classifies a left-behind entry relative to its own node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReapCategory {
    /// Owned by this node with an expired lease: presumed a slow or hung
    /// worker, logged but never recycled (recycling would race a live
    /// dispatch).
    Stuck,
    /// Created by this node and never claimed: presumed backlog, logged but
    /// not recycled.
    Late,
    /// Created or owned by a different (presumably dead) node: recycled.
    Orphaned,
}

/// A row in the live queue table.
#[derive(Debug, Clone, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = queue_entries)]
pub struct QueueEntry {
    /// Store-assigned monotonic identity
    pub record_id: i64,
    /// Logical queue identifier; one table may multiplex several queues
    pub queue_name: String,
    /// Type tag used to route the payload to a handler
    pub payload_type: String,
    /// Serialized event body, opaque to the engine
    pub payload: String,
    /// Correlation id, propagated into the handler's logging context
    pub user_token: Option<String>,
    /// Correlation id attached at future-notification scheduling time
    pub future_user_token: Option<String>,
    /// Caller-defined tag, no engine semantics
    pub search_key1: i64,
    /// Caller-defined tag, no engine semantics
    pub search_key2: i64,
    pub created_date: NaiveDateTime,
    /// Node that produced the entry
    pub creating_owner: String,
    pub processing_state: String,
    /// Claim lease holder; set iff the lease expiry is set
    pub processing_owner: Option<String>,
    /// Claim lease expiry
    pub processing_available_date: Option<NaiveDateTime>,
    pub error_count: i64,
    /// Earliest dispatch time; the creation time for bus events
    pub effective_date: NaiveDateTime,
}

impl QueueEntry {
    /// The parsed lifecycle state, `None` if the stored value is unknown.
    pub fn state(&self) -> Option<ProcessingState> {
        ProcessingState::parse(&self.processing_state)
    }

    /// The correlation token as a UUID, if present and well-formed.
    pub fn user_token_uuid(&self) -> Option<Uuid> {
        self.user_token
            .as_deref()
            .and_then(|t| Uuid::parse_str(t).ok())
    }

    /// The future-notification correlation token as a UUID, if present and
    /// well-formed.
    pub fn future_user_token_uuid(&self) -> Option<Uuid> {
        self.future_user_token
            .as_deref()
            .and_then(|t| Uuid::parse_str(t).ok())
    }

    /// Whether this entry could be claimed at `now`: AVAILABLE, effective,
    /// with no live lease.
    pub fn is_available_for_processing(&self, now: NaiveDateTime) -> bool {
        if self.state() != Some(ProcessingState::Available) {
            return false;
        }
        if self.effective_date > now {
            return false;
        }
        match self.processing_available_date {
            Some(lease_expiry) => lease_expiry <= now,
            None => true,
        }
    }

    /// Classifies this entry for the reaper running on `node`.
    pub fn reap_category(&self, node: &str) -> ReapCategory {
        let processed_by_this_node = self.processing_owner.as_deref() == Some(node);
        let created_here_never_claimed =
            self.creating_owner == node && self.processing_owner.is_none();
        if processed_by_this_node {
            ReapCategory::Stuck
        } else if created_here_never_claimed {
            ReapCategory::Late
        } else {
            ReapCategory::Orphaned
        }
    }

    /// Builds the history row for a terminal transition of this entry.
    pub fn into_history(self, state: ProcessingState, error_count: i64) -> HistoricalQueueEntry {
        HistoricalQueueEntry {
            record_id: self.record_id,
            queue_name: self.queue_name,
            payload_type: self.payload_type,
            payload: self.payload,
            user_token: self.user_token,
            future_user_token: self.future_user_token,
            search_key1: self.search_key1,
            search_key2: self.search_key2,
            created_date: self.created_date,
            creating_owner: self.creating_owner,
            processing_state: state.as_str().to_string(),
            processing_owner: self.processing_owner,
            processing_available_date: self.processing_available_date,
            error_count,
            effective_date: self.effective_date,
        }
    }
}

/// A new entry to be appended to the live table as AVAILABLE.
#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = queue_entries)]
pub struct NewQueueEntry {
    pub queue_name: String,
    pub payload_type: String,
    pub payload: String,
    pub user_token: Option<String>,
    pub future_user_token: Option<String>,
    pub search_key1: i64,
    pub search_key2: i64,
    pub created_date: NaiveDateTime,
    pub creating_owner: String,
    pub processing_state: String,
    pub processing_owner: Option<String>,
    pub processing_available_date: Option<NaiveDateTime>,
    pub error_count: i64,
    pub effective_date: NaiveDateTime,
}

impl NewQueueEntry {
    /// A bus event: effective immediately.
    #[allow(clippy::too_many_arguments)]
    pub fn bus_event(
        queue_name: &str,
        payload_type: &str,
        payload: String,
        user_token: Option<Uuid>,
        search_key1: i64,
        search_key2: i64,
        creating_owner: &str,
        now: NaiveDateTime,
    ) -> Self {
        Self {
            queue_name: queue_name.to_string(),
            payload_type: payload_type.to_string(),
            payload,
            user_token: user_token.map(|t| t.to_string()),
            future_user_token: None,
            search_key1,
            search_key2,
            created_date: now,
            creating_owner: creating_owner.to_string(),
            processing_state: ProcessingState::Available.as_str().to_string(),
            processing_owner: None,
            processing_available_date: None,
            error_count: 0,
            effective_date: now,
        }
    }

    /// A future notification: dispatched no earlier than `effective_date`.
    #[allow(clippy::too_many_arguments)]
    pub fn notification(
        queue_name: &str,
        payload_type: &str,
        payload: String,
        future_user_token: Option<Uuid>,
        search_key1: i64,
        search_key2: i64,
        creating_owner: &str,
        now: NaiveDateTime,
        effective_date: NaiveDateTime,
    ) -> Self {
        Self {
            queue_name: queue_name.to_string(),
            payload_type: payload_type.to_string(),
            payload,
            user_token: None,
            future_user_token: future_user_token.map(|t| t.to_string()),
            search_key1,
            search_key2,
            created_date: now,
            creating_owner: creating_owner.to_string(),
            processing_state: ProcessingState::Available.as_str().to_string(),
            processing_owner: None,
            processing_available_date: None,
            error_count: 0,
            effective_date,
        }
    }

    /// A fresh AVAILABLE clone of a reaped entry, owned by the reaping node.
    pub fn reaped_clone(entry: &QueueEntry, reaping_owner: &str, now: NaiveDateTime) -> Self {
        Self {
            queue_name: entry.queue_name.clone(),
            payload_type: entry.payload_type.clone(),
            payload: entry.payload.clone(),
            user_token: entry.user_token.clone(),
            future_user_token: entry.future_user_token.clone(),
            search_key1: entry.search_key1,
            search_key2: entry.search_key2,
            created_date: now,
            creating_owner: reaping_owner.to_string(),
            processing_state: ProcessingState::Available.as_str().to_string(),
            processing_owner: None,
            processing_available_date: None,
            error_count: entry.error_count,
            effective_date: entry.effective_date,
        }
    }
}

/// A row in the history table. Always terminal.
#[derive(Debug, Clone, Queryable, Selectable, Insertable, Serialize, Deserialize)]
#[diesel(table_name = queue_entries_history)]
pub struct HistoricalQueueEntry {
    pub record_id: i64,
    pub queue_name: String,
    pub payload_type: String,
    pub payload: String,
    pub user_token: Option<String>,
    pub future_user_token: Option<String>,
    pub search_key1: i64,
    pub search_key2: i64,
    pub created_date: NaiveDateTime,
    pub creating_owner: String,
    pub processing_state: String,
    pub processing_owner: Option<String>,
    pub processing_available_date: Option<NaiveDateTime>,
    pub error_count: i64,
    pub effective_date: NaiveDateTime,
}

impl HistoricalQueueEntry {
    /// The parsed lifecycle state, `None` if the stored value is unknown.
    pub fn state(&self) -> Option<ProcessingState> {
        ProcessingState::parse(&self.processing_state)
    }
}
