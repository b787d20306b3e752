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

//! Queue entry DAL with runtime backend selection.
//!
//! Each operation checks out a pooled connection for the detected backend
//! and runs the corresponding [`super::ops`] helper on it.

use chrono::NaiveDateTime;

use super::ops::{self, HistoricalSearch, LiveSearch};
use super::{run_ops, ReapSummary, DAL};
use crate::error::StorageError;
use crate::models::{HistoricalQueueEntry, NewQueueEntry, QueueEntry};

/// Data access for queue entries in the live and history tables.
#[derive(Clone)]
pub struct QueueEntryDAL<'a> {
    dal: &'a DAL,
}

impl<'a> QueueEntryDAL<'a> {
    /// Creates a new QueueEntryDAL instance.
    pub fn new(dal: &'a DAL) -> Self {
        Self { dal }
    }

    /// Inserts one entry as AVAILABLE, returning the store-assigned id.
    pub async fn insert_entry(&self, entry: NewQueueEntry) -> Result<i64, StorageError> {
        run_ops!(self.dal, conn => ops::insert_entry(conn, &entry))
    }

    /// Fetches full rows for exactly the given ids, in ready order.
    pub async fn get_entries_from_ids(
        &self,
        record_ids: Vec<i64>,
    ) -> Result<Vec<QueueEntry>, StorageError> {
        run_ops!(self.dal, conn => ops::entries_from_ids(conn, &record_ids))
    }

    /// Fetches one row by id.
    pub async fn get_entry(&self, record_id: i64) -> Result<Option<QueueEntry>, StorageError> {
        run_ops!(self.dal, conn => ops::get_entry(conn, record_id))
    }

    /// Ready entries visible at `now`, without claiming them.
    pub async fn get_ready_entries(
        &self,
        now: NaiveDateTime,
        max: i64,
        owner: Option<String>,
    ) -> Result<Vec<QueueEntry>, StorageError> {
        run_ops!(self.dal, conn => ops::ready_entries(conn, now, max, owner.as_deref()))
    }

    /// Number of ready entries with an effective date up to `bound`.
    pub async fn get_nb_ready_entries(
        &self,
        bound: NaiveDateTime,
        owner: Option<String>,
    ) -> Result<i64, StorageError> {
        run_ops!(self.dal, conn => ops::nb_ready_entries(conn, bound, owner.as_deref()))
    }

    /// Pages record ids of ready entries created by `owner` starting at
    /// `from_record_id`.
    pub async fn get_ready_entry_ids(
        &self,
        now: NaiveDateTime,
        from_record_id: i64,
        max: i64,
        owner: String,
    ) -> Result<Vec<i64>, StorageError> {
        run_ops!(self.dal, conn => ops::ready_entry_ids(conn, now, from_record_id, max, &owner))
    }

    /// Claims up to `max` ready entries with one conditional operation.
    pub async fn claim_ready_entries(
        &self,
        now: NaiveDateTime,
        max: i64,
        owner_filter: Option<String>,
        claimer: String,
        lease_expiry: NaiveDateTime,
    ) -> Result<Vec<QueueEntry>, StorageError> {
        run_ops!(self.dal, conn => ops::claim_ready_entries(
            conn,
            now,
            max,
            owner_filter.as_deref(),
            &claimer,
            lease_expiry,
        ))
    }

    /// Claims exactly the given ids; stale ids claim nothing.
    pub async fn claim_entries_by_ids(
        &self,
        record_ids: Vec<i64>,
        now: NaiveDateTime,
        claimer: String,
        lease_expiry: NaiveDateTime,
    ) -> Result<Vec<QueueEntry>, StorageError> {
        run_ops!(self.dal, conn => ops::claim_entries_by_ids(
            conn,
            &record_ids,
            now,
            &claimer,
            lease_expiry,
        ))
    }

    /// Persists an incremented error count and clears the lease.
    pub async fn update_on_error(
        &self,
        record_id: i64,
        error_count: i64,
    ) -> Result<(), StorageError> {
        run_ops!(self.dal, conn => ops::update_on_error(conn, record_id, error_count))
    }

    /// Atomically archives the given terminal rows and deletes them from the
    /// live table.
    pub async fn move_entries_to_history(
        &self,
        rows: Vec<HistoricalQueueEntry>,
    ) -> Result<(), StorageError> {
        run_ops!(self.dal, conn => ops::move_entries_to_history(conn, &rows))
    }

    /// Non-terminal entries whose lease is unset or expired and whose
    /// creation date is older than the cutoff.
    pub async fn get_entries_left_behind(
        &self,
        now: NaiveDateTime,
        reaping_date: NaiveDateTime,
        max: i64,
    ) -> Result<Vec<QueueEntry>, StorageError> {
        run_ops!(self.dal, conn => ops::entries_left_behind(conn, now, reaping_date, max))
    }

    /// One reap cycle for `node`; see [`crate::reaper::Reaper`].
    pub async fn reap_entries(
        &self,
        node: String,
        now: NaiveDateTime,
        reaping_date: NaiveDateTime,
        max: i64,
    ) -> Result<ReapSummary, StorageError> {
        run_ops!(self.dal, conn => ops::reap_entries(conn, &node, now, reaping_date, max))
    }

    /// Entries currently claimed, in ready order.
    pub async fn get_in_processing_entries(
        &self,
        queue_name: Option<String>,
    ) -> Result<Vec<QueueEntry>, StorageError> {
        run_ops!(self.dal, conn => ops::in_processing_entries(conn, queue_name.as_deref()))
    }

    /// Searches the live table by the caller-defined keys.
    pub async fn search_live_entries(
        &self,
        search: LiveSearch,
    ) -> Result<Vec<QueueEntry>, StorageError> {
        run_ops!(self.dal, conn => ops::search_live_entries(conn, &search))
    }

    /// Searches the history table by the caller-defined keys.
    pub async fn search_history_entries(
        &self,
        search: HistoricalSearch,
    ) -> Result<Vec<HistoricalQueueEntry>, StorageError> {
        run_ops!(self.dal, conn => ops::search_history_entries(conn, &search))
    }

    /// Cancels a pending entry (moved to history as REMOVED). Returns
    /// whether anything was removed.
    pub async fn remove_entry(&self, record_id: i64) -> Result<bool, StorageError> {
        run_ops!(self.dal, conn => ops::remove_entry(conn, record_id))
    }
}
