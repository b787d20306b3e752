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

//! Explicit transaction context.
//!
//! A [`QueueTransaction`] is threaded through the closure passed to
//! `in_transaction` on the facades. It borrows the connection for the
//! transaction's duration and buffers the record ids inserted through it;
//! the facade hands those ids to the storage strategy only after the
//! transaction commits, and a closure error rolls everything back and
//! drops the buffer with the context. There is no ambient transaction
//! state anywhere else.

use super::ops::{self, HistoricalSearch, LiveSearch};
use super::AnyConn;
use crate::error::QueueError;
use crate::models::{HistoricalQueueEntry, NewQueueEntry, QueueEntry};

/// A handle on one open store transaction, collecting the record ids
/// written through it.
///
/// Facade methods accepting a `&mut QueueTransaction` (posting, recording
/// future notifications, the keyed queries) perform their work inside the
/// caller's transaction.
pub struct QueueTransaction<'a> {
    conn: AnyConn<'a>,
    creator_name: String,
    pending: Vec<i64>,
}

impl<'a> QueueTransaction<'a> {
    pub(crate) fn new(conn: AnyConn<'a>, creator_name: &str) -> Self {
        Self {
            conn,
            creator_name: creator_name.to_string(),
            pending: Vec::new(),
        }
    }

    /// Record ids inserted through this context, surrendered to the facade
    /// at commit time.
    pub(crate) fn take_pending(&mut self) -> Vec<i64> {
        std::mem::take(&mut self.pending)
    }

    /// Inserts a prebuilt entry within this transaction, buffering its id.
    pub(crate) fn insert_entry(&mut self, entry: NewQueueEntry) -> Result<i64, QueueError> {
        let record_id = ops::insert_entry(self.conn.reborrow(), &entry)?;
        self.pending.push(record_id);
        Ok(record_id)
    }

    /// Searches the live table within this transaction.
    pub fn search_live_entries(
        &mut self,
        search: LiveSearch,
    ) -> Result<Vec<QueueEntry>, QueueError> {
        Ok(ops::search_live_entries(self.conn.reborrow(), &search)?)
    }

    /// Searches the history table within this transaction.
    pub fn search_history_entries(
        &mut self,
        search: HistoricalSearch,
    ) -> Result<Vec<HistoricalQueueEntry>, QueueError> {
        Ok(ops::search_history_entries(self.conn.reborrow(), &search)?)
    }

    /// The node identity entries inserted through this context carry.
    pub fn creator_name(&self) -> &str {
        &self.creator_name
    }
}
