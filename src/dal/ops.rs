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

//! Synchronous query helpers over [`AnyConn`].
//!
//! Everything that touches the queue tables is expressed here once and
//! shared between the pooled async entry points and the explicit
//! transaction context. Operations that need backend-specific SQL (the
//! claims and the reap use `FOR UPDATE SKIP LOCKED` on PostgreSQL) use the
//! two-block form of `connection_match!`; SQLite serializes claim attempts
//! through its single-connection pool instead.

use chrono::NaiveDateTime;
use diesel::prelude::*;

use super::{AnyConn, ReapSummary};
use crate::connection_match;
use crate::database::schema::{queue_entries, queue_entries_history};
use crate::error::StorageError;
use crate::models::{
    HistoricalQueueEntry, NewQueueEntry, ProcessingState, QueueEntry, ReapCategory,
};

/// Inserts one entry into the live table, returning the store-assigned
/// record id.
pub(crate) fn insert_entry(conn: AnyConn<'_>, entry: &NewQueueEntry) -> Result<i64, StorageError> {
    connection_match!(conn, c => {
        let record_id = diesel::insert_into(queue_entries::table)
            .values(entry)
            .returning(queue_entries::record_id)
            .get_result(c)?;
        Ok(record_id)
    })
}

/// Fetches full rows for exactly the given ids, in ready order.
pub(crate) fn entries_from_ids(
    conn: AnyConn<'_>,
    record_ids: &[i64],
) -> Result<Vec<QueueEntry>, StorageError> {
    if record_ids.is_empty() {
        return Ok(Vec::new());
    }
    connection_match!(conn, c => {
        let entries = queue_entries::table
            .filter(queue_entries::record_id.eq_any(record_ids))
            .order((
                queue_entries::effective_date.asc(),
                queue_entries::created_date.asc(),
                queue_entries::record_id.asc(),
            ))
            .load(c)?;
        Ok(entries)
    })
}

/// Fetches one row by id.
pub(crate) fn get_entry(
    conn: AnyConn<'_>,
    record_id: i64,
) -> Result<Option<QueueEntry>, StorageError> {
    connection_match!(conn, c => {
        let entry = queue_entries::table
            .find(record_id)
            .first(c)
            .optional()?;
        Ok(entry)
    })
}

/// Ready entries visible at `now`, without claiming them.
pub(crate) fn ready_entries(
    conn: AnyConn<'_>,
    now: NaiveDateTime,
    max: i64,
    owner: Option<&str>,
) -> Result<Vec<QueueEntry>, StorageError> {
    connection_match!(conn, c => {
        let mut query = queue_entries::table
            .filter(queue_entries::processing_state.eq(ProcessingState::Available.as_str()))
            .filter(queue_entries::effective_date.le(now))
            .filter(
                queue_entries::processing_owner
                    .is_null()
                    .or(queue_entries::processing_available_date.le(now)),
            )
            .into_boxed();
        if let Some(owner) = owner {
            query = query.filter(queue_entries::creating_owner.eq(owner.to_string()));
        }
        let entries = query
            .order((
                queue_entries::effective_date.asc(),
                queue_entries::created_date.asc(),
                queue_entries::record_id.asc(),
            ))
            .limit(max)
            .load(c)?;
        Ok(entries)
    })
}

/// Number of ready entries with an effective date up to `bound`.
pub(crate) fn nb_ready_entries(
    conn: AnyConn<'_>,
    bound: NaiveDateTime,
    owner: Option<&str>,
) -> Result<i64, StorageError> {
    connection_match!(conn, c => {
        let mut query = queue_entries::table
            .filter(queue_entries::processing_state.eq(ProcessingState::Available.as_str()))
            .filter(queue_entries::effective_date.le(bound))
            .into_boxed();
        if let Some(owner) = owner {
            query = query.filter(queue_entries::creating_owner.eq(owner.to_string()));
        }
        let count = query.count().get_result(c)?;
        Ok(count)
    })
}

/// Pages record ids of ready entries created by `owner`, for priming the
/// inflight queue.
pub(crate) fn ready_entry_ids(
    conn: AnyConn<'_>,
    now: NaiveDateTime,
    from_record_id: i64,
    max: i64,
    owner: &str,
) -> Result<Vec<i64>, StorageError> {
    connection_match!(conn, c => {
        let ids = queue_entries::table
            .select(queue_entries::record_id)
            .filter(queue_entries::processing_state.eq(ProcessingState::Available.as_str()))
            .filter(queue_entries::effective_date.le(now))
            .filter(queue_entries::creating_owner.eq(owner))
            .filter(queue_entries::record_id.ge(from_record_id))
            .order(queue_entries::record_id.asc())
            .limit(max)
            .load(c)?;
        Ok(ids)
    })
}

/// The conditional claim itself: flips AVAILABLE rows among `ids` to
/// IN_PROCESSING under a fresh lease, then reloads exactly the rows that
/// were won, in ready order. Expanded inline so it works on either
/// backend's connection; must run inside a transaction.
macro_rules! claim_by_ids {
    ($c:expr, $ids:expr, $now:expr, $claimer:expr, $lease:expr) => {{
        let ids: &[i64] = $ids;
        if ids.is_empty() {
            Ok(Vec::new())
        } else {
            diesel::update(
                queue_entries::table
                    .filter(queue_entries::record_id.eq_any(ids))
                    .filter(
                        queue_entries::processing_state.eq(ProcessingState::Available.as_str()),
                    )
                    .filter(queue_entries::effective_date.le($now))
                    .filter(
                        queue_entries::processing_owner
                            .is_null()
                            .or(queue_entries::processing_available_date.le($now)),
                    ),
            )
            .set((
                queue_entries::processing_state.eq(ProcessingState::InProcessing.as_str()),
                queue_entries::processing_owner.eq(Some($claimer.to_string())),
                queue_entries::processing_available_date.eq(Some($lease)),
            ))
            .execute(&mut *$c)?;

            queue_entries::table
                .filter(queue_entries::record_id.eq_any(ids))
                .filter(queue_entries::processing_owner.eq($claimer.to_string()))
                .filter(queue_entries::processing_state.eq(ProcessingState::InProcessing.as_str()))
                .order((
                    queue_entries::effective_date.asc(),
                    queue_entries::created_date.asc(),
                    queue_entries::record_id.asc(),
                ))
                .load::<QueueEntry>(&mut *$c)
        }
    }};
}

/// Claims up to `max` ready entries in one conditional operation.
///
/// PostgreSQL locks the candidate rows with `FOR UPDATE SKIP LOCKED` so
/// concurrent claimers never double-claim and never block on each other.
/// SQLite relies on the single-connection pool serializing writers.
pub(crate) fn claim_ready_entries(
    conn: AnyConn<'_>,
    now: NaiveDateTime,
    max: i64,
    owner_filter: Option<&str>,
    claimer: &str,
    lease_expiry: NaiveDateTime,
) -> Result<Vec<QueueEntry>, StorageError> {
    connection_match!(conn, pg => {
        let claimed = pg.transaction::<_, diesel::result::Error, _>(|c| {
            let candidate_ids: Vec<i64> = if let Some(owner) = owner_filter {
                queue_entries::table
                    .select(queue_entries::record_id)
                    .filter(queue_entries::processing_state.eq(ProcessingState::Available.as_str()))
                    .filter(queue_entries::effective_date.le(now))
                    .filter(
                        queue_entries::processing_owner
                            .is_null()
                            .or(queue_entries::processing_available_date.le(now)),
                    )
                    .filter(queue_entries::creating_owner.eq(owner))
                    .order((
                        queue_entries::effective_date.asc(),
                        queue_entries::created_date.asc(),
                        queue_entries::record_id.asc(),
                    ))
                    .limit(max)
                    .for_update()
                    .skip_locked()
                    .load(c)?
            } else {
                queue_entries::table
                    .select(queue_entries::record_id)
                    .filter(queue_entries::processing_state.eq(ProcessingState::Available.as_str()))
                    .filter(queue_entries::effective_date.le(now))
                    .filter(
                        queue_entries::processing_owner
                            .is_null()
                            .or(queue_entries::processing_available_date.le(now)),
                    )
                    .order((
                        queue_entries::effective_date.asc(),
                        queue_entries::created_date.asc(),
                        queue_entries::record_id.asc(),
                    ))
                    .limit(max)
                    .for_update()
                    .skip_locked()
                    .load(c)?
            };
            claim_by_ids!(c, &candidate_ids, now, claimer, lease_expiry)
        })?;
        Ok(claimed)
    }, sqlite => {
        let claimed = sqlite.transaction::<_, diesel::result::Error, _>(|c| {
            let mut query = queue_entries::table
                .select(queue_entries::record_id)
                .filter(queue_entries::processing_state.eq(ProcessingState::Available.as_str()))
                .filter(queue_entries::effective_date.le(now))
                .filter(
                    queue_entries::processing_owner
                        .is_null()
                        .or(queue_entries::processing_available_date.le(now)),
                )
                .into_boxed();
            if let Some(owner) = owner_filter {
                query = query.filter(queue_entries::creating_owner.eq(owner.to_string()));
            }
            let candidate_ids: Vec<i64> = query
                .order((
                    queue_entries::effective_date.asc(),
                    queue_entries::created_date.asc(),
                    queue_entries::record_id.asc(),
                ))
                .limit(max)
                .load(c)?;
            claim_by_ids!(c, &candidate_ids, now, claimer, lease_expiry)
        })?;
        Ok(claimed)
    })
}

/// Claims exactly the given ids (the inflight path). Ids that are no longer
/// claimable simply claim nothing and are dropped from the result.
pub(crate) fn claim_entries_by_ids(
    conn: AnyConn<'_>,
    record_ids: &[i64],
    now: NaiveDateTime,
    claimer: &str,
    lease_expiry: NaiveDateTime,
) -> Result<Vec<QueueEntry>, StorageError> {
    if record_ids.is_empty() {
        return Ok(Vec::new());
    }
    connection_match!(conn, c => {
        let claimed = c.transaction::<_, diesel::result::Error, _>(|c| {
            claim_by_ids!(c, record_ids, now, claimer, lease_expiry)
        })?;
        Ok(claimed)
    })
}

/// Updates an entry after a transient handler failure: error count
/// incremented, lease cleared, state back to AVAILABLE.
pub(crate) fn update_on_error(
    conn: AnyConn<'_>,
    record_id: i64,
    error_count: i64,
) -> Result<(), StorageError> {
    connection_match!(conn, c => {
        diesel::update(queue_entries::table.find(record_id))
            .set((
                queue_entries::processing_state.eq(ProcessingState::Available.as_str()),
                queue_entries::processing_owner.eq(None::<String>),
                queue_entries::processing_available_date.eq(None::<NaiveDateTime>),
                queue_entries::error_count.eq(error_count),
            ))
            .execute(c)?;
        Ok(())
    })
}

/// Atomically inserts the given terminal rows into the history table and
/// deletes them from the live table.
pub(crate) fn move_entries_to_history(
    conn: AnyConn<'_>,
    rows: &[HistoricalQueueEntry],
) -> Result<(), StorageError> {
    if rows.is_empty() {
        return Ok(());
    }
    let record_ids: Vec<i64> = rows.iter().map(|r| r.record_id).collect();
    connection_match!(conn, c => {
        c.transaction::<_, diesel::result::Error, _>(|c| {
            diesel::insert_into(queue_entries_history::table)
                .values(rows)
                .execute(c)?;
            diesel::delete(
                queue_entries::table.filter(queue_entries::record_id.eq_any(&record_ids)),
            )
            .execute(c)?;
            Ok(())
        })?;
        Ok(())
    })
}

/// Non-terminal entries whose lease is unset or expired and whose creation
/// date is older than the reaping cutoff.
pub(crate) fn entries_left_behind(
    conn: AnyConn<'_>,
    now: NaiveDateTime,
    reaping_date: NaiveDateTime,
    max: i64,
) -> Result<Vec<QueueEntry>, StorageError> {
    connection_match!(conn, c => {
        let entries = queue_entries::table
            .filter(queue_entries::processing_state.eq_any(vec![
                ProcessingState::Available.as_str(),
                ProcessingState::InProcessing.as_str(),
            ]))
            .filter(
                queue_entries::processing_owner
                    .is_null()
                    .or(queue_entries::processing_available_date.le(now)),
            )
            .filter(queue_entries::created_date.le(reaping_date))
            .order(queue_entries::created_date.asc())
            .limit(max)
            .load(c)?;
        Ok(entries)
    })
}

/// One reap cycle: select left-behind entries, classify against `node`,
/// recycle the orphans. Runs in a single transaction.
pub(crate) fn reap_entries(
    conn: AnyConn<'_>,
    node: &str,
    now: NaiveDateTime,
    reaping_date: NaiveDateTime,
    max: i64,
) -> Result<ReapSummary, StorageError> {
    connection_match!(conn, c => {
        let summary = c.transaction::<_, diesel::result::Error, _>(|c| {
            let candidates: Vec<QueueEntry> = queue_entries::table
                .filter(queue_entries::processing_state.eq_any(vec![
                    ProcessingState::Available.as_str(),
                    ProcessingState::InProcessing.as_str(),
                ]))
                .filter(
                    queue_entries::processing_owner
                        .is_null()
                        .or(queue_entries::processing_available_date.le(now)),
                )
                .filter(queue_entries::created_date.le(reaping_date))
                .order(queue_entries::created_date.asc())
                .limit(max)
                .load(c)?;

            let mut summary = ReapSummary::default();
            let mut orphans: Vec<QueueEntry> = Vec::new();
            for entry in candidates {
                match entry.reap_category(node) {
                    ReapCategory::Stuck => summary.stuck.push(entry.record_id),
                    ReapCategory::Late => summary.late.push(entry.record_id),
                    ReapCategory::Orphaned => orphans.push(entry),
                }
            }

            if orphans.is_empty() {
                return Ok(summary);
            }

            let clones: Vec<NewQueueEntry> = orphans
                .iter()
                .map(|entry| NewQueueEntry::reaped_clone(entry, node, now))
                .collect();
            let history_rows: Vec<HistoricalQueueEntry> = orphans
                .into_iter()
                .map(|entry| {
                    let error_count = entry.error_count;
                    summary.reaped.push(entry.record_id);
                    entry.into_history(ProcessingState::Reaped, error_count)
                })
                .collect();

            diesel::insert_into(queue_entries_history::table)
                .values(&history_rows)
                .execute(c)?;
            diesel::delete(
                queue_entries::table
                    .filter(queue_entries::record_id.eq_any(summary.reaped.clone())),
            )
            .execute(c)?;
            for clone in &clones {
                let new_id: i64 = diesel::insert_into(queue_entries::table)
                    .values(clone)
                    .returning(queue_entries::record_id)
                    .get_result(c)?;
                summary.reinserted.push(new_id);
            }

            Ok(summary)
        })?;
        Ok(summary)
    })
}

/// Entries currently claimed, in ready order.
pub(crate) fn in_processing_entries(
    conn: AnyConn<'_>,
    queue_name: Option<&str>,
) -> Result<Vec<QueueEntry>, StorageError> {
    connection_match!(conn, c => {
        let mut query = queue_entries::table
            .filter(queue_entries::processing_state.eq(ProcessingState::InProcessing.as_str()))
            .into_boxed();
        if let Some(queue_name) = queue_name {
            query = query.filter(queue_entries::queue_name.eq(queue_name.to_string()));
        }
        let entries = query
            .order((
                queue_entries::effective_date.asc(),
                queue_entries::created_date.asc(),
                queue_entries::record_id.asc(),
            ))
            .load(c)?;
        Ok(entries)
    })
}

/// Parameters for live-table search queries.
#[derive(Debug, Clone, Default)]
pub struct LiveSearch {
    pub states: Vec<ProcessingState>,
    pub queue_name: Option<String>,
    pub search_key1: Option<i64>,
    pub search_key2: i64,
    pub max_created_date: Option<NaiveDateTime>,
    pub effective_after: Option<NaiveDateTime>,
}

/// Searches the live table by the caller-defined keys.
pub(crate) fn search_live_entries(
    conn: AnyConn<'_>,
    search: &LiveSearch,
) -> Result<Vec<QueueEntry>, StorageError> {
    let states: Vec<&'static str> = search.states.iter().map(|s| s.as_str()).collect();
    connection_match!(conn, c => {
        let mut query = queue_entries::table
            .filter(queue_entries::processing_state.eq_any(states.clone()))
            .filter(queue_entries::search_key2.eq(search.search_key2))
            .into_boxed();
        if let Some(ref queue_name) = search.queue_name {
            query = query.filter(queue_entries::queue_name.eq(queue_name.clone()));
        }
        if let Some(key1) = search.search_key1 {
            query = query.filter(queue_entries::search_key1.eq(key1));
        }
        if let Some(max_created) = search.max_created_date {
            query = query.filter(queue_entries::created_date.le(max_created));
        }
        if let Some(effective_after) = search.effective_after {
            query = query.filter(queue_entries::effective_date.gt(effective_after));
        }
        let entries = query
            .order((
                queue_entries::effective_date.asc(),
                queue_entries::created_date.asc(),
                queue_entries::record_id.asc(),
            ))
            .load(c)?;
        Ok(entries)
    })
}

/// Parameters for history-table search queries.
#[derive(Debug, Clone, Default)]
pub struct HistoricalSearch {
    pub queue_name: Option<String>,
    pub search_key1: Option<i64>,
    pub search_key2: i64,
    pub min_created_date: Option<NaiveDateTime>,
}

/// Searches the history table by the caller-defined keys.
pub(crate) fn search_history_entries(
    conn: AnyConn<'_>,
    search: &HistoricalSearch,
) -> Result<Vec<HistoricalQueueEntry>, StorageError> {
    connection_match!(conn, c => {
        let mut query = queue_entries_history::table
            .filter(queue_entries_history::search_key2.eq(search.search_key2))
            .into_boxed();
        if let Some(ref queue_name) = search.queue_name {
            query = query.filter(queue_entries_history::queue_name.eq(queue_name.clone()));
        }
        if let Some(key1) = search.search_key1 {
            query = query.filter(queue_entries_history::search_key1.eq(key1));
        }
        if let Some(min_created) = search.min_created_date {
            query = query.filter(queue_entries_history::created_date.ge(min_created));
        }
        let entries = query
            .order(queue_entries_history::record_id.asc())
            .load(c)?;
        Ok(entries)
    })
}

/// Cancels a pending entry: moved to history as REMOVED if it is still
/// AVAILABLE. Returns whether anything was removed.
pub(crate) fn remove_entry(conn: AnyConn<'_>, record_id: i64) -> Result<bool, StorageError> {
    connection_match!(conn, c => {
        let removed = c.transaction::<_, diesel::result::Error, _>(|c| {
            let entry: Option<QueueEntry> = queue_entries::table
                .find(record_id)
                .first(c)
                .optional()?;
            let entry = match entry {
                Some(entry)
                    if entry.state() == Some(ProcessingState::Available) =>
                {
                    entry
                }
                _ => return Ok(false),
            };
            let error_count = entry.error_count;
            let history = entry.into_history(ProcessingState::Removed, error_count);
            diesel::insert_into(queue_entries_history::table)
                .values(&history)
                .execute(c)?;
            diesel::delete(queue_entries::table.find(record_id)).execute(c)?;
            Ok(true)
        })?;
        Ok(removed)
    })
}
