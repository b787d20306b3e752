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

//! Storage-level properties: claim ordering, claim exclusivity, id-batch
//! fetches and the live/history disjointness invariant.

use chrono::{NaiveDateTime, Utc};
use serial_test::serial;
use std::collections::HashSet;

use conveyor::{NewQueueEntry, ProcessingState, QueueConfig, DAL};

use crate::fixtures::*;

async fn prepared_dal() -> (TestDb, DAL) {
    let db = test_database();
    db.database
        .init_schema(&QueueConfig::default())
        .await
        .expect("schema");
    let dal = DAL::new(db.database.clone());
    (db, dal)
}

fn entry_with_offset(base: NaiveDateTime, offset_secs: i64) -> NewQueueEntry {
    let mut entry = NewQueueEntry::bus_event(
        "bus",
        "TestEvent",
        format!(r#"{{"id":{}}}"#, offset_secs),
        None,
        offset_secs,
        TEST_SEARCH_KEY2,
        "node-test",
        base,
    );
    entry.effective_date = base + chrono::Duration::seconds(offset_secs);
    entry
}

#[tokio::test]
#[serial]
async fn test_fifo_within_ready_batch() {
    let (_db, dal) = prepared_dal().await;
    let base = Utc::now().naive_utc() - chrono::Duration::seconds(1000);

    // Insert in scrambled order; readiness order must follow the effective
    // dates regardless.
    for offset in [5i64, 1, 9, 3, 7, 0, 8, 2, 6, 4] {
        dal.queue_entries()
            .insert_entry(entry_with_offset(base, offset))
            .await
            .expect("insert");
    }

    let now = Utc::now().naive_utc();
    let claimed = dal
        .queue_entries()
        .claim_ready_entries(
            now,
            50,
            None,
            "node-test".to_string(),
            now + chrono::Duration::minutes(5),
        )
        .await
        .expect("claim");

    let offsets: Vec<i64> = claimed.iter().map(|e| e.search_key1).collect();
    assert_eq!(offsets, vec![0, 1, 2, 3, 4, 5, 6, 7, 8, 9]);
    assert!(claimed
        .iter()
        .all(|e| e.state() == Some(ProcessingState::InProcessing)));
}

#[tokio::test]
#[serial]
async fn test_ties_break_by_insertion_order() {
    let (_db, dal) = prepared_dal().await;
    let base = Utc::now().naive_utc() - chrono::Duration::seconds(10);

    // Same effective and created dates: record id decides.
    let mut ids = Vec::new();
    for offset in 0..5 {
        let mut entry = entry_with_offset(base, 0);
        entry.search_key1 = offset;
        ids.push(
            dal.queue_entries()
                .insert_entry(entry)
                .await
                .expect("insert"),
        );
    }

    let now = Utc::now().naive_utc();
    let claimed = dal
        .queue_entries()
        .claim_ready_entries(
            now,
            50,
            None,
            "node-test".to_string(),
            now + chrono::Duration::minutes(5),
        )
        .await
        .expect("claim");

    let claimed_ids: Vec<i64> = claimed.iter().map(|e| e.record_id).collect();
    assert_eq!(claimed_ids, ids);
}

#[tokio::test]
#[serial]
async fn test_claim_exclusivity() {
    let (_db, dal) = prepared_dal().await;
    let base = Utc::now().naive_utc() - chrono::Duration::seconds(10);

    dal.queue_entries()
        .insert_entry(entry_with_offset(base, 0))
        .await
        .expect("insert");

    let now = Utc::now().naive_utc();
    let lease = now + chrono::Duration::minutes(5);

    let first = dal
        .queue_entries()
        .claim_ready_entries(now, 10, None, "node-a".to_string(), lease)
        .await
        .expect("claim");
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].processing_owner.as_deref(), Some("node-a"));

    // A second claim attempt finds nothing: the conditional update's
    // pre-image check is deterministic.
    let second = dal
        .queue_entries()
        .claim_ready_entries(now, 10, None, "node-b".to_string(), lease)
        .await
        .expect("claim");
    assert!(second.is_empty());
}

#[tokio::test]
#[serial]
async fn test_get_entries_from_ids_round_trip_2000() {
    let (_db, dal) = prepared_dal().await;
    let base = Utc::now().naive_utc() - chrono::Duration::seconds(10);

    let mut ids = Vec::with_capacity(2000);
    for n in 0..2000i64 {
        let mut entry = entry_with_offset(base, 0);
        entry.search_key1 = n;
        ids.push(
            dal.queue_entries()
                .insert_entry(entry)
                .await
                .expect("insert"),
        );
    }

    let fetched = dal
        .queue_entries()
        .get_entries_from_ids(ids.clone())
        .await
        .expect("fetch");

    assert_eq!(fetched.len(), 2000);
    let distinct: HashSet<i64> = fetched.iter().map(|e| e.record_id).collect();
    assert_eq!(distinct.len(), 2000);
    let expected: HashSet<i64> = ids.into_iter().collect();
    assert_eq!(distinct, expected);
}

#[tokio::test]
#[serial]
async fn test_history_move_keeps_tables_disjoint() {
    let (_db, dal) = prepared_dal().await;
    let base = Utc::now().naive_utc() - chrono::Duration::seconds(10);

    dal.queue_entries()
        .insert_entry(entry_with_offset(base, 0))
        .await
        .expect("insert");

    let now = Utc::now().naive_utc();
    let claimed = dal
        .queue_entries()
        .claim_ready_entries(
            now,
            10,
            None,
            "node-a".to_string(),
            now + chrono::Duration::minutes(5),
        )
        .await
        .expect("claim");
    assert_eq!(claimed.len(), 1);
    let record_id = claimed[0].record_id;

    let rows = claimed
        .into_iter()
        .map(|e| {
            let error_count = e.error_count;
            e.into_history(ProcessingState::Processed, error_count)
        })
        .collect();
    dal.queue_entries()
        .move_entries_to_history(rows)
        .await
        .expect("move");

    assert!(live_entries(&dal, "bus").await.is_empty());
    let history = history_entries(&dal, "bus").await;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].record_id, record_id);
    assert_eq!(history[0].state(), Some(ProcessingState::Processed));
}
