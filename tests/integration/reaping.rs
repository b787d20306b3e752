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

//! Reap classification and recovery: stuck and late entries are only
//! reported, orphaned entries are recycled exactly once.

use chrono::Utc;
use serial_test::serial;

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

/// An old entry claimed by `owner` with an expired lease.
fn stale_claimed_entry(creating_owner: &str, processing_owner: &str) -> NewQueueEntry {
    let now = Utc::now().naive_utc();
    let old = now - chrono::Duration::hours(1);
    NewQueueEntry {
        queue_name: "bus".to_string(),
        payload_type: "TestEvent".to_string(),
        payload: r#"{"id":1}"#.to_string(),
        user_token: None,
        future_user_token: None,
        search_key1: 1,
        search_key2: TEST_SEARCH_KEY2,
        created_date: old,
        creating_owner: creating_owner.to_string(),
        processing_state: ProcessingState::InProcessing.as_str().to_string(),
        processing_owner: Some(processing_owner.to_string()),
        processing_available_date: Some(now - chrono::Duration::minutes(10)),
        error_count: 2,
        effective_date: old,
    }
}

/// An old entry created by `creating_owner` that was never claimed.
fn stale_unclaimed_entry(creating_owner: &str) -> NewQueueEntry {
    let now = Utc::now().naive_utc();
    let old = now - chrono::Duration::hours(1);
    NewQueueEntry {
        queue_name: "bus".to_string(),
        payload_type: "TestEvent".to_string(),
        payload: r#"{"id":2}"#.to_string(),
        user_token: None,
        future_user_token: None,
        search_key1: 2,
        search_key2: TEST_SEARCH_KEY2,
        created_date: old,
        creating_owner: creating_owner.to_string(),
        processing_state: ProcessingState::Available.as_str().to_string(),
        processing_owner: None,
        processing_available_date: None,
        error_count: 0,
        effective_date: old,
    }
}

#[tokio::test]
#[serial]
async fn test_reap_leaves_own_stuck_entry_alone() {
    let (_db, dal) = prepared_dal().await;
    let record_id = dal
        .queue_entries()
        .insert_entry(stale_claimed_entry("node-a", "node-a"))
        .await
        .expect("insert");

    let now = Utc::now().naive_utc();
    let summary = dal
        .queue_entries()
        .reap_entries(
            "node-a".to_string(),
            now,
            now - chrono::Duration::minutes(10),
            100,
        )
        .await
        .expect("reap");

    // Reaped by its own presumed owner: warned about, never recycled.
    assert_eq!(summary.stuck, vec![record_id]);
    assert!(summary.reaped.is_empty());
    assert!(summary.reinserted.is_empty());

    let live = live_entries(&dal, "bus").await;
    assert_eq!(live.len(), 1);
    assert_eq!(live[0].record_id, record_id);
    assert!(history_entries(&dal, "bus").await.is_empty());
}

#[tokio::test]
#[serial]
async fn test_reap_reports_late_entries_without_recycling() {
    let (_db, dal) = prepared_dal().await;
    let record_id = dal
        .queue_entries()
        .insert_entry(stale_unclaimed_entry("node-a"))
        .await
        .expect("insert");

    let now = Utc::now().naive_utc();
    let summary = dal
        .queue_entries()
        .reap_entries(
            "node-a".to_string(),
            now,
            now - chrono::Duration::minutes(10),
            100,
        )
        .await
        .expect("reap");

    assert_eq!(summary.late, vec![record_id]);
    assert!(summary.reaped.is_empty());
    assert_eq!(live_entries(&dal, "bus").await.len(), 1);
}

#[tokio::test]
#[serial]
async fn test_reap_recycles_orphaned_entry_exactly_once() {
    let (_db, dal) = prepared_dal().await;
    let record_id = dal
        .queue_entries()
        .insert_entry(stale_claimed_entry("node-dead", "node-dead"))
        .await
        .expect("insert");

    let now = Utc::now().naive_utc();
    let summary = dal
        .queue_entries()
        .reap_entries(
            "node-b".to_string(),
            now,
            now - chrono::Duration::minutes(10),
            100,
        )
        .await
        .expect("reap");

    assert_eq!(summary.reaped, vec![record_id]);
    assert_eq!(summary.reinserted.len(), 1);
    let new_id = summary.reinserted[0];
    assert_ne!(new_id, record_id);

    // The original is terminal in history as REAPED...
    let history = history_entries(&dal, "bus").await;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].record_id, record_id);
    assert_eq!(history[0].state(), Some(ProcessingState::Reaped));

    // ... and exactly one fresh AVAILABLE clone exists, owned by the
    // reaping node, with the payload and error count carried over.
    let live = live_entries(&dal, "bus").await;
    assert_eq!(live.len(), 1);
    assert_eq!(live[0].record_id, new_id);
    assert_eq!(live[0].state(), Some(ProcessingState::Available));
    assert_eq!(live[0].creating_owner, "node-b");
    assert!(live[0].processing_owner.is_none());
    assert_eq!(live[0].payload, r#"{"id":1}"#);
    assert_eq!(live[0].error_count, 2);

    // A second cycle has nothing orphaned left: the clone is too fresh.
    let summary = dal
        .queue_entries()
        .reap_entries(
            "node-b".to_string(),
            now,
            now - chrono::Duration::minutes(10),
            100,
        )
        .await
        .expect("reap");
    assert!(summary.reaped.is_empty());
    assert_eq!(live_entries(&dal, "bus").await.len(), 1);
}

#[tokio::test]
#[serial]
async fn test_reap_respects_live_leases() {
    let (_db, dal) = prepared_dal().await;
    let now = Utc::now().naive_utc();

    // Old entry, but its lease is still in the future: not a candidate.
    let mut entry = stale_claimed_entry("node-dead", "node-dead");
    entry.processing_available_date = Some(now + chrono::Duration::minutes(5));
    dal.queue_entries()
        .insert_entry(entry)
        .await
        .expect("insert");

    let summary = dal
        .queue_entries()
        .reap_entries(
            "node-b".to_string(),
            now,
            now - chrono::Duration::minutes(10),
            100,
        )
        .await
        .expect("reap");

    assert!(summary.is_empty());
    assert_eq!(live_entries(&dal, "bus").await.len(), 1);
}
