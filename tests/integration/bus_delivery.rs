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

//! End-to-end bus delivery: post, dispatch, terminal archiving, in-place
//! retries and the explicit transaction context.

use serial_test::serial;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use conveyor::{
    PersistentBus, ProcessingState, QueueConfig, QueueError, QueueMode, BUS_QUEUE_NAME, DAL,
};

use crate::fixtures::*;

#[tokio::test]
#[serial]
async fn test_post_and_process_polling() {
    let db = test_database();
    let dal = DAL::new(db.database.clone());
    let bus = PersistentBus::new(db.database.clone(), fast_config(QueueMode::Polling));

    let handler = ScriptedHandler::succeeding();
    bus.register_handler("TestEvent", handler.clone());
    assert!(bus.start_queue().await.expect("start"));
    assert!(bus.is_started());

    bus.post(&TestEvent { id: 1 }).await;

    assert!(wait_until(Duration::from_secs(10), || handler.calls() >= 1).await);
    let history = wait_for_history(&dal, BUS_QUEUE_NAME, 1, Duration::from_secs(10)).await;
    assert_eq!(history[0].state(), Some(ProcessingState::Processed));
    assert_eq!(history[0].error_count, 0);
    assert!(live_entries(&dal, BUS_QUEUE_NAME).await.is_empty());

    assert_eq!(bus.metrics().processed(), 1);
    bus.stop_queue().await;
    assert!(!bus.is_started());
}

#[tokio::test]
#[serial]
async fn test_exactly_once_completion() {
    let db = test_database();
    let dal = DAL::new(db.database.clone());
    let bus = PersistentBus::new(db.database.clone(), fast_config(QueueMode::Polling));

    let handler = ScriptedHandler::succeeding();
    bus.register_handler("TestEvent", handler.clone());
    bus.start_queue().await.expect("start");

    for id in 0..20 {
        bus.post(&TestEvent { id }).await;
    }

    let history = wait_for_history(&dal, BUS_QUEUE_NAME, 20, Duration::from_secs(15)).await;

    // Exactly one terminal row per record id, and no live copy remains.
    let distinct: HashSet<i64> = history.iter().map(|row| row.record_id).collect();
    assert_eq!(distinct.len(), 20);
    assert!(history
        .iter()
        .all(|row| row.state() == Some(ProcessingState::Processed)));
    assert!(live_entries(&dal, BUS_QUEUE_NAME).await.is_empty());

    bus.stop_queue().await;
}

/// POLLING mode, max retries 2, handler always raising a transient
/// failure: the entry passes through AVAILABLE with error counts 1 and 2,
/// then lands in history as FAILED with error_count 2 after the third
/// attempt.
#[tokio::test]
#[serial]
async fn test_transient_failures_exhaust_into_failed() {
    let db = test_database();
    let dal = DAL::new(db.database.clone());
    let config = QueueConfig::builder()
        .queue_mode(QueueMode::Polling)
        .polling_sleep(Duration::from_millis(20))
        .max_failure_retries(2)
        .build();
    let bus = PersistentBus::new(db.database.clone(), config);

    let handler = ScriptedHandler::always_transient();
    bus.register_handler("TestEvent", handler.clone());
    bus.start_queue().await.expect("start");

    bus.post(&TestEvent { id: 5 }).await;

    let history = wait_for_history(&dal, BUS_QUEUE_NAME, 1, Duration::from_secs(15)).await;
    assert_eq!(history[0].state(), Some(ProcessingState::Failed));
    assert_eq!(history[0].error_count, 2);
    assert_eq!(handler.calls(), 3);
    assert!(live_entries(&dal, BUS_QUEUE_NAME).await.is_empty());

    assert_eq!(bus.metrics().retried(), 2);
    assert_eq!(bus.metrics().failed(), 1);
    bus.stop_queue().await;
}

#[tokio::test]
#[serial]
async fn test_post_on_uninitialized_bus_is_dropped() {
    let db = test_database();
    let dal = DAL::new(db.database.clone());
    let bus = PersistentBus::new(db.database.clone(), fast_config(QueueMode::Polling));

    // Not initialized: the post is refused (and logged), nothing written.
    bus.post(&TestEvent { id: 1 }).await;

    bus.init_queue().await.expect("init");
    assert!(live_entries(&dal, BUS_QUEUE_NAME).await.is_empty());
}

#[tokio::test]
#[serial]
async fn test_in_transaction_commit_and_rollback() {
    let db = test_database();
    let dal = DAL::new(db.database.clone());
    let bus = Arc::new(PersistentBus::new(
        db.database.clone(),
        fast_config(QueueMode::Polling),
    ));
    bus.init_queue().await.expect("init");

    // Commit path: the posted event is visible to in-transaction queries
    // and durable afterwards.
    let posting_bus = bus.clone();
    bus.in_transaction(move |txn| {
        posting_bus.post_in_transaction(&TestEvent { id: 7 }, txn)?;
        let visible =
            posting_bus.available_events_from_transaction_for_search_keys(txn, 7, TEST_SEARCH_KEY2)?;
        assert_eq!(visible.len(), 1);
        Ok(())
    })
    .await
    .expect("commit");

    let live = live_entries(&dal, BUS_QUEUE_NAME).await;
    assert_eq!(live.len(), 1);
    assert_eq!(live[0].state(), Some(ProcessingState::Available));

    // Rollback path: the closure error aborts the transaction and the
    // second event is never enqueued.
    let posting_bus = bus.clone();
    let result: Result<(), QueueError> = bus
        .in_transaction(move |txn| {
            posting_bus.post_in_transaction(&TestEvent { id: 8 }, txn)?;
            Err(QueueError::Configuration {
                message: "abort".to_string(),
            })
        })
        .await;
    assert!(result.is_err());
    assert_eq!(live_entries(&dal, BUS_QUEUE_NAME).await.len(), 1);
}

#[tokio::test]
#[serial]
async fn test_query_surface_by_search_keys() {
    let db = test_database();
    let bus = PersistentBus::new(db.database.clone(), fast_config(QueueMode::Polling));
    bus.init_queue().await.expect("init");

    bus.post(&TestEvent { id: 41 }).await;
    bus.post(&TestEvent { id: 42 }).await;

    let events = bus
        .available_events_for_search_keys(41, TEST_SEARCH_KEY2)
        .await
        .expect("query");
    assert_eq!(events.len(), 1);
    let decoded: TestEvent = events[0].decode().expect("decode");
    assert_eq!(decoded.id, 41);

    let both = bus
        .available_events_for_search_key2(chrono::Utc::now().naive_utc(), TEST_SEARCH_KEY2)
        .await
        .expect("query");
    assert_eq!(both.len(), 2);

    let backlog = bus
        .nb_ready_entries(chrono::Utc::now().naive_utc())
        .await
        .expect("count");
    assert_eq!(backlog, 2);

    assert!(bus.in_processing_events().await.expect("query").is_empty());
}
