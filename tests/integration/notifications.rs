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

//! Notification queues: future-dated delivery, cancellation, the
//! reference-counted lifecycle, and per-queue handler routing.

use chrono::Utc;
use serial_test::serial;
use std::time::Duration;
use uuid::Uuid;

use conveyor::{
    NotificationQueueService, ProcessingState, QueueError, QueueMode, DAL,
};

use crate::fixtures::*;

#[tokio::test]
#[serial]
async fn test_future_notification_dispatch() {
    let db = test_database();
    let dal = DAL::new(db.database.clone());
    let service =
        NotificationQueueService::new(db.database.clone(), fast_config(QueueMode::Polling));

    let handler = ScriptedHandler::new(|_, event| {
        assert!(event.user_token.is_some());
        Ok(())
    });
    let queue = service
        .create_notification_queue("billing", "invoices", handler.clone())
        .expect("create");
    assert_eq!(queue.composite_name(), "billing:invoices");
    assert!(queue.start_queue().await.expect("start"));

    let token = Uuid::new_v4();
    // Already effective: dispatched on the next cycle.
    queue
        .record_future_notification(
            Utc::now().naive_utc() - chrono::Duration::seconds(1),
            &TestEvent { id: 10 },
            Some(token),
            10,
            TEST_SEARCH_KEY2,
        )
        .await
        .expect("record");

    assert!(wait_until(Duration::from_secs(10), || handler.calls() >= 1).await);
    let history = wait_for_history(&dal, "billing:invoices", 1, Duration::from_secs(10)).await;
    assert_eq!(history[0].state(), Some(ProcessingState::Processed));
    assert_eq!(
        history[0].future_user_token.as_deref(),
        Some(token.to_string().as_str())
    );

    queue.stop_queue().await;
}

#[tokio::test]
#[serial]
async fn test_future_notification_not_dispatched_early() {
    let db = test_database();
    let dal = DAL::new(db.database.clone());
    let service =
        NotificationQueueService::new(db.database.clone(), fast_config(QueueMode::Polling));

    let handler = ScriptedHandler::succeeding();
    let queue = service
        .create_notification_queue("billing", "reminders", handler.clone())
        .expect("create");
    queue.start_queue().await.expect("start");

    queue
        .record_future_notification(
            Utc::now().naive_utc() + chrono::Duration::hours(1),
            &TestEvent { id: 11 },
            Some(Uuid::new_v4()),
            11,
            TEST_SEARCH_KEY2,
        )
        .await
        .expect("record");

    // It shows up as a pending future notification...
    let pending = queue
        .future_notifications_for_search_keys(11, TEST_SEARCH_KEY2)
        .await
        .expect("query");
    assert_eq!(pending.len(), 1);

    // ... and is not handed to the handler before its effective date.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(handler.calls(), 0);
    assert_eq!(live_entries(&dal, "billing:reminders").await.len(), 1);

    queue.stop_queue().await;
}

#[tokio::test]
#[serial]
async fn test_remove_future_notification() {
    let db = test_database();
    let dal = DAL::new(db.database.clone());
    let service =
        NotificationQueueService::new(db.database.clone(), fast_config(QueueMode::Polling));

    let handler = ScriptedHandler::succeeding();
    let queue = service
        .create_notification_queue("billing", "cancellable", handler.clone())
        .expect("create");
    queue.start_queue().await.expect("start");

    queue
        .record_future_notification(
            Utc::now().naive_utc() + chrono::Duration::hours(1),
            &TestEvent { id: 12 },
            None,
            12,
            TEST_SEARCH_KEY2,
        )
        .await
        .expect("record");

    let pending = queue
        .future_notifications_for_search_keys(12, TEST_SEARCH_KEY2)
        .await
        .expect("query");
    assert_eq!(pending.len(), 1);

    assert!(queue
        .remove_future_notification(pending[0].record_id)
        .await
        .expect("remove"));

    let history = history_entries(&dal, "billing:cancellable").await;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].state(), Some(ProcessingState::Removed));
    assert!(live_entries(&dal, "billing:cancellable").await.is_empty());

    // Removing again finds nothing.
    assert!(!queue
        .remove_future_notification(pending[0].record_id)
        .await
        .expect("remove"));

    queue.stop_queue().await;
}

#[tokio::test]
#[serial]
async fn test_queue_registry_errors() {
    let db = test_database();
    let service =
        NotificationQueueService::new(db.database.clone(), fast_config(QueueMode::Polling));

    let handler = ScriptedHandler::succeeding();
    service
        .create_notification_queue("svc", "q", handler.clone())
        .expect("create");

    match service.create_notification_queue("svc", "q", handler.clone()) {
        Err(QueueError::QueueAlreadyExists { service, queue }) => {
            assert_eq!(service, "svc");
            assert_eq!(queue, "q");
        }
        other => panic!("expected QueueAlreadyExists, got {:?}", other.is_ok()),
    }

    service.delete_notification_queue("svc", "q").expect("delete");
    assert!(matches!(
        service.delete_notification_queue("svc", "q"),
        Err(QueueError::NoSuchQueue { .. })
    ));
}

#[tokio::test]
#[serial]
async fn test_two_queues_route_to_their_own_handlers() {
    let db = test_database();
    let dal = DAL::new(db.database.clone());
    let service =
        NotificationQueueService::new(db.database.clone(), fast_config(QueueMode::Polling));

    let handler_a = ScriptedHandler::succeeding();
    let handler_b = ScriptedHandler::succeeding();
    let queue_a = service
        .create_notification_queue("svc", "a", handler_a.clone())
        .expect("create");
    let queue_b = service
        .create_notification_queue("svc", "b", handler_b.clone())
        .expect("create");

    // First start launches the shared machinery, the second only joins it.
    assert!(queue_a.start_queue().await.expect("start"));
    assert!(!queue_b.start_queue().await.expect("start"));

    let past = Utc::now().naive_utc() - chrono::Duration::seconds(1);
    queue_a
        .record_future_notification(past, &TestEvent { id: 1 }, None, 1, TEST_SEARCH_KEY2)
        .await
        .expect("record");
    queue_b
        .record_future_notification(past, &TestEvent { id: 2 }, None, 2, TEST_SEARCH_KEY2)
        .await
        .expect("record");

    assert!(wait_until(Duration::from_secs(10), || {
        handler_a.calls() >= 1 && handler_b.calls() >= 1
    })
    .await);
    wait_for_history(&dal, "svc:a", 1, Duration::from_secs(10)).await;
    wait_for_history(&dal, "svc:b", 1, Duration::from_secs(10)).await;
    assert_eq!(handler_a.calls(), 1);
    assert_eq!(handler_b.calls(), 1);

    // Stopping one queue keeps the machinery alive for the other.
    queue_a.stop_queue().await;
    assert!(service.is_started());
    queue_b.stop_queue().await;
    assert!(!service.is_started());
}
