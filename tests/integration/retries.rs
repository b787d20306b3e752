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

//! Schedule-driven delayed redelivery through the retries queue.

use chrono::Utc;
use serial_test::serial;
use std::time::Duration;
use uuid::Uuid;

use conveyor::{
    HandlerError, NotificationQueueService, ProcessingState, QueueMode, QueueRetryError,
    RetryableService, DAL,
};

use crate::fixtures::*;

/// Retry monotonicity: a handler raising a retryable signal every time
/// against a schedule of length 2 yields exactly 2 scheduled retries, then
/// everything is terminally FAILED.
#[tokio::test]
#[serial]
async fn test_retry_schedule_exhaustion() {
    let db = test_database();
    let dal = DAL::new(db.database.clone());
    let service =
        NotificationQueueService::new(db.database.clone(), fast_config(QueueMode::Polling));

    let delegate = ScriptedHandler::new(|_, _| {
        Err(HandlerError::RetryWith(QueueRetryError::new(vec![
            Duration::from_millis(50),
            Duration::from_millis(50),
        ])))
    });

    let retry_service = RetryableService::new(service.clone());
    retry_service
        .initialize("orders", delegate.clone())
        .expect("initialize");
    let wrapped = retry_service.retryable_handler(delegate.clone());
    let original_queue = service
        .create_notification_queue("order-svc", "orders", wrapped)
        .expect("create");

    original_queue.start_queue().await.expect("start");
    retry_service.start().await.expect("start retries");

    original_queue
        .record_future_notification(
            Utc::now().naive_utc() - chrono::Duration::seconds(1),
            &TestEvent { id: 1 },
            Some(Uuid::new_v4()),
            1,
            TEST_SEARCH_KEY2,
        )
        .await
        .expect("record");

    // Initial delivery plus exactly two scheduled retries.
    assert!(wait_until(Duration::from_secs(15), || delegate.calls() == 3).await);
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(delegate.calls(), 3);

    // Each dispatch that scheduled (or failed to schedule) a retry ends
    // FAILED: the original entry and both wrapper entries.
    let original_history =
        wait_for_history(&dal, "order-svc:orders", 1, Duration::from_secs(10)).await;
    assert_eq!(original_history[0].state(), Some(ProcessingState::Failed));

    let retry_history = wait_for_history(
        &dal,
        "notifications-retries:orders",
        2,
        Duration::from_secs(10),
    )
    .await;
    assert!(retry_history
        .iter()
        .all(|row| row.state() == Some(ProcessingState::Failed)));

    assert!(live_entries(&dal, "order-svc:orders").await.is_empty());
    assert!(live_entries(&dal, "notifications-retries:orders")
        .await
        .is_empty());

    retry_service.stop().await.expect("stop retries");
    original_queue.stop_queue().await;
}

#[tokio::test]
#[serial]
async fn test_retry_succeeds_on_second_attempt() {
    let db = test_database();
    let dal = DAL::new(db.database.clone());
    let service =
        NotificationQueueService::new(db.database.clone(), fast_config(QueueMode::Polling));

    // Fail once with a schedule, then succeed on redelivery.
    let delegate = ScriptedHandler::new(|n, _| {
        if n == 0 {
            Err(HandlerError::RetryWith(QueueRetryError::new(vec![
                Duration::from_millis(50),
                Duration::from_millis(50),
            ])))
        } else {
            Ok(())
        }
    });

    let retry_service = RetryableService::new(service.clone());
    retry_service
        .initialize("shipments", delegate.clone())
        .expect("initialize");
    let wrapped = retry_service.retryable_handler(delegate.clone());
    let original_queue = service
        .create_notification_queue("shipping-svc", "shipments", wrapped)
        .expect("create");

    original_queue.start_queue().await.expect("start");
    retry_service.start().await.expect("start retries");

    original_queue
        .record_future_notification(
            Utc::now().naive_utc() - chrono::Duration::seconds(1),
            &TestEvent { id: 2 },
            None,
            2,
            TEST_SEARCH_KEY2,
        )
        .await
        .expect("record");

    assert!(wait_until(Duration::from_secs(15), || delegate.calls() == 2).await);
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(delegate.calls(), 2);

    // The original dispatch failed over to the retries queue; the single
    // wrapper entry completed.
    let original_history =
        wait_for_history(&dal, "shipping-svc:shipments", 1, Duration::from_secs(10)).await;
    assert_eq!(original_history[0].state(), Some(ProcessingState::Failed));

    let retry_history = wait_for_history(
        &dal,
        "notifications-retries:shipments",
        1,
        Duration::from_secs(10),
    )
    .await;
    assert_eq!(retry_history[0].state(), Some(ProcessingState::Processed));

    retry_service.stop().await.expect("stop retries");
    original_queue.stop_queue().await;
}
