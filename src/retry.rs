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

//! Delayed-redelivery scheduling.
//!
//! A handler that wants delayed redelivery (rather than the in-place
//! requeue the dispatcher does for transient failures) returns
//! [`crate::HandlerError::RetryWith`] carrying a [`QueueRetryError`] with an
//! ordered backoff schedule. The [`RetryableHandler`] wrapper catches it,
//! wraps the original serialized event into a [`RetryEvent`] and records it
//! on a dedicated `notifications-retries` queue at `now + schedule[n-1]`;
//! the originating entry is then terminally FAILED. The retries queue's own
//! handler unwraps the payload and re-invokes the original handler;
//! repeated failure consumes the schedule until it runs dry.

use async_trait::async_trait;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{error, warn};
use uuid::Uuid;

use crate::error::{HandlerError, QueueError};
use crate::handler::{EventHandler, QueueEvent, ReadyEvent};
use crate::notification::{NotificationQueue, NotificationQueueService};

/// Service name under which every retries queue is registered.
pub const RETRYABLE_SERVICE_NAME: &str = "notifications-retries";

/// Payload type tag of the wrapper events on a retries queue.
pub const RETRY_EVENT_TYPE: &str = "RetryEvent";

/// A handler's request for delayed redelivery with an ordered backoff
/// schedule, consumed one entry per failed attempt.
#[derive(Debug, Clone, thiserror::Error)]
#[error("Delayed retry requested ({} step schedule)", .retry_schedule.len())]
pub struct QueueRetryError {
    retry_schedule: Vec<Duration>,
}

impl QueueRetryError {
    pub fn new(retry_schedule: Vec<Duration>) -> Self {
        Self { retry_schedule }
    }

    pub fn retry_schedule(&self) -> &[Duration] {
        &self.retry_schedule
    }
}

/// The delay for retry number `retry_nb` (1-based), or `None` once the
/// schedule is exhausted.
fn compute_retry_delay(schedule: &[Duration], retry_nb: i32) -> Option<Duration> {
    if retry_nb < 1 || retry_nb as usize > schedule.len() {
        None
    } else {
        Some(schedule[(retry_nb - 1) as usize])
    }
}

/// Wrapper event stored on the retries queue: the original serialized
/// event plus enough bookkeeping to re-invoke and re-schedule it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryEvent {
    pub original_payload_type: String,
    /// The original event body, kept serialized so redelivery is
    /// byte-faithful
    pub original_event: String,
    pub original_effective_date: NaiveDateTime,
    pub retry_nb: i32,
}

impl QueueEvent for RetryEvent {
    fn event_type(&self) -> &str {
        RETRY_EVENT_TYPE
    }
}

struct RetryableInner {
    queue_service: NotificationQueueService,
    retry_queue: Mutex<Option<NotificationQueue>>,
}

impl RetryableInner {
    /// Schedules retry number `retry_nb` for the given original event and
    /// reports the outcome as the terminal signal for the current dispatch.
    #[allow(clippy::too_many_arguments)]
    async fn schedule_retry(
        &self,
        retry: &QueueRetryError,
        original_payload_type: &str,
        original_event: String,
        original_effective_date: NaiveDateTime,
        user_token: Option<Uuid>,
        search_key1: i64,
        search_key2: i64,
        retry_nb: i32,
    ) -> HandlerError {
        let delay = match compute_retry_delay(retry.retry_schedule(), retry_nb) {
            Some(delay) => delay,
            None => {
                warn!(
                    payload_type = original_payload_type,
                    retry_nb, "Retry schedule exhausted, NOT scheduling another retry"
                );
                return HandlerError::RetryScheduled { scheduled: false };
            }
        };

        let effective_date = chrono::Utc::now().naive_utc()
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());

        let retry_queue = {
            let guard = self.retry_queue.lock().expect("retry queue lock poisoned");
            guard.clone()
        };
        let retry_queue = match retry_queue {
            Some(queue) => queue,
            None => {
                error!("Retry service was never initialized, cannot schedule retry");
                return HandlerError::RetryScheduled { scheduled: false };
            }
        };

        let wrapper = RetryEvent {
            original_payload_type: original_payload_type.to_string(),
            original_event,
            original_effective_date,
            retry_nb,
        };

        match retry_queue
            .record_future_notification(effective_date, &wrapper, user_token, search_key1, search_key2)
            .await
        {
            Ok(()) => {
                warn!(
                    payload_type = original_payload_type,
                    effective_date = %effective_date,
                    retry_nb,
                    "Error processing event, scheduling retry"
                );
                HandlerError::RetryScheduled { scheduled: true }
            }
            Err(e) => {
                error!(
                    payload_type = original_payload_type,
                    "Unable to schedule retry: {}", e
                );
                HandlerError::RetryScheduled { scheduled: false }
            }
        }
    }
}

/// Owns the retries queue for one retrying service.
///
/// `initialize` with the original queue's handler, wrap that handler with
/// [`RetryableHandler`] wherever it is registered, then `start`/`stop`
/// alongside the original queue.
#[derive(Clone)]
pub struct RetryableService {
    inner: Arc<RetryableInner>,
}

impl RetryableService {
    pub fn new(queue_service: NotificationQueueService) -> Self {
        Self {
            inner: Arc::new(RetryableInner {
                queue_service,
                retry_queue: Mutex::new(None),
            }),
        }
    }

    /// Creates the retries queue for `queue_name`, delegating unwrapped
    /// events to `original_handler`.
    pub fn initialize(
        &self,
        queue_name: &str,
        original_handler: Arc<dyn EventHandler>,
    ) -> Result<(), QueueError> {
        let handler = Arc::new(RetryQueueHandler {
            inner: self.inner.clone(),
            delegate: original_handler,
        });
        let queue = self.inner.queue_service.create_notification_queue(
            RETRYABLE_SERVICE_NAME,
            queue_name,
            handler,
        )?;
        *self
            .inner
            .retry_queue
            .lock()
            .expect("retry queue lock poisoned") = Some(queue);
        Ok(())
    }

    /// Starts the retries queue.
    pub async fn start(&self) -> Result<bool, QueueError> {
        let queue = {
            let guard = self
                .inner
                .retry_queue
                .lock()
                .expect("retry queue lock poisoned");
            guard.clone()
        };
        match queue {
            Some(queue) => queue.start_queue().await,
            None => Err(QueueError::Configuration {
                message: "Retry service must be initialized before start".to_string(),
            }),
        }
    }

    /// Stops the retries queue and removes it from the service registry.
    pub async fn stop(&self) -> Result<(), QueueError> {
        let queue = {
            let mut guard = self
                .inner
                .retry_queue
                .lock()
                .expect("retry queue lock poisoned");
            guard.take()
        };
        if let Some(queue) = queue {
            queue.stop_queue().await;
            self.inner
                .queue_service
                .delete_notification_queue(queue.service_name(), queue.queue_name())?;
        }
        Ok(())
    }

    /// Wraps a handler so that its [`crate::HandlerError::RetryWith`]
    /// signals are turned into scheduled redeliveries.
    pub fn retryable_handler(&self, delegate: Arc<dyn EventHandler>) -> Arc<RetryableHandler> {
        Arc::new(RetryableHandler {
            inner: self.inner.clone(),
            delegate,
        })
    }
}

/// Wraps the original handler registered on the original queue: a
/// `RetryWith` outcome schedules retry number 1 and fails the originating
/// entry.
pub struct RetryableHandler {
    inner: Arc<RetryableInner>,
    delegate: Arc<dyn EventHandler>,
}

#[async_trait]
impl EventHandler for RetryableHandler {
    async fn handle(&self, event: ReadyEvent) -> Result<(), HandlerError> {
        let outcome = self.delegate.handle(event.clone()).await;
        match outcome {
            Err(HandlerError::RetryWith(retry)) => {
                let original_event = match serde_json::to_string(&event.payload) {
                    Ok(payload) => payload,
                    Err(e) => {
                        return Err(HandlerError::Fatal(format!(
                            "Unable to re-serialize event for retry: {}",
                            e
                        )))
                    }
                };
                Err(self
                    .inner
                    .schedule_retry(
                        &retry,
                        &event.payload_type,
                        original_event,
                        event.effective_date,
                        event.user_token,
                        event.search_key1,
                        event.search_key2,
                        1,
                    )
                    .await)
            }
            other => other,
        }
    }
}

/// Handler of the retries queue itself: unwraps the [`RetryEvent`],
/// re-invokes the original handler, and re-schedules with `retry_nb + 1`
/// on further `RetryWith` signals.
struct RetryQueueHandler {
    inner: Arc<RetryableInner>,
    delegate: Arc<dyn EventHandler>,
}

#[async_trait]
impl EventHandler for RetryQueueHandler {
    async fn handle(&self, event: ReadyEvent) -> Result<(), HandlerError> {
        if event.payload_type != RETRY_EVENT_TYPE {
            error!(
                payload_type = %event.payload_type,
                "Retry service received an unexpected event type"
            );
            return Err(HandlerError::Fatal(format!(
                "unexpected event type on retries queue: {}",
                event.payload_type
            )));
        }

        let retry_event: RetryEvent = event
            .decode()
            .map_err(|e| HandlerError::Fatal(format!("undecodable retry wrapper: {}", e)))?;
        let original_payload = serde_json::from_str(&retry_event.original_event)
            .map_err(|e| HandlerError::Fatal(format!("undecodable original event: {}", e)))?;

        let ready = ReadyEvent {
            payload_type: retry_event.original_payload_type.clone(),
            payload: original_payload,
            effective_date: retry_event.original_effective_date,
            user_token: event.user_token,
            search_key1: event.search_key1,
            search_key2: event.search_key2,
        };

        match self.delegate.handle(ready).await {
            Err(HandlerError::RetryWith(retry)) => Err(self
                .inner
                .schedule_retry(
                    &retry,
                    &retry_event.original_payload_type,
                    retry_event.original_event.clone(),
                    retry_event.original_effective_date,
                    event.user_token,
                    event.search_key1,
                    event.search_key2,
                    retry_event.retry_nb + 1,
                )
                .await),
            other => other,
        }
    }
}
