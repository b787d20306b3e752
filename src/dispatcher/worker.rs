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

//! Per-entry worker: decode, invoke the handler, classify the outcome into
//! a state transition. Handler failures never escape this function.

use std::sync::Arc;
use tracing::{debug, error, info, Instrument};

use crate::error::HandlerError;
use crate::handler::{HandlerResolver, ReadyEvent};
use crate::metrics::QueueMetrics;
use crate::models::{ProcessingState, QueueEntry};
use crate::storage::QueueStorage;

/// Processes one claimed entry end to end.
pub(crate) async fn run_entry(
    entry: QueueEntry,
    resolver: Arc<dyn HandlerResolver>,
    storage: Arc<dyn QueueStorage>,
    metrics: Arc<QueueMetrics>,
    max_failure_retries: i64,
) {
    let span = tracing::info_span!(
        "queue_entry",
        record_id = entry.record_id,
        queue = %entry.queue_name,
        user_token = tracing::field::Empty,
    );
    if let Some(token) = entry.future_user_token_uuid().or(entry.user_token_uuid()) {
        span.record("user_token", tracing::field::display(token));
    }

    async move {
        let handler = match resolver.resolve(&entry) {
            Some(handler) => handler,
            None => {
                // Taxonomy (c): cannot be delivered, cannot be silently
                // dropped. The claim stays in place for operator attention;
                // the reaper will surface it.
                error!(
                    payload_type = %entry.payload_type,
                    "No handler registered for entry; leaving it claimed"
                );
                return;
            }
        };

        let ready = match ReadyEvent::from_entry(&entry) {
            Ok(ready) => ready,
            Err(e) => {
                error!(
                    payload_type = %entry.payload_type,
                    "Failed to deserialize entry payload, leaving it claimed: {}", e
                );
                return;
            }
        };

        debug!("Starting processing entry");
        let outcome = handler.handle(ready).await;

        match outcome {
            Ok(()) => {
                debug!("Done handling entry");
                metrics.record_processed();
                let error_count = entry.error_count;
                storage
                    .move_entries_to_history(vec![
                        entry.into_history(ProcessingState::Processed, error_count)
                    ])
                    .await;
            }
            Err(HandlerError::RetryScheduled { scheduled }) => {
                // The retry lives on as a separate future notification (or
                // could not be scheduled at all); the originating entry is
                // terminal either way.
                if scheduled {
                    info!("Handler scheduled a delayed retry; marking original entry FAILED");
                } else {
                    error!("Handler exhausted its retry schedule; marking entry FAILED");
                }
                metrics.record_failed();
                let error_count = entry.error_count;
                storage
                    .move_entries_to_history(vec![
                        entry.into_history(ProcessingState::Failed, error_count)
                    ])
                    .await;
            }
            Err(HandlerError::Fatal(reason)) => {
                error!("Fatal dispatch error: {}", reason);
                metrics.record_failed();
                let error_count = entry.error_count;
                storage
                    .move_entries_to_history(vec![
                        entry.into_history(ProcessingState::Failed, error_count)
                    ])
                    .await;
            }
            Err(failure @ (HandlerError::Transient(_) | HandlerError::RetryWith(_))) => {
                let new_error_count = entry.error_count + 1;
                if new_error_count <= max_failure_retries {
                    info!(
                        error_count = new_error_count,
                        "Dispatch error, will attempt a retry: {}", failure
                    );
                    metrics.record_retried();
                    storage.update_on_error(&entry, new_error_count).await;
                } else {
                    error!(
                        error_count = entry.error_count,
                        "Dispatch error and retries exhausted: {}", failure
                    );
                    metrics.record_failed();
                    let error_count = entry.error_count;
                    storage
                        .move_entries_to_history(vec![
                            entry.into_history(ProcessingState::Failed, error_count)
                        ])
                        .await;
                }
            }
        }
    }
    .instrument(span)
    .await
}
