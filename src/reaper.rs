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

//! Background reaper.
//!
//! A single periodic task that asks the storage layer to reclassify entries
//! left behind past a staleness threshold. Only entries that some *other*
//! node created or claimed are recycled; this node's own stuck or late
//! entries are only warned about, which is what prevents a live
//! double-dispatch race. It should be rare for the reaper to find anything;
//! its warnings are worth monitoring.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::QueueConfig;
use crate::storage::QueueStorage;

const FIVE_MINUTES: Duration = Duration::from_secs(5 * 60);
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Periodic recovery task for one queue's storage.
pub struct Reaper {
    storage: Arc<dyn QueueStorage>,
    config: Arc<QueueConfig>,
    is_started: AtomicBool,
    handle: Mutex<Option<JoinHandle<()>>>,
    shutdown: Arc<Notify>,
}

impl Reaper {
    pub(crate) fn new(storage: Arc<dyn QueueStorage>, config: Arc<QueueConfig>) -> Self {
        Self {
            storage,
            config,
            is_started: AtomicBool::new(false),
            handle: Mutex::new(None),
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// The effective staleness threshold. A threshold at or below the claim
    /// lease would recycle entries still under an honest claim, so it is
    /// corrected upward with a warning.
    fn reap_threshold(&self) -> Duration {
        let claim = self.config.claim_duration();
        let configured = self.config.reap_threshold();
        if claim >= configured {
            warn!(
                claim_duration_secs = claim.as_secs(),
                reap_threshold_secs = configured.as_secs(),
                "Reap threshold was mis-configured: claim duration exceeds it; \
                 overriding with claim duration + 5 minutes"
            );
            claim + FIVE_MINUTES
        } else {
            configured
        }
    }

    /// Starts the periodic task. Idempotent.
    pub fn start(&self) {
        if self
            .is_started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        let threshold = self.reap_threshold();
        let schedule = self.config.reap_schedule();
        info!(
            threshold_secs = threshold.as_secs(),
            schedule_secs = schedule.as_secs(),
            "Reaper starting"
        );

        let storage = self.storage.clone();
        let shutdown = self.shutdown.clone();
        let threshold =
            chrono::Duration::from_std(threshold).unwrap_or_else(|_| chrono::Duration::minutes(10));

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.notified() => break,
                    _ = tokio::time::sleep(schedule) => {
                        let reaping_date = chrono::Utc::now().naive_utc() - threshold;
                        storage.reap_entries(reaping_date).await;
                    }
                }
            }
        });

        *self.handle.lock().expect("reaper lock poisoned") = Some(handle);
    }

    /// Stops the periodic task with a bounded await. Idempotent.
    pub async fn stop(&self) {
        if self
            .is_started
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        info!("Reaper shutting down");
        self.shutdown.notify_one();

        let handle = self.handle.lock().expect("reaper lock poisoned").take();
        if let Some(mut handle) = handle {
            if tokio::time::timeout(STOP_TIMEOUT, &mut handle).await.is_err() {
                warn!("Reaper did not stop in time, aborting it");
                handle.abort();
            }
        }
    }

    /// Whether the periodic task is currently scheduled.
    pub fn is_started(&self) -> bool {
        self.is_started.load(Ordering::SeqCst)
    }
}
