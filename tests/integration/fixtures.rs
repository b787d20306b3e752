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

//! Shared test fixtures: throwaway SQLite databases, fast queue
//! configurations, scripted handlers and polling helpers.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use conveyor::{
    Database, EventHandler, HandlerError, HistoricalQueueEntry, HistoricalSearch, LiveSearch,
    ProcessingState, QueueConfig, QueueEntry, QueueEvent, QueueMode, ReadyEvent, DAL,
};

/// A SQLite database living in its own temp directory for the duration of
/// one test.
pub struct TestDb {
    pub database: Database,
    _dir: tempfile::TempDir,
}

pub fn test_database() -> TestDb {
    init_tracing();
    let dir = tempfile::tempdir().expect("create temp dir");
    let path = dir.path().join("queue.db");
    let database = Database::new(path.to_str().expect("utf-8 temp path"), "", 1);
    TestDb {
        database,
        _dir: dir,
    }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// A configuration with short cycles so tests converge quickly.
pub fn fast_config(mode: QueueMode) -> QueueConfig {
    QueueConfig::builder()
        .queue_mode(mode)
        .polling_sleep(Duration::from_millis(20))
        .claim_duration(Duration::from_secs(60))
        .max_entries_claimed(50)
        .max_dispatch_threads(4)
        .build()
}

/// Waits until `predicate` holds, polling every 10 ms, up to `timeout`.
pub async fn wait_until<F>(timeout: Duration, mut predicate: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if predicate() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    predicate()
}

/// The standard test event; `search_key2` is pinned so queries can find
/// everything a test produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestEvent {
    pub id: i64,
}

pub const TEST_SEARCH_KEY2: i64 = 1;

impl QueueEvent for TestEvent {
    fn event_type(&self) -> &str {
        "TestEvent"
    }

    fn search_key1(&self) -> i64 {
        self.id
    }

    fn search_key2(&self) -> i64 {
        TEST_SEARCH_KEY2
    }
}

/// All live (AVAILABLE or IN_PROCESSING) rows for a queue under the
/// standard test search key.
pub async fn live_entries(dal: &DAL, queue_name: &str) -> Vec<QueueEntry> {
    dal.queue_entries()
        .search_live_entries(LiveSearch {
            states: vec![ProcessingState::Available, ProcessingState::InProcessing],
            queue_name: Some(queue_name.to_string()),
            search_key1: None,
            search_key2: TEST_SEARCH_KEY2,
            max_created_date: None,
            effective_after: None,
        })
        .await
        .expect("live search")
}

/// All history rows for a queue under the standard test search key.
pub async fn history_entries(dal: &DAL, queue_name: &str) -> Vec<HistoricalQueueEntry> {
    dal.queue_entries()
        .search_history_entries(HistoricalSearch {
            queue_name: Some(queue_name.to_string()),
            search_key1: None,
            search_key2: TEST_SEARCH_KEY2,
            min_created_date: None,
        })
        .await
        .expect("history search")
}

/// Waits until the queue's history holds exactly `expected` rows, and
/// returns them. Panics on timeout.
pub async fn wait_for_history(
    dal: &DAL,
    queue_name: &str,
    expected: usize,
    timeout: Duration,
) -> Vec<HistoricalQueueEntry> {
    let deadline = Instant::now() + timeout;
    loop {
        let rows = history_entries(dal, queue_name).await;
        if rows.len() == expected {
            return rows;
        }
        if Instant::now() > deadline {
            panic!(
                "timed out waiting for {} history rows on '{}', have {}",
                expected,
                queue_name,
                rows.len()
            );
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

type Script = Box<dyn Fn(usize, &ReadyEvent) -> Result<(), HandlerError> + Send + Sync>;

/// A handler whose outcome is scripted on the (0-based) invocation number.
pub struct ScriptedHandler {
    calls: AtomicUsize,
    script: Script,
}

impl ScriptedHandler {
    pub fn new<F>(script: F) -> Arc<Self>
    where
        F: Fn(usize, &ReadyEvent) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            script: Box::new(script),
        })
    }

    pub fn succeeding() -> Arc<Self> {
        Self::new(|_, _| Ok(()))
    }

    pub fn always_transient() -> Arc<Self> {
        Self::new(|_, _| Err(HandlerError::Transient("scripted failure".to_string())))
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EventHandler for ScriptedHandler {
    async fn handle(&self, event: ReadyEvent) -> Result<(), HandlerError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        (self.script)(n, &event)
    }
}
