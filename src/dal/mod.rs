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

//! Unified Data Access Layer with runtime backend selection.
//!
//! The [`DAL`] works with both PostgreSQL and SQLite, selecting the
//! implementation at runtime from the connection type. Query logic lives in
//! synchronous helpers over [`AnyConn`] (shared between pooled access and
//! the explicit transaction context); the async entry points check out a
//! pooled connection for the detected backend and run the helper on it.

use crate::database::{BackendType, Database};

pub mod ops;
pub mod queue_entry;
pub mod transaction;

pub use ops::{HistoricalSearch, LiveSearch};
pub use queue_entry::QueueEntryDAL;
pub use transaction::QueueTransaction;

/// Helper macro for dispatching operations based on backend type.
///
/// # Example
///
/// ```rust,ignore
/// dispatch_backend!(dal.backend(), {
///     // PostgreSQL implementation
/// }, {
///     // SQLite implementation
/// })
/// ```
#[macro_export]
macro_rules! dispatch_backend {
    ($backend:expr, $pg_block:block, $sqlite_block:block) => {
        match $backend {
            #[cfg(feature = "postgres")]
            $crate::database::BackendType::Postgres => $pg_block,
            #[cfg(feature = "sqlite")]
            $crate::database::BackendType::Sqlite => $sqlite_block,
        }
    };
}

/// Helper macro for matching on [`AnyConn`] variants.
///
/// The two-block form takes backend-specific implementations; the one-block
/// form compiles the same tokens once per backend, for queries expressible
/// identically on both.
///
/// # Example
///
/// ```rust,ignore
/// connection_match!(conn, pg_conn => {
///     // PostgreSQL-only SQL (e.g. FOR UPDATE SKIP LOCKED)
/// }, sqlite_conn => {
///     // SQLite rendition
/// });
///
/// connection_match!(conn, c => {
///     queue_entries::table.load(c)
/// });
/// ```
#[macro_export]
macro_rules! connection_match {
    ($conn:expr, $pg_var:ident => $pg_block:block, $sqlite_var:ident => $sqlite_block:block) => {
        match $conn {
            #[cfg(feature = "postgres")]
            $crate::dal::AnyConn::Postgres($pg_var) => $pg_block,
            #[cfg(feature = "sqlite")]
            $crate::dal::AnyConn::Sqlite($sqlite_var) => $sqlite_block,
        }
    };
    ($conn:expr, $var:ident => $block:block) => {
        match $conn {
            #[cfg(feature = "postgres")]
            $crate::dal::AnyConn::Postgres($var) => $block,
            #[cfg(feature = "sqlite")]
            $crate::dal::AnyConn::Sqlite($var) => $block,
        }
    };
}

/// Checks out a pooled connection for the detected backend and runs a
/// synchronous [`ops`] helper on it. Evaluates to the helper's
/// `Result<_, StorageError>`.
macro_rules! run_ops {
    ($dal:expr, $conn:ident => $body:expr) => {
        $crate::dispatch_backend!($dal.backend(), {
            let pooled = $dal
                .database()
                .get_postgres_connection()
                .await
                .map_err(|e| $crate::error::StorageError::ConnectionPool(e.to_string()))?;
            pooled
                .interact(move |raw| {
                    let $conn = $crate::dal::AnyConn::Postgres(raw);
                    $body
                })
                .await
                .map_err(|e| $crate::error::StorageError::ConnectionPool(e.to_string()))?
        }, {
            let pooled = $dal
                .database()
                .get_sqlite_connection()
                .await
                .map_err(|e| $crate::error::StorageError::ConnectionPool(e.to_string()))?;
            pooled
                .interact(move |raw| {
                    let $conn = $crate::dal::AnyConn::Sqlite(raw);
                    $body
                })
                .await
                .map_err(|e| $crate::error::StorageError::ConnectionPool(e.to_string()))?
        })
    };
}

pub(crate) use run_ops;

/// A mutable borrow of a backend-specific connection.
///
/// This is the seam between the async pooled world and the synchronous
/// diesel query helpers: both pooled operations and the explicit
/// [`QueueTransaction`] context wrap their connection in an `AnyConn` and
/// share the same helpers.
pub enum AnyConn<'a> {
    #[cfg(feature = "postgres")]
    Postgres(&'a mut diesel::PgConnection),
    #[cfg(feature = "sqlite")]
    Sqlite(&'a mut diesel::SqliteConnection),
}

impl<'a> AnyConn<'a> {
    /// Reborrows the connection for a nested helper call.
    pub fn reborrow(&mut self) -> AnyConn<'_> {
        match self {
            #[cfg(feature = "postgres")]
            AnyConn::Postgres(c) => AnyConn::Postgres(&mut **c),
            #[cfg(feature = "sqlite")]
            AnyConn::Sqlite(c) => AnyConn::Sqlite(&mut **c),
        }
    }
}

/// Summary of one reaper cycle.
#[derive(Debug, Default, Clone)]
pub struct ReapSummary {
    /// Entries owned by the reaping node with an expired lease (warned,
    /// left alone)
    pub stuck: Vec<i64>,
    /// Entries created by the reaping node and never claimed (warned, left
    /// alone)
    pub late: Vec<i64>,
    /// Record ids moved to history as REAPED
    pub reaped: Vec<i64>,
    /// Record ids of the fresh AVAILABLE clones inserted for reaped entries
    pub reinserted: Vec<i64>,
}

impl ReapSummary {
    /// True when the cycle found nothing at all.
    pub fn is_empty(&self) -> bool {
        self.stuck.is_empty() && self.late.is_empty() && self.reaped.is_empty()
    }
}

/// The unified Data Access Layer.
///
/// `DAL` is `Clone` and can be shared between tasks; each clone references
/// the same underlying connection pool.
#[derive(Clone, Debug)]
pub struct DAL {
    database: Database,
}

impl DAL {
    /// Creates a new unified DAL instance.
    pub fn new(database: Database) -> Self {
        DAL { database }
    }

    /// Returns the backend type for this DAL instance.
    pub fn backend(&self) -> BackendType {
        self.database.backend()
    }

    /// Returns a reference to the underlying database.
    pub fn database(&self) -> &Database {
        &self.database
    }

    /// Returns a queue-entry DAL for entry operations.
    pub fn queue_entries(&self) -> QueueEntryDAL {
        QueueEntryDAL::new(self)
    }
}
