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

//! Diesel schema for the live and history tables.
//!
//! The two tables are column-compatible: moving an entry to history copies
//! the row verbatim, `record_id` included. Only the live table assigns
//! `record_id` (AUTOINCREMENT / BIGSERIAL); history rows keep the id they
//! were born with, which is what makes the exactly-one-terminal-row-per-id
//! property checkable.

diesel::table! {
    queue_entries (record_id) {
        record_id -> BigInt,
        queue_name -> Text,
        payload_type -> Text,
        payload -> Text,
        user_token -> Nullable<Text>,
        future_user_token -> Nullable<Text>,
        search_key1 -> BigInt,
        search_key2 -> BigInt,
        created_date -> Timestamp,
        creating_owner -> Text,
        processing_state -> Text,
        processing_owner -> Nullable<Text>,
        processing_available_date -> Nullable<Timestamp>,
        error_count -> BigInt,
        effective_date -> Timestamp,
    }
}

diesel::table! {
    queue_entries_history (record_id) {
        record_id -> BigInt,
        queue_name -> Text,
        payload_type -> Text,
        payload -> Text,
        user_token -> Nullable<Text>,
        future_user_token -> Nullable<Text>,
        search_key1 -> BigInt,
        search_key2 -> BigInt,
        created_date -> Timestamp,
        creating_owner -> Text,
        processing_state -> Text,
        processing_owner -> Nullable<Text>,
        processing_available_date -> Nullable<Timestamp>,
        error_count -> BigInt,
        effective_date -> Timestamp,
    }
}

diesel::allow_tables_to_appear_in_same_query!(queue_entries, queue_entries_history);
