// Copyright (C) 2025 Michael Herstine <sp1ff@pobox.com>
//
// This file is part of fanline.
//
// fanline is free software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// fanline is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without
// even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with fanline.  If not,
// see <http://www.gnu.org/licenses/>.

//! # The distribution ledger
//!
//! ## Introduction
//!
//! Before the distributor writes a single timeline entry, it records that a fan-out has *started*;
//! after the last batch lands, it rewrites the record as *completed*. Should the process die in
//! between, the record is the only evidence the work existed, and the recovery scanner uses it to
//! finish the job. State transitions are monotone toward `completed`, which is what makes it safe
//! for recovery to run concurrently with a slow-but-alive distribution.
//!
//! ## Finding stuck records
//!
//! The obvious (and original) implementation-- prefix-scanning the key space for status records--
//! is O(keyspace) per recovery cycle. Instead the ledger maintains an explicit pending index (a
//! sorted set scored by `started_at`); [scan_pending](Backend::scan_pending) is then O(pending),
//! and completing a record removes it from the index in the same breath.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use snafu::Backtrace;

use crate::entities::{PostId, UserId};

/// Opaque ledger error; implementations surface their native errors through this
#[derive(Debug)]
pub struct Error {
    source: Box<dyn std::error::Error + Send + Sync + 'static>,
    #[allow(dead_code)] // captured for Debug output
    backtrace: Backtrace,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.source)
    }
}

impl std::error::Error for Error {}

impl Error {
    pub fn new(err: impl std::error::Error + Send + Sync + 'static) -> Error {
        Error {
            source: Box::new(err),
            backtrace: Backtrace::capture(),
        }
    }
}

type Result<T> = std::result::Result<T, Error>;

/// Where a fan-out stands
///
/// The two `Started*` variants record which *mode* the distributor chose, because recovery must
/// re-select the same follower set.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    /// Push-to-all fan-out begun (author at or below the push threshold)
    StartedPushSmall,
    /// Push-to-active fan-out begun (influencer)
    StartedPushInfluencer,
    Completed,
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Status::StartedPushSmall => "started_push_small",
                Status::StartedPushInfluencer => "started_push_influencer",
                Status::Completed => "completed",
            }
        )
    }
}

/// One fan-out's ledger entry, keyed by `post_id`
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Record {
    pub post_id: PostId,
    pub author_id: UserId,
    pub status: Status,
    pub started_at: DateTime<Utc>,
}

/// Counts surfaced by `get_distribution_stats()`
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct Stats {
    /// Started, within the recovery timeout
    pub pending: u64,
    pub completed: u64,
    /// Started, *beyond* the recovery timeout-- recovery will pick these up
    pub stuck: u64,
}

#[async_trait]
pub trait Backend {
    /// Insert or overwrite the record for `record.post_id`, retained for `ttl`. A non-completed
    /// record also lands in the pending index.
    async fn put(&self, record: &Record, ttl: std::time::Duration) -> Result<()>;
    async fn get(&self, post: PostId) -> Result<Option<Record>>;
    /// Transition `post`'s record to [Status::Completed] (stamping `at`) & drop it from the
    /// pending index. A no-op if the record has vanished.
    async fn complete(&self, post: PostId, at: DateTime<Utc>, ttl: std::time::Duration)
        -> Result<()>;
    /// Drop the record entirely (post tombstoned or author gone)
    async fn delete(&self, post: PostId) -> Result<()>;
    /// Records still not completed whose `started_at` is on or before `older_than`, oldest first,
    /// at most `limit`
    async fn scan_pending(&self, older_than: DateTime<Utc>, limit: usize) -> Result<Vec<Record>>;
    /// Tallies over the currently-retained records
    async fn stats(&self, now: DateTime<Utc>, timeout: chrono::Duration) -> Result<Stats>;
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn status_wire_form() {
        assert_eq!(
            serde_json::to_string(&Status::StartedPushInfluencer).unwrap(),
            "\"started_push_influencer\""
        );
        assert_eq!(
            serde_json::from_str::<Status>("\"completed\"").unwrap(),
            Status::Completed
        );
        assert_eq!(format!("{}", Status::StartedPushSmall), "started_push_small");
    }
}
