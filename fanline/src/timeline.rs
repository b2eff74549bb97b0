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

//! # The timeline store
//!
//! ## Introduction
//!
//! Each user owns a timeline: a set of post references scored by publish time, capped in size,
//! expiring on a TTL set by the owner's class. The backing service is a per-key sorted set (Redis
//! in production, [memory](crate::memory) in tests & standalone mode); this module defines the
//! primitives the rest of the crate consumes.
//!
//! ## Semantics worth stating once
//!
//! Membership is keyed by post id, so insertion is naturally idempotent: re-applying a fan-out
//! leaves the store unchanged. All operations are atomic per owner key; there are no cross-owner
//! transactions, and none are needed-- every writer (distributor, consumer, recovery, sweeps) is
//! idempotent.
//!
//! ## Cursors
//!
//! A cursor is a single monotone integer: the epoch score of the last entry returned. Externally
//! it travels as an opaque string; never leak offset-based paging to clients-- offsets shift under
//! concurrent inserts, epochs don't. [range_before](Backend::range_before) is strictly exclusive
//! on the cursor, which is what makes consecutive pages non-overlapping.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use snafu::Backtrace;

use crate::entities::{PostId, UserId};

/// Opaque timeline-store error; implementations surface their native errors through this
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

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                             Cursor                                             //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A position in a timeline: the epoch score of the last-returned entry
///
/// The first page of a read uses [Cursor::latest], which sits slightly in the future so that an
/// entry scored "now" is still included (the range is exclusive).
#[derive(Clone, Copy, Debug, Deserialize, Eq, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(transparent)]
pub struct Cursor(i64);

impl Cursor {
    pub fn new(epoch: i64) -> Cursor {
        Cursor(epoch)
    }
    /// A cursor from which the first read returns the newest entries
    pub fn latest(now: chrono::DateTime<chrono::Utc>) -> Cursor {
        Cursor(now.timestamp() + 1)
    }
    pub fn epoch(&self) -> i64 {
        self.0
    }
    /// The wire form-- just the decimal epoch, but callers should treat it as opaque
    pub fn encode(&self) -> String {
        format!("{}", self.0)
    }
    /// `None` means the text wasn't one of ours
    pub fn decode(text: &str) -> Option<Cursor> {
        text.parse::<i64>().ok().map(Cursor)
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                         TimelineEntry                                          //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// One element of a timeline: a post reference & its epoch score
///
/// Deliberately *not* a reference to the post itself; holding only the id keeps the store flat and
/// the object graph cycle-free.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct TimelineEntry {
    pub post: PostId,
    pub score: i64,
}

/// A page of some paginated result
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next_cursor: Option<Cursor>,
    pub has_more: bool,
}

impl<T> Page<T> {
    pub fn empty() -> Page<T> {
        Page {
            items: Vec::new(),
            next_cursor: None,
            has_more: false,
        }
    }
}

/// Convert a raw `limit+1` range result into a [Page]
///
/// The store is asked for one entry more than the caller wants; its presence is the `has_more`
/// signal. The next cursor is the score of the last entry actually returned.
pub fn paginate<T, F: Fn(&T) -> i64>(mut items: Vec<T>, limit: usize, score_of: F) -> Page<T> {
    let has_more = items.len() > limit;
    items.truncate(limit);
    let next_cursor = items.last().map(|item| Cursor::new(score_of(item)));
    Page {
        items,
        next_cursor,
        has_more,
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                            Backend                                             //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The sorted-set service behind every timeline
///
/// `cap` & `ttl` ride along on the write operations because the store applies the size-cap
/// eviction and TTL refresh *in the same round-trip* as the insert-- issuing them as separate
/// calls per owner would double (or triple) the wire traffic of a large fan-out.
#[async_trait]
pub trait Backend {
    /// Idempotent insert of `(post, score)` into `owner`'s timeline, evicting beyond `cap` &
    /// refreshing the TTL
    async fn add(
        &self,
        owner: UserId,
        post: PostId,
        score: i64,
        cap: usize,
        ttl: Duration,
    ) -> Result<()>;
    /// The fan-out workhorse: insert `(post, score)` into *every* owner's timeline in a single
    /// pipelined round-trip, with per-owner eviction & TTL refresh
    async fn add_batch(
        &self,
        owners: &[UserId],
        post: PostId,
        score: i64,
        cap: usize,
        ttl: Duration,
    ) -> Result<()>;
    /// Idempotent removal
    async fn remove(&self, owner: UserId, post: PostId) -> Result<()>;
    /// Up to `limit + 1` entries with score strictly less than `cursor`, newest first; feed the
    /// result to [paginate]
    async fn range_before(
        &self,
        owner: UserId,
        cursor: Cursor,
        limit: usize,
    ) -> Result<Vec<TimelineEntry>>;
    async fn size(&self, owner: UserId) -> Result<usize>;
    async fn contains(&self, owner: UserId, post: PostId) -> Result<bool>;
    /// Keep only the newest `keep` entries
    async fn trim(&self, owner: UserId, keep: usize) -> Result<()>;
    /// The score of the oldest resident entry; `None` on an empty timeline
    async fn oldest_score(&self, owner: UserId) -> Result<Option<i64>>;
    /// Drop the timeline entirely
    async fn clear(&self, owner: UserId) -> Result<()>;
    async fn set_ttl(&self, owner: UserId, ttl: Duration) -> Result<()>;
    /// Atomically replace `owner`'s timeline with `entries` (pull-mode rebuild)
    async fn rebuild(&self, owner: UserId, entries: &[TimelineEntry], ttl: Duration) -> Result<()>;
    /// Owners of all currently-resident timelines. Used by the cache sweep; implementations may
    /// return them in any order.
    async fn owners(&self) -> Result<Vec<UserId>>;
    /// Record which owners received `post` during a fan-out slice (the reverse index consulted on
    /// deletion)
    async fn record_receivers(&self, post: PostId, owners: &[UserId], ttl: Duration) -> Result<()>;
    /// Consume the reverse index for `post`, returning the recorded owners
    async fn drain_receivers(&self, post: PostId) -> Result<Vec<UserId>>;
}
