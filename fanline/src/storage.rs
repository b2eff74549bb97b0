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

//! # storage
//!
//! Abstractions for the post, follow & user stores.
//!
//! These three stores are external collaborators: fanline reads & writes them through the traits
//! below and takes no position on what's behind them (a relational database, a wide-column store,
//! the in-memory implementations in [memory](crate::memory)). The fan-out core owns none of this
//! data; it owns the *timelines* derived from it.

use crate::entities::{FollowEdge, Post, PostId, User, UserId};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use snafu::Backtrace;

/// Opaque storage error
///
/// Implementations surface their native error types through this; callers mostly just propagate
/// it (or mask it into the distribution ledger-- see the distributor).
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
//                                          post store                                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The post store: authoritative record of posts
#[async_trait]
pub trait Posts {
    /// Persist a freshly-created post
    async fn create(&self, post: &Post) -> Result<()>;
    /// Retrieve a post by id; `None` means no such post
    async fn get(&self, id: PostId) -> Result<Option<Post>>;
    /// Retrieve many posts at once; absent ids are silently omitted and no ordering is implied
    async fn get_many(&self, ids: &[PostId]) -> Result<Vec<Post>>;
    /// An author's own posts, newest first, tombstones excluded
    async fn list_by_author(&self, author: UserId, offset: usize, limit: usize)
        -> Result<Vec<Post>>;
    /// The most recent non-deleted posts by any of `authors` with `created_at` strictly before
    /// `cursor` (no cursor means "from now"), newest first. This is the pull-mode workhorse.
    async fn list_by_authors(
        &self,
        authors: &[UserId],
        cursor: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<Post>>;
    /// Tombstone a post; returns false if there was no such post
    async fn soft_delete(&self, id: PostId) -> Result<bool>;
    /// Atomically bump the engagement counters (deltas may be negative, counters never go below
    /// zero)
    async fn add_counters(&self, id: PostId, likes: i64, comments: i64, shares: i64) -> Result<()>;
    /// Overwrite the ranking score
    async fn update_score(&self, id: PostId, score: f64) -> Result<()>;
    /// Full-text search over post bodies. fanline only carries the seam; relevance is the store's
    /// problem.
    async fn search(&self, query: &str, offset: usize, limit: usize) -> Result<Vec<Post>>;
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                         follow store                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The follow store: directed edges follower -> followee
#[async_trait]
pub trait Follows {
    /// Who follows `user`?
    async fn followers(&self, user: UserId, offset: usize, limit: usize) -> Result<Vec<UserId>>;
    /// Whom does `user` follow?
    async fn followees(&self, user: UserId, offset: usize, limit: usize) -> Result<Vec<UserId>>;
    async fn count_followers(&self, user: UserId) -> Result<i64>;
    async fn count_followees(&self, user: UserId) -> Result<i64>;
    /// Record a follow; returns false (and changes nothing) if the edge already exists
    async fn add_edge(&self, edge: &FollowEdge) -> Result<bool>;
    /// Remove a follow; returns false if there was no such edge
    async fn remove_edge(&self, follower: UserId, followee: UserId) -> Result<bool>;
    async fn exists(&self, follower: UserId, followee: UserId) -> Result<bool>;
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          user store                                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The user store
#[async_trait]
pub trait Users {
    async fn get(&self, id: UserId) -> Result<Option<User>>;
    /// Insert-or-replace the whole row. The activity tracker's read-modify-write goes through
    /// this; a lost concurrent increment is tolerated (the score is advisory).
    async fn upsert(&self, user: &User) -> Result<()>;
    /// Atomic adds on the denormalized counters
    async fn add_follower_count(&self, id: UserId, delta: i64) -> Result<()>;
    async fn add_following_count(&self, id: UserId, delta: i64) -> Result<()>;
}
