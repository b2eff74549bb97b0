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

//! # Domain events
//!
//! ## Introduction
//!
//! fanline publishes domain events onto a partitioned, keyed log (Kafka-shaped; the in-memory bus
//! in [memory](crate::memory) implements the same contract for tests & standalone mode). The
//! partition key is the primary actor's id-- author for posts, follower for follows-- so all
//! events for one user arrive in order. Delivery is at-least-once; consumers commit offsets after
//! handling, and handlers are idempotent.
//!
//! ## The envelope
//!
//! Events travel as a JSON envelope `{type, timestamp, data}`. I've deliberately kept `data`
//! loosely typed on the wire ([serde_json::Value]): an unknown `type`, or a known `type` with a
//! malformed payload, must be loggable & skippable rather than poison the partition. Typed
//! payload structs below give the handlers something honest to work with once the `type` is
//! recognized.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use snafu::{prelude::*, Backtrace};

use crate::entities::{CommentId, PostId, UserId};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("The event's payload did not match its type {kind}: {source}"))]
    Payload {
        kind: String,
        source: serde_json::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to serialize an event payload: {source}"))]
    Ser {
        source: serde_json::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Event transport error: {source}"))]
    Transport {
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
        backtrace: Backtrace,
    },
}

impl Error {
    pub fn transport(err: impl std::error::Error + Send + Sync + 'static) -> Error {
        Error::Transport {
            source: Box::new(err),
            backtrace: Backtrace::capture(),
        }
    }
}

type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          event kinds                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

pub const POST_CREATED: &str = "post_created";
pub const POST_DELETED: &str = "post_deleted";
pub const FOLLOW_CREATED: &str = "follow_created";
pub const FOLLOW_DELETED: &str = "follow_deleted";
pub const LIKE_CREATED: &str = "like_created";
pub const LIKE_DELETED: &str = "like_deleted";
pub const COMMENT_CREATED: &str = "comment_created";
pub const DISTRIBUTION_COMPLETED: &str = "post_distribution_completed";
pub const ACTIVITY_UPDATED: &str = "user_activity_updated";

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                         the envelope                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The wire form of every event
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    pub timestamp: DateTime<Utc>,
    pub data: serde_json::Value,
}

impl Envelope {
    pub fn new<T: Serialize>(kind: &str, timestamp: DateTime<Utc>, data: &T) -> Result<Envelope> {
        Ok(Envelope {
            kind: kind.to_owned(),
            timestamp,
            data: serde_json::to_value(data).context(SerSnafu)?,
        })
    }
    /// Interpret the payload as a `T`; fails with [Error::Payload] on mismatch (which the
    /// consumer logs & skips)
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.data.clone()).context(PayloadSnafu {
            kind: self.kind.clone(),
        })
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                        typed payloads                                          //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct PostCreated {
    pub post_id: PostId,
    pub user_id: UserId,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct PostDeleted {
    pub post_id: PostId,
    pub user_id: UserId,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct FollowCreated {
    pub follower_id: UserId,
    pub followee_id: UserId,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct FollowDeleted {
    pub follower_id: UserId,
    pub followee_id: UserId,
}

/// Shared by `like_created` & `like_deleted`
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Like {
    pub user_id: UserId,
    pub post_id: PostId,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct CommentCreated {
    pub comment_id: CommentId,
    pub user_id: UserId,
    pub post_id: PostId,
    pub content: String,
}

/// Internal: emitted by the distributor after the hot-path fan-out lands
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct DistributionCompleted {
    pub post_id: PostId,
    pub author_id: UserId,
    pub pushed_to: usize,
    pub mode: String,
}

/// Internal: emitted when a user's activity score changes materially
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct ActivityUpdated {
    pub user_id: UserId,
    pub activity_score: f64,
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                      producer & consumer                                       //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The write side of the bus
#[async_trait]
pub trait Producer {
    /// Publish `event` under partition key `key`. Events sharing a key land in one partition, in
    /// publish order.
    async fn publish(&self, key: &str, event: &Envelope) -> Result<()>;
}

/// One event as handed to the consumer, carrying enough to commit it
#[derive(Clone, Debug)]
pub struct Delivery {
    pub partition: u32,
    pub offset: u64,
    pub key: String,
    pub event: Envelope,
}

/// The read side of the bus, scoped to a consumer group
#[async_trait]
pub trait Consumer {
    /// Up to `max` deliveries, respecting per-key order: within a partition, a delivery is not
    /// handed out while an earlier uncommitted one from the same poll is outstanding. An empty
    /// vec means nothing is ready.
    async fn poll(&self, max: usize) -> Result<Vec<Delivery>>;
    /// Advance the group's offset past `delivery`. Committing offset N implies all of the
    /// partition's offsets <= N are done-- the usual Kafka contract.
    async fn commit(&self, delivery: &Delivery) -> Result<()>;
}
