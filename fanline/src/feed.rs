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

//! # The feed service
//!
//! ## Introduction
//!
//! The operations fanline exposes to the outside world: publish a post (create + fan-out
//! kickoff), delete a post, read a feed page, record an activity signal. The API transport
//! wrapping these (HTTP, RPC, whatever) is somebody else's department; these functions *are* the
//! contract.
//!
//! ## The read path
//!
//! `get_feed` is where the hybrid pays off. The happy path is two cheap steps: a sorted-set range
//! off the viewer's timeline, then a batched hydration from the post store (dropping tombstones
//! on the way out). Only when the timeline comes back empty-- expired, never built, or the
//! viewer sits in an influencer's un-pushed majority-- does the read fall through to pull-mode
//! assembly, which also schedules the cache rebuild that makes the *next* read cheap. A degraded
//! timeline store takes the same fall-through: reads keep working off the post store alone.

use std::{collections::HashMap, sync::Arc};

use chrono::{DateTime, Utc};
use serde::Serialize;
use snafu::prelude::*;
use tracing::{debug, info, warn};

use crate::{
    activity::{self, Tracker},
    assembler::{self, Assembler},
    counter_add,
    distributor::{post_score, Distributor},
    entities::{self, ActivityKind, Post, PostId, UserId},
    events::{Envelope, PostCreated, PostDeleted, Producer, POST_CREATED, POST_DELETED},
    metrics::{Instruments, Registration, Sort},
    storage::{self, Posts, Users},
    timeline::{self, paginate, Cursor},
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("{text:?} is not a valid cursor"))]
    BadCursor { text: String },
    #[snafu(display("Invalid post content: {source}"))]
    Content { source: entities::Error },
    #[snafu(display("Pull-mode assembly failed: {source}"))]
    Assembly { source: assembler::Error },
    #[snafu(display("{user} may not delete {post}"))]
    PermissionDenied { user: UserId, post: PostId },
    #[snafu(display("No post {post}"))]
    PostNotFound { post: PostId },
    #[snafu(display("Post store error: {source}"))]
    PostStore { source: storage::Error },
    #[snafu(display("No user {user}"))]
    UnknownUser { user: UserId },
    #[snafu(display("Failed to record activity: {source}"))]
    Activity { source: activity::Error },
    #[snafu(display("User store error: {source}"))]
    UserStore { source: storage::Error },
}

type Result<T> = std::result::Result<T, Error>;

/// Hard ceiling on a feed page; callers asking for more get this much
pub const MAX_PAGE_SIZE: usize = 100;

/// What a caller gets when they ask for nothing in particular
pub const DEFAULT_PAGE_SIZE: usize = 20;

inventory::submit! { Registration::new("feed.publishes", Sort::IntegralCounter) }
inventory::submit! { Registration::new("feed.deletes", Sort::IntegralCounter) }
inventory::submit! { Registration::new("feed.reads.cached", Sort::IntegralCounter) }
inventory::submit! { Registration::new("feed.reads.pulled", Sort::IntegralCounter) }

/// A feed page as handed to external callers; the cursor is already in its opaque wire form
#[derive(Clone, Debug, Serialize)]
pub struct FeedResponse {
    pub posts: Vec<Post>,
    pub next_cursor: Option<String>,
    pub has_more: bool,
}

impl FeedResponse {
    fn from_page(page: timeline::Page<Post>) -> FeedResponse {
        FeedResponse {
            next_cursor: page.next_cursor.map(|c| c.encode()),
            has_more: page.has_more,
            posts: page.items,
        }
    }
}

pub struct Feed {
    posts: Arc<dyn Posts + Send + Sync>,
    users: Arc<dyn Users + Send + Sync>,
    timelines: Arc<dyn timeline::Backend + Send + Sync>,
    distributor: Arc<Distributor>,
    assembler: Arc<Assembler>,
    activity: Arc<Tracker>,
    producer: Arc<dyn Producer + Send + Sync>,
    instruments: Arc<Instruments>,
}

impl Feed {
    #[allow(clippy::too_many_arguments)] // it's the composition root's problem, once
    pub fn new(
        posts: Arc<dyn Posts + Send + Sync>,
        users: Arc<dyn Users + Send + Sync>,
        timelines: Arc<dyn timeline::Backend + Send + Sync>,
        distributor: Arc<Distributor>,
        assembler: Arc<Assembler>,
        activity: Arc<Tracker>,
        producer: Arc<dyn Producer + Send + Sync>,
        instruments: Arc<Instruments>,
    ) -> Feed {
        Feed {
            posts,
            users,
            timelines,
            distributor,
            assembler,
            activity,
            producer,
            instruments,
        }
    }

    /// Publish a post: validate, persist, score & kick off the fan-out
    ///
    /// The post is the caller's the moment the post store accepts it. Everything after--
    /// fan-out, events-- is masked per the propagation policy: a half-delivered post is a
    /// recoverable condition (the ledger + recovery see to it), a lost post is not.
    pub async fn publish(
        &self,
        author_id: UserId,
        body: &str,
        image_refs: Vec<String>,
    ) -> Result<Post> {
        let now = Utc::now();
        self.record_activity_soft(author_id, ActivityKind::Publish, now).await;
        let author = self
            .users
            .get(author_id)
            .await
            .context(UserStoreSnafu)?
            .context(UnknownUserSnafu { user: author_id })?;
        let mut post = Post::new(author_id, body, image_refs, now).context(ContentSnafu)?;
        post.score = post_score(&post, &author, now);
        self.posts.create(&post).await.context(PostStoreSnafu)?;

        if let Err(err) = self.distributor.distribute(&post, &author, now).await {
            // The post is durable & self-visible; delivery catches up via recovery or pull-mode
            warn!("Fan-out of {} deferred to recovery: {}", post.id, err);
        }
        self.announce_created(&post).await;
        counter_add!(self.instruments, "feed.publishes", 1, &[]);
        info!("{} published {}", author_id, post.id);
        Ok(post)
    }

    /// Tombstone a post. Only its author may.
    pub async fn delete_post(&self, viewer: UserId, post: PostId) -> Result<()> {
        let fetched = self
            .posts
            .get(post)
            .await
            .context(PostStoreSnafu)?
            .filter(|p| !p.is_deleted)
            .context(PostNotFoundSnafu { post })?;
        ensure!(
            fetched.author_id == viewer,
            PermissionDeniedSnafu { user: viewer, post }
        );
        self.posts.soft_delete(post).await.context(PostStoreSnafu)?;
        // The consumer purges recorded receivers; readers are already safe behind the tombstone
        // filter either way
        self.announce_deleted(post, viewer).await;
        counter_add!(self.instruments, "feed.deletes", 1, &[]);
        info!("{} deleted {}", viewer, post);
        Ok(())
    }

    /// Read a page of `viewer`'s feed
    ///
    /// `cursor` is the opaque string from the previous page's `next_cursor` (absent for the
    /// first page); `limit` is clamped to [MAX_PAGE_SIZE].
    pub async fn get_feed(
        &self,
        viewer: UserId,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<FeedResponse> {
        let now = Utc::now();
        self.record_activity_soft(viewer, ActivityKind::ViewFeed, now).await;
        let limit = match limit {
            0 => DEFAULT_PAGE_SIZE,
            n => n.min(MAX_PAGE_SIZE),
        };
        let parsed = cursor
            .map(|text| {
                Cursor::decode(text).context(BadCursorSnafu {
                    text: text.to_owned(),
                })
            })
            .transpose()?;

        let entries = match self
            .timelines
            .range_before(viewer, parsed.unwrap_or_else(|| Cursor::latest(now)), limit)
            .await
        {
            Ok(entries) => entries,
            Err(err) => {
                // A degraded timeline store must not take reads down; aggregate from source
                warn!("Timeline read for {} failed ({}); going to pull-mode", viewer, err);
                Vec::new()
            }
        };
        if entries.is_empty() {
            counter_add!(self.instruments, "feed.reads.pulled", 1, &[]);
            let page = self
                .assembler
                .assemble(viewer, parsed, limit, now)
                .await
                .context(AssemblySnafu)?;
            return Ok(FeedResponse::from_page(page));
        }

        let page = paginate(entries, limit, |e| e.score);
        let ids: Vec<PostId> = page.items.iter().map(|e| e.post).collect();
        let hydrated = self.posts.get_many(&ids).await.context(PostStoreSnafu)?;
        let by_id: HashMap<PostId, Post> =
            hydrated.into_iter().map(|post| (post.id, post)).collect();
        // Timeline order governs; tombstones & dangling references drop out here
        let posts: Vec<Post> = page
            .items
            .iter()
            .filter_map(|entry| by_id.get(&entry.post))
            .filter(|post| !post.is_deleted)
            .cloned()
            .collect();
        counter_add!(self.instruments, "feed.reads.cached", 1, &[]);
        debug!(
            "Served {} a cached feed page of {} posts",
            viewer,
            posts.len()
        );
        Ok(FeedResponse {
            posts,
            next_cursor: page.next_cursor.map(|c| c.encode()),
            has_more: page.has_more,
        })
    }

    /// An author's own posts (profile pages & the like)
    pub async fn get_user_posts(
        &self,
        author: UserId,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Post>> {
        self.posts
            .list_by_author(author, offset, limit.min(MAX_PAGE_SIZE).max(1))
            .await
            .context(PostStoreSnafu)
    }

    /// Record an out-of-band activity signal (login & friends; the feed ops record their own)
    pub async fn record_activity(&self, user: UserId, kind: ActivityKind) -> Result<f64> {
        self.activity
            .record(user, kind, Utc::now())
            .await
            .context(ActivitySnafu)
    }

    // The feed must never fail because the activity tracker hiccupped
    async fn record_activity_soft(&self, user: UserId, kind: ActivityKind, now: DateTime<Utc>) {
        if let Err(err) = self.activity.record(user, kind, now).await {
            debug!("Couldn't record {} for {}: {}", kind, user, err);
        }
    }

    async fn announce_created(&self, post: &Post) {
        let payload = PostCreated {
            post_id: post.id,
            user_id: post.author_id,
            content: post.body.to_string(),
            created_at: post.created_at,
        };
        match Envelope::new(POST_CREATED, post.created_at, &payload) {
            Ok(envelope) => {
                if let Err(err) = self
                    .producer
                    .publish(&post.author_id.to_raw_string(), &envelope)
                    .await
                {
                    warn!("Couldn't publish post_created for {}: {}", post.id, err);
                }
            }
            Err(err) => warn!("Couldn't encode post_created for {}: {}", post.id, err),
        }
    }

    async fn announce_deleted(&self, post: PostId, author: UserId) {
        let payload = PostDeleted {
            post_id: post,
            user_id: author,
        };
        match Envelope::new(POST_DELETED, Utc::now(), &payload) {
            Ok(envelope) => {
                if let Err(err) = self
                    .producer
                    .publish(&author.to_raw_string(), &envelope)
                    .await
                {
                    warn!("Couldn't publish post_deleted for {}: {}", post, err);
                }
            }
            Err(err) => warn!("Couldn't encode post_deleted for {}: {}", post, err),
        }
    }

}
