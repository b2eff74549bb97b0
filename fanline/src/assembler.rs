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

//! # The pull-mode assembler
//!
//! ## Introduction
//!
//! The other half of the hybrid. When a reader's timeline is empty-- TTL'd out, never built, or
//! the reader is in an influencer's un-pushed majority-- the feed is assembled the expensive way:
//! read the viewer's followees, query the post store for their recent posts, return the page. The
//! viewer's timeline is then rebuilt *asynchronously* from what was fetched, so the next read is
//! a cheap cache hit; the reader never waits on the rebuild.
//!
//! Pull-mode is also the availability floor: with the timeline store down entirely, every read
//! degrades to this path and the product keeps working (slowly).

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use snafu::prelude::*;
use tracing::{debug, warn};

use crate::{
    activity::Tracker,
    config::Configuration,
    counter_add,
    entities::{Post, UserId},
    metrics::{Instruments, Registration, Sort},
    storage::{self, Follows, Posts},
    timeline::{self, paginate, Cursor, Page, TimelineEntry},
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Failed to list followees: {source}"))]
    Followees { source: storage::Error },
    #[snafu(display("Failed to read posts: {source}"))]
    PostStore { source: storage::Error },
}

type Result<T> = std::result::Result<T, Error>;

inventory::submit! { Registration::new("assembler.pulls", Sort::IntegralCounter) }
inventory::submit! { Registration::new("assembler.rebuilds", Sort::IntegralCounter) }

pub struct Assembler {
    posts: Arc<dyn Posts + Send + Sync>,
    follows: Arc<dyn Follows + Send + Sync>,
    timelines: Arc<dyn timeline::Backend + Send + Sync>,
    activity: Arc<Tracker>,
    config: Arc<Configuration>,
    instruments: Arc<Instruments>,
}

impl Assembler {
    pub fn new(
        posts: Arc<dyn Posts + Send + Sync>,
        follows: Arc<dyn Follows + Send + Sync>,
        timelines: Arc<dyn timeline::Backend + Send + Sync>,
        activity: Arc<Tracker>,
        config: Arc<Configuration>,
        instruments: Arc<Instruments>,
    ) -> Arc<Assembler> {
        Arc::new(Assembler {
            posts,
            follows,
            timelines,
            activity,
            config,
            instruments,
        })
    }

    /// Assemble a feed page for `viewer` straight from the post & follow stores, then kick off an
    /// asynchronous rebuild of their timeline
    pub async fn assemble(
        self: &Arc<Self>,
        viewer: UserId,
        cursor: Option<Cursor>,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Page<Post>> {
        counter_add!(self.instruments, "assembler.pulls", 1, &[]);
        let mut authors = self
            .follows
            .followees(viewer, 0, self.config.timeline.pull_followee_cap)
            .await
            .context(FolloweesSnafu)?;
        // The viewer's own posts belong in their feed too
        authors.push(viewer);

        let before = cursor.map(|c| {
            Utc.timestamp_opt(c.epoch(), 0)
                .single()
                .unwrap_or_else(Utc::now)
        });
        let fetched = self
            .posts
            .list_by_authors(&authors, before, limit + 1)
            .await
            .context(PostStoreSnafu)?;
        let page = paginate(fetched, limit, |post| post.created_epoch());

        // Rebuild off the hot path; the reader has their page already
        if !page.items.is_empty() {
            let assembler = self.clone();
            let materialized = page.items.clone();
            tokio::spawn(async move {
                assembler.rebuild(viewer, &materialized, now).await;
            });
        }
        debug!(
            "Pull-mode assembled {} posts for {} (has_more={})",
            page.items.len(),
            viewer,
            page.has_more
        );
        Ok(page)
    }

    /// Replace `viewer`'s timeline with `posts`, with a TTL fit for their activity class
    ///
    /// Public so that callers with their own scheduling (tests, the prewarm pass) can run it
    /// inline instead of racing a spawned task.
    pub async fn rebuild(&self, viewer: UserId, posts: &[Post], now: DateTime<Utc>) {
        let entries: Vec<TimelineEntry> = posts
            .iter()
            .filter(|post| !post.is_deleted)
            .map(|post| TimelineEntry {
                post: post.id,
                score: post.created_epoch(),
            })
            .collect();
        let ttl = match self.activity.is_active(viewer, now).await {
            Ok(true) => self.config.active.policy().ttl(),
            Ok(false) => self.config.inactive.policy().ttl(),
            Err(err) => {
                // Can't classify? The short lifetime errs on the side of rebuilding again
                warn!("Couldn't classify {} during rebuild: {}", viewer, err);
                self.config.inactive.policy().ttl()
            }
        };
        if let Err(err) = self.timelines.rebuild(viewer, &entries, ttl).await {
            warn!("Couldn't rebuild the timeline of {}: {}", viewer, err);
            return;
        }
        counter_add!(self.instruments, "assembler.rebuilds", 1, &[]);
        debug!("Rebuilt the timeline of {} ({} entries)", viewer, entries.len());
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        entities::{FollowEdge, User},
        memory::{MemoryFollows, MemoryPosts, MemoryTimelines, MemoryUsers},
        storage::{Follows as _, Users as _},
        timeline::Backend as _,
    };

    struct Fixture {
        posts: Arc<MemoryPosts>,
        follows: Arc<MemoryFollows>,
        timelines: Arc<MemoryTimelines>,
        users: Arc<MemoryUsers>,
        assembler: Arc<Assembler>,
    }

    fn fixture() -> Fixture {
        let config = Arc::new(Configuration::default());
        let posts = Arc::new(MemoryPosts::new());
        let follows = Arc::new(MemoryFollows::new());
        let timelines = Arc::new(MemoryTimelines::new());
        let users = Arc::new(MemoryUsers::new());
        let instruments = Arc::new(Instruments::new("fanline"));
        let tracker = Arc::new(Tracker::new(
            users.clone(),
            follows.clone(),
            config.clone(),
            instruments.clone(),
        ));
        let assembler = Assembler::new(
            posts.clone(),
            follows.clone(),
            timelines.clone(),
            tracker,
            config,
            instruments,
        );
        Fixture {
            posts,
            follows,
            timelines,
            users,
            assembler,
        }
    }

    async fn seed_post(fx: &Fixture, author: UserId, body: &str, at: DateTime<Utc>) -> Post {
        use crate::storage::Posts as _;
        let post = Post::new(author, body, vec![], at).unwrap();
        fx.posts.create(&post).await.unwrap();
        post
    }

    #[tokio::test]
    async fn assembles_followee_posts_newest_first() {
        let fx = fixture();
        let now = Utc::now();
        let viewer = UserId::new();
        let followee = UserId::new();
        fx.users.upsert(&User::new(viewer)).await.unwrap();
        fx.follows
            .add_edge(&FollowEdge {
                follower: viewer,
                followee,
                created_at: now,
                is_active: true,
            })
            .await
            .unwrap();
        let old = seed_post(&fx, followee, "old", now - chrono::Duration::hours(2)).await;
        let new = seed_post(&fx, followee, "new", now - chrono::Duration::hours(1)).await;
        let mine = seed_post(&fx, viewer, "mine", now - chrono::Duration::minutes(30)).await;

        let page = fx
            .assembler
            .assemble(viewer, None, 10, now)
            .await
            .unwrap();
        assert_eq!(
            page.items.iter().map(|p| p.id).collect::<Vec<_>>(),
            vec![mine.id, new.id, old.id]
        );
        assert!(!page.has_more);

        // The async rebuild materializes the same entries; run it inline to sidestep the race
        fx.assembler.rebuild(viewer, &page.items, now).await;
        assert_eq!(fx.timelines.size(viewer).await.unwrap(), 3);
        assert!(fx.timelines.contains(viewer, new.id).await.unwrap());
    }

    #[tokio::test]
    async fn tombstones_never_reach_the_rebuilt_timeline() {
        let fx = fixture();
        let now = Utc::now();
        let viewer = UserId::new();
        fx.users.upsert(&User::new(viewer)).await.unwrap();
        let mut dead = seed_post(&fx, viewer, "dead", now - chrono::Duration::hours(1)).await;
        dead.is_deleted = true;
        let live = seed_post(&fx, viewer, "live", now - chrono::Duration::minutes(5)).await;

        fx.assembler.rebuild(viewer, &[dead.clone(), live.clone()], now).await;
        assert!(!fx.timelines.contains(viewer, dead.id).await.unwrap());
        assert!(fx.timelines.contains(viewer, live.id).await.unwrap());
    }

    #[tokio::test]
    async fn pagination_cursor_is_exclusive() {
        let fx = fixture();
        let now = Utc::now();
        let viewer = UserId::new();
        fx.users.upsert(&User::new(viewer)).await.unwrap();
        let mut ids = Vec::new();
        for n in 0..5 {
            let post = seed_post(
                &fx,
                viewer,
                &format!("p{}", n),
                now - chrono::Duration::hours(5 - n),
            )
            .await;
            ids.push(post.id);
        }
        let page1 = fx.assembler.assemble(viewer, None, 2, now).await.unwrap();
        assert!(page1.has_more);
        assert_eq!(
            page1.items.iter().map(|p| p.id).collect::<Vec<_>>(),
            vec![ids[4], ids[3]]
        );
        let page2 = fx
            .assembler
            .assemble(viewer, page1.next_cursor, 2, now)
            .await
            .unwrap();
        assert_eq!(
            page2.items.iter().map(|p| p.id).collect::<Vec<_>>(),
            vec![ids[2], ids[1]]
        );
    }
}
