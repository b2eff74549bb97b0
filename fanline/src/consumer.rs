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

//! # The event consumer
//!
//! ## Introduction
//!
//! The bus carries everything that happens *after* the synchronous publish path: deletions to
//! purge, follows to back-fill, unfollows to scrub, engagement to fold into activity scores. This
//! module translates those events into timeline mutations.
//!
//! Two failure disciplines coexist here, and the distinction matters:
//!
//! - a *malformed* event (unknown type, payload that doesn't match its type) is logged & skipped,
//!   and its offset **is** committed-- replaying garbage yields garbage forever;
//! - a *failed handler* (store unavailable, timeout) is **not** committed, so the event comes
//!   back. Handlers are idempotent precisely so this is safe.
//!
//! Because committing offset N implies everything at or below N is done, a failed delivery also
//! halts this cycle's processing of its partition; later events for the same key must wait.

use std::{collections::HashSet, sync::Arc, time::Duration};

use chrono::Utc;
use snafu::prelude::*;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::{
    activity::{self, Tracker},
    config::Configuration,
    counter_add,
    distributor::post_score,
    entities::{ActivityKind, UserId},
    events::{
        self, CommentCreated, Consumer, Delivery, FollowCreated, FollowDeleted, Like, PostCreated,
        PostDeleted, ACTIVITY_UPDATED, COMMENT_CREATED, DISTRIBUTION_COMPLETED, FOLLOW_CREATED,
        FOLLOW_DELETED, LIKE_CREATED, LIKE_DELETED, POST_CREATED, POST_DELETED,
    },
    metrics::{Instruments, Registration, Sort},
    storage::{self, Posts, Users},
    strategy::Strategy,
    timeline,
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Failed to update activity: {source}"))]
    Activity { source: activity::Error },
    #[snafu(display("Bus error: {source}"))]
    Bus { source: events::Error },
    #[snafu(display("Post store error: {source}"))]
    PostStore { source: storage::Error },
    #[snafu(display("Cache strategy error: {source}"))]
    Strategy { source: crate::strategy::Error },
    #[snafu(display("Timeline store error: {source}"))]
    Timelines { source: timeline::Error },
    #[snafu(display("User store error: {source}"))]
    UserStore { source: storage::Error },
}

type Result<T> = std::result::Result<T, Error>;

// How long to idle when a poll comes back empty
const IDLE_SLEEP: Duration = Duration::from_millis(500);

inventory::submit! { Registration::new("consumer.events.handled", Sort::IntegralCounter) }
inventory::submit! { Registration::new("consumer.events.skipped", Sort::IntegralCounter) }
inventory::submit! { Registration::new("consumer.events.failed", Sort::IntegralCounter) }

/// The handlers behind the consumer loop
pub struct Handlers {
    posts: Arc<dyn Posts + Send + Sync>,
    users: Arc<dyn Users + Send + Sync>,
    timelines: Arc<dyn timeline::Backend + Send + Sync>,
    activity: Arc<Tracker>,
    strategy: Arc<Strategy>,
    config: Arc<Configuration>,
    instruments: Arc<Instruments>,
}

impl Handlers {
    pub fn new(
        posts: Arc<dyn Posts + Send + Sync>,
        users: Arc<dyn Users + Send + Sync>,
        timelines: Arc<dyn timeline::Backend + Send + Sync>,
        activity: Arc<Tracker>,
        strategy: Arc<Strategy>,
        config: Arc<Configuration>,
        instruments: Arc<Instruments>,
    ) -> Handlers {
        Handlers {
            posts,
            users,
            timelines,
            activity,
            strategy,
            config,
            instruments,
        }
    }

    /// Dispatch one event. `Ok(())` means "commit the offset"; that includes events we chose to
    /// skip. `Err` means "leave it for redelivery".
    pub async fn handle(&self, event: &events::Envelope) -> Result<()> {
        match event.kind.as_str() {
            POST_CREATED => self.on_post_created(event).await,
            POST_DELETED => self.on_post_deleted(event).await,
            FOLLOW_CREATED => self.on_follow_created(event).await,
            FOLLOW_DELETED => self.on_follow_deleted(event).await,
            LIKE_CREATED => self.on_like(event, 1).await,
            LIKE_DELETED => self.on_like(event, -1).await,
            COMMENT_CREATED => self.on_comment_created(event).await,
            DISTRIBUTION_COMPLETED | ACTIVITY_UPDATED => {
                // Internal bookkeeping events; useful to observers, nothing to mutate here
                debug!("Observed internal event {}", event.kind);
                Ok(())
            }
            other => {
                // Forward compatibility: somebody newer than us is publishing
                warn!("Skipping unknown event type {:?}", other);
                counter_add!(self.instruments, "consumer.events.skipped", 1, &[]);
                Ok(())
            }
        }
    }

    // Interpret the payload or log-and-skip; the Option dance keeps malformed events out of the
    // retry loop
    fn payload_or_skip<T: serde::de::DeserializeOwned>(
        &self,
        event: &events::Envelope,
    ) -> Option<T> {
        match event.payload::<T>() {
            Ok(payload) => Some(payload),
            Err(err) => {
                warn!("Skipping malformed {} event: {}", event.kind, err);
                counter_add!(self.instruments, "consumer.events.skipped", 1, &[]);
                None
            }
        }
    }

    // Post-publish hooks. The fan-out already happened synchronously in the distributor; what's
    // left is re-applying the author's cache policy (their own timeline just grew).
    async fn on_post_created(&self, event: &events::Envelope) -> Result<()> {
        let Some(payload) = self.payload_or_skip::<PostCreated>(event) else {
            return Ok(());
        };
        self.strategy
            .apply(payload.user_id, Utc::now())
            .await
            .context(StrategySnafu)?;
        Ok(())
    }

    // Remove the post from every timeline the fan-out recorded. Owners materialized later by
    // pull-mode aren't in the index; the read path drops tombstones for them.
    async fn on_post_deleted(&self, event: &events::Envelope) -> Result<()> {
        let Some(payload) = self.payload_or_skip::<PostDeleted>(event) else {
            return Ok(());
        };
        let owners = self
            .timelines
            .drain_receivers(payload.post_id)
            .await
            .context(TimelinesSnafu)?;
        let count = owners.len();
        for owner in owners {
            self.timelines
                .remove(owner, payload.post_id)
                .await
                .context(TimelinesSnafu)?;
        }
        info!("Purged {} from {} timelines", payload.post_id, count);
        Ok(())
    }

    // Back-fill: the new follower should see the followee's recent posts without waiting for a
    // cache miss
    async fn on_follow_created(&self, event: &events::Envelope) -> Result<()> {
        let Some(payload) = self.payload_or_skip::<FollowCreated>(event) else {
            return Ok(());
        };
        self.activity.invalidate_followers(payload.followee_id);
        let recent = self
            .posts
            .list_by_author(payload.followee_id, 0, self.config.timeline.follow_backfill)
            .await
            .context(PostStoreSnafu)?;
        let cap = self.config.timeline.max_items;
        let ttl = self.config.feed.cache_ttl();
        let count = recent.len();
        for post in recent {
            self.timelines
                .add(
                    payload.follower_id,
                    post.id,
                    post.created_epoch(),
                    cap,
                    ttl,
                )
                .await
                .context(TimelinesSnafu)?;
        }
        debug!(
            "Back-filled {} posts of {} into {}'s timeline",
            count, payload.followee_id, payload.follower_id
        );
        Ok(())
    }

    // Purge: the ex-follower stops seeing the followee's posts, including the already-delivered
    // ones
    async fn on_follow_deleted(&self, event: &events::Envelope) -> Result<()> {
        let Some(payload) = self.payload_or_skip::<FollowDeleted>(event) else {
            return Ok(());
        };
        self.activity.invalidate_followers(payload.followee_id);
        // "Recent" here must reach at least as deep as anything a timeline could still hold
        let recent = self
            .posts
            .list_by_author(payload.followee_id, 0, self.config.timeline.max_items)
            .await
            .context(PostStoreSnafu)?;
        let count = recent.len();
        for post in recent {
            self.timelines
                .remove(payload.follower_id, post.id)
                .await
                .context(TimelinesSnafu)?;
        }
        debug!(
            "Purged {} posts of {} from {}'s timeline",
            count, payload.followee_id, payload.follower_id
        );
        Ok(())
    }

    // Engagement lands on the post's *author*: their counter moves, their activity score moves,
    // their post rescores
    async fn on_like(&self, event: &events::Envelope, delta: i64) -> Result<()> {
        let Some(payload) = self.payload_or_skip::<Like>(event) else {
            return Ok(());
        };
        self.posts
            .add_counters(payload.post_id, delta, 0, 0)
            .await
            .context(PostStoreSnafu)?;
        if delta > 0 {
            self.record_author_activity_soft(payload.post_id, ActivityKind::Like).await;
        }
        self.rescore(payload.post_id).await;
        Ok(())
    }

    async fn on_comment_created(&self, event: &events::Envelope) -> Result<()> {
        let Some(payload) = self.payload_or_skip::<CommentCreated>(event) else {
            return Ok(());
        };
        self.posts
            .add_counters(payload.post_id, 0, 1, 0)
            .await
            .context(PostStoreSnafu)?;
        self.record_author_activity_soft(payload.post_id, ActivityKind::Comment).await;
        self.rescore(payload.post_id).await;
        Ok(())
    }

    // Activity bookkeeping never blocks event handling; an unknown user or a flaky store just
    // costs us a data point
    async fn record_activity_soft(&self, user: UserId, kind: ActivityKind) {
        if let Err(err) = self.activity.record(user, kind, Utc::now()).await {
            debug!("Couldn't record {} activity for {}: {}", kind, user, err);
        }
    }

    // Resolve a post to its author & credit the author's activity score, best-effort
    async fn record_author_activity_soft(&self, post: crate::entities::PostId, kind: ActivityKind) {
        match self.posts.get(post).await {
            Ok(Some(fetched)) => {
                self.record_activity_soft(fetched.author_id, kind).await;
            }
            Ok(None) => (),
            Err(err) => {
                debug!("Couldn't resolve the author of {}: {}", post, err);
            }
        }
    }

    // Engagement moved; recompute the carried ranking score. Best-effort: the score orders
    // nothing today.
    async fn rescore(&self, post: crate::entities::PostId) {
        let fetched = match self.posts.get(post).await {
            Ok(Some(post)) if !post.is_deleted => post,
            Ok(_) => return,
            Err(err) => {
                debug!("Couldn't fetch {} for rescoring: {}", post, err);
                return;
            }
        };
        let author = match self.users.get(fetched.author_id).await {
            Ok(Some(author)) => author,
            Ok(None) => return,
            Err(err) => {
                debug!("Couldn't fetch the author of {} for rescoring: {}", post, err);
                return;
            }
        };
        let score = post_score(&fetched, &author, Utc::now());
        if let Err(err) = self.posts.update_score(post, score).await {
            debug!("Couldn't persist the new score of {}: {}", post, err);
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                        consumer loop                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Pump the bus into [Handlers] until `shutdown` is notified
///
/// Polls at most `consumer.max-in-flight` events per cycle (the back-pressure knob: when we're
/// saturated we simply stop pulling & let the bus buffer). Offsets commit per delivery after the
/// handler succeeds; on a handler failure the partition is parked for the rest of the cycle so a
/// later commit can't leapfrog the failed offset.
pub async fn consume_loop(
    consumer: Arc<dyn Consumer + Send + Sync>,
    handlers: Arc<Handlers>,
    shutdown: Arc<Notify>,
) {
    loop {
        let batch = match consumer.poll(handlers.config.consumer.max_in_flight).await {
            Ok(batch) => batch,
            Err(err) => {
                warn!("Couldn't poll the bus: {}", err);
                Vec::new()
            }
        };
        if batch.is_empty() {
            tokio::select! {
                _ = tokio::time::sleep(IDLE_SLEEP) => continue,
                _ = shutdown.notified() => return,
            }
        }
        let mut parked: HashSet<u32> = HashSet::new();
        for delivery in &batch {
            if parked.contains(&delivery.partition) {
                continue;
            }
            match process(&consumer, &handlers, delivery).await {
                Ok(()) => {
                    counter_add!(handlers.instruments, "consumer.events.handled", 1, &[]);
                }
                Err(err) => {
                    warn!(
                        "Handler failed on {} (partition {}, offset {}): {}; parking the partition",
                        delivery.event.kind, delivery.partition, delivery.offset, err
                    );
                    counter_add!(handlers.instruments, "consumer.events.failed", 1, &[]);
                    parked.insert(delivery.partition);
                }
            }
        }
    }
}

async fn process(
    consumer: &Arc<dyn Consumer + Send + Sync>,
    handlers: &Arc<Handlers>,
    delivery: &Delivery,
) -> Result<()> {
    handlers.handle(&delivery.event).await?;
    consumer.commit(delivery).await.context(BusSnafu)
}
