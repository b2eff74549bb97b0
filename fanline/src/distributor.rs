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

//! # The distributor
//!
//! ## Introduction
//!
//! The heart of the fan-out. When a post is published, somebody has to pay: either the writer
//! (one timeline insert per follower, now) or the readers (a K-way aggregation per feed view,
//! later). The distributor routes between the two by author size:
//!
//! - at or below `push-threshold` followers: **push-to-all**. One pipelined batch writes the
//!   entry to every follower's timeline (and the author's own).
//! - above it: **push-to-active**. Only the `hot-active-limit` most-active followers get the
//!   entry pushed; the dormant majority pick the post up through pull-mode on their next read,
//!   if they ever come back at all. An influencer's fan-out cost stops scaling with fame.
//!
//! ## The ledger dance
//!
//! `started_*` is written *before* the first timeline write, `completed` after the last. A crash
//! in between strands a `started_*` record, which is precisely what the recovery scanner feeds
//! on; because timeline membership is keyed by post id, recovery may blindly re-run the whole
//! fan-out without fear of duplicates. Failure to *complete* is therefore an inconvenience, never
//! a correctness problem.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use snafu::prelude::*;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::{
    activity::{self, Tracker},
    config::Configuration,
    counter_add,
    entities::{Post, PostId, User, UserId},
    events::{DistributionCompleted, Envelope, Producer, DISTRIBUTION_COMPLETED},
    ledger::{self, Record, Status},
    metrics::{Instruments, Registration, Sort},
    storage::{self, Follows, Posts, Users},
    timeline,
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Failed to select active followers: {source}"))]
    ActiveFollowers { source: activity::Error },
    #[snafu(display("Failed to write the fan-out batch: {source}"))]
    Batch { source: timeline::Error },
    #[snafu(display("Failed to list followers: {source}"))]
    Followers { source: storage::Error },
    #[snafu(display("Failed to write the distribution ledger: {source}"))]
    Ledger { source: ledger::Error },
}

type Result<T> = std::result::Result<T, Error>;

inventory::submit! { Registration::new("distributor.fanouts.small", Sort::IntegralCounter) }
inventory::submit! { Registration::new("distributor.fanouts.influencer", Sort::IntegralCounter) }
inventory::submit! { Registration::new("distributor.fanouts.failed", Sort::IntegralCounter) }

// How many times the batched timeline write is attempted before the ledger takes over
const BATCH_ATTEMPTS: usize = 3;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           scoring                                              //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The author's standing contribution to a post's score
pub fn author_base(author: &User) -> f64 {
    1.0 + 0.5 * ((author.follower_count as f64) + 1.0).log10()
        + 0.01 * (author.following_count as f64)
}

/// The engagement contribution: likes are cheap, shares are not
pub fn engagement(post: &Post) -> f64 {
    0.1 * (post.like_count as f64) + 0.2 * (post.comment_count as f64)
        + 0.3 * (post.share_count as f64)
}

/// The post's ranking score as of `now`: `(base + engagement) * exp(-age_hours / 24)`
///
/// Computed at publish & recomputed by the rescan pass. Timelines do *not* order by this-- they
/// order by publish epoch-- it's carried on the post for future re-ranking.
pub fn post_score(post: &Post, author: &User, now: DateTime<Utc>) -> f64 {
    let hours = ((now - post.created_at).num_seconds().max(0) as f64) / 3600.0;
    (author_base(author) + engagement(post)) * (-hours / 24.0).exp()
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                         Distributor                                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// How a fan-out went, for the caller's logs & the completion event
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Outcome {
    pub mode: Status,
    /// Timelines written on the push side (including the author's own)
    pub pushed_to: usize,
}

pub struct Distributor {
    follows: Arc<dyn Follows + Send + Sync>,
    timelines: Arc<dyn timeline::Backend + Send + Sync>,
    ledger: Arc<dyn ledger::Backend + Send + Sync>,
    activity: Arc<Tracker>,
    producer: Arc<dyn Producer + Send + Sync>,
    config: Arc<Configuration>,
    instruments: Arc<Instruments>,
}

impl Distributor {
    pub fn new(
        follows: Arc<dyn Follows + Send + Sync>,
        timelines: Arc<dyn timeline::Backend + Send + Sync>,
        ledger: Arc<dyn ledger::Backend + Send + Sync>,
        activity: Arc<Tracker>,
        producer: Arc<dyn Producer + Send + Sync>,
        config: Arc<Configuration>,
        instruments: Arc<Instruments>,
    ) -> Distributor {
        Distributor {
            follows,
            timelines,
            ledger,
            activity,
            producer,
            config,
            instruments,
        }
    }

    /// Select the followers the chosen mode would push to (recovery calls this too, so that a
    /// re-run selects the same population the original would have)
    pub async fn select_targets(
        &self,
        author: UserId,
        mode: Status,
        now: DateTime<Utc>,
    ) -> Result<Vec<UserId>> {
        let mut targets = match mode {
            Status::StartedPushInfluencer => self
                .activity
                .active_followers(author, self.config.feed.hot_active_limit, now)
                .await
                .context(ActiveFollowersSnafu)?,
            _ => self
                .follows
                .followers(author, 0, self.config.feed.max_feed_size)
                .await
                .context(FollowersSnafu)?,
        };
        // The author always sees their own post
        targets.push(author);
        Ok(targets)
    }

    /// Fan `post` out to `author`'s followers
    ///
    /// Returns once the status record & the hot-path timeline writes have landed; with
    /// push-to-active that's bounded work regardless of follower count. On a partial failure the
    /// `started_*` record is deliberately left behind for recovery.
    pub async fn distribute(
        &self,
        post: &Post,
        author: &User,
        now: DateTime<Utc>,
    ) -> Result<Outcome> {
        let mode = if author.follower_count <= self.config.feed.push_threshold {
            Status::StartedPushSmall
        } else {
            Status::StartedPushInfluencer
        };
        let retention = self.config.recovery.retention();
        self.ledger
            .put(
                &Record {
                    post_id: post.id,
                    author_id: author.id,
                    status: mode,
                    started_at: now,
                },
                retention,
            )
            .await
            .context(LedgerSnafu)?;

        let outcome = self.fan_out(post, author.id, mode, now).await;
        match &outcome {
            Ok(outcome) => {
                // The record is rewritten `completed` only after every batch write succeeded
                self.ledger
                    .complete(post.id, now, retention)
                    .await
                    .context(LedgerSnafu)?;
                match mode {
                    Status::StartedPushSmall => {
                        counter_add!(self.instruments, "distributor.fanouts.small", 1, &[])
                    }
                    _ => counter_add!(self.instruments, "distributor.fanouts.influencer", 1, &[]),
                }
                self.announce(post.id, author.id, outcome).await;
                info!(
                    "Distributed {} to {} timelines ({})",
                    post.id, outcome.pushed_to, mode
                );
            }
            Err(err) => {
                counter_add!(self.instruments, "distributor.fanouts.failed", 1, &[]);
                warn!(
                    "Fan-out of {} failed ({}); leaving {} in the ledger for recovery",
                    post.id, err, mode
                );
            }
        }
        outcome
    }

    // The mode-independent middle: select targets, write the batch, record the receivers
    async fn fan_out(
        &self,
        post: &Post,
        author: UserId,
        mode: Status,
        now: DateTime<Utc>,
    ) -> Result<Outcome> {
        let targets = self.select_targets(author, mode, now).await?;
        // Bounded exponential backoff on the batched write; a batch that still won't land is
        // recovery's problem
        let mut delay = Duration::from_millis(100);
        let mut attempt = 1;
        loop {
            match self
                .timelines
                .add_batch(
                    &targets,
                    post.id,
                    post.created_epoch(),
                    self.config.timeline.max_items,
                    self.config.feed.cache_ttl(),
                )
                .await
            {
                Ok(()) => break,
                Err(err) if attempt < BATCH_ATTEMPTS => {
                    warn!(
                        "Fan-out batch for {} failed (attempt {} of {}): {}",
                        post.id, attempt, BATCH_ATTEMPTS, err
                    );
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                    attempt += 1;
                }
                Err(err) => return Err(err).context(BatchSnafu),
            }
        }
        // The reverse index consulted on deletion; retained as long as the ledger record
        if let Err(err) = self
            .timelines
            .record_receivers(post.id, &targets, self.config.recovery.retention())
            .await
        {
            // Losing this index degrades deletion to tombstone-filtering, nothing worse
            warn!("Couldn't record receivers of {}: {}", post.id, err);
        }
        debug!("Wrote {} to {} timelines", post.id, targets.len());
        Ok(Outcome {
            mode,
            pushed_to: targets.len(),
        })
    }

    // Best-effort completion event; the fan-out already happened, so a deaf bus costs us nothing
    // but observability
    async fn announce(&self, post: PostId, author: UserId, outcome: &Outcome) {
        let now = Utc::now();
        let payload = DistributionCompleted {
            post_id: post,
            author_id: author,
            pushed_to: outcome.pushed_to,
            mode: format!("{}", outcome.mode),
        };
        match Envelope::new(DISTRIBUTION_COMPLETED, now, &payload) {
            Ok(envelope) => {
                if let Err(err) = self
                    .producer
                    .publish(&author.to_raw_string(), &envelope)
                    .await
                {
                    warn!("Couldn't publish a distribution-completed event: {}", err);
                }
            }
            Err(err) => warn!("Couldn't encode a distribution-completed event: {}", err),
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                         rescan pass                                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

// How many of each author's recent posts a rescan pass will rescore
const RESCAN_RECENT: usize = 20;

inventory::submit! { Registration::new("distributor.rescans", Sort::IntegralCounter) }

/// Recompute the carried ranking score of recent posts
///
/// A score computed at publish drifts stale as the decay term ages. This walks the owners of
/// resident timelines-- a serviceable proxy for "authors anyone still reads"-- and rescores each
/// one's recent posts. Nothing orders by the score today; the pass keeps it current for whatever
/// ranking comes later, and a skipped beat is harmless.
pub async fn rescan_scores(
    posts: &Arc<dyn Posts + Send + Sync>,
    users: &Arc<dyn Users + Send + Sync>,
    timelines: &Arc<dyn timeline::Backend + Send + Sync>,
    now: DateTime<Utc>,
) -> usize {
    let owners = match timelines.owners().await {
        Ok(owners) => owners,
        Err(err) => {
            warn!("Rescan couldn't list timelines: {}", err);
            return 0;
        }
    };
    let mut rescored = 0;
    for owner in owners {
        let author = match users.get(owner).await {
            Ok(Some(author)) => author,
            Ok(None) => continue,
            Err(err) => {
                warn!("Rescan couldn't read user {}: {}", owner, err);
                continue;
            }
        };
        let recent = match posts.list_by_author(owner, 0, RESCAN_RECENT).await {
            Ok(recent) => recent,
            Err(err) => {
                warn!("Rescan couldn't list posts of {}: {}", owner, err);
                continue;
            }
        };
        for post in recent {
            let score = post_score(&post, &author, now);
            if let Err(err) = posts.update_score(post.id, score).await {
                warn!("Rescan couldn't update the score of {}: {}", post.id, err);
                continue;
            }
            rescored += 1;
        }
    }
    rescored
}

/// Run [rescan_scores] every `interval` until `shutdown` is notified, with a jittered start
pub async fn rescan_loop(
    posts: Arc<dyn Posts + Send + Sync>,
    users: Arc<dyn Users + Send + Sync>,
    timelines: Arc<dyn timeline::Backend + Send + Sync>,
    instruments: Arc<Instruments>,
    interval: Duration,
    shutdown: Arc<Notify>,
) {
    use rand::Rng;
    let jitter =
        Duration::from_secs(rand::thread_rng().gen_range(0..interval.as_secs().max(1) / 10 + 1));
    tokio::select! {
        _ = tokio::time::sleep(jitter) => (),
        _ = shutdown.notified() => return,
    }
    loop {
        let rescored = rescan_scores(&posts, &users, &timelines, Utc::now()).await;
        counter_add!(instruments, "distributor.rescans", 1, &[]);
        debug!("Rescan pass rescored {} posts", rescored);
        tokio::select! {
            _ = tokio::time::sleep(interval) => (),
            _ = shutdown.notified() => return,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        config::Configuration,
        entities::FollowEdge,
        ledger::Backend as _,
        memory::{MemoryBus, MemoryFollows, MemoryLedger, MemoryTimelines, MemoryUsers},
        storage::{Follows as _, Users as _},
        timeline::Backend as _,
    };

    struct Fixture {
        users: Arc<MemoryUsers>,
        follows: Arc<MemoryFollows>,
        timelines: Arc<MemoryTimelines>,
        ledger: Arc<MemoryLedger>,
        distributor: Distributor,
    }

    fn fixture(config: Configuration) -> Fixture {
        let config = Arc::new(config);
        let users = Arc::new(MemoryUsers::new());
        let follows = Arc::new(MemoryFollows::new());
        let timelines = Arc::new(MemoryTimelines::new());
        let ledger = Arc::new(MemoryLedger::new());
        let instruments = Arc::new(Instruments::new("fanline"));
        let tracker = Arc::new(Tracker::new(
            users.clone(),
            follows.clone(),
            config.clone(),
            instruments.clone(),
        ));
        let distributor = Distributor::new(
            follows.clone(),
            timelines.clone(),
            ledger.clone(),
            tracker,
            Arc::new(MemoryBus::new()),
            config,
            instruments,
        );
        Fixture {
            users,
            follows,
            timelines,
            ledger,
            distributor,
        }
    }

    async fn follow(fx: &Fixture, follower: UserId, followee: UserId) {
        fx.follows
            .add_edge(&FollowEdge {
                follower,
                followee,
                created_at: Utc::now(),
                is_active: true,
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn small_author_reaches_every_follower_and_self() {
        let fx = fixture(Configuration::default());
        let now = Utc::now();
        let author_id = UserId::new();
        let mut author = User::new(author_id);
        author.follower_count = 3;
        fx.users.upsert(&author).await.unwrap();
        let followers: Vec<UserId> = (0..3).map(|_| UserId::new()).collect();
        for f in &followers {
            fx.users.upsert(&User::new(*f)).await.unwrap();
            follow(&fx, *f, author_id).await;
        }
        let post = Post::new(author_id, "hi", vec![], now).unwrap();

        let outcome = fx.distributor.distribute(&post, &author, now).await.unwrap();
        assert_eq!(outcome.mode, Status::StartedPushSmall);
        assert_eq!(outcome.pushed_to, 4);
        for owner in followers.iter().chain([&author_id]) {
            assert!(fx.timelines.contains(*owner, post.id).await.unwrap());
            assert_eq!(fx.timelines.size(*owner).await.unwrap(), 1);
        }
        assert_eq!(
            fx.ledger.get(post.id).await.unwrap().unwrap().status,
            Status::Completed
        );
    }

    #[tokio::test]
    async fn fan_out_is_idempotent() {
        let fx = fixture(Configuration::default());
        let now = Utc::now();
        let author_id = UserId::new();
        let mut author = User::new(author_id);
        author.follower_count = 1;
        fx.users.upsert(&author).await.unwrap();
        let follower = UserId::new();
        fx.users.upsert(&User::new(follower)).await.unwrap();
        follow(&fx, follower, author_id).await;
        let post = Post::new(author_id, "once", vec![], now).unwrap();

        fx.distributor.distribute(&post, &author, now).await.unwrap();
        fx.distributor.distribute(&post, &author, now).await.unwrap();
        fx.distributor.distribute(&post, &author, now).await.unwrap();
        assert_eq!(fx.timelines.size(follower).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn influencer_reaches_only_active_followers() {
        let mut config = Configuration::default();
        config.feed.push_threshold = 2;
        config.feed.hot_active_limit = 10;
        let fx = fixture(config);
        let now = Utc::now();

        let author_id = UserId::new();
        let mut author = User::new(author_id);
        author.follower_count = 4; // over the threshold of 2
        fx.users.upsert(&author).await.unwrap();

        let mut active = Vec::new();
        let mut dormant = Vec::new();
        for n in 0..4 {
            let follower = UserId::new();
            let mut row = User::new(follower);
            if n < 2 {
                row.activity_score = 100.0;
                row.last_active_at = Some(now);
                active.push(follower);
            } else {
                row.activity_score = 0.0;
                row.last_active_at = Some(now - chrono::Duration::days(365));
                dormant.push(follower);
            }
            fx.users.upsert(&row).await.unwrap();
            follow(&fx, follower, author_id).await;
        }
        let post = Post::new(author_id, "fame", vec![], now).unwrap();

        let outcome = fx.distributor.distribute(&post, &author, now).await.unwrap();
        assert_eq!(outcome.mode, Status::StartedPushInfluencer);
        assert_eq!(outcome.pushed_to, 3); // two active + the author
        for owner in &active {
            assert!(fx.timelines.contains(*owner, post.id).await.unwrap());
        }
        for owner in &dormant {
            assert_eq!(fx.timelines.size(*owner).await.unwrap(), 0);
        }
        assert!(fx.timelines.contains(author_id, post.id).await.unwrap());
    }

    #[tokio::test]
    async fn zero_followers_degenerates_to_a_self_write() {
        let fx = fixture(Configuration::default());
        let now = Utc::now();
        let author_id = UserId::new();
        let author = User::new(author_id);
        fx.users.upsert(&author).await.unwrap();
        let post = Post::new(author_id, "alone", vec![], now).unwrap();
        let outcome = fx.distributor.distribute(&post, &author, now).await.unwrap();
        assert_eq!(outcome.pushed_to, 1);
        assert!(fx.timelines.contains(author_id, post.id).await.unwrap());
    }

    #[test]
    fn scoring_matches_the_formula() {
        let author_id = UserId::new();
        let mut author = User::new(author_id);
        author.follower_count = 999; // log10(1000) = 3
        author.following_count = 100;
        let now = Utc::now();
        let mut post = Post::new(author_id, "scored", vec![], now).unwrap();
        post.like_count = 10;
        post.comment_count = 5;
        post.share_count = 2;
        // base = 1 + 0.5*3 + 0.01*100 = 3.5; engagement = 1 + 1 + 0.6 = 2.6; no decay at age 0
        assert!((author_base(&author) - 3.5).abs() < 1e-9);
        assert!((engagement(&post) - 2.6).abs() < 1e-9);
        assert!((post_score(&post, &author, now) - 6.1).abs() < 1e-9);
        // A day later the whole thing has decayed by e^-1
        let later = now + chrono::Duration::hours(24);
        assert!((post_score(&post, &author, later) - 6.1 * (-1.0f64).exp()).abs() < 1e-9);
    }

    #[tokio::test]
    async fn rescan_refreshes_stale_scores() {
        use crate::{memory::MemoryPosts, storage::Posts as _};
        let fx = fixture(Configuration::default());
        let posts = Arc::new(MemoryPosts::new());
        let now = Utc::now();
        let author_id = UserId::new();
        let author = User::new(author_id);
        fx.users.upsert(&author).await.unwrap();
        let mut post =
            Post::new(author_id, "aging", vec![], now - chrono::Duration::hours(24)).unwrap();
        post.score = post_score(&post, &author, post.created_at); // the score at publish
        posts.create(&post).await.unwrap();
        // The author's own timeline is resident, as distribution leaves it
        fx.timelines
            .add(
                author_id,
                post.id,
                post.created_epoch(),
                1000,
                Duration::from_secs(3600),
            )
            .await
            .unwrap();

        let posts_dyn: Arc<dyn Posts + Send + Sync> = posts.clone();
        let users_dyn: Arc<dyn Users + Send + Sync> = fx.users.clone();
        let timelines_dyn: Arc<dyn timeline::Backend + Send + Sync> = fx.timelines.clone();
        let rescored = rescan_scores(&posts_dyn, &users_dyn, &timelines_dyn, now).await;
        assert_eq!(rescored, 1);
        let fresh = posts.get(post.id).await.unwrap().unwrap();
        // A day of decay knocked the score down by e^-1
        assert!((fresh.score - post.score * (-1.0f64).exp()).abs() < 1e-6);
    }
}
