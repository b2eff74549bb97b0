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

//! # Cache strategy
//!
//! ## Introduction
//!
//! Not every timeline earns the same keep. A VIP's timeline is read constantly & kept for a
//! month; an active user's for a week; a drive-by account's for two hours and trimmed to a fifth
//! of the entries. This module owns the classification (VIP / active / inactive), applies the
//! matching TTL & size cap, and runs the periodic sweep that walks resident timelines demoting
//! the ones whose owners have gone quiet.
//!
//! Classification is *recomputed* from current facts each time it's consulted; there is no stored
//! class to go stale. Absent activity events & configuration changes, a user's class changes only
//! because time decays them across a threshold.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use serde::Serialize;
use snafu::prelude::*;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::{
    activity::{self, Tracker},
    assembler::Assembler,
    config::{ClassPolicy, Configuration},
    counter_add,
    entities::UserId,
    metrics::{Instruments, Registration, Sort},
    storage::{self, Users},
    timeline,
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Failed to consult the activity tracker: {source}"))]
    Activity { source: activity::Error },
    #[snafu(display("Timeline store error: {source}"))]
    Timelines { source: timeline::Error },
    #[snafu(display("Failed to read a user row: {source}"))]
    UserStore { source: storage::Error },
}

type Result<T> = std::result::Result<T, Error>;

inventory::submit! { Registration::new("strategy.sweeps", Sort::IntegralCounter) }
inventory::submit! { Registration::new("strategy.sweep.trimmed", Sort::IntegralCounter) }

/// A user's cache class
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Class {
    Vip,
    Active,
    Inactive,
}

impl std::fmt::Display for Class {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Class::Vip => "vip",
                Class::Active => "active",
                Class::Inactive => "inactive",
            }
        )
    }
}

/// What `get_cache_stats()` reports
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
pub struct CacheStats {
    pub total_timelines: usize,
    pub vip: usize,
    pub active: usize,
    pub inactive: usize,
}

pub struct Strategy {
    users: Arc<dyn Users + Send + Sync>,
    timelines: Arc<dyn timeline::Backend + Send + Sync>,
    activity: Arc<Tracker>,
    config: Arc<Configuration>,
    instruments: Arc<Instruments>,
}

impl Strategy {
    pub fn new(
        users: Arc<dyn Users + Send + Sync>,
        timelines: Arc<dyn timeline::Backend + Send + Sync>,
        activity: Arc<Tracker>,
        config: Arc<Configuration>,
        instruments: Arc<Instruments>,
    ) -> Strategy {
        Strategy {
            users,
            timelines,
            activity,
            config,
            instruments,
        }
    }

    /// Classify `user` from current facts
    pub async fn classify(&self, user: UserId, now: DateTime<Utc>) -> Result<Class> {
        let row = self.users.get(user).await.context(UserStoreSnafu)?;
        if let Some(row) = &row {
            if row.follower_count >= self.config.vip.follower_threshold {
                return Ok(Class::Vip);
            }
        }
        if self.activity.is_active(user, now).await.context(ActivitySnafu)? {
            Ok(Class::Active)
        } else {
            Ok(Class::Inactive)
        }
    }

    /// The cache policy for a class
    pub fn policy_for(&self, class: Class) -> ClassPolicy {
        match class {
            Class::Vip => self.config.vip.policy(),
            Class::Active => self.config.active.policy(),
            Class::Inactive => self.config.inactive.policy(),
        }
    }

    /// Re-apply `user`'s policy to their timeline: refresh the TTL, trim past the cap.
    /// Invoked when a user's activity changes & by the sweep.
    pub async fn apply(&self, user: UserId, now: DateTime<Utc>) -> Result<Class> {
        let class = self.classify(user, now).await?;
        let policy = self.policy_for(class);
        self.timelines
            .set_ttl(user, policy.ttl())
            .await
            .context(TimelinesSnafu)?;
        let size = self.timelines.size(user).await.context(TimelinesSnafu)?;
        if size > policy.max_items {
            self.timelines
                .trim(user, policy.max_items)
                .await
                .context(TimelinesSnafu)?;
            debug!("Trimmed {}'s timeline from {} to {}", user, size, policy.max_items);
        }
        Ok(class)
    }

    /// Walk every resident timeline & demote the ones owned by inactive users
    ///
    /// Returns the number of timelines trimmed. Work proceeds in batches of
    /// `cleanup.batch-size`-- the sweep is a background citizen and shouldn't monopolize the
    /// store.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<usize> {
        let owners = self.timelines.owners().await.context(TimelinesSnafu)?;
        let inactive_policy = self.config.inactive.policy();
        let mut trimmed = 0;
        for batch in owners.chunks(self.config.cleanup.batch_size.max(1)) {
            for owner in batch {
                match self.classify(*owner, now).await {
                    Ok(Class::Inactive) => {
                        let size = self.timelines.size(*owner).await.context(TimelinesSnafu)?;
                        if size > inactive_policy.max_items {
                            self.timelines
                                .trim(*owner, inactive_policy.max_items)
                                .await
                                .context(TimelinesSnafu)?;
                            trimmed += 1;
                        }
                        self.timelines
                            .set_ttl(*owner, inactive_policy.ttl())
                            .await
                            .context(TimelinesSnafu)?;
                    }
                    Ok(_) => (),
                    Err(err) => warn!("Couldn't classify {} during the sweep: {}", owner, err),
                }
            }
            // Yield between batches; everything here is I/O but fairness costs nothing
            tokio::task::yield_now().await;
        }
        counter_add!(self.instruments, "strategy.sweeps", 1, &[]);
        counter_add!(self.instruments, "strategy.sweep.trimmed", trimmed as u64, &[]);
        info!(
            "Cache sweep covered {} timelines, trimmed {}",
            owners.len(),
            trimmed
        );
        Ok(trimmed)
    }

    /// Warm timelines for `users` who are active but have nothing cached, by running a pull-mode
    /// rebuild inline
    pub async fn prewarm(
        &self,
        users: &[UserId],
        assembler: &Arc<Assembler>,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let mut warmed = 0;
        for user in users {
            if !self.activity.is_active(*user, now).await.context(ActivitySnafu)? {
                continue;
            }
            if self.timelines.size(*user).await.context(TimelinesSnafu)? > 0 {
                continue;
            }
            match assembler
                .assemble(*user, None, self.config.timeline.max_items, now)
                .await
            {
                Ok(page) => {
                    assembler.rebuild(*user, &page.items, now).await;
                    warmed += 1;
                }
                Err(err) => warn!("Couldn't prewarm {}: {}", user, err),
            }
        }
        Ok(warmed)
    }

    /// Tally resident timelines by owner class
    pub async fn cache_stats(&self, now: DateTime<Utc>) -> Result<CacheStats> {
        let owners = self.timelines.owners().await.context(TimelinesSnafu)?;
        let mut stats = CacheStats {
            total_timelines: owners.len(),
            ..Default::default()
        };
        for owner in owners {
            match self.classify(owner, now).await {
                Ok(Class::Vip) => stats.vip += 1,
                Ok(Class::Active) => stats.active += 1,
                Ok(Class::Inactive) => stats.inactive += 1,
                Err(err) => warn!("Couldn't classify {} for stats: {}", owner, err),
            }
        }
        Ok(stats)
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          sweep loop                                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Run [Strategy::sweep] every `interval` until `shutdown` is notified, with a jittered start
pub async fn sweep_loop(strategy: Arc<Strategy>, interval: Duration, shutdown: Arc<Notify>) {
    use rand::Rng;
    let jitter =
        Duration::from_secs(rand::thread_rng().gen_range(0..interval.as_secs().max(1) / 10 + 1));
    tokio::select! {
        _ = tokio::time::sleep(jitter) => (),
        _ = shutdown.notified() => return,
    }
    loop {
        if let Err(err) = strategy.sweep(Utc::now()).await {
            warn!("Cache sweep failed: {}", err);
        }
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
        entities::{PostId, User},
        memory::{MemoryFollows, MemoryTimelines, MemoryUsers},
        storage::Users as _,
        timeline::Backend as _,
    };

    struct Fixture {
        users: Arc<MemoryUsers>,
        timelines: Arc<MemoryTimelines>,
        strategy: Strategy,
    }

    fn fixture() -> Fixture {
        let config = Arc::new(Configuration::default());
        let users = Arc::new(MemoryUsers::new());
        let follows = Arc::new(MemoryFollows::new());
        let timelines = Arc::new(MemoryTimelines::new());
        let instruments = Arc::new(Instruments::new("fanline"));
        let tracker = Arc::new(Tracker::new(
            users.clone(),
            follows,
            config.clone(),
            instruments.clone(),
        ));
        let strategy = Strategy::new(
            users.clone(),
            timelines.clone(),
            tracker,
            config,
            instruments,
        );
        Fixture {
            users,
            timelines,
            strategy,
        }
    }

    async fn seed_user(fx: &Fixture, followers: i64, score: f64, last: DateTime<Utc>) -> UserId {
        let id = UserId::new();
        let mut row = User::new(id);
        row.follower_count = followers;
        row.activity_score = score;
        row.last_active_at = Some(last);
        fx.users.upsert(&row).await.unwrap();
        id
    }

    #[tokio::test]
    async fn classification_spans_the_three_classes() {
        let fx = fixture();
        let now = Utc::now();
        let vip = seed_user(&fx, 200_000, 0.0, now - chrono::Duration::days(90)).await;
        let active = seed_user(&fx, 10, 90.0, now - chrono::Duration::days(90)).await;
        let inactive = seed_user(&fx, 10, 1.0, now - chrono::Duration::days(90)).await;
        assert_eq!(fx.strategy.classify(vip, now).await.unwrap(), Class::Vip);
        assert_eq!(fx.strategy.classify(active, now).await.unwrap(), Class::Active);
        assert_eq!(
            fx.strategy.classify(inactive, now).await.unwrap(),
            Class::Inactive
        );
        // Classification is stable absent events: ask again, same answers
        assert_eq!(fx.strategy.classify(vip, now).await.unwrap(), Class::Vip);
        assert_eq!(
            fx.strategy.classify(inactive, now).await.unwrap(),
            Class::Inactive
        );
    }

    #[tokio::test]
    async fn sweep_trims_only_the_inactive() {
        let fx = fixture();
        let now = Utc::now();
        let active = seed_user(&fx, 10, 90.0, now).await;
        let inactive = seed_user(&fx, 10, 0.0, now - chrono::Duration::days(90)).await;
        let ttl = Duration::from_secs(3600);
        for n in 0..300 {
            fx.timelines
                .add(active, PostId::new(), n, 1000, ttl)
                .await
                .unwrap();
            fx.timelines
                .add(inactive, PostId::new(), n, 1000, ttl)
                .await
                .unwrap();
        }
        let trimmed = fx.strategy.sweep(now).await.unwrap();
        assert_eq!(trimmed, 1);
        assert_eq!(fx.timelines.size(active).await.unwrap(), 300);
        // Trimmed to the inactive cap of 200, keeping the newest
        assert_eq!(fx.timelines.size(inactive).await.unwrap(), 200);
        assert_eq!(fx.timelines.oldest_score(inactive).await.unwrap(), Some(100));
    }

    #[tokio::test]
    async fn apply_enforces_the_class_cap() {
        let fx = fixture();
        let now = Utc::now();
        let inactive = seed_user(&fx, 10, 0.0, now - chrono::Duration::days(90)).await;
        let ttl = Duration::from_secs(3600);
        for n in 0..250 {
            fx.timelines
                .add(inactive, PostId::new(), n, 1000, ttl)
                .await
                .unwrap();
        }
        let class = fx.strategy.apply(inactive, now).await.unwrap();
        assert_eq!(class, Class::Inactive);
        assert_eq!(fx.timelines.size(inactive).await.unwrap(), 200);
    }

    #[tokio::test]
    async fn cache_stats_tally_by_class() {
        let fx = fixture();
        let now = Utc::now();
        let vip = seed_user(&fx, 200_000, 0.0, now).await;
        let active = seed_user(&fx, 10, 90.0, now).await;
        let inactive = seed_user(&fx, 10, 0.0, now - chrono::Duration::days(90)).await;
        let ttl = Duration::from_secs(3600);
        for owner in [vip, active, inactive] {
            fx.timelines
                .add(owner, PostId::new(), 1, 1000, ttl)
                .await
                .unwrap();
        }
        let stats = fx.strategy.cache_stats(now).await.unwrap();
        assert_eq!(stats.total_timelines, 3);
        assert_eq!((stats.vip, stats.active, stats.inactive), (1, 1, 1));
    }

    #[tokio::test]
    async fn prewarm_builds_missing_timelines_for_active_users_only() {
        use crate::{
            entities::{FollowEdge, Post},
            memory::MemoryPosts,
            storage::{Follows as _, Posts as _},
        };
        let config = Arc::new(Configuration::default());
        let posts = Arc::new(MemoryPosts::new());
        let users = Arc::new(MemoryUsers::new());
        let follows = Arc::new(MemoryFollows::new());
        let timelines = Arc::new(MemoryTimelines::new());
        let instruments = Arc::new(Instruments::new("fanline"));
        let tracker = Arc::new(Tracker::new(
            users.clone(),
            follows.clone(),
            config.clone(),
            instruments.clone(),
        ));
        let strategy = Strategy::new(
            users.clone(),
            timelines.clone(),
            tracker.clone(),
            config.clone(),
            instruments.clone(),
        );
        let assembler = Assembler::new(
            posts.clone(),
            follows.clone(),
            timelines.clone(),
            tracker,
            config,
            instruments,
        );

        let now = Utc::now();
        let author = UserId::new();
        users.upsert(&User::new(author)).await.unwrap();
        let post = Post::new(author, "warmth", vec![], now).unwrap();
        posts.create(&post).await.unwrap();

        let active = UserId::new();
        let mut row = User::new(active);
        row.activity_score = 90.0;
        row.last_active_at = Some(now);
        users.upsert(&row).await.unwrap();
        let dormant = UserId::new();
        let mut row = User::new(dormant);
        row.last_active_at = Some(now - chrono::Duration::days(90));
        users.upsert(&row).await.unwrap();
        for follower in [active, dormant] {
            follows
                .add_edge(&FollowEdge {
                    follower,
                    followee: author,
                    created_at: now,
                    is_active: true,
                })
                .await
                .unwrap();
        }

        let warmed = strategy
            .prewarm(&[active, dormant], &assembler, now)
            .await
            .unwrap();
        assert_eq!(warmed, 1);
        assert!(timelines.contains(active, post.id).await.unwrap());
        assert_eq!(timelines.size(dormant).await.unwrap(), 0);
    }
}
