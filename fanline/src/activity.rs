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

//! # The activity tracker
//!
//! ## Introduction
//!
//! Every observable user action-- login, publish, comment, share, like, feed-view-- is reported
//! here. The tracker maintains a per-user scalar "activity score" that decays exponentially
//! between updates, answers the question "is user U active?", and can name the K most-active
//! followers of an influencer. The distributor leans on that last query to decide *who* is worth
//! pushing to; the cache-strategy manager leans on the predicate to decide how long a timeline is
//! worth keeping.
//!
//! ## Caching
//!
//! Three small in-process caches sit in front of the user store: the online flag (a TTL'd
//! presence marker), the activeness verdict (cached for a few minutes-- the predicate is
//! consulted on every feed read), and the active-followers set per influencer. Each entry carries
//! its own expiry instant; [LruCache] bounds the memory. Two racing updates may lose an
//! increment-- tolerated, the score is advisory.

use std::{
    num::NonZeroUsize,
    sync::Arc,
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use lru::LruCache;
use snafu::prelude::*;
use std::sync::Mutex;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::{
    config::Configuration,
    counter_add,
    entities::{ActivityKind, User, UserId},
    metrics::{Instruments, Registration, Sort},
    storage::{self, Follows, Users},
    timeline,
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Failed to read the follow graph: {source}"))]
    Follows { source: storage::Error },
    #[snafu(display("No user {user}"))]
    UnknownUser { user: UserId },
    #[snafu(display("Failed to read or write a user row: {source}"))]
    UserStore { source: storage::Error },
}

type Result<T> = std::result::Result<T, Error>;

// Bounds on the in-process caches. Eviction is LRU, so a hot predicate entry survives; these just
// keep a long-running node from hoarding verdicts for every user it ever saw.
const VERDICT_CACHE_SIZE: usize = 65_536;
const ONLINE_CACHE_SIZE: usize = 65_536;
const FOLLOWER_CACHE_SIZE: usize = 4_096;

// How deep into an influencer's follower list the on-demand active-followers join will look
const FOLLOWER_SCAN_CAP: usize = 10_000;

inventory::submit! { Registration::new("activity.updates", Sort::IntegralCounter) }
inventory::submit! { Registration::new("activity.decay_sweeps", Sort::IntegralCounter) }

/// The activity tracker
pub struct Tracker {
    users: Arc<dyn Users + Send + Sync>,
    follows: Arc<dyn Follows + Send + Sync>,
    config: Arc<Configuration>,
    instruments: Arc<Instruments>,
    online: Mutex<LruCache<UserId, Instant>>,
    verdicts: Mutex<LruCache<UserId, (bool, Instant)>>,
    active_followers: Mutex<LruCache<UserId, (Vec<UserId>, Instant)>>,
}

impl Tracker {
    pub fn new(
        users: Arc<dyn Users + Send + Sync>,
        follows: Arc<dyn Follows + Send + Sync>,
        config: Arc<Configuration>,
        instruments: Arc<Instruments>,
    ) -> Tracker {
        Tracker {
            users,
            follows,
            config,
            instruments,
            online: Mutex::new(LruCache::new(
                NonZeroUsize::new(ONLINE_CACHE_SIZE).unwrap(/* known good */),
            )),
            verdicts: Mutex::new(LruCache::new(
                NonZeroUsize::new(VERDICT_CACHE_SIZE).unwrap(/* known good */),
            )),
            active_followers: Mutex::new(LruCache::new(
                NonZeroUsize::new(FOLLOWER_CACHE_SIZE).unwrap(/* known good */),
            )),
        }
    }

    /// The decayed value of `score` after `elapsed` has passed
    ///
    /// `DECAY_FACTOR^(hours/24)`: a day of silence multiplies the score by the decay factor.
    fn decayed(&self, score: f64, elapsed: chrono::Duration) -> f64 {
        let hours = (elapsed.num_seconds().max(0) as f64) / 3600.0;
        score * self.config.activity.decay_factor.powf(hours / 24.0)
    }

    /// Record an observable action by `user`; returns the new activity score
    ///
    /// Read-modify-write on the user row: decay the prior score for the time elapsed since
    /// `last_active_at`, add the kind's increment, clamp to the configured maximum.
    pub async fn record(&self, user: UserId, kind: ActivityKind, now: DateTime<Utc>) -> Result<f64> {
        let mut row: User = self
            .users
            .get(user)
            .await
            .context(UserStoreSnafu)?
            .context(UnknownUserSnafu { user })?;
        let decayed = match row.last_active_at {
            Some(last) => self.decayed(row.activity_score, now - last),
            None => 0.0,
        };
        row.activity_score = (decayed + kind.increment()).min(self.config.activity.max_score);
        row.last_active_at = Some(now);
        row.is_online = true;
        self.users.upsert(&row).await.context(UserStoreSnafu)?;

        self.online.lock().unwrap(/* not held across await */).put(
            user,
            Instant::now() + self.config.activity.online_ttl(),
        );
        // The cached verdict is stale the moment the score moves
        self.verdicts.lock().unwrap(/* not held across await */).pop(&user);

        counter_add!(self.instruments, "activity.updates", 1, &[]);
        debug!(
            "Recorded {} by {}; activity score now {:.1}",
            kind, user, row.activity_score
        );
        Ok(row.activity_score)
    }

    /// Is `user` online right now? (Driven entirely by the TTL'd flag set on each action.)
    pub fn is_online(&self, user: UserId) -> bool {
        let mut online = self.online.lock().unwrap(/* not held across await */);
        match online.get(&user) {
            Some(expiry) if *expiry > Instant::now() => true,
            Some(_) => {
                online.pop(&user);
                false
            }
            None => false,
        }
    }

    /// The activeness predicate: online, or scored above the threshold, or seen within the
    /// activity window. Verdicts are cached briefly-- this is on the feed-read hot path.
    pub async fn is_active(&self, user: UserId, now: DateTime<Utc>) -> Result<bool> {
        {
            let mut verdicts = self.verdicts.lock().unwrap(/* not held across await */);
            if let Some((verdict, expiry)) = verdicts.get(&user) {
                if *expiry > Instant::now() {
                    return Ok(*verdict);
                }
                verdicts.pop(&user);
            }
        }
        let verdict = match self.users.get(user).await.context(UserStoreSnafu)? {
            Some(row) => self.judge(&row, now),
            None => false,
        };
        self.verdicts.lock().unwrap(/* not held across await */).put(
            user,
            (verdict, Instant::now() + self.config.activity.active_cache_ttl()),
        );
        Ok(verdict)
    }

    // The predicate itself, given a user row in hand
    fn judge(&self, row: &User, now: DateTime<Utc>) -> bool {
        self.is_online(row.id)
            || row.activity_score >= self.config.active.score_threshold
            || row
                .last_active_at
                .map(|last| now - last < self.config.activity.active_window())
                .unwrap_or(false)
    }

    /// Up to `k` of `user`'s followers, most active first
    ///
    /// Computed on demand by joining the follower list (to a depth of [FOLLOWER_SCAN_CAP]) with
    /// per-user activity scores, then cached per influencer. Followers that aren't active at all
    /// are excluded-- an influencer with a wholly-dormant audience gets an empty answer, and
    /// their posts reach everyone via pull-mode instead.
    pub async fn active_followers(
        &self,
        user: UserId,
        k: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<UserId>> {
        {
            let mut cache = self.active_followers.lock().unwrap(/* not held across await */);
            if let Some((followers, expiry)) = cache.get(&user) {
                if *expiry > Instant::now() {
                    return Ok(followers.iter().copied().take(k).collect());
                }
                cache.pop(&user);
            }
        }

        let mut scored: Vec<(f64, UserId)> = Vec::new();
        let mut offset = 0;
        loop {
            let page = self
                .follows
                .followers(user, offset, 1000)
                .await
                .context(FollowsSnafu)?;
            if page.is_empty() {
                break;
            }
            offset += page.len();
            for follower in &page {
                if let Some(row) = self.users.get(*follower).await.context(UserStoreSnafu)? {
                    if self.judge(&row, now) {
                        scored.push((row.activity_score, row.id));
                    }
                }
            }
            if offset >= FOLLOWER_SCAN_CAP {
                warn!(
                    "Follower scan for {} hit the cap at {}; the least-active tail goes pull-mode",
                    user, FOLLOWER_SCAN_CAP
                );
                break;
            }
        }
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        let followers: Vec<UserId> = scored.into_iter().map(|(_, id)| id).collect();
        self.active_followers.lock().unwrap(/* not held across await */).put(
            user,
            (
                followers.clone(),
                Instant::now() + self.config.activity.active_cache_ttl(),
            ),
        );
        Ok(followers.into_iter().take(k).collect())
    }

    /// Throw away the cached active-followers set for `user` (follow/unfollow churn)
    pub fn invalidate_followers(&self, user: UserId) {
        self.active_followers.lock().unwrap(/* not held across await */).pop(&user);
    }

    /// Apply decay to a user who has gone quiet, persisting the lowered score
    ///
    /// `record` decays lazily on the next action; this is for users with *no* next action, so
    /// that classification (& the caches keyed on it) eventually follows them down.
    pub async fn apply_decay(&self, user: UserId, now: DateTime<Utc>) -> Result<()> {
        let mut row = match self.users.get(user).await.context(UserStoreSnafu)? {
            Some(row) => row,
            None => return Ok(()),
        };
        if let Some(last) = row.last_active_at {
            let lowered = self.decayed(row.activity_score, now - last);
            if (row.activity_score - lowered).abs() > f64::EPSILON {
                row.activity_score = lowered;
                row.is_online = false;
                self.users.upsert(&row).await.context(UserStoreSnafu)?;
            }
        }
        Ok(())
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                         decay sweep                                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Periodically walk the owners of resident timelines & decay the quiet ones
///
/// The user store offers no enumeration (it's an external collaborator), but the set of users
/// whose *timelines* we're holding is exactly the set whose classification we care about, so the
/// sweep walks that. Runs until `shutdown` is notified; starts with a random jitter so a fleet of
/// nodes doesn't sweep in lock-step.
pub async fn decay_sweep(
    tracker: Arc<Tracker>,
    timelines: Arc<dyn timeline::Backend + Send + Sync>,
    interval: Duration,
    shutdown: Arc<Notify>,
) {
    use rand::Rng;
    let jitter = Duration::from_secs(rand::thread_rng().gen_range(0..interval.as_secs().max(1) / 10 + 1));
    tokio::select! {
        _ = tokio::time::sleep(jitter) => (),
        _ = shutdown.notified() => return,
    }
    loop {
        let now = Utc::now();
        match timelines.owners().await {
            Ok(owners) => {
                let count = owners.len();
                for owner in owners {
                    if let Err(err) = tracker.apply_decay(owner, now).await {
                        warn!("While decaying {}: {}", owner, err);
                    }
                }
                counter_add!(tracker.instruments, "activity.decay_sweeps", 1, &[]);
                info!("Activity decay sweep covered {} users", count);
            }
            Err(err) => warn!("Activity decay sweep couldn't list timelines: {}", err),
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
    use crate::memory::{MemoryFollows, MemoryUsers};
    use crate::storage::Follows as _;

    fn tracker(config: Configuration) -> (Arc<MemoryUsers>, Arc<MemoryFollows>, Tracker) {
        let users = Arc::new(MemoryUsers::new());
        let follows = Arc::new(MemoryFollows::new());
        let t = Tracker::new(
            users.clone(),
            follows.clone(),
            Arc::new(config),
            Arc::new(Instruments::new("fanline")),
        );
        (users, follows, t)
    }

    #[tokio::test]
    async fn scores_accumulate_and_clamp() {
        let (users, _, tracker) = tracker(Configuration::default());
        let id = UserId::new();
        users.upsert(&User::new(id)).await.unwrap();
        let now = Utc::now();
        let s1 = tracker.record(id, ActivityKind::Publish, now).await.unwrap();
        assert_eq!(s1, 15.0);
        // No time passes, so no decay: straight accumulation
        let s2 = tracker.record(id, ActivityKind::Comment, now).await.unwrap();
        assert_eq!(s2, 23.0);
        // No sequence of updates may exceed the maximum
        let mut score = s2;
        for _ in 0..200 {
            score = tracker.record(id, ActivityKind::Publish, now).await.unwrap();
        }
        assert_eq!(score, Configuration::default().activity.max_score);
    }

    #[tokio::test]
    async fn decay_halves_life_per_day_at_factor() {
        let (users, _, tracker) = tracker(Configuration::default());
        let id = UserId::new();
        let day_ago = Utc::now() - chrono::Duration::days(1);
        let mut row = User::new(id);
        row.activity_score = 100.0;
        row.last_active_at = Some(day_ago);
        users.upsert(&row).await.unwrap();
        let now = Utc::now();
        let score = tracker.record(id, ActivityKind::ViewFeed, now).await.unwrap();
        // 100 * 0.9^1 + 1, modulo a sliver of wall-clock drift
        assert!((score - 91.0).abs() < 0.1, "got {}", score);
    }

    #[tokio::test]
    async fn unknown_users_are_an_input_error() {
        let (_, _, tracker) = tracker(Configuration::default());
        assert!(matches!(
            tracker
                .record(UserId::new(), ActivityKind::Login, Utc::now())
                .await,
            Err(Error::UnknownUser { .. })
        ));
    }

    #[tokio::test]
    async fn predicate_considers_score_window_and_online() {
        let (users, _, tracker) = tracker(Configuration::default());
        let now = Utc::now();

        // High score, long quiet: active
        let high = UserId::new();
        let mut row = User::new(high);
        row.activity_score = 80.0;
        row.last_active_at = Some(now - chrono::Duration::days(30));
        users.upsert(&row).await.unwrap();
        assert!(tracker.is_active(high, now).await.unwrap());

        // Low score, seen yesterday: active (inside the 7-day window)
        let recent = UserId::new();
        let mut row = User::new(recent);
        row.activity_score = 1.0;
        row.last_active_at = Some(now - chrono::Duration::days(1));
        users.upsert(&row).await.unwrap();
        assert!(tracker.is_active(recent, now).await.unwrap());

        // Low score, long quiet: inactive
        let quiet = UserId::new();
        let mut row = User::new(quiet);
        row.activity_score = 1.0;
        row.last_active_at = Some(now - chrono::Duration::days(30));
        users.upsert(&row).await.unwrap();
        assert!(!tracker.is_active(quiet, now).await.unwrap());

        // Nobody we've never heard of is active
        assert!(!tracker.is_active(UserId::new(), now).await.unwrap());
    }

    #[tokio::test]
    async fn active_followers_prefers_highest_scores() {
        let (users, follows, tracker) = tracker(Configuration::default());
        let now = Utc::now();
        let influencer = UserId::new();
        users.upsert(&User::new(influencer)).await.unwrap();

        let mut expected = Vec::new();
        for score in [90.0_f64, 70.0, 80.0, 10.0] {
            let follower = UserId::new();
            let mut row = User::new(follower);
            row.activity_score = score;
            row.last_active_at = Some(now); // everyone recently seen
            users.upsert(&row).await.unwrap();
            follows
                .add_edge(&crate::entities::FollowEdge {
                    follower,
                    followee: influencer,
                    created_at: now,
                    is_active: true,
                })
                .await
                .unwrap();
            expected.push((score, follower));
        }
        expected.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap());

        let top2 = tracker.active_followers(influencer, 2, now).await.unwrap();
        assert_eq!(top2, vec![expected[0].1, expected[1].1]);
        // Served from cache the second time around (same answer either way)
        assert_eq!(
            tracker.active_followers(influencer, 2, now).await.unwrap(),
            top2
        );
    }
}
