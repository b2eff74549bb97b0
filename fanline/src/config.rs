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

//! # configuration
//!
//! fanline configuration is read once at startup (TOML), deserialized into the immutable
//! [Configuration] struct and shared by reference thereafter. Every knob has a default, so an
//! empty file (or no file at all) yields a working single-node setup. Durations are expressed in
//! the unit named by the key (`-secs`, `-hours`, `-days`)-- I find that less error-prone in a
//! config file than serde's `{ secs, nanos }` encoding of a `Duration`.

use std::time::Duration;

use serde::Deserialize;

/// Knobs governing the distributor & the feed read path
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    /// Authors with no more than this many followers get push-to-all; beyond it, push-to-active
    #[serde(rename = "push-threshold")]
    pub push_threshold: i64,
    /// Upper bound on the number of followers fetched for a push-to-all fan-out
    #[serde(rename = "max-feed-size")]
    pub max_feed_size: usize,
    /// How many active followers an influencer's post is pushed to
    #[serde(rename = "hot-active-limit")]
    pub hot_active_limit: usize,
    /// Default timeline TTL, used when no class policy applies
    #[serde(rename = "cache-ttl-secs")]
    pub cache_ttl_secs: u64,
    /// Period of the post-score rescan pass
    #[serde(rename = "rank-update-interval-secs")]
    pub rank_update_interval_secs: u64,
}

impl Default for FeedConfig {
    fn default() -> Self {
        FeedConfig {
            push_threshold: 5000,
            max_feed_size: 5000,
            hot_active_limit: 1000,
            cache_ttl_secs: 86400,
            rank_update_interval_secs: 3600,
        }
    }
}

impl FeedConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
    pub fn rank_update_interval(&self) -> Duration {
        Duration::from_secs(self.rank_update_interval_secs)
    }
}

/// Cache policy for one user class (timeline lifetime & size cap)
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ClassPolicy {
    pub cache_hours: u64,
    pub max_items: usize,
}

impl ClassPolicy {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.cache_hours * 3600)
    }
}

/// Policy for active users; also carries the activeness score threshold
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ActiveConfig {
    #[serde(rename = "score-threshold")]
    pub score_threshold: f64,
    #[serde(rename = "cache-hours")]
    pub cache_hours: u64,
    #[serde(rename = "max-items")]
    pub max_items: usize,
}

impl Default for ActiveConfig {
    fn default() -> Self {
        ActiveConfig {
            score_threshold: 50.0,
            cache_hours: 7 * 24,
            max_items: 1000,
        }
    }
}

impl ActiveConfig {
    pub fn policy(&self) -> ClassPolicy {
        ClassPolicy {
            cache_hours: self.cache_hours,
            max_items: self.max_items,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct InactiveConfig {
    #[serde(rename = "cache-hours")]
    pub cache_hours: u64,
    #[serde(rename = "max-items")]
    pub max_items: usize,
}

impl Default for InactiveConfig {
    fn default() -> Self {
        InactiveConfig {
            cache_hours: 2,
            max_items: 200,
        }
    }
}

impl InactiveConfig {
    pub fn policy(&self) -> ClassPolicy {
        ClassPolicy {
            cache_hours: self.cache_hours,
            max_items: self.max_items,
        }
    }
}

/// Policy for VIPs; also defines the VIP predicate (a follower-count threshold)
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct VipConfig {
    #[serde(rename = "follower-threshold")]
    pub follower_threshold: i64,
    #[serde(rename = "cache-hours")]
    pub cache_hours: u64,
    #[serde(rename = "max-items")]
    pub max_items: usize,
}

impl Default for VipConfig {
    fn default() -> Self {
        VipConfig {
            follower_threshold: 100_000,
            cache_hours: 30 * 24,
            max_items: 2000,
        }
    }
}

impl VipConfig {
    pub fn policy(&self) -> ClassPolicy {
        ClassPolicy {
            cache_hours: self.cache_hours,
            max_items: self.max_items,
        }
    }
}

/// Knobs governing the recovery scanner
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    #[serde(rename = "check-interval-secs")]
    pub check_interval_secs: u64,
    /// A distribution still not `completed` after this long is considered stuck
    #[serde(rename = "task-timeout-secs")]
    pub task_timeout_secs: u64,
    /// How long completed/stuck records are retained for inspection
    #[serde(rename = "retention-hours")]
    pub retention_hours: u64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        RecoveryConfig {
            check_interval_secs: 300,
            task_timeout_secs: 300,
            retention_hours: 24,
        }
    }
}

impl RecoveryConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }
    pub fn task_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.task_timeout_secs as i64)
    }
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_hours * 3600)
    }
}

/// Knobs governing the periodic cache sweep
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct CleanupConfig {
    #[serde(rename = "interval-secs")]
    pub interval_secs: u64,
    #[serde(rename = "batch-size")]
    pub batch_size: usize,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        CleanupConfig {
            interval_secs: 3600,
            batch_size: 500,
        }
    }
}

impl CleanupConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// Knobs governing the activity tracker
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ActivityConfig {
    /// Per-day decay multiplier applied to the score between updates
    #[serde(rename = "decay-factor")]
    pub decay_factor: f64,
    /// Period of the background decay pass over quiet users
    #[serde(rename = "interval-hours")]
    pub interval_hours: u64,
    #[serde(rename = "max-score")]
    pub max_score: f64,
    /// Lifetime of the online flag
    #[serde(rename = "online-ttl-secs")]
    pub online_ttl_secs: u64,
    /// A user active within this window is considered active regardless of score
    #[serde(rename = "active-window-days")]
    pub active_window_days: i64,
    /// Lifetime of a cached activeness verdict (and of a cached active-followers set)
    #[serde(rename = "active-cache-secs")]
    pub active_cache_secs: u64,
}

impl Default for ActivityConfig {
    fn default() -> Self {
        ActivityConfig {
            decay_factor: 0.9,
            interval_hours: 24,
            max_score: 1000.0,
            online_ttl_secs: 900,
            active_window_days: 7,
            active_cache_secs: 300,
        }
    }
}

impl ActivityConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_hours * 3600)
    }
    pub fn online_ttl(&self) -> Duration {
        Duration::from_secs(self.online_ttl_secs)
    }
    pub fn active_window(&self) -> chrono::Duration {
        chrono::Duration::days(self.active_window_days)
    }
    pub fn active_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.active_cache_secs)
    }
}

/// Knobs governing the timeline store
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct TimelineConfig {
    /// Default per-owner size cap, used when no class policy applies
    #[serde(rename = "max-items")]
    pub max_items: usize,
    /// On `follow_created`, how many of the followee's recent posts are back-filled
    #[serde(rename = "follow-backfill")]
    pub follow_backfill: usize,
    /// Pull-mode reads at most this many followees
    #[serde(rename = "pull-followee-cap")]
    pub pull_followee_cap: usize,
}

impl Default for TimelineConfig {
    fn default() -> Self {
        TimelineConfig {
            max_items: 1000,
            follow_backfill: 50,
            pull_followee_cap: 1000,
        }
    }
}

/// Knobs governing the event consumer
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    /// Back-pressure: stop pulling from the bus beyond this many in-flight events
    #[serde(rename = "max-in-flight")]
    pub max_in_flight: usize,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        ConsumerConfig { max_in_flight: 500 }
    }
}

/// Where to find the sorted-set service; absent means "use the in-memory backends"
#[derive(Clone, Debug, Deserialize)]
pub struct RedisConfig {
    pub url: String,
    #[serde(rename = "key-prefix", default = "default_key_prefix")]
    pub key_prefix: String,
}

fn default_key_prefix() -> String {
    "fanline".to_owned()
}

/// The whole of fanline's configuration
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct Configuration {
    #[serde(rename = "log-filter")]
    pub log_filter: Option<String>,
    pub feed: FeedConfig,
    pub active: ActiveConfig,
    pub inactive: InactiveConfig,
    pub vip: VipConfig,
    pub recovery: RecoveryConfig,
    pub cleanup: CleanupConfig,
    pub activity: ActivityConfig,
    pub timeline: TimelineConfig,
    pub consumer: ConsumerConfig,
    pub redis: Option<RedisConfig>,
}
