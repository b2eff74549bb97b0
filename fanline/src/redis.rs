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

//! # Redis backends
//!
//! ## Introduction
//!
//! The production implementations of the timeline store & the distribution ledger, on Redis.
//!
//! Timelines are sorted sets (`{prefix}:timeline:{user}`) whose members are post ids scored by
//! publish epoch-- which is exactly what makes fan-out idempotent: `ZADD` of a member already
//! present is a no-op but for the score, and the score of a given post never changes. A fan-out
//! slice is one pipelined round-trip: per owner, `ZADD` + `ZREMRANGEBYRANK` (the size cap) +
//! `EXPIRE` (the TTL refresh). Wall-clock cost of pushing to a thousand followers is one RTT.
//!
//! The ledger keeps each record as a JSON string (`{prefix}:dist:{post}`, TTL'd), with two sorted
//! sets (`…:dist:pending`, `…:dist:done`) scored by epoch serving as the scan indices. Recovery
//! never has to walk the key space.
//!
//! ## Key layout
//!
//! - `{prefix}:timeline:{user}` -- sorted set, post id by publish epoch
//! - `{prefix}:receivers:{post}` -- set, owners written during fan-out (reverse index for delete)
//! - `{prefix}:dist:{post}` -- string, JSON [Record]
//! - `{prefix}:dist:pending` -- sorted set, post id by `started_at` epoch
//! - `{prefix}:dist:done` -- sorted set, post id by completion epoch

use std::time::Duration;

use chrono::{DateTime, Utc};
use redis::{aio::ConnectionManager, AsyncCommands, Client};
use snafu::{prelude::*, Backtrace};
use tap::Pipe;
use tracing::{info, warn};

use crate::{
    entities::{PostId, UserId},
    ledger::{self, Record, Stats, Status},
    timeline::{self, Cursor, TimelineEntry},
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("The {op} command failed: {source}"))]
    Command {
        op: &'static str,
        source: redis::RedisError,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to connect to Redis at {url}: {source}"))]
    Connect {
        url: String,
        source: redis::RedisError,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to deserialize a ledger record: {source}"))]
    RecordDe {
        source: serde_json::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to serialize a ledger record: {source}"))]
    RecordSer {
        source: serde_json::Error,
        backtrace: Backtrace,
    },
}

type Result<T> = std::result::Result<T, Error>;

type TimelineResult<T> = std::result::Result<T, timeline::Error>;

type LedgerResult<T> = std::result::Result<T, ledger::Error>;

// EXPIRE takes seconds; round sub-second TTLs up so "a short TTL" never means "no TTL"
fn ttl_secs(ttl: Duration) -> i64 {
    (ttl.as_secs() as i64).max(1)
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                      timeline store                                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Redis-backed [timeline::Backend]
pub struct RedisTimelines {
    conn: ConnectionManager,
    key_prefix: String,
}

impl RedisTimelines {
    pub async fn new(url: &str, key_prefix: &str) -> Result<RedisTimelines> {
        let client = Client::open(url).context(ConnectSnafu { url })?;
        let conn = ConnectionManager::new(client)
            .await
            .context(ConnectSnafu { url })?;
        info!(url = %url, "Connected to Redis (timelines)");
        Ok(RedisTimelines {
            conn,
            key_prefix: key_prefix.to_owned(),
        })
    }
    fn timeline_key(&self, owner: UserId) -> String {
        format!("{}:timeline:{}", self.key_prefix, owner.to_raw_string())
    }
    fn receivers_key(&self, post: PostId) -> String {
        format!("{}:receivers:{}", self.key_prefix, post.to_raw_string())
    }
    // Queue the add-evict-refresh triple for one owner onto `pipe`
    fn push_add(&self, pipe: &mut redis::Pipeline, owner: UserId, post: PostId, score: i64,
                cap: usize, ttl: Duration) {
        let key = self.timeline_key(owner);
        pipe.zadd(&key, post.to_raw_string(), score).ignore();
        pipe.zremrangebyrank(&key, 0, -(cap as isize) - 1).ignore();
        pipe.expire(&key, ttl_secs(ttl)).ignore();
    }
}

#[async_trait::async_trait]
impl timeline::Backend for RedisTimelines {
    async fn add(
        &self,
        owner: UserId,
        post: PostId,
        score: i64,
        cap: usize,
        ttl: Duration,
    ) -> TimelineResult<()> {
        let mut pipe = redis::pipe();
        self.push_add(&mut pipe, owner, post, score, cap, ttl);
        let mut conn = self.conn.clone();
        pipe.query_async::<()>(&mut conn)
            .await
            .context(CommandSnafu { op: "ZADD" })
            .map_err(timeline::Error::new)
    }
    async fn add_batch(
        &self,
        owners: &[UserId],
        post: PostId,
        score: i64,
        cap: usize,
        ttl: Duration,
    ) -> TimelineResult<()> {
        if owners.is_empty() {
            return Ok(());
        }
        let mut pipe = redis::pipe();
        for owner in owners {
            self.push_add(&mut pipe, *owner, post, score, cap, ttl);
        }
        let mut conn = self.conn.clone();
        pipe.query_async::<()>(&mut conn)
            .await
            .context(CommandSnafu { op: "ZADD (batch)" })
            .map_err(timeline::Error::new)
    }
    async fn remove(&self, owner: UserId, post: PostId) -> TimelineResult<()> {
        let mut conn = self.conn.clone();
        conn.zrem::<_, _, ()>(self.timeline_key(owner), post.to_raw_string())
            .await
            .context(CommandSnafu { op: "ZREM" })
            .map_err(timeline::Error::new)
    }
    async fn range_before(
        &self,
        owner: UserId,
        cursor: Cursor,
        limit: usize,
    ) -> TimelineResult<Vec<TimelineEntry>> {
        let mut conn = self.conn.clone();
        // "(cursor" makes the upper bound exclusive; one extra entry is the has_more signal
        let raw: Vec<(String, i64)> = conn
            .zrevrangebyscore_limit_withscores(
                self.timeline_key(owner),
                format!("({}", cursor.epoch()),
                "-inf",
                0,
                (limit + 1) as isize,
            )
            .await
            .context(CommandSnafu {
                op: "ZREVRANGEBYSCORE",
            })
            .map_err(timeline::Error::new)?;
        Ok(raw
            .into_iter()
            .filter_map(|(member, score)| match PostId::from_raw_string(&member) {
                Ok(post) => Some(TimelineEntry { post, score }),
                Err(_) => {
                    warn!("Dropping unparseable timeline member {:?}", member);
                    None
                }
            })
            .collect())
    }
    async fn size(&self, owner: UserId) -> TimelineResult<usize> {
        let mut conn = self.conn.clone();
        conn.zcard::<_, usize>(self.timeline_key(owner))
            .await
            .context(CommandSnafu { op: "ZCARD" })
            .map_err(timeline::Error::new)
    }
    async fn contains(&self, owner: UserId, post: PostId) -> TimelineResult<bool> {
        let mut conn = self.conn.clone();
        conn.zscore::<_, _, Option<i64>>(self.timeline_key(owner), post.to_raw_string())
            .await
            .context(CommandSnafu { op: "ZSCORE" })
            .map_err(timeline::Error::new)
            .map(|score| score.is_some())
    }
    async fn trim(&self, owner: UserId, keep: usize) -> TimelineResult<()> {
        let mut conn = self.conn.clone();
        conn.zremrangebyrank::<_, ()>(self.timeline_key(owner), 0, -(keep as isize) - 1)
            .await
            .context(CommandSnafu {
                op: "ZREMRANGEBYRANK",
            })
            .map_err(timeline::Error::new)
    }
    async fn oldest_score(&self, owner: UserId) -> TimelineResult<Option<i64>> {
        let mut conn = self.conn.clone();
        let raw: Vec<(String, i64)> = conn
            .zrange_withscores(self.timeline_key(owner), 0, 0)
            .await
            .context(CommandSnafu { op: "ZRANGE" })
            .map_err(timeline::Error::new)?;
        raw.first().map(|(_, score)| *score).pipe(Ok)
    }
    async fn clear(&self, owner: UserId) -> TimelineResult<()> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(self.timeline_key(owner))
            .await
            .context(CommandSnafu { op: "DEL" })
            .map_err(timeline::Error::new)
    }
    async fn set_ttl(&self, owner: UserId, ttl: Duration) -> TimelineResult<()> {
        let mut conn = self.conn.clone();
        conn.expire::<_, ()>(self.timeline_key(owner), ttl_secs(ttl))
            .await
            .context(CommandSnafu { op: "EXPIRE" })
            .map_err(timeline::Error::new)
    }
    async fn rebuild(
        &self,
        owner: UserId,
        entries: &[TimelineEntry],
        ttl: Duration,
    ) -> TimelineResult<()> {
        let key = self.timeline_key(owner);
        let mut pipe = redis::pipe();
        pipe.del(&key).ignore();
        if !entries.is_empty() {
            let members: Vec<(i64, String)> = entries
                .iter()
                .map(|e| (e.score, e.post.to_raw_string()))
                .collect();
            pipe.zadd_multiple(&key, &members).ignore();
            pipe.expire(&key, ttl_secs(ttl)).ignore();
        }
        let mut conn = self.conn.clone();
        pipe.query_async::<()>(&mut conn)
            .await
            .context(CommandSnafu { op: "rebuild" })
            .map_err(timeline::Error::new)
    }
    async fn owners(&self) -> TimelineResult<Vec<UserId>> {
        let mut conn = self.conn.clone();
        let pattern = format!("{}:timeline:*", self.key_prefix);
        let prefix_len = pattern.len() - 1;
        let keys: Vec<String> = {
            let mut iter = conn
                .scan_match::<_, String>(&pattern)
                .await
                .context(CommandSnafu { op: "SCAN" })
                .map_err(timeline::Error::new)?;
            let mut keys = Vec::new();
            while let Some(key) = iter.next_item().await {
                keys.push(key);
            }
            keys
        };
        Ok(keys
            .into_iter()
            .filter_map(|key| UserId::from_raw_string(&key[prefix_len..]).ok())
            .collect())
    }
    async fn record_receivers(
        &self,
        post: PostId,
        owners: &[UserId],
        ttl: Duration,
    ) -> TimelineResult<()> {
        if owners.is_empty() {
            return Ok(());
        }
        let key = self.receivers_key(post);
        let members: Vec<String> = owners.iter().map(|o| o.to_raw_string()).collect();
        let mut pipe = redis::pipe();
        pipe.sadd(&key, &members).ignore();
        pipe.expire(&key, ttl_secs(ttl)).ignore();
        let mut conn = self.conn.clone();
        pipe.query_async::<()>(&mut conn)
            .await
            .context(CommandSnafu { op: "SADD" })
            .map_err(timeline::Error::new)
    }
    async fn drain_receivers(&self, post: PostId) -> TimelineResult<Vec<UserId>> {
        let key = self.receivers_key(post);
        let mut conn = self.conn.clone();
        let members: Vec<String> = conn
            .smembers(&key)
            .await
            .context(CommandSnafu { op: "SMEMBERS" })
            .map_err(timeline::Error::new)?;
        conn.del::<_, ()>(&key)
            .await
            .context(CommandSnafu { op: "DEL" })
            .map_err(timeline::Error::new)?;
        Ok(members
            .into_iter()
            .filter_map(|m| UserId::from_raw_string(&m).ok())
            .collect())
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                            ledger                                              //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Redis-backed [ledger::Backend]
pub struct RedisLedger {
    conn: ConnectionManager,
    key_prefix: String,
}

impl RedisLedger {
    pub async fn new(url: &str, key_prefix: &str) -> Result<RedisLedger> {
        let client = Client::open(url).context(ConnectSnafu { url })?;
        let conn = ConnectionManager::new(client)
            .await
            .context(ConnectSnafu { url })?;
        info!(url = %url, "Connected to Redis (ledger)");
        Ok(RedisLedger {
            conn,
            key_prefix: key_prefix.to_owned(),
        })
    }
    fn record_key(&self, post: PostId) -> String {
        format!("{}:dist:{}", self.key_prefix, post.to_raw_string())
    }
    fn pending_key(&self) -> String {
        format!("{}:dist:pending", self.key_prefix)
    }
    fn done_key(&self) -> String {
        format!("{}:dist:done", self.key_prefix)
    }
    async fn fetch(&self, post: PostId) -> Result<Option<Record>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn
            .get(self.record_key(post))
            .await
            .context(CommandSnafu { op: "GET" })?;
        raw.map(|text| serde_json::from_str::<Record>(&text).context(RecordDeSnafu))
            .transpose()
    }
}

#[async_trait::async_trait]
impl ledger::Backend for RedisLedger {
    async fn put(&self, record: &Record, ttl: Duration) -> LedgerResult<()> {
        let text = serde_json::to_string(record)
            .context(RecordSerSnafu)
            .map_err(ledger::Error::new)?;
        let mut pipe = redis::pipe();
        pipe.set_ex(self.record_key(record.post_id), text, ttl_secs(ttl) as u64)
            .ignore();
        match record.status {
            Status::Completed => {
                pipe.zadd(
                    self.done_key(),
                    record.post_id.to_raw_string(),
                    record.started_at.timestamp(),
                )
                .ignore();
            }
            _ => {
                pipe.zadd(
                    self.pending_key(),
                    record.post_id.to_raw_string(),
                    record.started_at.timestamp(),
                )
                .ignore();
            }
        }
        let mut conn = self.conn.clone();
        pipe.query_async::<()>(&mut conn)
            .await
            .context(CommandSnafu { op: "SET (ledger)" })
            .map_err(ledger::Error::new)
    }
    async fn get(&self, post: PostId) -> LedgerResult<Option<Record>> {
        self.fetch(post).await.map_err(ledger::Error::new)
    }
    async fn complete(
        &self,
        post: PostId,
        at: DateTime<Utc>,
        ttl: Duration,
    ) -> LedgerResult<()> {
        let record = match self.fetch(post).await.map_err(ledger::Error::new)? {
            Some(mut record) => {
                record.status = Status::Completed;
                record.started_at = at;
                record
            }
            // Record expired or was deleted under us; completing a ghost is a no-op
            None => {
                let mut conn = self.conn.clone();
                return conn
                    .zrem::<_, _, ()>(self.pending_key(), post.to_raw_string())
                    .await
                    .context(CommandSnafu { op: "ZREM" })
                    .map_err(ledger::Error::new);
            }
        };
        let text = serde_json::to_string(&record)
            .context(RecordSerSnafu)
            .map_err(ledger::Error::new)?;
        let mut pipe = redis::pipe();
        pipe.set_ex(self.record_key(post), text, ttl_secs(ttl) as u64)
            .ignore();
        pipe.zrem(self.pending_key(), post.to_raw_string()).ignore();
        pipe.zadd(self.done_key(), post.to_raw_string(), at.timestamp())
            .ignore();
        let mut conn = self.conn.clone();
        pipe.query_async::<()>(&mut conn)
            .await
            .context(CommandSnafu { op: "complete" })
            .map_err(ledger::Error::new)
    }
    async fn delete(&self, post: PostId) -> LedgerResult<()> {
        let mut pipe = redis::pipe();
        pipe.del(self.record_key(post)).ignore();
        pipe.zrem(self.pending_key(), post.to_raw_string()).ignore();
        pipe.zrem(self.done_key(), post.to_raw_string()).ignore();
        let mut conn = self.conn.clone();
        pipe.query_async::<()>(&mut conn)
            .await
            .context(CommandSnafu { op: "DEL (ledger)" })
            .map_err(ledger::Error::new)
    }
    async fn scan_pending(
        &self,
        older_than: DateTime<Utc>,
        limit: usize,
    ) -> LedgerResult<Vec<Record>> {
        let mut conn = self.conn.clone();
        let members: Vec<String> = conn
            .zrangebyscore_limit(
                self.pending_key(),
                "-inf",
                older_than.timestamp(),
                0,
                limit as isize,
            )
            .await
            .context(CommandSnafu { op: "ZRANGEBYSCORE" })
            .map_err(ledger::Error::new)?;
        let mut records = Vec::with_capacity(members.len());
        for member in members {
            let post = match PostId::from_raw_string(&member) {
                Ok(post) => post,
                Err(_) => {
                    warn!("Dropping unparseable pending-index member {:?}", member);
                    continue;
                }
            };
            match self.fetch(post).await.map_err(ledger::Error::new)? {
                Some(record) => records.push(record),
                // The record string expired out from under its index entry; tidy up
                None => {
                    conn.zrem::<_, _, ()>(self.pending_key(), &member)
                        .await
                        .context(CommandSnafu { op: "ZREM" })
                        .map_err(ledger::Error::new)?;
                }
            }
        }
        Ok(records)
    }
    async fn stats(&self, now: DateTime<Utc>, timeout: chrono::Duration) -> LedgerResult<Stats> {
        let mut conn = self.conn.clone();
        let cutoff = (now - timeout).timestamp();
        let stuck: u64 = conn
            .zcount(self.pending_key(), "-inf", cutoff)
            .await
            .context(CommandSnafu { op: "ZCOUNT" })
            .map_err(ledger::Error::new)?;
        let pending: u64 = conn
            .zcount(self.pending_key(), format!("({}", cutoff), "+inf")
            .await
            .context(CommandSnafu { op: "ZCOUNT" })
            .map_err(ledger::Error::new)?;
        let completed: u64 = conn
            .zcard(self.done_key())
            .await
            .context(CommandSnafu { op: "ZCARD" })
            .map_err(ledger::Error::new)?;
        Ok(Stats {
            pending,
            completed,
            stuck,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn sub_second_ttls_round_up() {
        assert_eq!(ttl_secs(Duration::from_millis(250)), 1);
        assert_eq!(ttl_secs(Duration::from_secs(7200)), 7200);
    }

    #[test]
    fn key_layout() {
        let user = UserId::new();
        // Keys are derived from the *simple* uuid form: no hyphens to fight over in key parsing
        assert!(!user.to_raw_string().contains('-'));
        assert_eq!(
            Utc.timestamp_opt(0, 0).unwrap().timestamp(),
            0 // pin the epoch convention the scores rely on
        );
    }
}
