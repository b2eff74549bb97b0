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

//! # In-memory backends
//!
//! ## Introduction
//!
//! Every seam in fanline (posts, follows, users, timelines, ledger, bus) has an in-memory
//! implementation here. These aren't mocks tucked away in test modules: the daemon runs on them in
//! standalone mode (no `[redis]` section in the configuration), the integration tests drive the
//! whole service over them, and they double as executable documentation of each trait's contract.
//! The price is that everything is process-local; the payoff is a full fanline stack that needs
//! nothing but the binary.
//!
//! Locking is coarse (one `RwLock` around each store) which is fine at the scale these run at. TTL
//! bookkeeping is lazy: expiry is checked on access rather than by a reaper task.

use std::{
    collections::{BTreeSet, HashMap, HashSet},
    hash::{Hash, Hasher},
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use itertools::Itertools;
use tokio::sync::RwLock;

use crate::{
    entities::{FollowEdge, Post, PostId, User, UserId},
    events::{Consumer, Delivery, Envelope, Producer},
    ledger::{self, Record, Stats, Status},
    storage::{self, Follows, Posts, Users},
    timeline::{self, Cursor, TimelineEntry},
};

type StorageResult<T> = std::result::Result<T, storage::Error>;
type TimelineResult<T> = std::result::Result<T, timeline::Error>;
type LedgerResult<T> = std::result::Result<T, ledger::Error>;
type EventsResult<T> = std::result::Result<T, crate::events::Error>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           post store                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// In-memory [Posts] implementation
#[derive(Default)]
pub struct MemoryPosts {
    posts: RwLock<HashMap<PostId, Post>>,
}

impl MemoryPosts {
    pub fn new() -> MemoryPosts {
        MemoryPosts::default()
    }
}

#[async_trait]
impl Posts for MemoryPosts {
    async fn create(&self, post: &Post) -> StorageResult<()> {
        self.posts.write().await.insert(post.id, post.clone());
        Ok(())
    }
    async fn get(&self, id: PostId) -> StorageResult<Option<Post>> {
        Ok(self.posts.read().await.get(&id).cloned())
    }
    async fn get_many(&self, ids: &[PostId]) -> StorageResult<Vec<Post>> {
        let posts = self.posts.read().await;
        Ok(ids.iter().filter_map(|id| posts.get(id).cloned()).collect())
    }
    async fn list_by_author(
        &self,
        author: UserId,
        offset: usize,
        limit: usize,
    ) -> StorageResult<Vec<Post>> {
        let posts = self.posts.read().await;
        Ok(posts
            .values()
            .filter(|p| p.author_id == author && !p.is_deleted)
            .sorted_by(|a, b| b.created_at.cmp(&a.created_at))
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }
    async fn list_by_authors(
        &self,
        authors: &[UserId],
        cursor: Option<DateTime<Utc>>,
        limit: usize,
    ) -> StorageResult<Vec<Post>> {
        let wanted: HashSet<UserId> = authors.iter().copied().collect();
        let posts = self.posts.read().await;
        Ok(posts
            .values()
            .filter(|p| {
                wanted.contains(&p.author_id)
                    && !p.is_deleted
                    && cursor.map(|c| p.created_at < c).unwrap_or(true)
            })
            .sorted_by(|a, b| b.created_at.cmp(&a.created_at))
            .take(limit)
            .cloned()
            .collect())
    }
    async fn soft_delete(&self, id: PostId) -> StorageResult<bool> {
        match self.posts.write().await.get_mut(&id) {
            Some(post) => {
                post.is_deleted = true;
                post.updated_at = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }
    async fn add_counters(
        &self,
        id: PostId,
        likes: i64,
        comments: i64,
        shares: i64,
    ) -> StorageResult<()> {
        if let Some(post) = self.posts.write().await.get_mut(&id) {
            post.like_count = (post.like_count + likes).max(0);
            post.comment_count = (post.comment_count + comments).max(0);
            post.share_count = (post.share_count + shares).max(0);
            post.updated_at = Utc::now();
        }
        Ok(())
    }
    async fn update_score(&self, id: PostId, score: f64) -> StorageResult<()> {
        if let Some(post) = self.posts.write().await.get_mut(&id) {
            post.score = score;
        }
        Ok(())
    }
    async fn search(&self, query: &str, offset: usize, limit: usize) -> StorageResult<Vec<Post>> {
        // Naive substring match; a real store brings its own full-text machinery
        let posts = self.posts.read().await;
        Ok(posts
            .values()
            .filter(|p| !p.is_deleted && p.body.as_ref().contains(query))
            .sorted_by(|a, b| b.created_at.cmp(&a.created_at))
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          follow store                                          //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// In-memory [Follows] implementation
#[derive(Default)]
pub struct MemoryFollows {
    edges: RwLock<HashMap<(UserId, UserId), FollowEdge>>,
}

impl MemoryFollows {
    pub fn new() -> MemoryFollows {
        MemoryFollows::default()
    }
}

#[async_trait]
impl Follows for MemoryFollows {
    async fn followers(
        &self,
        user: UserId,
        offset: usize,
        limit: usize,
    ) -> StorageResult<Vec<UserId>> {
        let edges = self.edges.read().await;
        let mut hits: Vec<&FollowEdge> = edges
            .values()
            .filter(|e| e.followee == user && e.is_active)
            .collect();
        hits.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(hits
            .into_iter()
            .skip(offset)
            .take(limit)
            .map(|e| e.follower)
            .collect())
    }
    async fn followees(
        &self,
        user: UserId,
        offset: usize,
        limit: usize,
    ) -> StorageResult<Vec<UserId>> {
        let edges = self.edges.read().await;
        let mut hits: Vec<&FollowEdge> = edges
            .values()
            .filter(|e| e.follower == user && e.is_active)
            .collect();
        hits.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(hits
            .into_iter()
            .skip(offset)
            .take(limit)
            .map(|e| e.followee)
            .collect())
    }
    async fn count_followers(&self, user: UserId) -> StorageResult<i64> {
        let edges = self.edges.read().await;
        Ok(edges
            .values()
            .filter(|e| e.followee == user && e.is_active)
            .count() as i64)
    }
    async fn count_followees(&self, user: UserId) -> StorageResult<i64> {
        let edges = self.edges.read().await;
        Ok(edges
            .values()
            .filter(|e| e.follower == user && e.is_active)
            .count() as i64)
    }
    async fn add_edge(&self, edge: &FollowEdge) -> StorageResult<bool> {
        let mut edges = self.edges.write().await;
        let key = (edge.follower, edge.followee);
        match edges.get(&key) {
            Some(existing) if existing.is_active => Ok(false),
            _ => {
                edges.insert(key, edge.clone());
                Ok(true)
            }
        }
    }
    async fn remove_edge(&self, follower: UserId, followee: UserId) -> StorageResult<bool> {
        Ok(self
            .edges
            .write()
            .await
            .remove(&(follower, followee))
            .is_some())
    }
    async fn exists(&self, follower: UserId, followee: UserId) -> StorageResult<bool> {
        let edges = self.edges.read().await;
        Ok(edges
            .get(&(follower, followee))
            .map(|e| e.is_active)
            .unwrap_or(false))
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           user store                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// In-memory [Users] implementation
#[derive(Default)]
pub struct MemoryUsers {
    users: RwLock<HashMap<UserId, User>>,
}

impl MemoryUsers {
    pub fn new() -> MemoryUsers {
        MemoryUsers::default()
    }
}

#[async_trait]
impl Users for MemoryUsers {
    async fn get(&self, id: UserId) -> StorageResult<Option<User>> {
        Ok(self.users.read().await.get(&id).cloned())
    }
    async fn upsert(&self, user: &User) -> StorageResult<()> {
        self.users.write().await.insert(user.id, user.clone());
        Ok(())
    }
    async fn add_follower_count(&self, id: UserId, delta: i64) -> StorageResult<()> {
        if let Some(user) = self.users.write().await.get_mut(&id) {
            user.follower_count = (user.follower_count + delta).max(0);
        }
        Ok(())
    }
    async fn add_following_count(&self, id: UserId, delta: i64) -> StorageResult<()> {
        if let Some(user) = self.users.write().await.get_mut(&id) {
            user.following_count = (user.following_count + delta).max(0);
        }
        Ok(())
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                        timeline store                                          //
////////////////////////////////////////////////////////////////////////////////////////////////////

// One user's sorted set. `by_score` is ascending (oldest first); `members` gives O(1) membership
// & the current score for a post, which is what keeps insertion idempotent.
#[derive(Default)]
struct Zset {
    by_score: BTreeSet<(i64, PostId)>,
    members: HashMap<PostId, i64>,
    expires_at: Option<Instant>,
}

impl Zset {
    fn insert(&mut self, post: PostId, score: i64) {
        if let Some(old) = self.members.insert(post, score) {
            self.by_score.remove(&(old, post));
        }
        self.by_score.insert((score, post));
    }
    fn remove(&mut self, post: PostId) {
        if let Some(old) = self.members.remove(&post) {
            self.by_score.remove(&(old, post));
        }
    }
    fn evict_to(&mut self, keep: usize) {
        while self.members.len() > keep {
            // unwrap is fine: len > keep >= 0 means the set is non-empty
            let oldest = *self.by_score.iter().next().unwrap();
            self.by_score.remove(&oldest);
            self.members.remove(&oldest.1);
        }
    }
    fn expired(&self) -> bool {
        self.expires_at.map(|at| at <= Instant::now()).unwrap_or(false)
    }
}

/// In-memory [timeline::Backend] implementation
#[derive(Default)]
pub struct MemoryTimelines {
    timelines: RwLock<HashMap<UserId, Zset>>,
    receivers: RwLock<HashMap<PostId, (HashSet<UserId>, Instant)>>,
}

impl MemoryTimelines {
    pub fn new() -> MemoryTimelines {
        MemoryTimelines::default()
    }
    // Drop expired sets on the way in; lazy expiry in lieu of a reaper
    async fn prune(&self) {
        self.timelines.write().await.retain(|_, z| !z.expired());
    }
}

#[async_trait]
impl timeline::Backend for MemoryTimelines {
    async fn add(
        &self,
        owner: UserId,
        post: PostId,
        score: i64,
        cap: usize,
        ttl: Duration,
    ) -> TimelineResult<()> {
        self.prune().await;
        let mut timelines = self.timelines.write().await;
        let zset = timelines.entry(owner).or_default();
        zset.insert(post, score);
        zset.evict_to(cap);
        zset.expires_at = Some(Instant::now() + ttl);
        Ok(())
    }
    async fn add_batch(
        &self,
        owners: &[UserId],
        post: PostId,
        score: i64,
        cap: usize,
        ttl: Duration,
    ) -> TimelineResult<()> {
        self.prune().await;
        let mut timelines = self.timelines.write().await;
        for owner in owners {
            let zset = timelines.entry(*owner).or_default();
            zset.insert(post, score);
            zset.evict_to(cap);
            zset.expires_at = Some(Instant::now() + ttl);
        }
        Ok(())
    }
    async fn remove(&self, owner: UserId, post: PostId) -> TimelineResult<()> {
        if let Some(zset) = self.timelines.write().await.get_mut(&owner) {
            zset.remove(post);
        }
        Ok(())
    }
    async fn range_before(
        &self,
        owner: UserId,
        cursor: Cursor,
        limit: usize,
    ) -> TimelineResult<Vec<TimelineEntry>> {
        let timelines = self.timelines.read().await;
        Ok(match timelines.get(&owner) {
            Some(zset) if !zset.expired() => zset
                .by_score
                .iter()
                .rev()
                .skip_while(|(score, _)| *score >= cursor.epoch())
                .take(limit + 1)
                .map(|(score, post)| TimelineEntry {
                    post: *post,
                    score: *score,
                })
                .collect(),
            _ => Vec::new(),
        })
    }
    async fn size(&self, owner: UserId) -> TimelineResult<usize> {
        let timelines = self.timelines.read().await;
        Ok(timelines
            .get(&owner)
            .filter(|z| !z.expired())
            .map(|z| z.members.len())
            .unwrap_or(0))
    }
    async fn contains(&self, owner: UserId, post: PostId) -> TimelineResult<bool> {
        let timelines = self.timelines.read().await;
        Ok(timelines
            .get(&owner)
            .filter(|z| !z.expired())
            .map(|z| z.members.contains_key(&post))
            .unwrap_or(false))
    }
    async fn trim(&self, owner: UserId, keep: usize) -> TimelineResult<()> {
        if let Some(zset) = self.timelines.write().await.get_mut(&owner) {
            zset.evict_to(keep);
        }
        Ok(())
    }
    async fn oldest_score(&self, owner: UserId) -> TimelineResult<Option<i64>> {
        let timelines = self.timelines.read().await;
        Ok(timelines
            .get(&owner)
            .filter(|z| !z.expired())
            .and_then(|z| z.by_score.iter().next().map(|(score, _)| *score)))
    }
    async fn clear(&self, owner: UserId) -> TimelineResult<()> {
        self.timelines.write().await.remove(&owner);
        Ok(())
    }
    async fn set_ttl(&self, owner: UserId, ttl: Duration) -> TimelineResult<()> {
        if let Some(zset) = self.timelines.write().await.get_mut(&owner) {
            zset.expires_at = Some(Instant::now() + ttl);
        }
        Ok(())
    }
    async fn rebuild(
        &self,
        owner: UserId,
        entries: &[TimelineEntry],
        ttl: Duration,
    ) -> TimelineResult<()> {
        let mut timelines = self.timelines.write().await;
        let mut zset = Zset {
            expires_at: Some(Instant::now() + ttl),
            ..Default::default()
        };
        for entry in entries {
            zset.insert(entry.post, entry.score);
        }
        timelines.insert(owner, zset);
        Ok(())
    }
    async fn owners(&self) -> TimelineResult<Vec<UserId>> {
        self.prune().await;
        Ok(self.timelines.read().await.keys().copied().collect())
    }
    async fn record_receivers(
        &self,
        post: PostId,
        owners: &[UserId],
        ttl: Duration,
    ) -> TimelineResult<()> {
        let mut receivers = self.receivers.write().await;
        let expiry = Instant::now() + ttl;
        let entry = receivers.entry(post).or_insert_with(|| (HashSet::new(), expiry));
        entry.0.extend(owners.iter().copied());
        entry.1 = expiry;
        Ok(())
    }
    async fn drain_receivers(&self, post: PostId) -> TimelineResult<Vec<UserId>> {
        Ok(self
            .receivers
            .write()
            .await
            .remove(&post)
            .filter(|(_, expiry)| *expiry > Instant::now())
            .map(|(owners, _)| owners.into_iter().collect())
            .unwrap_or_default())
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                             ledger                                             //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// In-memory [ledger::Backend] implementation
#[derive(Default)]
pub struct MemoryLedger {
    records: RwLock<HashMap<PostId, (Record, Instant)>>,
}

impl MemoryLedger {
    pub fn new() -> MemoryLedger {
        MemoryLedger::default()
    }
    async fn prune(&self) {
        self.records
            .write()
            .await
            .retain(|_, (_, expiry)| *expiry > Instant::now());
    }
}

#[async_trait]
impl ledger::Backend for MemoryLedger {
    async fn put(&self, record: &Record, ttl: Duration) -> LedgerResult<()> {
        self.prune().await;
        self.records
            .write()
            .await
            .insert(record.post_id, (record.clone(), Instant::now() + ttl));
        Ok(())
    }
    async fn get(&self, post: PostId) -> LedgerResult<Option<Record>> {
        self.prune().await;
        Ok(self
            .records
            .read()
            .await
            .get(&post)
            .map(|(record, _)| record.clone()))
    }
    async fn complete(
        &self,
        post: PostId,
        at: DateTime<Utc>,
        ttl: Duration,
    ) -> LedgerResult<()> {
        if let Some((record, expiry)) = self.records.write().await.get_mut(&post) {
            record.status = Status::Completed;
            record.started_at = at;
            *expiry = Instant::now() + ttl;
        }
        Ok(())
    }
    async fn delete(&self, post: PostId) -> LedgerResult<()> {
        self.records.write().await.remove(&post);
        Ok(())
    }
    async fn scan_pending(
        &self,
        older_than: DateTime<Utc>,
        limit: usize,
    ) -> LedgerResult<Vec<Record>> {
        self.prune().await;
        let records = self.records.read().await;
        let mut pending: Vec<Record> = records
            .values()
            .filter(|(record, _)| {
                record.status != Status::Completed && record.started_at <= older_than
            })
            .map(|(record, _)| record.clone())
            .collect();
        pending.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        pending.truncate(limit);
        Ok(pending)
    }
    async fn stats(&self, now: DateTime<Utc>, timeout: chrono::Duration) -> LedgerResult<Stats> {
        self.prune().await;
        let records = self.records.read().await;
        let mut stats = Stats::default();
        for (record, _) in records.values() {
            match record.status {
                Status::Completed => stats.completed += 1,
                _ if now - record.started_at > timeout => stats.stuck += 1,
                _ => stats.pending += 1,
            }
        }
        Ok(stats)
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                              bus                                               //
////////////////////////////////////////////////////////////////////////////////////////////////////

const PARTITIONS: usize = 16;

#[derive(Default)]
struct PartitionLog {
    events: Vec<(String, Envelope)>,
}

/// An in-memory, partitioned, ordered-per-key event log
///
/// Publishing hashes the key to a partition & appends; each consumer group holds its own
/// per-partition offsets. Not distributed, not durable-- but it honors the contract the real bus
/// honors: per-key ordering & at-least-once delivery (an uncommitted delivery is handed out again
/// to a fresh consumer of the same group).
pub struct MemoryBus {
    partitions: Vec<RwLock<PartitionLog>>,
    // group name -> committed offsets
    groups: RwLock<HashMap<String, Arc<RwLock<Vec<u64>>>>>,
}

impl Default for MemoryBus {
    fn default() -> Self {
        MemoryBus {
            partitions: (0..PARTITIONS).map(|_| RwLock::default()).collect(),
            groups: RwLock::default(),
        }
    }
}

impl MemoryBus {
    pub fn new() -> MemoryBus {
        MemoryBus::default()
    }
    fn partition_of(key: &str) -> usize {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() as usize) % PARTITIONS
    }
    /// Join (or create) a consumer group
    pub async fn subscribe(self: &Arc<Self>, group: &str) -> MemoryConsumer {
        let committed = self
            .groups
            .write()
            .await
            .entry(group.to_owned())
            .or_insert_with(|| Arc::new(RwLock::new(vec![0; PARTITIONS])))
            .clone();
        MemoryConsumer {
            bus: self.clone(),
            committed,
            delivered: RwLock::new(vec![0; PARTITIONS]),
        }
    }
}

#[async_trait]
impl Producer for MemoryBus {
    async fn publish(&self, key: &str, event: &Envelope) -> EventsResult<()> {
        let partition = MemoryBus::partition_of(key);
        self.partitions[partition]
            .write()
            .await
            .events
            .push((key.to_owned(), event.clone()));
        Ok(())
    }
}

/// One consumer within a group on a [MemoryBus]
pub struct MemoryConsumer {
    bus: Arc<MemoryBus>,
    committed: Arc<RwLock<Vec<u64>>>,
    // This consumer's read position; starts at the group's committed offsets, so work left
    // uncommitted by a dead consumer is re-delivered here
    delivered: RwLock<Vec<u64>>,
}

#[async_trait]
impl Consumer for MemoryConsumer {
    async fn poll(&self, max: usize) -> EventsResult<Vec<Delivery>> {
        let mut out = Vec::new();
        let committed = self.committed.read().await;
        let mut delivered = self.delivered.write().await;
        for partition in 0..PARTITIONS {
            // Never fall behind the group's committed position
            if delivered[partition] < committed[partition] {
                delivered[partition] = committed[partition];
            }
            let log = self.bus.partitions[partition].read().await;
            while (delivered[partition] as usize) < log.events.len() && out.len() < max {
                let offset = delivered[partition];
                let (key, event) = &log.events[offset as usize];
                out.push(Delivery {
                    partition: partition as u32,
                    offset,
                    key: key.clone(),
                    event: event.clone(),
                });
                delivered[partition] += 1;
            }
            if out.len() >= max {
                break;
            }
        }
        Ok(out)
    }
    async fn commit(&self, delivery: &Delivery) -> EventsResult<()> {
        let mut committed = self.committed.write().await;
        let slot = &mut committed[delivery.partition as usize];
        *slot = (*slot).max(delivery.offset + 1);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::timeline::Backend as _;

    fn entry(score: i64) -> (PostId, i64) {
        (PostId::new(), score)
    }

    #[tokio::test]
    async fn timeline_insertion_is_idempotent() {
        let store = MemoryTimelines::new();
        let owner = UserId::new();
        let (post, score) = entry(100);
        let ttl = Duration::from_secs(60);
        store.add(owner, post, score, 1000, ttl).await.unwrap();
        store.add(owner, post, score, 1000, ttl).await.unwrap();
        assert_eq!(store.size(owner).await.unwrap(), 1);
        assert!(store.contains(owner, post).await.unwrap());
        store.remove(owner, post).await.unwrap();
        store.remove(owner, post).await.unwrap();
        assert_eq!(store.size(owner).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn timeline_cap_evicts_oldest() {
        let store = MemoryTimelines::new();
        let owner = UserId::new();
        let ttl = Duration::from_secs(60);
        let mut posts = Vec::new();
        for score in 1..=1005 {
            let (post, score) = entry(score);
            posts.push((post, score));
            store.add(owner, post, score, 1000, ttl).await.unwrap();
        }
        assert_eq!(store.size(owner).await.unwrap(), 1000);
        // The five earliest are the ones gone
        for (post, score) in &posts {
            let resident = store.contains(owner, *post).await.unwrap();
            assert_eq!(resident, *score > 5, "score {}", score);
        }
        assert_eq!(store.oldest_score(owner).await.unwrap(), Some(6));
    }

    #[tokio::test]
    async fn range_before_pages_cleanly() {
        let store = MemoryTimelines::new();
        let owner = UserId::new();
        let ttl = Duration::from_secs(60);
        for score in 1..=50 {
            let (post, score) = entry(score);
            store.add(owner, post, score, 1000, ttl).await.unwrap();
        }
        // Three consecutive pages of 20: 50..31, 30..11, 10..1
        let raw = store
            .range_before(owner, Cursor::latest(Utc::now()), 20)
            .await
            .unwrap();
        let page1 = crate::timeline::paginate(raw, 20, |e| e.score);
        assert!(page1.has_more);
        assert_eq!(
            page1.items.iter().map(|e| e.score).collect::<Vec<_>>(),
            (31..=50).rev().collect::<Vec<_>>()
        );
        let raw = store
            .range_before(owner, page1.next_cursor.unwrap(), 20)
            .await
            .unwrap();
        let page2 = crate::timeline::paginate(raw, 20, |e| e.score);
        assert!(page2.has_more);
        assert_eq!(
            page2.items.iter().map(|e| e.score).collect::<Vec<_>>(),
            (11..=30).rev().collect::<Vec<_>>()
        );
        let raw = store
            .range_before(owner, page2.next_cursor.unwrap(), 20)
            .await
            .unwrap();
        let page3 = crate::timeline::paginate(raw, 20, |e| e.score);
        assert!(!page3.has_more);
        assert_eq!(
            page3.items.iter().map(|e| e.score).collect::<Vec<_>>(),
            (1..=10).rev().collect::<Vec<_>>()
        );
    }

    #[tokio::test]
    async fn expired_timelines_read_as_absent() {
        let store = MemoryTimelines::new();
        let owner = UserId::new();
        let (post, score) = entry(7);
        store
            .add(owner, post, score, 1000, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(store.size(owner).await.unwrap(), 0);
        assert!(!store.contains(owner, post).await.unwrap());
    }

    #[tokio::test]
    async fn receivers_drain_once() {
        let store = MemoryTimelines::new();
        let post = PostId::new();
        let owners: Vec<UserId> = (0..3).map(|_| UserId::new()).collect();
        store
            .record_receivers(post, &owners, Duration::from_secs(60))
            .await
            .unwrap();
        let mut drained = store.drain_receivers(post).await.unwrap();
        drained.sort();
        let mut expected = owners.clone();
        expected.sort();
        assert_eq!(drained, expected);
        assert!(store.drain_receivers(post).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn ledger_scan_finds_only_stuck_records() {
        use crate::ledger::Backend as _;
        let ledger = MemoryLedger::new();
        let ttl = Duration::from_secs(3600);
        let now = Utc::now();
        let fresh = Record {
            post_id: PostId::new(),
            author_id: UserId::new(),
            status: Status::StartedPushSmall,
            started_at: now,
        };
        let stuck = Record {
            post_id: PostId::new(),
            author_id: UserId::new(),
            status: Status::StartedPushInfluencer,
            started_at: now - chrono::Duration::minutes(10),
        };
        let done = Record {
            post_id: PostId::new(),
            author_id: UserId::new(),
            status: Status::Completed,
            started_at: now - chrono::Duration::hours(1),
        };
        ledger.put(&fresh, ttl).await.unwrap();
        ledger.put(&stuck, ttl).await.unwrap();
        ledger.put(&done, ttl).await.unwrap();
        let pending = ledger
            .scan_pending(now - chrono::Duration::minutes(5), 100)
            .await
            .unwrap();
        assert_eq!(pending, vec![stuck.clone()]);

        ledger.complete(stuck.post_id, now, ttl).await.unwrap();
        assert!(ledger
            .scan_pending(now - chrono::Duration::minutes(5), 100)
            .await
            .unwrap()
            .is_empty());
        let stats = ledger.stats(now, chrono::Duration::minutes(5)).await.unwrap();
        assert_eq!((stats.pending, stats.completed, stats.stuck), (1, 2, 0));
    }

    #[tokio::test]
    async fn bus_preserves_per_key_order_and_redelivers_uncommitted() {
        let bus = Arc::new(MemoryBus::new());
        let now = Utc::now();
        for n in 0..5 {
            let env = Envelope {
                kind: format!("e{}", n),
                timestamp: now,
                data: serde_json::Value::Null,
            };
            bus.publish("alice", &env).await.unwrap();
        }
        let consumer = bus.subscribe("workers").await;
        let batch = consumer.poll(10).await.unwrap();
        assert_eq!(
            batch.iter().map(|d| d.event.kind.clone()).collect::<Vec<_>>(),
            vec!["e0", "e1", "e2", "e3", "e4"]
        );
        // Commit only the first two; a fresh consumer of the same group resumes at e2
        consumer.commit(&batch[0]).await.unwrap();
        consumer.commit(&batch[1]).await.unwrap();
        let consumer2 = bus.subscribe("workers").await;
        let batch2 = consumer2.poll(10).await.unwrap();
        assert_eq!(batch2.first().map(|d| d.event.kind.as_str()), Some("e2"));
        // A different group sees everything from the beginning
        let other = bus.subscribe("audit").await;
        assert_eq!(other.poll(10).await.unwrap().len(), 5);
    }
}
