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

//! Shared harness for the integration tests: a whole fanline wired over the in-memory backends,
//! plus the conveniences the scenarios keep reaching for.

use std::sync::Arc;

use chrono::Utc;

use fanline::{
    config::Configuration,
    entities::{FollowEdge, User, UserId},
    events::{Consumer as _, Envelope, FollowCreated, FollowDeleted, Producer as _, FOLLOW_CREATED,
             FOLLOW_DELETED},
    fanline::Fanline,
    memory::{MemoryBus, MemoryConsumer, MemoryFollows, MemoryLedger, MemoryPosts, MemoryTimelines,
             MemoryUsers},
    storage::{Follows as _, Users as _},
};

pub struct Harness {
    pub state: Arc<Fanline>,
    pub bus: Arc<MemoryBus>,
    pub consumer: MemoryConsumer,
    pub posts: Arc<MemoryPosts>,
    pub users: Arc<MemoryUsers>,
    pub follows: Arc<MemoryFollows>,
    pub timelines: Arc<MemoryTimelines>,
}

pub async fn harness(config: Configuration) -> Harness {
    let config = Arc::new(config);
    let posts = Arc::new(MemoryPosts::new());
    let users = Arc::new(MemoryUsers::new());
    let follows = Arc::new(MemoryFollows::new());
    let timelines = Arc::new(MemoryTimelines::new());
    let ledger = Arc::new(MemoryLedger::new());
    let bus = Arc::new(MemoryBus::new());
    let state = Fanline::new(
        config,
        posts.clone(),
        follows.clone(),
        users.clone(),
        timelines.clone(),
        ledger,
        bus.clone(),
    );
    let consumer = bus.subscribe("it-workers").await;
    Harness {
        state,
        bus,
        consumer,
        posts,
        users,
        follows,
        timelines,
    }
}

impl Harness {
    /// Create a user with the given denormalized follower count & activity posture
    pub async fn seed_user(&self, followers: i64, activity_score: f64, days_quiet: i64) -> UserId {
        let id = UserId::new();
        let mut row = User::new(id);
        row.follower_count = followers;
        row.activity_score = activity_score;
        row.last_active_at = Some(Utc::now() - chrono::Duration::days(days_quiet));
        self.users.upsert(&row).await.unwrap();
        id
    }

    /// Record the follow edge & publish the `follow_created` event, as the (out-of-scope) social
    /// service would
    pub async fn follow(&self, follower: UserId, followee: UserId) {
        let now = Utc::now();
        self.follows
            .add_edge(&FollowEdge {
                follower,
                followee,
                created_at: now,
                is_active: true,
            })
            .await
            .unwrap();
        self.users.add_follower_count(followee, 1).await.unwrap();
        self.users.add_following_count(follower, 1).await.unwrap();
        let event = Envelope::new(
            FOLLOW_CREATED,
            now,
            &FollowCreated {
                follower_id: follower,
                followee_id: followee,
                created_at: now,
            },
        )
        .unwrap();
        self.bus
            .publish(&follower.to_raw_string(), &event)
            .await
            .unwrap();
    }

    /// Remove the follow edge & publish `follow_deleted`
    pub async fn unfollow(&self, follower: UserId, followee: UserId) {
        self.follows.remove_edge(follower, followee).await.unwrap();
        self.users.add_follower_count(followee, -1).await.unwrap();
        self.users.add_following_count(follower, -1).await.unwrap();
        let event = Envelope::new(
            FOLLOW_DELETED,
            Utc::now(),
            &FollowDeleted {
                follower_id: follower,
                followee_id: followee,
            },
        )
        .unwrap();
        self.bus
            .publish(&follower.to_raw_string(), &event)
            .await
            .unwrap();
    }

    /// Pump the bus dry through the real handlers, committing as we go
    pub async fn drain_events(&self) {
        loop {
            let batch = self.consumer.poll(64).await.unwrap();
            if batch.is_empty() {
                return;
            }
            for delivery in batch {
                self.state.handlers.handle(&delivery.event).await.unwrap();
                self.consumer.commit(&delivery).await.unwrap();
            }
        }
    }
}
