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

//! End-to-end scenarios over the whole service, wired on the in-memory backends.

mod common;

use chrono::{TimeZone, Utc};

use fanline::{
    config::Configuration,
    entities::Post,
    storage::Posts as _,
    timeline::Backend as _,
};

use common::harness;

#[tokio::test]
async fn small_author_publish_lands_everywhere() {
    let h = harness(Configuration::default()).await;
    let author = h.seed_user(0, 10.0, 0).await;
    let f1 = h.seed_user(0, 10.0, 0).await;
    let f2 = h.seed_user(0, 10.0, 0).await;
    let f3 = h.seed_user(0, 10.0, 0).await;
    for f in [f1, f2, f3] {
        h.follow(f, author).await;
    }
    h.drain_events().await;

    let post = h.state.feed.publish(author, "hi", vec![]).await.unwrap();
    for owner in [f1, f2, f3, author] {
        assert!(h.timelines.contains(owner, post.id).await.unwrap());
    }
    let page = h.state.feed.get_feed(f1, None, 20).await.unwrap();
    assert_eq!(
        page.posts.iter().map(|p| p.id).collect::<Vec<_>>(),
        vec![post.id]
    );
    assert!(!page.has_more);
    assert!(page.next_cursor.is_some());
}

#[tokio::test]
async fn influencer_publish_pushes_hot_and_pulls_cold() {
    let mut config = Configuration::default();
    config.feed.push_threshold = 3;
    config.feed.hot_active_limit = 10;
    let h = harness(config).await;

    // 5 followers (over the threshold of 3): two recently active, three dormant for a year
    let author = h.seed_user(0, 10.0, 0).await;
    let mut active = Vec::new();
    for _ in 0..2 {
        active.push(h.seed_user(0, 100.0, 0).await);
    }
    let mut dormant = Vec::new();
    for _ in 0..3 {
        dormant.push(h.seed_user(0, 0.0, 365).await);
    }
    for f in active.iter().chain(dormant.iter()) {
        h.follow(*f, author).await;
    }
    h.drain_events().await;

    let post = h.state.feed.publish(author, "fame", vec![]).await.unwrap();
    for owner in &active {
        assert!(h.timelines.contains(*owner, post.id).await.unwrap());
    }
    for owner in &dormant {
        assert!(!h.timelines.contains(*owner, post.id).await.unwrap());
    }

    // A dormant follower still sees the post-- served by pull-mode
    let viewer = dormant[0];
    let page = h.state.feed.get_feed(viewer, None, 20).await.unwrap();
    assert!(page.posts.iter().any(|p| p.id == post.id));
    // ...and the async rebuild leaves their timeline warm for next time
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert!(h.timelines.contains(viewer, post.id).await.unwrap());
}

#[tokio::test]
async fn unfollow_purges_the_delivered_posts() {
    let h = harness(Configuration::default()).await;
    let author = h.seed_user(0, 10.0, 0).await;
    let follower = h.seed_user(0, 10.0, 0).await;
    h.follow(follower, author).await;
    h.drain_events().await;

    let mut published = Vec::new();
    for n in 0..5 {
        published.push(
            h.state
                .feed
                .publish(author, &format!("post {}", n), vec![])
                .await
                .unwrap(),
        );
    }
    for post in &published {
        assert!(h.timelines.contains(follower, post.id).await.unwrap());
    }

    h.unfollow(follower, author).await;
    h.drain_events().await;
    for post in &published {
        assert!(!h.timelines.contains(follower, post.id).await.unwrap());
    }
    assert_eq!(h.timelines.size(follower).await.unwrap(), 0);
}

#[tokio::test]
async fn follow_backfills_the_new_follower() {
    let h = harness(Configuration::default()).await;
    let author = h.seed_user(0, 10.0, 0).await;
    let latecomer = h.seed_user(0, 10.0, 0).await;

    let mut published = Vec::new();
    for n in 0..3 {
        published.push(
            h.state
                .feed
                .publish(author, &format!("before {}", n), vec![])
                .await
                .unwrap(),
        );
    }
    assert_eq!(h.timelines.size(latecomer).await.unwrap(), 0);

    h.follow(latecomer, author).await;
    h.drain_events().await;
    for post in &published {
        assert!(h.timelines.contains(latecomer, post.id).await.unwrap());
    }
}

#[tokio::test]
async fn deletion_reaches_recorded_receivers_and_readers() {
    let h = harness(Configuration::default()).await;
    let author = h.seed_user(0, 10.0, 0).await;
    let follower = h.seed_user(0, 10.0, 0).await;
    h.follow(follower, author).await;
    h.drain_events().await;

    let keeper = h.state.feed.publish(author, "keeper", vec![]).await.unwrap();
    let goner = h.state.feed.publish(author, "goner", vec![]).await.unwrap();
    h.drain_events().await;

    h.state.feed.delete_post(author, goner.id).await.unwrap();
    // Before the purge lands, the read path already filters the tombstone
    let page = h.state.feed.get_feed(follower, None, 20).await.unwrap();
    assert!(page.posts.iter().all(|p| p.id != goner.id));
    // After it, the entry itself is gone
    h.drain_events().await;
    assert!(!h.timelines.contains(follower, goner.id).await.unwrap());
    assert!(h.timelines.contains(follower, keeper.id).await.unwrap());
}

#[tokio::test]
async fn pull_mode_pages_match_the_chronology() {
    let h = harness(Configuration::default()).await;
    let viewer = h.seed_user(0, 10.0, 0).await;
    let author = h.seed_user(0, 10.0, 0).await;
    h.follow(viewer, author).await;
    h.drain_events().await;

    // Seed 50 posts with distinct publish seconds straight into the post store; the viewer's
    // timeline stays cold, so every page is assembled pull-mode
    let base = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
    for n in 1..=50i64 {
        let post = Post::new(
            author,
            &format!("p{}", n),
            vec![],
            base + chrono::Duration::seconds(n),
        )
        .unwrap();
        h.posts.create(&post).await.unwrap();
    }

    let mut seen = Vec::new();
    let mut cursor: Option<String> = None;
    let mut rounds = 0;
    loop {
        h.timelines.clear(viewer).await.unwrap(); // keep the read on the pull path
        let page = h
            .state
            .feed
            .get_feed(viewer, cursor.as_deref(), 20)
            .await
            .unwrap();
        seen.extend(page.posts.iter().map(|p| p.created_at.timestamp()));
        rounds += 1;
        if !page.has_more {
            break;
        }
        cursor = page.next_cursor;
    }
    assert_eq!(rounds, 3); // 20 + 20 + 10
    let expected: Vec<i64> = (1..=50i64)
        .rev()
        .map(|n| (base + chrono::Duration::seconds(n)).timestamp())
        .collect();
    assert_eq!(seen, expected);
}

#[tokio::test]
async fn stats_reflect_what_happened() {
    let h = harness(Configuration::default()).await;
    let author = h.seed_user(0, 80.0, 0).await;
    let follower = h.seed_user(0, 80.0, 0).await;
    h.follow(follower, author).await;
    h.drain_events().await;
    h.state.feed.publish(author, "counted", vec![]).await.unwrap();

    let dist = h
        .state
        .recovery
        .distribution_stats(Utc::now())
        .await
        .unwrap();
    assert_eq!(dist.completed, 1);
    assert_eq!(dist.stuck, 0);

    let cache = h.state.strategy.cache_stats(Utc::now()).await.unwrap();
    assert_eq!(cache.total_timelines, 2); // author + follower
    assert_eq!(cache.active, 2);
}
