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

//! # The recovery scanner
//!
//! ## Introduction
//!
//! The distributor's promise is at-least-once delivery to every selected follower, *across
//! process crashes*. The mechanism is unglamorous: every few minutes, scan the ledger for records
//! still in a `started_*` state beyond the timeout, re-select the followers the original mode
//! would have chosen, and re-insert the entry into any timeline missing it. Every write involved
//! is idempotent, so the scanner is safe to run concurrently with live distributions, with other
//! scanner instances, and with itself after a crash mid-recovery-- the worst case is wasted work,
//! never duplicate entries.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use snafu::prelude::*;
use tokio::sync::Notify;
use tracing::{info, warn};

use crate::{
    config::Configuration,
    counter_add,
    distributor::{self, Distributor},
    entities::UserId,
    ledger::{self, Record, Stats},
    metrics::{Instruments, Registration, Sort},
    storage::{self, Posts, Users},
    timeline,
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Ledger error during recovery: {source}"))]
    Ledger { source: ledger::Error },
    #[snafu(display("Failed to read a post during recovery: {source}"))]
    PostStore { source: storage::Error },
    #[snafu(display("Failed to re-select fan-out targets: {source}"))]
    Reselect { source: distributor::Error },
    #[snafu(display("Timeline store error during recovery: {source}"))]
    Timelines { source: timeline::Error },
    #[snafu(display("Failed to read a user during recovery: {source}"))]
    UserStore { source: storage::Error },
}

type Result<T> = std::result::Result<T, Error>;

// Upper bound on records handled per cycle; leftovers wait for the next tick
const SCAN_LIMIT: usize = 500;

inventory::submit! { Registration::new("recovery.cycles", Sort::IntegralCounter) }
inventory::submit! { Registration::new("recovery.recovered", Sort::IntegralCounter) }
inventory::submit! { Registration::new("recovery.reaped", Sort::IntegralCounter) }

pub struct Recovery {
    posts: Arc<dyn Posts + Send + Sync>,
    users: Arc<dyn Users + Send + Sync>,
    timelines: Arc<dyn timeline::Backend + Send + Sync>,
    ledger: Arc<dyn ledger::Backend + Send + Sync>,
    distributor: Arc<Distributor>,
    config: Arc<Configuration>,
    instruments: Arc<Instruments>,
}

impl Recovery {
    pub fn new(
        posts: Arc<dyn Posts + Send + Sync>,
        users: Arc<dyn Users + Send + Sync>,
        timelines: Arc<dyn timeline::Backend + Send + Sync>,
        ledger: Arc<dyn ledger::Backend + Send + Sync>,
        distributor: Arc<Distributor>,
        config: Arc<Configuration>,
        instruments: Arc<Instruments>,
    ) -> Recovery {
        Recovery {
            posts,
            users,
            timelines,
            ledger,
            distributor,
            config,
            instruments,
        }
    }

    /// One recovery cycle: finish every fan-out stuck beyond the timeout. Returns the number of
    /// distributions brought to `completed`.
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<usize> {
        let cutoff = now - self.config.recovery.task_timeout();
        let stuck = self
            .ledger
            .scan_pending(cutoff, SCAN_LIMIT)
            .await
            .context(LedgerSnafu)?;
        let mut recovered = 0;
        for record in stuck {
            match self.recover_one(&record, now).await {
                Ok(true) => recovered += 1,
                Ok(false) => (),
                Err(err) => {
                    // Leave the record; it'll be retried next cycle
                    warn!("Couldn't recover the fan-out of {}: {}", record.post_id, err);
                }
            }
        }
        counter_add!(self.instruments, "recovery.cycles", 1, &[]);
        counter_add!(self.instruments, "recovery.recovered", recovered as u64, &[]);
        if recovered > 0 {
            info!("Recovery completed {} stuck distributions", recovered);
        }
        Ok(recovered)
    }

    // Returns Ok(true) if the record was driven to completed, Ok(false) if it was reaped
    async fn recover_one(&self, record: &Record, now: DateTime<Utc>) -> Result<bool> {
        // The post may have been tombstoned (or never have made it) since the fan-out started;
        // nothing to deliver, drop the record
        let post = match self
            .posts
            .get(record.post_id)
            .await
            .context(PostStoreSnafu)?
        {
            Some(post) if !post.is_deleted => post,
            _ => {
                self.ledger
                    .delete(record.post_id)
                    .await
                    .context(LedgerSnafu)?;
                counter_add!(self.instruments, "recovery.reaped", 1, &[]);
                return Ok(false);
            }
        };
        if self
            .users
            .get(record.author_id)
            .await
            .context(UserStoreSnafu)?
            .is_none()
        {
            self.ledger
                .delete(record.post_id)
                .await
                .context(LedgerSnafu)?;
            counter_add!(self.instruments, "recovery.reaped", 1, &[]);
            return Ok(false);
        }

        // Re-select the same population the original mode targeted & fill in the holes. The
        // membership probe is an O(log n) score lookup; the re-insert is idempotent anyway, the
        // probe just keeps us from churning TTLs on timelines that already have the entry.
        let targets = self
            .distributor
            .select_targets(record.author_id, record.status, now)
            .await
            .context(ReselectSnafu)?;
        let probes = futures::future::join_all(
            targets
                .iter()
                .map(|target| self.timelines.contains(*target, post.id)),
        )
        .await;
        let mut missing: Vec<UserId> = Vec::new();
        for (target, probe) in targets.iter().zip(probes) {
            if !probe.context(TimelinesSnafu)? {
                missing.push(*target);
            }
        }
        if !missing.is_empty() {
            self.timelines
                .add_batch(
                    &missing,
                    post.id,
                    post.created_epoch(),
                    self.config.timeline.max_items,
                    self.config.feed.cache_ttl(),
                )
                .await
                .context(TimelinesSnafu)?;
            self.timelines
                .record_receivers(post.id, &missing, self.config.recovery.retention())
                .await
                .context(TimelinesSnafu)?;
        }
        self.ledger
            .complete(post.id, now, self.config.recovery.retention())
            .await
            .context(LedgerSnafu)?;
        info!(
            "Recovered the fan-out of {} ({} timelines were missing it)",
            post.id,
            missing.len()
        );
        Ok(true)
    }

    /// The ledger tallies behind `get_distribution_stats()`
    pub async fn distribution_stats(&self, now: DateTime<Utc>) -> Result<Stats> {
        self.ledger
            .stats(now, self.config.recovery.task_timeout())
            .await
            .context(LedgerSnafu)
    }
}

/// Run [Recovery::run_once] every `interval` until `shutdown` is notified, with a jittered start
pub async fn recovery_loop(recovery: Arc<Recovery>, interval: Duration, shutdown: Arc<Notify>) {
    use rand::Rng;
    let jitter =
        Duration::from_secs(rand::thread_rng().gen_range(0..interval.as_secs().max(1) / 10 + 1));
    tokio::select! {
        _ = tokio::time::sleep(jitter) => (),
        _ = shutdown.notified() => return,
    }
    loop {
        if let Err(err) = recovery.run_once(Utc::now()).await {
            warn!("Recovery cycle failed: {}", err);
        }
        tokio::select! {
            _ = tokio::time::sleep(interval) => (),
            _ = shutdown.notified() => return,
        }
    }
}
