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

//! # Application state
//!
//! The composition root: given backends for the six seams, wire up every service in dependency
//! order & hold the lot for handlers & background jobs to share.

use std::sync::Arc;

use crate::{
    activity::Tracker,
    assembler::Assembler,
    config::Configuration,
    consumer::Handlers,
    distributor::Distributor,
    events::Producer,
    feed::Feed,
    ledger,
    metrics::Instruments,
    recovery::Recovery,
    storage::{Follows, Posts, Users},
    strategy::Strategy,
    timeline,
};

/// Everything a handler or background job could want
pub struct Fanline {
    pub config: Arc<Configuration>,
    pub instruments: Arc<Instruments>,
    pub posts: Arc<dyn Posts + Send + Sync>,
    pub follows: Arc<dyn Follows + Send + Sync>,
    pub users: Arc<dyn Users + Send + Sync>,
    pub timelines: Arc<dyn timeline::Backend + Send + Sync>,
    pub ledger: Arc<dyn ledger::Backend + Send + Sync>,
    pub producer: Arc<dyn Producer + Send + Sync>,
    pub activity: Arc<Tracker>,
    pub assembler: Arc<Assembler>,
    pub strategy: Arc<Strategy>,
    pub recovery: Arc<Recovery>,
    pub handlers: Arc<Handlers>,
    pub feed: Feed,
}

impl Fanline {
    /// Wire the services over the given backends
    pub fn new(
        config: Arc<Configuration>,
        posts: Arc<dyn Posts + Send + Sync>,
        follows: Arc<dyn Follows + Send + Sync>,
        users: Arc<dyn Users + Send + Sync>,
        timelines: Arc<dyn timeline::Backend + Send + Sync>,
        ledger: Arc<dyn ledger::Backend + Send + Sync>,
        producer: Arc<dyn Producer + Send + Sync>,
    ) -> Arc<Fanline> {
        let instruments = Arc::new(Instruments::new("fanline"));
        let activity = Arc::new(Tracker::new(
            users.clone(),
            follows.clone(),
            config.clone(),
            instruments.clone(),
        ));
        let distributor = Arc::new(Distributor::new(
            follows.clone(),
            timelines.clone(),
            ledger.clone(),
            activity.clone(),
            producer.clone(),
            config.clone(),
            instruments.clone(),
        ));
        let assembler = Assembler::new(
            posts.clone(),
            follows.clone(),
            timelines.clone(),
            activity.clone(),
            config.clone(),
            instruments.clone(),
        );
        let strategy = Arc::new(Strategy::new(
            users.clone(),
            timelines.clone(),
            activity.clone(),
            config.clone(),
            instruments.clone(),
        ));
        let recovery = Arc::new(Recovery::new(
            posts.clone(),
            users.clone(),
            timelines.clone(),
            ledger.clone(),
            distributor.clone(),
            config.clone(),
            instruments.clone(),
        ));
        let handlers = Arc::new(Handlers::new(
            posts.clone(),
            users.clone(),
            timelines.clone(),
            activity.clone(),
            strategy.clone(),
            config.clone(),
            instruments.clone(),
        ));
        let feed = Feed::new(
            posts.clone(),
            users.clone(),
            timelines.clone(),
            distributor,
            assembler.clone(),
            activity.clone(),
            producer.clone(),
            instruments.clone(),
        );
        Arc::new(Fanline {
            config,
            instruments,
            posts,
            follows,
            users,
            timelines,
            ledger,
            producer,
            activity,
            assembler,
            strategy,
            recovery,
            handlers,
            feed,
        })
    }
}
