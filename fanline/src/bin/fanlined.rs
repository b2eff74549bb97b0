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

//! # fanlined
//!
//! The fanline daemon: loads configuration, wires the service over its backends, starts the
//! background jobs (event consumer, recovery scanner, cache sweep, activity decay, score rescan)
//! and serves the administrative API until told to stop.
//!
//! With no `[redis]` section in the configuration, every backend is in-memory & the process is a
//! fully self-contained fanline-- handy for development & for the integration tests' target
//! practice. With `[redis]`, timelines & the ledger move to the sorted-set service and multiple
//! daemons may share them.

use std::{net::SocketAddr, path::PathBuf, str::FromStr, sync::Arc, time::Duration};

use clap::{crate_authors, crate_version, value_parser, Arg, ArgAction, Command};
use snafu::{prelude::*, Backtrace};
use tokio::{
    net::TcpListener,
    signal::unix::{signal, SignalKind},
    sync::Notify,
    task::JoinHandle,
};
use tracing::{error, info, warn};
use tracing_subscriber::{filter::EnvFilter, fmt, layer::SubscriberExt, Registry};

use fanline::{
    activity::decay_sweep,
    admin::make_router,
    config::Configuration,
    consumer::consume_loop,
    distributor::rescan_loop,
    events,
    fanline::Fanline,
    ledger,
    memory::{MemoryBus, MemoryFollows, MemoryLedger, MemoryPosts, MemoryTimelines, MemoryUsers},
    recovery::recovery_loop,
    redis::{RedisLedger, RedisTimelines},
    strategy::sweep_loop,
    timeline,
};

/// The fanlined application error type
///
/// At the application level I want a rich set of errors in the hope of helping operators, and
/// [Snafu] keeps the boilerplate down. `main()` returns `Result<(), Error>`, which obliges
/// `Error` to implement [std::fmt::Debug] (that's what the runtime prints on the error path);
/// the derived implementation is unreadable, so it's written by hand to show the [Display] form.
#[derive(Snafu)]
pub enum Error {
    #[snafu(display("Failed to bind {addr}: {source}"))]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to parse configuration from {path:?}: {source}"))]
    ConfigParse {
        path: PathBuf,
        source: toml::de::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to read configuration from {path:?}: {source}"))]
    ConfigRead {
        path: PathBuf,
        source: std::io::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to connect to Redis: {source}"))]
    Redis { source: fanline::redis::Error },
    #[snafu(display("Failed to install a signal handler: {source}"))]
    Signals {
        source: std::io::Error,
        backtrace: Backtrace,
    },
}

impl std::fmt::Debug for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self)
    }
}

type Result<T> = std::result::Result<T, Error>;

const DEFAULT_CONFIG: &str = "/etc/fanline.toml";

fn load_config(path: Option<&PathBuf>) -> Result<Configuration> {
    // An explicit --config must exist; the well-known default is optional
    let (path, required) = match path {
        Some(path) => (path.clone(), true),
        None => (PathBuf::from_str(DEFAULT_CONFIG).unwrap(/* known good */), false),
    };
    match std::fs::read_to_string(&path) {
        Ok(text) => toml::from_str(&text).context(ConfigParseSnafu { path }),
        Err(err) if !required && err.kind() == std::io::ErrorKind::NotFound => {
            Ok(Configuration::default())
        }
        Err(err) => Err(err).context(ConfigReadSnafu { path }),
    }
}

fn init_logging(config: &Configuration, verbose: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let directive = if verbose {
            "debug"
        } else {
            config.log_filter.as_deref().unwrap_or("info")
        };
        EnvFilter::new(directive)
    });
    let subscriber = Registry::default().with(filter).with(fmt::layer());
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        eprintln!("Logging was already initialized; proceeding");
    }
}

async fn make_stores(
    config: &Configuration,
) -> Result<(
    Arc<dyn timeline::Backend + Send + Sync>,
    Arc<dyn ledger::Backend + Send + Sync>,
)> {
    match &config.redis {
        Some(redis) => {
            let timelines = RedisTimelines::new(&redis.url, &redis.key_prefix)
                .await
                .context(RedisSnafu)?;
            let ledger = RedisLedger::new(&redis.url, &redis.key_prefix)
                .await
                .context(RedisSnafu)?;
            Ok((Arc::new(timelines), Arc::new(ledger)))
        }
        None => {
            info!("No [redis] section configured; running on in-memory backends");
            Ok((Arc::new(MemoryTimelines::new()), Arc::new(MemoryLedger::new())))
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let matches = Command::new("fanlined")
        .version(crate_version!())
        .author(crate_authors!())
        .about("Feed fan-out & timeline service")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_parser(value_parser!(PathBuf))
                .help(format!("Path to a TOML configuration file (default {DEFAULT_CONFIG}, if present)")),
        )
        .arg(
            Arg::new("addr")
                .short('A')
                .long("addr")
                .value_parser(value_parser!(SocketAddr))
                .default_value("127.0.0.1:4150")
                .help("Address on which to serve the admin API"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .action(ArgAction::SetTrue)
                .help("Log at debug level (RUST_LOG still wins)"),
        )
        .get_matches();

    let config = Arc::new(load_config(matches.get_one::<PathBuf>("config"))?);
    init_logging(&config, matches.get_flag("verbose"));
    info!("fanlined {} starting", crate_version!());

    let (timelines, dist_ledger) = make_stores(&config).await?;
    let bus = Arc::new(MemoryBus::new());
    let state = Fanline::new(
        config.clone(),
        Arc::new(MemoryPosts::new()),
        Arc::new(MemoryFollows::new()),
        Arc::new(MemoryUsers::new()),
        timelines,
        dist_ledger,
        bus.clone(),
    );

    // Background jobs. Each gets its own Notify: a permit is stored if the job isn't parked on
    // `notified()` at signal time, so none of them can miss shutdown.
    let mut jobs: Vec<(&str, Arc<Notify>, JoinHandle<()>)> = Vec::new();
    {
        let shutdown = Arc::new(Notify::new());
        let consumer: Arc<dyn events::Consumer + Send + Sync> =
            Arc::new(bus.subscribe("fanline-workers").await);
        jobs.push((
            "consumer",
            shutdown.clone(),
            tokio::spawn(consume_loop(consumer, state.handlers.clone(), shutdown)),
        ));
    }
    {
        let shutdown = Arc::new(Notify::new());
        jobs.push((
            "recovery",
            shutdown.clone(),
            tokio::spawn(recovery_loop(
                state.recovery.clone(),
                config.recovery.check_interval(),
                shutdown,
            )),
        ));
    }
    {
        let shutdown = Arc::new(Notify::new());
        jobs.push((
            "cache-sweep",
            shutdown.clone(),
            tokio::spawn(sweep_loop(
                state.strategy.clone(),
                config.cleanup.interval(),
                shutdown,
            )),
        ));
    }
    {
        let shutdown = Arc::new(Notify::new());
        jobs.push((
            "activity-decay",
            shutdown.clone(),
            tokio::spawn(decay_sweep(
                state.activity.clone(),
                state.timelines.clone(),
                config.activity.interval(),
                shutdown,
            )),
        ));
    }
    {
        let shutdown = Arc::new(Notify::new());
        jobs.push((
            "score-rescan",
            shutdown.clone(),
            tokio::spawn(rescan_loop(
                state.posts.clone(),
                state.users.clone(),
                state.timelines.clone(),
                state.instruments.clone(),
                config.feed.rank_update_interval(),
                shutdown,
            )),
        ));
    }

    // The admin API
    let addr = *matches.get_one::<SocketAddr>("addr").unwrap(/* has default */);
    let listener = TcpListener::bind(addr).await.context(BindSnafu { addr })?;
    info!("Serving the admin API on {}", addr);
    let router = make_router(state.clone()).with_state(state.clone());
    let http_shutdown = Arc::new(Notify::new());
    let http = {
        let http_shutdown = http_shutdown.clone();
        tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async move { http_shutdown.notified().await })
                .await
        })
    };

    // Park until SIGINT or SIGTERM
    let mut sigint = signal(SignalKind::interrupt()).context(SignalsSnafu)?;
    let mut sigterm = signal(SignalKind::terminate()).context(SignalsSnafu)?;
    tokio::select! {
        _ = sigint.recv() => info!("Caught SIGINT; shutting down"),
        _ = sigterm.recv() => info!("Caught SIGTERM; shutting down"),
    }

    // Orderly exit: stop the HTTP surface, then the jobs, each on a deadline. A job that won't
    // die in time is abandoned-- everything it does is idempotent & resumable.
    http_shutdown.notify_one();
    if let Err(err) = tokio::time::timeout(Duration::from_secs(5), http).await {
        warn!("The admin API didn't stop in time: {}", err);
    }
    for (name, shutdown, handle) in jobs {
        shutdown.notify_one();
        match tokio::time::timeout(Duration::from_secs(5), handle).await {
            Ok(Ok(())) => info!("Stopped the {} job", name),
            Ok(Err(err)) => error!("The {} job panicked: {}", name, err),
            Err(_) => warn!("The {} job didn't stop in time; abandoning it", name),
        }
    }
    info!("fanlined exiting");
    Ok(())
}
