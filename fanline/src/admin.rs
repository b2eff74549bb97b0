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

//! # Administrative API
//!
//! Operator-facing endpoints: cache & distribution statistics, plus "do it now" triggers for the
//! recovery & cleanup jobs. The *product* API (publish, feeds) is deliberately not served here--
//! that surface belongs to the API tier; this router is for the person holding the pager.

use std::sync::Arc;

use axum::{
    extract::State,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use http::{header::CONTENT_TYPE, HeaderValue, StatusCode};
use serde::Serialize;
use tower_http::{cors::CorsLayer, set_header::SetResponseHeaderLayer};
use tracing::error;

use crate::fanline::Fanline;

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

async fn cache_stats(State(state): State<Arc<Fanline>>) -> axum::response::Response {
    match state.strategy.cache_stats(Utc::now()).await {
        Ok(stats) => (StatusCode::OK, Json(stats)).into_response(),
        Err(err) => {
            error!("While gathering cache stats: {err:#}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorBody {
                    error: format!("{err}"),
                }),
            )
                .into_response()
        }
    }
}

async fn distribution_stats(State(state): State<Arc<Fanline>>) -> axum::response::Response {
    match state.recovery.distribution_stats(Utc::now()).await {
        Ok(stats) => (StatusCode::OK, Json(stats)).into_response(),
        Err(err) => {
            error!("While gathering distribution stats: {err:#}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorBody {
                    error: format!("{err}"),
                }),
            )
                .into_response()
        }
    }
}

#[derive(Debug, Serialize)]
struct ForcedRun {
    affected: usize,
}

async fn force_recovery(State(state): State<Arc<Fanline>>) -> axum::response::Response {
    match state.recovery.run_once(Utc::now()).await {
        Ok(recovered) => (StatusCode::OK, Json(ForcedRun { affected: recovered })).into_response(),
        Err(err) => {
            error!("While forcing a recovery cycle: {err:#}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorBody {
                    error: format!("{err}"),
                }),
            )
                .into_response()
        }
    }
}

async fn force_cleanup(State(state): State<Arc<Fanline>>) -> axum::response::Response {
    match state.strategy.sweep(Utc::now()).await {
        Ok(trimmed) => (StatusCode::OK, Json(ForcedRun { affected: trimmed })).into_response(),
        Err(err) => {
            error!("While forcing a cache sweep: {err:#}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorBody {
                    error: format!("{err}"),
                }),
            )
                .into_response()
        }
    }
}

/// Return a router for the admin API; the caller merges it under a path of their choosing
pub fn make_router(state: Arc<Fanline>) -> Router<Arc<Fanline>> {
    Router::new()
        .route("/stats/cache", get(cache_stats))
        .route("/stats/distribution", get(distribution_stats))
        .route("/recovery/run", post(force_recovery))
        .route("/cleanup/run", post(force_cleanup))
        .layer(SetResponseHeaderLayer::if_not_present(
            CONTENT_TYPE,
            HeaderValue::from_static("text/json; charset=utf-8"),
        ))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
