// crates/server/src/routes/mod.rs
//! Route registration for the API server.

use std::sync::Arc;

use axum::Router;

use crate::state::AppState;

pub mod health;
pub mod live;
pub mod sessions;
pub mod ws;

/// Build the `/api` router with all REST routes.
pub fn api_router() -> Router<Arc<AppState>> {
    Router::new()
        .merge(health::router())
        .merge(sessions::router())
        .merge(live::router())
}
