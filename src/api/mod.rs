//! HTTP API.
//!
//! ## Endpoints
//!
//! - `GET /health` - Health check
//! - `POST /auth/firebase` - Exchange an ID token for a session token
//! - `GET /tasks/daily` - Today's tasks with completion state
//! - `POST /tasks/complete` - Complete a task and queue its reward
//! - `GET /tasks/history` - Completions grouped by day
//! - `GET /user/balance` - Reward token balance
//!
//! Everything except `/health` and `/auth/firebase` requires `Authorization: Bearer <session>`.

mod auth;
mod error;
mod rate_limit;
mod routes;
mod tasks;
pub mod types;

pub use error::ApiError;
pub use rate_limit::RateLimiter;
pub use routes::{build_router, serve, AppState};
pub use types::*;
