//! HTTP status surface for operators
//!
//! - GET /health - Liveness check
//! - GET /status - Full status report
//! - GET /status/calls/:id - One call's buffer detail

mod handlers;
mod routes;
mod state;

pub use routes::create_router;
pub use state::AppState;
