//! # Dirsub Server
//!
//! HTTP surface of the directory submission orchestrator:
//!
//! - **Worker protocol**: `request_job`, progress, heartbeat, release and completion
//!   under `/api/v1/worker`
//! - **Staff operations**: provisioning, pause, resume and submission retry under `/api/v1/jobs`
//! - **Dashboards**: revision-cursored polling and an SSE stream under `/api/v1/feed`
//! - **Housekeeper**: background sweep of lapsed leases

pub mod config;
pub mod errors;
pub mod handlers;
pub mod housekeeper;
pub mod routes;
pub mod state;

pub use routes::create_app;
pub use state::AppState;
