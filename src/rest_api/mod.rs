//! HTTP endpoints for liveness checks and Prometheus scraping

mod server;

pub use server::{build_router, run_server};
