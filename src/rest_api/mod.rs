//! HTTP surface of the manager
//!
//! Serves the Prometheus registry on `/metrics` and a liveness check on
//! `/health`.

mod server;

pub use server::{bind, router, serve};
