//! HTTP query surface.
//!
//! Read-only dashboards poll these routes; the registry screen uses the two
//! routes gated by the admin secret.

pub mod auth;
pub mod routes;
pub mod server;

pub use server::{build_router, serve, ApiState};
