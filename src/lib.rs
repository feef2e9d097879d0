//! Teamgate - A multi-tenant reverse proxy for per-team application instances
//!
//! Every team owns one instance of the same web application. Teamgate:
//! - Identifies the team of each request from its credential cookie
//! - Forwards the request to that team's instance when it is ready
//! - Redirects to a landing page when the credential is missing or the
//!   instance is restarting or gone
//! - Caches instance status and debounces activity reports per team so the
//!   orchestrator sees bounded load regardless of request rate
//! - Provisions, restarts and reclaims instances as Docker containers

pub mod activity;
pub mod admin;
pub mod config;
pub mod engine;
pub mod error;
pub mod identity;
pub mod landing;
pub mod orchestrator;
pub mod pool;
pub mod proxy;
pub mod status_cache;
pub mod transport;
