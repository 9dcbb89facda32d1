//! Devgate - a local development router for `*.test` style hosts
//!
//! This library provides the request path of a development proxy that:
//! - Maps a request's Host to a named application by pruning subdomains
//!   (`api.blog.test` → `api.blog` → `blog` → `default`)
//! - Waits for the application to become ready before forwarding
//! - Forwards over a pooled HTTP/HTTPS transport with periodic body flushing
//! - Drops idle pooled connections whenever an application is closed
//! - Answers `GET /status` on the reserved `devgate` host with every app's state

pub mod apps;
pub mod body;
pub mod config;
pub mod director;
pub mod error;
pub mod proxy;
pub mod server;
pub mod status;
pub mod transport;

/// Package name
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Package version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
