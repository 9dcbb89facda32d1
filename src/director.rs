//! Host → application resolution.
//!
//! A request for `api.blog.test` is served by the first registered app among
//! `api.blog`, `blog`, and finally `default`:
//!
//! 1. the last label is cut once (`api.blog.test` → `api.blog`);
//! 2. while nothing matches, the leftmost label is pruned
//!    (`api.blog` → `blog` → empty);
//! 3. when every candidate is exhausted the `default` app is used.
//!
//! Only "unknown app" triggers pruning; any other pool error ends the
//! resolution immediately.

use crate::apps::{App, ApplicationPool, DEFAULT_APP};
use crate::error::PoolError;
use std::sync::Arc;
use tracing::debug;

/// Where a request should be sent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    /// Name of the app that matched
    pub app: String,
    pub scheme: String,
    pub address: String,
}

/// Remove everything from the last dot onwards (`a.b.test` → `a.b`)
pub fn trim_last_label(host: &str) -> &str {
    match host.rfind('.') {
        Some(dot) => &host[..dot],
        None => host,
    }
}

/// Remove the leftmost label (`a.b` → `b`, `b` → ``)
pub fn prune_subdomain(name: &str) -> &str {
    match name.find('.') {
        Some(dot) => &name[dot + 1..],
        None => "",
    }
}

/// Resolves hosts against an application pool
pub struct Director<P> {
    pool: Arc<P>,
}

impl<P> Clone for Director<P> {
    fn clone(&self) -> Self {
        Self {
            pool: Arc::clone(&self.pool),
        }
    }
}

impl<P: ApplicationPool> Director<P> {
    pub fn new(pool: Arc<P>) -> Self {
        Self { pool }
    }

    /// Find the app serving `host` without waiting for it
    pub fn find_app(&self, host: &str) -> Result<Arc<App>, PoolError> {
        let mut name = trim_last_label(host);

        while !name.is_empty() {
            match self.pool.lookup(name) {
                Ok(app) => return Ok(app),
                Err(PoolError::UnknownApp(_)) => {
                    debug!(host, candidate = name, "No app for candidate, pruning");
                    name = prune_subdomain(name);
                }
                Err(e) => return Err(e),
            }
        }

        debug!(host, "Falling back to default app");
        self.pool.lookup(DEFAULT_APP)
    }

    /// Resolve `host` to a running app's scheme and address
    pub async fn resolve(&self, host: &str) -> Result<Target, PoolError> {
        let app = self.find_app(host)?;
        app.wait_until_ready().await?;

        Ok(Target {
            app: app.name().to_string(),
            scheme: app.scheme().to_string(),
            address: app.address().to_string(),
        })
    }
}
