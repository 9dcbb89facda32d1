//! `GET /status` on the control host: a snapshot of every app

use crate::apps::ApplicationPool;
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::warn;

/// One app's entry in the status report
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AppStatusEntry {
    pub scheme: String,
    pub address: String,
    /// "dead", "booting", "running" or "unknown"
    pub status: &'static str,
    pub log: String,
}

/// Snapshot every app in the pool, keyed by app name
pub fn status_snapshot<P: ApplicationPool>(pool: &P) -> BTreeMap<String, AppStatusEntry> {
    let mut statuses = BTreeMap::new();

    pool.for_each_app(&mut |app| {
        statuses.insert(
            app.name().to_string(),
            AppStatusEntry {
                scheme: app.scheme().to_string(),
                address: app.address().to_string(),
                status: app.status().as_str(),
                log: app.log(),
            },
        );
    });

    statuses
}

/// The JSON status response
pub fn status_response<P: ApplicationPool>(pool: &P) -> Response<BoxBody<Bytes, hyper::Error>> {
    let statuses = status_snapshot(pool);
    let body = match serde_json::to_vec(&statuses) {
        Ok(body) => body,
        Err(e) => {
            warn!(error = %e, "Failed to serialize app statuses");
            Vec::new()
        }
    };

    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "application/json")
        .body(Full::new(Bytes::from(body)).map_err(|never| match never {}).boxed())
        .expect("valid response with StatusCode enum and static header")
}
