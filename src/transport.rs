//! Pooled outbound transport used to reach applications
//!
//! All proxied traffic goes through one [`Transport`]. It keeps idle
//! connections to apps for reuse and can drop every idle connection at once,
//! which the router does whenever an app is closed so a restarted app never
//! receives a request on a connection opened to its previous incarnation.

use crate::body::ExpectContinueBody;
use crate::config::TransportSettings;
use http_body_util::combinators::BoxBody;
use http_body_util::BodyExt;
use hyper::body::{Bytes, Incoming};
use hyper::header::EXPECT;
use hyper::{Request, Response, StatusCode, Uri};
use hyper_rustls::{HttpsConnector, MaybeHttpsStream};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use parking_lot::RwLock;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tower::Service;
use tracing::debug;

/// Body type of requests sent through the transport
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Error type for transport operations
#[derive(Debug, Error)]
pub enum TransportError {
    /// Error from the HTTP client (dial, handshake, or exchange)
    #[error("client error: {0}")]
    Client(#[from] hyper_util::client::legacy::Error),
    /// TLS client configuration could not be built
    #[error("TLS setup error: {0}")]
    Tls(#[from] rustls::Error),
}

/// Counters for the transport
#[derive(Debug, Default)]
pub struct TransportStats {
    /// Requests sent through the transport
    pub requests: AtomicU64,
    /// New connections dialed to apps
    pub dials: AtomicU64,
    /// Times the idle pool was dropped
    pub idle_resets: AtomicU64,
}

impl TransportStats {
    pub fn record_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dial(&self) {
        self.dials.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_idle_reset(&self) {
        self.idle_resets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    pub fn get_dials(&self) -> u64 {
        self.dials.load(Ordering::Relaxed)
    }

    pub fn get_idle_resets(&self) -> u64 {
        self.idle_resets.load(Ordering::Relaxed)
    }
}

/// Connector for app connections.
///
/// Plain http dials are bounded by the TCP connect timeout of the inner
/// `HttpConnector`; https dials additionally get the TLS handshake timeout.
#[derive(Clone)]
pub struct BackendConnector {
    inner: HttpsConnector<HttpConnector>,
    connect_timeout: Duration,
    tls_handshake_timeout: Duration,
    stats: Arc<TransportStats>,
}

impl Service<Uri> for BackendConnector {
    type Response = MaybeHttpsStream<TokioIo<TcpStream>>;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, uri: Uri) -> Self::Future {
        let is_https = uri.scheme_str() == Some("https");
        let budget = self.connect_timeout + self.tls_handshake_timeout;
        let stats = Arc::clone(&self.stats);

        debug!(%uri, "Dialing app");
        let connecting = self.inner.call(uri);

        Box::pin(async move {
            stats.record_dial();
            if !is_https {
                return connecting.await;
            }
            match tokio::time::timeout(budget, connecting).await {
                Ok(result) => result,
                Err(_) => Err("TLS handshake timed out".into()),
            }
        })
    }
}

/// Pooled HTTP(S) client for app connections
pub struct Transport {
    client: RwLock<Client<BackendConnector, ProxyBody>>,
    connector: BackendConnector,
    settings: TransportSettings,
    stats: Arc<TransportStats>,
}

impl Transport {
    pub fn new(settings: TransportSettings) -> Result<Self, TransportError> {
        let mut http = HttpConnector::new();
        http.enforce_http(false);
        http.set_nodelay(true);
        http.set_connect_timeout(Some(settings.connect_timeout()));
        http.set_keepalive(Some(settings.keep_alive()));

        let https = hyper_rustls::HttpsConnectorBuilder::new()
            .with_provider_and_webpki_roots(rustls::crypto::ring::default_provider())?
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .wrap_connector(http);

        let stats = Arc::new(TransportStats::default());
        let connector = BackendConnector {
            inner: https,
            connect_timeout: settings.connect_timeout(),
            tls_handshake_timeout: settings.tls_handshake_timeout(),
            stats: Arc::clone(&stats),
        };

        debug!(
            max_idle = settings.max_idle_per_host,
            idle_timeout_secs = settings.idle_timeout_secs,
            connect_timeout_ms = settings.connect_timeout_ms,
            "Transport initialized"
        );

        Ok(Self {
            client: RwLock::new(build_client(&connector, &settings)),
            connector,
            settings,
            stats,
        })
    }

    pub fn settings(&self) -> &TransportSettings {
        &self.settings
    }

    pub fn stats(&self) -> Arc<TransportStats> {
        Arc::clone(&self.stats)
    }

    /// Send a request whose URI already points at the app
    pub async fn send(&self, req: Request<ProxyBody>) -> Result<Response<Incoming>, TransportError> {
        let expects_continue = req
            .headers()
            .get(EXPECT)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.eq_ignore_ascii_case("100-continue"))
            .unwrap_or(false);

        let hold = self.settings.expect_continue_timeout();
        let req = if expects_continue && !hold.is_zero() {
            hold_until_continue(req, hold)
        } else {
            req
        };

        self.stats.record_request();

        // The response future owns its own handle to the client, so the lock
        // is released before any I/O happens.
        let response = self.client.read().request(req);
        Ok(response.await?)
    }

    /// Drop every idle pooled connection.
    ///
    /// The pool is replaced by an empty one. Requests already in flight keep
    /// their connections until they finish; those connections are then closed
    /// instead of being returned for reuse.
    pub fn close_idle_connections(&self) {
        let fresh = build_client(&self.connector, &self.settings);
        let previous = std::mem::replace(&mut *self.client.write(), fresh);
        drop(previous);

        self.stats.record_idle_reset();
        debug!("Idle app connections closed");
    }
}

/// Hold the body until the app's `100 Continue` arrives, bounded by `hold`.
///
/// hyper reports interim responses only on HTTP/1 connections; elsewhere the
/// callback is dropped unused, which releases the body right away.
fn hold_until_continue(req: Request<ProxyBody>, hold: Duration) -> Request<ProxyBody> {
    let (parts, body) = req.into_parts();
    let (body, signal) = ExpectContinueBody::new(body, hold);
    let mut req = Request::from_parts(parts, body.boxed());

    hyper::ext::on_informational(&mut req, move |res| {
        if res.status() == StatusCode::CONTINUE {
            debug!("App sent 100 Continue, releasing request body");
            signal.release();
        }
    });
    req
}

fn build_client(
    connector: &BackendConnector,
    settings: &TransportSettings,
) -> Client<BackendConnector, ProxyBody> {
    Client::builder(TokioExecutor::new())
        .pool_timer(TokioTimer::new())
        .pool_max_idle_per_host(settings.max_idle_per_host)
        .pool_idle_timeout(settings.idle_timeout())
        .build(connector.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::Empty;

    #[test]
    fn test_transport_stats() {
        let stats = TransportStats::default();

        assert_eq!(stats.get_requests(), 0);
        assert_eq!(stats.get_dials(), 0);
        assert_eq!(stats.get_idle_resets(), 0);

        stats.record_request();
        stats.record_request();
        stats.record_dial();
        stats.record_idle_reset();
        assert_eq!(stats.get_requests(), 2);
        assert_eq!(stats.get_dials(), 1);
        assert_eq!(stats.get_idle_resets(), 1);
    }

    #[tokio::test]
    async fn test_transport_creation() {
        let settings = TransportSettings {
            max_idle_per_host: 5,
            idle_timeout_secs: 30,
            ..TransportSettings::default()
        };

        let transport = Transport::new(settings).unwrap();
        assert_eq!(transport.settings().max_idle_per_host, 5);
        assert_eq!(transport.settings().idle_timeout(), Duration::from_secs(30));
        assert_eq!(transport.stats().get_requests(), 0);
    }

    #[tokio::test]
    async fn test_close_idle_connections_with_empty_pool() {
        let transport = Transport::new(TransportSettings::default()).unwrap();
        transport.close_idle_connections();
        transport.close_idle_connections();
        assert_eq!(transport.stats().get_idle_resets(), 2);
        assert_eq!(transport.stats().get_dials(), 0);
    }

    #[tokio::test]
    async fn test_connection_refused_is_client_error() {
        // Bind then drop to get a port nothing listens on
        let addr = {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };

        let transport = Transport::new(TransportSettings::default()).unwrap();
        let req = Request::builder()
            .uri(format!("http://{}/", addr))
            .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed())
            .unwrap();

        let err = transport.send(req).await.unwrap_err();
        assert!(matches!(err, TransportError::Client(_)));
        assert_eq!(transport.stats().get_requests(), 1);
        assert_eq!(transport.stats().get_dials(), 1);
    }
}
