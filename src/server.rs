//! Inbound HTTP server: accepts connections and dispatches each request
//! either to the control plane or to the reverse proxy.

use crate::apps::ApplicationPool;
use crate::director::Director;
use crate::error::{json_error_response, ProxyErrorCode};
use crate::proxy::ReverseProxy;
use crate::status::status_response;
use crate::transport::Transport;
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info};

/// Host name reserved for the control plane
pub const CONTROL_HOST: &str = "devgate";

/// Maximum hostname length (DNS limit)
const MAX_HOSTNAME_LEN: usize = 253;

pub struct HttpServer<P> {
    bind_addr: SocketAddr,
    dispatcher: Arc<Dispatcher<P>>,
    shutdown_rx: watch::Receiver<bool>,
}

impl<P: ApplicationPool> HttpServer<P> {
    /// Create the server and subscribe the transport to app closures, so
    /// that a closed app never gets a request on a stale pooled connection.
    pub fn new(
        bind_addr: SocketAddr,
        pool: Arc<P>,
        transport: Arc<Transport>,
        debug: bool,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        let on_close = Arc::clone(&transport);
        pool.on_app_closed(Box::new(move |app| {
            debug!(app = app.name(), "App closed, dropping idle app connections");
            on_close.close_idle_connections();
        }));

        let proxy = ReverseProxy::new(Director::new(Arc::clone(&pool)), transport, debug);

        Self {
            bind_addr,
            dispatcher: Arc::new(Dispatcher { pool, proxy }),
            shutdown_rx,
        }
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher<P>> {
        &self.dispatcher
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    /// Accept connections on an already bound listener until shutdown
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "HTTP server listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let dispatcher = Arc::clone(&self.dispatcher);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, dispatcher).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("HTTP server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection<P: ApplicationPool>(
    stream: TcpStream,
    addr: SocketAddr,
    dispatcher: Arc<Dispatcher<P>>,
) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let dispatcher = Arc::clone(&dispatcher);
        async move { Ok::<_, hyper::Error>(dispatcher.handle_request(req, addr).await) }
    });

    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection_with_upgrades(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

/// Routes each request to the control plane or the proxy
pub struct Dispatcher<P> {
    pool: Arc<P>,
    proxy: ReverseProxy<P>,
}

impl<P: ApplicationPool> Dispatcher<P> {
    pub async fn handle_request(
        &self,
        req: Request<Incoming>,
        client_addr: SocketAddr,
    ) -> Response<BoxBody<Bytes, hyper::Error>> {
        let Some(host) = extract_hostname(&req) else {
            debug!(client = %client_addr, "Request without a usable host");
            return json_error_response(
                ProxyErrorCode::MissingHostHeader,
                "Missing or invalid Host header",
            );
        };

        if host == CONTROL_HOST {
            return self.control_request(&req);
        }

        self.proxy.serve(req, &host, client_addr).await
    }

    /// Requests addressed to [`CONTROL_HOST`]. Never resolves an app.
    fn control_request<B>(&self, req: &Request<B>) -> Response<BoxBody<Bytes, hyper::Error>> {
        match (req.method(), req.uri().path()) {
            // hyper drops the body of HEAD responses
            (&Method::GET | &Method::HEAD, "/status") => status_response(self.pool.as_ref()),
            (_, "/status") => method_not_allowed("GET, HEAD"),
            _ => not_found(),
        }
    }
}

fn method_not_allowed(allow: &'static str) -> Response<BoxBody<Bytes, hyper::Error>> {
    Response::builder()
        .status(StatusCode::METHOD_NOT_ALLOWED)
        .header("allow", allow)
        .header("content-type", "text/plain")
        .body(
            Full::new(Bytes::from_static(b"method not allowed"))
                .map_err(|never| match never {})
                .boxed(),
        )
        .expect("valid response with StatusCode enum and static headers")
}

fn not_found() -> Response<BoxBody<Bytes, hyper::Error>> {
    Response::builder()
        .status(StatusCode::NOT_FOUND)
        .header("content-type", "text/plain")
        .body(
            Full::new(Bytes::from_static(b"not found"))
                .map_err(|never| match never {})
                .boxed(),
        )
        .expect("valid response with StatusCode enum and static header")
}

/// Host of a request, from the Host header or the URI authority, lowercased
/// and without a port. Bracketed IPv6 literals keep their brackets.
///
/// Hosts that are too long, or contain anything besides letters, digits,
/// `-`, `.` and `_` (plus `:` inside IPv6 brackets), are rejected.
fn extract_hostname<B>(req: &Request<B>) -> Option<String> {
    let raw = req
        .headers()
        .get(hyper::header::HOST)
        .and_then(|h| h.to_str().ok())
        .or_else(|| req.uri().authority().map(|a| a.as_str()))?;

    let (hostname, is_ipv6) = if raw.starts_with('[') {
        let end = raw.find(']')?;
        (&raw[..=end], true)
    } else {
        (raw.split(':').next()?, false)
    };

    if hostname.is_empty() || hostname.len() > MAX_HOSTNAME_LEN {
        return None;
    }

    let allowed = |c: char| {
        c.is_ascii_alphanumeric()
            || matches!(c, '-' | '.' | '_')
            || (is_ipv6 && matches!(c, ':' | '[' | ']'))
    };
    if !hostname.chars().all(allowed) {
        return None;
    }

    Some(hostname.to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apps::AppPool;
    use crate::config::{AppConfig, PoolSettings};

    fn request_with_host(host: &str) -> Request<()> {
        Request::builder()
            .uri("/")
            .header("Host", host)
            .body(())
            .unwrap()
    }

    #[test]
    fn test_extract_hostname() {
        assert_eq!(
            extract_hostname(&request_with_host("Blog.Test:9280")),
            Some("blog.test".to_string())
        );
        assert_eq!(
            extract_hostname(&request_with_host("devgate")),
            Some("devgate".to_string())
        );
        assert_eq!(
            extract_hostname(&request_with_host("api.my-app.test")),
            Some("api.my-app.test".to_string())
        );
        assert_eq!(
            extract_hostname(&request_with_host("my_app.test")),
            Some("my_app.test".to_string())
        );
    }

    #[test]
    fn test_extract_hostname_ipv6_literal() {
        assert_eq!(
            extract_hostname(&request_with_host("[::1]:9280")),
            Some("[::1]".to_string())
        );
        assert_eq!(
            extract_hostname(&request_with_host("[FE80::1]")),
            Some("[fe80::1]".to_string())
        );
        assert_eq!(extract_hostname(&request_with_host("[::1")), None);
        assert_eq!(extract_hostname(&request_with_host("[::1/x]")), None);
    }

    #[test]
    fn test_extract_hostname_from_authority() {
        let req = Request::builder()
            .uri("http://shop.test:8080/cart")
            .body(())
            .unwrap();
        assert_eq!(extract_hostname(&req), Some("shop.test".to_string()));
    }

    #[test]
    fn test_extract_hostname_rejects_invalid() {
        let req = Request::builder().uri("/").body(()).unwrap();
        assert_eq!(extract_hostname(&req), None);

        assert_eq!(extract_hostname(&request_with_host("")), None);
        assert_eq!(extract_hostname(&request_with_host("bad host.test")), None);
        assert_eq!(extract_hostname(&request_with_host("evil/x.test")), None);

        let long = format!("{}.test", "a".repeat(MAX_HOSTNAME_LEN));
        assert_eq!(extract_hostname(&request_with_host(&long)), None);
    }

    #[tokio::test]
    async fn test_control_request_routes() {
        let pool = AppPool::new(PoolSettings::default());
        pool.register("blog", &AppConfig::http("127.0.0.1:3000"));
        let transport = Arc::new(Transport::new(Default::default()).unwrap());
        let (_tx, rx) = watch::channel(false);
        let server = HttpServer::new(
            "127.0.0.1:0".parse().unwrap(),
            Arc::clone(&pool),
            transport,
            false,
            rx,
        );
        let dispatcher = server.dispatcher();

        let status = Request::builder().uri("/status").body(()).unwrap();
        let response = dispatcher.control_request(&status);
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["blog"]["status"], "dead");

        let other = Request::builder().uri("/apps").body(()).unwrap();
        let response = dispatcher.control_request(&other);
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"not found");

        let head = Request::builder()
            .method(Method::HEAD)
            .uri("/status")
            .body(())
            .unwrap();
        assert_eq!(dispatcher.control_request(&head).status(), StatusCode::OK);

        let post = Request::builder()
            .method(Method::POST)
            .uri("/status")
            .body(())
            .unwrap();
        let response = dispatcher.control_request(&post);
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(response.headers().get("allow").unwrap(), "GET, HEAD");

        let post_other = Request::builder()
            .method(Method::POST)
            .uri("/apps")
            .body(())
            .unwrap();
        assert_eq!(
            dispatcher.control_request(&post_other).status(),
            StatusCode::NOT_FOUND
        );
    }

    #[tokio::test]
    async fn test_closing_an_app_resets_transport() {
        let pool = AppPool::new(PoolSettings::default());
        pool.register("blog", &AppConfig::http("127.0.0.1:3000"));
        let transport = Arc::new(Transport::new(Default::default()).unwrap());
        let (_tx, rx) = watch::channel(false);
        let _server = HttpServer::new(
            "127.0.0.1:0".parse().unwrap(),
            Arc::clone(&pool),
            Arc::clone(&transport),
            false,
            rx,
        );

        assert!(pool.close("blog"));
        assert_eq!(transport.stats().get_idle_resets(), 1);
    }
}
