//! Reverse proxy engine: resolve the target app, forward, stream the response

use crate::apps::ApplicationPool;
use crate::body::FlushIntervalBody;
use crate::director::{Director, Target};
use crate::error::{json_error_response, PoolError, ProxyErrorCode};
use crate::transport::{ProxyBody, Transport};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderName, HeaderValue, CONNECTION, HOST, TE, UPGRADE};
use hyper::upgrade::OnUpgrade;
use hyper::{HeaderMap, Request, Response, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";
/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded host
const X_FORWARDED_HOST: &str = "x-forwarded-host";
/// Header name for forwarded proto
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Headers that only apply to a single connection and are never forwarded
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Streams requests to the app chosen by the [`Director`]
pub struct ReverseProxy<P> {
    director: Director<P>,
    transport: Arc<Transport>,
    flush_interval: Duration,
    debug: bool,
}

impl<P: ApplicationPool> ReverseProxy<P> {
    pub fn new(director: Director<P>, transport: Arc<Transport>, debug: bool) -> Self {
        let flush_interval = transport.settings().flush_interval();
        Self {
            director,
            transport,
            flush_interval,
            debug,
        }
    }

    /// Proxy one request addressed to `host`
    pub async fn serve(
        &self,
        mut req: Request<Incoming>,
        host: &str,
        client_addr: SocketAddr,
    ) -> Response<BoxBody<Bytes, hyper::Error>> {
        let request_id = req
            .headers()
            .get(X_REQUEST_ID)
            .and_then(|v| v.to_str().ok())
            .map(String::from)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        // Resolution must finish before anything is sent to an app
        let target = match self.director.resolve(host).await {
            Ok(target) => target,
            Err(e) => {
                warn!(host, request_id, error = %e, "Failed to resolve app");
                return resolution_error_response(&e);
            }
        };

        let client_upgrade = if is_upgrade_request(&req) {
            Some(hyper::upgrade::on(&mut req))
        } else {
            None
        };

        let outbound = match build_outbound_request(
            req,
            &target,
            host,
            client_addr,
            &request_id,
            client_upgrade.is_some(),
        ) {
            Ok(outbound) => outbound,
            Err(e) => {
                error!(app = %target.app, address = %target.address, error = %e, "Invalid app address");
                return json_error_response(
                    ProxyErrorCode::InternalError,
                    "Invalid application address",
                );
            }
        };

        if self.debug {
            info!(
                request_id,
                method = %outbound.method(),
                uri = %outbound.uri(),
                app = %target.app,
                headers = ?outbound.headers(),
                "Proxying request"
            );
        } else {
            debug!(request_id, app = %target.app, uri = %outbound.uri(), "Proxying request");
        }

        let response = match self.transport.send(outbound).await {
            Ok(response) => response,
            Err(e) => {
                error!(app = %target.app, address = %target.address, request_id, error = %e, "Failed to forward request");
                return json_error_response(
                    ProxyErrorCode::ConnectionFailed,
                    "Failed to connect to application",
                );
            }
        };

        if self.debug {
            info!(
                request_id,
                app = %target.app,
                status = %response.status(),
                headers = ?response.headers(),
                "App responded"
            );
        }

        match client_upgrade {
            Some(client_upgrade) if response.status() == StatusCode::SWITCHING_PROTOCOLS => {
                splice_upgrade(response, client_upgrade, target.app, request_id)
            }
            _ => {
                let (mut parts, body) = response.into_parts();
                remove_hop_by_hop_headers(&mut parts.headers);
                let body = FlushIntervalBody::new(body, self.flush_interval).boxed();
                Response::from_parts(parts, body)
            }
        }
    }
}

fn resolution_error_response(err: &PoolError) -> Response<BoxBody<Bytes, hyper::Error>> {
    let message = match err {
        PoolError::UnknownApp(_) => "No application matches this host".to_string(),
        PoolError::BootFailed { name, .. } => format!("Application '{}' failed to start", name),
        PoolError::BootTimeout { name, timeout } => format!(
            "Application '{}' did not start within {} seconds",
            name,
            timeout.as_secs()
        ),
        PoolError::Unavailable(_) => "Application pool unavailable".to_string(),
    };
    json_error_response(err.error_code(), message)
}

/// Check if a request asks for a protocol upgrade (e.g. WebSocket)
fn is_upgrade_request<B>(req: &Request<B>) -> bool {
    let has_upgrade_connection = req
        .headers()
        .get(CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_lowercase().contains("upgrade"))
        .unwrap_or(false);

    has_upgrade_connection && req.headers().contains_key(UPGRADE)
}

/// Remove hop-by-hop headers, including any listed in `Connection`
pub fn remove_hop_by_hop_headers(headers: &mut HeaderMap) {
    let listed: Vec<String> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|name| name.trim().to_ascii_lowercase())
        .filter(|name| !name.is_empty())
        .collect();

    for name in listed {
        if let Ok(name) = HeaderName::from_bytes(name.as_bytes()) {
            headers.remove(name);
        }
    }
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(*name);
    }
}

/// Build the request sent to the app. The inbound Host is kept so apps see
/// the virtual host they were addressed by.
fn build_outbound_request(
    req: Request<Incoming>,
    target: &Target,
    host: &str,
    client_addr: SocketAddr,
    request_id: &str,
    is_upgrade: bool,
) -> Result<Request<ProxyBody>, hyper::http::Error> {
    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let uri: Uri = format!("{}://{}{}", target.scheme, target.address, path).parse()?;

    let (parts, body) = req.into_parts();
    let mut headers = parts.headers;

    if is_upgrade {
        // Keep Connection/Upgrade so the app can switch protocols
        for name in ["keep-alive", "proxy-connection", "te", "trailer", "transfer-encoding"] {
            headers.remove(name);
        }
    } else {
        let wants_trailers = headers
            .get_all(TE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .any(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case("trailers")));
        remove_hop_by_hop_headers(&mut headers);
        if wants_trailers {
            headers.insert(TE, HeaderValue::from_static("trailers"));
        }
    }

    if !headers.contains_key(HOST) {
        if let Some(authority) = parts.uri.authority() {
            if let Ok(value) = HeaderValue::from_str(authority.as_str()) {
                headers.insert(HOST, value);
            }
        }
    }

    if let Ok(value) = HeaderValue::from_str(request_id) {
        headers.insert(X_REQUEST_ID, value);
    }

    // Append the client to any existing X-Forwarded-For chain
    let client_ip = client_addr.ip().to_string();
    let forwarded_for = match headers.get(X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
        Some(prior) if !prior.trim().is_empty() => format!("{}, {}", prior, client_ip),
        _ => client_ip,
    };
    if let Ok(value) = HeaderValue::from_str(&forwarded_for) {
        headers.insert(X_FORWARDED_FOR, value);
    }

    if let Ok(value) = HeaderValue::from_str(host) {
        headers.insert(X_FORWARDED_HOST, value);
    }
    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));

    let mut outbound = Request::new(body.boxed());
    *outbound.method_mut() = parts.method;
    *outbound.uri_mut() = uri;
    *outbound.headers_mut() = headers;
    Ok(outbound)
}

/// Answer the client's upgrade with the app's 101 and join both connections
fn splice_upgrade(
    mut response: Response<Incoming>,
    client_upgrade: OnUpgrade,
    app: String,
    request_id: String,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let app_upgrade = hyper::upgrade::on(&mut response);

    tokio::spawn(async move {
        match tokio::try_join!(client_upgrade, app_upgrade) {
            Ok((client, upstream)) => {
                let mut client = TokioIo::new(client);
                let mut upstream = TokioIo::new(upstream);
                match tokio::io::copy_bidirectional(&mut client, &mut upstream).await {
                    Ok((client_to_app, app_to_client)) => {
                        debug!(app, request_id, client_to_app, app_to_client, "Upgraded connection closed");
                    }
                    Err(e) => {
                        debug!(app, request_id, error = %e, "Upgraded connection closed with error");
                    }
                }
            }
            Err(e) => {
                warn!(app, request_id, error = %e, "Failed to upgrade connection");
            }
        }
    });

    let (parts, _) = response.into_parts();
    Response::from_parts(
        parts,
        Empty::<Bytes>::new().map_err(|never| match never {}).boxed(),
    )
}
