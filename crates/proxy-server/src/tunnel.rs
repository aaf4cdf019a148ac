//! Dynamic-destination passthrough.
//!
//! Every inbound request names its own target, so the tunnel holds no
//! upstream configuration: each call maps `(destination, inbound)` to one
//! outbound request and relays the answer. The cache is never involved.

use crate::headers::HeaderComposer;
use crate::policy::PolicyTable;
use axum::body::{self, Body};
use axum::http::header::{self, HeaderMap, HeaderName, HeaderValue};
use axum::http::{Request, Response, StatusCode};
use reqwest::redirect;
use std::sync::Arc;
use url::Url;

/// Largest inbound request body the tunnel will relay.
const MAX_REQUEST_BODY: usize = 16 * 1024 * 1024;

/// Value of the marker header added to every relayed response.
pub const PROXY_MARKER: &str = "MaRi";

/// Connection-scoped headers that must not cross the proxy.
static HOP_BY_HOP: [HeaderName; 7] = [
    header::CONNECTION,
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

pub struct TunnelProxy {
    client: reqwest::Client,
    policies: Arc<PolicyTable>,
    composer: Arc<HeaderComposer>,
}

impl TunnelProxy {
    pub fn new(
        policies: Arc<PolicyTable>,
        composer: Arc<HeaderComposer>,
    ) -> Result<Self, reqwest::Error> {
        // Redirects go back to the client and bodies pass through still encoded.
        let client = reqwest::Client::builder()
            .redirect(redirect::Policy::none())
            .no_gzip()
            .no_brotli()
            .no_deflate()
            .build()?;
        Ok(Self {
            client,
            policies,
            composer,
        })
    }

    /// Relay `req` to `destination` and stream the answer back.
    ///
    /// The response body is a live upstream stream. If the client goes away
    /// the body is dropped, which closes the upstream connection.
    pub async fn forward(&self, destination: Url, req: Request<Body>) -> Response<Body> {
        let (parts, inbound_body) = req.into_parts();
        let policy = self.policies.resolve(&destination);
        let headers = outbound_headers(&parts.headers, self.composer.compose(policy));

        let payload = match body::to_bytes(inbound_body, MAX_REQUEST_BODY).await {
            Ok(b) => b,
            Err(e) => {
                tracing::warn!(error = %e, "failed to read tunnel request body");
                return error_envelope(&e.to_string());
            }
        };

        tracing::debug!(method = %parts.method, destination = %destination, "tunnel request");

        let outbound = self
            .client
            .request(parts.method.clone(), destination.clone())
            .headers(headers)
            .body(payload)
            .send();

        let upstream = match tokio::time::timeout(policy.timeout, outbound).await {
            Ok(Ok(resp)) => resp,
            Ok(Err(e)) => {
                tracing::error!(error = %e, destination = %destination, "tunnel upstream request failed");
                metrics::counter!("mari_tunnel_requests_total", "outcome" => "error").increment(1);
                return error_envelope(&e.to_string());
            }
            Err(_) => {
                tracing::error!(
                    destination = %destination,
                    timeout_ms = policy.timeout.as_millis() as u64,
                    "tunnel upstream timed out"
                );
                metrics::counter!("mari_tunnel_requests_total", "outcome" => "error").increment(1);
                return error_envelope(&format!(
                    "timed out after {}ms",
                    policy.timeout.as_millis()
                ));
            }
        };

        metrics::counter!("mari_tunnel_requests_total", "outcome" => "relayed").increment(1);

        let status = upstream.status();
        let mut headers = upstream.headers().clone();
        rewrite_response_headers(&mut headers);

        let mut response = Response::new(Body::from_stream(upstream.bytes_stream()));
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        response
    }
}

/// Inbound end-to-end headers, overlaid by the composed bypass set.
pub fn outbound_headers(inbound: &HeaderMap, composed: HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::with_capacity(inbound.len() + composed.len());
    for (name, value) in inbound {
        if is_hop_by_hop(name) || name == header::HOST || name == header::CONTENT_LENGTH {
            continue;
        }
        out.append(name.clone(), value.clone());
    }

    let mut last: Option<HeaderName> = None;
    for (name, value) in composed {
        // `None` means another value for the previous name.
        match name {
            Some(name) => {
                out.insert(name.clone(), value);
                last = Some(name);
            }
            None => {
                if let Some(name) = &last {
                    out.append(name.clone(), value);
                }
            }
        }
    }
    out
}

/// Strip hop-by-hop headers and open the response up for cross-origin embedding.
pub fn rewrite_response_headers(headers: &mut HeaderMap) {
    for name in &HOP_BY_HOP {
        headers.remove(name);
    }
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, POST, OPTIONS"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("Origin, X-Requested-With, Content-Type, Accept"),
    );
    headers.insert(
        HeaderName::from_static("x-proxied-by"),
        HeaderValue::from_static(PROXY_MARKER),
    );
}

fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.contains(name) || name.as_str() == "keep-alive"
}

/// The single failure shape the tunnel reports.
pub fn error_envelope(message: &str) -> Response<Body> {
    let body = serde_json::json!({
        "error": "Proxy Error",
        "message": message,
        "status": 500,
    });
    let mut response = Response::new(Body::from(body.to_string()));
    *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    response
}
