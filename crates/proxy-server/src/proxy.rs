use crate::fetcher::{ContentFetcher, HeaderFields};
use crate::history::{HistoryRecord, HistorySink};
use crate::tunnel::TunnelProxy;
use crate::validate::validate_url;
use axum::body::Body;
use axum::extract::{ConnectInfo, Query, State};
use axum::http::{HeaderMap, HeaderValue, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

/// Header marking cache-warming calls that must not show up in history.
pub const PRELOAD_HEADER: &str = "x-preload-only";

/// Shared application state passed to all handlers.
pub struct AppState {
    pub fetcher: ContentFetcher,
    pub tunnel: TunnelProxy,
    pub history: Arc<dyn HistorySink>,
}

#[derive(Debug, Deserialize)]
pub struct TargetQuery {
    pub url: Option<String>,
}

/// Body of a successful buffered fetch.
#[derive(Debug, Serialize)]
pub struct ProxyResponse<'a> {
    pub html: String,
    pub status: u16,
    pub headers: &'a HeaderFields,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/proxy", get(proxy_handler))
        .route("/api/direct-proxy", any(direct_proxy_handler))
        .route("/api/history", get(history_handler))
        .with_state(state)
}

/// GET /api/proxy: buffered fetch returned as JSON.
pub async fn proxy_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TargetQuery>,
    req: Request<Body>,
) -> Response {
    let start = Instant::now();
    let raw_url = query.url.unwrap_or_default();

    let url = match validate_url(&raw_url) {
        Ok(u) => u,
        Err(e) => {
            tracing::debug!(url = %raw_url, error = %e, "rejected target");
            return e.into_response();
        }
    };

    let preload = is_preload(req.headers());
    let client_ip = client_ip(&req);

    let outcome = state.fetcher.fetch(&url).await;

    if !preload {
        let record = match &outcome {
            Ok(_) => HistoryRecord::success(&raw_url, &client_ip),
            Err(e) => HistoryRecord::failure(&raw_url, &client_ip, e.to_string()),
        };
        state.history.add_to_history(record).await;
        metrics::counter!("mari_history_records_total").increment(1);
    }

    match outcome {
        Ok(fetched) => {
            tracing::info!(
                url = %url,
                status = fetched.result.status,
                cache = if fetched.cache_hit { "HIT" } else { "MISS" },
                preload,
                latency_ms = start.elapsed().as_millis() as u64,
                "proxied"
            );
            let body = ProxyResponse {
                html: String::from_utf8_lossy(&fetched.result.body).into_owned(),
                status: fetched.result.status,
                headers: &fetched.result.headers,
            };
            let mut response = Json(body).into_response();
            response.headers_mut().insert(
                "x-cache",
                HeaderValue::from_static(if fetched.cache_hit { "HIT" } else { "MISS" }),
            );
            response
        }
        Err(e) => {
            tracing::error!(url = %url, error = %e, kind = e.kind(), "proxy error");
            e.into_response()
        }
    }
}

/// ANY /api/direct-proxy: stream the exchange to the named target.
pub async fn direct_proxy_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TargetQuery>,
    req: Request<Body>,
) -> Response {
    let Some(raw_url) = query.url.filter(|u| !u.is_empty()) else {
        return message(StatusCode::BAD_REQUEST, "URL parameter is required");
    };
    let destination = match validate_url(&raw_url) {
        Ok(u) => u,
        Err(_) => return message(StatusCode::BAD_REQUEST, "Invalid URL format"),
    };

    tracing::info!(destination = %destination, method = %req.method(), "proxying to");
    state.tunnel.forward(destination, req).await
}

/// GET /api/history: what the sink has recorded, newest first.
pub async fn history_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.history.get_history().await)
}

fn message(status: StatusCode, msg: &str) -> Response {
    (status, Json(serde_json::json!({ "message": msg }))).into_response()
}

fn is_preload(headers: &HeaderMap) -> bool {
    headers
        .get(PRELOAD_HEADER)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == "true")
}

fn client_ip(req: &Request<Body>) -> String {
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}
