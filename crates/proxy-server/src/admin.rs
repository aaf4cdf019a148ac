use crate::fetcher::FetchResult;
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use mari_cache::TtlCache;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// State for the admin router.
#[derive(Clone)]
pub struct AdminState {
    pub cache: Arc<TtlCache<FetchResult>>,
    pub started: Instant,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheSnapshot {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub expired: u64,
    pub inserts: u64,
    pub hit_rate: f64,
    pub ttl_seconds: u64,
    pub uptime_seconds: u64,
}

impl CacheSnapshot {
    fn from_state(state: &AdminState) -> Self {
        let stats = state.cache.stats();
        let total = stats.hits + stats.misses;
        CacheSnapshot {
            entries: stats.current_size,
            hits: stats.hits,
            misses: stats.misses,
            expired: stats.expired,
            inserts: stats.inserts,
            hit_rate: if total > 0 {
                stats.hits as f64 / total as f64
            } else {
                0.0
            },
            ttl_seconds: state.cache.ttl().as_secs(),
            uptime_seconds: state.started.elapsed().as_secs(),
        }
    }
}

pub fn admin_router(state: AdminState, prom: Option<PrometheusHandle>) -> Router {
    let router = Router::new()
        .route("/api/stats", get(stats_handler))
        .with_state(state);

    match prom {
        Some(handle) => router.route(
            "/metrics",
            get(move || {
                let h = handle.clone();
                async move { h.render() }
            }),
        ),
        None => router,
    }
}

/// GET /api/stats: one-shot cache stats.
pub async fn stats_handler(State(state): State<AdminState>) -> impl IntoResponse {
    Json(CacheSnapshot::from_state(&state))
}

/// Periodically purge expired entries until `shutdown` fires.
pub async fn cache_sweeper<V: Send + Sync>(
    cache: Arc<TtlCache<V>>,
    every: Duration,
    shutdown: CancellationToken,
) {
    let mut interval = tokio::time::interval(every);
    // First tick completes immediately.
    interval.tick().await;

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let removed = cache.purge_expired();
                if removed > 0 {
                    tracing::debug!(removed, remaining = cache.len(), "purged expired cache entries");
                }
                metrics::gauge!("mari_cache_entries").set(cache.len() as f64);
            }
            _ = shutdown.cancelled() => break,
        }
    }
}
