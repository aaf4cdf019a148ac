mod admin;
mod config;
mod error;
mod fetcher;
mod headers;
mod history;
mod policy;
mod proxy;
mod tunnel;
mod upstream;
mod validate;

use admin::{admin_router, cache_sweeper, AdminState};
use config::Config;
use fetcher::ContentFetcher;
use headers::{HeaderComposer, RandomRotation, UserAgentRotation};
use history::InMemoryHistory;
use mari_cache::{SystemClock, TtlCache};
use notify::{Event, EventKind, RecursiveMode, Watcher};
use parking_lot::Mutex;
use proxy::AppState;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;
use tunnel::TunnelProxy;
use upstream::ReqwestUpstream;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    let config_path =
        PathBuf::from(std::env::var("MARI_CONFIG").unwrap_or_else(|_| "config.toml".to_string()));

    let config = if config_path.exists() {
        match Config::load(&config_path) {
            Ok(c) => {
                tracing::info!(path = %config_path.display(), "loaded config");
                c
            }
            Err(e) => {
                tracing::error!(error = %e, path = %config_path.display(), "failed to load config, using defaults");
                Config::default_config()
            }
        }
    } else {
        tracing::info!(path = %config_path.display(), "no config found, using defaults");
        Config::default_config()
    };

    let prom_handle = match metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder()
    {
        Ok(h) => Some(h),
        Err(e) => {
            tracing::warn!(error = %e, "prometheus recorder not installed, /metrics disabled");
            None
        }
    };

    let cache = Arc::new(TtlCache::new(config.ttl(), Arc::new(SystemClock)));
    let policies = Arc::new(config.policy_table());

    let rotation: Box<dyn UserAgentRotation> = match config.fetch.rotation_seed {
        Some(seed) => Box::new(RandomRotation::seeded(
            config.fetch.user_agent_rotation_probability,
            seed,
        )),
        None => Box::new(RandomRotation::from_entropy(
            config.fetch.user_agent_rotation_probability,
        )),
    };
    let composer = Arc::new(HeaderComposer::new(rotation));

    let upstream = match ReqwestUpstream::new(config.fetch.max_redirects) {
        Ok(u) => Arc::new(u),
        Err(e) => {
            tracing::error!(error = %e, "failed to build upstream client");
            std::process::exit(1);
        }
    };
    let tunnel = match TunnelProxy::new(Arc::clone(&policies), Arc::clone(&composer)) {
        Ok(t) => t,
        Err(e) => {
            tracing::error!(error = %e, "failed to build tunnel client");
            std::process::exit(1);
        }
    };

    let fetcher = ContentFetcher::new(
        Arc::clone(&cache),
        Arc::clone(&policies),
        composer,
        upstream,
    );

    let state = Arc::new(AppState {
        fetcher,
        tunnel,
        history: Arc::new(InMemoryHistory::new()),
    });

    let shutdown = CancellationToken::new();

    tokio::spawn(cache_sweeper(
        Arc::clone(&cache),
        Duration::from_secs(config.cache.sweep_interval_seconds.max(1)),
        shutdown.clone(),
    ));

    let admin = admin_router(
        AdminState {
            cache: Arc::clone(&cache),
            started: Instant::now(),
        },
        prom_handle,
    );
    let app = proxy::router(Arc::clone(&state)).layer(TraceLayer::new_for_http());

    let listen_addr = config.server.listen_addr.clone();
    let admin_addr = config.server.admin_addr.clone();

    tracing::info!(
        listen = %listen_addr,
        admin = %admin_addr,
        ttl_seconds = config.cache.ttl_seconds,
        policies = policies.rules().len(),
        rotation_probability = config.fetch.user_agent_rotation_probability,
        "mari proxy starting"
    );

    let listener = match tokio::net::TcpListener::bind(&listen_addr).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!(error = %e, addr = %listen_addr, "failed to bind proxy listener");
            std::process::exit(1);
        }
    };
    let admin_listener = match tokio::net::TcpListener::bind(&admin_addr).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!(error = %e, addr = %admin_addr, "failed to bind admin listener");
            std::process::exit(1);
        }
    };

    spawn_config_watcher(config_path, config, Arc::clone(&cache));

    let shutdown_clone = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal(shutdown_clone).await;
    });

    // ConnectInfo feeds the client IP into history records.
    let proxy_future = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown.clone().cancelled_owned());

    let admin_future =
        axum::serve(admin_listener, admin).with_graceful_shutdown(shutdown.clone().cancelled_owned());

    tokio::select! {
        result = proxy_future => {
            if let Err(e) = result {
                tracing::error!(error = %e, "proxy server error");
            }
        }
        result = admin_future => {
            if let Err(e) = result {
                tracing::error!(error = %e, "admin server error");
            }
        }
    }

    tracing::info!("mari proxy shut down");
}

/// Listen for SIGINT (Ctrl+C) or SIGTERM and cancel the shutdown token.
async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {},
                    _ = sigterm.recv() => {},
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "SIGTERM handler unavailable, waiting for Ctrl+C");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }

    tracing::info!("shutdown signal received, draining connections...");
    token.cancel();
}

/// Watch the config file and apply the settings that may change at runtime.
fn spawn_config_watcher(
    config_path: PathBuf,
    initial_config: Config,
    cache: Arc<TtlCache<fetcher::FetchResult>>,
) {
    let current_config = Arc::new(Mutex::new(initial_config));

    let config_path_clone = config_path.clone();
    let mut watcher = match notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
        if let Ok(event) = res {
            if matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                match Config::load(&config_path_clone) {
                    Ok(new_config) => {
                        let mut old = current_config.lock();
                        config::diff_and_apply(&old, &new_config, &cache);
                        *old = new_config;
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "failed to reload config");
                    }
                }
            }
        }
    }) {
        Ok(w) => w,
        Err(e) => {
            tracing::warn!(error = %e, "failed to start config watcher");
            return;
        }
    };

    if let Err(e) = watcher.watch(&config_path, RecursiveMode::NonRecursive) {
        tracing::debug!(error = %e, path = %config_path.display(), "config file not watched");
        return;
    }

    // Leak the watcher so it lives for the process lifetime
    std::mem::forget(watcher);
    tracing::info!("config file watcher started");
}
