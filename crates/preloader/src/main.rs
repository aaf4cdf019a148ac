mod targets;

use clap::Parser;
use futures_util::stream::{self, StreamExt};
use reqwest::Client;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

/// MaRi preloader: fills the proxy cache without touching visible history.
#[derive(Parser)]
#[command(name = "preloader")]
struct Args {
    /// Proxy base URL
    #[arg(long, default_value = "http://127.0.0.1:5000")]
    proxy_url: String,

    /// File with one target URL per line
    #[arg(long)]
    file: Option<PathBuf>,

    /// Number of preload requests in flight at once
    #[arg(long, default_value_t = 8)]
    concurrency: usize,

    /// Per-request timeout in seconds
    #[arg(long, default_value_t = 30)]
    timeout_secs: u64,

    /// Re-run every N seconds to keep entries warm (0 = run once)
    #[arg(long, default_value_t = 0)]
    interval_secs: u64,

    /// Target URLs to warm
    urls: Vec<String>,
}

/// Fields of the proxy's reply the preloader cares about.
#[derive(Deserialize)]
struct ProxyReply {
    status: Option<u16>,
    message: Option<String>,
}

#[derive(Debug, Default)]
struct Summary {
    warmed: usize,
    failed: usize,
}

async fn preload_one(client: &Client, proxy_url: &str, target: &str) -> bool {
    let url = match targets::preload_url(proxy_url, target) {
        Ok(u) => u,
        Err(e) => {
            tracing::warn!(target_url = %target, error = %e, "cannot build preload URL");
            return false;
        }
    };

    let start = Instant::now();
    let resp = match client.get(url).header("X-Preload-Only", "true").send().await {
        Ok(r) => r,
        Err(e) => {
            tracing::warn!(target_url = %target, error = %e, "preload request failed");
            return false;
        }
    };

    let proxy_status = resp.status();
    let cache = resp
        .headers()
        .get("x-cache")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("-")
        .to_string();

    match resp.json::<ProxyReply>().await {
        Ok(reply) if proxy_status.is_success() => {
            tracing::info!(
                target_url = %target,
                upstream_status = reply.status,
                cache = %cache,
                latency_ms = start.elapsed().as_millis() as u64,
                "preloaded"
            );
            reply.status.is_some_and(|s| (200..300).contains(&s))
        }
        Ok(reply) => {
            tracing::warn!(
                target_url = %target,
                status = proxy_status.as_u16(),
                message = reply.message.as_deref().unwrap_or(""),
                "proxy refused preload"
            );
            false
        }
        Err(e) => {
            tracing::warn!(target_url = %target, error = %e, "unreadable proxy reply");
            false
        }
    }
}

async fn run_pass(client: &Client, args: &Args, targets: &[String]) -> Summary {
    let results: Vec<bool> = stream::iter(targets)
        .map(|t| preload_one(client, &args.proxy_url, t))
        .buffer_unordered(args.concurrency.max(1))
        .collect()
        .await;

    let warmed = results.iter().filter(|ok| **ok).count();
    Summary {
        warmed,
        failed: results.len() - warmed,
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let from_file = match &args.file {
        Some(path) => match targets::load_file(path) {
            Ok(list) => list,
            Err(e) => {
                tracing::error!(path = %path.display(), error = %e, "failed to read target file");
                std::process::exit(2);
            }
        },
        None => Vec::new(),
    };
    let targets = targets::merge(args.urls.clone(), from_file);
    if targets.is_empty() {
        tracing::error!("no target URLs given");
        std::process::exit(2);
    }

    let client = match Client::builder()
        .timeout(Duration::from_secs(args.timeout_secs))
        .build()
    {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(error = %e, "failed to build HTTP client");
            std::process::exit(1);
        }
    };

    tracing::info!(
        proxy = %args.proxy_url,
        targets = targets.len(),
        concurrency = args.concurrency,
        interval_secs = args.interval_secs,
        "preloader starting"
    );

    loop {
        let start = Instant::now();
        let summary = run_pass(&client, &args, &targets).await;
        tracing::info!(
            warmed = summary.warmed,
            failed = summary.failed,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "pass complete"
        );

        if args.interval_secs == 0 {
            if summary.failed > 0 {
                std::process::exit(1);
            }
            break;
        }
        tokio::time::sleep(Duration::from_secs(args.interval_secs)).await;
    }
}
