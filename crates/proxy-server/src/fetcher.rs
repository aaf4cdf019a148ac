use crate::error::{FetchError, Result};
use crate::headers::HeaderComposer;
use crate::policy::PolicyTable;
use crate::upstream::{Upstream, UpstreamResponse};
use crate::validate::cache_key;
use axum::http::{HeaderMap, StatusCode};
use bytes::Bytes;
use mari_cache::TtlCache;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use url::Url;

/// A header value as seen by the caller: repeated headers become a list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum HeaderField {
    One(String),
    Many(Vec<String>),
}

pub type HeaderFields = BTreeMap<String, HeaderField>;

/// What a buffered fetch hands back, and what the cache stores.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchResult {
    pub body: Bytes,
    pub status: u16,
    pub headers: HeaderFields,
}

impl FetchResult {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

impl From<UpstreamResponse> for FetchResult {
    fn from(resp: UpstreamResponse) -> Self {
        Self {
            body: resp.body,
            status: resp.status,
            headers: header_fields(&resp.headers),
        }
    }
}

/// Flatten a `HeaderMap` into name → value(s), lossy on non-UTF-8 values.
pub fn header_fields(headers: &HeaderMap) -> HeaderFields {
    let mut fields = HeaderFields::new();
    for name in headers.keys() {
        let mut values: Vec<String> = headers
            .get_all(name)
            .iter()
            .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
            .collect();
        let field = if values.len() == 1 {
            HeaderField::One(values.remove(0))
        } else {
            HeaderField::Many(values)
        };
        fields.insert(name.as_str().to_string(), field);
    }
    fields
}

/// Outcome of [`ContentFetcher::fetch`], noting whether it came from cache.
#[derive(Debug, Clone)]
pub struct Fetched {
    pub result: Arc<FetchResult>,
    pub cache_hit: bool,
}

/// Buffered fetch: cache, then policy + headers + upstream, then cache on 2xx.
#[derive(Clone)]
pub struct ContentFetcher {
    cache: Arc<TtlCache<FetchResult>>,
    policies: Arc<PolicyTable>,
    composer: Arc<HeaderComposer>,
    upstream: Arc<dyn Upstream>,
}

impl ContentFetcher {
    pub fn new(
        cache: Arc<TtlCache<FetchResult>>,
        policies: Arc<PolicyTable>,
        composer: Arc<HeaderComposer>,
        upstream: Arc<dyn Upstream>,
    ) -> Self {
        Self {
            cache,
            policies,
            composer,
            upstream,
        }
    }

    pub fn cache(&self) -> &Arc<TtlCache<FetchResult>> {
        &self.cache
    }

    /// Fetch a validated URL.
    ///
    /// The miss path runs on its own task, so it finishes (and populates the
    /// cache) even if the caller stops waiting.
    pub async fn fetch(&self, url: &Url) -> Result<Fetched> {
        let key = cache_key(url);

        if let Some(result) = self.cache.get(&key) {
            tracing::debug!(key = %key, "cache HIT");
            metrics::counter!("mari_cache_hits_total").increment(1);
            return Ok(Fetched {
                result,
                cache_hit: true,
            });
        }
        metrics::counter!("mari_cache_misses_total").increment(1);

        let this = self.clone();
        let url = url.clone();
        let result = tokio::spawn(async move { this.fetch_upstream(key, url).await })
            .await
            .map_err(|e| FetchError::Unknown(e.to_string()))??;

        Ok(Fetched {
            result,
            cache_hit: false,
        })
    }

    async fn fetch_upstream(&self, key: String, url: Url) -> Result<Arc<FetchResult>> {
        let start = Instant::now();
        let policy = self.policies.resolve(&url);
        let headers = self.composer.compose(policy);

        let response = match self.upstream.get(&url, headers, policy.timeout).await {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(url = %url, error = %e, kind = e.kind(), "upstream fetch failed");
                metrics::counter!("mari_fetch_total", "outcome" => e.kind()).increment(1);
                return Err(e);
            }
        };

        if response.status >= 500 {
            let message = StatusCode::from_u16(response.status)
                .ok()
                .and_then(|s| s.canonical_reason())
                .unwrap_or("server error")
                .to_string();
            tracing::warn!(url = %url, status = response.status, "upstream server error");
            metrics::counter!("mari_fetch_total", "outcome" => "upstream_http").increment(1);
            return Err(FetchError::UpstreamHttp {
                status: response.status,
                message,
            });
        }

        let result = FetchResult::from(response);
        let cached = result.is_success();
        tracing::debug!(
            key = %key,
            status = result.status,
            cached,
            latency_ms = start.elapsed().as_millis() as u64,
            "cache MISS → upstream"
        );

        if cached {
            self.cache.put(key, result.clone());
            metrics::counter!("mari_fetch_total", "outcome" => "cached").increment(1);
        } else {
            metrics::counter!("mari_fetch_total", "outcome" => "uncached").increment(1);
        }

        Ok(Arc::new(result))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::headers::NoRotation;
    use crate::validate::validate_url;
    use async_trait::async_trait;
    use mari_cache::ManualClock;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// What the stub answers with.
    #[derive(Clone)]
    pub(crate) enum Reply {
        Status(u16, &'static str),
        Timeout,
    }

    pub(crate) struct StubUpstream {
        reply: Mutex<Reply>,
        delay: Duration,
        calls: AtomicUsize,
        pub(crate) last_headers: Mutex<Option<HeaderMap>>,
        pub(crate) last_timeout: Mutex<Option<Duration>>,
    }

    impl StubUpstream {
        pub(crate) fn new(reply: Reply) -> Self {
            Self::with_delay(reply, Duration::ZERO)
        }

        pub(crate) fn with_delay(reply: Reply, delay: Duration) -> Self {
            Self {
                reply: Mutex::new(reply),
                delay,
                calls: AtomicUsize::new(0),
                last_headers: Mutex::new(None),
                last_timeout: Mutex::new(None),
            }
        }

        pub(crate) fn set_reply(&self, reply: Reply) {
            *self.reply.lock() = reply;
        }

        pub(crate) fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Upstream for StubUpstream {
        async fn get(
            &self,
            _url: &Url,
            headers: HeaderMap,
            timeout: Duration,
        ) -> Result<UpstreamResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last_headers.lock() = Some(headers);
            *self.last_timeout.lock() = Some(timeout);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let reply = self.reply.lock().clone();
            match reply {
                Reply::Status(status, body) => {
                    let mut headers = HeaderMap::new();
                    headers.insert("content-type", "text/html".parse().unwrap());
                    headers.append("set-cookie", "a=1".parse().unwrap());
                    headers.append("set-cookie", "b=2".parse().unwrap());
                    Ok(UpstreamResponse {
                        status,
                        headers,
                        body: Bytes::from_static(body.as_bytes()),
                    })
                }
                Reply::Timeout => Err(FetchError::NoResponse(
                    "operation timed out".to_string(),
                )),
            }
        }
    }

    pub(crate) const TTL: Duration = Duration::from_secs(1800);

    pub(crate) fn fetcher_with(
        stub: Arc<StubUpstream>,
    ) -> (ContentFetcher, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let cache = Arc::new(TtlCache::new(TTL, clock.clone()));
        let fetcher = ContentFetcher::new(
            cache,
            Arc::new(PolicyTable::builtin()),
            Arc::new(HeaderComposer::new(Box::new(NoRotation))),
            stub,
        );
        (fetcher, clock)
    }

    fn url(s: &str) -> Url {
        validate_url(s).unwrap()
    }

    #[tokio::test]
    async fn success_is_cached_and_replayed() {
        let stub = Arc::new(StubUpstream::new(Reply::Status(200, "<p>hi</p>")));
        let (fetcher, clock) = fetcher_with(stub.clone());
        let target = url("https://example.com");

        let first = fetcher.fetch(&target).await.unwrap();
        assert!(!first.cache_hit);
        assert_eq!(first.result.status, 200);
        assert_eq!(stub.calls(), 1);

        clock.advance(Duration::from_secs(5));
        let second = fetcher.fetch(&target).await.unwrap();
        assert!(second.cache_hit);
        assert_eq!(second.result, first.result);
        assert_eq!(stub.calls(), 1);
    }

    #[tokio::test]
    async fn expired_entry_triggers_refetch() {
        let stub = Arc::new(StubUpstream::new(Reply::Status(200, "v1")));
        let (fetcher, clock) = fetcher_with(stub.clone());
        let target = url("https://example.com/page");

        fetcher.fetch(&target).await.unwrap();
        clock.advance(TTL + Duration::from_secs(1));
        let again = fetcher.fetch(&target).await.unwrap();

        assert!(!again.cache_hit);
        assert_eq!(stub.calls(), 2);
    }

    #[tokio::test]
    async fn client_errors_are_returned_but_not_cached() {
        let stub = Arc::new(StubUpstream::new(Reply::Status(404, "not here")));
        let (fetcher, _) = fetcher_with(stub.clone());
        let target = url("https://example.com/missing");

        let first = fetcher.fetch(&target).await.unwrap();
        assert_eq!(first.result.status, 404);
        assert_eq!(first.result.body, Bytes::from_static(b"not here"));
        assert!(fetcher.cache().is_empty());

        fetcher.fetch(&target).await.unwrap();
        assert_eq!(stub.calls(), 2);
    }

    #[tokio::test]
    async fn redirect_terminal_status_is_not_cached() {
        let stub = Arc::new(StubUpstream::new(Reply::Status(302, "")));
        let (fetcher, _) = fetcher_with(stub.clone());

        let fetched = fetcher.fetch(&url("https://example.com/")).await.unwrap();
        assert_eq!(fetched.result.status, 302);
        assert!(fetcher.cache().is_empty());
    }

    #[tokio::test]
    async fn server_error_is_upstream_http() {
        let stub = Arc::new(StubUpstream::new(Reply::Status(503, "down")));
        let (fetcher, _) = fetcher_with(stub.clone());

        let err = fetcher
            .fetch(&url("https://blocked.example"))
            .await
            .unwrap_err();
        match err {
            FetchError::UpstreamHttp { status, .. } => assert_eq!(status, 503),
            other => panic!("expected UpstreamHttp, got {other:?}"),
        }
        assert!(fetcher.cache().is_empty());
    }

    #[tokio::test]
    async fn timeout_is_no_response() {
        let stub = Arc::new(StubUpstream::new(Reply::Timeout));
        let (fetcher, _) = fetcher_with(stub.clone());

        let err = fetcher
            .fetch(&url("https://example.com"))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::NoResponse(_)));
    }

    #[tokio::test]
    async fn hit_skips_policy_and_headers() {
        let stub = Arc::new(StubUpstream::new(Reply::Status(200, "ok")));
        let (fetcher, _) = fetcher_with(stub.clone());
        let target = url("https://www.youtube.com/watch?v=1");

        fetcher.fetch(&target).await.unwrap();
        *stub.last_headers.lock() = None;
        fetcher.fetch(&target).await.unwrap();
        assert!(stub.last_headers.lock().is_none());
    }

    #[tokio::test]
    async fn miss_applies_site_policy() {
        let stub = Arc::new(StubUpstream::new(Reply::Status(200, "ok")));
        let (fetcher, _) = fetcher_with(stub.clone());

        fetcher
            .fetch(&url("https://m.youtube.com/"))
            .await
            .unwrap();

        assert_eq!(*stub.last_timeout.lock(), Some(Duration::from_secs(20)));
        let headers = stub.last_headers.lock().clone().unwrap();
        assert!(headers["cookie"].to_str().unwrap().contains("CONSENT=YES+"));
        assert_eq!(headers["x-real-ip"], "8.8.8.8");
    }

    #[tokio::test]
    async fn later_success_supersedes_entry() {
        let stub = Arc::new(StubUpstream::new(Reply::Status(200, "v1")));
        let (fetcher, clock) = fetcher_with(stub.clone());
        let target = url("https://example.com/");

        fetcher.fetch(&target).await.unwrap();
        clock.advance(TTL + Duration::from_secs(1));
        stub.set_reply(Reply::Status(200, "v2"));
        fetcher.fetch(&target).await.unwrap();

        let hit = fetcher.fetch(&target).await.unwrap();
        assert!(hit.cache_hit);
        assert_eq!(hit.result.body, Bytes::from_static(b"v2"));
    }

    #[tokio::test]
    async fn concurrent_misses_are_not_coalesced() {
        let stub = Arc::new(StubUpstream::with_delay(
            Reply::Status(200, "ok"),
            Duration::from_millis(50),
        ));
        let (fetcher, _) = fetcher_with(stub.clone());
        let target = url("https://example.com/same");

        let (a, b) = tokio::join!(fetcher.fetch(&target), fetcher.fetch(&target));
        assert!(!a.unwrap().cache_hit);
        assert!(!b.unwrap().cache_hit);
        assert_eq!(stub.calls(), 2);
    }

    #[test]
    fn repeated_headers_become_lists() {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", "text/html".parse().unwrap());
        headers.append("set-cookie", "a=1".parse().unwrap());
        headers.append("set-cookie", "b=2".parse().unwrap());

        let fields = header_fields(&headers);
        assert_eq!(
            fields["content-type"],
            HeaderField::One("text/html".to_string())
        );
        assert_eq!(
            fields["set-cookie"],
            HeaderField::Many(vec!["a=1".to_string(), "b=2".to_string()])
        );
        assert_eq!(
            serde_json::to_value(&fields).unwrap(),
            serde_json::json!({"content-type": "text/html", "set-cookie": ["a=1", "b=2"]})
        );
    }
}
