use crate::error::{FetchError, Result};
use async_trait::async_trait;
use axum::http::HeaderMap;
use bytes::Bytes;
use reqwest::redirect;
use std::time::Duration;
use url::Url;

/// Fully buffered response from a target host.
#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Outbound GET used by the buffered fetcher.
///
/// Implementations return `Ok` for any status the host answered with; the
/// caller decides what counts as failure.
#[async_trait]
pub trait Upstream: Send + Sync {
    async fn get(&self, url: &Url, headers: HeaderMap, timeout: Duration)
        -> Result<UpstreamResponse>;
}

/// `reqwest` backed upstream with a bounded redirect chain.
pub struct ReqwestUpstream {
    client: reqwest::Client,
}

impl ReqwestUpstream {
    pub fn new(max_redirects: usize) -> std::result::Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .redirect(redirect::Policy::limited(max_redirects))
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Upstream for ReqwestUpstream {
    async fn get(
        &self,
        url: &Url,
        headers: HeaderMap,
        timeout: Duration,
    ) -> Result<UpstreamResponse> {
        let resp = self
            .client
            .get(url.clone())
            .headers(headers)
            .timeout(timeout)
            .send()
            .await
            .map_err(classify)?;

        let status = resp.status().as_u16();
        let headers = resp.headers().clone();
        let body = resp.bytes().await.map_err(classify)?;

        Ok(UpstreamResponse {
            status,
            headers,
            body,
        })
    }
}

/// Map a client error onto the fetch taxonomy.
pub fn classify(err: reqwest::Error) -> FetchError {
    if let Some(status) = err.status() {
        FetchError::UpstreamHttp {
            status: status.as_u16(),
            message: err.to_string(),
        }
    } else if err.is_timeout() || err.is_connect() {
        FetchError::NoResponse(err.to_string())
    } else {
        FetchError::Unknown(err.to_string())
    }
}
