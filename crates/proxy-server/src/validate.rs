use crate::error::{FetchError, Result};
use url::Url;

/// Accept `candidate` only if it is an absolute http(s) URL with a host.
///
/// Purely syntactic. Nothing is resolved or contacted.
pub fn validate_url(candidate: &str) -> Result<Url> {
    let parsed = Url::parse(candidate.trim())
        .map_err(|e| FetchError::InvalidUrl(format!("{candidate}: {e}")))?;

    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(FetchError::InvalidUrl(format!(
            "unsupported scheme '{}'",
            parsed.scheme()
        )));
    }

    match parsed.host_str() {
        Some(host) if !host.is_empty() => Ok(parsed),
        _ => Err(FetchError::InvalidUrl(format!("missing host in {candidate}"))),
    }
}

/// Cache key for a validated URL.
///
/// `Url` already normalizes scheme and host case, default ports and an
/// empty path, so its serialization is the key.
pub fn cache_key(url: &Url) -> String {
    url.as_str().to_string()
}
