use crate::policy::SitePolicy;
use axum::http::header::{HeaderMap, HeaderName, HeaderValue, USER_AGENT};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

pub const BASELINE_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/112.0.0.0 Safari/537.36";

/// Headers that make an outbound request look like a desktop Chrome navigation.
const BASELINE: &[(&str, &str)] = &[
    ("user-agent", BASELINE_USER_AGENT),
    (
        "accept",
        "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,image/apng,*/*;q=0.8,application/signed-exchange;v=b3;q=0.7",
    ),
    ("accept-language", "en-US,en;q=0.9"),
    ("upgrade-insecure-requests", "1"),
    ("cache-control", "no-cache"),
    ("pragma", "no-cache"),
    ("x-forwarded-for", "8.8.8.8"),
    ("x-real-ip", "8.8.8.8"),
    ("x-forwarded-host", "google.com"),
    ("referer", "https://google.com/"),
    ("sec-fetch-dest", "document"),
    ("sec-fetch-mode", "navigate"),
    ("sec-fetch-site", "none"),
    ("sec-fetch-user", "?1"),
    ("dnt", "1"),
    (
        "sec-ch-ua",
        "\"Chromium\";v=\"112\", \"Google Chrome\";v=\"112\", \"Not:A-Brand\";v=\"99\"",
    ),
    ("sec-ch-ua-mobile", "?0"),
    ("sec-ch-ua-platform", "\"Windows\""),
];

pub const USER_AGENT_POOL: &[&str] = &[
    BASELINE_USER_AGENT,
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/16.4 Safari/605.1.15",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:109.0) Gecko/20100101 Firefox/112.0",
];

/// Decides, per call, whether to swap the user-agent and for which one.
pub trait UserAgentRotation: Send + Sync {
    fn pick(&self) -> Option<&'static str>;
}

/// Never rotates.
pub struct NoRotation;

impl UserAgentRotation for NoRotation {
    fn pick(&self) -> Option<&'static str> {
        None
    }
}

/// Rotates with a fixed probability, drawing uniformly from [`USER_AGENT_POOL`].
pub struct RandomRotation {
    probability: f64,
    rng: Mutex<StdRng>,
}

impl RandomRotation {
    pub fn from_entropy(probability: f64) -> Self {
        Self::with_rng(probability, StdRng::from_entropy())
    }

    /// Reproducible sequence of picks for a given seed.
    pub fn seeded(probability: f64, seed: u64) -> Self {
        Self::with_rng(probability, StdRng::seed_from_u64(seed))
    }

    fn with_rng(probability: f64, rng: StdRng) -> Self {
        let probability = if probability.is_finite() {
            probability.clamp(0.0, 1.0)
        } else {
            0.0
        };
        Self {
            probability,
            rng: Mutex::new(rng),
        }
    }

    pub fn probability(&self) -> f64 {
        self.probability
    }
}

impl UserAgentRotation for RandomRotation {
    fn pick(&self) -> Option<&'static str> {
        let mut rng = self.rng.lock();
        if !rng.gen_bool(self.probability) {
            return None;
        }
        USER_AGENT_POOL.choose(&mut *rng).copied()
    }
}

/// Builds the outbound header set for a resolved policy.
pub struct HeaderComposer {
    rotation: Box<dyn UserAgentRotation>,
}

impl HeaderComposer {
    pub fn new(rotation: Box<dyn UserAgentRotation>) -> Self {
        Self { rotation }
    }

    /// Baseline, then policy overrides, then a possible user-agent swap.
    pub fn compose(&self, policy: &SitePolicy) -> HeaderMap {
        let mut headers = HeaderMap::with_capacity(BASELINE.len() + policy.extra_headers.len());
        for &(name, value) in BASELINE {
            headers.insert(
                HeaderName::from_static(name),
                HeaderValue::from_static(value),
            );
        }

        for (name, value) in &policy.extra_headers {
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                (Ok(name), Ok(value)) => {
                    headers.insert(name, value);
                }
                _ => {
                    tracing::warn!(header = %name, "skipping invalid policy header");
                }
            }
        }

        if let Some(agent) = self.rotation.pick() {
            headers.insert(USER_AGENT, HeaderValue::from_static(agent));
        }

        headers
    }
}

impl Default for HeaderComposer {
    fn default() -> Self {
        Self::new(Box::new(NoRotation))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::PolicyTable;
    use std::time::Duration;

    struct Always(&'static str);

    impl UserAgentRotation for Always {
        fn pick(&self) -> Option<&'static str> {
            Some(self.0)
        }
    }

    #[test]
    fn default_policy_yields_baseline() {
        let composer = HeaderComposer::default();
        let headers = composer.compose(&SitePolicy::default());

        assert_eq!(headers.len(), BASELINE.len());
        assert_eq!(headers[USER_AGENT], BASELINE_USER_AGENT);
        assert_eq!(headers["x-forwarded-for"], "8.8.8.8");
        assert_eq!(headers["x-real-ip"], "8.8.8.8");
        assert_eq!(headers["referer"], "https://google.com/");
    }

    #[test]
    fn policy_headers_win_on_collision() {
        let composer = HeaderComposer::default();
        let table = PolicyTable::builtin();
        let headers = composer.compose(table.resolve_host("www.roblox.com"));

        assert_eq!(headers["cache-control"], "max-age=0");
        assert_eq!(headers["accept-encoding"], "gzip, deflate, br");
        // Untouched baseline entries survive.
        assert_eq!(headers["pragma"], "no-cache");
    }

    #[test]
    fn invalid_policy_header_is_skipped() {
        let composer = HeaderComposer::default();
        let policy = SitePolicy::new(Duration::from_secs(1))
            .header("bad header", "x")
            .header("X-Good", "yes");
        let headers = composer.compose(&policy);

        assert_eq!(headers["x-good"], "yes");
        assert_eq!(headers.len(), BASELINE.len() + 1);
    }

    #[test]
    fn rotation_replaces_user_agent() {
        let composer = HeaderComposer::new(Box::new(Always(USER_AGENT_POOL[2])));
        let headers = composer.compose(&SitePolicy::default());
        assert_eq!(headers[USER_AGENT], USER_AGENT_POOL[2]);
    }

    #[test]
    fn zero_probability_never_rotates() {
        let rotation = RandomRotation::seeded(0.0, 7);
        assert!((0..200).all(|_| rotation.pick().is_none()));
    }

    #[test]
    fn full_probability_always_picks_from_pool() {
        let rotation = RandomRotation::seeded(1.0, 7);
        for _ in 0..200 {
            let agent = rotation.pick().unwrap();
            assert!(USER_AGENT_POOL.contains(&agent));
        }
    }

    #[test]
    fn seeded_rotation_is_reproducible() {
        let a = RandomRotation::seeded(0.3, 42);
        let b = RandomRotation::seeded(0.3, 42);
        let seq_a: Vec<_> = (0..50).map(|_| a.pick()).collect();
        let seq_b: Vec<_> = (0..50).map(|_| b.pick()).collect();
        assert_eq!(seq_a, seq_b);
        // Over 50 draws at 0.3 both outcomes show up.
        assert!(seq_a.iter().any(Option::is_some));
        assert!(seq_a.iter().any(Option::is_none));
    }

    #[test]
    fn probability_is_clamped() {
        assert_eq!(RandomRotation::seeded(4.0, 1).probability(), 1.0);
        assert_eq!(RandomRotation::seeded(-1.0, 1).probability(), 0.0);
        assert_eq!(RandomRotation::seeded(f64::NAN, 1).probability(), 0.0);
    }
}
