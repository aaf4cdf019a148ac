use std::time::Duration;
use url::Url;

/// Timeout applied when no rule matches.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Per-destination override applied on top of the baseline bypass headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SitePolicy {
    pub extra_headers: Vec<(String, String)>,
    pub timeout: Duration,
}

impl SitePolicy {
    pub fn new(timeout: Duration) -> Self {
        Self {
            extra_headers: Vec::new(),
            timeout,
        }
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.extra_headers.push((name.to_string(), value.to_string()));
        self
    }
}

impl Default for SitePolicy {
    fn default() -> Self {
        Self::new(DEFAULT_TIMEOUT)
    }
}

/// A policy applied to every hostname containing `host_contains`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyRule {
    pub host_contains: String,
    pub policy: SitePolicy,
}

impl PolicyRule {
    pub fn matches(&self, hostname: &str) -> bool {
        hostname.contains(self.host_contains.as_str())
    }
}

/// Ordered rule list, first match wins.
///
/// Built once at startup and never mutated by requests.
#[derive(Debug, Clone)]
pub struct PolicyTable {
    rules: Vec<PolicyRule>,
    default: SitePolicy,
}

impl PolicyTable {
    pub fn new(rules: Vec<PolicyRule>, default: SitePolicy) -> Self {
        Self { rules, default }
    }

    /// Rules for destinations known to need special handling.
    pub fn builtin() -> Self {
        const ENCODINGS: &str = "gzip, deflate, br";
        let rules = vec![
            PolicyRule {
                host_contains: "youtube.com".to_string(),
                policy: SitePolicy::new(Duration::from_secs(20))
                    .header(
                        "Cookie",
                        "CONSENT=YES+; VISITOR_INFO1_LIVE=StKfsQgqQB8; YSC=DwKYllHNwuw; PREF=f6=40000000&f7=100",
                    )
                    .header("Accept-Encoding", ENCODINGS),
            },
            PolicyRule {
                host_contains: "roblox.com".to_string(),
                policy: SitePolicy::new(Duration::from_secs(15))
                    .header("Cache-Control", "max-age=0")
                    .header("Accept-Encoding", ENCODINGS),
            },
            PolicyRule {
                host_contains: "discord.com".to_string(),
                policy: SitePolicy::new(Duration::from_secs(15))
                    .header("Accept-Encoding", ENCODINGS)
                    .header("Origin", "https://discord.com"),
            },
            PolicyRule {
                host_contains: "google.com".to_string(),
                policy: SitePolicy::new(Duration::from_secs(10))
                    .header("Accept-Encoding", ENCODINGS)
                    .header("Cookie", "CONSENT=YES+; NID=511=SOMEVALUE;"),
            },
        ];
        Self::new(rules, SitePolicy::default())
    }

    pub fn resolve_host(&self, hostname: &str) -> &SitePolicy {
        self.rules
            .iter()
            .find(|rule| rule.matches(hostname))
            .map(|rule| &rule.policy)
            .unwrap_or(&self.default)
    }

    pub fn resolve(&self, url: &Url) -> &SitePolicy {
        self.resolve_host(url.host_str().unwrap_or_default())
    }

    pub fn rules(&self) -> &[PolicyRule] {
        &self.rules
    }

    pub fn default_policy(&self) -> &SitePolicy {
        &self.default
    }
}

impl Default for PolicyTable {
    fn default() -> Self {
        Self::builtin()
    }
}
