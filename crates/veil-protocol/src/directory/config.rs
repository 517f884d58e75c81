use std::time::Duration;

use crate::directory::RelayNodeInfo;
use crate::types::RelayRole;

/// Default directory endpoints, tried in order.
pub const DEFAULT_DIRECTORY_ENDPOINTS: &[&str] = &[
    "https://directory.veil.network/api/v1/relays",
    "https://directory-backup.veil.network/api/v1/relays",
];

/// Trust assigned to generated bootstrap relays.
pub const BOOTSTRAP_TRUST_SCORE: f64 = 0.8;
/// Bandwidth assumed for bootstrap relays (10 MB/s).
pub const BOOTSTRAP_BANDWIDTH: u64 = 10 * 1024 * 1024;
/// Latency assumed for bootstrap relays before the first probe.
pub const BOOTSTRAP_LATENCY_MS: u64 = 100;

/// One bootstrap relay slot.
#[derive(Debug, Clone)]
pub struct BootstrapRegion {
    pub region: String,
    pub roles: Vec<RelayRole>,
    pub endpoint: String,
    /// Pinned public key. When absent a keypair is generated at startup.
    pub public_key: Option<Vec<u8>>,
}

impl BootstrapRegion {
    pub fn new(region: &str, roles: Vec<RelayRole>) -> Self {
        Self {
            region: region.to_string(),
            roles,
            endpoint: format!("wss://relay-{region}.veil.network"),
            public_key: None,
        }
    }

    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn public_key(mut self, key: Vec<u8>) -> Self {
        self.public_key = Some(key);
        self
    }
}

fn default_bootstrap_regions() -> Vec<BootstrapRegion> {
    vec![
        BootstrapRegion::new("us-east", vec![RelayRole::Entry, RelayRole::Middle]),
        BootstrapRegion::new("eu-west", vec![RelayRole::Middle, RelayRole::Exit]),
        BootstrapRegion::new("ap-southeast", vec![RelayRole::Entry, RelayRole::Exit]),
        BootstrapRegion::new("eu-central", vec![RelayRole::Any]),
        BootstrapRegion::new("us-west", vec![RelayRole::Middle]),
    ]
}

/// Configuration for a [`RelayDirectory`](crate::RelayDirectory).
///
/// ```rust
/// use std::time::Duration;
/// use veil_protocol::DirectoryConfig;
///
/// let config = DirectoryConfig::new()
///     .directory_endpoints(vec!["https://dir.example.net/relays".into()])
///     .health_check_interval(Duration::from_secs(60))
///     .min_trust_score(0.5);
/// ```
#[derive(Debug, Clone)]
pub struct DirectoryConfig {
    pub(crate) directory_endpoints: Vec<String>,
    pub(crate) health_check_interval: Duration,
    pub(crate) min_trust_score: f64,
    pub(crate) use_bootstrap_fallback: bool,
    pub(crate) custom_relays: Option<Vec<RelayNodeInfo>>,
    pub(crate) bootstrap_regions: Vec<BootstrapRegion>,
    pub(crate) stale_threshold: Duration,
    pub(crate) probe_timeout: Duration,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl DirectoryConfig {
    /// Create a new config with defaults.
    ///
    /// If `VEIL_DIRECTORY_URLS` is set (comma separated), it replaces the
    /// default endpoint list. [`.directory_endpoints()`](Self::directory_endpoints)
    /// overrides both.
    pub fn new() -> Self {
        let directory_endpoints = std::env::var("VEIL_DIRECTORY_URLS")
            .ok()
            .map(|s| parse_endpoint_list(&s))
            .filter(|list| !list.is_empty())
            .unwrap_or_else(|| {
                DEFAULT_DIRECTORY_ENDPOINTS
                    .iter()
                    .map(|s| s.to_string())
                    .collect()
            });

        Self {
            directory_endpoints,
            health_check_interval: Duration::from_secs(5 * 60),
            min_trust_score: 0.3,
            use_bootstrap_fallback: true,
            custom_relays: None,
            bootstrap_regions: default_bootstrap_regions(),
            stale_threshold: Duration::from_secs(60 * 60),
            probe_timeout: Duration::from_secs(5),
        }
    }

    pub fn directory_endpoints(mut self, endpoints: Vec<String>) -> Self {
        self.directory_endpoints = endpoints;
        self
    }

    /// Period of the background health check (default: 5 min).
    pub fn health_check_interval(mut self, interval: Duration) -> Self {
        self.health_check_interval = interval;
        self
    }

    /// Relays published below this trust are ignored (default: 0.3).
    pub fn min_trust_score(mut self, score: f64) -> Self {
        self.min_trust_score = score.clamp(0.0, 1.0);
        self
    }

    pub fn use_bootstrap_fallback(mut self, enabled: bool) -> Self {
        self.use_bootstrap_fallback = enabled;
        self
    }

    /// Use exactly these relays. Replaces the bootstrap set and disables
    /// remote refresh during `initialize`.
    pub fn custom_relays(mut self, relays: Vec<RelayNodeInfo>) -> Self {
        self.custom_relays = Some(relays);
        self
    }

    pub fn bootstrap_regions(mut self, regions: Vec<BootstrapRegion>) -> Self {
        self.bootstrap_regions = regions;
        self
    }

    /// Non-bootstrap relays unseen for this long are evicted (default: 1 h).
    pub fn stale_threshold(mut self, threshold: Duration) -> Self {
        self.stale_threshold = threshold;
        self
    }

    /// Deadline for one health probe (default: 5 s).
    pub fn probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }
}

fn parse_endpoint_list(s: &str) -> Vec<String> {
    s.split(',')
        .map(str::trim)
        .filter(|e| !e.is_empty())
        .map(String::from)
        .collect()
}
