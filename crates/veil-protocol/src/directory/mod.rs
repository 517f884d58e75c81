//! Relay directory: the known relay set, its health, and path selection.
//!
//! The directory starts from a bootstrap set (one relay per configured
//! region), merges whatever the first reachable directory endpoint
//! publishes, and then probes every relay on a fixed interval. Probes
//! move trust scores; relays that stop answering eventually fall out of
//! the cache unless they are bootstrap relays.

pub mod config;
pub mod health;
pub mod selection;
pub mod source;
pub mod types;

pub use config::{BootstrapRegion, DirectoryConfig};
pub use selection::{score_relay, SelectionCriteria};
pub use source::{parse_relay_list, DirectorySource, HttpDirectorySource};
pub use types::{DirectoryStats, RelayNodeInfo, RelayRecord};

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use veil_transport::{connect_with_timeout, Connector};

use crate::crypto::{HybridCrypto, HybridKem};
use crate::types::{now_ms, RelayId, RelayRole};
use crate::VeilError;

use config::{BOOTSTRAP_BANDWIDTH, BOOTSTRAP_LATENCY_MS, BOOTSTRAP_TRUST_SCORE};
use selection::{
    first_unfillable, path_roles, rank_candidates, slots_fillable, uniform_index, TOP_CANDIDATES,
};

/// Timeout for one directory fetch.
pub const DIRECTORY_FETCH_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Default)]
struct RelayCache {
    relays: HashMap<RelayId, RelayNodeInfo>,
    bootstrap: HashSet<RelayId>,
}

impl RelayCache {
    fn insert(&mut self, relay: RelayNodeInfo) {
        self.relays.insert(relay.id.clone(), relay);
    }

    fn online(&self) -> impl Iterator<Item = &RelayNodeInfo> {
        self.relays.values().filter(|r| r.online)
    }
}

/// Known relays, their health, and selection by role.
///
/// Owned by the caller; call [`initialize`](Self::initialize) once and
/// [`shutdown`](Self::shutdown) when done.
pub struct RelayDirectory<C: HybridCrypto = HybridKem> {
    config: DirectoryConfig,
    crypto: Arc<C>,
    source: Arc<dyn DirectorySource>,
    connector: Arc<dyn Connector>,
    cache: Mutex<RelayCache>,
    health_task: Mutex<Option<JoinHandle<()>>>,
}

impl<C: HybridCrypto> std::fmt::Debug for RelayDirectory<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let cache = self.cache.lock();
        f.debug_struct("RelayDirectory")
            .field("relays", &cache.relays.len())
            .field("bootstrap", &cache.bootstrap.len())
            .finish()
    }
}

impl<C: HybridCrypto> RelayDirectory<C> {
    pub fn new(
        config: DirectoryConfig,
        crypto: Arc<C>,
        source: Arc<dyn DirectorySource>,
        connector: Arc<dyn Connector>,
    ) -> Self {
        Self {
            config,
            crypto,
            source,
            connector,
            cache: Mutex::new(RelayCache::default()),
            health_task: Mutex::new(None),
        }
    }

    /// Populate the cache and start periodic health checks.
    ///
    /// A configured custom relay list replaces the bootstrap set and skips
    /// the remote refresh. Unreachable directory endpoints are not an error.
    pub async fn initialize(self: &Arc<Self>) -> Result<(), VeilError> {
        if let Some(custom) = &self.config.custom_relays {
            let mut cache = self.cache.lock();
            for relay in custom {
                cache.insert(relay.clone());
            }
            tracing::info!(count = custom.len(), "directory: using custom relay list");
        } else {
            if self.config.use_bootstrap_fallback {
                self.load_bootstrap_relays()?;
            }
            match self.refresh_directory().await {
                Ok(merged) => tracing::info!(merged, "directory: refreshed"),
                Err(e) => tracing::warn!("directory: refresh failed, using bootstrap relays: {e}"),
            }
        }

        self.start_health_checks();
        Ok(())
    }

    fn load_bootstrap_relays(&self) -> Result<(), VeilError> {
        let mut generated = Vec::with_capacity(self.config.bootstrap_regions.len());
        for region in &self.config.bootstrap_regions {
            let public_key = match &region.public_key {
                Some(key) => key.clone(),
                None => {
                    let keypair = self.crypto.generate_keypair()?;
                    self.crypto
                        .serialize_public_key(&self.crypto.public_key(&keypair))
                }
            };

            let mut relay = RelayNodeInfo::new(public_key, &region.endpoint, region.roles.clone())
                .with_region(&region.region)
                .with_trust(BOOTSTRAP_TRUST_SCORE)
                .with_bandwidth(BOOTSTRAP_BANDWIDTH)
                .with_latency(BOOTSTRAP_LATENCY_MS);
            relay.version = "bootstrap".into();
            generated.push(relay);
        }

        let mut cache = self.cache.lock();
        for relay in generated {
            cache.bootstrap.insert(relay.id.clone());
            cache.insert(relay);
        }
        tracing::debug!(count = cache.bootstrap.len(), "directory: bootstrap relays loaded");
        Ok(())
    }

    /// Fetch from the configured endpoints in order, merging the first
    /// well-formed list. Returns how many relays were merged.
    pub async fn refresh_directory(&self) -> Result<usize, VeilError> {
        for endpoint in &self.config.directory_endpoints {
            let relays = match self.source.fetch(endpoint).await {
                Ok(body) => match parse_relay_list(&body) {
                    Ok(relays) => relays,
                    Err(e) => {
                        tracing::warn!(endpoint = %endpoint, "directory: bad response: {e}");
                        continue;
                    }
                },
                Err(e) => {
                    tracing::warn!(endpoint = %endpoint, "directory: unavailable: {e}");
                    continue;
                }
            };

            let min_trust = self.config.min_trust_score;
            let mut cache = self.cache.lock();
            let mut merged = 0;
            for relay in relays.into_iter().filter(|r| r.trust_score >= min_trust) {
                cache.insert(relay);
                merged += 1;
            }
            tracing::debug!(endpoint = %endpoint, merged, "directory: merged relay list");
            return Ok(merged);
        }

        Err(VeilError::Directory("no directory endpoint reachable".into()))
    }

    /// Probe one relay. Returns whether it answered.
    pub async fn check_relay_health(&self, id: &RelayId) -> Result<bool, VeilError> {
        let endpoint = self
            .cache
            .lock()
            .relays
            .get(id)
            .map(|r| r.endpoint.clone())
            .ok_or_else(|| VeilError::UnknownRelay(id.to_string()))?;

        let started = tokio::time::Instant::now();
        let probe =
            connect_with_timeout(self.connector.as_ref(), &endpoint, self.config.probe_timeout)
                .await;
        let latency_ms = started.elapsed().as_millis() as u64;

        let mut cache = self.cache.lock();
        let Some(relay) = cache.relays.get_mut(id) else {
            return Ok(false);
        };
        match probe {
            Ok(_connection) => {
                health::record_probe_success(relay, latency_ms, now_ms());
                tracing::debug!(relay = %id, latency_ms, "directory: probe ok");
                Ok(true)
            }
            Err(e) => {
                health::record_probe_failure(relay);
                tracing::debug!(relay = %id, "directory: probe failed: {e}");
                Ok(false)
            }
        }
    }

    /// Probe every cached relay, then evict stale ones.
    pub async fn check_all_relays(&self) {
        let ids: Vec<RelayId> = self.cache.lock().relays.keys().cloned().collect();
        let mut online = 0;
        for id in &ids {
            if let Ok(true) = self.check_relay_health(id).await {
                online += 1;
            }
        }
        let evicted = self.evict_stale();
        tracing::info!(
            probed = ids.len(),
            online,
            evicted,
            "directory: health check complete"
        );
    }

    /// Remove stale non-bootstrap relays; stale bootstrap relays go offline.
    pub fn evict_stale(&self) -> usize {
        let threshold = self.config.stale_threshold.as_millis() as u64;
        let mut guard = self.cache.lock();
        let cache = &mut *guard;
        health::evict_stale(&mut cache.relays, &cache.bootstrap, now_ms(), threshold)
    }

    /// Pick one relay matching `criteria`: uniformly among the best three.
    pub fn select_relay(&self, criteria: &SelectionCriteria) -> Result<RelayNodeInfo, VeilError> {
        let cache = self.cache.lock();
        self.pick(&cache, criteria)
            .ok_or(VeilError::NoRelayAvailable {
                role: criteria.role,
            })
    }

    fn pick(&self, cache: &RelayCache, criteria: &SelectionCriteria) -> Option<RelayNodeInfo> {
        let ranked = rank_candidates(cache.relays.values(), criteria);
        if ranked.is_empty() {
            return None;
        }
        let top = ranked.len().min(TOP_CANDIDATES);
        let index = uniform_index(top, || self.random_u32());
        Some(ranked[index].clone())
    }

    fn random_u32(&self) -> u32 {
        self.crypto
            .random_bytes(4)
            .iter()
            .fold(0u32, |acc, b| (acc << 8) | u32::from(*b))
    }

    /// Ordered path: entry, `hop_count - 2` middles, exit.
    ///
    /// A single hop is an entry only. Relays never repeat, and each pick
    /// after the first prefers regions the path has not visited yet.
    pub fn select_circuit_path(
        &self,
        hop_count: usize,
        preferred_regions: Option<&[String]>,
    ) -> Result<Vec<RelayNodeInfo>, VeilError> {
        if hop_count == 0 {
            return Err(VeilError::InvalidHopCount(hop_count));
        }

        let roles = path_roles(hop_count);
        let cache = self.cache.lock();
        let online: Vec<&RelayNodeInfo> = cache.online().collect();
        if let Some(role) = first_unfillable(&roles, &online) {
            return Err(VeilError::NoRelayAvailable { role });
        }
        let known_regions: HashSet<String> = online.iter().map(|r| r.region.clone()).collect();

        let mut path: Vec<RelayNodeInfo> = Vec::with_capacity(hop_count);
        for (slot, &role) in roles.iter().enumerate() {
            let used_regions: HashSet<&str> = path.iter().map(|r| r.region.as_str()).collect();
            let unused: Vec<&RelayNodeInfo> = online
                .iter()
                .copied()
                .filter(|r| !path.iter().any(|p| p.id == r.id))
                .collect();
            // Never take a relay the remaining slots cannot do without.
            let stranding = unused
                .iter()
                .filter(|c| c.has_role(role))
                .filter(|c| {
                    let rest: Vec<&RelayNodeInfo> =
                        unused.iter().copied().filter(|r| r.id != c.id).collect();
                    !slots_fillable(&roles[slot + 1..], &rest)
                })
                .map(|c| c.id.clone());
            let base = SelectionCriteria::new(role)
                .exclude(path.iter().map(|r| r.id.clone()).chain(stranding));

            let mut tiers: Vec<Vec<String>> = Vec::new();
            if let Some(preferred) = preferred_regions {
                tiers.push(
                    preferred
                        .iter()
                        .filter(|r| !used_regions.contains(r.as_str()))
                        .cloned()
                        .collect(),
                );
            }
            if !path.is_empty() {
                tiers.push(
                    known_regions
                        .iter()
                        .filter(|r| !used_regions.contains(r.as_str()))
                        .cloned()
                        .collect(),
                );
            }

            let picked = tiers
                .into_iter()
                .filter(|tier| !tier.is_empty())
                .find_map(|tier| {
                    let criteria = base.clone().prefer_regions(tier.clone());
                    self.pick(&cache, &criteria)
                        .filter(|relay| tier.contains(&relay.region))
                })
                .or_else(|| self.pick(&cache, &base));

            match picked {
                Some(relay) => path.push(relay),
                None => return Err(VeilError::NoRelayAvailable { role }),
            }
        }

        tracing::debug!(
            hops = path.len(),
            path = ?path.iter().map(|r| r.id.to_string()).collect::<Vec<_>>(),
            "directory: selected circuit path"
        );
        Ok(path)
    }

    /// Whether online relays can fill every slot of a `hop_count`-hop
    /// path, each slot with a different relay.
    ///
    /// When this holds, `select_circuit_path` succeeds.
    pub fn has_enough_relays(&self, hop_count: usize) -> bool {
        if hop_count == 0 {
            return false;
        }
        let cache = self.cache.lock();
        let online: Vec<&RelayNodeInfo> = cache.online().collect();
        slots_fillable(&path_roles(hop_count), &online)
    }

    /// Every cached relay, ordered by id.
    pub fn get_relays(&self) -> Vec<RelayNodeInfo> {
        let mut relays: Vec<RelayNodeInfo> = self.cache.lock().relays.values().cloned().collect();
        relays.sort_by(|a, b| a.id.cmp(&b.id));
        relays
    }

    pub fn get_relay(&self, id: &RelayId) -> Option<RelayNodeInfo> {
        self.cache.lock().relays.get(id).cloned()
    }

    pub fn online_relays(&self) -> Vec<RelayNodeInfo> {
        let mut relays: Vec<RelayNodeInfo> = self.cache.lock().online().cloned().collect();
        relays.sort_by(|a, b| a.id.cmp(&b.id));
        relays
    }

    /// Insert or replace a relay.
    pub fn upsert_relay(&self, relay: RelayNodeInfo) {
        self.cache.lock().insert(relay);
    }

    pub fn is_bootstrap(&self, id: &RelayId) -> bool {
        self.cache.lock().bootstrap.contains(id)
    }

    pub fn stats(&self) -> DirectoryStats {
        let cache = self.cache.lock();
        let count = |role| cache.relays.values().filter(|r| r.has_role(role)).count();
        DirectoryStats {
            total: cache.relays.len(),
            online: cache.online().count(),
            bootstrap: cache.bootstrap.len(),
            entry: count(RelayRole::Entry),
            middle: count(RelayRole::Middle),
            exit: count(RelayRole::Exit),
        }
    }

    fn start_health_checks(self: &Arc<Self>) {
        let period = self.config.health_check_interval;
        if period.is_zero() {
            return;
        }
        let weak = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // Skip the immediate first tick
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(directory) = weak.upgrade() else {
                    break;
                };
                directory.check_all_relays().await;
            }
        });
        if let Some(previous) = self.health_task.lock().replace(handle) {
            previous.abort();
        }
    }

    /// Stop the periodic health check.
    pub fn shutdown(&self) {
        if let Some(task) = self.health_task.lock().take() {
            task.abort();
            tracing::info!("directory: shut down");
        }
    }
}

impl<C: HybridCrypto> Drop for RelayDirectory<C> {
    fn drop(&mut self) {
        if let Some(task) = self.health_task.get_mut().take() {
            task.abort();
        }
    }
}
