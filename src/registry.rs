use async_trait::async_trait;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::Path;
use tokio::sync::RwLock;

use crate::error::RegistryError;
use crate::types::{Host, HostId, HostState, HostUpdate};

/// Result of a bulk update; rows that could not be written are listed, not fatal.
#[derive(Debug, Default)]
pub struct BatchOutcome {
    pub applied: usize,
    pub failed: Vec<(HostId, RegistryError)>,
}

/// Persistent host store as seen by the liveness sweep.
///
/// The sweep only ever reads the `(id, address, isOnline)` projection and writes
/// liveness fields back; hosts are created and removed elsewhere.
#[async_trait]
pub trait HostRegistry: Send + Sync {
    async fn load_states(&self) -> Result<Vec<HostState>, RegistryError>;

    /// Apply every update independently; a failing row does not stop the rest.
    async fn apply_updates(&self, updates: Vec<HostUpdate>) -> Result<BatchOutcome, RegistryError>;
}

/// In-process registry, optionally seeded from a JSON file.
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    hosts: RwLock<BTreeMap<HostId, Host>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HostSeed {
    id: HostId,
    address: Ipv4Addr,
    #[serde(default)]
    is_online: bool,
}

impl MemoryRegistry {
    pub fn new(hosts: impl IntoIterator<Item = Host>) -> Self {
        Self {
            hosts: RwLock::new(hosts.into_iter().map(|h| (h.id, h)).collect()),
        }
    }

    /// Parse a JSON array of `{ "id", "address", "isOnline"? }` objects.
    pub fn from_json_str(s: &str) -> Result<Self, RegistryError> {
        let seeds: Vec<HostSeed> = serde_json::from_str(s)?;
        Ok(Self::new(seeds.into_iter().map(|seed| Host {
            is_online: seed.is_online,
            ..Host::new(seed.id, seed.address)
        })))
    }

    pub async fn from_json_file(path: impl AsRef<Path>) -> Result<Self, RegistryError> {
        let content = tokio::fs::read_to_string(path.as_ref()).await?;
        Self::from_json_str(&content)
    }

    /// All hosts ordered by numeric address.
    pub async fn snapshot(&self) -> Vec<Host> {
        let mut hosts: Vec<Host> = self.hosts.read().await.values().cloned().collect();
        hosts.sort_by_key(|h| h.sort_key);
        hosts
    }

    pub async fn get(&self, id: HostId) -> Option<Host> {
        self.hosts.read().await.get(&id).cloned()
    }
}

#[async_trait]
impl HostRegistry for MemoryRegistry {
    async fn load_states(&self) -> Result<Vec<HostState>, RegistryError> {
        Ok(self.hosts.read().await.values().map(Host::state).collect())
    }

    async fn apply_updates(&self, updates: Vec<HostUpdate>) -> Result<BatchOutcome, RegistryError> {
        let mut hosts = self.hosts.write().await;
        let mut outcome = BatchOutcome::default();
        for update in updates {
            let Some(host) = hosts.get_mut(&update.id) else {
                outcome
                    .failed
                    .push((update.id, RegistryError::UnknownHost(update.id)));
                continue;
            };
            host.last_checked = Some(update.last_checked);
            if let Some(online) = update.transition {
                host.is_online = online;
                host.last_status_change = Some(update.last_checked);
            }
            outcome.applied += 1;
        }
        Ok(outcome)
    }
}
