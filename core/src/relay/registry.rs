//! Relay registry: in-memory catalog of known relays
//!
//! Entries keep their insertion order; relay selection policies break ties
//! by it.

use super::types::{RelayId, RelayInfo, RelayType};
use crate::error::RelayError;
use parking_lot::RwLock;
use std::time::Duration;
use tracing::{debug, info};

#[derive(Debug, Clone)]
struct RegistryEntry {
    info: RelayInfo,
    /// Monotonic counter value at the most recent connect
    connect_seq: u64,
}

#[derive(Debug, Default)]
struct RegistryState {
    entries: Vec<RegistryEntry>,
    connect_seq: u64,
}

/// Catalog of relay peers and their connection state
#[derive(Debug, Default)]
pub struct RelayRegistry {
    state: RwLock<RegistryState>,
    unique_addresses: bool,
}

impl RelayRegistry {
    /// Create a registry that allows several entries per address
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry that rejects duplicate addresses
    pub fn with_unique_addresses() -> Self {
        Self {
            state: RwLock::new(RegistryState::default()),
            unique_addresses: true,
        }
    }

    /// Register a relay and return its fresh id
    pub fn add(&self, address: &str, relay_type: RelayType) -> Result<RelayId, RelayError> {
        let mut state = self.state.write();
        if self.unique_addresses && state.entries.iter().any(|e| e.info.address == address) {
            return Err(RelayError::DuplicateRelay(address.to_string()));
        }

        let info = RelayInfo::new(address.to_string(), relay_type);
        let id = info.id.clone();
        state.entries.push(RegistryEntry {
            info,
            connect_seq: 0,
        });
        info!("Relay registered: {} ({}) at {}", id, relay_type, address);
        Ok(id)
    }

    /// Remove a relay. Returns the removed entry; `None` when the id is
    /// unknown or the relay is a bootstrap relay.
    pub fn remove(&self, id: &RelayId) -> Option<RelayInfo> {
        let mut state = self.state.write();
        let index = state.entries.iter().position(|e| &e.info.id == id)?;
        if state.entries[index].info.relay_type == RelayType::Bootstrap {
            debug!("Refusing to remove bootstrap relay {}", id);
            return None;
        }
        let removed = state.entries.remove(index).info;
        info!("Relay removed: {}", id);
        Some(removed)
    }

    pub fn get(&self, id: &RelayId) -> Option<RelayInfo> {
        self.state
            .read()
            .entries
            .iter()
            .find(|e| &e.info.id == id)
            .map(|e| e.info.clone())
    }

    pub fn contains(&self, id: &RelayId) -> bool {
        self.state.read().entries.iter().any(|e| &e.info.id == id)
    }

    /// First relay registered at `address`
    pub fn find_by_address(&self, address: &str) -> Option<RelayInfo> {
        self.state
            .read()
            .entries
            .iter()
            .find(|e| e.info.address == address)
            .map(|e| e.info.clone())
    }

    /// All relays, in insertion order
    pub fn all(&self) -> Vec<RelayInfo> {
        self.state.read().entries.iter().map(|e| e.info.clone()).collect()
    }

    /// Connected relays, in insertion order
    pub fn connected(&self) -> Vec<RelayInfo> {
        self.state
            .read()
            .entries
            .iter()
            .filter(|e| e.info.is_connected)
            .map(|e| e.info.clone())
            .collect()
    }

    pub fn connected_count(&self) -> usize {
        self.state
            .read()
            .entries
            .iter()
            .filter(|e| e.info.is_connected)
            .count()
    }

    pub fn len(&self) -> usize {
        self.state.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.read().entries.is_empty()
    }

    /// Mark a relay connected. Returns `true` if the state changed.
    pub fn mark_connected(&self, id: &RelayId, timestamp: u64) -> bool {
        let mut state = self.state.write();
        state.connect_seq += 1;
        let seq = state.connect_seq;
        match state.entries.iter_mut().find(|e| &e.info.id == id) {
            Some(entry) if !entry.info.is_connected => {
                entry.info.is_connected = true;
                entry.info.connected_at = Some(timestamp);
                entry.info.last_seen = Some(timestamp);
                entry.connect_seq = seq;
                true
            }
            _ => false,
        }
    }

    /// Mark a relay disconnected. Returns `true` if the state changed.
    pub fn mark_disconnected(&self, id: &RelayId) -> bool {
        let mut state = self.state.write();
        match state.entries.iter_mut().find(|e| &e.info.id == id) {
            Some(entry) if entry.info.is_connected => {
                entry.info.is_connected = false;
                true
            }
            _ => false,
        }
    }

    /// Record traffic from a relay
    pub fn touch(&self, id: &RelayId, timestamp: u64) {
        if let Some(entry) = self.state.write().entries.iter_mut().find(|e| &e.info.id == id) {
            entry.info.last_seen = Some(timestamp);
        }
    }

    /// Record an observed round-trip time
    pub fn record_latency(&self, id: &RelayId, rtt: Duration) {
        if let Some(entry) = self.state.write().entries.iter_mut().find(|e| &e.info.id == id) {
            entry.info.latency = Some(rtt);
        }
    }

    /// Pick the relay a new route should use.
    ///
    /// Lowest observed latency when any connected relay has one, otherwise the
    /// most recently connected relay. Ties go to the earlier registration.
    pub fn select_for_route(&self) -> Option<RelayInfo> {
        let state = self.state.read();
        let connected: Vec<&RegistryEntry> =
            state.entries.iter().filter(|e| e.info.is_connected).collect();

        let with_latency = connected
            .iter()
            .filter_map(|e| e.info.latency.map(|rtt| (rtt, *e)));
        let mut best: Option<(Duration, &RegistryEntry)> = None;
        for (rtt, entry) in with_latency {
            if best.map_or(true, |(best_rtt, _)| rtt < best_rtt) {
                best = Some((rtt, entry));
            }
        }
        if let Some((_, entry)) = best {
            return Some(entry.info.clone());
        }

        let mut newest: Option<&RegistryEntry> = None;
        for entry in connected {
            if newest.map_or(true, |n| entry.connect_seq > n.connect_seq) {
                newest = Some(entry);
            }
        }
        newest.map(|e| e.info.clone())
    }

    /// First unconnected relay by type preference: bootstrap, public, private
    pub fn select_unconnected(&self, exclude: &[RelayId]) -> Option<RelayInfo> {
        let state = self.state.read();
        [RelayType::Bootstrap, RelayType::Public, RelayType::Private]
            .iter()
            .find_map(|relay_type| {
                state.entries.iter().find(|e| {
                    e.info.relay_type == *relay_type
                        && !e.info.is_connected
                        && !exclude.contains(&e.info.id)
                })
            })
            .map(|e| e.info.clone())
    }
}

// ============================================================================
// TESTS
// ============================================================================
