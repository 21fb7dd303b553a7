use heapless::FnvIndexMap;

use super::NodeId;

/// Hard ceiling on concurrently tracked clients (must be a power of two).
pub const MAX_TRACKED_CLIENTS: usize = 16;

/// How a node interprets the minimum block period field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientUnits {
    Unknown,
    Milliseconds,
    Seconds,
}

/// Per-node bookkeeping for a download in progress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientRateState {
    pub units: ClientUnits,
    /// Period value this node was last told to use.
    pub negotiated_period: Option<u16>,
    /// Offset of the last block served, to spot retransmitted requests.
    pub last_seen_offset: Option<u32>,
    pub last_activity_ms: u64,
    /// Set while a units discovery wait is outstanding.
    pub discovery_sent_ms: Option<u64>,
}

impl ClientRateState {
    fn new(now_ms: u64) -> Self {
        Self {
            units: ClientUnits::Unknown,
            negotiated_period: None,
            last_seen_offset: None,
            last_activity_ms: now_ms,
            discovery_sent_ms: None,
        }
    }

    /// Settle the units from how long the node waited after a discovery wait that
    /// asked for `discovery_period` between blocks.
    pub fn finish_discovery(&mut self, now_ms: u64, discovery_period: u16) -> ClientUnits {
        if let Some(sent) = self.discovery_sent_ms.take() {
            let waited = now_ms.saturating_sub(sent);
            // Allow a quarter of the period for timer slop on the node
            let threshold = discovery_period as u64 * 1000 * 3 / 4;
            self.units = if waited >= threshold {
                ClientUnits::Seconds
            } else {
                ClientUnits::Milliseconds
            };
        }
        self.units
    }
}

/// Bounded table of clients currently pulling images
pub struct ClientRateTable {
    clients: FnvIndexMap<NodeId, ClientRateState, MAX_TRACKED_CLIENTS>,
    limit: usize,
    timeout_ms: u64,
}

impl ClientRateTable {
    pub fn new(limit: usize, timeout_secs: u32) -> Self {
        let limit = limit.clamp(1, MAX_TRACKED_CLIENTS);
        Self {
            clients: FnvIndexMap::new(),
            limit,
            timeout_ms: timeout_secs as u64 * 1000,
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn get(&self, node: NodeId) -> Option<&ClientRateState> {
        self.clients.get(&node)
    }

    /// Existing entry, without counting as activity.
    pub fn get_mut(&mut self, node: NodeId) -> Option<&mut ClientRateState> {
        self.clients.get_mut(&node)
    }

    /// Entry for `node`, created if there is room. `None` means the table
    /// is full and the node has to wait.
    pub fn admit(&mut self, node: NodeId, now_ms: u64) -> Option<&mut ClientRateState> {
        if !self.clients.contains_key(&node) {
            if self.clients.len() >= self.limit {
                log::warn!(
                    "Client table full ({} nodes), deferring {}",
                    self.clients.len(),
                    node
                );
                return None;
            }
            if self.clients.insert(node, ClientRateState::new(now_ms)).is_err() {
                return None;
            }
            log::debug!("Tracking client {}", node);
        }
        let state = self.clients.get_mut(&node)?;
        state.last_activity_ms = now_ms;
        Some(state)
    }

    pub fn remove(&mut self, node: NodeId) -> Option<ClientRateState> {
        let removed = self.clients.remove(&node);
        if removed.is_some() {
            log::debug!("Released client {}", node);
        }
        removed
    }

    /// Drop clients idle longer than the timeout. Returns how many went.
    pub fn expire(&mut self, now_ms: u64) -> usize {
        let mut stale: heapless::Vec<NodeId, MAX_TRACKED_CLIENTS> = heapless::Vec::new();
        for (node, state) in self.clients.iter() {
            if now_ms.saturating_sub(state.last_activity_ms) > self.timeout_ms {
                // Capacities match, so this cannot overflow
                let _ = stale.push(*node);
            }
        }
        for node in &stale {
            log::info!("Client {} timed out", node);
            self.clients.remove(node);
        }
        stale.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&NodeId, &ClientRateState)> {
        self.clients.iter()
    }
}
