//! Address registry for configured radio modules
//!
//! The registry is the single owner of node identity, liveness and routing
//! state. Every mutation reports whether it actually changed anything so
//! callers only notify subscribers about real changes.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::trace;

use crate::config::NetworkConfig;
use crate::error::{Result, XbeeError};
use crate::frame::{Addr16, Addr64, NodeKey};

/// State of a single radio module
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    key: NodeKey,
    addr64: Addr64,
    addr16: Addr16,
    discovered: bool,
    route: Vec<NodeKey>,
}

impl Node {
    fn field(key: NodeKey, addr64: Addr64) -> Self {
        Self {
            key,
            addr64,
            addr16: Addr16::UNKNOWN,
            discovered: false,
            route: Vec::new(),
        }
    }

    /// Logical key
    pub fn key(&self) -> &NodeKey {
        &self.key
    }

    /// 64-bit hardware address
    pub fn addr64(&self) -> Addr64 {
        self.addr64
    }

    /// Current 16-bit network address
    pub fn addr16(&self) -> Addr16 {
        self.addr16
    }

    /// Whether the node is currently believed reachable
    pub fn discovered(&self) -> bool {
        self.discovered
    }

    /// Hops to the coordinator, closest hop first
    pub fn route(&self) -> &[NodeKey] {
        &self.route
    }
}

/// Read-only copy of the registry for reporting
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrySnapshot {
    /// 64-bit addresses, coordinator included
    pub addr64: BTreeMap<NodeKey, Addr64>,
    /// 16-bit addresses, coordinator included
    pub addr16: BTreeMap<NodeKey, Addr16>,
    /// Routes of field nodes
    pub routes: BTreeMap<NodeKey, Vec<NodeKey>>,
    /// Liveness, coordinator included
    pub discovered: BTreeMap<NodeKey, bool>,
}

/// Owner of all node records
#[derive(Debug, Clone)]
pub struct AddressRegistry {
    coordinator: Node,
    /// Field nodes in configuration order
    nodes: Vec<Node>,
}

impl AddressRegistry {
    /// Build the registry from the network configuration
    pub fn new(coordinator: (NodeKey, Addr64), field_nodes: Vec<(NodeKey, Addr64)>) -> Self {
        let (key, addr64) = coordinator;
        let coordinator = Node {
            key,
            addr64,
            addr16: Addr16::COORDINATOR,
            discovered: true,
            route: Vec::new(),
        };
        let nodes = field_nodes
            .into_iter()
            .map(|(key, addr64)| Node::field(key, addr64))
            .collect();

        Self { coordinator, nodes }
    }

    /// Build from a validated network configuration
    pub fn from_config(config: &NetworkConfig) -> Self {
        Self::new(
            (config.coordinator.key.clone(), config.coordinator.addr64),
            config
                .nodes
                .iter()
                .map(|entry| (entry.key.clone(), entry.addr64))
                .collect(),
        )
    }

    /// Key of the coordinator entry
    pub fn coordinator_key(&self) -> &NodeKey {
        &self.coordinator.key
    }

    /// Whether `key` is the coordinator
    pub fn is_coordinator(&self, key: &NodeKey) -> bool {
        self.coordinator.key == *key
    }

    /// Field node keys in configuration order
    pub fn field_keys(&self) -> Vec<NodeKey> {
        self.nodes.iter().map(|n| n.key.clone()).collect()
    }

    /// Look up a node, coordinator included
    pub fn node(&self, key: &NodeKey) -> Result<&Node> {
        self.iter()
            .find(|n| n.key == *key)
            .ok_or_else(|| XbeeError::InvalidKey(key.clone()))
    }

    fn iter(&self) -> impl Iterator<Item = &Node> {
        std::iter::once(&self.coordinator).chain(self.nodes.iter())
    }

    fn field_node_mut(&mut self, key: &NodeKey) -> Result<&mut Node> {
        self.nodes
            .iter_mut()
            .find(|n| n.key == *key)
            .ok_or_else(|| XbeeError::InvalidKey(key.clone()))
    }

    /// Reverse lookup by 64-bit address
    pub fn resolve_key_by_addr64(&self, addr64: Addr64) -> Option<&NodeKey> {
        self.iter().find(|n| n.addr64 == addr64).map(|n| &n.key)
    }

    /// Reverse lookup by current 16-bit address
    ///
    /// Nodes whose address is still unknown never match.
    pub fn resolve_key_by_addr16(&self, addr16: Addr16) -> Option<&NodeKey> {
        if addr16 == Addr16::UNKNOWN {
            return None;
        }
        self.iter().find(|n| n.addr16 == addr16).map(|n| &n.key)
    }

    /// Destination address pair for frames addressed to `key`
    pub fn addresses(&self, key: &NodeKey) -> Result<(Addr64, Addr16)> {
        let node = self.node(key)?;
        Ok((node.addr64, node.addr16))
    }

    /// Update the 16-bit address, returning whether it changed
    ///
    /// The coordinator's address is fixed at `0000`; reports for it are
    /// accepted but never change the stored value.
    pub fn set_addr16(&mut self, key: &NodeKey, addr16: Addr16) -> Result<bool> {
        if self.is_coordinator(key) {
            return Ok(false);
        }
        let node = self.field_node_mut(key)?;
        if node.addr16 == addr16 {
            return Ok(false);
        }
        trace!(key = %key, from = %node.addr16, to = %addr16, "16-bit address changed");
        node.addr16 = addr16;
        Ok(true)
    }

    /// Update liveness, returning whether it changed
    pub fn set_discovered(&mut self, key: &NodeKey, discovered: bool) -> Result<bool> {
        if self.is_coordinator(key) {
            return Ok(false);
        }
        let node = self.field_node_mut(key)?;
        if node.discovered == discovered {
            return Ok(false);
        }
        node.discovered = discovered;
        Ok(true)
    }

    /// Replace the route when the new hop sequence differs
    pub fn set_route(&mut self, key: &NodeKey, hops: Vec<NodeKey>) -> Result<bool> {
        if self.is_coordinator(key) {
            return Ok(false);
        }
        let node = self.field_node_mut(key)?;
        if node.route == hops {
            return Ok(false);
        }
        node.route = hops;
        Ok(true)
    }

    /// Field nodes not currently discovered, in configuration order
    pub fn undiscovered_keys(&self) -> Vec<NodeKey> {
        self.nodes
            .iter()
            .filter(|n| !n.discovered)
            .map(|n| n.key.clone())
            .collect()
    }

    /// Copy out the current state
    pub fn snapshot(&self) -> RegistrySnapshot {
        let mut snapshot = RegistrySnapshot::default();
        for node in self.iter() {
            snapshot.addr64.insert(node.key.clone(), node.addr64);
            snapshot.addr16.insert(node.key.clone(), node.addr16);
            snapshot.discovered.insert(node.key.clone(), node.discovered);
        }
        for node in &self.nodes {
            snapshot.routes.insert(node.key.clone(), node.route.clone());
        }
        snapshot
    }
}
