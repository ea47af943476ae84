// Live port table
// One entry per connected port, keyed by host PortId.

use std::collections::HashMap;

use crate::error::ClassificationError;
use crate::host::{PortId, TabId};
use crate::protocol::ChannelKind;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connection {
    pub port: PortId,
    pub kind: ChannelKind,
    pub tab: Option<TabId>,
    pub connected_at_ms: u64,
}

/// Outcome of `register`; listeners are attached only for `New`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Registration {
    New(Connection),
    Existing(Connection),
}

impl Registration {
    pub fn connection(&self) -> &Connection {
        match self {
            Registration::New(c) | Registration::Existing(c) => c,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, Registration::New(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unregister {
    Port(PortId),
    Tab(TabId),
}

#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: HashMap<PortId, Connection>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Classify and track a port. Registering the same port twice is a no-op.
    pub fn register(
        &mut self,
        port: PortId,
        name: &str,
        tab: Option<TabId>,
        now_ms: u64,
    ) -> Result<Registration, ClassificationError> {
        if let Some(existing) = self.connections.get(&port) {
            if existing.kind.as_str() != name {
                tracing::warn!(
                    "Port {} re-registered as {:?}, keeping {}",
                    port,
                    name,
                    existing.kind
                );
            }
            return Ok(Registration::Existing(existing.clone()));
        }

        let kind: ChannelKind = name.parse()?;
        let connection = Connection {
            port,
            kind,
            tab,
            connected_at_ms: now_ms,
        };
        self.connections.insert(port, connection.clone());
        tracing::debug!("🔌 {} connected on port {} (tab {:?})", kind, port, tab);
        Ok(Registration::New(connection))
    }

    /// Remove one port, or every port belonging to a tab
    pub fn unregister(&mut self, target: Unregister) -> Vec<Connection> {
        let removed: Vec<Connection> = match target {
            Unregister::Port(port) => self.connections.remove(&port).into_iter().collect(),
            Unregister::Tab(tab) => {
                let ports: Vec<PortId> = self
                    .connections
                    .values()
                    .filter(|c| c.tab == Some(tab))
                    .map(|c| c.port)
                    .collect();
                ports
                    .into_iter()
                    .filter_map(|port| self.connections.remove(&port))
                    .collect()
            }
        };
        for connection in &removed {
            tracing::debug!("🔌 {} disconnected (port {})", connection.kind, connection.port);
        }
        removed
    }

    pub fn get(&self, port: PortId) -> Option<&Connection> {
        self.connections.get(&port)
    }

    pub fn is_live(&self, port: PortId) -> bool {
        self.connections.contains_key(&port)
    }

    pub fn live_count(&self) -> usize {
        self.connections.len()
    }

    pub fn count_kind(&self, kind: ChannelKind) -> usize {
        self.connections.values().filter(|c| c.kind == kind).count()
    }

    /// Ports on the wallet's own UI channels, in stable order
    pub fn ui_ports(&self) -> Vec<PortId> {
        let mut ports: Vec<PortId> = self
            .connections
            .values()
            .filter(|c| c.kind.is_ui())
            .map(|c| c.port)
            .collect();
        ports.sort();
        ports
    }

    pub fn clear(&mut self) -> Vec<Connection> {
        self.connections.drain().map(|(_, c)| c).collect()
    }
}
