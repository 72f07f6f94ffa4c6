//! Domain types shared by the monitors, the manager and the flippers

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Address of one Sentinel process
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Sentinel {
    /// Hostname or IP
    pub host: String,

    /// Sentinel TCP port (usually 26379)
    pub port: u16,
}

impl Sentinel {
    /// Create a new sentinel address
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// `host:port`, used as the key for a sentinel everywhere
    pub fn location(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for Sentinel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// A `+switch-master` announcement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MasterSwitchedEvent {
    /// Cluster (Sentinel master-name)
    pub name: String,
    /// Demoted master IP
    pub old_master_ip: String,
    /// Demoted master port
    pub old_master_port: u16,
    /// Promoted master IP
    pub new_master_ip: String,
    /// Promoted master port
    pub new_master_port: u16,
}

impl MasterSwitchedEvent {
    /// `ip:port` of the demoted master
    pub fn old_master_address(&self) -> String {
        format!("{}:{}", self.old_master_ip, self.old_master_port)
    }

    /// `ip:port` of the promoted master
    pub fn new_master_address(&self) -> String {
        format!("{}:{}", self.new_master_ip, self.new_master_port)
    }
}

/// Last known master of a cluster
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MasterDetails {
    /// Cluster name, unique key in the registry
    pub name: String,

    /// Master IP
    pub ip: String,

    /// Master port
    pub port: u16,

    /// Port clients use to reach the cluster through the flipper.
    /// Comes from configuration, never from discovery.
    pub external_port: u16,
}

impl MasterDetails {
    /// Create details with no external port assigned yet
    pub fn new(name: impl Into<String>, ip: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            ip: ip.into(),
            port,
            external_port: 0,
        }
    }

    /// Set the external port
    pub fn with_external_port(mut self, port: u16) -> Self {
        self.external_port = port;
        self
    }

    /// `ip:port` of the master
    pub fn address(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }
}

/// Result of checking a switch against the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchOutcome {
    /// Moves the cluster from its current master
    Accepted,
    /// The registry already points at the new master
    Duplicate,
    /// The switch starts from a master the cluster has already left
    Stale,
}

/// Registry of cluster name -> last known master
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MasterDetailsCollection {
    items: HashMap<String, MasterDetails>,
}

impl MasterDetailsCollection {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite the entry for `details.name`, returning the previous one.
    /// Entries are replaced whole, never merged.
    pub fn add_or_replace(&mut self, details: MasterDetails) -> Option<MasterDetails> {
        self.items.insert(details.name.clone(), details)
    }

    /// Look up a cluster
    pub fn get(&self, name: &str) -> Option<&MasterDetails> {
        self.items.get(name)
    }

    /// How a switch relates to the registry.
    ///
    /// A switch is only accepted when it starts from the master the registry
    /// currently holds. Every sentinel announces the same failover, and copies
    /// from different sentinels may arrive after a newer failover was already
    /// applied, so anything else is a repeat or a stale switch. Clusters not
    /// yet in the registry accept any switch.
    pub fn classify(&self, event: &MasterSwitchedEvent) -> SwitchOutcome {
        let Some(current) = self.items.get(&event.name) else {
            return SwitchOutcome::Accepted;
        };

        if current.ip == event.new_master_ip && current.port == event.new_master_port {
            SwitchOutcome::Duplicate
        } else if current.ip == event.old_master_ip && current.port == event.old_master_port {
            SwitchOutcome::Accepted
        } else {
            SwitchOutcome::Stale
        }
    }

    /// Point a cluster at the event's new master if [`classify`] accepts it.
    ///
    /// The existing external port is kept; `unknown_external_port` is only used
    /// for clusters not yet in the registry.
    ///
    /// [`classify`]: Self::classify
    pub fn apply_switch(&mut self, event: &MasterSwitchedEvent, unknown_external_port: u16) -> SwitchOutcome {
        let outcome = self.classify(event);
        if outcome != SwitchOutcome::Accepted {
            return outcome;
        }

        let external_port = self
            .items
            .get(&event.name)
            .map_or(unknown_external_port, |current| current.external_port);

        self.add_or_replace(
            MasterDetails::new(&event.name, &event.new_master_ip, event.new_master_port)
                .with_external_port(external_port),
        );
        outcome
    }

    /// Number of clusters
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether no cluster is known
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// All entries ordered by cluster name
    pub fn to_sorted_vec(&self) -> Vec<MasterDetails> {
        let mut items: Vec<MasterDetails> = self.items.values().cloned().collect();
        items.sort_by(|a, b| a.name.cmp(&b.name));
        items
    }
}

impl Serialize for MasterDetailsCollection {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_sorted_vec().serialize(serializer)
    }
}

/// Lifecycle notification about a sentinel connection itself
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstanceEvent {
    /// A sentinel announced through `+sentinel` or `SENTINEL sentinels`
    SentinelAdded(Sentinel),
    /// The subscription to a sentinel died
    SentinelLost(Sentinel),
    /// Heartbeat from a live monitor
    SentinelPing(Sentinel),
}

impl InstanceEvent {
    /// The sentinel the event is about
    pub fn sentinel(&self) -> &Sentinel {
        match self {
            Self::SentinelAdded(s) | Self::SentinelLost(s) | Self::SentinelPing(s) => s,
        }
    }

    /// Short name for logs
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SentinelAdded(_) => "added",
            Self::SentinelLost(_) => "lost",
            Self::SentinelPing(_) => "ping",
        }
    }
}
