//! Sentinel fleet manager
//!
//! Owns the population of monitors and the master registry:
//!
//! - creates query clients and monitors through a [`SentinelTransport`]
//! - receives instance events from every monitor ([`InstanceEventSink`])
//! - supervises each monitor and reconnects lost sentinels with exponential
//!   backoff (when enabled)
//! - seeds and updates the [`MasterDetailsCollection`]
//!
//! Both the topology and the registry sit behind `tokio::sync::RwLock`; monitors
//! never touch them directly, they only send events.

use crate::config::{MonitorConfig, ReconnectConfig};
use crate::error::Result;
use crate::monitor::{self, InstanceEventSink, Monitor, MonitorExit};
use crate::shutdown::Shutdown;
use crate::transport::{SentinelClient, SentinelTransport};
use crate::types::{
    InstanceEvent, MasterDetails, MasterDetailsCollection, MasterSwitchedEvent, Sentinel, SwitchOutcome,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, mpsc};
use tracing::{debug, info, warn};

/// What the manager knows about a sentinel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SentinelState {
    /// Announced by another sentinel, not monitored
    Discovered,
    /// Subscription being established
    Connecting,
    /// Monitor is Active
    Monitoring,
    /// Lost, waiting to reconnect
    Reconnecting,
    /// Lost, not being reconnected
    Lost,
    /// First connection attempt failed
    Unreachable,
}

impl SentinelState {
    /// Whether a supervisor currently owns this sentinel
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Connecting | Self::Monitoring | Self::Reconnecting)
    }
}

/// Per-sentinel status, as reported by the status API
#[derive(Debug, Clone, Serialize)]
pub struct SentinelStatus {
    /// Sentinel address
    pub sentinel: Sentinel,
    /// Current lifecycle state
    pub state: SentinelState,
    /// Last heartbeat or successful connect
    pub last_seen: Option<DateTime<Utc>>,
    /// Heartbeats received so far
    pub pings: u64,
}

impl SentinelStatus {
    fn new(sentinel: Sentinel, state: SentinelState) -> Self {
        Self {
            sentinel,
            state,
            last_seen: None,
            pings: 0,
        }
    }
}

/// Read-only view of the manager
#[derive(Debug, Clone, Serialize)]
pub struct ManagerSnapshot {
    /// Known sentinels, by location
    pub sentinels: Vec<SentinelStatus>,
    /// Registry entries, by cluster name
    pub masters: Vec<MasterDetails>,
}

/// Settings the manager hands to every monitor it starts
#[derive(Debug, Clone)]
pub struct ManagerSettings {
    /// Idle time before a monitor reports a heartbeat
    pub heartbeat: Duration,
    /// Reconnect policy for lost sentinels
    pub reconnect: ReconnectConfig,
    /// Configured external port per cluster
    pub external_ports: HashMap<String, u16>,
}

impl ManagerSettings {
    /// Build from the monitor section and cluster list
    pub fn new(monitor: &MonitorConfig, external_ports: HashMap<String, u16>) -> Self {
        Self {
            heartbeat: monitor.heartbeat_interval(),
            reconnect: monitor.reconnect.clone(),
            external_ports,
        }
    }
}

/// Coordinates the sentinel fleet
pub struct SentinelManager {
    transport: Arc<dyn SentinelTransport>,
    switch_tx: mpsc::Sender<MasterSwitchedEvent>,
    settings: ManagerSettings,
    topology: RwLock<HashMap<String, SentinelStatus>>,
    registry: RwLock<MasterDetailsCollection>,
}

impl SentinelManager {
    /// Create a manager whose monitors publish onto `switch_tx`
    pub fn new(
        transport: Arc<dyn SentinelTransport>,
        switch_tx: mpsc::Sender<MasterSwitchedEvent>,
        settings: ManagerSettings,
    ) -> Arc<Self> {
        Arc::new(Self {
            transport,
            switch_tx,
            settings,
            topology: RwLock::new(HashMap::new()),
            registry: RwLock::new(MasterDetailsCollection::new()),
        })
    }

    /// Open a query client to a sentinel
    pub async fn new_client(&self, sentinel: &Sentinel) -> Result<Box<dyn SentinelClient>> {
        self.transport.open(sentinel).await
    }

    /// Start monitoring a sentinel.
    ///
    /// The first subscription is made before returning, so an unreachable
    /// sentinel is reported as an error. On success a supervisor task runs the
    /// monitor and reconnects it after loss. Returns `Ok(false)` if the sentinel
    /// is already being monitored.
    pub async fn start_monitor(self: &Arc<Self>, sentinel: Sentinel, shutdown: Shutdown) -> Result<bool> {
        let location = sentinel.location();

        {
            let mut topology = self.topology.write().await;
            let status = topology
                .entry(location.clone())
                .or_insert_with(|| SentinelStatus::new(sentinel.clone(), SentinelState::Discovered));
            if status.state.is_live() {
                debug!(sentinel = %location, "Sentinel already monitored");
                return Ok(false);
            }
            status.state = SentinelState::Connecting;
        }

        let handoff = monitor::switch_handoff(self.switch_tx.clone());
        let monitor = match self.connect_monitor(&sentinel, &handoff).await {
            Ok(monitor) => monitor,
            Err(e) => {
                self.set_state(&location, SentinelState::Unreachable).await;
                return Err(e);
            }
        };
        self.mark_connected(&location).await;

        tokio::spawn(self.clone().supervise(monitor, handoff, shutdown));
        Ok(true)
    }

    async fn connect_monitor(
        self: &Arc<Self>,
        sentinel: &Sentinel,
        handoff: &mpsc::UnboundedSender<MasterSwitchedEvent>,
    ) -> Result<Monitor> {
        let sink: Arc<dyn InstanceEventSink> = self.clone();
        Monitor::connect(
            sentinel.clone(),
            self.transport.as_ref(),
            Arc::downgrade(&sink),
            handoff.clone(),
            self.settings.heartbeat,
        )
        .await
    }

    /// Run a monitor, reconnecting after loss until shutdown. Every monitor
    /// for this sentinel shares one switch handoff.
    async fn supervise(
        self: Arc<Self>,
        monitor: Monitor,
        handoff: mpsc::UnboundedSender<MasterSwitchedEvent>,
        mut shutdown: Shutdown,
    ) {
        let sentinel = monitor.sentinel().clone();
        let location = sentinel.location();
        let reconnect = self.settings.reconnect.clone();
        let mut current = monitor;

        loop {
            match current.run(shutdown.clone()).await {
                MonitorExit::Cancelled => {
                    self.set_state(&location, SentinelState::Lost).await;
                    return;
                }
                MonitorExit::Lost(reason) => {
                    if !reconnect.enabled {
                        warn!(sentinel = %location, reason = %reason, "Sentinel lost, reconnect disabled");
                        self.set_state(&location, SentinelState::Lost).await;
                        return;
                    }
                    warn!(sentinel = %location, reason = %reason, "Sentinel lost, reconnecting");
                }
            }

            self.set_state(&location, SentinelState::Reconnecting).await;
            let mut delay = reconnect.initial_backoff();

            current = loop {
                tokio::select! {
                    _ = shutdown.wait() => {
                        self.set_state(&location, SentinelState::Lost).await;
                        return;
                    }
                    _ = tokio::time::sleep(delay) => {}
                }

                match self.connect_monitor(&sentinel, &handoff).await {
                    Ok(monitor) => {
                        info!(sentinel = %location, "Reconnected to sentinel");
                        break monitor;
                    }
                    Err(e) => {
                        delay = reconnect.next_backoff(delay);
                        debug!(
                            sentinel = %location,
                            error = %e,
                            retry_in_ms = delay.as_millis() as u64,
                            "Reconnect failed"
                        );
                    }
                }
            };
            self.mark_connected(&location).await;
        }
    }

    /// Query one sentinel for a cluster's master and record it in the registry
    /// with the configured external port.
    pub async fn discover_master_for_cluster(
        &self,
        client: &mut dyn SentinelClient,
        cluster_name: &str,
    ) -> Result<MasterDetails> {
        let mut details = client.discover_master_for_cluster(cluster_name).await?;
        if let Some(port) = self.settings.external_ports.get(cluster_name) {
            details.external_port = *port;
        }

        // Later sentinels overwrite earlier ones for the same cluster
        self.registry.write().await.add_or_replace(details.clone());
        Ok(details)
    }

    /// Query one sentinel for the other sentinels watching a cluster and record
    /// them as discovered.
    pub async fn find_connected_sentinels(
        &self,
        client: &mut dyn SentinelClient,
        cluster_name: &str,
    ) -> Result<Vec<Sentinel>> {
        let peers = client.find_connected_sentinels(cluster_name).await?;
        for peer in &peers {
            self.notify(InstanceEvent::SentinelAdded(peer.clone())).await;
        }
        Ok(peers)
    }

    /// Check a switch against the registry without changing it
    pub async fn check_switch(&self, event: &MasterSwitchedEvent) -> SwitchOutcome {
        self.registry.read().await.classify(event)
    }

    /// Apply a switch to the registry when it moves the cluster from its
    /// current master. Unconfigured clusters get no external port (0).
    pub async fn apply_switch(&self, event: &MasterSwitchedEvent) -> SwitchOutcome {
        let external_port = match self.settings.external_ports.get(&event.name) {
            Some(port) => *port,
            None => {
                warn!(cluster = %event.name, "Switch for a cluster with no configured external port");
                0
            }
        };
        self.registry.write().await.apply_switch(event, external_port)
    }

    /// Copy of the master registry
    pub async fn registry(&self) -> MasterDetailsCollection {
        self.registry.read().await.clone()
    }

    /// Status of one sentinel
    pub async fn status(&self, sentinel: &Sentinel) -> Option<SentinelStatus> {
        self.topology.read().await.get(&sentinel.location()).cloned()
    }

    /// Number of sentinels with a running supervisor
    pub async fn live_monitor_count(&self) -> usize {
        self.topology
            .read()
            .await
            .values()
            .filter(|s| s.state.is_live())
            .count()
    }

    /// Sentinels and masters, ordered for display
    pub async fn snapshot(&self) -> ManagerSnapshot {
        let mut sentinels: Vec<SentinelStatus> = self.topology.read().await.values().cloned().collect();
        sentinels.sort_by_key(|s| s.sentinel.location());

        ManagerSnapshot {
            sentinels,
            masters: self.registry.read().await.to_sorted_vec(),
        }
    }

    async fn set_state(&self, location: &str, state: SentinelState) {
        if let Some(status) = self.topology.write().await.get_mut(location) {
            status.state = state;
        }
    }

    async fn mark_connected(&self, location: &str) {
        if let Some(status) = self.topology.write().await.get_mut(location) {
            status.state = SentinelState::Monitoring;
            status.last_seen = Some(Utc::now());
        }
    }
}

#[async_trait]
impl InstanceEventSink for SentinelManager {
    async fn notify(&self, event: InstanceEvent) {
        let mut topology = self.topology.write().await;

        match event {
            InstanceEvent::SentinelPing(sentinel) => {
                if let Some(status) = topology.get_mut(&sentinel.location()) {
                    status.state = SentinelState::Monitoring;
                    status.last_seen = Some(Utc::now());
                    status.pings += 1;
                }
            }
            InstanceEvent::SentinelLost(sentinel) => {
                warn!(sentinel = %sentinel, "Sentinel reported lost");
                if let Some(status) = topology.get_mut(&sentinel.location()) {
                    status.state = SentinelState::Lost;
                }
            }
            InstanceEvent::SentinelAdded(sentinel) => {
                let location = sentinel.location();
                if !topology.contains_key(&location) {
                    info!(sentinel = %location, "Discovered sentinel");
                    topology.insert(location, SentinelStatus::new(sentinel, SentinelState::Discovered));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RelayError;
    use crate::shutdown;
    use crate::transport::PubSubReply;
    use crate::transport::testing::ScriptedTransport;

    const LOCATION: &str = "10.0.0.5:26379";

    fn sentinel() -> Sentinel {
        Sentinel::new("10.0.0.5", 26379)
    }

    fn settings(reconnect: ReconnectConfig) -> ManagerSettings {
        ManagerSettings {
            heartbeat: Duration::from_secs(1),
            reconnect,
            external_ports: HashMap::from([("cache".to_string(), 7000)]),
        }
    }

    fn fast_reconnect() -> ReconnectConfig {
        ReconnectConfig {
            enabled: true,
            initial_backoff_ms: 10,
            max_backoff_ms: 40,
        }
    }

    fn manager(
        transport: Arc<ScriptedTransport>,
        reconnect: ReconnectConfig,
    ) -> (Arc<SentinelManager>, mpsc::Receiver<MasterSwitchedEvent>) {
        let (tx, rx) = mpsc::channel(16);
        (SentinelManager::new(transport, tx, settings(reconnect)), rx)
    }

    async fn wait_for_state(manager: &SentinelManager, state: SentinelState) {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if manager.status(&sentinel()).await.map(|s| s.state) == Some(state) {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("sentinel never reached {:?}", state));
    }

    #[tokio::test]
    async fn test_start_monitor_unreachable() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.set_unreachable(LOCATION, true).await;
        let (manager, _rx) = manager(transport, fast_reconnect());
        let (_trigger, shutdown) = shutdown::channel();

        let result = manager.start_monitor(sentinel(), shutdown).await;

        assert!(matches!(result, Err(RelayError::Connect { .. })));
        assert_eq!(manager.live_monitor_count().await, 0);
        assert_eq!(
            manager.status(&sentinel()).await.unwrap().state,
            SentinelState::Unreachable
        );
    }

    #[tokio::test]
    async fn test_start_monitor_twice_is_noop() {
        let transport = Arc::new(ScriptedTransport::new());
        let (manager, _rx) = manager(transport.clone(), fast_reconnect());
        let (trigger, shutdown) = shutdown::channel();

        assert!(manager.start_monitor(sentinel(), shutdown.clone()).await.unwrap());
        assert!(!manager.start_monitor(sentinel(), shutdown).await.unwrap());

        assert_eq!(transport.subscription_count(LOCATION).await, 1);
        assert_eq!(manager.live_monitor_count().await, 1);
        trigger.trigger();
    }

    #[tokio::test]
    async fn test_switch_events_reach_channel() {
        let transport = Arc::new(ScriptedTransport::new());
        let (manager, mut rx) = manager(transport.clone(), fast_reconnect());
        let (trigger, shutdown) = shutdown::channel();

        manager.start_monitor(sentinel(), shutdown).await.unwrap();
        transport
            .publisher(LOCATION, 0)
            .await
            .send(PubSubReply::Message {
                channel: "+switch-master".to_string(),
                payload: "cache 10.0.0.1 6379 10.0.0.2 6380".to_string(),
            })
            .await
            .unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.new_master_address(), "10.0.0.2:6380");
        trigger.trigger();
    }

    #[tokio::test]
    async fn test_reconnects_after_loss() {
        let transport = Arc::new(ScriptedTransport::new());
        let (manager, _rx) = manager(transport.clone(), fast_reconnect());
        let (trigger, shutdown) = shutdown::channel();

        manager.start_monitor(sentinel(), shutdown).await.unwrap();

        // Refuse the first few reconnects to exercise backoff
        transport.set_unreachable(LOCATION, true).await;
        transport
            .publisher(LOCATION, 0)
            .await
            .send(PubSubReply::Error("connection reset".to_string()))
            .await
            .unwrap();
        wait_for_state(&manager, SentinelState::Reconnecting).await;

        transport.set_unreachable(LOCATION, false).await;
        let second = transport.publisher(LOCATION, 1).await;
        assert_eq!(manager.live_monitor_count().await, 1);

        // The new subscription is live
        second.send(PubSubReply::Timeout).await.unwrap();
        trigger.trigger();
        wait_for_state(&manager, SentinelState::Lost).await;
    }

    #[tokio::test]
    async fn test_switch_order_survives_reconnect() {
        let transport = Arc::new(ScriptedTransport::new());
        // Capacity 1 and nobody reading until both subscriptions have published
        let (tx, mut rx) = mpsc::channel(1);
        let manager = SentinelManager::new(transport.clone(), tx, settings(fast_reconnect()));
        let (trigger, shutdown) = shutdown::channel();

        manager.start_monitor(sentinel(), shutdown).await.unwrap();

        let switch = |port: u16| PubSubReply::Message {
            channel: "+switch-master".to_string(),
            payload: format!("cache 10.0.0.1 6379 10.0.0.2 {}", port),
        };

        let first = transport.publisher(LOCATION, 0).await;
        for port in 7000..7003 {
            first.send(switch(port)).await.unwrap();
        }
        first.send(PubSubReply::Error("connection reset".to_string())).await.unwrap();

        let second = transport.publisher(LOCATION, 1).await;
        for port in 7003..7006 {
            second.send(switch(port)).await.unwrap();
        }

        for port in 7000..7006 {
            let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(event.new_master_port, port);
        }
        trigger.trigger();
    }

    #[tokio::test]
    async fn test_loss_without_reconnect() {
        let transport = Arc::new(ScriptedTransport::new());
        let (manager, _rx) = manager(transport.clone(), ReconnectConfig::disabled());
        let (_trigger, shutdown) = shutdown::channel();

        manager.start_monitor(sentinel(), shutdown).await.unwrap();
        transport
            .publisher(LOCATION, 0)
            .await
            .send(PubSubReply::Error("gone".to_string()))
            .await
            .unwrap();

        wait_for_state(&manager, SentinelState::Lost).await;
        assert_eq!(manager.live_monitor_count().await, 0);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(transport.subscription_count(LOCATION).await, 1);
    }

    #[tokio::test]
    async fn test_shutdown_stops_reconnect_loop() {
        let transport = Arc::new(ScriptedTransport::new());
        let (manager, _rx) = manager(transport.clone(), fast_reconnect());
        let (trigger, shutdown) = shutdown::channel();

        manager.start_monitor(sentinel(), shutdown).await.unwrap();
        transport.set_unreachable(LOCATION, true).await;
        transport
            .publisher(LOCATION, 0)
            .await
            .send(PubSubReply::Error("gone".to_string()))
            .await
            .unwrap();
        wait_for_state(&manager, SentinelState::Reconnecting).await;

        trigger.trigger();
        wait_for_state(&manager, SentinelState::Lost).await;
    }

    #[tokio::test]
    async fn test_notify_tracks_topology() {
        let transport = Arc::new(ScriptedTransport::new());
        let (manager, _rx) = manager(transport, fast_reconnect());
        let (trigger, shutdown) = shutdown::channel();
        manager.start_monitor(sentinel(), shutdown).await.unwrap();

        let peer = Sentinel::new("10.0.0.7", 26379);
        manager.notify(InstanceEvent::SentinelAdded(peer.clone())).await;
        manager.notify(InstanceEvent::SentinelAdded(sentinel())).await;
        manager.notify(InstanceEvent::SentinelPing(sentinel())).await;
        manager.notify(InstanceEvent::SentinelPing(sentinel())).await;

        let own = manager.status(&sentinel()).await.unwrap();
        assert_eq!(own.state, SentinelState::Monitoring);
        assert_eq!(own.pings, 2);
        assert!(own.last_seen.is_some());

        let discovered = manager.status(&peer).await.unwrap();
        assert_eq!(discovered.state, SentinelState::Discovered);
        assert!(!discovered.state.is_live());

        manager.notify(InstanceEvent::SentinelLost(sentinel())).await;
        assert_eq!(manager.status(&sentinel()).await.unwrap().state, SentinelState::Lost);
        trigger.trigger();
    }

    #[tokio::test]
    async fn test_discovery_seeds_registry_with_external_port() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.set_master(LOCATION, "cache", "10.0.0.1", 6379).await;
        transport
            .set_peers(LOCATION, "cache", vec![Sentinel::new("10.0.0.6", 26379)])
            .await;
        let (manager, _rx) = manager(transport, fast_reconnect());

        let mut client = manager.new_client(&sentinel()).await.unwrap();
        let details = manager
            .discover_master_for_cluster(client.as_mut(), "cache")
            .await
            .unwrap();
        assert_eq!(details, MasterDetails::new("cache", "10.0.0.1", 6379).with_external_port(7000));
        assert_eq!(manager.registry().await.get("cache"), Some(&details));

        let peers = manager.find_connected_sentinels(client.as_mut(), "cache").await.unwrap();
        assert_eq!(peers.len(), 1);
        assert_eq!(
            manager.status(&peers[0]).await.unwrap().state,
            SentinelState::Discovered
        );

        assert!(matches!(
            manager.discover_master_for_cluster(client.as_mut(), "unknown").await,
            Err(RelayError::Query(_))
        ));
    }

    #[tokio::test]
    async fn test_apply_switch_and_snapshot() {
        let transport = Arc::new(ScriptedTransport::new());
        let (manager, _rx) = manager(transport, fast_reconnect());

        let event = MasterSwitchedEvent {
            name: "cache".to_string(),
            old_master_ip: "10.0.0.1".to_string(),
            old_master_port: 6379,
            new_master_ip: "10.0.0.2".to_string(),
            new_master_port: 6380,
        };

        assert_eq!(manager.check_switch(&event).await, SwitchOutcome::Accepted);
        assert_eq!(manager.apply_switch(&event).await, SwitchOutcome::Accepted);
        assert_eq!(manager.apply_switch(&event).await, SwitchOutcome::Duplicate);

        let snapshot = manager.snapshot().await;
        assert_eq!(
            snapshot.masters,
            vec![MasterDetails::new("cache", "10.0.0.2", 6380).with_external_port(7000)]
        );

        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["masters"][0]["external_port"], 7000);

        let unconfigured = MasterSwitchedEvent {
            name: "sessions".to_string(),
            ..event.clone()
        };
        assert_eq!(manager.apply_switch(&unconfigured).await, SwitchOutcome::Accepted);
        assert_eq!(manager.registry().await.get("sessions").map(|m| m.external_port), Some(0));
    }
}
