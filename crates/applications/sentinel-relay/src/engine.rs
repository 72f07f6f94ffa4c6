//! Relay engine
//!
//! Wires the pieces together:
//!
//! ```text
//! Monitor ─┐                                      ┌─► Flipper::orchestrate
//! Monitor ─┼─► switch channel ─► orchestration ───┤          │ ok
//! Monitor ─┘        (bounded)        loop         └─► registry update
//!    │
//!    └─► SentinelManager (instance events, reconnects)
//! ```
//!
//! Bootstrap opens a query client per configured sentinel, starts its monitor,
//! seeds the registry from each sentinel's answer for every configured cluster
//! and hands the result to the flipper. The orchestration loop is the only
//! consumer of the switch channel.

use crate::api;
use crate::config::RelayConfig;
use crate::error::{RelayError, Result};
use crate::flipper::Flipper;
use crate::manager::{ManagerSettings, SentinelManager};
use crate::shutdown::{self, Shutdown, ShutdownTrigger};
use crate::transport::SentinelTransport;
use crate::types::{MasterDetailsCollection, MasterSwitchedEvent, SwitchOutcome};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Outcome of [`RelayEngine::start_monitoring`]
#[derive(Debug, Clone)]
pub struct BootstrapReport {
    /// Monitors started
    pub started: usize,
    /// Configured sentinels that could not be used
    pub skipped: usize,
    /// Registry handed to the flipper
    pub masters: MasterDetailsCollection,
}

/// Owns the manager, the flipper and the switch channel
pub struct RelayEngine {
    config: RelayConfig,
    manager: Arc<SentinelManager>,
    flipper: Arc<dyn Flipper>,
    switch_rx: Option<mpsc::Receiver<MasterSwitchedEvent>>,
    trigger: ShutdownTrigger,
    shutdown: Shutdown,
}

impl RelayEngine {
    /// Create an engine; nothing runs until [`start_orchestration`] and
    /// [`start_monitoring`] (or [`run`]) are called.
    ///
    /// [`start_orchestration`]: Self::start_orchestration
    /// [`start_monitoring`]: Self::start_monitoring
    /// [`run`]: Self::run
    pub fn new(config: RelayConfig, transport: Arc<dyn SentinelTransport>, flipper: Arc<dyn Flipper>) -> Self {
        let (switch_tx, switch_rx) = mpsc::channel(config.monitor.switch_channel_capacity.max(1));

        let manager = SentinelManager::new(
            transport,
            switch_tx,
            ManagerSettings::new(&config.monitor, config.external_ports()),
        );

        let (trigger, shutdown) = shutdown::channel();

        Self {
            config,
            manager,
            flipper,
            switch_rx: Some(switch_rx),
            trigger,
            shutdown,
        }
    }

    /// The sentinel manager
    pub fn manager(&self) -> Arc<SentinelManager> {
        self.manager.clone()
    }

    /// Stop every task started by this engine
    pub fn shutdown(&self) {
        self.trigger.trigger();
    }

    /// Spawn the orchestration loop. Returns `None` if it is already running.
    pub fn start_orchestration(&mut self) -> Option<JoinHandle<u64>> {
        let rx = self.switch_rx.take()?;
        Some(tokio::spawn(run_orchestration_loop(
            rx,
            self.manager.clone(),
            self.flipper.clone(),
            self.shutdown.clone(),
        )))
    }

    /// Connect to the configured sentinels and seed the registry
    pub async fn start_monitoring(&self) -> BootstrapReport {
        let mut started = 0;
        let mut skipped = 0;

        for sentinel in &self.config.sentinels {
            let mut client = match self.manager.new_client(sentinel).await {
                Ok(client) => client,
                Err(e) => {
                    warn!(sentinel = %sentinel, error = %e, "Cannot open sentinel client, skipping");
                    skipped += 1;
                    continue;
                }
            };

            match self.manager.start_monitor(sentinel.clone(), self.shutdown.clone()).await {
                Ok(true) => started += 1,
                Ok(false) => debug!(sentinel = %sentinel, "Sentinel configured twice"),
                Err(e) => {
                    warn!(sentinel = %sentinel, error = %e, "Cannot monitor sentinel");
                    skipped += 1;
                }
            }

            for cluster in &self.config.clusters {
                match self
                    .manager
                    .discover_master_for_cluster(client.as_mut(), &cluster.name)
                    .await
                {
                    Ok(details) => info!(
                        sentinel = %sentinel,
                        cluster = %details.name,
                        master = %details.address(),
                        "Discovered master"
                    ),
                    Err(e) => {
                        debug!(sentinel = %sentinel, cluster = %cluster.name, error = %e, "Master discovery failed");
                        continue;
                    }
                }

                if let Err(e) = self
                    .manager
                    .find_connected_sentinels(client.as_mut(), &cluster.name)
                    .await
                {
                    debug!(sentinel = %sentinel, cluster = %cluster.name, error = %e, "Sentinel discovery failed");
                }
            }
        }

        let masters = self.manager.registry().await;
        if let Err(e) = self.flipper.initialise_running_state(&masters).await {
            error!(error = %e, "Flipper failed to initialise running state");
        }

        if started == 0 {
            warn!("No sentinels are currently being monitored");
        } else {
            info!(started, skipped, masters = masters.len(), "Monitoring started");
        }

        BootstrapReport {
            started,
            skipped,
            masters,
        }
    }

    /// Run until ctrl-c
    pub async fn run(self) -> Result<()> {
        self.run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for ctrl-c");
            }
        })
        .await
    }

    /// Run until `stop` resolves
    pub async fn run_until<F>(mut self, stop: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        info!(
            clusters = self.config.clusters.len(),
            sentinels = self.config.sentinels.len(),
            "Starting sentinel relay"
        );

        let mut orchestration = self
            .start_orchestration()
            .ok_or(RelayError::ChannelClosed)?;
        self.start_monitoring().await;

        let api_task = if self.config.api.enabled {
            let bind = self.config.api.bind.clone();
            let manager = self.manager.clone();
            let shutdown = self.shutdown.clone();
            Some(tokio::spawn(async move { api::serve(&bind, manager, shutdown).await }))
        } else {
            None
        };

        let result = tokio::select! {
            _ = stop => {
                info!("Shutdown requested");
                Ok(())
            }
            finished = &mut orchestration => {
                error!(result = ?finished, "Orchestration loop stopped unexpectedly");
                Err(RelayError::ChannelClosed)
            }
        };

        self.shutdown();

        if let Some(task) = api_task {
            match task.await {
                Ok(Err(e)) => error!(error = %e, "Status API failed"),
                Err(e) => error!(error = %e, "Status API task panicked"),
                Ok(Ok(())) => {}
            }
        }
        if let Ok(orchestrated) = orchestration.await {
            info!(orchestrated, "Sentinel relay stopped");
        }

        result
    }
}

/// Drain the switch channel, handing each event to the flipper strictly in
/// receive order.
///
/// An event is checked against the registry first. Repeats of a switch the
/// registry already reflects and late copies of older switches (their old
/// master is no longer current) are skipped. The registry moves to the new
/// master only after the flipper succeeds, so a failed flip is retried when
/// another sentinel announces the same switch. Returns the number of events
/// handed to the flipper.
pub async fn run_orchestration_loop(
    mut rx: mpsc::Receiver<MasterSwitchedEvent>,
    manager: Arc<SentinelManager>,
    flipper: Arc<dyn Flipper>,
    mut shutdown: Shutdown,
) -> u64 {
    let mut orchestrated = 0;

    loop {
        let event = tokio::select! {
            biased;

            _ = shutdown.wait() => break,

            event = rx.recv() => match event {
                Some(event) => event,
                None => {
                    warn!("All switch event senders are gone");
                    break;
                }
            },
        };

        match manager.check_switch(&event).await {
            SwitchOutcome::Accepted => {}
            SwitchOutcome::Duplicate => {
                debug!(
                    cluster = %event.name,
                    new_master = %event.new_master_address(),
                    "Switch already applied, skipping"
                );
                continue;
            }
            SwitchOutcome::Stale => {
                warn!(
                    cluster = %event.name,
                    old_master = %event.old_master_address(),
                    new_master = %event.new_master_address(),
                    "Stale switch, old master is no longer current, skipping"
                );
                continue;
            }
        }

        info!(
            cluster = %event.name,
            new_master = %event.new_master_address(),
            "Orchestrating master switch"
        );
        orchestrated += 1;

        match flipper.orchestrate(&event).await {
            Ok(()) => {
                manager.apply_switch(&event).await;
            }
            Err(e) => error!(
                cluster = %event.name,
                error = %e,
                "Flipper failed to orchestrate switch, registry unchanged"
            ),
        }
    }

    orchestrated
}
