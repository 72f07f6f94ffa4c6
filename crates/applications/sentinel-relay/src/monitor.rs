//! Per-sentinel monitor
//!
//! A monitor owns one pub/sub subscription to one sentinel and moves through
//! three states:
//!
//! ```text
//! Connecting ──subscribe ok──► Active ──lost / shutdown──► Terminated
//!     │
//!     └── subscribe error: returned to the caller, never Active
//! ```
//!
//! While Active, each loop iteration waits for whichever comes first:
//!
//! - a reply on the subscription
//! - the heartbeat interval elapsing with no message (emits `SentinelPing`)
//! - shutdown
//!
//! Sentinel does not reliably signal a dropped connection, so the heartbeat is
//! the only liveness signal that does not depend on message traffic. The
//! heartbeat deadline moves only on a real message or a ping; read timeouts
//! from the transport leave it alone.
//!
//! ## Switch hand-off
//!
//! Parsed `+switch-master` events go into a per-sentinel unbounded queue
//! drained by one forwarder task onto the shared bounded channel (see
//! [`switch_handoff`]). A slow orchestration loop therefore stalls only
//! forwarders, never the receive/heartbeat loop of any monitor. The queue
//! outlives reconnects, so a sentinel's events keep their order.

use crate::error::Result;
use crate::parser::{self, MONITORED_CHANNELS, SentinelChannel};
use crate::shutdown::Shutdown;
use crate::transport::{PubSubReply, SentinelTransport, Subscription};
use crate::types::{InstanceEvent, MasterSwitchedEvent, Sentinel};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Weak;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{Instrument, debug, info, info_span, trace, warn};

/// Receiver of instance lifecycle events.
///
/// Implementations must tolerate concurrent calls from any number of monitors.
#[async_trait]
pub trait InstanceEventSink: Send + Sync {
    /// Record one lifecycle event
    async fn notify(&self, event: InstanceEvent);
}

/// Monitor lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MonitorState {
    /// Subscribed, loop not started
    Connecting,
    /// Receiving replies
    Active,
    /// Loop finished
    Terminated,
}

/// Why a monitor left the Active state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorExit {
    /// The subscription died; `SentinelLost` was emitted
    Lost(String),
    /// Shutdown was signalled
    Cancelled,
}

/// Monitor for a single sentinel
pub struct Monitor {
    sentinel: Sentinel,
    subscription: Subscription,
    /// Non-owning: monitors only report, they never keep the manager alive
    sink: Weak<dyn InstanceEventSink>,
    handoff: mpsc::UnboundedSender<MasterSwitchedEvent>,
    heartbeat: Duration,
    state: MonitorState,
}

/// Start the forwarder for one sentinel's switch events and return its queue.
///
/// The forwarder exits once every clone of the returned sender is dropped.
pub fn switch_handoff(
    switch_tx: mpsc::Sender<MasterSwitchedEvent>,
) -> mpsc::UnboundedSender<MasterSwitchedEvent> {
    let (handoff_tx, handoff_rx) = mpsc::unbounded_channel();
    tokio::spawn(forward_switch_events(handoff_rx, switch_tx).in_current_span());
    handoff_tx
}

impl Monitor {
    /// Subscribe to the sentinel's notification channels.
    ///
    /// A subscription failure is returned here and no monitor exists.
    /// Switch events go to `handoff`, usually from [`switch_handoff`].
    pub async fn connect(
        sentinel: Sentinel,
        transport: &dyn SentinelTransport,
        sink: Weak<dyn InstanceEventSink>,
        handoff: mpsc::UnboundedSender<MasterSwitchedEvent>,
        heartbeat: Duration,
    ) -> Result<Self> {
        info!(sentinel = %sentinel, "Connecting to sentinel");

        let subscription = transport.subscribe(&sentinel, &MONITORED_CHANNELS).await?;

        Ok(Self {
            sentinel,
            subscription,
            sink,
            handoff,
            heartbeat,
            state: MonitorState::Connecting,
        })
    }

    /// The monitored sentinel
    pub fn sentinel(&self) -> &Sentinel {
        &self.sentinel
    }

    /// Current lifecycle state
    pub fn state(&self) -> MonitorState {
        self.state
    }

    /// Run the Active loop until the subscription dies or shutdown fires
    pub async fn run(mut self, mut shutdown: Shutdown) -> MonitorExit {
        let span = info_span!("monitor", sentinel = %self.sentinel);

        async move {
            self.state = MonitorState::Active;
            info!("Monitoring sentinel");

            let heartbeat = tokio::time::sleep(self.heartbeat);
            tokio::pin!(heartbeat);

            let exit = loop {
                tokio::select! {
                    biased;

                    _ = shutdown.wait() => break MonitorExit::Cancelled,

                    reply = self.subscription.recv() => {
                        let reply = reply.unwrap_or_else(|| {
                            PubSubReply::Error("subscription ended".to_string())
                        });
                        if matches!(reply, PubSubReply::Message { .. }) {
                            heartbeat.as_mut().reset(Instant::now() + self.heartbeat);
                        }
                        if let Some(exit) = self.handle_reply(reply).await {
                            break exit;
                        }
                    }

                    _ = &mut heartbeat => {
                        trace!("Heartbeat");
                        self.notify(InstanceEvent::SentinelPing(self.sentinel.clone())).await;
                        heartbeat.as_mut().reset(Instant::now() + self.heartbeat);
                    }
                }
            };

            self.state = MonitorState::Terminated;
            info!(exit = ?exit, "Monitor terminated");
            exit
        }
        .instrument(span)
        .await
    }

    /// Returns `Some` when the reply ends the Active state
    async fn handle_reply(&mut self, reply: PubSubReply) -> Option<MonitorExit> {
        match reply {
            PubSubReply::Timeout => {
                debug!("Subscription read timed out, continuing");
                None
            }
            PubSubReply::Error(reason) => {
                warn!(error = %reason, "Sentinel lost");
                self.notify(InstanceEvent::SentinelLost(self.sentinel.clone())).await;
                Some(MonitorExit::Lost(reason))
            }
            PubSubReply::Message { channel, payload } => {
                self.handle_message(&channel, &payload).await;
                None
            }
        }
    }

    async fn handle_message(&mut self, channel: &str, payload: &str) {
        match SentinelChannel::from_name(channel) {
            Some(SentinelChannel::SwitchMaster) => match parser::parse_switch_master(payload) {
                Ok(event) => {
                    info!(
                        cluster = %event.name,
                        old_master = %event.old_master_address(),
                        new_master = %event.new_master_address(),
                        "Master switched"
                    );
                    if self.handoff.send(event).is_err() {
                        warn!("Switch forwarder is gone, event dropped");
                    }
                }
                Err(e) => warn!(error = %e, "Dropping malformed +switch-master message"),
            },
            Some(SentinelChannel::Sentinel) => match parser::parse_sentinel_announce(payload) {
                Ok((host, port)) => {
                    debug!(host = %host, port, "Sentinel announced");
                    self.notify(InstanceEvent::SentinelAdded(Sentinel::new(host, port)))
                        .await;
                }
                Err(e) => warn!(error = %e, "Dropping malformed +sentinel message"),
            },
            Some(SentinelChannel::SlaveReconfDone) => {
                debug!(payload = %payload, "Replica reconfigured");
            }
            None => warn!(channel = %channel, "Message on unknown channel"),
        }
    }

    async fn notify(&mut self, event: InstanceEvent) {
        match self.sink.upgrade() {
            Some(sink) => sink.notify(event).await,
            None => debug!(event = event.kind(), "No event sink, dropping instance event"),
        }
    }
}

/// Move queued switch events onto the shared channel in order
async fn forward_switch_events(
    mut queue: mpsc::UnboundedReceiver<MasterSwitchedEvent>,
    switch_tx: mpsc::Sender<MasterSwitchedEvent>,
) {
    while let Some(event) = queue.recv().await {
        if switch_tx.send(event).await.is_err() {
            warn!("Master switch channel closed, discarding queued events");
            return;
        }
    }
}
