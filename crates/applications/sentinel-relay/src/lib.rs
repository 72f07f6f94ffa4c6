//! # Sentinel Relay
//!
//! Watches a fleet of Redis Sentinels and relays master failovers to a flipper
//! that repoints client traffic.
//!
//! ## Architecture
//!
//! ```text
//! Sentinel ◄── subscribe ── Monitor ──┐
//! Sentinel ◄── subscribe ── Monitor ──┼─► switch channel ─► orchestration loop ─► Flipper
//! Sentinel ◄── subscribe ── Monitor ──┘                            │
//!                              │                                   ▼
//!                              └──── instance events ──► SentinelManager (registry)
//! ```
//!
//! - [`monitor`]: one pub/sub subscription per sentinel with a heartbeat
//! - [`manager`]: monitor population, reconnects, master registry
//! - [`parser`]: Sentinel notification payloads to typed events
//! - [`engine`]: bootstrap and the single orchestration consumer
//! - [`flipper`]: what happens after a switch (log, command, webhook)
//!
//! A failover is announced by every sentinel that sees it. The orchestration
//! loop checks each announcement against the registry, skipping repeats and
//! late copies of older switches, so the flipper sees each switch once.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod api;
pub mod config;
pub mod engine;
pub mod error;
pub mod flipper;
pub mod logging;
pub mod manager;
pub mod monitor;
pub mod parser;
pub mod shutdown;
pub mod transport;
pub mod types;

// ============================================================================
// Public exports
// ============================================================================

// Error handling
pub use error::{ParseError, RelayError, Result};

// Domain types
pub use types::{
    InstanceEvent, MasterDetails, MasterDetailsCollection, MasterSwitchedEvent, Sentinel, SwitchOutcome,
};

// Configuration
pub use config::{
    ApiConfig, ClusterConfig, FlipperConfig, LoggingConfig, MonitorConfig, ReconnectConfig, RelayConfig,
};

// Monitoring
pub use manager::{ManagerSettings, ManagerSnapshot, SentinelManager, SentinelState, SentinelStatus};
pub use monitor::{InstanceEventSink, Monitor, MonitorExit, MonitorState, switch_handoff};
pub use transport::{PubSubReply, RedisTransport, SentinelClient, SentinelTransport, Subscription};

// Orchestration
pub use engine::{BootstrapReport, RelayEngine, run_orchestration_loop};
pub use flipper::{CommandFlipper, Flipper, LoggingFlipper, WebhookFlipper};
pub use shutdown::{Shutdown, ShutdownTrigger};
