//! Flippers: the component that repoints traffic after a master switch
//!
//! The orchestration loop talks to a [`Flipper`] only. It receives the seeded
//! registry once at startup and then every switch, one at a time, in the order
//! the switches arrived.
//!
//! Implementations:
//! - [`LoggingFlipper`]: logs switches, changes nothing (default, dry runs)
//! - [`CommandFlipper`]: runs an external program per switch
//! - [`WebhookFlipper`]: POSTs each switch as JSON

use crate::config::FlipperConfig;
use crate::error::{RelayError, Result};
use crate::types::{MasterDetails, MasterDetailsCollection, MasterSwitchedEvent};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::process::Command as AsyncCommand;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Receives master switches and repoints traffic
#[async_trait]
pub trait Flipper: Send + Sync {
    /// Called once after bootstrap with the seeded registry
    async fn initialise_running_state(&self, masters: &MasterDetailsCollection) -> Result<()>;

    /// Called once per switch, sequentially, in receive order
    async fn orchestrate(&self, event: &MasterSwitchedEvent) -> Result<()>;
}

/// Build the flipper named in the configuration
pub fn from_config(config: &FlipperConfig) -> Result<Arc<dyn Flipper>> {
    match config {
        FlipperConfig::Log => Ok(Arc::new(LoggingFlipper::new())),
        FlipperConfig::Command {
            program,
            args,
            timeout_ms,
        } => Ok(Arc::new(
            CommandFlipper::new(program.clone(), Duration::from_millis(*timeout_ms))
                .with_args(args.clone()),
        )),
        FlipperConfig::Webhook { url, timeout_ms } => Ok(Arc::new(WebhookFlipper::new(
            url.clone(),
            Duration::from_millis(*timeout_ms),
        )?)),
    }
}

/// Flipper-side copy of the registry, used to resolve external ports
#[derive(Debug, Default)]
struct RunningState {
    masters: RwLock<MasterDetailsCollection>,
}

impl RunningState {
    async fn replace(&self, masters: &MasterDetailsCollection) {
        *self.masters.write().await = masters.clone();
    }

    /// Record a switch and return the external port of its cluster, 0 for a
    /// cluster the running state has never seen
    async fn record(&self, event: &MasterSwitchedEvent) -> u16 {
        let mut masters = self.masters.write().await;
        let external_port = masters.get(&event.name).map_or(0, |m| m.external_port);
        masters.add_or_replace(
            MasterDetails::new(&event.name, &event.new_master_ip, event.new_master_port)
                .with_external_port(external_port),
        );
        external_port
    }
}

/// Logs switches without acting on them
#[derive(Debug, Default)]
pub struct LoggingFlipper {
    state: RunningState,
    orchestrated: AtomicU64,
}

impl LoggingFlipper {
    /// Flipper with an empty running state
    pub fn new() -> Self {
        Self::default()
    }

    /// Switches received so far
    pub fn orchestrated(&self) -> u64 {
        self.orchestrated.load(Ordering::Relaxed)
    }

    /// Copy of the flipper's view of the masters
    pub async fn masters(&self) -> MasterDetailsCollection {
        self.state.masters.read().await.clone()
    }
}

#[async_trait]
impl Flipper for LoggingFlipper {
    async fn initialise_running_state(&self, masters: &MasterDetailsCollection) -> Result<()> {
        for master in masters.to_sorted_vec() {
            info!(
                cluster = %master.name,
                master = %master.address(),
                external_port = master.external_port,
                "Initial master"
            );
        }
        self.state.replace(masters).await;
        Ok(())
    }

    async fn orchestrate(&self, event: &MasterSwitchedEvent) -> Result<()> {
        let external_port = self.state.record(event).await;
        self.orchestrated.fetch_add(1, Ordering::Relaxed);

        info!(
            cluster = %event.name,
            new_master = %event.new_master_address(),
            external_port,
            "Would repoint traffic (dry run)"
        );
        Ok(())
    }
}

/// Runs an external program for every switch.
///
/// The program receives the configured arguments followed by
/// `<cluster> <new-ip> <new-port> <external-port> <old-ip> <old-port>`.
#[derive(Debug)]
pub struct CommandFlipper {
    program: String,
    args: Vec<String>,
    timeout: Duration,
    state: RunningState,
}

impl CommandFlipper {
    /// Run `program` for each switch, killing it after `timeout`
    pub fn new(program: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            timeout,
            state: RunningState::default(),
        }
    }

    /// Arguments placed before the switch arguments
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    fn switch_args(event: &MasterSwitchedEvent, external_port: u16) -> [String; 6] {
        [
            event.name.clone(),
            event.new_master_ip.clone(),
            event.new_master_port.to_string(),
            external_port.to_string(),
            event.old_master_ip.clone(),
            event.old_master_port.to_string(),
        ]
    }
}

#[async_trait]
impl Flipper for CommandFlipper {
    async fn initialise_running_state(&self, masters: &MasterDetailsCollection) -> Result<()> {
        self.state.replace(masters).await;
        Ok(())
    }

    async fn orchestrate(&self, event: &MasterSwitchedEvent) -> Result<()> {
        let external_port = self.state.record(event).await;
        let switch_args = Self::switch_args(event, external_port);

        debug!(program = %self.program, args = ?switch_args, "Running flip command");

        let run = AsyncCommand::new(&self.program)
            .args(&self.args)
            .args(&switch_args)
            .kill_on_drop(true)
            .output();

        let output = tokio::time::timeout(self.timeout, run)
            .await
            .map_err(|_| RelayError::Timeout(self.timeout))??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(RelayError::flipper(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                stderr.trim()
            )));
        }

        info!(
            cluster = %event.name,
            new_master = %event.new_master_address(),
            external_port,
            "Flip command succeeded"
        );
        Ok(())
    }
}

/// JSON body POSTed by [`WebhookFlipper`]
#[derive(Debug, Serialize)]
struct SwitchNotification<'a> {
    #[serde(flatten)]
    event: &'a MasterSwitchedEvent,
    external_port: u16,
}

/// POSTs every switch to a URL
#[derive(Debug)]
pub struct WebhookFlipper {
    url: String,
    client: reqwest::Client,
    state: RunningState,
}

impl WebhookFlipper {
    /// POST each switch to `url`; fails if the HTTP client cannot be built
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            url: url.into(),
            client,
            state: RunningState::default(),
        })
    }
}

#[async_trait]
impl Flipper for WebhookFlipper {
    async fn initialise_running_state(&self, masters: &MasterDetailsCollection) -> Result<()> {
        self.state.replace(masters).await;
        Ok(())
    }

    async fn orchestrate(&self, event: &MasterSwitchedEvent) -> Result<()> {
        let external_port = self.state.record(event).await;
        let body = SwitchNotification {
            event,
            external_port,
        };

        let response = self.client.post(&self.url).json(&body).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            warn!(url = %self.url, status = %status, "Webhook rejected switch");
            return Err(RelayError::flipper(format!(
                "webhook returned {}: {}",
                status, text
            )));
        }

        info!(cluster = %event.name, url = %self.url, "Webhook notified");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::State;
    use axum::http::StatusCode;
    use axum::routing::post;
    use axum::{Json, Router};
    use tokio::sync::mpsc;

    fn switch(name: &str, new_ip: &str, new_port: u16) -> MasterSwitchedEvent {
        MasterSwitchedEvent {
            name: name.to_string(),
            old_master_ip: "10.0.0.1".to_string(),
            old_master_port: 6379,
            new_master_ip: new_ip.to_string(),
            new_master_port: new_port,
        }
    }

    fn seeded() -> MasterDetailsCollection {
        let mut masters = MasterDetailsCollection::new();
        masters.add_or_replace(MasterDetails::new("cache", "10.0.0.1", 6379).with_external_port(7000));
        masters
    }

    #[tokio::test]
    async fn test_logging_flipper_tracks_switches() {
        let flipper = LoggingFlipper::new();
        flipper.initialise_running_state(&seeded()).await.unwrap();

        flipper.orchestrate(&switch("cache", "10.0.0.2", 6380)).await.unwrap();
        flipper.orchestrate(&switch("sessions", "10.0.1.2", 6379)).await.unwrap();

        assert_eq!(flipper.orchestrated(), 2);
        let masters = flipper.masters().await;
        assert_eq!(
            masters.get("cache"),
            Some(&MasterDetails::new("cache", "10.0.0.2", 6380).with_external_port(7000))
        );
        // Unseeded cluster has no external port
        assert_eq!(masters.get("sessions").map(|m| m.external_port), Some(0));
    }

    #[tokio::test]
    async fn test_retried_switch_keeps_external_port() {
        let flipper = LoggingFlipper::new();
        flipper.initialise_running_state(&seeded()).await.unwrap();

        let event = switch("cache", "10.0.0.2", 6380);
        flipper.orchestrate(&event).await.unwrap();
        flipper.orchestrate(&event).await.unwrap();

        assert_eq!(
            flipper.masters().await.get("cache"),
            Some(&MasterDetails::new("cache", "10.0.0.2", 6380).with_external_port(7000))
        );
    }

    #[tokio::test]
    async fn test_from_config_builds_each_kind() {
        assert!(from_config(&FlipperConfig::Log).is_ok());
        assert!(
            from_config(&FlipperConfig::Command {
                program: "true".to_string(),
                args: vec![],
                timeout_ms: 1000,
            })
            .is_ok()
        );
        assert!(
            from_config(&FlipperConfig::Webhook {
                url: "http://127.0.0.1:1/flip".to_string(),
                timeout_ms: 1000,
            })
            .is_ok()
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_flipper_passes_switch_arguments() {
        let script = r#"test "$1" = cache && test "$2" = 10.0.0.2 && test "$3" = 6380 && test "$4" = 7000 && test "$5" = 10.0.0.1 && test "$6" = 6379"#;
        let flipper = CommandFlipper::new("sh", Duration::from_secs(5))
            .with_args(vec!["-c".to_string(), script.to_string(), "flip".to_string()]);
        flipper.initialise_running_state(&seeded()).await.unwrap();

        tokio_test::assert_ok!(flipper.orchestrate(&switch("cache", "10.0.0.2", 6380)).await);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_flipper_nonzero_exit() {
        let flipper = CommandFlipper::new("false", Duration::from_secs(5));

        let result = flipper.orchestrate(&switch("cache", "10.0.0.2", 6380)).await;
        assert!(matches!(result, Err(RelayError::Flipper(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_flipper_timeout() {
        let flipper = CommandFlipper::new("sh", Duration::from_millis(50))
            .with_args(vec!["-c".to_string(), "sleep 5".to_string(), "flip".to_string()]);

        let result = flipper.orchestrate(&switch("cache", "10.0.0.2", 6380)).await;
        assert!(matches!(result, Err(RelayError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_command_flipper_missing_program() {
        let flipper = CommandFlipper::new("/nonexistent/flip-traffic", Duration::from_secs(1));

        let result = flipper.orchestrate(&switch("cache", "10.0.0.2", 6380)).await;
        assert!(matches!(result, Err(RelayError::Io(_))));
    }

    async fn capture(
        State(tx): State<mpsc::Sender<serde_json::Value>>,
        Json(body): Json<serde_json::Value>,
    ) -> StatusCode {
        let reject = body["name"] == "reject";
        let _ = tx.send(body).await;
        if reject {
            StatusCode::INTERNAL_SERVER_ERROR
        } else {
            StatusCode::NO_CONTENT
        }
    }

    async fn webhook_server() -> (String, mpsc::Receiver<serde_json::Value>) {
        let (tx, rx) = mpsc::channel(8);
        let app = Router::new().route("/flip", post(capture)).with_state(tx);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{}/flip", addr), rx)
    }

    #[tokio::test]
    async fn test_webhook_flipper_posts_switch() {
        let (url, mut rx) = webhook_server().await;
        let flipper = WebhookFlipper::new(url, Duration::from_secs(5)).unwrap();
        flipper.initialise_running_state(&seeded()).await.unwrap();

        flipper.orchestrate(&switch("cache", "10.0.0.2", 6380)).await.unwrap();

        let body = rx.recv().await.unwrap();
        assert_eq!(body["name"], "cache");
        assert_eq!(body["new_master_ip"], "10.0.0.2");
        assert_eq!(body["new_master_port"], 6380);
        assert_eq!(body["old_master_port"], 6379);
        assert_eq!(body["external_port"], 7000);
    }

    #[tokio::test]
    async fn test_webhook_flipper_error_status() {
        let (url, _rx) = webhook_server().await;
        let flipper = WebhookFlipper::new(url, Duration::from_secs(5)).unwrap();

        let result = flipper.orchestrate(&switch("reject", "10.0.0.2", 6380)).await;
        assert!(matches!(result, Err(RelayError::Flipper(_))));
    }

    #[tokio::test]
    async fn test_webhook_flipper_unreachable() {
        let flipper = WebhookFlipper::new("http://127.0.0.1:1/flip", Duration::from_secs(2)).unwrap();

        let result = flipper.orchestrate(&switch("cache", "10.0.0.2", 6380)).await;
        assert!(matches!(result, Err(RelayError::Http(_))));
    }
}
