//! Status API
//!
//! - `GET /api/ping`: liveness, always `{"ping":"pong"}`
//! - `GET /api/sentinel`: known sentinels and the master registry

use crate::error::Result;
use crate::manager::{ManagerSnapshot, SentinelManager};
use crate::shutdown::Shutdown;
use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, info};

/// Body of `GET /api/ping`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingResponse {
    /// Always `"pong"`
    pub ping: String,
}

/// Build the router
pub fn router(manager: Arc<SentinelManager>) -> Router {
    Router::new()
        .route("/api/ping", get(handle_ping))
        .route("/api/sentinel", get(handle_sentinel))
        .with_state(manager)
}

/// Bind `bind` and serve until shutdown
pub async fn serve(bind: &str, manager: Arc<SentinelManager>, shutdown: Shutdown) -> Result<()> {
    let listener = TcpListener::bind(bind).await?;
    serve_listener(listener, manager, shutdown).await
}

/// Serve on an already bound listener until shutdown
pub async fn serve_listener(listener: TcpListener, manager: Arc<SentinelManager>, mut shutdown: Shutdown) -> Result<()> {
    info!(address = %listener.local_addr()?, "Status API listening");

    axum::serve(listener, router(manager))
        .with_graceful_shutdown(async move { shutdown.wait().await })
        .await?;

    info!("Status API stopped");
    Ok(())
}

async fn handle_ping() -> Json<PingResponse> {
    Json(PingResponse {
        ping: "pong".to_string(),
    })
}

async fn handle_sentinel(State(manager): State<Arc<SentinelManager>>) -> Json<ManagerSnapshot> {
    debug!("Sentinel status requested");
    Json(manager.snapshot().await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReconnectConfig;
    use crate::manager::{ManagerSettings, SentinelState};
    use crate::shutdown;
    use crate::transport::testing::ScriptedTransport;
    use crate::types::{MasterSwitchedEvent, Sentinel};
    use std::collections::HashMap;
    use std::time::Duration;
    use tokio::sync::mpsc;

    async fn start() -> (String, Arc<SentinelManager>, shutdown::ShutdownTrigger, tokio::task::JoinHandle<Result<()>>) {
        let (tx, _rx) = mpsc::channel(4);
        let manager = SentinelManager::new(
            Arc::new(ScriptedTransport::new()),
            tx,
            ManagerSettings {
                heartbeat: Duration::from_secs(1),
                reconnect: ReconnectConfig::disabled(),
                external_ports: HashMap::from([("cache".to_string(), 7000)]),
            },
        );
        let (trigger, shutdown) = shutdown::channel();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let server = tokio::spawn(serve_listener(listener, manager.clone(), shutdown));

        (base, manager, trigger, server)
    }

    #[tokio::test]
    async fn test_ping() {
        let (base, _manager, trigger, server) = start().await;

        let body: PingResponse = reqwest::get(format!("{}/api/ping", base))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body.ping, "pong");

        trigger.trigger();
        tokio_test::assert_ok!(server.await.unwrap());
    }

    #[tokio::test]
    async fn test_sentinel_snapshot() {
        let (base, manager, trigger, server) = start().await;

        let (_keep, shutdown) = shutdown::channel();
        manager
            .start_monitor(Sentinel::new("10.0.0.5", 26379), shutdown)
            .await
            .unwrap();
        manager
            .apply_switch(&MasterSwitchedEvent {
                name: "cache".to_string(),
                old_master_ip: "10.0.0.1".to_string(),
                old_master_port: 6379,
                new_master_ip: "10.0.0.2".to_string(),
                new_master_port: 6380,
            })
            .await;

        let body: serde_json::Value = reqwest::get(format!("{}/api/sentinel", base))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();

        assert_eq!(body["sentinels"][0]["sentinel"]["host"], "10.0.0.5");
        assert_eq!(
            body["sentinels"][0]["state"],
            serde_json::to_value(SentinelState::Monitoring).unwrap()
        );
        assert_eq!(body["masters"][0]["ip"], "10.0.0.2");
        assert_eq!(body["masters"][0]["external_port"], 7000);

        trigger.trigger();
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_bind_failure() {
        let (tx, _rx) = mpsc::channel(1);
        let manager = SentinelManager::new(
            Arc::new(ScriptedTransport::new()),
            tx,
            ManagerSettings::new(&Default::default(), HashMap::new()),
        );
        let (_trigger, shutdown) = shutdown::channel();

        assert!(serve("not-an-address", manager, shutdown).await.is_err());
    }
}
