//! Sentinel transport
//!
//! The monitors and the manager only see two narrow traits:
//!
//! - [`SentinelTransport`] opens query clients and pub/sub subscriptions
//! - [`SentinelClient`] answers the two `SENTINEL` queries used at bootstrap
//!
//! [`RedisTransport`] implements both over the `redis` crate. A subscription is
//! surfaced as a stream of [`PubSubReply`] values: a message, a read-timeout
//! marker, or a terminal error. The underlying connection does not reliably
//! report a dead peer, which is why monitors add their own heartbeat.

use crate::config::MonitorConfig;
use crate::error::{RelayError, Result};
use crate::parser::parse_port;
use crate::types::{MasterDetails, Sentinel};
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use std::collections::HashMap;
use std::pin::Pin;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// One item received on a subscription
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PubSubReply {
    /// A published message
    Message {
        /// Channel the message was published on
        channel: String,
        /// Raw payload text
        payload: String,
    },
    /// No message within the transport's read timeout
    Timeout,
    /// The connection is gone; nothing follows
    Error(String),
}

/// Live pub/sub subscription to one sentinel
pub struct Subscription {
    replies: Pin<Box<dyn Stream<Item = PubSubReply> + Send>>,
}

impl Subscription {
    /// Wrap a reply stream
    pub fn new<S>(replies: S) -> Self
    where
        S: Stream<Item = PubSubReply> + Send + 'static,
    {
        Self {
            replies: Box::pin(replies),
        }
    }

    /// Wrap a channel receiver
    pub fn from_receiver(mut rx: mpsc::Receiver<PubSubReply>) -> Self {
        Self::new(async_stream::stream! {
            while let Some(reply) = rx.recv().await {
                yield reply;
            }
        })
    }

    /// Next reply, `None` once the subscription has ended. Cancel safe.
    pub async fn recv(&mut self) -> Option<PubSubReply> {
        self.replies.next().await
    }
}

/// Query side of a sentinel connection
#[async_trait]
pub trait SentinelClient: Send {
    /// `SENTINEL get-master-addr-by-name <cluster>`
    async fn discover_master_for_cluster(&mut self, cluster_name: &str) -> Result<MasterDetails>;

    /// `SENTINEL sentinels <cluster>`: the other sentinels watching a cluster
    async fn find_connected_sentinels(&mut self, cluster_name: &str) -> Result<Vec<Sentinel>>;
}

/// Opens connections to sentinels
#[async_trait]
pub trait SentinelTransport: Send + Sync + 'static {
    /// Open a query connection
    async fn open(&self, sentinel: &Sentinel) -> Result<Box<dyn SentinelClient>>;

    /// Subscribe to `channels` on a sentinel
    async fn subscribe(&self, sentinel: &Sentinel, channels: &[&str]) -> Result<Subscription>;
}

/// [`SentinelTransport`] over the `redis` crate
#[derive(Debug, Clone)]
pub struct RedisTransport {
    /// Upper bound on establishing a connection
    connect_timeout: Duration,

    /// Emit [`PubSubReply::Timeout`] when no message arrives within this window
    read_timeout: Option<Duration>,
}

impl RedisTransport {
    /// Create a transport with a connect timeout and no read timeout
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            read_timeout: None,
        }
    }

    /// Set the read timeout
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = Some(timeout);
        self
    }

    /// Build from the monitor section of the configuration
    pub fn from_config(config: &MonitorConfig) -> Self {
        Self {
            connect_timeout: config.connect_timeout(),
            read_timeout: config.read_timeout(),
        }
    }

    fn client_for(&self, sentinel: &Sentinel) -> Result<redis::Client> {
        redis::Client::open(format!("redis://{}/", sentinel.location()))
            .map_err(|e| RelayError::connect(sentinel, e))
    }
}

#[async_trait]
impl SentinelTransport for RedisTransport {
    async fn open(&self, sentinel: &Sentinel) -> Result<Box<dyn SentinelClient>> {
        let client = self.client_for(sentinel)?;

        let connection = tokio::time::timeout(
            self.connect_timeout,
            client.get_multiplexed_async_connection(),
        )
        .await
        .map_err(|_| {
            RelayError::connect(sentinel, format!("timed out after {:?}", self.connect_timeout))
        })?
        .map_err(|e| RelayError::connect(sentinel, e))?;

        debug!(sentinel = %sentinel, "Opened sentinel query connection");

        Ok(Box::new(RedisSentinelClient {
            sentinel: sentinel.clone(),
            connection,
        }))
    }

    async fn subscribe(&self, sentinel: &Sentinel, channels: &[&str]) -> Result<Subscription> {
        let client = self.client_for(sentinel)?;

        let mut pubsub = tokio::time::timeout(self.connect_timeout, client.get_async_pubsub())
            .await
            .map_err(|_| {
                RelayError::connect(sentinel, format!("timed out after {:?}", self.connect_timeout))
            })?
            .map_err(|e| RelayError::connect(sentinel, e))?;

        for channel in channels {
            pubsub
                .subscribe(*channel)
                .await
                .map_err(|e| RelayError::subscribe(sentinel, e))?;
        }

        debug!(sentinel = %sentinel, channels = ?channels, "Subscribed to sentinel");

        let read_timeout = self.read_timeout;
        let location = sentinel.location();

        Ok(Subscription::new(async_stream::stream! {
            let mut messages = Box::pin(pubsub.into_on_message());
            loop {
                let next = match read_timeout {
                    Some(limit) => match tokio::time::timeout(limit, messages.next()).await {
                        Ok(next) => next,
                        Err(_) => {
                            yield PubSubReply::Timeout;
                            continue;
                        }
                    },
                    None => messages.next().await,
                };

                let msg = match next {
                    Some(msg) => msg,
                    None => {
                        yield PubSubReply::Error(format!("subscription to {} closed", location));
                        break;
                    }
                };

                match msg.get_payload::<String>() {
                    Ok(payload) => {
                        yield PubSubReply::Message {
                            channel: msg.get_channel_name().to_string(),
                            payload,
                        };
                    }
                    Err(e) => {
                        warn!(sentinel = %location, error = %e, "Dropping non-text pub/sub payload");
                    }
                }
            }
        }))
    }
}

/// Query connection to one sentinel
struct RedisSentinelClient {
    sentinel: Sentinel,
    connection: redis::aio::MultiplexedConnection,
}

#[async_trait]
impl SentinelClient for RedisSentinelClient {
    async fn discover_master_for_cluster(&mut self, cluster_name: &str) -> Result<MasterDetails> {
        let reply: Option<(String, String)> = redis::cmd("SENTINEL")
            .arg("get-master-addr-by-name")
            .arg(cluster_name)
            .query_async(&mut self.connection)
            .await?;

        let (ip, port) = reply.ok_or_else(|| {
            RelayError::query(format!(
                "sentinel {} does not monitor cluster {}",
                self.sentinel, cluster_name
            ))
        })?;

        let port = parse_port(&port, &port)?;
        Ok(MasterDetails::new(cluster_name, ip, port))
    }

    async fn find_connected_sentinels(&mut self, cluster_name: &str) -> Result<Vec<Sentinel>> {
        let entries: Vec<HashMap<String, String>> = redis::cmd("SENTINEL")
            .arg("sentinels")
            .arg(cluster_name)
            .query_async(&mut self.connection)
            .await?;

        entries.iter().map(sentinel_from_fields).collect()
    }
}

/// Build a sentinel from one `SENTINEL sentinels` entry
fn sentinel_from_fields(fields: &HashMap<String, String>) -> Result<Sentinel> {
    let ip = fields
        .get("ip")
        .filter(|ip| !ip.is_empty())
        .ok_or_else(|| RelayError::query("sentinel entry without ip"))?;
    let port = fields
        .get("port")
        .ok_or_else(|| RelayError::query("sentinel entry without port"))?;

    Ok(Sentinel::new(ip.clone(), parse_port(port, port)?))
}
