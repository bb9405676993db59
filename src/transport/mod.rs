//! Cloud links: the reconnecting [`CloudLink`] state machine and the two
//! wire variants it drives (MQTT and raw socket).

use crate::config::{CloudKind, Settings, SocketProtocol};
use crate::error::QueueError;
use crate::network::NetworkReadiness;
use anyhow::Context;
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

pub use link::{CloudLink, LinkOptions};
pub use mqtt::{MqttConnection, MqttConnector};
pub use socket::{SocketConn, SocketConnector};

mod link;
pub mod mqtt;
mod socket;

/// Publish key the uplink frames payloads under on topic-addressed links.
pub const UPLINK_TOPIC_KEY: &str = "up";

/// One unit headed for the cloud.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Publish `payload` on the topic configured under `key`.
    Topic { key: String, payload: Bytes },
    /// Unframed bytes for a stream link.
    Raw(Bytes),
}

impl Outbound {
    pub fn payload(&self) -> &Bytes {
        match self {
            Outbound::Topic { payload, .. } => payload,
            Outbound::Raw(payload) => payload,
        }
    }
}

/// One unit received from the cloud.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inbound {
    /// Topic for broker links, `None` for stream links.
    pub topic: Option<String>,
    pub payload: Bytes,
}

impl Inbound {
    pub fn raw(payload: impl Into<Bytes>) -> Self {
        Self {
            topic: None,
            payload: payload.into(),
        }
    }

    pub fn on_topic(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: Some(topic.into()),
            payload: payload.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for LinkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LinkStatus::Disconnected => "disconnected",
            LinkStatus::Connecting => "connecting",
            LinkStatus::Connected => "connected",
        };
        f.write_str(s)
    }
}

/// Transport-agnostic surface the bridge talks to.
///
/// Connection failures never surface as errors here: they are logged, turn
/// into `false`, and kick off a background reconnect.
pub trait Transport: Send + Sync {
    fn name(&self) -> &str;

    /// Establish the connection once. Logs and returns false on failure.
    fn connect(&self) -> bool;

    /// Start the inbound listener thread (idempotent).
    fn listen(&self);

    /// Start the background reconnect loop unless one is already running.
    fn reconnect(&self);

    /// Write one unit. Returns false, and triggers a reconnect, when the
    /// link is down; such a unit is dropped.
    fn send(&self, unit: Outbound) -> bool;

    /// Block until an inbound unit arrives or the link is closed.
    fn recv(&self) -> Result<Inbound, QueueError>;

    fn recv_timeout(&self, timeout: Duration) -> Result<Inbound, QueueError>;

    fn is_status_ok(&self) -> bool;

    fn status(&self) -> LinkStatus;

    /// Block until connected; `None` waits indefinitely.
    fn wait_connected(&self, timeout: Option<Duration>) -> bool;

    /// Stop the background threads, disconnect and unblock `recv`.
    fn close(&self);

    /// Wrap an uplink payload into this link's wire unit.
    fn frame(&self, payload: Bytes) -> Outbound;
}

/// Opens fresh connections of one wire variant.
pub trait Connector: Send + Sync + 'static {
    type Conn: Connection;

    fn name(&self) -> &str;

    fn open(&self) -> anyhow::Result<Self::Conn>;

    fn frame(&self, payload: Bytes) -> Outbound;
}

/// One live connection.
///
/// `receive` and `write` may be called concurrently from different threads.
pub trait Connection: Send + Sync + 'static {
    /// Wait for the next inbound unit. `Ok(None)` means nothing arrived
    /// within the connection's poll interval; `Err` means the link is broken.
    fn receive(&self) -> anyhow::Result<Option<Inbound>>;

    /// `Ok(false)` is a rejected unit on a healthy link, `Err` a broken link.
    fn write(&self, unit: &Outbound) -> anyhow::Result<bool>;

    fn is_healthy(&self) -> bool;

    /// Close the connection; blocked `receive` calls return.
    fn shutdown(&self);
}

/// Build the link selected by `system_config.cloud`.
pub fn from_settings(
    settings: &Settings,
    readiness: Arc<dyn NetworkReadiness>,
) -> anyhow::Result<Arc<dyn Transport>> {
    let system = settings.system().context("system_config")?;
    let opts = LinkOptions {
        reconnect_delay: system.reconnect_delay(),
        inbound_capacity: system.inbound_capacity,
    };

    let transport: Arc<dyn Transport> = match system.cloud {
        CloudKind::Mqtt => {
            let cfg = settings.mqtt().context("mqtt_private_cloud_config")?;
            CloudLink::new(MqttConnector::new(cfg), readiness, opts)
        }
        CloudKind::Tcp | CloudKind::Udp => {
            let mut cfg = settings.socket().context("socket_private_cloud_config")?;
            if system.cloud == CloudKind::Udp {
                cfg.protocol = SocketProtocol::Udp;
            }
            CloudLink::new(SocketConnector::new(cfg), readiness, opts)
        }
    };
    tracing::info!("[Transport] using {} link", transport.name());
    Ok(transport)
}
