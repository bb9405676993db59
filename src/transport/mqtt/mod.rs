//! Broker-backed link: MQTT 3.1.1 over TCP.

pub use client::{MqttConnection, MqttConnector};
pub use codec::{CodecError, Connect, Packet, Publish};

mod client;
pub mod codec;
