//! Broker link seam.
//!
//! The multiplexer talks to the upstream through [`BrokerLink`] so the
//! connection handling stays testable without a broker. [`MqttLink`] is the
//! production implementation over the rumqttc client; its `try_*` calls are
//! non-blocking, which keeps every multiplexer method synchronous.

use crate::config::BrokerConfig;
use rumqttc::{AsyncClient, EventLoop, MqttOptions, QoS};
use std::fmt;
use std::time::Duration;

/// Upstream operation failure. Carried as a message only; the caller logs
/// and drops, it never retries.
#[derive(Debug)]
pub struct LinkError {
    message: String,
}

impl LinkError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for LinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for LinkError {}

/// The handful of upstream primitives the multiplexer needs.
pub trait BrokerLink {
    fn subscribe(&mut self, topic: &str, qos: u8) -> Result<(), LinkError>;
    fn unsubscribe(&mut self, topic: &str) -> Result<(), LinkError>;
    fn publish(&mut self, topic: &str, payload: &str, qos: u8, retain: bool)
        -> Result<(), LinkError>;
}

/// Maps the wire-level 0/1/2 QoS byte onto the client's enum. Anything else
/// degrades to at-most-once.
pub fn to_qos(qos: u8) -> QoS {
    match qos {
        1 => QoS::AtLeastOnce,
        2 => QoS::ExactlyOnce,
        _ => QoS::AtMostOnce,
    }
}

/// rumqttc-backed broker link.
pub struct MqttLink {
    client: AsyncClient,
}

impl MqttLink {
    /// Builds the MQTT session from broker configuration. The returned event
    /// loop must be polled by the driver task; connection state changes and
    /// inbound messages arrive there.
    pub fn connect(config: &BrokerConfig) -> (Self, EventLoop) {
        let mut options = MqttOptions::new(&config.client_id, &config.host, config.port);
        options.set_keep_alive(Duration::from_secs(config.keepalive_secs));
        if !config.username.is_empty() {
            options.set_credentials(&config.username, &config.password);
        }

        let (client, eventloop) = AsyncClient::new(options, 100);
        (Self { client }, eventloop)
    }
}

impl BrokerLink for MqttLink {
    fn subscribe(&mut self, topic: &str, qos: u8) -> Result<(), LinkError> {
        self.client
            .try_subscribe(topic, to_qos(qos))
            .map_err(|e| LinkError::new(e.to_string()))
    }

    fn unsubscribe(&mut self, topic: &str) -> Result<(), LinkError> {
        self.client
            .try_unsubscribe(topic)
            .map_err(|e| LinkError::new(e.to_string()))
    }

    fn publish(
        &mut self,
        topic: &str,
        payload: &str,
        qos: u8,
        retain: bool,
    ) -> Result<(), LinkError> {
        self.client
            .try_publish(topic, to_qos(qos), retain, payload)
            .map_err(|e| LinkError::new(e.to_string()))
    }
}
