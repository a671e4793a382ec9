//! Async shell around the driver.
//!
//! One task owns the driver and polls the MQTT event loop; connection
//! transitions and inbound publishes become synchronous driver calls, so the
//! single-threaded model holds. Connection loss schedules a fixed-delay
//! reconnect, indefinitely, with no backoff growth — and because the loop is
//! sequential there is never more than one pending reconnect.

use crate::driver::Driver;
use crate::host::Host;
use crate::mux::MqttLink;
use rumqttc::{Event, EventLoop, Packet, QoS};
use std::time::Duration;
use tracing::{info, warn};

fn qos_byte(qos: QoS) -> u8 {
    match qos {
        QoS::AtMostOnce => 0,
        QoS::AtLeastOnce => 1,
        QoS::ExactlyOnce => 2,
    }
}

/// Runs the driver against the broker until shutdown.
pub async fn run<H: Host>(
    driver: &mut Driver<MqttLink, H>,
    eventloop: &mut EventLoop,
    reconnect_delay: Duration,
) -> anyhow::Result<()> {
    driver.link_connecting();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown requested");
                driver.link_down();
                return Ok(());
            }

            event = eventloop.poll() => match event {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    driver.link_up();
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let payload = String::from_utf8_lossy(&publish.payload).to_string();
                    driver.handle_incoming(
                        &publish.topic,
                        &payload,
                        qos_byte(publish.qos),
                        publish.retain,
                    );
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    driver.link_down();
                }
                Ok(_) => {}
                Err(e) => {
                    driver.link_down();
                    warn!(
                        error = %e,
                        delay_secs = reconnect_delay.as_secs(),
                        "Connection failed, reconnect scheduled"
                    );
                    tokio::time::sleep(reconnect_delay).await;
                    driver.link_connecting();
                }
            }
        }
    }
}
