use crate::bus::BrokerEndpoint;
use crate::errors::{Error, Result};
use crate::topic::control_topic;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use std::time::Duration;
use tracing::{debug, info, warn};

/// A user-composed command for one device.
///
/// The body only has to be valid JSON; it is published verbatim.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlCommand {
    device_id: String,
    body: String,
}

impl ControlCommand {
    pub fn new(device_id: impl Into<String>, body: impl Into<String>) -> Result<Self> {
        let device_id = device_id.into();
        let body = body.into();

        if device_id.is_empty() {
            return Err(Error::InvalidCommand("device id cannot be empty".to_string()));
        }
        serde_json::from_str::<serde_json::Value>(&body)
            .map_err(|e| Error::InvalidCommand(format!("invalid JSON: {}", e)))?;

        Ok(Self { device_id, body })
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    pub fn topic(&self) -> String {
        control_topic(&self.device_id)
    }
}

/// Publishes `command` over a short-lived connection and waits for the
/// broker's acknowledgement.
pub async fn send_control(
    endpoint: &BrokerEndpoint,
    command: &ControlCommand,
    timeout: Duration,
) -> Result<()> {
    let client_id = format!("monitor-control-{}", uuid::Uuid::new_v4());
    let mut mqtt_options = MqttOptions::new(client_id, endpoint.host.clone(), endpoint.port);
    mqtt_options.set_keep_alive(Duration::from_secs(30));
    mqtt_options.set_clean_session(true);

    let (client, mut eventloop) = AsyncClient::new(mqtt_options, 10);
    let topic = command.topic();

    client
        .publish(topic.as_str(), QoS::AtLeastOnce, false, command.body().as_bytes().to_vec())
        .await?;

    tokio::time::timeout(timeout, wait_for_puback(&mut eventloop))
        .await
        .map_err(|_| Error::Timeout(format!("no acknowledgement for {}", topic)))??;
    info!("Control command sent to {}", topic);

    client.disconnect().await?;
    let flushed = tokio::time::timeout(timeout, async {
        loop {
            match eventloop.poll().await {
                Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                Ok(_) => {}
            }
        }
    })
    .await;
    if flushed.is_err() {
        warn!("Timed out disconnecting after control command");
    }

    Ok(())
}

async fn wait_for_puback(eventloop: &mut EventLoop) -> Result<()> {
    loop {
        match eventloop.poll().await? {
            Event::Incoming(Packet::PubAck(_)) => return Ok(()),
            event => debug!("Control connection event: {:?}", event),
        }
    }
}
