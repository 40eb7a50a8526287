//! MQTT subscriber feeding the recorder.
//!
//! Subscribes to the configured topic filters on every (re)connect and hands
//! each publish to [`Recorder::handle`] on the blocking pool. Messages are
//! processed one at a time in arrival order, which keeps per-device ordering
//! intact.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::config::MqttConfig;
use crate::ingest::{InboundMessage, IngestOutcome, Recorder};

const RECONNECT_DELAY: Duration = Duration::from_secs(5);

pub fn qos_from_level(level: u8) -> QoS {
    match level {
        0 => QoS::AtMostOnce,
        1 => QoS::AtLeastOnce,
        _ => QoS::ExactlyOnce,
    }
}

pub fn mqtt_options(config: &MqttConfig) -> MqttOptions {
    let mut options = MqttOptions::new(&config.client_id, &config.host, config.port);
    options.set_keep_alive(Duration::from_secs(60));
    options.set_clean_session(true);
    options.set_max_packet_size(1024 * 1024, 1024 * 1024);
    if let Some(user) = &config.username {
        options.set_credentials(user, config.password.clone().unwrap_or_default());
    }
    options
}

/// Run the subscriber until the process shuts down. Connection errors are
/// logged and retried after a short delay.
pub async fn run_subscriber(config: MqttConfig, recorder: Arc<Recorder>) -> Result<()> {
    info!(host = %config.host, port = config.port, topics = ?config.topics, "starting MQTT subscriber");

    let (client, mut eventloop) = AsyncClient::new(mqtt_options(&config), 100);
    let qos = qos_from_level(config.qos);

    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!(host = %config.host, "connected to MQTT broker");
                for topic in &config.topics {
                    if let Err(e) = client.try_subscribe(topic, qos) {
                        error!(topic = %topic, error = %e, "cannot subscribe");
                    }
                }
            }
            Ok(Event::Incoming(Packet::SubAck(_))) => {
                debug!("subscription acknowledged");
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let msg = InboundMessage {
                    topic: publish.topic.clone(),
                    payload: publish.payload.to_vec(),
                    retained: publish.retain,
                };
                deliver(&recorder, msg).await;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "MQTT connection error, reconnecting");
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        }
    }
}

/// Process one message on the blocking pool.
pub async fn deliver(recorder: &Arc<Recorder>, msg: InboundMessage) -> Option<IngestOutcome> {
    let span = info_span!("mqtt_message", topic = %msg.topic, payload_size = msg.payload.len());
    let recorder = Arc::clone(recorder);

    async move {
        match tokio::task::spawn_blocking(move || recorder.handle(&msg)).await {
            Ok(outcome) => {
                debug!(?outcome, "message handled");
                Some(outcome)
            }
            Err(e) => {
                error!(error = %e, "ingest task failed");
                None
            }
        }
    }
    .instrument(span)
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qos_levels() {
        assert_eq!(qos_from_level(0), QoS::AtMostOnce);
        assert_eq!(qos_from_level(1), QoS::AtLeastOnce);
        assert_eq!(qos_from_level(2), QoS::ExactlyOnce);
        assert_eq!(qos_from_level(9), QoS::ExactlyOnce);
    }

    #[test]
    fn options_carry_credentials() {
        let config = MqttConfig {
            username: Some("jane".into()),
            password: Some("secret".into()),
            ..MqttConfig::default()
        };
        let options = mqtt_options(&config);
        assert_eq!(options.broker_address(), ("localhost".to_string(), 1883));
        assert_eq!(options.client_id(), "trackstore");
    }
}
