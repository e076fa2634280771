//! # Transport
//!
//! The MQTT boundary the rest of the engine depends on only through the
//! [`Transport`] trait, grounded in the teacher's `replication.rs`
//! (`rumqttc::AsyncClient`, `{topic_prefix}/events` topic, keep-alive of
//! 30s) but completed: the teacher's eventloop handler only logged
//! incoming notifications, this one forwards every payload to an
//! `mpsc` channel the Applicator drains, and publishing is decoupled from
//! the caller's task via a bounded channel so a slow or disconnected
//! broker applies backpressure instead of blocking Storage's callers.
//!
//! Kept synchronous and non-blocking (`try_publish` rather than an async
//! trait method) since the crate has no `async-trait` dependency and the
//! Publisher already owns the retry/outbox logic for a full channel —
//! `try_publish` only needs to report "accepted" or "try again later".

use crate::error::{EngineError, EngineResult};
use log::{error, info, warn};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::time::Duration;
use tokio::sync::mpsc;

/// Depth of the outgoing publish channel between callers and the MQTT
/// event-loop task. Bounded so a stalled broker can't let memory grow
/// without limit — callers fall back to the Outbox instead.
const OUTGOING_CHANNEL_DEPTH: usize = 1024;

/// What the rest of the engine needs from the replication transport.
#[cfg_attr(test, mockall::automock)]
pub trait Transport: Send + Sync {
    /// Attempt to hand `payload` off for publishing on `topic`. Returns
    /// [`EngineError::TransportUnavailable`] immediately if the outgoing
    /// channel is full or the transport task has shut down — callers
    /// should fall back to the Outbox rather than wait.
    fn try_publish(&self, topic: &str, payload: Vec<u8>) -> EngineResult<()>;
}

/// MQTT-backed transport. Owns a background task that holds the actual
/// `rumqttc` client and event loop; `MqttTransport` itself is just a
/// cheap, cloneable handle to it (the same handle-around-a-task shape
/// used by `AntiEntropyHandle` elsewhere in this engine).
#[derive(Clone)]
pub struct MqttTransport {
    outgoing_tx: mpsc::Sender<(String, Vec<u8>)>,
}

impl MqttTransport {
    /// Connect to `broker:port`, subscribe to `{topic_prefix}/events/#`,
    /// and spawn the background task that drains outgoing publishes and
    /// pumps the event loop. Incoming payloads (from any node, including
    /// ourselves — loop prevention happens in the Applicator) are sent to
    /// `incoming_tx`.
    pub async fn connect(
        broker: &str,
        port: u16,
        client_id: &str,
        topic_prefix: &str,
        incoming_tx: mpsc::Sender<Vec<u8>>,
    ) -> EngineResult<Self> {
        let mut mqtt_options = MqttOptions::new(client_id, broker, port);
        mqtt_options.set_keep_alive(Duration::from_secs(30));

        let (client, mut eventloop) = AsyncClient::new(mqtt_options, 10);

        let subscribe_topic = format!("{topic_prefix}/events/#");
        client
            .subscribe(&subscribe_topic, QoS::AtLeastOnce)
            .await
            .map_err(|e| EngineError::TransportUnavailable(format!("subscribe failed: {e}")))?;

        let (outgoing_tx, mut outgoing_rx) = mpsc::channel::<(String, Vec<u8>)>(OUTGOING_CHANNEL_DEPTH);

        let publish_client = client.clone();
        tokio::spawn(async move {
            while let Some((topic, payload)) = outgoing_rx.recv().await {
                if let Err(e) = publish_client.publish(&topic, QoS::AtLeastOnce, false, payload).await {
                    error!("mqtt publish failed for topic {topic}: {e}");
                }
            }
        });

        tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        if incoming_tx.send(publish.payload.to_vec()).await.is_err() {
                            warn!("incoming replication channel closed, stopping mqtt event loop");
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!("mqtt eventloop error: {e}, reconnecting in 5s");
                        tokio::time::sleep(Duration::from_secs(5)).await;
                    }
                }
            }
        });

        info!("connected to mqtt broker {broker}:{port} as {client_id}");
        Ok(Self { outgoing_tx })
    }

    #[cfg(test)]
    fn from_channel(outgoing_tx: mpsc::Sender<(String, Vec<u8>)>) -> Self {
        Self { outgoing_tx }
    }
}

impl Transport for MqttTransport {
    fn try_publish(&self, topic: &str, payload: Vec<u8>) -> EngineResult<()> {
        self.outgoing_tx
            .try_send((topic.to_string(), payload))
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => {
                    EngineError::TransportUnavailable("outgoing channel full".into())
                }
                mpsc::error::TrySendError::Closed(_) => {
                    EngineError::TransportUnavailable("transport task has shut down".into())
                }
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn try_publish_succeeds_while_channel_has_room() {
        let (tx, mut rx) = mpsc::channel(4);
        let transport = MqttTransport::from_channel(tx);
        transport.try_publish("prefix/events", b"payload".to_vec()).unwrap();
        let (topic, payload) = rx.recv().await.unwrap();
        assert_eq!(topic, "prefix/events");
        assert_eq!(payload, b"payload");
    }

    #[tokio::test]
    async fn try_publish_reports_unavailable_when_channel_is_full() {
        let (tx, _rx) = mpsc::channel(1);
        let transport = MqttTransport::from_channel(tx);
        transport.try_publish("t", b"a".to_vec()).unwrap();
        let err = transport.try_publish("t", b"b".to_vec()).unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::Internal);
    }

    #[tokio::test]
    async fn try_publish_reports_unavailable_once_receiver_dropped() {
        let (tx, rx) = mpsc::channel(4);
        drop(rx);
        let transport = MqttTransport::from_channel(tx);
        let err = transport.try_publish("t", b"a".to_vec()).unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::Internal);
    }
}
