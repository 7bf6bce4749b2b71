//! MQTT bus transport.
//!
//! Maps the mailbox/stream model of [`BusClient`] onto MQTT topics:
//!
//! | Delivery | Topic |
//! |----------|-------|
//! | mailbox  | `gpiowatch/mailbox/<address>/<subject>` |
//! | stream   | `gpiowatch/stream/<stream>/<subject>` |
//!
//! Payloads are JSON envelopes carrying the sender, the subject and the frames.
//! Stream subject patterns are regexes applied on receipt, since MQTT
//! wildcards cannot express them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use gpiowatch_core::bus::{BusClient, BusError, BusMessage, Delivery, Result};
use parking_lot::Mutex;
use regex::Regex;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

/// Endpoint scheme handled by this transport.
pub const SCHEME: &str = "mqtt://";
const DEFAULT_PORT: u16 = 1883;
const TOPIC_ROOT: &str = "gpiowatch";
const KEEP_ALIVE: Duration = Duration::from_secs(30);
const REQUEST_CAPACITY: usize = 64;
const MAX_POLL_ERRORS: u32 = 5;

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    sender: String,
    subject: String,
    frames: Vec<String>,
}

/// Split `mqtt://host[:port]` into host and port.
pub fn parse_endpoint(endpoint: &str) -> Result<(String, u16)> {
    let rest = endpoint
        .strip_prefix(SCHEME)
        .ok_or_else(|| BusError::InvalidEndpoint(endpoint.to_string()))?;
    let rest = rest.trim_end_matches('/');
    let (host, port) = match rest.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .parse()
                .map_err(|_| BusError::InvalidEndpoint(endpoint.to_string()))?;
            (host, port)
        }
        None => (rest, DEFAULT_PORT),
    };
    if host.is_empty() {
        return Err(BusError::InvalidEndpoint(endpoint.to_string()));
    }
    Ok((host.to_string(), port))
}

/// Topic segments may not carry MQTT wildcards or separators.
fn segment(value: &str) -> String {
    value.replace(['/', '+', '#'], "_")
}

fn mailbox_topic(address: &str, subject: &str) -> String {
    format!("{}/mailbox/{}/{}", TOPIC_ROOT, segment(address), segment(subject))
}

fn stream_topic(stream: &str, subject: &str) -> String {
    format!("{}/stream/{}/{}", TOPIC_ROOT, segment(stream), segment(subject))
}

struct Consumer {
    stream: String,
    pattern: Regex,
}

/// Turn an incoming publish into a bus message, applying stream filters.
fn route(topic: &str, payload: &[u8], consumers: &[Consumer]) -> Option<BusMessage> {
    let mut parts = topic.splitn(4, '/');
    if parts.next() != Some(TOPIC_ROOT) {
        return None;
    }
    let kind = parts.next()?;
    let name = parts.next()?;

    let envelope: Envelope = match serde_json::from_slice(payload) {
        Ok(envelope) => envelope,
        Err(e) => {
            tracing::debug!(topic, "Dropping undecodable MQTT payload: {}", e);
            return None;
        }
    };

    let delivery = match kind {
        "mailbox" => Delivery::Mailbox,
        "stream" => {
            let wanted = consumers.iter().any(|c| {
                segment(&c.stream) == name && c.pattern.is_match(&envelope.subject)
            });
            if !wanted {
                return None;
            }
            consumers
                .iter()
                .find(|c| segment(&c.stream) == name)
                .map(|c| Delivery::Stream(c.stream.clone()))?
        }
        _ => return None,
    };

    Some(BusMessage {
        sender: envelope.sender,
        subject: envelope.subject,
        delivery,
        frames: envelope.frames,
    })
}

struct Session {
    client: AsyncClient,
    address: String,
}

/// [`BusClient`] over an MQTT broker.
pub struct MqttBus {
    session: Mutex<Option<Session>>,
    producer: Mutex<Option<String>>,
    consumers: Arc<Mutex<Vec<Consumer>>>,
    inbox: tokio::sync::Mutex<Option<mpsc::UnboundedReceiver<BusMessage>>>,
    running: Arc<AtomicBool>,
}

impl Default for MqttBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MqttBus {
    pub fn new() -> Self {
        Self {
            session: Mutex::new(None),
            producer: Mutex::new(None),
            consumers: Arc::new(Mutex::new(Vec::new())),
            inbox: tokio::sync::Mutex::new(None),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    fn session(&self) -> Result<(AsyncClient, String)> {
        self.session
            .lock()
            .as_ref()
            .map(|s| (s.client.clone(), s.address.clone()))
            .ok_or(BusError::NotConnected)
    }

    async fn publish_envelope(
        client: &AsyncClient,
        topic: String,
        envelope: &Envelope,
        timeout: Duration,
    ) -> Result<()> {
        let payload = serde_json::to_vec(envelope).map_err(|e| BusError::Codec(e.to_string()))?;
        tokio::time::timeout(
            timeout,
            client.publish(topic, QoS::AtLeastOnce, false, payload),
        )
        .await
        .map_err(|_| BusError::Timeout(timeout))?
        .map_err(|e| BusError::SendFailed(e.to_string()))
    }

    fn spawn_event_loop(
        &self,
        mut eventloop: rumqttc::EventLoop,
        tx: mpsc::UnboundedSender<BusMessage>,
        connected: oneshot::Sender<()>,
        endpoint: String,
    ) {
        let running = self.running.clone();
        let consumers = self.consumers.clone();

        tokio::spawn(async move {
            let mut connected = Some(connected);
            let mut error_count = 0;

            while running.load(Ordering::Relaxed) {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        error_count = 0;
                        if let Some(signal) = connected.take() {
                            let _ = signal.send(());
                        }
                        tracing::debug!(endpoint = %endpoint, "MQTT connected");
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        let routed = route(&publish.topic, &publish.payload, &consumers.lock());
                        if let Some(message) = routed {
                            if tx.send(message).is_err() {
                                break;
                            }
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        // Still waiting for the first ConnAck: connect() owns the timeout.
                        if connected.is_some() {
                            tokio::time::sleep(Duration::from_millis(200)).await;
                            continue;
                        }
                        error_count += 1;
                        if error_count >= MAX_POLL_ERRORS {
                            tracing::error!(
                                "MQTT broker {} error count reached {}, stopping: {}",
                                endpoint,
                                MAX_POLL_ERRORS,
                                e
                            );
                            break;
                        }
                        tracing::warn!(
                            "MQTT broker {} error ({}/{}): {}",
                            endpoint,
                            error_count,
                            MAX_POLL_ERRORS,
                            e
                        );
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
            tracing::info!("MQTT connection to {} closed", endpoint);
        });
    }
}

impl Drop for MqttBus {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
    }
}

#[async_trait]
impl BusClient for MqttBus {
    async fn connect(&self, endpoint: &str, address: &str, timeout: Duration) -> Result<()> {
        let (host, port) = parse_endpoint(endpoint)?;
        if self.session.lock().is_some() {
            return Err(BusError::AddressInUse(address.to_string()));
        }

        let client_id = format!("gpiowatch-{}-{}", segment(address), Uuid::new_v4().simple());
        let mut options = MqttOptions::new(client_id, host, port);
        options.set_keep_alive(KEEP_ALIVE);
        let (client, eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);

        let (tx, rx) = mpsc::unbounded_channel();
        let (connected_tx, connected_rx) = oneshot::channel();
        self.running.store(true, Ordering::Relaxed);
        self.spawn_event_loop(eventloop, tx, connected_tx, endpoint.to_string());

        let mailbox = format!("{}/mailbox/{}/#", TOPIC_ROOT, segment(address));
        let handshake = async {
            client
                .subscribe(mailbox, QoS::AtLeastOnce)
                .await
                .map_err(|e| BusError::SendFailed(e.to_string()))?;
            connected_rx
                .await
                .map_err(|_| BusError::SendFailed("event loop ended".to_string()))
        };
        match tokio::time::timeout(timeout, handshake).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                self.running.store(false, Ordering::Relaxed);
                return Err(e);
            }
            Err(_) => {
                self.running.store(false, Ordering::Relaxed);
                return Err(BusError::Timeout(timeout));
            }
        }

        *self.inbox.lock().await = Some(rx);
        *self.session.lock() = Some(Session {
            client,
            address: address.to_string(),
        });
        tracing::info!(endpoint, address, "Connected to MQTT broker");
        Ok(())
    }

    async fn set_producer(&self, stream: &str) -> Result<()> {
        self.session()?;
        *self.producer.lock() = Some(stream.to_string());
        Ok(())
    }

    async fn set_consumer(&self, stream: &str, pattern: &str) -> Result<()> {
        let (client, _) = self.session()?;
        let compiled = Regex::new(pattern).map_err(|e| BusError::InvalidPattern {
            pattern: pattern.to_string(),
            reason: e.to_string(),
        })?;
        self.consumers.lock().push(Consumer {
            stream: stream.to_string(),
            pattern: compiled,
        });
        let topic = format!("{}/stream/{}/#", TOPIC_ROOT, segment(stream));
        client
            .subscribe(topic, QoS::AtLeastOnce)
            .await
            .map_err(|e| BusError::SendFailed(e.to_string()))
    }

    async fn publish(&self, subject: &str, frames: Vec<String>) -> Result<()> {
        let (client, sender) = self.session()?;
        let stream = self.producer.lock().clone().ok_or(BusError::NoProducer)?;
        let envelope = Envelope {
            sender,
            subject: subject.to_string(),
            frames,
        };
        Self::publish_envelope(
            &client,
            stream_topic(&stream, subject),
            &envelope,
            gpiowatch_core::config::timeouts::REQUEST,
        )
        .await
    }

    async fn send_to(
        &self,
        address: &str,
        subject: &str,
        frames: Vec<String>,
        timeout: Duration,
    ) -> Result<()> {
        let (client, sender) = self.session()?;
        let envelope = Envelope {
            sender,
            subject: subject.to_string(),
            frames,
        };
        Self::publish_envelope(&client, mailbox_topic(address, subject), &envelope, timeout).await
    }

    async fn recv(&self) -> Option<BusMessage> {
        let mut inbox = self.inbox.lock().await;
        if let Some(rx) = inbox.as_mut() {
            return rx.recv().await;
        }
        drop(inbox);
        std::future::pending().await
    }

    fn address(&self) -> Option<String> {
        self.session.lock().as_ref().map(|s| s.address.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(sender: &str, subject: &str, frames: &[&str]) -> Vec<u8> {
        serde_json::to_vec(&Envelope {
            sender: sender.into(),
            subject: subject.into(),
            frames: frames.iter().map(|s| s.to_string()).collect(),
        })
        .unwrap()
    }

    #[test]
    fn test_parse_endpoint() {
        assert_eq!(
            parse_endpoint("mqtt://broker.local:1884").unwrap(),
            ("broker.local".to_string(), 1884)
        );
        assert_eq!(
            parse_endpoint("mqtt://127.0.0.1").unwrap(),
            ("127.0.0.1".to_string(), DEFAULT_PORT)
        );
        assert!(parse_endpoint("memory://x").is_err());
        assert!(parse_endpoint("mqtt://host:port").is_err());
        assert!(parse_endpoint("mqtt://").is_err());
    }

    #[test]
    fn test_topics() {
        assert_eq!(
            mailbox_topic("gpio-sensor-agent", "GPOSTATE"),
            "gpiowatch/mailbox/gpio-sensor-agent/GPOSTATE"
        );
        assert_eq!(stream_topic("ASSETS", "a/b#"), "gpiowatch/stream/ASSETS/a_b_");
    }

    #[test]
    fn test_route_mailbox() {
        let message = route(
            "gpiowatch/mailbox/agent/ASSETS",
            &payload("asset-agent", "ASSETS", &["id", "OK"]),
            &[],
        )
        .unwrap();
        assert!(message.is_mailbox());
        assert_eq!(message.sender, "asset-agent");
        assert_eq!(message.frames, vec!["id", "OK"]);

        assert!(route("gpiowatch/mailbox/agent/X", b"not json", &[]).is_none());
        assert!(route("other/mailbox/agent/X", &payload("a", "X", &[]), &[]).is_none());
    }

    #[test]
    fn test_route_stream_filters_subjects() {
        let consumers = vec![Consumer {
            stream: "ASSETS".into(),
            pattern: Regex::new("^sensor").unwrap(),
        }];
        let message = route(
            "gpiowatch/stream/ASSETS/sensor-1",
            &payload("asset-agent", "sensor-1", &[]),
            &consumers,
        )
        .unwrap();
        assert_eq!(message.delivery, Delivery::Stream("ASSETS".into()));

        assert!(route(
            "gpiowatch/stream/ASSETS/rack-1",
            &payload("asset-agent", "rack-1", &[]),
            &consumers,
        )
        .is_none());
        assert!(route(
            "gpiowatch/stream/METRICS/sensor-1",
            &payload("x", "sensor-1", &[]),
            &consumers,
        )
        .is_none());
    }

    #[tokio::test]
    async fn test_operations_require_connection() {
        let bus = MqttBus::new();
        assert!(bus.address().is_none());
        assert!(matches!(
            bus.set_producer("X").await,
            Err(BusError::NotConnected)
        ));
        assert!(matches!(
            bus.send_to("a", "b", vec![], Duration::from_millis(10)).await,
            Err(BusError::NotConnected)
        ));
        assert!(matches!(
            bus.connect("tcp://x", "a", Duration::from_millis(10)).await,
            Err(BusError::InvalidEndpoint(_))
        ));
    }
}
