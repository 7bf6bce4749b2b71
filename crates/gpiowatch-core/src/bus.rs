//! Message bus for the gpiowatch agents.
//!
//! Agents talk to each other through a broker offering two delivery modes:
//! - **mailbox**: direct, addressed messages (request/reply exchanges)
//! - **stream**: publish/subscribe, filtered by a regex on the message subject
//!
//! [`BusClient`] is the seam every transport implements. [`MemoryBroker`] is the
//! in-process transport used by tests and `memory://` endpoints.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use regex::Regex;
use tokio::sync::mpsc;

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors raised by bus transports.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// The client has not been connected yet.
    #[error("Not connected")]
    NotConnected,

    /// The endpoint string cannot be used by this transport.
    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),

    /// The address is already taken by another client.
    #[error("Address already in use: {0}")]
    AddressInUse(String),

    /// No producer stream has been set on this client.
    #[error("No producer stream configured")]
    NoProducer,

    /// A subject pattern failed to compile.
    #[error("Invalid pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    /// The message could not be handed to the transport.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// The operation did not complete in time.
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// Wire encoding or decoding failed.
    #[error("Codec error: {0}")]
    Codec(String),
}

/// How a message reached its recipient.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// Sent directly to the recipient's address.
    Mailbox,
    /// Published on the named stream.
    Stream(String),
}

/// A multi-frame message received from the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    /// Address of the sending client.
    pub sender: String,
    /// Message subject.
    pub subject: String,
    /// Delivery mode.
    pub delivery: Delivery,
    /// Payload frames.
    pub frames: Vec<String>,
}

impl BusMessage {
    pub fn is_mailbox(&self) -> bool {
        self.delivery == Delivery::Mailbox
    }
}

/// A client attached to a message broker.
///
/// Every method takes `&self`; transports keep their mutable state behind
/// interior locks so a client can be shared between an actor and its helpers.
#[async_trait]
pub trait BusClient: Send + Sync {
    /// Attach to `endpoint` under the given mailbox `address`.
    async fn connect(&self, endpoint: &str, address: &str, timeout: Duration) -> Result<()>;

    /// Select the stream that [`BusClient::publish`] writes to.
    async fn set_producer(&self, stream: &str) -> Result<()>;

    /// Subscribe to messages on `stream` whose subject matches `pattern`.
    async fn set_consumer(&self, stream: &str, pattern: &str) -> Result<()>;

    /// Publish on the producer stream.
    async fn publish(&self, subject: &str, frames: Vec<String>) -> Result<()>;

    /// Send a mailbox message to `address`.
    async fn send_to(
        &self,
        address: &str,
        subject: &str,
        frames: Vec<String>,
        timeout: Duration,
    ) -> Result<()>;

    /// Wait for the next incoming message.
    ///
    /// Pends while the client is not connected. Returns `None` once the
    /// transport has shut down.
    async fn recv(&self) -> Option<BusMessage>;

    /// Mailbox address, once connected.
    fn address(&self) -> Option<String>;
}

struct Subscription {
    stream: String,
    pattern: Regex,
    address: String,
}

struct Mailbox {
    tx: mpsc::UnboundedSender<BusMessage>,
    /// Held until the owning client connects, so earlier messages queue up.
    rx: Option<mpsc::UnboundedReceiver<BusMessage>>,
}

impl Mailbox {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self { tx, rx: Some(rx) }
    }
}

#[derive(Default)]
struct BrokerState {
    mailboxes: HashMap<String, Mailbox>,
    subscriptions: Vec<Subscription>,
}

/// In-process message broker.
///
/// Cloning yields another handle to the same broker.
#[derive(Clone)]
pub struct MemoryBroker {
    name: String,
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    /// Create a broker reachable as `memory://<name>`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Arc::new(Mutex::new(BrokerState::default())),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Endpoint string clients pass to [`BusClient::connect`].
    pub fn endpoint(&self) -> String {
        format!("memory://{}", self.name)
    }

    /// Create an unconnected client for this broker.
    pub fn client(&self) -> MemoryBusClient {
        MemoryBusClient {
            broker: self.clone(),
            inner: Mutex::new(ClientState::default()),
            inbox: tokio::sync::Mutex::new(None),
        }
    }

    fn attach(&self, address: &str) -> Result<mpsc::UnboundedReceiver<BusMessage>> {
        let mut state = self.state.lock();
        let mailbox = state
            .mailboxes
            .entry(address.to_string())
            .or_insert_with(Mailbox::new);
        mailbox
            .rx
            .take()
            .ok_or_else(|| BusError::AddressInUse(address.to_string()))
    }

    fn deliver_mailbox(&self, address: &str, message: BusMessage) -> Result<()> {
        let mut state = self.state.lock();
        let mailbox = state
            .mailboxes
            .entry(address.to_string())
            .or_insert_with(Mailbox::new);
        mailbox
            .tx
            .send(message)
            .map_err(|_| BusError::SendFailed(format!("mailbox '{}' is closed", address)))
    }

    fn deliver_stream(&self, stream: &str, message: BusMessage) -> usize {
        let state = self.state.lock();
        let mut delivered = 0;
        for sub in state
            .subscriptions
            .iter()
            .filter(|s| s.stream == stream && s.pattern.is_match(&message.subject))
        {
            if let Some(mailbox) = state.mailboxes.get(&sub.address) {
                if mailbox.tx.send(message.clone()).is_ok() {
                    delivered += 1;
                }
            }
        }
        delivered
    }

    fn subscribe(&self, subscription: Subscription) {
        self.state.lock().subscriptions.push(subscription);
    }
}

#[derive(Default)]
struct ClientState {
    address: Option<String>,
    producer: Option<String>,
}

/// Client handle on a [`MemoryBroker`].
pub struct MemoryBusClient {
    broker: MemoryBroker,
    inner: Mutex<ClientState>,
    inbox: tokio::sync::Mutex<Option<mpsc::UnboundedReceiver<BusMessage>>>,
}

impl MemoryBusClient {
    fn connected_address(&self) -> Result<String> {
        self.inner.lock().address.clone().ok_or(BusError::NotConnected)
    }
}

#[async_trait]
impl BusClient for MemoryBusClient {
    async fn connect(&self, endpoint: &str, address: &str, _timeout: Duration) -> Result<()> {
        let expected = self.broker.endpoint();
        if endpoint != expected {
            return Err(BusError::InvalidEndpoint(format!(
                "{} (broker is {})",
                endpoint, expected
            )));
        }
        let rx = self.broker.attach(address)?;
        *self.inbox.lock().await = Some(rx);
        self.inner.lock().address = Some(address.to_string());
        Ok(())
    }

    async fn set_producer(&self, stream: &str) -> Result<()> {
        self.connected_address()?;
        self.inner.lock().producer = Some(stream.to_string());
        Ok(())
    }

    async fn set_consumer(&self, stream: &str, pattern: &str) -> Result<()> {
        let address = self.connected_address()?;
        let pattern = Regex::new(pattern).map_err(|e| BusError::InvalidPattern {
            pattern: pattern.to_string(),
            reason: e.to_string(),
        })?;
        self.broker.subscribe(Subscription {
            stream: stream.to_string(),
            pattern,
            address,
        });
        Ok(())
    }

    async fn publish(&self, subject: &str, frames: Vec<String>) -> Result<()> {
        let (sender, stream) = {
            let inner = self.inner.lock();
            let sender = inner.address.clone().ok_or(BusError::NotConnected)?;
            let stream = inner.producer.clone().ok_or(BusError::NoProducer)?;
            (sender, stream)
        };
        let message = BusMessage {
            sender,
            subject: subject.to_string(),
            delivery: Delivery::Stream(stream.clone()),
            frames,
        };
        let delivered = self.broker.deliver_stream(&stream, message);
        tracing::trace!(stream = %stream, subject, delivered, "published");
        Ok(())
    }

    async fn send_to(
        &self,
        address: &str,
        subject: &str,
        frames: Vec<String>,
        _timeout: Duration,
    ) -> Result<()> {
        let sender = self.connected_address()?;
        self.broker.deliver_mailbox(
            address,
            BusMessage {
                sender,
                subject: subject.to_string(),
                delivery: Delivery::Mailbox,
                frames,
            },
        )
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
        self.inner.lock().address.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_millis(500);

    async fn connected(broker: &MemoryBroker, address: &str) -> MemoryBusClient {
        let client = broker.client();
        client
            .connect(&broker.endpoint(), address, TIMEOUT)
            .await
            .unwrap();
        client
    }

    #[tokio::test]
    async fn test_mailbox_roundtrip() {
        let broker = MemoryBroker::new("test");
        let a = connected(&broker, "a").await;
        let b = connected(&broker, "b").await;

        a.send_to("b", "PING", vec!["hello".into()], TIMEOUT)
            .await
            .unwrap();
        let msg = b.recv().await.unwrap();
        assert_eq!(msg.sender, "a");
        assert_eq!(msg.subject, "PING");
        assert!(msg.is_mailbox());
        assert_eq!(msg.frames, vec!["hello".to_string()]);
    }

    #[tokio::test]
    async fn test_mailbox_queues_until_connect() {
        let broker = MemoryBroker::new("test");
        let a = connected(&broker, "a").await;
        a.send_to("late", "HELLO", vec![], TIMEOUT).await.unwrap();

        let late = connected(&broker, "late").await;
        let msg = late.recv().await.unwrap();
        assert_eq!(msg.subject, "HELLO");
    }

    #[tokio::test]
    async fn test_stream_pattern_filtering() {
        let broker = MemoryBroker::new("test");
        let producer = connected(&broker, "producer").await;
        producer.set_producer("ASSETS").await.unwrap();
        let consumer = connected(&broker, "consumer").await;
        consumer.set_consumer("ASSETS", "^sensor.*").await.unwrap();

        producer.publish("datacenter.x", vec![]).await.unwrap();
        producer.publish("sensor.door", vec!["1".into()]).await.unwrap();

        let msg = consumer.recv().await.unwrap();
        assert_eq!(msg.subject, "sensor.door");
        assert_eq!(msg.delivery, Delivery::Stream("ASSETS".into()));
    }

    #[tokio::test]
    async fn test_errors_before_connect() {
        let broker = MemoryBroker::new("test");
        let client = broker.client();
        assert!(matches!(
            client.set_producer("X").await,
            Err(BusError::NotConnected)
        ));
        assert!(client.address().is_none());

        let other = MemoryBroker::new("other");
        assert!(matches!(
            client.connect(&other.endpoint(), "a", TIMEOUT).await,
            Err(BusError::InvalidEndpoint(_))
        ));
    }

    #[tokio::test]
    async fn test_duplicate_address_rejected() {
        let broker = MemoryBroker::new("test");
        let _a = connected(&broker, "a").await;
        let dup = broker.client();
        assert!(matches!(
            dup.connect(&broker.endpoint(), "a", TIMEOUT).await,
            Err(BusError::AddressInUse(_))
        ));
    }

    #[tokio::test]
    async fn test_publish_requires_producer() {
        let broker = MemoryBroker::new("test");
        let a = connected(&broker, "a").await;
        assert!(matches!(
            a.publish("x", vec![]).await,
            Err(BusError::NoProducer)
        ));
    }
}
