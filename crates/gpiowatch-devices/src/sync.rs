//! Bulk asset discovery.
//!
//! At startup the agent asks the asset-management service for every GPIO
//! asset it knows, then fetches each one's description:
//!
//! ```text
//! -> ASSETS        ["GET", <uuid>, "gpo", "sensorgpio"]
//! <-               [<uuid>, "OK", <name>...] | [<uuid>, "ERROR", <reason>]
//! -> ASSET_DETAIL  ["GET", <uuid>, <name>]
//! <-               [<uuid>, "ASSET", <json>] | [<uuid>, "ERROR", <reason>]
//! ```
//!
//! Every request carries a fresh correlation id and waits a bounded time for
//! its reply. A failed list request aborts the run; a failed detail request
//! only skips that asset.

use std::time::Duration;

use gpiowatch_core::asset::subtype;
use gpiowatch_core::bus::BusError;
use gpiowatch_core::config::addresses;
use gpiowatch_core::{AssetMessage, BusClient, BusMessage};
use tokio::time::Instant;
use uuid::Uuid;

/// Request verb understood by the asset service.
const VERB_GET: &str = "GET";
const STATUS_OK: &str = "OK";
const STATUS_ERROR: &str = "ERROR";

/// Discovery errors.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("Correlation id mismatch: expected {expected}, got {received}")]
    CorrelationMismatch { expected: String, received: String },

    #[error("No reply within {0:?}")]
    Timeout(Duration),

    #[error("Asset service error: {0}")]
    RemoteError(String),

    #[error("Malformed reply: {0}")]
    Malformed(String),

    #[error("Bus disconnected")]
    Disconnected,

    #[error(transparent)]
    Bus(#[from] BusError),
}

pub type Result<T> = std::result::Result<T, SyncError>;

/// Progress of one discovery run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Idle,
    ListRequested,
    ListReceived,
    DetailRequested,
    DetailReceived,
    Done,
    Failed,
}

/// Receives the assets found by a discovery run.
pub trait AssetHandler: Send {
    fn handle_asset(&mut self, asset: AssetMessage);
}

impl AssetHandler for Vec<AssetMessage> {
    fn handle_asset(&mut self, asset: AssetMessage) {
        self.push(asset);
    }
}

/// Summary of a completed run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Names returned by the list request.
    pub listed: Vec<String>,
    /// Descriptions handed to the handler.
    pub applied: usize,
    /// Assets whose detail request failed.
    pub skipped: Vec<String>,
    /// Unrelated messages received while waiting for replies.
    pub deferred: usize,
}

/// Request/reply client for the asset service.
pub struct AssetSyncClient {
    asset_agent: String,
    timeout: Duration,
    phase: SyncPhase,
    deferred: Vec<BusMessage>,
}

impl AssetSyncClient {
    pub fn new(asset_agent: impl Into<String>, timeout: Duration) -> Self {
        Self {
            asset_agent: asset_agent.into(),
            timeout,
            phase: SyncPhase::Idle,
            deferred: Vec::new(),
        }
    }

    pub fn phase(&self) -> SyncPhase {
        self.phase
    }

    /// Messages that arrived during the last run and were not replies.
    pub fn take_deferred(&mut self) -> Vec<BusMessage> {
        std::mem::take(&mut self.deferred)
    }

    /// Run one discovery over `bus`, feeding every described asset to `handler`.
    pub async fn run(
        &mut self,
        bus: &dyn BusClient,
        handler: &mut dyn AssetHandler,
    ) -> Result<SyncReport> {
        self.phase = SyncPhase::Idle;
        match self.discover(bus, handler).await {
            Ok(mut report) => {
                report.deferred = self.deferred.len();
                self.transition(SyncPhase::Done);
                tracing::info!(
                    listed = report.listed.len(),
                    applied = report.applied,
                    skipped = report.skipped.len(),
                    "Asset discovery done"
                );
                Ok(report)
            }
            Err(e) => {
                self.transition(SyncPhase::Failed);
                tracing::error!("Asset discovery failed: {}", e);
                Err(e)
            }
        }
    }

    async fn discover(
        &mut self,
        bus: &dyn BusClient,
        handler: &mut dyn AssetHandler,
    ) -> Result<SyncReport> {
        let id = Uuid::new_v4().to_string();
        bus.send_to(
            &self.asset_agent,
            addresses::SUBJECT_ASSETS,
            vec![
                VERB_GET.to_string(),
                id.clone(),
                subtype::GPO.to_string(),
                subtype::SENSOR_GPIO.to_string(),
            ],
            self.timeout,
        )
        .await?;
        self.transition(SyncPhase::ListRequested);

        let reply = self.await_reply(bus).await?;
        let listed = parse_list_reply(&id, reply)?;
        self.transition(SyncPhase::ListReceived);
        tracing::debug!(count = listed.len(), "GPIO assets listed");

        let mut report = SyncReport {
            listed,
            ..Default::default()
        };
        for name in report.listed.clone() {
            match self.fetch_detail(bus, &name).await {
                Ok(asset) => {
                    tracing::debug!(asset = %name, "Processing asset");
                    handler.handle_asset(asset);
                    report.applied += 1;
                }
                Err(e) => {
                    tracing::warn!(asset = %name, "ASSET_DETAIL failed, skipping: {}", e);
                    report.skipped.push(name);
                }
            }
        }
        Ok(report)
    }

    async fn fetch_detail(&mut self, bus: &dyn BusClient, name: &str) -> Result<AssetMessage> {
        let id = Uuid::new_v4().to_string();
        bus.send_to(
            &self.asset_agent,
            addresses::SUBJECT_ASSET_DETAIL,
            vec![VERB_GET.to_string(), id.clone(), name.to_string()],
            self.timeout,
        )
        .await?;
        self.transition(SyncPhase::DetailRequested);

        let reply = self.await_reply(bus).await?;
        self.transition(SyncPhase::DetailReceived);
        parse_detail_reply(&id, reply)
    }

    /// Next mailbox message from the asset service. Anything else received
    /// meanwhile is kept for the caller.
    async fn await_reply(&mut self, bus: &dyn BusClient) -> Result<Vec<String>> {
        let deadline = Instant::now() + self.timeout;
        loop {
            let message = match tokio::time::timeout_at(deadline, bus.recv()).await {
                Ok(Some(message)) => message,
                Ok(None) => return Err(SyncError::Disconnected),
                Err(_) => return Err(SyncError::Timeout(self.timeout)),
            };
            if message.is_mailbox() && message.sender == self.asset_agent {
                return Ok(message.frames);
            }
            tracing::debug!(
                sender = %message.sender,
                subject = %message.subject,
                "Deferring message received during discovery"
            );
            self.deferred.push(message);
        }
    }

    fn transition(&mut self, next: SyncPhase) {
        tracing::debug!(from = ?self.phase, to = ?next, "Discovery phase");
        self.phase = next;
    }
}

impl Default for AssetSyncClient {
    fn default() -> Self {
        Self::new(
            addresses::ASSET_AGENT,
            gpiowatch_core::config::timeouts::REQUEST,
        )
    }
}

fn check_correlation(expected: &str, frames: &[String]) -> Result<()> {
    let received = frames
        .first()
        .ok_or_else(|| SyncError::Malformed("empty reply".to_string()))?;
    if received != expected {
        return Err(SyncError::CorrelationMismatch {
            expected: expected.to_string(),
            received: received.clone(),
        });
    }
    Ok(())
}

fn remote_reason(frames: &[String]) -> SyncError {
    SyncError::RemoteError(frames.get(2).cloned().unwrap_or_default())
}

/// Validate a list reply and return the asset names it carries.
pub fn parse_list_reply(expected: &str, mut frames: Vec<String>) -> Result<Vec<String>> {
    check_correlation(expected, &frames)?;
    let status = frames.get(1).cloned();
    match status.as_deref() {
        Some(STATUS_OK) => Ok(frames.split_off(2)),
        Some(STATUS_ERROR) => Err(remote_reason(&frames)),
        Some(other) => Err(SyncError::Malformed(format!("unknown status '{}'", other))),
        None => Err(SyncError::Malformed("missing status".to_string())),
    }
}

/// Validate a detail reply and decode the asset description it carries.
pub fn parse_detail_reply(expected: &str, frames: Vec<String>) -> Result<AssetMessage> {
    check_correlation(expected, &frames)?;
    let body = &frames[1..];
    if AssetMessage::is(body) {
        return AssetMessage::decode(body)
            .ok_or_else(|| SyncError::Malformed("undecodable asset description".to_string()));
    }
    match body.first().map(String::as_str) {
        Some(STATUS_ERROR) => Err(remote_reason(&frames)),
        _ => Err(SyncError::Malformed("not an asset description".to_string())),
    }
}
