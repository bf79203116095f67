//! Change feed contract: topic subscription and change decoding.

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::record::{Record, RecordId};

pub const DEFAULT_TOPIC_NAME: &str = "realtime bookmarks";
pub const DEFAULT_SCHEMA: &str = "public";
pub const DEFAULT_TABLE: &str = "bookmarks";

/// Named topic covering every row of one table, unfiltered by owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedTopic {
    pub name: String,
    pub schema: String,
    pub table: String,
}

impl Default for FeedTopic {
    fn default() -> Self {
        Self {
            name: DEFAULT_TOPIC_NAME.to_string(),
            schema: DEFAULT_SCHEMA.to_string(),
            table: DEFAULT_TABLE.to_string(),
        }
    }
}

/// Row-level change kind reported by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl ChangeKind {
    /// Parses the store's event type label (`INSERT`, `UPDATE`, `DELETE`).
    #[must_use]
    pub fn parse(label: &str) -> Option<Self> {
        match label.trim().to_ascii_uppercase().as_str() {
            "INSERT" => Some(Self::Insert),
            "UPDATE" => Some(Self::Update),
            "DELETE" => Some(Self::Delete),
            _ => None,
        }
    }
}

/// Change payload as delivered, before identity is checked.
#[derive(Debug, Clone, PartialEq)]
pub struct RawChange {
    pub kind: ChangeKind,
    pub new: Option<Value>,
    pub old: Option<Value>,
}

/// Decoded change keyed by record identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    Insert(Record),
    Update(Record),
    Delete(RecordId),
}

impl Change {
    #[must_use]
    pub fn id(&self) -> RecordId {
        match self {
            Self::Insert(record) | Self::Update(record) => record.id,
            Self::Delete(id) => *id,
        }
    }
}

/// Feed payload that cannot be merged. Dropped, never fatal.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MalformedEvent {
    #[error("{kind:?} change is missing the row payload")]
    MissingRow { kind: ChangeKind },
    #[error("{kind:?} change is missing the row identity")]
    MissingIdentity { kind: ChangeKind },
    #[error("{kind:?} change row could not be decoded: {reason}")]
    UndecodableRow { kind: ChangeKind, reason: String },
}

/// Converts a raw feed payload into a merge-ready change.
pub fn decode_change(raw: RawChange) -> Result<Change, MalformedEvent> {
    let kind = raw.kind;
    match kind {
        ChangeKind::Insert | ChangeKind::Update => {
            let row = raw.new.ok_or(MalformedEvent::MissingRow { kind })?;
            if row_identity(&row).is_none() {
                return Err(MalformedEvent::MissingIdentity { kind });
            }
            let record = serde_json::from_value::<Record>(row).map_err(|error| {
                MalformedEvent::UndecodableRow {
                    kind,
                    reason: error.to_string(),
                }
            })?;
            Ok(if kind == ChangeKind::Insert {
                Change::Insert(record)
            } else {
                Change::Update(record)
            })
        }
        ChangeKind::Delete => raw
            .old
            .as_ref()
            .and_then(row_identity)
            .or_else(|| raw.new.as_ref().and_then(row_identity))
            .map(Change::Delete)
            .ok_or(MalformedEvent::MissingIdentity { kind }),
    }
}

fn row_identity(row: &Value) -> Option<RecordId> {
    row.get("id").and_then(Value::as_i64).map(RecordId)
}

/// Feed client error type.
#[derive(Debug, Error)]
pub enum FeedError {
    #[error("invalid feed URL: {0}")]
    InvalidUrl(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("timeout error: {0}")]
    Timeout(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("join rejected: {0}")]
    Rejected(String),

    #[error("feed closed")]
    Closed,
}

/// Live subscription to one topic.
///
/// Dropping the subscription (or calling [`FeedSubscription::unsubscribe`])
/// releases the underlying resource.
pub struct FeedSubscription {
    topic: FeedTopic,
    events: mpsc::Receiver<RawChange>,
    shutdown: Option<oneshot::Sender<()>>,
}

impl FeedSubscription {
    #[must_use]
    pub fn new(
        topic: FeedTopic,
        events: mpsc::Receiver<RawChange>,
        shutdown: Option<oneshot::Sender<()>>,
    ) -> Self {
        Self {
            topic,
            events,
            shutdown,
        }
    }

    #[must_use]
    pub fn topic(&self) -> &FeedTopic {
        &self.topic
    }

    /// Next change, or `None` once the feed has closed.
    pub async fn recv(&mut self) -> Option<RawChange> {
        self.events.recv().await
    }

    /// Tears the subscription down.
    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        self.events.close();
    }
}

impl Drop for FeedSubscription {
    fn drop(&mut self) {
        self.release();
    }
}

/// Source of change notifications for a topic.
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    async fn subscribe(&self, topic: &FeedTopic) -> Result<FeedSubscription, FeedError>;
}
