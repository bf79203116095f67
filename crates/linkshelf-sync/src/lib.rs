//! Local mirror synchronization engine for a hosted bookmark store.
//!
//! This crate exposes:
//! - the ordered, de-duplicated [`LocalMirror`] and its idempotent [`merge`]
//! - [`SessionController`] for sign-in, sign-out and session swaps
//! - store adapters: [`RestGateway`] (row API) and [`RealtimeFeed`] (change feed)
//! - [`InMemoryStore`] serving both contracts for tests and local runs

pub mod config;
pub mod error;
pub mod feed;
pub mod gateway;
pub mod memory;
pub mod merge;
pub mod mirror;
pub mod realtime;
pub mod record;
pub mod rest;
pub mod session;

pub use config::{ConfigError, StoreConfig};
pub use error::{MirrorError, SessionError};
pub use feed::{
    Change, ChangeFeed, ChangeKind, FeedError, FeedSubscription, FeedTopic, MalformedEvent,
    RawChange, decode_change,
};
pub use gateway::{GatewayError, GatewayErrorClass, MutationGateway};
pub use memory::InMemoryStore;
pub use merge::{MergeOutcome, merge, seed};
pub use mirror::{DeleteOutcome, InsertOutcome, LocalMirror, MirrorSnapshot, SessionEpoch};
pub use realtime::RealtimeFeed;
pub use record::{Draft, DraftError, OwnerId, Record, RecordId};
pub use rest::RestGateway;
pub use session::SessionController;
