//! In-memory store serving both the gateway and the change feed.
//!
//! Used by integration and race tests. Every committed change is fanned out
//! to all live subscriptions, unfiltered by owner, the same way the hosted
//! store broadcasts table changes. Fault hooks let tests fail calls, drop
//! echoes, or hold echoes back to force a particular interleaving.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::feed::{ChangeFeed, ChangeKind, FeedError, FeedSubscription, FeedTopic, RawChange};
use crate::gateway::{GatewayError, GatewayErrorClass, MutationGateway};
use crate::record::{Draft, OwnerId, Record, RecordId};

/// Per-subscription channel capacity.
pub const SUBSCRIPTION_BUFFER: usize = 1000;

#[derive(Debug)]
struct Subscriber {
    table: String,
    events: mpsc::Sender<RawChange>,
}

#[derive(Debug, Default)]
struct Faults {
    fail_fetch: Option<String>,
    fail_create: Option<String>,
    fail_delete: Option<String>,
    drop_echoes: bool,
    hold_echoes: bool,
}

#[derive(Debug)]
struct StoreState {
    table: String,
    rows: Vec<Record>,
    next_id: i64,
    clock: DateTime<Utc>,
    subscribers: Vec<Subscriber>,
    held: VecDeque<RawChange>,
    faults: Faults,
}

impl StoreState {
    fn tick(&mut self) -> DateTime<Utc> {
        self.clock += Duration::seconds(1);
        self.clock
    }

    fn emit(&mut self, change: RawChange) {
        if self.faults.drop_echoes {
            debug!(?change.kind, "dropping echo");
            return;
        }
        if self.faults.hold_echoes {
            self.held.push_back(change);
            return;
        }
        self.fan_out(change);
    }

    fn fan_out(&mut self, change: RawChange) {
        let table = self.table.clone();
        self.subscribers.retain(|subscriber| {
            if subscriber.table != table {
                return true;
            }
            match subscriber.events.try_send(change.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!("subscription channel full - consumer too slow");
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
    }
}

/// Shared in-memory row store with change fanout.
#[derive(Debug)]
pub struct InMemoryStore {
    state: Mutex<StoreState>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::with_table(crate::feed::DEFAULT_TABLE)
    }

    #[must_use]
    pub fn with_table(table: &str) -> Self {
        let clock = Utc
            .with_ymd_and_hms(2026, 1, 1, 0, 0, 0)
            .single()
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
        Self {
            state: Mutex::new(StoreState {
                table: table.to_string(),
                rows: Vec::new(),
                next_id: 1,
                clock,
                subscribers: Vec::new(),
                held: VecDeque::new(),
                faults: Faults::default(),
            }),
        }
    }

    /// Identity the next create will be assigned.
    #[must_use]
    pub fn peek_next_id(&self) -> RecordId {
        RecordId(self.lock().next_id)
    }

    /// Commits a row directly, as another client would, and broadcasts it.
    pub fn insert_external(&self, owner: &OwnerId, title: &str, url: &str) -> Record {
        let mut state = self.lock();
        let record = commit(&mut state, owner, title, url);
        let change = row_change(ChangeKind::Insert, &record);
        state.emit(change);
        record
    }

    /// Edits a row in place and broadcasts the update.
    pub fn update_external(&self, id: RecordId, title: &str, url: &str) -> Option<Record> {
        let mut state = self.lock();
        let row = state.rows.iter_mut().find(|row| row.id == id)?;
        title.clone_into(&mut row.title);
        url.clone_into(&mut row.url);
        let record = row.clone();
        let change = row_change(ChangeKind::Update, &record);
        state.emit(change);
        Some(record)
    }

    /// Deletes a row directly and broadcasts the delete.
    pub fn delete_external(&self, id: RecordId) -> bool {
        let mut state = self.lock();
        let removed = remove(&mut state, id);
        if removed {
            state.emit(delete_change(id));
        }
        removed
    }

    /// Broadcasts an arbitrary payload, bypassing the rows.
    pub fn publish_raw(&self, change: RawChange) {
        self.lock().fan_out(change);
    }

    /// Rows currently committed for `owner`, in commit order.
    #[must_use]
    pub fn rows_for(&self, owner: &OwnerId) -> Vec<Record> {
        self.lock()
            .rows
            .iter()
            .filter(|row| &row.owner == owner)
            .cloned()
            .collect()
    }

    /// Number of live subscriptions.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        let mut state = self.lock();
        state
            .subscribers
            .retain(|subscriber| !subscriber.events.is_closed());
        state.subscribers.len()
    }

    pub fn fail_next_fetch(&self, message: &str) {
        self.lock().faults.fail_fetch = Some(message.to_string());
    }

    pub fn fail_next_create(&self, message: &str) {
        self.lock().faults.fail_create = Some(message.to_string());
    }

    pub fn fail_next_delete(&self, message: &str) {
        self.lock().faults.fail_delete = Some(message.to_string());
    }

    /// Commit changes without broadcasting them.
    pub fn set_drop_echoes(&self, drop_echoes: bool) {
        self.lock().faults.drop_echoes = drop_echoes;
    }

    /// Queue broadcasts until [`InMemoryStore::release_echoes`].
    pub fn hold_echoes(&self) {
        self.lock().faults.hold_echoes = true;
    }

    /// Broadcasts queued changes and stops holding. Returns how many were sent.
    pub fn release_echoes(&self) -> usize {
        let mut state = self.lock();
        state.faults.hold_echoes = false;
        let held = std::mem::take(&mut state.held);
        let released = held.len();
        for change in held {
            state.fan_out(change);
        }
        released
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[async_trait]
impl MutationGateway for InMemoryStore {
    async fn fetch_records(&self, owner: &OwnerId) -> Result<Vec<Record>, GatewayError> {
        let mut state = self.lock();
        if let Some(message) = state.faults.fail_fetch.take() {
            return Err(GatewayError::transport(message));
        }
        let mut rows = state
            .rows
            .iter()
            .filter(|row| &row.owner == owner)
            .cloned()
            .collect::<Vec<_>>();
        rows.reverse();
        Ok(rows)
    }

    async fn create(&self, owner: &OwnerId, draft: &Draft) -> Result<Record, GatewayError> {
        let mut state = self.lock();
        if let Some(message) = state.faults.fail_create.take() {
            return Err(GatewayError::new(GatewayErrorClass::Validation, message));
        }
        let record = commit(&mut state, owner, draft.title(), draft.url());
        let change = row_change(ChangeKind::Insert, &record);
        state.emit(change);
        Ok(record)
    }

    async fn delete(&self, id: RecordId) -> Result<(), GatewayError> {
        let mut state = self.lock();
        if let Some(message) = state.faults.fail_delete.take() {
            return Err(GatewayError::transport(message));
        }
        if !remove(&mut state, id) {
            return Err(GatewayError::new(
                GatewayErrorClass::NotFound,
                format!("row {id} does not exist"),
            ));
        }
        state.emit(delete_change(id));
        Ok(())
    }
}

#[async_trait]
impl ChangeFeed for InMemoryStore {
    async fn subscribe(&self, topic: &FeedTopic) -> Result<FeedSubscription, FeedError> {
        let (events, receiver) = mpsc::channel(SUBSCRIPTION_BUFFER);
        self.lock().subscribers.push(Subscriber {
            table: topic.table.clone(),
            events,
        });
        debug!(topic = %topic.name, "subscribed to in-memory feed");
        Ok(FeedSubscription::new(topic.clone(), receiver, None))
    }
}

fn commit(state: &mut StoreState, owner: &OwnerId, title: &str, url: &str) -> Record {
    let id = RecordId(state.next_id);
    state.next_id += 1;
    let record = Record {
        id,
        title: title.to_string(),
        url: url.to_string(),
        owner: owner.clone(),
        created_at: Some(state.tick()),
    };
    state.rows.push(record.clone());
    record
}

fn remove(state: &mut StoreState, id: RecordId) -> bool {
    let before = state.rows.len();
    state.rows.retain(|row| row.id != id);
    state.rows.len() != before
}

fn row_change(kind: ChangeKind, record: &Record) -> RawChange {
    RawChange {
        kind,
        new: serde_json::to_value(record).ok(),
        old: Some(json!({ "id": record.id })),
    }
}

fn delete_change(id: RecordId) -> RawChange {
    RawChange {
        kind: ChangeKind::Delete,
        new: None,
        old: Some(json!({ "id": id })),
    }
}

#[cfg(test)]
mod tests {
    use super::InMemoryStore;
    use crate::feed::{ChangeFeed, ChangeKind, FeedTopic};
    use crate::gateway::{GatewayErrorClass, MutationGateway};
    use crate::record::{Draft, OwnerId, RecordId};

    #[tokio::test]
    async fn create_assigns_increasing_ids_and_echoes() {
        let store = InMemoryStore::new();
        let mut subscription = store
            .subscribe(&FeedTopic::default())
            .await
            .expect("subscribe should succeed");
        let owner = OwnerId::new("user-a");

        let first = store
            .create(&owner, &Draft::new("A", "https://a.example").expect("draft"))
            .await
            .expect("create should succeed");
        let second = store
            .create(&owner, &Draft::new("B", "https://b.example").expect("draft"))
            .await
            .expect("create should succeed");
        assert!(second.id > first.id);
        assert!(second.created_at > first.created_at);

        let echo = subscription.recv().await.expect("echo expected");
        assert_eq!(echo.kind, ChangeKind::Insert);

        let fetched = store.fetch_records(&owner).await.expect("fetch should succeed");
        assert_eq!(
            fetched.iter().map(|row| row.id).collect::<Vec<_>>(),
            vec![second.id, first.id]
        );
    }

    #[tokio::test]
    async fn delete_of_missing_row_reports_not_found() {
        let store = InMemoryStore::new();
        let error = store
            .delete(RecordId(42))
            .await
            .expect_err("missing row should fail");
        assert_eq!(error.class, GatewayErrorClass::NotFound);
    }

    #[tokio::test]
    async fn dropped_subscription_is_pruned() {
        let store = InMemoryStore::new();
        let subscription = store
            .subscribe(&FeedTopic::default())
            .await
            .expect("subscribe should succeed");
        assert_eq!(store.subscriber_count(), 1);
        subscription.unsubscribe();
        assert_eq!(store.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn held_echoes_are_released_in_order() {
        let store = InMemoryStore::new();
        let mut subscription = store
            .subscribe(&FeedTopic::default())
            .await
            .expect("subscribe should succeed");
        let owner = OwnerId::new("user-a");
        store.hold_echoes();
        let created = store.insert_external(&owner, "A", "https://a.example");
        store.delete_external(created.id);
        assert_eq!(store.release_echoes(), 2);

        let first = subscription.recv().await.expect("insert echo");
        let second = subscription.recv().await.expect("delete echo");
        assert_eq!(first.kind, ChangeKind::Insert);
        assert_eq!(second.kind, ChangeKind::Delete);
    }
}
