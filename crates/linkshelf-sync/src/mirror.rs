//! Local mirror of the signed-in owner's bookmarks.
//!
//! The mirror reconciles two unsynchronized channels into one ordered,
//! de-duplicated view: outcomes of the caller's own mutations (returned by the
//! [`MutationGateway`]) and change notifications from the feed. Both paths go
//! through [`merge`], so the same logical mutation observed twice is applied
//! once regardless of which channel wins.
//!
//! Mutations are never applied speculatively. A row appears only after the
//! store confirms the create, and disappears only after it confirms the
//! delete.
//!
//! Every activation gets a fresh [`SessionEpoch`]. Gateway completions and
//! feed events that belong to an older epoch are discarded, so nothing from a
//! previous session is merged into the next one.
//!
//! Identities are never reused, so the mirror remembers every id deleted in
//! the current session. A late insert echo, or a create response that loses
//! the race against its own feed insert and delete, cannot bring the row back.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::MirrorError;
use crate::feed::{Change, RawChange, decode_change};
use crate::gateway::MutationGateway;
use crate::merge::{MergeOutcome, merge, seed};
use crate::record::{Draft, OwnerId, Record, RecordId};

/// Generation marker of one signed-in session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionEpoch(u64);

/// Read-only view handed to the presentation boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorSnapshot {
    pub records: Arc<[Record]>,
    pub owner: Option<OwnerId>,
    /// A confirmed-mutation round trip is in flight.
    pub busy: bool,
}

impl Default for MirrorSnapshot {
    fn default() -> Self {
        Self {
            records: Arc::from(Vec::new()),
            owner: None,
            busy: false,
        }
    }
}

impl MirrorSnapshot {
    #[must_use]
    pub fn ids(&self) -> Vec<RecordId> {
        self.records.iter().map(|record| record.id).collect()
    }
}

/// Result of a confirmed create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted(Record),
    /// The feed echo arrived first; the row was already shown.
    AlreadyPresent(Record),
    /// The feed reported the row deleted before the create returned.
    AlreadyDeleted(Record),
}

impl InsertOutcome {
    #[must_use]
    pub fn record(&self) -> &Record {
        match self {
            Self::Inserted(record) | Self::AlreadyPresent(record) | Self::AlreadyDeleted(record) => {
                record
            }
        }
    }
}

/// Result of a confirmed delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Removed,
    AlreadyAbsent,
}

#[derive(Debug, Default)]
struct MirrorState {
    rows: Vec<Record>,
    /// Ids deleted during this session.
    removed: HashSet<RecordId>,
    owner: Option<OwnerId>,
    epoch: u64,
    active: bool,
    in_flight: usize,
}

impl MirrorState {
    fn current(&self) -> Option<(SessionEpoch, OwnerId)> {
        if !self.active {
            return None;
        }
        self.owner
            .clone()
            .map(|owner| (SessionEpoch(self.epoch), owner))
    }

    fn is_current(&self, epoch: SessionEpoch) -> bool {
        self.active && self.epoch == epoch.0
    }

    /// Merges `change`, refusing to resurrect an id deleted this session.
    fn reconcile(&mut self, change: Change) -> MergeOutcome {
        match &change {
            Change::Insert(record) | Change::Update(record)
                if self.removed.contains(&record.id) =>
            {
                return MergeOutcome::Deleted;
            }
            Change::Delete(id) => {
                self.removed.insert(*id);
            }
            _ => {}
        }
        merge(&mut self.rows, change)
    }

    fn reset(&mut self) {
        self.rows.clear();
        self.removed.clear();
        self.in_flight = 0;
    }

    fn snapshot(&self) -> MirrorSnapshot {
        MirrorSnapshot {
            records: Arc::from(self.rows.clone()),
            owner: self.owner.clone(),
            busy: self.in_flight > 0,
        }
    }
}

/// Ordered, de-duplicated mirror of one owner's rows.
pub struct LocalMirror {
    gateway: Arc<dyn MutationGateway>,
    state: Mutex<MirrorState>,
    snapshots: watch::Sender<MirrorSnapshot>,
}

impl LocalMirror {
    #[must_use]
    pub fn new(gateway: Arc<dyn MutationGateway>) -> Self {
        let (snapshots, _) = watch::channel(MirrorSnapshot::default());
        Self {
            gateway,
            state: Mutex::new(MirrorState::default()),
            snapshots,
        }
    }

    /// Latest snapshot.
    #[must_use]
    pub fn snapshot(&self) -> MirrorSnapshot {
        self.snapshots.borrow().clone()
    }

    /// Receiver that observes a new snapshot after every change.
    #[must_use]
    pub fn watch(&self) -> watch::Receiver<MirrorSnapshot> {
        self.snapshots.subscribe()
    }

    /// Epoch of the attached session, if any.
    #[must_use]
    pub fn current_epoch(&self) -> Option<SessionEpoch> {
        self.lock().current().map(|(epoch, _)| epoch)
    }

    /// Attaches the mirror to `owner` with empty state and a fresh epoch.
    pub fn activate(&self, owner: OwnerId) -> SessionEpoch {
        let mut state = self.lock();
        state.epoch += 1;
        state.active = true;
        state.owner = Some(owner);
        state.reset();
        let epoch = SessionEpoch(state.epoch);
        self.publish(&state);
        epoch
    }

    /// Replaces the rows wholesale with an initial bulk fetch.
    ///
    /// Rows are ordered newest first; repeated identities, rows of other
    /// owners and rows already deleted this session are dropped. Returns the
    /// number of rows kept.
    pub fn load(&self, records: Vec<Record>) -> Result<usize, MirrorError> {
        let mut state = self.lock();
        let Some((_, owner)) = state.current() else {
            return Err(MirrorError::Inactive);
        };
        let fetched = records.len();
        let rows = seed(
            records
                .into_iter()
                .filter(|record| record.owner == owner && !state.removed.contains(&record.id))
                .collect(),
        );
        if rows.len() != fetched {
            debug!(
                fetched,
                kept = rows.len(),
                "dropped repeated or foreign rows from initial load"
            );
        }
        state.rows = rows;
        let kept = state.rows.len();
        self.publish(&state);
        Ok(kept)
    }

    /// Creates `draft` through the gateway and shows the committed row.
    ///
    /// The row is prepended only if the feed has not already delivered it,
    /// and never if the feed has already reported it deleted. On failure
    /// nothing is shown.
    pub async fn apply_optimistic_insert(
        &self,
        draft: &Draft,
    ) -> Result<InsertOutcome, MirrorError> {
        let (epoch, owner) = self.begin_mutation()?;
        let _in_flight = InFlight { mirror: self, epoch };

        let record = self.gateway.create(&owner, draft).await?;

        let mut state = self.lock();
        if !state.is_current(epoch) {
            debug!(id = %record.id, "session ended before create completed");
            return Err(MirrorError::SessionEnded);
        }
        let outcome = match state.reconcile(Change::Insert(record.clone())) {
            MergeOutcome::DuplicateSuppressed => {
                debug!(id = %record.id, "create confirmed after feed echo");
                InsertOutcome::AlreadyPresent(record)
            }
            MergeOutcome::Deleted => {
                debug!(id = %record.id, "create confirmed after the row was deleted");
                InsertOutcome::AlreadyDeleted(record)
            }
            _ => InsertOutcome::Inserted(record),
        };
        self.publish(&state);
        Ok(outcome)
    }

    /// Deletes `id` through the gateway and removes the row once confirmed.
    ///
    /// A store-side "not found" is treated as an idempotent success.
    pub async fn apply_optimistic_delete(&self, id: RecordId) -> Result<DeleteOutcome, MirrorError> {
        let (epoch, _) = self.begin_mutation()?;
        let _in_flight = InFlight { mirror: self, epoch };

        match self.gateway.delete(id).await {
            Ok(()) => {}
            Err(error) if error.is_not_found() => {
                debug!(%id, "store reported row already gone");
            }
            Err(error) => return Err(error.into()),
        }

        let mut state = self.lock();
        if !state.is_current(epoch) {
            debug!(%id, "session ended before delete completed");
            return Err(MirrorError::SessionEnded);
        }
        let outcome = match state.reconcile(Change::Delete(id)) {
            MergeOutcome::Removed => DeleteOutcome::Removed,
            _ => DeleteOutcome::AlreadyAbsent,
        };
        self.publish(&state);
        Ok(outcome)
    }

    /// Merges one feed notification delivered for `epoch`.
    ///
    /// Returns `None` when the event was dropped: stale epoch, detached
    /// mirror, malformed payload or an insert for another owner. An update
    /// that hands a shown row to another owner removes it.
    pub fn on_feed_event(&self, epoch: SessionEpoch, raw: RawChange) -> Option<MergeOutcome> {
        let change = match decode_change(raw) {
            Ok(change) => change,
            Err(error) => {
                warn!(%error, "dropping malformed feed event");
                return None;
            }
        };

        let mut state = self.lock();
        if !state.is_current(epoch) {
            debug!(id = %change.id(), "dropping feed event from a previous session");
            return None;
        }
        let id = change.id();
        let foreign = match &change {
            Change::Insert(record) | Change::Update(record) => {
                state.owner.as_ref() != Some(&record.owner)
            }
            Change::Delete(_) => false,
        };
        let outcome = match change {
            Change::Update(_) if foreign => {
                debug!(%id, "row moved to another owner");
                merge(&mut state.rows, Change::Delete(id))
            }
            Change::Insert(_) if foreign => {
                debug!(%id, "ignoring feed event for another owner");
                return None;
            }
            change => state.reconcile(change),
        };
        if outcome.changed() {
            self.publish(&state);
        } else {
            debug!(%id, ?outcome, "feed event left mirror unchanged");
        }
        Some(outcome)
    }

    /// Empties the rows and detaches from the session.
    pub fn clear(&self) {
        let mut state = self.lock();
        let dropped = state.rows.len();
        state.reset();
        state.owner = None;
        state.active = false;
        state.epoch += 1;
        self.publish(&state);
        info!(dropped, "mirror cleared");
    }

    fn begin_mutation(&self) -> Result<(SessionEpoch, OwnerId), MirrorError> {
        let mut state = self.lock();
        let current = state.current().ok_or(MirrorError::Inactive)?;
        state.in_flight += 1;
        self.publish(&state);
        Ok(current)
    }

    fn end_mutation(&self, epoch: SessionEpoch) {
        let mut state = self.lock();
        if state.is_current(epoch) {
            state.in_flight = state.in_flight.saturating_sub(1);
            self.publish(&state);
        }
    }

    fn publish(&self, state: &MirrorState) {
        self.snapshots.send_replace(state.snapshot());
    }

    fn lock(&self) -> MutexGuard<'_, MirrorState> {
        // Every critical section leaves the state consistent, so a poisoned
        // lock still guards valid rows.
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

struct InFlight<'a> {
    mirror: &'a LocalMirror,
    epoch: SessionEpoch,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.mirror.end_mutation(self.epoch);
    }
}
