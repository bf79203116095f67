//! Session lifecycle: binds the mirror and its feed subscription to one owner.

use std::sync::Arc;

use tokio::sync::{Mutex, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{MirrorError, SessionError};
use crate::feed::{ChangeFeed, FeedSubscription, FeedTopic};
use crate::gateway::MutationGateway;
use crate::mirror::{DeleteOutcome, InsertOutcome, LocalMirror, MirrorSnapshot, SessionEpoch};
use crate::record::{Draft, OwnerId, RecordId};

struct ActiveSession {
    owner: OwnerId,
    epoch: SessionEpoch,
    shutdown: oneshot::Sender<()>,
    pump: JoinHandle<()>,
}

/// Drives the mirror through "signed in as X" and "signed out".
///
/// Starting a session subscribes to the feed before the initial fetch, so a
/// change committed between the two is replayed from the subscription buffer
/// instead of being lost. The replay is harmless for rows the fetch already
/// returned because every merge is idempotent by identity.
pub struct SessionController {
    mirror: Arc<LocalMirror>,
    gateway: Arc<dyn MutationGateway>,
    feed: Arc<dyn ChangeFeed>,
    topic: FeedTopic,
    active: Mutex<Option<ActiveSession>>,
}

impl SessionController {
    #[must_use]
    pub fn new(
        gateway: Arc<dyn MutationGateway>,
        feed: Arc<dyn ChangeFeed>,
        topic: FeedTopic,
    ) -> Self {
        Self {
            mirror: Arc::new(LocalMirror::new(Arc::clone(&gateway))),
            gateway,
            feed,
            topic,
            active: Mutex::new(None),
        }
    }

    /// Controller over a store that serves both the gateway and the feed.
    #[must_use]
    pub fn with_store<S>(store: Arc<S>, topic: FeedTopic) -> Self
    where
        S: MutationGateway + ChangeFeed + 'static,
    {
        Self::new(store.clone(), store, topic)
    }

    #[must_use]
    pub fn mirror(&self) -> &Arc<LocalMirror> {
        &self.mirror
    }

    #[must_use]
    pub fn snapshot(&self) -> MirrorSnapshot {
        self.mirror.snapshot()
    }

    #[must_use]
    pub fn watch(&self) -> watch::Receiver<MirrorSnapshot> {
        self.mirror.watch()
    }

    pub async fn current_owner(&self) -> Option<OwnerId> {
        self.active
            .lock()
            .await
            .as_ref()
            .map(|session| session.owner.clone())
    }

    /// Signs `owner` in: fresh mirror, feed subscription, initial load.
    ///
    /// An active session for another owner is ended first. Starting the
    /// already active owner again is a no-op.
    pub async fn start(&self, owner: OwnerId) -> Result<SessionEpoch, SessionError> {
        let mut active = self.active.lock().await;
        if let Some(current) = active.as_ref()
            && current.owner == owner
        {
            debug!(%owner, "session already active");
            return Ok(current.epoch);
        }
        if let Some(previous) = active.take() {
            info!(from = %previous.owner, to = %owner, "switching session");
            self.stop(previous).await;
        }

        let epoch = self.mirror.activate(owner.clone());
        let subscription = match self.feed.subscribe(&self.topic).await {
            Ok(subscription) => subscription,
            Err(error) => {
                self.mirror.clear();
                return Err(error.into());
            }
        };
        let records = match self.gateway.fetch_records(&owner).await {
            Ok(records) => records,
            Err(error) => {
                subscription.unsubscribe();
                self.mirror.clear();
                return Err(SessionError::Fetch(error));
            }
        };
        let loaded = match self.mirror.load(records) {
            Ok(loaded) => loaded,
            Err(error) => {
                subscription.unsubscribe();
                self.mirror.clear();
                return Err(error.into());
            }
        };

        let (shutdown, shutdown_rx) = oneshot::channel();
        let pump = tokio::spawn(pump_feed(
            Arc::clone(&self.mirror),
            epoch,
            subscription,
            shutdown_rx,
        ));
        info!(%owner, loaded, topic = %self.topic.name, "session started");
        *active = Some(ActiveSession {
            owner,
            epoch,
            shutdown,
            pump,
        });
        Ok(epoch)
    }

    /// Signs out: stops the feed, releases the subscription, clears the mirror.
    pub async fn end(&self) {
        let previous = self.active.lock().await.take();
        match previous {
            Some(previous) => self.stop(previous).await,
            None => self.mirror.clear(),
        }
    }

    /// Creates a row for the signed-in owner.
    pub async fn insert(&self, draft: &Draft) -> Result<InsertOutcome, SessionError> {
        self.mirror
            .apply_optimistic_insert(draft)
            .await
            .map_err(signed_in)
    }

    /// Deletes a row of the signed-in owner.
    pub async fn delete(&self, id: RecordId) -> Result<DeleteOutcome, SessionError> {
        self.mirror
            .apply_optimistic_delete(id)
            .await
            .map_err(signed_in)
    }

    async fn stop(&self, session: ActiveSession) {
        let _ = session.shutdown.send(());
        if let Err(error) = session.pump.await {
            warn!(%error, "feed pump ended abnormally");
        }
        self.mirror.clear();
        info!(owner = %session.owner, "session ended");
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        if let Some(session) = self.active.get_mut().take() {
            let _ = session.shutdown.send(());
            session.pump.abort();
        }
    }
}

fn signed_in(error: MirrorError) -> SessionError {
    match error {
        MirrorError::Inactive => SessionError::NotSignedIn,
        other => SessionError::Mirror(other),
    }
}

async fn pump_feed(
    mirror: Arc<LocalMirror>,
    epoch: SessionEpoch,
    mut subscription: FeedSubscription,
    mut shutdown: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown => break,
            change = subscription.recv() => match change {
                Some(raw) => {
                    mirror.on_feed_event(epoch, raw);
                }
                None => {
                    warn!(topic = %subscription.topic().name, "feed closed; mirror no longer receives changes");
                    break;
                }
            },
        }
    }
    subscription.unsubscribe();
}
