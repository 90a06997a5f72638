//! Local notification feed: merges polled server lists without losing
//! local read state, and the poller that drives it.
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, instrument, warn};

use crate::client::ApiClient;
use crate::error::SyncError;
use crate::model::NotificationItem;
use crate::session::{AuthState, SessionStore};

#[derive(Debug, Default)]
struct FeedState {
    items: Vec<NotificationItem>,
    /// Ids read locally that the server has not yet reported read.
    read_latch: HashSet<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    Merged { new_items: usize },
    /// No session, or it ended while the fetch was in flight.
    SignedOut,
    /// Fetch failed; the local feed was left untouched.
    Failed(SyncError),
}

/// Newest first; equal timestamps fall back to the higher id.
pub fn sort_for_display(items: &mut [NotificationItem]) {
    items.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
}

/// Merge `remote` into `local`.
///
/// Every local item survives. Shared ids take the remote content but stay
/// read if they were read locally or are latched. Ids the server reports
/// read leave the latch, as do ids that appear in neither list.
pub fn merge_notifications(
    local: &[NotificationItem],
    remote: Vec<NotificationItem>,
    read_latch: &mut HashSet<i64>,
) -> Vec<NotificationItem> {
    let mut by_id: HashMap<i64, NotificationItem> =
        local.iter().map(|item| (item.id, item.clone())).collect();

    for mut incoming in remote {
        if incoming.is_read {
            read_latch.remove(&incoming.id);
        }
        let read_locally = read_latch.contains(&incoming.id)
            || by_id.get(&incoming.id).is_some_and(|known| known.is_read);
        incoming.is_read |= read_locally;
        by_id.insert(incoming.id, incoming);
    }

    read_latch.retain(|id| by_id.contains_key(id));
    let mut merged: Vec<NotificationItem> = by_id.into_values().collect();
    sort_for_display(&mut merged);
    merged
}

#[derive(Clone)]
pub struct NotificationFeed {
    client: ApiClient,
    state: Arc<Mutex<FeedState>>,
    unread: watch::Sender<usize>,
}

impl NotificationFeed {
    pub fn new(client: ApiClient) -> Self {
        let (unread, _) = watch::channel(0);
        Self {
            client,
            state: Arc::new(Mutex::new(FeedState::default())),
            unread,
        }
    }

    fn session(&self) -> &SessionStore {
        self.client.session()
    }

    pub fn items(&self) -> Vec<NotificationItem> {
        self.with_state(|state| state.items.clone())
    }

    pub fn unread_count(&self) -> usize {
        self.with_state(|state| state.items.iter().filter(|item| !item.is_read).count())
    }

    /// Ids read locally that the server has not confirmed yet.
    pub fn unconfirmed_reads(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.with_state(|state| state.read_latch.iter().copied().collect());
        ids.sort_unstable();
        ids
    }

    /// Unread badge count, updated after every change to the feed.
    pub fn subscribe_unread(&self) -> watch::Receiver<usize> {
        self.unread.subscribe()
    }

    /// Merge a server listing into the feed. Returns how many ids were new.
    pub fn reconcile(&self, remote: Vec<NotificationItem>) -> usize {
        let new_items = self.with_state(|state| {
            let before = state.items.len();
            state.items = merge_notifications(&state.items, remote, &mut state.read_latch);
            state.items.len() - before
        });
        self.publish_unread();
        new_items
    }

    /// Fetch once and merge. Failures are logged and leave the feed as it
    /// was.
    #[instrument(skip_all)]
    pub async fn poll_once(&self) -> PollOutcome {
        if !self.session().is_authenticated() {
            debug!("no session; skipping notification poll");
            return PollOutcome::SignedOut;
        }

        let remote = match self.client.list_notifications().await {
            Ok(remote) => remote,
            Err(err) => {
                warn!(?err, "notification fetch failed; keeping local feed");
                return PollOutcome::Failed(err);
            }
        };
        if !self.session().is_authenticated() {
            debug!("session ended during poll; discarding result");
            return PollOutcome::SignedOut;
        }

        let unconfirmed: Vec<i64> = self.with_state(|state| {
            remote
                .iter()
                .filter(|item| !item.is_read && state.read_latch.contains(&item.id))
                .map(|item| item.id)
                .collect()
        });
        let new_items = self.reconcile(remote);
        debug!(new_items, "notifications reconciled");

        for id in unconfirmed {
            if let Err(err) = self.client.mark_notification_read(id).await {
                debug!(id, ?err, "mark-read retry failed; will try next poll");
            }
        }
        PollOutcome::Merged { new_items }
    }

    /// Mark `id` read locally at once, then tell the server. A failed remote
    /// call is logged and retried on a later poll; the local flag stays set.
    #[instrument(skip(self))]
    pub async fn mark_read(&self, id: i64) {
        self.with_state(|state| {
            state.read_latch.insert(id);
            if let Some(item) = state.items.iter_mut().find(|item| item.id == id) {
                item.is_read = true;
            }
        });
        self.publish_unread();

        if let Err(err) = self.client.mark_notification_read(id).await {
            warn!(id, ?err, "failed to mark notification read remotely");
        }
    }

    pub fn clear(&self) {
        self.with_state(|state| *state = FeedState::default());
        self.publish_unread();
    }

    /// Poll every `interval` until sign-out. Sign-out also abandons a fetch
    /// already in flight and empties the feed.
    pub fn spawn_poller(&self, interval: Duration) -> PollerHandle {
        let feed = self.clone();
        let mut auth = self.session().subscribe();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    changed = auth.changed() => {
                        if changed.is_err() || *auth.borrow() == AuthState::SignedOut {
                            break;
                        }
                        continue;
                    }
                }
                tokio::select! {
                    outcome = feed.poll_once() => {
                        if outcome == PollOutcome::SignedOut {
                            break;
                        }
                    }
                    changed = auth.changed() => {
                        if changed.is_err() || *auth.borrow() == AuthState::SignedOut {
                            debug!("sign-out during poll; abandoning fetch");
                            break;
                        }
                    }
                }
            }
            feed.clear();
            info!("notification poller stopped");
        });
        PollerHandle { task }
    }

    fn publish_unread(&self) {
        let count = self.unread_count();
        self.unread.send_if_modified(|current| {
            let changed = *current != count;
            *current = count;
            changed
        });
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut FeedState) -> R) -> R {
        let mut guard = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }
}

#[derive(Debug)]
pub struct PollerHandle {
    task: JoinHandle<()>,
}

impl PollerHandle {
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub fn stop(self) {
        self.task.abort();
    }

    /// Wait for the poller to exit on its own (it does so on sign-out).
    pub async fn join(self) {
        if let Err(err) = self.task.await {
            if !err.is_cancelled() {
                warn!(?err, "notification poller panicked");
            }
        }
    }
}
