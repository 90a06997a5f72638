//! Optimistic mutations: apply locally now, commit remotely, then confirm
//! or roll back.
use futures::future::{BoxFuture, FutureExt, Shared};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::SyncError;
use crate::model::{EntityKey, MutationStatus};
use crate::store::{Change, LocalStore, Patch, PendingMutation};

type Turn = Shared<BoxFuture<'static, ()>>;

#[derive(Debug, Clone, PartialEq)]
pub struct MutationOutcome {
    pub id: Uuid,
    pub key: EntityKey,
    pub status: MutationStatus,
    /// Observable state of the entity once the mutation settled.
    pub state: Option<Value>,
}

/// Resolves when the remote commit settles. Dropping the handle does not
/// cancel the commit.
#[derive(Debug)]
pub struct MutationHandle {
    id: Uuid,
    key: EntityKey,
    task: JoinHandle<Result<MutationOutcome, SyncError>>,
}

impl MutationHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn key(&self) -> EntityKey {
        self.key
    }

    pub async fn outcome(self) -> Result<MutationOutcome, SyncError> {
        self.task
            .await
            .map_err(|err| SyncError::Aborted(err.to_string()))?
    }
}

#[derive(Clone)]
pub struct MutationController {
    store: LocalStore,
    /// Per entity: the completion of the most recently submitted commit.
    lanes: Arc<Mutex<HashMap<EntityKey, (Uuid, Turn)>>>,
}

impl MutationController {
    pub fn new(store: LocalStore) -> Self {
        Self {
            store,
            lanes: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn store(&self) -> &LocalStore {
        &self.store
    }

    /// Apply `patch` to `key` right away and commit it in the background.
    ///
    /// `commit` returns the server's representation of the entity, or `Null`
    /// when the server has none to offer. Commits on one entity run in
    /// submission order; different entities proceed independently. Must be
    /// called from within a Tokio runtime.
    pub fn apply_mutation<F, Fut>(&self, key: EntityKey, patch: Patch, commit: F) -> MutationHandle
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Value, SyncError>> + Send + 'static,
    {
        self.apply_change(key, Change::Patch(patch), commit)
    }

    /// Hide `key` right away and commit the delete in the background. It
    /// queues behind earlier commits on the same entity, and a failure
    /// brings the entity back as those left it.
    pub fn apply_delete<F, Fut>(&self, key: EntityKey, commit: F) -> MutationHandle
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Value, SyncError>> + Send + 'static,
    {
        self.apply_change(key, Change::Delete, commit)
    }

    fn apply_change<F, Fut>(&self, key: EntityKey, change: Change, commit: F) -> MutationHandle
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Value, SyncError>> + Send + 'static,
    {
        let mutation = self.store.begin(key, change);
        let id = mutation.id;

        let (done_tx, done_rx) = oneshot::channel::<()>();
        let turn: Turn = done_rx.map(|_| ()).boxed().shared();
        let previous = self
            .lanes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, (id, turn))
            .map(|(_, turn)| turn);

        let controller = self.clone();
        let task = tokio::spawn(async move {
            if let Some(previous) = previous {
                previous.await;
            }
            let result = commit().await;
            let outcome = controller.settle(&mutation, result);
            controller.release(key, id);
            drop(done_tx);
            outcome
        });

        MutationHandle { id, key, task }
    }

    /// `apply_mutation` and wait for the outcome.
    pub async fn mutate<F, Fut>(
        &self,
        key: EntityKey,
        patch: Patch,
        commit: F,
    ) -> Result<MutationOutcome, SyncError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Value, SyncError>> + Send + 'static,
    {
        self.apply_mutation(key, patch, commit).outcome().await
    }

    fn settle(
        &self,
        mutation: &PendingMutation,
        result: Result<Value, SyncError>,
    ) -> Result<MutationOutcome, SyncError> {
        let key = mutation.key;
        match result {
            Ok(body) => {
                let authoritative = body.is_object().then_some(body);
                let server_won = authoritative.is_some();
                self.store.confirm(key, mutation.id, authoritative);
                info!(%key, mutation = %mutation.id, server_won, "mutation confirmed");
                Ok(self.outcome(mutation, MutationStatus::Confirmed))
            }
            Err(SyncError::Conflict { server }) => {
                warn!(%key, mutation = %mutation.id, "mutation conflicted; adopting server state");
                self.store.rollback(key, mutation.id, server.clone());
                let err = SyncError::Conflict { server };
                self.store.report_failure(key, mutation.id, err.clone());
                Err(err)
            }
            Err(err) => {
                warn!(%key, mutation = %mutation.id, ?err, "mutation failed; rolled back");
                self.store.rollback(key, mutation.id, None);
                // Auth failures go to the logout flow, not a banner.
                if !err.is_auth() {
                    self.store.report_failure(key, mutation.id, err.clone());
                }
                Err(err)
            }
        }
    }

    fn outcome(&self, mutation: &PendingMutation, status: MutationStatus) -> MutationOutcome {
        MutationOutcome {
            id: mutation.id,
            key: mutation.key,
            status,
            state: self.store.get(mutation.key),
        }
    }

    /// Forget the lane once its newest commit has settled.
    fn release(&self, key: EntityKey, id: Uuid) {
        let mut lanes = self.lanes.lock().unwrap_or_else(PoisonError::into_inner);
        if lanes.get(&key).is_some_and(|(tail, _)| *tail == id) {
            lanes.remove(&key);
        }
    }
}
