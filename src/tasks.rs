//! Task-level operations used by the dashboard views.
use chrono::NaiveDate;
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::path::Path;
use tracing::{info, instrument, warn};

use crate::client::ApiClient;
use crate::dashboard::{self, DashboardSummary, UpcomingTask};
use crate::error::SyncError;
use crate::model::{Attachment, EntityKey, EntityKind, Priority, Task, TaskStatus};
use crate::mutation::{MutationController, MutationHandle};
use crate::store::{LocalStore, Patch};

/// Complete task representation sent by the edit form. People are sent by id.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskForm {
    pub title: String,
    pub description: String,
    pub start_date: Option<NaiveDate>,
    pub due_date: Option<NaiveDate>,
    pub priority: Option<Priority>,
    pub status: TaskStatus,
    pub assigned_to: Option<i64>,
    pub delegated_to: Option<i64>,
}

impl TaskForm {
    /// Prefill from the current state of a task.
    pub fn from_task(task: &Task) -> Self {
        Self {
            title: task.title.clone(),
            description: task.description.clone(),
            start_date: task.start_date,
            due_date: task.due_date,
            priority: task.priority.clone(),
            status: task.status.clone(),
            assigned_to: task.assigned_to.as_ref().map(|u| u.id),
            delegated_to: task.delegated_to.as_ref().map(|u| u.id),
        }
    }

    fn to_body(&self) -> Result<Map<String, Value>, SyncError> {
        match serde_json::to_value(self)? {
            Value::Object(map) => Ok(map),
            other => Err(SyncError::Decode(format!("task form encoded as {other}"))),
        }
    }

    /// Fields that can be shown locally before the server answers. People
    /// stay as they are until the server returns them expanded.
    fn local_patch(&self) -> Result<Patch, SyncError> {
        let mut patch = self.to_body()?;
        patch.remove("assigned_to");
        patch.remove("delegated_to");
        Ok(patch)
    }
}

#[derive(Clone)]
pub struct TaskBoard {
    client: ApiClient,
    mutations: MutationController,
}

impl TaskBoard {
    pub fn new(client: ApiClient, mutations: MutationController) -> Self {
        Self { client, mutations }
    }

    pub fn store(&self) -> &LocalStore {
        self.mutations.store()
    }

    pub fn mutations(&self) -> &MutationController {
        &self.mutations
    }

    /// Reload the task list from the server. Returns how many tasks came back.
    #[instrument(skip_all)]
    pub async fn refresh(&self) -> Result<usize, SyncError> {
        let items = self.client.list_entities(EntityKind::Task).await?;
        let count = items.len();
        self.store().replace_all(EntityKind::Task, keyed(items));
        info!(count, "task list refreshed");
        Ok(count)
    }

    pub fn tasks(&self) -> Result<Vec<Task>, SyncError> {
        self.store().list_as(EntityKind::Task)
    }

    pub fn task(&self, id: i64) -> Result<Option<Task>, SyncError> {
        self.store().get_as(EntityKey::task(id))
    }

    pub fn summary(&self, today: NaiveDate) -> Result<DashboardSummary, SyncError> {
        Ok(dashboard::summarize(&self.tasks()?, today))
    }

    pub fn upcoming(&self, today: NaiveDate) -> Result<Vec<UpcomingTask>, SyncError> {
        Ok(dashboard::upcoming(&self.tasks()?, today))
    }

    /// Optimistically patch arbitrary task fields.
    pub fn update_task(&self, id: i64, patch: Patch) -> MutationHandle {
        let client = self.client.clone();
        let commit_patch = patch.clone();
        self.mutations
            .apply_mutation(EntityKey::task(id), patch, move || async move {
                client.patch_entity(EntityKind::Task, id, &commit_patch).await
            })
    }

    /// Save the edit form with a full PUT.
    pub fn edit_task(&self, id: i64, form: TaskForm) -> Result<MutationHandle, SyncError> {
        let patch = form.local_patch()?;
        let body = form.to_body()?;
        let client = self.client.clone();
        Ok(self
            .mutations
            .apply_mutation(EntityKey::task(id), patch, move || async move {
                client.put_entity(EntityKind::Task, id, &body).await
            }))
    }

    pub fn set_status(&self, id: i64, status: TaskStatus) -> MutationHandle {
        self.update_task(id, single_field("status", json!(status.as_str())))
    }

    /// Delegate a task to another user, or withdraw the delegation.
    pub fn delegate(&self, id: i64, user_id: Option<i64>) -> MutationHandle {
        self.update_task(id, single_field("delegated_to_id", json!(user_id)))
    }

    /// Create a task. Not optimistic: the id is server-assigned.
    #[instrument(skip(self, body))]
    pub async fn create_task(&self, body: Patch) -> Result<Task, SyncError> {
        let created = self.client.create_entity(EntityKind::Task, &body).await?;
        let task: Task = serde_json::from_value(created.clone())?;
        self.store().upsert(EntityKey::task(task.id), created);
        info!(id = task.id, "task created");
        Ok(task)
    }

    /// Hide the task now and delete it remotely after any edits already
    /// queued for it. A refused delete brings it back.
    #[instrument(skip(self))]
    pub async fn delete_task(&self, id: i64) -> Result<(), SyncError> {
        let client = self.client.clone();
        self.mutations
            .apply_delete(EntityKey::task(id), move || async move {
                client.delete_entity(EntityKind::Task, id).await?;
                Ok(Value::Null)
            })
            .outcome()
            .await?;
        info!(id, "task deleted");
        Ok(())
    }

    /// Upload a file from disk to a task, then reload the task so its
    /// attachment list is current.
    #[instrument(skip(self, path), fields(path = %path.as_ref().display()))]
    pub async fn attach_file(
        &self,
        task_id: i64,
        path: impl AsRef<Path>,
    ) -> Result<Attachment, SyncError> {
        let path = path.as_ref();
        let file_name = path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| SyncError::ValidationFailed(format!("not a file: {}", path.display())))?
            .to_string();
        let bytes = tokio::fs::read(path).await.map_err(|err| {
            SyncError::ValidationFailed(format!("cannot read {}: {err}", path.display()))
        })?;
        let attachment = self
            .client
            .upload_attachment(task_id, &file_name, bytes)
            .await?;
        info!(task_id, attachment = attachment.id, "file attached");
        self.reload(task_id).await;
        Ok(attachment)
    }

    #[instrument(skip(self))]
    pub async fn remove_attachment(&self, task_id: i64, attachment_id: i64) -> Result<(), SyncError> {
        self.client.delete_attachment(attachment_id).await?;
        self.reload(task_id).await;
        Ok(())
    }

    /// Best effort: the attachment call already succeeded.
    async fn reload(&self, id: i64) {
        match self.client.get_entity(EntityKind::Task, id).await {
            Ok(value) if value.is_object() => self.store().upsert(EntityKey::task(id), value),
            Ok(_) => {}
            Err(err) => warn!(id, ?err, "task reload failed"),
        }
    }
}

fn single_field(name: &str, value: Value) -> Patch {
    let mut patch = Map::new();
    patch.insert(name.to_string(), value);
    patch
}

/// Pair listing items with their `id`; items without one are skipped.
fn keyed(items: Vec<Value>) -> Vec<(i64, Value)> {
    items
        .into_iter()
        .filter_map(|item| {
            let id = item.get("id").and_then(Value::as_i64);
            if id.is_none() {
                warn!(%item, "listing item without id ignored");
            }
            id.map(|id| (id, item))
        })
        .collect()
}
