//! Typed endpoints of the task service, all routed through the gateway.
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tracing::instrument;

use crate::api::Upload;
use crate::error::SyncError;
use crate::gateway::Gateway;
use crate::model::{Attachment, EntityKind, NotificationItem, Task};
use crate::session::SessionStore;

#[derive(Clone)]
pub struct ApiClient {
    gateway: Gateway,
}

const ATTACHMENTS_PATH: &str = "attachments/";

pub fn entity_path(kind: EntityKind, id: i64) -> String {
    format!("{}/{}/", kind.collection(), id)
}

pub fn collection_path(kind: EntityKind) -> String {
    format!("{}/", kind.collection())
}

impl ApiClient {
    pub fn new(gateway: Gateway) -> Self {
        Self { gateway }
    }

    pub fn session(&self) -> &SessionStore {
        self.gateway.session()
    }

    /// PATCH a subset of fields. Returns the server's representation of the
    /// entity (`Null` when the server answers without a body).
    #[instrument(skip(self, patch))]
    pub async fn patch_entity(
        &self,
        kind: EntityKind,
        id: i64,
        patch: &Map<String, Value>,
    ) -> Result<Value, SyncError> {
        self.gateway
            .patch(&entity_path(kind, id), Value::Object(patch.clone()))
            .await
    }

    /// PUT a complete representation, as the edit forms do.
    #[instrument(skip(self, body))]
    pub async fn put_entity(
        &self,
        kind: EntityKind,
        id: i64,
        body: &Map<String, Value>,
    ) -> Result<Value, SyncError> {
        self.gateway
            .put(&entity_path(kind, id), Value::Object(body.clone()))
            .await
    }

    pub async fn get_entity(&self, kind: EntityKind, id: i64) -> Result<Value, SyncError> {
        self.gateway.get(&entity_path(kind, id)).await
    }

    pub async fn list_entities(&self, kind: EntityKind) -> Result<Vec<Value>, SyncError> {
        decode(self.gateway.get(&collection_path(kind)).await?)
    }

    pub async fn create_entity(
        &self,
        kind: EntityKind,
        body: &Map<String, Value>,
    ) -> Result<Value, SyncError> {
        self.gateway
            .post(&collection_path(kind), Some(Value::Object(body.clone())))
            .await
    }

    pub async fn delete_entity(&self, kind: EntityKind, id: i64) -> Result<(), SyncError> {
        self.gateway.delete(&entity_path(kind, id)).await?;
        Ok(())
    }

    pub async fn list_tasks(&self) -> Result<Vec<Task>, SyncError> {
        decode(self.gateway.get(&collection_path(EntityKind::Task)).await?)
    }

    pub async fn list_notifications(&self) -> Result<Vec<NotificationItem>, SyncError> {
        decode(self.gateway.get("notifications/").await?)
    }

    /// Upload one file to a task as a multipart form (`task`, `file`).
    #[instrument(skip(self, bytes), fields(len = bytes.len()))]
    pub async fn upload_attachment(
        &self,
        task_id: i64,
        file_name: &str,
        bytes: Vec<u8>,
    ) -> Result<Attachment, SyncError> {
        let upload = Upload {
            fields: vec![("task".to_string(), task_id.to_string())],
            file_field: "file".to_string(),
            file_name: file_name.to_string(),
            bytes,
        };
        decode(self.gateway.upload(ATTACHMENTS_PATH, upload).await?)
    }

    #[instrument(skip(self))]
    pub async fn delete_attachment(&self, id: i64) -> Result<(), SyncError> {
        self.gateway
            .delete(&format!("{ATTACHMENTS_PATH}{id}/"))
            .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn mark_notification_read(&self, id: i64) -> Result<(), SyncError> {
        self.gateway
            .post(&format!("notifications/{}/mark-read/", id), None)
            .await?;
        Ok(())
    }
}

/// Decode a response body. List endpoints may answer either with a bare
/// array or with a paginated `{ "results": [...] }` envelope.
fn decode<T: DeserializeOwned>(body: Value) -> Result<T, SyncError> {
    let body = match body {
        Value::Object(mut map) if map.contains_key("results") => {
            map.remove("results").unwrap_or(Value::Null)
        }
        other => other,
    };
    Ok(serde_json::from_value(body)?)
}
