//! User directory for admins: listing, creation and edits.
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{info, instrument, warn};

use crate::client::ApiClient;
use crate::error::SyncError;
use crate::model::{EntityKey, EntityKind, Role, User};
use crate::mutation::{MutationController, MutationHandle};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UserForm {
    pub username: String,
    pub email: String,
    pub role: Role,
    pub is_active: bool,
    /// Required when creating; left out of an edit to keep the current one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl UserForm {
    fn to_body(&self) -> Result<Map<String, Value>, SyncError> {
        match serde_json::to_value(self)? {
            Value::Object(map) => Ok(map),
            other => Err(SyncError::Decode(format!("user form encoded as {other}"))),
        }
    }
}

#[derive(Clone)]
pub struct UserDirectory {
    client: ApiClient,
    mutations: MutationController,
}

impl UserDirectory {
    pub fn new(client: ApiClient, mutations: MutationController) -> Self {
        Self { client, mutations }
    }

    /// Reload the directory. Returns how many users came back.
    #[instrument(skip_all)]
    pub async fn refresh(&self) -> Result<usize, SyncError> {
        let items = self.client.list_entities(EntityKind::User).await?;
        let items: Vec<(i64, Value)> = items
            .into_iter()
            .filter_map(|item| match item.get("id").and_then(Value::as_i64) {
                Some(id) => Some((id, item)),
                None => {
                    warn!(%item, "user without id ignored");
                    None
                }
            })
            .collect();
        let count = items.len();
        self.mutations.store().replace_all(EntityKind::User, items);
        info!(count, "user directory refreshed");
        Ok(count)
    }

    pub fn users(&self) -> Result<Vec<User>, SyncError> {
        self.mutations.store().list_as(EntityKind::User)
    }

    pub fn user(&self, id: i64) -> Result<Option<User>, SyncError> {
        self.mutations.store().get_as(EntityKey::user(id))
    }

    /// Create an account. Not optimistic: the id is server-assigned.
    #[instrument(skip(self, form), fields(username = %form.username))]
    pub async fn create_user(&self, form: UserForm) -> Result<User, SyncError> {
        if form.password.as_deref().map_or(true, str::is_empty) {
            return Err(SyncError::ValidationFailed(
                "password is required for a new user".into(),
            ));
        }
        let created = self
            .client
            .create_entity(EntityKind::User, &form.to_body()?)
            .await?;
        let user: User = serde_json::from_value(created.clone())?;
        self.mutations.store().upsert(EntityKey::user(user.id), created);
        info!(id = user.id, "user created");
        Ok(user)
    }

    /// Show the edit right away and PUT it. The password never reaches
    /// local state.
    pub fn update_user(&self, id: i64, form: UserForm) -> Result<MutationHandle, SyncError> {
        let body = form.to_body()?;
        let mut patch = body.clone();
        patch.remove("password");
        let client = self.client.clone();
        Ok(self
            .mutations
            .apply_mutation(EntityKey::user(id), patch, move || async move {
                client.put_entity(EntityKind::User, id, &body).await
            }))
    }

    #[instrument(skip(self))]
    pub async fn delete_user(&self, id: i64) -> Result<(), SyncError> {
        let client = self.client.clone();
        self.mutations
            .apply_delete(EntityKey::user(id), move || async move {
                client.delete_entity(EntityKind::User, id).await?;
                Ok(Value::Null)
            })
            .outcome()
            .await?;
        info!(id, "user deleted");
        Ok(())
    }
}
