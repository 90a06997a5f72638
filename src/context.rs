//! Wires the layers together around one shared session.
use anyhow::Result;
use std::sync::Arc;
use tracing::info;

use crate::api::{AuthApi, HttpApi, Transport};
use crate::client::ApiClient;
use crate::config::Config;
use crate::gateway::Gateway;
use crate::mutation::MutationController;
use crate::notifications::NotificationFeed;
use crate::session::SessionStore;
use crate::storage::{LocalStorage, SqliteStorage};
use crate::store::LocalStore;
use crate::tasks::TaskBoard;
use crate::users::UserDirectory;

#[derive(Clone)]
pub struct AppContext {
    pub session: SessionStore,
    pub client: ApiClient,
    pub store: LocalStore,
    pub tasks: TaskBoard,
    pub users: UserDirectory,
    pub notifications: NotificationFeed,
}

impl AppContext {
    /// Build the production stack from config and restore any persisted
    /// session.
    pub async fn connect(cfg: &Config) -> Result<Self> {
        cfg.ensure_dirs()?;
        let database_url =
            std::env::var("DATABASE_URL").unwrap_or_else(|_| cfg.database_url());
        let storage = SqliteStorage::open(&database_url).await?;
        let api = Arc::new(HttpApi::from_config(cfg)?);
        info!(base_url = %api.base_url(), "connecting to task service");

        let ctx = Self::from_parts(api.clone(), api, Arc::new(storage));
        ctx.session.restore().await;
        Ok(ctx)
    }

    pub fn from_parts(
        transport: Arc<dyn Transport>,
        auth: Arc<dyn AuthApi>,
        storage: Arc<dyn LocalStorage>,
    ) -> Self {
        let session = SessionStore::new(auth, storage);
        let client = ApiClient::new(Gateway::new(transport, session.clone()));
        let store = LocalStore::new();
        // One controller so tasks and users share the per-entity ordering.
        let mutations = MutationController::new(store.clone());
        Self {
            tasks: TaskBoard::new(client.clone(), mutations.clone()),
            users: UserDirectory::new(client.clone(), mutations),
            notifications: NotificationFeed::new(client.clone()),
            session,
            client,
            store,
        }
    }
}
