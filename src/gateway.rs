//! Every authenticated call goes through here: bearer attachment, one
//! renew-and-replay on an authorization failure, and error classification.
use reqwest::Method;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

use crate::api::{ApiRequest, Transport, Upload};
use crate::error::SyncError;
use crate::session::SessionStore;

#[derive(Clone)]
pub struct Gateway {
    transport: Arc<dyn Transport>,
    session: SessionStore,
}

impl Gateway {
    pub fn new(transport: Arc<dyn Transport>, session: SessionStore) -> Self {
        Self { transport, session }
    }

    pub fn session(&self) -> &SessionStore {
        &self.session
    }

    /// Send `method path` with the current bearer.
    ///
    /// On 401/403 the call obtains a renewed token once and replays the
    /// identical request. A failed renewal or a second 401 ends the session
    /// with `SessionExpired`; a 403 after renewal is a per-call
    /// `Unauthorized`. Nothing else is retried.
    #[instrument(skip_all, fields(method = %method, path = %path))]
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<Value, SyncError> {
        self.send(ApiRequest::new(method, path, body)).await
    }

    /// Multipart POST with the same renewal handling as [`Gateway::request`].
    #[instrument(skip_all, fields(path = %path, file = %upload.file_name))]
    pub async fn upload(&self, path: &str, upload: Upload) -> Result<Value, SyncError> {
        self.send(ApiRequest::multipart(path, upload)).await
    }

    async fn send(&self, request: ApiRequest) -> Result<Value, SyncError> {
        let used = self.session.access_token();
        let response = self
            .transport
            .execute(request.clone().with_bearer(used.clone()))
            .await?;
        if !response.is_auth_failure() {
            return response.into_result();
        }

        debug!(status = response.status, "authorization failed; renewing once");
        let fresh = match self.fresh_token(used.as_deref()).await {
            Ok(token) => token,
            Err(SyncError::SessionExpired) => {
                self.session.clear().await;
                return Err(SyncError::SessionExpired);
            }
            Err(err) => return Err(err),
        };

        let retry = self
            .transport
            .execute(request.with_bearer(Some(fresh)))
            .await?;
        match retry.status {
            401 => {
                warn!("replayed request still unauthorized; ending session");
                self.session.clear().await;
                Err(SyncError::SessionExpired)
            }
            403 => {
                warn!("request forbidden with a freshly renewed token");
                Err(SyncError::Unauthorized)
            }
            _ => retry.into_result(),
        }
    }

    pub async fn get(&self, path: &str) -> Result<Value, SyncError> {
        self.request(Method::GET, path, None).await
    }

    pub async fn post(&self, path: &str, body: Option<Value>) -> Result<Value, SyncError> {
        self.request(Method::POST, path, body).await
    }

    pub async fn patch(&self, path: &str, body: Value) -> Result<Value, SyncError> {
        self.request(Method::PATCH, path, Some(body)).await
    }

    pub async fn put(&self, path: &str, body: Value) -> Result<Value, SyncError> {
        self.request(Method::PUT, path, Some(body)).await
    }

    pub async fn delete(&self, path: &str) -> Result<Value, SyncError> {
        self.request(Method::DELETE, path, None).await
    }

    /// A token newer than the one this call failed with. If another caller
    /// already renewed since `used` was read, that token is reused instead
    /// of renewing again.
    async fn fresh_token(&self, used: Option<&str>) -> Result<String, SyncError> {
        match self.session.access_token() {
            Some(current) if used != Some(current.as_str()) => {
                debug!("token already renewed by a concurrent call");
                Ok(current)
            }
            _ => self.session.renew().await,
        }
    }
}
