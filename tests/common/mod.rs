#![allow(dead_code)]

use async_trait::async_trait;
use reqwest::Method;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use taskboard_sync::api::{ApiRequest, ApiResponse, AuthApi, Transport};
use taskboard_sync::model::LoginGrant;
use taskboard_sync::storage::MemoryStorage;
use taskboard_sync::{AppContext, SyncError};
use tokio::sync::Mutex;

pub const EMAIL: &str = "a@b.com";
pub const PASSWORD: &str = "x";

type Route = (Method, String);

#[derive(Default)]
struct ServerState {
    valid_access: Option<String>,
    valid_refresh: Option<String>,
    issued: u32,
    renew_calls: usize,
    renew_delay: Duration,
    reject_renewal: bool,
    /// Error the next renewals fail with, ahead of any token check.
    renewal_error: Option<SyncError>,
    /// Every bearer is refused, even freshly renewed ones.
    revoked: bool,
    offline: bool,
    forbidden: HashSet<String>,
    once: HashMap<Route, VecDeque<ApiResponse>>,
    routes: HashMap<Route, ApiResponse>,
    requests: Vec<ApiRequest>,
}

/// In-process stand-in for the task service: issues and checks tokens,
/// answers scripted routes and records every request.
#[derive(Clone, Default)]
pub struct FakeServer {
    state: Arc<Mutex<ServerState>>,
}

impl FakeServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Persistent answer for a route.
    pub async fn route(&self, method: Method, path: &str, status: u16, body: Value) {
        self.state
            .lock()
            .await
            .routes
            .insert((method, path.to_string()), ApiResponse::new(status, body));
    }

    /// One-shot answer for a route, served before any persistent one.
    pub async fn script_once(&self, method: Method, path: &str, status: u16, body: Value) {
        self.state
            .lock()
            .await
            .once
            .entry((method, path.to_string()))
            .or_default()
            .push_back(ApiResponse::new(status, body));
    }

    pub async fn forbid(&self, path: &str) {
        self.state.lock().await.forbidden.insert(path.to_string());
    }

    /// The access token the client holds stops being accepted.
    pub async fn expire_access(&self) {
        self.state.lock().await.valid_access = None;
    }

    pub async fn revoke_everything(&self) {
        self.state.lock().await.revoked = true;
    }

    pub async fn reject_renewal(&self) {
        self.state.lock().await.reject_renewal = true;
    }

    pub async fn fail_renewal(&self, error: SyncError) {
        self.state.lock().await.renewal_error = Some(error);
    }

    pub async fn set_renew_delay(&self, delay: Duration) {
        self.state.lock().await.renew_delay = delay;
    }

    pub async fn set_offline(&self, offline: bool) {
        self.state.lock().await.offline = offline;
    }

    pub async fn renew_calls(&self) -> usize {
        self.state.lock().await.renew_calls
    }

    pub async fn requests(&self) -> Vec<ApiRequest> {
        self.state.lock().await.requests.clone()
    }

    pub async fn requests_to(&self, path: &str) -> Vec<ApiRequest> {
        self.requests()
            .await
            .into_iter()
            .filter(|r| r.path == path)
            .collect()
    }

    fn issue_access(state: &mut ServerState) -> String {
        state.issued += 1;
        let token = format!("access-{}", state.issued);
        state.valid_access = Some(token.clone());
        token
    }
}

#[async_trait]
impl Transport for FakeServer {
    async fn execute(&self, request: ApiRequest) -> Result<ApiResponse, SyncError> {
        let mut state = self.state.lock().await;
        state.requests.push(request.clone());
        if state.offline {
            return Err(SyncError::NetworkUnavailable("connection refused".into()));
        }

        let authorized =
            !state.revoked && request.bearer.is_some() && request.bearer == state.valid_access;
        if !authorized {
            return Ok(ApiResponse::new(
                401,
                json!({"detail": "Given token not valid for any token type"}),
            ));
        }
        if state.forbidden.contains(&request.path) {
            return Ok(ApiResponse::new(403, json!({"detail": "forbidden"})));
        }

        let route = (request.method.clone(), request.path.clone());
        if let Some(response) = state.once.get_mut(&route).and_then(VecDeque::pop_front) {
            return Ok(response);
        }
        Ok(state
            .routes
            .get(&route)
            .cloned()
            .unwrap_or_else(|| ApiResponse::new(200, Value::Null)))
    }
}

#[async_trait]
impl AuthApi for FakeServer {
    async fn login(&self, email: &str, password: &str) -> Result<LoginGrant, SyncError> {
        let mut state = self.state.lock().await;
        if state.offline {
            return Err(SyncError::NetworkUnavailable("connection refused".into()));
        }
        if email != EMAIL || password != PASSWORD {
            return Err(SyncError::Unauthorized);
        }
        let access = Self::issue_access(&mut state);
        let refresh = "refresh-1".to_string();
        state.valid_refresh = Some(refresh.clone());
        Ok(serde_json::from_value(json!({
            "access": access,
            "refresh": refresh,
            "role": "admin",
            "username": "ana",
            "email": EMAIL,
            "user_id": 1
        }))?)
    }

    async fn renew(&self, refresh: &str) -> Result<String, SyncError> {
        let delay = {
            let mut state = self.state.lock().await;
            state.renew_calls += 1;
            state.renew_delay
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock().await;
        if state.offline {
            return Err(SyncError::NetworkUnavailable("connection refused".into()));
        }
        if let Some(error) = state.renewal_error.clone() {
            return Err(error);
        }
        if state.reject_renewal || state.valid_refresh.as_deref() != Some(refresh) {
            return Err(SyncError::SessionExpired);
        }
        Ok(Self::issue_access(&mut state))
    }
}

pub fn context(server: &FakeServer) -> (AppContext, Arc<MemoryStorage>) {
    let storage = Arc::new(MemoryStorage::new());
    let server = Arc::new(server.clone());
    let ctx = AppContext::from_parts(server.clone(), server, storage.clone());
    (ctx, storage)
}

pub async fn logged_in(server: &FakeServer) -> (AppContext, Arc<MemoryStorage>) {
    let (ctx, storage) = context(server);
    ctx.session.login(EMAIL, PASSWORD).await.unwrap();
    (ctx, storage)
}

pub fn notification(id: i64, created_at: &str, is_read: bool) -> Value {
    json!({
        "id": id,
        "type": "estado",
        "message": format!("Tarea {id} actualizada"),
        "created_at": created_at,
        "is_read": is_read
    })
}
