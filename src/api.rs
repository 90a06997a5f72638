//! Seams to the remote task service: raw request execution and the two
//! unauthenticated auth endpoints, plus their reqwest-backed implementation.
use anyhow::Context;
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, Method, Url};
use serde::Deserialize;
use serde_json::{json, Value};
use std::fmt;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::SyncError;
use crate::model::LoginGrant;

pub const LOGIN_PATH: &str = "token/email/";
pub const RENEW_PATH: &str = "token/refresh/";

/// A multipart form with text fields and one file part. Kept as plain data
/// so the request can be replayed after a token renewal.
#[derive(Clone, PartialEq)]
pub struct Upload {
    pub fields: Vec<(String, String)>,
    pub file_field: String,
    pub file_name: String,
    pub bytes: Vec<u8>,
}

impl fmt::Debug for Upload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Upload")
            .field("fields", &self.fields)
            .field("file_name", &self.file_name)
            .field("len", &self.bytes.len())
            .finish()
    }
}

impl Upload {
    fn into_form(self) -> Result<Form, SyncError> {
        let mime = content_type(&self.file_name);
        let part = Part::bytes(self.bytes)
            .file_name(self.file_name)
            .mime_str(mime)
            .map_err(|err| SyncError::ValidationFailed(format!("bad content type: {err}")))?;
        let form = self
            .fields
            .into_iter()
            .fold(Form::new(), |form, (name, value)| form.text(name, value));
        Ok(form.part(self.file_field, part))
    }
}

fn content_type(file_name: &str) -> &'static str {
    let ext = file_name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "pdf" => "application/pdf",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "txt" => "text/plain",
        "csv" => "text/csv",
        "doc" => "application/msword",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "xlsx" => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        _ => "application/octet-stream",
    }
}

/// One outbound call, relative to the API base URL.
#[derive(Clone, PartialEq)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    pub body: Option<Value>,
    pub upload: Option<Upload>,
    pub bearer: Option<String>,
}

impl fmt::Debug for ApiRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiRequest")
            .field("method", &self.method)
            .field("path", &self.path)
            .field("has_body", &self.body.is_some())
            .field("upload", &self.upload)
            .field("has_bearer", &self.bearer.is_some())
            .finish()
    }
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>, body: Option<Value>) -> Self {
        Self {
            method,
            path: path.into(),
            body,
            upload: None,
            bearer: None,
        }
    }

    pub fn multipart(path: impl Into<String>, upload: Upload) -> Self {
        Self {
            upload: Some(upload),
            ..Self::new(Method::POST, path, None)
        }
    }

    pub fn with_bearer(mut self, token: Option<String>) -> Self {
        self.bearer = token;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    pub status: u16,
    pub body: Value,
}

impl ApiResponse {
    pub fn new(status: u16, body: Value) -> Self {
        Self { status, body }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_auth_failure(&self) -> bool {
        self.status == 401 || self.status == 403
    }

    /// Success body, or the mapped error for any other status.
    pub fn into_result(self) -> Result<Value, SyncError> {
        if self.is_success() {
            Ok(self.body)
        } else {
            Err(SyncError::from_status(self.status, self.body))
        }
    }
}

/// Executes requests exactly as given. Transport failures surface as
/// `NetworkUnavailable`; every HTTP status comes back as a response.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn execute(&self, request: ApiRequest) -> Result<ApiResponse, SyncError>;
}

/// The credential endpoints, called without a bearer.
#[async_trait]
pub trait AuthApi: Send + Sync {
    async fn login(&self, email: &str, password: &str) -> Result<LoginGrant, SyncError>;

    /// Exchange a refresh token for a fresh access token.
    async fn renew(&self, refresh: &str) -> Result<String, SyncError>;
}

#[derive(Clone)]
pub struct HttpApi {
    http: Client,
    base_url: Url,
}

impl fmt::Debug for HttpApi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpApi")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl HttpApi {
    pub fn from_config(cfg: &Config) -> anyhow::Result<Self> {
        let base_url = cfg.api.url()?;
        Self::with_base_url(base_url, cfg.api.timeout())
    }

    pub fn with_base_url(base_url: Url, timeout: Duration) -> anyhow::Result<Self> {
        let http = Client::builder()
            .user_agent(concat!("taskboard-sync/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self { http, base_url })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn build_request(&self, request: &ApiRequest) -> Result<reqwest::Request, SyncError> {
        let endpoint = self
            .base_url
            .join(request.path.trim_start_matches('/'))
            .map_err(|err| SyncError::ValidationFailed(format!("bad path {}: {err}", request.path)))?;
        let mut builder = self
            .http
            .request(request.method.clone(), endpoint)
            .header("Accept", "application/json");
        if let Some(token) = &request.bearer {
            builder = builder.header("Authorization", format!("Bearer {}", token));
        }
        if let Some(upload) = &request.upload {
            builder = builder.multipart(upload.clone().into_form()?);
        } else if let Some(body) = &request.body {
            builder = builder.json(body);
        }
        builder
            .build()
            .map_err(|err| SyncError::ValidationFailed(format!("failed to build request: {err}")))
    }
}

#[async_trait]
impl Transport for HttpApi {
    async fn execute(&self, request: ApiRequest) -> Result<ApiResponse, SyncError> {
        let built = self.build_request(&request)?;
        debug!(method = %request.method, url = %built.url(), "sending api request");
        let res = self.http.execute(built).await.map_err(|err| {
            warn!(?err, path = %request.path, "api request did not complete");
            SyncError::NetworkUnavailable(err.to_string())
        })?;

        let status = res.status().as_u16();
        let text = res
            .text()
            .await
            .map_err(|err| SyncError::NetworkUnavailable(err.to_string()))?;
        let body = if text.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).unwrap_or(Value::String(text))
        };
        debug!(status, path = %request.path, "api response");
        Ok(ApiResponse { status, body })
    }
}

#[derive(Deserialize)]
struct RenewResponse {
    access: String,
}

#[async_trait]
impl AuthApi for HttpApi {
    async fn login(&self, email: &str, password: &str) -> Result<LoginGrant, SyncError> {
        let request = ApiRequest::new(
            Method::POST,
            LOGIN_PATH,
            Some(json!({ "email": email, "password": password })),
        );
        let body = self.execute(request).await?.into_result()?;
        Ok(serde_json::from_value(body)?)
    }

    async fn renew(&self, refresh: &str) -> Result<String, SyncError> {
        let request = ApiRequest::new(Method::POST, RENEW_PATH, Some(json!({ "refresh": refresh })));
        let response = self.execute(request).await?;
        let payload: RenewResponse = serde_json::from_value(renewal_result(response)?)?;
        Ok(payload.access)
    }
}

/// Only an explicit rejection of the refresh token ends the session. Any
/// other failure status (timeouts, rate limiting, outages) keeps it.
fn renewal_result(response: ApiResponse) -> Result<Value, SyncError> {
    match response.status {
        400 | 401 | 403 => Err(SyncError::SessionExpired),
        _ if response.is_success() => Ok(response.body),
        status => Err(SyncError::Server {
            status,
            body: response.body.to_string(),
        }),
    }
}
