//! Process-wide session: the credential pair, who it belongs to, renewal,
//! and the sign-out signal the rest of the client listens for.
use futures::future::{BoxFuture, FutureExt, Shared};
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio::sync::watch;
use tracing::{info, instrument, warn};

use crate::api::AuthApi;
use crate::error::SyncError;
use crate::model::{Identity, Role, Session};
use crate::storage::{keys, LocalStorage};

static EMAIL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").expect("valid email regex"));

/// Latest authentication state. Watchers only ever see the newest value, so
/// a burst of failures produces a single sign-out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    SignedIn,
    SignedOut,
}

type RenewFuture = Shared<BoxFuture<'static, Result<String, SyncError>>>;

#[derive(Default)]
struct State {
    session: Option<Session>,
    /// Bumped on every replace or clear; a renewal started under an older
    /// epoch must not write into a newer session.
    epoch: u64,
}

struct Inner {
    state: RwLock<State>,
    auth: Arc<dyn AuthApi>,
    storage: Arc<dyn LocalStorage>,
    renewal: Mutex<Option<RenewFuture>>,
    persist_lock: tokio::sync::Mutex<()>,
    signal: watch::Sender<AuthState>,
}

/// Cheap to clone; every clone shares the one session.
#[derive(Clone)]
pub struct SessionStore {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionStore")
            .field("session", &self.snapshot())
            .finish_non_exhaustive()
    }
}

impl SessionStore {
    pub fn new(auth: Arc<dyn AuthApi>, storage: Arc<dyn LocalStorage>) -> Self {
        let (signal, _) = watch::channel(AuthState::SignedOut);
        Self {
            inner: Arc::new(Inner {
                state: RwLock::new(State::default()),
                auth,
                storage,
                renewal: Mutex::new(None),
                persist_lock: tokio::sync::Mutex::new(()),
                signal,
            }),
        }
    }

    /// Load persisted credentials, if any. Returns the restored identity.
    #[instrument(skip_all)]
    pub async fn restore(&self) -> Option<Identity> {
        let storage = &self.inner.storage;
        let mut values = Vec::with_capacity(keys::ALL.len());
        for key in keys::ALL {
            match storage.get(key).await {
                Ok(value) => values.push(value),
                Err(err) => {
                    warn!(?err, key, "failed to read persisted session; starting signed out");
                    return None;
                }
            }
        }
        let [access, refresh, role, username, email, user_id]: [Option<String>; 6] =
            values.try_into().ok()?;
        if access.is_none() && refresh.is_none() {
            return None;
        }

        let identity = Identity {
            user_id: user_id.and_then(|raw| raw.parse().ok()),
            username: username.unwrap_or_default(),
            email,
            role: Role::from(role.unwrap_or_default()),
        };
        self.replace(Some(Session {
            access_token: access,
            refresh_token: refresh,
            identity: identity.clone(),
        }));
        self.announce(AuthState::SignedIn);
        info!(username = %identity.username, role = %identity.role, "restored persisted session");
        Some(identity)
    }

    /// Replace every field at once. Readers see the new values immediately;
    /// persistence failures are logged only.
    pub async fn set_session(&self, session: Session) {
        self.replace(Some(session));
        self.announce(AuthState::SignedIn);
        self.persist().await;
    }

    /// Validate the credentials shape, call the login endpoint and install
    /// the resulting session.
    #[instrument(skip(self, password))]
    pub async fn login(&self, email: &str, password: &str) -> Result<Identity, SyncError> {
        let email = email.trim();
        if !EMAIL_RE.is_match(email) {
            return Err(SyncError::ValidationFailed(format!("invalid email address: {email}")));
        }
        if password.is_empty() {
            return Err(SyncError::ValidationFailed("password must be non-empty".into()));
        }

        let grant = self.inner.auth.login(email, password).await?;
        let session = grant.into_session();
        let identity = session.identity.clone();
        self.set_session(session).await;
        info!(username = %identity.username, role = %identity.role, "logged in");
        Ok(identity)
    }

    pub fn access_token(&self) -> Option<String> {
        self.read(|state| state.session.as_ref()?.access_token.clone())
    }

    pub fn identity(&self) -> Option<Identity> {
        self.read(|state| state.session.as_ref().map(|s| s.identity.clone()))
    }

    pub fn role(&self) -> Option<Role> {
        self.identity().map(|identity| identity.role)
    }

    pub fn snapshot(&self) -> Option<Session> {
        self.read(|state| state.session.clone())
    }

    /// True while any credential remains that could authorize a call.
    pub fn is_authenticated(&self) -> bool {
        self.read(|state| {
            state
                .session
                .as_ref()
                .is_some_and(|s| s.access_token.is_some() || s.refresh_token.is_some())
        })
    }

    pub fn subscribe(&self) -> watch::Receiver<AuthState> {
        self.inner.signal.subscribe()
    }

    /// Exchange the refresh token for a new access token.
    ///
    /// Concurrent callers share one in-flight exchange. A rejected or missing
    /// refresh token clears the whole session and yields `SessionExpired`;
    /// transport and 5xx failures are passed through and leave it intact.
    pub async fn renew(&self) -> Result<String, SyncError> {
        let shared = {
            let mut slot = self
                .inner
                .renewal
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            match slot.as_ref() {
                Some(in_flight) => in_flight.clone(),
                None => {
                    let store = self.clone();
                    let fut = async move { store.run_renewal().await }.boxed().shared();
                    *slot = Some(fut.clone());
                    fut
                }
            }
        };
        shared.await
    }

    /// Drop all credentials and identity, evict persisted keys and signal
    /// sign-out. Safe to call repeatedly.
    pub async fn clear(&self) {
        let was_signed_in = self.replace(None);
        self.announce(AuthState::SignedOut);
        self.persist().await;
        if was_signed_in {
            info!("session cleared");
        }
    }

    pub async fn logout(&self) {
        self.clear().await;
    }

    async fn run_renewal(&self) -> Result<String, SyncError> {
        let result = self.exchange_refresh().await;
        *self
            .inner
            .renewal
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = None;
        result
    }

    #[instrument(skip_all)]
    async fn exchange_refresh(&self) -> Result<String, SyncError> {
        let (refresh, epoch) = self.read(|state| {
            (
                state.session.as_ref().and_then(|s| s.refresh_token.clone()),
                state.epoch,
            )
        });
        let Some(refresh) = refresh else {
            warn!("no refresh token; session cannot be renewed");
            self.clear_if_epoch(epoch).await;
            return Err(SyncError::SessionExpired);
        };

        info!("renewing access token");
        match self.inner.auth.renew(&refresh).await {
            Ok(access) => {
                let applied = self.write(|state| match state.session.as_mut() {
                    Some(session)
                        if state.epoch == epoch
                            && session.refresh_token.as_deref() == Some(refresh.as_str()) =>
                    {
                        session.access_token = Some(access.clone());
                        true
                    }
                    _ => false,
                });
                if !applied {
                    warn!("session changed during renewal; discarding renewed token");
                    return self.access_token().ok_or(SyncError::SessionExpired);
                }
                self.persist().await;
                info!("access token renewed");
                Ok(access)
            }
            Err(err @ (SyncError::NetworkUnavailable(_) | SyncError::Server { .. })) => {
                warn!(?err, "token renewal did not complete; keeping session");
                Err(err)
            }
            Err(err) => {
                warn!(?err, "token renewal rejected; clearing session");
                self.clear_if_epoch(epoch).await;
                Err(SyncError::SessionExpired)
            }
        }
    }

    async fn clear_if_epoch(&self, epoch: u64) {
        let current = self.read(|state| state.epoch);
        if current == epoch {
            self.clear().await;
        }
    }

    /// Swap the in-memory session; returns whether one was present before.
    fn replace(&self, session: Option<Session>) -> bool {
        self.write(|state| {
            state.epoch += 1;
            std::mem::replace(&mut state.session, session).is_some()
        })
    }

    fn announce(&self, next: AuthState) {
        self.inner.signal.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }

    /// Write the current in-memory session to storage. Writers are
    /// serialized and always persist the latest state, so an older write can
    /// never land after a newer clear.
    async fn persist(&self) {
        let _guard = self.inner.persist_lock.lock().await;
        let entries: Vec<(&str, Option<String>)> = match self.snapshot() {
            Some(session) => vec![
                (keys::ACCESS, session.access_token),
                (keys::REFRESH, session.refresh_token),
                (keys::ROLE, Some(session.identity.role.as_str().to_string())),
                (keys::USERNAME, Some(session.identity.username)),
                (keys::EMAIL, session.identity.email),
                (keys::USER_ID, session.identity.user_id.map(|id| id.to_string())),
            ],
            None => keys::ALL.iter().map(|key| (*key, None)).collect(),
        };

        let storage = &self.inner.storage;
        for (key, value) in entries {
            let res = match value {
                Some(value) => storage.set(key, &value).await,
                None => storage.remove(key).await,
            };
            if let Err(err) = res {
                warn!(?err, key, "failed to persist session key");
            }
        }
    }

    fn read<R>(&self, f: impl FnOnce(&State) -> R) -> R {
        let guard = self
            .inner
            .state
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        f(&guard)
    }

    fn write<R>(&self, f: impl FnOnce(&mut State) -> R) -> R {
        let mut guard = self
            .inner
            .state
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }
}
