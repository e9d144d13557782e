//! Explicit session object standing in for the dashboard's ambient token.
//!
//! `AuthSession::init` loads a persisted credential, `teardown` clears it on
//! logout; the engine asks it for a bearer token before every REST call.

use std::{fmt, path::PathBuf, sync::Arc, time::Duration};

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use shared::{
    domain::Role,
    protocol::{AuthUser, LoginRequest, LoginResponse},
};
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

use crate::{
    error::{SyncError, SyncResult},
    rest::ensure_success,
};

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub token: String,
    pub user: AuthUser,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("token", &"<redacted>")
            .field("user", &self.user)
            .finish()
    }
}

impl From<LoginResponse> for Credentials {
    fn from(value: LoginResponse) -> Self {
        Self {
            token: value.token,
            user: value.user,
        }
    }
}

#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn load(&self) -> anyhow::Result<Option<Credentials>>;
    async fn save(&self, credentials: &Credentials) -> anyhow::Result<()>;
    async fn clear(&self) -> anyhow::Result<()>;
}

/// Credentials kept as a JSON file, e.g. under the user's config dir.
pub struct FileCredentialStore {
    path: PathBuf,
}

impl FileCredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl CredentialStore for FileCredentialStore {
    async fn load(&self) -> anyhow::Result<Option<Credentials>> {
        let raw = match tokio::fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        Ok(Some(serde_json::from_slice(&raw)?))
    }

    async fn save(&self, credentials: &Credentials) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&self.path, serde_json::to_vec_pretty(credentials)?).await?;
        Ok(())
    }

    async fn clear(&self) -> anyhow::Result<()> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

#[derive(Default)]
pub struct MemoryCredentialStore {
    slot: Mutex<Option<Credentials>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn load(&self) -> anyhow::Result<Option<Credentials>> {
        Ok(self.slot.lock().await.clone())
    }

    async fn save(&self, credentials: &Credentials) -> anyhow::Result<()> {
        *self.slot.lock().await = Some(credentials.clone());
        Ok(())
    }

    async fn clear(&self) -> anyhow::Result<()> {
        *self.slot.lock().await = None;
        Ok(())
    }
}

pub struct AuthSession {
    store: Arc<dyn CredentialStore>,
    current: RwLock<Option<Credentials>>,
}

impl AuthSession {
    pub fn new(store: Arc<dyn CredentialStore>) -> Self {
        Self {
            store,
            current: RwLock::new(None),
        }
    }

    /// Session with no persistence, optionally pre-signed-in.
    pub fn in_memory(credentials: Option<Credentials>) -> Self {
        Self {
            store: Arc::new(MemoryCredentialStore::new()),
            current: RwLock::new(credentials),
        }
    }

    /// Loads a persisted credential. An unreadable one is discarded rather
    /// than failing start-up; the user simply has to sign in again.
    pub async fn init(&self) -> bool {
        let loaded = match self.store.load().await {
            Ok(loaded) => loaded,
            Err(err) => {
                warn!("auth: discarding unreadable persisted credential: {err}");
                None
            }
        };
        let signed_in = loaded.is_some();
        if let Some(credentials) = &loaded {
            info!(
                user_id = credentials.user.id.0,
                role = %credentials.user.role,
                "auth: restored persisted session"
            );
        }
        *self.current.write().await = loaded;
        signed_in
    }

    pub async fn sign_in(&self, credentials: Credentials) -> anyhow::Result<()> {
        self.store.save(&credentials).await?;
        info!(
            user_id = credentials.user.id.0,
            role = %credentials.user.role,
            "auth: signed in"
        );
        *self.current.write().await = Some(credentials);
        Ok(())
    }

    /// Logout: forgets the in-memory credential and the persisted copy.
    pub async fn teardown(&self) -> anyhow::Result<()> {
        *self.current.write().await = None;
        self.store.clear().await?;
        info!("auth: session cleared");
        Ok(())
    }

    pub async fn bearer(&self) -> SyncResult<String> {
        self.current
            .read()
            .await
            .as_ref()
            .map(|credentials| credentials.token.clone())
            .ok_or(SyncError::AuthMissing)
    }

    pub async fn role(&self) -> Option<Role> {
        self.current
            .read()
            .await
            .as_ref()
            .map(|credentials| credentials.user.role)
    }

    pub async fn user(&self) -> Option<AuthUser> {
        self.current
            .read()
            .await
            .as_ref()
            .map(|credentials| credentials.user.clone())
    }

    pub async fn is_authenticated(&self) -> bool {
        self.current.read().await.is_some()
    }
}

/// Client for the auth service's login endpoint.
pub struct AuthClient {
    http: Client,
    auth_url: String,
}

impl AuthClient {
    pub fn new(auth_url: impl Into<String>, timeout: Duration) -> SyncResult<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| SyncError::Network(format!("failed to build http client: {err}")))?;
        Ok(Self {
            http,
            auth_url: auth_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub async fn login(&self, email: &str, password: &str) -> SyncResult<Credentials> {
        let response = self
            .http
            .post(format!("{}/login", self.auth_url))
            .json(&LoginRequest {
                email: email.to_string(),
                password: password.to_string(),
            })
            .send()
            .await?;
        let body: LoginResponse = ensure_success(response).await?.json().await?;
        Ok(body.into())
    }
}

#[cfg(test)]
#[path = "tests/auth_tests.rs"]
mod tests;
