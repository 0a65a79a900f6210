use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::{Error, Result};

/// A bearer token as handed out to workers.
///
/// `epoch` increases by one on every successful refresh; callers hand the
/// epoch of a rejected token back to [`CredentialProvider::invalidate_and_refresh`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub token: String,
    pub obtained_at: DateTime<Utc>,
    pub epoch: u64,
}

/// External mechanism that produces bearer tokens.
pub trait TokenSource: Send + Sync {
    fn current_token(&self) -> Result<(String, DateTime<Utc>)>;

    fn refresh<'a>(&'a self) -> Pin<Box<dyn Future<Output = Result<String>> + Send + 'a>>;
}

#[derive(Debug)]
struct CredentialState {
    credential: Credential,
    failure: Option<String>,
}

/// Holds the run's token and coalesces refreshes.
///
/// A refresh holds the write lock for its whole duration, so `get` blocks
/// only while one is in flight. Callers that saw an older epoch get the
/// refreshed token instead of triggering another refresh.
pub struct CredentialProvider {
    source: Arc<dyn TokenSource>,
    state: RwLock<CredentialState>,
}

impl CredentialProvider {
    pub fn new(source: Arc<dyn TokenSource>) -> Result<Self> {
        let (token, obtained_at) = source.current_token()?;
        if token.trim().is_empty() {
            return Err(Error::credential("token source returned an empty token"));
        }
        Ok(Self {
            source,
            state: RwLock::new(CredentialState {
                credential: Credential {
                    token,
                    obtained_at,
                    epoch: 0,
                },
                failure: None,
            }),
        })
    }

    pub async fn get(&self) -> Result<Credential> {
        let state = self.state.read().await;
        if let Some(message) = &state.failure {
            return Err(Error::credential(message.clone()));
        }
        Ok(state.credential.clone())
    }

    /// Replaces the token whose epoch was `seen_epoch`.
    ///
    /// Runs at most one underlying refresh per epoch. A failed refresh is
    /// sticky: every later call (and every `get`) returns the same error.
    pub async fn invalidate_and_refresh(&self, seen_epoch: u64) -> Result<Credential> {
        let mut state = self.state.write().await;
        if let Some(message) = &state.failure {
            return Err(Error::credential(message.clone()));
        }
        if state.credential.epoch != seen_epoch {
            return Ok(state.credential.clone());
        }

        match self.source.refresh().await {
            Ok(token) if !token.trim().is_empty() => {
                state.credential = Credential {
                    token,
                    obtained_at: Utc::now(),
                    epoch: seen_epoch + 1,
                };
                info!(
                    event = "credential.refresh",
                    epoch = state.credential.epoch,
                    "credential.refresh"
                );
                Ok(state.credential.clone())
            }
            Ok(_) => {
                let message = "token refresh returned an empty token".to_string();
                warn!(event = "credential.refresh_failed", error = %message, "credential.refresh_failed");
                state.failure = Some(message.clone());
                Err(Error::credential(message))
            }
            Err(e) => {
                let message = match e {
                    Error::Credential { message } => message,
                    other => other.to_string(),
                };
                warn!(event = "credential.refresh_failed", error = %message, "credential.refresh_failed");
                state.failure = Some(message.clone());
                Err(Error::credential(message))
            }
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenRecord {
    access_token: Option<String>,
}

/// Reads `{"accessToken": "..."}` written by the out-of-band login tool.
///
/// Refresh re-reads the file, picking up whatever the tool wrote last.
#[derive(Debug, Clone)]
pub struct FileTokenSource {
    path: PathBuf,
}

impl FileTokenSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn read_token(&self) -> Result<String> {
        let text = std::fs::read_to_string(&self.path).map_err(|e| {
            Error::credential(format!("token file read failed: {}: {e}", self.path.display()))
        })?;
        let record: TokenRecord = serde_json::from_str(&text).map_err(|e| {
            Error::credential(format!("token file invalid: {}: {e}", self.path.display()))
        })?;
        record
            .access_token
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| {
                Error::credential(format!(
                    "token file has no accessToken: {}",
                    self.path.display()
                ))
            })
    }
}

impl TokenSource for FileTokenSource {
    fn current_token(&self) -> Result<(String, DateTime<Utc>)> {
        let token = self.read_token()?;
        let obtained_at = std::fs::metadata(&self.path)
            .and_then(|m| m.modified())
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());
        Ok((token, obtained_at))
    }

    fn refresh<'a>(&'a self) -> Pin<Box<dyn Future<Output = Result<String>> + Send + 'a>> {
        Box::pin(async move { self.read_token() })
    }
}

/// A fixed token (e.g. from `AEM_TOKEN`); it cannot be refreshed.
#[derive(Debug, Clone)]
pub struct StaticTokenSource {
    token: String,
    obtained_at: DateTime<Utc>,
}

impl StaticTokenSource {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            obtained_at: Utc::now(),
        }
    }
}

impl TokenSource for StaticTokenSource {
    fn current_token(&self) -> Result<(String, DateTime<Utc>)> {
        Ok((self.token.clone(), self.obtained_at))
    }

    fn refresh<'a>(&'a self) -> Pin<Box<dyn Future<Output = Result<String>> + Send + 'a>> {
        Box::pin(async {
            Err(Error::credential(
                "static token was rejected and cannot be refreshed",
            ))
        })
    }
}
