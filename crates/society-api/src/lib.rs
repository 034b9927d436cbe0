use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

pub type UserId = String;
pub type Document = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Role {
    #[serde(rename = "EB")]
    Eb,
    #[serde(rename = "EC")]
    Ec,
    Core,
    Member,
}

impl Role {
    pub const ALL: [Role; 4] = [Role::Eb, Role::Ec, Role::Core, Role::Member];

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Eb => "EB",
            Role::Ec => "EC",
            Role::Core => "Core",
            Role::Member => "Member",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = SocietyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Role::ALL
            .into_iter()
            .find(|r| r.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| SocietyError::Validation(format!("unknown role: {s}")))
    }
}

/// Account record as verified by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub id: UserId,
    pub email: Option<String>,
}

/// Local projection of a stored profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub email: String,
    pub role: Role,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthState {
    SignedIn(Identity),
    SignedOut,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SetOptions {
    /// Merge top-level fields into an existing document instead of replacing it.
    pub merge: bool,
}

impl SetOptions {
    pub fn merge() -> Self {
        Self { merge: true }
    }
}

/// Backend session tokens, for callers that keep a session across processes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredSession {
    pub access_token: String,
    pub refresh_token: String,
    pub user_id: UserId,
    pub email: Option<String>,
    pub expires_at: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Memory,
    Supabase,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    pub kind: BackendKind,
    pub base_url: String,
    pub secret_ref: String,
    pub request_timeout_ms: u64,
    pub signup_on_invalid_credentials: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SocietyError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("account not found: {0}")]
    UserNotFound(String),
    #[error("authentication error: {0}")]
    Auth(String),
    #[error("connection error: {0}")]
    Connection(String),
    #[error("conflict error: {0}")]
    Conflict(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl SocietyError {
    pub fn is_user_not_found(&self) -> bool {
        matches!(self, SocietyError::UserNotFound(_))
    }
}

pub trait SecretStore: Send + Sync {
    fn get(&self, secret_ref: &str) -> Result<String, SocietyError>;
}

#[async_trait]
pub trait AuthBackend: Send + Sync {
    async fn sign_in_with_password(
        &self,
        email: &str,
        password: &str,
    ) -> Result<Identity, SocietyError>;

    async fn create_account(&self, email: &str, password: &str) -> Result<Identity, SocietyError>;

    async fn sign_out(&self) -> Result<(), SocietyError>;

    /// The receiver starts at the current state, so the first value acts as
    /// the initial notification.
    fn subscribe_auth_state(&self) -> watch::Receiver<AuthState>;

    fn export_session(&self) -> Option<StoredSession> {
        None
    }

    async fn restore_session(&self, _session: StoredSession) -> Result<(), SocietyError> {
        Ok(())
    }
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get_document(&self, collection: &str, id: &str)
    -> Result<Option<Document>, SocietyError>;

    async fn set_document(
        &self,
        collection: &str,
        id: &str,
        fields: Document,
        options: SetOptions,
    ) -> Result<(), SocietyError>;
}

pub trait Backend: AuthBackend + DocumentStore {}

impl<T: AuthBackend + DocumentStore + ?Sized> Backend for T {}

pub trait ConnectorFactory: Send + Sync {
    fn build(
        &self,
        cfg: &BackendConfig,
        secrets: &dyn SecretStore,
    ) -> Result<Arc<dyn Backend>, SocietyError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_labels_round_trip_through_serde() {
        let json = serde_json::to_string(&Role::Eb).unwrap();
        assert_eq!(json, "\"EB\"");
        let role: Role = serde_json::from_str("\"Member\"").unwrap();
        assert_eq!(role, Role::Member);
    }

    #[test]
    fn role_parses_case_insensitively() {
        assert_eq!("ec".parse::<Role>().unwrap(), Role::Ec);
        assert_eq!(" CORE ".parse::<Role>().unwrap(), Role::Core);
        assert!(matches!(
            "admin".parse::<Role>(),
            Err(SocietyError::Validation(_))
        ));
    }

    #[test]
    fn only_user_not_found_is_classified_as_missing_account() {
        assert!(SocietyError::UserNotFound("a".into()).is_user_not_found());
        assert!(!SocietyError::Auth("a".into()).is_user_not_found());
    }
}
