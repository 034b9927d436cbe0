//! In-process backend: accounts, profile documents and auth state held in memory.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use society_api::{
    AuthBackend, AuthState, Document, DocumentStore, Identity, SetOptions, SocietyError,
};
use tokio::sync::watch;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendOp {
    SignIn,
    CreateAccount,
    SignOut,
    GetDocument,
    SetDocument,
}

/// One call received by a [`MemoryBackend`], in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendCall {
    SignIn { email: String },
    CreateAccount { email: String },
    SignOut,
    GetDocument { collection: String, id: String },
    SetDocument { collection: String, id: String, merge: bool },
}

impl BackendCall {
    pub fn op(&self) -> BackendOp {
        match self {
            BackendCall::SignIn { .. } => BackendOp::SignIn,
            BackendCall::CreateAccount { .. } => BackendOp::CreateAccount,
            BackendCall::SignOut => BackendOp::SignOut,
            BackendCall::GetDocument { .. } => BackendOp::GetDocument,
            BackendCall::SetDocument { .. } => BackendOp::SetDocument,
        }
    }
}

struct Account {
    id: String,
    email: String,
    password: String,
}

impl Account {
    fn identity(&self) -> Identity {
        Identity {
            id: self.id.clone(),
            email: Some(self.email.clone()),
        }
    }
}

#[derive(Default)]
struct MemoryState {
    accounts: HashMap<String, Account>,
    documents: HashMap<(String, String), Document>,
    calls: Vec<BackendCall>,
    failures: HashMap<BackendOp, SocietyError>,
}

impl MemoryState {
    fn record(&mut self, call: BackendCall) -> Result<(), SocietyError> {
        let op = call.op();
        self.calls.push(call);
        match self.failures.remove(&op) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

pub struct MemoryBackend {
    state: Mutex<MemoryState>,
    auth_state: watch::Sender<AuthState>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        let (auth_state, _rx) = watch::channel(AuthState::SignedOut);
        Self {
            state: Mutex::new(MemoryState::default()),
            auth_state,
        }
    }

    /// Seeds an account without signing it in or journaling a call.
    pub fn add_account(&self, email: &str, password: &str) -> Identity {
        let mut state = self.inspect();
        let key = email.to_lowercase();
        let account = state.accounts.entry(key.clone()).or_insert_with(|| Account {
            id: uuid::Uuid::new_v4().to_string(),
            email: key,
            password: password.to_string(),
        });
        account.identity()
    }

    /// Makes the next call of kind `op` fail with `err`.
    pub fn fail_next(&self, op: BackendOp, err: SocietyError) {
        self.inspect().failures.insert(op, err);
    }

    pub fn calls(&self) -> Vec<BackendCall> {
        self.inspect().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.inspect().calls.clear();
    }

    pub fn account_count(&self) -> usize {
        self.inspect().accounts.len()
    }

    pub fn document(&self, collection: &str, id: &str) -> Option<Document> {
        self.inspect()
            .documents
            .get(&(collection.to_string(), id.to_string()))
            .cloned()
    }

    /// Pushes an auth-state notification as if the backend observed it.
    pub fn emit(&self, state: AuthState) {
        self.auth_state.send_replace(state);
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>, SocietyError> {
        self.state
            .lock()
            .map_err(|_| SocietyError::Internal("memory backend state poisoned".to_string()))
    }

    fn inspect(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl AuthBackend for MemoryBackend {
    async fn sign_in_with_password(
        &self,
        email: &str,
        password: &str,
    ) -> Result<Identity, SocietyError> {
        let identity = {
            let mut state = self.lock()?;
            state.record(BackendCall::SignIn {
                email: email.to_string(),
            })?;
            let account = state
                .accounts
                .get(&email.to_lowercase())
                .ok_or_else(|| SocietyError::UserNotFound(email.to_string()))?;
            if account.password != password {
                return Err(SocietyError::Auth("invalid password".to_string()));
            }
            account.identity()
        };

        info!(user_id = %identity.id, "signed in");
        self.auth_state
            .send_replace(AuthState::SignedIn(identity.clone()));
        Ok(identity)
    }

    async fn create_account(&self, email: &str, password: &str) -> Result<Identity, SocietyError> {
        let identity = {
            let mut state = self.lock()?;
            state.record(BackendCall::CreateAccount {
                email: email.to_string(),
            })?;
            let key = email.to_lowercase();
            if !key.contains('@') {
                return Err(SocietyError::Validation(format!("invalid email: {email}")));
            }
            if password.is_empty() {
                return Err(SocietyError::Validation("password must not be empty".to_string()));
            }
            if state.accounts.contains_key(&key) {
                return Err(SocietyError::Conflict(format!(
                    "account already exists: {email}"
                )));
            }
            let account = Account {
                id: uuid::Uuid::new_v4().to_string(),
                email: key.clone(),
                password: password.to_string(),
            };
            let identity = account.identity();
            state.accounts.insert(key, account);
            identity
        };

        info!(user_id = %identity.id, "account created");
        self.auth_state
            .send_replace(AuthState::SignedIn(identity.clone()));
        Ok(identity)
    }

    async fn sign_out(&self) -> Result<(), SocietyError> {
        self.lock()?.record(BackendCall::SignOut)?;
        info!("signed out");
        self.auth_state.send_replace(AuthState::SignedOut);
        Ok(())
    }

    fn subscribe_auth_state(&self) -> watch::Receiver<AuthState> {
        self.auth_state.subscribe()
    }
}

#[async_trait]
impl DocumentStore for MemoryBackend {
    async fn get_document(
        &self,
        collection: &str,
        id: &str,
    ) -> Result<Option<Document>, SocietyError> {
        let mut state = self.lock()?;
        state.record(BackendCall::GetDocument {
            collection: collection.to_string(),
            id: id.to_string(),
        })?;
        Ok(state
            .documents
            .get(&(collection.to_string(), id.to_string()))
            .cloned())
    }

    async fn set_document(
        &self,
        collection: &str,
        id: &str,
        fields: Document,
        options: SetOptions,
    ) -> Result<(), SocietyError> {
        let mut state = self.lock()?;
        state.record(BackendCall::SetDocument {
            collection: collection.to_string(),
            id: id.to_string(),
            merge: options.merge,
        })?;
        debug!(collection, id, merge = options.merge, "document write");

        let doc = state
            .documents
            .entry((collection.to_string(), id.to_string()))
            .or_default();
        if !options.merge {
            doc.clear();
        }
        doc.extend(fields);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(value: serde_json::Value) -> Document {
        match value {
            serde_json::Value::Object(map) => map,
            _ => Document::new(),
        }
    }

    #[tokio::test]
    async fn sign_in_reports_missing_accounts() {
        let backend = MemoryBackend::new();
        let err = backend
            .sign_in_with_password("eb@society.com", "secret1")
            .await
            .unwrap_err();
        assert!(err.is_user_not_found());
    }

    #[tokio::test]
    async fn create_then_sign_in_ignores_email_case() {
        let backend = MemoryBackend::new();
        let created = backend
            .create_account("EB@Society.com", "secret1")
            .await
            .unwrap();
        assert_eq!(created.email.as_deref(), Some("eb@society.com"));

        let signed_in = backend
            .sign_in_with_password("eb@society.com", "secret1")
            .await
            .unwrap();
        assert_eq!(signed_in, created);

        let err = backend
            .sign_in_with_password("eb@society.com", "wrong-pw")
            .await
            .unwrap_err();
        assert!(matches!(err, SocietyError::Auth(_)));
    }

    #[tokio::test]
    async fn short_passwords_are_accepted_but_empty_ones_are_not() {
        let backend = MemoryBackend::new();
        backend.create_account("member@society.com", "pw123").await.unwrap();
        assert_eq!(backend.account_count(), 1);

        let err = backend.create_account("member1@society.com", "").await.unwrap_err();
        assert!(matches!(err, SocietyError::Validation(_)));
        assert_eq!(backend.account_count(), 1);
    }

    #[tokio::test]
    async fn duplicate_accounts_conflict() {
        let backend = MemoryBackend::new();
        backend.add_account("ec@society.com", "secret1");
        let err = backend
            .create_account("ec@society.com", "secret1")
            .await
            .unwrap_err();
        assert!(matches!(err, SocietyError::Conflict(_)));
    }

    #[tokio::test]
    async fn auth_state_follows_sign_in_and_out() {
        let backend = MemoryBackend::new();
        let identity = backend.add_account("core@society.com", "secret1");
        let rx = backend.subscribe_auth_state();
        assert_eq!(*rx.borrow(), AuthState::SignedOut);

        backend
            .sign_in_with_password("core@society.com", "secret1")
            .await
            .unwrap();
        assert_eq!(*rx.borrow(), AuthState::SignedIn(identity));

        backend.sign_out().await.unwrap();
        assert_eq!(*rx.borrow(), AuthState::SignedOut);
    }

    #[tokio::test]
    async fn merge_keeps_untouched_fields() {
        let backend = MemoryBackend::new();
        backend
            .set_document(
                "users",
                "u1",
                fields(json!({"name": "A", "createdAt": "t0"})),
                SetOptions::merge(),
            )
            .await
            .unwrap();
        backend
            .set_document("users", "u1", fields(json!({"name": "B"})), SetOptions::merge())
            .await
            .unwrap();
        let doc = backend.document("users", "u1").unwrap();
        assert_eq!(doc["name"], "B");
        assert_eq!(doc["createdAt"], "t0");

        backend
            .set_document("users", "u1", fields(json!({"role": "EB"})), SetOptions::default())
            .await
            .unwrap();
        let doc = backend.document("users", "u1").unwrap();
        assert_eq!(doc.len(), 1);
        assert_eq!(doc["role"], "EB");
    }

    #[tokio::test]
    async fn injected_failures_fire_once_and_are_journaled() {
        let backend = MemoryBackend::new();
        backend.fail_next(
            BackendOp::GetDocument,
            SocietyError::Connection("offline".to_string()),
        );

        let err = backend.get_document("users", "u1").await.unwrap_err();
        assert_eq!(err, SocietyError::Connection("offline".to_string()));
        assert!(backend.get_document("users", "u1").await.unwrap().is_none());
        assert_eq!(backend.calls().len(), 2);
        assert!(backend.calls().iter().all(|c| c.op() == BackendOp::GetDocument));
    }
}
