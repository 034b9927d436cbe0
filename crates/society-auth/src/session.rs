//! The session manager: current user, loading flag, login and logout.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use society_api::{AuthState, Backend, Identity, Role, SetOptions, User};
use society_core::{Allowlist, CreatedAtPolicy, DEFAULT_PROFILES_COLLECTION, Settings};
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::profile;
use crate::{Error, Result};

/// Read-only view of the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub current_user: Option<User>,
    /// True until the first auth-state notification has been processed.
    pub loading: bool,
}

impl Default for SessionSnapshot {
    fn default() -> Self {
        Self {
            current_user: None,
            loading: true,
        }
    }
}

/// How a [`SessionManager`] gates and records logins.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub allowlist: Allowlist,
    pub profiles_collection: String,
    pub created_at: CreatedAtPolicy,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            allowlist: Allowlist::builtin().clone(),
            profiles_collection: DEFAULT_PROFILES_COLLECTION.to_string(),
            created_at: CreatedAtPolicy::default(),
        }
    }
}

impl From<&Settings> for SessionOptions {
    fn from(settings: &Settings) -> Self {
        Self {
            allowlist: settings.allowlist.clone(),
            profiles_collection: settings.session.profiles_collection.clone(),
            created_at: settings.session.created_at,
        }
    }
}

/// Holds the signed-in user and exposes login/logout.
///
/// Cloning is cheap and every clone shares the same state. The auth-state
/// listener is released when [`shutdown`](Self::shutdown) is called or the
/// last clone is dropped.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

struct Inner {
    backend: Arc<dyn Backend>,
    options: SessionOptions,
    /// The listener task owns the sender, so the channel closes when it ends.
    state: watch::Receiver<SessionSnapshot>,
    refresh: Arc<Notify>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        let slot = self
            .listener
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(handle) = slot.take() {
            handle.abort();
        }
    }
}

impl SessionManager {
    /// Subscribes to the backend's auth state and starts the listener.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(backend: Arc<dyn Backend>, options: SessionOptions) -> Self {
        let (tx, state) = watch::channel(SessionSnapshot::default());
        let refresh = Arc::new(Notify::new());

        let listener = tokio::spawn(listen(
            Arc::clone(&backend),
            options.profiles_collection.clone(),
            backend.subscribe_auth_state(),
            tx,
            Arc::clone(&refresh),
        ));

        Self {
            inner: Arc::new(Inner {
                backend,
                options,
                state,
                refresh,
                listener: Mutex::new(Some(listener)),
            }),
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.inner.state.borrow().clone()
    }

    pub fn current_user(&self) -> Option<User> {
        self.inner.state.borrow().current_user.clone()
    }

    pub fn is_loading(&self) -> bool {
        self.inner.state.borrow().loading
    }

    /// Receiver that observes every snapshot change.
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        let mut rx = self.inner.state.clone();
        rx.borrow_and_update();
        rx
    }

    /// Resolves once the first auth-state notification has been processed.
    ///
    /// Fails with [`Error::ListenerStopped`] if the listener ends, or has
    /// already ended, while the session is still loading.
    pub async fn wait_until_loaded(&self) -> Result<SessionSnapshot> {
        let mut rx = self.subscribe();
        let snapshot = rx
            .wait_for(|s| !s.loading)
            .await
            .map_err(|_| Error::ListenerStopped)?;
        Ok(snapshot.clone())
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.inner.backend
    }

    pub fn options(&self) -> &SessionOptions {
        &self.inner.options
    }

    /// Signs in under `role`, creating the account on first use, and records
    /// the profile.
    ///
    /// The snapshot is updated by the listener, not by this call.
    pub async fn login(
        &self,
        email: &str,
        password: &str,
        role: Role,
        name: Option<&str>,
    ) -> Result<()> {
        if !self.inner.options.allowlist.permits(email, role) {
            warn!(email, %role, "login rejected by allowlist");
            return Err(Error::Unauthorized {
                email: email.to_string(),
                role,
            });
        }

        let identity = self.sign_in_or_create(email, password).await?;
        self.upsert_profile(&identity, email, role, name).await?;

        // The backend's sign-in notification may have been handled before the
        // profile existed.
        self.inner.refresh.notify_one();
        info!(user_id = %identity.id, %role, "login complete");
        Ok(())
    }

    pub async fn logout(&self) -> Result<()> {
        self.inner.backend.sign_out().await?;
        Ok(())
    }

    /// Stops listening for auth-state changes. In-flight logins are not
    /// cancelled.
    pub fn shutdown(&self) {
        let mut slot = self
            .inner
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(handle) = slot.take() {
            debug!("session listener stopped");
            handle.abort();
        }
    }

    async fn sign_in_or_create(&self, email: &str, password: &str) -> Result<Identity> {
        let backend = &self.inner.backend;
        match backend.sign_in_with_password(email, password).await {
            Ok(identity) => Ok(identity),
            Err(e) if e.is_user_not_found() => {
                info!(email, "no account yet, creating one");
                backend.create_account(email, password).await?;
                Ok(backend.sign_in_with_password(email, password).await?)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn upsert_profile(
        &self,
        identity: &Identity,
        email: &str,
        role: Role,
        name: Option<&str>,
    ) -> Result<()> {
        let backend = &self.inner.backend;
        let collection = self.inner.options.profiles_collection.as_str();

        let created_at = match self.inner.options.created_at {
            CreatedAtPolicy::OverwriteOnLogin => Some(Utc::now()),
            CreatedAtPolicy::PreserveExisting => {
                let existing = backend.get_document(collection, &identity.id).await?;
                match existing {
                    Some(doc) if doc.contains_key(profile::FIELD_CREATED_AT) => None,
                    _ => Some(Utc::now()),
                }
            }
        };

        let fields = profile::profile_fields(identity, email, role, name, created_at);
        backend
            .set_document(collection, &identity.id, fields, SetOptions::merge())
            .await?;
        Ok(())
    }
}

impl fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionManager")
            .field("snapshot", &self.snapshot())
            .field("options", &self.inner.options)
            .finish_non_exhaustive()
    }
}

async fn listen(
    backend: Arc<dyn Backend>,
    collection: String,
    mut auth: watch::Receiver<AuthState>,
    state: watch::Sender<SessionSnapshot>,
    refresh: Arc<Notify>,
) {
    loop {
        let current = auth.borrow_and_update().clone();
        let current_user = match current {
            AuthState::SignedOut => None,
            AuthState::SignedIn(identity) => {
                load_user(backend.as_ref(), &collection, &identity).await
            }
        };
        state.send_modify(|s| {
            s.current_user = current_user;
            s.loading = false;
        });

        tokio::select! {
            changed = auth.changed() => {
                if changed.is_err() {
                    debug!("auth-state stream closed");
                    break;
                }
            }
            () = refresh.notified() => {}
        }
    }
}

/// Fetch failures and malformed documents count as "no profile".
async fn load_user(backend: &dyn Backend, collection: &str, identity: &Identity) -> Option<User> {
    match backend.get_document(collection, &identity.id).await {
        Ok(Some(doc)) => match profile::user_from_document(identity, doc) {
            Ok(user) => Some(user),
            Err(e) => {
                warn!(user_id = %identity.id, error = %e, "malformed profile document");
                None
            }
        },
        Ok(None) => {
            debug!(user_id = %identity.id, "no profile document");
            None
        }
        Err(e) => {
            warn!(user_id = %identity.id, error = %e, "profile fetch failed");
            None
        }
    }
}
