//! Task-scoped access to a [`SessionManager`].
//!
//! Code that cannot be handed a session explicitly looks it up with
//! [`current`], which fails with [`Error::OutsideScope`] unless it runs
//! inside [`scope`].

use std::future::Future;

use crate::{Error, Result, SessionManager};

tokio::task_local! {
    static CURRENT_SESSION: SessionManager;
}

/// Runs `f` with `session` installed as the current session.
pub async fn scope<F: Future>(session: SessionManager, f: F) -> F::Output {
    CURRENT_SESSION.scope(session, f).await
}

/// The session installed by the enclosing [`scope`].
pub fn current() -> Result<SessionManager> {
    CURRENT_SESSION
        .try_with(SessionManager::clone)
        .map_err(|_| Error::OutsideScope)
}
