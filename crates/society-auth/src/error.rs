//! Error types.

use society_api::{Role, SocietyError};
use thiserror::Error;

/// Crate result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by this crate.
#[derive(Debug, Error)]
pub enum Error {
    /// The email is not on the allowlist for the requested role. Raised
    /// before any backend call.
    #[error("Email {email} is not authorized for {role} role. Please use an authorized email.")]
    Unauthorized { email: String, role: Role },

    /// A backend call failed; the backend's error is passed through as-is.
    #[error(transparent)]
    Backend(#[from] SocietyError),

    /// `current()` was called with no session in scope.
    #[error("session accessed outside of a session scope")]
    OutsideScope,

    /// The session state channel closed before the awaited state was reached.
    #[error("session listener stopped")]
    ListenerStopped,
}
