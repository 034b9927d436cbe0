//! society-auth
//!
//! Role-gated login sessions on top of a managed auth backend.
//!
//! - **[`SessionManager`]** tracks the signed-in [`User`](society_api::User)
//!   by listening to the backend's auth-state notifications and loading the
//!   matching profile document.
//! - **`login`** checks the email against the role allowlist, signs in
//!   (creating the account when the backend has none), and merges the
//!   profile document.
//! - **[`scope`] / [`current`]** make a session reachable from code that is
//!   not handed one explicitly.
//!
//! ## Quick start
//! ```no_run
//! use std::sync::Arc;
//!
//! use society_api::Role;
//! use society_auth::{SessionManager, SessionOptions};
//! use society_connectors::MemoryBackend;
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let session = SessionManager::start(Arc::new(MemoryBackend::new()), SessionOptions::default());
//! session.wait_until_loaded().await?;
//!
//! session
//!     .login("member@society.com", "pw1234", Role::Member, Some("Alice"))
//!     .await?;
//!
//! let mut updates = session.subscribe();
//! let snapshot = updates.wait_for(|s| s.current_user.is_some()).await?.clone();
//! println!("signed in as {:?}", snapshot.current_user);
//! # Ok(()) }
//! ```

#![forbid(unsafe_code)]

mod error;
pub mod profile;
mod scope;
mod session;

pub use error::{Error, Result};
pub use scope::{current, scope};
pub use session::{SessionManager, SessionOptions, SessionSnapshot};
