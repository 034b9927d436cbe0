//! Backend session kept in the OS keychain between invocations.

use society_api::StoredSession;

const KEYRING_SERVICE: &str = "society";
const KEYRING_SESSION_USER: &str = "session";

fn entry() -> anyhow::Result<keyring::Entry> {
    keyring::Entry::new(KEYRING_SERVICE, KEYRING_SESSION_USER)
        .map_err(|e| anyhow::anyhow!("Keychain error: {e}"))
}

/// Missing or unreadable entries read as no session.
pub fn load_session() -> Option<StoredSession> {
    let json = entry().ok()?.get_password().ok()?;
    serde_json::from_str(&json).ok()
}

pub fn save_session(session: &StoredSession) -> anyhow::Result<()> {
    let json = serde_json::to_string(session)?;
    entry()?
        .set_password(&json)
        .map_err(|e| anyhow::anyhow!("Failed to store session in keychain: {e}"))
}

pub fn delete_session() -> anyhow::Result<()> {
    match entry()?.delete_credential() {
        Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
        Err(e) => Err(anyhow::anyhow!("Failed to remove session from keychain: {e}")),
    }
}
