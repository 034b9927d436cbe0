//! Supabase backend: GoTrue for accounts and sessions, PostgREST for profile rows.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use society_api::{
    AuthBackend, AuthState, BackendConfig, Document, DocumentStore, Identity, SetOptions,
    SocietyError, StoredSession,
};
use tokio::sync::watch;
use tracing::{debug, info};

/// Sessions this close to expiry are refreshed when restored.
const REFRESH_MARGIN_SECS: u64 = 30;

pub struct SupabaseBackend {
    base_url: String,
    anon_key: String,
    http: Client,
    signup_on_invalid_credentials: bool,
    session: Mutex<Option<StoredSession>>,
    auth_state: watch::Sender<AuthState>,
}

impl SupabaseBackend {
    pub fn new(cfg: &BackendConfig, anon_key: String) -> Result<Self, SocietyError> {
        let http = Client::builder()
            .timeout(Duration::from_millis(cfg.request_timeout_ms))
            .build()
            .map_err(|e| SocietyError::Internal(format!("failed to build HTTP client: {e}")))?;
        let (auth_state, _rx) = watch::channel(AuthState::SignedOut);
        Ok(Self {
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            anon_key,
            http,
            signup_on_invalid_credentials: cfg.signup_on_invalid_credentials,
            session: Mutex::new(None),
            auth_state,
        })
    }

    // ── Auth endpoints ──────────────────────────────────────────────────

    async fn token_grant(
        &self,
        grant_type: &str,
        body: Value,
    ) -> Result<AuthTokenResponse, SocietyError> {
        let url = format!("{}/auth/v1/token?grant_type={grant_type}", self.base_url);
        debug!(grant_type, "token request");
        let resp = self
            .http
            .post(&url)
            .header("apikey", &self.anon_key)
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;
        let resp = self.check(resp).await?;
        resp.json().await.map_err(decode_error)
    }

    async fn signup(&self, email: &str, password: &str) -> Result<SignupOutcome, SocietyError> {
        let url = format!("{}/auth/v1/signup", self.base_url);
        let resp = self
            .http
            .post(&url)
            .header("apikey", &self.anon_key)
            .json(&serde_json::json!({ "email": email, "password": password }))
            .send()
            .await
            .map_err(transport_error)?;
        let resp = self.check(resp).await?;
        let body: Value = resp.json().await.map_err(decode_error)?;
        parse_signup_response(body)
    }

    async fn revoke(&self, access_token: &str) -> Result<(), SocietyError> {
        let url = format!("{}/auth/v1/logout", self.base_url);
        let resp = self
            .http
            .post(&url)
            .header("apikey", &self.anon_key)
            .header("Authorization", format!("Bearer {access_token}"))
            .send()
            .await
            .map_err(transport_error)?;
        self.check(resp).await.map(|_| ())
    }

    fn install(&self, token: AuthTokenResponse) -> Identity {
        let identity = token.user.identity();
        let session = StoredSession {
            access_token: token.access_token,
            refresh_token: token.refresh_token,
            user_id: identity.id.clone(),
            email: identity.email.clone(),
            expires_at: Some(now_secs() + token.expires_in),
        };
        *self.slot() = Some(session);
        info!(user_id = %identity.id, "signed in");
        self.auth_state
            .send_replace(AuthState::SignedIn(identity.clone()));
        identity
    }

    fn slot(&self) -> MutexGuard<'_, Option<StoredSession>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ── PostgREST ───────────────────────────────────────────────────────

    fn rest(&self, builder: RequestBuilder) -> RequestBuilder {
        let bearer = self
            .slot()
            .as_ref()
            .map_or_else(|| self.anon_key.clone(), |s| s.access_token.clone());
        builder
            .header("apikey", &self.anon_key)
            .header("Authorization", format!("Bearer {bearer}"))
    }

    async fn check(&self, resp: Response) -> Result<Response, SocietyError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(classify_error(status, &body, self.signup_on_invalid_credentials))
    }
}

#[async_trait]
impl AuthBackend for SupabaseBackend {
    async fn sign_in_with_password(
        &self,
        email: &str,
        password: &str,
    ) -> Result<Identity, SocietyError> {
        let token = self
            .token_grant(
                "password",
                serde_json::json!({ "email": email, "password": password }),
            )
            .await?;
        Ok(self.install(token))
    }

    async fn create_account(&self, email: &str, password: &str) -> Result<Identity, SocietyError> {
        match self.signup(email, password).await? {
            SignupOutcome::Session(token) => Ok(self.install(*token)),
            // Email confirmation pending: the account exists but nobody is signed in.
            SignupOutcome::Pending(user) => {
                info!(user_id = %user.id, "account created, confirmation pending");
                Ok(user.identity())
            }
        }
    }

    async fn sign_out(&self) -> Result<(), SocietyError> {
        let current = self.slot().clone();
        if let Some(session) = current {
            self.revoke(&session.access_token).await?;
        }
        *self.slot() = None;
        info!("signed out");
        self.auth_state.send_replace(AuthState::SignedOut);
        Ok(())
    }

    fn subscribe_auth_state(&self) -> watch::Receiver<AuthState> {
        self.auth_state.subscribe()
    }

    fn export_session(&self) -> Option<StoredSession> {
        self.slot().clone()
    }

    async fn restore_session(&self, session: StoredSession) -> Result<(), SocietyError> {
        if needs_refresh(session.expires_at, now_secs()) {
            debug!(user_id = %session.user_id, "stored session expiring, refreshing");
            let token = self
                .token_grant(
                    "refresh_token",
                    serde_json::json!({ "refresh_token": session.refresh_token }),
                )
                .await?;
            self.install(token);
            return Ok(());
        }

        let identity = Identity {
            id: session.user_id.clone(),
            email: session.email.clone(),
        };
        *self.slot() = Some(session);
        self.auth_state.send_replace(AuthState::SignedIn(identity));
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for SupabaseBackend {
    async fn get_document(
        &self,
        collection: &str,
        id: &str,
    ) -> Result<Option<Document>, SocietyError> {
        let url = format!("{}/rest/v1/{collection}", self.base_url);
        let resp = self
            .rest(self.http.get(&url))
            .query(&[("id", format!("eq.{id}")), ("select", "*".to_string())])
            .send()
            .await
            .map_err(transport_error)?;
        let resp = self.check(resp).await?;
        let rows: Vec<Document> = resp.json().await.map_err(decode_error)?;
        Ok(rows.into_iter().next())
    }

    async fn set_document(
        &self,
        collection: &str,
        id: &str,
        mut fields: Document,
        options: SetOptions,
    ) -> Result<(), SocietyError> {
        fields.insert("id".to_string(), Value::String(id.to_string()));
        let url = format!("{}/rest/v1/{collection}", self.base_url);

        // A merge upsert only touches the columns present in the payload; PUT
        // replaces the whole row.
        let request = if options.merge {
            self.rest(self.http.post(&url))
                .query(&[("on_conflict", "id")])
                .header("Prefer", "resolution=merge-duplicates,return=minimal")
        } else {
            self.rest(self.http.put(&url))
                .query(&[("id", format!("eq.{id}"))])
                .header("Prefer", "return=minimal")
        };

        debug!(collection, id, merge = options.merge, "document write");
        let resp = request
            .json(&fields)
            .send()
            .await
            .map_err(transport_error)?;
        self.check(resp).await.map(|_| ())
    }
}

// ─── Wire types ─────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct AuthTokenResponse {
    access_token: String,
    refresh_token: String,
    expires_in: u64,
    user: AuthUser,
}

#[derive(Debug, Deserialize)]
struct AuthUser {
    id: String,
    email: Option<String>,
}

impl AuthUser {
    fn identity(&self) -> Identity {
        Identity {
            id: self.id.clone(),
            email: self.email.clone(),
        }
    }
}

#[derive(Debug)]
enum SignupOutcome {
    Session(Box<AuthTokenResponse>),
    Pending(AuthUser),
}

#[derive(Debug, Default, Deserialize)]
struct GoTrueError {
    error_code: Option<String>,
    error: Option<String>,
    msg: Option<String>,
    message: Option<String>,
    error_description: Option<String>,
}

impl GoTrueError {
    fn code(&self) -> Option<&str> {
        self.error_code.as_deref().or(self.error.as_deref())
    }

    fn text(&self) -> Option<&str> {
        self.msg
            .as_deref()
            .or(self.message.as_deref())
            .or(self.error_description.as_deref())
    }
}

fn parse_signup_response(body: Value) -> Result<SignupOutcome, SocietyError> {
    if body.get("access_token").is_some() {
        let token: AuthTokenResponse = serde_json::from_value(body)
            .map_err(|e| SocietyError::Internal(format!("invalid signup response: {e}")))?;
        return Ok(SignupOutcome::Session(Box::new(token)));
    }
    let user = match body.get("user") {
        Some(user) if !user.is_null() => user.clone(),
        _ => body,
    };
    serde_json::from_value(user)
        .map(SignupOutcome::Pending)
        .map_err(|e| SocietyError::Internal(format!("invalid signup response: {e}")))
}

/// Maps a failed GoTrue / PostgREST response onto the shared error kinds.
///
/// GoTrue answers a password grant for an unknown email with the same
/// `invalid_credentials` code as a wrong password, so that code only counts
/// as a missing account when sign-up fallback is enabled.
fn classify_error(
    status: StatusCode,
    body: &str,
    signup_on_invalid_credentials: bool,
) -> SocietyError {
    let parsed: GoTrueError = serde_json::from_str(body).unwrap_or_default();
    let text = parsed
        .text()
        .map_or_else(|| format!("{status}: {body}"), str::to_string);

    match parsed.code() {
        Some("user_not_found") => return SocietyError::UserNotFound(text),
        Some("invalid_credentials" | "invalid_grant") => {
            return if signup_on_invalid_credentials {
                SocietyError::UserNotFound(text)
            } else {
                SocietyError::Auth(text)
            };
        }
        Some("user_already_exists" | "email_exists") => {
            return if signup_on_invalid_credentials {
                SocietyError::Auth("invalid login credentials".to_string())
            } else {
                SocietyError::Conflict(text)
            };
        }
        _ => {}
    }

    match status.as_u16() {
        400 | 401 | 403 => SocietyError::Auth(text),
        404 => SocietyError::NotFound(text),
        409 => SocietyError::Conflict(text),
        422 => SocietyError::Validation(text),
        500..=599 => SocietyError::Connection(text),
        _ => SocietyError::Internal(text),
    }
}

fn transport_error(e: reqwest::Error) -> SocietyError {
    SocietyError::Connection(e.to_string())
}

fn decode_error(e: reqwest::Error) -> SocietyError {
    SocietyError::Internal(format!("invalid backend response: {e}"))
}

fn needs_refresh(expires_at: Option<u64>, now: u64) -> bool {
    expires_at.is_some_and(|exp| now >= exp.saturating_sub(REFRESH_MARGIN_SECS))
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn unknown_user_code_is_missing_account() {
        let err = classify_error(
            StatusCode::BAD_REQUEST,
            r#"{"code":400,"error_code":"user_not_found","msg":"User not found"}"#,
            false,
        );
        assert_eq!(err, SocietyError::UserNotFound("User not found".to_string()));
    }

    #[test]
    fn invalid_credentials_depend_on_signup_fallback() {
        let body = r#"{"code":400,"error_code":"invalid_credentials","msg":"Invalid login credentials"}"#;
        assert!(classify_error(StatusCode::BAD_REQUEST, body, true).is_user_not_found());
        assert_eq!(
            classify_error(StatusCode::BAD_REQUEST, body, false),
            SocietyError::Auth("Invalid login credentials".to_string())
        );

        let legacy = r#"{"error":"invalid_grant","error_description":"Invalid login credentials"}"#;
        assert!(classify_error(StatusCode::BAD_REQUEST, legacy, true).is_user_not_found());
    }

    #[test]
    fn existing_account_on_signup_means_wrong_password() {
        let body = r#"{"code":422,"error_code":"user_already_exists","msg":"User already registered"}"#;
        assert_eq!(
            classify_error(StatusCode::UNPROCESSABLE_ENTITY, body, true),
            SocietyError::Auth("invalid login credentials".to_string())
        );
        assert!(matches!(
            classify_error(StatusCode::UNPROCESSABLE_ENTITY, body, false),
            SocietyError::Conflict(_)
        ));
    }

    #[test]
    fn status_fallbacks() {
        assert!(matches!(
            classify_error(StatusCode::BAD_GATEWAY, "upstream down", true),
            SocietyError::Connection(_)
        ));
        assert!(matches!(
            classify_error(StatusCode::UNAUTHORIZED, r#"{"message":"JWT expired"}"#, true),
            SocietyError::Auth(m) if m == "JWT expired"
        ));
        assert!(matches!(
            classify_error(StatusCode::NOT_FOUND, "", true),
            SocietyError::NotFound(_)
        ));
    }

    #[test]
    fn signup_with_session_signs_in() {
        let body = json!({
            "access_token": "at",
            "refresh_token": "rt",
            "expires_in": 3600,
            "token_type": "bearer",
            "user": { "id": "u1", "email": "eb@society.com" }
        });
        match parse_signup_response(body).unwrap() {
            SignupOutcome::Session(token) => {
                assert_eq!(token.user.id, "u1");
                assert_eq!(token.expires_in, 3600);
            }
            SignupOutcome::Pending(_) => panic!("expected a session"),
        }
    }

    #[test]
    fn signup_awaiting_confirmation_returns_user() {
        let bare = json!({ "id": "u2", "email": "ec@society.com", "confirmation_sent_at": "x" });
        assert!(matches!(
            parse_signup_response(bare).unwrap(),
            SignupOutcome::Pending(u) if u.id == "u2"
        ));

        let wrapped = json!({ "user": { "id": "u3", "email": null }, "session": null });
        assert!(matches!(
            parse_signup_response(wrapped).unwrap(),
            SignupOutcome::Pending(u) if u.id == "u3" && u.email.is_none()
        ));
    }

    #[test]
    fn refresh_window() {
        assert!(!needs_refresh(None, 1_000));
        assert!(!needs_refresh(Some(2_000), 1_000));
        assert!(needs_refresh(Some(1_020), 1_000));
        assert!(needs_refresh(Some(900), 1_000));
    }
}
