use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use society_api::{BackendConfig, BackendKind, Role, SocietyError};
use tracing::debug;

use crate::Allowlist;

pub const SETTINGS_FILE: &str = "society.toml";
pub const BACKEND_URL_ENV: &str = "SOCIETY_BACKEND_URL";
pub const DEFAULT_PROFILES_COLLECTION: &str = "users";

pub const DEFAULT_SETTINGS: &str = r#"# society session settings

[backend]
# "supabase" talks to a Supabase project; "memory" keeps everything in-process.
kind = "supabase"
base_url = "https://your-project.supabase.co"
# Environment variable holding the project's anon key.
secret_ref = "SOCIETY_SUPABASE_ANON_KEY"
request_timeout_ms = 15000
signup_on_invalid_credentials = true

[session]
profiles_collection = "users"
# "preserve_existing" writes createdAt once; "overwrite_on_login" rewrites it on every login.
created_at = "preserve_existing"

# Omit [allowlist] to use the built-in society table.
# [allowlist]
# EB = ["eb@society.com"]
"#;

/// When a login writes the profile's `createdAt` field.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreatedAtPolicy {
    #[default]
    PreserveExisting,
    OverwriteOnLogin,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSettings {
    pub profiles_collection: String,
    pub created_at: CreatedAtPolicy,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            profiles_collection: DEFAULT_PROFILES_COLLECTION.to_string(),
            created_at: CreatedAtPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub backend: BackendConfig,
    pub session: SessionSettings,
    pub allowlist: Allowlist,
}

impl Settings {
    /// In-process backend, builtin allowlist.
    pub fn in_memory() -> Self {
        Self {
            backend: BackendConfig {
                kind: BackendKind::Memory,
                base_url: String::new(),
                secret_ref: default_secret_ref(),
                request_timeout_ms: default_request_timeout_ms(),
                signup_on_invalid_credentials: true,
            },
            session: SessionSettings::default(),
            allowlist: Allowlist::builtin().clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawSettings {
    backend: RawBackend,
    #[serde(default)]
    session: RawSession,
    allowlist: Option<BTreeMap<String, Vec<String>>>,
}

#[derive(Debug, Deserialize)]
struct RawBackend {
    kind: BackendKind,
    #[serde(default)]
    base_url: String,
    #[serde(default = "default_secret_ref")]
    secret_ref: String,
    #[serde(default = "default_request_timeout_ms")]
    request_timeout_ms: u64,
    #[serde(default = "default_true")]
    signup_on_invalid_credentials: bool,
}

#[derive(Debug, Default, Deserialize)]
struct RawSession {
    profiles_collection: Option<String>,
    #[serde(default)]
    created_at: CreatedAtPolicy,
}

fn default_secret_ref() -> String {
    "SOCIETY_SUPABASE_ANON_KEY".to_string()
}

fn default_request_timeout_ms() -> u64 {
    15_000
}

fn default_true() -> bool {
    true
}

pub fn default_config_dir() -> PathBuf {
    if let Ok(home) = std::env::var("HOME") {
        PathBuf::from(home).join(".config").join("society")
    } else {
        PathBuf::from(".society")
    }
}

pub fn validate_settings(settings: &Settings) -> Result<(), SocietyError> {
    if settings.backend.kind == BackendKind::Supabase {
        let url = settings.backend.base_url.trim();
        if url.is_empty() {
            return Err(SocietyError::Validation(
                "backend.base_url is required for the supabase backend".to_string(),
            ));
        }
        if !(url.starts_with("https://") || url.starts_with("http://")) {
            return Err(SocietyError::Validation(format!(
                "backend.base_url must be an http(s) URL, got {url}"
            )));
        }
    }
    if settings.session.profiles_collection.trim().is_empty() {
        return Err(SocietyError::Validation(
            "session.profiles_collection must not be empty".to_string(),
        ));
    }
    Ok(())
}

pub fn parse_settings(content: &str) -> Result<Settings, SocietyError> {
    let settings = parse_unvalidated(content)?;
    validate_settings(&settings)?;
    Ok(settings)
}

fn parse_unvalidated(content: &str) -> Result<Settings, SocietyError> {
    let raw: RawSettings = toml::from_str(content)
        .map_err(|e| SocietyError::Validation(format!("invalid settings TOML: {e}")))?;

    let allowlist = match raw.allowlist {
        None => Allowlist::builtin().clone(),
        Some(entries) => {
            let entries = entries
                .into_iter()
                .map(|(role, emails)| role.parse::<Role>().map(|role| (role, emails)))
                .collect::<Result<Vec<_>, SocietyError>>()?;
            Allowlist::from_entries(entries)?
        }
    };

    Ok(Settings {
        backend: BackendConfig {
            kind: raw.backend.kind,
            base_url: raw.backend.base_url.trim_end_matches('/').to_string(),
            secret_ref: raw.backend.secret_ref,
            request_timeout_ms: raw.backend.request_timeout_ms,
            signup_on_invalid_credentials: raw.backend.signup_on_invalid_credentials,
        },
        session: SessionSettings {
            profiles_collection: raw
                .session
                .profiles_collection
                .unwrap_or_else(|| DEFAULT_PROFILES_COLLECTION.to_string()),
            created_at: raw.session.created_at,
        },
        allowlist,
    })
}

/// Environment overrides applied on top of the file.
pub fn apply_overrides<F>(settings: &mut Settings, lookup: F) -> Result<(), SocietyError>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(url) = lookup(BACKEND_URL_ENV).filter(|v| !v.trim().is_empty()) {
        debug!(url = %url, "backend url overridden from environment");
        settings.backend.base_url = url.trim().trim_end_matches('/').to_string();
    }
    validate_settings(settings)
}

pub fn load_settings_from_dir(dir: &Path) -> Result<Settings, SocietyError> {
    load_settings_from_file(&dir.join(SETTINGS_FILE))
}

pub fn load_settings_from_file(path: &Path) -> Result<Settings, SocietyError> {
    let content = fs::read_to_string(path)
        .map_err(|e| SocietyError::NotFound(format!("failed to read {}: {e}", path.display())))?;
    parse_unvalidated(&content)
        .and_then(|mut settings| {
            apply_overrides(&mut settings, |key| std::env::var(key).ok())?;
            Ok(settings)
        })
        .map_err(|e| match e {
            SocietyError::Validation(msg) => {
                SocietyError::Validation(format!("{}: {msg}", path.display()))
            }
            other => other,
        })
}

/// Writes the default settings file unless one already exists. Returns the
/// path and whether it was written.
pub fn write_default_settings(dir: &Path, force: bool) -> Result<(PathBuf, bool), SocietyError> {
    fs::create_dir_all(dir)
        .map_err(|e| SocietyError::Internal(format!("failed to create {}: {e}", dir.display())))?;

    let path = dir.join(SETTINGS_FILE);
    if path.exists() && !force {
        return Ok((path, false));
    }
    fs::write(&path, DEFAULT_SETTINGS).map_err(|e| {
        SocietyError::Internal(format!("failed to write {}: {e}", path.display()))
    })?;
    Ok((path, true))
}
