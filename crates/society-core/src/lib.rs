//! Configuration for society sessions: the role allowlist and the
//! `society.toml` settings file.

mod allowlist;
mod settings;

pub use allowlist::Allowlist;
pub use settings::{
    BACKEND_URL_ENV, CreatedAtPolicy, DEFAULT_PROFILES_COLLECTION, DEFAULT_SETTINGS,
    SETTINGS_FILE, SessionSettings, Settings, apply_overrides, default_config_dir,
    load_settings_from_dir, load_settings_from_file, parse_settings, validate_settings,
    write_default_settings,
};
