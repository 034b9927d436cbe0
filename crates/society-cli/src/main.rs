mod store;

use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use society_api::{Backend, ConnectorFactory, Role};
use society_auth::{SessionManager, SessionOptions};
use society_connectors::{DefaultConnectorFactory, EnvSecretStore};
use society_core::{
    SETTINGS_FILE, Settings, default_config_dir, load_settings_from_dir, write_default_settings,
};
use tracing::{debug, warn};
use tracing_subscriber::{EnvFilter, fmt};

use crate::store::{delete_session, load_session, save_session};

const PROFILE_WAIT: Duration = Duration::from_secs(10);

#[derive(Debug, Parser)]
#[command(name = "society", about = "Society CLI: role-gated sign-in")]
struct Cli {
    #[arg(long, global = true)]
    json: bool,

    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Write the default society.toml
    Init {
        #[arg(long)]
        force: bool,
    },
    /// Sign in under a role, creating the account on first use
    Login {
        #[arg(long)]
        email: String,
        /// EB, EC, Core or Member
        #[arg(long)]
        role: Role,
        /// Display name; defaults to the part of the email before '@'
        #[arg(long)]
        name: Option<String>,
        /// Read the password from the first line of stdin
        #[arg(long)]
        password_stdin: bool,
    },
    /// Sign out and forget the stored session
    Logout,
    /// Show the signed-in user
    Whoami,
    /// Show backend configuration and session state
    Status,
}

fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("info"))?;
    fmt().with_env_filter(filter).with_writer(std::io::stderr).init();

    let cli = Cli::parse();
    let cfg_dir = cli.config_dir.clone().unwrap_or_else(config_dir);

    if let Commands::Init { force } = cli.command {
        let (path, written) = write_default_settings(&cfg_dir, force)?;
        let text = if written {
            format!("Wrote {}", path.display())
        } else {
            format!("{} already exists (use --force to overwrite)", path.display())
        };
        return pout(
            cli.json,
            serde_json::json!({"ok": true, "path": path, "written": written}),
            &text,
        );
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(run(cli, cfg_dir))
}

async fn run(cli: Cli, cfg_dir: PathBuf) -> anyhow::Result<()> {
    let settings = load_settings(&cfg_dir);
    let backend = DefaultConnectorFactory.build(&settings.backend, &EnvSecretStore)?;
    restore_session(backend.as_ref()).await;

    let session = SessionManager::start(Arc::clone(&backend), SessionOptions::from(&settings));
    let result = society_auth::scope(session.clone(), dispatch(cli, &settings, &cfg_dir)).await;
    session.shutdown();
    result
}

async fn dispatch(cli: Cli, settings: &Settings, cfg_dir: &Path) -> anyhow::Result<()> {
    let session = society_auth::current()?;

    match cli.command {
        Commands::Init { .. } => anyhow::bail!("init does not need a session"),
        Commands::Login {
            email,
            role,
            name,
            password_stdin,
        } => {
            let password = read_password(&email, password_stdin)?;
            session
                .login(&email, &password, role, name.as_deref())
                .await?;
            if let Some(stored) = session.backend().export_session() {
                save_session(&stored)?;
            }

            let user = wait_for_profile(&session, &email).await;
            match user {
                Some(user) => pout(
                    cli.json,
                    serde_json::json!({"ok": true, "user": user}),
                    &format!("Logged in as {} ({}, {})", user.name, user.email, user.role),
                )?,
                None => pout(
                    cli.json,
                    serde_json::json!({"ok": true, "user": null}),
                    &format!("Logged in as {email}; profile not available yet"),
                )?,
            }
        }
        Commands::Logout => {
            session.logout().await?;
            delete_session()?;
            pout(cli.json, serde_json::json!({"ok": true}), "Logged out.")?;
        }
        Commands::Whoami => {
            let snapshot = session.wait_until_loaded().await?;
            match snapshot.current_user {
                Some(user) => {
                    let text = format!("{} <{}> as {}", user.name, user.email, user.role);
                    pout(cli.json, serde_json::to_value(&user)?, &text)?;
                }
                None => pout(cli.json, serde_json::Value::Null, "Not logged in.")?,
            }
        }
        Commands::Status => {
            let snapshot = session.wait_until_loaded().await?;
            let backend = &settings.backend;
            let options = session.options();
            let value = serde_json::json!({
                "config": cfg_dir.join(SETTINGS_FILE),
                "backend": backend.kind,
                "base_url": backend.base_url,
                "profiles_collection": options.profiles_collection,
                "created_at": options.created_at,
                "signed_in": snapshot.current_user.is_some(),
            });
            let text = format!(
                "backend: {:?} {}\nsigned in: {}",
                backend.kind,
                backend.base_url,
                snapshot
                    .current_user
                    .as_ref()
                    .map_or("no", |u| u.email.as_str()),
            );
            pout(cli.json, value, &text)?;
        }
    }
    Ok(())
}

pub fn pout(json_mode: bool, value: serde_json::Value, text: &str) -> anyhow::Result<()> {
    if json_mode {
        println!("{}", serde_json::to_string_pretty(&value)?);
    } else {
        println!("{text}");
    }
    Ok(())
}

fn config_dir() -> PathBuf {
    dirs::config_dir().map_or_else(default_config_dir, |d| d.join("society"))
}

/// Falls back to the in-process backend when no settings file exists.
fn load_settings(cfg_dir: &Path) -> Settings {
    match load_settings_from_dir(cfg_dir) {
        Ok(settings) => settings,
        Err(e) => {
            warn!(error = %e, "using in-memory backend; run `society init` to configure one");
            Settings::in_memory()
        }
    }
}

async fn restore_session(backend: &dyn Backend) {
    let Some(stored) = load_session() else {
        return;
    };
    debug!(user_id = %stored.user_id, "restoring stored session");
    if let Err(e) = backend.restore_session(stored).await {
        warn!(error = %e, "stored session rejected, discarding it");
        if let Err(e) = delete_session() {
            warn!(error = %e, "could not discard stored session");
        }
    }
}

fn read_password(email: &str, from_stdin: bool) -> anyhow::Result<String> {
    let password = if from_stdin {
        let mut line = String::new();
        std::io::stdin().lock().read_line(&mut line)?;
        line.trim_end_matches(['\r', '\n']).to_string()
    } else {
        rpassword::prompt_password(format!("Password for {email}: "))?
    };
    if password.is_empty() {
        anyhow::bail!("Password cannot be empty");
    }
    Ok(password)
}

/// The listener publishes the profile shortly after login returns.
async fn wait_for_profile(session: &SessionManager, email: &str) -> Option<society_api::User> {
    let email = email.trim().to_lowercase();
    let mut rx = session.subscribe();
    let wait = rx.wait_for(|s| {
        s.current_user
            .as_ref()
            .is_some_and(|u| u.email.eq_ignore_ascii_case(&email))
    });
    match tokio::time::timeout(PROFILE_WAIT, wait).await {
        Ok(Ok(snapshot)) => snapshot.current_user.clone(),
        _ => None,
    }
}
