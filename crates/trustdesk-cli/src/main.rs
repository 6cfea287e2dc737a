//! trustdesk - command-line front end for the compliance platform.
//!
//! Drives the core session manager and agent run poller from a terminal:
//! log in against the identity provider, inspect the current session, and
//! trigger or follow long-running agent runs.

use std::io::{self, Write};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use trustdesk_core::{
    ApiClient, Config, JobPoller, JobStatus, KeycloakProvider, Keychain, LoginRequest,
    OperationId, PollSnapshot, SessionManager, StartOutcome,
};

// ============================================================================
// Constants
// ============================================================================

/// Environment variable naming a file to log to instead of stderr
const LOG_FILE_ENV: &str = "TRUSTDESK_LOG_FILE";

const USAGE: &str = "\
Usage: trustdesk <command>

Commands:
  whoami                 Show the current session
  login                  Log in and remember the session
  logout                 End the session and forget stored credentials
  run <agent> [json]     Trigger an agent run and follow it to completion
  watch <run-id>         Follow an existing agent run
";

type Sessions = SessionManager<KeycloakProvider>;

/// Initialize the tracing subscriber for logging.
///
/// Use RUST_LOG to control the level (e.g. RUST_LOG=debug). Logs go to
/// stderr unless TRUSTDESK_LOG_FILE names a file.
fn init_tracing() -> Result<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let (writer, guard) = match std::env::var(LOG_FILE_ENV) {
        Ok(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .with_context(|| format!("Failed to open log file {}", path))?;
            tracing_appender::non_blocking(file)
        }
        Err(_) => tracing_appender::non_blocking(io::stderr()),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(writer))
        .with(filter)
        .init();
    Ok(guard)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();
    let _log_guard = init_tracing()?;

    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = args.first().map(String::as_str).unwrap_or("whoami");
    if matches!(command, "help" | "-h" | "--help") {
        print!("{}", USAGE);
        return Ok(());
    }

    let mut config = Config::load()?;
    config.apply_env();

    let provider = KeycloakProvider::new(&config.identity.issuer_url, &config.identity.client_id)?
        .with_keychain(Keychain::for_client(
            &config.identity.issuer_url,
            &config.identity.client_id,
        ));
    let sessions = SessionManager::new(provider, config.session_config());

    info!(command, "trustdesk starting");
    match command {
        "whoami" => whoami(&sessions).await,
        "login" => login(&sessions, &mut config).await,
        "logout" => logout(&sessions).await,
        "run" => {
            let agent = args.get(1).context("Missing agent name\n\n".to_string() + USAGE)?;
            let input = match args.get(2) {
                Some(raw) => serde_json::from_str(raw).context("Run input is not valid JSON")?,
                None => serde_json::json!({}),
            };
            run(&sessions, &config, agent, &input).await
        }
        "watch" => {
            let id = args.get(1).context("Missing run id\n\n".to_string() + USAGE)?;
            watch(&sessions, &config, OperationId::new(id.as_str())).await
        }
        other => bail!("Unknown command '{}'\n\n{}", other, USAGE),
    }
}

async fn whoami(sessions: &Sessions) -> Result<()> {
    let snapshot = sessions.initialize().await;
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}

fn prompt(label: &str, default: Option<&str>) -> Result<String> {
    match default {
        Some(d) => eprint!("{} [{}]: ", label, d),
        None => eprint!("{}: ", label),
    }
    io::stderr().flush()?;

    let mut line = String::new();
    io::stdin().read_line(&mut line)?;
    let value = line.trim();
    if value.is_empty() {
        return default
            .map(str::to_string)
            .ok_or_else(|| anyhow::anyhow!("{} required", label));
    }
    Ok(value.to_string())
}

async fn login(sessions: &Sessions, config: &mut Config) -> Result<()> {
    let username = prompt("Username", config.last_username.as_deref())?;
    let password = rpassword::prompt_password("Password: ")?;
    if password.is_empty() {
        bail!("Password required");
    }

    let request = LoginRequest {
        username: username.clone(),
        password,
    };
    let snapshot = sessions.login(&request).await?;

    config.last_username = Some(username);
    if let Err(e) = config.save() {
        warn!(error = %e, "Failed to save config");
    }

    let name = snapshot
        .identity
        .as_ref()
        .map(|i| i.display_name.as_str())
        .unwrap_or("unknown user");
    eprintln!("Logged in as {}", name);
    Ok(())
}

async fn logout(sessions: &Sessions) -> Result<()> {
    sessions.initialize().await;
    sessions.logout().await;
    eprintln!("Logged out");
    Ok(())
}

/// Initialize the session and build an API client bound to it
async fn authorized_client(sessions: &Sessions, config: &Config) -> Result<ApiClient> {
    let snapshot = sessions.initialize().await;
    if !snapshot.authenticated {
        bail!("Not logged in. Run `trustdesk login` first.");
    }
    if snapshot.dev_mode {
        eprintln!("Identity provider unreachable - using dev-mode session");
    }
    Ok(ApiClient::new(&config.api_base_url, sessions.credentials())?)
}

async fn run(
    sessions: &Sessions,
    config: &Config,
    agent: &str,
    input: &serde_json::Value,
) -> Result<()> {
    let api = authorized_client(sessions, config).await?;
    let started = api.trigger_run(agent, input).await?;
    eprintln!("Started {} run {}", agent, started.id);
    follow(api, config, started.id).await
}

async fn watch(sessions: &Sessions, config: &Config, id: OperationId) -> Result<()> {
    let api = authorized_client(sessions, config).await?;
    follow(api, config, id).await
}

fn print_progress(snapshot: &PollSnapshot) {
    let mut line = format!("[{:>4}s] {}", snapshot.elapsed_seconds, snapshot.status);
    if snapshot.missed_samples > 0 {
        line.push_str(&format!(" ({} missed)", snapshot.missed_samples));
    }
    eprintln!("{}", line);
}

/// Poll a run until it finishes or the user presses Ctrl-C
async fn follow(api: ApiClient, config: &Config, id: OperationId) -> Result<()> {
    let poller = JobPoller::new(Arc::new(api), config.poller_config());
    let mut updates = poller.subscribe();

    if let StartOutcome::Rejected { active } = poller.start(id) {
        bail!("Already following run {}", active);
    }

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let mut last_printed: Option<(u64, JobStatus, u32)> = None;
    let finished = loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                poller.cancel();
                eprintln!("Cancelled - the run continues on the server");
                return Ok(());
            }
            changed = updates.changed() => {
                if changed.is_err() {
                    bail!("Poller stopped unexpectedly");
                }
                let Some(snapshot) = (*updates.borrow_and_update()).clone() else {
                    continue;
                };
                let key = (snapshot.elapsed_seconds, snapshot.status, snapshot.missed_samples);
                if last_printed != Some(key) {
                    print_progress(&snapshot);
                    last_printed = Some(key);
                }
                if snapshot.is_finished() {
                    break snapshot;
                }
            }
        }
    };

    if finished.is_failed {
        bail!(
            "Run {} failed: {}",
            finished.operation_id,
            finished.error_message.as_deref().unwrap_or_default()
        );
    }

    let output = finished
        .output
        .map(serde_json::Value::Object)
        .unwrap_or(serde_json::Value::Null);
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
