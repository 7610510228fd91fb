//! coachlab - command-line client for a CoachLab workspace.
//!
//! Signs in, keeps the session between runs and sends arbitrary API requests
//! through the same authenticated pipeline the dashboard uses.

use std::io::{self, Write};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use coachlab_core::api::Method;
use coachlab_core::models::NewWorkspace;
use coachlab_core::{ApiError, ApiRequest, App, Config, Session, StorageKind};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Log file prefix in the data directory
const LOG_FILE_PREFIX: &str = "coachlab.log";

#[derive(Parser)]
#[command(name = "coachlab")]
#[command(about = "CoachLab workspace client", long_about = None)]
struct Cli {
    /// API base URL (overrides config and COACHLAB_API_BASE_URL)
    #[arg(long, global = true)]
    base_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Sign in with email and password
    Login {
        #[arg(long)]
        email: Option<String>,
    },
    /// Sign out and forget stored credentials
    Logout,
    /// Create a new workspace and sign in as its admin
    Signup {
        #[arg(long)]
        workspace: String,
        #[arg(long)]
        email: String,
        #[arg(long, default_value = "INSURANCE")]
        industry: String,
        #[arg(long, default_value = "America/New_York")]
        timezone: String,
    },
    /// Accept an invitation and sign in
    AcceptInvite {
        token: String,
    },
    /// Show the signed-in user and workspace
    Whoami {
        /// Re-fetch the user from the server first
        #[arg(long)]
        refresh: bool,
    },
    /// Re-fetch the current workspace
    Workspace,
    /// Save --base-url and storage choice to the config file
    Configure {
        /// Where credentials are kept: file, keyring or memory
        #[arg(long)]
        storage: Option<StorageKind>,
    },
    /// Send a request through the authenticated pipeline
    Send {
        method: String,
        path: String,
        /// JSON request body
        #[arg(long)]
        body: Option<String>,
        /// Query parameter as key=value, repeatable
        #[arg(long = "query", value_name = "KEY=VALUE")]
        query: Vec<String>,
    },
}

/// Initialize the tracing subscriber for logging.
/// Returns the guard that keeps the file writer flushing.
fn init_tracing() -> Option<WorkerGuard> {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let (file_layer, guard) = match Config::data_dir() {
        Ok(dir) => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_writer(writer).with_ansi(false)),
                Some(guard),
            )
        }
        Err(_) => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .with(filter)
        .init();

    guard
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let _log_guard = init_tracing();
    let cli = Cli::parse();

    if let Commands::Configure { storage } = cli.command {
        return configure(cli.base_url, storage);
    }

    let mut config = Config::load().unwrap_or_else(|e| {
        eprintln!("Warning: failed to load config ({}), using defaults", e);
        Config::default()
    });
    if let Some(url) = cli.base_url {
        config.api_base_url = url;
    }

    let app = App::start(config).await?;

    match run(&app, cli.command).await {
        Ok(()) => Ok(()),
        Err(e) => {
            if let Some(api_err) = e.downcast_ref::<ApiError>() {
                eprintln!("Error [{:?}]: {}", api_err.kind(), api_err);
                if api_err.requires_login() {
                    eprintln!("Run `coachlab login` to sign in again.");
                }
                std::process::exit(1);
            }
            Err(e)
        }
    }
}

async fn run(app: &App, command: Commands) -> Result<()> {
    match command {
        Commands::Login { email } => {
            let email = match email {
                Some(email) => email,
                None => prompt("Email: ")?,
            };
            let password = rpassword::prompt_password("Password: ")?;
            let session = app.session.login(&email, &password).await?;
            info!("Login successful");
            print_session(&session);
        }
        Commands::Logout => {
            app.session.logout().await?;
            println!("Signed out.");
        }
        Commands::Signup {
            workspace,
            email,
            industry,
            timezone,
        } => {
            let admin_password = rpassword::prompt_password("Password: ")?;
            let confirm_password = rpassword::prompt_password("Confirm password: ")?;
            let form = NewWorkspace {
                workspace_name: workspace,
                admin_email: email,
                admin_password,
                confirm_password,
                industry_type: industry,
                timezone,
            };
            let session = app.session.register_workspace(&form).await?;
            println!("Workspace created.");
            print_session(&session);
        }
        Commands::AcceptInvite { token } => {
            let password = rpassword::prompt_password("Choose a password: ")?;
            let session = app.session.accept_invite(&token, &password).await?;
            print_session(&session);
        }
        Commands::Whoami { refresh } => {
            if refresh {
                app.session.refresh_user().await?;
            }
            print_session(&app.session.session());
        }
        Commands::Workspace => {
            let workspace = app.session.refresh_workspace().await?;
            println!("{}", serde_json::to_string_pretty(&workspace)?);
        }
        Commands::Configure { .. } => anyhow::bail!("configure runs without a session"),
        Commands::Send {
            method,
            path,
            body,
            query,
        } => {
            let method: Method = method
                .to_uppercase()
                .parse()
                .with_context(|| format!("Invalid HTTP method: {}", method))?;
            let mut request = ApiRequest::new(method, path);
            if let Some(body) = body {
                let value: serde_json::Value =
                    serde_json::from_str(&body).context("Request body is not valid JSON")?;
                request = request.body(value);
            }
            for pair in query {
                let (key, value) = pair
                    .split_once('=')
                    .with_context(|| format!("Query parameter must be KEY=VALUE: {}", pair))?;
                request = request.query(key, value);
            }
            let response = app.pipeline.send(request).await?;
            println!("{}", serde_json::to_string_pretty(&response.body)?);
        }
    }
    Ok(())
}

/// Persist settings from the file itself, so environment overrides are not
/// written back.
fn configure(base_url: Option<String>, storage: Option<StorageKind>) -> Result<()> {
    let path = Config::config_path()?;
    let mut config = Config::load_from(&path)?;
    if let Some(url) = base_url {
        config.api_base_url = url;
    }
    if let Some(storage) = storage {
        config.storage = storage;
    }
    let path = config.save()?;
    println!("Saved {}", path.display());
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}

fn prompt(label: &str) -> Result<String> {
    print!("{}", label);
    io::stdout().flush()?;

    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    Ok(input.trim().to_string())
}

fn print_session(session: &Session) {
    match (&session.user, &session.workspace) {
        (Some(user), Some(workspace)) if session.authenticated => {
            println!(
                "{} <{}> ({}) in workspace {}",
                user.display_name(),
                user.email,
                user.role.display_name(),
                workspace.name
            );
        }
        _ if session.authenticated => println!("Signed in (no cached profile)."),
        _ => println!("Not signed in."),
    }
}
