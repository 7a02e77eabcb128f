// ============================================
// deploysession - main.rs
// ============================================
// Command-line front end for one deployment session.
//
// The program flow is:
// 1. Parse arguments and set up tracing
// 2. Load config.toml, the session parameters, and a system snapshot
//    (from a JSON file, or detected live)
// 3. Open the session, log any messages, record the exit code
// 4. Close the session and exit with the code it hands back
// ============================================

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use deploysession::{
    native_collaborators, DeferHistoryUpdate, DeploymentSession, EnvironmentContext, LogSeverity,
    SessionParameters, SystemInfo, ToolkitConfig,
};

/// Name the toolkit reports for itself in logs and registry paths.
const TOOLKIT_NAME: &str = "deploysession";

#[derive(Parser)]
#[command(name = "deploysession")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Open, run and close a deployment session")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Open a session, record the outcome, and close it
    Run {
        /// Toolkit config (TOML)
        #[arg(long, value_name = "PATH")]
        config: PathBuf,

        /// Session parameters (JSON)
        #[arg(long, value_name = "PATH")]
        params: PathBuf,

        /// System snapshot (JSON); detected from the machine when omitted
        #[arg(long, value_name = "PATH")]
        environment: Option<PathBuf>,

        /// Exit code to close the session with
        #[arg(long, allow_hyphen_values = true)]
        exit_code: Option<i32>,

        /// Install phase used as the script section for --message
        #[arg(long)]
        phase: Option<String>,

        /// Message to write to the session log (repeatable)
        #[arg(long = "message", value_name = "TEXT")]
        messages: Vec<String>,

        /// Record the remaining deferral count before closing
        #[arg(long)]
        defer_times_remaining: Option<u32>,
    },

    /// Print the detected system snapshot as JSON
    Detect,
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

fn main() {
    init_tracing();
    let cli = Cli::parse();

    let code = match cli.command {
        Commands::Detect => detect(),
        Commands::Run {
            config,
            params,
            environment,
            exit_code,
            phase,
            messages,
            defer_times_remaining,
        } => load_environment(&config, environment).and_then(|env| {
            let params = SessionParameters::load(&params)?;
            let run = RunOptions {
                exit_code,
                phase,
                messages,
                defer_times_remaining,
            };
            Ok(run_session(&env, params, run))
        }),
    };

    match code {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            tracing::error!("{:#}", e);
            std::process::exit(deploysession::error::DEVICE_ERROR_EXIT_CODE);
        }
    }
}

fn detect() -> Result<i32> {
    let info = SystemInfo::detect(TOOLKIT_NAME, env!("CARGO_PKG_VERSION"))?;
    println!("{}", serde_json::to_string_pretty(&info)?);
    Ok(0)
}

fn load_environment(config: &Path, environment: Option<PathBuf>) -> Result<EnvironmentContext> {
    let config = ToolkitConfig::load(config).with_context(|| format!("Failed to load {}", config.display()))?;
    let system = match environment {
        Some(path) => SystemInfo::load(&path).with_context(|| format!("Failed to load {}", path.display()))?,
        None => SystemInfo::detect(TOOLKIT_NAME, env!("CARGO_PKG_VERSION"))?,
    };
    Ok(EnvironmentContext::new(system, config))
}

struct RunOptions {
    exit_code: Option<i32>,
    phase: Option<String>,
    messages: Vec<String>,
    defer_times_remaining: Option<u32>,
}

/// Run one session end to end and return the process exit code.
fn run_session(env: &EnvironmentContext, params: SessionParameters, run: RunOptions) -> i32 {
    let mut session = match DeploymentSession::open(env, params, native_collaborators()) {
        Ok(session) => session,
        Err(e) => {
            tracing::error!("Failed to open deployment session: {}", e);
            return env.last_exit_code();
        }
    };
    tracing::info!(
        "Opened session [{}] in [{}] mode",
        session.install_name(),
        session.deploy_mode()
    );

    if let Err(e) = apply_run_options(&mut session, run) {
        tracing::error!("{}", e);
        if let Err(e) = session.set_exit_code(deploysession::error::DEVICE_ERROR_EXIT_CODE) {
            tracing::warn!("{}", e);
        }
    }

    let status = session.get_deployment_status();
    match session.close() {
        Ok(Some(code)) => {
            tracing::info!("Deployment finished with status [{}], exit code [{}]", status, code);
            code
        }
        Ok(None) => {
            tracing::info!("Deployment finished with status [{}]", status);
            0
        }
        Err(e) => {
            tracing::error!("Failed to close deployment session: {}", e);
            env.last_exit_code()
        }
    }
}

fn apply_run_options(session: &mut DeploymentSession<'_>, run: RunOptions) -> Result<()> {
    if let Some(phase) = run.phase {
        session.set_install_phase(phase)?;
    }
    for message in &run.messages {
        session.log(message, LogSeverity::Info)?;
    }
    if let Some(times_remaining) = run.defer_times_remaining {
        session.set_defer_history(&DeferHistoryUpdate {
            times_remaining: Some(times_remaining),
            ..DeferHistoryUpdate::default()
        })?;
    }
    if let Some(code) = run.exit_code {
        session.set_exit_code(code)?;
    }
    Ok(())
}
