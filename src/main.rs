mod cli;
mod config;
mod error;
mod metadata;
mod orchestrator;
mod process;
mod transfer;
mod types;
mod version;
mod workspace;


use anyhow::{anyhow, bail, Result};
use clap::Parser;
use cli::{Cli, Commands, ConfigAction, TargetArgs};
use config::{get_setting, load_settings, load_stored_settings, save_settings, set_setting, unset_setting};
use console::{style, Term};
use error::UpdateError;
use indicatif::{ProgressBar, ProgressStyle};
use metadata::UpdateInfo;
use orchestrator::{UpdateEvent, UpdateOrchestrator, UpdateParams, UpdateState};
use process::Termination;
use serde_json::Value;
use std::time::Duration;
use types::UpdraftSettings;
use version::Version;
use workspace::WorkspaceManager;

const EXIT_OK: i32 = 0;
const EXIT_FAILURE: i32 = 1;
const EXIT_CONFIG: i32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunMode {
    CheckOnly,
    Install { assume_yes: bool },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    setup_logging(&cli)?;

    let code = match cli.command {
        Commands::Version => {
            println!("updraft v{}", env!("CARGO_PKG_VERSION"));
            EXIT_OK
        }

        Commands::Config { action } => match run_config(action) {
            Ok(code) => code,
            Err(e) => {
                eprintln!("error: {:#}", e);
                EXIT_CONFIG
            }
        },

        Commands::Check { target } => match load_run_settings(&target) {
            Err(e) => settings_error(&e),
            Ok(settings) => {
                let params = UpdateParams::check_only(
                    resolve_endpoints(&target, &settings),
                    target.exe.clone(),
                    target.local_version.as_deref(),
                );
                match params {
                    Ok(params) => run_update(params, &settings, RunMode::CheckOnly, cli.quiet).await?,
                    Err(e) => config_error(&e),
                }
            }
        },

        Commands::Update { target, pids, yes } => match load_run_settings(&target) {
            Err(e) => settings_error(&e),
            Ok(settings) => {
                let params = UpdateParams::new(
                    resolve_endpoints(&target, &settings),
                    pids,
                    target.exe.clone(),
                    target.local_version.as_deref(),
                );
                match params {
                    Ok(params) => {
                        let swept = WorkspaceManager::new(settings.workspace_root())
                            .sweep_stale(Duration::from_secs(settings.stale_workspace_hours * 3600));
                        if swept > 0 {
                            tracing::info!("Removed {} stale workspace(s)", swept);
                        }
                        let mode = RunMode::Install { assume_yes: yes };
                        run_update(params, &settings, mode, cli.quiet).await?
                    }
                    Err(e) => config_error(&e),
                }
            }
        },
    };

    std::process::exit(code)
}

fn setup_logging(cli: &Cli) -> Result<()> {
    use tracing_subscriber::{fmt, EnvFilter};

    let level = if cli.quiet {
        "error"
    } else if cli.verbose == 0 {
        "warn"
    } else if cli.verbose == 1 {
        "info"
    } else {
        "debug"
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_writer(std::io::stderr)
        .init();

    Ok(())
}

fn config_error(error: &UpdateError) -> i32 {
    eprintln!("{}", error);
    EXIT_CONFIG
}

fn settings_error(error: &anyhow::Error) -> i32 {
    eprintln!("error: {:#}", error);
    EXIT_CONFIG
}

fn load_run_settings(target: &TargetArgs) -> Result<UpdraftSettings> {
    let mut settings = load_settings()?;
    if let Some(secs) = target.timeout {
        settings.network_timeout_secs = secs;
    }
    Ok(settings)
}

/// Endpoints on the command line replace the configured list.
fn resolve_endpoints(target: &TargetArgs, settings: &UpdraftSettings) -> Vec<String> {
    let from_cli: Vec<String> = target
        .endpoints
        .iter()
        .map(|e| e.trim().to_string())
        .filter(|e| !e.is_empty())
        .collect();
    if from_cli.is_empty() {
        settings.endpoints.clone()
    } else {
        from_cli
    }
}

async fn run_update(
    params: UpdateParams,
    settings: &UpdraftSettings,
    mode: RunMode,
    quiet: bool,
) -> Result<i32> {
    let closes_apps = !params.pids.is_empty();
    let mut orchestrator = match UpdateOrchestrator::from_settings(params, settings) {
        Ok(orchestrator) => orchestrator,
        Err(e) => return Ok(config_error(&e)),
    };
    let mut progress: Option<ProgressBar> = None;

    // Re-armed after each press so a second Ctrl-C is still seen
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut interrupts = 0u32;

    orchestrator.start_check()?;

    loop {
        let event = tokio::select! {
            event = orchestrator.next_event() => event,
            _ = &mut ctrl_c => {
                ctrl_c.set(tokio::signal::ctrl_c());
                interrupts += 1;
                if interrupts == 1 {
                    tracing::warn!("Interrupted, cancelling (press Ctrl-C again to abort)");
                    orchestrator.cancel();
                    continue;
                }
                tracing::warn!("Interrupted again, aborting");
                orchestrator.abort().await;
                if let Some(bar) = progress.take() {
                    bar.abandon_with_message("Aborted");
                }
                eprintln!("{} update aborted", style("error:").red().bold());
                return Ok(EXIT_FAILURE);
            }
        };
        let Some(event) = event else { break };

        match event {
            UpdateEvent::State(UpdateState::Checking) => {
                tracing::info!("Checking for updates...");
            }
            UpdateEvent::State(UpdateState::UpToDate { local, remote }) => {
                tracing::info!("Installed version {} is current (latest {})", local, remote);
                if mode == RunMode::CheckOnly {
                    println!("{} is up to date", local);
                }
            }
            UpdateEvent::State(UpdateState::UpdateAvailable { local, info }) => {
                print_release(&local, &info);
                let RunMode::Install { assume_yes } = mode else { continue };

                let accepted = if interrupts > 0 {
                    false
                } else if assume_yes {
                    true
                } else {
                    let prompt_info = info.clone();
                    let prompt = tokio::task::spawn_blocking(move || confirm_update(&prompt_info));
                    tokio::select! {
                        answer = prompt => answer??,
                        _ = &mut ctrl_c => {
                            ctrl_c.set(tokio::signal::ctrl_c());
                            interrupts += 1;
                            false
                        }
                    }
                };

                if accepted {
                    orchestrator.start_download()?;
                } else {
                    orchestrator.decline()?;
                }
            }
            UpdateEvent::State(UpdateState::Downloading { version }) => {
                if closes_apps && !quiet {
                    eprintln!(
                        "{} the running application will be closed once the download finishes, so save your work now",
                        style("note:").cyan().bold()
                    );
                }
                progress = Some(progress_bar(&version, quiet)?);
            }
            UpdateEvent::Progress(percent) => {
                if let Some(bar) = &progress {
                    bar.set_position(u64::from(percent));
                }
            }
            UpdateEvent::ProcessTerminated { pid, outcome } => match outcome {
                Termination::Terminated | Termination::NotRunning => {
                    tracing::info!("Process {}: {}", pid, outcome)
                }
                Termination::StillRunning | Termination::Refused(_) => {
                    tracing::warn!("Process {}: {}", pid, outcome)
                }
            },
            UpdateEvent::State(UpdateState::Finalizing {
                artifact,
                installer_pid,
                ..
            }) => {
                if let Some(bar) = progress.take() {
                    bar.finish_with_message("Download complete");
                }
                match installer_pid {
                    Some(pid) => println!(
                        "{} {} (pid {})",
                        style("Started installer").green().bold(),
                        artifact.display(),
                        pid
                    ),
                    None => tracing::info!("Preparing to install {}", artifact.display()),
                }
            }
            UpdateEvent::State(UpdateState::Cancelled) => {
                if let Some(bar) = progress.take() {
                    bar.abandon_with_message("Cancelled");
                }
                tracing::info!("Update cancelled");
            }
            UpdateEvent::State(UpdateState::Failed(reason)) => {
                if let Some(bar) = progress.take() {
                    bar.abandon_with_message("Failed");
                }
                eprintln!("{} {}", style("error:").red().bold(), reason);
            }
            UpdateEvent::State(UpdateState::Idle) => {}
        }
    }

    Ok(match orchestrator.state() {
        UpdateState::Failed(_) => EXIT_FAILURE,
        _ => EXIT_OK,
    })
}

fn print_release(local: &Version, info: &UpdateInfo) {
    let name = if info.name.is_empty() {
        "A new release"
    } else {
        info.name.as_str()
    };
    let beta = if info.is_beta { " [beta]" } else { "" };
    println!(
        "{} {}{} is available (installed: {})",
        style(name).bold(),
        style(&info.version).green(),
        style(beta).yellow(),
        local
    );
    if !info.changelog.trim().is_empty() {
        println!("\n{}\n", info.changelog.trim());
    }
}

fn confirm_update(info: &UpdateInfo) -> std::io::Result<bool> {
    let term = Term::stderr();
    if !term.is_term() {
        tracing::warn!("No terminal to confirm the update on; pass --yes to install unattended");
        return Ok(false);
    }
    term.write_str(&format!("Install version {} now? [y/N] ", info.version))?;
    let answer = term.read_line()?;
    Ok(matches!(answer.trim().to_lowercase().as_str(), "y" | "yes"))
}

fn progress_bar(version: &Version, quiet: bool) -> Result<ProgressBar> {
    if quiet {
        return Ok(ProgressBar::hidden());
    }
    let bar = ProgressBar::new(100);
    bar.set_style(
        ProgressStyle::default_bar()
            .template("{msg} {spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}%")?
            .progress_chars("#>-"),
    );
    bar.set_message(format!("Downloading {}", version));
    Ok(bar)
}

fn run_config(action: ConfigAction) -> Result<i32> {
    let mut settings = load_stored_settings()?;

    match action {
        ConfigAction::Get { key } => match key {
            Some(key) => println!("{}", render_plain(&get_setting(&settings, &key)?)),
            None => print_plain(&settings)?,
        },
        ConfigAction::Set { key_value } => {
            let (key, value) = key_value
                .split_once('=')
                .ok_or_else(|| anyhow!("Invalid format. Use 'key=value'."))?;
            set_setting(&mut settings, key.trim(), value.trim())?;
            save_settings(&settings)?;
            tracing::info!("Setting '{}' updated to '{}'", key.trim(), value.trim());
        }
        ConfigAction::Unset { key } => {
            unset_setting(&mut settings, &key)?;
            save_settings(&settings)?;
            tracing::info!("Setting '{}' unset", key);
        }
        ConfigAction::Show { format } => match format.as_str() {
            "json" => println!("{}", serde_json::to_string_pretty(&settings)?),
            "yaml" => print!("{}", serde_yaml::to_string(&settings)?),
            "plain" => print_plain(&settings)?,
            other => bail!("Unknown format '{}'. Use json, yaml or plain", other),
        },
    }

    Ok(EXIT_OK)
}

fn print_plain(settings: &UpdraftSettings) -> Result<()> {
    if let Value::Object(map) = serde_json::to_value(settings)? {
        for (key, value) in map {
            println!("{}: {}", key, render_plain(&value));
        }
    }
    Ok(())
}

fn render_plain(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        Value::Array(items) => items.iter().map(render_plain).collect::<Vec<_>>().join(","),
        other => other.to_string(),
    }
}
