use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use serde_json::json;
use upshift_applier::{
    run_apply, ApplyRequest, ElevationBroker, HelperElevation, NoElevation, ProcessApplier,
};
use upshift_core::{ArchiveType, FailureReason, Update, UpdateDescriptor, UpdateState};
use upshift_downloader::{DownloadControl, Downloader, ProgressReport};
use upshift_engine::{ApplyMode, UpdateEngine};
use upshift_manager::UpdateManager;

use crate::config::UpdateConfig;
use crate::render;

#[derive(Parser, Debug)]
#[command(name = "upshift")]
#[command(about = "In-place application update engine", long_about = None)]
pub struct Cli {
    #[arg(long)]
    pub config: Option<PathBuf>,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Download and verify the patch for an offered update
    Download {
        /// TOML update descriptor produced by the update check
        #[arg(long)]
        descriptor: Option<PathBuf>,
        /// Continue the active update's interrupted download
        #[arg(long)]
        resume: bool,
    },
    /// Apply the downloaded patch to the install
    Apply {
        /// Patch a staging copy and swap it in at next launch
        #[arg(long)]
        stage: bool,
    },
    /// Swap a staged update into place (run this at application launch)
    Finalize,
    /// Resume or roll back an update interrupted by a crash
    Recover,
    /// Show the active update and the status marker
    Status {
        #[arg(long)]
        json: bool,
    },
    /// List finished updates, newest first
    History,
    /// Print the resolved update layout
    Doctor,
    /// Generate shell completions
    Completions { shell: Shell },
    /// Out-of-process apply step (internal)
    #[command(hide = true)]
    ApplyWorker {
        #[arg(long)]
        archive: PathBuf,
        #[arg(long)]
        archive_type: String,
        #[arg(long)]
        target: PathBuf,
        #[arg(long)]
        log: PathBuf,
    },
}

pub fn run_cli(cli: Cli) -> Result<()> {
    match cli.command {
        // The worker never goes through config loading; its whole contract
        // is the arguments and the exit code.
        Commands::ApplyWorker {
            archive,
            archive_type,
            target,
            log,
        } => {
            let archive_type = ArchiveType::parse(&archive_type)
                .ok_or_else(|| anyhow!("unknown archive type: {archive_type}"))?;
            let request = ApplyRequest {
                archive_path: archive,
                archive_type,
                target_dir: target,
                log_path: log,
            };
            std::process::exit(run_apply(&request).code());
        }
        command => run_main_command(cli.config.as_deref(), command),
    }
}

fn run_main_command(config_path: Option<&Path>, command: Commands) -> Result<()> {
    let config = UpdateConfig::load(config_path)?;
    let layout = config.layout()?;
    let manager = UpdateManager::load(layout.clone())?;

    match command {
        Commands::ApplyWorker { .. } => unreachable!("handled before config loading"),
        Commands::Download { descriptor, resume } => {
            let mut engine = build_engine(&config, manager)?;
            if resume {
                if engine.manager().active_update().is_none() {
                    return Err(anyhow!("no active update to resume"));
                }
            } else {
                let path = descriptor
                    .ok_or_else(|| anyhow!("--descriptor is required unless resuming"))?;
                let raw = fs::read_to_string(&path).with_context(|| {
                    format!("failed to read update descriptor: {}", path.display())
                })?;
                let descriptor = UpdateDescriptor::from_toml_str(&raw)?;
                let update = Update::from_descriptor(descriptor)?;
                render::print_status(
                    "offered",
                    &format!("{} {} ({})", update.id, update.version, update.channel),
                );
                engine.manager_mut().begin_update(update)?;
            }

            let state = run_download_with_progress(&mut engine)?;
            report_state(&engine, state);
        }
        Commands::Apply { stage } => {
            let mut engine = build_engine(&config, manager)?;
            let mode = if stage {
                ApplyMode::Staged
            } else {
                ApplyMode::Direct
            };
            let mut state = engine.run_apply(mode)?;
            if state == UpdateState::Downloading {
                // A partial patch did not fit this install; the machine fell
                // back to the complete patch and needs another download pass.
                render::print_status("fallback", "re-downloading the complete patch");
                let control = DownloadControl::new();
                state = engine.run(mode, &control, &mut |_| {})?;
            }
            report_state(&engine, state);
        }
        Commands::Finalize => {
            let mut engine = build_engine(&config, manager)?;
            let state = engine.finalize()?;
            report_state(&engine, state);
        }
        Commands::Recover => {
            let mut engine = build_engine(&config, manager)?;
            match engine.recover()? {
                Some(state) => report_state(&engine, state),
                None => render::print_status("ok", "nothing to recover"),
            }
        }
        Commands::Status { json } => {
            let status = manager.read_status()?;
            if json {
                let payload = json!({
                    "status": status.map(|status| status.to_line()),
                    "active": manager.active_update(),
                });
                println!("{}", serde_json::to_string_pretty(&payload)?);
            } else {
                match status {
                    Some(status) => render::print_status("marker", &status.to_line()),
                    None => render::print_status("marker", "absent"),
                }
                match manager.active_update() {
                    Some(update) => {
                        render::print_status(
                            "active",
                            &format!(
                                "{} {} ({})",
                                update.id,
                                update.version,
                                update.state.as_str()
                            ),
                        );
                        if let Some(patch) = update.selected_patch() {
                            render::print_status(
                                "patch",
                                &format!(
                                    "{} {} ({})",
                                    patch.patch_type.as_str(),
                                    render::format_kbytes(
                                        (patch.progress_bytes + 512) / 1024,
                                        (patch.byte_size + 512) / 1024
                                    ),
                                    patch.state.as_str()
                                ),
                            );
                        }
                    }
                    None => render::print_status("active", "none"),
                }
            }
        }
        Commands::History => {
            if manager.update_count() == 0 {
                println!("No finished updates.");
            }
            for index in 0..manager.update_count() {
                let update = manager.update_at(index).expect("index checked");
                let detail = match update.error_code {
                    Some(code) => format!("{} (code {code})", update.state.as_str()),
                    None => update.state.as_str().to_string(),
                };
                println!("{} {} {}", update.id, update.version, detail);
            }
        }
        Commands::Doctor => {
            println!("install: {}", layout.install_dir().display());
            println!("updates: {}", layout.updates_dir().display());
            println!("status:  {}", layout.status_path().display());
            println!("staged:  {}", layout.stage_dir().display());
            println!("worker:  {}", config.worker_binary()?.display());
            match &config.elevation_helper {
                Some(helper) => println!("helper:  {}", helper.display()),
                None => println!("helper:  (none, elevation unavailable)"),
            }
        }
        Commands::Completions { shell } => {
            clap_complete::generate(shell, &mut Cli::command(), "upshift", &mut io::stdout());
        }
    }

    Ok(())
}

fn build_engine(config: &UpdateConfig, manager: UpdateManager) -> Result<UpdateEngine> {
    let fetcher = Downloader::new(config.download_retries);
    let applier = ProcessApplier::new(config.worker_binary()?);
    let elevation = match &config.elevation_helper {
        Some(helper) => ElevationBroker::new(Box::new(HelperElevation::new(helper))),
        None => ElevationBroker::new(Box::new(NoElevation)),
    };
    Ok(UpdateEngine::new(
        manager,
        Box::new(fetcher),
        Box::new(applier),
        elevation,
    ))
}

fn run_download_with_progress(engine: &mut UpdateEngine) -> Result<UpdateState> {
    let total = engine
        .manager()
        .active_update()
        .and_then(|update| update.selected_patch())
        .map(|patch| patch.byte_size)
        .unwrap_or(0);
    let progress_bar = render::download_progress_bar(total);

    let control = DownloadControl::new();
    let state = engine.run_download(&control, &mut |report: ProgressReport| {
        progress_bar.set_length(report.total_bytes.max(1));
        progress_bar.set_position(report.bytes_so_far);
        progress_bar.set_message(render::format_transfer_status(
            report.bytes_so_far,
            report.total_bytes,
            report.elapsed_seconds,
        ));
    })?;
    progress_bar.finish_and_clear();
    Ok(state)
}

fn report_state(engine: &UpdateEngine, state: UpdateState) {
    match state {
        UpdateState::Succeeded => render::print_status("succeeded", "update installed"),
        UpdateState::Applied => {
            render::print_status("applied", "staged; the swap runs at next launch")
        }
        UpdateState::Pending => render::print_status("pending", "downloaded and verified"),
        UpdateState::Downloading => {
            render::print_status("paused", "download interrupted; resumable")
        }
        UpdateState::Failed => {
            let detail = engine
                .manager()
                .update_at(0)
                .and_then(|update| update.error_code)
                .map(FailureReason::from_code)
                .map(|reason| reason.describe().to_string())
                .unwrap_or_else(|| "update failed".to_string());
            render::print_status("failed", &detail);
        }
        other => render::print_status("state", other.as_str()),
    }
}
