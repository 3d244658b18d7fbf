use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use phantom_core::detector::{keystroke_channel, spawn_detector, CandidateSet, DetectorConfig, SequenceSession};
use phantom_core::error::VaultError;
use phantom_core::ipc::IpcServer;
use phantom_core::lifecycle::SystemEvent;
use phantom_core::manager::{ManagerConfig, OperationControl, ProfileVaultManager};
use phantom_core::paths::{data_dir, ipc_secret_path, ipc_socket_path, sequence_secret_path, settings_path, vault_root};
use phantom_core::platform::{NativePlatform, PlatformAdapter};
use phantom_core::profile::ProfileStore;
use phantom_core::secure_storage::{load_or_create_secret, provision_ipc_secret};
use phantom_core::settings::ServiceSettings;
use phantom_core::throttle::AuthThrottle;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod detection;
mod handler;
mod service_state;

use crate::handler::ServiceHandler;
use crate::service_state::ServiceState;

#[derive(Parser, Debug)]
#[command(author, version, about = "PhantomVault folder protection service", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Write default settings and provision service secrets
    Init {
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
    /// Run the background service
    Run {
        #[arg(long)]
        data_dir: Option<PathBuf>,
        /// Settings file (defaults to <data-dir>/settings.json)
        #[arg(long)]
        settings: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let cli = Cli::parse();
    match cli.command {
        Commands::Init { data_dir } => init_command(data_dir),
        Commands::Run { data_dir, settings } => run_command(data_dir, settings).await,
    }
}

fn init_command(data_dir_override: Option<PathBuf>) -> Result<()> {
    let data = match data_dir_override {
        Some(dir) => dir,
        None => data_dir()?,
    };
    std::fs::create_dir_all(&data)?;
    let settings_file = settings_path(&data);
    if settings_file.exists() {
        return Err(anyhow!("already initialized at {}", data.display()));
    }
    let settings = ServiceSettings::default();
    settings.save(&settings_file)?;
    ProfileStore::open(vault_root(&data))?;
    provision_ipc_secret(&ipc_secret_path(&data))?;
    load_or_create_secret(&sequence_secret_path(&data))?;
    println!("Initialized PhantomVault data in {}", data.display());
    Ok(())
}

async fn run_command(data_dir_override: Option<PathBuf>, settings_override: Option<PathBuf>) -> Result<()> {
    let platform = Arc::new(NativePlatform::new());
    if !platform.is_elevated() {
        return Err(anyhow!(
            "the service must run with administrative privileges (root / Administrator) to protect folders"
        ));
    }

    let data = match data_dir_override {
        Some(dir) => dir,
        None => data_dir()?,
    };
    std::fs::create_dir_all(&data)?;
    let settings_file = settings_override.unwrap_or_else(|| settings_path(&data));
    let settings = ServiceSettings::load(&settings_file)
        .with_context(|| format!("load settings {}", settings_file.display()))?;

    let ipc_secret = provision_ipc_secret(&ipc_secret_path(&data))?;
    let sequence_secret = load_or_create_secret(&sequence_secret_path(&data))?;
    let root = settings.vault_root.clone().unwrap_or_else(|| vault_root(&data));
    let socket_path = match &settings.ipc_socket {
        Some(path) => path.clone(),
        None => ipc_socket_path()?,
    };

    let candidates = CandidateSet::new(sequence_secret, settings.detector.scope).shared();
    let manager = Arc::new(ProfileVaultManager::new(
        ProfileStore::open(&root)?,
        platform.clone(),
        ManagerConfig::from(&settings),
        candidates.clone(),
        AuthThrottle::new(&settings.auth),
    )?);

    let report = {
        let manager = manager.clone();
        tokio::task::spawn_blocking(move || manager.recover_on_startup()).await??
    };
    info!(
        staging_removed = report.staging_removed,
        locks_rolled_back = report.locks_rolled_back,
        locks_committed = report.locks_committed,
        orphans_removed = report.orphans_removed,
        rehidden = report.rehidden,
        left_exposed = report.left_exposed,
        "startup recovery complete"
    );

    let (sink, inputs) = keystroke_channel();
    let (detections_tx, detections_rx) = tokio::sync::mpsc::unbounded_channel();
    let session = SequenceSession::new(DetectorConfig::from(&settings.detector), candidates);
    let detector = spawn_detector(session, inputs, detections_tx)?;
    let keyboard_capture = match platform.register_keystroke_sink(sink.clone()) {
        Ok(()) => true,
        Err(VaultError::PlatformUnsupported(reason)) => {
            info!(%reason, "no keyboard hook; sequences arrive over the ipc password-input channel only");
            false
        }
        Err(e) => {
            warn!(error = %e, "keyboard hook registration failed");
            false
        }
    };

    let state = Arc::new(ServiceState::new(
        manager.clone(),
        &settings,
        sink,
        keyboard_capture,
        Some(detector),
    ));
    let detection_task = tokio::spawn(detection::run_detection_worker(state.clone(), detections_rx));

    let handler = Arc::new(ServiceHandler::new(state.clone()));
    let server = Arc::new(IpcServer::new(ipc_secret, socket_path));
    let server_task = {
        let server = server.clone();
        tokio::spawn(async move {
            if let Err(e) = server.start(handler).await {
                warn!(error = %e, "ipc server stopped");
            }
        })
    };

    info!(vault_root = %root.display(), "service started");
    wait_for_shutdown().await?;
    info!("service stopping");

    server_task.abort();
    let summary = {
        let manager = manager.clone();
        tokio::task::spawn_blocking(move || {
            manager.on_system_event(&OperationControl::system("shutdown"), SystemEvent::Shutdown)
        })
        .await?
    };
    match summary {
        Ok(s) => info!(relocked = s.relocked, left_exposed = s.left_exposed, failed = s.failed, "folders locked"),
        Err(e) => warn!(error = %e, "lock-all on shutdown failed"),
    }
    state.stop_detector();
    detection_task.abort();
    remove_socket(server.socket_path());
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown() -> Result<()> {
    let mut term = signal::unix::signal(signal::unix::SignalKind::terminate())?;
    tokio::select! {
        r = signal::ctrl_c() => r?,
        _ = term.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown() -> Result<()> {
    signal::ctrl_c().await?;
    Ok(())
}

fn remove_socket(path: &Path) {
    #[cfg(unix)]
    {
        let _ = std::fs::remove_file(path);
    }
    #[cfg(not(unix))]
    {
        let _ = path;
    }
}
