use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand, ValueEnum};
use phantom_core::ipc::{CredentialInput, IpcRequest, IpcResponse};
use phantom_core::ipc_client::connect;
use phantom_core::lifecycle::SystemEvent;
use phantom_core::model::{UnlockMode, VaultEvent};
use phantom_core::paths::{data_dir, ipc_secret_path, ipc_socket_path};
use phantom_core::secure_storage::read_ipc_secret;
use std::path::PathBuf;
use zeroize::Zeroizing;

#[derive(Parser)]
#[command(name = "phantom-cli")]
#[command(about = "CLI for the PhantomVault service", long_about = None)]
struct Cli {
    /// Service data directory (holds the ipc secret)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check that the service answers
    Ping,

    /// Service status and platform capabilities
    Status,

    /// List profiles (names and folder counts only)
    Profiles,

    /// Create a profile; prints the one-time recovery key
    CreateProfile { name: String },

    /// Delete a profile and its vault data
    DeleteProfile {
        profile_id: String,
        #[arg(long)]
        recovery_key: bool,
    },

    /// Change a profile's master password; prints the new recovery key
    ChangePassword {
        profile_id: String,
        #[arg(long)]
        recovery_key: bool,
    },

    /// Recover a master password from a recovery key
    Recover,

    /// List a profile's folders
    Folders {
        profile_id: String,
        #[arg(long)]
        recovery_key: bool,
    },

    /// Encrypt a folder into the vault and hide the original
    Lock {
        profile_id: String,
        path: PathBuf,
        #[arg(long)]
        recovery_key: bool,
    },

    /// Restore a locked folder
    Unlock {
        profile_id: String,
        folder_id: String,
        #[arg(long, value_enum, default_value = "temporary")]
        mode: ModeArg,
        #[arg(long)]
        recovery_key: bool,
    },

    /// Re-lock a temporarily unlocked folder
    Relock {
        profile_id: String,
        folder_id: String,
        #[arg(long)]
        recovery_key: bool,
    },

    /// Re-lock every temporarily unlocked folder
    LockAll,

    /// Bind (or with --clear, remove) a folder-specific unlock sequence
    BindSequence {
        profile_id: String,
        folder_id: String,
        #[arg(long)]
        clear: bool,
        #[arg(long)]
        recovery_key: bool,
    },

    /// Verify vault checksums for a profile
    Verify {
        profile_id: String,
        #[arg(long)]
        recovery_key: bool,
    },

    /// Type a sequence into the detector (for hosts without a keyboard hook)
    Type,

    /// Forward a system lifecycle signal
    Lifecycle {
        #[arg(value_enum)]
        event: EventArg,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum ModeArg {
    Temporary,
    Permanent,
}

impl From<ModeArg> for UnlockMode {
    fn from(m: ModeArg) -> Self {
        match m {
            ModeArg::Temporary => UnlockMode::Temporary,
            ModeArg::Permanent => UnlockMode::Permanent,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum EventArg {
    ScreenLock,
    Suspend,
    Logout,
    Reboot,
    Shutdown,
    Resume,
}

impl From<EventArg> for SystemEvent {
    fn from(e: EventArg) -> Self {
        match e {
            EventArg::ScreenLock => SystemEvent::ScreenLock,
            EventArg::Suspend => SystemEvent::Suspend,
            EventArg::Logout => SystemEvent::Logout,
            EventArg::Reboot => SystemEvent::Reboot,
            EventArg::Shutdown => SystemEvent::Shutdown,
            EventArg::Resume => SystemEvent::Resume,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let data = match cli.data_dir {
        Some(dir) => dir,
        None => data_dir()?,
    };
    let request = build_request(cli.command)?;

    let secret = read_ipc_secret(&ipc_secret_path(&data))?;
    let mut client = connect(&ipc_socket_path()?, &secret, "cli").await?;
    let response = client.request(request, print_event).await?;
    println!("{}", serde_json::to_string_pretty(&response)?);
    if let IpcResponse::Error { .. } = response {
        std::process::exit(1);
    }
    Ok(())
}

fn build_request(command: Commands) -> Result<IpcRequest> {
    let request = match command {
        Commands::Ping => IpcRequest::Ping,
        Commands::Status => IpcRequest::GetStatus,
        Commands::Profiles => IpcRequest::ListProfiles,
        Commands::CreateProfile { name } => IpcRequest::CreateProfile {
            name,
            password: prompt_new_password("New master password: ")?.to_string(),
        },
        Commands::DeleteProfile {
            profile_id,
            recovery_key,
        } => IpcRequest::DeleteProfile {
            profile_id,
            credential: credential(recovery_key)?,
        },
        Commands::ChangePassword {
            profile_id,
            recovery_key,
        } => IpcRequest::ChangePassword {
            profile_id,
            credential: credential(recovery_key)?,
            new_password: prompt_new_password("New master password: ")?.to_string(),
        },
        Commands::Recover => IpcRequest::RecoverMasterKey {
            recovery_key: prompt_secret("Recovery key: ")?.to_string(),
        },
        Commands::Folders {
            profile_id,
            recovery_key,
        } => IpcRequest::ListFolders {
            profile_id,
            credential: credential(recovery_key)?,
        },
        Commands::Lock {
            profile_id,
            path,
            recovery_key,
        } => {
            let path = std::fs::canonicalize(&path).unwrap_or(path);
            IpcRequest::LockFolder {
                profile_id,
                path: path.to_string_lossy().into_owned(),
                credential: credential(recovery_key)?,
            }
        }
        Commands::Unlock {
            profile_id,
            folder_id,
            mode,
            recovery_key,
        } => IpcRequest::UnlockFolder {
            profile_id,
            folder_id,
            mode: mode.into(),
            credential: credential(recovery_key)?,
        },
        Commands::Relock {
            profile_id,
            folder_id,
            recovery_key,
        } => IpcRequest::RelockFolder {
            profile_id,
            folder_id,
            credential: credential(recovery_key)?,
        },
        Commands::LockAll => IpcRequest::LockAll,
        Commands::BindSequence {
            profile_id,
            folder_id,
            clear,
            recovery_key,
        } => {
            let credential = credential(recovery_key)?;
            let sequence = if clear {
                None
            } else {
                Some(prompt_secret("Folder sequence: ")?.to_string())
            };
            IpcRequest::BindSequence {
                profile_id,
                folder_id,
                credential,
                sequence,
            }
        }
        Commands::Verify {
            profile_id,
            recovery_key,
        } => IpcRequest::ValidateIntegrity {
            profile_id,
            credential: credential(recovery_key)?,
        },
        Commands::Type => IpcRequest::PasswordInput {
            text: prompt_secret("Sequence (prefix + password): ")?.to_string(),
        },
        Commands::Lifecycle { event } => IpcRequest::SystemLifecycle { event: event.into() },
    };
    Ok(request)
}

fn print_event(event: VaultEvent) {
    match event {
        VaultEvent::Progress { done, total, .. } => eprintln!("progress: {done}/{total}"),
        other => eprintln!("{other:?}"),
    }
}

fn credential(recovery_key: bool) -> Result<CredentialInput> {
    if recovery_key {
        Ok(CredentialInput::RecoveryKey(prompt_secret("Recovery key: ")?.to_string()))
    } else {
        Ok(CredentialInput::Password(prompt_secret("Master password: ")?.to_string()))
    }
}

fn prompt_secret(prompt: &str) -> Result<Zeroizing<String>> {
    if let Ok(pw) = std::env::var("PHANTOM_PASSWORD") {
        if !pw.is_empty() {
            return Ok(Zeroizing::new(pw));
        }
    }
    let value = rpassword::prompt_password(prompt).map_err(|e| anyhow!("password prompt: {e}"))?;
    Ok(Zeroizing::new(value))
}

fn prompt_new_password(prompt: &str) -> Result<Zeroizing<String>> {
    if let Ok(pw) = std::env::var("PHANTOM_NEW_PASSWORD") {
        if !pw.is_empty() {
            return Ok(Zeroizing::new(pw));
        }
    }
    let first = Zeroizing::new(rpassword::prompt_password(prompt).map_err(|e| anyhow!("password prompt: {e}"))?);
    let second =
        Zeroizing::new(rpassword::prompt_password("Confirm password: ").map_err(|e| anyhow!("password prompt: {e}"))?);
    if first != second {
        return Err(anyhow!("passwords do not match"));
    }
    Ok(first)
}
