use crate::error::{ErrorCode, VaultError};
use crate::lifecycle::SystemEvent;
use crate::manager::{IntegrityReport, LockOutcome, RelockSummary};
use crate::model::{LockedFolder, ProfileSummary, UnlockMode, VaultEvent};
use crate::platform::Capabilities;
use anyhow::{anyhow, Result};
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};
use zeroize::Zeroizing;

pub const IPC_PROTOCOL_VERSION: u32 = 1;

/// Client identities accepted at handshake.
pub const ALLOWED_CLIENTS: &[&str] = &["gui", "cli"];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientHello {
    pub protocol_version: u32,
    pub client_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerChallenge {
    pub session_id: String,
    pub server_nonce: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientAuth {
    pub session_id: String,
    pub client_nonce: String,
    pub proof: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthOk {
    pub session_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum IpcEnvelope {
    ClientHello(ClientHello),
    ServerChallenge(ServerChallenge),
    ClientAuth(ClientAuth),
    AuthOk(AuthOk),
    Error { message: String },
    Request(RequestEnvelope),
    Response(ResponseEnvelope),
    Notification(NotificationEnvelope),
}

/// `request_id` doubles as the replay nonce and must strictly increase
/// within a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub session_id: String,
    pub client_id: String,
    pub request_id: u64,
    pub request: IpcRequest,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub session_id: String,
    pub request_id: u64,
    pub response: IpcResponse,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationEnvelope {
    pub session_id: String,
    pub request_id: u64,
    pub event: VaultEvent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", content = "secret", rename_all = "snake_case")]
pub enum CredentialInput {
    Password(String),
    RecoveryKey(String),
}

impl CredentialInput {
    pub fn into_credential(self) -> crate::manager::Credential {
        match self {
            CredentialInput::Password(s) => crate::manager::Credential::Password(Zeroizing::new(s)),
            CredentialInput::RecoveryKey(s) => crate::manager::Credential::RecoveryKey(Zeroizing::new(s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "request", content = "data")]
pub enum IpcRequest {
    Ping,
    GetStatus,
    ListProfiles,
    CreateProfile {
        name: String,
        password: String,
    },
    DeleteProfile {
        profile_id: String,
        credential: CredentialInput,
    },
    ChangePassword {
        profile_id: String,
        credential: CredentialInput,
        new_password: String,
    },
    RecoverMasterKey {
        recovery_key: String,
    },
    ListFolders {
        profile_id: String,
        credential: CredentialInput,
    },
    /// Folder add: encrypt into the vault and hide the original.
    LockFolder {
        profile_id: String,
        path: String,
        credential: CredentialInput,
    },
    UnlockFolder {
        profile_id: String,
        folder_id: String,
        mode: UnlockMode,
        credential: CredentialInput,
    },
    RelockFolder {
        profile_id: String,
        folder_id: String,
        credential: CredentialInput,
    },
    LockAll,
    BindSequence {
        profile_id: String,
        folder_id: String,
        credential: CredentialInput,
        sequence: Option<String>,
    },
    ValidateIntegrity {
        profile_id: String,
        credential: CredentialInput,
    },
    /// Keystroke fallback when no keyboard hook is available: the text is
    /// fed to the detector exactly as if typed after the hotkey.
    PasswordInput {
        text: String,
    },
    /// Cancels a running request of the caller's own session.
    Cancel {
        request_id: u64,
    },
    SystemLifecycle {
        event: SystemEvent,
    },
}

impl IpcRequest {
    pub fn name(&self) -> &'static str {
        match self {
            IpcRequest::Ping => "ping",
            IpcRequest::GetStatus => "get_status",
            IpcRequest::ListProfiles => "list_profiles",
            IpcRequest::CreateProfile { .. } => "create_profile",
            IpcRequest::DeleteProfile { .. } => "delete_profile",
            IpcRequest::ChangePassword { .. } => "change_password",
            IpcRequest::RecoverMasterKey { .. } => "recover_master_key",
            IpcRequest::ListFolders { .. } => "list_folders",
            IpcRequest::LockFolder { .. } => "lock_folder",
            IpcRequest::UnlockFolder { .. } => "unlock_folder",
            IpcRequest::RelockFolder { .. } => "relock_folder",
            IpcRequest::LockAll => "lock_all",
            IpcRequest::BindSequence { .. } => "bind_sequence",
            IpcRequest::ValidateIntegrity { .. } => "validate_integrity",
            IpcRequest::PasswordInput { .. } => "password_input",
            IpcRequest::Cancel { .. } => "cancel",
            IpcRequest::SystemLifecycle { .. } => "system_lifecycle",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceStatus {
    pub version: String,
    pub capabilities: Capabilities,
    pub detector_running: bool,
    pub active_operations: usize,
    pub exposed_folders: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "response", content = "data")]
pub enum IpcResponse {
    Pong,
    Status(ServiceStatus),
    Profiles {
        profiles: Vec<ProfileSummary>,
    },
    ProfileCreated {
        profile_id: String,
        recovery_key: String,
    },
    ProfileDeleted,
    PasswordChanged {
        recovery_key: String,
    },
    MasterKeyRecovered {
        profile_id: String,
        master_password: String,
    },
    Folders {
        folders: Vec<LockedFolder>,
    },
    FolderLocked(LockOutcome),
    FolderUnlocked {
        folder_id: String,
        original_path: String,
        mode: UnlockMode,
    },
    FolderRelocked {
        folder_id: String,
        hidden: bool,
    },
    LockedAll(RelockSummary),
    SequenceBound {
        folder_id: String,
        bound: bool,
    },
    Integrity(IntegrityReport),
    /// Input handed to the detector. A match is acted on asynchronously.
    InputAccepted,
    CancelRequested {
        found: bool,
    },
    LifecycleHandled(RelockSummary),
    Error {
        code: ErrorCode,
        message: String,
    },
}

impl From<&VaultError> for IpcResponse {
    fn from(err: &VaultError) -> Self {
        IpcResponse::Error {
            code: err.code(),
            message: err.public_message().to_string(),
        }
    }
}

/// Per-request data handed to the handler.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub session_id: String,
    pub client_id: String,
    pub request_id: u64,
    /// Events pushed here reach the requesting client as notifications.
    pub events: mpsc::UnboundedSender<VaultEvent>,
}

impl RequestContext {
    /// Stable identifier used for progress events and cancellation.
    pub fn operation_id(&self) -> String {
        operation_id(&self.session_id, self.request_id)
    }

    /// Throttling key.
    pub fn source(&self) -> String {
        format!("ipc:{}", self.client_id)
    }
}

pub fn operation_id(session_id: &str, request_id: u64) -> String {
    format!("{session_id}:{request_id}")
}

#[derive(Debug, Clone)]
pub struct SessionState {
    pub last_nonce: u64,
}

pub struct IpcAuthContext {
    shared_secret: Zeroizing<Vec<u8>>,
    sessions: Arc<Mutex<HashMap<String, SessionState>>>,
}

impl IpcAuthContext {
    pub fn new(shared_secret: Zeroizing<Vec<u8>>) -> Self {
        Self {
            shared_secret,
            sessions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn compute_proof(&self, server_nonce: &str, client_nonce: &str) -> Result<String> {
        compute_proof(&self.shared_secret, server_nonce, client_nonce)
    }

    pub async fn register_session(&self, session_id: String) {
        let mut guard = self.sessions.lock().await;
        guard.insert(session_id, SessionState { last_nonce: 0 });
    }

    pub async fn end_session(&self, session_id: &str) {
        self.sessions.lock().await.remove(session_id);
    }

    pub async fn verify_and_update_nonce(&self, session_id: &str, nonce: u64) -> Result<()> {
        let mut sessions = self.sessions.lock().await;
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| anyhow!("unknown session"))?;
        if nonce <= session.last_nonce {
            return Err(anyhow!("replay detected: nonce not increasing"));
        }
        session.last_nonce = nonce;
        Ok(())
    }
}

pub(crate) fn compute_proof(secret: &[u8], server_nonce: &str, client_nonce: &str) -> Result<String> {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret).map_err(|e| anyhow!("mac init: {e}"))?;
    mac.update(server_nonce.as_bytes());
    mac.update(client_nonce.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

#[async_trait::async_trait]
pub trait IpcHandler {
    async fn handle(&self, ctx: RequestContext, req: IpcRequest) -> IpcResponse;
}

pub struct IpcServer {
    auth: Arc<IpcAuthContext>,
    socket_path: std::path::PathBuf,
}

impl IpcServer {
    pub fn new(auth_secret: Zeroizing<Vec<u8>>, socket_path: std::path::PathBuf) -> Self {
        Self {
            auth: Arc::new(IpcAuthContext::new(auth_secret)),
            socket_path,
        }
    }

    pub fn socket_path(&self) -> &std::path::Path {
        &self.socket_path
    }

    #[cfg(unix)]
    pub async fn start(self: Arc<Self>, handler: Arc<dyn IpcHandler + Send + Sync>) -> Result<()> {
        use std::os::unix::fs::PermissionsExt;
        use tokio::net::UnixListener;
        if self.socket_path.exists() {
            let _ = std::fs::remove_file(&self.socket_path);
        }
        let listener = UnixListener::bind(&self.socket_path)?;
        std::fs::set_permissions(&self.socket_path, std::fs::Permissions::from_mode(0o600))?;
        tracing::info!(socket = %self.socket_path.display(), "ipc server listening");
        loop {
            let (stream, _addr) = listener.accept().await?;
            let auth = self.auth.clone();
            let handler = handler.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, auth, handler).await {
                    warn!(error = %e, "ipc connection error");
                }
            });
        }
    }

    #[cfg(windows)]
    pub async fn start(self: Arc<Self>, handler: Arc<dyn IpcHandler + Send + Sync>) -> Result<()> {
        use tokio::net::windows::named_pipe::ServerOptions;
        let mut server = ServerOptions::new()
            .first_pipe_instance(true)
            .create(&self.socket_path)?;
        tracing::info!(pipe = %self.socket_path.display(), "ipc server listening");
        loop {
            server.connect().await?;
            let connected = server;
            server = ServerOptions::new().create(&self.socket_path)?;
            let auth = self.auth.clone();
            let handler = handler.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(connected, auth, handler).await {
                    warn!(error = %e, "ipc connection error");
                }
            });
        }
    }
}

async fn write_envelope<W>(writer: &mut W, envelope: &IpcEnvelope) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(serde_json::to_string(envelope)?.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}

pub(crate) async fn handle_connection<S>(
    stream: S,
    auth: Arc<IpcAuthContext>,
    handler: Arc<dyn IpcHandler + Send + Sync>,
) -> Result<()>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let (read_half, mut writer) = tokio::io::split(stream);
    let mut reader = BufReader::new(read_half);

    let mut line = String::new();
    let n = reader.read_line(&mut line).await?;
    if n == 0 {
        return Err(anyhow!("empty hello"));
    }
    let envelope: IpcEnvelope = serde_json::from_str(line.trim_end())?;
    let hello = match envelope {
        IpcEnvelope::ClientHello(h) => h,
        _ => return Err(anyhow!("expected ClientHello")),
    };
    if hello.protocol_version != IPC_PROTOCOL_VERSION {
        write_envelope(
            &mut writer,
            &IpcEnvelope::Error {
                message: "protocol version mismatch".to_string(),
            },
        )
        .await?;
        return Err(anyhow!("protocol version mismatch"));
    }
    if !ALLOWED_CLIENTS.contains(&hello.client_id.as_str()) {
        return Err(anyhow!("unauthorized client"));
    }
    let client_id = hello.client_id;

    let session_id = uuid::Uuid::new_v4().to_string();
    let mut server_nonce_bytes = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut server_nonce_bytes);
    let server_nonce = hex::encode(server_nonce_bytes);

    let challenge = IpcEnvelope::ServerChallenge(ServerChallenge {
        session_id: session_id.clone(),
        server_nonce: server_nonce.clone(),
    });
    write_envelope(&mut writer, &challenge).await?;

    line.clear();
    let n = reader.read_line(&mut line).await?;
    if n == 0 {
        return Err(anyhow!("missing client auth"));
    }
    let envelope: IpcEnvelope = serde_json::from_str(line.trim_end())?;
    let auth_msg = match envelope {
        IpcEnvelope::ClientAuth(m) => m,
        _ => return Err(anyhow!("expected ClientAuth")),
    };
    if auth_msg.session_id != session_id {
        return Err(anyhow!("session id mismatch"));
    }
    let expected = auth.compute_proof(&server_nonce, &auth_msg.client_nonce)?;
    if !crate::crypto::constant_time_eq(expected.as_bytes(), auth_msg.proof.as_bytes()) {
        write_envelope(
            &mut writer,
            &IpcEnvelope::Error {
                message: "authentication failed".to_string(),
            },
        )
        .await?;
        return Err(anyhow!("invalid proof"));
    }

    auth.register_session(session_id.clone()).await;
    write_envelope(
        &mut writer,
        &IpcEnvelope::AuthOk(AuthOk {
            session_id: session_id.clone(),
        }),
    )
    .await?;
    debug!(client_id = %client_id, "ipc session established");

    // Requests run concurrently; one writer task serializes everything sent back.
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<IpcEnvelope>();
    let writer_task = tokio::spawn(async move {
        while let Some(envelope) = out_rx.recv().await {
            if let Err(e) = write_envelope(&mut writer, &envelope).await {
                debug!(error = %e, "ipc writer closed");
                break;
            }
        }
    });

    let result = read_requests(&mut reader, &auth, &handler, &session_id, &client_id, &out_tx).await;
    auth.end_session(&session_id).await;
    drop(out_tx);
    let _ = writer_task.await;
    result
}

async fn read_requests<R>(
    reader: &mut BufReader<R>,
    auth: &Arc<IpcAuthContext>,
    handler: &Arc<dyn IpcHandler + Send + Sync>,
    session_id: &str,
    client_id: &str,
    out_tx: &mpsc::UnboundedSender<IpcEnvelope>,
) -> Result<()>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut line = String::new();
    loop {
        line.clear();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            return Ok(());
        }
        let env: IpcEnvelope = serde_json::from_str(line.trim_end())?;
        let req_env = match env {
            IpcEnvelope::Request(r) => r,
            _ => return Err(anyhow!("expected Request envelope")),
        };
        if req_env.session_id != session_id || req_env.client_id != client_id {
            return Err(anyhow!("session mismatch"));
        }
        if let Err(e) = auth.verify_and_update_nonce(session_id, req_env.request_id).await {
            let _ = out_tx.send(IpcEnvelope::Error {
                message: e.to_string(),
            });
            return Err(e);
        }

        let request_id = req_env.request_id;
        if let IpcRequest::Ping = req_env.request {
            let _ = out_tx.send(IpcEnvelope::Response(ResponseEnvelope {
                session_id: session_id.to_string(),
                request_id,
                response: IpcResponse::Pong,
            }));
            continue;
        }

        let (events_tx, mut events_rx) = mpsc::unbounded_channel::<VaultEvent>();
        let ctx = RequestContext {
            session_id: session_id.to_string(),
            client_id: client_id.to_string(),
            request_id,
            events: events_tx,
        };
        let handler = handler.clone();
        let out = out_tx.clone();
        let session = session_id.to_string();
        tokio::spawn(async move {
            let forward_out = out.clone();
            let forward_session = session.clone();
            let forwarder = tokio::spawn(async move {
                while let Some(event) = events_rx.recv().await {
                    let _ = forward_out.send(IpcEnvelope::Notification(NotificationEnvelope {
                        session_id: forward_session.clone(),
                        request_id,
                        event,
                    }));
                }
            });
            let response = handler.handle(ctx, req_env.request).await;
            // Every event of this request goes out before its response.
            let _ = forwarder.await;
            let _ = out.send(IpcEnvelope::Response(ResponseEnvelope {
                session_id: session,
                request_id,
                response,
            }));
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secret() -> Zeroizing<Vec<u8>> {
        Zeroizing::new(vec![1, 2, 3, 4])
    }

    #[tokio::test]
    async fn proof_changes_with_nonce() {
        let ctx = IpcAuthContext::new(secret());
        let p1 = ctx.compute_proof("abc", "def").unwrap();
        let p2 = ctx.compute_proof("abc", "xyz").unwrap();
        assert_ne!(p1, p2);
    }

    #[tokio::test]
    async fn nonce_replay_rejected() {
        let ctx = IpcAuthContext::new(secret());
        ctx.register_session("s1".to_string()).await;
        ctx.verify_and_update_nonce("s1", 1).await.unwrap();
        assert!(ctx.verify_and_update_nonce("s1", 1).await.is_err());
        ctx.verify_and_update_nonce("s1", 5).await.unwrap();
        assert!(ctx.verify_and_update_nonce("s1", 4).await.is_err());
    }

    #[tokio::test]
    async fn ended_session_rejects_requests() {
        let ctx = IpcAuthContext::new(secret());
        ctx.register_session("s1".to_string()).await;
        ctx.end_session("s1").await;
        assert!(ctx.verify_and_update_nonce("s1", 1).await.is_err());
    }

    #[test]
    fn envelope_wire_shape() {
        let env = IpcEnvelope::Request(RequestEnvelope {
            session_id: "s".into(),
            client_id: "gui".into(),
            request_id: 7,
            request: IpcRequest::UnlockFolder {
                profile_id: "p".into(),
                folder_id: "f".into(),
                mode: UnlockMode::Temporary,
                credential: CredentialInput::Password("pw".into()),
            },
        });
        let v: serde_json::Value = serde_json::to_value(&env).unwrap();
        assert_eq!(v["type"], "Request");
        assert_eq!(v["payload"]["request_id"], 7);
        assert_eq!(v["payload"]["client_id"], "gui");
        assert_eq!(v["payload"]["request"]["request"], "UnlockFolder");
        assert_eq!(v["payload"]["request"]["data"]["credential"]["kind"], "password");
    }

    #[test]
    fn error_response_uses_public_message() {
        match IpcResponse::from(&VaultError::RateLimited) {
            IpcResponse::Error { code, message } => {
                assert_eq!(code, ErrorCode::AuthenticationFailed);
                assert_eq!(message, VaultError::AuthenticationFailed.public_message());
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
