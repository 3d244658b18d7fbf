use crate::ipc::{
    compute_proof, AuthOk, ClientAuth, ClientHello, IpcEnvelope, IpcRequest, IpcResponse,
    RequestEnvelope, ServerChallenge, IPC_PROTOCOL_VERSION,
};
use crate::model::VaultEvent;
use anyhow::{anyhow, Result};
use rand::RngCore;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};

#[cfg(unix)]
use tokio::net::UnixStream;

#[cfg(windows)]
use tokio::net::windows::named_pipe::ClientOptions;

/// Authenticated session with the service.
pub struct IpcClient<S> {
    reader: BufReader<ReadHalf<S>>,
    writer: WriteHalf<S>,
    session_id: String,
    client_id: String,
    next_request_id: u64,
}

#[cfg(unix)]
pub async fn connect(socket_path: &std::path::Path, secret: &[u8], client_id: &str) -> Result<IpcClient<UnixStream>> {
    let stream = UnixStream::connect(socket_path)
        .await
        .map_err(|e| anyhow!("ipc connect {}: {e}", socket_path.display()))?;
    IpcClient::handshake(stream, secret, client_id).await
}

#[cfg(windows)]
pub async fn connect(
    socket_path: &std::path::Path,
    secret: &[u8],
    client_id: &str,
) -> Result<IpcClient<tokio::net::windows::named_pipe::NamedPipeClient>> {
    let stream = ClientOptions::new()
        .open(socket_path)
        .map_err(|e| anyhow!("ipc connect: {e}"))?;
    IpcClient::handshake(stream, secret, client_id).await
}

/// One-shot helper: connect, authenticate, send a single request.
pub async fn send_request(
    socket_path: std::path::PathBuf,
    secret: &[u8],
    request: IpcRequest,
) -> Result<IpcResponse> {
    let mut client = connect(&socket_path, secret, "cli").await?;
    client.request(request, |_| {}).await
}

impl<S> IpcClient<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub async fn handshake(stream: S, secret: &[u8], client_id: &str) -> Result<Self> {
        let (read_half, mut writer) = tokio::io::split(stream);
        let mut reader = BufReader::new(read_half);

        let hello = IpcEnvelope::ClientHello(ClientHello {
            protocol_version: IPC_PROTOCOL_VERSION,
            client_id: client_id.to_string(),
        });
        write_line(&mut writer, &hello).await?;

        let ServerChallenge {
            session_id,
            server_nonce,
        } = match read_envelope(&mut reader).await? {
            IpcEnvelope::ServerChallenge(c) => c,
            IpcEnvelope::Error { message } => return Err(anyhow!(message)),
            _ => return Err(anyhow!("expected ServerChallenge")),
        };

        let mut nonce_bytes = [0u8; 16];
        rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
        let client_nonce = hex::encode(nonce_bytes);
        let proof = compute_proof(secret, &server_nonce, &client_nonce)?;

        let auth = IpcEnvelope::ClientAuth(ClientAuth {
            session_id: session_id.clone(),
            client_nonce,
            proof,
        });
        write_line(&mut writer, &auth).await?;

        let AuthOk { session_id } = match read_envelope(&mut reader).await? {
            IpcEnvelope::AuthOk(ok) => ok,
            IpcEnvelope::Error { message } => return Err(anyhow!(message)),
            _ => return Err(anyhow!("expected AuthOk")),
        };

        Ok(Self {
            reader,
            writer,
            session_id,
            client_id: client_id.to_string(),
            next_request_id: 1,
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Sends `request` and waits for its response. Notifications for the
    /// request arrive through `on_event` first.
    pub async fn request<F>(&mut self, request: IpcRequest, mut on_event: F) -> Result<IpcResponse>
    where
        F: FnMut(VaultEvent),
    {
        let request_id = self.next_request_id;
        self.next_request_id += 1;
        let envelope = IpcEnvelope::Request(RequestEnvelope {
            session_id: self.session_id.clone(),
            client_id: self.client_id.clone(),
            request_id,
            request,
        });
        write_line(&mut self.writer, &envelope).await?;

        loop {
            match read_envelope(&mut self.reader).await? {
                IpcEnvelope::Response(r) if r.request_id == request_id => return Ok(r.response),
                IpcEnvelope::Notification(n) if n.request_id == request_id => on_event(n.event),
                IpcEnvelope::Response(_) | IpcEnvelope::Notification(_) => {}
                IpcEnvelope::Error { message } => return Err(anyhow!(message)),
                _ => return Err(anyhow!("unexpected message")),
            }
        }
    }
}

async fn write_line<W: AsyncWrite + Unpin>(writer: &mut W, envelope: &IpcEnvelope) -> Result<()> {
    writer.write_all(serde_json::to_string(envelope)?.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}

async fn read_envelope<R: AsyncRead + Unpin>(reader: &mut BufReader<R>) -> Result<IpcEnvelope> {
    let mut line = String::new();
    let n = reader.read_line(&mut line).await?;
    if n == 0 {
        return Err(anyhow!("connection closed by service"));
    }
    Ok(serde_json::from_str(line.trim_end())?)
}
