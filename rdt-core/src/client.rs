//! Client-side operations: connect, negotiate, upload, download, close.
//!
//! The client mirrors the server's session walk from the other side: SYN
//! until SYN|ACK arrives, then the operation packet at sequence 1, a
//! confirming ACK, the data phase driven by the negotiated engine, and a
//! FIN exchange. The socket is polled with a short timeout so engine
//! timers fire even when the server goes quiet.

use crate::engine::{Engine, EngineConfig, ProtocolKind, TransferError};
use crate::packet::{
    parse_error_payload, ErrorCode, Operation, OperationRequest, Packet, MAX_PAYLOAD,
};
use rand::distributions::Alphanumeric;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UdpSocket;
use tokio::time::timeout;

const RECV_BUFFER: usize = 2048;
/// The sequence number clients stamp on their FIN.
const FIN_SEQ: u32 = 100;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("no SYN|ACK from the server after {0} attempts")]
    ConnectTimedOut(u32),
    #[error("operation was never acknowledged after {0} attempts")]
    NegotiationTimedOut(u32),
    #[error("server error {code}: {message}")]
    Server { code: ErrorCode, message: String },
    #[error(transparent)]
    Transfer(#[from] TransferError),
    #[error("the transfer stalled: nothing received for {0:?}")]
    IdleTimeout(Duration),
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server: SocketAddr,
    pub protocol: ProtocolKind,
    pub engine: EngineConfig,
    /// Wait per SYN or operation attempt.
    pub handshake_timeout: Duration,
    pub handshake_retries: u32,
    /// Wait per FIN attempt.
    pub fin_wait: Duration,
    pub fin_retries: u32,
    /// Socket poll period while driving an engine; keeps timers live.
    pub ack_poll: Duration,
    /// A download with no traffic for this long is abandoned.
    pub idle_timeout: Duration,
}

impl ClientConfig {
    pub fn new(server: SocketAddr, protocol: ProtocolKind) -> Self {
        Self {
            server,
            protocol,
            engine: EngineConfig::for_kind(protocol),
            handshake_timeout: Duration::from_millis(600),
            handshake_retries: 10,
            fin_wait: Duration::from_secs(2),
            fin_retries: 5,
            ack_poll: Duration::from_millis(10),
            idle_timeout: Duration::from_secs(5),
        }
    }
}

/// A connected client. [`Client::connect`] performs the SYN handshake;
/// one operation (upload or download) runs per connection, then
/// [`Client::close`] tears the session down.
pub struct Client {
    socket: UdpSocket,
    config: ClientConfig,
}

impl Client {
    /// Binds an ephemeral port and completes the SYN handshake.
    pub async fn connect(config: ClientConfig) -> Result<Self, ClientError> {
        let bind_addr: SocketAddr = if config.server.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(bind_addr).await?;
        socket.connect(config.server).await?;

        let syn = Packet::syn().encode();
        let mut buf = [0u8; RECV_BUFFER];
        for attempt in 1..=config.handshake_retries {
            socket.send(&syn).await?;
            match timeout(config.handshake_timeout, socket.recv(&mut buf)).await {
                Ok(Ok(len)) => {
                    if let Ok(reply) = Packet::decode(&buf[..len]) {
                        if reply.flags.syn() && reply.flags.ack() {
                            tracing::debug!(server = %config.server, "connection established");
                            return Ok(Self { socket, config });
                        }
                    }
                }
                Ok(Err(error)) => return Err(error.into()),
                Err(_) => {
                    tracing::debug!(attempt, "no SYN|ACK yet");
                }
            }
        }
        Err(ClientError::ConnectTimedOut(config.handshake_retries))
    }

    /// Sends the operation packet until the server acknowledges it, then
    /// confirms with ACK(1). The confirmation is what starts a download
    /// stream on the server.
    async fn negotiate(&self, operation: Operation, remote_name: &str) -> Result<(), ClientError> {
        let request = OperationRequest {
            operation,
            filename: remote_name.to_owned(),
            protocol: self.config.protocol,
        };
        let frame = Packet::operation(1, &request).encode();
        let mut buf = [0u8; RECV_BUFFER];
        for attempt in 1..=self.config.handshake_retries {
            self.socket.send(&frame).await?;
            match timeout(self.config.handshake_timeout, self.socket.recv(&mut buf)).await {
                Ok(Ok(len)) => {
                    let reply = match Packet::decode(&buf[..len]) {
                        Ok(reply) => reply,
                        Err(_) => continue,
                    };
                    if reply.flags.err() {
                        return Err(server_error(&reply));
                    }
                    // Leftover SYN|ACK replays also carry ACK; skip them.
                    if reply.flags.syn() || !reply.flags.ack() {
                        continue;
                    }
                    if reply.ack_number == 1 {
                        self.socket.send(&Packet::ack(1).encode()).await?;
                        return Ok(());
                    }
                    tracing::debug!(ack = reply.ack_number, "unexpected acknowledgment");
                }
                Ok(Err(error)) => return Err(error.into()),
                Err(_) => {
                    tracing::debug!(attempt, "operation not acknowledged yet");
                }
            }
        }
        Err(ClientError::NegotiationTimedOut(
            self.config.handshake_retries,
        ))
    }

    /// Uploads `source` under `remote_name` on the server. Returns the
    /// bytes sent.
    pub async fn upload(&self, source: &Path, remote_name: &str) -> Result<u64, ClientError> {
        let mut file = File::open(source).await?;
        self.negotiate(Operation::Upload, remote_name).await?;
        tracing::info!(source = %source.display(), remote_name, "uploading");

        let mut engine = Engine::new(self.config.protocol, self.config.engine);
        let mut chunk = [0u8; MAX_PAYLOAD];
        let mut buf = [0u8; RECV_BUFFER];
        let mut eof = false;
        let mut bytes_sent = 0u64;

        loop {
            while !eof && engine.window_available() {
                let read = file.read(&mut chunk).await?;
                if read == 0 {
                    eof = true;
                    break;
                }
                bytes_sent += read as u64;
                engine.push(chunk[..read].to_vec());
            }

            for frame in engine.poll_transmit(Instant::now())? {
                self.socket.send(&frame.encode()).await?;
            }

            if eof && engine.is_drained() {
                break;
            }

            match timeout(self.config.ack_poll, self.socket.recv(&mut buf)).await {
                Ok(Ok(len)) => {
                    if let Ok(reply) = Packet::decode(&buf[..len]) {
                        if reply.flags.err() {
                            return Err(server_error(&reply));
                        }
                        if reply.flags.ack() && !reply.flags.syn() {
                            engine.on_ack(&reply);
                        }
                    }
                }
                Ok(Err(error)) => return Err(error.into()),
                Err(_) => {} // let the engine's timers fire
            }
        }

        tracing::info!(bytes_sent, "upload complete");
        Ok(bytes_sent)
    }

    /// Downloads `remote_name` into `destination` (a file or directory
    /// path; the remote name in the current directory when absent).
    /// Returns the bytes received.
    pub async fn download(
        &self,
        remote_name: &str,
        destination: Option<&Path>,
    ) -> Result<u64, ClientError> {
        let final_path = resolve_destination(remote_name, destination);
        let (mut file, temp_path) = create_download_temp(&final_path).await?;

        match self.receive_into(&mut file, remote_name).await {
            Ok(bytes_received) => {
                file.flush().await?;
                file.sync_all().await?;
                drop(file);
                tokio::fs::rename(&temp_path, &final_path).await?;
                tracing::info!(
                    bytes_received,
                    destination = %final_path.display(),
                    "download complete"
                );
                Ok(bytes_received)
            }
            Err(error) => {
                drop(file);
                let _ = tokio::fs::remove_file(&temp_path).await;
                Err(error)
            }
        }
    }

    async fn receive_into(&self, file: &mut File, remote_name: &str) -> Result<u64, ClientError> {
        self.negotiate(Operation::Download, remote_name).await?;
        tracing::info!(remote_name, "downloading");

        let mut engine = Engine::new(self.config.protocol, self.config.engine);
        let mut buf = [0u8; RECV_BUFFER];
        let mut bytes_received = 0u64;

        loop {
            let len = match timeout(self.config.idle_timeout, self.socket.recv(&mut buf)).await {
                Ok(Ok(len)) => len,
                Ok(Err(error)) => return Err(error.into()),
                Err(_) => return Err(ClientError::IdleTimeout(self.config.idle_timeout)),
            };
            let packet = match Packet::decode(&buf[..len]) {
                Ok(packet) => packet,
                Err(_) => continue,
            };

            if packet.flags.data() {
                if let Some(delivery) = engine.on_data(&packet) {
                    if !delivery.bytes.is_empty() {
                        file.write_all(&delivery.bytes).await?;
                        bytes_received += delivery.bytes.len() as u64;
                    }
                    self.socket
                        .send(&Packet::ack(delivery.ack_number).encode())
                        .await?;
                }
            } else if packet.flags.fin() {
                self.socket
                    .send(&Packet::ack(packet.sequence_number).encode())
                    .await?;
                return Ok(bytes_received);
            } else if packet.flags.err() {
                return Err(server_error(&packet));
            }
            // Handshake replays and stray ACKs are harmless here.
        }
    }

    /// Ends the session with a FIN exchange. The socket closes regardless;
    /// the return value reports whether the server's FIN|ACK arrived.
    pub async fn close(self) -> Result<bool, ClientError> {
        let fin = Packet::fin(FIN_SEQ).encode();
        let mut buf = [0u8; RECV_BUFFER];
        for attempt in 1..=self.config.fin_retries {
            self.socket.send(&fin).await?;
            let deadline = Instant::now() + self.config.fin_wait;
            loop {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    break;
                }
                match timeout(remaining, self.socket.recv(&mut buf)).await {
                    Ok(Ok(len)) => {
                        if let Ok(reply) = Packet::decode(&buf[..len]) {
                            if reply.flags.fin() && reply.flags.ack() {
                                tracing::debug!("connection closed");
                                return Ok(true);
                            }
                        }
                    }
                    Ok(Err(error)) => return Err(error.into()),
                    Err(_) => break,
                }
            }
            tracing::debug!(attempt, "no FIN|ACK yet");
        }
        tracing::warn!("server did not acknowledge FIN");
        Ok(false)
    }
}

fn server_error(packet: &Packet) -> ClientError {
    match parse_error_payload(&packet.payload) {
        Ok((code, message)) => ClientError::Server { code, message },
        Err(_) => ClientError::Server {
            code: ErrorCode::FileAccess,
            message: String::from_utf8_lossy(&packet.payload).into_owned(),
        },
    }
}

/// A supplied destination may name the target file or a directory to put
/// it in; without one the remote name lands in the current directory.
fn resolve_destination(remote_name: &str, destination: Option<&Path>) -> PathBuf {
    match destination {
        Some(path) if path.is_dir() => path.join(remote_name),
        Some(path) => path.to_path_buf(),
        None => PathBuf::from(remote_name),
    }
}

/// Creates `.<name>.download.<suffix>` next to the final path so the
/// closing rename stays within one filesystem.
async fn create_download_temp(final_path: &Path) -> Result<(File, PathBuf), ClientError> {
    let directory = final_path.parent().filter(|p| !p.as_os_str().is_empty());
    let name = final_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| String::from("download"));
    let mut rng = SmallRng::from_entropy();
    loop {
        let suffix: String = (&mut rng)
            .sample_iter(&Alphanumeric)
            .take(8)
            .map(char::from)
            .collect();
        let temp_name = format!(".{name}.download.{suffix}");
        let temp_path = match directory {
            Some(directory) => directory.join(temp_name),
            None => PathBuf::from(temp_name),
        };
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&temp_path)
            .await
        {
            Ok(file) => return Ok((file, temp_path)),
            Err(error) if error.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(error) => return Err(error.into()),
        }
    }
}
