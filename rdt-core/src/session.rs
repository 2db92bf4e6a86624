//! Per-peer connection state on the server.
//!
//! A session is created by the dispatcher on the first datagram from a new
//! endpoint and walks CLOSED → SYN_RECEIVED → OP_NEGOTIATED → DATA →
//! CLOSING. All handling for one peer is serialized by the session's mutex;
//! the only exception is an active DOWNLOAD, whose sender runs on its own
//! task and owns the engine exclusively, fed acknowledgments over a
//! channel.

use crate::engine::{Engine, EngineConfig, ProtocolKind};
use crate::packet::{ErrorCode, Operation, OperationRequest, Packet, MAX_PAYLOAD};
use crate::storage::Storage;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex};

/// How often the download sender checks its slot timers while waiting for
/// acknowledgments.
const ACK_POLL: Duration = Duration::from_millis(10);
/// FIN retransmissions at the end of a download.
const FIN_RETRIES: u32 = 5;
const FIN_WAIT: Duration = Duration::from_secs(2);

/// Connection lifecycle states, server-side view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Closed,
    SynReceived,
    OpNegotiated,
    Data,
    Closing,
}

/// What the dispatcher should do with the session after a packet was
/// handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Keep,
    Remove,
}

pub struct Session {
    peer: SocketAddr,
    socket: Arc<UdpSocket>,
    storage: Arc<Storage>,
    inner: Mutex<Inner>,
}

struct Inner {
    state: SessionState,
    connected: bool,
    expected_seq: u32,
    operation: Option<Operation>,
    filename: Option<String>,
    protocol: Option<ProtocolKind>,
    engine: Option<Engine>,
    upload: Option<UploadSink>,
    download_started: bool,
    download_acks: Option<mpsc::UnboundedSender<Packet>>,
    last_activity: Instant,
}

struct UploadSink {
    file: File,
    temp_path: PathBuf,
}

impl Session {
    pub fn new(peer: SocketAddr, socket: Arc<UdpSocket>, storage: Arc<Storage>) -> Self {
        Self {
            peer,
            socket,
            storage,
            inner: Mutex::new(Inner {
                state: SessionState::Closed,
                connected: false,
                expected_seq: 0,
                operation: None,
                filename: None,
                protocol: None,
                engine: None,
                upload: None,
                download_started: false,
                download_acks: None,
                last_activity: Instant::now(),
            }),
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// How long this session has been idle, when its lock is free. A held
    /// lock means the session is mid-handling and must not be reaped.
    pub fn try_idle_for(&self) -> Option<Duration> {
        self.inner
            .try_lock()
            .ok()
            .map(|inner| inner.last_activity.elapsed())
    }

    /// Handles one validated frame from this session's peer.
    pub async fn handle(&self, packet: Packet) -> Verdict {
        let mut inner = self.inner.lock().await;
        inner.last_activity = Instant::now();

        if packet.flags.syn() {
            self.handle_syn(&mut inner).await;
            Verdict::Keep
        } else if packet.flags.data() {
            self.handle_data(&mut inner, packet).await
        } else if packet.flags.fin() {
            self.handle_fin(&mut inner, packet).await;
            Verdict::Remove
        } else if packet.flags.ack() {
            self.handle_ack(&mut inner, packet);
            Verdict::Keep
        } else {
            tracing::debug!(peer = %self.peer, "frame with no actionable flags");
            Verdict::Keep
        }
    }

    async fn handle_syn(&self, inner: &mut Inner) {
        tracing::debug!(peer = %self.peer, "SYN received");
        // A duplicate SYN repeats the reply. It must not rewind a session
        // that already negotiated its operation.
        if inner.operation.is_none() {
            inner.expected_seq = 1;
            inner.state = SessionState::SynReceived;
        }
        inner.connected = true;
        self.send(Packet::syn_ack()).await;
    }

    async fn handle_data(&self, inner: &mut Inner, packet: Packet) -> Verdict {
        if !inner.connected {
            tracing::debug!(peer = %self.peer, "DATA before SYN dropped");
            return Verdict::Keep;
        }

        if inner.operation.is_none() {
            self.negotiate(inner, packet).await;
            return Verdict::Keep;
        }

        let sequence = packet.sequence_number;

        // A replayed operation packet means our ACK was lost; repeat it.
        // Only before any data has been delivered: once the data phase is
        // under way, stop-and-wait legitimately reuses sequence 1.
        if sequence == 1 && inner.state == SessionState::OpNegotiated {
            self.send(Packet::ack(1)).await;
            return Verdict::Keep;
        }

        match inner.protocol {
            Some(ProtocolKind::StopAndWait) if sequence > 1 => {
                tracing::debug!(peer = %self.peer, sequence, "sequence outside stop-and-wait space");
                return Verdict::Keep;
            }
            Some(ProtocolKind::SelectiveRepeat) if sequence < 2 => {
                tracing::debug!(peer = %self.peer, sequence, "sequence below the data phase");
                return Verdict::Keep;
            }
            _ => {}
        }

        if inner.operation != Some(Operation::Upload)
            || !matches!(
                inner.state,
                SessionState::OpNegotiated | SessionState::Data
            )
        {
            tracing::debug!(peer = %self.peer, "DATA outside an upload's data phase");
            return Verdict::Keep;
        }

        let engine = match inner.engine.as_mut() {
            Some(engine) => engine,
            None => {
                let expected = inner.expected_seq;
                self.send(Packet::error(
                    expected,
                    ErrorCode::OperationNotSet,
                    "OPERATION was not set correctly",
                ))
                .await;
                return Verdict::Keep;
            }
        };

        let delivery = match engine.on_data(&packet) {
            Some(delivery) => delivery,
            // Outside the receive window entirely; the sender recovers via
            // its own timers.
            None => return Verdict::Keep,
        };
        inner.expected_seq = engine.expected_seq();
        inner.state = SessionState::Data;

        if !delivery.bytes.is_empty() {
            if let Some(upload) = inner.upload.as_mut() {
                if let Err(error) = upload.file.write_all(&delivery.bytes).await {
                    tracing::error!(peer = %self.peer, %error, "upload write failed");
                    let expected = inner.expected_seq;
                    self.send(Packet::error(
                        expected,
                        ErrorCode::WriteFailed,
                        "Error writing file data",
                    ))
                    .await;
                    self.abort_upload(inner).await;
                    return Verdict::Remove;
                }
            }
        }

        self.send(Packet::ack(delivery.ack_number)).await;
        Verdict::Keep
    }

    /// Parses the operation packet (DATA, seq=1) and stages the transfer:
    /// open a temp file for an upload, check existence for a download.
    async fn negotiate(&self, inner: &mut Inner, packet: Packet) {
        if inner.state != SessionState::SynReceived
            || inner.expected_seq != 1
            || packet.sequence_number != 1
        {
            tracing::debug!(
                peer = %self.peer,
                sequence = packet.sequence_number,
                "expected the operation packet"
            );
            return;
        }

        let request = match OperationRequest::parse(&packet.payload) {
            Ok(request) => request,
            Err(error) => {
                tracing::warn!(peer = %self.peer, %error, "malformed operation packet");
                self.send(Packet::error(
                    1,
                    ErrorCode::OperationNotSet,
                    "OPERATION was not set correctly",
                ))
                .await;
                return;
            }
        };

        tracing::info!(
            peer = %self.peer,
            operation = %request.operation,
            filename = %request.filename,
            protocol = %request.protocol,
            "operation negotiated"
        );

        match request.operation {
            Operation::Upload => {
                let (file, temp_path) =
                    match self.storage.create_upload_temp(&request.filename).await {
                        Ok(staged) => staged,
                        Err(error) => {
                            tracing::warn!(peer = %self.peer, %error, "cannot stage upload");
                            self.send(Packet::error(
                                1,
                                ErrorCode::CannotCreateFile,
                                &format!("Could not create file with name {}", request.filename),
                            ))
                            .await;
                            return;
                        }
                    };
                inner.upload = Some(UploadSink { file, temp_path });
            }
            Operation::Download => {
                if Storage::validate_name(&request.filename).is_err()
                    || !self.storage.exists(&request.filename)
                {
                    tracing::warn!(peer = %self.peer, filename = %request.filename, "download of missing file");
                    self.send(Packet::error(
                        1,
                        ErrorCode::FileNotFound,
                        &format!("Could not find file with name {}", request.filename),
                    ))
                    .await;
                    return;
                }
            }
        }

        inner.engine = Some(Engine::new(
            request.protocol,
            EngineConfig::for_kind(request.protocol),
        ));
        inner.expected_seq = request.protocol.initial_data_seq();
        inner.operation = Some(request.operation);
        inner.protocol = Some(request.protocol);
        inner.filename = Some(request.filename);
        inner.state = SessionState::OpNegotiated;
        self.send(Packet::ack(1)).await;
    }

    fn handle_ack(&self, inner: &mut Inner, packet: Packet) {
        // The confirming ACK of the operation packet starts the download
        // stream; it must not be mistaken for a data acknowledgment.
        if packet.ack_number == 1
            && inner.operation == Some(Operation::Download)
            && inner.state == SessionState::OpNegotiated
            && !inner.download_started
        {
            let (engine, filename) = match (inner.engine.take(), inner.filename.clone()) {
                (Some(engine), Some(filename)) => (engine, filename),
                _ => return,
            };
            inner.download_started = true;
            inner.state = SessionState::Data;
            let (ack_tx, ack_rx) = mpsc::unbounded_channel();
            inner.download_acks = Some(ack_tx);
            let sender = DownloadSender {
                peer: self.peer,
                socket: self.socket.clone(),
                storage: self.storage.clone(),
                filename,
                engine,
                acks: ack_rx,
            };
            tokio::spawn(sender.run());
            return;
        }

        if let Some(acks) = inner.download_acks.as_ref() {
            // The sender task may have finished already; stale ACKs are fine
            // to lose.
            let _ = acks.send(packet);
        }
    }

    async fn handle_fin(&self, inner: &mut Inner, packet: Packet) {
        tracing::debug!(peer = %self.peer, "FIN received");
        if let Some(upload) = inner.upload.take() {
            self.finalize_upload(inner, upload).await;
        }
        inner.state = SessionState::Closing;
        inner.connected = false;
        inner.download_acks = None;
        self.send(Packet::fin_ack(packet.sequence_number.wrapping_add(1)))
            .await;
        inner.state = SessionState::Closed;
        tracing::info!(peer = %self.peer, "session closed");
    }

    async fn finalize_upload(&self, inner: &mut Inner, upload: UploadSink) {
        let filename = match inner.filename.as_deref() {
            Some(filename) => filename,
            None => return,
        };
        let UploadSink { mut file, temp_path } = upload;
        let flushed: Result<(), std::io::Error> = async {
            file.flush().await?;
            file.sync_all().await?;
            Ok(())
        }
        .await;
        drop(file);
        let result = match flushed {
            Ok(()) => self
                .storage
                .finalize_upload(filename, &temp_path)
                .await
                .map_err(|error| error.to_string()),
            Err(error) => Err(error.to_string()),
        };
        if let Err(error) = result {
            tracing::error!(peer = %self.peer, filename, %error, "upload finalization failed");
            self.storage.discard_upload(&temp_path).await;
        }
    }

    async fn abort_upload(&self, inner: &mut Inner) {
        if let Some(UploadSink { file, temp_path }) = inner.upload.take() {
            drop(file);
            self.storage.discard_upload(&temp_path).await;
        }
        inner.state = SessionState::Closing;
        inner.connected = false;
    }

    /// Drops any in-progress upload without finalizing. Used when the peer
    /// goes silent and the session is reaped.
    pub async fn abandon(&self) {
        let mut inner = self.inner.lock().await;
        if let Some(UploadSink { file, temp_path }) = inner.upload.take() {
            drop(file);
            self.storage.discard_upload(&temp_path).await;
        }
        inner.download_acks = None;
        inner.state = SessionState::Closed;
        inner.connected = false;
    }

    async fn send(&self, packet: Packet) {
        if let Err(error) = self.socket.send_to(&packet.encode(), self.peer).await {
            tracing::warn!(peer = %self.peer, %error, "send failed");
        }
    }
}

/// The background task streaming a file to a downloading peer. It owns the
/// session's engine for the whole transfer; the dispatcher forwards this
/// peer's acknowledgments over `acks`.
struct DownloadSender {
    peer: SocketAddr,
    socket: Arc<UdpSocket>,
    storage: Arc<Storage>,
    filename: String,
    engine: Engine,
    acks: mpsc::UnboundedReceiver<Packet>,
}

impl DownloadSender {
    #[tracing::instrument(name = "download", skip_all, fields(peer = %self.peer, filename = %self.filename))]
    async fn run(mut self) {
        // Readers hold the file lock for the whole transfer so a concurrent
        // upload cannot swap the file out underneath us.
        let _guard = self.storage.read_lock(&self.filename).await;
        let mut file = match self.storage.open_for_download(&self.filename).await {
            Ok(file) => file,
            Err(error) => {
                tracing::warn!(%error, "download open failed");
                self.send(Packet::error(
                    1,
                    ErrorCode::FileAccess,
                    &format!("Error accessing file {}", self.filename),
                ))
                .await;
                return;
            }
        };

        match self.stream(&mut file).await {
            Ok(bytes_sent) => {
                tracing::info!(bytes_sent, "download complete");
            }
            Err(error) => {
                tracing::warn!(%error, "download failed");
            }
        }
    }

    async fn stream(&mut self, file: &mut File) -> Result<u64, String> {
        let mut chunk = [0u8; MAX_PAYLOAD];
        let mut eof = false;
        let mut bytes_sent = 0u64;

        loop {
            while !eof && self.engine.window_available() {
                let read = file.read(&mut chunk).await.map_err(|e| e.to_string())?;
                if read == 0 {
                    eof = true;
                    break;
                }
                bytes_sent += read as u64;
                self.engine.push(chunk[..read].to_vec());
            }

            let due = self
                .engine
                .poll_transmit(Instant::now())
                .map_err(|e| e.to_string())?;
            for frame in due {
                self.send(frame).await;
            }

            if eof && self.engine.is_drained() {
                break;
            }

            match tokio::time::timeout(ACK_POLL, self.acks.recv()).await {
                Ok(Some(packet)) => {
                    if packet.flags.ack() {
                        self.engine.on_ack(&packet);
                    }
                }
                Ok(None) => return Err("session closed mid-download".into()),
                Err(_) => {} // poll timers again
            }
        }

        self.finish().await;
        Ok(bytes_sent)
    }

    /// Signals end of stream and waits for the peer to acknowledge it.
    async fn finish(&mut self) {
        let fin_seq = self.engine.next_seq();
        for attempt in 1..=FIN_RETRIES {
            self.send(Packet::fin(fin_seq)).await;
            let deadline = Instant::now() + FIN_WAIT;
            loop {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    break;
                }
                match tokio::time::timeout(remaining, self.acks.recv()).await {
                    Ok(Some(packet)) if packet.flags.ack() && packet.ack_number == fin_seq => {
                        return;
                    }
                    Ok(Some(_)) => continue,
                    // Channel gone: the session was torn down already.
                    Ok(None) => return,
                    Err(_) => break,
                }
            }
            tracing::debug!(attempt, "no acknowledgment of FIN yet");
        }
    }

    async fn send(&self, packet: Packet) {
        if let Err(error) = self.socket.send_to(&packet.encode(), self.peer).await {
            tracing::warn!(peer = %self.peer, %error, "send failed");
        }
    }
}
