//! The UDP server: one socket, a worker pool, and a per-peer session map.
//!
//! The receive loop only reads datagrams and queues them; workers decode
//! and route each datagram to its peer's session. Sessions serialize their
//! own handling with an internal mutex, so one slow peer cannot stall the
//! others, and the map itself is only touched to insert, look up, or
//! remove.

use crate::packet::Packet;
use crate::session::{Session, Verdict};
use crate::shutdown::Shutdown;
use crate::storage::{Storage, StorageError};
use crate::FxDashMap;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

/// Datagrams above this size cannot be valid frames and are truncated by
/// the socket read; 2048 leaves room beyond the 1068-byte maximum frame.
const RECV_BUFFER: usize = 2048;
/// Backpressure bound between the receive loop and the workers.
const QUEUE_DEPTH: usize = 1024;
/// How often the reaper sweeps for idle sessions.
const REAP_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: SocketAddr,
    pub storage_dir: PathBuf,
    /// Workers draining the datagram queue.
    pub workers: usize,
    /// Sessions idle longer than this are torn down.
    pub idle_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: ([127, 0, 0, 1], 9000).into(),
            storage_dir: PathBuf::from("server_files"),
            workers: 3,
            idle_timeout: Duration::from_secs(60),
        }
    }
}

pub struct Server {
    socket: Arc<UdpSocket>,
    storage: Arc<Storage>,
    sessions: Arc<FxDashMap<SocketAddr, Arc<Session>>>,
    workers: usize,
    idle_timeout: Duration,
    shutdown: Shutdown,
}

impl Server {
    /// Binds the socket and opens the storage directory.
    pub async fn bind(config: ServerConfig, shutdown: Shutdown) -> Result<Self, ServerError> {
        let socket = Arc::new(UdpSocket::bind(config.bind).await?);
        let storage = Arc::new(Storage::open(config.storage_dir).await?);
        tracing::info!(
            addr = %socket.local_addr()?,
            storage = %storage.root().display(),
            "server listening"
        );
        Ok(Self {
            socket,
            storage,
            sessions: Arc::new(FxDashMap::default()),
            workers: config.workers.max(1),
            idle_timeout: config.idle_timeout,
            shutdown,
        })
    }

    /// The bound address, useful when the port was chosen by the OS.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Serves until shutdown is signalled.
    pub async fn run(self) -> Result<(), ServerError> {
        let (queue_tx, queue_rx) = mpsc::channel::<(Vec<u8>, SocketAddr)>(QUEUE_DEPTH);
        let queue_rx = Arc::new(Mutex::new(queue_rx));

        let workers: Vec<JoinHandle<()>> = (0..self.workers)
            .map(|worker| {
                let queue_rx = queue_rx.clone();
                let socket = self.socket.clone();
                let storage = self.storage.clone();
                let sessions = self.sessions.clone();
                tokio::spawn(async move {
                    loop {
                        let item = { queue_rx.lock().await.recv().await };
                        let (bytes, peer) = match item {
                            Some(item) => item,
                            None => break,
                        };
                        demux(&bytes, peer, &socket, &storage, &sessions).await;
                    }
                    tracing::debug!(worker, "worker stopped");
                })
            })
            .collect();

        let reaper = tokio::spawn(reap_idle_sessions(
            self.sessions.clone(),
            self.idle_timeout,
            self.shutdown.clone(),
        ));

        let mut buf = [0u8; RECV_BUFFER];
        loop {
            tokio::select! {
                _ = self.shutdown.wait_for_shutdown() => break,
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok((len, peer)) => {
                        if queue_tx.send((buf[..len].to_vec(), peer)).await.is_err() {
                            break;
                        }
                    }
                    Err(error) => {
                        tracing::warn!(%error, "receive failed");
                    }
                },
            }
        }

        drop(queue_tx);
        for worker in workers {
            let _ = worker.await;
        }
        reaper.abort();
        tracing::info!("server stopped");
        Ok(())
    }
}

/// Routes one datagram to its peer's session, creating the session on the
/// first contact.
#[tracing::instrument(name = "demux", skip_all, fields(peer = %peer))]
async fn demux(
    bytes: &[u8],
    peer: SocketAddr,
    socket: &Arc<UdpSocket>,
    storage: &Arc<Storage>,
    sessions: &FxDashMap<SocketAddr, Arc<Session>>,
) {
    let packet = match Packet::decode(bytes) {
        Ok(packet) => packet,
        Err(error) => {
            // Corrupt or truncated: drop without a reply and let the
            // sender's timers recover.
            tracing::debug!(%error, "dropping invalid frame");
            return;
        }
    };

    let session = sessions
        .entry(peer)
        .or_insert_with(|| Arc::new(Session::new(peer, socket.clone(), storage.clone())))
        .clone();

    if session.handle(packet).await == Verdict::Remove {
        sessions.remove(&peer);
    }
}

/// Sweeps sessions whose peers went silent. A session whose lock is held is
/// mid-handling and is skipped until the next sweep.
async fn reap_idle_sessions(
    sessions: Arc<FxDashMap<SocketAddr, Arc<Session>>>,
    idle_timeout: Duration,
    shutdown: Shutdown,
) {
    let mut tick = tokio::time::interval(REAP_INTERVAL);
    loop {
        tokio::select! {
            _ = shutdown.wait_for_shutdown() => break,
            _ = tick.tick() => {}
        }
        let idle: Vec<SocketAddr> = sessions
            .iter()
            .filter(|entry| {
                entry
                    .value()
                    .try_idle_for()
                    .is_some_and(|idle| idle > idle_timeout)
            })
            .map(|entry| *entry.key())
            .collect();
        for peer in idle {
            if let Some((_, session)) = sessions.remove(&peer) {
                tracing::info!(%peer, "reaping idle session");
                session.abandon().await;
            }
        }
    }
}
