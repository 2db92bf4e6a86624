//! A reliable file-transfer service over UDP.
//!
//! The wire protocol frames every datagram with a 12-byte header and a
//! trailing payload digest, and recovers from loss with one of two
//! interchangeable reliability engines negotiated per session:
//! stop-and-wait or selective repeat.
//!
//! # Organization
//! - [`packet`] is the codec: framing, validation, and the typed packet
//!   constructors.
//! - [`engine`] holds the two reliability engines behind one contract.
//! - [`session`] and [`server`] are the server side: per-peer state
//!   machines behind a demultiplexing dispatcher.
//! - [`storage`] is the server's file gateway with per-filename
//!   reader-writer locking and atomic upload replacement.
//! - [`client`] drives the same protocol from the initiating side.

pub mod client;
pub mod engine;
pub mod packet;
pub mod server;
pub mod session;
pub mod storage;

pub mod shutdown;
pub use shutdown::Shutdown;

pub use client::{Client, ClientConfig, ClientError};
pub use engine::{Engine, EngineConfig, ProtocolKind};
pub use packet::{Operation, Packet};
pub use server::{Server, ServerConfig, ServerError};

use dashmap::DashMap;
use std::hash::BuildHasherDefault;
pub type FxDashMap<K, V> = DashMap<K, V, BuildHasherDefault<rustc_hash::FxHasher>>;
