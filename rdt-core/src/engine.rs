//! Reliability engines for the data phase.
//!
//! Two interchangeable variants share one contract: [`StopAndWait`] keeps a
//! single packet outstanding over a modulo-2 sequence space, while
//! [`SelectiveRepeat`] runs a sliding window with selective acknowledgment,
//! per-slot timers, and fast retransmit.
//!
//! Engines are pure state machines. They never touch a socket or read a
//! clock: drivers pass [`Instant`]s in and drain due frames out of
//! [`Engine::poll_transmit`], which keeps the retransmission logic
//! deterministic and testable without a runtime.

use crate::packet::Packet;
use std::fmt::{self, Display, Formatter};
use std::time::{Duration, Instant};
use thiserror::Error;

mod modular_cmp;

mod stop_and_wait;
pub use stop_and_wait::StopAndWait;

mod selective_repeat;
pub use selective_repeat::SelectiveRepeat;


/// The reliability protocol negotiated for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolKind {
    StopAndWait,
    SelectiveRepeat,
}

impl ProtocolKind {
    /// The name used in operation packets.
    pub fn wire_name(self) -> &'static str {
        match self {
            ProtocolKind::StopAndWait => "stop_and_wait",
            ProtocolKind::SelectiveRepeat => "selective_repeat",
        }
    }

    pub fn from_wire(name: &str) -> Option<Self> {
        match name {
            "stop_and_wait" => Some(ProtocolKind::StopAndWait),
            "selective_repeat" => Some(ProtocolKind::SelectiveRepeat),
            _ => None,
        }
    }

    /// The first sequence number of the data phase. Stop-and-wait runs its
    /// own modulo-2 space starting at 0; selective repeat continues past the
    /// handshake (SYN is 0, the operation packet is 1).
    pub fn initial_data_seq(self) -> u32 {
        match self {
            ProtocolKind::StopAndWait => 0,
            ProtocolKind::SelectiveRepeat => 2,
        }
    }
}

impl Display for ProtocolKind {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.write_str(self.wire_name())
    }
}

/// Tuning knobs for an engine instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    /// Retransmission timeout per outstanding packet.
    pub timeout: Duration,
    /// Retransmissions of one packet before the transfer is abandoned.
    pub max_retries: u32,
    /// Send/receive window size. Stop-and-wait ignores this.
    pub window_size: u32,
}

impl EngineConfig {
    /// Defaults for each variant: stop-and-wait retransmits aggressively and
    /// tolerates heavy loss; selective repeat leans on its window instead.
    pub fn for_kind(kind: ProtocolKind) -> Self {
        match kind {
            ProtocolKind::StopAndWait => Self {
                timeout: Duration::from_millis(300),
                max_retries: 60,
                window_size: 1,
            },
            ProtocolKind::SelectiveRepeat => Self {
                timeout: Duration::from_secs(5),
                max_retries: 10,
                window_size: 8,
            },
        }
    }
}

/// What a receive-side engine did with an inbound DATA frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// The acknowledgment number to send back.
    pub ack_number: u32,
    /// Payload bytes released in order. Empty when the frame was a
    /// duplicate or filled a gap without completing a prefix.
    pub bytes: Vec<u8>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransferError {
    #[error("gave up on sequence {sequence} after {retries} retransmissions")]
    RetriesExhausted { sequence: u32, retries: u32 },
}

/// A reliability engine, tagged by variant.
///
/// The send side: [`push`](Engine::push) payload chunks while
/// [`window_available`](Engine::window_available), drain frames due for
/// (re)transmission with [`poll_transmit`](Engine::poll_transmit), and feed
/// inbound acknowledgments to [`on_ack`](Engine::on_ack). The receive side
/// routes inbound DATA through [`on_data`](Engine::on_data) and sends the
/// acknowledgment it returns.
#[derive(Debug)]
pub enum Engine {
    StopAndWait(StopAndWait),
    SelectiveRepeat(SelectiveRepeat),
}

impl Engine {
    pub fn new(kind: ProtocolKind, config: EngineConfig) -> Self {
        match kind {
            ProtocolKind::StopAndWait => Engine::StopAndWait(StopAndWait::new(config)),
            ProtocolKind::SelectiveRepeat => {
                Engine::SelectiveRepeat(SelectiveRepeat::new(config))
            }
        }
    }

    pub fn kind(&self) -> ProtocolKind {
        match self {
            Engine::StopAndWait(_) => ProtocolKind::StopAndWait,
            Engine::SelectiveRepeat(_) => ProtocolKind::SelectiveRepeat,
        }
    }

    /// Whether another payload chunk may be queued right now.
    pub fn window_available(&self) -> bool {
        match self {
            Engine::StopAndWait(engine) => engine.window_available(),
            Engine::SelectiveRepeat(engine) => engine.window_available(),
        }
    }

    /// Queues a payload chunk for transmission and returns the sequence
    /// number it was assigned. Callers must check
    /// [`window_available`](Engine::window_available) first.
    pub fn push(&mut self, payload: Vec<u8>) -> u32 {
        match self {
            Engine::StopAndWait(engine) => engine.push(payload),
            Engine::SelectiveRepeat(engine) => engine.push(payload),
        }
    }

    /// Returns every frame due for (re)transmission at `now`: freshly queued
    /// packets, slots whose timer expired, and fast-retransmit candidates.
    /// Fails once a slot has exhausted its retry budget.
    pub fn poll_transmit(&mut self, now: Instant) -> Result<Vec<Packet>, TransferError> {
        match self {
            Engine::StopAndWait(engine) => engine.poll_transmit(now),
            Engine::SelectiveRepeat(engine) => engine.poll_transmit(now),
        }
    }

    /// Processes an inbound acknowledgment.
    pub fn on_ack(&mut self, packet: &Packet) {
        match self {
            Engine::StopAndWait(engine) => engine.on_ack(packet),
            Engine::SelectiveRepeat(engine) => engine.on_ack(packet),
        }
    }

    /// Processes an inbound DATA frame. `None` means the frame fell outside
    /// the receive window entirely and must be dropped without a reply.
    pub fn on_data(&mut self, packet: &Packet) -> Option<Delivery> {
        match self {
            Engine::StopAndWait(engine) => Some(engine.on_data(packet)),
            Engine::SelectiveRepeat(engine) => engine.on_data(packet),
        }
    }

    /// True when nothing is outstanding: every pushed chunk was
    /// acknowledged.
    pub fn is_drained(&self) -> bool {
        match self {
            Engine::StopAndWait(engine) => engine.is_drained(),
            Engine::SelectiveRepeat(engine) => engine.is_drained(),
        }
    }

    /// Number of unacknowledged chunks in flight.
    pub fn in_flight(&self) -> usize {
        match self {
            Engine::StopAndWait(engine) => engine.in_flight(),
            Engine::SelectiveRepeat(engine) => engine.in_flight(),
        }
    }

    /// The sequence number the next pushed chunk will use.
    pub fn next_seq(&self) -> u32 {
        match self {
            Engine::StopAndWait(engine) => engine.next_seq(),
            Engine::SelectiveRepeat(engine) => engine.next_seq(),
        }
    }

    /// The next inbound sequence the receive side will deliver.
    pub fn expected_seq(&self) -> u32 {
        match self {
            Engine::StopAndWait(engine) => engine.expected_seq(),
            Engine::SelectiveRepeat(engine) => engine.expected_seq(),
        }
    }
}
