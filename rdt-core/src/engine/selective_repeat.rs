//! The selective-repeat variant: a sliding window with per-slot timers,
//! selective acknowledgment, and fast retransmit.

use super::modular_cmp::{in_window, seq_distance};
use super::{Delivery, EngineConfig, TransferError};
use crate::packet::Packet;
use rustc_hash::FxHashMap;
use std::time::{Duration, Instant};

/// Duplicate acknowledgments of one slot before it is retransmitted ahead
/// of its timer.
const FAST_RETRANSMIT_THRESHOLD: u32 = 3;

/// State for one direction pair of a selective-repeat transfer.
///
/// The sender keeps a window of `[base, base + window_size)` outstanding
/// slots, each with its own retransmission deadline. The receiver buffers
/// out-of-order frames inside `[rcv_base, rcv_base + window_size)` and
/// releases the contiguous prefix in order. Frames one window below the
/// base are replays of delivered data and are re-acknowledged so the
/// sender's window can advance even when ACKs are lost.
#[derive(Debug)]
pub struct SelectiveRepeat {
    timeout: Duration,
    max_retries: u32,
    window_size: u32,

    base: u32,
    next_seq: u32,
    send_window: FxHashMap<u32, SendSlot>,

    rcv_base: u32,
    receive_buffer: FxHashMap<u32, Vec<u8>>,
}

#[derive(Debug)]
struct SendSlot {
    packet: Packet,
    needs_transmit: bool,
    deadline: Option<Instant>,
    retries: u32,
    acked: bool,
    dup_acks: u32,
}

impl SelectiveRepeat {
    pub fn new(config: EngineConfig) -> Self {
        // The u32 sequence space dwarfs any sane window, but the
        // below-window replay test needs 2W to fit in half the ring.
        debug_assert!(config.window_size >= 1 && config.window_size < u32::MAX / 4);
        let initial = super::ProtocolKind::SelectiveRepeat.initial_data_seq();
        Self {
            timeout: config.timeout,
            max_retries: config.max_retries,
            window_size: config.window_size,
            base: initial,
            next_seq: initial,
            send_window: FxHashMap::default(),
            rcv_base: initial,
            receive_buffer: FxHashMap::default(),
        }
    }

    pub fn window_available(&self) -> bool {
        seq_distance(self.base, self.next_seq) < self.window_size
    }

    pub fn push(&mut self, payload: Vec<u8>) -> u32 {
        debug_assert!(self.window_available(), "push with a full window");
        let sequence = self.next_seq;
        self.send_window.insert(
            sequence,
            SendSlot {
                packet: Packet::data(sequence, payload),
                needs_transmit: true,
                deadline: None,
                retries: 0,
                acked: false,
                dup_acks: 0,
            },
        );
        self.next_seq = self.next_seq.wrapping_add(1);
        sequence
    }

    pub fn poll_transmit(&mut self, now: Instant) -> Result<Vec<Packet>, TransferError> {
        let mut due = Vec::new();
        // Walk slots in window order so retransmissions stay deterministic.
        for offset in 0..self.window_size {
            let sequence = self.base.wrapping_add(offset);
            let slot = match self.send_window.get_mut(&sequence) {
                Some(slot) => slot,
                None => continue,
            };
            if slot.acked && !slot.needs_transmit {
                continue;
            }
            if slot.needs_transmit {
                slot.needs_transmit = false;
                slot.deadline = Some(now + self.timeout);
                due.push(slot.packet.clone());
                continue;
            }
            if let Some(deadline) = slot.deadline {
                if now >= deadline {
                    if slot.retries >= self.max_retries {
                        return Err(TransferError::RetriesExhausted {
                            sequence,
                            retries: slot.retries,
                        });
                    }
                    slot.retries += 1;
                    slot.deadline = Some(now + self.timeout);
                    due.push(slot.packet.clone());
                }
            }
        }
        Ok(due)
    }

    pub fn on_ack(&mut self, packet: &Packet) {
        let sequence = packet.ack_number;
        let max_retries = self.max_retries;
        let slot = match self.send_window.get_mut(&sequence) {
            Some(slot) => slot,
            // Already slid past or never sent; stale.
            None => return,
        };
        if !slot.acked {
            slot.acked = true;
            slot.dup_acks = 0;
            if sequence == self.base {
                self.slide_send_window();
            }
        } else {
            slot.dup_acks += 1;
            if slot.dup_acks >= FAST_RETRANSMIT_THRESHOLD {
                slot.dup_acks = 0;
                if slot.retries < max_retries {
                    slot.retries += 1;
                    slot.needs_transmit = true;
                }
            }
        }
    }

    /// Frees every contiguous acknowledged slot starting at `base`.
    fn slide_send_window(&mut self) {
        while let Some(slot) = self.send_window.get(&self.base) {
            if !slot.acked {
                break;
            }
            self.send_window.remove(&self.base);
            self.base = self.base.wrapping_add(1);
        }
    }

    pub fn on_data(&mut self, packet: &Packet) -> Option<Delivery> {
        let sequence = packet.sequence_number;
        if in_window(self.rcv_base, sequence, self.window_size) {
            // Retransmits carry identical bytes; keep the first copy.
            self.receive_buffer
                .entry(sequence)
                .or_insert_with(|| packet.payload.clone());
            let mut bytes = Vec::new();
            while let Some(payload) = self.receive_buffer.remove(&self.rcv_base) {
                bytes.extend_from_slice(&payload);
                self.rcv_base = self.rcv_base.wrapping_add(1);
            }
            Some(Delivery {
                ack_number: sequence,
                bytes,
            })
        } else if in_window(
            self.rcv_base.wrapping_sub(self.window_size),
            sequence,
            self.window_size,
        ) {
            // Already delivered; the acknowledgment must have been lost.
            Some(Delivery {
                ack_number: sequence,
                bytes: Vec::new(),
            })
        } else {
            None
        }
    }

    pub fn is_drained(&self) -> bool {
        self.send_window.is_empty()
    }

    pub fn in_flight(&self) -> usize {
        self.send_window.len()
    }

    pub fn next_seq(&self) -> u32 {
        self.next_seq
    }

    pub fn expected_seq(&self) -> u32 {
        self.rcv_base
    }

    /// The lowest unacknowledged sequence, for completion checks.
    pub fn base(&self) -> u32 {
        self.base
    }
}
