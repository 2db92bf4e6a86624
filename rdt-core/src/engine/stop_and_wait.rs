//! The stop-and-wait variant: one packet in flight, sequence space
//! modulo 2.

use super::{Delivery, EngineConfig, TransferError};
use crate::packet::Packet;
use std::time::{Duration, Instant};

/// State for one direction pair of a stop-and-wait transfer.
///
/// The sender holds at most one unacknowledged DATA frame and flips
/// `current_seq` between 0 and 1 on each acknowledgment. The receiver
/// delivers in-order frames and re-acknowledges the previously accepted
/// sequence for anything else, so replays heal lost ACKs without
/// re-delivering bytes.
#[derive(Debug)]
pub struct StopAndWait {
    timeout: Duration,
    max_retries: u32,
    current_seq: u32,
    expected_seq: u32,
    outstanding: Option<Outstanding>,
}

#[derive(Debug)]
struct Outstanding {
    packet: Packet,
    needs_transmit: bool,
    deadline: Option<Instant>,
    retries: u32,
}

impl StopAndWait {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            timeout: config.timeout,
            max_retries: config.max_retries,
            current_seq: 0,
            expected_seq: 0,
            outstanding: None,
        }
    }

    pub fn window_available(&self) -> bool {
        self.outstanding.is_none()
    }

    pub fn push(&mut self, payload: Vec<u8>) -> u32 {
        debug_assert!(self.outstanding.is_none(), "push with a packet in flight");
        let sequence = self.current_seq;
        self.outstanding = Some(Outstanding {
            packet: Packet::data(sequence, payload),
            needs_transmit: true,
            deadline: None,
            retries: 0,
        });
        sequence
    }

    pub fn poll_transmit(&mut self, now: Instant) -> Result<Vec<Packet>, TransferError> {
        let outstanding = match self.outstanding.as_mut() {
            Some(outstanding) => outstanding,
            None => return Ok(Vec::new()),
        };

        if outstanding.needs_transmit {
            outstanding.needs_transmit = false;
            outstanding.deadline = Some(now + self.timeout);
            return Ok(vec![outstanding.packet.clone()]);
        }

        match outstanding.deadline {
            Some(deadline) if now >= deadline => {
                if outstanding.retries >= self.max_retries {
                    return Err(TransferError::RetriesExhausted {
                        sequence: outstanding.packet.sequence_number,
                        retries: outstanding.retries,
                    });
                }
                outstanding.retries += 1;
                outstanding.deadline = Some(now + self.timeout);
                Ok(vec![outstanding.packet.clone()])
            }
            _ => Ok(Vec::new()),
        }
    }

    pub fn on_ack(&mut self, packet: &Packet) {
        if self.outstanding.is_some() && packet.ack_number == self.current_seq {
            self.outstanding = None;
            self.current_seq ^= 1;
        }
        // Acknowledgments for any other number are stale; ignore them.
    }

    pub fn on_data(&mut self, packet: &Packet) -> Delivery {
        if packet.sequence_number == self.expected_seq {
            self.expected_seq ^= 1;
            Delivery {
                ack_number: packet.sequence_number,
                bytes: packet.payload.clone(),
            }
        } else {
            // Re-acknowledge the last accepted frame; do not deliver again.
            Delivery {
                ack_number: self.expected_seq ^ 1,
                bytes: Vec::new(),
            }
        }
    }

    pub fn is_drained(&self) -> bool {
        self.outstanding.is_none()
    }

    pub fn in_flight(&self) -> usize {
        usize::from(self.outstanding.is_some())
    }

    pub fn next_seq(&self) -> u32 {
        self.current_seq
    }

    pub fn expected_seq(&self) -> u32 {
        self.expected_seq
    }
}
