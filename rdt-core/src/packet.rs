//! Wire format for the reliable-transfer protocol.
//!
//! Every frame is a 12-byte big-endian header, up to [`MAX_PAYLOAD`] payload
//! bytes, and a trailing integrity digest: the MD5 of the payload encoded as
//! 32 ASCII hex characters. The digest detects corruption only; it is not
//! cryptographic.

use crate::engine::ProtocolKind;
use md5::{Digest, Md5};
use std::fmt::{self, Display, Formatter};
use std::ops::BitOr;
use thiserror::Error;

/// Size of the fixed header in bytes.
pub const HEADER_SIZE: usize = 12;
/// Size of the hex-encoded payload digest in bytes.
pub const DIGEST_SIZE: usize = 32;
/// Largest payload a single frame may carry.
pub const MAX_PAYLOAD: usize = 1024;
/// Largest frame the protocol produces. Receive buffers should be at least
/// this large; 2048 leaves headroom.
pub const MAX_FRAME: usize = HEADER_SIZE + MAX_PAYLOAD + DIGEST_SIZE;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PacketError {
    #[error("frame too short: {actual} bytes, need at least {expected}")]
    FrameTooShort { actual: usize, expected: usize },
    #[error("payload length {0} exceeds the {MAX_PAYLOAD}-byte maximum")]
    PayloadTooLarge(usize),
    #[error("payload digest mismatch")]
    DigestMismatch,
    #[error("malformed operation payload")]
    MalformedOperation,
    #[error("malformed error payload")]
    MalformedError,
}

/// Control flag bitfield for the header's 16-bit flags word.
///
/// Flags combine freely, e.g. `Flags::SYN | Flags::ACK` for the handshake
/// reply and `Flags::FIN | Flags::ACK` for teardown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Flags(u16);

impl Flags {
    pub const SYN: Flags = Flags(0x01);
    pub const ACK: Flags = Flags(0x02);
    pub const FIN: Flags = Flags(0x04);
    pub const DATA: Flags = Flags(0x08);
    pub const ERR: Flags = Flags(0x10);

    /// Synchronize: opens a session
    pub fn syn(self) -> bool {
        self.0 & Self::SYN.0 != 0
    }

    /// Acknowledgment field significant
    pub fn ack(self) -> bool {
        self.0 & Self::ACK.0 != 0
    }

    /// No more data from sender
    pub fn fin(self) -> bool {
        self.0 & Self::FIN.0 != 0
    }

    /// Frame carries payload bytes
    pub fn data(self) -> bool {
        self.0 & Self::DATA.0 != 0
    }

    /// Frame carries an operation error
    pub fn err(self) -> bool {
        self.0 & Self::ERR.0 != 0
    }
}

impl BitOr for Flags {
    type Output = Flags;

    fn bitor(self, rhs: Flags) -> Flags {
        Flags(self.0 | rhs.0)
    }
}

impl From<u16> for Flags {
    fn from(bits: u16) -> Self {
        Flags(bits)
    }
}

impl From<Flags> for u16 {
    fn from(flags: Flags) -> Self {
        flags.0
    }
}

/// A single protocol frame.
///
/// `data_length` is not stored; it is always the payload length and is
/// materialized during [`Packet::encode`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Packet {
    pub sequence_number: u32,
    pub ack_number: u32,
    pub flags: Flags,
    pub payload: Vec<u8>,
}

impl Packet {
    pub fn data(sequence_number: u32, payload: Vec<u8>) -> Self {
        debug_assert!(payload.len() <= MAX_PAYLOAD);
        Self {
            sequence_number,
            flags: Flags::DATA,
            payload,
            ..Default::default()
        }
    }

    pub fn ack(ack_number: u32) -> Self {
        Self {
            ack_number,
            flags: Flags::ACK,
            ..Default::default()
        }
    }

    pub fn syn() -> Self {
        Self {
            flags: Flags::SYN,
            ..Default::default()
        }
    }

    pub fn syn_ack() -> Self {
        Self {
            flags: Flags::SYN | Flags::ACK,
            ..Default::default()
        }
    }

    pub fn fin(sequence_number: u32) -> Self {
        Self {
            sequence_number,
            flags: Flags::FIN,
            ..Default::default()
        }
    }

    pub fn fin_ack(sequence_number: u32) -> Self {
        Self {
            sequence_number,
            flags: Flags::FIN | Flags::ACK,
            ..Default::default()
        }
    }

    pub fn error(ack_number: u32, code: ErrorCode, message: &str) -> Self {
        Self {
            ack_number,
            flags: Flags::ERR,
            payload: format!("{code}:{message}").into_bytes(),
            ..Default::default()
        }
    }

    /// The first post-handshake DATA frame, negotiating the operation,
    /// remote filename, and protocol variant.
    pub fn operation(sequence_number: u32, request: &OperationRequest) -> Self {
        Self::data(sequence_number, request.to_payload())
    }

    /// Serializes the frame: header fields big-endian, payload, digest.
    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(HEADER_SIZE + self.payload.len() + DIGEST_SIZE);
        bytes.extend_from_slice(&self.sequence_number.to_be_bytes());
        bytes.extend_from_slice(&self.ack_number.to_be_bytes());
        bytes.extend_from_slice(&u16::from(self.flags).to_be_bytes());
        bytes.extend_from_slice(&(self.payload.len() as u16).to_be_bytes());
        bytes.extend_from_slice(&self.payload);
        bytes.extend_from_slice(&payload_digest(&self.payload));
        bytes
    }

    /// Parses and validates a frame. The digest is recomputed over the
    /// payload and compared against the stored digest; any mismatch or
    /// length inconsistency yields an error, and callers drop the frame
    /// without replying.
    pub fn decode(bytes: &[u8]) -> Result<Self, PacketError> {
        if bytes.len() < HEADER_SIZE + DIGEST_SIZE {
            return Err(PacketError::FrameTooShort {
                actual: bytes.len(),
                expected: HEADER_SIZE + DIGEST_SIZE,
            });
        }

        let sequence_number = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let ack_number = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        let flags = Flags::from(u16::from_be_bytes([bytes[8], bytes[9]]));
        let data_length = u16::from_be_bytes([bytes[10], bytes[11]]) as usize;

        if data_length > MAX_PAYLOAD {
            return Err(PacketError::PayloadTooLarge(data_length));
        }
        let expected = HEADER_SIZE + data_length + DIGEST_SIZE;
        if bytes.len() < expected {
            return Err(PacketError::FrameTooShort {
                actual: bytes.len(),
                expected,
            });
        }

        let payload = &bytes[HEADER_SIZE..HEADER_SIZE + data_length];
        let stored = &bytes[HEADER_SIZE + data_length..expected];
        if stored != payload_digest(payload).as_slice() {
            return Err(PacketError::DigestMismatch);
        }

        Ok(Self {
            sequence_number,
            ack_number,
            flags,
            payload: payload.to_vec(),
        })
    }
}

fn payload_digest(payload: &[u8]) -> [u8; DIGEST_SIZE] {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let hash = Md5::digest(payload);
    let mut hex = [0u8; DIGEST_SIZE];
    for (i, byte) in hash.iter().enumerate() {
        hex[i * 2] = HEX[(byte >> 4) as usize];
        hex[i * 2 + 1] = HEX[(byte & 0x0f) as usize];
    }
    hex
}

/// The two file-transfer operations a client may request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Upload,
    Download,
}

impl Operation {
    pub fn as_str(self) -> &'static str {
        match self {
            Operation::Upload => "UPLOAD",
            Operation::Download => "DOWNLOAD",
        }
    }
}

impl Display for Operation {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parsed contents of an operation packet:
/// `"<OPERATION>:<filename>:<protocol>"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationRequest {
    pub operation: Operation,
    pub filename: String,
    pub protocol: ProtocolKind,
}

impl OperationRequest {
    pub fn to_payload(&self) -> Vec<u8> {
        format!(
            "{}:{}:{}",
            self.operation,
            self.filename,
            self.protocol.wire_name()
        )
        .into_bytes()
    }

    /// Parses an operation payload. The protocol part may be absent, in
    /// which case it defaults to stop-and-wait.
    pub fn parse(payload: &[u8]) -> Result<Self, PacketError> {
        let text = std::str::from_utf8(payload).map_err(|_| PacketError::MalformedOperation)?;
        let mut parts = text.splitn(3, ':');
        let operation = match parts.next() {
            Some(op) if op.eq_ignore_ascii_case("UPLOAD") => Operation::Upload,
            Some(op) if op.eq_ignore_ascii_case("DOWNLOAD") => Operation::Download,
            _ => return Err(PacketError::MalformedOperation),
        };
        let filename = match parts.next() {
            Some(name) if !name.is_empty() => name.to_owned(),
            _ => return Err(PacketError::MalformedOperation),
        };
        let protocol = match parts.next() {
            None => ProtocolKind::StopAndWait,
            Some(name) => {
                ProtocolKind::from_wire(name).ok_or(PacketError::MalformedOperation)?
            }
        };
        Ok(Self {
            operation,
            filename,
            protocol,
        })
    }
}

/// Error codes carried in ERR packet payloads as `"NNN:message"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// 001: the server could not create the upload temp file
    CannotCreateFile,
    /// 002: a data frame arrived before the operation was negotiated
    OperationNotSet,
    /// 003: the requested download does not exist
    FileNotFound,
    /// 004: the requested file exists but could not be accessed
    FileAccess,
    /// 005: writing received data to disk failed
    WriteFailed,
}

impl ErrorCode {
    pub fn code(self) -> &'static str {
        match self {
            ErrorCode::CannotCreateFile => "001",
            ErrorCode::OperationNotSet => "002",
            ErrorCode::FileNotFound => "003",
            ErrorCode::FileAccess => "004",
            ErrorCode::WriteFailed => "005",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "001" => Some(ErrorCode::CannotCreateFile),
            "002" => Some(ErrorCode::OperationNotSet),
            "003" => Some(ErrorCode::FileNotFound),
            "004" => Some(ErrorCode::FileAccess),
            "005" => Some(ErrorCode::WriteFailed),
            _ => None,
        }
    }
}

impl Display for ErrorCode {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Splits an ERR payload into its code and message.
pub fn parse_error_payload(payload: &[u8]) -> Result<(ErrorCode, String), PacketError> {
    let text = std::str::from_utf8(payload).map_err(|_| PacketError::MalformedError)?;
    let (code, message) = text.split_once(':').ok_or(PacketError::MalformedError)?;
    let code = ErrorCode::from_code(code).ok_or(PacketError::MalformedError)?;
    Ok((code, message.to_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_data_frame() {
        let packet = Packet::data(7, b"hello world".to_vec());
        let decoded = Packet::decode(&packet.encode()).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn round_trips_empty_payload() {
        let packet = Packet::ack(42);
        let bytes = packet.encode();
        assert_eq!(bytes.len(), HEADER_SIZE + DIGEST_SIZE);
        assert_eq!(Packet::decode(&bytes).unwrap(), packet);
    }

    #[test]
    fn rejects_payload_bit_flips() {
        let bytes = Packet::data(0, b"integrity matters".to_vec()).encode();
        for bit in 0..8 {
            let mut corrupted = bytes.clone();
            corrupted[HEADER_SIZE + 3] ^= 1 << bit;
            assert_eq!(
                Packet::decode(&corrupted),
                Err(PacketError::DigestMismatch),
                "flip of bit {bit} went undetected"
            );
        }
    }

    #[test]
    fn rejects_truncated_frames() {
        let bytes = Packet::data(0, b"truncate me".to_vec()).encode();
        assert!(matches!(
            Packet::decode(&bytes[..bytes.len() - 1]),
            Err(PacketError::FrameTooShort { .. })
        ));
        assert!(matches!(
            Packet::decode(&bytes[..HEADER_SIZE - 1]),
            Err(PacketError::FrameTooShort { .. })
        ));
    }

    #[test]
    fn rejects_oversized_data_length() {
        let mut bytes = Packet::data(0, vec![0; 8]).encode();
        // data_length claims more than MAX_PAYLOAD
        bytes[10] = 0xff;
        bytes[11] = 0xff;
        assert_eq!(
            Packet::decode(&bytes),
            Err(PacketError::PayloadTooLarge(0xffff))
        );
    }

    #[test]
    fn header_layout_is_big_endian() {
        let packet = Packet {
            sequence_number: 0x01020304,
            ack_number: 0x0a0b0c0d,
            flags: Flags::SYN | Flags::ACK,
            payload: Vec::new(),
        };
        let bytes = packet.encode();
        assert_eq!(&bytes[0..4], &[0x01, 0x02, 0x03, 0x04]);
        assert_eq!(&bytes[4..8], &[0x0a, 0x0b, 0x0c, 0x0d]);
        assert_eq!(&bytes[8..10], &[0x00, 0x03]);
        assert_eq!(&bytes[10..12], &[0x00, 0x00]);
    }

    #[test]
    fn digest_is_md5_hex_of_payload() {
        // md5("hi") = 49f68a5c8493ec2c0bf489821c21fc3b
        let bytes = Packet::data(0, b"hi".to_vec()).encode();
        assert_eq!(
            &bytes[HEADER_SIZE + 2..],
            &b"49f68a5c8493ec2c0bf489821c21fc3b"[..]
        );
    }

    #[test]
    fn flag_combinations() {
        let fin_ack = Flags::FIN | Flags::ACK;
        assert!(fin_ack.fin());
        assert!(fin_ack.ack());
        assert!(!fin_ack.syn());
        assert!(!fin_ack.data());
        assert!(!fin_ack.err());
    }

    #[test]
    fn parses_operation_payload() {
        let request = OperationRequest::parse(b"UPLOAD:notes.txt:selective_repeat").unwrap();
        assert_eq!(request.operation, Operation::Upload);
        assert_eq!(request.filename, "notes.txt");
        assert_eq!(request.protocol, ProtocolKind::SelectiveRepeat);
    }

    #[test]
    fn operation_protocol_defaults_to_stop_and_wait() {
        let request = OperationRequest::parse(b"download:archive.bin").unwrap();
        assert_eq!(request.operation, Operation::Download);
        assert_eq!(request.protocol, ProtocolKind::StopAndWait);
    }

    #[test]
    fn rejects_malformed_operations() {
        assert!(OperationRequest::parse(b"").is_err());
        assert!(OperationRequest::parse(b"DELETE:x").is_err());
        assert!(OperationRequest::parse(b"UPLOAD:").is_err());
        assert!(OperationRequest::parse(b"UPLOAD:x:carrier_pigeon").is_err());
    }

    #[test]
    fn operation_round_trip() {
        let request = OperationRequest {
            operation: Operation::Download,
            filename: "archive.bin".into(),
            protocol: ProtocolKind::SelectiveRepeat,
        };
        let parsed = OperationRequest::parse(&request.to_payload()).unwrap();
        assert_eq!(parsed, request);
    }

    #[test]
    fn colons_in_filenames_are_rejected() {
        // The third colon-separated part must be a protocol name.
        assert!(OperationRequest::parse(b"UPLOAD:a:b.txt:stop_and_wait").is_err());
    }

    #[test]
    fn error_payload_round_trip() {
        let packet = Packet::error(1, ErrorCode::FileNotFound, "no such file");
        let (code, message) = parse_error_payload(&packet.payload).unwrap();
        assert_eq!(code, ErrorCode::FileNotFound);
        assert_eq!(message, "no such file");
    }
}
