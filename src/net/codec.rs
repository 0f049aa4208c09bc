//! Message envelope framing:
//! `magic(4) | command(12, null-padded) | length(u32 LE) | checksum(4)`.

use crate::crypto::sha256d;
use crate::primitives::encode::{ProtocolError, MAX_PAYLOAD_SIZE};

use super::messages::NetworkMessage;

pub const ENVELOPE_LEN: usize = 24;

/// Parsed envelope, pending payload verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub command: String,
    pub length: u32,
    pub checksum: [u8; 4],
}

/// Frame a message for the wire: envelope followed by payload.
pub fn frame_message(magic: u32, msg: &NetworkMessage) -> Vec<u8> {
    let payload = msg.payload();
    let checksum = sha256d(&payload);

    let mut out = Vec::with_capacity(ENVELOPE_LEN + payload.len());
    out.extend_from_slice(&magic.to_le_bytes());

    let mut command = [0u8; 12];
    let name = msg.command().as_bytes();
    command[..name.len()].copy_from_slice(name);
    out.extend_from_slice(&command);

    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(&checksum[..4]);
    out.extend_from_slice(&payload);
    out
}

/// Parse and validate the 24-byte envelope.
pub fn decode_envelope(magic: u32, bytes: &[u8; ENVELOPE_LEN]) -> Result<Envelope, ProtocolError> {
    let actual_magic = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    if actual_magic != magic {
        return Err(ProtocolError::BadMagic {
            expected: magic,
            actual: actual_magic,
        });
    }

    let raw_command = &bytes[4..16];
    let end = raw_command
        .iter()
        .position(|&b| b == 0)
        .unwrap_or(raw_command.len());
    // Padding after the terminator must be all zeros.
    if raw_command[end..].iter().any(|&b| b != 0) {
        return Err(ProtocolError::Malformed("garbage after command terminator"));
    }
    let command = std::str::from_utf8(&raw_command[..end])
        .map_err(|_| ProtocolError::Malformed("non-ascii command"))?
        .to_string();

    let length = u32::from_le_bytes([bytes[16], bytes[17], bytes[18], bytes[19]]);
    if length as usize > MAX_PAYLOAD_SIZE {
        return Err(ProtocolError::OversizedLength(length as u64));
    }

    Ok(Envelope {
        command,
        length,
        checksum: [bytes[20], bytes[21], bytes[22], bytes[23]],
    })
}

/// Verify the payload checksum and decode the message body.
pub fn decode_payload(envelope: &Envelope, payload: &[u8]) -> Result<NetworkMessage, ProtocolError> {
    let digest = sha256d(payload);
    if digest[..4] != envelope.checksum {
        return Err(ProtocolError::BadChecksum);
    }
    NetworkMessage::decode_payload(&envelope.command, payload)
}
