//! Packet model and 24-byte header codec.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Result, WireError};
use crate::Command;

/// Size of the fixed packet header in bytes.
pub const HEADER_SIZE: usize = 24;

/// Wrapping 32-bit sum of the payload bytes.
///
/// This is the legacy ADB payload checksum, carried on pre-v2 transports
/// and zero elsewhere.
pub fn checksum(payload: &[u8]) -> u32 {
    payload
        .iter()
        .fold(0u32, |sum, byte| sum.wrapping_add(u32::from(*byte)))
}

/// One ADB packet in memory.
///
/// `arg0` and `arg1` are command-dependent; for the stream-layer commands
/// they carry the sender's local and remote stream ids. The payload is
/// reference-counted so packets can be moved through channels without
/// copying.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub command: Command,
    pub arg0: u32,
    pub arg1: u32,
    pub payload: Bytes,
}

impl Packet {
    /// Create a packet with a payload.
    pub fn new(command: Command, arg0: u32, arg1: u32, payload: Bytes) -> Self {
        Self {
            command,
            arg0,
            arg1,
            payload,
        }
    }

    /// Create a payload-less packet.
    pub fn empty(command: Command, arg0: u32, arg1: u32) -> Self {
        Self::new(command, arg0, arg1, Bytes::new())
    }

    /// Serialize header and payload into one contiguous buffer.
    ///
    /// The checksum field is populated only when `calculate_checksum` is
    /// set; transports that negotiated checksum skipping emit zero.
    pub fn encode(&self, calculate_checksum: bool) -> Bytes {
        let command = self.command.to_wire();
        let check = if calculate_checksum {
            checksum(&self.payload)
        } else {
            0
        };

        let mut buf = BytesMut::with_capacity(HEADER_SIZE + self.payload.len());
        buf.put_u32_le(command);
        buf.put_u32_le(self.arg0);
        buf.put_u32_le(self.arg1);
        buf.put_u32_le(self.payload.len() as u32);
        buf.put_u32_le(check);
        buf.put_u32_le(!command);
        buf.extend_from_slice(&self.payload);
        buf.freeze()
    }
}

/// Decoded packet header, prior to payload arrival.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub command: Command,
    pub arg0: u32,
    pub arg1: u32,
    pub payload_len: u32,
    pub checksum: u32,
}

impl PacketHeader {
    /// Decode a header from the first [`HEADER_SIZE`] bytes of `buf`.
    ///
    /// Validates the magic field and the command vocabulary; payload
    /// length and checksum are validated later via [`Self::verify_payload`]
    /// once the payload has been read.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(WireError::TruncatedHeader(buf.len()));
        }

        let word = |at: usize| u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]]);

        let command_word = word(0);
        let magic = word(20);
        if magic != !command_word {
            return Err(WireError::MagicMismatch {
                command: command_word,
                magic,
            });
        }

        let command =
            Command::from_wire(command_word).ok_or(WireError::UnknownCommand(command_word))?;

        Ok(Self {
            command,
            arg0: word(4),
            arg1: word(8),
            payload_len: word(12),
            checksum: word(16),
        })
    }

    /// Validate a received payload against this header.
    ///
    /// Length is always checked; the checksum only when `verify_checksum`
    /// is set (pre-v2 transports).
    pub fn verify_payload(&self, payload: &[u8], verify_checksum: bool) -> Result<()> {
        if payload.len() != self.payload_len as usize {
            return Err(WireError::LengthMismatch {
                declared: self.payload_len,
                actual: payload.len(),
            });
        }
        if verify_checksum {
            let computed = checksum(payload);
            if computed != self.checksum {
                return Err(WireError::ChecksumMismatch {
                    declared: self.checksum,
                    computed,
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_is_byte_sum() {
        assert_eq!(checksum(b""), 0);
        assert_eq!(checksum(b"\x01\x02\x03"), 6);
        assert_eq!(checksum(b"hi"), 0x68 + 0x69);
    }

    #[test]
    fn test_header_round_trip() {
        let packet = Packet::new(Command::Write, 1, 17, Bytes::from_static(b"data"));
        let encoded = packet.encode(true);
        assert_eq!(encoded.len(), HEADER_SIZE + 4);

        let header = PacketHeader::decode(&encoded).unwrap();
        assert_eq!(header.command, Command::Write);
        assert_eq!(header.arg0, 1);
        assert_eq!(header.arg1, 17);
        assert_eq!(header.payload_len, 4);
        assert_eq!(header.checksum, checksum(b"data"));
        header
            .verify_payload(&encoded[HEADER_SIZE..], true)
            .unwrap();
    }

    #[test]
    fn test_encode_without_checksum_emits_zero() {
        let packet = Packet::new(Command::Write, 1, 17, Bytes::from_static(b"data"));
        let encoded = packet.encode(false);
        let header = PacketHeader::decode(&encoded).unwrap();
        assert_eq!(header.checksum, 0);
    }

    #[test]
    fn test_truncated_header_rejected() {
        let err = PacketHeader::decode(&[0u8; 10]).unwrap_err();
        assert_eq!(err, WireError::TruncatedHeader(10));
    }

    #[test]
    fn test_magic_mismatch_rejected() {
        let packet = Packet::empty(Command::Okay, 1, 17);
        let mut encoded = packet.encode(false).to_vec();
        encoded[20] ^= 0xff;
        let err = PacketHeader::decode(&encoded).unwrap_err();
        assert!(matches!(err, WireError::MagicMismatch { .. }));
    }

    #[test]
    fn test_unknown_command_rejected() {
        // A well-formed header (magic matches) for a word outside the
        // vocabulary.
        let word: u32 = 0x5444_4142; // "BADT"
        let mut buf = Vec::with_capacity(HEADER_SIZE);
        buf.extend_from_slice(&word.to_le_bytes());
        buf.extend_from_slice(&[0u8; 16]);
        buf.extend_from_slice(&(!word).to_le_bytes());
        let err = PacketHeader::decode(&buf).unwrap_err();
        assert_eq!(err, WireError::UnknownCommand(word));
    }

    #[test]
    fn test_payload_verification() {
        let packet = Packet::new(Command::Write, 1, 17, Bytes::from_static(b"data"));
        let encoded = packet.encode(true);
        let header = PacketHeader::decode(&encoded).unwrap();

        let err = header.verify_payload(b"dat", true).unwrap_err();
        assert!(matches!(err, WireError::LengthMismatch { .. }));

        let err = header.verify_payload(b"datb", true).unwrap_err();
        assert!(matches!(err, WireError::ChecksumMismatch { .. }));

        // Checksum skipping accepts a mismatched sum as long as the
        // length agrees.
        header.verify_payload(b"datb", false).unwrap();
    }
}
