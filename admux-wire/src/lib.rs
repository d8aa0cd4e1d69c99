//! # ADB Wire Protocol Types
//!
//! This crate defines the in-memory packet model for the ADB wire protocol
//! and the pure codec functions over its fixed 24-byte header. It performs
//! no I/O; the async plumbing lives in the `admux` crate.
//!
//! ## Wire Format
//!
//! Every packet is a 24-byte little-endian header optionally followed by a
//! payload:
//!
//! ```text
//! +----------+------+------+--------+----------+-------+=========+
//! | command  | arg0 | arg1 | length | checksum | magic | payload |
//! +----------+------+------+--------+----------+-------+=========+
//!    u32       u32    u32    u32       u32       u32     length bytes
//! ```
//!
//! `magic` is the bitwise complement of `command`. `checksum` is the
//! wrapping 32-bit sum of the payload bytes on pre-v2 transports and zero
//! on transports that negotiated checksum skipping.

#![forbid(unsafe_code)]

mod command;
mod error;
mod packet;

pub use command::Command;
pub use error::{Result, WireError};
pub use packet::{checksum, Packet, PacketHeader, HEADER_SIZE};

/// Protocol version carried in the `CNXN` banner by pre-v2 implementations.
pub const VERSION: u32 = 0x0100_0000;

/// First protocol version that drops payload checksums.
pub const VERSION_SKIP_CHECKSUM: u32 = 0x0100_0001;

/// Maximum payload accepted by pre-v2 daemons (4 KiB).
pub const MAX_PAYLOAD_V1: usize = 4096;

/// Maximum payload negotiated by v2+ daemons (256 KiB).
pub const MAX_PAYLOAD_V2: usize = 256 * 1024;
