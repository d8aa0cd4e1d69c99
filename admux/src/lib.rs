//! # admux: ADB Packet Dispatcher and Socket Multiplexer
//!
//! ADB carries many logical byte streams (`shell:`, `sync:`, `reboot:`)
//! over a single full-duplex transport. This crate is the state machine in
//! the middle: it demultiplexes inbound packets to per-stream sinks,
//! arbitrates stream establishment in both directions, enforces the
//! per-stream stop-and-wait acknowledgment discipline, and propagates
//! transport loss to every dependent stream.
//!
//! ## Architecture
//!
//! - **Inbound**: one task reads packets off the transport and runs each
//!   through the protocol state machine ([`Dispatcher`]). Handlers run to
//!   completion; stream and pending-open tables sit behind a mutex that is
//!   never held across an await.
//! - **Outbound**: one task exclusively owns the transport write half and
//!   drains a bounded packet queue, serializing all writes.
//! - **Per stream**: a [`Socket`] hands the application a read queue with
//!   rendezvous backpressure (the reciprocating `OKAY` is withheld until
//!   the reader consumes) and a write gate that releases one `WRTE` per
//!   peer `OKAY`.
//!
//! Peer-initiated streams are offered to a host-provided [`SocketHook`];
//! unhandled streams are refused on the wire and never enter the table.
//!
//! The transport is any `AsyncRead`/`AsyncWrite` pair that already passed
//! connection setup and authentication; this crate starts from the first
//! stream-layer packet.

#![forbid(unsafe_code)]

mod config;
mod dispatcher;
mod error;
mod hook;
mod ids;
mod pending;
mod socket;
pub mod transport;

pub use admux_wire as wire;

pub use config::Config;
pub use dispatcher::Dispatcher;
pub use error::{Error, Result};
pub use hook::{IncomingSocket, RejectAll, SocketHook};
pub use socket::Socket;
