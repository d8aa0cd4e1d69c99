//! Framed packet I/O over a byte transport.
//!
//! The dispatcher consumes any `AsyncRead`/`AsyncWrite` pair that already
//! carries a connected, authenticated ADB session. These helpers frame
//! whole packets over it: a fixed 24-byte header, then the declared
//! payload.

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};
use crate::wire::{Packet, PacketHeader, WireError, HEADER_SIZE};

/// Read the next packet off the transport.
///
/// Returns `Ok(None)` on a clean end-of-stream at a packet boundary. An
/// end-of-stream inside a packet, or any decode failure, is an error: the
/// framing can no longer be trusted.
pub async fn read_packet<R>(
    reader: &mut R,
    verify_checksum: bool,
    max_payload: usize,
) -> Result<Option<Packet>>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_SIZE];
    let mut filled = match reader.read(&mut header).await? {
        0 => return Ok(None),
        n => n,
    };
    while filled < HEADER_SIZE {
        let n = reader.read(&mut header[filled..]).await?;
        if n == 0 {
            return Err(Error::Transport(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "transport closed mid-header",
            )));
        }
        filled += n;
    }

    let header = PacketHeader::decode(&header)?;
    if header.payload_len as usize > max_payload {
        return Err(Error::Wire(WireError::PayloadTooLong {
            declared: header.payload_len,
            limit: max_payload,
        }));
    }

    let mut payload = vec![0u8; header.payload_len as usize];
    reader.read_exact(&mut payload).await?;
    header.verify_payload(&payload, verify_checksum)?;

    Ok(Some(Packet {
        command: header.command,
        arg0: header.arg0,
        arg1: header.arg1,
        payload: Bytes::from(payload),
    }))
}

/// Write one packet to the transport and flush it.
pub async fn write_packet<W>(
    writer: &mut W,
    packet: &Packet,
    calculate_checksum: bool,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let buf = packet.encode(calculate_checksum);
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}
