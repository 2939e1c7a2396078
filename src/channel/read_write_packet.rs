//! MySQL packet framing over a socket channel.

use crate::channel::SocketChannel;
use crate::command::server::HeaderPacket;
use crate::error::StreamResult;

pub fn read_header(ch: &mut dyn SocketChannel) -> StreamResult<HeaderPacket> {
    let mut buf = [0u8; 4];
    ch.read_exact(&mut buf)?;
    Ok(HeaderPacket::from_bytes(&buf))
}

pub fn read_bytes(ch: &mut dyn SocketChannel, len: usize) -> StreamResult<Vec<u8>> {
    let mut buf = vec![0u8; len];
    ch.read_exact(&mut buf)?;
    Ok(buf)
}

/// Read one full packet, returning `(sequence, body)`.
pub fn read_packet(ch: &mut dyn SocketChannel) -> StreamResult<(u8, Vec<u8>)> {
    let header = read_header(ch)?;
    let body = read_bytes(ch, header.packet_body_length)?;
    Ok((header.packet_sequence_number, body))
}

/// Frame and send one packet body with the given sequence number.
pub fn write_body(ch: &mut dyn SocketChannel, body: &[u8], sequence: u8) -> StreamResult<()> {
    let header = HeaderPacket {
        packet_body_length: body.len(),
        packet_sequence_number: sequence,
    };
    let mut out = Vec::with_capacity(4 + body.len());
    out.extend_from_slice(&header.to_bytes());
    out.extend_from_slice(body);
    ch.write(&out)
}

/// Commands always start a fresh sequence.
pub fn write_command(ch: &mut dyn SocketChannel, body: &[u8]) -> StreamResult<()> {
    write_body(ch, body, 0)
}
