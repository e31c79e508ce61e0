/*!
Length-prefixed packet framing over a byte stream.

A reader loop is two exact reads: one system header to learn the total
length, then the remaining `payload_length - 4` bytes, handed to the
codec as one buffer. A zero-byte read or any IO error is disconnect
detection; the caller turns that into a synthesised
`connection_disconnected` sideband marker for its outgoing mailboxes.

Also hosts the client half of the sideband handshake: request the wanted
port index, wait for accept or reject, only then exchange normal
traffic.
*/

use snafu::Snafu;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::debug;

use super::{DecodeError, Packet, SidebandPacket, SYSTEM_HEADER_SIZE};

#[derive(Snafu, Debug)]
pub enum FramedError {
    /// Peer went away; not an error for the fabric, only a state change
    #[snafu(display("connection disconnected"))]
    Disconnected,
    #[snafu(display("malformed packet: {source}"))]
    Malformed { source: DecodeError },
    #[snafu(display("socket error: {source}"))]
    Io { source: std::io::Error },
    #[snafu(display("switch rejected the connection request"))]
    Rejected,
    #[snafu(display("handshake got a non-sideband reply"))]
    HandshakeReply,
}

pub struct FramedReader {
    reader: OwnedReadHalf,
}

pub struct FramedWriter {
    writer: OwnedWriteHalf,
}

pub fn split(stream: TcpStream) -> (FramedReader, FramedWriter) {
    let (reader, writer) = stream.into_split();
    (FramedReader { reader }, FramedWriter { writer })
}

impl FramedReader {
    /// Reads exactly one packet. `Disconnected` on EOF or socket error.
    pub async fn read_packet(&mut self) -> Result<Packet, FramedError> {
        let mut header = [0u8; SYSTEM_HEADER_SIZE];
        read_fully(&mut self.reader, &mut header).await?;
        let advertised = usize::from(u16::from_le_bytes([header[2], header[3]]));
        if advertised < SYSTEM_HEADER_SIZE {
            return Err(FramedError::Malformed {
                source: DecodeError::Truncated {
                    need: SYSTEM_HEADER_SIZE,
                    got: advertised,
                },
            });
        }
        let mut buffer = vec![0u8; advertised];
        buffer[..SYSTEM_HEADER_SIZE].copy_from_slice(&header);
        read_fully(&mut self.reader, &mut buffer[SYSTEM_HEADER_SIZE..]).await?;
        let packet = Packet::decode(&buffer).map_err(|source| FramedError::Malformed { source })?;
        debug!(payload_type = ?packet.payload_type(), len = advertised, "received packet");
        Ok(packet)
    }
}

async fn read_fully(reader: &mut OwnedReadHalf, buffer: &mut [u8]) -> Result<(), FramedError> {
    if buffer.is_empty() {
        return Ok(());
    }
    match reader.read_exact(buffer).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(FramedError::Disconnected),
        Err(source) => Err(FramedError::Io { source }),
    }
}

impl FramedWriter {
    pub async fn write_packet(&mut self, packet: &Packet) -> Result<(), FramedError> {
        let bytes = packet.encode();
        self.writer
            .write_all(&bytes)
            .await
            .map_err(|source| FramedError::Io { source })?;
        self.writer
            .flush()
            .await
            .map_err(|source| FramedError::Io { source })
    }
}

/// Connects to a switch and claims `port_index` via the sideband
/// handshake. Traffic may flow once this returns.
pub async fn connect(
    addr: &str,
    port_index: u16,
) -> Result<(FramedReader, FramedWriter), FramedError> {
    let stream = TcpStream::connect(addr)
        .await
        .map_err(|source| FramedError::Io { source })?;
    stream.set_nodelay(true).ok();
    let (mut reader, mut writer) = split(stream);
    writer
        .write_packet(&Packet::Sideband(SidebandPacket::ConnectionRequest {
            port: port_index,
        }))
        .await?;
    match reader.read_packet().await? {
        Packet::Sideband(SidebandPacket::ConnectionAccept) => {
            debug!(port_index, "connection accepted");
            Ok((reader, writer))
        }
        Packet::Sideband(SidebandPacket::ConnectionReject) => Err(FramedError::Rejected),
        _ => Err(FramedError::HandshakeReply),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::cxl_mem::CxlMemPacket;
    use pretty_assertions::assert_eq;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn packets_survive_a_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (mut reader, _writer) = split(stream);
            let mut got = Vec::new();
            while let Ok(packet) = reader.read_packet().await {
                got.push(packet);
            }
            got
        });

        let stream = TcpStream::connect(addr).await.unwrap();
        let (_reader, mut writer) = split(stream);
        let sent = vec![
            Packet::Mem(CxlMemPacket::mem_rd(0x1000, 0)),
            Packet::Mem(CxlMemPacket::mem_wr(0x1040, [0xAB; 64], 0)),
            Packet::Sideband(SidebandPacket::ConnectionRequest { port: 1 }),
        ];
        for packet in &sent {
            writer.write_packet(packet).await.unwrap();
        }
        drop(writer);
        drop(_reader);

        assert_eq!(server.await.unwrap(), sent);
    }

    #[tokio::test]
    async fn eof_reads_as_disconnected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server_stream, _) = listener.accept().await.unwrap();
        drop(server_stream);
        let (mut reader, _writer) = split(client);
        assert!(matches!(
            reader.read_packet().await,
            Err(FramedError::Disconnected)
        ));
    }
}
