/*!
Sideband packets.

The sideband channel carries the connection handshake that precedes all
other traffic on a switch port: the client sends a connection request
naming the port index it wants, the switch answers with accept or reject.
`ConnectionDisconnected` is never expected from a peer; it is synthesised
locally by the framed reader on EOF and injected into the outgoing
mailboxes to unblock their writers.
*/

use super::{encode_prelude, DecodeError, PayloadType, SYSTEM_HEADER_SIZE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SidebandType {
    ConnectionRequest = 1,
    ConnectionAccept = 2,
    ConnectionReject = 3,
    ConnectionDisconnected = 4,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SidebandPacket {
    /// Asks the switch to bind this socket to a physical port
    ConnectionRequest { port: u16 },
    ConnectionAccept,
    ConnectionReject,
    /// Local marker, see module docs
    ConnectionDisconnected,
}

impl SidebandPacket {
    pub fn sideband_type(&self) -> SidebandType {
        match self {
            Self::ConnectionRequest { .. } => SidebandType::ConnectionRequest,
            Self::ConnectionAccept => SidebandType::ConnectionAccept,
            Self::ConnectionReject => SidebandType::ConnectionReject,
            Self::ConnectionDisconnected => SidebandType::ConnectionDisconnected,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let total = SYSTEM_HEADER_SIZE
            + 1
            + match self {
                Self::ConnectionRequest { .. } => 2,
                _ => 0,
            };
        let mut out = encode_prelude(PayloadType::Sideband, total);
        out.push(self.sideband_type() as u8);
        if let Self::ConnectionRequest { port } = self {
            out.extend_from_slice(&port.to_le_bytes());
        }
        out
    }

    pub(super) fn decode_body(body: &[u8]) -> Result<Self, DecodeError> {
        let kind = *body.first().ok_or(DecodeError::Truncated {
            need: SYSTEM_HEADER_SIZE + 1,
            got: SYSTEM_HEADER_SIZE + body.len(),
        })?;
        match kind {
            1 => {
                let port = body
                    .get(1..3)
                    .map(|b| u16::from_le_bytes([b[0], b[1]]))
                    .ok_or(DecodeError::Truncated {
                        need: SYSTEM_HEADER_SIZE + 3,
                        got: SYSTEM_HEADER_SIZE + body.len(),
                    })?;
                Ok(Self::ConnectionRequest { port })
            }
            2 => Ok(Self::ConnectionAccept),
            3 => Ok(Self::ConnectionReject),
            4 => Ok(Self::ConnectionDisconnected),
            value => Err(DecodeError::UnknownSidebandType { value }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Packet;
    use pretty_assertions::assert_eq;

    #[test]
    fn handshake_round_trip() {
        for packet in [
            SidebandPacket::ConnectionRequest { port: 0x0102 },
            SidebandPacket::ConnectionAccept,
            SidebandPacket::ConnectionReject,
            SidebandPacket::ConnectionDisconnected,
        ] {
            let bytes = packet.encode();
            assert_eq!(bytes.len(), usize::from(u16::from_le_bytes([bytes[2], bytes[3]])));
            assert_eq!(Packet::decode(&bytes), Ok(Packet::Sideband(packet)));
        }
    }

    #[test]
    fn truncated_request_is_rejected() {
        // Connection request missing one port byte
        let bytes = [0x0f, 0x00, 0x06, 0x00, 0x01, 0x02];
        assert!(Packet::decode(&bytes).is_err());
    }
}
