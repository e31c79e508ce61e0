/*!
Transaction-layer packet codec.

Every unit on the wire starts with a 4-byte *system header*: a 16-bit
payload type followed by the 16-bit total packet length in bytes (system
header included). The bytes after it are a sublayer header and payload.
All multi-byte integers are little-endian and all layouts are byte-exact;
peers depend on `encode` and `decode` being exact inverses.

Sublayers:
- [CXL.io](cxl_io) — PCIe-style TLPs for config space and MMIO
- [CXL.mem](cxl_mem) — M2S/S2M memory transactions
- [CXL.cache](cxl_cache) — D2H/H2D coherency transactions
- [CCI](cci) — component command interface messages
- [sideband](sideband) — connection handshake and teardown

## Example

A sideband connection request for port 2 is seven bytes on the wire:

```rust
# use pretty_assertions::assert_eq;
use cxl_fabric::transport::{Packet, sideband::SidebandPacket};

let packet = Packet::Sideband(SidebandPacket::ConnectionRequest { port: 2 });
let bytes = packet.encode();
assert_eq!(bytes, vec![
    0x0f, 0x00, // payload type: sideband
    0x07, 0x00, // payload length: 7 bytes
    0x01,       // sideband type: connection request
    0x02, 0x00, // port index
]);
assert_eq!(Packet::decode(&bytes).unwrap(), packet);
```
*/

use snafu::Snafu;

pub mod cci;
pub mod cxl_cache;
pub mod cxl_io;
pub mod cxl_mem;
pub mod framed;
pub mod sideband;

pub use cci::CciMessage;
pub use cxl_cache::CxlCachePacket;
pub use cxl_io::CxlIoPacket;
pub use cxl_mem::CxlMemPacket;
pub use sideband::SidebandPacket;

/// System header length in bytes
pub const SYSTEM_HEADER_SIZE: usize = 4;

/// Cacheline-sized data payload carried by RwD, DRS and the CXL.cache
/// data classes
pub type CacheLineData = [u8; 64];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum PayloadType {
    CxlIo = 1,
    CxlMem = 2,
    CxlCache = 3,
    Cci = 4,
    Sideband = 15,
}

impl TryFrom<u16> for PayloadType {
    type Error = DecodeError;
    fn try_from(value: u16) -> Result<Self, DecodeError> {
        match value {
            1 => Ok(Self::CxlIo),
            2 => Ok(Self::CxlMem),
            3 => Ok(Self::CxlCache),
            4 => Ok(Self::Cci),
            15 => Ok(Self::Sideband),
            _ => Err(DecodeError::UnknownPayloadType { value }),
        }
    }
}

/// Decode failures. Every variant maps to the MalformedPacket class: the
/// offending connection is logged and torn down, nothing is retried.
#[derive(Snafu, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[snafu(display("packet needs {need} bytes, got {got}"))]
    Truncated { need: usize, got: usize },
    #[snafu(display("system header advertises {advertised} bytes, buffer has {got}"))]
    LengthMismatch { advertised: usize, got: usize },
    #[snafu(display("unknown payload type {value:#06x}"))]
    UnknownPayloadType { value: u16 },
    #[snafu(display("unknown CXL.io fmt/type {value:#04x}"))]
    UnknownFmtType { value: u8 },
    #[snafu(display("unknown {layer} message class {value}"))]
    UnknownMsgClass { layer: &'static str, value: u16 },
    #[snafu(display("unknown {field} encoding {value}"))]
    UnknownField { field: &'static str, value: u8 },
    #[snafu(display("unknown sideband type {value:#04x}"))]
    UnknownSidebandType { value: u8 },
    #[snafu(display("data payload must be {expected} bytes, got {got}"))]
    BadDataLength { expected: usize, got: usize },
}

/// One decoded transaction-layer packet of any sublayer.
///
/// Decoding is two-phase: the system header yields the total length and
/// payload type, the rest is dispatched to the sublayer decoder selected
/// by that type and the sublayer's own discriminants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Io(CxlIoPacket),
    Mem(CxlMemPacket),
    Cache(CxlCachePacket),
    Cci(CciMessage),
    Sideband(SidebandPacket),
}

impl Packet {
    pub fn payload_type(&self) -> PayloadType {
        match self {
            Packet::Io(_) => PayloadType::CxlIo,
            Packet::Mem(_) => PayloadType::CxlMem,
            Packet::Cache(_) => PayloadType::CxlCache,
            Packet::Cci(_) => PayloadType::Cci,
            Packet::Sideband(_) => PayloadType::Sideband,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        match self {
            Packet::Io(p) => p.encode(),
            Packet::Mem(p) => p.encode(),
            Packet::Cache(p) => p.encode(),
            Packet::Cci(p) => p.encode(),
            Packet::Sideband(p) => p.encode(),
        }
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let header = SystemHeader::decode(bytes)?;
        if bytes.len() != usize::from(header.payload_length) {
            return Err(DecodeError::LengthMismatch {
                advertised: header.payload_length.into(),
                got: bytes.len(),
            });
        }
        let body = &bytes[SYSTEM_HEADER_SIZE..];
        match header.payload_type {
            PayloadType::CxlIo => CxlIoPacket::decode_body(body).map(Packet::Io),
            PayloadType::CxlMem => CxlMemPacket::decode_body(body).map(Packet::Mem),
            PayloadType::CxlCache => CxlCachePacket::decode_body(body).map(Packet::Cache),
            PayloadType::Cci => CciMessage::decode_body(body).map(Packet::Cci),
            PayloadType::Sideband => SidebandPacket::decode_body(body).map(Packet::Sideband),
        }
    }
}

/// The 4-byte header in front of every packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SystemHeader {
    pub payload_type: PayloadType,
    pub payload_length: u16,
}

impl SystemHeader {
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        if bytes.len() < SYSTEM_HEADER_SIZE {
            return Err(DecodeError::Truncated {
                need: SYSTEM_HEADER_SIZE,
                got: bytes.len(),
            });
        }
        let payload_type = u16::from_le_bytes([bytes[0], bytes[1]]).try_into()?;
        let payload_length = u16::from_le_bytes([bytes[2], bytes[3]]);
        Ok(Self {
            payload_type,
            payload_length,
        })
    }
}

/// Starts an encode buffer with a system header for `total_len` bytes.
/// The sublayer encoders push their header and payload behind it.
pub(crate) fn encode_prelude(payload_type: PayloadType, total_len: usize) -> Vec<u8> {
    debug_assert!(total_len <= u16::MAX as usize);
    let mut out = Vec::with_capacity(total_len);
    out.extend_from_slice(&(payload_type as u16).to_le_bytes());
    out.extend_from_slice(&(total_len as u16).to_le_bytes());
    out
}

pub(crate) fn take_cacheline(bytes: &[u8]) -> Result<CacheLineData, DecodeError> {
    let data: CacheLineData =
        bytes
            .try_into()
            .map_err(|_| DecodeError::BadDataLength {
                expected: 64,
                got: bytes.len(),
            })?;
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn system_header_round_trip() {
        let bytes = [0x02, 0x00, 0x16, 0x00];
        let header = SystemHeader::decode(&bytes).unwrap();
        assert_eq!(header.payload_type, PayloadType::CxlMem);
        assert_eq!(header.payload_length, 0x16);
    }

    #[test]
    fn rejects_unknown_payload_type() {
        let bytes = [0x09, 0x00, 0x04, 0x00];
        assert_eq!(
            Packet::decode(&bytes),
            Err(DecodeError::UnknownPayloadType { value: 9 })
        );
    }

    #[test]
    fn rejects_length_mismatch() {
        // Advertises 8 bytes but carries only 5
        let bytes = [0x0f, 0x00, 0x08, 0x00, 0x04];
        assert_eq!(
            Packet::decode(&bytes),
            Err(DecodeError::LengthMismatch {
                advertised: 8,
                got: 5
            })
        );
    }
}
