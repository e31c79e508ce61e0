/*!
CXL.io transaction layer packets.

CXL.io is PCIe with a CXL TLP prefix in front: every packet carries a
4-byte prefix holding the logical-device id used for MLD routing, the
standard TLP DW0 (fmt/type, traffic class, length in DWORDs), and a
fmt/type-specific request or completion header. Config requests are routed
by destination BDF, memory requests by address, completions by transaction
id (requester id + tag).

Wire layout after the system header:

```plaintext
+0x00  TLP prefix      ld_id[15:0], reserved
+0x04  DW0             fmt_type[7:0], tc, attr, length[9:0]
+0x08  request header  8 bytes (cfg/cpl) or 12 bytes (mem)
 ...   data            CfgWr: 1 DW; MWr/CplD: length-delimited
```

## Example

```rust
# use pretty_assertions::assert_eq;
use cxl_fabric::transport::{Packet, cxl_io::CxlIoPacket};
use cxl_fabric::pci::Bdf;

let packet = CxlIoPacket::cfg_read(Bdf::new(1, 0, 0), 0x00, 0x42);
let bytes = packet.encode();
assert_eq!(bytes.len(), 20);
assert_eq!(Packet::decode(&bytes).unwrap(), Packet::Io(packet));
```
*/

use modular_bitfield::prelude::*;

use super::{encode_prelude, DecodeError, PayloadType, SYSTEM_HEADER_SIZE};
use crate::pci::Bdf;

/// CXL TLP prefix. Only the logical-device id is live; single logical
/// devices leave it at zero.
#[bitfield(bits = 32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TlpPrefix {
    pub ld_id: B16,
    #[skip]
    __: B16,
}

/// PCIe fmt/type byte values for the TLP shapes the fabric carries
#[derive(BitfieldSpecifier, Debug, Clone, Copy, PartialEq, Eq)]
#[bits = 8]
pub enum FmtType {
    MemRd32 = 0b0000_0000,
    CfgRd0 = 0b0000_0100,
    Cpl = 0b0000_1010,
    MemRd64 = 0b0010_0000,
    MemWr32 = 0b0100_0000,
    CfgWr0 = 0b0100_0100,
    CplD = 0b0100_1010,
    MemWr64 = 0b0110_0000,
}

/// TLP DW0. Bit offsets follow the PCIe transaction-layer header with the
/// fmt and type fields merged into one byte.
#[bitfield(bits = 32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CxlIoDw0 {
    pub fmt_type: FmtType,
    pub th: bool,
    #[skip]
    __: B1,
    pub attr_b2: bool,
    pub t8: bool,
    pub tc: B3,
    pub t9: bool,
    pub length_upper: B2,
    pub at: B2,
    pub attr: B2,
    pub ep: bool,
    pub td: bool,
    pub length_lower: B8,
}

impl CxlIoDw0 {
    pub fn for_type(fmt_type: FmtType, length_dw: u16) -> Self {
        Self::new()
            .with_fmt_type(fmt_type)
            .with_length_upper((length_dw >> 8) as u8)
            .with_length_lower((length_dw & 0xff) as u8)
    }

    /// Payload length in DWORDs
    pub fn length_dw(&self) -> u16 {
        u16::from(self.length_upper()) << 8 | u16::from(self.length_lower())
    }
}

/// Configuration request header (CfgRd0 / CfgWr0)
#[bitfield(bits = 64)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CfgReqHeader {
    pub req_id: B16,
    pub tag: B8,
    pub first_dw_be: B4,
    pub last_dw_be: B4,
    pub dest_id: B16,
    pub ext_reg_num: B4,
    #[skip]
    __: B4,
    #[skip]
    __: B2,
    pub reg_num: B6,
}

impl CfgReqHeader {
    /// Register byte offset within the 4 KiB configuration space
    pub fn register_offset(&self) -> u16 {
        (u16::from(self.ext_reg_num()) << 6 | u16::from(self.reg_num())) << 2
    }

    pub fn with_register_offset(self, offset: u16) -> Self {
        let dw = offset >> 2;
        self.with_reg_num((dw & 0x3f) as u8)
            .with_ext_reg_num((dw >> 6) as u8)
    }
}

/// Memory request header (MRd / MWr). Address bits 2..63 live in one
/// 62-bit field; the two low bits are reserved.
#[bitfield(bits = 96)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemReqHeader {
    pub req_id: B16,
    pub tag: B8,
    pub first_dw_be: B4,
    pub last_dw_be: B4,
    #[skip]
    __: B2,
    pub addr: B62,
}

impl MemReqHeader {
    pub fn address(&self) -> u64 {
        self.addr() << 2
    }

    pub fn with_address(self, address: u64) -> Self {
        self.with_addr(address >> 2)
    }
}

#[derive(BitfieldSpecifier, Debug, Clone, Copy, PartialEq, Eq)]
#[bits = 3]
pub enum CplStatus {
    SuccessfulCompletion = 0b000,
    UnsupportedRequest = 0b001,
    ConfigRetry = 0b010,
    CompleterAbort = 0b100,
}

/// Completion header (Cpl / CplD)
#[bitfield(bits = 64)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CplHeader {
    pub cpl_id: B16,
    pub byte_count_upper: B4,
    pub bcm: bool,
    pub status: CplStatus,
    pub byte_count_lower: B8,
    pub req_id: B16,
    pub tag: B8,
    pub lower_addr: B7,
    #[skip]
    __: B1,
}

impl CplHeader {
    pub fn byte_count(&self) -> u16 {
        u16::from(self.byte_count_upper()) << 8 | u16::from(self.byte_count_lower())
    }

    pub fn with_byte_count(self, count: u16) -> Self {
        self.with_byte_count_upper((count >> 8) as u8)
            .with_byte_count_lower((count & 0xff) as u8)
    }
}

/// CfgRd0 or CfgWr0, distinguished by `dw0.fmt_type`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CxlIoCfgPacket {
    pub prefix: TlpPrefix,
    pub dw0: CxlIoDw0,
    pub header: CfgReqHeader,
    /// One DW for writes, absent on reads
    pub data: Option<u32>,
}

/// MRd or MWr, distinguished by `dw0.fmt_type`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CxlIoMemPacket {
    pub prefix: TlpPrefix,
    pub dw0: CxlIoDw0,
    pub header: MemReqHeader,
    /// `length_dw * 4` bytes for writes, empty on reads
    pub data: Vec<u8>,
}

/// Cpl or CplD, distinguished by `dw0.fmt_type`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CxlIoCplPacket {
    pub prefix: TlpPrefix,
    pub dw0: CxlIoDw0,
    pub header: CplHeader,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CxlIoPacket {
    Cfg(CxlIoCfgPacket),
    Mem(CxlIoMemPacket),
    Cpl(CxlIoCplPacket),
}

impl CxlIoPacket {
    pub fn cfg_read(bdf: Bdf, offset: u16, tag: u8) -> Self {
        Self::cfg_request(FmtType::CfgRd0, bdf, offset, tag, None)
    }

    pub fn cfg_write(bdf: Bdf, offset: u16, tag: u8, data: u32) -> Self {
        Self::cfg_request(FmtType::CfgWr0, bdf, offset, tag, Some(data))
    }

    fn cfg_request(fmt_type: FmtType, bdf: Bdf, offset: u16, tag: u8, data: Option<u32>) -> Self {
        Self::Cfg(CxlIoCfgPacket {
            prefix: TlpPrefix::new(),
            dw0: CxlIoDw0::for_type(fmt_type, 1),
            header: CfgReqHeader::new()
                .with_tag(tag)
                .with_first_dw_be(0xf)
                .with_dest_id(bdf.into())
                .with_register_offset(offset),
            data,
        })
    }

    pub fn mem_read(addr: u64, size: usize, tag: u8) -> Self {
        Self::Mem(CxlIoMemPacket {
            prefix: TlpPrefix::new(),
            dw0: CxlIoDw0::for_type(FmtType::MemRd64, (size / 4) as u16),
            header: MemReqHeader::new()
                .with_tag(tag)
                .with_first_dw_be(0xf)
                .with_address(addr),
            data: Vec::new(),
        })
    }

    pub fn mem_write(addr: u64, data: &[u8], tag: u8) -> Self {
        Self::Mem(CxlIoMemPacket {
            prefix: TlpPrefix::new(),
            dw0: CxlIoDw0::for_type(FmtType::MemWr64, (data.len() / 4) as u16),
            header: MemReqHeader::new()
                .with_tag(tag)
                .with_first_dw_be(0xf)
                .with_address(addr),
            data: data.to_vec(),
        })
    }

    /// Completion without data, paired to the request's (req_id, tag)
    pub fn completion(req_id: u16, tag: u8, status: CplStatus) -> Self {
        Self::Cpl(CxlIoCplPacket {
            prefix: TlpPrefix::new(),
            dw0: CxlIoDw0::for_type(FmtType::Cpl, 0),
            header: CplHeader::new()
                .with_status(status)
                .with_req_id(req_id)
                .with_tag(tag),
            data: Vec::new(),
        })
    }

    pub fn completion_with_data(req_id: u16, tag: u8, data: &[u8]) -> Self {
        Self::Cpl(CxlIoCplPacket {
            prefix: TlpPrefix::new(),
            dw0: CxlIoDw0::for_type(FmtType::CplD, (data.len() / 4) as u16),
            header: CplHeader::new()
                .with_status(CplStatus::SuccessfulCompletion)
                .with_byte_count(data.len() as u16)
                .with_req_id(req_id)
                .with_tag(tag),
            data: data.to_vec(),
        })
    }

    pub fn fmt_type(&self) -> FmtType {
        match self {
            Self::Cfg(p) => p.dw0.fmt_type(),
            Self::Mem(p) => p.dw0.fmt_type(),
            Self::Cpl(p) => p.dw0.fmt_type(),
        }
    }

    pub fn is_cfg(&self) -> bool {
        matches!(self, Self::Cfg(_))
    }

    pub fn is_mmio(&self) -> bool {
        matches!(self, Self::Mem(_))
    }

    pub fn is_cpl(&self) -> bool {
        matches!(self.fmt_type(), FmtType::Cpl)
    }

    pub fn is_cpld(&self) -> bool {
        matches!(self.fmt_type(), FmtType::CplD)
    }

    pub fn is_mem_write(&self) -> bool {
        matches!(self.fmt_type(), FmtType::MemWr32 | FmtType::MemWr64)
    }

    pub fn ld_id(&self) -> u16 {
        match self {
            Self::Cfg(p) => p.prefix.ld_id(),
            Self::Mem(p) => p.prefix.ld_id(),
            Self::Cpl(p) => p.prefix.ld_id(),
        }
    }

    pub fn set_ld_id(&mut self, ld_id: u16) {
        match self {
            Self::Cfg(p) => p.prefix.set_ld_id(ld_id),
            Self::Mem(p) => p.prefix.set_ld_id(ld_id),
            Self::Cpl(p) => p.prefix.set_ld_id(ld_id),
        }
    }

    /// Requester id + tag; pairs requests with their completions
    pub fn transaction_id(&self) -> u32 {
        match self {
            Self::Cfg(p) => u32::from(p.header.req_id()) << 8 | u32::from(p.header.tag()),
            Self::Mem(p) => u32::from(p.header.req_id()) << 8 | u32::from(p.header.tag()),
            Self::Cpl(p) => u32::from(p.header.req_id()) << 8 | u32::from(p.header.tag()),
        }
    }

    /// Completion payload interpreted as a little-endian DW, zero when
    /// the completion carries no data
    pub fn completion_value(&self) -> u32 {
        match self {
            Self::Cpl(p) if p.data.len() >= 4 => {
                u32::from_le_bytes([p.data[0], p.data[1], p.data[2], p.data[3]])
            }
            _ => 0,
        }
    }

    pub fn is_status_ur(&self) -> bool {
        matches!(
            self,
            Self::Cpl(p) if p.header.status() == CplStatus::UnsupportedRequest
        )
    }

    pub fn encode(&self) -> Vec<u8> {
        let (prefix, dw0) = match self {
            Self::Cfg(p) => (p.prefix, p.dw0),
            Self::Mem(p) => (p.prefix, p.dw0),
            Self::Cpl(p) => (p.prefix, p.dw0),
        };
        let body_len = match self {
            Self::Cfg(p) => 8 + if p.data.is_some() { 4 } else { 0 },
            Self::Mem(p) => 12 + p.data.len(),
            Self::Cpl(p) => 8 + p.data.len(),
        };
        let total = SYSTEM_HEADER_SIZE + 8 + body_len;
        let mut out = encode_prelude(PayloadType::CxlIo, total);
        out.extend_from_slice(&prefix.into_bytes());
        out.extend_from_slice(&dw0.into_bytes());
        match self {
            Self::Cfg(p) => {
                out.extend_from_slice(&p.header.into_bytes());
                if let Some(data) = p.data {
                    out.extend_from_slice(&data.to_le_bytes());
                }
            }
            Self::Mem(p) => {
                out.extend_from_slice(&p.header.into_bytes());
                out.extend_from_slice(&p.data);
            }
            Self::Cpl(p) => {
                out.extend_from_slice(&p.header.into_bytes());
                out.extend_from_slice(&p.data);
            }
        }
        out
    }

    pub(super) fn decode_body(body: &[u8]) -> Result<Self, DecodeError> {
        let need = |n: usize| DecodeError::Truncated {
            need: SYSTEM_HEADER_SIZE + n,
            got: SYSTEM_HEADER_SIZE + body.len(),
        };
        let prefix_bytes: [u8; 4] = body.get(..4).ok_or(need(8))?.try_into().unwrap();
        let dw0_bytes: [u8; 4] = body.get(4..8).ok_or(need(8))?.try_into().unwrap();
        let prefix = TlpPrefix::from_bytes(prefix_bytes);
        let dw0 = CxlIoDw0::from_bytes(dw0_bytes);
        let fmt_type = dw0
            .fmt_type_or_err()
            .map_err(|e| DecodeError::UnknownFmtType {
                value: e.invalid_bytes,
            })?;
        let rest = &body[8..];
        match fmt_type {
            FmtType::CfgRd0 | FmtType::CfgWr0 => {
                let header_bytes: [u8; 8] = rest.get(..8).ok_or(need(16))?.try_into().unwrap();
                let header = CfgReqHeader::from_bytes(header_bytes);
                let data = if fmt_type == FmtType::CfgWr0 {
                    let dw: [u8; 4] = rest.get(8..12).ok_or(need(20))?.try_into().unwrap();
                    Some(u32::from_le_bytes(dw))
                } else {
                    None
                };
                Ok(Self::Cfg(CxlIoCfgPacket {
                    prefix,
                    dw0,
                    header,
                    data,
                }))
            }
            FmtType::MemRd32 | FmtType::MemRd64 | FmtType::MemWr32 | FmtType::MemWr64 => {
                let header_bytes: [u8; 12] = rest.get(..12).ok_or(need(20))?.try_into().unwrap();
                let header = MemReqHeader::from_bytes(header_bytes);
                let data = rest[12..].to_vec();
                if matches!(fmt_type, FmtType::MemWr32 | FmtType::MemWr64) {
                    let expected = usize::from(dw0.length_dw()) * 4;
                    if data.len() != expected {
                        return Err(DecodeError::BadDataLength {
                            expected,
                            got: data.len(),
                        });
                    }
                }
                Ok(Self::Mem(CxlIoMemPacket {
                    prefix,
                    dw0,
                    header,
                    data,
                }))
            }
            FmtType::Cpl | FmtType::CplD => {
                let header_bytes: [u8; 8] = rest.get(..8).ok_or(need(16))?.try_into().unwrap();
                let header = CplHeader::from_bytes(header_bytes);
                header
                    .status_or_err()
                    .map_err(|e| DecodeError::UnknownField {
                        field: "completion status",
                        value: e.invalid_bytes,
                    })?;
                Ok(Self::Cpl(CxlIoCplPacket {
                    prefix,
                    dw0,
                    header,
                    data: rest[8..].to_vec(),
                }))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Packet;
    use pretty_assertions::assert_eq;

    fn round_trip(packet: CxlIoPacket) {
        let bytes = packet.encode();
        let advertised = usize::from(u16::from_le_bytes([bytes[2], bytes[3]]));
        assert_eq!(bytes.len(), advertised);
        assert_eq!(Packet::decode(&bytes).unwrap(), Packet::Io(packet));
    }

    #[test]
    fn cfg_read_round_trip() {
        round_trip(CxlIoPacket::cfg_read(Bdf::new(2, 1, 0), 0x10, 7));
    }

    #[test]
    fn cfg_write_round_trip() {
        round_trip(CxlIoPacket::cfg_write(Bdf::new(1, 0, 0), 0x20, 3, 0xFE00_0000));
    }

    #[test]
    fn mem_write_round_trip() {
        round_trip(CxlIoPacket::mem_write(0xFE10_0000, &0xDEAD_BEEFu32.to_le_bytes(), 9));
    }

    #[test]
    fn completion_round_trip() {
        round_trip(CxlIoPacket::completion(0, 3, CplStatus::UnsupportedRequest));
        round_trip(CxlIoPacket::completion_with_data(0, 4, &[1, 2, 3, 4]));
    }

    #[test]
    fn address_field_holds_bits_2_to_63() {
        let packet = CxlIoPacket::mem_read(0x1234_5678_9abc_def0, 4, 0);
        match &packet {
            CxlIoPacket::Mem(p) => {
                assert_eq!(p.header.addr(), 0x1234_5678_9abc_def0 >> 2);
                assert_eq!(p.header.address(), 0x1234_5678_9abc_def0);
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn register_offset_split() {
        let header = CfgReqHeader::new().with_register_offset(0x104);
        assert_eq!(header.ext_reg_num(), 1);
        assert_eq!(header.reg_num(), 1);
        assert_eq!(header.register_offset(), 0x104);
    }

    #[test]
    fn mem_write_length_mismatch_is_rejected() {
        let mut bytes = CxlIoPacket::mem_write(0x1000, &[0; 8], 0).encode();
        // Drop the last data DW without fixing length_dw
        bytes.truncate(bytes.len() - 4);
        let len = bytes.len() as u16;
        bytes[2..4].copy_from_slice(&len.to_le_bytes());
        assert!(matches!(
            Packet::decode(&bytes),
            Err(DecodeError::BadDataLength { .. })
        ));
    }

    #[test]
    fn ur_detection() {
        let cpl = CxlIoPacket::completion(0, 0, CplStatus::UnsupportedRequest);
        assert!(cpl.is_status_ur());
        let ok = CxlIoPacket::completion_with_data(0, 0, &[0; 4]);
        assert!(!ok.is_status_ur());
    }
}
