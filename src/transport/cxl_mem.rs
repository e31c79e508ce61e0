/*!
CXL.mem transaction packets.

Six message classes, three per direction. M2S (master to subordinate)
carries requests from a host toward memory: Req (MemRd/MemInv), RwD
(MemWr plus a 64-byte cacheline) and BIRsp (replies to device-initiated
back-invalidate snoops). S2M (subordinate to master) carries the device
side: NDR (non-data responses Cmp/Cmp-S/Cmp-E/Cmp-M), DRS (64-byte data
responses) and BISnp (back-invalidate snoops).

Every class header carries a logical-device id so a multi-logical device
can route per LD. Addresses are cacheline-aligned and stored shifted
right by six.

Field encodings (opcodes, meta field/value, snoop type) follow the CXL
3.0 M2S/S2M tables.
*/

use modular_bitfield::prelude::*;

use super::{
    encode_prelude, take_cacheline, CacheLineData, DecodeError, PayloadType, SYSTEM_HEADER_SIZE,
};

#[derive(BitfieldSpecifier, Debug, Clone, Copy, PartialEq, Eq)]
#[bits = 4]
pub enum MemMsgClass {
    M2SReq = 1,
    M2SRwD = 2,
    M2SBIRsp = 3,
    S2MBISnp = 4,
    S2MNdr = 5,
    S2MDrs = 6,
}

/// Two-byte class header in front of every CXL.mem packet
#[bitfield(bits = 16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CxlMemHeader {
    pub msg_class: MemMsgClass,
    #[skip]
    __: B12,
}

#[derive(BitfieldSpecifier, Debug, Clone, Copy, PartialEq, Eq)]
#[bits = 4]
pub enum MemOpcode {
    MemInv = 0b0000,
    MemRd = 0b0001,
    MemRdData = 0b0010,
    MemRdFwd = 0b0011,
    MemWrFwd = 0b0100,
    MemInvNt = 0b1001,
}

#[derive(BitfieldSpecifier, Debug, Clone, Copy, PartialEq, Eq)]
#[bits = 4]
pub enum RwdOpcode {
    MemWr = 0b0001,
    MemWrPtl = 0b0010,
}

#[derive(BitfieldSpecifier, Debug, Clone, Copy, PartialEq, Eq)]
#[bits = 4]
pub enum BIRspOpcode {
    BIRspI = 0b0000,
    BIRspS = 0b0001,
    BIRspE = 0b0010,
    BIRspIBlk = 0b0100,
    BIRspSBlk = 0b0101,
    BIRspEBlk = 0b0110,
}

#[derive(BitfieldSpecifier, Debug, Clone, Copy, PartialEq, Eq)]
#[bits = 4]
pub enum BISnpOpcode {
    BISnpCur = 0b0000,
    BISnpData = 0b0001,
    BISnpInv = 0b0010,
    BISnpCurBlk = 0b0100,
    BISnpDataBlk = 0b0101,
    BISnpInvBlk = 0b0110,
}

#[derive(BitfieldSpecifier, Debug, Clone, Copy, PartialEq, Eq)]
#[bits = 3]
pub enum NdrOpcode {
    Cmp = 0b000,
    CmpS = 0b001,
    CmpE = 0b010,
    CmpM = 0b011,
    BiConflictAck = 0b100,
}

#[derive(BitfieldSpecifier, Debug, Clone, Copy, PartialEq, Eq)]
#[bits = 3]
pub enum DrsOpcode {
    MemData = 0b000,
    MemDataNxm = 0b001,
}

#[derive(BitfieldSpecifier, Debug, Clone, Copy, PartialEq, Eq)]
#[bits = 2]
pub enum MetaField {
    Meta0State = 0b00,
    NoOp = 0b11,
}

#[derive(BitfieldSpecifier, Debug, Clone, Copy, PartialEq, Eq)]
#[bits = 2]
pub enum MetaValue {
    Invalid = 0b00,
    Any = 0b10,
    Shared = 0b11,
}

#[derive(BitfieldSpecifier, Debug, Clone, Copy, PartialEq, Eq)]
#[bits = 3]
pub enum SnpType {
    NoOp = 0b000,
    SnpData = 0b001,
    SnpCur = 0b010,
    SnpInv = 0b011,
}

#[bitfield(bits = 128)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct M2SReqHeader {
    pub valid: bool,
    pub mem_opcode: MemOpcode,
    pub snp_type: SnpType,
    pub meta_field: MetaField,
    pub meta_value: MetaValue,
    pub tag: B16,
    pub addr: B46,
    pub ld_id: B4,
    #[skip]
    __: B50,
}

#[bitfield(bits = 128)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct M2SRwDHeader {
    pub valid: bool,
    pub mem_opcode: RwdOpcode,
    pub snp_type: SnpType,
    pub meta_field: MetaField,
    pub meta_value: MetaValue,
    pub tag: B16,
    pub addr: B46,
    pub poison: bool,
    pub bep: bool,
    pub ld_id: B4,
    #[skip]
    __: B48,
}

#[bitfield(bits = 64)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct M2SBIRspHeader {
    pub valid: bool,
    pub opcode: BIRspOpcode,
    pub bi_id: B12,
    pub bi_tag: B12,
    pub low_addr: B2,
    #[skip]
    __: B33,
}

#[bitfield(bits = 128)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct S2MBISnpHeader {
    pub valid: bool,
    pub opcode: BISnpOpcode,
    pub bi_id: B12,
    pub bi_tag: B12,
    pub addr: B46,
    #[skip]
    __: B53,
}

#[bitfield(bits = 64)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct S2MNdrHeader {
    pub valid: bool,
    pub opcode: NdrOpcode,
    pub meta_field: MetaField,
    pub meta_value: MetaValue,
    pub tag: B16,
    pub ld_id: B4,
    pub dev_load: B2,
    #[skip]
    __: B34,
}

#[bitfield(bits = 64)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct S2MDrsHeader {
    pub valid: bool,
    pub opcode: DrsOpcode,
    pub meta_field: MetaField,
    pub meta_value: MetaValue,
    pub tag: B16,
    pub poison: bool,
    pub ld_id: B4,
    pub dev_load: B2,
    #[skip]
    __: B33,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CxlMemPacket {
    M2SReq(M2SReqHeader),
    M2SRwD(M2SRwDHeader, CacheLineData),
    M2SBIRsp(M2SBIRspHeader),
    S2MBISnp(S2MBISnpHeader),
    S2MNdr(S2MNdrHeader),
    S2MDrs(S2MDrsHeader, CacheLineData),
}

impl CxlMemPacket {
    pub fn m2s_req(
        opcode: MemOpcode,
        meta_field: MetaField,
        meta_value: MetaValue,
        snp_type: SnpType,
        addr: u64,
        ld_id: u8,
    ) -> Self {
        Self::M2SReq(
            M2SReqHeader::new()
                .with_valid(true)
                .with_mem_opcode(opcode)
                .with_meta_field(meta_field)
                .with_meta_value(meta_value)
                .with_snp_type(snp_type)
                .with_addr(addr >> 6)
                .with_ld_id(ld_id),
        )
    }

    /// HDM-H plain read
    pub fn mem_rd(addr: u64, ld_id: u8) -> Self {
        Self::m2s_req(
            MemOpcode::MemRd,
            MetaField::NoOp,
            MetaValue::Any,
            SnpType::NoOp,
            addr,
            ld_id,
        )
    }

    pub fn m2s_rwd(
        opcode: RwdOpcode,
        meta_field: MetaField,
        meta_value: MetaValue,
        snp_type: SnpType,
        addr: u64,
        data: CacheLineData,
        ld_id: u8,
    ) -> Self {
        Self::M2SRwD(
            M2SRwDHeader::new()
                .with_valid(true)
                .with_mem_opcode(opcode)
                .with_meta_field(meta_field)
                .with_meta_value(meta_value)
                .with_snp_type(snp_type)
                .with_addr(addr >> 6)
                .with_ld_id(ld_id),
            data,
        )
    }

    /// HDM-H plain write
    pub fn mem_wr(addr: u64, data: CacheLineData, ld_id: u8) -> Self {
        Self::m2s_rwd(
            RwdOpcode::MemWr,
            MetaField::NoOp,
            MetaValue::Any,
            SnpType::NoOp,
            addr,
            data,
            ld_id,
        )
    }

    pub fn birsp(opcode: BIRspOpcode, bi_id: u16, bi_tag: u16) -> Self {
        Self::M2SBIRsp(
            M2SBIRspHeader::new()
                .with_valid(true)
                .with_opcode(opcode)
                .with_bi_id(bi_id)
                .with_bi_tag(bi_tag),
        )
    }

    pub fn bisnp(opcode: BISnpOpcode, addr: u64, bi_id: u16, bi_tag: u16) -> Self {
        Self::S2MBISnp(
            S2MBISnpHeader::new()
                .with_valid(true)
                .with_opcode(opcode)
                .with_bi_id(bi_id)
                .with_bi_tag(bi_tag)
                .with_addr(addr >> 6),
        )
    }

    pub fn ndr(opcode: NdrOpcode, meta_field: MetaField, meta_value: MetaValue, ld_id: u8) -> Self {
        Self::S2MNdr(
            S2MNdrHeader::new()
                .with_valid(true)
                .with_opcode(opcode)
                .with_meta_field(meta_field)
                .with_meta_value(meta_value)
                .with_ld_id(ld_id),
        )
    }

    /// Plain completion for an HDM-H write
    pub fn cmp(ld_id: u8) -> Self {
        Self::ndr(NdrOpcode::Cmp, MetaField::Meta0State, MetaValue::Invalid, ld_id)
    }

    pub fn drs(data: CacheLineData, ld_id: u8) -> Self {
        Self::S2MDrs(
            S2MDrsHeader::new()
                .with_valid(true)
                .with_opcode(DrsOpcode::MemData)
                .with_meta_field(MetaField::NoOp)
                .with_meta_value(MetaValue::Any)
                .with_ld_id(ld_id),
            data,
        )
    }

    pub fn msg_class(&self) -> MemMsgClass {
        match self {
            Self::M2SReq(_) => MemMsgClass::M2SReq,
            Self::M2SRwD(..) => MemMsgClass::M2SRwD,
            Self::M2SBIRsp(_) => MemMsgClass::M2SBIRsp,
            Self::S2MBISnp(_) => MemMsgClass::S2MBISnp,
            Self::S2MNdr(_) => MemMsgClass::S2MNdr,
            Self::S2MDrs(..) => MemMsgClass::S2MDrs,
        }
    }

    pub fn is_s2m(&self) -> bool {
        matches!(
            self,
            Self::S2MBISnp(_) | Self::S2MNdr(_) | Self::S2MDrs(..)
        )
    }

    /// Cacheline address for the classes that carry one
    pub fn address(&self) -> Option<u64> {
        match self {
            Self::M2SReq(h) => Some(h.addr() << 6),
            Self::M2SRwD(h, _) => Some(h.addr() << 6),
            Self::S2MBISnp(h) => Some(h.addr() << 6),
            _ => None,
        }
    }

    pub fn ld_id(&self) -> u8 {
        match self {
            Self::M2SReq(h) => h.ld_id(),
            Self::M2SRwD(h, _) => h.ld_id(),
            Self::S2MNdr(h) => h.ld_id(),
            Self::S2MDrs(h, _) => h.ld_id(),
            // BI channels are not LD-routed
            Self::M2SBIRsp(_) | Self::S2MBISnp(_) => 0,
        }
    }

    pub fn set_ld_id(&mut self, ld_id: u8) {
        match self {
            Self::M2SReq(h) => h.set_ld_id(ld_id),
            Self::M2SRwD(h, _) => h.set_ld_id(ld_id),
            Self::S2MNdr(h) => h.set_ld_id(ld_id),
            Self::S2MDrs(h, _) => h.set_ld_id(ld_id),
            Self::M2SBIRsp(_) | Self::S2MBISnp(_) => {}
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let (header_len, data): (usize, Option<&CacheLineData>) = match self {
            Self::M2SReq(_) => (16, None),
            Self::M2SRwD(_, data) => (16, Some(data)),
            Self::M2SBIRsp(_) => (8, None),
            Self::S2MBISnp(_) => (16, None),
            Self::S2MNdr(_) => (8, None),
            Self::S2MDrs(_, data) => (8, Some(data)),
        };
        let total = SYSTEM_HEADER_SIZE + 2 + header_len + data.map_or(0, |d| d.len());
        let mut out = encode_prelude(PayloadType::CxlMem, total);
        out.extend_from_slice(
            &CxlMemHeader::new()
                .with_msg_class(self.msg_class())
                .into_bytes(),
        );
        match self {
            Self::M2SReq(h) => out.extend_from_slice(&h.into_bytes()),
            Self::M2SRwD(h, _) => out.extend_from_slice(&h.into_bytes()),
            Self::M2SBIRsp(h) => out.extend_from_slice(&h.into_bytes()),
            Self::S2MBISnp(h) => out.extend_from_slice(&h.into_bytes()),
            Self::S2MNdr(h) => out.extend_from_slice(&h.into_bytes()),
            Self::S2MDrs(h, _) => out.extend_from_slice(&h.into_bytes()),
        }
        if let Some(data) = data {
            out.extend_from_slice(data);
        }
        out
    }

    pub(super) fn decode_body(body: &[u8]) -> Result<Self, DecodeError> {
        let need = |n: usize| DecodeError::Truncated {
            need: SYSTEM_HEADER_SIZE + n,
            got: SYSTEM_HEADER_SIZE + body.len(),
        };
        let class_bytes: [u8; 2] = body.get(..2).ok_or(need(2))?.try_into().unwrap();
        let msg_class = CxlMemHeader::from_bytes(class_bytes)
            .msg_class_or_err()
            .map_err(|e| DecodeError::UnknownMsgClass {
                layer: "CXL.mem",
                value: e.invalid_bytes.into(),
            })?;
        let rest = &body[2..];
        let field_err = |field: &'static str, value: u8| DecodeError::UnknownField { field, value };
        match msg_class {
            MemMsgClass::M2SReq => {
                let bytes: [u8; 16] = rest.get(..16).ok_or(need(18))?.try_into().unwrap();
                let header = M2SReqHeader::from_bytes(bytes);
                header
                    .mem_opcode_or_err()
                    .map_err(|e| field_err("M2S Req opcode", e.invalid_bytes))?;
                Ok(Self::M2SReq(header))
            }
            MemMsgClass::M2SRwD => {
                let bytes: [u8; 16] = rest.get(..16).ok_or(need(18))?.try_into().unwrap();
                let header = M2SRwDHeader::from_bytes(bytes);
                header
                    .mem_opcode_or_err()
                    .map_err(|e| field_err("M2S RwD opcode", e.invalid_bytes))?;
                Ok(Self::M2SRwD(header, take_cacheline(&rest[16..])?))
            }
            MemMsgClass::M2SBIRsp => {
                let bytes: [u8; 8] = rest.get(..8).ok_or(need(10))?.try_into().unwrap();
                let header = M2SBIRspHeader::from_bytes(bytes);
                header
                    .opcode_or_err()
                    .map_err(|e| field_err("BIRsp opcode", e.invalid_bytes))?;
                Ok(Self::M2SBIRsp(header))
            }
            MemMsgClass::S2MBISnp => {
                let bytes: [u8; 16] = rest.get(..16).ok_or(need(18))?.try_into().unwrap();
                let header = S2MBISnpHeader::from_bytes(bytes);
                header
                    .opcode_or_err()
                    .map_err(|e| field_err("BISnp opcode", e.invalid_bytes))?;
                Ok(Self::S2MBISnp(header))
            }
            MemMsgClass::S2MNdr => {
                let bytes: [u8; 8] = rest.get(..8).ok_or(need(10))?.try_into().unwrap();
                let header = S2MNdrHeader::from_bytes(bytes);
                header
                    .opcode_or_err()
                    .map_err(|e| field_err("NDR opcode", e.invalid_bytes))?;
                Ok(Self::S2MNdr(header))
            }
            MemMsgClass::S2MDrs => {
                let bytes: [u8; 8] = rest.get(..8).ok_or(need(10))?.try_into().unwrap();
                let header = S2MDrsHeader::from_bytes(bytes);
                header
                    .opcode_or_err()
                    .map_err(|e| field_err("DRS opcode", e.invalid_bytes))?;
                Ok(Self::S2MDrs(header, take_cacheline(&rest[8..])?))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Packet;
    use pretty_assertions::assert_eq;

    fn line(fill: u8) -> CacheLineData {
        [fill; 64]
    }

    fn round_trip(packet: CxlMemPacket) {
        let bytes = packet.encode();
        let advertised = usize::from(u16::from_le_bytes([bytes[2], bytes[3]]));
        assert_eq!(bytes.len(), advertised);
        assert_eq!(Packet::decode(&bytes).unwrap(), Packet::Mem(packet));
    }

    #[test]
    fn all_classes_round_trip() {
        round_trip(CxlMemPacket::mem_rd(0x1000, 0));
        round_trip(CxlMemPacket::m2s_req(
            MemOpcode::MemInv,
            MetaField::Meta0State,
            MetaValue::Any,
            SnpType::SnpInv,
            0x2040,
            3,
        ));
        round_trip(CxlMemPacket::mem_wr(0x1000, line(0xAB), 1));
        round_trip(CxlMemPacket::birsp(BIRspOpcode::BIRspI, 5, 9));
        round_trip(CxlMemPacket::bisnp(BISnpOpcode::BISnpInv, 0x3000, 2, 7));
        round_trip(CxlMemPacket::ndr(
            NdrOpcode::CmpS,
            MetaField::Meta0State,
            MetaValue::Shared,
            0,
        ));
        round_trip(CxlMemPacket::drs(line(0x5A), 2));
    }

    #[test]
    fn address_is_cacheline_aligned() {
        let packet = CxlMemPacket::mem_rd(0x0000_0001_0000_1040, 0);
        assert_eq!(packet.address(), Some(0x0000_0001_0000_1040));
    }

    #[test]
    fn data_classes_demand_64_bytes() {
        let mut bytes = CxlMemPacket::drs(line(0), 0).encode();
        bytes.truncate(bytes.len() - 1);
        let len = bytes.len() as u16;
        bytes[2..4].copy_from_slice(&len.to_le_bytes());
        assert_eq!(
            Packet::decode(&bytes),
            Err(DecodeError::BadDataLength {
                expected: 64,
                got: 63
            })
        );
    }

    #[test]
    fn rejects_unknown_class() {
        let bytes = [0x02, 0x00, 0x06, 0x00, 0x0f, 0x00];
        assert!(matches!(
            Packet::decode(&bytes),
            Err(DecodeError::UnknownMsgClass { layer: "CXL.mem", .. })
        ));
    }
}
