/*!
CXL.cache transaction packets.

Symmetric split of six message classes: D2H Req/Rsp/Data from the device
and H2D Req/Rsp/Data from the host. The channels are unordered; a request
carries a queue id (`cqid` device side, `uqid` host side) that the
responses and data messages echo so the peer can pair them.

Opcode and cache-state encodings follow the CXL 3.0 CXL.cache tables.
*/

use modular_bitfield::prelude::*;

use super::{
    encode_prelude, take_cacheline, CacheLineData, DecodeError, PayloadType, SYSTEM_HEADER_SIZE,
};

#[derive(BitfieldSpecifier, Debug, Clone, Copy, PartialEq, Eq)]
#[bits = 4]
pub enum CacheMsgClass {
    D2HReq = 1,
    D2HRsp = 2,
    D2HData = 3,
    H2DReq = 4,
    H2DRsp = 5,
    H2DData = 6,
}

#[bitfield(bits = 16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CxlCacheHeader {
    pub msg_class: CacheMsgClass,
    #[skip]
    __: B12,
}

#[derive(BitfieldSpecifier, Debug, Clone, Copy, PartialEq, Eq)]
#[bits = 5]
pub enum D2HReqOpcode {
    RdCurr = 0b00001,
    RdOwn = 0b00010,
    RdShared = 0b00011,
    RdAny = 0b00100,
    RdOwnNoData = 0b00101,
    ItoMWr = 0b00110,
    WrCur = 0b00111,
    ClFlush = 0b01000,
    CleanEvict = 0b01001,
    DirtyEvict = 0b01010,
    CleanEvictNoData = 0b01011,
}

#[derive(BitfieldSpecifier, Debug, Clone, Copy, PartialEq, Eq)]
#[bits = 5]
pub enum D2HRspOpcode {
    RspSHitSE = 0b00001,
    RspIHitI = 0b00100,
    RspIHitSE = 0b00101,
    RspVHitV = 0b00110,
    RspSFwdM = 0b00111,
    RspIFwdM = 0b01111,
    RspVFwdV = 0b10110,
}

#[derive(BitfieldSpecifier, Debug, Clone, Copy, PartialEq, Eq)]
#[bits = 3]
pub enum H2DReqOpcode {
    SnpData = 0b001,
    SnpInv = 0b010,
    SnpCur = 0b011,
}

#[derive(BitfieldSpecifier, Debug, Clone, Copy, PartialEq, Eq)]
#[bits = 4]
pub enum H2DRspOpcode {
    WritePull = 0b0001,
    Go = 0b0100,
    GoWritePull = 0b0101,
    ExtCmp = 0b0110,
    GoWritePullDrop = 0b1000,
}

/// Cache state communicated in the `rsp_data` field of a GO response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum H2DRspCacheState {
    Invalid = 0b011,
    Shared = 0b001,
    Exclusive = 0b010,
    Modified = 0b110,
    Valid = 0b100,
}

#[bitfield(bits = 96)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct D2HReqHeader {
    pub valid: bool,
    pub cache_opcode: D2HReqOpcode,
    pub cqid: B12,
    pub nt: bool,
    pub cache_id: B4,
    pub addr: B46,
    #[skip]
    __: B27,
}

#[bitfield(bits = 24)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct D2HRspHeader {
    pub valid: bool,
    pub cache_opcode: D2HRspOpcode,
    pub uqid: B12,
    #[skip]
    __: B6,
}

#[bitfield(bits = 24)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct D2HDataHeader {
    pub valid: bool,
    pub uqid: B12,
    pub bogus: bool,
    pub poison: bool,
    pub bep: bool,
    #[skip]
    __: B8,
}

#[bitfield(bits = 72)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct H2DReqHeader {
    pub valid: bool,
    pub cache_opcode: H2DReqOpcode,
    pub addr: B46,
    pub uqid: B12,
    pub cache_id: B4,
    #[skip]
    __: B6,
}

#[bitfield(bits = 40)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct H2DRspHeader {
    pub valid: bool,
    pub cache_opcode: H2DRspOpcode,
    pub rsp_data: B12,
    pub rsp_pre: B2,
    pub cqid: B12,
    pub cache_id: B4,
    #[skip]
    __: B5,
}

#[bitfield(bits = 24)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct H2DDataHeader {
    pub valid: bool,
    pub cqid: B12,
    pub poison: bool,
    pub go_err: bool,
    pub cache_id: B4,
    #[skip]
    __: B5,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CxlCachePacket {
    D2HReq(D2HReqHeader),
    D2HRsp(D2HRspHeader),
    D2HData(D2HDataHeader, CacheLineData),
    H2DReq(H2DReqHeader),
    H2DRsp(H2DRspHeader),
    H2DData(H2DDataHeader, CacheLineData),
}

impl CxlCachePacket {
    pub fn d2h_req(opcode: D2HReqOpcode, addr: u64, cqid: u16, cache_id: u8) -> Self {
        Self::D2HReq(
            D2HReqHeader::new()
                .with_valid(true)
                .with_cache_opcode(opcode)
                .with_cqid(cqid)
                .with_cache_id(cache_id)
                .with_addr(addr >> 6),
        )
    }

    pub fn d2h_rsp(opcode: D2HRspOpcode, uqid: u16) -> Self {
        Self::D2HRsp(
            D2HRspHeader::new()
                .with_valid(true)
                .with_cache_opcode(opcode)
                .with_uqid(uqid),
        )
    }

    pub fn d2h_data(uqid: u16, data: CacheLineData) -> Self {
        Self::D2HData(D2HDataHeader::new().with_valid(true).with_uqid(uqid), data)
    }

    pub fn h2d_req(opcode: H2DReqOpcode, addr: u64, uqid: u16, cache_id: u8) -> Self {
        Self::H2DReq(
            H2DReqHeader::new()
                .with_valid(true)
                .with_cache_opcode(opcode)
                .with_addr(addr >> 6)
                .with_uqid(uqid)
                .with_cache_id(cache_id),
        )
    }

    pub fn h2d_rsp(opcode: H2DRspOpcode, state: H2DRspCacheState, cqid: u16, cache_id: u8) -> Self {
        Self::H2DRsp(
            H2DRspHeader::new()
                .with_valid(true)
                .with_cache_opcode(opcode)
                .with_rsp_data(state as u16)
                .with_cqid(cqid)
                .with_cache_id(cache_id),
        )
    }

    pub fn h2d_data(cqid: u16, data: CacheLineData, cache_id: u8) -> Self {
        Self::H2DData(
            H2DDataHeader::new()
                .with_valid(true)
                .with_cqid(cqid)
                .with_cache_id(cache_id),
            data,
        )
    }

    pub fn msg_class(&self) -> CacheMsgClass {
        match self {
            Self::D2HReq(_) => CacheMsgClass::D2HReq,
            Self::D2HRsp(_) => CacheMsgClass::D2HRsp,
            Self::D2HData(..) => CacheMsgClass::D2HData,
            Self::H2DReq(_) => CacheMsgClass::H2DReq,
            Self::H2DRsp(_) => CacheMsgClass::H2DRsp,
            Self::H2DData(..) => CacheMsgClass::H2DData,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let (header_bytes, data): (Vec<u8>, Option<&CacheLineData>) = match self {
            Self::D2HReq(h) => (h.into_bytes().to_vec(), None),
            Self::D2HRsp(h) => (h.into_bytes().to_vec(), None),
            Self::D2HData(h, d) => (h.into_bytes().to_vec(), Some(d)),
            Self::H2DReq(h) => (h.into_bytes().to_vec(), None),
            Self::H2DRsp(h) => (h.into_bytes().to_vec(), None),
            Self::H2DData(h, d) => (h.into_bytes().to_vec(), Some(d)),
        };
        let total = SYSTEM_HEADER_SIZE + 2 + header_bytes.len() + data.map_or(0, |d| d.len());
        let mut out = encode_prelude(PayloadType::CxlCache, total);
        out.extend_from_slice(
            &CxlCacheHeader::new()
                .with_msg_class(self.msg_class())
                .into_bytes(),
        );
        out.extend_from_slice(&header_bytes);
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
        let msg_class = CxlCacheHeader::from_bytes(class_bytes)
            .msg_class_or_err()
            .map_err(|e| DecodeError::UnknownMsgClass {
                layer: "CXL.cache",
                value: e.invalid_bytes.into(),
            })?;
        let rest = &body[2..];
        let field_err = |field: &'static str, value: u8| DecodeError::UnknownField { field, value };
        match msg_class {
            CacheMsgClass::D2HReq => {
                let bytes: [u8; 12] = rest.get(..12).ok_or(need(14))?.try_into().unwrap();
                let header = D2HReqHeader::from_bytes(bytes);
                header
                    .cache_opcode_or_err()
                    .map_err(|e| field_err("D2H Req opcode", e.invalid_bytes))?;
                Ok(Self::D2HReq(header))
            }
            CacheMsgClass::D2HRsp => {
                let bytes: [u8; 3] = rest.get(..3).ok_or(need(5))?.try_into().unwrap();
                let header = D2HRspHeader::from_bytes(bytes);
                header
                    .cache_opcode_or_err()
                    .map_err(|e| field_err("D2H Rsp opcode", e.invalid_bytes))?;
                Ok(Self::D2HRsp(header))
            }
            CacheMsgClass::D2HData => {
                let bytes: [u8; 3] = rest.get(..3).ok_or(need(5))?.try_into().unwrap();
                Ok(Self::D2HData(
                    D2HDataHeader::from_bytes(bytes),
                    take_cacheline(&rest[3..])?,
                ))
            }
            CacheMsgClass::H2DReq => {
                let bytes: [u8; 9] = rest.get(..9).ok_or(need(11))?.try_into().unwrap();
                let header = H2DReqHeader::from_bytes(bytes);
                header
                    .cache_opcode_or_err()
                    .map_err(|e| field_err("H2D Req opcode", e.invalid_bytes))?;
                Ok(Self::H2DReq(header))
            }
            CacheMsgClass::H2DRsp => {
                let bytes: [u8; 5] = rest.get(..5).ok_or(need(7))?.try_into().unwrap();
                let header = H2DRspHeader::from_bytes(bytes);
                header
                    .cache_opcode_or_err()
                    .map_err(|e| field_err("H2D Rsp opcode", e.invalid_bytes))?;
                Ok(Self::H2DRsp(header))
            }
            CacheMsgClass::H2DData => {
                let bytes: [u8; 3] = rest.get(..3).ok_or(need(5))?.try_into().unwrap();
                Ok(Self::H2DData(
                    H2DDataHeader::from_bytes(bytes),
                    take_cacheline(&rest[3..])?,
                ))
            }
        }
    }
}
