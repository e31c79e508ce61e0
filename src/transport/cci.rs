/*!
Component Command Interface messages.

CCI carries the fabric-manager API in-band: a 12-byte message header
(category, 1-byte tag for request/response pairing, 16-bit command
opcode, 21-bit payload length, return code) followed by the command
payload. The payload is the one dynamic field and always comes last;
its length is delimited by the header and, on the wire, by the packet's
`payload_length`.

The command set is closed. Each command has a fixed request payload
struct and a fixed response payload struct, byte-matched against the
layouts below.
*/

use modular_bitfield::prelude::*;
use snafu::Snafu;

use super::{encode_prelude, DecodeError, PayloadType, SYSTEM_HEADER_SIZE};

/// Fabric-manager API command opcodes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum CciOpcode {
    BackgroundOperationStatus = 0x0002,
    IdentifySwitchDevice = 0x5100,
    GetPhysicalPortState = 0x5101,
    GetVirtualCxlSwitchInfo = 0x5200,
    BindVppb = 0x5201,
    UnbindVppb = 0x5202,
    FreezeVppb = 0x5203,
    UnfreezeVppb = 0x5204,
    TunnelManagementCommand = 0x5300,
    GetLdInfo = 0x5400,
    GetLdAllocations = 0x5401,
    SetLdAllocations = 0x5402,
    GetConnectedDevices = 0xC000,
}

impl CciOpcode {
    pub fn from_u16(value: u16) -> Option<Self> {
        Some(match value {
            0x0002 => Self::BackgroundOperationStatus,
            0x5100 => Self::IdentifySwitchDevice,
            0x5101 => Self::GetPhysicalPortState,
            0x5200 => Self::GetVirtualCxlSwitchInfo,
            0x5201 => Self::BindVppb,
            0x5202 => Self::UnbindVppb,
            0x5203 => Self::FreezeVppb,
            0x5204 => Self::UnfreezeVppb,
            0x5300 => Self::TunnelManagementCommand,
            0x5400 => Self::GetLdInfo,
            0x5401 => Self::GetLdAllocations,
            0x5402 => Self::SetLdAllocations,
            0xC000 => Self::GetConnectedDevices,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum CciReturnCode {
    Success = 0x0000,
    BackgroundCommandStarted = 0x0001,
    InvalidInput = 0x0002,
    Unsupported = 0x0003,
    InternalError = 0x0004,
    RetryRequired = 0x0005,
    Busy = 0x0006,
    InvalidPort = 0x0013,
}

impl CciReturnCode {
    pub fn from_u16(value: u16) -> Option<Self> {
        Some(match value {
            0x0000 => Self::Success,
            0x0001 => Self::BackgroundCommandStarted,
            0x0002 => Self::InvalidInput,
            0x0003 => Self::Unsupported,
            0x0004 => Self::InternalError,
            0x0005 => Self::RetryRequired,
            0x0006 => Self::Busy,
            0x0013 => Self::InvalidPort,
            _ => return None,
        })
    }
}

#[derive(BitfieldSpecifier, Debug, Clone, Copy, PartialEq, Eq)]
#[bits = 4]
pub enum CciCategory {
    Request = 0,
    Response = 1,
}

#[bitfield(bits = 96)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CciMessageHeader {
    pub message_category: CciCategory,
    #[skip]
    __: B4,
    pub message_tag: B8,
    #[skip]
    __: B8,
    pub command_opcode: B16,
    pub payload_length: B21,
    #[skip]
    __: B2,
    pub background_operation: bool,
    pub return_code: B16,
    pub vendor_specific_status: B16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CciMessage {
    pub header: CciMessageHeader,
    pub payload: Vec<u8>,
}

impl CciMessage {
    pub fn request(tag: u8, opcode: CciOpcode, payload: Vec<u8>) -> Self {
        Self {
            header: CciMessageHeader::new()
                .with_message_category(CciCategory::Request)
                .with_message_tag(tag)
                .with_command_opcode(opcode as u16)
                .with_payload_length(payload.len() as u32),
            payload,
        }
    }

    pub fn response(tag: u8, opcode: CciOpcode, code: CciReturnCode, payload: Vec<u8>) -> Self {
        Self {
            header: CciMessageHeader::new()
                .with_message_category(CciCategory::Response)
                .with_message_tag(tag)
                .with_command_opcode(opcode as u16)
                .with_payload_length(payload.len() as u32)
                .with_return_code(code as u16),
            payload,
        }
    }

    /// Response announcing a background operation was kicked off
    pub fn background_started(tag: u8, opcode: CciOpcode) -> Self {
        let mut message = Self::response(
            tag,
            opcode,
            CciReturnCode::BackgroundCommandStarted,
            Vec::new(),
        );
        message.header.set_background_operation(true);
        message
    }

    pub fn opcode(&self) -> Option<CciOpcode> {
        CciOpcode::from_u16(self.header.command_opcode())
    }

    pub fn return_code(&self) -> Option<CciReturnCode> {
        CciReturnCode::from_u16(self.header.return_code())
    }

    pub fn is_request(&self) -> bool {
        self.header.message_category() == CciCategory::Request
    }

    pub fn encode(&self) -> Vec<u8> {
        let total = SYSTEM_HEADER_SIZE + 12 + self.payload.len();
        let mut out = encode_prelude(PayloadType::Cci, total);
        out.extend_from_slice(&self.header.into_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    pub(super) fn decode_body(body: &[u8]) -> Result<Self, DecodeError> {
        let header_bytes: [u8; 12] = body
            .get(..12)
            .ok_or(DecodeError::Truncated {
                need: SYSTEM_HEADER_SIZE + 12,
                got: SYSTEM_HEADER_SIZE + body.len(),
            })?
            .try_into()
            .unwrap();
        let header = CciMessageHeader::from_bytes(header_bytes);
        header
            .message_category_or_err()
            .map_err(|e| DecodeError::UnknownField {
                field: "CCI message category",
                value: e.invalid_bytes,
            })?;
        let payload = body[12..].to_vec();
        if payload.len() != header.payload_length() as usize {
            return Err(DecodeError::BadDataLength {
                expected: header.payload_length() as usize,
                got: payload.len(),
            });
        }
        Ok(Self { header, payload })
    }
}

/// Fixed-payload parse failures surfaced to the fabric manager as
/// `InvalidInput`
#[derive(Snafu, Debug, Clone, PartialEq, Eq)]
pub enum CciPayloadError {
    #[snafu(display("payload needs {need} bytes, got {got}"))]
    Short { need: usize, got: usize },
    #[snafu(display("list header announces {announced} entries, payload holds {got}"))]
    ListLength { announced: usize, got: usize },
}

fn le_u16(bytes: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([bytes[at], bytes[at + 1]])
}

fn le_u64(bytes: &[u8], at: usize) -> u64 {
    u64::from_le_bytes(bytes[at..at + 8].try_into().unwrap())
}

fn want(bytes: &[u8], need: usize) -> Result<(), CciPayloadError> {
    if bytes.len() < need {
        return Err(CciPayloadError::Short {
            need,
            got: bytes.len(),
        });
    }
    Ok(())
}

/// Identify Switch Device (5100h) response, 73 bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentifySwitchDevice {
    pub ingress_port_id: u8,
    pub num_physical_ports: u8,
    pub num_vcss: u8,
    pub active_port_bitmask: [u8; 32],
    pub active_vcs_bitmask: [u8; 32],
    pub total_vppbs: u16,
    pub bound_vppbs: u16,
    pub num_hdm_decoders_per_usp: u8,
}

impl IdentifySwitchDevice {
    pub const SIZE: usize = 73;

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::SIZE);
        out.push(self.ingress_port_id);
        out.push(0);
        out.push(self.num_physical_ports);
        out.push(self.num_vcss);
        out.extend_from_slice(&self.active_port_bitmask);
        out.extend_from_slice(&self.active_vcs_bitmask);
        out.extend_from_slice(&self.total_vppbs.to_le_bytes());
        out.extend_from_slice(&self.bound_vppbs.to_le_bytes());
        out.push(self.num_hdm_decoders_per_usp);
        out
    }
}

impl TryFrom<&[u8]> for IdentifySwitchDevice {
    type Error = CciPayloadError;
    fn try_from(bytes: &[u8]) -> Result<Self, CciPayloadError> {
        want(bytes, Self::SIZE)?;
        Ok(Self {
            ingress_port_id: bytes[0],
            num_physical_ports: bytes[2],
            num_vcss: bytes[3],
            active_port_bitmask: bytes[4..36].try_into().unwrap(),
            active_vcs_bitmask: bytes[36..68].try_into().unwrap(),
            total_vppbs: le_u16(bytes, 68),
            bound_vppbs: le_u16(bytes, 70),
            num_hdm_decoders_per_usp: bytes[72],
        })
    }
}

/// Get Physical Port State (5101h) request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetPhysicalPortStateRequest {
    pub port_id_list: Vec<u8>,
}

impl GetPhysicalPortStateRequest {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = vec![self.port_id_list.len() as u8];
        out.extend_from_slice(&self.port_id_list);
        out
    }
}

impl TryFrom<&[u8]> for GetPhysicalPortStateRequest {
    type Error = CciPayloadError;
    fn try_from(bytes: &[u8]) -> Result<Self, CciPayloadError> {
        want(bytes, 1)?;
        let count = usize::from(bytes[0]);
        let list = bytes.get(1..1 + count).ok_or(CciPayloadError::ListLength {
            announced: count,
            got: bytes.len() - 1,
        })?;
        Ok(Self {
            port_id_list: list.to_vec(),
        })
    }
}

/// Per-port block of the Get Physical Port State response, 16 bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhysicalPortState {
    pub port_id: u8,
    /// 0 = disabled, 1 = bind in progress, 2 = unbind in progress, 3 = DSP,
    /// 4 = USP, 5 = fabric port, 0xF = invalid
    pub config_state: u8,
    pub connected_device_cxl_version: u8,
    pub connected_device_type: u8,
    pub port_cxl_version_bitmask: u8,
    pub max_link_width: u8,
    pub negotiated_link_width: u8,
    pub supported_link_speeds_vector: u8,
    pub max_link_speed: u8,
    pub current_link_speed: u8,
    pub ltssm_state: u8,
    pub first_lane_num: u8,
    pub link_state_flags: u16,
    pub supported_ld_count: u8,
}

impl PhysicalPortState {
    pub const SIZE: usize = 16;

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[0] = self.port_id;
        out[1] = self.config_state;
        out[2] = self.connected_device_cxl_version;
        out[4] = self.connected_device_type;
        out[5] = self.port_cxl_version_bitmask;
        out[6] = self.max_link_width;
        out[7] = self.negotiated_link_width;
        out[8] = self.supported_link_speeds_vector;
        out[9] = self.max_link_speed;
        out[10] = self.current_link_speed;
        out[11] = self.ltssm_state;
        out[12] = self.first_lane_num;
        out[13..15].copy_from_slice(&self.link_state_flags.to_le_bytes());
        out[15] = self.supported_ld_count;
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CciPayloadError> {
        want(bytes, Self::SIZE)?;
        Ok(Self {
            port_id: bytes[0],
            config_state: bytes[1],
            connected_device_cxl_version: bytes[2],
            connected_device_type: bytes[4],
            port_cxl_version_bitmask: bytes[5],
            max_link_width: bytes[6],
            negotiated_link_width: bytes[7],
            supported_link_speeds_vector: bytes[8],
            max_link_speed: bytes[9],
            current_link_speed: bytes[10],
            ltssm_state: bytes[11],
            first_lane_num: bytes[12],
            link_state_flags: le_u16(bytes, 13),
            supported_ld_count: bytes[15],
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetPhysicalPortStateResponse {
    pub ports: Vec<PhysicalPortState>,
}

impl GetPhysicalPortStateResponse {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = vec![self.ports.len() as u8, 0, 0, 0];
        for port in &self.ports {
            out.extend_from_slice(&port.to_bytes());
        }
        out
    }
}

impl TryFrom<&[u8]> for GetPhysicalPortStateResponse {
    type Error = CciPayloadError;
    fn try_from(bytes: &[u8]) -> Result<Self, CciPayloadError> {
        want(bytes, 4)?;
        let count = usize::from(bytes[0]);
        want(bytes, 4 + count * PhysicalPortState::SIZE)?;
        let ports = (0..count)
            .map(|i| PhysicalPortState::from_bytes(&bytes[4 + i * PhysicalPortState::SIZE..]))
            .collect::<Result<_, _>>()?;
        Ok(Self { ports })
    }
}

/// Get Virtual CXL Switch Info (5200h) request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetVcsInfoRequest {
    pub start_vppb: u8,
    pub vppb_list_limit: u8,
    pub vcs_id_list: Vec<u8>,
}

impl GetVcsInfoRequest {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = vec![
            self.start_vppb,
            self.vppb_list_limit,
            self.vcs_id_list.len() as u8,
        ];
        out.extend_from_slice(&self.vcs_id_list);
        out
    }
}

impl TryFrom<&[u8]> for GetVcsInfoRequest {
    type Error = CciPayloadError;
    fn try_from(bytes: &[u8]) -> Result<Self, CciPayloadError> {
        want(bytes, 3)?;
        let count = usize::from(bytes[2]);
        let list = bytes.get(3..3 + count).ok_or(CciPayloadError::ListLength {
            announced: count,
            got: bytes.len() - 3,
        })?;
        Ok(Self {
            start_vppb: bytes[0],
            vppb_list_limit: bytes[1],
            vcs_id_list: list.to_vec(),
        })
    }
}

/// Binding state of one vPPB inside a VCS info block, 4 bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VppbStatus {
    /// 0 = unbound, 1 = bind/unbind in progress, 2 = bound physical port,
    /// 3 = bound LD
    pub binding_status: u8,
    pub bound_port_id: u8,
    pub bound_ld_id: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VcsInfoBlock {
    pub vcs_id: u8,
    pub vcs_state: u8,
    pub usp_id: u8,
    pub vppbs: Vec<VppbStatus>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetVcsInfoResponse {
    pub blocks: Vec<VcsInfoBlock>,
}

impl GetVcsInfoResponse {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = vec![self.blocks.len() as u8, 0, 0, 0];
        for block in &self.blocks {
            out.push(block.vcs_id);
            out.push(block.vcs_state);
            out.push(block.usp_id);
            out.push(block.vppbs.len() as u8);
            for vppb in &block.vppbs {
                out.push(vppb.binding_status);
                out.push(vppb.bound_port_id);
                out.push(vppb.bound_ld_id);
                out.push(0);
            }
        }
        out
    }
}

impl TryFrom<&[u8]> for GetVcsInfoResponse {
    type Error = CciPayloadError;
    fn try_from(bytes: &[u8]) -> Result<Self, CciPayloadError> {
        want(bytes, 4)?;
        let mut blocks = Vec::new();
        let mut at = 4;
        for _ in 0..bytes[0] {
            want(bytes, at + 4)?;
            let vppb_count = usize::from(bytes[at + 3]);
            let mut block = VcsInfoBlock {
                vcs_id: bytes[at],
                vcs_state: bytes[at + 1],
                usp_id: bytes[at + 2],
                vppbs: Vec::with_capacity(vppb_count),
            };
            at += 4;
            want(bytes, at + vppb_count * 4)?;
            for _ in 0..vppb_count {
                block.vppbs.push(VppbStatus {
                    binding_status: bytes[at],
                    bound_port_id: bytes[at + 1],
                    bound_ld_id: bytes[at + 2],
                });
                at += 4;
            }
            blocks.push(block);
        }
        Ok(Self { blocks })
    }
}

/// Bind vPPB (5201h) request, 6 bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BindVppbRequest {
    pub vcs_id: u8,
    pub vppb_id: u8,
    pub port_id: u8,
    pub ld_id: u16,
}

impl BindVppbRequest {
    pub const SIZE: usize = 6;

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let ld = self.ld_id.to_le_bytes();
        [self.vcs_id, self.vppb_id, self.port_id, ld[0], ld[1], 0]
    }
}

impl TryFrom<&[u8]> for BindVppbRequest {
    type Error = CciPayloadError;
    fn try_from(bytes: &[u8]) -> Result<Self, CciPayloadError> {
        want(bytes, Self::SIZE)?;
        Ok(Self {
            vcs_id: bytes[0],
            vppb_id: bytes[1],
            port_id: bytes[2],
            ld_id: le_u16(bytes, 3),
        })
    }
}

/// Unbind / Freeze / Unfreeze vPPB (5202h-5204h) request, 4 bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VppbRequest {
    pub vcs_id: u8,
    pub vppb_id: u8,
}

impl VppbRequest {
    pub const SIZE: usize = 4;

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        [self.vcs_id, self.vppb_id, 0, 0]
    }
}

impl TryFrom<&[u8]> for VppbRequest {
    type Error = CciPayloadError;
    fn try_from(bytes: &[u8]) -> Result<Self, CciPayloadError> {
        want(bytes, Self::SIZE)?;
        Ok(Self {
            vcs_id: bytes[0],
            vppb_id: bytes[1],
        })
    }
}

/// Tunnel Management Command (5300h) request: an embedded CCI message
/// forwarded to the MLD behind `port_id`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelRequest {
    pub port_id: u8,
    /// 0 = port-based tunnel target
    pub target_type: u8,
    pub command: Vec<u8>,
}

impl TunnelRequest {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = vec![self.port_id, self.target_type, 0, 0];
        out.extend_from_slice(&(self.command.len() as u16).to_le_bytes());
        out.extend_from_slice(&[0, 0]);
        out.extend_from_slice(&self.command);
        out
    }
}

impl TryFrom<&[u8]> for TunnelRequest {
    type Error = CciPayloadError;
    fn try_from(bytes: &[u8]) -> Result<Self, CciPayloadError> {
        want(bytes, 8)?;
        let size = usize::from(le_u16(bytes, 4));
        let command = bytes.get(8..8 + size).ok_or(CciPayloadError::ListLength {
            announced: size,
            got: bytes.len() - 8,
        })?;
        Ok(Self {
            port_id: bytes[0],
            target_type: bytes[1],
            command: command.to_vec(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelResponse {
    pub payload: Vec<u8>,
}

impl TunnelResponse {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + self.payload.len());
        out.extend_from_slice(&(self.payload.len() as u16).to_le_bytes());
        out.extend_from_slice(&[0, 0]);
        out.extend_from_slice(&self.payload);
        out
    }
}

impl TryFrom<&[u8]> for TunnelResponse {
    type Error = CciPayloadError;
    fn try_from(bytes: &[u8]) -> Result<Self, CciPayloadError> {
        want(bytes, 4)?;
        let size = usize::from(le_u16(bytes, 0));
        let payload = bytes.get(4..4 + size).ok_or(CciPayloadError::ListLength {
            announced: size,
            got: bytes.len() - 4,
        })?;
        Ok(Self {
            payload: payload.to_vec(),
        })
    }
}

/// Get LD Info (5400h) response, 11 bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GetLdInfoResponse {
    pub memory_size: u64,
    pub ld_count: u16,
    pub qos_telemetry_capability: u8,
}

impl GetLdInfoResponse {
    pub const SIZE: usize = 11;

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::SIZE);
        out.extend_from_slice(&self.memory_size.to_le_bytes());
        out.extend_from_slice(&self.ld_count.to_le_bytes());
        out.push(self.qos_telemetry_capability);
        out
    }
}

impl TryFrom<&[u8]> for GetLdInfoResponse {
    type Error = CciPayloadError;
    fn try_from(bytes: &[u8]) -> Result<Self, CciPayloadError> {
        want(bytes, Self::SIZE)?;
        Ok(Self {
            memory_size: le_u64(bytes, 0),
            ld_count: le_u16(bytes, 8),
            qos_telemetry_capability: bytes[10],
        })
    }
}

/// Get LD Allocations (5401h) request, 4 bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GetLdAllocationsRequest {
    pub start_ld_id: u8,
    pub ld_allocation_list_limit: u8,
}

impl GetLdAllocationsRequest {
    pub const SIZE: usize = 4;

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        [self.start_ld_id, self.ld_allocation_list_limit, 0, 0]
    }
}

impl TryFrom<&[u8]> for GetLdAllocationsRequest {
    type Error = CciPayloadError;
    fn try_from(bytes: &[u8]) -> Result<Self, CciPayloadError> {
        want(bytes, Self::SIZE)?;
        Ok(Self {
            start_ld_id: bytes[0],
            ld_allocation_list_limit: bytes[1],
        })
    }
}

/// Allocated memory of one LD in multiples of the granularity, two ranges
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LdAllocation {
    pub range1_multiplier: u64,
    pub range2_multiplier: u64,
}

/// Get/Set LD Allocations (5401h/5402h) list payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LdAllocationList {
    pub number_of_lds: u8,
    /// 0 = 256 MiB granularity
    pub memory_granularity: u8,
    pub start_ld_id: u8,
    pub allocations: Vec<LdAllocation>,
}

impl LdAllocationList {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = vec![
            self.number_of_lds,
            self.memory_granularity,
            self.start_ld_id,
            self.allocations.len() as u8,
        ];
        for allocation in &self.allocations {
            out.extend_from_slice(&allocation.range1_multiplier.to_le_bytes());
            out.extend_from_slice(&allocation.range2_multiplier.to_le_bytes());
        }
        out
    }
}

impl TryFrom<&[u8]> for LdAllocationList {
    type Error = CciPayloadError;
    fn try_from(bytes: &[u8]) -> Result<Self, CciPayloadError> {
        want(bytes, 4)?;
        let count = usize::from(bytes[3]);
        want(bytes, 4 + count * 16)?;
        let allocations = (0..count)
            .map(|i| LdAllocation {
                range1_multiplier: le_u64(bytes, 4 + i * 16),
                range2_multiplier: le_u64(bytes, 12 + i * 16),
            })
            .collect();
        Ok(Self {
            number_of_lds: bytes[0],
            memory_granularity: bytes[1],
            start_ld_id: bytes[2],
            allocations,
        })
    }
}

/// Get Connected Devices (C000h, vendor specific) response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetConnectedDevicesResponse {
    pub connected_ports: Vec<u8>,
}

impl GetConnectedDevicesResponse {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = vec![self.connected_ports.len() as u8];
        out.extend_from_slice(&self.connected_ports);
        out
    }
}

impl TryFrom<&[u8]> for GetConnectedDevicesResponse {
    type Error = CciPayloadError;
    fn try_from(bytes: &[u8]) -> Result<Self, CciPayloadError> {
        want(bytes, 1)?;
        let count = usize::from(bytes[0]);
        let list = bytes.get(1..1 + count).ok_or(CciPayloadError::ListLength {
            announced: count,
            got: bytes.len() - 1,
        })?;
        Ok(Self {
            connected_ports: list.to_vec(),
        })
    }
}

/// Background Operation Status (0002h) response, 8 bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackgroundOperationStatus {
    pub operation_in_progress: bool,
    pub percentage_complete: u8,
    pub opcode: u16,
    pub return_code: u16,
    pub vendor_specific_status: u16,
}

impl BackgroundOperationStatus {
    pub const SIZE: usize = 8;

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[0] = u8::from(self.operation_in_progress) | (self.percentage_complete << 1);
        out[2..4].copy_from_slice(&self.opcode.to_le_bytes());
        out[4..6].copy_from_slice(&self.return_code.to_le_bytes());
        out[6..8].copy_from_slice(&self.vendor_specific_status.to_le_bytes());
        out
    }
}

impl TryFrom<&[u8]> for BackgroundOperationStatus {
    type Error = CciPayloadError;
    fn try_from(bytes: &[u8]) -> Result<Self, CciPayloadError> {
        want(bytes, Self::SIZE)?;
        Ok(Self {
            operation_in_progress: bytes[0] & 1 != 0,
            percentage_complete: bytes[0] >> 1,
            opcode: le_u16(bytes, 2),
            return_code: le_u16(bytes, 4),
            vendor_specific_status: le_u16(bytes, 6),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Packet;
    use pretty_assertions::assert_eq;

    #[test]
    fn message_round_trip() {
        let request = CciMessage::request(
            7,
            CciOpcode::BindVppb,
            BindVppbRequest {
                vcs_id: 0,
                vppb_id: 1,
                port_id: 2,
                ld_id: 0,
            }
            .to_bytes()
            .to_vec(),
        );
        let bytes = request.encode();
        assert_eq!(bytes.len(), 4 + 12 + 6);
        assert_eq!(Packet::decode(&bytes).unwrap(), Packet::Cci(request));
    }

    #[test]
    fn payload_length_is_delimiting() {
        let mut bytes = CciMessage::request(0, CciOpcode::IdentifySwitchDevice, vec![]).encode();
        // A stray byte after the advertised payload is malformed
        bytes.push(0xFF);
        let len = bytes.len() as u16;
        bytes[2..4].copy_from_slice(&len.to_le_bytes());
        assert!(Packet::decode(&bytes).is_err());
    }

    #[test]
    fn identify_switch_device_is_73_bytes() {
        let identity = IdentifySwitchDevice {
            ingress_port_id: 0,
            num_physical_ports: 4,
            num_vcss: 1,
            active_port_bitmask: {
                let mut mask = [0u8; 32];
                mask[0] = 0b1111;
                mask
            },
            active_vcs_bitmask: {
                let mut mask = [0u8; 32];
                mask[0] = 1;
                mask
            },
            total_vppbs: 3,
            bound_vppbs: 3,
            num_hdm_decoders_per_usp: 32,
        };
        let bytes = identity.to_bytes();
        assert_eq!(bytes.len(), IdentifySwitchDevice::SIZE);
        assert_eq!(IdentifySwitchDevice::try_from(&bytes[..]).unwrap(), identity);
    }

    #[test]
    fn vcs_info_round_trip() {
        let response = GetVcsInfoResponse {
            blocks: vec![VcsInfoBlock {
                vcs_id: 0,
                vcs_state: 1,
                usp_id: 0,
                vppbs: vec![
                    VppbStatus {
                        binding_status: 2,
                        bound_port_id: 1,
                        bound_ld_id: 0,
                    },
                    VppbStatus {
                        binding_status: 0,
                        bound_port_id: 0,
                        bound_ld_id: 0,
                    },
                ],
            }],
        };
        let bytes = response.to_bytes();
        assert_eq!(GetVcsInfoResponse::try_from(&bytes[..]).unwrap(), response);
    }

    #[test]
    fn ld_allocation_list_round_trip() {
        let list = LdAllocationList {
            number_of_lds: 2,
            memory_granularity: 0,
            start_ld_id: 0,
            allocations: vec![
                LdAllocation {
                    range1_multiplier: 1,
                    range2_multiplier: 0,
                },
                LdAllocation {
                    range1_multiplier: 1,
                    range2_multiplier: 0,
                },
            ],
        };
        let bytes = list.to_bytes();
        assert_eq!(LdAllocationList::try_from(&bytes[..]).unwrap(), list);
    }

    #[test]
    fn tunnel_wraps_a_whole_message() {
        let inner = CciMessage::request(3, CciOpcode::GetLdInfo, vec![]);
        let tunnel = TunnelRequest {
            port_id: 1,
            target_type: 0,
            command: inner.encode(),
        };
        let bytes = tunnel.to_bytes();
        let parsed = TunnelRequest::try_from(&bytes[..]).unwrap();
        assert_eq!(parsed, tunnel);
        assert_eq!(Packet::decode(&parsed.command).unwrap(), Packet::Cci(inner));
    }
}
