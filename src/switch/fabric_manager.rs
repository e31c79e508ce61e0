/*!
Fabric-manager CCI executor.

Resolves the closed fabric-manager command set against a virtual
switch: identify, physical port state, virtual switch info, vPPB
bind/unbind/freeze/unfreeze, tunneled commands toward the MLD behind a
downstream port, and the vendor connected-devices query. Bind and
unbind are architecturally background operations: the immediate
response is `BackgroundCommandStarted` and the result is collected via
Background Operation Status (0002h).

The transport that carries these messages is an external collaborator;
`handle_request` is the programmatic surface it adapts to.
*/

use std::sync::{Arc, Mutex as StdMutex};

use tokio::time::{timeout, Duration};
use tracing::{debug, warn};

use crate::switch::virtual_switch::{VirtualSwitch, USP_DECODER_COUNT};
use crate::switch::PortKind;
use crate::transport::cci::{
    BackgroundOperationStatus, BindVppbRequest, CciMessage, CciOpcode, CciReturnCode,
    GetConnectedDevicesResponse, GetPhysicalPortStateRequest, GetPhysicalPortStateResponse,
    GetVcsInfoRequest, GetVcsInfoResponse, IdentifySwitchDevice, PhysicalPortState, TunnelRequest,
    TunnelResponse, VcsInfoBlock, VppbRequest, VppbStatus,
};
use crate::transport::Packet;

/// How long a tunneled command may take before the switch gives up on
/// the device behind the port
const TUNNEL_TIMEOUT: Duration = Duration::from_secs(3);

pub struct FabricManager {
    switch: Arc<VirtualSwitch>,
    last_background: StdMutex<BackgroundOperationStatus>,
    tunnel_turn: tokio::sync::Mutex<()>,
}

impl FabricManager {
    pub fn new(switch: Arc<VirtualSwitch>) -> Self {
        Self {
            switch,
            last_background: StdMutex::new(BackgroundOperationStatus {
                operation_in_progress: false,
                percentage_complete: 100,
                opcode: 0,
                return_code: CciReturnCode::Success as u16,
                vendor_specific_status: 0,
            }),
            tunnel_turn: tokio::sync::Mutex::new(()),
        }
    }

    /// Executes one request and produces the paired response (same tag)
    pub async fn handle_request(&self, request: CciMessage) -> CciMessage {
        let tag = request.header.message_tag();
        let Some(opcode) = request.opcode() else {
            warn!(opcode = request.header.command_opcode(), "unknown CCI opcode");
            return CciMessage::response(
                tag,
                CciOpcode::BackgroundOperationStatus,
                CciReturnCode::Unsupported,
                Vec::new(),
            );
        };
        debug!(?opcode, tag, "CCI request");
        match opcode {
            CciOpcode::BackgroundOperationStatus => {
                let status = *self.last_background.lock().unwrap();
                CciMessage::response(
                    tag,
                    opcode,
                    CciReturnCode::Success,
                    status.to_bytes().to_vec(),
                )
            }
            CciOpcode::IdentifySwitchDevice => self.identify(tag),
            CciOpcode::GetPhysicalPortState => self.port_state(tag, &request.payload),
            CciOpcode::GetVirtualCxlSwitchInfo => self.vcs_info(tag, &request.payload),
            CciOpcode::BindVppb => self.bind(tag, &request.payload),
            CciOpcode::UnbindVppb => self.unbind(tag, &request.payload).await,
            CciOpcode::FreezeVppb => self.set_freeze(tag, &request.payload, true),
            CciOpcode::UnfreezeVppb => self.set_freeze(tag, &request.payload, false),
            CciOpcode::TunnelManagementCommand => self.tunnel(tag, &request.payload).await,
            CciOpcode::GetConnectedDevices => {
                let connected = (0..self.switch.port_count() as u8)
                    .filter(|&p| {
                        self.switch.port_kind(p) == Some(PortKind::Dsp)
                            && self.switch.is_port_connected(p)
                    })
                    .collect();
                CciMessage::response(
                    tag,
                    opcode,
                    CciReturnCode::Success,
                    GetConnectedDevicesResponse {
                        connected_ports: connected,
                    }
                    .to_bytes(),
                )
            }
            // LD commands address a device, not the switch; they arrive
            // here only when someone forgot to tunnel them
            CciOpcode::GetLdInfo | CciOpcode::GetLdAllocations | CciOpcode::SetLdAllocations => {
                CciMessage::response(tag, opcode, CciReturnCode::Unsupported, Vec::new())
            }
        }
    }

    fn identify(&self, tag: u8) -> CciMessage {
        let switch = &self.switch;
        let mut active_port_bitmask = [0u8; 32];
        for port in 0..switch.port_count().min(256) {
            if switch.is_port_connected(port as u8) {
                active_port_bitmask[port / 8] |= 1 << (port % 8);
            }
        }
        let mut active_vcs_bitmask = [0u8; 32];
        active_vcs_bitmask[0] = 1;
        let bound = (0..switch.vppb_count())
            .filter(|&i| {
                switch
                    .vppb_snapshot(i)
                    .is_some_and(|s| s.bound_port.is_some())
            })
            .count();
        let identity = IdentifySwitchDevice {
            ingress_port_id: 0,
            num_physical_ports: switch.port_count() as u8,
            num_vcss: 1,
            active_port_bitmask,
            active_vcs_bitmask,
            total_vppbs: switch.vppb_count() as u16,
            bound_vppbs: bound as u16,
            num_hdm_decoders_per_usp: USP_DECODER_COUNT as u8,
        };
        CciMessage::response(
            tag,
            CciOpcode::IdentifySwitchDevice,
            CciReturnCode::Success,
            identity.to_bytes(),
        )
    }

    fn port_state(&self, tag: u8, payload: &[u8]) -> CciMessage {
        let opcode = CciOpcode::GetPhysicalPortState;
        let Ok(request) = GetPhysicalPortStateRequest::try_from(payload) else {
            return CciMessage::response(tag, opcode, CciReturnCode::InvalidInput, Vec::new());
        };
        let mut ports = Vec::with_capacity(request.port_id_list.len());
        for port_id in request.port_id_list {
            let Some(kind) = self.switch.port_kind(port_id) else {
                return CciMessage::response(tag, opcode, CciReturnCode::InvalidPort, Vec::new());
            };
            let connected = self.switch.is_port_connected(port_id);
            ports.push(PhysicalPortState {
                port_id,
                config_state: match kind {
                    PortKind::Usp => 4,
                    PortKind::Dsp => 3,
                },
                connected_device_cxl_version: if connected { 2 } else { 0 },
                connected_device_type: match (kind, connected) {
                    (PortKind::Dsp, true) => 3,
                    _ => 0,
                },
                port_cxl_version_bitmask: 0b11,
                max_link_width: 16,
                negotiated_link_width: if connected { 16 } else { 0 },
                supported_link_speeds_vector: 0b1_1111,
                max_link_speed: 5,
                current_link_speed: if connected { 5 } else { 0 },
                ltssm_state: if connected { 4 } else { 0 },
                first_lane_num: 0,
                link_state_flags: u16::from(connected),
                supported_ld_count: 16,
            });
        }
        CciMessage::response(
            tag,
            opcode,
            CciReturnCode::Success,
            GetPhysicalPortStateResponse { ports }.to_bytes(),
        )
    }

    fn vcs_info(&self, tag: u8, payload: &[u8]) -> CciMessage {
        let opcode = CciOpcode::GetVirtualCxlSwitchInfo;
        let Ok(request) = GetVcsInfoRequest::try_from(payload) else {
            return CciMessage::response(tag, opcode, CciReturnCode::InvalidInput, Vec::new());
        };
        let mut blocks = Vec::new();
        for vcs_id in request.vcs_id_list {
            if vcs_id != self.switch.vcs_id() {
                return CciMessage::response(tag, opcode, CciReturnCode::InvalidInput, Vec::new());
            }
            let start = usize::from(request.start_vppb);
            let end = self
                .switch
                .vppb_count()
                .min(start + usize::from(request.vppb_list_limit));
            let vppbs = (start..end)
                .filter_map(|i| self.switch.vppb_snapshot(i))
                .map(|snapshot| VppbStatus {
                    binding_status: u8::from(snapshot.bound_port.is_some()) * 2,
                    bound_port_id: snapshot.bound_port.unwrap_or(0),
                    bound_ld_id: snapshot.ld_id,
                })
                .collect();
            blocks.push(VcsInfoBlock {
                vcs_id,
                vcs_state: 1,
                usp_id: self.switch.upstream_port_index(),
                vppbs,
            });
        }
        CciMessage::response(
            tag,
            opcode,
            CciReturnCode::Success,
            GetVcsInfoResponse { blocks }.to_bytes(),
        )
    }

    fn finish_background(&self, opcode: CciOpcode, return_code: CciReturnCode) {
        *self.last_background.lock().unwrap() = BackgroundOperationStatus {
            operation_in_progress: false,
            percentage_complete: 100,
            opcode: opcode as u16,
            return_code: return_code as u16,
            vendor_specific_status: 0,
        };
    }

    fn bind(&self, tag: u8, payload: &[u8]) -> CciMessage {
        let opcode = CciOpcode::BindVppb;
        let Ok(request) = BindVppbRequest::try_from(payload) else {
            return CciMessage::response(tag, opcode, CciReturnCode::InvalidInput, Vec::new());
        };
        let result = self.switch.bind_vppb(
            request.port_id,
            usize::from(request.vppb_id),
            request.ld_id as u8,
        );
        let return_code = match result {
            Ok(()) => CciReturnCode::Success,
            Err(error) => {
                warn!(%error, "bind rejected");
                CciReturnCode::InvalidInput
            }
        };
        self.finish_background(opcode, return_code);
        CciMessage::background_started(tag, opcode)
    }

    async fn unbind(&self, tag: u8, payload: &[u8]) -> CciMessage {
        let opcode = CciOpcode::UnbindVppb;
        let Ok(request) = VppbRequest::try_from(payload) else {
            return CciMessage::response(tag, opcode, CciReturnCode::InvalidInput, Vec::new());
        };
        let result = self.switch.unbind_vppb(usize::from(request.vppb_id)).await;
        let return_code = match result {
            Ok(()) => CciReturnCode::Success,
            Err(error) => {
                warn!(%error, "unbind rejected");
                CciReturnCode::InvalidInput
            }
        };
        self.finish_background(opcode, return_code);
        CciMessage::background_started(tag, opcode)
    }

    fn set_freeze(&self, tag: u8, payload: &[u8], frozen: bool) -> CciMessage {
        let opcode = if frozen {
            CciOpcode::FreezeVppb
        } else {
            CciOpcode::UnfreezeVppb
        };
        let Ok(request) = VppbRequest::try_from(payload) else {
            return CciMessage::response(tag, opcode, CciReturnCode::InvalidInput, Vec::new());
        };
        let result = if frozen {
            self.switch.freeze_vppb(usize::from(request.vppb_id))
        } else {
            self.switch.unfreeze_vppb(usize::from(request.vppb_id))
        };
        let return_code = match result {
            Ok(()) => CciReturnCode::Success,
            Err(_) => CciReturnCode::InvalidInput,
        };
        CciMessage::response(tag, opcode, return_code, Vec::new())
    }

    /// Forwards the embedded command to the device behind `port_id` and
    /// wraps its reply. Tunnels serialize; CCI has no flow control.
    async fn tunnel(&self, tag: u8, payload: &[u8]) -> CciMessage {
        let opcode = CciOpcode::TunnelManagementCommand;
        let Ok(request) = TunnelRequest::try_from(payload) else {
            return CciMessage::response(tag, opcode, CciReturnCode::InvalidInput, Vec::new());
        };
        let Some(connection) = self.switch.port_connection(request.port_id) else {
            return CciMessage::response(tag, opcode, CciReturnCode::InvalidPort, Vec::new());
        };
        if self.switch.port_kind(request.port_id) != Some(PortKind::Dsp) {
            return CciMessage::response(tag, opcode, CciReturnCode::InvalidPort, Vec::new());
        }
        let Ok(Packet::Cci(inner)) = Packet::decode(&request.command) else {
            return CciMessage::response(tag, opcode, CciReturnCode::InvalidInput, Vec::new());
        };
        let _turn = self.tunnel_turn.lock().await;
        connection.cci.host_to_target.send(inner);
        let reply = timeout(TUNNEL_TIMEOUT, connection.cci.target_to_host.recv()).await;
        match reply {
            Ok(Some(inner_reply)) => CciMessage::response(
                tag,
                opcode,
                CciReturnCode::Success,
                TunnelResponse {
                    payload: inner_reply.encode(),
                }
                .to_bytes(),
            ),
            Ok(None) => CciMessage::response(tag, opcode, CciReturnCode::InvalidPort, Vec::new()),
            Err(_) => {
                warn!(port = request.port_id, "tunnel timed out");
                CciMessage::response(tag, opcode, CciReturnCode::RetryRequired, Vec::new())
            }
        }
    }
}
