//! The fabric-manager CCI surface against an in-process switch, and
//! the tunneled LD commands against an MLD.

use std::sync::Arc;

use pretty_assertions::assert_eq;

use cxl_fabric::component::fifo::Fifo;
use cxl_fabric::component::Runnable;
use cxl_fabric::device::mld::{MultiLogicalDevice, MultiLogicalDeviceConfig};
use cxl_fabric::switch::{
    FabricManager, PhysicalPort, SwitchConnectionManager, VirtualSwitch, VirtualSwitchConfig,
};
use cxl_fabric::transport::cci::{
    BackgroundOperationStatus, BindVppbRequest, CciMessage, CciOpcode, CciReturnCode,
    GetLdInfoResponse, GetVcsInfoRequest, GetVcsInfoResponse, IdentifySwitchDevice,
    TunnelRequest, TunnelResponse, VppbRequest,
};
use cxl_fabric::transport::Packet;
use cxl_fabric::switch::PortKind;

fn in_process_switch() -> Arc<VirtualSwitch> {
    let ports = vec![
        PhysicalPort::usp(),
        PhysicalPort::dsp(),
        PhysicalPort::dsp(),
        PhysicalPort::dsp(),
    ];
    Arc::new(
        VirtualSwitch::new(
            VirtualSwitchConfig {
                vcs_id: 0,
                upstream_port_index: 0,
                vppb_count: 3,
                initial_binds: vec![None; 3],
            },
            ports,
            Fifo::new(),
        )
        .unwrap(),
    )
}

#[tokio::test]
async fn identify_and_vcs_info_reflect_binding_state() {
    let switch = in_process_switch();
    let fm = FabricManager::new(Arc::clone(&switch));

    let reply = fm
        .handle_request(CciMessage::request(1, CciOpcode::IdentifySwitchDevice, vec![]))
        .await;
    assert_eq!(reply.header.message_tag(), 1);
    assert_eq!(reply.return_code(), Some(CciReturnCode::Success));
    let identity = IdentifySwitchDevice::try_from(&reply.payload[..]).unwrap();
    assert_eq!(identity.num_physical_ports, 4);
    assert_eq!(identity.total_vppbs, 3);
    assert_eq!(identity.bound_vppbs, 0);

    // Bind through the management surface; architecturally a
    // background command
    let reply = fm
        .handle_request(CciMessage::request(
            2,
            CciOpcode::BindVppb,
            BindVppbRequest {
                vcs_id: 0,
                vppb_id: 0,
                port_id: 1,
                ld_id: 0,
            }
            .to_bytes()
            .to_vec(),
        ))
        .await;
    assert_eq!(
        reply.return_code(),
        Some(CciReturnCode::BackgroundCommandStarted)
    );
    let status = fm
        .handle_request(CciMessage::request(
            3,
            CciOpcode::BackgroundOperationStatus,
            vec![],
        ))
        .await;
    let status = BackgroundOperationStatus::try_from(&status.payload[..]).unwrap();
    assert!(!status.operation_in_progress);
    assert_eq!(status.opcode, CciOpcode::BindVppb as u16);
    assert_eq!(status.return_code, CciReturnCode::Success as u16);

    let reply = fm
        .handle_request(CciMessage::request(
            4,
            CciOpcode::GetVirtualCxlSwitchInfo,
            GetVcsInfoRequest {
                start_vppb: 0,
                vppb_list_limit: 8,
                vcs_id_list: vec![0],
            }
            .to_bytes(),
        ))
        .await;
    let info = GetVcsInfoResponse::try_from(&reply.payload[..]).unwrap();
    assert_eq!(info.blocks.len(), 1);
    let vppbs = &info.blocks[0].vppbs;
    assert_eq!(vppbs.len(), 3);
    assert_eq!(vppbs[0].binding_status, 2);
    assert_eq!(vppbs[0].bound_port_id, 1);
    assert_eq!(vppbs[1].binding_status, 0);

    // Unbind is a background command too
    let reply = fm
        .handle_request(CciMessage::request(
            5,
            CciOpcode::UnbindVppb,
            VppbRequest {
                vcs_id: 0,
                vppb_id: 0,
            }
            .to_bytes()
            .to_vec(),
        ))
        .await;
    assert_eq!(
        reply.return_code(),
        Some(CciReturnCode::BackgroundCommandStarted)
    );
    assert_eq!(switch.vppb_snapshot(0).unwrap().bound_port, None);
}

#[tokio::test]
async fn freeze_unfreeze_and_invalid_requests() {
    let switch = in_process_switch();
    let fm = FabricManager::new(Arc::clone(&switch));

    let reply = fm
        .handle_request(CciMessage::request(
            1,
            CciOpcode::FreezeVppb,
            VppbRequest {
                vcs_id: 0,
                vppb_id: 1,
            }
            .to_bytes()
            .to_vec(),
        ))
        .await;
    assert_eq!(reply.return_code(), Some(CciReturnCode::Success));
    assert!(switch.vppb_snapshot(1).unwrap().frozen);

    let reply = fm
        .handle_request(CciMessage::request(
            2,
            CciOpcode::UnfreezeVppb,
            VppbRequest {
                vcs_id: 0,
                vppb_id: 1,
            }
            .to_bytes()
            .to_vec(),
        ))
        .await;
    assert_eq!(reply.return_code(), Some(CciReturnCode::Success));
    assert!(!switch.vppb_snapshot(1).unwrap().frozen);

    // vPPB out of range
    let reply = fm
        .handle_request(CciMessage::request(
            3,
            CciOpcode::FreezeVppb,
            VppbRequest {
                vcs_id: 0,
                vppb_id: 9,
            }
            .to_bytes()
            .to_vec(),
        ))
        .await;
    assert_eq!(reply.return_code(), Some(CciReturnCode::InvalidInput));

    // Truncated payload
    let reply = fm
        .handle_request(CciMessage::request(4, CciOpcode::BindVppb, vec![0]))
        .await;
    assert_eq!(reply.return_code(), Some(CciReturnCode::InvalidInput));
}

// Get LD Info tunneled through the switch to an MLD over sockets.
#[tokio::test]
async fn tunnel_reaches_the_fmld() {
    let manager = Arc::new(SwitchConnectionManager::new(
        vec![PortKind::Usp, PortKind::Dsp],
        "127.0.0.1:0".into(),
    ));
    let switch = Arc::new(
        VirtualSwitch::new(
            VirtualSwitchConfig {
                vcs_id: 0,
                upstream_port_index: 0,
                vppb_count: 1,
                initial_binds: vec![None],
            },
            manager.physical_ports(),
            manager.port_events(),
        )
        .unwrap(),
    );
    let mut tasks = Vec::new();
    let runner = Arc::clone(&manager);
    tasks.push(tokio::spawn(async move { runner.run().await }));
    let runner = Arc::clone(&switch);
    tasks.push(tokio::spawn(async move { runner.run().await }));
    manager.wait_for_ready().await;
    switch.wait_for_ready().await;
    let addr = manager.local_addr().unwrap().to_string();

    let dir = tempfile::tempdir().unwrap();
    let mld = Arc::new(MultiLogicalDevice::new(MultiLogicalDeviceConfig {
        device_name: "pool0".into(),
        port_index: 1,
        switch_addr: Some(addr),
        ld_count: 4,
        memory_size: 0x10_0000,
        memory_file_stem: dir.path().join("pool0"),
        cache_num_assoc: 4,
        cache_num_set: 8,
    }));
    let runner = Arc::clone(&mld);
    tasks.push(tokio::spawn(async move { runner.run().await }));
    mld.wait_for_ready().await;

    let fm = FabricManager::new(Arc::clone(&switch));
    let inner = CciMessage::request(7, CciOpcode::GetLdInfo, vec![]);
    let reply = fm
        .handle_request(CciMessage::request(
            8,
            CciOpcode::TunnelManagementCommand,
            TunnelRequest {
                port_id: 1,
                target_type: 0,
                command: inner.encode(),
            }
            .to_bytes(),
        ))
        .await;
    assert_eq!(reply.return_code(), Some(CciReturnCode::Success));
    let tunneled = TunnelResponse::try_from(&reply.payload[..]).unwrap();
    let Packet::Cci(inner_reply) = Packet::decode(&tunneled.payload).unwrap() else {
        panic!("tunnel did not carry a CCI message");
    };
    assert_eq!(inner_reply.header.message_tag(), 7);
    let ld_info = GetLdInfoResponse::try_from(&inner_reply.payload[..]).unwrap();
    assert_eq!(ld_info.ld_count, 4);
    assert_eq!(ld_info.memory_size, 4 * 0x10_0000);

    mld.stop().await;
    switch.stop().await;
    manager.stop().await;
    for task in tasks {
        task.abort();
    }
}
