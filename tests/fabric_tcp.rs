//! Full fabric over real sockets: connection manager, handshake,
//! per-port packet processors, a type-3 device process and a host-side
//! root port, plus the disconnect path.

use std::sync::Arc;

use pretty_assertions::assert_eq;

use cxl_fabric::cache::MemAddrType;
use cxl_fabric::component::processor::{DeviceKind, PacketProcessor};
use cxl_fabric::component::{CxlConnection, Runnable};
use cxl_fabric::device::{CxlType3Device, CxlType3DeviceConfig};
use cxl_fabric::host::root_port::RootPort;
use cxl_fabric::host::{CxlHost, CxlHostConfig};
use cxl_fabric::pci::Bdf;
use cxl_fabric::switch::{
    PortKind, SwitchConnectionManager, VirtualSwitch, VirtualSwitchConfig,
};
use cxl_fabric::transport::framed::{self, FramedError};

const BASE_ADDRESS: u64 = 0xFE00_0000;
const MEMORY_SIZE: u64 = 0x10_0000;

struct Fabric {
    manager: Arc<SwitchConnectionManager>,
    switch: Arc<VirtualSwitch>,
    addr: String,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

async fn start_switch(port_kinds: Vec<PortKind>, vppb_count: usize) -> Fabric {
    let manager = Arc::new(SwitchConnectionManager::new(
        port_kinds,
        "127.0.0.1:0".into(),
    ));
    let switch = Arc::new(
        VirtualSwitch::new(
            VirtualSwitchConfig {
                vcs_id: 0,
                upstream_port_index: 0,
                vppb_count,
                initial_binds: vec![None; vppb_count],
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
    Fabric {
        manager,
        switch,
        addr,
        tasks,
    }
}

impl Fabric {
    async fn shutdown(self) {
        self.switch.stop().await;
        self.manager.stop().await;
        for task in self.tasks {
            task.abort();
        }
    }
}

/// Host half: a framed client plus its packet processor
async fn connect_host(addr: &str) -> (RootPort, Arc<PacketProcessor>, tokio::task::JoinHandle<()>) {
    let (reader, writer) = framed::connect(addr, 0).await.unwrap();
    let connection = CxlConnection::new();
    let processor = Arc::new(PacketProcessor::new(
        reader,
        writer,
        vec![connection.clone()],
        DeviceKind::Host,
    ));
    let runner = Arc::clone(&processor);
    let task = tokio::spawn(async move { runner.run().await });
    processor.wait_for_ready().await;
    (RootPort::new(connection), processor, task)
}

#[tokio::test]
async fn handshake_rejects_bad_and_duplicate_ports() {
    let fabric = start_switch(vec![PortKind::Usp, PortKind::Dsp], 1).await;

    // Out-of-range port index
    assert!(matches!(
        framed::connect(&fabric.addr, 9).await,
        Err(FramedError::Rejected)
    ));
    // First claim wins, the second is rejected
    let _held = framed::connect(&fabric.addr, 1).await.unwrap();
    assert!(matches!(
        framed::connect(&fabric.addr, 1).await,
        Err(FramedError::Rejected)
    ));
    fabric.shutdown().await;
}

#[tokio::test]
async fn end_to_end_over_sockets() {
    let fabric = start_switch(vec![PortKind::Usp, PortKind::Dsp], 1).await;
    let dir = tempfile::tempdir().unwrap();

    let device = Arc::new(CxlType3Device::new(CxlType3DeviceConfig {
        device_name: "mem0".into(),
        port_index: 1,
        switch_addr: Some(fabric.addr.clone()),
        memory_size: MEMORY_SIZE,
        memory_file: dir.path().join("mem0.bin"),
        cache_num_assoc: 4,
        cache_num_set: 8,
    }));
    let runner = Arc::clone(&device);
    let device_task = tokio::spawn(async move { runner.run().await });
    device.wait_for_ready().await;

    let (root_port, host_processor, host_task) = connect_host(&fabric.addr).await;

    fabric.switch.bind_vppb(1, 0, 0).unwrap();
    let info = root_port.enumerate(BASE_ADDRESS).await.unwrap();
    assert_eq!(
        root_port.read_vid_did(Bdf::new(1, 0, 0)).await,
        Some(0xF002_1DC5)
    );
    assert_eq!(
        root_port.read_vid_did(Bdf::new(3, 0, 0)).await,
        Some(0xF001_1DC5)
    );

    // MMIO into the device BAR through the socket fabric
    let window = BASE_ADDRESS + 0x10_0000;
    root_port.write_mmio(window + 0x40, 0xDEAD_BEEF);
    assert_eq!(root_port.read_mmio(window + 0x40).await, Some(0xDEAD_BEEF));

    // CXL.mem through the committed decoders
    let hpa_base = 0x1_0000_0000;
    root_port
        .configure_hdm_decoders(&info, hpa_base, MEMORY_SIZE)
        .await;
    assert!(root_port.cxl_mem_write(hpa_base + 0x80, [0x9C; 64]).await);
    assert_eq!(
        root_port.cxl_mem_read(hpa_base + 0x80).await,
        Some([0x9C; 64])
    );

    // Kill the device socket mid-traffic: the switch detaches the
    // vPPB and subsequent requests complete Unsupported Request
    device.stop().await;
    let _ = device_task.await;
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    assert!(!fabric.manager.is_port_connected(1));
    assert_eq!(root_port.read_vid_did(Bdf::new(3, 0, 0)).await, None);
    assert_eq!(root_port.read_mmio(window + 0x40).await, Some(0));

    host_processor.stop().await;
    host_task.abort();
    fabric.shutdown().await;
}

// The assembled host: coherent load/store through cache, home agent
// and switch down to a device, via the management-surface entry points.
#[tokio::test]
async fn cxl_host_reads_back_its_own_stores() {
    let fabric = start_switch(vec![PortKind::Usp, PortKind::Dsp], 1).await;
    let dir = tempfile::tempdir().unwrap();

    let device = Arc::new(CxlType3Device::new(CxlType3DeviceConfig {
        device_name: "mem0".into(),
        port_index: 1,
        switch_addr: Some(fabric.addr.clone()),
        memory_size: MEMORY_SIZE,
        memory_file: dir.path().join("mem0.bin"),
        cache_num_assoc: 4,
        cache_num_set: 8,
    }));
    let runner = Arc::clone(&device);
    let device_task = tokio::spawn(async move { runner.run().await });
    device.wait_for_ready().await;

    fabric.switch.bind_vppb(1, 0, 0).unwrap();

    let host = Arc::new(CxlHost::new(CxlHostConfig {
        host_name: "host0".into(),
        port_index: 0,
        switch_addr: fabric.addr.clone(),
        sys_mem_size: MEMORY_SIZE,
        sys_mem_file: dir.path().join("sys-mem0.bin"),
        cache_num_assoc: 4,
        cache_num_set: 8,
    }));
    let runner = Arc::clone(&host);
    let host_task = tokio::spawn(async move { runner.run().await });
    host.wait_for_ready().await;

    // Bring-up software: enumerate, commit decoders, register ranges
    let hpa_base = 0x1_0000_0000;
    let info = host.root_port().enumerate(BASE_ADDRESS).await.unwrap();
    let assigned = host
        .root_port()
        .configure_hdm_decoders(&info, hpa_base, MEMORY_SIZE)
        .await;
    assert_eq!(assigned.len(), 1);
    let half = MEMORY_SIZE / 2;
    host.memory_hub()
        .add_mem_range(hpa_base, half, MemAddrType::CxlCached)
        .unwrap();
    host.memory_hub()
        .add_mem_range(hpa_base + half, half, MemAddrType::CxlUncached)
        .unwrap();

    // Cached store/load pair
    let line = [0xB4; 64];
    assert!(host.cxl_host_write(hpa_base + 0x1000, line).await);
    assert_eq!(host.cxl_host_read(hpa_base + 0x1000).await, Some(line));

    // Uncached accesses round-trip the fabric on every call
    let line = [0x6E; 64];
    assert!(host.cxl_host_write(hpa_base + half + 0x40, line).await);
    assert_eq!(host.cxl_host_read(hpa_base + half + 0x40).await, Some(line));

    host.stop().await;
    let _ = host_task.await;
    device.stop().await;
    let _ = device_task.await;
    fabric.shutdown().await;
}
