//! In-process switch topologies: one virtual switch, three type-3
//! devices attached to its downstream ports, a root port driving the
//! upstream port. No sockets; every link is a shared queue bundle.

use std::sync::Arc;

use pretty_assertions::assert_eq;

use cxl_fabric::component::fifo::Fifo;
use cxl_fabric::component::Runnable;
use cxl_fabric::device::{CxlType3Device, CxlType3DeviceConfig};
use cxl_fabric::host::root_port::{EnumerationInfo, RootPort};
use cxl_fabric::pci::Bdf;
use cxl_fabric::switch::{PhysicalPort, VirtualSwitch, VirtualSwitchConfig};

const BASE_ADDRESS: u64 = 0xFE00_0000;
const MEMORY_SIZE: u64 = 0x10_0000;
const VPPB_COUNT: usize = 3;

struct Topology {
    switch: Arc<VirtualSwitch>,
    devices: Vec<Arc<CxlType3Device>>,
    root_port: RootPort,
    tasks: Vec<tokio::task::JoinHandle<()>>,
    _dir: tempfile::TempDir,
}

async fn build_topology(bind_at_construction: bool) -> Topology {
    let dir = tempfile::tempdir().unwrap();
    let mut ports = vec![PhysicalPort::usp()];
    let mut devices = Vec::new();
    for index in 0..VPPB_COUNT {
        let port = PhysicalPort::dsp();
        devices.push(Arc::new(CxlType3Device::with_connection(
            CxlType3DeviceConfig {
                device_name: format!("mem{index}"),
                port_index: index as u16 + 1,
                switch_addr: None,
                memory_size: MEMORY_SIZE,
                memory_file: dir.path().join(format!("mem{index}.bin")),
                cache_num_assoc: 4,
                cache_num_set: 8,
            },
            port.connection.clone(),
        )));
        ports.push(port);
    }
    let initial_binds = if bind_at_construction {
        (0..VPPB_COUNT).map(|i| Some(i as u8 + 1)).collect()
    } else {
        vec![None; VPPB_COUNT]
    };
    let switch = Arc::new(
        VirtualSwitch::new(
            VirtualSwitchConfig {
                vcs_id: 0,
                upstream_port_index: 0,
                vppb_count: VPPB_COUNT,
                initial_binds,
            },
            ports.clone(),
            Fifo::new(),
        )
        .unwrap(),
    );
    let root_port = RootPort::new(ports[0].connection.clone());

    let mut tasks = Vec::new();
    let runner = Arc::clone(&switch);
    tasks.push(tokio::spawn(async move { runner.run().await }));
    for device in &devices {
        let runner = Arc::clone(device);
        tasks.push(tokio::spawn(async move { runner.run().await }));
    }
    switch.wait_for_ready().await;
    for device in &devices {
        device.wait_for_ready().await;
    }
    Topology {
        switch,
        devices,
        root_port,
        tasks,
        _dir: dir,
    }
}

impl Topology {
    async fn shutdown(self) {
        self.switch.stop().await;
        for device in &self.devices {
            device.stop().await;
        }
        for task in self.tasks {
            task.abort();
        }
    }
}

fn bridge_tuples(info: &EnumerationInfo) -> Vec<(Bdf, u32, u64, u64)> {
    info.bridges()
        .map(|b| (b.bdf, b.class_code, b.memory_base, b.memory_limit))
        .collect()
}

#[tokio::test]
async fn enumerate_sld_topology() {
    let topology = build_topology(true).await;
    let root_port = &topology.root_port;
    root_port.enumerate(BASE_ADDRESS).await.unwrap();

    let expectations = [
        (Bdf::new(1, 0, 0), Some(0xF002_1DC5)),
        (Bdf::new(2, 0, 0), Some(0xF003_1DC5)),
        (Bdf::new(2, 1, 0), Some(0xF003_1DC5)),
        (Bdf::new(2, 2, 0), Some(0xF003_1DC5)),
        (Bdf::new(3, 0, 0), Some(0xF001_1DC5)),
        (Bdf::new(4, 0, 0), Some(0xF001_1DC5)),
        (Bdf::new(5, 0, 0), Some(0xF001_1DC5)),
        (Bdf::new(1, 0, 1), None),
        (Bdf::new(6, 0, 0), None),
    ];
    for (bdf, expected) in expectations {
        assert_eq!(root_port.read_vid_did(bdf).await, expected, "at {bdf}");
    }
    topology.shutdown().await;
}

#[tokio::test]
async fn config_requests_outside_every_range_complete_unsupported() {
    let topology = build_topology(true).await;
    let root_port = &topology.root_port;
    root_port.enumerate(BASE_ADDRESS).await.unwrap();

    for bdf in [
        Bdf::new(1, 0, 1),
        Bdf::new(2, 3, 0),
        Bdf::new(2, 0, 1),
        Bdf::new(3, 0, 1),
        Bdf::new(3, 1, 0),
        Bdf::new(4, 0, 1),
        Bdf::new(4, 1, 0),
        Bdf::new(5, 0, 1),
        Bdf::new(5, 1, 0),
        Bdf::new(6, 0, 0),
    ] {
        assert_eq!(root_port.read_vid_did(bdf).await, None, "at {bdf}");
    }
    topology.shutdown().await;
}

// Binding everything at construction and binding the same layout at
// runtime must enumerate identically, bridge for bridge.
#[tokio::test]
async fn initial_and_runtime_binds_enumerate_identically() {
    let initial = build_topology(true).await;
    initial.root_port.enumerate(BASE_ADDRESS).await.unwrap();
    let enum_initial = initial.root_port.scan_devices().await;
    initial.shutdown().await;

    let runtime = build_topology(false).await;
    for vppb in 0..VPPB_COUNT {
        runtime.switch.bind_vppb(vppb as u8 + 1, vppb, 0).unwrap();
    }
    runtime.root_port.enumerate(BASE_ADDRESS).await.unwrap();
    let enum_runtime = runtime.root_port.scan_devices().await;
    runtime.shutdown().await;

    assert_eq!(bridge_tuples(&enum_initial), bridge_tuples(&enum_runtime));
    assert_eq!(enum_initial.devices, enum_runtime.devices);
}

#[tokio::test]
async fn mmio_routes_to_usp_and_downstream_windows() {
    let topology = build_topology(true).await;
    let root_port = &topology.root_port;
    root_port.enumerate(BASE_ADDRESS).await.unwrap();
    let data = 0xDEAD_BEEF;

    // USP register BAR
    root_port.write_mmio(BASE_ADDRESS, data);
    assert_eq!(root_port.read_mmio(BASE_ADDRESS).await, Some(data));

    // Each downstream window, lowest address = the endpoint BAR
    for index in 0..VPPB_COUNT as u64 {
        let addr = BASE_ADDRESS + 0x10_0000 + index * 0x20_0000;
        root_port.write_mmio(addr, data);
        assert_eq!(root_port.read_mmio(addr).await, Some(data), "window {index}");
    }

    // Below every window: accepted, reads back zero
    root_port.write_mmio(BASE_ADDRESS - 4, data);
    assert_eq!(root_port.read_mmio(BASE_ADDRESS - 4).await, Some(0));
    topology.shutdown().await;
}

#[tokio::test]
async fn cxl_mem_routes_through_committed_decoders() {
    let topology = build_topology(true).await;
    let root_port = &topology.root_port;
    let info = root_port.enumerate(BASE_ADDRESS).await.unwrap();

    let hpa_base = 0x1_0000_0000;
    let assigned = root_port
        .configure_hdm_decoders(&info, hpa_base, MEMORY_SIZE)
        .await;
    assert_eq!(assigned.len(), VPPB_COUNT);

    for (base, _) in assigned {
        let line = {
            let mut line = [0u8; 64];
            line[..8].copy_from_slice(&base.to_le_bytes());
            line
        };
        assert!(root_port.cxl_mem_write(base + 0x40, line).await);
        assert_eq!(root_port.cxl_mem_read(base + 0x40).await, Some(line));
    }
    topology.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn frozen_vppb_drops_io_but_passes_mem() {
    let topology = build_topology(true).await;
    let root_port = &topology.root_port;
    let info = root_port.enumerate(BASE_ADDRESS).await.unwrap();
    let hpa_base = 0x1_0000_0000;
    root_port
        .configure_hdm_decoders(&info, hpa_base, MEMORY_SIZE)
        .await;
    let window0 = BASE_ADDRESS + 0x10_0000;

    root_port.write_mmio(window0, 0x1111_2222);
    assert_eq!(root_port.read_mmio(window0).await, Some(0x1111_2222));

    topology.switch.freeze_vppb(0).unwrap();
    // CXL.io through the frozen vPPB dies quietly: the read times out
    root_port.write_mmio(window0, 0x3333_4444);
    assert_eq!(root_port.read_mmio(window0).await, None);

    // CXL.mem keeps flowing
    assert!(root_port.cxl_mem_write(hpa_base, [0x42; 64]).await);
    assert_eq!(root_port.cxl_mem_read(hpa_base).await, Some([0x42; 64]));

    topology.switch.unfreeze_vppb(0).unwrap();
    // Nothing was written while frozen
    assert_eq!(root_port.read_mmio(window0).await, Some(0x1111_2222));
    topology.shutdown().await;
}

#[tokio::test]
async fn bind_use_unbind_keeps_bridge_windows() {
    let topology = build_topology(false).await;
    let root_port = &topology.root_port;

    topology.switch.bind_vppb(1, 0, 0).unwrap();
    let info = root_port.enumerate(BASE_ADDRESS).await.unwrap();
    let hpa_base = 0x1_0000_0000;
    root_port
        .configure_hdm_decoders(&info, hpa_base, MEMORY_SIZE)
        .await;

    assert!(root_port.cxl_mem_write(hpa_base, [0x77; 64]).await);
    assert_eq!(root_port.cxl_mem_read(hpa_base).await, Some([0x77; 64]));

    topology.switch.unbind_vppb(0).await.unwrap();
    let rescan = root_port.scan_devices().await;
    // Graceful detach: the bridge keeps its programmed window
    let bridge = rescan
        .bridges()
        .find(|b| b.bdf == Bdf::new(2, 0, 0))
        .copied()
        .unwrap();
    assert_eq!(bridge.memory_base, BASE_ADDRESS + 0x10_0000);
    assert_eq!(bridge.memory_limit, BASE_ADDRESS + 0x10_0000 + 0x20_0000 - 1);
    topology.shutdown().await;
}

#[tokio::test]
async fn bind_preconditions_are_enforced() {
    use cxl_fabric::switch::SwitchConfigError;

    let topology = build_topology(false).await;
    let switch = &topology.switch;
    assert_eq!(
        switch.bind_vppb(4, 1, 0),
        Err(SwitchConfigError::PortOutOfRange { port: 4 })
    );
    assert_eq!(
        switch.bind_vppb(0, 1, 0),
        Err(SwitchConfigError::PortNotDsp { port: 0 })
    );
    assert_eq!(
        switch.unbind_vppb(4).await,
        Err(SwitchConfigError::VppbOutOfRange { vppb: 4 })
    );
    assert_eq!(
        switch.unbind_vppb(1).await,
        Err(SwitchConfigError::VppbNotBound { vppb: 1 })
    );
    switch.bind_vppb(1, 0, 0).unwrap();
    assert_eq!(
        switch.bind_vppb(1, 1, 0),
        Err(SwitchConfigError::PortAlreadyBound { port: 1, vppb: 0 })
    );
    assert_eq!(
        switch.bind_vppb(2, 0, 0),
        Err(SwitchConfigError::VppbAlreadyBound { vppb: 0 })
    );
    topology.shutdown().await;
}
