//! Host-side coherency pipeline against the device-side DCOH: the
//! full stack over one in-process CXL.mem link, the DCOH probed alone
//! at the packet level, and the home agent probed alone with the test
//! standing in for the device.

use std::sync::Arc;

use pretty_assertions::assert_eq;

use cxl_fabric::cache::{
    CacheController, CacheControllerConfig, CacheFifoPair, MemAddrType, SharedRangeMap,
};
use cxl_fabric::component::Runnable;
use cxl_fabric::device::{CxlType3Device, CxlType3DeviceConfig};
use cxl_fabric::host::home_agent::{HomeAgent, HomeAgentConfig};
use cxl_fabric::transport::cxl_mem::{
    BIRspOpcode, BISnpOpcode, CxlMemPacket, MemOpcode, MetaField, MetaValue, NdrOpcode, SnpType,
};
use cxl_fabric::CxlConnection;

const MEMORY_SIZE: u64 = 0x10_0000;

fn host_cache_parts() -> (CacheFifoPair, CacheFifoPair, Arc<CacheController>) {
    let cache_to_coh_agent = CacheFifoPair::new();
    let coh_agent_to_cache = CacheFifoPair::new();
    let ranges: SharedRangeMap = Arc::default();
    ranges
        .lock()
        .unwrap()
        .add(0, MEMORY_SIZE, MemAddrType::CxlCached)
        .unwrap();
    let cache = Arc::new(CacheController::new(CacheControllerConfig {
        name: "host0".into(),
        cache_num_assoc: 4,
        cache_num_set: 8,
        cache_to_coh_agent: cache_to_coh_agent.clone(),
        coh_agent_to_cache: coh_agent_to_cache.clone(),
        cache_to_coh_bridge: None,
        coh_bridge_to_cache: None,
        ranges,
    }));
    (cache_to_coh_agent, coh_agent_to_cache, cache)
}

fn make_device(dir: &tempfile::TempDir, link: &CxlConnection) -> Arc<CxlType3Device> {
    Arc::new(CxlType3Device::with_connection(
        CxlType3DeviceConfig {
            device_name: "mem0".into(),
            port_index: 0,
            switch_addr: None,
            memory_size: MEMORY_SIZE,
            memory_file: dir.path().join("mem0.bin"),
            cache_num_assoc: 4,
            cache_num_set: 8,
        },
        link.clone(),
    ))
}

/// Cache controller + home agent + DCOH device, all wired up
struct FullBench {
    device: Arc<CxlType3Device>,
    home_agent: Arc<HomeAgent>,
    host_cache: Arc<CacheController>,
    tasks: Vec<tokio::task::JoinHandle<()>>,
    _dir: tempfile::TempDir,
}

async fn build_full_bench() -> FullBench {
    let dir = tempfile::tempdir().unwrap();
    let link = CxlConnection::new();
    let device = make_device(&dir, &link);
    let (cache_to_coh_agent, coh_agent_to_cache, host_cache) = host_cache_parts();
    let home_agent = Arc::new(HomeAgent::new(HomeAgentConfig {
        host_name: "host0".into(),
        cache_to_home_agent: cache_to_coh_agent,
        home_agent_to_cache: coh_agent_to_cache,
        downstream_cxl_mem: link.cxl_mem.clone(),
    }));

    let mut tasks = Vec::new();
    let runner = Arc::clone(&device);
    tasks.push(tokio::spawn(async move { runner.run().await }));
    let runner = Arc::clone(&home_agent);
    tasks.push(tokio::spawn(async move { runner.run().await }));
    let runner = Arc::clone(&host_cache);
    tasks.push(tokio::spawn(async move { runner.run().await }));

    device.wait_for_ready().await;
    home_agent.wait_for_ready().await;
    host_cache.wait_for_ready().await;
    FullBench {
        device,
        home_agent,
        host_cache,
        tasks,
        _dir: dir,
    }
}

impl FullBench {
    async fn shutdown(self) {
        self.host_cache.stop().await;
        self.home_agent.stop().await;
        self.device.stop().await;
        for task in self.tasks {
            task.abort();
        }
    }
}

#[tokio::test]
async fn store_then_load_round_trips_through_the_fabric() {
    let bench = build_full_bench().await;
    let addr = 0x2040;
    let line = [0x5A; 64];

    assert!(bench.host_cache.store_line(addr, line).await);
    assert_eq!(bench.host_cache.load_line(addr).await, Some(line));

    // Push the line out of the host cache by filling its set, then
    // load it back through the device
    for i in 1..=4u64 {
        let other = addr + i * 8 * 64;
        assert!(bench.host_cache.store_line(other, [i as u8; 64]).await);
    }
    assert_eq!(bench.host_cache.load_line(addr).await, Some(line));
    bench.shutdown().await;
}

#[tokio::test]
async fn uncached_access_bypasses_the_cache() {
    let bench = build_full_bench().await;
    let addr = 0x3000;
    assert!(bench.host_cache.uncached_store(addr, [0xC3; 64]).await);
    assert_eq!(bench.host_cache.uncached_load(addr).await, Some([0xC3; 64]));
    bench.shutdown().await;
}

// End to end back-invalidate: the device evicts a host-held dirty
// line; once the BIRsp arrives the host's data is in device memory.
#[tokio::test]
async fn device_back_invalidate_flushes_a_dirty_host_line() {
    let bench = build_full_bench().await;
    let addr = 0x4000;
    let line = [0xD1; 64];

    // Full-line store allocates modified without touching the device
    assert!(bench.host_cache.store_line(addr, line).await);

    let birsp = bench.device.dcoh().request_back_invalidate(addr).await;
    assert_eq!(birsp, Some(BIRspOpcode::BIRspI));

    // The host line was invalidated, so this load refetches from the
    // device; it can only return the data if the flush landed there
    assert_eq!(bench.host_cache.load_line(addr).await, Some(line));
    bench.shutdown().await;
}

/// Just the device; the test speaks raw CXL.mem on the link
struct DeviceBench {
    link: CxlConnection,
    device: Arc<CxlType3Device>,
    task: tokio::task::JoinHandle<()>,
    _dir: tempfile::TempDir,
}

async fn build_device_bench() -> DeviceBench {
    let dir = tempfile::tempdir().unwrap();
    let link = CxlConnection::new();
    let device = make_device(&dir, &link);
    let runner = Arc::clone(&device);
    let task = tokio::spawn(async move { runner.run().await });
    device.wait_for_ready().await;
    DeviceBench {
        link,
        device,
        task,
        _dir: dir,
    }
}

impl DeviceBench {
    fn send(&self, packet: CxlMemPacket) {
        self.link.cxl_mem.host_to_target.send(packet);
    }

    async fn recv(&self) -> CxlMemPacket {
        self.link.cxl_mem.target_to_host.recv().await.unwrap()
    }

    async fn shutdown(self) {
        self.device.stop().await;
        self.task.abort();
    }
}

// HDM-DB shared read: Cmp-S followed by a DRS with the stored content.
#[tokio::test]
async fn hdm_db_shared_read_answers_cmp_s_with_data() {
    let bench = build_device_bench().await;
    let addr = 0x1000;
    let line = [0xA7; 64];

    bench.send(CxlMemPacket::mem_wr(addr, line, 0));
    assert!(matches!(bench.recv().await, CxlMemPacket::S2MNdr(_)));

    bench.send(CxlMemPacket::m2s_req(
        MemOpcode::MemRd,
        MetaField::Meta0State,
        MetaValue::Shared,
        SnpType::SnpData,
        addr,
        0,
    ));
    match bench.recv().await {
        CxlMemPacket::S2MNdr(header) => assert_eq!(header.opcode(), NdrOpcode::CmpS),
        other => panic!("expected NDR, got {other:?}"),
    }
    match bench.recv().await {
        CxlMemPacket::S2MDrs(_, data) => assert_eq!(data, line),
        other => panic!("expected DRS, got {other:?}"),
    }
    bench.shutdown().await;
}

// Host ownership grab: MemInv with SnpInv completes Cmp-E, no data.
#[tokio::test]
async fn mem_inv_answers_cmp_e() {
    let bench = build_device_bench().await;
    bench.send(CxlMemPacket::m2s_req(
        MemOpcode::MemInv,
        MetaField::Meta0State,
        MetaValue::Any,
        SnpType::SnpInv,
        0x1000,
        0,
    ));
    match bench.recv().await {
        CxlMemPacket::S2MNdr(header) => {
            assert_eq!(header.opcode(), NdrOpcode::CmpE);
            assert_eq!(header.meta_value(), MetaValue::Invalid);
        }
        other => panic!("expected NDR, got {other:?}"),
    }
    bench.shutdown().await;
}

// SnpCur observes: Cmp plus a DRS, no state change expected after.
#[tokio::test]
async fn snp_cur_answers_cmp_with_data() {
    let bench = build_device_bench().await;
    let line = [0x66; 64];
    bench.send(CxlMemPacket::mem_wr(0x2000, line, 0));
    bench.recv().await;

    bench.send(CxlMemPacket::m2s_req(
        MemOpcode::MemRd,
        MetaField::Meta0State,
        MetaValue::Invalid,
        SnpType::SnpCur,
        0x2000,
        0,
    ));
    match bench.recv().await {
        CxlMemPacket::S2MNdr(header) => assert_eq!(header.opcode(), NdrOpcode::Cmp),
        other => panic!("expected NDR, got {other:?}"),
    }
    assert!(matches!(bench.recv().await, CxlMemPacket::S2MDrs(_, data) if data == line));
    bench.shutdown().await;
}

/// Host cache + home agent; the test plays the device on the link
struct AgentBench {
    link: CxlConnection,
    home_agent: Arc<HomeAgent>,
    host_cache: Arc<CacheController>,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

async fn build_agent_bench() -> AgentBench {
    let link = CxlConnection::new();
    let (cache_to_coh_agent, coh_agent_to_cache, host_cache) = host_cache_parts();
    let home_agent = Arc::new(HomeAgent::new(HomeAgentConfig {
        host_name: "host0".into(),
        cache_to_home_agent: cache_to_coh_agent,
        home_agent_to_cache: coh_agent_to_cache,
        downstream_cxl_mem: link.cxl_mem.clone(),
    }));
    let mut tasks = Vec::new();
    let runner = Arc::clone(&home_agent);
    tasks.push(tokio::spawn(async move { runner.run().await }));
    let runner = Arc::clone(&host_cache);
    tasks.push(tokio::spawn(async move { runner.run().await }));
    home_agent.wait_for_ready().await;
    host_cache.wait_for_ready().await;
    AgentBench {
        link,
        home_agent,
        host_cache,
        tasks,
    }
}

impl AgentBench {
    /// Next M2S packet the agent emitted
    async fn m2s(&self) -> CxlMemPacket {
        self.link.cxl_mem.host_to_target.recv().await.unwrap()
    }

    fn s2m(&self, packet: CxlMemPacket) {
        self.link.cxl_mem.target_to_host.send(packet);
    }

    async fn shutdown(self) {
        self.host_cache.stop().await;
        self.home_agent.stop().await;
        for task in self.tasks {
            task.abort();
        }
    }
}

// S4 ordering, observed at the packet level: a BISnp against a dirty
// host line produces the write-back first, the BIRsp-I only after the
// write-back completed.
#[tokio::test]
async fn bisnp_on_dirty_line_writes_back_before_birsp() {
    let bench = build_agent_bench().await;
    let addr = 0x4000;
    let line = [0xD1; 64];
    assert!(bench.host_cache.store_line(addr, line).await);

    bench.s2m(CxlMemPacket::bisnp(BISnpOpcode::BISnpInv, addr, 2, 9));

    match bench.m2s().await {
        CxlMemPacket::M2SRwD(header, data) => {
            assert_eq!(header.meta_field(), MetaField::Meta0State);
            assert_eq!(header.meta_value(), MetaValue::Invalid);
            assert_eq!(header.addr() << 6, addr);
            assert_eq!(data, line);
        }
        other => panic!("expected the write-back first, got {other:?}"),
    }
    // Only after the write-back completes does the BIRsp go out
    bench.s2m(CxlMemPacket::cmp(0));
    match bench.m2s().await {
        CxlMemPacket::M2SBIRsp(header) => {
            assert_eq!(header.opcode(), BIRspOpcode::BIRspI);
            assert_eq!(header.bi_id(), 2);
            assert_eq!(header.bi_tag(), 9);
        }
        other => panic!("expected BIRsp, got {other:?}"),
    }
    bench.shutdown().await;
}

// A clean host line elicits the BIRsp-I with no intervening
// write-back.
#[tokio::test]
async fn bisnp_on_clean_line_skips_the_writeback() {
    let bench = build_agent_bench().await;
    let addr = 0x5000;
    let line = [0x33; 64];

    // Pull the line in shared: answer the agent's shared read ourselves
    let cache = Arc::clone(&bench.host_cache);
    let loading = tokio::spawn(async move { cache.load_line(addr).await });
    match bench.m2s().await {
        CxlMemPacket::M2SReq(header) => {
            assert_eq!(header.snp_type(), SnpType::SnpData);
            assert_eq!(header.meta_value(), MetaValue::Shared);
        }
        other => panic!("expected the shared read, got {other:?}"),
    }
    bench.s2m(CxlMemPacket::ndr(
        NdrOpcode::CmpS,
        MetaField::Meta0State,
        MetaValue::Any,
        0,
    ));
    bench.s2m(CxlMemPacket::drs(line, 0));
    assert_eq!(loading.await.unwrap(), Some(line));

    bench.s2m(CxlMemPacket::bisnp(BISnpOpcode::BISnpInv, addr, 0, 1));
    // Straight to the BIRsp: an invalidated clean line owes nothing
    match bench.m2s().await {
        CxlMemPacket::M2SBIRsp(header) => {
            assert_eq!(header.opcode(), BIRspOpcode::BIRspI)
        }
        other => panic!("expected BIRsp with no write-back, got {other:?}"),
    }
    bench.shutdown().await;
}
