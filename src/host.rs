/*!
Host-side root complex.

A host is the root of one fabric link: a [root port](root_port) that
enumerates and drives the switch, a [memory hub](memory_hub) exposing
the CPU load/store surface over a typed memory map, an inclusive cache,
the [home agent](home_agent) running the host side of the CXL.mem
coherency protocol, and the [coherency bridge](coh_bridge) resolving
device-initiated CXL.cache traffic against the host cache and host
memory.

[`CxlHost`] wires all of that to one switch port over TCP and carries
the programmatic equivalents of the management surface:
`cxl_host_read`, `cxl_host_write` and `cxl_mem_birsp`.
*/

pub mod coh_bridge;
pub mod home_agent;
pub mod memory_hub;
pub mod root_port;

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{error, info};

use crate::cache::{CacheController, CacheControllerConfig, CacheFifoPair, SharedRangeMap};
use crate::component::connection::CxlConnection;
use crate::component::lifecycle::{Lifecycle, Runnable};
use crate::component::processor::{DeviceKind, PacketProcessor};
use crate::memory::{MemoryController, MemoryControllerConfig, MemoryFifoPair};
use crate::transport::cxl_mem::{BIRspOpcode, CxlMemPacket};
use crate::transport::framed;
use crate::transport::CacheLineData;

use coh_bridge::{CacheCoherencyBridge, CacheCoherencyBridgeConfig};
use home_agent::{HomeAgent, HomeAgentConfig};
use memory_hub::CxlMemoryHub;
use root_port::RootPort;

#[derive(Debug, Clone)]
pub struct CxlHostConfig {
    pub host_name: String,
    pub port_index: u16,
    pub switch_addr: String,
    pub sys_mem_size: u64,
    pub sys_mem_file: PathBuf,
    pub cache_num_assoc: usize,
    pub cache_num_set: usize,
}

pub struct CxlHost {
    config: CxlHostConfig,
    connection: CxlConnection,
    root_port: Arc<RootPort>,
    memory_hub: Arc<CxlMemoryHub>,
    cache: Arc<CacheController>,
    home_agent: Arc<HomeAgent>,
    coh_bridge: Arc<CacheCoherencyBridge>,
    sys_mem: Arc<MemoryController>,
    processor: Mutex<Option<Arc<PacketProcessor>>>,
    lifecycle: Lifecycle,
}

impl CxlHost {
    pub fn new(config: CxlHostConfig) -> Self {
        let connection = CxlConnection::new();
        let ranges: SharedRangeMap = Arc::default();

        let sys_mem_fifos = MemoryFifoPair::new();
        let sys_mem = Arc::new(MemoryController::new(
            MemoryControllerConfig {
                memory_size: config.sys_mem_size,
                memory_file: config.sys_mem_file.clone(),
            },
            sys_mem_fifos.clone(),
        ));

        let cache_to_coh_agent = CacheFifoPair::new();
        let coh_agent_to_cache = CacheFifoPair::new();
        let cache_to_coh_bridge = CacheFifoPair::new();
        let coh_bridge_to_cache = CacheFifoPair::new();

        let cache = Arc::new(CacheController::new(CacheControllerConfig {
            name: config.host_name.clone(),
            cache_num_assoc: config.cache_num_assoc,
            cache_num_set: config.cache_num_set,
            cache_to_coh_agent: cache_to_coh_agent.clone(),
            coh_agent_to_cache: coh_agent_to_cache.clone(),
            cache_to_coh_bridge: Some(cache_to_coh_bridge.clone()),
            coh_bridge_to_cache: Some(coh_bridge_to_cache.clone()),
            ranges: Arc::clone(&ranges),
        }));

        let home_agent = Arc::new(HomeAgent::new(HomeAgentConfig {
            host_name: config.host_name.clone(),
            cache_to_home_agent: cache_to_coh_agent,
            home_agent_to_cache: coh_agent_to_cache,
            downstream_cxl_mem: connection.cxl_mem.clone(),
        }));

        let coh_bridge = Arc::new(CacheCoherencyBridge::new(CacheCoherencyBridgeConfig {
            host_name: config.host_name.clone(),
            memory_producer_fifos: sys_mem_fifos,
            cache_to_coh_bridge,
            coh_bridge_to_cache,
            downstream_cxl_cache: connection.cxl_cache.clone(),
        }));

        let root_port = Arc::new(RootPort::new(connection.clone()));
        let memory_hub = Arc::new(CxlMemoryHub::new(
            Arc::clone(&ranges),
            Arc::clone(&cache),
            Arc::clone(&root_port),
        ));

        Self {
            config,
            connection,
            root_port,
            memory_hub,
            cache,
            home_agent,
            coh_bridge,
            sys_mem,
            processor: Mutex::new(None),
            lifecycle: Lifecycle::new(),
        }
    }

    pub fn root_port(&self) -> &Arc<RootPort> {
        &self.root_port
    }

    pub fn memory_hub(&self) -> &Arc<CxlMemoryHub> {
        &self.memory_hub
    }

    /// Management surface: full-cacheline read at `addr` through the
    /// CPU path
    pub async fn cxl_host_read(&self, addr: u64) -> Option<CacheLineData> {
        self.memory_hub.load_line(addr).await
    }

    /// Management surface: full-cacheline write at `addr`
    pub async fn cxl_host_write(&self, addr: u64, data: CacheLineData) -> bool {
        self.memory_hub.store_line(addr, data).await
    }

    /// Management surface: inject a BIRsp toward the fabric
    pub fn cxl_mem_birsp(&self, opcode: BIRspOpcode, bi_id: u16, bi_tag: u16) {
        self.connection
            .cxl_mem
            .host_to_target
            .send(CxlMemPacket::birsp(opcode, bi_id, bi_tag));
    }
}

impl Runnable for CxlHost {
    fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    async fn run(&self) {
        let (reader, writer) =
            match framed::connect(&self.config.switch_addr, self.config.port_index).await {
                Ok(split) => split,
                Err(error) => {
                    error!(%error, "host failed to join the fabric");
                    self.lifecycle.set_stopped();
                    return;
                }
            };
        info!(host = %self.config.host_name, port = self.config.port_index, "joined fabric");
        let processor = Arc::new(PacketProcessor::new(
            reader,
            writer,
            vec![self.connection.clone()],
            DeviceKind::Host,
        ));
        *self.processor.lock().await = Some(Arc::clone(&processor));

        let ready = async {
            self.sys_mem.wait_for_ready().await;
            self.cache.wait_for_ready().await;
            self.home_agent.wait_for_ready().await;
            self.coh_bridge.wait_for_ready().await;
            processor.wait_for_ready().await;
            self.lifecycle.set_running();
        };
        tokio::join!(
            processor.run(),
            self.sys_mem.run(),
            self.cache.run(),
            self.home_agent.run(),
            self.coh_bridge.run(),
            ready,
        );
        self.lifecycle.set_stopped();
    }

    async fn stop(&self) {
        // Leaves first: drain the coherency engines before the socket
        self.home_agent.stop().await;
        self.coh_bridge.stop().await;
        self.cache.stop().await;
        self.sys_mem.stop().await;
        if let Some(processor) = self.processor.lock().await.take() {
            processor.stop().await;
        }
    }
}
