/*!
Type-3 memory devices.

A device is the subordinate end of one fabric link: a config-space
function, a register BAR with the device HDM decoders, the
[DCOH](dcoh) engine answering CXL.mem, a small device cache, and a
file-backed memory controller underneath. [`CxlType3Device`] is the
single-logical-device flavour; [`MultiLogicalDevice`](mld) multiplexes
several logical devices plus the FM-owned LD over one link.
*/

pub mod dcoh;
pub mod mld;

use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::cache::{CacheController, CacheControllerConfig, CacheFifoPair};
use crate::component::connection::CxlConnection;
use crate::component::lifecycle::{Lifecycle, Runnable};
use crate::component::processor::{DeviceKind, PacketProcessor};
use crate::memory::{MemoryController, MemoryControllerConfig, MemoryFifoPair};
use crate::pci::{Bdf, ConfigSpace, DeviceMmio, SLD_DID, VENDOR_ID};
use crate::transport::cxl_io::{CplStatus, CxlIoPacket};
use crate::transport::framed;

use dcoh::Dcoh;

/// Register BAR of a type-3 function; bridge windows upstream are
/// sized around it
pub const DEVICE_BAR_SIZE: u32 = 0x20_0000;
/// Memory-class, CXL-memory-device programming interface
const DEVICE_CLASS: u32 = 0x05_0210;

#[derive(Debug, Clone)]
pub struct CxlType3DeviceConfig {
    pub device_name: String,
    pub port_index: u16,
    /// `None` runs the device on an in-process connection instead of a
    /// socket
    pub switch_addr: Option<String>,
    pub memory_size: u64,
    pub memory_file: PathBuf,
    pub cache_num_assoc: usize,
    pub cache_num_set: usize,
}

/// A single-logical-device type-3 memory expander
pub struct CxlType3Device {
    config: CxlType3DeviceConfig,
    connection: CxlConnection,
    config_space: StdMutex<ConfigSpace>,
    claimed: StdMutex<Option<(u8, u8)>>,
    mmio: Arc<StdMutex<DeviceMmio>>,
    dcoh: Arc<Dcoh>,
    device_cache: Arc<CacheController>,
    memory: Arc<MemoryController>,
    processor: Mutex<Option<Arc<PacketProcessor>>>,
    lifecycle: Lifecycle,
}

impl CxlType3Device {
    pub fn new(config: CxlType3DeviceConfig) -> Self {
        Self::with_connection(config, CxlConnection::new())
    }

    /// Builds the device on an existing queue bundle, the in-process
    /// topology variant
    pub fn with_connection(config: CxlType3DeviceConfig, connection: CxlConnection) -> Self {
        let memory_fifos = MemoryFifoPair::new();
        let memory = Arc::new(MemoryController::new(
            MemoryControllerConfig {
                memory_size: config.memory_size,
                memory_file: config.memory_file.clone(),
            },
            memory_fifos.clone(),
        ));
        let mmio = Arc::new(StdMutex::new(DeviceMmio::new(DEVICE_BAR_SIZE as usize, 1)));

        let cache_to_coh_agent = CacheFifoPair::new();
        let coh_agent_to_cache = CacheFifoPair::new();
        let device_cache = Arc::new(CacheController::new(CacheControllerConfig {
            name: config.device_name.clone(),
            cache_num_assoc: config.cache_num_assoc,
            cache_num_set: config.cache_num_set,
            cache_to_coh_agent: cache_to_coh_agent.clone(),
            coh_agent_to_cache: coh_agent_to_cache.clone(),
            cache_to_coh_bridge: None,
            coh_bridge_to_cache: None,
            ranges: Arc::default(),
        }));

        let dcoh = Arc::new(Dcoh::new(
            config.device_name.clone(),
            connection.cxl_mem.clone(),
            cache_to_coh_agent,
            coh_agent_to_cache,
            Arc::clone(&mmio),
            memory_fifos,
        ));

        Self {
            config_space: StdMutex::new(ConfigSpace::endpoint(
                VENDOR_ID,
                SLD_DID,
                DEVICE_CLASS,
                DEVICE_BAR_SIZE,
            )),
            claimed: StdMutex::new(None),
            connection,
            mmio,
            dcoh,
            device_cache,
            memory,
            config,
            processor: Mutex::new(None),
            lifecycle: Lifecycle::new(),
        }
    }

    pub fn connection(&self) -> &CxlConnection {
        &self.connection
    }

    pub fn dcoh(&self) -> &Arc<Dcoh> {
        &self.dcoh
    }

    /// Serves config cycles: this function claims device 0 function 0
    /// of whatever bus first addresses it
    async fn serve_cfg(&self) {
        let inbound = &self.connection.cfg.host_to_target;
        let outbound = &self.connection.cfg.target_to_host;
        while let Some(io) = inbound.recv().await {
            let CxlIoPacket::Cfg(ref cfg) = io else {
                warn!(device = %self.config.device_name, "non-config packet on config channel");
                continue;
            };
            let bdf = Bdf::from(cfg.header.dest_id());
            let req_id = cfg.header.req_id();
            let tag = cfg.header.tag();
            let claims = {
                let mut claimed = self.claimed.lock().unwrap();
                match *claimed {
                    _ if bdf.device() != 0 || bdf.function() != 0 => false,
                    Some(claim) => claim == (bdf.bus(), bdf.device()),
                    None => {
                        *claimed = Some((bdf.bus(), bdf.device()));
                        true
                    }
                }
            };
            let reply = if !claims {
                CxlIoPacket::completion(req_id, tag, CplStatus::UnsupportedRequest)
            } else {
                let at = cfg.header.register_offset();
                match cfg.data {
                    Some(value) => {
                        self.config_space.lock().unwrap().write(at, 4, value);
                        CxlIoPacket::completion(req_id, tag, CplStatus::SuccessfulCompletion)
                    }
                    None => {
                        let value = self.config_space.lock().unwrap().read(at, 4);
                        CxlIoPacket::completion_with_data(req_id, tag, &value.to_le_bytes())
                    }
                }
            };
            outbound.send(reply);
        }
        debug!(device = %self.config.device_name, "stopped config space manager");
    }

    async fn serve_mmio(&self) {
        let inbound = &self.connection.mmio.host_to_target;
        let outbound = &self.connection.mmio.target_to_host;
        while let Some(io) = inbound.recv().await {
            let CxlIoPacket::Mem(ref mem) = io else {
                warn!(device = %self.config.device_name, "non-memory packet on MMIO channel");
                continue;
            };
            let addr = mem.header.address();
            let bar = u64::from(self.config_space.lock().unwrap().bar(0));
            let in_bar =
                bar != 0 && bar <= addr && addr < bar + u64::from(DEVICE_BAR_SIZE);
            if !in_bar {
                if !io.is_mem_write() {
                    outbound.send(CxlIoPacket::completion(
                        mem.header.req_id(),
                        mem.header.tag(),
                        CplStatus::UnsupportedRequest,
                    ));
                }
                continue;
            }
            let at = addr - bar;
            let mut block = self.mmio.lock().unwrap();
            if io.is_mem_write() {
                match mem.data.len() {
                    8 => block.write64(at, u64::from_le_bytes(mem.data[..8].try_into().unwrap())),
                    4 => block.write32(at, u32::from_le_bytes(mem.data[..4].try_into().unwrap())),
                    other => warn!(other, "unsupported MMIO write width"),
                }
            } else {
                let bytes = match mem.dw0.length_dw() {
                    2 => block.read64(at).to_le_bytes().to_vec(),
                    _ => block.read32(at).to_le_bytes().to_vec(),
                };
                outbound.send(CxlIoPacket::completion_with_data(
                    mem.header.req_id(),
                    mem.header.tag(),
                    &bytes,
                ));
            }
        }
        debug!(device = %self.config.device_name, "stopped MMIO manager");
    }

    async fn run_core(&self) {
        let ready = async {
            self.memory.wait_for_ready().await;
            self.device_cache.wait_for_ready().await;
            self.dcoh.wait_for_ready().await;
            self.lifecycle.set_running();
        };
        tokio::join!(
            self.serve_cfg(),
            self.serve_mmio(),
            self.memory.run(),
            self.device_cache.run(),
            self.dcoh.run(),
            ready,
        );
    }
}

impl Runnable for CxlType3Device {
    fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    async fn run(&self) {
        match &self.config.switch_addr {
            Some(addr) => {
                let (reader, writer) = match framed::connect(addr, self.config.port_index).await {
                    Ok(split) => split,
                    Err(error) => {
                        error!(%error, "device failed to join the fabric");
                        self.lifecycle.set_stopped();
                        return;
                    }
                };
                info!(
                    device = %self.config.device_name,
                    port = self.config.port_index,
                    "joined fabric"
                );
                let processor = Arc::new(PacketProcessor::new(
                    reader,
                    writer,
                    vec![self.connection.clone()],
                    DeviceKind::SingleLogicalDevice,
                ));
                *self.processor.lock().await = Some(Arc::clone(&processor));
                tokio::join!(processor.run(), self.run_core());
            }
            None => self.run_core().await,
        }
        self.lifecycle.set_stopped();
    }

    async fn stop(&self) {
        self.dcoh.stop().await;
        self.device_cache.stop().await;
        self.memory.stop().await;
        self.connection.cfg.host_to_target.disconnect();
        self.connection.mmio.host_to_target.disconnect();
        if let Some(processor) = self.processor.lock().await.take() {
            processor.stop().await;
        }
    }
}
