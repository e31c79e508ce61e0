/*!
Multi-logical device.

One socket, several logical devices: the packet processor demuxes by
`ld_id` into per-LD queue bundles, and each LD runs a full type-3 core
(config space, register BAR, DCOH, memory) against its own backing
file. Responses all merge back over the shared link with their `ld_id`
stamped.

The FM-owned logical device (FMLD) answers the tunneled management
commands — Get LD Info and Get/Set LD Allocations — from the CCI
mailbox the processor routes to it. Allocations are bookkeeping in
multiples of the 256 MiB granularity; changing them does not move live
data.
*/

use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::component::connection::CxlConnection;
use crate::component::fifo::FifoPair;
use crate::component::lifecycle::{Lifecycle, Runnable};
use crate::component::processor::{DeviceKind, PacketProcessor};
use crate::device::{CxlType3Device, CxlType3DeviceConfig};
use crate::transport::cci::{
    CciMessage, CciOpcode, CciReturnCode, GetLdAllocationsRequest, GetLdInfoResponse,
    LdAllocation, LdAllocationList,
};
use crate::transport::framed;

#[derive(Debug, Clone)]
pub struct MultiLogicalDeviceConfig {
    pub device_name: String,
    pub port_index: u16,
    pub switch_addr: Option<String>,
    pub ld_count: usize,
    /// Capacity per logical device
    pub memory_size: u64,
    /// Backing file per LD, derived as `<stem>-ld<N>.bin`
    pub memory_file_stem: PathBuf,
    pub cache_num_assoc: usize,
    pub cache_num_set: usize,
}

/// The FM-owned LD: allocation bookkeeping plus the CCI responder
struct Fmld {
    ld_count: usize,
    memory_size: u64,
    allocations: StdMutex<Vec<LdAllocation>>,
}

impl Fmld {
    fn new(ld_count: usize, memory_size: u64) -> Self {
        // Every LD starts with its full range-1 allocation
        let granule = memory_size.div_ceil(256 << 20);
        let allocations = vec![
            LdAllocation {
                range1_multiplier: granule,
                range2_multiplier: 0,
            };
            ld_count
        ];
        Self {
            ld_count,
            memory_size,
            allocations: StdMutex::new(allocations),
        }
    }

    fn handle(&self, request: &CciMessage) -> CciMessage {
        let tag = request.header.message_tag();
        match request.opcode() {
            Some(CciOpcode::GetLdInfo) => CciMessage::response(
                tag,
                CciOpcode::GetLdInfo,
                CciReturnCode::Success,
                GetLdInfoResponse {
                    memory_size: self.memory_size * self.ld_count as u64,
                    ld_count: self.ld_count as u16,
                    qos_telemetry_capability: 0,
                }
                .to_bytes(),
            ),
            Some(CciOpcode::GetLdAllocations) => {
                let Ok(req) = GetLdAllocationsRequest::try_from(&request.payload[..]) else {
                    return CciMessage::response(
                        tag,
                        CciOpcode::GetLdAllocations,
                        CciReturnCode::InvalidInput,
                        Vec::new(),
                    );
                };
                let allocations = self.allocations.lock().unwrap();
                let start = usize::from(req.start_ld_id);
                if start >= allocations.len() {
                    return CciMessage::response(
                        tag,
                        CciOpcode::GetLdAllocations,
                        CciReturnCode::InvalidInput,
                        Vec::new(),
                    );
                }
                let end = allocations
                    .len()
                    .min(start + usize::from(req.ld_allocation_list_limit.max(1)));
                let list = LdAllocationList {
                    number_of_lds: allocations.len() as u8,
                    memory_granularity: 0,
                    start_ld_id: req.start_ld_id,
                    allocations: allocations[start..end].to_vec(),
                };
                CciMessage::response(
                    tag,
                    CciOpcode::GetLdAllocations,
                    CciReturnCode::Success,
                    list.to_bytes(),
                )
            }
            Some(CciOpcode::SetLdAllocations) => {
                let Ok(list) = LdAllocationList::try_from(&request.payload[..]) else {
                    return CciMessage::response(
                        tag,
                        CciOpcode::SetLdAllocations,
                        CciReturnCode::InvalidInput,
                        Vec::new(),
                    );
                };
                let mut allocations = self.allocations.lock().unwrap();
                let start = usize::from(list.start_ld_id);
                for (i, allocation) in list.allocations.iter().enumerate() {
                    if let Some(slot) = allocations.get_mut(start + i) {
                        *slot = *allocation;
                    }
                }
                let confirmed = LdAllocationList {
                    number_of_lds: allocations.len() as u8,
                    memory_granularity: 0,
                    start_ld_id: list.start_ld_id,
                    allocations: list.allocations,
                };
                CciMessage::response(
                    tag,
                    CciOpcode::SetLdAllocations,
                    CciReturnCode::Success,
                    confirmed.to_bytes(),
                )
            }
            _ => {
                warn!(opcode = request.header.command_opcode(), "FMLD cannot serve this opcode");
                CciMessage::response(
                    tag,
                    request.opcode().unwrap_or(CciOpcode::GetLdInfo),
                    CciReturnCode::Unsupported,
                    Vec::new(),
                )
            }
        }
    }

    async fn serve(&self, mailbox: &FifoPair<CciMessage>) {
        while let Some(request) = mailbox.host_to_target.recv().await {
            mailbox.target_to_host.send(self.handle(&request));
        }
        debug!("stopped FMLD CCI responder");
    }
}

pub struct MultiLogicalDevice {
    config: MultiLogicalDeviceConfig,
    connections: Vec<CxlConnection>,
    lds: Vec<Arc<CxlType3Device>>,
    fmld: Fmld,
    processor: Mutex<Option<Arc<PacketProcessor>>>,
    lifecycle: Lifecycle,
}

impl MultiLogicalDevice {
    pub fn new(config: MultiLogicalDeviceConfig) -> Self {
        assert!(config.ld_count > 0);
        let connections: Vec<CxlConnection> =
            (0..config.ld_count).map(|_| CxlConnection::new()).collect();
        let lds = connections
            .iter()
            .enumerate()
            .map(|(ld, connection)| {
                let stem = config.memory_file_stem.display();
                Arc::new(CxlType3Device::with_connection(
                    CxlType3DeviceConfig {
                        device_name: format!("{}:ld{ld}", config.device_name),
                        port_index: config.port_index,
                        switch_addr: None,
                        memory_size: config.memory_size,
                        memory_file: PathBuf::from(format!("{stem}-ld{ld}.bin")),
                        cache_num_assoc: config.cache_num_assoc,
                        cache_num_set: config.cache_num_set,
                    },
                    connection.clone(),
                ))
            })
            .collect();
        let fmld = Fmld::new(config.ld_count, config.memory_size);
        Self {
            config,
            connections,
            lds,
            fmld,
            processor: Mutex::new(None),
            lifecycle: Lifecycle::new(),
        }
    }

    pub fn ld_connection(&self, ld: usize) -> Option<&CxlConnection> {
        self.connections.get(ld)
    }

    async fn run_lds(&self) {
        let handles: Vec<_> = self
            .lds
            .iter()
            .map(|ld| {
                let ld = Arc::clone(ld);
                tokio::spawn(async move { ld.run().await })
            })
            .collect();
        for ld in &self.lds {
            ld.wait_for_ready().await;
        }
        self.lifecycle.set_running();
        for handle in handles {
            let _ = handle.await;
        }
    }
}

impl Runnable for MultiLogicalDevice {
    fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    async fn run(&self) {
        match &self.config.switch_addr {
            Some(addr) => {
                let (reader, writer) = match framed::connect(addr, self.config.port_index).await {
                    Ok(split) => split,
                    Err(error) => {
                        error!(%error, "MLD failed to join the fabric");
                        self.lifecycle.set_stopped();
                        return;
                    }
                };
                info!(
                    device = %self.config.device_name,
                    port = self.config.port_index,
                    ld_count = self.config.ld_count,
                    "joined fabric"
                );
                let processor = Arc::new(PacketProcessor::new(
                    reader,
                    writer,
                    self.connections.clone(),
                    DeviceKind::MultiLogicalDevice,
                ));
                *self.processor.lock().await = Some(Arc::clone(&processor));
                let fmld_mailbox = processor
                    .fmld_cci()
                    .expect("an MLD processor always carries the FMLD mailbox")
                    .clone();
                tokio::join!(
                    processor.run(),
                    self.fmld.serve(&fmld_mailbox),
                    self.run_lds(),
                );
            }
            None => self.run_lds().await,
        }
        self.lifecycle.set_stopped();
    }

    async fn stop(&self) {
        for ld in &self.lds {
            ld.stop().await;
        }
        if let Some(processor) = self.processor.lock().await.take() {
            processor.stop().await;
        }
    }
}
