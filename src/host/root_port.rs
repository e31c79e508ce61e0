/*!
Root port driver.

The host's view of one switch link: configuration cycles, MMIO, PCI bus
enumeration and HDM decoder programming, plus raw CXL.mem accesses for
topologies driven without a home agent.

Enumeration walks the fabric top down. The upstream bridge claims bus 1
and gets buses 2..=N for its secondary side; each vPPB bridge appears
as a device on bus 2 and receives one downstream bus for the endpoint
behind it. MMIO is carved from the given base: the USP register BAR
first, then one bridge window per vPPB, endpoint BARs placed at the
bottom of their window.
*/

use std::sync::atomic::{AtomicU8, Ordering};

use tokio::sync::Mutex;
use tokio::time::{timeout, Duration};
use tracing::{debug, info, warn};

use crate::component::connection::CxlConnection;
use crate::pci::config_space::offset;
use crate::pci::mmio::{HDM_CAP_OFFSET, HDM_DECODER_STRIDE, HDM_FIRST_DECODER};
use crate::pci::Bdf;
use crate::transport::cxl_io::CxlIoPacket;
use crate::transport::cxl_mem::{BIRspOpcode, CxlMemPacket};
use crate::transport::CacheLineData;

/// Give-up bound for request/completion round trips
const IO_TIMEOUT: Duration = Duration::from_secs(3);

/// Bus the upstream bridge function lives on
const USP_BUS: u8 = 1;
/// Internal bus carrying the vPPB bridge functions
const INTERNAL_BUS: u8 = 2;
/// Default bridge window per downstream port
const WINDOW_SIZE: u64 = 0x20_0000;
/// The USP register BAR claims the first megabyte of MMIO space
const USP_BAR_SIZE: u64 = 0x10_0000;

/// One function discovered by a scan
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceInfo {
    pub bdf: Bdf,
    pub vid_did: u32,
    pub class_code: u32,
    pub is_bridge: bool,
    pub memory_base: u64,
    pub memory_limit: u64,
    pub secondary_bus: u8,
    pub bar0: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnumerationInfo {
    pub devices: Vec<DeviceInfo>,
}

impl EnumerationInfo {
    pub fn bridges(&self) -> impl Iterator<Item = &DeviceInfo> {
        self.devices.iter().filter(|d| d.is_bridge)
    }

    /// The USP register BAR address, if enumeration placed one
    pub fn usp_bar(&self) -> Option<u64> {
        self.devices
            .iter()
            .find(|d| d.bdf.bus() == USP_BUS)
            .map(|d| u64::from(d.bar0))
    }

    /// Endpoint BAR addresses in vPPB order
    pub fn endpoint_bars(&self) -> Vec<u64> {
        let mut bars: Vec<_> = self
            .devices
            .iter()
            .filter(|d| !d.is_bridge)
            .map(|d| (d.bdf.bus(), u64::from(d.bar0)))
            .collect();
        bars.sort_unstable();
        bars.into_iter().map(|(_, bar)| bar).collect()
    }
}

pub struct RootPort {
    connection: CxlConnection,
    next_tag: AtomicU8,
    /// One outstanding config cycle at a time
    cfg_turn: Mutex<()>,
    /// One outstanding MMIO read at a time
    mmio_turn: Mutex<()>,
}

impl RootPort {
    pub fn new(connection: CxlConnection) -> Self {
        Self {
            connection,
            next_tag: AtomicU8::new(0),
            cfg_turn: Mutex::new(()),
            mmio_turn: Mutex::new(()),
        }
    }

    pub fn connection(&self) -> &CxlConnection {
        &self.connection
    }

    fn tag(&self) -> u8 {
        self.next_tag.fetch_add(1, Ordering::Relaxed)
    }

    /// Config read; `None` on UR or timeout
    pub async fn cfg_read(&self, bdf: Bdf, at: u16) -> Option<u32> {
        let _turn = self.cfg_turn.lock().await;
        let request = CxlIoPacket::cfg_read(bdf, at, self.tag());
        self.connection.cfg.host_to_target.send(request);
        let reply = timeout(IO_TIMEOUT, self.connection.cfg.target_to_host.recv())
            .await
            .ok()??;
        (!reply.is_status_ur()).then(|| reply.completion_value())
    }

    pub async fn cfg_write(&self, bdf: Bdf, at: u16, value: u32) -> bool {
        let _turn = self.cfg_turn.lock().await;
        let request = CxlIoPacket::cfg_write(bdf, at, self.tag(), value);
        self.connection.cfg.host_to_target.send(request);
        match timeout(IO_TIMEOUT, self.connection.cfg.target_to_host.recv()).await {
            Ok(Some(reply)) => !reply.is_status_ur(),
            _ => false,
        }
    }

    pub async fn read_vid_did(&self, bdf: Bdf) -> Option<u32> {
        self.cfg_read(bdf, offset::VENDOR_ID).await
    }

    /// 32-bit MMIO read; `None` only when nothing answered (a frozen or
    /// dead path), 0 for an Unsupported Request completion
    pub async fn read_mmio(&self, addr: u64) -> Option<u32> {
        let _turn = self.mmio_turn.lock().await;
        let request = CxlIoPacket::mem_read(addr, 4, self.tag());
        self.connection.mmio.host_to_target.send(request);
        let reply = timeout(IO_TIMEOUT, self.connection.mmio.target_to_host.recv())
            .await
            .ok()??;
        Some(reply.completion_value())
    }

    /// Posted 32-bit MMIO write
    pub fn write_mmio(&self, addr: u64, value: u32) {
        let request = CxlIoPacket::mem_write(addr, &value.to_le_bytes(), self.tag());
        self.connection.mmio.host_to_target.send(request);
    }

    /// Raw CXL.mem read, for hosts driving the link without a home
    /// agent in between
    pub async fn cxl_mem_read(&self, addr: u64) -> Option<CacheLineData> {
        self.connection
            .cxl_mem
            .host_to_target
            .send(CxlMemPacket::mem_rd(addr, 0));
        loop {
            let reply = timeout(IO_TIMEOUT, self.connection.cxl_mem.target_to_host.recv())
                .await
                .ok()??;
            match reply {
                CxlMemPacket::S2MDrs(_, data) => return Some(data),
                CxlMemPacket::S2MNdr(_) => continue,
                other => {
                    warn!(?other, "unexpected CXL.mem reply");
                    return None;
                }
            }
        }
    }

    pub async fn cxl_mem_write(&self, addr: u64, data: CacheLineData) -> bool {
        self.connection
            .cxl_mem
            .host_to_target
            .send(CxlMemPacket::mem_wr(addr, data, 0));
        matches!(
            timeout(IO_TIMEOUT, self.connection.cxl_mem.target_to_host.recv()).await,
            Ok(Some(CxlMemPacket::S2MNdr(_)))
        )
    }

    pub fn cxl_mem_birsp(&self, opcode: BIRspOpcode, bi_id: u16, bi_tag: u16) {
        self.connection
            .cxl_mem
            .host_to_target
            .send(CxlMemPacket::birsp(opcode, bi_id, bi_tag));
    }

    async fn size_bar0(&self, bdf: Bdf) -> u64 {
        self.cfg_write(bdf, offset::BAR0, 0xFFFF_FFFF).await;
        match self.cfg_read(bdf, offset::BAR0).await {
            Some(0) | None => 0,
            Some(mask) => u64::from(!mask) + 1,
        }
    }

    /// Assigns bus numbers, sizes BARs and programs bridge windows from
    /// `mmio_base` upward, then reports what it placed
    pub async fn enumerate(&self, mmio_base: u64) -> Option<EnumerationInfo> {
        // The first probe claims the upstream bridge function
        self.read_vid_did(Bdf::new(USP_BUS, 0, 0)).await?;
        let usp = Bdf::new(USP_BUS, 0, 0);
        self.cfg_write(
            usp,
            offset::PRIMARY_BUS,
            u32::from_le_bytes([USP_BUS, INTERNAL_BUS, 0xFF, 0]),
        )
        .await;

        let usp_bar_size = self.size_bar0(usp).await.max(USP_BAR_SIZE);
        self.cfg_write(usp, offset::BAR0, mmio_base as u32).await;
        let mut next_mmio = mmio_base + usp_bar_size;
        let mut next_bus = INTERNAL_BUS + 1;

        for device in 0..32u8 {
            let bridge = Bdf::new(INTERNAL_BUS, device, 0);
            if self.read_vid_did(bridge).await.is_none() {
                break;
            }
            self.cfg_write(
                bridge,
                offset::PRIMARY_BUS,
                u32::from_le_bytes([INTERNAL_BUS, next_bus, next_bus, 0]),
            )
            .await;

            let window_base = next_mmio;
            // Endpoint behind this bridge, when one is bound
            let endpoint = Bdf::new(next_bus, 0, 0);
            let mut window_size = WINDOW_SIZE;
            if self.read_vid_did(endpoint).await.is_some() {
                let bar_size = self.size_bar0(endpoint).await;
                if bar_size > 0 {
                    self.cfg_write(endpoint, offset::BAR0, window_base as u32)
                        .await;
                    window_size = window_size.max(bar_size.next_multiple_of(0x10_0000));
                }
            }
            let limit = window_base + window_size - 0x10_0000;
            // Base and limit share one DW
            let window = (window_base >> 16) as u32 | ((limit >> 16) as u32) << 16;
            self.cfg_write(bridge, offset::MEMORY_BASE, window).await;
            debug!(%bridge, window_base, window_size, "programmed bridge window");

            next_mmio += window_size;
            next_bus += 1;
        }
        // Rewrite the whole bus-number DW with the final subordinate
        self.cfg_write(
            usp,
            offset::PRIMARY_BUS,
            u32::from_le_bytes([USP_BUS, INTERNAL_BUS, next_bus - 1, 0]),
        )
        .await;
        let info = self.scan_devices().await;
        info!(functions = info.devices.len(), "enumeration complete");
        Some(info)
    }

    /// Read-only walk of what the last enumeration left behind
    pub async fn scan_devices(&self) -> EnumerationInfo {
        let mut devices = Vec::new();
        if let Some(usp) = self.scan_function(Bdf::new(USP_BUS, 0, 0)).await {
            devices.push(usp);
        }
        for device in 0..32u8 {
            let bdf = Bdf::new(INTERNAL_BUS, device, 0);
            let Some(bridge) = self.scan_function(bdf).await else {
                break;
            };
            let secondary = bridge.secondary_bus;
            devices.push(bridge);
            if secondary != 0 {
                if let Some(endpoint) = self.scan_function(Bdf::new(secondary, 0, 0)).await {
                    devices.push(endpoint);
                }
            }
        }
        EnumerationInfo { devices }
    }

    async fn scan_function(&self, bdf: Bdf) -> Option<DeviceInfo> {
        let vid_did = self.read_vid_did(bdf).await?;
        let class_code = self.cfg_read(bdf, offset::REVISION_AND_CLASS).await? >> 8;
        let header_type = self.cfg_read(bdf, 0x0C).await? >> 16 & 0x7F;
        let is_bridge = header_type == 0x01;
        let (memory_base, memory_limit, secondary_bus) = if is_bridge {
            let window = self.cfg_read(bdf, offset::MEMORY_BASE).await?;
            let base = u64::from(window & 0xFFF0) << 16;
            let limit = u64::from(window >> 16 & 0xFFF0) << 16 | 0xF_FFFF;
            let buses = self.cfg_read(bdf, offset::PRIMARY_BUS).await?;
            (base, limit, (buses >> 8 & 0xFF) as u8)
        } else {
            (0, 0, 0)
        };
        let bar0 = self.cfg_read(bdf, offset::BAR0).await?;
        Some(DeviceInfo {
            bdf,
            vid_did,
            class_code,
            is_bridge,
            memory_base,
            memory_limit,
            secondary_bus,
            bar0,
        })
    }

    async fn program_decoder(
        &self,
        block_base: u64,
        index: usize,
        base: u64,
        size: u64,
        targets: u64,
    ) {
        let slot = block_base + HDM_CAP_OFFSET + HDM_FIRST_DECODER + index as u64 * HDM_DECODER_STRIDE;
        self.write_mmio(slot, base as u32);
        self.write_mmio(slot + 0x04, (base >> 32) as u32);
        self.write_mmio(slot + 0x08, size as u32);
        self.write_mmio(slot + 0x0C, (size >> 32) as u32);
        self.write_mmio(slot + 0x14, targets as u32);
        self.write_mmio(slot + 0x18, (targets >> 32) as u32);
        // 1-way, 256 B granularity, commit
        self.write_mmio(slot + 0x10, 1 << 9);
    }

    async fn enable_decoders(&self, block_base: u64) {
        self.write_mmio(block_base + HDM_CAP_OFFSET + 4, 0b10);
    }

    /// Programs one 1-way decoder per endpoint: the switch decoder `i`
    /// targets vPPB `i`, the device decoder maps the same HPA window.
    /// Returns the HPA ranges assigned, in vPPB order.
    pub async fn configure_hdm_decoders(
        &self,
        info: &EnumerationInfo,
        hpa_base: u64,
        device_size: u64,
    ) -> Vec<(u64, u64)> {
        let Some(usp_bar) = info.usp_bar() else {
            return Vec::new();
        };
        self.enable_decoders(usp_bar).await;
        let mut assigned = Vec::new();
        for (index, endpoint_bar) in info.endpoint_bars().into_iter().enumerate() {
            let base = hpa_base + index as u64 * device_size;
            self.program_decoder(usp_bar, index, base, device_size, index as u64)
                .await;
            if endpoint_bar != 0 {
                self.enable_decoders(endpoint_bar).await;
                self.program_decoder(endpoint_bar, 0, base, device_size, 0)
                    .await;
                // Writes are posted; a read flushes them before any
                // CXL.mem traffic relies on the commits
                self.read_mmio(endpoint_bar + HDM_CAP_OFFSET).await;
            }
            assigned.push((base, device_size));
        }
        self.read_mmio(usp_bar + HDM_CAP_OFFSET).await;
        assigned
    }
}
