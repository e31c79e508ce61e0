/*!
Virtual switch routing fabric.

One virtual switch owns the upstream-facing bridge function (the USP
bridge config space plus its register BAR with the switch HDM
decoders), a bank of vPPB bridge config spaces, and the binding state
machine that splices a vPPB to a physical downstream port at runtime.

Routing rules, per sublayer:

- CXL.io config: requests whose destination bus equals the USP
  secondary bus address a vPPB by device number; buses deeper in the
  USP's secondary..subordinate range route through the vPPB whose
  bridge claims them; everything else that isn't the USP function
  itself completes as Unsupported Request.
- CXL.io memory: the USP register BAR is claimed first, then each
  vPPB's bridge window; unmatched reads complete UR, unmatched writes
  are posted and die quietly. A frozen vPPB drops both silently.
- CXL.mem: the switch HDM decoder picks the target,
  `target_ports[(hpa / ig) mod iw]`, the target list naming vPPBs;
  BIRsp routes by its `bi_id`, which the upstream splice rewrote to
  the ingress vPPB on the way up.
- CXL.cache: H2D routes by `cache_id`, falling back to the first
  bound vPPB.

Binding a vPPB spawns splice pumps that connect the vPPB's downlink
queues to the physical port's queues; the packets of a bound logical
device get their `ld_id` stamped on the way down. Unbinding (or a port
disconnect event) stops the pumps and the vPPB routes UR again, while
its bridge registers keep their programmed values — re-enumeration
after a detach sees the same windows.
*/

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex as StdMutex;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::component::connection::CxlConnection;
use crate::component::fifo::Fifo;
use crate::component::lifecycle::{Lifecycle, Runnable};
use crate::pci::{Bdf, ConfigSpace, SwitchMmio, SW_DSP_DID, SW_USP_DID, VENDOR_ID};
use crate::switch::connection_manager::PortUpdateEvent;
use crate::switch::{PhysicalPort, PortKind, SwitchConfigError};
use crate::transport::cxl_io::{CplStatus, CxlIoPacket};
use crate::transport::cxl_mem::CxlMemPacket;
use crate::transport::CxlCachePacket;

/// USP register BAR size; the bridge window arithmetic of the
/// enumeration scenarios depends on it
pub const USP_BAR_SIZE: u32 = 0x10_0000;
/// HDM decoders the upstream port advertises
pub const USP_DECODER_COUNT: usize = 32;

#[derive(Debug, Clone)]
pub struct VirtualSwitchConfig {
    pub vcs_id: u8,
    pub upstream_port_index: u8,
    pub vppb_count: usize,
    /// Per-vPPB physical port bound at startup; produces enumeration
    /// results identical to runtime binds
    pub initial_binds: Vec<Option<u8>>,
}

struct Binding {
    port_index: u8,
    ld_id: u8,
    stop: watch::Sender<bool>,
    pumps: Vec<JoinHandle<()>>,
}

struct Vppb {
    bridge: StdMutex<ConfigSpace>,
    /// (bus, device) this bridge function answered to, captured from
    /// the first claimed config access
    captured: StdMutex<Option<(u8, u8)>>,
    binding: StdMutex<Option<Binding>>,
    frozen: AtomicBool,
    /// Switch-side queue bundle; a bind splices it to a physical port
    downlink: CxlConnection,
}

/// Snapshot of one vPPB for the fabric-manager surface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VppbSnapshot {
    pub bound_port: Option<u8>,
    pub ld_id: u8,
    pub frozen: bool,
}

pub struct VirtualSwitch {
    config: VirtualSwitchConfig,
    ports: Vec<PhysicalPort>,
    port_connected: Vec<AtomicBool>,
    usp_bridge: StdMutex<ConfigSpace>,
    usp_captured: StdMutex<Option<(u8, u8)>>,
    usp_mmio: StdMutex<SwitchMmio>,
    vppbs: Vec<Vppb>,
    port_events: Fifo<PortUpdateEvent>,
    lifecycle: Lifecycle,
}

enum CfgTarget {
    Usp,
    Vppb(usize),
    Below(usize),
    Unsupported,
}

impl VirtualSwitch {
    /// `port_events` feeds connection state changes in; an unused fifo
    /// is fine for fully in-process topologies.
    pub fn new(
        config: VirtualSwitchConfig,
        ports: Vec<PhysicalPort>,
        port_events: Fifo<PortUpdateEvent>,
    ) -> Result<Self, SwitchConfigError> {
        let upstream = usize::from(config.upstream_port_index);
        let port = ports
            .get(upstream)
            .ok_or(SwitchConfigError::PortOutOfRange {
                port: config.upstream_port_index,
            })?;
        if port.kind != PortKind::Usp {
            return Err(SwitchConfigError::PortNotUsp {
                port: config.upstream_port_index,
            });
        }
        if config.initial_binds.len() != config.vppb_count {
            return Err(SwitchConfigError::InitialBindCount {
                expected: config.vppb_count,
                got: config.initial_binds.len(),
            });
        }
        let vppbs = (0..config.vppb_count)
            .map(|_| Vppb {
                bridge: StdMutex::new(ConfigSpace::bridge(VENDOR_ID, SW_DSP_DID, 0)),
                captured: StdMutex::new(None),
                binding: StdMutex::new(None),
                frozen: AtomicBool::new(false),
                downlink: CxlConnection::new(),
            })
            .collect();
        let port_connected = ports.iter().map(|_| AtomicBool::new(false)).collect();
        Ok(Self {
            usp_bridge: StdMutex::new(ConfigSpace::bridge(VENDOR_ID, SW_USP_DID, USP_BAR_SIZE)),
            usp_captured: StdMutex::new(None),
            usp_mmio: StdMutex::new(SwitchMmio::new(USP_BAR_SIZE as usize, USP_DECODER_COUNT)),
            vppbs,
            ports,
            port_connected,
            config,
            port_events,
            lifecycle: Lifecycle::new(),
        })
    }

    pub fn vcs_id(&self) -> u8 {
        self.config.vcs_id
    }

    pub fn upstream_port_index(&self) -> u8 {
        self.config.upstream_port_index
    }

    pub fn port_count(&self) -> usize {
        self.ports.len()
    }

    pub fn port_kind(&self, port: u8) -> Option<PortKind> {
        self.ports.get(usize::from(port)).map(|p| p.kind)
    }

    pub fn port_connection(&self, port: u8) -> Option<&CxlConnection> {
        self.ports.get(usize::from(port)).map(|p| &p.connection)
    }

    pub fn is_port_connected(&self, port: u8) -> bool {
        self.port_connected
            .get(usize::from(port))
            .is_some_and(|c| c.load(Ordering::Relaxed))
    }

    pub fn vppb_count(&self) -> usize {
        self.vppbs.len()
    }

    pub fn vppb_snapshot(&self, vppb_index: usize) -> Option<VppbSnapshot> {
        let vppb = self.vppbs.get(vppb_index)?;
        let binding = vppb.binding.lock().unwrap();
        Some(VppbSnapshot {
            bound_port: binding.as_ref().map(|b| b.port_index),
            ld_id: binding.as_ref().map(|b| b.ld_id).unwrap_or(0),
            frozen: vppb.frozen.load(Ordering::Relaxed),
        })
    }

    /// Attaches physical DSP `port_index` to `vppb_index`, splicing the
    /// port's queues to the vPPB downlink
    pub fn bind_vppb(
        &self,
        port_index: u8,
        vppb_index: usize,
        ld_id: u8,
    ) -> Result<(), SwitchConfigError> {
        let port = self
            .ports
            .get(usize::from(port_index))
            .ok_or(SwitchConfigError::PortOutOfRange { port: port_index })?;
        if port.kind != PortKind::Dsp {
            return Err(SwitchConfigError::PortNotDsp { port: port_index });
        }
        let vppb = self
            .vppbs
            .get(vppb_index)
            .ok_or(SwitchConfigError::VppbOutOfRange { vppb: vppb_index })?;
        for (other_index, other) in self.vppbs.iter().enumerate() {
            if let Some(binding) = other.binding.lock().unwrap().as_ref() {
                if binding.port_index == port_index {
                    return Err(SwitchConfigError::PortAlreadyBound {
                        port: port_index,
                        vppb: other_index,
                    });
                }
            }
        }
        let mut slot = vppb.binding.lock().unwrap();
        if slot.is_some() {
            return Err(SwitchConfigError::VppbAlreadyBound { vppb: vppb_index });
        }
        let (stop, _) = watch::channel(false);
        let pumps = splice(&vppb.downlink, &port.connection, vppb_index, ld_id, &stop);
        *slot = Some(Binding {
            port_index,
            ld_id,
            stop,
            pumps,
        });
        info!(port_index, vppb_index, ld_id, "bound vPPB");
        Ok(())
    }

    /// Detaches the vPPB and quiesces the splice. Bridge registers are
    /// untouched, so the host still sees the window it programmed.
    pub async fn unbind_vppb(&self, vppb_index: usize) -> Result<(), SwitchConfigError> {
        let vppb = self
            .vppbs
            .get(vppb_index)
            .ok_or(SwitchConfigError::VppbOutOfRange { vppb: vppb_index })?;
        let binding = vppb
            .binding
            .lock()
            .unwrap()
            .take()
            .ok_or(SwitchConfigError::VppbNotBound { vppb: vppb_index })?;
        let _ = binding.stop.send(true);
        for pump in binding.pumps {
            let _ = pump.await;
        }
        info!(vppb_index, port_index = binding.port_index, "unbound vPPB");
        Ok(())
    }

    pub fn freeze_vppb(&self, vppb_index: usize) -> Result<(), SwitchConfigError> {
        self.set_frozen(vppb_index, true)
    }

    pub fn unfreeze_vppb(&self, vppb_index: usize) -> Result<(), SwitchConfigError> {
        self.set_frozen(vppb_index, false)
    }

    fn set_frozen(&self, vppb_index: usize, frozen: bool) -> Result<(), SwitchConfigError> {
        let vppb = self
            .vppbs
            .get(vppb_index)
            .ok_or(SwitchConfigError::VppbOutOfRange { vppb: vppb_index })?;
        vppb.frozen.store(frozen, Ordering::Relaxed);
        Ok(())
    }

    fn vppb_bound_to_port(&self, port_index: u8) -> Option<usize> {
        self.vppbs.iter().position(|vppb| {
            vppb.binding
                .lock()
                .unwrap()
                .as_ref()
                .is_some_and(|b| b.port_index == port_index)
        })
    }

    fn cfg_target(&self, bdf: Bdf) -> CfgTarget {
        let (secondary, routes_below) = {
            let usp = self.usp_bridge.lock().unwrap();
            (usp.secondary_bus(), usp.routes_bus(bdf.bus()))
        };
        let captured = *self.usp_captured.lock().unwrap();
        if captured == Some((bdf.bus(), bdf.device())) {
            return CfgTarget::Usp;
        }
        if routes_below {
            if bdf.bus() == secondary {
                if usize::from(bdf.device()) < self.vppbs.len() {
                    return CfgTarget::Vppb(usize::from(bdf.device()));
                }
                return CfgTarget::Unsupported;
            }
            if let Some(index) = self
                .vppbs
                .iter()
                .position(|vppb| vppb.bridge.lock().unwrap().routes_bus(bdf.bus()))
            {
                return CfgTarget::Below(index);
            }
            return CfgTarget::Unsupported;
        }
        if captured.is_none() {
            // First probe claims the USP function
            return CfgTarget::Usp;
        }
        CfgTarget::Unsupported
    }

    fn serve_cfg(
        &self,
        space: &StdMutex<ConfigSpace>,
        captured: &StdMutex<Option<(u8, u8)>>,
        io: &CxlIoPacket,
    ) -> CxlIoPacket {
        let CxlIoPacket::Cfg(cfg) = io else {
            unreachable!("cfg router only sees config requests");
        };
        let bdf = Bdf::from(cfg.header.dest_id());
        let req_id = cfg.header.req_id();
        let tag = cfg.header.tag();
        if bdf.function() != 0 {
            return CxlIoPacket::completion(req_id, tag, CplStatus::UnsupportedRequest);
        }
        captured
            .lock()
            .unwrap()
            .get_or_insert((bdf.bus(), bdf.device()));
        let at = cfg.header.register_offset();
        match cfg.data {
            Some(value) => {
                space.lock().unwrap().write(at, 4, value);
                CxlIoPacket::completion(req_id, tag, CplStatus::SuccessfulCompletion)
            }
            None => {
                let value = space.lock().unwrap().read(at, 4);
                CxlIoPacket::completion_with_data(req_id, tag, &value.to_le_bytes())
            }
        }
    }

    async fn route_cfg(&self) {
        let inbound = &self.usp_conn().cfg.host_to_target;
        let outbound = &self.usp_conn().cfg.target_to_host;
        while let Some(io) = inbound.recv().await {
            if !io.is_cfg() {
                warn!("non-config packet on the config channel");
                continue;
            }
            let CxlIoPacket::Cfg(ref cfg) = io else {
                continue;
            };
            let bdf = Bdf::from(cfg.header.dest_id());
            let reply = match self.cfg_target(bdf) {
                CfgTarget::Usp => {
                    Some(self.serve_cfg(&self.usp_bridge, &self.usp_captured, &io))
                }
                CfgTarget::Vppb(index) => {
                    let vppb = &self.vppbs[index];
                    Some(self.serve_cfg(&vppb.bridge, &vppb.captured, &io))
                }
                CfgTarget::Below(index) => {
                    let vppb = &self.vppbs[index];
                    let bound = vppb.binding.lock().unwrap().as_ref().map(|b| b.ld_id);
                    match bound {
                        Some(ld_id) => {
                            let mut forwarded = io.clone();
                            forwarded.set_ld_id(ld_id.into());
                            vppb.downlink.cfg.host_to_target.send(forwarded);
                            None
                        }
                        None => Some(CxlIoPacket::completion(
                            cfg.header.req_id(),
                            cfg.header.tag(),
                            CplStatus::UnsupportedRequest,
                        )),
                    }
                }
                CfgTarget::Unsupported => Some(CxlIoPacket::completion(
                    cfg.header.req_id(),
                    cfg.header.tag(),
                    CplStatus::UnsupportedRequest,
                )),
            };
            if let Some(reply) = reply {
                outbound.send(reply);
            }
        }
        debug!("stopped config router");
    }

    fn usp_conn(&self) -> &CxlConnection {
        &self.ports[usize::from(self.config.upstream_port_index)].connection
    }

    fn usp_bar_contains(&self, addr: u64) -> bool {
        let usp = self.usp_bridge.lock().unwrap();
        let bar = u64::from(usp.bar(0));
        bar != 0 && bar <= addr && addr < bar + u64::from(usp.bar_size(0))
    }

    fn serve_usp_mmio(&self, io: &CxlIoPacket) -> Option<CxlIoPacket> {
        let CxlIoPacket::Mem(mem) = io else {
            return None;
        };
        let bar = u64::from(self.usp_bridge.lock().unwrap().bar(0));
        let at = mem.header.address() - bar;
        let mut block = self.usp_mmio.lock().unwrap();
        if io.is_mem_write() {
            match mem.data.len() {
                8 => block.write64(at, u64::from_le_bytes(mem.data[..8].try_into().unwrap())),
                4 => block.write32(at, u32::from_le_bytes(mem.data[..4].try_into().unwrap())),
                other => warn!(other, "unsupported MMIO write width"),
            }
            return None;
        }
        let bytes = match mem.dw0.length_dw() {
            2 => block.read64(at).to_le_bytes().to_vec(),
            _ => block.read32(at).to_le_bytes().to_vec(),
        };
        Some(CxlIoPacket::completion_with_data(
            mem.header.req_id(),
            mem.header.tag(),
            &bytes,
        ))
    }

    async fn route_mmio(&self) {
        let inbound = &self.usp_conn().mmio.host_to_target;
        let outbound = &self.usp_conn().mmio.target_to_host;
        while let Some(io) = inbound.recv().await {
            if !io.is_mmio() {
                warn!("non-memory packet on the MMIO channel");
                continue;
            }
            let CxlIoPacket::Mem(ref mem) = io else {
                continue;
            };
            let addr = mem.header.address();
            if self.usp_bar_contains(addr) {
                if let Some(reply) = self.serve_usp_mmio(&io) {
                    outbound.send(reply);
                }
                continue;
            }
            let target = self
                .vppbs
                .iter()
                .position(|vppb| vppb.bridge.lock().unwrap().window_contains(addr));
            match target {
                Some(index) => {
                    let vppb = &self.vppbs[index];
                    if vppb.frozen.load(Ordering::Relaxed) {
                        debug!(addr, vppb = index, "frozen vPPB, dropping CXL.io");
                        continue;
                    }
                    let bound = vppb.binding.lock().unwrap().as_ref().map(|b| b.ld_id);
                    match bound {
                        Some(ld_id) => {
                            let mut forwarded = io.clone();
                            forwarded.set_ld_id(ld_id.into());
                            vppb.downlink.mmio.host_to_target.send(forwarded);
                        }
                        None if !io.is_mem_write() => outbound.send(CxlIoPacket::completion(
                            mem.header.req_id(),
                            mem.header.tag(),
                            CplStatus::UnsupportedRequest,
                        )),
                        None => {}
                    }
                }
                None if !io.is_mem_write() => outbound.send(CxlIoPacket::completion(
                    mem.header.req_id(),
                    mem.header.tag(),
                    CplStatus::UnsupportedRequest,
                )),
                None => {}
            }
        }
        debug!("stopped MMIO router");
    }

    fn forward_mem_to_vppb(&self, vppb_index: usize, mut mem: CxlMemPacket) {
        match self.vppbs.get(vppb_index) {
            Some(vppb) => {
                let bound = vppb.binding.lock().unwrap().as_ref().map(|b| b.ld_id);
                match bound {
                    Some(ld_id) => {
                        mem.set_ld_id(ld_id);
                        vppb.downlink.cxl_mem.host_to_target.send(mem);
                    }
                    None => warn!(vppb_index, "CXL.mem target vPPB is not bound"),
                }
            }
            None => warn!(vppb_index, "CXL.mem target vPPB does not exist"),
        }
    }

    /// M2S requests follow the switch HDM decoder, whose target list
    /// holds vPPB indices; BIRsp follows the `bi_id` the upstream
    /// splice stamped onto the BISnp it answers
    async fn route_mem(&self) {
        let inbound = &self.usp_conn().cxl_mem.host_to_target;
        while let Some(mem) = inbound.recv().await {
            match &mem {
                CxlMemPacket::M2SReq(_) | CxlMemPacket::M2SRwD(..) => {
                    let addr = mem.address().unwrap_or(0);
                    let target = self.usp_mmio.lock().unwrap().decoders().get_target(addr);
                    match target {
                        Some(vppb) => self.forward_mem_to_vppb(vppb.into(), mem),
                        None => warn!(addr, "no HDM decoder claims this HPA"),
                    }
                }
                CxlMemPacket::M2SBIRsp(header) => {
                    let vppb = usize::from(header.bi_id());
                    self.forward_mem_to_vppb(vppb, mem);
                }
                _ => warn!("unexpected S2M packet on the downstream path"),
            }
        }
        debug!("stopped CXL.mem router");
    }

    async fn route_cache(&self) {
        let inbound = &self.usp_conn().cxl_cache.host_to_target;
        while let Some(cache) = inbound.recv().await {
            let cache_id = match &cache {
                CxlCachePacket::H2DReq(h) => usize::from(h.cache_id()),
                CxlCachePacket::H2DRsp(h) => usize::from(h.cache_id()),
                CxlCachePacket::H2DData(h, _) => usize::from(h.cache_id()),
                _ => {
                    warn!("unexpected D2H packet on the downstream path");
                    continue;
                }
            };
            let target = self
                .vppbs
                .get(cache_id)
                .filter(|vppb| vppb.binding.lock().unwrap().is_some())
                .map(|_| cache_id)
                .or_else(|| {
                    self.vppbs
                        .iter()
                        .position(|vppb| vppb.binding.lock().unwrap().is_some())
                });
            match target {
                Some(index) => self.vppbs[index]
                    .downlink
                    .cxl_cache
                    .host_to_target
                    .send(cache),
                None => warn!(cache_id, "CXL.cache packet with no bound vPPB"),
            }
        }
        debug!("stopped CXL.cache router");
    }

    async fn consume_port_events(&self) {
        while let Some(event) = self.port_events.recv().await {
            info!(port = event.port_id, connected = event.connected, "port update");
            if let Some(flag) = self.port_connected.get(usize::from(event.port_id)) {
                flag.store(event.connected, Ordering::Relaxed);
            }
            if !event.connected {
                // Detach so traffic toward the dead port completes UR
                // instead of queueing forever
                if let Some(vppb_index) = self.vppb_bound_to_port(event.port_id) {
                    if let Err(error) = self.unbind_vppb(vppb_index).await {
                        warn!(%error, "auto-unbind after disconnect failed");
                    }
                }
            }
        }
    }

    /// Uplink pumps: everything a vPPB's downlink produces toward the
    /// host flows into the USP connection
    fn spawn_uplinks(&self) -> Vec<JoinHandle<()>> {
        let usp = self.usp_conn().clone();
        let mut handles = Vec::new();
        for vppb in &self.vppbs {
            let down = vppb.downlink.clone();
            handles.push(uplink(down.cfg.target_to_host.clone(), usp.cfg.target_to_host.clone()));
            handles.push(uplink(
                down.mmio.target_to_host.clone(),
                usp.mmio.target_to_host.clone(),
            ));
            handles.push(uplink(
                down.cxl_mem.target_to_host.clone(),
                usp.cxl_mem.target_to_host.clone(),
            ));
            handles.push(uplink(
                down.cxl_cache.target_to_host.clone(),
                usp.cxl_cache.target_to_host.clone(),
            ));
        }
        handles
    }
}

/// Forwards one queue into another until the source disconnects
fn uplink<T: Send + 'static>(from: Fifo<T>, to: Fifo<T>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(item) = from.recv().await {
            to.send(item);
        }
    })
}

fn pump<T, F>(from: Fifo<T>, to: Fifo<T>, stop: &watch::Sender<bool>, mut map: F) -> JoinHandle<()>
where
    T: Send + 'static,
    F: FnMut(T) -> T + Send + 'static,
{
    let mut stop = stop.subscribe();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = stop.changed() => break,
                item = from.recv() => match item {
                    Some(value) => to.send(map(value)),
                    None => break,
                },
            }
        }
    })
}

/// The binding processor: splices a vPPB downlink to a physical DSP
/// port, stamping the bound `ld_id` onto downstream packets and the
/// ingress vPPB index onto upstream BISnp so the BIRsp can find its
/// way back
fn splice(
    downlink: &CxlConnection,
    port: &CxlConnection,
    vppb_index: usize,
    ld_id: u8,
    stop: &watch::Sender<bool>,
) -> Vec<JoinHandle<()>> {
    let stamp_io = move |mut io: CxlIoPacket| {
        io.set_ld_id(ld_id.into());
        io
    };
    let stamp_mem = move |mut mem: CxlMemPacket| {
        mem.set_ld_id(ld_id);
        mem
    };
    let rewrite_bisnp = move |mut mem: CxlMemPacket| {
        if let CxlMemPacket::S2MBISnp(header) = &mut mem {
            header.set_bi_id(vppb_index as u16);
        }
        mem
    };
    vec![
        // Downstream
        pump(
            downlink.cfg.host_to_target.clone(),
            port.cfg.host_to_target.clone(),
            stop,
            stamp_io,
        ),
        pump(
            downlink.mmio.host_to_target.clone(),
            port.mmio.host_to_target.clone(),
            stop,
            stamp_io,
        ),
        pump(
            downlink.cxl_mem.host_to_target.clone(),
            port.cxl_mem.host_to_target.clone(),
            stop,
            stamp_mem,
        ),
        pump(
            downlink.cxl_cache.host_to_target.clone(),
            port.cxl_cache.host_to_target.clone(),
            stop,
            |cache| cache,
        ),
        // Upstream
        pump(
            port.cfg.target_to_host.clone(),
            downlink.cfg.target_to_host.clone(),
            stop,
            |io| io,
        ),
        pump(
            port.mmio.target_to_host.clone(),
            downlink.mmio.target_to_host.clone(),
            stop,
            |io| io,
        ),
        pump(
            port.cxl_mem.target_to_host.clone(),
            downlink.cxl_mem.target_to_host.clone(),
            stop,
            rewrite_bisnp,
        ),
        pump(
            port.cxl_cache.target_to_host.clone(),
            downlink.cxl_cache.target_to_host.clone(),
            stop,
            |cache| cache,
        ),
        // The CCI mailbox stays with the fabric manager; management
        // traffic toward a logical device goes through the tunnel
        // command, not through the vPPB splice
    ]
}

impl Runnable for VirtualSwitch {
    fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    async fn run(&self) {
        for (vppb_index, bind) in self.config.initial_binds.clone().into_iter().enumerate() {
            if let Some(port_index) = bind {
                if let Err(error) = self.bind_vppb(port_index, vppb_index, 0) {
                    warn!(%error, vppb_index, "initial bind failed");
                }
            }
        }
        let uplinks = self.spawn_uplinks();
        self.lifecycle.set_running();
        tokio::join!(
            self.route_cfg(),
            self.route_mmio(),
            self.route_mem(),
            self.route_cache(),
            self.consume_port_events(),
        );
        for uplink in uplinks {
            uplink.abort();
        }
        self.lifecycle.set_stopped();
    }

    async fn stop(&self) {
        let usp = self.usp_conn();
        usp.cfg.host_to_target.disconnect();
        usp.mmio.host_to_target.disconnect();
        usp.cxl_mem.host_to_target.disconnect();
        usp.cxl_cache.host_to_target.disconnect();
        self.port_events.disconnect();
        for index in 0..self.vppbs.len() {
            let _ = self.unbind_vppb(index).await;
        }
    }
}
