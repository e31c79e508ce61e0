/*!
Device coherency engine.

The responder side of the CXL.mem protocol, mirroring the host's home
agent. Incoming M2S is demultiplexed by opcode and metadata:

| request | flavour | reply |
|---|---|---|
| MemRd, NoOp/Any | HDM-H plain read | DRS only |
| MemRd, SnpData + Meta0 Shared | HDM-DB shared read | Cmp-S + DRS, or Cmp-E + DRS when the device held the line dirty |
| MemInv, SnpInv | host ownership grab | Cmp-E, device line invalidated |
| MemRd, SnpCur | non-caching observation | Cmp + DRS, no state change |
| MemWr, NoOp/Any | HDM-H plain write | Cmp |
| MemWr, Meta0 Invalid | HDM-DB flush write | Cmp |

Addresses arrive as HPAs and pass through the device HDM decoder; an
HPA no decoder claims is taken as a DPA unchanged, which is what a
bare device on a dedicated link sees.

The engine also initiates back-invalidate: `request_back_invalidate`
sends a BISnp toward the host and holds off M2S service for that line
until the BIRsp lands.

The NDR metadata of the SnpCur reply deserves a note: the non-data
`Cmp` shape follows from the protocol, but real traffic rarely
exercises it and the metadata the completion should echo is
underspecified; it is emitted with Any so the paired DRS is always
collected.
*/

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::{oneshot, Notify};
use tokio::time::{timeout, Duration};
use tracing::{debug, error, warn};

use crate::cache::{CacheFifoPair, CacheRequest, CacheRequestKind, CacheResponse, CacheResponseStatus};
use crate::component::fifo::FifoPair;
use crate::component::lifecycle::{Lifecycle, Runnable};
use crate::memory::MemoryFifoPair;
use crate::pci::DeviceMmio;
use crate::transport::cxl_mem::{
    BIRspOpcode, BISnpOpcode, CxlMemPacket, M2SReqHeader, M2SRwDHeader, MemOpcode, MetaField,
    MetaValue, NdrOpcode, SnpType,
};
use crate::transport::CacheLineData;

const BIRSP_TIMEOUT: Duration = Duration::from_secs(3);

pub struct Dcoh {
    name: String,
    upstream: FifoPair<CxlMemPacket>,
    /// Requests the device cache issues toward its memory
    cache_requests: CacheFifoPair,
    /// Snoops this engine issues against the device cache
    cache_snoops: CacheFifoPair,
    /// The register block owning the device HDM decoders
    mmio: Arc<StdMutex<DeviceMmio>>,
    memory: MemoryFifoPair,
    next_bi_tag: AtomicU16,
    birsp_waiters: StdMutex<HashMap<u16, oneshot::Sender<BIRspOpcode>>>,
    /// Lines with a BISnp in flight; M2S service stalls on them
    held_lines: StdMutex<HashSet<u64>>,
    held_notify: Notify,
    lifecycle: Lifecycle,
}

impl Dcoh {
    pub fn new(
        name: String,
        upstream: FifoPair<CxlMemPacket>,
        cache_requests: CacheFifoPair,
        cache_snoops: CacheFifoPair,
        mmio: Arc<StdMutex<DeviceMmio>>,
        memory: MemoryFifoPair,
    ) -> Self {
        Self {
            name,
            upstream,
            cache_requests,
            cache_snoops,
            mmio,
            memory,
            next_bi_tag: AtomicU16::new(0),
            birsp_waiters: StdMutex::new(HashMap::new()),
            held_lines: StdMutex::new(HashSet::new()),
            held_notify: Notify::new(),
            lifecycle: Lifecycle::new(),
        }
    }

    /// HPA through the device decoder; identity when nothing claims it
    fn dpa(&self, hpa: u64) -> u64 {
        self.mmio
            .lock()
            .unwrap()
            .decoders()
            .get_dpa(hpa)
            .unwrap_or(hpa)
    }

    /// Holds are bounded: a BIRsp that cannot get through (it shares
    /// the M2S queue) lets the back-invalidate time out, which releases
    /// the line
    async fn wait_line_released(&self, line: u64) {
        loop {
            let wait = self.held_notify.notified();
            if !self.held_lines.lock().unwrap().contains(&line) {
                return;
            }
            wait.await;
        }
    }

    /// Evicts a host-held line: BISnp toward the host, service for the
    /// line held until the BIRsp comes back
    pub async fn request_back_invalidate(&self, hpa: u64) -> Option<BIRspOpcode> {
        let line = hpa & !63;
        let bi_tag = self.next_bi_tag.fetch_add(1, Ordering::Relaxed) & 0xFFF;
        let (tx, rx) = oneshot::channel();
        self.birsp_waiters.lock().unwrap().insert(bi_tag, tx);
        self.held_lines.lock().unwrap().insert(line);
        self.upstream
            .target_to_host
            .send(CxlMemPacket::bisnp(BISnpOpcode::BISnpInv, line, 0, bi_tag));
        let result = match timeout(BIRSP_TIMEOUT, rx).await {
            Ok(Ok(opcode)) => Some(opcode),
            _ => {
                error!(device = %self.name, hpa, "BIRsp never arrived");
                self.birsp_waiters.lock().unwrap().remove(&bi_tag);
                None
            }
        };
        self.held_lines.lock().unwrap().remove(&line);
        self.held_notify.notify_waiters();
        result
    }

    async fn snoop_device_cache(&self, dpa: u64, kind: CacheRequestKind) -> Option<CacheResponse> {
        self.cache_snoops
            .request
            .send(CacheRequest::new(kind, dpa));
        self.cache_snoops.response.recv().await
    }

    async fn read_backing(&self, dpa: u64) -> CacheLineData {
        self.memory.read(dpa).await.unwrap_or([0; 64])
    }

    fn reply(&self, packet: CxlMemPacket) {
        self.upstream.target_to_host.send(packet);
    }

    async fn serve_req(&self, header: M2SReqHeader) {
        let hpa = header.addr() << 6;
        self.wait_line_released(hpa).await;
        let dpa = self.dpa(hpa);
        let ld_id = header.ld_id();
        match (header.mem_opcode(), header.snp_type()) {
            // HDM-H plain read: data, no completion
            (MemOpcode::MemRd, SnpType::NoOp) => {
                let data = self.read_backing(dpa).await;
                self.reply(CxlMemPacket::drs(data, ld_id));
            }
            // HDM-DB shared read
            (MemOpcode::MemRd, SnpType::SnpData) => {
                let snooped = self.snoop_device_cache(dpa, CacheRequestKind::SnpData).await;
                let (opcode, data) = match snooped {
                    Some(response) if response.dirty => {
                        // The device held it modified; the line leaves
                        // the device cache and the host owns it
                        self.memory.write(dpa, response.data).await;
                        (NdrOpcode::CmpE, response.data)
                    }
                    Some(response) if response.status != CacheResponseStatus::RspMiss => {
                        (NdrOpcode::CmpS, response.data)
                    }
                    _ => (NdrOpcode::CmpS, self.read_backing(dpa).await),
                };
                self.reply(CxlMemPacket::ndr(
                    opcode,
                    MetaField::Meta0State,
                    MetaValue::Any,
                    ld_id,
                ));
                self.reply(CxlMemPacket::drs(data, ld_id));
            }
            // Host takes ownership, device invalidates
            (MemOpcode::MemInv, _) | (_, SnpType::SnpInv) => {
                if let Some(response) = self
                    .snoop_device_cache(dpa, CacheRequestKind::SnpInv)
                    .await
                {
                    if response.dirty {
                        self.memory.write(dpa, response.data).await;
                    }
                }
                self.reply(CxlMemPacket::ndr(
                    NdrOpcode::CmpE,
                    MetaField::Meta0State,
                    MetaValue::Invalid,
                    ld_id,
                ));
            }
            // Observation without state change
            (MemOpcode::MemRd, SnpType::SnpCur) => {
                let snooped = self.snoop_device_cache(dpa, CacheRequestKind::SnpCur).await;
                let data = match snooped {
                    Some(response) if response.status == CacheResponseStatus::RspV => {
                        response.data
                    }
                    _ => self.read_backing(dpa).await,
                };
                self.reply(CxlMemPacket::ndr(
                    NdrOpcode::Cmp,
                    MetaField::Meta0State,
                    MetaValue::Any,
                    ld_id,
                ));
                self.reply(CxlMemPacket::drs(data, ld_id));
            }
            other => {
                warn!(device = %self.name, ?other, "unhandled M2S request shape");
            }
        }
    }

    async fn serve_rwd(&self, header: M2SRwDHeader, data: CacheLineData) {
        let hpa = header.addr() << 6;
        let flush = header.meta_field() == MetaField::Meta0State
            && header.meta_value() == MetaValue::Invalid;
        // A flush write is the host's answer to an outstanding BISnp;
        // holding it would wedge the very flow that releases the line
        if !flush {
            self.wait_line_released(hpa).await;
        }
        let dpa = self.dpa(hpa);
        if flush {
            debug!(device = %self.name, dpa, "flush write");
        }
        self.memory.write(dpa, data).await;
        self.reply(CxlMemPacket::ndr(
            NdrOpcode::Cmp,
            MetaField::Meta0State,
            MetaValue::Invalid,
            header.ld_id(),
        ));
    }

    async fn serve_m2s(&self) {
        while let Some(packet) = self.upstream.host_to_target.recv().await {
            match packet {
                CxlMemPacket::M2SReq(header) => self.serve_req(header).await,
                CxlMemPacket::M2SRwD(header, data) => self.serve_rwd(header, data).await,
                CxlMemPacket::M2SBIRsp(header) => {
                    let waiter = self.birsp_waiters.lock().unwrap().remove(&header.bi_tag());
                    match waiter {
                        Some(tx) => {
                            let _ = tx.send(header.opcode());
                        }
                        None => {
                            debug!(
                                device = %self.name,
                                bi_tag = header.bi_tag(),
                                "BIRsp with no outstanding BISnp"
                            );
                        }
                    }
                }
                other => {
                    error!(device = %self.name, ?other, "unexpected packet on M2S path");
                }
            }
        }
        debug!(device = %self.name, "stopped M2S service");
    }

    /// The device cache's view of memory: backs misses and write-backs
    /// directly with the memory controller
    async fn serve_device_cache(&self) {
        while let Some(request) = self.cache_requests.request.recv().await {
            let response = match request.kind {
                CacheRequestKind::Write
                | CacheRequestKind::WriteBack
                | CacheRequestKind::UncachedWrite => {
                    self.memory.write(request.addr, request.data).await;
                    CacheResponse::new(CacheResponseStatus::Ok)
                }
                CacheRequestKind::Read
                | CacheRequestKind::UncachedRead
                | CacheRequestKind::SnpData
                | CacheRequestKind::SnpCur => match self.memory.read(request.addr).await {
                    Some(data) => CacheResponse::with_data(CacheResponseStatus::Ok, data),
                    None => CacheResponse::new(CacheResponseStatus::RspMiss),
                },
                CacheRequestKind::SnpInv => CacheResponse::new(CacheResponseStatus::RspI),
            };
            self.cache_requests.response.send(response);
        }
        debug!(device = %self.name, "stopped serving the device cache");
    }
}

impl Runnable for Dcoh {
    fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    async fn run(&self) {
        self.lifecycle.set_running();
        tokio::join!(self.serve_m2s(), self.serve_device_cache());
        self.lifecycle.set_stopped();
    }

    async fn stop(&self) {
        self.upstream.host_to_target.disconnect();
        self.cache_requests.request.disconnect();
        self.cache_snoops.response.disconnect();
    }
}
