/*!
Cache-coherency bridge.

Sits between the host cache and the downstream CXL.cache link. In one
direction it turns host-side coherency requests for DRAM lines into
H2D snoops against whatever coherent devices are attached, merging the
result with host memory. In the other it resolves device-initiated D2H
requests (shared reads, dirty evictions, ownership grabs) against the
host cache and answers with H2D GO / GO_WRITE_PULL and data.

Responses are paired to their requests through queue ids: the bridge
allocates a `uqid` per snoop it issues and keeps an inverse directory
of waiters; device requests carry a `cqid` the bridge echoes back.

A bridge with zero attached coherent devices rejects device-originated
traffic outright; `set_cache_coh_dev_count` is the knob the platform
turns when devices come and go.
*/

use std::collections::HashMap;
use std::sync::atomic::{AtomicU16, AtomicU32, Ordering};
use std::sync::Mutex as StdMutex;

use tokio::sync::oneshot;
use tokio::time::{timeout, Duration};
use tracing::{debug, warn};

use crate::cache::{CacheFifoPair, CacheRequest, CacheRequestKind, CacheResponse, CacheResponseStatus};
use crate::component::fifo::FifoPair;
use crate::component::lifecycle::{Lifecycle, Runnable};
use crate::component::ProtocolError;
use crate::memory::MemoryFifoPair;
use crate::transport::cxl_cache::{
    CxlCachePacket, D2HReqHeader, D2HReqOpcode, D2HRspOpcode, H2DReqOpcode, H2DRspCacheState,
    H2DRspOpcode,
};

const SNOOP_TIMEOUT: Duration = Duration::from_secs(3);

pub struct CacheCoherencyBridgeConfig {
    pub host_name: String,
    /// Host memory behind the bridge
    pub memory_producer_fifos: MemoryFifoPair,
    /// Requests from the host cache controller
    pub cache_to_coh_bridge: CacheFifoPair,
    /// Snoops the bridge issues against the host cache
    pub coh_bridge_to_cache: CacheFifoPair,
    pub downstream_cxl_cache: FifoPair<CxlCachePacket>,
}

pub struct CacheCoherencyBridge {
    host_name: String,
    memory: MemoryFifoPair,
    cache_requests: CacheFifoPair,
    cache_snoops: CacheFifoPair,
    downstream: FifoPair<CxlCachePacket>,
    dev_count: AtomicU32,
    next_uqid: AtomicU16,
    /// Inverse directory: uqid -> waiter for the device's answer
    waiters: StdMutex<HashMap<u16, oneshot::Sender<CxlCachePacket>>>,
    /// A GO_WRITE_PULL in flight: the next D2H data lands at this address
    pending_pull: StdMutex<Option<u64>>,
    lifecycle: Lifecycle,
}

impl CacheCoherencyBridge {
    pub fn new(config: CacheCoherencyBridgeConfig) -> Self {
        Self {
            host_name: config.host_name,
            memory: config.memory_producer_fifos,
            cache_requests: config.cache_to_coh_bridge,
            cache_snoops: config.coh_bridge_to_cache,
            downstream: config.downstream_cxl_cache,
            dev_count: AtomicU32::new(0),
            next_uqid: AtomicU16::new(0),
            waiters: StdMutex::new(HashMap::new()),
            pending_pull: StdMutex::new(None),
            lifecycle: Lifecycle::new(),
        }
    }

    pub fn set_cache_coh_dev_count(&self, count: u32) {
        self.dev_count.store(count, Ordering::Relaxed);
    }

    fn alloc_uqid(&self) -> u16 {
        self.next_uqid.fetch_add(1, Ordering::Relaxed) & 0xFFF
    }

    async fn await_packet(&self, uqid: u16) -> Option<CxlCachePacket> {
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().unwrap().insert(uqid, tx);
        match timeout(SNOOP_TIMEOUT, rx).await {
            Ok(Ok(packet)) => Some(packet),
            _ => {
                self.waiters.lock().unwrap().remove(&uqid);
                None
            }
        }
    }

    /// Issues one H2D snoop and waits for the device's D2H response
    async fn snoop_devices(&self, opcode: H2DReqOpcode, addr: u64) -> Option<CxlCachePacket> {
        let uqid = self.alloc_uqid();
        self.downstream
            .host_to_target
            .send(CxlCachePacket::h2d_req(opcode, addr, uqid, 0));
        let reply = self.await_packet(uqid).await;
        if reply.is_none() {
            warn!(host = %self.host_name, addr, "device snoop timed out");
            return None;
        }
        // A dirty forward supplies the line under the same uqid
        if let Some(CxlCachePacket::D2HRsp(rsp)) = &reply {
            if matches!(
                rsp.cache_opcode(),
                D2HRspOpcode::RspSFwdM | D2HRspOpcode::RspIFwdM
            ) {
                return self.await_packet(uqid).await;
            }
        }
        reply
    }

    /// Host-side requests: resolve device caches first where coherency
    /// demands it, then host memory
    async fn serve_cache_requests(&self) {
        while let Some(request) = self.cache_requests.request.recv().await {
            let addr = request.addr;
            let snooping = self.dev_count.load(Ordering::Relaxed) > 0;
            let response = match request.kind {
                CacheRequestKind::Write
                | CacheRequestKind::WriteBack
                | CacheRequestKind::UncachedWrite => {
                    self.memory.write(addr, request.data).await;
                    CacheResponse::new(CacheResponseStatus::Ok)
                }
                CacheRequestKind::Read | CacheRequestKind::UncachedRead => {
                    match self.memory.read(addr).await {
                        Some(data) => CacheResponse::with_data(CacheResponseStatus::Ok, data),
                        None => CacheResponse::new(CacheResponseStatus::RspMiss),
                    }
                }
                CacheRequestKind::SnpData | CacheRequestKind::SnpCur => {
                    let mut data = None;
                    if snooping {
                        if let Some(CxlCachePacket::D2HData(_, pulled)) =
                            self.snoop_devices(H2DReqOpcode::SnpData, addr).await
                        {
                            // Dirty forward: the device line supersedes
                            // memory and owes it an update
                            self.memory.write(addr, pulled).await;
                            data = Some(pulled);
                        }
                    }
                    let data = match data {
                        Some(data) => Some(data),
                        None => self.memory.read(addr).await,
                    };
                    match data {
                        Some(data) => CacheResponse::with_data(CacheResponseStatus::Ok, data),
                        None => CacheResponse::new(CacheResponseStatus::RspMiss),
                    }
                }
                CacheRequestKind::SnpInv => {
                    if snooping {
                        self.snoop_devices(H2DReqOpcode::SnpInv, addr).await;
                    }
                    CacheResponse::new(CacheResponseStatus::RspI)
                }
            };
            self.cache_requests.response.send(response);
        }
        debug!(host = %self.host_name, "stopped serving cache requests");
    }

    async fn serve_d2h_request(&self, header: D2HReqHeader) {
        if self.dev_count.load(Ordering::Relaxed) == 0 {
            warn!(
                host = %self.host_name,
                error = %ProtocolError::NoCoherentDevices,
                "dropping D2H request"
            );
            return;
        }
        let addr = header.addr() << 6;
        let cqid = header.cqid();
        let cache_id = header.cache_id();
        match header.cache_opcode() {
            D2HReqOpcode::RdShared | D2HReqOpcode::RdCurr | D2HReqOpcode::RdAny => {
                self.cache_snoops
                    .request
                    .send(CacheRequest::new(CacheRequestKind::SnpData, addr));
                let snooped = self.cache_snoops.response.recv().await;
                let data = match snooped {
                    Some(response) if response.status != CacheResponseStatus::RspMiss => {
                        if response.dirty {
                            self.memory.write(addr, response.data).await;
                        }
                        response.data
                    }
                    _ => self.memory.read(addr).await.unwrap_or([0; 64]),
                };
                self.downstream.host_to_target.send(CxlCachePacket::h2d_rsp(
                    H2DRspOpcode::Go,
                    H2DRspCacheState::Shared,
                    cqid,
                    cache_id,
                ));
                self.downstream
                    .host_to_target
                    .send(CxlCachePacket::h2d_data(cqid, data, cache_id));
            }
            D2HReqOpcode::DirtyEvict => {
                *self.pending_pull.lock().unwrap() = Some(addr);
                self.downstream.host_to_target.send(CxlCachePacket::h2d_rsp(
                    H2DRspOpcode::GoWritePull,
                    H2DRspCacheState::Invalid,
                    cqid,
                    cache_id,
                ));
            }
            D2HReqOpcode::RdOwnNoData | D2HReqOpcode::RdOwn => {
                self.cache_snoops
                    .request
                    .send(CacheRequest::new(CacheRequestKind::SnpInv, addr));
                let _ = self.cache_snoops.response.recv().await;
                self.downstream.host_to_target.send(CxlCachePacket::h2d_rsp(
                    H2DRspOpcode::Go,
                    H2DRspCacheState::Exclusive,
                    cqid,
                    cache_id,
                ));
            }
            other => {
                warn!(host = %self.host_name, ?other, "unhandled D2H request opcode");
            }
        }
    }

    /// Downstream receive path: device requests handled inline,
    /// responses and data matched to their waiters
    async fn serve_downstream(&self) {
        while let Some(packet) = self.downstream.target_to_host.recv().await {
            match packet {
                CxlCachePacket::D2HReq(header) => self.serve_d2h_request(header).await,
                CxlCachePacket::D2HRsp(header) => {
                    let waiter = self.waiters.lock().unwrap().remove(&header.uqid());
                    match waiter {
                        Some(tx) => {
                            let _ = tx.send(CxlCachePacket::D2HRsp(header));
                        }
                        None => debug!(uqid = header.uqid(), "unsolicited D2H response"),
                    }
                }
                CxlCachePacket::D2HData(header, data) => {
                    // A write pull in flight consumes data first
                    let pull = self.pending_pull.lock().unwrap().take();
                    if let Some(addr) = pull {
                        self.memory.write(addr, data).await;
                        continue;
                    }
                    let waiter = self.waiters.lock().unwrap().remove(&header.uqid());
                    match waiter {
                        Some(tx) => {
                            let _ = tx.send(CxlCachePacket::D2HData(header, data));
                        }
                        None => debug!(uqid = header.uqid(), "unsolicited D2H data"),
                    }
                }
                other => {
                    warn!(host = %self.host_name, ?other, "unexpected H2D packet from below");
                }
            }
        }
        debug!(host = %self.host_name, "stopped downstream CXL.cache consumer");
    }
}

impl Runnable for CacheCoherencyBridge {
    fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    async fn run(&self) {
        self.lifecycle.set_running();
        tokio::join!(self.serve_cache_requests(), self.serve_downstream());
        self.lifecycle.set_stopped();
    }

    async fn stop(&self) {
        self.cache_requests.request.disconnect();
        self.downstream.target_to_host.disconnect();
        self.cache_snoops.response.disconnect();
        self.memory.response.disconnect();
    }
}
