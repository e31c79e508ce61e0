/*!
Home agent.

The host side of the CXL.mem protocol, run as one serialised state
machine: while a flow is in its WAIT state no other flow starts, for
any address. Two inputs feed it — coherency requests from the host
cache controller and device-originated back-invalidate snoops — and
when both are ready it alternates strictly between them so neither
side starves.

Host requests translate to M2S per a fixed table (reads and snoops to
Req, writes and write-backs to RwD with the metadata encoding the HDM
flavour). Device BISnp flows snoop the host cache; a hit schedules the
BIRsp and first writes the snooped line back with `Meta0State =
Invalid`, emitting the BIRsp only once the write-back's completion
returns.

The downstream CXL.mem paths carry a 3-second inactivity bound; a
timeout aborts the current flow and the machine resets to its idle
state. Nothing is retried: the fabric is in-process, loss means a bug,
not congestion.
*/

use tokio::time::{timeout, Duration};
use tracing::{debug, error, warn};

use crate::cache::{CacheFifoPair, CacheRequest, CacheRequestKind, CacheResponse, CacheResponseStatus};
use crate::component::fifo::{Fifo, FifoPair};
use crate::component::lifecycle::{Lifecycle, Runnable};
use crate::transport::cxl_mem::{
    BIRspOpcode, BISnpOpcode, CxlMemPacket, MemOpcode, MetaField, MetaValue, NdrOpcode,
    RwdOpcode, S2MBISnpHeader, SnpType,
};

/// Inactivity bound on the downstream CXL.mem paths
pub const CXL_MEM_TIMEOUT: Duration = Duration::from_secs(3);

pub struct HomeAgentConfig {
    pub host_name: String,
    /// Requests from the cache controller; responses flow back on it
    pub cache_to_home_agent: CacheFifoPair,
    /// Snoops the agent issues against the host cache
    pub home_agent_to_cache: CacheFifoPair,
    /// The CXL.mem link toward the fabric
    pub downstream_cxl_mem: FifoPair<CxlMemPacket>,
}

/// Per-channel S2M queues; the demux task splits the downstream
/// receive path into these
struct S2MChannels {
    ndr: Fifo<CxlMemPacket>,
    drs: Fifo<CxlMemPacket>,
    bisnp: Fifo<CxlMemPacket>,
}

pub struct HomeAgent {
    host_name: String,
    cache_requests: CacheFifoPair,
    cache_snoops: CacheFifoPair,
    downstream: FifoPair<CxlMemPacket>,
    channels: S2MChannels,
    lifecycle: Lifecycle,
}

enum Flow {
    Host(CacheRequest),
    Device(S2MBISnpHeader),
}

impl HomeAgent {
    pub fn new(config: HomeAgentConfig) -> Self {
        Self {
            host_name: config.host_name,
            cache_requests: config.cache_to_home_agent,
            cache_snoops: config.home_agent_to_cache,
            downstream: config.downstream_cxl_mem,
            channels: S2MChannels {
                ndr: Fifo::new(),
                drs: Fifo::new(),
                bisnp: Fifo::new(),
            },
            lifecycle: Lifecycle::new(),
        }
    }

    /// Splits downstream S2M into per-channel queues
    async fn demux_s2m(&self) {
        while let Some(packet) = self.downstream.target_to_host.recv().await {
            match &packet {
                CxlMemPacket::S2MNdr(_) => self.channels.ndr.send(packet),
                CxlMemPacket::S2MDrs(..) => self.channels.drs.send(packet),
                CxlMemPacket::S2MBISnp(_) => self.channels.bisnp.send(packet),
                other => {
                    error!(host = %self.host_name, ?other, "unexpected packet on S2M path");
                }
            }
        }
        // Unblock the main loop waiting on any channel
        self.channels.ndr.disconnect();
        self.channels.drs.disconnect();
        self.channels.bisnp.disconnect();
        debug!(host = %self.host_name, "stopped S2M demux");
    }

    async fn await_ndr(&self) -> Option<CxlMemPacket> {
        match timeout(CXL_MEM_TIMEOUT, self.channels.ndr.recv()).await {
            Ok(packet) => packet,
            Err(_) => {
                error!(host = %self.host_name, "CXL.mem completion timed out");
                None
            }
        }
    }

    async fn await_drs(&self) -> Option<CxlMemPacket> {
        match timeout(CXL_MEM_TIMEOUT, self.channels.drs.recv()).await {
            Ok(packet) => packet,
            Err(_) => {
                error!(host = %self.host_name, "CXL.mem data timed out");
                None
            }
        }
    }

    /// Translates one cache-controller request into its M2S
    /// transaction and drives it to completion
    async fn run_host_flow(&self, request: CacheRequest) {
        let addr = request.addr;
        match request.kind {
            CacheRequestKind::Write
            | CacheRequestKind::WriteBack
            | CacheRequestKind::UncachedWrite => {
                let (meta_field, meta_value) = match request.kind {
                    // HDM-DB flush write
                    CacheRequestKind::WriteBack => (MetaField::Meta0State, MetaValue::Invalid),
                    // HDM-H plain and uncached writes
                    _ => (MetaField::NoOp, MetaValue::Any),
                };
                let packet = CxlMemPacket::m2s_rwd(
                    RwdOpcode::MemWr,
                    meta_field,
                    meta_value,
                    SnpType::NoOp,
                    addr,
                    request.data,
                    0,
                );
                // Writes post immediately from the cache's view
                self.cache_requests
                    .response
                    .send(CacheResponse::new(CacheResponseStatus::Ok));
                self.downstream.host_to_target.send(packet);
                self.await_ndr().await;
            }
            CacheRequestKind::Read
            | CacheRequestKind::UncachedRead
            | CacheRequestKind::SnpData
            | CacheRequestKind::SnpInv
            | CacheRequestKind::SnpCur => {
                let (opcode, meta_field, meta_value, snp_type) = match request.kind {
                    // HDM-H plain read
                    CacheRequestKind::Read | CacheRequestKind::UncachedRead => {
                        (MemOpcode::MemRd, MetaField::NoOp, MetaValue::Any, SnpType::NoOp)
                    }
                    // HDM-DB shared read (Cmp-S: S/S, Cmp-E: A/I)
                    CacheRequestKind::SnpData => (
                        MemOpcode::MemRd,
                        MetaField::Meta0State,
                        MetaValue::Shared,
                        SnpType::SnpData,
                    ),
                    // HDM-DB host-ownership device invalidation
                    CacheRequestKind::SnpInv => (
                        MemOpcode::MemInv,
                        MetaField::Meta0State,
                        MetaValue::Any,
                        SnpType::SnpInv,
                    ),
                    // HDM-DB non-cacheable observation
                    _ => (
                        MemOpcode::MemRd,
                        MetaField::Meta0State,
                        MetaValue::Invalid,
                        SnpType::SnpCur,
                    ),
                };
                let packet =
                    CxlMemPacket::m2s_req(opcode, meta_field, meta_value, snp_type, addr, 0);
                self.downstream.host_to_target.send(packet);
                self.finish_read_flow().await;
            }
        }
    }

    /// Waits out the S2M response pattern of a read-like flow and
    /// answers the cache controller
    async fn finish_read_flow(&self) {
        let abort = CacheResponse::new(CacheResponseStatus::RspMiss);
        // HDM-H replies with DRS alone, HDM-DB leads with an NDR; poll
        // the NDR side first so an already-queued pair is consumed in
        // protocol order
        let first = tokio::select! {
            biased;
            ndr = self.channels.ndr.recv() => ndr,
            drs = self.channels.drs.recv() => {
                let Some(CxlMemPacket::S2MDrs(_, data)) = drs else {
                    self.cache_requests.response.send(abort);
                    return;
                };
                self.cache_requests
                    .response
                    .send(CacheResponse::with_data(CacheResponseStatus::Ok, data));
                return;
            }
            _ = tokio::time::sleep(CXL_MEM_TIMEOUT) => {
                error!(host = %self.host_name, "CXL.mem read timed out");
                self.cache_requests.response.send(abort);
                return;
            }
        };
        let Some(CxlMemPacket::S2MNdr(ndr)) = first else {
            self.cache_requests.response.send(abort);
            return;
        };
        let status = match ndr.opcode() {
            NdrOpcode::CmpS => CacheResponseStatus::RspS,
            NdrOpcode::CmpE => CacheResponseStatus::RspI,
            NdrOpcode::Cmp => CacheResponseStatus::Ok,
            other => {
                warn!(host = %self.host_name, ?other, "unhandled NDR opcode");
                CacheResponseStatus::RspMiss
            }
        };
        // Any-metadata completions carry a DRS right behind
        let response = if ndr.meta_value() == MetaValue::Any {
            match self.await_drs().await {
                Some(CxlMemPacket::S2MDrs(_, data)) => CacheResponse::with_data(status, data),
                _ => abort,
            }
        } else {
            CacheResponse::new(status)
        };
        self.cache_requests.response.send(response);
    }

    /// Resolves one device BISnp against the host cache
    async fn run_device_flow(&self, bisnp: S2MBISnpHeader) {
        let addr = bisnp.addr() << 6;
        let kind = match bisnp.opcode() {
            BISnpOpcode::BISnpData | BISnpOpcode::BISnpDataBlk => CacheRequestKind::SnpData,
            _ => CacheRequestKind::SnpInv,
        };
        self.cache_snoops
            .request
            .send(CacheRequest::new(kind, addr));
        let Some(snooped) = self.cache_snoops.response.recv().await else {
            return;
        };
        match snooped.status {
            // Mid write-back or simply absent: the device will observe
            // the line invalid either way
            CacheResponseStatus::RspMiss => self.send_birsp(&bisnp, BIRspOpcode::BIRspI),
            CacheResponseStatus::RspS => {
                // Kept shared: flush the line home, then answer
                self.write_back_then_birsp(&bisnp, addr, snooped.data, BIRspOpcode::BIRspS)
                    .await;
            }
            _ if snooped.dirty => {
                self.write_back_then_birsp(&bisnp, addr, snooped.data, BIRspOpcode::BIRspI)
                    .await;
            }
            // Clean and invalidated: nothing to flush
            _ => self.send_birsp(&bisnp, BIRspOpcode::BIRspI),
        }
    }

    /// The scheduled BIRsp is released only once the write-back's
    /// completion comes home
    async fn write_back_then_birsp(
        &self,
        bisnp: &S2MBISnpHeader,
        addr: u64,
        data: crate::transport::CacheLineData,
        scheduled: BIRspOpcode,
    ) {
        let write_back = CxlMemPacket::m2s_rwd(
            RwdOpcode::MemWr,
            MetaField::Meta0State,
            MetaValue::Invalid,
            SnpType::NoOp,
            addr,
            data,
            0,
        );
        self.downstream.host_to_target.send(write_back);
        if self.await_ndr().await.is_some() {
            self.send_birsp(bisnp, scheduled);
        }
    }

    fn send_birsp(&self, bisnp: &S2MBISnpHeader, opcode: BIRspOpcode) {
        debug!(host = %self.host_name, ?opcode, bi_id = bisnp.bi_id(), "BIRsp");
        self.downstream
            .host_to_target
            .send(CxlMemPacket::birsp(opcode, bisnp.bi_id(), bisnp.bi_tag()));
    }

    /// One flow at a time, host and device sides strictly alternating
    /// when both have work
    async fn coherency_loop(&self) {
        let mut last_was_host = false;
        loop {
            tokio::task::yield_now().await;
            let host_first = !last_was_host;
            let mut flow = None;
            for host_side in [host_first, !host_first] {
                if host_side {
                    match self.cache_requests.request.try_recv().await {
                        Some(Some(request)) => {
                            flow = Some(Flow::Host(request));
                            break;
                        }
                        Some(None) => return,
                        None => {}
                    }
                } else if let Some(next) = self.channels.bisnp.try_recv().await {
                    match next {
                        Some(CxlMemPacket::S2MBISnp(header)) => {
                            flow = Some(Flow::Device(header));
                            break;
                        }
                        _ => return,
                    }
                }
            }
            let flow = match flow {
                Some(flow) => flow,
                // Both queues idle: block until either produces
                None => tokio::select! {
                    request = self.cache_requests.request.recv() => match request {
                        Some(request) => Flow::Host(request),
                        None => return,
                    },
                    snoop = self.channels.bisnp.recv() => match snoop {
                        Some(CxlMemPacket::S2MBISnp(header)) => Flow::Device(header),
                        _ => return,
                    },
                },
            };
            match flow {
                Flow::Host(request) => {
                    last_was_host = true;
                    self.run_host_flow(request).await;
                }
                Flow::Device(header) => {
                    last_was_host = false;
                    self.run_device_flow(header).await;
                }
            }
        }
    }
}

impl Runnable for HomeAgent {
    fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    async fn run(&self) {
        self.lifecycle.set_running();
        tokio::join!(self.demux_s2m(), self.coherency_loop());
        debug!(host = %self.host_name, "home agent stopped");
        self.lifecycle.set_stopped();
    }

    async fn stop(&self) {
        self.cache_requests.request.disconnect();
        self.downstream.target_to_host.disconnect();
        self.cache_snoops.response.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::connection::CxlConnection;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    struct Rig {
        agent: Arc<HomeAgent>,
        requests: CacheFifoPair,
        link: CxlConnection,
        task: tokio::task::JoinHandle<()>,
    }

    fn rig() -> Rig {
        let requests = CacheFifoPair::new();
        let snoops = CacheFifoPair::new();
        let link = CxlConnection::new();
        let agent = Arc::new(HomeAgent::new(HomeAgentConfig {
            host_name: "host0".into(),
            cache_to_home_agent: requests.clone(),
            home_agent_to_cache: snoops.clone(),
            downstream_cxl_mem: link.cxl_mem.clone(),
        }));
        let runner = Arc::clone(&agent);
        let task = tokio::spawn(async move { runner.run().await });
        Rig {
            agent,
            requests,
            link,
            task,
        }
    }

    async fn emitted(rig: &Rig) -> CxlMemPacket {
        rig.link.cxl_mem.host_to_target.recv().await.unwrap()
    }

    /// The CacheRequest to M2S translation table, row by row
    #[tokio::test]
    async fn request_translation_table() {
        let rig = rig();
        rig.agent.wait_for_ready().await;
        let addr = 0x1000;

        // READ: MemRd, NoOp/Any, no snoop
        rig.requests
            .request
            .send(CacheRequest::new(CacheRequestKind::Read, addr));
        match emitted(&rig).await {
            CxlMemPacket::M2SReq(h) => {
                assert_eq!(h.mem_opcode(), MemOpcode::MemRd);
                assert_eq!(h.meta_field(), MetaField::NoOp);
                assert_eq!(h.meta_value(), MetaValue::Any);
                assert_eq!(h.snp_type(), SnpType::NoOp);
            }
            other => panic!("unexpected {other:?}"),
        }
        rig.link.cxl_mem.target_to_host.send(CxlMemPacket::drs([1; 64], 0));
        let response = rig.requests.response.recv().await.unwrap();
        assert_eq!(response.status, CacheResponseStatus::Ok);
        assert_eq!(response.data, [1; 64]);

        // WRITE: MemWr, NoOp/Any; the cache is released immediately
        rig.requests.request.send(CacheRequest::with_data(
            CacheRequestKind::Write,
            addr,
            [2; 64],
        ));
        let response = rig.requests.response.recv().await.unwrap();
        assert_eq!(response.status, CacheResponseStatus::Ok);
        match emitted(&rig).await {
            CxlMemPacket::M2SRwD(h, data) => {
                assert_eq!(h.meta_field(), MetaField::NoOp);
                assert_eq!(h.meta_value(), MetaValue::Any);
                assert_eq!(data, [2; 64]);
            }
            other => panic!("unexpected {other:?}"),
        }
        rig.link.cxl_mem.target_to_host.send(CxlMemPacket::cmp(0));

        // WRITE_BACK: MemWr with Meta0State Invalid
        rig.requests.request.send(CacheRequest::with_data(
            CacheRequestKind::WriteBack,
            addr,
            [3; 64],
        ));
        rig.requests.response.recv().await.unwrap();
        match emitted(&rig).await {
            CxlMemPacket::M2SRwD(h, _) => {
                assert_eq!(h.meta_field(), MetaField::Meta0State);
                assert_eq!(h.meta_value(), MetaValue::Invalid);
            }
            other => panic!("unexpected {other:?}"),
        }
        rig.link.cxl_mem.target_to_host.send(CxlMemPacket::cmp(0));

        // SNP_INV: MemInv with SnpInv
        rig.requests
            .request
            .send(CacheRequest::new(CacheRequestKind::SnpInv, addr));
        match emitted(&rig).await {
            CxlMemPacket::M2SReq(h) => {
                assert_eq!(h.mem_opcode(), MemOpcode::MemInv);
                assert_eq!(h.snp_type(), SnpType::SnpInv);
                assert_eq!(h.meta_value(), MetaValue::Any);
            }
            other => panic!("unexpected {other:?}"),
        }
        rig.link.cxl_mem.target_to_host.send(CxlMemPacket::ndr(
            NdrOpcode::CmpE,
            MetaField::Meta0State,
            MetaValue::Invalid,
            0,
        ));
        let response = rig.requests.response.recv().await.unwrap();
        assert_eq!(response.status, CacheResponseStatus::RspI);

        rig.agent.stop().await;
        rig.task.abort();
    }

    // Cmp-S with Any metadata means a DRS follows as part of the same
    // response; the data must be attached to the cache answer
    #[tokio::test]
    async fn cmp_s_with_any_collects_the_data_response() {
        let rig = rig();
        rig.agent.wait_for_ready().await;

        rig.requests
            .request
            .send(CacheRequest::new(CacheRequestKind::SnpData, 0x2000));
        match emitted(&rig).await {
            CxlMemPacket::M2SReq(h) => {
                assert_eq!(h.snp_type(), SnpType::SnpData);
                assert_eq!(h.meta_value(), MetaValue::Shared);
            }
            other => panic!("unexpected {other:?}"),
        }
        rig.link.cxl_mem.target_to_host.send(CxlMemPacket::ndr(
            NdrOpcode::CmpS,
            MetaField::Meta0State,
            MetaValue::Any,
            0,
        ));
        rig.link
            .cxl_mem
            .target_to_host
            .send(CxlMemPacket::drs([9; 64], 0));
        let response = rig.requests.response.recv().await.unwrap();
        assert_eq!(response.status, CacheResponseStatus::RspS);
        assert_eq!(response.data, [9; 64]);

        rig.agent.stop().await;
        rig.task.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn a_silent_device_times_the_flow_out() {
        let rig = rig();
        rig.agent.wait_for_ready().await;

        rig.requests
            .request
            .send(CacheRequest::new(CacheRequestKind::Read, 0x3000));
        emitted(&rig).await;
        // No reply ever comes; the flow aborts and the caller is told
        let response = rig.requests.response.recv().await.unwrap();
        assert_eq!(response.status, CacheResponseStatus::RspMiss);

        rig.agent.stop().await;
        rig.task.abort();
    }
}
