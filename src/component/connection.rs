use crate::component::fifo::FifoPair;
use crate::transport::{CciMessage, CxlCachePacket, CxlIoPacket, CxlMemPacket};

/// The queue bundle of one CXL link: config space, MMIO, CXL.mem,
/// CXL.cache and CCI, each with both directions. Cloning shares the
/// underlying queues, so the two endpoints of a link hold clones of the
/// same bundle.
#[derive(Clone, Default)]
pub struct CxlConnection {
    pub cfg: FifoPair<CxlIoPacket>,
    pub mmio: FifoPair<CxlIoPacket>,
    pub cxl_mem: FifoPair<CxlMemPacket>,
    pub cxl_cache: FifoPair<CxlCachePacket>,
    pub cci: FifoPair<CciMessage>,
}

impl CxlConnection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks every queue of the link disconnected, both directions
    pub fn disconnect_all(&self) {
        self.cfg.disconnect_both();
        self.mmio.disconnect_both();
        self.cxl_mem.disconnect_both();
        self.cxl_cache.disconnect_both();
        self.cci.disconnect_both();
    }

    /// Empties every queue of the link; packets and markers queued for
    /// a previous incarnation of the link are stale by definition
    pub async fn drain_all(&self) {
        for pair in [&self.cfg, &self.mmio] {
            pair.host_to_target.drain().await;
            pair.target_to_host.drain().await;
        }
        self.cxl_mem.host_to_target.drain().await;
        self.cxl_mem.target_to_host.drain().await;
        self.cxl_cache.host_to_target.drain().await;
        self.cxl_cache.target_to_host.drain().await;
        self.cci.host_to_target.drain().await;
        self.cci.target_to_host.drain().await;
    }
}
