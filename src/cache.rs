/*!
Inclusive cache and cache controller.

An N-way set-associative cache of 64-byte lines with MESI states and
LRU replacement. The controller exposes two faces:

- the CPU surface: `load`, `store` and the uncached variants, which hit
  the array or drive a coherency round-trip through the cache-to-agent
  (CXL ranges) or cache-to-bridge (DRAM) queue pair;
- the snoop surface: `SnpData`/`SnpInv`/`SnpCur`/`WriteBack` requests
  arriving on the agent-to-cache and bridge-to-cache queues, answered
  with `RSP_S`/`RSP_I`/`RSP_V`/`RSP_MISS` and data where the protocol
  carries it.

For a given line at most one transaction is outstanding; CPU accesses
block on a per-line latch. A snoop that finds the line latched answers
`RSP_MISS` — the line is mid-flight to or from the device and the
snooper's fallback path handles it.
*/

use std::collections::HashSet;
use std::sync::{Arc, Mutex as StdMutex};

use displaydoc::Display as DisplayDoc;
use snafu::Snafu;
use tokio::sync::{Mutex, Notify};
use tracing::debug;

use crate::component::fifo::Fifo;
use crate::component::lifecycle::{Lifecycle, Runnable};
use crate::transport::CacheLineData;

/// MESI line states
#[derive(DisplayDoc, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheState {
    /// invalid
    Invalid,
    /// shared
    Shared,
    /// exclusive
    Exclusive,
    /// modified
    Modified,
}

/// What a memory address is backed by, decided by the platform memory map
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemAddrType {
    Dram,
    Mmio,
    Cfg,
    CxlUncached,
    CxlCached,
    /// CXL cached with back-invalidate capable device memory
    CxlCachedBI,
}

#[derive(Snafu, Debug, Clone, PartialEq, Eq)]
pub enum RangeError {
    #[snafu(display("range {base:#x}+{size:#x} overlaps an existing range"))]
    Overlap { base: u64, size: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRange {
    pub base: u64,
    pub size: u64,
    pub addr_type: MemAddrType,
}

/// Platform memory map: typed, non-overlapping ranges
#[derive(Debug, Default)]
pub struct MemoryRangeMap {
    ranges: Vec<MemoryRange>,
}

impl MemoryRangeMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, base: u64, size: u64, addr_type: MemAddrType) -> Result<(), RangeError> {
        let clashes = self
            .ranges
            .iter()
            .any(|r| base < r.base + r.size && r.base < base + size);
        if clashes {
            return Err(RangeError::Overlap { base, size });
        }
        self.ranges.push(MemoryRange {
            base,
            size,
            addr_type,
        });
        Ok(())
    }

    pub fn lookup(&self, addr: u64) -> Option<MemAddrType> {
        self.ranges
            .iter()
            .find(|r| r.base <= addr && addr < r.base + r.size)
            .map(|r| r.addr_type)
    }

    pub fn ranges(&self) -> &[MemoryRange] {
        &self.ranges
    }
}

pub type SharedRangeMap = Arc<StdMutex<MemoryRangeMap>>;

/// Coherency requests exchanged between cache controller, home agent,
/// coherency bridge and DCOH
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheRequestKind {
    Read,
    Write,
    WriteBack,
    SnpData,
    SnpInv,
    SnpCur,
    UncachedRead,
    UncachedWrite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheRequest {
    pub kind: CacheRequestKind,
    pub addr: u64,
    pub data: CacheLineData,
}

impl CacheRequest {
    pub fn new(kind: CacheRequestKind, addr: u64) -> Self {
        Self {
            kind,
            addr,
            data: [0; 64],
        }
    }

    pub fn with_data(kind: CacheRequestKind, addr: u64, data: CacheLineData) -> Self {
        Self { kind, addr, data }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheResponseStatus {
    Ok,
    RspI,
    RspS,
    RspV,
    RspMiss,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheResponse {
    pub status: CacheResponseStatus,
    pub data: CacheLineData,
    /// The data came out of a modified line and must reach memory
    pub dirty: bool,
}

impl CacheResponse {
    pub fn new(status: CacheResponseStatus) -> Self {
        Self {
            status,
            data: [0; 64],
            dirty: false,
        }
    }

    pub fn with_data(status: CacheResponseStatus, data: CacheLineData) -> Self {
        Self {
            status,
            data,
            dirty: false,
        }
    }

    pub fn dirty_data(status: CacheResponseStatus, data: CacheLineData) -> Self {
        Self {
            status,
            data,
            dirty: true,
        }
    }
}

#[derive(Clone, Default)]
pub struct CacheFifoPair {
    pub request: Fifo<CacheRequest>,
    pub response: Fifo<CacheResponse>,
}

impl CacheFifoPair {
    pub fn new() -> Self {
        Self::default()
    }
}

struct Line {
    tag: u64,
    state: CacheState,
    data: CacheLineData,
    tick: u64,
}

struct CacheArray {
    assoc: usize,
    set_count: usize,
    sets: Vec<Vec<Line>>,
    clock: u64,
}

impl CacheArray {
    fn new(assoc: usize, set_count: usize) -> Self {
        assert!(assoc > 0 && set_count > 0);
        Self {
            assoc,
            set_count,
            sets: (0..set_count).map(|_| Vec::new()).collect(),
            clock: 0,
        }
    }

    fn set_index(&self, line_addr: u64) -> usize {
        ((line_addr >> 6) % self.set_count as u64) as usize
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn find(&mut self, line_addr: u64) -> Option<&mut Line> {
        let tick = self.tick();
        let index = self.set_index(line_addr);
        let line = self.sets[index]
            .iter_mut()
            .find(|line| line.tag == line_addr && line.state != CacheState::Invalid)?;
        line.tick = tick;
        Some(line)
    }

    /// Allocates a line, returning the dirty victim when replacement
    /// pushed out a modified line
    fn insert(
        &mut self,
        line_addr: u64,
        state: CacheState,
        data: CacheLineData,
    ) -> Option<(u64, CacheLineData)> {
        let tick = self.tick();
        let index = self.set_index(line_addr);
        let set = &mut self.sets[index];
        if set.len() < self.assoc {
            set.push(Line {
                tag: line_addr,
                state,
                data,
                tick,
            });
            return None;
        }
        if let Some(slot) = set.iter_mut().find(|line| line.state == CacheState::Invalid) {
            *slot = Line {
                tag: line_addr,
                state,
                data,
                tick,
            };
            return None;
        }
        let victim = set
            .iter_mut()
            .min_by_key(|line| line.tick)
            .expect("set is non-empty");
        let spill = (victim.state == CacheState::Modified).then(|| (victim.tag, victim.data));
        *victim = Line {
            tag: line_addr,
            state,
            data,
            tick,
        };
        spill
    }
}

pub struct CacheControllerConfig {
    pub name: String,
    pub cache_num_assoc: usize,
    pub cache_num_set: usize,
    /// Outbound coherency round-trips for CXL-backed lines
    pub cache_to_coh_agent: CacheFifoPair,
    /// Inbound snoops from the coherency agent
    pub coh_agent_to_cache: CacheFifoPair,
    /// Outbound round-trips for DRAM-backed lines; host caches only
    pub cache_to_coh_bridge: Option<CacheFifoPair>,
    /// Inbound device-originated snoops via the bridge; host caches only
    pub coh_bridge_to_cache: Option<CacheFifoPair>,
    pub ranges: SharedRangeMap,
}

pub struct CacheController {
    name: String,
    array: StdMutex<CacheArray>,
    busy: StdMutex<HashSet<u64>>,
    busy_notify: Notify,
    to_agent: CacheFifoPair,
    from_agent: CacheFifoPair,
    to_bridge: Option<CacheFifoPair>,
    from_bridge: Option<CacheFifoPair>,
    agent_turn: Mutex<()>,
    bridge_turn: Mutex<()>,
    ranges: SharedRangeMap,
    lifecycle: Lifecycle,
}

struct LineLatch<'a> {
    controller: &'a CacheController,
    line_addr: u64,
}

impl Drop for LineLatch<'_> {
    fn drop(&mut self) {
        self.controller
            .busy
            .lock()
            .unwrap()
            .remove(&self.line_addr);
        self.controller.busy_notify.notify_waiters();
    }
}

impl CacheController {
    pub fn new(config: CacheControllerConfig) -> Self {
        Self {
            name: config.name,
            array: StdMutex::new(CacheArray::new(config.cache_num_assoc, config.cache_num_set)),
            busy: StdMutex::new(HashSet::new()),
            busy_notify: Notify::new(),
            to_agent: config.cache_to_coh_agent,
            from_agent: config.coh_agent_to_cache,
            to_bridge: config.cache_to_coh_bridge,
            from_bridge: config.coh_bridge_to_cache,
            agent_turn: Mutex::new(()),
            bridge_turn: Mutex::new(()),
            ranges: config.ranges,
            lifecycle: Lifecycle::new(),
        }
    }

    pub fn addr_type(&self, addr: u64) -> Option<MemAddrType> {
        self.ranges.lock().unwrap().lookup(addr)
    }

    async fn latch_line(&self, line_addr: u64) -> LineLatch<'_> {
        loop {
            let wait = self.busy_notify.notified();
            if self.busy.lock().unwrap().insert(line_addr) {
                return LineLatch {
                    controller: self,
                    line_addr,
                };
            }
            wait.await;
        }
    }

    fn try_latch_line(&self, line_addr: u64) -> Option<LineLatch<'_>> {
        // Lazily built: a latch guard constructed on the failure path
        // would unlatch someone else's transaction on drop
        self.busy.lock().unwrap().insert(line_addr).then(|| LineLatch {
            controller: self,
            line_addr,
        })
    }

    /// Whether a line's coherency traffic goes to the bridge (host DRAM,
    /// devices snooping our memory) or to the home agent (CXL memory)
    fn uses_bridge(&self, addr: u64) -> bool {
        self.to_bridge.is_some() && matches!(self.addr_type(addr), Some(MemAddrType::Dram))
    }

    async fn round_trip(&self, addr: u64, request: CacheRequest) -> Option<CacheResponse> {
        match &self.to_bridge {
            Some(pair) if self.uses_bridge(addr) => {
                let _turn = self.bridge_turn.lock().await;
                pair.request.send(request);
                pair.response.recv().await
            }
            _ => {
                let _turn = self.agent_turn.lock().await;
                self.to_agent.request.send(request);
                self.to_agent.response.recv().await
            }
        }
    }

    async fn write_back_victim(&self, victim: Option<(u64, CacheLineData)>) -> bool {
        match victim {
            None => true,
            Some((addr, data)) => self
                .round_trip(
                    addr,
                    CacheRequest::with_data(CacheRequestKind::WriteBack, addr, data),
                )
                .await
                .is_some(),
        }
    }

    /// Loads the full cacheline containing `addr`. A miss fetches the
    /// line shared and inserts it in S; a dirty victim is written back
    /// before replacement.
    pub async fn load_line(&self, addr: u64) -> Option<CacheLineData> {
        let line_addr = addr & !63;
        let _latch = self.latch_line(line_addr).await;
        if let Some(data) = {
            let mut array = self.array.lock().unwrap();
            array.find(line_addr).map(|line| line.data)
        } {
            return Some(data);
        }
        let response = self
            .round_trip(
                line_addr,
                CacheRequest::new(CacheRequestKind::SnpData, line_addr),
            )
            .await?;
        if response.status == CacheResponseStatus::RspMiss {
            return None;
        }
        let victim = self
            .array
            .lock()
            .unwrap()
            .insert(line_addr, CacheState::Shared, response.data);
        if !self.write_back_victim(victim).await {
            return None;
        }
        Some(response.data)
    }

    /// Stores a full cacheline. A hit in S upgrades ownership with an
    /// invalidating snoop first; a full-line miss allocates in M without
    /// fetching.
    pub async fn store_line(&self, addr: u64, data: CacheLineData) -> bool {
        let line_addr = addr & !63;
        let _latch = self.latch_line(line_addr).await;
        self.store_latched(line_addr, data).await
    }

    async fn store_latched(&self, line_addr: u64, data: CacheLineData) -> bool {
        let hit_state = {
            let mut array = self.array.lock().unwrap();
            array.find(line_addr).map(|line| line.state)
        };
        match hit_state {
            Some(CacheState::Modified) | Some(CacheState::Exclusive) => {
                let mut array = self.array.lock().unwrap();
                if let Some(line) = array.find(line_addr) {
                    line.data = data;
                    line.state = CacheState::Modified;
                }
                true
            }
            Some(_) => {
                // Shared: upgrade to ownership before writing
                if self
                    .round_trip(
                        line_addr,
                        CacheRequest::new(CacheRequestKind::SnpInv, line_addr),
                    )
                    .await
                    .is_none()
                {
                    return false;
                }
                let mut array = self.array.lock().unwrap();
                if let Some(line) = array.find(line_addr) {
                    line.data = data;
                    line.state = CacheState::Modified;
                }
                true
            }
            None => {
                let victim = self
                    .array
                    .lock()
                    .unwrap()
                    .insert(line_addr, CacheState::Modified, data);
                self.write_back_victim(victim).await
            }
        }
    }

    /// Sub-line store, read-modify-write
    pub async fn store(&self, addr: u64, size: usize, value: u64) -> bool {
        debug_assert!(size <= 8 && addr % 64 + size as u64 <= 64);
        let line_addr = addr & !63;
        let _latch = self.latch_line(line_addr).await;
        let mut data = {
            let mut array = self.array.lock().unwrap();
            array.find(line_addr).map(|line| line.data)
        };
        if data.is_none() {
            let response = self
                .round_trip(
                    line_addr,
                    CacheRequest::new(CacheRequestKind::SnpData, line_addr),
                )
                .await;
            match response {
                Some(r) if r.status != CacheResponseStatus::RspMiss => {
                    let victim = self
                        .array
                        .lock()
                        .unwrap()
                        .insert(line_addr, CacheState::Shared, r.data);
                    if !self.write_back_victim(victim).await {
                        return false;
                    }
                    data = Some(r.data);
                }
                _ => return false,
            }
        }
        let mut line = data.unwrap_or([0; 64]);
        let offset = (addr % 64) as usize;
        line[offset..offset + size].copy_from_slice(&value.to_le_bytes()[..size]);
        self.store_latched(line_addr, line).await
    }

    /// Bypasses the cache array entirely
    pub async fn uncached_load(&self, addr: u64) -> Option<CacheLineData> {
        let line_addr = addr & !63;
        let response = self
            .round_trip(
                line_addr,
                CacheRequest::new(CacheRequestKind::UncachedRead, line_addr),
            )
            .await?;
        (response.status == CacheResponseStatus::Ok).then_some(response.data)
    }

    pub async fn uncached_store(&self, addr: u64, data: CacheLineData) -> bool {
        let line_addr = addr & !63;
        self.round_trip(
            line_addr,
            CacheRequest::with_data(CacheRequestKind::UncachedWrite, line_addr, data),
        )
        .await
        .is_some()
    }

    /// Resolves one peer-originated snoop against the array
    fn snoop(&self, request: CacheRequest) -> CacheResponse {
        let line_addr = request.addr & !63;
        let Some(_latch) = self.try_latch_line(line_addr) else {
            // Line is mid-transaction, likely being written back
            return CacheResponse::new(CacheResponseStatus::RspMiss);
        };
        let mut array = self.array.lock().unwrap();
        let Some(line) = array.find(line_addr) else {
            return CacheResponse::new(CacheResponseStatus::RspMiss);
        };
        match request.kind {
            CacheRequestKind::SnpData => {
                let data = line.data;
                if line.state == CacheState::Modified {
                    // Dirty: surrender the line so the snooper can
                    // write it home
                    line.state = CacheState::Invalid;
                    CacheResponse::dirty_data(CacheResponseStatus::RspV, data)
                } else {
                    line.state = CacheState::Shared;
                    CacheResponse::with_data(CacheResponseStatus::RspS, data)
                }
            }
            CacheRequestKind::SnpInv => {
                let dirty = line.state == CacheState::Modified;
                let data = line.data;
                line.state = CacheState::Invalid;
                if dirty {
                    CacheResponse::dirty_data(CacheResponseStatus::RspI, data)
                } else {
                    CacheResponse::new(CacheResponseStatus::RspI)
                }
            }
            CacheRequestKind::SnpCur => {
                CacheResponse::with_data(CacheResponseStatus::RspV, line.data)
            }
            CacheRequestKind::WriteBack => {
                let data = line.data;
                let dirty = line.state == CacheState::Modified;
                line.state = CacheState::Invalid;
                if dirty {
                    CacheResponse::dirty_data(CacheResponseStatus::RspV, data)
                } else {
                    CacheResponse::with_data(CacheResponseStatus::RspV, data)
                }
            }
            _ => CacheResponse::new(CacheResponseStatus::RspMiss),
        }
    }

    async fn serve_snoops(&self, pair: &CacheFifoPair) {
        while let Some(request) = pair.request.recv().await {
            debug!(name = %self.name, kind = ?request.kind, addr = request.addr, "snoop");
            pair.response.send(self.snoop(request));
        }
        debug!(name = %self.name, "stopped serving snoops");
    }

    async fn serve_bridge_snoops(&self) {
        if let Some(pair) = &self.from_bridge {
            self.serve_snoops(pair).await;
        }
    }
}

impl Runnable for CacheController {
    fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    async fn run(&self) {
        self.lifecycle.set_running();
        tokio::join!(
            self.serve_snoops(&self.from_agent),
            self.serve_bridge_snoops(),
        );
        self.lifecycle.set_stopped();
    }

    async fn stop(&self) {
        self.from_agent.request.disconnect();
        if let Some(pair) = &self.from_bridge {
            pair.request.disconnect();
        }
        self.to_agent.response.disconnect();
        if let Some(pair) = &self.to_bridge {
            pair.response.disconnect();
        }
    }
}
