/*!
Memory hub.

The CPU surface of a host: `load`/`store` against a typed memory map.
Each access is dispatched by the range type its address falls into —
DRAM and CXL-cached ranges go through the inclusive cache (which in
turn reaches the coherency bridge or the home agent), CXL-uncached
ranges bypass the cache entirely, MMIO goes straight out the root
port. Config space is its own address space and has its own accessors.

Ranges are registered by platform bring-up software after enumeration
and HDM programming; overlapping registrations are rejected.
*/

use std::sync::Arc;

use tracing::warn;

use crate::cache::{CacheController, MemAddrType, RangeError, SharedRangeMap};
use crate::host::root_port::RootPort;
use crate::transport::CacheLineData;

pub struct CxlMemoryHub {
    ranges: SharedRangeMap,
    cache: Arc<CacheController>,
    root_port: Arc<RootPort>,
}

impl CxlMemoryHub {
    pub fn new(ranges: SharedRangeMap, cache: Arc<CacheController>, root_port: Arc<RootPort>) -> Self {
        Self {
            ranges,
            cache,
            root_port,
        }
    }

    pub fn add_mem_range(
        &self,
        base: u64,
        size: u64,
        addr_type: MemAddrType,
    ) -> Result<(), RangeError> {
        self.ranges.lock().unwrap().add(base, size, addr_type)
    }

    pub fn addr_type(&self, addr: u64) -> Option<MemAddrType> {
        self.ranges.lock().unwrap().lookup(addr)
    }

    /// Full-cacheline load at `addr` (aligned down)
    pub async fn load_line(&self, addr: u64) -> Option<CacheLineData> {
        match self.addr_type(addr)? {
            MemAddrType::Dram | MemAddrType::CxlCached | MemAddrType::CxlCachedBI => {
                self.cache.load_line(addr).await
            }
            MemAddrType::CxlUncached => self.cache.uncached_load(addr).await,
            MemAddrType::Mmio => {
                let value = self.root_port.read_mmio(addr).await?;
                let mut line = [0u8; 64];
                line[..4].copy_from_slice(&value.to_le_bytes());
                Some(line)
            }
            MemAddrType::Cfg => {
                warn!(addr, "config space is not load/store addressable");
                None
            }
        }
    }

    pub async fn store_line(&self, addr: u64, data: CacheLineData) -> bool {
        match self.addr_type(addr) {
            Some(MemAddrType::Dram | MemAddrType::CxlCached | MemAddrType::CxlCachedBI) => {
                self.cache.store_line(addr, data).await
            }
            Some(MemAddrType::CxlUncached) => self.cache.uncached_store(addr, data).await,
            Some(MemAddrType::Mmio) => {
                self.root_port
                    .write_mmio(addr, u32::from_le_bytes(data[..4].try_into().unwrap()));
                true
            }
            Some(MemAddrType::Cfg) | None => false,
        }
    }

    /// Narrow load of up to 8 bytes
    pub async fn load(&self, addr: u64, size: usize) -> Option<u64> {
        debug_assert!(size <= 8);
        match self.addr_type(addr)? {
            MemAddrType::Mmio => self.root_port.read_mmio(addr).await.map(u64::from),
            _ => {
                let line = self.load_line(addr & !63).await?;
                let at = (addr % 64) as usize;
                let mut bytes = [0u8; 8];
                bytes[..size].copy_from_slice(&line[at..at + size]);
                Some(u64::from_le_bytes(bytes))
            }
        }
    }

    /// Narrow store of up to 8 bytes
    pub async fn store(&self, addr: u64, size: usize, value: u64) -> bool {
        debug_assert!(size <= 8);
        match self.addr_type(addr) {
            Some(MemAddrType::Mmio) => {
                self.root_port.write_mmio(addr, value as u32);
                true
            }
            Some(MemAddrType::Dram | MemAddrType::CxlCached | MemAddrType::CxlCachedBI) => {
                self.cache.store(addr, size, value).await
            }
            Some(MemAddrType::CxlUncached) => {
                // Read-modify-write through the uncached path
                let line_addr = addr & !63;
                let mut line = match self.cache.uncached_load(line_addr).await {
                    Some(line) => line,
                    None => return false,
                };
                let at = (addr % 64) as usize;
                line[at..at + size].copy_from_slice(&value.to_le_bytes()[..size]);
                self.cache.uncached_store(line_addr, line).await
            }
            Some(MemAddrType::Cfg) | None => false,
        }
    }
}
