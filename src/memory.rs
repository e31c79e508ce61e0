/*!
File-backed memory controller.

A thin request/response layer over a backing file: the file is created
zero-filled at `memory_size` on first use, serves 64-byte-aligned
cacheline reads and writes at the same offsets the device uses (raw
bytes, no header), and is removed again on normal shutdown. Misaligned
or out-of-range requests fail without touching the store; the DCOH and
the home agent never issue them.

The backing file is owned exclusively by one controller per device
instance; every access goes through its request queue.
*/

use std::io::SeekFrom;
use std::path::PathBuf;

use tokio::fs::OpenOptions;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, error};

use crate::component::fifo::Fifo;
use crate::component::lifecycle::{Lifecycle, Runnable};
use crate::transport::CacheLineData;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryRequest {
    Read { addr: u64 },
    Write { addr: u64, data: CacheLineData },
}

impl MemoryRequest {
    pub fn addr(&self) -> u64 {
        match self {
            Self::Read { addr } | Self::Write { addr, .. } => *addr,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryStatus {
    Ok,
    Misaligned,
    OutOfRange,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryResponse {
    pub status: MemoryStatus,
    pub data: CacheLineData,
}

impl MemoryResponse {
    pub fn ok(data: CacheLineData) -> Self {
        Self {
            status: MemoryStatus::Ok,
            data,
        }
    }

    fn failed(status: MemoryStatus) -> Self {
        Self {
            status,
            data: [0; 64],
        }
    }
}

/// Producer/consumer handle pair for one memory controller
#[derive(Clone, Default)]
pub struct MemoryFifoPair {
    pub request: Fifo<MemoryRequest>,
    pub response: Fifo<MemoryResponse>,
    /// Serialises producers so responses pair with their requests
    turn: std::sync::Arc<Mutex<()>>,
}

impl MemoryFifoPair {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issues one request and waits for its response
    pub async fn transfer(&self, request: MemoryRequest) -> Option<MemoryResponse> {
        let _turn = self.turn.lock().await;
        self.request.send(request);
        self.response.recv().await
    }

    pub async fn read(&self, addr: u64) -> Option<CacheLineData> {
        let response = self.transfer(MemoryRequest::Read { addr }).await?;
        (response.status == MemoryStatus::Ok).then_some(response.data)
    }

    pub async fn write(&self, addr: u64, data: CacheLineData) -> bool {
        matches!(
            self.transfer(MemoryRequest::Write { addr, data }).await,
            Some(MemoryResponse {
                status: MemoryStatus::Ok,
                ..
            })
        )
    }
}

#[derive(Debug, Clone)]
pub struct MemoryControllerConfig {
    pub memory_size: u64,
    pub memory_file: PathBuf,
}

pub struct MemoryController {
    config: MemoryControllerConfig,
    fifos: MemoryFifoPair,
    file: Mutex<Option<tokio::fs::File>>,
    lifecycle: Lifecycle,
}

impl MemoryController {
    pub fn new(config: MemoryControllerConfig, fifos: MemoryFifoPair) -> Self {
        Self {
            config,
            fifos,
            file: Mutex::new(None),
            lifecycle: Lifecycle::new(),
        }
    }

    pub fn memory_size(&self) -> u64 {
        self.config.memory_size
    }

    fn check(&self, addr: u64) -> MemoryStatus {
        if addr % 64 != 0 {
            MemoryStatus::Misaligned
        } else if addr + 64 > self.config.memory_size {
            MemoryStatus::OutOfRange
        } else {
            MemoryStatus::Ok
        }
    }

    async fn serve(&self, request: MemoryRequest) -> std::io::Result<MemoryResponse> {
        let status = self.check(request.addr());
        if status != MemoryStatus::Ok {
            return Ok(MemoryResponse::failed(status));
        }
        let mut guard = self.file.lock().await;
        let file = guard.as_mut().expect("backing file opened in run");
        file.seek(SeekFrom::Start(request.addr())).await?;
        match request {
            MemoryRequest::Read { .. } => {
                let mut data = [0u8; 64];
                file.read_exact(&mut data).await?;
                Ok(MemoryResponse::ok(data))
            }
            MemoryRequest::Write { data, .. } => {
                file.write_all(&data).await?;
                Ok(MemoryResponse::ok(data))
            }
        }
    }

    async fn process_requests(&self) {
        while let Some(request) = self.fifos.request.recv().await {
            match self.serve(request).await {
                Ok(response) => self.fifos.response.send(response),
                Err(error) => {
                    error!(%error, "backing file IO failed");
                    self.fifos.response.disconnect();
                    break;
                }
            }
        }
        debug!("stopped processing memory requests");
    }
}

impl Runnable for MemoryController {
    fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    async fn run(&self) {
        match OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.config.memory_file)
            .await
        {
            Ok(file) => {
                if let Err(error) = file.set_len(self.config.memory_size).await {
                    error!(%error, "sizing backing file failed");
                }
                *self.file.lock().await = Some(file);
            }
            Err(error) => {
                error!(%error, path = %self.config.memory_file.display(), "opening backing file failed");
                self.lifecycle.set_stopped();
                return;
            }
        }
        self.lifecycle.set_running();
        self.process_requests().await;
        // Clean shutdown removes the store; a crash leaves it for inspection
        self.file.lock().await.take();
        if let Err(error) = tokio::fs::remove_file(&self.config.memory_file).await {
            debug!(%error, "backing file already gone");
        }
        self.lifecycle.set_stopped();
    }

    async fn stop(&self) {
        self.fifos.request.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::lifecycle::Runnable;
    use pretty_assertions::assert_eq;

    fn controller(dir: &tempfile::TempDir) -> (MemoryController, MemoryFifoPair) {
        let fifos = MemoryFifoPair::new();
        let controller = MemoryController::new(
            MemoryControllerConfig {
                memory_size: 0x10000,
                memory_file: dir.path().join("mem0.bin"),
            },
            fifos.clone(),
        );
        (controller, fifos)
    }

    #[tokio::test]
    async fn read_returns_what_write_stored() {
        let dir = tempfile::tempdir().unwrap();
        let (controller, fifos) = controller(&dir);
        let run = async { controller.run().await };
        let check = async {
            controller.wait_for_ready().await;
            // Fresh store reads back zero
            assert_eq!(fifos.read(0x1000).await, Some([0; 64]));
            assert!(fifos.write(0x1000, [0xCD; 64]).await);
            assert_eq!(fifos.read(0x1000).await, Some([0xCD; 64]));
            controller.stop().await;
        };
        tokio::join!(run, check);
    }

    #[tokio::test]
    async fn misaligned_and_out_of_range_fail() {
        let dir = tempfile::tempdir().unwrap();
        let (controller, fifos) = controller(&dir);
        let run = async { controller.run().await };
        let check = async {
            controller.wait_for_ready().await;
            let response = fifos.transfer(MemoryRequest::Read { addr: 0x20 }).await;
            assert_eq!(response.unwrap().status, MemoryStatus::Misaligned);
            let response = fifos.transfer(MemoryRequest::Read { addr: 0x10000 }).await;
            assert_eq!(response.unwrap().status, MemoryStatus::OutOfRange);
            controller.stop().await;
        };
        tokio::join!(run, check);
    }

    #[tokio::test]
    async fn backing_file_is_removed_on_clean_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let (controller, fifos) = controller(&dir);
        let path = dir.path().join("mem0.bin");
        let run = async { controller.run().await };
        let check = async {
            controller.wait_for_ready().await;
            assert!(fifos.write(0, [1; 64]).await);
            assert!(path.exists());
            controller.stop().await;
        };
        tokio::join!(run, check);
        assert!(!path.exists());
    }
}
