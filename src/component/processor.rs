/*!
Per-connection packet processor.

One of these sits on every socket. It demultiplexes incoming packets
into the per-sublayer queues of its [`CxlConnection`] and drains the
outgoing queues back onto the socket. Three rules define the demux:

1. CXL.io completions are paired to requests through a transaction-id
   table. Requests record `tid -> {CFG, MMIO}`; the matching completion
   consumes the entry to pick its queue. A duplicate or unknown tid
   tears the connection down.
2. CXL.mem and CXL.cache route by sublayer alone, except that at a
   multi-logical device the `ld_id` in the header picks the per-LD
   queue bundle.
3. CCI goes to the FMLD mailbox on an MLD, to the CCI queue on a
   downstream switch port, and is rejected everywhere else.

On disconnect (socket loss, malformed packet, protocol violation or
`stop`) the processor pushes a disconnect marker onto every queue so
both the socket pumps and the local consumers wake up, then transitions
to STOPPED.
*/

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex as StdMutex;

use tokio::sync::{Mutex, Notify};
use tracing::{debug, warn};

use crate::component::connection::CxlConnection;
use crate::component::fifo::{Fifo, FifoPair};
use crate::component::lifecycle::{Lifecycle, Runnable};
use crate::component::ProtocolError;
use crate::transport::framed::{FramedError, FramedReader, FramedWriter};
use crate::transport::{CciMessage, Packet};

/// What kind of endpoint this processor serves. Decides queue
/// directions, LD fan-out and CCI handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    /// Host root port: talks *down* into the fabric
    Host,
    /// Switch upstream port: receives host traffic
    UpstreamPort,
    /// Switch downstream port: receives device traffic
    DownstreamPort,
    /// Type-3 single logical device
    SingleLogicalDevice,
    /// Type-3 multi-logical device; `ld_id` selects the queue bundle
    MultiLogicalDevice,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IoFifoKind {
    Cfg,
    Mmio,
}

pub struct PacketProcessor {
    kind: DeviceKind,
    connections: Vec<CxlConnection>,
    /// CCI mailbox of the FM-owned LD; present only on an MLD
    fmld_cci: Option<FifoPair<CciMessage>>,
    reader: Mutex<Option<FramedReader>>,
    writer: Mutex<FramedWriter>,
    tid_table: StdMutex<HashMap<u32, IoFifoKind>>,
    torn_down: AtomicBool,
    lifecycle: Lifecycle,
    shutdown: Notify,
}

impl PacketProcessor {
    pub fn new(
        reader: FramedReader,
        writer: FramedWriter,
        connections: Vec<CxlConnection>,
        kind: DeviceKind,
    ) -> Self {
        assert!(!connections.is_empty());
        let fmld_cci = match kind {
            DeviceKind::MultiLogicalDevice => Some(FifoPair::new()),
            _ => None,
        };
        Self {
            kind,
            connections,
            fmld_cci,
            reader: Mutex::new(Some(reader)),
            writer: Mutex::new(writer),
            tid_table: StdMutex::new(HashMap::new()),
            torn_down: AtomicBool::new(false),
            lifecycle: Lifecycle::new(),
            shutdown: Notify::new(),
        }
    }

    /// The FMLD CCI mailbox; the MLD attaches its FM-owned LD here
    pub fn fmld_cci(&self) -> Option<&FifoPair<CciMessage>> {
        self.fmld_cci.as_ref()
    }

    fn incoming_is_host_to_target(&self) -> bool {
        matches!(
            self.kind,
            DeviceKind::UpstreamPort
                | DeviceKind::SingleLogicalDevice
                | DeviceKind::MultiLogicalDevice
        )
    }

    fn in_fifo<'a, T>(&self, pair: &'a FifoPair<T>) -> &'a Fifo<T> {
        if self.incoming_is_host_to_target() {
            &pair.host_to_target
        } else {
            &pair.target_to_host
        }
    }

    fn out_fifo<'a, T>(&self, pair: &'a FifoPair<T>) -> &'a Fifo<T> {
        if self.incoming_is_host_to_target() {
            &pair.target_to_host
        } else {
            &pair.host_to_target
        }
    }

    fn connection_for_ld(&self, ld_id: u16) -> Result<&CxlConnection, ProtocolError> {
        if self.kind == DeviceKind::MultiLogicalDevice {
            self.connections
                .get(usize::from(ld_id))
                .ok_or(ProtocolError::UnknownLogicalDevice { ld_id })
        } else {
            Ok(&self.connections[0])
        }
    }

    fn push_tid(&self, tid: u32, kind: IoFifoKind) -> Result<(), ProtocolError> {
        let mut table = self.tid_table.lock().unwrap();
        if table.insert(tid, kind).is_some() {
            return Err(ProtocolError::DuplicateTransactionId { tid });
        }
        Ok(())
    }

    fn pop_tid(&self, tid: u32) -> Result<IoFifoKind, ProtocolError> {
        self.tid_table
            .lock()
            .unwrap()
            .remove(&tid)
            .ok_or(ProtocolError::UnknownTransactionId { tid })
    }

    fn dispatch_incoming(&self, packet: Packet) -> Result<(), ProtocolError> {
        match packet {
            Packet::Io(io) => {
                let connection = self.connection_for_ld(io.ld_id())?;
                if io.is_cpl() || io.is_cpld() {
                    match self.pop_tid(io.transaction_id())? {
                        IoFifoKind::Cfg => self.in_fifo(&connection.cfg).send(io),
                        IoFifoKind::Mmio => self.in_fifo(&connection.mmio).send(io),
                    }
                } else if io.is_cfg() {
                    self.push_tid(io.transaction_id(), IoFifoKind::Cfg)?;
                    self.in_fifo(&connection.cfg).send(io);
                } else if io.is_mmio() {
                    if !io.is_mem_write() {
                        self.push_tid(io.transaction_id(), IoFifoKind::Mmio)?;
                    }
                    self.in_fifo(&connection.mmio).send(io);
                } else {
                    return Err(ProtocolError::UnexpectedPacket { what: "CXL.io" });
                }
            }
            Packet::Mem(mem) => {
                let connection = self.connection_for_ld(mem.ld_id().into())?;
                self.in_fifo(&connection.cxl_mem).send(mem);
            }
            Packet::Cache(cache) => {
                self.in_fifo(&self.connections[0].cxl_cache).send(cache);
            }
            Packet::Cci(message) => match (self.kind, &self.fmld_cci) {
                (DeviceKind::MultiLogicalDevice, Some(fmld)) => {
                    fmld.host_to_target.send(message)
                }
                (DeviceKind::DownstreamPort, _) => {
                    self.in_fifo(&self.connections[0].cci).send(message)
                }
                _ => return Err(ProtocolError::UnexpectedCci),
            },
            Packet::Sideband(_) => {
                return Err(ProtocolError::UnexpectedPacket { what: "sideband" })
            }
        }
        Ok(())
    }

    /// Wakes every queue of the processor so pumps and consumers exit.
    /// One marker per queue; every loop exit funnels through here.
    fn fan_out_disconnect(&self) {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return;
        }
        for connection in &self.connections {
            connection.disconnect_all();
        }
        if let Some(fmld) = &self.fmld_cci {
            fmld.disconnect_both();
        }
    }

    async fn process_incoming(&self, mut reader: FramedReader) {
        loop {
            let packet = tokio::select! {
                _ = self.shutdown.notified() => break,
                result = reader.read_packet() => match result {
                    Ok(packet) => packet,
                    Err(FramedError::Disconnected) => {
                        debug!("peer disconnected");
                        break;
                    }
                    Err(error) => {
                        warn!(%error, "dropping connection");
                        break;
                    }
                },
            };
            if let Err(error) = self.dispatch_incoming(packet) {
                warn!(%error, "protocol violation, dropping connection");
                break;
            }
        }
        self.fan_out_disconnect();
    }

    async fn write(&self, packet: Packet) -> bool {
        match self.writer.lock().await.write_packet(&packet).await {
            Ok(()) => true,
            Err(error) => {
                debug!(%error, "write failed, stopping outgoing pump");
                false
            }
        }
    }

    /// CFG and MMIO pumps maintain the tid table for requests they
    /// emit and completions they return
    async fn process_outgoing_io(&self, kind: IoFifoKind) {
        let pair = match kind {
            IoFifoKind::Cfg => &self.connections[0].cfg,
            IoFifoKind::Mmio => &self.connections[0].mmio,
        };
        let fifo = self.out_fifo(pair);
        while let Some(io) = fifo.recv().await {
            let bookkeeping = if io.is_cpl() || io.is_cpld() {
                self.pop_tid(io.transaction_id()).map(|_| ())
            } else if kind == IoFifoKind::Mmio && io.is_mem_write() {
                Ok(())
            } else {
                self.push_tid(io.transaction_id(), kind)
            };
            if let Err(error) = bookkeeping {
                warn!(%error, "transaction table corrupt, dropping connection");
                break;
            }
            if !self.write(Packet::Io(io)).await {
                break;
            }
        }
        self.fan_out_disconnect();
    }

    async fn process_outgoing_mem(&self) {
        let fifo = self.out_fifo(&self.connections[0].cxl_mem);
        while let Some(mem) = fifo.recv().await {
            if !self.write(Packet::Mem(mem)).await {
                break;
            }
        }
        self.fan_out_disconnect();
    }

    async fn process_outgoing_cache(&self) {
        let fifo = self.out_fifo(&self.connections[0].cxl_cache);
        while let Some(cache) = fifo.recv().await {
            if !self.write(Packet::Cache(cache)).await {
                break;
            }
        }
        self.fan_out_disconnect();
    }

    async fn process_outgoing_cci(&self) {
        let fifo = match &self.fmld_cci {
            Some(fmld) => &fmld.target_to_host,
            None => self.out_fifo(&self.connections[0].cci),
        };
        while let Some(message) = fifo.recv().await {
            if !self.write(Packet::Cci(message)).await {
                break;
            }
        }
        self.fan_out_disconnect();
    }
}

impl Runnable for PacketProcessor {
    fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    async fn run(&self) {
        let reader = self
            .reader
            .lock()
            .await
            .take()
            .expect("packet processor runs once");
        self.lifecycle.set_running();
        tokio::join!(
            self.process_incoming(reader),
            self.process_outgoing_io(IoFifoKind::Cfg),
            self.process_outgoing_io(IoFifoKind::Mmio),
            self.process_outgoing_mem(),
            self.process_outgoing_cache(),
            self.process_outgoing_cci(),
        );
        self.lifecycle.set_stopped();
    }

    async fn stop(&self) {
        // notify_one stores a permit, so a stop racing ahead of the
        // reader's first poll still lands
        self.shutdown.notify_one();
        self.fan_out_disconnect();
    }
}
