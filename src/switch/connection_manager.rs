/*!
Switch connection manager.

A TCP server bound to a configured port set `[USP, DSP, DSP, ...]`. On
accept it performs the sideband handshake: the first packet must be a
`connection_request(port_index)`; the request is accepted iff the index
is in range and that port is currently disconnected, rejected
otherwise. An accepted stream is bound to the port slot's queue bundle
and served by a per-port packet processor until the socket dies.

Port connect/disconnect transitions are published on the
[`PortUpdateEvent`] queue the virtual switch consumes.
*/

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::component::fifo::Fifo;
use crate::component::lifecycle::{Lifecycle, Runnable};
use crate::component::processor::{DeviceKind, PacketProcessor};
use crate::switch::{PhysicalPort, PortKind};
use crate::transport::framed::{self, FramedWriter};
use crate::transport::{Packet, SidebandPacket};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortUpdateEvent {
    pub port_id: u8,
    pub connected: bool,
}

struct PortSlot {
    port: PhysicalPort,
    connected: AtomicBool,
    processor: StdMutex<Option<Arc<PacketProcessor>>>,
}

struct Shared {
    slots: Vec<PortSlot>,
    events: Fifo<PortUpdateEvent>,
}

pub struct SwitchConnectionManager {
    shared: Arc<Shared>,
    listen_addr: String,
    local_addr: StdMutex<Option<SocketAddr>>,
    clients: StdMutex<Vec<JoinHandle<()>>>,
    lifecycle: Lifecycle,
    shutdown: Notify,
}

impl SwitchConnectionManager {
    /// `listen_addr` may name port 0; the OS-chosen address is readable
    /// through `local_addr` once the manager is ready
    pub fn new(port_kinds: Vec<PortKind>, listen_addr: String) -> Self {
        let slots = port_kinds
            .into_iter()
            .map(|kind| PortSlot {
                port: PhysicalPort {
                    kind,
                    connection: crate::component::CxlConnection::new(),
                },
                connected: AtomicBool::new(false),
                processor: StdMutex::new(None),
            })
            .collect();
        Self {
            shared: Arc::new(Shared {
                slots,
                events: Fifo::new(),
            }),
            listen_addr,
            local_addr: StdMutex::new(None),
            clients: StdMutex::new(Vec::new()),
            lifecycle: Lifecycle::new(),
            shutdown: Notify::new(),
        }
    }

    /// Queue bundle view of the ports, for the virtual switch
    pub fn physical_ports(&self) -> Vec<PhysicalPort> {
        self.shared.slots.iter().map(|s| s.port.clone()).collect()
    }

    pub fn port_events(&self) -> Fifo<PortUpdateEvent> {
        self.shared.events.clone()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().unwrap()
    }

    pub fn is_port_connected(&self, port: u8) -> bool {
        self.shared
            .slots
            .get(usize::from(port))
            .is_some_and(|s| s.connected.load(Ordering::Relaxed))
    }
}

async fn reject(writer: &mut FramedWriter) {
    let _ = writer
        .write_packet(&Packet::Sideband(SidebandPacket::ConnectionReject))
        .await;
}

async fn handle_client(shared: Arc<Shared>, stream: TcpStream) {
    stream.set_nodelay(true).ok();
    let (mut reader, mut writer) = framed::split(stream);
    let requested = match reader.read_packet().await {
        Ok(Packet::Sideband(SidebandPacket::ConnectionRequest { port })) => port,
        Ok(_) | Err(_) => {
            warn!("handshake error, rejecting connection");
            reject(&mut writer).await;
            return;
        }
    };
    let Some(slot) = shared.slots.get(usize::from(requested)) else {
        warn!(port = requested, "connection request for invalid port");
        reject(&mut writer).await;
        return;
    };
    if slot.connected.swap(true, Ordering::SeqCst) {
        warn!(port = requested, "connection already exists for port");
        reject(&mut writer).await;
        return;
    }
    if writer
        .write_packet(&Packet::Sideband(SidebandPacket::ConnectionAccept))
        .await
        .is_err()
    {
        slot.connected.store(false, Ordering::SeqCst);
        return;
    }
    info!(port = requested, "bound incoming connection to port");
    // Anything left over from a previous life of this port is stale
    slot.port.connection.drain_all().await;
    shared.events.send(PortUpdateEvent {
        port_id: requested as u8,
        connected: true,
    });

    let kind = match slot.port.kind {
        PortKind::Usp => DeviceKind::UpstreamPort,
        PortKind::Dsp => DeviceKind::DownstreamPort,
    };
    let processor = Arc::new(PacketProcessor::new(
        reader,
        writer,
        vec![slot.port.connection.clone()],
        kind,
    ));
    *slot.processor.lock().unwrap() = Some(Arc::clone(&processor));
    processor.run().await;
    *slot.processor.lock().unwrap() = None;

    slot.connected.store(false, Ordering::SeqCst);
    shared.events.send(PortUpdateEvent {
        port_id: requested as u8,
        connected: false,
    });
    info!(port = requested, "closed client connection");
}

impl Runnable for SwitchConnectionManager {
    fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    async fn run(&self) {
        let listener = match TcpListener::bind(&self.listen_addr).await {
            Ok(listener) => listener,
            Err(error) => {
                error!(%error, addr = %self.listen_addr, "switch listener bind failed");
                self.lifecycle.set_stopped();
                return;
            }
        };
        let addr = listener.local_addr().ok();
        *self.local_addr.lock().unwrap() = addr;
        if let Some(addr) = addr {
            info!(%addr, "switch listening");
        }
        self.lifecycle.set_running();
        loop {
            tokio::select! {
                _ = self.shutdown.notified() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(%peer, "new socket connection");
                        let shared = Arc::clone(&self.shared);
                        self.clients
                            .lock()
                            .unwrap()
                            .push(tokio::spawn(handle_client(shared, stream)));
                    }
                    Err(error) => {
                        warn!(%error, "accept failed");
                    }
                },
            }
        }
        let processors: Vec<_> = self
            .shared
            .slots
            .iter()
            .filter_map(|slot| slot.processor.lock().unwrap().clone())
            .collect();
        for processor in processors {
            processor.stop().await;
        }
        for client in self.clients.lock().unwrap().drain(..) {
            client.abort();
        }
        self.lifecycle.set_stopped();
    }

    async fn stop(&self) {
        self.shutdown.notify_one();
    }
}
