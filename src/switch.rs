/*!
The virtual CXL switch.

A switch multiplexes one upstream port across N downstream ports
through virtual PCI-to-PCI bridges (vPPBs). The [connection
manager](connection_manager) owns the TCP side: it accepts one socket
per physical port after a sideband handshake and runs a packet
processor for each. The [virtual switch](virtual_switch) owns the
routing fabric: the USP bridge and its register block, the vPPB bridge
config spaces, the bind/unbind state machine and the per-packet
forwarding rules for all four sublayers. The [fabric
manager](fabric_manager) executes the CCI command set against both.
*/

use snafu::Snafu;

use crate::component::connection::CxlConnection;

pub mod connection_manager;
pub mod fabric_manager;
pub mod virtual_switch;

pub use connection_manager::{PortUpdateEvent, SwitchConnectionManager};
pub use fabric_manager::FabricManager;
pub use virtual_switch::{VirtualSwitch, VirtualSwitchConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortKind {
    Usp,
    Dsp,
}

/// One physical switch port: its kind and the queue bundle the packet
/// processor (or an in-process peer) is attached to
#[derive(Clone)]
pub struct PhysicalPort {
    pub kind: PortKind,
    pub connection: CxlConnection,
}

impl PhysicalPort {
    pub fn usp() -> Self {
        Self {
            kind: PortKind::Usp,
            connection: CxlConnection::new(),
        }
    }

    pub fn dsp() -> Self {
        Self {
            kind: PortKind::Dsp,
            connection: CxlConnection::new(),
        }
    }
}

/// Bind/unbind and construction precondition failures. Reported to the
/// caller with no side effects on the switch.
#[derive(Snafu, Debug, Clone, PartialEq, Eq)]
pub enum SwitchConfigError {
    #[snafu(display("port_index {port} is out of bound"))]
    PortOutOfRange { port: u8 },
    #[snafu(display("physical port {port} is not DSP"))]
    PortNotDsp { port: u8 },
    #[snafu(display("physical port {port} is not USP"))]
    PortNotUsp { port: u8 },
    #[snafu(display("vPPB {vppb} is out of bound"))]
    VppbOutOfRange { vppb: usize },
    #[snafu(display("vPPB {vppb} is already bound"))]
    VppbAlreadyBound { vppb: usize },
    #[snafu(display("physical port {port} is already bound to vPPB {vppb}"))]
    PortAlreadyBound { port: u8, vppb: usize },
    #[snafu(display("vPPB {vppb} is not bound to any physical port"))]
    VppbNotBound { vppb: usize },
    #[snafu(display("length of initial binds ({got}) and vppb count ({expected}) must be the same"))]
    InitialBindCount { expected: usize, got: usize },
}
