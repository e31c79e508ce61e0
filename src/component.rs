/*!
Runnable components and their plumbing.

Everything long-lived in the fabric follows one lifecycle: INIT →
RUNNING → STOPPED, with a ready signal raised exactly once in between.
`run()` resolves only when the component has fully stopped;
`wait_for_ready()` suspends until initialisation finished; `stop()`
injects disconnect markers into the component's queues so each internal
loop notices and exits. Queues drain before socket readers are
cancelled.

Components never share state directly. All communication is through the
typed [fifo pairs](fifo) bundled into a [`CxlConnection`], one bundle per
link, one pair per sublayer. The [packet processor](processor) is the
boundary between a socket and those queues.
*/

use snafu::Snafu;

pub mod connection;
pub mod fifo;
pub mod lifecycle;
pub mod processor;

pub use connection::CxlConnection;
pub use fifo::{Fifo, FifoPair};
pub use lifecycle::{Lifecycle, LifecycleState, Runnable};
pub use processor::{DeviceKind, PacketProcessor};

/// Well-formed packet in the wrong place or state. The originating
/// connection is torn down and a disconnect marker propagated; nothing
/// is retried.
#[derive(Snafu, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[snafu(display("transaction id {tid:#06x} already tracked"))]
    DuplicateTransactionId { tid: u32 },
    #[snafu(display("transaction id {tid:#06x} has no outstanding request"))]
    UnknownTransactionId { tid: u32 },
    #[snafu(display("no logical device {ld_id}"))]
    UnknownLogicalDevice { ld_id: u16 },
    #[snafu(display("CCI packet on a component without a CCI consumer"))]
    UnexpectedCci,
    #[snafu(display("snoop received with zero coherent devices attached"))]
    NoCoherentDevices,
    #[snafu(display("unexpected {what} packet"))]
    UnexpectedPacket { what: &'static str },
}
