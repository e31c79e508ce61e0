#![doc = include_str!("../README.md")]

//! #### Design
//!
//! The crate is layered leaves-first:
//! - [transport] — bit-exact packet codec for all sublayers and the
//!   length-prefixed framing over TCP
//! - [component] — lifecycle protocol, typed queues and the
//!   per-connection packet processor
//! - [hdm], [pci], [memory], [cache] — the address decoders, register
//!   models, file-backed store and the inclusive cache they feed
//! - [switch] — connection manager, virtual switch with vPPBs and the
//!   fabric-manager CCI executor
//! - [host] — root port driver, memory hub, home agent and coherency
//!   bridge
//! - [device] — DCOH and the type-3 SLD/MLD devices
//!
//! ### Usage
//!
//! An in-process link between a host-side root port and a type-3
//! device, no sockets involved:
//!
//! ```rust
//! use std::sync::Arc;
//! use cxl_fabric::component::{CxlConnection, Runnable};
//! use cxl_fabric::device::{CxlType3Device, CxlType3DeviceConfig};
//! use cxl_fabric::host::root_port::RootPort;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let link = CxlConnection::new();
//! let device = Arc::new(CxlType3Device::with_connection(
//!     CxlType3DeviceConfig {
//!         device_name: "mem0".into(),
//!         port_index: 0,
//!         switch_addr: None,
//!         memory_size: 0x10_0000,
//!         memory_file: std::env::temp_dir().join("cxl-fabric-doc-mem0.bin"),
//!         cache_num_assoc: 4,
//!         cache_num_set: 8,
//!     },
//!     link.clone(),
//! ));
//! let root_port = RootPort::new(link);
//!
//! let runner = Arc::clone(&device);
//! let running = tokio::spawn(async move { runner.run().await });
//! device.wait_for_ready().await;
//!
//! assert!(root_port.cxl_mem_write(0x1000, [0xA5; 64]).await);
//! assert_eq!(root_port.cxl_mem_read(0x1000).await, Some([0xA5; 64]));
//!
//! device.stop().await;
//! running.await.unwrap();
//! # }
//! ```

pub mod cache;
pub mod component;
pub mod device;
pub mod hdm;
pub mod host;
pub mod memory;
pub mod pci;
pub mod switch;
pub mod transport;

pub use component::{CxlConnection, Runnable};
pub use transport::Packet;
