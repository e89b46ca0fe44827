//! USB/IP host server: shares locally attached USB devices over TCP
//! (port 3240) to remote `vhci-hcd` peers.
//!
//! The binary crate (`src/bin/usbipd.rs`) wires these pieces together
//! behind a CLI; this library is organized leaf-first, matching the
//! component table in the design notes each module's doc comment
//! refers back to.

pub mod bus_id;
pub mod capture;
pub mod capture_sink;
pub mod config;
pub mod endian;
pub mod engine;
pub mod enumerator;
pub mod errno;
pub mod flock;
pub mod pcapng;
pub mod privilege;
pub mod proto;
pub mod protocol;
pub mod listener;
pub mod registry;

pub use bus_id::BusId;
pub use endian::{BeI32, BeU16, BeU32, BeU64};
pub use proto::*;
