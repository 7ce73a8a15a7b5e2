//! # rdm-endpoint
//!
//! A reliable, ordered, message-oriented endpoint built on top of a
//! user-space RDMA datagram device that only guarantees unreliable
//! send/receive plus one-sided read/write with immediate data.
//!
//! ## Architecture
//!
//! - **Protocol selection**: each send picks one of five wire protocols
//!   (eager, medium, long-CTS, long-read, runting-read) by size, memory
//!   interface and peer capability.
//! - **Ordering**: per-peer message ids with a receive-side reorder
//!   window; DATA within a message is placed by offset.
//! - **Flow control**: receiver-granted CTS windows for large messages,
//!   per-peer credits and exponential RNR backoff for transient faults.
//! - **Progress**: a single non-blocking engine drains the device
//!   completion queue and services every queued-work list.
//!
//! Device access, address vectors, memory registration, the atomic
//! arithmetic library, the shared-memory fast path and the external
//! receive-matching service are collaborators behind traits; the
//! [`testing`] module provides loopback implementations of all of them.

pub mod av;
pub mod cq;
pub mod domain;
pub mod endpoint;
pub mod env;
pub mod error;
pub mod nic;
pub mod ope;
pub mod peer;
pub mod pkt;
pub mod pool;
mod progress;
pub mod proto;
mod rx;
pub mod shm;
pub mod srx;
pub mod testing;
pub mod time;
mod tx;

pub use av::{Addr, AddressVector};
pub use cq::{CqEntry, CqErrEntry, Counters, EndpointEvent};
pub use domain::{AtomicMath, Domain, MrDesc, MrProvider};
pub use endpoint::{AtomicDesc, Collaborators, Endpoint, RecvDesc, RmaDesc, SendDesc};
pub use env::{Config, MemIface, RNR_INFINITE_RETRY};
pub use error::{RdmError, RdmResult};
pub use nic::{NicCompletion, NicDest, NicDevice, RawAddr, RemoteSlice};
pub use ope::{DataVec, OpFlags};
pub use srx::{PeerSrx, SrxHandle, SrxMsgInfo};
pub use time::{ManualTimeProvider, SystemTimeProvider, TimeProvider};
