//! # dspipc - shared-memory messaging channel to a DSP coprocessor
//!
//! This crate implements the host side of an asynchronous command/response
//! protocol between a general-purpose CPU and a DSP core. The two processors
//! share a fixed memory region holding a pair of single-producer
//! single-consumer ring buffers (commands host->peer, responses peer->host);
//! the only cross-processor synchronization primitives are the monotonic
//! ring indices and a hardware mailbox interrupt.
//!
//! ## Features
//!
//! - **Fixed message pool**: a preallocated arena of message descriptors is
//!   the unit of flow control; exhaustion blocks callers instead of failing
//! - **Lock-free ring protocol**: each ring index is written by exactly one
//!   side, so no cross-processor lock exists
//! - **Multiplexed delivery**: responses carry a session id routing them to
//!   one of many registered clients
//! - **Sync and async calls**: `submit` returns after staging a command;
//!   `call` blocks until the paired response arrives or a timeout fires
//! - **Interrupt-driven draining**: the mailbox interrupt entry never blocks;
//!   ring maintenance runs on a dedicated worker thread
//!
//! ## Architecture
//!
//! - [`config`]: channel configuration (`ProxyConfig`)
//! - [`error`]: error taxonomy (`Error`, `Result`)
//! - [`message`]: message descriptors, the free pool and intrusive FIFO
//!   queues (`MessagePool`, `MessageQueue`)
//! - [`layout`]: shared-memory wire format and address translation
//!   (`ChannelHeader`, `RingSlot`, `ScratchWindow`)
//! - [`ring`]: host-side views of the two shared rings
//! - [`mailbox`]: the doorbell interface to the mailbox hardware
//! - [`client`]: registered endpoints (`Client`)
//! - [`proxy`]: the channel itself (`Proxy`) - drain engine, demultiplexer,
//!   call APIs, reset path
//! - [`shm`]: shared memory region helpers

pub mod client;
pub mod config;
pub mod error;
pub mod layout;
pub mod mailbox;
pub mod message;
pub mod proxy;
pub mod ring;
pub mod shm;

pub use client::Client;
pub use config::ProxyConfig;
pub use error::{Error, Result};
pub use layout::{
    ChannelHeader, LocalPtr, RingSlot, ScratchWindow, ShmLayout, HEADER_SIZE, NULL_OFFSET,
    SLOT_SIZE,
};
pub use mailbox::{Mailbox, CTRL_CORE_EXIT, CTRL_CORE_READY, CTRL_DATA};
pub use message::{MessagePool, MessageQueue, MsgRef};
pub use proxy::{Proxy, ProxyMessage, OP_ALLOC, OP_FREE, PROXY_SESSION};
pub use shm::{OwnedRegion, SharedRegion};
