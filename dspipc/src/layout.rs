//! Shared-memory wire format and address translation.
//!
//! The region starts with four 32-bit monotonic ring indices, followed by
//! the command ring's slot array, then the response ring's slot array.
//! Everything after the slot arrays is the scratch window: the memory that
//! slot `address` fields refer to, as offsets relative to the window base.

use std::sync::atomic::AtomicU32;

use crate::error::{Error, Result};

/// The on-wire "no buffer" address.
pub const NULL_OFFSET: u32 = u32::MAX;

/// Ring index block at the start of the shared region.
///
/// Each counter increases monotonically without wrapping to the slot count;
/// the low bits select the slot. Each is written by exactly one processor
/// and only read by the other.
#[repr(C)]
pub struct ChannelHeader {
    pub cmd_read_idx: AtomicU32,
    pub cmd_write_idx: AtomicU32,
    pub rsp_read_idx: AtomicU32,
    pub rsp_write_idx: AtomicU32,
}

pub const HEADER_SIZE: usize = 16;
const _: () = assert!(std::mem::size_of::<ChannelHeader>() == HEADER_SIZE);

impl ChannelHeader {
    pub const fn new() -> Self {
        Self {
            cmd_read_idx: AtomicU32::new(0),
            cmd_write_idx: AtomicU32::new(0),
            rsp_read_idx: AtomicU32::new(0),
            rsp_write_idx: AtomicU32::new(0),
        }
    }
}

impl Default for ChannelHeader {
    fn default() -> Self {
        Self::new()
    }
}

/// One ring entry. `address` is a scratch-window-relative offset, or
/// [`NULL_OFFSET`] for "no buffer".
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RingSlot {
    pub session_id: u32,
    pub opcode: u32,
    pub length: u32,
    pub address: u32,
}

pub const SLOT_SIZE: usize = 16;
const _: () = assert!(std::mem::size_of::<RingSlot>() == SLOT_SIZE);

/// Byte offsets of each section within the shared region.
#[derive(Debug, Clone, Copy)]
pub struct ShmLayout {
    /// Offset of the command slot array.
    pub cmd_slots: usize,
    /// Offset of the response slot array.
    pub rsp_slots: usize,
    /// Offset of the scratch window.
    pub scratch: usize,
    /// Bytes available in the scratch window.
    pub scratch_size: usize,
}

impl ShmLayout {
    /// Compute the layout for a region of `region_size` bytes holding two
    /// rings of `ring_capacity` slots each.
    pub fn new(ring_capacity: u32, region_size: usize) -> Result<Self> {
        let cap = ring_capacity as usize;
        let cmd_slots = HEADER_SIZE;
        let rsp_slots = cmd_slots + cap * SLOT_SIZE;
        let scratch = rsp_slots + cap * SLOT_SIZE;
        if region_size < scratch {
            return Err(Error::RegionTooSmall {
                required: scratch,
                provided: region_size,
            });
        }
        Ok(Self {
            cmd_slots,
            rsp_slots,
            scratch,
            scratch_size: region_size - scratch,
        })
    }
}

/// Result of translating a wire address back to a host pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalPtr {
    /// A pointer inside the scratch window.
    Ptr(*mut u8),
    /// The on-wire null sentinel.
    Null,
    /// An offset outside the window.
    Invalid,
}

/// Translates between host pointers and scratch-window-relative offsets.
///
/// Pure functions of the window bounds: no locking, no side effects. A host
/// pointer outside the window encodes as the window size, which is distinct
/// from [`NULL_OFFSET`] and rejected by the reverse mapping.
#[derive(Debug, Clone, Copy)]
pub struct ScratchWindow {
    base: *mut u8,
    size: u32,
}

// Safety: the window only stores the region bounds; it performs no access.
unsafe impl Send for ScratchWindow {}
unsafe impl Sync for ScratchWindow {}

impl ScratchWindow {
    pub fn new(base: *mut u8, size: u32) -> Self {
        Self { base, size }
    }

    pub fn base(&self) -> *mut u8 {
        self.base
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    /// Host pointer to wire address.
    pub fn to_shared(&self, p: *mut u8) -> u32 {
        if p.is_null() {
            return NULL_OFFSET;
        }
        let off = (p as usize).wrapping_sub(self.base as usize);
        if off < self.size as usize {
            off as u32
        } else {
            self.size
        }
    }

    /// Wire address to host pointer.
    pub fn to_local(&self, address: u32) -> LocalPtr {
        if address == NULL_OFFSET {
            LocalPtr::Null
        } else if address < self.size {
            LocalPtr::Ptr(unsafe { self.base.add(address as usize) })
        } else {
            LocalPtr::Invalid
        }
    }
}
