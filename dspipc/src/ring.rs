//! Host-side views of the two shared rings.
//!
//! Each ring is single-producer single-consumer across the processor
//! boundary. The host owns exactly one index per ring (command write,
//! response read), keeps a local copy of it and publishes updates with
//! Release stores; the peer-owned index is only ever loaded with Acquire.
//! Indices are monotonic and unwrapped; the low bits select the slot, so
//! capacities must be powers of two.

use std::ptr::NonNull;
use std::sync::atomic::Ordering;

use crate::layout::{ChannelHeader, RingSlot};

/// Host producer view of the command ring.
pub struct CommandRing {
    header: NonNull<ChannelHeader>,
    slots: NonNull<RingSlot>,
    capacity: u32,
    /// Host-owned write index; the shared copy trails this by one store.
    write_idx: u32,
}

// Safety: only one host thread touches a ring view at a time (the proxy
// lock), and the peer side accesses disjoint indices.
unsafe impl Send for CommandRing {}

impl CommandRing {
    /// # Safety
    /// `header` and `slots` must point into a mapped region holding
    /// `capacity` slots, valid for the lifetime of the ring. `capacity`
    /// must be a power of two.
    pub unsafe fn from_raw(
        header: NonNull<ChannelHeader>,
        slots: NonNull<RingSlot>,
        capacity: u32,
    ) -> Self {
        debug_assert!(capacity.is_power_of_two());
        Self {
            header,
            slots,
            capacity,
            write_idx: 0,
        }
    }

    fn header(&self) -> &ChannelHeader {
        unsafe { self.header.as_ref() }
    }

    /// Full when the peer's read index trails by a whole capacity.
    pub fn is_full(&self) -> bool {
        let read = self.header().cmd_read_idx.load(Ordering::Acquire);
        self.write_idx.wrapping_sub(read) >= self.capacity
    }

    /// Write one slot and publish it. The caller checks [`is_full`] first;
    /// the proxy lock makes the check-then-push race-free on the host side.
    ///
    /// [`is_full`]: CommandRing::is_full
    pub fn push(&mut self, slot: RingSlot) {
        debug_assert!(!self.is_full());
        let idx = (self.write_idx & (self.capacity - 1)) as usize;
        unsafe {
            std::ptr::write(self.slots.as_ptr().add(idx), slot);
        }
        self.write_idx = self.write_idx.wrapping_add(1);
        self.header()
            .cmd_write_idx
            .store(self.write_idx, Ordering::Release);
    }

    /// Reinitialize both command indices to zero (channel reset).
    pub fn reset(&mut self) {
        self.write_idx = 0;
        self.header().cmd_write_idx.store(0, Ordering::Release);
        self.header().cmd_read_idx.store(0, Ordering::Release);
    }
}

/// Host consumer view of the response ring.
pub struct ResponseRing {
    header: NonNull<ChannelHeader>,
    slots: NonNull<RingSlot>,
    capacity: u32,
    /// Host-owned read index; the shared copy trails this by one store.
    read_idx: u32,
}

unsafe impl Send for ResponseRing {}

impl ResponseRing {
    /// # Safety
    /// Same contract as [`CommandRing::from_raw`].
    pub unsafe fn from_raw(
        header: NonNull<ChannelHeader>,
        slots: NonNull<RingSlot>,
        capacity: u32,
    ) -> Self {
        debug_assert!(capacity.is_power_of_two());
        Self {
            header,
            slots,
            capacity,
            read_idx: 0,
        }
    }

    fn header(&self) -> &ChannelHeader {
        unsafe { self.header.as_ref() }
    }

    pub fn is_empty(&self) -> bool {
        let write = self.header().rsp_write_idx.load(Ordering::Acquire);
        write == self.read_idx
    }

    /// Consume the oldest committed response, or `None` if the ring is
    /// empty. Publishing the read index is what frees the slot for the
    /// peer to reuse.
    pub fn pop(&mut self) -> Option<RingSlot> {
        let write = self.header().rsp_write_idx.load(Ordering::Acquire);
        if write == self.read_idx {
            return None;
        }
        let idx = (self.read_idx & (self.capacity - 1)) as usize;
        let slot = unsafe { std::ptr::read(self.slots.as_ptr().add(idx)) };
        self.read_idx = self.read_idx.wrapping_add(1);
        self.header()
            .rsp_read_idx
            .store(self.read_idx, Ordering::Release);
        Some(slot)
    }

    /// Reinitialize both response indices to zero (channel reset).
    pub fn reset(&mut self) {
        self.read_idx = 0;
        self.header().rsp_read_idx.store(0, Ordering::Release);
        self.header().rsp_write_idx.store(0, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A header plus both slot arrays, as one heap allocation.
    #[repr(C)]
    struct TestRegion {
        header: ChannelHeader,
        cmd: [RingSlot; 4],
        rsp: [RingSlot; 4],
    }

    impl TestRegion {
        fn new() -> Box<Self> {
            Box::new(Self {
                header: ChannelHeader::new(),
                cmd: [RingSlot::default(); 4],
                rsp: [RingSlot::default(); 4],
            })
        }

        fn rings(&mut self) -> (CommandRing, ResponseRing) {
            let header = NonNull::from(&mut self.header);
            let cmd = NonNull::new(self.cmd.as_mut_ptr()).unwrap();
            let rsp = NonNull::new(self.rsp.as_mut_ptr()).unwrap();
            unsafe {
                (
                    CommandRing::from_raw(header, cmd, 4),
                    ResponseRing::from_raw(header, rsp, 4),
                )
            }
        }
    }

    fn slot(opcode: u32) -> RingSlot {
        RingSlot {
            session_id: 1,
            opcode,
            length: 0,
            address: crate::layout::NULL_OFFSET,
        }
    }

    #[test]
    fn command_publish_visible_to_peer() {
        let mut region = TestRegion::new();
        let (mut cmd, _rsp) = region.rings();

        cmd.push(slot(7));
        assert_eq!(region.header.cmd_write_idx.load(Ordering::Acquire), 1);
        assert_eq!(region.cmd[0].opcode, 7);
    }

    #[test]
    fn command_full_when_peer_stalls() {
        let mut region = TestRegion::new();
        let (mut cmd, _rsp) = region.rings();

        for i in 0..4 {
            assert!(!cmd.is_full());
            cmd.push(slot(i));
        }
        assert!(cmd.is_full());

        // Peer consumes one entry; space opens up.
        region.header.cmd_read_idx.store(1, Ordering::Release);
        assert!(!cmd.is_full());
        cmd.push(slot(4));
        assert!(cmd.is_full());
    }

    #[test]
    fn response_pop_in_order() {
        let mut region = TestRegion::new();
        let (_cmd, mut rsp) = region.rings();

        assert!(rsp.is_empty());
        assert!(rsp.pop().is_none());

        // Peer commits three responses.
        for i in 0..3 {
            region.rsp[i as usize] = slot(i);
        }
        region.header.rsp_write_idx.store(3, Ordering::Release);

        for i in 0..3 {
            assert_eq!(rsp.pop().unwrap().opcode, i);
        }
        assert!(rsp.is_empty());
        assert_eq!(region.header.rsp_read_idx.load(Ordering::Acquire), 3);
    }

    #[test]
    fn response_wraparound() {
        let mut region = TestRegion::new();
        let (_cmd, mut rsp) = region.rings();

        let mut write = 0u32;
        for round in 0..5u32 {
            for i in 0..3u32 {
                region.rsp[(write & 3) as usize] = slot(round * 10 + i);
                write = write.wrapping_add(1);
            }
            region.header.rsp_write_idx.store(write, Ordering::Release);

            for i in 0..3u32 {
                assert_eq!(rsp.pop().unwrap().opcode, round * 10 + i);
            }
            assert!(rsp.is_empty());
        }
    }

    #[test]
    fn reset_zeroes_indices() {
        let mut region = TestRegion::new();
        let (mut cmd, mut rsp) = region.rings();

        cmd.push(slot(1));
        cmd.push(slot(2));
        region.header.rsp_write_idx.store(2, Ordering::Release);
        rsp.pop().unwrap();

        cmd.reset();
        rsp.reset();
        assert_eq!(region.header.cmd_read_idx.load(Ordering::Acquire), 0);
        assert_eq!(region.header.cmd_write_idx.load(Ordering::Acquire), 0);
        assert_eq!(region.header.rsp_read_idx.load(Ordering::Acquire), 0);
        assert_eq!(region.header.rsp_write_idx.load(Ordering::Acquire), 0);

        // Ring is usable again from index zero.
        assert!(!cmd.is_full());
        cmd.push(slot(9));
        assert_eq!(region.cmd[0].opcode, 9);
    }
}
