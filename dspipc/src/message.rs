//! Message descriptors, the free pool and the intrusive FIFO queues.
//!
//! A `Message` is the unit of communication: a small descriptor naming a
//! session, an opcode and a payload buffer inside the shared scratch window.
//! Descriptors live in a fixed arena (`MessagePool`) and move between the
//! free list and FIFO queues by index, never by copy. Each descriptor is a
//! member of exactly one list at any time; an owner tag checked on every
//! move enforces that.

use std::ptr;

/// Sentinel index terminating every intrusive list.
const NIL: u32 = u32::MAX;

/// Handle to a pooled message descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsgRef(pub(crate) u32);

/// Which list currently owns a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Owner {
    /// On the free list.
    Pool,
    /// Staged on the outbound command queue.
    CommandQueue,
    /// On the proxy's own (session-0) response queue.
    ResponseQueue,
    /// On a registered client's response queue.
    ClientQueue,
    /// Detached: held by caller code between list moves.
    Caller,
}

/// A message descriptor.
///
/// `buffer` points into the shared scratch window (or is null). The
/// descriptor does not own the pointed-to bytes; it owns the right to name
/// them in exactly one queue at a time.
pub struct Message {
    pub session_id: u32,
    pub opcode: u32,
    pub length: u32,
    pub buffer: *mut u8,
    pub result: i32,
    next: u32,
    owner: Owner,
}

// Safety: the raw buffer pointer refers into the shared region, which
// outlives the proxy; descriptors are only reached under the proxy lock.
unsafe impl Send for Message {}

/// Fixed-capacity arena of message descriptors with an intrusive free list.
///
/// The pool never allocates after construction; running out of descriptors
/// is the channel's backpressure signal, not an allocation failure.
pub struct MessagePool {
    slots: Box<[Message]>,
    free_head: u32,
    free_count: usize,
}

impl MessagePool {
    /// Create a pool of `capacity` descriptors, all free.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0 && capacity < NIL as usize);
        let mut slots = Vec::with_capacity(capacity);
        for i in 0..capacity {
            let next = if i + 1 < capacity { (i + 1) as u32 } else { NIL };
            slots.push(Message {
                session_id: 0,
                opcode: 0,
                length: 0,
                buffer: ptr::null_mut(),
                result: 0,
                next,
                owner: Owner::Pool,
            });
        }
        Self {
            slots: slots.into_boxed_slice(),
            free_head: 0,
            free_count: capacity,
        }
    }

    /// Take a descriptor off the free list, or `None` if exhausted.
    pub fn acquire(&mut self) -> Option<MsgRef> {
        if self.free_head == NIL {
            return None;
        }
        let idx = self.free_head;
        let msg = &mut self.slots[idx as usize];
        debug_assert_eq!(msg.owner, Owner::Pool);
        self.free_head = msg.next;
        msg.next = NIL;
        msg.owner = Owner::Caller;
        self.free_count -= 1;
        Some(MsgRef(idx))
    }

    /// Return a descriptor to the free list.
    pub fn release(&mut self, m: MsgRef) {
        let msg = &mut self.slots[m.0 as usize];
        debug_assert_ne!(msg.owner, Owner::Pool, "double release");
        msg.owner = Owner::Pool;
        msg.next = self.free_head;
        msg.buffer = ptr::null_mut();
        self.free_head = m.0;
        self.free_count += 1;
    }

    pub fn get(&self, m: MsgRef) -> &Message {
        &self.slots[m.0 as usize]
    }

    pub fn get_mut(&mut self, m: MsgRef) -> &mut Message {
        &mut self.slots[m.0 as usize]
    }

    /// Number of descriptors currently on the free list.
    pub fn free_count(&self) -> usize {
        self.free_count
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn is_exhausted(&self) -> bool {
        self.free_head == NIL
    }
}

/// Intrusive FIFO over pooled descriptors.
///
/// Head/tail indices into the pool arena; O(1) enqueue and dequeue. The
/// queue's tag is stamped onto every descriptor it holds.
pub struct MessageQueue {
    head: u32,
    tail: u32,
    tag: Owner,
}

impl MessageQueue {
    pub fn new(tag: Owner) -> Self {
        Self {
            head: NIL,
            tail: NIL,
            tag,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.head == NIL
    }

    /// Append a descriptor. Returns whether the queue was empty before the
    /// call, which is the "does the consumer need waking" signal.
    pub fn enqueue(&mut self, pool: &mut MessagePool, m: MsgRef) -> bool {
        let first = self.head == NIL;
        {
            let msg = &mut pool.slots[m.0 as usize];
            debug_assert_eq!(msg.owner, Owner::Caller, "enqueue of a list-owned message");
            msg.owner = self.tag;
            msg.next = NIL;
        }
        if first {
            self.head = m.0;
        } else {
            pool.slots[self.tail as usize].next = m.0;
        }
        self.tail = m.0;
        first
    }

    /// Pop the oldest descriptor, or `None` if the queue is empty.
    pub fn dequeue(&mut self, pool: &mut MessagePool) -> Option<MsgRef> {
        if self.head == NIL {
            return None;
        }
        let idx = self.head;
        let msg = &mut pool.slots[idx as usize];
        debug_assert_eq!(msg.owner, self.tag);
        self.head = msg.next;
        if self.head == NIL {
            self.tail = NIL;
        }
        msg.next = NIL;
        msg.owner = Owner::Caller;
        Some(MsgRef(idx))
    }

    /// Detach every descriptor and return all of them to the pool.
    /// Used when discarding in-flight work on channel reset.
    pub fn drain_all(&mut self, pool: &mut MessagePool) -> usize {
        let mut n = 0;
        while let Some(m) = self.dequeue(pool) {
            pool.release(m);
            n += 1;
        }
        n
    }
}
