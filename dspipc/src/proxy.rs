//! The proxy channel: drain engine, demultiplexer, call APIs and reset.
//!
//! All host-side mutable state lives behind one mutex: the message pool,
//! the two staging queues, the host ends of both rings and the client
//! registry. The only operations that block while interacting with that
//! state are the two documented waits - pool exhaustion and response
//! arrival - and both release the lock for the duration of the wait.
//!
//! The mailbox interrupt entry ([`Proxy::handle_mailbox`]) never takes the
//! lock; it flips atomic flags and unparks the drain worker, which does the
//! actual ring maintenance.

use std::collections::HashMap;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, OnceLock, PoisonError};
use std::thread::{self, JoinHandle, Thread};
use std::time::{Duration, Instant};

use tracing::{debug, error, trace};

use crate::client::Client;
use crate::config::ProxyConfig;
use crate::error::{Error, Result};
use crate::layout::{ChannelHeader, LocalPtr, RingSlot, ScratchWindow, ShmLayout};
use crate::mailbox::{Mailbox, CTRL_CORE_EXIT, CTRL_CORE_READY, CTRL_DATA};
use crate::message::{MessagePool, MessageQueue, MsgRef, Owner};
use crate::ring::{CommandRing, ResponseRing};

/// Session id reserved for the proxy's own control-plane traffic.
pub const PROXY_SESSION: u32 = 0;

/// Control-plane opcode: ask the peer to allocate a scratch buffer.
pub const OP_ALLOC: u32 = 0x01;
/// Control-plane opcode: return a scratch buffer to the peer.
pub const OP_FREE: u32 = 0x02;

/// Per-client registry entry. The condvar is shared with waiters through an
/// `Arc` so a wait can continue across deregistration.
struct ClientEntry {
    queue: MessageQueue,
    cv: Arc<Condvar>,
    /// Responses whose callers timed out and will never collect them.
    abandoned: u32,
}

/// Host-side mutable state, guarded by the one proxy lock.
struct ProxyState {
    pool: MessagePool,
    /// Commands staged between `submit` and the command ring.
    command: MessageQueue,
    /// Session-0 responses awaiting a control-plane caller.
    response: MessageQueue,
    /// Session-0 counterpart of `ClientEntry::abandoned`.
    abandoned: u32,
    clients: HashMap<u32, ClientEntry>,
    cmd_ring: CommandRing,
    rsp_ring: ResponseRing,
    scratch: ScratchWindow,
    /// Bumped on every channel reset; sleeping callers compare it on wake.
    generation: u64,
    shutdown: bool,
}

pub(crate) struct Shared {
    state: Mutex<ProxyState>,
    /// Wakes callers blocked on pool exhaustion.
    pool_avail: Condvar,
    /// Wakes session-0 response waiters and readiness waiters.
    proxy_wait: Arc<Condvar>,
    ready: AtomicBool,
    reset_pending: AtomicBool,
    kick: AtomicBool,
    stop: AtomicBool,
    worker_thread: OnceLock<Thread>,
    mailbox: Arc<dyn Mailbox>,
    config: ProxyConfig,
}

impl Shared {
    fn lock_state(&self) -> MutexGuard<'_, ProxyState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn kick_worker(&self) {
        self.kick.store(true, Ordering::Release);
        if let Some(t) = self.worker_thread.get() {
            t.unpark();
        }
    }

    /// Stage a command. Blocks (droppable by reset/teardown) while the pool
    /// is exhausted; never blocks once a descriptor is in hand.
    pub(crate) fn submit(
        &self,
        session_id: u32,
        opcode: u32,
        buffer: *mut u8,
        length: u32,
    ) -> Result<()> {
        let mut st = self.lock_state();
        if session_id != PROXY_SESSION && !st.clients.contains_key(&session_id) {
            return Err(Error::UnknownSession(session_id));
        }
        let gen = st.generation;
        let m = loop {
            if st.shutdown {
                return Err(Error::Interrupted);
            }
            if st.generation != gen {
                return Err(Error::ChannelReset);
            }
            if let Some(m) = st.pool.acquire() {
                break m;
            }
            st = self.pool_avail.wait(st).unwrap_or_else(PoisonError::into_inner);
        };
        let first = {
            let s = &mut *st;
            let msg = s.pool.get_mut(m);
            msg.session_id = session_id;
            msg.opcode = opcode;
            msg.length = length;
            msg.buffer = buffer;
            msg.result = 0;
            s.command.enqueue(&mut s.pool, m)
        };
        drop(st);
        // A non-empty staging queue already has a drain pass in flight.
        if first {
            self.kick_worker();
        }
        Ok(())
    }

    /// Non-blocking variant of [`submit`]: fails with `PoolExhausted`
    /// instead of waiting for a descriptor.
    ///
    /// [`submit`]: Shared::submit
    pub(crate) fn try_submit(
        &self,
        session_id: u32,
        opcode: u32,
        buffer: *mut u8,
        length: u32,
    ) -> Result<()> {
        let mut st = self.lock_state();
        if st.shutdown {
            return Err(Error::Interrupted);
        }
        if session_id != PROXY_SESSION && !st.clients.contains_key(&session_id) {
            return Err(Error::UnknownSession(session_id));
        }
        let Some(m) = st.pool.acquire() else {
            return Err(Error::PoolExhausted);
        };
        let first = {
            let s = &mut *st;
            let msg = s.pool.get_mut(m);
            msg.session_id = session_id;
            msg.opcode = opcode;
            msg.length = length;
            msg.buffer = buffer;
            msg.result = 0;
            s.command.enqueue(&mut s.pool, m)
        };
        drop(st);
        if first {
            self.kick_worker();
        }
        Ok(())
    }

    pub(crate) fn call(
        shared: &Arc<Shared>,
        session_id: u32,
        opcode: u32,
        buffer: *mut u8,
        length: u32,
        timeout: Duration,
    ) -> Result<ProxyMessage> {
        shared.submit(session_id, opcode, buffer, length)?;
        Shared::wait_response(shared, session_id, timeout)
    }

    /// Block until a response for `session_id` is queued or the deadline
    /// passes. A timeout marks one in-flight response as abandoned so the
    /// demultiplexer reclaims it on arrival instead of queuing it for
    /// nobody.
    pub(crate) fn wait_response(
        shared: &Arc<Shared>,
        session_id: u32,
        timeout: Duration,
    ) -> Result<ProxyMessage> {
        let deadline = Instant::now() + timeout;
        let mut st = shared.lock_state();
        let gen = st.generation;
        loop {
            if st.shutdown {
                return Err(Error::Interrupted);
            }
            if st.generation != gen {
                return Err(Error::ChannelReset);
            }
            let taken = {
                let s = &mut *st;
                if session_id == PROXY_SESSION {
                    s.response.dequeue(&mut s.pool)
                } else {
                    match s.clients.get_mut(&session_id) {
                        Some(e) => e.queue.dequeue(&mut s.pool),
                        None => return Err(Error::UnknownSession(session_id)),
                    }
                }
            };
            if let Some(m) = taken {
                let msg = st.pool.get(m);
                return Ok(ProxyMessage {
                    shared: shared.clone(),
                    index: m,
                    session_id: msg.session_id,
                    opcode: msg.opcode,
                    length: msg.length,
                    result: msg.result,
                    buffer: msg.buffer,
                });
            }
            let now = Instant::now();
            if now >= deadline {
                if session_id == PROXY_SESSION {
                    st.abandoned += 1;
                } else if let Some(e) = st.clients.get_mut(&session_id) {
                    e.abandoned += 1;
                }
                return Err(Error::Timeout);
            }
            let cv = if session_id == PROXY_SESSION {
                shared.proxy_wait.clone()
            } else {
                match st.clients.get(&session_id) {
                    Some(e) => e.cv.clone(),
                    None => return Err(Error::UnknownSession(session_id)),
                }
            };
            let (g, _) = cv
                .wait_timeout(st, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            st = g;
        }
    }

    /// Wait for the peer's post-reset readiness announcement.
    pub(crate) fn wait_ready(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut st = self.lock_state();
        loop {
            if self.ready.load(Ordering::Acquire) {
                return Ok(());
            }
            if st.shutdown {
                return Err(Error::Interrupted);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::Timeout);
            }
            let (g, _) = self
                .proxy_wait
                .wait_timeout(st, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            st = g;
        }
    }

    pub(crate) fn register_client(shared: &Arc<Shared>, session_id: u32) -> Result<Client> {
        let mut st = shared.lock_state();
        if st.shutdown {
            return Err(Error::Interrupted);
        }
        if session_id == PROXY_SESSION || st.clients.contains_key(&session_id) {
            return Err(Error::SessionInUse(session_id));
        }
        st.clients.insert(
            session_id,
            ClientEntry {
                queue: MessageQueue::new(Owner::ClientQueue),
                cv: Arc::new(Condvar::new()),
                abandoned: 0,
            },
        );
        Ok(Client::new(shared.clone(), session_id))
    }

    pub(crate) fn deregister(&self, session_id: u32) {
        let mut guard = self.lock_state();
        let st = &mut *guard;
        if let Some(mut e) = st.clients.remove(&session_id) {
            let n = e.queue.drain_all(&mut st.pool);
            if n > 0 {
                self.pool_avail.notify_all();
            }
            // Anyone mid-wait re-looks the session up and observes it gone.
            e.cv.notify_all();
        }
    }

    /// Release a descriptor handed out by [`wait_response`] back to the
    /// pool and wake one exhaustion waiter.
    ///
    /// [`wait_response`]: Shared::wait_response
    fn release_msg(&self, m: MsgRef) {
        let mut st = self.lock_state();
        st.pool.release(m);
        self.pool_avail.notify_one();
    }

    // --- drain engine -------------------------------------------------

    /// Move staged commands into the command ring and committed responses
    /// out of the response ring, looping until a pass changes nothing.
    /// Runs on the worker thread, under the lock; the doorbell rings after
    /// the lock is dropped.
    fn drain(&self) {
        let mut guard = self.lock_state();
        let st = &mut *guard;
        if st.shutdown {
            return;
        }
        let mut published = false;
        loop {
            // Commands first: a response processed below may free a
            // descriptor, and the freed slot should be usable by the next
            // pass of this same invocation.
            let sent = self.flush_commands(st);
            let received = self.pull_responses(st);
            published |= sent;
            if !sent && !received {
                break;
            }
        }
        drop(guard);
        if published {
            self.mailbox.send(CTRL_DATA);
        }
    }

    fn flush_commands(&self, st: &mut ProxyState) -> bool {
        let mut moved = false;
        while !st.cmd_ring.is_full() {
            let Some(m) = st.command.dequeue(&mut st.pool) else {
                break;
            };
            let slot = {
                let msg = st.pool.get(m);
                RingSlot {
                    session_id: msg.session_id,
                    opcode: msg.opcode,
                    length: msg.length,
                    address: st.scratch.to_shared(msg.buffer),
                }
            };
            st.cmd_ring.push(slot);
            // The ring slot carries the data from here on; the descriptor
            // goes straight back to the pool.
            st.pool.release(m);
            self.pool_avail.notify_one();
            trace!(
                session = slot.session_id,
                opcode = slot.opcode,
                "command published"
            );
            moved = true;
        }
        moved
    }

    fn pull_responses(&self, st: &mut ProxyState) -> bool {
        let mut moved = false;
        loop {
            if st.rsp_ring.is_empty() {
                break;
            }
            let Some(m) = st.pool.acquire() else {
                // Backpressure: committed entries stay in the ring until a
                // descriptor frees up; the next kick retries.
                trace!("pool exhausted, response drain deferred");
                break;
            };
            let Some(slot) = st.rsp_ring.pop() else {
                st.pool.release(m);
                break;
            };
            let buffer = match st.scratch.to_local(slot.address) {
                LocalPtr::Ptr(p) => p,
                LocalPtr::Null => ptr::null_mut(),
                LocalPtr::Invalid => {
                    error!(
                        session = slot.session_id,
                        address = slot.address,
                        "response payload address outside the scratch window"
                    );
                    ptr::null_mut()
                }
            };
            {
                let msg = st.pool.get_mut(m);
                msg.session_id = slot.session_id;
                msg.opcode = slot.opcode;
                msg.length = slot.length;
                msg.buffer = buffer;
                msg.result = 0;
            }
            self.route(st, m);
            moved = true;
        }
        moved
    }

    /// Demultiplexer: hand a received response to its session's queue.
    fn route(&self, st: &mut ProxyState, m: MsgRef) {
        let id = st.pool.get(m).session_id;
        if id == PROXY_SESSION {
            if st.abandoned > 0 {
                st.abandoned -= 1;
                st.pool.release(m);
                self.pool_avail.notify_one();
                debug!("reclaimed control response for a timed-out call");
                return;
            }
            if st.response.enqueue(&mut st.pool, m) {
                self.proxy_wait.notify_all();
            }
            return;
        }
        match st.clients.get_mut(&id) {
            Some(e) => {
                if e.abandoned > 0 {
                    e.abandoned -= 1;
                    st.pool.release(m);
                    self.pool_avail.notify_one();
                    debug!(session = id, "reclaimed response for a timed-out call");
                } else if e.queue.enqueue(&mut st.pool, m) {
                    e.cv.notify_all();
                }
            }
            None => {
                error!(session = id, "response for unknown session, reclaimed");
                st.pool.release(m);
                self.pool_avail.notify_one();
            }
        }
    }

    /// Full channel reset: every queued descriptor returns to the pool,
    /// ring indices restart at zero, and every sleeping caller wakes to
    /// observe `ChannelReset` via the generation bump.
    pub(crate) fn reset(&self) {
        let mut guard = self.lock_state();
        let st = &mut *guard;
        if st.shutdown {
            return;
        }
        st.generation = st.generation.wrapping_add(1);
        self.ready.store(false, Ordering::Release);
        let mut reclaimed = st.command.drain_all(&mut st.pool);
        reclaimed += st.response.drain_all(&mut st.pool);
        st.abandoned = 0;
        for e in st.clients.values_mut() {
            reclaimed += e.queue.drain_all(&mut st.pool);
            e.abandoned = 0;
            e.cv.notify_all();
        }
        st.cmd_ring.reset();
        st.rsp_ring.reset();
        self.pool_avail.notify_all();
        self.proxy_wait.notify_all();
        debug!(reclaimed, "channel reset");
    }
}

fn worker_loop(shared: Arc<Shared>) {
    let _ = shared.worker_thread.set(thread::current());
    loop {
        let reset = shared.reset_pending.swap(false, Ordering::AcqRel);
        let kick = shared.kick.swap(false, Ordering::AcqRel);
        if !reset && !kick {
            if shared.stop.load(Ordering::Acquire) {
                break;
            }
            thread::park();
            continue;
        }
        if reset {
            shared.reset();
        }
        if kick {
            shared.drain();
        }
    }
}

/// The host side of the channel.
///
/// Construction takes the shared region and a doorbell; a dedicated worker
/// thread is spawned to run the drain engine. Dropping the proxy wakes
/// every blocked caller with `Interrupted` and joins the worker.
pub struct Proxy {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl Proxy {
    /// Create a proxy over a mapped shared region.
    ///
    /// The region is laid out as the ring index header, the command slot
    /// array, the response slot array, then the scratch window; the header
    /// and host-side indices are reinitialized here.
    ///
    /// # Safety
    /// `region` must point to at least `region_size` bytes of mapped
    /// memory, 4-byte aligned, valid for the proxy's whole lifetime, and
    /// not concurrently initialized by another host-side owner.
    pub unsafe fn new(
        region: *mut u8,
        region_size: usize,
        mailbox: Arc<dyn Mailbox>,
        config: ProxyConfig,
    ) -> Result<Proxy> {
        config.validate()?;
        let layout = ShmLayout::new(config.ring_capacity, region_size)?;
        debug_assert_eq!(region as usize % std::mem::align_of::<ChannelHeader>(), 0);

        let header = region.cast::<ChannelHeader>();
        ptr::write(header, ChannelHeader::new());
        let header = NonNull::new_unchecked(header);
        let cmd_slots = NonNull::new_unchecked(region.add(layout.cmd_slots).cast::<RingSlot>());
        let rsp_slots = NonNull::new_unchecked(region.add(layout.rsp_slots).cast::<RingSlot>());

        let state = ProxyState {
            pool: MessagePool::new(config.pool_size),
            command: MessageQueue::new(Owner::CommandQueue),
            response: MessageQueue::new(Owner::ResponseQueue),
            abandoned: 0,
            clients: HashMap::new(),
            cmd_ring: CommandRing::from_raw(header, cmd_slots, config.ring_capacity),
            rsp_ring: ResponseRing::from_raw(header, rsp_slots, config.ring_capacity),
            scratch: ScratchWindow::new(region.add(layout.scratch), layout.scratch_size as u32),
            generation: 0,
            shutdown: false,
        };

        let shared = Arc::new(Shared {
            state: Mutex::new(state),
            pool_avail: Condvar::new(),
            proxy_wait: Arc::new(Condvar::new()),
            ready: AtomicBool::new(false),
            reset_pending: AtomicBool::new(false),
            kick: AtomicBool::new(false),
            stop: AtomicBool::new(false),
            worker_thread: OnceLock::new(),
            mailbox,
            config,
        });

        let worker = thread::Builder::new()
            .name("dspipc-drain".into())
            .spawn({
                let shared = shared.clone();
                move || worker_loop(shared)
            })
            .map_err(Error::Io)?;

        Ok(Proxy {
            shared,
            worker: Some(worker),
        })
    }

    /// Register a client for `session_id` (non-zero, unique).
    pub fn register_client(&self, session_id: u32) -> Result<Client> {
        Shared::register_client(&self.shared, session_id)
    }

    /// Stage a command and return after triggering the drain engine.
    /// Blocks only while the message pool is exhausted.
    pub fn submit(&self, session_id: u32, opcode: u32, buffer: *mut u8, length: u32) -> Result<()> {
        self.shared.submit(session_id, opcode, buffer, length)
    }

    /// Like [`submit`], but fails with `PoolExhausted` instead of waiting.
    ///
    /// [`submit`]: Proxy::submit
    pub fn try_submit(
        &self,
        session_id: u32,
        opcode: u32,
        buffer: *mut u8,
        length: u32,
    ) -> Result<()> {
        self.shared.try_submit(session_id, opcode, buffer, length)
    }

    /// Submit a command and block for its response.
    ///
    /// On timeout the command stays in flight; when the late response
    /// eventually lands it is reclaimed by the demultiplexer, so the pool
    /// does not leak.
    pub fn call(
        &self,
        session_id: u32,
        opcode: u32,
        buffer: *mut u8,
        length: u32,
        timeout: Duration,
    ) -> Result<ProxyMessage> {
        Shared::call(&self.shared, session_id, opcode, buffer, length, timeout)
    }

    /// Block until the peer announces readiness, or fail with `Timeout`.
    pub fn wait_ready(&self, timeout: Duration) -> Result<()> {
        self.shared.wait_ready(timeout)
    }

    pub fn is_ready(&self) -> bool {
        self.shared.ready.load(Ordering::Acquire)
    }

    /// Ask the peer for a buffer in the scratch window.
    pub fn alloc_buffer(&self, length: u32) -> Result<*mut u8> {
        let timeout = self.shared.config.control_timeout;
        let rsp = Shared::call(
            &self.shared,
            PROXY_SESSION,
            OP_ALLOC,
            ptr::null_mut(),
            length,
            timeout,
        )?;
        if rsp.opcode == OP_ALLOC && !rsp.buffer().is_null() {
            Ok(rsp.buffer())
        } else {
            Err(Error::AllocFailed)
        }
    }

    /// Return a peer-allocated scratch buffer.
    pub fn free_buffer(&self, buffer: *mut u8, length: u32) -> Result<()> {
        let timeout = self.shared.config.control_timeout;
        let rsp = Shared::call(&self.shared, PROXY_SESSION, OP_FREE, buffer, length, timeout)?;
        if rsp.opcode == OP_FREE {
            Ok(())
        } else {
            Err(Error::UnexpectedOpcode {
                expected: OP_FREE,
                got: rsp.opcode,
            })
        }
    }

    /// Mailbox interrupt entry.
    ///
    /// Safe to call from interrupt context: no lock is taken, nothing is
    /// allocated, nothing blocks. Data words defer to the drain worker;
    /// `CTRL_CORE_EXIT` defers a full channel reset the same way.
    pub fn handle_mailbox(&self, word: u32) {
        match word {
            CTRL_CORE_READY => {
                debug!("peer core ready");
                self.shared.ready.store(true, Ordering::Release);
                self.shared.proxy_wait.notify_all();
            }
            CTRL_CORE_EXIT => {
                debug!("peer core exit, scheduling channel reset");
                self.shared.reset_pending.store(true, Ordering::Release);
                self.shared.kick_worker();
            }
            _ => {
                self.shared.kick_worker();
            }
        }
    }

    /// Host-initiated channel reset; also runs when the peer announces
    /// exit. Reclaims every in-flight descriptor and wakes all blocked
    /// callers with `ChannelReset`.
    pub fn reset(&self) {
        self.shared.reset();
    }

    /// The address translation window for payload buffers.
    pub fn scratch(&self) -> ScratchWindow {
        self.shared.lock_state().scratch
    }

    /// Free descriptors currently in the pool. Equals the pool capacity
    /// whenever no message is staged, queued or held by a caller.
    pub fn free_messages(&self) -> usize {
        self.shared.lock_state().pool.free_count()
    }
}

impl Drop for Proxy {
    fn drop(&mut self) {
        {
            let mut guard = self.shared.lock_state();
            guard.shutdown = true;
            self.shared.pool_avail.notify_all();
            self.shared.proxy_wait.notify_all();
            for e in guard.clients.values() {
                e.cv.notify_all();
            }
        }
        self.shared.stop.store(true, Ordering::Release);
        if let Some(h) = self.worker.take() {
            h.thread().unpark();
            let _ = h.join();
        }
    }
}

/// A response handed out by [`Proxy::call`] / [`Client::recv`].
///
/// Holds one pool descriptor; dropping the message returns it to the pool
/// and wakes a waiter blocked on exhaustion.
pub struct ProxyMessage {
    shared: Arc<Shared>,
    index: MsgRef,
    pub session_id: u32,
    pub opcode: u32,
    pub length: u32,
    pub result: i32,
    buffer: *mut u8,
}

// Safety: the buffer pointer refers into the shared region, which outlives
// every ProxyMessage; descriptor release goes through the proxy lock.
unsafe impl Send for ProxyMessage {}

impl ProxyMessage {
    /// Payload pointer inside the scratch window, or null.
    pub fn buffer(&self) -> *mut u8 {
        self.buffer
    }

    /// View the payload bytes.
    ///
    /// # Safety
    /// The peer must not be concurrently writing the buffer; `length` must
    /// describe initialized bytes.
    pub unsafe fn payload(&self) -> Option<&[u8]> {
        if self.buffer.is_null() {
            None
        } else {
            Some(std::slice::from_raw_parts(self.buffer, self.length as usize))
        }
    }

    /// Return the descriptor to the pool. Dropping has the same effect.
    pub fn release(self) {}
}

impl Drop for ProxyMessage {
    fn drop(&mut self) {
        self.shared.release_msg(self.index);
    }
}
