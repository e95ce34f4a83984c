//! Registered endpoints multiplexed over the channel.

use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;
use crate::proxy::{ProxyMessage, Shared};

/// A registered endpoint identified by its session id.
///
/// Obtained from [`Proxy::register_client`]; dropping the handle
/// deregisters the session and reclaims any responses still queued for it.
/// A response arriving for a deregistered session is treated as a protocol
/// error and reclaimed by the demultiplexer.
///
/// [`Proxy::register_client`]: crate::proxy::Proxy::register_client
pub struct Client {
    shared: Arc<Shared>,
    session_id: u32,
}

impl Client {
    pub(crate) fn new(shared: Arc<Shared>, session_id: u32) -> Self {
        Self { shared, session_id }
    }

    pub fn session_id(&self) -> u32 {
        self.session_id
    }

    /// Stage a command for this session and return without waiting for
    /// delivery. Blocks only while the message pool is exhausted.
    pub fn submit(&self, opcode: u32, buffer: *mut u8, length: u32) -> Result<()> {
        self.shared.submit(self.session_id, opcode, buffer, length)
    }

    /// Submit a command and block until the paired response arrives or the
    /// timeout elapses.
    pub fn call(
        &self,
        opcode: u32,
        buffer: *mut u8,
        length: u32,
        timeout: Duration,
    ) -> Result<ProxyMessage> {
        Shared::call(&self.shared, self.session_id, opcode, buffer, length, timeout)
    }

    /// Wait for the next response queued for this session without
    /// submitting anything.
    pub fn recv(&self, timeout: Duration) -> Result<ProxyMessage> {
        Shared::wait_response(&self.shared, self.session_id, timeout)
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.shared.deregister(self.session_id);
    }
}
