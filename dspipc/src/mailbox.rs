//! Doorbell interface to the mailbox hardware.
//!
//! The mailbox is a minimal register pair that delivers a single 32-bit
//! control word across the processor boundary and raises an interrupt on
//! the receiving side. It carries no payload; the shared rings do.

/// New ring entries have been committed.
pub const CTRL_DATA: u32 = 0x00;
/// The peer core finished booting and accepts commands.
pub const CTRL_CORE_READY: u32 = 0x11;
/// The peer core is going away; the channel must reset.
pub const CTRL_CORE_EXIT: u32 = 0x22;

/// Host-to-peer doorbell.
///
/// Implementations wrap whatever register write raises the peer's mailbox
/// interrupt. `send` is called from the drain worker with no locks held and
/// must not block indefinitely.
pub trait Mailbox: Send + Sync {
    fn send(&self, word: u32);
}
