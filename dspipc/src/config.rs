//! Configuration for the proxy channel.

use std::time::Duration;

use crate::error::{Error, Result};
use crate::layout::{HEADER_SIZE, SLOT_SIZE};

/// Proxy configuration.
///
/// Controls the sizing of the message pool and the shared rings, and the
/// deadline applied to control-plane round trips.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Message pool capacity (descriptors preallocated at init).
    /// Default: 256
    pub pool_size: usize,
    /// Capacity of each shared ring, in slots. Must be a power of two.
    /// Default: 64
    pub ring_capacity: u32,
    /// Deadline for session-0 control-plane calls (buffer alloc/free).
    /// Default: 1s
    pub control_timeout: Duration,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            pool_size: 256,
            ring_capacity: 64,
            control_timeout: Duration::from_millis(1000),
        }
    }
}

impl ProxyConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the message pool capacity.
    pub fn with_pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size;
        self
    }

    /// Set the ring capacity (slots per ring, power of two).
    pub fn with_ring_capacity(mut self, ring_capacity: u32) -> Self {
        self.ring_capacity = ring_capacity;
        self
    }

    /// Set the control-plane call deadline.
    pub fn with_control_timeout(mut self, control_timeout: Duration) -> Self {
        self.control_timeout = control_timeout;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.pool_size == 0 {
            return Err(Error::InvalidConfig("pool_size cannot be 0".into()));
        }
        if self.pool_size >= u32::MAX as usize {
            return Err(Error::InvalidConfig("pool_size too large".into()));
        }
        if self.ring_capacity == 0 || !self.ring_capacity.is_power_of_two() {
            return Err(Error::InvalidConfig(
                "ring_capacity must be a non-zero power of two".into(),
            ));
        }
        Ok(())
    }

    /// Minimum shared region size for this configuration: the index header
    /// plus both slot arrays. Any space beyond this becomes the scratch
    /// window that payload addresses refer to.
    pub fn min_region_size(&self) -> usize {
        HEADER_SIZE + 2 * self.ring_capacity as usize * SLOT_SIZE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = ProxyConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.pool_size, 256);
        assert_eq!(cfg.ring_capacity, 64);
    }

    #[test]
    fn builder_chain() {
        let cfg = ProxyConfig::new()
            .with_pool_size(8)
            .with_ring_capacity(4)
            .with_control_timeout(Duration::from_millis(50));
        cfg.validate().unwrap();
        assert_eq!(cfg.pool_size, 8);
        assert_eq!(cfg.ring_capacity, 4);
        assert_eq!(cfg.control_timeout, Duration::from_millis(50));
    }

    #[test]
    fn rejects_bad_sizes() {
        assert!(ProxyConfig::new().with_pool_size(0).validate().is_err());
        assert!(ProxyConfig::new().with_ring_capacity(0).validate().is_err());
        assert!(ProxyConfig::new().with_ring_capacity(3).validate().is_err());
    }

    #[test]
    fn min_region_size_covers_rings() {
        let cfg = ProxyConfig::new().with_ring_capacity(4);
        assert_eq!(cfg.min_region_size(), 16 + 2 * 4 * 16);
    }
}
