//! The two seams between the master core and the outside world: a raw
//! Ethernet [`Device`] and a monotonic [`Clock`].
//!
//! The core performs no I/O and reads no clocks of its own, so it can run on
//! Linux raw sockets, a bare-metal MAC driver or the test suite's simulated
//! segment without modification.

use crate::error::Error;
use atomic_enum::atomic_enum;

/// Raw Ethernet send/receive.
///
/// Implementations hand whole Ethernet II frames back and forth, FCS
/// excluded. No retransmission or buffering semantics are required of the
/// device; retry is the datagram layer's concern.
pub trait Device {
    /// Transmit one frame.
    fn send(&mut self, frame: &[u8]) -> Result<(), Error>;

    /// Poll for one received frame, copying it into `buf`.
    ///
    /// Returns `Ok(None)` when no frame is waiting. Must not block.
    fn receive(&mut self, buf: &mut [u8]) -> Result<Option<usize>, Error>;

    /// Current link state, if the device can sense it.
    ///
    /// Defaults to "up" for devices with no carrier detection.
    fn link_state(&self) -> LinkState {
        LinkState::Up
    }
}

/// Physical link state of the device.
#[atomic_enum]
#[derive(Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum LinkState {
    /// No carrier.
    #[default]
    Down,
    /// Carrier present.
    Up,
}

/// Frame level statistics kept by the master for one device.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct DeviceStats {
    /// Frames handed to the device.
    pub tx_count: u32,
    /// Frames received from the device.
    pub rx_count: u32,
    /// TX attempts the device rejected.
    pub tx_errors: u32,
    /// Malformed or undecodable received frames.
    pub rx_errors: u32,
}

/// Monotonic time source, injected at master construction.
///
/// All timeouts in the core are polled against this clock, which makes the
/// whole master deterministic under test: drive the fake clock, observe the
/// timeout.
pub trait Clock {
    /// Current monotonic time in nanoseconds.
    ///
    /// The epoch is arbitrary but must not move backwards.
    fn now(&self) -> u64;
}

/// [`Clock`] backed by [`std::time::Instant`].
#[cfg(feature = "std")]
#[derive(Debug, Clone)]
pub struct StdClock {
    start: std::time::Instant,
}

#[cfg(feature = "std")]
impl StdClock {
    /// Create a clock with its epoch at the moment of the call.
    pub fn new() -> Self {
        Self {
            start: std::time::Instant::now(),
        }
    }
}

#[cfg(feature = "std")]
impl Default for StdClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "std")]
impl Clock for StdClock {
    fn now(&self) -> u64 {
        self.start.elapsed().as_nanos() as u64
    }
}

impl<C: Clock> Clock for &C {
    fn now(&self) -> u64 {
        (*self).now()
    }
}
