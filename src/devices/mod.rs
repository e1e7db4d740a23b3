//! The MMIO device model: every register-mapped peripheral
//! implements [`Device`] and is installed into [`crate::memory::PhysicalMemory`]
//! as a "special" window.

pub mod aes;
pub mod ahci;
pub mod gpio;
pub mod i2c;
pub mod ipc;
pub mod misc;
pub mod nand;
pub mod ohci;
pub mod otp;
pub mod sdio;
pub mod sha;
pub mod timer;
pub mod watchdog;

/// Common shape every MMIO peripheral implements. `offset` is relative to
/// the device's installed base address.
pub trait Device {
    fn read(&mut self, offset: u32) -> u32;
    fn write(&mut self, offset: u32, value: u32);

    /// Used only for log attribution on the "unknown offset" path.
    fn name(&self) -> &'static str;

    /// Devices that can hit a fatal device-configuration violation (NAND
    /// shape asserts, the AES chain-continue path) stash it here instead of
    /// threading a `Result` through every register write; the physical
    /// memory fabric checks this immediately after every dispatched write
    /// and turns it into the `Err` the rest of the crate expects.
    fn take_fault(&mut self) -> Option<crate::error::HvError> {
        None
    }
}

/// Logs an unrecognised register access and returns the conventional
/// "unknown read" value. Every device's fallthrough arm calls this instead
/// of silently returning zero, so an embedder extending the model has a
/// trail to follow.
pub(crate) fn unknown_read(device: &'static str, offset: u32) -> u32 {
    log::warn!("{device}: read from unknown offset {offset:#06x}");
    0
}

pub(crate) fn unknown_write(device: &'static str, offset: u32, value: u32) {
    log::warn!("{device}: write {value:#010x} to unknown offset {offset:#06x}");
}
