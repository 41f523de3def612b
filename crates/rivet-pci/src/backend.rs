//! The platform contract: raw config-space cycles and BAR mapping.

use crate::PciError;

/// Low-level operations a platform supplies for one host controller.
///
/// The subsystem performs all locking above this trait; implementations are
/// only responsible for their own bus-level arbitration. `bus` is the bus
/// number and `devfn` packs `(device << 3) | function`.
///
/// Reads of slots with no device behind them should return the all-ones
/// pattern rather than an error where the hardware allows it; the scanner
/// tolerates both, but firmware and drivers probing for optional functions
/// behave better on the former.
pub trait PciBackend: Send {
    /// Read `size` bytes (1, 2, or 4) of config space at `offset`.
    ///
    /// The value is returned in the low bits of the `u32`.
    fn read(&mut self, bus: u8, devfn: u8, offset: u16, size: usize) -> Result<u32, PciError>;

    /// Write the low `size` bytes (1, 2, or 4) of `value` at `offset`.
    fn write(
        &mut self,
        bus: u8,
        devfn: u8,
        offset: u16,
        size: usize,
        value: u32,
    ) -> Result<(), PciError>;

    /// Translate an assigned BAR range into a CPU-visible address.
    ///
    /// `bar_start..=bar_end` is the range as programmed into the device.
    /// Returning `None` means the platform identity-maps PCI addresses, and
    /// [`crate::PciDevice::map_bar`] hands the raw `bar_start` back to the
    /// driver.
    fn map(&mut self, bus: u8, bar_start: u64, bar_end: u64) -> Option<u64> {
        let _ = (bus, bar_start, bar_end);
        None
    }
}
