#![forbid(unsafe_code)]

//! PCI bus subsystem for the rivet kernel.
//!
//! This crate owns the hardware-independent half of PCI bring-up:
//!
//! - enumerating the hierarchy behind a host controller (every function of
//!   every device on every bus reachable through PCI-to-PCI bridges),
//! - sizing and assigning Base Address Registers out of the controller's
//!   I/O, memory, and prefetchable-memory windows,
//! - programming bridge bus numbers and forwarding windows, and
//! - binding drivers to devices through an id-table registry that behaves
//!   the same no matter which of the two is registered first.
//!
//! The platform supplies the actual config-space cycles through the
//! [`PciBackend`] trait; everything else (interrupt routing, MSI, hot-plug,
//! power management) is out of scope here.

pub mod backend;
pub mod config;

mod bus;
mod registry;
mod resource;
mod scan;

pub use backend::PciBackend;
pub use bus::{
    devfn, devfn_func, devfn_slot, PciBus, PciController, PciControllerConfig, PciDevice,
    ScanMode, PCI_NUM_RESOURCES,
};
pub use config::ConfigValue;
pub use registry::{PciDeviceId, PciDriver, PciRegistry, PCI_ANY_ID};
pub use resource::{PciResource, PciWindow, ResourceFlags};

use thiserror::Error;

/// Errors surfaced by the subsystem's public API.
///
/// BAR exhaustion is deliberately *not* here: a BAR that does not fit its
/// window is logged and left unprogrammed, and enumeration continues. An
/// absent capability is likewise reported as offset 0, not an error.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum PciError {
    /// A config access whose offset is not a multiple of its width.
    #[error("misaligned {size}-byte config access at offset {offset:#x}")]
    Misaligned { offset: u16, size: usize },

    /// The controller backend failed the config cycle.
    ///
    /// During enumeration this is treated as "no device in that slot"; empty
    /// slots are the common case and must not abort the scan.
    #[error("config cycle failed on the controller backend")]
    Bus,

    /// A driver registered without a usable id table.
    #[error("driver has no usable id table")]
    InvalidDriver,

    /// A driver's `probe` declined the device.
    #[error("probe declined the device")]
    ProbeFailed,
}
