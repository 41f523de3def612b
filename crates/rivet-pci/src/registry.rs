//! The device/driver registry: id-table matching and bind/unbind.
//!
//! One mutex serializes every mutation of the registry's three lists, and
//! `probe`/`remove` callbacks run *inside* that lock. That keeps the
//! invariants trivial (a device's binding can never race its driver's
//! removal) at the cost of a documented hazard: a driver must not call back
//! into the same registry from `probe` or `remove`, or it will deadlock.

use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::backend::PciBackend;
use crate::bus::{PciBus, PciController, PciControllerConfig, PciDevice};
use crate::{scan, PciError};

/// Wildcard for the four 16-bit id fields of [`PciDeviceId`].
pub const PCI_ANY_ID: u16 = 0xFFFF;

/// One row of a driver's match table.
///
/// The four id fields treat [`PCI_ANY_ID`] as "match anything". The class
/// test compares only the bits selected by `class_mask`, so a zero mask
/// means the class is wildcarded too. A row with `vendor == 0` acts as a
/// sentinel terminating the table, for compatibility with tables written
/// in the C null-terminated style.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PciDeviceId {
    pub vendor: u16,
    pub device: u16,
    pub subvendor: u16,
    pub subdevice: u16,
    /// 24-bit class / subclass / prog-if pattern.
    pub class: u32,
    pub class_mask: u32,
}

impl PciDeviceId {
    /// Match every function of `vendor:device`, any subsystem, any class.
    pub const fn new(vendor: u16, device: u16) -> Self {
        Self {
            vendor,
            device,
            subvendor: PCI_ANY_ID,
            subdevice: PCI_ANY_ID,
            class: 0,
            class_mask: 0,
        }
    }

    /// Match on class bits alone, any vendor/device/subsystem.
    pub const fn with_class(class: u32, class_mask: u32) -> Self {
        Self {
            vendor: PCI_ANY_ID,
            device: PCI_ANY_ID,
            subvendor: PCI_ANY_ID,
            subdevice: PCI_ANY_ID,
            class,
            class_mask,
        }
    }

    pub(crate) fn matches(&self, dev: &PciDevice) -> bool {
        (self.vendor == PCI_ANY_ID || self.vendor == dev.vendor)
            && (self.device == PCI_ANY_ID || self.device == dev.device)
            && (self.subvendor == PCI_ANY_ID || self.subvendor == dev.subsystem_vendor)
            && (self.subdevice == PCI_ANY_ID || self.subdevice == dev.subsystem_device)
            && (self.class ^ dev.class) & self.class_mask == 0
    }
}

/// A PCI driver, as the registry sees it.
///
/// `probe` and `remove` are called with the registry lock held; see the
/// module docs for the reentrancy hazard.
pub trait PciDriver: Send + Sync {
    fn name(&self) -> &str;

    /// Match table; the first matching row wins. A row with `vendor == 0`
    /// terminates the table early.
    fn id_table(&self) -> &[PciDeviceId];

    /// Take ownership of a matching device. Returning `Err` leaves the
    /// device unbound (and available to later drivers) without failing the
    /// registration that triggered the probe.
    fn probe(&self, dev: &Arc<PciDevice>) -> Result<(), PciError>;

    /// Release a device this driver is bound to.
    fn remove(&self, dev: &Arc<PciDevice>);
}

/// First table row matching `dev`, honoring the `vendor == 0` sentinel.
fn match_table<'t>(table: &'t [PciDeviceId], dev: &PciDevice) -> Option<&'t PciDeviceId> {
    table
        .iter()
        .take_while(|id| id.vendor != 0)
        .find(|id| id.matches(dev))
}

fn table_is_usable(table: &[PciDeviceId]) -> bool {
    table.first().is_some_and(|id| id.vendor != 0)
}

struct RegistryInner {
    devices: Vec<Arc<PciDevice>>,
    drivers: Vec<Arc<dyn PciDriver>>,
    root_buses: Vec<Arc<PciBus>>,
}

/// Device, driver, and root-bus lists under a single lock.
///
/// Kernel code uses the process-wide instance from [`PciRegistry::global`];
/// tests build private instances so nothing leaks between them.
pub struct PciRegistry {
    inner: Mutex<RegistryInner>,
}

static GLOBAL: PciRegistry = PciRegistry::new();

impl PciRegistry {
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(RegistryInner {
                devices: Vec::new(),
                drivers: Vec::new(),
                root_buses: Vec::new(),
            }),
        }
    }

    /// The process-wide registry.
    pub fn global() -> &'static PciRegistry {
        &GLOBAL
    }

    /// Register a host controller: scan the hierarchy behind it, then
    /// publish every discovered device (probing registered drivers) and
    /// finally the root bus itself.
    ///
    /// The scan runs outside the registry lock; nothing it touches is
    /// shared until publication.
    pub fn register_controller(
        &self,
        config: PciControllerConfig,
        backend: Box<dyn PciBackend>,
    ) -> Arc<PciController> {
        let ctrl = PciController::new(config, backend);
        let root = scan::scan_and_publish(&ctrl);

        self.register_bus_devices(&root);
        self.inner.lock().unwrap().root_buses.push(root);

        ctrl
    }

    fn register_bus_devices(&self, bus: &Arc<PciBus>) {
        for dev in bus.devices() {
            self.register_device(dev);
        }
        for child in bus.children() {
            self.register_bus_devices(child);
        }
    }

    /// Add a driver and probe it against every unbound device.
    pub fn register_driver(&self, drv: Arc<dyn PciDriver>) -> Result<(), PciError> {
        if !table_is_usable(drv.id_table()) {
            return Err(PciError::InvalidDriver);
        }

        let mut inner = self.inner.lock().unwrap();
        inner.drivers.push(drv.clone());

        for dev in &inner.devices {
            if dev.driver().is_some() {
                continue;
            }
            if match_table(drv.id_table(), dev).is_some() && drv.probe(dev).is_ok() {
                debug!("{} bound to {dev:?}", drv.name());
                dev.bind(drv.clone());
            }
        }

        Ok(())
    }

    /// Remove a driver, releasing every device bound to it.
    pub fn unregister_driver(&self, drv: &Arc<dyn PciDriver>) {
        let mut inner = self.inner.lock().unwrap();

        for dev in &inner.devices {
            let bound = dev
                .driver()
                .is_some_and(|bound| Arc::ptr_eq(&bound, drv));
            if bound {
                drv.remove(dev);
                dev.unbind();
            }
        }

        inner.drivers.retain(|other| !Arc::ptr_eq(other, drv));
    }

    /// Add a device and bind it to the first registered driver whose table
    /// matches and whose probe succeeds.
    pub fn register_device(&self, dev: &Arc<PciDevice>) {
        let mut inner = self.inner.lock().unwrap();
        inner.devices.push(dev.clone());

        for drv in &inner.drivers {
            if match_table(drv.id_table(), dev).is_some() && drv.probe(dev).is_ok() {
                debug!("{} bound to {dev:?}", drv.name());
                dev.bind(drv.clone());
                break;
            }
        }
    }

    /// Remove a device, releasing its driver binding first.
    pub fn unregister_device(&self, dev: &Arc<PciDevice>) {
        let mut inner = self.inner.lock().unwrap();

        if let Some(drv) = dev.driver() {
            drv.remove(dev);
            dev.unbind();
        }

        inner.devices.retain(|other| !Arc::ptr_eq(other, dev));
    }

    /// Snapshot of all registered devices, in registration order.
    pub fn devices(&self) -> Vec<Arc<PciDevice>> {
        self.inner.lock().unwrap().devices.clone()
    }

    /// Snapshot of all published root buses.
    pub fn root_buses(&self) -> Vec<Arc<PciBus>> {
        self.inner.lock().unwrap().root_buses.clone()
    }
}

impl Default for PciRegistry {
    fn default() -> Self {
        Self::new()
    }
}
