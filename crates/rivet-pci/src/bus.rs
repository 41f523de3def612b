//! The published PCI object graph and the driver-facing API.
//!
//! Buses own their child buses and devices; back-references (`parent`,
//! `ctrl`, `bus`) are `Arc`/`Weak` lookup relations, not ownership edges.
//! The graph is built once by the scanner and never mutated afterwards —
//! the only writable slot is each device's bound-driver pointer, which the
//! registry updates under its lock.

use std::fmt;
use std::sync::{Arc, Mutex, OnceLock, Weak};

use crate::backend::PciBackend;
use crate::config::{
    self, ConfigValue, PCI_CAPABILITY_LIST, PCI_CAP_LIST_NEXT, PCI_CB_CAPABILITY_LIST,
    PCI_COMMAND, PCI_COMMAND_IO, PCI_COMMAND_MASTER, PCI_COMMAND_MEMORY,
    PCI_HEADER_TYPE_BRIDGE, PCI_HEADER_TYPE_CARDBUS, PCI_HEADER_TYPE_NORMAL, PCI_STATUS,
    PCI_STATUS_CAP_LIST,
};
use crate::registry::PciDriver;
use crate::resource::{PciResource, PciWindow, ResourceFlags};
use crate::PciError;

/// BARs tracked per function: six for a type-0 header, of which a type-1
/// bridge header only implements the first two.
pub const PCI_NUM_RESOURCES: usize = 6;

/// Capability-list walks give up after this many hops so a circular or
/// otherwise malicious chain cannot wedge the caller.
const PCI_FIND_CAP_TTL: i32 = 48;

/// Pack `(device, function)` into the 8-bit devfn encoding.
pub const fn devfn(slot: u8, func: u8) -> u8 {
    (slot << 3) | (func & 0x7)
}

/// Device number (0-31) of a devfn.
pub const fn devfn_slot(devfn: u8) -> u8 {
    devfn >> 3
}

/// Function number (0-7) of a devfn.
pub const fn devfn_func(devfn: u8) -> u8 {
    devfn & 0x7
}

/// How a controller's hierarchy gets its BARs and bus numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScanMode {
    /// Number every bus and assign every BAR and bridge window from the
    /// controller's windows. This is the bring-up path on platforms whose
    /// firmware leaves PCI untouched.
    #[default]
    AssignAll,
    /// Firmware already programmed BARs and bus numbers; enumerate and
    /// record them without reassigning anything.
    FirmwareAssigned,
}

/// Address windows and scan policy a platform hands to
/// [`crate::PciRegistry::register_controller`].
#[derive(Debug, Clone)]
pub struct PciControllerConfig {
    pub io: PciWindow,
    pub mem: PciWindow,
    pub mem_pref: PciWindow,
    pub mode: ScanMode,
}

impl Default for PciControllerConfig {
    fn default() -> Self {
        // PC-like defaults: I/O clear of the legacy 0x0000..0x0FFF range,
        // MMIO high in the 32-bit space, no prefetchable window.
        Self {
            io: PciWindow::new(0x1000, 0xF000),
            mem: PciWindow::new(0xE000_0000, 0xF000_0000),
            mem_pref: PciWindow::empty(),
            mode: ScanMode::AssignAll,
        }
    }
}

/// Live allocation state: the windows whose `start` advances as BARs are
/// assigned, plus the next bus number to hand out.
pub(crate) struct AllocState {
    pub(crate) io: PciWindow,
    pub(crate) mem: PciWindow,
    pub(crate) mem_pref: PciWindow,
    pub(crate) busno: u8,
}

/// One host controller and the resources it owns.
pub struct PciController {
    pub(crate) backend: Mutex<Box<dyn PciBackend>>,
    mode: ScanMode,
    config: PciControllerConfig,
    pub(crate) alloc: Mutex<AllocState>,
    root: OnceLock<Weak<PciBus>>,
}

impl PciController {
    pub(crate) fn new(config: PciControllerConfig, backend: Box<dyn PciBackend>) -> Arc<Self> {
        Arc::new(Self {
            backend: Mutex::new(backend),
            mode: config.mode,
            alloc: Mutex::new(AllocState {
                io: config.io,
                mem: config.mem,
                mem_pref: config.mem_pref,
                busno: 0,
            }),
            config,
            root: OnceLock::new(),
        })
    }

    pub fn mode(&self) -> ScanMode {
        self.mode
    }

    /// The window configuration as handed in, before any allocation
    /// advanced the live copies.
    pub fn windows(&self) -> &PciControllerConfig {
        &self.config
    }

    /// The root bus, once the controller has been registered and scanned.
    pub fn root(&self) -> Option<Arc<PciBus>> {
        self.root.get().and_then(Weak::upgrade)
    }

    pub(crate) fn set_root(&self, bus: &Arc<PciBus>) {
        let _ = self.root.set(Arc::downgrade(bus));
    }
}

/// One bus in the hierarchy: the controller's root, or the secondary side
/// of a bridge.
pub struct PciBus {
    number: u8,
    ctrl: Arc<PciController>,
    parent: Option<Weak<PciBus>>,
    children: OnceLock<Vec<Arc<PciBus>>>,
    devices: OnceLock<Vec<Arc<PciDevice>>>,
}

impl PciBus {
    pub(crate) fn new(
        number: u8,
        ctrl: Arc<PciController>,
        parent: Option<Weak<PciBus>>,
    ) -> Self {
        Self {
            number,
            ctrl,
            parent,
            children: OnceLock::new(),
            devices: OnceLock::new(),
        }
    }

    pub(crate) fn set_children(&self, children: Vec<Arc<PciBus>>) {
        let _ = self.children.set(children);
    }

    pub(crate) fn set_devices(&self, devices: Vec<Arc<PciDevice>>) {
        let _ = self.devices.set(devices);
    }

    pub fn number(&self) -> u8 {
        self.number
    }

    pub fn controller(&self) -> &Arc<PciController> {
        &self.ctrl
    }

    /// The bus on the primary side of the bridge leading here; `None` for a
    /// controller's root bus.
    pub fn parent(&self) -> Option<Arc<PciBus>> {
        self.parent.as_ref().and_then(Weak::upgrade)
    }

    /// Buses behind bridges on this bus, in discovery order.
    pub fn children(&self) -> &[Arc<PciBus>] {
        self.children.get().map(Vec::as_slice).unwrap_or(&[])
    }

    /// Device functions found on this bus, in discovery order.
    pub fn devices(&self) -> &[Arc<PciDevice>] {
        self.devices.get().map(Vec::as_slice).unwrap_or(&[])
    }

    /// Width-checked config read of `(self, devfn, offset)`.
    pub fn read_config<V: ConfigValue>(&self, devfn: u8, offset: u16) -> Result<V, PciError> {
        let mut ops = self.ctrl.backend.lock().unwrap();
        config::read(ops.as_mut(), self.number, devfn, offset)
    }

    /// Width-checked config write of `(self, devfn, offset)`.
    pub fn write_config<V: ConfigValue>(
        &self,
        devfn: u8,
        offset: u16,
        value: V,
    ) -> Result<(), PciError> {
        let mut ops = self.ctrl.backend.lock().unwrap();
        config::write(ops.as_mut(), self.number, devfn, offset, value)
    }
}

impl fmt::Debug for PciBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PciBus")
            .field("number", &self.number)
            .field("children", &self.children().len())
            .field("devices", &self.devices().len())
            .finish()
    }
}

/// One PCI function.
pub struct PciDevice {
    pub(crate) bus: Arc<PciBus>,
    pub(crate) devfn: u8,
    pub(crate) vendor: u16,
    pub(crate) device: u16,
    pub(crate) revision: u8,
    /// 24-bit class / subclass / prog-if.
    pub(crate) class: u32,
    /// Low 7 bits of the header type; the multifunction bit is not kept.
    pub(crate) hdr_type: u8,
    pub(crate) subsystem_vendor: u16,
    pub(crate) subsystem_device: u16,
    pub(crate) resources: [PciResource; PCI_NUM_RESOURCES],
    /// The secondary bus, when this function is a PCI-to-PCI bridge.
    pub(crate) subordinate: Option<Arc<PciBus>>,
    /// Bound driver; written only under the registry lock.
    pub(crate) driver: Mutex<Option<Arc<dyn PciDriver>>>,
}

impl PciDevice {
    pub fn bus(&self) -> &Arc<PciBus> {
        &self.bus
    }

    pub fn devfn(&self) -> u8 {
        self.devfn
    }

    pub fn vendor(&self) -> u16 {
        self.vendor
    }

    pub fn device(&self) -> u16 {
        self.device
    }

    pub fn revision(&self) -> u8 {
        self.revision
    }

    /// 24-bit class / subclass / prog-if.
    pub fn class(&self) -> u32 {
        self.class
    }

    pub fn hdr_type(&self) -> u8 {
        self.hdr_type
    }

    pub fn subsystem_vendor(&self) -> u16 {
        self.subsystem_vendor
    }

    pub fn subsystem_device(&self) -> u16 {
        self.subsystem_device
    }

    pub fn resource(&self, bar: usize) -> PciResource {
        self.resources[bar]
    }

    pub fn resources(&self) -> &[PciResource; PCI_NUM_RESOURCES] {
        &self.resources
    }

    /// The secondary bus behind this function, when it is a bridge.
    pub fn subordinate(&self) -> Option<&Arc<PciBus>> {
        self.subordinate.as_ref()
    }

    /// The driver currently bound to this device, if any.
    pub fn driver(&self) -> Option<Arc<dyn PciDriver>> {
        self.driver.lock().unwrap().clone()
    }

    pub(crate) fn bind(&self, drv: Arc<dyn PciDriver>) {
        *self.driver.lock().unwrap() = Some(drv);
    }

    pub(crate) fn unbind(&self) {
        *self.driver.lock().unwrap() = None;
    }

    /// Width-checked config read at `offset`.
    pub fn read_config<V: ConfigValue>(&self, offset: u16) -> Result<V, PciError> {
        self.bus.read_config(self.devfn, offset)
    }

    /// Width-checked config write at `offset`.
    pub fn write_config<V: ConfigValue>(&self, offset: u16, value: V) -> Result<(), PciError> {
        self.bus.write_config(self.devfn, offset, value)
    }

    fn change_master(&self, enable: bool) -> Result<(), PciError> {
        let old: u16 = self.read_config(PCI_COMMAND)?;
        let cmd = if enable {
            old | PCI_COMMAND_MASTER
        } else {
            old & !PCI_COMMAND_MASTER
        };
        if cmd != old {
            self.write_config(PCI_COMMAND, cmd)?;
        }
        Ok(())
    }

    /// Allow the device to master the bus (issue DMA).
    pub fn set_master(&self) -> Result<(), PciError> {
        self.change_master(true)
    }

    pub fn clear_master(&self) -> Result<(), PciError> {
        self.change_master(false)
    }

    /// Turn on I/O and memory decoding so the assigned BARs respond.
    pub fn enable_device(&self) -> Result<(), PciError> {
        let cmd: u32 = self.read_config(PCI_COMMAND)?;
        self.write_config(
            PCI_COMMAND,
            cmd | u32::from(PCI_COMMAND_IO | PCI_COMMAND_MEMORY),
        )
    }

    /// Turn off I/O and memory decoding.
    pub fn disable_device(&self) -> Result<(), PciError> {
        let cmd: u32 = self.read_config(PCI_COMMAND)?;
        self.write_config(
            PCI_COMMAND,
            cmd & !u32::from(PCI_COMMAND_IO | PCI_COMMAND_MEMORY),
        )
    }

    /// Bitmask with bit `i` set for every resource matching any of `flags`.
    pub fn select_bars(&self, flags: ResourceFlags) -> u32 {
        let mut bars = 0;
        for (i, res) in self.resources.iter().enumerate() {
            if res.flags.intersects(flags) {
                bars |= 1 << i;
            }
        }
        bars
    }

    /// CPU-visible address of an assigned BAR.
    ///
    /// Goes through the backend's `map` when the platform supplies one and
    /// otherwise hands back the raw bus address (identity mapping). `None`
    /// when the BAR is unimplemented or was never assigned.
    pub fn map_bar(&self, bar: usize) -> Option<u64> {
        let res = *self.resources.get(bar)?;
        if res.is_unset() {
            return None;
        }
        let mut ops = self.bus.ctrl.backend.lock().unwrap();
        Some(
            ops.map(self.bus.number, res.start, res.end)
                .unwrap_or(res.start),
        )
    }

    /// Offset of capability `cap` in this function's capability list, or 0.
    pub fn find_capability(&self, cap: u8) -> u8 {
        let pos = find_start_cap(&self.bus, self.devfn, self.hdr_type);
        if pos == 0 {
            return 0;
        }
        find_next_cap(&self.bus, self.devfn, pos, cap)
    }

    /// Next occurrence of capability `cap` after the entry at `pos`, or 0.
    pub fn find_next_capability(&self, pos: u8, cap: u8) -> u8 {
        find_next_cap(
            &self.bus,
            self.devfn,
            u16::from(pos) + PCI_CAP_LIST_NEXT,
            cap,
        )
    }
}

impl fmt::Debug for PciDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PciDevice")
            .field(
                "address",
                &format_args!(
                    "{:02x}:{:02x}.{}",
                    self.bus.number(),
                    devfn_slot(self.devfn),
                    devfn_func(self.devfn)
                ),
            )
            .field("id", &format_args!("{:04x}:{:04x}", self.vendor, self.device))
            .field("class", &format_args!("{:06x}", self.class))
            .finish()
    }
}

/// Config offset holding the first capability pointer, or 0 when the
/// function advertises no capability list.
fn find_start_cap(bus: &PciBus, devfn: u8, hdr_type: u8) -> u16 {
    let status: u16 = match bus.read_config(devfn, PCI_STATUS) {
        Ok(status) => status,
        Err(_) => return 0,
    };
    if status & PCI_STATUS_CAP_LIST == 0 {
        return 0;
    }

    match hdr_type {
        PCI_HEADER_TYPE_NORMAL | PCI_HEADER_TYPE_BRIDGE => PCI_CAPABILITY_LIST,
        PCI_HEADER_TYPE_CARDBUS => PCI_CB_CAPABILITY_LIST,
        _ => 0,
    }
}

/// Follow the capability chain starting at the pointer byte at `pos`.
///
/// Pointers below 0x40 terminate the walk (the standard header is not a
/// capability), as does an ID of 0xFF or TTL exhaustion.
fn find_next_cap(bus: &PciBus, devfn: u8, pos: u16, cap: u8) -> u8 {
    let mut ttl = PCI_FIND_CAP_TTL;

    let mut pos: u8 = match bus.read_config(devfn, pos) {
        Ok(pos) => pos,
        Err(_) => return 0,
    };

    loop {
        ttl -= 1;
        if ttl < 0 || pos < 0x40 {
            break;
        }

        pos &= !3;
        let ent: u16 = match bus.read_config(devfn, u16::from(pos)) {
            Ok(ent) => ent,
            Err(_) => break,
        };

        let id = (ent & 0xFF) as u8;
        if id == 0xFF {
            break;
        }
        if id == cap {
            return pos;
        }

        pos = (ent >> 8) as u8;
    }

    0
}
