//! Bus enumeration: the devfn sweep, BAR sizing and assignment, and bridge
//! window programming.
//!
//! The scanner walks the hierarchy depth-first over a mutable scratch tree
//! while it still has exclusive access to the controller (nothing is
//! published yet), then freezes the result into the shared
//! [`PciBus`]/[`PciDevice`] graph. Recursion depth is bounded by the
//! 256-bus limit of the fabric itself; real topologies are a handful of
//! levels deep.

use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use crate::backend::PciBackend;
use crate::bus::{
    devfn_func, devfn_slot, AllocState, PciBus, PciController, PciDevice, ScanMode,
    PCI_NUM_RESOURCES,
};
use crate::config::{
    self, ConfigValue, PCI_BASE_ADDRESS_0, PCI_BASE_ADDRESS_IO_MASK, PCI_BASE_ADDRESS_MEM_MASK,
    PCI_BASE_ADDRESS_MEM_PREFETCH, PCI_BASE_ADDRESS_SPACE_IO, PCI_CLASS_BRIDGE_PCI,
    PCI_CLASS_REVISION, PCI_COMMAND, PCI_COMMAND_IO, PCI_COMMAND_MASTER, PCI_COMMAND_MEMORY,
    PCI_HEADER_TYPE, PCI_HEADER_TYPE_BRIDGE, PCI_HEADER_TYPE_MULTI, PCI_HEADER_TYPE_NORMAL,
    PCI_IO_BASE, PCI_IO_BASE_UPPER16, PCI_IO_LIMIT, PCI_IO_LIMIT_UPPER16, PCI_MEMORY_BASE,
    PCI_MEMORY_LIMIT, PCI_PREF_BASE_UPPER32, PCI_PREF_LIMIT_UPPER32, PCI_PREF_MEMORY_BASE,
    PCI_PREF_MEMORY_LIMIT, PCI_PRIMARY_BUS, PCI_SECONDARY_BUS, PCI_SUBORDINATE_BUS,
    PCI_SUBSYSTEM_ID, PCI_SUBSYSTEM_VENDOR_ID, PCI_VENDOR_ID,
};
use crate::resource::{PciResource, ResourceFlags};
use crate::PciError;

const MIB: u64 = 1024 * 1024;
const KIB_4: u64 = 4 * 1024;

/// Scratch tree node for a bus while enumeration is still in flight.
struct ScannedBus {
    number: u8,
    devices: Vec<ScannedDevice>,
}

impl ScannedBus {
    fn new(number: u8) -> Self {
        Self {
            number,
            devices: Vec::new(),
        }
    }
}

/// Scratch record for one discovered function.
struct ScannedDevice {
    devfn: u8,
    vendor: u16,
    device: u16,
    revision: u8,
    class: u32,
    hdr_type: u8,
    subsystem_vendor: u16,
    subsystem_device: u16,
    resources: [PciResource; PCI_NUM_RESOURCES],
    /// Secondary bus, when the function is a bridge.
    child: Option<ScannedBus>,
}

/// Scan the hierarchy behind `ctrl` and publish the resulting bus tree.
///
/// Must run before the controller is visible to anyone else; the scanner
/// holds the backend and allocation locks for the whole walk.
pub(crate) fn scan_and_publish(ctrl: &Arc<PciController>) -> Arc<PciBus> {
    let scanned = {
        let mut ops = ctrl.backend.lock().unwrap();
        let mut alloc = ctrl.alloc.lock().unwrap();
        alloc.busno = 1;

        let mut scanner = Scanner {
            ops: ops.as_mut(),
            alloc: &mut alloc,
            mode: ctrl.mode(),
        };
        let mut root = ScannedBus::new(0);
        scanner.scan_bus(&mut root);
        root
    };

    let root = publish_bus(ctrl, None, scanned);
    ctrl.set_root(&root);
    root
}

fn publish_bus(
    ctrl: &Arc<PciController>,
    parent: Option<&Arc<PciBus>>,
    scanned: ScannedBus,
) -> Arc<PciBus> {
    let bus = Arc::new(PciBus::new(
        scanned.number,
        ctrl.clone(),
        parent.map(Arc::downgrade),
    ));

    let mut children = Vec::new();
    let mut devices = Vec::with_capacity(scanned.devices.len());
    for dev in scanned.devices {
        let subordinate = dev
            .child
            .map(|child| publish_bus(ctrl, Some(&bus), child));
        if let Some(child) = &subordinate {
            children.push(child.clone());
        }
        devices.push(Arc::new(PciDevice {
            bus: bus.clone(),
            devfn: dev.devfn,
            vendor: dev.vendor,
            device: dev.device,
            revision: dev.revision,
            class: dev.class,
            hdr_type: dev.hdr_type,
            subsystem_vendor: dev.subsystem_vendor,
            subsystem_device: dev.subsystem_device,
            resources: dev.resources,
            subordinate,
            driver: Mutex::new(None),
        }));
    }

    bus.set_children(children);
    bus.set_devices(devices);
    bus
}

struct Scanner<'a> {
    ops: &'a mut dyn PciBackend,
    alloc: &'a mut AllocState,
    mode: ScanMode,
}

impl Scanner<'_> {
    fn read<V: ConfigValue>(&mut self, bus: u8, devfn: u8, offset: u16) -> Result<V, PciError> {
        config::read(self.ops, bus, devfn, offset)
    }

    /// Config write whose failure only merits a log line; a present device
    /// refusing a write is not a reason to abandon the scan.
    fn write<V: ConfigValue>(&mut self, bus: u8, devfn: u8, offset: u16, value: V) {
        if let Err(err) = config::write(self.ops, bus, devfn, offset, value) {
            debug!(bus, devfn, offset, "config write failed during scan: {err}");
        }
    }

    /// Sweep every devfn on `bus`, descending into bridges depth-first.
    fn scan_bus(&mut self, bus: &mut ScannedBus) {
        debug!(bus = bus.number, "scanning bus");

        let mut is_multi = false;

        // The sweep stops short of devfn 0xFF, so device 31 function 7 is
        // never probed.
        for devfn in 0u8..0xFF {
            if devfn_func(devfn) != 0 && !is_multi {
                // Function 0 did not advertise further functions; skip
                // without touching the bus at all.
                continue;
            }

            let Ok(hdr_type) = self.read::<u8>(bus.number, devfn, PCI_HEADER_TYPE) else {
                continue;
            };

            if devfn_func(devfn) == 0 {
                is_multi = hdr_type & PCI_HEADER_TYPE_MULTI != 0;
            }

            // Empty slots read as all-ones on sane hardware, but some
            // boards float 0 or half the register instead.
            let Ok(id) = self.read::<u32>(bus.number, devfn, PCI_VENDOR_ID) else {
                continue;
            };
            if matches!(id, 0xFFFF_FFFF | 0x0000_0000 | 0x0000_FFFF | 0xFFFF_0000) {
                continue;
            }

            let classrev = self.read::<u32>(bus.number, devfn, PCI_CLASS_REVISION).unwrap_or(0);
            let class = classrev >> 8;

            let mut dev = ScannedDevice {
                devfn,
                vendor: (id & 0xFFFF) as u16,
                device: (id >> 16) as u16,
                revision: classrev as u8,
                class,
                hdr_type: hdr_type & !PCI_HEADER_TYPE_MULTI,
                subsystem_vendor: 0,
                subsystem_device: 0,
                resources: [PciResource::default(); PCI_NUM_RESOURCES],
                child: None,
            };

            debug!(
                "found {:02x}:{:02x}.{} [{:04x}:{:04x}] class {:06x} hdr {:#04x}",
                bus.number,
                devfn_slot(devfn),
                devfn_func(devfn),
                dev.vendor,
                dev.device,
                class,
                hdr_type,
            );

            match dev.hdr_type {
                PCI_HEADER_TYPE_NORMAL => {
                    if (class >> 8) as u16 == PCI_CLASS_BRIDGE_PCI {
                        // A bridge hiding behind a type-0 header is broken
                        // enough that it gets ignored wholesale.
                        warn!(
                            "{:02x}:{:02x}.{} claims bridge class with a normal header, ignoring",
                            bus.number,
                            devfn_slot(devfn),
                            devfn_func(devfn),
                        );
                        continue;
                    }

                    self.setup_device(bus.number, &mut dev, PCI_NUM_RESOURCES);

                    dev.subsystem_device = self
                        .read(bus.number, devfn, PCI_SUBSYSTEM_ID)
                        .unwrap_or(0);
                    dev.subsystem_vendor = self
                        .read(bus.number, devfn, PCI_SUBSYSTEM_VENDOR_ID)
                        .unwrap_or(0);
                }

                PCI_HEADER_TYPE_BRIDGE => {
                    let mut child = ScannedBus::new(0);
                    if self.mode == ScanMode::AssignAll {
                        child.number = self.alloc.busno;
                        self.alloc.busno = self.alloc.busno.wrapping_add(1);
                    }

                    self.presetup_bridge(&mut bus.number, devfn, &mut child);
                    self.scan_bus(&mut child);
                    self.postsetup_bridge(bus.number, devfn);

                    // The bridge's own header carries two BARs of its own.
                    self.setup_device(bus.number, &mut dev, 2);
                    dev.child = Some(child);
                }

                other => {
                    warn!(
                        "{:02x}:{:02x}.{} [{:04x}:{:04x}] has unknown header type {:#04x}, ignoring",
                        bus.number,
                        devfn_slot(devfn),
                        devfn_func(devfn),
                        dev.vendor,
                        dev.device,
                        other,
                    );
                    continue;
                }
            }

            bus.devices.push(dev);
        }
    }

    /// Size and assign every BAR of `dev`.
    ///
    /// In [`ScanMode::AssignAll`] the device's decode enables are silenced
    /// around the probe so the all-ones sizing writes cannot cause stray
    /// decodes at unassigned addresses.
    fn setup_device(&mut self, bus: u8, dev: &mut ScannedDevice, max_bar: usize) {
        let saved_cmd = if self.mode == ScanMode::AssignAll {
            let cmd: u8 = self.read(bus, dev.devfn, PCI_COMMAND).unwrap_or(0);
            self.write(
                bus,
                dev.devfn,
                PCI_COMMAND,
                cmd & !(PCI_COMMAND_IO as u8) & !(PCI_COMMAND_MEMORY as u8),
            );
            Some(cmd)
        } else {
            None
        };

        self.assign_bars(bus, dev, max_bar);

        if let Some(cmd) = saved_cmd {
            self.write(bus, dev.devfn, PCI_COMMAND, cmd);
        }
    }

    fn assign_bars(&mut self, bus: u8, dev: &mut ScannedDevice, max_bar: usize) {
        let devfn = dev.devfn;
        let mut bar = 0;

        while bar < max_bar {
            let base0 = PCI_BASE_ADDRESS_0 + 4 * bar as u16;
            let base1 = base0 + 4;

            // Probe the size mask: write all-ones (preserving the space
            // bit), read back, restore.
            let Ok(orig) = self.read::<u32>(bus, devfn, base0) else {
                bar += 1;
                continue;
            };
            self.write::<u32>(bus, devfn, base0, 0xFFFF_FFFE);
            let Ok(mask) = self.read::<u32>(bus, devfn, base0) else {
                self.write(bus, devfn, base0, orig);
                bar += 1;
                continue;
            };
            self.write(bus, devfn, base0, orig);

            if mask == 0 || mask == 0xFFFF_FFFF {
                debug!("bar{bar} not implemented");
                bar += 1;
                continue;
            }

            // The memory size mask strips the type/prefetch bits (3:1) so
            // they are never mistaken for address bits.
            let io_bar = mask & PCI_BASE_ADDRESS_SPACE_IO != 0;
            let (size, flags) = if io_bar {
                (pci_size(orig, mask, 0xFFFF_FFF0), ResourceFlags::IO)
            } else if mask & PCI_BASE_ADDRESS_MEM_PREFETCH != 0 && self.alloc.mem_pref.size() != 0
            {
                (
                    pci_size(orig, mask, PCI_BASE_ADDRESS_MEM_MASK),
                    ResourceFlags::MEM | ResourceFlags::PREFETCH,
                )
            } else {
                (pci_size(orig, mask, PCI_BASE_ADDRESS_MEM_MASK), ResourceFlags::MEM)
            };

            if size == 0 {
                warn!("bar{bar} mask {mask:#010x} sizes to zero, skipping");
                bar += 1;
                continue;
            }

            // Memory type field 0b10 marks the low half of a 64-bit pair.
            let is_64 = !io_bar && ((mask >> 1) & 0x3) == 2;

            debug!("bar{bar}: mask={mask:#010x} {size} bytes");

            let start = match self.mode {
                ScanMode::AssignAll => {
                    let window = if io_bar {
                        &mut self.alloc.io
                    } else if flags.contains(ResourceFlags::PREFETCH) {
                        &mut self.alloc.mem_pref
                    } else {
                        &mut self.alloc.mem
                    };

                    let Some(start) = window.take(u64::from(size)) else {
                        warn!(
                            "bar{bar}: {size} bytes do not fit in the remaining window, \
                             leaving the rest of the device unassigned"
                        );
                        return;
                    };

                    self.write(bus, devfn, base0, start as u32);
                    if is_64 {
                        self.write(bus, devfn, base1, (start >> 32) as u32);
                    }
                    start
                }

                ScanMode::FirmwareAssigned => {
                    let lo = self.read::<u32>(bus, devfn, base0).unwrap_or(0);
                    let mut start = if io_bar {
                        u64::from(lo & PCI_BASE_ADDRESS_IO_MASK)
                    } else {
                        u64::from(lo & PCI_BASE_ADDRESS_MEM_MASK)
                    };
                    if is_64 {
                        let hi = self.read::<u32>(bus, devfn, base1).unwrap_or(0);
                        start |= u64::from(hi) << 32;
                    }
                    start
                }
            };

            dev.resources[bar] = PciResource {
                start,
                end: start + u64::from(size) - 1,
                flags,
            };

            if is_64 {
                dev.resources[bar].flags |= ResourceFlags::MEM_64;
                // The next BAR index holds the high half of the address and
                // is not a BAR of its own.
                bar += 1;
            }
            bar += 1;
        }
    }

    /// Program a bridge before descending into its secondary bus.
    ///
    /// In assign-all mode this fixes the primary/secondary numbers, opens
    /// the forwarding windows at the current window cursors (the matching
    /// limits are written by [`Self::postsetup_bridge`] once the descent
    /// has consumed its addresses), and enables the bridge. In firmware
    /// mode the already-programmed numbers are read back instead.
    fn presetup_bridge(&mut self, bus_number: &mut u8, devfn: u8, child: &mut ScannedBus) {
        if self.mode == ScanMode::FirmwareAssigned {
            if let Ok(primary) = self.read::<u8>(*bus_number, devfn, PCI_PRIMARY_BUS) {
                *bus_number = primary;
            }
            if let Ok(secondary) = self.read::<u8>(*bus_number, devfn, PCI_SECONDARY_BUS) {
                child.number = secondary;
            }
            return;
        }

        let bus = *bus_number;
        let mut cmdstat: u16 = self.read(bus, devfn, PCI_COMMAND).unwrap_or(0);

        self.write(bus, devfn, PCI_PRIMARY_BUS, bus);
        self.write(bus, devfn, PCI_SECONDARY_BUS, child.number);
        // Upper bound during the descent; tightened in postsetup_bridge.
        self.write::<u8>(bus, devfn, PCI_SUBORDINATE_BUS, 0xFF);

        if self.alloc.mem.size() != 0 {
            self.alloc.mem.align_start(MIB);
            let start = self.alloc.mem.start;
            self.write(
                bus,
                devfn,
                PCI_MEMORY_BASE,
                ((start & 0xFFF0_0000) >> 16) as u16,
            );
            cmdstat |= PCI_COMMAND_MEMORY;
        } else {
            // Closed window: base above limit.
            self.write::<u16>(bus, devfn, PCI_MEMORY_BASE, 0x1000);
            self.write::<u16>(bus, devfn, PCI_MEMORY_LIMIT, 0x0);
        }

        if self.alloc.mem_pref.size() != 0 {
            self.alloc.mem_pref.align_start(MIB);
            let start = self.alloc.mem_pref.start;
            self.write(
                bus,
                devfn,
                PCI_PREF_MEMORY_BASE,
                ((start & 0xFFF0_0000) >> 16) as u16,
            );
            self.write(bus, devfn, PCI_PREF_BASE_UPPER32, (start >> 32) as u32);
            cmdstat |= PCI_COMMAND_MEMORY;
        } else {
            self.write::<u16>(bus, devfn, PCI_PREF_MEMORY_BASE, 0x1000);
            self.write::<u16>(bus, devfn, PCI_PREF_MEMORY_LIMIT, 0x0);
            self.write::<u32>(bus, devfn, PCI_PREF_BASE_UPPER32, 0x0);
            self.write::<u32>(bus, devfn, PCI_PREF_LIMIT_UPPER32, 0x0);
        }

        if self.alloc.io.size() != 0 {
            self.alloc.io.align_start(KIB_4);
            let start = self.alloc.io.start;
            self.write(bus, devfn, PCI_IO_BASE, ((start & 0xF000) >> 8) as u8);
            self.write(
                bus,
                devfn,
                PCI_IO_BASE_UPPER16,
                ((start & 0xFFFF_0000) >> 16) as u16,
            );
            cmdstat |= PCI_COMMAND_IO;
        }

        self.write(bus, devfn, PCI_COMMAND, cmdstat | PCI_COMMAND_MASTER);
    }

    /// Finalize a bridge after its secondary bus has been scanned: clamp
    /// the subordinate number to the last bus actually consumed and write
    /// forwarding limits just past everything the descent allocated.
    fn postsetup_bridge(&mut self, bus: u8, devfn: u8) {
        if self.mode == ScanMode::FirmwareAssigned {
            return;
        }

        self.write(
            bus,
            devfn,
            PCI_SUBORDINATE_BUS,
            self.alloc.busno.wrapping_sub(1),
        );

        if self.alloc.mem.size() != 0 {
            self.alloc.mem.align_start(MIB);
            let start = self.alloc.mem.start;
            debug!("bridge mem limit at {start:#x}");
            self.write(
                bus,
                devfn,
                PCI_MEMORY_LIMIT,
                (((start - 1) & 0xFFF0_0000) >> 16) as u16,
            );
        }

        if self.alloc.mem_pref.size() != 0 {
            self.alloc.mem_pref.align_start(MIB);
            let start = self.alloc.mem_pref.start;
            debug!("bridge prefetch limit at {start:#x}");
            self.write(
                bus,
                devfn,
                PCI_PREF_MEMORY_LIMIT,
                (((start - 1) & 0xFFF0_0000) >> 16) as u16,
            );
            self.write(
                bus,
                devfn,
                PCI_PREF_LIMIT_UPPER32,
                ((start - 1) >> 32) as u32,
            );
        }

        if self.alloc.io.size() != 0 {
            self.alloc.io.align_start(KIB_4);
            let start = self.alloc.io.start;
            debug!("bridge io limit at {start:#x}");
            self.write(
                bus,
                devfn,
                PCI_IO_LIMIT,
                (((start - 1) & 0xF000) >> 8) as u8,
            );
            self.write(
                bus,
                devfn,
                PCI_IO_LIMIT_UPPER16,
                (((start - 1) & 0xFFFF_0000) >> 16) as u16,
            );
        }
    }
}

/// Size a BAR from the mask read back after the all-ones probe.
///
/// `mask` keeps only the address bits of the readback; the size is the run
/// of zeros below the lowest writable address bit. A register that reads
/// back exactly what was in it and cannot represent the mask is not a real
/// BAR and sizes to zero.
fn pci_size(base: u32, maxbase: u32, mask: u32) -> u32 {
    let mut size = maxbase & mask;
    if size == 0 {
        return 0;
    }

    // Bits below the lowest set address bit.
    size = (size & size.wrapping_neg()) - 1;

    if base == maxbase && ((base | size) & mask) != mask {
        return 0;
    }

    size + 1
}
