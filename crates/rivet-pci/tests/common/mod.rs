//! Shared synthetic config-space backend for the integration tests.
//!
//! `FakeBus` models just enough of a PCI fabric to exercise the scanner:
//! functions keyed by `(bus, devfn)` with 256 bytes of config space each,
//! hardware-accurate BAR latching (writes keep only the address bits, reads
//! return them OR'd with the read-only type bits), writable bridge
//! registers, and a journal of every backend access so tests can assert on
//! sequencing and on slots that must never be touched.
//!
//! Functions behind a bridge are entered under the absolute bus number the
//! scanner will assign (bus numbers are handed out in discovery order
//! starting at 1).

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use rivet_pci::{PciBackend, PciError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    Read,
    Write,
}

/// One backend access, as recorded in the journal.
#[derive(Debug, Clone, Copy)]
pub struct Access {
    pub kind: AccessKind,
    pub bus: u8,
    pub devfn: u8,
    pub offset: u16,
    pub size: usize,
    /// Written value; 0 for reads.
    pub value: u32,
}

const NUM_BARS: usize = 6;

/// One synthetic function: raw config space plus per-BAR latching masks.
pub struct FakeFunction {
    data: [u8; 256],
    /// Writable address bits per BAR register; 0 = not implemented.
    bar_mask: [u32; NUM_BARS],
    /// Read-only low bits (space/type/prefetch) OR'd into BAR readbacks.
    bar_low: [u32; NUM_BARS],
}

impl FakeFunction {
    fn blank(vendor: u16, device: u16, hdr_type: u8) -> Self {
        let mut f = Self {
            data: [0; 256],
            bar_mask: [0; NUM_BARS],
            bar_low: [0; NUM_BARS],
        };
        f.data[0..2].copy_from_slice(&vendor.to_le_bytes());
        f.data[2..4].copy_from_slice(&device.to_le_bytes());
        f.data[0x0E] = hdr_type;
        f
    }

    /// A type-0 function with no class and no BARs.
    pub fn endpoint(vendor: u16, device: u16) -> Self {
        Self::blank(vendor, device, 0x00)
    }

    /// A type-1 PCI-to-PCI bridge (class 0x060400).
    pub fn bridge(vendor: u16, device: u16) -> Self {
        Self::blank(vendor, device, 0x01).class(0x060400)
    }

    /// Set the multifunction bit in the header type.
    pub fn multifunction(mut self) -> Self {
        self.data[0x0E] |= 0x80;
        self
    }

    /// 24-bit class / subclass / prog-if.
    pub fn class(mut self, class: u32) -> Self {
        self.data[0x09] = class as u8;
        self.data[0x0A] = (class >> 8) as u8;
        self.data[0x0B] = (class >> 16) as u8;
        self
    }

    pub fn revision(mut self, revision: u8) -> Self {
        self.data[0x08] = revision;
        self
    }

    pub fn subsystem(mut self, vendor: u16, device: u16) -> Self {
        self.data[0x2C..0x2E].copy_from_slice(&vendor.to_le_bytes());
        self.data[0x2E..0x30].copy_from_slice(&device.to_le_bytes());
        self
    }

    pub fn command(mut self, command: u16) -> Self {
        self.data[0x04..0x06].copy_from_slice(&command.to_le_bytes());
        self
    }

    fn set_bar(mut self, bar: usize, mask: u32, low: u32, addr: u32) -> Self {
        self.bar_mask[bar] = mask;
        self.bar_low[bar] = low;
        let reg = (addr & mask) | low;
        let off = 0x10 + 4 * bar;
        self.data[off..off + 4].copy_from_slice(&reg.to_le_bytes());
        self
    }

    /// An I/O BAR of `size` bytes (power of two, >= 8).
    pub fn io_bar(self, bar: usize, size: u32) -> Self {
        self.io_bar_at(bar, size, 0)
    }

    /// An I/O BAR already programmed to `addr` (firmware mode).
    pub fn io_bar_at(self, bar: usize, size: u32, addr: u32) -> Self {
        assert!(size.is_power_of_two());
        self.set_bar(bar, !(size - 1) & !0x3, 0x1, addr)
    }

    /// A 32-bit non-prefetchable memory BAR of `size` bytes.
    pub fn mem_bar(self, bar: usize, size: u32) -> Self {
        self.mem_bar_at(bar, size, 0)
    }

    /// A 32-bit memory BAR already programmed to `addr` (firmware mode).
    pub fn mem_bar_at(self, bar: usize, size: u32, addr: u32) -> Self {
        assert!(size.is_power_of_two());
        self.set_bar(bar, !(size - 1) & !0xF, 0x0, addr)
    }

    /// A 32-bit prefetchable memory BAR of `size` bytes.
    pub fn pref_mem_bar(self, bar: usize, size: u32) -> Self {
        assert!(size.is_power_of_two());
        self.set_bar(bar, !(size - 1) & !0xF, 0x8, 0)
    }

    /// A 64-bit prefetchable memory BAR pair at `bar`/`bar + 1`.
    pub fn pref_mem64_bar(self, bar: usize, size: u64) -> Self {
        self.pref_mem64_bar_at(bar, size, 0)
    }

    /// A 64-bit prefetchable memory BAR pair already programmed to `addr`.
    pub fn pref_mem64_bar_at(self, bar: usize, size: u64, addr: u64) -> Self {
        assert!(size.is_power_of_two());
        let low_mask = (!(size - 1) as u32) & !0xF;
        self.set_bar(bar, low_mask, 0xC, addr as u32)
            // High half of the address: all bits writable, no type bits.
            .set_bar(bar + 1, 0xFFFF_FFFF, 0, (addr >> 32) as u32)
    }

    /// Advertise a capability chain: entries are `(offset, id)` and each
    /// entry's next-pointer links to the following one (0 for the last).
    pub fn cap_chain(mut self, entries: &[(u8, u8)]) -> Self {
        self.data[0x06] |= 0x10; // STATUS_CAP_LIST
        if let Some(&(first, _)) = entries.first() {
            self.data[0x34] = first;
        }
        for (i, &(offset, id)) in entries.iter().enumerate() {
            let next = entries.get(i + 1).map(|&(off, _)| off).unwrap_or(0);
            self.data[offset as usize] = id;
            self.data[offset as usize + 1] = next;
        }
        self
    }

    /// Raw bytes at `offset`, for layouts the builders cannot express
    /// (e.g. deliberately circular capability chains).
    pub fn raw(mut self, offset: usize, bytes: &[u8]) -> Self {
        self.data[offset..offset + bytes.len()].copy_from_slice(bytes);
        self
    }

    fn num_bars(&self) -> usize {
        if self.data[0x0E] & 0x7F == 0x01 {
            2
        } else {
            NUM_BARS
        }
    }

    fn bar_index(&self, offset: u16) -> Option<usize> {
        let bar_end = 0x10 + 4 * self.num_bars() as u16;
        if (0x10..bar_end).contains(&offset) && offset % 4 == 0 {
            Some(usize::from(offset - 0x10) / 4)
        } else {
            None
        }
    }

    fn read(&self, offset: u16, size: usize) -> u32 {
        let off = usize::from(offset);
        let mut value = 0u32;
        for i in 0..size {
            value |= u32::from(self.data[off + i]) << (8 * i);
        }
        value
    }

    fn write(&mut self, offset: u16, size: usize, value: u32) {
        // BAR registers latch only their address bits and read back the
        // type bits; everything else is plain memory.
        if size == 4 {
            if let Some(bar) = self.bar_index(offset) {
                let reg = (value & self.bar_mask[bar]) | self.bar_low[bar];
                let off = usize::from(offset);
                self.data[off..off + 4].copy_from_slice(&reg.to_le_bytes());
                return;
            }
        }

        let off = usize::from(offset);
        for i in 0..size {
            self.data[off + i] = (value >> (8 * i)) as u8;
        }
    }
}

struct FakeBusState {
    funcs: Vec<((u8, u8), FakeFunction)>,
    journal: Vec<Access>,
    /// When set, reads of empty slots fail instead of floating high.
    missing_is_error: bool,
    /// When set, the backend advertises a `map` op adding this offset.
    map_offset: Option<u64>,
}

/// Shared handle to the synthetic fabric. Cloning shares the state, so a
/// test can keep one handle for inspection while the controller owns the
/// backend.
#[derive(Clone)]
pub struct FakeBus {
    state: Arc<Mutex<FakeBusState>>,
}

impl Default for FakeBus {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeBus {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(FakeBusState {
                funcs: Vec::new(),
                journal: Vec::new(),
                missing_is_error: false,
                map_offset: None,
            })),
        }
    }

    /// Install a function at `(bus, devfn)`. Functions behind bridges use
    /// the bus number the scan will assign (discovery order, starting 1).
    pub fn add(&self, bus: u8, devfn: u8, func: FakeFunction) {
        let mut state = self.state.lock().unwrap();
        assert!(
            !state.funcs.iter().any(|(key, _)| *key == (bus, devfn)),
            "duplicate fake function at ({bus}, {devfn:#x})"
        );
        state.funcs.push(((bus, devfn), func));
    }

    /// Make reads of empty slots return `Err` instead of all-ones.
    pub fn missing_slots_error(&self) {
        self.state.lock().unwrap().missing_is_error = true;
    }

    /// Advertise a `map` op translating BAR starts by `offset`.
    pub fn set_map_offset(&self, offset: u64) {
        self.state.lock().unwrap().map_offset = Some(offset);
    }

    /// A boxed backend handle sharing this fabric.
    pub fn backend(&self) -> Box<dyn PciBackend> {
        Box::new(self.clone())
    }

    /// Peek config space directly, without journaling.
    pub fn peek(&self, bus: u8, devfn: u8, offset: u16, size: usize) -> u32 {
        let state = self.state.lock().unwrap();
        state
            .funcs
            .iter()
            .find(|(key, _)| *key == (bus, devfn))
            .map(|(_, func)| func.read(offset, size))
            .unwrap_or_else(|| all_ones(size))
    }

    pub fn journal(&self) -> Vec<Access> {
        self.state.lock().unwrap().journal.clone()
    }

    pub fn clear_journal(&self) {
        self.state.lock().unwrap().journal.clear();
    }

    /// Every journaled access touching `(bus, devfn)`.
    pub fn accesses_to(&self, bus: u8, devfn: u8) -> Vec<Access> {
        self.journal()
            .into_iter()
            .filter(|access| access.bus == bus && access.devfn == devfn)
            .collect()
    }
}

impl PciBackend for FakeBus {
    fn read(&mut self, bus: u8, devfn: u8, offset: u16, size: usize) -> Result<u32, PciError> {
        let mut state = self.state.lock().unwrap();
        state.journal.push(Access {
            kind: AccessKind::Read,
            bus,
            devfn,
            offset,
            size,
            value: 0,
        });

        match state.funcs.iter().find(|(key, _)| *key == (bus, devfn)) {
            Some((_, func)) => Ok(func.read(offset, size)),
            None if state.missing_is_error => Err(PciError::Bus),
            None => Ok(all_ones(size)),
        }
    }

    fn write(
        &mut self,
        bus: u8,
        devfn: u8,
        offset: u16,
        size: usize,
        value: u32,
    ) -> Result<(), PciError> {
        let mut state = self.state.lock().unwrap();
        state.journal.push(Access {
            kind: AccessKind::Write,
            bus,
            devfn,
            offset,
            size,
            value,
        });

        let missing_is_error = state.missing_is_error;
        match state.funcs.iter_mut().find(|(key, _)| *key == (bus, devfn)) {
            Some((_, func)) => {
                func.write(offset, size, value);
                Ok(())
            }
            None if missing_is_error => Err(PciError::Bus),
            None => Ok(()),
        }
    }

    fn map(&mut self, _bus: u8, bar_start: u64, _bar_end: u64) -> Option<u64> {
        let offset = self.state.lock().unwrap().map_offset?;
        Some(bar_start + offset)
    }
}

fn all_ones(size: usize) -> u32 {
    match size {
        1 => 0xFF,
        2 => 0xFFFF,
        _ => 0xFFFF_FFFF,
    }
}
