//! Standard configuration-space layout and width-checked access.
//!
//! Register offsets and bit constants below follow the conventional PCI
//! header layout (type 0 and type 1). All config traffic in the crate is
//! funneled through [`read`]/[`write`], which enforce the width/alignment
//! contract before touching the controller backend.

use crate::backend::PciBackend;
use crate::PciError;

pub const PCI_VENDOR_ID: u16 = 0x00;
pub const PCI_DEVICE_ID: u16 = 0x02;
pub const PCI_COMMAND: u16 = 0x04;
pub const PCI_STATUS: u16 = 0x06;
pub const PCI_CLASS_REVISION: u16 = 0x08;
pub const PCI_HEADER_TYPE: u16 = 0x0E;
pub const PCI_BASE_ADDRESS_0: u16 = 0x10;
pub const PCI_BASE_ADDRESS_1: u16 = 0x14;
pub const PCI_PRIMARY_BUS: u16 = 0x18;
pub const PCI_SECONDARY_BUS: u16 = 0x19;
pub const PCI_SUBORDINATE_BUS: u16 = 0x1A;
pub const PCI_IO_BASE: u16 = 0x1C;
pub const PCI_IO_LIMIT: u16 = 0x1D;
pub const PCI_MEMORY_BASE: u16 = 0x20;
pub const PCI_MEMORY_LIMIT: u16 = 0x22;
pub const PCI_PREF_MEMORY_BASE: u16 = 0x24;
pub const PCI_PREF_MEMORY_LIMIT: u16 = 0x26;
pub const PCI_PREF_BASE_UPPER32: u16 = 0x28;
pub const PCI_PREF_LIMIT_UPPER32: u16 = 0x2C;
pub const PCI_SUBSYSTEM_VENDOR_ID: u16 = 0x2C;
pub const PCI_SUBSYSTEM_ID: u16 = 0x2E;
pub const PCI_IO_BASE_UPPER16: u16 = 0x30;
pub const PCI_IO_LIMIT_UPPER16: u16 = 0x32;
pub const PCI_CAPABILITY_LIST: u16 = 0x34;
/// Type-2 (cardbus) headers keep their capability pointer at 0x14.
pub const PCI_CB_CAPABILITY_LIST: u16 = 0x14;
/// Offset of the next-pointer byte within a capability entry.
pub const PCI_CAP_LIST_NEXT: u16 = 0x01;

pub const PCI_COMMAND_IO: u16 = 0x1;
pub const PCI_COMMAND_MEMORY: u16 = 0x2;
pub const PCI_COMMAND_MASTER: u16 = 0x4;
pub const PCI_STATUS_CAP_LIST: u16 = 0x10;

pub const PCI_BASE_ADDRESS_SPACE_IO: u32 = 0x1;
pub const PCI_BASE_ADDRESS_MEM_TYPE_64: u32 = 0x4;
pub const PCI_BASE_ADDRESS_MEM_PREFETCH: u32 = 0x8;
pub const PCI_BASE_ADDRESS_IO_MASK: u32 = !0x3;
pub const PCI_BASE_ADDRESS_MEM_MASK: u32 = !0xF;

pub const PCI_HEADER_TYPE_NORMAL: u8 = 0x00;
pub const PCI_HEADER_TYPE_BRIDGE: u8 = 0x01;
pub const PCI_HEADER_TYPE_CARDBUS: u8 = 0x02;
/// Function 0 advertises further functions of the same device with this bit.
pub const PCI_HEADER_TYPE_MULTI: u8 = 0x80;

/// 16-bit class/subclass of a PCI-to-PCI bridge.
pub const PCI_CLASS_BRIDGE_PCI: u16 = 0x0604;

mod sealed {
    pub trait Sealed {}
    impl Sealed for u8 {}
    impl Sealed for u16 {}
    impl Sealed for u32 {}
}

/// A configuration-space access width.
///
/// Implemented for `u8`, `u16`, and `u32` only; the backend contract knows
/// no other widths. Accesses must be naturally aligned: an offset that is
/// not a multiple of the width fails with [`PciError::Misaligned`] (byte
/// access is therefore always aligned).
pub trait ConfigValue: sealed::Sealed + Copy {
    const SIZE: usize;

    fn from_u32(raw: u32) -> Self;
    fn into_u32(self) -> u32;
}

impl ConfigValue for u8 {
    const SIZE: usize = 1;

    fn from_u32(raw: u32) -> Self {
        raw as u8
    }

    fn into_u32(self) -> u32 {
        u32::from(self)
    }
}

impl ConfigValue for u16 {
    const SIZE: usize = 2;

    fn from_u32(raw: u32) -> Self {
        raw as u16
    }

    fn into_u32(self) -> u32 {
        u32::from(self)
    }
}

impl ConfigValue for u32 {
    const SIZE: usize = 4;

    fn from_u32(raw: u32) -> Self {
        raw
    }

    fn into_u32(self) -> u32 {
        self
    }
}

fn check_alignment<V: ConfigValue>(offset: u16) -> Result<(), PciError> {
    if usize::from(offset) % V::SIZE != 0 {
        return Err(PciError::Misaligned {
            offset,
            size: V::SIZE,
        });
    }
    Ok(())
}

/// Width- and alignment-checked read of `(bus, devfn, offset)`.
pub(crate) fn read<V: ConfigValue>(
    ops: &mut dyn PciBackend,
    bus: u8,
    devfn: u8,
    offset: u16,
) -> Result<V, PciError> {
    check_alignment::<V>(offset)?;
    let raw = ops.read(bus, devfn, offset, V::SIZE)?;
    Ok(V::from_u32(raw))
}

/// Width- and alignment-checked write of `(bus, devfn, offset)`.
pub(crate) fn write<V: ConfigValue>(
    ops: &mut dyn PciBackend,
    bus: u8,
    devfn: u8,
    offset: u16,
    value: V,
) -> Result<(), PciError> {
    check_alignment::<V>(offset)?;
    ops.write(bus, devfn, offset, V::SIZE, value.into_u32())
}
