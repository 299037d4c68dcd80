//! Boot descriptor handoff.
//!
//! The second-stage loader leaves a descriptor in memory and passes its
//! address in RDI. The descriptor carries the BIOS E820 memory map plus
//! the loader's choice of heap and secure-region placement. It is read
//! once during init and never mutated.

/// Sentinel the loader writes into the first descriptor field.
pub const BOOT_MAGIC: u64 = 0xDEAD_BEEF;

/// Fallback heap placement when the descriptor is missing or corrupt:
/// 1 MiB of heap at the 2 MiB mark, inside the identity-mapped low window.
pub const FALLBACK_HEAP_BASE: u64 = 0x20_0000;
pub const FALLBACK_HEAP_SIZE: u64 = 0x10_0000;

/// First address past the kernel image. The loader places the image well
/// below this; regions overlapping it are rounded up past it before use.
pub const KERNEL_IMAGE_END: u64 = 0x40_0000;

/// E820 region classes as reported by the BIOS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum RegionKind {
    Usable = 1,
    Reserved = 2,
    AcpiReclaimable = 3,
    AcpiNvs = 4,
    Unusable = 5,
}

impl RegionKind {
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            1 => RegionKind::Usable,
            3 => RegionKind::AcpiReclaimable,
            4 => RegionKind::AcpiNvs,
            5 => RegionKind::Unusable,
            _ => RegionKind::Reserved,
        }
    }
}

/// One E820 map entry, exactly as the BIOS (and loader) lay it out.
#[derive(Debug, Clone, Copy)]
#[repr(C, packed)]
pub struct MemoryRegion {
    pub base: u64,
    pub length: u64,
    pub kind: u32,
    pub attrs: u32,
}

impl MemoryRegion {
    pub fn kind(&self) -> RegionKind {
        RegionKind::from_raw(self.kind)
    }
}

/// The fixed-size head of the boot descriptor. The E820 entry array
/// follows immediately after it in memory.
#[derive(Debug, Clone, Copy)]
#[repr(C, packed)]
pub struct BootDescriptor {
    pub magic: u64,
    pub e820_count: u16,
    pub reserved: u16,
    pub total_memory_mb: u32,
    pub secure_base: u64,
    pub heap_base: u64,
    pub heap_size: u64,
}

/// Everything the kernel needs from the loader, validated and copied out
/// of loader-owned memory.
#[derive(Debug, Clone, Copy)]
pub struct BootInfo {
    pub total_memory_mb: u32,
    pub e820_count: usize,
    pub regions: *const MemoryRegion,
    /// True when the descriptor was missing or had a bad magic and the
    /// fallback constants are in use.
    pub degraded: bool,
}

impl BootInfo {
    /// Validate the descriptor the loader handed over.
    ///
    /// A null pointer or a bad magic does not stop the boot: the kernel
    /// continues in degraded mode on the fallback constants, which is
    /// enough to get a console and a diagnosis out.
    ///
    /// # Safety
    /// `ptr`, if non-null, must point at a descriptor followed by
    /// `e820_count` `MemoryRegion` entries, all readable.
    pub unsafe fn from_ptr(ptr: *const BootDescriptor) -> BootInfo {
        if ptr.is_null() {
            return BootInfo::degraded();
        }
        let desc = core::ptr::read_unaligned(ptr);
        if desc.magic != BOOT_MAGIC {
            return BootInfo::degraded();
        }
        let regions = (ptr as usize + core::mem::size_of::<BootDescriptor>()) as *const MemoryRegion;
        BootInfo {
            total_memory_mb: desc.total_memory_mb,
            e820_count: desc.e820_count as usize,
            regions,
            degraded: false,
        }
    }

    fn degraded() -> BootInfo {
        BootInfo {
            total_memory_mb: (FALLBACK_HEAP_SIZE / (1024 * 1024)) as u32,
            e820_count: 0,
            regions: core::ptr::null(),
            degraded: true,
        }
    }

    /// Iterate the E820 entries (empty in degraded mode).
    pub fn regions(&self) -> impl Iterator<Item = MemoryRegion> + '_ {
        let count = self.e820_count;
        let base = self.regions;
        (0..count).map(move |i| unsafe { core::ptr::read_unaligned(base.add(i)) })
    }
}

/// Pick the heap placement: the largest usable region at or above 1 MiB,
/// with its start rounded up past the kernel image if they overlap.
/// Returns `(base, size)` or `None` when the map has no usable region.
pub fn select_heap_region(regions: &[MemoryRegion]) -> Option<(u64, u64)> {
    let mut best: Option<(u64, u64)> = None;
    for r in regions {
        if r.kind() != RegionKind::Usable {
            continue;
        }
        let mut base = r.base;
        let mut length = r.length;
        if base < 0x10_0000 {
            // Skip the low megabyte entirely; BIOS structures live there.
            let skip = 0x10_0000 - base;
            if length <= skip {
                continue;
            }
            base += skip;
            length -= skip;
        }
        if base < KERNEL_IMAGE_END {
            let skip = KERNEL_IMAGE_END - base;
            if length <= skip {
                continue;
            }
            base += skip;
            length -= skip;
        }
        match best {
            Some((_, best_len)) if best_len >= length => {}
            _ => best = Some((base, length)),
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region(base: u64, length: u64, kind: u32) -> MemoryRegion {
        MemoryRegion {
            base,
            length,
            kind,
            attrs: 0,
        }
    }

    #[test]
    fn picks_largest_usable_region() {
        let map = [
            region(0, 0x9FC00, 1),
            region(0x10_0000, 0x10_0000, 1),
            region(0x100_0000, 0x800_0000, 1),
            region(0xFEC0_0000, 0x1000, 2),
        ];
        let (base, size) = select_heap_region(&map).unwrap();
        assert_eq!(base, 0x100_0000);
        assert_eq!(size, 0x800_0000);
    }

    #[test]
    fn rounds_past_kernel_image() {
        let map = [region(0x10_0000, 0x40_0000, 1)];
        let (base, size) = select_heap_region(&map).unwrap();
        assert_eq!(base, KERNEL_IMAGE_END);
        assert_eq!(size, 0x50_0000 - KERNEL_IMAGE_END);
    }

    #[test]
    fn ignores_reserved_and_low_memory() {
        let map = [
            region(0, 0x9FC00, 1),
            region(0xF0000, 0x10000, 2),
            region(0xFFFF_0000, 0x1_0000, 5),
        ];
        assert!(select_heap_region(&map).is_none());
    }

    #[test]
    fn bad_magic_degrades() {
        let desc = BootDescriptor {
            magic: 0x1234,
            e820_count: 0,
            reserved: 0,
            total_memory_mb: 0,
            secure_base: 0,
            heap_base: 0,
            heap_size: 0,
        };
        let info = unsafe { BootInfo::from_ptr(&desc) };
        assert!(info.degraded);
        let info = unsafe { BootInfo::from_ptr(core::ptr::null()) };
        assert!(info.degraded);
    }
}
