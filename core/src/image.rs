//! The application region and the check that something runnable lives in it.
//!
//! An image counts as present when its vector table looks like one a linker
//! would produce: the initial stack pointer is word aligned and points into
//! SRAM (a full descending stack starts at most at the end of RAM), and the
//! reset vector is a Thumb address inside the application region. Erased
//! flash (`0xFFFF_FFFF`) and zeroed flash fail both tests.

use crate::config::{
    FLASH_BASE, LARGEST_FLASH_PAGE_SIZE, RAM_START, SMALLEST_FLASH_PAGE_SIZE, USER_CODE,
};
use crate::hal::FlashController;

/// Most pages a transfer session can track.
pub const MAX_PAGES: usize = 256;

/// Where the device reports its flash size in KiB.
pub const FLASH_SIZE_REGISTER: u32 = 0x1FFF_F7E0;

/// The writable application area, `[start, end)`, split in pages.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FlashRegion {
    start: u32,
    end: u32,
    page_size: u32,
}

impl FlashRegion {
    /// `start` must be page aligned. The region is cut down to
    /// [`MAX_PAGES`] pages.
    pub fn new(start: u32, end: u32, page_size: u32) -> Self {
        debug_assert!(page_size.is_power_of_two());
        debug_assert_eq!(start % page_size, 0);
        let max_end = start + (MAX_PAGES as u32) * page_size;
        FlashRegion {
            start,
            end: end.min(max_end).max(start),
            page_size,
        }
    }

    /// Region above the bootloader for a device with `flash_kib` KiB of
    /// flash. Parts larger than 128 KiB use 2 KiB pages.
    pub fn for_flash_size(flash_kib: u16) -> Self {
        let page_size = if flash_kib > 128 {
            LARGEST_FLASH_PAGE_SIZE
        } else {
            SMALLEST_FLASH_PAGE_SIZE
        };
        let end = FLASH_BASE + u32::from(flash_kib) * 1024;
        FlashRegion::new(USER_CODE, end, page_size)
    }

    pub fn start(&self) -> u32 {
        self.start
    }

    pub fn end(&self) -> u32 {
        self.end
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    pub fn page_count(&self) -> usize {
        ((self.end - self.start) / self.page_size) as usize
    }

    /// Whether `[address, address + len)` lies inside the region.
    pub fn contains(&self, address: u32, len: usize) -> bool {
        let len = len as u64;
        let address = u64::from(address);
        address >= u64::from(self.start) && address + len <= u64::from(self.end)
    }

    /// Index of the page holding `address`, counted from `start`.
    pub fn page_index(&self, address: u32) -> usize {
        ((address - self.start) / self.page_size) as usize
    }

    pub fn page_base(&self, index: usize) -> u32 {
        self.start + index as u32 * self.page_size
    }
}

/// The first two words of an image.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct VectorTable {
    pub stack_pointer: u32,
    pub reset_vector: u32,
}

impl VectorTable {
    pub fn read<F: FlashController + ?Sized>(flash: &F, region: &FlashRegion) -> Self {
        VectorTable {
            stack_pointer: flash.read_word(region.start()),
            reset_vector: flash.read_word(region.start() + 4),
        }
    }

    pub fn is_valid(&self, region: &FlashRegion, ram_size: u32) -> bool {
        let sp = self.stack_pointer;
        let sp_ok = sp % 4 == 0 && sp > RAM_START && sp - RAM_START <= ram_size;

        let pc = self.reset_vector;
        let pc_ok = pc & 1 == 1 && region.contains(pc & !1, 2);

        sp_ok && pc_ok
    }
}

/// Whether a runnable application sits at the start of `region`.
pub fn image_is_valid<F: FlashController + ?Sized>(
    flash: &F,
    region: &FlashRegion,
    ram_size: u32,
) -> bool {
    VectorTable::read(flash, region).is_valid(region, ram_size)
}
