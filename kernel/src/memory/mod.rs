// Memory layout constants and the physical/virtual building blocks the VM
// core is built on.
pub mod paging;
pub mod user_pool;

use x86_64::VirtAddr;

pub const PAGE_SIZE: usize = 4096;

/// Sectors per page on the standard 512-byte-sector block devices.
pub const SECTORS_PER_PAGE: usize = PAGE_SIZE / crate::drivers::block::SECTOR_SIZE;

// User address-space layout
pub const USER_SPACE_START: u64 = 0x0000_0000_0000_1000;
pub const USER_SPACE_END: u64 = 0x0000_7FFF_FFFF_F000;

pub const USER_STACK_TOP: u64 = USER_SPACE_END;
pub const USER_STACK_MAX: u64 = 8 * 1024 * 1024;

/// Rounds an arbitrary user address down to its page base.
pub fn page_round_down(addr: VirtAddr) -> VirtAddr {
    addr.align_down(PAGE_SIZE as u64)
}

pub fn is_page_aligned(addr: VirtAddr) -> bool {
    addr.is_aligned(PAGE_SIZE as u64)
}

pub fn is_user_addr(addr: VirtAddr) -> bool {
    let a = addr.as_u64();
    a >= USER_SPACE_START && a < USER_SPACE_END
}
