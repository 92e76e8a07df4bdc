// Virtual Memory Core for a small teaching kernel
//
// Demand paging, lazy executable segments, zero-fill pages, memory-mapped
// files with write-back, and clock eviction with swap spill. The scheduler,
// user-program loader and real device drivers live elsewhere; this crate
// carries the subsystems the VM core needs to be exercised end to end.
#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod serial;
pub mod allocator;
pub mod memory;
pub mod drivers;
pub mod fs;
pub mod vm;
pub mod process;
pub mod syscall;

#[cfg(test)]
mod tests;
pub mod test_runner;

use crate::drivers::block::{self, BlockRole, RamDisk};
use crate::memory::SECTORS_PER_PAGE;

use alloc::sync::Arc;

/// Brings up the memory subsystems in dependency order: user pool first,
/// then the swap device and its slot allocator, then the frame table.
///
/// `user_frames` sizes the user physical pool; `swap_pages` sizes the
/// RAM-backed swap device. Calling this again tears the previous state down
/// and starts fresh, which the self-tests rely on.
pub fn init_vm(user_frames: usize, swap_pages: usize) {
    memory::user_pool::init(user_frames);
    block::register(
        BlockRole::Swap,
        Arc::new(RamDisk::new(swap_pages as u64 * SECTORS_PER_PAGE as u64)),
    );
    vm::swap::init();
    vm::frame::init();
    crate::serial_println!(
        "vm: core up, {} user frames, {} swap pages",
        user_frames,
        swap_pages
    );
}
