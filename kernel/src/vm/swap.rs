// Swap-slot allocator
//
// Fixed-size page slots on the block device registered for the swap role.
// The mutex covers only the slot bitmap; the sector I/O runs without it,
// since a claimed slot belongs to the caller until it is freed again.
use crate::drivers::block::{self, BlockDevice, BlockRole, SECTOR_SIZE};
use crate::memory::{PAGE_SIZE, SECTORS_PER_PAGE};
use alloc::sync::Arc;
use alloc::vec::Vec;
use lazy_static::lazy_static;
use spin::Mutex;
use x86_64::VirtAddr;

/// Sentinel for "no swap slot assigned".
pub const NO_SLOT: usize = usize::MAX;

struct SwapAllocator {
    device: Arc<dyn BlockDevice>,
    used: Vec<u64>,
    slots: usize,
    used_count: usize,
}

impl SwapAllocator {
    fn scan_and_flip(&mut self) -> Option<usize> {
        for slot in 0..self.slots {
            let mask = 1 << (slot % 64);
            if self.used[slot / 64] & mask == 0 {
                self.used[slot / 64] |= mask;
                self.used_count += 1;
                return Some(slot);
            }
        }
        None
    }

    fn mark_free(&mut self, slot: usize) {
        assert!(slot < self.slots, "swap slot {} out of range", slot);
        let mask = 1 << (slot % 64);
        assert!(
            self.used[slot / 64] & mask != 0,
            "freeing swap slot {} twice",
            slot
        );
        self.used[slot / 64] &= !mask;
        self.used_count -= 1;
    }
}

lazy_static! {
    static ref SWAP: Mutex<Option<SwapAllocator>> = Mutex::new(None);
}

/// Binds to the swap block device and builds the all-free slot bitmap.
/// Panics when no device carries the swap role: the VM core cannot run
/// without backing store.
pub fn init() {
    let device = block::get_role(BlockRole::Swap).expect("no block device with the swap role");
    let slots = (device.sector_count() / SECTORS_PER_PAGE as u64) as usize;

    let mut used = Vec::new();
    used.resize((slots + 63) / 64, 0);

    *SWAP.lock() = Some(SwapAllocator {
        device,
        used,
        slots,
        used_count: 0,
    });
    crate::serial_println!("swap: {} slots", slots);
}

/// Claims a free slot and writes the page at `kpage` to it, returning the
/// slot index. Out of slots is terminal.
pub fn swap_out(kpage: VirtAddr) -> usize {
    let (device, slot) = {
        let mut swap = SWAP.lock();
        let swap = swap.as_mut().expect("swap not initialized");
        let slot = match swap.scan_and_flip() {
            Some(slot) => slot,
            None => panic!("out of swap slots"),
        };
        (swap.device.clone(), slot)
    };

    let src = kpage.as_u64() as *const u8;
    let sector = (slot * SECTORS_PER_PAGE) as u64;
    for i in 0..SECTORS_PER_PAGE {
        let chunk =
            unsafe { core::slice::from_raw_parts(src.add(i * SECTOR_SIZE), SECTOR_SIZE) };
        device.write_sector(sector + i as u64, chunk);
    }
    slot
}

/// Reads `slot` back into the page at `kpage` and frees the slot.
pub fn swap_in(kpage: VirtAddr, slot: usize) {
    assert!(slot != NO_SLOT);

    let device = {
        let swap = SWAP.lock();
        let swap = swap.as_ref().expect("swap not initialized");
        assert!(slot < swap.slots, "swap slot {} out of range", slot);
        swap.device.clone()
    };

    let dst = kpage.as_u64() as *mut u8;
    let sector = (slot * SECTORS_PER_PAGE) as u64;
    for i in 0..SECTORS_PER_PAGE {
        let chunk =
            unsafe { core::slice::from_raw_parts_mut(dst.add(i * SECTOR_SIZE), SECTOR_SIZE) };
        device.read_sector(sector + i as u64, chunk);
    }

    SWAP.lock().as_mut().unwrap().mark_free(slot);
}

/// Frees `slot` without reading it, for descriptors torn down while their
/// contents still sit in swap.
pub fn swap_free(slot: usize) {
    assert!(slot != NO_SLOT);
    SWAP.lock().as_mut().expect("swap not initialized").mark_free(slot);
}

/// Number of slots currently claimed.
pub fn used_slots() -> usize {
    SWAP.lock().as_ref().map(|s| s.used_count).unwrap_or(0)
}

pub fn total_slots() -> usize {
    SWAP.lock().as_ref().map(|s| s.slots).unwrap_or(0)
}


const _: () = assert!(PAGE_SIZE % SECTOR_SIZE == 0);
