// Kernel heap
//
// VM metadata (frame table entries, page descriptors, the per-process
// tables) allocates from this heap. Hosted test builds use the platform
// allocator instead.

pub const HEAP_SIZE: usize = 8 * 1024 * 1024;

#[cfg(not(test))]
mod heap {
    use linked_list_allocator::LockedHeap;

    #[global_allocator]
    static ALLOCATOR: LockedHeap = LockedHeap::empty();

    #[repr(align(4096))]
    struct AlignedHeap([u8; super::HEAP_SIZE]);
    static mut HEAP: AlignedHeap = AlignedHeap([0; super::HEAP_SIZE]);

    pub fn init() {
        unsafe {
            let start = core::ptr::addr_of_mut!(HEAP.0) as *mut u8;
            ALLOCATOR.lock().init(start, super::HEAP_SIZE);
        }
        crate::serial_println!("heap: {} KiB ready", super::HEAP_SIZE / 1024);
    }
}

/// Hands the static heap region to the global allocator. Must run before
/// anything allocates; a no-op on hosted builds.
pub fn init_heap() {
    #[cfg(not(test))]
    heap::init();
}
