// User physical pool
//
// Bitmap allocator over the page-aligned region that user-mapped frames are
// drawn from. Exhaustion is not an error here: returning None is the signal
// that makes the frame table run its eviction path.
use crate::memory::PAGE_SIZE;
use alloc::alloc::{alloc_zeroed, dealloc, Layout};
use alloc::vec::Vec;
use lazy_static::lazy_static;
use spin::Mutex;
use x86_64::VirtAddr;

pub struct UserPool {
    base: usize,
    layout: Option<Layout>,
    bitmap: Vec<u64>,
    next_free: usize,
    total_frames: usize,
    free_frames: usize,
}

impl UserPool {
    pub const fn new() -> Self {
        Self {
            base: 0,
            layout: None,
            bitmap: Vec::new(),
            next_free: 0,
            total_frames: 0,
            free_frames: 0,
        }
    }

    /// Carves out a fresh pool of `frame_count` zeroed frames, releasing
    /// any previous backing region first.
    pub fn init(&mut self, frame_count: usize) {
        assert!(frame_count > 0, "user pool needs at least one frame");

        self.release();

        let layout = Layout::from_size_align(frame_count * PAGE_SIZE, PAGE_SIZE)
            .expect("bad user pool layout");
        let base = unsafe { alloc_zeroed(layout) };
        if base.is_null() {
            panic!("cannot back the user pool");
        }

        self.base = base as usize;
        self.layout = Some(layout);
        self.bitmap = Vec::new();
        self.bitmap.resize((frame_count + 63) / 64, 0);
        self.next_free = 0;
        self.total_frames = frame_count;
        self.free_frames = frame_count;
    }

    fn release(&mut self) {
        if let Some(layout) = self.layout.take() {
            unsafe { dealloc(self.base as *mut u8, layout) };
        }
    }

    fn is_frame_free(&self, frame_num: usize) -> bool {
        self.bitmap[frame_num / 64] & (1 << (frame_num % 64)) == 0
    }

    fn mark_frame_used(&mut self, frame_num: usize) {
        self.bitmap[frame_num / 64] |= 1 << (frame_num % 64);
        self.free_frames -= 1;
    }

    fn mark_frame_free(&mut self, frame_num: usize) {
        let mask = 1 << (frame_num % 64);
        assert!(
            self.bitmap[frame_num / 64] & mask != 0,
            "freeing a frame that is not allocated"
        );
        self.bitmap[frame_num / 64] &= !mask;
        self.free_frames += 1;
    }

    pub fn alloc_page(&mut self) -> Option<VirtAddr> {
        if self.free_frames == 0 {
            return None;
        }

        // Next-fit scan with wraparound.
        for frame_num in (self.next_free..self.total_frames).chain(0..self.next_free) {
            if self.is_frame_free(frame_num) {
                self.mark_frame_used(frame_num);
                self.next_free = frame_num + 1;
                let kpage = self.base + frame_num * PAGE_SIZE;
                unsafe { core::ptr::write_bytes(kpage as *mut u8, 0, PAGE_SIZE) };
                return Some(VirtAddr::new(kpage as u64));
            }
        }
        None
    }

    pub fn free_page(&mut self, kpage: VirtAddr) {
        let addr = kpage.as_u64() as usize;
        assert!(
            addr >= self.base && addr < self.base + self.total_frames * PAGE_SIZE,
            "kernel address {:#x} is outside the user pool",
            addr
        );
        assert!(addr % PAGE_SIZE == 0, "freeing an unaligned page");
        self.mark_frame_free((addr - self.base) / PAGE_SIZE);
    }

    pub fn total_frames(&self) -> usize {
        self.total_frames
    }

    pub fn free_frames(&self) -> usize {
        self.free_frames
    }
}

impl Drop for UserPool {
    fn drop(&mut self) {
        self.release();
    }
}

lazy_static! {
    static ref USER_POOL: Mutex<UserPool> = Mutex::new(UserPool::new());
}

pub fn init(frame_count: usize) {
    USER_POOL.lock().init(frame_count);
    crate::serial_println!("user pool: {} frames", frame_count);
}

/// Claims one zeroed frame from the pool; None when the pool is exhausted.
pub fn alloc_page() -> Option<VirtAddr> {
    USER_POOL.lock().alloc_page()
}

pub fn free_page(kpage: VirtAddr) {
    USER_POOL.lock().free_page(kpage);
}

pub fn free_frames() -> usize {
    USER_POOL.lock().free_frames()
}

pub fn total_frames() -> usize {
    USER_POOL.lock().total_frames()
}
