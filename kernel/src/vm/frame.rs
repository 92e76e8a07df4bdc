// Global frame table
//
// One entry per allocated user-pool frame, shared by every process. A frame
// and the page descriptor it backs point at each other; ownership moves
// between descriptors only under the table lock, so "is this frame still
// mine?" is a single pointer comparison under the pin.
//
// The pin flag is a per-frame test-and-set. While a frame is pinned it is
// never chosen as a victim and never freed by anyone but the pinner; the
// eviction path and concurrent teardown both rely on that.
use crate::memory::user_pool;
use crate::vm::page::Page;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};
use lazy_static::lazy_static;
use spin::Mutex;
use x86_64::VirtAddr;

pub struct Frame {
    kpage: VirtAddr,
    page: Mutex<Option<Arc<Page>>>,
    pinned: AtomicBool,
}

impl Frame {
    /// Kernel address identifying the physical frame.
    pub fn kpage(&self) -> VirtAddr {
        self.kpage
    }

    /// Atomic test-and-set of the pin flag; true iff this call acquired it.
    pub fn try_pin(&self) -> bool {
        self.pinned
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Acquires the pin, waiting out whoever holds it (an in-flight load or
    /// an eviction mid-transfer).
    pub fn pin(&self) {
        while !self.try_pin() {
            core::hint::spin_loop();
        }
    }

    pub fn unpin(&self) {
        self.pinned.store(false, Ordering::Release);
    }

    pub fn is_pinned(&self) -> bool {
        self.pinned.load(Ordering::Relaxed)
    }

    /// The descriptor this frame currently backs.
    pub fn owner(&self) -> Option<Arc<Page>> {
        self.page.lock().clone()
    }
}

struct FrameTable {
    frames: Vec<Arc<Frame>>,
    // Clock hand: index of the next frame the sweep will look at.
    hand: usize,
}

lazy_static! {
    static ref FRAME_TABLE: Mutex<FrameTable> = Mutex::new(FrameTable {
        frames: Vec::new(),
        hand: 0,
    });
}

pub fn init() {
    let mut table = FRAME_TABLE.lock();
    table.frames.clear();
    table.hand = 0;
    crate::serial_println!("frame: table initialized");
}

/// Returns a frame backing `page`, pinned. Claims a fresh frame from the
/// user pool when one is free; otherwise evicts a victim and hands its
/// frame over. The caller unpins once the page contents are in place and
/// the hardware mapping is installed.
///
/// The table lock is dropped between sweep attempts: a thread holding a pin
/// may itself be waiting for the table lock in frame_free, and must be able
/// to get it.
pub fn frame_alloc(page: &Arc<Page>) -> Arc<Frame> {
    loop {
        let mut table = FRAME_TABLE.lock();

        if let Some(kpage) = user_pool::alloc_page() {
            let frame = Arc::new(Frame {
                kpage,
                page: Mutex::new(Some(page.clone())),
                pinned: AtomicBool::new(true),
            });
            page.set_frame(Some(frame.clone()));
            table.frames.push(frame.clone());
            return frame;
        }

        if let Some(frame) = select_victim(&mut table) {
            evict(&frame, page);
            // Tail append keeps the clock sweeping away from the fresh
            // arrival.
            table.frames.push(frame.clone());
            return frame;
        }

        // Every frame is pinned (or the pool's pages are mid-teardown and
        // not yet back). Let the pinners finish, then sweep again.
        drop(table);
        core::hint::spin_loop();
    }
}

/// Second-chance sweep. Skips pinned frames, gives recently accessed pages
/// another pass (clearing the accessed bit as it goes), and unlinks the
/// first frame that fails both tests. The returned frame is pinned.
///
/// Two full revolutions bound the walk: the first clears accessed bits, the
/// second claims any frame that stayed quiet. None means everything was
/// pinned.
fn select_victim(table: &mut FrameTable) -> Option<Arc<Frame>> {
    let len = table.frames.len();
    for _ in 0..2 * len {
        if table.hand >= table.frames.len() {
            table.hand = 0;
        }
        let frame = table.frames[table.hand].clone();

        if !frame.try_pin() {
            table.hand += 1;
            continue;
        }

        let page = frame.owner().expect("frame in table without an owner");
        if page.was_accessed() {
            frame.unpin();
            table.hand += 1;
            continue;
        }

        table.frames.remove(table.hand);
        return Some(frame);
    }
    None
}

/// Moves `frame` from its current descriptor to `dst`. Table lock held,
/// `frame` pinned and already unlinked from the list, `dst` frameless.
fn evict(frame: &Arc<Frame>, dst: &Arc<Page>) {
    let src = frame.owner().expect("evicting a frame without an owner");

    // Unmap the old owner and spill the contents to swap if they diverged
    // from their backing source.
    src.spill(frame);

    *frame.page.lock() = Some(dst.clone());
    dst.set_frame(Some(frame.clone()));
    src.set_frame(None);
}

/// Unlinks `frame` from the table and severs the descriptor link. The
/// caller must hold the pin. The physical page itself stays allocated:
/// page-directory teardown releases user-pool memory, never the frame
/// table.
pub fn frame_free(frame: Arc<Frame>) {
    debug_assert!(frame.is_pinned(), "frame_free without holding the pin");

    let mut table = FRAME_TABLE.lock();
    if let Some(idx) = table.frames.iter().position(|f| Arc::ptr_eq(f, &frame)) {
        table.frames.remove(idx);
        if idx < table.hand {
            table.hand -= 1;
        }
    }
    *frame.page.lock() = None;
}

pub fn frame_count() -> usize {
    FRAME_TABLE.lock().frames.len()
}

/// Copy of the current table, for diagnostics and the self-tests.
pub fn snapshot() -> Vec<Arc<Frame>> {
    FRAME_TABLE.lock().frames.clone()
}
