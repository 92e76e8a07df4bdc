// Supplemental page table
//
// Per-process descriptors that say how to materialize each user virtual
// page: from a file region, from a swap slot, or zero-filled. The fault
// path allocates a frame, fills it, and installs the hardware mapping; the
// teardown path has to tolerate an eviction moving the frame away at any
// moment, which is what the pin-and-recheck sequence below is for.
use crate::fs::File;
use crate::memory::paging::PageDirectory;
use crate::memory::{self, PAGE_SIZE, USER_STACK_MAX, USER_STACK_TOP};
use crate::process::Process;
use crate::vm::frame::{self, Frame};
use crate::vm::swap::{self, NO_SLOT};
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;
use x86_64::VirtAddr;

/// How far below the saved user stack pointer a faulting address may sit
/// and still count as stack growth (the worst case is an x86 `pusha`
/// writing 32 bytes below %esp).
pub const STACK_SLACK: u64 = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageKind {
    /// Load from a file region, zero the tail.
    File,
    /// Load from a swap slot.
    Swap,
    /// Zero-fill on first touch.
    Zero,
    /// Created but not yet filled in; loading one is a kernel bug.
    Unknown,
}

pub(crate) struct PageState {
    pub kind: PageKind,
    pub writable: bool,
    /// Sticky: once contents diverge from the backing source this stays set
    /// for the descriptor's lifetime. Eviction clears the hardware bit, so
    /// the hardware alone cannot be trusted on the second pass.
    pub dirty: bool,
    pub frame: Option<Arc<Frame>>,
    pub file: Option<File>,
    pub file_ofs: usize,
    pub read_bytes: usize,
    pub zero_bytes: usize,
    pub slot: usize,
}

/// One supplemental page table entry.
pub struct Page {
    upage: VirtAddr,
    pid: u32,
    pagedir: Arc<Mutex<PageDirectory>>,
    state: Mutex<PageState>,
}

impl Page {
    pub(crate) fn new(upage: VirtAddr, pid: u32, pagedir: Arc<Mutex<PageDirectory>>) -> Arc<Page> {
        debug_assert!(memory::is_page_aligned(upage));
        debug_assert!(memory::is_user_addr(upage));
        Arc::new(Page {
            upage,
            pid,
            pagedir,
            state: Mutex::new(PageState {
                kind: PageKind::Unknown,
                writable: false,
                dirty: false,
                frame: None,
                file: None,
                file_ofs: 0,
                read_bytes: 0,
                zero_bytes: 0,
                slot: NO_SLOT,
            }),
        })
    }

    pub fn upage(&self) -> VirtAddr {
        self.upage
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub(crate) fn pagedir(&self) -> &Arc<Mutex<PageDirectory>> {
        &self.pagedir
    }

    pub(crate) fn state(&self) -> &Mutex<PageState> {
        &self.state
    }

    /// Fills in a freshly created descriptor as file-backed.
    pub fn init_file(
        &self,
        file: File,
        file_ofs: usize,
        read_bytes: usize,
        zero_bytes: usize,
        writable: bool,
    ) {
        assert_eq!(read_bytes + zero_bytes, PAGE_SIZE);
        let mut state = self.state.lock();
        debug_assert_eq!(state.kind, PageKind::Unknown);
        state.kind = PageKind::File;
        state.writable = writable;
        state.file = Some(file);
        state.file_ofs = file_ofs;
        state.read_bytes = read_bytes;
        state.zero_bytes = zero_bytes;
    }

    /// Fills in a freshly created descriptor as zero-fill.
    pub fn init_zero(&self, writable: bool) {
        let mut state = self.state.lock();
        debug_assert_eq!(state.kind, PageKind::Unknown);
        state.kind = PageKind::Zero;
        state.writable = writable;
    }

    pub fn kind(&self) -> PageKind {
        self.state.lock().kind
    }

    pub fn is_dirty(&self) -> bool {
        self.state.lock().dirty
    }

    pub fn slot(&self) -> usize {
        self.state.lock().slot
    }

    pub fn frame(&self) -> Option<Arc<Frame>> {
        self.state.lock().frame.clone()
    }

    pub(crate) fn set_frame(&self, frame: Option<Arc<Frame>>) {
        self.state.lock().frame = frame;
    }

    /// Reads and clears the hardware accessed bit. The clock sweep calls
    /// this; clearing is what gives pages their second chance.
    pub fn was_accessed(&self) -> bool {
        let mut pagedir = self.pagedir.lock();
        let accessed = pagedir.is_accessed(self.upage);
        if accessed {
            pagedir.set_accessed(self.upage, false);
        }
        accessed
    }

    /// Eviction-side bookkeeping: tear the hardware mapping out, fold the
    /// hardware dirty bit into the sticky one, and spill to swap when the
    /// contents are the only copy. Called by the frame table with the table
    /// lock held and the frame pinned.
    pub(crate) fn spill(&self, frame: &Frame) {
        let hw_dirty = {
            let mut pagedir = self.pagedir.lock();
            let dirty = pagedir.is_dirty(self.upage);
            pagedir.clear(self.upage);
            dirty
        };

        let mut state = self.state.lock();
        state.dirty |= hw_dirty;
        if state.dirty {
            // Dirty file pages also go to swap; munmap writes them back to
            // the file when the mapping dies.
            state.kind = PageKind::Swap;
            state.slot = swap::swap_out(frame.kpage());
        }
    }
}

/// Per-process map from user page to descriptor.
pub struct SupplementalPageTable {
    pages: BTreeMap<u64, Arc<Page>>,
}

impl SupplementalPageTable {
    pub fn new() -> Self {
        Self {
            pages: BTreeMap::new(),
        }
    }

    /// Rejects duplicates: a user page has exactly one descriptor.
    pub fn insert(&mut self, page: Arc<Page>) -> bool {
        let key = page.upage().as_u64();
        if self.pages.contains_key(&key) {
            return false;
        }
        self.pages.insert(key, page);
        true
    }

    pub fn lookup(&self, upage: VirtAddr) -> Option<Arc<Page>> {
        self.pages.get(&upage.as_u64()).cloned()
    }

    pub fn remove(&mut self, upage: VirtAddr) -> Option<Arc<Page>> {
        self.pages.remove(&upage.as_u64())
    }

    pub fn drain(&mut self) -> Vec<Arc<Page>> {
        core::mem::take(&mut self.pages).into_values().collect()
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }
}

/// Materializes `page` into a frame and installs the mapping. Returns false
/// when the backing source fails (short file read) or the mapping cannot be
/// installed; the fault handler turns that into killing the process.
pub fn load(page: &Arc<Page>) -> bool {
    // No residency check here: a fault can race the eviction that is just
    // taking this page's frame away, and frame_alloc serializes on the
    // table lock either way.
    let frame = frame::frame_alloc(page);
    let kpage = frame.kpage();

    let filled = {
        let mut state = page.state().lock();
        let buf =
            unsafe { core::slice::from_raw_parts_mut(kpage.as_u64() as *mut u8, PAGE_SIZE) };
        match state.kind {
            PageKind::File => {
                let read_bytes = state.read_bytes;
                let zero_bytes = state.zero_bytes;
                let file_ofs = state.file_ofs;
                let file = state.file.as_ref().expect("file-backed page without a handle");
                if file.read_at(&mut buf[..read_bytes], file_ofs) == read_bytes {
                    buf[read_bytes..read_bytes + zero_bytes].fill(0);
                    true
                } else {
                    false
                }
            }
            PageKind::Swap => {
                let slot = state.slot;
                assert!(slot != NO_SLOT, "swap-backed page without a slot");
                swap::swap_in(kpage, slot);
                // NO_SLOT means "allocate a fresh slot on the next
                // eviction"; the sticky dirty bit guarantees that happens.
                state.slot = NO_SLOT;
                true
            }
            PageKind::Zero => {
                buf.fill(0);
                true
            }
            PageKind::Unknown => {
                panic!("loading a page descriptor that was never initialized")
            }
        }
    };
    if !filled {
        return abort_load(page, frame);
    }

    let writable = page.state().lock().writable;
    if !page.pagedir().lock().set(page.upage(), kpage, writable) {
        return abort_load(page, frame);
    }

    frame.unpin();
    true
}

/// Failure path of `load`: the frame was never visible to anyone, so unlink
/// it and hand the physical page straight back to the pool (no page
/// directory ever mapped it, so teardown would not reclaim it).
fn abort_load(page: &Arc<Page>, frame: Arc<Frame>) -> bool {
    page.set_frame(None);
    let kpage = frame.kpage();
    frame::frame_free(frame);
    crate::memory::user_pool::free_page(kpage);
    false
}

/// Tears one descriptor down. The delicate case is a frame mid-eviction:
/// pinning blocks until the transfer finishes, and the re-read decides
/// whether the frame is still ours to free or now belongs to another
/// descriptor.
pub fn teardown(page: &Arc<Page>) {
    if let Some(frame) = page.frame() {
        frame.pin();
        let still_ours = {
            let mut state = page.state().lock();
            let owns = matches!(state.frame, Some(ref f) if Arc::ptr_eq(f, &frame));
            if owns {
                state.frame = None;
            }
            owns
        };
        if still_ours {
            frame::frame_free(frame);
        } else {
            // Eviction moved the frame to another descriptor while we
            // waited on the pin; whatever we owned now lives in our swap
            // slot, which is freed below.
            frame.unpin();
        }
    }

    let slot = {
        let mut state = page.state().lock();
        core::mem::replace(&mut state.slot, NO_SLOT)
    };
    if slot != NO_SLOT {
        swap::swap_free(slot);
    }
}

/// Page-fault entry point. Services the fault through the supplemental page
/// table, growing the stack when the address is within the slack window
/// below the saved user stack pointer. False means the process gets killed.
pub fn handle_fault(process: &Process, fault_addr: VirtAddr) -> bool {
    if !memory::is_user_addr(fault_addr) {
        return false;
    }
    let upage = memory::page_round_down(fault_addr);

    if let Some(page) = process.spt_lookup(upage) {
        return load(&page);
    }

    // No descriptor: eligible for stack growth?
    let addr = fault_addr.as_u64();
    let rsp = process.user_stack_pointer().as_u64();
    let in_stack_region = addr < USER_STACK_TOP && addr >= USER_STACK_TOP - USER_STACK_MAX;
    if in_stack_region && addr + STACK_SLACK >= rsp {
        if let Some(page) = process.spt_make_entry(upage) {
            page.init_zero(true);
            return load(&page);
        }
    }

    false
}
