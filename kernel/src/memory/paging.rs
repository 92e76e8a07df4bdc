// Per-process page directory
//
// Software-walked mapping from user page to the kernel address of its
// backing frame, with x86_64 entry flags. The ACCESSED and DIRTY bits are
// maintained on the user-access path the way the MMU would maintain them,
// and the VM core reads and clears them through the accessors below.
use crate::memory::{is_page_aligned, user_pool};
use alloc::collections::BTreeMap;
use x86_64::structures::paging::PageTableFlags;
use x86_64::VirtAddr;

#[derive(Debug, Clone, Copy)]
struct PdEntry {
    kpage: VirtAddr,
    flags: PageTableFlags,
}

pub struct PageDirectory {
    entries: BTreeMap<u64, PdEntry>,
}

impl PageDirectory {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    /// Kernel address backing `upage`, if a mapping is installed.
    pub fn get(&self, upage: VirtAddr) -> Option<VirtAddr> {
        self.entries.get(&upage.as_u64()).map(|e| e.kpage)
    }

    /// Installs `upage -> kpage`. Refuses to overwrite an existing mapping,
    /// mirroring what a double map would mean for the fault path.
    pub fn set(&mut self, upage: VirtAddr, kpage: VirtAddr, writable: bool) -> bool {
        debug_assert!(is_page_aligned(upage));
        if self.entries.contains_key(&upage.as_u64()) {
            return false;
        }

        let mut flags = PageTableFlags::PRESENT | PageTableFlags::USER_ACCESSIBLE;
        if writable {
            flags |= PageTableFlags::WRITABLE;
        }
        self.entries.insert(upage.as_u64(), PdEntry { kpage, flags });
        true
    }

    /// Drops the mapping for `upage`. The backing frame is untouched; only
    /// `destroy` releases physical memory.
    pub fn clear(&mut self, upage: VirtAddr) {
        self.entries.remove(&upage.as_u64());
    }

    pub fn is_writable(&self, upage: VirtAddr) -> bool {
        self.entries
            .get(&upage.as_u64())
            .map(|e| e.flags.contains(PageTableFlags::WRITABLE))
            .unwrap_or(false)
    }

    pub fn is_dirty(&self, upage: VirtAddr) -> bool {
        self.entries
            .get(&upage.as_u64())
            .map(|e| e.flags.contains(PageTableFlags::DIRTY))
            .unwrap_or(false)
    }

    pub fn is_accessed(&self, upage: VirtAddr) -> bool {
        self.entries
            .get(&upage.as_u64())
            .map(|e| e.flags.contains(PageTableFlags::ACCESSED))
            .unwrap_or(false)
    }

    pub fn set_accessed(&mut self, upage: VirtAddr, accessed: bool) {
        if let Some(e) = self.entries.get_mut(&upage.as_u64()) {
            e.flags.set(PageTableFlags::ACCESSED, accessed);
        }
    }

    /// What the MMU does on a user access: set ACCESSED, and DIRTY on a
    /// write.
    pub fn mark_access(&mut self, upage: VirtAddr, write: bool) {
        if let Some(e) = self.entries.get_mut(&upage.as_u64()) {
            e.flags |= PageTableFlags::ACCESSED;
            if write {
                e.flags |= PageTableFlags::DIRTY;
            }
        }
    }

    pub fn mapped_pages(&self) -> usize {
        self.entries.len()
    }

    /// Releases every still-mapped physical frame back to the user pool.
    /// This is the only place user-pool pages are returned; the frame table
    /// never frees them.
    pub fn destroy(&mut self) {
        for (_, entry) in core::mem::take(&mut self.entries) {
            user_pool::free_page(entry.kpage);
        }
    }
}
