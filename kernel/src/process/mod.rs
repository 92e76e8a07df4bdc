// Process control
//
// Only what the VM core needs from a process: the page directory, the
// supplemental page table, the mmap table, an fd table, and the saved user
// stack pointer that the stack-growth heuristic consults. User-memory
// accessors below stand in for the MMU: they walk the page directory,
// maintain ACCESSED/DIRTY, and fault through the VM core on a miss.
use crate::fs::{self, File, FileMode};
use crate::memory::paging::PageDirectory;
use crate::memory::{self, USER_STACK_TOP};
use crate::vm::mmap::{MapId, MmapRegion};
use crate::vm::page::{self, Page, SupplementalPageTable};
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use spin::Mutex;
use x86_64::VirtAddr;

static NEXT_PID: AtomicU32 = AtomicU32::new(1);

// Fds 0 and 1 belong to the console and never enter the table.
const FIRST_USER_FD: i32 = 2;

struct FdTable {
    files: BTreeMap<i32, File>,
    next_fd: i32,
}

struct MmapTable {
    regions: BTreeMap<MapId, MmapRegion>,
    next_id: MapId,
}

pub struct Process {
    pid: u32,
    pagedir: Arc<Mutex<PageDirectory>>,
    spt: Mutex<SupplementalPageTable>,
    files: Mutex<FdTable>,
    mappings: Mutex<MmapTable>,
    // Stand-in for the trap frame's saved %rsp.
    user_rsp: AtomicU64,
}

impl Process {
    pub fn new() -> Arc<Process> {
        Arc::new(Process {
            pid: NEXT_PID.fetch_add(1, Ordering::Relaxed),
            pagedir: Arc::new(Mutex::new(PageDirectory::new())),
            spt: Mutex::new(SupplementalPageTable::new()),
            files: Mutex::new(FdTable {
                files: BTreeMap::new(),
                next_fd: FIRST_USER_FD,
            }),
            mappings: Mutex::new(MmapTable {
                regions: BTreeMap::new(),
                next_id: 1,
            }),
            user_rsp: AtomicU64::new(USER_STACK_TOP),
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn pagedir(&self) -> &Arc<Mutex<PageDirectory>> {
        &self.pagedir
    }

    pub fn set_user_stack_pointer(&self, rsp: VirtAddr) {
        self.user_rsp.store(rsp.as_u64(), Ordering::Relaxed);
    }

    pub fn user_stack_pointer(&self) -> VirtAddr {
        VirtAddr::new(self.user_rsp.load(Ordering::Relaxed))
    }

    // --- file descriptors ---

    /// Opens a named file into the fd table.
    pub fn open_file(&self, name: &str) -> Option<i32> {
        let file = fs::open(name, FileMode::READ | FileMode::WRITE)?;
        let mut table = self.files.lock();
        let fd = table.next_fd;
        table.next_fd += 1;
        table.files.insert(fd, file);
        Some(fd)
    }

    /// Independent handle onto the file behind `fd`; None for console fds
    /// and anything not open.
    pub fn reopen_file(&self, fd: i32) -> Option<File> {
        self.files.lock().files.get(&fd).map(|f| f.reopen())
    }

    pub fn close_file(&self, fd: i32) -> bool {
        self.files.lock().files.remove(&fd).is_some()
    }

    // --- supplemental page table surface ---

    /// Creates a descriptor for `upage` with everything unset; the caller
    /// must pick file/zero backing before the page can fault in. None when
    /// the page already has one.
    pub fn spt_make_entry(&self, upage: VirtAddr) -> Option<Arc<Page>> {
        if !memory::is_page_aligned(upage) || !memory::is_user_addr(upage) {
            return None;
        }
        let page = Page::new(upage, self.pid, self.pagedir.clone());
        if self.spt.lock().insert(page.clone()) {
            Some(page)
        } else {
            None
        }
    }

    pub fn spt_lookup(&self, upage: VirtAddr) -> Option<Arc<Page>> {
        self.spt.lock().lookup(upage)
    }

    /// Removes and tears down the descriptor for `upage`.
    pub fn spt_remove_entry(&self, upage: VirtAddr) {
        let removed = self.spt.lock().remove(upage);
        if let Some(page) = removed {
            page::teardown(&page);
        }
    }

    pub fn spt_len(&self) -> usize {
        self.spt.lock().len()
    }

    // --- mmap bookkeeping (driven by vm::mmap) ---

    pub(crate) fn register_mapping(&self, region: MmapRegion) -> MapId {
        let mut table = self.mappings.lock();
        let id = table.next_id;
        table.next_id += 1;
        table.regions.insert(id, region);
        id
    }

    pub(crate) fn take_mapping(&self, id: MapId) -> Option<MmapRegion> {
        self.mappings.lock().regions.remove(&id)
    }

    pub fn mapping_ids(&self) -> Vec<MapId> {
        self.mappings.lock().regions.keys().copied().collect()
    }

    // --- user memory access ---

    /// Reads one byte of user memory, faulting the page in if needed.
    /// None means the address is unmapped and not fixable: the process
    /// would be killed. Retries like the hardware does: a page evicted
    /// again between the fault service and the access simply faults again.
    pub fn read_byte(&self, addr: VirtAddr) -> Option<u8> {
        if !memory::is_user_addr(addr) {
            return None;
        }
        let upage = memory::page_round_down(addr);
        loop {
            {
                let mut pagedir = self.pagedir.lock();
                if let Some(kpage) = pagedir.get(upage) {
                    pagedir.mark_access(upage, false);
                    let ptr = (kpage.as_u64() + (addr - upage)) as *const u8;
                    return Some(unsafe { ptr.read_volatile() });
                }
            }
            if !page::handle_fault(self, addr) {
                return None;
            }
        }
    }

    /// Writes one byte of user memory. False on unmapped-and-unfixable
    /// addresses and on writes through read-only mappings.
    pub fn write_byte(&self, addr: VirtAddr, value: u8) -> bool {
        if !memory::is_user_addr(addr) {
            return false;
        }
        let upage = memory::page_round_down(addr);
        loop {
            {
                let mut pagedir = self.pagedir.lock();
                if let Some(kpage) = pagedir.get(upage) {
                    if !pagedir.is_writable(upage) {
                        return false;
                    }
                    pagedir.mark_access(upage, true);
                    let ptr = (kpage.as_u64() + (addr - upage)) as *mut u8;
                    unsafe { ptr.write_volatile(value) };
                    return true;
                }
            }
            if !page::handle_fault(self, addr) {
                return false;
            }
        }
    }

    pub fn read_bytes(&self, addr: VirtAddr, buf: &mut [u8]) -> bool {
        for (i, b) in buf.iter_mut().enumerate() {
            match self.read_byte(addr + i as u64) {
                Some(v) => *b = v,
                None => return false,
            }
        }
        true
    }

    pub fn write_bytes(&self, addr: VirtAddr, buf: &[u8]) -> bool {
        for (i, b) in buf.iter().enumerate() {
            if !self.write_byte(addr + i as u64, *b) {
                return false;
            }
        }
        true
    }

    /// Process teardown, in the order the VM core requires: mappings first
    /// (their write-back needs the descriptors), then every descriptor,
    /// then the page directory, which is the one place user-pool memory is
    /// returned.
    pub fn exit(&self, status: i32) {
        crate::vm::mmap::munmap_all(self);

        let pages = self.spt.lock().drain();
        for page in &pages {
            page::teardown(page);
        }

        self.pagedir.lock().destroy();
        crate::serial_println!("process {}: exit({})", self.pid, status);
    }
}
