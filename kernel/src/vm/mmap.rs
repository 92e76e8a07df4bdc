// Memory-mapped files
//
// Each mapping reopens the file so it survives the user closing the
// original descriptor, owns one file-backed page descriptor per page of the
// file, and writes dirty pages back at munmap time. Eviction never writes
// to the file: a dirty mapped page spills to swap like any other, and the
// write-back here pulls it out of the slot if it is not resident.
use crate::fs::File;
use crate::memory::{self, PAGE_SIZE, USER_SPACE_END};
use crate::process::Process;
use crate::vm::frame::{self, Frame};
use crate::vm::page::Page;
use crate::vm::swap::{self, NO_SLOT};
use alloc::sync::Arc;
use alloc::vec::Vec;
use x86_64::VirtAddr;

pub type MapId = isize;

pub struct MmapRegion {
    file: File,
    base: VirtAddr,
    page_count: usize,
}

impl MmapRegion {
    pub fn base(&self) -> VirtAddr {
        self.base
    }

    pub fn page_count(&self) -> usize {
        self.page_count
    }
}

/// Maps the file behind `fd` at `addr`. Every page of the range gets a
/// file-backed descriptor; nothing is read until the process touches it.
pub fn mmap(process: &Process, fd: i32, addr: VirtAddr) -> Result<MapId, &'static str> {
    if addr.as_u64() == 0 {
        return Err("mapping at the null page");
    }
    if !memory::is_page_aligned(addr) {
        return Err("mapping address is not page aligned");
    }
    if !memory::is_user_addr(addr) {
        return Err("mapping address is not a user address");
    }

    // The console fds never reach the table, so this also rejects them.
    let file = process
        .reopen_file(fd)
        .ok_or("mapping a bad file descriptor")?;
    let length = file.len();
    if length == 0 {
        return Err("mapping an empty file");
    }

    let page_count = (length + PAGE_SIZE - 1) / PAGE_SIZE;
    if addr.as_u64() + (page_count * PAGE_SIZE) as u64 > USER_SPACE_END {
        return Err("mapping runs past the end of user space");
    }

    let mut created: Vec<Arc<Page>> = Vec::new();
    for i in 0..page_count {
        let upage = addr + (i * PAGE_SIZE) as u64;
        match process.spt_make_entry(upage) {
            Some(page) => {
                let read_bytes = PAGE_SIZE.min(length - i * PAGE_SIZE);
                page.init_file(
                    file.reopen(),
                    i * PAGE_SIZE,
                    read_bytes,
                    PAGE_SIZE - read_bytes,
                    true,
                );
                created.push(page);
            }
            None => {
                // Collision somewhere in the range: undo every descriptor
                // this call created. None of them has been touched yet.
                for page in created {
                    process.spt_remove_entry(page.upage());
                }
                return Err("mapping collides with an existing page");
            }
        }
    }

    Ok(process.register_mapping(MmapRegion {
        file,
        base: addr,
        page_count,
    }))
}

/// Unmaps mapping `id`: write dirty pages back to the file, tear the
/// descriptors down, close the mapping's handle.
pub fn munmap(process: &Process, id: MapId) -> Result<(), &'static str> {
    let region = process
        .take_mapping(id)
        .ok_or("unmapping an unknown mapping id")?;

    for i in 0..region.page_count {
        let upage = region.base + (i * PAGE_SIZE) as u64;
        if let Some(page) = process.spt_lookup(upage) {
            write_back(&page);
            process.spt_remove_entry(upage);
        }
    }

    // Dropping the region closes the mapping's file handle.
    Ok(())
}

/// Implicit munmap of everything at process exit.
pub fn munmap_all(process: &Process) {
    for id in process.mapping_ids() {
        let _ = munmap(process, id);
    }
}

/// Pushes one mapped page's contents back to its file region if the page
/// was ever dirtied. The page may be resident, evicted to swap, or never
/// touched; only `read_bytes` go back, the zero tail is dropped.
fn write_back(page: &Arc<Page>) {
    // Settle residency first: pinning beats eviction, so after this the
    // frame cannot move under the copy.
    let resident = settle_frame(page);

    let hw_dirty = page.pagedir().lock().is_dirty(page.upage());

    let mut state = page.state().lock();
    state.dirty |= hw_dirty;
    if state.dirty {
        let read_bytes = state.read_bytes;
        let file_ofs = state.file_ofs;
        if let Some(ref frame) = resident {
            let data = unsafe {
                core::slice::from_raw_parts(frame.kpage().as_u64() as *const u8, PAGE_SIZE)
            };
            let file = state.file.as_ref().expect("mapped page without a file");
            file.write_at(&data[..read_bytes], file_ofs);
        } else if state.slot != NO_SLOT {
            let slot = core::mem::replace(&mut state.slot, NO_SLOT);
            let mut buf = alloc::vec![0u8; PAGE_SIZE];
            swap::swap_in(VirtAddr::from_ptr(buf.as_mut_ptr()), slot);
            let file = state.file.as_ref().expect("mapped page without a file");
            file.write_at(&buf[..read_bytes], file_ofs);
        }
    }

    if let Some(frame) = resident {
        state.frame = None;
        drop(state);
        frame::frame_free(frame);
    }
}

/// Pins the page's frame if it is resident and still ours after the pin
/// settles. Returns the pinned frame, or None when the page is not resident
/// (including the case where an eviction won the race).
fn settle_frame(page: &Arc<Page>) -> Option<Arc<Frame>> {
    let frame = page.frame()?;
    frame.pin();
    let still_ours = match page.state().lock().frame {
        Some(ref f) => Arc::ptr_eq(f, &frame),
        None => false,
    };
    if still_ours {
        Some(frame)
    } else {
        frame.unpin();
        None
    }
}
