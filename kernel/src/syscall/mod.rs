// System-call surface of the VM core
//
// Only the two VM calls plus exit. Invalid user input maps to -1 with no
// side effects; the heavy lifting lives in vm::mmap.
use crate::process::Process;
use crate::vm::mmap;
use x86_64::VirtAddr;

pub const MAP_FAILED: isize = -1;

/// Maps the file behind `fd` at `addr`; returns the mapping id (>= 1) or
/// -1 for a bad fd, null or misaligned address, empty file, or a range
/// collision.
pub fn sys_mmap(process: &Process, fd: i32, addr: u64) -> isize {
    let addr = match VirtAddr::try_new(addr) {
        Ok(addr) => addr,
        Err(_) => return MAP_FAILED,
    };
    match mmap::mmap(process, fd, addr) {
        Ok(id) => id,
        Err(reason) => {
            crate::serial_println!("mmap: {}", reason);
            MAP_FAILED
        }
    }
}

/// Unmaps a mapping by id; -1 if the id is not a live mapping of this
/// process.
pub fn sys_munmap(process: &Process, id: isize) -> isize {
    match mmap::munmap(process, id) {
        Ok(()) => 0,
        Err(reason) => {
            crate::serial_println!("munmap: {}", reason);
            MAP_FAILED
        }
    }
}

pub fn sys_exit(process: &Process, status: i32) {
    process.exit(status);
}
