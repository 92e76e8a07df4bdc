// Hosted test support
//
// The frame table, swap allocator and user pool are process-wide
// singletons, so every test that reinitializes them serializes on this
// lock.
use lazy_static::lazy_static;
use spin::{Mutex, MutexGuard};

lazy_static! {
    static ref VM_TEST_LOCK: Mutex<()> = Mutex::new(());
}

pub fn vm_lock() -> MutexGuard<'static, ()> {
    VM_TEST_LOCK.lock()
}

mod vm_tests;
