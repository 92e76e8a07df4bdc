// VM core scenario tests
//
// End-to-end flows through the fault handler, the frame table and swap:
// lazy loading, dirty eviction round-trips, mmap write-back, range
// collisions, teardown racing eviction, and stack growth. Everything here
// drives the public process/VM surface the way the fault path does.
use crate::fs::{self, FileMode};
use crate::memory::{self, user_pool, PAGE_SIZE, USER_STACK_TOP};
use crate::process::Process;
use crate::syscall;
use crate::tests::vm_lock;
use crate::vm::page::Page;
use crate::vm::swap::{self, NO_SLOT};
use crate::vm::frame;
use alloc::sync::Arc;
use x86_64::VirtAddr;

const BASE: u64 = 0x1000_0000;

fn upage(n: u64) -> VirtAddr {
    VirtAddr::new(BASE + n * PAGE_SIZE as u64)
}

/// Faults fresh zero pages in (read-only touches, so nothing new gets
/// dirtied) until `page` loses its frame to the clock.
fn squeeze_out(process: &Process, page: &Arc<Page>, scratch_start: u64) {
    for i in 0..8 {
        if page.frame().is_none() {
            return;
        }
        let u = upage(scratch_start + i);
        let z = process.spt_make_entry(u).expect("scratch page collision");
        z.init_zero(true);
        assert!(process.read_byte(u).is_some());
    }
    panic!("page was never evicted");
}

#[test]
fn lazy_load_with_zero_tail() {
    let _guard = vm_lock();
    crate::init_vm(8, 16);

    // A 3-page segment: page 0 fully backed, page 1 backed for 100 bytes,
    // page 2 anonymous zero.
    let mut contents = alloc::vec![0u8; PAGE_SIZE + 100];
    for (i, b) in contents.iter_mut().enumerate() {
        *b = ((i * 7 + 3) % 256) as u8;
    }
    fs::create("s1_segment", &contents);
    let file = fs::open("s1_segment", FileMode::READ).unwrap();

    let process = Process::new();
    let p0 = process.spt_make_entry(upage(0)).unwrap();
    p0.init_file(file.reopen(), 0, PAGE_SIZE, 0, false);
    let p1 = process.spt_make_entry(upage(1)).unwrap();
    p1.init_file(file.reopen(), PAGE_SIZE, 100, PAGE_SIZE - 100, true);
    let p2 = process.spt_make_entry(upage(2)).unwrap();
    p2.init_zero(true);

    // First byte past the file-backed prefix of page 1 is zero fill.
    assert_eq!(process.read_byte(upage(1) + 100u64), Some(0));
    assert_eq!(process.read_byte(upage(0)), Some(contents[0]));
    assert_eq!(
        process.read_byte(upage(0) + (PAGE_SIZE as u64 - 1)),
        Some(contents[PAGE_SIZE - 1])
    );
    assert_eq!(process.read_byte(upage(1)), Some(contents[PAGE_SIZE]));
    assert_eq!(process.read_byte(upage(2) + 7u64), Some(0));

    // Nothing here ever needed backing store.
    assert_eq!(swap::used_slots(), 0);

    process.exit(0);
    fs::remove("s1_segment");
}

#[test]
fn dirty_pages_round_trip_through_swap() {
    let _guard = vm_lock();
    crate::init_vm(4, 16);

    let process = Process::new();
    for i in 0..5u64 {
        let page = process.spt_make_entry(upage(i)).unwrap();
        page.init_zero(true);
    }
    for i in 0..5u64 {
        assert!(process.write_byte(upage(i), 0xA0 + i as u8));
    }

    // Five dirty pages, four frames: exactly one page sits in swap.
    assert_eq!(swap::used_slots(), 1);

    for i in 0..5u64 {
        assert_eq!(process.read_byte(upage(i)), Some(0xA0 + i as u8));
    }
    // Every swap-in freed its slot; the one page currently evicted holds
    // the only live slot.
    assert_eq!(swap::used_slots(), 1);

    process.exit(0);
    assert_eq!(swap::used_slots(), 0);
    assert_eq!(frame::frame_count(), 0);
    assert_eq!(user_pool::free_frames(), 4);
}

#[test]
fn mmap_write_back_from_swap_on_munmap() {
    let _guard = vm_lock();
    crate::init_vm(2, 16);

    fs::create("s3_mapped", &alloc::vec![0x11u8; 2 * PAGE_SIZE]);

    let process = Process::new();
    let fd = process.open_file("s3_mapped").unwrap();
    let id = syscall::sys_mmap(&process, fd, BASE);
    assert!(id >= 1);

    // Dirty every byte of page 0 through the mapping.
    for off in 0..PAGE_SIZE {
        assert!(process.write_byte(upage(0) + off as u64, 0xAB));
    }

    // Drive page 0 out to swap; the mapping's dirty data now lives in a
    // slot, not in the file.
    let p0 = process.spt_lookup(upage(0)).unwrap();
    squeeze_out(&process, &p0, 10);
    assert!(p0.frame().is_none());
    assert_ne!(p0.slot(), NO_SLOT);

    let check = fs::open("s3_mapped", FileMode::READ).unwrap();
    let mut byte = [0u8; 1];
    check.read_at(&mut byte, 0);
    assert_eq!(byte[0], 0x11, "eviction must not write to the file");

    assert_eq!(syscall::sys_munmap(&process, id), 0);

    let mut buf = alloc::vec![0u8; 2 * PAGE_SIZE];
    assert_eq!(check.read_at(&mut buf, 0), 2 * PAGE_SIZE);
    assert!(buf[..PAGE_SIZE].iter().all(|&b| b == 0xAB));
    assert!(buf[PAGE_SIZE..].iter().all(|&b| b == 0x11), "untouched page changed");

    process.exit(0);
    fs::remove("s3_mapped");
}

#[test]
fn mmap_write_back_from_resident_frame() {
    let _guard = vm_lock();
    crate::init_vm(4, 16);

    fs::create("s3b_mapped", &alloc::vec![0u8; PAGE_SIZE + 40]);

    let process = Process::new();
    let fd = process.open_file("s3b_mapped").unwrap();
    let id = syscall::sys_mmap(&process, fd, BASE);
    assert!(id >= 1);

    // Page 1 is backed by 40 bytes of file; the zero tail is discarded on
    // write-back.
    assert!(process.write_byte(upage(1) + 5u64, 0xEE));
    assert!(process.write_byte(upage(1) + 39u64, 0xEF));
    assert_eq!(syscall::sys_munmap(&process, id), 0);

    let check = fs::open("s3b_mapped", FileMode::READ).unwrap();
    let mut tail = [0u8; 40];
    assert_eq!(check.read_at(&mut tail, PAGE_SIZE), 40);
    assert_eq!(tail[5], 0xEE);
    assert_eq!(tail[39], 0xEF);
    assert_eq!(check.len(), PAGE_SIZE + 40, "write-back must not grow the file");

    process.exit(0);
    fs::remove("s3b_mapped");
}

#[test]
fn mmap_range_collision_is_rejected_and_undone() {
    let _guard = vm_lock();
    crate::init_vm(8, 16);

    fs::create("s4_first", &alloc::vec![1u8; 4 * PAGE_SIZE]);
    fs::create("s4_second", &alloc::vec![2u8; 3 * PAGE_SIZE]);

    let process = Process::new();
    let fd_a = process.open_file("s4_first").unwrap();
    let fd_b = process.open_file("s4_second").unwrap();

    let id = syscall::sys_mmap(&process, fd_a, BASE);
    assert!(id >= 1);
    assert_eq!(process.spt_len(), 4);

    // Overlaps pages 2..4 of the first mapping: rejected, and no descriptor
    // may survive for the pages past the overlap.
    let r = syscall::sys_mmap(&process, fd_b, BASE + 2 * PAGE_SIZE as u64);
    assert_eq!(r, -1);
    assert!(process.spt_lookup(upage(4)).is_none());
    assert!(process.spt_lookup(upage(5)).is_none());
    assert_eq!(process.spt_len(), 4);

    // Starts one page below the first mapping: its first page goes in, the
    // second collides, and the partial insert is rolled back.
    let r = syscall::sys_mmap(&process, fd_b, BASE - PAGE_SIZE as u64);
    assert_eq!(r, -1);
    assert!(process
        .spt_lookup(VirtAddr::new(BASE - PAGE_SIZE as u64))
        .is_none());
    assert_eq!(process.spt_len(), 4);

    // The original mapping still works.
    assert_eq!(process.read_byte(upage(3)), Some(1));

    process.exit(0);
    fs::remove("s4_first");
    fs::remove("s4_second");
}

#[test]
fn syscall_surface_rejects_invalid_input() {
    let _guard = vm_lock();
    crate::init_vm(4, 16);

    fs::create("s_err_file", &alloc::vec![7u8; 100]);
    fs::create("s_err_empty", &[]);

    let process = Process::new();
    let fd = process.open_file("s_err_file").unwrap();
    let empty_fd = process.open_file("s_err_empty").unwrap();

    assert_eq!(syscall::sys_mmap(&process, fd, 0), -1);
    assert_eq!(syscall::sys_mmap(&process, fd, BASE + 123), -1);
    assert_eq!(syscall::sys_mmap(&process, 0, BASE), -1);
    assert_eq!(syscall::sys_mmap(&process, 99, BASE), -1);
    assert_eq!(syscall::sys_mmap(&process, empty_fd, BASE), -1);
    assert_eq!(syscall::sys_munmap(&process, 1), -1);
    assert_eq!(process.spt_len(), 0);

    // A good call still goes through after all the failures.
    let id = syscall::sys_mmap(&process, fd, BASE);
    assert!(id >= 1);
    assert_eq!(syscall::sys_munmap(&process, id), 0);

    process.exit(0);
    fs::remove("s_err_file");
    fs::remove("s_err_empty");
}

#[test]
fn teardown_races_eviction_without_double_free() {
    let _guard = vm_lock();

    // One user frame makes every second fault an eviction, so the exit on
    // the main thread keeps landing inside the other process's eviction
    // window. The slot and frame accounting must survive every
    // interleaving.
    for round in 0..40 {
        crate::init_vm(1, 8);

        let p1 = Process::new();
        let victim = p1.spt_make_entry(upage(0)).unwrap();
        victim.init_zero(true);
        assert!(p1.write_byte(upage(0), 0x5A));

        let p2 = Process::new();
        let zero = p2.spt_make_entry(upage(1)).unwrap();
        zero.init_zero(true);

        let contender = {
            let p2 = p2.clone();
            std::thread::spawn(move || {
                assert!(p2.write_byte(upage(1), 0x66));
                assert_eq!(p2.read_byte(upage(1)), Some(0x66));
            })
        };

        p1.exit(0);
        contender.join().unwrap();
        p2.exit(0);

        assert_eq!(swap::used_slots(), 0, "slot leaked in round {}", round);
        assert_eq!(frame::frame_count(), 0, "frame leaked in round {}", round);
        assert_eq!(user_pool::free_frames(), 1, "pool page leaked in round {}", round);
    }
}

#[test]
fn stack_growth_within_slack_window() {
    let _guard = vm_lock();
    crate::init_vm(4, 8);

    let process = Process::new();
    let rsp = USER_STACK_TOP - 16;
    process.set_user_stack_pointer(VirtAddr::new(rsp));

    // Eight bytes below the stack pointer: inside the 32-byte window.
    let target = VirtAddr::new(rsp - 8);
    assert!(process.write_byte(target, 0x77));
    assert_eq!(process.read_byte(target), Some(0x77));
    // The rest of the grown page is zero fill.
    assert_eq!(process.read_byte(VirtAddr::new(rsp - 9)), Some(0));

    // Far below the window: the fault is not stack growth, the process is
    // killed, and no descriptor appears.
    let wild = VirtAddr::new(rsp - 4 * PAGE_SIZE as u64);
    assert!(!process.write_byte(wild, 1));
    assert!(process
        .spt_lookup(memory::page_round_down(wild))
        .is_none());

    process.exit(0);
}

#[test]
fn clean_file_pages_reload_from_file_not_swap() {
    let _guard = vm_lock();
    crate::init_vm(2, 8);

    let mut contents = alloc::vec![0u8; PAGE_SIZE];
    for (i, b) in contents.iter_mut().enumerate() {
        *b = ((i * 31 + 5) % 256) as u8;
    }
    fs::create("ro_segment", &contents);
    let file = fs::open("ro_segment", FileMode::READ).unwrap();

    let process = Process::new();
    let page = process.spt_make_entry(upage(0)).unwrap();
    page.init_file(file, 0, PAGE_SIZE, 0, false);

    assert_eq!(process.read_byte(upage(0)), Some(contents[0]));

    // A read-only page is never dirty, so evicting it consumes no slot.
    squeeze_out(&process, &page, 10);
    assert_eq!(page.slot(), NO_SLOT);
    assert_eq!(swap::used_slots(), 0);

    // Faulting it back re-reads the file.
    assert_eq!(
        process.read_byte(upage(0) + 777u64),
        Some(contents[777])
    );
    assert_eq!(swap::used_slots(), 0);

    // And writing through the read-only mapping is refused.
    assert!(!process.write_byte(upage(0), 0xFF));

    process.exit(0);
    fs::remove("ro_segment");
}

#[test]
fn frame_and_descriptor_links_stay_consistent() {
    let _guard = vm_lock();
    crate::init_vm(4, 16);

    let process = Process::new();
    for i in 0..5u64 {
        let page = process.spt_make_entry(upage(i)).unwrap();
        page.init_zero(true);
        assert!(process.write_byte(upage(i), i as u8 + 1));
    }

    // Doubly-linked: every frame's descriptor points back at that frame.
    for frame in frame::snapshot() {
        let owner = frame.owner().expect("frame without an owner");
        let back = owner.frame().expect("resident descriptor without a frame");
        assert!(Arc::ptr_eq(&back, &frame));
        assert_eq!(owner.pid(), process.pid());
    }

    // Slot accounting: the bitmap popcount equals the descriptors that
    // reference a slot.
    let with_slots = (0..5u64)
        .filter(|&i| process.spt_lookup(upage(i)).unwrap().slot() != NO_SLOT)
        .count();
    assert_eq!(with_slots, swap::used_slots());

    process.exit(0);

    // Nothing of this process survives its exit.
    assert_eq!(frame::frame_count(), 0);
    assert_eq!(swap::used_slots(), 0);
    assert_eq!(user_pool::free_frames(), user_pool::total_frames());
}

#[test]
fn forward_progress_under_overcommit() {
    let _guard = vm_lock();
    crate::init_vm(3, 64);

    let process = Process::new();
    for i in 0..4u64 {
        let page = process.spt_make_entry(upage(i)).unwrap();
        page.init_zero(true);
    }

    // Four working-set pages on three frames: every round evicts, and every
    // access must still complete.
    for round in 0..50u64 {
        for i in 0..4u64 {
            assert!(process.write_byte(upage(i), (round + i) as u8));
        }
    }
    for i in 0..4u64 {
        assert_eq!(process.read_byte(upage(i)), Some((49 + i) as u8));
    }

    process.exit(0);
    assert_eq!(swap::used_slots(), 0);
}

#[test]
fn concurrent_faults_from_two_processes_make_progress() {
    let _guard = vm_lock();
    crate::init_vm(3, 64);

    let workers: alloc::vec::Vec<_> = (0u8..2)
        .map(|w| {
            std::thread::spawn(move || {
                let process = Process::new();
                for i in 0..3u64 {
                    let page = process.spt_make_entry(upage(i)).unwrap();
                    page.init_zero(true);
                }
                for round in 0..100u8 {
                    for i in 0..3u64 {
                        let value = round.wrapping_add(w).wrapping_add(i as u8);
                        assert!(process.write_byte(upage(i), value));
                        assert_eq!(process.read_byte(upage(i)), Some(value));
                    }
                }
                process.exit(0);
            })
        })
        .collect();

    for worker in workers {
        worker.join().unwrap();
    }

    assert_eq!(swap::used_slots(), 0);
    assert_eq!(frame::frame_count(), 0);
    assert_eq!(user_pool::free_frames(), 3);
}

#[test]
fn short_file_read_kills_and_releases_the_frame() {
    let _guard = vm_lock();
    crate::init_vm(4, 8);

    // The descriptor claims a full page, the file only has 10 bytes.
    fs::create("short_seg", &[9u8; 10]);
    let file = fs::open("short_seg", FileMode::READ).unwrap();

    let process = Process::new();
    let page = process.spt_make_entry(upage(0)).unwrap();
    page.init_file(file, 0, PAGE_SIZE, 0, false);

    assert_eq!(process.read_byte(upage(0)), None);
    // The aborted load left no trace: no frame, no mapping, full pool.
    assert!(page.frame().is_none());
    assert_eq!(frame::frame_count(), 0);
    assert_eq!(user_pool::free_frames(), 4);

    process.exit(-1);
    fs::remove("short_seg");
}

#[test]
#[should_panic]
fn loading_an_uninitialized_descriptor_is_fatal() {
    let _guard = vm_lock();
    crate::init_vm(4, 8);

    let process = Process::new();
    // Created but never given a backing source.
    process.spt_make_entry(upage(0)).unwrap();
    let _ = process.read_byte(upage(0));
}

#[test]
fn exit_with_live_mappings_writes_back() {
    let _guard = vm_lock();
    crate::init_vm(4, 16);

    fs::create("exit_mapped", &alloc::vec![0u8; PAGE_SIZE]);

    let process = Process::new();
    let fd = process.open_file("exit_mapped").unwrap();
    let id = syscall::sys_mmap(&process, fd, BASE);
    assert!(id >= 1);
    assert!(process.write_byte(upage(0) + 3u64, 0x99));

    // No explicit munmap: exit performs it.
    process.exit(-1);

    let check = fs::open("exit_mapped", FileMode::READ).unwrap();
    let mut buf = [0u8; 8];
    check.read_at(&mut buf, 0);
    assert_eq!(buf[3], 0x99);

    assert_eq!(swap::used_slots(), 0);
    assert_eq!(frame::frame_count(), 0);
    fs::remove("exit_mapped");
}
