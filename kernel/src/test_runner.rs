// Self-test runner
//
// Closure-based tests a kernel build can run at boot, reporting over
// serial. The hosted test suite under src/tests covers the same ground and
// more; these are the smoke tests for running on the machine itself.
use crate::memory::PAGE_SIZE;
use crate::process::Process;
use crate::vm::swap;
use crate::{serial_print, serial_println};
use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;
use x86_64::VirtAddr;

pub struct TestResult {
    pub name: String,
    pub passed: bool,
    pub error: Option<String>,
}

pub struct TestRunner {
    tests: Vec<TestResult>,
}

impl TestRunner {
    pub fn new() -> Self {
        Self { tests: Vec::new() }
    }

    pub fn run_test<F>(&mut self, name: &str, test_fn: F)
    where
        F: FnOnce() -> Result<(), String>,
    {
        serial_print!("Testing {}... ", name);

        match test_fn() {
            Ok(()) => {
                serial_println!("[PASS]");
                self.tests.push(TestResult {
                    name: String::from(name),
                    passed: true,
                    error: None,
                });
            }
            Err(e) => {
                serial_println!("[FAIL]");
                serial_println!("  Error: {}", e);
                self.tests.push(TestResult {
                    name: String::from(name),
                    passed: false,
                    error: Some(e),
                });
            }
        }
    }

    pub fn all_passed(&self) -> bool {
        self.tests.iter().all(|t| t.passed)
    }

    pub fn summary(&self) {
        let total = self.tests.len();
        let passed = self.tests.iter().filter(|t| t.passed).count();
        let failed = total - passed;

        serial_println!("\n===== VM Self-Test Summary =====");
        serial_println!("Total:  {}", total);
        serial_println!("Passed: {}", passed);
        serial_println!("Failed: {}", failed);

        if failed > 0 {
            serial_println!("\nFailed tests:");
            for test in &self.tests {
                if !test.passed {
                    serial_println!("  - {}", test.name);
                    if let Some(ref error) = test.error {
                        serial_println!("    {}", error);
                    }
                }
            }
        }
    }
}

/// Boot-time smoke tests for the VM core. Reinitializes the subsystems, so
/// run it before any real process exists.
pub fn run_vm_selftests() {
    serial_println!("\nStarting VM self-tests...\n");

    let mut runner = TestRunner::new();

    runner.run_test("vm::zero_fill_round_trip", || {
        crate::init_vm(4, 16);
        let base = VirtAddr::new(0x1000_0000);
        let process = Process::new();

        for i in 0..5u64 {
            let upage = base + i * PAGE_SIZE as u64;
            let page = process
                .spt_make_entry(upage)
                .ok_or_else(|| String::from("descriptor creation failed"))?;
            page.init_zero(true);
            if !process.write_byte(upage, 0x40 + i as u8) {
                return Err(format!("write to page {} failed", i));
            }
        }
        for i in 0..5u64 {
            let upage = base + i * PAGE_SIZE as u64;
            let got = process.read_byte(upage);
            if got != Some(0x40 + i as u8) {
                return Err(format!("page {}: expected {:#x}, got {:?}", i, 0x40 + i, got));
            }
        }

        process.exit(0);
        if swap::used_slots() != 0 {
            return Err(format!("{} swap slots leaked", swap::used_slots()));
        }
        Ok(())
    });

    runner.run_test("vm::file_backed_load", || {
        crate::init_vm(4, 16);
        let mut contents = Vec::new();
        for i in 0..PAGE_SIZE {
            contents.push((i * 13 % 251) as u8);
        }
        crate::fs::create("selftest_seg", &contents);
        let file = crate::fs::open("selftest_seg", crate::fs::FileMode::READ)
            .ok_or_else(|| String::from("segment file missing"))?;

        let base = VirtAddr::new(0x2000_0000);
        let process = Process::new();
        let page = process
            .spt_make_entry(base)
            .ok_or_else(|| String::from("descriptor creation failed"))?;
        page.init_file(file, 0, PAGE_SIZE, 0, false);

        for probe in [0usize, 1, 511, PAGE_SIZE - 1] {
            let got = process.read_byte(base + probe as u64);
            if got != Some(contents[probe]) {
                return Err(format!("offset {}: expected {:#x}, got {:?}", probe, contents[probe], got));
            }
        }

        process.exit(0);
        crate::fs::remove("selftest_seg");
        Ok(())
    });

    runner.run_test("vm::mmap_write_back", || {
        crate::init_vm(4, 16);
        crate::fs::create("selftest_mapped", &alloc::vec![0u8; PAGE_SIZE]);

        let process = Process::new();
        let fd = process
            .open_file("selftest_mapped")
            .ok_or_else(|| String::from("open failed"))?;
        let base = 0x3000_0000u64;
        let id = crate::syscall::sys_mmap(&process, fd, base);
        if id < 1 {
            return Err(format!("mmap returned {}", id));
        }
        if !process.write_byte(VirtAddr::new(base + 9), 0xCD) {
            return Err(String::from("write through mapping failed"));
        }
        if crate::syscall::sys_munmap(&process, id) != 0 {
            return Err(String::from("munmap failed"));
        }

        let check = crate::fs::open("selftest_mapped", crate::fs::FileMode::READ)
            .ok_or_else(|| String::from("mapped file missing"))?;
        let mut buf = [0u8; 16];
        check.read_at(&mut buf, 0);
        if buf[9] != 0xCD {
            return Err(format!("write-back lost: byte 9 is {:#x}", buf[9]));
        }

        process.exit(0);
        crate::fs::remove("selftest_mapped");
        Ok(())
    });

    runner.summary();
}
