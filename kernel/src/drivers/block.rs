// Block device interface
//
// Synchronous sector I/O plus a role registry so subsystems can find the
// device assigned to them (the swap allocator binds to BlockRole::Swap at
// init). Devices synchronize internally; callers never lock around I/O.
use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec;
use lazy_static::lazy_static;
use spin::Mutex;

// Standard sector size
pub const SECTOR_SIZE: usize = 512;

pub trait BlockDevice: Send + Sync {
    fn sector_count(&self) -> u64;

    /// Reads one sector into `buf`. `buf` must be exactly SECTOR_SIZE
    /// bytes; a sector past the end of the device is a kernel bug.
    fn read_sector(&self, sector: u64, buf: &mut [u8]);

    fn write_sector(&self, sector: u64, buf: &[u8]);
}

// RAM-backed block device
pub struct RamDisk {
    data: Mutex<Box<[u8]>>,
    sectors: u64,
}

impl RamDisk {
    pub fn new(sectors: u64) -> Self {
        Self {
            data: Mutex::new(vec![0u8; sectors as usize * SECTOR_SIZE].into_boxed_slice()),
            sectors,
        }
    }
}

impl BlockDevice for RamDisk {
    fn sector_count(&self) -> u64 {
        self.sectors
    }

    fn read_sector(&self, sector: u64, buf: &mut [u8]) {
        assert!(sector < self.sectors, "sector {} out of range", sector);
        assert_eq!(buf.len(), SECTOR_SIZE);
        let data = self.data.lock();
        let start = sector as usize * SECTOR_SIZE;
        buf.copy_from_slice(&data[start..start + SECTOR_SIZE]);
    }

    fn write_sector(&self, sector: u64, buf: &[u8]) {
        assert!(sector < self.sectors, "sector {} out of range", sector);
        assert_eq!(buf.len(), SECTOR_SIZE);
        let mut data = self.data.lock();
        let start = sector as usize * SECTOR_SIZE;
        data[start..start + SECTOR_SIZE].copy_from_slice(buf);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum BlockRole {
    Swap,
    FileSys,
}

lazy_static! {
    static ref ROLES: Mutex<BTreeMap<BlockRole, Arc<dyn BlockDevice>>> =
        Mutex::new(BTreeMap::new());
}

/// Assigns `device` to `role`, replacing any previous assignment.
pub fn register(role: BlockRole, device: Arc<dyn BlockDevice>) {
    ROLES.lock().insert(role, device);
}

pub fn get_role(role: BlockRole) -> Option<Arc<dyn BlockDevice>> {
    ROLES.lock().get(&role).cloned()
}
