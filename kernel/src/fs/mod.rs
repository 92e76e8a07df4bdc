// File layer
//
// An in-memory inode store with positionless handles. The VM core needs
// read_at/write_at/len/reopen: lazy segment loads read through a handle,
// mmap clones one per mapping so closing the user-visible descriptor never
// disturbs the mapping, and munmap writes dirty pages back. Each inode's
// lock is the file-system lock; it is a leaf with respect to every VM lock.
use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use lazy_static::lazy_static;
use spin::Mutex;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy)]
    pub struct FileMode: u32 {
        const READ = 0x1;
        const WRITE = 0x2;
        const CREATE = 0x8;
    }
}

struct Inode {
    data: Vec<u8>,
}

/// An open handle. `reopen` yields an independent handle onto the same
/// inode; dropping a handle closes it.
pub struct File {
    inode: Arc<Mutex<Inode>>,
}

impl File {
    pub fn len(&self) -> usize {
        self.inode.lock().data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reads up to `buf.len()` bytes at `offset`; returns how many were
    /// actually read (short at end of file).
    pub fn read_at(&self, buf: &mut [u8], offset: usize) -> usize {
        let inode = self.inode.lock();
        if offset >= inode.data.len() {
            return 0;
        }
        let n = buf.len().min(inode.data.len() - offset);
        buf[..n].copy_from_slice(&inode.data[offset..offset + n]);
        n
    }

    /// Writes within the existing file extent; returns bytes written.
    /// Never grows the file — page write-back discards the zero tail.
    pub fn write_at(&self, buf: &[u8], offset: usize) -> usize {
        let mut inode = self.inode.lock();
        if offset >= inode.data.len() {
            return 0;
        }
        let n = buf.len().min(inode.data.len() - offset);
        inode.data[offset..offset + n].copy_from_slice(&buf[..n]);
        n
    }

    pub fn reopen(&self) -> File {
        File {
            inode: self.inode.clone(),
        }
    }
}

lazy_static! {
    static ref FILES: Mutex<BTreeMap<String, Arc<Mutex<Inode>>>> = Mutex::new(BTreeMap::new());
}

/// Creates (or truncates) a named file with the given contents and hands
/// back an open handle.
pub fn create(name: &str, contents: &[u8]) -> File {
    let inode = Arc::new(Mutex::new(Inode {
        data: contents.to_vec(),
    }));
    FILES.lock().insert(String::from(name), inode.clone());
    File { inode }
}

pub fn open(name: &str, mode: FileMode) -> Option<File> {
    let mut files = FILES.lock();
    if let Some(inode) = files.get(name) {
        return Some(File {
            inode: inode.clone(),
        });
    }
    if mode.contains(FileMode::CREATE) {
        let inode = Arc::new(Mutex::new(Inode { data: Vec::new() }));
        files.insert(String::from(name), inode.clone());
        return Some(File { inode });
    }
    None
}

pub fn remove(name: &str) -> bool {
    FILES.lock().remove(name).is_some()
}
