use std::sync::OnceLock;

use crate::gc::Address;

#[derive(Copy, Clone, PartialEq, Eq)]
pub enum MemoryPermission {
    None,
    ReadWrite,
}

pub struct Reservation {
    start: Address,
    size: usize,
}

impl Reservation {
    pub fn start(&self) -> Address {
        self.start
    }

    pub fn size(&self) -> usize {
        self.size
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        free(self.start, self.size);
    }
}

pub fn page_size() -> usize {
    static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
    *PAGE_SIZE.get_or_init(determine_page_size)
}

#[cfg(unix)]
fn determine_page_size() -> usize {
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    assert!(size > 0);
    size as usize
}

#[cfg(windows)]
fn determine_page_size() -> usize {
    use std::mem::MaybeUninit;
    use windows_sys::Win32::System::SystemInformation::{GetSystemInfo, SYSTEM_INFO};

    unsafe {
        let mut info: MaybeUninit<SYSTEM_INFO> = MaybeUninit::zeroed();
        GetSystemInfo(info.as_mut_ptr());
        let info = info.assume_init();
        info.dwPageSize as usize
    }
}

/// Reserves `size` bytes of address space without committing it.
#[cfg(unix)]
pub fn reserve(size: usize) -> Reservation {
    debug_assert!(size > 0 && size % page_size() == 0);

    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            size,
            libc::PROT_NONE,
            libc::MAP_PRIVATE | libc::MAP_ANON | libc::MAP_NORESERVE,
            -1,
            0,
        )
    };

    if ptr == libc::MAP_FAILED {
        panic!("could not reserve {} bytes of memory", size);
    }

    Reservation {
        start: Address::from_ptr(ptr),
        size,
    }
}

#[cfg(windows)]
pub fn reserve(size: usize) -> Reservation {
    use windows_sys::Win32::System::Memory::{VirtualAlloc, MEM_RESERVE, PAGE_NOACCESS};

    debug_assert!(size > 0 && size % page_size() == 0);

    let ptr = unsafe { VirtualAlloc(std::ptr::null_mut(), size, MEM_RESERVE, PAGE_NOACCESS) };

    if ptr.is_null() {
        panic!("could not reserve {} bytes of memory", size);
    }

    Reservation {
        start: Address::from_ptr(ptr),
        size,
    }
}

/// Commits memory inside a reservation.
#[cfg(unix)]
pub fn commit_at(start: Address, size: usize, permission: MemoryPermission) {
    debug_assert!(size > 0 && size % page_size() == 0);

    let prot = match permission {
        MemoryPermission::None => libc::PROT_NONE,
        MemoryPermission::ReadWrite => libc::PROT_READ | libc::PROT_WRITE,
    };

    let result = unsafe { libc::mprotect(start.to_mut_ptr(), size, prot) };

    if result != 0 {
        panic!("could not commit memory at {}", start);
    }
}

#[cfg(windows)]
pub fn commit_at(start: Address, size: usize, permission: MemoryPermission) {
    use windows_sys::Win32::System::Memory::{
        VirtualAlloc, MEM_COMMIT, PAGE_NOACCESS, PAGE_READWRITE,
    };

    debug_assert!(size > 0 && size % page_size() == 0);

    let prot = match permission {
        MemoryPermission::None => PAGE_NOACCESS,
        MemoryPermission::ReadWrite => PAGE_READWRITE,
    };

    let ptr = unsafe { VirtualAlloc(start.to_mut_ptr(), size, MEM_COMMIT, prot) };

    if ptr.is_null() {
        panic!("could not commit memory at {}", start);
    }
}

/// Commits a fresh read-write mapping of `size` bytes.
#[cfg(unix)]
pub fn commit(size: usize) -> Address {
    debug_assert!(size > 0 && size % page_size() == 0);

    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANON,
            -1,
            0,
        )
    };

    if ptr == libc::MAP_FAILED {
        panic!("could not allocate {} bytes of memory", size);
    }

    Address::from_ptr(ptr)
}

#[cfg(windows)]
pub fn commit(size: usize) -> Address {
    use windows_sys::Win32::System::Memory::{
        VirtualAlloc, MEM_COMMIT, MEM_RESERVE, PAGE_READWRITE,
    };

    debug_assert!(size > 0 && size % page_size() == 0);

    let ptr = unsafe {
        VirtualAlloc(
            std::ptr::null_mut(),
            size,
            MEM_RESERVE | MEM_COMMIT,
            PAGE_READWRITE,
        )
    };

    if ptr.is_null() {
        panic!("could not allocate {} bytes of memory", size);
    }

    Address::from_ptr(ptr)
}

#[cfg(unix)]
pub fn free(start: Address, size: usize) {
    if start.is_null() {
        return;
    }

    let result = unsafe { libc::munmap(start.to_mut_ptr(), size) };

    if result != 0 {
        panic!("could not free memory at {}", start);
    }
}

#[cfg(windows)]
pub fn free(start: Address, size: usize) {
    use windows_sys::Win32::System::Memory::{VirtualFree, MEM_RELEASE};

    if start.is_null() {
        return;
    }

    let _ = size;
    let result = unsafe { VirtualFree(start.to_mut_ptr(), 0, MEM_RELEASE) };

    if result == 0 {
        panic!("could not free memory at {}", start);
    }
}
