use std::{
    fs::{File, OpenOptions},
    io,
    os::{fd::AsRawFd, unix::fs::OpenOptionsExt},
    path::Path,
    ptr::{self, NonNull},
};

use libc::{MAP_ANONYMOUS, MAP_FAILED, MAP_NORESERVE, MAP_SHARED, PROT_READ, PROT_WRITE};

/// An `mmap()`ed region that stays mapped for as long as this value lives.
/// Backed either by a regular file (so other processes can map it too) or by
/// anonymous memory.
#[derive(Debug)]
pub struct SharedRegion {
    ptr: NonNull<u8>,
    len: usize,
    writable: bool,
    // Kept open for the lifetime of the mapping, so readers can `lseek()` it
    file: Option<File>,
}

// SAFETY: The region is plain memory. Every type that is placed in it (the
// tracking slots) does its own synchronization.
unsafe impl Send for SharedRegion {}
unsafe impl Sync for SharedRegion {}

impl SharedRegion {
    /// Create (or truncate) the file at `path`, size it to exactly `len`
    /// zero bytes, and map it shared read/write.
    pub fn create_file(path: &Path, len: usize) -> io::Result<Self> {
        if len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "cannot map a zero-length region",
            ));
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o644)
            .open(path)?;
        // Truncating first throws away whatever a previous process with the
        // same pid left behind; the second call extends with a hole of zeroes.
        file.set_len(0)?;
        file.set_len(len as u64)?;
        // SAFETY: `file` is open read/write and is exactly `len` bytes long.
        let ptr = unsafe { map(len, PROT_READ | PROT_WRITE, MAP_SHARED, file.as_raw_fd())? };
        Ok(Self {
            ptr,
            len,
            writable: true,
            file: Some(file),
        })
    }

    /// Map an existing file read-only. Returns `Ok(None)` for an empty file,
    /// since there is nothing to map.
    pub fn open_read_only(path: &Path) -> io::Result<Option<Self>> {
        let file = File::open(path)?;
        let len = usize::try_from(file.metadata()?.len())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "file too large to map"))?;
        if len == 0 {
            return Ok(None);
        }
        // SAFETY: `file` is open for reading and `len` is its current size.
        let ptr = unsafe { map(len, PROT_READ, MAP_SHARED, file.as_raw_fd())? };
        Ok(Some(Self {
            ptr,
            len,
            writable: false,
            file: Some(file),
        }))
    }

    /// Map `len` bytes of zeroed anonymous memory, shared with any children
    /// forked later. Pages are only committed on first write.
    pub fn anonymous(len: usize) -> io::Result<Self> {
        if len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "cannot map a zero-length region",
            ));
        }
        // SAFETY: anonymous mappings need no file descriptor.
        let ptr = unsafe {
            map(
                len,
                PROT_READ | PROT_WRITE,
                MAP_SHARED | MAP_ANONYMOUS | MAP_NORESERVE,
                -1,
            )?
        };
        Ok(Self {
            ptr,
            len,
            writable: true,
            file: None,
        })
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    /// The backing file, if this is not an anonymous mapping
    pub fn file(&self) -> Option<&File> {
        self.file.as_ref()
    }
}

/// # Safety
///
/// `fd` must be `-1` together with `MAP_ANONYMOUS`, or an open descriptor
/// whose file is at least `len` bytes and whose access mode allows `prot`.
unsafe fn map(len: usize, prot: i32, flags: i32, fd: i32) -> io::Result<NonNull<u8>> {
    let ptr = unsafe { libc::mmap(ptr::null_mut(), len, prot, flags, fd, 0) };
    if ptr == MAP_FAILED {
        return Err(io::Error::last_os_error());
    }
    NonNull::new(ptr.cast()).ok_or_else(|| io::Error::other("mmap() returned null"))
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        // SAFETY:
        // - `self.ptr` came from a successful `mmap()` of `self.len` bytes, so
        //   it is page-aligned and the whole range is ours.
        // - Nothing borrowed from the region outlives `self`.
        unsafe {
            libc::munmap(self.ptr.as_ptr().cast(), self.len);
        }
    }
}
