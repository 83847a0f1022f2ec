//! Contiguous allocations shared through a reference-counted container.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::io;
use std::sync::Arc;

/// Cache-line alignment for generic slabs.
const ALIGNMENT_BYTES: usize = 64;

/// Storage keeps an allocation alive for as long as any view references it.
trait Storage: Send + Sync {}

/// A contiguous memory region with shared ownership of its backing storage.
///
/// The region is described by a raw `address` and `length`; clones are cheap
/// and the storage is released when the last clone drops. A circular buffer
/// additionally carries an *alias*: the same physical bytes mapped again at
/// `address + length`, so a view that straddles the end of the region reads
/// contiguous memory without wrap-around arithmetic.
#[derive(Clone)]
pub struct SharedBuffer {
    address: usize,
    length: usize,
    /// Offset from an address in the first mapping to the same byte in the
    /// second mapping; zero when the buffer is not double-mapped.
    alias_offset: usize,
    container: Arc<dyn Storage>,
}

impl SharedBuffer {
    /// Allocates a zeroed, cache-line-aligned buffer on the heap.
    pub fn alloc(length: usize) -> io::Result<SharedBuffer> {
        let container = GenericStorage::new(length)?;
        let address = container.address;
        Ok(SharedBuffer {
            address,
            length,
            alias_offset: 0,
            container: Arc::new(container),
        })
    }

    /// Allocates a circular buffer: one region of physical memory mapped
    /// twice at consecutive virtual addresses. The length is rounded up to
    /// the page size.
    #[cfg(unix)]
    pub fn alloc_circular(length: usize) -> io::Result<SharedBuffer> {
        let container = CircularStorage::new(length)?;
        let address = container.address;
        let length = container.length;
        Ok(SharedBuffer {
            address,
            length,
            alias_offset: length,
            container: Arc::new(container),
        })
    }

    /// Start address of the region.
    pub fn address(&self) -> usize {
        self.address
    }

    /// Length of the region in bytes.
    pub fn length(&self) -> usize {
        self.length
    }

    /// One past the last byte of the region.
    pub fn end(&self) -> usize {
        self.address + self.length
    }

    /// The address of this region within the second mapping, when the
    /// storage is double-mapped. For a whole circular buffer this equals
    /// `address + length`.
    pub fn alias(&self) -> Option<usize> {
        if self.alias_offset == 0 {
            None
        } else {
            Some(self.address + self.alias_offset)
        }
    }

    /// A sub-region sharing this buffer's storage (and alias mapping).
    ///
    /// Panics if the window exceeds the region.
    pub fn window(&self, offset: usize, length: usize) -> SharedBuffer {
        assert!(offset + length <= self.length);
        SharedBuffer {
            address: self.address + offset,
            length,
            alias_offset: self.alias_offset,
            container: Arc::clone(&self.container),
        }
    }

    /// True when both views share the same backing storage.
    pub fn same_storage(&self, other: &SharedBuffer) -> bool {
        Arc::ptr_eq(&self.container, &other.container)
    }
}

impl std::fmt::Debug for SharedBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedBuffer")
            .field("address", &format_args!("{:#x}", self.address))
            .field("length", &self.length)
            .field("alias", &self.alias())
            .finish()
    }
}

/// Heap storage aligned to the platform cache line.
struct GenericStorage {
    address: usize,
    layout: Layout,
}

impl GenericStorage {
    fn new(length: usize) -> io::Result<GenericStorage> {
        let layout = Layout::from_size_align(length.max(1), ALIGNMENT_BYTES)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let ptr = unsafe { alloc_zeroed(layout) };
        if ptr.is_null() {
            return Err(io::Error::new(io::ErrorKind::OutOfMemory, "buffer allocation failed"));
        }
        Ok(GenericStorage { address: ptr as usize, layout })
    }
}

impl Storage for GenericStorage {}

unsafe impl Send for GenericStorage {}
unsafe impl Sync for GenericStorage {}

impl Drop for GenericStorage {
    fn drop(&mut self) {
        unsafe { dealloc(self.address as *mut u8, self.layout) };
    }
}

/// Double-mapped storage for circular buffers.
///
/// The mechanism: back the bytes with an unlinked temporary file, reserve a
/// `2 * length` span of virtual addresses, then map the file twice over the
/// reservation with `MAP_FIXED`. Reads and writes within `[address,
/// address + 2 * length)` observe the same physical bytes modulo `length`.
#[cfg(unix)]
struct CircularStorage {
    address: usize,
    length: usize,
}

#[cfg(unix)]
impl CircularStorage {
    fn new(length: usize) -> io::Result<CircularStorage> {
        let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
        let length = length.div_ceil(page) * page;

        let fd = Self::open_backing_file()?;
        let result = Self::map_twice(fd, length);
        unsafe { libc::close(fd) };
        result.map(|address| CircularStorage { address, length })
    }

    /// An unlinked temp file sized for one copy of the payload.
    fn open_backing_file() -> io::Result<libc::c_int> {
        let mut template: Vec<u8> = std::env::temp_dir()
            .join("sigflow-circ-XXXXXX")
            .into_os_string()
            .into_string()
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "non-utf8 temp dir"))?
            .into_bytes();
        template.push(0);
        let fd = unsafe { libc::mkstemp(template.as_mut_ptr() as *mut libc::c_char) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        unsafe { libc::unlink(template.as_ptr() as *const libc::c_char) };
        Ok(fd)
    }

    fn map_twice(fd: libc::c_int, length: usize) -> io::Result<usize> {
        if unsafe { libc::ftruncate(fd, (length * 2) as libc::off_t) } != 0 {
            return Err(io::Error::last_os_error());
        }

        // Reserve 2x the virtual address space, then overlay both halves
        // with shared file mappings at fixed addresses.
        let reserve = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                length * 2,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if reserve == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        for half in 0..2 {
            let target = (reserve as usize + half * length) as *mut libc::c_void;
            let mapped = unsafe {
                libc::mmap(
                    target,
                    length,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_SHARED | libc::MAP_FIXED,
                    fd,
                    0,
                )
            };
            if mapped == libc::MAP_FAILED {
                let err = io::Error::last_os_error();
                unsafe { libc::munmap(reserve, length * 2) };
                return Err(err);
            }
        }

        Ok(reserve as usize)
    }
}

#[cfg(unix)]
impl Storage for CircularStorage {}

#[cfg(unix)]
unsafe impl Send for CircularStorage {}
#[cfg(unix)]
unsafe impl Sync for CircularStorage {}

#[cfg(unix)]
impl Drop for CircularStorage {
    fn drop(&mut self) {
        unsafe { libc::munmap(self.address as *mut libc::c_void, self.length * 2) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generic_alloc_aligned() {
        let buff = SharedBuffer::alloc(4096).unwrap();
        assert_eq!(buff.address() % ALIGNMENT_BYTES, 0);
        assert_eq!(buff.length(), 4096);
        assert!(buff.alias().is_none());
    }

    #[test]
    fn windows_share_storage() {
        let buff = SharedBuffer::alloc(256).unwrap();
        let win = buff.window(64, 64);
        assert_eq!(win.address(), buff.address() + 64);
        assert!(win.same_storage(&buff));
    }

    #[cfg(unix)]
    #[test]
    fn circular_mirrors_writes() {
        let buff = SharedBuffer::alloc_circular(4096).unwrap();
        let len = buff.length();
        assert_eq!(buff.alias(), Some(buff.address() + len));

        // A write into the first mapping is visible through the second.
        unsafe {
            let first = buff.address() as *mut u8;
            let second = (buff.address() + len) as *const u8;
            first.write(0xA5);
            first.add(len - 1).write(0x5A);
            assert_eq!(second.read(), 0xA5);
            assert_eq!(second.add(len - 1).read(), 0x5A);
        }
    }

    #[cfg(unix)]
    #[test]
    fn circular_rounds_to_page() {
        let buff = SharedBuffer::alloc_circular(100).unwrap();
        assert!(buff.length() >= 100);
        assert_eq!(buff.length() % 4096, 0);
    }
}
