//! Shared memory buffers
//!
//! A [`ShmPool`] maps a file descriptor shared with a client into the compositor's
//! address space. [`ShmBuffer`]s describe an image living at some offset inside a pool.
//! Pools are reference counted, buffers keep their pool mapped while alive.

use std::{
    cell::RefCell,
    ffi::c_void,
    os::unix::io::{AsFd, BorrowedFd, OwnedFd},
    ptr,
    rc::Rc,
};

use rustix::{
    fs::{ftruncate, memfd_create, MemfdFlags},
    mm::{mmap, munmap, MapFlags, ProtFlags},
};
use smallvec::SmallVec;

use super::{format, Buffer, Format, Fourcc, Modifier};
use crate::utils::{Buffer as BufferCoords, Size};

/// Errors of shm pool handling
#[derive(Debug, thiserror::Error)]
pub enum ShmError {
    /// The requested pool size is invalid
    #[error("Invalid pool size {0}")]
    InvalidSize(usize),
    /// Creating the backing memory failed
    #[error("Failed to create pool memory")]
    Create(#[source] rustix::io::Errno),
    /// Mapping the pool failed
    #[error("Failed to map pool memory")]
    Map(#[source] rustix::io::Errno),
}

/// Shared read-write mapping of a file descriptor
#[derive(Debug)]
pub(crate) struct MemMap {
    ptr: *mut u8,
    size: usize,
}

impl MemMap {
    pub(crate) fn new(fd: BorrowedFd<'_>, size: usize) -> Result<MemMap, ShmError> {
        if size == 0 {
            return Err(ShmError::InvalidSize(size));
        }
        // SAFETY: a fresh shared mapping, never aliased with rust allocations
        let ptr = unsafe {
            mmap(
                ptr::null_mut(),
                size,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                fd,
                0,
            )
        }
        .map_err(ShmError::Map)?;
        Ok(MemMap {
            ptr: ptr as *mut u8,
            size,
        })
    }

    pub(crate) fn len(&self) -> usize {
        self.size
    }

    pub(crate) fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr is valid for size bytes as long as the mapping lives
        unsafe { std::slice::from_raw_parts(self.ptr, self.size) }
    }

    pub(crate) fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: see as_slice, the RefCell around the map hands out a single mutable borrow
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.size) }
    }
}

impl Drop for MemMap {
    fn drop(&mut self) {
        // SAFETY: ptr and size come from a successful mmap
        let _ = unsafe { munmap(self.ptr as *mut c_void, self.size) };
    }
}

#[derive(Debug)]
struct PoolInner {
    fd: OwnedFd,
    // TODO: handle SIGBUS when a client truncates the pool behind our back
    map: RefCell<MemMap>,
}

/// A mapped shared memory pool
#[derive(Debug, Clone)]
pub struct ShmPool(Rc<PoolInner>);

impl PartialEq for ShmPool {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl ShmPool {
    /// Map `size` bytes of the memory referred to by `fd`
    pub fn new(fd: OwnedFd, size: usize) -> Result<ShmPool, ShmError> {
        let map = MemMap::new(fd.as_fd(), size)?;
        Ok(ShmPool(Rc::new(PoolInner {
            fd,
            map: RefCell::new(map),
        })))
    }

    /// Allocate a new anonymous pool of the given size
    pub fn create(name: &str, size: usize) -> Result<ShmPool, ShmError> {
        let fd = memfd_create(name, MemfdFlags::CLOEXEC).map_err(ShmError::Create)?;
        ftruncate(&fd, size as u64).map_err(ShmError::Create)?;
        ShmPool::new(fd, size)
    }

    /// Size of the mapping in bytes
    pub fn size(&self) -> usize {
        self.0.map.borrow().size
    }

    /// Grow the pool to `size` bytes
    ///
    /// Pools can never shrink.
    pub fn resize(&self, size: usize) -> Result<(), ShmError> {
        let mut map = self.0.map.borrow_mut();
        if size < map.size {
            return Err(ShmError::InvalidSize(size));
        }
        *map = MemMap::new(self.0.fd.as_fd(), size)?;
        Ok(())
    }

    /// Access the content of the pool
    pub fn with_data<T, F: FnOnce(&[u8]) -> T>(&self, f: F) -> T {
        f(self.0.map.borrow().as_slice())
    }

    /// Mutably access the content of the pool
    pub fn with_data_mut<T, F: FnOnce(&mut [u8]) -> T>(&self, f: F) -> T {
        f(self.0.map.borrow_mut().as_mut_slice())
    }
}

impl AsFd for ShmPool {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.fd.as_fd()
    }
}

/// Location of one plane of a [`ShmBuffer`] inside its pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShmPlane {
    /// Offset of the plane in the pool
    pub offset: usize,
    /// Stride of the plane in bytes
    pub stride: usize,
}

/// An image stored in a [`ShmPool`]
#[derive(Debug, Clone)]
pub struct ShmBuffer {
    pool: ShmPool,
    format: Fourcc,
    size: Size<i32, BufferCoords>,
    planes: SmallVec<[ShmPlane; 3]>,
}

impl ShmBuffer {
    /// Describe an image starting at `offset` with the given stride of its first plane
    ///
    /// Further planes of multi-planar formats are assumed to follow the first plane
    /// tightly, with strides derived from the first one.
    pub fn new(
        pool: &ShmPool,
        offset: usize,
        size: impl Into<Size<i32, BufferCoords>>,
        stride: usize,
        format: Fourcc,
    ) -> ShmBuffer {
        let size = size.into();
        let mut planes: SmallVec<[ShmPlane; 3]> = SmallVec::new();
        planes.push(ShmPlane { offset, stride });

        if let Some(info) = format::lookup(format) {
            let pitch = stride / info.cpp(0).max(1) as usize;
            for idx in 1..info.plane_count() {
                let prev = planes[idx - 1];
                let rows = info.plane_height(idx - 1, size.h.max(0) as u32) as usize;
                planes.push(ShmPlane {
                    offset: prev.offset + prev.stride * rows,
                    stride: pitch / info.hsub(idx) as usize * info.cpp(idx) as usize,
                });
            }
        }

        ShmBuffer {
            pool: pool.clone(),
            format,
            size,
            planes,
        }
    }

    /// Describe an image with explicit per-plane offsets and strides
    pub fn with_planes(
        pool: &ShmPool,
        size: impl Into<Size<i32, BufferCoords>>,
        format: Fourcc,
        planes: &[ShmPlane],
    ) -> ShmBuffer {
        ShmBuffer {
            pool: pool.clone(),
            format,
            size: size.into(),
            planes: planes.iter().copied().collect(),
        }
    }

    /// The pool this buffer lives in
    pub fn pool(&self) -> &ShmPool {
        &self.pool
    }

    /// Format code of the buffer
    pub fn fourcc(&self) -> Fourcc {
        self.format
    }

    /// Planes of the buffer
    pub fn planes(&self) -> &[ShmPlane] {
        &self.planes
    }

    /// Returns true if `other` has the same format, size and plane strides
    pub fn same_layout(&self, other: &ShmBuffer) -> bool {
        self.format == other.format
            && self.size == other.size
            && self.planes.len() == other.planes.len()
            && self
                .planes
                .iter()
                .zip(other.planes.iter())
                .all(|(a, b)| a.stride == b.stride)
    }

    /// Access the bytes of one plane
    ///
    /// The slice starts at the plane's offset and is cut off at the end of the pool.
    pub fn with_plane<T, F: FnOnce(&[u8], usize) -> T>(&self, plane: usize, f: F) -> Option<T> {
        let p = *self.planes.get(plane)?;
        self.pool.with_data(|data| data.get(p.offset..).map(|bytes| f(bytes, p.stride)))
    }

    /// Mutably access the bytes of one plane
    pub fn with_plane_mut<T, F: FnOnce(&mut [u8], usize) -> T>(&self, plane: usize, f: F) -> Option<T> {
        let p = *self.planes.get(plane)?;
        self.pool
            .with_data_mut(|data| data.get_mut(p.offset..).map(|bytes| f(bytes, p.stride)))
    }
}

impl Buffer for ShmBuffer {
    fn size(&self) -> Size<i32, BufferCoords> {
        self.size
    }

    fn format(&self) -> Format {
        Format {
            code: self.format,
            modifier: Modifier::Linear,
        }
    }
}
