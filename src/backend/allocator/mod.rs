//! Buffer types and format information.
//!
//! Buffer types supported:
//! - [DmaBufs](dmabuf::Dmabuf)
//! - [Shared memory buffers](shm::ShmBuffer)
//!
//! The [`format`] module holds the static catalog describing every pixel format
//! known to this crate.

pub mod dmabuf;
pub mod format;
pub mod shm;

pub use drm_fourcc::{
    DrmFormat as Format, DrmFourcc as Fourcc, DrmModifier as Modifier, DrmVendor as Vendor,
    UnrecognizedFourcc, UnrecognizedVendor,
};

use crate::utils::{Buffer as BufferCoords, Size};

/// Common trait describing common properties of most types of buffers.
pub trait Buffer {
    /// Width of the two-dimensional buffer
    fn width(&self) -> u32 {
        self.size().w as u32
    }
    /// Height of the two-dimensional buffer
    fn height(&self) -> u32 {
        self.size().h as u32
    }
    /// Size (w x h) of the two-dimensional buffer
    fn size(&self) -> Size<i32, BufferCoords>;
    /// Pixel format of the buffer
    fn format(&self) -> Format;
}
