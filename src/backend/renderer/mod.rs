//! Rendering functionality and abstractions
//!
//! Collection of common traits and implementations to import client buffers into
//! textures and to repaint outputs from them.
//!
//! - [`Renderer`] is the device abstraction everything else is written against
//! - [`import`] turns shm and dmabuf client buffers into textures
//! - [`damage`] repaints outputs incrementally from tracked damage
//! - [`sync`] brackets imports and submissions with fences
//! - [`color`] caches device resources of color transformations
//!
//! The `renderer_headless` feature provides [`headless::HeadlessRenderer`], a renderer
//! executing every operation on the cpu.

use std::{error::Error, fmt};

use crate::{
    backend::allocator::{
        dmabuf::{Dmabuf, PlaneRef},
        format::{FormatSet, Swizzle},
        Format, Fourcc,
    },
    utils::{Buffer as BufferCoords, Physical, Point, Rectangle, Size, Transform},
};

pub mod capture;
pub mod color;
pub mod damage;
pub mod import;
pub mod surface;
pub mod sync;

#[cfg(feature = "renderer_headless")]
pub mod headless;

use self::{
    color::{Color32F, GpuColorTransform},
    import::{GpuImage, YuvColorspace},
    sync::{FenceHandle, SyncPoint},
};

/// Texture filtering methods
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TextureFilter {
    /// Returns the value of the texture element that is nearest (in Manhattan distance) to the center of the pixel being textured.
    Nearest,
    /// Returns the weighted average of the four texture elements that are closest to the center of the pixel being textured.
    #[default]
    Linear,
}

bitflags::bitflags! {
    /// Debug flags that can be enabled at runtime
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
    pub struct DebugFlags: u32 {
        /// Tint all repainted regions
        const TINT = 0b00000001;
    }
}

/// Features of a rendering device
///
/// Probed once when the device is created and immutable afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Capabilities {
    pub(crate) buffer_age: bool,
    pub(crate) partial_update: bool,
    pub(crate) float_targets: bool,
    pub(crate) lut_3d: bool,
    pub(crate) native_yuv: bool,
    pub(crate) async_readback: bool,
}

impl Capabilities {
    /// Window surfaces report the age of their back buffers
    pub fn buffer_age(&self) -> bool {
        self.buffer_age
    }

    /// Window surfaces accept damage with their presentation
    pub fn partial_update(&self) -> bool {
        self.partial_update
    }

    /// Half-float framebuffers can be rendered to
    pub fn float_targets(&self) -> bool {
        self.float_targets
    }

    /// 3D lookup tables can be sampled
    pub fn lut_3d(&self) -> bool {
        self.lut_3d
    }

    /// YCbCr dmabufs can be sampled directly as a single external image
    pub fn native_yuv(&self) -> bool {
        self.native_yuv
    }

    /// Pixel read-back completes asynchronously behind a fence
    pub fn async_readback(&self) -> bool {
        self.async_readback
    }
}

/// Error returned by the operations of a [`Renderer`]
pub trait RendererError: Error + Send + Sync + 'static {
    /// The device ran out of memory or another bounded resource
    fn is_resource_exhaustion(&self) -> bool;

    /// The device context got lost and every resource created from it is gone
    fn is_context_lost(&self) -> bool {
        false
    }
}

/// Abstraction of commonly used texture functionality
pub trait Texture {
    /// Size of the texture plane
    fn size(&self) -> Size<i32, BufferCoords>;

    /// Width of the texture plane
    fn width(&self) -> u32 {
        self.size().w as u32
    }

    /// Height of the texture plane
    fn height(&self) -> u32 {
        self.size().h as u32
    }

    /// Format of the texture, if it is known to the renderer
    fn format(&self) -> Option<Fourcc>;
}

/// Abstraction of a drawable target
pub trait Framebuffer {
    /// Size of the framebuffer in pixels
    fn size(&self) -> Size<i32, Physical>;

    /// Format rendered into
    fn format(&self) -> Fourcc;

    /// Rows are stored bottom-up
    fn flipped(&self) -> bool;
}

/// How the planes of an imported buffer are reassembled into rgba
#[allow(non_camel_case_types)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShaderVariant {
    /// Single texture providing rgba
    Rgba,
    /// Single texture providing rgb, alpha is one
    Rgbx,
    /// Three textures, one per component
    Y_U_V,
    /// Luma texture plus a texture with interleaved chroma
    Y_UV,
    /// Luma texture plus a texture providing chroma in its second and fourth channel
    Y_XUXV,
    /// Single texture with luma in the third and chroma in the second and first channel
    Xyuv,
    /// Single externally sampled texture converted by the device
    External,
}

impl ShaderVariant {
    /// Number of textures consumed by the variant
    pub fn planes(&self) -> usize {
        match self {
            ShaderVariant::Rgba | ShaderVariant::Rgbx | ShaderVariant::Xyuv | ShaderVariant::External => 1,
            ShaderVariant::Y_UV | ShaderVariant::Y_XUXV => 2,
            ShaderVariant::Y_U_V => 3,
        }
    }

    /// Returns true if the variant reconstructs color from YCbCr
    pub fn is_yuv(&self) -> bool {
        matches!(
            self,
            ShaderVariant::Y_U_V | ShaderVariant::Y_UV | ShaderVariant::Y_XUXV | ShaderVariant::Xyuv
        )
    }
}

/// A single textured draw of an imported buffer
#[derive(Debug)]
pub struct DrawCall<'a, R: Renderer + ?Sized> {
    /// Planes sampled
    pub planes: &'a [GpuImage<R>],
    /// How to combine the planes
    pub variant: ShaderVariant,
    /// Conversion used by the yuv variants
    pub yuv: YuvColorspace,
    /// Sampled area of the buffer
    pub src: Rectangle<f64, BufferCoords>,
    /// Area of the framebuffer the source is mapped to
    pub dst: Rectangle<i32, Physical>,
    /// Parts of the framebuffer to update, other pixels are left alone
    pub damage: &'a [Rectangle<i32, Physical>],
    /// Transformation applied to the source before placing it into `dst`
    pub transform: Transform,
    /// Buffer rows are stored bottom-up
    pub y_inverted: bool,
    /// Global alpha multiplier
    pub alpha: f32,
    /// Blend over existing content instead of replacing it
    pub blend: bool,
    /// Color transformation applied to every sample
    pub color: &'a GpuColorTransform<R>,
    /// Debug tint mixed into the result
    pub tint: Option<Color32F>,
}

/// Pixels copied out of a framebuffer
#[derive(Debug)]
pub struct ReadPixels {
    /// Pixel data in the requested format, rows as stored in the framebuffer
    pub data: Vec<u8>,
    /// Stride of `data` in bytes
    pub stride: usize,
    /// The data is valid once this point is reached
    pub sync: SyncPoint,
}

/// Abstraction of a rendering device
///
/// Resources returned by a renderer are released once their last handle is dropped.
pub trait Renderer: fmt::Debug {
    /// Error type returned by the rendering operations of this renderer.
    type Error: RendererError;
    /// Texture Handle type used by this renderer.
    type TextureId: Texture + Clone + fmt::Debug + 'static;
    /// Framebuffer handle type used by this renderer.
    type Framebuffer: Framebuffer + Clone + fmt::Debug + 'static;
    /// Lookup table handle type used by this renderer.
    type LutId: Clone + fmt::Debug + 'static;
    /// Imported fence waited on by the device.
    type SyncObject: fmt::Debug;

    /// Unique id of this renderer, used to key per-renderer caches
    fn id(&self) -> usize;

    /// Features of the device
    fn capabilities(&self) -> &Capabilities;

    /// Currently active debug flags
    fn debug_flags(&self) -> DebugFlags;

    /// Set the debug flags to use
    fn set_debug_flags(&mut self, flags: DebugFlags);

    /// Create an empty texture sampled through `swizzle`
    fn create_texture(
        &mut self,
        format: Fourcc,
        size: Size<i32, BufferCoords>,
        swizzle: Swizzle,
    ) -> Result<Self::TextureId, Self::Error>;

    /// Update `region` of a texture from client memory
    ///
    /// `data` starts at the top-left pixel of the texture, rows are `stride` bytes apart.
    fn upload_texture(
        &mut self,
        texture: &Self::TextureId,
        data: &[u8],
        stride: usize,
        region: Rectangle<i32, BufferCoords>,
    ) -> Result<(), Self::Error>;

    /// Formats and modifiers dmabufs may be imported with
    fn dmabuf_formats(&self) -> &FormatSet;

    /// Returns true if `format` can only be imported as an external image
    fn is_external_only(&self, format: &Format) -> bool;

    /// Import a single dmabuf plane as a texture of a narrower format
    fn import_dmabuf_plane(
        &mut self,
        plane: PlaneRef<'_>,
        format: Fourcc,
        size: Size<i32, BufferCoords>,
        swizzle: Swizzle,
    ) -> Result<Self::TextureId, Self::Error>;

    /// Import a whole dmabuf as one externally sampled texture
    fn import_dmabuf_external(&mut self, dmabuf: &Dmabuf) -> Result<Self::TextureId, Self::Error>;

    /// Create a 1D lookup table of `rows` rows with `width` entries each
    fn create_lut_1d(&mut self, width: usize, rows: usize, data: &[f32]) -> Result<Self::LutId, Self::Error>;

    /// Create a 3D lookup table of `dim³` rgb entries
    fn create_lut_3d(&mut self, dim: usize, data: &[f32]) -> Result<Self::LutId, Self::Error>;

    /// Create an offscreen framebuffer
    fn create_framebuffer(
        &mut self,
        size: Size<i32, Physical>,
        format: Fourcc,
        flipped: bool,
    ) -> Result<Self::Framebuffer, Self::Error>;

    /// Use a dmabuf as render target
    fn import_dmabuf_framebuffer(&mut self, dmabuf: &Dmabuf) -> Result<Self::Framebuffer, Self::Error>;

    /// Fill `damage` of the target with a solid color
    fn clear(
        &mut self,
        target: &Self::Framebuffer,
        color: Color32F,
        damage: &[Rectangle<i32, Physical>],
    ) -> Result<(), Self::Error>;

    /// Draw textures into the target
    fn draw(&mut self, target: &Self::Framebuffer, call: &DrawCall<'_, Self>) -> Result<(), Self::Error>;

    /// Copy `damage` of `src` into `dst` at `offset`, applying `color`
    fn blit(
        &mut self,
        src: &Self::Framebuffer,
        dst: &Self::Framebuffer,
        offset: Point<i32, Physical>,
        damage: &[Rectangle<i32, Physical>],
        color: &GpuColorTransform<Self>,
    ) -> Result<(), Self::Error>;

    /// Copy a region of the framebuffer into memory
    fn read_pixels(
        &mut self,
        source: &Self::Framebuffer,
        region: Rectangle<i32, Physical>,
        format: Fourcc,
    ) -> Result<ReadPixels, Self::Error>;

    /// Import a fence into a device wait primitive
    fn import_fence(&mut self, fence: FenceHandle) -> Result<Self::SyncObject, Self::Error>;

    /// Make subsequent device work wait for the fence, releasing the primitive afterwards
    fn queue_wait(&mut self, sync: Self::SyncObject) -> Result<(), Self::Error>;

    /// Flush all pending work and return a point signaled once it finished
    fn submit(&mut self) -> Result<SyncPoint, Self::Error>;
}
