//! Implementation of the rendering traits executing everything on the cpu
//!
//! The [`HeadlessRenderer`] behaves like a gpu renderer as far as the rest of this crate
//! can tell: textures are created per bind plane, dmabuf planes are mapped instead of
//! copied, lookup tables are sampled with the same coordinate conventions a shader would
//! use and every submission produces a fence. Which optional features the "device"
//! offers is controlled through [`HeadlessConfig`], as are a couple of failure modes.
//!
//! ```
//! # extern crate kiln;
//! use kiln::backend::renderer::{headless::{HeadlessConfig, HeadlessRenderer}, Renderer};
//!
//! let renderer = HeadlessRenderer::new(HeadlessConfig {
//!     buffer_age: false,
//!     ..Default::default()
//! });
//! assert!(!renderer.capabilities().buffer_age());
//! assert_eq!(renderer.live_textures(), 0);
//! ```

use std::{
    cell::{Cell, RefCell},
    fmt, io,
    rc::Rc,
    time::{Duration, Instant},
};

use rustix::fs::{fstat, FileType};
use tracing::{debug, info_span, instrument, trace, warn};

use super::{
    color::{Color32F, GpuColorTransform},
    import::{decomposition, BindPlane},
    sync::{FdFence, FenceHandle, SyncError, SyncPoint},
    Capabilities, DebugFlags, DrawCall, Framebuffer, ReadPixels, Renderer, ShaderVariant, Texture,
    TextureFilter,
};
use crate::{
    backend::allocator::{
        dmabuf::{Dmabuf, PlaneRef},
        format::{self, FormatSet, PixelFormatInfo, Swizzle},
        shm::MemMap,
        Buffer, Format, Fourcc, Modifier,
    },
    utils::{ids::id_gen, Buffer as BufferCoords, Physical, Point, Rectangle, Size},
};

mod error;
mod shading;
mod surface;
pub(crate) mod texel;

pub use self::error::HeadlessError;
pub use self::surface::HeadlessSurface;

id_gen!(headless_renderer_id);
id_gen!(headless_framebuffer_id);

/// Features and failure modes of a [`HeadlessRenderer`]
#[derive(Debug, Clone)]
pub struct HeadlessConfig {
    /// Window surfaces report buffer ages, defaults to `true`
    pub buffer_age: bool,
    /// Window surfaces accept damage on presentation, defaults to `true`
    pub partial_update: bool,
    /// Half-float framebuffers are available, defaults to `true`
    pub float_targets: bool,
    /// 3D lookup tables can be created, defaults to `true`
    pub lut_3d: bool,
    /// YCbCr dmabufs are sampled as one external texture, defaults to `false`
    pub native_yuv: bool,
    /// Pixel read-back completes behind a fence, defaults to `false`
    pub async_readback: bool,
    /// Maximum amount of textures and lookup tables alive at once
    pub texture_budget: Option<usize>,
    /// Formats only importable as external textures
    pub external_only: Vec<Fourcc>,
    /// Modifiers advertised for every dmabuf format, defaults to the linear modifier
    pub modifiers: Vec<Modifier>,
    /// Filter used by all textures
    pub filter: TextureFilter,
    /// Fences are left unsignaled until [`HeadlessRenderer::signal_pending_fences`] is called
    pub defer_fences: bool,
    /// Time waited for client fences before giving up
    ///
    /// Waits block the calling thread. The timeout is shared by all waits queued until
    /// the next [`Renderer::submit`], so several stalled clients do not add up.
    pub fence_timeout: Duration,
    /// Importing client fences fails
    pub fail_fence_import: bool,
    /// Amount of presentations of [`HeadlessSurface`]s that fail
    pub present_failures: usize,
}

impl Default for HeadlessConfig {
    fn default() -> Self {
        HeadlessConfig {
            buffer_age: true,
            partial_update: true,
            float_targets: true,
            lut_3d: true,
            native_yuv: false,
            async_readback: false,
            texture_budget: None,
            external_only: Vec::new(),
            modifiers: vec![Modifier::Linear],
            filter: TextureFilter::Linear,
            defer_fences: false,
            fence_timeout: Duration::from_millis(500),
            fail_fence_import: false,
            present_failures: 0,
        }
    }
}

/// Decrements a resource counter once dropped
#[derive(Debug)]
struct Live(Rc<Cell<usize>>);

impl Live {
    fn new(counter: &Rc<Cell<usize>>) -> Live {
        counter.set(counter.get() + 1);
        Live(counter.clone())
    }
}

impl Drop for Live {
    fn drop(&mut self) {
        self.0.set(self.0.get().saturating_sub(1));
    }
}

enum Storage {
    Memory(RefCell<Vec<u8>>),
    Mapped { map: MemMap, offset: usize },
    External {
        planes: Vec<(HeadlessTexture, BindPlane)>,
        variant: ShaderVariant,
    },
}

impl fmt::Debug for Storage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Storage::Memory(data) => f.debug_tuple("Memory").field(&data.borrow().len()).finish(),
            Storage::Mapped { map, offset } => f
                .debug_struct("Mapped")
                .field("len", &map.len())
                .field("offset", offset)
                .finish(),
            Storage::External { planes, variant } => f
                .debug_struct("External")
                .field("planes", &planes.len())
                .field("variant", variant)
                .finish(),
        }
    }
}

#[derive(Debug)]
struct TextureInner {
    renderer: usize,
    info: &'static PixelFormatInfo,
    size: Size<i32, BufferCoords>,
    swizzle: Swizzle,
    filter: TextureFilter,
    stride: usize,
    storage: Storage,
    _live: Live,
}

/// A texture of the [`HeadlessRenderer`]
#[derive(Debug, Clone)]
pub struct HeadlessTexture(Rc<TextureInner>);

impl HeadlessTexture {
    /// Id of the renderer owning the texture
    pub fn renderer_id(&self) -> usize {
        self.0.renderer
    }

    /// Swizzle applied when sampling
    pub fn swizzle(&self) -> Swizzle {
        self.0.swizzle
    }

    /// Returns true if the texture samples a whole multi-planar buffer
    pub fn is_external(&self) -> bool {
        matches!(self.0.storage, Storage::External { .. })
    }

    /// Returns true if the texture reads the memory of a dmabuf directly
    pub fn is_mapped(&self) -> bool {
        matches!(self.0.storage, Storage::Mapped { .. })
    }

    fn filter(&self) -> TextureFilter {
        self.0.filter
    }

    fn external(&self) -> Option<(&[(HeadlessTexture, BindPlane)], ShaderVariant)> {
        match &self.0.storage {
            Storage::External { planes, variant } => Some((planes, *variant)),
            _ => None,
        }
    }

    /// Sampled value of a texel, coordinates are clamped to the edge
    fn texel(&self, x: i32, y: i32) -> [f32; 4] {
        let inner = &*self.0;
        let Some(gl) = inner.info.gl else {
            return [0.0, 0.0, 0.0, 1.0];
        };
        let x = x.clamp(0, (inner.size.w - 1).max(0)) as usize;
        let y = y.clamp(0, (inner.size.h - 1).max(0)) as usize;
        let cpp = inner.info.cpp(0) as usize;
        let fetch = |data: &[u8], base: usize| {
            let at = base + y * inner.stride + x * cpp;
            match data.get(at..at + cpp) {
                Some(bytes) => inner.swizzle.apply(texel::decode(gl, bytes)),
                None => [0.0, 0.0, 0.0, 1.0],
            }
        };
        match &inner.storage {
            Storage::Memory(data) => fetch(&data.borrow(), 0),
            Storage::Mapped { map, offset } => fetch(map.as_slice(), *offset),
            Storage::External { .. } => [0.0, 0.0, 0.0, 1.0],
        }
    }
}

impl Texture for HeadlessTexture {
    fn size(&self) -> Size<i32, BufferCoords> {
        self.0.size
    }

    fn format(&self) -> Option<Fourcc> {
        Some(self.0.info.format)
    }
}

/// Shape of a [`HeadlessLut`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LutKind {
    /// Rows of one dimensional curves
    Curves {
        /// Entries per row
        width: usize,
        /// Amount of rows
        rows: usize,
    },
    /// A cube of rgb entries
    Cube {
        /// Entries per axis
        dim: usize,
    },
}

#[derive(Debug)]
struct LutInner {
    kind: LutKind,
    data: Vec<f32>,
    _live: Live,
}

/// A lookup table of the [`HeadlessRenderer`]
#[derive(Debug, Clone)]
pub struct HeadlessLut(Rc<LutInner>);

impl HeadlessLut {
    /// Shape of the table
    pub fn kind(&self) -> LutKind {
        self.0.kind
    }

    /// Entries of the table
    pub fn data(&self) -> &[f32] {
        &self.0.data
    }
}

#[derive(Debug)]
struct MappedTarget {
    map: RefCell<MemMap>,
    offset: usize,
    stride: usize,
}

#[derive(Debug)]
struct FramebufferInner {
    id: usize,
    renderer: usize,
    size: Size<i32, Physical>,
    info: &'static PixelFormatInfo,
    flipped: bool,
    pixels: RefCell<Vec<[f32; 4]>>,
    target: Option<MappedTarget>,
}

/// A render target of the [`HeadlessRenderer`]
///
/// Pixels are kept as normalized values, rounded to the precision of the framebuffer format
/// on every write.
#[derive(Debug, Clone)]
pub struct HeadlessFramebuffer(Rc<FramebufferInner>);

impl PartialEq for HeadlessFramebuffer {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl HeadlessFramebuffer {
    /// Unique id of the framebuffer
    pub fn id(&self) -> usize {
        self.0.id
    }

    /// Value of the pixel at `(x, y)`, counted from the top-left corner
    pub fn pixel(&self, x: i32, y: i32) -> Option<[f32; 4]> {
        if !Rectangle::from_size(self.0.size).contains((x, y)) {
            return None;
        }
        self.0
            .pixels
            .borrow()
            .get((y * self.0.size.w + x) as usize)
            .copied()
    }

    fn pixels(&self) -> &RefCell<Vec<[f32; 4]>> {
        &self.0.pixels
    }

    fn quantize(&self, value: [f32; 4]) -> [f32; 4] {
        texel::quantize_rgba(self.0.info, value)
    }

    /// Write the pixels back into the memory of an imported dmabuf
    fn flush(&self) {
        let Some(target) = self.0.target.as_ref() else {
            return;
        };
        let info = self.0.info;
        let cpp = info.cpp(0) as usize;
        let width = self.0.size.w as usize;
        let pixels = self.0.pixels.borrow();
        let mut map = target.map.borrow_mut();
        let data = map.as_mut_slice();
        for (y, row) in pixels.chunks(width.max(1)).enumerate() {
            for (x, pixel) in row.iter().enumerate() {
                let at = target.offset + y * target.stride + x * cpp;
                if let Some(texel) = data.get_mut(at..at + cpp) {
                    texel::write_rgba(info, *pixel, texel);
                }
            }
        }
    }
}

impl Framebuffer for HeadlessFramebuffer {
    fn size(&self) -> Size<i32, Physical> {
        self.0.size
    }

    fn format(&self) -> Fourcc {
        self.0.info.format
    }

    fn flipped(&self) -> bool {
        self.0.flipped
    }
}

/// A client fence imported into the [`HeadlessRenderer`]
#[derive(Debug)]
pub struct HeadlessSyncObject {
    fence: FenceHandle,
}

/// A renderer executing all operations on the cpu
#[derive(Debug)]
pub struct HeadlessRenderer {
    id: usize,
    config: HeadlessConfig,
    capabilities: Capabilities,
    debug_flags: DebugFlags,
    dmabuf_formats: FormatSet,

    textures: Rc<Cell<usize>>,
    luts: Rc<Cell<usize>>,
    sampler_updates: usize,
    draw_calls: usize,
    present_failures: Rc<Cell<usize>>,

    dirty: Vec<HeadlessFramebuffer>,
    pending_fences: Vec<FdFence>,
    // deadline of the fence waits of the current submission
    wait_deadline: Option<Instant>,
    span: tracing::Span,
}

fn renderable(format: Fourcc) -> Result<&'static PixelFormatInfo, HeadlessError> {
    match format::lookup(format) {
        Some(info) if info.gl.is_some() && !info.is_yuv && info.plane_count() == 1 => Ok(info),
        _ => Err(HeadlessError::UnsupportedPixelFormat(format)),
    }
}

/// Map the memory behind a dmabuf plane, checking it holds `len` bytes past the plane offset
fn map_plane(plane: &PlaneRef<'_>, len: usize) -> Result<MemMap, HeadlessError> {
    let stat = fstat(plane.fd).map_err(HeadlessError::Stat)?;
    if FileType::from_raw_mode(stat.st_mode as _) != FileType::RegularFile {
        return Err(HeadlessError::MemoryTypeMismatch);
    }
    let actual = stat.st_size.max(0) as usize;
    let expected = plane.offset as usize + len;
    if actual < expected {
        return Err(HeadlessError::IncompleteBuffer { expected, actual });
    }
    Ok(MemMap::new(plane.fd, actual)?)
}

/// Bytes a plane of `size` texels spans with the given stride
fn plane_len(info: &PixelFormatInfo, size: Size<i32, BufferCoords>, stride: usize) -> usize {
    let rows = size.h.max(1) as usize;
    stride * (rows - 1) + info.min_stride(0, size.w.max(0) as u32) as usize
}

impl HeadlessRenderer {
    /// Creates a new headless renderer
    pub fn new(config: HeadlessConfig) -> HeadlessRenderer {
        let span = info_span!("renderer_headless");
        let _guard = span.enter();

        let capabilities = Capabilities {
            buffer_age: config.buffer_age,
            partial_update: config.partial_update,
            float_targets: config.float_targets,
            lut_3d: config.lut_3d,
            native_yuv: config.native_yuv,
            async_readback: config.async_readback,
        };
        let dmabuf_formats = format::all_formats()
            .filter(|info| decomposition(info).is_some())
            .flat_map(|info| {
                config.modifiers.iter().map(move |modifier| Format {
                    code: info.format,
                    modifier: *modifier,
                })
            })
            .collect::<FormatSet>();
        debug!(?capabilities, formats = dmabuf_formats.len(), "headless renderer created");
        drop(_guard);

        HeadlessRenderer {
            id: headless_renderer_id::next(),
            present_failures: Rc::new(Cell::new(config.present_failures)),
            config,
            capabilities,
            debug_flags: DebugFlags::empty(),
            dmabuf_formats,
            textures: Rc::new(Cell::new(0)),
            luts: Rc::new(Cell::new(0)),
            sampler_updates: 0,
            draw_calls: 0,
            dirty: Vec::new(),
            pending_fences: Vec::new(),
            wait_deadline: None,
            span,
        }
    }

    /// The configuration the renderer was created with
    pub fn config(&self) -> &HeadlessConfig {
        &self.config
    }

    /// Amount of textures alive, including the planes of external textures
    pub fn live_textures(&self) -> usize {
        self.textures.get()
    }

    /// Amount of lookup tables alive
    pub fn live_luts(&self) -> usize {
        self.luts.get()
    }

    /// How often texture sampling parameters were set
    ///
    /// Parameters are set once per created texture and never for reused ones.
    pub fn sampler_updates(&self) -> usize {
        self.sampler_updates
    }

    /// Amount of draw calls executed
    pub fn draw_calls(&self) -> usize {
        self.draw_calls
    }

    /// Let the next `count` presentations of [`HeadlessSurface`]s fail
    pub fn fail_presents(&mut self, count: usize) {
        self.present_failures.set(count);
    }

    pub(crate) fn present_failures(&self) -> Rc<Cell<usize>> {
        self.present_failures.clone()
    }

    /// Amount of fences handed out but not yet signaled
    pub fn pending_fences(&self) -> usize {
        self.pending_fences.len()
    }

    /// Signal all fences held back by [`HeadlessConfig::defer_fences`]
    ///
    /// Returns the amount of fences signaled.
    pub fn signal_pending_fences(&mut self) -> usize {
        let fences = std::mem::take(&mut self.pending_fences);
        let count = fences.len();
        for fence in fences {
            if let Err(err) = fence.signal() {
                warn!(?err, "Failed to signal fence");
            }
        }
        count
    }

    fn reserve(&self) -> Result<(), HeadlessError> {
        if let Some(budget) = self.config.texture_budget {
            let live = self.textures.get() + self.luts.get();
            if live >= budget {
                return Err(HeadlessError::OutOfMemory(live));
            }
        }
        Ok(())
    }

    fn check_framebuffer(&self, framebuffer: &HeadlessFramebuffer) -> Result<(), HeadlessError> {
        if framebuffer.0.renderer != self.id {
            return Err(HeadlessError::ForeignResource);
        }
        Ok(())
    }

    fn touch(&mut self, framebuffer: &HeadlessFramebuffer) {
        if framebuffer.0.target.is_some() && !self.dirty.contains(framebuffer) {
            self.dirty.push(framebuffer.clone());
        }
    }

    fn fence(&mut self) -> Result<SyncPoint, HeadlessError> {
        let defer = self.config.defer_fences;
        let fence = FdFence::eventfd(!defer).map_err(HeadlessError::Fence)?;
        if defer {
            let handle = fence.handle().map_err(HeadlessError::Fence)?;
            self.pending_fences.push(FdFence::new(handle.into_fd()));
        }
        Ok(SyncPoint::from(fence))
    }

    fn new_texture(
        &mut self,
        info: &'static PixelFormatInfo,
        size: Size<i32, BufferCoords>,
        swizzle: Swizzle,
        stride: usize,
        storage: Storage,
    ) -> HeadlessTexture {
        self.sampler_updates += 1;
        HeadlessTexture(Rc::new(TextureInner {
            renderer: self.id,
            info,
            size,
            swizzle,
            filter: self.config.filter,
            stride,
            storage,
            _live: Live::new(&self.textures),
        }))
    }

    fn new_framebuffer(
        &self,
        size: Size<i32, Physical>,
        info: &'static PixelFormatInfo,
        flipped: bool,
        pixels: Vec<[f32; 4]>,
        target: Option<MappedTarget>,
    ) -> HeadlessFramebuffer {
        HeadlessFramebuffer(Rc::new(FramebufferInner {
            id: headless_framebuffer_id::next(),
            renderer: self.id,
            size,
            info,
            flipped,
            pixels: RefCell::new(pixels),
            target,
        }))
    }
}

impl Renderer for HeadlessRenderer {
    type Error = HeadlessError;
    type TextureId = HeadlessTexture;
    type Framebuffer = HeadlessFramebuffer;
    type LutId = HeadlessLut;
    type SyncObject = HeadlessSyncObject;

    fn id(&self) -> usize {
        self.id
    }

    fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    fn debug_flags(&self) -> DebugFlags {
        self.debug_flags
    }

    fn set_debug_flags(&mut self, flags: DebugFlags) {
        self.debug_flags = flags;
    }

    #[instrument(level = "trace", parent = &self.span, skip(self))]
    fn create_texture(
        &mut self,
        format: Fourcc,
        size: Size<i32, BufferCoords>,
        swizzle: Swizzle,
    ) -> Result<HeadlessTexture, HeadlessError> {
        let info = renderable(format)?;
        if size.w <= 0 || size.h <= 0 {
            return Err(HeadlessError::OutOfBounds);
        }
        self.reserve()?;
        let stride = info.min_stride(0, size.w as u32) as usize;
        let data = vec![0u8; stride * size.h as usize];
        Ok(self.new_texture(info, size, swizzle, stride, Storage::Memory(RefCell::new(data))))
    }

    #[instrument(level = "trace", parent = &self.span, skip(self, texture, data))]
    fn upload_texture(
        &mut self,
        texture: &HeadlessTexture,
        data: &[u8],
        stride: usize,
        region: Rectangle<i32, BufferCoords>,
    ) -> Result<(), HeadlessError> {
        let inner = &*texture.0;
        if inner.renderer != self.id {
            return Err(HeadlessError::ForeignResource);
        }
        let Storage::Memory(storage) = &inner.storage else {
            return Err(HeadlessError::Unsupported);
        };
        if region.is_empty() {
            return Ok(());
        }
        if !Rectangle::from_size(inner.size).contains_rect(region) {
            return Err(HeadlessError::OutOfBounds);
        }

        let cpp = inner.info.cpp(0) as usize;
        let (x, y) = (region.loc.x as usize, region.loc.y as usize);
        let (w, h) = (region.size.w as usize, region.size.h as usize);
        let expected = (y + h - 1) * stride + (x + w) * cpp;
        if data.len() < expected {
            return Err(HeadlessError::IncompleteBuffer {
                expected,
                actual: data.len(),
            });
        }

        let mut storage = storage.borrow_mut();
        for row in y..y + h {
            let src = row * stride + x * cpp;
            let dst = row * inner.stride + x * cpp;
            storage[dst..dst + w * cpp].copy_from_slice(&data[src..src + w * cpp]);
        }
        Ok(())
    }

    fn dmabuf_formats(&self) -> &FormatSet {
        &self.dmabuf_formats
    }

    fn is_external_only(&self, format: &Format) -> bool {
        self.config.external_only.contains(&format.code)
    }

    #[instrument(level = "trace", parent = &self.span, skip(self))]
    fn import_dmabuf_plane(
        &mut self,
        plane: PlaneRef<'_>,
        format: Fourcc,
        size: Size<i32, BufferCoords>,
        swizzle: Swizzle,
    ) -> Result<HeadlessTexture, HeadlessError> {
        let info = renderable(format)?;
        if size.w <= 0 || size.h <= 0 {
            return Err(HeadlessError::OutOfBounds);
        }
        self.reserve()?;
        let stride = plane.stride as usize;
        let map = map_plane(&plane, plane_len(info, size, stride))?;
        trace!(plane = plane.idx, ?format, "mapped dmabuf plane");
        Ok(self.new_texture(
            info,
            size,
            swizzle,
            stride,
            Storage::Mapped {
                map,
                offset: plane.offset as usize,
            },
        ))
    }

    #[instrument(level = "trace", parent = &self.span, skip(self))]
    fn import_dmabuf_external(&mut self, dmabuf: &Dmabuf) -> Result<HeadlessTexture, HeadlessError> {
        let code = dmabuf.format().code;
        let Some(info) = format::lookup(code) else {
            return Err(HeadlessError::UnsupportedPixelFormat(code));
        };
        let Some(decomposition) = decomposition(info) else {
            return Err(HeadlessError::UnsupportedPixelFormat(code));
        };

        let size = dmabuf.size();
        let mut planes = Vec::with_capacity(decomposition.planes.len());
        for bind in decomposition.planes {
            let plane = dmabuf.plane(bind.source).ok_or(HeadlessError::IncompleteBuffer {
                expected: bind.source + 1,
                actual: dmabuf.num_planes(),
            })?;
            // planes imported so far are released with `planes` on error
            let texture = self.import_dmabuf_plane(plane, bind.format, bind.size(size), bind.swizzle)?;
            planes.push((texture, bind));
        }

        self.reserve()?;
        debug!(format = ?code, variant = ?decomposition.variant, "imported external texture");
        Ok(self.new_texture(
            info,
            size,
            Swizzle::IDENTITY,
            0,
            Storage::External {
                planes,
                variant: decomposition.variant,
            },
        ))
    }

    #[instrument(level = "trace", parent = &self.span, skip(self, data))]
    fn create_lut_1d(&mut self, width: usize, rows: usize, data: &[f32]) -> Result<HeadlessLut, HeadlessError> {
        let expected = width * rows;
        if data.len() < expected {
            return Err(HeadlessError::IncompleteBuffer {
                expected,
                actual: data.len(),
            });
        }
        self.reserve()?;
        Ok(HeadlessLut(Rc::new(LutInner {
            kind: LutKind::Curves { width, rows },
            data: data[..expected].to_vec(),
            _live: Live::new(&self.luts),
        })))
    }

    #[instrument(level = "trace", parent = &self.span, skip(self, data))]
    fn create_lut_3d(&mut self, dim: usize, data: &[f32]) -> Result<HeadlessLut, HeadlessError> {
        if !self.capabilities.lut_3d {
            return Err(HeadlessError::Unsupported);
        }
        let expected = dim * dim * dim * 3;
        if data.len() < expected {
            return Err(HeadlessError::IncompleteBuffer {
                expected,
                actual: data.len(),
            });
        }
        self.reserve()?;
        Ok(HeadlessLut(Rc::new(LutInner {
            kind: LutKind::Cube { dim },
            data: data[..expected].to_vec(),
            _live: Live::new(&self.luts),
        })))
    }

    #[instrument(level = "trace", parent = &self.span, skip(self))]
    fn create_framebuffer(
        &mut self,
        size: Size<i32, Physical>,
        format: Fourcc,
        flipped: bool,
    ) -> Result<HeadlessFramebuffer, HeadlessError> {
        let info = renderable(format)?;
        let float = matches!(info.gl, Some(gl) if gl.ty == format::gl::HALF_FLOAT);
        if float && !self.capabilities.float_targets {
            return Err(HeadlessError::UnsupportedPixelFormat(format));
        }
        if size.w <= 0 || size.h <= 0 {
            return Err(HeadlessError::OutOfBounds);
        }
        let clear = texel::quantize_rgba(info, Color32F::TRANSPARENT.components());
        let pixels = vec![clear; (size.w * size.h) as usize];
        Ok(self.new_framebuffer(size, info, flipped, pixels, None))
    }

    #[instrument(level = "trace", parent = &self.span, skip(self))]
    fn import_dmabuf_framebuffer(&mut self, dmabuf: &Dmabuf) -> Result<HeadlessFramebuffer, HeadlessError> {
        let info = renderable(dmabuf.format().code)?;
        let size = dmabuf.size();
        if size.w <= 0 || size.h <= 0 {
            return Err(HeadlessError::OutOfBounds);
        }
        let plane = dmabuf.plane(0).ok_or(HeadlessError::IncompleteBuffer {
            expected: 1,
            actual: 0,
        })?;
        let stride = plane.stride as usize;
        let map = map_plane(&plane, plane_len(info, Size::from((size.w, size.h)), stride))?;

        let cpp = info.cpp(0) as usize;
        let offset = plane.offset as usize;
        let data = map.as_slice();
        let mut pixels = Vec::with_capacity((size.w * size.h) as usize);
        for y in 0..size.h as usize {
            for x in 0..size.w as usize {
                let at = offset + y * stride + x * cpp;
                pixels.push(texel::read_rgba(info, &data[at..at + cpp]));
            }
        }

        let target = MappedTarget {
            map: RefCell::new(map),
            offset,
            stride,
        };
        Ok(self.new_framebuffer(
            Size::from((size.w, size.h)),
            info,
            false,
            pixels,
            Some(target),
        ))
    }

    #[instrument(level = "trace", parent = &self.span, skip(self, target))]
    fn clear(
        &mut self,
        target: &HeadlessFramebuffer,
        color: Color32F,
        damage: &[Rectangle<i32, Physical>],
    ) -> Result<(), HeadlessError> {
        self.check_framebuffer(target)?;
        shading::clear(target, color, damage);
        self.touch(target);
        Ok(())
    }

    #[instrument(level = "trace", parent = &self.span, skip(self, target, call))]
    #[profiling::function]
    fn draw(&mut self, target: &HeadlessFramebuffer, call: &DrawCall<'_, Self>) -> Result<(), HeadlessError> {
        self.check_framebuffer(target)?;
        if call
            .planes
            .iter()
            .any(|plane| plane.texture().renderer_id() != self.id)
        {
            return Err(HeadlessError::ForeignResource);
        }
        if call.planes.len() < call.variant.planes() {
            return Err(HeadlessError::Unsupported);
        }
        self.draw_calls += 1;
        shading::draw(target, call);
        self.touch(target);
        Ok(())
    }

    #[instrument(level = "trace", parent = &self.span, skip(self, src, dst, color))]
    fn blit(
        &mut self,
        src: &HeadlessFramebuffer,
        dst: &HeadlessFramebuffer,
        offset: Point<i32, Physical>,
        damage: &[Rectangle<i32, Physical>],
        color: &GpuColorTransform<Self>,
    ) -> Result<(), HeadlessError> {
        self.check_framebuffer(src)?;
        self.check_framebuffer(dst)?;
        if src == dst {
            return Err(HeadlessError::Unsupported);
        }
        shading::blit(src, dst, offset, damage, color);
        self.touch(dst);
        Ok(())
    }

    #[instrument(level = "trace", parent = &self.span, skip(self, source))]
    fn read_pixels(
        &mut self,
        source: &HeadlessFramebuffer,
        region: Rectangle<i32, Physical>,
        format: Fourcc,
    ) -> Result<ReadPixels, HeadlessError> {
        self.check_framebuffer(source)?;
        let info = renderable(format)?;
        if region.is_empty() || !Rectangle::from_size(source.0.size).contains_rect(region) {
            return Err(HeadlessError::OutOfBounds);
        }

        let cpp = info.cpp(0) as usize;
        let (w, h) = (region.size.w as usize, region.size.h as usize);
        let stride = w * cpp;
        let mut data = vec![0u8; stride * h];
        {
            let pixels = source.0.pixels.borrow();
            let width = source.0.size.w as usize;
            for (row, chunk) in data.chunks_mut(stride).enumerate() {
                // flipped framebuffers store their rows bottom-up
                let y = if source.0.flipped { h - 1 - row } else { row } + region.loc.y as usize;
                for (x, texel) in chunk.chunks_mut(cpp).enumerate() {
                    let pixel = pixels[y * width + region.loc.x as usize + x];
                    texel::write_rgba(info, pixel, texel);
                }
            }
        }

        let sync = if self.capabilities.async_readback {
            self.fence()?
        } else {
            SyncPoint::signaled()
        };
        Ok(ReadPixels { data, stride, sync })
    }

    fn import_fence(&mut self, fence: FenceHandle) -> Result<HeadlessSyncObject, HeadlessError> {
        if self.config.fail_fence_import {
            return Err(HeadlessError::Fence(io::Error::new(
                io::ErrorKind::Unsupported,
                "fence import is disabled",
            )));
        }
        Ok(HeadlessSyncObject { fence })
    }

    #[instrument(level = "trace", parent = &self.span, skip(self))]
    fn queue_wait(&mut self, sync: HeadlessSyncObject) -> Result<(), HeadlessError> {
        let fence = SyncPoint::from(FdFence::new(sync.fence.into_fd()));
        let timeout = self.config.fence_timeout;
        let deadline = *self.wait_deadline.get_or_insert_with(|| Instant::now() + timeout);
        match fence.wait_bounded(deadline.saturating_duration_since(Instant::now())) {
            Ok(()) => Ok(()),
            Err(SyncError::Timeout) => Err(HeadlessError::FenceTimeout),
            Err(err) => Err(HeadlessError::Wait(err)),
        }
    }

    #[instrument(level = "trace", parent = &self.span, skip(self))]
    #[profiling::function]
    fn submit(&mut self) -> Result<SyncPoint, HeadlessError> {
        self.wait_deadline = None;
        for framebuffer in self.dirty.drain(..) {
            framebuffer.flush();
        }
        self.fence()
    }
}
