//! Import of client buffers into textures
//!
//! A [`ClientBuffer`] wraps either a shared memory buffer or a dmabuf. Importing it
//! creates one texture per *bind plane*: formats the device can sample natively map to
//! a single texture, YCbCr formats are split into narrower formats according to a fixed
//! table (see [`decomposition`]) and reassembled by the shader [`ShaderVariant`] of the
//! import. Shm and dmabuf imports of the same format use the same table.
//!
//! Textures are cached inside the buffer, per renderer. Importing an unchanged shm
//! buffer again only uploads its damage into the existing textures.

use std::{
    any::Any,
    cell::{Cell, RefCell},
    collections::HashMap,
    fmt,
    rc::Rc,
};

use cgmath::{Matrix3, Vector3};
use smallvec::{smallvec, SmallVec};
use tracing::{debug, instrument, trace, warn};

use super::{Capabilities, Renderer, RendererError, ShaderVariant};
use crate::{
    backend::{
        allocator::{
            dmabuf::Dmabuf,
            format::{self, Channel, PixelFormatInfo, Swizzle},
            shm::ShmBuffer,
            Buffer, Fourcc, Modifier,
        },
        renderer::sync::SyncError,
    },
    utils::{ids::id_gen, Buffer as BufferCoords, Rectangle, Region, Size},
};

/// YCbCr color model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum YcbcrModel {
    /// ITU-R BT.601
    Bt601,
    /// ITU-R BT.709
    Bt709,
    /// ITU-R BT.2020
    Bt2020,
}

impl YcbcrModel {
    /// Luma weights of red and blue
    fn kr_kb(self) -> (f32, f32) {
        match self {
            YcbcrModel::Bt601 => (0.299, 0.114),
            YcbcrModel::Bt709 => (0.2126, 0.0722),
            YcbcrModel::Bt2020 => (0.2627, 0.0593),
        }
    }
}

/// YCbCr value range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum YcbcrRange {
    /// ITU narrow range (Y: 16-235, Cb/Cr: 16-240)
    Narrow,
    /// Full range
    Full,
}

/// Colorspace used to turn YCbCr samples into rgb
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct YuvColorspace {
    /// Color model
    pub model: YcbcrModel,
    /// Value range
    pub range: YcbcrRange,
}

impl Default for YuvColorspace {
    fn default() -> Self {
        YuvColorspace {
            model: YcbcrModel::Bt601,
            range: YcbcrRange::Narrow,
        }
    }
}

impl YuvColorspace {
    /// Matrix and offset converting normalized `(y, cb, cr)` samples into rgb
    ///
    /// `rgb = matrix * yuv + offset`
    pub fn conversion(&self) -> (Matrix3<f32>, Vector3<f32>) {
        let (kr, kb) = self.model.kr_kb();
        let kg = 1.0 - kr - kb;
        let (y_scale, c_scale, y_bias) = match self.range {
            YcbcrRange::Narrow => (255.0 / 219.0, 255.0 / 224.0, 16.0 / 255.0),
            YcbcrRange::Full => (1.0, 1.0, 0.0),
        };
        let c_bias = 128.0 / 255.0;

        let cr_r = 2.0 * (1.0 - kr) * c_scale;
        let cb_b = 2.0 * (1.0 - kb) * c_scale;
        let cb_g = -kb * cb_b / kg;
        let cr_g = -kr * cr_r / kg;

        // columns are the y, cb and cr contributions
        let matrix = Matrix3::new(
            y_scale, y_scale, y_scale, 0.0, cb_g, cb_b, cr_r, cr_g, 0.0,
        );
        let offset = Vector3::new(
            -y_scale * y_bias - cr_r * c_bias,
            -y_scale * y_bias - (cb_g + cr_g) * c_bias,
            -y_scale * y_bias - cb_b * c_bias,
        );
        (matrix, offset)
    }

    /// Convert a single normalized `(y, cb, cr)` sample into rgb
    pub fn to_rgb(&self, yuv: [f32; 3]) -> [f32; 3] {
        let (matrix, offset) = self.conversion();
        let rgb = matrix * Vector3::new(yuv[0], yuv[1], yuv[2]) + offset;
        [rgb.x, rgb.y, rgb.z]
    }
}

/// One texture of an import
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BindPlane {
    /// Memory plane of the buffer the texture is created from
    pub source: usize,
    /// Horizontal subsampling of the texture relative to the buffer
    pub hsub: u32,
    /// Vertical subsampling of the texture relative to the buffer
    pub vsub: u32,
    /// Format the memory is interpreted as
    pub format: Fourcc,
    /// Swizzle set on the texture
    pub swizzle: Swizzle,
}

impl BindPlane {
    /// Size of the texture for a buffer of the given size
    pub fn size(&self, buffer: Size<i32, BufferCoords>) -> Size<i32, BufferCoords> {
        Size::from((
            (buffer.w.max(0) as u32).div_ceil(self.hsub) as i32,
            (buffer.h.max(0) as u32).div_ceil(self.vsub) as i32,
        ))
    }

    /// Map a buffer region onto the texture, rounding outwards
    pub fn region(&self, rect: Rectangle<i32, BufferCoords>) -> Rectangle<i32, BufferCoords> {
        let (hsub, vsub) = (self.hsub as i32, self.vsub as i32);
        Rectangle::from_extremities(
            (rect.loc.x.div_euclid(hsub), rect.loc.y.div_euclid(vsub)),
            (
                (rect.loc.x + rect.size.w + hsub - 1).div_euclid(hsub),
                (rect.loc.y + rect.size.h + vsub - 1).div_euclid(vsub),
            ),
        )
    }
}

/// How a format is split into textures
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decomposition {
    /// Shader reassembling the planes
    pub variant: ShaderVariant,
    /// Textures to create
    pub planes: SmallVec<[BindPlane; 3]>,
}

const fn bind(source: usize, hsub: u32, vsub: u32, format: Fourcc, swizzle: [Channel; 4]) -> BindPlane {
    BindPlane {
        source,
        hsub,
        vsub,
        format,
        swizzle: Swizzle(swizzle),
    }
}

const LUMA_8: BindPlane = bind(0, 1, 1, Fourcc::R8, [Channel::R, Channel::Zero, Channel::Zero, Channel::One]);
const LUMA_16: BindPlane = bind(0, 1, 1, Fourcc::R16, [Channel::R, Channel::Zero, Channel::Zero, Channel::One]);

fn yuv_table(format: Fourcc) -> Option<(ShaderVariant, &'static [BindPlane])> {
    use Channel::{One, Zero, A, B, G, R};
    use ShaderVariant::*;

    static NV12: [BindPlane; 2] = [LUMA_8, bind(1, 2, 2, Fourcc::Gr88, [R, G, Zero, One])];
    static NV21: [BindPlane; 2] = [LUMA_8, bind(1, 2, 2, Fourcc::Gr88, [G, R, Zero, One])];
    static NV16: [BindPlane; 2] = [LUMA_8, bind(1, 2, 1, Fourcc::Gr88, [R, G, Zero, One])];
    static NV61: [BindPlane; 2] = [LUMA_8, bind(1, 2, 1, Fourcc::Gr88, [G, R, Zero, One])];
    static NV24: [BindPlane; 2] = [LUMA_8, bind(1, 1, 1, Fourcc::Gr88, [R, G, Zero, One])];
    static NV42: [BindPlane; 2] = [LUMA_8, bind(1, 1, 1, Fourcc::Gr88, [G, R, Zero, One])];
    static P01X: [BindPlane; 2] = [LUMA_16, bind(1, 2, 2, Fourcc::Gr1616, [R, G, Zero, One])];

    static YUV420: [BindPlane; 3] = [
        LUMA_8,
        bind(1, 2, 2, Fourcc::R8, [R, Zero, Zero, One]),
        bind(2, 2, 2, Fourcc::R8, [R, Zero, Zero, One]),
    ];
    static YVU420: [BindPlane; 3] = [
        LUMA_8,
        bind(2, 2, 2, Fourcc::R8, [R, Zero, Zero, One]),
        bind(1, 2, 2, Fourcc::R8, [R, Zero, Zero, One]),
    ];
    static YUV422: [BindPlane; 3] = [
        LUMA_8,
        bind(1, 2, 1, Fourcc::R8, [R, Zero, Zero, One]),
        bind(2, 2, 1, Fourcc::R8, [R, Zero, Zero, One]),
    ];
    static YVU422: [BindPlane; 3] = [
        LUMA_8,
        bind(2, 2, 1, Fourcc::R8, [R, Zero, Zero, One]),
        bind(1, 2, 1, Fourcc::R8, [R, Zero, Zero, One]),
    ];
    static YUV444: [BindPlane; 3] = [
        LUMA_8,
        bind(1, 1, 1, Fourcc::R8, [R, Zero, Zero, One]),
        bind(2, 1, 1, Fourcc::R8, [R, Zero, Zero, One]),
    ];
    static YVU444: [BindPlane; 3] = [
        LUMA_8,
        bind(2, 1, 1, Fourcc::R8, [R, Zero, Zero, One]),
        bind(1, 1, 1, Fourcc::R8, [R, Zero, Zero, One]),
    ];

    // packed 4:2:2, luma read as two channel texels, chroma as four channel texels of half width
    static YUYV: [BindPlane; 2] = [
        bind(0, 1, 1, Fourcc::Gr88, [R, G, Zero, One]),
        bind(0, 2, 1, Fourcc::Argb8888, [R, G, B, A]),
    ];
    static YVYU: [BindPlane; 2] = [
        bind(0, 1, 1, Fourcc::Gr88, [R, G, Zero, One]),
        bind(0, 2, 1, Fourcc::Argb8888, [R, A, B, G]),
    ];
    static UYVY: [BindPlane; 2] = [
        bind(0, 1, 1, Fourcc::Gr88, [G, R, Zero, One]),
        bind(0, 2, 1, Fourcc::Argb8888, [R, B, G, R]),
    ];
    static VYUY: [BindPlane; 2] = [
        bind(0, 1, 1, Fourcc::Gr88, [G, R, Zero, One]),
        bind(0, 2, 1, Fourcc::Argb8888, [R, R, B, B]),
    ];
    static XYUV: [BindPlane; 1] = [bind(0, 1, 1, Fourcc::Xbgr8888, [R, G, B, One])];

    Some(match format {
        Fourcc::Nv12 => (Y_UV, &NV12[..]),
        Fourcc::Nv21 => (Y_UV, &NV21[..]),
        Fourcc::Nv16 => (Y_UV, &NV16[..]),
        Fourcc::Nv61 => (Y_UV, &NV61[..]),
        Fourcc::Nv24 => (Y_UV, &NV24[..]),
        Fourcc::Nv42 => (Y_UV, &NV42[..]),
        Fourcc::P010 | Fourcc::P012 | Fourcc::P016 => (Y_UV, &P01X[..]),
        Fourcc::Yuv420 => (Y_U_V, &YUV420[..]),
        Fourcc::Yvu420 => (Y_U_V, &YVU420[..]),
        Fourcc::Yuv422 => (Y_U_V, &YUV422[..]),
        Fourcc::Yvu422 => (Y_U_V, &YVU422[..]),
        Fourcc::Yuv444 => (Y_U_V, &YUV444[..]),
        Fourcc::Yvu444 => (Y_U_V, &YVU444[..]),
        Fourcc::Yuyv => (Y_XUXV, &YUYV[..]),
        Fourcc::Yvyu => (Y_XUXV, &YVYU[..]),
        Fourcc::Uyvy => (Y_XUXV, &UYVY[..]),
        Fourcc::Vyuy => (Y_XUXV, &VYUY[..]),
        Fourcc::Xyuv8888 => (Xyuv, &XYUV[..]),
        _ => return None,
    })
}

/// Look up how a format is imported
///
/// Returns [`None`] if the format can neither be sampled directly nor be decomposed.
pub fn decomposition(info: &PixelFormatInfo) -> Option<Decomposition> {
    if let Some((variant, planes)) = yuv_table(info.format) {
        return Some(Decomposition {
            variant,
            planes: planes.iter().copied().collect(),
        });
    }
    if info.is_yuv || info.gl.is_none() {
        return None;
    }
    Some(Decomposition {
        variant: if info.has_alpha {
            ShaderVariant::Rgba
        } else {
            ShaderVariant::Rgbx
        },
        planes: smallvec![bind(0, 1, 1, info.format, info.swizzle.0)],
    })
}

/// Errors of buffer import
#[derive(Debug, thiserror::Error)]
pub enum ImportError<E: std::error::Error + 'static> {
    /// The format is unknown or cannot be sampled
    #[error("Unsupported buffer format {0:?}")]
    UnsupportedFormat(Fourcc),
    /// The device does not accept the modifier for this format
    #[error("Modifier {1:?} is not supported for format {0:?}")]
    UnsupportedModifier(Fourcc, Modifier),
    /// The buffer description does not fit its memory
    #[error("Invalid buffer geometry: {0}")]
    InvalidGeometry(String),
    /// Waiting for the acquire fence failed
    #[error("Failed to wait for the acquire fence")]
    Sync(#[from] SyncError),
    /// The device failed to create or update a texture
    #[error("The renderer failed to import the buffer: {0}")]
    Renderer(#[source] E),
}

/// Texture created from one bind plane of a buffer
#[derive(Debug)]
pub struct GpuImage<R: Renderer + ?Sized> {
    texture: R::TextureId,
    bind: BindPlane,
    upload_offset: Cell<usize>,
}

impl<R: Renderer + ?Sized> GpuImage<R> {
    /// The device texture
    pub fn texture(&self) -> &R::TextureId {
        &self.texture
    }

    /// Description of the plane
    pub fn bind_plane(&self) -> &BindPlane {
        &self.bind
    }

    /// Pool offset of the memory last uploaded into the texture
    pub fn upload_offset(&self) -> usize {
        self.upload_offset.get()
    }
}

/// Set of textures imported from a [`ClientBuffer`]
#[derive(Debug)]
pub struct ImportedBuffer<R: Renderer + ?Sized> {
    planes: SmallVec<[GpuImage<R>; 3]>,
    variant: ShaderVariant,
    format: Fourcc,
    size: Size<i32, BufferCoords>,
    y_inverted: bool,
    colorspace: YuvColorspace,
}

impl<R: Renderer + ?Sized> ImportedBuffer<R> {
    /// The textures, in the order the shader variant consumes them
    pub fn planes(&self) -> &[GpuImage<R>] {
        &self.planes
    }

    /// How the planes are reassembled
    pub fn variant(&self) -> ShaderVariant {
        self.variant
    }

    /// Format of the client buffer
    pub fn format(&self) -> Fourcc {
        self.format
    }

    /// Size of the client buffer
    pub fn size(&self) -> Size<i32, BufferCoords> {
        self.size
    }

    /// Rows of the buffer are stored bottom-up
    pub fn y_inverted(&self) -> bool {
        self.y_inverted
    }

    /// Colorspace used by the yuv variants
    pub fn colorspace(&self) -> YuvColorspace {
        self.colorspace
    }

    /// Variant to sample with when the content is known to be opaque
    pub fn opaque_variant(&self) -> ShaderVariant {
        match self.variant {
            ShaderVariant::Rgba => ShaderVariant::Rgbx,
            other => other,
        }
    }
}

/// Memory backing a [`ClientBuffer`]
#[derive(Debug)]
pub enum BufferKind {
    /// Shared memory, uploaded into textures
    Shm(ShmBuffer),
    /// Dmabuf, imported without copies
    Dmabuf(Dmabuf),
}

id_gen!(client_buffer_id);

struct ClientBufferInner {
    id: usize,
    kind: BufferKind,
    colorspace: Cell<YuvColorspace>,
    textures: RefCell<HashMap<usize, Box<dyn Any>>>,
    exhaustion_logged: Cell<bool>,
}

impl fmt::Debug for ClientBufferInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientBuffer")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("colorspace", &self.colorspace.get())
            .field("renderers", &self.textures.borrow().len())
            .finish()
    }
}

/// Buffer attached to a surface by a client
///
/// Clones refer to the same buffer. Textures imported from it are owned by the buffer
/// and released together with its last clone.
#[derive(Debug, Clone)]
pub struct ClientBuffer(Rc<ClientBufferInner>);

impl PartialEq for ClientBuffer {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl ClientBuffer {
    fn new(kind: BufferKind) -> ClientBuffer {
        ClientBuffer(Rc::new(ClientBufferInner {
            id: client_buffer_id::next(),
            kind,
            colorspace: Cell::new(YuvColorspace::default()),
            textures: RefCell::new(HashMap::new()),
            exhaustion_logged: Cell::new(false),
        }))
    }

    /// Wrap a shared memory buffer
    pub fn shm(buffer: ShmBuffer) -> ClientBuffer {
        Self::new(BufferKind::Shm(buffer))
    }

    /// Wrap a dmabuf
    pub fn dmabuf(buffer: Dmabuf) -> ClientBuffer {
        Self::new(BufferKind::Dmabuf(buffer))
    }

    /// Use `colorspace` when sampling yuv content of this buffer
    pub fn with_colorspace(self, colorspace: YuvColorspace) -> ClientBuffer {
        self.0.colorspace.set(colorspace);
        self
    }

    /// Unique id of this buffer
    pub fn id(&self) -> usize {
        self.0.id
    }

    /// The backing memory
    pub fn kind(&self) -> &BufferKind {
        &self.0.kind
    }

    /// Colorspace of yuv content
    pub fn colorspace(&self) -> YuvColorspace {
        self.0.colorspace.get()
    }

    /// Format code of the buffer
    pub fn fourcc(&self) -> Fourcc {
        match &self.0.kind {
            BufferKind::Shm(shm) => shm.fourcc(),
            BufferKind::Dmabuf(dmabuf) => dmabuf.format().code,
        }
    }

    /// Size of the buffer
    pub fn size(&self) -> Size<i32, BufferCoords> {
        match &self.0.kind {
            BufferKind::Shm(shm) => shm.size(),
            BufferKind::Dmabuf(dmabuf) => dmabuf.size(),
        }
    }

    /// Returns true if textures of `renderer_id` are cached
    pub fn is_imported(&self, renderer_id: usize) -> bool {
        self.0.textures.borrow().contains_key(&renderer_id)
    }

    /// Take over the textures of `previous` if both are shm buffers of identical layout
    ///
    /// Returns true if textures were moved. `previous` loses them.
    pub fn adopt_textures(&self, previous: &ClientBuffer) -> bool {
        if self == previous {
            return false;
        }
        let compatible = match (&self.0.kind, &previous.0.kind) {
            (BufferKind::Shm(new), BufferKind::Shm(old)) => new.same_layout(old),
            _ => false,
        };
        if !compatible {
            return false;
        }
        let textures = std::mem::take(&mut *previous.0.textures.borrow_mut());
        if textures.is_empty() {
            return false;
        }
        trace!(from = previous.id(), to = self.id(), "carrying over shm textures");
        self.0.textures.borrow_mut().extend(textures);
        true
    }

    fn cached<R: Renderer + 'static>(&self, renderer_id: usize) -> Option<Rc<ImportedBuffer<R>>> {
        self.0
            .textures
            .borrow()
            .get(&renderer_id)
            .and_then(|entry| entry.downcast_ref::<Rc<ImportedBuffer<R>>>())
            .cloned()
    }

    fn store<R: Renderer + 'static>(&self, renderer_id: usize, imported: Rc<ImportedBuffer<R>>) {
        self.0
            .textures
            .borrow_mut()
            .insert(renderer_id, Box::new(imported));
    }
}

fn invalid<E: std::error::Error>(reason: impl Into<String>) -> ImportError<E> {
    ImportError::InvalidGeometry(reason.into())
}

fn validate_shm<E: std::error::Error>(info: &PixelFormatInfo, shm: &ShmBuffer) -> Result<(), ImportError<E>> {
    let size = shm.size();
    if size.w <= 0 || size.h <= 0 {
        return Err(invalid(format!("empty buffer {:?}", size)));
    }
    if shm.planes().len() < info.plane_count() {
        return Err(invalid(format!(
            "{} planes given, {:?} needs {}",
            shm.planes().len(),
            info.format,
            info.plane_count()
        )));
    }
    let pool_size = shm.pool().size();
    for (idx, plane) in shm.planes().iter().take(info.plane_count()).enumerate() {
        let min_stride = info.min_stride(idx, size.w as u32) as usize;
        if plane.stride < min_stride {
            return Err(invalid(format!(
                "stride {} of plane {} is smaller than {}",
                plane.stride, idx, min_stride
            )));
        }
        let rows = info.plane_height(idx, size.h as u32) as usize;
        let end = plane.offset + plane.stride * (rows - 1) + min_stride;
        if end > pool_size {
            return Err(invalid(format!(
                "plane {} ends at {}, past the pool of {} bytes",
                idx, end, pool_size
            )));
        }
    }
    Ok(())
}

fn upload_shm<R: Renderer + 'static>(
    renderer: &mut R,
    imported: &ImportedBuffer<R>,
    shm: &ShmBuffer,
    damage: Option<&Region<BufferCoords>>,
) -> Result<(), ImportError<R::Error>> {
    let buffer_rect = Rectangle::from_size(shm.size());
    let damage: SmallVec<[Rectangle<i32, BufferCoords>; 4]> = match damage {
        Some(region) => region
            .rects()
            .iter()
            .filter_map(|rect| rect.intersection(buffer_rect))
            .collect(),
        None => smallvec![buffer_rect],
    };
    if damage.is_empty() {
        return Ok(());
    }

    for image in imported.planes.iter() {
        let bind = image.bind;
        let plane_rect = Rectangle::from_size(bind.size(shm.size()));
        let offset = shm.planes()[bind.source].offset;
        shm.with_plane(bind.source, |data, stride| -> Result<(), ImportError<R::Error>> {
            for rect in damage.iter() {
                let Some(region) = bind.region(*rect).intersection(plane_rect) else {
                    continue;
                };
                trace!(plane = bind.source, ?region, "uploading");
                renderer
                    .upload_texture(&image.texture, data, stride, region)
                    .map_err(ImportError::Renderer)?;
            }
            Ok(())
        })
        .ok_or_else(|| invalid::<R::Error>(format!("plane {} is outside of the pool", bind.source)))??;
        image.upload_offset.set(offset);
    }
    Ok(())
}

fn import_shm<R: Renderer + 'static>(
    renderer: &mut R,
    buffer: &ClientBuffer,
    shm: &ShmBuffer,
    damage: Option<&Region<BufferCoords>>,
) -> Result<Rc<ImportedBuffer<R>>, ImportError<R::Error>> {
    let Some(info) = format::lookup(shm.fourcc()) else {
        return Err(ImportError::UnsupportedFormat(shm.fourcc()));
    };
    let Some(decomposition) = decomposition(info) else {
        return Err(ImportError::UnsupportedFormat(info.format));
    };
    validate_shm::<R::Error>(info, shm)?;

    if let Some(imported) = buffer.cached::<R>(renderer.id()) {
        upload_shm(renderer, &imported, shm, damage)?;
        return Ok(imported);
    }

    let size = shm.size();
    let mut planes = SmallVec::new();
    for bind in decomposition.planes {
        let texture = renderer
            .create_texture(bind.format, bind.size(size), bind.swizzle)
            .map_err(ImportError::Renderer)?;
        planes.push(GpuImage {
            texture,
            bind,
            upload_offset: Cell::new(shm.planes()[bind.source].offset),
        });
    }

    let imported = Rc::new(ImportedBuffer {
        planes,
        variant: decomposition.variant,
        format: info.format,
        size,
        y_inverted: false,
        colorspace: buffer.colorspace(),
    });
    upload_shm(renderer, &imported, shm, None)?;
    debug!(
        buffer = buffer.id(),
        format = ?info.format,
        variant = ?imported.variant,
        "imported shm buffer"
    );
    buffer.store(renderer.id(), imported.clone());
    Ok(imported)
}

fn samples_externally(caps: &Capabilities, info: &PixelFormatInfo, external_only: bool) -> bool {
    external_only || (info.is_yuv && caps.native_yuv())
}

fn import_dmabuf<R: Renderer + 'static>(
    renderer: &mut R,
    buffer: &ClientBuffer,
    dmabuf: &Dmabuf,
) -> Result<Rc<ImportedBuffer<R>>, ImportError<R::Error>> {
    let format = dmabuf.format();
    let Some(info) = format::lookup(format.code) else {
        return Err(ImportError::UnsupportedFormat(format.code));
    };
    if !renderer.dmabuf_formats().contains(&format) {
        return Err(ImportError::UnsupportedModifier(format.code, format.modifier));
    }

    let size = dmabuf.size();
    if size.w <= 0 || size.h <= 0 {
        return Err(invalid(format!("empty buffer {:?}", size)));
    }
    if dmabuf.num_planes() < info.plane_count() {
        return Err(invalid(format!(
            "{} planes given, {:?} needs {}",
            dmabuf.num_planes(),
            info.format,
            info.plane_count()
        )));
    }
    for (idx, plane) in dmabuf.planes().take(info.plane_count()).enumerate() {
        if plane.stride < info.min_stride(idx, size.w as u32) {
            return Err(invalid(format!("stride {} of plane {} is too small", plane.stride, idx)));
        }
    }

    if let Some(imported) = buffer.cached::<R>(renderer.id()) {
        return Ok(imported);
    }

    let external_only = renderer.is_external_only(&format);
    let (variant, planes) = if samples_externally(renderer.capabilities(), info, external_only) {
        let texture = renderer
            .import_dmabuf_external(dmabuf)
            .map_err(ImportError::Renderer)?;
        let bind = bind(0, 1, 1, info.format, Swizzle::IDENTITY.0);
        let planes: SmallVec<[GpuImage<R>; 3]> = smallvec![GpuImage {
            texture,
            bind,
            upload_offset: Cell::new(0),
        }];
        (ShaderVariant::External, planes)
    } else {
        let Some(decomposition) = decomposition(info) else {
            return Err(ImportError::UnsupportedFormat(info.format));
        };
        let mut planes: SmallVec<[GpuImage<R>; 3]> = SmallVec::new();
        for bind in decomposition.planes {
            let plane = dmabuf
                .plane(bind.source)
                .ok_or_else(|| invalid::<R::Error>(format!("plane {} is missing", bind.source)))?;
            match renderer.import_dmabuf_plane(plane, bind.format, bind.size(size), bind.swizzle) {
                Ok(texture) => planes.push(GpuImage {
                    texture,
                    bind,
                    upload_offset: Cell::new(plane.offset as usize),
                }),
                Err(err) => {
                    debug!(
                        plane = bind.source,
                        released = planes.len(),
                        "dmabuf plane import failed, releasing imported planes"
                    );
                    drop(planes);
                    return Err(ImportError::Renderer(err));
                }
            }
        }
        (decomposition.variant, planes)
    };

    let imported = Rc::new(ImportedBuffer {
        planes,
        variant,
        format: info.format,
        size,
        y_inverted: dmabuf.y_inverted(),
        colorspace: buffer.colorspace(),
    });
    debug!(
        buffer = buffer.id(),
        format = ?info.format,
        variant = ?imported.variant,
        "imported dmabuf"
    );
    buffer.store(renderer.id(), imported.clone());
    Ok(imported)
}

/// Import a client buffer into textures of `renderer`
///
/// Shm buffers are uploaded fully on their first import. Later imports of the same
/// buffer reuse the textures and upload only `damage`, or everything if `damage`
/// is [`None`]. Dmabufs are imported once and reused as is.
#[instrument(level = "trace", skip_all, fields(buffer = buffer.id()))]
#[profiling::function]
pub fn import_buffer<R: Renderer + 'static>(
    renderer: &mut R,
    buffer: &ClientBuffer,
    damage: Option<&Region<BufferCoords>>,
) -> Result<Rc<ImportedBuffer<R>>, ImportError<R::Error>> {
    let result = match buffer.kind() {
        BufferKind::Shm(shm) => import_shm(renderer, buffer, shm, damage),
        BufferKind::Dmabuf(dmabuf) => import_dmabuf(renderer, buffer, dmabuf),
    };

    if let Err(ImportError::Renderer(err)) = &result {
        if err.is_resource_exhaustion() && !buffer.0.exhaustion_logged.replace(true) {
            warn!(buffer = buffer.id(), ?err, "Out of device resources, declining buffer import");
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(format: Fourcc) -> &'static PixelFormatInfo {
        format::lookup(format).unwrap()
    }

    #[test]
    fn rgb_formats_import_as_one_plane() {
        let argb = decomposition(info(Fourcc::Argb8888)).unwrap();
        assert_eq!(argb.variant, ShaderVariant::Rgba);
        assert_eq!(argb.planes.len(), 1);
        assert_eq!(argb.planes[0].format, Fourcc::Argb8888);

        let xrgb = decomposition(info(Fourcc::Xrgb8888)).unwrap();
        assert_eq!(xrgb.variant, ShaderVariant::Rgbx);
        assert!(xrgb.planes[0].swizzle.is_opaque());
    }

    #[test]
    fn planar_yuv_swaps_chroma_sources() {
        let yuv = decomposition(info(Fourcc::Yuv420)).unwrap();
        let yvu = decomposition(info(Fourcc::Yvu420)).unwrap();
        assert_eq!(yuv.variant, ShaderVariant::Y_U_V);
        assert_eq!(
            yuv.planes.iter().map(|p| p.source).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
        assert_eq!(
            yvu.planes.iter().map(|p| p.source).collect::<Vec<_>>(),
            vec![0, 2, 1]
        );
    }

    #[test]
    fn every_yuv_format_decomposes_consistently() {
        for info in format::all_formats().filter(|info| info.is_yuv) {
            let decomposition = decomposition(info).unwrap_or_else(|| panic!("{:?}", info.format));
            assert_eq!(
                decomposition.planes.len(),
                decomposition.variant.planes(),
                "{:?}",
                info.format
            );
            assert!(decomposition.variant.is_yuv());
            // luma is never subsampled
            assert_eq!((decomposition.planes[0].hsub, decomposition.planes[0].vsub), (1, 1));
            for plane in decomposition.planes.iter() {
                assert!(plane.source < info.plane_count());
                assert!(format::lookup(plane.format).unwrap().gl.is_some());
                // bind planes of separate memory planes follow the memory layout
                if info.plane_count() > 1 {
                    assert_eq!(plane.hsub, info.hsub(plane.source), "{:?}", info.format);
                    assert_eq!(plane.vsub, info.vsub(plane.source), "{:?}", info.format);
                }
            }
        }
    }

    #[test]
    fn bind_plane_regions_round_outwards() {
        let chroma = bind(1, 2, 2, Fourcc::Gr88, [Channel::R, Channel::G, Channel::Zero, Channel::One]);
        assert_eq!(
            chroma.size(Size::from((63, 64))),
            Size::from((32, 32))
        );
        assert_eq!(
            chroma.region(Rectangle::from_loc_and_size((1, 1), (2, 2))),
            Rectangle::from_loc_and_size((0, 0), (2, 2))
        );
    }

    #[test]
    fn colorspace_maps_reference_points() {
        let narrow = YuvColorspace::default();
        let black = narrow.to_rgb([16.0 / 255.0, 128.0 / 255.0, 128.0 / 255.0]);
        let white = narrow.to_rgb([235.0 / 255.0, 128.0 / 255.0, 128.0 / 255.0]);
        for c in 0..3 {
            assert!(black[c].abs() < 1e-5);
            assert!((white[c] - 1.0).abs() < 1e-5);
        }

        let full = YuvColorspace {
            model: YcbcrModel::Bt709,
            range: YcbcrRange::Full,
        };
        // pure red in bt709 full range
        let red = full.to_rgb([
            0.2126,
            128.0 / 255.0 - 0.2126 / 1.8556,
            128.0 / 255.0 + 0.7874 / 1.5748,
        ]);
        assert!((red[0] - 1.0).abs() < 1e-2);
        assert!(red[1].abs() < 1e-2);
    }
}
