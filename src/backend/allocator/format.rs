//! Format info tables for DRM formats.
//!
//! Every pixel format known to this crate has a static [`PixelFormatInfo`] describing
//! its memory layout (planes, chroma subsampling, bytes per pixel), the GL triple it
//! can be uploaded with, the channel swizzle needed to sample it as RGBA and its opaque
//! alternative. The table is consulted through [`lookup`].
//!
//! ```
//! # use kiln::backend::allocator::Fourcc;
//! # use kiln::backend::allocator::format::{lookup, get_opaque, has_alpha, get_bpp};
//! assert_eq!(Some(Fourcc::Xrgb8888), get_opaque(Fourcc::Argb8888));
//! assert!(has_alpha(Fourcc::Argb8888));
//! assert_eq!(get_bpp(Fourcc::Nv12), Some(12));
//!
//! let nv12 = lookup(Fourcc::Nv12).unwrap();
//! assert_eq!(nv12.plane_count(), 2);
//! assert_eq!((nv12.hsub(1), nv12.vsub(1)), (2, 2));
//! ```

use std::{collections::HashMap, sync::Arc};

use indexmap::IndexSet;
use once_cell::sync::Lazy;

use super::{Format, Fourcc};

/// GL enum values used by the format tables
#[allow(missing_docs)]
pub mod gl {
    pub const RED: u32 = 0x1903;
    pub const RG: u32 = 0x8227;
    pub const RGB: u32 = 0x1907;
    pub const RGBA: u32 = 0x1908;
    pub const BGRA_EXT: u32 = 0x80E1;

    pub const R8: u32 = 0x8229;
    pub const RG8: u32 = 0x822B;
    pub const R16_EXT: u32 = 0x822A;
    pub const RG16_EXT: u32 = 0x822C;
    pub const RGB8: u32 = 0x8051;
    pub const RGBA8: u32 = 0x8058;
    pub const RGB565: u32 = 0x8D62;
    pub const RGB10_A2: u32 = 0x8059;
    pub const RGBA16F: u32 = 0x881A;
    pub const R32F: u32 = 0x822E;
    pub const RGB32F: u32 = 0x8815;

    pub const UNSIGNED_BYTE: u32 = 0x1401;
    pub const UNSIGNED_SHORT: u32 = 0x1403;
    pub const FLOAT: u32 = 0x1406;
    pub const HALF_FLOAT: u32 = 0x140B;
    pub const UNSIGNED_SHORT_5_6_5: u32 = 0x8363;
    pub const UNSIGNED_INT_2_10_10_10_REV: u32 = 0x8368;
}

/// Source of one output channel when sampling a texture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    /// First texture channel
    R,
    /// Second texture channel
    G,
    /// Third texture channel
    B,
    /// Fourth texture channel
    A,
    /// Constant zero
    Zero,
    /// Constant one
    One,
}

/// Mapping of texture channels to the sampled (r, g, b, a) vector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Swizzle(pub [Channel; 4]);

impl Swizzle {
    /// Swizzle passing every channel through unchanged
    pub const IDENTITY: Swizzle = Swizzle([Channel::R, Channel::G, Channel::B, Channel::A]);

    /// Returns true if this swizzle forces alpha to one
    pub fn is_opaque(&self) -> bool {
        self.0[3] == Channel::One
    }

    /// Apply the swizzle to texel values
    #[inline]
    pub fn apply(&self, texel: [f32; 4]) -> [f32; 4] {
        self.0.map(|c| match c {
            Channel::R => texel[0],
            Channel::G => texel[1],
            Channel::B => texel[2],
            Channel::A => texel[3],
            Channel::Zero => 0.0,
            Channel::One => 1.0,
        })
    }

    /// Compose with another swizzle, applying `self` first
    pub fn then(&self, other: Swizzle) -> Swizzle {
        Swizzle(other.0.map(|c| match c {
            Channel::R => self.0[0],
            Channel::G => self.0[1],
            Channel::B => self.0[2],
            Channel::A => self.0[3],
            constant => constant,
        }))
    }
}

/// GL upload triple of a format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GlFormat {
    /// Internal format of the texture
    pub internal: u32,
    /// Format of the client memory
    pub format: u32,
    /// Component type of the client memory
    pub ty: u32,
}

/// Layout of one memory plane of a format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PlaneInfo {
    /// Horizontal subsampling factor
    pub hsub: u32,
    /// Vertical subsampling factor
    pub vsub: u32,
    /// Bytes per (subsampled) pixel
    pub cpp: u32,
}

/// Immutable description of a pixel format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelFormatInfo {
    /// The format described
    pub format: Fourcc,
    /// Average bits per pixel, summed over all planes
    pub bpp: u32,
    /// Bits per pixel actually carrying color or alpha
    pub depth: u32,
    /// Whether the format has an alpha channel
    pub has_alpha: bool,
    /// Opaque alternative of a format with alpha
    pub opaque: Option<Fourcc>,
    /// Memory planes of the format
    pub planes: &'static [PlaneInfo],
    /// GL upload triple, if the format can be sampled directly
    pub gl: Option<GlFormat>,
    /// Channel swizzle producing rgba when sampling the directly uploaded texture
    pub swizzle: Swizzle,
    /// Whether the format carries YCbCr data
    pub is_yuv: bool,
}

impl PixelFormatInfo {
    /// Number of memory planes, 1 if the table does not specify any
    pub fn plane_count(&self) -> usize {
        self.planes.len().max(1)
    }

    /// Horizontal subsampling factor of a plane
    ///
    /// The first plane is never subsampled.
    pub fn hsub(&self, plane: usize) -> u32 {
        if plane == 0 {
            return 1;
        }
        self.planes.get(plane).map(|p| p.hsub).unwrap_or(1)
    }

    /// Vertical subsampling factor of a plane
    ///
    /// The first plane is never subsampled.
    pub fn vsub(&self, plane: usize) -> u32 {
        if plane == 0 {
            return 1;
        }
        self.planes.get(plane).map(|p| p.vsub).unwrap_or(1)
    }

    /// Bytes per pixel of a plane
    pub fn cpp(&self, plane: usize) -> u32 {
        self.planes
            .get(plane)
            .map(|p| p.cpp)
            .unwrap_or_else(|| self.bpp.div_ceil(8))
    }

    /// Width in pixels of a plane for an image of the given width
    pub fn plane_width(&self, plane: usize, width: u32) -> u32 {
        width.div_ceil(self.hsub(plane))
    }

    /// Height in pixels of a plane for an image of the given height
    pub fn plane_height(&self, plane: usize, height: u32) -> u32 {
        height.div_ceil(self.vsub(plane))
    }

    /// Smallest stride a plane may have for an image of the given width
    pub fn min_stride(&self, plane: usize, width: u32) -> u32 {
        self.plane_width(plane, width) * self.cpp(plane)
    }

    /// Number of bytes of a tightly packed image of the given size
    pub fn min_buffer_size(&self, width: u32, height: u32) -> usize {
        (0..self.plane_count())
            .map(|p| self.min_stride(p, width) as usize * self.plane_height(p, height) as usize)
            .sum()
    }

    /// The format to sample with when the content is known to be fully opaque
    ///
    /// Returns the format itself if it has no alpha channel.
    pub fn opaque_substitute(&self) -> &'static PixelFormatInfo {
        self.opaque
            .and_then(lookup)
            .or_else(|| lookup(self.format))
            .unwrap_or(&CATALOG[0])
    }
}

macro_rules! format_tables {
    (@opaque) => { None };
    (@opaque $opaque:ident) => { Some(Fourcc::$opaque) };
    (@gl) => { None };
    (@gl $int:ident, $ext:ident, $ty:ident) => {
        Some(GlFormat { internal: gl::$int, format: gl::$ext, ty: gl::$ty })
    };
    (
        $($fourcc:ident {
            $(opaque: $opaque:ident,)?
            alpha: $alpha:expr,
            bpp: $bpp:expr,
            depth: $depth:expr,
            planes: [$(($hsub:expr, $vsub:expr, $cpp:expr)),* $(,)?],
            $(gl: ($int:ident, $ext:ident, $ty:ident),)?
            swizzle: [$s0:ident, $s1:ident, $s2:ident, $s3:ident],
            yuv: $yuv:expr $(,)?
        }),* $(,)?
    ) => {
        static CATALOG: &[PixelFormatInfo] = &[
            $(PixelFormatInfo {
                format: Fourcc::$fourcc,
                bpp: $bpp,
                depth: $depth,
                has_alpha: $alpha,
                opaque: format_tables!(@opaque $($opaque)?),
                planes: &[$(PlaneInfo { hsub: $hsub, vsub: $vsub, cpp: $cpp }),*],
                gl: format_tables!(@gl $($int, $ext, $ty)?),
                swizzle: Swizzle([Channel::$s0, Channel::$s1, Channel::$s2, Channel::$s3]),
                is_yuv: $yuv,
            },)*
        ];

        /// Returns the opaque alternative of the specified format.
        ///
        /// Unknown formats and formats without alpha will always return [`None`].
        pub const fn get_opaque(fourcc: Fourcc) -> Option<Fourcc> {
            match fourcc {
                $($(Fourcc::$fourcc => Some(Fourcc::$opaque),)?)*
                _ => None,
            }
        }

        /// Returns the transparent alternative of the specified format.
        ///
        /// Unknown formats will always return [`None`].
        pub const fn get_transparent(fourcc: Fourcc) -> Option<Fourcc> {
            match fourcc {
                $($(Fourcc::$opaque => Some(Fourcc::$fourcc),)?)*
                _ => None,
            }
        }

        /// Returns true if the format has an alpha channel.
        ///
        /// Unknown formats will always return `false`.
        pub const fn has_alpha(fourcc: Fourcc) -> bool {
            match fourcc {
                $(Fourcc::$fourcc => $alpha,)*
                _ => false,
            }
        }

        /// Returns the average bits per pixel of the specified format.
        ///
        /// Unknown formats will always return [`None`].
        pub const fn get_bpp(fourcc: Fourcc) -> Option<usize> {
            match fourcc {
                $(Fourcc::$fourcc => Some($bpp),)*
                _ => None,
            }
        }

        /// Returns the depth of the specified format.
        ///
        /// Unknown formats will always return [`None`].
        pub const fn get_depth(fourcc: Fourcc) -> Option<usize> {
            match fourcc {
                $(Fourcc::$fourcc => Some($depth),)*
                _ => None,
            }
        }
    };
}

format_tables! {
    // single and dual channel formats, mostly used as bind planes
    R8 {
        alpha: false, bpp: 8, depth: 8,
        planes: [(1, 1, 1)],
        gl: (R8, RED, UNSIGNED_BYTE),
        swizzle: [R, Zero, Zero, One],
        yuv: false,
    },
    R16 {
        alpha: false, bpp: 16, depth: 16,
        planes: [(1, 1, 2)],
        gl: (R16_EXT, RED, UNSIGNED_SHORT),
        swizzle: [R, Zero, Zero, One],
        yuv: false,
    },
    Gr88 {
        alpha: false, bpp: 16, depth: 16,
        planes: [(1, 1, 2)],
        gl: (RG8, RG, UNSIGNED_BYTE),
        swizzle: [R, G, Zero, One],
        yuv: false,
    },
    Rg88 {
        alpha: false, bpp: 16, depth: 16,
        planes: [(1, 1, 2)],
        gl: (RG8, RG, UNSIGNED_BYTE),
        swizzle: [G, R, Zero, One],
        yuv: false,
    },
    Gr1616 {
        alpha: false, bpp: 32, depth: 32,
        planes: [(1, 1, 4)],
        gl: (RG16_EXT, RG, UNSIGNED_SHORT),
        swizzle: [R, G, Zero, One],
        yuv: false,
    },

    // 16 and 24 bpp RGB
    Rgb565 {
        alpha: false, bpp: 16, depth: 16,
        planes: [(1, 1, 2)],
        gl: (RGB565, RGB, UNSIGNED_SHORT_5_6_5),
        swizzle: [R, G, B, One],
        yuv: false,
    },
    Bgr565 {
        alpha: false, bpp: 16, depth: 16,
        planes: [(1, 1, 2)],
        gl: (RGB565, RGB, UNSIGNED_SHORT_5_6_5),
        swizzle: [B, G, R, One],
        yuv: false,
    },
    Rgb888 {
        alpha: false, bpp: 24, depth: 24,
        planes: [(1, 1, 3)],
        gl: (RGB8, RGB, UNSIGNED_BYTE),
        swizzle: [B, G, R, One],
        yuv: false,
    },
    Bgr888 {
        alpha: false, bpp: 24, depth: 24,
        planes: [(1, 1, 3)],
        gl: (RGB8, RGB, UNSIGNED_BYTE),
        swizzle: [R, G, B, One],
        yuv: false,
    },

    // 32 bpp RGB, 8 bits per channel
    Argb8888 {
        opaque: Xrgb8888,
        alpha: true, bpp: 32, depth: 32,
        planes: [(1, 1, 4)],
        gl: (BGRA_EXT, BGRA_EXT, UNSIGNED_BYTE),
        swizzle: [R, G, B, A],
        yuv: false,
    },
    Xrgb8888 {
        alpha: false, bpp: 32, depth: 24,
        planes: [(1, 1, 4)],
        gl: (BGRA_EXT, BGRA_EXT, UNSIGNED_BYTE),
        swizzle: [R, G, B, One],
        yuv: false,
    },
    Abgr8888 {
        opaque: Xbgr8888,
        alpha: true, bpp: 32, depth: 32,
        planes: [(1, 1, 4)],
        gl: (RGBA8, RGBA, UNSIGNED_BYTE),
        swizzle: [R, G, B, A],
        yuv: false,
    },
    Xbgr8888 {
        alpha: false, bpp: 32, depth: 24,
        planes: [(1, 1, 4)],
        gl: (RGBA8, RGBA, UNSIGNED_BYTE),
        swizzle: [R, G, B, One],
        yuv: false,
    },
    Rgba8888 {
        opaque: Rgbx8888,
        alpha: true, bpp: 32, depth: 32,
        planes: [(1, 1, 4)],
        gl: (RGBA8, RGBA, UNSIGNED_BYTE),
        swizzle: [A, B, G, R],
        yuv: false,
    },
    Rgbx8888 {
        alpha: false, bpp: 32, depth: 24,
        planes: [(1, 1, 4)],
        gl: (RGBA8, RGBA, UNSIGNED_BYTE),
        swizzle: [A, B, G, One],
        yuv: false,
    },
    Bgra8888 {
        opaque: Bgrx8888,
        alpha: true, bpp: 32, depth: 32,
        planes: [(1, 1, 4)],
        gl: (RGBA8, RGBA, UNSIGNED_BYTE),
        swizzle: [G, B, A, R],
        yuv: false,
    },
    Bgrx8888 {
        alpha: false, bpp: 32, depth: 24,
        planes: [(1, 1, 4)],
        gl: (RGBA8, RGBA, UNSIGNED_BYTE),
        swizzle: [G, B, A, One],
        yuv: false,
    },

    // 32 bpp RGB with 10 bits per color channel
    Argb2101010 {
        opaque: Xrgb2101010,
        alpha: true, bpp: 32, depth: 32,
        planes: [(1, 1, 4)],
        gl: (RGB10_A2, RGBA, UNSIGNED_INT_2_10_10_10_REV),
        swizzle: [B, G, R, A],
        yuv: false,
    },
    Xrgb2101010 {
        alpha: false, bpp: 32, depth: 30,
        planes: [(1, 1, 4)],
        gl: (RGB10_A2, RGBA, UNSIGNED_INT_2_10_10_10_REV),
        swizzle: [B, G, R, One],
        yuv: false,
    },
    Abgr2101010 {
        opaque: Xbgr2101010,
        alpha: true, bpp: 32, depth: 32,
        planes: [(1, 1, 4)],
        gl: (RGB10_A2, RGBA, UNSIGNED_INT_2_10_10_10_REV),
        swizzle: [R, G, B, A],
        yuv: false,
    },
    Xbgr2101010 {
        alpha: false, bpp: 32, depth: 30,
        planes: [(1, 1, 4)],
        gl: (RGB10_A2, RGBA, UNSIGNED_INT_2_10_10_10_REV),
        swizzle: [R, G, B, One],
        yuv: false,
    },

    // half float 64 bpp RGB
    Argb16161616f {
        opaque: Xrgb16161616f,
        alpha: true, bpp: 64, depth: 64,
        planes: [(1, 1, 8)],
        gl: (RGBA16F, RGBA, HALF_FLOAT),
        swizzle: [B, G, R, A],
        yuv: false,
    },
    Xrgb16161616f {
        alpha: false, bpp: 64, depth: 48,
        planes: [(1, 1, 8)],
        gl: (RGBA16F, RGBA, HALF_FLOAT),
        swizzle: [B, G, R, One],
        yuv: false,
    },
    Abgr16161616f {
        opaque: Xbgr16161616f,
        alpha: true, bpp: 64, depth: 64,
        planes: [(1, 1, 8)],
        gl: (RGBA16F, RGBA, HALF_FLOAT),
        swizzle: [R, G, B, A],
        yuv: false,
    },
    Xbgr16161616f {
        alpha: false, bpp: 64, depth: 48,
        planes: [(1, 1, 8)],
        gl: (RGBA16F, RGBA, HALF_FLOAT),
        swizzle: [R, G, B, One],
        yuv: false,
    },

    // packed YCbCr
    Yuyv {
        alpha: false, bpp: 16, depth: 16,
        planes: [(1, 1, 2)],
        swizzle: [R, G, B, One],
        yuv: true,
    },
    Yvyu {
        alpha: false, bpp: 16, depth: 16,
        planes: [(1, 1, 2)],
        swizzle: [R, G, B, One],
        yuv: true,
    },
    Uyvy {
        alpha: false, bpp: 16, depth: 16,
        planes: [(1, 1, 2)],
        swizzle: [R, G, B, One],
        yuv: true,
    },
    Vyuy {
        alpha: false, bpp: 16, depth: 16,
        planes: [(1, 1, 2)],
        swizzle: [R, G, B, One],
        yuv: true,
    },
    Xyuv8888 {
        alpha: false, bpp: 32, depth: 24,
        planes: [(1, 1, 4)],
        swizzle: [R, G, B, One],
        yuv: true,
    },

    // semi-planar YCbCr, luma plane followed by an interleaved chroma plane
    Nv12 {
        alpha: false, bpp: 12, depth: 12,
        planes: [(1, 1, 1), (2, 2, 2)],
        swizzle: [R, G, B, One],
        yuv: true,
    },
    Nv21 {
        alpha: false, bpp: 12, depth: 12,
        planes: [(1, 1, 1), (2, 2, 2)],
        swizzle: [R, G, B, One],
        yuv: true,
    },
    Nv16 {
        alpha: false, bpp: 16, depth: 16,
        planes: [(1, 1, 1), (2, 1, 2)],
        swizzle: [R, G, B, One],
        yuv: true,
    },
    Nv61 {
        alpha: false, bpp: 16, depth: 16,
        planes: [(1, 1, 1), (2, 1, 2)],
        swizzle: [R, G, B, One],
        yuv: true,
    },
    Nv24 {
        alpha: false, bpp: 24, depth: 24,
        planes: [(1, 1, 1), (1, 1, 2)],
        swizzle: [R, G, B, One],
        yuv: true,
    },
    Nv42 {
        alpha: false, bpp: 24, depth: 24,
        planes: [(1, 1, 1), (1, 1, 2)],
        swizzle: [R, G, B, One],
        yuv: true,
    },
    P010 {
        alpha: false, bpp: 24, depth: 15,
        planes: [(1, 1, 2), (2, 2, 4)],
        swizzle: [R, G, B, One],
        yuv: true,
    },
    P012 {
        alpha: false, bpp: 24, depth: 18,
        planes: [(1, 1, 2), (2, 2, 4)],
        swizzle: [R, G, B, One],
        yuv: true,
    },
    P016 {
        alpha: false, bpp: 24, depth: 24,
        planes: [(1, 1, 2), (2, 2, 4)],
        swizzle: [R, G, B, One],
        yuv: true,
    },

    // fully planar YCbCr
    Yuv420 {
        alpha: false, bpp: 12, depth: 12,
        planes: [(1, 1, 1), (2, 2, 1), (2, 2, 1)],
        swizzle: [R, G, B, One],
        yuv: true,
    },
    Yvu420 {
        alpha: false, bpp: 12, depth: 12,
        planes: [(1, 1, 1), (2, 2, 1), (2, 2, 1)],
        swizzle: [R, G, B, One],
        yuv: true,
    },
    Yuv422 {
        alpha: false, bpp: 16, depth: 16,
        planes: [(1, 1, 1), (2, 1, 1), (2, 1, 1)],
        swizzle: [R, G, B, One],
        yuv: true,
    },
    Yvu422 {
        alpha: false, bpp: 16, depth: 16,
        planes: [(1, 1, 1), (2, 1, 1), (2, 1, 1)],
        swizzle: [R, G, B, One],
        yuv: true,
    },
    Yuv444 {
        alpha: false, bpp: 24, depth: 24,
        planes: [(1, 1, 1), (1, 1, 1), (1, 1, 1)],
        swizzle: [R, G, B, One],
        yuv: true,
    },
    Yvu444 {
        alpha: false, bpp: 24, depth: 24,
        planes: [(1, 1, 1), (1, 1, 1), (1, 1, 1)],
        swizzle: [R, G, B, One],
        yuv: true,
    },
}

static INDEX: Lazy<HashMap<Fourcc, usize>> = Lazy::new(|| {
    CATALOG
        .iter()
        .enumerate()
        .map(|(idx, info)| (info.format, idx))
        .collect()
});

/// Look up the description of a format
///
/// Returns [`None`] for formats this crate does not know about.
pub fn lookup(fourcc: Fourcc) -> Option<&'static PixelFormatInfo> {
    INDEX.get(&fourcc).map(|idx| &CATALOG[*idx])
}

/// Look up the description of a format by its raw four-character code
pub fn lookup_code(code: u32) -> Option<&'static PixelFormatInfo> {
    Fourcc::try_from(code).ok().and_then(lookup)
}

/// Iterate over every format of the catalog
pub fn all_formats() -> impl Iterator<Item = &'static PixelFormatInfo> {
    CATALOG.iter()
}

/// A set of [`Format`]s
#[derive(Debug, Default, Clone)]
pub struct FormatSet {
    formats: Arc<IndexSet<Format>>,
}

impl FormatSet {
    /// Return an iterator over the values of the set, in their order
    pub fn iter(&self) -> indexmap::set::Iter<'_, Format> {
        self.formats.iter()
    }

    /// Return `true` if an equivalent to `format` exists in the set.
    pub fn contains(&self, format: &Format) -> bool {
        self.formats.contains(format)
    }

    /// Return `true` if the set contains any modifier for the given code
    pub fn contains_code(&self, code: Fourcc) -> bool {
        self.formats.iter().any(|f| f.code == code)
    }

    /// Number of formats in the set
    pub fn len(&self) -> usize {
        self.formats.len()
    }

    /// Return `true` if the set is empty
    pub fn is_empty(&self) -> bool {
        self.formats.is_empty()
    }
}

impl FromIterator<Format> for FormatSet {
    #[inline]
    fn from_iter<T: IntoIterator<Item = Format>>(iter: T) -> Self {
        Self {
            formats: Arc::new(IndexSet::from_iter(iter)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A format's opaque alternative must be a different format without alpha of the same size.
    #[test]
    fn opaque_alternatives() {
        for info in all_formats() {
            let Some(opaque) = info.opaque else {
                assert!(!info.has_alpha, "{} has alpha but no opaque alternative", info.format);
                continue;
            };
            assert_ne!(info.format, opaque);
            assert_eq!(get_transparent(opaque), Some(info.format));
            assert_eq!(get_opaque(opaque), None, "{opaque} has an opaque alternative itself");
            assert!(!has_alpha(opaque));
            assert_eq!(get_bpp(opaque), get_bpp(info.format));
        }
    }

    #[test]
    fn opaque_substitute_of_opaque_format_is_itself() {
        let xrgb = lookup(Fourcc::Xrgb8888).unwrap();
        assert_eq!(xrgb.opaque_substitute().format, Fourcc::Xrgb8888);

        let argb = lookup(Fourcc::Argb8888).unwrap();
        assert_eq!(argb.opaque_substitute().format, Fourcc::Xrgb8888);
        assert!(argb.opaque_substitute().swizzle.is_opaque());
    }

    #[test]
    fn depth_never_exceeds_bpp() {
        for info in all_formats() {
            assert!(info.depth <= info.bpp, "{} has a depth higher than its bpp", info.format);
        }
    }

    #[test]
    fn first_plane_is_never_subsampled() {
        for info in all_formats() {
            assert_eq!(info.hsub(0), 1);
            assert_eq!(info.vsub(0), 1);
            assert_eq!(info.hsub(7), 1);
        }
    }

    /// Summing every plane's stride times its subsampled height gives the size implied by bpp.
    #[test]
    fn multi_plane_sizes_match_bpp() {
        let (w, h) = (64u32, 64u32);
        for info in all_formats().filter(|info| info.plane_count() > 1) {
            let planes: usize = (0..info.plane_count())
                .map(|p| (w / info.hsub(p) * info.cpp(p)) as usize * (h / info.vsub(p)) as usize)
                .sum();
            assert_eq!(
                planes,
                (w * h * info.bpp / 8) as usize,
                "{} plane sizes disagree with its bpp",
                info.format
            );
            assert_eq!(planes, info.min_buffer_size(w, h));
        }
    }

    #[test]
    fn odd_sizes_round_up() {
        let nv12 = lookup(Fourcc::Nv12).unwrap();
        assert_eq!(nv12.plane_width(1, 5), 3);
        assert_eq!(nv12.plane_height(1, 3), 2);
        assert_eq!(nv12.min_stride(1, 5), 6);
    }

    #[test]
    fn lookup_by_code() {
        let code = Fourcc::Nv12 as u32;
        assert_eq!(lookup_code(code).map(|i| i.format), Some(Fourcc::Nv12));
        assert!(lookup_code(0).is_none());
        assert!(lookup(Fourcc::Rgb332).is_none());
    }

    #[test]
    fn swizzle_composition() {
        let swap = Swizzle([Channel::G, Channel::R, Channel::B, Channel::A]);
        let opaque = Swizzle([Channel::R, Channel::G, Channel::B, Channel::One]);
        let combined = swap.then(opaque);
        assert_eq!(combined.apply([0.1, 0.2, 0.3, 0.4]), [0.2, 0.1, 0.3, 1.0]);
        assert_eq!(Swizzle::IDENTITY.then(swap), swap);
    }
}
