//! Conversion between memory texels and normalized channels
//!
//! Texels are decoded according to the GL upload triple of their format, giving the raw
//! channels a texture would hold. The format swizzle turns those into rgba.

use crate::backend::allocator::format::{gl, Channel, GlFormat, PixelFormatInfo};

#[inline]
fn unorm(value: u32, max: u32) -> f32 {
    value as f32 / max as f32
}

#[inline]
fn quantize(value: f32, max: u32) -> u32 {
    (value.clamp(0.0, 1.0) * max as f32).round() as u32
}

#[inline]
fn u16_at(data: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([data[at], data[at + 1]])
}

#[inline]
fn u32_at(data: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]])
}

/// Expand a binary16 value
pub(crate) fn f16_to_f32(bits: u16) -> f32 {
    let sign = if bits & 0x8000 != 0 { -1.0 } else { 1.0 };
    let exponent = ((bits >> 10) & 0x1f) as i32;
    let mantissa = (bits & 0x3ff) as f32;
    match exponent {
        0 => sign * mantissa * 2f32.powi(-24),
        0x1f if mantissa == 0.0 => sign * f32::INFINITY,
        0x1f => f32::NAN,
        _ => sign * (1.0 + mantissa / 1024.0) * 2f32.powi(exponent - 15),
    }
}

/// Round a value to the nearest binary16, ties to even
pub(crate) fn f32_to_f16(value: f32) -> u16 {
    let bits = value.to_bits();
    let sign = ((bits >> 16) & 0x8000) as u16;
    let exponent = ((bits >> 23) & 0xff) as i32;
    let mantissa = bits & 0x7f_ffff;

    if exponent == 0xff {
        return sign | 0x7c00 | if mantissa != 0 { 0x200 } else { 0 };
    }
    let half_exponent = exponent - 127 + 15;
    if half_exponent >= 0x1f {
        return sign | 0x7c00;
    }
    if half_exponent <= 0 {
        if half_exponent < -10 {
            return sign;
        }
        let mantissa = mantissa | 0x80_0000;
        let shift = (14 - half_exponent) as u32;
        let half = mantissa >> shift;
        let rest = mantissa & ((1 << shift) - 1);
        let halfway = 1 << (shift - 1);
        let rounded = if rest > halfway || (rest == halfway && half & 1 == 1) {
            half + 1
        } else {
            half
        };
        return sign | rounded as u16;
    }

    let half = ((half_exponent as u32) << 10) | (mantissa >> 13);
    let rest = mantissa & 0x1fff;
    // a carry out of the mantissa correctly bumps the exponent
    let rounded = if rest > 0x1000 || (rest == 0x1000 && half & 1 == 1) {
        half + 1
    } else {
        half
    };
    sign | rounded as u16
}

/// Raw texture channels of the texel at the start of `data`
pub(crate) fn decode(format: GlFormat, data: &[u8]) -> [f32; 4] {
    match (format.format, format.ty) {
        (gl::RED, gl::UNSIGNED_BYTE) => [unorm(data[0] as u32, 0xff), 0.0, 0.0, 1.0],
        (gl::RED, gl::UNSIGNED_SHORT) => [unorm(u16_at(data, 0) as u32, 0xffff), 0.0, 0.0, 1.0],
        (gl::RG, gl::UNSIGNED_BYTE) => [
            unorm(data[0] as u32, 0xff),
            unorm(data[1] as u32, 0xff),
            0.0,
            1.0,
        ],
        (gl::RG, gl::UNSIGNED_SHORT) => [
            unorm(u16_at(data, 0) as u32, 0xffff),
            unorm(u16_at(data, 2) as u32, 0xffff),
            0.0,
            1.0,
        ],
        (gl::RGB, gl::UNSIGNED_SHORT_5_6_5) => {
            let texel = u16_at(data, 0) as u32;
            [
                unorm(texel >> 11, 0x1f),
                unorm((texel >> 5) & 0x3f, 0x3f),
                unorm(texel & 0x1f, 0x1f),
                1.0,
            ]
        }
        (gl::RGB, gl::UNSIGNED_BYTE) => [
            unorm(data[0] as u32, 0xff),
            unorm(data[1] as u32, 0xff),
            unorm(data[2] as u32, 0xff),
            1.0,
        ],
        (gl::RGBA, gl::UNSIGNED_BYTE) => [
            unorm(data[0] as u32, 0xff),
            unorm(data[1] as u32, 0xff),
            unorm(data[2] as u32, 0xff),
            unorm(data[3] as u32, 0xff),
        ],
        (gl::BGRA_EXT, gl::UNSIGNED_BYTE) => [
            unorm(data[2] as u32, 0xff),
            unorm(data[1] as u32, 0xff),
            unorm(data[0] as u32, 0xff),
            unorm(data[3] as u32, 0xff),
        ],
        (gl::RGBA, gl::UNSIGNED_INT_2_10_10_10_REV) => {
            let texel = u32_at(data, 0);
            [
                unorm(texel & 0x3ff, 0x3ff),
                unorm((texel >> 10) & 0x3ff, 0x3ff),
                unorm((texel >> 20) & 0x3ff, 0x3ff),
                unorm(texel >> 30, 0x3),
            ]
        }
        (gl::RGBA, gl::HALF_FLOAT) => [
            f16_to_f32(u16_at(data, 0)),
            f16_to_f32(u16_at(data, 2)),
            f16_to_f32(u16_at(data, 4)),
            f16_to_f32(u16_at(data, 6)),
        ],
        _ => [0.0, 0.0, 0.0, 1.0],
    }
}

/// Write raw texture channels into the texel at the start of `data`
pub(crate) fn encode(format: GlFormat, raw: [f32; 4], data: &mut [u8]) {
    match (format.format, format.ty) {
        (gl::RED, gl::UNSIGNED_BYTE) => data[0] = quantize(raw[0], 0xff) as u8,
        (gl::RED, gl::UNSIGNED_SHORT) => {
            data[..2].copy_from_slice(&(quantize(raw[0], 0xffff) as u16).to_le_bytes())
        }
        (gl::RG, gl::UNSIGNED_BYTE) => {
            data[0] = quantize(raw[0], 0xff) as u8;
            data[1] = quantize(raw[1], 0xff) as u8;
        }
        (gl::RG, gl::UNSIGNED_SHORT) => {
            data[..2].copy_from_slice(&(quantize(raw[0], 0xffff) as u16).to_le_bytes());
            data[2..4].copy_from_slice(&(quantize(raw[1], 0xffff) as u16).to_le_bytes());
        }
        (gl::RGB, gl::UNSIGNED_SHORT_5_6_5) => {
            let texel = (quantize(raw[0], 0x1f) << 11) | (quantize(raw[1], 0x3f) << 5) | quantize(raw[2], 0x1f);
            data[..2].copy_from_slice(&(texel as u16).to_le_bytes());
        }
        (gl::RGB, gl::UNSIGNED_BYTE) => {
            for (byte, value) in data[..3].iter_mut().zip(raw) {
                *byte = quantize(value, 0xff) as u8;
            }
        }
        (gl::RGBA, gl::UNSIGNED_BYTE) => {
            for (byte, value) in data[..4].iter_mut().zip(raw) {
                *byte = quantize(value, 0xff) as u8;
            }
        }
        (gl::BGRA_EXT, gl::UNSIGNED_BYTE) => {
            data[0] = quantize(raw[2], 0xff) as u8;
            data[1] = quantize(raw[1], 0xff) as u8;
            data[2] = quantize(raw[0], 0xff) as u8;
            data[3] = quantize(raw[3], 0xff) as u8;
        }
        (gl::RGBA, gl::UNSIGNED_INT_2_10_10_10_REV) => {
            let texel = quantize(raw[0], 0x3ff)
                | (quantize(raw[1], 0x3ff) << 10)
                | (quantize(raw[2], 0x3ff) << 20)
                | (quantize(raw[3], 0x3) << 30);
            data[..4].copy_from_slice(&texel.to_le_bytes());
        }
        (gl::RGBA, gl::HALF_FLOAT) => {
            for (i, value) in raw.into_iter().enumerate() {
                data[i * 2..i * 2 + 2].copy_from_slice(&f32_to_f16(value).to_le_bytes());
            }
        }
        _ => {}
    }
}

/// Raw channels that sample as `rgba` through the swizzle of `info`
///
/// Channels the swizzle does not read are set to one.
pub(crate) fn unswizzle(info: &PixelFormatInfo, rgba: [f32; 4]) -> [f32; 4] {
    let mut raw = [1.0; 4];
    for (value, channel) in rgba.into_iter().zip(info.swizzle.0) {
        match channel {
            Channel::R => raw[0] = value,
            Channel::G => raw[1] = value,
            Channel::B => raw[2] = value,
            Channel::A => raw[3] = value,
            Channel::Zero | Channel::One => {}
        }
    }
    raw
}

/// Store `rgba` as a texel of `info`
pub(crate) fn write_rgba(info: &PixelFormatInfo, rgba: [f32; 4], data: &mut [u8]) {
    if let Some(gl) = info.gl {
        encode(gl, unswizzle(info, rgba), data);
    }
}

/// Load a texel of `info` as rgba
pub(crate) fn read_rgba(info: &PixelFormatInfo, data: &[u8]) -> [f32; 4] {
    match info.gl {
        Some(gl) => info.swizzle.apply(decode(gl, data)),
        None => [0.0, 0.0, 0.0, 1.0],
    }
}

/// The closest value `info` can store
pub(crate) fn quantize_rgba(info: &PixelFormatInfo, rgba: [f32; 4]) -> [f32; 4] {
    let mut texel = [0u8; 16];
    write_rgba(info, rgba, &mut texel);
    let mut value = read_rgba(info, &texel);
    // a format without alpha always reads back opaque
    if info.swizzle.is_opaque() {
        value[3] = 1.0;
    }
    value
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::allocator::{format, Fourcc};

    fn info(format: Fourcc) -> &'static PixelFormatInfo {
        format::lookup(format).unwrap()
    }

    #[test]
    fn half_floats_are_exact_where_representable() {
        for value in [0.0f32, 1.0, -2.5, 0.5, 0.25, 65504.0, 2f32.powi(-24)] {
            assert_eq!(f16_to_f32(f32_to_f16(value)), value);
        }
        assert_eq!(f32_to_f16(1.0), 0x3c00);
        assert_eq!(f32_to_f16(1e9), 0x7c00);
        assert_eq!(f16_to_f32(0x7c00), f32::INFINITY);
    }

    #[test]
    fn argb8888_is_stored_bgra() {
        let mut texel = [0u8; 4];
        write_rgba(info(Fourcc::Argb8888), [1.0, 0.5, 0.0, 1.0], &mut texel);
        assert_eq!(texel, [0x00, 0x80, 0xff, 0xff]);
        assert_eq!(
            read_rgba(info(Fourcc::Argb8888), &texel),
            [1.0, 128.0 / 255.0, 0.0, 1.0]
        );
    }

    #[test]
    fn swizzled_formats_store_channels_in_memory_order() {
        // [31:0] R:G:B:A little endian
        let texel = [0x40, 0x30, 0x20, 0x10];
        let rgba = read_rgba(info(Fourcc::Rgba8888), &texel);
        assert_eq!(rgba, [0x10 as f32 / 255.0, 0x20 as f32 / 255.0, 0x30 as f32 / 255.0, 0x40 as f32 / 255.0]);

        // [23:0] R:G:B little endian
        let texel = [0x01, 0x02, 0x03];
        let rgba = read_rgba(info(Fourcc::Rgb888), &texel);
        assert_eq!(rgba, [3.0 / 255.0, 2.0 / 255.0, 1.0 / 255.0, 1.0]);
    }

    #[test]
    fn ten_bit_formats_keep_precision() {
        let info = info(Fourcc::Abgr2101010);
        let value = quantize_rgba(info, [0.5, 0.25, 1.0, 1.0]);
        assert!((value[0] - 0.5).abs() <= 1.0 / 1023.0);
        assert!((value[1] - 0.25).abs() <= 1.0 / 1023.0);
        assert_eq!(value[2], 1.0);
        assert_eq!(value[3], 1.0);
    }

    #[test]
    fn opaque_formats_read_back_opaque() {
        let value = quantize_rgba(info(Fourcc::Xrgb8888), [0.2, 0.4, 0.6, 0.5]);
        assert_eq!(value[3], 1.0);
        let value = quantize_rgba(info(Fourcc::Rgb565), [1.0, 0.0, 1.0, 0.0]);
        assert_eq!(value, [1.0, 0.0, 1.0, 1.0]);
    }
}
