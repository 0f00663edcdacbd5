//! Per pixel evaluation of draw calls
//!
//! Mirrors what the fragment shaders of a gpu renderer do: sample the planes of a buffer,
//! reassemble rgba from them, run the color transform on unpremultiplied values, tint
//! and blend.

use cgmath::Vector3;
use smallvec::SmallVec;

use super::{HeadlessFramebuffer, HeadlessLut, HeadlessRenderer, HeadlessTexture, LutKind};
use crate::{
    backend::renderer::{
        color::{Color32F, GpuColorTransform, GpuCurve, GpuMapping},
        import::YuvColorspace,
        DrawCall, Framebuffer, ShaderVariant, TextureFilter,
    },
    utils::{Buffer as BufferCoords, Physical, Point, Rectangle, Size},
};

/// A texture together with its subsampling relative to the buffer
pub(super) type Tap<'a> = (&'a HeadlessTexture, u32, u32);

fn lerp(a: [f32; 4], b: [f32; 4], t: f32) -> [f32; 4] {
    [
        a[0] + (b[0] - a[0]) * t,
        a[1] + (b[1] - a[1]) * t,
        a[2] + (b[2] - a[2]) * t,
        a[3] + (b[3] - a[3]) * t,
    ]
}

/// Sample a texture at continuous texel coordinates, clamping to the edge
pub(super) fn sample(texture: &HeadlessTexture, x: f64, y: f64) -> [f32; 4] {
    match texture.filter() {
        TextureFilter::Nearest => texture.texel(x.floor() as i32, y.floor() as i32),
        TextureFilter::Linear => {
            let (x, y) = (x - 0.5, y - 0.5);
            let (x0, y0) = (x.floor(), y.floor());
            let (fx, fy) = ((x - x0) as f32, (y - y0) as f32);
            let (x0, y0) = (x0 as i32, y0 as i32);
            let top = lerp(texture.texel(x0, y0), texture.texel(x0 + 1, y0), fx);
            let bottom = lerp(texture.texel(x0, y0 + 1), texture.texel(x0 + 1, y0 + 1), fx);
            lerp(top, bottom, fy)
        }
    }
}

fn yuv_to_rgba(colorspace: &YuvColorspace, yuv: [f32; 3]) -> [f32; 4] {
    let [r, g, b] = colorspace.to_rgb(yuv);
    [r.clamp(0.0, 1.0), g.clamp(0.0, 1.0), b.clamp(0.0, 1.0), 1.0]
}

/// Premultiplied color of a buffer at buffer coordinates `(x, y)`
pub(super) fn reassemble(
    planes: &[Tap<'_>],
    variant: ShaderVariant,
    colorspace: &YuvColorspace,
    x: f64,
    y: f64,
) -> [f32; 4] {
    let tap = |idx: usize| match planes.get(idx) {
        Some((texture, hsub, vsub)) => sample(texture, x / *hsub as f64, y / *vsub as f64),
        None => [0.0, 0.0, 0.0, 1.0],
    };

    match variant {
        ShaderVariant::Rgba => tap(0),
        ShaderVariant::Rgbx => {
            let texel = tap(0);
            [texel[0], texel[1], texel[2], 1.0]
        }
        ShaderVariant::Y_U_V => yuv_to_rgba(colorspace, [tap(0)[0], tap(1)[0], tap(2)[0]]),
        ShaderVariant::Y_UV => {
            let chroma = tap(1);
            yuv_to_rgba(colorspace, [tap(0)[0], chroma[0], chroma[1]])
        }
        ShaderVariant::Y_XUXV => {
            let chroma = tap(1);
            yuv_to_rgba(colorspace, [tap(0)[0], chroma[1], chroma[3]])
        }
        ShaderVariant::Xyuv => {
            let texel = tap(0);
            yuv_to_rgba(colorspace, [texel[2], texel[1], texel[0]])
        }
        ShaderVariant::External => match planes.first().and_then(|(texture, _, _)| texture.external()) {
            Some((inner, variant)) => {
                let inner: SmallVec<[Tap<'_>; 3]> = inner
                    .iter()
                    .map(|(texture, bind)| (texture, bind.hsub, bind.vsub))
                    .collect();
                reassemble(&inner, variant, colorspace, x, y)
            }
            None => tap(0),
        },
    }
}

fn lut_position(value: f32, scale: f32, offset: f32, len: usize) -> (usize, usize, f32) {
    let position = ((value * scale + offset) * len as f32 - 0.5).clamp(0.0, (len - 1) as f32);
    let low = position.floor() as usize;
    let high = (low + 1).min(len - 1);
    (low, high, position - low as f32)
}

fn sample_lut_1d(lut: &HeadlessLut, row: usize, value: f32, scale: f32, offset: f32) -> f32 {
    let LutKind::Curves { width, rows } = lut.kind() else {
        return value;
    };
    if width == 0 || row >= rows {
        return value;
    }
    let data = &lut.data()[row * width..(row + 1) * width];
    let (low, high, t) = lut_position(value, scale, offset, width);
    data[low] + (data[high] - data[low]) * t
}

fn sample_lut_3d(lut: &HeadlessLut, rgb: [f32; 3], scale: f32, offset: f32) -> [f32; 3] {
    let LutKind::Cube { dim } = lut.kind() else {
        return rgb;
    };
    if dim == 0 {
        return rgb;
    }
    let data = lut.data();
    let [r, g, b] = rgb.map(|c| lut_position(c, scale, offset, dim));
    let entry = |ri: usize, gi: usize, bi: usize| {
        let idx = ((bi * dim + gi) * dim + ri) * 3;
        [data[idx], data[idx + 1], data[idx + 2]]
    };
    let mix = |a: [f32; 3], b: [f32; 3], t: f32| {
        [a[0] + (b[0] - a[0]) * t, a[1] + (b[1] - a[1]) * t, a[2] + (b[2] - a[2]) * t]
    };

    let c00 = mix(entry(r.0, g.0, b.0), entry(r.1, g.0, b.0), r.2);
    let c10 = mix(entry(r.0, g.1, b.0), entry(r.1, g.1, b.0), r.2);
    let c01 = mix(entry(r.0, g.0, b.1), entry(r.1, g.0, b.1), r.2);
    let c11 = mix(entry(r.0, g.1, b.1), entry(r.1, g.1, b.1), r.2);
    mix(mix(c00, c10, g.2), mix(c01, c11, g.2), b.2)
}

fn apply_curve(curve: &GpuCurve<HeadlessRenderer>, rgb: [f32; 3]) -> [f32; 3] {
    match curve {
        GpuCurve::Identity => rgb,
        GpuCurve::Parametric(curve) => [curve.eval(0, rgb[0]), curve.eval(1, rgb[1]), curve.eval(2, rgb[2])],
        GpuCurve::Lut {
            texture,
            scale,
            offset,
        } => [
            sample_lut_1d(texture, 0, rgb[0], *scale, *offset),
            sample_lut_1d(texture, 1, rgb[1], *scale, *offset),
            sample_lut_1d(texture, 2, rgb[2], *scale, *offset),
        ],
    }
}

fn apply_mapping(mapping: &GpuMapping<HeadlessRenderer>, rgb: [f32; 3]) -> [f32; 3] {
    match mapping {
        GpuMapping::Identity => rgb,
        GpuMapping::Matrix { matrix, offset } => {
            let mapped = *matrix * Vector3::new(rgb[0], rgb[1], rgb[2]) + *offset;
            [mapped.x, mapped.y, mapped.z]
        }
        GpuMapping::Lut3d {
            texture,
            scale,
            offset,
        } => sample_lut_3d(texture, rgb, *scale, *offset),
    }
}

/// Run a premultiplied color through a color transform
pub(super) fn apply_color(color: &GpuColorTransform<HeadlessRenderer>, rgba: [f32; 4]) -> [f32; 4] {
    if color.is_identity() {
        return rgba;
    }
    let alpha = rgba[3];
    let rgb = if alpha > 0.0 {
        [rgba[0] / alpha, rgba[1] / alpha, rgba[2] / alpha]
    } else {
        [0.0; 3]
    };
    let rgb = apply_curve(color.pre_curve(), rgb);
    let rgb = apply_mapping(color.mapping(), rgb);
    let rgb = apply_curve(color.post_curve(), rgb);
    [rgb[0] * alpha, rgb[1] * alpha, rgb[2] * alpha, alpha]
}

fn over(src: [f32; 4], dst: [f32; 4]) -> [f32; 4] {
    let keep = 1.0 - src[3];
    [
        src[0] + dst[0] * keep,
        src[1] + dst[1] * keep,
        src[2] + dst[2] * keep,
        src[3] + dst[3] * keep,
    ]
}

/// Pixels of `damage` clipped to `bounds`
fn pixels(
    damage: &[Rectangle<i32, Physical>],
    bounds: Rectangle<i32, Physical>,
) -> impl Iterator<Item = (i32, i32)> + '_ {
    damage
        .iter()
        .filter_map(move |rect| rect.intersection(bounds))
        .flat_map(|rect| {
            (rect.loc.y..rect.loc.y + rect.size.h)
                .flat_map(move |y| (rect.loc.x..rect.loc.x + rect.size.w).map(move |x| (x, y)))
        })
}

/// Fill `damage` of a framebuffer with a solid color
pub(super) fn clear(target: &HeadlessFramebuffer, color: Color32F, damage: &[Rectangle<i32, Physical>]) {
    let bounds = Rectangle::from_size(target.size());
    let value = target.quantize(color.components());
    let mut store = target.pixels().borrow_mut();
    for (x, y) in pixels(damage, bounds) {
        store[(y * target.size().w + x) as usize] = value;
    }
}

/// Evaluate a draw call for every damaged pixel of `call.dst`
pub(super) fn draw(target: &HeadlessFramebuffer, call: &DrawCall<'_, HeadlessRenderer>) {
    let planes: SmallVec<[Tap<'_>; 3]> = call
        .planes
        .iter()
        .map(|plane| (plane.texture(), plane.bind_plane().hsub, plane.bind_plane().vsub))
        .collect();
    let Some(bounds) = Rectangle::from_size(target.size()).intersection(call.dst) else {
        return;
    };

    let inverse = call.transform.invert();
    let unit = Size::<f64, BufferCoords>::from((1.0, 1.0));
    let dst = call.dst.to_f64();
    let tint = call.tint.map(Color32F::components);

    let mut store = target.pixels().borrow_mut();
    for (x, y) in pixels(call.damage, bounds) {
        let u = (x as f64 + 0.5 - dst.loc.x) / dst.size.w;
        let v = (y as f64 + 0.5 - dst.loc.y) / dst.size.h;
        let uv = inverse.transform_point_in(Point::<f64, BufferCoords>::from((u, v)), &unit);
        let v = if call.y_inverted { 1.0 - uv.y } else { uv.y };
        let bx = call.src.loc.x + uv.x * call.src.size.w;
        let by = call.src.loc.y + v * call.src.size.h;

        let mut color = reassemble(&planes, call.variant, &call.yuv, bx, by);
        color = apply_color(call.color, color);
        if let Some(tint) = tint {
            color = over(tint, color);
        }
        let color = color.map(|c| c * call.alpha);

        let idx = (y * target.size().w + x) as usize;
        let result = if call.blend { over(color, store[idx]) } else { color };
        store[idx] = target.quantize(result);
    }
}

/// Copy `damage` of `src` into `dst` at `offset`, through a color transform
pub(super) fn blit(
    src: &HeadlessFramebuffer,
    dst: &HeadlessFramebuffer,
    offset: Point<i32, Physical>,
    damage: &[Rectangle<i32, Physical>],
    color: &GpuColorTransform<HeadlessRenderer>,
) {
    let source = src.pixels().borrow();
    let mut store = dst.pixels().borrow_mut();
    let dst_bounds = Rectangle::from_size(dst.size());
    for (x, y) in pixels(damage, Rectangle::from_size(src.size())) {
        let (tx, ty) = (x + offset.x, y + offset.y);
        if !dst_bounds.contains((tx, ty)) {
            continue;
        }
        let value = apply_color(color, source[(y * src.size().w + x) as usize]);
        store[(ty * dst.size().w + tx) as usize] = dst.quantize(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lut_positions_hit_entries_exactly() {
        let len = 4;
        let scale = (len as f32 - 1.0) / len as f32;
        let offset = 0.5 / len as f32;
        for i in 0..len {
            let (low, _, t) = lut_position(i as f32 / (len - 1) as f32, scale, offset, len);
            assert_eq!(low + t.round() as usize, i);
            assert!(t.abs() < 1e-4 || (1.0 - t).abs() < 1e-4);
        }
        // outside of the table values are clamped
        assert_eq!(lut_position(-1.0, scale, offset, len), (0, 1, 0.0));
        assert_eq!(lut_position(2.0, scale, offset, len).0, 3);
    }

    #[test]
    fn blending_is_premultiplied_over() {
        let result = over([0.25, 0.0, 0.0, 0.5], [0.0, 1.0, 0.0, 1.0]);
        assert_eq!(result, [0.25, 0.5, 0.0, 1.0]);
    }
}
