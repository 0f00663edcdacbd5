//! Abstract color transformations
//!
//! A [`ColorTransform`] describes how content is converted from one color encoding into
//! another in three stages: a per-channel pre-curve, a color mapping and a per-channel
//! post-curve. Each stage may be an identity, a parametric function or a sampled lookup
//! table.
//!
//! Transformations are device independent. A [`ColorPipeline`](crate::backend::renderer::color::ColorPipeline)
//! turns them into device resources and keeps those around until the transformation is
//! dropped, which is announced through [`ColorTransform::destroy_signal`].

use std::{
    fmt,
    rc::{Rc, Weak},
};

use cgmath::{Matrix3, Vector3};
use tracing::debug;

use crate::utils::{ids::id_gen, Signaler};

/// Amount of samples taken from a [`Curve`] for a 1D lookup table
pub const _1D_POINTS: usize = 1024;
/// Amount of samples per axis taken from a [`MappingLUT`] for a 3D lookup table
pub const _3D_POINTS: usize = 33;

/// Per-channel curve sampled into a lookup table
pub trait Curve: fmt::Debug {
    /// Fill `lut` with the curve evaluated at `i / (lut.len() - 1)` for every index `i`
    fn fill_in(&self, lut: &mut [f32]);
}

/// Color mapping sampled into a 3D lookup table
pub trait MappingLUT: fmt::Debug {
    /// Fill `lut` with `len³` rgb triplets
    ///
    /// The triplet for input `(r, g, b)` lives at index `(b * len + g) * len + r`,
    /// inputs are sampled at `i / (len - 1)`.
    fn fill_in(&self, lut: &mut [f32], len: usize);
}

/// A [`Curve`] evaluating a plain function
#[derive(Clone)]
pub struct FnCurve<F>(pub F);

impl<F> fmt::Debug for FnCurve<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnCurve").finish_non_exhaustive()
    }
}

impl<F: Fn(f32) -> f32> Curve for FnCurve<F> {
    fn fill_in(&self, lut: &mut [f32]) {
        let last = lut.len().saturating_sub(1).max(1) as f32;
        for (i, value) in lut.iter_mut().enumerate() {
            *value = (self.0)(i as f32 / last);
        }
    }
}

/// A [`MappingLUT`] evaluating a plain function
#[derive(Clone)]
pub struct FnMapping<F>(pub F);

impl<F> fmt::Debug for FnMapping<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnMapping").finish_non_exhaustive()
    }
}

impl<F: Fn([f32; 3]) -> [f32; 3]> MappingLUT for FnMapping<F> {
    fn fill_in(&self, lut: &mut [f32], len: usize) {
        let last = len.saturating_sub(1).max(1) as f32;
        for b in 0..len {
            for g in 0..len {
                for r in 0..len {
                    let idx = ((b * len + g) * len + r) * 3;
                    let out = (self.0)([r as f32 / last, g as f32 / last, b as f32 / last]);
                    lut[idx..idx + 3].copy_from_slice(&out);
                }
            }
        }
    }
}

/// Shape of a [`ParametricCurve`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParametricKind {
    /// `y = c·x` below `d`, otherwise `(a·x + b)^g`
    LinPow,
    /// `y = c·x` below `d`, otherwise `a·x^g + b`
    PowLin,
}

/// Coefficients of a single channel of a [`ParametricCurve`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CurveParams {
    /// Exponent
    pub g: f32,
    /// Scale of the power segment
    pub a: f32,
    /// Offset of the power segment
    pub b: f32,
    /// Slope of the linear segment
    pub c: f32,
    /// Break point between the segments
    pub d: f32,
}

impl CurveParams {
    /// Evaluate the curve of the given shape at `x`
    ///
    /// Negative inputs are mirrored around zero.
    pub fn eval(&self, kind: ParametricKind, x: f32) -> f32 {
        let magnitude = x.abs();
        let y = if magnitude < self.d {
            self.c * magnitude
        } else {
            match kind {
                ParametricKind::LinPow => (self.a * magnitude + self.b).max(0.0).powf(self.g),
                ParametricKind::PowLin => self.a * magnitude.powf(self.g) + self.b,
            }
        };
        y.copysign(x)
    }
}

/// Per-channel parametric transfer function
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParametricCurve {
    /// Shape of the curve
    pub kind: ParametricKind,
    /// Coefficients for the red, green and blue channel
    pub params: [CurveParams; 3],
    /// Clamp input to `[0, 1]` before evaluation
    pub clamped_input: bool,
}

impl ParametricCurve {
    fn uniform(kind: ParametricKind, params: CurveParams) -> ParametricCurve {
        ParametricCurve {
            kind,
            params: [params; 3],
            clamped_input: false,
        }
    }

    /// sRGB electro-optical transfer function, decoding to linear light
    pub fn srgb_eotf() -> ParametricCurve {
        Self::uniform(
            ParametricKind::LinPow,
            CurveParams {
                g: 2.4,
                a: 1.0 / 1.055,
                b: 0.055 / 1.055,
                c: 1.0 / 12.92,
                d: 0.04045,
            },
        )
    }

    /// Inverse of [`ParametricCurve::srgb_eotf`], encoding linear light
    pub fn srgb_inverse_eotf() -> ParametricCurve {
        Self::uniform(
            ParametricKind::PowLin,
            CurveParams {
                g: 1.0 / 2.4,
                a: 1.055,
                b: -0.055,
                c: 12.92,
                d: 0.003_130_8,
            },
        )
    }

    /// Pure power curve `y = x^gamma`
    pub fn gamma(gamma: f32) -> ParametricCurve {
        Self::uniform(
            ParametricKind::PowLin,
            CurveParams {
                g: gamma,
                a: 1.0,
                b: 0.0,
                c: 0.0,
                d: 0.0,
            },
        )
    }

    /// ITU-R BT.709 opto-electronic transfer function
    pub fn bt709_oetf() -> ParametricCurve {
        Self::uniform(
            ParametricKind::PowLin,
            CurveParams {
                g: 0.45,
                a: 1.099,
                b: -0.099,
                c: 4.5,
                d: 0.018,
            },
        )
    }

    /// Evaluate the curve of `channel` at `x`
    pub fn eval(&self, channel: usize, x: f32) -> f32 {
        let x = if self.clamped_input { x.clamp(0.0, 1.0) } else { x };
        self.params[channel].eval(self.kind, x)
    }
}

/// A per-channel stage of a [`ColorTransform`]
#[derive(Debug, Default)]
pub enum CurveStage {
    /// Channels pass through unchanged
    #[default]
    Identity,
    /// Channels are mapped through a parametric function
    Parametric(ParametricCurve),
    /// Channels are mapped through sampled curves, one per channel
    Lut([Box<dyn Curve>; 3]),
}

impl CurveStage {
    /// Use the same sampled curve for all three channels
    pub fn lut<C: Curve + Clone + 'static>(curve: C) -> CurveStage {
        CurveStage::Lut([Box::new(curve.clone()), Box::new(curve.clone()), Box::new(curve)])
    }

    /// Returns true for the identity stage
    pub fn is_identity(&self) -> bool {
        matches!(self, CurveStage::Identity)
    }
}

/// The mapping stage of a [`ColorTransform`]
#[derive(Debug, Default)]
pub enum Mapping {
    /// Colors pass through unchanged
    #[default]
    Identity,
    /// Colors are mapped by `matrix * rgb + offset`
    Matrix {
        /// The linear part of the mapping
        matrix: Matrix3<f32>,
        /// Constant added after the multiplication
        offset: Vector3<f32>,
    },
    /// Colors are mapped through a sampled 3D lookup table
    Lut(Box<dyn MappingLUT>),
}

impl Mapping {
    /// Linear mapping given in row-major order
    pub fn from_rows(rows: [[f32; 3]; 3]) -> Mapping {
        Mapping::Matrix {
            matrix: Matrix3::new(
                rows[0][0], rows[1][0], rows[2][0], rows[0][1], rows[1][1], rows[2][1], rows[0][2], rows[1][2],
                rows[2][2],
            ),
            offset: Vector3::new(0.0, 0.0, 0.0),
        }
    }

    /// Conversion of linear BT.709 primaries into linear BT.2020 primaries
    pub fn bt709_to_bt2020() -> Mapping {
        Mapping::from_rows([
            [0.627_404, 0.329_283, 0.043_313],
            [0.069_097, 0.919_540, 0.011_362],
            [0.016_391, 0.088_013, 0.895_595],
        ])
    }

    /// Returns true for the identity mapping
    pub fn is_identity(&self) -> bool {
        matches!(self, Mapping::Identity)
    }
}

/// Event sent once a [`ColorTransform`] is destroyed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColorTransformDestroyed {
    /// Id of the destroyed transformation
    pub id: usize,
}

id_gen!(color_transform_id);

#[derive(Debug)]
struct ColorTransformInner {
    id: usize,
    pre_curve: CurveStage,
    mapping: Mapping,
    post_curve: CurveStage,
    destroy: Signaler<ColorTransformDestroyed>,
}

impl Drop for ColorTransformInner {
    fn drop(&mut self) {
        debug!(id = self.id, "color transform destroyed");
        self.destroy.send_event(&ColorTransformDestroyed { id: self.id });
    }
}

/// Device independent description of a color transformation
///
/// Clones refer to the same transformation. Once the last clone is dropped the
/// [`destroy_signal`](ColorTransform::destroy_signal) fires.
#[derive(Debug, Clone)]
pub struct ColorTransform(Rc<ColorTransformInner>);

impl PartialEq for ColorTransform {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

/// Weak reference to a [`ColorTransform`]
#[derive(Debug, Clone)]
pub struct WeakColorTransform(Weak<ColorTransformInner>);

impl WeakColorTransform {
    /// Try to get the transformation back
    pub fn upgrade(&self) -> Option<ColorTransform> {
        self.0.upgrade().map(ColorTransform)
    }
}

/// Builder for [`ColorTransform`]s
///
/// Stages not set are identities.
#[derive(Debug, Default)]
pub struct ColorTransformBuilder {
    pre_curve: CurveStage,
    mapping: Mapping,
    post_curve: CurveStage,
}

impl ColorTransformBuilder {
    /// Set the pre-curve
    pub fn pre_curve(mut self, stage: CurveStage) -> Self {
        self.pre_curve = stage;
        self
    }

    /// Set the mapping
    pub fn mapping(mut self, mapping: Mapping) -> Self {
        self.mapping = mapping;
        self
    }

    /// Set the post-curve
    pub fn post_curve(mut self, stage: CurveStage) -> Self {
        self.post_curve = stage;
        self
    }

    /// Create the transformation
    pub fn build(self) -> ColorTransform {
        let id = color_transform_id::next();
        debug!(id, "color transform created");
        ColorTransform(Rc::new(ColorTransformInner {
            id,
            pre_curve: self.pre_curve,
            mapping: self.mapping,
            post_curve: self.post_curve,
            destroy: Signaler::new(),
        }))
    }
}

impl ColorTransform {
    /// Start building a new transformation
    pub fn builder() -> ColorTransformBuilder {
        ColorTransformBuilder::default()
    }

    /// A transformation leaving colors unchanged
    pub fn identity() -> ColorTransform {
        Self::builder().build()
    }

    /// Unique id of this transformation
    pub fn id(&self) -> usize {
        self.0.id
    }

    /// The per-channel stage applied first
    pub fn pre_curve(&self) -> &CurveStage {
        &self.0.pre_curve
    }

    /// The color mapping stage
    pub fn mapping(&self) -> &Mapping {
        &self.0.mapping
    }

    /// The per-channel stage applied last
    pub fn post_curve(&self) -> &CurveStage {
        &self.0.post_curve
    }

    /// Returns true if every stage is an identity
    pub fn is_identity(&self) -> bool {
        self.0.pre_curve.is_identity() && self.0.mapping.is_identity() && self.0.post_curve.is_identity()
    }

    /// Signal fired once this transformation is destroyed
    pub fn destroy_signal(&self) -> &Signaler<ColorTransformDestroyed> {
        &self.0.destroy
    }

    /// Create a weak reference to this transformation
    pub fn downgrade(&self) -> WeakColorTransform {
        WeakColorTransform(Rc::downgrade(&self.0))
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::Cell, rc::Rc};

    use super::*;

    #[test]
    fn srgb_curves_invert_each_other() {
        let eotf = ParametricCurve::srgb_eotf();
        let oetf = ParametricCurve::srgb_inverse_eotf();
        for i in 0..=20 {
            let x = i as f32 / 20.0;
            let roundtrip = oetf.eval(0, eotf.eval(0, x));
            assert!((roundtrip - x).abs() < 1e-4, "{} -> {}", x, roundtrip);
        }
        assert_eq!(eotf.eval(1, 0.0), 0.0);
        assert!((eotf.eval(2, 1.0) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn curves_mirror_negative_input() {
        let curve = ParametricCurve::gamma(2.2);
        assert!((curve.eval(0, -0.5) + 0.5f32.powf(2.2)).abs() < 1e-6);

        let clamped = ParametricCurve {
            clamped_input: true,
            ..curve
        };
        assert_eq!(clamped.eval(0, -0.5), 0.0);
    }

    #[test]
    fn fn_curve_samples_endpoints() {
        let mut lut = [0.0; 5];
        FnCurve(|x: f32| x * 2.0).fill_in(&mut lut);
        assert_eq!(lut, [0.0, 0.5, 1.0, 1.5, 2.0]);
    }

    #[test]
    fn fn_mapping_uses_red_major_layout() {
        let mut lut = vec![0.0; 2 * 2 * 2 * 3];
        FnMapping(|rgb: [f32; 3]| rgb).fill_in(&mut lut, 2);
        // (r=1, g=0, b=1) lives at (1 * 2 + 0) * 2 + 1
        assert_eq!(&lut[5 * 3..6 * 3], &[1.0, 0.0, 1.0]);
    }

    #[test]
    fn destroy_signal_fires_once_on_last_drop() {
        let fired = Rc::new(Cell::new(0));
        let transform = ColorTransform::builder()
            .pre_curve(CurveStage::Parametric(ParametricCurve::srgb_eotf()))
            .build();
        let id = transform.id();
        let counter = fired.clone();
        transform.destroy_signal().register(move |event: &ColorTransformDestroyed| {
            assert_eq!(event.id, id);
            counter.set(counter.get() + 1);
        });

        let weak = transform.downgrade();
        let clone = transform.clone();
        drop(transform);
        assert_eq!(fired.get(), 0);
        drop(clone);
        assert_eq!(fired.get(), 1);
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn identity_detection() {
        assert!(ColorTransform::identity().is_identity());
        assert!(!ColorTransform::builder()
            .mapping(Mapping::bt709_to_bt2020())
            .build()
            .is_identity());
        assert_ne!(ColorTransform::identity().id(), ColorTransform::identity().id());
    }
}
