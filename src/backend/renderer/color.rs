//! Colors and device side color transformations

use std::{cell::RefCell, collections::HashMap, fmt, ops::Mul, rc::Rc};

use cgmath::{Matrix3, Vector3};
use tracing::{debug, instrument, trace, warn};

use super::{Renderer, RendererError};
use crate::{
    backend::color::{
        ColorTransform, ColorTransformDestroyed, CurveStage, Mapping, ParametricCurve, WeakColorTransform,
        _1D_POINTS, _3D_POINTS,
    },
    utils::HookId,
};

/// A four-component color representing pre-multiplied RGBA color values
#[derive(Debug, Copy, Clone, Default, PartialEq)]
pub struct Color32F([f32; 4]);

impl Color32F {
    /// Initialize a new [`Color32F`]
    #[inline]
    pub const fn new(r: f32, g: f32, b: f32, a: f32) -> Self {
        Self([r, g, b, a])
    }

    /// Transparent color
    pub const TRANSPARENT: Color32F = Color32F::new(0.0, 0.0, 0.0, 0.0);

    /// Solid black color
    pub const BLACK: Color32F = Color32F::new(0f32, 0f32, 0f32, 1f32);

    /// Red color component
    #[inline]
    pub fn r(&self) -> f32 {
        self.0[0]
    }

    /// Green color component
    #[inline]
    pub fn g(&self) -> f32 {
        self.0[1]
    }

    /// Blue color component
    #[inline]
    pub fn b(&self) -> f32 {
        self.0[2]
    }

    /// Alpha color component
    #[inline]
    pub fn a(&self) -> f32 {
        self.0[3]
    }

    /// Color components
    #[inline]
    pub fn components(self) -> [f32; 4] {
        self.0
    }

    /// Test if the color represents a opaque color
    #[inline]
    pub fn is_opaque(&self) -> bool {
        self.a() == 1f32
    }
}

impl From<[f32; 4]> for Color32F {
    #[inline]
    fn from(value: [f32; 4]) -> Self {
        Self(value)
    }
}

impl Mul<f32> for Color32F {
    type Output = Color32F;

    #[inline]
    fn mul(self, rhs: f32) -> Self::Output {
        Self::new(self.r() * rhs, self.g() * rhs, self.b() * rhs, self.a() * rhs)
    }
}

/// Device side per-channel stage
#[derive(Debug)]
pub enum GpuCurve<R: Renderer + ?Sized> {
    /// Channels pass through unchanged
    Identity,
    /// Coefficients evaluated by the shader
    Parametric(ParametricCurve),
    /// Sampled curves, one row per channel
    Lut {
        /// Lookup table with four rows
        texture: R::LutId,
        /// Scale applied to the input before sampling
        scale: f32,
        /// Offset applied to the input after scaling
        offset: f32,
    },
}

/// Device side mapping stage
#[derive(Debug)]
pub enum GpuMapping<R: Renderer + ?Sized> {
    /// Colors pass through unchanged
    Identity,
    /// `matrix * rgb + offset`
    Matrix {
        /// The linear part of the mapping
        matrix: Matrix3<f32>,
        /// Constant added after the multiplication
        offset: Vector3<f32>,
    },
    /// Sampled 3D lookup table
    Lut3d {
        /// The lookup table
        texture: R::LutId,
        /// Scale applied to the input before sampling
        scale: f32,
        /// Offset applied to the input after scaling
        offset: f32,
    },
}

/// A [`ColorTransform`] with its lookup tables uploaded to a device
pub struct GpuColorTransform<R: Renderer + ?Sized> {
    pre_curve: GpuCurve<R>,
    mapping: GpuMapping<R>,
    post_curve: GpuCurve<R>,
}

impl<R: Renderer + ?Sized> fmt::Debug for GpuColorTransform<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GpuColorTransform")
            .field("pre_curve", &self.pre_curve)
            .field("mapping", &self.mapping)
            .field("post_curve", &self.post_curve)
            .finish()
    }
}

impl<R: Renderer + ?Sized> GpuColorTransform<R> {
    /// A transformation leaving colors unchanged
    pub fn identity() -> Self {
        GpuColorTransform {
            pre_curve: GpuCurve::Identity,
            mapping: GpuMapping::Identity,
            post_curve: GpuCurve::Identity,
        }
    }

    /// Returns true if every stage is an identity
    pub fn is_identity(&self) -> bool {
        matches!(self.pre_curve, GpuCurve::Identity)
            && matches!(self.mapping, GpuMapping::Identity)
            && matches!(self.post_curve, GpuCurve::Identity)
    }

    /// The per-channel stage applied first
    pub fn pre_curve(&self) -> &GpuCurve<R> {
        &self.pre_curve
    }

    /// The mapping stage
    pub fn mapping(&self) -> &GpuMapping<R> {
        &self.mapping
    }

    /// The per-channel stage applied last
    pub fn post_curve(&self) -> &GpuCurve<R> {
        &self.post_curve
    }
}

fn lut_scale_offset(len: usize) -> (f32, f32) {
    ((len as f32 - 1.0) / len as f32, 0.5 / len as f32)
}

fn upload_curve<R: Renderer>(renderer: &mut R, stage: &CurveStage) -> Result<GpuCurve<R>, R::Error> {
    Ok(match stage {
        CurveStage::Identity => GpuCurve::Identity,
        CurveStage::Parametric(curve) => GpuCurve::Parametric(*curve),
        CurveStage::Lut(curves) => {
            let len = _1D_POINTS;
            // four rows, the last one stays unused
            let mut lut = vec![0f32; len * 4];
            for (row, curve) in curves.iter().enumerate() {
                curve.fill_in(&mut lut[row * len..(row + 1) * len]);
            }
            let texture = renderer.create_lut_1d(len, 4, &lut)?;
            let (scale, offset) = lut_scale_offset(len);
            GpuCurve::Lut {
                texture,
                scale,
                offset,
            }
        }
    })
}

fn upload_mapping<R: Renderer>(renderer: &mut R, mapping: &Mapping) -> Result<GpuMapping<R>, R::Error> {
    Ok(match mapping {
        Mapping::Identity => GpuMapping::Identity,
        Mapping::Matrix { matrix, offset } => GpuMapping::Matrix {
            matrix: *matrix,
            offset: *offset,
        },
        Mapping::Lut(lut) => {
            let len = _3D_POINTS;
            let mut data = vec![0f32; len * len * len * 3];
            lut.fill_in(&mut data, len);
            let texture = renderer.create_lut_3d(len, &data)?;
            let (scale, offset) = lut_scale_offset(len);
            GpuMapping::Lut3d {
                texture,
                scale,
                offset,
            }
        }
    })
}

struct CacheEntry<R: Renderer> {
    transform: Rc<GpuColorTransform<R>>,
    owner: WeakColorTransform,
    hook: HookId,
}

type Cache<R> = Rc<RefCell<HashMap<usize, CacheEntry<R>>>>;

/// Cache of device side color transformations
///
/// Entries are keyed by [`ColorTransform::id`] and dropped as soon as their
/// transformation is destroyed. Dropping the pipeline frees all entries.
pub struct ColorPipeline<R: Renderer> {
    identity: Rc<GpuColorTransform<R>>,
    cache: Cache<R>,
    span: tracing::Span,
}

impl<R: Renderer> fmt::Debug for ColorPipeline<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ColorPipeline")
            .field("entries", &self.cache.borrow().len())
            .finish_non_exhaustive()
    }
}

impl<R: Renderer + 'static> Default for ColorPipeline<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: Renderer + 'static> ColorPipeline<R> {
    /// Create an empty pipeline
    pub fn new() -> Self {
        ColorPipeline {
            identity: Rc::new(GpuColorTransform::identity()),
            cache: Rc::new(RefCell::new(HashMap::new())),
            span: tracing::info_span!("color_pipeline"),
        }
    }

    /// The identity transformation shared by all users of this pipeline
    pub fn identity(&self) -> Rc<GpuColorTransform<R>> {
        self.identity.clone()
    }

    /// Number of cached transformations
    pub fn len(&self) -> usize {
        self.cache.borrow().len()
    }

    /// Returns true if nothing is cached
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get the device side resources of a transformation, creating them if necessary
    ///
    /// If the device runs out of resources the identity is cached for the transformation
    /// instead and a warning is logged.
    #[instrument(level = "trace", parent = &self.span, skip(self, renderer, transform), fields(id = transform.id()))]
    #[profiling::function]
    pub fn resolve(
        &self,
        renderer: &mut R,
        transform: &ColorTransform,
    ) -> Result<Rc<GpuColorTransform<R>>, R::Error> {
        if transform.is_identity() {
            return Ok(self.identity.clone());
        }

        let id = transform.id();
        if let Some(entry) = self.cache.borrow().get(&id) {
            trace!("cache hit");
            return Ok(entry.transform.clone());
        }

        let gpu = if matches!(transform.mapping(), Mapping::Lut(_)) && !renderer.capabilities().lut_3d() {
            warn!(id, "Device cannot sample 3D lookup tables, using identity color transform");
            self.identity.clone()
        } else {
            match Self::upload(renderer, transform) {
                Ok(gpu) => Rc::new(gpu),
                Err(err) if err.is_resource_exhaustion() => {
                    warn!(id, ?err, "Out of device resources for color transform, using identity");
                    self.identity.clone()
                }
                Err(err) => return Err(err),
            }
        };

        let cache = Rc::downgrade(&self.cache);
        let hook = transform
            .destroy_signal()
            .register(move |event: &ColorTransformDestroyed| {
                if let Some(cache) = cache.upgrade() {
                    let removed = cache.borrow_mut().remove(&event.id);
                    if removed.is_some() {
                        debug!(id = event.id, "dropping cached color transform");
                    }
                    // device resources are released here, outside of the borrow
                    drop(removed);
                }
            });

        debug!(id, "caching color transform");
        self.cache.borrow_mut().insert(
            id,
            CacheEntry {
                transform: gpu.clone(),
                owner: transform.downgrade(),
                hook,
            },
        );
        Ok(gpu)
    }

    fn upload(renderer: &mut R, transform: &ColorTransform) -> Result<GpuColorTransform<R>, R::Error> {
        Ok(GpuColorTransform {
            pre_curve: upload_curve(renderer, transform.pre_curve())?,
            mapping: upload_mapping(renderer, transform.mapping())?,
            post_curve: upload_curve(renderer, transform.post_curve())?,
        })
    }
}

impl<R: Renderer> Drop for ColorPipeline<R> {
    fn drop(&mut self) {
        let entries: Vec<_> = self.cache.borrow_mut().drain().map(|(_, entry)| entry).collect();
        for entry in entries {
            if let Some(owner) = entry.owner.upgrade() {
                owner.destroy_signal().unregister(entry.hook);
            }
        }
    }
}
