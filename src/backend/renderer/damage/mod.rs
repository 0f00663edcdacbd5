//! Damage tracked repainting of outputs
//!
//! # Why use this implementation
//!
//! The [`OutputRenderer`] repaints only what changed on an output. It keeps track of the
//! last [`CommitCounter`](super::surface::CommitCounter) rendered for every surface and
//! asks the surface for the damage since then. Additionally damage is generated for
//! - surfaces entering the output or changing their geometry, alpha or stacking
//! - surfaces no longer present
//! - changes to the output itself (mode, transform, scale, color transform)
//!
//! Every pass renders into a renderbuffer, which is one of
//! - a window buffer of a [`PresentationSurface`], reused according to its buffer age
//! - client memory supplied with [`OutputRenderer::add_client_target`], read back after drawing
//! - a dmabuf supplied with [`OutputRenderer::add_external_target`], handed off with a fence
//!
//! Each renderbuffer accumulates the damage of all passes since it was drawn last, so
//! drawing the accumulated damage brings it up to date.
//!
//! Surfaces are drawn back to front. Opaque parts are drawn with blending disabled.
//! If the output has a color transform and the device supports floating point render
//! targets, the content is blended in a shadow buffer first and converted while copying
//! into the renderbuffer.
//!
//! # How to use it
//!
//! ```
//! # extern crate kiln;
//! use kiln::{
//!     backend::{
//!         allocator::{shm::{ShmBuffer, ShmPool}, Fourcc},
//!         renderer::{
//!             damage::{OutputRenderer, RenderTarget},
//!             headless::{HeadlessConfig, HeadlessRenderer, HeadlessSurface},
//!             import::ClientBuffer,
//!             surface::{Attach, RenderSurface, SurfaceState},
//!         },
//!     },
//!     output::{Mode, Output, OutputConfig},
//!     utils::Rectangle,
//! };
//!
//! let mut renderer = HeadlessRenderer::new(HeadlessConfig::default());
//! let output = Output::new(OutputConfig::new("headless", Mode { size: (64, 64).into(), refresh: 60_000 }));
//! let mut window = HeadlessSurface::new(&renderer, output.framebuffer_size(), Fourcc::Xrgb8888, 2);
//! let mut output_renderer = OutputRenderer::new(output);
//!
//! let pool = ShmPool::create("client", 16 * 16 * 4).unwrap();
//! let mut state = SurfaceState::new();
//! state.commit(
//!     Some(Attach::new(ClientBuffer::shm(ShmBuffer::new(&pool, 0, (16, 16), 64, Fourcc::Argb8888)))),
//!     [],
//! );
//!
//! let mut surfaces = [RenderSurface::new(&mut state, Rectangle::from_loc_and_size((8, 8), (16, 16)))];
//! // both window buffers start out undefined and are drawn fully
//! for _ in 0..2 {
//!     let result = output_renderer
//!         .render_output(&mut renderer, RenderTarget::Window(&mut window), &mut surfaces)
//!         .expect("failed to render the output");
//!     assert!(result.damage.is_some());
//! }
//!
//! // the first buffer is up to date, nothing changed since
//! let result = output_renderer
//!     .render_output(&mut renderer, RenderTarget::Window(&mut window), &mut surfaces)
//!     .unwrap();
//! assert!(result.is_skipped());
//! ```

use std::{collections::HashSet, fmt, rc::Rc, time::Duration};

use indexmap::IndexMap;
use smallvec::SmallVec;
use tracing::{debug, info_span, instrument, trace, warn};

use super::{
    capture::{self, CaptureCallback, CaptureError, CaptureSource, Captures, FenceScheduler},
    color::{Color32F, ColorPipeline, GpuColorTransform},
    import::{import_buffer, ClientBuffer, ImportError, ImportedBuffer},
    surface::{CommitCounter, RenderSurface},
    sync::{SyncError, SyncPoint},
    DebugFlags, DrawCall, Framebuffer, Renderer,
};
use crate::{
    backend::{
        allocator::{dmabuf::Dmabuf, format, shm::ShmBuffer, Buffer, Fourcc},
        color::ColorTransform,
        SwapBuffersError,
    },
    output::{Mode, Output},
    utils::{Buffer as BufferCoords, Logical, Physical, Point, Rectangle, Region, Size, Transform},
};

mod renderbuffer;

pub use self::renderbuffer::{border_rect, BorderSide, BorderStatus, ExternalTarget, RenderbufferId};
use self::renderbuffer::{Renderbuffer, RenderbufferKind};

/// Maximum amount of window renderbuffers kept per output
pub const MAX_AGE: usize = 4;

/// Consecutive submission failures after which repainting gives up
pub const MAX_SUBMIT_FAILURES: usize = 3;

const READBACK_TIMEOUT: Duration = Duration::from_millis(100);
const SHADOW_FORMAT: Fourcc = Fourcc::Abgr16161616f;
const TINT: Color32F = Color32F::new(0.0, 0.2, 0.0, 0.2);

/// A display surface rotating through window buffers
pub trait PresentationSurface<R: Renderer> {
    /// Age of the current back buffer
    ///
    /// `Some(0)` means the content is undefined, [`None`] that ages are not supported.
    fn buffer_age(&self) -> Option<usize>;

    /// Returns true if [`present`](PresentationSurface::present) makes use of damage
    fn supports_partial_update(&self) -> bool;

    /// The framebuffer to draw the next frame into
    fn back_buffer(&mut self, renderer: &mut R) -> Result<R::Framebuffer, R::Error>;

    /// Show the back buffer, `damage` lists the changed rectangles if known
    fn present(
        &mut self,
        renderer: &mut R,
        damage: Option<&[Rectangle<i32, Physical>]>,
    ) -> Result<(), SwapBuffersError>;

    /// Change the size of the window buffers, discarding their contents
    fn resize(&mut self, size: Size<i32, Physical>);
}

/// Where a repaint pass draws into
pub enum RenderTarget<'a, R: Renderer> {
    /// The back buffer of a window surface
    Window(&'a mut dyn PresentationSurface<R>),
    /// A renderbuffer added with [`OutputRenderer::add_client_target`] or
    /// [`OutputRenderer::add_external_target`]
    Buffer(RenderbufferId),
}

impl<'a, R: Renderer> fmt::Debug for RenderTarget<'a, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RenderTarget::Window(surface) => f
                .debug_struct("Window")
                .field("buffer_age", &surface.buffer_age())
                .finish_non_exhaustive(),
            RenderTarget::Buffer(id) => f.debug_tuple("Buffer").field(id).finish(),
        }
    }
}

/// Errors thrown by [`OutputRenderer::render_output`]
#[derive(thiserror::Error)]
pub enum RepaintError<R: Renderer> {
    /// The provided [`Renderer`] returned an error
    #[error(transparent)]
    Rendering(R::Error),
    /// Handing the frame to its consumer failed, damage is kept for the next pass
    #[error(transparent)]
    Submit(#[from] SwapBuffersError),
    /// Submission failed too often in a row
    #[error("Submission failed {0} times in a row")]
    SubmitExhausted(usize),
    /// The renderbuffer was discarded
    #[error("Renderbuffer {0:?} is stale")]
    StaleRenderbuffer(RenderbufferId),
    /// The target can not be used for this output
    #[error("Invalid render target: {0}")]
    InvalidTarget(String),
}

impl<R: Renderer> fmt::Debug for RepaintError<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RepaintError::Rendering(err) => fmt::Debug::fmt(err, f),
            RepaintError::Submit(err) => fmt::Debug::fmt(err, f),
            RepaintError::SubmitExhausted(count) => f.debug_tuple("SubmitExhausted").field(count).finish(),
            RepaintError::StaleRenderbuffer(id) => f.debug_tuple("StaleRenderbuffer").field(id).finish(),
            RepaintError::InvalidTarget(reason) => f.debug_tuple("InvalidTarget").field(reason).finish(),
        }
    }
}

/// Represents the result from rendering the output
#[derive(Debug)]
pub struct RenderOutputResult {
    /// Holds the sync point of the rendering operation
    pub sync: SyncPoint,
    /// Holds the damage from the rendering operation, [`None`] if nothing was drawn
    pub damage: Option<Vec<Rectangle<i32, Physical>>>,
    /// Acquire fence failures, keyed by [`SurfaceState::id`](super::surface::SurfaceState::id)
    ///
    /// The surfaces were not drawn, their clients should receive a protocol error.
    pub protocol_errors: Vec<(usize, SyncError)>,
}

impl RenderOutputResult {
    fn skipped(protocol_errors: Vec<(usize, SyncError)>) -> Self {
        Self {
            sync: SyncPoint::signaled(),
            damage: None,
            protocol_errors,
        }
    }

    /// Returns true if nothing was drawn
    pub fn is_skipped(&self) -> bool {
        self.damage.is_none()
    }
}

#[derive(Debug, Clone, Copy)]
struct SurfaceRecord {
    commit: CommitCounter,
    geometry: Rectangle<i32, Physical>,
    alpha: f32,
    buffer: Option<usize>,
    z_index: usize,
}

#[derive(Debug, Clone, Copy)]
enum Selected {
    Window(usize),
    Buffer(usize),
}

/// Map damage of a buffer onto the area it is shown at
fn buffer_to_logical(
    rect: Rectangle<i32, BufferCoords>,
    buffer: Size<i32, BufferCoords>,
    geometry: Rectangle<i32, Logical>,
) -> Rectangle<i32, Logical> {
    let sx = geometry.size.w as f64 / buffer.w.max(1) as f64;
    let sy = geometry.size.h as f64 / buffer.h.max(1) as f64;
    Rectangle::<f64, Logical>::from_loc_and_size(
        (
            geometry.loc.x as f64 + rect.loc.x as f64 * sx,
            geometry.loc.y as f64 + rect.loc.y as f64 * sy,
        ),
        (rect.size.w as f64 * sx, rect.size.h as f64 * sy),
    )
    .to_i32_up()
}

/// A surface imported for the current pass
struct PreparedSurface<R: Renderer> {
    idx: usize,
    id: usize,
    geometry: Rectangle<i32, Physical>,
    alpha: f32,
    imported: Rc<ImportedBuffer<R>>,
    opaque: Region<Physical>,
    blended: Region<Physical>,
}

fn logical_region(output: &Output, region: &Region<Logical>, offset: Point<i32, Logical>) -> Region<Physical> {
    Region::from_rects(region.rects().iter().map(|rect| {
        let rect = Rectangle::from_loc_and_size(rect.loc + offset, rect.size);
        output.logical_to_physical(rect)
    }))
}

/// Repaints a single output
pub struct OutputRenderer<R: Renderer> {
    output: Output,
    windows: Vec<Renderbuffer<R>>,
    window_size: Option<Size<i32, Physical>>,
    buffers: Vec<Renderbuffer<R>>,
    stale: HashSet<RenderbufferId>,
    surfaces: IndexMap<usize, SurfaceRecord>,
    pending_damage: Region<Physical>,
    pending_borders: BorderStatus,
    borders: [Option<ClientBuffer>; 4],
    shadow: Option<R::Framebuffer>,
    color: ColorPipeline<R>,
    clear_color: Color32F,
    debug_flags: DebugFlags,
    submit_failures: usize,
    captures: Captures,
    span: tracing::Span,
}

impl<R: Renderer> fmt::Debug for OutputRenderer<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutputRenderer")
            .field("output", &self.output)
            .field("windows", &self.windows)
            .field("buffers", &self.buffers)
            .field("surfaces", &self.surfaces)
            .field("pending_damage", &self.pending_damage)
            .field("pending_borders", &self.pending_borders)
            .field("shadow", &self.shadow)
            .field("color", &self.color)
            .field("submit_failures", &self.submit_failures)
            .field("captures", &self.captures)
            .finish_non_exhaustive()
    }
}

impl<R: Renderer + 'static> OutputRenderer<R> {
    /// Create a renderer for `output`
    pub fn new(output: Output) -> Self {
        let span = info_span!("renderer_damage", output = output.name());
        OutputRenderer {
            output,
            windows: Vec::new(),
            window_size: None,
            buffers: Vec::new(),
            stale: HashSet::new(),
            surfaces: IndexMap::new(),
            pending_damage: Region::new(),
            pending_borders: BorderStatus::all(),
            borders: Default::default(),
            shadow: None,
            color: ColorPipeline::new(),
            clear_color: Color32F::BLACK,
            debug_flags: DebugFlags::empty(),
            submit_failures: 0,
            captures: Captures::default(),
            span,
        }
    }

    /// The output repainted
    pub fn output(&self) -> &Output {
        &self.output
    }

    /// Cache of the device side color transformations of this output
    pub fn color_pipeline(&self) -> &ColorPipeline<R> {
        &self.color
    }

    /// Number of window renderbuffers tracked
    pub fn window_renderbuffers(&self) -> usize {
        self.windows.len()
    }

    /// Damage accumulated by a client or external renderbuffer
    pub fn renderbuffer_damage(&self, id: RenderbufferId) -> Option<Region<Physical>> {
        self.buffers
            .iter()
            .find(|buffer| buffer.id == id)
            .map(|buffer| buffer.damage.clone())
    }

    /// Number of captures waiting for a repaint or a read-back
    pub fn pending_captures(&self) -> usize {
        self.captures.len()
    }

    /// Consecutive submission failures so far
    pub fn submit_failures(&self) -> usize {
        self.submit_failures
    }

    fn output_rect(&self) -> Rectangle<i32, Physical> {
        Rectangle::from_size(self.output.framebuffer_size())
    }

    fn damage_everything(&mut self) {
        self.pending_damage = Region::from_rect(self.output_rect());
        self.pending_borders = BorderStatus::all();
    }

    /// Change the mode of the output
    ///
    /// If the framebuffer size changes all renderbuffers are discarded. Window buffers
    /// are reallocated on the next pass, client and external renderbuffers become stale.
    pub fn set_mode(&mut self, mode: Mode) {
        let previous = self.output.framebuffer_size();
        self.output.set_mode(mode);
        if previous != self.output.framebuffer_size() {
            debug!(?previous, size = ?self.output.framebuffer_size(), "output resized");
            self.windows.clear();
            self.shadow = None;
            for mut buffer in self.buffers.drain(..) {
                buffer.discard();
                self.stale.insert(buffer.id);
            }
        }
        self.damage_everything();
    }

    /// Change the transform of the output
    pub fn set_transform(&mut self, transform: Transform) {
        if self.output.transform() != transform {
            self.output.set_transform(transform);
            self.damage_everything();
        }
    }

    /// Change the scale of the output
    pub fn set_scale(&mut self, scale: i32) {
        if self.output.scale() != scale {
            self.output.set_scale(scale);
            self.damage_everything();
        }
    }

    /// Move the output in the global compositor space
    pub fn set_location(&mut self, location: Point<i32, Logical>) {
        if self.output.location() != location {
            self.output.set_location(location);
            self.damage_everything();
        }
    }

    /// Change the color transform of the output
    pub fn set_color_transform(&mut self, color: ColorTransform) {
        if self.output.color_transform().id() != color.id() {
            self.output.set_color_transform(color);
            self.damage_everything();
        }
    }

    /// Color of areas not covered by any surface
    pub fn set_clear_color(&mut self, color: Color32F) {
        if self.clear_color != color {
            self.clear_color = color;
            self.damage_everything();
        }
    }

    /// Show `buffer` in a border, stretched to its area
    ///
    /// Borders without a buffer are filled with the clear color.
    pub fn set_border(&mut self, side: BorderSide, buffer: Option<ClientBuffer>) {
        self.borders[side.index()] = buffer;
        self.pending_borders |= side.status();
    }

    /// Supply client memory to render into
    ///
    /// `discard` is called once the renderbuffer can not be used anymore.
    pub fn add_client_target(
        &mut self,
        renderer: &mut R,
        target: ShmBuffer,
        discard: impl FnOnce() + 'static,
    ) -> Result<RenderbufferId, RepaintError<R>> {
        let size = self.output.framebuffer_size();
        capture::validate_target(&target, size).map_err(|err| RepaintError::InvalidTarget(err.to_string()))?;
        let framebuffer = renderer
            .create_framebuffer(size, target.fourcc(), false)
            .map_err(RepaintError::Rendering)?;
        let buffer = Renderbuffer::client(framebuffer, target, self.output_rect(), Box::new(discard));
        let id = buffer.id;
        debug!(?id, "client renderbuffer added");
        self.buffers.push(buffer);
        Ok(id)
    }

    /// Supply a dmabuf to render into, handed to `target` after every pass
    ///
    /// `discard` is called once the renderbuffer can not be used anymore.
    pub fn add_external_target(
        &mut self,
        renderer: &mut R,
        dmabuf: Dmabuf,
        target: impl ExternalTarget + 'static,
        discard: impl FnOnce() + 'static,
    ) -> Result<RenderbufferId, RepaintError<R>> {
        let size = self.output.framebuffer_size();
        let buffer_size = dmabuf.size();
        if buffer_size.w != size.w || buffer_size.h != size.h {
            return Err(RepaintError::InvalidTarget(format!(
                "dmabuf of size {:?} does not match the output size {:?}",
                buffer_size, size
            )));
        }
        let framebuffer = renderer
            .import_dmabuf_framebuffer(&dmabuf)
            .map_err(RepaintError::Rendering)?;
        let buffer = Renderbuffer::external(
            framebuffer,
            dmabuf,
            Box::new(target),
            self.output_rect(),
            Box::new(discard),
        );
        let id = buffer.id;
        debug!(?id, "external renderbuffer added");
        self.buffers.push(buffer);
        Ok(id)
    }

    /// Stop using a client or external renderbuffer
    ///
    /// Returns false if the renderbuffer is unknown.
    pub fn remove_target(&mut self, id: RenderbufferId) -> bool {
        if self.stale.remove(&id) {
            return true;
        }
        let Some(idx) = self.buffers.iter().position(|buffer| buffer.id == id) else {
            return false;
        };
        // dropping runs the discard callback
        self.buffers.remove(idx);
        true
    }

    /// Copy the output into `target` after the next repaint
    ///
    /// The next pass repaints the whole output.
    pub fn capture(
        &mut self,
        source: CaptureSource,
        target: ShmBuffer,
        callback: impl FnOnce(Result<(), CaptureError>) + 'static,
    ) -> Result<(), CaptureError> {
        let expected = match source {
            CaptureSource::Framebuffer => self.output.content_area().size,
            CaptureSource::FullFramebuffer | CaptureSource::Blending => self.output.framebuffer_size(),
        };
        let callback: CaptureCallback = Box::new(callback);
        self.captures.request(source, target, expected, callback)?;
        self.damage_everything();
        Ok(())
    }

    /// Defer copying asynchronous read-backs until their fence signals
    pub fn set_fence_scheduler(&mut self, scheduler: impl FenceScheduler + 'static) {
        self.captures.set_scheduler(Box::new(scheduler));
    }

    /// Collect the damage of this pass in output pixels
    fn collect_damage(&mut self, surfaces: &[RenderSurface<'_>]) -> Region<Physical> {
        let content = self.output.content_area();
        let mut damage = std::mem::take(&mut self.pending_damage);
        let mut records = IndexMap::with_capacity(surfaces.len());

        for (z_index, surface) in surfaces.iter().enumerate() {
            let state = &*surface.state;
            let geometry = self.output.logical_to_physical(surface.geometry);
            let record = SurfaceRecord {
                commit: state.current_commit(),
                geometry,
                alpha: surface.alpha,
                buffer: state.buffer().map(ClientBuffer::id),
                z_index,
            };

            match self.surfaces.get(&state.id()) {
                Some(last)
                    if last.geometry == geometry
                        && last.alpha == record.alpha
                        && last.buffer.is_some() == record.buffer.is_some()
                        && last.z_index == z_index =>
                {
                    match (state.damage_since(Some(last.commit)), state.buffer()) {
                        (Some(region), Some(buffer)) => {
                            for rect in region.rects() {
                                let rect = buffer_to_logical(*rect, buffer.size(), surface.geometry);
                                if let Some(rect) = self.output.logical_to_physical(rect).intersection(content) {
                                    damage.union_rect(rect);
                                }
                            }
                        }
                        (Some(_), None) => {}
                        (None, _) => {
                            if let Some(rect) = geometry.intersection(content) {
                                damage.union_rect(rect);
                            }
                        }
                    }
                }
                last => {
                    trace!(surface = state.id(), ?geometry, "surface placement changed");
                    for rect in last.map(|last| last.geometry).into_iter().chain(Some(geometry)) {
                        if let Some(rect) = rect.intersection(content) {
                            damage.union_rect(rect);
                        }
                    }
                }
            }
            records.insert(state.id(), record);
        }

        for (id, gone) in self.surfaces.iter().filter(|(id, _)| !records.contains_key(*id)) {
            trace!(surface = id, "surface gone");
            if let Some(rect) = gone.geometry.intersection(content) {
                damage.union_rect(rect);
            }
        }

        self.surfaces = records;
        damage
    }

    /// Pick the renderbuffer of this pass
    fn select(
        &mut self,
        target: &mut RenderTarget<'_, R>,
    ) -> Result<Selected, RepaintError<R>> {
        let output_rect = self.output_rect();
        match target {
            RenderTarget::Buffer(id) => {
                let id = *id;
                if self.stale.contains(&id) {
                    return Err(RepaintError::StaleRenderbuffer(id));
                }
                match self.buffers.iter().position(|buffer| buffer.id == id) {
                    Some(idx) if self.buffers[idx].stale => Err(RepaintError::StaleRenderbuffer(id)),
                    Some(idx) => Ok(Selected::Buffer(idx)),
                    None => Err(RepaintError::InvalidTarget(format!("unknown renderbuffer {:?}", id))),
                }
            }
            RenderTarget::Window(surface) => {
                let size = output_rect.size;
                if self.window_size != Some(size) {
                    surface.resize(size);
                    self.windows.clear();
                    self.window_size = Some(size);
                }

                let age = surface.buffer_age();
                let ceiling = if age.is_some() { MAX_AGE } else { 1 };
                let age = age.unwrap_or(0);

                // age 0 matches a buffer never presented, which is fully damaged anyway
                if let Some(idx) = self.windows.iter().position(|buffer| buffer.age() == age) {
                    trace!(age, "reusing window renderbuffer");
                    return Ok(Selected::Window(idx));
                }

                if self.windows.len() >= ceiling {
                    let (idx, _) = self
                        .windows
                        .iter()
                        .enumerate()
                        .max_by_key(|(_, buffer)| buffer.age())
                        .ok_or_else(|| RepaintError::InvalidTarget(String::from("no window renderbuffer")))?;
                    trace!(age, oldest = self.windows[idx].age(), "refurbishing window renderbuffer");
                    self.windows[idx].refurbish(output_rect);
                    return Ok(Selected::Window(idx));
                }

                trace!(age, "creating window renderbuffer");
                self.windows.push(Renderbuffer::window(output_rect));
                Ok(Selected::Window(self.windows.len() - 1))
            }
        }
    }

    fn renderbuffer(&self, selected: Selected) -> &Renderbuffer<R> {
        match selected {
            Selected::Window(idx) => &self.windows[idx],
            Selected::Buffer(idx) => &self.buffers[idx],
        }
    }

    fn renderbuffer_mut(&mut self, selected: Selected) -> &mut Renderbuffer<R> {
        match selected {
            Selected::Window(idx) => &mut self.windows[idx],
            Selected::Buffer(idx) => &mut self.buffers[idx],
        }
    }

    fn submit_failed(&mut self, err: RepaintError<R>) -> RepaintError<R> {
        self.submit_failures += 1;
        if self.submit_failures >= MAX_SUBMIT_FAILURES {
            warn!(failures = self.submit_failures, ?err, "Giving up on submitting frames");
            RepaintError::SubmitExhausted(self.submit_failures)
        } else {
            warn!(failures = self.submit_failures, ?err, "Failed to submit frame, keeping damage");
            err
        }
    }

    /// Make sure the shadow buffer exists, returns true if it was (re)created
    fn ensure_shadow(&mut self, renderer: &mut R) -> Result<bool, R::Error> {
        let size = self.output.framebuffer_size();
        if self.shadow.as_ref().map(|shadow| shadow.size()) == Some(size) {
            return Ok(false);
        }
        debug!(?size, "allocating shadow buffer");
        self.shadow = Some(renderer.create_framebuffer(size, SHADOW_FORMAT, false)?);
        Ok(true)
    }

    /// Repaint the output
    ///
    /// - `surfaces` for this output in back-to-front order
    ///
    /// Surfaces that fail to import or draw are skipped. A failed acquire fence skips the
    /// surface and is reported in [`RenderOutputResult::protocol_errors`].
    #[instrument(level = "trace", parent = &self.span, skip(self, renderer, surfaces))]
    #[profiling::function]
    pub fn render_output(
        &mut self,
        renderer: &mut R,
        mut target: RenderTarget<'_, R>,
        surfaces: &mut [RenderSurface<'_>],
    ) -> Result<RenderOutputResult, RepaintError<R>> {
        let output_rect = self.output_rect();
        let content = self.output.content_area();

        if renderer.debug_flags() != self.debug_flags {
            self.debug_flags = renderer.debug_flags();
            self.damage_everything();
        }

        let selected = self.select(&mut target)?;
        let damage = self.collect_damage(surfaces);

        let borders = std::mem::take(&mut self.pending_borders);
        for buffer in self.windows.iter_mut().chain(self.buffers.iter_mut()) {
            buffer.add_damage(&damage, borders, output_rect);
        }

        let (mut frame_damage, dirty_borders) = {
            let buffer = self.renderbuffer(selected);
            (buffer.damage.clone(), buffer.borders)
        };
        let mut protocol_errors = Vec::new();
        if frame_damage.is_empty() && dirty_borders.is_empty() {
            trace!("no damage, skipping rendering");
            return Ok(RenderOutputResult::skipped(protocol_errors));
        }

        let framebuffer = match (&mut target, &self.renderbuffer(selected).kind) {
            (RenderTarget::Window(surface), _) => surface.back_buffer(renderer).map_err(RepaintError::Rendering)?,
            (_, RenderbufferKind::Client { framebuffer, .. })
            | (_, RenderbufferKind::External { framebuffer, .. }) => framebuffer.clone(),
            (_, RenderbufferKind::Window { .. }) => {
                return Err(RepaintError::InvalidTarget(String::from(
                    "window renderbuffer without a window",
                )))
            }
        };

        let color = self
            .color
            .resolve(renderer, self.output.color_transform())
            .map_err(RepaintError::Rendering)?;
        let use_shadow = !color.is_identity() && renderer.capabilities().float_targets();
        if use_shadow {
            if self.ensure_shadow(renderer).map_err(RepaintError::Rendering)? {
                // a fresh shadow has no content to keep
                frame_damage = Region::from_rect(output_rect);
            }
        } else {
            self.shadow = None;
        }
        let draw_target = match (use_shadow, self.shadow.as_ref()) {
            (true, Some(shadow)) => shadow.clone(),
            _ => framebuffer.clone(),
        };
        let draw_color = if use_shadow { self.color.identity() } else { color.clone() };

        let mut content_damage = frame_damage.clone();
        content_damage.intersect_rect(content);
        let drawn = self.draw_surfaces(
            renderer,
            &draw_target,
            &content_damage,
            surfaces,
            &draw_color,
            &mut protocol_errors,
        )?;

        if use_shadow {
            renderer
                .blit(&draw_target, &framebuffer, Point::default(), content_damage.rects(), &color)
                .map_err(RepaintError::Rendering)?;
        }

        for rect in self.draw_borders(renderer, &framebuffer, &frame_damage, dirty_borders)? {
            frame_damage.union_rect(rect);
        }

        let frame_rects = frame_damage.rects().to_vec();
        let sync = match renderer.submit() {
            Ok(sync) => sync,
            Err(err) => return Err(self.submit_failed(RepaintError::Rendering(err))),
        };

        if let Err(err) = self.finish(renderer, &mut target, selected, &framebuffer, &sync, &frame_rects) {
            return Err(self.submit_failed(err));
        }

        if let Selected::Window(used) = selected {
            for (idx, buffer) in self.windows.iter_mut().enumerate() {
                if let RenderbufferKind::Window { age } = &mut buffer.kind {
                    if idx == used {
                        *age = 1;
                    } else if *age > 0 {
                        *age += 1;
                    }
                }
            }
        }
        self.renderbuffer_mut(selected).clear();
        self.submit_failures = 0;

        for idx in drawn {
            let surface = &mut surfaces[idx];
            if let Err(err) = surface.state.track_release(&sync) {
                protocol_errors.push((surface.state.id(), err));
            }
        }

        self.captures
            .service(renderer, &framebuffer, content, self.shadow.as_ref());

        trace!(damage = ?frame_rects, "frame submitted");
        Ok(RenderOutputResult {
            sync,
            damage: Some(frame_rects),
            protocol_errors,
        })
    }

    /// Draw the visible and damaged parts of `surfaces`, returns the indices drawn
    ///
    /// Surfaces are imported before anything is cleared, only surfaces that are going to
    /// be drawn can hide the area behind their opaque region.
    fn draw_surfaces(
        &self,
        renderer: &mut R,
        target: &R::Framebuffer,
        damage: &Region<Physical>,
        surfaces: &mut [RenderSurface<'_>],
        color: &GpuColorTransform<R>,
        protocol_errors: &mut Vec<(usize, SyncError)>,
    ) -> Result<SmallVec<[usize; 8]>, RepaintError<R>> {
        let content = self.output.content_area();
        let tint = self.debug_flags.contains(DebugFlags::TINT).then_some(TINT);
        let mut drawn = SmallVec::new();
        if damage.is_empty() {
            return Ok(drawn);
        }

        let mut prepared: Vec<PreparedSurface<R>> = Vec::with_capacity(surfaces.len());
        for (idx, surface) in surfaces.iter_mut().enumerate() {
            let id = surface.state.id();
            let geometry = self.output.logical_to_physical(surface.geometry);
            let Some(bounds) = geometry.intersection(content) else {
                continue;
            };
            let mut region = match surface.visible.as_ref() {
                Some(visible) => {
                    let mut region = logical_region(&self.output, visible, Point::default());
                    region.intersect_rect(bounds);
                    region
                }
                None => Region::from_rect(bounds),
            };
            region = region.intersection(damage);
            if region.is_empty() {
                trace!(surface = id, "not visible or not damaged, skipping");
                continue;
            }

            let imported = match surface.state.import(renderer) {
                Ok(Some(imported)) => imported,
                Ok(None) => continue,
                Err(ImportError::Sync(err)) => {
                    warn!(surface = id, ?err, "Acquire fence failed, skipping surface");
                    protocol_errors.push((id, err));
                    continue;
                }
                Err(err) => {
                    warn!(surface = id, ?err, "Failed to import buffer, skipping surface");
                    continue;
                }
            };

            let format_opaque = format::lookup(imported.format()).is_some_and(|info| !info.has_alpha);
            let opaque = if surface.alpha < 1.0 {
                Region::new()
            } else if format_opaque {
                region.clone()
            } else {
                logical_region(&self.output, &surface.opaque, surface.geometry.loc).intersection(&region)
            };
            let mut blended = region;
            blended.subtract(&opaque);

            prepared.push(PreparedSurface {
                idx,
                id,
                geometry,
                alpha: surface.alpha,
                imported,
                opaque,
                blended,
            });
        }

        let mut clear_damage = damage.clone();
        for surface in &prepared {
            clear_damage.subtract(&surface.opaque);
        }
        trace!(damage = ?clear_damage, "clearing");
        renderer
            .clear(target, self.clear_color, clear_damage.rects())
            .map_err(RepaintError::Rendering)?;

        for (position, surface) in prepared.iter().enumerate() {
            match self.draw_prepared(renderer, target, surface, None, color, tint) {
                Ok(()) => drawn.push(surface.idx),
                Err(err) => {
                    warn!(surface = surface.id, ?err, "Failed to draw surface, skipping");
                    if surface.opaque.is_empty() {
                        continue;
                    }
                    // the area hidden by the surface was not cleared
                    renderer
                        .clear(target, self.clear_color, surface.opaque.rects())
                        .map_err(RepaintError::Rendering)?;
                    for below in &prepared[..position] {
                        if let Err(err) =
                            self.draw_prepared(renderer, target, below, Some(&surface.opaque), color, tint)
                        {
                            warn!(surface = below.id, ?err, "Failed to redraw surface");
                        }
                    }
                }
            }
        }
        Ok(drawn)
    }

    /// Draw the opaque part of a prepared surface, then its blended remainder
    fn draw_prepared(
        &self,
        renderer: &mut R,
        target: &R::Framebuffer,
        surface: &PreparedSurface<R>,
        clip: Option<&Region<Physical>>,
        color: &GpuColorTransform<R>,
        tint: Option<Color32F>,
    ) -> Result<(), R::Error> {
        for (part, blend) in [(&surface.opaque, false), (&surface.blended, true)] {
            let part = match clip {
                Some(clip) => part.intersection(clip),
                None => part.clone(),
            };
            if part.is_empty() {
                continue;
            }
            trace!(surface = surface.id, blend, damage = ?part, "drawing");
            let call = self.draw_call(
                &surface.imported,
                surface.geometry,
                part.rects(),
                blend,
                surface.alpha,
                color,
                tint,
            );
            renderer.draw(target, &call)?;
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn draw_call<'a>(
        &self,
        imported: &'a ImportedBuffer<R>,
        dst: Rectangle<i32, Physical>,
        damage: &'a [Rectangle<i32, Physical>],
        blend: bool,
        alpha: f32,
        color: &'a GpuColorTransform<R>,
        tint: Option<Color32F>,
    ) -> DrawCall<'a, R> {
        DrawCall {
            planes: imported.planes(),
            variant: if blend {
                imported.variant()
            } else {
                imported.opaque_variant()
            },
            yuv: imported.colorspace(),
            src: Rectangle::from_size(imported.size().to_f64()),
            dst,
            damage,
            transform: self.output.transform().invert(),
            y_inverted: imported.y_inverted(),
            alpha,
            blend,
            color,
            tint,
        }
    }

    /// Repaint dirty borders, returns the rectangles drawn
    fn draw_borders(
        &self,
        renderer: &mut R,
        target: &R::Framebuffer,
        damage: &Region<Physical>,
        dirty: BorderStatus,
    ) -> Result<SmallVec<[Rectangle<i32, Physical>; 4]>, RepaintError<R>> {
        let size = self.output.framebuffer_size();
        let content = self.output.content_area();
        let identity = self.color.identity();
        let mut drawn = SmallVec::new();

        for side in BorderSide::ALL {
            let Some(rect) = border_rect(side, size, content) else {
                continue;
            };
            if !dirty.contains(side.status()) && !damage.rects().iter().any(|d| d.overlaps(rect)) {
                continue;
            }

            let imported = match self.borders[side.index()].as_ref() {
                Some(buffer) => match import_buffer(renderer, buffer, None) {
                    Ok(imported) => Some(imported),
                    Err(err) => {
                        warn!(?side, ?err, "Failed to import border");
                        None
                    }
                },
                None => None,
            };

            let damage = [rect];
            match imported {
                Some(imported) => {
                    let call = DrawCall {
                        planes: imported.planes(),
                        variant: imported.variant(),
                        yuv: imported.colorspace(),
                        src: Rectangle::from_size(imported.size().to_f64()),
                        dst: rect,
                        damage: &damage,
                        transform: Transform::Normal,
                        y_inverted: imported.y_inverted(),
                        alpha: 1.0,
                        blend: false,
                        color: &identity,
                        tint: None,
                    };
                    renderer.draw(target, &call).map_err(RepaintError::Rendering)?;
                }
                None => renderer
                    .clear(target, self.clear_color, &damage)
                    .map_err(RepaintError::Rendering)?,
            }
            trace!(?side, ?rect, "border drawn");
            drawn.push(rect);
        }
        Ok(drawn)
    }

    /// Hand the frame to the consumer of the renderbuffer
    fn finish(
        &mut self,
        renderer: &mut R,
        target: &mut RenderTarget<'_, R>,
        selected: Selected,
        framebuffer: &R::Framebuffer,
        sync: &SyncPoint,
        damage: &[Rectangle<i32, Physical>],
    ) -> Result<(), RepaintError<R>> {
        if let RenderTarget::Window(surface) = target {
            let damage = surface.supports_partial_update().then_some(damage);
            surface.present(renderer, damage)?;
            return Ok(());
        }

        let output_rect = self.output_rect();
        match &mut self.renderbuffer_mut(selected).kind {
            RenderbufferKind::Client { target, .. } => {
                let pixels = renderer
                    .read_pixels(framebuffer, output_rect, target.fourcc())
                    .map_err(RepaintError::Rendering)?;
                pixels
                    .sync
                    .wait_bounded(READBACK_TIMEOUT)
                    .map_err(|err| SwapBuffersError::TemporaryFailure(Box::new(err)))?;
                capture::copy_into(target, &pixels, framebuffer.flipped())
                    .map_err(|err| SwapBuffersError::TemporaryFailure(Box::new(err)))?;
                trace!("client renderbuffer updated");
            }
            RenderbufferKind::External { target, .. } => {
                target.hand_off(sync.export(), damage)?;
                trace!("external renderbuffer handed off");
            }
            RenderbufferKind::Window { .. } => {
                return Err(RepaintError::InvalidTarget(String::from(
                    "window renderbuffer without a window",
                )))
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_damage_scales_outwards() {
        let geometry = Rectangle::<i32, Logical>::from_loc_and_size((10, 10), (50, 50));
        let rect = buffer_to_logical(
            Rectangle::<i32, BufferCoords>::from_loc_and_size((1, 1), (1, 1)),
            (100, 100).into(),
            geometry,
        );
        assert_eq!(rect, Rectangle::from_loc_and_size((10, 10), (1, 1)));

        let rect = buffer_to_logical(
            Rectangle::<i32, BufferCoords>::from_loc_and_size((0, 0), (100, 100)),
            (100, 100).into(),
            geometry,
        );
        assert_eq!(rect, geometry);
    }

    #[test]
    fn borders_frame_the_content() {
        let size = Size::from((20, 20));
        let content = Rectangle::from_loc_and_size((2, 3), (16, 14));
        assert_eq!(
            border_rect(BorderSide::Top, size, content),
            Some(Rectangle::from_loc_and_size((0, 0), (20, 3)))
        );
        assert_eq!(
            border_rect(BorderSide::Bottom, size, content),
            Some(Rectangle::from_loc_and_size((0, 17), (20, 3)))
        );
        assert_eq!(
            border_rect(BorderSide::Left, size, content),
            Some(Rectangle::from_loc_and_size((0, 3), (2, 14)))
        );
        assert_eq!(
            border_rect(BorderSide::Right, size, content),
            Some(Rectangle::from_loc_and_size((18, 3), (2, 14)))
        );
        assert_eq!(
            border_rect(BorderSide::Top, size, Rectangle::from_size(size)),
            None
        );
    }
}
