use std::{cell::Cell, rc::Rc};

use tracing::{debug, trace};

use super::{HeadlessError, HeadlessFramebuffer, HeadlessRenderer};
use crate::{
    backend::{
        allocator::Fourcc,
        renderer::{damage::PresentationSurface, Renderer},
        SwapBuffersError,
    },
    utils::{Physical, Rectangle, Size},
};

#[derive(Debug, Default)]
struct Slot {
    framebuffer: Option<HeadlessFramebuffer>,
    age: usize,
}

/// A window surface of the [`HeadlessRenderer`]
///
/// Rotates through a fixed amount of flipped framebuffers and reports buffer ages the
/// way EGL does: a buffer presented last frame has age 1, one never presented age 0.
#[derive(Debug)]
pub struct HeadlessSurface {
    size: Size<i32, Physical>,
    format: Fourcc,
    slots: Vec<Slot>,
    current: usize,
    front: Option<usize>,
    buffer_age: bool,
    partial_update: bool,
    failures: Rc<Cell<usize>>,
    last_damage: Option<Vec<Rectangle<i32, Physical>>>,
    presented: usize,
}

impl HeadlessSurface {
    /// Create a surface cycling through `buffers` framebuffers, clamped to 2 to 3
    pub fn new(
        renderer: &HeadlessRenderer,
        size: impl Into<Size<i32, Physical>>,
        format: Fourcc,
        buffers: usize,
    ) -> HeadlessSurface {
        let caps = renderer.capabilities();
        HeadlessSurface {
            size: size.into(),
            format,
            slots: (0..buffers.clamp(2, 3)).map(|_| Slot::default()).collect(),
            current: 0,
            front: None,
            buffer_age: caps.buffer_age(),
            partial_update: caps.partial_update(),
            failures: renderer.present_failures(),
            last_damage: None,
            presented: 0,
        }
    }

    /// Current size of the framebuffers
    pub fn size(&self) -> Size<i32, Physical> {
        self.size
    }

    /// The framebuffer presented last
    pub fn front_buffer(&self) -> Option<&HeadlessFramebuffer> {
        self.front
            .and_then(|idx| self.slots.get(idx))
            .and_then(|slot| slot.framebuffer.as_ref())
    }

    /// Damage passed to the last successful presentation
    ///
    /// [`None`] means the whole surface was presented.
    pub fn last_damage(&self) -> Option<&[Rectangle<i32, Physical>]> {
        self.last_damage.as_deref()
    }

    /// Number of successful presentations
    pub fn presented(&self) -> usize {
        self.presented
    }
}

impl PresentationSurface<HeadlessRenderer> for HeadlessSurface {
    fn buffer_age(&self) -> Option<usize> {
        self.buffer_age.then(|| self.slots[self.current].age)
    }

    fn supports_partial_update(&self) -> bool {
        self.partial_update
    }

    fn back_buffer(&mut self, renderer: &mut HeadlessRenderer) -> Result<HeadlessFramebuffer, HeadlessError> {
        let slot = &mut self.slots[self.current];
        if let Some(framebuffer) = slot.framebuffer.as_ref() {
            return Ok(framebuffer.clone());
        }
        let framebuffer = renderer.create_framebuffer(self.size, self.format, true)?;
        trace!(slot = self.current, size = ?self.size, "allocated window buffer");
        slot.age = 0;
        slot.framebuffer = Some(framebuffer.clone());
        Ok(framebuffer)
    }

    fn present(
        &mut self,
        _renderer: &mut HeadlessRenderer,
        damage: Option<&[Rectangle<i32, Physical>]>,
    ) -> Result<(), SwapBuffersError> {
        let remaining = self.failures.get();
        if remaining > 0 {
            self.failures.set(remaining - 1);
            debug!(remaining = remaining - 1, "failing presentation");
            return Err(HeadlessError::PresentFailed.into());
        }
        if self.slots[self.current].framebuffer.is_none() {
            return Err(SwapBuffersError::AlreadySwapped);
        }

        for (idx, slot) in self.slots.iter_mut().enumerate() {
            if idx == self.current {
                slot.age = 1;
            } else if slot.age > 0 {
                slot.age += 1;
            }
        }
        self.last_damage = damage.filter(|_| self.partial_update).map(<[_]>::to_vec);
        self.front = Some(self.current);
        self.current = (self.current + 1) % self.slots.len();
        self.presented += 1;
        Ok(())
    }

    fn resize(&mut self, size: Size<i32, Physical>) {
        if size == self.size {
            return;
        }
        debug!(from = ?self.size, to = ?size, "resizing window surface");
        self.size = size;
        for slot in self.slots.iter_mut() {
            *slot = Slot::default();
        }
        self.current = 0;
        self.front = None;
        self.last_damage = None;
    }
}
