use std::fmt;

use crate::{
    backend::{
        allocator::{dmabuf::Dmabuf, shm::ShmBuffer},
        renderer::{sync::FenceHandle, Renderer},
        SwapBuffersError,
    },
    utils::{ids::id_gen, Physical, Rectangle, Region, Size},
};

bitflags::bitflags! {
    /// Borders of an output that need to be repainted
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
    pub struct BorderStatus: u8 {
        /// The border above the content
        const TOP = 0b0001;
        /// The border left of the content
        const LEFT = 0b0010;
        /// The border right of the content
        const RIGHT = 0b0100;
        /// The border below the content
        const BOTTOM = 0b1000;
    }
}

/// One of the four borders around the content of an output
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum BorderSide {
    /// The border above the content
    Top,
    /// The border left of the content
    Left,
    /// The border right of the content
    Right,
    /// The border below the content
    Bottom,
}

impl BorderSide {
    /// All sides, in drawing order
    pub const ALL: [BorderSide; 4] = [BorderSide::Top, BorderSide::Left, BorderSide::Right, BorderSide::Bottom];

    /// The status bit of this side
    pub fn status(self) -> BorderStatus {
        match self {
            BorderSide::Top => BorderStatus::TOP,
            BorderSide::Left => BorderStatus::LEFT,
            BorderSide::Right => BorderStatus::RIGHT,
            BorderSide::Bottom => BorderStatus::BOTTOM,
        }
    }

    pub(crate) fn index(self) -> usize {
        match self {
            BorderSide::Top => 0,
            BorderSide::Left => 1,
            BorderSide::Right => 2,
            BorderSide::Bottom => 3,
        }
    }
}

/// Area covered by a border inside a framebuffer
///
/// Top and bottom borders span the whole width, the side borders only the content height.
pub fn border_rect(
    side: BorderSide,
    framebuffer: Size<i32, Physical>,
    content: Rectangle<i32, Physical>,
) -> Option<Rectangle<i32, Physical>> {
    let content_bottom = content.loc.y + content.size.h;
    let content_right = content.loc.x + content.size.w;
    let rect = match side {
        BorderSide::Top => Rectangle::from_loc_and_size((0, 0), (framebuffer.w, content.loc.y)),
        BorderSide::Bottom => Rectangle::from_extremities((0, content_bottom), (framebuffer.w, framebuffer.h)),
        BorderSide::Left => Rectangle::from_extremities((0, content.loc.y), (content.loc.x, content_bottom)),
        BorderSide::Right => {
            Rectangle::from_extremities((content_right, content.loc.y), (framebuffer.w, content_bottom))
        }
    };
    (!rect.is_empty()).then_some(rect)
}

/// Receiver of frames rendered into an imported dmabuf
pub trait ExternalTarget {
    /// The frame is complete once `fence` signals, or right away without a fence
    fn hand_off(
        &mut self,
        fence: Option<FenceHandle>,
        damage: &[Rectangle<i32, Physical>],
    ) -> Result<(), SwapBuffersError>;
}

/// Identifies a renderbuffer supplied to an [`OutputRenderer`](super::OutputRenderer)
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct RenderbufferId(usize);

id_gen!(renderbuffer_id);

pub(crate) enum RenderbufferKind<R: Renderer> {
    Window {
        age: usize,
    },
    Client {
        framebuffer: R::Framebuffer,
        target: ShmBuffer,
    },
    External {
        framebuffer: R::Framebuffer,
        dmabuf: Dmabuf,
        target: Box<dyn ExternalTarget>,
    },
}

impl<R: Renderer> fmt::Debug for RenderbufferKind<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RenderbufferKind::Window { age } => f.debug_struct("Window").field("age", age).finish(),
            RenderbufferKind::Client { framebuffer, target } => f
                .debug_struct("Client")
                .field("framebuffer", framebuffer)
                .field("target", target)
                .finish(),
            RenderbufferKind::External { framebuffer, dmabuf, .. } => f
                .debug_struct("External")
                .field("framebuffer", framebuffer)
                .field("dmabuf", dmabuf)
                .finish_non_exhaustive(),
        }
    }
}

pub(crate) struct Renderbuffer<R: Renderer> {
    pub(crate) id: RenderbufferId,
    pub(crate) kind: RenderbufferKind<R>,
    pub(crate) damage: Region<Physical>,
    pub(crate) borders: BorderStatus,
    pub(crate) stale: bool,
    discard: Option<Box<dyn FnOnce()>>,
}

impl<R: Renderer> fmt::Debug for Renderbuffer<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Renderbuffer")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("damage", &self.damage)
            .field("borders", &self.borders)
            .field("stale", &self.stale)
            .finish_non_exhaustive()
    }
}

impl<R: Renderer> Renderbuffer<R> {
    fn new(
        kind: RenderbufferKind<R>,
        output: Rectangle<i32, Physical>,
        discard: Option<Box<dyn FnOnce()>>,
    ) -> Self {
        Renderbuffer {
            id: RenderbufferId(renderbuffer_id::next()),
            kind,
            damage: Region::from_rect(output),
            borders: BorderStatus::all(),
            stale: false,
            discard,
        }
    }

    pub(crate) fn window(output: Rectangle<i32, Physical>) -> Self {
        Self::new(RenderbufferKind::Window { age: 0 }, output, None)
    }

    pub(crate) fn client(
        framebuffer: R::Framebuffer,
        target: ShmBuffer,
        output: Rectangle<i32, Physical>,
        discard: Box<dyn FnOnce()>,
    ) -> Self {
        Self::new(
            RenderbufferKind::Client { framebuffer, target },
            output,
            Some(discard),
        )
    }

    pub(crate) fn external(
        framebuffer: R::Framebuffer,
        dmabuf: Dmabuf,
        target: Box<dyn ExternalTarget>,
        output: Rectangle<i32, Physical>,
        discard: Box<dyn FnOnce()>,
    ) -> Self {
        Self::new(
            RenderbufferKind::External {
                framebuffer,
                dmabuf,
                target,
            },
            output,
            Some(discard),
        )
    }

    /// Age of a window renderbuffer, zero for others and buffers never presented
    pub(crate) fn age(&self) -> usize {
        match self.kind {
            RenderbufferKind::Window { age } => age,
            _ => 0,
        }
    }

    /// Start over with an undefined content
    pub(crate) fn refurbish(&mut self, output: Rectangle<i32, Physical>) {
        if let RenderbufferKind::Window { age } = &mut self.kind {
            *age = 0;
        }
        self.damage = Region::from_rect(output);
        self.borders = BorderStatus::all();
    }

    pub(crate) fn add_damage(
        &mut self,
        damage: &Region<Physical>,
        borders: BorderStatus,
        output: Rectangle<i32, Physical>,
    ) {
        if self.stale {
            return;
        }
        self.damage.union(damage);
        self.damage.intersect_rect(output);
        self.borders |= borders;
    }

    /// The contents were submitted
    pub(crate) fn clear(&mut self) {
        self.damage.clear();
        self.borders = BorderStatus::empty();
    }

    /// Mark the renderbuffer unusable and notify its owner
    pub(crate) fn discard(&mut self) {
        self.stale = true;
        self.damage.clear();
        if let Some(discard) = self.discard.take() {
            discard();
        }
    }
}

impl<R: Renderer> Drop for Renderbuffer<R> {
    fn drop(&mut self) {
        self.discard();
    }
}
