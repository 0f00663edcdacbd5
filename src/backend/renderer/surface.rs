//! Per-surface buffer state
//!
//! [`SurfaceState`] holds what a client committed to a surface: the attached
//! [`ClientBuffer`], its acquire fence, the consumer notified once the buffer is
//! released and the recent damage history. Outputs keep track of the last
//! [`CommitCounter`] they rendered and ask for the damage since then, see
//! [`SurfaceState::damage_since`]. Uploads into the textures of a renderer work the
//! same way, every renderer remembers the commit it uploaded last.
//!
//! A failed acquire fence aborts the attached buffer: it is never sampled, on any
//! renderer, until the client attaches a new one.
//!
//! [`RenderSurface`] places a surface on an output for a single repaint.

use std::{
    collections::{HashMap, VecDeque},
    fmt,
    rc::Rc,
};

use tracing::{debug, trace};

use super::{
    import::{import_buffer, BufferKind, ClientBuffer, ImportError, ImportedBuffer},
    sync::{wait_acquire, BufferRelease, FenceHandle, ReleaseTracker, SyncError, SyncPoint},
    Renderer,
};
use crate::utils::{ids::id_gen, Buffer as BufferCoords, Logical, Rectangle, Region};

/// Number of commits damage is remembered for
pub const MAX_DAMAGE_AGE: usize = 4;

/// Position in the commit history of a surface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct CommitCounter(usize);

impl CommitCounter {
    /// Step the counter to the next commit
    pub fn increment(&mut self) {
        self.0 = self.0.wrapping_add(1);
    }

    /// Number of commits between `previous` and `self`
    ///
    /// Returns [`None`] if `previous` is newer than `self`.
    pub fn distance(&self, previous: CommitCounter) -> Option<usize> {
        self.0.checked_sub(previous.0)
    }
}

/// A new buffer attached to a surface
pub struct Attach {
    /// The buffer
    pub buffer: ClientBuffer,
    /// Fence signaled once the client finished writing the buffer
    pub acquire: Option<FenceHandle>,
    /// Notified once the compositor does not need the buffer anymore
    pub release: Option<Box<dyn BufferRelease>>,
}

impl fmt::Debug for Attach {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Attach")
            .field("buffer", &self.buffer)
            .field("acquire", &self.acquire)
            .field("release", &self.release.is_some())
            .finish()
    }
}

impl Attach {
    /// Attach `buffer` without synchronization or release notification
    pub fn new(buffer: ClientBuffer) -> Attach {
        Attach {
            buffer,
            acquire: None,
            release: None,
        }
    }

    /// Wait for `fence` before sampling the buffer
    pub fn with_acquire(mut self, fence: FenceHandle) -> Attach {
        self.acquire = Some(fence);
        self
    }

    /// Notify `release` once the buffer is free again
    pub fn with_release(mut self, release: impl BufferRelease + 'static) -> Attach {
        self.release = Some(Box::new(release));
        self
    }
}

id_gen!(surface_id);

#[derive(Debug, Clone, Copy)]
struct Upload {
    commit: CommitCounter,
    acquired: bool,
}

/// Buffer state of a single client surface
pub struct SurfaceState {
    id: usize,
    buffer: Option<ClientBuffer>,
    // keyed by renderer id
    uploads: HashMap<usize, Upload>,
    acquire: Option<FenceHandle>,
    acquire_failed: bool,
    release: Option<Box<dyn BufferRelease>>,
    release_tracker: ReleaseTracker,
    commit: CommitCounter,
    // newest first, `None` damages the whole buffer
    damage: VecDeque<Option<Region<BufferCoords>>>,
}

impl fmt::Debug for SurfaceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SurfaceState")
            .field("id", &self.id)
            .field("buffer", &self.buffer)
            .field("uploads", &self.uploads)
            .field("acquire", &self.acquire)
            .field("acquire_failed", &self.acquire_failed)
            .field("release", &self.release)
            .field("release_tracker", &self.release_tracker)
            .field("commit", &self.commit)
            .finish_non_exhaustive()
    }
}

impl Default for SurfaceState {
    fn default() -> Self {
        Self::new()
    }
}

impl SurfaceState {
    /// Create the state of a surface without a buffer
    pub fn new() -> SurfaceState {
        SurfaceState {
            id: surface_id::next(),
            buffer: None,
            uploads: HashMap::new(),
            acquire: None,
            acquire_failed: false,
            release: None,
            release_tracker: ReleaseTracker::default(),
            commit: CommitCounter::default(),
            damage: VecDeque::with_capacity(MAX_DAMAGE_AGE),
        }
    }

    /// Unique id of the surface
    pub fn id(&self) -> usize {
        self.id
    }

    /// The currently attached buffer
    pub fn buffer(&self) -> Option<&ClientBuffer> {
        self.buffer.as_ref()
    }

    /// The current commit
    pub fn current_commit(&self) -> CommitCounter {
        self.commit
    }

    /// Returns true if the acquire fence of the attached buffer was not seen signaled yet
    pub fn has_acquire_fence(&self) -> bool {
        self.acquire.is_some()
    }

    /// Returns true if waiting for the acquire fence of the attached buffer failed
    ///
    /// The buffer is not imported again until a new one is attached.
    pub fn acquire_failed(&self) -> bool {
        self.acquire_failed
    }

    /// Apply a commit of the client
    ///
    /// Attaching a new buffer releases the previous one. Textures of a previous shm
    /// buffer with identical layout are carried over and only the damaged parts are
    /// uploaded, otherwise the next import uploads the whole buffer. `damage` is in
    /// buffer coordinates and clipped to the buffer.
    pub fn commit(
        &mut self,
        attach: Option<Attach>,
        damage: impl IntoIterator<Item = Rectangle<i32, BufferCoords>>,
    ) {
        let mut full_damage = false;

        if let Some(attach) = attach {
            match self.buffer.take() {
                Some(previous) => {
                    if previous.size() != attach.buffer.size() || previous.fourcc() != attach.buffer.fourcc() {
                        full_damage = true;
                    }
                    if !attach.buffer.adopt_textures(&previous) {
                        self.uploads.clear();
                    }
                }
                None => {
                    full_damage = true;
                    self.uploads.clear();
                }
            }
            for upload in self.uploads.values_mut() {
                upload.acquired = false;
            }

            self.release_previous();
            trace!(surface = self.id, buffer = attach.buffer.id(), "buffer attached");
            self.buffer = Some(attach.buffer);
            self.acquire = attach.acquire;
            self.acquire_failed = false;
            self.release = attach.release;
        }

        let Some(buffer) = self.buffer.as_ref() else {
            self.push_damage(None);
            return;
        };

        let bounds = Rectangle::from_size(buffer.size());
        let mut region = Region::new();
        for rect in damage {
            if let Some(rect) = rect.intersection(bounds) {
                region.union_rect(rect);
            }
        }
        self.push_damage(if full_damage { None } else { Some(region) });
    }

    /// Remove the attached buffer, releasing it
    pub fn detach(&mut self) {
        if let Some(buffer) = self.buffer.take() {
            debug!(surface = self.id, buffer = buffer.id(), "buffer detached");
        }
        self.release_previous();
        self.acquire = None;
        self.acquire_failed = false;
        self.uploads.clear();
        self.push_damage(None);
    }

    fn push_damage(&mut self, damage: Option<Region<BufferCoords>>) {
        self.commit.increment();
        self.damage.push_front(damage);
        self.damage.truncate(MAX_DAMAGE_AGE);
    }

    fn release_previous(&mut self) {
        if let Some(release) = self.release.take() {
            self.release_tracker.release(release);
        }
    }

    /// Damage accumulated since `commit`
    ///
    /// Returns [`None`] if the whole buffer has to be considered damaged, because
    /// `commit` is unknown, too old or the buffer changed in between.
    pub fn damage_since(&self, commit: Option<CommitCounter>) -> Option<Region<BufferCoords>> {
        let distance = self.commit.distance(commit?)?;
        if distance > self.damage.len() {
            return None;
        }
        let mut damage = Region::new();
        for entry in self.damage.iter().take(distance) {
            damage.union(entry.as_ref()?);
        }
        Some(damage)
    }

    /// Import the attached buffer into `renderer`
    ///
    /// Makes `renderer` wait for a pending acquire fence first. A failed wait aborts the
    /// import and the buffer is skipped until a new one is attached, returning
    /// `Ok(None)`. Only damage committed since the last import into `renderer` is
    /// uploaded into existing shm textures.
    pub fn import<R: Renderer + 'static>(
        &mut self,
        renderer: &mut R,
    ) -> Result<Option<Rc<ImportedBuffer<R>>>, ImportError<R::Error>> {
        if self.acquire_failed {
            trace!(surface = self.id, "acquire failed, not sampling buffer");
            return Ok(None);
        }
        let Some(buffer) = self.buffer.clone() else {
            return Ok(None);
        };

        let renderer_id = renderer.id();
        let last = self.uploads.get(&renderer_id).copied();
        if self.acquire.as_ref().is_some_and(FenceHandle::is_signaled) {
            trace!(surface = self.id, "acquire fence signaled");
            self.acquire = None;
        }
        // other renderers still have to wait for an unsignaled fence
        if let Some(fence) = self.acquire.as_ref() {
            if !last.is_some_and(|upload| upload.acquired) {
                if let Err(err) = wait_acquire(renderer, fence) {
                    self.acquire = None;
                    self.acquire_failed = true;
                    return Err(err.into());
                }
            }
        }

        let damage = match last {
            Some(upload) if buffer.is_imported(renderer_id) => self.damage_since(Some(upload.commit)),
            _ => None,
        };
        let imported = import_buffer(renderer, &buffer, damage.as_ref())?;
        self.uploads.insert(
            renderer_id,
            Upload {
                commit: self.commit,
                acquired: true,
            },
        );
        Ok(Some(imported))
    }

    /// Remember the device work reading the attached buffer
    ///
    /// The release of a dmabuf is delayed until `sync` is reached. Shm buffers are
    /// copied on import and need no tracking.
    pub fn track_release(&mut self, sync: &SyncPoint) -> Result<(), SyncError> {
        match self.buffer.as_ref().map(|buffer| buffer.kind()) {
            Some(BufferKind::Dmabuf(_)) => self.release_tracker.update(sync),
            _ => Ok(()),
        }
    }
}

impl Drop for SurfaceState {
    fn drop(&mut self) {
        self.release_previous();
    }
}

/// A surface placed on an output for one repaint
#[derive(Debug)]
pub struct RenderSurface<'a> {
    pub(crate) state: &'a mut SurfaceState,
    pub(crate) geometry: Rectangle<i32, Logical>,
    pub(crate) visible: Option<Region<Logical>>,
    pub(crate) opaque: Region<Logical>,
    pub(crate) alpha: f32,
}

impl<'a> RenderSurface<'a> {
    /// Place `state` at `geometry`, in global logical coordinates
    pub fn new(state: &'a mut SurfaceState, geometry: Rectangle<i32, Logical>) -> RenderSurface<'a> {
        RenderSurface {
            state,
            geometry,
            visible: None,
            opaque: Region::new(),
            alpha: 1.0,
        }
    }

    /// Restrict drawing to `visible`, in global logical coordinates
    pub fn with_visible(mut self, visible: Region<Logical>) -> Self {
        self.visible = Some(visible);
        self
    }

    /// Mark `opaque` as fully opaque, relative to the surface
    pub fn with_opaque(mut self, opaque: Region<Logical>) -> Self {
        self.opaque = opaque;
        self
    }

    /// Multiply the surface with `alpha`
    pub fn with_alpha(mut self, alpha: f32) -> Self {
        self.alpha = alpha.clamp(0.0, 1.0);
        self
    }

    /// Placement on the output
    pub fn geometry(&self) -> Rectangle<i32, Logical> {
        self.geometry
    }

    /// Global alpha
    pub fn alpha(&self) -> f32 {
        self.alpha
    }

    /// The surface state
    pub fn state(&mut self) -> &mut SurfaceState {
        self.state
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::RefCell, rc::Rc};

    use super::*;
    use crate::backend::allocator::{
        shm::{ShmBuffer, ShmPool},
        Fourcc,
    };

    #[derive(Debug)]
    struct Released(Rc<RefCell<Vec<&'static str>>>, &'static str);

    impl BufferRelease for Released {
        fn release(self: Box<Self>) {
            self.0.borrow_mut().push(self.1);
        }

        fn release_with_fence(self: Box<Self>, _fence: FenceHandle) {
            self.0.borrow_mut().push(self.1);
        }
    }

    fn buffer(pool: &ShmPool, w: i32, h: i32) -> ClientBuffer {
        ClientBuffer::shm(ShmBuffer::new(pool, 0, (w, h), w as usize * 4, Fourcc::Argb8888))
    }

    #[test]
    fn damage_since_accumulates() {
        let pool = ShmPool::create("surface-test", 64 * 64 * 4).unwrap();
        let mut state = SurfaceState::new();
        state.commit(Some(Attach::new(buffer(&pool, 64, 64))), []);
        let first = state.current_commit();

        state.commit(None, [Rectangle::from_loc_and_size((0, 0), (8, 8))]);
        state.commit(None, [Rectangle::from_loc_and_size((60, 60), (10, 10))]);

        let damage = state.damage_since(Some(first)).unwrap();
        assert_eq!(damage.area(), 64 + 16);
        assert_eq!(state.damage_since(Some(state.current_commit())), Some(Region::new()));
        assert_eq!(state.damage_since(None), None);

        // attaching the first buffer damaged everything
        let mut before = first;
        before.0 -= 1;
        assert_eq!(state.damage_since(Some(before)), None);
    }

    #[test]
    fn old_commits_are_forgotten() {
        let pool = ShmPool::create("surface-test", 16 * 16 * 4).unwrap();
        let mut state = SurfaceState::new();
        state.commit(Some(Attach::new(buffer(&pool, 16, 16))), []);
        let start = state.current_commit();
        for _ in 0..MAX_DAMAGE_AGE {
            state.commit(None, [Rectangle::from_loc_and_size((0, 0), (1, 1))]);
        }
        assert!(state.damage_since(Some(start)).is_some());
        state.commit(None, []);
        assert!(state.damage_since(Some(start)).is_none());
    }

    #[test]
    fn resizing_damages_everything() {
        let pool = ShmPool::create("surface-test", 64 * 64 * 4).unwrap();
        let mut state = SurfaceState::new();
        state.commit(Some(Attach::new(buffer(&pool, 64, 64))), []);
        let commit = state.current_commit();
        state.commit(Some(Attach::new(buffer(&pool, 32, 32))), []);
        assert_eq!(state.damage_since(Some(commit)), None);
    }

    #[test]
    fn attach_releases_previous_buffer() {
        let pool = ShmPool::create("surface-test", 16 * 16 * 4).unwrap();
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut state = SurfaceState::new();

        state.commit(
            Some(Attach::new(buffer(&pool, 16, 16)).with_release(Released(log.clone(), "first"))),
            [],
        );
        assert!(log.borrow().is_empty());

        state.commit(
            Some(Attach::new(buffer(&pool, 16, 16)).with_release(Released(log.clone(), "second"))),
            [],
        );
        assert_eq!(*log.borrow(), vec!["first"]);

        drop(state);
        assert_eq!(*log.borrow(), vec!["first", "second"]);
    }
}
