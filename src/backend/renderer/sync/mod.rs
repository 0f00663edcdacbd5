//! Helper for synchronizing rendering operations
//!
//! Client buffers may come with an acquire fence that needs to signal before their
//! content can be sampled, see [`wait_acquire`]. After a repaint the renderer hands
//! out a [`SyncPoint`] that signals once the device is done with the buffers it read,
//! [`ReleaseTracker`] turns those into release fences for the clients.
//!
//! Fences are passed around as owned file descriptors ([`FenceHandle`]). A handle is
//! closed exactly once, by whoever owns it last.

use std::{
    error::Error,
    fmt, io,
    os::unix::io::{AsFd, BorrowedFd, OwnedFd},
    sync::Arc,
    time::Duration,
};

use downcast_rs::{impl_downcast, Downcast};
use rustix::event::{eventfd, poll, EventfdFlags, PollFd, PollFlags};
use tracing::{trace, warn};

use super::Renderer;

mod source;
pub use self::source::FenceSource;

/// Number of attempts of a bounded wait before giving up
pub const WAIT_RETRY_BUDGET: u32 = 4;

/// Waiting for the fence was interrupted for an unknown reason.
///
/// This does not mean that the fence is signalled or not, neither that
/// any timeout was reached. Waiting should be attempted again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Interrupted;

impl fmt::Display for Interrupted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Wait for Fence was interrupted")
    }
}
impl Error for Interrupted {}

/// Errors of fence handling
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// The fence file descriptor could not be duplicated
    #[error("Failed to duplicate fence")]
    Duplicate(#[source] io::Error),
    /// The device could not import the fence
    #[error("Failed to import fence: {0}")]
    Import(#[source] Box<dyn Error + Send + Sync>),
    /// The device could not wait for the fence
    #[error("Failed to wait for fence: {0}")]
    Wait(#[source] Box<dyn Error + Send + Sync>),
    /// The fence did not signal in time
    #[error("Fence did not signal in time")]
    Timeout,
}

/// A fence that will be signaled in finite time
pub trait Fence: std::fmt::Debug + Send + Sync + Downcast {
    /// Queries the state of the fence
    fn is_signaled(&self) -> bool;

    /// Blocks the current thread until the fence is signaled
    fn wait(&self) -> Result<(), Interrupted>;

    /// Blocks the current thread until the fence is signaled or `timeout` passed
    ///
    /// Returns whether the fence signaled.
    fn wait_timeout(&self, timeout: Duration) -> Result<bool, Interrupted> {
        let _ = timeout;
        self.wait().map(|_| true)
    }

    /// Returns whether this fence can be exported
    /// as a native fence fd
    fn is_exportable(&self) -> bool;

    /// Export this fence as a native fence fd
    fn export(&self) -> Option<OwnedFd>;
}
impl_downcast!(Fence);

fn poll_readable(fd: BorrowedFd<'_>, timeout: Option<Duration>) -> Result<bool, Interrupted> {
    let timeout = timeout
        .map(|t| t.as_millis().min(i32::MAX as u128) as i32)
        .unwrap_or(-1);
    let mut fds = [PollFd::new(&fd, PollFlags::IN)];
    match poll(&mut fds, timeout) {
        Ok(ready) => Ok(ready > 0 && fds[0].revents().contains(PollFlags::IN)),
        Err(err) => {
            trace!(?err, "polling fence failed");
            Err(Interrupted)
        }
    }
}

/// Owned fence file descriptor
///
/// The descriptor becomes readable once the fence signaled. It is closed when the
/// handle is dropped, moving the handle moves the responsibility to close it.
#[derive(Debug)]
pub struct FenceHandle(OwnedFd);

impl FenceHandle {
    /// Duplicate the underlying descriptor
    pub fn try_clone(&self) -> Result<FenceHandle, SyncError> {
        self.0.try_clone().map(FenceHandle).map_err(SyncError::Duplicate)
    }

    /// Returns true if the fence already signaled
    pub fn is_signaled(&self) -> bool {
        poll_readable(self.0.as_fd(), Some(Duration::ZERO)).unwrap_or(false)
    }

    /// Take the descriptor out of the handle
    pub fn into_fd(self) -> OwnedFd {
        self.0
    }
}

impl From<OwnedFd> for FenceHandle {
    fn from(fd: OwnedFd) -> Self {
        FenceHandle(fd)
    }
}

impl AsFd for FenceHandle {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.as_fd()
    }
}

/// A [`Fence`] backed by a pollable file descriptor
///
/// Sync files as well as eventfds qualify, both become readable once signaled.
#[derive(Debug)]
pub struct FdFence {
    fd: OwnedFd,
}

impl FdFence {
    /// Wrap a pollable fence descriptor
    pub fn new(fd: OwnedFd) -> FdFence {
        FdFence { fd }
    }

    /// Create a fence backed by a fresh eventfd
    pub fn eventfd(signaled: bool) -> io::Result<FdFence> {
        let fd = eventfd(
            signaled as u32,
            EventfdFlags::CLOEXEC | EventfdFlags::NONBLOCK,
        )?;
        Ok(FdFence { fd })
    }

    /// Signal an eventfd backed fence
    pub fn signal(&self) -> io::Result<()> {
        rustix::io::write(&self.fd, &1u64.to_ne_bytes())?;
        Ok(())
    }

    /// Export a handle to this fence
    pub fn handle(&self) -> io::Result<FenceHandle> {
        self.fd.try_clone().map(FenceHandle)
    }
}

impl Fence for FdFence {
    fn is_signaled(&self) -> bool {
        poll_readable(self.fd.as_fd(), Some(Duration::ZERO)).unwrap_or(false)
    }

    fn wait(&self) -> Result<(), Interrupted> {
        while !poll_readable(self.fd.as_fd(), None)? {}
        Ok(())
    }

    fn wait_timeout(&self, timeout: Duration) -> Result<bool, Interrupted> {
        poll_readable(self.fd.as_fd(), Some(timeout))
    }

    fn is_exportable(&self) -> bool {
        true
    }

    fn export(&self) -> Option<OwnedFd> {
        self.fd.try_clone().ok()
    }
}

/// A sync point the will be signaled in finite time
#[derive(Debug, Clone)]
#[must_use = "this `SyncPoint` may contain a fence that should be awaited, failing to do so may result in unexpected rendering artifacts"]
pub struct SyncPoint {
    fence: Option<Arc<dyn Fence>>,
}

impl Default for SyncPoint {
    fn default() -> Self {
        Self::signaled()
    }
}

impl SyncPoint {
    /// Create an already signaled sync point
    pub fn signaled() -> Self {
        Self {
            fence: Default::default(),
        }
    }

    /// Get a reference to the underlying [`Fence`] if any
    ///
    /// Returns `None` if the sync point does not contain a fence
    /// or contains a different type of fence
    pub fn get<F: Fence + 'static>(&self) -> Option<&F> {
        self.fence.as_ref().and_then(|f| f.downcast_ref())
    }

    /// Queries the state of the sync point
    ///
    /// Will always return `true` in case the sync point does not contain a fence
    pub fn is_reached(&self) -> bool {
        self.fence.as_ref().map(|f| f.is_signaled()).unwrap_or(true)
    }

    /// Blocks the current thread until the sync point is signaled
    ///
    /// If the sync point does not contain a fence this will never block.
    #[profiling::function]
    pub fn wait(&self) -> Result<(), Interrupted> {
        if let Some(fence) = self.fence.as_ref() {
            fence.wait()
        } else {
            Ok(())
        }
    }

    /// Blocks until the sync point is signaled, giving up after `timeout`
    ///
    /// Interrupted waits are retried up to [`WAIT_RETRY_BUDGET`] times.
    #[profiling::function]
    pub fn wait_bounded(&self, timeout: Duration) -> Result<(), SyncError> {
        let Some(fence) = self.fence.as_ref() else {
            return Ok(());
        };
        for attempt in 0..WAIT_RETRY_BUDGET {
            match fence.wait_timeout(timeout) {
                Ok(true) => return Ok(()),
                Ok(false) => return Err(SyncError::Timeout),
                Err(Interrupted) => trace!(attempt, "fence wait interrupted"),
            }
        }
        Err(SyncError::Wait(Box::new(Interrupted)))
    }

    /// Returns whether this sync point can be exported as a native fence fd
    ///
    /// Will always return `false` in case the sync point does not contain a fence
    pub fn is_exportable(&self) -> bool {
        self.fence.as_ref().map(|f| f.is_exportable()).unwrap_or(false)
    }

    /// Export this [`SyncPoint`] as a native fence fd
    ///
    /// Will always return `None` in case the sync point does not contain a fence
    #[profiling::function]
    pub fn export(&self) -> Option<FenceHandle> {
        self.fence.as_ref().and_then(|f| f.export()).map(FenceHandle)
    }
}

impl<T: Fence + 'static> From<T> for SyncPoint {
    fn from(value: T) -> Self {
        SyncPoint {
            fence: Some(Arc::new(value)),
        }
    }
}

/// Make the device wait for a client's acquire fence before sampling its buffer
///
/// The fence is duplicated, so the caller keeps its handle. Failures should be
/// reported to the client as a protocol error, the transaction must not be retried.
#[profiling::function]
pub fn wait_acquire<R: Renderer>(renderer: &mut R, fence: &FenceHandle) -> Result<(), SyncError> {
    if fence.is_signaled() {
        trace!("acquire fence already signaled");
        return Ok(());
    }
    let fence = fence.try_clone()?;
    let sync = renderer
        .import_fence(fence)
        .map_err(|err| SyncError::Import(Box::new(err)))?;
    renderer
        .queue_wait(sync)
        .map_err(|err| SyncError::Wait(Box::new(err)))
}

/// Consumer of a buffer release notification
///
/// Exactly one of the methods is called, after which the producer may reuse the buffer.
pub trait BufferRelease: fmt::Debug {
    /// The buffer is free now
    fn release(self: Box<Self>);

    /// The buffer is free once `fence` signals
    fn release_with_fence(self: Box<Self>, fence: FenceHandle);
}

/// Keeps the release fence of a buffer still read by the device
#[derive(Debug, Default)]
pub struct ReleaseTracker {
    fence: Option<FenceHandle>,
}

impl ReleaseTracker {
    /// Track the device work ending at `sync`
    ///
    /// The previously tracked fence is closed only after the new one was exported.
    pub fn update(&mut self, sync: &SyncPoint) -> Result<(), SyncError> {
        if sync.is_reached() {
            self.fence = None;
            return Ok(());
        }

        match sync.export() {
            Some(fence) => {
                let previous = self.fence.replace(fence);
                drop(previous);
                Ok(())
            }
            None => {
                warn!("Release point can not be exported, waiting for it");
                sync.wait_bounded(Duration::from_millis(100))?;
                self.fence = None;
                Ok(())
            }
        }
    }

    /// Returns true if a release fence is tracked
    pub fn has_fence(&self) -> bool {
        self.fence.is_some()
    }

    /// Notify `consumer` that the buffer is released
    ///
    /// The tracked fence, if any, moves into the consumer.
    pub fn release(&mut self, consumer: Box<dyn BufferRelease>) {
        match self.fence.take() {
            Some(fence) => consumer.release_with_fence(fence),
            None => consumer.release(),
        }
    }
}
