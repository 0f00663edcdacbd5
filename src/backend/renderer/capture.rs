//! Capture of output contents into client memory
//!
//! Captures are requested on an [`OutputRenderer`](super::damage::OutputRenderer) and
//! serviced after its next successful repaint. If the device reads pixels back
//! asynchronously the copy into the target is deferred until the read-back fence
//! signals, which requires a [`FenceScheduler`], usually a calloop [`LoopHandle`].
//! Without one the read-back is waited for with a bounded wait.

use std::{cell::RefCell, error::Error, fmt, rc::Rc, time::Duration};

use calloop::{LoopHandle, RegistrationToken};
use tracing::{debug, trace, warn};

use super::{
    sync::{FenceHandle, FenceSource, SyncError},
    Framebuffer, ReadPixels, Renderer,
};
use crate::{
    backend::allocator::{format, shm::ShmBuffer, Buffer, Fourcc},
    utils::{Buffer as BufferCoords, Physical, Rectangle, Size},
};

const READBACK_TIMEOUT: Duration = Duration::from_millis(100);

/// Part of an output to capture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CaptureSource {
    /// The composited content, without borders
    Framebuffer,
    /// The whole framebuffer, including borders
    FullFramebuffer,
    /// The content before the color transform was applied
    ///
    /// Only available while the output renders through a shadow buffer.
    Blending,
}

/// Errors of output capture
#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    /// The target does not match the size of the source
    #[error("capture target of size {target:?} does not match the source size {expected:?}")]
    InvalidSize {
        /// Size of the source
        expected: Size<i32, Physical>,
        /// Size of the target
        target: Size<i32, BufferCoords>,
    },
    /// The target format can not be written
    #[error("unsupported capture format {0:?}")]
    UnsupportedFormat(Fourcc),
    /// The target memory is too small
    #[error("capture target does not fit its pool")]
    InvalidTarget,
    /// [`CaptureSource::Blending`] was requested without a shadow buffer
    #[error("output has no blending buffer")]
    NoBlendingBuffer,
    /// The device failed to read the pixels
    #[error("reading back the output failed: {0}")]
    Readback(#[source] Box<dyn Error + Send + Sync>),
    /// Waiting for the read-back failed
    #[error("waiting for the read back failed")]
    Sync(#[from] SyncError),
    /// The read-back fence could not be registered
    #[error("scheduling the read back failed")]
    Schedule(#[source] calloop::Error),
    /// The output was destroyed before the capture completed
    #[error("output destroyed")]
    OutputDestroyed,
}

/// Completion callback of a capture
pub type CaptureCallback = Box<dyn FnOnce(Result<(), CaptureError>)>;

/// Runs tasks once fences signal
pub trait FenceScheduler {
    /// Run `task` once `fence` signaled
    fn schedule(&self, fence: FenceHandle, task: Box<dyn FnOnce()>) -> Result<RegistrationToken, calloop::Error>;

    /// Drop a scheduled task without running it
    fn cancel(&self, token: RegistrationToken);
}

impl<D: 'static> FenceScheduler for LoopHandle<'static, D> {
    fn schedule(&self, fence: FenceHandle, task: Box<dyn FnOnce()>) -> Result<RegistrationToken, calloop::Error> {
        let mut task = Some(task);
        self.insert_source(FenceSource::new(fence), move |_, _, _| {
            if let Some(task) = task.take() {
                task();
            }
        })
        .map_err(|err| err.error)
    }

    fn cancel(&self, token: RegistrationToken) {
        self.remove(token);
    }
}

pub(crate) fn validate_target(target: &ShmBuffer, expected: Size<i32, Physical>) -> Result<(), CaptureError> {
    let size = target.size();
    if size.w != expected.w || size.h != expected.h {
        return Err(CaptureError::InvalidSize { expected, target: size });
    }
    let Some(info) = format::lookup(target.fourcc()) else {
        return Err(CaptureError::UnsupportedFormat(target.fourcc()));
    };
    if info.is_yuv || info.plane_count() != 1 || info.gl.is_none() {
        return Err(CaptureError::UnsupportedFormat(target.fourcc()));
    }

    let row = info.min_stride(0, size.w as u32) as usize;
    let plane = target.planes()[0];
    if plane.stride < row || plane.offset + plane.stride * (size.h.max(1) as usize - 1) + row > target.pool().size()
    {
        return Err(CaptureError::InvalidTarget);
    }
    Ok(())
}

struct CaptureRequest {
    source: CaptureSource,
    target: ShmBuffer,
    callback: CaptureCallback,
}

struct PendingCapture {
    target: ShmBuffer,
    pixels: ReadPixels,
    flipped: bool,
    callback: CaptureCallback,
}

/// Copy read-back pixels into a target of the same size
pub(crate) fn copy_into(target: &ShmBuffer, pixels: &ReadPixels, flipped: bool) -> Result<(), CaptureError> {
    let size = target.size();
    let rows = size.h.max(0) as usize;
    let Some(info) = format::lookup(target.fourcc()) else {
        return Err(CaptureError::UnsupportedFormat(target.fourcc()));
    };
    let row_bytes = info.min_stride(0, size.w as u32) as usize;
    if pixels.data.len() < pixels.stride * rows.saturating_sub(1) + row_bytes {
        return Err(CaptureError::InvalidTarget);
    }

    target
        .with_plane_mut(0, |data, stride| {
            for row in 0..rows {
                // framebuffers storing rows bottom-up are read back in that order
                let src_row = if flipped { rows - 1 - row } else { row };
                let src = &pixels.data[src_row * pixels.stride..][..row_bytes];
                data[row * stride..][..row_bytes].copy_from_slice(src);
            }
        })
        .ok_or(CaptureError::InvalidTarget)
}

impl PendingCapture {
    fn complete(self) {
        let result = copy_into(&self.target, &self.pixels, self.flipped);
        if let Err(err) = &result {
            warn!(?err, "Capture failed");
        } else {
            trace!("capture completed");
        }
        (self.callback)(result);
    }
}

type SharedCapture = Rc<RefCell<Option<PendingCapture>>>;

/// Capture requests of one output
#[derive(Default)]
pub(crate) struct Captures {
    requests: Vec<CaptureRequest>,
    pending: Vec<(RegistrationToken, SharedCapture)>,
    scheduler: Option<Box<dyn FenceScheduler>>,
}

impl fmt::Debug for Captures {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Captures")
            .field("requests", &self.requests.len())
            .field("pending", &self.pending.len())
            .field("scheduler", &self.scheduler.is_some())
            .finish()
    }
}

impl Captures {
    pub(crate) fn set_scheduler(&mut self, scheduler: Box<dyn FenceScheduler>) {
        self.scheduler = Some(scheduler);
    }

    pub(crate) fn request(
        &mut self,
        source: CaptureSource,
        target: ShmBuffer,
        expected: Size<i32, Physical>,
        callback: CaptureCallback,
    ) -> Result<(), CaptureError> {
        validate_target(&target, expected)?;
        self.requests.push(CaptureRequest {
            source,
            target,
            callback,
        });
        Ok(())
    }

    /// Number of requests waiting for a repaint or a read-back
    pub(crate) fn len(&self) -> usize {
        let in_flight = self
            .pending
            .iter()
            .filter(|(_, shared)| shared.borrow().is_some())
            .count();
        self.requests.len() + in_flight
    }

    /// Read back the sources of all queued requests
    pub(crate) fn service<R: Renderer>(
        &mut self,
        renderer: &mut R,
        framebuffer: &R::Framebuffer,
        content: Rectangle<i32, Physical>,
        shadow: Option<&R::Framebuffer>,
    ) {
        self.pending.retain(|(_, shared)| shared.borrow().is_some());
        if self.requests.is_empty() {
            return;
        }

        for request in std::mem::take(&mut self.requests) {
            let (source, region) = match request.source {
                CaptureSource::Framebuffer => (framebuffer, content),
                CaptureSource::FullFramebuffer => (framebuffer, Rectangle::from_size(framebuffer.size())),
                CaptureSource::Blending => match shadow {
                    Some(shadow) => (shadow, Rectangle::from_size(shadow.size())),
                    None => {
                        (request.callback)(Err(CaptureError::NoBlendingBuffer));
                        continue;
                    }
                },
            };
            if let Err(err) = validate_target(&request.target, region.size) {
                (request.callback)(Err(err));
                continue;
            }

            let pixels = match renderer.read_pixels(source, region, request.target.fourcc()) {
                Ok(pixels) => pixels,
                Err(err) => {
                    (request.callback)(Err(CaptureError::Readback(Box::new(err))));
                    continue;
                }
            };

            let capture = PendingCapture {
                target: request.target,
                flipped: source.flipped(),
                pixels,
                callback: request.callback,
            };
            self.finish(capture);
        }
    }

    fn finish(&mut self, capture: PendingCapture) {
        if capture.pixels.sync.is_reached() {
            capture.complete();
            return;
        }

        if let Some(scheduler) = self.scheduler.as_ref() {
            if let Some(fence) = capture.pixels.sync.export() {
                let shared: SharedCapture = Rc::new(RefCell::new(Some(capture)));
                let task_capture = shared.clone();
                let task = Box::new(move || {
                    let capture = task_capture.borrow_mut().take();
                    if let Some(capture) = capture {
                        capture.complete();
                    }
                });
                match scheduler.schedule(fence, task) {
                    Ok(token) => {
                        debug!("capture deferred until the read back finished");
                        self.pending.push((token, shared));
                        return;
                    }
                    Err(err) => {
                        let capture = shared.borrow_mut().take();
                        if let Some(capture) = capture {
                            (capture.callback)(Err(CaptureError::Schedule(err)));
                        }
                        return;
                    }
                }
            }
        }

        match capture.pixels.sync.wait_bounded(READBACK_TIMEOUT) {
            Ok(()) => capture.complete(),
            Err(err) => (capture.callback)(Err(CaptureError::Sync(err))),
        }
    }
}

impl Drop for Captures {
    fn drop(&mut self) {
        for request in self.requests.drain(..) {
            (request.callback)(Err(CaptureError::OutputDestroyed));
        }
        for (token, shared) in self.pending.drain(..) {
            if let Some(scheduler) = self.scheduler.as_ref() {
                scheduler.cancel(token);
            }
            let capture = shared.borrow_mut().take();
            if let Some(capture) = capture {
                debug!("cancelling pending capture");
                (capture.callback)(Err(CaptureError::OutputDestroyed));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::allocator::shm::ShmPool;

    #[test]
    fn targets_are_validated() {
        let pool = ShmPool::create("capture-test", 16 * 16 * 4).unwrap();
        let expected = Size::from((16, 16));

        let ok = ShmBuffer::new(&pool, 0, (16, 16), 64, Fourcc::Xrgb8888);
        assert!(validate_target(&ok, expected).is_ok());

        let small = ShmBuffer::new(&pool, 0, (8, 8), 32, Fourcc::Xrgb8888);
        assert!(matches!(
            validate_target(&small, expected),
            Err(CaptureError::InvalidSize { .. })
        ));

        let yuv = ShmBuffer::new(&pool, 0, (16, 16), 16, Fourcc::Nv12);
        assert!(matches!(
            validate_target(&yuv, expected),
            Err(CaptureError::UnsupportedFormat(Fourcc::Nv12))
        ));

        let outside = ShmBuffer::new(&pool, 64, (16, 16), 64, Fourcc::Xrgb8888);
        assert!(matches!(
            validate_target(&outside, expected),
            Err(CaptureError::InvalidTarget)
        ));
    }

    #[test]
    fn dropping_fails_queued_requests() {
        let pool = ShmPool::create("capture-test", 4 * 4 * 4).unwrap();
        let result = Rc::new(RefCell::new(None));

        let mut captures = Captures::default();
        let slot = result.clone();
        captures
            .request(
                CaptureSource::Framebuffer,
                ShmBuffer::new(&pool, 0, (4, 4), 16, Fourcc::Argb8888),
                Size::from((4, 4)),
                Box::new(move |res| *slot.borrow_mut() = Some(res.map_err(|err| err.to_string()))),
            )
            .unwrap();
        assert_eq!(captures.len(), 1);

        drop(captures);
        assert_eq!(
            *result.borrow(),
            Some(Err(String::from("output destroyed")))
        );
    }
}
