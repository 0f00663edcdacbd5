use drm_fourcc::DrmFourcc;

use crate::backend::{
    allocator::shm::ShmError,
    renderer::{sync::SyncError, RendererError},
    SwapBuffersError,
};

/// Error returned during rendering using the headless renderer
#[derive(thiserror::Error, Debug)]
pub enum HeadlessError {
    /// The given buffer has an unsupported pixel format
    #[error("Unsupported pixel format: {0:?}")]
    UnsupportedPixelFormat(DrmFourcc),
    /// The configured amount of device resources is used up
    #[error("Out of texture memory, {0} resources alive")]
    OutOfMemory(usize),
    /// The memory of a dmabuf plane cannot be mapped by the device
    #[error("The buffer memory is not accessible to the device")]
    MemoryTypeMismatch,
    /// The given buffer is incomplete
    #[error("Incomplete buffer {expected} < {actual}")]
    IncompleteBuffer {
        /// Expected len of the buffer
        expected: usize,
        /// Actual len of the buffer
        actual: usize,
    },
    /// Mapping the buffer failed
    #[error("Mapping the buffer failed: {0}")]
    Map(#[from] ShmError),
    /// Querying the buffer memory failed
    #[error("Failed to inspect the buffer memory: {0}")]
    Stat(#[source] rustix::io::Errno),
    /// Creating or importing a fence failed
    #[error("Fence operation failed: {0}")]
    Fence(#[source] std::io::Error),
    /// Waiting for a fence failed
    #[error("Waiting for a fence failed: {0}")]
    Wait(#[from] SyncError),
    /// A fence did not signal in time
    #[error("Fence did not signal in time")]
    FenceTimeout,
    /// A resource of another renderer was used
    #[error("The resource belongs to a different renderer")]
    ForeignResource,
    /// A rectangle reaches outside of the resource it refers to
    #[error("Region out of bounds")]
    OutOfBounds,
    /// Presenting a frame failed
    #[error("Presenting the frame failed")]
    PresentFailed,
    /// The requested operation is not supported
    #[error("The requested operation is not supported")]
    Unsupported,
}

impl RendererError for HeadlessError {
    fn is_resource_exhaustion(&self) -> bool {
        matches!(self, HeadlessError::OutOfMemory(_))
    }
}

impl From<HeadlessError> for SwapBuffersError {
    fn from(value: HeadlessError) -> Self {
        match value {
            err @ HeadlessError::PresentFailed => SwapBuffersError::TemporaryFailure(Box::new(err)),
            err => SwapBuffersError::ContextLost(Box::new(err)),
        }
    }
}
