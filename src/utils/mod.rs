//! Various utilities functions and types

mod geometry;
pub(crate) mod ids;
mod region;
pub mod signaling;

pub use self::geometry::{Buffer, Coordinate, Logical, Physical, Point, Rectangle, Size, Transform};
pub use self::region::Region;
pub use self::signaling::{HookId, Signaler};

/// This resource has been destroyed and can no longer be used.
#[derive(Debug)]
pub struct DeadResource;

impl std::fmt::Display for DeadResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("This resource has been destroyed and can no longer be used.")
    }
}

impl std::error::Error for DeadResource {}
