#![cfg_attr(docsrs, feature(doc_auto_cfg))]
#![warn(missing_docs, missing_debug_implementations, rust_2018_idioms)]

//! # Kiln: the rendering core of a display compositor
//!
//! This crate turns client buffers into pixels on outputs. It does not talk to clients or
//! display hardware itself, but provides the pieces between them:
//!
//! - [`backend::allocator`] describes client memory: shared memory pools and dmabufs, and
//!   the [`format`](backend::allocator::format) catalog telling how pixels are laid out.
//! - [`backend::renderer::import`] turns client buffers into textures, splitting yuv
//!   buffers into planes sampled together.
//! - [`backend::renderer::damage`] repaints outputs, drawing only what changed since a
//!   renderbuffer was drawn last.
//! - [`backend::renderer::sync`] handles the fences clients attach to their buffers and
//!   the fences handed back once the device is done with them.
//! - [`backend::color`] describes color transformations, which
//!   [`backend::renderer::color`] turns into lookup tables of the device.
//!
//! Everything is written against the [`Renderer`](backend::renderer::Renderer) trait. The
//! `renderer_headless` feature provides an implementation that renders on the cpu, which is
//! useful for tests and for outputs nobody looks at.
//!
//! ## Event loop
//!
//! Objects are meant to live on a single thread driven by [`calloop`]. Fences become
//! event sources with [`FenceSource`](backend::renderer::sync::FenceSource), so waiting for
//! a client never blocks the compositor.
//!
//! ### Logging
//!
//! Kiln makes extensive use of [`tracing`] for its internal logging.
//!
//! For release builds it is recommended to limit the log level during compile time.
//! This can be done by adding a dependency to [`tracing`] and enabling the corresponding features.
//! For example to enable `trace` messages for debug builds, but limit release builds to `debug` add
//! the following in your binary crate `Cargo.toml`:
//!
//! ```toml
//! [dependencies]
//! tracing = { version = "0.1", features = ["max_level_trace", "release_max_level_debug"] }
//! ```
//!
//! If you do not want to use [`tracing`], refer to [`log compatibility`](tracing#log-compatibility)
//! for how to forward the debug output to other `log` compatible frameworks.

pub mod backend;
pub mod output;
pub mod utils;

pub mod reexports;
