//! Output
//!
//! This module provides a type describing the properties of an [`Output`] that
//! influence how its contents are rendered: the current mode, its placement in the
//! global compositor space, the scale and transform, the decorative borders around
//! the content area and the color transform applied to everything shown on it.
//!
//! ```
//! # extern crate kiln;
//! use kiln::output::{BorderWidths, Mode, Output, OutputConfig};
//! use kiln::utils::{Rectangle, Size, Transform};
//!
//! let output = Output::new(
//!     OutputConfig::new("output-0", Mode { size: (1920, 1080).into(), refresh: 60000 })
//!         .with_location((1920, 0).into())
//!         .with_transform(Transform::_90)
//!         .with_borders(BorderWidths::uniform(8)),
//! );
//!
//! // rotated outputs swap their logical dimensions
//! assert_eq!(output.logical_size(), Size::from((1080, 1920)));
//! // the framebuffer holds the content area plus the borders
//! assert_eq!(output.framebuffer_size(), Size::from((1936, 1096)));
//! assert_eq!(
//!     output.logical_to_physical(Rectangle::from_loc_and_size((1920, 0), (1080, 1920))),
//!     Rectangle::from_loc_and_size((8, 8), (1920, 1080)),
//! );
//! ```

use crate::{
    backend::color::ColorTransform,
    utils::{Logical, Physical, Point, Rectangle, Size, Transform},
};

/// An output mode
///
/// A possible combination of dimensions and refresh rate for an output.
///
/// This should only describe the characteristics of the video driver,
/// not taking into account any global scaling.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct Mode {
    /// The size of the mode, in pixels
    pub size: Size<i32, Physical>,
    /// The refresh rate in millihertz
    ///
    /// `1000` is one fps (frame per second), `2000` is 2 fps, etc...
    pub refresh: i32,
}

/// Widths of the decorative borders around the content of an output, in pixels
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
pub struct BorderWidths {
    /// Border above the content
    pub top: i32,
    /// Border left of the content
    pub left: i32,
    /// Border right of the content
    pub right: i32,
    /// Border below the content
    pub bottom: i32,
}

impl BorderWidths {
    /// Borders of equal width on every side
    pub fn uniform(width: i32) -> BorderWidths {
        BorderWidths {
            top: width,
            left: width,
            right: width,
            bottom: width,
        }
    }
}

/// Initial properties of an [`Output`]
#[derive(Debug, Clone)]
pub struct OutputConfig {
    /// Name of the output
    pub name: String,
    /// Current mode
    pub mode: Mode,
    /// Position in the global compositor space
    pub location: Point<i32, Logical>,
    /// Integer scale factor
    pub scale: i32,
    /// Transform applied to the content
    pub transform: Transform,
    /// Decorative borders
    pub borders: BorderWidths,
    /// Color transform applied to the content
    pub color: ColorTransform,
}

impl OutputConfig {
    /// Output named `name` at the origin, unscaled and untransformed
    pub fn new(name: impl Into<String>, mode: Mode) -> OutputConfig {
        OutputConfig {
            name: name.into(),
            mode,
            location: Point::default(),
            scale: 1,
            transform: Transform::Normal,
            borders: BorderWidths::default(),
            color: ColorTransform::identity(),
        }
    }

    /// Place the output at `location`
    pub fn with_location(mut self, location: Point<i32, Logical>) -> Self {
        self.location = location;
        self
    }

    /// Scale the content by `scale`
    pub fn with_scale(mut self, scale: i32) -> Self {
        self.scale = scale.max(1);
        self
    }

    /// Transform the content
    pub fn with_transform(mut self, transform: Transform) -> Self {
        self.transform = transform;
        self
    }

    /// Surround the content with borders
    pub fn with_borders(mut self, borders: BorderWidths) -> Self {
        self.borders = borders;
        self
    }

    /// Apply `color` to the content
    pub fn with_color_transform(mut self, color: ColorTransform) -> Self {
        self.color = color;
        self
    }
}

/// Properties of an output relevant for rendering
#[derive(Debug, Clone)]
pub struct Output {
    config: OutputConfig,
}

impl Output {
    /// Create an output
    pub fn new(config: OutputConfig) -> Output {
        Output { config }
    }

    /// Name of the output
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// The current mode
    pub fn current_mode(&self) -> Mode {
        self.config.mode
    }

    /// Position in the global compositor space
    pub fn location(&self) -> Point<i32, Logical> {
        self.config.location
    }

    /// Integer scale factor
    pub fn scale(&self) -> i32 {
        self.config.scale
    }

    /// Transform applied to the content
    pub fn transform(&self) -> Transform {
        self.config.transform
    }

    /// Widths of the borders
    pub fn borders(&self) -> BorderWidths {
        self.config.borders
    }

    /// Color transform applied to the content
    pub fn color_transform(&self) -> &ColorTransform {
        &self.config.color
    }

    /// Size of the content in the global compositor space
    pub fn logical_size(&self) -> Size<i32, Logical> {
        let size = self.config.transform.transform_size(self.config.mode.size);
        Size::from((size.w, size.h)).downscale(self.config.scale)
    }

    /// Area covered in the global compositor space
    pub fn logical_geometry(&self) -> Rectangle<i32, Logical> {
        Rectangle::from_loc_and_size(self.config.location, self.logical_size())
    }

    /// Size of framebuffers of this output, content and borders
    pub fn framebuffer_size(&self) -> Size<i32, Physical> {
        let borders = self.config.borders;
        let mode = self.config.mode.size;
        Size::from((
            mode.w + borders.left + borders.right,
            mode.h + borders.top + borders.bottom,
        ))
    }

    /// Location of the content inside the framebuffer
    pub fn content_area(&self) -> Rectangle<i32, Physical> {
        Rectangle::from_loc_and_size(
            (self.config.borders.left, self.config.borders.top),
            self.config.mode.size,
        )
    }

    /// Map a rectangle of the global compositor space into the framebuffer
    ///
    /// The result may reach outside of the content area.
    pub fn logical_to_physical(&self, rect: Rectangle<i32, Logical>) -> Rectangle<i32, Physical> {
        let local = Rectangle::<i32, Logical>::from_loc_and_size(
            (rect.loc.x - self.config.location.x, rect.loc.y - self.config.location.y),
            rect.size,
        )
        .to_physical(self.config.scale);
        let area = self.config.transform.transform_size(self.config.mode.size);
        let mut rect = self.config.transform.invert().transform_rect_in(local, &area);
        rect.loc = rect.loc + self.content_area().loc;
        rect
    }

    pub(crate) fn set_mode(&mut self, mode: Mode) {
        self.config.mode = mode;
    }

    pub(crate) fn set_transform(&mut self, transform: Transform) {
        self.config.transform = transform;
    }

    pub(crate) fn set_scale(&mut self, scale: i32) {
        self.config.scale = scale.max(1);
    }

    pub(crate) fn set_location(&mut self, location: Point<i32, Logical>) {
        self.config.location = location;
    }

    pub(crate) fn set_color_transform(&mut self, color: ColorTransform) {
        self.config.color = color;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn output(transform: Transform) -> Output {
        Output::new(
            OutputConfig::new(
                "test",
                Mode {
                    size: (800, 600).into(),
                    refresh: 60_000,
                },
            )
            .with_transform(transform),
        )
    }

    #[test]
    fn modes_can_be_collected_in_sets() {
        let modes: std::collections::HashSet<Mode> = [(1920, 1080), (1280, 720), (1920, 1080)]
            .into_iter()
            .map(|size| Mode {
                size: size.into(),
                refresh: 60_000,
            })
            .collect();
        assert_eq!(modes.len(), 2);
    }

    #[test]
    fn normal_outputs_map_directly() {
        let output = output(Transform::Normal);
        let rect = Rectangle::from_loc_and_size((10, 20), (30, 40));
        assert_eq!(
            output.logical_to_physical(rect),
            Rectangle::from_loc_and_size((10, 20), (30, 40))
        );
    }

    #[test]
    fn rotated_outputs_rotate_rects() {
        let output = output(Transform::_90);
        assert_eq!(output.logical_size(), Size::from((600, 800)));
        // the top left corner of the logical space ends up in a corner of the panel
        let corner = output.logical_to_physical(Rectangle::from_loc_and_size((0, 0), (10, 20)));
        assert_eq!(corner.size, Size::from((20, 10)));
        assert!(Rectangle::from_size(output.current_mode().size).contains_rect(corner));
    }

    #[test]
    fn scale_applies_before_offsets() {
        let mut output = output(Transform::Normal);
        output.set_scale(2);
        output.set_location((100, 0).into());
        assert_eq!(output.logical_size(), Size::from((400, 300)));
        assert_eq!(
            output.logical_to_physical(Rectangle::from_loc_and_size((110, 5), (10, 10))),
            Rectangle::from_loc_and_size((20, 10), (20, 20))
        );
    }
}
