use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::ops::{Add, Sub};

/// Type-level marker for the logical coordinate space of an output
#[derive(Debug)]
pub struct Logical;

/// Type-level marker for the physical (device pixel) coordinate space
#[derive(Debug)]
pub struct Physical;

/// Type-level marker for the buffer coordinate space
#[derive(Debug)]
pub struct Buffer;

/// Trait for types serving as a coordinate for other geometry utils
pub trait Coordinate:
    Sized + Add<Self, Output = Self> + Sub<Self, Output = Self> + PartialOrd + Default + Copy + fmt::Debug
{
    /// A Coordinate that is 0
    const ZERO: Self;
    /// Upscale the coordinate
    fn upscale(self, scale: Self) -> Self;
    /// Downscale the coordinate
    fn downscale(self, scale: Self) -> Self;
    /// Convert the coordinate to a f64
    fn to_f64(self) -> f64;
    /// Convert to this coordinate from a f64
    fn from_f64(v: f64) -> Self;
    /// Saturating addition
    fn saturating_add(self, other: Self) -> Self;
    /// Saturating subtraction
    fn saturating_sub(self, other: Self) -> Self;
    /// Compare and return the smaller one
    fn min(self, other: Self) -> Self {
        if self < other {
            self
        } else {
            other
        }
    }
    /// Compare and return the larger one
    fn max(self, other: Self) -> Self {
        if self > other {
            self
        } else {
            other
        }
    }
}

impl Coordinate for i32 {
    const ZERO: i32 = 0;

    #[inline]
    fn upscale(self, scale: Self) -> Self {
        self.saturating_mul(scale)
    }
    #[inline]
    fn downscale(self, scale: Self) -> Self {
        self / scale
    }
    #[inline]
    fn to_f64(self) -> f64 {
        self as f64
    }
    #[inline]
    fn from_f64(v: f64) -> Self {
        v as i32
    }
    #[inline]
    fn saturating_add(self, other: Self) -> Self {
        i32::saturating_add(self, other)
    }
    #[inline]
    fn saturating_sub(self, other: Self) -> Self {
        i32::saturating_sub(self, other)
    }
}

impl Coordinate for f64 {
    const ZERO: f64 = 0.0;

    #[inline]
    fn upscale(self, scale: Self) -> Self {
        self * scale
    }
    #[inline]
    fn downscale(self, scale: Self) -> Self {
        self / scale
    }
    #[inline]
    fn to_f64(self) -> f64 {
        self
    }
    #[inline]
    fn from_f64(v: f64) -> Self {
        v
    }
    #[inline]
    fn saturating_add(self, other: Self) -> Self {
        self + other
    }
    #[inline]
    fn saturating_sub(self, other: Self) -> Self {
        self - other
    }
}

/// A point as defined by its x and y coordinates
///
/// Operations on points are saturating.
pub struct Point<N, Kind> {
    /// horizontal coordinate
    pub x: N,
    /// vertical coordinate
    pub y: N,
    _kind: PhantomData<Kind>,
}

impl<N: Coordinate, Kind> Point<N, Kind> {
    /// Convert this [`Point`] to a [`Size`] with the same coordinates
    #[inline]
    pub fn to_size(self) -> Size<N, Kind> {
        Size::from((self.x, self.y))
    }

    /// Convert the underlying numerical type to f64 for floating point manipulations
    #[inline]
    pub fn to_f64(self) -> Point<f64, Kind> {
        Point::from((self.x.to_f64(), self.y.to_f64()))
    }

    /// Scale the point up by the given factor
    #[inline]
    pub fn upscale(self, scale: N) -> Point<N, Kind> {
        Point::from((self.x.upscale(scale), self.y.upscale(scale)))
    }
}

impl<N: Coordinate> Point<N, Logical> {
    /// Convert this logical point to physical coordinate space according to given scale factor
    #[inline]
    pub fn to_physical(self, scale: N) -> Point<N, Physical> {
        Point::from((self.x.upscale(scale), self.y.upscale(scale)))
    }
}

impl<N: fmt::Debug, Kind> fmt::Debug for Point<N, Kind> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Point")
            .field("x", &self.x)
            .field("y", &self.y)
            .finish()
    }
}

impl<N, Kind> From<(N, N)> for Point<N, Kind> {
    #[inline]
    fn from((x, y): (N, N)) -> Point<N, Kind> {
        Point {
            x,
            y,
            _kind: PhantomData,
        }
    }
}

impl<N: Coordinate, Kind> Add for Point<N, Kind> {
    type Output = Point<N, Kind>;
    #[inline]
    fn add(self, other: Point<N, Kind>) -> Point<N, Kind> {
        Point::from((self.x.saturating_add(other.x), self.y.saturating_add(other.y)))
    }
}

impl<N: Coordinate, Kind> Sub for Point<N, Kind> {
    type Output = Point<N, Kind>;
    #[inline]
    fn sub(self, other: Point<N, Kind>) -> Point<N, Kind> {
        Point::from((self.x.saturating_sub(other.x), self.y.saturating_sub(other.y)))
    }
}

impl<N: Coordinate, Kind> Add<Size<N, Kind>> for Point<N, Kind> {
    type Output = Point<N, Kind>;
    #[inline]
    fn add(self, other: Size<N, Kind>) -> Point<N, Kind> {
        Point::from((self.x.saturating_add(other.w), self.y.saturating_add(other.h)))
    }
}

impl<N: Clone, Kind> Clone for Point<N, Kind> {
    #[inline]
    fn clone(&self) -> Self {
        Point {
            x: self.x.clone(),
            y: self.y.clone(),
            _kind: PhantomData,
        }
    }
}

impl<N: Copy, Kind> Copy for Point<N, Kind> {}

impl<N: PartialEq, Kind> PartialEq for Point<N, Kind> {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.x == other.x && self.y == other.y
    }
}

impl<N: Eq, Kind> Eq for Point<N, Kind> {}

impl<N: Hash, Kind> Hash for Point<N, Kind> {
    #[inline]
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.x.hash(state);
        self.y.hash(state);
    }
}

impl<N: Default, Kind> Default for Point<N, Kind> {
    fn default() -> Self {
        Point {
            x: N::default(),
            y: N::default(),
            _kind: PhantomData,
        }
    }
}

/// A size as defined by its width and height
///
/// Constructors of this type ensure that the values are always positive via
/// `debug_assert!()`.
pub struct Size<N, Kind> {
    /// horizontal coordinate
    pub w: N,
    /// vertical coordinate
    pub h: N,
    _kind: PhantomData<Kind>,
}

impl<N: Coordinate, Kind> Size<N, Kind> {
    /// Convert this [`Size`] to a [`Point`] with the same coordinates
    #[inline]
    pub fn to_point(self) -> Point<N, Kind> {
        Point::from((self.w, self.h))
    }

    /// Convert the underlying numerical type to f64 for floating point manipulations
    #[inline]
    pub fn to_f64(self) -> Size<f64, Kind> {
        Size::from((self.w.to_f64(), self.h.to_f64()))
    }

    /// Scale the size up by the given factor
    #[inline]
    pub fn upscale(self, scale: N) -> Size<N, Kind> {
        Size::from((self.w.upscale(scale), self.h.upscale(scale)))
    }

    /// Scale the size down by the given factor
    #[inline]
    pub fn downscale(self, scale: N) -> Size<N, Kind> {
        Size::from((self.w.downscale(scale), self.h.downscale(scale)))
    }

    /// Check if this [`Size`] is empty
    ///
    /// Returns true if either the width or the height is zero
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.w <= N::ZERO || self.h <= N::ZERO
    }
}

impl<N: Coordinate> Size<N, Logical> {
    /// Convert this logical size to physical coordinate space according to given scale factor
    #[inline]
    pub fn to_physical(self, scale: N) -> Size<N, Physical> {
        Size::from((self.w.upscale(scale), self.h.upscale(scale)))
    }
}

impl<N: Coordinate> Size<N, Physical> {
    /// Convert this physical size to logical coordinate space according to given scale factor
    #[inline]
    pub fn to_logical(self, scale: N) -> Size<N, Logical> {
        Size::from((self.w.downscale(scale), self.h.downscale(scale)))
    }
}

impl<N: fmt::Debug, Kind> fmt::Debug for Size<N, Kind> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Size")
            .field("w", &self.w)
            .field("h", &self.h)
            .finish()
    }
}

impl<N: Coordinate, Kind> From<(N, N)> for Size<N, Kind> {
    #[inline]
    fn from((w, h): (N, N)) -> Size<N, Kind> {
        debug_assert!(
            w >= N::ZERO && h >= N::ZERO,
            "Attempting to create a `Size` of negative size: {:?}",
            (w, h)
        );
        Size {
            w,
            h,
            _kind: PhantomData,
        }
    }
}

impl<N: Clone, Kind> Clone for Size<N, Kind> {
    #[inline]
    fn clone(&self) -> Self {
        Size {
            w: self.w.clone(),
            h: self.h.clone(),
            _kind: PhantomData,
        }
    }
}

impl<N: Copy, Kind> Copy for Size<N, Kind> {}

impl<N: PartialEq, Kind> PartialEq for Size<N, Kind> {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.w == other.w && self.h == other.h
    }
}

impl<N: Eq, Kind> Eq for Size<N, Kind> {}

impl<N: Hash, Kind> Hash for Size<N, Kind> {
    #[inline]
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.w.hash(state);
        self.h.hash(state);
    }
}

impl<N: Default, Kind> Default for Size<N, Kind> {
    fn default() -> Self {
        Size {
            w: N::default(),
            h: N::default(),
            _kind: PhantomData,
        }
    }
}

/// A rectangle defined by its top-left corner and dimensions
pub struct Rectangle<N, Kind> {
    /// Location of the top-left corner of the rectangle
    pub loc: Point<N, Kind>,
    /// Size of the rectangle, as (width, height)
    pub size: Size<N, Kind>,
}

impl<N: Coordinate, Kind> Rectangle<N, Kind> {
    /// Create a new [`Rectangle`] from the coordinates of its top-left corner and its dimensions
    #[inline]
    pub fn from_loc_and_size(loc: impl Into<Point<N, Kind>>, size: impl Into<Size<N, Kind>>) -> Self {
        Rectangle {
            loc: loc.into(),
            size: size.into(),
        }
    }

    /// Create a new [`Rectangle`] at the origin with the provided size
    #[inline]
    pub fn from_size(size: impl Into<Size<N, Kind>>) -> Self {
        Rectangle {
            loc: Point::default(),
            size: size.into(),
        }
    }

    /// Create a new [`Rectangle`] from the coordinates of its top-left corner and its bottom-right corner
    #[inline]
    pub fn from_extremities(
        topleft: impl Into<Point<N, Kind>>,
        bottomright: impl Into<Point<N, Kind>>,
    ) -> Self {
        let topleft = topleft.into();
        let bottomright = bottomright.into();
        Rectangle {
            loc: topleft,
            size: (bottomright - topleft).to_size(),
        }
    }

    /// Convert the underlying numerical type to f64 for floating point manipulations
    #[inline]
    pub fn to_f64(self) -> Rectangle<f64, Kind> {
        Rectangle {
            loc: self.loc.to_f64(),
            size: self.size.to_f64(),
        }
    }

    /// Scale the rectangle up by the given factor
    #[inline]
    pub fn upscale(self, scale: N) -> Rectangle<N, Kind> {
        Rectangle {
            loc: self.loc.upscale(scale),
            size: self.size.upscale(scale),
        }
    }

    /// Check if this [`Rectangle`] is empty
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.size.is_empty()
    }

    /// Checks whether given [`Point`] is inside the rectangle
    #[inline]
    pub fn contains<P: Into<Point<N, Kind>>>(self, point: P) -> bool {
        let p: Point<N, Kind> = point.into();
        (p.x >= self.loc.x)
            && (p.x < self.loc.x.saturating_add(self.size.w))
            && (p.y >= self.loc.y)
            && (p.y < self.loc.y.saturating_add(self.size.h))
    }

    /// Checks whether given [`Rectangle`] is inside the rectangle
    ///
    /// This includes rectangles with the same location and size
    #[inline]
    pub fn contains_rect<R: Into<Rectangle<N, Kind>>>(self, rect: R) -> bool {
        let r: Rectangle<N, Kind> = rect.into();
        r.loc.x >= self.loc.x
            && r.loc.y >= self.loc.y
            && r.loc.x.saturating_add(r.size.w) <= self.loc.x.saturating_add(self.size.w)
            && r.loc.y.saturating_add(r.size.h) <= self.loc.y.saturating_add(self.size.h)
    }

    /// Checks whether a given [`Rectangle`] overlaps with this one
    ///
    /// Touching edges do not count as overlap.
    #[inline]
    pub fn overlaps(self, other: impl Into<Rectangle<N, Kind>>) -> bool {
        let other = other.into();
        self.loc.x < other.loc.x.saturating_add(other.size.w)
            && other.loc.x < self.loc.x.saturating_add(self.size.w)
            && self.loc.y < other.loc.y.saturating_add(other.size.h)
            && other.loc.y < self.loc.y.saturating_add(self.size.h)
    }

    /// Clamp rectangle to min and max corners resulting in the overlapping area of two rectangles
    ///
    /// Returns `None` if the two rectangles don't overlap
    #[inline]
    pub fn intersection(self, other: impl Into<Rectangle<N, Kind>>) -> Option<Self> {
        let other = other.into();
        if !self.overlaps(other) {
            return None;
        }
        Some(Rectangle::from_extremities(
            (self.loc.x.max(other.loc.x), self.loc.y.max(other.loc.y)),
            (
                (self.loc.x.saturating_add(self.size.w)).min(other.loc.x.saturating_add(other.size.w)),
                (self.loc.y.saturating_add(self.size.h)).min(other.loc.y.saturating_add(other.size.h)),
            ),
        ))
    }

    /// Merge two [`Rectangle`] by producing the smallest rectangle that contains both
    #[inline]
    pub fn merge(self, other: Self) -> Self {
        if self.is_empty() {
            return other;
        }
        if other.is_empty() {
            return self;
        }
        Rectangle::from_extremities(
            (self.loc.x.min(other.loc.x), self.loc.y.min(other.loc.y)),
            (
                (self.loc.x.saturating_add(self.size.w)).max(other.loc.x.saturating_add(other.size.w)),
                (self.loc.y.saturating_add(self.size.h)).max(other.loc.y.saturating_add(other.size.h)),
            ),
        )
    }

    /// Subtract a set of [`Rectangle`]s from this [`Rectangle`]
    ///
    /// The result is a set of non-overlapping rectangles covering what is left.
    pub fn subtract_rects(self, others: impl IntoIterator<Item = Self>) -> Vec<Self> {
        Self::subtract_rects_many_in_place(vec![self], others)
    }

    /// Subtract a set of [`Rectangle`]s from a set of [`Rectangle`]s in-place
    pub fn subtract_rects_many_in_place(mut rects: Vec<Self>, others: impl IntoIterator<Item = Self>) -> Vec<Self> {
        for other in others {
            let items = rects.len();
            if items == 0 {
                return rects;
            }

            let mut checked = 0usize;
            let mut index = 0usize;
            while checked != items {
                checked += 1;

                let Some(cut) = rects[index].intersection(other) else {
                    index += 1;
                    continue;
                };

                let item = rects.remove(index);
                if other.contains_rect(item) {
                    continue;
                }

                let item_right = item.loc.x.saturating_add(item.size.w);
                let item_bottom = item.loc.y.saturating_add(item.size.h);
                let cut_right = cut.loc.x.saturating_add(cut.size.w);
                let cut_bottom = cut.loc.y.saturating_add(cut.size.h);

                // top and bottom bands span the full width, the sides only the cut height
                let pieces = [
                    Rectangle::from_extremities(item.loc, (item_right, cut.loc.y)),
                    Rectangle::from_extremities((item.loc.x, cut.loc.y), (cut.loc.x, cut_bottom)),
                    Rectangle::from_extremities((cut_right, cut.loc.y), (item_right, cut_bottom)),
                    Rectangle::from_extremities((item.loc.x, cut_bottom), (item_right, item_bottom)),
                ];
                rects.extend(pieces.into_iter().filter(|r| !r.is_empty()));
            }
        }

        rects
    }
}

impl<Kind> Rectangle<f64, Kind> {
    /// Convert to i32 by returning the largest integer-space rectangle fitting into the float-based rectangle
    #[inline]
    pub fn to_i32_down(self) -> Rectangle<i32, Kind> {
        Rectangle::from_extremities(
            (self.loc.x.ceil() as i32, self.loc.y.ceil() as i32),
            (
                (self.loc.x + self.size.w).floor() as i32,
                (self.loc.y + self.size.h).floor() as i32,
            ),
        )
    }

    /// Convert to i32 by returning the smallest integet-space rectangle encapsulating the float-based rectangle
    #[inline]
    pub fn to_i32_up(self) -> Rectangle<i32, Kind> {
        Rectangle::from_extremities(
            (self.loc.x.floor() as i32, self.loc.y.floor() as i32),
            (
                (self.loc.x + self.size.w).ceil() as i32,
                (self.loc.y + self.size.h).ceil() as i32,
            ),
        )
    }
}

impl<N: Coordinate> Rectangle<N, Logical> {
    /// Convert this logical rectangle to physical coordinate space according to given scale factor
    #[inline]
    pub fn to_physical(self, scale: N) -> Rectangle<N, Physical> {
        Rectangle {
            loc: self.loc.to_physical(scale),
            size: self.size.to_physical(scale),
        }
    }
}

impl<N: fmt::Debug, Kind> fmt::Debug for Rectangle<N, Kind> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rectangle")
            .field("x", &self.loc.x)
            .field("y", &self.loc.y)
            .field("width", &self.size.w)
            .field("height", &self.size.h)
            .finish()
    }
}

impl<N: Clone, Kind> Clone for Rectangle<N, Kind> {
    #[inline]
    fn clone(&self) -> Self {
        Rectangle {
            loc: self.loc.clone(),
            size: self.size.clone(),
        }
    }
}

impl<N: Copy, Kind> Copy for Rectangle<N, Kind> {}

impl<N: PartialEq, Kind> PartialEq for Rectangle<N, Kind> {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.loc == other.loc && self.size == other.size
    }
}

impl<N: Eq, Kind> Eq for Rectangle<N, Kind> {}

impl<N: Hash, Kind> Hash for Rectangle<N, Kind> {
    #[inline]
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.loc.hash(state);
        self.size.hash(state);
    }
}

impl<N: Default, Kind> Default for Rectangle<N, Kind> {
    fn default() -> Self {
        Rectangle {
            loc: Default::default(),
            size: Default::default(),
        }
    }
}

/// Possible transformations to two-dimensional planes
#[derive(Debug, Default, PartialEq, Eq, Hash, Clone, Copy)]
pub enum Transform {
    /// Identity transformation (plane is unaltered when applied)
    #[default]
    Normal,
    /// Plane is rotated by 90 degrees
    _90,
    /// Plane is rotated by 180 degrees
    _180,
    /// Plane is rotated by 270 degrees
    _270,
    /// Plane is flipped vertically
    Flipped,
    /// Plane is flipped vertically and rotated by 90 degrees
    Flipped90,
    /// Plane is flipped vertically and rotated by 180 degrees
    Flipped180,
    /// Plane is flipped vertically and rotated by 270 degrees
    Flipped270,
}

impl Transform {
    /// Inverts any 90-degree transformation into 270-degree transformations and vise versa.
    #[inline]
    pub fn invert(&self) -> Transform {
        match self {
            Transform::_90 => Transform::_270,
            Transform::_270 => Transform::_90,
            Transform::Flipped90 => Transform::Flipped270,
            Transform::Flipped270 => Transform::Flipped90,
            other => *other,
        }
    }

    /// Transformed size after applying this transformation.
    pub fn transform_size<N: Coordinate, Kind>(&self, size: Size<N, Kind>) -> Size<N, Kind> {
        if self.degrees() % 180 == 90 {
            (size.h, size.w).into()
        } else {
            size
        }
    }

    /// Transforms a point inside an area of a given size by applying this transformation.
    pub fn transform_point_in<N: Coordinate, Kind>(
        &self,
        point: Point<N, Kind>,
        area: &Size<N, Kind>,
    ) -> Point<N, Kind> {
        match *self {
            Transform::Normal => point,
            Transform::_90 => (area.h - point.y, point.x).into(),
            Transform::_180 => (area.w - point.x, area.h - point.y).into(),
            Transform::_270 => (point.y, area.w - point.x).into(),
            Transform::Flipped => (area.w - point.x, point.y).into(),
            Transform::Flipped90 => (point.y, point.x).into(),
            Transform::Flipped180 => (point.x, area.h - point.y).into(),
            Transform::Flipped270 => (area.h - point.y, area.w - point.x).into(),
        }
    }

    /// Transforms a rectangle inside an area of a given size by applying this transformation.
    pub fn transform_rect_in<N: Coordinate, Kind>(
        &self,
        rect: Rectangle<N, Kind>,
        area: &Size<N, Kind>,
    ) -> Rectangle<N, Kind> {
        let size = self.transform_size(rect.size);
        let right = area.w - rect.loc.x - rect.size.w;
        let bottom = area.h - rect.loc.y - rect.size.h;

        let loc: Point<N, Kind> = match *self {
            Transform::Normal => rect.loc,
            Transform::_90 => (bottom, rect.loc.x).into(),
            Transform::_180 => (right, bottom).into(),
            Transform::_270 => (rect.loc.y, right).into(),
            Transform::Flipped => (right, rect.loc.y).into(),
            Transform::Flipped90 => (bottom, right).into(),
            Transform::Flipped180 => (rect.loc.x, bottom).into(),
            Transform::Flipped270 => (rect.loc.y, rect.loc.x).into(),
        };

        Rectangle { loc, size }
    }

    /// Returns true if the transformation would flip contents
    pub fn flipped(&self) -> bool {
        !matches!(
            self,
            Transform::Normal | Transform::_90 | Transform::_180 | Transform::_270
        )
    }

    /// Returns the angle (in degrees) of the transformation
    #[inline]
    pub fn degrees(&self) -> u32 {
        match self {
            Transform::Normal | Transform::Flipped => 0,
            Transform::_90 | Transform::Flipped90 => 90,
            Transform::_180 | Transform::Flipped180 => 180,
            Transform::_270 | Transform::Flipped270 => 270,
        }
    }
}
