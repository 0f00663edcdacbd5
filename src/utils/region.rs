use std::fmt;

use smallvec::SmallVec;

use super::{Point, Rectangle};

/// A set of pixels described by non-overlapping rectangles
///
/// Used to accumulate damage and to describe visible and opaque parts of surfaces.
/// The rectangles stored are guaranteed to never overlap, so the area of a region
/// is the sum of the areas of its rectangles.
pub struct Region<Kind> {
    rects: SmallVec<[Rectangle<i32, Kind>; 4]>,
}

impl<Kind> Region<Kind> {
    /// Create an empty region
    pub fn new() -> Self {
        Region {
            rects: SmallVec::new(),
        }
    }

    /// Create a region covering a single rectangle
    pub fn from_rect(rect: Rectangle<i32, Kind>) -> Self {
        let mut region = Region::new();
        region.union_rect(rect);
        region
    }

    /// Create a region covering the union of the given rectangles
    pub fn from_rects(rects: impl IntoIterator<Item = Rectangle<i32, Kind>>) -> Self {
        let mut region = Region::new();
        for rect in rects {
            region.union_rect(rect);
        }
        region
    }

    /// Returns true if this region covers no pixel
    pub fn is_empty(&self) -> bool {
        self.rects.is_empty()
    }

    /// The non-overlapping rectangles making up this region
    pub fn rects(&self) -> &[Rectangle<i32, Kind>] {
        &self.rects
    }

    /// Number of pixels covered by this region
    pub fn area(&self) -> i64 {
        self.rects
            .iter()
            .map(|r| r.size.w as i64 * r.size.h as i64)
            .sum()
    }

    /// Smallest rectangle containing the whole region
    pub fn extents(&self) -> Rectangle<i32, Kind> {
        self.rects
            .iter()
            .fold(Rectangle::default(), |acc, rect| acc.merge(*rect))
    }

    /// Remove every pixel from the region
    pub fn clear(&mut self) {
        self.rects.clear();
    }

    /// Add a rectangle to the region
    pub fn union_rect(&mut self, rect: Rectangle<i32, Kind>) {
        if rect.is_empty() || self.rects.iter().any(|r| r.contains_rect(rect)) {
            return;
        }
        // drop everything the new rect swallows, then only add what is not yet covered
        self.rects.retain(|r| !rect.contains_rect(*r));
        let missing = rect.subtract_rects(self.rects.iter().copied());
        self.rects.extend(missing);
    }

    /// Add another region to this region
    pub fn union(&mut self, other: &Region<Kind>) {
        for rect in other.rects.iter() {
            self.union_rect(*rect);
        }
    }

    /// Remove a rectangle from the region
    pub fn subtract_rect(&mut self, rect: Rectangle<i32, Kind>) {
        self.subtract_rects(std::iter::once(rect));
    }

    /// Remove a set of rectangles from the region
    pub fn subtract_rects(&mut self, rects: impl IntoIterator<Item = Rectangle<i32, Kind>>) {
        let remaining = Rectangle::subtract_rects_many_in_place(self.rects.drain(..).collect(), rects);
        self.rects.extend(remaining);
    }

    /// Remove another region from this region
    pub fn subtract(&mut self, other: &Region<Kind>) {
        self.subtract_rects(other.rects.iter().copied());
    }

    /// Restrict the region to the given rectangle
    pub fn intersect_rect(&mut self, clip: Rectangle<i32, Kind>) {
        let rects = std::mem::take(&mut self.rects);
        self.rects = rects.into_iter().filter_map(|r| r.intersection(clip)).collect();
    }

    /// Compute the intersection of two regions
    pub fn intersection(&self, other: &Region<Kind>) -> Region<Kind> {
        // pairwise intersections of two disjoint sets are disjoint themselves
        let rects = self
            .rects
            .iter()
            .flat_map(|a| other.rects.iter().filter_map(move |b| a.intersection(*b)))
            .collect();
        Region { rects }
    }

    /// Returns true if the region covers every pixel of `rect`
    pub fn contains_rect(&self, rect: Rectangle<i32, Kind>) -> bool {
        rect.subtract_rects(self.rects.iter().copied()).is_empty()
    }

    /// Move every rectangle of the region by the given offset
    pub fn translate(&mut self, offset: Point<i32, Kind>) {
        for rect in self.rects.iter_mut() {
            rect.loc = rect.loc + offset;
        }
    }
}

impl<Kind> Default for Region<Kind> {
    fn default() -> Self {
        Region::new()
    }
}

impl<Kind> Clone for Region<Kind> {
    fn clone(&self) -> Self {
        Region {
            rects: self.rects.clone(),
        }
    }
}

impl<Kind> fmt::Debug for Region<Kind> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.rects.iter()).finish()
    }
}

impl<Kind> PartialEq for Region<Kind> {
    /// Regions are equal if they cover the same pixels, regardless of how they are split up
    fn eq(&self, other: &Self) -> bool {
        self.area() == other.area() && self.rects.iter().all(|r| other.contains_rect(*r))
    }
}

impl<Kind> From<Rectangle<i32, Kind>> for Region<Kind> {
    fn from(rect: Rectangle<i32, Kind>) -> Self {
        Region::from_rect(rect)
    }
}
