//! Screen geometry and region math
//!
//! Regions are kept as disjoint rectangle sets, so unioning the same area
//! twice is a no-op and subtraction never double-counts. Coordinates are
//! root-relative pixels; rectangles are half-open ([x1, x2) × [y1, y2)).

/// Window geometry as reported by the server. `(x, y)` is the top-left
/// corner of the border box; the client area starts at `(x + b, y + b)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Geometry {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl Geometry {
    pub fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    /// Zero-area windows cannot be painted.
    pub fn is_degenerate(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Bounding rectangle including the border on all four sides.
    pub fn border_box(&self, border: u32) -> Rect {
        let b = border as i32;
        Rect::new(
            self.x,
            self.y,
            self.x + self.width as i32 + 2 * b,
            self.y + self.height as i32 + 2 * b,
        )
    }

    pub fn to_rect(&self) -> Rect {
        Rect::new(
            self.x,
            self.y,
            self.x + self.width as i32,
            self.y + self.height as i32,
        )
    }
}

/// Axis-aligned rectangle with half-open extents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rect {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
}

impl Rect {
    pub fn new(x1: i32, y1: i32, x2: i32, y2: i32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn from_xywh(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self::new(x, y, x + width as i32, y + height as i32)
    }

    pub fn is_empty(&self) -> bool {
        self.x2 <= self.x1 || self.y2 <= self.y1
    }

    pub fn width(&self) -> u32 {
        (self.x2 - self.x1).max(0) as u32
    }

    pub fn height(&self) -> u32 {
        (self.y2 - self.y1).max(0) as u32
    }

    pub fn area(&self) -> u64 {
        self.width() as u64 * self.height() as u64
    }

    pub fn translate(self, dx: i32, dy: i32) -> Self {
        Self::new(self.x1 + dx, self.y1 + dy, self.x2 + dx, self.y2 + dy)
    }

    pub fn intersects(&self, other: &Rect) -> bool {
        self.x1 < other.x2 && other.x1 < self.x2 && self.y1 < other.y2 && other.y1 < self.y2
    }

    pub fn intersection(&self, other: &Rect) -> Option<Rect> {
        let r = Rect::new(
            self.x1.max(other.x1),
            self.y1.max(other.y1),
            self.x2.min(other.x2),
            self.y2.min(other.y2),
        );
        if r.is_empty() { None } else { Some(r) }
    }

    pub fn contains(&self, other: &Rect) -> bool {
        self.x1 <= other.x1 && self.y1 <= other.y1 && self.x2 >= other.x2 && self.y2 >= other.y2
    }

    /// Smallest rectangle covering both.
    pub fn union_bounds(&self, other: &Rect) -> Rect {
        if self.is_empty() {
            return *other;
        }
        if other.is_empty() {
            return *self;
        }
        Rect::new(
            self.x1.min(other.x1),
            self.y1.min(other.y1),
            self.x2.max(other.x2),
            self.y2.max(other.y2),
        )
    }

    /// Appends `self - hole` as up to four band rectangles.
    fn subtract_into(self, hole: &Rect, out: &mut Vec<Rect>) {
        let Some(cut) = self.intersection(hole) else {
            out.push(self);
            return;
        };
        if cut.y1 > self.y1 {
            out.push(Rect::new(self.x1, self.y1, self.x2, cut.y1));
        }
        if cut.y2 < self.y2 {
            out.push(Rect::new(self.x1, cut.y2, self.x2, self.y2));
        }
        if cut.x1 > self.x1 {
            out.push(Rect::new(self.x1, cut.y1, cut.x1, cut.y2));
        }
        if cut.x2 < self.x2 {
            out.push(Rect::new(cut.x2, cut.y1, self.x2, cut.y2));
        }
    }
}

/// A set of disjoint rectangles.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Region {
    rects: Vec<Rect>,
}

impl Region {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_rect(rect: Rect) -> Self {
        let mut r = Self::new();
        r.add_rect(rect);
        r
    }

    pub fn is_empty(&self) -> bool {
        self.rects.is_empty()
    }

    pub fn clear(&mut self) {
        self.rects.clear();
    }

    pub fn rects(&self) -> &[Rect] {
        &self.rects
    }

    /// Unions a rectangle in. Only the parts not already covered are
    /// inserted, which keeps the set disjoint and the union idempotent.
    pub fn add_rect(&mut self, rect: Rect) {
        if rect.is_empty() {
            return;
        }
        let mut pending = vec![rect];
        for existing in &self.rects {
            let mut next = Vec::with_capacity(pending.len());
            for piece in pending {
                piece.subtract_into(existing, &mut next);
            }
            if next.is_empty() {
                return;
            }
            pending = next;
        }
        self.rects.extend(pending);
    }

    pub fn union_with(&mut self, other: &Region) {
        for r in &other.rects {
            self.add_rect(*r);
        }
    }

    pub fn subtract_rect(&mut self, hole: &Rect) {
        if hole.is_empty() || self.rects.is_empty() {
            return;
        }
        let mut out = Vec::with_capacity(self.rects.len());
        for r in self.rects.drain(..) {
            r.subtract_into(hole, &mut out);
        }
        self.rects = out;
    }

    pub fn subtract(&mut self, other: &Region) {
        for hole in &other.rects {
            self.subtract_rect(hole);
        }
    }

    pub fn intersect_rect(&mut self, clip: &Rect) {
        self.rects.retain_mut(|r| {
            match r.intersection(clip) {
                Some(cut) => {
                    *r = cut;
                    true
                }
                None => false,
            }
        });
    }

    /// Pairwise intersection; disjoint inputs yield a disjoint result.
    pub fn intersection(&self, other: &Region) -> Region {
        let mut out = Region::new();
        for a in &self.rects {
            for b in &other.rects {
                if let Some(cut) = a.intersection(b) {
                    out.rects.push(cut);
                }
            }
        }
        out
    }

    pub fn translate(&mut self, dx: i32, dy: i32) {
        for r in &mut self.rects {
            *r = r.translate(dx, dy);
        }
    }

    /// Bounding box of the whole set.
    pub fn extents(&self) -> Option<Rect> {
        let mut it = self.rects.iter();
        let first = *it.next()?;
        Some(it.fold(first, |acc, r| acc.union_bounds(r)))
    }

    /// True if `rect` lies entirely inside the region.
    pub fn covers(&self, rect: &Rect) -> bool {
        if rect.is_empty() {
            return true;
        }
        let mut remainder = vec![*rect];
        for r in &self.rects {
            let mut next = Vec::with_capacity(remainder.len());
            for piece in remainder {
                piece.subtract_into(r, &mut next);
            }
            if next.is_empty() {
                return true;
            }
            remainder = next;
        }
        false
    }

    pub fn area(&self) -> u64 {
        self.rects.iter().map(Rect::area).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_union_is_idempotent() {
        let r = Rect::new(10, 10, 50, 50);
        let mut region = Region::new();
        region.add_rect(r);
        let once = region.clone();
        region.add_rect(r);
        assert_eq!(region, once);
        assert_eq!(region.area(), 40 * 40);
    }

    #[test]
    fn test_union_disjoint_and_overlapping() {
        let mut region = Region::new();
        region.add_rect(Rect::new(0, 0, 10, 10));
        region.add_rect(Rect::new(20, 0, 30, 10));
        assert_eq!(region.area(), 200);
        // Half-overlapping rect only adds its uncovered half.
        region.add_rect(Rect::new(5, 0, 15, 10));
        assert_eq!(region.area(), 250);
    }

    #[test]
    fn test_empty_rect_is_noop() {
        let mut region = Region::from_rect(Rect::new(0, 0, 10, 10));
        region.add_rect(Rect::new(5, 5, 5, 9));
        assert_eq!(region.area(), 100);
        assert!(Region::new().is_empty());
    }

    #[test]
    fn test_subtract_punches_hole() {
        let mut region = Region::from_rect(Rect::new(0, 0, 100, 100));
        region.subtract_rect(&Rect::new(25, 25, 75, 75));
        assert_eq!(region.area(), 10_000 - 2_500);
        assert!(!region.covers(&Rect::new(30, 30, 40, 40)));
        assert!(region.covers(&Rect::new(0, 0, 100, 25)));
    }

    #[test]
    fn test_intersection() {
        let a = Region::from_rect(Rect::new(0, 0, 50, 50));
        let b = Region::from_rect(Rect::new(25, 25, 100, 100));
        let cut = a.intersection(&b);
        assert_eq!(cut.extents(), Some(Rect::new(25, 25, 50, 50)));
        assert_eq!(cut.area(), 625);
    }

    #[test]
    fn test_covers_spanning_pieces() {
        // Coverage assembled from two touching rects.
        let mut region = Region::new();
        region.add_rect(Rect::new(0, 0, 50, 100));
        region.add_rect(Rect::new(50, 0, 100, 100));
        assert!(region.covers(&Rect::new(40, 40, 60, 60)));
    }

    #[test]
    fn test_border_box() {
        let g = Geometry::new(10, 20, 100, 200);
        assert_eq!(g.border_box(2), Rect::new(10, 20, 114, 224));
        assert_eq!(g.border_box(0), g.to_rect());
    }
}
