//! Damage accumulation
//!
//! The pending repaint region for the next frame. Damage reported while
//! compositing is bypassed is noted but its region dropped; stale partial
//! damage would be meaningless after re-redirection, so that instead
//! forces one full-screen repaint.

use tracing::trace;

use crate::geometry::{Rect, Region};

#[derive(Debug)]
pub struct DamageTracker {
    pending: Region,
    redirected: bool,
    damaged_while_unredirected: bool,
}

impl Default for DamageTracker {
    fn default() -> Self {
        Self {
            pending: Region::new(),
            redirected: true,
            damaged_while_unredirected: false,
        }
    }
}

impl DamageTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Unions a region into the pending frame. Empty input is a no-op and
    /// re-adding an already pending area changes nothing.
    pub fn add(&mut self, region: &Region) {
        if region.is_empty() {
            return;
        }
        if !self.redirected {
            self.damaged_while_unredirected = true;
            return;
        }
        self.pending.union_with(region);
    }

    pub fn add_rect(&mut self, rect: Rect) {
        if rect.is_empty() {
            return;
        }
        if !self.redirected {
            self.damaged_while_unredirected = true;
            return;
        }
        self.pending.add_rect(rect);
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn pending(&self) -> &Region {
        &self.pending
    }

    /// Hands the accumulated region to the painter and starts the next
    /// frame empty.
    pub fn take(&mut self) -> Region {
        std::mem::take(&mut self.pending)
    }

    pub fn force_full(&mut self, width: u32, height: u32) {
        self.pending = Region::from_rect(Rect::from_xywh(0, 0, width, height));
    }

    /// Compositing was bypassed; pending damage is useless now.
    pub fn unredirect(&mut self) {
        self.redirected = false;
        self.pending.clear();
        trace!("damage tracking suspended while unredirected");
    }

    /// Compositing resumed; repaint everything once instead of replaying
    /// stale partial damage.
    pub fn redirect(&mut self, width: u32, height: u32) {
        self.redirected = true;
        self.damaged_while_unredirected = false;
        self.force_full(width, height);
    }

    /// Whether any damage arrived since compositing was bypassed.
    pub fn damaged_while_unredirected(&self) -> bool {
        self.damaged_while_unredirected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_is_idempotent() {
        let mut tracker = DamageTracker::new();
        let region = Region::from_rect(Rect::new(0, 0, 100, 100));
        tracker.add(&region);
        let once = tracker.pending().area();
        tracker.add(&region);
        assert_eq!(tracker.pending().area(), once);
    }

    #[test]
    fn test_add_empty_is_noop() {
        let mut tracker = DamageTracker::new();
        tracker.add(&Region::new());
        tracker.add_rect(Rect::new(5, 5, 5, 50));
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_take_drains_pending() {
        let mut tracker = DamageTracker::new();
        tracker.add_rect(Rect::new(0, 0, 10, 10));
        let taken = tracker.take();
        assert_eq!(taken.area(), 100);
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_unredirected_damage_is_noted_not_kept() {
        let mut tracker = DamageTracker::new();
        tracker.unredirect();
        assert!(!tracker.damaged_while_unredirected());
        tracker.add_rect(Rect::new(0, 0, 10, 10));
        assert!(tracker.is_empty());
        assert!(tracker.damaged_while_unredirected());
    }

    #[test]
    fn test_redirect_forces_full_screen() {
        let mut tracker = DamageTracker::new();
        tracker.add_rect(Rect::new(0, 0, 10, 10));
        tracker.unredirect();
        tracker.add_rect(Rect::new(20, 20, 30, 30));
        tracker.redirect(1920, 1080);
        assert!(!tracker.damaged_while_unredirected());
        assert_eq!(tracker.pending().area(), 1920 * 1080);
    }
}
