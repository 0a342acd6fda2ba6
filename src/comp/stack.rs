//! Window stack
//!
//! Windows live in a slot arena addressed by generational handles, with
//! the stacking order kept as an explicit sequence of handles (topmost
//! first). Handles stay valid across restacks and go stale on removal,
//! so a record destroyed mid-iteration can never be touched through an
//! old handle.

use crate::comp::window::{CompWindow, WinState};
use crate::Xid;

/// Stable, generation-checked reference to a stacked window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WinHandle {
    index: u32,
    serial: u32,
}

#[derive(Debug, Default)]
struct Slot {
    serial: u32,
    window: Option<CompWindow>,
}

/// The stacking order of all tracked windows.
#[derive(Debug, Default)]
pub struct WindowStack {
    slots: Vec<Slot>,
    free: Vec<u32>,
    /// Topmost first.
    order: Vec<WinHandle>,
}

impl WindowStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Adds a window at the top of the stack, where the server places
    /// newly created windows.
    pub fn insert_top(&mut self, window: CompWindow) -> WinHandle {
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.slots.push(Slot::default());
                (self.slots.len() - 1) as u32
            }
        };
        let slot = &mut self.slots[index as usize];
        slot.window = Some(window);
        let handle = WinHandle {
            index,
            serial: slot.serial,
        };
        self.order.insert(0, handle);
        handle
    }

    pub fn get(&self, handle: WinHandle) -> Option<&CompWindow> {
        let slot = self.slots.get(handle.index as usize)?;
        if slot.serial != handle.serial {
            return None;
        }
        slot.window.as_ref()
    }

    pub fn get_mut(&mut self, handle: WinHandle) -> Option<&mut CompWindow> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.serial != handle.serial {
            return None;
        }
        slot.window.as_mut()
    }

    /// Removes a window; the handle and any copies of it go stale.
    pub fn remove(&mut self, handle: WinHandle) -> Option<CompWindow> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.serial != handle.serial {
            return None;
        }
        let window = slot.window.take()?;
        slot.serial = slot.serial.wrapping_add(1);
        self.free.push(handle.index);
        self.order.retain(|h| *h != handle);
        Some(window)
    }

    /// Looks up a window by server id. Records fading out after their
    /// destroy are skipped, so a reused numeric id resolves to the live
    /// record.
    pub fn find(&self, id: Xid) -> Option<WinHandle> {
        self.order.iter().copied().find(|&h| {
            self.get(h)
                .is_some_and(|w| w.id == id && w.state() != WinState::Destroying)
        })
    }

    /// Stacking order, topmost first.
    pub fn order(&self) -> &[WinHandle] {
        &self.order
    }

    /// Snapshot of the order for iteration that mutates the stack.
    pub fn handles(&self) -> Vec<WinHandle> {
        self.order.clone()
    }

    pub fn position(&self, handle: WinHandle) -> Option<usize> {
        self.order.iter().position(|h| *h == handle)
    }

    pub fn iter(&self) -> impl Iterator<Item = (WinHandle, &CompWindow)> {
        self.order.iter().filter_map(|&h| Some((h, self.get(h)?)))
    }

    /// Restacks directly above `sibling`; `None` moves to the bottom, an
    /// unknown sibling to the top. Returns whether the order changed.
    pub fn restack_above(&mut self, handle: WinHandle, sibling: Option<Xid>) -> bool {
        let Some(current) = self.position(handle) else {
            return false;
        };
        self.order.remove(current);
        let target = match sibling {
            None => self.order.len(),
            Some(sib) => self
                .order
                .iter()
                .position(|&h| self.get(h).is_some_and(|w| w.id == sib))
                .unwrap_or(0),
        };
        self.order.insert(target, handle);
        target != current
    }

    pub fn restack_top(&mut self, handle: WinHandle) -> bool {
        let Some(current) = self.position(handle) else {
            return false;
        };
        if current == 0 {
            return false;
        }
        self.order.remove(current);
        self.order.insert(0, handle);
        true
    }

    pub fn restack_bottom(&mut self, handle: WinHandle) -> bool {
        let Some(current) = self.position(handle) else {
            return false;
        };
        if current == self.order.len() - 1 {
            return false;
        }
        self.order.remove(current);
        self.order.push(handle);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Geometry;

    fn window(id: Xid) -> CompWindow {
        CompWindow::new(id, Geometry::new(0, 0, 100, 100), 0, false)
    }

    #[test]
    fn test_new_windows_stack_on_top() {
        let mut stack = WindowStack::new();
        let a = stack.insert_top(window(1));
        let b = stack.insert_top(window(2));
        let c = stack.insert_top(window(3));
        assert_eq!(stack.order(), &[c, b, a]);
        assert_eq!(stack.len(), 3);
    }

    #[test]
    fn test_stale_handle_after_removal() {
        let mut stack = WindowStack::new();
        let a = stack.insert_top(window(1));
        assert!(stack.remove(a).is_some());
        assert!(stack.get(a).is_none());
        assert!(stack.remove(a).is_none());

        // The slot gets reused but the old handle stays dead.
        let b = stack.insert_top(window(2));
        assert!(stack.get(a).is_none());
        assert_eq!(stack.get(b).map(|w| w.id), Some(2));
    }

    #[test]
    fn test_find_skips_destroying_record() {
        let mut stack = WindowStack::new();
        let old = stack.insert_top(window(7));
        stack.get_mut(old).unwrap().force_state_for_tests(WinState::Destroying);
        // Server reused the id for a fresh window while the old record
        // still fades out.
        let fresh = stack.insert_top(window(7));
        assert_eq!(stack.find(7), Some(fresh));
        assert_eq!(stack.len(), 2);
    }

    #[test]
    fn test_restack_above_sibling() {
        let mut stack = WindowStack::new();
        let a = stack.insert_top(window(1));
        let b = stack.insert_top(window(2));
        let c = stack.insert_top(window(3));
        // Put c directly above a: order becomes [b, c, a].
        assert!(stack.restack_above(c, Some(1)));
        assert_eq!(stack.order(), &[b, c, a]);
        // None sends to the bottom.
        assert!(stack.restack_above(b, None));
        assert_eq!(stack.order(), &[c, a, b]);
        // Unknown sibling lands on top.
        assert!(stack.restack_above(b, Some(99)));
        assert_eq!(stack.order(), &[b, c, a]);
    }

    #[test]
    fn test_circulate_endpoints() {
        let mut stack = WindowStack::new();
        let a = stack.insert_top(window(1));
        let b = stack.insert_top(window(2));
        let c = stack.insert_top(window(3));
        assert!(stack.restack_top(a));
        assert_eq!(stack.order(), &[a, c, b]);
        assert!(stack.restack_bottom(a));
        assert_eq!(stack.order(), &[c, b, a]);
        // Already at the bottom.
        assert!(!stack.restack_bottom(a));
    }
}
