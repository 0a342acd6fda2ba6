//! Decoded event surface
//!
//! The compositor core consumes `Notification`s instead of wire events;
//! the X layer decodes protocol events and resolves property payloads
//! before anything reaches the core. The `Listener` trait is the outbound
//! side, fed to whatever control surface sits on top.

use serde::{Deserialize, Serialize};

use crate::geometry::{Geometry, Rect, Region};
use crate::Xid;

/// EWMH `_NET_WM_WINDOW_TYPE`, reduced to the types the compositor
/// distinguishes for per-type defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WindowType {
    #[default]
    Normal,
    Desktop,
    Dock,
    Toolbar,
    Menu,
    Utility,
    Splash,
    Dialog,
    DropdownMenu,
    PopupMenu,
    Tooltip,
    Notification,
    Combo,
    Dnd,
    Unknown,
}

/// `_NET_WM_BYPASS_COMPOSITOR` hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BypassHint {
    #[default]
    NoPreference,
    /// The window asks to be unredirected.
    Bypass,
    /// The window asks to stay composited.
    Redirect,
}

impl BypassHint {
    pub fn from_property(value: Option<u32>) -> Self {
        match value {
            Some(1) => BypassHint::Bypass,
            Some(2) => BypassHint::Redirect,
            _ => BypassHint::NoPreference,
        }
    }
}

/// A property change, already fetched and decoded.
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyKind {
    /// `_NET_WM_WINDOW_OPACITY`, scaled to [0, 1]. `None` means the
    /// property was deleted.
    Opacity(Option<f64>),
    BypassCompositor(BypassHint),
    WindowType(WindowType),
    /// `_NET_FRAME_EXTENTS` in pixels: left, right, top, bottom.
    FrameExtents(u32, u32, u32, u32),
}

/// One decoded event from the display server.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    Created {
        window: Xid,
        geometry: Geometry,
        border_width: u32,
        override_redirect: bool,
        /// The window has an alpha-capable visual.
        argb: bool,
    },
    Destroyed {
        window: Xid,
    },
    Mapped {
        window: Xid,
    },
    Unmapped {
        window: Xid,
    },
    Configured {
        window: Xid,
        geometry: Geometry,
        border_width: u32,
        /// Sibling the window now sits directly above; `None` puts it at
        /// the bottom of the stack.
        above_sibling: Option<Xid>,
    },
    Reparented {
        window: Xid,
        parent: Xid,
    },
    /// The client window inside a WM frame was (re)discovered, or went
    /// away. `window` is always the frame id.
    ClientChanged {
        window: Xid,
        client: Option<Xid>,
        leader: Option<Xid>,
    },
    Circulated {
        window: Xid,
        to_top: bool,
    },
    Property {
        window: Xid,
        kind: PropertyKind,
    },
    /// Content damage in window-local coordinates.
    Damaged {
        window: Xid,
        area: Rect,
    },
    /// New bounding shape in window-local coordinates; `None` restores
    /// the plain rectangle.
    ShapeChanged {
        window: Xid,
        bounding: Option<Region>,
    },
    FocusIn {
        window: Xid,
    },
    FocusOut {
        window: Xid,
    },
    /// The root window (screen) changed size.
    RootConfigured {
        width: u32,
        height: u32,
    },
}

/// Observer for window lifecycle milestones. All methods default to
/// no-ops so a listener only implements what it cares about.
pub trait Listener {
    fn window_added(&mut self, _window: Xid) {}
    fn window_destroyed(&mut self, _window: Xid) {}
    fn window_mapped(&mut self, _window: Xid) {}
    fn window_unmapped(&mut self, _window: Xid) {}
    fn focus_in(&mut self, _window: Xid) {}
    fn focus_out(&mut self, _window: Xid) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bypass_hint_decoding() {
        assert_eq!(BypassHint::from_property(None), BypassHint::NoPreference);
        assert_eq!(BypassHint::from_property(Some(0)), BypassHint::NoPreference);
        assert_eq!(BypassHint::from_property(Some(1)), BypassHint::Bypass);
        assert_eq!(BypassHint::from_property(Some(2)), BypassHint::Redirect);
        // Unknown values read as no preference.
        assert_eq!(BypassHint::from_property(Some(7)), BypassHint::NoPreference);
    }
}
