//! X server session
//!
//! Owns the connection, the interned atoms and the per-window damage
//! objects, and bootstraps what compositing needs from the server:
//! extension handshakes, the `_NET_WM_CM_Sn` selection, the composite
//! overlay with input pass-through and the initial window scan. Event
//! decoding lives in `events`, frame painting in `render`.

pub mod backend;
pub mod events;
pub mod render;
pub mod stream;

pub use backend::RenderBackend;
pub use render::Renderer;
pub use stream::EventStream;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tracing::{debug, info};
use x11rb::connection::{Connection, RequestConnection};
use x11rb::protocol::composite::{self, ConnectionExt as _};
use x11rb::protocol::damage::{self, ConnectionExt as _};
use x11rb::protocol::render::{self as xrender, ConnectionExt as _};
use x11rb::protocol::shape::{self, ConnectionExt as _, SK, SO};
use x11rb::protocol::xfixes::{self, ConnectionExt as _};
use x11rb::protocol::xproto::*;
use x11rb::rust_connection::RustConnection;

use crate::events::{Notification, WindowType};
use crate::Xid;

/// Interned atoms the session decodes properties with.
#[derive(Debug)]
pub struct Atoms {
    pub net_wm_cm: Atom,
    pub wm_state: Atom,
    pub wm_client_leader: Atom,
    pub net_wm_window_opacity: Atom,
    pub net_wm_bypass_compositor: Atom,
    pub net_frame_extents: Atom,
    pub net_wm_window_type: Atom,
    pub net_wm_window_type_desktop: Atom,
    pub net_wm_window_type_dock: Atom,
    pub net_wm_window_type_toolbar: Atom,
    pub net_wm_window_type_menu: Atom,
    pub net_wm_window_type_utility: Atom,
    pub net_wm_window_type_splash: Atom,
    pub net_wm_window_type_dialog: Atom,
    pub net_wm_window_type_dropdown_menu: Atom,
    pub net_wm_window_type_popup_menu: Atom,
    pub net_wm_window_type_tooltip: Atom,
    pub net_wm_window_type_notification: Atom,
    pub net_wm_window_type_combo: Atom,
    pub net_wm_window_type_dnd: Atom,
    pub net_wm_window_type_normal: Atom,
}

impl Atoms {
    /// Intern all required atoms
    pub fn new<C: Connection>(conn: &C, screen_num: usize) -> Result<Self> {
        // Helper to intern a single atom
        let intern = |name: &str| -> Result<Atom> {
            Ok(conn.intern_atom(false, name.as_bytes())?.reply()?.atom)
        };

        Ok(Self {
            net_wm_cm: intern(&format!("_NET_WM_CM_S{screen_num}"))?,
            wm_state: intern("WM_STATE")?,
            wm_client_leader: intern("WM_CLIENT_LEADER")?,
            net_wm_window_opacity: intern("_NET_WM_WINDOW_OPACITY")?,
            net_wm_bypass_compositor: intern("_NET_WM_BYPASS_COMPOSITOR")?,
            net_frame_extents: intern("_NET_FRAME_EXTENTS")?,
            net_wm_window_type: intern("_NET_WM_WINDOW_TYPE")?,
            net_wm_window_type_desktop: intern("_NET_WM_WINDOW_TYPE_DESKTOP")?,
            net_wm_window_type_dock: intern("_NET_WM_WINDOW_TYPE_DOCK")?,
            net_wm_window_type_toolbar: intern("_NET_WM_WINDOW_TYPE_TOOLBAR")?,
            net_wm_window_type_menu: intern("_NET_WM_WINDOW_TYPE_MENU")?,
            net_wm_window_type_utility: intern("_NET_WM_WINDOW_TYPE_UTILITY")?,
            net_wm_window_type_splash: intern("_NET_WM_WINDOW_TYPE_SPLASH")?,
            net_wm_window_type_dialog: intern("_NET_WM_WINDOW_TYPE_DIALOG")?,
            net_wm_window_type_dropdown_menu: intern("_NET_WM_WINDOW_TYPE_DROPDOWN_MENU")?,
            net_wm_window_type_popup_menu: intern("_NET_WM_WINDOW_TYPE_POPUP_MENU")?,
            net_wm_window_type_tooltip: intern("_NET_WM_WINDOW_TYPE_TOOLTIP")?,
            net_wm_window_type_notification: intern("_NET_WM_WINDOW_TYPE_NOTIFICATION")?,
            net_wm_window_type_combo: intern("_NET_WM_WINDOW_TYPE_COMBO")?,
            net_wm_window_type_dnd: intern("_NET_WM_WINDOW_TYPE_DND")?,
            net_wm_window_type_normal: intern("_NET_WM_WINDOW_TYPE_NORMAL")?,
        })
    }

    /// Maps a `_NET_WM_WINDOW_TYPE` atom to the reduced type set.
    pub fn window_type(&self, atom: Atom) -> WindowType {
        let table = [
            (self.net_wm_window_type_desktop, WindowType::Desktop),
            (self.net_wm_window_type_dock, WindowType::Dock),
            (self.net_wm_window_type_toolbar, WindowType::Toolbar),
            (self.net_wm_window_type_menu, WindowType::Menu),
            (self.net_wm_window_type_utility, WindowType::Utility),
            (self.net_wm_window_type_splash, WindowType::Splash),
            (self.net_wm_window_type_dialog, WindowType::Dialog),
            (self.net_wm_window_type_dropdown_menu, WindowType::DropdownMenu),
            (self.net_wm_window_type_popup_menu, WindowType::PopupMenu),
            (self.net_wm_window_type_tooltip, WindowType::Tooltip),
            (self.net_wm_window_type_notification, WindowType::Notification),
            (self.net_wm_window_type_combo, WindowType::Combo),
            (self.net_wm_window_type_dnd, WindowType::Dnd),
            (self.net_wm_window_type_normal, WindowType::Normal),
        ];
        table
            .iter()
            .find(|(a, _)| *a == atom)
            .map(|(_, t)| *t)
            .unwrap_or(WindowType::Unknown)
    }
}

pub struct Session {
    pub conn: Arc<RustConnection>,
    pub screen_num: usize,
    pub root: Xid,
    pub root_visual: Visualid,
    pub root_depth: u8,
    pub width: u16,
    pub height: u16,
    pub overlay: Xid,
    sel_window: Xid,
    pub(crate) atoms: Atoms,
    pub(crate) damage_by_window: HashMap<Xid, damage::Damage>,
    /// Discovered client window -> owning frame.
    pub(crate) frame_by_client: HashMap<Xid, Xid>,
    /// Reused for every damage fetch; never holds state across calls.
    pub(crate) scratch_region: xfixes::Region,
    visual_depth: HashMap<Visualid, u8>,
}

impl Session {
    /// Connects, negotiates extensions, takes the compositor selection
    /// and claims the overlay window.
    pub fn connect() -> Result<Self> {
        let (conn, screen_num) = x11rb::connect(None).context("Failed to connect to X server")?;
        let conn = Arc::new(conn);

        conn.extension_information(composite::X11_EXTENSION_NAME)?
            .context("Composite extension not available")?;
        conn.extension_information(damage::X11_EXTENSION_NAME)?
            .context("Damage extension not available")?;
        conn.extension_information(xfixes::X11_EXTENSION_NAME)?
            .context("XFixes extension not available")?;
        conn.extension_information(shape::X11_EXTENSION_NAME)?
            .context("Shape extension not available")?;
        conn.extension_information(xrender::X11_EXTENSION_NAME)?
            .context("Render extension not available")?;

        let composite_version = conn
            .composite_query_version(0, 4)?
            .reply()
            .context("Failed to query composite version")?;
        info!(
            "Composite extension {}.{}",
            composite_version.major_version, composite_version.minor_version
        );
        let damage_version = conn
            .damage_query_version(1, 1)?
            .reply()
            .context("Failed to query damage version")?;
        info!(
            "Damage extension {}.{}",
            damage_version.major_version, damage_version.minor_version
        );
        let xfixes_version = conn
            .xfixes_query_version(5, 0)?
            .reply()
            .context("Failed to query xfixes version")?;
        info!(
            "XFixes extension {}.{}",
            xfixes_version.major_version, xfixes_version.minor_version
        );
        let render_version = conn
            .render_query_version(0, 11)?
            .reply()
            .context("Failed to query render version")?;
        info!(
            "Render extension {}.{}",
            render_version.major_version, render_version.minor_version
        );
        conn.shape_query_version()?
            .reply()
            .context("Failed to query shape version")?;

        let screen = &conn.setup().roots[screen_num];
        let root = screen.root;
        let root_visual = screen.root_visual;
        let root_depth = screen.root_depth;
        let width = screen.width_in_pixels;
        let height = screen.height_in_pixels;
        let mut visual_depth = HashMap::new();
        for depth in &screen.allowed_depths {
            for visual in &depth.visuals {
                visual_depth.insert(visual.visual_id, depth.depth);
            }
        }

        let atoms = Atoms::new(conn.as_ref(), screen_num)?;

        // One compositing manager per screen.
        let owner = conn.get_selection_owner(atoms.net_wm_cm)?.reply()?.owner;
        if owner != x11rb::NONE {
            bail!("another compositing manager is running (selection owner {owner:#x})");
        }
        let sel_window = conn.generate_id()?;
        conn.create_window(
            0,
            sel_window,
            root,
            -1,
            -1,
            1,
            1,
            0,
            WindowClass::INPUT_ONLY,
            0,
            &CreateWindowAux::new().override_redirect(1),
        )?;
        conn.set_selection_owner(sel_window, atoms.net_wm_cm, x11rb::CURRENT_TIME)?;

        conn.change_window_attributes(
            root,
            &ChangeWindowAttributesAux::new().event_mask(
                EventMask::SUBSTRUCTURE_NOTIFY
                    | EventMask::STRUCTURE_NOTIFY
                    | EventMask::EXPOSURE
                    | EventMask::PROPERTY_CHANGE
                    | EventMask::FOCUS_CHANGE,
            ),
        )?
        .check()
        .context("Failed to select events on the root window")?;

        // Get Composite Overlay Window
        let overlay = conn
            .composite_get_overlay_window(root)?
            .reply()?
            .overlay_win;
        info!("Using Composite Overlay Window: {overlay:#x}");

        // Make overlay window input-transparent so events pass through to root
        conn.shape_rectangles(
            SO::SET,
            SK::INPUT,
            ClipOrdering::UNSORTED,
            overlay,
            0,
            0,
            &[],
        )?;
        // Expose on the overlay means its contents were lost.
        conn.change_window_attributes(
            overlay,
            &ChangeWindowAttributesAux::new().event_mask(EventMask::EXPOSURE),
        )?;

        let scratch_region = conn.generate_id()?;
        conn.xfixes_create_region(scratch_region, &[])?;
        conn.flush()?;

        Ok(Self {
            conn,
            screen_num,
            root,
            root_visual,
            root_depth,
            width,
            height,
            overlay,
            sel_window,
            atoms,
            damage_by_window: HashMap::new(),
            frame_by_client: HashMap::new(),
            scratch_region,
            visual_depth,
        })
    }

    /// Adopts the windows that already exist, bottom of the stack first.
    pub fn scan(&mut self) -> Result<Vec<Notification>> {
        let tree = self.conn.query_tree(self.root)?.reply()?;
        let mut out = Vec::new();
        for window in tree.children {
            if let Err(e) = self.adopt_window(window, &mut out) {
                debug!(window = format_args!("{window:#x}"), "skipped during scan: {e:#}");
            }
        }
        let adopted = out
            .iter()
            .filter(|n| matches!(n, Notification::Created { .. }))
            .count();
        info!(windows = adopted, "initial scan complete");
        Ok(out)
    }

    pub(crate) fn is_argb_visual(&self, visual: Visualid) -> bool {
        self.visual_depth.get(&visual) == Some(&32)
    }

    pub(crate) fn is_own_window(&self, window: Xid) -> bool {
        window == self.overlay || window == self.sel_window
    }

    /// Every adopted top level window has a damage object, which makes
    /// this the frame test.
    pub(crate) fn is_frame(&self, window: Xid) -> bool {
        self.damage_by_window.contains_key(&window)
    }

    pub(crate) fn client_of(&self, frame: Xid) -> Option<Xid> {
        self.frame_by_client
            .iter()
            .find(|(_, f)| **f == frame)
            .map(|(c, _)| *c)
    }

    /// Resolves an event window to the frame record it belongs to.
    pub(crate) fn frame_of(&self, window: Xid) -> Xid {
        self.frame_by_client.get(&window).copied().unwrap_or(window)
    }

    pub(crate) fn create_damage(&mut self, window: Xid) -> Result<()> {
        if self.damage_by_window.contains_key(&window) {
            return Ok(());
        }
        let id = self.conn.generate_id()?;
        self.conn
            .damage_create(id, window, damage::ReportLevel::NON_EMPTY)?
            .check()
            .context("Failed to create damage object")?;
        self.damage_by_window.insert(window, id);
        Ok(())
    }

    /// The window is gone; the server freed its damage object already.
    pub(crate) fn forget_damage(&mut self, window: Xid) {
        self.damage_by_window.remove(&window);
    }

    /// Stop watching a window that still exists.
    pub(crate) fn destroy_damage(&mut self, window: Xid) {
        if let Some(id) = self.damage_by_window.remove(&window) {
            let _ = self.conn.damage_destroy(id);
        }
    }

    /// While unredirected the overlay must stay unmapped or it would
    /// cover the screen with stale pixels.
    pub fn hide_overlay(&self) {
        let _ = self.conn.unmap_window(self.overlay);
        let _ = self.conn.flush();
    }

    /// Hands the overlay back to the server on the way out.
    pub fn release_overlay(&self) {
        let _ = self.conn.composite_release_overlay_window(self.overlay);
        let _ = self.conn.flush();
    }
}
