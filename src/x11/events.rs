//! Wire event decode
//!
//! Translates server events into `Notification`s for the compositor
//! core. Everything racy is fetched here with per-window tolerance: a
//! window can vanish between the event and our round trip, which
//! downgrades to a debug line instead of an error.

use anyhow::{Context, Result};
use tracing::{debug, trace};
use x11rb::protocol::damage::{self, ConnectionExt as _};
use x11rb::protocol::shape::{self, ConnectionExt as _, SK};
use x11rb::protocol::xfixes::ConnectionExt as _;
use x11rb::protocol::xproto::*;
use x11rb::protocol::Event;

use crate::events::{BypassHint, Notification, PropertyKind, WindowType};
use crate::geometry::{Geometry, Rect, Region};
use crate::x11::Session;
use crate::Xid;

impl Session {
    /// Decodes one event, pushing zero or more notifications. Events for
    /// the session's own windows never reach the core.
    pub fn decode(&mut self, event: &Event, out: &mut Vec<Notification>) {
        match event {
            Event::CreateNotify(e) => {
                if e.parent != self.root {
                    return;
                }
                if let Err(err) = self.adopt_window(e.window, out) {
                    debug!(
                        window = format_args!("{:#x}", e.window),
                        "adopt failed: {err:#}"
                    );
                }
            }
            Event::DestroyNotify(e) => {
                // The server freed the damage object with the window.
                self.forget_damage(e.window);
                if let Some(frame) = self.frame_by_client.remove(&e.window) {
                    out.push(Notification::ClientChanged {
                        window: frame,
                        client: None,
                        leader: None,
                    });
                    return;
                }
                self.frame_by_client.retain(|_, f| *f != e.window);
                if !self.is_own_window(e.window) {
                    out.push(Notification::Destroyed { window: e.window });
                }
            }
            Event::MapNotify(e) => {
                if !self.is_own_window(e.window) {
                    out.push(Notification::Mapped { window: e.window });
                }
            }
            Event::UnmapNotify(e) => {
                if !self.is_own_window(e.window) {
                    out.push(Notification::Unmapped { window: e.window });
                }
            }
            Event::ConfigureNotify(e) => {
                if e.window == self.root {
                    self.width = e.width;
                    self.height = e.height;
                    out.push(Notification::RootConfigured {
                        width: e.width as u32,
                        height: e.height as u32,
                    });
                } else if !self.is_own_window(e.window) {
                    out.push(Notification::Configured {
                        window: e.window,
                        geometry: Geometry::new(
                            e.x as i32,
                            e.y as i32,
                            e.width as u32,
                            e.height as u32,
                        ),
                        border_width: e.border_width as u32,
                        above_sibling: (e.above_sibling != x11rb::NONE).then_some(e.above_sibling),
                    });
                }
            }
            Event::ReparentNotify(e) => {
                if e.parent == self.root {
                    // Joined the top level set; treat it like a new window.
                    if let Err(err) = self.adopt_window(e.window, out) {
                        debug!(
                            window = format_args!("{:#x}", e.window),
                            "adopt failed: {err:#}"
                        );
                    }
                } else {
                    self.destroy_damage(e.window);
                    self.frame_by_client.retain(|_, f| *f != e.window);
                    out.push(Notification::Reparented {
                        window: e.window,
                        parent: e.parent,
                    });
                    // A window moving into a frame is often the client the
                    // frame is still missing.
                    if !self.frame_by_client.contains_key(&e.window) {
                        self.check_undetected_client(e.window, e.parent, out);
                    }
                }
            }
            Event::CirculateNotify(e) => {
                out.push(Notification::Circulated {
                    window: e.window,
                    to_top: e.place == Place::ON_TOP,
                });
            }
            Event::PropertyNotify(e) => self.decode_property(e, out),
            Event::DamageNotify(e) => self.decode_damage(e, out),
            Event::ShapeNotify(e) => self.decode_shape(e, out),
            Event::FocusIn(e) => {
                // Focus lands on the client window under a reparenting WM.
                if focus_is_real(e.mode, e.detail) {
                    out.push(Notification::FocusIn {
                        window: self.frame_of(e.event),
                    });
                }
            }
            Event::FocusOut(e) => {
                if focus_is_real(e.mode, e.detail) {
                    out.push(Notification::FocusOut {
                        window: self.frame_of(e.event),
                    });
                }
            }
            Event::Error(err) => {
                trace!("X error: {err:?}");
            }
            _ => {}
        }
    }

    /// Registers a top level window: event selection and damage tracking
    /// first, then the notifications that build its record.
    pub(crate) fn adopt_window(&mut self, window: Xid, out: &mut Vec<Notification>) -> Result<()> {
        if self.is_own_window(window) {
            return Ok(());
        }
        let attrs = self
            .conn
            .get_window_attributes(window)?
            .reply()
            .context("window attributes")?;
        if attrs.class == WindowClass::INPUT_ONLY {
            return Ok(());
        }
        let geom = self
            .conn
            .get_geometry(window)?
            .reply()
            .context("window geometry")?;

        // The root mask does not cover these.
        self.conn.change_window_attributes(
            window,
            &ChangeWindowAttributesAux::new()
                .event_mask(EventMask::PROPERTY_CHANGE | EventMask::FOCUS_CHANGE),
        )?;
        self.conn.shape_select_input(window, true)?;
        self.create_damage(window)?;

        out.push(Notification::Created {
            window,
            geometry: Geometry::new(
                geom.x as i32,
                geom.y as i32,
                geom.width as u32,
                geom.height as u32,
            ),
            border_width: geom.border_width as u32,
            override_redirect: attrs.override_redirect,
            argb: self.is_argb_visual(attrs.visual),
        });
        // If this window used to be some frame's client, it is not any
        // longer.
        if let Some(frame) = self.frame_by_client.remove(&window) {
            out.push(Notification::ClientChanged {
                window: frame,
                client: None,
                leader: None,
            });
        }
        let client = self.resolve_client(window, out);
        self.fetch_properties(window, client, out);

        let extents = self.conn.shape_query_extents(window)?.reply()?;
        if extents.bounding_shaped {
            match self.fetch_bounding_shape(window) {
                Ok(region) => out.push(Notification::ShapeChanged {
                    window,
                    bounding: Some(region),
                }),
                Err(e) => debug!(
                    window = format_args!("{window:#x}"),
                    "shape fetch failed: {e:#}"
                ),
            }
        }
        if attrs.map_state == MapState::VIEWABLE {
            out.push(Notification::Mapped { window });
        }
        Ok(())
    }

    /// Searches a fresh frame for the application window it wraps and
    /// reports the outcome. `None` means the frame is its own client, the
    /// usual case for override-redirect and unmanaged windows.
    fn resolve_client(&mut self, frame: Xid, out: &mut Vec<Notification>) -> Option<Xid> {
        let found = match self.find_client_window(frame) {
            Ok(c) => c.filter(|c| *c != frame),
            Err(e) => {
                debug!(
                    window = format_args!("{frame:#x}"),
                    "client search failed: {e:#}"
                );
                None
            }
        };
        match found {
            Some(client) => self.mark_client(frame, client, out),
            None => {
                let leader = self.fetch_leader(frame).unwrap_or_default();
                out.push(Notification::ClientChanged {
                    window: frame,
                    client: None,
                    leader,
                });
            }
        }
        found
    }

    /// Records `client` as the application window inside `frame` and
    /// subscribes to the events that now fire on the client instead.
    fn mark_client(&mut self, frame: Xid, client: Xid, out: &mut Vec<Notification>) {
        self.frame_by_client.retain(|_, f| *f != frame);
        self.frame_by_client.insert(client, frame);
        // Focus and EWMH property changes land on the client window.
        if let Err(e) = self.conn.change_window_attributes(
            client,
            &ChangeWindowAttributesAux::new()
                .event_mask(EventMask::PROPERTY_CHANGE | EventMask::FOCUS_CHANGE),
        ) {
            debug!(
                window = format_args!("{client:#x}"),
                "client event selection failed: {e:#}"
            );
        }
        let leader = self.fetch_leader(client).unwrap_or_default();
        debug!(
            frame = format_args!("{frame:#x}"),
            client = format_args!("{client:#x}"),
            "client window found"
        );
        out.push(Notification::ClientChanged {
            window: frame,
            client: Some(client),
            leader,
        });
    }

    /// `WM_STATE` showed up on a window nobody tracks. If its top level
    /// ancestor is a frame still missing a client, this is the one.
    fn check_late_client(&mut self, window: Xid, out: &mut Vec<Notification>) {
        if self.frame_by_client.contains_key(&window) || self.is_frame(window) {
            return;
        }
        let frame = match self.toplevel_ancestor(window) {
            Ok(Some(f)) if self.is_frame(f) && self.client_of(f).is_none() => f,
            Ok(_) => return,
            Err(e) => {
                debug!(
                    window = format_args!("{window:#x}"),
                    "client ancestry walk failed: {e:#}"
                );
                return;
            }
        };
        self.mark_client(frame, window, out);
        self.fetch_properties(frame, Some(window), out);
    }

    /// A window was reparented below a frame that has no client yet.
    /// Either it carries `WM_STATE` already, or it may gain it later, in
    /// which case its property traffic is watched for that.
    fn check_undetected_client(&mut self, window: Xid, parent: Xid, out: &mut Vec<Notification>) {
        let frame = match self.toplevel_ancestor(parent) {
            Ok(Some(f)) if self.is_frame(f) && self.client_of(f).is_none() => f,
            _ => return,
        };
        match self.has_wm_state(window) {
            Ok(true) => {
                self.mark_client(frame, window, out);
                self.fetch_properties(frame, Some(window), out);
            }
            Ok(false) => {
                let _ = self.conn.change_window_attributes(
                    window,
                    &ChangeWindowAttributesAux::new().event_mask(EventMask::PROPERTY_CHANGE),
                );
            }
            Err(e) => debug!(
                window = format_args!("{window:#x}"),
                "client probe failed: {e:#}"
            ),
        }
    }

    /// Depth-first search for the descendant carrying `WM_STATE`.
    fn find_client_window(&self, window: Xid) -> Result<Option<Xid>> {
        if self.has_wm_state(window)? {
            return Ok(Some(window));
        }
        let tree = self.conn.query_tree(window)?.reply()?;
        for child in tree.children {
            if let Some(found) = self.find_client_window(child)? {
                return Ok(Some(found));
            }
        }
        Ok(None)
    }

    fn has_wm_state(&self, window: Xid) -> Result<bool> {
        let reply = self
            .conn
            .get_property(false, window, self.atoms.wm_state, AtomEnum::ANY, 0, 0)?
            .reply()?;
        Ok(reply.type_ != x11rb::NONE)
    }

    fn fetch_leader(&self, window: Xid) -> Result<Option<Xid>> {
        let reply = self
            .conn
            .get_property(
                false,
                window,
                self.atoms.wm_client_leader,
                AtomEnum::WINDOW,
                0,
                1,
            )?
            .reply()?;
        Ok(reply
            .value32()
            .and_then(|mut v| v.next())
            .filter(|w| *w != x11rb::NONE))
    }

    /// Walks up to the child of the root that `window` lives under.
    fn toplevel_ancestor(&self, mut window: Xid) -> Result<Option<Xid>> {
        loop {
            let tree = self.conn.query_tree(window)?.reply()?;
            if tree.parent == self.root {
                return Ok(Some(window));
            }
            if tree.parent == x11rb::NONE {
                return Ok(None);
            }
            window = tree.parent;
        }
    }

    /// Opacity may sit on the frame or on the client; the frame wins.
    fn fetch_opacity_dual(&self, frame: Xid) -> Result<Option<f64>> {
        if let Some(v) = self.fetch_opacity(frame)? {
            return Ok(Some(v));
        }
        match self.client_of(frame) {
            Some(client) => self.fetch_opacity(client),
            None => Ok(None),
        }
    }

    fn decode_property(&mut self, e: &PropertyNotifyEvent, out: &mut Vec<Notification>) {
        let window = e.window;
        if self.is_own_window(window) || window == self.root {
            return;
        }
        if e.atom == self.atoms.wm_state {
            if e.state != Property::DELETE {
                self.check_late_client(window, out);
            }
            return;
        }
        let frame = self.frame_of(window);
        // A deletion falls out of the re-read as the property's default.
        let fetched = if e.atom == self.atoms.net_wm_window_opacity {
            self.fetch_opacity_dual(frame)
                .map(|v| Some(PropertyKind::Opacity(v)))
        } else if e.atom == self.atoms.net_wm_bypass_compositor {
            self.fetch_bypass(window)
                .map(|h| Some(PropertyKind::BypassCompositor(h)))
        } else if e.atom == self.atoms.net_wm_window_type {
            self.fetch_window_type(window)
                .map(|t| Some(PropertyKind::WindowType(t)))
        } else if e.atom == self.atoms.net_frame_extents {
            self.fetch_frame_extents(window)
                .map(|(l, r, t, b)| Some(PropertyKind::FrameExtents(l, r, t, b)))
        } else {
            Ok(None)
        };
        match fetched {
            // Attributed to the frame when the property lives on its
            // client.
            Ok(Some(kind)) => out.push(Notification::Property { window: frame, kind }),
            Ok(None) => {}
            Err(err) => debug!(
                window = format_args!("{window:#x}"),
                "property fetch failed: {err:#}"
            ),
        }
    }

    /// Pulls the precise damage region and resets it in one pass. The
    /// event's bounding rectangle is the fallback when the fetch fails.
    fn decode_damage(&self, e: &damage::NotifyEvent, out: &mut Vec<Notification>) {
        let window = e.drawable;
        let Some(&damage) = self.damage_by_window.get(&window) else {
            return;
        };
        match self.fetch_damage_region(damage) {
            Ok(rects) => {
                for area in rects {
                    out.push(Notification::Damaged { window, area });
                }
            }
            Err(err) => {
                debug!(
                    window = format_args!("{window:#x}"),
                    "damage fetch failed: {err:#}"
                );
                out.push(Notification::Damaged {
                    window,
                    area: Rect::from_xywh(
                        e.area.x as i32,
                        e.area.y as i32,
                        e.area.width as u32,
                        e.area.height as u32,
                    ),
                });
            }
        }
    }

    fn fetch_damage_region(&self, damage: damage::Damage) -> Result<Vec<Rect>> {
        self.conn
            .damage_subtract(damage, x11rb::NONE, self.scratch_region)?;
        let reply = self.conn.xfixes_fetch_region(self.scratch_region)?.reply()?;
        Ok(reply
            .rectangles
            .iter()
            .map(|r| Rect::from_xywh(r.x as i32, r.y as i32, r.width as u32, r.height as u32))
            .collect())
    }

    fn decode_shape(&self, e: &shape::NotifyEvent, out: &mut Vec<Notification>) {
        if e.shape_kind != SK::BOUNDING || self.is_own_window(e.affected_window) {
            return;
        }
        let window = e.affected_window;
        if !e.shaped {
            out.push(Notification::ShapeChanged {
                window,
                bounding: None,
            });
            return;
        }
        match self.fetch_bounding_shape(window) {
            Ok(region) => out.push(Notification::ShapeChanged {
                window,
                bounding: Some(region),
            }),
            Err(err) => debug!(
                window = format_args!("{window:#x}"),
                "shape fetch failed: {err:#}"
            ),
        }
    }

    fn fetch_bounding_shape(&self, window: Xid) -> Result<Region> {
        let reply = self
            .conn
            .shape_get_rectangles(window, SK::BOUNDING)?
            .reply()?;
        let mut region = Region::new();
        for r in &reply.rectangles {
            region.add_rect(Rect::from_xywh(
                r.x as i32,
                r.y as i32,
                r.width as u32,
                r.height as u32,
            ));
        }
        Ok(region)
    }

    /// Initial property sweep for a window. EWMH hints live on the client
    /// window when the WM wrapped the application in a frame, so that is
    /// where most of them are read from.
    fn fetch_properties(&self, frame: Xid, client: Option<Xid>, out: &mut Vec<Notification>) {
        let source = client.unwrap_or(frame);
        match self.fetch_window_type(source) {
            Ok(t) => out.push(Notification::Property {
                window: frame,
                kind: PropertyKind::WindowType(t),
            }),
            Err(e) => debug!(
                window = format_args!("{source:#x}"),
                "window type fetch failed: {e:#}"
            ),
        }
        match self.fetch_opacity_dual(frame) {
            Ok(Some(v)) => out.push(Notification::Property {
                window: frame,
                kind: PropertyKind::Opacity(Some(v)),
            }),
            Ok(None) => {}
            Err(e) => debug!(
                window = format_args!("{frame:#x}"),
                "opacity fetch failed: {e:#}"
            ),
        }
        match self.fetch_bypass(source) {
            Ok(BypassHint::NoPreference) | Err(_) => {}
            Ok(hint) => out.push(Notification::Property {
                window: frame,
                kind: PropertyKind::BypassCompositor(hint),
            }),
        }
        match self.fetch_frame_extents(source) {
            Ok((0, 0, 0, 0)) | Err(_) => {}
            Ok((l, r, t, b)) => out.push(Notification::Property {
                window: frame,
                kind: PropertyKind::FrameExtents(l, r, t, b),
            }),
        }
    }

    fn fetch_cardinals(&self, window: Xid, atom: Atom, len: u32) -> Result<Vec<u32>> {
        let reply = self
            .conn
            .get_property(false, window, atom, AtomEnum::CARDINAL, 0, len)?
            .reply()?;
        Ok(reply.value32().map(|v| v.collect()).unwrap_or_default())
    }

    fn fetch_opacity(&self, window: Xid) -> Result<Option<f64>> {
        let vals = self.fetch_cardinals(window, self.atoms.net_wm_window_opacity, 1)?;
        Ok(vals.first().map(|raw| f64::from(*raw) / f64::from(u32::MAX)))
    }

    fn fetch_bypass(&self, window: Xid) -> Result<BypassHint> {
        let vals = self.fetch_cardinals(window, self.atoms.net_wm_bypass_compositor, 1)?;
        Ok(BypassHint::from_property(vals.first().copied()))
    }

    /// First recognized atom in the list wins, matching how clients order
    /// their type preferences.
    fn fetch_window_type(&self, window: Xid) -> Result<WindowType> {
        let reply = self
            .conn
            .get_property(
                false,
                window,
                self.atoms.net_wm_window_type,
                AtomEnum::ATOM,
                0,
                32,
            )?
            .reply()?;
        let Some(atoms) = reply.value32() else {
            return Ok(WindowType::Normal);
        };
        let mut any = false;
        for atom in atoms {
            any = true;
            let t = self.atoms.window_type(atom);
            if t != WindowType::Unknown {
                return Ok(t);
            }
        }
        Ok(if any {
            WindowType::Unknown
        } else {
            WindowType::Normal
        })
    }

    fn fetch_frame_extents(&self, window: Xid) -> Result<(u32, u32, u32, u32)> {
        let v = self.fetch_cardinals(window, self.atoms.net_frame_extents, 4)?;
        if v.len() == 4 {
            Ok((v[0], v[1], v[2], v[3]))
        } else {
            Ok((0, 0, 0, 0))
        }
    }
}

/// Grab-transition and pointer focus events would thrash the focus
/// state without a user-visible focus change behind them.
fn focus_is_real(mode: NotifyMode, detail: NotifyDetail) -> bool {
    (mode == NotifyMode::NORMAL || mode == NotifyMode::WHILE_GRABBED)
        && detail != NotifyDetail::POINTER
        && detail != NotifyDetail::POINTER_ROOT
        && detail != NotifyDetail::NONE
}
