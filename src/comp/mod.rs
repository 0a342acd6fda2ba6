//! Compositor core
//!
//! One explicit context owns the window stack, the damage accumulator,
//! the animation clock and the backend seam. Decoded notifications come
//! in and turn into state transitions and damage; once per wakeup,
//! `prepare_frame` (in `paint`) turns the accumulated state into a paint
//! plan. Per-window failures are contained to that window; nothing here
//! tears the session down.

pub mod damage;
pub mod paint;
pub mod stack;
pub mod window;

use std::time::Instant;

use tracing::{debug, error, info, trace, warn};

use crate::animation::{Finished, TransitionEvent};
use crate::backend::Backend;
use crate::config::Config;
use crate::events::{Listener, Notification, PropertyKind};
use crate::geometry::{Geometry, Rect};
use crate::Xid;

use damage::DamageTracker;
use paint::FadeClock;
use stack::{WinHandle, WindowStack};
use window::{CompWindow, DestroyStart, FinishAction, WinFlags, WinState};

pub use paint::{FrameResult, PaintEntry, PaintPlan};

/// The compositing session model. All mutation happens on the loop
/// thread through `handle_notification` and `prepare_frame`.
pub struct Compositor {
    config: Config,
    stack: WindowStack,
    damage: DamageTracker,
    clock: FadeClock,
    backend: Box<dyn Backend>,
    listener: Option<Box<dyn Listener>>,
    root: Xid,
    screen_width: u32,
    screen_height: u32,
    redirected: bool,
    unredir_deadline: Option<Instant>,
    focused: Option<WinHandle>,
}

impl Compositor {
    pub fn new(
        config: Config,
        backend: Box<dyn Backend>,
        root: Xid,
        screen_width: u32,
        screen_height: u32,
    ) -> Self {
        let clock = FadeClock::new(config.tick_duration());
        let mut damage = DamageTracker::new();
        // First frame paints everything.
        damage.force_full(screen_width, screen_height);
        Self {
            config,
            stack: WindowStack::new(),
            damage,
            clock,
            backend,
            listener: None,
            root,
            screen_width,
            screen_height,
            redirected: true,
            unredir_deadline: None,
            focused: None,
        }
    }

    pub fn set_listener(&mut self, listener: Box<dyn Listener>) {
        self.listener = Some(listener);
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn root(&self) -> Xid {
        self.root
    }

    pub fn screen_size(&self) -> (u32, u32) {
        (self.screen_width, self.screen_height)
    }

    /// Whether compositing is currently active (not bypassed).
    pub fn redirected(&self) -> bool {
        self.redirected
    }

    pub fn window(&self, handle: WinHandle) -> Option<&CompWindow> {
        self.stack.get(handle)
    }

    pub fn find_window(&self, id: Xid) -> Option<WinHandle> {
        self.stack.find(id)
    }

    pub fn window_count(&self) -> usize {
        self.stack.len()
    }

    /// Applies one decoded server notification to the model.
    pub fn handle_notification(&mut self, event: Notification) {
        trace!(?event, "notification");
        match event {
            Notification::Created {
                window,
                geometry,
                border_width,
                override_redirect,
                argb,
            } => self.add_window(window, geometry, border_width, override_redirect, argb),
            Notification::Destroyed { window } => self.destroy_window(window),
            Notification::Mapped { window } => self.map_window(window),
            Notification::Unmapped { window } => self.unmap_window(window),
            Notification::Configured {
                window,
                geometry,
                border_width,
                above_sibling,
            } => self.configure_window(window, geometry, border_width, above_sibling),
            Notification::Reparented { window, parent } => self.reparent_window(window, parent),
            Notification::ClientChanged {
                window,
                client,
                leader,
            } => self.client_changed(window, client, leader),
            Notification::Circulated { window, to_top } => self.circulate_window(window, to_top),
            Notification::Property { window, kind } => self.property_changed(window, kind),
            Notification::Damaged { window, area } => self.damage_window(window, area),
            Notification::ShapeChanged { window, bounding } => {
                self.shape_changed(window, bounding)
            }
            Notification::FocusIn { window } => self.focus_changed(window, true),
            Notification::FocusOut { window } => self.focus_changed(window, false),
            Notification::RootConfigured { width, height } => self.root_resized(width, height),
        }
    }

    /// Force-completes every in-flight animation to its terminal value,
    /// used for resets and configuration reloads.
    pub fn skip_all_fading(&mut self) {
        for handle in self.stack.handles() {
            let fin = match self.stack.get_mut(handle) {
                Some(w) => w.skip_fading(),
                None => None,
            };
            self.check_fade_finished(handle, fin);
        }
    }

    /// Swaps in a new configuration: fades are skipped to their terminal
    /// values first, then per-type options are re-resolved and the screen
    /// repainted once.
    pub fn update_config(&mut self, config: Config) {
        info!("configuration reload");
        self.skip_all_fading();
        self.config = config;
        self.clock = FadeClock::new(self.config.tick_duration());
        for handle in self.stack.handles() {
            if let Some(w) = self.stack.get_mut(handle) {
                w.apply_config(&self.config);
            }
            self.refresh_opacity_target(handle);
        }
        self.invalidate_ignore_all();
        self.damage.force_full(self.screen_width, self.screen_height);
    }

    /// Queues a repaint of the whole screen.
    pub fn force_repaint(&mut self) {
        self.damage.force_full(self.screen_width, self.screen_height);
    }

    /// Overrides the redirect heuristic. Forcing redirection on also
    /// cancels an armed unredirect debounce; the override never loses
    /// that race.
    pub fn set_force_redirect(&mut self, force: Option<bool>) {
        self.config.unredirect.force_redirect = force;
        if force == Some(true) && self.unredir_deadline.take().is_some() {
            debug!("pending unredirect canceled by override");
        }
    }

    fn add_window(
        &mut self,
        id: Xid,
        geometry: Geometry,
        border_width: u32,
        override_redirect: bool,
        argb: bool,
    ) {
        if self.stack.find(id).is_some() {
            warn!(window = format_args!("{id:#x}"), "created twice, ignoring");
            return;
        }
        let mut w = CompWindow::new(id, geometry, border_width, override_redirect);
        w.argb = argb;
        w.apply_config(&self.config);
        self.stack.insert_top(w);
        debug!(window = format_args!("{id:#x}"), "window added");
        if let Some(listener) = self.listener.as_deref_mut() {
            listener.window_added(id);
        }
    }

    fn map_window(&mut self, id: Xid) {
        let Some(handle) = self.stack.find(id) else {
            trace!(window = format_args!("{id:#x}"), "map for untracked window");
            return;
        };
        // A map can arrive while the unmap fade still runs; the unmap is
        // forced to completion first so the map starts from UNMAPPED.
        if self
            .stack
            .get(handle)
            .is_some_and(|w| w.state() == WinState::Unmapping)
        {
            let fin = self.stack.get_mut(handle).and_then(|w| w.skip_fading());
            self.check_fade_finished(handle, fin);
        }

        let Some((target, wintype)) = self
            .stack
            .get(handle)
            .map(|w| (self.target_opacity(w), w.window_type))
        else {
            return;
        };
        let ticks = self.config.openclose_fade_ticks(0.0, target, wintype);
        let result = match self.stack.get_mut(handle) {
            Some(w) => w.start_map(target, ticks),
            None => return,
        };
        match result {
            Ok(begun) => {
                self.apply_finished(handle, begun.canceled);
                self.apply_finished(handle, begun.completed);
                self.invalidate_ignore_from(handle);
                if let Some(listener) = self.listener.as_deref_mut() {
                    listener.window_mapped(id);
                }
            }
            Err(e) => error!(window = format_args!("{id:#x}"), "dropped request: {e}"),
        }
    }

    fn unmap_window(&mut self, id: Xid) {
        let Some(handle) = self.stack.find(id) else {
            trace!(window = format_args!("{id:#x}"), "unmap for untracked window");
            return;
        };
        let Some((current, wintype)) = self
            .stack
            .get(handle)
            .map(|w| (w.opacity.get(), w.window_type))
        else {
            return;
        };
        let ticks = self.config.openclose_fade_ticks(current, 0.0, wintype);
        let result = match self.stack.get_mut(handle) {
            Some(w) => w.start_unmap(ticks),
            None => return,
        };
        match result {
            Ok(begun) => {
                self.damage_extents(handle);
                self.apply_finished(handle, begun.canceled);
                self.apply_finished(handle, begun.completed);
                // An unmap before the fade-in finished lands straight in
                // UNMAPPED without a completion to release resources.
                if self
                    .stack
                    .get(handle)
                    .is_some_and(|w| w.state() == WinState::Unmapped)
                {
                    self.release_window_images(handle);
                }
                self.invalidate_ignore_from(handle);
                if let Some(listener) = self.listener.as_deref_mut() {
                    listener.window_unmapped(id);
                }
            }
            Err(e) => error!(window = format_args!("{id:#x}"), "dropped request: {e}"),
        }
    }

    fn destroy_window(&mut self, id: Xid) {
        let Some(handle) = self.stack.find(id) else {
            trace!(window = format_args!("{id:#x}"), "destroy for untracked window");
            return;
        };
        if let Some(listener) = self.listener.as_deref_mut() {
            listener.window_destroyed(id);
        }
        let Some((current, wintype)) = self
            .stack
            .get(handle)
            .map(|w| (w.opacity.get(), w.window_type))
        else {
            return;
        };
        let ticks = self.config.openclose_fade_ticks(current, 0.0, wintype);
        let result = match self.stack.get_mut(handle) {
            Some(w) => w.start_destroy(ticks),
            None => return,
        };
        match result {
            Ok(DestroyStart::RemoveNow) => self.remove_window(handle),
            Ok(DestroyStart::Fading(begun)) => {
                self.damage_extents(handle);
                self.apply_finished(handle, begun.canceled);
                self.apply_finished(handle, begun.completed);
                self.invalidate_ignore_from(handle);
            }
            Ok(DestroyStart::Superseded) => {
                trace!(window = format_args!("{id:#x}"), "destroy retargeted unmap fade");
            }
            Err(e) => error!(window = format_args!("{id:#x}"), "dropped request: {e}"),
        }
    }

    fn reparent_window(&mut self, id: Xid, parent: Xid) {
        if parent == self.root {
            // Back under the root: track it again if it is new to us. Its
            // geometry arrives with the following configure.
            if self.stack.find(id).is_none() {
                self.add_window(id, Geometry::default(), 0, false, false);
            }
        } else {
            // No longer a top-level window; drop it like a destroy.
            self.destroy_window(id);
        }
    }

    fn configure_window(
        &mut self,
        id: Xid,
        geometry: Geometry,
        border_width: u32,
        above_sibling: Option<Xid>,
    ) {
        let Some(handle) = self.stack.find(id) else {
            return;
        };
        if self.stack.restack_above(handle, above_sibling) {
            self.invalidate_ignore_all();
            self.damage_extents(handle);
        }

        let Some(w) = self.stack.get_mut(handle) else {
            return;
        };
        if w.state() == WinState::Unmapped {
            // Applied atomically at the next map.
            w.pending_geometry = geometry;
            w.pending_border_width = border_width;
            return;
        }

        let old = w.geometry;
        let old_border = w.border_width;
        let position_changed = old.x != geometry.x || old.y != geometry.y;
        let size_changed = old.width != geometry.width
            || old.height != geometry.height
            || old_border != border_width;
        if !position_changed && !size_changed {
            return;
        }

        let old_extents = w.extents();
        w.geometry = geometry;
        w.pending_geometry = geometry;
        w.border_width = border_width;
        w.pending_border_width = border_width;

        if size_changed {
            // The image must be captured again at the new size; this also
            // retries a previously failed bind.
            w.flags
                .insert(WinFlags::SIZE_STALE | WinFlags::PIXMAP_STALE | WinFlags::EXTENTS_STALE);
            w.flags.remove(WinFlags::IMAGE_ERROR);
            w.start_move(geometry.x, geometry.y, 0, self.config.animation.curve);
        } else {
            w.flags.insert(WinFlags::EXTENTS_STALE);
            let animate =
                self.config.animation.enabled && w.to_paint && w.state() != WinState::Destroying;
            let ticks = if animate {
                self.config.animation.duration_ticks
            } else {
                0
            };
            w.start_move(geometry.x, geometry.y, ticks, self.config.animation.curve);
        }
        w.refresh_extents(&self.config.shadow);
        let new_extents = w.extents();

        self.damage.add_rect(old_extents);
        self.damage.add_rect(new_extents);
        self.invalidate_ignore_from(handle);
    }

    fn client_changed(&mut self, id: Xid, client: Option<Xid>, leader: Option<Xid>) {
        let Some(handle) = self.stack.find(id) else {
            return;
        };
        let Some(w) = self.stack.get_mut(handle) else {
            return;
        };
        let old_leader = w.leader;
        w.client = client;
        w.leader = leader;
        trace!(
            window = format_args!("{id:#x}"),
            ?client,
            ?leader,
            "client changed"
        );
        if old_leader == leader || !self.config.opacity.detect_client_leader {
            self.refresh_opacity_target(handle);
            return;
        }
        // Group membership changed; both the old and the new group see a
        // different focus picture now.
        for h in self.stack.handles() {
            let in_group = self.stack.get(h).is_some_and(|w| {
                h == handle
                    || (w.leader.is_some() && (w.leader == old_leader || w.leader == leader))
            });
            if in_group {
                self.refresh_opacity_target(h);
            }
        }
    }

    fn circulate_window(&mut self, id: Xid, to_top: bool) {
        let Some(handle) = self.stack.find(id) else {
            return;
        };
        let moved = if to_top {
            self.stack.restack_top(handle)
        } else {
            self.stack.restack_bottom(handle)
        };
        if moved {
            self.invalidate_ignore_all();
            self.damage_extents(handle);
        }
    }

    fn property_changed(&mut self, id: Xid, kind: PropertyKind) {
        let Some(handle) = self.stack.find(id) else {
            return;
        };
        match kind {
            PropertyKind::Opacity(value) => {
                if let Some(w) = self.stack.get_mut(handle) {
                    w.opacity_prop = value;
                }
                self.refresh_opacity_target(handle);
            }
            PropertyKind::BypassCompositor(hint) => {
                if let Some(w) = self.stack.get_mut(handle) {
                    trace!(window = format_args!("{id:#x}"), ?hint, "bypass hint");
                    w.bypass = hint;
                }
            }
            PropertyKind::WindowType(wintype) => {
                if let Some(w) = self.stack.get_mut(handle) {
                    w.window_type = wintype;
                    w.apply_config(&self.config);
                }
                self.refresh_opacity_target(handle);
                self.damage_extents(handle);
                self.invalidate_ignore_from(handle);
            }
            PropertyKind::FrameExtents(left, right, top, bottom) => {
                if let Some(w) = self.stack.get_mut(handle) {
                    w.frame_extents = (left, right, top, bottom);
                }
                self.invalidate_ignore_from(handle);
            }
        }
    }

    fn damage_window(&mut self, id: Xid, area: Rect) {
        let Some(handle) = self.stack.find(id) else {
            return;
        };
        let Some(w) = self.stack.get_mut(handle) else {
            return;
        };
        if w.state() == WinState::Unmapped {
            return;
        }
        if !w.ever_damaged {
            // First damage after a map repaints the whole window; the
            // reported area is meaningless before that.
            w.ever_damaged = true;
            let extents = w.extents();
            self.damage.add_rect(extents);
            return;
        }
        let (x, y) = w.paint_pos();
        let b = w.border_width as i32;
        self.damage.add_rect(area.translate(x + b, y + b));
    }

    fn shape_changed(&mut self, id: Xid, bounding: Option<crate::geometry::Region>) {
        let Some(handle) = self.stack.find(id) else {
            return;
        };
        let Some(w) = self.stack.get_mut(handle) else {
            return;
        };
        let old_extents = w.extents();
        w.shaped = bounding;
        w.refresh_extents(&self.config.shadow);
        let new_extents = w.extents();
        self.damage.add_rect(old_extents);
        self.damage.add_rect(new_extents);
        self.invalidate_ignore_from(handle);
    }

    fn focus_changed(&mut self, id: Xid, focused: bool) {
        let Some(handle) = self.stack.find(id) else {
            return;
        };
        let mut leader = None;
        if let Some(w) = self.stack.get_mut(handle) {
            w.focused = focused;
            leader = w.leader;
        }
        if focused {
            self.focused = Some(handle);
        } else if self.focused == Some(handle) {
            self.focused = None;
        }
        self.refresh_opacity_target(handle);
        // The rest of the group follows this window's focus.
        if self.config.opacity.detect_client_leader {
            if let Some(leader) = leader {
                for h in self.stack.handles() {
                    if h != handle
                        && self
                            .stack
                            .get(h)
                            .is_some_and(|w| w.leader == Some(leader))
                    {
                        self.refresh_opacity_target(h);
                    }
                }
            }
        }
        if let Some(listener) = self.listener.as_deref_mut() {
            if focused {
                listener.focus_in(id);
            } else {
                listener.focus_out(id);
            }
        }
    }

    fn root_resized(&mut self, width: u32, height: u32) {
        info!(width, height, "root resized");
        self.screen_width = width;
        self.screen_height = height;
        self.damage.force_full(width, height);
        self.invalidate_ignore_all();
    }

    /// Effective opacity target under the current properties, focus and
    /// per-type configuration. An explicit opacity property always wins.
    fn target_opacity(&self, w: &CompWindow) -> f64 {
        if let Some(value) = w.opacity_prop {
            return value.clamp(0.0, 1.0);
        }
        if !self.counts_as_focused(w) {
            if let Some(inactive) = self.config.opacity.inactive_opacity {
                return inactive.clamp(0.0, 1.0);
            }
        }
        self.config
            .type_opacity(w.window_type)
            .unwrap_or(1.0)
            .clamp(0.0, 1.0)
    }

    /// Focused for dimming purposes. With leader detection on, focus
    /// anywhere in the window's group counts, so a focused dialog does
    /// not dim its main window.
    fn counts_as_focused(&self, w: &CompWindow) -> bool {
        if w.focused {
            return true;
        }
        if !self.config.opacity.detect_client_leader {
            return false;
        }
        let Some(leader) = w.leader else {
            return false;
        };
        self.stack
            .iter()
            .any(|(_, other)| other.focused && other.leader == Some(leader))
    }

    fn refresh_opacity_target(&mut self, handle: WinHandle) {
        let Some((target, ticks)) = self.stack.get(handle).map(|w| {
            let target = self.target_opacity(w);
            (target, self.config.fade_ticks(w.opacity.get(), target))
        }) else {
            return;
        };
        let begun = match self.stack.get_mut(handle) {
            Some(w) => w.retarget_opacity(target, ticks),
            None => return,
        };
        self.apply_finished(handle, begun.canceled);
        self.apply_finished(handle, begun.completed);
        if let Some(w) = self.stack.get_mut(handle) {
            w.settle_fading();
        }
    }

    /// Resolves a finished opacity transition: completions run their
    /// pending action, cancellations drop it.
    pub(crate) fn apply_finished(
        &mut self,
        handle: WinHandle,
        fin: Option<Finished<FinishAction>>,
    ) {
        let Some(fin) = fin else {
            return;
        };
        match fin.event {
            TransitionEvent::Canceled => {
                trace!(action = ?fin.action, "transition canceled");
            }
            TransitionEvent::Completed | TransitionEvent::StoppedEarly => {
                let Some(w) = self.stack.get_mut(handle) else {
                    return;
                };
                let remove = w.finish_transition(fin.action);
                debug!(window = format_args!("{:#x}", w.id), action = ?fin.action, "transition finished");
                match fin.action {
                    FinishAction::FinishMap => {}
                    FinishAction::FinishUnmap => {
                        self.damage_extents(handle);
                        self.release_window_images(handle);
                        self.invalidate_ignore_from(handle);
                    }
                    FinishAction::FinishDestroy => {}
                }
                if remove {
                    self.remove_window(handle);
                }
            }
        }
    }

    /// Per-tick transition resolution: applies a completed fade and lets
    /// FADING settle back to MAPPED.
    pub(crate) fn check_fade_finished(
        &mut self,
        handle: WinHandle,
        fin: Option<Finished<FinishAction>>,
    ) {
        self.apply_finished(handle, fin);
        if let Some(w) = self.stack.get_mut(handle) {
            w.settle_fading();
        }
    }

    fn remove_window(&mut self, handle: WinHandle) {
        self.damage_extents(handle);
        self.release_window_images(handle);
        if self.focused == Some(handle) {
            self.focused = None;
        }
        if let Some(w) = self.stack.remove(handle) {
            debug!(window = format_args!("{:#x}", w.id), "window removed");
        }
        self.invalidate_ignore_all();
    }

    fn release_window_images(&mut self, handle: WinHandle) {
        let Some(w) = self.stack.get_mut(handle) else {
            return;
        };
        if let Some(image) = w.image.take() {
            self.backend.release_image(image);
        }
        if let Some(shadow) = w.shadow_image.take() {
            self.backend.release_image(shadow);
        }
    }

    fn damage_extents(&mut self, handle: WinHandle) {
        if let Some(w) = self.stack.get(handle) {
            let extents = w.extents();
            self.damage.add_rect(extents);
        }
    }

    /// Occlusion caches go stale from this window to the bottom of the
    /// stack; anything above is unaffected by a change here.
    fn invalidate_ignore_from(&mut self, handle: WinHandle) {
        let Some(pos) = self.stack.position(handle) else {
            return;
        };
        let below: Vec<WinHandle> = self.stack.order()[pos..].to_vec();
        for h in below {
            if let Some(w) = self.stack.get_mut(h) {
                w.ignore_valid = false;
            }
        }
    }

    fn invalidate_ignore_all(&mut self) {
        for handle in self.stack.handles() {
            if let Some(w) = self.stack.get_mut(handle) {
                w.ignore_valid = false;
            }
        }
    }
}
