//! Frame preparation
//!
//! Once per wakeup the compositor advances fades by whole ticks, settles
//! finished transitions, decides which windows paint, binds their images,
//! walks the stack top-down for occlusion and emits a bottom-up paint
//! plan clipped to the accumulated damage. The redirect policy runs on
//! the same pass, so a frame never paints through a stale decision.

use std::time::{Duration, Instant};

use tracing::{debug, error, info, trace, warn};

use crate::comp::stack::WinHandle;
use crate::comp::window::{PaintMode, WinFlags, WinState};
use crate::comp::Compositor;
use crate::events::BypassHint;
use crate::geometry::{Rect, Region};

/// Windows below this opacity are treated as invisible.
const OPACITY_EPSILON: f64 = 1.0 / 255.0;

/// Elapsed time past this is a clock anomaly, not animation progress.
const MAX_CLOCK_JUMP: Duration = Duration::from_secs(5);

/// Converts wall-clock time into whole animation ticks. Fractional
/// remainders carry over, so long fades do not drift.
#[derive(Debug)]
pub struct FadeClock {
    delta: Duration,
    reference: Option<Instant>,
}

impl FadeClock {
    pub fn new(delta: Duration) -> Self {
        Self {
            delta: delta.max(Duration::from_millis(1)),
            reference: None,
        }
    }

    /// Whole ticks elapsed since the last call. A clock that runs
    /// backwards or jumps absurdly far resynchronizes and yields zero
    /// ticks instead of fast-forwarding every animation.
    pub fn advance(&mut self, now: Instant) -> u32 {
        let Some(reference) = self.reference else {
            self.reference = Some(now);
            return 0;
        };
        let Some(elapsed) = now.checked_duration_since(reference) else {
            warn!("clock went backwards, resynchronizing");
            self.reference = Some(now);
            return 0;
        };
        if elapsed > MAX_CLOCK_JUMP {
            warn!(?elapsed, "clock jumped, resynchronizing");
            self.reference = Some(now);
            return 0;
        }
        let ticks = (elapsed.as_nanos() / self.delta.as_nanos()) as u32;
        if ticks > 0 {
            self.reference = Some(reference + self.delta * ticks);
        }
        ticks
    }

    /// Time until the next tick boundary.
    pub fn until_next_tick(&self, now: Instant) -> Duration {
        match self.reference {
            None => self.delta,
            Some(reference) => (reference + self.delta).saturating_duration_since(now),
        }
    }
}

/// One window selected for painting this frame.
#[derive(Debug)]
pub struct PaintEntry {
    pub handle: WinHandle,
    /// Window extents minus the opaque area stacked above it, clipped to
    /// the screen. Never empty.
    pub region: Region,
}

/// Everything the renderer needs for one frame. Entries are in paint
/// order, bottom of the stack first.
#[derive(Debug)]
pub struct PaintPlan {
    pub entries: Vec<PaintEntry>,
    /// Screen area that must be repainted.
    pub damage: Region,
}

/// Outcome of one frame preparation pass.
#[derive(Debug)]
pub struct FrameResult {
    /// Present when there is something to draw. `None` while unredirected
    /// or when no damage accumulated.
    pub plan: Option<PaintPlan>,
    /// When the loop must wake again even without server events.
    pub timeout: Option<Duration>,
}

struct PassOutput {
    entries: Vec<PaintEntry>,
    /// A window qualified the screen for compositing bypass.
    unredir_candidate: bool,
}

impl Compositor {
    /// Advances animations and builds the paint plan for this moment.
    /// Call on every wakeup; cheap when nothing changed.
    pub fn prepare_frame(&mut self, now: Instant) -> FrameResult {
        let ticks = self.clock.advance(now);
        if ticks > 0 {
            self.run_fades(ticks);
        }

        let was_redirected = self.redirected;
        let pass = self.paint_pass();
        self.evaluate_redirect(now, pass.unredir_candidate);

        let mut timeout = self.next_timeout(now);
        let plan = if self.redirected && was_redirected && !self.damage.is_empty() {
            let mut damage = self.damage.take();
            damage.intersect_rect(&self.screen_rect());
            if damage.is_empty() {
                None
            } else {
                Some(PaintPlan {
                    entries: pass.entries,
                    damage,
                })
            }
        } else {
            if self.redirected && !was_redirected {
                // Images were not bound on this pass; paint immediately on
                // the next one.
                timeout = Some(Duration::ZERO);
            }
            None
        };
        FrameResult { plan, timeout }
    }

    fn screen_rect(&self) -> Rect {
        Rect::new(0, 0, self.screen_width as i32, self.screen_height as i32)
    }

    /// Steps every animation by `ticks` and resolves the transitions that
    /// finished. Windows mid-fade or mid-move damage their old extents so
    /// the previous frame's pixels get repainted.
    fn run_fades(&mut self, ticks: u32) {
        for handle in self.stack.handles() {
            let fin = {
                let Some(w) = self.stack.get_mut(handle) else {
                    continue;
                };
                let was_visible = w.to_paint;
                let was_fading = w.opacity.animating();
                let was_moving = w.anim_x.animating() || w.anim_y.animating();
                let fin = w.opacity.step(ticks);
                let _ = w.anim_x.step(ticks);
                let _ = w.anim_y.step(ticks);
                if was_moving {
                    w.flags
                        .insert(WinFlags::POSITION_STALE | WinFlags::EXTENTS_STALE);
                }
                if (was_fading || was_moving) && was_visible {
                    let old_extents = w.extents();
                    self.damage.add_rect(old_extents);
                }
                fin
            };
            self.check_fade_finished(handle, fin);
        }
    }

    /// Walks the stack once, topmost first: refreshes per-window paint
    /// state, binds images, accumulates occlusion and collects the
    /// windows that actually paint.
    fn paint_pass(&mut self) -> PassOutput {
        let screen = self.screen_rect();
        let (sw, sh) = (self.screen_width, self.screen_height);
        let mut entries: Vec<PaintEntry> = Vec::new();
        let mut above_opaque = Region::new();
        let mut rebuild_below = false;
        let mut first_painted = true;
        let mut unredir_candidate = false;

        for handle in self.stack.handles() {
            let Some(w) = self.stack.get_mut(handle) else {
                continue;
            };

            if w.flags.contains(WinFlags::EXTENTS_STALE) {
                w.refresh_extents(&self.config.shadow);
            }

            let mut to_paint = true;
            let reason;
            if w.state() == WinState::Unmapped {
                to_paint = false;
                reason = "unmapped";
            } else if w.geometry.is_degenerate() {
                to_paint = false;
                reason = "degenerate geometry";
            } else if w.is_offscreen(sw, sh) {
                to_paint = false;
                reason = "entirely offscreen";
            } else if !w.ever_damaged {
                to_paint = false;
                reason = "no content yet";
            } else if w.paint_excluded {
                to_paint = false;
                reason = "excluded by configuration";
            } else if w.opacity.get() < OPACITY_EPSILON {
                to_paint = false;
                reason = "invisible";
            } else if w.flags.contains(WinFlags::IMAGE_ERROR) {
                to_paint = false;
                reason = "image error";
            } else {
                reason = "";
            }

            if to_paint {
                let mode = w.determine_mode();
                if mode != w.mode {
                    trace!(window = format_args!("{:#x}", w.id), ?mode, "paint mode changed");
                    w.mode = mode;
                    rebuild_below = true;
                }
                w.shadow_opacity = self.config.shadow.opacity * w.opacity.get();

                if self.redirected {
                    if w.flags.contains(WinFlags::PIXMAP_STALE) || w.image.is_none() {
                        if let Some(old) = w.image.take() {
                            self.backend.release_image(old);
                        }
                        if w.flags.contains(WinFlags::SIZE_STALE) {
                            if let Some(old) = w.shadow_image.take() {
                                self.backend.release_image(old);
                            }
                            w.flags.remove(WinFlags::SIZE_STALE);
                        }
                        match self.backend.bind_image(w) {
                            Ok(image) => {
                                w.image = Some(image);
                                w.flags.remove(WinFlags::PIXMAP_STALE);
                            }
                            Err(e) => {
                                // The window drops out of this frame but the
                                // pass goes on; a resize or remap retries.
                                warn!(
                                    window = format_args!("{:#x}", w.id),
                                    "image bind failed: {e}"
                                );
                                w.flags.insert(WinFlags::IMAGE_ERROR);
                                to_paint = false;
                            }
                        }
                    }
                    if to_paint && w.shadow && w.shadow_image.is_none() {
                        match self.backend.bind_shadow(w, &self.config.shadow) {
                            Ok(image) => w.shadow_image = Some(image),
                            Err(e) => {
                                warn!(
                                    window = format_args!("{:#x}", w.id),
                                    "shadow bind failed: {e}"
                                );
                            }
                        }
                    }
                }
            }

            if to_paint != w.to_paint {
                if !to_paint && !reason.is_empty() {
                    trace!(window = format_args!("{:#x}", w.id), reason, "stops painting");
                }
                w.to_paint = to_paint;
                let extents = w.extents();
                self.damage.add_rect(extents);
                rebuild_below = true;
            }

            if !to_paint {
                continue;
            }

            if w.flags.contains(WinFlags::POSITION_STALE) {
                // The window moved this frame: repaint it where it landed
                // and rebuild occlusion beneath it.
                w.flags.remove(WinFlags::POSITION_STALE);
                let extents = w.extents();
                self.damage.add_rect(extents);
                rebuild_below = true;
            }

            if rebuild_below || !w.ignore_valid {
                w.ignore_region = Some(above_opaque.clone());
                w.ignore_valid = true;
                rebuild_below = true;
            }

            let mut visible = Region::from_rect(w.extents());
            visible.intersect_rect(&screen);
            if let Some(ignore) = &w.ignore_region {
                visible.subtract(ignore);
            }
            if visible.is_empty() {
                trace!(window = format_args!("{:#x}", w.id), "fully occluded");
            } else {
                entries.push(PaintEntry {
                    handle,
                    region: visible,
                });
            }

            if !w.unredir_ignored {
                if first_painted && w.mode == PaintMode::Solid && w.is_fullscreen(sw, sh) {
                    unredir_candidate = true;
                }
                if w.bypass == BypassHint::Bypass {
                    unredir_candidate = true;
                }
                first_painted = false;
            }

            let mut opaque = w.opaque_region();
            if !opaque.is_empty() {
                opaque.intersect_rect(&screen);
                above_opaque.union_with(&opaque);
            }
        }

        entries.reverse();
        PassOutput {
            entries,
            unredir_candidate,
        }
    }

    /// Applies the redirect policy: a forced override always wins, the
    /// heuristic goes through the debounce delay, and damage received
    /// while bypassed brings compositing back before anything is lost on
    /// screen for long.
    fn evaluate_redirect(&mut self, now: Instant, candidate: bool) {
        let desired_unredirect = match self.config.unredirect.force_redirect {
            Some(force) => !force,
            None => {
                self.config.unredirect.enabled
                    && candidate
                    && !self.damage.damaged_while_unredirected()
            }
        };

        if self.redirected {
            if desired_unredirect {
                let deadline = match self.unredir_deadline {
                    Some(deadline) => deadline,
                    None => {
                        let deadline =
                            now + Duration::from_millis(self.config.unredirect.delay_ms);
                        self.unredir_deadline = Some(deadline);
                        debug!("unredirect armed");
                        deadline
                    }
                };
                if now >= deadline {
                    self.apply_unredirect();
                }
            } else if self.unredir_deadline.take().is_some() {
                debug!("pending unredirect canceled");
            }
        } else if !desired_unredirect {
            self.apply_redirect();
        }
    }

    fn apply_unredirect(&mut self) {
        info!("display unredirected, compositing bypassed");
        self.redirected = false;
        self.unredir_deadline = None;
        self.backend.unredirect();
        self.damage.unredirect();
        // The pixmaps die with the redirection.
        for handle in self.stack.handles() {
            if let Some(w) = self.stack.get_mut(handle) {
                if let Some(image) = w.image.take() {
                    self.backend.release_image(image);
                }
                if let Some(shadow) = w.shadow_image.take() {
                    self.backend.release_image(shadow);
                }
                w.flags.insert(WinFlags::PIXMAP_STALE);
            }
        }
    }

    fn apply_redirect(&mut self) {
        match self.backend.redirect() {
            Ok(()) => {
                info!("display redirected, compositing resumed");
                self.redirected = true;
                self.damage.redirect(self.screen_width, self.screen_height);
                for handle in self.stack.handles() {
                    if let Some(w) = self.stack.get_mut(handle) {
                        w.flags.insert(WinFlags::PIXMAP_STALE);
                        w.ignore_valid = false;
                    }
                }
            }
            // Stay unredirected; the next pass retries.
            Err(e) => error!("redirect failed: {e}"),
        }
    }

    /// Next wakeup the loop must honor: the following animation tick
    /// and/or an armed unredirect deadline.
    fn next_timeout(&self, now: Instant) -> Option<Duration> {
        let mut timeout = None;
        let animating = self.stack.iter().any(|(_, w)| {
            w.opacity.animating() || w.anim_x.animating() || w.anim_y.animating()
        });
        if animating {
            timeout = Some(self.clock.until_next_tick(now));
        }
        if let Some(deadline) = self.unredir_deadline {
            let until = deadline.saturating_duration_since(now);
            timeout = Some(timeout.map_or(until, |t: Duration| t.min(until)));
        }
        timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Backend, DummyBackend, ImageHandle};
    use crate::comp::window::CompWindow;
    use crate::config::{Config, ShadowConfig};
    use crate::events::{Notification, PropertyKind};
    use crate::geometry::Geometry;
    use crate::{Error, Xid};
    use std::cell::RefCell;
    use std::rc::Rc;

    /// Backend handle the tests keep inspecting after the compositor
    /// takes ownership of its clone.
    #[derive(Clone)]
    struct SharedBackend(Rc<RefCell<DummyBackend>>);

    impl SharedBackend {
        fn new() -> Self {
            Self(Rc::new(RefCell::new(DummyBackend::new())))
        }

        fn live_images(&self) -> usize {
            self.0.borrow().live_images()
        }

        fn binds(&self) -> u64 {
            self.0.borrow().binds()
        }

        fn releases(&self) -> u64 {
            self.0.borrow().releases()
        }

        fn redirected(&self) -> bool {
            self.0.borrow().redirected()
        }

        fn set_fail_binds(&self, fail: bool) {
            self.0.borrow_mut().fail_binds = fail;
        }
    }

    impl Backend for SharedBackend {
        fn redirect(&mut self) -> Result<(), Error> {
            self.0.borrow_mut().redirect()
        }

        fn unredirect(&mut self) {
            self.0.borrow_mut().unredirect()
        }

        fn bind_image(&mut self, window: &CompWindow) -> Result<ImageHandle, Error> {
            self.0.borrow_mut().bind_image(window)
        }

        fn release_image(&mut self, image: ImageHandle) {
            self.0.borrow_mut().release_image(image)
        }

        fn bind_shadow(
            &mut self,
            window: &CompWindow,
            shadow: &ShadowConfig,
        ) -> Result<ImageHandle, Error> {
            self.0.borrow_mut().bind_shadow(window, shadow)
        }
    }

    /// Ten ticks for a full fade, no shadows, no move animation.
    fn fade_config() -> Config {
        let mut config = Config::default();
        config.fading.enabled = true;
        config.fading.delta_ms = 10;
        config.fading.fade_in_step = 0.1;
        config.fading.fade_out_step = 0.1;
        config.shadow.enabled = false;
        config.animation.enabled = false;
        config.unredirect.enabled = false;
        config
    }

    /// Maps and unmaps complete synchronously.
    fn instant_config() -> Config {
        let mut config = fade_config();
        config.fading.no_fading_openclose = true;
        config
    }

    fn setup(config: Config) -> (Compositor, SharedBackend) {
        let backend = SharedBackend::new();
        let comp = Compositor::new(config, Box::new(backend.clone()), 1, 800, 600);
        (comp, backend)
    }

    fn open_window(comp: &mut Compositor, id: Xid, geometry: Geometry) {
        comp.handle_notification(Notification::Created {
            window: id,
            geometry,
            border_width: 0,
            override_redirect: false,
            argb: false,
        });
        comp.handle_notification(Notification::Mapped { window: id });
        comp.handle_notification(Notification::Damaged {
            window: id,
            area: Rect::from_xywh(0, 0, 1, 1),
        });
    }

    fn tick(comp: &mut Compositor, t0: Instant, n: u64) -> FrameResult {
        comp.prepare_frame(t0 + Duration::from_millis(10 * n))
    }

    #[test]
    fn test_clock_accumulates_whole_ticks() {
        let mut clock = FadeClock::new(Duration::from_millis(10));
        let t0 = Instant::now();
        assert_eq!(clock.advance(t0), 0);
        assert_eq!(clock.advance(t0 + Duration::from_millis(35)), 3);
        // The 5ms remainder carried over.
        assert_eq!(clock.advance(t0 + Duration::from_millis(40)), 1);
        assert_eq!(clock.advance(t0 + Duration::from_millis(44)), 0);
    }

    #[test]
    fn test_clock_backwards_resyncs() {
        let mut clock = FadeClock::new(Duration::from_millis(10));
        let now = Instant::now();
        assert_eq!(clock.advance(now), 0);
        let earlier = now - Duration::from_secs(1);
        assert_eq!(clock.advance(earlier), 0);
        assert_eq!(clock.advance(earlier + Duration::from_millis(10)), 1);
    }

    #[test]
    fn test_clock_jump_resyncs() {
        let mut clock = FadeClock::new(Duration::from_millis(10));
        let t0 = Instant::now();
        assert_eq!(clock.advance(t0), 0);
        let jumped = t0 + Duration::from_secs(6);
        assert_eq!(clock.advance(jumped), 0);
        assert_eq!(clock.advance(jumped + Duration::from_millis(20)), 2);
    }

    #[test]
    fn test_map_fade_reaches_mapped() {
        let (mut comp, _backend) = setup(fade_config());
        open_window(&mut comp, 0x10, Geometry::new(0, 0, 100, 100));
        let h = comp.find_window(0x10).unwrap();
        assert_eq!(comp.window(h).unwrap().state(), WinState::Mapping);

        let t0 = Instant::now();
        let _ = comp.prepare_frame(t0);
        for n in 1..=5 {
            let _ = tick(&mut comp, t0, n);
        }
        let w = comp.window(h).unwrap();
        assert_eq!(w.state(), WinState::Mapping);
        assert!((w.opacity.get_progress() - 0.5).abs() < 1e-9);
        assert!((w.opacity.get() - 0.5).abs() < 1e-9);

        for n in 6..=10 {
            let _ = tick(&mut comp, t0, n);
        }
        let w = comp.window(h).unwrap();
        assert_eq!(w.state(), WinState::Mapped);
        assert!((w.opacity.get() - 1.0).abs() < 1e-9);
        assert!(!w.opacity.animating());
    }

    #[test]
    fn test_animation_sets_tick_timeout() {
        let (mut comp, _backend) = setup(fade_config());
        open_window(&mut comp, 0x10, Geometry::new(0, 0, 100, 100));
        let t0 = Instant::now();
        let result = comp.prepare_frame(t0);
        let timeout = result.timeout.unwrap();
        assert!(timeout <= Duration::from_millis(10));

        for n in 1..=10 {
            let _ = tick(&mut comp, t0, n);
        }
        let result = tick(&mut comp, t0, 11);
        assert!(result.timeout.is_none());
    }

    #[test]
    fn test_unmap_releases_images_after_fade() {
        let (mut comp, backend) = setup(fade_config());
        open_window(&mut comp, 0x10, Geometry::new(0, 0, 100, 100));
        let t0 = Instant::now();
        let _ = comp.prepare_frame(t0);
        for n in 1..=10 {
            let _ = tick(&mut comp, t0, n);
        }
        assert_eq!(backend.live_images(), 1);

        comp.handle_notification(Notification::Unmapped { window: 0x10 });
        let h = comp.find_window(0x10).unwrap();
        assert_eq!(comp.window(h).unwrap().state(), WinState::Unmapping);
        // Still painted while the fade-out runs.
        let _ = tick(&mut comp, t0, 11);
        assert_eq!(backend.live_images(), 1);

        for n in 12..=21 {
            let _ = tick(&mut comp, t0, n);
        }
        let w = comp.window(h).unwrap();
        assert_eq!(w.state(), WinState::Unmapped);
        assert_eq!(backend.live_images(), 0);
        assert_eq!(backend.binds(), backend.releases());
    }

    #[test]
    fn test_destroy_supersedes_unmap_and_removes_record() {
        let (mut comp, backend) = setup(fade_config());
        open_window(&mut comp, 0x10, Geometry::new(0, 0, 100, 100));
        let t0 = Instant::now();
        let _ = comp.prepare_frame(t0);
        for n in 1..=10 {
            let _ = tick(&mut comp, t0, n);
        }

        comp.handle_notification(Notification::Unmapped { window: 0x10 });
        let _ = tick(&mut comp, t0, 11);
        comp.handle_notification(Notification::Destroyed { window: 0x10 });
        let h = comp.find_window(0x10).unwrap();
        assert_eq!(comp.window(h).unwrap().state(), WinState::Destroying);

        for n in 12..=22 {
            let _ = tick(&mut comp, t0, n);
        }
        assert!(comp.find_window(0x10).is_none());
        assert_eq!(comp.window_count(), 0);
        assert_eq!(backend.live_images(), 0);
    }

    #[test]
    fn test_occluded_window_dropped_from_plan() {
        let (mut comp, _backend) = setup(instant_config());
        // Bottom window fully covered by the solid one stacked above it.
        open_window(&mut comp, 0xB, Geometry::new(50, 50, 100, 100));
        open_window(&mut comp, 0xA, Geometry::new(0, 0, 300, 300));
        let plan = comp.prepare_frame(Instant::now()).plan.unwrap();

        let ha = comp.find_window(0xA).unwrap();
        let hb = comp.find_window(0xB).unwrap();
        assert!(plan.entries.iter().any(|e| e.handle == ha));
        assert!(!plan.entries.iter().any(|e| e.handle == hb));
        // The survivor keeps its full area.
        let entry = plan.entries.iter().find(|e| e.handle == ha).unwrap();
        assert!(entry.region.covers(&Rect::from_xywh(0, 0, 300, 300)));
    }

    #[test]
    fn test_partial_overlap_paints_bottom_up() {
        let (mut comp, _backend) = setup(instant_config());
        open_window(&mut comp, 0x1, Geometry::new(0, 0, 200, 200));
        open_window(&mut comp, 0x2, Geometry::new(100, 100, 200, 200));
        open_window(&mut comp, 0x3, Geometry::new(200, 200, 200, 200));
        let plan = comp.prepare_frame(Instant::now()).plan.unwrap();

        let order: Vec<WinHandle> = plan.entries.iter().map(|e| e.handle).collect();
        let expected: Vec<WinHandle> = [0x1, 0x2, 0x3]
            .iter()
            .map(|id| comp.find_window(*id).unwrap())
            .collect();
        assert_eq!(order, expected);
        // The bottom window's visible region excludes the area the middle
        // one covers.
        let bottom = &plan.entries[0];
        assert!(!bottom.region.covers(&Rect::from_xywh(150, 150, 10, 10)));
        assert!(bottom.region.covers(&Rect::from_xywh(0, 0, 100, 100)));
    }

    #[test]
    fn test_translucent_window_does_not_occlude() {
        let (mut comp, _backend) = setup(instant_config());
        open_window(&mut comp, 0xB, Geometry::new(50, 50, 100, 100));
        open_window(&mut comp, 0xA, Geometry::new(0, 0, 300, 300));
        comp.handle_notification(Notification::Property {
            window: 0xA,
            kind: PropertyKind::Opacity(Some(0.8)),
        });
        let t0 = Instant::now();
        let _ = comp.prepare_frame(t0);
        // Let the opacity fade settle so the mode stays Translucent.
        for n in 1..=3 {
            let _ = tick(&mut comp, t0, n);
        }
        comp.handle_notification(Notification::Damaged {
            window: 0xB,
            area: Rect::from_xywh(0, 0, 1, 1),
        });
        let plan = comp.prepare_frame(t0 + Duration::from_millis(40)).plan.unwrap();
        let hb = comp.find_window(0xB).unwrap();
        assert!(plan.entries.iter().any(|e| e.handle == hb));
    }

    #[test]
    fn test_unredirect_debounce_and_damage_redirects() {
        let mut config = instant_config();
        config.unredirect.enabled = true;
        config.unredirect.delay_ms = 50;
        let (mut comp, backend) = setup(config);
        open_window(&mut comp, 0x10, Geometry::new(0, 0, 800, 600));

        let t0 = Instant::now();
        let result = comp.prepare_frame(t0);
        assert!(comp.redirected());
        assert!(result.plan.is_some());
        // The debounce deadline shows up as a wakeup.
        assert!(result.timeout.unwrap() <= Duration::from_millis(50));

        let result = comp.prepare_frame(t0 + Duration::from_millis(60));
        assert!(!comp.redirected());
        assert!(!backend.redirected());
        assert!(result.plan.is_none());
        assert_eq!(backend.live_images(), 0);

        // Damage while bypassed forces compositing back on.
        comp.handle_notification(Notification::Damaged {
            window: 0x10,
            area: Rect::from_xywh(0, 0, 10, 10),
        });
        let result = comp.prepare_frame(t0 + Duration::from_millis(70));
        assert!(comp.redirected());
        assert!(backend.redirected());
        // Freshly redirected: images bind on the next pass, immediately.
        assert!(result.plan.is_none());
        assert_eq!(result.timeout, Some(Duration::ZERO));

        let result = comp.prepare_frame(t0 + Duration::from_millis(70));
        let plan = result.plan.unwrap();
        assert!(plan.damage.covers(&Rect::from_xywh(0, 0, 800, 600)));
        assert_eq!(backend.live_images(), 1);
    }

    #[test]
    fn test_force_redirect_cancels_armed_debounce() {
        let mut config = instant_config();
        config.unredirect.enabled = true;
        config.unredirect.delay_ms = 50;
        let (mut comp, backend) = setup(config);
        open_window(&mut comp, 0x10, Geometry::new(0, 0, 800, 600));

        let t0 = Instant::now();
        let _ = comp.prepare_frame(t0);
        comp.set_force_redirect(Some(true));
        let result = comp.prepare_frame(t0 + Duration::from_millis(60));
        assert!(comp.redirected());
        assert!(backend.redirected());
        assert!(result.timeout.is_none());
    }

    #[test]
    fn test_bypass_hint_triggers_unredirect() {
        let mut config = instant_config();
        config.unredirect.enabled = true;
        config.unredirect.delay_ms = 0;
        let (mut comp, _backend) = setup(config);
        // Not fullscreen, but asks for bypass explicitly.
        open_window(&mut comp, 0x10, Geometry::new(100, 100, 200, 200));
        comp.handle_notification(Notification::Property {
            window: 0x10,
            kind: PropertyKind::BypassCompositor(BypassHint::Bypass),
        });
        let _ = comp.prepare_frame(Instant::now());
        assert!(!comp.redirected());
    }

    #[test]
    fn test_bind_failure_excludes_window_until_resize() {
        let (mut comp, backend) = setup(instant_config());
        backend.set_fail_binds(true);
        open_window(&mut comp, 0x10, Geometry::new(0, 0, 100, 100));
        let h = comp.find_window(0x10).unwrap();

        let t0 = Instant::now();
        let result = comp.prepare_frame(t0);
        let plan = result.plan.unwrap();
        assert!(plan.entries.is_empty());
        let w = comp.window(h).unwrap();
        assert!(w.flags.contains(WinFlags::IMAGE_ERROR));
        assert!(!w.to_paint);

        // No retry while the flag stands.
        backend.set_fail_binds(false);
        let binds_before = backend.binds();
        let _ = tick(&mut comp, t0, 1);
        assert_eq!(backend.binds(), binds_before);

        // A resize clears the flag and retries the bind.
        comp.handle_notification(Notification::Configured {
            window: 0x10,
            geometry: Geometry::new(0, 0, 120, 120),
            border_width: 0,
            above_sibling: None,
        });
        let result = tick(&mut comp, t0, 2);
        let plan = result.plan.unwrap();
        assert_eq!(plan.entries.len(), 1);
        assert_eq!(backend.live_images(), 1);
        assert!(!comp.window(h).unwrap().flags.contains(WinFlags::IMAGE_ERROR));
    }

    #[test]
    fn test_opacity_property_fades_and_settles() {
        let (mut comp, _backend) = setup(instant_config());
        open_window(&mut comp, 0x10, Geometry::new(0, 0, 100, 100));
        let h = comp.find_window(0x10).unwrap();
        assert_eq!(comp.window(h).unwrap().state(), WinState::Mapped);

        comp.handle_notification(Notification::Property {
            window: 0x10,
            kind: PropertyKind::Opacity(Some(0.5)),
        });
        assert_eq!(comp.window(h).unwrap().state(), WinState::Fading);

        let t0 = Instant::now();
        let _ = comp.prepare_frame(t0);
        for n in 1..=5 {
            let _ = tick(&mut comp, t0, n);
        }
        let w = comp.window(h).unwrap();
        assert_eq!(w.state(), WinState::Mapped);
        assert!((w.opacity.get() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_move_animation_glides_paint_position() {
        let mut config = instant_config();
        config.animation.enabled = true;
        config.animation.duration_ticks = 10;
        config.animation.curve = crate::animation::Curve::Linear;
        let (mut comp, _backend) = setup(config);
        open_window(&mut comp, 0x10, Geometry::new(0, 0, 100, 100));
        let h = comp.find_window(0x10).unwrap();
        let t0 = Instant::now();
        let _ = comp.prepare_frame(t0);

        comp.handle_notification(Notification::Configured {
            window: 0x10,
            geometry: Geometry::new(100, 0, 100, 100),
            border_width: 0,
            above_sibling: None,
        });
        // The real geometry updates at once; the painted position glides.
        assert_eq!(comp.window(h).unwrap().geometry.x, 100);

        for n in 1..=5 {
            let _ = tick(&mut comp, t0, n);
        }
        let (x, _) = comp.window(h).unwrap().paint_pos();
        assert_eq!(x, 50);

        for n in 6..=10 {
            let _ = tick(&mut comp, t0, n);
        }
        let w = comp.window(h).unwrap();
        assert_eq!(w.paint_pos(), (100, 0));
        assert!(!w.anim_x.animating());
    }

    #[test]
    fn test_restack_invalidates_occlusion() {
        let (mut comp, _backend) = setup(instant_config());
        open_window(&mut comp, 0xB, Geometry::new(0, 0, 300, 300));
        open_window(&mut comp, 0xA, Geometry::new(0, 0, 300, 300));
        let t0 = Instant::now();
        let _ = comp.prepare_frame(t0);

        // Raise the covered window above its sibling.
        comp.handle_notification(Notification::Configured {
            window: 0xB,
            geometry: Geometry::new(0, 0, 300, 300),
            border_width: 0,
            above_sibling: Some(0xA),
        });
        comp.handle_notification(Notification::Damaged {
            window: 0xB,
            area: Rect::from_xywh(0, 0, 1, 1),
        });
        let plan = tick(&mut comp, t0, 1).plan.unwrap();
        let ha = comp.find_window(0xA).unwrap();
        let hb = comp.find_window(0xB).unwrap();
        assert!(plan.entries.iter().any(|e| e.handle == hb));
        assert!(!plan.entries.iter().any(|e| e.handle == ha));
    }

    #[test]
    fn test_config_reload_skips_fades_and_repaints() {
        let (mut comp, _backend) = setup(fade_config());
        open_window(&mut comp, 0x10, Geometry::new(0, 0, 100, 100));
        let h = comp.find_window(0x10).unwrap();
        let t0 = Instant::now();
        let _ = comp.prepare_frame(t0);
        let _ = tick(&mut comp, t0, 1);
        assert_eq!(comp.window(h).unwrap().state(), WinState::Mapping);

        comp.update_config(instant_config());
        let w = comp.window(h).unwrap();
        assert_eq!(w.state(), WinState::Mapped);
        assert!((w.opacity.get() - 1.0).abs() < 1e-9);
        let plan = tick(&mut comp, t0, 2).plan.unwrap();
        assert!(plan.damage.covers(&Rect::from_xywh(0, 0, 800, 600)));
    }

    /// Inactive dimming with leader groups enabled.
    fn group_config() -> Config {
        let mut config = instant_config();
        config.opacity.inactive_opacity = Some(0.6);
        config.opacity.detect_client_leader = true;
        config
    }

    #[test]
    fn test_group_focus_covers_whole_group() {
        let (mut comp, _backend) = setup(group_config());
        open_window(&mut comp, 0x10, Geometry::new(0, 0, 100, 100));
        open_window(&mut comp, 0x20, Geometry::new(200, 0, 100, 100));
        open_window(&mut comp, 0x30, Geometry::new(400, 0, 100, 100));
        comp.handle_notification(Notification::ClientChanged {
            window: 0x10,
            client: Some(0x11),
            leader: Some(0x99),
        });
        comp.handle_notification(Notification::ClientChanged {
            window: 0x20,
            client: Some(0x21),
            leader: Some(0x99),
        });

        comp.handle_notification(Notification::FocusIn { window: 0x10 });
        let t0 = Instant::now();
        let _ = comp.prepare_frame(t0);
        for n in 1..=10 {
            let _ = tick(&mut comp, t0, n);
        }
        // Focus sits in the group, so its other member stays opaque; the
        // unrelated window dims.
        let h10 = comp.find_window(0x10).unwrap();
        let h20 = comp.find_window(0x20).unwrap();
        let h30 = comp.find_window(0x30).unwrap();
        assert!((comp.window(h10).unwrap().opacity.get() - 1.0).abs() < 1e-9);
        assert!((comp.window(h20).unwrap().opacity.get() - 1.0).abs() < 1e-9);
        assert!((comp.window(h30).unwrap().opacity.get() - 0.6).abs() < 1e-9);

        // Focus leaving the group dims both members.
        comp.handle_notification(Notification::FocusOut { window: 0x10 });
        comp.handle_notification(Notification::FocusIn { window: 0x30 });
        for n in 11..=20 {
            let _ = tick(&mut comp, t0, n);
        }
        assert!((comp.window(h10).unwrap().opacity.get() - 0.6).abs() < 1e-9);
        assert!((comp.window(h20).unwrap().opacity.get() - 0.6).abs() < 1e-9);
        assert!((comp.window(h30).unwrap().opacity.get() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_leader_change_refreshes_dimming() {
        let (mut comp, _backend) = setup(group_config());
        open_window(&mut comp, 0x10, Geometry::new(0, 0, 100, 100));
        open_window(&mut comp, 0x20, Geometry::new(200, 0, 100, 100));
        comp.handle_notification(Notification::FocusIn { window: 0x10 });
        comp.handle_notification(Notification::ClientChanged {
            window: 0x10,
            client: Some(0x11),
            leader: Some(0x99),
        });
        let t0 = Instant::now();
        let _ = comp.prepare_frame(t0);
        for n in 1..=10 {
            let _ = tick(&mut comp, t0, n);
        }
        let h20 = comp.find_window(0x20).unwrap();
        assert!((comp.window(h20).unwrap().opacity.get() - 0.6).abs() < 1e-9);

        // Joining the focused window's group lifts the dim.
        comp.handle_notification(Notification::ClientChanged {
            window: 0x20,
            client: Some(0x21),
            leader: Some(0x99),
        });
        for n in 11..=20 {
            let _ = tick(&mut comp, t0, n);
        }
        assert!((comp.window(h20).unwrap().opacity.get() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_leader_detection_off_dims_group_members() {
        let mut config = group_config();
        config.opacity.detect_client_leader = false;
        let (mut comp, _backend) = setup(config);
        open_window(&mut comp, 0x10, Geometry::new(0, 0, 100, 100));
        open_window(&mut comp, 0x20, Geometry::new(200, 0, 100, 100));
        comp.handle_notification(Notification::ClientChanged {
            window: 0x10,
            client: Some(0x11),
            leader: Some(0x99),
        });
        comp.handle_notification(Notification::ClientChanged {
            window: 0x20,
            client: Some(0x21),
            leader: Some(0x99),
        });
        comp.handle_notification(Notification::FocusIn { window: 0x10 });
        let t0 = Instant::now();
        let _ = comp.prepare_frame(t0);
        for n in 1..=10 {
            let _ = tick(&mut comp, t0, n);
        }
        // Sharing a leader means nothing while detection is off.
        let h20 = comp.find_window(0x20).unwrap();
        assert!((comp.window(h20).unwrap().opacity.get() - 0.6).abs() < 1e-9);
    }
}
