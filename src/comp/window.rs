//! Compositor window records
//!
//! One record per top-level window, carrying the lifecycle state machine
//! that keeps the model consistent while map, unmap and destroy requests
//! race the fades they trigger. All transitions go through the methods
//! here; a request with no edge from the current state is a protocol
//! desync and leaves the record untouched.

use bitflags::bitflags;
use tracing::trace;

use crate::animation::{Animatable, Curve, Finished, Retargeted};
use crate::backend::ImageHandle;
use crate::config::{Config, ShadowConfig};
use crate::events::{BypassHint, WindowType};
use crate::geometry::{Geometry, Rect, Region};
use crate::{Error, Xid};

/// Lifecycle states. Removal from the stack is the implicit terminal
/// step after a destroy fade; it is not a state of its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WinState {
    Unmapped,
    Mapping,
    Mapped,
    /// Mapped, with an opacity fade in flight.
    Fading,
    Unmapping,
    Destroying,
}

/// What to do when a lifecycle fade finishes. Carried inside the opacity
/// animatable; a destroy mid-unmap simply overwrites this slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishAction {
    FinishMap,
    FinishUnmap,
    FinishDestroy,
}

bitflags! {
    /// Per-window resource flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct WinFlags: u32 {
        /// The bound image no longer matches the window contents.
        const PIXMAP_STALE   = 1 << 0;
        /// Binding failed; the window stays unpainted until a resize or
        /// remap clears this.
        const IMAGE_ERROR    = 1 << 1;
        const SIZE_STALE     = 1 << 2;
        const POSITION_STALE = 1 << 3;
        const EXTENTS_STALE  = 1 << 4;
    }
}

/// How the window blends into the frame, recomputed every paint pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaintMode {
    /// Fully opaque; occludes everything beneath it.
    Solid,
    /// Opaque body, translucent frame.
    FrameTranslucent,
    Translucent,
}

/// Outcome of a destroy request.
#[derive(Debug)]
#[must_use = "the destroy outcome decides whether the record is removed"]
pub enum DestroyStart {
    /// Nothing visible to fade out; remove the record right away.
    RemoveNow,
    /// A fade to zero begins (or completes synchronously).
    Fading(Retargeted<FinishAction>),
    /// An unmap fade was in flight; its completion now destroys instead.
    Superseded,
}

#[derive(Debug)]
pub struct CompWindow {
    pub id: Xid,
    /// The application window inside this frame, once the session finds
    /// it. `None` while undiscovered or when the frame is its own client.
    pub client: Option<Xid>,
    /// `WM_CLIENT_LEADER` of the client, for group focus.
    pub leader: Option<Xid>,
    state: WinState,

    pub geometry: Geometry,
    /// Configure data received while unmapped, applied atomically at map.
    pub pending_geometry: Geometry,
    pub border_width: u32,
    pub pending_border_width: u32,
    pub override_redirect: bool,
    pub frame_extents: (u32, u32, u32, u32),
    /// Bounding shape in border-box coordinates, when the window has one.
    pub shaped: Option<Region>,

    pub opacity: Animatable<FinishAction>,
    pub opacity_target: f64,
    /// `_NET_WM_WINDOW_OPACITY`, when the window sets it.
    pub opacity_prop: Option<f64>,
    pub frame_opacity: f64,
    pub shadow_opacity: f64,

    /// Painted position; glides after a move when animation is on.
    pub anim_x: Animatable<()>,
    pub anim_y: Animatable<()>,

    pub flags: WinFlags,
    pub mode: PaintMode,
    pub argb: bool,
    pub ever_damaged: bool,
    /// Previous frame's paint verdict.
    pub to_paint: bool,
    pub paint_excluded: bool,
    pub unredir_ignored: bool,
    pub bypass: BypassHint,
    pub focused: bool,
    pub window_type: WindowType,
    pub shadow: bool,

    /// Opaque area above this window, cached between paints.
    pub ignore_region: Option<Region>,
    pub ignore_valid: bool,

    pub image: Option<ImageHandle>,
    pub shadow_image: Option<ImageHandle>,

    extents: Rect,
}

impl CompWindow {
    pub fn new(id: Xid, geometry: Geometry, border_width: u32, override_redirect: bool) -> Self {
        Self {
            id,
            client: None,
            leader: None,
            state: WinState::Unmapped,
            geometry,
            pending_geometry: geometry,
            border_width,
            pending_border_width: border_width,
            override_redirect,
            frame_extents: (0, 0, 0, 0),
            shaped: None,
            opacity: Animatable::new(0.0),
            opacity_target: 0.0,
            opacity_prop: None,
            frame_opacity: 1.0,
            shadow_opacity: 1.0,
            anim_x: Animatable::new(geometry.x as f64),
            anim_y: Animatable::new(geometry.y as f64),
            flags: WinFlags::EXTENTS_STALE,
            mode: PaintMode::Solid,
            argb: false,
            ever_damaged: false,
            to_paint: false,
            paint_excluded: false,
            unredir_ignored: false,
            bypass: BypassHint::NoPreference,
            focused: false,
            window_type: WindowType::Normal,
            shadow: false,
            ignore_region: None,
            ignore_valid: false,
            image: None,
            shadow_image: None,
            extents: geometry.border_box(border_width),
        }
    }

    pub fn state(&self) -> WinState {
        self.state
    }

    #[cfg(test)]
    pub(crate) fn force_state_for_tests(&mut self, state: WinState) {
        self.state = state;
    }

    /// Position the window is painted at this frame.
    pub fn paint_pos(&self) -> (i32, i32) {
        (
            self.anim_x.get().round() as i32,
            self.anim_y.get().round() as i32,
        )
    }

    /// Border box at the painted position.
    pub fn border_box(&self) -> Rect {
        let (x, y) = self.paint_pos();
        Geometry { x, y, ..self.geometry }.border_box(self.border_width)
    }

    /// Visible area: the bounding shape when one is set, otherwise the
    /// whole border box.
    pub fn bounding_region(&self) -> Region {
        let bb = self.border_box();
        match &self.shaped {
            Some(shape) => {
                let mut region = shape.clone();
                region.translate(bb.x1, bb.y1);
                region.intersect_rect(&bb);
                region
            }
            None => Region::from_rect(bb),
        }
    }

    /// Client body without the frame, used for occlusion when only the
    /// frame is translucent.
    pub fn body_region(&self) -> Region {
        let (x, y) = self.paint_pos();
        let bw = self.border_width as i32;
        let (left, right, top, bottom) = self.frame_extents;
        let body = Rect::new(
            x + bw + left as i32,
            y + bw + top as i32,
            x + bw + self.geometry.width as i32 - right as i32,
            y + bw + self.geometry.height as i32 - bottom as i32,
        );
        let mut region = self.bounding_region();
        region.intersect_rect(&body);
        region
    }

    /// Area guaranteed opaque under the current paint mode.
    pub fn opaque_region(&self) -> Region {
        match self.mode {
            PaintMode::Solid => self.bounding_region(),
            PaintMode::FrameTranslucent => self.body_region(),
            PaintMode::Translucent => Region::new(),
        }
    }

    pub fn has_frame(&self) -> bool {
        self.frame_extents != (0, 0, 0, 0) || self.border_width > 0
    }

    pub fn is_fullscreen(&self, screen_width: u32, screen_height: u32) -> bool {
        let r = self.border_box();
        r.x1 <= 0 && r.y1 <= 0 && r.x2 >= screen_width as i32 && r.y2 >= screen_height as i32
    }

    pub fn is_offscreen(&self, screen_width: u32, screen_height: u32) -> bool {
        !self
            .border_box()
            .intersects(&Rect::new(0, 0, screen_width as i32, screen_height as i32))
    }

    pub fn determine_mode(&self) -> PaintMode {
        if self.argb || self.opacity.get() < 1.0 {
            PaintMode::Translucent
        } else if self.frame_opacity < 1.0 && self.has_frame() {
            PaintMode::FrameTranslucent
        } else {
            PaintMode::Solid
        }
    }

    /// Re-resolves per-type and global options onto the record.
    pub fn apply_config(&mut self, config: &Config) {
        self.shadow = config.shadow_enabled(self.window_type);
        self.shadow_opacity = config.shadow.opacity;
        self.frame_opacity = config.opacity.frame_opacity;
        self.paint_excluded = config.paint_excluded(self.window_type);
        self.unredir_ignored = config.unredir_ignored(self.window_type);
        self.flags.insert(WinFlags::EXTENTS_STALE);
    }

    /// Cached bounding box including the shadow.
    pub fn extents(&self) -> Rect {
        self.extents
    }

    /// Where the drop shadow lands, at the painted position.
    pub fn shadow_rect(&self, shadow: &ShadowConfig) -> Rect {
        let base = self.border_box();
        let grow = 2 * shadow.radius as i32;
        Rect::new(
            base.x1 + shadow.offset_x,
            base.y1 + shadow.offset_y,
            base.x2 + shadow.offset_x + grow,
            base.y2 + shadow.offset_y + grow,
        )
    }

    pub fn refresh_extents(&mut self, shadow: &ShadowConfig) {
        let base = self.border_box();
        let mut r = base;
        if self.shadow {
            r = r.union_bounds(&self.shadow_rect(shadow));
        }
        self.extents = r;
        self.flags.remove(WinFlags::EXTENTS_STALE);
    }

    /// UNMAPPED -> MAPPING. Queued configure data is applied here so the
    /// window never shows stale geometry.
    pub fn start_map(
        &mut self,
        target: f64,
        fade_ticks: u32,
    ) -> Result<Retargeted<FinishAction>, Error> {
        if self.state != WinState::Unmapped {
            return Err(Error::BadTransition {
                from: self.state,
                request: "map",
            });
        }
        self.state = WinState::Mapping;
        self.geometry = self.pending_geometry;
        self.border_width = self.pending_border_width;
        self.anim_x = Animatable::new(self.geometry.x as f64);
        self.anim_y = Animatable::new(self.geometry.y as f64);
        self.ever_damaged = false;
        self.flags
            .insert(WinFlags::PIXMAP_STALE | WinFlags::EXTENTS_STALE);
        self.flags.remove(WinFlags::IMAGE_ERROR);
        self.opacity = Animatable::new(0.0);
        self.opacity_target = target;
        trace!(window = format_args!("{:#x}", self.id), fade_ticks, "start map");
        Ok(self
            .opacity
            .set_target(target, fade_ticks, Curve::Linear, Some(FinishAction::FinishMap)))
    }

    /// MAPPING -> UNMAPPED (no fade to show yet) or MAPPED/FADING ->
    /// UNMAPPING with a fade to zero.
    pub fn start_unmap(&mut self, fade_ticks: u32) -> Result<Retargeted<FinishAction>, Error> {
        match self.state {
            WinState::Mapping => {
                // The fade-in never finished; its completion must not run.
                let canceled = self.opacity.cancel();
                self.state = WinState::Unmapped;
                trace!(window = format_args!("{:#x}", self.id), "unmap before fade-in finished");
                Ok(Retargeted {
                    canceled,
                    completed: None,
                })
            }
            WinState::Mapped | WinState::Fading => {
                self.state = WinState::Unmapping;
                self.opacity_target = 0.0;
                trace!(window = format_args!("{:#x}", self.id), fade_ticks, "start unmap");
                Ok(self.opacity.set_target(
                    0.0,
                    fade_ticks,
                    Curve::Linear,
                    Some(FinishAction::FinishUnmap),
                ))
            }
            _ => Err(Error::BadTransition {
                from: self.state,
                request: "unmap",
            }),
        }
    }

    /// Any live state -> DESTROYING. A destroy always supersedes an
    /// in-flight unmap fade; both completions never run.
    pub fn start_destroy(&mut self, fade_ticks: u32) -> Result<DestroyStart, Error> {
        match self.state {
            WinState::Unmapped => Ok(DestroyStart::RemoveNow),
            WinState::Mapping | WinState::Mapped | WinState::Fading => {
                self.state = WinState::Destroying;
                self.opacity_target = 0.0;
                trace!(window = format_args!("{:#x}", self.id), fade_ticks, "start destroy");
                Ok(DestroyStart::Fading(self.opacity.set_target(
                    0.0,
                    fade_ticks,
                    Curve::Linear,
                    Some(FinishAction::FinishDestroy),
                )))
            }
            WinState::Unmapping => {
                self.state = WinState::Destroying;
                if self.opacity.animating() {
                    let _ = self.opacity.replace_action(FinishAction::FinishDestroy);
                    trace!(window = format_args!("{:#x}", self.id), "destroy supersedes unmap");
                    Ok(DestroyStart::Superseded)
                } else {
                    // The unmap fade settled on this very tick.
                    Ok(DestroyStart::RemoveNow)
                }
            }
            WinState::Destroying => Err(Error::BadTransition {
                from: self.state,
                request: "destroy",
            }),
        }
    }

    /// Opacity target change. MAPPED enters FADING; windows on their way
    /// out ignore new targets.
    pub fn retarget_opacity(&mut self, target: f64, ticks: u32) -> Retargeted<FinishAction> {
        let idle = Retargeted {
            canceled: None,
            completed: None,
        };
        match self.state {
            WinState::Mapped => {
                self.opacity_target = target;
                if (target - self.opacity.get()).abs() < 1e-9 {
                    return idle;
                }
                self.state = WinState::Fading;
                self.opacity.set_target(target, ticks, Curve::Linear, None)
            }
            WinState::Fading => {
                self.opacity_target = target;
                if (target - self.opacity.get()).abs() < 1e-9 {
                    let canceled = self.opacity.cancel();
                    return Retargeted {
                        canceled,
                        completed: None,
                    };
                }
                self.opacity.set_target(target, ticks, Curve::Linear, None)
            }
            WinState::Mapping => {
                // Still fading in; aim the fade at the new target and keep
                // the map completion pending.
                self.opacity_target = target;
                self.opacity
                    .set_target(target, ticks, Curve::Linear, Some(FinishAction::FinishMap))
            }
            _ => idle,
        }
    }

    /// Force-completes all in-flight animations, handing back the opacity
    /// completion so the pending transition can settle immediately.
    pub fn skip_fading(&mut self) -> Option<Finished<FinishAction>> {
        let _ = self.anim_x.early_stop();
        let _ = self.anim_y.early_stop();
        self.opacity.early_stop()
    }

    /// Glides the painted position to `(x, y)`; zero ticks snaps.
    pub fn start_move(&mut self, x: i32, y: i32, ticks: u32, curve: Curve) {
        let _ = self.anim_x.set_target(x as f64, ticks, curve, None);
        let _ = self.anim_y.set_target(y as f64, ticks, curve, None);
    }

    /// Applies a completed lifecycle fade. Returns `true` when the record
    /// must now be removed from the stack.
    pub(crate) fn finish_transition(&mut self, action: FinishAction) -> bool {
        match action {
            FinishAction::FinishMap => {
                debug_assert_eq!(self.state, WinState::Mapping);
                self.state = WinState::Mapped;
                false
            }
            FinishAction::FinishUnmap => {
                debug_assert_eq!(self.state, WinState::Unmapping);
                self.state = WinState::Unmapped;
                false
            }
            FinishAction::FinishDestroy => {
                debug_assert_eq!(self.state, WinState::Destroying);
                true
            }
        }
    }

    /// FADING settles back to MAPPED once its fade goes idle; that edge
    /// carries no action.
    pub(crate) fn settle_fading(&mut self) {
        if self.state == WinState::Fading && !self.opacity.animating() {
            self.state = WinState::Mapped;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::animation::TransitionEvent;

    fn window() -> CompWindow {
        CompWindow::new(0x42, Geometry::new(10, 20, 300, 200), 1, false)
    }

    fn mapped_window() -> CompWindow {
        let mut w = window();
        let begun = w.start_map(1.0, 0).unwrap();
        assert!(!w.finish_transition(begun.completed.unwrap().action));
        assert_eq!(w.state(), WinState::Mapped);
        w
    }

    #[test]
    fn test_map_only_from_unmapped() {
        for state in [
            WinState::Mapping,
            WinState::Mapped,
            WinState::Fading,
            WinState::Unmapping,
            WinState::Destroying,
        ] {
            let mut w = window();
            w.force_state_for_tests(state);
            assert!(w.start_map(1.0, 10).is_err());
            assert_eq!(w.state(), state, "rejected request must not mutate");
        }
        let mut w = window();
        let _ = w.start_map(1.0, 10).unwrap();
        assert_eq!(w.state(), WinState::Mapping);
    }

    #[test]
    fn test_unmap_edges() {
        // MAPPING -> UNMAPPED, the map completion is canceled, not run.
        let mut w = window();
        let _ = w.start_map(1.0, 10).unwrap();
        let out = w.start_unmap(10).unwrap();
        let canceled = out.canceled.unwrap();
        assert_eq!(canceled.action, FinishAction::FinishMap);
        assert_eq!(canceled.event, TransitionEvent::Canceled);
        assert_eq!(w.state(), WinState::Unmapped);

        // MAPPED -> UNMAPPING.
        let mut w = mapped_window();
        let _ = w.start_unmap(10).unwrap();
        assert_eq!(w.state(), WinState::Unmapping);

        // No edge from UNMAPPED, UNMAPPING or DESTROYING.
        for state in [WinState::Unmapped, WinState::Unmapping, WinState::Destroying] {
            let mut w = window();
            w.force_state_for_tests(state);
            assert!(w.start_unmap(10).is_err());
            assert_eq!(w.state(), state);
        }
    }

    #[test]
    fn test_destroy_edges() {
        // UNMAPPED: no fade, remove immediately, no state change observed.
        let mut w = window();
        assert!(matches!(w.start_destroy(10).unwrap(), DestroyStart::RemoveNow));
        assert_eq!(w.state(), WinState::Unmapped);

        for state in [WinState::Mapping, WinState::Mapped, WinState::Fading] {
            let mut w = window();
            w.force_state_for_tests(state);
            assert!(matches!(w.start_destroy(10).unwrap(), DestroyStart::Fading(_)));
            assert_eq!(w.state(), WinState::Destroying);
        }

        let mut w = window();
        w.force_state_for_tests(WinState::Destroying);
        assert!(w.start_destroy(10).is_err());
    }

    #[test]
    fn test_destroy_supersedes_unmap_completion() {
        let mut w = mapped_window();
        let _ = w.start_unmap(10).unwrap();
        for _ in 0..4 {
            assert!(w.opacity.step(1).is_none());
        }
        assert!(matches!(w.start_destroy(10).unwrap(), DestroyStart::Superseded));
        assert_eq!(w.state(), WinState::Destroying);

        // The in-flight fade keeps running; only the destroy completion
        // ever fires.
        let fin = w.opacity.step(10).unwrap();
        assert_eq!(fin.action, FinishAction::FinishDestroy);
        assert!(w.finish_transition(fin.action));
    }

    #[test]
    fn test_retarget_while_mapped_enters_fading() {
        let mut w = mapped_window();
        let out = w.retarget_opacity(0.5, 5);
        assert!(out.canceled.is_none());
        assert_eq!(w.state(), WinState::Fading);
        let _ = w.opacity.step(5);
        w.settle_fading();
        assert_eq!(w.state(), WinState::Mapped);
        assert_eq!(w.opacity.get(), 0.5);
    }

    #[test]
    fn test_retarget_ignored_on_the_way_out() {
        let mut w = mapped_window();
        let _ = w.start_unmap(10).unwrap();
        let out = w.retarget_opacity(0.8, 5);
        assert!(out.canceled.is_none() && out.completed.is_none());
        assert_eq!(w.opacity.target(), 0.0);
        assert_eq!(w.state(), WinState::Unmapping);
    }

    #[test]
    fn test_skip_fading_completes_transition() {
        let mut w = window();
        let _ = w.start_map(1.0, 10).unwrap();
        let fin = w.skip_fading().unwrap();
        assert_eq!(fin.action, FinishAction::FinishMap);
        assert_eq!(fin.event, TransitionEvent::StoppedEarly);
        assert!(!w.finish_transition(fin.action));
        assert_eq!(w.state(), WinState::Mapped);
        assert_eq!(w.opacity.get(), 1.0);
    }

    #[test]
    fn test_map_applies_pending_geometry() {
        let mut w = window();
        w.pending_geometry = Geometry::new(50, 60, 640, 480);
        w.pending_border_width = 0;
        let _ = w.start_map(1.0, 0).unwrap();
        assert_eq!(w.geometry, Geometry::new(50, 60, 640, 480));
        assert_eq!(w.border_width, 0);
        assert_eq!(w.paint_pos(), (50, 60));
    }

    #[test]
    fn test_paint_modes() {
        let mut w = mapped_window();
        assert_eq!(w.determine_mode(), PaintMode::Solid);
        w.argb = true;
        assert_eq!(w.determine_mode(), PaintMode::Translucent);
        w.argb = false;
        w.frame_opacity = 0.8;
        assert_eq!(w.determine_mode(), PaintMode::FrameTranslucent);
        let _ = w.retarget_opacity(0.5, 0);
        assert_eq!(w.determine_mode(), PaintMode::Translucent);
    }

    #[test]
    fn test_extents_include_shadow() {
        let mut w = window();
        let shadow = ShadowConfig {
            enabled: true,
            radius: 10,
            offset_x: -5,
            offset_y: -5,
            ..ShadowConfig::default()
        };
        w.shadow = true;
        w.refresh_extents(&shadow);
        let bb = w.border_box();
        let e = w.extents();
        assert!(e.contains(&bb));
        assert_eq!(e.x1, bb.x1 - 5);
        assert_eq!(e.x2, bb.x2 + 15);

        w.shadow = false;
        w.refresh_extents(&shadow);
        assert_eq!(w.extents(), bb);
    }

    #[test]
    fn test_opaque_region_by_mode() {
        let mut w = mapped_window();
        w.mode = PaintMode::Solid;
        assert_eq!(w.opaque_region().area(), w.bounding_region().area());
        w.mode = PaintMode::Translucent;
        assert!(w.opaque_region().is_empty());
        w.mode = PaintMode::FrameTranslucent;
        w.frame_extents = (2, 2, 20, 2);
        let body = w.opaque_region();
        assert!(body.area() < w.bounding_region().area());
        assert!(!body.is_empty());
    }

    #[test]
    fn test_fullscreen_and_offscreen() {
        let mut w = window();
        w.geometry = Geometry::new(0, 0, 1920, 1080);
        w.border_width = 0;
        w.anim_x = Animatable::new(0.0);
        w.anim_y = Animatable::new(0.0);
        assert!(w.is_fullscreen(1920, 1080));
        assert!(!w.is_fullscreen(2560, 1440));

        w.geometry = Geometry::new(2000, 0, 100, 100);
        w.anim_x = Animatable::new(2000.0);
        assert!(w.is_offscreen(1920, 1080));
    }
}
