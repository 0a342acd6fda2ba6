//! Animatable values
//!
//! A scalar that moves from a start to a target value over a fixed number
//! of discrete ticks. Opacity fades and move animations are both driven by
//! this type. A transition may carry one pending action of the caller's
//! choosing; whichever operation ends the transition hands that action
//! back exactly once, tagged with the reason it ended.

/// Why a transition ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionEvent {
    /// Ran to the end; the value sits at the target.
    Completed,
    /// Interrupted; the value froze wherever it was.
    Canceled,
    /// Skipped ahead; the value jumped to the target.
    StoppedEarly,
}

/// A pending action handed back when its transition ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "a finished transition carries an action that must be resolved"]
pub struct Finished<A> {
    pub action: A,
    pub event: TransitionEvent,
}

/// Outcome of retargeting: the interrupted old transition (if one was
/// running) and, for a zero-duration retarget, the synchronously completed
/// new one.
#[derive(Debug)]
#[must_use = "retargeting may finish transitions whose actions must be resolved"]
pub struct Retargeted<A> {
    pub canceled: Option<Finished<A>>,
    pub completed: Option<Finished<A>>,
}

/// Interpolation curve. Fades are linear; move animations use an easing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Curve {
    #[default]
    Linear,
    EaseOutCubic,
    EaseInOutQuad,
}

impl Curve {
    fn apply(self, t: f64) -> f64 {
        match self {
            Curve::Linear => t,
            Curve::EaseOutCubic => {
                let u = 1.0 - t;
                1.0 - u * u * u
            }
            Curve::EaseInOutQuad => {
                if t < 0.5 {
                    2.0 * t * t
                } else {
                    1.0 - (-2.0 * t + 2.0).powi(2) / 2.0
                }
            }
        }
    }
}

/// A value in transition. Idle whenever `duration == 0`; while animating,
/// `progress < duration` holds and reaching the end atomically collapses
/// the value back to idle at the target.
#[derive(Debug, Clone)]
pub struct Animatable<A> {
    start: f64,
    target: f64,
    duration: u32,
    progress: u32,
    curve: Curve,
    action: Option<A>,
}

impl<A> Animatable<A> {
    /// An idle value.
    pub fn new(value: f64) -> Self {
        Self {
            start: value,
            target: value,
            duration: 0,
            progress: 0,
            curve: Curve::Linear,
            action: None,
        }
    }

    pub fn animating(&self) -> bool {
        self.duration != 0
    }

    /// Interpolated current value; the target once idle.
    pub fn get(&self) -> f64 {
        if self.duration == 0 {
            return self.target;
        }
        let t = self.curve.apply(self.progress as f64 / self.duration as f64);
        (1.0 - t) * self.start + t * self.target
    }

    /// Fraction complete in [0, 1]; 1 once idle.
    pub fn get_progress(&self) -> f64 {
        if self.duration == 0 {
            return 1.0;
        }
        self.progress as f64 / self.duration as f64
    }

    pub fn target(&self) -> f64 {
        self.target
    }

    /// Advances by up to `steps` ticks. Reaching the end collapses to idle
    /// and hands back the pending action with `Completed`.
    pub fn step(&mut self, steps: u32) -> Option<Finished<A>> {
        if self.duration == 0 || steps == 0 {
            return None;
        }
        if steps >= self.duration - self.progress {
            return self.finish(TransitionEvent::Completed);
        }
        self.progress += steps;
        None
    }

    /// Freezes at the current value. The pending action comes back with
    /// `Canceled`; callers must not run it.
    pub fn cancel(&mut self) -> Option<Finished<A>> {
        if self.duration == 0 {
            return None;
        }
        self.target = self.get();
        self.finish(TransitionEvent::Canceled)
    }

    /// Jumps straight to the target, handing back the pending action with
    /// `StoppedEarly`.
    pub fn early_stop(&mut self) -> Option<Finished<A>> {
        if self.duration == 0 {
            return None;
        }
        self.finish(TransitionEvent::StoppedEarly)
    }

    /// Begins a new transition from the current value. Any in-flight
    /// transition is canceled first. A zero duration applies the target
    /// immediately and completes the new action synchronously.
    pub fn set_target(
        &mut self,
        target: f64,
        duration: u32,
        curve: Curve,
        action: Option<A>,
    ) -> Retargeted<A> {
        let canceled = self.cancel();
        self.target = target;
        self.curve = curve;
        if duration == 0 {
            self.start = target;
            let completed = action.map(|action| Finished {
                action,
                event: TransitionEvent::Completed,
            });
            return Retargeted { canceled, completed };
        }
        self.duration = duration;
        self.progress = 0;
        self.action = action;
        Retargeted {
            canceled,
            completed: None,
        }
    }

    /// Swaps the pending action without touching the transition itself,
    /// returning the action it displaced. No-op on an idle value.
    pub fn replace_action(&mut self, action: A) -> Option<A> {
        if self.duration == 0 {
            return None;
        }
        self.action.replace(action)
    }

    fn finish(&mut self, event: TransitionEvent) -> Option<Finished<A>> {
        self.start = self.target;
        self.duration = 0;
        self.progress = 0;
        self.action.take().map(|action| Finished { action, event })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Tag {
        MapDone,
        UnmapDone,
        DestroyDone,
    }

    #[test]
    fn test_linear_fade_midpoint_and_completion() {
        let mut a: Animatable<Tag> = Animatable::new(0.0);
        let begun = a.set_target(255.0, 10, Curve::Linear, Some(Tag::MapDone));
        assert!(begun.canceled.is_none());
        assert!(begun.completed.is_none());

        for _ in 0..5 {
            assert!(a.step(1).is_none());
        }
        assert_eq!(a.get_progress(), 0.5);
        assert!((a.get() - 127.5).abs() < 1.0);

        let mut fired = 0;
        for _ in 0..5 {
            if let Some(fin) = a.step(1) {
                assert_eq!(fin.action, Tag::MapDone);
                assert_eq!(fin.event, TransitionEvent::Completed);
                fired += 1;
            }
        }
        assert_eq!(fired, 1);
        assert!(!a.animating());
        assert_eq!(a.get(), 255.0);
        assert_eq!(a.get_progress(), 1.0);
        // Idle values no longer step.
        assert!(a.step(1).is_none());
    }

    #[test]
    fn test_progress_is_monotonic() {
        let mut a: Animatable<Tag> = Animatable::new(0.0);
        let _ = a.set_target(1.0, 7, Curve::Linear, None);
        let mut last = 0.0;
        for _ in 0..10 {
            let _ = a.step(1);
            let p = a.get_progress();
            assert!(p >= last);
            last = p;
        }
        assert_eq!(last, 1.0);
    }

    #[test]
    fn test_overshoot_clamps_to_target() {
        let mut a: Animatable<Tag> = Animatable::new(10.0);
        let _ = a.set_target(20.0, 4, Curve::Linear, Some(Tag::MapDone));
        let fin = a.step(100).unwrap();
        assert_eq!(fin.event, TransitionEvent::Completed);
        assert_eq!(a.get(), 20.0);
    }

    #[test]
    fn test_cancel_freezes_current_value() {
        let mut a: Animatable<Tag> = Animatable::new(0.0);
        let _ = a.set_target(100.0, 10, Curve::Linear, Some(Tag::MapDone));
        for _ in 0..4 {
            let _ = a.step(1);
        }
        let fin = a.cancel().unwrap();
        assert_eq!(fin.event, TransitionEvent::Canceled);
        assert_eq!(fin.action, Tag::MapDone);
        assert_eq!(a.get(), 40.0);
        assert_eq!(a.target(), 40.0);
        assert!(a.cancel().is_none());
    }

    #[test]
    fn test_early_stop_jumps_to_target() {
        let mut a: Animatable<Tag> = Animatable::new(0.0);
        let _ = a.set_target(100.0, 10, Curve::Linear, Some(Tag::UnmapDone));
        let _ = a.step(3);
        let fin = a.early_stop().unwrap();
        assert_eq!(fin.event, TransitionEvent::StoppedEarly);
        assert_eq!(fin.action, Tag::UnmapDone);
        assert_eq!(a.get(), 100.0);
    }

    #[test]
    fn test_retarget_cancels_old_episode() {
        let mut a: Animatable<Tag> = Animatable::new(0.0);
        let _ = a.set_target(100.0, 10, Curve::Linear, Some(Tag::MapDone));
        let _ = a.step(5);
        let re = a.set_target(0.0, 10, Curve::Linear, Some(Tag::UnmapDone));
        let canceled = re.canceled.unwrap();
        assert_eq!(canceled.action, Tag::MapDone);
        assert_eq!(canceled.event, TransitionEvent::Canceled);
        // New episode starts from the frozen value.
        assert_eq!(a.get(), 50.0);
        let fin = a.step(10).unwrap();
        assert_eq!(fin.action, Tag::UnmapDone);
        assert_eq!(a.get(), 0.0);
    }

    #[test]
    fn test_zero_duration_completes_synchronously() {
        let mut a: Animatable<Tag> = Animatable::new(3.0);
        let re = a.set_target(9.0, 0, Curve::Linear, Some(Tag::MapDone));
        let fin = re.completed.unwrap();
        assert_eq!(fin.event, TransitionEvent::Completed);
        assert_eq!(fin.action, Tag::MapDone);
        assert!(!a.animating());
        assert_eq!(a.get(), 9.0);
    }

    #[test]
    fn test_replace_action_displaces_pending() {
        let mut a: Animatable<Tag> = Animatable::new(1.0);
        let _ = a.set_target(0.0, 10, Curve::Linear, Some(Tag::UnmapDone));
        assert_eq!(a.replace_action(Tag::DestroyDone), Some(Tag::UnmapDone));
        let fin = a.step(10).unwrap();
        assert_eq!(fin.action, Tag::DestroyDone);
        // Idle values have no action slot to replace.
        assert_eq!(a.replace_action(Tag::MapDone), None);
    }

    #[test]
    fn test_easing_curves_hit_endpoints() {
        for curve in [Curve::Linear, Curve::EaseOutCubic, Curve::EaseInOutQuad] {
            let mut a: Animatable<Tag> = Animatable::new(0.0);
            let _ = a.set_target(50.0, 8, curve, None);
            assert_eq!(a.get(), 0.0);
            let _ = a.step(8);
            assert_eq!(a.get(), 50.0);
        }
    }
}
