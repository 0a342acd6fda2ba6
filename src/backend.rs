//! Backend seam
//!
//! The scheduler binds and releases window images through this trait and
//! never performs X or GPU work itself. Redirect and unredirect hooks let
//! the backend set up or tear down its server-side capture state. The
//! dummy backend keeps the whole core testable headless; the X render
//! backend plugs into the same seam.

use std::collections::HashSet;

use tracing::warn;

use crate::comp::window::CompWindow;
use crate::config::ShadowConfig;
use crate::Error;

/// Opaque handle to a bound window or shadow image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImageHandle(pub u64);

pub trait Backend {
    /// Compositing starts or resumes; capture resources come back.
    fn redirect(&mut self) -> Result<(), Error>;

    /// Compositing is bypassed; capture resources go away.
    fn unredirect(&mut self);

    /// Captures the window's current contents. At most one image per
    /// window is bound at a time; rebinding releases the old one first.
    fn bind_image(&mut self, window: &CompWindow) -> Result<ImageHandle, Error>;

    fn release_image(&mut self, image: ImageHandle);

    /// Builds the window's drop shadow image.
    fn bind_shadow(
        &mut self,
        window: &CompWindow,
        shadow: &ShadowConfig,
    ) -> Result<ImageHandle, Error>;
}

/// Headless backend: binds nothing real, counts everything. Useful for
/// driving the core without a display server.
#[derive(Debug, Default)]
pub struct DummyBackend {
    serial: u64,
    live: HashSet<u64>,
    binds: u64,
    releases: u64,
    redirected: bool,
    /// Make every bind fail, to exercise the error paths.
    pub fail_binds: bool,
}

impl DummyBackend {
    pub fn new() -> Self {
        Self {
            redirected: true,
            ..Default::default()
        }
    }

    /// Images currently bound and not yet released.
    pub fn live_images(&self) -> usize {
        self.live.len()
    }

    pub fn binds(&self) -> u64 {
        self.binds
    }

    pub fn releases(&self) -> u64 {
        self.releases
    }

    pub fn redirected(&self) -> bool {
        self.redirected
    }

    fn next_handle(&mut self) -> ImageHandle {
        self.serial += 1;
        self.live.insert(self.serial);
        self.binds += 1;
        ImageHandle(self.serial)
    }
}

impl Backend for DummyBackend {
    fn redirect(&mut self) -> Result<(), Error> {
        self.redirected = true;
        Ok(())
    }

    fn unredirect(&mut self) {
        self.redirected = false;
    }

    fn bind_image(&mut self, window: &CompWindow) -> Result<ImageHandle, Error> {
        if self.fail_binds {
            return Err(Error::ImageBind {
                window: window.id,
                reason: "binding disabled".into(),
            });
        }
        Ok(self.next_handle())
    }

    fn release_image(&mut self, image: ImageHandle) {
        if self.live.remove(&image.0) {
            self.releases += 1;
        } else {
            warn!(handle = image.0, "released an image that was not bound");
        }
    }

    fn bind_shadow(
        &mut self,
        window: &CompWindow,
        _shadow: &ShadowConfig,
    ) -> Result<ImageHandle, Error> {
        if self.fail_binds {
            return Err(Error::ImageBind {
                window: window.id,
                reason: "binding disabled".into(),
            });
        }
        Ok(self.next_handle())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Geometry;

    #[test]
    fn test_bind_release_pairing() {
        let mut backend = DummyBackend::new();
        let w = CompWindow::new(1, Geometry::new(0, 0, 10, 10), 0, false);
        let a = backend.bind_image(&w).unwrap();
        let b = backend.bind_image(&w).unwrap();
        assert_ne!(a, b);
        assert_eq!(backend.live_images(), 2);
        backend.release_image(a);
        backend.release_image(b);
        assert_eq!(backend.live_images(), 0);
        assert_eq!(backend.binds(), 2);
        assert_eq!(backend.releases(), 2);
    }

    #[test]
    fn test_failing_binds() {
        let mut backend = DummyBackend::new();
        backend.fail_binds = true;
        let w = CompWindow::new(1, Geometry::new(0, 0, 10, 10), 0, false);
        assert!(backend.bind_image(&w).is_err());
        assert_eq!(backend.live_images(), 0);
    }
}
