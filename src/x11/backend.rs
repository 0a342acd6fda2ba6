//! XRender image backend
//!
//! Implements the core's backend seam on top of Composite named pixmaps
//! and RENDER pictures. Window images are the server-side pixmap of the
//! redirected window wrapped in a picture; shadows are plain A8
//! silhouettes the renderer colors at paint time. State sits behind an
//! `Rc` so the frame painter can resolve handles to pictures without
//! going through the compositor core.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::warn;
use x11rb::connection::Connection;
use x11rb::protocol::composite::{self, ConnectionExt as _};
use x11rb::protocol::render::{
    Color, ConnectionExt as _, CreatePictureAux, PictOp, PictType, Pictformat, Picture,
};
use x11rb::protocol::xproto::{ConnectionExt as _, Pixmap, Rectangle, Visualid};
use x11rb::rust_connection::RustConnection;

use crate::backend::{Backend, ImageHandle};
use crate::comp::window::CompWindow;
use crate::config::ShadowConfig;
use crate::{Error, Xid};

struct BoundImage {
    pixmap: Pixmap,
    picture: Picture,
}

struct RenderState {
    conn: Arc<RustConnection>,
    root: Xid,
    overlay: Xid,
    visual_formats: HashMap<Visualid, Pictformat>,
    a8_format: Pictformat,
    serial: u64,
    images: HashMap<u64, BoundImage>,
}

impl RenderState {
    fn track(&mut self, image: BoundImage) -> ImageHandle {
        self.serial += 1;
        self.images.insert(self.serial, image);
        ImageHandle(self.serial)
    }

    fn bind_window(&mut self, window: &CompWindow) -> Result<ImageHandle> {
        let conn = &self.conn;
        let attrs = conn
            .get_window_attributes(window.id)?
            .reply()
            .context("window attributes")?;
        let format = *self
            .visual_formats
            .get(&attrs.visual)
            .with_context(|| format!("no picture format for visual {}", attrs.visual))?;

        let pixmap = conn.generate_id()?;
        conn.composite_name_window_pixmap(window.id, pixmap)?
            .check()
            .context("name window pixmap")?;

        let picture = conn.generate_id()?;
        let created = conn
            .render_create_picture(picture, pixmap, format, &CreatePictureAux::new())
            .map_err(anyhow::Error::from)
            .and_then(|cookie| cookie.check().map_err(anyhow::Error::from));
        if let Err(e) = created {
            let _ = conn.free_pixmap(pixmap);
            return Err(e.context("create window picture"));
        }
        Ok(self.track(BoundImage { pixmap, picture }))
    }

    fn bind_shadow_mask(
        &mut self,
        window: &CompWindow,
        shadow: &ShadowConfig,
    ) -> Result<ImageHandle> {
        let rect = window.shadow_rect(shadow);
        let width = rect.width().clamp(1, u16::MAX as u32) as u16;
        let height = rect.height().clamp(1, u16::MAX as u32) as u16;

        let conn = &self.conn;
        let pixmap = conn.generate_id()?;
        conn.create_pixmap(8, pixmap, self.root, width, height)?
            .check()
            .context("shadow pixmap")?;

        let picture = conn.generate_id()?;
        let created = conn
            .render_create_picture(picture, pixmap, self.a8_format, &CreatePictureAux::new())
            .map_err(anyhow::Error::from)
            .and_then(|cookie| cookie.check().map_err(anyhow::Error::from));
        if let Err(e) = created {
            let _ = conn.free_pixmap(pixmap);
            return Err(e.context("create shadow picture"));
        }

        // A full-coverage silhouette; color and opacity are applied by the
        // painter each frame.
        conn.render_fill_rectangles(
            PictOp::SRC,
            picture,
            Color {
                red: 0,
                green: 0,
                blue: 0,
                alpha: 0xffff,
            },
            &[Rectangle {
                x: 0,
                y: 0,
                width,
                height,
            }],
        )?;
        Ok(self.track(BoundImage { pixmap, picture }))
    }

    fn release(&mut self, image: ImageHandle) {
        match self.images.remove(&image.0) {
            Some(bound) => {
                let _ = self.conn.render_free_picture(bound.picture);
                let _ = self.conn.free_pixmap(bound.pixmap);
            }
            None => warn!(handle = image.0, "released an image that was not bound"),
        }
    }
}

/// Backend over an X RENDER session. Cloning shares the underlying
/// state, which is how the frame painter resolves image handles.
#[derive(Clone)]
pub struct RenderBackend {
    state: Rc<RefCell<RenderState>>,
}

impl RenderBackend {
    pub fn new(conn: Arc<RustConnection>, root: Xid, overlay: Xid) -> Result<Self> {
        let reply = conn
            .render_query_pict_formats()?
            .reply()
            .context("query RENDER picture formats")?;

        let mut visual_formats = HashMap::new();
        for screen in &reply.screens {
            for depth in &screen.depths {
                for pv in &depth.visuals {
                    visual_formats.insert(pv.visual, pv.format);
                }
            }
        }
        let a8_format = reply
            .formats
            .iter()
            .find(|f| {
                f.type_ == PictType::DIRECT
                    && f.depth == 8
                    && f.direct.alpha_mask == 0xff
                    && f.direct.red_mask == 0
            })
            .map(|f| f.id)
            .context("no A8 picture format")?;

        Ok(Self {
            state: Rc::new(RefCell::new(RenderState {
                conn,
                root,
                overlay,
                visual_formats,
                a8_format,
                serial: 0,
                images: HashMap::new(),
            })),
        })
    }

    pub(crate) fn picture_of(&self, handle: ImageHandle) -> Option<Picture> {
        self.state.borrow().images.get(&handle.0).map(|i| i.picture)
    }

    pub(crate) fn format_for_visual(&self, visual: Visualid) -> Option<Pictformat> {
        self.state.borrow().visual_formats.get(&visual).copied()
    }
}

impl Backend for RenderBackend {
    /// Brings the overlay up, redirects every child of the root and
    /// exempts the overlay itself from redirection.
    fn redirect(&mut self) -> Result<(), Error> {
        let state = self.state.borrow();
        state
            .conn
            .map_window(state.overlay)
            .map_err(|e| Error::Display(e.to_string()))?;
        state
            .conn
            .composite_redirect_subwindows(state.root, composite::Redirect::MANUAL)
            .map_err(|e| Error::Display(e.to_string()))?
            .check()
            .map_err(|e| Error::Display(e.to_string()))?;
        state
            .conn
            .composite_unredirect_window(state.overlay, composite::Redirect::MANUAL)
            .map_err(|e| Error::Display(e.to_string()))?;
        Ok(())
    }

    fn unredirect(&mut self) {
        let state = self.state.borrow();
        if let Ok(cookie) =
            state
                .conn
                .composite_unredirect_subwindows(state.root, composite::Redirect::MANUAL)
        {
            if let Err(e) = cookie.check() {
                warn!("unredirect failed: {e}");
            }
        }
        let _ = state.conn.unmap_window(state.overlay);
        let _ = state.conn.flush();
    }

    fn bind_image(&mut self, window: &CompWindow) -> Result<ImageHandle, Error> {
        self.state
            .borrow_mut()
            .bind_window(window)
            .map_err(|e| Error::ImageBind {
                window: window.id,
                reason: format!("{e:#}"),
            })
    }

    fn release_image(&mut self, image: ImageHandle) {
        self.state.borrow_mut().release(image);
    }

    fn bind_shadow(
        &mut self,
        window: &CompWindow,
        shadow: &ShadowConfig,
    ) -> Result<ImageHandle, Error> {
        self.state
            .borrow_mut()
            .bind_shadow_mask(window, shadow)
            .map_err(|e| Error::ImageBind {
                window: window.id,
                reason: format!("{e:#}"),
            })
    }
}
