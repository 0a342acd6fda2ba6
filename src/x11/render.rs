//! XRender frame painter
//!
//! Executes paint plans onto the overlay through a screen-sized back
//! buffer. Each entry is drawn bottom-up with the picture clip set to
//! its visible region intersected with the frame damage, so pixels the
//! plan did not touch survive from the previous frame. The finished
//! buffer lands on the overlay in one composite, which keeps tearing
//! down to the server's blit.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::trace;
use x11rb::connection::Connection;
use x11rb::protocol::render::{
    Color, ConnectionExt as _, CreatePictureAux, PictOp, Pictformat, Picture,
};
use x11rb::protocol::xproto::{ConnectionExt as _, Pixmap, Rectangle, Visualid};
use x11rb::rust_connection::RustConnection;

use crate::comp::window::{CompWindow, PaintMode};
use crate::comp::{Compositor, PaintPlan};
use crate::config::ShadowConfig;
use crate::geometry::{Rect, Region};
use crate::x11::backend::RenderBackend;
use crate::Xid;

const BACKGROUND: Color = Color {
    red: 0,
    green: 0,
    blue: 0,
    alpha: 0xffff,
};

struct BackBuffer {
    pixmap: Pixmap,
    picture: Picture,
    width: u16,
    height: u16,
}

pub struct Renderer {
    conn: Arc<RustConnection>,
    backend: RenderBackend,
    overlay: Xid,
    root_depth: u8,
    root_format: Pictformat,
    target: Picture,
    buffer: Option<BackBuffer>,
    width: u16,
    height: u16,
}

impl Renderer {
    pub fn new(
        conn: Arc<RustConnection>,
        backend: RenderBackend,
        overlay: Xid,
        root_visual: Visualid,
        root_depth: u8,
        width: u16,
        height: u16,
    ) -> Result<Self> {
        let root_format = backend
            .format_for_visual(root_visual)
            .context("no picture format for the root visual")?;
        let target = conn.generate_id()?;
        conn.render_create_picture(target, overlay, root_format, &CreatePictureAux::new())?
            .check()
            .context("create overlay picture")?;
        Ok(Self {
            conn,
            backend,
            overlay,
            root_depth,
            root_format,
            target,
            buffer: None,
            width,
            height,
        })
    }

    /// The root changed size; the back buffer is rebuilt on the next
    /// frame.
    pub fn resize(&mut self, width: u16, height: u16) {
        self.width = width;
        self.height = height;
    }

    pub fn paint(&mut self, comp: &Compositor, plan: &PaintPlan) -> Result<()> {
        let buffer = self.ensure_buffer()?;
        let damage_rects = to_xrects(plan.damage.rects());
        if damage_rects.is_empty() {
            return Ok(());
        }
        trace!(
            entries = plan.entries.len(),
            damage = plan.damage.area(),
            "paint frame"
        );

        // Whatever no window covers shows the background.
        self.set_clip(buffer, &damage_rects)?;
        self.conn.render_fill_rectangles(
            PictOp::SRC,
            buffer,
            BACKGROUND,
            &[Rectangle {
                x: 0,
                y: 0,
                width: self.width,
                height: self.height,
            }],
        )?;

        for entry in &plan.entries {
            let Some(w) = comp.window(entry.handle) else {
                continue;
            };
            let clip = entry.region.intersection(&plan.damage);
            if clip.is_empty() {
                continue;
            }
            self.paint_shadow(comp, w, &clip, buffer)?;
            self.paint_window(w, &clip, buffer)?;
        }

        self.set_clip(self.target, &damage_rects)?;
        self.conn.render_composite(
            PictOp::SRC,
            buffer,
            x11rb::NONE,
            self.target,
            0,
            0,
            0,
            0,
            0,
            0,
            self.width,
            self.height,
        )?;
        self.conn.flush()?;
        Ok(())
    }

    /// Drop shadow under one window. The caster's own bounding area is
    /// carved out so the shadow never darkens the window above it.
    fn paint_shadow(
        &self,
        comp: &Compositor,
        w: &CompWindow,
        clip: &Region,
        buffer: Picture,
    ) -> Result<()> {
        if !w.shadow {
            return Ok(());
        }
        let Some(mask) = w.shadow_image.and_then(|h| self.backend.picture_of(h)) else {
            return Ok(());
        };
        let mut shadow_clip = clip.clone();
        shadow_clip.subtract(&w.bounding_region());
        if shadow_clip.is_empty() {
            return Ok(());
        }
        self.set_clip(buffer, &to_xrects(shadow_clip.rects()))?;

        let shadow = &comp.config().shadow;
        let rect = w.shadow_rect(shadow);
        let tint = self.conn.generate_id()?;
        self.conn
            .render_create_solid_fill(tint, shadow_color(shadow, w.shadow_opacity))?;
        self.conn.render_composite(
            PictOp::OVER,
            tint,
            mask,
            buffer,
            0,
            0,
            0,
            0,
            clamp_i16(rect.x1),
            clamp_i16(rect.y1),
            clamp_u16(rect.width()),
            clamp_u16(rect.height()),
        )?;
        self.conn.render_free_picture(tint)?;
        Ok(())
    }

    fn paint_window(&self, w: &CompWindow, clip: &Region, buffer: Picture) -> Result<()> {
        let Some(pict) = w.image.and_then(|h| self.backend.picture_of(h)) else {
            return Ok(());
        };
        let bb = w.border_box();
        match w.mode {
            PaintMode::Solid => {
                let body = clip.intersection(&w.bounding_region());
                if !body.is_empty() {
                    self.set_clip(buffer, &to_xrects(body.rects()))?;
                    self.composite_at(PictOp::SRC, pict, x11rb::NONE, buffer, &bb)?;
                }
            }
            PaintMode::Translucent => {
                let body = clip.intersection(&w.bounding_region());
                if !body.is_empty() {
                    self.set_clip(buffer, &to_xrects(body.rects()))?;
                    self.composite_faded(pict, buffer, &bb, w.opacity.get())?;
                }
            }
            PaintMode::FrameTranslucent => {
                // Opaque body, then the frame ring at its own opacity.
                let body = clip.intersection(&w.body_region());
                if !body.is_empty() {
                    self.set_clip(buffer, &to_xrects(body.rects()))?;
                    self.composite_at(PictOp::SRC, pict, x11rb::NONE, buffer, &bb)?;
                }
                let mut frame = w.bounding_region();
                frame.subtract(&w.body_region());
                let frame = clip.intersection(&frame);
                if !frame.is_empty() {
                    self.set_clip(buffer, &to_xrects(frame.rects()))?;
                    self.composite_faded(pict, buffer, &bb, w.frame_opacity)?;
                }
            }
        }
        Ok(())
    }

    /// OVER with a solid alpha mask; the mask picture lives for one call.
    fn composite_faded(&self, src: Picture, dst: Picture, at: &Rect, alpha: f64) -> Result<()> {
        let mask = self.conn.generate_id()?;
        self.conn.render_create_solid_fill(
            mask,
            Color {
                red: 0,
                green: 0,
                blue: 0,
                alpha: channel(alpha),
            },
        )?;
        self.composite_at(PictOp::OVER, src, mask, dst, at)?;
        self.conn.render_free_picture(mask)?;
        Ok(())
    }

    fn composite_at(
        &self,
        op: PictOp,
        src: Picture,
        mask: Picture,
        dst: Picture,
        at: &Rect,
    ) -> Result<()> {
        self.conn.render_composite(
            op,
            src,
            mask,
            dst,
            0,
            0,
            0,
            0,
            clamp_i16(at.x1),
            clamp_i16(at.y1),
            clamp_u16(at.width()),
            clamp_u16(at.height()),
        )?;
        Ok(())
    }

    fn set_clip(&self, picture: Picture, rects: &[Rectangle]) -> Result<()> {
        self.conn
            .render_set_picture_clip_rectangles(picture, 0, 0, rects)?;
        Ok(())
    }

    fn ensure_buffer(&mut self) -> Result<Picture> {
        if let Some(buffer) = &self.buffer {
            if buffer.width == self.width && buffer.height == self.height {
                return Ok(buffer.picture);
            }
        }
        if let Some(old) = self.buffer.take() {
            let _ = self.conn.render_free_picture(old.picture);
            let _ = self.conn.free_pixmap(old.pixmap);
        }
        let pixmap = self.conn.generate_id()?;
        self.conn
            .create_pixmap(self.root_depth, pixmap, self.overlay, self.width, self.height)?
            .check()
            .context("create back buffer")?;
        let picture = self.conn.generate_id()?;
        self.conn
            .render_create_picture(picture, pixmap, self.root_format, &CreatePictureAux::new())?
            .check()
            .context("create back buffer picture")?;
        self.buffer = Some(BackBuffer {
            pixmap,
            picture,
            width: self.width,
            height: self.height,
        });
        Ok(picture)
    }
}

/// RENDER wants premultiplied channels.
fn shadow_color(shadow: &ShadowConfig, opacity: f64) -> Color {
    let a = opacity.clamp(0.0, 1.0);
    Color {
        red: channel(shadow.red * a),
        green: channel(shadow.green * a),
        blue: channel(shadow.blue * a),
        alpha: channel(a),
    }
}

fn channel(v: f64) -> u16 {
    (v.clamp(0.0, 1.0) * f64::from(u16::MAX)) as u16
}

fn clamp_i16(v: i32) -> i16 {
    v.clamp(i16::MIN as i32, i16::MAX as i32) as i16
}

fn clamp_u16(v: u32) -> u16 {
    v.min(u16::MAX as u32) as u16
}

fn to_xrects(rects: &[Rect]) -> Vec<Rectangle> {
    rects
        .iter()
        .filter(|r| !r.is_empty())
        .map(|r| Rectangle {
            x: clamp_i16(r.x1),
            y: clamp_i16(r.y1),
            width: clamp_u16(r.width()),
            height: clamp_u16(r.height()),
        })
        .collect()
}
