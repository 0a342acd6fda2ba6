//! veil, a compositing manager for X11
//!
//! Wires the compositor core to a live display: the session decodes
//! server events into notifications, the core turns them into paint
//! plans and the renderer draws the plans onto the composite overlay.
//! The loop sleeps until the server has events, an animation tick is
//! due or a signal arrives.

use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use x11rb::protocol::Event;

use veil::backend::Backend;
use veil::comp::Compositor;
use veil::config::Config;
use veil::events::Notification;
use veil::x11::{EventStream, RenderBackend, Renderer, Session};

struct VeilApp {
    session: Session,
    stream: EventStream,
    renderer: Renderer,
    comp: Compositor,
    /// Scratch buffer for decoded notifications.
    notes: Vec<Notification>,
    shutdown_rx: mpsc::Receiver<()>,
    reload_rx: mpsc::Receiver<()>,
}

impl VeilApp {
    fn new(
        config: Config,
        shutdown_rx: mpsc::Receiver<()>,
        reload_rx: mpsc::Receiver<()>,
    ) -> Result<Self> {
        let mut session = Session::connect()?;
        let mut backend =
            RenderBackend::new(session.conn.clone(), session.root, session.overlay)?;
        backend.redirect().context("initial redirect failed")?;

        let renderer = Renderer::new(
            session.conn.clone(),
            backend.clone(),
            session.overlay,
            session.root_visual,
            session.root_depth,
            session.width,
            session.height,
        )?;
        let stream = EventStream::new(session.conn.clone())?;
        let mut comp = Compositor::new(
            config,
            Box::new(backend),
            session.root,
            u32::from(session.width),
            u32::from(session.height),
        );
        for note in session.scan()? {
            comp.handle_notification(note);
        }
        info!(windows = comp.window_count(), "compositing");

        Ok(Self {
            session,
            stream,
            renderer,
            comp,
            notes: Vec::new(),
            shutdown_rx,
            reload_rx,
        })
    }

    /// Main event loop
    async fn run(mut self) -> Result<()> {
        let mut should_exit = false;
        loop {
            if should_exit {
                self.session.release_overlay();
                return Ok(());
            }

            // Flush X11 requests at start of loop
            if let Err(e) = self.stream.flush() {
                let error_str = e.to_string();
                if error_str.contains("Broken pipe") || error_str.contains("Connection reset") {
                    info!("X11 connection lost, exiting cleanly");
                    should_exit = true;
                    continue;
                }
                warn!("Failed to flush X11 requests: {}", e);
            }

            // Drain every pending event before building the frame.
            loop {
                match self.stream.poll_next_event() {
                    Ok(Some(event)) => self.dispatch(&event),
                    Ok(None) => break,
                    Err(e) => {
                        let error_str = e.to_string();
                        if error_str.contains("Broken pipe")
                            || error_str.contains("Connection reset")
                        {
                            error!("X11 connection lost, exiting cleanly");
                            should_exit = true;
                        } else {
                            error!("Error polling for X11 events: {}", e);
                        }
                        break;
                    }
                }
            }
            if should_exit {
                continue;
            }

            let frame = self.comp.prepare_frame(Instant::now());
            if let Some(plan) = &frame.plan {
                if let Err(e) = self.renderer.paint(&self.comp, plan) {
                    warn!("frame paint failed: {e:#}");
                }
            }

            tokio::select! {
                () = self.stream.wait_readable() => {}
                _ = tokio::time::sleep(frame.timeout.unwrap_or(Duration::MAX)),
                    if frame.timeout.is_some() => {}
                _ = self.reload_rx.recv() => self.reload_config(),
                _ = self.shutdown_rx.recv() => {
                    info!("Shutdown signal received, cleaning up");
                    should_exit = true;
                }
            }
        }
    }

    fn dispatch(&mut self, event: &Event) {
        match event {
            // Overlay or root contents were lost; repaint everything.
            Event::Expose(e)
                if e.count == 0
                    && (e.window == self.session.overlay || e.window == self.session.root) =>
            {
                self.comp.force_repaint();
            }
            // Someone mapped the overlay while compositing is bypassed.
            Event::MapNotify(e)
                if e.window == self.session.overlay && !self.comp.redirected() =>
            {
                self.session.hide_overlay();
            }
            _ => {
                self.session.decode(event, &mut self.notes);
                for note in self.notes.drain(..) {
                    if let Notification::RootConfigured { width, height } = &note {
                        self.renderer.resize(*width as u16, *height as u16);
                    }
                    self.comp.handle_notification(note);
                }
            }
        }
    }

    fn reload_config(&mut self) {
        match Config::load() {
            Ok(config) => self.comp.update_config(config),
            Err(e) => warn!("config reload failed, keeping the old one: {e:#}"),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "veil=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting veil compositing manager");

    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            warn!("Failed to load configuration, using defaults: {e:#}");
            Config::default()
        }
    };

    // Setup signal handlers for graceful shutdown and config reload
    let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
    let (reload_tx, reload_rx) = mpsc::channel::<()>(1);

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        tokio::spawn(async move {
            tokio::select! {
                _ = sigterm.recv() => info!("Received SIGTERM, shutting down gracefully"),
                _ = sigint.recv() => info!("Received SIGINT, shutting down gracefully"),
            }
            let _ = shutdown_tx.send(()).await;
        });

        let mut sigusr1 = signal(SignalKind::user_defined1())?;
        tokio::spawn(async move {
            while sigusr1.recv().await.is_some() {
                info!("Received SIGUSR1, reloading configuration");
                if reload_tx.send(()).await.is_err() {
                    break;
                }
            }
        });
    }

    let app = VeilApp::new(config, shutdown_rx, reload_rx)?;
    app.run().await
}
