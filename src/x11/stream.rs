//! Async X event polling
//!
//! Wraps the blocking x11rb connection in a mio poller on a background
//! thread that pokes a tokio `Notify` whenever the server socket becomes
//! readable. The main loop can then await events, animation ticks and
//! signals in a single `select!` without dedicating a thread to X.

use std::os::unix::io::AsRawFd;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{oneshot, Notify};
use x11rb::connection::Connection;
use x11rb::protocol::Event;
use x11rb::rust_connection::RustConnection;

pub struct EventStream {
    conn: Arc<RustConnection>,
    notify: Arc<Notify>,
    /// Dropping the stream closes this end, which stops the poll thread.
    _poll_guard: oneshot::Receiver<()>,
}

impl EventStream {
    /// Registers the connection's socket with a background mio poller.
    pub fn new(conn: Arc<RustConnection>) -> Result<Self> {
        let fd = conn.stream().as_raw_fd();
        let notify = Arc::new(Notify::new());
        let task_notify = notify.clone();

        let (guard, poll_guard) = oneshot::channel::<()>();
        let mut poll = mio::Poll::new().context("failed to create mio poll")?;
        let mut events = mio::Events::with_capacity(1);
        poll.registry()
            .register(
                &mut mio::unix::SourceFd(&fd),
                mio::Token(0),
                mio::Interest::READABLE,
            )
            .context("failed to register the X socket with mio")?;

        // Bounded poll timeout so the thread notices the guard closing.
        let timeout = Duration::from_millis(100);
        tokio::task::spawn_blocking(move || loop {
            if guard.is_closed() {
                tracing::debug!("X socket poller shutting down");
                return;
            }
            if let Err(err) = poll.poll(&mut events, Some(timeout)) {
                tracing::warn!("X socket poll failed: {err:?}");
                continue;
            }
            events
                .iter()
                .filter(|event| event.token() == mio::Token(0))
                .for_each(|_| task_notify.notify_one());
        });

        Ok(Self {
            conn,
            notify,
            _poll_guard: poll_guard,
        })
    }

    /// Drains one buffered event without blocking; `None` when the buffer
    /// is empty.
    pub fn poll_next_event(&self) -> Result<Option<Event>> {
        Ok(self.conn.poll_for_event()?)
    }

    /// Resolves when the server socket has data to read.
    pub async fn wait_readable(&self) {
        self.notify.notified().await;
    }

    /// Pushes queued requests to the server; call before sleeping.
    pub fn flush(&self) -> Result<()> {
        self.conn.flush()?;
        Ok(())
    }
}
