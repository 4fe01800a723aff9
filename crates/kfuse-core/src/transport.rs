//! The byte channel between the bridge and its daemon.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::Bytes;
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// `close` was called on this side.
    #[error("transport closed")]
    Closed,
    /// The daemon went away.
    #[error("daemon disconnected")]
    Disconnected,
    #[error("failed to start reader thread: {0}")]
    Spawn(String),
}

/// Outgoing half. Each `send` writes one whole frame; frames from
/// concurrent callers never interleave.
pub trait Transport: Send + Sync {
    fn send(&self, frame: Bytes) -> Result<(), TransportError>;

    /// Stop accepting frames and let the daemon see end-of-stream.
    fn close(&self);
}

/// Receives inbound frames, one complete reply per call.
pub trait ReplySink: Send + Sync {
    fn deliver(&self, frame: Bytes);

    /// The channel is gone for good; no more frames will arrive.
    fn channel_lost(&self);
}

// ---------------------------------------------------------------------------
// ChannelTransport
// ---------------------------------------------------------------------------

/// In-process transport over crossbeam channels, for daemons living on a
/// thread of the same process.
pub struct ChannelTransport {
    to_daemon: Mutex<Option<Sender<Bytes>>>,
    from_daemon: Mutex<Option<Receiver<Bytes>>>,
    shutdown: Mutex<Option<Sender<()>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

/// The daemon's side of a [`ChannelTransport`].
pub struct DaemonEnd {
    requests: Receiver<Bytes>,
    replies: Sender<Bytes>,
}

impl ChannelTransport {
    pub fn pair() -> (ChannelTransport, DaemonEnd) {
        let (req_tx, req_rx) = channel::unbounded();
        let (rep_tx, rep_rx) = channel::unbounded();
        let transport = ChannelTransport {
            to_daemon: Mutex::new(Some(req_tx)),
            from_daemon: Mutex::new(Some(rep_rx)),
            shutdown: Mutex::new(None),
            reader: Mutex::new(None),
        };
        let daemon = DaemonEnd {
            requests: req_rx,
            replies: rep_tx,
        };
        (transport, daemon)
    }

    /// Spawn the reader thread that feeds replies into `sink`. Calling it
    /// a second time is a no-op.
    pub fn start(&self, sink: Arc<dyn ReplySink>) -> Result<(), TransportError> {
        let Some(rx) = self.from_daemon.lock().take() else {
            return Ok(());
        };
        let (stop_tx, stop_rx) = channel::bounded::<()>(0);
        let handle = thread::Builder::new()
            .name("kfuse-reader".into())
            .spawn(move || reader_loop(rx, stop_rx, sink))
            .map_err(|e| TransportError::Spawn(e.to_string()))?;
        *self.shutdown.lock() = Some(stop_tx);
        *self.reader.lock() = Some(handle);
        Ok(())
    }
}

fn reader_loop(rx: Receiver<Bytes>, stop: Receiver<()>, sink: Arc<dyn ReplySink>) {
    loop {
        crossbeam::select! {
            recv(rx) -> msg => match msg {
                Ok(frame) => sink.deliver(frame),
                Err(_) => {
                    tracing::warn!("daemon closed its reply channel");
                    sink.channel_lost();
                    return;
                }
            },
            recv(stop) -> _ => {
                tracing::debug!("reader thread stopping");
                return;
            }
        }
    }
}

impl Transport for ChannelTransport {
    fn send(&self, frame: Bytes) -> Result<(), TransportError> {
        let guard = self.to_daemon.lock();
        let tx = guard.as_ref().ok_or(TransportError::Closed)?;
        tx.send(frame).map_err(|_| TransportError::Disconnected)
    }

    fn close(&self) {
        self.to_daemon.lock().take();
        self.shutdown.lock().take();
        let handle = self.reader.lock().take();
        if let Some(handle) = handle {
            // The reader itself may be the one closing (via channel_lost).
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for ChannelTransport {
    fn drop(&mut self) {
        self.close();
    }
}

impl DaemonEnd {
    /// Next request frame; `None` once the bridge has closed the transport.
    pub fn recv(&self) -> Option<Bytes> {
        self.requests.recv().ok()
    }

    /// Like `recv`, giving up after `timeout`. The outer `None` means the
    /// transport is closed.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<Option<Bytes>> {
        match self.requests.recv_timeout(timeout) {
            Ok(frame) => Some(Some(frame)),
            Err(RecvTimeoutError::Timeout) => Some(None),
            Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    pub fn reply(&self, frame: Bytes) -> Result<(), TransportError> {
        self.replies
            .send(frame)
            .map_err(|_| TransportError::Disconnected)
    }

    /// A cloneable handle for replying from other threads.
    pub fn replier(&self) -> Sender<Bytes> {
        self.replies.clone()
    }

    /// Split into the request receiver and the reply sender. Dropping
    /// every reply sender reads as a daemon disconnect on the bridge side.
    pub fn into_parts(self) -> (Receiver<Bytes>, Sender<Bytes>) {
        (self.requests, self.replies)
    }
}
