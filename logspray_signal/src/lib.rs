//! Shutdown signalling for logspray.
//!
//! The generator coordinates one broadcaster -- the pool -- with many
//! watchers: async aggregation tasks and the native sender threads. The
//! `Broadcaster` fires exactly once; every `Watcher` observes the signal
//! either by awaiting [`Watcher::recv`] or, from a hot thread that must not
//! block, by polling [`Watcher::try_recv`] between ticks.
//!
//! There is one `Broadcaster` and potentially many `Watcher` instances.

#![deny(clippy::all)]
#![deny(clippy::perf)]
#![deny(clippy::suspicious)]
#![deny(clippy::complexity)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]
#![deny(missing_debug_implementations)]

use tokio::sync::broadcast::{self, error};
use tracing::info;

/// Construct a `Watcher` and `Broadcaster` pair.
#[must_use]
pub fn signal() -> (Watcher, Broadcaster) {
    // The broadcast channel is used only for its reliable close-on-drop
    // semantics; no payload ever travels through it.
    let (sender, receiver) = broadcast::channel(1);

    let w = Watcher {
        receiver,
        signal_received: false,
    };
    let b = Broadcaster { sender };

    (w, b)
}

#[derive(Debug)]
/// Mechanism to notify `Watcher` instances that shutdown has begun.
pub struct Broadcaster {
    sender: broadcast::Sender<()>,
}

impl Broadcaster {
    /// Send the signal through to any `Watcher` instances.
    ///
    /// Consumes the `Broadcaster`; the signal cannot be fired twice.
    pub fn signal(self) {
        info!("shutdown signal broadcast");
        drop(self.sender);
    }
}

/// Errors for `Watcher::try_recv`.
#[derive(thiserror::Error, Debug, Clone, Copy)]
pub enum TryRecvError {
    /// The signal has been received and yet `try_recv` was called.
    #[error("signal has been received")]
    SignalReceived,
}

#[derive(Debug)]
/// Mechanism to watch for the shutdown signal.
pub struct Watcher {
    /// Tracks whether the signal has been seen, without synchronization.
    signal_received: bool,
    /// Reception point for the signal from `Broadcaster`.
    receiver: broadcast::Receiver<()>,
}

impl Watcher {
    /// Receive the shutdown notice. This function will block if a notice has
    /// not already been sent.
    ///
    /// If `recv` is called after the signal has been received this function
    /// returns immediately.
    pub async fn recv(mut self) {
        if self.signal_received {
            return;
        }

        match self.receiver.recv().await {
            Ok(()) | Err(error::RecvError::Closed) => {
                self.signal_received = true;
            }
            Err(error::RecvError::Lagged(_)) => {
                unreachable!("nothing is ever sent through the signal channel");
            }
        }
    }

    /// Check if the shutdown notice has been sent, without blocking.
    ///
    /// If the signal has not been received returns `Ok(false)`, else
    /// `Ok(true)` once. All calls after return `TryRecvError::SignalReceived`.
    ///
    /// # Errors
    ///
    /// Returns `TryRecvError::SignalReceived` if the signal has already been
    /// observed by this watcher.
    pub fn try_recv(&mut self) -> Result<bool, TryRecvError> {
        if self.signal_received {
            return Err(TryRecvError::SignalReceived);
        }

        match self.receiver.try_recv() {
            Ok(()) | Err(error::TryRecvError::Closed) => {
                self.signal_received = true;
                Ok(true)
            }
            Err(error::TryRecvError::Empty) => Ok(false),
            Err(error::TryRecvError::Lagged(_)) => {
                unreachable!("nothing is ever sent through the signal channel")
            }
        }
    }
}

impl Clone for Watcher {
    fn clone(&self) -> Self {
        Self {
            receiver: self.receiver.resubscribe(),
            signal_received: self.signal_received,
        }
    }
}
