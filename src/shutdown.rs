use tokio::sync::broadcast;

/// Listens for the process-wide shutdown signal.
///
/// The signal travels over a `broadcast::Receiver`; only a single value is
/// ever sent. Once it arrives, the connection holding this `Shutdown` is
/// expected to wind down.
pub(crate) struct Shutdown {
    /// Set once the signal has been received.
    shutdown: bool,

    /// Our half of the broadcast pair.
    notify: broadcast::Receiver<()>,
}

impl Shutdown {
    /// Wraps a `broadcast::Receiver` in a fresh, not-yet-shutdown `Shutdown`.
    pub(crate) fn new(notify: broadcast::Receiver<()>) -> Shutdown {
        Shutdown {
            shutdown: false,
            notify,
        }
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown
    }

    /// Waits for the shutdown notification, if it hasn't arrived already.
    pub(crate) async fn recv(&mut self) {
        if self.shutdown {
            return;
        }

        // Only one value is ever sent, so a lag error can't happen here.
        let _ = self.notify.recv().await;

        self.shutdown = true;
    }
}
