//! Best-effort, non-blocking cancel broadcast.

use tokio::sync::broadcast;

/// Broadcasts cancel requests to whoever is listening right now.
///
/// Firing with no listener is a silent no-op; the request is not queued for
/// listeners that subscribe later.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    tx: broadcast::Sender<()>,
}

impl Default for CancelSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelSignal {
    /// Create a new signal.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1);
        Self { tx }
    }

    /// Deliver a cancel request to every current listener.
    ///
    /// Returns the number of listeners reached.
    pub fn fire(&self) -> usize {
        self.tx.send(()).unwrap_or(0)
    }

    /// Start listening for cancel requests.
    #[must_use]
    pub fn listen(&self) -> CancelListener {
        CancelListener {
            rx: self.tx.subscribe(),
        }
    }
}

/// Receiving half of a [`CancelSignal`].
#[derive(Debug)]
pub struct CancelListener {
    rx: broadcast::Receiver<()>,
}

impl CancelListener {
    /// Resolve once a cancel request arrives.
    ///
    /// Never resolves if the signal itself is dropped.
    pub async fn cancelled(&mut self) {
        loop {
            match self.rx.recv().await {
                Ok(()) | Err(broadcast::error::RecvError::Lagged(_)) => return,
                Err(broadcast::error::RecvError::Closed) => {
                    std::future::pending::<()>().await;
                }
            }
        }
    }
}
