//! The outbound queue feeding a restage convergence layer.

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};

use crate::bundle::Bundle;
use crate::error::{BardError, Result};

/// A named queue of bundles tagged for restaging.
///
/// The daemon's output path enqueues bundles whose acceptance verdict chose
/// this link; the link's Restager drains it.
#[derive(Debug)]
pub struct Link {
    name: String,
    tx: Sender<Arc<Bundle>>,
    rx: Receiver<Arc<Bundle>>,
}

impl Link {
    pub fn new(name: &str) -> Arc<Self> {
        let (tx, rx) = crossbeam_channel::unbounded();
        Arc::new(Self {
            name: name.to_string(),
            tx,
            rx,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn enqueue(&self, bundle: Arc<Bundle>) -> Result<()> {
        match self.tx.try_send(bundle) {
            Ok(()) => Ok(()),
            Err(TrySendError::Disconnected(_)) => Err(BardError::LinkShutdown),
            Err(TrySendError::Full(_)) => unreachable!("unbounded queue"),
        }
    }

    /// Wait up to `timeout` for the next queued bundle.
    pub fn dequeue_timeout(&self, timeout: Duration) -> Option<Arc<Bundle>> {
        match self.rx.recv_timeout(timeout) {
            Ok(bundle) => Some(bundle),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    pub fn queue_len(&self) -> usize {
        self.rx.len()
    }
}
