//! Sending of cache update notifications.
//!
//! Notifications are distributed through a watch channel carrying the
//! version of the most recently announced snapshot. Each connection holds
//! its own receiver, so a slow connection never holds up the sender or any
//! of the other connections.

use std::sync::Arc;
use futures::future::pending;
use log::debug;
use tokio::sync::watch;


//------------ NotifySender --------------------------------------------------

/// The sending side of the update notifications.
///
/// Values can be cloned cheaply. All clones notify the same set of
/// receivers.
#[derive(Clone, Debug)]
pub struct NotifySender {
    tx: Arc<watch::Sender<u64>>,

    /// Should notifications actually be sent?
    enabled: bool,
}

impl NotifySender {
    /// Creates a new sender starting at the given version.
    ///
    /// If `enabled` is `false`, calls to [`notify`][Self::notify] do
    /// nothing and routers will have to poll for updates.
    pub fn new(version: u64, enabled: bool) -> Self {
        let (tx, _) = watch::channel(version);
        NotifySender { tx: Arc::new(tx), enabled }
    }

    /// Announces a new version to all receivers.
    ///
    /// Nothing happens if the version isn’t newer than the last announced
    /// one or if notifications are disabled. Returns whether receivers
    /// have been notified.
    pub fn notify(&self, version: u64) -> bool {
        if !self.enabled {
            debug!("RTR: notifications disabled, not announcing {}.", version);
            return false
        }
        self.tx.send_if_modified(|current| {
            if version <= *current {
                false
            }
            else {
                *current = version;
                true
            }
        })
    }

    /// Creates a new receiver.
    ///
    /// The receiver will only see versions announced after its creation.
    pub fn subscribe(&self) -> NotifyReceiver {
        NotifyReceiver {
            rx: Some(self.tx.subscribe())
        }
    }

    /// Returns the number of currently existing receivers.
    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}


//------------ NotifyReceiver ------------------------------------------------

/// The receiving side of the update notifications.
#[derive(Debug)]
pub struct NotifyReceiver {
    /// The receiver or `None` if all senders are gone.
    rx: Option<watch::Receiver<u64>>,
}

impl NotifyReceiver {
    /// Waits for the next announced version.
    ///
    /// If several versions are announced before this is called, only the
    /// most recent one is returned. If all senders have been dropped, the
    /// returned future never resolves.
    ///
    /// This method is cancel safe.
    pub async fn recv(&mut self) -> u64 {
        if let Some(rx) = self.rx.as_mut() {
            if rx.changed().await.is_ok() {
                return *rx.borrow_and_update()
            }
        }
        self.rx = None;
        pending().await
    }
}


//============ Tests =========================================================
