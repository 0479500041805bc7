//! In-process observers of membership changes.

use std::sync::mpsc;

use crate::entry::Entry;

/// What happened to a server.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServerChangeKind {
    Added,
    Crashed,
    Removed,
}

/// One membership change, carrying a snapshot of the entry at event time.
#[derive(Clone, Debug)]
pub struct ServerChange {
    pub entry: Entry,
    pub kind: ServerChangeKind,
}

/// Observer notified of every add/crash/remove, in mutation order.
///
/// Both methods run with the registry lock held: a mutation first enqueues
/// its change on every tracker, then fires every tracker's callback.
/// Implementations must not call back into the registry.
pub trait Tracker: Send {
    /// Buffer a change. Called once per event, in order.
    fn enqueue_change(&mut self, entry: &Entry, kind: ServerChangeKind);

    /// Deliver everything buffered since the last call.
    fn fire_callback(&mut self);
}

/// Tracker that flushes buffered changes into an mpsc channel.
///
/// The consumer polls the receiver returned by [`ChannelTracker::new`];
/// delivery is best-effort once the receiver is gone.
pub struct ChannelTracker {
    pending: Vec<ServerChange>,
    tx: mpsc::Sender<ServerChange>,
}

impl ChannelTracker {
    pub fn new() -> (Self, mpsc::Receiver<ServerChange>) {
        let (tx, rx) = mpsc::channel();
        (
            Self {
                pending: Vec::new(),
                tx,
            },
            rx,
        )
    }
}

impl Tracker for ChannelTracker {
    fn enqueue_change(&mut self, entry: &Entry, kind: ServerChangeKind) {
        self.pending.push(ServerChange {
            entry: entry.clone(),
            kind,
        });
    }

    fn fire_callback(&mut self) {
        for change in self.pending.drain(..) {
            let _ = self.tx.send(change);
        }
    }
}
