//! Per-mirror rendezvous between a job that produced a file set and the
//! jobs that depend on it.
//!
//! Each in-flight job registers a channel before dispatch. The producing
//! job replays its file set and broadcasts the id to every other
//! subscriber; an observing job waits until it sees exactly the id its
//! response named. Replay failure is global for the session: `flush`
//! closes every channel and waiting jobs fail with "files were never
//! sent".

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use termite_attr::FileSetId;
use tokio::sync::mpsc;
use tracing::trace;

use crate::error::MasterError;

const CHANNEL_CAPACITY: usize = 8;

/// One job's registration with the waiter.
pub struct Subscription {
    id: u64,
    rx: mpsc::Receiver<FileSetId>,
}

impl Subscription {
    /// Token identifying this subscriber, used to skip the producer on
    /// broadcast.
    #[must_use]
    pub const fn token(&self) -> u64 {
        self.id
    }
}

/// The per-mirror rendezvous object.
pub struct FileSetWaiter {
    channels: Mutex<HashMap<u64, mpsc::Sender<FileSetId>>>,
    next_token: AtomicU64,
}

impl Default for FileSetWaiter {
    fn default() -> Self {
        Self::new()
    }
}

impl FileSetWaiter {
    #[must_use]
    pub fn new() -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            next_token: AtomicU64::new(1),
        }
    }

    /// Registers a channel for one in-flight job. Must happen before the
    /// job is dispatched so no broadcast can be missed.
    #[must_use]
    pub fn register(&self) -> Subscription {
        let id = self.next_token.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        self.channels
            .lock()
            .expect("waiter lock poisoned")
            .insert(id, tx);
        Subscription { id, rx }
    }

    /// Removes a subscriber; called on job exit, producing or not.
    pub fn unregister(&self, sub: &Subscription) {
        self.channels
            .lock()
            .expect("waiter lock poisoned")
            .remove(&sub.id);
    }

    /// Delivers `id` to every subscriber registered at this moment except
    /// the producer. Subscribers registered later observe nothing for this
    /// id.
    pub async fn broadcast(&self, id: FileSetId, producer: u64) {
        let targets: Vec<mpsc::Sender<FileSetId>> = {
            let channels = self.channels.lock().expect("waiter lock poisoned");
            channels
                .iter()
                .filter(|(token, _)| **token != producer)
                .map(|(_, tx)| tx.clone())
                .collect()
        };
        trace!(id, subscribers = targets.len(), "file set broadcast");
        for tx in targets {
            // A send only fails if the subscriber already unregistered.
            let _ = tx.send(id).await;
        }
    }

    /// Closes every registered channel. Waiting jobs fail with
    /// "files were never sent".
    pub fn flush(&self) {
        self.channels.lock().expect("waiter lock poisoned").clear();
    }

    /// Blocks an observing job until its file set id arrives or the waiter
    /// is flushed.
    pub async fn wait_for(
        &self,
        id: FileSetId,
        sub: &mut Subscription,
    ) -> Result<(), MasterError> {
        loop {
            match sub.rx.recv().await {
                Some(got) if got == id => return Ok(()),
                Some(_) => continue,
                None => return Err(MasterError::FilesNeverSent),
            }
        }
    }

    /// Number of registered subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.channels.lock().expect("waiter lock poisoned").len()
    }
}
