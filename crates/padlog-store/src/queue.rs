//! Per-channel FIFO serialization.
//!
//! A [`SerialQueue`] hands out tickets synchronously, so a caller's position
//! is fixed at the moment it enqueues, not when it first gets polled. Each
//! ticket waits for its predecessor to release before its turn begins.

use std::sync::{Mutex, MutexGuard};

use tokio::sync::oneshot;

pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Default)]
pub struct SerialQueue {
    tail: Mutex<Option<oneshot::Receiver<()>>>,
}

impl SerialQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the next position in the queue.
    pub fn enqueue(&self) -> Ticket {
        let (release, done) = oneshot::channel();
        let prev = lock(&self.tail).replace(done);
        Ticket {
            prev,
            release: Some(release),
        }
    }
}

/// A position in a [`SerialQueue`].
#[derive(Debug)]
pub struct Ticket {
    prev: Option<oneshot::Receiver<()>>,
    release: Option<oneshot::Sender<()>>,
}

impl Ticket {
    /// Wait until every earlier ticket has released.
    pub async fn wait(mut self) -> Turn {
        if let Some(prev) = self.prev.as_mut() {
            // Err means the predecessor dropped its turn, which is a release.
            let _ = prev.await;
        }
        self.prev = None;
        Turn {
            _release: self.release.take(),
        }
    }
}

impl Drop for Ticket {
    fn drop(&mut self) {
        // Abandoned before its turn: successors must still wait for our
        // predecessor, so hand the release off to a task.
        if let (Some(prev), Some(release)) = (self.prev.take(), self.release.take()) {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    let _ = prev.await;
                    drop(release);
                });
            }
        }
    }
}

/// Exclusive turn in a [`SerialQueue`]; released on drop.
#[derive(Debug)]
pub struct Turn {
    _release: Option<oneshot::Sender<()>>,
}
