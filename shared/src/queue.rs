//! Handoff queue between socket tasks and the tick loop
//!
//! Producers push from any task or thread without ever blocking; the single
//! consumer drains a bounded number of items per tick so one chatty peer can
//! not starve the rest of the frame. Items left over stay queued in order.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TryRecvError};

/// Creates a connected producer/consumer pair
pub fn handoff_queue<T>() -> (HandoffSender<T>, HandoffQueue<T>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let len = Arc::new(AtomicUsize::new(0));
    (
        HandoffSender {
            tx,
            len: Arc::clone(&len),
        },
        HandoffQueue { rx, len },
    )
}

/// Producer side; cheap to clone and safe to use from any thread
#[derive(Debug)]
pub struct HandoffSender<T> {
    tx: mpsc::UnboundedSender<T>,
    len: Arc<AtomicUsize>,
}

impl<T> Clone for HandoffSender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            len: Arc::clone(&self.len),
        }
    }
}

impl<T> HandoffSender<T> {
    /// Enqueues `item`. Returns false if the consumer has been dropped.
    pub fn push(&self, item: T) -> bool {
        // Count first so the consumer never sees an item it has not been told about.
        self.len.fetch_add(1, Ordering::AcqRel);
        if self.tx.send(item).is_err() {
            self.len.fetch_sub(1, Ordering::AcqRel);
            return false;
        }
        true
    }
}

/// Consumer side, owned by the tick loop
#[derive(Debug)]
pub struct HandoffQueue<T> {
    rx: mpsc::UnboundedReceiver<T>,
    len: Arc<AtomicUsize>,
}

impl<T> HandoffQueue<T> {
    /// Removes the oldest item, if any
    pub fn pop(&mut self) -> Option<T> {
        match self.rx.try_recv() {
            Ok(item) => {
                self.len.fetch_sub(1, Ordering::AcqRel);
                Some(item)
            }
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Hands at most `max` items to `f` in FIFO order and returns how many were processed
    pub fn drain<F>(&mut self, max: usize, mut f: F) -> usize
    where
        F: FnMut(T),
    {
        let mut processed = 0;
        while processed < max {
            match self.pop() {
                Some(item) => {
                    f(item);
                    processed += 1;
                }
                None => break,
            }
        }
        processed
    }

    /// Items pushed but not yet consumed
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
