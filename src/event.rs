//! Event signalling between driver context and the state machine task.
//!
//! A driver callback posts by atomically storing the event word, then
//! releasing the notify. If two callbacks fire before the task observes
//! either, the second overwrites the first; channels whose events must not
//! coalesce use distinct cells.

use std::sync::atomic::{AtomicU8, Ordering};

use tokio::sync::Notify;

pub(crate) struct EventCell {
    word: AtomicU8,
    notify: Notify,
}

impl EventCell {
    pub(crate) fn new() -> Self {
        Self { word: AtomicU8::new(0), notify: Notify::new() }
    }

    /// Posts an event from driver context. Never blocks.
    pub(crate) fn post(&self, event: u8) {
        self.word.store(event, Ordering::Release);
        self.notify.notify_one();
    }

    /// Takes the pending event word, zero if none.
    pub(crate) fn take(&self) -> u8 {
        self.word.swap(0, Ordering::AcqRel)
    }

    /// Waits until an event is posted and takes it.
    pub(crate) async fn wait(&self) -> u8 {
        loop {
            let event = self.take();
            if event != 0 {
                return event;
            }
            self.notify.notified().await;
        }
    }
}
