// DDP for Rust
// SPDX-License-Identifier: MPL-2.0
// Copyright (C) 2017-2024 Adam Lock

//! The outbound frame queue.

use std::collections::VecDeque;

use tokio::sync::Notify;

use crate::messages::ClientMessage;
use crate::sync::Mutex;

/// Single-consumer FIFO of outbound frames.
///
/// The consumer is a closure deciding, per frame, whether the head can
/// advance: it returns `true` after handing the frame to a live transport,
/// and `false` while disconnected. Frames are therefore never lost across
/// a disconnect; the queue simply stops draining until the session is
/// connected again and calls [`OutboundQueue::process`] once more.
#[derive(Default)]
pub struct OutboundQueue {
    inner: Mutex<VecDeque<ClientMessage>>,
    notify: Notify,
}

impl OutboundQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a frame and wake the consumer.
    pub fn push(&self, message: ClientMessage) {
        self.inner.lock().push_back(message);
        self.notify.notify_one();
    }

    /// Splice `messages` in at the head, preserving their order, and wake
    /// the consumer. Used for in-flight replay on reconnect.
    pub fn prepend(&self, messages: Vec<ClientMessage>) {
        {
            let mut inner = self.inner.lock();
            for message in messages.into_iter().rev() {
                inner.push_front(message);
            }
        }
        self.notify.notify_one();
    }

    /// Pop frames through `consumer` for as long as it returns `true`.
    /// Returns the number of frames consumed.
    pub fn process(&self, mut consumer: impl FnMut(&ClientMessage) -> bool) -> usize {
        let mut consumed = 0;
        loop {
            let mut inner = self.inner.lock();
            let Some(head) = inner.front() else {
                return consumed;
            };
            if consumer(head) {
                inner.pop_front();
                consumed += 1;
            } else {
                return consumed;
            }
        }
    }

    /// Wait until a producer pushes. Cancellation safe.
    pub async fn wait(&self) {
        self.notify.notified().await;
    }

    /// Drop every queued frame.
    pub fn clear(&self) {
        self.inner.lock().clear();
    }

    /// Number of frames waiting.
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}
