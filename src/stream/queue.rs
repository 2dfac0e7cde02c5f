// Copyright 2026 Daniel Pelikan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Outbound frame queue with a latest-wins policy.
//!
//! The queue holds at most one pending frame. Pushing while a frame is
//! still pending replaces it and reports the old one as superseded. Only the
//! newest frame is guaranteed to be sent; do not turn this into a FIFO.
//!
//! Stopping is a separate flag rather than an empty frame in the slot, so a
//! frame pushed after `stop()` can never overwrite the stop request.

use parking_lot::Mutex;
use tokio::sync::Notify;

/// Result of [`FrameQueue::push`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Push {
    /// The slot was empty.
    Queued,
    /// An older pending frame was replaced.
    Superseded,
    /// The queue is stopped; the frame was dropped.
    Rejected,
}

/// Item handed to the sender loop.
#[derive(Debug, PartialEq, Eq)]
pub enum Outbound {
    Frame(Vec<u8>),
    Stop,
}

#[derive(Debug, Default)]
struct Slot {
    pending: Option<Vec<u8>>,
    stopped: bool,
}

/// Single-slot queue shared by producers and the sender loop.
#[derive(Debug, Default)]
pub struct FrameQueue {
    slot: Mutex<Slot>,
    notify: Notify,
}

impl FrameQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a frame without blocking.
    pub fn push(&self, frame: Vec<u8>) -> Push {
        let outcome = {
            let mut slot = self.slot.lock();
            if slot.stopped {
                return Push::Rejected;
            }
            match slot.pending.replace(frame) {
                Some(_) => Push::Superseded,
                None => Push::Queued,
            }
        };
        self.notify.notify_one();
        outcome
    }

    /// Discard any pending frame and ask the consumer to stop.
    pub fn stop(&self) {
        {
            let mut slot = self.slot.lock();
            slot.stopped = true;
            slot.pending = None;
        }
        self.notify.notify_one();
    }

    /// Wait for the next item. Returns [`Outbound::Stop`] once stopped.
    pub async fn pop(&self) -> Outbound {
        loop {
            if let Some(item) = self.try_pop() {
                return item;
            }
            self.notify.notified().await;
        }
    }

    fn try_pop(&self) -> Option<Outbound> {
        let mut slot = self.slot.lock();
        if slot.stopped {
            return Some(Outbound::Stop);
        }
        slot.pending.take().map(Outbound::Frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_latest_frame_wins() {
        let queue = FrameQueue::new();
        assert_eq!(queue.push(b"a".to_vec()), Push::Queued);
        assert_eq!(queue.push(b"b".to_vec()), Push::Superseded);
        assert_eq!(queue.push(b"c".to_vec()), Push::Superseded);

        assert_eq!(queue.pop().await, Outbound::Frame(b"c".to_vec()));
    }

    #[tokio::test]
    async fn test_stop_discards_pending() {
        let queue = FrameQueue::new();
        queue.push(b"a".to_vec());
        queue.stop();

        assert_eq!(queue.pop().await, Outbound::Stop);
        assert_eq!(queue.push(b"b".to_vec()), Push::Rejected);
        assert_eq!(queue.pop().await, Outbound::Stop);
    }

    #[tokio::test]
    async fn test_pop_waits_for_push() {
        let queue = Arc::new(FrameQueue::new());
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.push(vec![1, 2, 3]);

        let item = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(item, Outbound::Frame(vec![1, 2, 3]));
    }

    #[tokio::test]
    async fn test_stop_wakes_waiting_consumer() {
        let queue = Arc::new(FrameQueue::new());
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.stop();

        let item = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(item, Outbound::Stop);
    }
}
