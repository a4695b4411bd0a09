// Copyright (c) 2023 The TQUIC Authors.
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

use priority_queue::double_priority_queue::DoublePriorityQueue;

type Index = u64;

/// Single-shot timers keyed by index, with deadlines on the monotonic
/// millisecond counter. Keep them sorted by which timer is going to expire
/// first.
pub struct TimerQueue {
    timers: DoublePriorityQueue<Index, u64>,
}

impl TimerQueue {
    /// Create a new TimerQueue.
    pub fn new() -> Self {
        Self {
            timers: DoublePriorityQueue::new(),
        }
    }

    /// Return the number of timers in the queue.
    pub fn len(&self) -> usize {
        self.timers.len()
    }

    /// Return if the timer queue is empty.
    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }

    /// Arm a timer at the absolute deadline `at`, replacing any existing
    /// timer with the same index.
    pub fn add(&mut self, idx: Index, at: u64) {
        _ = self.timers.push(idx, at);
    }

    /// Cancel a timer by id. Cancelling an unknown timer is a no-op.
    pub fn del(&mut self, idx: &Index) {
        _ = self.timers.remove(idx);
    }

    /// Return the deadline of the given timer.
    pub fn deadline(&self, idx: &Index) -> Option<u64> {
        self.timers.get_priority(idx).copied()
    }

    /// Return the amount of time remaining for the earliest expiring timer.
    pub fn time_remaining(&self, now: u64) -> Option<u64> {
        self.timers
            .peek_min()
            .map(|(_, expires_at)| expires_at.saturating_sub(now))
    }

    /// Return the next expired timer if any.
    pub fn next_expire(&mut self, now: u64) -> Option<Index> {
        match self.timers.peek_min() {
            Some((_, expires_at)) if *expires_at <= now => {
                self.timers.pop_min().map(|(idx, _)| idx)
            }
            _ => None,
        }
    }
}

impl Default for TimerQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add() {
        let mut tq = TimerQueue::new();
        assert!(tq.is_empty());

        let now = 1000;
        tq.add(0, now + 100);
        assert_eq!(tq.len(), 1);

        tq.add(1, now + 200);
        assert_eq!(tq.len(), 2);

        // Re-arming an existing timer replaces its deadline.
        tq.add(1, now + 300);
        assert_eq!(tq.len(), 2);
        assert_eq!(tq.deadline(&1), Some(now + 300));
    }

    #[test]
    fn del() {
        let mut tq = TimerQueue::default();

        tq.add(0, 100);
        assert_eq!(tq.len(), 1);

        // Delete a non-existing timer.
        tq.del(&1);
        assert_eq!(tq.len(), 1);

        // Delete twice.
        tq.del(&0);
        tq.del(&0);
        assert!(tq.is_empty());
        assert_eq!(tq.deadline(&0), None);
    }

    #[test]
    fn expired() {
        let mut tq = TimerQueue::default();

        let now = 5000;
        tq.add(0, now + 100);
        tq.add(1, now + 200);
        tq.add(2, now + 300);
        assert!(tq.next_expire(now).is_none());
        assert_eq!(tq.len(), 3);

        assert_eq!(tq.next_expire(now + 100), Some(0));
        assert_eq!(tq.len(), 2);

        tq.del(&2);
        tq.add(3, now + 1000);
        tq.add(4, now + 1000);
        tq.add(5, now + 1500);
        let t = now + 1000;
        assert_eq!(tq.next_expire(t), Some(1));
        let a = tq.next_expire(t);
        let b = tq.next_expire(t);
        assert!(matches!((a, b), (Some(3), Some(4)) | (Some(4), Some(3))));
        assert_eq!(tq.next_expire(t), None);
        assert_eq!(tq.len(), 1);
    }

    #[test]
    fn time_remaining() {
        let mut tq = TimerQueue::default();

        assert_eq!(tq.time_remaining(0), None);

        tq.add(0, 100);
        tq.add(1, 200);
        tq.add(2, 300);
        assert_eq!(tq.len(), 3);
        assert_eq!(tq.time_remaining(0), Some(100));
        assert_eq!(tq.time_remaining(150), Some(0));
    }
}
