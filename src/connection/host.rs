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

//! The host transport stack's per-connection record, as seen by the engine.

use std::time::Duration;

/// Interfaces the engine needs from the host transport connection.
///
/// Windows are counted in segments. The host window is authoritative: the
/// engine never assumes its own view of suspension is correct without
/// comparing it to `window()`.
pub trait TransportHost: Send {
    /// Current congestion window.
    fn window(&self) -> u32;

    /// Update the congestion window.
    fn set_window(&mut self, cwnd: u32);

    /// Slow start threshold.
    fn ssthresh(&self) -> u32;

    /// Update the slow start threshold.
    fn set_ssthresh(&mut self, ssthresh: u32);

    /// Whether the connection is in slow start.
    fn in_slow_start(&self) -> bool {
        self.window() < self.ssthresh()
    }

    /// Whether the sender is limited by the congestion window rather than by
    /// the application.
    fn is_window_limited(&self) -> bool;

    /// Segments currently in flight.
    fn in_flight_segments(&self) -> u32;

    /// Upper bound of the congestion window.
    fn window_clamp(&self) -> u32 {
        u32::MAX
    }

    /// Window before the last reduction, used to undo spurious reductions.
    fn prior_window(&self) -> u32 {
        self.window()
    }

    /// Oldest unacknowledged sequence number.
    fn snd_una(&self) -> u32;

    /// Next sequence number to be sent.
    fn snd_nxt(&self) -> u32;

    /// Whether a writer is blocked waiting for send buffer space.
    fn is_write_blocked(&self) -> bool {
        false
    }

    /// Wake writers blocked on buffer space.
    fn notify_write_space(&mut self) {}

    /// Whether a retransmission deadline is currently armed.
    fn has_retransmit_deadline(&self) -> bool {
        false
    }

    /// Push the armed retransmission deadline back. Best effort.
    fn extend_retransmit_deadline(&mut self, by: Duration) {
        let _ = by;
    }

    /// Pacing rate in bytes per second, 0 if unknown.
    fn pacing_rate(&self) -> u64 {
        0
    }

    /// Update the pacing rate in bytes per second.
    fn set_pacing_rate(&mut self, rate: u64) {
        let _ = rate;
    }

    /// Whether the connection paces its transmissions.
    fn is_paced(&self) -> bool {
        false
    }

    /// Largest segmentation offload size in bytes.
    fn gso_max_size(&self) -> u32 {
        65536
    }

    /// Segment size in bytes.
    fn max_segment_size(&self) -> u32 {
        1460
    }

    /// Whether the connection is established.
    fn is_established(&self) -> bool {
        true
    }
}

/// Acknowledgment event passed to the engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Ack {
    /// Newly acknowledged segments.
    pub acked: u32,

    /// RTT sample in microseconds, `None` if the ACK carried no valid
    /// timestamp.
    pub rtt_us: Option<u32>,
}

impl Ack {
    pub fn new(acked: u32, rtt_us: Option<u32>) -> Self {
        Self { acked, rtt_us }
    }
}

/// A plain in-memory host record.
///
/// It keeps every field the engine reads or writes and nothing else. The
/// simulator, the benches and the tests drive the engine through it.
#[derive(Debug, Clone)]
pub struct HostRecord {
    pub cwnd: u32,
    pub ssthresh: u32,
    pub cwnd_clamp: u32,
    pub prior_cwnd: u32,
    pub in_flight: u32,
    pub snd_una: u32,
    pub snd_nxt: u32,
    pub write_blocked: bool,

    /// Number of `notify_write_space()` calls.
    pub write_space_notified: u32,

    /// Time left before the retransmission deadline, if armed.
    pub retransmit_deadline: Option<Duration>,

    pub pacing_rate: u64,
    pub paced: bool,
    pub gso_max_size: u32,
    pub mss: u32,
    pub established: bool,
}

impl HostRecord {
    pub fn new(initial_cwnd: u32) -> Self {
        Self {
            cwnd: initial_cwnd,
            ssthresh: u32::MAX,
            cwnd_clamp: u32::MAX,
            prior_cwnd: initial_cwnd,
            in_flight: 0,
            snd_una: 0,
            snd_nxt: 0,
            write_blocked: false,
            write_space_notified: 0,
            retransmit_deadline: None,
            pacing_rate: 0,
            paced: false,
            gso_max_size: 65536,
            mss: 1460,
            established: true,
        }
    }

    /// Send `segments` new segments.
    pub fn send(&mut self, segments: u32) {
        self.snd_nxt = self.snd_nxt.wrapping_add(segments);
        self.in_flight = self.in_flight.saturating_add(segments);
    }

    /// Acknowledge `segments` of the oldest outstanding segments.
    pub fn acknowledge(&mut self, segments: u32) {
        let segments = segments.min(self.in_flight);
        self.snd_una = self.snd_una.wrapping_add(segments);
        self.in_flight -= segments;
    }
}

impl Default for HostRecord {
    fn default() -> Self {
        Self::new(10)
    }
}

impl TransportHost for HostRecord {
    fn window(&self) -> u32 {
        self.cwnd
    }

    fn set_window(&mut self, cwnd: u32) {
        self.cwnd = cwnd;
    }

    fn ssthresh(&self) -> u32 {
        self.ssthresh
    }

    fn set_ssthresh(&mut self, ssthresh: u32) {
        self.ssthresh = ssthresh;
    }

    fn is_window_limited(&self) -> bool {
        // In slow start, allow growth while at least half the window is used.
        if self.in_slow_start() {
            return self.cwnd < self.in_flight.saturating_mul(2);
        }
        self.in_flight >= self.cwnd
    }

    fn in_flight_segments(&self) -> u32 {
        self.in_flight
    }

    fn window_clamp(&self) -> u32 {
        self.cwnd_clamp
    }

    fn prior_window(&self) -> u32 {
        self.prior_cwnd
    }

    fn snd_una(&self) -> u32 {
        self.snd_una
    }

    fn snd_nxt(&self) -> u32 {
        self.snd_nxt
    }

    fn is_write_blocked(&self) -> bool {
        self.write_blocked
    }

    fn notify_write_space(&mut self) {
        self.write_blocked = false;
        self.write_space_notified += 1;
    }

    fn has_retransmit_deadline(&self) -> bool {
        self.retransmit_deadline.is_some()
    }

    fn extend_retransmit_deadline(&mut self, by: Duration) {
        if let Some(deadline) = self.retransmit_deadline.as_mut() {
            *deadline += by;
        }
    }

    fn pacing_rate(&self) -> u64 {
        self.pacing_rate
    }

    fn set_pacing_rate(&mut self, rate: u64) {
        self.pacing_rate = rate;
    }

    fn is_paced(&self) -> bool {
        self.paced
    }

    fn gso_max_size(&self) -> u32 {
        self.gso_max_size
    }

    fn max_segment_size(&self) -> u32 {
        self.mss
    }

    fn is_established(&self) -> bool {
        self.established
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_record_window_limited() {
        let mut host = HostRecord::new(10);
        assert!(host.in_slow_start());
        assert!(!host.is_window_limited());

        host.send(6);
        assert!(host.is_window_limited());

        host.ssthresh = 10;
        assert!(!host.in_slow_start());
        assert!(!host.is_window_limited());

        host.send(4);
        assert!(host.is_window_limited());
        assert_eq!(host.in_flight_segments(), 10);
        assert_eq!(host.snd_nxt(), 10);

        host.acknowledge(3);
        assert_eq!(host.snd_una(), 3);
        assert_eq!(host.in_flight_segments(), 7);

        // Cannot acknowledge more than what is in flight.
        host.acknowledge(100);
        assert_eq!(host.snd_una(), 10);
        assert_eq!(host.in_flight_segments(), 0);
    }

    #[test]
    fn host_record_write_space_and_deadline() {
        let mut host = HostRecord::default();
        host.extend_retransmit_deadline(Duration::from_millis(400));
        assert!(!host.has_retransmit_deadline());

        host.retransmit_deadline = Some(Duration::from_millis(200));
        host.extend_retransmit_deadline(Duration::from_millis(400));
        assert_eq!(host.retransmit_deadline, Some(Duration::from_millis(600)));

        host.write_blocked = true;
        host.notify_write_space();
        assert!(!host.is_write_blocked());
        assert_eq!(host.write_space_notified, 1);
    }
}
