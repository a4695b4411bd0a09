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

use std::collections::VecDeque;
use std::fs::File;

use log::trace;
use rand::Rng;
use statrs::statistics::Data;
use statrs::statistics::Distribution;
use statrs::statistics::Max;
use statrs::statistics::Min;
use statrs::statistics::OrderStatistics;

pub type Result<T> = std::result::Result<T, Box<dyn std::error::Error>>;

/// Return the log target, `stderr` if no file is specified.
pub fn log_target(log_file: &Option<String>) -> Result<env_logger::Target> {
    Ok(match log_file {
        Some(path) => env_logger::Target::Pipe(Box::new(File::create(path)?)),
        None => env_logger::Target::Stderr,
    })
}

/// A segment travelling over the simulated link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    /// Index of the sending flow.
    pub flow: usize,

    /// Send time in microseconds.
    pub sent_at: u64,

    /// Time the ACK, or the loss notification, reaches the sender.
    pub ack_at: u64,

    /// Whether the link dropped the segment.
    pub lost: bool,
}

/// A bottleneck link with a drop-tail buffer, random loss and outages.
pub struct Link {
    /// Serialization time of a segment in microseconds.
    service_us: u64,

    /// Round trip propagation delay in microseconds.
    base_rtt_us: u64,

    /// Buffer size in segments.
    buffer: usize,

    /// Random loss probability.
    loss: f64,

    /// The link is busy until this time.
    busy_until: u64,

    /// Segments in departure order.
    queue: VecDeque<Segment>,
}

impl Link {
    /// Create a link of `rate` segments per second.
    pub fn new(rate: u64, base_rtt_ms: u64, buffer: usize, loss: f64) -> Self {
        Self {
            service_us: 1_000_000 / rate.max(1),
            base_rtt_us: base_rtt_ms * 1000,
            buffer: buffer.max(1),
            loss: loss.clamp(0.0, 1.0),
            busy_until: 0,
            queue: VecDeque::new(),
        }
    }

    pub fn base_rtt_us(&self) -> u64 {
        self.base_rtt_us
    }

    /// Number of segments queued at the bottleneck at `now`.
    pub fn backlog(&self, now: u64) -> usize {
        (self.busy_until.saturating_sub(now) / self.service_us.max(1)) as usize
    }

    /// Send a segment at `now`. During an outage every segment is lost.
    pub fn send(&mut self, flow: usize, now: u64, outage: bool) {
        let dropped = outage
            || self.backlog(now) >= self.buffer
            || (self.loss > 0.0 && rand::thread_rng().gen_bool(self.loss));

        let ack_at = if dropped {
            // The sender notices after about one round trip.
            now + self.base_rtt_us + self.service_us
        } else {
            self.busy_until = self.busy_until.max(now) + self.service_us;
            self.busy_until + self.base_rtt_us
        };

        trace!("link: flow {} segment sent at {} ack at {} lost {}", flow, now, ack_at, dropped);
        let seg = Segment {
            flow,
            sent_at: now,
            ack_at,
            lost: dropped,
        };

        // Keep the queue sorted by ACK arrival.
        let pos = self.queue.partition_point(|s| s.ack_at <= ack_at);
        self.queue.insert(pos, seg);
    }

    /// Pop the next segment whose ACK arrived by `now`.
    pub fn poll(&mut self, now: u64) -> Option<Segment> {
        match self.queue.front() {
            Some(seg) if seg.ack_at <= now => self.queue.pop_front(),
            _ => None,
        }
    }
}

/// Print min, max, mean and percentiles of the samples.
pub fn print_summary(name: &str, samples: &[f64]) {
    if samples.is_empty() {
        println!("{}: no samples", name);
        return;
    }

    let mut s = Data::new(samples.to_vec());
    println!("{}:", name);
    println!(
        "\tmin: {:.2}, max: {:.2}, mean: {:.2}, sd: {:.2}",
        s.min(),
        s.max(),
        s.mean().unwrap_or_default(),
        s.std_dev().unwrap_or_default(),
    );
    println!(
        "\tmedian: {:.2}, p80: {:.2}, p90: {:.2}, p99: {:.2}",
        s.median(),
        s.percentile(80),
        s.percentile(90),
        s.percentile(99)
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn link_serializes_segments() {
        let mut link = Link::new(1000, 10, 2, 0.0);
        link.send(0, 0, false);
        link.send(0, 0, false);
        assert_eq!(link.backlog(0), 2);

        // Buffer full.
        link.send(0, 0, false);
        // Outage.
        link.send(1, 5000, true);

        let acks: Vec<Segment> = std::iter::from_fn(|| link.poll(20_000)).collect();
        assert_eq!(acks.len(), 4);
        assert_eq!(acks[0].ack_at, 11_000);
        assert_eq!(acks[1].ack_at, 11_000);
        assert!(acks[1].lost);
        assert_eq!(acks[2].ack_at, 12_000);
        assert!(!acks[2].lost);
        assert!(acks[3].lost);
        assert_eq!(acks[3].flow, 1);
        assert!(link.poll(u64::MAX).is_none());
    }
}
