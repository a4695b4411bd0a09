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

//! HyStart: hybrid slow start exit detection.
//!
//! Two detectors run on RTT samples while the connection is in slow start.
//! The ACK train detector measures how long a train of closely spaced ACKs
//! lasts within a round, and exits once the train spans more than half of the
//! minimum delay. The delay detector exits once the minimum RTT of the
//! current round rises noticeably above the connection's minimum delay.
//!
//! See "Hybrid Slow Start for High-Bandwidth and Long-Distance Networks",
//! PFLDnet 2008.

use enumflags2::bitflags;
use enumflags2::BitFlags;
use log::*;

use crate::connection::TransportHost;

/// Number of delay samples in a round before the delay detector applies.
const MIN_SAMPLES: u32 = 8;

/// Lower bound of the delay increase threshold in microseconds.
const DELAY_MIN_THRESH: u32 = 4000;

/// Upper bound of the delay increase threshold in microseconds.
const DELAY_MAX_THRESH: u32 = 16000;

/// Upper bound of the ACK delay cushion in microseconds.
const ACK_DELAY_CUSHION_MAX: u64 = 1000;

/// Slow start exit detectors.
#[bitflags]
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Detect {
    /// Exit when a train of closely spaced ACKs grows too long.
    AckTrain = 0x1,

    /// Exit when the round's minimum delay increases.
    Delay = 0x2,
}

/// HyStart configuration.
#[derive(Debug, Clone)]
pub struct HystartConfig {
    /// Whether slow start exit detection is enabled.
    pub enabled: bool,

    /// Enabled detectors.
    pub detect: BitFlags<Detect>,

    /// Detection only runs once the window reaches this many segments.
    pub low_window: u32,

    /// Maximum spacing of two ACKs in a train, in microseconds.
    pub ack_delta_us: u32,
}

impl Default for HystartConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            detect: Detect::AckTrain | Detect::Delay,
            low_window: 16,
            ack_delta_us: 2000,
        }
    }
}

/// Per-connection HyStart state.
#[derive(Debug, Clone)]
pub struct Hystart {
    config: HystartConfig,

    /// Start of the current round in microseconds.
    round_start: u32,

    /// The round ends once this sequence number is acknowledged.
    end_seq: u32,

    /// Time of the last ACK in the current train, in microseconds.
    last_ack: u32,

    /// Minimum delay of the current round in microseconds.
    curr_rtt: u32,

    /// Delay samples taken in the current round.
    sample_cnt: u32,

    /// Whether slow start exit was detected.
    found: bool,
}

impl Hystart {
    pub fn new(config: HystartConfig) -> Self {
        Self {
            config,
            round_start: 0,
            end_seq: 0,
            last_ack: 0,
            curr_rtt: u32::MAX,
            sample_cnt: 0,
            found: false,
        }
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn low_window(&self) -> u32 {
        self.config.low_window
    }

    pub fn found(&self) -> bool {
        self.found
    }

    /// Start a new round ending once `snd_nxt` is acknowledged.
    pub fn reset(&mut self, snd_nxt: u32, now_us: u32) {
        self.round_start = now_us;
        self.last_ack = now_us;
        self.end_seq = snd_nxt;
        self.curr_rtt = u32::MAX;
        self.sample_cnt = 0;
    }

    /// Forget a previous exit decision and restart the round.
    pub fn restart(&mut self, snd_nxt: u32, now_us: u32) {
        self.found = false;
        self.reset(snd_nxt, now_us);
    }

    /// Run the enabled detectors on one delay sample.
    ///
    /// On exit, `ssthresh` is set to the current window. Return true if this
    /// sample ended slow start.
    pub fn update(
        &mut self,
        host: &mut dyn TransportHost,
        delay: u32,
        delay_min: u32,
        now_us: u32,
    ) -> bool {
        if self.found {
            return false;
        }

        if seq_after(host.snd_una(), self.end_seq) {
            self.reset(host.snd_nxt(), now_us);
        }

        if self.config.detect.contains(Detect::AckTrain)
            && (now_us.wrapping_sub(self.last_ack) as i32) <= self.config.ack_delta_us as i32
        {
            self.last_ack = now_us;

            let mut threshold = delay_min.saturating_add(ack_delay_cushion(host));
            // Without pacing, ACK trains are compressed.
            if !host.is_paced() {
                threshold >>= 1;
            }

            if (now_us.wrapping_sub(self.round_start) as i32) > threshold as i32 {
                trace!(
                    "hystart: ack train exit, train {}us threshold {}us",
                    now_us.wrapping_sub(self.round_start),
                    threshold
                );
                return self.exit(host);
            }
        }

        if self.config.detect.contains(Detect::Delay) {
            self.curr_rtt = self.curr_rtt.min(delay);

            if self.sample_cnt < MIN_SAMPLES {
                self.sample_cnt += 1;
            } else if self.curr_rtt > delay_min.saturating_add(delay_thresh(delay_min)) {
                trace!(
                    "hystart: delay exit, round rtt {}us delay_min {}us",
                    self.curr_rtt,
                    delay_min
                );
                return self.exit(host);
            }
        }

        false
    }

    fn exit(&mut self, host: &mut dyn TransportHost) -> bool {
        self.found = true;
        host.set_ssthresh(host.window());
        true
    }
}

/// Delay increase threshold, 1/8 of the minimum delay bounded to 4..16ms.
fn delay_thresh(delay_min: u32) -> u32 {
    (delay_min >> 3).clamp(DELAY_MIN_THRESH, DELAY_MAX_THRESH)
}

/// Cushion for ACKs delayed by segmentation offload, in microseconds.
fn ack_delay_cushion(host: &dyn TransportHost) -> u32 {
    let rate = host.pacing_rate();
    if rate == 0 {
        return 0;
    }

    let cushion = host.gso_max_size() as u64 * 4 * 1_000_000 / rate;
    cushion.min(ACK_DELAY_CUSHION_MAX) as u32
}

/// Whether sequence number `a` is after `b`, modulo 2^32.
pub(crate) fn seq_after(a: u32, b: u32) -> bool {
    (b.wrapping_sub(a) as i32) < 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::HostRecord;

    fn host() -> HostRecord {
        let mut host = HostRecord::new(20);
        host.send(20);
        host
    }

    fn hystart(detect: BitFlags<Detect>) -> Hystart {
        Hystart::new(HystartConfig {
            detect,
            ..HystartConfig::default()
        })
    }

    #[test]
    fn hystart_delay_stable_rtt() {
        let mut host = host();
        let mut hs = hystart(Detect::Delay.into());
        hs.reset(host.snd_nxt(), 0);

        for i in 0..20 {
            assert!(!hs.update(&mut host, 40_000, 40_000, i * 5000));
        }
        assert!(!hs.found());
        assert_eq!(host.ssthresh, u32::MAX);
    }

    #[test]
    fn hystart_delay_increase() {
        let mut host = host();
        let mut hs = hystart(Detect::Delay.into());
        hs.reset(host.snd_nxt(), 0);
        assert!(!hs.update(&mut host, 40_000, 40_000, 0));

        // A new round begins once the round's last segment is acknowledged.
        host.send(20);
        host.acknowledge(21);

        for i in 1..=8 {
            assert!(!hs.update(&mut host, 60_000, 40_000, i * 5000));
        }
        assert!(!hs.found());

        assert!(hs.update(&mut host, 60_000, 40_000, 45_000));
        assert!(hs.found());
        assert_eq!(host.ssthresh, 20);

        // Latched until restarted.
        assert!(!hs.update(&mut host, 90_000, 40_000, 50_000));
        hs.restart(host.snd_nxt(), 55_000);
        assert!(!hs.found());
    }

    #[test]
    fn hystart_ack_train() {
        let mut host = host();
        let mut hs = hystart(Detect::AckTrain.into());
        hs.reset(host.snd_nxt(), 0);

        // Threshold is half of delay_min without pacing.
        for t in (1000..=20_000).step_by(1000) {
            assert!(!hs.update(&mut host, 40_000, 40_000, t));
        }
        assert!(hs.update(&mut host, 40_000, 40_000, 21_000));
        assert_eq!(host.ssthresh, 20);
    }

    #[test]
    fn hystart_ack_train_broken() {
        let mut host = host();
        let mut hs = hystart(Detect::AckTrain.into());
        hs.reset(host.snd_nxt(), 0);

        // ACKs spaced more than ack_delta apart never form a train.
        for i in 1..50 {
            assert!(!hs.update(&mut host, 40_000, 40_000, i * 3000));
        }
        assert!(!hs.found());
    }

    #[test]
    fn hystart_ack_train_paced() {
        let mut host = host();
        host.paced = true;
        host.pacing_rate = 12_500_000;
        // 65536 * 4s / 12.5MB/s is above the 1ms cap.
        assert_eq!(ack_delay_cushion(&host), 1000);

        let mut hs = hystart(Detect::AckTrain.into());
        hs.reset(host.snd_nxt(), 0);
        for t in (1000..=41_000).step_by(1000) {
            assert!(!hs.update(&mut host, 40_000, 40_000, t));
        }
        assert!(hs.update(&mut host, 40_000, 40_000, 42_000));
    }

    #[test]
    fn hystart_delay_threshold() {
        assert_eq!(delay_thresh(0), 4000);
        assert_eq!(delay_thresh(40_000), 5000);
        assert_eq!(delay_thresh(1_000_000), 16000);
    }

    #[test]
    fn seq_after_wraps() {
        assert!(seq_after(1, 0));
        assert!(!seq_after(0, 0));
        assert!(!seq_after(0, 1));
        assert!(seq_after(5, u32::MAX - 5));
    }
}
