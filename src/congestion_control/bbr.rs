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

//! BBR Congestion Control.
//!
//! BBR uses recent measurements of a connection's delivery rate and
//! round-trip time to build an explicit model that includes both the maximum
//! recent bandwidth available to that connection, and its minimum recent
//! round-trip delay. BBR then uses this model to control the maximum amount
//! of data it allows in flight in the network at any time.
//!
//! This variant counts in segments and samples the delivery rate once per
//! packet-timed round trip, since the engine sees ACK events rather than
//! individual packets.
//!
//! See <https://datatracker.ietf.org/doc/html/draft-cardwell-iccrg-bbr-congestion-control-00>.

use log::*;
use rand::Rng;

use super::hystart::seq_after;
use super::minmax::MinMax;
use super::CongestionController;
use super::CongestionStats;
use crate::connection::TransportHost;
use crate::time_sync::Stamp;
use crate::CongestionConfig;

/// BBR configurable parameters.
#[derive(Debug, Clone)]
pub struct BbrConfig {
    /// Minimal congestion window in segments.
    min_cwnd: u32,

    /// Initial congestion window in segments.
    initial_cwnd: u32,
}

impl BbrConfig {
    pub fn new(min_cwnd: u32, initial_cwnd: u32) -> Self {
        let min_cwnd = min_cwnd.max(1);
        Self {
            min_cwnd,
            initial_cwnd: initial_cwnd.max(min_cwnd),
        }
    }

    pub fn from(conf: &CongestionConfig) -> Self {
        Self::new(conf.min_congestion_window, conf.initial_congestion_window)
    }
}

impl Default for BbrConfig {
    fn default() -> Self {
        Self::new(MIN_PIPE_CWND, 10)
    }
}

/// Bandwidth is measured in segments per microsecond, scaled by 2^24.
const BW_SCALE: u32 = 24;
const BW_UNIT: u64 = 1 << BW_SCALE;

/// BBRMinPipeCwnd: the minimal window that allows pipelining, 4 segments.
const MIN_PIPE_CWND: u32 = 4;

/// BtlBwFilterLen: the length of the bandwidth max filter, in packet-timed
/// round trips.
const BTLBW_FILTER_LEN: u32 = 10;

/// The length of the min RTT filter window, in ticks (10 secs).
const MIN_RTT_FILTER_LEN: u32 = 10_000;

/// BBRHighGain: the minimum gain value that will allow the sending rate to
/// double each round (`2/ln(2)` ~= `2.89`), used in Startup mode for both
/// pacing_gain and cwnd_gain.
const HIGH_GAIN: f64 = 2.89;

/// Bandwidth growth rate before pipe got filled.
const BTLBW_GROWTH_RATE: f64 = 0.25;

/// Max count of full bandwidth reached, before pipe is supposed to be filled.
const FULL_BW_COUNT_THRESHOLD: u32 = 3;

/// BBRGainCycleLen: the number of phases in the ProbeBW gain cycle.
const GAIN_CYCLE_LEN: usize = 8;

/// Pacing Gain Cycles. Each phase normally lasts for roughly min RTT.
const PACING_GAIN_CYCLE: [f64; GAIN_CYCLE_LEN] = [1.25, 0.75, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0];

/// ProbeRTTDuration: the minimum duration for which ProbeRTT holds inflight
/// to the minimal window, in ticks (200 ms).
const PROBE_RTT_DURATION: u32 = 200;

/// Segments allowed in flight on top of the estimated BDP to absorb
/// offload bursts.
const QUANTA: u32 = 3;

/// BBR State Machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BbrStateMachine {
    Startup,
    Drain,
    ProbeBW,
    ProbeRTT,
}

/// Packet-timed round trip counter.
///
/// A round starts when an ACK covers the segment that was the next to be
/// sent at the start of the previous round.
#[derive(Debug, Default)]
struct RoundTripCounter {
    /// Count of packet-timed round trips.
    round_count: u32,

    /// Whether the current ACK started a new round.
    is_round_start: bool,

    /// Sequence number ending the current round.
    end_seq: u32,

    /// Start of the current round in microseconds.
    start_us: u32,

    /// Segments delivered in the current round.
    delivered: u32,
}

/// Full pipe estimator, used mainly during Startup mode.
#[derive(Debug, Default)]
struct FullPipeEstimator {
    /// Whether BBR estimates that it has ever fully utilized its available
    /// bandwidth ("filled the pipe").
    is_filled_pipe: bool,

    /// Baseline level delivery rate for full pipe estimator.
    full_bw: u32,

    /// The number of round for full pipe estimator without much growth.
    full_bw_count: u32,
}

/// BBR Congestion Control Algorithm.
#[derive(Debug)]
pub struct Bbr {
    /// Configurable parameters.
    config: BbrConfig,

    /// Statistics.
    stats: CongestionStats,

    /// State.
    state: BbrStateMachine,

    /// Max filter of per-round delivery rate samples.
    btlbw: MinMax,

    /// Min RTT in microseconds, `u32::MAX` if unknown.
    min_rtt_us: u32,

    /// Tick at which min RTT was last refreshed.
    min_rtt_stamp: u32,

    /// Whether min RTT was not refreshed for a whole filter window.
    is_min_rtt_expired: bool,

    /// The gain currently applied to the pacing rate.
    pacing_gain: f64,

    /// The gain currently applied to the congestion window.
    cwnd_gain: f64,

    /// Round trip counter.
    round: RoundTripCounter,

    /// Full pipe estimator.
    full_pipe: FullPipeEstimator,

    /// Total segments delivered.
    delivered: u64,

    /// Tick at which ProbeRTT may end, once inflight reached the minimal
    /// window.
    probe_rtt_done_stamp: Option<u32>,

    /// Whether a round passed since ProbeRTT held the minimal window.
    probe_rtt_round_done: bool,

    /// Last-known good window, restored when leaving ProbeRTT.
    prior_cwnd: u32,

    /// Whether transmission restarted from idle.
    is_idle_restart: bool,

    /// Start of the current gain cycle phase in microseconds.
    cycle_stamp: u32,

    /// Current gain cycle phase.
    cycle_index: usize,
}

impl Bbr {
    pub fn new(config: BbrConfig) -> Self {
        Self {
            config,
            stats: Default::default(),
            state: BbrStateMachine::Startup,
            btlbw: MinMax::max(BTLBW_FILTER_LEN),
            min_rtt_us: u32::MAX,
            min_rtt_stamp: 0,
            is_min_rtt_expired: false,
            pacing_gain: HIGH_GAIN,
            cwnd_gain: HIGH_GAIN,
            round: Default::default(),
            full_pipe: Default::default(),
            delivered: 0,
            probe_rtt_done_stamp: None,
            probe_rtt_round_done: false,
            prior_cwnd: 0,
            is_idle_restart: false,
            cycle_stamp: 0,
            cycle_index: 0,
        }
    }

    pub fn state(&self) -> BbrStateMachine {
        self.state
    }

    /// Is pipe filled.
    pub fn is_filled_pipe(&self) -> bool {
        self.full_pipe.is_filled_pipe
    }

    /// Is round start.
    pub fn is_round_start(&self) -> bool {
        self.round.is_round_start
    }

    /// Bottleneck bandwidth estimate, in segments per second.
    pub fn bandwidth(&self) -> u64 {
        self.btlbw.get() as u64 * 1_000_000 / BW_UNIT
    }

    /// Min RTT estimate in microseconds, if any.
    pub fn min_rtt(&self) -> Option<u32> {
        (self.min_rtt_us != u32::MAX).then_some(self.min_rtt_us)
    }

    /// Enter the Startup state.
    fn enter_startup(&mut self) {
        self.state = BbrStateMachine::Startup;
        self.pacing_gain = HIGH_GAIN;
        self.cwnd_gain = HIGH_GAIN;
    }

    /// Advance the round counter, and take one delivery rate sample per
    /// round.
    fn update_round(&mut self, host: &dyn TransportHost, now: Stamp) {
        if !seq_after(host.snd_una(), self.round.end_seq) {
            self.round.is_round_start = false;
            return;
        }

        let interval = now.micros.wrapping_sub(self.round.start_us) as u64;
        if self.round.round_count > 0 && interval > 0 {
            let bw = (self.round.delivered as u64 * BW_UNIT / interval).min(u32::MAX as u64);
            self.btlbw.update(self.round.round_count, bw as u32);
        }

        self.round.round_count = self.round.round_count.wrapping_add(1);
        self.round.is_round_start = true;
        self.round.end_seq = host.snd_nxt();
        self.round.start_us = now.micros;
        self.round.delivered = 0;
    }

    /// Estimate whether the pipe is full by looking for a plateau in the
    /// bandwidth estimate.
    fn check_full_pipe(&mut self) {
        if self.is_filled_pipe() || !self.is_round_start() {
            return;
        }

        // Bandwidth still growing?
        let bw = self.btlbw.get();
        if bw as f64 >= self.full_pipe.full_bw as f64 * (1.0 + BTLBW_GROWTH_RATE) {
            self.full_pipe.full_bw = bw;
            self.full_pipe.full_bw_count = 0;
            return;
        }

        // Another round without much growth.
        self.full_pipe.full_bw_count += 1;
        if self.full_pipe.full_bw_count >= FULL_BW_COUNT_THRESHOLD {
            self.full_pipe.is_filled_pipe = true;
            debug!(
                "bbr: pipe filled at {} segments/s after {} rounds",
                self.bandwidth(),
                self.round.round_count
            );
        }
    }

    /// Estimated bandwidth-delay product scaled by `gain`, in segments.
    fn bdp(&self, gain: f64) -> u32 {
        if self.min_rtt_us == u32::MAX {
            // No valid RTT samples yet.
            return self.config.initial_cwnd;
        }

        let w = self.btlbw.get() as u64 * self.min_rtt_us as u64;
        (w as f64 * gain / BW_UNIT as f64).ceil() as u32
    }

    /// Upper bound on the segments in flight.
    fn inflight(&self, gain: f64) -> u32 {
        self.bdp(gain).saturating_add(QUANTA)
    }

    /// Leave Startup once the pipe is full, and Drain once the queue created
    /// in Startup is gone.
    fn check_drain(&mut self, host: &dyn TransportHost, now: Stamp) {
        if self.state == BbrStateMachine::Startup && self.is_filled_pipe() {
            self.state = BbrStateMachine::Drain;
            // Drain the queue in one round and maintain cwnd.
            self.pacing_gain = 1.0 / HIGH_GAIN;
            self.cwnd_gain = HIGH_GAIN;
        }

        if self.state == BbrStateMachine::Drain && host.in_flight_segments() <= self.inflight(1.0)
        {
            self.enter_probe_bw(now);
        }
    }

    /// Enter the ProbeBW state.
    fn enter_probe_bw(&mut self, now: Stamp) {
        self.state = BbrStateMachine::ProbeBW;
        self.pacing_gain = 1.0;
        self.cwnd_gain = 2.0;

        // Randomly pick an initial phase, from among all but the 3/4 phase.
        self.cycle_index = GAIN_CYCLE_LEN - 1 - rand::thread_rng().gen_range(0..GAIN_CYCLE_LEN - 1);
        self.advance_cycle_phase(now);
    }

    fn check_cycle_phase(&mut self, host: &dyn TransportHost, now: Stamp) {
        if self.state == BbrStateMachine::ProbeBW && self.is_next_cycle_phase(host, now) {
            self.advance_cycle_phase(now);
        }
    }

    fn advance_cycle_phase(&mut self, now: Stamp) {
        self.cycle_stamp = now.micros;
        self.cycle_index = (self.cycle_index + 1) % GAIN_CYCLE_LEN;
        self.pacing_gain = PACING_GAIN_CYCLE[self.cycle_index];
    }

    fn is_next_cycle_phase(&self, host: &dyn TransportHost, now: Stamp) -> bool {
        // Each cycle phase normally lasts for roughly min RTT.
        let is_full_length = now.micros.wrapping_sub(self.cycle_stamp) > self.min_rtt_us;
        let inflight = host.in_flight_segments();

        if self.pacing_gain > 1.0 {
            // Probe until inflight reaches 5/4 of the BDP.
            return is_full_length && inflight >= self.inflight(self.pacing_gain);
        }
        if self.pacing_gain < 1.0 {
            // Drain until inflight falls to the BDP.
            return is_full_length || inflight <= self.inflight(1.0);
        }
        is_full_length
    }

    /// Refresh the min RTT estimate.
    fn update_min_rtt(&mut self, rtt_us: u32, now: Stamp) {
        self.is_min_rtt_expired =
            now.ticks.wrapping_sub(self.min_rtt_stamp) as i32 > MIN_RTT_FILTER_LEN as i32;

        // Equal samples do not refresh the stamp, so a path with a constant
        // RTT still probes every filter window.
        if rtt_us < self.min_rtt_us || self.is_min_rtt_expired {
            self.min_rtt_us = rtt_us;
            self.min_rtt_stamp = now.ticks;
        }
    }

    /// Remember the last-known good window.
    fn save_cwnd(&mut self, host: &dyn TransportHost) {
        self.prior_cwnd = if self.state != BbrStateMachine::ProbeRTT {
            host.window()
        } else {
            host.window().max(self.prior_cwnd)
        };
    }

    fn check_probe_rtt(&mut self, host: &mut dyn TransportHost, now: Stamp) {
        if self.state != BbrStateMachine::ProbeRTT
            && self.is_min_rtt_expired
            && !self.is_idle_restart
        {
            self.save_cwnd(host);
            self.state = BbrStateMachine::ProbeRTT;
            self.pacing_gain = 1.0;
            self.cwnd_gain = 1.0;
            self.probe_rtt_done_stamp = None;
            debug!("bbr: enter ProbeRTT, min rtt {}us", self.min_rtt_us);
        }

        if self.state == BbrStateMachine::ProbeRTT {
            self.handle_probe_rtt(host, now);
        }

        self.is_idle_restart = false;
    }

    fn handle_probe_rtt(&mut self, host: &mut dyn TransportHost, now: Stamp) {
        match self.probe_rtt_done_stamp {
            Some(done) => {
                if self.is_round_start() {
                    self.probe_rtt_round_done = true;
                }

                // Held the minimal window for ProbeRTTDuration and one round.
                if self.probe_rtt_round_done && !seq_after(done, now.ticks) {
                    self.min_rtt_stamp = now.ticks;
                    self.is_min_rtt_expired = false;
                    host.set_window(host.window().max(self.prior_cwnd));
                    if self.is_filled_pipe() {
                        self.enter_probe_bw(now);
                    } else {
                        self.enter_startup();
                    }
                    debug!("bbr: exit ProbeRTT to {:?}", self.state);
                }
            }
            None if host.in_flight_segments() <= self.config.min_cwnd => {
                self.probe_rtt_done_stamp = Some(now.ticks.wrapping_add(PROBE_RTT_DURATION));
                self.probe_rtt_round_done = false;
                self.round.end_seq = host.snd_nxt();
            }
            None => (),
        }
    }

    fn set_pacing_rate_with_gain(&mut self, host: &mut dyn TransportHost, gain: f64) {
        let bw = if self.btlbw.get() > 0 {
            self.btlbw.get() as f64 * 1_000_000.0 / BW_UNIT as f64
        } else {
            // No bandwidth sample yet: initial window over min RTT, or 1ms.
            let rtt = self.min_rtt().unwrap_or(1000).max(1) as f64;
            host.window() as f64 * 1_000_000.0 / rtt
        };
        let rate = (gain * bw * host.max_segment_size() as f64) as u64;

        // Grow the pacing rate freely, and shrink it only once the pipe is
        // full.
        if self.is_filled_pipe() || rate > host.pacing_rate() {
            host.set_pacing_rate(rate);
        }
    }

    /// Adjust the congestion window.
    fn set_cwnd(&mut self, host: &mut dyn TransportHost, acked: u32) {
        let target = self.inflight(self.cwnd_gain);
        let mut cwnd = host.window();

        if self.is_filled_pipe() {
            cwnd = cwnd.saturating_add(acked).min(target);
        } else if cwnd < target || self.delivered < self.config.initial_cwnd as u64 {
            cwnd = cwnd.saturating_add(acked);
        }
        cwnd = cwnd.max(self.config.min_cwnd).min(host.window_clamp());

        if self.state == BbrStateMachine::ProbeRTT {
            cwnd = cwnd.min(self.config.min_cwnd);
        }

        host.set_window(cwnd);
    }
}

impl CongestionController for Bbr {
    fn name(&self) -> &str {
        "BBR"
    }

    fn init(&mut self, host: &mut dyn TransportHost, now: Stamp) {
        *self = Bbr::new(self.config.clone());

        self.min_rtt_stamp = now.ticks;
        self.round.end_seq = host.snd_nxt();
        self.round.start_us = now.micros;
        self.cycle_stamp = now.micros;

        host.set_ssthresh(u32::MAX);
        host.set_window(host.window().max(self.config.initial_cwnd));
        self.set_pacing_rate_with_gain(host, HIGH_GAIN);
    }

    fn on_rtt_sample(&mut self, host: &mut dyn TransportHost, rtt_us: Option<u32>, now: Stamp) {
        if let Some(rtt) = rtt_us {
            self.update_min_rtt(rtt.max(1), now);
        }
    }

    fn on_ack(&mut self, host: &mut dyn TransportHost, acked: u32, now: Stamp) {
        self.stats.segments_acked_in_total =
            self.stats.segments_acked_in_total.saturating_add(acked as u64);
        if self.state == BbrStateMachine::Startup {
            self.stats.segments_acked_in_slow_start = self
                .stats
                .segments_acked_in_slow_start
                .saturating_add(acked as u64);
        }

        self.delivered = self.delivered.saturating_add(acked as u64);
        self.round.delivered = self.round.delivered.saturating_add(acked);

        // Update model and state.
        self.update_round(host, now);
        self.check_cycle_phase(host, now);
        self.check_full_pipe();
        self.check_drain(host, now);
        self.check_probe_rtt(host, now);

        // Update control parameters.
        self.set_pacing_rate_with_gain(host, self.pacing_gain);
        self.set_cwnd(host, acked);

        trace!(
            "bbr: {:?} cwnd {} bw {} segments/s min_rtt {}us",
            self.state,
            host.window(),
            self.bandwidth(),
            self.min_rtt_us
        );
    }

    fn on_congestion_event(&mut self, host: &dyn TransportHost, now: Stamp) -> u32 {
        self.stats.congestion_events += 1;
        self.save_cwnd(host);

        // The model, not the loss, bounds the window.
        host.ssthresh()
    }

    fn on_loss_state(&mut self, host: &dyn TransportHost, now: Stamp) {
        // Treat a retransmission timeout like the end of a round.
        self.full_pipe.full_bw = 0;
        self.round.is_round_start = true;
        self.save_cwnd(host);
    }

    fn on_tx_start(&mut self, host: &mut dyn TransportHost, last_send: u32, now: Stamp) {
        if host.in_flight_segments() == 0 {
            self.is_idle_restart = true;
            if self.state == BbrStateMachine::ProbeBW {
                self.set_pacing_rate_with_gain(host, 1.0);
            }
        }
    }

    fn undo_window(&mut self, host: &dyn TransportHost) -> u32 {
        self.full_pipe.full_bw = 0;
        self.full_pipe.full_bw_count = 0;
        host.window()
    }

    fn stats(&self) -> &CongestionStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::HostRecord;

    /// Bottleneck capacity in segments per round trip.
    const CAPACITY: u32 = 100;

    /// Round trip time in microseconds.
    const RTT: u32 = 50_000;

    /// Send a window worth of segments, capped by the bottleneck, and
    /// acknowledge them evenly over one round trip.
    fn run_round(bbr: &mut Bbr, host: &mut HostRecord, now: &mut Stamp) {
        let n = host.cwnd.min(CAPACITY).max(1);
        host.send(n);

        let step = RTT / n;
        for _ in 0..n {
            now.micros = now.micros.wrapping_add(step);
            now.ticks = now.micros / 1000;
            host.acknowledge(1);
            bbr.on_rtt_sample(host, Some(RTT), *now);
            bbr.on_ack(host, 1, *now);
        }

        // Keep the clock on the round boundary.
        now.micros = now.micros.wrapping_add(RTT - step * n);
        now.ticks = now.micros / 1000;
    }

    #[test]
    fn bbr_init() {
        let mut bbr = Bbr::new(BbrConfig::default());
        let mut host = HostRecord::new(2);
        host.ssthresh = 20;
        bbr.init(&mut host, Stamp::new(1000, 1_000_000));

        assert_eq!(bbr.name(), "BBR");
        assert_eq!(bbr.state(), BbrStateMachine::Startup);
        assert_eq!(host.cwnd, 10);
        assert_eq!(host.ssthresh, u32::MAX);
        assert!(host.pacing_rate > 0);
        assert_eq!(bbr.min_rtt(), None);
    }

    #[test]
    fn bbr_startup_to_probe_bw() {
        let mut bbr = Bbr::new(BbrConfig::default());
        let mut host = HostRecord::new(10);
        let mut now = Stamp::new(1000, 1_000_000);
        bbr.init(&mut host, now);

        run_round(&mut bbr, &mut host, &mut now);
        let startup_cwnd = host.cwnd;
        run_round(&mut bbr, &mut host, &mut now);
        assert!(host.cwnd > startup_cwnd);
        assert_eq!(bbr.state(), BbrStateMachine::Startup);

        for _ in 0..20 {
            run_round(&mut bbr, &mut host, &mut now);
        }
        assert!(bbr.is_filled_pipe());
        assert_eq!(bbr.state(), BbrStateMachine::ProbeBW);
        assert_eq!(bbr.min_rtt(), Some(RTT));

        // The model converges on the bottleneck: 100 segments per 50ms.
        assert!((1990..=2000).contains(&bbr.bandwidth()));
        assert!(host.cwnd >= CAPACITY && host.cwnd <= 2 * CAPACITY + QUANTA);
        assert!(bbr.stats().segments_acked_in_slow_start > 0);
    }

    #[test]
    fn bbr_probe_rtt() {
        let mut bbr = Bbr::new(BbrConfig::default());
        let mut host = HostRecord::new(10);
        let mut now = Stamp::new(1000, 1_000_000);
        bbr.init(&mut host, now);

        for _ in 0..20 {
            run_round(&mut bbr, &mut host, &mut now);
        }
        assert_eq!(bbr.state(), BbrStateMachine::ProbeBW);
        let cwnd = host.cwnd;

        // Min RTT expires after 10 seconds without a lower sample.
        now.micros = now.micros.wrapping_add(MIN_RTT_FILTER_LEN * 1000);
        now.ticks = now.micros / 1000;
        run_round(&mut bbr, &mut host, &mut now);
        assert_eq!(bbr.state(), BbrStateMachine::ProbeRTT);
        assert_eq!(host.cwnd, MIN_PIPE_CWND);

        // Hold the minimal window for 200ms and one round.
        for _ in 0..6 {
            run_round(&mut bbr, &mut host, &mut now);
        }
        assert_eq!(bbr.state(), BbrStateMachine::ProbeBW);
        assert!(host.cwnd >= cwnd);
    }

    #[test]
    fn bbr_congestion_event() {
        let mut bbr = Bbr::new(BbrConfig::default());
        let mut host = HostRecord::new(10);
        let now = Stamp::new(1000, 1_000_000);
        bbr.init(&mut host, now);

        host.cwnd = 40;
        assert_eq!(bbr.on_congestion_event(&host, now), u32::MAX);
        assert_eq!(bbr.prior_cwnd, 40);
        assert_eq!(bbr.stats().congestion_events, 1);

        bbr.full_pipe.full_bw = 100;
        bbr.full_pipe.full_bw_count = 2;
        assert_eq!(bbr.undo_window(&host), 40);
        assert_eq!(bbr.full_pipe.full_bw, 0);
        assert_eq!(bbr.full_pipe.full_bw_count, 0);
    }

    #[test]
    fn bbr_idle_restart() {
        let mut bbr = Bbr::new(BbrConfig::default());
        let mut host = HostRecord::new(10);
        let now = Stamp::new(1000, 1_000_000);
        bbr.init(&mut host, now);

        bbr.on_tx_start(&mut host, 900, now);
        assert!(bbr.is_idle_restart);

        host.send(1);
        bbr.is_idle_restart = false;
        bbr.on_tx_start(&mut host, 900, now);
        assert!(!bbr.is_idle_restart);
    }
}
