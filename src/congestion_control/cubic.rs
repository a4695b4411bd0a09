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

use log::*;

use super::cong_avoid_ai;
use super::hystart::seq_after;
use super::slow_start;
use super::CongestionController;
use super::CongestionStats;
use super::Hystart;
use super::HystartConfig;
use crate::connection::TransportHost;
use crate::time_sync::Stamp;
use crate::CongestionConfig;
use crate::HZ;

/// Fixed-point scale of beta.
const BETA_SCALE: u32 = 1024;

/// Time scale of the cubic function, in powers of two per second.
const BICTCP_HZ: u32 = 10;

/// Default multiplicative decrease factor, 717/1024 ~= 0.7.
const BETA: u32 = 717;

/// Default scale of the cubic function, 41/1024 ~= 0.04.
const BIC_SCALE: u32 = 41;

/// Upper bound of `cnt` while no loss has been seen.
const MAX_CNT_BEFORE_LOSS: u32 = 20;

/// Lower bound of `cnt` after any update.
const MIN_CNT: u32 = 2;

/// Cubic Configuration.
///
/// Besides the tunables, it holds the constants derived from them, computed
/// once when the configuration is built.
#[derive(Debug, Clone)]
pub struct CubicConfig {
    /// Release window faster when a loss follows a shorter epoch.
    fast_convergence: bool,

    /// Multiplicative decrease factor, scaled by 1024.
    beta: u32,

    /// Initial slow start threshold in segments, 0 means unset.
    initial_ssthresh: u32,

    /// Scale of the cubic function, scaled by 1024.
    bic_scale: u32,

    /// Follow the Reno window when it grows faster.
    tcp_friendliness: bool,

    /// Slow start exit detection.
    hystart: HystartConfig,

    /// 8 * (1024 + beta) / 3 / (1024 - beta).
    beta_scale: u32,

    /// bic_scale * 10.
    cube_rtt_scale: u32,

    /// 2^40 / (bic_scale * 10).
    cube_factor: u64,
}

impl CubicConfig {
    pub fn new(
        fast_convergence: bool,
        beta: u32,
        initial_ssthresh: u32,
        bic_scale: u32,
        tcp_friendliness: bool,
        hystart: HystartConfig,
    ) -> Self {
        let beta = beta.clamp(1, BETA_SCALE - 1);
        let bic_scale = bic_scale.max(1);

        // Only the cubic_root(cube_factor * (last_max_cwnd - cwnd)) matters,
        // which is K in units of 1/1024 seconds.
        let cube_rtt_scale = bic_scale * 10;
        let cube_factor = (1_u64 << (10 + 3 * BICTCP_HZ)) / cube_rtt_scale as u64;
        let beta_scale = 8 * (BETA_SCALE + beta) / 3 / (BETA_SCALE - beta);

        Self {
            fast_convergence,
            beta,
            initial_ssthresh,
            bic_scale,
            tcp_friendliness,
            hystart,
            beta_scale,
            cube_rtt_scale,
            cube_factor,
        }
    }

    pub fn from(conf: &CongestionConfig) -> Self {
        Self::new(
            conf.fast_convergence,
            conf.beta,
            conf.initial_ssthresh,
            conf.bic_scale,
            conf.tcp_friendliness,
            conf.hystart_config(),
        )
    }

    pub fn beta(&self) -> u32 {
        self.beta
    }

    pub fn bic_scale(&self) -> u32 {
        self.bic_scale
    }
}

impl Default for CubicConfig {
    fn default() -> Self {
        Self::new(true, BETA, 0, BIC_SCALE, true, HystartConfig::default())
    }
}

/// Per-connection CUBIC state.
#[derive(Debug, Clone, Default)]
pub struct CubicState {
    /// Increase the window by 1 after this many ACKed segments.
    pub cnt: u32,

    /// Window at the last congestion event.
    pub last_max_cwnd: u32,

    /// Window at the last update.
    pub last_cwnd: u32,

    /// Tick of the last update.
    pub last_time: u32,

    /// Origin point of the cubic function.
    pub bic_origin_point: u32,

    /// Time to reach the origin point from the start of the epoch, in units
    /// of 1/1024 seconds.
    pub bic_k: u32,

    /// Minimum delay in microseconds, 0 until the first sample.
    pub delay_min: u32,

    /// Tick at which the epoch started, 0 if no epoch is open.
    pub epoch_start: u32,

    /// Segments ACKed in the epoch, for the Reno window estimate.
    pub ack_cnt: u32,

    /// Estimated Reno window.
    pub tcp_cwnd: u32,

    /// Additive increase accumulator.
    pub cwnd_cnt: u32,
}

/// CUBIC congestion control, the fixed-point variant run by Linux TCP.
///
/// See <https://www.rfc-editor.org/rfc/rfc9438.html>.
#[derive(Debug)]
pub struct Cubic {
    /// Configuration.
    config: CubicConfig,

    /// Growth state.
    state: CubicState,

    /// Slow start exit detection.
    hystart: Hystart,

    /// Congestion statistics.
    stats: CongestionStats,
}

impl Cubic {
    pub fn new(config: CubicConfig) -> Self {
        let hystart = Hystart::new(config.hystart.clone());
        Self {
            config,
            state: CubicState::default(),
            hystart,
            stats: Default::default(),
        }
    }

    pub fn state(&self) -> &CubicState {
        &self.state
    }

    pub fn hystart(&self) -> &Hystart {
        &self.hystart
    }

    /// Recompute `cnt`, the number of ACKed segments after which the window
    /// grows by one segment.
    fn update(&mut self, cwnd: u32, acked: u32, now: u32) {
        let ca = &mut self.state;
        ca.ack_cnt = ca.ack_cnt.wrapping_add(acked);

        if ca.last_cwnd == cwnd && (now.wrapping_sub(ca.last_time) as i32) <= (HZ / 32) as i32 {
            return;
        }

        // The cubic function is evaluated at most once per tick; a window
        // change within the same tick only refreshes the Reno estimate.
        if ca.epoch_start == 0 || now != ca.last_time {
            ca.last_cwnd = cwnd;
            ca.last_time = now;

            if ca.epoch_start == 0 {
                ca.epoch_start = now;
                ca.ack_cnt = acked;
                ca.tcp_cwnd = cwnd;

                if ca.last_max_cwnd <= cwnd {
                    ca.bic_k = 0;
                    ca.bic_origin_point = cwnd;
                } else {
                    // K = cubic_root((wmax - cwnd) * rtt / c)
                    ca.bic_k = cubic_root(
                        self.config
                            .cube_factor
                            .wrapping_mul((ca.last_max_cwnd - cwnd) as u64),
                    );
                    ca.bic_origin_point = ca.last_max_cwnd;
                }
            }

            // Time since the start of the epoch plus one minimum RTT, in units
            // of 1/1024 seconds.
            let elapsed = (now.wrapping_sub(ca.epoch_start) as i32).max(0) as u64;
            let t = ((elapsed + usecs_to_ticks(ca.delay_min)) << BICTCP_HZ) / HZ as u64;

            let bic_k = ca.bic_k as u64;
            let offs = if t < bic_k { bic_k - t } else { t - bic_k };

            // c/rtt * (t-K)^3
            let delta = (self.config.cube_rtt_scale as u64)
                .wrapping_mul(offs.wrapping_mul(offs).wrapping_mul(offs))
                >> (10 + 3 * BICTCP_HZ);
            let delta = delta.min(u32::MAX as u64) as u32;

            let bic_target = if t < bic_k {
                ca.bic_origin_point.saturating_sub(delta)
            } else {
                ca.bic_origin_point.saturating_add(delta)
            };

            ca.cnt = if bic_target > cwnd {
                cwnd / (bic_target - cwnd)
            } else {
                // Very small increment.
                cwnd.saturating_mul(100)
            };

            // Increase at most 5% per RTT before the first loss.
            if ca.last_max_cwnd == 0 && ca.cnt > MAX_CNT_BEFORE_LOSS {
                ca.cnt = MAX_CNT_BEFORE_LOSS;
            }
        }

        if self.config.tcp_friendliness {
            let delta = ((cwnd as u64 * self.config.beta_scale as u64) >> 3).max(1);
            let delta = delta.min(u32::MAX as u64) as u32;

            if ca.ack_cnt > delta {
                let steps = (ca.ack_cnt - 1) / delta;
                ca.ack_cnt -= steps * delta;
                ca.tcp_cwnd = ca.tcp_cwnd.saturating_add(steps);
            }

            if ca.tcp_cwnd > cwnd {
                let max_cnt = cwnd / (ca.tcp_cwnd - cwnd);
                if ca.cnt > max_cnt {
                    ca.cnt = max_cnt;
                }
            }
        }

        ca.cnt = ca.cnt.max(MIN_CNT);
    }

    /// Close the epoch and return the slow start threshold after a loss.
    fn recalc_ssthresh(&mut self, cwnd: u32) -> u32 {
        let ca = &mut self.state;
        let beta = self.config.beta as u64;

        ca.epoch_start = 0;

        // Wmax and fast convergence
        ca.last_max_cwnd = if cwnd < ca.last_max_cwnd && self.config.fast_convergence {
            (cwnd as u64 * (BETA_SCALE as u64 + beta) / (2 * BETA_SCALE as u64)) as u32
        } else {
            cwnd
        };

        ((cwnd as u64 * beta / BETA_SCALE as u64) as u32).max(2)
    }

    fn reset(&mut self) {
        self.state = CubicState::default();
    }
}

impl CongestionController for Cubic {
    fn name(&self) -> &str {
        "CUBIC"
    }

    fn init(&mut self, host: &mut dyn TransportHost, now: Stamp) {
        self.reset();

        if self.hystart.enabled() {
            self.hystart.restart(host.snd_nxt(), now.micros);
        }

        if !self.hystart.enabled() && self.config.initial_ssthresh != 0 {
            host.set_ssthresh(self.config.initial_ssthresh);
        }
    }

    fn on_rtt_sample(&mut self, host: &mut dyn TransportHost, rtt_us: Option<u32>, now: Stamp) {
        let rtt = match rtt_us {
            Some(rtt) => rtt,
            None => return,
        };

        // Discard delay samples right after a loss.
        if self.state.epoch_start != 0
            && (now.ticks.wrapping_sub(self.state.epoch_start) as i32) < HZ as i32
        {
            return;
        }

        let delay = rtt.max(1);

        // First time call or link delay decreases.
        if self.state.delay_min == 0 || self.state.delay_min > delay {
            self.state.delay_min = delay;
        }

        if self.hystart.enabled()
            && !self.hystart.found()
            && host.in_slow_start()
            && host.window() >= self.hystart.low_window()
            && self
                .hystart
                .update(host, delay, self.state.delay_min, now.micros)
        {
            self.stats.slow_start_exits += 1;
            debug!(
                "cubic: slow start exit at cwnd {} delay_min {}us",
                host.window(),
                self.state.delay_min
            );
        }
    }

    fn on_ack(&mut self, host: &mut dyn TransportHost, acked: u32, now: Stamp) {
        self.stats.segments_acked_in_total =
            self.stats.segments_acked_in_total.saturating_add(acked as u64);

        if !host.is_window_limited() {
            return;
        }

        let mut acked = acked;
        if host.in_slow_start() {
            self.stats.segments_acked_in_slow_start = self
                .stats
                .segments_acked_in_slow_start
                .saturating_add(acked as u64);

            acked = slow_start(host, acked);
            if acked == 0 {
                return;
            }
        }

        self.update(host.window(), acked, now.ticks);
        cong_avoid_ai(host, &mut self.state.cwnd_cnt, self.state.cnt, acked);

        trace!(
            "cubic: cwnd {} cnt {} tcp_cwnd {} target origin {} K {}",
            host.window(),
            self.state.cnt,
            self.state.tcp_cwnd,
            self.state.bic_origin_point,
            self.state.bic_k
        );
    }

    fn on_congestion_event(&mut self, host: &dyn TransportHost, now: Stamp) -> u32 {
        self.stats.congestion_events += 1;
        let ssthresh = self.recalc_ssthresh(host.window());

        debug!(
            "cubic: congestion event at cwnd {}, last_max_cwnd {} ssthresh {}",
            host.window(),
            self.state.last_max_cwnd,
            ssthresh
        );
        ssthresh
    }

    fn on_loss_state(&mut self, host: &dyn TransportHost, now: Stamp) {
        self.reset();
        self.hystart.restart(host.snd_nxt(), now.micros);
    }

    fn on_tx_start(&mut self, host: &mut dyn TransportHost, last_send: u32, now: Stamp) {
        // Follow the cubic curve after an idle period: shift the epoch by
        // the idle time, but never into the future.
        let delta = now.ticks.wrapping_sub(last_send) as i32;
        if self.state.epoch_start != 0 && delta > 0 {
            self.state.epoch_start = self.state.epoch_start.wrapping_add(delta as u32);
            if seq_after(self.state.epoch_start, now.ticks) {
                self.state.epoch_start = now.ticks;
            }
        }
    }

    fn stats(&self) -> &CongestionStats {
        &self.stats
    }
}

/// Convert microseconds to ticks, rounding up.
fn usecs_to_ticks(us: u32) -> u64 {
    let us_per_tick = 1_000_000 / HZ as u64;
    (us as u64 + us_per_tick - 1) / us_per_tick
}

/// Integer cube root.
///
/// A table lookup gives the first approximation, followed by one
/// Newton-Raphson iteration. The error is within 0.2% for large inputs.
pub fn cubic_root(a: u64) -> u32 {
    // cbrt(x) MSB values for x MSB values in [0..63].
    // Precomputed then refined by hand.
    static V: [u8; 64] = [
        0, 54, 54, 54, 118, 118, 118, 118, 123, 129, 134, 138, 143, 147, 151, 156, 157, 161, 164,
        168, 170, 173, 176, 179, 181, 185, 187, 190, 192, 194, 197, 199, 200, 202, 204, 206, 209,
        211, 213, 215, 217, 219, 221, 222, 224, 225, 227, 229, 231, 232, 234, 236, 237, 239, 240,
        242, 244, 245, 246, 248, 250, 251, 252, 254,
    ];

    let b = 64 - a.leading_zeros();
    if b < 7 {
        // a in [0..63]
        return (V[a as usize] as u32 + 35) >> 6;
    }

    // b = ceil(b / 3) - 1
    let b = ((b * 84) >> 8) - 1;
    let shift = (a >> (b * 3)) as usize;

    let mut x = ((V[shift] as u32 + 10) << b) >> 6;

    // Newton-Raphson iteration
    //                         2
    // x    = ( 2 * x  +  a / x  ) / 3
    //  k+1          k         k
    let x64 = x as u64;
    x = 2 * x + (a / (x64 * (x64 - 1))) as u32;
    (x * 341) >> 10
}
