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

#![allow(unused_variables)]

use core::str::FromStr;
use std::fmt;

use serde::Deserialize;

use crate::connection::TransportHost;
use crate::time_sync::Stamp;
use crate::CongestionConfig;
use crate::Error;
use crate::Result;
pub use bbr::Bbr;
pub use bbr::BbrConfig;
pub use bbr::BbrStateMachine;
pub use cubic::cubic_root;
pub use cubic::Cubic;
pub use cubic::CubicConfig;
pub use cubic::CubicState;
pub use hystart::Detect;
pub use hystart::Hystart;
pub use hystart::HystartConfig;

/// Available congestion control algorithm
#[derive(Eq, PartialEq, Debug, Clone, Copy, Default, Deserialize)]
#[serde(try_from = "String")]
pub enum CongestionControlAlgorithm {
    /// CUBIC uses a cubic function instead of a linear window increase
    /// function to improve scalability and stability under fast and
    /// long-distance networks. This is the fixed-point variant with HyStart
    /// slow start exit detection.
    #[default]
    Cubic,

    /// BBR uses recent measurements of a transport connection's delivery rate
    /// and round-trip time to build an explicit model of the network path.
    /// The model is then used to control the maximum volume of data allowed
    /// in flight in the network at any time.
    Bbr,
}

impl FromStr for CongestionControlAlgorithm {
    type Err = Error;

    fn from_str(algor: &str) -> Result<CongestionControlAlgorithm> {
        if algor.eq_ignore_ascii_case("cubic") {
            Ok(CongestionControlAlgorithm::Cubic)
        } else if algor.eq_ignore_ascii_case("bbr") {
            Ok(CongestionControlAlgorithm::Bbr)
        } else {
            Err(Error::InvalidConfig("unknown".into()))
        }
    }
}

impl TryFrom<String> for CongestionControlAlgorithm {
    type Error = Error;

    fn try_from(algor: String) -> Result<Self> {
        algor.parse()
    }
}

/// Congestion control statistics.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CongestionStats {
    /// Total segments acked.
    pub segments_acked_in_total: u64,

    /// Total segments acked in slow start.
    pub segments_acked_in_slow_start: u64,

    /// Number of congestion events.
    pub congestion_events: u64,

    /// Number of slow start exits detected before any loss.
    pub slow_start_exits: u64,
}

/// Congestion control interfaces shared by different algorithms.
///
/// The controller owns the algorithm state; the window itself lives in the
/// host record and is read and written through `TransportHost`.
pub trait CongestionController: Send {
    /// Name of congestion control algorithm.
    fn name(&self) -> &str;

    /// Reset the state for a new connection.
    fn init(&mut self, host: &mut dyn TransportHost, now: Stamp);

    /// Callback for each RTT sample carried by an acknowledgment. `None`
    /// means the ACK carried no valid sample.
    fn on_rtt_sample(&mut self, host: &mut dyn TransportHost, rtt_us: Option<u32>, now: Stamp) {}

    /// Callback for newly acknowledged segments. Grows the window.
    fn on_ack(&mut self, host: &mut dyn TransportHost, acked: u32, now: Stamp);

    /// Congestion event. Return the new slow start threshold.
    fn on_congestion_event(&mut self, host: &dyn TransportHost, now: Stamp) -> u32;

    /// Callback when the connection enters the Loss state after a
    /// retransmission timeout.
    fn on_loss_state(&mut self, host: &dyn TransportHost, now: Stamp) {}

    /// Callback when transmission restarts, `last_send` being the tick of
    /// the last transmission.
    fn on_tx_start(&mut self, host: &mut dyn TransportHost, last_send: u32, now: Stamp) {}

    /// Window to restore when a reduction turns out to be spurious.
    fn undo_window(&mut self, host: &dyn TransportHost) -> u32 {
        host.window().max(host.prior_window())
    }

    /// Congestion stats.
    fn stats(&self) -> &CongestionStats;
}

impl fmt::Debug for dyn CongestionController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "congestion controller {}", self.name())
    }
}

/// Build a congestion controller.
pub fn build_congestion_controller(conf: &CongestionConfig) -> Box<dyn CongestionController> {
    match conf.congestion_control_algorithm {
        CongestionControlAlgorithm::Cubic => Box::new(Cubic::new(CubicConfig::from(conf))),
        CongestionControlAlgorithm::Bbr => Box::new(Bbr::new(BbrConfig::from(conf))),
    }
}

/// Slow start: grow the window by the ACKed segments up to ssthresh.
///
/// Return the ACKed segments left over for congestion avoidance.
pub(crate) fn slow_start(host: &mut dyn TransportHost, acked: u32) -> u32 {
    let cwnd = host.window();
    let new_cwnd = cwnd.saturating_add(acked).min(host.ssthresh());
    let left = acked.saturating_sub(new_cwnd.saturating_sub(cwnd));

    host.set_window(new_cwnd.min(host.window_clamp()));
    left
}

/// Additive increase: grow the window by one segment every `w` ACKed
/// segments. `cwnd_cnt` carries the ACKed segments between calls.
pub(crate) fn cong_avoid_ai(host: &mut dyn TransportHost, cwnd_cnt: &mut u32, w: u32, acked: u32) {
    let w = w.max(1);
    let mut cwnd = host.window();

    // If credits accumulated at a higher w, apply them gently now.
    if *cwnd_cnt >= w {
        *cwnd_cnt = 0;
        cwnd = cwnd.saturating_add(1);
    }

    *cwnd_cnt = cwnd_cnt.saturating_add(acked);
    if *cwnd_cnt >= w {
        let delta = *cwnd_cnt / w;
        *cwnd_cnt -= delta * w;
        cwnd = cwnd.saturating_add(delta);
    }

    host.set_window(cwnd.min(host.window_clamp()));
}


mod bbr;
mod cubic;
mod hystart;
mod minmax;
