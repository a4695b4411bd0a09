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

//! LEOCC is a congestion control engine for transports running over low
//! earth orbit satellite links.
//!
//! ## Features
//!
//! * **CUBIC**: fixed-point CUBIC window growth with TCP friendliness and
//!   HyStart slow start exit detection, deterministic and free of floating
//!   point.
//! * **Handover awareness**: satellite handovers happen at fixed instants of
//!   every wall-clock minute. The engine zeroes the sending window around
//!   each of them and restores it afterwards, keeping a flow clock aligned
//!   with wall-clock time.
//! * **Pluggable algorithms**: CUBIC and BBR share the same handover
//!   machinery through the [`CongestionController`] trait.
//!
//! ## Get started
//!
//! The host transport implements [`TransportHost`] for its connection
//! record, registers connections with an [`Engine`] and feeds it with
//! acknowledgments and timer events.
//!
//! ```
//! use leocc::connection::Ack;
//! use leocc::connection::HostRecord;
//! use leocc::Config;
//! use leocc::Engine;
//!
//! let engine = Engine::with_system_clock(Config::default());
//! let id = engine.register(HostRecord::new(10))?;
//! engine.on_ack(id, Ack::new(1, Some(40_000)))?;
//! if let Some(timeout) = engine.timeout() {
//!     // Call engine.on_timeout() once the timeout elapses.
//! }
//! let host = engine.unregister(id)?;
//! # Ok::<(), leocc::Error>(())
//! ```

#![allow(unused_imports)]
#![allow(dead_code)]

use std::cmp;
use std::path::Path;
use std::time::Duration;

use enumflags2::BitFlags;
use serde::Deserialize;

use crate::congestion_control::HystartConfig;
use crate::handover::HandoverSchedule;
use crate::handover::HANDOVER_OFFSET_DEFAULT;
use crate::handover::HANDOVER_OFFSET_MAX;
use crate::time_sync::DEFAULT_SYNC_PERIOD;

/// Scheduling ticks per second.
pub const HZ: u32 = 1000;

/// Shortest clock resync period.
const MIN_SYNC_PERIOD: Duration = Duration::from_secs(1);

/// Default number of connections with handover support.
const DEFAULT_MAX_HANDOVER_TIMERS: usize = 65536;

/// Result type for congestion engine operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Configurations about the congestion engine.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Congestion control configuration.
    congestion: CongestionConfig,

    /// Handover configuration.
    handover: HandoverConfig,

    /// Clock resync period in milliseconds.
    sync_period: u64,

    /// Maximum number of connections with handover support.
    max_handover_timers: usize,
}

impl Config {
    /// Create default configuration.
    ///
    /// The configuration may be customized by calling related set methods.
    ///
    /// ## Examples:
    ///
    /// ```
    /// let mut conf = leocc::Config::new();
    /// conf.set_handover_start_offset(300);
    /// conf.set_cubic_beta(820);
    /// ```
    pub fn new() -> Self {
        Self {
            congestion: CongestionConfig::default(),
            handover: HandoverConfig::default(),
            sync_period: DEFAULT_SYNC_PERIOD.as_millis() as u64,
            max_handover_timers: DEFAULT_MAX_HANDOVER_TIMERS,
        }
    }

    /// Load configuration from a JSON document. Missing fields keep their
    /// default values and out of range values are clamped.
    pub fn from_json(json: &str) -> Result<Self> {
        let conf: Config = serde_json::from_str(json)?;
        Ok(conf.sanitize())
    }

    /// Load configuration from a JSON file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    /// Apply the setters' bounds to values read from outside.
    fn sanitize(mut self) -> Self {
        self.set_cubic_beta(self.congestion.beta);
        self.set_cubic_scale(self.congestion.bic_scale);
        self.set_initial_congestion_window(self.congestion.initial_congestion_window);
        self.set_min_congestion_window(self.congestion.min_congestion_window);
        self.set_handover_start_offset(self.handover.start_offset_ms);
        self.set_handover_end_offset(self.handover.end_offset_ms);
        self.set_sync_period(self.sync_period);
        self
    }

    /// Set congestion control algorithm that the connection would use.
    /// The default value is Cubic.
    pub fn set_congestion_control_algorithm(&mut self, cca: CongestionControlAlgorithm) {
        self.congestion.congestion_control_algorithm = cca;
    }

    /// Enable CUBIC fast convergence. The default value is true.
    pub fn enable_fast_convergence(&mut self, v: bool) {
        self.congestion.fast_convergence = v;
    }

    /// Set the CUBIC multiplicative decrease factor, scaled by 1024.
    /// The value is clamped to [1, 1023] and the default value is 717.
    pub fn set_cubic_beta(&mut self, v: u32) {
        self.congestion.beta = v.clamp(1, 1023);
    }

    /// Set the initial slow start threshold in packets, applied when HyStart
    /// is disabled. Zero means unset, which is the default.
    pub fn set_initial_ssthresh(&mut self, packets: u32) {
        self.congestion.initial_ssthresh = packets;
    }

    /// Set the scale of the cubic function, scaled by 1024.
    /// The default value is 41.
    pub fn set_cubic_scale(&mut self, v: u32) {
        self.congestion.bic_scale = cmp::max(v, 1);
    }

    /// Enable TCP friendliness. The default value is true.
    pub fn enable_tcp_friendliness(&mut self, v: bool) {
        self.congestion.tcp_friendliness = v;
    }

    /// Enable HyStart slow start exit detection. The default value is true.
    pub fn enable_hystart(&mut self, v: bool) {
        self.congestion.hystart = v;
    }

    /// Set the enabled HyStart detectors. Both are enabled by default.
    pub fn set_hystart_detect(&mut self, detect: BitFlags<Detect>) {
        self.congestion.hystart_detect = detect.bits();
    }

    /// Set the window in packets from which HyStart detection runs.
    /// The default value is 16.
    pub fn set_hystart_low_window(&mut self, packets: u32) {
        self.congestion.hystart_low_window = packets;
    }

    /// Set the maximum spacing of two ACKs in a train in microseconds.
    /// The default value is 2000.
    pub fn set_hystart_ack_delta(&mut self, micros: u32) {
        self.congestion.hystart_ack_delta_us = micros;
    }

    /// Set the initial congestion window in packets.
    /// The default value is 10.
    pub fn set_initial_congestion_window(&mut self, packets: u32) {
        self.congestion.initial_congestion_window = cmp::max(packets, 1);
    }

    /// Set the minimal congestion window in packets.
    /// The default value is 4.
    pub fn set_min_congestion_window(&mut self, packets: u32) {
        self.congestion.min_congestion_window = cmp::max(packets, 1);
    }

    /// Enable handover-aware suspension. The default value is true.
    pub fn enable_handover(&mut self, v: bool) {
        self.handover.enabled = v;
    }

    /// Set how long before the nominal handover instant transmission is
    /// suspended, in milliseconds. The value is clamped to [0, 1000] and the
    /// default value is 200.
    pub fn set_handover_start_offset(&mut self, millis: u64) {
        self.handover.start_offset_ms = cmp::min(millis, HANDOVER_OFFSET_MAX);
    }

    /// Set how long after the nominal handover instant transmission is
    /// resumed, in milliseconds. The value is clamped to [0, 1000] and the
    /// default value is 200.
    pub fn set_handover_end_offset(&mut self, millis: u64) {
        self.handover.end_offset_ms = cmp::min(millis, HANDOVER_OFFSET_MAX);
    }

    /// Extend an armed retransmission deadline by the handover duration on
    /// suspension. The default value is true.
    pub fn enable_retransmit_deadline_extension(&mut self, v: bool) {
        self.handover.extend_retransmit_deadline = v;
    }

    /// Set the clock resync period in milliseconds, at least one second.
    /// The default value is one minute.
    pub fn set_sync_period(&mut self, millis: u64) {
        self.sync_period = cmp::max(Duration::from_millis(millis), MIN_SYNC_PERIOD).as_millis() as u64;
    }

    /// Set the maximum number of connections with handover support. Further
    /// connections run without it. The default value is 65536.
    pub fn set_max_handover_timers(&mut self, v: usize) {
        self.max_handover_timers = v;
    }

    pub fn congestion(&self) -> &CongestionConfig {
        &self.congestion
    }

    pub fn handover(&self) -> &HandoverConfig {
        &self.handover
    }

    /// The handover schedule built from the handover configuration.
    pub fn handover_schedule(&self) -> HandoverSchedule {
        HandoverSchedule::from(&self.handover)
    }

    pub fn sync_period(&self) -> Duration {
        Duration::from_millis(self.sync_period)
    }

    pub fn max_handover_timers(&self) -> usize {
        self.max_handover_timers
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

/// Configurations about congestion control.
#[doc(hidden)]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CongestionConfig {
    /// The congestion control algorithm used for a connection.
    pub congestion_control_algorithm: CongestionControlAlgorithm,

    /// CUBIC fast convergence.
    pub fast_convergence: bool,

    /// CUBIC multiplicative decrease factor, scaled by 1024.
    pub beta: u32,

    /// Initial slow start threshold in packets, 0 means unset.
    pub initial_ssthresh: u32,

    /// Scale of the cubic function, scaled by 1024.
    pub bic_scale: u32,

    /// Follow the Reno window when it grows faster.
    pub tcp_friendliness: bool,

    /// HyStart slow start exit detection.
    pub hystart: bool,

    /// Bits of the enabled HyStart detectors.
    pub hystart_detect: u8,

    /// HyStart runs once the window reaches this many packets.
    pub hystart_low_window: u32,

    /// Maximum spacing of two ACKs in a train, in microseconds.
    pub hystart_ack_delta_us: u32,

    /// The initial congestion window in packets.
    pub initial_congestion_window: u32,

    /// The minimal congestion window in packets.
    pub min_congestion_window: u32,
}

impl CongestionConfig {
    /// HyStart configuration. Unknown detector bits are ignored.
    pub fn hystart_config(&self) -> HystartConfig {
        HystartConfig {
            enabled: self.hystart,
            detect: BitFlags::from_bits_truncate(self.hystart_detect),
            low_window: self.hystart_low_window,
            ack_delta_us: self.hystart_ack_delta_us,
        }
    }
}

impl Default for CongestionConfig {
    fn default() -> CongestionConfig {
        let hystart = HystartConfig::default();
        CongestionConfig {
            congestion_control_algorithm: CongestionControlAlgorithm::Cubic,
            fast_convergence: true,
            beta: 717,
            initial_ssthresh: 0,
            bic_scale: 41,
            tcp_friendliness: true,
            hystart: hystart.enabled,
            hystart_detect: hystart.detect.bits(),
            hystart_low_window: hystart.low_window,
            hystart_ack_delta_us: hystart.ack_delta_us,
            initial_congestion_window: 10,
            min_congestion_window: 4,
        }
    }
}

/// Configurations about handover-aware suspension.
#[doc(hidden)]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HandoverConfig {
    /// Suspend transmission around handovers.
    pub enabled: bool,

    /// Window start before the nominal handover instant, in milliseconds.
    pub start_offset_ms: u64,

    /// Window end after the nominal handover instant, in milliseconds.
    pub end_offset_ms: u64,

    /// Extend an armed retransmission deadline by the window length.
    pub extend_retransmit_deadline: bool,
}

impl Default for HandoverConfig {
    fn default() -> HandoverConfig {
        HandoverConfig {
            enabled: true,
            start_offset_ms: HANDOVER_OFFSET_DEFAULT,
            end_offset_ms: HANDOVER_OFFSET_DEFAULT,
            extend_retransmit_deadline: true,
        }
    }
}


pub use crate::congestion_control::CongestionControlAlgorithm;
pub use crate::congestion_control::CongestionController;
pub use crate::congestion_control::Detect;
pub use crate::connection::TransportHost;
pub use crate::engine::Engine;
pub use crate::error::Error;

#[path = "congestion_control/congestion_control.rs"]
pub mod congestion_control;

#[path = "connection/connection.rs"]
pub mod connection;

pub mod engine;
pub mod error;
pub mod handover;
pub mod time_sync;
pub mod timer_queue;
