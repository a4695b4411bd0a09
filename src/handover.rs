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

//! Handover-aware transmission suspension.
//!
//! Satellite handovers happen at fixed instants of every wall-clock minute
//! (12s, 27s, 42s and 57s). Around each of them the link is unusable, so the
//! sender zeroes its window shortly before the nominal instant and restores
//! it shortly after. The schedule is evaluated against the flow clock of
//! [`TimeSync`](crate::time_sync::TimeSync).

use std::time::Duration;

use log::*;

use crate::connection::TransportHost;
use crate::HandoverConfig;

/// Nominal handover instant within each interval, in milliseconds.
pub const HANDOVER_TIME: u64 = 12_000;

/// Handover period, in milliseconds.
pub const HANDOVER_INTERVAL: u64 = 15_000;

/// Slack applied to the window edges on timer expiry, in milliseconds.
pub const HANDOVER_JITTER: u64 = 10;

/// Default offset of both window edges from the nominal instant.
pub const HANDOVER_OFFSET_DEFAULT: u64 = 200;

/// Upper bound of the window edge offsets.
pub const HANDOVER_OFFSET_MAX: u64 = 1000;

/// The recurring disruption window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandoverSchedule {
    /// Offset of the window start before the nominal instant.
    start_offset: u64,

    /// Offset of the window end after the nominal instant.
    end_offset: u64,

    /// Push the retransmission deadline back by the window length on
    /// suspension.
    extend_retransmit_deadline: bool,
}

impl HandoverSchedule {
    pub fn new(start_offset: u64, end_offset: u64, extend_retransmit_deadline: bool) -> Self {
        Self {
            start_offset: start_offset.min(HANDOVER_OFFSET_MAX),
            end_offset: end_offset.min(HANDOVER_OFFSET_MAX),
            extend_retransmit_deadline,
        }
    }

    pub fn from(conf: &HandoverConfig) -> Self {
        Self::new(
            conf.start_offset_ms,
            conf.end_offset_ms,
            conf.extend_retransmit_deadline,
        )
    }

    /// Start of the window within the interval.
    pub fn start(&self) -> u64 {
        HANDOVER_TIME - self.start_offset
    }

    /// End of the window within the interval.
    pub fn end(&self) -> u64 {
        HANDOVER_TIME + self.end_offset
    }

    /// Position of the flow clock `t` within the interval.
    pub fn position(&self, t: u64) -> u64 {
        t % HANDOVER_INTERVAL
    }

    /// Whether the flow clock `t` falls inside the window, edges included.
    pub fn inside(&self, t: u64) -> bool {
        let pos = self.position(t);
        self.start() <= pos && pos <= self.end()
    }

    /// Whether transmission must be suspended at flow clock `t`.
    ///
    /// Same boundaries as the timer: the jitter margin applies to both edges
    /// and the end edge belongs to the recovered side.
    pub fn suspends(&self, t: u64) -> bool {
        let pos = self.position(t) + HANDOVER_JITTER;
        self.start() <= pos && pos < self.end()
    }

    /// Delay until the next window edge, at least one tick.
    pub fn next_timeout(&self, t: u64) -> u64 {
        let pos = self.position(t);
        let timeout = if pos < self.start() {
            self.start() - pos
        } else if pos < self.end() {
            self.end() - pos
        } else {
            self.start() + HANDOVER_INTERVAL - pos
        };

        timeout.max(1)
    }

    /// Expected length of the outage.
    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.start_offset + self.end_offset)
    }

    pub fn extend_retransmit_deadline(&self) -> bool {
        self.extend_retransmit_deadline
    }
}

impl Default for HandoverSchedule {
    fn default() -> Self {
        Self::new(HANDOVER_OFFSET_DEFAULT, HANDOVER_OFFSET_DEFAULT, true)
    }
}

/// Transmission state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandoverState {
    /// Transmitting normally.
    Active,

    /// The host window is forced to zero until the window ends.
    Suspended,
}

/// Handover statistics of a connection.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct HandoverStats {
    /// Number of suspensions.
    pub suspensions: u64,

    /// Number of resumptions.
    pub resumptions: u64,

    /// Number of times the state disagreed with the host window.
    pub corrections: u64,
}

/// Per-connection handover state machine.
///
/// The host window is authoritative: a zero window means suspended. The
/// state is reconciled against it at every entry point.
#[derive(Debug, Clone)]
pub struct Handover {
    trace_id: String,

    state: HandoverState,

    /// Window before the last suspension.
    saved_cwnd: u32,

    stats: HandoverStats,
}

impl Handover {
    pub fn new(trace_id: &str) -> Self {
        Self {
            trace_id: trace_id.to_string(),
            state: HandoverState::Active,
            saved_cwnd: 0,
            stats: HandoverStats::default(),
        }
    }

    pub fn state(&self) -> HandoverState {
        self.state
    }

    pub fn is_suspended(&self) -> bool {
        self.state == HandoverState::Suspended
    }

    /// Window restored on the next resumption.
    pub fn saved_window(&self) -> u32 {
        self.saved_cwnd
    }

    pub fn stats(&self) -> &HandoverStats {
        &self.stats
    }

    /// Suspend if the connection starts inside the window.
    ///
    /// Return the delay of the first timer.
    pub fn init(
        &mut self,
        host: &mut dyn TransportHost,
        schedule: &HandoverSchedule,
        now: u64,
    ) -> u64 {
        if schedule.suspends(now) {
            self.suspend(host, schedule);
        }

        schedule.next_timeout(now)
    }

    /// Bring the state in line with the host window.
    pub fn reconcile(&mut self, host: &dyn TransportHost) {
        let state = if host.window() == 0 {
            HandoverState::Suspended
        } else {
            HandoverState::Active
        };

        if state != self.state {
            warn!(
                "{} handover: state {:?} but cwnd {}, correct to {:?}",
                self.trace_id,
                self.state,
                host.window(),
                state
            );
            self.state = state;
            self.stats.corrections += 1;
        }
    }

    /// Zero the host window. Return false if already suspended.
    pub fn suspend(&mut self, host: &mut dyn TransportHost, schedule: &HandoverSchedule) -> bool {
        self.reconcile(host);
        if self.is_suspended() {
            warn!("{} handover: start: already started", self.trace_id);
            return false;
        }

        debug!(
            "{} handover: start: cwnd {} inflight {}",
            self.trace_id,
            host.window(),
            host.in_flight_segments()
        );

        self.saved_cwnd = host.window();
        host.set_window(0);

        if schedule.extend_retransmit_deadline() && host.has_retransmit_deadline() {
            host.extend_retransmit_deadline(schedule.duration());
        }

        self.state = HandoverState::Suspended;
        self.stats.suspensions += 1;
        true
    }

    /// Restore the host window. Return false if already active.
    pub fn resume(&mut self, host: &mut dyn TransportHost) -> bool {
        self.reconcile(host);
        if !self.is_suspended() {
            warn!("{} handover: end: already cwnd recovered", self.trace_id);
            return false;
        }

        host.set_window(self.saved_cwnd.max(1));
        self.state = HandoverState::Active;
        self.stats.resumptions += 1;

        debug!(
            "{} handover: end: recover cwnd {} inflight {}",
            self.trace_id,
            host.window(),
            host.in_flight_segments()
        );

        if host.is_write_blocked() {
            trace!("{} handover: wake up blocked writer", self.trace_id);
            host.notify_write_space();
        }

        true
    }

    /// Synchronous check on every acknowledgment.
    ///
    /// Return true if the connection is inside the window, in which case the
    /// window must not grow.
    pub fn check(
        &mut self,
        host: &mut dyn TransportHost,
        schedule: &HandoverSchedule,
        now: u64,
    ) -> bool {
        self.reconcile(host);

        if schedule.suspends(now) {
            if !self.is_suspended() {
                warn!("{} handover: missing transmission suspension", self.trace_id);
                self.suspend(host, schedule);
            }
            return true;
        }

        if self.is_suspended() {
            warn!("{} handover: unrecovered, force to recover cwnd", self.trace_id);
            self.resume(host);
        }

        false
    }

    /// Timer expiry. Return the delay of the next timer.
    pub fn on_timer(
        &mut self,
        host: &mut dyn TransportHost,
        schedule: &HandoverSchedule,
        now: u64,
    ) -> u64 {
        self.reconcile(host);

        let pos = schedule.position(now) + HANDOVER_JITTER;
        if pos >= schedule.end() {
            self.resume(host);
        } else if pos >= schedule.start() {
            self.suspend(host, schedule);
        } else if self.is_suspended() {
            self.resume(host);
        } else {
            debug!("{} handover: already handover recovered", self.trace_id);
        }

        let timeout = schedule.next_timeout(now);
        trace!(
            "{} handover: timer reset {}ms, start {} end {} now {}",
            self.trace_id,
            timeout,
            schedule.start(),
            schedule.end(),
            schedule.position(now)
        );
        timeout
    }
}
