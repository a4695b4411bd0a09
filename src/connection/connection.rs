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

//! Per-connection congestion control state.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::sync::TryLockError;

use log::*;

use crate::congestion_control::CongestionController;
use crate::congestion_control::CongestionStats;
use crate::handover::Handover;
use crate::handover::HandoverSchedule;
use crate::handover::HandoverStats;
use crate::time_sync::Stamp;

/// A connection driven by the engine.
///
/// It owns the host record, the congestion controller and, unless the engine
/// ran out of handover timers, the handover state machine.
pub struct Connection<H: TransportHost> {
    /// Unique trace id for debug logging.
    trace_id: String,

    host: H,

    controller: Box<dyn CongestionController>,

    handover: Option<Handover>,
}

impl<H: TransportHost> Connection<H> {
    pub(crate) fn new(
        trace_id: String,
        host: H,
        controller: Box<dyn CongestionController>,
        handover: bool,
    ) -> Self {
        let handover = handover.then(|| Handover::new(&trace_id));
        Self {
            trace_id,
            host,
            controller,
            handover,
        }
    }

    /// Return the trace id of the connection.
    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn host_mut(&mut self) -> &mut H {
        &mut self.host
    }

    /// Consume the connection and hand the host record back.
    pub fn into_host(self) -> H {
        self.host
    }

    pub fn controller(&self) -> &dyn CongestionController {
        self.controller.as_ref()
    }

    pub fn handover(&self) -> Option<&Handover> {
        self.handover.as_ref()
    }

    /// Whether transmission is suspended for a handover.
    pub fn is_suspended(&self) -> bool {
        self.handover.is_some() && self.host.window() == 0
    }

    pub fn stats(&self) -> &CongestionStats {
        self.controller.stats()
    }

    pub fn handover_stats(&self) -> Option<&HandoverStats> {
        self.handover.as_ref().map(|h| h.stats())
    }

    /// Initialize the controller and the handover state.
    ///
    /// Return the delay of the first handover timer, if any.
    pub(crate) fn init(
        &mut self,
        schedule: &HandoverSchedule,
        now: Stamp,
        flow_clock: u64,
    ) -> Option<u64> {
        self.controller.init(&mut self.host, now);

        let handover = self.handover.as_mut()?;
        Some(handover.init(&mut self.host, schedule, flow_clock))
    }

    /// Process an acknowledgment.
    ///
    /// The handover check runs first. Inside the disruption window the RTT
    /// sample is still recorded but the window does not grow.
    pub(crate) fn on_ack(
        &mut self,
        ack: Ack,
        schedule: &HandoverSchedule,
        now: Stamp,
        flow_clock: u64,
    ) {
        let suspended = match self.handover.as_mut() {
            Some(handover) => handover.check(&mut self.host, schedule, flow_clock),
            None => false,
        };

        self.controller
            .on_rtt_sample(&mut self.host, ack.rtt_us, now);

        if suspended {
            trace!(
                "{} handover: skip growth, {} segments acked",
                self.trace_id,
                ack.acked
            );
            return;
        }

        self.controller.on_ack(&mut self.host, ack.acked, now);
    }

    /// Process a congestion event and apply the new slow start threshold.
    ///
    /// Losses seen while suspended belong to the outage and leave the
    /// controller untouched.
    pub(crate) fn on_congestion_event(&mut self, now: Stamp) -> u32 {
        if self.is_suspended() {
            debug!("{} handover: ignore congestion event", self.trace_id);
            return self.host.ssthresh();
        }

        let ssthresh = self.controller.on_congestion_event(&self.host, now);
        self.host.set_ssthresh(ssthresh);
        ssthresh
    }

    pub(crate) fn on_loss_state(&mut self, now: Stamp) {
        if self.is_suspended() {
            debug!("{} handover: ignore loss state", self.trace_id);
            return;
        }

        self.controller.on_loss_state(&self.host, now);
    }

    pub(crate) fn on_tx_start(&mut self, last_send: u32, now: Stamp) {
        self.controller.on_tx_start(&mut self.host, last_send, now);
    }

    /// Undo a spurious window reduction. Return the restored window.
    pub(crate) fn undo_window(&mut self) -> u32 {
        if self.is_suspended() {
            debug!("{} handover: ignore undo", self.trace_id);
            return 0;
        }

        let cwnd = self.controller.undo_window(&self.host);
        self.host.set_window(cwnd);
        cwnd
    }

    /// Run the handover timer.
    ///
    /// Return the delay of the next timer, or None if the timer must not be
    /// re-armed.
    pub(crate) fn on_timer(&mut self, schedule: &HandoverSchedule, flow_clock: u64) -> Option<u64> {
        let handover = self.handover.as_mut()?;

        if !self.host.is_established() {
            debug!("{} handover: connection not established, stop", self.trace_id);
            return None;
        }

        Some(handover.on_timer(&mut self.host, schedule, flow_clock))
    }
}

/// A registered connection.
///
/// The connection itself sits behind the per-connection lock. It is taken
/// out on teardown, so a `None` means the flow is closed and no callback may
/// touch it anymore.
pub struct Flow<H: TransportHost> {
    id: u64,

    /// Set by a timer that found the connection locked. Cleared by whoever
    /// runs the deferred timer work.
    retry_owed: AtomicBool,

    conn: Mutex<Option<Connection<H>>>,
}

impl<H: TransportHost> Flow<H> {
    pub(crate) fn new(id: u64, conn: Connection<H>) -> Self {
        Self {
            id,
            retry_owed: AtomicBool::new(false),
            conn: Mutex::new(Some(conn)),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Acquire the connection lock, blocking.
    pub(crate) fn lock(&self) -> MutexGuard<'_, Option<Connection<H>>> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Acquire the connection lock without blocking.
    pub(crate) fn try_lock(&self) -> Option<MutexGuard<'_, Option<Connection<H>>>> {
        match self.conn.try_lock() {
            Ok(guard) => Some(guard),
            Err(TryLockError::Poisoned(e)) => Some(e.into_inner()),
            Err(TryLockError::WouldBlock) => None,
        }
    }

    pub(crate) fn set_retry_owed(&self) {
        self.retry_owed.store(true, Ordering::Release);
    }

    /// Clear the retry flag, returning whether it was set.
    pub(crate) fn take_retry_owed(&self) -> bool {
        self.retry_owed.swap(false, Ordering::AcqRel)
    }

    pub fn is_retry_owed(&self) -> bool {
        self.retry_owed.load(Ordering::Acquire)
    }
}

impl<H: TransportHost> std::fmt::Debug for Flow<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "Flow {} retry_owed={}", self.id, self.is_retry_owed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::congestion_control::build_congestion_controller;
    use crate::CongestionConfig;

    fn new_conn(handover: bool) -> Connection<HostRecord> {
        let cc = build_congestion_controller(&CongestionConfig::default());
        Connection::new("LEO-0".into(), HostRecord::new(30), cc, handover)
    }

    #[test]
    fn connection_growth_skipped_while_suspended() {
        let schedule = HandoverSchedule::default();
        let mut conn = new_conn(true);
        assert_eq!(conn.init(&schedule, Stamp::new(1000, 0), 11_900), Some(300));
        assert!(conn.is_suspended());

        conn.host_mut().send(30);
        for i in 0..10 {
            conn.host_mut().acknowledge(1);
            conn.on_ack(
                Ack::new(1, Some(50_000)),
                &schedule,
                Stamp::new(1000 + i, i * 1000),
                11_900 + i as u64,
            );
        }
        assert_eq!(conn.host().window(), 0);
        assert_eq!(conn.stats().segments_acked_in_total, 0);

        // Out of the window, the next ACK resumes and grows.
        conn.host_mut().acknowledge(1);
        conn.on_ack(
            Ack::new(1, Some(50_000)),
            &schedule,
            Stamp::new(1400, 400_000),
            12_300,
        );
        assert!(!conn.is_suspended());
        assert_eq!(conn.stats().segments_acked_in_total, 1);
        assert!(conn.host().window() >= 30);
    }

    #[test]
    fn connection_congestion_event() {
        let schedule = HandoverSchedule::default();
        let mut conn = new_conn(true);
        conn.init(&schedule, Stamp::new(1000, 0), 0);

        conn.host_mut().cwnd = 100;
        assert_eq!(conn.on_congestion_event(Stamp::new(1100, 0)), 70);
        assert_eq!(conn.host().ssthresh, 70);
        assert_eq!(conn.stats().congestion_events, 1);

        // Ignored while suspended.
        conn.host_mut().cwnd = 0;
        assert_eq!(conn.on_congestion_event(Stamp::new(1200, 0)), 70);
        assert_eq!(conn.stats().congestion_events, 1);
        assert_eq!(conn.undo_window(), 0);

        conn.host_mut().cwnd = 60;
        conn.host_mut().prior_cwnd = 100;
        assert_eq!(conn.undo_window(), 100);
        assert_eq!(conn.host().cwnd, 100);
    }

    #[test]
    fn connection_without_handover() {
        let schedule = HandoverSchedule::default();
        let mut conn = new_conn(false);
        assert_eq!(conn.init(&schedule, Stamp::new(1000, 0), 12_000), None);
        assert!(conn.handover().is_none());
        assert!(conn.handover_stats().is_none());
        assert_eq!(conn.on_timer(&schedule, 12_000), None);

        // A zero window is not a suspension without handover support.
        conn.host_mut().cwnd = 0;
        assert!(!conn.is_suspended());
    }

    #[test]
    fn connection_timer_stops_when_not_established() {
        let schedule = HandoverSchedule::default();
        let mut conn = new_conn(true);
        conn.init(&schedule, Stamp::new(1000, 0), 0);
        assert_eq!(conn.on_timer(&schedule, 11_800), Some(400));
        assert!(conn.is_suspended());

        conn.host_mut().established = false;
        assert_eq!(conn.on_timer(&schedule, 12_200), None);
        assert!(conn.is_suspended());
    }

    #[test]
    fn flow_lock_and_retry() {
        let flow = Flow::new(7, new_conn(true));
        assert_eq!(flow.id(), 7);
        assert!(!flow.is_retry_owed());

        let guard = flow.lock();
        assert!(flow.try_lock().is_none());
        flow.set_retry_owed();
        drop(guard);

        assert!(flow.try_lock().is_some());
        assert!(flow.take_retry_owed());
        assert!(!flow.take_retry_owed());

        let conn = flow.lock().take();
        assert!(conn.is_some());
        assert!(flow.lock().is_none());
        assert_eq!(format!("{:?}", flow), "Flow 7 retry_owed=false");
    }
}

mod host;
pub use host::*;
