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

//! The congestion control engine.
//!
//! The engine keeps a registry of connections, each behind its own lock, and
//! a timer queue for the handover timers and the clock resync timer. Two
//! execution contexts enter it: the ACK path of a connection, which locks the
//! connection blocking, and the timer context calling [`Engine::on_timeout`],
//! which never blocks on a connection. A timer that finds its connection
//! locked leaves a retry flag behind; the next entry on that connection, or
//! its teardown, runs the deferred work.
//!
//! Lock order: registry, then timers; connection, then timers. The timer
//! queue lock is never held while acquiring a connection lock.

use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::sync::RwLock;
use std::time::Duration;

use log::*;
use slab::Slab;

use crate::congestion_control::build_congestion_controller;
use crate::congestion_control::CongestionStats;
use crate::connection::Ack;
use crate::connection::Connection;
use crate::connection::Flow;
use crate::connection::TransportHost;
use crate::handover::HandoverStats;
use crate::time_sync::ClockSource;
use crate::time_sync::SystemClock;
use crate::time_sync::TimeSync;
use crate::timer_queue::TimerQueue;
use crate::Config;
use crate::Error;
use crate::Result;

/// Timer index of the clock resync timer.
const SYNC_TIMER: u64 = u64::MAX;

/// Low bits of a connection id hold the registry slot.
const SLOT_MASK: u64 = 0xffff_ffff;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Congestion control engine for connections of host type `H`.
pub struct Engine<H: TransportHost> {
    /// Registered connections.
    flows: Mutex<Slab<Arc<Flow<H>>>>,

    /// Handover timers keyed by connection id, plus the resync timer.
    timers: Mutex<TimerQueue>,

    config: RwLock<Arc<Config>>,

    time: Arc<TimeSync>,

    /// Distinguishes connections reusing a registry slot.
    generation: AtomicU32,
}

impl<H: TransportHost> Engine<H> {
    /// Create an engine reading time from `clock`.
    pub fn new(config: Config, clock: Arc<dyn ClockSource>) -> Self {
        let time = Arc::new(TimeSync::new(clock, config.sync_period()));

        let mut timers = TimerQueue::new();
        timers.add(SYNC_TIMER, time.next_sync());

        Self {
            flows: Mutex::new(Slab::new()),
            timers: Mutex::new(timers),
            config: RwLock::new(Arc::new(config)),
            time,
            generation: AtomicU32::new(0),
        }
    }

    /// Create an engine on the system clock.
    pub fn with_system_clock(config: Config) -> Self {
        Self::new(config, Arc::new(SystemClock::new()))
    }

    /// Return the current configuration.
    pub fn config(&self) -> Arc<Config> {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace the configuration.
    ///
    /// Handover offsets apply from the next check. Congestion control
    /// parameters apply to connections registered afterwards. The sync
    /// period is fixed when the engine is created.
    pub fn set_config(&self, config: Config) {
        *self.config.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(config);
    }

    /// Return the flow clock.
    pub fn time(&self) -> &Arc<TimeSync> {
        &self.time
    }

    /// Register a connection and return its id.
    ///
    /// When the handover timers are used up the connection is registered
    /// without handover support.
    pub fn register(&self, host: H) -> Result<u64> {
        let config = self.config();
        let controller = build_congestion_controller(config.congestion());

        let mut flows = lock(&self.flows);
        let entry = flows.vacant_entry();
        let slot = entry.key() as u64 & SLOT_MASK;
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let id = (u64::from(generation) << 32) | slot;
        let trace_id = format!("LEO-{}.{}", slot, generation);

        // Reserve and arm the timer under the registry lock.
        let mut timers = lock(&self.timers);
        let handover = config.handover().enabled
            && match Self::reserve_timer(&timers, &config) {
                Ok(()) => true,
                Err(e) => {
                    warn!("{} handover disabled: {}", trace_id, e);
                    false
                }
            };

        let mut conn = Connection::new(trace_id, host, controller, handover);
        let delay = conn.init(
            &config.handover_schedule(),
            self.time.stamp(),
            self.time.now(),
        );
        debug!(
            "{} registered, congestion controller {}, handover {}",
            conn.trace_id(),
            conn.controller().name(),
            handover
        );

        if let Some(delay) = delay {
            timers.add(id, self.time.monotonic_ms() + delay);
        }
        drop(timers);

        entry.insert(Arc::new(Flow::new(id, conn)));
        drop(flows);

        Ok(id)
    }

    /// Remove a connection and hand its host record back.
    ///
    /// The handover timer is cancelled and any deferred timer work is run
    /// before the connection is released.
    pub fn unregister(&self, id: u64) -> Result<H> {
        let flow = {
            let mut flows = lock(&self.flows);
            let slot = (id & SLOT_MASK) as usize;
            match flows.get(slot) {
                Some(flow) if flow.id() == id => flows.remove(slot),
                _ => return Err(Error::UnknownConnection(id)),
            }
        };

        let mut guard = flow.lock();
        lock(&self.timers).del(&id);

        let mut conn = guard.take().ok_or(Error::UnknownConnection(id))?;
        if flow.take_retry_owed() {
            debug!("{} handover: run deferred timer on teardown", conn.trace_id());
            let config = self.config();
            _ = conn.on_timer(&config.handover_schedule(), self.time.now());
        }

        debug!("{} unregistered", conn.trace_id());
        Ok(conn.into_host())
    }

    /// Process an acknowledgment on a connection.
    pub fn on_ack(&self, id: u64, ack: Ack) -> Result<()> {
        self.with_conn(id, |conn, config| {
            conn.on_ack(
                ack,
                &config.handover_schedule(),
                self.time.stamp(),
                self.time.now(),
            )
        })
    }

    /// Process a congestion event. Return the new slow start threshold,
    /// which is also applied to the host.
    pub fn on_congestion_event(&self, id: u64) -> Result<u32> {
        self.with_conn(id, |conn, _| conn.on_congestion_event(self.time.stamp()))
    }

    /// The connection entered the Loss state.
    pub fn on_loss_state(&self, id: u64) -> Result<()> {
        self.with_conn(id, |conn, _| conn.on_loss_state(self.time.stamp()))
    }

    /// Transmission restarts, `last_send` being the tick of the last
    /// transmission.
    pub fn on_tx_start(&self, id: u64, last_send: u32) -> Result<()> {
        self.with_conn(id, |conn, _| conn.on_tx_start(last_send, self.time.stamp()))
    }

    /// Undo a spurious window reduction. Return the restored window.
    pub fn undo_window(&self, id: u64) -> Result<u32> {
        self.with_conn(id, |conn, _| conn.undo_window())
    }

    /// Run `f` on the host record of a connection, under its lock.
    pub fn with_host<R>(&self, id: u64, f: impl FnOnce(&mut H) -> R) -> Result<R> {
        self.with_conn(id, |conn, _| f(conn.host_mut()))
    }

    /// Whether the connection is suspended for a handover.
    pub fn is_suspended(&self, id: u64) -> Result<bool> {
        self.with_conn(id, |conn, _| conn.is_suspended())
    }

    /// Return the congestion control statistics of a connection.
    pub fn stats(&self, id: u64) -> Result<CongestionStats> {
        self.with_conn(id, |conn, _| conn.stats().clone())
    }

    /// Return the handover statistics of a connection, None if it runs
    /// without handover support.
    pub fn handover_stats(&self, id: u64) -> Result<Option<HandoverStats>> {
        self.with_conn(id, |conn, _| conn.handover_stats().cloned())
    }

    /// Return the amount of time until the next timeout event.
    pub fn timeout(&self) -> Option<Duration> {
        let now = self.time.monotonic_ms();
        let d = lock(&self.timers)
            .time_remaining(now)
            .map(Duration::from_millis);
        trace!("engine next timeout duration {:?}", d);
        d
    }

    /// Process timeout events, `now` being the monotonic counter in
    /// milliseconds.
    pub fn on_timeout(&self, now: u64) {
        loop {
            // The timer queue lock is released before any connection lock.
            let id = match lock(&self.timers).next_expire(now) {
                Some(id) => id,
                None => break,
            };

            if id == SYNC_TIMER {
                self.time.on_timeout(now);
                let next = self.time.next_sync().max(now + 1);
                lock(&self.timers).add(SYNC_TIMER, next);
                continue;
            }

            self.on_flow_timeout(id, now);
        }
    }

    /// Number of registered connections.
    pub fn len(&self) -> usize {
        lock(&self.flows).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn flow(&self, id: u64) -> Result<Arc<Flow<H>>> {
        match lock(&self.flows).get((id & SLOT_MASK) as usize) {
            Some(flow) if flow.id() == id => Ok(flow.clone()),
            _ => Err(Error::UnknownConnection(id)),
        }
    }

    /// Fail with ResourceExhausted if no handover timer is left.
    fn reserve_timer(timers: &TimerQueue, config: &Config) -> Result<()> {
        // The resync timer always sits in the queue.
        let armed = timers.len().saturating_sub(1);
        if armed >= config.max_handover_timers() {
            return Err(Error::ResourceExhausted);
        }

        Ok(())
    }

    /// Lock a connection, run any deferred timer work, then `f`.
    fn with_conn<R>(
        &self,
        id: u64,
        f: impl FnOnce(&mut Connection<H>, &Config) -> R,
    ) -> Result<R> {
        let flow = self.flow(id)?;
        let mut guard = flow.lock();
        let conn = guard
            .as_mut()
            .ok_or_else(|| Error::InvalidState(format!("connection {} is closed", id)))?;

        let config = self.config();
        if flow.take_retry_owed() {
            debug!("{} handover: run deferred timer", conn.trace_id());
            self.run_timer(&flow, conn, &config, self.time.monotonic_ms());
        }

        Ok(f(conn, &config))
    }

    fn on_flow_timeout(&self, id: u64, now: u64) {
        let flow = match self.flow(id) {
            Ok(flow) => flow,
            Err(_) => return,
        };

        let mut guard = match flow.try_lock() {
            Some(guard) => guard,
            None => {
                trace!("flow {} is busy, defer handover timer", id);
                flow.set_retry_owed();
                self.defer_timer(id, now + 1);
                return;
            }
        };

        if let Some(conn) = guard.as_mut() {
            flow.take_retry_owed();
            self.run_timer(&flow, conn, &self.config(), now);
        }
    }

    /// Re-arm the timer of a busy connection unless it was unregistered in
    /// the meantime.
    fn defer_timer(&self, id: u64, at: u64) {
        // unregister removes the flow before it cancels the timer.
        let flows = lock(&self.flows);
        match flows.get((id & SLOT_MASK) as usize) {
            Some(flow) if flow.id() == id => lock(&self.timers).add(id, at),
            _ => trace!("flow {} is gone, drop deferred timer", id),
        }
    }

    /// Run the handover timer of a locked connection and re-arm it.
    fn run_timer(&self, flow: &Flow<H>, conn: &mut Connection<H>, config: &Config, now: u64) {
        match conn.on_timer(&config.handover_schedule(), self.time.now()) {
            Some(delay) => lock(&self.timers).add(flow.id(), now + delay),
            None => lock(&self.timers).del(&flow.id()),
        }
    }
}

impl<H: TransportHost> std::fmt::Debug for Engine<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "Engine flows={} {:?}", self.len(), self.time)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::HostRecord;
    use crate::time_sync::tests::manual_clock_at;
    use crate::time_sync::tests::MINUTE_ALIGNED_WALL;
    use crate::time_sync::ManualClock;
    use std::thread;

    fn new_engine(flow_ms: u64) -> (Engine<HostRecord>, Arc<ManualClock>) {
        let clock = manual_clock_at(flow_ms);
        (Engine::new(Config::default(), clock.clone()), clock)
    }

    fn fire(engine: &Engine<HostRecord>, clock: &ManualClock, ms: u64) {
        clock.advance(Duration::from_millis(ms));
        engine.on_timeout(engine.time().monotonic_ms());
    }

    fn cwnd(engine: &Engine<HostRecord>, id: u64) -> u32 {
        engine.with_host(id, |h| h.cwnd).unwrap()
    }

    #[test]
    fn handover_scenario() -> Result<()> {
        // 300ms before the nominal instant, 100ms before the window.
        let (engine, clock) = new_engine(11_700);
        let id = engine.register(HostRecord::new(50))?;
        assert!(!engine.is_suspended(id)?);
        assert_eq!(engine.timeout(), Some(Duration::from_millis(100)));

        fire(&engine, &clock, 99);
        assert!(!engine.is_suspended(id)?);

        // Nominal instant minus 200ms.
        fire(&engine, &clock, 1);
        assert_eq!(engine.time().now(), 11_800);
        assert!(engine.is_suspended(id)?);
        assert_eq!(cwnd(&engine, id), 0);
        assert_eq!(engine.timeout(), Some(Duration::from_millis(400)));

        // ACKs inside the window do not grow the window.
        engine.with_host(id, |h| h.snd_una += 1)?;
        engine.on_ack(id, Ack::new(1, Some(40_000)))?;
        assert_eq!(cwnd(&engine, id), 0);

        // Nominal instant plus 200ms.
        fire(&engine, &clock, 400);
        assert!(!engine.is_suspended(id)?);
        assert_eq!(cwnd(&engine, id), 50);
        assert_eq!(engine.timeout(), Some(Duration::from_millis(14_600)));

        // And again at the next handover.
        fire(&engine, &clock, 14_600);
        assert_eq!(engine.time().now(), 26_800);
        assert!(engine.is_suspended(id)?);

        let stats = engine.handover_stats(id)?.unwrap();
        assert_eq!(stats.suspensions, 2);
        assert_eq!(stats.resumptions, 1);
        Ok(())
    }

    #[test]
    fn ack_on_resume_tick() -> Result<()> {
        let (engine, clock) = new_engine(11_700);
        let id = engine.register(HostRecord::new(50))?;

        fire(&engine, &clock, 100);
        assert!(engine.is_suspended(id)?);

        // The ACK lands on the tick of the end-of-window timer.
        fire(&engine, &clock, 400);
        assert_eq!(engine.time().now(), 12_200);
        assert!(!engine.is_suspended(id)?);
        engine.on_ack(id, Ack::new(1, Some(40_000)))?;
        assert!(!engine.is_suspended(id)?);
        assert!(cwnd(&engine, id) >= 50);
        assert_eq!(engine.handover_stats(id)?.unwrap().suspensions, 1);
        assert_eq!(engine.timeout(), Some(Duration::from_millis(14_600)));
        Ok(())
    }

    #[test]
    fn register_inside_window() -> Result<()> {
        let (engine, _) = new_engine(42_000);
        let id = engine.register(HostRecord::new(20))?;
        assert!(engine.is_suspended(id)?);
        assert_eq!(engine.timeout(), Some(Duration::from_millis(200)));
        Ok(())
    }

    #[test]
    fn growth_on_ack() -> Result<()> {
        let (engine, clock) = new_engine(1_000);
        let id = engine.register(HostRecord::new(10))?;
        engine.with_host(id, |h| h.send(10))?;

        // Slow start, one segment per ACK while window limited.
        for _ in 0..20 {
            engine.with_host(id, |h| {
                h.acknowledge(1);
                h.send(2);
            })?;
            engine.on_ack(id, Ack::new(1, Some(30_000)))?;
            clock.advance(Duration::from_millis(1));
        }
        assert_eq!(cwnd(&engine, id), 30);
        assert_eq!(engine.stats(id)?.segments_acked_in_total, 20);

        assert_eq!(engine.on_congestion_event(id)?, 21);
        assert_eq!(engine.with_host(id, |h| h.ssthresh)?, 21);
        engine.with_host(id, |h| h.cwnd = 21)?;
        engine.on_loss_state(id)?;
        engine.on_tx_start(id, engine.time().ticks())?;
        assert_eq!(engine.undo_window(id)?, 21);
        Ok(())
    }

    #[test]
    fn timer_contention_retry() -> Result<()> {
        let (engine, clock) = new_engine(11_700);
        let id = engine.register(HostRecord::new(50))?;
        let flow = engine.flow(id)?;

        let guard = flow.lock();
        fire(&engine, &clock, 100);
        assert!(flow.is_retry_owed());
        // Retried on the next tick as well.
        assert_eq!(engine.timeout(), Some(Duration::from_millis(1)));
        drop(guard);

        // The next ACK runs the deferred transition first.
        engine.on_ack(id, Ack::new(1, Some(40_000)))?;
        assert!(!flow.is_retry_owed());
        assert!(engine.is_suspended(id)?);
        assert_eq!(engine.timeout(), Some(Duration::from_millis(400)));
        Ok(())
    }

    #[test]
    fn teardown_drains_retry() -> Result<()> {
        let (engine, clock) = new_engine(12_100);
        let id = engine.register(HostRecord::new(50))?;
        assert!(engine.is_suspended(id)?);
        let flow = engine.flow(id)?;

        let guard = flow.lock();
        fire(&engine, &clock, 100);
        assert!(flow.is_retry_owed());
        drop(guard);

        // The owed resumption runs before the host is handed back.
        let host = engine.unregister(id)?;
        assert_eq!(host.cwnd, 50);
        assert!(!flow.is_retry_owed());
        assert!(flow.lock().is_none());
        assert!(engine.is_empty());

        // Only the resync timer is left.
        assert_eq!(engine.timeout(), Some(Duration::from_millis(59_900)));

        assert_eq!(
            engine.unregister(id).err(),
            Some(Error::UnknownConnection(id))
        );
        assert_eq!(
            engine.on_ack(id, Ack::new(1, None)),
            Err(Error::UnknownConnection(id))
        );

        // A new connection in the same slot gets a new id.
        let id2 = engine.register(HostRecord::new(10))?;
        assert_ne!(id, id2);
        assert_eq!(id & SLOT_MASK, id2 & SLOT_MASK);
        assert!(engine.is_suspended(id).is_err());
        Ok(())
    }

    #[test]
    fn degrade_without_timers() -> Result<()> {
        let clock = manual_clock_at(12_000);
        let mut config = Config::default();
        config.set_max_handover_timers(1);
        let engine = Engine::new(config, clock);

        let id1 = engine.register(HostRecord::new(10))?;
        let id2 = engine.register(HostRecord::new(10))?;
        assert_eq!(engine.len(), 2);

        assert!(engine.handover_stats(id1)?.is_some());
        assert!(engine.is_suspended(id1)?);
        assert!(engine.handover_stats(id2)?.is_none());
        assert!(!engine.is_suspended(id2)?);
        assert_eq!(cwnd(&engine, id2), 10);

        // The slot is given back on teardown.
        engine.unregister(id1)?;
        let id3 = engine.register(HostRecord::new(10))?;
        assert!(engine.handover_stats(id3)?.is_some());
        Ok(())
    }

    #[test]
    fn deferred_timer_after_unregister() -> Result<()> {
        let (engine, _) = new_engine(11_000);
        let id1 = engine.register(HostRecord::new(10))?;
        let id2 = engine.register(HostRecord::new(10))?;
        engine.unregister(id1)?;

        engine.defer_timer(id1, 5);
        engine.defer_timer(id2, 5);
        let timers = lock(&engine.timers);
        assert_eq!(timers.deadline(&id1), None);
        assert_eq!(timers.deadline(&id2), Some(5));
        assert_eq!(timers.len(), 2);
        Ok(())
    }

    #[test]
    fn concurrent_register_respects_timer_limit() -> Result<()> {
        let clock = manual_clock_at(11_000);
        let mut config = Config::default();
        config.set_max_handover_timers(4);
        let engine = Arc::new(Engine::new(config, clock));

        let workers: Vec<_> = (0..8)
            .map(|_| {
                let engine = engine.clone();
                thread::spawn(move || {
                    (0..8)
                        .map(|_| engine.register(HostRecord::new(10)).unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut with_handover = 0;
        for worker in workers {
            for id in worker.join().unwrap() {
                if engine.handover_stats(id)?.is_some() {
                    with_handover += 1;
                }
            }
        }
        assert_eq!(engine.len(), 64);
        assert_eq!(with_handover, 4);
        assert_eq!(lock(&engine.timers).len(), 5);
        Ok(())
    }

    #[test]
    fn handover_disabled() -> Result<()> {
        let clock = manual_clock_at(12_000);
        let mut config = Config::default();
        config.enable_handover(false);
        let engine = Engine::new(config, clock);

        let id = engine.register(HostRecord::new(10))?;
        assert!(engine.handover_stats(id)?.is_none());
        assert_eq!(engine.timeout(), Some(Duration::from_secs(60)));
        Ok(())
    }

    #[test]
    fn runtime_config_update() -> Result<()> {
        let (engine, _) = new_engine(11_500);
        let id = engine.register(HostRecord::new(10))?;
        assert!(!engine.is_suspended(id)?);

        // A wider window applies on the next check.
        let mut config = (*engine.config()).clone();
        config.set_handover_start_offset(600);
        engine.set_config(config);
        assert_eq!(engine.config().handover().start_offset_ms, 600);

        engine.on_ack(id, Ack::new(1, None))?;
        assert!(engine.is_suspended(id)?);
        Ok(())
    }

    #[test]
    fn not_established_stops_timer() -> Result<()> {
        let (engine, clock) = new_engine(11_700);
        let id = engine.register(HostRecord::new(10))?;
        engine.with_host(id, |h| h.established = false)?;

        fire(&engine, &clock, 100);
        assert!(!engine.is_suspended(id)?);
        assert_eq!(engine.timeout(), Some(Duration::from_millis(59_900)));
        Ok(())
    }

    #[test]
    fn clock_resync_timer() {
        let (engine, clock) = new_engine(0);
        assert_eq!(engine.timeout(), Some(Duration::from_secs(60)));

        // The wall clock steps 250ms ahead.
        clock.set_wall(MINUTE_ALIGNED_WALL + Duration::from_millis(250));
        fire(&engine, &clock, 59_999);
        assert_eq!(engine.time().now(), 59_999);

        fire(&engine, &clock, 1);
        assert_eq!(engine.time().now(), 250);
        assert_eq!(engine.timeout(), Some(Duration::from_secs(60)));
    }

    #[test]
    fn concurrent_ack_and_timer() -> Result<()> {
        let (engine, clock) = new_engine(11_000);
        let engine = Arc::new(engine);
        let ids = (0..4)
            .map(|_| engine.register(HostRecord::new(20)))
            .collect::<Result<Vec<_>>>()?;

        let acker = {
            let engine = engine.clone();
            let ids = ids.clone();
            thread::spawn(move || {
                for _ in 0..500 {
                    for id in &ids {
                        engine.on_ack(*id, Ack::new(1, Some(20_000))).unwrap();
                    }
                }
            })
        };

        for _ in 0..200 {
            fire(&engine, &clock, 10);
        }
        acker.join().unwrap();

        // 13000ms into the interval, all resumed after the window.
        for id in ids {
            engine.on_ack(id, Ack::new(1, None))?;
            assert!(!engine.is_suspended(id)?);
            engine.unregister(id)?;
        }
        assert!(engine.is_empty());
        Ok(())
    }
}
