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

//! Flow clock anchored to wall-clock time.
//!
//! Handovers happen at fixed offsets within each wall-clock minute, but the
//! engine runs on a monotonic tick counter. `TimeSync` keeps an offset
//! between the two so that `now()` yields the position within the current
//! minute, and refreshes that offset once per sync period to absorb drift
//! between the monotonic counter and the wall clock.

use std::sync::atomic::AtomicI64;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;
use std::time::SystemTime;

use log::*;

/// Milliseconds per minute. The flow clock wraps at this value.
pub const MS_PER_MIN: u64 = 60_000;

/// Default period between two offset recomputations.
pub const DEFAULT_SYNC_PERIOD: Duration = Duration::from_secs(60);

/// A source of monotonic and wall-clock time.
pub trait ClockSource: Send + Sync {
    /// Monotonic time elapsed since an arbitrary, fixed origin.
    fn monotonic(&self) -> Duration;

    /// Wall-clock time elapsed since the UNIX epoch.
    fn wall(&self) -> Duration;
}

/// Clock source backed by `Instant` and `SystemTime`.
#[derive(Debug)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ClockSource for SystemClock {
    fn monotonic(&self) -> Duration {
        self.origin.elapsed()
    }

    fn wall(&self) -> Duration {
        // A wall clock set before 1970 is treated as the epoch itself.
        SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
    }
}

/// Clock source driven by hand, for simulations and tests.
///
/// Both clocks advance together through `advance()`; `set_wall()` moves the
/// wall clock alone, which is how drift and wall-clock steps are modelled.
#[derive(Debug, Default)]
pub struct ManualClock {
    /// Monotonic time in microseconds.
    monotonic_us: AtomicU64,

    /// Wall-clock time in microseconds.
    wall_us: AtomicU64,
}

impl ManualClock {
    pub fn new(wall: Duration, monotonic: Duration) -> Self {
        Self {
            monotonic_us: AtomicU64::new(monotonic.as_micros() as u64),
            wall_us: AtomicU64::new(wall.as_micros() as u64),
        }
    }

    /// Advance both the monotonic and the wall clock.
    pub fn advance(&self, d: Duration) {
        let us = d.as_micros() as u64;
        self.monotonic_us.fetch_add(us, Ordering::Relaxed);
        self.wall_us.fetch_add(us, Ordering::Relaxed);
    }

    /// Step the wall clock without touching the monotonic clock.
    pub fn set_wall(&self, wall: Duration) {
        self.wall_us
            .store(wall.as_micros() as u64, Ordering::Relaxed);
    }
}

impl ClockSource for ManualClock {
    fn monotonic(&self) -> Duration {
        Duration::from_micros(self.monotonic_us.load(Ordering::Relaxed))
    }

    fn wall(&self) -> Duration {
        Duration::from_micros(self.wall_us.load(Ordering::Relaxed))
    }
}

/// One reading of the scheduling tick counter and the microsecond counter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stamp {
    /// Milliseconds, wrapping at 2^32.
    pub ticks: u32,

    /// Microseconds, wrapping at 2^32.
    pub micros: u32,
}

impl Stamp {
    pub fn new(ticks: u32, micros: u32) -> Self {
        Self { ticks, micros }
    }
}

/// Process-wide flow clock.
///
/// The offset is a single atomic cell updated without any lock. A reader may
/// observe an offset that is stale by at most one sync period.
pub struct TimeSync {
    clock: Arc<dyn ClockSource>,

    /// Wall-clock-to-monotonic correction in milliseconds.
    base_offset: AtomicI64,

    /// Sync period in milliseconds.
    period: u64,

    /// Monotonic deadline of the next resync in milliseconds.
    next_sync: AtomicU64,
}

impl TimeSync {
    /// Create a flow clock and synchronize it immediately.
    pub fn new(clock: Arc<dyn ClockSource>, period: Duration) -> Self {
        let period = (period.as_millis() as u64).max(1);
        let ts = Self {
            clock,
            base_offset: AtomicI64::new(0),
            period,
            next_sync: AtomicU64::new(0),
        };
        ts.sync();
        ts.next_sync
            .store(ts.monotonic_ms() + period, Ordering::Relaxed);

        ts
    }

    /// The underlying clock source.
    pub fn clock(&self) -> &Arc<dyn ClockSource> {
        &self.clock
    }

    /// Raw monotonic counter in milliseconds.
    pub fn monotonic_ms(&self) -> u64 {
        self.clock.monotonic().as_millis() as u64
    }

    /// Scheduling tick counter, one tick per millisecond, wrapping at 2^32.
    pub fn ticks(&self) -> u32 {
        self.monotonic_ms() as u32
    }

    /// Microsecond stamp, wrapping at 2^32.
    pub fn micros(&self) -> u32 {
        self.clock.monotonic().as_micros() as u32
    }

    /// Read both counters from a single clock sample.
    pub fn stamp(&self) -> Stamp {
        let t = self.clock.monotonic();
        Stamp::new(t.as_millis() as u32, t.as_micros() as u32)
    }

    /// Current offset between the wall-clock minute and the monotonic counter.
    pub fn offset(&self) -> i64 {
        self.base_offset.load(Ordering::Relaxed)
    }

    /// Position within the current wall-clock minute, in milliseconds.
    pub fn now(&self) -> u64 {
        let t = self.offset() + self.monotonic_ms() as i64;
        t.rem_euclid(MS_PER_MIN as i64) as u64
    }

    /// Recompute the offset from the wall clock and return it.
    ///
    /// Everything above the minute is dropped from the wall-clock reading, so
    /// the offset may be negative; `now()` folds it back into the minute.
    pub fn sync(&self) -> i64 {
        let wall = self.clock.wall();
        let wall_ms = (wall.as_secs() % 60) * 1000 + wall.subsec_millis() as u64;
        let offset = wall_ms as i64 - self.monotonic_ms() as i64;

        let old = self.base_offset.swap(offset, Ordering::Relaxed);
        let mut drift = (offset - old).rem_euclid(MS_PER_MIN as i64);
        if drift >= MS_PER_MIN as i64 / 2 {
            drift -= MS_PER_MIN as i64;
        }
        debug!(
            "time sync: old offset {} new offset {} drift {}ms",
            old, offset, drift
        );

        offset
    }

    /// Monotonic deadline of the next resync, in milliseconds.
    pub fn next_sync(&self) -> u64 {
        self.next_sync.load(Ordering::Relaxed)
    }

    /// Sync period in milliseconds.
    pub fn period(&self) -> u64 {
        self.period
    }

    /// Resync if the deadline has passed, re-arming the next one.
    ///
    /// Return true if a resync happened.
    pub fn on_timeout(&self, now: u64) -> bool {
        if now < self.next_sync() {
            return false;
        }

        // Re-arm first, then recompute.
        self.next_sync.store(now + self.period, Ordering::Relaxed);
        self.sync();
        true
    }
}

impl std::fmt::Debug for TimeSync {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "TimeSync ")?;
        write!(f, "offset={} ", self.offset())?;
        write!(f, "period={} ", self.period)?;
        write!(f, "next_sync={}", self.next_sync())?;

        Ok(())
    }
}
