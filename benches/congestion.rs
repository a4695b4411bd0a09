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

use std::sync::Arc;
use std::time::Duration;

use criterion::black_box;
use criterion::criterion_group;
use criterion::criterion_main;
use criterion::Criterion;

use leocc::congestion_control::cubic_root;
use leocc::congestion_control::Cubic;
use leocc::congestion_control::CubicConfig;
use leocc::connection::Ack;
use leocc::connection::HostRecord;
use leocc::time_sync::ManualClock;
use leocc::time_sync::Stamp;
use leocc::timer_queue::TimerQueue;
use leocc::Config;
use leocc::CongestionController;
use leocc::Engine;

pub fn cubic_root_benchmark(c: &mut Criterion) {
    c.bench_function("cubic root", |b| {
        let mut a: u64 = 1;
        b.iter(|| {
            a = a.wrapping_mul(6364136223846793005).wrapping_add(1);
            black_box(cubic_root(a >> 20))
        })
    });
}

pub fn cubic_on_ack_benchmark(c: &mut Criterion) {
    let config = Config::new();
    let mut cubic = Cubic::new(CubicConfig::from(config.congestion()));
    let mut host = HostRecord::new(10);
    host.ssthresh = 100;
    host.cwnd = 100;
    cubic.init(&mut host, Stamp::new(0, 0));
    cubic.on_congestion_event(&host, Stamp::new(0, 0));

    let mut ticks = 0_u32;
    c.bench_function("cubic on_ack", |b| {
        b.iter(|| {
            ticks = ticks.wrapping_add(1);
            host.in_flight = host.cwnd;
            cubic.on_ack(&mut host, 1, Stamp::new(ticks, ticks.wrapping_mul(1000)));
            // Keep the window in a steady range.
            if host.cwnd > 10_000 {
                host.cwnd = 100;
            }
        })
    });
}

pub fn engine_on_ack_benchmark(c: &mut Criterion) {
    let clock = Arc::new(ManualClock::new(
        Duration::from_secs(1_700_000_040),
        Duration::from_secs(1000),
    ));
    let engine = Engine::new(Config::new(), clock.clone());
    let id = match engine.register(HostRecord::new(10)) {
        Ok(id) => id,
        Err(e) => panic!("register: {}", e),
    };

    c.bench_function("engine on_ack", |b| {
        b.iter(|| {
            let _ = engine.with_host(id, |h| {
                h.send(2);
                h.acknowledge(1);
            });
            black_box(engine.on_ack(id, Ack::new(1, Some(40_000)))).ok();
        })
    });
}

pub fn timer_queue_benchmark(c: &mut Criterion) {
    let mut tq = TimerQueue::new();
    const RANGE: u64 = 10_000;
    for i in 0..RANGE {
        tq.add(i, i * 15);
    }

    c.bench_function("timer queue remaining", |b| {
        b.iter(|| tq.time_remaining(black_box(1000)))
    });
}

criterion_group!(
    benches,
    cubic_root_benchmark,
    cubic_on_ack_benchmark,
    engine_on_ack_benchmark,
    timer_queue_benchmark,
);
criterion_main!(benches);
