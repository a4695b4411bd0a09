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

#![no_main]

use std::sync::Arc;
use std::time::Duration;

use lazy_static::lazy_static;
use libfuzzer_sys::fuzz_target;

use leocc::connection::Ack;
use leocc::connection::HostRecord;
use leocc::time_sync::ManualClock;
use leocc::Config;
use leocc::CongestionControlAlgorithm;
use leocc::Engine;
use leocc::TransportHost;

lazy_static! {
    static ref CONFIG: Config = {
        let mut conf = Config::new();
        conf.set_max_handover_timers(4);
        conf
    };
}

fuzz_target!(|data: &[u8]| {
    let mut conf = CONFIG.clone();
    if data.first().map_or(false, |b| b & 1 == 1) {
        conf.set_congestion_control_algorithm(CongestionControlAlgorithm::Bbr);
    }

    let clock = Arc::new(ManualClock::new(
        Duration::from_secs(1_700_000_040),
        Duration::from_secs(1000),
    ));
    let engine: Engine<HostRecord> = Engine::new(conf, clock.clone());
    let mut ids = Vec::new();

    for op in data.chunks(2) {
        let (code, arg) = (op[0], op.get(1).copied().unwrap_or(0) as u32);
        let id = ids
            .get(arg as usize % ids.len().max(1))
            .copied()
            .unwrap_or(u64::MAX);

        match code % 9 {
            0 => {
                if let Ok(id) = engine.register(HostRecord::new(arg % 64 + 1)) {
                    ids.push(id);
                }
            }
            1 => {
                let _ = engine.with_host(id, |h| h.send(arg % 32));
            }
            2 => {
                let _ = engine.with_host(id, |h| h.acknowledge(arg % 8 + 1));
                let _ = engine.on_ack(id, Ack::new(arg % 8 + 1, Some(arg * 1000)));
            }
            3 => {
                if let Ok(ssthresh) = engine.on_congestion_event(id) {
                    let _ = engine.with_host(id, |h| {
                        if h.window() != 0 {
                            h.set_window(ssthresh);
                        }
                    });
                }
            }
            4 => {
                let _ = engine.on_loss_state(id);
            }
            5 => {
                let _ = engine.undo_window(id);
            }
            6 => {
                let _ = engine.on_tx_start(id, arg);
            }
            7 => {
                clock.advance(Duration::from_millis(arg as u64 * 16));
                engine.on_timeout(engine.time().monotonic_ms());
            }
            _ => {
                if engine.unregister(id).is_ok() {
                    ids.retain(|&x| x != id);
                }
            }
        }
    }

    for id in ids {
        let _ = engine.unregister(id);
    }
    assert!(engine.is_empty());
});
