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

//! Simulate connections over a LEO satellite link with periodic handovers.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use log::debug;
use log::info;
use log::warn;

use leocc::connection::Ack;
use leocc::connection::HostRecord;
use leocc::handover::HandoverSchedule;
use leocc::time_sync::ManualClock;
use leocc::Config;
use leocc::CongestionControlAlgorithm;
use leocc::Engine;
use leocc::Error;
use leocc::TransportHost;
use leocc_tools::Link;
use leocc_tools::Result;

/// Wall clock at a minute boundary.
const WALL_BASE: Duration = Duration::from_secs(1_700_000_040);

/// Monotonic counter at start.
const MONOTONIC_BASE: Duration = Duration::from_secs(1000);

#[derive(Parser, Debug, Clone)]
#[clap(name = "leo_sim")]
pub struct SimOpt {
    /// Congestion control algorithm.
    #[clap(long, default_value = "CUBIC")]
    pub congestion_control_algor: CongestionControlAlgorithm,

    /// Configuration file in JSON. Command line options are applied on top.
    #[clap(long, value_name = "FILE")]
    pub config: Option<String>,

    /// Simulation duration in seconds.
    #[clap(short, long, default_value = "30", value_name = "TIME")]
    pub duration: u64,

    /// Number of concurrent flows.
    #[clap(short, long, default_value = "1", value_name = "NUM")]
    pub flows: usize,

    /// Bottleneck rate in segments per second.
    #[clap(long, default_value = "5000", value_name = "NUM")]
    pub rate: u64,

    /// Round trip propagation delay in milliseconds.
    #[clap(long, default_value = "40", value_name = "TIME")]
    pub rtt: u64,

    /// Bottleneck buffer in segments.
    #[clap(long, default_value = "200", value_name = "NUM")]
    pub buffer: usize,

    /// Random loss probability.
    #[clap(long, default_value = "0", value_name = "PROB")]
    pub loss: f64,

    /// Handover window start before the nominal instant, in milliseconds.
    #[clap(long, value_name = "TIME")]
    pub handover_start_offset: Option<u64>,

    /// Handover window end after the nominal instant, in milliseconds.
    #[clap(long, value_name = "TIME")]
    pub handover_end_offset: Option<u64>,

    /// Disable handover-aware suspension.
    #[clap(long)]
    pub disable_handover: bool,

    /// Position within the wall-clock minute at start, in milliseconds.
    #[clap(long, default_value = "10000", value_name = "TIME")]
    pub start_at: u64,

    /// Window trace interval in milliseconds. "0" disables the trace.
    #[clap(short, long, default_value = "100", value_name = "TIME")]
    pub interval: u64,

    /// Log level, support OFF/ERROR/WARN/INFO/DEBUG/TRACE.
    #[clap(long, default_value = "INFO", value_name = "STR")]
    pub log_level: log::LevelFilter,

    /// Log file path. If no file is specified, logs will be written to `stderr`.
    #[clap(long, value_name = "FILE")]
    pub log_file: Option<String>,
}

/// Sender side state of a simulated flow.
#[derive(Default)]
struct FlowContext {
    id: u64,

    /// Loss recovery ends once this many segments are sent and done.
    recovery_until: Option<u32>,

    /// Segments delivered.
    delivered: u64,

    /// Segments lost.
    lost: u64,

    /// Last suspension state reported.
    suspended: bool,

    /// Window samples for the summary.
    cwnd_samples: Vec<f64>,
}

struct Simulator {
    option: SimOpt,
    clock: Arc<ManualClock>,
    engine: Engine<HostRecord>,
    link: Link,
    flows: Vec<FlowContext>,
    schedule: HandoverSchedule,

    /// Simulated time in microseconds since start.
    now: u64,
}

impl Simulator {
    fn new(option: SimOpt) -> Result<Self> {
        let config = build_config(&option)?;
        let schedule = config.handover_schedule();

        let clock = Arc::new(ManualClock::new(
            WALL_BASE + Duration::from_millis(option.start_at % 60_000),
            MONOTONIC_BASE,
        ));
        let engine = Engine::new(config, clock.clone());

        let mut flows = Vec::with_capacity(option.flows);
        for _ in 0..option.flows {
            let id = engine.register(HostRecord::new(10))?;
            flows.push(FlowContext {
                id,
                ..Default::default()
            });
        }

        let link = Link::new(option.rate, option.rtt, option.buffer, option.loss);
        Ok(Self {
            option,
            clock,
            engine,
            link,
            flows,
            schedule,
            now: 0,
        })
    }

    fn run(&mut self) -> Result<()> {
        let end = self.option.duration * 1_000_000;
        while self.now < end {
            self.process_acks()?;
            self.send()?;
            self.trace()?;

            self.clock.advance(Duration::from_millis(1));
            self.now += 1000;
            self.engine.on_timeout(self.engine.time().monotonic_ms());
        }

        self.report()
    }

    fn process_acks(&mut self) -> Result<()> {
        while let Some(seg) = self.link.poll(self.now) {
            let flow = &mut self.flows[seg.flow];
            let id = flow.id;

            let snd_nxt = self.engine.with_host(id, |h| {
                h.acknowledge(1);
                h.snd_nxt()
            })?;

            if seg.lost {
                flow.lost += 1;
                if flow.recovery_until.is_some() {
                    continue;
                }

                // One reduction per window of data.
                let ssthresh = handle(self.engine.on_congestion_event(id))?.unwrap_or(0);
                if ssthresh != 0 {
                    self.engine.with_host(id, |h| {
                        if h.cwnd != 0 {
                            h.cwnd = ssthresh.max(2);
                        }
                    })?;
                }
                flow.recovery_until = Some(snd_nxt);
                debug!("flow {} loss, ssthresh {}", id, ssthresh);
                continue;
            }

            flow.delivered += 1;
            if let Some(until) = flow.recovery_until {
                let una = self.engine.with_host(id, |h| h.snd_una())?;
                if una.wrapping_sub(until) as i32 >= 0 {
                    flow.recovery_until = None;
                }
            }

            let rtt = (self.now - seg.sent_at) as u32;
            handle(self.engine.on_ack(id, Ack::new(1, Some(rtt))))?;
        }

        Ok(())
    }

    fn send(&mut self) -> Result<()> {
        let outage = self.schedule.inside(self.engine.time().now());

        for (i, flow) in self.flows.iter().enumerate() {
            let quota = self.engine.with_host(flow.id, |h| {
                let quota = h.window().saturating_sub(h.in_flight_segments());
                h.send(quota);
                quota
            })?;

            for _ in 0..quota {
                self.link.send(i, self.now, outage);
            }
        }

        Ok(())
    }

    fn trace(&mut self) -> Result<()> {
        let ms = self.now / 1000;
        for flow in self.flows.iter_mut() {
            let suspended = self.engine.is_suspended(flow.id)?;
            if suspended != flow.suspended {
                info!(
                    "t={}ms flow {} {} at flow clock {}",
                    ms,
                    flow.id,
                    if suspended { "suspended" } else { "resumed" },
                    self.engine.time().now()
                );
                flow.suspended = suspended;
            }

            if self.option.interval == 0 || ms % self.option.interval != 0 {
                continue;
            }

            let (cwnd, ssthresh, in_flight) = self
                .engine
                .with_host(flow.id, |h| (h.cwnd, h.ssthresh, h.in_flight))?;
            flow.cwnd_samples.push(cwnd as f64);
            println!(
                "{:>8} {:>6} {:>8} {:>10} {:>8} {:>9}",
                ms, flow.id, cwnd, ssthresh, in_flight, suspended
            );
        }

        Ok(())
    }

    fn report(&mut self) -> Result<()> {
        let secs = self.option.duration.max(1) as f64;
        for flow in self.flows.iter() {
            let stats = self.engine.stats(flow.id)?;
            println!(
                "flow {}: delivered {} lost {} goodput {:.1} seg/s congestion events {} slow start exits {}",
                flow.id,
                flow.delivered,
                flow.lost,
                flow.delivered as f64 / secs,
                stats.congestion_events,
                stats.slow_start_exits,
            );
            if let Some(h) = self.engine.handover_stats(flow.id)? {
                println!(
                    "\thandover: suspensions {} resumptions {} corrections {}",
                    h.suspensions, h.resumptions, h.corrections
                );
            }
            leocc_tools::print_summary("\tcwnd (segments)", &flow.cwnd_samples);
        }

        for flow in self.flows.drain(..) {
            self.engine.unregister(flow.id)?;
        }
        Ok(())
    }
}

/// Log recoverable engine errors, pass the others up.
fn handle<T>(res: std::result::Result<T, Error>) -> Result<Option<T>> {
    match res {
        Ok(v) => Ok(Some(v)),
        Err(e) if e.is_recoverable() => {
            warn!("engine error: {}", e);
            Ok(None)
        }
        Err(e) => Err(e.into()),
    }
}

fn build_config(option: &SimOpt) -> Result<Config> {
    let mut config = match &option.config {
        Some(path) => Config::from_file(path)?,
        None => Config::new(),
    };

    config.set_congestion_control_algorithm(option.congestion_control_algor);
    if let Some(v) = option.handover_start_offset {
        config.set_handover_start_offset(v);
    }
    if let Some(v) = option.handover_end_offset {
        config.set_handover_end_offset(v);
    }
    if option.disable_handover {
        config.enable_handover(false);
    }

    Ok(config)
}

fn main() -> Result<()> {
    let option = SimOpt::parse();

    env_logger::builder()
        .target(leocc_tools::log_target(&option.log_file)?)
        .filter_level(option.log_level)
        .format_timestamp_millis()
        .init();

    let mut sim = Simulator::new(option)?;
    println!(
        "{:>8} {:>6} {:>8} {:>10} {:>8} {:>9}",
        "ms", "flow", "cwnd", "ssthresh", "inflight", "suspended"
    );
    sim.run()
}
