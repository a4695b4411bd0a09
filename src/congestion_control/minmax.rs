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

//! A windowed min/max estimator, based on Kathleen Nichols' algorithm.
//! Refer to <https://groups.google.com/g/bbr-dev/c/3RTgkzi5ZD8>.
//!
//! It keeps the best, 2nd best and 3rd best samples in a window of time,
//! with the measurement time of the n'th best not earlier than the n-1'th
//! best. A new best sample makes everything earlier worthless, so the
//! estimator restarts from it. Constant space and time per update.
//!
//! Times are wrapping `u32` counters (round trips, ticks) like the rest of
//! the engine's clocks.

/// Which extreme the estimator tracks.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Extreme {
    Min,
    Max,
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
struct Sample {
    /// Measurement time.
    t: u32,

    /// Measured value.
    v: u32,
}

#[derive(Debug, Clone)]
pub struct MinMax {
    extreme: Extreme,

    /// Length of the window, in the unit of the sample times.
    window: u32,

    /// The best, second best, third best samples.
    samples: [Sample; 3],
}

impl MinMax {
    /// Create a running max estimator.
    pub fn max(window: u32) -> Self {
        Self::new(Extreme::Max, window)
    }

    /// Create a running min estimator.
    pub fn min(window: u32) -> Self {
        Self::new(Extreme::Min, window)
    }

    fn new(extreme: Extreme, window: u32) -> Self {
        Self {
            extreme,
            window,
            samples: [Sample::default(); 3],
        }
    }

    pub fn window(&self) -> u32 {
        self.window
    }

    /// Forget every sample and restart from the given one.
    pub fn reset(&mut self, t: u32, v: u32) -> u32 {
        self.samples = [Sample { t, v }; 3];
        v
    }

    /// The current best value.
    pub fn get(&self) -> u32 {
        self.samples[0].v
    }

    /// Add a measurement and return the best value in the window.
    pub fn update(&mut self, t: u32, v: u32) -> u32 {
        let sample = Sample { t, v };

        if self.better(v, self.samples[0].v)
            || t.wrapping_sub(self.samples[2].t) > self.window
        {
            return self.reset(t, v);
        }

        if self.better(v, self.samples[1].v) {
            self.samples[2] = sample;
            self.samples[1] = sample;
        } else if self.better(v, self.samples[2].v) {
            self.samples[2] = sample;
        }

        self.subwin_update(sample)
    }

    fn better(&self, a: u32, b: u32) -> bool {
        match self.extreme {
            Extreme::Max => a >= b,
            Extreme::Min => a <= b,
        }
    }

    /// As time advances, promote the 2nd and 3rd choices.
    fn subwin_update(&mut self, sample: Sample) -> u32 {
        let dt = sample.t.wrapping_sub(self.samples[0].t);

        if dt > self.window {
            // The best sample aged out; the 2nd and 3rd choices move up.
            // The new 1st choice may be out of the window too.
            self.samples[0] = self.samples[1];
            self.samples[1] = self.samples[2];
            self.samples[2] = sample;
            if sample.t.wrapping_sub(self.samples[0].t) > self.window {
                self.samples[0] = self.samples[1];
                self.samples[1] = self.samples[2];
                self.samples[2] = sample;
            }
        } else if self.samples[1].t == self.samples[0].t && dt > self.window / 4 {
            // A quarter of the window passed without a new 2nd choice.
            self.samples[2] = sample;
            self.samples[1] = sample;
        } else if self.samples[2].t == self.samples[1].t && dt > self.window / 2 {
            // Half the window passed without a new 3rd choice.
            self.samples[2] = sample;
        }

        self.samples[0].v
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minmax_running_max() {
        let mut bw = MinMax::max(10);
        assert_eq!(bw.window(), 10);
        assert_eq!(bw.get(), 0);

        assert_eq!(bw.update(1, 200), 200);
        assert_eq!(bw.update(2, 150), 200);
        // A quarter of the window later, 150 stays as a fallback.
        assert_eq!(bw.update(4, 120), 200);
        assert_eq!(bw.samples[1].v, 120);

        // The max ages out after the window.
        assert_eq!(bw.update(12, 100), 120);
        assert_eq!(bw.update(15, 90), 100);

        // A new max restarts the estimator.
        assert_eq!(bw.update(16, 300), 300);
        assert_eq!(bw.samples, [Sample { t: 16, v: 300 }; 3]);

        // Nothing left in the window.
        assert_eq!(bw.update(40, 50), 50);
    }

    #[test]
    fn minmax_running_min() {
        let mut rtt = MinMax::min(100);

        // A min estimator starts from its first sample.
        assert_eq!(rtt.update(0, 40), 0);
        assert_eq!(rtt.reset(0, 40), 40);
        assert_eq!(rtt.update(10, 60), 40);
        assert_eq!(rtt.update(20, 30), 30);
        assert_eq!(rtt.update(60, 50), 30);
        assert_eq!(rtt.update(130, 55), 50);
    }

    #[test]
    fn minmax_time_wraps() {
        let mut bw = MinMax::max(10);
        bw.reset(u32::MAX - 2, 500);
        assert_eq!(bw.update(2, 100), 500);
        assert_eq!(bw.update(9, 90), 100);
    }
}
