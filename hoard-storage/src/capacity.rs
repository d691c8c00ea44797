// Copyright 2025 hoard Project Authors
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

/// Default near-eviction threshold, in percent of the capacity.
pub const DEFAULT_NEAR_EVICTION_PERCENT: u8 = 90;

/// Admission decision for an incoming mutation.
///
/// The three-way outcome is load-bearing: callers must distinguish a hard capacity failure from
/// a soft warning that still lets the write proceed, because a cache under an active eviction
/// run must keep accepting writes while eviction catches up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// There is room for the incoming bytes.
    Admit,
    /// The write may proceed, but usage crosses the near-eviction threshold.
    AdmitNearEviction,
    /// The incoming bytes exceed the capacity.
    Reject,
}

/// Size accounting and admission control shared by every backend.
///
/// A backend owns one gauge and mutates it only under its index lock, so `used` always equals
/// the sum of `key weight + value weight` over the live entries.
#[derive(Debug)]
pub struct SizeGauge {
    used: usize,
    max: usize,
    threshold: usize,
    near_eviction_reported: bool,
}

impl SizeGauge {
    /// Create a gauge with the given capacity and near-eviction threshold percent.
    pub fn new(max: usize, near_eviction_percent: u8) -> Self {
        let percent = near_eviction_percent.min(100) as u128;
        let threshold = (max as u128 * percent / 100) as usize;
        Self {
            used: 0,
            max,
            threshold,
            near_eviction_reported: false,
        }
    }

    /// Decide whether a mutation bringing `incoming` bytes may proceed.
    ///
    /// `incoming` is `key weight + value weight` for a fresh entry, or the weight delta for an
    /// overwrite. `extend` permits temporary overflow past the capacity.
    pub fn admit(&mut self, incoming: isize, extend: bool) -> Admission {
        let projected = self.used.saturating_add_signed(incoming);
        if projected > self.max && !extend {
            return Admission::Reject;
        }
        if projected >= self.threshold {
            self.near_eviction_reported = true;
            return Admission::AdmitNearEviction;
        }
        Admission::Admit
    }

    /// Account for stored bytes.
    pub fn charge(&mut self, delta: usize) {
        self.used += delta;
    }

    /// Account for released bytes.
    pub fn credit(&mut self, delta: usize) {
        self.used = self.used.saturating_sub(delta);
    }

    /// Account for an overwrite delta.
    pub fn apply(&mut self, delta: isize) {
        self.used = self.used.saturating_add_signed(delta);
    }

    /// Reset the accounting after a `clear`.
    pub fn reset(&mut self) {
        self.used = 0;
        self.near_eviction_reported = false;
    }

    /// Bytes consumed by live entries.
    pub fn usage(&self) -> usize {
        self.used
    }

    /// Configured capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.max
    }

    /// Whether usage has crossed the near-eviction threshold since the last reset.
    ///
    /// Sticky: stays set until [`SizeGauge::reset_near_eviction`] or [`SizeGauge::reset`], so the
    /// eviction-policy collaborator observes the signal even if it polls infrequently.
    pub fn near_eviction_reported(&self) -> bool {
        self.near_eviction_reported
    }

    /// Acknowledge the near-eviction signal.
    pub fn reset_near_eviction(&mut self) {
        self.near_eviction_reported = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_admission_three_way() {
        let mut gauge = SizeGauge::new(1000, 90);

        assert_eq!(gauge.admit(502, false), Admission::Admit);
        gauge.charge(502);
        assert!(!gauge.near_eviction_reported());

        // 502 + 422 = 924 >= 900
        assert_eq!(gauge.admit(422, false), Admission::AdmitNearEviction);
        gauge.charge(422);
        assert!(gauge.near_eviction_reported());

        // 924 + 202 = 1126 > 1000
        assert_eq!(gauge.admit(202, false), Admission::Reject);
        assert_eq!(gauge.usage(), 924);
    }

    #[test]
    fn test_extend_permits_overflow() {
        let mut gauge = SizeGauge::new(100, 90);
        gauge.charge(95);
        assert_eq!(gauge.admit(50, false), Admission::Reject);
        assert_eq!(gauge.admit(50, true), Admission::AdmitNearEviction);
    }

    #[test]
    fn test_admission_monotonicity() {
        // Reject whenever used + incoming > max and extend is off, for a sweep of inputs.
        for max in [10usize, 100, 1000] {
            let mut gauge = SizeGauge::new(max, 90);
            for used in (0..=max).step_by(max / 10) {
                gauge.reset();
                gauge.charge(used);
                for incoming in 0..=max * 2 {
                    let admission = gauge.admit(incoming as isize, false);
                    if used + incoming > max {
                        assert_eq!(admission, Admission::Reject);
                    } else {
                        assert_ne!(admission, Admission::Reject);
                    }
                }
            }
        }
    }

    #[test]
    fn test_sticky_flag_reset() {
        let mut gauge = SizeGauge::new(100, 50);
        assert_eq!(gauge.admit(60, false), Admission::AdmitNearEviction);
        gauge.charge(60);
        gauge.credit(60);
        // dropping below the threshold does not clear the signal
        assert!(gauge.near_eviction_reported());
        gauge.reset_near_eviction();
        assert!(!gauge.near_eviction_reported());
    }

    #[test]
    fn test_overwrite_delta() {
        let mut gauge = SizeGauge::new(1000, 90);
        gauge.charge(300);
        gauge.apply(-100);
        assert_eq!(gauge.usage(), 200);
        gauge.apply(50);
        assert_eq!(gauge.usage(), 250);
    }
}
