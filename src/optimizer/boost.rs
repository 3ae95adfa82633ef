use chrono::{DateTime, FixedOffset};
use ordered_float::OrderedFloat;
use tracing::debug;

use super::SchedulerConstraints;
use crate::domain::{BoostPlan, BoostRequest, BoostWindow, PartialFulfillment, PriceSlot};

/// Picks the cheapest price slots that deliver a requested amount of energy.
///
/// Slots are taken in ascending price order (earliest first on equal price) until the
/// target is met. All slots of one run share a single rate, so the cheapest `k` slots
/// are the cheapest way to deliver `k` slots' worth of energy. Once the target is met,
/// slots with a negative price are still taken.
///
/// `horizon_start` is passed in rather than read from the clock.
#[derive(Debug, Clone, Default)]
pub struct BoostScheduler {
    pub constraints: SchedulerConstraints,
}

impl BoostScheduler {
    pub fn new(constraints: SchedulerConstraints) -> Self {
        Self { constraints }
    }

    pub fn schedule(
        &self,
        slots: &[PriceSlot],
        request: &BoostRequest,
        horizon_start: DateTime<FixedOffset>,
    ) -> BoostPlan {
        if request.is_noop() {
            return BoostPlan::empty(true);
        }

        let target = request.energy_target_kwh;
        let eps = self.constraints.epsilon_kwh;
        let rate_kw = request.rate_kw.unwrap_or(self.constraints.default_rate_kw);
        if !(rate_kw.is_finite() && rate_kw > 0.0) {
            let mut plan = BoostPlan::empty(request.clear_existing);
            plan.shortfall = Some(PartialFulfillment {
                target_kwh: target,
                delivered_kwh: 0.0,
                shortfall_kwh: target,
            });
            return plan;
        }

        let candidates = Self::candidates(slots, request, horizon_start);
        debug!(
            n_slots = slots.len(),
            n_candidates = candidates.len(),
            target_kwh = target,
            rate_kw,
            "selecting boost slots"
        );

        let mut windows: Vec<BoostWindow> = Vec::new();
        let mut delivered = 0.0;
        let mut cost = 0.0;
        for slot in candidates {
            let target_met = delivered >= target - eps;
            if target_met && slot.unit_price >= 0.0 {
                break;
            }
            if !self.try_add(&mut windows, slot, rate_kw) {
                debug!(start = %slot.start, price = slot.unit_price, "no boost timer left for slot");
                continue;
            }
            let energy = slot.duration.as_hours_f64() * rate_kw;
            delivered += energy;
            cost += energy * slot.unit_price;
        }
        windows.sort_by_key(|w| w.start);

        let shortfall = (delivered < target - eps).then(|| PartialFulfillment {
            target_kwh: target,
            delivered_kwh: delivered,
            shortfall_kwh: target - delivered,
        });

        BoostPlan {
            windows,
            delivered_kwh: delivered,
            estimated_cost: cost,
            shortfall,
            replace_existing: request.clear_existing,
        }
    }

    /// Usable slots, cheapest first, earliest first among equal prices
    fn candidates<'a>(
        slots: &'a [PriceSlot],
        request: &BoostRequest,
        horizon_start: DateTime<FixedOffset>,
    ) -> Vec<&'a PriceSlot> {
        let mut candidates: Vec<&PriceSlot> = slots
            .iter()
            .filter(|s| s.start >= horizon_start)
            .filter(|s| request.complete_by.map_or(true, |by| s.end() <= by))
            .filter(|s| s.duration.as_seconds() > 0 && s.unit_price.is_finite())
            .collect();
        candidates.sort_by_key(|s| (OrderedFloat(s.unit_price), s.start));
        candidates
    }

    /// Extend an adjacent window with the slot, or open a new one if a timer is free
    fn try_add(&self, windows: &mut Vec<BoostWindow>, slot: &PriceSlot, rate_kw: f64) -> bool {
        for i in 0..windows.len() {
            let (start, end, duration) = (windows[i].start, windows[i].end(), windows[i].duration);
            if !same_rate(windows[i].rate_kw, rate_kw)
                || !self.constraints.fits_window(duration + slot.duration)
            {
                continue;
            }
            if end == slot.start {
                windows[i].duration = duration + slot.duration;
            } else if slot.end() == start {
                windows[i].start = slot.start;
                windows[i].duration = duration + slot.duration;
            } else {
                continue;
            }
            self.coalesce(windows, i);
            return true;
        }

        if self.constraints.has_free_window(windows.len()) {
            windows.push(BoostWindow {
                start: slot.start,
                duration: slot.duration,
                rate_kw,
            });
            return true;
        }
        false
    }

    /// Fold any window that now touches `windows[i]` into it
    fn coalesce(&self, windows: &mut Vec<BoostWindow>, mut i: usize) {
        loop {
            let current = windows[i].clone();
            let neighbour = (0..windows.len()).find(|&j| {
                let w = &windows[j];
                j != i
                    && same_rate(w.rate_kw, current.rate_kw)
                    && (w.end() == current.start || current.end() == w.start)
                    && self.constraints.fits_window(w.duration + current.duration)
            });
            let Some(j) = neighbour else { return };

            let other = windows.remove(j);
            if j < i {
                i -= 1;
            }
            let merged = &mut windows[i];
            merged.start = merged.start.min(other.start);
            merged.duration = merged.duration + other.duration;
        }
    }
}

fn same_rate(a: f64, b: f64) -> bool {
    (a - b).abs() < 1e-9
}
