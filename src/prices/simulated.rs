use async_trait::async_trait;
use chrono::{DateTime, DurationRound, FixedOffset, Local, Timelike};

use crate::domain::{Duration, PriceRegion, PriceScheduleProvider, PriceSlot};
use crate::error::ProviderError;

/// Deterministic half-hourly prices for development and dry runs: cheap overnight,
/// expensive in the early evening peak
#[derive(Debug, Clone)]
pub struct SimulatedPriceProvider {
    pub base_price: f64,
    pub overnight_price: f64,
    pub peak_price: f64,
    /// Number of half-hour slots returned, starting with the current one
    pub horizon_slots: usize,
}

impl Default for SimulatedPriceProvider {
    fn default() -> Self {
        Self {
            base_price: 22.0,
            overnight_price: 8.0,
            peak_price: 38.0,
            horizon_slots: 48,
        }
    }
}

impl SimulatedPriceProvider {
    pub fn price_at(&self, start: DateTime<FixedOffset>) -> f64 {
        let half_hour = start.hour() * 2 + start.minute() / 30;
        // Small repeatable ripple so slots are not all tied
        let ripple = f64::from(half_hour % 5) * 0.4;
        match start.hour() {
            0..=4 => self.overnight_price + ripple,
            16..=18 => self.peak_price + ripple,
            _ => self.base_price + ripple,
        }
    }

    pub fn slots_from(&self, start: DateTime<FixedOffset>) -> Vec<PriceSlot> {
        let first = start
            .duration_trunc(chrono::Duration::minutes(30))
            .unwrap_or(start);
        (0..self.horizon_slots as i32)
            .map(|i| {
                let slot_start = first + chrono::Duration::minutes(30 * i64::from(i));
                PriceSlot::new(slot_start, Duration::minutes(30), self.price_at(slot_start))
            })
            .collect()
    }
}

#[async_trait]
impl PriceScheduleProvider for SimulatedPriceProvider {
    async fn fetch(&self, _region: PriceRegion) -> Result<Vec<PriceSlot>, ProviderError> {
        Ok(self.slots_from(Local::now().fixed_offset()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_slots_are_contiguous_and_aligned() {
        let p = SimulatedPriceProvider::default();
        let start = FixedOffset::east_opt(0)
            .unwrap()
            .with_ymd_and_hms(2024, 3, 1, 21, 47, 12)
            .unwrap();
        let slots = p.slots_from(start);

        assert_eq!(slots.len(), 48);
        assert_eq!(slots[0].start.minute(), 30);
        assert_eq!(slots[0].start.second(), 0);
        for pair in slots.windows(2) {
            assert_eq!(pair[0].end(), pair[1].start);
        }
    }

    #[test]
    fn test_overnight_is_cheapest() {
        let p = SimulatedPriceProvider::default();
        let tz = FixedOffset::east_opt(0).unwrap();
        let night = p.price_at(tz.with_ymd_and_hms(2024, 3, 1, 2, 0, 0).unwrap());
        let day = p.price_at(tz.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap());
        let peak = p.price_at(tz.with_ymd_and_hms(2024, 3, 1, 17, 30, 0).unwrap());
        assert!(night < day && day < peak);
    }
}
