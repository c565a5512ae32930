//! Purchase-date scheduling from a campaign's distribution rules.
//!
//! Candidate days come from the rules alone; the current load per day comes
//! from already-scheduled sessions via [`ScheduledLoad`]. The earliest
//! candidate day that still has spare capacity wins.

use std::collections::{BTreeMap, HashMap};

use chrono::{Datelike, Days, NaiveDate};
use tracing::{debug, warn};

use tryout_campaigns::{Distribution, DistributionRule};

/// Read-only view of how many sessions are already scheduled on a day.
pub trait ScheduledLoad {
    type Error;

    fn scheduled_on(&self, date: NaiveDate) -> Result<u32, Self::Error>;
}

impl ScheduledLoad for HashMap<NaiveDate, u32> {
    type Error = core::convert::Infallible;

    fn scheduled_on(&self, date: NaiveDate) -> Result<u32, Self::Error> {
        Ok(self.get(&date).copied().unwrap_or(0))
    }
}

/// Next occurrence of `day_of_week` (0 = Sunday) strictly after `today`.
fn next_weekday(today: NaiveDate, day_of_week: u8) -> Option<NaiveDate> {
    let current = today.weekday().num_days_from_sunday();
    let target = u32::from(day_of_week % 7);
    let ahead = match (target + 7 - current) % 7 {
        0 => 7,
        n => n,
    };
    today.checked_add_days(Days::new(u64::from(ahead)))
}

/// Candidate purchase days with their capacity, earliest first.
///
/// Same-day is never a candidate: a recurring rule matching today's weekday
/// yields next week, and a specific date must be strictly in the future. When
/// two rules land on the same day the larger capacity applies; zero-capacity
/// days are dropped.
pub fn candidate_dates(distributions: &[Distribution], today: NaiveDate) -> Vec<(NaiveDate, u32)> {
    let mut by_day: BTreeMap<NaiveDate, u32> = BTreeMap::new();

    for distribution in distributions {
        let date = match distribution.rule {
            DistributionRule::Recurring { day_of_week } => next_weekday(today, day_of_week),
            DistributionRule::SpecificDate { date } => (date > today).then_some(date),
        };
        if let Some(date) = date {
            let capacity = by_day.entry(date).or_insert(0);
            *capacity = (*capacity).max(distribution.max_units);
        }
    }

    by_day.into_iter().filter(|(_, capacity)| *capacity > 0).collect()
}

/// Pick the purchase date for a newly accepted session.
///
/// Returns `Ok(None)` (and logs a warning) when no rule yields a day with spare
/// capacity; the caller decides how to proceed.
pub fn next_purchase_date<L>(
    distributions: &[Distribution],
    today: NaiveDate,
    load: &L,
) -> Result<Option<NaiveDate>, L::Error>
where
    L: ScheduledLoad + ?Sized,
{
    let candidates = candidate_dates(distributions, today);
    if candidates.is_empty() {
        warn!(%today, rules = distributions.len(), "no distribution rule yields a future purchase date");
        return Ok(None);
    }

    for (date, capacity) in &candidates {
        let booked = load.scheduled_on(*date)?;
        if booked < *capacity {
            return Ok(Some(*date));
        }
        debug!(%date, booked, capacity, "distribution day at capacity");
    }

    warn!(%today, candidates = candidates.len(), "every distribution day is at capacity");
    Ok(None)
}
