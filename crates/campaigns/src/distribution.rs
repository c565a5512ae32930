use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use tryout_core::{DomainError, DomainResult};

/// When purchases may happen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DistributionRule {
    /// Every week on `day_of_week` (0 = Sunday … 6 = Saturday).
    Recurring { day_of_week: u8 },
    /// A single calendar day.
    SpecificDate { date: NaiveDate },
}

/// A distribution rule plus the number of purchases allowed on each matching day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Distribution {
    pub rule: DistributionRule,
    pub max_units: u32,
}

impl Distribution {
    pub fn recurring(day_of_week: u8, max_units: u32) -> DomainResult<Self> {
        if day_of_week > 6 {
            return Err(DomainError::validation(format!(
                "day_of_week must be in 0..=6, got {day_of_week}"
            )));
        }
        Ok(Self {
            rule: DistributionRule::Recurring { day_of_week },
            max_units,
        })
    }

    pub fn specific_date(date: NaiveDate, max_units: u32) -> Self {
        Self {
            rule: DistributionRule::SpecificDate { date },
            max_units,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recurring_rejects_out_of_range_weekday() {
        assert!(Distribution::recurring(6, 1).is_ok());
        assert!(matches!(
            Distribution::recurring(7, 1),
            Err(DomainError::Validation(_))
        ));
    }
}
