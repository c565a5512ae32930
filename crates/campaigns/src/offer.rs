use serde::{Deserialize, Serialize};

use tryout_core::{DomainError, DomainResult};

/// Commercial terms of a campaign. All amounts are minor currency units (cents).
///
/// Treated as immutable input for the lifetime of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Offer {
    /// The exact price the tester is expected to find on the listing.
    pub expected_price: i64,
    /// Lowest acceptable discovered price (inclusive).
    pub min_price: i64,
    /// Highest acceptable discovered price (inclusive).
    pub max_price: i64,
    /// Shipping cost reimbursed to the tester.
    pub shipping_cost: i64,
    /// Fee paid to the tester on top of the reimbursed costs.
    pub reward_amount: i64,
}

impl Offer {
    pub fn new(
        expected_price: i64,
        min_price: i64,
        max_price: i64,
        shipping_cost: i64,
        reward_amount: i64,
    ) -> DomainResult<Self> {
        if expected_price <= 0 {
            return Err(DomainError::validation("expected price must be positive"));
        }
        if min_price > max_price {
            return Err(DomainError::validation(
                "minimum price must not exceed maximum price",
            ));
        }
        if shipping_cost < 0 || reward_amount < 0 {
            return Err(DomainError::validation(
                "shipping cost and reward must not be negative",
            ));
        }
        Ok(Self {
            expected_price,
            min_price,
            max_price,
            shipping_cost,
            reward_amount,
        })
    }

    /// Offer whose acceptable range is exactly the expected price.
    pub fn exact(expected_price: i64, shipping_cost: i64, reward_amount: i64) -> DomainResult<Self> {
        Self::new(expected_price, expected_price, expected_price, shipping_cost, reward_amount)
    }

    pub fn in_range(&self, price: i64) -> bool {
        (self.min_price..=self.max_price).contains(&price)
    }

    /// Total owed to a tester whose purchase at `product_cost` was validated.
    pub fn total_reward(&self, product_cost: i64) -> i64 {
        product_cost + self.shipping_cost + self.reward_amount
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inverted_range_is_rejected() {
        assert!(Offer::new(1000, 1200, 900, 0, 0).is_err());
    }

    #[test]
    fn total_reward_sums_costs_and_fee() {
        let offer = Offer::exact(2_500, 499, 1_000).unwrap();
        assert!(offer.in_range(2_500));
        assert!(!offer.in_range(2_499));
        assert_eq!(offer.total_reward(2_500), 3_999);
    }
}
