//! Campaign eligibility boundary, consulted once when a tester applies.

use tryout_core::{CampaignId, UserId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Eligibility {
    pub eligible: bool,
    /// Why the tester is not eligible; empty when eligible.
    pub reasons: Vec<String>,
}

impl Eligibility {
    pub fn eligible() -> Self {
        Self {
            eligible: true,
            reasons: Vec::new(),
        }
    }

    pub fn ineligible(reasons: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            eligible: false,
            reasons: reasons.into_iter().map(Into::into).collect(),
        }
    }
}

pub trait EligibilityCheck: Send + Sync {
    fn is_eligible(&self, campaign_id: CampaignId, tester_id: UserId) -> Eligibility;
}

/// Accepts every tester.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysEligible;

impl EligibilityCheck for AlwaysEligible {
    fn is_eligible(&self, _campaign_id: CampaignId, _tester_id: UserId) -> Eligibility {
        Eligibility::eligible()
    }
}

impl<F> EligibilityCheck for F
where
    F: Fn(CampaignId, UserId) -> Eligibility + Send + Sync,
{
    fn is_eligible(&self, campaign_id: CampaignId, tester_id: UserId) -> Eligibility {
        self(campaign_id, tester_id)
    }
}
