use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use tryout_core::{CampaignId, DomainError, DomainResult, UserId};

use crate::{Distribution, Offer, Procedure};

/// Campaign status lifecycle (owned by the surrounding system).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CampaignStatus {
    Draft,
    Active,
    Paused,
    Ended,
}

/// A seller-defined testing opportunity with a finite number of slots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Campaign {
    pub id: CampaignId,
    pub owner_id: UserId,
    pub title: String,
    pub status: CampaignStatus,
    pub total_slots: u32,
    /// Never negative; mutated only by the slot ledger.
    pub available_slots: u32,
    pub auto_accept_applications: bool,
    /// Ordered purchase-date rules.
    pub distributions: Vec<Distribution>,
    pub procedures: Vec<Procedure>,
    pub offer: Offer,
    pub ends_at: Option<DateTime<Utc>>,
}

impl Campaign {
    /// New active campaign with every slot available.
    pub fn new(
        owner_id: UserId,
        title: impl Into<String>,
        total_slots: u32,
        offer: Offer,
    ) -> DomainResult<Self> {
        if total_slots == 0 {
            return Err(DomainError::validation("a campaign needs at least one slot"));
        }
        Ok(Self {
            id: CampaignId::new(),
            owner_id,
            title: title.into(),
            status: CampaignStatus::Active,
            total_slots,
            available_slots: total_slots,
            auto_accept_applications: false,
            distributions: Vec::new(),
            procedures: Vec::new(),
            offer,
            ends_at: None,
        })
    }

    pub fn with_distributions(mut self, distributions: Vec<Distribution>) -> Self {
        self.distributions = distributions;
        self
    }

    pub fn with_procedures(mut self, procedures: Vec<Procedure>) -> Self {
        self.procedures = procedures;
        self
    }

    pub fn with_auto_accept(mut self, auto_accept: bool) -> Self {
        self.auto_accept_applications = auto_accept;
        self
    }

    pub fn with_status(mut self, status: CampaignStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_end(mut self, ends_at: DateTime<Utc>) -> Self {
        self.ends_at = Some(ends_at);
        self
    }

    pub fn is_active(&self) -> bool {
        self.status == CampaignStatus::Active
    }

    /// Ended explicitly, or past its end date.
    pub fn has_ended(&self, now: DateTime<Utc>) -> bool {
        self.status == CampaignStatus::Ended || self.ends_at.is_some_and(|end| end <= now)
    }
}
