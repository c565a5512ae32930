use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use tryout_campaigns::Campaign;
use tryout_core::{AggregateRoot, CampaignId, ExpectedVersion, SessionId, UserId};
use tryout_sessions::{Session, SlotEffect, StepProgress};

/// Everything one lifecycle transition writes.
///
/// Stores apply a change as a single atomic unit: the session snapshot, the
/// slot counter adjustment and the step-progress upserts either all persist or
/// none of them do.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionChange {
    /// Session state after the transition.
    pub session: Session,
    /// Version the session had when it was loaded (`0` = must not exist yet).
    pub expected_version: ExpectedVersion,
    pub slot_effect: SlotEffect,
    pub progress: Vec<StepProgress>,
}

impl SessionChange {
    pub fn new(session: Session, expected_version: ExpectedVersion) -> Self {
        Self {
            session,
            expected_version,
            slot_effect: SlotEffect::None,
            progress: Vec::new(),
        }
    }

    pub fn with_slot_effect(mut self, effect: SlotEffect) -> Self {
        self.slot_effect = effect;
        self
    }

    pub fn with_progress(mut self, progress: Vec<StepProgress>) -> Self {
        self.progress = progress;
        self
    }

    pub fn session_id(&self) -> SessionId {
        *self.session.id()
    }

    /// Campaign whose slot counter the change touches, if any.
    pub fn campaign_id(&self) -> Result<CampaignId, StoreError> {
        self.session
            .campaign_id()
            .ok_or_else(|| StoreError::Storage(format!("session {} has no campaign", self.session_id())))
    }
}

/// A reward whose settlement failed after the transition committed.
///
/// Kept so operators can see (and fix) validated-but-unpaid sessions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsettledReward {
    pub session_id: SessionId,
    pub tester_id: UserId,
    /// Cents.
    pub amount: i64,
    pub memo: String,
    pub error: String,
    pub recorded_at: DateTime<Utc>,
}

/// Session store operation error.
///
/// Infrastructure failures, as opposed to domain rejections. `NoSlotsAvailable`
/// comes from the atomic check-and-decrement and is surfaced to callers as a
/// precondition failure.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("optimistic concurrency check failed: {0}")]
    Concurrency(String),

    #[error("no slots available for campaign {0}")]
    NoSlotsAvailable(CampaignId),

    #[error("tester {tester_id} already has a session for campaign {campaign_id}")]
    DuplicateSession {
        campaign_id: CampaignId,
        tester_id: UserId,
    },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("storage failure: {0}")]
    Storage(String),
}

/// Persistence boundary of the lifecycle engine.
///
/// Reads are plain lookups; the only write that changes session state is
/// [`SessionStore::commit`], which must be atomic. Campaigns are owned by the
/// surrounding system: the store only reads them and adjusts `available_slots`
/// inside a commit.
pub trait SessionStore: Send + Sync {
    fn load_campaign(&self, campaign_id: CampaignId) -> Result<Option<Campaign>, StoreError>;

    fn load_session(&self, session_id: SessionId) -> Result<Option<Session>, StoreError>;

    /// The tester's session for a campaign (at most one exists).
    fn find_session(
        &self,
        campaign_id: CampaignId,
        tester_id: UserId,
    ) -> Result<Option<Session>, StoreError>;

    fn load_progress(&self, session_id: SessionId) -> Result<Vec<StepProgress>, StoreError>;

    /// Number of live (not cancelled, not rejected) sessions with a purchase
    /// scheduled on `date` for the campaign.
    fn count_scheduled(&self, campaign_id: CampaignId, date: NaiveDate) -> Result<u32, StoreError>;

    /// Sessions still awaiting a purchase whose scheduled day is before `today`.
    fn expired_candidates(&self, today: NaiveDate) -> Result<Vec<SessionId>, StoreError>;

    /// Atomically persist a transition.
    ///
    /// Implementations must:
    /// - reject the change if the stored version differs from `expected_version`
    /// - reject a new session if the tester already has one for the campaign
    /// - apply the slot effect with a check-and-decrement that never goes below zero
    /// - upsert every step-progress row
    fn commit(&self, change: SessionChange) -> Result<(), StoreError>;

    fn record_unsettled(&self, reward: UnsettledReward) -> Result<(), StoreError>;
}

impl<S> SessionStore for Arc<S>
where
    S: SessionStore + ?Sized,
{
    fn load_campaign(&self, campaign_id: CampaignId) -> Result<Option<Campaign>, StoreError> {
        (**self).load_campaign(campaign_id)
    }

    fn load_session(&self, session_id: SessionId) -> Result<Option<Session>, StoreError> {
        (**self).load_session(session_id)
    }

    fn find_session(
        &self,
        campaign_id: CampaignId,
        tester_id: UserId,
    ) -> Result<Option<Session>, StoreError> {
        (**self).find_session(campaign_id, tester_id)
    }

    fn load_progress(&self, session_id: SessionId) -> Result<Vec<StepProgress>, StoreError> {
        (**self).load_progress(session_id)
    }

    fn count_scheduled(&self, campaign_id: CampaignId, date: NaiveDate) -> Result<u32, StoreError> {
        (**self).count_scheduled(campaign_id, date)
    }

    fn expired_candidates(&self, today: NaiveDate) -> Result<Vec<SessionId>, StoreError> {
        (**self).expired_candidates(today)
    }

    fn commit(&self, change: SessionChange) -> Result<(), StoreError> {
        (**self).commit(change)
    }

    fn record_unsettled(&self, reward: UnsettledReward) -> Result<(), StoreError> {
        (**self).record_unsettled(reward)
    }
}
