//! Session lifecycle engine (application-level orchestration).
//!
//! Every operation runs the same pipeline:
//!
//! ```text
//! Operation
//!   ↓
//! 1. Load session (and campaign / step progress when the transition needs them)
//!   ↓
//! 2. Consult collaborators: scheduler on acceptance, step tracker on step
//!    completion, eligibility on application
//!   ↓
//! 3. Handle the command (pure decision logic in the aggregate) and apply events
//!   ↓
//! 4. Commit session + slot effect + progress rows in one store transaction
//!   ↓
//! 5. Publish one envelope per event (fire-and-forget)
//!   ↓
//! 6. Settle rewards the transition made payable (after commit, never rolls back)
//! ```

use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use serde_json::{Value as JsonValue, json};
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use tryout_auth::{Actor, ensure_tester};
use tryout_campaigns::Campaign;
use tryout_core::{
    Aggregate, AggregateRoot, CampaignId, Clock, DomainError, ExpectedVersion, SessionId, StepId, SystemClock, UserId,
};
use tryout_events::{Event, EventBus, EventEnvelope};
use tryout_sessions::{
    CampaignFacts, ScheduledLoad, Session, SessionAction, SessionCommand, SessionEvent, SessionStatus,
    SlotEffect, StepProgress, StepTracker, UgcRequest, UgcSubmission, next_purchase_date,
};

use crate::eligibility::{AlwaysEligible, EligibilityCheck};
use crate::settlement::{CONTENT_BONUS_MEMO, SettlementRequest, SettlementService, TEST_REWARD_MEMO};
use crate::store::{SessionChange, SessionStore, StoreError, UnsettledReward};

/// Aggregate type stamped on every published envelope.
pub const AGGREGATE_TYPE: &str = "testing.session";

pub const DEADLINE_EXPIRED_REASON: &str = "purchase deadline expired";

/// Engine operation error, in the caller-facing taxonomy.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("validation failed: {0}")]
    Validation(String),

    /// Lost an optimistic-concurrency race; reload and retry.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error(transparent)]
    Store(StoreError),
}

impl From<DomainError> for EngineError {
    fn from(value: DomainError) -> Self {
        match value {
            DomainError::NotFound(what) => EngineError::NotFound(what),
            DomainError::Forbidden(msg) => EngineError::Forbidden(msg),
            DomainError::PreconditionFailed(msg) => EngineError::PreconditionFailed(msg),
            DomainError::Validation(msg) | DomainError::InvalidId(msg) => EngineError::Validation(msg),
            DomainError::Conflict(msg) => EngineError::Conflict(msg),
        }
    }
}

impl From<StoreError> for EngineError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::Concurrency(msg) => EngineError::Conflict(msg),
            StoreError::NoSlotsAvailable(_) => EngineError::PreconditionFailed("no slots available".to_string()),
            StoreError::DuplicateSession { .. } => EngineError::Conflict(value.to_string()),
            StoreError::NotFound(what) => EngineError::NotFound(what),
            StoreError::Storage(_) => EngineError::Store(value),
        }
    }
}

impl From<tryout_auth::AuthzError> for EngineError {
    fn from(value: tryout_auth::AuthzError) -> Self {
        EngineError::Forbidden(value.to_string())
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

/// Per-day load of one campaign, read from the store.
struct CampaignLoad<'a, S: ?Sized> {
    store: &'a S,
    campaign_id: CampaignId,
}

impl<S: SessionStore + ?Sized> ScheduledLoad for CampaignLoad<'_, S> {
    type Error = StoreError;

    fn scheduled_on(&self, date: NaiveDate) -> Result<u32, StoreError> {
        self.store.count_scheduled(self.campaign_id, date)
    }
}

/// Orchestrates session transitions over a store and an event bus.
pub struct SessionEngine<S, B> {
    store: S,
    bus: B,
    settlement: SettlementService,
    eligibility: Arc<dyn EligibilityCheck>,
    clock: Arc<dyn Clock>,
}

impl<S, B> std::fmt::Debug for SessionEngine<S, B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionEngine").finish_non_exhaustive()
    }
}

impl<S, B> SessionEngine<S, B> {
    pub fn new(store: S, bus: B, settlement: SettlementService) -> Self {
        Self {
            store,
            bus,
            settlement,
            eligibility: Arc::new(AlwaysEligible),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_eligibility(mut self, eligibility: Arc<dyn EligibilityCheck>) -> Self {
        self.eligibility = eligibility;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }
}

impl<S, B> SessionEngine<S, B>
where
    S: SessionStore,
    B: EventBus<EventEnvelope<JsonValue>>,
{
    // ---- queries -------------------------------------------------------------------------

    pub fn session(&self, session_id: SessionId) -> EngineResult<Session> {
        self.store
            .load_session(session_id)?
            .ok_or_else(|| EngineError::NotFound(format!("session {session_id}")))
    }

    pub fn progress(&self, session_id: SessionId) -> EngineResult<Vec<StepProgress>> {
        Ok(self.store.load_progress(session_id)?)
    }

    fn campaign(&self, campaign_id: CampaignId) -> EngineResult<Campaign> {
        self.store
            .load_campaign(campaign_id)?
            .ok_or_else(|| EngineError::NotFound(format!("campaign {campaign_id}")))
    }

    fn campaign_of(&self, session: &Session) -> EngineResult<Campaign> {
        let campaign_id = session
            .campaign_id()
            .ok_or_else(|| EngineError::NotFound(format!("campaign of session {}", session.id())))?;
        self.campaign(campaign_id)
    }

    fn schedule(&self, campaign: &Campaign, now: DateTime<Utc>) -> EngineResult<Option<NaiveDate>> {
        let load = CampaignLoad {
            store: &self.store,
            campaign_id: campaign.id,
        };
        let date = next_purchase_date(&campaign.distributions, now.date_naive(), &load)?;
        if date.is_none() {
            warn!(campaign_id = %campaign.id, "accepting without a purchase date");
        }
        Ok(date)
    }

    // ---- application ---------------------------------------------------------------------

    /// A tester applies to a campaign. Auto-accepting campaigns accept (and
    /// reserve a slot) in the same commit.
    pub fn apply(&self, actor: Actor, campaign_id: CampaignId) -> EngineResult<Session> {
        ensure_tester(&actor, actor.user_id, "apply")?;
        let campaign = self.campaign(campaign_id)?;
        let tester_id = actor.user_id;

        if self.store.find_session(campaign_id, tester_id)?.is_some() {
            return Err(EngineError::Conflict(format!(
                "tester {tester_id} already has a session for campaign {campaign_id}"
            )));
        }

        let verdict = self.eligibility.is_eligible(campaign_id, tester_id);
        if !verdict.eligible {
            return Err(EngineError::PreconditionFailed(format!(
                "tester is not eligible for this campaign: {}",
                verdict.reasons.join("; ")
            )));
        }

        let now = self.clock.now();
        let facts = CampaignFacts::of(&campaign, now);
        let scheduled_purchase_date = if facts.auto_accept && facts.active && facts.available_slots > 0 {
            self.schedule(&campaign, now)?
        } else {
            None
        };

        let action = SessionAction::Apply {
            campaign_id,
            tester_id,
            campaign: facts,
            scheduled_purchase_date,
        };
        self.run(Session::empty(SessionId::new()), actor, now, action, Vec::new())
    }

    pub fn accept(&self, actor: Actor, session_id: SessionId) -> EngineResult<Session> {
        let session = self.session(session_id)?;
        let campaign = self.campaign_of(&session)?;
        let now = self.clock.now();

        // Only schedule when the transition can happen; the aggregate reports why not.
        let scheduled_purchase_date = if session.status() == SessionStatus::Pending {
            self.schedule(&campaign, now)?
        } else {
            None
        };

        let action = SessionAction::Accept {
            campaign: CampaignFacts::of(&campaign, now),
            scheduled_purchase_date,
        };
        self.run(session, actor, now, action, Vec::new())
    }

    pub fn reject(&self, actor: Actor, session_id: SessionId, reason: impl Into<String>) -> EngineResult<Session> {
        self.transition(actor, session_id, SessionAction::Reject { reason: reason.into() })
    }

    // ---- procedures and price ------------------------------------------------------------

    pub fn complete_step(
        &self,
        actor: Actor,
        session_id: SessionId,
        step_id: StepId,
        payload: JsonValue,
    ) -> EngineResult<Session> {
        let session = self.session(session_id)?;
        let now = self.clock.now();

        // Role and status are checked before the payload is looked at.
        let preflight = SessionCommand::new(
            actor,
            now,
            SessionAction::CompleteStep {
                step_id,
                all_required_complete: false,
            },
        );
        session.handle(&preflight)?;

        let campaign = self.campaign_of(&session)?;
        let progress = self.store.load_progress(session_id)?;
        let completion = StepTracker::new(&campaign.procedures, &progress).complete(session_id, step_id, payload, now)?;

        let action = SessionAction::CompleteStep {
            step_id,
            all_required_complete: completion.all_required_complete,
        };
        self.run(session, actor, now, action, vec![completion.progress])
    }

    pub fn validate_price(&self, actor: Actor, session_id: SessionId, price: i64) -> EngineResult<Session> {
        let session = self.session(session_id)?;
        let campaign = self.campaign_of(&session)?;
        let now = self.clock.now();

        let progress = StepTracker::new(&campaign.procedures, &[])
            .price_validation_record(session_id, price, now)
            .into_iter()
            .collect();
        let action = SessionAction::ValidatePrice {
            price,
            offer: campaign.offer.clone(),
        };
        self.run(session, actor, now, action, progress)
    }

    // ---- purchase ------------------------------------------------------------------------

    pub fn submit_purchase(
        &self,
        actor: Actor,
        session_id: SessionId,
        order_id: Option<String>,
        proof_url: Option<String>,
    ) -> EngineResult<Session> {
        self.transition(actor, session_id, SessionAction::SubmitPurchase { order_id, proof_url })
    }

    pub fn validate_purchase(&self, actor: Actor, session_id: SessionId) -> EngineResult<Session> {
        self.transition(actor, session_id, SessionAction::ValidatePurchase)
    }

    pub fn reject_purchase(
        &self,
        actor: Actor,
        session_id: SessionId,
        reason: impl Into<String>,
    ) -> EngineResult<Session> {
        self.transition(actor, session_id, SessionAction::RejectPurchase { reason: reason.into() })
    }

    // ---- test ----------------------------------------------------------------------------

    pub fn submit_test(&self, actor: Actor, session_id: SessionId, submission: JsonValue) -> EngineResult<Session> {
        self.transition(actor, session_id, SessionAction::SubmitTest { submission })
    }

    /// Validate the test and pay the reward.
    pub fn validate_test(
        &self,
        actor: Actor,
        session_id: SessionId,
        rating: Option<u8>,
        comment: Option<String>,
    ) -> EngineResult<Session> {
        let session = self.session(session_id)?;
        let campaign = self.campaign_of(&session)?;
        let action = SessionAction::ValidateTest {
            rating,
            comment,
            offer: campaign.offer.clone(),
        };
        self.run(session, actor, self.clock.now(), action, Vec::new())
    }

    /// Validate the test and ask for extra content; the reward is paid at closure.
    pub fn request_ugc(
        &self,
        actor: Actor,
        session_id: SessionId,
        rating: u8,
        comment: Option<String>,
        requests: Vec<UgcRequest>,
    ) -> EngineResult<Session> {
        let session = self.session(session_id)?;
        let campaign = self.campaign_of(&session)?;
        let action = SessionAction::RequestUgc {
            rating,
            comment,
            requests,
            offer: campaign.offer.clone(),
        };
        self.run(session, actor, self.clock.now(), action, Vec::new())
    }

    // ---- extra content -------------------------------------------------------------------

    pub fn submit_ugc(
        &self,
        actor: Actor,
        session_id: SessionId,
        submissions: Vec<UgcSubmission>,
    ) -> EngineResult<Session> {
        self.transition(actor, session_id, SessionAction::SubmitUgc { submissions })
    }

    pub fn decline_ugc(&self, actor: Actor, session_id: SessionId, reason: impl Into<String>) -> EngineResult<Session> {
        self.transition(actor, session_id, SessionAction::DeclineUgc { reason: reason.into() })
    }

    pub fn validate_ugc(&self, actor: Actor, session_id: SessionId) -> EngineResult<Session> {
        self.transition(actor, session_id, SessionAction::ValidateUgc)
    }

    pub fn reject_ugc(&self, actor: Actor, session_id: SessionId, reason: impl Into<String>) -> EngineResult<Session> {
        self.transition(actor, session_id, SessionAction::RejectUgc { reason: reason.into() })
    }

    /// Close a session pending closure, paying the reward and any earned bonus.
    pub fn close(&self, actor: Actor, session_id: SessionId) -> EngineResult<Session> {
        self.transition(actor, session_id, SessionAction::Close)
    }

    // ---- rating --------------------------------------------------------------------------

    pub fn rate_tester(
        &self,
        actor: Actor,
        session_id: SessionId,
        score: u8,
        comment: Option<String>,
    ) -> EngineResult<Session> {
        let session = self.session(session_id)?;
        let campaign = self.campaign_of(&session)?;
        let now = self.clock.now();
        let action = SessionAction::RateTester {
            score,
            comment,
            campaign: CampaignFacts::of(&campaign, now),
        };
        self.run(session, actor, now, action, Vec::new())
    }

    pub fn update_rating(
        &self,
        actor: Actor,
        session_id: SessionId,
        score: u8,
        comment: Option<String>,
    ) -> EngineResult<Session> {
        self.transition(actor, session_id, SessionAction::UpdateRating { score, comment })
    }

    // ---- cancellation, disputes, overrides -----------------------------------------------

    pub fn cancel(&self, actor: Actor, session_id: SessionId, reason: Option<String>) -> EngineResult<Session> {
        self.transition(actor, session_id, SessionAction::Cancel { reason })
    }

    /// Cancel a session whose purchase deadline passed (used by the sweep).
    pub fn expire(&self, session_id: SessionId) -> EngineResult<Session> {
        self.transition(
            Actor::system(),
            session_id,
            SessionAction::Cancel {
                reason: Some(DEADLINE_EXPIRED_REASON.to_string()),
            },
        )
    }

    pub fn dispute(&self, actor: Actor, session_id: SessionId, reason: impl Into<String>) -> EngineResult<Session> {
        self.transition(actor, session_id, SessionAction::Dispute { reason: reason.into() })
    }

    pub fn resolve_dispute(
        &self,
        actor: Actor,
        session_id: SessionId,
        outcome: impl Into<String>,
        note: Option<String>,
    ) -> EngineResult<Session> {
        self.transition(
            actor,
            session_id,
            SessionAction::ResolveDispute {
                outcome: outcome.into(),
                note,
            },
        )
    }

    pub fn force_status(
        &self,
        actor: Actor,
        session_id: SessionId,
        status: SessionStatus,
        reason: impl Into<String>,
    ) -> EngineResult<Session> {
        self.transition(
            actor,
            session_id,
            SessionAction::ForceStatus {
                status,
                reason: reason.into(),
            },
        )
    }

    // ---- pipeline ------------------------------------------------------------------------

    fn transition(&self, actor: Actor, session_id: SessionId, action: SessionAction) -> EngineResult<Session> {
        let session = self.session(session_id)?;
        self.run(session, actor, self.clock.now(), action, Vec::new())
    }

    fn run(
        &self,
        mut session: Session,
        actor: Actor,
        now: DateTime<Utc>,
        action: SessionAction,
        progress: Vec<StepProgress>,
    ) -> EngineResult<Session> {
        let base_version = session.version();
        let expected = ExpectedVersion(base_version);
        let command = SessionCommand::new(actor, now, action);

        let events = session.handle(&command)?;
        if events.is_empty() {
            return Ok(session);
        }

        let mut slot_effect = SlotEffect::None;
        for event in &events {
            session.apply(event);
            if event.slot_effect() != SlotEffect::None {
                slot_effect = event.slot_effect();
            }
        }

        let change = SessionChange::new(session.clone(), expected)
            .with_slot_effect(slot_effect)
            .with_progress(progress);
        self.store.commit(change)?;

        info!(
            session_id = %session.id(),
            actor = %actor.role,
            status = %session.status(),
            version = session.version(),
            slot_effect = ?slot_effect,
            events = events.len(),
            "session transition committed"
        );

        self.publish(&session, base_version + 1, &events);
        self.settle_rewards(&session, &events, now);
        Ok(session)
    }

    fn publish(&self, session: &Session, first_sequence: u64, events: &[SessionEvent]) {
        for (offset, event) in (0u64..).zip(events) {
            let payload = match serde_json::to_value(event) {
                Ok(payload) => payload,
                Err(err) => {
                    warn!(session_id = %session.id(), event_type = event.event_type(), %err, "event serialization failed");
                    continue;
                }
            };
            self.emit(
                session,
                first_sequence + offset,
                event.event_type(),
                event.occurred_at(),
                payload,
            );
        }
    }

    fn emit(
        &self,
        session: &Session,
        sequence_number: u64,
        event_type: &str,
        occurred_at: DateTime<Utc>,
        payload: JsonValue,
    ) {
        let envelope = EventEnvelope::new(
            Uuid::now_v7(),
            *session.id().as_uuid(),
            AGGREGATE_TYPE,
            sequence_number,
            event_type,
            occurred_at,
            payload,
        );
        match self.bus.publish(envelope) {
            Ok(()) => debug!(session_id = %session.id(), event_type, sequence_number, "event published"),
            Err(err) => warn!(session_id = %session.id(), event_type, ?err, "event publication failed"),
        }
    }

    fn settle_rewards(&self, session: &Session, events: &[SessionEvent], now: DateTime<Utc>) {
        for event in events {
            match event {
                SessionEvent::TestValidated { reward_amount, .. } => {
                    self.settle(session, *reward_amount, TEST_REWARD_MEMO, now);
                }
                SessionEvent::Closed {
                    reward_amount,
                    final_bonus,
                    ..
                } => {
                    self.settle(session, *reward_amount, TEST_REWARD_MEMO, now);
                    self.settle(session, *final_bonus, CONTENT_BONUS_MEMO, now);
                }
                _ => {}
            }
        }
    }

    /// Pay one amount. Failures are recorded for operators, never propagated.
    fn settle(&self, session: &Session, amount: i64, memo: &str, now: DateTime<Utc>) {
        if amount <= 0 {
            return;
        }
        let Some(tester_id) = session.tester_id() else {
            return;
        };
        let request = SettlementRequest {
            tester_id,
            amount,
            memo: memo.to_string(),
            session_id: *session.id(),
        };

        match self.settlement.settle(&request) {
            Ok(reference) => {
                let payload = json!({
                    "tester_id": tester_id,
                    "amount": amount,
                    "memo": memo,
                    "settlement": reference,
                });
                self.emit(session, session.version(), "settlement.completed", now, payload);
            }
            Err(err) => {
                error!(
                    target: "settlement.unsettled",
                    session_id = %session.id(),
                    tester_id = %tester_id,
                    amount,
                    memo,
                    %err,
                    "reward settlement failed; session stays validated but unpaid"
                );
                self.record_unsettled(session, tester_id, &request, err.to_string(), now);
            }
        }
    }

    fn record_unsettled(
        &self,
        session: &Session,
        tester_id: UserId,
        request: &SettlementRequest,
        error: String,
        now: DateTime<Utc>,
    ) {
        let reward = UnsettledReward {
            session_id: request.session_id,
            tester_id,
            amount: request.amount,
            memo: request.memo.clone(),
            error: error.clone(),
            recorded_at: now,
        };
        if let Err(err) = self.store.record_unsettled(reward) {
            error!(
                target: "settlement.unsettled",
                session_id = %request.session_id,
                amount = request.amount,
                %err,
                "could not record unsettled reward"
            );
        }

        let payload = json!({
            "tester_id": tester_id,
            "amount": request.amount,
            "memo": request.memo,
            "error": error,
        });
        self.emit(session, session.version(), "settlement.failed", now, payload);
    }
}
