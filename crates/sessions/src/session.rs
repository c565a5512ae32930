use chrono::{DateTime, Days, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use tryout_auth::{Actor, Role, ensure_admin, ensure_owner, ensure_owner_or_admin, ensure_party, ensure_tester};
use tryout_campaigns::{Campaign, Offer, StepType};
use tryout_core::{Aggregate, AggregateRoot, CampaignId, DomainError, DomainResult, SessionId, StepId, UserId};
use tryout_events::Event;

use crate::status::SessionStatus;
use crate::step_validator::{is_well_formed_url, validate_step_value};

/// What the lifecycle engine knows about the campaign when it issues a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CampaignFacts {
    pub owner_id: UserId,
    pub active: bool,
    pub available_slots: u32,
    pub auto_accept: bool,
    pub ended: bool,
}

impl CampaignFacts {
    pub fn of(campaign: &Campaign, now: DateTime<Utc>) -> Self {
        Self {
            owner_id: campaign.owner_id,
            active: campaign.is_active(),
            available_slots: campaign.available_slots,
            auto_accept: campaign.auto_accept_applications,
            ended: campaign.has_ended(now),
        }
    }
}

/// Effect a transition has on the campaign's slot counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotEffect {
    #[default]
    None,
    Reserve,
    Release,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TesterRating {
    pub score: u8,
    pub comment: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rejection {
    pub reason: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisputeResolution {
    pub outcome: String,
    pub note: Option<String>,
    pub resolved_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UgcKind {
    Video,
    Photo,
    Review,
}

/// Extra content the owner asks for after the main test, with its own bonus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UgcRequest {
    pub kind: UgcKind,
    pub description: String,
    /// Bonus in cents.
    pub bonus: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UgcSubmission {
    pub kind: UgcKind,
    pub url: String,
    pub note: Option<String>,
}

/// One timestamp per transition. Each is written once and never cleared.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionTimestamps {
    pub applied_at: Option<DateTime<Utc>>,
    pub accepted_at: Option<DateTime<Utc>>,
    pub rejected_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub procedures_completed_at: Option<DateTime<Utc>>,
    pub price_validated_at: Option<DateTime<Utc>>,
    pub purchase_submitted_at: Option<DateTime<Utc>>,
    pub purchase_validated_at: Option<DateTime<Utc>>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub ugc_requested_at: Option<DateTime<Utc>>,
    pub ugc_submitted_at: Option<DateTime<Utc>>,
    pub ugc_validated_at: Option<DateTime<Utc>>,
    pub ugc_declined_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub deadline_expired_at: Option<DateTime<Utc>>,
    pub disputed_at: Option<DateTime<Utc>>,
    pub rated_at: Option<DateTime<Utc>>,
    pub status_forced_at: Option<DateTime<Utc>>,
}

fn stamp(slot: &mut Option<DateTime<Utc>>, at: DateTime<Utc>) {
    if slot.is_none() {
        *slot = Some(at);
    }
}

/// Aggregate root: one tester's participation in one campaign.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    id: SessionId,
    campaign_id: Option<CampaignId>,
    tester_id: Option<UserId>,
    owner_id: Option<UserId>,
    status: SessionStatus,
    timestamps: SessionTimestamps,
    scheduled_purchase_date: Option<NaiveDate>,

    validated_price: Option<i64>,
    order_id: Option<String>,
    purchase_proof_url: Option<String>,
    product_cost: Option<i64>,
    shipping_cost: Option<i64>,
    reward_amount: Option<i64>,
    potential_bonus: i64,
    final_bonus: Option<i64>,

    test_submission: Option<Value>,
    rating: Option<TesterRating>,
    ugc_requests: Vec<UgcRequest>,
    ugc_submissions: Vec<UgcSubmission>,

    rejection_reason: Option<String>,
    cancellation_reason: Option<String>,
    dispute_reason: Option<String>,
    ugc_decline_reason: Option<String>,
    pending_purchase_rejection: Option<Rejection>,
    purchase_rejections: Vec<Rejection>,
    pending_ugc_rejection: Option<Rejection>,
    ugc_rejections: Vec<Rejection>,
    dispute_resolution: Option<DisputeResolution>,
    status_override_reason: Option<String>,

    version: u64,
    created: bool,
}

impl Session {
    /// Create an empty, not-yet-created aggregate instance.
    pub fn empty(id: SessionId) -> Self {
        Self {
            id,
            campaign_id: None,
            tester_id: None,
            owner_id: None,
            status: SessionStatus::Pending,
            timestamps: SessionTimestamps::default(),
            scheduled_purchase_date: None,
            validated_price: None,
            order_id: None,
            purchase_proof_url: None,
            product_cost: None,
            shipping_cost: None,
            reward_amount: None,
            potential_bonus: 0,
            final_bonus: None,
            test_submission: None,
            rating: None,
            ugc_requests: Vec::new(),
            ugc_submissions: Vec::new(),
            rejection_reason: None,
            cancellation_reason: None,
            dispute_reason: None,
            ugc_decline_reason: None,
            pending_purchase_rejection: None,
            purchase_rejections: Vec::new(),
            pending_ugc_rejection: None,
            ugc_rejections: Vec::new(),
            dispute_resolution: None,
            status_override_reason: None,
            version: 0,
            created: false,
        }
    }

    pub fn id_typed(&self) -> SessionId {
        self.id
    }

    pub fn is_created(&self) -> bool {
        self.created
    }

    pub fn campaign_id(&self) -> Option<CampaignId> {
        self.campaign_id
    }

    pub fn tester_id(&self) -> Option<UserId> {
        self.tester_id
    }

    pub fn owner_id(&self) -> Option<UserId> {
        self.owner_id
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn timestamps(&self) -> &SessionTimestamps {
        &self.timestamps
    }

    pub fn scheduled_purchase_date(&self) -> Option<NaiveDate> {
        self.scheduled_purchase_date
    }

    pub fn validated_price(&self) -> Option<i64> {
        self.validated_price
    }

    pub fn order_id(&self) -> Option<&str> {
        self.order_id.as_deref()
    }

    pub fn purchase_proof_url(&self) -> Option<&str> {
        self.purchase_proof_url.as_deref()
    }

    pub fn product_cost(&self) -> Option<i64> {
        self.product_cost
    }

    pub fn shipping_cost(&self) -> Option<i64> {
        self.shipping_cost
    }

    /// Total test reward, set when the test is validated.
    pub fn reward_amount(&self) -> Option<i64> {
        self.reward_amount
    }

    pub fn potential_bonus(&self) -> i64 {
        self.potential_bonus
    }

    pub fn final_bonus(&self) -> Option<i64> {
        self.final_bonus
    }

    pub fn test_submission(&self) -> Option<&Value> {
        self.test_submission.as_ref()
    }

    pub fn rating(&self) -> Option<&TesterRating> {
        self.rating.as_ref()
    }

    pub fn ugc_requests(&self) -> &[UgcRequest] {
        &self.ugc_requests
    }

    pub fn ugc_submissions(&self) -> &[UgcSubmission] {
        &self.ugc_submissions
    }

    pub fn rejection_reason(&self) -> Option<&str> {
        self.rejection_reason.as_deref()
    }

    pub fn cancellation_reason(&self) -> Option<&str> {
        self.cancellation_reason.as_deref()
    }

    pub fn dispute_reason(&self) -> Option<&str> {
        self.dispute_reason.as_deref()
    }

    pub fn ugc_decline_reason(&self) -> Option<&str> {
        self.ugc_decline_reason.as_deref()
    }

    pub fn pending_purchase_rejection(&self) -> Option<&Rejection> {
        self.pending_purchase_rejection.as_ref()
    }

    pub fn purchase_rejections(&self) -> &[Rejection] {
        &self.purchase_rejections
    }

    pub fn pending_ugc_rejection(&self) -> Option<&Rejection> {
        self.pending_ugc_rejection.as_ref()
    }

    pub fn ugc_rejections(&self) -> &[Rejection] {
        &self.ugc_rejections
    }

    pub fn dispute_resolution(&self) -> Option<&DisputeResolution> {
        self.dispute_resolution.as_ref()
    }

    pub fn status_override_reason(&self) -> Option<&str> {
        self.status_override_reason.as_deref()
    }

    /// The purchase deadline: the instant the scheduled day ends (UTC).
    pub fn purchase_deadline(&self) -> Option<DateTime<Utc>> {
        let next_day = self.scheduled_purchase_date?.checked_add_days(Days::new(1))?;
        Some(next_day.and_time(chrono::NaiveTime::MIN).and_utc())
    }

    /// Still waiting for a purchase whose scheduled day is over.
    pub fn is_past_purchase_deadline(&self, now: DateTime<Utc>) -> bool {
        SessionStatus::AWAITING_PURCHASE.contains(&self.status)
            && self.purchase_deadline().is_some_and(|deadline| now >= deadline)
    }
}

impl AggregateRoot for Session {
    type Id = SessionId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// A command: who acts, when, and what they ask for.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionCommand {
    pub actor: Actor,
    pub at: DateTime<Utc>,
    pub action: SessionAction,
}

impl SessionCommand {
    pub fn new(actor: Actor, at: DateTime<Utc>, action: SessionAction) -> Self {
        Self { actor, at, action }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionAction {
    Apply {
        campaign_id: CampaignId,
        tester_id: UserId,
        campaign: CampaignFacts,
        /// Only used when the campaign auto-accepts.
        scheduled_purchase_date: Option<NaiveDate>,
    },
    Accept {
        campaign: CampaignFacts,
        scheduled_purchase_date: Option<NaiveDate>,
    },
    Reject {
        reason: String,
    },
    /// The step tracker has already validated and recorded the completion.
    CompleteStep {
        step_id: StepId,
        all_required_complete: bool,
    },
    ValidatePrice {
        price: i64,
        offer: Offer,
    },
    SubmitPurchase {
        order_id: Option<String>,
        proof_url: Option<String>,
    },
    ValidatePurchase,
    RejectPurchase {
        reason: String,
    },
    SubmitTest {
        submission: Value,
    },
    ValidateTest {
        rating: Option<u8>,
        comment: Option<String>,
        offer: Offer,
    },
    RequestUgc {
        rating: u8,
        comment: Option<String>,
        requests: Vec<UgcRequest>,
        offer: Offer,
    },
    SubmitUgc {
        submissions: Vec<UgcSubmission>,
    },
    DeclineUgc {
        reason: String,
    },
    ValidateUgc,
    RejectUgc {
        reason: String,
    },
    Close,
    RateTester {
        score: u8,
        comment: Option<String>,
        campaign: CampaignFacts,
    },
    UpdateRating {
        score: u8,
        comment: Option<String>,
    },
    /// Tester cancellation, or the deadline sweep when the actor is `System`.
    Cancel {
        reason: Option<String>,
    },
    Dispute {
        reason: String,
    },
    ResolveDispute {
        outcome: String,
        note: Option<String>,
    },
    ForceStatus {
        status: SessionStatus,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    Applied {
        session_id: SessionId,
        campaign_id: CampaignId,
        tester_id: UserId,
        owner_id: UserId,
        at: DateTime<Utc>,
    },
    Accepted {
        scheduled_purchase_date: Option<NaiveDate>,
        auto_accepted: bool,
        at: DateTime<Utc>,
    },
    Rejected {
        reason: String,
        at: DateTime<Utc>,
    },
    Started {
        at: DateTime<Utc>,
    },
    StepCompleted {
        step_id: StepId,
        at: DateTime<Utc>,
    },
    ProceduresCompleted {
        at: DateTime<Utc>,
    },
    PriceValidated {
        price: i64,
        shipping_cost: i64,
        at: DateTime<Utc>,
    },
    PurchaseSubmitted {
        order_id: Option<String>,
        proof_url: Option<String>,
        resubmission: bool,
        at: DateTime<Utc>,
    },
    PurchaseValidated {
        at: DateTime<Utc>,
    },
    PurchaseRejected {
        reason: String,
        at: DateTime<Utc>,
    },
    TestSubmitted {
        submission: Value,
        at: DateTime<Utc>,
    },
    TestValidated {
        rating: Option<TesterRating>,
        reward_amount: i64,
        at: DateTime<Utc>,
    },
    UgcRequested {
        rating: TesterRating,
        requests: Vec<UgcRequest>,
        potential_bonus: i64,
        reward_amount: i64,
        at: DateTime<Utc>,
    },
    UgcSubmitted {
        submissions: Vec<UgcSubmission>,
        at: DateTime<Utc>,
    },
    UgcDeclined {
        reason: String,
        at: DateTime<Utc>,
    },
    UgcValidated {
        at: DateTime<Utc>,
    },
    UgcRejected {
        reason: String,
        at: DateTime<Utc>,
    },
    Closed {
        reward_amount: i64,
        final_bonus: i64,
        at: DateTime<Utc>,
    },
    TesterRated {
        rating: TesterRating,
        at: DateTime<Utc>,
    },
    RatingUpdated {
        rating: TesterRating,
        at: DateTime<Utc>,
    },
    DeadlineExpired {
        scheduled_purchase_date: NaiveDate,
        at: DateTime<Utc>,
    },
    Cancelled {
        reason: Option<String>,
        released_slot: bool,
        at: DateTime<Utc>,
    },
    Disputed {
        reason: String,
        raised_by: Role,
        at: DateTime<Utc>,
    },
    DisputeResolved {
        outcome: String,
        note: Option<String>,
        at: DateTime<Utc>,
    },
    StatusForced {
        from: SessionStatus,
        to: SessionStatus,
        reason: String,
        at: DateTime<Utc>,
    },
}

impl SessionEvent {
    pub fn slot_effect(&self) -> SlotEffect {
        match self {
            SessionEvent::Accepted { .. } => SlotEffect::Reserve,
            SessionEvent::Cancelled {
                released_slot: true,
                ..
            } => SlotEffect::Release,
            _ => SlotEffect::None,
        }
    }
}

impl Event for SessionEvent {
    fn event_type(&self) -> &'static str {
        match self {
            SessionEvent::Applied { .. } => "session.applied",
            SessionEvent::Accepted { .. } => "session.accepted",
            SessionEvent::Rejected { .. } => "session.rejected",
            SessionEvent::Started { .. } => "session.started",
            SessionEvent::StepCompleted { .. } => "session.step_completed",
            SessionEvent::ProceduresCompleted { .. } => "session.procedures_completed",
            SessionEvent::PriceValidated { .. } => "session.price_validated",
            SessionEvent::PurchaseSubmitted { .. } => "session.purchase_submitted",
            SessionEvent::PurchaseValidated { .. } => "session.purchase_validated",
            SessionEvent::PurchaseRejected { .. } => "session.purchase_rejected",
            SessionEvent::TestSubmitted { .. } => "session.test_submitted",
            SessionEvent::TestValidated { .. } => "session.test_validated",
            SessionEvent::UgcRequested { .. } => "session.ugc_requested",
            SessionEvent::UgcSubmitted { .. } => "session.ugc_submitted",
            SessionEvent::UgcDeclined { .. } => "session.ugc_declined",
            SessionEvent::UgcValidated { .. } => "session.ugc_validated",
            SessionEvent::UgcRejected { .. } => "session.ugc_rejected",
            SessionEvent::Closed { .. } => "session.closed",
            SessionEvent::TesterRated { .. } => "session.tester_rated",
            SessionEvent::RatingUpdated { .. } => "session.rating_updated",
            SessionEvent::DeadlineExpired { .. } => "session.deadline_expired",
            SessionEvent::Cancelled { .. } => "session.cancelled",
            SessionEvent::Disputed { .. } => "session.disputed",
            SessionEvent::DisputeResolved { .. } => "session.dispute_resolved",
            SessionEvent::StatusForced { .. } => "session.status_forced",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            SessionEvent::Applied { at, .. }
            | SessionEvent::Accepted { at, .. }
            | SessionEvent::Rejected { at, .. }
            | SessionEvent::Started { at }
            | SessionEvent::StepCompleted { at, .. }
            | SessionEvent::ProceduresCompleted { at }
            | SessionEvent::PriceValidated { at, .. }
            | SessionEvent::PurchaseSubmitted { at, .. }
            | SessionEvent::PurchaseValidated { at }
            | SessionEvent::PurchaseRejected { at, .. }
            | SessionEvent::TestSubmitted { at, .. }
            | SessionEvent::TestValidated { at, .. }
            | SessionEvent::UgcRequested { at, .. }
            | SessionEvent::UgcSubmitted { at, .. }
            | SessionEvent::UgcDeclined { at, .. }
            | SessionEvent::UgcValidated { at }
            | SessionEvent::UgcRejected { at, .. }
            | SessionEvent::Closed { at, .. }
            | SessionEvent::TesterRated { at, .. }
            | SessionEvent::RatingUpdated { at, .. }
            | SessionEvent::DeadlineExpired { at, .. }
            | SessionEvent::Cancelled { at, .. }
            | SessionEvent::Disputed { at, .. }
            | SessionEvent::DisputeResolved { at, .. }
            | SessionEvent::StatusForced { at, .. } => *at,
        }
    }
}

impl Aggregate for Session {
    type Command = SessionCommand;
    type Event = SessionEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        let ts = &mut self.timestamps;
        match event {
            SessionEvent::Applied {
                session_id,
                campaign_id,
                tester_id,
                owner_id,
                at,
            } => {
                self.id = *session_id;
                self.campaign_id = Some(*campaign_id);
                self.tester_id = Some(*tester_id);
                self.owner_id = Some(*owner_id);
                self.status = SessionStatus::Pending;
                self.created = true;
                stamp(&mut ts.applied_at, *at);
            }
            SessionEvent::Accepted {
                scheduled_purchase_date,
                at,
                ..
            } => {
                self.status = SessionStatus::Accepted;
                self.scheduled_purchase_date = *scheduled_purchase_date;
                stamp(&mut ts.accepted_at, *at);
            }
            SessionEvent::Rejected { reason, at } => {
                self.status = SessionStatus::Rejected;
                self.rejection_reason = Some(reason.clone());
                stamp(&mut ts.rejected_at, *at);
            }
            SessionEvent::Started { at } => {
                self.status = SessionStatus::InProgress;
                stamp(&mut ts.started_at, *at);
            }
            SessionEvent::StepCompleted { .. } => {}
            SessionEvent::ProceduresCompleted { at } => {
                self.status = SessionStatus::ProceduresCompleted;
                stamp(&mut ts.procedures_completed_at, *at);
            }
            SessionEvent::PriceValidated {
                price,
                shipping_cost,
                at,
            } => {
                self.status = SessionStatus::PriceValidated;
                self.validated_price = Some(*price);
                self.product_cost = Some(*price);
                self.shipping_cost = Some(*shipping_cost);
                stamp(&mut ts.price_validated_at, *at);
            }
            SessionEvent::PurchaseSubmitted {
                order_id,
                proof_url,
                at,
                ..
            } => {
                self.status = SessionStatus::PurchaseSubmitted;
                self.order_id = order_id.clone();
                self.purchase_proof_url = proof_url.clone();
                if let Some(rejection) = self.pending_purchase_rejection.take() {
                    self.purchase_rejections.push(rejection);
                }
                stamp(&mut ts.purchase_submitted_at, *at);
            }
            SessionEvent::PurchaseValidated { at } => {
                self.status = SessionStatus::PurchaseValidated;
                if let Some(rejection) = self.pending_purchase_rejection.take() {
                    self.purchase_rejections.push(rejection);
                }
                stamp(&mut ts.purchase_validated_at, *at);
            }
            SessionEvent::PurchaseRejected { reason, at } => {
                self.pending_purchase_rejection = Some(Rejection {
                    reason: reason.clone(),
                    at: *at,
                });
            }
            SessionEvent::TestSubmitted { submission, at } => {
                self.status = SessionStatus::Submitted;
                self.test_submission = Some(submission.clone());
                stamp(&mut ts.submitted_at, *at);
            }
            SessionEvent::TestValidated {
                rating,
                reward_amount,
                at,
            } => {
                self.status = SessionStatus::Completed;
                self.reward_amount = Some(*reward_amount);
                if let Some(rating) = rating {
                    self.rating = Some(rating.clone());
                    stamp(&mut ts.rated_at, *at);
                }
                stamp(&mut ts.completed_at, *at);
            }
            SessionEvent::UgcRequested {
                rating,
                requests,
                potential_bonus,
                reward_amount,
                at,
            } => {
                self.status = SessionStatus::UgcRequested;
                self.rating = Some(rating.clone());
                self.ugc_requests = requests.clone();
                self.potential_bonus = *potential_bonus;
                self.reward_amount = Some(*reward_amount);
                stamp(&mut ts.rated_at, *at);
                stamp(&mut ts.ugc_requested_at, *at);
            }
            SessionEvent::UgcSubmitted { submissions, at } => {
                self.status = SessionStatus::UgcSubmitted;
                self.ugc_submissions = submissions.clone();
                if let Some(rejection) = self.pending_ugc_rejection.take() {
                    self.ugc_rejections.push(rejection);
                }
                stamp(&mut ts.ugc_submitted_at, *at);
            }
            SessionEvent::UgcDeclined { reason, at } => {
                self.status = SessionStatus::PendingClosure;
                self.ugc_decline_reason = Some(reason.clone());
                self.potential_bonus = 0;
                stamp(&mut ts.ugc_declined_at, *at);
            }
            SessionEvent::UgcValidated { at } => {
                self.status = SessionStatus::PendingClosure;
                stamp(&mut ts.ugc_validated_at, *at);
            }
            SessionEvent::UgcRejected { reason, at } => {
                self.status = SessionStatus::UgcRequested;
                self.pending_ugc_rejection = Some(Rejection {
                    reason: reason.clone(),
                    at: *at,
                });
            }
            SessionEvent::Closed { final_bonus, at, .. } => {
                self.status = SessionStatus::Completed;
                self.final_bonus = Some(*final_bonus);
                stamp(&mut ts.completed_at, *at);
            }
            SessionEvent::TesterRated { rating, at } => {
                self.rating = Some(rating.clone());
                stamp(&mut ts.rated_at, *at);
            }
            SessionEvent::RatingUpdated { rating, .. } => {
                self.rating = Some(rating.clone());
            }
            SessionEvent::DeadlineExpired { at, .. } => {
                stamp(&mut ts.deadline_expired_at, *at);
            }
            SessionEvent::Cancelled { reason, at, .. } => {
                self.status = SessionStatus::Cancelled;
                self.cancellation_reason = reason.clone();
                stamp(&mut ts.cancelled_at, *at);
            }
            SessionEvent::Disputed { reason, at, .. } => {
                self.status = SessionStatus::Disputed;
                self.dispute_reason = Some(reason.clone());
                stamp(&mut ts.disputed_at, *at);
            }
            SessionEvent::DisputeResolved { outcome, note, at } => {
                self.dispute_resolution = Some(DisputeResolution {
                    outcome: outcome.clone(),
                    note: note.clone(),
                    resolved_at: *at,
                });
            }
            SessionEvent::StatusForced { to, reason, at, .. } => {
                self.status = *to;
                self.status_override_reason = Some(reason.clone());
                stamp(&mut ts.status_forced_at, *at);
            }
        }

        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        let SessionCommand { actor, at, action } = command;
        let (actor, at) = (*actor, *at);

        if !self.created && !matches!(action, SessionAction::Apply { .. }) {
            return Err(DomainError::not_found(format!("session {}", self.id)));
        }

        match action {
            SessionAction::Apply {
                campaign_id,
                tester_id,
                campaign,
                scheduled_purchase_date,
            } => self.handle_apply(actor, at, *campaign_id, *tester_id, campaign, *scheduled_purchase_date),
            SessionAction::Accept {
                campaign,
                scheduled_purchase_date,
            } => self.handle_accept(actor, at, campaign, *scheduled_purchase_date),
            SessionAction::Reject { reason } => self.handle_reject(actor, at, reason),
            SessionAction::CompleteStep {
                step_id,
                all_required_complete,
            } => self.handle_complete_step(actor, at, *step_id, *all_required_complete),
            SessionAction::ValidatePrice { price, offer } => {
                self.handle_validate_price(actor, at, *price, offer)
            }
            SessionAction::SubmitPurchase {
                order_id,
                proof_url,
            } => self.handle_submit_purchase(actor, at, order_id, proof_url),
            SessionAction::ValidatePurchase => self.handle_validate_purchase(actor, at),
            SessionAction::RejectPurchase { reason } => self.handle_reject_purchase(actor, at, reason),
            SessionAction::SubmitTest { submission } => self.handle_submit_test(actor, at, submission),
            SessionAction::ValidateTest {
                rating,
                comment,
                offer,
            } => self.handle_validate_test(actor, at, *rating, comment, offer),
            SessionAction::RequestUgc {
                rating,
                comment,
                requests,
                offer,
            } => self.handle_request_ugc(actor, at, *rating, comment, requests, offer),
            SessionAction::SubmitUgc { submissions } => self.handle_submit_ugc(actor, at, submissions),
            SessionAction::DeclineUgc { reason } => self.handle_decline_ugc(actor, at, reason),
            SessionAction::ValidateUgc => self.handle_validate_ugc(actor, at),
            SessionAction::RejectUgc { reason } => self.handle_reject_ugc(actor, at, reason),
            SessionAction::Close => self.handle_close(actor, at),
            SessionAction::RateTester {
                score,
                comment,
                campaign,
            } => self.handle_rate_tester(actor, at, *score, comment, campaign),
            SessionAction::UpdateRating { score, comment } => {
                self.handle_update_rating(actor, at, *score, comment)
            }
            SessionAction::Cancel { reason } => self.handle_cancel(actor, at, reason),
            SessionAction::Dispute { reason } => self.handle_dispute(actor, at, reason),
            SessionAction::ResolveDispute { outcome, note } => {
                self.handle_resolve_dispute(actor, at, outcome, note)
            }
            SessionAction::ForceStatus { status, reason } => {
                self.handle_force_status(actor, at, *status, reason)
            }
        }
    }
}

fn describe(statuses: &[SessionStatus]) -> String {
    match statuses {
        [] => String::new(),
        [only] => only.to_string(),
        [init @ .., last] => {
            let head: Vec<&str> = init.iter().map(SessionStatus::as_str).collect();
            format!("{} or {last}", head.join(", "))
        }
    }
}

fn required_text(value: &str, what: &str) -> DomainResult<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(DomainError::validation(format!("{what} is required")));
    }
    Ok(trimmed.to_string())
}

fn optional_text(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn tester_rating(score: u8, comment: &Option<String>) -> DomainResult<TesterRating> {
    if !(1..=5).contains(&score) {
        return Err(DomainError::validation(format!(
            "rating must be between 1 and 5, got {score}"
        )));
    }
    Ok(TesterRating {
        score,
        comment: optional_text(comment),
    })
}

fn is_empty_submission(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(fields) => fields.is_empty(),
        _ => false,
    }
}

impl Session {
    fn ensure_status(&self, allowed: &[SessionStatus], action: &str) -> DomainResult<()> {
        if allowed.contains(&self.status) {
            return Ok(());
        }
        Err(DomainError::precondition(format!(
            "session must be {} to {action}, current status is {}",
            describe(allowed),
            self.status
        )))
    }

    fn tester(&self) -> UserId {
        self.tester_id.unwrap_or_default()
    }

    fn owner(&self) -> UserId {
        self.owner_id.unwrap_or_default()
    }

    /// Test reward: reimbursed costs (when a purchase was validated) plus the fee.
    fn test_reward(&self, offer: &Offer) -> i64 {
        match self.product_cost {
            Some(product_cost) => {
                product_cost + self.shipping_cost.unwrap_or(offer.shipping_cost) + offer.reward_amount
            }
            None => offer.reward_amount,
        }
    }

    fn handle_apply(
        &self,
        actor: Actor,
        at: DateTime<Utc>,
        campaign_id: CampaignId,
        tester_id: UserId,
        campaign: &CampaignFacts,
        scheduled_purchase_date: Option<NaiveDate>,
    ) -> DomainResult<Vec<SessionEvent>> {
        if self.created {
            return Err(DomainError::conflict(format!("session {} already exists", self.id)));
        }
        ensure_tester(&actor, tester_id, "apply")?;

        if !campaign.active {
            return Err(DomainError::precondition(
                "campaign must be ACTIVE to accept applications",
            ));
        }
        if campaign.available_slots == 0 {
            return Err(DomainError::precondition("no slots available"));
        }

        let mut events = vec![SessionEvent::Applied {
            session_id: self.id,
            campaign_id,
            tester_id,
            owner_id: campaign.owner_id,
            at,
        }];
        if campaign.auto_accept {
            events.push(SessionEvent::Accepted {
                scheduled_purchase_date,
                auto_accepted: true,
                at,
            });
        }
        Ok(events)
    }

    fn handle_accept(
        &self,
        actor: Actor,
        at: DateTime<Utc>,
        campaign: &CampaignFacts,
        scheduled_purchase_date: Option<NaiveDate>,
    ) -> DomainResult<Vec<SessionEvent>> {
        ensure_owner_or_admin(&actor, self.owner(), "accept applications")?;
        self.ensure_status(&[SessionStatus::Pending], "accept")?;
        if campaign.available_slots == 0 {
            return Err(DomainError::precondition("no slots available"));
        }

        Ok(vec![SessionEvent::Accepted {
            scheduled_purchase_date,
            auto_accepted: false,
            at,
        }])
    }

    fn handle_reject(&self, actor: Actor, at: DateTime<Utc>, reason: &str) -> DomainResult<Vec<SessionEvent>> {
        ensure_owner_or_admin(&actor, self.owner(), "reject applications")?;
        self.ensure_status(&[SessionStatus::Pending], "reject")?;
        let reason = required_text(reason, "a rejection reason")?;

        Ok(vec![SessionEvent::Rejected { reason, at }])
    }

    fn handle_complete_step(
        &self,
        actor: Actor,
        at: DateTime<Utc>,
        step_id: StepId,
        all_required_complete: bool,
    ) -> DomainResult<Vec<SessionEvent>> {
        ensure_tester(&actor, self.tester(), "complete steps")?;
        self.ensure_status(
            &[
                SessionStatus::Accepted,
                SessionStatus::InProgress,
                SessionStatus::ProceduresCompleted,
            ],
            "complete a step",
        )?;

        let mut events = vec![SessionEvent::StepCompleted { step_id, at }];
        if self.status == SessionStatus::Accepted {
            events.push(SessionEvent::Started { at });
        }
        if all_required_complete && self.status != SessionStatus::ProceduresCompleted {
            events.push(SessionEvent::ProceduresCompleted { at });
        }
        Ok(events)
    }

    fn handle_validate_price(
        &self,
        actor: Actor,
        at: DateTime<Utc>,
        price: i64,
        offer: &Offer,
    ) -> DomainResult<Vec<SessionEvent>> {
        ensure_tester(&actor, self.tester(), "validate the price")?;
        self.ensure_status(&[SessionStatus::ProceduresCompleted], "validate the price")?;
        if self.validated_price.is_some() {
            return Err(DomainError::precondition("price already validated"));
        }
        validate_step_value(&StepType::PriceValidation, &Value::from(price))?;

        // Range first, then the exact price.
        if !offer.in_range(price) {
            return Err(DomainError::precondition(format!(
                "price {price} is outside the accepted range {}..={}",
                offer.min_price, offer.max_price
            )));
        }
        if price != offer.expected_price {
            return Err(DomainError::precondition(format!(
                "price {price} does not match the expected price {}",
                offer.expected_price
            )));
        }

        Ok(vec![SessionEvent::PriceValidated {
            price,
            shipping_cost: offer.shipping_cost,
            at,
        }])
    }

    fn handle_submit_purchase(
        &self,
        actor: Actor,
        at: DateTime<Utc>,
        order_id: &Option<String>,
        proof_url: &Option<String>,
    ) -> DomainResult<Vec<SessionEvent>> {
        ensure_tester(&actor, self.tester(), "submit the purchase")?;

        let resubmission = self.status == SessionStatus::PurchaseSubmitted
            && self.pending_purchase_rejection.is_some();
        if !resubmission {
            self.ensure_status(&[SessionStatus::PriceValidated], "submit the purchase")?;
        }

        let order_id = optional_text(order_id);
        let proof_url = optional_text(proof_url);
        if order_id.is_none() && proof_url.is_none() {
            return Err(DomainError::validation(
                "an order identifier or a proof of purchase is required",
            ));
        }
        if let Some(url) = proof_url.as_deref().filter(|u| !is_well_formed_url(u)) {
            return Err(DomainError::validation(format!(
                "proof of purchase must be a well-formed URL, got \"{url}\""
            )));
        }

        // A resubmission corrects the proof of a purchase already made on the day.
        if let (false, Some(scheduled), Some(deadline)) =
            (resubmission, self.scheduled_purchase_date, self.purchase_deadline())
        {
            if at >= deadline {
                return Err(DomainError::precondition(format!(
                    "purchase deadline passed at the end of {scheduled}"
                )));
            }
            let today = at.date_naive();
            if today != scheduled {
                return Err(DomainError::precondition(format!(
                    "purchase must be made on {scheduled}, today is {today}"
                )));
            }
        }

        Ok(vec![SessionEvent::PurchaseSubmitted {
            order_id,
            proof_url,
            resubmission,
            at,
        }])
    }

    fn handle_validate_purchase(&self, actor: Actor, at: DateTime<Utc>) -> DomainResult<Vec<SessionEvent>> {
        ensure_owner(&actor, self.owner(), "validate the purchase")?;
        self.ensure_status(&[SessionStatus::PurchaseSubmitted], "validate the purchase")?;
        if self.order_id.is_none() {
            return Err(DomainError::validation(
                "an order identifier is required to validate the purchase",
            ));
        }

        Ok(vec![SessionEvent::PurchaseValidated { at }])
    }

    fn handle_reject_purchase(
        &self,
        actor: Actor,
        at: DateTime<Utc>,
        reason: &str,
    ) -> DomainResult<Vec<SessionEvent>> {
        ensure_owner(&actor, self.owner(), "reject the purchase")?;
        self.ensure_status(&[SessionStatus::PurchaseSubmitted], "reject the purchase")?;
        if self.pending_purchase_rejection.is_some() {
            return Err(DomainError::precondition(
                "purchase was already rejected and awaits resubmission",
            ));
        }
        let reason = required_text(reason, "a rejection reason")?;

        Ok(vec![SessionEvent::PurchaseRejected { reason, at }])
    }

    fn handle_submit_test(
        &self,
        actor: Actor,
        at: DateTime<Utc>,
        submission: &Value,
    ) -> DomainResult<Vec<SessionEvent>> {
        ensure_tester(&actor, self.tester(), "submit the test")?;
        self.ensure_status(
            &[SessionStatus::PurchaseValidated, SessionStatus::InProgress],
            "submit the test",
        )?;
        if is_empty_submission(submission) {
            return Err(DomainError::validation("test submission must not be empty"));
        }

        Ok(vec![SessionEvent::TestSubmitted {
            submission: submission.clone(),
            at,
        }])
    }

    fn handle_validate_test(
        &self,
        actor: Actor,
        at: DateTime<Utc>,
        score: Option<u8>,
        comment: &Option<String>,
        offer: &Offer,
    ) -> DomainResult<Vec<SessionEvent>> {
        ensure_owner_or_admin(&actor, self.owner(), "validate the test")?;
        self.ensure_status(&[SessionStatus::Submitted], "validate the test")?;
        let rating = score.map(|s| tester_rating(s, comment)).transpose()?;

        Ok(vec![SessionEvent::TestValidated {
            rating,
            reward_amount: self.test_reward(offer),
            at,
        }])
    }

    fn handle_request_ugc(
        &self,
        actor: Actor,
        at: DateTime<Utc>,
        score: u8,
        comment: &Option<String>,
        requests: &[UgcRequest],
        offer: &Offer,
    ) -> DomainResult<Vec<SessionEvent>> {
        ensure_owner(&actor, self.owner(), "request extra content")?;
        self.ensure_status(&[SessionStatus::Submitted], "request extra content")?;
        let rating = tester_rating(score, comment)?;

        if requests.is_empty() {
            return Err(DomainError::validation(
                "at least one content request is required",
            ));
        }
        if let Some(bad) = requests.iter().find(|r| r.bonus < 0) {
            return Err(DomainError::validation(format!(
                "content bonus must not be negative, got {}",
                bad.bonus
            )));
        }
        let potential_bonus = requests.iter().map(|r| r.bonus).sum();

        Ok(vec![SessionEvent::UgcRequested {
            rating,
            requests: requests.to_vec(),
            potential_bonus,
            reward_amount: self.test_reward(offer),
            at,
        }])
    }

    fn handle_submit_ugc(
        &self,
        actor: Actor,
        at: DateTime<Utc>,
        submissions: &[UgcSubmission],
    ) -> DomainResult<Vec<SessionEvent>> {
        ensure_tester(&actor, self.tester(), "submit extra content")?;
        self.ensure_status(&[SessionStatus::UgcRequested], "submit extra content")?;
        if submissions.is_empty() {
            return Err(DomainError::validation(
                "at least one content submission is required",
            ));
        }
        if let Some(bad) = submissions.iter().find(|s| !is_well_formed_url(&s.url)) {
            return Err(DomainError::validation(format!(
                "content submission must be a well-formed URL, got \"{}\"",
                bad.url
            )));
        }

        Ok(vec![SessionEvent::UgcSubmitted {
            submissions: submissions.to_vec(),
            at,
        }])
    }

    fn handle_decline_ugc(&self, actor: Actor, at: DateTime<Utc>, reason: &str) -> DomainResult<Vec<SessionEvent>> {
        ensure_tester(&actor, self.tester(), "decline extra content")?;
        self.ensure_status(&[SessionStatus::UgcRequested], "decline extra content")?;
        let reason = required_text(reason, "a reason for declining")?;

        Ok(vec![SessionEvent::UgcDeclined { reason, at }])
    }

    fn handle_validate_ugc(&self, actor: Actor, at: DateTime<Utc>) -> DomainResult<Vec<SessionEvent>> {
        ensure_owner(&actor, self.owner(), "validate extra content")?;
        self.ensure_status(&[SessionStatus::UgcSubmitted], "validate extra content")?;

        Ok(vec![SessionEvent::UgcValidated { at }])
    }

    fn handle_reject_ugc(&self, actor: Actor, at: DateTime<Utc>, reason: &str) -> DomainResult<Vec<SessionEvent>> {
        ensure_owner(&actor, self.owner(), "reject extra content")?;
        self.ensure_status(&[SessionStatus::UgcSubmitted], "reject extra content")?;
        let reason = required_text(reason, "a rejection reason")?;

        Ok(vec![SessionEvent::UgcRejected { reason, at }])
    }

    fn handle_close(&self, actor: Actor, at: DateTime<Utc>) -> DomainResult<Vec<SessionEvent>> {
        ensure_owner(&actor, self.owner(), "close the session")?;
        self.ensure_status(&[SessionStatus::PendingClosure], "close")?;

        let final_bonus = if self.timestamps.ugc_validated_at.is_some() {
            self.potential_bonus
        } else {
            0
        };
        Ok(vec![SessionEvent::Closed {
            reward_amount: self.reward_amount.unwrap_or(0),
            final_bonus,
            at,
        }])
    }

    fn handle_rate_tester(
        &self,
        actor: Actor,
        at: DateTime<Utc>,
        score: u8,
        comment: &Option<String>,
        campaign: &CampaignFacts,
    ) -> DomainResult<Vec<SessionEvent>> {
        ensure_owner(&actor, self.owner(), "rate the tester")?;
        if !campaign.ended {
            return Err(DomainError::precondition(
                "campaign must have ended to rate the tester",
            ));
        }
        self.ensure_status(
            &[
                SessionStatus::InProgress,
                SessionStatus::Submitted,
                SessionStatus::Completed,
            ],
            "rate the tester",
        )?;
        if self.rating.is_some() {
            return Err(DomainError::precondition("tester already rated for this session"));
        }

        Ok(vec![SessionEvent::TesterRated {
            rating: tester_rating(score, comment)?,
            at,
        }])
    }

    fn handle_update_rating(
        &self,
        actor: Actor,
        at: DateTime<Utc>,
        score: u8,
        comment: &Option<String>,
    ) -> DomainResult<Vec<SessionEvent>> {
        ensure_owner(&actor, self.owner(), "update the rating")?;
        if self.rating.is_none() {
            return Err(DomainError::precondition("session has no rating to update"));
        }

        Ok(vec![SessionEvent::RatingUpdated {
            rating: tester_rating(score, comment)?,
            at,
        }])
    }

    fn handle_cancel(
        &self,
        actor: Actor,
        at: DateTime<Utc>,
        reason: &Option<String>,
    ) -> DomainResult<Vec<SessionEvent>> {
        let sweeping = actor.role == Role::System;
        if !sweeping {
            ensure_tester(&actor, self.tester(), "cancel")?;
        }
        if !self.status.is_cancellable() {
            return Err(DomainError::precondition(format!(
                "session cannot be cancelled, current status is {}",
                self.status
            )));
        }

        let released_slot = self.status.releases_slot_on_cancel();
        if !sweeping {
            return Ok(vec![SessionEvent::Cancelled {
                reason: optional_text(reason),
                released_slot,
                at,
            }]);
        }

        // The sweep may only cancel sessions whose purchase day is over.
        let scheduled = match self.scheduled_purchase_date {
            Some(date) if self.is_past_purchase_deadline(at) => date,
            _ => {
                return Err(DomainError::precondition(format!(
                    "purchase deadline has not expired for session {} (status {})",
                    self.id, self.status
                )));
            }
        };
        Ok(vec![
            SessionEvent::DeadlineExpired {
                scheduled_purchase_date: scheduled,
                at,
            },
            SessionEvent::Cancelled {
                reason: Some(
                    optional_text(reason).unwrap_or_else(|| "purchase deadline expired".to_string()),
                ),
                released_slot,
                at,
            },
        ])
    }

    fn handle_dispute(&self, actor: Actor, at: DateTime<Utc>, reason: &str) -> DomainResult<Vec<SessionEvent>> {
        ensure_party(&actor, self.tester(), self.owner(), "open a dispute")?;
        if self.status == SessionStatus::Disputed {
            return Err(DomainError::precondition("session is already DISPUTED"));
        }
        let reason = required_text(reason, "a dispute reason")?;

        Ok(vec![SessionEvent::Disputed {
            reason,
            raised_by: actor.role,
            at,
        }])
    }

    fn handle_resolve_dispute(
        &self,
        actor: Actor,
        at: DateTime<Utc>,
        outcome: &str,
        note: &Option<String>,
    ) -> DomainResult<Vec<SessionEvent>> {
        ensure_admin(&actor, "resolve disputes")?;
        self.ensure_status(&[SessionStatus::Disputed], "resolve the dispute")?;
        if self.dispute_resolution.is_some() {
            return Err(DomainError::precondition("dispute already resolved"));
        }
        let outcome = required_text(outcome, "a resolution outcome")?;

        Ok(vec![SessionEvent::DisputeResolved {
            outcome,
            note: optional_text(note),
            at,
        }])
    }

    fn handle_force_status(
        &self,
        actor: Actor,
        at: DateTime<Utc>,
        status: SessionStatus,
        reason: &str,
    ) -> DomainResult<Vec<SessionEvent>> {
        ensure_admin(&actor, "force a status change")?;
        let reason = required_text(reason, "an override reason")?;

        Ok(vec![SessionEvent::StatusForced {
            from: self.status,
            to: status,
            reason,
            at,
        }])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;
    use tryout_core::aggregate::execute;

    struct World {
        tester: UserId,
        owner: UserId,
        campaign_id: CampaignId,
        offer: Offer,
        purchase_day: NaiveDate,
    }

    impl World {
        fn new() -> Self {
            Self {
                tester: UserId::new(),
                owner: UserId::new(),
                campaign_id: CampaignId::new(),
                offer: Offer::exact(2_000, 300, 1_000).unwrap(),
                purchase_day: NaiveDate::from_ymd_opt(2026, 10, 21).unwrap(),
            }
        }

        fn facts(&self, slots: u32, auto_accept: bool) -> CampaignFacts {
            CampaignFacts {
                owner_id: self.owner,
                active: true,
                available_slots: slots,
                auto_accept,
                ended: false,
            }
        }

        fn tester(&self) -> Actor {
            Actor::tester(self.tester)
        }

        fn owner(&self) -> Actor {
            Actor::seller(self.owner)
        }

        fn on_purchase_day(&self) -> DateTime<Utc> {
            Utc.from_utc_datetime(&self.purchase_day.and_hms_opt(10, 0, 0).unwrap())
        }

        fn run(&self, session: &mut Session, actor: Actor, action: SessionAction) -> DomainResult<Vec<SessionEvent>> {
            execute(session, &SessionCommand::new(actor, self.on_purchase_day(), action))
        }

        fn accepted(&self) -> Session {
            let mut session = Session::empty(SessionId::new());
            self.run(
                &mut session,
                self.tester(),
                SessionAction::Apply {
                    campaign_id: self.campaign_id,
                    tester_id: self.tester,
                    campaign: self.facts(3, false),
                    scheduled_purchase_date: None,
                },
            )
            .unwrap();
            self.run(
                &mut session,
                self.owner(),
                SessionAction::Accept {
                    campaign: self.facts(3, false),
                    scheduled_purchase_date: Some(self.purchase_day),
                },
            )
            .unwrap();
            session
        }

        fn price_validated(&self) -> Session {
            let mut session = self.accepted();
            self.run(
                &mut session,
                self.tester(),
                SessionAction::CompleteStep {
                    step_id: StepId::new(),
                    all_required_complete: true,
                },
            )
            .unwrap();
            self.run(
                &mut session,
                self.tester(),
                SessionAction::ValidatePrice {
                    price: 2_000,
                    offer: self.offer.clone(),
                },
            )
            .unwrap();
            session
        }

        fn submitted(&self) -> Session {
            let mut session = self.price_validated();
            self.run(
                &mut session,
                self.tester(),
                SessionAction::SubmitPurchase {
                    order_id: Some("A-1001".to_string()),
                    proof_url: None,
                },
            )
            .unwrap();
            self.run(&mut session, self.owner(), SessionAction::ValidatePurchase)
                .unwrap();
            self.run(
                &mut session,
                self.tester(),
                SessionAction::SubmitTest {
                    submission: json!({"verdict": "solid"}),
                },
            )
            .unwrap();
            session
        }
    }

    #[test]
    fn apply_creates_pending_session_without_slot_effect() {
        let world = World::new();
        let mut session = Session::empty(SessionId::new());
        let events = world
            .run(
                &mut session,
                world.tester(),
                SessionAction::Apply {
                    campaign_id: world.campaign_id,
                    tester_id: world.tester,
                    campaign: world.facts(1, false),
                    scheduled_purchase_date: None,
                },
            )
            .unwrap();

        assert_eq!(session.status(), SessionStatus::Pending);
        assert!(events.iter().all(|e| e.slot_effect() == SlotEffect::None));
        assert_eq!(session.version(), 1);
    }

    #[test]
    fn auto_accept_reserves_on_creation() {
        let world = World::new();
        let mut session = Session::empty(SessionId::new());
        let events = world
            .run(
                &mut session,
                world.tester(),
                SessionAction::Apply {
                    campaign_id: world.campaign_id,
                    tester_id: world.tester,
                    campaign: world.facts(1, true),
                    scheduled_purchase_date: Some(world.purchase_day),
                },
            )
            .unwrap();

        assert_eq!(session.status(), SessionStatus::Accepted);
        assert_eq!(session.scheduled_purchase_date(), Some(world.purchase_day));
        assert_eq!(events.last().unwrap().slot_effect(), SlotEffect::Reserve);
    }

    #[test]
    fn apply_requires_active_campaign_with_slots() {
        let world = World::new();
        let session = Session::empty(SessionId::new());
        let mut inactive = world.facts(1, false);
        inactive.active = false;

        for facts in [inactive, world.facts(0, false)] {
            let cmd = SessionCommand::new(
                world.tester(),
                Utc::now(),
                SessionAction::Apply {
                    campaign_id: world.campaign_id,
                    tester_id: world.tester,
                    campaign: facts,
                    scheduled_purchase_date: None,
                },
            );
            assert!(matches!(session.handle(&cmd), Err(DomainError::PreconditionFailed(_))));
        }
    }

    #[test]
    fn only_owner_or_admin_may_accept() {
        let world = World::new();
        let mut session = Session::empty(SessionId::new());
        world
            .run(
                &mut session,
                world.tester(),
                SessionAction::Apply {
                    campaign_id: world.campaign_id,
                    tester_id: world.tester,
                    campaign: world.facts(1, false),
                    scheduled_purchase_date: None,
                },
            )
            .unwrap();

        let accept = SessionAction::Accept {
            campaign: world.facts(1, false),
            scheduled_purchase_date: None,
        };
        let err = world.run(&mut session.clone(), world.tester(), accept.clone()).unwrap_err();
        assert!(matches!(err, DomainError::Forbidden(_)));

        let admin = Actor::admin(UserId::new());
        world.run(&mut session, admin, accept).unwrap();
        assert_eq!(session.status(), SessionStatus::Accepted);
    }

    #[test]
    fn rejection_needs_reason_and_pending_status() {
        let world = World::new();
        let mut session = world.accepted();
        let err = world
            .run(&mut session, world.owner(), SessionAction::Reject { reason: "spam".into() })
            .unwrap_err();
        assert_eq!(
            err,
            DomainError::PreconditionFailed(
                "session must be PENDING to reject, current status is ACCEPTED".into()
            )
        );

        let mut pending = Session::empty(SessionId::new());
        world
            .run(
                &mut pending,
                world.tester(),
                SessionAction::Apply {
                    campaign_id: world.campaign_id,
                    tester_id: world.tester,
                    campaign: world.facts(1, false),
                    scheduled_purchase_date: None,
                },
            )
            .unwrap();
        let err = world
            .run(&mut pending, world.owner(), SessionAction::Reject { reason: "  ".into() })
            .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[test]
    fn first_step_starts_and_last_required_step_completes_procedures() {
        let world = World::new();
        let mut session = world.accepted();

        world
            .run(
                &mut session,
                world.tester(),
                SessionAction::CompleteStep {
                    step_id: StepId::new(),
                    all_required_complete: false,
                },
            )
            .unwrap();
        assert_eq!(session.status(), SessionStatus::InProgress);

        world
            .run(
                &mut session,
                world.tester(),
                SessionAction::CompleteStep {
                    step_id: StepId::new(),
                    all_required_complete: true,
                },
            )
            .unwrap();
        assert_eq!(session.status(), SessionStatus::ProceduresCompleted);
    }

    #[test]
    fn price_must_be_in_range_and_exact() {
        let world = World::new();
        let mut session = world.accepted();
        world
            .run(
                &mut session,
                world.tester(),
                SessionAction::CompleteStep {
                    step_id: StepId::new(),
                    all_required_complete: true,
                },
            )
            .unwrap();

        let wide = Offer::new(2_000, 1_500, 2_500, 0, 0).unwrap();
        let err = world
            .run(
                &mut session,
                world.tester(),
                SessionAction::ValidatePrice {
                    price: 0,
                    offer: wide.clone(),
                },
            )
            .unwrap_err();
        assert!(matches!(err, DomainError::Validation(msg) if msg.contains("positive price")));

        let err = world
            .run(
                &mut session,
                world.tester(),
                SessionAction::ValidatePrice {
                    price: 2_100,
                    offer: wide.clone(),
                },
            )
            .unwrap_err();
        assert!(matches!(err, DomainError::PreconditionFailed(msg) if msg.contains("expected price")));

        let err = world
            .run(
                &mut session,
                world.tester(),
                SessionAction::ValidatePrice {
                    price: 3_000,
                    offer: wide,
                },
            )
            .unwrap_err();
        assert!(matches!(err, DomainError::PreconditionFailed(msg) if msg.contains("range")));
    }

    #[test]
    fn purchase_cannot_skip_price_validation() {
        let world = World::new();
        let mut session = world.accepted();
        let err = world
            .run(
                &mut session,
                world.tester(),
                SessionAction::SubmitPurchase {
                    order_id: Some("A-1".into()),
                    proof_url: None,
                },
            )
            .unwrap_err();
        assert!(matches!(err, DomainError::PreconditionFailed(msg) if msg.contains("PRICE_VALIDATED")));
    }

    #[test]
    fn purchase_day_and_deadline_are_enforced() {
        let world = World::new();
        let session = world.price_validated();
        let submit = SessionAction::SubmitPurchase {
            order_id: Some("A-1".into()),
            proof_url: None,
        };

        let day_before = world.on_purchase_day() - chrono::Duration::days(1);
        let err = session
            .handle(&SessionCommand::new(world.tester(), day_before, submit.clone()))
            .unwrap_err();
        assert!(matches!(err, DomainError::PreconditionFailed(msg) if msg.contains("must be made on")));

        let day_after = world.on_purchase_day() + chrono::Duration::days(1);
        let err = session
            .handle(&SessionCommand::new(world.tester(), day_after, submit.clone()))
            .unwrap_err();
        assert!(matches!(err, DomainError::PreconditionFailed(msg) if msg.contains("deadline")));

        assert!(
            session
                .handle(&SessionCommand::new(world.tester(), world.on_purchase_day(), submit))
                .is_ok()
        );
    }

    #[test]
    fn rejected_purchase_is_resubmitted_and_keeps_history() {
        let world = World::new();
        let mut session = world.price_validated();
        world
            .run(
                &mut session,
                world.tester(),
                SessionAction::SubmitPurchase {
                    order_id: None,
                    proof_url: Some("https://shop.example.com/receipt/1".into()),
                },
            )
            .unwrap();

        let err = world
            .run(&mut session, world.owner(), SessionAction::ValidatePurchase)
            .unwrap_err();
        assert!(matches!(err, DomainError::Validation(msg) if msg.contains("order identifier")));

        world
            .run(
                &mut session,
                world.owner(),
                SessionAction::RejectPurchase {
                    reason: "receipt unreadable".into(),
                },
            )
            .unwrap();
        assert_eq!(session.status(), SessionStatus::PurchaseSubmitted);
        assert!(session.pending_purchase_rejection().is_some());

        world
            .run(
                &mut session,
                world.tester(),
                SessionAction::SubmitPurchase {
                    order_id: Some("A-77".into()),
                    proof_url: None,
                },
            )
            .unwrap();
        assert!(session.pending_purchase_rejection().is_none());
        assert_eq!(session.purchase_rejections().len(), 1);

        world
            .run(&mut session, world.owner(), SessionAction::ValidatePurchase)
            .unwrap();
        assert_eq!(session.status(), SessionStatus::PurchaseValidated);
    }

    #[test]
    fn purchase_rejected_after_the_day_can_still_move_forward() {
        let world = World::new();
        let day_after = Utc.from_utc_datetime(
            &(world.purchase_day + Days::new(1)).and_hms_opt(9, 0, 0).unwrap(),
        );
        let late = |session: &mut Session, actor: Actor, action: SessionAction| {
            execute(session, &SessionCommand::new(actor, day_after, action))
        };

        let mut session = world.price_validated();
        world
            .run(
                &mut session,
                world.tester(),
                SessionAction::SubmitPurchase {
                    order_id: Some("A-1001".into()),
                    proof_url: None,
                },
            )
            .unwrap();
        let reject = SessionAction::RejectPurchase {
            reason: "order number not found".into(),
        };
        late(&mut session, world.owner(), reject.clone()).unwrap();

        late(
            &mut session,
            world.tester(),
            SessionAction::SubmitPurchase {
                order_id: Some("A-1002".into()),
                proof_url: None,
            },
        )
        .unwrap();
        assert_eq!(session.order_id(), Some("A-1002"));

        // The owner may also accept the purchase without waiting for a correction.
        late(&mut session, world.owner(), reject).unwrap();
        late(&mut session, world.owner(), SessionAction::ValidatePurchase).unwrap();
        assert_eq!(session.status(), SessionStatus::PurchaseValidated);
        assert!(session.pending_purchase_rejection().is_none());
        assert_eq!(session.purchase_rejections().len(), 2);
    }

    #[test]
    fn first_purchase_submission_after_the_day_is_refused() {
        let world = World::new();
        let day_after = Utc.from_utc_datetime(
            &(world.purchase_day + Days::new(1)).and_hms_opt(9, 0, 0).unwrap(),
        );
        let mut session = world.price_validated();
        let err = execute(
            &mut session,
            &SessionCommand::new(
                world.tester(),
                day_after,
                SessionAction::SubmitPurchase {
                    order_id: Some("A-1001".into()),
                    proof_url: None,
                },
            ),
        )
        .unwrap_err();
        assert!(matches!(err, DomainError::PreconditionFailed(msg) if msg.contains("deadline")));
    }

    #[test]
    fn validate_test_completes_with_full_reward() {
        let world = World::new();
        let mut session = world.submitted();
        world
            .run(
                &mut session,
                world.owner(),
                SessionAction::ValidateTest {
                    rating: Some(5),
                    comment: Some("thorough".into()),
                    offer: world.offer.clone(),
                },
            )
            .unwrap();

        assert_eq!(session.status(), SessionStatus::Completed);
        assert_eq!(session.reward_amount(), Some(2_000 + 300 + 1_000));
        assert_eq!(session.rating().map(|r| r.score), Some(5));
    }

    #[test]
    fn content_loop_rejects_then_validates_then_closes_with_bonus() {
        let world = World::new();
        let mut session = world.submitted();
        let requests = vec![
            UgcRequest {
                kind: UgcKind::Video,
                description: "30s unboxing".into(),
                bonus: 1_500,
            },
            UgcRequest {
                kind: UgcKind::Review,
                description: "store review".into(),
                bonus: 500,
            },
        ];

        let err = world
            .run(
                &mut session,
                world.owner(),
                SessionAction::RequestUgc {
                    rating: 0,
                    comment: None,
                    requests: requests.clone(),
                    offer: world.offer.clone(),
                },
            )
            .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));

        world
            .run(
                &mut session,
                world.owner(),
                SessionAction::RequestUgc {
                    rating: 4,
                    comment: None,
                    requests,
                    offer: world.offer.clone(),
                },
            )
            .unwrap();
        assert_eq!(session.potential_bonus(), 2_000);

        let submission = vec![UgcSubmission {
            kind: UgcKind::Video,
            url: "https://video.example.com/v/1".into(),
            note: None,
        }];
        world
            .run(
                &mut session,
                world.tester(),
                SessionAction::SubmitUgc {
                    submissions: submission.clone(),
                },
            )
            .unwrap();
        world
            .run(
                &mut session,
                world.owner(),
                SessionAction::RejectUgc {
                    reason: "too short".into(),
                },
            )
            .unwrap();
        assert_eq!(session.status(), SessionStatus::UgcRequested);

        world
            .run(
                &mut session,
                world.tester(),
                SessionAction::SubmitUgc {
                    submissions: submission,
                },
            )
            .unwrap();
        world
            .run(&mut session, world.owner(), SessionAction::ValidateUgc)
            .unwrap();
        assert_eq!(session.status(), SessionStatus::PendingClosure);

        let events = world
            .run(&mut session, world.owner(), SessionAction::Close)
            .unwrap();
        assert_eq!(session.status(), SessionStatus::Completed);
        assert_eq!(session.final_bonus(), Some(2_000));
        assert_eq!(session.ugc_rejections().len(), 1);
        assert!(matches!(
            events[0],
            SessionEvent::Closed {
                reward_amount: 3_300,
                final_bonus: 2_000,
                ..
            }
        ));
    }

    #[test]
    fn declining_content_zeroes_the_bonus() {
        let world = World::new();
        let mut session = world.submitted();
        world
            .run(
                &mut session,
                world.owner(),
                SessionAction::RequestUgc {
                    rating: 3,
                    comment: None,
                    requests: vec![UgcRequest {
                        kind: UgcKind::Photo,
                        description: "lifestyle shot".into(),
                        bonus: 700,
                    }],
                    offer: world.offer.clone(),
                },
            )
            .unwrap();
        world
            .run(
                &mut session,
                world.tester(),
                SessionAction::DeclineUgc {
                    reason: "no camera".into(),
                },
            )
            .unwrap();

        assert_eq!(session.status(), SessionStatus::PendingClosure);
        assert_eq!(session.potential_bonus(), 0);
        world.run(&mut session, world.owner(), SessionAction::Close).unwrap();
        assert_eq!(session.final_bonus(), Some(0));
    }

    #[test]
    fn cancel_releases_slot_only_while_accepted_or_in_progress() {
        let world = World::new();

        let mut accepted = world.accepted();
        let events = world
            .run(&mut accepted, world.tester(), SessionAction::Cancel { reason: None })
            .unwrap();
        assert_eq!(events[0].slot_effect(), SlotEffect::Release);

        let mut later = world.price_validated();
        let events = world
            .run(&mut later, world.tester(), SessionAction::Cancel { reason: None })
            .unwrap();
        assert_eq!(events[0].slot_effect(), SlotEffect::None);

        let err = world
            .run(&mut later, world.tester(), SessionAction::Cancel { reason: None })
            .unwrap_err();
        assert!(matches!(err, DomainError::PreconditionFailed(_)));
    }

    #[test]
    fn system_cancellation_requires_an_expired_deadline() {
        let world = World::new();
        let session = world.accepted();
        let cancel = SessionAction::Cancel { reason: None };

        let same_day = SessionCommand::new(Actor::system(), world.on_purchase_day(), cancel.clone());
        assert!(matches!(
            session.handle(&same_day),
            Err(DomainError::PreconditionFailed(_))
        ));

        let next_day = world.on_purchase_day() + chrono::Duration::days(1);
        let events = session
            .handle(&SessionCommand::new(Actor::system(), next_day, cancel))
            .unwrap();
        assert!(matches!(events[0], SessionEvent::DeadlineExpired { .. }));
        assert_eq!(events[1].slot_effect(), SlotEffect::Release);
    }

    #[test]
    fn disputes_come_from_parties_and_do_not_auto_resolve() {
        let world = World::new();
        let mut session = world.submitted();

        let stranger = Actor::tester(UserId::new());
        let err = world
            .run(&mut session, stranger, SessionAction::Dispute { reason: "?".into() })
            .unwrap_err();
        assert!(matches!(err, DomainError::Forbidden(_)));

        world
            .run(
                &mut session,
                world.owner(),
                SessionAction::Dispute {
                    reason: "counterfeit order".into(),
                },
            )
            .unwrap();
        assert_eq!(session.status(), SessionStatus::Disputed);

        let admin = Actor::admin(UserId::new());
        world
            .run(
                &mut session,
                admin,
                SessionAction::ResolveDispute {
                    outcome: "refund tester".into(),
                    note: None,
                },
            )
            .unwrap();
        assert_eq!(session.status(), SessionStatus::Disputed);
        assert!(session.dispute_resolution().is_some());
    }

    #[test]
    fn cancelled_sessions_can_still_be_disputed_once() {
        let world = World::new();
        let mut session = world.accepted();
        world
            .run(&mut session, world.tester(), SessionAction::Cancel { reason: None })
            .unwrap();
        assert_eq!(session.status(), SessionStatus::Cancelled);

        let dispute = SessionAction::Dispute {
            reason: "cancelled without notice".into(),
        };
        world.run(&mut session, world.tester(), dispute.clone()).unwrap();
        assert_eq!(session.status(), SessionStatus::Disputed);

        let err = world.run(&mut session, world.owner(), dispute).unwrap_err();
        assert!(matches!(err, DomainError::PreconditionFailed(_)));
    }

    #[test]
    fn rating_after_campaign_end_and_once_only() {
        let world = World::new();
        let mut session = world.submitted();
        let mut ended = world.facts(0, false);
        ended.ended = true;

        let err = world
            .run(
                &mut session,
                world.owner(),
                SessionAction::RateTester {
                    score: 4,
                    comment: None,
                    campaign: world.facts(0, false),
                },
            )
            .unwrap_err();
        assert!(matches!(err, DomainError::PreconditionFailed(msg) if msg.contains("ended")));

        world
            .run(
                &mut session,
                world.owner(),
                SessionAction::RateTester {
                    score: 4,
                    comment: None,
                    campaign: ended,
                },
            )
            .unwrap();
        let err = world
            .run(
                &mut session,
                world.owner(),
                SessionAction::RateTester {
                    score: 2,
                    comment: None,
                    campaign: ended,
                },
            )
            .unwrap_err();
        assert!(matches!(err, DomainError::PreconditionFailed(msg) if msg.contains("already rated")));

        world
            .run(
                &mut session,
                world.owner(),
                SessionAction::UpdateRating {
                    score: 2,
                    comment: Some("late photos".into()),
                },
            )
            .unwrap();
        assert_eq!(session.rating().map(|r| r.score), Some(2));
    }

    #[test]
    fn forced_status_bypasses_preconditions_for_admins_only() {
        let world = World::new();
        let mut session = world.accepted();
        let force = SessionAction::ForceStatus {
            status: SessionStatus::Completed,
            reason: "manual payout".into(),
        };

        assert!(matches!(
            world.run(&mut session.clone(), world.owner(), force.clone()),
            Err(DomainError::Forbidden(_))
        ));
        world
            .run(&mut session, Actor::admin(UserId::new()), force)
            .unwrap();
        assert_eq!(session.status(), SessionStatus::Completed);
    }

    #[test]
    fn timestamps_are_never_overwritten() {
        let world = World::new();
        let mut session = world.price_validated();
        let submitted_at = |s: &Session| s.timestamps().purchase_submitted_at;

        world
            .run(
                &mut session,
                world.tester(),
                SessionAction::SubmitPurchase {
                    order_id: Some("A-1".into()),
                    proof_url: None,
                },
            )
            .unwrap();
        let first = submitted_at(&session);
        world
            .run(&mut session, world.owner(), SessionAction::RejectPurchase { reason: "typo".into() })
            .unwrap();

        let later = world.on_purchase_day() + chrono::Duration::hours(2);
        execute(
            &mut session,
            &SessionCommand::new(
                world.tester(),
                later,
                SessionAction::SubmitPurchase {
                    order_id: Some("A-2".into()),
                    proof_url: None,
                },
            ),
        )
        .unwrap();

        assert_eq!(submitted_at(&session), first);
        assert_eq!(session.order_id(), Some("A-2"));
    }
}
