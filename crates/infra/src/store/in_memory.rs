use std::collections::HashMap;
use std::sync::RwLock;

use chrono::NaiveDate;

use tryout_campaigns::Campaign;
use tryout_core::{AggregateRoot, CampaignId, SessionId, StepId, UserId};
use tryout_sessions::{Session, SessionStatus, StepProgress};

use super::r#trait::{SessionChange, SessionStore, StoreError, UnsettledReward};
use crate::slot_ledger::{CampaignSlots, SlotAudit, apply_slot_effect};

#[derive(Debug, Default)]
struct State {
    campaigns: HashMap<CampaignId, Campaign>,
    sessions: HashMap<SessionId, Session>,
    progress: HashMap<(SessionId, StepId), StepProgress>,
    unsettled: Vec<UnsettledReward>,
    slot_audit: HashMap<CampaignId, SlotAudit>,
}

/// In-memory session store.
///
/// Intended for tests/dev. One write lock is held for the whole of a commit,
/// which gives the same all-or-nothing behavior as a database transaction.
#[derive(Debug, Default)]
pub struct InMemorySessionStore {
    state: RwLock<State>,
}

fn poisoned<T>(_: T) -> StoreError {
    StoreError::Storage("lock poisoned".to_string())
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a campaign (campaigns are owned by the surrounding system).
    pub fn put_campaign(&self, campaign: Campaign) -> Result<(), StoreError> {
        let mut state = self.state.write().map_err(poisoned)?;
        state.campaigns.insert(campaign.id, campaign);
        Ok(())
    }

    pub fn unsettled(&self) -> Result<Vec<UnsettledReward>, StoreError> {
        let state = self.state.read().map_err(poisoned)?;
        Ok(state.unsettled.clone())
    }

    pub fn slot_audit(&self, campaign_id: CampaignId) -> Result<SlotAudit, StoreError> {
        let state = self.state.read().map_err(poisoned)?;
        Ok(state.slot_audit.get(&campaign_id).copied().unwrap_or_default())
    }

    /// Sessions of a campaign, in no particular order.
    pub fn sessions_for(&self, campaign_id: CampaignId) -> Result<Vec<Session>, StoreError> {
        let state = self.state.read().map_err(poisoned)?;
        Ok(state
            .sessions
            .values()
            .filter(|s| s.campaign_id() == Some(campaign_id))
            .cloned()
            .collect())
    }
}

impl SessionStore for InMemorySessionStore {
    fn load_campaign(&self, campaign_id: CampaignId) -> Result<Option<Campaign>, StoreError> {
        let state = self.state.read().map_err(poisoned)?;
        Ok(state.campaigns.get(&campaign_id).cloned())
    }

    fn load_session(&self, session_id: SessionId) -> Result<Option<Session>, StoreError> {
        let state = self.state.read().map_err(poisoned)?;
        Ok(state.sessions.get(&session_id).cloned())
    }

    fn find_session(
        &self,
        campaign_id: CampaignId,
        tester_id: UserId,
    ) -> Result<Option<Session>, StoreError> {
        let state = self.state.read().map_err(poisoned)?;
        Ok(state
            .sessions
            .values()
            .find(|s| s.campaign_id() == Some(campaign_id) && s.tester_id() == Some(tester_id))
            .cloned())
    }

    fn load_progress(&self, session_id: SessionId) -> Result<Vec<StepProgress>, StoreError> {
        let state = self.state.read().map_err(poisoned)?;
        let mut rows: Vec<StepProgress> = state
            .progress
            .values()
            .filter(|p| p.session_id == session_id)
            .cloned()
            .collect();
        rows.sort_by_key(|p| p.completed_at);
        Ok(rows)
    }

    fn count_scheduled(&self, campaign_id: CampaignId, date: NaiveDate) -> Result<u32, StoreError> {
        let state = self.state.read().map_err(poisoned)?;
        let count = state
            .sessions
            .values()
            .filter(|s| s.campaign_id() == Some(campaign_id))
            .filter(|s| s.scheduled_purchase_date() == Some(date))
            .filter(|s| !matches!(s.status(), SessionStatus::Cancelled | SessionStatus::Rejected))
            .count();
        Ok(u32::try_from(count).unwrap_or(u32::MAX))
    }

    fn expired_candidates(&self, today: NaiveDate) -> Result<Vec<SessionId>, StoreError> {
        let state = self.state.read().map_err(poisoned)?;
        let mut ids: Vec<SessionId> = state
            .sessions
            .values()
            .filter(|s| SessionStatus::AWAITING_PURCHASE.contains(&s.status()))
            .filter(|s| s.scheduled_purchase_date().is_some_and(|d| d < today))
            .map(|s| *s.id())
            .collect();
        ids.sort_by_key(|id| *id.as_uuid());
        Ok(ids)
    }

    fn commit(&self, change: SessionChange) -> Result<(), StoreError> {
        let mut state = self.state.write().map_err(poisoned)?;
        let State {
            campaigns,
            sessions,
            progress,
            slot_audit,
            ..
        } = &mut *state;

        let session_id = change.session_id();
        let campaign_id = change.campaign_id()?;
        let current = sessions.get(&session_id).map(|s| s.version()).unwrap_or(0);
        if !change.expected_version.matches(current) {
            return Err(StoreError::Concurrency(format!(
                "session {session_id}: expected {:?}, found {current}",
                change.expected_version
            )));
        }

        if current == 0 {
            let tester_id = change.session.tester_id();
            let duplicate = sessions
                .values()
                .any(|s| s.campaign_id() == Some(campaign_id) && s.tester_id() == tester_id);
            if duplicate {
                return Err(StoreError::DuplicateSession {
                    campaign_id,
                    tester_id: tester_id.unwrap_or_default(),
                });
            }
        }

        // Nothing below may fail after the ledger has moved.
        apply_slot_effect(
            &mut CampaignSlots::new(campaigns, slot_audit),
            campaign_id,
            change.slot_effect,
        )?;

        for row in change.progress {
            progress.insert((row.session_id, row.step_id), row);
        }
        sessions.insert(session_id, change.session);
        Ok(())
    }

    fn record_unsettled(&self, reward: UnsettledReward) -> Result<(), StoreError> {
        let mut state = self.state.write().map_err(poisoned)?;
        state.unsettled.push(reward);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tryout_auth::Actor;
    use tryout_campaigns::Offer;
    use tryout_core::{Aggregate, ExpectedVersion};
    use tryout_sessions::{CampaignFacts, SessionAction, SessionCommand, SlotEffect};

    fn seeded(slots: u32) -> (InMemorySessionStore, Campaign) {
        let store = InMemorySessionStore::new();
        let campaign = Campaign::new(UserId::new(), "blender", slots, Offer::exact(4_000, 0, 800).unwrap())
            .unwrap()
            .with_auto_accept(true);
        store.put_campaign(campaign.clone()).unwrap();
        (store, campaign)
    }

    fn applied(campaign: &Campaign, tester: UserId) -> (Session, SlotEffect) {
        let mut session = Session::empty(SessionId::new());
        let cmd = SessionCommand::new(
            Actor::tester(tester),
            Utc::now(),
            SessionAction::Apply {
                campaign_id: campaign.id,
                tester_id: tester,
                campaign: CampaignFacts::of(campaign, Utc::now()),
                scheduled_purchase_date: None,
            },
        );
        let events = session.handle(&cmd).unwrap();
        let mut effect = SlotEffect::None;
        for e in &events {
            session.apply(e);
            if e.slot_effect() != SlotEffect::None {
                effect = e.slot_effect();
            }
        }
        (session, effect)
    }

    #[test]
    fn commit_reserves_and_rejects_stale_versions() {
        let (store, campaign) = seeded(2);
        let (session, effect) = applied(&campaign, UserId::new());

        let change = SessionChange::new(session.clone(), ExpectedVersion(0)).with_slot_effect(effect);
        store.commit(change.clone()).unwrap();
        assert_eq!(store.load_campaign(campaign.id).unwrap().unwrap().available_slots, 1);

        let err = store.commit(change).unwrap_err();
        assert!(matches!(err, StoreError::Concurrency(_)));
        assert_eq!(store.load_campaign(campaign.id).unwrap().unwrap().available_slots, 1);
        assert_eq!(store.slot_audit(campaign.id).unwrap().reserved, 1);
    }

    #[test]
    fn second_session_for_same_tester_is_rejected() {
        let (store, campaign) = seeded(3);
        let tester = UserId::new();
        let (first, effect) = applied(&campaign, tester);
        store
            .commit(SessionChange::new(first, ExpectedVersion(0)).with_slot_effect(effect))
            .unwrap();

        let (second, effect) = applied(&campaign, tester);
        let err = store
            .commit(SessionChange::new(second, ExpectedVersion(0)).with_slot_effect(effect))
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicateSession { .. }));
        assert_eq!(store.load_campaign(campaign.id).unwrap().unwrap().available_slots, 2);
    }

    #[test]
    fn failed_reserve_writes_nothing() {
        let (store, mut campaign) = seeded(1);
        campaign.available_slots = 0;
        store.put_campaign(campaign.clone()).unwrap();

        // Facts were read while a slot was still free.
        campaign.available_slots = 1;
        let (session, effect) = applied(&campaign, UserId::new());
        let id = *session.id();
        let err = store
            .commit(SessionChange::new(session, ExpectedVersion(0)).with_slot_effect(effect))
            .unwrap_err();

        assert_eq!(err, StoreError::NoSlotsAvailable(campaign.id));
        assert!(store.load_session(id).unwrap().is_none());
    }
}
