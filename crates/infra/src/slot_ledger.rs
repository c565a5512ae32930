//! Slot ledger: the campaign's available-slot counter.
//!
//! The ledger is never called on its own. Every reserve/release runs inside the
//! same store transaction as the session write that causes it, so the counter
//! and session state cannot drift apart.

use std::collections::HashMap;

use sqlx::{Postgres, Row, Transaction};
use tracing::debug;

use tryout_campaigns::Campaign;
use tryout_core::CampaignId;
use tryout_sessions::SlotEffect;

use crate::store::StoreError;
use crate::store::postgres::map_sqlx_error;

/// Counter operations available inside a store transaction.
pub trait SlotLedger {
    /// Decrement the counter. Fails with `NoSlotsAvailable` at zero.
    ///
    /// Returns the remaining slots.
    fn reserve(&mut self, campaign_id: CampaignId) -> Result<u32, StoreError>;

    /// Increment the counter unconditionally. Returns the available slots.
    fn release(&mut self, campaign_id: CampaignId) -> Result<u32, StoreError>;
}

/// Apply a transition's slot effect; `None` when the transition has no effect.
pub fn apply_slot_effect<L>(
    ledger: &mut L,
    campaign_id: CampaignId,
    effect: SlotEffect,
) -> Result<Option<u32>, StoreError>
where
    L: SlotLedger + ?Sized,
{
    match effect {
        SlotEffect::None => Ok(None),
        SlotEffect::Reserve => ledger.reserve(campaign_id).map(Some),
        SlotEffect::Release => ledger.release(campaign_id).map(Some),
    }
}

/// Running totals for one campaign's counter.
///
/// `reserved - released` is the number of slots currently held by sessions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SlotAudit {
    pub reserved: u64,
    pub released: u64,
}

impl SlotAudit {
    pub fn held(&self) -> u64 {
        self.reserved.saturating_sub(self.released)
    }
}

/// Ledger over the in-memory store's campaign map, borrowed for one commit.
#[derive(Debug)]
pub struct CampaignSlots<'a> {
    campaigns: &'a mut HashMap<CampaignId, Campaign>,
    audit: &'a mut HashMap<CampaignId, SlotAudit>,
}

impl<'a> CampaignSlots<'a> {
    pub fn new(
        campaigns: &'a mut HashMap<CampaignId, Campaign>,
        audit: &'a mut HashMap<CampaignId, SlotAudit>,
    ) -> Self {
        Self { campaigns, audit }
    }

    fn campaign(&mut self, campaign_id: CampaignId) -> Result<&mut Campaign, StoreError> {
        self.campaigns
            .get_mut(&campaign_id)
            .ok_or_else(|| StoreError::NotFound(format!("campaign {campaign_id}")))
    }
}

impl SlotLedger for CampaignSlots<'_> {
    fn reserve(&mut self, campaign_id: CampaignId) -> Result<u32, StoreError> {
        let campaign = self.campaign(campaign_id)?;
        let Some(remaining) = campaign.available_slots.checked_sub(1) else {
            return Err(StoreError::NoSlotsAvailable(campaign_id));
        };
        campaign.available_slots = remaining;
        self.audit.entry(campaign_id).or_default().reserved += 1;
        debug!(%campaign_id, remaining, "slot reserved");
        Ok(remaining)
    }

    fn release(&mut self, campaign_id: CampaignId) -> Result<u32, StoreError> {
        let campaign = self.campaign(campaign_id)?;
        campaign.available_slots += 1;
        let available = campaign.available_slots;
        self.audit.entry(campaign_id).or_default().released += 1;
        debug!(%campaign_id, available, "slot released");
        Ok(available)
    }
}

/// Check-and-decrement inside a Postgres transaction.
///
/// The `available_slots > 0` guard makes the row update itself the
/// serialization point: of two transactions racing for the last slot, the
/// second one updates zero rows.
pub async fn reserve_in_tx(
    tx: &mut Transaction<'_, Postgres>,
    campaign_id: CampaignId,
) -> Result<u32, StoreError> {
    let row = sqlx::query(
        r#"
        UPDATE campaigns
        SET available_slots = available_slots - 1
        WHERE id = $1 AND available_slots > 0
        RETURNING available_slots
        "#,
    )
    .bind(campaign_id.as_uuid())
    .fetch_optional(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("reserve_slot", e))?;

    match row {
        Some(row) => {
            let remaining: i32 = row
                .try_get("available_slots")
                .map_err(|e| map_sqlx_error("reserve_slot", e))?;
            Ok(remaining.max(0) as u32)
        }
        None => Err(StoreError::NoSlotsAvailable(campaign_id)),
    }
}

pub async fn release_in_tx(
    tx: &mut Transaction<'_, Postgres>,
    campaign_id: CampaignId,
) -> Result<u32, StoreError> {
    let row = sqlx::query(
        r#"
        UPDATE campaigns
        SET available_slots = available_slots + 1
        WHERE id = $1
        RETURNING available_slots
        "#,
    )
    .bind(campaign_id.as_uuid())
    .fetch_optional(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("release_slot", e))?
    .ok_or_else(|| StoreError::NotFound(format!("campaign {campaign_id}")))?;

    let available: i32 = row
        .try_get("available_slots")
        .map_err(|e| map_sqlx_error("release_slot", e))?;
    Ok(available.max(0) as u32)
}
