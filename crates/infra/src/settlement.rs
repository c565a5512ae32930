//! Reward settlement.
//!
//! Rewards go out through a [`PayoutGateway`]. When the tester has no payout
//! destination configured, the amount is credited to the [`InternalLedger`]
//! instead. The fallback is logged on its own target (`settlement.fallback`)
//! so operators can reconcile it later.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use tryout_core::{SessionId, UserId};

pub const TEST_REWARD_MEMO: &str = "test reward";
pub const CONTENT_BONUS_MEMO: &str = "content bonus";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementRequest {
    pub tester_id: UserId,
    /// Cents.
    pub amount: i64,
    pub memo: String,
    pub session_id: SessionId,
}

/// Where the money went.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "channel", content = "reference", rename_all = "snake_case")]
pub enum SettlementRef {
    External(String),
    Internal(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PayoutError {
    #[error("tester has no payout destination configured")]
    NoPayoutDestination,

    #[error("payout failed: {0}")]
    Failed(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SettlementError {
    #[error("payout gateway: {0}")]
    Payout(String),

    #[error("internal ledger: {0}")]
    Ledger(String),
}

/// External money transfer.
pub trait PayoutGateway: Send + Sync {
    fn transfer(&self, request: &SettlementRequest) -> Result<String, PayoutError>;
}

/// Platform-held balance used when no external transfer is possible.
pub trait InternalLedger: Send + Sync {
    fn credit(&self, request: &SettlementRequest) -> Result<String, SettlementError>;
}

#[derive(Clone)]
pub struct SettlementService {
    gateway: Arc<dyn PayoutGateway>,
    ledger: Arc<dyn InternalLedger>,
}

impl std::fmt::Debug for SettlementService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SettlementService").finish_non_exhaustive()
    }
}

impl SettlementService {
    pub fn new(gateway: Arc<dyn PayoutGateway>, ledger: Arc<dyn InternalLedger>) -> Self {
        Self { gateway, ledger }
    }

    pub fn settle(&self, request: &SettlementRequest) -> Result<SettlementRef, SettlementError> {
        match self.gateway.transfer(request) {
            Ok(reference) => {
                info!(
                    target: "settlement",
                    session_id = %request.session_id,
                    tester_id = %request.tester_id,
                    amount = request.amount,
                    memo = %request.memo,
                    %reference,
                    "reward paid out"
                );
                Ok(SettlementRef::External(reference))
            }
            Err(PayoutError::NoPayoutDestination) => {
                let reference = self.ledger.credit(request)?;
                warn!(
                    target: "settlement.fallback",
                    session_id = %request.session_id,
                    tester_id = %request.tester_id,
                    amount = request.amount,
                    memo = %request.memo,
                    %reference,
                    "no payout destination; credited internal ledger"
                );
                Ok(SettlementRef::Internal(reference))
            }
            Err(PayoutError::Failed(reason)) => Err(SettlementError::Payout(reason)),
        }
    }
}

/// Gateway for deployments without an external payout provider: every tester
/// is treated as having no destination, so all rewards land in the ledger.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnconfiguredGateway;

impl PayoutGateway for UnconfiguredGateway {
    fn transfer(&self, _request: &SettlementRequest) -> Result<String, PayoutError> {
        Err(PayoutError::NoPayoutDestination)
    }
}

/// In-memory internal ledger (tests/dev).
#[derive(Debug, Default)]
pub struct InMemoryInternalLedger {
    balances: Mutex<HashMap<UserId, i64>>,
    entries: Mutex<Vec<SettlementRequest>>,
}

impl InMemoryInternalLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn balance(&self, tester_id: UserId) -> i64 {
        self.balances
            .lock()
            .map(|b| b.get(&tester_id).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    pub fn entries(&self) -> Vec<SettlementRequest> {
        self.entries.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

impl InternalLedger for InMemoryInternalLedger {
    fn credit(&self, request: &SettlementRequest) -> Result<String, SettlementError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| SettlementError::Ledger("lock poisoned".to_string()))?;
        let mut balances = self
            .balances
            .lock()
            .map_err(|_| SettlementError::Ledger("lock poisoned".to_string()))?;

        *balances.entry(request.tester_id).or_insert(0) += request.amount;
        entries.push(request.clone());
        Ok(format!("ledger-{}", entries.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Gateway(Result<String, PayoutError>);

    impl PayoutGateway for Gateway {
        fn transfer(&self, _request: &SettlementRequest) -> Result<String, PayoutError> {
            self.0.clone()
        }
    }

    fn request(amount: i64) -> SettlementRequest {
        SettlementRequest {
            tester_id: UserId::new(),
            amount,
            memo: TEST_REWARD_MEMO.to_string(),
            session_id: SessionId::new(),
        }
    }

    #[test]
    fn external_transfer_skips_the_ledger() {
        let ledger = Arc::new(InMemoryInternalLedger::new());
        let service = SettlementService::new(Arc::new(Gateway(Ok("tx-9".into()))), ledger.clone());

        let req = request(3_300);
        assert_eq!(service.settle(&req), Ok(SettlementRef::External("tx-9".into())));
        assert_eq!(ledger.balance(req.tester_id), 0);
    }

    #[test]
    fn missing_destination_falls_back_to_ledger() {
        let ledger = Arc::new(InMemoryInternalLedger::new());
        let service = SettlementService::new(Arc::new(UnconfiguredGateway), ledger.clone());

        let req = request(1_250);
        let reference = service.settle(&req).unwrap();
        assert!(matches!(reference, SettlementRef::Internal(_)));
        assert_eq!(ledger.balance(req.tester_id), 1_250);
    }

    #[test]
    fn gateway_failure_is_an_error() {
        let ledger = Arc::new(InMemoryInternalLedger::new());
        let service = SettlementService::new(
            Arc::new(Gateway(Err(PayoutError::Failed("timeout".into())))),
            ledger.clone(),
        );

        let err = service.settle(&request(100)).unwrap_err();
        assert_eq!(err, SettlementError::Payout("timeout".into()));
        assert!(ledger.entries().is_empty());
    }
}
