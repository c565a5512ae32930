//! Deadline sweep: cancel sessions whose purchase day has passed.
//!
//! A session accepted for day `D` must be purchased before the end of `D`
//! (UTC). Any sweep run at or after the start of `D + 1` cancels it and
//! returns its slot. Re-running the sweep is harmless: already-cancelled
//! sessions are no longer candidates, and a session that moved on between
//! the candidate query and the cancellation is skipped.

pub mod worker;

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use tryout_events::{EventBus, EventEnvelope};

use crate::engine::{EngineError, EngineResult, SessionEngine};
use crate::store::SessionStore;

pub use worker::{SweepStats, SweepWorker, SweepWorkerConfig, SweepWorkerHandle};

/// Outcome of one sweep pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub examined: u64,
    pub cancelled: u64,
    /// Candidates that were no longer expired by the time they were cancelled.
    pub skipped: u64,
    pub failed: u64,
}

pub struct DeadlineSweeper<S, B> {
    engine: Arc<SessionEngine<S, B>>,
}

impl<S, B> DeadlineSweeper<S, B>
where
    S: SessionStore,
    B: EventBus<EventEnvelope<serde_json::Value>>,
{
    pub fn new(engine: Arc<SessionEngine<S, B>>) -> Self {
        Self { engine }
    }

    /// Run one pass. Only a failing candidate query aborts the pass; per-session
    /// failures are logged and counted.
    pub fn run_once(&self) -> EngineResult<SweepReport> {
        let now = self.engine.now();
        let today = now.date_naive();
        let candidates = self.engine.store().expired_candidates(today)?;

        let mut report = SweepReport::default();
        for session_id in candidates {
            report.examined += 1;
            match self.engine.expire(session_id) {
                Ok(session) => {
                    report.cancelled += 1;
                    debug!(
                        session_id = %session_id,
                        scheduled_purchase_date = ?session.scheduled_purchase_date(),
                        "expired session cancelled"
                    );
                }
                Err(EngineError::PreconditionFailed(reason) | EngineError::Conflict(reason)) => {
                    report.skipped += 1;
                    debug!(session_id = %session_id, %reason, "sweep candidate skipped");
                }
                Err(err) => {
                    report.failed += 1;
                    warn!(session_id = %session_id, %err, "could not cancel expired session");
                }
            }
        }

        if report.examined > 0 {
            info!(
                %today,
                examined = report.examined,
                cancelled = report.cancelled,
                skipped = report.skipped,
                failed = report.failed,
                "deadline sweep finished"
            );
        }
        Ok(report)
    }
}
