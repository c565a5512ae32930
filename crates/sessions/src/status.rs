use serde::{Deserialize, Serialize};

/// Session lifecycle state.
///
/// ```text
/// PENDING → ACCEPTED | REJECTED*
/// ACCEPTED → IN_PROGRESS → PROCEDURES_COMPLETED → PRICE_VALIDATED
///   → PURCHASE_SUBMITTED → PURCHASE_VALIDATED → SUBMITTED
/// SUBMITTED → COMPLETED* | UGC_REQUESTED
/// UGC_REQUESTED ⇄ UGC_SUBMITTED, either → PENDING_CLOSURE → COMPLETED*
/// any non-terminal → CANCELLED* | DISPUTED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    Pending,
    Accepted,
    Rejected,
    InProgress,
    ProceduresCompleted,
    PriceValidated,
    PurchaseSubmitted,
    PurchaseValidated,
    Submitted,
    UgcRequested,
    UgcSubmitted,
    PendingClosure,
    Completed,
    Cancelled,
    Disputed,
}

impl SessionStatus {
    pub const ALL: [SessionStatus; 15] = [
        SessionStatus::Pending,
        SessionStatus::Accepted,
        SessionStatus::Rejected,
        SessionStatus::InProgress,
        SessionStatus::ProceduresCompleted,
        SessionStatus::PriceValidated,
        SessionStatus::PurchaseSubmitted,
        SessionStatus::PurchaseValidated,
        SessionStatus::Submitted,
        SessionStatus::UgcRequested,
        SessionStatus::UgcSubmitted,
        SessionStatus::PendingClosure,
        SessionStatus::Completed,
        SessionStatus::Cancelled,
        SessionStatus::Disputed,
    ];

    /// Statuses a session with an unmet purchase deadline can be in.
    pub const AWAITING_PURCHASE: [SessionStatus; 4] = [
        SessionStatus::Accepted,
        SessionStatus::InProgress,
        SessionStatus::ProceduresCompleted,
        SessionStatus::PriceValidated,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Pending => "PENDING",
            SessionStatus::Accepted => "ACCEPTED",
            SessionStatus::Rejected => "REJECTED",
            SessionStatus::InProgress => "IN_PROGRESS",
            SessionStatus::ProceduresCompleted => "PROCEDURES_COMPLETED",
            SessionStatus::PriceValidated => "PRICE_VALIDATED",
            SessionStatus::PurchaseSubmitted => "PURCHASE_SUBMITTED",
            SessionStatus::PurchaseValidated => "PURCHASE_VALIDATED",
            SessionStatus::Submitted => "SUBMITTED",
            SessionStatus::UgcRequested => "UGC_REQUESTED",
            SessionStatus::UgcSubmitted => "UGC_SUBMITTED",
            SessionStatus::PendingClosure => "PENDING_CLOSURE",
            SessionStatus::Completed => "COMPLETED",
            SessionStatus::Cancelled => "CANCELLED",
            SessionStatus::Disputed => "DISPUTED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStatus::Completed | SessionStatus::Rejected | SessionStatus::Cancelled
        )
    }

    /// Cancelling from these statuses returns the session's slot to the campaign.
    pub fn releases_slot_on_cancel(&self) -> bool {
        matches!(self, SessionStatus::Accepted | SessionStatus::InProgress)
    }

    pub fn is_cancellable(&self) -> bool {
        !self.is_terminal() && *self != SessionStatus::Disputed
    }
}

impl core::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for SessionStatus {
    type Err = tryout_core::DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SessionStatus::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| tryout_core::DomainError::validation(format!("unknown session status '{s}'")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_accepted_and_in_progress_release_slots() {
        let releasing: Vec<_> = SessionStatus::ALL
            .into_iter()
            .filter(SessionStatus::releases_slot_on_cancel)
            .collect();
        assert_eq!(releasing, vec![SessionStatus::Accepted, SessionStatus::InProgress]);
    }

    #[test]
    fn terminal_and_disputed_sessions_cannot_be_cancelled() {
        let blocked: Vec<_> = SessionStatus::ALL
            .into_iter()
            .filter(|status| !status.is_cancellable())
            .collect();
        assert_eq!(
            blocked,
            vec![
                SessionStatus::Rejected,
                SessionStatus::Completed,
                SessionStatus::Cancelled,
                SessionStatus::Disputed,
            ]
        );
    }

    #[test]
    fn status_names_parse_back() {
        for status in SessionStatus::ALL {
            assert_eq!(status.as_str().parse::<SessionStatus>().unwrap(), status);
        }
        assert!("LIMBO".parse::<SessionStatus>().is_err());
    }
}
