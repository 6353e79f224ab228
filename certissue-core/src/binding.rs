//! Identity bindings between requesters and external platform accounts
//!
//! For one offering a requester may hold at most one account and an account
//! may belong to at most one requester. Stores enforce this in `try_bind`;
//! [`classify`] holds the decision so every store applies the same rule.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{ExternalAccountId, FullName, OfferingId, RequesterId, Serial};

/// The durable association created when a certificate is issued
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityBinding {
    pub requester: RequesterId,
    pub offering: OfferingId,
    pub account: ExternalAccountId,
    pub serial: Serial,
    /// Name printed on the original certificate
    pub full_name: FullName,
    /// Template the original certificate was rendered from
    pub template_ref: String,
    pub issued_at: DateTime<Utc>,
}

/// Why a bind attempt was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum BindConflict {
    /// The account is already bound to this other requester
    ExistingRequester(RequesterId),
    /// The requester is already bound to this other account
    ExistingAccount(ExternalAccountId),
}

/// Result of `try_bind`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindOutcome {
    /// A new binding was written
    Bound(IdentityBinding),
    /// The same (requester, offering, account) was already bound; nothing changed
    AlreadyBound(IdentityBinding),
    Conflict(BindConflict),
}

impl BindOutcome {
    /// The binding in effect after the call, if any
    pub fn binding(&self) -> Option<&IdentityBinding> {
        match self {
            BindOutcome::Bound(b) | BindOutcome::AlreadyBound(b) => Some(b),
            BindOutcome::Conflict(_) => None,
        }
    }
}

/// Decide a bind attempt given what is already stored
///
/// `by_requester` is the binding for (requester, offering) and `by_account`
/// the binding for (offering, account). Returns `None` when the new binding
/// may be written.
pub fn classify(
    requester: RequesterId,
    account: ExternalAccountId,
    by_requester: Option<&IdentityBinding>,
    by_account: Option<&IdentityBinding>,
) -> Option<BindOutcome> {
    if let Some(existing) = by_requester {
        if existing.account == account {
            return Some(BindOutcome::AlreadyBound(existing.clone()));
        }
        return Some(BindOutcome::Conflict(BindConflict::ExistingAccount(
            existing.account,
        )));
    }
    match by_account {
        Some(existing) if existing.requester != requester => Some(BindOutcome::Conflict(
            BindConflict::ExistingRequester(existing.requester),
        )),
        Some(existing) => Some(BindOutcome::AlreadyBound(existing.clone())),
        None => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn binding(requester: i64, account: u64) -> IdentityBinding {
        IdentityBinding {
            requester: RequesterId(requester),
            offering: OfferingId::new("214271"),
            account: ExternalAccountId(account),
            serial: Serial(1),
            full_name: FullName("Ivan Petrov".into()),
            template_ref: "part1-male".into(),
            issued_at: Utc::now(),
        }
    }

    #[test]
    fn test_free_slot_allows_bind() {
        assert_eq!(classify(RequesterId(1), ExternalAccountId(10), None, None), None);
    }

    #[test]
    fn test_same_binding_is_idempotent() {
        let existing = binding(1, 10);
        let outcome = classify(
            RequesterId(1),
            ExternalAccountId(10),
            Some(&existing),
            Some(&existing),
        );
        assert_eq!(outcome, Some(BindOutcome::AlreadyBound(existing)));
    }

    #[test]
    fn test_requester_with_other_account_conflicts() {
        let existing = binding(1, 10);
        let outcome = classify(RequesterId(1), ExternalAccountId(11), Some(&existing), None);
        assert_eq!(
            outcome,
            Some(BindOutcome::Conflict(BindConflict::ExistingAccount(ExternalAccountId(10))))
        );
    }

    #[test]
    fn test_account_held_by_other_requester_conflicts() {
        let existing = binding(2, 10);
        let outcome = classify(RequesterId(1), ExternalAccountId(10), None, Some(&existing));
        assert_eq!(
            outcome,
            Some(BindOutcome::Conflict(BindConflict::ExistingRequester(RequesterId(2))))
        );
    }
}
