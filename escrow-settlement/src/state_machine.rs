//! State Machine Engine - the escrow transition table
//!
//! Every state change, whether requested through the API or observed on the
//! ledger, is planned here. Planning is pure: it takes the escrow as last
//! read, the command and the actor, and either reports a no-op, rejects the
//! command, or returns a [`TransitionRecord`] that the store applies with a
//! conditional write on the `from` state.
//!
//! | From           | Action           | Guard                              | To         |
//! |----------------|------------------|------------------------------------|------------|
//! | awaiting_fund  | fund             | verified or custodial funding      | funded     |
//! | funded         | confirm_delivery | seller or admin                    | complete   |
//! | funded         | raise_dispute    | buyer or seller                    | disputed   |
//! | funded         | timeout_refund   | now >= timeout_at                  | complete   |
//! | disputed       | resolve          | admin                              | complete   |

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::funding_verifier::VerifiedFunding;
use crate::ledger::{Address, TxHash};
use crate::models::{
    Caller, Escrow, EscrowAction, EscrowState, NewEscrowEvent, ResolutionOutcome,
};
use crate::{EscrowError, EscrowResult};

/// Who is driving a transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Actor {
    /// Authenticated API caller
    User(Caller),
    /// A confirmed contract event observed by the reconciler
    Ledger,
}

impl Actor {
    fn describe(&self) -> Value {
        match self {
            Actor::User(caller) => json!({
                "type": "user",
                "user_id": caller.user_id,
                "role": caller.role,
            }),
            Actor::Ledger => json!({ "type": "ledger" }),
        }
    }
}

/// How the deposit was proven
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FundingEvidence {
    /// Caller-supplied transaction that passed the funding verifier
    Verified(VerifiedFunding),
    /// The platform broadcast the funding transaction itself
    Custodial { tx_hash: TxHash },
    /// A confirmed `Funded` contract event
    Ledger { tx_hash: String, confirmations: u64 },
}

/// Dispute settlement as computed by the resolver
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    /// `None` when settled directly on the ledger
    pub outcome: Option<ResolutionOutcome>,
    pub recipient_id: Option<Uuid>,
    pub recipient: Option<Address>,
    pub amount: u128,
    pub notes: String,
    /// Hash of the on-chain settlement, when one was broadcast
    pub settlement_tx: Option<String>,
    /// Why the on-chain settlement was not broadcast
    pub settlement_error: Option<String>,
}

/// A requested transition with its action-specific data
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Fund(FundingEvidence),
    ConfirmDelivery {
        tx_hash: Option<String>,
    },
    RaiseDispute {
        reason: String,
        evidence_urls: Vec<String>,
    },
    TimeoutRefund {
        tx_hash: Option<String>,
    },
    Resolve(Resolution),
}

impl Command {
    pub fn action(&self) -> EscrowAction {
        match self {
            Command::Fund(_) => EscrowAction::Fund,
            Command::ConfirmDelivery { .. } => EscrowAction::ConfirmDelivery,
            Command::RaiseDispute { .. } => EscrowAction::RaiseDispute,
            Command::TimeoutRefund { .. } => EscrowAction::TimeoutRefund,
            Command::Resolve(_) => EscrowAction::Resolve,
        }
    }
}

/// Field updates carried by a transition
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldUpdates {
    pub onchain_tx_hash: Option<String>,
    pub confirmations: Option<u64>,
    pub is_confirmed: Option<bool>,
    pub dispute_reason: Option<String>,
    pub resolution_notes: Option<String>,
}

/// A planned state change, applied conditionally on `from`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateChange {
    pub escrow_id: Uuid,
    pub action: EscrowAction,
    pub from: EscrowState,
    pub to: EscrowState,
    pub at: DateTime<Utc>,
    pub fields: FieldUpdates,
}

impl StateChange {
    /// Apply to an in-memory escrow that is known to be in `from`
    pub fn apply_to(&self, escrow: &mut Escrow) {
        escrow.state = self.to;
        escrow.updated_at = self.at;
        match self.to {
            EscrowState::Funded => escrow.funded_at = Some(self.at),
            EscrowState::Disputed => escrow.disputed_at = Some(self.at),
            EscrowState::Complete => {
                escrow.completed_at = Some(self.at);
                escrow.completed_by = Some(self.action);
            }
            EscrowState::AwaitingFund | EscrowState::AwaitingDelivery => {}
        }

        let fields = &self.fields;
        if let Some(hash) = &fields.onchain_tx_hash {
            escrow.onchain_tx_hash = Some(hash.clone());
        }
        if let Some(confirmations) = fields.confirmations {
            escrow.confirmations = escrow.confirmations.max(confirmations);
        }
        if let Some(confirmed) = fields.is_confirmed {
            escrow.is_confirmed = escrow.is_confirmed || confirmed;
        }
        if let Some(reason) = &fields.dispute_reason {
            escrow.dispute_reason = Some(reason.clone());
        }
        if let Some(notes) = &fields.resolution_notes {
            escrow.resolution_notes = Some(notes.clone());
        }
    }
}

/// A state change plus the single event that records it
#[derive(Debug, Clone, PartialEq)]
pub struct TransitionRecord {
    pub change: StateChange,
    pub event: NewEscrowEvent,
}

/// Result of planning a command
#[derive(Debug, Clone, PartialEq)]
pub enum Plan {
    /// The same action already moved the escrow to its target
    NoOp(EscrowState),
    Apply(TransitionRecord),
}

fn authorize(escrow: &Escrow, action: EscrowAction, actor: &Actor) -> EscrowResult<()> {
    let caller = match actor {
        Actor::Ledger => return Ok(()),
        Actor::User(caller) => caller,
    };
    let is_buyer = escrow.buyer_id == caller.user_id;
    let is_seller = escrow.seller_id == caller.user_id;

    let allowed = match action {
        EscrowAction::Fund => is_buyer,
        EscrowAction::ConfirmDelivery => is_seller || caller.is_admin(),
        EscrowAction::RaiseDispute => is_buyer || is_seller,
        EscrowAction::TimeoutRefund => is_buyer || caller.is_admin(),
        EscrowAction::Resolve => caller.is_admin(),
    };

    if allowed {
        Ok(())
    } else {
        Err(EscrowError::authorization(format!(
            "User {} may not {} escrow {}",
            caller.user_id, action, escrow.id
        )))
    }
}

/// Run the guards for `action` without building a record.
///
/// Checks run in a fixed order: authorization, already-applied (no-op),
/// legal source state, then time guards. Returns the current state when this
/// same action already moved the escrow there; an escrow completed by a
/// different action is a conflict.
pub fn precheck(
    escrow: &Escrow,
    action: EscrowAction,
    actor: &Actor,
    now: DateTime<Utc>,
) -> EscrowResult<Option<EscrowState>> {
    authorize(escrow, action, actor)?;

    if escrow.reached_by(action) {
        return Ok(Some(escrow.state));
    }
    if escrow.state != action.from_state() {
        return Err(EscrowError::state_conflict(escrow.state.as_str(), action.as_str()));
    }

    if action == EscrowAction::TimeoutRefund
        && matches!(actor, Actor::User(_))
        && !escrow.can_timeout_refund(now)
    {
        return Err(EscrowError::validation(format!(
            "Escrow {} does not time out until {}",
            escrow.id, escrow.timeout_at
        )));
    }

    Ok(None)
}

/// Plan `command` against `escrow` as last read
pub fn plan(
    escrow: &Escrow,
    command: Command,
    actor: &Actor,
    now: DateTime<Utc>,
) -> EscrowResult<Plan> {
    let action = command.action();
    if let Some(state) = precheck(escrow, action, actor, now)? {
        return Ok(Plan::NoOp(state));
    }
    let from = action.from_state();
    let to = action.target_state();

    let mut fields = FieldUpdates::default();
    let mut payload = json!({
        "action": action.as_str(),
        "actor": actor.describe(),
        "state": to.as_str(),
    });
    let mut tx_hash = None;

    match command {
        Command::Fund(evidence) => {
            let (hash, confirmations, confirmed, method) = match evidence {
                FundingEvidence::Verified(v) => {
                    (v.tx_hash().to_string(), v.confirmations(), true, "verified")
                }
                FundingEvidence::Custodial { tx_hash } => {
                    (tx_hash.to_string(), 0, false, "custodial")
                }
                FundingEvidence::Ledger {
                    tx_hash,
                    confirmations,
                } => (tx_hash, confirmations, true, "ledger"),
            };
            payload["funding"] = json!({
                "method": method,
                "tx_hash": hash,
                "amount": escrow.amount.to_string(),
                "confirmations": confirmations,
            });
            fields.onchain_tx_hash = Some(hash.clone());
            fields.confirmations = Some(confirmations);
            fields.is_confirmed = Some(confirmed);
            tx_hash = Some(hash);
        }
        Command::ConfirmDelivery { tx_hash: hash } | Command::TimeoutRefund { tx_hash: hash } => {
            payload["tx_hash"] = json!(hash);
            tx_hash = hash;
        }
        Command::RaiseDispute {
            reason,
            evidence_urls,
        } => {
            payload["reason"] = json!(reason);
            payload["evidence_urls"] = json!(evidence_urls);
            fields.dispute_reason = Some(reason);
        }
        Command::Resolve(resolution) => {
            payload["outcome"] = json!(resolution.outcome.map(|o| o.as_str()));
            payload["recipient_id"] = json!(resolution.recipient_id);
            payload["recipient"] = json!(resolution.recipient.map(|a| a.to_string()));
            payload["amount"] = json!(resolution.amount.to_string());
            payload["resolution_notes"] = json!(resolution.notes);
            payload["tx_hash"] = json!(resolution.settlement_tx);
            if let Some(error) = &resolution.settlement_error {
                payload["settlement_error"] = json!(error);
            }
            fields.resolution_notes = Some(resolution.notes);
            tx_hash = resolution.settlement_tx;
        }
    }

    let mut event = NewEscrowEvent::local(escrow.id, action.event_kind(), payload);
    if let Some(hash) = tx_hash {
        event = event.with_tx_hash(hash);
    }

    Ok(Plan::Apply(TransitionRecord {
        change: StateChange {
            escrow_id: escrow.id,
            action,
            from,
            to,
            at: now,
            fields,
        },
        event,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EscrowEventKind, Role};
    use chrono::Duration;

    struct Parties {
        buyer: Caller,
        seller: Caller,
        admin: Caller,
        stranger: Caller,
    }

    fn parties() -> Parties {
        Parties {
            buyer: Caller::user(Uuid::new_v4()),
            seller: Caller::user(Uuid::new_v4()),
            admin: Caller::admin(Uuid::new_v4()),
            stranger: Caller::user(Uuid::new_v4()),
        }
    }

    fn escrow_in(p: &Parties, state: EscrowState) -> Escrow {
        let mut escrow = Escrow::new(
            Uuid::new_v4(),
            p.buyer.user_id,
            p.seller.user_id,
            1_000,
            Utc::now() + Duration::days(30),
            None,
        );
        escrow.state = state;
        escrow
    }

    fn completed_by(p: &Parties, action: EscrowAction) -> Escrow {
        let mut escrow = escrow_in(p, EscrowState::Complete);
        escrow.completed_by = Some(action);
        escrow
    }

    fn resolution(p: &Parties) -> Resolution {
        Resolution {
            outcome: Some(ResolutionOutcome::Refund),
            recipient_id: Some(p.buyer.user_id),
            recipient: None,
            amount: 1_000,
            notes: "Seller failed to ship".into(),
            settlement_tx: None,
            settlement_error: None,
        }
    }

    fn ledger_funding() -> Command {
        Command::Fund(FundingEvidence::Ledger {
            tx_hash: "0xfeed".to_string(),
            confirmations: 3,
        })
    }

    fn expect_apply(plan: EscrowResult<Plan>) -> TransitionRecord {
        match plan {
            Ok(Plan::Apply(record)) => record,
            other => panic!("Expected Apply, got {:?}", other),
        }
    }

    #[test]
    fn test_fund_transition() {
        let p = parties();
        let escrow = escrow_in(&p, EscrowState::AwaitingFund);
        let record = expect_apply(plan(&escrow, ledger_funding(), &Actor::User(p.buyer), Utc::now()));

        assert_eq!(record.change.from, EscrowState::AwaitingFund);
        assert_eq!(record.change.to, EscrowState::Funded);
        assert_eq!(record.event.kind, EscrowEventKind::Funded);
        assert_eq!(record.event.payload["state"], "funded");
        assert_eq!(record.event.payload["action"], "fund");
        assert_eq!(record.event.tx_hash.as_deref(), Some("0xfeed"));

        let mut updated = escrow.clone();
        record.change.apply_to(&mut updated);
        assert_eq!(updated.state, EscrowState::Funded);
        assert!(updated.funded_at.is_some());
        assert_eq!(updated.confirmations, 3);
        assert!(updated.is_confirmed);
    }

    #[test]
    fn test_only_buyer_funds() {
        let p = parties();
        let escrow = escrow_in(&p, EscrowState::AwaitingFund);
        for caller in [p.seller, p.admin, p.stranger] {
            let err = plan(&escrow, ledger_funding(), &Actor::User(caller), Utc::now()).unwrap_err();
            assert_eq!(err.kind(), "authorization");
        }
    }

    #[test]
    fn test_already_in_target_is_noop() {
        let p = parties();
        let escrow = escrow_in(&p, EscrowState::Funded);
        match plan(&escrow, ledger_funding(), &Actor::User(p.buyer), Utc::now()).unwrap() {
            Plan::NoOp(state) => assert_eq!(state, EscrowState::Funded),
            other => panic!("Expected NoOp, got {:?}", other),
        }

        let complete = completed_by(&p, EscrowAction::ConfirmDelivery);
        let cmd = Command::ConfirmDelivery { tx_hash: None };
        assert!(matches!(
            plan(&complete, cmd, &Actor::User(p.seller), Utc::now()),
            Ok(Plan::NoOp(EscrowState::Complete))
        ));
    }

    #[test]
    fn test_completion_by_another_action_conflicts() {
        let p = parties();
        let confirm = || Command::ConfirmDelivery { tx_hash: None };
        let timeout = || Command::TimeoutRefund { tx_hash: None };
        let resolve = || Command::Resolve(resolution(&p));
        let cases = [
            (EscrowAction::ConfirmDelivery, resolve(), p.admin),
            (EscrowAction::ConfirmDelivery, timeout(), p.buyer),
            (EscrowAction::TimeoutRefund, confirm(), p.seller),
            (EscrowAction::TimeoutRefund, resolve(), p.admin),
            (EscrowAction::Resolve, confirm(), p.admin),
            (EscrowAction::Resolve, timeout(), p.buyer),
        ];

        for (done_by, command, caller) in cases {
            let escrow = completed_by(&p, done_by);
            let action = command.action();
            let err = plan(&escrow, command, &Actor::User(caller), Utc::now()).unwrap_err();
            assert_eq!(err.kind(), "state_conflict", "{action} after {done_by}");
        }

        // Ledger echoes are held to the same rule
        let escrow = completed_by(&p, EscrowAction::ConfirmDelivery);
        assert!(plan(&escrow, timeout(), &Actor::Ledger, Utc::now()).is_err());
        assert!(matches!(
            plan(&escrow, confirm(), &Actor::Ledger, Utc::now()),
            Ok(Plan::NoOp(EscrowState::Complete))
        ));
    }

    #[test]
    fn test_completion_records_action() {
        let p = parties();
        let escrow = escrow_in(&p, EscrowState::Disputed);
        let record = expect_apply(plan(
            &escrow,
            Command::Resolve(resolution(&p)),
            &Actor::User(p.admin),
            Utc::now(),
        ));
        let mut updated = escrow.clone();
        record.change.apply_to(&mut updated);
        assert_eq!(updated.completed_by, Some(EscrowAction::Resolve));
        assert!(updated.reached_by(EscrowAction::Resolve));
        assert!(!updated.reached_by(EscrowAction::ConfirmDelivery));
    }

    #[test]
    fn test_illegal_transitions_conflict() {
        let p = parties();
        let cases = [
            (EscrowState::AwaitingFund, Command::ConfirmDelivery { tx_hash: None }, p.seller),
            (
                EscrowState::Complete,
                Command::RaiseDispute {
                    reason: "late".into(),
                    evidence_urls: vec![],
                },
                p.buyer,
            ),
            (EscrowState::Disputed, Command::ConfirmDelivery { tx_hash: None }, p.admin),
            (EscrowState::Complete, ledger_funding(), p.buyer),
        ];

        for (state, command, caller) in cases {
            let escrow = escrow_in(&p, state);
            let err = plan(&escrow, command, &Actor::User(caller), Utc::now()).unwrap_err();
            assert_eq!(err.kind(), "state_conflict", "from {state}");
        }
    }

    #[test]
    fn test_awaiting_delivery_is_unreachable() {
        let p = parties();
        let escrow = escrow_in(&p, EscrowState::AwaitingFund);
        let commands = [
            ledger_funding(),
            Command::ConfirmDelivery { tx_hash: None },
            Command::TimeoutRefund { tx_hash: None },
        ];
        for command in commands {
            if let Ok(Plan::Apply(record)) = plan(&escrow, command, &Actor::Ledger, Utc::now()) {
                assert_ne!(record.change.to, EscrowState::AwaitingDelivery);
            }
        }
    }

    #[test]
    fn test_dispute_and_confirm_roles() {
        let p = parties();
        let escrow = escrow_in(&p, EscrowState::Funded);
        let dispute = || Command::RaiseDispute {
            reason: "item never arrived".into(),
            evidence_urls: vec!["https://example.com/photo.jpg".into()],
        };

        assert!(plan(&escrow, dispute(), &Actor::User(p.seller), Utc::now()).is_ok());
        let record = expect_apply(plan(&escrow, dispute(), &Actor::User(p.buyer), Utc::now()));
        let mut updated = escrow.clone();
        record.change.apply_to(&mut updated);
        assert_eq!(updated.dispute_reason.as_deref(), Some("item never arrived"));
        assert!(updated.disputed_at.is_some());

        let err = plan(&escrow, dispute(), &Actor::User(p.admin), Utc::now()).unwrap_err();
        assert_eq!(err.kind(), "authorization");

        let confirm = Command::ConfirmDelivery { tx_hash: None };
        assert!(plan(&escrow, confirm.clone(), &Actor::User(p.admin), Utc::now()).is_ok());
        let err = plan(&escrow, confirm, &Actor::User(p.buyer), Utc::now()).unwrap_err();
        assert_eq!(err.kind(), "authorization");
    }

    #[test]
    fn test_timeout_guard() {
        let p = parties();
        let escrow = escrow_in(&p, EscrowState::Funded);
        let cmd = || Command::TimeoutRefund { tx_hash: None };

        let err = plan(&escrow, cmd(), &Actor::User(p.buyer), Utc::now()).unwrap_err();
        assert_eq!(err.kind(), "validation");

        let later = escrow.timeout_at + Duration::seconds(1);
        let record = expect_apply(plan(&escrow, cmd(), &Actor::User(p.buyer), later));
        assert_eq!(record.event.kind, EscrowEventKind::TimeoutRefund);

        // The contract already enforced its own deadline
        assert!(plan(&escrow, cmd(), &Actor::Ledger, Utc::now()).is_ok());
    }

    #[test]
    fn test_resolve_requires_admin() {
        let p = parties();
        let escrow = escrow_in(&p, EscrowState::Disputed);
        let resolution = Resolution {
            outcome: Some(ResolutionOutcome::Refund),
            recipient_id: Some(p.buyer.user_id),
            recipient: None,
            amount: 1_000,
            notes: "Seller failed to ship".into(),
            settlement_tx: None,
            settlement_error: Some("no on-chain trade".into()),
        };

        let err = plan(
            &escrow,
            Command::Resolve(resolution.clone()),
            &Actor::User(p.buyer),
            Utc::now(),
        )
        .unwrap_err();
        assert_eq!(err.kind(), "authorization");

        let record = expect_apply(plan(
            &escrow,
            Command::Resolve(resolution),
            &Actor::User(p.admin),
            Utc::now(),
        ));
        assert_eq!(record.event.payload["outcome"], "refund");
        assert_eq!(record.event.payload["amount"], "1000");
        assert_eq!(record.event.payload["actor"]["role"], json!(Role::Admin));
        assert!(record.event.tx_hash.is_none());
        assert_eq!(record.change.fields.resolution_notes.as_deref(), Some("Seller failed to ship"));
    }
}
