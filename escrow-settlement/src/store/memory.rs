use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{
    check_transition, conflict_reason, tx_taken_reason, EscrowStore, OpOutcome, StoreOp, TransitionCheck,
};
use crate::models::{Escrow, EscrowEvent, EscrowEventKind, EscrowFilter, NewEscrowEvent, Page, PageRequest};
use crate::state_machine::StateChange;
use crate::{EscrowError, EscrowResult};

type EventKey = (String, u64);

#[derive(Debug, Default)]
struct Inner {
    escrows: HashMap<Uuid, Escrow>,
    /// Event `id` lives at index `id - 1`
    events: Vec<EscrowEvent>,
    /// Idempotency key to event id
    keys: HashMap<EventKey, i64>,
    /// Funding transaction to the escrow it backs
    funding: HashMap<String, Uuid>,
}

/// One reversible write inside a commit
#[derive(Debug)]
enum Undo {
    Escrow(Escrow),
    Event(EscrowEvent),
    Inserted(Option<EventKey>),
    Bound(String),
}

impl Inner {
    fn has_key(&self, key: &Option<EventKey>) -> bool {
        key.as_ref().map_or(false, |key| self.keys.contains_key(key))
    }

    fn escrow(&self, id: Uuid) -> EscrowResult<&Escrow> {
        self.escrows
            .get(&id)
            .ok_or_else(|| EscrowError::not_found(format!("Escrow {id}")))
    }

    fn escrow_mut(&mut self, id: Uuid, undo: &mut Vec<Undo>) -> EscrowResult<&mut Escrow> {
        let escrow = self
            .escrows
            .get_mut(&id)
            .ok_or_else(|| EscrowError::not_found(format!("Escrow {id}")))?;
        undo.push(Undo::Escrow(escrow.clone()));
        Ok(escrow)
    }

    fn event_slot(&mut self, id: i64) -> Option<&mut EscrowEvent> {
        let index = usize::try_from(id.checked_sub(1)?).ok()?;
        self.events.get_mut(index)
    }

    fn event_mut(&mut self, id: i64, undo: &mut Vec<Undo>) -> EscrowResult<&mut EscrowEvent> {
        let event = self
            .event_slot(id)
            .ok_or_else(|| EscrowError::not_found(format!("Escrow event {id}")))?;
        undo.push(Undo::Event(event.clone()));
        Ok(event)
    }

    fn tx_taken(&self, tx_hash: &str, escrow_id: Uuid) -> bool {
        self.funding
            .get(tx_hash)
            .map_or(false, |owner| *owner != escrow_id)
    }

    fn bind(&mut self, tx_hash: &str, escrow_id: Uuid, undo: &mut Vec<Undo>) {
        if !self.funding.contains_key(tx_hash) {
            self.funding.insert(tx_hash.to_string(), escrow_id);
            undo.push(Undo::Bound(tx_hash.to_string()));
        }
    }

    fn insert_event(&mut self, event: NewEscrowEvent, undo: &mut Vec<Undo>) -> EscrowResult<()> {
        if !self.escrows.contains_key(&event.escrow_id) {
            return Err(EscrowError::not_found(format!("Escrow {}", event.escrow_id)));
        }
        let id = self.events.len() as i64 + 1;
        let key = event.idempotency_key();
        let funding = match (&event.tx_hash, event.kind, event.is_processed) {
            (Some(hash), EscrowEventKind::Funded, true) => Some(hash.clone()),
            _ => None,
        };
        let escrow_id = event.escrow_id;

        let now = Utc::now();
        self.events.push(EscrowEvent {
            id,
            escrow_id,
            kind: event.kind,
            payload: event.payload,
            tx_hash: event.tx_hash,
            block_number: event.block_number,
            block_hash: event.block_hash,
            log_index: event.log_index,
            is_processed: event.is_processed,
            processed_at: event.is_processed.then_some(now),
            error_message: event.error_message,
            retry_count: 0,
            created_at: now,
        });
        if let Some(key) = &key {
            self.keys.insert(key.clone(), id);
        }
        undo.push(Undo::Inserted(key));

        if let Some(hash) = funding {
            self.bind(&hash, escrow_id, undo);
        }
        Ok(())
    }

    /// Conditional change against the escrow as it stands
    fn apply_change(&mut self, change: &StateChange, undo: &mut Vec<Undo>) -> EscrowResult<OpOutcome> {
        let current = self.escrow(change.escrow_id)?;
        let actual = current.state;
        match check_transition(current, change) {
            TransitionCheck::AlreadyApplied => Ok(OpOutcome::AlreadyApplied),
            TransitionCheck::Conflict => Ok(OpOutcome::Conflict {
                actual,
                reason: conflict_reason(actual, change),
            }),
            TransitionCheck::Apply => {
                let hash = change.fields.onchain_tx_hash.as_deref();
                if let Some(hash) = hash {
                    if self.tx_taken(hash, change.escrow_id) {
                        return Ok(OpOutcome::Rejected {
                            reason: tx_taken_reason(hash),
                        });
                    }
                }
                change.apply_to(self.escrow_mut(change.escrow_id, undo)?);
                if let Some(hash) = hash {
                    self.bind(hash, change.escrow_id, undo);
                }
                Ok(OpOutcome::Applied)
            }
        }
    }

    fn apply(&mut self, op: StoreOp, undo: &mut Vec<Undo>) -> EscrowResult<OpOutcome> {
        match op {
            StoreOp::Transition(record) => {
                let key = record.event.idempotency_key();
                if self.has_key(&key) {
                    return Ok(OpOutcome::Duplicate);
                }

                let outcome = self.apply_change(&record.change, undo)?;
                match &outcome {
                    OpOutcome::Applied => self.insert_event(record.event, undo)?,
                    OpOutcome::AlreadyApplied if key.is_some() => self.insert_event(record.event, undo)?,
                    OpOutcome::Conflict { reason, .. } | OpOutcome::Rejected { reason } if key.is_some() => {
                        self.insert_event(record.event.unprocessed(reason.clone()), undo)?
                    }
                    _ => {}
                }
                Ok(outcome)
            }
            StoreOp::Append(event) => {
                if self.has_key(&event.idempotency_key()) {
                    return Ok(OpOutcome::Duplicate);
                }
                self.insert_event(event, undo)?;
                Ok(OpOutcome::Applied)
            }
            StoreOp::LinkTrade {
                escrow_id,
                trade_id,
                tx_hash,
                event,
            } => {
                if self.has_key(&event.idempotency_key()) {
                    return Ok(OpOutcome::Duplicate);
                }
                let taken_by_other = self
                    .escrows
                    .values()
                    .any(|e| e.id != escrow_id && e.onchain_trade_id == Some(trade_id));
                let escrow = self.escrow(escrow_id)?;
                let actual = escrow.state;
                let linked = escrow.onchain_trade_id;

                let conflict = if taken_by_other {
                    Some(format!("Trade {trade_id} is already linked to another escrow"))
                } else {
                    match linked {
                        Some(existing) if existing != trade_id => Some(format!(
                            "Escrow {escrow_id} is already linked to trade {existing}"
                        )),
                        _ => None,
                    }
                };
                if let Some(reason) = conflict {
                    self.insert_event(event.unprocessed(reason.clone()), undo)?;
                    return Ok(OpOutcome::Conflict { actual, reason });
                }

                let outcome = if linked == Some(trade_id) {
                    OpOutcome::AlreadyApplied
                } else {
                    let hash_free = !self.tx_taken(&tx_hash, escrow_id);
                    let escrow = self.escrow_mut(escrow_id, undo)?;
                    escrow.onchain_trade_id = Some(trade_id);
                    let set_hash = hash_free && escrow.onchain_tx_hash.is_none();
                    if set_hash {
                        escrow.onchain_tx_hash = Some(tx_hash.clone());
                    }
                    escrow.updated_at = Utc::now();
                    if set_hash {
                        self.bind(&tx_hash, escrow_id, undo);
                    }
                    OpOutcome::Applied
                };
                self.insert_event(event, undo)?;
                Ok(outcome)
            }
            StoreOp::Settle { event_id, change } => {
                let outcome = match change {
                    None => OpOutcome::Applied,
                    Some(change) => self.apply_change(&change, undo)?,
                };

                let event = self.event_mut(event_id, undo)?;
                match &outcome {
                    OpOutcome::Conflict { reason, .. } | OpOutcome::Rejected { reason } => {
                        event.retry_count += 1;
                        event.error_message = Some(reason.clone());
                    }
                    _ => {
                        event.is_processed = true;
                        event.processed_at = Some(Utc::now());
                        event.error_message = None;
                    }
                }
                Ok(outcome)
            }
            StoreOp::Fail { event_id, error } => {
                let event = self.event_mut(event_id, undo)?;
                event.retry_count += 1;
                event.error_message = Some(error);
                Ok(OpOutcome::Applied)
            }
        }
    }

    fn rollback(&mut self, undo: Vec<Undo>) {
        for step in undo.into_iter().rev() {
            match step {
                Undo::Escrow(prior) => {
                    self.escrows.insert(prior.id, prior);
                }
                Undo::Event(prior) => {
                    if let Some(slot) = self.event_slot(prior.id) {
                        *slot = prior;
                    }
                }
                Undo::Inserted(key) => {
                    self.events.pop();
                    if let Some(key) = key {
                        self.keys.remove(&key);
                    }
                }
                Undo::Bound(hash) => {
                    self.funding.remove(&hash);
                }
            }
        }
    }
}

/// In-process store for tests and single-process deployments.
///
/// Commits hold the write lock and keep an undo journal, so a failing op
/// reverts only what the commit touched.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite an escrow behind the state machine's back
    #[cfg(test)]
    pub async fn replace_escrow(&self, escrow: Escrow) {
        let mut inner = self.inner.write().await;
        if let Some(hash) = &escrow.onchain_tx_hash {
            inner.bind(hash, escrow.id, &mut Vec::new());
        }
        inner.escrows.insert(escrow.id, escrow);
    }
}

#[async_trait]
impl EscrowStore for MemoryStore {
    async fn insert_escrow(&self, escrow: &Escrow) -> EscrowResult<()> {
        let mut inner = self.inner.write().await;
        if inner
            .escrows
            .values()
            .any(|e| e.contract_id == escrow.contract_id)
        {
            return Err(EscrowError::validation(
                "Escrow already exists for this contract",
            ));
        }
        if let Some(hash) = &escrow.onchain_tx_hash {
            if inner.tx_taken(hash, escrow.id) {
                return Err(EscrowError::funding_verification(tx_taken_reason(hash)));
            }
            inner.bind(hash, escrow.id, &mut Vec::new());
        }
        inner.escrows.insert(escrow.id, escrow.clone());
        Ok(())
    }

    async fn escrow(&self, id: Uuid) -> EscrowResult<Option<Escrow>> {
        Ok(self.inner.read().await.escrows.get(&id).cloned())
    }

    async fn escrow_by_trade_id(&self, trade_id: u64) -> EscrowResult<Option<Escrow>> {
        let inner = self.inner.read().await;
        Ok(inner
            .escrows
            .values()
            .find(|e| e.onchain_trade_id == Some(trade_id))
            .cloned())
    }

    async fn list_escrows(&self, filter: &EscrowFilter, page: PageRequest) -> EscrowResult<Page<Escrow>> {
        let inner = self.inner.read().await;
        let mut matching: Vec<&Escrow> = inner
            .escrows
            .values()
            .filter(|e| filter.state.map_or(true, |s| e.state == s))
            .filter(|e| filter.contract_id.map_or(true, |c| e.contract_id == c))
            .filter(|e| filter.party_id.map_or(true, |p| e.is_party(p)))
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));

        let total = matching.len() as u64;
        let items = matching
            .into_iter()
            .skip(page.offset() as usize)
            .take(page.limit as usize)
            .cloned()
            .collect();
        Ok(Page::new(items, total, page))
    }

    async fn events(&self, escrow_id: Uuid) -> EscrowResult<Vec<EscrowEvent>> {
        let inner = self.inner.read().await;
        Ok(inner
            .events
            .iter()
            .filter(|e| e.escrow_id == escrow_id)
            .cloned()
            .collect())
    }

    async fn has_event(&self, tx_hash: &str, log_index: u64) -> EscrowResult<bool> {
        let key = Some((tx_hash.to_string(), log_index));
        Ok(self.inner.read().await.has_key(&key))
    }

    async fn last_processed_block(&self) -> EscrowResult<Option<u64>> {
        let inner = self.inner.read().await;
        Ok(inner
            .events
            .iter()
            .filter(|e| e.is_processed)
            .filter_map(|e| e.block_number)
            .max())
    }

    async fn pending_ledger_events(&self, max_retries: u32, limit: usize) -> EscrowResult<Vec<EscrowEvent>> {
        let inner = self.inner.read().await;
        let mut pending: Vec<EscrowEvent> = inner
            .events
            .iter()
            .filter(|e| !e.is_processed && e.retry_count < max_retries)
            .filter(|e| e.idempotency_key().is_some())
            .cloned()
            .collect();
        pending.sort_by_key(|e| (e.block_number, e.log_index));
        pending.truncate(limit);
        Ok(pending)
    }

    async fn record_confirmations(
        &self,
        escrow_id: Uuid,
        tx_hash: &str,
        confirmations: u64,
        is_confirmed: bool,
    ) -> EscrowResult<Escrow> {
        let mut inner = self.inner.write().await;
        let escrow = inner.escrow_mut(escrow_id, &mut Vec::new())?;
        if escrow.onchain_tx_hash.as_deref() == Some(tx_hash) && confirmations > escrow.confirmations {
            escrow.confirmations = confirmations;
            escrow.is_confirmed = escrow.is_confirmed || is_confirmed;
            escrow.updated_at = Utc::now();
        }
        Ok(escrow.clone())
    }

    async fn commit(&self, ops: Vec<StoreOp>) -> EscrowResult<Vec<OpOutcome>> {
        let mut inner = self.inner.write().await;
        let mut undo = Vec::new();
        let mut outcomes = Vec::with_capacity(ops.len());
        for op in ops {
            match inner.apply(op, &mut undo) {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => {
                    inner.rollback(undo);
                    return Err(e);
                }
            }
        }
        Ok(outcomes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EscrowAction, EscrowEventKind, EscrowState};
    use crate::state_machine::{StateChange, TransitionRecord};
    use chrono::Duration;
    use serde_json::json;

    fn new_escrow() -> Escrow {
        Escrow::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            Uuid::new_v4(),
            500,
            Utc::now() + Duration::days(30),
            None,
        )
    }

    fn transition(escrow_id: Uuid, action: EscrowAction) -> TransitionRecord {
        TransitionRecord {
            change: StateChange {
                escrow_id,
                action,
                from: action.from_state(),
                to: action.target_state(),
                at: Utc::now(),
                fields: Default::default(),
            },
            event: NewEscrowEvent::local(escrow_id, action.event_kind(), json!({})),
        }
    }

    fn observed(record: TransitionRecord, tx: &str, block: u64, index: u64) -> TransitionRecord {
        TransitionRecord {
            event: record.event.at_position(tx, block, "0xblock", index),
            ..record
        }
    }

    #[tokio::test]
    async fn test_one_escrow_per_contract() {
        let store = MemoryStore::new();
        let escrow = new_escrow();
        store.insert_escrow(&escrow).await.unwrap();

        let mut twin = new_escrow();
        twin.contract_id = escrow.contract_id;
        let err = store.insert_escrow(&twin).await.unwrap_err();
        assert_eq!(err.kind(), "validation");
    }

    #[tokio::test]
    async fn test_conditional_transition() {
        let store = MemoryStore::new();
        let escrow = new_escrow();
        store.insert_escrow(&escrow).await.unwrap();

        let fund = transition(escrow.id, EscrowAction::Fund);
        let outcomes = store.commit(vec![StoreOp::Transition(fund.clone())]).await.unwrap();
        assert_eq!(outcomes, vec![OpOutcome::Applied]);

        // Local replay: target already reached, no second event
        let outcomes = store.commit(vec![StoreOp::Transition(fund)]).await.unwrap();
        assert_eq!(outcomes, vec![OpOutcome::AlreadyApplied]);
        assert_eq!(store.events(escrow.id).await.unwrap().len(), 1);

        let resolve = transition(escrow.id, EscrowAction::Resolve);
        match &store.commit(vec![StoreOp::Transition(resolve)]).await.unwrap()[0] {
            OpOutcome::Conflict { actual, .. } => assert_eq!(*actual, EscrowState::Funded),
            other => panic!("Expected Conflict, got {:?}", other),
        }
        assert_eq!(store.events(escrow.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_ledger_event_is_ignored() {
        let store = MemoryStore::new();
        let escrow = new_escrow();
        store.insert_escrow(&escrow).await.unwrap();

        let fund = observed(transition(escrow.id, EscrowAction::Fund), "0xaa", 10, 0);
        store.commit(vec![StoreOp::Transition(fund.clone())]).await.unwrap();
        let outcomes = store.commit(vec![StoreOp::Transition(fund)]).await.unwrap();
        assert_eq!(outcomes, vec![OpOutcome::Duplicate]);

        assert_eq!(store.events(escrow.id).await.unwrap().len(), 1);
        assert!(store.has_event("0xaa", 0).await.unwrap());
        assert!(!store.has_event("0xaa", 1).await.unwrap());
        assert_eq!(store.last_processed_block().await.unwrap(), Some(10));
    }

    #[tokio::test]
    async fn test_conflicting_ledger_event_is_kept_for_retry() {
        let store = MemoryStore::new();
        let escrow = new_escrow();
        store.insert_escrow(&escrow).await.unwrap();

        let confirm = observed(transition(escrow.id, EscrowAction::ConfirmDelivery), "0xbb", 12, 3);
        let outcomes = store.commit(vec![StoreOp::Transition(confirm.clone())]).await.unwrap();
        assert!(matches!(outcomes[0], OpOutcome::Conflict { .. }));

        let pending = store.pending_ledger_events(3, 10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert!(!pending[0].is_processed);
        assert_eq!(store.last_processed_block().await.unwrap(), None);

        // Still illegal: retry counter climbs until the limit
        let event_id = pending[0].id;
        for _ in 0..3 {
            store
                .commit(vec![StoreOp::Settle {
                    event_id,
                    change: Some(confirm.change.clone()),
                }])
                .await
                .unwrap();
        }
        assert!(store.pending_ledger_events(3, 10).await.unwrap().is_empty());
        let events = store.events(escrow.id).await.unwrap();
        assert_eq!(events[0].retry_count, 3);
    }

    #[tokio::test]
    async fn test_settle_applies_once_legal() {
        let store = MemoryStore::new();
        let escrow = new_escrow();
        store.insert_escrow(&escrow).await.unwrap();

        let confirm = observed(transition(escrow.id, EscrowAction::ConfirmDelivery), "0xcc", 20, 1);
        store.commit(vec![StoreOp::Transition(confirm.clone())]).await.unwrap();
        store
            .commit(vec![StoreOp::Transition(transition(escrow.id, EscrowAction::Fund))])
            .await
            .unwrap();

        let event_id = store.pending_ledger_events(3, 10).await.unwrap()[0].id;
        let outcomes = store
            .commit(vec![StoreOp::Settle {
                event_id,
                change: Some(confirm.change),
            }])
            .await
            .unwrap();
        assert_eq!(outcomes, vec![OpOutcome::Applied]);

        let escrow = store.escrow(escrow.id).await.unwrap().unwrap();
        assert_eq!(escrow.state, EscrowState::Complete);
        assert_eq!(store.last_processed_block().await.unwrap(), Some(20));
    }

    #[tokio::test]
    async fn test_commit_is_atomic() {
        let store = MemoryStore::new();
        let escrow = new_escrow();
        store.insert_escrow(&escrow).await.unwrap();

        let ops = vec![
            StoreOp::Transition(transition(escrow.id, EscrowAction::Fund)),
            StoreOp::Append(NewEscrowEvent::local(
                Uuid::new_v4(),
                EscrowEventKind::Released,
                json!({}),
            )),
        ];
        assert!(store.commit(ops).await.is_err());

        let unchanged = store.escrow(escrow.id).await.unwrap().unwrap();
        assert_eq!(unchanged.state, EscrowState::AwaitingFund);
        assert!(store.events(escrow.id).await.unwrap().is_empty());
    }

    fn funding(escrow_id: Uuid, tx_hash: &str) -> TransitionRecord {
        let mut record = transition(escrow_id, EscrowAction::Fund);
        record.change.fields.onchain_tx_hash = Some(tx_hash.to_string());
        record.event = record.event.with_tx_hash(tx_hash);
        record
    }

    #[tokio::test]
    async fn test_funding_tx_backs_one_escrow() {
        let store = MemoryStore::new();
        let first = new_escrow();
        let second = new_escrow();
        store.insert_escrow(&first).await.unwrap();
        store.insert_escrow(&second).await.unwrap();

        let outcomes = store
            .commit(vec![StoreOp::Transition(funding(first.id, "0xf00d"))])
            .await
            .unwrap();
        assert_eq!(outcomes, vec![OpOutcome::Applied]);

        match &store
            .commit(vec![StoreOp::Transition(funding(second.id, "0xf00d"))])
            .await
            .unwrap()[0]
        {
            OpOutcome::Rejected { reason } => assert!(reason.contains("0xf00d")),
            other => panic!("Expected Rejected, got {:?}", other),
        }
        let second = store.escrow(second.id).await.unwrap().unwrap();
        assert_eq!(second.state, EscrowState::AwaitingFund);
        assert!(second.onchain_tx_hash.is_none());
        assert!(store.events(second.id).await.unwrap().is_empty());

        // An observed log for the same hash is kept unprocessed
        let observed = observed(funding(second.id, "0xf00d"), "0xf00d", 4, 1);
        let outcomes = store.commit(vec![StoreOp::Transition(observed)]).await.unwrap();
        assert!(matches!(outcomes[0], OpOutcome::Rejected { .. }));
        let pending = store.pending_ledger_events(3, 10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].escrow_id, second.id);
    }

    #[tokio::test]
    async fn test_completed_escrow_rejects_other_completions() {
        let store = MemoryStore::new();
        let escrow = new_escrow();
        store.insert_escrow(&escrow).await.unwrap();
        store
            .commit(vec![
                StoreOp::Transition(transition(escrow.id, EscrowAction::Fund)),
                StoreOp::Transition(transition(escrow.id, EscrowAction::ConfirmDelivery)),
            ])
            .await
            .unwrap();

        let refund = transition(escrow.id, EscrowAction::TimeoutRefund);
        match &store.commit(vec![StoreOp::Transition(refund)]).await.unwrap()[0] {
            OpOutcome::Conflict { actual, .. } => assert_eq!(*actual, EscrowState::Complete),
            other => panic!("Expected Conflict, got {:?}", other),
        }
        let confirm = transition(escrow.id, EscrowAction::ConfirmDelivery);
        let outcomes = store.commit(vec![StoreOp::Transition(confirm)]).await.unwrap();
        assert_eq!(outcomes, vec![OpOutcome::AlreadyApplied]);

        let stored = store.escrow(escrow.id).await.unwrap().unwrap();
        assert_eq!(stored.completed_by, Some(EscrowAction::ConfirmDelivery));
    }

    #[tokio::test]
    async fn test_failed_commit_releases_keys_and_bindings() {
        let store = MemoryStore::new();
        let escrow = new_escrow();
        let other = new_escrow();
        store.insert_escrow(&escrow).await.unwrap();
        store.insert_escrow(&other).await.unwrap();

        let fund = observed(funding(escrow.id, "0xabc"), "0xabc", 7, 0);
        let ops = vec![
            StoreOp::Transition(fund),
            StoreOp::Fail {
                event_id: 99,
                error: "gone".into(),
            },
        ];
        assert!(store.commit(ops).await.is_err());
        assert!(!store.has_event("0xabc", 0).await.unwrap());
        assert_eq!(store.last_processed_block().await.unwrap(), None);

        // Neither the key nor the funding hash is held any more
        let outcomes = store
            .commit(vec![StoreOp::Transition(observed(funding(other.id, "0xabc"), "0xabc", 7, 0))])
            .await
            .unwrap();
        assert_eq!(outcomes, vec![OpOutcome::Applied]);
        let events = store.events(other.id).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].id, 1);
    }

    #[tokio::test]
    async fn test_link_trade() {
        let store = MemoryStore::new();
        let escrow = new_escrow();
        let other = new_escrow();
        store.insert_escrow(&escrow).await.unwrap();
        store.insert_escrow(&other).await.unwrap();

        let link = |id: Uuid, index: u64| StoreOp::LinkTrade {
            escrow_id: id,
            trade_id: 7,
            tx_hash: "0xdd".into(),
            event: NewEscrowEvent::local(id, EscrowEventKind::Created, json!({}))
                .at_position("0xdd", 5, "0xblock", index),
        };
        assert_eq!(store.commit(vec![link(escrow.id, 0)]).await.unwrap(), vec![OpOutcome::Applied]);
        let linked = store.escrow_by_trade_id(7).await.unwrap().unwrap();
        assert_eq!(linked.id, escrow.id);
        assert_eq!(linked.onchain_tx_hash.as_deref(), Some("0xdd"));

        match &store.commit(vec![link(other.id, 1)]).await.unwrap()[0] {
            OpOutcome::Conflict { .. } => {}
            other => panic!("Expected Conflict, got {:?}", other),
        }
        assert!(store.escrow(other.id).await.unwrap().unwrap().onchain_trade_id.is_none());
    }

    #[tokio::test]
    async fn test_confirmations_are_monotonic() {
        let store = MemoryStore::new();
        let mut escrow = new_escrow();
        escrow.onchain_tx_hash = Some("0xee".into());
        escrow.confirmations = 5;
        store.insert_escrow(&escrow).await.unwrap();

        let e = store.record_confirmations(escrow.id, "0xee", 3, false).await.unwrap();
        assert_eq!(e.confirmations, 5);
        let e = store.record_confirmations(escrow.id, "0xee", 9, true).await.unwrap();
        assert_eq!(e.confirmations, 9);
        assert!(e.is_confirmed);
        let e = store.record_confirmations(escrow.id, "0xff", 50, true).await.unwrap();
        assert_eq!(e.confirmations, 9);
    }

    #[tokio::test]
    async fn test_list_filters_and_pages() {
        let store = MemoryStore::new();
        let party = Uuid::new_v4();
        for i in 0..5 {
            let mut escrow = new_escrow();
            if i % 2 == 0 {
                escrow.buyer_id = party;
            }
            escrow.created_at = Utc::now() + Duration::seconds(i);
            store.insert_escrow(&escrow).await.unwrap();
        }

        let filter = EscrowFilter {
            party_id: Some(party),
            ..Default::default()
        };
        let page = store
            .list_escrows(&filter, PageRequest { page: 1, limit: 2 })
            .await
            .unwrap();
        assert_eq!(page.total, 3);
        assert_eq!(page.items.len(), 2);
        assert!(page.has_next);
        assert!(page.items[0].created_at >= page.items[1].created_at);

        let funded = EscrowFilter {
            state: Some(EscrowState::Funded),
            ..Default::default()
        };
        let page = store.list_escrows(&funded, PageRequest::default()).await.unwrap();
        assert_eq!(page.total, 0);
    }
}
