//! Event Reconciler - folds confirmed contract events into local state
//!
//! The reconciler walks the ledger in block windows behind a monotonic
//! cursor. Each window's logs are mapped onto escrows, driven through the
//! state machine as [`Actor::Ledger`], and committed as a single batch keyed
//! by `(tx_hash, log_index)`. The cursor only moves after the commit, so a
//! crash replays the window and the idempotency key absorbs the repeats.
//!
//! Events that arrive before the escrow can take them (a dispute observed
//! ahead of its funding, say) are stored unprocessed and retried at the start
//! of every cycle until `max_retries`.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::EscrowError;
use crate::ledger::{ContractEvent, EventName, LedgerGateway, LedgerLog};
use crate::models::{Escrow, EscrowEvent, EscrowEventKind, NewEscrowEvent};
use crate::state_machine::{self, Actor, Command, FundingEvidence, Plan, Resolution};
use crate::store::{EscrowStore, OpOutcome, StoreOp};
use crate::EscrowResult;

/// Configuration for the event reconciler
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcilerConfig {
    /// Sleep when caught up or after a failed cycle
    pub poll_interval_secs: u64,
    /// Sleep between consecutive batches while catching up
    pub batch_pause_ms: u64,
    /// Blocks per window
    pub batch_size: u64,
    /// How far behind the head to start with no processed events
    pub lookback_blocks: u64,
    /// Attempts before an unprocessed event is left alone
    pub max_retries: u32,
    /// Blocks kept between the scan head and the chain head
    pub confirmation_depth: u64,
    /// Unprocessed events retried per cycle
    pub retry_batch_limit: usize,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 10,
            batch_pause_ms: 1_000,
            batch_size: 100,
            lookback_blocks: 1_000,
            max_retries: 3,
            confirmation_depth: 3,
            retry_batch_limit: 100,
        }
    }
}

/// Counts for one processed window
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub from_block: u64,
    pub to_block: u64,
    pub fetched: usize,
    /// Transitions applied
    pub applied: usize,
    /// Trades linked to escrows
    pub linked: usize,
    /// Events recorded without a transition
    pub recorded: usize,
    /// Events stored unprocessed for a later retry
    pub deferred: usize,
    /// Events already stored
    pub duplicates: usize,
    /// Events that could not be mapped to an escrow
    pub skipped: usize,
    /// Why each skipped event was left out
    pub unmapped: Vec<String>,
}

impl BatchReport {
    fn absorb(&mut self, other: &BatchReport) {
        self.fetched += other.fetched;
        self.applied += other.applied;
        self.linked += other.linked;
        self.recorded += other.recorded;
        self.deferred += other.deferred;
        self.duplicates += other.duplicates;
        self.skipped += other.skipped;
        self.unmapped.extend(other.unmapped.iter().cloned());
    }

    fn skip(&mut self, error: EscrowError) {
        warn!("{}", error);
        self.skipped += 1;
        self.unmapped.push(error.to_string());
    }
}

/// What a poll cycle did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// Cursor already at the safe head
    Idle { height: u64 },
    Batch(BatchReport),
}

#[derive(Debug, Clone, Copy)]
enum Staged {
    Transition,
    Observation,
    Deferred,
    Link,
}

/// Pending writes plus the escrows as they will look after them
#[derive(Default)]
struct Overlay {
    ops: Vec<StoreOp>,
    staged: Vec<Staged>,
    escrows: HashMap<Uuid, Escrow>,
    trades: HashMap<u64, Uuid>,
    seen: HashSet<(String, u64)>,
}

impl Overlay {
    fn push(&mut self, op: StoreOp, staged: Staged) {
        self.ops.push(op);
        self.staged.push(staged);
    }
}

/// Main event reconciler
pub struct Reconciler {
    config: ReconcilerConfig,
    store: Arc<dyn EscrowStore>,
    ledger: Arc<dyn LedgerGateway>,
    cursor: Mutex<Option<u64>>,
}

impl Reconciler {
    pub fn new(
        config: ReconcilerConfig,
        store: Arc<dyn EscrowStore>,
        ledger: Arc<dyn LedgerGateway>,
    ) -> Self {
        Self {
            config,
            store,
            ledger,
            cursor: Mutex::new(None),
        }
    }

    /// Last block folded into local state by this instance
    pub async fn cursor(&self) -> Option<u64> {
        *self.cursor.lock().await
    }

    /// Poll until `shutdown` flips to true or its sender goes away
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Starting event reconciler (poll every {}s, {} blocks per batch)",
            self.config.poll_interval_secs, self.config.batch_size
        );

        let idle = Duration::from_secs(self.config.poll_interval_secs);
        let busy = Duration::from_millis(self.config.batch_pause_ms);

        loop {
            if *shutdown.borrow() {
                break;
            }

            let pause = match self.poll_once().await {
                Ok(PollOutcome::Idle { height }) => {
                    debug!("Reconciler idle at height {}", height);
                    idle
                }
                Ok(PollOutcome::Batch(_)) => busy,
                Err(e) => {
                    error!("Reconciler cycle aborted: {}", e);
                    idle
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!("Event reconciler stopped");
    }

    /// One cycle: retry sweep, then at most one window
    pub async fn poll_once(&self) -> EscrowResult<PollOutcome> {
        let height = self.ledger.current_block().await?;
        self.retry_pending(height).await?;

        let safe_head = height.saturating_sub(self.config.confirmation_depth);
        let mut cursor = self.cursor.lock().await;
        let last = match *cursor {
            Some(block) => block,
            None => {
                let start = match self.store.last_processed_block().await? {
                    Some(block) => block,
                    None => safe_head.saturating_sub(self.config.lookback_blocks),
                };
                info!("Reconciler cursor initialized at block {}", start);
                *cursor = Some(start);
                start
            }
        };

        if last >= safe_head {
            return Ok(PollOutcome::Idle { height });
        }

        let from = last + 1;
        let to = safe_head.min(last.saturating_add(self.config.batch_size.max(1)));
        let report = self.process_window(from, to, height).await?;
        *cursor = Some(to);

        Ok(PollOutcome::Batch(report))
    }

    /// Replay `[from, to]` once without touching the cursor
    pub async fn scan(&self, from: u64, to: u64) -> EscrowResult<BatchReport> {
        if from > to {
            return Err(EscrowError::validation(format!(
                "Invalid block range {}..{}",
                from, to
            )));
        }
        let height = self.ledger.current_block().await?;
        let step = self.config.batch_size.max(1);

        let mut total = BatchReport {
            from_block: from,
            to_block: to,
            ..Default::default()
        };
        let mut start = from;
        loop {
            let end = to.min(start.saturating_add(step - 1));
            let report = self.process_window(start, end, height).await?;
            total.absorb(&report);
            if end >= to {
                break;
            }
            start = end + 1;
        }
        Ok(total)
    }

    async fn process_window(&self, from: u64, to: u64, height: u64) -> EscrowResult<BatchReport> {
        let logs = self.ledger.query_events(&EventName::ALL, from, to).await?;
        let mut report = BatchReport {
            from_block: from,
            to_block: to,
            fetched: logs.len(),
            ..Default::default()
        };

        let mut overlay = Overlay::default();
        for log in &logs {
            self.stage(&mut overlay, &mut report, log, height).await?;
        }

        if !overlay.ops.is_empty() {
            let outcomes = self.store.commit(overlay.ops).await?;
            for (staged, outcome) in overlay.staged.iter().zip(outcomes) {
                tally(&mut report, *staged, &outcome);
            }
        }

        info!(
            "Reconciled blocks {}..={}: {} events, {} applied, {} linked, {} recorded, {} deferred, {} duplicates, {} skipped",
            from,
            to,
            report.fetched,
            report.applied,
            report.linked,
            report.recorded,
            report.deferred,
            report.duplicates,
            report.skipped
        );
        Ok(report)
    }

    async fn stage(
        &self,
        overlay: &mut Overlay,
        report: &mut BatchReport,
        log: &LedgerLog,
        height: u64,
    ) -> EscrowResult<()> {
        let tx_hash = log.tx_hash.to_string();
        let key = (tx_hash.clone(), log.log_index);
        if overlay.seen.contains(&key) || self.store.has_event(&tx_hash, log.log_index).await? {
            report.duplicates += 1;
            return Ok(());
        }
        overlay.seen.insert(key);

        match &log.event {
            ContractEvent::Unrecognized { topic, reason } => {
                report.skip(EscrowError::reconciliation(format!(
                    "Undecodable log {}:{} (topic {}): {}",
                    tx_hash, log.log_index, topic, reason
                )));
            }
            ContractEvent::EscrowCreated {
                trade_id, metadata, ..
            } => {
                let Some(escrow_id) = escrow_id_from_metadata(metadata) else {
                    report.skip(EscrowError::reconciliation(format!(
                        "Orphaned EscrowCreated for trade {} in {}: no escrow id in metadata",
                        trade_id, tx_hash
                    )));
                    return Ok(());
                };
                let Some(escrow) = self.load(overlay, escrow_id).await? else {
                    report.skip(EscrowError::reconciliation(format!(
                        "EscrowCreated for trade {} names unknown escrow {}",
                        trade_id, escrow_id
                    )));
                    return Ok(());
                };

                let holder = self.escrow_for_trade(overlay, *trade_id).await?;
                let free = holder.as_ref().map_or(true, |h| h.id == escrow.id);
                if free && escrow.onchain_trade_id.map_or(true, |t| t == *trade_id) {
                    overlay.trades.insert(*trade_id, escrow.id);
                    if let Some(cached) = overlay.escrows.get_mut(&escrow.id) {
                        cached.onchain_trade_id = Some(*trade_id);
                        cached.onchain_tx_hash.get_or_insert_with(|| tx_hash.clone());
                    }
                }

                let payload = observed_payload(json!({ "state": escrow.state.as_str() }), log)?;
                let event = observation(escrow.id, EscrowEventKind::Created, payload, log);
                overlay.push(
                    StoreOp::LinkTrade {
                        escrow_id: escrow.id,
                        trade_id: *trade_id,
                        tx_hash,
                        event,
                    },
                    Staged::Link,
                );
            }
            event => {
                let Some(trade_id) = event.trade_id() else {
                    return Ok(());
                };
                let Some(escrow) = self.escrow_for_trade(overlay, trade_id).await? else {
                    report.skip(EscrowError::reconciliation(format!(
                        "{} for unknown trade {} in {}",
                        log.event.name().map_or("Event", |n| n.as_str()),
                        trade_id,
                        tx_hash
                    )));
                    return Ok(());
                };

                let Some(command) = ledger_command(event, &tx_hash, log.block_number, height) else {
                    let payload = observed_payload(json!({ "state": escrow.state.as_str() }), log)?;
                    overlay.push(
                        StoreOp::Append(observation(escrow.id, EscrowEventKind::Released, payload, log)),
                        Staged::Observation,
                    );
                    return Ok(());
                };
                let kind = command.action().event_kind();

                match state_machine::plan(&escrow, command, &Actor::Ledger, Utc::now()) {
                    Ok(Plan::Apply(mut record)) => {
                        let payload = observed_payload(record.event.payload.take(), log)?;
                        record.event = observation(escrow.id, kind, payload, log);
                        if let Some(cached) = overlay.escrows.get_mut(&escrow.id) {
                            record.change.apply_to(cached);
                        }
                        overlay.push(StoreOp::Transition(record), Staged::Transition);
                    }
                    Ok(Plan::NoOp(state)) => {
                        debug!("Escrow {} already {}; recording {}", escrow.id, state, kind);
                        let payload = observed_payload(json!({ "state": state.as_str() }), log)?;
                        overlay.push(
                            StoreOp::Append(observation(escrow.id, kind, payload, log)),
                            Staged::Observation,
                        );
                    }
                    Err(e) => {
                        let error = EscrowError::reconciliation(format!(
                            "{} for escrow {} at {}:{} deferred: {}",
                            kind, escrow.id, tx_hash, log.log_index, e
                        ));
                        warn!("{}", error);
                        let payload = observed_payload(json!({ "state": escrow.state.as_str() }), log)?;
                        overlay.push(
                            StoreOp::Append(
                                observation(escrow.id, kind, payload, log).unprocessed(error.to_string()),
                            ),
                            Staged::Deferred,
                        );
                    }
                }
            }
        }

        Ok(())
    }

    /// Escrow by id, preferring the batch's pending view
    async fn load(&self, overlay: &mut Overlay, escrow_id: Uuid) -> EscrowResult<Option<Escrow>> {
        if let Some(escrow) = overlay.escrows.get(&escrow_id) {
            return Ok(Some(escrow.clone()));
        }
        let Some(escrow) = self.store.escrow(escrow_id).await? else {
            return Ok(None);
        };
        if let Some(trade_id) = escrow.onchain_trade_id {
            overlay.trades.entry(trade_id).or_insert(escrow.id);
        }
        overlay.escrows.insert(escrow.id, escrow.clone());
        Ok(Some(escrow))
    }

    async fn escrow_for_trade(&self, overlay: &mut Overlay, trade_id: u64) -> EscrowResult<Option<Escrow>> {
        if let Some(escrow_id) = overlay.trades.get(&trade_id).copied() {
            return self.load(overlay, escrow_id).await;
        }
        let Some(escrow) = self.store.escrow_by_trade_id(trade_id).await? else {
            return Ok(None);
        };
        overlay.trades.insert(trade_id, escrow.id);
        let cached = overlay.escrows.entry(escrow.id).or_insert(escrow);
        Ok(Some(cached.clone()))
    }

    /// Retry unprocessed ledger events; returns how many were settled
    async fn retry_pending(&self, height: u64) -> EscrowResult<usize> {
        let pending = self
            .store
            .pending_ledger_events(self.config.max_retries, self.config.retry_batch_limit)
            .await?;
        if pending.is_empty() {
            return Ok(0);
        }

        let mut escrows: HashMap<Uuid, Escrow> = HashMap::new();
        let mut ops = Vec::with_capacity(pending.len());
        for event in &pending {
            ops.push(self.retry_op(&mut escrows, event, height).await?);
        }

        let outcomes = self.store.commit(ops).await?;
        let settled = outcomes
            .iter()
            .filter(|o| matches!(o, OpOutcome::Applied | OpOutcome::AlreadyApplied))
            .count();
        info!(
            "Retried {} unprocessed ledger events, {} settled",
            pending.len(),
            settled
        );
        Ok(settled)
    }

    async fn retry_op(
        &self,
        escrows: &mut HashMap<Uuid, Escrow>,
        event: &EscrowEvent,
        height: u64,
    ) -> EscrowResult<StoreOp> {
        let fail = |reason: String| StoreOp::Fail {
            event_id: event.id,
            error: EscrowError::reconciliation(reason).to_string(),
        };

        let decoded = event
            .payload
            .get("ledger_event")
            .cloned()
            .map(serde_json::from_value::<ContractEvent>);
        let ledger_event = match decoded {
            Some(Ok(ledger_event)) => ledger_event,
            Some(Err(e)) => return Ok(fail(format!("Stored ledger event is malformed: {e}"))),
            None => return Ok(fail("Stored ledger event is missing".to_string())),
        };

        if !escrows.contains_key(&event.escrow_id) {
            match self.store.escrow(event.escrow_id).await? {
                Some(escrow) => {
                    escrows.insert(escrow.id, escrow);
                }
                None => return Ok(fail(format!("Escrow {} no longer exists", event.escrow_id))),
            }
        }
        let Some(escrow) = escrows.get_mut(&event.escrow_id) else {
            return Ok(fail(format!("Escrow {} no longer exists", event.escrow_id)));
        };

        if let ContractEvent::EscrowCreated { trade_id, .. } = &ledger_event {
            return Ok(fail(format!(
                "Trade {} cannot be linked to escrow {}",
                trade_id, escrow.id
            )));
        }

        let tx_hash = event.tx_hash.clone().unwrap_or_default();
        let block = event.block_number.unwrap_or(height);
        let Some(command) = ledger_command(&ledger_event, &tx_hash, block, height) else {
            return Ok(StoreOp::Settle {
                event_id: event.id,
                change: None,
            });
        };

        match state_machine::plan(escrow, command, &Actor::Ledger, Utc::now()) {
            Ok(Plan::Apply(record)) => {
                record.change.apply_to(escrow);
                Ok(StoreOp::Settle {
                    event_id: event.id,
                    change: Some(record.change),
                })
            }
            Ok(Plan::NoOp(_)) => Ok(StoreOp::Settle {
                event_id: event.id,
                change: None,
            }),
            Err(e) => Ok(fail(e.to_string())),
        }
    }
}

fn tally(report: &mut BatchReport, staged: Staged, outcome: &OpOutcome) {
    match (staged, outcome) {
        (_, OpOutcome::Duplicate) => report.duplicates += 1,
        (_, OpOutcome::Conflict { .. } | OpOutcome::Rejected { .. }) | (Staged::Deferred, _) => {
            report.deferred += 1
        }
        (Staged::Transition, OpOutcome::Applied) => report.applied += 1,
        (Staged::Transition, OpOutcome::AlreadyApplied) => report.recorded += 1,
        (Staged::Link, _) => report.linked += 1,
        (Staged::Observation, _) => report.recorded += 1,
    }
}

/// Command a contract event drives; `None` for record-only events
fn ledger_command(event: &ContractEvent, tx_hash: &str, block: u64, height: u64) -> Option<Command> {
    let hash = Some(tx_hash.to_string());
    match event {
        ContractEvent::Funded { .. } => Some(Command::Fund(FundingEvidence::Ledger {
            tx_hash: tx_hash.to_string(),
            confirmations: height.saturating_sub(block),
        })),
        ContractEvent::DeliveryConfirmed { .. } => Some(Command::ConfirmDelivery { tx_hash: hash }),
        ContractEvent::Disputed { reason, .. } => Some(Command::RaiseDispute {
            reason: reason.clone(),
            evidence_urls: Vec::new(),
        }),
        ContractEvent::Resolved {
            to,
            amount,
            resolution,
            ..
        } => Some(Command::Resolve(Resolution {
            outcome: None,
            recipient_id: None,
            recipient: Some(*to),
            amount: *amount,
            notes: resolution.clone(),
            settlement_tx: hash,
            settlement_error: None,
        })),
        ContractEvent::TimeoutRefund { .. } => Some(Command::TimeoutRefund { tx_hash: hash }),
        ContractEvent::EscrowCreated { .. }
        | ContractEvent::Released { .. }
        | ContractEvent::Unrecognized { .. } => None,
    }
}

fn escrow_id_from_metadata(metadata: &str) -> Option<Uuid> {
    let value: Value = serde_json::from_str(metadata).ok()?;
    value.get("escrow_id")?.as_str()?.parse().ok()
}

/// Extend a payload with the event's name, arguments and stored form
fn observed_payload(mut payload: Value, log: &LedgerLog) -> EscrowResult<Value> {
    if !payload.is_object() {
        payload = json!({});
    }
    payload["event"] = json!(log.event.name().map(|n| n.as_str()));
    payload["args"] = log.event.args_json();
    payload["ledger_event"] = serde_json::to_value(&log.event)?;
    Ok(payload)
}

fn observation(escrow_id: Uuid, kind: EscrowEventKind, payload: Value, log: &LedgerLog) -> NewEscrowEvent {
    NewEscrowEvent::local(escrow_id, kind, payload).at_position(
        log.tx_hash.to_string(),
        log.block_number,
        log.block_hash.clone(),
        log.log_index,
    )
}
