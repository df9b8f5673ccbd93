use crate::context::RuntimeContext;
use crate::events::{Event, EventBus};
use crate::metrics;
use crate::model::{Fill, Intent, IntentStatus, Position, Signal, TradeRecord};
use crate::persistence::sink::{PersistenceSink, WriteOp};
use crate::persistence::store::PersistenceStore;
use dashmap::DashMap;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

const MAX_TRADE_HISTORY: usize = 1000;

/// Authoritative local ledger of intents and open positions.
///
/// Mutations are keyed by symbol; callers running a full signal pipeline take
/// the per-symbol lock via `symbol_lock` so intent transitions and position
/// mutations for one symbol are totally ordered while symbols proceed
/// concurrently. Persistence is enqueued after each change on the background
/// sink and never gates the caller.
pub struct ShadowState {
    positions: DashMap<String, Position>,
    intents: DashMap<String, Intent>,
    trade_history: RwLock<Vec<TradeRecord>>,
    symbol_locks: DashMap<String, Arc<Mutex<()>>>,
    sink: Arc<PersistenceSink>,
    events: EventBus,
    ctx: RuntimeContext,
}

impl ShadowState {
    pub fn new(
        store: &PersistenceStore,
        sink: Arc<PersistenceSink>,
        events: EventBus,
        ctx: RuntimeContext,
    ) -> Arc<Self> {
        let state = Self {
            positions: DashMap::new(),
            intents: DashMap::new(),
            trade_history: RwLock::new(Vec::new()),
            symbol_locks: DashMap::new(),
            sink,
            events,
            ctx,
        };
        state.hydrate(store);
        Arc::new(state)
    }

    fn hydrate(&self, store: &PersistenceStore) {
        match store.load_positions() {
            Ok(positions) => {
                for pos in positions {
                    self.positions.insert(pos.symbol.clone(), pos);
                }
                info!("Positions hydrated: {}", self.positions.len());
                metrics::set_active_positions(self.positions.len() as i64);
            }
            Err(e) => warn!("Failed to hydrate positions: {}", e),
        }

        match store.load_intents() {
            Ok(intents) => {
                for intent in intents {
                    self.intents.insert(intent.signal_id.clone(), intent);
                }
                info!("Intents hydrated: {}", self.intents.len());
            }
            Err(e) => warn!("Failed to hydrate intents: {}", e),
        }

        match store.load_trades() {
            Ok(trades) => {
                *self.trade_history.write() = trades;
                info!("Trade history hydrated: {}", self.trade_history.read().len());
            }
            Err(e) => warn!("Failed to hydrate trade history: {}", e),
        }
    }

    /// Per-symbol mutual exclusion for the execution pipeline.
    pub fn symbol_lock(&self, symbol: &str) -> Arc<Mutex<()>> {
        self.symbol_locks
            .entry(symbol.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Idempotent by `signal_id`: a duplicate PREPARE returns the existing
    /// intent unchanged.
    pub fn process_intent(&self, signal: Signal) -> Intent {
        if let Some(existing) = self.intents.get(&signal.signal_id) {
            warn!(signal_id = %signal.signal_id, "Duplicate intent, returning existing state");
            return existing.clone();
        }

        let intent = Intent::from_signal(signal, self.ctx.time.now_millis());
        self.intents
            .insert(intent.signal_id.clone(), intent.clone());
        self.sink.enqueue(WriteOp::SaveIntent(intent.clone()));
        // Regime context rides along for the by-regime history queries.
        if let Ok(regime) = serde_json::to_value(&intent.signal.regime) {
            self.sink.enqueue(WriteOp::RegimeSnapshot(serde_json::json!({
                "signal_id": intent.signal_id,
                "symbol": intent.symbol,
                "at": intent.t_ingress,
                "regime": regime,
            })));
        }

        info!(
            signal_id = %intent.signal_id,
            symbol = %intent.symbol,
            side = ?intent.side,
            "Intent created"
        );
        self.events.publish(Event::IntentCreated {
            signal_id: intent.signal_id.clone(),
            symbol: intent.symbol.clone(),
        });
        intent
    }

    fn transition(&self, signal_id: &str, next: IntentStatus, reason: Option<String>) -> Option<Intent> {
        let mut entry = match self.intents.get_mut(signal_id) {
            Some(e) => e,
            None => {
                warn!(signal_id = %signal_id, next = ?next, "Intent not found for transition");
                return None;
            }
        };

        if !entry.status.can_transition_to(next) {
            warn!(
                signal_id = %signal_id,
                from = ?entry.status,
                to = ?next,
                "Illegal intent transition refused"
            );
            return None;
        }

        entry.status = next;
        if reason.is_some() {
            entry.rejection_reason = reason;
        }
        let intent = entry.clone();
        drop(entry);

        self.sink.enqueue(WriteOp::SaveIntent(intent.clone()));
        if next.is_terminal() {
            self.events.publish(Event::IntentResolved {
                signal_id: signal_id.to_string(),
                status: format!("{:?}", next).to_uppercase(),
            });
        }
        Some(intent)
    }

    pub fn validate_intent(&self, signal_id: &str) -> Option<Intent> {
        let intent = self.transition(signal_id, IntentStatus::Validated, None)?;
        info!(signal_id = %signal_id, "Intent validated");
        Some(intent)
    }

    pub fn reject_intent(&self, signal_id: &str, reason: String) -> Option<Intent> {
        let intent = self.transition(signal_id, IntentStatus::Rejected, Some(reason.clone()))?;
        metrics::inc_rejected_signals();
        warn!(signal_id = %signal_id, reason = %reason, "Intent rejected");
        Some(intent)
    }

    pub fn mark_executing(&self, signal_id: &str) -> Option<Intent> {
        self.transition(signal_id, IntentStatus::Executing, None)
    }

    pub fn cancel_intent(&self, signal_id: &str, reason: String) -> Option<Intent> {
        let intent = self.transition(signal_id, IntentStatus::Canceled, Some(reason.clone()))?;
        info!(signal_id = %signal_id, reason = %reason, "Intent canceled");
        Some(intent)
    }

    pub fn get_intent(&self, signal_id: &str) -> Option<Intent> {
        self.intents.get(signal_id).map(|e| e.clone())
    }

    pub fn intent_status(&self, signal_id: &str) -> Option<IntentStatus> {
        self.intents.get(signal_id).map(|e| e.status)
    }

    /// Creates or augments the symbol's position from a fill report and
    /// settles the intent. Augmentation recomputes the weighted average entry.
    pub fn confirm_execution(&self, signal_id: &str, fill: &Fill, phase: u8) -> Option<Position> {
        if !fill.filled || fill.fill_size <= Decimal::ZERO || fill.fill_price <= Decimal::ZERO {
            warn!(
                signal_id = %signal_id,
                fill_size = %fill.fill_size,
                fill_price = %fill.fill_price,
                "Fill report unusable, intent canceled"
            );
            self.cancel_intent(signal_id, "broker did not fill".to_string());
            return None;
        }

        let intent = self.transition(signal_id, IntentStatus::Filled, None)?;
        let symbol = intent.symbol.clone();

        let position = match self.positions.get_mut(&symbol) {
            Some(mut existing) if existing.side == intent.side => {
                // Same-side augmentation: weighted average entry.
                let total = existing.size + fill.fill_size;
                let value =
                    existing.avg_entry_price * existing.size + fill.fill_price * fill.fill_size;
                existing.avg_entry_price = value / total;
                existing.size = total;
                existing.broker_order_ids.push(fill.broker_order_id.clone());

                info!(
                    signal_id = %signal_id,
                    symbol = %symbol,
                    new_size = %existing.size,
                    avg_entry = %existing.avg_entry_price,
                    "Position increased"
                );
                let snapshot = existing.clone();
                drop(existing);
                self.events.publish(Event::PositionUpdated(snapshot.clone()));
                snapshot
            }
            Some(existing) => {
                // One open position per symbol: an opposite-side fill is an
                // operator error at this layer, not a flip.
                warn!(
                    signal_id = %signal_id,
                    symbol = %symbol,
                    existing_side = ?existing.side,
                    fill_side = ?intent.side,
                    "Opposite-side fill against open position ignored"
                );
                return None;
            }
            None => {
                let position = Position {
                    symbol: symbol.clone(),
                    side: intent.side,
                    size: fill.fill_size,
                    avg_entry_price: fill.fill_price,
                    current_stop: intent.signal.stop_loss,
                    take_profits: intent.signal.take_profits.clone(),
                    broker_order_ids: vec![fill.broker_order_id.clone()],
                    signal_id: signal_id.to_string(),
                    opened_at: self.ctx.time.now(),
                    phase_at_entry: phase,
                    regime_at_entry: intent.signal.regime.regime_state,
                    unrealized_pnl: Decimal::ZERO,
                    last_mark_price: None,
                    reconciled_at: None,
                };
                self.positions.insert(symbol.clone(), position.clone());
                metrics::set_active_positions(self.positions.len() as i64);

                info!(
                    signal_id = %signal_id,
                    symbol = %symbol,
                    side = ?position.side,
                    size = %position.size,
                    entry_price = %position.avg_entry_price,
                    "Position opened"
                );
                self.events.publish(Event::PositionOpened(position.clone()));
                position
            }
        };

        metrics::inc_filled_orders();
        self.sink.enqueue(WriteOp::SavePosition(position.clone()));
        Some(position)
    }

    /// Deletes the position and returns the realized trade:
    /// pnl = (exit - avg_entry) * size * sign(side).
    pub fn close_position(
        &self,
        symbol: &str,
        exit_price: Decimal,
        reason: &str,
    ) -> Option<TradeRecord> {
        let (_, position) = self.positions.remove(symbol)?;
        metrics::set_active_positions(self.positions.len() as i64);

        let pnl = position.realized_pnl(exit_price, position.size);
        let pnl_pct = if position.avg_entry_price.is_zero() {
            Decimal::ZERO
        } else {
            (exit_price - position.avg_entry_price) / position.avg_entry_price
                * Decimal::from(100 * position.side.sign())
        };

        let trade = TradeRecord {
            signal_id: position.signal_id.clone(),
            symbol: symbol.to_string(),
            side: position.side,
            entry_price: position.avg_entry_price,
            exit_price,
            size: position.size,
            pnl,
            pnl_pct,
            opened_at: position.opened_at,
            closed_at: self.ctx.time.now(),
            close_reason: reason.to_string(),
            phase: position.phase_at_entry,
            regime_state: position.regime_at_entry,
        };

        {
            let mut history = self.trade_history.write();
            history.push(trade.clone());
            if history.len() > MAX_TRADE_HISTORY {
                history.remove(0);
            }
        }

        self.sink.enqueue(WriteOp::DeletePosition(symbol.to_string()));
        self.sink.enqueue(WriteOp::SaveTrade(trade.clone()));

        info!(
            symbol = %symbol,
            pnl = %pnl,
            reason = %reason,
            "Position closed"
        );
        self.events.publish(Event::PositionClosed(trade.clone()));
        Some(trade)
    }

    /// Pyramid path: add a filled layer to an existing position. Unlike
    /// `confirm_execution` there is no intent to settle.
    pub fn augment_position(
        &self,
        symbol: &str,
        fill_price: Decimal,
        fill_size: Decimal,
        broker_order_id: String,
    ) -> Option<Position> {
        let mut position = self.positions.get_mut(symbol)?;
        let total = position.size + fill_size;
        let value = position.avg_entry_price * position.size + fill_price * fill_size;
        position.avg_entry_price = value / total;
        position.size = total;
        position.broker_order_ids.push(broker_order_id);
        let snapshot = position.clone();
        drop(position);

        self.sink.enqueue(WriteOp::SavePosition(snapshot.clone()));
        self.events.publish(Event::PositionUpdated(snapshot.clone()));
        Some(snapshot)
    }

    /// Reconciler path: drop a position the broker no longer has, without
    /// synthesizing an exit trade.
    pub fn remove_position_unrecorded(&self, symbol: &str) -> Option<Position> {
        let (_, position) = self.positions.remove(symbol)?;
        metrics::set_active_positions(self.positions.len() as i64);
        self.sink.enqueue(WriteOp::DeletePosition(symbol.to_string()));
        Some(position)
    }

    pub fn update_stop(&self, symbol: &str, stop: Decimal) -> Option<Position> {
        let mut position = self.positions.get_mut(symbol)?;
        position.current_stop = stop;
        let snapshot = position.clone();
        drop(position);
        self.sink.enqueue(WriteOp::SavePosition(snapshot.clone()));
        self.events.publish(Event::PositionUpdated(snapshot.clone()));
        Some(snapshot)
    }

    pub fn update_valuation(&self, symbol: &str, mark_price: Decimal) -> Option<Position> {
        let mut position = self.positions.get_mut(symbol)?;
        position.unrealized_pnl = position.realized_pnl(mark_price, position.size);
        position.last_mark_price = Some(mark_price);
        Some(position.clone())
    }

    pub fn mark_reconciled(&self, symbol: &str) {
        if let Some(mut position) = self.positions.get_mut(symbol) {
            position.reconciled_at = Some(self.ctx.time.now());
        }
    }

    pub fn has_position(&self, symbol: &str) -> bool {
        self.positions.contains_key(symbol)
    }

    pub fn get_position(&self, symbol: &str) -> Option<Position> {
        self.positions.get(symbol).map(|p| p.clone())
    }

    pub fn all_positions(&self) -> Vec<Position> {
        self.positions.iter().map(|e| e.value().clone()).collect()
    }

    pub fn position_count(&self) -> usize {
        self.positions.len()
    }

    pub fn trade_history(&self) -> Vec<TradeRecord> {
        self.trade_history.read().clone()
    }

    pub fn pending_intent_count(&self) -> usize {
        self.intents
            .iter()
            .filter(|e| !e.value().status.is_terminal())
            .count()
    }

    /// Terminal intents are kept for a grace window so late CONFIRM/ABORT
    /// messages can still be classified, then swept.
    pub fn sweep_terminal_intents(&self, grace_ms: i64) {
        let now = self.ctx.time.now_millis();
        let mut swept = Vec::new();
        self.intents.retain(|id, intent| {
            let keep = !intent.status.is_terminal() || now - intent.t_ingress < grace_ms;
            if !keep {
                swept.push(id.clone());
            }
            keep
        });
        for id in swept {
            self.sink.enqueue(WriteOp::DeleteIntent(id));
        }
    }
}
