use crate::events::{Event, EventBus};
use crate::market_data::types::PriceTick;
use crate::model::Signal;
use crate::shadow_state::ShadowState;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

const EXPIRY_SWEEP_INTERVAL_MS: u64 = 250;
const FIRED_RETENTION_MS: i64 = 300_000;

/// Outcome of a CONFIRM against the trigger store.
pub enum ConfirmOutcome {
    /// The local trigger already executed this signal; CONFIRM is a duplicate.
    AlreadyFired,
    /// Still armed: the caller takes over and executes now.
    Armed(Signal),
    /// Not a trigger-armed signal.
    NotArmed,
}

struct ArmedTrigger {
    signal: Signal,
    auto_abort_at: i64,
}

/// Client-side trigger fast path: armed PREPARE intents wait on the local
/// trade stream and fire the moment the stored condition is met, beating the
/// round trip to the strategy source. A fired id is remembered so the
/// follow-up CONFIRM is recognized as a duplicate and places nothing.
pub struct TriggerEngine {
    pending: DashMap<String, ArmedTrigger>,
    fired: DashMap<String, i64>,
    shadow: Arc<ShadowState>,
    events: EventBus,
}

impl TriggerEngine {
    pub fn new(shadow: Arc<ShadowState>, events: EventBus) -> Arc<Self> {
        Arc::new(Self {
            pending: DashMap::new(),
            fired: DashMap::new(),
            shadow,
            events,
        })
    }

    /// Arm a prepared intent. Auto-abort fires at bar close plus the timeout
    /// window when no trigger and no CONFIRM arrive.
    pub fn arm(&self, signal: Signal, timeout_ms: i64) {
        let bar_close = signal.bar_close_time.unwrap_or(signal.timestamp);
        let auto_abort_at = bar_close + timeout_ms;
        info!(
            signal_id = %signal.signal_id,
            symbol = %signal.symbol,
            trigger_price = ?signal.trigger_price,
            auto_abort_at,
            "Trigger armed"
        );
        self.pending.insert(
            signal.signal_id.clone(),
            ArmedTrigger {
                signal,
                auto_abort_at,
            },
        );
    }

    pub fn disarm(&self, signal_id: &str) -> Option<Signal> {
        self.pending.remove(signal_id).map(|(_, t)| t.signal)
    }

    pub fn armed_count(&self) -> usize {
        self.pending.len()
    }

    pub fn has_fired(&self, signal_id: &str) -> bool {
        self.fired.contains_key(signal_id)
    }

    pub fn confirm(&self, signal_id: &str) -> ConfirmOutcome {
        if self.fired.contains_key(signal_id) {
            return ConfirmOutcome::AlreadyFired;
        }
        match self.disarm(signal_id) {
            Some(signal) => ConfirmOutcome::Armed(signal),
            None => ConfirmOutcome::NotArmed,
        }
    }

    /// Evaluate one trade-stream tick; returns the signals whose condition
    /// fired. Fired ids are marked before the signals are handed back, so a
    /// racing CONFIRM always sees the duplicate.
    pub fn evaluate_tick(&self, tick: &PriceTick) -> Vec<Signal> {
        let mut fired_ids = Vec::new();
        for entry in self.pending.iter() {
            let trigger = entry.value();
            if trigger.signal.symbol != tick.symbol {
                continue;
            }
            let (Some(target), Some(condition)) = (
                trigger.signal.trigger_price,
                trigger.signal.trigger_condition,
            ) else {
                continue;
            };
            if condition.evaluate(tick.price, target) {
                fired_ids.push(entry.key().clone());
            }
        }

        let mut fired_signals = Vec::new();
        for id in fired_ids {
            if let Some((_, trigger)) = self.pending.remove(&id) {
                self.fired.insert(id.clone(), tick.timestamp_ms);
                info!(
                    signal_id = %id,
                    symbol = %tick.symbol,
                    price = %tick.price,
                    "Client-side trigger fired"
                );
                self.events.publish(Event::TriggerFired {
                    signal_id: id,
                    symbol: tick.symbol.clone(),
                    price: tick.price,
                });
                fired_signals.push(trigger.signal);
            }
        }
        fired_signals
    }

    /// Abort armed triggers whose window has passed.
    pub fn expire(&self, now_ms: i64) {
        let mut expired = Vec::new();
        self.pending.retain(|id, trigger| {
            let keep = now_ms < trigger.auto_abort_at;
            if !keep {
                expired.push(id.clone());
            }
            keep
        });

        for id in expired {
            warn!(signal_id = %id, "Armed trigger expired, auto-aborting");
            self.shadow
                .cancel_intent(&id, "trigger window expired".to_string());
            self.events.publish(Event::TriggerExpired { signal_id: id });
        }

        self.fired
            .retain(|_, fired_at| now_ms - *fired_at < FIRED_RETENTION_MS);
    }

    /// Consume the trade stream and run fired intents through the dispatcher.
    pub fn start(
        self: &Arc<Self>,
        mut price_rx: broadcast::Receiver<PriceTick>,
        dispatcher: Arc<super::IngressDispatcher>,
    ) -> JoinHandle<()> {
        let engine = self.clone();
        tokio::spawn(async move {
            let mut sweep = tokio::time::interval(Duration::from_millis(EXPIRY_SWEEP_INTERVAL_MS));
            loop {
                tokio::select! {
                    tick = price_rx.recv() => {
                        match tick {
                            Ok(tick) => {
                                for signal in engine.evaluate_tick(&tick) {
                                    let dispatcher = dispatcher.clone();
                                    tokio::spawn(async move {
                                        dispatcher.run_pipeline(signal).await;
                                    });
                                }
                            }
                            Err(broadcast::error::RecvError::Lagged(n)) => {
                                warn!("Trigger price stream lagged by {} ticks", n);
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        }
                    }
                    _ = sweep.tick() => {
                        engine.expire(dispatcher.ctx.time.now_millis());
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::RuntimeContext;
    use crate::model::{SignalKind, SignalType, TriggerCondition};
    use crate::persistence::sink::PersistenceSink;
    use crate::persistence::store::PersistenceStore;
    use rust_decimal_macros::dec;

    fn test_engine() -> Arc<TriggerEngine> {
        let path = format!("/tmp/vega_trigger_test_{}.redb", uuid::Uuid::new_v4());
        let store = Arc::new(PersistenceStore::open(path).unwrap());
        let events = EventBus::new();
        let sink = PersistenceSink::new(store.clone(), 1024, events.clone());
        let shadow = ShadowState::new(&store, sink, events.clone(), RuntimeContext::new_simulated(1_000));
        TriggerEngine::new(shadow, events)
    }

    fn armed_signal(id: &str, target: rust_decimal::Decimal, condition: TriggerCondition) -> Signal {
        Signal {
            signal_id: id.to_string(),
            kind: SignalKind::Prepare,
            source: None,
            symbol: "BTCUSDT".into(),
            direction: 1,
            entry_zone: vec![target],
            stop_loss: dec!(49000),
            take_profits: vec![],
            size: dec!(0.1),
            signal_type: SignalType::Scalp,
            urgency_score: 50,
            alpha_half_life_ms: None,
            timestamp: 1_000,
            bar_index: 1,
            bar_close_time: Some(2_000),
            trigger_price: Some(target),
            trigger_condition: Some(condition),
            regime: Default::default(),
        }
    }

    fn tick(price: rust_decimal::Decimal, ts: i64) -> PriceTick {
        PriceTick {
            symbol: "BTCUSDT".into(),
            price,
            timestamp_ms: ts,
        }
    }

    #[tokio::test]
    async fn test_trigger_fires_on_condition() {
        let engine = test_engine();
        engine.arm(armed_signal("sig-1", dec!(50100), TriggerCondition::Above), 5_000);

        // Below target: nothing fires.
        assert!(engine.evaluate_tick(&tick(dec!(50100), 1_100)).is_empty());
        assert_eq!(engine.armed_count(), 1);

        // Strictly above: fires once.
        let fired = engine.evaluate_tick(&tick(dec!(50100.5), 1_200));
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].signal_id, "sig-1");
        assert!(engine.has_fired("sig-1"));
        assert_eq!(engine.armed_count(), 0);

        // Re-evaluation does not fire again.
        assert!(engine.evaluate_tick(&tick(dec!(50200), 1_300)).is_empty());
    }

    #[tokio::test]
    async fn test_confirm_after_fire_is_duplicate() {
        let engine = test_engine();
        engine.arm(armed_signal("sig-1", dec!(50100), TriggerCondition::AboveOrEqual), 5_000);
        engine.evaluate_tick(&tick(dec!(50100), 1_100));

        assert!(matches!(engine.confirm("sig-1"), ConfirmOutcome::AlreadyFired));
    }

    #[tokio::test]
    async fn test_confirm_while_armed_hands_back_signal() {
        let engine = test_engine();
        engine.arm(armed_signal("sig-1", dec!(50100), TriggerCondition::Above), 5_000);

        match engine.confirm("sig-1") {
            ConfirmOutcome::Armed(signal) => assert_eq!(signal.signal_id, "sig-1"),
            _ => panic!("expected armed outcome"),
        }
        // Disarmed by the confirm.
        assert_eq!(engine.armed_count(), 0);
        assert!(matches!(engine.confirm("sig-1"), ConfirmOutcome::NotArmed));
    }

    #[tokio::test]
    async fn test_expiry_auto_aborts() {
        let engine = test_engine();
        // bar_close 2000 + timeout 5000 = abort at 7000.
        engine.arm(armed_signal("sig-1", dec!(50100), TriggerCondition::Above), 5_000);

        engine.expire(6_999);
        assert_eq!(engine.armed_count(), 1);

        engine.expire(7_000);
        assert_eq!(engine.armed_count(), 0);
    }
}
