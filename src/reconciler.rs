use crate::broker::gateway::BrokerGateway;
use crate::events::{Event, EventBus};
use crate::metrics;
use crate::model::BrokerPosition;
use crate::shadow_state::ShadowState;
use dashmap::DashMap;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

const INTENT_SWEEP_GRACE_MS: i64 = 60_000;

/// Periodic broker diff against the shadow ledger.
///
/// A locally-held position missing at the broker is flagged as a phantom and
/// removed only after it stays missing for a full confirmation cycle, so a
/// position opened between the pull and the diff is never dropped.
pub struct Reconciler {
    gateway: Arc<BrokerGateway>,
    shadow: Arc<ShadowState>,
    events: EventBus,
    interval: Duration,
    /// symbol -> consecutive cycles observed missing at the broker.
    missing_cycles: DashMap<String, u32>,
}

impl Reconciler {
    pub fn new(
        gateway: Arc<BrokerGateway>,
        shadow: Arc<ShadowState>,
        events: EventBus,
        interval: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            gateway,
            shadow,
            events,
            interval,
            missing_cycles: DashMap::new(),
        })
    }

    pub async fn run_cycle(&self) {
        let broker_positions = match self.gateway.get_positions().await {
            Ok(p) => p,
            Err(e) => {
                warn!("Reconciliation pull failed: {}", e);
                return;
            }
        };

        self.diff(&broker_positions).await;
        self.shadow.sweep_terminal_intents(INTENT_SWEEP_GRACE_MS);
    }

    async fn diff(&self, broker_positions: &[BrokerPosition]) {
        // Broker side: divergence and unknown-position detection.
        for broker_pos in broker_positions {
            match self.shadow.get_position(&broker_pos.symbol) {
                Some(local) => {
                    if local.side != broker_pos.side || local.size != broker_pos.size {
                        metrics::inc_reconciliation_divergence();
                        warn!(
                            symbol = %broker_pos.symbol,
                            local_size = %local.size,
                            broker_size = %broker_pos.size,
                            "Position divergence"
                        );
                        self.events.publish(Event::ReconciliationDivergence {
                            symbol: broker_pos.symbol.clone(),
                            local_size: local.size,
                            broker_size: broker_pos.size,
                        });
                    } else {
                        self.shadow.mark_reconciled(&broker_pos.symbol);
                    }

                    // Correct a divergent stop where the venue supports it.
                    if let Some(broker_stop) = broker_pos.stop_loss {
                        if broker_stop != local.current_stop && !local.current_stop.is_zero() {
                            match self
                                .gateway
                                .update_stop_loss(&broker_pos.symbol, local.current_stop)
                                .await
                            {
                                Ok(()) => info!(
                                    symbol = %broker_pos.symbol,
                                    stop = %local.current_stop,
                                    "Divergent stop corrected at broker"
                                ),
                                Err(e) => warn!(
                                    symbol = %broker_pos.symbol,
                                    "Stop correction failed: {}",
                                    e
                                ),
                            }
                        }
                    }

                    self.missing_cycles.remove(&broker_pos.symbol);
                }
                None => {
                    // Never auto-adopt; operator attention only.
                    self.events.publish(Event::UnknownBrokerPosition {
                        symbol: broker_pos.symbol.clone(),
                        size: broker_pos.size,
                    });
                }
            }
        }

        // Local side: positions the broker no longer has.
        for local in self.shadow.all_positions() {
            let at_broker = broker_positions
                .iter()
                .any(|p| p.symbol == local.symbol && p.size > Decimal::ZERO);
            if at_broker {
                continue;
            }

            let cycles = {
                let mut entry = self.missing_cycles.entry(local.symbol.clone()).or_insert(0);
                *entry += 1;
                *entry
            };

            self.events.publish(Event::PhantomLocalPosition {
                symbol: local.symbol.clone(),
            });

            if cycles >= 2 {
                warn!(
                    symbol = %local.symbol,
                    cycles,
                    "Phantom local position removed (closed at broker)"
                );
                self.shadow.remove_position_unrecorded(&local.symbol);
                self.missing_cycles.remove(&local.symbol);
            }
        }
    }

    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let reconciler = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(reconciler.interval);
            // First tick fires immediately; skip it so startup hydration and
            // broker connectivity settle first.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                reconciler.run_cycle().await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::mock::MockAdapter;
    use crate::config::BrokerConfig;
    use crate::context::RuntimeContext;
    use crate::model::{Fill, Side, Signal, SignalKind, SignalType};
    use crate::persistence::sink::PersistenceSink;
    use crate::persistence::store::PersistenceStore;
    use rust_decimal_macros::dec;

    fn test_shadow(events: EventBus) -> Arc<ShadowState> {
        let path = format!("/tmp/vega_reconciler_test_{}.redb", uuid::Uuid::new_v4());
        let store = Arc::new(PersistenceStore::open(path).unwrap());
        let sink = PersistenceSink::new(store.clone(), 1024, events.clone());
        ShadowState::new(&store, sink, events, RuntimeContext::new_simulated(1_000))
    }

    fn open_local_position(shadow: &ShadowState, symbol: &str) {
        let signal = Signal {
            signal_id: format!("sig-{}", symbol),
            kind: SignalKind::Prepare,
            source: None,
            symbol: symbol.to_string(),
            direction: 1,
            entry_zone: vec![dec!(50000)],
            stop_loss: dec!(49500),
            take_profits: vec![],
            size: dec!(0.1),
            signal_type: SignalType::Scalp,
            urgency_score: 50,
            alpha_half_life_ms: None,
            timestamp: 900,
            bar_index: 1,
            bar_close_time: None,
            trigger_price: None,
            trigger_condition: None,
            regime: Default::default(),
        };
        let id = signal.signal_id.clone();
        shadow.process_intent(signal);
        shadow.validate_intent(&id);
        shadow.mark_executing(&id);
        shadow.confirm_execution(
            &id,
            &Fill {
                broker_order_id: "bo-1".into(),
                fill_price: dec!(50000),
                fill_size: dec!(0.1),
                filled: true,
            },
            1,
        );
    }

    #[tokio::test]
    async fn test_phantom_removed_after_confirmation_cycle() {
        let events = EventBus::new();
        let shadow = test_shadow(events.clone());
        open_local_position(&shadow, "BTCUSDT");

        let adapter = Arc::new(MockAdapter::new()); // broker holds nothing
        let gateway = BrokerGateway::new(adapter, &BrokerConfig::default());
        let reconciler = Reconciler::new(gateway, shadow.clone(), events.clone(), Duration::from_secs(5));
        let mut rx = events.subscribe();

        // First cycle flags but keeps the position.
        reconciler.run_cycle().await;
        assert!(shadow.has_position("BTCUSDT"));

        // Second cycle removes it.
        reconciler.run_cycle().await;
        assert!(!shadow.has_position("BTCUSDT"));

        let mut phantom_events = 0;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, Event::PhantomLocalPosition { .. }) {
                phantom_events += 1;
            }
        }
        assert_eq!(phantom_events, 2);
    }

    #[tokio::test]
    async fn test_unknown_broker_position_not_adopted() {
        let events = EventBus::new();
        let shadow = test_shadow(events.clone());

        let adapter = Arc::new(MockAdapter::new());
        adapter.set_broker_positions(vec![BrokerPosition {
            symbol: "DOGEUSDT".into(),
            side: Side::Long,
            size: dec!(1000),
            entry_price: dec!(0.1),
            stop_loss: None,
            unrealized_pnl: Decimal::ZERO,
        }]);
        let gateway = BrokerGateway::new(adapter, &BrokerConfig::default());
        let reconciler = Reconciler::new(gateway, shadow.clone(), events.clone(), Duration::from_secs(5));
        let mut rx = events.subscribe();

        reconciler.run_cycle().await;

        assert!(!shadow.has_position("DOGEUSDT"));
        let mut saw_unknown = false;
        while let Ok(event) = rx.try_recv() {
            if let Event::UnknownBrokerPosition { symbol, .. } = event {
                assert_eq!(symbol, "DOGEUSDT");
                saw_unknown = true;
            }
        }
        assert!(saw_unknown);
    }

    #[tokio::test]
    async fn test_matching_position_marked_reconciled() {
        let events = EventBus::new();
        let shadow = test_shadow(events.clone());
        open_local_position(&shadow, "BTCUSDT");

        let adapter = Arc::new(MockAdapter::new());
        adapter.set_broker_positions(vec![BrokerPosition {
            symbol: "BTCUSDT".into(),
            side: Side::Long,
            size: dec!(0.1),
            entry_price: dec!(50000),
            stop_loss: None,
            unrealized_pnl: Decimal::ZERO,
        }]);
        let gateway = BrokerGateway::new(adapter, &BrokerConfig::default());
        let reconciler = Reconciler::new(gateway, shadow.clone(), events, Duration::from_secs(5));

        reconciler.run_cycle().await;

        let position = shadow.get_position("BTCUSDT").unwrap();
        assert!(position.reconciled_at.is_some());
    }

    #[tokio::test]
    async fn test_size_divergence_emits_event() {
        let events = EventBus::new();
        let shadow = test_shadow(events.clone());
        open_local_position(&shadow, "BTCUSDT");

        let adapter = Arc::new(MockAdapter::new());
        adapter.set_broker_positions(vec![BrokerPosition {
            symbol: "BTCUSDT".into(),
            side: Side::Long,
            size: dec!(0.25), // local has 0.1
            entry_price: dec!(50000),
            stop_loss: None,
            unrealized_pnl: Decimal::ZERO,
        }]);
        let gateway = BrokerGateway::new(adapter, &BrokerConfig::default());
        let reconciler = Reconciler::new(gateway, shadow, events.clone(), Duration::from_secs(5));
        let mut rx = events.subscribe();

        reconciler.run_cycle().await;

        let mut saw_divergence = false;
        while let Ok(event) = rx.try_recv() {
            if let Event::ReconciliationDivergence {
                local_size,
                broker_size,
                ..
            } = event
            {
                assert_eq!(local_size, dec!(0.1));
                assert_eq!(broker_size, dec!(0.25));
                saw_divergence = true;
            }
        }
        assert!(saw_divergence);
    }
}
