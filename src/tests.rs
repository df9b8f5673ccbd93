#[cfg(test)]
mod tests {
    use crate::broker::gateway::BrokerGateway;
    use crate::broker::mock::{MockAdapter, MockKnobs};
    use crate::config::Settings;
    use crate::context::RuntimeContext;
    use crate::error::ErrorCode;
    use crate::events::{Event, EventBus};
    use crate::execution::pyramid::PyramidManager;
    use crate::execution::ExecutionStatus;
    use crate::ingress::trigger::TriggerEngine;
    use crate::ingress::IngressDispatcher;
    use crate::market_data::orderbook_cache::OrderBookCache;
    use crate::market_data::types::{BookLevel, BookSnapshot, PriceTick};
    use crate::model::{
        IntentStatus, RegimeVector, Signal, SignalKind, SignalType, TriggerCondition,
    };
    use crate::persistence::sink::PersistenceSink;
    use crate::persistence::store::PersistenceStore;
    use crate::phase_manager::PhaseManager;
    use crate::replay_guard::ReplayGuard;
    use crate::security::SignatureValidator;
    use crate::shadow_state::ShadowState;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use std::sync::Arc;
    use std::time::Duration;

    struct Core {
        dispatcher: Arc<IngressDispatcher>,
        adapter: Arc<MockAdapter>,
        cache: Arc<OrderBookCache>,
        shadow: Arc<ShadowState>,
        events: EventBus,
        trigger_engine: Arc<TriggerEngine>,
    }

    /// Full core wired against the mock adapter, with fast strategy timing so
    /// scenarios run in milliseconds.
    fn core_with_equity(equity: Decimal) -> Core {
        let mut settings = Settings::default();
        settings.execution.wait_time_ms = 200;
        settings.execution.poll_interval_ms = 20;
        settings.execution.chase_interval_ms = 10;

        let path = format!("/tmp/vega_core_test_{}.redb", uuid::Uuid::new_v4());
        let store = Arc::new(PersistenceStore::open(path).unwrap());
        let events = EventBus::new();
        let sink = PersistenceSink::new(store.clone(), 1024, events.clone());
        let ctx = RuntimeContext::new_system();
        let shadow = ShadowState::new(&store, sink, events.clone(), ctx.clone());

        let adapter = Arc::new(MockAdapter::with_equity(equity));
        let gateway = BrokerGateway::new(adapter.clone(), &settings.broker);

        let cache = OrderBookCache::new(5, Duration::from_secs(10));
        cache.apply_snapshot(BookSnapshot {
            symbol: "BTCUSDT".into(),
            update_id: 1,
            bids: vec![BookLevel {
                price: dec!(50000),
                quantity: dec!(5),
            }],
            asks: vec![BookLevel {
                price: dec!(50010),
                quantity: dec!(5),
            }],
        });

        let phase_manager = PhaseManager::new(equity, events.clone());
        let pyramid = PyramidManager::new(
            gateway.clone(),
            shadow.clone(),
            events.clone(),
            &settings.execution,
        );
        let trigger_engine = TriggerEngine::new(shadow.clone(), events.clone());
        let replay_guard = ReplayGuard::new(settings.replay.ttl_ms, None);
        let security = SignatureValidator::new(
            "test-secret".to_string(),
            vec!["strategy-engine".to_string()],
            5_000,
        );

        let dispatcher = IngressDispatcher::new(
            security,
            replay_guard,
            phase_manager,
            shadow.clone(),
            gateway,
            cache.clone(),
            pyramid,
            trigger_engine.clone(),
            events.clone(),
            ctx,
            settings,
        );

        Core {
            dispatcher,
            adapter,
            cache,
            shadow,
            events,
            trigger_engine,
        }
    }

    fn scalp_signal(id: &str) -> Signal {
        Signal {
            signal_id: id.to_string(),
            kind: SignalKind::Prepare,
            source: Some("strategy-engine".to_string()),
            symbol: "BTCUSDT".into(),
            direction: 1,
            entry_zone: vec![dec!(50100)],
            stop_loss: dec!(49500),
            take_profits: vec![dec!(50900)],
            size: dec!(0.1),
            signal_type: SignalType::Scalp,
            urgency_score: 80,
            alpha_half_life_ms: None,
            timestamp: chrono::Utc::now().timestamp_millis(),
            bar_index: 12,
            bar_close_time: None,
            trigger_price: None,
            trigger_condition: None,
            regime: RegimeVector {
                trend: 1,
                vol: 0,
                regime_state: 1,
                structure_score: dec!(72),
                momentum_score: dec!(60),
                model_recommendation: None,
            },
        }
    }

    async fn wait_for_terminal(core: &Core, signal_id: &str) {
        for _ in 0..100 {
            if let Some(status) = core.shadow.intent_status(signal_id) {
                if status.is_terminal() {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("intent {} never reached a terminal state", signal_id);
    }

    /// S1: Phase 1 Limit-or-Kill full fill at the resting bid.
    #[tokio::test(flavor = "multi_thread")]
    async fn scenario_phase1_limit_or_kill_full_fill() {
        let core = core_with_equity(dec!(800));
        core.adapter.set_knobs(MockKnobs {
            fill_delay_ms: 40,
            simulate_fill: true,
            partial_fill_ratio: dec!(1),
        });

        let response = core.dispatcher.dispatch(scalp_signal("s1")).await;
        assert!(response.success);
        assert_eq!(response.status, "ACCEPTED");

        wait_for_terminal(&core, "s1").await;
        assert_eq!(core.shadow.intent_status("s1"), Some(IntentStatus::Filled));

        let position = core.shadow.get_position("BTCUSDT").expect("position");
        assert_eq!(position.avg_entry_price, dec!(50000));
        assert_eq!(position.size, dec!(0.1));

        let outcome = core.dispatcher.last_outcome("s1").unwrap();
        assert_eq!(outcome.status, ExecutionStatus::Filled);
        assert_eq!(outcome.fill_price, Some(dec!(50000)));
        // No further order attempts after the fill.
        assert_eq!(
            core.adapter
                .send_count
                .load(std::sync::atomic::Ordering::SeqCst),
            1
        );
    }

    /// S2: Limit-or-Kill timeout when the broker never fills.
    #[tokio::test(flavor = "multi_thread")]
    async fn scenario_phase1_limit_or_kill_timeout() {
        let core = core_with_equity(dec!(800));
        core.adapter.set_knobs(MockKnobs {
            fill_delay_ms: 0,
            simulate_fill: false,
            partial_fill_ratio: dec!(1),
        });

        core.dispatcher.dispatch(scalp_signal("s2")).await;
        wait_for_terminal(&core, "s2").await;

        assert_eq!(core.shadow.intent_status("s2"), Some(IntentStatus::Canceled));
        assert!(!core.shadow.has_position("BTCUSDT"));

        let outcome = core.dispatcher.last_outcome("s2").unwrap();
        assert_eq!(outcome.status, ExecutionStatus::MissedEntry);
        assert_eq!(outcome.reason.as_deref(), Some("Price ran away"));
        let diag = outcome.diagnostic.expect("missed-entry diagnostic");
        assert_eq!(diag.bid_at_entry, dec!(50000));
    }

    /// S5: signal class not allowed in Phase 1: no intent, rejection event.
    #[tokio::test(flavor = "multi_thread")]
    async fn scenario_signal_type_rejected_in_phase1() {
        let core = core_with_equity(dec!(800));
        let mut rx = core.events.subscribe();

        let mut signal = scalp_signal("s5");
        signal.signal_type = SignalType::Day;

        let response = core.dispatcher.dispatch(signal).await;
        assert!(!response.success);
        assert_eq!(response.code, Some(ErrorCode::SignalTypeNotAllowed));

        // No intent was created.
        assert!(core.shadow.get_intent("s5").is_none());

        let mut saw_rejection = false;
        while let Ok(event) = rx.try_recv() {
            if let Event::SignalRejected { signal_id, code, .. } = event {
                assert_eq!(signal_id, "s5");
                assert_eq!(code, ErrorCode::SignalTypeNotAllowed);
                saw_rejection = true;
            }
        }
        assert!(saw_rejection);
    }

    /// Duplicate PREPARE with the same signal_id is a no-op after the first.
    #[tokio::test(flavor = "multi_thread")]
    async fn scenario_duplicate_prepare_is_replay() {
        let core = core_with_equity(dec!(800));
        core.adapter.set_knobs(MockKnobs {
            fill_delay_ms: 10,
            simulate_fill: true,
            partial_fill_ratio: dec!(1),
        });

        let first = core.dispatcher.dispatch(scalp_signal("dup-1")).await;
        assert!(first.success);

        let second = core.dispatcher.dispatch(scalp_signal("dup-1")).await;
        assert!(!second.success);
        assert_eq!(second.code, Some(ErrorCode::ReplayedSignal));

        wait_for_terminal(&core, "dup-1").await;
        // Exactly one order went out.
        assert_eq!(
            core.adapter
                .send_count
                .load(std::sync::atomic::Ordering::SeqCst),
            1
        );
    }

    /// CONFIRM after a client-side trigger fire reports duplicate and places
    /// no order.
    #[tokio::test(flavor = "multi_thread")]
    async fn scenario_confirm_after_trigger_is_duplicate() {
        let core = core_with_equity(dec!(800));
        core.adapter.set_knobs(MockKnobs {
            fill_delay_ms: 10,
            simulate_fill: true,
            partial_fill_ratio: dec!(1),
        });

        let mut signal = scalp_signal("trig-1");
        signal.trigger_price = Some(dec!(50005));
        signal.trigger_condition = Some(TriggerCondition::Above);
        signal.bar_close_time = Some(chrono::Utc::now().timestamp_millis() + 60_000);

        let response = core.dispatcher.dispatch(signal).await;
        assert_eq!(response.status, "ARMED");

        // Price crosses the trigger locally.
        let fired = core.trigger_engine.evaluate_tick(&PriceTick {
            symbol: "BTCUSDT".into(),
            price: dec!(50006),
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
        });
        assert_eq!(fired.len(), 1);
        core.dispatcher.run_pipeline(fired.into_iter().next().unwrap()).await;
        assert!(core.shadow.has_position("BTCUSDT"));
        let sends_after_fire = core
            .adapter
            .send_count
            .load(std::sync::atomic::Ordering::SeqCst);

        // The redundant CONFIRM arrives afterwards.
        let mut confirm = scalp_signal("trig-1");
        confirm.kind = SignalKind::Confirm;
        let response = core.dispatcher.dispatch(confirm).await;
        assert_eq!(response.duplicate, Some(true));
        assert_eq!(response.status, "DUPLICATE");
        assert_eq!(
            core.adapter
                .send_count
                .load(std::sync::atomic::Ordering::SeqCst),
            sends_after_fire
        );
    }

    /// ABORT after FILLED keeps the position and records the warning event.
    #[tokio::test(flavor = "multi_thread")]
    async fn scenario_abort_after_fill_is_late_abort() {
        let core = core_with_equity(dec!(800));
        core.adapter.set_knobs(MockKnobs {
            fill_delay_ms: 10,
            simulate_fill: true,
            partial_fill_ratio: dec!(1),
        });

        core.dispatcher.dispatch(scalp_signal("abort-1")).await;
        wait_for_terminal(&core, "abort-1").await;
        assert!(core.shadow.has_position("BTCUSDT"));

        let mut rx = core.events.subscribe();
        let mut abort = scalp_signal("abort-1");
        abort.kind = SignalKind::Abort;
        let response = core.dispatcher.dispatch(abort).await;

        assert_eq!(response.status, "LATE_ABORT_AFTER_EXECUTION");
        // Position intact.
        assert!(core.shadow.has_position("BTCUSDT"));

        let mut saw_warning = false;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, Event::LateAbortAfterExecution { .. }) {
                saw_warning = true;
            }
        }
        assert!(saw_warning);
    }

    /// ABORT of an armed trigger cancels before any order exists.
    #[tokio::test(flavor = "multi_thread")]
    async fn scenario_abort_armed_trigger() {
        let core = core_with_equity(dec!(800));

        let mut signal = scalp_signal("abort-2");
        signal.trigger_price = Some(dec!(50500));
        signal.trigger_condition = Some(TriggerCondition::Above);
        core.dispatcher.dispatch(signal).await;

        let mut abort = scalp_signal("abort-2");
        abort.kind = SignalKind::Abort;
        let response = core.dispatcher.dispatch(abort).await;

        assert_eq!(response.status, "CANCELED");
        assert_eq!(
            core.shadow.intent_status("abort-2"),
            Some(IntentStatus::Canceled)
        );
        assert_eq!(core.trigger_engine.armed_count(), 0);
        assert_eq!(
            core.adapter
                .send_count
                .load(std::sync::atomic::Ordering::SeqCst),
            0
        );
    }

    /// L2 veto rejects before any broker interaction.
    #[tokio::test(flavor = "multi_thread")]
    async fn scenario_weak_structure_rejected() {
        let core = core_with_equity(dec!(800));

        let mut signal = scalp_signal("weak-1");
        signal.regime.structure_score = dec!(40);
        core.dispatcher.dispatch(signal).await;
        wait_for_terminal(&core, "weak-1").await;

        let intent = core.shadow.get_intent("weak-1").unwrap();
        assert_eq!(intent.status, IntentStatus::Rejected);
        assert_eq!(intent.rejection_reason.as_deref(), Some("WEAK_STRUCTURE"));
        assert_eq!(
            core.adapter
                .send_count
                .load(std::sync::atomic::Ordering::SeqCst),
            0
        );
    }

    /// Signed HTTP path end-to-end: a valid MAC is accepted, a tampered body
    /// is not.
    #[tokio::test(flavor = "multi_thread")]
    async fn scenario_signed_ingress_roundtrip() {
        let core = core_with_equity(dec!(800));
        core.adapter.set_knobs(MockKnobs {
            fill_delay_ms: 10,
            simulate_fill: true,
            partial_fill_ratio: dec!(1),
        });

        let signal = scalp_signal("signed-1");
        let body = serde_json::to_vec(&signal).unwrap();
        let signature = core.dispatcher.security.sign(&body);

        let response = core
            .dispatcher
            .handle_signed(&body, &signature, Some("strategy-engine"))
            .await
            .expect("valid signature accepted");
        assert!(response.success);

        // Tampered body fails with a signature error, untouched by dispatch.
        let mut tampered = body.clone();
        let idx = tampered.len() - 2;
        tampered[idx] ^= 1;
        let result = core
            .dispatcher
            .handle_signed(&tampered, &signature, Some("strategy-engine"))
            .await;
        assert!(result.is_err());
    }

    /// Stale book: the pipeline rejects with NO_MARKET_DATA instead of
    /// trading blind.
    #[tokio::test(flavor = "multi_thread")]
    async fn scenario_gap_invalidates_until_resync() {
        let core = core_with_equity(dec!(800));
        core.cache.invalidate("BTCUSDT");

        core.dispatcher.dispatch(scalp_signal("gap-1")).await;
        wait_for_terminal(&core, "gap-1").await;

        let intent = core.shadow.get_intent("gap-1").unwrap();
        assert_eq!(intent.status, IntentStatus::Rejected);
        assert_eq!(intent.rejection_reason.as_deref(), Some("NO_MARKET_DATA"));
    }
}
