pub mod api;
pub mod fast;
pub mod rate_limit;
pub mod trigger;

use crate::broker::gateway::BrokerGateway;
use crate::config::Settings;
use crate::context::RuntimeContext;
use crate::error::{ErrorCode, IngressError};
use crate::events::{Event, EventBus};
use crate::execution::limit_chaser::LimitChaser;
use crate::execution::limit_or_kill::LimitOrKill;
use crate::execution::pyramid::PyramidManager;
use crate::execution::{
    ExecutionParams, ExecutionResult, ExecutionStatus, ExecutionStrategy, MarketEntry,
};
use crate::l2_validator::L2Validator;
use crate::market_data::orderbook_cache::OrderBookCache;
use crate::metrics;
use crate::model::{Fill, Signal, SignalKind};
use crate::phase_manager::{ExecutionMode, PhaseManager};
use crate::replay_guard::ReplayGuard;
use crate::security::SignatureValidator;
use crate::shadow_state::ShadowState;
use dashmap::DashMap;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

use self::trigger::{ConfirmOutcome, TriggerEngine};

/// Bounded JSON result every ingress caller receives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngressResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal_id: Option<String>,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<ErrorCode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub broker_order_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fill_price: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fill_size: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duplicate: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<i64>,
}

impl IngressResponse {
    fn accepted(signal_id: &str) -> Self {
        Self {
            success: true,
            signal_id: Some(signal_id.to_string()),
            status: "ACCEPTED".to_string(),
            code: None,
            broker_order_id: None,
            fill_price: None,
            fill_size: None,
            duplicate: None,
            latency_ms: None,
        }
    }

    fn rejected(signal_id: Option<&str>, code: ErrorCode, _detail: &str) -> Self {
        Self {
            success: false,
            signal_id: signal_id.map(|s| s.to_string()),
            status: "REJECTED".to_string(),
            code: Some(code),
            broker_order_id: None,
            fill_price: None,
            fill_size: None,
            duplicate: None,
            latency_ms: None,
        }
    }

    fn duplicate(signal_id: &str) -> Self {
        Self {
            success: true,
            signal_id: Some(signal_id.to_string()),
            status: "DUPLICATE".to_string(),
            code: None,
            broker_order_id: None,
            fill_price: None,
            fill_size: None,
            duplicate: Some(true),
            latency_ms: None,
        }
    }

    fn status_only(signal_id: &str, status: &str) -> Self {
        Self {
            success: true,
            signal_id: Some(signal_id.to_string()),
            status: status.to_string(),
            code: None,
            broker_order_id: None,
            fill_price: None,
            fill_size: None,
            duplicate: None,
            latency_ms: None,
        }
    }
}

/// Routes authenticated intents into the execution core: PREPARE spawns the
/// pipeline and acks immediately, CONFIRM resolves armed triggers, ABORT
/// cancels cooperatively.
pub struct IngressDispatcher {
    pub security: SignatureValidator,
    pub replay_guard: Arc<ReplayGuard>,
    pub phase_manager: Arc<PhaseManager>,
    pub shadow: Arc<ShadowState>,
    pub gateway: Arc<BrokerGateway>,
    pub cache: Arc<OrderBookCache>,
    pub validator: L2Validator,
    pub pyramid: Arc<PyramidManager>,
    pub trigger_engine: Arc<TriggerEngine>,
    pub events: EventBus,
    pub ctx: RuntimeContext,
    settings: Settings,
    /// signal_id -> cooperative abort flag for the running strategy.
    running: DashMap<String, Arc<AtomicBool>>,
    /// signal_id -> terminal execution outcome, for late CONFIRM/queries.
    outcomes: DashMap<String, ExecutionResult>,
    /// symbol -> regime_state from the most recent authenticated signal;
    /// drives the pyramid manager between signals.
    regimes: DashMap<String, i32>,
}

impl IngressDispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        security: SignatureValidator,
        replay_guard: Arc<ReplayGuard>,
        phase_manager: Arc<PhaseManager>,
        shadow: Arc<ShadowState>,
        gateway: Arc<BrokerGateway>,
        cache: Arc<OrderBookCache>,
        pyramid: Arc<PyramidManager>,
        trigger_engine: Arc<TriggerEngine>,
        events: EventBus,
        ctx: RuntimeContext,
        settings: Settings,
    ) -> Arc<Self> {
        let validator = L2Validator::new(cache.clone(), settings.validation.clone());
        Arc::new(Self {
            security,
            replay_guard,
            phase_manager,
            shadow,
            gateway,
            cache,
            validator,
            pyramid,
            trigger_engine,
            events,
            ctx,
            settings,
            running: DashMap::new(),
            outcomes: DashMap::new(),
            regimes: DashMap::new(),
        })
    }

    /// HTTP path: authenticate the exact body bytes, then dispatch.
    pub async fn handle_signed(
        self: &Arc<Self>,
        body: &[u8],
        signature: &str,
        source: Option<&str>,
    ) -> Result<IngressResponse, IngressError> {
        let signal: Signal = serde_json::from_slice(body)
            .map_err(|e| IngressError::Malformed(e.to_string()))?;

        self.security.verify(
            body,
            signature,
            source,
            signal.timestamp,
            self.ctx.time.now_millis(),
        )?;

        Ok(self.dispatch(signal).await)
    }

    /// Post-authentication dispatch by message kind.
    pub async fn dispatch(self: &Arc<Self>, signal: Signal) -> IngressResponse {
        match signal.kind {
            SignalKind::Prepare => self.handle_prepare(signal).await,
            SignalKind::Confirm => self.handle_confirm(&signal.signal_id).await,
            SignalKind::Abort => self.handle_abort(&signal.signal_id).await,
        }
    }

    async fn handle_prepare(self: &Arc<Self>, signal: Signal) -> IngressResponse {
        let signal_id = signal.signal_id.clone();
        let now_ms = self.ctx.time.now_millis();

        if self.replay_guard.seen_before(&signal_id, now_ms) {
            metrics::inc_replayed_signals();
            warn!(signal_id = %signal_id, "Replayed signal dropped");
            return IngressResponse::rejected(
                Some(&signal_id),
                ErrorCode::ReplayedSignal,
                "already processed",
            );
        }

        // Phase gate precedes intent creation: a disallowed class leaves no
        // trace beyond the rejection event.
        if !self.phase_manager.validate_signal(signal.signal_type) {
            metrics::inc_rejected_signals();
            self.events.publish(Event::SignalRejected {
                signal_id: signal_id.clone(),
                code: ErrorCode::SignalTypeNotAllowed,
                detail: format!(
                    "{:?} not allowed in phase {}",
                    signal.signal_type,
                    self.phase_manager.current_phase()
                ),
            });
            return IngressResponse::rejected(
                Some(&signal_id),
                ErrorCode::SignalTypeNotAllowed,
                "signal type not allowed",
            );
        }

        self.regimes
            .insert(signal.symbol.clone(), signal.regime.regime_state);
        self.shadow.process_intent(signal.clone());

        // Client-side trigger fast path: arm and wait instead of executing.
        if signal.trigger_price.is_some() && signal.trigger_condition.is_some() {
            self.trigger_engine
                .arm(signal, self.settings.ingress.trigger_timeout_ms);
            return IngressResponse::status_only(&signal_id, "ARMED");
        }

        // Hand off asynchronously; the ack never waits on the strategy.
        let dispatcher = self.clone();
        tokio::spawn(async move {
            dispatcher.run_pipeline(signal).await;
        });

        IngressResponse::accepted(&signal_id)
    }

    async fn handle_confirm(self: &Arc<Self>, signal_id: &str) -> IngressResponse {
        match self.trigger_engine.confirm(signal_id) {
            ConfirmOutcome::AlreadyFired => {
                info!(signal_id = %signal_id, "CONFIRM after local trigger fire, duplicate");
                IngressResponse::duplicate(signal_id)
            }
            ConfirmOutcome::Armed(signal) => {
                let dispatcher = self.clone();
                tokio::spawn(async move {
                    dispatcher.run_pipeline(signal).await;
                });
                IngressResponse::accepted(signal_id)
            }
            ConfirmOutcome::NotArmed => match self.shadow.get_intent(signal_id) {
                Some(intent) if !intent.status.is_terminal() => {
                    IngressResponse::status_only(signal_id, "IN_PROGRESS")
                }
                Some(intent) => {
                    let mut response = IngressResponse::status_only(
                        signal_id,
                        &format!("{:?}", intent.status).to_uppercase(),
                    );
                    if let Some(outcome) = self.outcomes.get(signal_id) {
                        response.broker_order_id = outcome.broker_order_id.clone();
                        response.fill_price = outcome.fill_price;
                        response.fill_size = Some(outcome.fill_size);
                    }
                    response
                }
                None => IngressResponse::rejected(
                    Some(signal_id),
                    ErrorCode::MissedEntry,
                    "no pending intent",
                ),
            },
        }
    }

    async fn handle_abort(self: &Arc<Self>, signal_id: &str) -> IngressResponse {
        use crate::model::IntentStatus::*;

        let Some(intent) = self.shadow.get_intent(signal_id) else {
            return IngressResponse::rejected(
                Some(signal_id),
                ErrorCode::MissedEntry,
                "no intent to abort",
            );
        };

        match intent.status {
            Filled => {
                // Position stays; closing requires the explicit close path.
                warn!(
                    signal_id = %signal_id,
                    symbol = %intent.symbol,
                    "late-abort-after-execution"
                );
                self.events.publish(Event::LateAbortAfterExecution {
                    signal_id: signal_id.to_string(),
                    symbol: intent.symbol.clone(),
                });
                IngressResponse::status_only(signal_id, "LATE_ABORT_AFTER_EXECUTION")
            }
            Executing => {
                // Cooperative: honored at the strategy's next poll boundary.
                if let Some(flag) = self.running.get(signal_id) {
                    flag.store(true, Ordering::SeqCst);
                }
                IngressResponse::status_only(signal_id, "ABORTING")
            }
            Pending | Validated => {
                self.trigger_engine.disarm(signal_id);
                self.shadow
                    .cancel_intent(signal_id, "aborted by source".to_string());
                IngressResponse::status_only(signal_id, "CANCELED")
            }
            Rejected | Canceled => IngressResponse::status_only(signal_id, "ALREADY_TERMINAL"),
        }
    }

    /// The per-symbol execution pipeline: validate, size, execute, settle.
    pub async fn run_pipeline(self: &Arc<Self>, signal: Signal) {
        let signal_id = signal.signal_id.clone();
        let symbol = signal.symbol.clone();
        let t_start = std::time::Instant::now();

        // Serialize the whole pipeline per symbol.
        let lock = self.shadow.symbol_lock(&symbol);
        let _guard = lock.lock().await;

        let verdict = self.validator.validate(
            &symbol,
            signal.side(),
            signal.size,
            signal.regime.structure_score,
            signal.regime.momentum_score,
        );
        if !verdict.valid {
            let code = verdict.code.unwrap_or(ErrorCode::NoMarketData);
            self.shadow.reject_intent(&signal_id, code.to_string());
            self.events.publish(Event::SignalRejected {
                signal_id: signal_id.clone(),
                code,
                detail: verdict.detail,
            });
            return;
        }

        if self.shadow.validate_intent(&signal_id).is_none() {
            return;
        }

        // Sizing: the signal's size wins; otherwise the phase contract.
        let size = if signal.size > Decimal::ZERO {
            signal.size
        } else {
            let entry = signal
                .reference_entry()
                .or_else(|| verdict.summary.as_ref().map(|s| s.mid_price()))
                .unwrap_or(Decimal::ZERO);
            self.phase_manager.position_size(entry, signal.stop_loss)
        };
        if size <= Decimal::ZERO {
            self.shadow
                .reject_intent(&signal_id, "sized to zero".to_string());
            return;
        }

        if self.shadow.mark_executing(&signal_id).is_none() {
            return;
        }

        let abort = Arc::new(AtomicBool::new(false));
        self.running.insert(signal_id.clone(), abort.clone());

        let params = ExecutionParams {
            signal_id: signal_id.clone(),
            symbol: symbol.clone(),
            side: signal.side().entry_order_side(),
            size,
            limit_price: signal.reference_entry(),
            stop_loss: signal.stop_loss,
            take_profits: signal.take_profits.clone(),
            signal_type: signal.signal_type,
            urgency_score: signal.urgency_score,
            alpha_half_life_ms: signal.alpha_half_life_ms,
        };

        let strategy = self.select_strategy(&signal);
        info!(
            signal_id = %signal_id,
            symbol = %symbol,
            strategy = strategy.name(),
            size = %size,
            "Executing intent"
        );
        let result = strategy.execute(&params, &abort).await;
        self.running.remove(&signal_id);

        self.settle(&signal, &result).await;
        metrics::observe_order_latency(t_start.elapsed().as_secs_f64());
        self.outcomes.insert(signal_id, result);
    }

    fn select_strategy(&self, signal: &Signal) -> Box<dyn ExecutionStrategy> {
        match self.phase_manager.current().execution_mode {
            ExecutionMode::Maker => {
                // Alpha-decaying intents chase; plain scalps post and kill.
                if signal.alpha_half_life_ms.is_some() {
                    Box::new(LimitChaser::new(
                        self.gateway.clone(),
                        self.cache.clone(),
                        self.events.clone(),
                        &self.settings.execution,
                    ))
                } else {
                    Box::new(LimitOrKill::new(
                        self.gateway.clone(),
                        self.cache.clone(),
                        &self.settings.execution,
                    ))
                }
            }
            ExecutionMode::Taker => Box::new(MarketEntry::new(self.gateway.clone())),
        }
    }

    async fn settle(self: &Arc<Self>, signal: &Signal, result: &ExecutionResult) {
        let signal_id = &signal.signal_id;

        if result.is_filled() {
            let fill = Fill {
                broker_order_id: result
                    .broker_order_id
                    .clone()
                    .unwrap_or_else(|| "unknown".to_string()),
                fill_price: result.fill_price.unwrap_or(Decimal::ZERO),
                fill_size: result.fill_size,
                filled: true,
            };
            let phase = self.phase_manager.current_phase();
            if let Some(position) = self.shadow.confirm_execution(signal_id, &fill, phase) {
                if self.phase_manager.current().allow_pyramiding {
                    self.pyramid.seed(&position);
                }
            }
            return;
        }

        let reason = result
            .reason
            .clone()
            .or_else(|| result.code.map(|c| c.to_string()))
            .unwrap_or_else(|| "execution failed".to_string());
        match result.status {
            ExecutionStatus::MissedEntry | ExecutionStatus::Canceled | ExecutionStatus::Error => {
                self.shadow.cancel_intent(signal_id, reason);
            }
            _ => {}
        }
    }

    pub fn last_outcome(&self, signal_id: &str) -> Option<ExecutionResult> {
        self.outcomes.get(signal_id).map(|r| r.clone())
    }

    pub fn latest_regime(&self, symbol: &str) -> i32 {
        self.regimes.get(symbol).map(|r| *r).unwrap_or(0)
    }

    /// Health summary for the control surface.
    pub fn health(&self) -> serde_json::Value {
        serde_json::json!({
            "status": "ok",
            "phase": self.phase_manager.current_phase(),
            "equity": self.phase_manager.equity(),
            "books_initialized": self.cache.initialized_count(),
            "replay_records": self.replay_guard.len(),
            "open_positions": self.shadow.position_count(),
            "pending_intents": self.shadow.pending_intent_count(),
            "armed_triggers": self.trigger_engine.armed_count(),
            "broker": self.gateway.adapter_name(),
        })
    }
}
