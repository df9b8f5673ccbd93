use crate::broker::gateway::BrokerGateway;
use crate::events::{Event, EventBus};
use crate::metrics;
use crate::model::SignalType;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    Maker,
    Taker,
}

/// Static risk parameters for one equity bucket.
#[derive(Debug, Clone)]
pub struct PhaseConfig {
    pub phase: u8,
    pub label: &'static str,
    pub risk_pct: Decimal,
    pub max_leverage: Decimal,
    pub allowed_signal_types: &'static [SignalType],
    pub execution_mode: ExecutionMode,
    pub allow_pyramiding: bool,
    pub max_pyramid_layers: u32,
}

impl PhaseConfig {
    pub fn for_phase(phase: u8) -> PhaseConfig {
        match phase {
            1 => PhaseConfig {
                phase: 1,
                label: "KICKSTARTER",
                risk_pct: dec!(0.10),
                max_leverage: dec!(30),
                allowed_signal_types: &[SignalType::Scalp],
                execution_mode: ExecutionMode::Maker,
                allow_pyramiding: false,
                max_pyramid_layers: 0,
            },
            2 => PhaseConfig {
                phase: 2,
                label: "TREND RIDER",
                risk_pct: dec!(0.05),
                max_leverage: dec!(15),
                allowed_signal_types: &[SignalType::Day, SignalType::Swing],
                execution_mode: ExecutionMode::Taker,
                allow_pyramiding: true,
                max_pyramid_layers: 4,
            },
            // Phase 3 runs TAKER swing with pyramiding disabled until
            // explicit rules exist; entry raises an operational alert.
            _ => PhaseConfig {
                phase: 3,
                label: "TARGET_REACHED",
                risk_pct: dec!(0.02),
                max_leverage: dec!(5),
                allowed_signal_types: &[SignalType::Swing],
                execution_mode: ExecutionMode::Taker,
                allow_pyramiding: false,
                max_pyramid_layers: 0,
            },
        }
    }

    /// Boundary rule: equity >= 1000 is Phase 2, >= 5000 is Phase 3.
    pub fn phase_for_equity(equity: Decimal) -> u8 {
        if equity >= dec!(5000) {
            3
        } else if equity >= dec!(1000) {
            2
        } else {
            1
        }
    }
}

struct PhaseSnapshot {
    config: PhaseConfig,
    equity: Decimal,
}

/// Equity-driven state machine selecting risk parameters, allowed signal
/// classes and execution mode. Forward transitions are the expected path; a
/// backward crossing is legal but raises a critical regression event.
pub struct PhaseManager {
    state: RwLock<PhaseSnapshot>,
    events: EventBus,
    phase3_alerted: AtomicBool,
}

impl PhaseManager {
    pub fn new(initial_equity: Decimal, events: EventBus) -> Arc<Self> {
        let phase = PhaseConfig::phase_for_equity(initial_equity);
        metrics::set_current_phase(phase);
        info!(phase, equity = %initial_equity, "Phase manager initialized");
        Arc::new(Self {
            state: RwLock::new(PhaseSnapshot {
                config: PhaseConfig::for_phase(phase),
                equity: initial_equity,
            }),
            events,
            phase3_alerted: AtomicBool::new(false),
        })
    }

    pub fn current(&self) -> PhaseConfig {
        self.state.read().config.clone()
    }

    pub fn current_phase(&self) -> u8 {
        self.state.read().config.phase
    }

    pub fn equity(&self) -> Decimal {
        self.state.read().equity
    }

    pub fn validate_signal(&self, signal_type: SignalType) -> bool {
        self.state
            .read()
            .config
            .allowed_signal_types
            .contains(&signal_type)
    }

    /// Apply a fresh equity reading; emits transition/regression events on a
    /// boundary crossing.
    pub fn refresh(&self, equity: Decimal) {
        let next_phase = PhaseConfig::phase_for_equity(equity);
        let mut state = self.state.write();
        let prev_phase = state.config.phase;
        state.equity = equity;

        if next_phase == prev_phase {
            return;
        }

        state.config = PhaseConfig::for_phase(next_phase);
        drop(state);
        metrics::set_current_phase(next_phase);

        info!(
            from = prev_phase,
            to = next_phase,
            equity = %equity,
            "Phase transition"
        );
        self.events.publish(Event::PhaseTransition {
            from: prev_phase,
            to: next_phase,
            equity,
        });

        if next_phase < prev_phase {
            warn!(
                from = prev_phase,
                to = next_phase,
                equity = %equity,
                "Equity fell across a phase boundary"
            );
            self.events.publish(Event::PhaseRegression {
                from: prev_phase,
                to: next_phase,
                equity,
            });
        }

        if next_phase == 3 && !self.phase3_alerted.swap(true, Ordering::SeqCst) {
            self.events.publish(Event::PhaseAlert {
                phase: 3,
                message: "TARGET_REACHED entered; running swing-only taker rules".to_string(),
            });
        }
    }

    /// Sizing contract: size = equity * risk_pct / |entry - stop|, with the
    /// notional capped at equity * max_leverage.
    pub fn position_size(&self, entry: Decimal, stop_loss: Decimal) -> Decimal {
        let state = self.state.read();
        let distance = (entry - stop_loss).abs();
        if distance.is_zero() || entry.is_zero() {
            return Decimal::ZERO;
        }

        let risk_size = state.equity * state.config.risk_pct / distance;
        let max_notional = state.equity * state.config.max_leverage;
        let max_size = max_notional / entry;
        risk_size.min(max_size)
    }

    /// Poll broker equity on a timer.
    pub fn start_polling(
        self: &Arc<Self>,
        gateway: Arc<BrokerGateway>,
        interval: Duration,
    ) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                match gateway.get_account().await {
                    Ok(account) => manager.refresh(account.equity),
                    Err(e) => warn!("Equity poll failed: {}", e),
                }
            }
        })
    }
}
