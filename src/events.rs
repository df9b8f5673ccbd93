use crate::error::ErrorCode;
use crate::model::{Position, TradeRecord};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::warn;

/// Typed event sink. Every state change of interest is published here after
/// the change is applied; publication never blocks the publisher.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Event {
    SignalRejected {
        signal_id: String,
        code: ErrorCode,
        detail: String,
    },
    IntentCreated {
        signal_id: String,
        symbol: String,
    },
    IntentResolved {
        signal_id: String,
        status: String,
    },
    PositionOpened(Position),
    PositionUpdated(Position),
    PositionClosed(TradeRecord),
    PhaseTransition {
        from: u8,
        to: u8,
        equity: Decimal,
    },
    PhaseRegression {
        from: u8,
        to: u8,
        equity: Decimal,
    },
    PhaseAlert {
        phase: u8,
        message: String,
    },
    ChaseStart {
        signal_id: String,
        symbol: String,
        initial_price: Decimal,
    },
    ChaseFilled {
        signal_id: String,
        fill_price: Decimal,
        ticks: u32,
    },
    ChaseAlphaExpired {
        signal_id: String,
        remaining_alpha: f64,
    },
    ChaseObiWorsening {
        signal_id: String,
        previous_obi: f64,
        current_obi: f64,
    },
    ChaseTimeout {
        signal_id: String,
        ticks: u32,
        elapsed_ms: u64,
    },
    LateAbortAfterExecution {
        signal_id: String,
        symbol: String,
    },
    TriggerFired {
        signal_id: String,
        symbol: String,
        price: Decimal,
    },
    TriggerExpired {
        signal_id: String,
    },
    PyramidLayerAdded {
        symbol: String,
        layer_number: u32,
        entry_price: Decimal,
        avg_entry_price: Decimal,
        total_size: Decimal,
        new_stop_loss: Option<Decimal>,
    },
    ReconciliationDivergence {
        symbol: String,
        local_size: Decimal,
        broker_size: Decimal,
    },
    PhantomLocalPosition {
        symbol: String,
    },
    UnknownBrokerPosition {
        symbol: String,
        size: Decimal,
    },
    PersistenceDropped {
        dropped: usize,
    },
}

impl Event {
    /// Critical events are mirrored to the log stream in addition to the bus.
    pub fn is_critical(&self) -> bool {
        matches!(
            self,
            Event::PhaseRegression { .. }
                | Event::PhantomLocalPosition { .. }
                | Event::UnknownBrokerPosition { .. }
                | Event::ReconciliationDivergence { .. }
                | Event::PersistenceDropped { .. }
                | Event::LateAbortAfterExecution { .. }
        )
    }
}

const EVENT_BUS_CAPACITY: usize = 4096;

/// In-process fan-out. `broadcast` drops the oldest entries for lagging
/// subscribers instead of back-pressuring the publisher, which keeps event
/// publication non-blocking with respect to the state change that produced it.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        Self { tx }
    }

    pub fn publish(&self, event: Event) {
        if event.is_critical() {
            warn!(event = ?event, "critical event");
        }
        // A send error only means there are no subscribers right now.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
