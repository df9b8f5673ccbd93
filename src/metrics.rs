use once_cell::sync::Lazy;
use prometheus::{
    register_histogram, register_int_counter, register_int_gauge, Histogram, IntCounter, IntGauge,
};

pub static ORDER_LATENCY: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "vega_execution_order_latency_seconds",
        "End-to-end order execution latency (ingress -> fill)",
        vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]
    )
    .expect("order_latency histogram")
});

pub static ACTIVE_POSITIONS: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "vega_execution_active_positions",
        "Number of currently open positions"
    )
    .expect("active_positions gauge")
});

pub static CURRENT_PHASE: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "vega_execution_current_phase",
        "Equity-selected operating phase (1-3)"
    )
    .expect("current_phase gauge")
});

pub static FILLED_ORDERS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "vega_execution_filled_orders_total",
        "Orders fully filled"
    )
    .expect("filled_orders counter")
});

pub static REJECTED_SIGNALS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "vega_execution_rejected_signals_total",
        "Signals rejected before execution"
    )
    .expect("rejected_signals counter")
});

pub static REPLAYED_SIGNALS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "vega_execution_replayed_signals_total",
        "Signals dropped by the replay guard"
    )
    .expect("replayed_signals counter")
});

pub static RATE_LIMITED_CALLS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "vega_execution_rate_limited_calls_total",
        "Broker calls failed on token acquisition"
    )
    .expect("rate_limited_calls counter")
});

pub static RECONCILIATION_DIVERGENCES: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "vega_execution_reconciliation_divergences_total",
        "Local/broker position divergences observed"
    )
    .expect("reconciliation_divergences counter")
});

pub static PERSISTENCE_DROPS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "vega_execution_persistence_drops_total",
        "Persistence queue entries dropped past the bound"
    )
    .expect("persistence_drops counter")
});

pub static INGRESS_THROTTLED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "vega_execution_ingress_throttled_total",
        "Ingress requests answered 429"
    )
    .expect("ingress_throttled counter")
});

pub fn set_active_positions(count: i64) {
    ACTIVE_POSITIONS.set(count);
}

pub fn set_current_phase(phase: u8) {
    CURRENT_PHASE.set(phase as i64);
}

pub fn inc_filled_orders() {
    FILLED_ORDERS.inc();
}

pub fn inc_rejected_signals() {
    REJECTED_SIGNALS.inc();
}

pub fn inc_replayed_signals() {
    REPLAYED_SIGNALS.inc();
}

pub fn inc_rate_limited() {
    RATE_LIMITED_CALLS.inc();
}

pub fn inc_reconciliation_divergence() {
    RECONCILIATION_DIVERGENCES.inc();
}

pub fn inc_persistence_drops(n: usize) {
    PERSISTENCE_DROPS.inc_by(n as u64);
}

pub fn inc_ingress_throttled() {
    INGRESS_THROTTLED.inc();
}

pub fn observe_order_latency(seconds: f64) {
    ORDER_LATENCY.observe(seconds);
}
