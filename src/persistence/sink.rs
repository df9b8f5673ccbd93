use crate::events::{Event, EventBus};
use crate::metrics;
use crate::model::{Intent, Position, TradeRecord};
use crate::persistence::store::PersistenceStore;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, warn};

const RETRY_DELAY_MS: u64 = 500;

#[derive(Debug, Clone)]
pub enum WriteOp {
    SavePosition(Position),
    DeletePosition(String),
    SaveIntent(Intent),
    DeleteIntent(String),
    SaveTrade(TradeRecord),
    AppendEvent(serde_json::Value),
    RegimeSnapshot(serde_json::Value),
}

/// Append-only sink on a background path. `enqueue` never blocks and never
/// fails the caller; a full queue drops the oldest entries with an alert.
/// Store failures requeue the op and back off, so PERSISTENCE_UNAVAILABLE
/// windows lose nothing unless the bound is hit.
pub struct PersistenceSink {
    store: Arc<PersistenceStore>,
    queue: Mutex<VecDeque<WriteOp>>,
    queue_limit: usize,
    notify: Notify,
    event_seq: AtomicU64,
    events: EventBus,
}

impl PersistenceSink {
    pub fn new(store: Arc<PersistenceStore>, queue_limit: usize, events: EventBus) -> Arc<Self> {
        Arc::new(Self {
            store,
            queue: Mutex::new(VecDeque::new()),
            queue_limit,
            notify: Notify::new(),
            event_seq: AtomicU64::new(chrono::Utc::now().timestamp_millis() as u64),
            events,
        })
    }

    /// Never blocks; never reports failure to the caller.
    pub fn enqueue(&self, op: WriteOp) {
        let dropped = {
            let mut queue = self.queue.lock();
            queue.push_back(op);
            let mut dropped = 0;
            while queue.len() > self.queue_limit {
                queue.pop_front();
                dropped += 1;
            }
            dropped
        };

        if dropped > 0 {
            metrics::inc_persistence_drops(dropped);
            warn!(dropped, "Persistence queue over bound, oldest writes dropped");
            self.events.publish(Event::PersistenceDropped { dropped });
        }
        self.notify.notify_one();
    }

    pub fn queue_depth(&self) -> usize {
        self.queue.lock().len()
    }

    fn apply(&self, op: &WriteOp) -> Result<(), crate::persistence::store::StoreError> {
        match op {
            WriteOp::SavePosition(p) => self.store.save_position(p),
            WriteOp::DeletePosition(symbol) => self.store.delete_position(symbol),
            WriteOp::SaveIntent(i) => self.store.save_intent(i),
            WriteOp::DeleteIntent(id) => self.store.delete_intent(id),
            WriteOp::SaveTrade(t) => self.store.save_trade(t),
            WriteOp::AppendEvent(v) => {
                let seq = self.event_seq.fetch_add(1, Ordering::SeqCst);
                self.store.append_event(seq, v)
            }
            WriteOp::RegimeSnapshot(v) => {
                let seq = self.event_seq.fetch_add(1, Ordering::SeqCst);
                self.store.append_regime_snapshot(seq, v)
            }
        }
    }

    pub fn start_worker(self: &Arc<Self>) -> JoinHandle<()> {
        let sink = self.clone();
        tokio::spawn(async move {
            loop {
                let op = {
                    let mut queue = sink.queue.lock();
                    queue.pop_front()
                };

                match op {
                    Some(op) => {
                        let result = tokio::task::block_in_place(|| sink.apply(&op));
                        if let Err(e) = result {
                            error!("Persistence write failed, requeueing: {}", e);
                            sink.queue.lock().push_front(op);
                            tokio::time::sleep(Duration::from_millis(RETRY_DELAY_MS)).await;
                        }
                    }
                    None => sink.notify.notified().await,
                }
            }
        })
    }

    /// Drain synchronously; test-only convenience for deterministic asserts.
    #[cfg(test)]
    pub fn drain_now(&self) {
        loop {
            let op = { self.queue.lock().pop_front() };
            match op {
                Some(op) => {
                    if let Err(e) = self.apply(&op) {
                        error!("Persistence drain failed: {}", e);
                    }
                }
                None => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Side;
    use chrono::Utc;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn temp_sink(limit: usize) -> Arc<PersistenceSink> {
        let path = format!("/tmp/vega_sink_test_{}.redb", uuid::Uuid::new_v4());
        let store = Arc::new(PersistenceStore::open(path).unwrap());
        PersistenceSink::new(store, limit, EventBus::new())
    }

    fn position(symbol: &str) -> Position {
        Position {
            symbol: symbol.to_string(),
            side: Side::Long,
            size: dec!(1),
            avg_entry_price: dec!(100),
            current_stop: dec!(90),
            take_profits: vec![],
            broker_order_ids: vec![],
            signal_id: "sig".into(),
            opened_at: Utc::now(),
            phase_at_entry: 1,
            regime_at_entry: 0,
            unrealized_pnl: Decimal::ZERO,
            last_mark_price: None,
            reconciled_at: None,
        }
    }

    #[test]
    fn test_enqueue_then_drain_persists() {
        let sink = temp_sink(100);
        sink.enqueue(WriteOp::SavePosition(position("BTCUSDT")));
        assert_eq!(sink.queue_depth(), 1);

        sink.drain_now();
        assert_eq!(sink.queue_depth(), 0);
        assert_eq!(sink.store.load_positions().unwrap().len(), 1);
    }

    #[test]
    fn test_bounded_queue_drops_oldest_with_alert() {
        let sink = temp_sink(2);
        let bus_rx = &mut sink.events.subscribe();

        sink.enqueue(WriteOp::DeletePosition("A".into()));
        sink.enqueue(WriteOp::DeletePosition("B".into()));
        sink.enqueue(WriteOp::DeletePosition("C".into()));

        assert_eq!(sink.queue_depth(), 2);
        match bus_rx.try_recv() {
            Ok(Event::PersistenceDropped { dropped }) => assert_eq!(dropped, 1),
            other => panic!("expected drop alert, got {:?}", other),
        }
    }
}
