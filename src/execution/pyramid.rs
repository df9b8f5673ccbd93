use crate::broker::adapter::OrderRequest;
use crate::broker::gateway::BrokerGateway;
use crate::config::ExecutionConfig;
use crate::events::{Event, EventBus};
use crate::model::{Position, PyramidState, Side, REGIME_RISK_ON};
use crate::shadow_state::ShadowState;
use dashmap::DashMap;
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{info, warn};

/// Geometric pyramiding on winning positions (Phase 2 only).
///
/// A layer is added when the regime is Risk-On and price has moved
/// `trigger_pct` beyond the last entry in the position's favor. Reaching the
/// auto-trail layer moves the stop to the running average entry, with the
/// broker stop update issued once per layer. Any regime flip while the trail
/// is armed flattens the pyramid.
pub struct PyramidManager {
    states: DashMap<String, PyramidState>,
    gateway: Arc<BrokerGateway>,
    shadow: Arc<ShadowState>,
    events: EventBus,
    trigger_pct: Decimal,
    max_layers: u32,
    auto_trail_layer: u32,
    layer_ratio: Decimal,
}

impl PyramidManager {
    pub fn new(
        gateway: Arc<BrokerGateway>,
        shadow: Arc<ShadowState>,
        events: EventBus,
        config: &ExecutionConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            states: DashMap::new(),
            gateway,
            shadow,
            events,
            trigger_pct: config.pyramid_trigger_pct,
            max_layers: config.max_pyramid_layers,
            auto_trail_layer: config.auto_trail_layer,
            layer_ratio: config.pyramid_layer_ratio,
        })
    }

    /// Track a freshly opened position as pyramid layer 1.
    pub fn seed(&self, position: &Position) {
        self.states.insert(
            position.symbol.clone(),
            PyramidState {
                symbol: position.symbol.clone(),
                side: position.side,
                layer_count: 1,
                entry_prices: vec![position.avg_entry_price],
                layer_sizes: vec![position.size],
                avg_entry_price: position.avg_entry_price,
                last_entry_price: position.avg_entry_price,
                current_stop: position.current_stop,
                auto_trail_enabled: false,
                trailed_at_layer: 0,
            },
        );
    }

    /// Destroyed with the position.
    pub fn remove(&self, symbol: &str) {
        self.states.remove(symbol);
    }

    pub fn state(&self, symbol: &str) -> Option<PyramidState> {
        self.states.get(symbol).map(|s| s.clone())
    }

    /// Opportunity gate: Risk-On regime, price beyond the trigger distance
    /// from the last entry in the favorable direction, room for a layer.
    pub fn has_opportunity(&self, symbol: &str, price: Decimal, regime_state: i32) -> bool {
        if regime_state != REGIME_RISK_ON {
            return false;
        }
        let Some(state) = self.states.get(symbol) else {
            return false;
        };
        if state.layer_count >= self.max_layers {
            return false;
        }

        let threshold = match state.side {
            Side::Long | Side::Buy => state.last_entry_price * (Decimal::ONE + self.trigger_pct),
            Side::Short | Side::Sell => state.last_entry_price * (Decimal::ONE - self.trigger_pct),
        };
        match state.side {
            Side::Long | Side::Buy => price > threshold,
            Side::Short | Side::Sell => price < threshold,
        }
    }

    /// Evaluate one price tick for a symbol: either flatten on regime kill,
    /// or add a layer when the opportunity gate opens.
    pub async fn on_tick(&self, symbol: &str, price: Decimal, regime_state: i32) {
        let trail_armed = self
            .states
            .get(symbol)
            .map(|s| s.auto_trail_enabled)
            .unwrap_or(false);

        if regime_state != REGIME_RISK_ON && trail_armed {
            self.close_all(symbol, price).await;
            return;
        }

        if self.has_opportunity(symbol, price, regime_state) {
            self.add_layer(symbol, price).await;
        }
    }

    async fn add_layer(&self, symbol: &str, price: Decimal) {
        let (side, layer_size) = {
            let Some(state) = self.states.get(symbol) else {
                return;
            };
            let base = state.layer_sizes.first().copied().unwrap_or(Decimal::ZERO);
            (state.side, base * self.layer_ratio)
        };
        if layer_size <= Decimal::ZERO {
            return;
        }

        let request = OrderRequest::market(
            symbol,
            side.entry_order_side(),
            layer_size,
            format!("pyr-{}-{}", symbol, chrono::Utc::now().timestamp_millis()),
        );
        let ack = match self.gateway.send_order(request).await {
            Ok(ack) => ack,
            Err(e) => {
                warn!(symbol = %symbol, "Pyramid layer order failed: {}", e);
                return;
            }
        };

        let Some(mut state) = self.states.get_mut(symbol) else {
            return;
        };
        state.entry_prices.push(price);
        state.layer_sizes.push(layer_size);
        state.layer_count += 1;
        state.last_entry_price = price;
        state.avg_entry_price = state.weighted_average();
        let layer_number = state.layer_count;
        let avg_entry = state.avg_entry_price;
        let total_size = state.total_size();

        // Auto-trail: stop moves to the running average entry; the broker
        // update is idempotent per layer.
        let mut new_stop = None;
        if layer_number >= self.auto_trail_layer && state.trailed_at_layer < layer_number {
            state.current_stop = avg_entry;
            state.auto_trail_enabled = true;
            state.trailed_at_layer = layer_number;
            new_stop = Some(avg_entry);
        }
        drop(state);

        self.shadow
            .augment_position(symbol, price, layer_size, ack.broker_order_id);

        if let Some(stop) = new_stop {
            self.shadow.update_stop(symbol, stop);
            match self.gateway.update_stop_loss(symbol, stop).await {
                Ok(()) => info!(symbol = %symbol, stop = %stop, "Auto-trail stop updated at broker"),
                Err(e) => warn!(symbol = %symbol, "Auto-trail stop update failed: {}", e),
            }
        }

        info!(
            symbol = %symbol,
            layer_number,
            entry_price = %price,
            avg_entry_price = %avg_entry,
            total_size = %total_size,
            new_stop_loss = ?new_stop,
            "Pyramid layer added"
        );
        self.events.publish(Event::PyramidLayerAdded {
            symbol: symbol.to_string(),
            layer_number,
            entry_price: price,
            avg_entry_price: avg_entry,
            total_size,
            new_stop_loss: new_stop,
        });
    }

    /// Regime kill while trailing: flatten the whole pyramid.
    async fn close_all(&self, symbol: &str, price: Decimal) {
        warn!(symbol = %symbol, "Regime no longer Risk-On, closing pyramid");
        match self.gateway.close_position(symbol).await {
            Ok(_) => {
                self.shadow.close_position(symbol, price, "REGIME_KILL");
                self.remove(symbol);
            }
            Err(e) => warn!(symbol = %symbol, "Pyramid close-all failed: {}", e),
        }
    }
}
