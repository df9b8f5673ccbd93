use actix_web::{web, App, HttpServer};
use actix_web_prom::PrometheusMetricsBuilder;
use rust_decimal::Decimal;
use std::env;
use std::fs;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, Level};
use vega_execution_rs::broker::adapter::BrokerAdapter;
use vega_execution_rs::broker::binance::BinanceAdapter;
use vega_execution_rs::broker::bybit::BybitAdapter;
use vega_execution_rs::broker::gateway::BrokerGateway;
use vega_execution_rs::broker::mock::MockAdapter;
use vega_execution_rs::config::Settings;
use vega_execution_rs::context::RuntimeContext;
use vega_execution_rs::events::EventBus;
use vega_execution_rs::execution::pyramid::PyramidManager;
use vega_execution_rs::ingress::api;
use vega_execution_rs::ingress::fast::FastIngress;
use vega_execution_rs::ingress::rate_limit::RateLimitMiddleware;
use vega_execution_rs::ingress::trigger::TriggerEngine;
use vega_execution_rs::ingress::IngressDispatcher;
use vega_execution_rs::market_data::connector::DepthStreamConnector;
use vega_execution_rs::market_data::orderbook_cache::OrderBookCache;
use vega_execution_rs::persistence::sink::PersistenceSink;
use vega_execution_rs::persistence::store::PersistenceStore;
use vega_execution_rs::phase_manager::PhaseManager;
use vega_execution_rs::reconciler::Reconciler;
use vega_execution_rs::replay_guard::ReplayGuard;
use vega_execution_rs::security::SignatureValidator;
use vega_execution_rs::shadow_state::ShadowState;

const RECONCILE_INTERVAL_SECS: u64 = 10;
const EQUITY_POLL_INTERVAL_SECS: u64 = 15;

fn load_secrets_from_files() {
    const FILE_SUFFIX: &str = "_FILE";

    let vars: Vec<(String, String)> = env::vars().collect();
    for (key, value) in vars {
        if !key.ends_with(FILE_SUFFIX) {
            continue;
        }

        let target_key = key.trim_end_matches(FILE_SUFFIX);
        if env::var(target_key).is_ok() || value.is_empty() {
            continue;
        }

        if let Ok(contents) = fs::read_to_string(&value) {
            let trimmed = contents.trim().to_string();
            if !trimmed.is_empty() {
                env::set_var(target_key, trimmed);
            }
        }
    }
}

fn build_adapter(settings: &Settings) -> Arc<dyn BrokerAdapter> {
    match settings.broker.exchange.as_str() {
        "bybit" => match BybitAdapter::new(&settings.broker) {
            Ok(adapter) => Arc::new(adapter),
            Err(e) => {
                error!("❌ FATAL: Bybit adapter init failed: {}", e);
                std::process::exit(1);
            }
        },
        "binance" => match BinanceAdapter::new(&settings.broker) {
            Ok(adapter) => Arc::new(adapter),
            Err(e) => {
                error!("❌ FATAL: Binance adapter init failed: {}", e);
                std::process::exit(1);
            }
        },
        "mock" => Arc::new(MockAdapter::new()),
        other => {
            error!("❌ FATAL: unknown broker exchange '{}'", other);
            std::process::exit(1);
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    load_secrets_from_files();

    let fmt_layer = tracing_subscriber::fmt::layer().json().with_target(false);
    {
        use tracing_subscriber::layer::SubscriberExt;
        let subscriber = tracing_subscriber::Registry::default()
            .with(
                tracing_subscriber::EnvFilter::from_default_env()
                    .add_directive(Level::INFO.into()),
            )
            .with(fmt_layer);
        tracing::subscriber::set_global_default(subscriber)
            .expect("setting default subscriber failed");
    }

    info!("╔═══════════════════════════════════════════════════════════════╗");
    info!("║                  VEGA EXECUTION RS                            ║");
    info!("║           Derivatives Execution Core                          ║");
    info!("╚═══════════════════════════════════════════════════════════════╝");

    dotenv::dotenv().ok();

    let settings = Settings::new().unwrap_or_else(|e| {
        error!("❌ FATAL: failed to load configuration: {}", e);
        std::process::exit(1);
    });

    // Fail-closed: a missing signing secret aborts startup unless explicitly
    // waived for testing.
    let security = SignatureValidator::from_env(settings.replay.max_drift_ms);

    // Persistence must open before anything mutates state.
    let store = match PersistenceStore::open(&settings.persistence.path) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!("❌ FATAL: persistence store failed to open: {}", e);
            std::process::exit(1);
        }
    };

    let ctx = RuntimeContext::new_system();
    let events = EventBus::new();

    let sink = PersistenceSink::new(store.clone(), settings.persistence.queue_limit, events.clone());
    let _sink_worker = sink.start_worker();

    // System events flow to the append-only table off the hot path.
    {
        let mut event_rx = events.subscribe();
        let sink = sink.clone();
        tokio::spawn(async move {
            while let Ok(event) = event_rx.recv().await {
                if let Ok(payload) = serde_json::to_value(&event) {
                    sink.enqueue(vega_execution_rs::persistence::sink::WriteOp::AppendEvent(
                        payload,
                    ));
                }
            }
        });
    }

    let shadow = ShadowState::new(&store, sink.clone(), events.clone(), ctx.clone());

    // Process-wide replay store, initialized at startup.
    let replay_guard = ReplayGuard::new(
        settings.replay.ttl_ms,
        settings.replay.redis_url.as_deref(),
    );
    replay_guard.start_sweeper(Duration::from_secs(30));

    // Order-book mirror + stream consumer.
    let cache = OrderBookCache::new(
        settings.market_data.obi_levels,
        Duration::from_millis(settings.market_data.stale_after_ms),
    );
    let connector = DepthStreamConnector::new(
        cache.clone(),
        settings.market_data.ws_url.clone(),
        settings.market_data.rest_url.clone(),
        settings.market_data.symbols.clone(),
        settings.market_data.depth,
    );
    let _md_handle = connector.start();
    info!("✅ Market data connector started");

    // Broker gateway behind the global rate limiter.
    let adapter = build_adapter(&settings);
    let gateway = BrokerGateway::new(adapter, &settings.broker);
    if let Err(e) = gateway.test_connection().await {
        error!("❌ FATAL: broker connection test failed: {}", e);
        std::process::exit(1);
    }
    info!("✅ Broker gateway ready ({})", gateway.adapter_name());

    // Phase manager seeds from live equity.
    let initial_equity: Decimal = match gateway.get_account().await {
        Ok(account) => account.equity,
        Err(e) => {
            error!("❌ FATAL: could not read account equity: {}", e);
            std::process::exit(1);
        }
    };
    let phase_manager = PhaseManager::new(initial_equity, events.clone());
    let _phase_handle = phase_manager.start_polling(
        gateway.clone(),
        Duration::from_secs(EQUITY_POLL_INTERVAL_SECS),
    );

    let pyramid = PyramidManager::new(
        gateway.clone(),
        shadow.clone(),
        events.clone(),
        &settings.execution,
    );
    let trigger_engine = TriggerEngine::new(shadow.clone(), events.clone());

    let dispatcher = IngressDispatcher::new(
        security,
        replay_guard.clone(),
        phase_manager.clone(),
        shadow.clone(),
        gateway.clone(),
        cache.clone(),
        pyramid.clone(),
        trigger_engine.clone(),
        events.clone(),
        ctx,
        settings.clone(),
    );

    // Trigger engine consumes the trade stream.
    let _trigger_handle = trigger_engine.start(connector.subscribe_prices(), dispatcher.clone());

    // Valuation + pyramid tick loop on the same stream.
    {
        let mut price_rx = connector.subscribe_prices();
        let shadow = shadow.clone();
        let pyramid = pyramid.clone();
        let phase_manager = phase_manager.clone();
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move {
            while let Ok(tick) = price_rx.recv().await {
                shadow.update_valuation(&tick.symbol, tick.price);
                if phase_manager.current().allow_pyramiding {
                    let regime = dispatcher.latest_regime(&tick.symbol);
                    pyramid.on_tick(&tick.symbol, tick.price, regime).await;
                }
            }
        });
    }

    // Reconciliation loop against the broker.
    let reconciler = Reconciler::new(
        gateway.clone(),
        shadow.clone(),
        events.clone(),
        Duration::from_secs(RECONCILE_INTERVAL_SECS),
    );
    let _reconciler_handle = reconciler.start();
    info!("✅ Reconciler active ({}s interval)", RECONCILE_INTERVAL_SECS);

    // Optional binary-framed fast path.
    let _fast_handle = settings
        .server
        .fast_ingress_port
        .map(|port| FastIngress::new(dispatcher.clone(), port).start());

    // Prometheus exposition on /metrics.
    let registry = prometheus::default_registry().clone();
    let prometheus = PrometheusMetricsBuilder::new("vega_execution")
        .registry(registry)
        .endpoint("/metrics")
        .build()
        .unwrap();

    let rate_limiter = RateLimitMiddleware::new(&settings.ingress);
    let bind_address = format!("0.0.0.0:{}", settings.server.port);
    info!("🚀 Starting API server on {}", bind_address);

    let dispatcher_for_api = dispatcher.clone();
    HttpServer::new(move || {
        let cors = actix_cors::Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header();

        App::new()
            .wrap(cors)
            .wrap(rate_limiter.clone())
            .wrap(prometheus.clone())
            .app_data(web::Data::new(dispatcher_for_api.clone()))
            .configure(api::config)
    })
    .bind(&bind_address)?
    .run()
    .await?;

    // Explicit teardown of the process-wide stores.
    info!("Shutting down...");
    replay_guard.shutdown();
    info!("✅ Shutdown complete");

    Ok(())
}
