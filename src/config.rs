use config::{Config, ConfigError, Environment, File};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use std::env;

/// Layered settings: config file, then `VEGA__`-prefixed environment
/// overrides (e.g. `VEGA__BROKER__API_KEY`). Every knob has a safe default
/// except broker credentials and the signing secret.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub market_data: MarketDataConfig,
    #[serde(default)]
    pub validation: ValidationConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub replay: ReplayConfig,
    #[serde(default)]
    pub persistence: PersistenceConfig,
    #[serde(default)]
    pub ingress: IngressConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    /// TCP port for the binary-framed fast ingress; disabled when absent.
    #[serde(default)]
    pub fast_ingress_port: Option<u16>,
}

fn default_port() -> u16 {
    3400
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            fast_ingress_port: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct BrokerConfig {
    /// "mock", "bybit" or "binance".
    #[serde(default = "default_exchange")]
    pub exchange: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub api_secret: Option<String>,
    #[serde(default)]
    pub testnet: bool,
    /// Token-bucket fill rate; set to 80% of the documented exchange limit.
    #[serde(default = "default_rate_limit_rps")]
    pub rate_limit_rps: f64,
    #[serde(default = "default_rate_limit_burst")]
    pub rate_limit_burst: usize,
    /// Bounded wait for a token before failing RATE_LIMITED.
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
}

fn default_exchange() -> String {
    "mock".to_string()
}
fn default_rate_limit_rps() -> f64 {
    8.0
}
fn default_rate_limit_burst() -> usize {
    16
}
fn default_acquire_timeout_ms() -> u64 {
    2_000
}
fn default_max_retries() -> u32 {
    3
}
fn default_call_timeout_ms() -> u64 {
    5_000
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            exchange: default_exchange(),
            api_key: None,
            api_secret: None,
            testnet: false,
            rate_limit_rps: default_rate_limit_rps(),
            rate_limit_burst: default_rate_limit_burst(),
            acquire_timeout_ms: default_acquire_timeout_ms(),
            max_retries: default_max_retries(),
            call_timeout_ms: default_call_timeout_ms(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct MarketDataConfig {
    #[serde(default = "default_ws_url")]
    pub ws_url: String,
    #[serde(default = "default_rest_url")]
    pub rest_url: String,
    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,
    #[serde(default = "default_depth")]
    pub depth: usize,
    /// Top-k levels summed for OBI.
    #[serde(default = "default_obi_levels")]
    pub obi_levels: usize,
    #[serde(default = "default_stale_after_ms")]
    pub stale_after_ms: u64,
}

fn default_ws_url() -> String {
    "wss://fstream.binance.com/stream".to_string()
}
fn default_rest_url() -> String {
    "https://fapi.binance.com".to_string()
}
fn default_symbols() -> Vec<String> {
    vec!["BTCUSDT".to_string()]
}
fn default_depth() -> usize {
    20
}
fn default_obi_levels() -> usize {
    5
}
fn default_stale_after_ms() -> u64 {
    3_000
}

impl Default for MarketDataConfig {
    fn default() -> Self {
        Self {
            ws_url: default_ws_url(),
            rest_url: default_rest_url(),
            symbols: default_symbols(),
            depth: default_depth(),
            obi_levels: default_obi_levels(),
            stale_after_ms: default_stale_after_ms(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ValidationConfig {
    #[serde(default = "default_max_spread_pct")]
    pub max_spread_pct: Decimal,
    #[serde(default = "default_min_depth_mult")]
    pub min_depth_mult: Decimal,
    #[serde(default = "default_obi_buy_threshold")]
    pub obi_buy_threshold: f64,
    #[serde(default = "default_min_structure_threshold")]
    pub min_structure_threshold: Decimal,
}

fn default_max_spread_pct() -> Decimal {
    dec!(0.1)
}
fn default_min_depth_mult() -> Decimal {
    dec!(3)
}
fn default_obi_buy_threshold() -> f64 {
    1.0
}
fn default_min_structure_threshold() -> Decimal {
    dec!(60)
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            max_spread_pct: default_max_spread_pct(),
            min_depth_mult: default_min_depth_mult(),
            obi_buy_threshold: default_obi_buy_threshold(),
            min_structure_threshold: default_min_structure_threshold(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ExecutionConfig {
    /// Limit-or-Kill absolute deadline.
    #[serde(default = "default_wait_time_ms")]
    pub wait_time_ms: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_chase_interval_ms")]
    pub chase_interval_ms: u64,
    #[serde(default = "default_max_chase_ticks")]
    pub max_chase_ticks: u32,
    #[serde(default = "default_max_chase_time_ms")]
    pub max_chase_time_ms: u64,
    #[serde(default = "default_min_alpha_threshold")]
    pub min_alpha_threshold: f64,
    #[serde(default = "default_pyramid_trigger_pct")]
    pub pyramid_trigger_pct: Decimal,
    #[serde(default = "default_max_pyramid_layers")]
    pub max_pyramid_layers: u32,
    /// Layer count at which auto-trail arms.
    #[serde(default = "default_auto_trail_layer")]
    pub auto_trail_layer: u32,
    /// Size of each added layer relative to the base position.
    #[serde(default = "default_pyramid_layer_ratio")]
    pub pyramid_layer_ratio: Decimal,
}

fn default_wait_time_ms() -> u64 {
    5_000
}
fn default_poll_interval_ms() -> u64 {
    100
}
fn default_chase_interval_ms() -> u64 {
    25
}
fn default_max_chase_ticks() -> u32 {
    50
}
fn default_max_chase_time_ms() -> u64 {
    30_000
}
fn default_min_alpha_threshold() -> f64 {
    0.3
}
fn default_pyramid_trigger_pct() -> Decimal {
    dec!(0.02)
}
fn default_max_pyramid_layers() -> u32 {
    4
}
fn default_auto_trail_layer() -> u32 {
    2
}
fn default_pyramid_layer_ratio() -> Decimal {
    dec!(0.5)
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            wait_time_ms: default_wait_time_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            chase_interval_ms: default_chase_interval_ms(),
            max_chase_ticks: default_max_chase_ticks(),
            max_chase_time_ms: default_max_chase_time_ms(),
            min_alpha_threshold: default_min_alpha_threshold(),
            pyramid_trigger_pct: default_pyramid_trigger_pct(),
            max_pyramid_layers: default_max_pyramid_layers(),
            auto_trail_layer: default_auto_trail_layer(),
            pyramid_layer_ratio: default_pyramid_layer_ratio(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ReplayConfig {
    /// Must cover 2x the longest alpha half-life plus queue slack.
    #[serde(default = "default_replay_ttl_ms")]
    pub ttl_ms: i64,
    #[serde(default = "default_max_drift_ms")]
    pub max_drift_ms: i64,
    /// Optional Redis write-through mirror.
    #[serde(default)]
    pub redis_url: Option<String>,
}

fn default_replay_ttl_ms() -> i64 {
    300_000
}
fn default_max_drift_ms() -> i64 {
    5_000
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            ttl_ms: default_replay_ttl_ms(),
            max_drift_ms: default_max_drift_ms(),
            redis_url: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct PersistenceConfig {
    #[serde(default = "default_persistence_path")]
    pub path: String,
    /// Background write queue bound; oldest entries drop past this with an alert.
    #[serde(default = "default_queue_limit")]
    pub queue_limit: usize,
}

fn default_persistence_path() -> String {
    "vega_execution.redb".to_string()
}
fn default_queue_limit() -> usize {
    4_096
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            path: default_persistence_path(),
            queue_limit: default_queue_limit(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngressConfig {
    #[serde(default = "default_requests_per_minute")]
    pub requests_per_minute: u32,
    #[serde(default = "default_sensitive_requests_per_minute")]
    pub sensitive_requests_per_minute: u32,
    /// Client-trigger auto-abort window past bar close.
    #[serde(default = "default_trigger_timeout_ms")]
    pub trigger_timeout_ms: i64,
}

fn default_requests_per_minute() -> u32 {
    100
}
fn default_sensitive_requests_per_minute() -> u32 {
    10
}
fn default_trigger_timeout_ms() -> i64 {
    5_000
}

impl Default for IngressConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: default_requests_per_minute(),
            sensitive_requests_per_minute: default_sensitive_requests_per_minute(),
            trigger_timeout_ms: default_trigger_timeout_ms(),
        }
    }
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        let home = env::var("HOME").unwrap_or_else(|_| ".".into());

        let s = Config::builder()
            // 1. Global config from ~/.vega/config.json
            .add_source(File::with_name(&format!("{}/.vega/config", home)).required(false))
            // 2. Project config
            .add_source(File::with_name("config/config").required(false))
            // 3. Local overrides (not checked in)
            .add_source(File::with_name("config/local").required(false))
            // 4. Environment, e.g. VEGA__BROKER__API_KEY
            .add_source(Environment::with_prefix("VEGA").separator("__"))
            .build()?;

        s.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_safe() {
        let settings = Settings::default();
        assert_eq!(settings.broker.exchange, "mock");
        assert!(settings.broker.api_key.is_none());
        assert_eq!(settings.execution.wait_time_ms, 5_000);
        assert_eq!(settings.execution.max_pyramid_layers, 4);
        assert_eq!(settings.replay.max_drift_ms, 5_000);
        assert_eq!(settings.ingress.requests_per_minute, 100);
    }

    #[test]
    fn test_replay_ttl_covers_longest_half_life() {
        let settings = Settings::default();
        // 2x SWING half-life (120s) + slack
        assert!(settings.replay.ttl_ms >= 2 * 120_000 + 10_000);
    }
}
