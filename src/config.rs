// =============================================================================
// Configuration — YAML-backed engine settings
// =============================================================================
//
// Every field carries a serde default so that a config file missing newer
// keys still deserialises. Strategy thresholds (impulse 2 % / 60 s window,
// coverage cost ceiling 0.98, near-certain band 0.95–0.99, ...) live here as
// configuration values, not constants.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use tracing::info;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_true() -> bool {
    true
}

fn default_bot_name() -> String {
    "Wanchai Arbitrage Bot".to_string()
}

fn default_symbols() -> Vec<String> {
    vec!["BTCUSDT".to_string()]
}

fn default_target_keywords() -> Vec<String> {
    vec!["bitcoin".to_string(), "btc".to_string(), "crypto".to_string()]
}

fn default_min_price_deviation() -> f64 {
    0.02
}

fn default_impulse_window_ms() -> i64 {
    60_000
}

fn default_execution_window_seconds() -> u64 {
    900
}

fn default_latency_max_position() -> Decimal {
    dec!(35000)
}

fn default_min_probability() -> Decimal {
    dec!(0.95)
}

fn default_max_probability() -> Decimal {
    dec!(0.99)
}

fn default_min_yield() -> Decimal {
    dec!(0.001)
}

fn default_max_time_to_resolution_hours() -> f64 {
    24.0
}

fn default_parity_min_spread() -> Decimal {
    dec!(0.005)
}

fn default_max_slippage() -> Decimal {
    dec!(0.01)
}

fn default_parity_target_profit() -> Decimal {
    dec!(0.03)
}

fn default_parity_max_position() -> Decimal {
    dec!(10000)
}

fn default_mm_min_spread() -> Decimal {
    dec!(0.02)
}

fn default_order_refresh_seconds() -> u64 {
    30
}

fn default_max_inventory_imbalance() -> f64 {
    0.3
}

fn default_order_size() -> Decimal {
    dec!(100)
}

fn default_max_total_cost() -> Decimal {
    dec!(0.98)
}

fn default_coverage_target_profit() -> Decimal {
    dec!(0.25)
}

fn default_min_outcomes_covered() -> usize {
    3
}

fn default_coverage_max_position() -> Decimal {
    dec!(5000)
}

fn default_target_win_rate() -> f64 {
    0.996
}

fn default_min_certainty() -> f64 {
    0.95
}

fn default_max_position_pct() -> f64 {
    0.10
}

fn default_kelly_fraction() -> f64 {
    0.5
}

fn default_compound_frequency() -> CompoundFrequency {
    CompoundFrequency::Immediate
}

fn default_max_daily_loss() -> Decimal {
    dec!(5000)
}

fn default_risk_max_position() -> Decimal {
    dec!(50000)
}

fn default_min_confidence() -> f64 {
    0.5
}

fn default_market_refresh_seconds() -> u64 {
    300
}

fn default_resolution_sweep_seconds() -> u64 {
    60
}

fn default_rate_limit_per_second() -> f64 {
    10.0
}

fn default_rate_limit_burst() -> u32 {
    20
}

// =============================================================================
// Sections
// =============================================================================

/// Top-level bot identity and mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotConfig {
    #[serde(default = "default_bot_name")]
    pub name: String,
    /// When true the executor synthesizes fills instead of hitting the venue.
    #[serde(default = "default_true")]
    pub dry_run: bool,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            name: default_bot_name(),
            dry_run: true,
        }
    }
}

/// How often realized profit is folded back into available capital.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompoundFrequency {
    Immediate,
    Daily,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LatencyArbitrageConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Impulse threshold and lag threshold, as a fraction (0.02 = 2 %).
    #[serde(default = "default_min_price_deviation")]
    pub min_price_deviation: f64,
    /// Rolling window for impulse detection.
    #[serde(default = "default_impulse_window_ms")]
    pub impulse_window_ms: i64,
    #[serde(default = "default_latency_max_position")]
    pub max_position_size: Decimal,
    /// How long a detected impulse stays exploitable.
    #[serde(default = "default_execution_window_seconds")]
    pub execution_window_seconds: u64,
    /// Keywords a market question must carry to be considered.
    #[serde(default = "default_target_keywords")]
    pub target_markets: Vec<String>,
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,
}

impl Default for LatencyArbitrageConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_price_deviation: default_min_price_deviation(),
            impulse_window_ms: default_impulse_window_ms(),
            max_position_size: default_latency_max_position(),
            execution_window_seconds: default_execution_window_seconds(),
            target_markets: default_target_keywords(),
            min_confidence: default_min_confidence(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NearResolvedConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_min_probability")]
    pub min_probability: Decimal,
    #[serde(default = "default_max_probability")]
    pub max_probability: Decimal,
    #[serde(default = "default_min_yield")]
    pub min_yield: Decimal,
    #[serde(default = "default_max_time_to_resolution_hours")]
    pub max_time_to_resolution_hours: f64,
    #[serde(default = "default_true")]
    pub reinvest_profits: bool,
    #[serde(default = "default_min_certainty")]
    pub min_confidence: f64,
}

impl Default for NearResolvedConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_probability: default_min_probability(),
            max_probability: default_max_probability(),
            min_yield: default_min_yield(),
            max_time_to_resolution_hours: default_max_time_to_resolution_hours(),
            reinvest_profits: true,
            min_confidence: default_min_certainty(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct YesNoArbitrageConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Minimum parity edge before a signal is emitted.
    #[serde(default = "default_parity_min_spread")]
    pub min_spread: Decimal,
    #[serde(default = "default_max_slippage")]
    pub max_slippage: Decimal,
    /// Edge at which confidence saturates.
    #[serde(default = "default_parity_target_profit")]
    pub target_profit_pct: Decimal,
    #[serde(default = "default_parity_max_position")]
    pub max_position_size: Decimal,
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,
}

impl Default for YesNoArbitrageConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_spread: default_parity_min_spread(),
            max_slippage: default_max_slippage(),
            target_profit_pct: default_parity_target_profit(),
            max_position_size: default_parity_max_position(),
            min_confidence: default_min_confidence(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpreadTradingConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_mm_min_spread")]
    pub min_spread: Decimal,
    #[serde(default = "default_order_refresh_seconds")]
    pub order_refresh_seconds: u64,
    #[serde(default = "default_max_inventory_imbalance")]
    pub max_inventory_imbalance: f64,
    /// Shares per quote before inventory skew.
    #[serde(default = "default_order_size")]
    pub order_size: Decimal,
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,
}

impl Default for SpreadTradingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_spread: default_mm_min_spread(),
            order_refresh_seconds: default_order_refresh_seconds(),
            max_inventory_imbalance: default_max_inventory_imbalance(),
            order_size: default_order_size(),
            min_confidence: default_min_confidence(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RangeCoverageConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Ceiling for the summed price of the coverage set, per $1 payout.
    #[serde(default = "default_max_total_cost")]
    pub max_total_cost: Decimal,
    #[serde(default = "default_coverage_target_profit")]
    pub target_profit_pct: Decimal,
    #[serde(default = "default_min_outcomes_covered")]
    pub min_outcomes_covered: usize,
    #[serde(default = "default_coverage_max_position")]
    pub max_position_size: Decimal,
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,
}

impl Default for RangeCoverageConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_total_cost: default_max_total_cost(),
            target_profit_pct: default_coverage_target_profit(),
            min_outcomes_covered: default_min_outcomes_covered(),
            max_position_size: default_coverage_max_position(),
            min_confidence: default_min_confidence(),
        }
    }
}

/// Kelly-based compounding parameters shared by sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompoundingConfig {
    #[serde(default = "default_target_win_rate")]
    pub target_win_rate: f64,
    #[serde(default = "default_min_certainty")]
    pub min_certainty: f64,
    #[serde(default = "default_max_position_pct")]
    pub max_position_pct: f64,
    /// Multiplier applied to full Kelly (0.5 = half-Kelly).
    #[serde(default = "default_kelly_fraction")]
    pub kelly_fraction: f64,
    #[serde(default = "default_compound_frequency")]
    pub compound_frequency: CompoundFrequency,
}

impl Default for CompoundingConfig {
    fn default() -> Self {
        Self {
            target_win_rate: default_target_win_rate(),
            min_certainty: default_min_certainty(),
            max_position_pct: default_max_position_pct(),
            kelly_fraction: default_kelly_fraction(),
            compound_frequency: default_compound_frequency(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StrategiesConfig {
    #[serde(default)]
    pub latency_arbitrage: LatencyArbitrageConfig,
    #[serde(default)]
    pub near_resolved_sniping: NearResolvedConfig,
    #[serde(default)]
    pub yes_no_arbitrage: YesNoArbitrageConfig,
    #[serde(default)]
    pub spread_trading: SpreadTradingConfig,
    #[serde(default)]
    pub range_coverage: RangeCoverageConfig,
    #[serde(default)]
    pub compounding_bets: CompoundingConfig,
}

/// Session-wide risk limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    /// Dollar loss from initial capital that halts the session (exit 2).
    #[serde(default = "default_max_daily_loss")]
    pub max_daily_loss: Decimal,
    /// Hard cap on any single reservation.
    #[serde(default = "default_risk_max_position")]
    pub max_position_size: Decimal,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_daily_loss: default_max_daily_loss(),
            max_position_size: default_risk_max_position(),
        }
    }
}

/// Outbound request pacing for the venue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_rate_limit_per_second")]
    pub requests_per_second: f64,
    #[serde(default = "default_rate_limit_burst")]
    pub burst: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_second: default_rate_limit_per_second(),
            burst: default_rate_limit_burst(),
        }
    }
}

// =============================================================================
// Config
// =============================================================================

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub bot: BotConfig,
    #[serde(default)]
    pub strategies: StrategiesConfig,
    #[serde(default)]
    pub risk: RiskConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    /// External exchange symbols to stream.
    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,
    /// Override for the slow strategy scan cadence (near-resolved and range
    /// coverage). `None` keeps the built-in 5 minute default. Set by the
    /// `--interval` CLI flag.
    #[serde(default)]
    pub scan_interval_seconds: Option<u64>,
    /// Market catalog poll cadence.
    #[serde(default = "default_market_refresh_seconds")]
    pub market_refresh_seconds: u64,
    /// Resolution sweep cadence.
    #[serde(default = "default_resolution_sweep_seconds")]
    pub resolution_sweep_seconds: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bot: BotConfig::default(),
            strategies: StrategiesConfig::default(),
            risk: RiskConfig::default(),
            rate_limit: RateLimitConfig::default(),
            scan_interval_seconds: None,
            symbols: default_symbols(),
            market_refresh_seconds: default_market_refresh_seconds(),
            resolution_sweep_seconds: default_resolution_sweep_seconds(),
        }
    }
}

impl Config {
    /// Load configuration from a YAML file at `path`.
    ///
    /// A missing file is an error so the caller can decide whether to fall
    /// back to defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config from {}", path.display()))?;

        let config: Self = serde_yaml::from_str(&content)
            .with_context(|| format!("failed to parse config from {}", path.display()))?;

        info!(
            path = %path.display(),
            bot = %config.bot.name,
            dry_run = config.bot.dry_run,
            symbols = ?config.symbols,
            "config loaded"
        );

        Ok(config)
    }
}
