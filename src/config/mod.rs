//! Structured TOML configuration, composed from per-section sub-configs the
//! way the teacher composes `BrokerConfig`/`RiskEnvConfig`/`StrategyConfig`
//! (`src/config.rs`), but loaded from a single file (`spec.md` §6) rather
//! than flattened into environment variables the way the teacher does it.
//! `serde`/`toml` deserialize the raw file (unknown keys are silently
//! ignored, matching `toml::from_str`'s default behavior); a small set of
//! documented secrets (`LOG_LEVEL`, `ONCHAIN_API_KEY`, `COINGECKO_API_KEY`,
//! `HYPERLIQUID_SECRET`, `LLM_API_KEY`) may override the file afterward.
//! Missing required fields (present in neither the file nor the
//! environment) fail startup with a precise `anyhow::Context` message,
//! following the teacher's `Config::from_env` fail-fast style.

use std::collections::HashMap;
use std::env;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;

fn env_var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.is_empty())
}

// ---------------------------------------------------------------------
// Raw file shape. Every field is optional at the file level; `resolve()`
// below applies defaults, environment overrides, and required-field checks.
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct RawConfig {
    hyperliquid: RawHyperliquid,
    llm: RawLlm,
    agent: RawAgent,
    risk: RawRisk,
    governance: RawGovernance,
    signals: RawSignals,
    observability: RawObservability,
    workflow_graph: Option<RawWorkflowGraph>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct RawHyperliquid {
    account_address: Option<String>,
    secret: Option<String>,
    base_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct RawLlm {
    provider: Option<String>,
    model: Option<String>,
    key: Option<String>,
    temperature: Option<f64>,
    max_tokens: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct RawAgent {
    tick_interval_seconds: Option<u64>,
    max_retries: Option<u32>,
    backoff_base_seconds: Option<f64>,
    log_level: Option<String>,
    size_decimals: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct RawRisk {
    auto_transfer_enabled: Option<bool>,
    target_initial_margin_ratio: Option<Decimal>,
    min_perp_balance_usd: Option<Decimal>,
    target_spot_usdc_buffer_usd: Option<Decimal>,
    min_margin_ratio: Option<Decimal>,
    liquidation_proximity_threshold: Option<Decimal>,
    daily_loss_limit_pct: Option<Decimal>,
    emergency_reduction_pct: Option<Decimal>,
    min_order_notional_usd: Option<Decimal>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct RawGovernance {
    minimum_advantage_over_cost_bps: Option<Decimal>,
    cooldown_after_change_minutes: Option<i64>,
    partial_rotation_pct_per_cycle: Option<Decimal>,
    state_persistence_path: Option<String>,
    completed_plans_log_path: Option<String>,
    confirmation_cycles_required: Option<usize>,
    hysteresis_enter_threshold: Option<f64>,
    hysteresis_exit_threshold: Option<f64>,
    event_lock_window_hours_before: Option<i64>,
    event_lock_window_hours_after: Option<i64>,
    max_data_staleness_seconds: Option<i64>,
    max_api_failure_count: Option<u32>,
    check_invalidation_triggers: Option<bool>,
    fast_loop_interval_seconds: Option<u64>,
    medium_loop_interval_minutes: Option<i64>,
    slow_loop_interval_hours: Option<i64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct RawProviderBlock {
    enabled: Option<bool>,
    ttl_seconds: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct RawSignals {
    fast_deadline_seconds: Option<u64>,
    medium_deadline_seconds: Option<u64>,
    slow_deadline_seconds: Option<u64>,
    cache_db_path: Option<String>,
    order_book_ttl_seconds: Option<u64>,
    spot_price_ttl_seconds: Option<u64>,
    onchain_api_key: Option<String>,
    coingecko_api_key: Option<String>,
    tracked_coins: Option<Vec<String>>,
    http_provider_base_url: Option<String>,
    #[serde(default)]
    providers: HashMap<String, RawProviderBlock>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct RawObservability {
    metrics_push_interval_seconds: Option<u64>,
    metrics_prefix: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct RawWorkflowGraph {
    enabled: Option<bool>,
    checkpoint_dir: Option<String>,
}

// ---------------------------------------------------------------------
// Resolved config: what the rest of the crate actually consumes.
// ---------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct HyperliquidEnvConfig {
    pub account_address: String,
    pub api_secret: String,
    pub base_url: String,
}

#[derive(Debug, Clone)]
pub struct LlmEnvConfig {
    pub provider: String,
    pub model: String,
    pub api_key: Option<String>,
    pub temperature: f64,
    pub max_tokens: u32,
}

#[derive(Debug, Clone)]
pub struct AgentEnvConfig {
    pub tick_interval_seconds: u64,
    pub max_retries: u32,
    pub backoff_base_seconds: f64,
    pub log_level: String,
    pub size_decimals: u32,
}

#[derive(Debug, Clone)]
pub struct RiskEnvConfig {
    pub auto_transfer_enabled: bool,
    pub target_initial_margin_ratio: Decimal,
    pub min_perp_balance_usd: Decimal,
    pub target_spot_usdc_buffer_usd: Decimal,
    pub min_margin_ratio: Decimal,
    pub liquidation_proximity_threshold: Decimal,
    pub daily_loss_limit_pct: Decimal,
    pub emergency_reduction_pct: Decimal,
    pub min_order_notional_usd: Decimal,
}

#[derive(Debug, Clone)]
pub struct GovernanceEnvConfig {
    pub minimum_advantage_over_cost_bps: Decimal,
    pub cooldown_after_change_minutes: i64,
    pub partial_rotation_pct_per_cycle: Decimal,
    pub state_persistence_path: String,
    pub completed_plans_log_path: String,
    pub confirmation_cycles_required: usize,
    pub hysteresis_enter_threshold: f64,
    pub hysteresis_exit_threshold: f64,
    pub event_lock_window_hours_before: i64,
    pub event_lock_window_hours_after: i64,
    pub max_data_staleness_seconds: i64,
    pub max_api_failure_count: u32,
    pub check_invalidation_triggers: bool,
    pub fast_loop_interval_seconds: u64,
    pub medium_loop_interval_minutes: i64,
    pub slow_loop_interval_hours: i64,
}

impl GovernanceEnvConfig {
    pub fn fast_loop_interval(&self) -> Duration {
        Duration::from_secs(self.fast_loop_interval_seconds)
    }
}

#[derive(Debug, Clone)]
pub struct ProviderBlockConfig {
    pub enabled: bool,
    pub ttl_seconds: u64,
}

#[derive(Debug, Clone)]
pub struct SignalsEnvConfig {
    pub fast_deadline_seconds: u64,
    pub medium_deadline_seconds: u64,
    pub slow_deadline_seconds: u64,
    pub cache_db_path: String,
    pub order_book_ttl_seconds: u64,
    pub spot_price_ttl_seconds: u64,
    pub onchain_api_key: Option<String>,
    pub coingecko_api_key: Option<String>,
    pub providers: HashMap<String, ProviderBlockConfig>,
    pub tracked_coins: Vec<String>,
    pub http_provider_base_url: String,
}

impl SignalsEnvConfig {
    pub fn provider_enabled(&self, name: &str) -> bool {
        self.providers.get(name).map(|p| p.enabled).unwrap_or(true)
    }

    pub fn provider_ttl_seconds(&self, name: &str) -> u64 {
        self.providers.get(name).map(|p| p.ttl_seconds).unwrap_or(300)
    }
}

#[derive(Debug, Clone)]
pub struct ObservabilityEnvConfig {
    pub metrics_push_interval_seconds: u64,
    pub metrics_prefix: String,
}

#[derive(Debug, Clone)]
pub struct WorkflowGraphConfig {
    pub enabled: bool,
    pub checkpoint_dir: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub hyperliquid: HyperliquidEnvConfig,
    pub llm: LlmEnvConfig,
    pub agent: AgentEnvConfig,
    pub risk: RiskEnvConfig,
    pub governance: GovernanceEnvConfig,
    pub signals: SignalsEnvConfig,
    pub observability: ObservabilityEnvConfig,
    /// Present only when the file carries a `[workflow_graph]` table.
    /// Checkpointing is an optional experimental front-end concern
    /// (`spec.md` §1); the core's scheduler contract holds identically
    /// whether or not this is set.
    pub workflow_graph: Option<WorkflowGraphConfig>,
}

const DEFAULT_PROVIDER_NAMES: &[&str] = &[
    "funding",
    "candles",
    "open_interest",
    "fear_greed",
    "token_unlocks",
    "macro_calendar",
    "asset_price_histories",
];

impl Config {
    /// Loads the config file named by `CONFIG_PATH` (default `config.toml`)
    /// relative to the current directory, falling back to file-less
    /// defaults-plus-environment if no such file exists — useful for tests
    /// and the mock-backed CLI surface (`spec.md` §1 scopes the venue/LLM
    /// adapters out of this crate, so there is often nothing file-based to
    /// configure beyond secrets already supplied via environment).
    pub fn load_default() -> Result<Self> {
        let path = env_var("CONFIG_PATH").unwrap_or_else(|| "config.toml".to_string());
        Self::load(Path::new(&path))
    }

    /// Loads and parses `path` as TOML, then resolves it against
    /// environment overrides and defaults. A missing file is not an error
    /// (yields an all-default raw config); a present-but-malformed file is.
    pub fn load(path: &Path) -> Result<Self> {
        let _ = dotenvy::dotenv();

        let raw = match std::fs::read_to_string(path) {
            Ok(content) => toml::from_str::<RawConfig>(&content)
                .with_context(|| format!("failed to parse config file {}", path.display()))?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => RawConfig::default(),
            Err(err) => {
                return Err(err).with_context(|| format!("failed to read config file {}", path.display()))
            }
        };

        Self::resolve(raw)
    }

    /// Parses `content` directly as TOML without touching the filesystem.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let raw: RawConfig = toml::from_str(content).context("failed to parse config TOML")?;
        Self::resolve(raw)
    }

    fn resolve(raw: RawConfig) -> Result<Self> {
        let hyperliquid = HyperliquidEnvConfig {
            account_address: raw
                .hyperliquid
                .account_address
                .or_else(|| env_var("HYPERLIQUID_ACCOUNT_ADDRESS"))
                .context("missing required config field: hyperliquid.account_address (or HYPERLIQUID_ACCOUNT_ADDRESS)")?,
            api_secret: raw
                .hyperliquid
                .secret
                .or_else(|| env_var("HYPERLIQUID_SECRET"))
                .context("missing required config field: hyperliquid.secret (or HYPERLIQUID_SECRET)")?,
            base_url: raw
                .hyperliquid
                .base_url
                .unwrap_or_else(|| "https://api.hyperliquid.xyz".to_string()),
        };

        let llm = LlmEnvConfig {
            provider: raw.llm.provider.unwrap_or_else(|| "anthropic".to_string()),
            model: raw.llm.model.unwrap_or_else(|| "claude-3-5-sonnet".to_string()),
            api_key: env_var("LLM_API_KEY").or(raw.llm.key),
            temperature: raw.llm.temperature.unwrap_or(0.2),
            max_tokens: raw.llm.max_tokens.unwrap_or(2048),
        };

        let agent = AgentEnvConfig {
            tick_interval_seconds: raw.agent.tick_interval_seconds.unwrap_or(10),
            max_retries: raw.agent.max_retries.unwrap_or(5),
            backoff_base_seconds: raw.agent.backoff_base_seconds.unwrap_or(2.0),
            log_level: env_var("LOG_LEVEL").or(raw.agent.log_level).unwrap_or_else(|| "info".to_string()),
            size_decimals: raw.agent.size_decimals.unwrap_or(4),
        };

        let risk = RiskEnvConfig {
            auto_transfer_enabled: raw.risk.auto_transfer_enabled.unwrap_or(true),
            target_initial_margin_ratio: raw.risk.target_initial_margin_ratio.unwrap_or(dec!(1.5)),
            min_perp_balance_usd: raw.risk.min_perp_balance_usd.unwrap_or(dec!(100)),
            target_spot_usdc_buffer_usd: raw.risk.target_spot_usdc_buffer_usd.unwrap_or(dec!(50)),
            min_margin_ratio: raw.risk.min_margin_ratio.unwrap_or(dec!(0.15)),
            liquidation_proximity_threshold: raw.risk.liquidation_proximity_threshold.unwrap_or(dec!(0.25)),
            daily_loss_limit_pct: raw.risk.daily_loss_limit_pct.unwrap_or(dec!(5.0)),
            emergency_reduction_pct: raw.risk.emergency_reduction_pct.unwrap_or(dec!(50.0)),
            min_order_notional_usd: raw.risk.min_order_notional_usd.unwrap_or(dec!(10.0)),
        };

        let governance = GovernanceEnvConfig {
            minimum_advantage_over_cost_bps: raw.governance.minimum_advantage_over_cost_bps.unwrap_or(dec!(50.0)),
            cooldown_after_change_minutes: raw.governance.cooldown_after_change_minutes.unwrap_or(60),
            partial_rotation_pct_per_cycle: raw.governance.partial_rotation_pct_per_cycle.unwrap_or(dec!(25.0)),
            state_persistence_path: raw.governance.state_persistence_path.unwrap_or_else(|| "state/governor.json".to_string()),
            completed_plans_log_path: raw.governance.completed_plans_log_path.unwrap_or_else(|| "state/completed_plans.jsonl".to_string()),
            confirmation_cycles_required: raw.governance.confirmation_cycles_required.unwrap_or(3),
            hysteresis_enter_threshold: raw.governance.hysteresis_enter_threshold.unwrap_or(0.7),
            hysteresis_exit_threshold: raw.governance.hysteresis_exit_threshold.unwrap_or(0.4),
            event_lock_window_hours_before: raw.governance.event_lock_window_hours_before.unwrap_or(2),
            event_lock_window_hours_after: raw.governance.event_lock_window_hours_after.unwrap_or(1),
            max_data_staleness_seconds: raw.governance.max_data_staleness_seconds.unwrap_or(300),
            max_api_failure_count: raw.governance.max_api_failure_count.unwrap_or(3),
            check_invalidation_triggers: raw.governance.check_invalidation_triggers.unwrap_or(true),
            fast_loop_interval_seconds: raw.governance.fast_loop_interval_seconds.unwrap_or(10),
            medium_loop_interval_minutes: raw.governance.medium_loop_interval_minutes.unwrap_or(30),
            slow_loop_interval_hours: raw.governance.slow_loop_interval_hours.unwrap_or(24),
        };

        let mut providers = HashMap::new();
        for name in DEFAULT_PROVIDER_NAMES {
            let block = raw.signals.providers.get(*name).cloned().unwrap_or_default();
            providers.insert(
                name.to_string(),
                ProviderBlockConfig {
                    enabled: block.enabled.unwrap_or(true),
                    ttl_seconds: block.ttl_seconds.unwrap_or(300),
                },
            );
        }
        // Carry through any provider block the file names beyond the
        // documented set rather than silently dropping it.
        for (name, block) in &raw.signals.providers {
            providers.entry(name.clone()).or_insert_with(|| ProviderBlockConfig {
                enabled: block.enabled.unwrap_or(true),
                ttl_seconds: block.ttl_seconds.unwrap_or(300),
            });
        }

        let signals = SignalsEnvConfig {
            fast_deadline_seconds: raw.signals.fast_deadline_seconds.unwrap_or(5),
            medium_deadline_seconds: raw.signals.medium_deadline_seconds.unwrap_or(15),
            slow_deadline_seconds: raw.signals.slow_deadline_seconds.unwrap_or(30),
            cache_db_path: raw.signals.cache_db_path.unwrap_or_else(|| "state/cache.db".to_string()),
            order_book_ttl_seconds: raw.signals.order_book_ttl_seconds.unwrap_or(5),
            spot_price_ttl_seconds: raw.signals.spot_price_ttl_seconds.unwrap_or(30),
            onchain_api_key: env_var("ONCHAIN_API_KEY").or(raw.signals.onchain_api_key),
            coingecko_api_key: env_var("COINGECKO_API_KEY").or(raw.signals.coingecko_api_key),
            providers,
            tracked_coins: raw.signals.tracked_coins.unwrap_or_else(|| vec!["BTC".to_string(), "ETH".to_string()]),
            http_provider_base_url: raw.signals.http_provider_base_url.unwrap_or_else(|| "https://example.invalid".to_string()),
        };

        let observability = ObservabilityEnvConfig {
            metrics_push_interval_seconds: raw.observability.metrics_push_interval_seconds.unwrap_or(60),
            metrics_prefix: raw.observability.metrics_prefix.unwrap_or_else(|| "governor_agent".to_string()),
        };

        let workflow_graph = raw.workflow_graph.map(|w| WorkflowGraphConfig {
            enabled: w.enabled.unwrap_or(false),
            checkpoint_dir: w.checkpoint_dir.unwrap_or_else(|| "state/checkpoints".to_string()),
        });

        Ok(Config {
            hyperliquid,
            llm,
            agent,
            risk,
            governance,
            signals,
            observability,
            workflow_graph,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn clear(keys: &[&str]) {
        for key in keys {
            unsafe {
                env::remove_var(key);
            }
        }
    }

    #[test]
    fn missing_required_field_fails_with_precise_message() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear(&["HYPERLIQUID_ACCOUNT_ADDRESS", "HYPERLIQUID_SECRET"]);
        let err = Config::from_toml_str("").unwrap_err();
        assert!(err.to_string().contains("hyperliquid.account_address"));
    }

    #[test]
    fn governance_defaults_match_spec() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear(&["HYPERLIQUID_ACCOUNT_ADDRESS", "HYPERLIQUID_SECRET"]);
        unsafe {
            env::set_var("HYPERLIQUID_ACCOUNT_ADDRESS", "0xabc");
            env::set_var("HYPERLIQUID_SECRET", "s3cr3t");
        }
        let cfg = Config::from_toml_str("").unwrap();
        assert_eq!(cfg.governance.minimum_advantage_over_cost_bps, dec!(50.0));
        assert_eq!(cfg.governance.cooldown_after_change_minutes, 60);
        assert_eq!(cfg.governance.partial_rotation_pct_per_cycle, dec!(25.0));
        assert_eq!(cfg.governance.hysteresis_enter_threshold, 0.7);
        assert_eq!(cfg.governance.hysteresis_exit_threshold, 0.4);
        clear(&["HYPERLIQUID_ACCOUNT_ADDRESS", "HYPERLIQUID_SECRET"]);
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear(&["HYPERLIQUID_ACCOUNT_ADDRESS", "HYPERLIQUID_SECRET"]);
        let toml = r#"
            [hyperliquid]
            account_address = "0xabc"
            secret = "s3cr3t"
            totally_unknown_field = "ignored"

            [some_unknown_section]
            foo = 1
        "#;
        let cfg = Config::from_toml_str(toml).unwrap();
        assert_eq!(cfg.hyperliquid.account_address, "0xabc");
    }

    #[test]
    fn file_values_populate_sections() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear(&["ONCHAIN_API_KEY", "COINGECKO_API_KEY", "LOG_LEVEL"]);
        let toml = r#"
            [hyperliquid]
            account_address = "0xabc"
            secret = "s3cr3t"
            base_url = "https://custom.example"

            [agent]
            log_level = "debug"

            [risk]
            daily_loss_limit_pct = 7.5

            [signals]
            tracked_coins = ["BTC", "ETH", "SOL"]

            [signals.providers.funding]
            enabled = false
            ttl_seconds = 120

            [workflow_graph]
            enabled = true
        "#;
        let cfg = Config::from_toml_str(toml).unwrap();
        assert_eq!(cfg.hyperliquid.base_url, "https://custom.example");
        assert_eq!(cfg.agent.log_level, "debug");
        assert_eq!(cfg.risk.daily_loss_limit_pct, dec!(7.5));
        assert_eq!(cfg.signals.tracked_coins, vec!["BTC", "ETH", "SOL"]);
        assert!(!cfg.signals.provider_enabled("funding"));
        assert_eq!(cfg.signals.provider_ttl_seconds("funding"), 120);
        assert!(cfg.workflow_graph.as_ref().unwrap().enabled);
    }

    #[test]
    fn env_overrides_secret_from_file() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear(&["LLM_API_KEY"]);
        unsafe {
            env::set_var("LLM_API_KEY", "env-key");
        }
        let toml = r#"
            [hyperliquid]
            account_address = "0xabc"
            secret = "s3cr3t"

            [llm]
            key = "file-key"
        "#;
        let cfg = Config::from_toml_str(toml).unwrap();
        assert_eq!(cfg.llm.api_key.as_deref(), Some("env-key"));
        clear(&["LLM_API_KEY"]);
    }
}
