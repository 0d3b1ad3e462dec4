//! CLI entry point. Wires the governance core's components from the
//! structured config file and drives them via the scheduler, following
//! the teacher's `Config::from_env` -> build components -> spawn -> run
//! bootstrap shape (`src/main.rs`), generalized from a single GUI
//! application into the `start`/`status`/`gov-*` CLI surface `spec.md` §6
//! specifies. No production `Oracle`/`Exchange` adapter ships in this
//! crate (out of scope per `spec.md` §1): every subcommand runs against
//! `governor_agent::testing`'s in-memory doubles until a venue/LLM
//! adapter crate is wired in.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::Result;
use chrono::Duration as ChronoDuration;
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use governor_agent::application::cache::{Cache, SqliteCache};
use governor_agent::application::executor::{FundingPlannerConfig, RebalanceTargetConfig};
use governor_agent::application::governor::{GovernorConfig, StrategyGovernor};
use governor_agent::application::monitor::AccountMonitor;
use governor_agent::application::orchestrator::ProviderTask;
use governor_agent::application::persistence::{FileCompletedPlansLog, FileGovernorStateRepository};
use governor_agent::application::providers::{exchange_source, http_source, ApiFailureCounter, CircuitBreaker, CircuitBreakerConfig};
use governor_agent::application::regime::{RegimeDetector, RegimeDetectorConfig};
use governor_agent::application::scheduler::{Scheduler, SchedulerConfig, SignalTaskBuilder};
use governor_agent::application::scorekeeper::Scorekeeper;
use governor_agent::application::signal_processor::build_regime_signals;
use governor_agent::application::tripwire::{TripwireConfig, TripwireService};
use governor_agent::config::Config;
use governor_agent::domain::account::{AccountState, AssetIdentity, AssetIdentityRegistry};
use governor_agent::domain::ports::{Exchange, Oracle};
use governor_agent::domain::regime::RegimeClassification;
use governor_agent::domain::signals::SignalKind;
use governor_agent::testing::{MockExchange, MockOracle};

#[derive(Parser)]
#[command(name = "governor-agent", about = "Governance core for a multi-timescale crypto-derivatives trading agent")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Runs the fast/medium/slow scheduler until interrupted.
    Start {
        /// No effect on the scheduler itself; acknowledged for compatibility
        /// with the documented CLI surface (governance is always enforced).
        #[arg(long)]
        governed: bool,
        #[arg(long, conflicts_with = "sync")]
        r#async: bool,
        #[arg(long, conflicts_with = "async")]
        sync: bool,
    },
    /// Prints a single account snapshot.
    Status,
    /// Prints the active plan, if any.
    GovPlan,
    /// Runs one regime classification and prints it. The confirmation/
    /// hysteresis state this feeds lives only inside a running `start`
    /// process; this command is a point-in-time read, not a query against
    /// that process.
    GovRegime,
    /// Evaluates tripwires once against the current account snapshot.
    GovTripwire,
    /// Prints scorekeeper metrics for every completed plan.
    GovMetrics,
}

fn init_logging(log_level: &str) {
    let filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}

fn asset_registry(coins: &[String]) -> AssetIdentityRegistry {
    let mut registry = AssetIdentityRegistry::new();
    for coin in coins {
        registry.register(AssetIdentity {
            canonical_symbol: coin.clone(),
            wallet_alias: coin.clone(),
            perp_alias: coin.clone(),
            spot_alias: coin.clone(),
            default_quote: "USDC".to_string(),
        });
    }
    registry
}

/// Builds the fan-out task list for a given cadence. Mirrors `spec.md`
/// §2's "Data flow per tick": fast gets mid price + order book, medium
/// gets funding/candles/open interest, slow gets the macro/sentiment
/// calendar plus cross-asset histories. Venue-sourced tasks share one
/// circuit breaker (`spec.md` §4.2 treats the venue as a single source);
/// each HTTP provider gets its own.
fn build_signal_tasks(config: &Config, exchange: Arc<dyn Exchange>, cache: Arc<dyn Cache>) -> SignalTaskBuilder {
    let signals = config.signals.clone();
    let backoff_base = config.agent.backoff_base_seconds;
    let venue_breaker = Arc::new(CircuitBreaker::new("hyperliquid", CircuitBreakerConfig::default()));
    let http_client = http_source::build_http_client();
    let fear_greed_breaker = Arc::new(CircuitBreaker::new("fear_greed", CircuitBreakerConfig::default()));
    let unlocks_breaker = Arc::new(CircuitBreaker::new("token_unlocks", CircuitBreakerConfig::default()));
    let macro_breaker = Arc::new(CircuitBreaker::new("macro_calendar", CircuitBreakerConfig::default()));
    let history_breaker = Arc::new(CircuitBreaker::new("asset_price_histories", CircuitBreakerConfig::default()));

    Arc::new(move |kind: SignalKind| -> Vec<ProviderTask> {
        let mut tasks = Vec::new();
        match kind {
            SignalKind::Fast => {
                for coin in &signals.tracked_coins {
                    let mid = exchange_source::mid_price_task(exchange.clone(), venue_breaker.clone(), coin.clone(), backoff_base);
                    tasks.push(exchange_source::cache_wrapped(cache.clone(), format!("mid_price:{coin}"), signals.spot_price_ttl_seconds as f64, mid));
                    let (depth, spread) = exchange_source::l2_tasks(exchange.clone(), venue_breaker.clone(), coin.clone(), backoff_base);
                    tasks.push(exchange_source::cache_wrapped(cache.clone(), format!("order_book_depth:{coin}"), signals.order_book_ttl_seconds as f64, depth));
                    tasks.push(spread);
                }
            }
            SignalKind::Medium => {
                for coin in &signals.tracked_coins {
                    if signals.provider_enabled("funding") {
                        tasks.push(exchange_source::funding_rate_task(exchange.clone(), venue_breaker.clone(), coin.clone(), ChronoDuration::hours(8), backoff_base));
                    }
                    if signals.provider_enabled("candles") {
                        tasks.push(exchange_source::candles_task(exchange.clone(), venue_breaker.clone(), coin.clone(), "1h".to_string(), ChronoDuration::days(14), backoff_base));
                    }
                    if signals.provider_enabled("open_interest") {
                        tasks.push(exchange_source::open_interest_task(exchange.clone(), venue_breaker.clone(), coin.clone(), backoff_base));
                    }
                }
            }
            SignalKind::Slow => {
                if signals.provider_enabled("fear_greed") {
                    tasks.push(http_source::fear_greed_task(http_client.clone(), fear_greed_breaker.clone(), signals.http_provider_base_url.clone(), backoff_base));
                }
                if signals.provider_enabled("macro_calendar") {
                    tasks.push(http_source::macro_calendar_task(http_client.clone(), macro_breaker.clone(), signals.http_provider_base_url.clone(), backoff_base));
                }
                for coin in &signals.tracked_coins {
                    if signals.provider_enabled("token_unlocks") {
                        tasks.push(http_source::token_unlocks_task(http_client.clone(), unlocks_breaker.clone(), signals.http_provider_base_url.clone(), coin.clone(), backoff_base));
                    }
                    if signals.provider_enabled("asset_price_histories") {
                        tasks.push(http_source::asset_price_histories_task(http_client.clone(), history_breaker.clone(), signals.http_provider_base_url.clone(), coin.clone(), backoff_base));
                    }
                }
            }
        }
        tasks
    })
}

struct Components {
    monitor: Arc<AccountMonitor>,
    tripwire: Arc<TripwireService>,
    governor: Arc<StrategyGovernor>,
    regime_detector: RegimeDetector,
    scorekeeper: Arc<Scorekeeper>,
    oracle: Arc<dyn Oracle>,
    exchange: Arc<dyn Exchange>,
    signal_tasks: SignalTaskBuilder,
    api_failures: Arc<ApiFailureCounter>,
    scheduler_config: SchedulerConfig,
    rebalance_target_config: RebalanceTargetConfig,
    sz_decimals: u32,
    completed_plans_log: FileCompletedPlansLog,
}

async fn build(config: &Config) -> Result<Components> {
    let registry = asset_registry(&config.signals.tracked_coins);
    let seed_state = AccountState {
        portfolio_value: Decimal::ZERO,
        available_balance: Decimal::ZERO,
        account_value: Decimal::ZERO,
        total_initial_margin: Decimal::ZERO,
        positions: Vec::new(),
        spot_balances: HashMap::new(),
        timestamp: chrono::Utc::now().timestamp(),
        is_stale: false,
    };
    let exchange: Arc<dyn Exchange> = Arc::new(MockExchange::new(seed_state));
    let seed_classification = RegimeClassification {
        regime: governor_agent::domain::regime::RegimeKind::Unknown,
        confidence: 0.0,
        timestamp: chrono::Utc::now(),
        signals: governor_agent::domain::signals::RegimeSignals::default(),
        reasoning: "no classification collected yet".to_string(),
    };
    let oracle: Arc<dyn Oracle> = Arc::new(MockOracle::new(seed_classification));

    let cache = Arc::new(SqliteCache::connect(&config.signals.cache_db_path).await?);
    let signal_tasks = build_signal_tasks(config, exchange.clone(), cache.clone());

    let state_repository = Arc::new(FileGovernorStateRepository::new(config.governance.state_persistence_path.clone()));
    let governor = Arc::new(
        StrategyGovernor::load(
            GovernorConfig {
                minimum_advantage_over_cost_bps: config.governance.minimum_advantage_over_cost_bps,
                cooldown_after_change_minutes: config.governance.cooldown_after_change_minutes,
                partial_rotation_pct_per_cycle: config.governance.partial_rotation_pct_per_cycle,
            },
            state_repository,
        )
        .await,
    );

    let tripwire = Arc::new(TripwireService::new(TripwireConfig {
        min_margin_ratio: config.risk.min_margin_ratio,
        liquidation_proximity_threshold: config.risk.liquidation_proximity_threshold,
        daily_loss_limit_pct: config.risk.daily_loss_limit_pct,
        check_invalidation_triggers: config.governance.check_invalidation_triggers,
        max_data_staleness_seconds: config.governance.max_data_staleness_seconds,
        max_api_failure_count: config.governance.max_api_failure_count,
    }));

    let regime_detector = RegimeDetector::new(RegimeDetectorConfig {
        confirmation_cycles_required: config.governance.confirmation_cycles_required,
        hysteresis_enter_threshold: config.governance.hysteresis_enter_threshold,
        hysteresis_exit_threshold: config.governance.hysteresis_exit_threshold,
        event_lock_window_hours_before: config.governance.event_lock_window_hours_before,
        event_lock_window_hours_after: config.governance.event_lock_window_hours_after,
    });

    let monitor = Arc::new(AccountMonitor::new(exchange.clone(), registry, StdDuration::from_secs(config.signals.spot_price_ttl_seconds)));
    let scorekeeper = Arc::new(Scorekeeper::new());
    let api_failures = Arc::new(ApiFailureCounter::default());
    let completed_plans_log = FileCompletedPlansLog::new(config.governance.completed_plans_log_path.clone());

    let scheduler_config = SchedulerConfig {
        fast_interval: StdDuration::from_secs(config.agent.tick_interval_seconds),
        medium_interval: ChronoDuration::minutes(config.governance.medium_loop_interval_minutes),
        slow_interval: ChronoDuration::hours(config.governance.slow_loop_interval_hours),
        fast_deadline: StdDuration::from_secs(config.signals.fast_deadline_seconds),
        medium_deadline: StdDuration::from_secs(config.signals.medium_deadline_seconds),
        slow_deadline: StdDuration::from_secs(config.signals.slow_deadline_seconds),
        emergency_reduction_pct: config.risk.emergency_reduction_pct,
        auto_transfer_enabled: config.risk.auto_transfer_enabled,
        funding: FundingPlannerConfig {
            target_initial_margin_ratio: config.risk.target_initial_margin_ratio,
            min_perp_balance_usd: config.risk.min_perp_balance_usd,
            target_spot_usdc_buffer_usd: config.risk.target_spot_usdc_buffer_usd,
        },
    };

    Ok(Components {
        monitor,
        tripwire,
        governor,
        regime_detector,
        scorekeeper,
        oracle,
        exchange,
        signal_tasks,
        api_failures,
        scheduler_config,
        rebalance_target_config: RebalanceTargetConfig { min_order_notional_usd: config.risk.min_order_notional_usd },
        sz_decimals: config.agent.size_decimals,
        completed_plans_log,
    })
}

async fn run_start(config: Config) -> Result<()> {
    let components = build(&config).await?;
    let scheduler = Arc::new(Scheduler::new(
        components.monitor,
        components.tripwire,
        components.governor,
        components.regime_detector,
        components.scorekeeper,
        components.oracle,
        components.exchange,
        components.signal_tasks,
        components.api_failures,
        components.scheduler_config,
        components.rebalance_target_config,
        components.sz_decimals,
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler_handle = tokio::spawn(scheduler.run(shutdown_rx));

    tokio::signal::ctrl_c().await?;
    info!("SIGINT received, signaling scheduler to stop after its current tick");
    let _ = shutdown_tx.send(true);
    let _ = scheduler_handle.await;
    Ok(())
}

async fn run_status(config: Config) -> Result<()> {
    let components = build(&config).await?;
    let snapshot = components.monitor.snapshot().await?;
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}

async fn run_gov_plan(config: Config) -> Result<()> {
    let components = build(&config).await?;
    match components.governor.active_plan().await {
        Some(plan) => println!("{}", serde_json::to_string_pretty(&plan)?),
        None => println!("no active plan"),
    }
    Ok(())
}

async fn run_gov_regime(config: Config) -> Result<()> {
    let components = build(&config).await?;
    let bundle = governor_agent::application::orchestrator::collect(
        governor_agent::application::orchestrator::SignalRequest::new(SignalKind::Medium),
        (components.signal_tasks)(SignalKind::Medium),
    )
    .await;
    let regime_signals = build_regime_signals(&bundle, &[]);
    let now = chrono::Utc::now();
    let oracle_result = components.oracle.classify_regime(&regime_signals).await?;
    let classification: RegimeClassification =
        components.regime_detector.classify_regime(now, &regime_signals, &[], || oracle_result.classification.clone());
    println!("{}", serde_json::to_string_pretty(&classification)?);
    Ok(())
}

async fn run_gov_tripwire(config: Config) -> Result<()> {
    let components = build(&config).await?;
    let snapshot = components.monitor.snapshot().await?;
    let active_plan = components.governor.active_plan().await;
    let events = components.tripwire.check_all(&snapshot, active_plan.as_ref(), components.api_failures.count());
    if events.is_empty() {
        println!("no tripwire events");
    } else {
        println!("{}", serde_json::to_string_pretty(&events)?);
    }
    Ok(())
}

async fn run_gov_metrics(config: Config) -> Result<()> {
    let components = build(&config).await?;
    let completed = components.completed_plans_log.read_all().await?;
    println!("{}", serde_json::to_string_pretty(&completed)?);
    Ok(())
}

fn main() -> std::process::ExitCode {
    let cli = Cli::parse();

    let config = match Config::load_default() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("config error: {err:#}");
            return std::process::ExitCode::from(1);
        }
    };
    init_logging(&config.agent.log_level);

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("failed to build tokio runtime: {err:#}");
            return std::process::ExitCode::from(1);
        }
    };

    let is_start = matches!(cli.command, Command::Start { .. });
    let result = runtime.block_on(async move {
        match cli.command {
            Command::Start { governed: _, r#async: _, sync: _ } => run_start(config).await,
            Command::Status => run_status(config).await,
            Command::GovPlan => run_gov_plan(config).await,
            Command::GovRegime => run_gov_regime(config).await,
            Command::GovTripwire => run_gov_tripwire(config).await,
            Command::GovMetrics => run_gov_metrics(config).await,
        }
    });

    match result {
        // `run_start` only ever returns `Ok` after observing SIGINT (its one
        // exit path); every other command returning `Ok` is a normal
        // successful read. Exit code 130 on interrupt per the documented
        // CLI surface.
        Ok(()) if is_start => std::process::ExitCode::from(130),
        Ok(()) => std::process::ExitCode::from(0),
        Err(err) => {
            error!(error = %err, "command failed");
            std::process::ExitCode::from(1)
        }
    }
}
