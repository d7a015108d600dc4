mod backtesting;
mod config;
mod database;
mod events;
mod evolution;
mod exchange;
mod execution;
mod models;
mod registry;
mod scheduler;
mod scoring;
mod services;
mod signals;
mod strategies;
mod utils;

use anyhow::{Context, Result};
use dotenv::dotenv;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, level_filters::LevelFilter, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use config::{Config, SettingsStore};
use events::EvolutionLog;
use evolution::EvolutionEngine;
use exchange::{ExchangeExecutor, KlineInterval, MarketCache, MarketDataGateway, SimExchange};
use execution::TradeExecutor;
use registry::StrategyRegistry;
use scheduler::TierScheduler;
use scoring::ScoringService;
use services::OpsService;
use signals::SignalEngine;

const CANDLE_INTERVAL: KlineInterval = KlineInterval::OneMinute;
const CANDLE_HISTORY: usize = 200;
const FEED_POLL: Duration = Duration::from_secs(2);
const EVENT_LOG_CAPACITY: usize = 4096;

/// Engine services wired at startup.
struct AppServices {
    ops: OpsService,
    cache: Arc<MarketCache>,
    symbols: Vec<String>,
}

impl AppServices {
    async fn new(config: &Config) -> Result<Self> {
        // Database is optional: without one the engine runs fully in-memory,
        // which is the paper-trading development mode.
        let database = match &config.database_url {
            Some(url) => Some(Arc::new(
                database::create_connection(url)
                    .await
                    .context("Failed to initialize database")?,
            )),
            None => {
                warn!("No DATABASE_URL configured; running in-memory");
                None
            }
        };

        let settings = Arc::new(SettingsStore::new(database.clone()));
        settings.load().await.context("Failed to load settings")?;

        let log = EvolutionLog::new(EVENT_LOG_CAPACITY, database.clone());

        // The built-in connector is the deterministic simulator; live
        // exchange adapters plug in through the same pair of traits.
        let connector = Arc::new(SimExchange::new());
        let cache = Arc::new(MarketCache::new(
            Arc::clone(&connector) as Arc<dyn MarketDataGateway>,
            CANDLE_HISTORY,
        ));

        let registry = Arc::new(StrategyRegistry::new(database.clone()));
        if let Some(db) = &database {
            registry
                .load(db.as_ref())
                .await
                .context("Failed to load strategy population")?;
        }

        let scoring = Arc::new(ScoringService::new(Arc::clone(&settings)));
        let engine = Arc::new(SignalEngine::new(
            Arc::clone(&cache) as Arc<dyn MarketDataGateway>,
            CANDLE_INTERVAL,
            CANDLE_HISTORY,
        ));

        let (pressure_tx, pressure_rx) = mpsc::unbounded_channel();
        let executor = TradeExecutor::new(
            Arc::clone(&connector) as Arc<dyn ExchangeExecutor>,
            Arc::clone(&cache) as Arc<dyn MarketDataGateway>,
            Arc::clone(&registry),
            Arc::clone(&scoring),
            Arc::clone(&settings),
            Arc::clone(&log),
            database.clone(),
            Some(pressure_tx),
        );

        let scheduler = TierScheduler::new(
            Arc::clone(&registry),
            Arc::clone(&scoring),
            Arc::clone(&settings),
            Arc::clone(&engine),
            executor,
            Arc::clone(&log),
            pressure_rx,
        );

        let symbols = config.symbol_list();
        let evolution = EvolutionEngine::new(
            Arc::clone(&registry),
            Arc::clone(&scoring),
            Arc::clone(&settings),
            Arc::clone(&cache) as Arc<dyn MarketDataGateway>,
            Arc::clone(&log),
            symbols.clone(),
            CANDLE_INTERVAL,
            CANDLE_HISTORY,
        );

        let ops = OpsService::new(registry, settings, scheduler, evolution, log);

        Ok(Self {
            ops,
            cache,
            symbols,
        })
    }

    /// Start the feed reader, scheduler, and evolution loop.
    fn start_background_services(&self) {
        info!("Starting market feed for {:?}", self.symbols);
        self.cache
            .spawn_feed(self.symbols.clone(), CANDLE_INTERVAL, FEED_POLL);

        info!("Starting strategy engine");
        self.ops.start();
    }
}

/// Initialize logging system
fn init_logging() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    info!("Logging system initialized");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    init_logging()?;

    let config = Config::from_env().context("Failed to load configuration")?;
    let services = AppServices::new(&config).await?;

    services.start_background_services();
    info!("Engine running; Ctrl-C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;

    info!("Shutting down");
    services.ops.stop();
    // Give workers a moment to drain in-flight evaluations.
    tokio::time::sleep(Duration::from_secs(1)).await;
    Ok(())
}
