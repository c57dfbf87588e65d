//! Simulated POS gateway.
//!
//! Wires configuration, tracing, metrics, the rate limiter, per-dependency guards, a
//! worker pool, and a coalesced menu cache together, then drives synthetic till traffic
//! through them until Ctrl-C or SIGTERM.
//!
//! ```text
//! CONFIG_ENV=development cargo run -p pos-gateway-demo
//! ```
//!
//! With `REDIS_URL` set, rate-limit windows live in Redis; otherwise in memory.

use anyhow::Context;
use pos_resilience_core::config::ResilienceConfig;
use pos_resilience_core::{CancellationToken, ResilienceError, WindowStore};
use pos_resilience_redis::{RedisWindowStore, connect};
use pos_resilience_runtime::bulkhead::BulkheadRegistry;
use pos_resilience_runtime::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
use pos_resilience_runtime::coalescer::RequestCoalescer;
use pos_resilience_runtime::guard::DependencyGuard;
use pos_resilience_runtime::memory_cache::MemoryCache;
use pos_resilience_runtime::memory_store::MemoryWindowStore;
use pos_resilience_runtime::metrics::MetricsServer;
use pos_resilience_runtime::object_pool::ObjectPool;
use pos_resilience_runtime::rate_limiter::{RateLimiter, RateLimiterConfig};
use pos_resilience_runtime::shutdown::{ShutdownCoordinator, wait_for_signal};
use pos_resilience_runtime::telemetry;
use pos_resilience_runtime::warming::{CacheWarmer, WarmupItem};
use pos_resilience_runtime::worker_pool::WorkerPool;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

const TILLS: u64 = 12;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Menu {
    store_id: u64,
    items: Vec<(String, u32)>,
}

/// Stand-in for the catalogue service.
async fn load_menu(store_id: u64) -> Result<Menu, String> {
    tokio::time::sleep(Duration::from_millis(40)).await;
    Ok(Menu {
        store_id,
        items: vec![
            ("flat white".to_string(), 420),
            ("croissant".to_string(), 350),
        ],
    })
}

/// Stand-in for the payment provider: fails every seventh authorisation.
async fn authorise(attempt: u64, amount_cents: u32) -> Result<String, String> {
    tokio::time::sleep(Duration::from_millis(15)).await;
    if attempt % 7 == 0 {
        return Err(format!("provider timeout authorising {amount_cents}c"));
    }
    Ok(format!("AUTH-{attempt:06}"))
}

fn breaker(name: &str, config: &ResilienceConfig) -> Arc<CircuitBreaker> {
    Arc::new(
        CircuitBreaker::new(name, CircuitBreakerConfig::from(&config.circuit_breaker))
            .with_observer(|breaker: &str, from: CircuitState, to: CircuitState| {
                tracing::info!(breaker, %from, %to, "Dependency health changed");
            }),
    )
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ResilienceConfig::from_env().context("Failed to load configuration")?;
    telemetry::init_from_settings(&config.observability);

    let mut metrics = None;
    if config.observability.metrics_enabled {
        let addr = config
            .observability
            .metrics_addr
            .parse()
            .context("Invalid metrics address")?;
        let mut server = MetricsServer::new(addr);
        server.serve()?;
        metrics = Some(server);
    }

    match config.redis.url.clone() {
        Some(url) => {
            let conn = connect(&url).await?;
            run(&config, RedisWindowStore::new(conn, config.redis.admission)).await?;
        }
        None => run(&config, MemoryWindowStore::new()).await?,
    }

    if let Some(rendered) = metrics.as_ref().and_then(MetricsServer::render) {
        tracing::debug!(bytes = rendered.len(), "Final metrics snapshot rendered");
    }
    Ok(())
}

async fn run<S>(config: &ResilienceConfig, store: S) -> anyhow::Result<()>
where
    S: WindowStore + 'static,
{
    tracing::info!(environment = %config.environment, "Starting POS gateway");

    let mut bulkheads = BulkheadRegistry::from_settings(&config.bulkheads);
    let limiter = Arc::new(RateLimiter::new(
        "gateway",
        store,
        RateLimiterConfig::from(&config.rate_limit),
    ));
    let payments = Arc::new(
        DependencyGuard::new(
            bulkheads.get_or_register("payments", config.bulkheads.capacity("payments")),
            breaker("payments", config),
        )
        .with_rate_limiter(Arc::clone(&limiter)),
    );

    let menu_cache = Arc::new(MemoryCache::<Menu>::from_settings(&config.coalescer));
    let report = CacheWarmer::new(Arc::clone(&menu_cache))
        .warm(
            &CancellationToken::new(),
            (1..=2)
                .map(|store_id| {
                    WarmupItem::new(format!("menu:{store_id}"), config.coalescer.ttl(), move || {
                        load_menu(store_id)
                    })
                })
                .collect(),
        )
        .await;
    let menus = Arc::new(
        RequestCoalescer::with_shared_cache("menus", menu_cache)
            .with_default_ttl(config.coalescer.ttl()),
    );
    tracing::info!(?report, "Menu cache warmed");

    let pool = Arc::new(WorkerPool::from_settings("checkout", &config.worker_pool));
    pool.start()?;

    let mut coordinator = ShutdownCoordinator::new(Duration::from_secs(10));
    coordinator.register(Arc::clone(&pool));

    let token = CancellationToken::new();
    let receipts = Arc::new(ObjectPool::string_builders(32));
    let traffic = tokio::spawn(simulate_traffic(
        Arc::clone(&pool),
        payments,
        menus,
        receipts,
        token.clone(),
    ));

    wait_for_signal().await;
    token.cancel();
    if let Err(e) = traffic.await {
        tracing::error!(error = %e, "Traffic simulator exited abnormally");
    }

    if let Err(failures) = coordinator.shutdown().await {
        anyhow::bail!("Unclean shutdown: {}", failures.join("; "));
    }
    tracing::info!("POS gateway stopped");
    Ok(())
}

async fn simulate_traffic<S>(
    pool: Arc<WorkerPool>,
    payments: Arc<DependencyGuard<S>>,
    menus: Arc<RequestCoalescer<Menu, String, MemoryCache<Menu>>>,
    receipts: Arc<ObjectPool<String>>,
    token: CancellationToken,
) where
    S: WindowStore + 'static,
{
    let attempts = AtomicU64::new(0);
    let mut tick = tokio::time::interval(Duration::from_millis(25));

    while !token.is_cancelled() {
        tokio::select! {
            () = token.cancelled() => break,
            _ = tick.tick() => {}
        }

        let attempt = attempts.fetch_add(1, Ordering::Relaxed) + 1;
        let till = format!("till-{}", attempt % TILLS);
        let store_id = attempt % 3 + 1;

        let menu = match menus
            .get_or_fetch(&format!("menu:{store_id}"), move || load_menu(store_id))
            .await
        {
            Ok(menu) => menu,
            Err(e) => {
                tracing::warn!(error = %e, "Menu unavailable");
                continue;
            }
        };
        let amount: u32 = menu.items.iter().map(|(_, price)| price).sum();

        let outcome = payments
            .call_on(&pool, &till, &token, move || authorise(attempt, amount))
            .await;

        let mut line = receipts.get();
        let _ = write!(line, "{till} store={} amount={amount}c ", menu.store_id);
        match outcome {
            Ok(code) => {
                let _ = write!(line, "approved {code}");
                tracing::info!(receipt = %line.as_str(), "Payment approved");
            }
            Err(ResilienceError::Inner(e)) => tracing::warn!(till = %till, error = %e, "Payment declined"),
            Err(ResilienceError::Cancelled) => break,
            Err(rejection) => tracing::warn!(till = %till, error = %rejection, "Payment rejected"),
        }
    }
}
