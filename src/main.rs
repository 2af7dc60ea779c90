//! banwatchd - runs the configured jails and reports ban tickets.

use banwatch::clock::Clock;
use banwatch::config::Config;
use banwatch::failmanager::FailManager;
use banwatch::metrics;
use banwatch::worker::{DEFAULT_STOP_TIMEOUT, FilterWorker};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

/// How often stale failures are dropped from the fail managers.
const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "banwatch.toml".to_string());

    let config = Config::load(&config_path);
    let json = config.as_ref().is_ok_and(|c| c.log_format.eq_ignore_ascii_case("json"));

    // Initialize tracing
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true);
    if json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    let config = config.map_err(|e| {
        error!(path = %config_path, error = %e, "Failed to load config");
        e
    })?;

    metrics::init();
    let clock = Clock::system();
    let dns = Arc::new(config.dns.build(clock.clone())?);

    let mut workers = Vec::new();
    let mut managers: Vec<(String, Arc<FailManager>)> = Vec::new();
    for jail in config.enabled_jails() {
        let (filter, source) = match jail.build(dns.clone(), clock.clone()) {
            Ok(parts) => parts,
            Err(e) => {
                error!(jail = %jail.name, error = %e, "Failed to start jail");
                continue;
            }
        };
        managers.push((jail.name.clone(), filter.fail_manager().clone()));
        workers.push(FilterWorker::spawn(filter, source));
    }
    if workers.is_empty() {
        anyhow::bail!("no jail could be started");
    }
    info!(jails = workers.len(), "banwatchd started");

    // Report tickets as they become ready; the ban action itself is external.
    let shutdown = CancellationToken::new();
    let mut reporters = JoinSet::new();
    for (jail, fm) in managers {
        let shutdown = shutdown.clone();
        reporters.spawn(async move {
            let mut cleanup = tokio::time::interval(CLEANUP_INTERVAL);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        debug!(jail = %jail, "Final metrics:\n{}", metrics::gather_metrics(Some(&jail)));
                        break;
                    }
                    _ = cleanup.tick() => {
                        fm.cleanup();
                        continue;
                    }
                    _ = fm.ticket_ready() => {}
                }
                while let Ok(ticket) = fm.to_ban() {
                    metrics::record_ticket(&jail);
                    warn!(
                        jail = %jail,
                        ip = %ticket.identity(),
                        attempts = ticket.attempt_count(),
                        "[{}] Ban {}",
                        jail,
                        ticket.identity()
                    );
                }
            }
        });
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    shutdown.cancel();
    for worker in workers {
        worker.stop(DEFAULT_STOP_TIMEOUT).await;
    }
    while reporters.join_next().await.is_some() {}

    info!("banwatchd stopped");
    Ok(())
}
