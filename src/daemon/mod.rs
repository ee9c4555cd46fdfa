use crate::config::Config;
use crate::dispatch::Dispatcher;
use crate::health::HealthMonitor;
use anyhow::Result;
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

const INITIAL_BACKOFF_SECS: u64 = 1;
const MAX_BACKOFF_SECS: u64 = 60;

pub async fn run(config: Config) -> Result<()> {
    let dispatcher = Arc::new(Dispatcher::from_config(&config)?);

    // Interrupted claims go back to pending before any worker claims.
    let recovery = dispatcher.recover()?;
    crate::health::mark_component_ok("daemon");

    let shutdown = CancellationToken::new();
    let handles = spawn_components(&config, &dispatcher, &shutdown);

    println!("📬 Courier daemon started");
    println!("   Queue:    {}", config.queue_db_path().display());
    println!("   Workers:  {}", config.queue.workers);
    println!("   Recovered: {} in-flight entries", recovery.recovered.len());
    if recovery.reconciled > 0 {
        println!("   Reconciled: {} task(s)", recovery.reconciled);
    }
    println!("   Ctrl+C to stop");

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown requested; waiting for in-flight deliveries");
    crate::health::mark_component_error("daemon", "shutdown requested");
    shutdown.cancel();

    futures_util::future::join_all(handles).await;
    Ok(())
}

fn spawn_components(
    config: &Config,
    dispatcher: &Arc<Dispatcher>,
    shutdown: &CancellationToken,
) -> Vec<JoinHandle<()>> {
    let mut handles = Vec::new();
    let poll = Duration::from_millis(config.queue.poll_interval_ms.max(10));

    for index in 0..config.queue.workers {
        let dispatcher = Arc::clone(dispatcher);
        let token = shutdown.clone();
        handles.push(spawn_component_supervisor(
            format!("worker-{index}"),
            shutdown.clone(),
            move || run_worker(Arc::clone(&dispatcher), poll, token.clone()),
        ));
    }

    {
        let monitor = Arc::new(HealthMonitor::from_config(dispatcher.store(), config));
        let interval = Duration::from_secs(config.health.scan_interval_secs.max(1));
        let token = shutdown.clone();
        handles.push(spawn_component_supervisor(
            "health".to_string(),
            shutdown.clone(),
            move || run_health_monitor(Arc::clone(&monitor), interval, token.clone()),
        ));
    }

    if config.dedup.enabled {
        let dispatcher = Arc::clone(dispatcher);
        let interval = Duration::from_secs(config.dedup.sweep_interval_secs.max(1));
        let token = shutdown.clone();
        handles.push(spawn_component_supervisor(
            "dedup_sweep".to_string(),
            shutdown.clone(),
            move || run_sweeper(Arc::clone(&dispatcher), interval, token.clone()),
        ));
    } else {
        tracing::info!("Dedup disabled; sweeper not started");
    }

    handles
}

/// Restart `run_component` with exponential back-off until `shutdown` fires.
/// Components watch the token themselves so an in-flight step is never
/// dropped halfway.
fn spawn_component_supervisor<F, Fut>(
    name: String,
    shutdown: CancellationToken,
    mut run_component: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        let mut backoff = INITIAL_BACKOFF_SECS;

        loop {
            crate::health::mark_component_ok(&name);
            match run_component().await {
                Ok(()) if shutdown.is_cancelled() => {
                    tracing::debug!("Daemon component '{name}' stopped");
                    return;
                }
                Ok(()) => {
                    crate::health::mark_component_error(&name, "component exited unexpectedly");
                    tracing::warn!("Daemon component '{name}' exited unexpectedly");
                    backoff = INITIAL_BACKOFF_SECS;
                }
                Err(e) => {
                    crate::health::mark_component_error(&name, format!("{e:#}"));
                    tracing::error!("Daemon component '{name}' failed: {e:#}");
                }
            }

            crate::health::bump_component_restart(&name);
            tokio::select! {
                () = tokio::time::sleep(Duration::from_secs(backoff)) => {}
                () = shutdown.cancelled() => return,
            }
            backoff = backoff.saturating_mul(2).min(MAX_BACKOFF_SECS);
        }
    })
}

async fn run_worker(
    dispatcher: Arc<Dispatcher>,
    poll: Duration,
    shutdown: CancellationToken,
) -> Result<()> {
    while !shutdown.is_cancelled() {
        if dispatcher.process_next(None).await?.is_some() {
            continue;
        }
        tokio::select! {
            () = tokio::time::sleep(poll) => {}
            () = shutdown.cancelled() => break,
        }
    }
    Ok(())
}

async fn run_health_monitor(
    monitor: Arc<HealthMonitor>,
    every: Duration,
    shutdown: CancellationToken,
) -> Result<()> {
    let mut interval = tokio::time::interval(every);
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            () = shutdown.cancelled() => return Ok(()),
        }
        let report = monitor.scan_and_publish().await?;
        if report.is_healthy() {
            crate::health::mark_component_ok("health");
        } else {
            crate::health::mark_component_error(
                "health",
                format!(
                    "{} stuck, {} aged pending",
                    report.stuck.len(),
                    report.aged_pending.len()
                ),
            );
        }
    }
}

async fn run_sweeper(
    dispatcher: Arc<Dispatcher>,
    every: Duration,
    shutdown: CancellationToken,
) -> Result<()> {
    let mut interval = tokio::time::interval(every);
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            () = shutdown.cancelled() => return Ok(()),
        }
        dispatcher.sweep();
    }
}
