use anyhow::Context;
use refresh_core::config::Config;
use refresh_core::daemon::run_daemon;
use refresh_core::lock::{ProcessLock, DAEMON_HOLDER};
use refresh_core::orchestrator::Orchestrator;
use refresh_core::schedule::Scheduler;
use refresh_server::AppState;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::watch;

pub fn run(root: &Path, port: Option<u16>, no_server: bool) -> anyhow::Result<()> {
    let config = Config::load(root).context("failed to load config")?;
    let mut lock = ProcessLock::acquire(root, DAEMON_HOLDER)?;
    let orchestrator =
        Arc::new(Orchestrator::from_config(&config, root).context("failed to build pipeline")?);
    let mut scheduler = Scheduler::new(
        config.schedule.trigger()?,
        config.schedule.offset()?,
        config.schedule.heartbeat(),
    );
    if let Some(within) = config.schedule.health_check_within() {
        scheduler = scheduler.with_health_check(Arc::clone(orchestrator.notifier()), within);
    }
    let port = port.unwrap_or(config.server.port);

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async move {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let cancel_tx = Arc::new(cancel_tx);

        let server = if no_server {
            None
        } else {
            let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{port}"))
                .await
                .with_context(|| format!("failed to bind port {port}"))?;
            lock.set_port(listener.local_addr()?.port())
                .context("failed to advertise the control surface")?;
            let state = AppState::new(Arc::clone(&orchestrator)).with_schedule(scheduler.subscribe());
            let mut stop = cancel_rx.clone();
            let shutdown = async move {
                let _ = stop.wait_for(|cancelled| *cancelled).await;
            };
            Some(tokio::spawn(refresh_server::serve_on(state, listener, shutdown)))
        };

        tokio::spawn({
            let cancel_tx = Arc::clone(&cancel_tx);
            async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::info!("received Ctrl-C, shutting down");
                    let _ = cancel_tx.send(true);
                }
            }
        });

        run_daemon(orchestrator, scheduler, cancel_rx).await;
        let _ = cancel_tx.send(true);

        if let Some(server) = server {
            server.await.context("control surface task failed")??;
        }
        // Released only once nothing can execute steps.
        drop(lock);
        Ok::<(), anyhow::Error>(())
    })
}
