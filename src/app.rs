use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;

use crate::{
    config, logging,
    relay::{Deps, Manager, NullAccessLogStore, NullGeoLookup, Hub},
};

pub async fn run(config_path: Option<PathBuf>, metrics_addr_override: Option<String>) -> anyhow::Result<()> {
    let resolved = config::resolve_config_path(config_path)?;
    let cfg = config::load_config(&resolved.path)
        .with_context(|| format!("load config: {}", resolved.path.display()))?;

    let _logging_guard = logging::init(&cfg.logging)?;

    tracing::info!(
        config = %resolved.path.display(),
        source = %resolved.source,
        rules = cfg.rules.len(),
        "relaykit: starting"
    );

    if let Some(addr) = metrics_addr_override.or(cfg.metrics_addr.clone()) {
        init_metrics(&addr)?;
    }

    let hub = Arc::new(Hub::new());
    let deps = Deps {
        geo: Arc::new(NullGeoLookup),
        store: Arc::new(NullAccessLogStore),
        broadcaster: hub.clone(),
    };

    let manager = Arc::new(Manager::new());
    for rule in &cfg.rules {
        if !rule.enabled {
            continue;
        }
        if let Err(err) = manager.start(rule.clone(), deps.clone()).await {
            tracing::warn!(rule_id = %rule.id, err = %err, "failed to start rule");
        }
    }

    shutdown_signal().await;
    tracing::info!("shutdown: signal received, stopping all rules");
    manager.stop_all();

    // Best-effort drain: detached per-flow/per-rule tasks observe the stop
    // signal at their next suspension point. There is nothing further to
    // join here (the manager does not hand back task handles), so this is
    // simply a grace window before the process exits.
    tokio::time::sleep(Duration::from_secs(1)).await;

    Ok(())
}

fn init_metrics(addr: &str) -> anyhow::Result<()> {
    use metrics_exporter_prometheus::PrometheusBuilder;

    let socket_addr: std::net::SocketAddr = addr
        .parse()
        .with_context(|| format!("invalid metrics_addr: {addr}"))?;

    PrometheusBuilder::new()
        .with_http_listener(socket_addr)
        .install()
        .context("install prometheus exporter")?;

    tracing::info!(addr = %socket_addr, "metrics: prometheus exporter listening");
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut term = signal(SignalKind::terminate()).expect("install SIGTERM handler");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
