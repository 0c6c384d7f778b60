mod api;
mod camera;
mod config;
mod context;
mod coordinator;
mod effects;
mod killer;
mod ledger;
mod link;
mod models;
mod obs;
mod warn;

use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::api::build_router;
use crate::config::AppConfig;
use crate::context::AgentContext;
use crate::coordinator::Coordinator;
use crate::link::{Identity, LinkHealth};

const BANNER: &str = r#"
                 _       _                     _
 __      ____ _| |_ ___| |__  _ __   ___  ___| |_
 \ \ /\ / / _` | __/ __| '_ \| '_ \ / _ \/ __| __|
  \ V  V / (_| | || (__| | | | |_) | (_) \__ \ |_
   \_/\_/ \__,_|\__\___|_| |_| .__/ \___/|___/\__|
                             |_|
  Watch-Station Agent
"#;

/// Bound on how long each background loop gets to wind down.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(3);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── Logging ─────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "watchpost=info".into()),
        )
        .compact()
        .init();

    println!("{BANNER}");

    // ── Config ──────────────────────────────────────────────────
    let path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("WATCHPOST_CONFIG").ok());
    let cfg = AppConfig::load(path.as_deref())?;
    info!(
        "Config loaded — server {}, {} kill profile(s), OBS {}",
        cfg.server.url,
        cfg.kill.len(),
        if cfg.obs.enabled() { "enabled" } else { "disabled" }
    );

    // ── Identity ────────────────────────────────────────────────
    let hostname = hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown-pc".into());

    let ip = local_ip_address::local_ip()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "127.0.0.1".into());

    let identity = Identity {
        hostname: hostname.clone(),
        ip: ip.clone(),
        client_name: cfg.server.client_name.clone(),
    };
    info!("Host: {hostname} | IP: {ip} | Client: {}", identity.client_name);

    let ctx = AgentContext::build(cfg.clone(), identity.clone());
    let cancel = CancellationToken::new();
    let mut tasks: Vec<(&'static str, JoinHandle<()>)> = Vec::new();

    // ── Spawn: Event ledger sweeper ─────────────────────────────
    tasks.push((
        "ledger sweeper",
        tokio::spawn(ctx.ledger.clone().run_sweeper(cancel.clone())),
    ));

    // ── Spawn: Camera (re)connect loop ──────────────────────────
    {
        let ctx = ctx.clone();
        let cancel = cancel.clone();
        let retry = Duration::from_secs(cfg.camera.reconnect_secs);

        tasks.push((
            "camera",
            tokio::spawn(async move {
                loop {
                    if !ctx.camera.is_connected() && !ctx.camera.connect().await {
                        warn!("Camera unavailable. Retrying in {}s...", retry.as_secs());
                    }
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(retry) => {}
                    }
                }
                ctx.camera.close().await;
            }),
        ));
    }

    // ── Spawn: OBS watchdog ─────────────────────────────────────
    tasks.push((
        "obs watchdog",
        tokio::spawn(ctx.killer.clone().run_watchdog(cancel.clone())),
    ));

    // ── Spawn: Session link + liveness monitor ──────────────────
    let (events_tx, events_rx) = mpsc::channel(64);
    let (acks_tx, acks_rx) = mpsc::unbounded_channel();
    let health = LinkHealth::new();

    tasks.push((
        "session link",
        tokio::spawn(link::run_link(
            cfg.server.clone(),
            identity,
            health.clone(),
            events_tx.clone(),
            acks_rx,
            cancel.clone(),
        )),
    ));
    tasks.push((
        "liveness monitor",
        tokio::spawn(link::run_liveness_monitor(
            health,
            Duration::from_secs(cfg.server.liveness_timeout_secs),
            events_tx,
            cancel.clone(),
        )),
    ));

    // ── Spawn: Local status API ─────────────────────────────────
    if cfg.api.enabled {
        let router = build_router(ctx.clone());
        let addr = format!("127.0.0.1:{}", cfg.api.port);
        let listener = TcpListener::bind(&addr).await?;
        info!("API listening on http://{addr}");

        let cancel = cancel.clone();
        tasks.push((
            "api",
            tokio::spawn(async move {
                let serve = axum::serve(listener, router)
                    .with_graceful_shutdown(async move { cancel.cancelled().await });
                if let Err(e) = serve.await {
                    error!("API server crashed: {e}");
                }
            }),
        ));
    } else {
        info!("Local API disabled in config");
    }

    // ── Coordinator ─────────────────────────────────────────────
    let coordinator = Coordinator::new(ctx.clone(), Some(acks_tx));
    let dispatch = tokio::spawn(coordinator.run(events_rx, cancel.clone()));

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");
    cancel.cancel();

    tasks.push(("coordinator", dispatch));
    for (name, handle) in tasks {
        match tokio::time::timeout(SHUTDOWN_TIMEOUT, handle).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("{name} task failed: {e}"),
            Err(_) => warn!("{name} did not stop within {SHUTDOWN_TIMEOUT:?}"),
        }
    }

    ctx.warn.stop(warn::FORCE_STOP_ALL).await;
    info!("Bye");
    Ok(())
}
