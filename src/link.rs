// ─────────────────────────────────────────────────────────────────
//  link.rs — Session link to the coordination server
//
//  Connects over WebSocket, sends heartbeats and acks, turns inbound
//  frames into validated events on the dispatch channel and
//  reconnects on any failure. A separate monitor raises
//  connection events when the server goes quiet.
// ─────────────────────────────────────────────────────────────────

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{sleep, Instant};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::models::{parse_frame, Ack, Event, EventKind, Heartbeat};

/// Who we are, as announced in heartbeats.
#[derive(Debug, Clone)]
pub struct Identity {
    pub hostname: String,
    pub ip: String,
    pub client_name: String,
}

impl Identity {
    pub fn heartbeat(&self) -> Heartbeat {
        Heartbeat {
            kind: "heartbeat".into(),
            hostname: self.hostname.clone(),
            ip: self.ip.clone(),
            client: self.client_name.clone(),
            version: env!("CARGO_PKG_VERSION").to_owned(),
            timestamp: Utc::now(),
        }
    }
}

/// When the server was last heard from.
#[derive(Clone)]
pub struct LinkHealth {
    last_seen: Arc<Mutex<Instant>>,
}

impl LinkHealth {
    pub fn new() -> Self {
        Self {
            last_seen: Arc::new(Mutex::new(Instant::now())),
        }
    }

    pub fn touch(&self) {
        *self.last_seen.lock().unwrap_or_else(|p| p.into_inner()) = Instant::now();
    }

    pub fn silence(&self) -> Duration {
        self.last_seen.lock().unwrap_or_else(|p| p.into_inner()).elapsed()
    }
}

impl Default for LinkHealth {
    fn default() -> Self {
        Self::new()
    }
}

/// Keep a session with the server until cancelled.
pub async fn run_link(
    cfg: ServerConfig,
    identity: Identity,
    health: LinkHealth,
    events: mpsc::Sender<Event>,
    mut acks: mpsc::UnboundedReceiver<String>,
    cancel: CancellationToken,
) {
    info!("🔗 Session link enabled — server: {}", cfg.url);

    loop {
        info!("Connecting to {}...", cfg.url);

        let result = tokio::select! {
            _ = cancel.cancelled() => break,
            r = connect_and_serve(&cfg, &identity, &health, &events, &mut acks) => r,
        };

        match result {
            Ok(()) => warn!("Connection closed. Retrying in {}s...", cfg.reconnect_secs),
            Err(e) => error!("Session link error: {e}. Retrying in {}s...", cfg.reconnect_secs),
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = sleep(Duration::from_secs(cfg.reconnect_secs)) => {}
        }
    }
    info!("Session link stopped");
}

async fn connect_and_serve(
    cfg: &ServerConfig,
    identity: &Identity,
    health: &LinkHealth,
    events: &mpsc::Sender<Event>,
    acks: &mut mpsc::UnboundedReceiver<String>,
) -> anyhow::Result<()> {
    let (ws_stream, _response) = connect_async(&cfg.url).await?;
    info!("✅ Connected to {}", cfg.url);
    health.touch();

    let (mut write, mut read) = ws_stream.split();
    let mut heartbeat = tokio::time::interval(Duration::from_millis(cfg.heartbeat_interval_ms));

    loop {
        tokio::select! {
            _ = heartbeat.tick() => {
                let hb = serde_json::to_string(&identity.heartbeat())?;
                write.send(Message::Text(hb.into())).await?;
            }
            Some(id) = acks.recv() => {
                let ack = serde_json::to_string(&Ack { kind: "ack", id: &id })?;
                write.send(Message::Text(ack.into())).await?;
            }
            msg = read.next() => {
                let Some(msg) = msg else {
                    return Ok(());
                };
                let text = match msg? {
                    Message::Text(t) => t,
                    Message::Close(_) => return Ok(()),
                    _ => {
                        health.touch();
                        continue;
                    }
                };
                health.touch();
                debug!("Received message from server: {text}");

                match parse_frame(&text) {
                    Ok(Some(event)) => {
                        if events.send(event).await.is_err() {
                            anyhow::bail!("dispatcher is gone");
                        }
                    }
                    Ok(None) => {}
                    Err(e) => error!("Rejected message from server: {e}"),
                }
            }
        }
    }
}

/// Emit connection events when the server goes quiet or comes back.
pub async fn run_liveness_monitor(
    health: LinkHealth,
    timeout: Duration,
    events: mpsc::Sender<Event>,
    cancel: CancellationToken,
) {
    let mut lost = false;
    let mut tick = tokio::time::interval(Duration::from_secs(1));

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tick.tick() => {}
        }

        let silent = health.silence() > timeout;
        let name = match (silent, lost) {
            (true, false) => "disconnected",
            (false, true) => "connected",
            _ => continue,
        };
        lost = silent;

        info!("Server link {name}");
        if events.send(Event::local(EventKind::Connection, name)).await.is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EventSource;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    #[tokio::test(start_paused = true)]
    async fn monitor_reports_loss_and_recovery_once() {
        let health = LinkHealth::new();
        let (tx, mut rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        tokio::spawn(run_liveness_monitor(health.clone(), Duration::from_secs(5), tx, cancel.clone()));

        sleep(Duration::from_secs(8)).await;
        let e = rx.recv().await.unwrap();
        assert_eq!((e.kind, e.name.as_str(), e.source), (EventKind::Connection, "disconnected", EventSource::Local));
        assert!(rx.try_recv().is_err());

        health.touch();
        sleep(Duration::from_millis(1500)).await;
        let e = rx.recv().await.unwrap();
        assert_eq!(e.name, "connected");

        cancel.cancel();
    }

    #[tokio::test]
    async fn link_delivers_events_and_sends_heartbeats_and_acks() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel::<String>();
        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(tcp).await.unwrap();
            let event = r#"{"id":"e-7","event":"motion","type":"onvif","source":"server",
                            "timestamp":"2026-10-19T08:00:00Z"}"#;
            ws.send(Message::Text(event.to_owned().into())).await.unwrap();
            while let Some(Ok(Message::Text(t))) = ws.next().await {
                let _ = seen_tx.send(t.to_string());
            }
        });

        let cfg = ServerConfig {
            url: format!("ws://127.0.0.1:{port}"),
            client_name: "desk-1".into(),
            reconnect_secs: 1,
            heartbeat_interval_ms: 50,
            liveness_timeout_secs: 5,
        };
        let identity = Identity {
            hostname: "host".into(),
            ip: "127.0.0.1".into(),
            client_name: "desk-1".into(),
        };
        let (events_tx, mut events_rx) = mpsc::channel(8);
        let (acks_tx, acks_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let link = tokio::spawn(run_link(cfg, identity, LinkHealth::new(), events_tx, acks_rx, cancel.clone()));

        let event = events_rx.recv().await.unwrap();
        assert_eq!(event.id, "e-7");
        assert_eq!(event.kind, EventKind::Onvif);

        acks_tx.send(event.id.clone()).unwrap();

        let mut saw_heartbeat = false;
        let mut saw_ack = false;
        while !(saw_heartbeat && saw_ack) {
            let frame: serde_json::Value = serde_json::from_str(&seen_rx.recv().await.unwrap()).unwrap();
            match frame["type"].as_str() {
                Some("heartbeat") => {
                    assert_eq!(frame["client"], "desk-1");
                    saw_heartbeat = true;
                }
                Some("ack") => {
                    assert_eq!(frame["id"], "e-7");
                    saw_ack = true;
                }
                _ => {}
            }
        }

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), link).await.unwrap().unwrap();
    }
}
