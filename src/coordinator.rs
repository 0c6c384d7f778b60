use std::sync::{Arc, Mutex};
use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::context::AgentContext;
use crate::models::{Event, EventKind};
use crate::warn::FORCE_STOP_ALL;

const CONNECTION_LOST: &str = "connection_lost";
const ZERO_CLIENT: &str = "zero_client";
const MOTION: &str = "motion";

/// What the coordinator did with one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Same emission id already handled.
    Duplicate,
    /// An equivalent situation is still active.
    Suppressed,
    Alerted,
    /// Alert call made but the warn session held it back (cooldown).
    Debounced,
    Dismissed,
    Remediated,
    RemediationFailed,
    Recorded,
}

/// Sequential consumer of inbound events.
pub struct Coordinator {
    ctx: Arc<AgentContext>,
    acks: Option<mpsc::UnboundedSender<String>>,
    relay: Mutex<Option<JoinHandle<()>>>,
}

impl Coordinator {
    pub fn new(ctx: Arc<AgentContext>, acks: Option<mpsc::UnboundedSender<String>>) -> Self {
        Self {
            ctx,
            acks,
            relay: Mutex::new(None),
        }
    }

    /// Process events one at a time until cancelled or the channel closes.
    pub async fn run(self, mut events: mpsc::Receiver<Event>, cancel: CancellationToken) {
        info!("Coordinator started");
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                e = events.recv() => match e {
                    Some(e) => e,
                    None => break,
                },
            };

            let id = event.id.clone();
            let disposition = self.handle(event).await;
            debug!("Event {id} → {disposition:?}");
        }

        if let Some(relay) = self.relay.lock().unwrap_or_else(|p| p.into_inner()).take() {
            relay.abort();
        }
        info!("Coordinator stopped");
    }

    pub async fn handle(&self, event: Event) -> Disposition {
        let ledger = &self.ctx.ledger;

        // Redeliveries usually mean our ack was lost, so ack every time
        self.ack(&event.id);
        if ledger.seen_id(&event.id) {
            debug!("Redelivered event {} ignored", event.id);
            return Disposition::Duplicate;
        }

        info!(
            "Event {}/{} from {:?} ({})",
            event.kind.as_str(),
            event.name,
            event.source,
            event.id
        );

        let kind = event.kind;
        match (kind, event.name.as_str()) {
            (EventKind::Connection, "disconnected") => {
                self.alert_once(event, CONNECTION_LOST, "CONNECTION LOST", None, false)
                    .await
            }
            (EventKind::Connection, "connected") => {
                ledger.resolve(EventKind::Connection, "disconnected");
                ledger.push(event);
                self.ctx.warn.stop(CONNECTION_LOST).await;
                Disposition::Dismissed
            }
            (EventKind::Client, "zero_client") => {
                self.alert_once(
                    event,
                    ZERO_CLIENT,
                    "NO CLIENTS",
                    Some("No watch clients connected"),
                    true,
                )
                .await
            }
            (EventKind::Onvif, "motion") | (EventKind::Onvif, "movement") => {
                let disposition = self
                    .alert_once(event, MOTION, "MOVEMENT DETECTED", None, false)
                    .await;
                if disposition == Disposition::Alerted {
                    self.start_relay();
                }
                disposition
            }
            (EventKind::User, "kill") => {
                let profile = event
                    .data_str("profile")
                    .or_else(|| event.data_str("killType"))
                    .unwrap_or("default")
                    .to_owned();
                ledger.push(event);
                match self.ctx.killer.execute(&profile).await {
                    Ok(report) => {
                        info!(
                            "Profile '{profile}' done: {} process target(s), {} command(s) started, {} rejected, recording {:?}",
                            report.terminated.len(),
                            report.commands_started,
                            report.commands_rejected,
                            report.recording
                        );
                        Disposition::Remediated
                    }
                    Err(e) => {
                        error!("Remediation failed: {e}");
                        Disposition::RemediationFailed
                    }
                }
            }
            (EventKind::User, "dismiss") => {
                let key = event.data_str("key").unwrap_or(FORCE_STOP_ALL).to_owned();
                ledger.push(event);
                if self.ctx.warn.stop(&key).await {
                    Disposition::Dismissed
                } else {
                    Disposition::Recorded
                }
            }
            _ => {
                debug!("No reaction configured for {}/{}", kind.as_str(), event.name);
                ledger.push(event);
                Disposition::Recorded
            }
        }
    }

    /// Raise `key` unless an equivalent event is still in the ledger.
    async fn alert_once(
        &self,
        event: Event,
        key: &str,
        title: &str,
        message: Option<&str>,
        no_audio: bool,
    ) -> Disposition {
        let ledger = &self.ctx.ledger;
        // Matched on kind and name only: a server report and a self-detected
        // one describe the same situation
        let active = ledger.is_active(event.kind, Some(&event.name));
        // Suppressed events still extend the window
        ledger.push(event);

        if active {
            info!("'{key}' is already active; suppressed");
            return Disposition::Suppressed;
        }

        if self.ctx.warn.start(key, title, message, no_audio, false).await {
            Disposition::Alerted
        } else {
            Disposition::Debounced
        }
    }

    fn ack(&self, id: &str) {
        if let Some(acks) = &self.acks {
            let _ = acks.send(id.to_owned());
        }
    }

    /// Feed fresh camera frames to the motion overlay while it is up.
    fn start_relay(&self) {
        let ctx = self.ctx.clone();
        let handle = tokio::spawn(async move {
            let interval = Duration::from_millis(ctx.config.warn.image_interval_ms);
            let deadline = Instant::now() + ctx.config.warn.duration();
            let mut last_hash = None;

            while Instant::now() < deadline {
                if ctx.warn.current_key().await.as_deref() != Some(MOTION) {
                    break;
                }

                let camera = ctx.camera.clone();
                let quality = ctx.config.camera.quality;
                match tokio::task::spawn_blocking(move || camera.snapshot(quality)).await {
                    Ok(Some(jpeg)) => {
                        // Skip if frame is identical to previous
                        let hash = Sha256::digest(&jpeg);
                        if last_hash.as_ref() != Some(&hash) {
                            last_hash = Some(hash);
                            ctx.warn.update_image(jpeg).await;
                        }
                    }
                    Ok(None) => debug!("No camera frame for the overlay"),
                    Err(e) => warn!("Snapshot task panicked: {e}"),
                }

                tokio::time::sleep(interval).await;
            }
        });

        let previous = self
            .relay
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
    }
}
