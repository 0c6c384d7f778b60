use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, error, info};

use crate::config::WarnConfig;
use crate::effects::{Delivery, SideEffectUnit, UnitLauncher, UnitSpec};

/// Key that dismisses whatever alert is active.
pub const FORCE_STOP_ALL: &str = "_force_stop_all";

/// How long a killed unit gets to go away before we move on.
const JOIN_TIMEOUT: Duration = Duration::from_millis(100);

/// Mutable alert state. Only touched with the session lock held.
struct WarnState {
    current_key: Option<String>,
    last_warned_at: Option<Instant>,
    overlay: Option<Box<dyn SideEffectUnit>>,
    audio: Option<Box<dyn SideEffectUnit>>,
    pending_image: Option<Vec<u8>>,
}

/// Supervises the overlay and audio units of the current alert.
///
/// Non-priority alerts are debounced by a cooldown; priority alerts replace
/// whatever is running. At most one overlay and one audio unit are alive.
#[derive(Clone)]
pub struct WarnSession {
    state: Arc<Mutex<WarnState>>,
    launcher: Arc<dyn UnitLauncher>,
    duration: Duration,
    cooldown: Duration,
}

impl WarnSession {
    pub fn new(cfg: &WarnConfig, launcher: Arc<dyn UnitLauncher>) -> Self {
        Self::with_timing(launcher, cfg.duration(), cfg.cooldown())
    }

    pub fn with_timing(launcher: Arc<dyn UnitLauncher>, duration: Duration, cooldown: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(WarnState {
                current_key: None,
                last_warned_at: None,
                overlay: None,
                audio: None,
                pending_image: None,
            })),
            launcher,
            duration,
            cooldown,
        }
    }

    /// Raise an alert. Returns whether side effects were started.
    pub async fn start(
        &self,
        key: &str,
        title: &str,
        message: Option<&str>,
        no_audio: bool,
        is_priority: bool,
    ) -> bool {
        let mut state = self.state.lock().await;

        if is_priority {
            info!("Priority warning '{key}' received");
            self.stop_all(&mut state).await;
        } else if let Some(last) = state.last_warned_at {
            if last.elapsed() < self.cooldown {
                info!(
                    "Ongoing warning '{}' within cooldown. Ignoring '{key}'",
                    state.current_key.as_deref().unwrap_or("")
                );
                return false;
            }
        }

        debug!("Starting warning sequence '{key}'");
        state.current_key = Some(key.to_owned());
        state.last_warned_at = Some(Instant::now());

        if !no_audio {
            let spec = UnitSpec::Audio {
                lifetime: self.duration,
            };
            state.audio = self.restart(state.audio.take(), spec).await;
        }

        let spec = UnitSpec::Overlay {
            title: title.to_owned(),
            message: message.map(str::to_owned),
            lifetime: self.duration,
        };
        state.pending_image = None;
        state.overlay = self.restart(state.overlay.take(), spec).await;

        true
    }

    /// Dismiss the alert `key`, or everything with [`FORCE_STOP_ALL`].
    pub async fn stop(&self, key: &str) -> bool {
        let mut state = self.state.lock().await;

        if key == FORCE_STOP_ALL || state.current_key.as_deref() == Some(key) {
            self.stop_all(&mut state).await;
            true
        } else {
            info!(
                "Tried to dismiss non-matching event. Ignoring — given: {key}, current: {}",
                state.current_key.as_deref().unwrap_or("<none>")
            );
            false
        }
    }

    /// Best-effort: hand a new frame to the live overlay, if any.
    pub async fn update_image(&self, image: Vec<u8>) {
        let mut state = self.state.lock().await;
        let WarnState {
            overlay,
            pending_image,
            ..
        } = &mut *state;

        let Some(unit) = overlay.as_ref() else {
            *pending_image = None;
            return;
        };

        // An older frame still waiting goes first; if it still can't get
        // through, the newer frame replaces it.
        if let Some(old) = pending_image.take() {
            if let Delivery::Full(_) = unit.deliver(old) {
                *pending_image = Some(image);
                return;
            }
        }

        match unit.deliver(image) {
            Delivery::Sent => {}
            Delivery::Full(image) => *pending_image = Some(image),
            Delivery::Closed => debug!("Overlay is not taking images; frame dropped"),
        }
    }

    pub async fn current_key(&self) -> Option<String> {
        self.state.lock().await.current_key.clone()
    }

    /// True while an overlay unit is held for the current alert.
    pub async fn is_alerting(&self) -> bool {
        self.state.lock().await.overlay.is_some()
    }

    async fn stop_all(&self, state: &mut WarnState) {
        debug!("Stopping warning sequence");
        kill_unit(state.overlay.take(), "overlay").await;
        kill_unit(state.audio.take(), "audio").await;
        state.pending_image = None;
        state.current_key = None;
    }

    async fn restart(
        &self,
        previous: Option<Box<dyn SideEffectUnit>>,
        spec: UnitSpec,
    ) -> Option<Box<dyn SideEffectUnit>> {
        let label = spec.label();
        if previous.is_some() {
            debug!("{label} already running. Killing...");
        }
        kill_unit(previous, label).await;

        match self.launcher.launch(spec) {
            Ok(unit) => Some(unit),
            Err(e) => {
                error!("Failed to start {label}: {e}");
                None
            }
        }
    }
}

async fn kill_unit(unit: Option<Box<dyn SideEffectUnit>>, label: &str) {
    let Some(mut unit) = unit else {
        debug!("{label} is not running. Nothing to kill.");
        return;
    };
    if let Err(e) = unit.terminate(JOIN_TIMEOUT).await {
        debug!("Error killing {label}: {e}. It might be already dead.");
    }
}
