// ─────────────────────────────────────────────────────────────────
//  effects.rs — Alert side-effect units
//
//  An overlay or audio unit is an isolated, independently killable
//  execution unit. The shipped launcher runs helper programs as OS
//  processes; overlay image updates go to the helper's stdin as
//  length-prefixed frames (u32 big-endian length, then JPEG bytes).
// ─────────────────────────────────────────────────────────────────

use std::process::Stdio;
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Frames queued for an overlay before new ones are refused.
const IMAGE_CHANNEL_CAPACITY: usize = 2;

/// What to launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitSpec {
    Overlay {
        title: String,
        message: Option<String>,
        lifetime: Duration,
    },
    Audio {
        lifetime: Duration,
    },
}

impl UnitSpec {
    pub fn label(&self) -> &'static str {
        match self {
            UnitSpec::Overlay { .. } => "overlay",
            UnitSpec::Audio { .. } => "audio",
        }
    }
}

/// Outcome of handing an image to a unit.
#[derive(Debug)]
pub enum Delivery {
    Sent,
    /// Channel full; the frame is handed back.
    Full(Vec<u8>),
    /// Unit does not take images or has gone away.
    Closed,
}

/// A running side-effect unit.
pub trait SideEffectUnit: Send {
    fn deliver(&self, image: Vec<u8>) -> Delivery;

    /// Kill immediately and wait at most `join_timeout` for it to go.
    /// Killing a unit that already exited is not an error.
    fn terminate(&mut self, join_timeout: Duration) -> BoxFuture<'_, anyhow::Result<()>>;
}

/// Starts side-effect units.
pub trait UnitLauncher: Send + Sync {
    fn launch(&self, spec: UnitSpec) -> anyhow::Result<Box<dyn SideEffectUnit>>;
}

// ── OS process implementation ───────────────────────────────────

/// Launches the configured overlay/audio helper programs.
pub struct ProcessLauncher {
    overlay_command: Vec<String>,
    audio_command: Vec<String>,
}

impl ProcessLauncher {
    pub fn new(overlay_command: Vec<String>, audio_command: Vec<String>) -> Self {
        Self {
            overlay_command,
            audio_command,
        }
    }

    fn build(&self, spec: &UnitSpec) -> anyhow::Result<Command> {
        let (base, extra) = match spec {
            UnitSpec::Overlay {
                title,
                message,
                lifetime,
            } => {
                let mut args = vec![
                    "--title".to_owned(),
                    title.clone(),
                    "--duration".to_owned(),
                    lifetime.as_secs().to_string(),
                ];
                if let Some(m) = message {
                    args.push("--message".to_owned());
                    args.push(m.clone());
                }
                (&self.overlay_command, args)
            }
            UnitSpec::Audio { lifetime } => (
                &self.audio_command,
                vec!["--duration".to_owned(), lifetime.as_secs().to_string()],
            ),
        };

        let (program, leading) = base
            .split_first()
            .ok_or_else(|| anyhow::anyhow!("no {} command configured", spec.label()))?;

        let mut cmd = Command::new(program);
        cmd.args(leading)
            .args(extra)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        Ok(cmd)
    }
}

impl UnitLauncher for ProcessLauncher {
    fn launch(&self, spec: UnitSpec) -> anyhow::Result<Box<dyn SideEffectUnit>> {
        let mut cmd = self.build(&spec)?;
        let takes_images = matches!(spec, UnitSpec::Overlay { .. });
        cmd.stdin(if takes_images { Stdio::piped() } else { Stdio::null() });

        let mut child = cmd
            .spawn()
            .map_err(|e| anyhow::anyhow!("failed to spawn {} helper: {e}", spec.label()))?;
        debug!("Spawned {} helper (pid {:?})", spec.label(), child.id());

        let images = match child.stdin.take() {
            Some(stdin) if takes_images => {
                let (tx, rx) = mpsc::channel(IMAGE_CHANNEL_CAPACITY);
                tokio::spawn(pump_images(stdin, rx));
                Some(tx)
            }
            _ => None,
        };

        Ok(Box::new(ProcessUnit {
            label: spec.label(),
            child,
            images,
        }))
    }
}

/// Forward frames to the helper until it closes stdin or the unit drops.
async fn pump_images(mut stdin: tokio::process::ChildStdin, mut rx: mpsc::Receiver<Vec<u8>>) {
    while let Some(frame) = rx.recv().await {
        let len = frame.len() as u32;
        let result = async {
            stdin.write_all(&len.to_be_bytes()).await?;
            stdin.write_all(&frame).await?;
            stdin.flush().await
        }
        .await;

        if let Err(e) = result {
            debug!("Overlay stdin closed: {e}");
            break;
        }
    }
}

struct ProcessUnit {
    label: &'static str,
    child: Child,
    images: Option<mpsc::Sender<Vec<u8>>>,
}

impl SideEffectUnit for ProcessUnit {
    fn deliver(&self, image: Vec<u8>) -> Delivery {
        let Some(tx) = &self.images else {
            return Delivery::Closed;
        };
        match tx.try_send(image) {
            Ok(()) => Delivery::Sent,
            Err(mpsc::error::TrySendError::Full(image)) => Delivery::Full(image),
            Err(mpsc::error::TrySendError::Closed(_)) => Delivery::Closed,
        }
    }

    fn terminate(&mut self, join_timeout: Duration) -> BoxFuture<'_, anyhow::Result<()>> {
        Box::pin(async move {
            self.images = None;

            if let Ok(Some(status)) = self.child.try_wait() {
                debug!("{} helper already exited ({status})", self.label);
                return Ok(());
            }

            self.child
                .start_kill()
                .map_err(|e| anyhow::anyhow!("kill {} helper: {e}", self.label))?;

            match tokio::time::timeout(join_timeout, self.child.wait()).await {
                Ok(Ok(status)) => {
                    debug!("{} helper stopped ({status})", self.label);
                    Ok(())
                }
                Ok(Err(e)) => Err(anyhow::anyhow!("wait on {} helper: {e}", self.label)),
                Err(_) => {
                    warn!("{} helper did not exit within {join_timeout:?}", self.label);
                    Ok(())
                }
            }
        })
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlay_command_carries_title_message_and_duration() {
        let launcher = ProcessLauncher::new(
            vec!["python".into(), "overlay.py".into()],
            vec!["player".into()],
        );
        let cmd = launcher
            .build(&UnitSpec::Overlay {
                title: "MOVEMENT DETECTED".into(),
                message: Some("front door".into()),
                lifetime: Duration::from_secs(10),
            })
            .unwrap();

        let std_cmd = cmd.as_std();
        assert_eq!(std_cmd.get_program(), "python");
        let args: Vec<_> = std_cmd.get_args().map(|a| a.to_string_lossy().to_string()).collect();
        assert_eq!(
            args,
            vec!["overlay.py", "--title", "MOVEMENT DETECTED", "--duration", "10", "--message", "front door"]
        );
    }

    #[test]
    fn empty_command_is_rejected() {
        let launcher = ProcessLauncher::new(vec![], vec![]);
        let err = launcher
            .build(&UnitSpec::Audio {
                lifetime: Duration::from_secs(1),
            })
            .unwrap_err();
        assert!(err.to_string().contains("audio"));
    }
}
