use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::{join_all, BoxFuture};
use sysinfo::System;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{CommandEntry, RecordingAction, RemediationProfile};
use crate::obs::{RecorderConnector, RecordingSession};
use crate::warn::WarnSession;

const FIRST_CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
const RECONNECT_TIMEOUT: Duration = Duration::from_secs(1);
const WATCHDOG_PERIOD: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
pub enum KillError {
    #[error("unknown kill profile {0:?}")]
    UnknownProfile(String),
    #[error("command must be a non-empty list of strings, got {0}")]
    MalformedCommand(String),
}

/// Where remediation failures get shown.
pub trait AlertSink: Send + Sync {
    fn raise_priority<'a>(&'a self, key: &'a str, title: &'a str, message: &'a str) -> BoxFuture<'a, ()>;
}

impl AlertSink for WarnSession {
    fn raise_priority<'a>(&'a self, key: &'a str, title: &'a str, message: &'a str) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            self.start(key, title, Some(message), false, true).await;
        })
    }
}

// ── Process termination ─────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminateOutcome {
    Killed(usize),
    NotFound,
    /// Some matching processes survived the kill.
    Failed { matched: usize, killed: usize },
}

/// Force-kills processes by name. Blocking.
pub trait ProcessTerminator: Send + Sync {
    fn terminate(&self, name: &str) -> TerminateOutcome;
}

/// Kills through `sysinfo`: case-insensitive, `.exe` suffix optional.
pub struct SysinfoTerminator;

impl ProcessTerminator for SysinfoTerminator {
    fn terminate(&self, name: &str) -> TerminateOutcome {
        let wanted = normalize(name);
        let mut sys = System::new();
        sys.refresh_processes(sysinfo::ProcessesToUpdate::All);

        let mut matched = 0;
        let mut killed = 0;
        for (pid, proc) in sys.processes() {
            let proc_name = proc.name().to_string_lossy();
            if normalize(&proc_name) != wanted {
                continue;
            }
            matched += 1;
            if proc.kill() {
                killed += 1;
            } else {
                warn!("Failed to kill {proc_name} (PID {pid})");
            }
        }

        match (matched, killed) {
            (0, _) => TerminateOutcome::NotFound,
            (m, k) if m == k => TerminateOutcome::Killed(k),
            (matched, killed) => TerminateOutcome::Failed { matched, killed },
        }
    }
}

fn normalize(name: &str) -> String {
    let lower = name.to_lowercase();
    lower.strip_suffix(".exe").unwrap_or(&lower).to_owned()
}

// ── Controller ──────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordingOutcome {
    NotRequested,
    Disabled,
    NotConnected,
    NotRecording,
    Stopped,
    Failed,
}

/// What one `execute` call did.
#[derive(Debug)]
pub struct ExecutionReport {
    pub terminated: Vec<(String, TerminateOutcome)>,
    pub commands_started: usize,
    pub commands_rejected: usize,
    pub recording: RecordingOutcome,
}

/// Runs remediation profiles and keeps the recorder connection alive.
#[derive(Clone)]
pub struct Killer {
    profiles: Arc<HashMap<String, RemediationProfile>>,
    terminator: Arc<dyn ProcessTerminator>,
    connector: Option<Arc<dyn RecorderConnector>>,
    recorder: Arc<Mutex<Option<Box<dyn RecordingSession>>>>,
    alerts: Arc<dyn AlertSink>,
}

impl Killer {
    pub fn new(
        profiles: HashMap<String, RemediationProfile>,
        terminator: Arc<dyn ProcessTerminator>,
        connector: Option<Arc<dyn RecorderConnector>>,
        alerts: Arc<dyn AlertSink>,
    ) -> Self {
        Self {
            profiles: Arc::new(profiles),
            terminator,
            connector,
            recorder: Arc::new(Mutex::new(None)),
            alerts,
        }
    }

    pub fn recorder_enabled(&self) -> bool {
        self.connector.is_some()
    }

    pub async fn recorder_connected(&self) -> bool {
        self.recorder.lock().await.is_some()
    }

    /// Run the named profile.
    pub async fn execute(&self, profile_name: &str) -> Result<ExecutionReport, KillError> {
        let Some(profile) = self.profiles.get(profile_name) else {
            error!("Unknown kill mode: {profile_name}");
            self.alerts
                .raise_priority(
                    "self_kill_unknown",
                    "INVALID KILL MODE",
                    &format!("UNDEFINED KILL MODE:\n{profile_name}"),
                )
                .await;
            return Err(KillError::UnknownProfile(profile_name.to_owned()));
        };

        info!("Executing kill profile '{profile_name}'");
        let terminated = self.terminate_processes(&profile.taskkill).await;
        let (commands_started, commands_rejected) = self.run_commands(&profile.commands).await;

        let recording = match profile.obs {
            None => RecordingOutcome::NotRequested,
            Some(RecordingAction::Stop) if !self.recorder_enabled() => {
                debug!("Profile asks to stop recording but OBS is not configured");
                RecordingOutcome::Disabled
            }
            Some(RecordingAction::Stop) => self.stop_recording().await,
        };

        Ok(ExecutionReport {
            terminated,
            commands_started,
            commands_rejected,
            recording,
        })
    }

    /// Kill every listed process concurrently; outcomes in list order.
    pub async fn terminate_processes(&self, names: &[String]) -> Vec<(String, TerminateOutcome)> {
        let tasks = names.iter().map(|name| {
            let terminator = self.terminator.clone();
            let name = name.clone();
            async move {
                let n = name.clone();
                let outcome = match tokio::task::spawn_blocking(move || terminator.terminate(&n)).await {
                    Ok(o) => o,
                    Err(e) => {
                        error!("Unknown error while terminating '{name}': {e}");
                        TerminateOutcome::Failed { matched: 0, killed: 0 }
                    }
                };
                match &outcome {
                    TerminateOutcome::Killed(n) => info!("Successfully terminated '{name}' ({n} process(es))"),
                    TerminateOutcome::NotFound => info!("Failed to terminate '{name}': not running"),
                    TerminateOutcome::Failed { matched, killed } => {
                        warn!("Terminated {killed}/{matched} '{name}' process(es)")
                    }
                }
                (name, outcome)
            }
        });

        join_all(tasks).await
    }

    /// Launch every command detached. Returns (started, rejected).
    ///
    /// A malformed entry is a configuration error: it raises a priority
    /// alert and is skipped, the rest still run.
    pub async fn run_commands(&self, commands: &[CommandEntry]) -> (usize, usize) {
        let mut started = 0;
        let mut rejected = 0;
        for entry in commands {
            let argv = match command_argv(entry) {
                Ok(argv) => argv,
                Err(e) => {
                    rejected += 1;
                    error!("{e}");
                    self.alerts
                        .raise_priority(
                            "self_kill_command",
                            "INVALID KILL COMMAND",
                            &format!("MALFORMED COMMAND:\n{e}"),
                        )
                        .await;
                    continue;
                }
            };

            match spawn_detached(argv) {
                Ok(pid) => {
                    started += 1;
                    debug!("Background command running (pid {pid:?})");
                }
                Err(e) => {
                    rejected += 1;
                    error!("{e}");
                }
            }
        }
        (started, rejected)
    }

    async fn stop_recording(&self) -> RecordingOutcome {
        let mut guard = self.recorder.lock().await;
        let Some(session) = guard.as_mut() else {
            error!("Failed to stop OBS recording: OBS not connected");
            return RecordingOutcome::NotConnected;
        };

        match session.is_recording().await {
            Ok(false) => {
                info!("Failed to stop OBS recording: OBS not recording");
                RecordingOutcome::NotRecording
            }
            Ok(true) => match session.stop_recording().await {
                Ok(()) => {
                    info!("Successfully stopped OBS recording");
                    RecordingOutcome::Stopped
                }
                Err(e) => {
                    error!("Failed to stop OBS recording: {e}");
                    RecordingOutcome::Failed
                }
            },
            Err(e) => {
                error!("Failed to stop OBS recording: {e}");
                RecordingOutcome::Failed
            }
        }
    }

    /// Keep a recorder session alive until cancelled.
    pub async fn run_watchdog(self, cancel: CancellationToken) {
        let Some(connector) = self.connector.clone() else {
            info!("OBS connection worker is disabled");
            return;
        };

        info!("Starting OBS connection worker...");
        let mut connect_timeout = FIRST_CONNECT_TIMEOUT;

        loop {
            // Probe outside the lock so remediation never queues behind it
            let session = self.recorder.lock().await.take();

            if let Some(mut session) = session {
                let probe = tokio::select! {
                    _ = cancel.cancelled() => break,
                    r = session.probe() => r,
                };
                match probe {
                    Ok(()) => {
                        debug!("OBS connection is active");
                        *self.recorder.lock().await = Some(session);
                    }
                    Err(e) => debug!("OBS connection failed: {e}. Attempting to reconnect..."),
                }
            } else {
                let attempt = tokio::select! {
                    _ = cancel.cancelled() => break,
                    r = connector.connect(connect_timeout) => r,
                };
                connect_timeout = RECONNECT_TIMEOUT;
                match attempt {
                    Ok(session) => {
                        info!("Successfully connected to OBS");
                        *self.recorder.lock().await = Some(session);
                        // A fresh session gets probed on the next pass
                        continue;
                    }
                    Err(e) => debug!("Failed to connect to OBS: {e}. Retrying..."),
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(WATCHDOG_PERIOD) => {}
            }
        }

        info!("Stopping OBS connection worker...");
        *self.recorder.lock().await = None;
    }
}

fn command_argv(entry: &CommandEntry) -> Result<&[String], KillError> {
    match entry {
        CommandEntry::Argv(argv) if !argv.is_empty() => Ok(argv.as_slice()),
        CommandEntry::Argv(_) => Err(KillError::MalformedCommand("[]".into())),
        CommandEntry::Malformed(v) => Err(KillError::MalformedCommand(v.to_string())),
    }
}

fn spawn_detached(argv: &[String]) -> anyhow::Result<Option<u32>> {
    let child = tokio::process::Command::new(&argv[0])
        .args(&argv[1..])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => {
                anyhow::anyhow!("Command not found: '{}'. Check your PATH.", argv[0])
            }
            _ => anyhow::anyhow!("Error executing command {argv:?}: {e}"),
        })?;

    info!("Started background command {argv:?}");
    Ok(child.id())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct RecordingAlerts {
        raised: StdMutex<Vec<(String, String)>>,
    }

    impl AlertSink for RecordingAlerts {
        fn raise_priority<'a>(&'a self, key: &'a str, title: &'a str, _message: &'a str) -> BoxFuture<'a, ()> {
            Box::pin(async move {
                self.raised.lock().unwrap().push((key.to_owned(), title.to_owned()));
            })
        }
    }

    /// Pretends every name except `missing` is running.
    #[derive(Default)]
    struct FakeTerminator {
        attempts: StdMutex<Vec<String>>,
        missing: Vec<String>,
    }

    impl ProcessTerminator for FakeTerminator {
        fn terminate(&self, name: &str) -> TerminateOutcome {
            self.attempts.lock().unwrap().push(name.to_owned());
            if self.missing.iter().any(|m| m == name) {
                TerminateOutcome::NotFound
            } else {
                TerminateOutcome::Killed(1)
            }
        }
    }

    struct FakeSession {
        recording: bool,
        stops: Arc<AtomicUsize>,
        probe_ok: bool,
        probe_delay: Duration,
    }

    impl RecordingSession for FakeSession {
        fn probe(&mut self) -> BoxFuture<'_, anyhow::Result<()>> {
            Box::pin(async move {
                tokio::time::sleep(self.probe_delay).await;
                if self.probe_ok {
                    Ok(())
                } else {
                    anyhow::bail!("gone")
                }
            })
        }

        fn is_recording(&mut self) -> BoxFuture<'_, anyhow::Result<bool>> {
            Box::pin(async move { Ok(self.recording) })
        }

        fn stop_recording(&mut self) -> BoxFuture<'_, anyhow::Result<()>> {
            Box::pin(async move {
                self.stops.fetch_add(1, Ordering::SeqCst);
                self.recording = false;
                Ok(())
            })
        }
    }

    /// Refuses the first `fail_first` connects.
    struct FakeConnector {
        connects: Arc<AtomicUsize>,
        fail_first: usize,
        recording: bool,
        stops: Arc<AtomicUsize>,
        probe_delay: Duration,
    }

    impl RecorderConnector for FakeConnector {
        fn connect(&self, _timeout: Duration) -> BoxFuture<'_, anyhow::Result<Box<dyn RecordingSession>>> {
            Box::pin(async move {
                let n = self.connects.fetch_add(1, Ordering::SeqCst);
                if n < self.fail_first {
                    anyhow::bail!("connection refused");
                }
                Ok(Box::new(FakeSession {
                    recording: self.recording,
                    stops: self.stops.clone(),
                    probe_ok: true,
                    probe_delay: self.probe_delay,
                }) as Box<dyn RecordingSession>)
            })
        }
    }

    fn profiles() -> HashMap<String, RemediationProfile> {
        let mut map = HashMap::new();
        map.insert(
            "default".to_owned(),
            RemediationProfile {
                taskkill: vec!["a".into(), "b".into(), "c".into(), "d".into()],
                commands: vec![
                    CommandEntry::Argv(vec![]),
                    CommandEntry::Malformed(toml::Value::String("rm -rf /".into())),
                ],
                obs: Some(RecordingAction::Stop),
            },
        );
        map.insert(
            "record".to_owned(),
            RemediationProfile {
                taskkill: vec![],
                commands: vec![],
                obs: Some(RecordingAction::Stop),
            },
        );
        map
    }

    fn killer(
        terminator: Arc<FakeTerminator>,
        alerts: Arc<RecordingAlerts>,
        connector: Option<Arc<dyn RecorderConnector>>,
    ) -> Killer {
        Killer::new(profiles(), terminator, connector, alerts)
    }

    #[tokio::test]
    async fn unknown_profile_raises_one_priority_alert() {
        let terminator = Arc::new(FakeTerminator::default());
        let alerts = Arc::new(RecordingAlerts::default());
        let k = killer(terminator.clone(), alerts.clone(), None);

        let err = k.execute("missing-profile").await.unwrap_err();
        assert!(matches!(err, KillError::UnknownProfile(p) if p == "missing-profile"));

        let raised = alerts.raised.lock().unwrap().clone();
        assert_eq!(raised, vec![("self_kill_unknown".to_owned(), "INVALID KILL MODE".to_owned())]);
        assert!(terminator.attempts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_process_does_not_stop_siblings() {
        let terminator = Arc::new(FakeTerminator {
            missing: vec!["b".into()],
            ..Default::default()
        });
        let alerts = Arc::new(RecordingAlerts::default());
        let k = killer(terminator.clone(), alerts.clone(), None);

        let report = k.execute("default").await.unwrap();

        let mut attempts = terminator.attempts.lock().unwrap().clone();
        attempts.sort();
        assert_eq!(attempts, vec!["a", "b", "c", "d"]);
        assert_eq!(report.terminated[1], ("b".to_owned(), TerminateOutcome::NotFound));
        assert_eq!(report.terminated[3], ("d".to_owned(), TerminateOutcome::Killed(1)));
        assert_eq!(report.commands_started, 0);
        assert_eq!(report.commands_rejected, 2);
        assert_eq!(report.recording, RecordingOutcome::Disabled);

        let raised = alerts.raised.lock().unwrap().clone();
        let expected = ("self_kill_command".to_owned(), "INVALID KILL COMMAND".to_owned());
        assert_eq!(raised, vec![expected.clone(), expected]);
    }

    #[tokio::test]
    async fn stop_recording_needs_a_connection() {
        let stops = Arc::new(AtomicUsize::new(0));
        let connector: Arc<dyn RecorderConnector> = Arc::new(FakeConnector {
            connects: Arc::new(AtomicUsize::new(0)),
            fail_first: 0,
            recording: true,
            stops: stops.clone(),
            probe_delay: Duration::ZERO,
        });
        let k = killer(
            Arc::new(FakeTerminator::default()),
            Arc::new(RecordingAlerts::default()),
            Some(connector.clone()),
        );

        let report = k.execute("default").await.unwrap();
        assert_eq!(report.recording, RecordingOutcome::NotConnected);

        *k.recorder.lock().await = Some(connector.connect(Duration::from_secs(1)).await.unwrap());
        let report = k.execute("default").await.unwrap();
        assert_eq!(report.recording, RecordingOutcome::Stopped);
        assert_eq!(stops.load(Ordering::SeqCst), 1);

        let report = k.execute("default").await.unwrap();
        assert_eq!(report.recording, RecordingOutcome::NotRecording);
        assert_eq!(stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn watchdog_retries_until_connected_then_stops_on_cancel() {
        let connects = Arc::new(AtomicUsize::new(0));
        let connector: Arc<dyn RecorderConnector> = Arc::new(FakeConnector {
            connects: connects.clone(),
            fail_first: 3,
            recording: false,
            stops: Arc::new(AtomicUsize::new(0)),
            probe_delay: Duration::ZERO,
        });
        let k = killer(
            Arc::new(FakeTerminator::default()),
            Arc::new(RecordingAlerts::default()),
            Some(connector),
        );

        let cancel = CancellationToken::new();
        let task = tokio::spawn(k.clone().run_watchdog(cancel.clone()));

        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert!(!k.recorder_connected().await);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(k.recorder_connected().await);
        assert_eq!(connects.load(Ordering::SeqCst), 4);

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
        assert!(!k.recorder_connected().await);
    }

    #[test]
    fn normalize_strips_exe_and_case() {
        assert_eq!(normalize("Game.EXE"), "game");
        assert_eq!(normalize("firefox"), "firefox");
    }

    #[test]
    fn malformed_commands_are_rejected() {
        let err = command_argv(&CommandEntry::Malformed(toml::Value::Integer(3))).unwrap_err();
        assert!(err.to_string().contains("list of strings"));
        assert!(command_argv(&CommandEntry::Argv(vec![])).is_err());

        let argv = CommandEntry::Argv(vec!["echo".into(), "hi".into()]);
        assert_eq!(command_argv(&argv).unwrap(), ["echo".to_owned(), "hi".to_owned()]);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_probe_does_not_hold_up_remediation() {
        let connector: Arc<dyn RecorderConnector> = Arc::new(FakeConnector {
            connects: Arc::new(AtomicUsize::new(0)),
            fail_first: 0,
            recording: true,
            stops: Arc::new(AtomicUsize::new(0)),
            probe_delay: Duration::from_secs(3),
        });
        let k = killer(
            Arc::new(FakeTerminator::default()),
            Arc::new(RecordingAlerts::default()),
            Some(connector),
        );

        let cancel = CancellationToken::new();
        let task = tokio::spawn(k.clone().run_watchdog(cancel.clone()));

        // connected at once, then stuck in the first probe
        tokio::time::sleep(Duration::from_millis(500)).await;
        let report = tokio::time::timeout(Duration::from_millis(100), k.execute("record"))
            .await
            .expect("remediation waited on the probe")
            .unwrap();
        assert_eq!(report.recording, RecordingOutcome::NotConnected);

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
    }
}
