use std::sync::Arc;

use crate::camera::FrameSource;
use crate::config::AppConfig;
use crate::effects::{ProcessLauncher, UnitLauncher};
use crate::killer::{Killer, ProcessTerminator, SysinfoTerminator};
use crate::ledger::EventLedger;
use crate::link::Identity;
use crate::obs::{ObsConnector, RecorderConnector};
use crate::warn::WarnSession;

/// Everything the agent shares, built once at startup.
pub struct AgentContext {
    pub config: AppConfig,
    pub identity: Identity,
    pub ledger: EventLedger,
    pub warn: WarnSession,
    pub killer: Killer,
    pub camera: Arc<FrameSource>,
    pub start_time: std::time::Instant,
}

impl AgentContext {
    /// Production wiring: helper processes, sysinfo, OBS.
    pub fn build(config: AppConfig, identity: Identity) -> Arc<Self> {
        let launcher = Arc::new(ProcessLauncher::new(
            config.warn.overlay_command.clone(),
            config.warn.audio_command.clone(),
        ));
        let connector = ObsConnector::from_config(&config.obs)
            .map(|c| Arc::new(c) as Arc<dyn RecorderConnector>);

        Self::with_parts(config, identity, launcher, Arc::new(SysinfoTerminator), connector)
    }

    pub fn with_parts(
        config: AppConfig,
        identity: Identity,
        launcher: Arc<dyn UnitLauncher>,
        terminator: Arc<dyn ProcessTerminator>,
        connector: Option<Arc<dyn RecorderConnector>>,
    ) -> Arc<Self> {
        let ledger = EventLedger::new(&config.ledger);
        let warn = WarnSession::new(&config.warn, launcher);
        let killer = Killer::new(
            config.kill.clone(),
            terminator,
            connector,
            Arc::new(warn.clone()),
        );
        let camera = Arc::new(FrameSource::new(config.camera.clone()));

        Arc::new(Self {
            config,
            identity,
            ledger,
            warn,
            killer,
            camera,
            start_time: std::time::Instant::now(),
        })
    }
}
