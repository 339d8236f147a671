//! Retry-then-escalate discipline shared by every external call.
//!
//! One fuse counter is shared by all stages for the life of the process. A
//! success anywhere refills it; each failure burns one unit and waits the
//! stage's retry delay. When the fuse burns out the injected [`RestartPolicy`]
//! is invoked exactly once and the supervisor stays depleted.

use crate::config::ResilienceConfig;
use crate::error::StageError;
use crate::status_bridge::{Status, StatusIndicator};
use std::future::Future;
use std::os::unix::process::CommandExt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Exit code used when re-exec fails, so a service manager restarts us.
pub const RESTART_EXIT_CODE: i32 = 75;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Link,
    Compose,
    Synthesis,
    Playback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryDelays {
    pub link: Duration,
    pub compose: Duration,
    pub synthesis: Duration,
    pub playback: Duration,
}

impl RetryDelays {
    pub fn from_config(config: &ResilienceConfig) -> Self {
        Self {
            link: Duration::from_secs(config.link_retry_secs),
            compose: Duration::from_secs(config.compose_retry_secs),
            synthesis: Duration::from_secs(config.synthesis_retry_secs),
            playback: Duration::from_secs(config.playback_retry_secs),
        }
    }

    pub fn for_stage(&self, stage: Stage) -> Duration {
        match stage {
            Stage::Link => self.link,
            Stage::Compose => self.compose,
            Stage::Synthesis => self.synthesis,
            Stage::Playback => self.playback,
        }
    }
}

/// Terminal escalation once the fuse is gone.
pub trait RestartPolicy: Send + Sync {
    fn restart(&self);
}

/// Replaces the running image with a fresh copy of itself. No state survives.
pub struct ExecRestart;

impl RestartPolicy for ExecRestart {
    fn restart(&self) {
        log::error!("Fuse depleted, restarting process");
        log::logger().flush();

        let args: Vec<_> = std::env::args_os().skip(1).collect();
        match std::env::current_exe() {
            Ok(exe) => {
                // exec only returns on failure
                let err = std::process::Command::new(&exe).args(&args).exec();
                log::error!("Failed to re-exec {}: {}", exe.display(), err);
            }
            Err(e) => log::error!("Cannot locate own executable: {}", e),
        }
        std::process::exit(RESTART_EXIT_CODE);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FuseVerdict {
    Retry,
    Depleted,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("fuse depleted in {stage:?} stage (last error: {last_error:?})")]
pub struct FuseDepleted {
    pub stage: Stage,
    pub last_error: Option<StageError>,
}

pub struct Supervisor {
    initial: u32,
    remaining: u32,
    depleted: bool,
    delays: RetryDelays,
    restart: Box<dyn RestartPolicy>,
    indicator: Arc<dyn StatusIndicator>,
}

impl Supervisor {
    pub fn new(
        initial_fuse: u32,
        delays: RetryDelays,
        restart: Box<dyn RestartPolicy>,
        indicator: Arc<dyn StatusIndicator>,
    ) -> Self {
        let initial = initial_fuse.max(1);
        Self {
            initial,
            remaining: initial,
            depleted: false,
            delays,
            restart,
            indicator,
        }
    }

    pub fn remaining(&self) -> u32 {
        self.remaining
    }

    pub fn is_depleted(&self) -> bool {
        self.depleted
    }

    /// Refill the fuse after a successful stage.
    pub async fn restore(&mut self) {
        if self.depleted {
            return;
        }
        self.remaining = self.initial;
        self.indicator.show(Status::Healthy).await;
    }

    /// Burn one unit of the fuse. Sleeps the stage delay when retries remain,
    /// otherwise requests the restart.
    pub async fn blow(&mut self, stage: Stage) -> FuseVerdict {
        if self.depleted {
            return FuseVerdict::Depleted;
        }
        self.indicator.show(Status::Failure).await;

        self.remaining = self.remaining.saturating_sub(1);
        if self.remaining == 0 {
            self.depleted = true;
            log::error!("Fuse depleted in {:?} stage", stage);
            self.restart.restart();
            return FuseVerdict::Depleted;
        }

        let delay = self.delays.for_stage(stage);
        log::warn!(
            "{:?} stage failed, fuse {}/{}, retrying in {:?}",
            stage,
            self.remaining,
            self.initial,
            delay
        );
        tokio::time::sleep(delay).await;
        FuseVerdict::Retry
    }

    /// Run `attempt` until it succeeds or the fuse is depleted.
    pub async fn guard<T, F, Fut>(&mut self, stage: Stage, mut attempt: F) -> Result<T, FuseDepleted>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StageError>>,
    {
        if self.depleted {
            return Err(FuseDepleted {
                stage,
                last_error: None,
            });
        }

        loop {
            match attempt().await {
                Ok(value) => {
                    self.restore().await;
                    return Ok(value);
                }
                Err(e) => {
                    log::warn!("{:?} stage error: {}", stage, e);
                    if self.blow(stage).await == FuseVerdict::Depleted {
                        return Err(FuseDepleted {
                            stage,
                            last_error: Some(e),
                        });
                    }
                }
            }
        }
    }
}
