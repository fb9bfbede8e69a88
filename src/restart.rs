//! Two-phase restart: start the replacement, watch it for a health window,
//! sweep stale instances, record the new PID and hand over.

use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::time::{sleep, Duration, Instant};

use crate::pid::{self, PidManager};

/// Set on the replacement process; holds the PID that launched it.
pub const RESTARTED_FROM_ENV: &str = "KOMIHUB_RESTARTED_FROM";

const HEALTH_POLL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartPhase {
    Idle,
    SpawningNew,
    HealthChecking,
    KillingOld,
    Finalizing,
    SelfTerminate,
    Failed,
}

impl RestartPhase {
    pub fn is_active(&self) -> bool {
        !matches!(self, RestartPhase::Idle | RestartPhase::Failed)
    }
}

#[derive(Error, Debug)]
pub enum RestartError {
    #[error("a restart is already in progress")]
    InProgress,

    #[error("failed to start new process: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("new process exited during the health check (exit code {})", exit_code(.code))]
    ExitedEarly { code: Option<i32> },

    #[error("cannot determine how to relaunch: {0}")]
    Launch(String),
}

fn exit_code(code: &Option<i32>) -> String {
    match code {
        Some(code) => code.to_string(),
        None => "unknown".to_string(),
    }
}

/// How to start a fresh copy of the bot.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub cwd: PathBuf,
    pub env: Vec<(String, String)>,
}

impl LaunchSpec {
    /// Same executable, arguments and working directory as this process.
    pub fn current() -> Result<Self, RestartError> {
        let program = pid::current_exe()
            .map_err(|e| RestartError::Launch(format!("executable path: {e}")))?;
        let cwd = std::env::current_dir()
            .map_err(|e| RestartError::Launch(format!("working directory: {e}")))?;
        Ok(Self {
            program,
            args: std::env::args_os().skip(1).collect(),
            cwd,
            env: vec![(
                RESTARTED_FROM_ENV.to_string(),
                std::process::id().to_string(),
            )],
        })
    }
}

/// Result of a successful handover.
#[derive(Debug, Clone, PartialEq)]
pub struct Handover {
    pub new_pid: u32,
    pub swept: usize,
    pub pid_saved: bool,
}

pub struct Restarter {
    pids: Arc<PidManager>,
    launch: LaunchSpec,
    health_window: Duration,
    phase: Mutex<RestartPhase>,
}

impl Restarter {
    pub fn new(pids: Arc<PidManager>, launch: LaunchSpec, health_window: Duration) -> Self {
        Self {
            pids,
            launch,
            health_window,
            phase: Mutex::new(RestartPhase::Idle),
        }
    }

    pub fn phase(&self) -> RestartPhase {
        *self.phase.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_phase(&self, phase: RestartPhase) {
        *self.phase.lock().unwrap_or_else(|e| e.into_inner()) = phase;
        tracing::info!(phase = ?phase, "Restart phase");
    }

    fn begin(&self) -> Result<(), RestartError> {
        let mut phase = self.phase.lock().unwrap_or_else(|e| e.into_inner());
        if phase.is_active() {
            return Err(RestartError::InProgress);
        }
        *phase = RestartPhase::SpawningNew;
        tracing::info!(phase = ?RestartPhase::SpawningNew, "Restart phase");
        Ok(())
    }

    fn fail(&self, err: RestartError) -> RestartError {
        self.set_phase(RestartPhase::Failed);
        tracing::error!(error = %err, "Restart aborted, keeping current process");
        err
    }

    /// Runs the handover up to, but not including, exiting this process.
    ///
    /// On error nothing has been killed and `bot.pid` is untouched.
    pub async fn restart(&self) -> Result<Handover, RestartError> {
        self.begin()?;

        // A rebuild can leave the recorded path pointing at nothing.
        match tokio::fs::metadata(&self.launch.program).await {
            Ok(meta) if meta.is_file() => {}
            Ok(_) => {
                let reason = format!("{} is not a file", self.launch.program.display());
                return Err(self.fail(RestartError::Launch(reason)));
            }
            Err(e) => {
                let reason = format!("{}: {e}", self.launch.program.display());
                return Err(self.fail(RestartError::Launch(reason)));
            }
        }

        let mut command = tokio::process::Command::new(&self.launch.program);
        command
            .args(&self.launch.args)
            .current_dir(&self.launch.cwd)
            .envs(self.launch.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null());
        // Own process group so a terminal signal aimed at us spares the child.
        command.process_group(0);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => return Err(self.fail(RestartError::Spawn(e))),
        };
        let Some(new_pid) = child.id() else {
            return Err(self.fail(RestartError::ExitedEarly { code: None }));
        };
        tracing::info!(pid = new_pid, program = %self.launch.program.display(), "Started new process");

        self.set_phase(RestartPhase::HealthChecking);
        let deadline = Instant::now() + self.health_window;
        loop {
            match child.try_wait() {
                Ok(Some(status)) => {
                    return Err(self.fail(RestartError::ExitedEarly {
                        code: status.code(),
                    }))
                }
                Ok(None) => {}
                Err(e) => tracing::warn!(pid = new_pid, error = %e, "Could not poll new process"),
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            sleep(HEALTH_POLL.min(deadline - now)).await;
        }
        tracing::info!(pid = new_pid, "New process passed health check");

        self.set_phase(RestartPhase::KillingOld);
        let swept = self.pids.cleanup_old_instances_except(&[new_pid]).await;

        self.set_phase(RestartPhase::Finalizing);
        let pid_saved = match self.pids.save_bot_pid(Some(new_pid)).await {
            Ok(_) => true,
            Err(e) => {
                tracing::error!(pid = new_pid, error = %e, "Failed to record new bot PID");
                false
            }
        };

        // The child outlives us; tokio reaps it if it exits first.
        drop(child);

        Ok(Handover {
            new_pid,
            swept,
            pid_saved,
        })
    }

    /// Final step of a handover.
    pub fn self_terminate(&self) -> ! {
        self.set_phase(RestartPhase::SelfTerminate);
        tracing::info!(pid = std::process::id(), "Exiting after handover");
        std::process::exit(0)
    }
}
