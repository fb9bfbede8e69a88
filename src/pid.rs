//! PID files, liveness checks and termination of stray bot processes.
//!
//! Every OS call here can race against the target exiting on its own, so
//! "no such process" is an ordinary outcome rather than an error.

use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::time::{sleep, Duration, Instant};

use crate::error::KomihubError;

const TERMINATE_POLL: Duration = Duration::from_millis(100);
const PORT_POLL: Duration = Duration::from_millis(500);
const PORT_PROBE_TIMEOUT: Duration = Duration::from_millis(500);
const REAP_TIMEOUT: Duration = Duration::from_secs(5);
const DELETED_SUFFIX: &str = " (deleted)";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalOutcome {
    Delivered,
    NoSuchProcess,
    PermissionDenied,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminateOutcome {
    /// The process was running and is gone now.
    Terminated,
    /// Nothing to do; the process had already exited.
    AlreadyGone,
    PermissionDenied,
    /// Still alive after SIGKILL and the reap timeout.
    StillRunning,
}

impl TerminateOutcome {
    pub fn is_stopped(&self) -> bool {
        matches!(self, TerminateOutcome::Terminated | TerminateOutcome::AlreadyGone)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProcessEntry {
    pub pid: u32,
    /// `argv[0]` as the process was started.
    pub program: String,
    pub cmdline: String,
}

/// Path of the running executable. Linux appends " (deleted)" once the
/// binary has been replaced on disk, which is the usual state after a
/// rebuild and before a restart.
pub fn current_exe() -> std::io::Result<PathBuf> {
    let exe = std::env::current_exe()?;
    match exe.to_str().and_then(|s| s.strip_suffix(DELETED_SUFFIX)) {
        Some(stripped) => Ok(PathBuf::from(stripped)),
        None => Ok(exe),
    }
}

fn nix_pid(pid: u32) -> Option<Pid> {
    i32::try_from(pid).ok().filter(|p| *p > 0).map(Pid::from_raw)
}

pub fn send_signal(pid: u32, signal: Signal) -> SignalOutcome {
    let Some(target) = nix_pid(pid) else {
        return SignalOutcome::NoSuchProcess;
    };
    match kill(target, signal) {
        Ok(()) => SignalOutcome::Delivered,
        Err(Errno::EPERM) => SignalOutcome::PermissionDenied,
        Err(_) => SignalOutcome::NoSuchProcess,
    }
}

fn is_zombie(pid: u32) -> bool {
    let Ok(stat) = std::fs::read_to_string(format!("/proc/{pid}/stat")) else {
        return false;
    };
    // The command name may contain spaces or parens; the state follows the last ')'.
    stat.rfind(')')
        .and_then(|idx| stat[idx + 1..].split_whitespace().next())
        .is_some_and(|state| state == "Z")
}

/// A process counts as alive when it exists, we may signal it, and it is
/// not a zombie.
pub fn process_alive(pid: u32) -> bool {
    let Some(target) = nix_pid(pid) else {
        return false;
    };
    match kill(target, None) {
        Ok(()) => !is_zombie(pid),
        Err(_) => false,
    }
}

/// Snapshot of every process visible under `/proc` with a non-empty command line.
pub fn list_processes() -> Vec<ProcessEntry> {
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return Vec::new();
    };

    entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.file_name().to_str()?.parse::<u32>().ok())
        .filter_map(|pid| {
            let raw = std::fs::read(format!("/proc/{pid}/cmdline")).ok()?;
            let args: Vec<String> = raw
                .split(|b| *b == 0)
                .filter(|part| !part.is_empty())
                .map(|part| String::from_utf8_lossy(part).into_owned())
                .collect();
            let program = args.first()?.clone();
            Some(ProcessEntry {
                pid,
                program,
                cmdline: args.join(" "),
            })
        })
        .collect()
}

pub struct PidManager {
    bot_pid_file: PathBuf,
    server_pid_file: PathBuf,
    patterns: Vec<String>,
    kill_timeout: Duration,
}

impl PidManager {
    pub fn new(data_dir: &Path, patterns: Vec<String>) -> Self {
        Self {
            bot_pid_file: data_dir.join("bot.pid"),
            server_pid_file: data_dir.join("server.pid"),
            patterns,
            kill_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_kill_timeout(mut self, timeout: Duration) -> Self {
        self.kill_timeout = timeout;
        self
    }

    async fn write_pid(path: &Path, pid: u32) -> Result<(), KomihubError> {
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        tokio::fs::write(path, pid.to_string()).await?;
        Ok(())
    }

    async fn read_pid(path: &Path) -> Option<u32> {
        let content = tokio::fs::read_to_string(path).await.ok()?;
        match content.trim().parse() {
            Ok(pid) => Some(pid),
            Err(e) => {
                tracing::error!(file = %path.display(), error = %e, "Failed to parse PID file");
                None
            }
        }
    }

    /// Writes `pid` (or our own PID) to `bot.pid`.
    pub async fn save_bot_pid(&self, pid: Option<u32>) -> Result<u32, KomihubError> {
        let pid = pid.unwrap_or_else(std::process::id);
        Self::write_pid(&self.bot_pid_file, pid).await?;
        tracing::debug!(pid = pid, file = %self.bot_pid_file.display(), "Saved bot PID");
        Ok(pid)
    }

    pub async fn save_server_pid(&self, pid: Option<u32>) -> Result<u32, KomihubError> {
        let pid = pid.unwrap_or_else(std::process::id);
        Self::write_pid(&self.server_pid_file, pid).await?;
        tracing::debug!(pid = pid, file = %self.server_pid_file.display(), "Saved server PID");
        Ok(pid)
    }

    pub async fn bot_pid(&self) -> Option<u32> {
        Self::read_pid(&self.bot_pid_file).await
    }

    pub async fn server_pid(&self) -> Option<u32> {
        Self::read_pid(&self.server_pid_file).await
    }

    /// Liveness of `pid`, or of the saved bot PID when `None`.
    pub async fn is_running(&self, pid: Option<u32>) -> bool {
        let pid = match pid {
            Some(pid) => Some(pid),
            None => self.bot_pid().await,
        };
        pid.is_some_and(process_alive)
    }

    /// SIGTERM, poll until gone or `timeout`, then SIGKILL and wait for the
    /// process to disappear.
    pub async fn try_terminate(&self, pid: u32, timeout: Duration) -> TerminateOutcome {
        if !process_alive(pid) {
            return TerminateOutcome::AlreadyGone;
        }

        tracing::info!(pid = pid, "Terminating process");
        match send_signal(pid, Signal::SIGTERM) {
            SignalOutcome::Delivered => {}
            SignalOutcome::NoSuchProcess => return TerminateOutcome::AlreadyGone,
            SignalOutcome::PermissionDenied => {
                tracing::warn!(pid = pid, "Permission denied sending SIGTERM");
                return TerminateOutcome::PermissionDenied;
            }
        }

        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if !process_alive(pid) {
                tracing::info!(pid = pid, "Process terminated gracefully");
                return TerminateOutcome::Terminated;
            }
            sleep(TERMINATE_POLL).await;
        }

        tracing::warn!(pid = pid, "Process ignored SIGTERM, sending SIGKILL");
        match send_signal(pid, Signal::SIGKILL) {
            SignalOutcome::Delivered => {}
            SignalOutcome::NoSuchProcess => return TerminateOutcome::Terminated,
            SignalOutcome::PermissionDenied => return TerminateOutcome::PermissionDenied,
        }

        let deadline = Instant::now() + REAP_TIMEOUT;
        while Instant::now() < deadline {
            if !process_alive(pid) {
                tracing::info!(pid = pid, "Process force killed");
                return TerminateOutcome::Terminated;
            }
            sleep(TERMINATE_POLL).await;
        }

        tracing::error!(pid = pid, "Process still running after SIGKILL");
        TerminateOutcome::StillRunning
    }

    /// `true` when the process is not running afterwards.
    pub async fn kill_process(&self, pid: u32, timeout: Duration) -> bool {
        self.try_terminate(pid, timeout).await.is_stopped()
    }

    /// Stops the process recorded in `server.pid` unless it is this one.
    pub async fn kill_server(&self) -> bool {
        match self.server_pid().await {
            Some(pid) if pid != std::process::id() => {
                self.kill_process(pid, self.kill_timeout).await
            }
            _ => true,
        }
    }

    /// Whether `program` (an `argv[0]`) is one of ours. A pattern matches the
    /// executable's file name or its full path; arguments are never looked at,
    /// so `tail -f komihub.log` is not a bot instance.
    pub fn matches(&self, program: &str) -> bool {
        let program = program.strip_suffix(DELETED_SUFFIX).unwrap_or(program);
        let file_name = Path::new(program)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(program);
        self.patterns
            .iter()
            .any(|p| p.as_str() == file_name || p.as_str() == program)
    }

    /// Terminates every process started from our executable, except this
    /// process. Returns how many were killed.
    pub async fn cleanup_old_instances(&self) -> usize {
        self.cleanup_old_instances_except(&[]).await
    }

    /// As [`Self::cleanup_old_instances`], additionally sparing `keep`.
    pub async fn cleanup_old_instances_except(&self, keep: &[u32]) -> usize {
        let own_pid = std::process::id();
        let processes = match tokio::task::spawn_blocking(list_processes).await {
            Ok(list) => list,
            Err(e) => {
                tracing::error!(error = %e, "Failed to enumerate processes");
                return 0;
            }
        };

        let mut killed = 0;
        for entry in processes {
            if entry.pid == own_pid || keep.contains(&entry.pid) || !self.matches(&entry.program) {
                continue;
            }
            if !process_alive(entry.pid) {
                continue;
            }
            tracing::info!(pid = entry.pid, cmdline = %entry.cmdline, "Killing old instance");
            match self.try_terminate(entry.pid, self.kill_timeout).await {
                TerminateOutcome::Terminated => killed += 1,
                TerminateOutcome::AlreadyGone => {}
                outcome => tracing::warn!(pid = entry.pid, ?outcome, "Could not kill old instance"),
            }
        }
        killed
    }

    /// Polls a TCP connect to `localhost:port` until it is refused.
    pub async fn wait_for_port_free(&self, port: u16, timeout: Duration) -> bool {
        tracing::info!(port = port, "Waiting for port to be free");
        let deadline = Instant::now() + timeout;
        loop {
            let probe = tokio::time::timeout(
                PORT_PROBE_TIMEOUT,
                tokio::net::TcpStream::connect(("127.0.0.1", port)),
            )
            .await;
            match probe {
                Ok(Ok(_stream)) => {}
                Ok(Err(_)) | Err(_) => {
                    tracing::info!(port = port, "Port is free");
                    return true;
                }
            }
            if Instant::now() >= deadline {
                tracing::warn!(port = port, timeout_secs = timeout.as_secs(), "Port still in use");
                return false;
            }
            sleep(PORT_POLL).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::process::CommandExt;
    use std::process::{Child, Command};

    fn manager(dir: &Path, patterns: &[&str]) -> PidManager {
        PidManager::new(dir, patterns.iter().map(|p| p.to_string()).collect())
    }

    fn spawn_sleep(arg: &str) -> Child {
        Command::new("sleep").arg(arg).spawn().unwrap()
    }

    /// `sleep 30` running under another `argv[0]`.
    fn spawn_named(name: &str) -> Child {
        Command::new("sleep").arg0(name).arg("30").spawn().unwrap()
    }

    fn unique_name(tag: &str) -> String {
        format!("komihub-{tag}-{}", std::process::id())
    }

    #[tokio::test]
    async fn test_save_and_read_pids() {
        let dir = tempfile::tempdir().unwrap();
        let pids = manager(dir.path(), &[]);

        assert_eq!(pids.bot_pid().await, None);
        assert_eq!(pids.save_bot_pid(Some(1234)).await.unwrap(), 1234);
        assert_eq!(pids.bot_pid().await, Some(1234));
        assert_eq!(std::fs::read_to_string(dir.path().join("bot.pid")).unwrap(), "1234");

        let own = pids.save_server_pid(None).await.unwrap();
        assert_eq!(own, std::process::id());
        assert_eq!(pids.server_pid().await, Some(own));
    }

    #[tokio::test]
    async fn test_garbage_pid_file() {
        let dir = tempfile::tempdir().unwrap();
        let pids = manager(dir.path(), &[]);
        std::fs::write(dir.path().join("bot.pid"), "not-a-pid").unwrap();
        assert_eq!(pids.bot_pid().await, None);
        assert!(!pids.is_running(None).await);
    }

    #[tokio::test]
    async fn test_is_running_self_and_saved() {
        let dir = tempfile::tempdir().unwrap();
        let pids = manager(dir.path(), &[]);
        assert!(pids.is_running(Some(std::process::id())).await);
        assert!(!pids.is_running(None).await);
        pids.save_bot_pid(None).await.unwrap();
        assert!(pids.is_running(None).await);
        assert!(!pids.is_running(Some(0)).await);
    }

    #[tokio::test]
    async fn test_zombie_is_not_running() {
        let dir = tempfile::tempdir().unwrap();
        let pids = manager(dir.path(), &[]);
        let mut child = Command::new("true").spawn().unwrap();
        let pid = child.id();
        tokio::time::sleep(Duration::from_millis(300)).await;

        // Exited but not yet reaped.
        assert!(!pids.is_running(Some(pid)).await);
        child.wait().unwrap();
    }

    #[tokio::test]
    async fn test_kill_process_graceful() {
        let dir = tempfile::tempdir().unwrap();
        let pids = manager(dir.path(), &[]);
        let mut child = spawn_sleep("30");
        let pid = child.id();

        assert!(pids.is_running(Some(pid)).await);
        assert_eq!(
            pids.try_terminate(pid, Duration::from_secs(2)).await,
            TerminateOutcome::Terminated
        );
        assert!(!pids.is_running(Some(pid)).await);
        child.wait().unwrap();
    }

    #[tokio::test]
    async fn test_kill_process_escalates_to_sigkill() {
        let dir = tempfile::tempdir().unwrap();
        let pids = manager(dir.path(), &[]);
        let mut child = Command::new("sh")
            .args(["-c", "trap '' TERM; exec sleep 30"])
            .spawn()
            .unwrap();
        let pid = child.id();
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(pids.kill_process(pid, Duration::from_millis(300)).await);
        assert!(!pids.is_running(Some(pid)).await);
        child.wait().unwrap();
    }

    #[tokio::test]
    async fn test_kill_process_already_gone() {
        let dir = tempfile::tempdir().unwrap();
        let pids = manager(dir.path(), &[]);
        let mut child = Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();

        assert!(pids.kill_process(pid, Duration::from_millis(100)).await);
    }

    #[test]
    fn test_matches_program_only() {
        let dir = tempfile::tempdir().unwrap();
        let pids = manager(dir.path(), &["komihub", "/opt/bots/komihub-server"]);
        assert!(pids.matches("/usr/local/bin/komihub"));
        assert!(pids.matches("komihub"));
        assert!(pids.matches("/usr/local/bin/komihub (deleted)"));
        assert!(pids.matches("/opt/bots/komihub-server"));
        assert!(!pids.matches("/srv/komihub-server"));
        assert!(!pids.matches("/usr/bin/komihub-helper"));
        assert!(!pids.matches("tail"));
    }

    #[test]
    fn test_current_exe_is_absolute() {
        let exe = current_exe().unwrap();
        assert!(exe.is_absolute());
        assert!(!exe.to_string_lossy().ends_with(DELETED_SUFFIX));
    }

    #[test]
    fn test_list_processes_includes_self() {
        let own = std::process::id();
        let list = list_processes();
        let me = list.iter().find(|p| p.pid == own).unwrap();
        assert!(!me.program.is_empty());
        assert!(me.cmdline.starts_with(&me.program));
    }

    #[tokio::test]
    async fn test_cleanup_spares_excluded_process() {
        let dir = tempfile::tempdir().unwrap();
        let name = unique_name("sweep");
        let pids = manager(dir.path(), &[name.as_str()]);

        let mut first = spawn_named(&name);
        let mut second = spawn_named(&name);
        let mut kept = spawn_named(&name);
        tokio::time::sleep(Duration::from_millis(200)).await;

        let killed = pids.cleanup_old_instances_except(&[kept.id()]).await;
        assert_eq!(killed, 2);
        assert!(!pids.is_running(Some(first.id())).await);
        assert!(!pids.is_running(Some(second.id())).await);
        assert!(pids.is_running(Some(kept.id())).await);

        kept.kill().unwrap();
        for child in [&mut first, &mut second, &mut kept] {
            child.wait().unwrap();
        }
    }

    #[tokio::test]
    async fn test_cleanup_excludes_own_process() {
        let dir = tempfile::tempdir().unwrap();
        let own_name = current_exe()
            .unwrap()
            .file_name()
            .unwrap()
            .to_string_lossy()
            .into_owned();
        let pids = manager(dir.path(), &[own_name.as_str()]);

        let mut first = spawn_named(&own_name);
        let mut second = spawn_named(&own_name);
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(pids.cleanup_old_instances().await, 2);
        assert!(!pids.is_running(Some(first.id())).await);
        assert!(!pids.is_running(Some(second.id())).await);
        assert!(pids.is_running(Some(std::process::id())).await);

        first.wait().unwrap();
        second.wait().unwrap();
    }

    #[tokio::test]
    async fn test_cleanup_ignores_name_in_arguments() {
        let dir = tempfile::tempdir().unwrap();
        let name = unique_name("viewer");
        let log = dir.path().join(format!("{name}.log"));
        std::fs::write(&log, "started\n").unwrap();
        let pids = manager(dir.path(), &[name.as_str()]);

        let mut viewer = Command::new("tail").arg("-f").arg(&log).spawn().unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(pids.cleanup_old_instances().await, 0);
        assert!(pids.is_running(Some(viewer.id())).await);

        viewer.kill().unwrap();
        viewer.wait().unwrap();
    }

    #[tokio::test]
    async fn test_cleanup_uses_configured_kill_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let name = unique_name("stubborn");
        let pids = manager(dir.path(), &[name.as_str()])
            .with_kill_timeout(Duration::from_millis(200));

        // The trailing `:` keeps the shell from exec-ing into sleep.
        let mut stubborn = Command::new("sh")
            .arg0(&name)
            .args(["-c", "trap '' TERM; sleep 5; :"])
            .spawn()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let started = std::time::Instant::now();
        assert_eq!(pids.cleanup_old_instances().await, 1);
        assert!(started.elapsed() < Duration::from_secs(2));
        stubborn.wait().unwrap();
    }

    #[tokio::test]
    async fn test_cleanup_without_matches() {
        let dir = tempfile::tempdir().unwrap();
        let pids = manager(dir.path(), &["komihub-no-such-process-pattern-0xdead"]);
        assert_eq!(pids.cleanup_old_instances().await, 0);
    }

    #[tokio::test]
    async fn test_wait_for_port_free_while_bound() {
        let dir = tempfile::tempdir().unwrap();
        let pids = manager(dir.path(), &[]);
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        assert!(!pids.wait_for_port_free(port, Duration::from_secs(1)).await);
        drop(listener);
    }

    #[tokio::test]
    async fn test_wait_for_port_free_after_release() {
        let dir = tempfile::tempdir().unwrap();
        let pids = manager(dir.path(), &[]);
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let release = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(700)).await;
            drop(listener);
        });

        let started = std::time::Instant::now();
        assert!(pids.wait_for_port_free(port, Duration::from_secs(10)).await);
        assert!(started.elapsed() < Duration::from_secs(3));
        release.await.unwrap();
    }
}
