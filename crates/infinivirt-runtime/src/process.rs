//! Hypervisor worker process: launch, PID tracking, liveness, kill.
//!
//! The worker daemonizes itself and writes its PID file; the parent exec
//! returns once daemonization completes, so the PID is read back from the
//! file rather than from the spawned child.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, info, warn};

use infinivirt_core::error::VmError;
use infinivirt_host::exec;

/// How long to wait for the daemonized worker to write its PID file.
const PID_WAIT: Duration = Duration::from_secs(2);
const PID_POLL: Duration = Duration::from_millis(100);

#[derive(Debug)]
pub struct HypervisorProcess {
    pid: u32,
    pid_file: PathBuf,
}

impl HypervisorProcess {
    /// Launch the worker command and resolve its daemonized PID.
    ///
    /// Rejects with `PROCESS_ERROR` when daemonization completes without a
    /// readable PID.
    pub async fn launch(
        program: &str,
        args: &[String],
        pid_file: &Path,
    ) -> Result<Self, VmError> {
        let argv: Vec<&str> = args.iter().map(|s| s.as_str()).collect();
        exec::run_ok(program, &argv)
            .await
            .map_err(|e| VmError::Process(format!("hypervisor launch failed: {:#}", e)))?;

        let deadline = tokio::time::Instant::now() + PID_WAIT;
        loop {
            if let Some(pid) = read_pid_file(pid_file) {
                info!(pid, pid_file = %pid_file.display(), "hypervisor launched");
                return Ok(Self {
                    pid,
                    pid_file: pid_file.to_path_buf(),
                });
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(VmError::Process(format!(
                    "hypervisor daemonized but wrote no readable PID to {}",
                    pid_file.display()
                )));
            }
            tokio::time::sleep(PID_POLL).await;
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn pid_file(&self) -> &Path {
        &self.pid_file
    }

    pub fn is_alive(&self) -> bool {
        is_pid_alive(self.pid)
    }

    /// SIGKILL the worker. A process that is already gone is fine.
    pub async fn force_kill(&self) -> Result<(), VmError> {
        force_kill(self.pid).await
    }
}

/// Parse the PID file if present and well-formed.
pub fn read_pid_file(path: &Path) -> Option<u32> {
    std::fs::read_to_string(path)
        .ok()?
        .trim()
        .parse::<u32>()
        .ok()
}

/// Liveness probe: signal-0 plus a zombie check on `/proc/<pid>/stat`.
///
/// EPERM on the signal means the process exists under another uid, which
/// still counts as alive. Any unexpected probe failure also counts as alive
/// so a flaky probe never declares a crash.
pub fn is_pid_alive(pid: u32) -> bool {
    probe_alive(pid, Path::new("/proc"))
}

fn probe_alive(pid: u32, proc_root: &Path) -> bool {
    let ret = unsafe { libc::kill(pid as libc::pid_t, 0) };
    if ret != 0 {
        let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
        return match errno {
            libc::ESRCH => false,
            libc::EPERM => true,
            _ => {
                debug!(pid, errno, "unexpected probe errno, assuming alive");
                true
            }
        };
    }

    // The signal reaches zombies too; a zombie has no running VM behind it.
    match std::fs::read_to_string(proc_root.join(pid.to_string()).join("stat")) {
        Ok(stat) => stat_state(&stat) != Some('Z'),
        Err(_) => true,
    }
}

/// State field of `/proc/<pid>/stat`: the first character after the
/// parenthesized comm, which may itself contain spaces and parens.
fn stat_state(stat: &str) -> Option<char> {
    let after_comm = &stat[stat.rfind(')')? + 1..];
    after_comm.split_whitespace().next()?.chars().next()
}

/// SIGTERM a process by PID. Missing processes are benign.
pub async fn signal_term(pid: u32) -> Result<(), VmError> {
    send_signal(pid, "-TERM").await
}

/// SIGKILL a process by PID. Missing processes are benign.
pub async fn force_kill(pid: u32) -> Result<(), VmError> {
    send_signal(pid, "-KILL").await
}

async fn send_signal(pid: u32, signal: &str) -> Result<(), VmError> {
    let pid_str = pid.to_string();
    let output = exec::run("kill", &[signal, &pid_str])
        .await
        .map_err(|e| VmError::Process(format!("kill {} failed: {:#}", pid, e)))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.to_lowercase().contains("no such process") {
            debug!(pid, "process already gone");
            return Ok(());
        }
        return Err(VmError::Process(format!(
            "kill {} {} failed: {}",
            signal,
            pid,
            stderr.trim()
        )));
    }
    Ok(())
}

/// Poll until the process exits or the timeout lapses. Returns whether it
/// exited.
pub async fn wait_for_exit(pid: u32, timeout: Duration, poll: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if !is_pid_alive(pid) {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            warn!(pid, "process did not exit within {:?}", timeout);
            return false;
        }
        tokio::time::sleep(poll).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use infinivirt_host::exec_mock::{MockResponse, mock};

    /// Spawn and reap a short-lived child to get a PID that is surely dead.
    fn dead_pid() -> u32 {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();
        pid
    }

    #[test]
    fn test_own_process_is_alive() {
        assert!(is_pid_alive(std::process::id()));
    }

    #[test]
    fn test_reaped_child_is_dead() {
        assert!(!is_pid_alive(dead_pid()));
    }

    #[test]
    fn test_zombie_counts_as_dead() {
        let child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        // Give it a moment to exit; unreaped it is now a zombie.
        std::thread::sleep(Duration::from_millis(200));
        assert!(!is_pid_alive(pid));
        drop(child);
    }

    #[test]
    fn test_stat_state_parses_comm_with_spaces() {
        assert_eq!(stat_state("123 (qemu-system x86) S 1 123"), Some('S'));
        assert_eq!(stat_state("123 (weird (comm)) Z 1 123"), Some('Z'));
        assert_eq!(stat_state("garbage"), None);
    }

    #[test]
    fn test_read_pid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vm.pid");
        assert_eq!(read_pid_file(&path), None);
        std::fs::write(&path, "4242\n").unwrap();
        assert_eq!(read_pid_file(&path), Some(4242));
        std::fs::write(&path, "not a pid").unwrap();
        assert_eq!(read_pid_file(&path), None);
    }

    #[tokio::test]
    async fn test_launch_reads_pid_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("vm.pid");
        std::fs::write(&pid_file, "4242").unwrap();

        let (_guard, calls) = mock().install();
        let process = HypervisorProcess::launch(
            "qemu-system-x86_64",
            &["-daemonize".to_string()],
            &pid_file,
        )
        .await
        .unwrap();

        assert_eq!(process.pid(), 4242);
        assert_eq!(
            calls.lock().unwrap().as_slice(),
            ["qemu-system-x86_64 -daemonize"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_launch_without_pid_is_process_error() {
        let dir = tempfile::tempdir().unwrap();
        let (_guard, _calls) = mock().install();

        let err = HypervisorProcess::launch(
            "qemu-system-x86_64",
            &["-daemonize".to_string()],
            &dir.path().join("never.pid"),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, VmError::Process(ref m) if m.contains("no readable PID")));
    }

    #[tokio::test]
    async fn test_launch_failure_is_process_error() {
        let dir = tempfile::tempdir().unwrap();
        let (_guard, _calls) = mock()
            .on("qemu-system-x86_64", MockResponse::err(1, "could not open disk"))
            .install();

        let err = HypervisorProcess::launch(
            "qemu-system-x86_64",
            &[],
            &dir.path().join("vm.pid"),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, VmError::Process(ref m) if m.contains("could not open disk")));
    }

    #[tokio::test]
    async fn test_force_kill_tolerates_missing_process() {
        let (_guard, _calls) = mock()
            .on("kill", MockResponse::err(1, "kill: (999999) - No such process"))
            .install();
        assert!(force_kill(999_999).await.is_ok());
    }

    #[tokio::test]
    async fn test_wait_for_exit_on_dead_pid() {
        assert!(wait_for_exit(dead_pid(), Duration::from_secs(1), Duration::from_millis(10)).await);
    }
}
