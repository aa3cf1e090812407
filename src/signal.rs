//! Cross-process signals between the narrator (TTS) and the recorder (STT).
//!
//! Each signal is a marker file in a shared coordination directory. Setting
//! creates the file; consuming removes it. `unlink` is atomic, so when two
//! readers race on the same marker exactly one of them observes it. Each
//! signal is still meant to have a single consumer process.
//!
//! The narrator also publishes the pid of the live player in `playback.pid`
//! so the recorder can terminate playback without waiting for a poll.

use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::time::Instant;

const PID_FILE: &str = "playback.pid";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalKind {
    /// STT -> TTS: stop talking and flush the queue.
    StopSpeaking,
    /// TTS -> STT: narration finished.
    TtsComplete,
    /// TTS -> waiters: a stop request has been honored.
    BargeInAck,
}

impl SignalKind {
    pub const ALL: [SignalKind; 3] = [
        SignalKind::StopSpeaking,
        SignalKind::TtsComplete,
        SignalKind::BargeInAck,
    ];

    pub fn file_name(self) -> &'static str {
        match self {
            SignalKind::StopSpeaking => "stop-speaking",
            SignalKind::TtsComplete => "tts-complete",
            SignalKind::BargeInAck => "barge-in-ack",
        }
    }
}

impl std::fmt::Display for SignalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.file_name())
    }
}

#[derive(Debug)]
pub enum SignalError {
    Io(PathBuf, io::Error),
}

impl std::fmt::Display for SignalError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignalError::Io(path, e) => write!(f, "Signal I/O error at {:?}: {}", path, e),
        }
    }
}

impl std::error::Error for SignalError {}

/// Default coordination directory: $TMPDIR/talkback
pub fn default_coordination_dir() -> PathBuf {
    std::env::temp_dir().join("talkback")
}

#[derive(Debug, Clone)]
pub struct SignalBus {
    dir: PathBuf,
    poll_interval: Duration,
}

impl SignalBus {
    pub fn new(dir: impl Into<PathBuf>, poll_interval: Duration) -> Self {
        Self {
            dir: dir.into(),
            poll_interval: poll_interval.max(Duration::from_millis(1)),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, kind: SignalKind) -> PathBuf {
        self.dir.join(kind.file_name())
    }

    pub fn pid_path(&self) -> PathBuf {
        self.dir.join(PID_FILE)
    }

    fn ensure_dir(&self) -> Result<(), SignalError> {
        fs::create_dir_all(&self.dir).map_err(|e| SignalError::Io(self.dir.clone(), e))
    }

    /// Set `kind`. Setting an already-set signal is a no-op.
    pub fn signal(&self, kind: SignalKind) -> Result<(), SignalError> {
        self.ensure_dir()?;
        let path = self.path(kind);
        OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| SignalError::Io(path.clone(), e))?;
        log::debug!("Signal set: {}", kind);
        Ok(())
    }

    /// Test-and-clear. Returns true if this call observed and removed the signal.
    pub fn check_and_clear(&self, kind: SignalKind) -> bool {
        match fs::remove_file(self.path(kind)) {
            Ok(()) => {
                log::debug!("Signal consumed: {}", kind);
                true
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => false,
            Err(e) => {
                log::warn!("Failed to clear signal {}: {}", kind, e);
                false
            }
        }
    }

    /// Peek without consuming.
    pub fn is_set(&self, kind: SignalKind) -> bool {
        self.path(kind).exists()
    }

    pub fn clear(&self, kind: SignalKind) {
        let _ = self.check_and_clear(kind);
    }

    pub fn clear_all(&self) {
        for kind in SignalKind::ALL {
            self.clear(kind);
        }
    }

    /// Poll until `kind` is observed (and consumed) or `timeout` passes.
    /// Returns false on timeout.
    pub async fn wait(&self, kind: SignalKind, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.check_and_clear(kind) {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    /// Record the live playback process: its pid and the program it runs.
    pub fn write_playback_pid(&self, pid: u32, program: &str) -> Result<(), SignalError> {
        self.ensure_dir()?;
        let path = self.pid_path();
        let name = Path::new(program)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(program);
        fs::write(&path, format!("{}\n{}\n", pid, name)).map_err(|e| SignalError::Io(path, e))
    }

    pub fn read_playback_pid(&self) -> Option<u32> {
        self.read_playback().map(|(pid, _)| pid)
    }

    fn read_playback(&self) -> Option<(u32, Option<String>)> {
        let text = fs::read_to_string(self.pid_path()).ok()?;
        let mut lines = text.lines();
        let pid = lines.next()?.trim().parse().ok()?;
        let program = lines
            .next()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty());
        Some((pid, program))
    }

    pub fn clear_playback_pid(&self) {
        let _ = fs::remove_file(self.pid_path());
    }

    /// The published pid, if that process is alive and still runs the
    /// program that was recorded with it. A stale marker is removed.
    fn live_playback_pid(&self) -> Option<u32> {
        let (pid, program) = self.read_playback()?;
        let matches = program
            .as_deref()
            .map(|p| process_runs(pid, p))
            .unwrap_or(true);
        if process_alive(pid) && matches {
            return Some(pid);
        }
        log::debug!("Removing stale playback pid {}", pid);
        self.clear_playback_pid();
        None
    }

    /// True if a playback pid is published and that process is alive.
    pub fn playback_active(&self) -> bool {
        self.live_playback_pid().is_some()
    }

    /// Signal stop-speaking and terminate any live playback right away.
    /// Returns true if a playback process was signalled.
    pub fn force_stop_speaking(&self) -> Result<bool, SignalError> {
        self.signal(SignalKind::StopSpeaking)?;
        let killed = match self.live_playback_pid() {
            Some(pid) => terminate(pid),
            None => false,
        };
        if killed {
            log::info!("Force-stopped playback process");
            self.clear_playback_pid();
        }
        Ok(killed)
    }
}

#[cfg(unix)]
fn terminate(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    // SAFETY: kill has no memory-safety preconditions
    unsafe { libc::kill(pid, libc::SIGTERM) == 0 }
}

#[cfg(not(unix))]
fn terminate(_pid: u32) -> bool {
    false
}

/// Kernel command names are cut to 15 bytes.
const COMM_LEN: usize = 15;

/// Compare against `/proc/<pid>/comm` where procfs exists; elsewhere the pid
/// is trusted.
fn process_runs(pid: u32, program: &str) -> bool {
    match fs::read_to_string(format!("/proc/{}/comm", pid)) {
        Ok(comm) => {
            let expected = &program.as_bytes()[..program.len().min(COMM_LEN)];
            comm.trim_end().as_bytes() == expected
        }
        Err(_) => true,
    }
}

#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // SAFETY: signal 0 only checks for existence
    pid > 0 && unsafe { libc::kill(pid, 0) == 0 }
}

#[cfg(not(unix))]
fn process_alive(_pid: u32) -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bus() -> (tempfile::TempDir, SignalBus) {
        let dir = tempfile::tempdir().unwrap();
        let bus = SignalBus::new(dir.path().join("coord"), Duration::from_millis(5));
        (dir, bus)
    }

    #[test]
    fn signal_then_check_and_clear() {
        let (_dir, bus) = bus();
        assert!(!bus.check_and_clear(SignalKind::StopSpeaking));

        bus.signal(SignalKind::StopSpeaking).unwrap();
        assert!(bus.is_set(SignalKind::StopSpeaking));
        assert!(bus.path(SignalKind::StopSpeaking).ends_with("stop-speaking"));

        assert!(bus.check_and_clear(SignalKind::StopSpeaking));
        assert!(!bus.check_and_clear(SignalKind::StopSpeaking));
    }

    #[test]
    fn resignal_before_consume_is_idempotent() {
        let (_dir, bus) = bus();
        bus.signal(SignalKind::TtsComplete).unwrap();
        bus.signal(SignalKind::TtsComplete).unwrap();
        assert!(bus.check_and_clear(SignalKind::TtsComplete));
        assert!(!bus.check_and_clear(SignalKind::TtsComplete));
    }

    #[test]
    fn signals_are_independent() {
        let (_dir, bus) = bus();
        bus.signal(SignalKind::BargeInAck).unwrap();
        assert!(!bus.check_and_clear(SignalKind::StopSpeaking));
        assert!(bus.is_set(SignalKind::BargeInAck));
        bus.clear_all();
        assert!(!bus.is_set(SignalKind::BargeInAck));
    }

    #[test]
    fn concurrent_clearers_observe_once() {
        let (_dir, bus) = bus();
        bus.signal(SignalKind::StopSpeaking).unwrap();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let bus = bus.clone();
                std::thread::spawn(move || bus.check_and_clear(SignalKind::StopSpeaking))
            })
            .collect();
        let observed = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|seen| *seen)
            .count();
        assert_eq!(observed, 1);
    }

    #[tokio::test]
    async fn wait_times_out_without_error() {
        let (_dir, bus) = bus();
        let start = std::time::Instant::now();
        assert!(!bus.wait(SignalKind::TtsComplete, Duration::from_millis(30)).await);
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[tokio::test]
    async fn wait_observes_and_consumes() {
        let (_dir, bus) = bus();
        let setter = bus.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            setter.signal(SignalKind::TtsComplete).unwrap();
        });
        assert!(bus.wait(SignalKind::TtsComplete, Duration::from_secs(2)).await);
        assert!(!bus.is_set(SignalKind::TtsComplete));
    }

    fn own_program() -> String {
        fs::read_to_string("/proc/self/comm")
            .map(|s| s.trim_end().to_string())
            .unwrap_or_else(|_| "talkback".into())
    }

    #[test]
    fn pid_marker_round_trip() {
        let (_dir, bus) = bus();
        assert_eq!(bus.read_playback_pid(), None);
        assert!(!bus.playback_active());

        bus.write_playback_pid(std::process::id(), &own_program()).unwrap();
        assert_eq!(bus.read_playback_pid(), Some(std::process::id()));
        assert!(bus.playback_active());

        bus.clear_playback_pid();
        assert_eq!(bus.read_playback_pid(), None);
    }

    #[test]
    fn force_stop_without_playback_only_signals() {
        let (_dir, bus) = bus();
        assert!(!bus.force_stop_speaking().unwrap());
        assert!(bus.check_and_clear(SignalKind::StopSpeaking));
    }

    #[cfg(unix)]
    #[test]
    fn force_stop_terminates_playback_process() {
        let (_dir, bus) = bus();
        let mut child = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        bus.write_playback_pid(child.id(), "/bin/sleep").unwrap();

        assert!(bus.force_stop_speaking().unwrap());
        let status = child.wait().unwrap();
        assert!(!status.success());
        assert_eq!(bus.read_playback_pid(), None);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn reused_pid_is_not_terminated() {
        let (_dir, bus) = bus();
        let mut child = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        // Marker left behind by a player whose pid now belongs to `sleep`
        bus.write_playback_pid(child.id(), "espeak-ng").unwrap();

        assert!(!bus.playback_active());
        assert_eq!(bus.read_playback_pid(), None);

        bus.write_playback_pid(child.id(), "espeak-ng").unwrap();
        assert!(!bus.force_stop_speaking().unwrap());
        assert!(child.try_wait().unwrap().is_none());
        assert_eq!(bus.read_playback_pid(), None);

        child.kill().unwrap();
        let _ = child.wait();
    }

    #[cfg(unix)]
    #[test]
    fn dead_pid_marker_is_removed() {
        let (_dir, bus) = bus();
        bus.write_playback_pid(u32::MAX - 1, "espeak-ng").unwrap();
        assert!(!bus.playback_active());
        assert!(!bus.pid_path().exists());
    }
}
