//! PTY wrapper using portable-pty.
//!
//! Owns one shell process attached to a pseudo-terminal. Output and exit
//! are reported as [`PtyEvent`]s on a channel; input, resize and
//! termination are driven through [`PtyHandle`].

use super::shell::{build_argv, resolve_shell, STRIPPED_ENV};
use parking_lot::Mutex;
use portable_pty::{native_pty_system, ChildKiller, CommandBuilder, MasterPty, PtySize};
use ptyhub_core::{HubError, HubResult};
use std::io::{ErrorKind, Read, Write};
use std::path::Path;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Read size for the output pump.
const READ_CHUNK: usize = 8192;

/// How long the exit watcher lets the reader drain trailing output.
const EXIT_DRAIN: Duration = Duration::from_millis(250);

/// Something the terminal process did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PtyEvent {
    /// A chunk of output, in emission order.
    Output(Vec<u8>),
    /// The process exited. Always the last event.
    Exited(Option<u32>),
}

/// Parameters for [`PtyHandle::spawn`].
#[derive(Debug, Clone, Copy)]
pub struct SpawnRequest<'a> {
    pub cwd: &'a Path,
    pub cols: u16,
    pub rows: u16,
    pub command: Option<&'a [String]>,
    pub shell: Option<&'a str>,
}

enum PtyState {
    Open {
        master: Box<dyn MasterPty + Send>,
        input: mpsc::UnboundedSender<Vec<u8>>,
        cols: u16,
        rows: u16,
    },
    Closed,
}

#[derive(Debug, Clone, Copy)]
enum Stage {
    Term,
    Kill,
}

/// A managed PTY instance.
pub struct PtyHandle {
    pid: Option<u32>,
    state: Mutex<PtyState>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
}

impl PtyHandle {
    /// Spawn a login shell (optionally running `command` first) in a new PTY.
    ///
    /// Must be called from within a tokio runtime: the reader, writer and
    /// exit watcher run on the blocking pool.
    pub fn spawn(req: SpawnRequest<'_>) -> HubResult<(Self, mpsc::UnboundedReceiver<PtyEvent>)> {
        let pty_system = native_pty_system();
        let size = PtySize {
            rows: req.rows,
            cols: req.cols,
            pixel_width: 0,
            pixel_height: 0,
        };

        let pair = pty_system
            .openpty(size)
            .map_err(|e| HubError::Spawn(format!("failed to open PTY: {e}")))?;

        let shell = resolve_shell(req.shell);
        let mut cmd = CommandBuilder::from_argv(build_argv(&shell, req.command));
        cmd.cwd(req.cwd);
        cmd.env("TERM", "xterm-256color");
        for key in STRIPPED_ENV {
            cmd.env_remove(key);
        }

        let mut child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| HubError::Spawn(format!("failed to spawn {shell}: {e}")))?;
        drop(pair.slave);

        let pid = child.process_id();
        let killer = child.clone_killer();

        let mut reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| HubError::Spawn(format!("failed to clone PTY reader: {e}")))?;
        let mut writer = pair
            .master
            .take_writer()
            .map_err(|e| HubError::Spawn(format!("failed to take PTY writer: {e}")))?;

        info!(?pid, shell = %shell, cwd = %req.cwd.display(), cols = req.cols, rows = req.rows, "PTY spawned");

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (input_tx, mut input_rx) = mpsc::unbounded_channel::<Vec<u8>>();

        let output_tx = events_tx.clone();
        let reader_task = tokio::task::spawn_blocking(move || {
            let mut buf = [0u8; READ_CHUNK];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if output_tx.send(PtyEvent::Output(buf[..n].to_vec())).is_err() {
                            break;
                        }
                    }
                    Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                    Err(e) => {
                        // EIO once the slave side is gone.
                        debug!(error = %e, "PTY reader finished");
                        break;
                    }
                }
            }
        });

        tokio::task::spawn_blocking(move || {
            while let Some(data) = input_rx.blocking_recv() {
                if let Err(e) = writer.write_all(&data).and_then(|_| writer.flush()) {
                    debug!(error = %e, "PTY writer finished");
                    break;
                }
            }
        });

        tokio::spawn(async move {
            let code = match tokio::task::spawn_blocking(move || child.wait()).await {
                Ok(Ok(status)) => Some(status.exit_code()),
                Ok(Err(e)) => {
                    warn!(error = %e, "wait on PTY child failed");
                    None
                }
                Err(e) => {
                    warn!(error = %e, "PTY wait task failed");
                    None
                }
            };
            let _ = tokio::time::timeout(EXIT_DRAIN, reader_task).await;
            info!(?pid, ?code, "PTY child exited");
            let _ = events_tx.send(PtyEvent::Exited(code));
        });

        let handle = Self {
            pid,
            state: Mutex::new(PtyState::Open {
                master: pair.master,
                input: input_tx,
                cols: req.cols,
                rows: req.rows,
            }),
            killer: Mutex::new(killer),
        };
        Ok((handle, events_rx))
    }

    /// Forward input to the terminal. Returns `false` once closed.
    pub fn write(&self, data: &[u8]) -> bool {
        match &*self.state.lock() {
            PtyState::Open { input, .. } => input.send(data.to_vec()).is_ok(),
            PtyState::Closed => false,
        }
    }

    /// Resize the terminal. Callers clamp first; returns `false` once closed.
    pub fn resize(&self, new_cols: u16, new_rows: u16) -> bool {
        let mut state = self.state.lock();
        let PtyState::Open {
            master, cols, rows, ..
        } = &mut *state
        else {
            return false;
        };
        let size = PtySize {
            rows: new_rows,
            cols: new_cols,
            pixel_width: 0,
            pixel_height: 0,
        };
        match master.resize(size) {
            Ok(()) => {
                *cols = new_cols;
                *rows = new_rows;
                debug!(cols = new_cols, rows = new_rows, "PTY resized");
                true
            }
            Err(e) => {
                warn!(error = %e, "PTY resize failed");
                false
            }
        }
    }

    /// Close the terminal handle. Idempotent.
    pub fn close(&self) {
        let mut state = self.state.lock();
        if matches!(*state, PtyState::Open { .. }) {
            *state = PtyState::Closed;
            debug!(pid = ?self.pid, "PTY closed");
        }
    }

    /// Whether the terminal handle is still open.
    #[cfg(test)]
    pub fn is_open(&self) -> bool {
        matches!(*self.state.lock(), PtyState::Open { .. })
    }

    /// Current terminal size, if still open.
    pub fn size(&self) -> Option<(u16, u16)> {
        match &*self.state.lock() {
            PtyState::Open { cols, rows, .. } => Some((*cols, *rows)),
            PtyState::Closed => None,
        }
    }

    /// OS process id of the shell.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Close the terminal and kill the whole process tree.
    ///
    /// SIGTERM to the process group, wait `grace`, then SIGKILL. Each step
    /// falls back to the direct child; failures mean the process is
    /// already gone and are ignored.
    pub async fn terminate(&self, grace: Duration) {
        self.close();
        self.signal_tree(Stage::Term);
        tokio::time::sleep(grace).await;
        self.signal_tree(Stage::Kill);
    }

    #[cfg(unix)]
    fn signal_tree(&self, stage: Stage) {
        use nix::sys::signal::{kill, killpg, Signal};
        use nix::unistd::Pid;

        let Some(raw) = self.pid.and_then(|p| i32::try_from(p).ok()) else {
            self.kill_child();
            return;
        };
        let signal = match stage {
            Stage::Term => Signal::SIGTERM,
            Stage::Kill => Signal::SIGKILL,
        };
        let pid = Pid::from_raw(raw);
        if killpg(pid, signal).is_err() {
            if let Err(e) = kill(pid, signal) {
                debug!(pid = raw, ?signal, error = %e, "process already gone");
            }
        }
    }

    #[cfg(not(unix))]
    fn signal_tree(&self, stage: Stage) {
        if matches!(stage, Stage::Kill) {
            self.kill_child();
        }
    }

    fn kill_child(&self) {
        if let Err(e) = self.killer.lock().kill() {
            debug!(pid = ?self.pid, error = %e, "process already gone");
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Instant;

    fn request<'a>(cwd: &'a Path, command: Option<&'a [String]>) -> SpawnRequest<'a> {
        SpawnRequest {
            cwd,
            cols: 80,
            rows: 24,
            command,
            shell: Some("/bin/sh"),
        }
    }

    async fn collect_until(
        rx: &mut mpsc::UnboundedReceiver<PtyEvent>,
        needle: &str,
        limit: Duration,
    ) -> String {
        let deadline = Instant::now() + limit;
        let mut seen = Vec::new();
        while Instant::now() < deadline {
            match tokio::time::timeout(Duration::from_millis(100), rx.recv()).await {
                Ok(Some(PtyEvent::Output(chunk))) => {
                    seen.extend_from_slice(&chunk);
                    if String::from_utf8_lossy(&seen).contains(needle) {
                        break;
                    }
                }
                Ok(Some(PtyEvent::Exited(_))) | Ok(None) => break,
                Err(_) => continue,
            }
        }
        String::from_utf8_lossy(&seen).into_owned()
    }

    #[tokio::test]
    async fn runs_command_in_cwd() {
        let dir = tempfile::tempdir().unwrap();
        let cmd = vec!["pwd".to_string()];
        let (pty, mut rx) = PtyHandle::spawn(request(dir.path(), Some(&cmd))).unwrap();
        assert!(pty.pid().is_some());

        let name = dir.path().file_name().unwrap().to_string_lossy().into_owned();
        let out = collect_until(&mut rx, &name, Duration::from_secs(5)).await;
        assert!(out.contains(&name), "output was {out:?}");

        pty.terminate(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn input_is_echoed_through_shell() {
        let dir = tempfile::tempdir().unwrap();
        let (pty, mut rx) = PtyHandle::spawn(request(dir.path(), None)).unwrap();
        assert!(pty.write(b"echo ptyhub-$((40+2))\n"));

        let out = collect_until(&mut rx, "ptyhub-42", Duration::from_secs(5)).await;
        assert!(out.contains("ptyhub-42"), "output was {out:?}");

        pty.terminate(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn closed_handle_rejects_io() {
        let dir = tempfile::tempdir().unwrap();
        let (pty, _rx) = PtyHandle::spawn(request(dir.path(), None)).unwrap();
        assert!(pty.resize(100, 30));
        assert_eq!(pty.size(), Some((100, 30)));

        pty.close();
        assert!(!pty.is_open());
        assert!(!pty.write(b"ls\n"));
        assert!(!pty.resize(90, 20));
        assert_eq!(pty.size(), None);

        pty.terminate(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn terminate_reports_exit() {
        let dir = tempfile::tempdir().unwrap();
        let (pty, mut rx) = PtyHandle::spawn(request(dir.path(), None)).unwrap();
        pty.terminate(Duration::from_millis(50)).await;

        let exited = tokio::time::timeout(Duration::from_secs(5), async {
            while let Some(event) = rx.recv().await {
                if let PtyEvent::Exited(_) = event {
                    return true;
                }
            }
            false
        })
        .await
        .unwrap_or(false);
        assert!(exited);

        // A second terminate on a dead process is harmless.
        pty.terminate(Duration::from_millis(10)).await;
    }

    #[tokio::test]
    async fn agent_marker_is_not_inherited() {
        std::env::set_var("CLAUDECODE", "leaked");
        let dir = tempfile::tempdir().unwrap();
        let cmd = vec![
            "sh".to_string(),
            "-c".to_string(),
            "echo CC=${CLAUDECODE:-unset}".to_string(),
        ];
        let (pty, mut rx) = PtyHandle::spawn(request(dir.path(), Some(&cmd))).unwrap();

        let out = collect_until(&mut rx, "CC=unset", Duration::from_secs(5)).await;
        assert!(out.contains("CC=unset"), "output was {out:?}");
        assert!(!out.contains("CC=leaked"));

        pty.terminate(Duration::from_millis(50)).await;
    }

    /// Dead, or a zombie waiting to be reaped.
    #[cfg(target_os = "linux")]
    fn is_gone(pid: i32) -> bool {
        match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
            Err(_) => true,
            Ok(stat) => stat
                .rsplit_once(')')
                .map(|(_, rest)| rest.trim_start().starts_with('Z'))
                .unwrap_or(false),
        }
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn terminate_kills_the_process_group() {
        let dir = tempfile::tempdir().unwrap();
        let pidfile = dir.path().join("inner.pid");
        let cmd = vec![
            "sh".to_string(),
            "-c".to_string(),
            format!("echo $$ > {}; sleep 1000", pidfile.display()),
        ];
        let (pty, _rx) = PtyHandle::spawn(request(dir.path(), Some(&cmd))).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        let inner = loop {
            let pid = std::fs::read_to_string(&pidfile)
                .ok()
                .and_then(|s| s.trim().parse::<i32>().ok());
            if let Some(pid) = pid {
                break pid;
            }
            assert!(Instant::now() < deadline, "inner shell never started");
            tokio::time::sleep(Duration::from_millis(20)).await;
        };
        assert_ne!(Some(inner as u32), pty.pid());
        assert!(!is_gone(inner));

        pty.terminate(Duration::from_millis(200)).await;

        let deadline = Instant::now() + Duration::from_secs(2);
        while !is_gone(inner) && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(is_gone(inner), "inner shell {inner} survived terminate");
    }
}
