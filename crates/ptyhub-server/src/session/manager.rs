//! Session lifecycle management.
//!
//! The registry is the only owner of sessions. Each session pairs a PTY
//! with its output stream state; an output pump task feeds PTY events into
//! that state and arms the silence timer.
//!
//! Every mutation of a session's ring, subscriber set and idle state
//! happens under that session's lock, so appends, attaches and timer
//! firings are totally ordered per session.

use super::idle::Activity;
use super::output::{AttachOutcome, OutputState, ReplayLimits, REASON_DESTROYED};
use super::pty::{PtyEvent, PtyHandle, SpawnRequest};
use super::subscriber::{ConnectionHandle, ConnectionId};
use parking_lot::Mutex;
use ptyhub_core::{HubError, HubResult, CLOSE_GOING_AWAY, CLOSE_NORMAL};
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Tunables applied to every session the manager creates.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub max_sessions: usize,
    pub ring_capacity: usize,
    pub replay: ReplayLimits,
    pub idle_threshold: Duration,
    pub kill_grace: Duration,
    /// Shell override; `$SHELL` or the platform default when unset.
    pub shell: Option<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_sessions: 64,
            ring_capacity: 2 * 1024 * 1024,
            replay: ReplayLimits {
                max_burst: 128 * 1024,
                chunk_size: 64 * 1024,
            },
            idle_threshold: Duration::from_millis(5000),
            kill_grace: Duration::from_millis(200),
            shell: None,
        }
    }
}

/// Information returned when listing sessions.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: String,
    pub cwd: PathBuf,
    pub pid: Option<u32>,
    pub cols: Option<u16>,
    pub rows: Option<u16>,
    /// Total bytes of output so far; the cursor a fresh viewer starts at.
    pub cursor: u64,
    /// Bytes of history still available for replay.
    pub retained: usize,
    pub idle: bool,
    pub idle_threshold_ms: u64,
    /// Milliseconds since the last output, if any was produced.
    pub silent_ms: Option<u64>,
    pub attached: usize,
    pub exited: bool,
}

struct SessionInner {
    output: OutputState,
    idle_timer: Option<JoinHandle<()>>,
    destroyed: bool,
}

impl SessionInner {
    fn cancel_timer(&mut self) {
        if let Some(timer) = self.idle_timer.take() {
            timer.abort();
        }
    }
}

/// One PTY plus everything needed to fan out and replay its output.
pub struct Session {
    pub id: String,
    pub cwd: PathBuf,
    pub created_at: Instant,
    pty: PtyHandle,
    inner: Mutex<SessionInner>,
}

impl Session {
    fn handle_output(self: &Arc<Self>, chunk: &[u8]) {
        let mut inner = self.inner.lock();
        if inner.destroyed {
            return;
        }
        inner.cancel_timer();
        let rearm = inner.output.on_output(chunk, Instant::now());

        let weak = Arc::downgrade(self);
        inner.idle_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(rearm.after).await;
            if let Some(session) = weak.upgrade() {
                session.handle_idle_timer(rearm.generation);
            }
        }));
    }

    fn handle_idle_timer(&self, generation: u64) {
        let mut inner = self.inner.lock();
        if inner.output.on_idle_timer(generation) {
            inner.idle_timer = None;
            debug!(session_id = %self.id, "idle");
        }
    }

    fn handle_exit(&self, code: Option<u32>) {
        let mut inner = self.inner.lock();
        inner.cancel_timer();
        inner.output.on_exit(code);
        drop(inner);
        self.pty.close();
        info!(session_id = %self.id, ?code, "session process exited");
    }

    /// Close viewers, stop the timer and close the terminal. The process
    /// tree is killed separately via [`PtyHandle::terminate`].
    fn shut_down(&self, code: u16, reason: &'static str) {
        let mut inner = self.inner.lock();
        inner.destroyed = true;
        inner.cancel_timer();
        inner.output.shutdown(code, reason);
        drop(inner);
        self.pty.close();
    }

    fn attach(
        &self,
        conn: &ConnectionHandle,
        cursor: u64,
        limits: ReplayLimits,
    ) -> Option<AttachOutcome> {
        let mut inner = self.inner.lock();
        if inner.destroyed {
            return None;
        }
        Some(inner.output.attach(conn, cursor, limits))
    }

    fn detach(&self, id: ConnectionId) -> bool {
        self.inner.lock().output.detach(id)
    }

    fn configure_idle(&self, threshold: Duration) {
        self.inner.lock().output.configure_idle(threshold);
    }

    fn info(&self) -> SessionInfo {
        let size = self.size();
        let inner = self.inner.lock();
        let idle = inner.output.idle();
        SessionInfo {
            id: self.id.clone(),
            cwd: self.cwd.clone(),
            pid: self.pty.pid(),
            cols: size.map(|(c, _)| c),
            rows: size.map(|(_, r)| r),
            cursor: inner.output.total_written(),
            retained: inner.output.retained(),
            idle: idle.state() == Activity::Idle,
            idle_threshold_ms: idle.threshold().as_millis() as u64,
            silent_ms: idle
                .last_output_at()
                .map(|at| at.elapsed().as_millis() as u64),
            attached: inner.output.subscriber_count(),
            exited: inner.output.has_exited(),
        }
    }

    /// Current terminal size, `None` once the terminal is closed.
    pub fn size(&self) -> Option<(u16, u16)> {
        self.pty.size()
    }

    /// Total bytes of output produced so far.
    #[cfg(test)]
    pub fn total_written(&self) -> u64 {
        self.inner.lock().output.total_written()
    }
}

/// Manages all active sessions.
pub struct SessionManager {
    sessions: Arc<RwLock<HashMap<String, Arc<Session>>>>,
    config: SessionConfig,
}

impl SessionManager {
    /// Create a new session manager.
    pub fn new(config: SessionConfig) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            config,
        }
    }

    /// Spawn a PTY in `cwd` and register it under `id`.
    ///
    /// `cwd` is not validated here; a missing directory fails the spawn.
    pub async fn create(
        &self,
        id: String,
        cwd: &Path,
        cols: u16,
        rows: u16,
        command: Option<&[String]>,
    ) -> HubResult<SessionInfo> {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(&id) {
            return Err(HubError::SessionExists(id));
        }
        if sessions.len() >= self.config.max_sessions {
            return Err(HubError::LimitReached(self.config.max_sessions));
        }

        let (pty, events) = PtyHandle::spawn(SpawnRequest {
            cwd,
            cols,
            rows,
            command,
            shell: self.config.shell.as_deref(),
        })?;

        let session = Arc::new(Session {
            id: id.clone(),
            cwd: cwd.to_path_buf(),
            created_at: Instant::now(),
            pty,
            inner: Mutex::new(SessionInner {
                output: OutputState::new(self.config.ring_capacity, self.config.idle_threshold),
                idle_timer: None,
                destroyed: false,
            }),
        });

        tokio::spawn(pump_output(session.clone(), events));

        info!(session_id = %id, cwd = %cwd.display(), "session created");
        let info = session.info();
        sessions.insert(id, session);
        Ok(info)
    }

    /// Destroy a session: close its viewers, then kill its process tree in
    /// the background. Returns `false` if unknown.
    pub async fn destroy(&self, id: &str) -> bool {
        let Some(session) = self.sessions.write().await.remove(id) else {
            return false;
        };
        session.shut_down(CLOSE_NORMAL, REASON_DESTROYED);
        let grace = self.config.kill_grace;
        tokio::spawn(async move {
            session.pty.terminate(grace).await;
        });
        info!(session_id = %id, "session destroyed");
        true
    }

    /// Destroy every session and wait for their process trees to die.
    pub async fn shutdown(&self) {
        let drained: Vec<Arc<Session>> = self
            .sessions
            .write()
            .await
            .drain()
            .map(|(_, s)| s)
            .collect();
        if drained.is_empty() {
            return;
        }
        info!(count = drained.len(), "terminating all sessions");
        let grace = self.config.kill_grace;
        let kills = drained.iter().map(|session| {
            session.shut_down(CLOSE_GOING_AWAY, "server shutdown");
            session.pty.terminate(grace)
        });
        futures_util::future::join_all(kills).await;
    }

    /// List all active sessions, oldest first.
    pub async fn list(&self) -> Vec<SessionInfo> {
        let sessions = self.sessions.read().await;
        let mut all: Vec<&Arc<Session>> = sessions.values().collect();
        all.sort_by_key(|s| s.created_at);
        all.into_iter().map(|s| s.info()).collect()
    }

    /// Attach a connection, replaying what it is missing after `cursor`.
    /// Returns `false` if the session does not exist.
    pub async fn attach(&self, id: &str, conn: &ConnectionHandle, cursor: u64) -> bool {
        let Some(session) = self.get(id).await else {
            return false;
        };
        match session.attach(conn, cursor, self.config.replay) {
            Some(outcome) => {
                info!(
                    session_id = %id,
                    connection = conn.id(),
                    client_cursor = cursor,
                    replay_from = outcome.replay_from,
                    replayed = outcome.replayed,
                    cursor = outcome.cursor,
                    "client attached"
                );
                true
            }
            None => false,
        }
    }

    /// Detach a connection. No-op if either side is already gone.
    pub async fn detach(&self, id: &str, conn: ConnectionId) {
        if let Some(session) = self.get(id).await {
            if session.detach(conn) {
                info!(session_id = %id, connection = conn, "client detached");
            }
        }
    }

    /// Send input to the session's terminal.
    pub async fn write(&self, id: &str, data: &[u8]) -> bool {
        match self.get(id).await {
            Some(session) => session.pty.write(data),
            None => false,
        }
    }

    /// Resize the session's terminal. Dimensions must already be clamped.
    pub async fn resize(&self, id: &str, cols: u16, rows: u16) -> bool {
        match self.get(id).await {
            Some(session) => session.pty.resize(cols, rows),
            None => false,
        }
    }

    /// Change the silence threshold of the session's idle detector.
    pub async fn configure_idle(&self, id: &str, threshold_ms: u64) -> bool {
        match self.get(id).await {
            Some(session) => {
                session.configure_idle(Duration::from_millis(threshold_ms));
                debug!(session_id = %id, threshold_ms, "idle threshold configured");
                true
            }
            None => false,
        }
    }

    /// Look up a live session.
    pub async fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.read().await.get(id).cloned()
    }

    /// Get the number of active sessions.
    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }
}

async fn pump_output(session: Arc<Session>, mut events: mpsc::UnboundedReceiver<PtyEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            PtyEvent::Output(chunk) => session.handle_output(&chunk),
            PtyEvent::Exited(code) => {
                session.handle_exit(code);
                break;
            }
        }
    }
}

/// Generate a random session ID (hex-encoded, 16 bytes = 32 hex chars).
pub fn generate_session_id() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    let bytes: Vec<u8> = (0..16).map(|_| rng.gen()).collect();
    hex::encode(bytes)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::session::subscriber::Outbound;
    use ptyhub_core::ServerFrame;

    fn manager() -> SessionManager {
        SessionManager::new(SessionConfig {
            max_sessions: 2,
            shell: Some("/bin/sh".into()),
            kill_grace: Duration::from_millis(50),
            ..SessionConfig::default()
        })
    }

    /// Receive until `pred` matches a message, collecting terminal bytes.
    async fn recv_until(
        rx: &mut mpsc::UnboundedReceiver<Outbound>,
        bytes: &mut Vec<u8>,
        mut pred: impl FnMut(&Outbound, &[u8]) -> bool,
    ) -> Option<Outbound> {
        let wait = async {
            while let Some(msg) = rx.recv().await {
                if let Outbound::Data(d) = &msg {
                    bytes.extend_from_slice(d);
                }
                if pred(&msg, bytes) {
                    return Some(msg);
                }
            }
            None
        };
        tokio::time::timeout(Duration::from_secs(5), wait)
            .await
            .ok()
            .flatten()
    }

    fn contains(haystack: &[u8], needle: &str) -> bool {
        String::from_utf8_lossy(haystack).contains(needle)
    }

    #[tokio::test]
    async fn create_list_destroy() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager();
        let info = mgr
            .create("s1".into(), dir.path(), 80, 24, None)
            .await
            .unwrap();
        assert_eq!(info.id, "s1");

        let listed = mgr.list().await;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].cwd, dir.path());
        assert_eq!((listed[0].cols, listed[0].rows), (Some(80), Some(24)));
        assert!(listed[0].pid.is_some());
        assert!(!listed[0].idle);
        assert_eq!(listed[0].idle_threshold_ms, 5000);
        assert!(!listed[0].exited);

        assert!(mgr.destroy("s1").await);
        assert!(!mgr.destroy("s1").await);
        assert!(mgr.list().await.is_empty());
    }

    #[tokio::test]
    async fn destroy_is_terminal() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager();
        mgr.create("gone".into(), dir.path(), 80, 24, None)
            .await
            .unwrap();

        let (conn, mut rx) = ConnectionHandle::new();
        assert!(mgr.attach("gone", &conn, 0).await);
        assert!(mgr.destroy("gone").await);

        let mut bytes = Vec::new();
        let closed = recv_until(&mut rx, &mut bytes, |m, _| {
            matches!(m, Outbound::Close { .. })
        })
        .await;
        assert_eq!(
            closed,
            Some(Outbound::Close {
                code: CLOSE_NORMAL,
                reason: REASON_DESTROYED
            })
        );

        let (late, _late_rx) = ConnectionHandle::new();
        assert!(!mgr.write("gone", b"ls\n").await);
        assert!(!mgr.resize("gone", 100, 40).await);
        assert!(!mgr.attach("gone", &late, 0).await);
        assert!(!mgr.configure_idle("gone", 100).await);
        mgr.detach("gone", late.id()).await;
    }

    #[tokio::test]
    async fn duplicate_and_limit() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager();
        mgr.create("a".into(), dir.path(), 80, 24, None).await.unwrap();
        assert!(matches!(
            mgr.create("a".into(), dir.path(), 80, 24, None).await,
            Err(HubError::SessionExists(_))
        ));
        mgr.create("b".into(), dir.path(), 80, 24, None).await.unwrap();
        assert!(matches!(
            mgr.create("c".into(), dir.path(), 80, 24, None).await,
            Err(HubError::LimitReached(2))
        ));
        mgr.shutdown().await;
        assert_eq!(mgr.count().await, 0);
    }

    #[tokio::test]
    async fn unknown_session_operations_fail_quietly() {
        let mgr = manager();
        let (conn, _rx) = ConnectionHandle::new();
        assert!(!mgr.attach("nope", &conn, 0).await);
        assert!(!mgr.write("nope", b"x").await);
        assert!(!mgr.resize("nope", 80, 24).await);
        mgr.detach("nope", conn.id()).await;
    }

    #[tokio::test]
    async fn output_reaches_viewer_and_replays_on_reattach() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager();
        mgr.create("io".into(), dir.path(), 80, 24, None).await.unwrap();

        let (conn, mut rx) = ConnectionHandle::new();
        assert!(mgr.attach("io", &conn, 0).await);
        assert!(mgr.write("io", b"echo marker-$((6*7))\n").await);

        let mut live = Vec::new();
        let hit = recv_until(&mut rx, &mut live, |_, b| contains(b, "marker-42")).await;
        assert!(hit.is_some(), "live output was {:?}", String::from_utf8_lossy(&live));

        mgr.detach("io", conn.id()).await;
        let total = mgr.get("io").await.unwrap().total_written();

        let (again, mut rx2) = ConnectionHandle::new();
        assert!(mgr.attach("io", &again, 0).await);
        let mut replay = Vec::new();
        let cursor = recv_until(&mut rx2, &mut replay, |m, _| {
            matches!(m, Outbound::Control(ServerFrame::Cursor { .. }))
        })
        .await;
        assert!(contains(&replay, "marker-42"));
        match cursor {
            Some(Outbound::Control(ServerFrame::Cursor { cursor })) => assert!(cursor >= total),
            other => panic!("expected cursor frame, got {other:?}"),
        }

        mgr.shutdown().await;
    }

    #[tokio::test]
    async fn silence_broadcasts_idle_once() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager();
        mgr.create("quiet".into(), dir.path(), 80, 24, None)
            .await
            .unwrap();
        assert!(mgr.configure_idle("quiet", 100).await);

        let (conn, mut rx) = ConnectionHandle::new();
        assert!(mgr.attach("quiet", &conn, 0).await);
        assert!(mgr.write("quiet", b"echo idle-$((1+1))\n").await);

        let mut bytes = Vec::new();
        let echoed = recv_until(&mut rx, &mut bytes, |_, b| contains(b, "idle-2")).await;
        assert!(echoed.is_some());
        let idle = recv_until(&mut rx, &mut bytes, |m, _| {
            *m == Outbound::Control(ServerFrame::Idle)
        })
        .await;
        assert_eq!(idle, Some(Outbound::Control(ServerFrame::Idle)));

        // Nothing else is said while the shell stays quiet.
        tokio::time::sleep(Duration::from_millis(300)).await;
        while let Ok(msg) = rx.try_recv() {
            assert_ne!(msg, Outbound::Control(ServerFrame::Idle));
        }

        assert!(mgr.write("quiet", b"echo again\n").await);
        let active = recv_until(&mut rx, &mut bytes, |m, _| {
            *m == Outbound::Control(ServerFrame::Active)
        })
        .await;
        assert!(active.is_some());

        mgr.shutdown().await;
    }

    #[tokio::test]
    async fn shell_exit_closes_viewers() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager();
        mgr.create("exit".into(), dir.path(), 80, 24, None)
            .await
            .unwrap();

        let (conn, mut rx) = ConnectionHandle::new();
        assert!(mgr.attach("exit", &conn, 0).await);
        assert!(mgr.write("exit", b"exit 3\n").await);

        let mut bytes = Vec::new();
        let closed = recv_until(&mut rx, &mut bytes, |m, _| {
            matches!(m, Outbound::Close { .. })
        })
        .await;
        assert!(matches!(
            closed,
            Some(Outbound::Close {
                code: CLOSE_NORMAL,
                ..
            })
        ));

        // Still registered until destroyed, but the terminal is closed.
        let listed = mgr.list().await;
        assert!(listed[0].exited);
        assert!(!mgr.write("exit", b"ls\n").await);
        assert!(mgr.destroy("exit").await);
    }

    #[test]
    fn session_ids_are_hex() {
        let id = generate_session_id();
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
