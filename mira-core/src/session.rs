//! Transport session: owns the stream-socket connection.
//!
//! Either accepts one inbound connection (the device pushes its stream
//! to us) or dials a loopback endpoint (a local forwarder exposes the
//! device stream). Raw byte chunks are pushed downstream unframed —
//! framing is entirely the demuxer's job.
//!
//! Only the first inbound connection is meaningful: peers may open
//! extra control/audio channels the core ignores, so any subsequent
//! connection is accepted and immediately closed.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Notify, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::MiraError;
use crate::stats::PipelineStats;

/// Read buffer size for the socket reader task.
const READ_CHUNK_SIZE: usize = 64 * 1024;

/// Dial retry cadence while the loopback endpoint is not up yet.
const DIAL_RETRY_INTERVAL: Duration = Duration::from_millis(100);

// ── Configuration ────────────────────────────────────────────────

/// Transport direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionMode {
    /// Bind a listener and accept the device's inbound connection.
    /// Port `0` binds an ephemeral port (see
    /// [`TransportSession::local_addr`]).
    Listen { port: u32 },
    /// Dial out to a loopback forwarder and wait for it to come up.
    Connect { port: u32 },
}

// ── State machine ────────────────────────────────────────────────

/// Failure classification carried by [`SessionState::Failed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionErrorKind {
    InvalidPort,
    Bind,
    Listener,
    Connect,
    Receive,
    Cancelled,
    Timeout,
}

impl SessionErrorKind {
    fn into_error(self) -> MiraError {
        match self {
            Self::InvalidPort => MiraError::InvalidPort(0),
            Self::Bind => MiraError::Bind(other_io("bind failed")),
            Self::Listener => MiraError::Listener(other_io("listener failed")),
            Self::Connect => MiraError::Connect(other_io("connect failed")),
            Self::Receive => MiraError::Receive(other_io("receive failed")),
            Self::Cancelled => MiraError::Cancelled,
            Self::Timeout => MiraError::Timeout(Duration::ZERO),
        }
    }
}

fn other_io(msg: &str) -> std::io::Error {
    std::io::Error::other(msg.to_string())
}

/// Connection lifecycle.
///
/// ```text
///  Idle ──► Listening ─┐
///    │                 ├──► Connected ──► Disconnected
///    └──► Connecting ──┘
///
///  any non-terminal state ──► Failed(kind)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Idle,
    Listening,
    Connecting,
    Connected,
    Disconnected,
    Failed(SessionErrorKind),
}

impl SessionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    /// Terminal states: nothing further will be delivered.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Disconnected | Self::Failed(_))
    }
}

// ── Channels ─────────────────────────────────────────────────────

/// Receiver ends handed to the pipeline owner.
pub struct SessionChannels {
    /// State transitions, newest value wins.
    pub state: watch::Receiver<SessionState>,
    /// Raw byte chunks, unbounded-length, unframed.
    pub chunks: mpsc::UnboundedReceiver<Bytes>,
}

// ── TransportSession ─────────────────────────────────────────────

/// One socket connection, listen or dial.
pub struct TransportSession {
    mode: SessionMode,
    state_tx: watch::Sender<SessionState>,
    /// Moved into the reader task on start, so the chunk channel closes
    /// when the stream ends.
    chunk_tx: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
    running: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
    local_addr: Arc<Mutex<Option<SocketAddr>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    stats: Arc<PipelineStats>,
}

impl TransportSession {
    pub fn new(mode: SessionMode, stats: Arc<PipelineStats>) -> (Self, SessionChannels) {
        let (state_tx, state_rx) = watch::channel(SessionState::Idle);
        let (chunk_tx, chunk_rx) = mpsc::unbounded_channel();
        (
            Self {
                mode,
                state_tx,
                chunk_tx: Mutex::new(Some(chunk_tx)),
                running: Arc::new(AtomicBool::new(false)),
                shutdown: Arc::new(Notify::new()),
                local_addr: Arc::new(Mutex::new(None)),
                tasks: Mutex::new(Vec::new()),
                stats,
            },
            SessionChannels {
                state: state_rx,
                chunks: chunk_rx,
            },
        )
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        *self.state_tx.borrow()
    }

    /// Bound listener address, once listening (useful with port `0`).
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().unwrap()
    }

    /// Open the endpoint and start delivering chunks.
    ///
    /// Listen mode returns once the listener is bound (accepting happens
    /// in the background); connect mode returns once dialing has begun.
    pub async fn start(&self) -> Result<(), MiraError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        match self.mode.clone() {
            SessionMode::Listen { port } => self.start_listen(port).await,
            SessionMode::Connect { port } => self.start_connect(port),
        }
    }

    async fn start_listen(&self, port: u32) -> Result<(), MiraError> {
        if port > u16::MAX as u32 {
            self.fail(SessionErrorKind::InvalidPort);
            return Err(MiraError::InvalidPort(port));
        }
        let listener = match TcpListener::bind(("0.0.0.0", port as u16)).await {
            Ok(l) => l,
            Err(e) => {
                self.fail(SessionErrorKind::Bind);
                return Err(MiraError::Bind(e));
            }
        };
        let addr = listener.local_addr().map_err(MiraError::Bind)?;
        *self.local_addr.lock().unwrap() = Some(addr);
        self.set_state(SessionState::Listening);
        info!(%addr, "listening for device connection");

        let Some(ctx) = self.task_context() else {
            return Ok(());
        };
        let task = tokio::spawn(async move {
            ctx.accept_loop(listener).await;
        });
        self.tasks.lock().unwrap().push(task);
        Ok(())
    }

    fn start_connect(&self, port: u32) -> Result<(), MiraError> {
        if port == 0 || port > u16::MAX as u32 {
            self.fail(SessionErrorKind::InvalidPort);
            return Err(MiraError::InvalidPort(port));
        }
        self.set_state(SessionState::Connecting);
        let Some(ctx) = self.task_context() else {
            return Ok(());
        };
        let task = tokio::spawn(async move {
            ctx.dial_loop(port as u16).await;
        });
        self.tasks.lock().unwrap().push(task);
        Ok(())
    }

    /// Tear down listener and connection. Idempotent, callable from any
    /// thread; in-flight reader tasks observe the shutdown signal.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.shutdown.notify_waiters();
        self.state_tx.send_modify(|state| {
            if !state.is_terminal() {
                *state = SessionState::Disconnected;
            }
        });
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
        debug!("session stopped");
    }

    /// Suspend until connected, or fail with a typed error.
    pub async fn wait_ready(&self, timeout: Duration) -> Result<(), MiraError> {
        let mut rx = self.state_tx.subscribe();
        let wait = async {
            loop {
                let state = *rx.borrow_and_update();
                match state {
                    SessionState::Connected => return Ok(()),
                    SessionState::Failed(kind) => return Err(kind.into_error()),
                    SessionState::Disconnected => return Err(MiraError::Cancelled),
                    _ => {}
                }
                if rx.changed().await.is_err() {
                    return Err(MiraError::ChannelClosed);
                }
            }
        };
        match tokio::time::timeout(timeout, wait).await {
            Ok(result) => result,
            Err(_) => Err(MiraError::Timeout(timeout)),
        }
    }

    fn set_state(&self, state: SessionState) {
        let _ = self.state_tx.send(state);
    }

    fn fail(&self, kind: SessionErrorKind) {
        warn!(?kind, "session failed");
        self.set_state(SessionState::Failed(kind));
    }

    /// Bundle the handles the background tasks need. Consumes the chunk
    /// sender; `None` after the first call.
    fn task_context(&self) -> Option<TaskContext> {
        let chunk_tx = self.chunk_tx.lock().unwrap().take()?;
        Some(TaskContext {
            state_tx: self.state_tx.clone(),
            chunk_tx,
            running: self.running.clone(),
            shutdown: self.shutdown.clone(),
            stats: self.stats.clone(),
        })
    }
}

impl Drop for TransportSession {
    fn drop(&mut self) {
        self.stop();
    }
}

// ── Background tasks ─────────────────────────────────────────────

/// Shared handles moved into the spawned accept/dial/read tasks.
struct TaskContext {
    state_tx: watch::Sender<SessionState>,
    chunk_tx: mpsc::UnboundedSender<Bytes>,
    running: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
    stats: Arc<PipelineStats>,
}

impl TaskContext {
    fn set_state(&self, state: SessionState) {
        let _ = self.state_tx.send(state);
    }

    fn fail(&self, kind: SessionErrorKind) {
        warn!(?kind, "session failed");
        self.set_state(SessionState::Failed(kind));
    }

    async fn accept_loop(self, listener: TcpListener) {
        // First meaningful connection.
        let stream = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    info!(%peer, "device connected");
                    stream
                }
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    self.fail(SessionErrorKind::Listener);
                    return;
                }
            },
            _ = self.shutdown.notified() => return,
        };
        self.set_state(SessionState::Connected);

        // Keep the listener alive to absorb auxiliary channels.
        let aux = async {
            loop {
                match listener.accept().await {
                    Ok((_extra, peer)) => {
                        debug!(%peer, "auxiliary connection accepted and closed");
                    }
                    Err(e) => {
                        warn!(error = %e, "auxiliary accept failed");
                        break;
                    }
                }
            }
        };

        tokio::select! {
            _ = self.read_loop(stream) => {}
            _ = aux => {}
        }
    }

    async fn dial_loop(self, port: u16) {
        let addr: SocketAddr = ([127, 0, 0, 1], port).into();
        let stream = loop {
            if !self.running.load(Ordering::SeqCst) {
                return;
            }
            let attempt = tokio::select! {
                attempt = TcpStream::connect(addr) => attempt,
                _ = self.shutdown.notified() => return,
            };
            match attempt {
                Ok(stream) => break stream,
                // The forwarder may not be up yet; keep dialing until
                // the caller's wait_ready deadline gives up.
                Err(e) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
                    tokio::time::sleep(DIAL_RETRY_INTERVAL).await;
                }
                Err(e) => {
                    warn!(error = %e, "dial failed");
                    self.fail(SessionErrorKind::Connect);
                    return;
                }
            }
        };
        info!(%addr, "connected to forwarder");
        self.set_state(SessionState::Connected);
        self.read_loop(stream).await;
    }

    async fn read_loop(&self, mut stream: TcpStream) {
        let mut buf = vec![0u8; READ_CHUNK_SIZE];
        loop {
            let read = tokio::select! {
                read = stream.read(&mut buf) => read,
                _ = self.shutdown.notified() => {
                    self.set_state(SessionState::Disconnected);
                    return;
                }
            };
            match read {
                Ok(0) => {
                    info!("peer closed the stream");
                    self.set_state(SessionState::Disconnected);
                    return;
                }
                Ok(n) => {
                    self.stats.add_bytes_received(n as u64);
                    if self.chunk_tx.send(Bytes::copy_from_slice(&buf[..n])).is_err() {
                        // Downstream gone; nothing left to deliver to.
                        self.set_state(SessionState::Disconnected);
                        return;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "receive error");
                    self.fail(SessionErrorKind::Receive);
                    return;
                }
            }
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use tokio::io::AsyncWriteExt;

    use super::*;

    fn session(mode: SessionMode) -> (TransportSession, SessionChannels) {
        TransportSession::new(mode, Arc::new(PipelineStats::new()))
    }

    #[tokio::test]
    async fn listen_accepts_and_delivers_chunks() {
        let (sess, mut channels) = session(SessionMode::Listen { port: 0 });
        sess.start().await.unwrap();
        let addr = sess.local_addr().unwrap();

        let mut client = TcpStream::connect(("127.0.0.1", addr.port())).await.unwrap();
        sess.wait_ready(Duration::from_secs(2)).await.unwrap();

        client.write_all(b"hello").await.unwrap();
        let chunk = channels.chunks.recv().await.unwrap();
        assert_eq!(&chunk[..], b"hello");

        sess.stop();
    }

    #[tokio::test]
    async fn auxiliary_connections_are_closed() {
        let (sess, mut channels) = session(SessionMode::Listen { port: 0 });
        sess.start().await.unwrap();
        let addr = sess.local_addr().unwrap();

        let mut first = TcpStream::connect(("127.0.0.1", addr.port())).await.unwrap();
        sess.wait_ready(Duration::from_secs(2)).await.unwrap();

        // A second channel (e.g. audio) is accepted and dropped; the
        // meaningful connection keeps flowing.
        let _second = TcpStream::connect(("127.0.0.1", addr.port())).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        first.write_all(b"still here").await.unwrap();
        let chunk = channels.chunks.recv().await.unwrap();
        assert_eq!(&chunk[..], b"still here");

        sess.stop();
    }

    #[tokio::test]
    async fn wait_ready_times_out() {
        let (sess, _channels) = session(SessionMode::Listen { port: 0 });
        sess.start().await.unwrap();

        let err = sess.wait_ready(Duration::from_millis(50)).await;
        assert!(matches!(err, Err(MiraError::Timeout(_))));
        sess.stop();
    }

    #[tokio::test]
    async fn invalid_port_fails_typed() {
        let (sess, mut channels) = session(SessionMode::Listen { port: 70_000 });
        assert!(matches!(
            sess.start().await,
            Err(MiraError::InvalidPort(70_000))
        ));
        channels
            .state
            .wait_for(|s| matches!(s, SessionState::Failed(SessionErrorKind::InvalidPort)))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn connect_mode_reaches_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port() as u32;

        let (sess, mut channels) = session(SessionMode::Connect { port });
        sess.start().await.unwrap();

        let (mut server_side, _) = listener.accept().await.unwrap();
        sess.wait_ready(Duration::from_secs(2)).await.unwrap();

        server_side.write_all(&[1, 2, 3]).await.unwrap();
        let chunk = channels.chunks.recv().await.unwrap();
        assert_eq!(&chunk[..], &[1, 2, 3]);

        sess.stop();
    }

    #[tokio::test]
    async fn peer_close_transitions_to_disconnected() {
        let (sess, mut channels) = session(SessionMode::Listen { port: 0 });
        sess.start().await.unwrap();
        let addr = sess.local_addr().unwrap();

        let client = TcpStream::connect(("127.0.0.1", addr.port())).await.unwrap();
        sess.wait_ready(Duration::from_secs(2)).await.unwrap();
        drop(client);

        channels
            .state
            .wait_for(|s| matches!(s, SessionState::Disconnected))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let (sess, _channels) = session(SessionMode::Listen { port: 0 });
        sess.start().await.unwrap();
        sess.stop();
        sess.stop();
        assert!(sess.state().is_terminal());
    }

    #[tokio::test]
    async fn bytes_received_counted() {
        let stats = Arc::new(PipelineStats::new());
        let (sess, mut channels) =
            TransportSession::new(SessionMode::Listen { port: 0 }, stats.clone());
        sess.start().await.unwrap();
        let addr = sess.local_addr().unwrap();

        let mut client = TcpStream::connect(("127.0.0.1", addr.port())).await.unwrap();
        sess.wait_ready(Duration::from_secs(2)).await.unwrap();
        client.write_all(&[0u8; 128]).await.unwrap();

        let mut received = 0;
        while received < 128 {
            received += channels.chunks.recv().await.unwrap().len();
        }
        assert_eq!(received, 128);
        assert_eq!(stats.snapshot().bytes_received, 128);
        sess.stop();
    }
}
