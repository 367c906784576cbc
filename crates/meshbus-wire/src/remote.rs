//! RemoteMember — the per-peer connection manager.
//!
//! A [`RemoteMember`] owns at most one outbound TCP connection to a peer's
//! command endpoint. Its lifecycle (connect, retry, session, teardown) runs
//! on one background task, so callers never block on connection state:
//!
//! - a connect attempt is bounded by the configured timeout and raced
//!   against cancellation; a cancelled attempt never schedules a retry
//! - failed attempts are retried after a fixed delay; every attempt counts
//!   against the configured budget, successful ones included, so a peer that
//!   keeps breaking sessions ends up `Failed` too
//! - on success the channel is stored, the member becomes `Alive`
//! - the peer closing the connection marks the member `Left` and ends the
//!   lifecycle; a mid-session transport error marks it `Left` and re-enters
//!   the retry schedule
//! - only [`RemoteMember::reconnect`] resets the budget
//!
//! Status changes are pushed to a [`StatusObserver`] (the membership
//! registry) keyed by the member's identity.
//!
//! Sends never wait on the network: frames go through an unbounded queue to
//! a single writer task, which is the only place the socket is written.

use crate::codec::encode_envelope;
use crate::error::WireError;
use crate::frame::{read_frame, write_frame};
use crate::listener::{dispatch_frame, stopped, EnvelopeHandler};
use meshbus_types::config::ConnectionConfig;
use meshbus_types::{
    BusResult, Envelope, Member, MemberCore, MemberKey, MemberStatus, StatusObserver,
};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Observable state of a member's connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No lifecycle has been started.
    Idle,
    /// A connect attempt is in flight or a retry is scheduled.
    Connecting,
    /// A channel is established.
    Connected,
    /// The peer closed the connection.
    Disconnected,
    /// Retries were exhausted; the peer is presumed unreachable.
    Unreachable,
    /// The caller cancelled the in-flight attempt.
    Cancelled,
    /// The manager was shut down.
    Closed,
}

impl ConnectionState {
    /// Whether the lifecycle task has nothing left to do in this state.
    pub fn is_settled(self) -> bool {
        matches!(
            self,
            Self::Idle | Self::Disconnected | Self::Unreachable | Self::Cancelled | Self::Closed
        )
    }
}

enum ConnectOutcome {
    Cancelled,
    Failed(WireError),
    Connected(TcpStream),
}

enum SessionEnd {
    /// Peer closed the connection at a frame boundary.
    Inactive,
    /// Transport failure while connected.
    Failed(WireError),
    /// Cancellation or shutdown.
    Stopped,
}

struct Lifecycle {
    cancel_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Connection manager for one remote peer.
pub struct RemoteMember {
    core: MemberCore,
    config: ConnectionConfig,
    observer: Arc<dyn StatusObserver>,
    inbound: Option<Arc<dyn EnvelopeHandler>>,
    channel: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    state_tx: watch::Sender<ConnectionState>,
    attempts: AtomicU32,
    lifecycle: Mutex<Option<Lifecycle>>,
    closed: AtomicBool,
}

impl RemoteMember {
    /// Create a manager without starting it. See [`RemoteMember::start`].
    pub fn new(key: MemberKey, config: ConnectionConfig, observer: Arc<dyn StatusObserver>) -> Self {
        Self::with_core(MemberCore::new(key), config, observer)
    }

    /// Create a manager around existing member state (e.g. from gossip).
    pub fn with_core(
        core: MemberCore,
        config: ConnectionConfig,
        observer: Arc<dyn StatusObserver>,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Idle);
        Self {
            core,
            config,
            observer,
            inbound: None,
            channel: Mutex::new(None),
            state_tx,
            attempts: AtomicU32::new(0),
            lifecycle: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    /// Deliver envelopes the peer writes back on this connection to `handler`.
    pub fn with_inbound(mut self, handler: Arc<dyn EnvelopeHandler>) -> Self {
        self.inbound = Some(handler);
        self
    }

    /// Wrap in an `Arc` and spawn the connection lifecycle.
    ///
    /// Returns immediately; must be called inside a tokio runtime.
    pub fn start(self) -> Arc<Self> {
        let member = Arc::new(self);
        member.connect_in_background();
        member
    }

    /// Spawn the connection lifecycle for a manager the caller already shares.
    ///
    /// Lets the caller publish the member (e.g. into the registry) before any
    /// status change can be reported. Returns whether a cycle was started.
    pub fn connect_in_background(self: &Arc<Self>) -> bool {
        self.start_cycle()
    }

    /// Start a fresh connect cycle if none is running.
    ///
    /// Used after the peer left, was cancelled, or was declared unreachable
    /// and has since been rediscovered. The attempt budget starts over.
    /// Returns whether a cycle was started.
    pub fn reconnect(self: &Arc<Self>) -> bool {
        self.start_cycle()
    }

    /// Stop the lifecycle: abort the in-flight connect attempt or pending
    /// retry, or close an established session (reported as `Left`). No retry
    /// follows.
    pub fn cancel_connect(&self) {
        let lifecycle = self.lifecycle.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(lifecycle) = lifecycle.as_ref() {
            let _ = lifecycle.cancel_tx.send(true);
        }
    }

    /// Release the transport and the lifecycle task. Idempotent.
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(member = %self.core.key(), "Closing TCP connection");

        self.channel
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();

        let lifecycle = self
            .lifecycle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(lifecycle) = lifecycle {
            let _ = lifecycle.cancel_tx.send(true);
            lifecycle.task.abort();
        }

        self.state_tx.send_replace(ConnectionState::Closed);
    }

    /// Queue an envelope on the established channel.
    ///
    /// Returns [`WireError::NoChannel`] when not connected; nothing is buffered.
    pub fn send_command(&self, envelope: &Envelope) -> Result<(), WireError> {
        let Some(tx) = self
            .channel
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
        else {
            trace!(member = %self.core.key(), topic = %envelope.topic, "No channel, dropping envelope");
            return Err(WireError::NoChannel(*self.core.key()));
        };

        let frame = encode_envelope(envelope)?;
        tx.send(frame)
            .map_err(|_| WireError::NoChannel(*self.core.key()))
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Watch lifecycle state changes.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.channel
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    /// Connect attempts made since the cycle was started. Successful
    /// connects count against the budget too.
    pub fn connect_attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    fn start_cycle(self: &Arc<Self>) -> bool {
        let mut lifecycle = self.lifecycle.lock().unwrap_or_else(|e| e.into_inner());
        // Checked under the lock: shutdown() sets the flag before taking it.
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }
        if let Some(running) = lifecycle.as_ref() {
            // A settled state is the task's last action before it returns.
            if !running.task.is_finished() && !self.state().is_settled() {
                return false;
            }
            running.task.abort();
        }

        let (cancel_tx, cancel_rx) = watch::channel(false);
        self.attempts.store(0, Ordering::SeqCst);
        self.set_state(ConnectionState::Connecting);

        let member = Arc::clone(self);
        let task = tokio::spawn(async move { member.run(cancel_rx).await });
        *lifecycle = Some(Lifecycle { cancel_tx, task });
        true
    }

    async fn run(self: Arc<Self>, mut cancel_rx: watch::Receiver<bool>) {
        debug!(member = %self.core.key(), "Initializing command client");
        loop {
            match self.connect(&mut cancel_rx).await {
                ConnectOutcome::Cancelled => {
                    warn!(member = %self.core.key(), "Connection cancelled by user");
                    self.set_state(ConnectionState::Cancelled);
                    return;
                }
                ConnectOutcome::Failed(e) => {
                    debug!(
                        member = %self.core.key(),
                        attempt = self.connect_attempts(),
                        "Connect failed: {}", e
                    );
                }
                ConnectOutcome::Connected(stream) => {
                    match self.session(stream, &mut cancel_rx).await {
                        SessionEnd::Inactive => {
                            debug!(member = %self.core.key(), "Member left");
                            self.publish_status(MemberStatus::Left);
                            self.set_state(ConnectionState::Disconnected);
                            return;
                        }
                        SessionEnd::Stopped => {
                            debug!(member = %self.core.key(), "Session cancelled");
                            self.publish_status(MemberStatus::Left);
                            self.set_state(ConnectionState::Cancelled);
                            return;
                        }
                        SessionEnd::Failed(e) => {
                            warn!(member = %self.core.key(), "Member failed: {}", e);
                            self.publish_status(MemberStatus::Left);
                            self.set_state(ConnectionState::Connecting);
                        }
                    }
                }
            }

            if !self.wait_for_retry(&mut cancel_rx).await {
                return;
            }
        }
    }

    async fn connect(&self, cancel_rx: &mut watch::Receiver<bool>) -> ConnectOutcome {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let addr = self.core.key().command_addr();
        let timeout = self.config.connect_timeout();

        let attempt = async {
            let socket = TcpSocket::new_v4()?;
            socket.set_keepalive(true)?;
            let stream = tokio::time::timeout(timeout, socket.connect(addr))
                .await
                .map_err(|_| WireError::ConnectTimeout { addr, timeout })??;
            stream.set_nodelay(true)?;
            Ok::<_, WireError>(stream)
        };

        tokio::select! {
            biased;
            _ = stopped(cancel_rx) => ConnectOutcome::Cancelled,
            result = attempt => match result {
                Ok(stream) => ConnectOutcome::Connected(stream),
                Err(e) => ConnectOutcome::Failed(e),
            },
        }
    }

    /// Sleep until the next attempt is due.
    ///
    /// Returns false when the cycle is over: retries exhausted or cancelled.
    async fn wait_for_retry(&self, cancel_rx: &mut watch::Receiver<bool>) -> bool {
        let attempts = self.connect_attempts();
        if attempts >= self.config.max_connect_attempts {
            warn!(
                member = %self.core.key(),
                attempts,
                "Could not connect to member after max retries"
            );
            self.publish_status(MemberStatus::Failed);
            self.set_state(ConnectionState::Unreachable);
            return false;
        }

        tokio::select! {
            biased;
            _ = stopped(cancel_rx) => {
                debug!(member = %self.core.key(), "Retry cancelled");
                self.set_state(ConnectionState::Cancelled);
                false
            }
            _ = tokio::time::sleep(self.config.retry_interval()) => true,
        }
    }

    async fn session(&self, stream: TcpStream, cancel_rx: &mut watch::Receiver<bool>) -> SessionEnd {
        let peer = match stream.peer_addr() {
            Ok(peer) => peer,
            Err(e) => return SessionEnd::Failed(WireError::Io(e)),
        };
        let (mut reader, writer) = stream.into_split();
        let (tx, rx) = mpsc::unbounded_channel();
        let mut writer_task = tokio::spawn(write_loop(writer, rx));

        if !self.install_channel(tx) {
            writer_task.abort();
            return SessionEnd::Stopped;
        }
        info!(member = %self.core.key(), "Connected to member");
        self.publish_status(MemberStatus::Alive);
        self.set_state(ConnectionState::Connected);

        let end = loop {
            tokio::select! {
                _ = stopped(cancel_rx) => break SessionEnd::Stopped,
                written = &mut writer_task => break match written {
                    Ok(Ok(())) => SessionEnd::Stopped,
                    Ok(Err(e)) => SessionEnd::Failed(e),
                    Err(e) => SessionEnd::Failed(WireError::Io(std::io::Error::other(e))),
                },
                frame = read_frame(&mut reader) => match frame {
                    Ok(body) => match &self.inbound {
                        Some(handler) => dispatch_frame(&body, peer, handler.as_ref()).await,
                        None => trace!(member = %self.core.key(), len = body.len(), "Ignoring inbound frame"),
                    },
                    Err(WireError::ConnectionClosed) => break SessionEnd::Inactive,
                    Err(e) => break SessionEnd::Failed(e),
                },
            }
        };

        self.channel
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        writer_task.abort();
        end
    }

    fn install_channel(&self, tx: mpsc::UnboundedSender<Vec<u8>>) -> bool {
        let mut channel = self.channel.lock().unwrap_or_else(|e| e.into_inner());
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }
        *channel = Some(tx);
        true
    }

    fn set_state(&self, state: ConnectionState) {
        self.state_tx.send_if_modified(|current| {
            if *current == ConnectionState::Closed || *current == state {
                return false;
            }
            *current = state;
            true
        });
    }

    /// Apply a locally originated transition and push it to the observer.
    fn publish_status(&self, status: MemberStatus) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        if let Some(sequence) = self.core.transition(status) {
            debug!(member = %self.core.key(), %status, sequence, "Member status changed");
            self.observer.update_status(self.core.key(), status);
        }
    }
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
) -> Result<(), WireError> {
    while let Some(frame) = rx.recv().await {
        write_frame(&mut writer, &frame).await?;
    }
    Ok(())
}

impl Member for RemoteMember {
    fn core(&self) -> &MemberCore {
        &self.core
    }

    fn send(&self, envelope: &Envelope) -> BusResult<()> {
        self.send_command(envelope).map_err(Into::into)
    }

    fn shutdown(&self) {
        RemoteMember::shutdown(self);
    }
}

impl std::fmt::Debug for RemoteMember {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteMember")
            .field("key", self.core.key())
            .field("status", &self.core.status())
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::decode_envelope;
    use meshbus_types::BusError;
    use std::time::Duration;
    use tokio::net::TcpListener;

    #[derive(Default)]
    struct RecordingObserver {
        updates: Mutex<Vec<(MemberKey, MemberStatus)>>,
    }

    impl RecordingObserver {
        fn updates(&self) -> Vec<MemberStatus> {
            self.updates
                .lock()
                .unwrap()
                .iter()
                .map(|(_, status)| *status)
                .collect()
        }
    }

    impl StatusObserver for RecordingObserver {
        fn update_status(&self, key: &MemberKey, status: MemberStatus) {
            self.updates.lock().unwrap().push((*key, status));
        }
    }

    fn fast_config() -> ConnectionConfig {
        ConnectionConfig {
            connect_timeout_ms: 1000,
            retry_interval_ms: 20,
            max_connect_attempts: 3,
        }
    }

    fn key_for(port: u16) -> MemberKey {
        MemberKey::new(std::net::Ipv4Addr::LOCALHOST, port, port.wrapping_add(1))
    }

    /// A loopback port with nothing listening on it.
    async fn closed_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    async fn wait_for_state(member: &RemoteMember, state: ConnectionState) {
        let mut rx = member.subscribe_state();
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| *s == state))
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for {state:?}, at {:?}", member.state()))
            .unwrap();
    }

    fn envelope() -> Envelope {
        Envelope::new(key_for(9000), "HelloWorld", "SimpleMessage", vec![1, 2, 3])
    }

    #[tokio::test]
    async fn test_connect_and_send() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let observer = Arc::new(RecordingObserver::default());

        let member = RemoteMember::new(key_for(port), fast_config(), observer.clone()).start();
        let (mut server, _) = listener.accept().await.unwrap();
        wait_for_state(&member, ConnectionState::Connected).await;

        assert_eq!(member.status(), MemberStatus::Alive);
        assert_eq!(member.sequence(), 1);
        assert_eq!(observer.updates(), vec![MemberStatus::Alive]);

        member.send_command(&envelope()).unwrap();
        let body = tokio::time::timeout(Duration::from_secs(5), read_frame(&mut server))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(decode_envelope(&body).unwrap(), envelope());

        member.shutdown();
    }

    #[tokio::test]
    async fn test_peer_close_marks_left_once() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let observer = Arc::new(RecordingObserver::default());

        let member = RemoteMember::new(key_for(port), fast_config(), observer.clone()).start();
        let (server, _) = listener.accept().await.unwrap();
        wait_for_state(&member, ConnectionState::Connected).await;

        drop(server);
        wait_for_state(&member, ConnectionState::Disconnected).await;

        assert_eq!(member.status(), MemberStatus::Left);
        assert_eq!(member.sequence(), 2);
        assert_eq!(observer.updates(), vec![MemberStatus::Alive, MemberStatus::Left]);
        assert!(!member.is_connected());

        // The lifecycle ended; nothing reconnects on its own.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(
            observer
                .updates()
                .iter()
                .filter(|s| **s == MemberStatus::Left)
                .count(),
            1
        );
        member.shutdown();
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let port = closed_port().await;
        let observer = Arc::new(RecordingObserver::default());

        let member = RemoteMember::new(key_for(port), fast_config(), observer.clone()).start();
        wait_for_state(&member, ConnectionState::Unreachable).await;

        assert_eq!(member.connect_attempts(), 3);
        assert_eq!(member.status(), MemberStatus::Failed);
        assert_eq!(observer.updates(), vec![MemberStatus::Failed]);

        // Several retry intervals later, no fourth attempt has happened.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(member.connect_attempts(), 3);
        assert_eq!(member.state(), ConnectionState::Unreachable);
        member.shutdown();
    }

    #[tokio::test]
    async fn test_reconnect_after_peer_returns() {
        let port = closed_port().await;
        let observer = Arc::new(RecordingObserver::default());

        let member = RemoteMember::new(key_for(port), fast_config(), observer.clone()).start();
        wait_for_state(&member, ConnectionState::Unreachable).await;

        let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
        assert!(member.reconnect());
        let _server = listener.accept().await.unwrap();
        wait_for_state(&member, ConnectionState::Connected).await;

        assert_eq!(member.status(), MemberStatus::Alive);
        assert_eq!(observer.updates(), vec![MemberStatus::Failed, MemberStatus::Alive]);
        member.shutdown();
    }

    #[tokio::test]
    async fn test_cancel_during_retry_stops_cycle() {
        let port = closed_port().await;
        let observer = Arc::new(RecordingObserver::default());
        let config = ConnectionConfig {
            retry_interval_ms: 60_000,
            ..fast_config()
        };

        let member = RemoteMember::new(key_for(port), config, observer.clone()).start();
        tokio::time::timeout(Duration::from_secs(5), async {
            while member.connect_attempts() < 1 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        member.cancel_connect();
        wait_for_state(&member, ConnectionState::Cancelled).await;
        assert_eq!(member.connect_attempts(), 1);
        assert!(observer.updates().is_empty());
        member.shutdown();
    }

    #[tokio::test]
    async fn test_send_without_channel_is_dropped() {
        let observer = Arc::new(RecordingObserver::default());
        let member = RemoteMember::new(key_for(closed_port().await), fast_config(), observer);
        assert_eq!(member.state(), ConnectionState::Idle);

        let err = Member::send(&member, &envelope()).unwrap_err();
        assert!(matches!(err, BusError::SendDropped { .. }));
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let observer = Arc::new(RecordingObserver::default());

        // Never started.
        let idle = RemoteMember::new(key_for(closed_port().await), fast_config(), observer.clone());
        idle.shutdown();
        idle.shutdown();
        assert_eq!(idle.state(), ConnectionState::Closed);

        // Connected.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let member = RemoteMember::new(key_for(port), fast_config(), observer.clone()).start();
        let (mut server, _) = listener.accept().await.unwrap();
        wait_for_state(&member, ConnectionState::Connected).await;

        member.shutdown();
        member.shutdown();
        assert_eq!(member.state(), ConnectionState::Closed);
        assert!(!member.is_connected());
        assert!(!member.reconnect());
        assert!(!member.connect_in_background());
        assert_eq!(member.state(), ConnectionState::Closed);
        assert!(member.send_command(&envelope()).is_err());

        // The transport is released: the server sees end of stream.
        let closed = tokio::time::timeout(Duration::from_secs(5), read_frame(&mut server))
            .await
            .unwrap();
        assert!(matches!(closed, Err(WireError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_inbound_frames_reach_handler() {
        use async_trait::async_trait;

        struct Forward(mpsc::UnboundedSender<Envelope>);

        #[async_trait]
        impl EnvelopeHandler for Forward {
            async fn handle_envelope(&self, envelope: Envelope, _from: std::net::SocketAddr) {
                let _ = self.0.send(envelope);
            }
        }

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let member = RemoteMember::new(
            key_for(port),
            fast_config(),
            Arc::new(RecordingObserver::default()),
        )
        .with_inbound(Arc::new(Forward(tx)))
        .start();

        let (mut server, _) = listener.accept().await.unwrap();
        crate::frame::write_envelope(&mut server, &envelope())
            .await
            .unwrap();

        let received = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, envelope());
        member.shutdown();
    }

    #[tokio::test]
    async fn test_broken_sessions_use_up_attempt_budget() {
        use std::sync::atomic::AtomicUsize;
        use tokio::io::AsyncWriteExt;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let accepted = Arc::new(AtomicUsize::new(0));
        let server = {
            let accepted = Arc::clone(&accepted);
            tokio::spawn(async move {
                loop {
                    let (mut stream, _) = listener.accept().await.unwrap();
                    accepted.fetch_add(1, Ordering::SeqCst);
                    // Header announces 10 bytes, only one follows.
                    let _ = stream.write_all(&[0, 10, 1]).await;
                }
            })
        };
        let observer = Arc::new(RecordingObserver::default());

        let member = RemoteMember::new(key_for(port), fast_config(), observer.clone()).start();
        wait_for_state(&member, ConnectionState::Unreachable).await;

        // Several retry intervals later, no fourth connection was made.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(accepted.load(Ordering::SeqCst), 3);
        assert_eq!(member.connect_attempts(), 3);
        assert_eq!(member.state(), ConnectionState::Unreachable);
        assert!(!member.is_connected());
        assert_eq!(
            observer.updates(),
            vec![
                MemberStatus::Alive,
                MemberStatus::Left,
                MemberStatus::Alive,
                MemberStatus::Left,
                MemberStatus::Alive,
                MemberStatus::Left,
                MemberStatus::Failed,
            ]
        );

        server.abort();
        member.shutdown();
    }

    #[tokio::test]
    async fn test_cancel_connected_session_reports_left() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let observer = Arc::new(RecordingObserver::default());

        let member = RemoteMember::new(key_for(port), fast_config(), observer.clone()).start();
        let _server = listener.accept().await.unwrap();
        wait_for_state(&member, ConnectionState::Connected).await;

        member.cancel_connect();
        wait_for_state(&member, ConnectionState::Cancelled).await;
        assert!(!member.is_connected());
        assert_eq!(member.status(), MemberStatus::Left);
        assert_eq!(observer.updates(), vec![MemberStatus::Alive, MemberStatus::Left]);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(member.connect_attempts(), 1);

        // An explicit reconnect starts a fresh cycle.
        assert!(member.reconnect());
        let _again = listener.accept().await.unwrap();
        wait_for_state(&member, ConnectionState::Connected).await;
        assert_eq!(member.connect_attempts(), 1);
        assert_eq!(member.status(), MemberStatus::Alive);
        member.shutdown();
    }

    #[tokio::test]
    async fn test_reconnect_refused_while_cycle_runs() {
        let port = closed_port().await;
        let config = ConnectionConfig {
            retry_interval_ms: 60_000,
            ..fast_config()
        };
        let member = RemoteMember::new(
            key_for(port),
            config,
            Arc::new(RecordingObserver::default()),
        )
        .start();
        assert!(!member.reconnect());
        member.shutdown();
    }
}
