//! Per-connection state machine for plugin sockets.
//!
//! `Handshaking → Authenticated → Closing → Closed`, or `Handshaking →
//! Rejected`. The first frame must be `auth`; after that, game events go to
//! the inbound worker, heartbeats refresh liveness, and frames queued by the
//! outbound router are written to the socket. Everything for one socket
//! runs on its own task.

use crate::auth::{AuthError, TokenAuthenticator};
use crate::formatting;
use crate::helpers::now;
use crate::inbound::{InboundQueue, InboundRouter};
use crate::protocol::{Envelope, MalformedMessage, RawToken};
use crate::registry::{LinkRef, Session, SessionRegistry, SessionState};
use axum::extract::ws::{CloseFrame, Message, WebSocket, close_code};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use kavex_db::{Database, LinkStatus};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

type WsSink = SplitSink<WebSocket, Message>;
type WsStream = SplitStream<WebSocket>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Handshaking,
    Authenticated,
    Closing,
    Closed,
    Rejected,
}

#[derive(Debug, Clone)]
pub struct BridgeSettings {
    /// Liveness timeout; also bounds the wait for the `auth` frame.
    pub heartbeat_timeout: Duration,
    pub queue_capacity: usize,
}

impl From<&crate::config::Config> for BridgeSettings {
    fn from(config: &crate::config::Config) -> Self {
        Self {
            heartbeat_timeout: config.heartbeat_timeout,
            queue_capacity: config.session_queue_capacity,
        }
    }
}

/// Why an authenticated connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseCause {
    /// Socket closed or errored on the plugin's side.
    Peer,
    /// Evicted, superseded or timed out; the server already decided.
    Server,
    /// Protocol violation.
    Malformed,
}

pub struct Bridge {
    authenticator: TokenAuthenticator,
    registry: Arc<SessionRegistry>,
    inbound: Arc<InboundRouter>,
    db: Database,
    settings: BridgeSettings,
}

impl Bridge {
    pub fn new(
        authenticator: TokenAuthenticator,
        registry: Arc<SessionRegistry>,
        inbound: Arc<InboundRouter>,
        db: Database,
        settings: BridgeSettings,
    ) -> Self {
        Self {
            authenticator,
            registry,
            inbound,
            db,
            settings,
        }
    }

    /// Drive one plugin socket to completion. Returns the terminal state.
    pub async fn run(self: Arc<Self>, socket: WebSocket) -> ConnectionState {
        let (mut sink, mut stream) = socket.split();
        debug!(state = ?ConnectionState::Handshaking, "plugin socket accepted");

        let Some((token, server, channel_id)) = self.handshake(&mut sink, &mut stream).await else {
            return ConnectionState::Rejected;
        };

        let link = match self.authenticator.authenticate(&token, channel_id).await {
            Ok(link) => link,
            Err(AuthError::AuthenticationFailure) => {
                info!("plugin authentication failed");
                reject(&mut sink, "invalid token").await;
                return ConnectionState::Rejected;
            }
            Err(AuthError::Store(e)) => {
                error!(error = %e, "link store unavailable during authentication");
                reject(&mut sink, "service unavailable").await;
                return ConnectionState::Rejected;
            }
        };

        let link_ref = LinkRef::from_link(&link, server.as_deref());
        let (session, outbound) = match self.admit(link_ref.clone(), server).await {
            Ok(admitted) => admitted,
            Err(AuthError::AuthenticationFailure) => {
                info!(
                    channel_id = link_ref.channel_id,
                    short_hash = link_ref.short_hash(),
                    "link changed during authentication"
                );
                reject(&mut sink, "invalid token").await;
                return ConnectionState::Rejected;
            }
            Err(AuthError::Store(e)) => {
                error!(channel_id = link_ref.channel_id, error = %e, "failed to record authentication");
                reject(&mut sink, "service unavailable").await;
                return ConnectionState::Rejected;
            }
        };

        let ack = Envelope::AuthAck {
            ok: true,
            reason: None,
            heartbeat_secs: Some(self.settings.heartbeat_timeout.as_secs()),
        };
        if send_envelope(&mut sink, &ack).await.is_err() {
            self.finish(&session, CloseCause::Peer).await;
            return ConnectionState::Closed;
        }

        info!(
            guild_id = link_ref.guild_id,
            channel_id = link_ref.channel_id,
            session_id = session.id(),
            short_hash = link_ref.short_hash(),
            server = %link_ref.server_name,
            "plugin authenticated"
        );

        let queue = self.inbound.spawn_worker(
            link_ref.clone(),
            self.settings.queue_capacity,
            Some(formatting::connected_notice(&link_ref.server_name)),
        );

        let cause = self
            .serve(&session, &queue, outbound, &mut sink, &mut stream)
            .await;

        debug!(session_id = session.id(), state = ?ConnectionState::Closing, ?cause, "closing session");
        queue.cancel();
        let (code, reason) = match cause {
            CloseCause::Peer => (close_code::NORMAL, "bye"),
            CloseCause::Server => (close_code::NORMAL, "session closed by server"),
            CloseCause::Malformed => (close_code::POLICY, "malformed message"),
        };
        let _ = sink
            .send(Message::Close(Some(CloseFrame {
                code,
                reason: reason.into(),
            })))
            .await;

        self.finish(&session, cause).await;
        ConnectionState::Closed
    }

    /// Install a session for an authenticated link and mark the link
    /// connected under its id.
    ///
    /// The session is registered before the store write, so an unlink or
    /// rekey landing in between either evicts it or makes the write miss.
    /// A miss fails as `AuthenticationFailure` and leaves nothing routable.
    async fn admit(
        &self,
        link: LinkRef,
        server: Option<String>,
    ) -> Result<(Arc<Session>, mpsc::Receiver<String>), AuthError> {
        let (session, outbound) = Session::new(link.clone(), self.settings.queue_capacity);
        self.registry.register(session.clone()).await;

        let recorded = self
            .db
            .record_auth(link.channel_id, link.token_hash, session.id(), server, now())
            .await;
        match recorded {
            Ok(true) => Ok((session, outbound)),
            Ok(false) => {
                self.discard(&session).await;
                Err(AuthError::AuthenticationFailure)
            }
            Err(e) => {
                self.discard(&session).await;
                Err(AuthError::Store(e))
            }
        }
    }

    /// Drop a session that never went live.
    async fn discard(&self, session: &Session) {
        session.close();
        self.registry.unregister(session).await;
        session.mark_closed();
    }

    /// Wait for the `auth` frame. Rejects (and returns `None`) on timeout,
    /// wrong first frame, or malformed input.
    async fn handshake(
        &self,
        sink: &mut WsSink,
        stream: &mut WsStream,
    ) -> Option<(RawToken, Option<String>, Option<u64>)> {
        let frame = match tokio::time::timeout(self.settings.heartbeat_timeout, next_payload(stream))
            .await
        {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                debug!("plugin socket closed before authenticating");
                return None;
            }
            Err(_) => {
                info!("plugin did not authenticate in time");
                reject(sink, "authentication timed out").await;
                return None;
            }
        };

        match Envelope::parse(&frame) {
            Ok(Envelope::Auth {
                token,
                server,
                channel_id,
            }) => Some((token, server, channel_id)),
            Ok(other) => {
                info!(kind = %other.kind(), "first message was not auth");
                reject(sink, "first message must be auth").await;
                None
            }
            Err(e) => {
                warn!(error = %e, "malformed handshake message");
                let _ = send_envelope(sink, &malformed(&e)).await;
                reject(sink, "malformed auth message").await;
                None
            }
        }
    }

    /// The authenticated read/write loop.
    async fn serve(
        &self,
        session: &Session,
        queue: &InboundQueue,
        mut outbound: mpsc::Receiver<String>,
        sink: &mut WsSink,
        stream: &mut WsStream,
    ) -> CloseCause {
        let mut state = session.subscribe();

        loop {
            tokio::select! {
                frame = stream.next() => {
                    let payload = match frame {
                        Some(Ok(Message::Text(text))) => text.as_str().as_bytes().to_vec(),
                        Some(Ok(Message::Binary(bytes))) => bytes.to_vec(),
                        Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
                        Some(Ok(Message::Close(_))) | None => return CloseCause::Peer,
                        Some(Err(e)) => {
                            debug!(session_id = session.id(), error = %e, "socket error");
                            return CloseCause::Peer;
                        }
                    };

                    let envelope = match Envelope::parse(&payload) {
                        Ok(envelope) => envelope,
                        Err(e) => {
                            warn!(
                                channel_id = session.channel_id(),
                                session_id = session.id(),
                                error = %e,
                                "malformed message"
                            );
                            let _ = send_envelope(sink, &malformed(&e)).await;
                            return CloseCause::Malformed;
                        }
                    };

                    if self.dispatch(session, queue, sink, envelope).await.is_err() {
                        return CloseCause::Peer;
                    }
                }
                frame = outbound.recv() => {
                    let Some(frame) = frame else {
                        return CloseCause::Server;
                    };
                    if sink.send(Message::Text(frame.into())).await.is_err() {
                        return CloseCause::Peer;
                    }
                }
                _ = closing(&mut state) => return CloseCause::Server,
            }
        }
    }

    /// Handle one parsed envelope from an authenticated plugin. Errors only
    /// when the socket can't be written.
    async fn dispatch(
        &self,
        session: &Session,
        queue: &InboundQueue,
        sink: &mut WsSink,
        envelope: Envelope,
    ) -> Result<(), axum::Error> {
        match envelope.into_game_event() {
            Ok(event) => {
                if !queue.push(event) {
                    warn!(
                        channel_id = session.channel_id(),
                        session_id = session.id(),
                        "delivery queue full, dropping game event"
                    );
                }
                Ok(())
            }
            Err(Envelope::Heartbeat) => {
                self.registry.heartbeat(session);
                send_envelope(sink, &Envelope::Heartbeat).await
            }
            Err(Envelope::Auth { .. }) => {
                warn!(session_id = session.id(), "ignoring repeated auth");
                Ok(())
            }
            Err(Envelope::Error { code, message }) => {
                warn!(session_id = session.id(), %code, %message, "plugin reported an error");
                Ok(())
            }
            Err(other) => {
                debug!(session_id = session.id(), kind = %other.kind(), "ignoring client message");
                Ok(())
            }
        }
    }

    /// Release the registry slot. Only the session that still held it
    /// updates the link and announces the disconnect.
    async fn finish(&self, session: &Session, cause: CloseCause) {
        session.close();
        let was_current = self.registry.unregister(session).await;
        session.mark_closed();
        debug!(session_id = session.id(), state = ?ConnectionState::Closed, was_current, "session closed");

        if was_current {
            let status = match cause {
                CloseCause::Malformed => LinkStatus::Error,
                CloseCause::Peer | CloseCause::Server => LinkStatus::Disconnected,
            };
            self.link_down(session, status).await;
        }
    }

    /// Mark the session's link down and post the disconnect notice, unless
    /// a newer session has taken the link over in the meantime. The notice
    /// is posted from its own task.
    async fn link_down(&self, session: &Session, status: LinkStatus) {
        let link = session.link();
        match self
            .db
            .release_session(link.channel_id, session.id(), status, now())
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                debug!(
                    channel_id = link.channel_id,
                    session_id = session.id(),
                    "link taken over or removed, not announcing disconnect"
                );
                return;
            }
            Err(e) => {
                warn!(channel_id = link.channel_id, error = %e, "failed to update link status");
            }
        }

        if let Some(current) = self.registry.lookup(link.channel_id).await {
            if current.id() != session.id() {
                return;
            }
        }

        info!(channel_id = link.channel_id, session_id = session.id(), %status, "plugin disconnected");
        let inbound = self.inbound.clone();
        let link = link.clone();
        tokio::spawn(async move {
            let notice = formatting::disconnected_notice(&link.server_name);
            if let Err(e) = inbound.announce(&link, notice).await {
                debug!(channel_id = link.channel_id, error = %e, "dropped disconnect notice");
            }
        });
    }

    /// Close sessions whose heartbeat is older than the timeout.
    pub async fn sweep(&self, now: Instant) -> usize {
        let expired = self
            .registry
            .sweep(now, self.settings.heartbeat_timeout)
            .await;
        for session in &expired {
            self.link_down(session, LinkStatus::Disconnected).await;
        }
        expired.len()
    }

    /// Run `sweep` every `interval` until the task is dropped.
    pub async fn run_sweeper(self: Arc<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.sweep(Instant::now()).await;
        }
    }
}

/// Next text or binary payload, skipping control frames.
async fn next_payload(stream: &mut WsStream) -> Option<Vec<u8>> {
    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => return Some(text.as_str().as_bytes().to_vec()),
            Ok(Message::Binary(bytes)) => return Some(bytes.to_vec()),
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => continue,
            Ok(Message::Close(_)) | Err(_) => return None,
        }
    }
    None
}

async fn closing(state: &mut watch::Receiver<SessionState>) {
    // sender lives in the session, which outlives this loop
    let _ = state.wait_for(|s| *s >= SessionState::Closing).await;
}

async fn send_envelope(sink: &mut WsSink, envelope: &Envelope) -> Result<(), axum::Error> {
    let json = envelope.to_json().map_err(axum::Error::new)?;
    sink.send(Message::Text(json.into())).await
}

fn malformed(err: &MalformedMessage) -> Envelope {
    Envelope::error("malformed", err.to_string())
}

async fn reject(sink: &mut WsSink, reason: &str) {
    let ack = Envelope::AuthAck {
        ok: false,
        reason: Some(reason.to_string()),
        heartbeat_secs: None,
    };
    let _ = send_envelope(sink, &ack).await;
    let _ = sink
        .send(Message::Close(Some(CloseFrame {
            code: close_code::POLICY,
            reason: reason.to_string().into(),
        })))
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::{Delivery, DeliveryConfig, PostError, Presentation, WebhookApi};
    use crate::formatting::AvatarResolver;
    use crate::helpers::hash_token;
    use async_trait::async_trait;
    use kavex_db::{DeliveryEndpoint, LinkUpsert};
    use std::sync::Mutex;

    /// Records posts; with `hang` set, every post waits forever.
    #[derive(Default)]
    struct Recorder {
        posts: Mutex<Vec<Presentation>>,
        hang: bool,
    }

    #[async_trait]
    impl WebhookApi for Recorder {
        async fn create(&self, channel_id: u64, _name: &str) -> Result<DeliveryEndpoint, PostError> {
            Ok(DeliveryEndpoint::new(format!("https://discord.test/{channel_id}")))
        }

        async fn execute(
            &self,
            _endpoint: &DeliveryEndpoint,
            presentation: &Presentation,
        ) -> Result<(), PostError> {
            if self.hang {
                std::future::pending::<()>().await;
            }
            self.posts.lock().unwrap().push(presentation.clone());
            Ok(())
        }
    }

    struct Fixture {
        db: Database,
        registry: Arc<SessionRegistry>,
        bridge: Arc<Bridge>,
        recorder: Arc<Recorder>,
    }

    async fn fixture(recorder: Recorder) -> Fixture {
        let db = Database::open_in_memory().await.unwrap();
        let recorder = Arc::new(recorder);
        let registry = Arc::new(SessionRegistry::new());
        let delivery = Arc::new(Delivery::new(
            recorder.clone(),
            db.clone(),
            DeliveryConfig {
                webhook_name: "Test".to_string(),
                max_retries: 0,
                base_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(1),
                rate_limit_fallback: Duration::from_millis(1),
            },
        ));
        let inbound = Arc::new(InboundRouter::new(
            delivery,
            AvatarResolver::new("https://crafatar.com/avatars/{uuid}"),
        ));
        let bridge = Arc::new(Bridge::new(
            TokenAuthenticator::new(db.clone(), ""),
            registry.clone(),
            inbound,
            db.clone(),
            BridgeSettings {
                heartbeat_timeout: Duration::from_secs(60),
                queue_capacity: 8,
            },
        ));
        Fixture {
            db,
            registry,
            bridge,
            recorder,
        }
    }

    /// Link `channel_id` to `token` and return what the authenticator resolves.
    async fn authenticated(f: &Fixture, channel_id: u64, token: &str) -> LinkRef {
        f.db.upsert_link(1, channel_id, hash_token(token, ""), 100)
            .await
            .unwrap();
        let link = f
            .bridge
            .authenticator
            .authenticate(&RawToken::new(token), None)
            .await
            .unwrap();
        LinkRef::from_link(&link, Some("Survival"))
    }

    async fn status(f: &Fixture, channel_id: u64) -> Option<LinkStatus> {
        f.db.get_link_by_channel(channel_id)
            .await
            .unwrap()
            .map(|l| l.status)
    }

    fn disconnect_notices(f: &Fixture) -> usize {
        f.recorder
            .posts
            .lock()
            .unwrap()
            .iter()
            .filter(|p| p.content.contains("disconnected"))
            .count()
    }

    #[tokio::test]
    async fn test_admit_marks_link_connected() {
        let f = fixture(Recorder::default()).await;
        let link = authenticated(&f, 10, "abc").await;

        let (session, _rx) = f.bridge.admit(link, Some("Survival".to_string())).await.unwrap();

        assert_eq!(status(&f, 10).await, Some(LinkStatus::Connected));
        assert_eq!(f.registry.lookup(10).await.unwrap().id(), session.id());
    }

    #[tokio::test]
    async fn test_unlink_between_auth_and_admit_rejects() {
        // GIVEN: a token that has just authenticated
        let f = fixture(Recorder::default()).await;
        let link = authenticated(&f, 10, "abc").await;

        // WHEN: the channel is unlinked before the session is installed
        f.db.delete_link(1, 10).await.unwrap();
        let result = f.bridge.admit(link, None).await;

        // THEN: authentication fails and nothing is routable
        assert!(matches!(result, Err(AuthError::AuthenticationFailure)));
        assert!(f.registry.lookup(10).await.is_none());
        assert!(f.registry.is_empty());
    }

    #[tokio::test]
    async fn test_rekey_between_auth_and_admit_rejects() {
        // GIVEN: the old token has just authenticated
        let f = fixture(Recorder::default()).await;
        let link = authenticated(&f, 10, "abc").await;

        // WHEN: the channel is rekeyed before the session is installed
        let outcome = f
            .db
            .upsert_link(1, 10, hash_token("def", ""), 200)
            .await
            .unwrap();
        assert!(matches!(outcome, LinkUpsert::Rekeyed(_)));
        let result = f.bridge.admit(link, None).await;

        // THEN: the old token holds no session and the link stays down
        assert!(matches!(result, Err(AuthError::AuthenticationFailure)));
        assert!(f.registry.lookup(10).await.is_none());
        assert_eq!(status(&f, 10).await, Some(LinkStatus::Disconnected));
    }

    #[tokio::test]
    async fn test_late_disconnect_does_not_clobber_reconnect() {
        // GIVEN: session A has released its slot but not yet updated the link
        let f = fixture(Recorder::default()).await;
        let link = authenticated(&f, 10, "abc").await;
        let (a, _a_rx) = f.bridge.admit(link.clone(), None).await.unwrap();
        a.close();
        assert!(f.registry.unregister(&a).await);

        // WHEN: session B reconnects, then A's disconnect lands
        let (b, _b_rx) = f.bridge.admit(link, None).await.unwrap();
        f.bridge.link_down(&a, LinkStatus::Disconnected).await;

        // THEN: the link stays connected for B and no disconnect is announced
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(status(&f, 10).await, Some(LinkStatus::Connected));
        assert_eq!(f.registry.lookup(10).await.unwrap().id(), b.id());
        assert_eq!(disconnect_notices(&f), 0);
    }

    #[tokio::test]
    async fn test_finish_announces_disconnect() {
        let f = fixture(Recorder::default()).await;
        let link = authenticated(&f, 10, "abc").await;
        let (session, _rx) = f.bridge.admit(link, None).await.unwrap();

        f.bridge.finish(&session, CloseCause::Malformed).await;

        assert_eq!(status(&f, 10).await, Some(LinkStatus::Error));
        for _ in 0..100 {
            if disconnect_notices(&f) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(disconnect_notices(&f), 1);
    }

    #[tokio::test]
    async fn test_sweep_does_not_wait_for_notices() {
        // GIVEN: two live sessions and a Discord that never answers
        let f = fixture(Recorder {
            hang: true,
            ..Default::default()
        })
        .await;
        let first = authenticated(&f, 10, "abc").await;
        let second = authenticated(&f, 11, "def").await;
        let (_a, _a_rx) = f.bridge.admit(first, None).await.unwrap();
        let (_b, _b_rx) = f.bridge.admit(second, None).await.unwrap();

        // WHEN: both have gone silent past the timeout
        let later = Instant::now() + Duration::from_secs(3600);
        let swept = tokio::time::timeout(Duration::from_secs(2), f.bridge.sweep(later)).await;

        // THEN: the sweep finishes anyway and both links are down
        assert_eq!(swept.expect("sweep blocked on delivery"), 2);
        assert_eq!(status(&f, 10).await, Some(LinkStatus::Disconnected));
        assert_eq!(status(&f, 11).await, Some(LinkStatus::Disconnected));
        assert!(f.registry.is_empty());
    }
}
